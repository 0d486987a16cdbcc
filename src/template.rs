//! Attribute Templates
//!
//! Resolves `${A.<dotted.path>}` placeholders against the attribute bag.
//!
//! Paths are walked segment by segment: objects are indexed by key, arrays by
//! a non-negative integer, and a string holding a JSON document is parsed on
//! the fly so the same segment can continue into it. Unresolvable paths
//! render as the empty string.

use std::borrow::Cow;

use serde_json::Value;

use crate::attrs::{display_value, Attrs};

const PLACEHOLDER_OPEN: &str = "${A.";

/// Replaces every `${A.path}` placeholder in `text`.
///
/// Substituted values are not scanned again. An unterminated placeholder
/// stops substitution and the remainder is kept verbatim.
pub fn substitute(text: &str, attrs: &Attrs) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let end = start + len;

        out.push_str(&rest[..start]);
        let path = &rest[start + PLACEHOLDER_OPEN.len()..end];
        if let Some(value) = resolve_attr(attrs, path) {
            out.push_str(&display_value(&value));
        }
        rest = &rest[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Renders every string inside an argument tree.
///
/// Non-string scalars are copied unchanged.
pub fn render_args(args: &Value, attrs: &Attrs) -> Value {
    match args {
        Value::String(s) => Value::String(substitute(s, attrs)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_args(v, attrs)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_args(v, attrs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolves a dotted path against the attribute bag.
///
/// Returns `None` when the path cannot be followed or ends on `null`.
pub fn resolve_attr(attrs: &Attrs, path: &str) -> Option<Value> {
    let mut parts = path.split('.').filter(|p| !p.is_empty());
    let Some(first) = parts.next() else {
        return Some(Value::Object(attrs.clone()));
    };

    let start = attrs.get(first)?;
    walk(Cow::Borrowed(start), parts)
}

/// Resolves a dotted path against an arbitrary JSON value.
pub fn resolve_path(root: &Value, path: &str) -> Option<Value> {
    walk(Cow::Borrowed(root), path.split('.').filter(|p| !p.is_empty()))
}

/// Parses `payload` as JSON and resolves `path` inside it.
pub fn select_from_json(payload: &[u8], path: &str) -> Option<Value> {
    if payload.is_empty() || path.is_empty() {
        return None;
    }
    let data: Value = serde_json::from_slice(payload).ok()?;
    resolve_path(&data, path)
}

fn walk<'a, 'p>(mut cur: Cow<'a, Value>, parts: impl Iterator<Item = &'p str>) -> Option<Value> {
    for part in parts {
        cur = match cur {
            Cow::Borrowed(Value::String(s)) => Cow::Owned(descend_owned(parse_embedded(s)?, part)?),
            Cow::Borrowed(value) => Cow::Borrowed(descend(value, part)?),
            Cow::Owned(Value::String(s)) => Cow::Owned(descend_owned(parse_embedded(&s)?, part)?),
            Cow::Owned(value) => Cow::Owned(descend_owned(value, part)?),
        };
    }

    match cur.into_owned() {
        Value::Null => None,
        value => Some(value),
    }
}

/// Parses a string holding a JSON object or array.
fn parse_embedded(s: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(s).ok()? {
        value @ (Value::Object(_) | Value::Array(_)) => Some(value),
        _ => None,
    }
}

fn parse_index(part: &str) -> Option<usize> {
    part.parse::<usize>().ok()
}

fn descend<'a>(value: &'a Value, part: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(part),
        Value::Array(items) => items.get(parse_index(part)?),
        _ => None,
    }
}

fn descend_owned(value: Value, part: &str) -> Option<Value> {
    match value {
        Value::Object(mut map) => map.remove(part),
        Value::Array(mut items) => {
            let idx = parse_index(part)?;
            (idx < items.len()).then(|| items.swap_remove(idx))
        }
        _ => None,
    }
}

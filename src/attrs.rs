//! Attribute Bag
//!
//! The shared key/value state threaded through a run, plus tolerant
//! coercion helpers for the conventional list-valued keys.

use std::collections::HashSet;

use serde_json::{Map, Value};

/// Shared attributes ("blackboard") of a workflow run.
pub type Attrs = Map<String, Value>;

/// Renders a value the way guards and templates see it.
///
/// Strings are returned verbatim, `null` becomes the empty string and every
/// other value is rendered as compact JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerces a value into a list of strings.
///
/// Accepts arrays (non-string and empty items are dropped) and strings, which
/// are split on commas when present and on whitespace otherwise. Anything
/// else yields an empty list.
pub fn to_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => {
            let s = s.trim();
            if s.contains(',') {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            } else {
                s.split_whitespace().map(str::to_string).collect()
            }
        }
        _ => Vec::new(),
    }
}

/// Coerces a value into a list of source records (objects of strings).
pub fn to_source_list(value: &Value) -> Vec<Value> {
    let Value::Array(items) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .map(|record| {
            let fields: Map<String, Value> = record
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(display_value(v))))
                .collect();
            Value::Object(fields)
        })
        .collect()
}

/// Unions two string lists, keeping first-seen order and dropping duplicates.
pub fn union_strings(a: &[String], b: &[String]) -> Vec<String> {
    let mut seen: HashSet<&String> = HashSet::with_capacity(a.len() + b.len());
    a.iter()
        .chain(b.iter())
        .filter(|s| seen.insert(*s))
        .cloned()
        .collect()
}

/// Converts a list of strings into a JSON array value.
pub fn string_list_value(items: Vec<String>) -> Value {
    Value::Array(items.into_iter().map(Value::String).collect())
}

/// Normalizes the shapes of the conventional additive keys before a run.
///
/// `sources` always exists afterwards; `urls` and `payloads` are coerced to
/// string lists when present.
pub fn normalize(attrs: &mut Attrs) {
    let sources = attrs.get("sources").map(to_source_list).unwrap_or_default();
    attrs.insert("sources".to_string(), Value::Array(sources));

    for key in ["urls", "payloads"] {
        if let Some(value) = attrs.get(key) {
            let list = to_string_list(value);
            attrs.insert(key.to_string(), string_list_value(list));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!("hi")), "hi");
        assert_eq!(display_value(&json!(null)), "");
        assert_eq!(display_value(&json!(3)), "3");
        assert_eq!(display_value(&json!(true)), "true");
        assert_eq!(display_value(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_to_string_list_variants() {
        assert_eq!(to_string_list(&json!(["a", "", 1, "b"])), vec!["a", "b"]);
        assert_eq!(to_string_list(&json!("a, b ,,c")), vec!["a", "b", "c"]);
        assert_eq!(to_string_list(&json!("  x y  ")), vec!["x", "y"]);
        assert!(to_string_list(&json!({"a": 1})).is_empty());
        assert!(to_string_list(&json!("   ")).is_empty());
    }

    #[test]
    fn test_to_source_list_stringifies_fields() {
        let sources = to_source_list(&json!([{"title": "T", "rank": 2}, "skip"]));
        assert_eq!(sources, vec![json!({"title": "T", "rank": "2"})]);
    }

    #[test]
    fn test_union_strings_preserves_order() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "z".to_string(), "x".to_string()];
        assert_eq!(union_strings(&a, &b), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_normalize_attrs() {
        let mut attrs = Attrs::new();
        attrs.insert("urls".to_string(), json!("http://a,http://b"));
        normalize(&mut attrs);

        assert_eq!(attrs["sources"], json!([]));
        assert_eq!(attrs["urls"], json!(["http://a", "http://b"]));
        assert!(!attrs.contains_key("payloads"));
    }
}

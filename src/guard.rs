//! Guard Expressions
//!
//! Minimal boolean expressions gating whether a step runs.
//!
//! Supported forms:
//! - `""` or `"true"`: always true
//! - `not <expr>`: negation
//! - `A.key`: presence and truthiness of an attribute
//! - `A.key == 'value'` / `A.key != 'value'`: string comparison
//!
//! Anything else evaluates to `true`.

use std::panic::{self, AssertUnwindSafe};

use log::warn;
use serde_json::Value;

use crate::attrs::{display_value, Attrs};
use crate::template::resolve_attr;

/// Evaluates a guard expression against the attributes.
///
/// Never panics: a fault during evaluation yields `false`.
pub fn eval_guard(guard: &str, attrs: &Attrs) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| evaluate(guard, attrs))).unwrap_or_else(|_| {
        warn!("Guard evaluation panicked, treating as false: {}", guard);
        false
    })
}

fn evaluate(guard: &str, attrs: &Attrs) -> bool {
    let g = guard.trim();
    if g.is_empty() || g == "true" {
        return true;
    }

    if let Some(inner) = g.strip_prefix("not ") {
        return !evaluate(inner, attrs);
    }

    let op = if g.contains("!=") {
        Some("!=")
    } else if g.contains("==") {
        Some("==")
    } else {
        None
    };

    match op {
        None => match g.strip_prefix("A.") {
            Some(key) => lookup(attrs, key).map_or(false, |v| truthy(&v)),
            None => true,
        },
        Some(op) => {
            let Some((left, right)) = g.split_once(op) else {
                return true;
            };
            let Some(key) = left.trim().strip_prefix("A.") else {
                return true;
            };

            let actual = lookup(attrs, key).map(|v| display_value(&v)).unwrap_or_default();
            let expected = right.trim().trim_matches(|c| c == '\'' || c == '"');

            if op == "==" {
                actual == expected
            } else {
                actual != expected
            }
        }
    }
}

/// Flat key first, then a dotted path for nested attributes.
fn lookup(attrs: &Attrs, key: &str) -> Option<Value> {
    match attrs.get(key) {
        Some(value) => Some(value.clone()),
        None if key.contains('.') => resolve_attr(attrs, key),
        None => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attrs {
        match value {
            Value::Object(map) => map,
            _ => panic!("attrs must be an object"),
        }
    }

    #[test]
    fn test_empty_and_true() {
        let a = Attrs::new();
        assert!(eval_guard("", &a));
        assert!(eval_guard("   ", &a));
        assert!(eval_guard("true", &a));
    }

    #[test]
    fn test_presence() {
        let a = attrs(json!({
            "url": "http://a",
            "empty": "",
            "yes": true,
            "no": false,
            "nothing": null,
            "n": 0,
        }));

        assert!(eval_guard("A.url", &a));
        assert!(!eval_guard("A.empty", &a));
        assert!(eval_guard("A.yes", &a));
        assert!(!eval_guard("A.no", &a));
        assert!(!eval_guard("A.nothing", &a));
        assert!(eval_guard("A.n", &a));
        assert!(!eval_guard("A.missing", &a));
    }

    #[test]
    fn test_negation_matches_inverse() {
        let a = attrs(json!({"url": "http://a", "os": "linux"}));
        for expr in ["A.url", "A.missing", "A.os == 'linux'", "A.os != 'linux'", "true"] {
            assert_eq!(
                eval_guard(&format!("not {}", expr), &a),
                !eval_guard(expr, &a),
                "negation mismatch for {}",
                expr
            );
        }
    }

    #[test]
    fn test_equality() {
        let a = attrs(json!({"os": "windows", "count": 3}));
        assert!(eval_guard("A.os == 'windows'", &a));
        assert!(eval_guard("A.os == \"windows\"", &a));
        assert!(!eval_guard("A.os != 'windows'", &a));
        assert!(eval_guard("A.count == '3'", &a));
        assert!(eval_guard("A.missing == ''", &a));
        assert!(eval_guard("A.missing != 'x'", &a));
    }

    #[test]
    fn test_dotted_lookup() {
        let a = attrs(json!({"s1": {"first_url": "http://a"}}));
        assert!(eval_guard("A.s1.first_url", &a));
        assert!(eval_guard("A.s1.first_url == 'http://a'", &a));
        assert!(!eval_guard("A.s1.second_url", &a));
    }

    #[test]
    fn test_unrecognized_syntax_allows() {
        let a = Attrs::new();
        assert!(eval_guard("len(A.urls) > 2", &a));
        assert!(eval_guard("B.key == 'x'", &a));
        assert!(eval_guard("whatever", &a));
    }
}

//! Run Attribute State
//!
//! The blackboard owns a run's attributes. Only the control loop mutates it;
//! workers receive immutable snapshots built from the contributions of their
//! completed ancestors.
//!
//! Every contribution is kept in an arena together with its precedence
//! `(rank, declaration index)`, so a snapshot can be rebuilt in precedence
//! order no matter when the contributing steps actually finished.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::attrs::{normalize, string_list_value, to_source_list, to_string_list, union_strings, Attrs};

/// Merge precedence of a writer: (rank, declaration index).
pub type Precedence = (usize, usize);

/// Merges `delta` into `target`.
///
/// `payloads` and `sources` concatenate and `urls` unions in first-seen order.
/// Every other key is last-writer-wins by precedence: a write is discarded
/// when the key's current owner in `provenance` ranks higher.
pub fn merge_delta(
    target: &mut Attrs,
    delta: &Attrs,
    precedence: Precedence,
    provenance: &mut HashMap<String, Precedence>,
) {
    for (key, value) in delta {
        match key.as_str() {
            "payloads" => {
                let mut list = target.get(key).map(to_string_list).unwrap_or_default();
                list.extend(to_string_list(value));
                target.insert(key.clone(), string_list_value(list));
            }
            "sources" => {
                let mut list = target.get(key).map(to_source_list).unwrap_or_default();
                list.extend(to_source_list(value));
                target.insert(key.clone(), Value::Array(list));
            }
            "urls" => {
                let current = target.get(key).map(to_string_list).unwrap_or_default();
                let merged = union_strings(&current, &to_string_list(value));
                target.insert(key.clone(), string_list_value(merged));
            }
            _ => {
                if let Some(&owner) = provenance.get(key) {
                    if owner > precedence {
                        continue;
                    }
                }
                provenance.insert(key.clone(), precedence);
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Stores a step's result under `target[step_id]`.
///
/// The record holds the delta's keys, plus `delta`, `args` (when rendered),
/// `payload` (when non-empty) and `json` (when the payload parses).
pub fn record_step_result(
    target: &mut Attrs,
    step_id: &str,
    payload: &[u8],
    delta: &Attrs,
    args: Option<&Value>,
) {
    if step_id.is_empty() {
        return;
    }

    let mut record: Map<String, Value> = delta.clone();
    record.insert("delta".to_string(), Value::Object(delta.clone()));
    if let Some(args) = args {
        record.insert("args".to_string(), args.clone());
    }
    if !payload.is_empty() {
        record.insert(
            "payload".to_string(),
            Value::String(String::from_utf8_lossy(payload).into_owned()),
        );
        if let Ok(parsed) = serde_json::from_slice::<Value>(payload) {
            record.insert("json".to_string(), parsed);
        }
    }

    target.insert(step_id.to_string(), Value::Object(record));
}

#[derive(Debug)]
struct Contribution {
    precedence: Precedence,
    step_id: String,
    delta: Attrs,
    record: Value,
}

/// Attribute state of one run.
#[derive(Debug)]
pub struct Blackboard {
    base: Attrs,
    live: Attrs,
    provenance: HashMap<String, Precedence>,
    contributions: Vec<Contribution>,
}

impl Blackboard {
    /// Creates the blackboard from the caller's attributes, normalizing the
    /// conventional list-valued keys.
    pub fn new(mut attrs: Attrs) -> Self {
        normalize(&mut attrs);
        Self {
            base: attrs.clone(),
            live: attrs,
            provenance: HashMap::new(),
            contributions: Vec::new(),
        }
    }

    /// Current merged attributes.
    pub fn attrs(&self) -> &Attrs {
        &self.live
    }

    /// Merges a step's delta and records its result under the step id.
    pub fn apply(
        &mut self,
        step_id: &str,
        precedence: Precedence,
        delta: Attrs,
        payload: &[u8],
        args: Option<&Value>,
    ) {
        merge_delta(&mut self.live, &delta, precedence, &mut self.provenance);
        record_step_result(&mut self.live, step_id, payload, &delta, args);

        let record = self.live.get(step_id).cloned().unwrap_or(Value::Null);
        self.contributions.push(Contribution {
            precedence,
            step_id: step_id.to_string(),
            delta,
            record,
        });
    }

    /// Builds the attributes visible to a step whose ancestors are `ancestors`.
    ///
    /// The result is the initial attributes plus the contributions of those
    /// ancestors, merged in precedence order.
    pub fn snapshot(&self, ancestors: &HashSet<String>) -> Attrs {
        let mut visible: Vec<&Contribution> = self
            .contributions
            .iter()
            .filter(|c| ancestors.contains(&c.step_id))
            .collect();
        visible.sort_by_key(|c| c.precedence);

        let mut attrs = self.base.clone();
        let mut provenance = HashMap::new();
        for c in visible {
            merge_delta(&mut attrs, &c.delta, c.precedence, &mut provenance);
            attrs.insert(c.step_id.clone(), c.record.clone());
        }
        attrs
    }

    pub fn into_attrs(self) -> Attrs {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(value: Value) -> Attrs {
        match value {
            Value::Object(map) => map,
            _ => panic!("delta must be an object"),
        }
    }

    #[test]
    fn test_additive_keys() {
        let mut attrs = delta(json!({"payloads": ["p0"], "urls": ["http://a"]}));
        let mut prov = HashMap::new();

        merge_delta(
            &mut attrs,
            &delta(json!({"payloads": ["p1"], "urls": ["http://b", "http://a"], "sources": [{"title": "T"}]})),
            (0, 0),
            &mut prov,
        );

        assert_eq!(attrs["payloads"], json!(["p0", "p1"]));
        assert_eq!(attrs["urls"], json!(["http://a", "http://b"]));
        assert_eq!(attrs["sources"], json!([{"title": "T"}]));
        assert!(prov.is_empty());
    }

    #[test]
    fn test_lower_precedence_is_discarded() {
        let mut attrs = Attrs::new();
        let mut prov = HashMap::new();

        // the higher-ranked writer finishes first in wall-clock time
        merge_delta(&mut attrs, &delta(json!({"k": "late"})), (1, 2), &mut prov);
        merge_delta(&mut attrs, &delta(json!({"k": "early", "other": 1})), (1, 1), &mut prov);

        assert_eq!(attrs["k"], json!("late"));
        assert_eq!(attrs["other"], json!(1));
        assert_eq!(prov["k"], (1, 2));

        merge_delta(&mut attrs, &delta(json!({"k": "deeper"})), (2, 0), &mut prov);
        assert_eq!(attrs["k"], json!("deeper"));
    }

    #[test]
    fn test_record_step_result_layout() {
        let mut attrs = Attrs::new();
        let d = delta(json!({"first_url": "http://a"}));
        let payload = br#"{"results":[{"url":"http://a"}]}"#;

        record_step_result(&mut attrs, "s1", payload, &d, Some(&json!({"query": "q"})));

        let record = &attrs["s1"];
        assert_eq!(record["first_url"], json!("http://a"));
        assert_eq!(record["delta"]["first_url"], json!("http://a"));
        assert_eq!(record["args"]["query"], json!("q"));
        assert_eq!(record["payload"], json!(String::from_utf8_lossy(payload)));
        assert_eq!(record["json"]["results"][0]["url"], json!("http://a"));
    }

    #[test]
    fn test_record_non_json_payload() {
        let mut attrs = Attrs::new();
        record_step_result(&mut attrs, "s1", b"plain", &Attrs::new(), None);

        let record = attrs["s1"].as_object().unwrap();
        assert_eq!(record["payload"], json!("plain"));
        assert!(!record.contains_key("json"));
        assert!(!record.contains_key("args"));

        record_step_result(&mut attrs, "", b"x", &Attrs::new(), None);
        assert!(!attrs.contains_key(""));
    }

    #[test]
    fn test_snapshot_is_ancestor_closure() {
        let mut base = Attrs::new();
        base.insert("utter".to_string(), json!("hi"));
        let mut board = Blackboard::new(base);
        assert_eq!(board.attrs()["sources"], json!([]));

        board.apply("b", (1, 2), delta(json!({"k": "b", "urls": ["http://b"]})), b"{}", None);
        board.apply("a", (1, 1), delta(json!({"k": "a", "urls": ["http://a"]})), b"{}", None);
        board.apply("c", (1, 3), delta(json!({"only_c": true})), b"{}", None);

        let ancestors: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let snap = board.snapshot(&ancestors);

        assert_eq!(snap["utter"], json!("hi"));
        assert_eq!(snap["k"], json!("b"));
        // rebuilt in precedence order, not completion order
        assert_eq!(snap["urls"], json!(["http://a", "http://b"]));
        assert!(snap.contains_key("a"));
        assert!(!snap.contains_key("only_c"));
        assert!(!snap.contains_key("c"));

        let empty = board.snapshot(&HashSet::new());
        assert!(!empty.contains_key("k"));

        let live = board.into_attrs();
        assert_eq!(live["k"], json!("b"));
        assert_eq!(live["only_c"], json!(true));
    }
}

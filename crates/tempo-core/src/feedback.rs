//! Output-to-input feedback mapping.
//!
//! Paths are dotted (`grid.cells`); a single segment addresses a top-level
//! field, and numeric segments index into arrays. Writes work on a copy, so
//! the input passed in is never modified.

use serde_json::Value;

use crate::types::{ExecutionConfig, FeedbackMapping, Record};

/// Apply `mappings` in declaration order, producing the next input.
///
/// A mapping whose source output is absent is skipped. Fields not targeted by
/// any mapping are carried over unchanged.
pub fn apply(mappings: &[FeedbackMapping], outputs: &Record, current_input: &Record) -> Record {
    let mut next = current_input.clone();

    for mapping in mappings {
        if let Some(value) = get_path(outputs, &mapping.from_output) {
            set_path(&mut next, &mapping.to_input, value.clone());
        }
    }

    next
}

/// Like [`apply`], but identity for `Single` execution.
pub fn apply_config(config: &ExecutionConfig, outputs: &Record, current_input: &Record) -> Record {
    apply(config.feedback_mappings(), outputs, current_input)
}

fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(record: &mut Record, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            record.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = record.entry(head.to_string()).or_insert(Value::Null);
            set_in(child, rest, value);
        }
    }
}

/// Write below `target`. Numeric segments index into arrays; an index equal to
/// the length appends, and one further out leaves the array untouched. Any
/// other non-container along the path is replaced by an object.
fn set_in(target: &mut Value, path: &str, value: Value) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let index = head.parse::<usize>().ok();

    let addressable = match target {
        Value::Object(_) => true,
        Value::Array(_) => index.is_some(),
        _ => false,
    };
    if !addressable {
        *target = Value::Object(Record::new());
    }

    let slot = match target {
        Value::Array(items) => match index {
            Some(i) if i < items.len() => &mut items[i],
            Some(i) if i == items.len() => {
                items.push(Value::Null);
                &mut items[i]
            }
            _ => return,
        },
        Value::Object(map) => map.entry(head.to_string()).or_insert(Value::Null),
        _ => return,
    };

    match rest {
        Some(rest) => set_in(slot, rest, value),
        None => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    #[test]
    fn test_maps_single_output_to_input() {
        let mappings = vec![FeedbackMapping::new("next_count", "count")];
        let outputs = record(json!({ "next_count": 1 }));
        let input = record(json!({ "count": 0, "label": "x" }));

        let next = apply(&mappings, &outputs, &input);

        assert_eq!(next, record(json!({ "count": 1, "label": "x" })));
        assert_eq!(input["count"], json!(0));
    }

    #[test]
    fn test_missing_output_is_skipped() {
        let mappings = vec![
            FeedbackMapping::new("absent", "count"),
            FeedbackMapping::new("present", "other"),
        ];
        let outputs = record(json!({ "present": null }));
        let input = record(json!({ "count": 5 }));

        let next = apply(&mappings, &outputs, &input);

        assert_eq!(next["count"], json!(5));
        assert_eq!(next["other"], Value::Null);
    }

    #[test]
    fn test_mappings_apply_in_order() {
        let mappings = vec![
            FeedbackMapping::new("a", "target"),
            FeedbackMapping::new("b", "target"),
        ];
        let outputs = record(json!({ "a": 1, "b": 2 }));

        let next = apply(&mappings, &outputs, &Record::new());

        assert_eq!(next["target"], json!(2));
    }

    #[test]
    fn test_untargeted_fields_unchanged() {
        let mappings = vec![
            FeedbackMapping::new("x", "alpha"),
            FeedbackMapping::new("y", "nested.inner"),
        ];
        let outputs = record(json!({ "x": [1, 2], "y": true, "z": "ignored" }));
        let inputs = [
            record(json!({})),
            record(json!({ "beta": 1, "gamma": [[0, 1]], "alpha": "old" })),
            record(json!({ "nested": { "keep": 3 }, "delta": { "a": null } })),
        ];

        for input in &inputs {
            let next = apply(&mappings, &outputs, input);
            for (key, value) in input {
                if key == "alpha" || key == "nested" {
                    continue;
                }
                assert_eq!(next.get(key), Some(value), "field {} changed", key);
            }
        }
    }

    #[test]
    fn test_nested_paths() {
        let mappings = vec![FeedbackMapping::new("state.cells", "grid.rows")];
        let outputs = record(json!({ "state": { "cells": [[1, 0]] } }));
        let input = record(json!({ "grid": { "rows": [[0, 0]], "width": 2 } }));

        let next = apply(&mappings, &outputs, &input);

        assert_eq!(next["grid"], json!({ "rows": [[1, 0]], "width": 2 }));
        assert_eq!(input["grid"]["rows"], json!([[0, 0]]));
    }

    #[test]
    fn test_indexed_write_keeps_siblings() {
        let mappings = vec![FeedbackMapping::new("cell", "rows.0")];
        let outputs = record(json!({ "cell": [9, 9] }));
        let input = record(json!({ "rows": [[0, 1], [1, 0]] }));

        let next = apply(&mappings, &outputs, &input);

        assert_eq!(next["rows"], json!([[9, 9], [1, 0]]));
        assert_eq!(input["rows"], json!([[0, 1], [1, 0]]));
    }

    #[test]
    fn test_indexed_write_into_nested_element() {
        let mappings = vec![
            FeedbackMapping::new("v", "grid.rows.1.0"),
            FeedbackMapping::new("v", "grid.rows.2"),
            FeedbackMapping::new("v", "grid.rows.9"),
        ];
        let outputs = record(json!({ "v": 7 }));
        let input = record(json!({ "grid": { "rows": [[0, 1], [1, 0]] } }));

        let next = apply(&mappings, &outputs, &input);

        assert_eq!(next["grid"]["rows"], json!([[0, 1], [7, 0], 7]));
    }

    #[test]
    fn test_single_config_is_identity() {
        let outputs = record(json!({ "count": 9 }));
        let input = record(json!({ "count": 1 }));

        assert_eq!(apply_config(&ExecutionConfig::Single, &outputs, &input), input);
        assert_eq!(apply(&[], &outputs, &input), input);
    }
}

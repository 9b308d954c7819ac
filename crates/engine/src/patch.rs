use serde_json::Value;

/// Recursive, immutable merge of a partial value into an original.
///
/// For objects, keys are merged recursively: a key set to `null` in the
/// partial is deleted from the result, nested objects merge, and every other
/// value (strings, numbers, booleans, arrays) replaces the original
/// wholesale. A non-object partial replaces the original entirely.
///
/// This distinction keeps state folding predictable across arbitrary event
/// payload shapes.
pub fn patch(original: &Value, partial: &Value) -> Value {
    match (original, partial) {
        (Value::Object(base), Value::Object(update)) => {
            let mut merged = base.clone();
            for (key, value) in update {
                match value {
                    Value::Null => {
                        merged.remove(key);
                    }
                    Value::Object(_) => {
                        let existing = merged
                            .get(key)
                            .cloned()
                            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                        merged.insert(key.clone(), patch(&existing, value));
                    }
                    other => {
                        merged.insert(key.clone(), other.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => partial.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_partial_is_identity() {
        let original = json!({"a": 1, "b": {"c": [1, 2]}});
        assert_eq!(patch(&original, &json!({})), original);
    }

    #[test]
    fn patching_twice_equals_patching_once() {
        let original = json!({"a": 1, "b": {"c": 2}});
        let partial = json!({"b": {"c": 3}, "d": true});

        let once = patch(&original, &partial);
        let twice = patch(&once, &partial);
        assert_eq!(once, twice);
    }

    #[test]
    fn null_deletes_keys() {
        let original = json!({"a": 1, "b": 2});
        let result = patch(&original, &json!({"b": null}));
        assert_eq!(result, json!({"a": 1}));
    }

    #[test]
    fn nested_objects_merge() {
        let original = json!({"outer": {"keep": 1, "change": 2}});
        let result = patch(&original, &json!({"outer": {"change": 3, "add": 4}}));
        assert_eq!(result, json!({"outer": {"keep": 1, "change": 3, "add": 4}}));
    }

    #[test]
    fn arrays_replace_wholesale() {
        let original = json!({"items": [1, 2, 3]});
        let result = patch(&original, &json!({"items": [9]}));
        assert_eq!(result, json!({"items": [9]}));
    }

    #[test]
    fn scalars_replace_objects_and_vice_versa() {
        let original = json!({"value": {"nested": 1}});
        let result = patch(&original, &json!({"value": 5}));
        assert_eq!(result, json!({"value": 5}));

        let back = patch(&result, &json!({"value": {"nested": 2}}));
        assert_eq!(back, json!({"value": {"nested": 2}}));
    }

    #[test]
    fn non_object_partial_replaces_everything() {
        let original = json!({"a": 1});
        assert_eq!(patch(&original, &json!(42)), json!(42));
    }

    #[test]
    fn original_is_not_mutated() {
        let original = json!({"a": {"b": 1}});
        let _ = patch(&original, &json!({"a": {"b": 2}}));
        assert_eq!(original, json!({"a": {"b": 1}}));
    }
}

use serde_json::{Map, Value};
use std::collections::HashSet;

/// Merge `source` into `target` without overwriting anything.
///
/// Keys listed in `skip` are left out. Every other key that already exists
/// in `target`, or is listed in `reserved`, gets `_` appended until it is
/// free, so colliding values are renamed rather than dropped.
pub fn safe_merge<'a, I>(
    target: &'a mut Map<String, Value>,
    source: I,
    reserved: &HashSet<&str>,
    skip: &HashSet<&str>,
) -> &'a mut Map<String, Value>
where
    I: IntoIterator<Item = (String, Value)>,
{
    for (key, value) in source {
        if skip.contains(key.as_str()) {
            continue;
        }
        let key = free_key(target, key, reserved);
        target.insert(key, value);
    }
    target
}

/// Insert a single field with the same collision rules as [`safe_merge`].
/// Returns the key the value ended up under.
pub fn safe_insert(
    target: &mut Map<String, Value>,
    key: impl Into<String>,
    value: Value,
    reserved: &HashSet<&str>,
) -> String {
    let key = free_key(target, key.into(), reserved);
    target.insert(key.clone(), value);
    key
}

fn free_key(target: &Map<String, Value>, mut key: String, reserved: &HashSet<&str>) -> String {
    while target.contains_key(&key) || reserved.contains(key.as_str()) {
        key.push('_');
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn collision_is_renamed() {
        let mut target = map(json!({"x": 1}));
        safe_merge(&mut target, map(json!({"x": 2})), &HashSet::new(), &HashSet::new());
        assert_eq!(Value::Object(target), json!({"x": 1, "x_": 2}));
    }

    #[test]
    fn repeated_collisions_keep_appending() {
        let mut target = map(json!({"x": 1, "x_": 2}));
        let reserved: HashSet<&str> = ["x__"].into_iter().collect();
        safe_merge(&mut target, map(json!({"x": 3})), &reserved, &HashSet::new());
        assert_eq!(target.get("x___"), Some(&json!(3)));
        assert!(!target.contains_key("x__"));
    }

    #[test]
    fn reserved_names_are_never_written() {
        let mut target = Map::new();
        let reserved: HashSet<&str> = ["message", "name"].into_iter().collect();
        safe_merge(
            &mut target,
            map(json!({"message": "a", "name": "b", "other": "c"})),
            &reserved,
            &HashSet::new(),
        );
        assert_eq!(Value::Object(target), json!({"message_": "a", "name_": "b", "other": "c"}));
    }

    #[test]
    fn skipped_keys_are_omitted() {
        let mut target = Map::new();
        let skip: HashSet<&str> = ["args"].into_iter().collect();
        safe_merge(&mut target, map(json!({"args": [1], "k": 1})), &HashSet::new(), &skip);
        assert_eq!(Value::Object(target), json!({"k": 1}));
    }

    #[test]
    fn size_grows_by_non_skipped_keys() {
        let mut target = map(json!({"a": 1, "b": 2, "b_": 3}));
        let reserved: HashSet<&str> = ["a", "c"].into_iter().collect();
        let skip: HashSet<&str> = ["d"].into_iter().collect();
        let source = map(json!({"a": 10, "b": 20, "c": 30, "d": 40, "e": 50}));
        let before = target.clone();

        safe_merge(&mut target, source, &reserved, &skip);

        assert_eq!(target.len(), before.len() + 4);
        for (k, v) in &before {
            assert_eq!(target.get(k), Some(v));
        }
        assert!(!target.contains_key("c"));
        assert!(!target.contains_key("d"));
    }

    #[test]
    fn insert_reports_final_key() {
        let mut target = map(json!({"context": {}}));
        let key = safe_insert(&mut target, "context", json!({"rid": "x"}), &HashSet::new());
        assert_eq!(key, "context_");
    }
}

use crate::types::{RunState, ERROR_KEY};
use serde_json::Value;

/// Typed reads from a [`RunState`] with an explicit fallback.
///
/// A key that is missing, or present with the wrong type, yields the
/// supplied default. Nothing is coerced across types.
pub trait StateExt {
    fn number_or(&self, key: &str, default: f64) -> f64;
    fn integer_or(&self, key: &str, default: i64) -> i64;
    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str;
    fn list_or_empty(&self, key: &str) -> &[Value];

    /// The error marker left by a failed step, if any
    fn error_marker(&self) -> Option<&str>;
}

impl StateExt for RunState {
    fn number_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    fn integer_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    fn list_or_empty(&self, key: &str) -> &[Value] {
        self.get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn error_marker(&self) -> Option<&str> {
        self.get(ERROR_KEY).and_then(Value::as_str)
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> RunState {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_defaults_apply_to_missing_and_mistyped_keys() {
        let s = state(json!({"n": 4, "f": 2.5, "s": "hi", "l": [1, 2], "wrong": "7"}));

        assert_eq!(s.integer_or("n", 0), 4);
        assert_eq!(s.number_or("f", 0.0), 2.5);
        assert_eq!(s.number_or("n", 0.0), 4.0);
        assert_eq!(s.integer_or("wrong", -1), -1);
        assert_eq!(s.integer_or("missing", 9), 9);
        assert_eq!(s.str_or("s", ""), "hi");
        assert_eq!(s.str_or("n", "default"), "default");
        assert_eq!(s.list_or_empty("l").len(), 2);
        assert!(s.list_or_empty("s").is_empty());
    }

    #[test]
    fn test_error_marker() {
        let s = state(json!({"_error": "boom"}));
        assert_eq!(s.error_marker(), Some("boom"));
        assert_eq!(RunState::new().error_marker(), None);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(3.14159), 3.14);
        assert_eq!(round2(2.0), 2.0);
    }
}

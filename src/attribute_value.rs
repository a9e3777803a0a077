use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::util::format_number;

/// An attribute value represents possible values that can be stored in a [crate::UserContext]'s
/// custom variables or variation targeting variables.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Stores a string value.
    String(String),
    /// Stores an integral number.
    Int(i64),
    /// Stores a floating point number.
    Float(f64),
    /// Stores a boolean.
    Bool(bool),
    /// Stores an array of attribute values.
    Array(Vec<AttributeValue>),
    /// Stores a map of attribute values.
    Object(HashMap<String, AttributeValue>),
    /// Stores a null value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Int(i)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Int(i.into())
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Float(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        v.into_iter().collect()
    }
}

impl<T> std::iter::FromIterator<T> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        AttributeValue::Array(iter.into_iter().map(AttributeValue::from).collect())
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => b.into(),
            Value::Number(n) => match n.as_i64() {
                Some(i) => i.into(),
                None => n.as_f64().map(AttributeValue::Float).unwrap_or(AttributeValue::Null),
            },
            Value::String(s) => s.into(),
            Value::Array(values) => values.into_iter().collect(),
            Value::Object(map) => {
                AttributeValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl AttributeValue {
    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the wrapped value as a float for numeric types, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns None unless self is a bool. It will not convert.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Renders the value as the string that segment operands are compared against.
    ///
    /// Null renders as the empty string, numbers drop a zero fractional part, and composite
    /// values render as JSON.
    pub fn to_operand_string(&self) -> String {
        match self {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Int(i) => i.to_string(),
            AttributeValue::Float(f) => format_number(*f),
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Null => String::new(),
            AttributeValue::Array(_) | AttributeValue::Object(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use test_case::test_case;

    #[test]
    fn deserialization() {
        fn test_case(json: &str, expected: AttributeValue) {
            assert_eq!(
                serde_json::from_str::<AttributeValue>(json).unwrap(),
                expected
            );
        }

        test_case("1.5", AttributeValue::Float(1.5));
        test_case("1", AttributeValue::Int(1));
        test_case("true", AttributeValue::Bool(true));
        test_case("null", AttributeValue::Null);
        test_case("\"foo\"", AttributeValue::String("foo".to_string()));
        test_case("{}", AttributeValue::Object(hashmap![]));
        test_case(
            r#"{"foo":123}"#,
            AttributeValue::Object(hashmap!["foo".to_string() => AttributeValue::Int(123)]),
        );
    }

    #[test]
    fn collect_array() {
        assert_eq!(
            Some(10_i64).into_iter().collect::<AttributeValue>(),
            AttributeValue::Array(vec![AttributeValue::Int(10)])
        );
    }

    #[test_case(AttributeValue::from("abc"), "abc")]
    #[test_case(AttributeValue::from(5_i64), "5")]
    #[test_case(AttributeValue::from(5.0), "5")]
    #[test_case(AttributeValue::from(2.5), "2.5")]
    #[test_case(AttributeValue::from(true), "true")]
    #[test_case(AttributeValue::Null, "")]
    #[test_case(AttributeValue::from(vec![1_i64, 2]), "[1,2]")]
    fn operand_string(value: AttributeValue, expected: &str) {
        assert_eq!(value.to_operand_string(), expected);
    }

    #[test]
    fn from_json_value() {
        let value: AttributeValue = serde_json::json!({"a": [1, 2.5, "x", null]}).into();
        assert_eq!(
            value,
            AttributeValue::Object(hashmap! {
                "a".to_string() => AttributeValue::Array(vec![
                    AttributeValue::Int(1),
                    AttributeValue::Float(2.5),
                    AttributeValue::String("x".into()),
                    AttributeValue::Null,
                ])
            })
        );
    }
}

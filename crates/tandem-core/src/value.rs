//! Values crossing the process boundary.
//!
//! `Value` is the closed set of types a method may take or return. On the
//! wire values are JSON; blobs travel as a tagged object so the receiver
//! never has to guess between text and encoded bytes:
//!
//! ```text
//! {"t": "blob", "d": "<base64>"}
//! ```
//!
//! JSON peers may encode every number as a float, so integer coercion
//! accepts integral floats and rejects fractional or out-of-range ones.

use base64::Engine;
use serde_json::{Map, Number};
use std::fmt;

const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Tag key of an encoded blob object.
pub const BLOB_TAG_KEY: &str = "t";
/// Data key of an encoded blob object.
pub const BLOB_DATA_KEY: &str = "d";

/// A value exchanged between the two processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    Blob(Vec<u8>),
    Array(Vec<Value>),
}

/// Declared type of a method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Str,
    Bool,
    Blob,
    Array(Box<ValueType>),
}

impl ValueType {
    /// Array of the given element type.
    pub fn array_of(elem: ValueType) -> Self {
        ValueType::Array(Box::new(elem))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Str => "string",
            ValueType::Bool => "bool",
            ValueType::Blob => "blob",
            ValueType::Array(_) => "array",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Array(elem) => write!(f, "array<{}>", elem),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Failure to convert a wire value into a `Value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionError(String);

impl CoercionError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    fn mismatch(expected: &ValueType, got: &serde_json::Value) -> Self {
        Self(format!("expected {}, got {}", expected, json_kind(got)))
    }
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CoercionError {}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Str(_) => ValueType::Str,
            Value::Bool(_) => ValueType::Bool,
            Value::Blob(_) => ValueType::Blob,
            Value::Array(items) => ValueType::array_of(
                items
                    .first()
                    .map(Value::value_type)
                    .unwrap_or(ValueType::Int),
            ),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Encode for the wire. Blobs become tagged base64 objects.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::Number(Number::from(*n)),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Blob(bytes) => {
                let mut obj = Map::new();
                obj.insert(
                    BLOB_TAG_KEY.to_string(),
                    serde_json::Value::String(ValueType::Blob.as_str().to_string()),
                );
                obj.insert(
                    BLOB_DATA_KEY.to_string(),
                    serde_json::Value::String(ENGINE.encode(bytes)),
                );
                serde_json::Value::Object(obj)
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_wire).collect())
            }
        }
    }

    /// Decode a wire value without a declared type.
    ///
    /// Used for call results, whose types the caller does not declare. Tagged
    /// blob objects decode to `Blob`; `null` decodes to an empty array since
    /// some peers encode empty sequences that way.
    pub fn from_wire(raw: &serde_json::Value) -> Result<Value, CoercionError> {
        match raw {
            serde_json::Value::Null => Ok(Value::Array(Vec::new())),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => narrow_int(n).map(Value::Int),
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Value::from_wire)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            serde_json::Value::Object(obj) => decode_blob_object(obj).map(Value::Blob),
        }
    }

    /// Decode a wire value into the declared parameter type.
    pub fn coerce(raw: &serde_json::Value, ty: &ValueType) -> Result<Value, CoercionError> {
        match (ty, raw) {
            (ValueType::Int, serde_json::Value::Number(n)) => narrow_int(n).map(Value::Int),
            (ValueType::Str, serde_json::Value::String(s)) => Ok(Value::Str(s.clone())),
            (ValueType::Bool, serde_json::Value::Bool(b)) => Ok(Value::Bool(*b)),
            (ValueType::Blob, serde_json::Value::Object(obj)) => {
                decode_blob_object(obj).map(Value::Blob)
            }
            (ValueType::Blob, serde_json::Value::String(s)) => decode_base64(s).map(Value::Blob),
            (ValueType::Blob, serde_json::Value::Null) => Ok(Value::Blob(Vec::new())),
            (ValueType::Array(elem), serde_json::Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    Value::coerce(item, elem)
                        .map_err(|e| CoercionError::new(format!("element {}: {}", i, e)))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (ValueType::Array(_), serde_json::Value::Null) => Ok(Value::Array(Vec::new())),
            (ty, raw) => Err(CoercionError::mismatch(ty, raw)),
        }
    }
}

/// Narrow a JSON number to `i64` without losing information.
fn narrow_int(n: &Number) -> Result<i64, CoercionError> {
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    if n.is_u64() {
        return Err(CoercionError::new(format!("integer {} overflows i64", n)));
    }
    // 2^63 is exactly representable; anything at or above it overflows.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    match n.as_f64() {
        Some(f) if f.fract() != 0.0 || !f.is_finite() => {
            Err(CoercionError::new(format!("number {} is not an integer", n)))
        }
        Some(f) if f >= LIMIT || f < -LIMIT => {
            Err(CoercionError::new(format!("number {} overflows i64", n)))
        }
        Some(f) => Ok(f as i64),
        None => Err(CoercionError::new(format!("unsupported number {}", n))),
    }
}

fn decode_blob_object(obj: &Map<String, serde_json::Value>) -> Result<Vec<u8>, CoercionError> {
    match (obj.get(BLOB_TAG_KEY), obj.get(BLOB_DATA_KEY)) {
        (Some(serde_json::Value::String(tag)), Some(serde_json::Value::String(data)))
            if tag == ValueType::Blob.as_str() =>
        {
            decode_base64(data)
        }
        _ => Err(CoercionError::new("object is not a tagged blob")),
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>, CoercionError> {
    ENGINE
        .decode(data)
        .map_err(|e| CoercionError::new(format!("decode base64: {}", e)))
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Blob(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Blob(bytes.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl TryFrom<Value> for i64 {
    type Error = CoercionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(n) => Ok(n),
            other => Err(CoercionError::new(format!(
                "expected int, got {}",
                other.value_type()
            ))),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = CoercionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(CoercionError::new(format!(
                "expected string, got {}",
                other.value_type()
            ))),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = CoercionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(CoercionError::new(format!(
                "expected bool, got {}",
                other.value_type()
            ))),
        }
    }
}

/// Blobs also accept a bare base64 string, which is how peers without the
/// blob tag return byte slices.
impl TryFrom<Value> for Vec<u8> {
    type Error = CoercionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Blob(bytes) => Ok(bytes),
            Value::Str(s) => decode_base64(&s),
            other => Err(CoercionError::new(format!(
                "expected blob, got {}",
                other.value_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            ".*".prop_map(Value::Str),
            any::<bool>().prop_map(Value::Bool),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Blob),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            proptest::collection::vec(inner, 0..5).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn prop_untyped_wire_roundtrip(value in arb_value()) {
            prop_assert_eq!(Value::from_wire(&value.to_wire()).unwrap(), value);
        }

        #[test]
        fn prop_blob_roundtrip_through_declared_type(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let wire = Value::Blob(bytes.clone()).to_wire();
            prop_assert_eq!(Value::coerce(&wire, &ValueType::Blob).unwrap(), Value::Blob(bytes.clone()));

            let bare = json!(ENGINE.encode(&bytes));
            prop_assert_eq!(Value::coerce(&bare, &ValueType::Blob).unwrap(), Value::Blob(bytes));
        }
    }

    #[test]
    fn test_blob_wire_shape() {
        let wire = Value::Blob(vec![0xde, 0xad, 0xbe, 0xef]).to_wire();
        assert_eq!(wire, json!({"t": "blob", "d": "3q2+7w=="}));
        assert_eq!(
            Value::from_wire(&wire).unwrap(),
            Value::Blob(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_int_accepts_integral_float() {
        assert_eq!(
            Value::coerce(&json!(10.0), &ValueType::Int).unwrap(),
            Value::Int(10)
        );
        assert_eq!(
            Value::coerce(&json!(-3), &ValueType::Int).unwrap(),
            Value::Int(-3)
        );
    }

    #[test]
    fn test_int_rejects_fraction_and_overflow() {
        let err = Value::coerce(&json!(2.5), &ValueType::Int).unwrap_err();
        assert!(err.to_string().contains("not an integer"));

        let err = Value::coerce(&json!(u64::MAX), &ValueType::Int).unwrap_err();
        assert!(err.to_string().contains("overflows"));

        let err = Value::coerce(&json!(1e19), &ValueType::Int).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_blob_accepts_bare_base64() {
        assert_eq!(
            Value::coerce(&json!("AQID"), &ValueType::Blob).unwrap(),
            Value::Blob(vec![1, 2, 3])
        );
        assert!(Value::coerce(&json!("not base64!"), &ValueType::Blob).is_err());
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let err = Value::coerce(&json!("10"), &ValueType::Int).unwrap_err();
        assert_eq!(err.to_string(), "expected int, got string");
    }

    #[test]
    fn test_nested_array_coercion() {
        let ty = ValueType::array_of(ValueType::array_of(ValueType::Int));
        let value = Value::coerce(&json!([[1, 2.0], []]), &ty).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Array(vec![Value::Int(1), Value::Int(2)]),
                Value::Array(vec![]),
            ])
        );

        let err = Value::coerce(&json!([1, "x"]), &ValueType::array_of(ValueType::Int))
            .unwrap_err();
        assert!(err.to_string().starts_with("element 1"));
    }

    #[test]
    fn test_untyped_decode_rejects_plain_objects() {
        assert!(Value::from_wire(&json!({"a": 1})).is_err());
        assert_eq!(
            Value::from_wire(&serde_json::Value::Null).unwrap(),
            Value::Array(vec![])
        );
    }

    #[test]
    fn test_try_from_conversions() {
        assert_eq!(i64::try_from(Value::Int(5)).unwrap(), 5);
        assert_eq!(
            Vec::<u8>::try_from(Value::Str("AQID".into())).unwrap(),
            vec![1, 2, 3]
        );
        assert!(bool::try_from(Value::Int(1)).is_err());
        assert_eq!(String::try_from(Value::from("hi")).unwrap(), "hi");
    }
}

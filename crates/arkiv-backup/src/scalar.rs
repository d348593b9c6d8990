//! Attribute values as they appear in backup documents

use arkiv_core::Value;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// A single attribute value in a backup record.
///
/// Serialized untagged, so a record's values read as plain JSON:
/// `null`, integers and strings.
///
/// There is no binary variant. Blob columns are backed up as base64 text
/// and restored as that text, so a binary column only round-trips when the
/// schema reads and writes it as text on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Null,
    Integer(i64),
    String(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Integer view of the value. Strings holding a decimal integer count,
    /// since id columns are sometimes read back as text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Integer(v) => Some(*v),
            Scalar::String(s) => s.trim().parse().ok(),
            Scalar::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts back into a driver value for use as a bound parameter.
    pub fn to_value(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Integer(v) => Value::Integer(*v),
            Scalar::String(s) => Value::Text(s.clone()),
        }
    }
}

/// Reals with an integral value become integers, other reals become their
/// decimal text. Blobs become base64 text.
impl From<&Value> for Scalar {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Integer(v) => Scalar::Integer(*v),
            Value::Real(v) => {
                if v.fract() == 0.0 && v.abs() < 9.0e15 {
                    Scalar::Integer(*v as i64)
                } else {
                    Scalar::String(v.to_string())
                }
            }
            Value::Text(s) => Scalar::String(s.clone()),
            Value::Blob(bytes) => Scalar::String(BASE64.encode(bytes)),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Integer(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::String(v)
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Integer(v) => write!(f, "{}", v),
            Scalar::String(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_json_is_untagged() {
        let values = vec![Scalar::Null, Scalar::Integer(7), Scalar::from("approved")];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,7,"approved"]"#);

        let back: Vec<Scalar> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_from_driver_values() {
        assert_eq!(Scalar::from(&Value::Integer(3)), Scalar::Integer(3));
        assert_eq!(Scalar::from(&Value::Real(2.0)), Scalar::Integer(2));
        assert_eq!(Scalar::from(&Value::Real(2.5)), Scalar::from("2.5"));
        assert_eq!(Scalar::from(&Value::Blob(vec![1, 2, 3])), Scalar::from("AQID"));
    }

    #[test]
    fn test_blob_restores_as_base64_text() {
        let scalar = Scalar::from(&Value::Blob(b"png".to_vec()));
        assert_eq!(scalar.to_value(), Value::Text("cG5n".to_string()));
    }

    #[test]
    fn test_integer_like_strings() {
        assert_eq!(Scalar::from("42").as_i64(), Some(42));
        assert_eq!(Scalar::from("forty-two").as_i64(), None);
        assert_eq!(Scalar::Null.as_i64(), None);
    }
}

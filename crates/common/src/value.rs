use serde::{Deserialize, Serialize};

/// A scalar constant as it appears in relational literals, inline datasource
/// rows and native filter match values.
///
/// Float literals widen to [`ScalarValue::Double`]; the columnar FLOAT type
/// only exists for stored columns, never for constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    /// SQL NULL.
    Null,
    /// Boolean constant.
    Bool(bool),
    /// 64-bit integer constant.
    Long(i64),
    /// 64-bit floating point constant.
    Double(f64),
    /// String constant.
    String(String),
    /// Array constant; elements share one scalar type or are null.
    Array(Vec<ScalarValue>),
}

impl ScalarValue {
    /// True for [`ScalarValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// String payload, if this is a string constant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if this is a long constant.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            ScalarValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric payload widened to f64 for longs and doubles.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Long(v) => Some(*v as f64),
            ScalarValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Array elements, if this is an array constant.
    pub fn as_array(&self) -> Option<&[ScalarValue]> {
        match self {
            ScalarValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::String(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::String(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Long(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Double(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

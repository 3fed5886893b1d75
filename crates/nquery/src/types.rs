use std::fmt;

use basalt_common::{BasaltError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Column type of a stored or computed column.
///
/// Serialized as the engine's type strings: `"STRING"`, `"LONG"`, `"FLOAT"`,
/// `"DOUBLE"`, `"ARRAY<STRING>"`, `"COMPLEX<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Long,
    Float,
    Double,
    Array(Box<ColumnType>),
    Complex(String),
}

impl ColumnType {
    /// Convenience constant for `ARRAY<STRING>`.
    pub fn string_array() -> ColumnType {
        ColumnType::Array(Box::new(ColumnType::String))
    }

    /// Convenience constant for `ARRAY<LONG>`.
    pub fn long_array() -> ColumnType {
        ColumnType::Array(Box::new(ColumnType::Long))
    }

    /// Convenience constant for `ARRAY<DOUBLE>`.
    pub fn double_array() -> ColumnType {
        ColumnType::Array(Box::new(ColumnType::Double))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Long | ColumnType::Float | ColumnType::Double
        )
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ColumnType::Array(_))
    }

    /// Element type of an array type; `None` for non-arrays.
    pub fn element_type(&self) -> Option<&ColumnType> {
        match self {
            ColumnType::Array(elem) => Some(elem),
            _ => None,
        }
    }

    /// Wrap this type in an array.
    pub fn into_array(self) -> ColumnType {
        ColumnType::Array(Box::new(self))
    }

    /// The least restrictive type that can represent values of both inputs.
    ///
    /// Lattice rules:
    /// - equal types join to themselves
    /// - LONG/FLOAT/DOUBLE join to the widest numeric (FLOAT and LONG widen
    ///   to DOUBLE rather than preferring either)
    /// - anything joined with STRING is STRING
    /// - arrays join element-wise
    /// - COMPLEX types only join with themselves
    pub fn least_restrictive(a: &ColumnType, b: &ColumnType) -> Result<ColumnType> {
        if a == b {
            return Ok(a.clone());
        }
        match (a, b) {
            (ColumnType::Array(ae), ColumnType::Array(be)) => {
                Ok(ColumnType::least_restrictive(ae, be)?.into_array())
            }
            (ColumnType::String, _) | (_, ColumnType::String) => Ok(ColumnType::String),
            // equal numerics returned above; any mixed numeric pair widens
            (x, y) if x.is_numeric() && y.is_numeric() => Ok(ColumnType::Double),
            _ => Err(BasaltError::invalid_input(format!(
                "cannot implicitly convert between [{a}] and [{b}]"
            ))),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::String => write!(f, "STRING"),
            ColumnType::Long => write!(f, "LONG"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Array(elem) => write!(f, "ARRAY<{elem}>"),
            ColumnType::Complex(name) => write!(f, "COMPLEX<{name}>"),
        }
    }
}

impl std::str::FromStr for ColumnType {
    type Err = BasaltError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STRING" => Ok(ColumnType::String),
            "LONG" => Ok(ColumnType::Long),
            "FLOAT" => Ok(ColumnType::Float),
            "DOUBLE" => Ok(ColumnType::Double),
            _ => {
                if let Some(inner) = s.strip_prefix("ARRAY<").and_then(|r| r.strip_suffix('>')) {
                    Ok(inner.parse::<ColumnType>()?.into_array())
                } else if let Some(inner) =
                    s.strip_prefix("COMPLEX<").and_then(|r| r.strip_suffix('>'))
                {
                    Ok(ColumnType::Complex(inner.to_string()))
                } else {
                    Err(BasaltError::invalid_input(format!(
                        "unrecognized column type [{s}]"
                    )))
                }
            }
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Ordered mapping from output column name to [`ColumnType`].
///
/// Length and order match the query's output columns exactly; the execution
/// layer decodes result rows positionally against this signature.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowSignature {
    columns: Vec<(String, ColumnType)>,
}

impl RowSignature {
    pub fn builder() -> RowSignatureBuilder {
        RowSignatureBuilder {
            columns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Type of a column by name; first occurrence wins.
    pub fn column_type(&self, name: &str) -> Option<&ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnType)> {
        self.columns.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Concatenate two signatures (left columns first), used for join output
    /// signatures where right columns are already prefixed.
    pub fn concat(&self, other: &RowSignature) -> RowSignature {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        RowSignature { columns }
    }
}

pub struct RowSignatureBuilder {
    columns: Vec<(String, ColumnType)>,
}

impl RowSignatureBuilder {
    pub fn add(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push((name.into(), column_type));
        self
    }

    pub fn build(self) -> RowSignature {
        RowSignature {
            columns: self.columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_string_roundtrip() {
        for t in [
            ColumnType::String,
            ColumnType::Long,
            ColumnType::Float,
            ColumnType::Double,
            ColumnType::string_array(),
            ColumnType::Array(Box::new(ColumnType::double_array())),
            ColumnType::Complex("hyperUnique".to_string()),
        ] {
            let rendered = t.to_string();
            assert_eq!(rendered.parse::<ColumnType>().unwrap(), t);
        }
    }

    #[test]
    fn column_type_serializes_as_string() {
        assert_eq!(
            serde_json::to_string(&ColumnType::string_array()).unwrap(),
            "\"ARRAY<STRING>\""
        );
    }

    #[test]
    fn least_restrictive_numeric_promotion() {
        let j = |a: &ColumnType, b: &ColumnType| ColumnType::least_restrictive(a, b).unwrap();
        assert_eq!(j(&ColumnType::Long, &ColumnType::Long), ColumnType::Long);
        assert_eq!(j(&ColumnType::Long, &ColumnType::Double), ColumnType::Double);
        assert_eq!(j(&ColumnType::Float, &ColumnType::Long), ColumnType::Double);
        assert_eq!(j(&ColumnType::Long, &ColumnType::String), ColumnType::String);
        assert_eq!(
            j(&ColumnType::long_array(), &ColumnType::double_array()),
            ColumnType::double_array()
        );
    }

    #[test]
    fn least_restrictive_rejects_complex_mixes() {
        let err = ColumnType::least_restrictive(
            &ColumnType::Complex("sketch".to_string()),
            &ColumnType::Long,
        );
        assert!(err.is_err());
    }

    #[test]
    fn row_signature_preserves_order() {
        let sig = RowSignature::builder()
            .add("dim1", ColumnType::String)
            .add("cnt", ColumnType::Long)
            .build();
        let names: Vec<_> = sig.names().collect();
        assert_eq!(names, vec!["dim1", "cnt"]);
        assert_eq!(sig.column_type("cnt"), Some(&ColumnType::Long));
        assert_eq!(sig.column_type("missing"), None);
    }
}

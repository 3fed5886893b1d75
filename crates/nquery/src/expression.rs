use basalt_common::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::types::ColumnType;

/// A compiled scalar expression in the native expression language, together
/// with its inferred output type.
///
/// `direct_column` is set when the expression is a bare column access, which
/// lets callers reference the stored column directly instead of materializing
/// a virtual column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeExpression {
    pub expression: String,
    #[serde(rename = "outputType")]
    pub output_type: ColumnType,
    #[serde(skip)]
    pub direct_column: Option<String>,
}

impl NativeExpression {
    /// A bare reference to a stored column.
    pub fn column(name: impl Into<String>, output_type: ColumnType) -> NativeExpression {
        let name = name.into();
        NativeExpression {
            expression: quote_identifier(&name),
            output_type,
            direct_column: Some(name),
        }
    }

    /// An arbitrary native expression.
    pub fn of(expression: impl Into<String>, output_type: ColumnType) -> NativeExpression {
        NativeExpression {
            expression: expression.into(),
            output_type,
            direct_column: None,
        }
    }

    /// True when this expression is a plain reference to a stored column.
    pub fn is_direct_column(&self) -> bool {
        self.direct_column.is_some()
    }
}

/// A named, on-the-fly computed column usable anywhere a stored column can be
/// referenced.
///
/// Serialized as an expression virtual column:
/// `{"type":"expression","name":"v0","expression":"strlen(\"dim1\")","outputType":"LONG"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "expression")]
pub struct VirtualColumn {
    pub name: String,
    pub expression: String,
    #[serde(rename = "outputType")]
    pub output_type: ColumnType,
}

impl VirtualColumn {
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        output_type: ColumnType,
    ) -> VirtualColumn {
        VirtualColumn {
            name: name.into(),
            expression: expression.into(),
            output_type,
        }
    }
}

/// Quote an identifier for use in a native expression: `dim1` -> `"dim1"`.
pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Render a scalar constant as a native expression literal.
///
/// Strings single-quote with backslash escaping, nulls render as `null`,
/// arrays as `array(...)`. Longs and doubles render in their canonical Rust
/// forms, which the native expression parser accepts.
pub fn literal(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Null => "null".to_string(),
        ScalarValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        ScalarValue::Long(v) => v.to_string(),
        ScalarValue::Double(v) => {
            if v.fract() == 0.0 && v.is_finite() {
                format!("{v:.1}")
            } else {
                v.to_string()
            }
        }
        ScalarValue::String(s) => string_literal(s),
        ScalarValue::Array(items) => fn_call("array", items.iter().map(literal)),
    }
}

/// Render a string literal: `a'b` -> `'a\'b'`.
pub fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Render a native function call from already-rendered argument expressions.
pub fn fn_call(name: &str, args: impl IntoIterator<Item = String>) -> String {
    let args: Vec<String> = args.into_iter().collect();
    format!("{}({})", name, args.join(","))
}

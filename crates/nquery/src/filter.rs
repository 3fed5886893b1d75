use std::collections::BTreeSet;

use basalt_common::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::types::ColumnType;

/// The native filter algebra.
///
/// Invariants, maintained by the [`DimFilter::and`] / [`DimFilter::or`] /
/// [`DimFilter::in_values`] constructors:
/// - `And`/`Or` never contain nested same-kind children (flattened);
/// - boolean constants are eliminated (`TRUE` children drop out of `And`,
///   `FALSE` children drop out of `Or`, and the short-circuit cases collapse
///   the whole combinator);
/// - `In` with a single value collapses to `Equality`;
/// - negation is structural (`Not` wraps), never pushed through children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DimFilter {
    True,
    False,
    #[serde(rename_all = "camelCase")]
    Equality {
        column: String,
        match_value_type: ColumnType,
        match_value: ScalarValue,
    },
    #[serde(rename_all = "camelCase")]
    Range {
        column: String,
        match_value_type: ColumnType,
        #[serde(skip_serializing_if = "Option::is_none")]
        lower: Option<ScalarValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upper: Option<ScalarValue>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        lower_open: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        upper_open: bool,
    },
    #[serde(rename_all = "camelCase")]
    In {
        column: String,
        match_value_type: ColumnType,
        values: Vec<ScalarValue>,
    },
    And {
        fields: Vec<DimFilter>,
    },
    Or {
        fields: Vec<DimFilter>,
    },
    Not {
        field: Box<DimFilter>,
    },
    Like {
        column: String,
        pattern: String,
    },
    #[serde(rename_all = "camelCase")]
    ArrayContainsElement {
        column: String,
        element_match_value_type: ColumnType,
        element_match_value: ScalarValue,
    },
    Null {
        column: String,
    },
    Expression {
        expression: String,
    },
}

impl DimFilter {
    pub fn equality(
        column: impl Into<String>,
        match_value_type: ColumnType,
        match_value: impl Into<ScalarValue>,
    ) -> DimFilter {
        DimFilter::Equality {
            column: column.into(),
            match_value_type,
            match_value: match_value.into(),
        }
    }

    /// Conjunction with flattening and boolean-constant elimination.
    pub fn and(fields: Vec<DimFilter>) -> DimFilter {
        let mut out = Vec::with_capacity(fields.len());
        for f in fields {
            match f {
                DimFilter::True => {}
                DimFilter::False => return DimFilter::False,
                DimFilter::And { fields: inner } => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => DimFilter::True,
            1 => out.into_iter().next().expect("len checked"),
            _ => DimFilter::And { fields: out },
        }
    }

    /// Disjunction with flattening and boolean-constant elimination.
    pub fn or(fields: Vec<DimFilter>) -> DimFilter {
        let mut out = Vec::with_capacity(fields.len());
        for f in fields {
            match f {
                DimFilter::False => {}
                DimFilter::True => return DimFilter::True,
                DimFilter::Or { fields: inner } => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => DimFilter::False,
            1 => out.into_iter().next().expect("len checked"),
            _ => DimFilter::Or { fields: out },
        }
    }

    /// Structural negation. Boolean constants invert; everything else wraps.
    pub fn not(field: DimFilter) -> DimFilter {
        match field {
            DimFilter::True => DimFilter::False,
            DimFilter::False => DimFilter::True,
            DimFilter::Not { field } => *field,
            other => DimFilter::Not {
                field: Box::new(other),
            },
        }
    }

    /// Set membership. Empty value sets are unsatisfiable; single values
    /// collapse to [`DimFilter::Equality`].
    pub fn in_values(
        column: impl Into<String>,
        match_value_type: ColumnType,
        values: Vec<ScalarValue>,
    ) -> DimFilter {
        let column = column.into();
        match values.len() {
            0 => DimFilter::False,
            1 => DimFilter::Equality {
                column,
                match_value_type,
                match_value: values.into_iter().next().expect("len checked"),
            },
            _ => DimFilter::In {
                column,
                match_value_type,
                values,
            },
        }
    }

    /// Collect every column name this filter references.
    pub fn referenced_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            DimFilter::True | DimFilter::False => {}
            DimFilter::Equality { column, .. }
            | DimFilter::Range { column, .. }
            | DimFilter::In { column, .. }
            | DimFilter::Like { column, .. }
            | DimFilter::ArrayContainsElement { column, .. }
            | DimFilter::Null { column } => {
                out.insert(column.clone());
            }
            DimFilter::And { fields } | DimFilter::Or { fields } => {
                for f in fields {
                    f.referenced_columns(out);
                }
            }
            DimFilter::Not { field } => field.referenced_columns(out),
            DimFilter::Expression { expression } => {
                collect_quoted_identifiers(expression, out);
            }
        }
    }

    /// Rewrite column references in place. `rename` returns the replacement
    /// name, or `None` to leave a reference untouched. Expression fallbacks
    /// rewrite their quoted identifiers textually.
    pub fn rename_columns(&mut self, rename: &dyn Fn(&str) -> Option<String>) {
        match self {
            DimFilter::True | DimFilter::False => {}
            DimFilter::Equality { column, .. }
            | DimFilter::Range { column, .. }
            | DimFilter::In { column, .. }
            | DimFilter::Like { column, .. }
            | DimFilter::ArrayContainsElement { column, .. }
            | DimFilter::Null { column } => {
                if let Some(new) = rename(column) {
                    *column = new;
                }
            }
            DimFilter::And { fields } | DimFilter::Or { fields } => {
                for f in fields {
                    f.rename_columns(rename);
                }
            }
            DimFilter::Not { field } => field.rename_columns(rename),
            DimFilter::Expression { expression } => {
                *expression = rename_quoted_identifiers(expression, rename);
            }
        }
    }
}

/// Extract identifiers quoted as `"name"` from a native expression string.
pub fn collect_quoted_identifiers(expression: &str, out: &mut BTreeSet<String>) {
    for ident in quoted_identifiers(expression) {
        out.insert(ident);
    }
}

/// Rewrite identifiers quoted as `"name"` within a native expression string.
pub fn rename_quoted_identifiers(
    expression: &str,
    rename: &dyn Fn(&str) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut chars = expression.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            // skip string literals verbatim
            out.push(c);
            while let Some(sc) = chars.next() {
                out.push(sc);
                if sc == '\\' {
                    if let Some(esc) = chars.next() {
                        out.push(esc);
                    }
                } else if sc == '\'' {
                    break;
                }
            }
        } else if c == '"' {
            let mut ident = String::new();
            let mut closed = false;
            while let Some(ic) = chars.next() {
                if ic == '\\' {
                    if let Some(esc) = chars.next() {
                        ident.push(esc);
                    }
                } else if ic == '"' {
                    closed = true;
                    break;
                } else {
                    ident.push(ic);
                }
            }
            if closed {
                let renamed = rename(&ident);
                out.push_str(&crate::expression::quote_identifier(
                    renamed.as_deref().unwrap_or(&ident),
                ));
            } else {
                // unterminated identifier; emit verbatim
                out.push('"');
                out.push_str(&ident);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn quoted_identifiers(expression: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            while let Some(sc) = chars.next() {
                if sc == '\\' {
                    chars.next();
                } else if sc == '\'' {
                    break;
                }
            }
        } else if c == '"' {
            let mut ident = String::new();
            while let Some(ic) = chars.next() {
                if ic == '\\' {
                    if let Some(esc) = chars.next() {
                        ident.push(esc);
                    }
                } else if ic == '"' {
                    break;
                } else {
                    ident.push(ic);
                }
            }
            out.push(ident);
        }
    }
    out
}

use basalt_common::{BasaltError, Result, ScalarValue};
use basalt_nquery::types::{ColumnType, RowSignature};
use basalt_nquery::JoinType;

use crate::expression::infer_type;

/// Name of the primary timestamp column every table carries.
pub const TIME_COLUMN: &str = "__time";

/// A scalar expression in the relational plan, produced by the SQL front end
/// with all names resolved against the input row.
#[derive(Debug, Clone, PartialEq)]
pub enum RelExpr {
    /// Reference to an input column by resolved name.
    Column(String),
    /// Constant.
    Literal(ScalarValue),
    /// Operator or function application.
    Call { op: ScalarOp, args: Vec<RelExpr> },
}

impl RelExpr {
    pub fn col(name: impl Into<String>) -> RelExpr {
        RelExpr::Column(name.into())
    }

    pub fn lit(value: impl Into<ScalarValue>) -> RelExpr {
        RelExpr::Literal(value.into())
    }

    pub fn call(op: ScalarOp, args: Vec<RelExpr>) -> RelExpr {
        RelExpr::Call { op, args }
    }

    /// Binary comparison/arithmetic shorthand used heavily in tests.
    pub fn binary(op: ScalarOp, left: RelExpr, right: RelExpr) -> RelExpr {
        RelExpr::Call {
            op,
            args: vec![left, right],
        }
    }

    pub fn as_literal(&self) -> Option<&ScalarValue> {
        match self {
            RelExpr::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// A literal array operand: either an array constant or an array
    /// constructor whose arguments are all constants.
    pub fn as_literal_array(&self) -> Option<Vec<ScalarValue>> {
        match self {
            RelExpr::Literal(ScalarValue::Array(items)) => Some(items.clone()),
            RelExpr::Call {
                op: ScalarOp::ArrayConstructor,
                args,
            } => args
                .iter()
                .map(|a| a.as_literal().cloned())
                .collect::<Option<Vec<_>>>(),
            _ => None,
        }
    }

    /// Collect referenced input column names.
    pub fn referenced_columns(&self, out: &mut std::collections::BTreeSet<String>) {
        match self {
            RelExpr::Column(name) => {
                out.insert(name.clone());
            }
            RelExpr::Literal(_) => {}
            RelExpr::Call { args, .. } => {
                for a in args {
                    a.referenced_columns(out);
                }
            }
        }
    }
}

/// Closed scalar operator set of the relational expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarOp {
    // comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // boolean
    And,
    Or,
    Not,
    IsNull,
    IsNotNull,
    // arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Abs,
    Floor,
    Ceil,
    // string
    Concat,
    Upper,
    Lower,
    Strlen,
    /// `substring(s, start, length)`; start is zero-based.
    Substring,
    Like,
    // conditional
    /// Flat `[when1, then1, when2, then2, ..., else]` argument list.
    CaseSearched,
    Coalesce,
    Cast(ColumnType),
    // arrays
    ArrayConstructor,
    ArrayContains,
    ArrayOverlap,
    ScalarInArray,
    ArrayLength,
    /// Reinterpret a multi-valued string column as `ARRAY<STRING>`.
    MvToArray,
    // time
    /// `time_floor(ts, period)`; the period argument must be a string literal.
    TimeFloor,
}

/// Aggregate call in an [`RelNode::Aggregate`].
#[derive(Debug, Clone, PartialEq)]
pub enum AggCall {
    /// `COUNT(*)`.
    Count,
    /// `COUNT(DISTINCT expr)`.
    CountDistinct(RelExpr),
    Sum(RelExpr),
    Min(RelExpr),
    Max(RelExpr),
    Avg(RelExpr),
    /// Aggregate restricted to rows matching `predicate` (SQL `FILTER`).
    Filtered {
        predicate: Box<RelExpr>,
        inner: Box<AggCall>,
    },
}

impl AggCall {
    /// Finalized output type, given the input row signature.
    pub fn output_type(&self, signature: &RowSignature) -> Result<ColumnType> {
        match self {
            AggCall::Count | AggCall::CountDistinct(_) => Ok(ColumnType::Long),
            AggCall::Sum(e) | AggCall::Min(e) | AggCall::Max(e) => {
                let t = infer_type(e, signature)?;
                if t == ColumnType::Long {
                    Ok(ColumnType::Long)
                } else {
                    Ok(ColumnType::Double)
                }
            }
            AggCall::Avg(_) => Ok(ColumnType::Double),
            AggCall::Filtered { inner, .. } => inner.output_type(signature),
        }
    }
}

/// One ordering column of a [`RelNode::Sort`].
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    /// Output column name of the sorted input.
    pub column: String,
    pub descending: bool,
}

/// A validated relational-algebra plan node.
///
/// The compiler only reads the tree; ownership stays with the caller.
/// `output_signature` reproduces each node's output row type, including the
/// deterministic source-order join/unnest prefixes (`j0.`, `_j0.`, ...) the
/// datasource builder will assign.
#[derive(Debug, Clone, PartialEq)]
pub enum RelNode {
    TableScan {
        table: String,
        signature: RowSignature,
    },
    Values {
        signature: RowSignature,
        rows: Vec<Vec<ScalarValue>>,
    },
    Project {
        exprs: Vec<(RelExpr, String)>,
        input: Box<RelNode>,
    },
    Filter {
        predicate: RelExpr,
        input: Box<RelNode>,
    },
    Join {
        left: Box<RelNode>,
        right: Box<RelNode>,
        /// Equi-join key pairs `(left column, unprefixed right column)`.
        /// Empty keys mean a constant (cross) join.
        keys: Vec<(String, String)>,
        join_type: JoinType,
    },
    Aggregate {
        group_exprs: Vec<(RelExpr, String)>,
        agg_exprs: Vec<(AggCall, String)>,
        input: Box<RelNode>,
    },
    Sort {
        fields: Vec<SortField>,
        limit: Option<u64>,
        offset: Option<u64>,
        input: Box<RelNode>,
    },
    /// Explode an array or multi-valued column into one row per element,
    /// correlated with its source row. The element column is exposed to the
    /// rest of the plan under `output_name`.
    Unnest {
        target: RelExpr,
        output_name: String,
        input: Box<RelNode>,
    },
    /// UNION ALL of inputs with identical signatures.
    Union { inputs: Vec<RelNode> },
}

impl RelNode {
    /// Output row signature of this node.
    pub fn output_signature(&self) -> Result<RowSignature> {
        match self {
            RelNode::TableScan { signature, .. } | RelNode::Values { signature, .. } => {
                Ok(signature.clone())
            }
            RelNode::Project { exprs, input } => {
                let in_sig = input.output_signature()?;
                let mut b = RowSignature::builder();
                for (e, name) in exprs {
                    b = b.add(name.clone(), infer_type(e, &in_sig)?);
                }
                Ok(b.build())
            }
            RelNode::Filter { input, .. } | RelNode::Sort { input, .. } => {
                input.output_signature()
            }
            RelNode::Join { left, right, .. } => {
                let left_sig = left.output_signature()?;
                let right_sig = right.output_signature()?;
                let prefix = join_prefix(left.prefix_depth());
                let mut b = RowSignature::builder();
                for (name, t) in left_sig.iter() {
                    b = b.add(name, t.clone());
                }
                for (name, t) in right_sig.iter() {
                    b = b.add(format!("{prefix}{name}"), t.clone());
                }
                Ok(b.build())
            }
            RelNode::Aggregate {
                group_exprs,
                agg_exprs,
                input,
            } => {
                let in_sig = input.output_signature()?;
                let mut b = RowSignature::builder();
                for (e, name) in group_exprs {
                    b = b.add(name.clone(), infer_type(e, &in_sig)?);
                }
                for (agg, name) in agg_exprs {
                    b = b.add(name.clone(), agg.output_type(&in_sig)?);
                }
                Ok(b.build())
            }
            RelNode::Unnest {
                target,
                output_name,
                input,
            } => {
                let in_sig = input.output_signature()?;
                let target_type = infer_type(target, &in_sig)?;
                let element_type = unnest_element_type(&target_type)?;
                let mut b = RowSignature::builder();
                for (name, t) in in_sig.iter() {
                    b = b.add(name, t.clone());
                }
                b = b.add(output_name.clone(), element_type);
                Ok(b.build())
            }
            RelNode::Union { inputs } => {
                let first = inputs.first().ok_or_else(|| {
                    BasaltError::invalid_input("UNION requires at least one input".to_string())
                })?;
                let sig = first.output_signature()?;
                for other in &inputs[1..] {
                    if other.output_signature()? != sig {
                        return Err(BasaltError::invalid_input(
                            "UNION inputs must have identical signatures".to_string(),
                        ));
                    }
                }
                Ok(sig)
            }
        }
    }
}

/// Element type produced by unnesting a column of the given type.
///
/// Arrays unnest to their element type; multi-valued (plain STRING) columns
/// unnest to STRING. Anything else is not unnestable.
pub fn unnest_element_type(t: &ColumnType) -> Result<ColumnType> {
    match t {
        ColumnType::Array(elem) => Ok((**elem).clone()),
        ColumnType::String => Ok(ColumnType::String),
        other => Err(BasaltError::invalid_input(format!(
            "cannot unnest column of type [{other}]"
        ))),
    }
}

/// The join/unnest name prefix for the given nesting depth:
/// `j0.`, `_j0.`, `__j0.`, ...
pub fn join_prefix(depth: usize) -> String {
    format!("{}j0.", "_".repeat(depth))
}

impl RelNode {
    /// Number of join/unnest wrappers already present in this node's native
    /// spine, which is the nesting depth the *next* join or unnest on top of
    /// it will be prefixed with.
    ///
    /// Filters and sorts stay within the same native level. Projections and
    /// aggregates force a sub-query boundary when used as a join/unnest base,
    /// which restarts prefix numbering inside the sub-query, so they reset
    /// the depth to zero. Both `output_signature` and the datasource builder
    /// derive prefixes from this rule, keeping the names the front end sees
    /// aligned with the built datasource.
    pub fn prefix_depth(&self) -> usize {
        match self {
            RelNode::TableScan { .. }
            | RelNode::Values { .. }
            | RelNode::Project { .. }
            | RelNode::Aggregate { .. }
            | RelNode::Sort { .. }
            | RelNode::Union { .. } => 0,
            RelNode::Filter { input, .. } => input.prefix_depth(),
            RelNode::Join { left, .. } => left.prefix_depth() + 1,
            RelNode::Unnest { input, .. } => input.prefix_depth() + 1,
        }
    }
}

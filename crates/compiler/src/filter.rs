use std::collections::HashMap;

use basalt_common::{BasaltError, Result, ScalarValue};
use basalt_nquery::types::{ColumnType, RowSignature};
use basalt_nquery::DimFilter;

use crate::context::PlannerContext;
use crate::expression::{literal_type, ExpressionCompiler, VirtualColumnRegistry};
use crate::rel::{RelExpr, ScalarOp};

/// Compiles predicate trees into the native filter algebra.
///
/// Translation rules:
/// - equality/range/IN against literal operands compile to the specialized
///   filter variants;
/// - `ARRAY_CONTAINS(col, literal array)` compiles to an `And` of one
///   element filter per literal element (`ArrayContainsElement` for array
///   columns, `Equality` for scalar and multi-valued columns);
///   `ARRAY_OVERLAP` compiles analogously to an `Or`;
/// - negation stays structural: `NOT` wraps the child filter and is never
///   pushed through `In`/`Equality`;
/// - everything non-translatable falls back to `Expression` with the
///   compiled raw expression, which is always semantically correct.
pub struct FilterCompiler<'a, 'r> {
    ctx: &'a PlannerContext,
    signature: &'a RowSignature,
    aliases: &'a HashMap<String, String>,
    registry: &'r mut VirtualColumnRegistry,
}

impl<'a, 'r> FilterCompiler<'a, 'r> {
    pub fn new(
        ctx: &'a PlannerContext,
        signature: &'a RowSignature,
        aliases: &'a HashMap<String, String>,
        registry: &'r mut VirtualColumnRegistry,
    ) -> FilterCompiler<'a, 'r> {
        FilterCompiler {
            ctx,
            signature,
            aliases,
            registry,
        }
    }

    fn expr_compiler(&self) -> ExpressionCompiler<'a> {
        ExpressionCompiler::new(self.ctx, self.signature, self.aliases)
    }

    /// Compile a root predicate. `None` means the predicate is always true
    /// and the query carries no filter.
    pub fn compile_root(&mut self, predicate: &RelExpr) -> Result<Option<DimFilter>> {
        Ok(match self.compile(predicate)? {
            DimFilter::True => None,
            other => Some(other),
        })
    }

    /// Compile a boolean predicate into a filter.
    pub fn compile(&mut self, predicate: &RelExpr) -> Result<DimFilter> {
        match predicate {
            RelExpr::Literal(value) => Ok(literal_truth(value)),
            RelExpr::Call { op, args } => self.compile_call(op, args),
            RelExpr::Column(_) => self.expression_fallback(predicate),
        }
    }

    fn compile_call(&mut self, op: &ScalarOp, args: &[RelExpr]) -> Result<DimFilter> {
        match op {
            ScalarOp::And => {
                let fields = args
                    .iter()
                    .map(|a| self.compile(a))
                    .collect::<Result<Vec<_>>>()?;
                Ok(DimFilter::and(fields))
            }
            ScalarOp::Or => {
                let fields = args
                    .iter()
                    .map(|a| self.compile(a))
                    .collect::<Result<Vec<_>>>()?;
                Ok(DimFilter::or(fields))
            }
            ScalarOp::Not if args.len() == 1 => Ok(DimFilter::not(self.compile(&args[0])?)),
            ScalarOp::Eq | ScalarOp::Ne if args.len() == 2 => {
                let filter = match split_operands(&args[0], &args[1]) {
                    Some((expr, value)) if value.is_null() => {
                        // `= NULL` is never true in SQL comparison semantics
                        let _ = expr;
                        DimFilter::False
                    }
                    Some((expr, value)) => {
                        let column = self.reference(expr)?;
                        DimFilter::Equality {
                            column,
                            match_value_type: literal_type(value),
                            match_value: value.clone(),
                        }
                    }
                    None => {
                        return self.expression_fallback_call(op, args);
                    }
                };
                if *op == ScalarOp::Ne {
                    Ok(DimFilter::not(filter))
                } else {
                    Ok(filter)
                }
            }
            ScalarOp::Lt | ScalarOp::Le | ScalarOp::Gt | ScalarOp::Ge if args.len() == 2 => {
                self.compile_range(op, args)
            }
            ScalarOp::IsNull if args.len() == 1 => {
                let column = self.reference(&args[0])?;
                Ok(DimFilter::Null { column })
            }
            ScalarOp::IsNotNull if args.len() == 1 => {
                let column = self.reference(&args[0])?;
                Ok(DimFilter::not(DimFilter::Null { column }))
            }
            ScalarOp::Like if args.len() == 2 => match args[1].as_literal() {
                Some(ScalarValue::String(pattern)) => {
                    let column = self.reference(&args[0])?;
                    Ok(DimFilter::Like {
                        column,
                        pattern: pattern.clone(),
                    })
                }
                _ => self.expression_fallback_call(op, args),
            },
            ScalarOp::ScalarInArray if args.len() == 2 => {
                match args[1].as_literal_array() {
                    Some(values) => {
                        let column = self.reference(&args[0])?;
                        let match_value_type = values_type(&values);
                        self.check_numeric_in_limit(&match_value_type, values.len())?;
                        Ok(DimFilter::in_values(column, match_value_type, values))
                    }
                    None => self.expression_fallback_call(op, args),
                }
            }
            ScalarOp::ArrayContains if args.len() == 2 => {
                self.compile_array_membership(op, args, true)
            }
            ScalarOp::ArrayOverlap if args.len() == 2 => {
                self.compile_array_membership(op, args, false)
            }
            _ => self.expression_fallback_call(op, args),
        }
    }

    fn compile_range(&mut self, op: &ScalarOp, args: &[RelExpr]) -> Result<DimFilter> {
        // normalize to (expr OP literal); a literal on the left flips the op
        let (expr, value, op) = match split_operands(&args[0], &args[1]) {
            Some((e, v)) if std::ptr::eq(e, &args[0]) => (e, v, op.clone()),
            Some((e, v)) => {
                let flipped = match op {
                    ScalarOp::Lt => ScalarOp::Gt,
                    ScalarOp::Le => ScalarOp::Ge,
                    ScalarOp::Gt => ScalarOp::Lt,
                    ScalarOp::Ge => ScalarOp::Le,
                    _ => unreachable!("range op"),
                };
                (e, v, flipped)
            }
            None => return self.expression_fallback_call(op, args),
        };
        if value.is_null() {
            return Ok(DimFilter::False);
        }
        let column = self.reference(expr)?;
        let match_value_type = literal_type(value);
        let (lower, upper, lower_open, upper_open) = match op {
            ScalarOp::Lt => (None, Some(value.clone()), false, true),
            ScalarOp::Le => (None, Some(value.clone()), false, false),
            ScalarOp::Gt => (Some(value.clone()), None, true, false),
            ScalarOp::Ge => (Some(value.clone()), None, false, false),
            _ => unreachable!("range op"),
        };
        Ok(DimFilter::Range {
            column,
            match_value_type,
            lower,
            upper,
            lower_open,
            upper_open,
        })
    }

    /// `ARRAY_CONTAINS` (all elements) / `ARRAY_OVERLAP` (any element)
    /// against a literal array, specialized per element. Non-literal
    /// operands fall back to the raw expression.
    fn compile_array_membership(
        &mut self,
        op: &ScalarOp,
        args: &[RelExpr],
        conjunction: bool,
    ) -> Result<DimFilter> {
        let elements = match args[1].as_literal_array() {
            Some(elements) => elements,
            None => match args[1].as_literal() {
                Some(scalar) => vec![scalar.clone()],
                None => return self.expression_fallback_call(op, args),
            },
        };
        let compiled = self.expr_compiler().compile(&args[0])?;
        let target_is_array = compiled.output_type.is_array();
        let column = self.registry.reference(&compiled);
        let fields = elements
            .into_iter()
            .map(|element| {
                if target_is_array {
                    DimFilter::ArrayContainsElement {
                        column: column.clone(),
                        element_match_value_type: literal_type(&element),
                        element_match_value: element,
                    }
                } else {
                    // scalar or multi-valued column: per-value equality
                    DimFilter::Equality {
                        column: column.clone(),
                        match_value_type: literal_type(&element),
                        match_value: element,
                    }
                }
            })
            .collect::<Vec<_>>();
        if conjunction {
            Ok(DimFilter::and(fields))
        } else {
            Ok(DimFilter::or(fields))
        }
    }

    fn check_numeric_in_limit(&self, match_value_type: &ColumnType, count: usize) -> Result<()> {
        let max = self.ctx.config.max_numeric_in_filters;
        if max >= 0 && match_value_type.is_numeric() && count as i64 > max {
            return Err(BasaltError::invalid_input(format!(
                "numeric IN filter with [{count}] values exceeds the limit of [{max}]"
            )));
        }
        Ok(())
    }

    /// Column name under which the operand can be filtered: the stored
    /// column itself, or a materialized virtual column for expressions.
    fn reference(&mut self, expr: &RelExpr) -> Result<String> {
        let compiled = self.expr_compiler().compile(expr)?;
        Ok(self.registry.reference(&compiled))
    }

    fn expression_fallback(&mut self, predicate: &RelExpr) -> Result<DimFilter> {
        let compiled = self.expr_compiler().compile(predicate)?;
        Ok(DimFilter::Expression {
            expression: compiled.expression,
        })
    }

    fn expression_fallback_call(&mut self, op: &ScalarOp, args: &[RelExpr]) -> Result<DimFilter> {
        self.expression_fallback(&RelExpr::Call {
            op: op.clone(),
            args: args.to_vec(),
        })
    }
}

/// Boolean truth of a literal predicate: NULL and zero are false.
fn literal_truth(value: &ScalarValue) -> DimFilter {
    match value {
        ScalarValue::Bool(true) => DimFilter::True,
        ScalarValue::Bool(false) | ScalarValue::Null => DimFilter::False,
        ScalarValue::Long(v) => {
            if *v != 0 {
                DimFilter::True
            } else {
                DimFilter::False
            }
        }
        _ => DimFilter::False,
    }
}

/// Split a binary comparison into `(non-literal side, literal side)`, in
/// argument order when possible. `None` when both or neither side is a
/// literal.
fn split_operands<'e>(
    left: &'e RelExpr,
    right: &'e RelExpr,
) -> Option<(&'e RelExpr, &'e ScalarValue)> {
    match (left.as_literal(), right.as_literal()) {
        (None, Some(v)) => Some((left, v)),
        (Some(v), None) => Some((right, v)),
        _ => None,
    }
}

/// Least restrictive type of an IN value list, defaulting to STRING.
fn values_type(values: &[ScalarValue]) -> ColumnType {
    let mut out: Option<ColumnType> = None;
    for v in values {
        if v.is_null() {
            continue;
        }
        let t = literal_type(v);
        out = Some(match out {
            None => t,
            Some(prev) => ColumnType::least_restrictive(&prev, &t).unwrap_or(ColumnType::String),
        });
    }
    out.unwrap_or(ColumnType::String)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PlannerConfig;
    use crate::rel::TIME_COLUMN;
    use chrono::TimeZone;

    fn ctx_with(config: PlannerConfig) -> PlannerContext {
        PlannerContext::new(
            config,
            &basalt_nquery::ContextMap::new(),
            chrono::Utc.timestamp_millis_opt(1577836800000).unwrap(),
        )
        .unwrap()
    }

    fn sig() -> RowSignature {
        RowSignature::builder()
            .add(TIME_COLUMN, ColumnType::Long)
            .add("dim1", ColumnType::String)
            .add("dim3", ColumnType::String)
            .add("arr1", ColumnType::string_array())
            .add("l1", ColumnType::Long)
            .build()
    }

    fn compile(predicate: &RelExpr) -> Result<(Option<DimFilter>, Vec<basalt_nquery::VirtualColumn>)> {
        compile_with(predicate, PlannerConfig::default())
    }

    fn compile_with(
        predicate: &RelExpr,
        config: PlannerConfig,
    ) -> Result<(Option<DimFilter>, Vec<basalt_nquery::VirtualColumn>)> {
        let ctx = ctx_with(config);
        let sig = sig();
        let aliases = HashMap::new();
        let mut registry = VirtualColumnRegistry::new();
        let filter =
            FilterCompiler::new(&ctx, &sig, &aliases, &mut registry).compile_root(predicate)?;
        Ok((filter, registry.into_columns()))
    }

    fn str_array(values: &[&str]) -> RelExpr {
        RelExpr::lit(ScalarValue::Array(
            values.iter().map(|v| ScalarValue::from(*v)).collect(),
        ))
    }

    #[test]
    fn equality_against_literal() {
        let (f, vcols) = compile(&RelExpr::binary(
            ScalarOp::Eq,
            RelExpr::col("dim1"),
            RelExpr::lit("abc"),
        ))
        .unwrap();
        assert!(vcols.is_empty());
        assert_eq!(
            f,
            Some(DimFilter::equality("dim1", ColumnType::String, "abc"))
        );
    }

    #[test]
    fn equality_on_expression_materializes_virtual_column() {
        let (f, vcols) = compile(&RelExpr::binary(
            ScalarOp::Eq,
            RelExpr::call(ScalarOp::Strlen, vec![RelExpr::col("dim1")]),
            RelExpr::lit(3i64),
        ))
        .unwrap();
        assert_eq!(vcols.len(), 1);
        assert_eq!(vcols[0].name, "v0");
        assert_eq!(vcols[0].expression, "strlen(\"dim1\")");
        assert_eq!(f, Some(DimFilter::equality("v0", ColumnType::Long, 3i64)));
    }

    #[test]
    fn range_flips_literal_on_left() {
        let (f, _) = compile(&RelExpr::binary(
            ScalarOp::Lt,
            RelExpr::lit(10i64),
            RelExpr::col("l1"),
        ))
        .unwrap();
        assert_eq!(
            f,
            Some(DimFilter::Range {
                column: "l1".to_string(),
                match_value_type: ColumnType::Long,
                lower: Some(ScalarValue::Long(10)),
                upper: None,
                lower_open: true,
                upper_open: false,
            })
        );
    }

    #[test]
    fn array_overlap_on_mv_column_is_or_of_equalities() {
        let (f, _) = compile(&RelExpr::call(
            ScalarOp::ArrayOverlap,
            vec![RelExpr::col("dim3"), str_array(&["a", "b"])],
        ))
        .unwrap();
        assert_eq!(
            f,
            Some(DimFilter::or(vec![
                DimFilter::equality("dim3", ColumnType::String, "a"),
                DimFilter::equality("dim3", ColumnType::String, "b"),
            ]))
        );
    }

    #[test]
    fn array_contains_on_array_column_is_and_of_element_filters() {
        let (f, _) = compile(&RelExpr::call(
            ScalarOp::ArrayContains,
            vec![RelExpr::col("arr1"), str_array(&["a", "b", "c"])],
        ))
        .unwrap();
        let Some(DimFilter::And { fields }) = f else {
            panic!("expected And, got {f:?}");
        };
        assert_eq!(fields.len(), 3);
        assert!(fields
            .iter()
            .all(|f| matches!(f, DimFilter::ArrayContainsElement { column, .. } if column == "arr1")));
    }

    #[test]
    fn non_literal_array_operand_falls_back_to_expression() {
        let (f, _) = compile(&RelExpr::call(
            ScalarOp::ArrayOverlap,
            vec![
                RelExpr::col("dim3"),
                RelExpr::call(ScalarOp::MvToArray, vec![RelExpr::col("dim1")]),
            ],
        ))
        .unwrap();
        assert_eq!(
            f,
            Some(DimFilter::Expression {
                expression: "array_overlap(\"dim3\",mv_to_array(\"dim1\"))".to_string()
            })
        );
    }

    #[test]
    fn not_wraps_structurally() {
        let (f, _) = compile(&RelExpr::call(
            ScalarOp::Not,
            vec![RelExpr::call(
                ScalarOp::ScalarInArray,
                vec![RelExpr::col("dim1"), str_array(&["a", "b"])],
            )],
        ))
        .unwrap();
        let Some(DimFilter::Not { field }) = f else {
            panic!("expected Not, got {f:?}");
        };
        assert!(matches!(*field, DimFilter::In { .. }));
    }

    #[test]
    fn in_collapses_single_value() {
        let (f, _) = compile(&RelExpr::call(
            ScalarOp::ScalarInArray,
            vec![RelExpr::col("dim1"), str_array(&["only"])],
        ))
        .unwrap();
        assert_eq!(
            f,
            Some(DimFilter::equality("dim1", ColumnType::String, "only"))
        );
    }

    #[test]
    fn numeric_in_limit_is_enforced() {
        let config = PlannerConfig {
            max_numeric_in_filters: 2,
            ..PlannerConfig::default()
        };
        let long_array = RelExpr::lit(ScalarValue::Array(vec![
            ScalarValue::Long(1),
            ScalarValue::Long(2),
            ScalarValue::Long(3),
        ]));
        let err = compile_with(
            &RelExpr::call(
                ScalarOp::ScalarInArray,
                vec![RelExpr::col("l1"), long_array],
            ),
            config,
        )
        .unwrap_err();
        assert!(matches!(err, BasaltError::InvalidInput(_)));
    }

    #[test]
    fn literal_true_compiles_to_no_filter() {
        let (f, _) = compile(&RelExpr::lit(true)).unwrap();
        assert_eq!(f, None);
        let (f, _) = compile(&RelExpr::lit(false)).unwrap();
        assert_eq!(f, Some(DimFilter::False));
    }

    #[test]
    fn and_eliminates_literal_children() {
        let (f, _) = compile(&RelExpr::call(
            ScalarOp::And,
            vec![
                RelExpr::lit(true),
                RelExpr::binary(ScalarOp::Eq, RelExpr::col("dim1"), RelExpr::lit("x")),
            ],
        ))
        .unwrap();
        assert_eq!(f, Some(DimFilter::equality("dim1", ColumnType::String, "x")));
    }

    #[test]
    fn is_null_compiles_to_null_filter() {
        let (f, _) = compile(&RelExpr::call(ScalarOp::IsNull, vec![RelExpr::col("dim1")]))
            .unwrap();
        assert_eq!(
            f,
            Some(DimFilter::Null {
                column: "dim1".to_string()
            })
        );
    }
}

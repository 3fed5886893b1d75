use std::collections::HashMap;

use basalt_common::{BasaltError, Result, ScalarValue};
use basalt_nquery::expression::{fn_call, literal, NativeExpression};
use basalt_nquery::time::validate_period;
use basalt_nquery::types::{ColumnType, RowSignature};
use basalt_nquery::VirtualColumn;

use crate::context::PlannerContext;
use crate::rel::{RelExpr, ScalarOp};

/// Registry of the virtual columns materialized while compiling one query.
///
/// Names are `v0, v1, ...` in registration order. Registration deduplicates
/// by `(expression text, output type)`: the second occurrence of an equal
/// key reuses the first column. Names already present in an input signature
/// (a sub-query emitting its own `v0`) can be reserved so generation skips
/// them. The per-query counter is scoped to a single compilation pass and
/// never shared across queries.
#[derive(Debug, Default)]
pub struct VirtualColumnRegistry {
    columns: Vec<VirtualColumn>,
    by_key: HashMap<(String, ColumnType), usize>,
    reserved: std::collections::BTreeSet<String>,
    counter: usize,
}

impl VirtualColumnRegistry {
    pub fn new() -> VirtualColumnRegistry {
        VirtualColumnRegistry::default()
    }

    /// Mark a column name as taken by the input row, never to be generated.
    pub fn reserve(&mut self, name: &str) {
        self.reserved.insert(name.to_string());
    }

    /// Column name under which the given compiled expression can be
    /// referenced: the stored column itself for direct references, otherwise
    /// a (possibly pre-existing) virtual column name.
    pub fn reference(&mut self, expr: &NativeExpression) -> String {
        if let Some(column) = &expr.direct_column {
            return column.clone();
        }
        self.get_or_create(&expr.expression, &expr.output_type)
    }

    pub fn get_or_create(&mut self, expression: &str, output_type: &ColumnType) -> String {
        let key = (expression.to_string(), output_type.clone());
        if let Some(idx) = self.by_key.get(&key) {
            return self.columns[*idx].name.clone();
        }
        let name = loop {
            let candidate = format!("v{}", self.counter);
            self.counter += 1;
            if !self.reserved.contains(&candidate) {
                break candidate;
            }
        };
        self.by_key.insert(key, self.columns.len());
        self.columns
            .push(VirtualColumn::new(name.clone(), expression, output_type.clone()));
        name
    }

    pub fn columns(&self) -> &[VirtualColumn] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<VirtualColumn> {
        self.columns
    }
}

/// Compiles relational scalar expressions into native expressions against a
/// fixed input signature.
///
/// `aliases` maps relational-plan column names to native column names (the
/// unnest output aliases); the target of an alias must exist in `signature`.
pub struct ExpressionCompiler<'a> {
    ctx: &'a PlannerContext,
    signature: &'a RowSignature,
    aliases: &'a HashMap<String, String>,
}

impl<'a> ExpressionCompiler<'a> {
    pub fn new(
        ctx: &'a PlannerContext,
        signature: &'a RowSignature,
        aliases: &'a HashMap<String, String>,
    ) -> ExpressionCompiler<'a> {
        ExpressionCompiler {
            ctx,
            signature,
            aliases,
        }
    }

    /// Resolve a relational column name to its native column name.
    pub fn resolve_column(&self, name: &str) -> Result<(String, ColumnType)> {
        let native = self
            .aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name);
        let t = self.signature.column_type(native).ok_or_else(|| {
            BasaltError::invalid_input(format!("unknown column [{name}]"))
        })?;
        Ok((native.to_string(), t.clone()))
    }

    /// Compile an expression bottom-up, inferring its output type.
    pub fn compile(&self, expr: &RelExpr) -> Result<NativeExpression> {
        match expr {
            RelExpr::Column(name) => {
                let (native, t) = self.resolve_column(name)?;
                Ok(NativeExpression::column(native, t))
            }
            RelExpr::Literal(value) => {
                reject_non_finite(value)?;
                Ok(NativeExpression::of(literal(value), literal_type(value)))
            }
            RelExpr::Call { op, args } => self.compile_call(op, args),
        }
    }

    fn compile_call(&self, op: &ScalarOp, args: &[RelExpr]) -> Result<NativeExpression> {
        let compiled: Vec<NativeExpression> =
            args.iter().map(|a| self.compile(a)).collect::<Result<_>>()?;
        let arg_types: Vec<ColumnType> =
            compiled.iter().map(|c| c.output_type.clone()).collect();
        let output_type = type_of_call(op, &arg_types)?;

        let rendered = match op {
            ScalarOp::Eq
            | ScalarOp::Ne
            | ScalarOp::Lt
            | ScalarOp::Le
            | ScalarOp::Gt
            | ScalarOp::Ge
            | ScalarOp::And
            | ScalarOp::Or
            | ScalarOp::Plus
            | ScalarOp::Minus
            | ScalarOp::Multiply
            | ScalarOp::Divide
            | ScalarOp::Modulo => {
                expect_args(op, args, 2)?;
                format!(
                    "({} {} {})",
                    compiled[0].expression,
                    infix_op(op),
                    compiled[1].expression
                )
            }
            ScalarOp::Not => {
                expect_args(op, args, 1)?;
                format!("!{}", parenthesize(&compiled[0].expression))
            }
            ScalarOp::IsNull => {
                expect_args(op, args, 1)?;
                fn_call("isnull", [compiled[0].expression.clone()])
            }
            ScalarOp::IsNotNull => {
                expect_args(op, args, 1)?;
                fn_call("notnull", [compiled[0].expression.clone()])
            }
            ScalarOp::Abs | ScalarOp::Floor | ScalarOp::Ceil => {
                expect_args(op, args, 1)?;
                let name = match op {
                    ScalarOp::Abs => "abs",
                    ScalarOp::Floor => "floor",
                    _ => "ceil",
                };
                fn_call(name, [compiled[0].expression.clone()])
            }
            ScalarOp::Concat => fn_call(
                "concat",
                compiled.iter().map(|c| c.expression.clone()),
            ),
            ScalarOp::Upper | ScalarOp::Lower | ScalarOp::Strlen => {
                expect_args(op, args, 1)?;
                let name = match op {
                    ScalarOp::Upper => "upper",
                    ScalarOp::Lower => "lower",
                    _ => "strlen",
                };
                if arg_types[0].is_array() {
                    // multi-valued/array operand: apply per element
                    format!(
                        "map((x) -> {}, {})",
                        fn_call(name, ["x".to_string()]),
                        compiled[0].expression
                    )
                } else {
                    fn_call(name, [compiled[0].expression.clone()])
                }
            }
            ScalarOp::Substring => {
                expect_args(op, args, 3)?;
                fn_call(
                    "substring",
                    compiled.iter().map(|c| c.expression.clone()),
                )
            }
            ScalarOp::Like => {
                expect_args(op, args, 2)?;
                fn_call(
                    "like",
                    [
                        compiled[0].expression.clone(),
                        compiled[1].expression.clone(),
                    ],
                )
            }
            ScalarOp::CaseSearched => {
                if args.len() < 2 {
                    return Err(BasaltError::invalid_input(
                        "CASE requires at least one WHEN/THEN pair".to_string(),
                    ));
                }
                fn_call(
                    "case_searched",
                    compiled.iter().map(|c| c.expression.clone()),
                )
            }
            ScalarOp::Coalesce => {
                if args.len() < 2 {
                    return Err(BasaltError::invalid_input(
                        "COALESCE requires at least two arguments".to_string(),
                    ));
                }
                let mut rendered = compiled
                    .last()
                    .expect("arity checked")
                    .expression
                    .clone();
                for c in compiled.iter().rev().skip(1) {
                    rendered = fn_call("nvl", [c.expression.clone(), rendered]);
                }
                rendered
            }
            ScalarOp::Cast(target) => {
                expect_args(op, args, 1)?;
                fn_call(
                    "cast",
                    [
                        compiled[0].expression.clone(),
                        format!("'{target}'"),
                    ],
                )
            }
            ScalarOp::ArrayConstructor => fn_call(
                "array",
                compiled.iter().map(|c| c.expression.clone()),
            ),
            ScalarOp::ArrayContains => {
                expect_args(op, args, 2)?;
                fn_call(
                    "array_contains",
                    [
                        compiled[0].expression.clone(),
                        compiled[1].expression.clone(),
                    ],
                )
            }
            ScalarOp::ArrayOverlap => {
                expect_args(op, args, 2)?;
                fn_call(
                    "array_overlap",
                    [
                        compiled[0].expression.clone(),
                        compiled[1].expression.clone(),
                    ],
                )
            }
            ScalarOp::ScalarInArray => {
                expect_args(op, args, 2)?;
                fn_call(
                    "scalar_in_array",
                    [
                        compiled[0].expression.clone(),
                        compiled[1].expression.clone(),
                    ],
                )
            }
            ScalarOp::ArrayLength => {
                expect_args(op, args, 1)?;
                fn_call("array_length", [compiled[0].expression.clone()])
            }
            ScalarOp::MvToArray => {
                expect_args(op, args, 1)?;
                if !compiled[0].is_direct_column() {
                    return Err(BasaltError::invalid_input(
                        "MV_TO_ARRAY requires a direct column argument".to_string(),
                    ));
                }
                fn_call("mv_to_array", [compiled[0].expression.clone()])
            }
            ScalarOp::TimeFloor => {
                expect_args(op, args, 2)?;
                let period = args[1]
                    .as_literal()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        BasaltError::invalid_input(
                            "TIME_FLOOR period must be a string literal".to_string(),
                        )
                    })?;
                validate_period(period)?;
                let tz = self.ctx.time_zone;
                if tz == chrono_tz::UTC {
                    fn_call(
                        "timestamp_floor",
                        [compiled[0].expression.clone(), format!("'{period}'")],
                    )
                } else {
                    fn_call(
                        "timestamp_floor",
                        [
                            compiled[0].expression.clone(),
                            format!("'{period}'"),
                            "null".to_string(),
                            format!("'{tz}'"),
                        ],
                    )
                }
            }
        };

        Ok(NativeExpression::of(rendered, output_type))
    }
}

fn expect_args(op: &ScalarOp, args: &[RelExpr], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(BasaltError::invalid_input(format!(
            "operator {op:?} expects {n} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn infix_op(op: &ScalarOp) -> &'static str {
    match op {
        ScalarOp::Eq => "==",
        ScalarOp::Ne => "!=",
        ScalarOp::Lt => "<",
        ScalarOp::Le => "<=",
        ScalarOp::Gt => ">",
        ScalarOp::Ge => ">=",
        ScalarOp::And => "&&",
        ScalarOp::Or => "||",
        ScalarOp::Plus => "+",
        ScalarOp::Minus => "-",
        ScalarOp::Multiply => "*",
        ScalarOp::Divide => "/",
        ScalarOp::Modulo => "%",
        _ => unreachable!("not an infix operator"),
    }
}

fn parenthesize(expression: &str) -> String {
    if expression.starts_with('(') {
        expression.to_string()
    } else {
        format!("({expression})")
    }
}

fn reject_non_finite(value: &ScalarValue) -> Result<()> {
    match value {
        ScalarValue::Double(d) if !d.is_finite() => Err(BasaltError::invalid_input(
            "non-finite double constant is not allowed".to_string(),
        )),
        ScalarValue::Array(items) => {
            for item in items {
                reject_non_finite(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Type of a scalar constant. NULL infers STRING; arrays infer the least
/// restrictive element type, defaulting to STRING when empty or all-null.
pub fn literal_type(value: &ScalarValue) -> ColumnType {
    match value {
        ScalarValue::Null => ColumnType::String,
        ScalarValue::Bool(_) => ColumnType::Long,
        ScalarValue::Long(_) => ColumnType::Long,
        ScalarValue::Double(_) => ColumnType::Double,
        ScalarValue::String(_) => ColumnType::String,
        ScalarValue::Array(items) => {
            let mut elem: Option<ColumnType> = None;
            for item in items {
                if item.is_null() {
                    continue;
                }
                let t = literal_type(item);
                elem = Some(match elem {
                    None => t,
                    Some(prev) => {
                        ColumnType::least_restrictive(&prev, &t).unwrap_or(ColumnType::String)
                    }
                });
            }
            elem.unwrap_or(ColumnType::String).into_array()
        }
    }
}

/// Infer the output type of a relational expression against an input
/// signature, bottom-up. Shares the operator type rules with the compiler so
/// relational signatures and compiled expressions cannot diverge.
pub fn infer_type(expr: &RelExpr, signature: &RowSignature) -> Result<ColumnType> {
    match expr {
        RelExpr::Column(name) => signature
            .column_type(name)
            .cloned()
            .ok_or_else(|| BasaltError::invalid_input(format!("unknown column [{name}]"))),
        RelExpr::Literal(value) => Ok(literal_type(value)),
        RelExpr::Call { op, args } => {
            let arg_types: Vec<ColumnType> = args
                .iter()
                .map(|a| infer_type(a, signature))
                .collect::<Result<_>>()?;
            type_of_call(op, &arg_types)
        }
    }
}

fn type_of_call(op: &ScalarOp, arg_types: &[ColumnType]) -> Result<ColumnType> {
    let arg = |i: usize| -> Result<&ColumnType> {
        arg_types.get(i).ok_or_else(|| {
            BasaltError::invalid_input(format!("operator {op:?} is missing argument {i}"))
        })
    };
    match op {
        ScalarOp::Eq
        | ScalarOp::Ne
        | ScalarOp::Lt
        | ScalarOp::Le
        | ScalarOp::Gt
        | ScalarOp::Ge
        | ScalarOp::And
        | ScalarOp::Or
        | ScalarOp::Not
        | ScalarOp::IsNull
        | ScalarOp::IsNotNull
        | ScalarOp::Like
        | ScalarOp::ArrayContains
        | ScalarOp::ArrayOverlap
        | ScalarOp::ScalarInArray => Ok(ColumnType::Long),
        ScalarOp::Plus
        | ScalarOp::Minus
        | ScalarOp::Multiply
        | ScalarOp::Divide
        | ScalarOp::Modulo => {
            let t = ColumnType::least_restrictive(arg(0)?, arg(1)?)?;
            if !t.is_numeric() {
                return Err(BasaltError::invalid_input(format!(
                    "arithmetic requires numeric operands, got [{}] and [{}]",
                    arg(0)?,
                    arg(1)?
                )));
            }
            Ok(t)
        }
        ScalarOp::Abs | ScalarOp::Floor | ScalarOp::Ceil => {
            let t = arg(0)?;
            if !t.is_numeric() {
                return Err(BasaltError::invalid_input(format!(
                    "{op:?} requires a numeric operand, got [{t}]"
                )));
            }
            Ok(t.clone())
        }
        ScalarOp::Concat | ScalarOp::Substring => Ok(ColumnType::String),
        ScalarOp::Upper | ScalarOp::Lower => {
            if arg(0)?.is_array() {
                Ok(ColumnType::string_array())
            } else {
                Ok(ColumnType::String)
            }
        }
        ScalarOp::Strlen => {
            if arg(0)?.is_array() {
                Ok(ColumnType::long_array())
            } else {
                Ok(ColumnType::Long)
            }
        }
        ScalarOp::CaseSearched => {
            // results sit at odd indices; a trailing unpaired arg is the else
            let mut result: Option<ColumnType> = None;
            let mut idx = 1;
            while idx < arg_types.len() {
                let t = &arg_types[idx];
                result = Some(match result {
                    None => t.clone(),
                    Some(prev) => ColumnType::least_restrictive(&prev, t)?,
                });
                idx += 2;
            }
            if arg_types.len() % 2 == 1 {
                let t = arg_types.last().expect("non-empty");
                result = Some(match result {
                    None => t.clone(),
                    Some(prev) => ColumnType::least_restrictive(&prev, t)?,
                });
            }
            result.ok_or_else(|| {
                BasaltError::invalid_input("CASE requires at least one result".to_string())
            })
        }
        ScalarOp::Coalesce => {
            let mut result = arg(0)?.clone();
            for t in &arg_types[1..] {
                result = ColumnType::least_restrictive(&result, t)?;
            }
            Ok(result)
        }
        ScalarOp::Cast(target) => Ok(target.clone()),
        ScalarOp::ArrayConstructor => {
            let mut elem: Option<ColumnType> = None;
            for t in arg_types {
                elem = Some(match elem {
                    None => t.clone(),
                    Some(prev) => ColumnType::least_restrictive(&prev, t)?,
                });
            }
            Ok(elem.unwrap_or(ColumnType::String).into_array())
        }
        ScalarOp::ArrayLength => Ok(ColumnType::Long),
        ScalarOp::MvToArray => {
            if *arg(0)? != ColumnType::String {
                return Err(BasaltError::invalid_input(format!(
                    "MV_TO_ARRAY requires a string column, got [{}]",
                    arg(0)?
                )));
            }
            Ok(ColumnType::string_array())
        }
        ScalarOp::TimeFloor => Ok(ColumnType::Long),
    }
}

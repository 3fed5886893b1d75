//! Shared fixtures for compiler integration tests: the `numfoo` dataset, a
//! row-level filter evaluator and a small scan-query interpreter used to
//! check semantic equivalence of rewritten plans.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::{BTreeMap, HashMap};

use basalt_common::ScalarValue;
use basalt_compiler::{PlannerConfig, PlannerContext, RelNode};
use basalt_nquery::types::{ColumnType, RowSignature};
use basalt_nquery::{ContextMap, DataSource, DimFilter, NativeQuery};
use chrono::TimeZone;

pub type Row = BTreeMap<String, ScalarValue>;

pub fn planner_ctx(entries: &[(&str, serde_json::Value)]) -> PlannerContext {
    planner_ctx_with(PlannerConfig::default(), entries)
}

pub fn planner_ctx_with(
    config: PlannerConfig,
    entries: &[(&str, serde_json::Value)],
) -> PlannerContext {
    let map: ContextMap = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    PlannerContext::new(
        config,
        &map,
        chrono::Utc.timestamp_millis_opt(1577836800000).unwrap(),
    )
    .unwrap()
}

pub fn numfoo_signature() -> RowSignature {
    RowSignature::builder()
        .add("__time", ColumnType::Long)
        .add("dim1", ColumnType::String)
        .add("dim2", ColumnType::String)
        .add("dim3", ColumnType::String)
        .add("l1", ColumnType::Long)
        .add("d1", ColumnType::Double)
        .build()
}

pub fn numfoo_scan() -> RelNode {
    RelNode::TableScan {
        table: "numfoo".to_string(),
        signature: numfoo_signature(),
    }
}

fn row(entries: Vec<(&str, ScalarValue)>) -> Row {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn mv(values: &[&str]) -> ScalarValue {
    ScalarValue::Array(values.iter().map(|v| ScalarValue::from(*v)).collect())
}

/// Six rows; `dim3` is multi-valued.
pub fn numfoo_rows() -> Vec<Row> {
    vec![
        row(vec![
            ("__time", ScalarValue::Long(1)),
            ("dim1", ScalarValue::from("")),
            ("dim2", ScalarValue::from("a")),
            ("dim3", mv(&["a", "b"])),
            ("l1", ScalarValue::Long(10)),
            ("d1", ScalarValue::Double(1.0)),
        ]),
        row(vec![
            ("__time", ScalarValue::Long(2)),
            ("dim1", ScalarValue::from("10.1")),
            ("dim2", ScalarValue::from("")),
            ("dim3", mv(&["b", "c"])),
            ("l1", ScalarValue::Long(20)),
            ("d1", ScalarValue::Double(1.7)),
        ]),
        row(vec![
            ("__time", ScalarValue::Long(3)),
            ("dim1", ScalarValue::from("2")),
            ("dim2", ScalarValue::from("")),
            ("dim3", ScalarValue::from("d")),
            ("l1", ScalarValue::Long(30)),
            ("d1", ScalarValue::Double(0.0)),
        ]),
        row(vec![
            ("__time", ScalarValue::Long(4)),
            ("dim1", ScalarValue::from("1")),
            ("dim2", ScalarValue::from("a")),
            ("dim3", ScalarValue::from("")),
            ("l1", ScalarValue::Long(40)),
            ("d1", ScalarValue::Double(2.5)),
        ]),
        row(vec![
            ("__time", ScalarValue::Long(5)),
            ("dim1", ScalarValue::from("def")),
            ("dim2", ScalarValue::from("abc")),
            ("dim3", ScalarValue::Null),
            ("l1", ScalarValue::Long(50)),
            ("d1", ScalarValue::Double(3.0)),
        ]),
        row(vec![
            ("__time", ScalarValue::Long(6)),
            ("dim1", ScalarValue::from("abc")),
            ("dim2", ScalarValue::from("")),
            ("dim3", ScalarValue::Null),
            ("l1", ScalarValue::Long(60)),
            ("d1", ScalarValue::Double(4.4)),
        ]),
    ]
}

pub fn numfoo_tables() -> HashMap<String, Vec<Row>> {
    HashMap::from([("numfoo".to_string(), numfoo_rows())])
}

fn scalar_eq(a: &ScalarValue, b: &ScalarValue) -> bool {
    match (a, b) {
        (ScalarValue::Long(x), ScalarValue::Double(y))
        | (ScalarValue::Double(y), ScalarValue::Long(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

/// Multi-valued equality semantics: a cell matches when it equals the value
/// or, for array cells, when any element does.
fn cell_matches(cell: Option<&ScalarValue>, value: &ScalarValue) -> bool {
    match cell {
        None | Some(ScalarValue::Null) => false,
        Some(ScalarValue::Array(items)) => items.iter().any(|i| scalar_eq(i, value)),
        Some(other) => scalar_eq(other, value),
    }
}

/// Evaluate a filter over one row. Supports the algebra the equivalence
/// tests exercise; expression fallbacks are out of interpreter scope.
pub fn eval_filter(filter: &DimFilter, row: &Row) -> bool {
    match filter {
        DimFilter::True => true,
        DimFilter::False => false,
        DimFilter::Equality {
            column,
            match_value,
            ..
        } => cell_matches(row.get(column), match_value),
        DimFilter::In { column, values, .. } => {
            values.iter().any(|v| cell_matches(row.get(column), v))
        }
        DimFilter::Range {
            column,
            lower,
            upper,
            lower_open,
            upper_open,
            ..
        } => {
            let Some(cell) = row.get(column) else {
                return false;
            };
            let Some(v) = cell.as_f64() else {
                return false;
            };
            if let Some(lo) = lower.as_ref().and_then(|l| l.as_f64()) {
                if *lower_open && v <= lo {
                    return false;
                }
                if !*lower_open && v < lo {
                    return false;
                }
            }
            if let Some(hi) = upper.as_ref().and_then(|u| u.as_f64()) {
                if *upper_open && v >= hi {
                    return false;
                }
                if !*upper_open && v > hi {
                    return false;
                }
            }
            true
        }
        DimFilter::And { fields } => fields.iter().all(|f| eval_filter(f, row)),
        DimFilter::Or { fields } => fields.iter().any(|f| eval_filter(f, row)),
        DimFilter::Not { field } => !eval_filter(field, row),
        DimFilter::Null { column } => {
            matches!(row.get(column), None | Some(ScalarValue::Null))
        }
        DimFilter::ArrayContainsElement {
            column,
            element_match_value,
            ..
        } => cell_matches(row.get(column), element_match_value),
        other => panic!("filter not supported by the test interpreter: {other:?}"),
    }
}

/// Produce the row stream of a datasource. Supports the tree shapes the
/// equivalence tests compile to: tables, inline values, filtered wrappers
/// and single-equality inner joins.
fn datasource_rows(ds: &DataSource, tables: &HashMap<String, Vec<Row>>) -> Vec<Row> {
    match ds {
        DataSource::Table { name } => tables
            .get(name)
            .unwrap_or_else(|| panic!("unknown test table {name}"))
            .clone(),
        DataSource::Inline {
            column_names,
            rows,
            ..
        } => rows
            .iter()
            .map(|r| {
                column_names
                    .iter()
                    .cloned()
                    .zip(r.iter().cloned())
                    .collect()
            })
            .collect(),
        DataSource::Filtered { base, filter } => datasource_rows(base, tables)
            .into_iter()
            .filter(|r| eval_filter(filter, r))
            .collect(),
        DataSource::Join {
            left,
            right,
            right_prefix,
            condition,
            ..
        } => {
            let left_rows = datasource_rows(left, tables);
            let right_rows = datasource_rows(right, tables);
            let (lk, rk) = parse_condition(condition, right_prefix);
            let mut out = Vec::new();
            for l in &left_rows {
                for r in &right_rows {
                    let matches = match (l.get(&lk), r.get(&rk)) {
                        (Some(a), Some(b)) if !a.is_null() && !b.is_null() => cell_matches(Some(a), b),
                        _ => false,
                    };
                    if matches {
                        let mut joined = l.clone();
                        for (k, v) in r {
                            joined.insert(format!("{right_prefix}{k}"), v.clone());
                        }
                        out.push(joined);
                    }
                }
            }
            out
        }
        other => panic!("datasource not supported by the test interpreter: {other:?}"),
    }
}

fn parse_condition(condition: &str, prefix: &str) -> (String, String) {
    let inner = condition
        .strip_prefix('(')
        .and_then(|c| c.strip_suffix(')'))
        .unwrap_or_else(|| panic!("unparseable test join condition {condition}"));
    let (l, r) = inner.split_once(" == ").expect("equality condition");
    let unquote = |s: &str| s.trim_matches('"').to_string();
    let right = unquote(r);
    let right_key = right
        .strip_prefix(prefix)
        .unwrap_or_else(|| panic!("right key {right} lacks prefix {prefix}"))
        .to_string();
    (unquote(l), right_key)
}

/// Execute a compiled scan query against the fixture tables, returning
/// result rows in column order.
pub fn run_scan(query: &NativeQuery, tables: &HashMap<String, Vec<Row>>) -> Vec<Vec<ScalarValue>> {
    let NativeQuery::Scan(scan) = query else {
        panic!("test interpreter only runs scan queries, got {query:?}");
    };
    let mut rows = datasource_rows(&scan.data_source, tables);
    if let Some(filter) = &scan.filter {
        rows.retain(|r| eval_filter(filter, r));
    }
    let offset = scan.offset.unwrap_or(0) as usize;
    let mut out: Vec<Vec<ScalarValue>> = rows
        .iter()
        .skip(offset)
        .map(|r| {
            scan.columns
                .iter()
                .map(|c| r.get(c).cloned().unwrap_or(ScalarValue::Null))
                .collect()
        })
        .collect();
    if let Some(limit) = scan.limit {
        out.truncate(limit as usize);
    }
    out
}

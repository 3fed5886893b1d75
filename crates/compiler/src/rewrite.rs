use std::collections::{BTreeMap, BTreeSet, HashMap};

use basalt_common::{BasaltError, Result, ScalarValue};
use basalt_nquery::filter::collect_quoted_identifiers;
use basalt_nquery::{DataSource, DimFilter, JoinType, NativeQuery, VirtualColumn};
use tracing::debug;

use crate::context::PlannerContext;

/// Joins against key sets larger than this are never rewritten to filters.
const JOIN_TO_FILTER_MAX_KEYS: usize = 10_000;

/// Apply the cross-cutting rewrite passes to a built native query.
///
/// Both rewrites are best-effort: when a precondition cannot be proven the
/// rewrite is skipped and the unrewritten form is used. Rewrites never change
/// result semantics, only shape.
pub fn run(query: &mut NativeQuery, ctx: &PlannerContext) -> Result<()> {
    if ctx.query_context.rewrite_join_to_filter {
        join_to_filter(query, ctx);
    }
    virtual_column_gc(query)
}

// -----------------------------
// Join-to-filter
// -----------------------------

/// Candidate join found in the datasource tree, addressed by its child path.
struct JoinCandidate {
    path: Vec<usize>,
    prefix: String,
    left_key: String,
    right_key: String,
}

/// Convert eligible joins against small inline key sets into `Filtered`
/// datasources with an `In` filter on the left key, avoiding the join
/// operator entirely.
fn join_to_filter(query: &mut NativeQuery, ctx: &PlannerContext) {
    // repeat until no candidate applies; each application can expose another
    loop {
        let candidates = collect_candidates(query.data_source(), &mut Vec::new());
        let mut applied = false;
        for candidate in candidates {
            if apply_candidate(query, ctx, &candidate) {
                debug!(prefix = %candidate.prefix, "join-to-filter rewrite applied");
                applied = true;
                break;
            }
        }
        if !applied {
            return;
        }
    }
}

fn collect_candidates(ds: &DataSource, path: &mut Vec<usize>) -> Vec<JoinCandidate> {
    let mut out = Vec::new();
    if let DataSource::Join {
        right,
        right_prefix,
        condition,
        join_type: JoinType::Inner,
        ..
    } = ds
    {
        if matches!(right.as_ref(), DataSource::Inline { .. }) {
            if let Some((left_key, right_key)) = parse_equi_condition(condition, right_prefix) {
                out.push(JoinCandidate {
                    path: path.clone(),
                    prefix: right_prefix.clone(),
                    left_key,
                    right_key,
                });
            }
        }
    }
    for (idx, child) in ds.children().into_iter().enumerate() {
        path.push(idx);
        out.extend(collect_candidates(child, path));
        path.pop();
    }
    out
}

/// Parse a single-equality join condition `("left" == "prefixright")` into
/// `(left_key, unprefixed_right_key)`. Conjunctions and non-equi conditions
/// disqualify.
fn parse_equi_condition(condition: &str, prefix: &str) -> Option<(String, String)> {
    if condition.contains("&&") {
        return None;
    }
    let inner = condition.strip_prefix('(')?.strip_suffix(')')?;
    let (left, right) = inner.split_once(" == ")?;
    let unquote = |s: &str| -> Option<String> {
        let mut idents = BTreeSet::new();
        collect_quoted_identifiers(s, &mut idents);
        if idents.len() == 1 && s.starts_with('"') && s.ends_with('"') {
            idents.into_iter().next()
        } else {
            None
        }
    };
    let left_col = unquote(left)?;
    let right_col = unquote(right)?;
    if left_col.starts_with(prefix) {
        return None;
    }
    let right_key = right_col.strip_prefix(prefix)?;
    Some((left_col, right_key.to_string()))
}

fn apply_candidate(query: &mut NativeQuery, ctx: &PlannerContext, candidate: &JoinCandidate) -> bool {
    // nothing outside this join's own condition may consume right-side
    // columns, otherwise the join output is still needed
    let mut probe = query.clone();
    if let Some(DataSource::Join { condition, .. }) =
        navigate_mut(probe.data_source_mut(), &candidate.path)
    {
        *condition = "1".to_string();
    } else {
        return false;
    }
    let mut refs = BTreeSet::new();
    probe.referenced_columns(&mut refs);
    if refs.iter().any(|r| r.starts_with(&candidate.prefix)) {
        debug!(prefix = %candidate.prefix, "join-to-filter skipped: right side referenced");
        return false;
    }

    let Some(ds) = navigate_mut(query.data_source_mut(), &candidate.path) else {
        return false;
    };
    let DataSource::Join { left, right, .. } = ds else {
        return false;
    };
    let DataSource::Inline {
        column_names,
        column_types,
        rows,
    } = right.as_ref()
    else {
        return false;
    };

    if column_names.len() > 1 && !ctx.query_context.join_filter_rewrite_value_columns {
        debug!("join-to-filter skipped: value columns present and their rewrite is disabled");
        return false;
    }
    if rows.len() > JOIN_TO_FILTER_MAX_KEYS {
        debug!(rows = rows.len(), "join-to-filter skipped: key set too large");
        return false;
    }
    let Some(key_idx) = column_names.iter().position(|c| c == &candidate.right_key) else {
        return false;
    };
    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        match row.get(key_idx) {
            // null join keys never match; rewriting them into IN would
            // change null-handling semantics
            Some(ScalarValue::Null) | None => {
                debug!("join-to-filter skipped: null join key");
                return false;
            }
            Some(v) => values.push(v.clone()),
        }
    }
    // deduplicate while preserving first-seen order; IN is a set
    let mut seen = BTreeSet::new();
    values.retain(|v| seen.insert(format!("{v:?}")));

    let match_value_type = column_types
        .get(key_idx)
        .cloned()
        .unwrap_or(basalt_nquery::ColumnType::String);
    let filter = DimFilter::in_values(candidate.left_key.clone(), match_value_type, values);
    let left = std::mem::replace(
        left.as_mut(),
        DataSource::Table {
            name: String::new(),
        },
    );
    *ds = DataSource::Filtered {
        base: Box::new(left),
        filter,
    };
    true
}

fn navigate_mut<'d>(ds: &'d mut DataSource, path: &[usize]) -> Option<&'d mut DataSource> {
    let mut current = ds;
    for idx in path {
        current = current.children_mut().into_iter().nth(*idx)?;
    }
    Some(current)
}

// -----------------------------
// Virtual-column GC
// -----------------------------

fn is_generated_name(name: &str) -> bool {
    name.len() > 1 && name.starts_with('v') && name[1..].bytes().all(|b| b.is_ascii_digit())
}

/// Drop virtual columns not referenced by the final query and renumber the
/// surviving generated (`vN`) names contiguously in registration order, for
/// deterministic output. Unnest virtual columns (named by their join prefix)
/// are never renumbered.
fn virtual_column_gc(query: &mut NativeQuery) -> Result<()> {
    let defs: Vec<VirtualColumn> = query.virtual_columns().to_vec();
    if defs.is_empty() {
        return Ok(());
    }

    let mut refs = BTreeSet::new();
    query.referenced_columns(&mut refs);

    // liveness is transitive: a live column's expression may reference others
    let mut live: BTreeSet<String> = BTreeSet::new();
    loop {
        let mut changed = false;
        for def in &defs {
            if refs.contains(&def.name) && live.insert(def.name.clone()) {
                collect_quoted_identifiers(&def.expression, &mut refs);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let kept: Vec<VirtualColumn> = defs
        .iter()
        .filter(|d| live.contains(&d.name))
        .cloned()
        .collect();
    let dropped = defs.len() - kept.len();
    if dropped > 0 {
        debug!(dropped, "virtual-column gc dropped unreferenced columns");
    }

    // generated names owned by a sub-query (referenced here, defined there)
    // must not be claimed by renumbering
    let foreign: BTreeSet<String> = refs
        .iter()
        .filter(|r| is_generated_name(r) && !defs.iter().any(|d| &d.name == *r))
        .cloned()
        .collect();

    let mut rename: BTreeMap<String, String> = BTreeMap::new();
    let mut next = 0usize;
    for def in &kept {
        if is_generated_name(&def.name) {
            let new_name = loop {
                let candidate = format!("v{next}");
                next += 1;
                if !foreign.contains(&candidate) {
                    break candidate;
                }
            };
            if new_name != def.name {
                rename.insert(def.name.clone(), new_name);
            }
        }
    }

    *query.virtual_columns_mut() = kept;
    if !rename.is_empty() {
        let map: HashMap<String, String> = rename.into_iter().collect();
        query.rename_column_refs(&move |name| map.get(name).cloned());
    }

    // a rewrite must never leave a dangling generated reference behind
    let defined: BTreeSet<String> = query
        .virtual_columns()
        .iter()
        .map(|d| d.name.clone())
        .collect();
    let mut final_refs = BTreeSet::new();
    query.referenced_columns(&mut final_refs);
    for r in final_refs {
        if is_generated_name(&r) && !defined.contains(&r) && !foreign.contains(&r) {
            return Err(BasaltError::internal(format!(
                "virtual column [{r}] is referenced but not defined"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_nquery::types::{ColumnType, RowSignature};
    use basalt_nquery::{
        ContextMap, Interval, ScanOrder, ScanQuery, ScanResultFormat,
    };

    fn scan(data_source: DataSource, columns: Vec<&str>, vcols: Vec<VirtualColumn>) -> NativeQuery {
        let column_types = columns.iter().map(|_| ColumnType::String).collect();
        NativeQuery::Scan(ScanQuery {
            data_source,
            intervals: vec![Interval::ETERNITY],
            filter: None,
            virtual_columns: vcols,
            columns: columns.into_iter().map(str::to_string).collect(),
            column_types,
            order: ScanOrder::None,
            order_by: vec![],
            limit: None,
            offset: None,
            result_format: ScanResultFormat::CompactedList,
            context: ContextMap::new(),
        })
    }

    fn ctx_with_map(entries: &[(&str, serde_json::Value)]) -> PlannerContext {
        use chrono::TimeZone;
        let map: ContextMap = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        PlannerContext::new(
            crate::context::PlannerConfig::default(),
            &map,
            chrono::Utc.timestamp_millis_opt(1577836800000).unwrap(),
        )
        .unwrap()
    }

    fn key_set_join(keys: &[&str]) -> DataSource {
        DataSource::Join {
            left: Box::new(DataSource::table("numfoo")),
            right: Box::new(DataSource::Inline {
                column_names: vec!["k".to_string()],
                column_types: vec![ColumnType::String],
                rows: keys.iter().map(|k| vec![ScalarValue::from(*k)]).collect(),
            }),
            right_prefix: "j0.".to_string(),
            condition: "(\"dim1\" == \"j0.k\")".to_string(),
            join_type: JoinType::Inner,
            join_algorithm: None,
        }
    }

    #[test]
    fn join_against_inline_keys_becomes_in_filter() {
        let mut query = scan(key_set_join(&["a", "b"]), vec!["dim1"], vec![]);
        let ctx = ctx_with_map(&[]);
        run(&mut query, &ctx).unwrap();
        let DataSource::Filtered { base, filter } = query.data_source() else {
            panic!("expected filtered datasource, got {:?}", query.data_source());
        };
        assert_eq!(base.as_ref(), &DataSource::table("numfoo"));
        assert_eq!(
            filter,
            &DimFilter::In {
                column: "dim1".to_string(),
                match_value_type: ColumnType::String,
                values: vec![ScalarValue::from("a"), ScalarValue::from("b")],
            }
        );
    }

    #[test]
    fn join_rewrite_respects_toggle() {
        let mut query = scan(key_set_join(&["a", "b"]), vec!["dim1"], vec![]);
        let ctx = ctx_with_map(&[(
            crate::context::keys::REWRITE_JOIN_TO_FILTER,
            serde_json::json!(false),
        )]);
        run(&mut query, &ctx).unwrap();
        assert!(matches!(query.data_source(), DataSource::Join { .. }));
    }

    #[test]
    fn join_rewrite_skipped_when_right_columns_are_projected() {
        let mut query = scan(key_set_join(&["a"]), vec!["dim1", "j0.k"], vec![]);
        let ctx = ctx_with_map(&[]);
        run(&mut query, &ctx).unwrap();
        assert!(matches!(query.data_source(), DataSource::Join { .. }));
    }

    #[test]
    fn join_rewrite_skipped_on_null_keys() {
        let join = DataSource::Join {
            left: Box::new(DataSource::table("numfoo")),
            right: Box::new(DataSource::Inline {
                column_names: vec!["k".to_string()],
                column_types: vec![ColumnType::String],
                rows: vec![vec![ScalarValue::from("a")], vec![ScalarValue::Null]],
            }),
            right_prefix: "j0.".to_string(),
            condition: "(\"dim1\" == \"j0.k\")".to_string(),
            join_type: JoinType::Inner,
            join_algorithm: None,
        };
        let mut query = scan(join, vec!["dim1"], vec![]);
        let ctx = ctx_with_map(&[]);
        run(&mut query, &ctx).unwrap();
        assert!(matches!(query.data_source(), DataSource::Join { .. }));
    }

    #[test]
    fn value_columns_require_their_toggle() {
        let join = |ctx_entries: &[(&str, serde_json::Value)]| {
            let join = DataSource::Join {
                left: Box::new(DataSource::table("numfoo")),
                right: Box::new(DataSource::Inline {
                    column_names: vec!["k".to_string(), "v".to_string()],
                    column_types: vec![ColumnType::String, ColumnType::String],
                    rows: vec![vec![ScalarValue::from("a"), ScalarValue::from("x")]],
                }),
                right_prefix: "j0.".to_string(),
                condition: "(\"dim1\" == \"j0.k\")".to_string(),
                join_type: JoinType::Inner,
                join_algorithm: None,
            };
            let mut query = scan(join, vec!["dim1"], vec![]);
            run(&mut query, &ctx_with_map(ctx_entries)).unwrap();
            query
        };
        let kept = join(&[]);
        assert!(matches!(kept.data_source(), DataSource::Join { .. }));
        let rewritten = join(&[(
            crate::context::keys::JOIN_FILTER_REWRITE_VALUE_COLUMNS,
            serde_json::json!(true),
        )]);
        assert!(matches!(rewritten.data_source(), DataSource::Filtered { .. }));
    }

    #[test]
    fn gc_drops_unreferenced_and_renumbers() {
        let vcols = vec![
            VirtualColumn::new("v0", "strlen(\"dim1\")", ColumnType::Long),
            VirtualColumn::new("v1", "upper(\"dim1\")", ColumnType::String),
            VirtualColumn::new("v2", "(\"v1\" == 'X')", ColumnType::Long),
        ];
        // only v2 is consumed directly; v1 stays live transitively, v0 drops
        let mut query = scan(DataSource::table("numfoo"), vec!["v2"], vcols);
        let ctx = ctx_with_map(&[]);
        run(&mut query, &ctx).unwrap();
        let names: Vec<&str> = query
            .virtual_columns()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(names, vec!["v0", "v1"]);
        // old v1 became v0, old v2 became v1, and the expression follows
        assert_eq!(query.virtual_columns()[0].expression, "upper(\"dim1\")");
        assert_eq!(query.virtual_columns()[1].expression, "(\"v0\" == 'X')");
        let NativeQuery::Scan(s) = &query else {
            unreachable!()
        };
        assert_eq!(s.columns, vec!["v1".to_string()]);
    }

    #[test]
    fn gc_leaves_fully_referenced_registrations_alone() {
        let vcols = vec![VirtualColumn::new(
            "v0",
            "strlen(\"dim1\")",
            ColumnType::Long,
        )];
        let mut query = scan(DataSource::table("numfoo"), vec!["dim1", "v0"], vcols.clone());
        let ctx = ctx_with_map(&[]);
        run(&mut query, &ctx).unwrap();
        assert_eq!(query.virtual_columns(), vcols.as_slice());
    }
}

use std::collections::HashMap;

use basalt_common::{BasaltError, Result, ScalarValue};
use basalt_nquery::types::{ColumnType, RowSignature};
use basalt_nquery::{
    AggregatorSpec, DimFilter, DimensionSpec, Direction, GroupByQuery, Granularity, HavingSpec,
    Interval, LimitSpec, NativeQuery, OrderByColumnSpec, PostAggregatorSpec, ScanOrder,
    ScanQuery, ScanResultFormat, StringComparator, TimeseriesQuery, TopNMetricSpec, TopNQuery,
};
use tracing::debug;

use crate::context::{keys, PlannerContext, PlanningMode};
use crate::datasource::{BuiltSource, DataSourceBuilder};
use crate::expression::{ExpressionCompiler, VirtualColumnRegistry};
use crate::filter::FilterCompiler;
use crate::rel::{AggCall, RelExpr, RelNode, ScalarOp, SortField, TIME_COLUMN};

/// Decomposed view of the relational stack above the datasource base:
/// `Sort? -> Project? -> (Having-Filter? Aggregate)? -> Filter? -> base`.
struct PlanParts<'p> {
    sort_fields: &'p [SortField],
    limit: Option<u64>,
    offset: Option<u64>,
    project: Option<&'p [(RelExpr, String)]>,
    having: Option<&'p RelExpr>,
    aggregate: Option<(&'p [(RelExpr, String)], &'p [(AggCall, String)])>,
    where_predicate: Option<&'p RelExpr>,
    base: &'p RelNode,
}

fn decompose(rel: &RelNode) -> PlanParts<'_> {
    let mut parts = PlanParts {
        sort_fields: &[],
        limit: None,
        offset: None,
        project: None,
        having: None,
        aggregate: None,
        where_predicate: None,
        base: rel,
    };
    let mut node = rel;
    if let RelNode::Sort {
        fields,
        limit,
        offset,
        input,
    } = node
    {
        parts.sort_fields = fields;
        parts.limit = *limit;
        parts.offset = *offset;
        node = input.as_ref();
    }
    if let RelNode::Project { exprs, input } = node {
        parts.project = Some(exprs);
        node = input.as_ref();
    }
    if let RelNode::Filter { predicate, input } = node {
        if matches!(input.as_ref(), RelNode::Aggregate { .. }) {
            parts.having = Some(predicate);
            node = input.as_ref();
        }
    }
    if let RelNode::Aggregate {
        group_exprs,
        agg_exprs,
        input,
    } = node
    {
        parts.aggregate = Some((group_exprs, agg_exprs));
        node = input.as_ref();
    }
    if let RelNode::Filter { predicate, input } = node {
        parts.where_predicate = Some(predicate);
        node = input.as_ref();
    }
    parts.base = node;
    parts
}

/// Compile a relational plan into exactly one native query plus its
/// caller-facing output signature. Runs once per (sub-)query level; shape
/// selection never re-enters.
pub fn build_native_query(
    ctx: &PlannerContext,
    rel: &RelNode,
) -> Result<(NativeQuery, RowSignature)> {
    let (query, outputs) = build_query_internal(ctx, rel)?;
    Ok((query, external_signature(ctx, &outputs)))
}

/// A compiled sub-query together with the signature of its *native* output
/// columns and the aliases mapping relational output names onto them (a
/// projected expression is emitted under its virtual column name, not its
/// relational alias).
pub(crate) struct SubQuery {
    pub query: NativeQuery,
    pub signature: RowSignature,
    pub aliases: HashMap<String, String>,
}

/// Compile a relational plan for use as a `Query` datasource.
pub(crate) fn build_subquery(ctx: &PlannerContext, rel: &RelNode) -> Result<SubQuery> {
    let (query, outputs) = build_query_internal(ctx, rel)?;
    let mut b = RowSignature::builder();
    let mut aliases = HashMap::new();
    for o in &outputs {
        b = b.add(o.native.clone(), o.native_type.clone());
        if o.name != o.native {
            aliases.insert(o.name.clone(), o.native.clone());
        }
    }
    Ok(SubQuery {
        query,
        signature: b.build(),
        aliases,
    })
}

fn build_query_internal(
    ctx: &PlannerContext,
    rel: &RelNode,
) -> Result<(NativeQuery, Vec<OutputColumn>)> {
    let parts = decompose(rel);

    let mut registry = VirtualColumnRegistry::new();
    let built = DataSourceBuilder::new(ctx, &mut registry)
        .build(parts.base, parts.where_predicate)?;
    let BuiltSource {
        source,
        signature: base_sig,
        aliases,
        residual_filter,
    } = built;

    let (intervals, filter) = extract_intervals(residual_filter);
    if ctx.config.require_time_condition && intervals == vec![Interval::ETERNITY] {
        return Err(BasaltError::invalid_input(
            "query requires a time condition and none was given".to_string(),
        ));
    }

    let mut query = match parts.aggregate {
        None => build_scan(ctx, &parts, source, &base_sig, &aliases, registry, intervals, filter)?,
        Some((group_exprs, agg_exprs)) => build_aggregate(
            ctx, &parts, group_exprs, agg_exprs, source, &base_sig, &aliases, registry,
            intervals, filter,
        )?,
    };

    crate::rewrite::run(&mut query.0, ctx)?;
    Ok(query)
}

/// Pull top-level `__time` range conjuncts out of the filter and intersect
/// them into the query's interval list.
fn extract_intervals(filter: Option<DimFilter>) -> (Vec<Interval>, Option<DimFilter>) {
    fn time_interval(f: &DimFilter) -> Option<Interval> {
        match f {
            DimFilter::Range {
                column,
                match_value_type: ColumnType::Long,
                lower,
                upper,
                lower_open,
                upper_open,
            } if column == TIME_COLUMN => {
                let start = match lower {
                    Some(ScalarValue::Long(v)) => {
                        if *lower_open {
                            v.saturating_add(1)
                        } else {
                            *v
                        }
                    }
                    None => i64::MIN,
                    _ => return None,
                };
                let end = match upper {
                    Some(ScalarValue::Long(v)) => {
                        if *upper_open {
                            *v
                        } else {
                            v.saturating_add(1)
                        }
                    }
                    None => i64::MAX,
                    _ => return None,
                };
                Some(Interval::new(start, end))
            }
            DimFilter::Equality {
                column,
                match_value_type: ColumnType::Long,
                match_value: ScalarValue::Long(v),
            } if column == TIME_COLUMN => Some(Interval::new(*v, v.saturating_add(1))),
            _ => None,
        }
    }

    let Some(filter) = filter else {
        return (vec![Interval::ETERNITY], None);
    };
    let fields = match filter {
        DimFilter::And { fields } => fields,
        single => vec![single],
    };
    let mut interval = Interval::ETERNITY;
    let mut rest = Vec::new();
    for f in fields {
        match time_interval(&f) {
            Some(iv) => {
                interval = Interval::new(
                    interval.start.max(iv.start),
                    interval.end.min(iv.end),
                );
            }
            None => rest.push(f),
        }
    }
    let remaining = match DimFilter::and(rest) {
        DimFilter::True => None,
        other => Some(other),
    };
    (vec![interval], remaining)
}

/// One output column of the projected result.
struct OutputColumn {
    /// External (caller-facing) name.
    name: String,
    /// Native column referenced by the query.
    native: String,
    /// Native column type before any result stringification.
    native_type: ColumnType,
}

fn compile_projection(
    ctx: &PlannerContext,
    parts_project: Option<&[(RelExpr, String)]>,
    base_rel: &RelNode,
    base_sig: &RowSignature,
    aliases: &HashMap<String, String>,
    registry: &mut VirtualColumnRegistry,
) -> Result<Vec<OutputColumn>> {
    let compiler = ExpressionCompiler::new(ctx, base_sig, aliases);
    match parts_project {
        Some(exprs) => exprs
            .iter()
            .map(|(e, name)| {
                let compiled = compiler.compile(e)?;
                let native_type = compiled.output_type.clone();
                let native = registry.reference(&compiled);
                Ok(OutputColumn {
                    name: name.clone(),
                    native,
                    native_type,
                })
            })
            .collect(),
        None => {
            // no projection: emit the base's relational output columns as-is
            let rel_sig = base_rel.output_signature()?;
            rel_sig
                .iter()
                .map(|(name, t)| {
                    let native = aliases
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| name.to_string());
                    Ok(OutputColumn {
                        name: name.to_string(),
                        native,
                        native_type: t.clone(),
                    })
                })
                .collect()
        }
    }
}

/// Caller-facing type after result stringification: array-typed outputs
/// render as JSON strings unless the context opts out.
fn external_type(ctx: &PlannerContext, t: &ColumnType) -> ColumnType {
    if ctx.query_context.stringify_arrays && t.is_array() {
        ColumnType::String
    } else {
        t.clone()
    }
}

fn external_signature(ctx: &PlannerContext, outputs: &[OutputColumn]) -> RowSignature {
    let mut b = RowSignature::builder();
    for out in outputs {
        b = b.add(out.name.clone(), external_type(ctx, &out.native_type));
    }
    b.build()
}

#[allow(clippy::too_many_arguments)]
fn build_scan(
    ctx: &PlannerContext,
    parts: &PlanParts<'_>,
    source: basalt_nquery::DataSource,
    base_sig: &RowSignature,
    aliases: &HashMap<String, String>,
    mut registry: VirtualColumnRegistry,
    intervals: Vec<Interval>,
    filter: Option<DimFilter>,
) -> Result<(NativeQuery, Vec<OutputColumn>)> {
    let outputs = compile_projection(ctx, parts.project, parts.base, base_sig, aliases, &mut registry)?;
    let columns: Vec<String> = outputs.iter().map(|o| o.native.clone()).collect();
    let column_types: Vec<ColumnType> = outputs.iter().map(|o| o.native_type.clone()).collect();

    // only single-direction ordering by time is representable in a scan
    let order = match parts.sort_fields {
        [] => ScanOrder::None,
        [field] if field.column == TIME_COLUMN => {
            if field.descending {
                ScanOrder::Descending
            } else {
                ScanOrder::Ascending
            }
        }
        other_fields => {
            return build_ordered_scan(
                ctx,
                parts,
                other_fields,
                outputs,
                source,
                registry,
                intervals,
                filter,
            );
        }
    };

    debug!(query_type = "scan", columns = columns.len(), "selected query shape");
    let query = NativeQuery::Scan(ScanQuery {
        data_source: source,
        intervals,
        filter,
        virtual_columns: registry.into_columns(),
        columns,
        column_types,
        order,
        order_by: vec![],
        limit: parts.limit,
        offset: parts.offset,
        result_format: ScanResultFormat::CompactedList,
        context: ctx.native_query_context(),
    });
    Ok((query, outputs))
}

/// Non-time scan ordering: rejected in coupled mode, expressed as an outer
/// ordered scan over a sub-query in decoupled mode.
#[allow(clippy::too_many_arguments)]
fn build_ordered_scan(
    ctx: &PlannerContext,
    parts: &PlanParts<'_>,
    sort_fields: &[SortField],
    outputs: Vec<OutputColumn>,
    source: basalt_nquery::DataSource,
    registry: VirtualColumnRegistry,
    intervals: Vec<Interval>,
    filter: Option<DimFilter>,
) -> Result<(NativeQuery, Vec<OutputColumn>)> {
    if ctx.config.planning_mode == PlanningMode::Coupled {
        return Err(BasaltError::invalid_input(
            "cannot order a scan by non-time columns".to_string(),
        ));
    }

    let order_by = sort_fields
        .iter()
        .map(|field| {
            let out = outputs
                .iter()
                .find(|o| o.name == field.column || o.native == field.column)
                .ok_or_else(|| {
                    BasaltError::invalid_input(format!(
                        "cannot order by unprojected column [{}]",
                        field.column
                    ))
                })?;
            Ok(OrderByColumnSpec {
                dimension: out.native.clone(),
                direction: if field.descending {
                    Direction::Descending
                } else {
                    Direction::Ascending
                },
                dimension_order: if out.native_type.is_numeric() {
                    StringComparator::Numeric
                } else {
                    StringComparator::Lexicographic
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let columns: Vec<String> = outputs.iter().map(|o| o.native.clone()).collect();
    let column_types: Vec<ColumnType> = outputs.iter().map(|o| o.native_type.clone()).collect();

    let inner = ScanQuery {
        data_source: source,
        intervals: intervals.clone(),
        filter,
        virtual_columns: registry.into_columns(),
        columns: columns.clone(),
        column_types: column_types.clone(),
        order: ScanOrder::None,
        order_by: vec![],
        limit: None,
        offset: None,
        result_format: ScanResultFormat::CompactedList,
        context: ctx.native_query_context(),
    };
    debug!(query_type = "scan", wrapped = true, "selected query shape");
    let outer = ScanQuery {
        data_source: basalt_nquery::DataSource::Query {
            query: Box::new(NativeQuery::Scan(inner)),
        },
        intervals: vec![Interval::ETERNITY],
        filter: None,
        virtual_columns: vec![],
        columns,
        column_types,
        order: ScanOrder::None,
        order_by,
        limit: parts.limit,
        offset: parts.offset,
        result_format: ScanResultFormat::CompactedList,
        context: ctx.native_query_context(),
    };
    Ok((NativeQuery::Scan(outer), outputs))
}

/// A compiled aggregate call: helper aggregators plus an optional finalizing
/// post-aggregator (AVG).
struct CompiledAgg {
    aggregators: Vec<AggregatorSpec>,
    post_aggregator: Option<PostAggregatorSpec>,
    output_type: ColumnType,
}

fn compile_agg_call(
    ctx: &PlannerContext,
    call: &AggCall,
    name: &str,
    base_sig: &RowSignature,
    aliases: &HashMap<String, String>,
    registry: &mut VirtualColumnRegistry,
) -> Result<CompiledAgg> {
    let reference = |registry: &mut VirtualColumnRegistry, e: &RelExpr| -> Result<(String, ColumnType)> {
        let compiled = ExpressionCompiler::new(ctx, base_sig, aliases).compile(e)?;
        let t = compiled.output_type.clone();
        Ok((registry.reference(&compiled), t))
    };
    match call {
        AggCall::Count => Ok(CompiledAgg {
            aggregators: vec![AggregatorSpec::Count {
                name: name.to_string(),
            }],
            post_aggregator: None,
            output_type: ColumnType::Long,
        }),
        AggCall::Sum(e) | AggCall::Min(e) | AggCall::Max(e) => {
            let (field_name, t) = reference(registry, e)?;
            let long = t == ColumnType::Long;
            let aggregator = match (call, long) {
                (AggCall::Sum(_), true) => AggregatorSpec::LongSum {
                    name: name.to_string(),
                    field_name,
                },
                (AggCall::Sum(_), false) => AggregatorSpec::DoubleSum {
                    name: name.to_string(),
                    field_name,
                },
                (AggCall::Min(_), true) => AggregatorSpec::LongMin {
                    name: name.to_string(),
                    field_name,
                },
                (AggCall::Min(_), false) => AggregatorSpec::DoubleMin {
                    name: name.to_string(),
                    field_name,
                },
                (AggCall::Max(_), true) => AggregatorSpec::LongMax {
                    name: name.to_string(),
                    field_name,
                },
                (AggCall::Max(_), false) => AggregatorSpec::DoubleMax {
                    name: name.to_string(),
                    field_name,
                },
                _ => unreachable!("matched above"),
            };
            let output_type = aggregator.output_type();
            Ok(CompiledAgg {
                aggregators: vec![aggregator],
                post_aggregator: None,
                output_type,
            })
        }
        AggCall::Avg(e) => {
            let (field_name, t) = reference(registry, e)?;
            let sum_name = format!("{name}:sum");
            let count_name = format!("{name}:count");
            let sum = if t == ColumnType::Long {
                AggregatorSpec::LongSum {
                    name: sum_name.clone(),
                    field_name,
                }
            } else {
                AggregatorSpec::DoubleSum {
                    name: sum_name.clone(),
                    field_name,
                }
            };
            Ok(CompiledAgg {
                aggregators: vec![
                    sum,
                    AggregatorSpec::Count {
                        name: count_name.clone(),
                    },
                ],
                post_aggregator: Some(PostAggregatorSpec::Arithmetic {
                    name: name.to_string(),
                    function: "quotient".to_string(),
                    fields: vec![
                        PostAggregatorSpec::FieldAccess {
                            name: None,
                            field_name: sum_name,
                        },
                        PostAggregatorSpec::FieldAccess {
                            name: None,
                            field_name: count_name,
                        },
                    ],
                }),
                output_type: ColumnType::Double,
            })
        }
        AggCall::CountDistinct(e) => {
            if !ctx.config.use_approximate_count_distinct {
                return Err(BasaltError::invalid_input(
                    "exact COUNT(DISTINCT ...) is not supported; enable approximate count distinct"
                        .to_string(),
                ));
            }
            let (field_name, _) = reference(registry, e)?;
            Ok(CompiledAgg {
                aggregators: vec![AggregatorSpec::Cardinality {
                    name: name.to_string(),
                    fields: vec![field_name],
                    by_row: false,
                }],
                post_aggregator: None,
                output_type: ColumnType::Long,
            })
        }
        AggCall::Filtered { predicate, inner } => {
            let filter = FilterCompiler::new(ctx, base_sig, aliases, registry)
                .compile_root(predicate)?;
            let compiled = compile_agg_call(ctx, inner, name, base_sig, aliases, registry)?;
            match filter {
                None => Ok(compiled),
                Some(filter) => Ok(CompiledAgg {
                    aggregators: compiled
                        .aggregators
                        .into_iter()
                        .map(|aggregator| AggregatorSpec::Filtered {
                            filter: filter.clone(),
                            aggregator: Box::new(aggregator),
                        })
                        .collect(),
                    post_aggregator: compiled.post_aggregator,
                    output_type: compiled.output_type,
                }),
            }
        }
    }
}

/// `TIME_FLOOR(__time, 'P...')` as the sole grouping expression bucketizes by
/// granularity instead of grouping by a dimension.
fn time_floor_period(expr: &RelExpr, aliases: &HashMap<String, String>) -> Option<String> {
    let RelExpr::Call {
        op: ScalarOp::TimeFloor,
        args,
    } = expr
    else {
        return None;
    };
    let RelExpr::Column(col) = args.first()? else {
        return None;
    };
    let native = aliases.get(col).map(String::as_str).unwrap_or(col);
    if native != TIME_COLUMN {
        return None;
    }
    args.get(1)?.as_literal()?.as_str().map(str::to_string)
}

#[allow(clippy::too_many_arguments)]
fn build_aggregate(
    ctx: &PlannerContext,
    parts: &PlanParts<'_>,
    group_exprs: &[(RelExpr, String)],
    agg_exprs: &[(AggCall, String)],
    source: basalt_nquery::DataSource,
    base_sig: &RowSignature,
    aliases: &HashMap<String, String>,
    mut registry: VirtualColumnRegistry,
    intervals: Vec<Interval>,
    filter: Option<DimFilter>,
) -> Result<(NativeQuery, Vec<OutputColumn>)> {
    // timeseries candidacy: grouping over the whole input, or by time floor
    let sole_time_floor = match group_exprs {
        [(expr, name)] => time_floor_period(expr, aliases).map(|p| (p, name.clone())),
        _ => None,
    };

    // dimensions (skipped for the pure time-floor timeseries shape)
    let mut dimensions: Vec<DimensionSpec> = Vec::new();
    let mut agg_output = RowSignature::builder();
    let timeseries_eligible = (group_exprs.is_empty() || sole_time_floor.is_some())
        && parts.having.is_none()
        && parts.limit.is_none()
        && parts.offset.is_none()
        && sort_compatible_with_timeseries(parts.sort_fields, &sole_time_floor);

    if !timeseries_eligible || sole_time_floor.is_none() {
        let compiler = ExpressionCompiler::new(ctx, base_sig, aliases);
        for (expr, name) in group_exprs {
            let compiled = compiler.compile(expr)?;
            let output_type = compiled.output_type.clone();
            let dimension = registry.reference(&compiled);
            dimensions.push(DimensionSpec::default_spec(
                dimension,
                name.clone(),
                output_type.clone(),
            ));
            agg_output = agg_output.add(name.clone(), output_type);
        }
    } else if let Some((_, name)) = &sole_time_floor {
        agg_output = agg_output.add(name.clone(), ColumnType::Long);
    }

    // the time bucket of a timeseries is emitted as the native `__time`
    // column, not under its relational alias
    let mut agg_aliases: HashMap<String, String> = HashMap::new();
    if timeseries_eligible {
        if let Some((_, name)) = &sole_time_floor {
            agg_aliases.insert(name.clone(), TIME_COLUMN.to_string());
        }
    }

    let mut aggregations: Vec<AggregatorSpec> = Vec::new();
    let mut post_aggregations: Vec<PostAggregatorSpec> = Vec::new();
    for (call, name) in agg_exprs {
        let compiled = compile_agg_call(ctx, call, name, base_sig, aliases, &mut registry)?;
        aggregations.extend(compiled.aggregators);
        if let Some(pa) = compiled.post_aggregator {
            post_aggregations.push(pa);
        }
        agg_output = agg_output.add(name.clone(), compiled.output_type);
    }
    let agg_output = agg_output.build();

    // HAVING over the aggregate output
    let having = match parts.having {
        Some(predicate) => compile_having(ctx, predicate, &agg_output)?,
        None => None,
    };

    // projection above the aggregate: identity passthrough or expression
    // post-aggregators over the aggregate outputs
    let mut outputs: Vec<OutputColumn> = Vec::new();
    if let Some(exprs) = parts.project {
        // project expressions render against native output names, so the
        // aliased time bucket needs `__time` resolvable
        let render_sig = if agg_aliases.is_empty() {
            agg_output.clone()
        } else {
            let mut b = RowSignature::builder().add(TIME_COLUMN, ColumnType::Long);
            for (n, t) in agg_output.iter() {
                b = b.add(n, t.clone());
            }
            b.build()
        };
        let compiler = ExpressionCompiler::new(ctx, &render_sig, &agg_aliases);
        for (idx, (expr, name)) in exprs.iter().enumerate() {
            match expr {
                RelExpr::Column(col) if col == name => {
                    let t = agg_output.column_type(col).ok_or_else(|| {
                        BasaltError::invalid_input(format!("unknown column [{col}]"))
                    })?;
                    outputs.push(OutputColumn {
                        name: name.clone(),
                        native: agg_aliases.get(col).cloned().unwrap_or_else(|| col.clone()),
                        native_type: t.clone(),
                    });
                }
                other => {
                    let compiled = compiler.compile(other)?;
                    let post_name = if agg_output.contains(name) {
                        format!("p{idx}")
                    } else {
                        name.clone()
                    };
                    post_aggregations.push(PostAggregatorSpec::Expression {
                        name: post_name.clone(),
                        expression: compiled.expression,
                        output_type: Some(compiled.output_type.clone()),
                    });
                    outputs.push(OutputColumn {
                        name: name.clone(),
                        native: post_name,
                        native_type: compiled.output_type,
                    });
                }
            }
        }
    } else {
        for (name, t) in agg_output.iter() {
            outputs.push(OutputColumn {
                name: name.to_string(),
                native: agg_aliases
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name.to_string()),
                native_type: t.clone(),
            });
        }
    }

    // ---- shape selection ----

    if timeseries_eligible {
        let granularity = match &sole_time_floor {
            Some((period, _)) => Granularity::Period {
                period: period.clone(),
                time_zone: ctx.time_zone.to_string(),
                origin: None,
            },
            None => Granularity::All,
        };
        let descending = parts
            .sort_fields
            .first()
            .map(|f| f.descending)
            .unwrap_or(false);
        let mut context = ctx.native_query_context();
        // SQL grouping semantics never produce empty buckets unless asked to
        context
            .entry(keys::SKIP_EMPTY_BUCKETS.to_string())
            .or_insert(serde_json::Value::Bool(true));
        debug!(query_type = "timeseries", "selected query shape");
        let query = NativeQuery::Timeseries(TimeseriesQuery {
            data_source: source,
            intervals,
            granularity,
            filter,
            virtual_columns: registry.into_columns(),
            aggregations,
            post_aggregations,
            descending,
            context,
        });
        return Ok((query, outputs));
    }

    if let Some(metric) = top_n_metric(ctx, parts, &dimensions, &agg_output, &outputs) {
        let threshold = parts.limit.expect("top-n requires a limit");
        debug!(query_type = "topN", threshold, "selected query shape");
        let query = NativeQuery::TopN(TopNQuery {
            data_source: source,
            intervals,
            granularity: Granularity::All,
            filter,
            virtual_columns: registry.into_columns(),
            dimension: dimensions.into_iter().next().expect("single dimension"),
            metric,
            threshold,
            aggregations,
            post_aggregations,
            context: ctx.native_query_context(),
        });
        return Ok((query, outputs));
    }

    let limit_spec = if parts.sort_fields.is_empty() && parts.limit.is_none() && parts.offset.is_none()
    {
        None
    } else {
        let columns = parts
            .sort_fields
            .iter()
            .map(|field| {
                // sorts reference external output names; map to native
                let (native, t) = match outputs.iter().find(|o| o.name == field.column) {
                    Some(o) => (o.native.clone(), o.native_type.clone()),
                    None => {
                        let t = agg_output.column_type(&field.column).ok_or_else(|| {
                            BasaltError::invalid_input(format!(
                                "cannot order by unknown column [{}]",
                                field.column
                            ))
                        })?;
                        (field.column.clone(), t.clone())
                    }
                };
                Ok(OrderByColumnSpec {
                    dimension: native,
                    direction: if field.descending {
                        Direction::Descending
                    } else {
                        Direction::Ascending
                    },
                    dimension_order: if t.is_numeric() {
                        StringComparator::Numeric
                    } else {
                        StringComparator::Lexicographic
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Some(LimitSpec::Default {
            columns,
            limit: parts.limit,
            offset: parts.offset,
        })
    };

    debug!(query_type = "groupBy", dimensions = dimensions.len(), "selected query shape");
    let query = NativeQuery::GroupBy(GroupByQuery {
        data_source: source,
        intervals,
        granularity: Granularity::All,
        filter,
        virtual_columns: registry.into_columns(),
        dimensions,
        aggregations,
        post_aggregations,
        having,
        limit_spec,
        context: ctx.native_query_context(),
    });
    Ok((query, outputs))
}

fn sort_compatible_with_timeseries(
    sort_fields: &[SortField],
    sole_time_floor: &Option<(String, String)>,
) -> bool {
    match sort_fields {
        [] => true,
        [field] => match sole_time_floor {
            Some((_, name)) => field.column == *name,
            None => false,
        },
        _ => false,
    }
}

/// TopN metric when the plan satisfies every TopN precondition; `None`
/// falls back to GroupBy.
fn top_n_metric(
    ctx: &PlannerContext,
    parts: &PlanParts<'_>,
    dimensions: &[DimensionSpec],
    agg_output: &RowSignature,
    outputs: &[OutputColumn],
) -> Option<TopNMetricSpec> {
    if dimensions.len() != 1 || parts.having.is_some() || parts.offset.is_some() {
        return None;
    }
    let limit = parts.limit?;
    if limit == 0 || limit > ctx.config.max_top_n_limit {
        return None;
    }
    let dimension = &dimensions[0];
    if dimension.output_type().is_array() {
        return None;
    }
    let field = match parts.sort_fields {
        // unordered limit (e.g. DISTINCT dim LIMIT n): lexicographic
        // dimension ordering when the toggle allows it
        [] => {
            if !ctx.use_lexicographic_top_n() {
                debug!(reason = "lexicographic top-n disabled", "top-n rejected");
                return None;
            }
            return Some(TopNMetricSpec::Dimension {
                ordering: Some(if dimension.output_type().is_numeric() {
                    StringComparator::Numeric
                } else {
                    StringComparator::Lexicographic
                }),
            });
        }
        [field] => field,
        _ => return None,
    };

    // ordering on the dimension itself: lexicographic top-N
    if field.column == dimension.output_name() {
        if !ctx.use_lexicographic_top_n() {
            debug!(reason = "lexicographic top-n disabled", "top-n rejected");
            return None;
        }
        let base = TopNMetricSpec::Dimension {
            ordering: Some(if dimension.output_type().is_numeric() {
                StringComparator::Numeric
            } else {
                StringComparator::Lexicographic
            }),
        };
        return Some(if field.descending {
            TopNMetricSpec::Inverted {
                metric: Box::new(base),
            }
        } else {
            base
        });
    }

    // ordering on an aggregator output: numeric top-N
    let is_metric = agg_output.contains(&field.column)
        || outputs.iter().any(|o| o.native == field.column);
    if is_metric && field.column != dimension.output_name() {
        if !ctx.config.use_approximate_top_n {
            debug!(reason = "approximate top-n disabled", "top-n rejected");
            return None;
        }
        let numeric = TopNMetricSpec::Numeric {
            metric: field.column.clone(),
        };
        return Some(if field.descending {
            numeric
        } else {
            TopNMetricSpec::Inverted {
                metric: Box::new(numeric),
            }
        });
    }
    None
}

/// HAVING compiles against the aggregate output columns. Virtual columns do
/// not exist post-aggregation, so predicates needing one fall back to a raw
/// expression filter over the output columns. Always-true predicates attach
/// nothing (though their presence still forces the GroupBy shape).
fn compile_having(
    ctx: &PlannerContext,
    predicate: &RelExpr,
    agg_output: &RowSignature,
) -> Result<Option<HavingSpec>> {
    let aliases = HashMap::new();
    let mut scratch = VirtualColumnRegistry::new();
    let filter = FilterCompiler::new(ctx, agg_output, &aliases, &mut scratch)
        .compile_root(predicate)?;
    let filter = if scratch.columns().is_empty() {
        filter
    } else {
        let compiled = ExpressionCompiler::new(ctx, agg_output, &aliases).compile(predicate)?;
        Some(DimFilter::Expression {
            expression: compiled.expression,
        })
    };
    Ok(filter.map(|filter| HavingSpec::Filter { filter }))
}

use std::collections::BTreeSet;

use basalt_common::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::datasource::DataSource;
use crate::expression::VirtualColumn;
use crate::filter::{collect_quoted_identifiers, rename_quoted_identifiers, DimFilter};
use crate::time::{Granularity, Interval};
use crate::types::ColumnType;

/// Per-query context map echoed into the emitted native query.
///
/// A `BTreeMap` keeps serialization order deterministic.
pub type ContextMap = std::collections::BTreeMap<String, serde_json::Value>;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Ascending,
    Descending,
}

/// Comparator used for ordering string-typed dimension values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StringComparator {
    Lexicographic,
    Numeric,
}

/// One ordering column of a grouping limit spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByColumnSpec {
    pub dimension: String,
    pub direction: Direction,
    pub dimension_order: StringComparator,
}

/// Limit/ordering spec attached to grouping queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LimitSpec {
    Default {
        columns: Vec<OrderByColumnSpec>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
    },
}

/// Post-aggregation HAVING, GroupBy only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HavingSpec {
    Filter { filter: DimFilter },
}

/// Grouping dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DimensionSpec {
    #[serde(rename_all = "camelCase")]
    Default {
        dimension: String,
        output_name: String,
        output_type: ColumnType,
    },
}

impl DimensionSpec {
    pub fn default_spec(
        dimension: impl Into<String>,
        output_name: impl Into<String>,
        output_type: ColumnType,
    ) -> DimensionSpec {
        DimensionSpec::Default {
            dimension: dimension.into(),
            output_name: output_name.into(),
            output_type,
        }
    }

    pub fn dimension(&self) -> &str {
        match self {
            DimensionSpec::Default { dimension, .. } => dimension,
        }
    }

    pub fn output_name(&self) -> &str {
        match self {
            DimensionSpec::Default { output_name, .. } => output_name,
        }
    }

    pub fn output_type(&self) -> &ColumnType {
        match self {
            DimensionSpec::Default { output_type, .. } => output_type,
        }
    }
}

/// Aggregation function applied by timeseries/grouping/top-N queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregatorSpec {
    Count {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    LongSum { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleSum { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    LongMin { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    LongMax { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleMin { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleMax { name: String, field_name: String },
    /// Approximate count-distinct over the named fields.
    #[serde(rename_all = "camelCase")]
    Cardinality {
        name: String,
        fields: Vec<String>,
        by_row: bool,
    },
    /// Aggregate only over rows matching `filter`.
    Filtered {
        filter: DimFilter,
        aggregator: Box<AggregatorSpec>,
    },
}

impl AggregatorSpec {
    /// Output column name of this aggregator.
    pub fn name(&self) -> &str {
        match self {
            AggregatorSpec::Count { name }
            | AggregatorSpec::LongSum { name, .. }
            | AggregatorSpec::DoubleSum { name, .. }
            | AggregatorSpec::LongMin { name, .. }
            | AggregatorSpec::LongMax { name, .. }
            | AggregatorSpec::DoubleMin { name, .. }
            | AggregatorSpec::DoubleMax { name, .. }
            | AggregatorSpec::Cardinality { name, .. } => name,
            AggregatorSpec::Filtered { aggregator, .. } => aggregator.name(),
        }
    }

    /// Finalized output type of this aggregator.
    pub fn output_type(&self) -> ColumnType {
        match self {
            AggregatorSpec::Count { .. }
            | AggregatorSpec::LongSum { .. }
            | AggregatorSpec::LongMin { .. }
            | AggregatorSpec::LongMax { .. }
            | AggregatorSpec::Cardinality { .. } => ColumnType::Long,
            AggregatorSpec::DoubleSum { .. }
            | AggregatorSpec::DoubleMin { .. }
            | AggregatorSpec::DoubleMax { .. } => ColumnType::Double,
            AggregatorSpec::Filtered { aggregator, .. } => aggregator.output_type(),
        }
    }

    /// Collect the input column names this aggregator reads.
    pub fn referenced_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            AggregatorSpec::Count { .. } => {}
            AggregatorSpec::LongSum { field_name, .. }
            | AggregatorSpec::DoubleSum { field_name, .. }
            | AggregatorSpec::LongMin { field_name, .. }
            | AggregatorSpec::LongMax { field_name, .. }
            | AggregatorSpec::DoubleMin { field_name, .. }
            | AggregatorSpec::DoubleMax { field_name, .. } => {
                out.insert(field_name.clone());
            }
            AggregatorSpec::Cardinality { fields, .. } => {
                out.extend(fields.iter().cloned());
            }
            AggregatorSpec::Filtered { filter, aggregator } => {
                filter.referenced_columns(out);
                aggregator.referenced_columns(out);
            }
        }
    }

    /// Rewrite the input column names this aggregator reads.
    pub fn rename_columns(&mut self, rename: &dyn Fn(&str) -> Option<String>) {
        match self {
            AggregatorSpec::Count { .. } => {}
            AggregatorSpec::LongSum { field_name, .. }
            | AggregatorSpec::DoubleSum { field_name, .. }
            | AggregatorSpec::LongMin { field_name, .. }
            | AggregatorSpec::LongMax { field_name, .. }
            | AggregatorSpec::DoubleMin { field_name, .. }
            | AggregatorSpec::DoubleMax { field_name, .. } => {
                if let Some(new) = rename(field_name) {
                    *field_name = new;
                }
            }
            AggregatorSpec::Cardinality { fields, .. } => {
                for f in fields {
                    if let Some(new) = rename(f) {
                        *f = new;
                    }
                }
            }
            AggregatorSpec::Filtered { filter, aggregator } => {
                filter.rename_columns(rename);
                aggregator.rename_columns(rename);
            }
        }
    }
}

/// Post-aggregation computed over aggregator outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PostAggregatorSpec {
    Arithmetic {
        name: String,
        #[serde(rename = "fn")]
        function: String,
        fields: Vec<PostAggregatorSpec>,
    },
    #[serde(rename_all = "camelCase")]
    FieldAccess {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        field_name: String,
    },
    Constant {
        name: String,
        value: ScalarValue,
    },
    #[serde(rename_all = "camelCase")]
    Expression {
        name: String,
        expression: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_type: Option<ColumnType>,
    },
}

impl PostAggregatorSpec {
    /// Output column name, when this node is a named output.
    pub fn name(&self) -> Option<&str> {
        match self {
            PostAggregatorSpec::Arithmetic { name, .. }
            | PostAggregatorSpec::Constant { name, .. }
            | PostAggregatorSpec::Expression { name, .. } => Some(name),
            PostAggregatorSpec::FieldAccess { name, .. } => name.as_deref(),
        }
    }

    pub fn referenced_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            PostAggregatorSpec::Arithmetic { fields, .. } => {
                for f in fields {
                    f.referenced_columns(out);
                }
            }
            PostAggregatorSpec::FieldAccess { field_name, .. } => {
                out.insert(field_name.clone());
            }
            PostAggregatorSpec::Constant { .. } => {}
            PostAggregatorSpec::Expression { expression, .. } => {
                collect_quoted_identifiers(expression, out);
            }
        }
    }

    pub fn rename_columns(&mut self, rename: &dyn Fn(&str) -> Option<String>) {
        match self {
            PostAggregatorSpec::Arithmetic { fields, .. } => {
                for f in fields {
                    f.rename_columns(rename);
                }
            }
            PostAggregatorSpec::FieldAccess { field_name, .. } => {
                if let Some(new) = rename(field_name) {
                    *field_name = new;
                }
            }
            PostAggregatorSpec::Constant { .. } => {}
            PostAggregatorSpec::Expression { expression, .. } => {
                *expression = rename_quoted_identifiers(expression, rename);
            }
        }
    }
}

/// Ranking metric of a top-N query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TopNMetricSpec {
    /// Rank by an aggregator output, descending.
    Numeric { metric: String },
    /// Rank by the dimension value itself (lexicographic top-N).
    Dimension {
        #[serde(skip_serializing_if = "Option::is_none")]
        ordering: Option<StringComparator>,
    },
    /// Invert the wrapped metric's direction.
    Inverted { metric: Box<TopNMetricSpec> },
}

/// Result encoding of a scan query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanResultFormat {
    CompactedList,
}

/// Time ordering of a scan query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanOrder {
    #[default]
    None,
    Ascending,
    Descending,
}

impl ScanOrder {
    fn is_none(&self) -> bool {
        matches!(self, ScanOrder::None)
    }
}

/// Plain row scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanQuery {
    pub data_source: DataSource,
    pub intervals: Vec<Interval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DimFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    pub columns: Vec<String>,
    pub column_types: Vec<ColumnType>,
    #[serde(default, skip_serializing_if = "ScanOrder::is_none")]
    pub order: ScanOrder,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderByColumnSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub result_format: ScanResultFormat,
    pub context: ContextMap,
}

/// Time-bucketed aggregation over the whole input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesQuery {
    pub data_source: DataSource,
    pub intervals: Vec<Interval>,
    pub granularity: Granularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DimFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    pub aggregations: Vec<AggregatorSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_aggregations: Vec<PostAggregatorSpec>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub descending: bool,
    pub context: ContextMap,
}

/// General grouping aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupByQuery {
    pub data_source: DataSource,
    pub intervals: Vec<Interval>,
    pub granularity: Granularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DimFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    pub dimensions: Vec<DimensionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregatorSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_aggregations: Vec<PostAggregatorSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub having: Option<HavingSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_spec: Option<LimitSpec>,
    pub context: ContextMap,
}

/// Single-dimension limited sorted aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopNQuery {
    pub data_source: DataSource,
    pub intervals: Vec<Interval>,
    pub granularity: Granularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DimFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    pub dimension: DimensionSpec,
    pub metric: TopNMetricSpec,
    pub threshold: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregatorSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_aggregations: Vec<PostAggregatorSpec>,
    pub context: ContextMap,
}

/// The physical, directly executable query representation.
///
/// Exactly one shape is produced per relational plan; the shape is immutable
/// once selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queryType", rename_all = "camelCase")]
pub enum NativeQuery {
    Scan(ScanQuery),
    Timeseries(TimeseriesQuery),
    GroupBy(GroupByQuery),
    TopN(TopNQuery),
}

impl NativeQuery {
    pub fn data_source(&self) -> &DataSource {
        match self {
            NativeQuery::Scan(q) => &q.data_source,
            NativeQuery::Timeseries(q) => &q.data_source,
            NativeQuery::GroupBy(q) => &q.data_source,
            NativeQuery::TopN(q) => &q.data_source,
        }
    }

    pub fn data_source_mut(&mut self) -> &mut DataSource {
        match self {
            NativeQuery::Scan(q) => &mut q.data_source,
            NativeQuery::Timeseries(q) => &mut q.data_source,
            NativeQuery::GroupBy(q) => &mut q.data_source,
            NativeQuery::TopN(q) => &mut q.data_source,
        }
    }

    pub fn filter(&self) -> Option<&DimFilter> {
        match self {
            NativeQuery::Scan(q) => q.filter.as_ref(),
            NativeQuery::Timeseries(q) => q.filter.as_ref(),
            NativeQuery::GroupBy(q) => q.filter.as_ref(),
            NativeQuery::TopN(q) => q.filter.as_ref(),
        }
    }

    pub fn virtual_columns(&self) -> &[VirtualColumn] {
        match self {
            NativeQuery::Scan(q) => &q.virtual_columns,
            NativeQuery::Timeseries(q) => &q.virtual_columns,
            NativeQuery::GroupBy(q) => &q.virtual_columns,
            NativeQuery::TopN(q) => &q.virtual_columns,
        }
    }

    pub fn virtual_columns_mut(&mut self) -> &mut Vec<VirtualColumn> {
        match self {
            NativeQuery::Scan(q) => &mut q.virtual_columns,
            NativeQuery::Timeseries(q) => &mut q.virtual_columns,
            NativeQuery::GroupBy(q) => &mut q.virtual_columns,
            NativeQuery::TopN(q) => &mut q.virtual_columns,
        }
    }

    pub fn context(&self) -> &ContextMap {
        match self {
            NativeQuery::Scan(q) => &q.context,
            NativeQuery::Timeseries(q) => &q.context,
            NativeQuery::GroupBy(q) => &q.context,
            NativeQuery::TopN(q) => &q.context,
        }
    }

    /// Collect every column name consumed at this query level: output
    /// columns, dimensions, aggregator/post-aggregator inputs, filters,
    /// ordering columns, and datasource-level references (join conditions,
    /// unnest expressions, pushed-down filters). Does not descend into
    /// `Query` sub-datasources, which have their own name scope, and does
    /// not treat virtual column definitions as consumers.
    pub fn referenced_columns(&self, out: &mut BTreeSet<String>) {
        datasource_referenced_columns(self.data_source(), out);
        if let Some(filter) = self.filter() {
            filter.referenced_columns(out);
        }
        match self {
            NativeQuery::Scan(q) => {
                out.extend(q.columns.iter().cloned());
                for ob in &q.order_by {
                    out.insert(ob.dimension.clone());
                }
            }
            NativeQuery::Timeseries(q) => {
                for agg in &q.aggregations {
                    agg.referenced_columns(out);
                }
                for pa in &q.post_aggregations {
                    pa.referenced_columns(out);
                }
            }
            NativeQuery::GroupBy(q) => {
                for dim in &q.dimensions {
                    out.insert(dim.dimension().to_string());
                }
                for agg in &q.aggregations {
                    agg.referenced_columns(out);
                }
                for pa in &q.post_aggregations {
                    pa.referenced_columns(out);
                }
                if let Some(HavingSpec::Filter { filter }) = &q.having {
                    filter.referenced_columns(out);
                }
                if let Some(LimitSpec::Default { columns, .. }) = &q.limit_spec {
                    for c in columns {
                        out.insert(c.dimension.clone());
                    }
                }
            }
            NativeQuery::TopN(q) => {
                out.insert(q.dimension.dimension().to_string());
                for agg in &q.aggregations {
                    agg.referenced_columns(out);
                }
                for pa in &q.post_aggregations {
                    pa.referenced_columns(out);
                }
            }
        }
    }

    /// Rewrite column references at this query level, including virtual
    /// column names and the identifiers inside their expressions. Subject to
    /// the same scope rules as [`NativeQuery::referenced_columns`].
    pub fn rename_column_refs(&mut self, rename: &dyn Fn(&str) -> Option<String>) {
        for vc in self.virtual_columns_mut() {
            if let Some(new) = rename(&vc.name) {
                vc.name = new;
            }
            vc.expression = rename_quoted_identifiers(&vc.expression, rename);
        }
        datasource_rename_column_refs(self.data_source_mut(), rename);
        match self {
            NativeQuery::Scan(q) => {
                if let Some(filter) = &mut q.filter {
                    filter.rename_columns(rename);
                }
                for c in &mut q.columns {
                    if let Some(new) = rename(c) {
                        *c = new;
                    }
                }
                for ob in &mut q.order_by {
                    if let Some(new) = rename(&ob.dimension) {
                        ob.dimension = new;
                    }
                }
            }
            NativeQuery::Timeseries(q) => {
                if let Some(filter) = &mut q.filter {
                    filter.rename_columns(rename);
                }
                for agg in &mut q.aggregations {
                    agg.rename_columns(rename);
                }
                for pa in &mut q.post_aggregations {
                    pa.rename_columns(rename);
                }
            }
            NativeQuery::GroupBy(q) => {
                if let Some(filter) = &mut q.filter {
                    filter.rename_columns(rename);
                }
                for dim in &mut q.dimensions {
                    let DimensionSpec::Default { dimension, .. } = dim;
                    if let Some(new) = rename(dimension) {
                        *dimension = new;
                    }
                }
                for agg in &mut q.aggregations {
                    agg.rename_columns(rename);
                }
                for pa in &mut q.post_aggregations {
                    pa.rename_columns(rename);
                }
                if let Some(HavingSpec::Filter { filter }) = &mut q.having {
                    filter.rename_columns(rename);
                }
                if let Some(LimitSpec::Default { columns, .. }) = &mut q.limit_spec {
                    for c in columns {
                        if let Some(new) = rename(&c.dimension) {
                            c.dimension = new;
                        }
                    }
                }
            }
            NativeQuery::TopN(q) => {
                if let Some(filter) = &mut q.filter {
                    filter.rename_columns(rename);
                }
                let DimensionSpec::Default { dimension, .. } = &mut q.dimension;
                if let Some(new) = rename(dimension) {
                    *dimension = new;
                }
                for agg in &mut q.aggregations {
                    agg.rename_columns(rename);
                }
                for pa in &mut q.post_aggregations {
                    pa.rename_columns(rename);
                }
            }
        }
    }
}

fn datasource_referenced_columns(ds: &DataSource, out: &mut BTreeSet<String>) {
    match ds {
        DataSource::Table { .. }
        | DataSource::Lookup { .. }
        | DataSource::Inline { .. }
        | DataSource::Query { .. } => {}
        DataSource::Join {
            left,
            right,
            condition,
            ..
        } => {
            collect_quoted_identifiers(condition, out);
            datasource_referenced_columns(left, out);
            datasource_referenced_columns(right, out);
        }
        DataSource::Union { data_sources } => {
            for d in data_sources {
                datasource_referenced_columns(d, out);
            }
        }
        DataSource::Unnest {
            base,
            virtual_column,
            unnest_filter,
        } => {
            collect_quoted_identifiers(&virtual_column.expression, out);
            if let Some(f) = unnest_filter {
                f.referenced_columns(out);
            }
            datasource_referenced_columns(base, out);
        }
        DataSource::Filtered { base, filter } => {
            filter.referenced_columns(out);
            datasource_referenced_columns(base, out);
        }
        DataSource::Restricted { base, policy } => {
            if let crate::datasource::RestrictionPolicy::RowFilter { row_filter } = policy {
                row_filter.referenced_columns(out);
            }
            datasource_referenced_columns(base, out);
        }
    }
}

fn datasource_rename_column_refs(ds: &mut DataSource, rename: &dyn Fn(&str) -> Option<String>) {
    match ds {
        DataSource::Table { .. }
        | DataSource::Lookup { .. }
        | DataSource::Inline { .. }
        | DataSource::Query { .. } => {}
        DataSource::Join {
            left,
            right,
            condition,
            ..
        } => {
            *condition = rename_quoted_identifiers(condition, rename);
            datasource_rename_column_refs(left, rename);
            datasource_rename_column_refs(right, rename);
        }
        DataSource::Union { data_sources } => {
            for d in data_sources {
                datasource_rename_column_refs(d, rename);
            }
        }
        DataSource::Unnest {
            base,
            virtual_column,
            unnest_filter,
        } => {
            virtual_column.expression =
                rename_quoted_identifiers(&virtual_column.expression, rename);
            if let Some(f) = unnest_filter {
                f.rename_columns(rename);
            }
            datasource_rename_column_refs(base, rename);
        }
        DataSource::Filtered { base, filter } => {
            filter.rename_columns(rename);
            datasource_rename_column_refs(base, rename);
        }
        DataSource::Restricted { base, policy } => {
            if let crate::datasource::RestrictionPolicy::RowFilter { row_filter } = policy {
                row_filter.rename_columns(rename);
            }
            datasource_rename_column_refs(base, rename);
        }
    }
}

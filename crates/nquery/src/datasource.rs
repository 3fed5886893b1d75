use std::collections::BTreeSet;

use basalt_common::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::expression::VirtualColumn;
use crate::filter::DimFilter;
use crate::query::NativeQuery;
use crate::types::ColumnType;

/// Join type preserved from the relational plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinType {
    Inner,
    Left,
}

/// Physical join algorithm. Broadcast is the default; sort-merge is opted
/// into per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinAlgorithm {
    Broadcast,
    SortMerge,
}

/// Row-level policy attached by the authorization collaborator to a
/// restricted datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RestrictionPolicy {
    NoRestriction,
    #[serde(rename_all = "camelCase")]
    RowFilter { row_filter: DimFilter },
}

/// The native datasource tree.
///
/// Invariants:
/// - the tree is acyclic and finite;
/// - `Unnest`/`Filtered` wrap exactly one child;
/// - join/unnest nesting depth determines virtual-column name prefixing
///   (`j0.` -> `_j0.` -> `__j0.` ...), assigned in source order by the
///   datasource builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DataSource {
    Table {
        name: String,
    },
    Lookup {
        lookup: String,
    },
    #[serde(rename_all = "camelCase")]
    Inline {
        column_names: Vec<String>,
        column_types: Vec<ColumnType>,
        rows: Vec<Vec<ScalarValue>>,
    },
    #[serde(rename_all = "camelCase")]
    Join {
        left: Box<DataSource>,
        right: Box<DataSource>,
        right_prefix: String,
        condition: String,
        join_type: JoinType,
        #[serde(skip_serializing_if = "Option::is_none")]
        join_algorithm: Option<JoinAlgorithm>,
    },
    #[serde(rename_all = "camelCase")]
    Union {
        data_sources: Vec<DataSource>,
    },
    #[serde(rename_all = "camelCase")]
    Unnest {
        base: Box<DataSource>,
        virtual_column: VirtualColumn,
        #[serde(skip_serializing_if = "Option::is_none")]
        unnest_filter: Option<DimFilter>,
    },
    Filtered {
        base: Box<DataSource>,
        filter: DimFilter,
    },
    Query {
        query: Box<NativeQuery>,
    },
    Restricted {
        base: Box<DataSource>,
        policy: RestrictionPolicy,
    },
}

impl DataSource {
    pub fn table(name: impl Into<String>) -> DataSource {
        DataSource::Table { name: name.into() }
    }

    /// Direct child datasources.
    pub fn children(&self) -> Vec<&DataSource> {
        match self {
            DataSource::Table { .. }
            | DataSource::Lookup { .. }
            | DataSource::Inline { .. }
            | DataSource::Query { .. } => vec![],
            DataSource::Join { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            DataSource::Union { data_sources } => data_sources.iter().collect(),
            DataSource::Unnest { base, .. }
            | DataSource::Filtered { base, .. }
            | DataSource::Restricted { base, .. } => vec![base.as_ref()],
        }
    }

    /// Direct child datasources, mutably. Same order as
    /// [`DataSource::children`].
    pub fn children_mut(&mut self) -> Vec<&mut DataSource> {
        match self {
            DataSource::Table { .. }
            | DataSource::Lookup { .. }
            | DataSource::Inline { .. }
            | DataSource::Query { .. } => vec![],
            DataSource::Join { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            DataSource::Union { data_sources } => data_sources.iter_mut().collect(),
            DataSource::Unnest { base, .. }
            | DataSource::Filtered { base, .. }
            | DataSource::Restricted { base, .. } => vec![base.as_mut()],
        }
    }

    /// Collect the table and lookup names referenced anywhere in the tree,
    /// descending into sub-queries.
    pub fn collect_resources(&self, tables: &mut BTreeSet<String>, lookups: &mut BTreeSet<String>) {
        match self {
            DataSource::Table { name } => {
                tables.insert(name.clone());
            }
            DataSource::Lookup { lookup } => {
                lookups.insert(lookup.clone());
            }
            DataSource::Inline { .. } => {}
            DataSource::Query { query } => {
                query.data_source().collect_resources(tables, lookups);
            }
            other => {
                for child in other.children() {
                    child.collect_resources(tables, lookups);
                }
            }
        }
    }
}

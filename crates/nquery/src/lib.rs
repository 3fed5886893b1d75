//! Serializable native query IR consumed by the Basalt execution layer.
//!
//! Architecture role:
//! - defines the typed native query tree (Scan/Timeseries/GroupBy/TopN) the
//!   compiler emits and the execution layer evaluates
//! - defines the filter algebra, datasource tree, virtual columns, row
//!   signatures and time primitives shared by both sides
//!
//! Key modules:
//! - [`types`] — [`ColumnType`], [`RowSignature`]
//! - [`expression`] — [`NativeExpression`], [`VirtualColumn`], expression
//!   text helpers
//! - [`filter`] — [`DimFilter`]
//! - [`datasource`] — [`DataSource`]
//! - [`query`] — [`NativeQuery`] and its specs
//! - [`time`] — [`Interval`], [`Granularity`]
//!
//! All IR values are immutable once produced by the compiler and are plain
//! data: serialization to the execution layer's JSON wire format uses stable
//! field names.

pub mod datasource;
pub mod expression;
pub mod filter;
pub mod query;
pub mod time;
pub mod types;

pub use datasource::{DataSource, JoinAlgorithm, JoinType, RestrictionPolicy};
pub use expression::{NativeExpression, VirtualColumn};
pub use filter::DimFilter;
pub use query::{
    AggregatorSpec, ContextMap, DimensionSpec, Direction, GroupByQuery, HavingSpec, LimitSpec,
    NativeQuery, OrderByColumnSpec, PostAggregatorSpec, ScanOrder, ScanQuery, ScanResultFormat,
    StringComparator, TimeseriesQuery, TopNMetricSpec, TopNQuery,
};
pub use time::{Granularity, Interval};
pub use types::{ColumnType, RowSignature};

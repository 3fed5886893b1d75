//! Logical-to-physical query compiler for the Basalt columnar engine.
//!
//! Architecture role:
//! - consumes a validated relational-algebra plan ([`rel::RelNode`]) from
//!   the SQL front end
//! - compiles scalar expressions and predicates into the native expression
//!   and filter algebras, materializing virtual columns as needed
//! - builds the native datasource tree (joins, unnesting, filtering,
//!   sub-queries) and selects the physical query shape
//!   (scan / timeseries / grouping / top-N)
//! - applies best-effort rewrite rules (join-to-filter, virtual-column GC)
//!
//! Key modules:
//! - [`rel`] — relational plan and scalar expression IR
//! - [`context`] — planner configuration and per-query context
//! - [`expression`] / [`filter`] — scalar and predicate compilation
//! - [`datasource`] — datasource tree construction
//! - [`shape`] — query-shape selection
//! - [`rewrite`] — cross-cutting rewrite passes
//! - [`explain`] — plan rendering
//!
//! Compilation is a pure, deterministic function of
//! `(plan, config, context)`: the same inputs always produce a structurally
//! identical native query. The whole pass is synchronous and holds no state
//! beyond the per-query virtual column counter, so independent queries can
//! compile concurrently.

pub mod context;
pub mod datasource;
pub mod explain;
pub mod expression;
pub mod filter;
pub mod rel;
pub mod resource;
pub mod rewrite;
pub mod shape;

use std::collections::BTreeSet;

use basalt_common::Result;
use basalt_nquery::{NativeQuery, RowSignature};

pub use context::{PlannerConfig, PlannerContext, PlanningMode, QueryContext};
pub use explain::explain_native;
pub use rel::{AggCall, RelExpr, RelNode, ScalarOp, SortField, TIME_COLUMN};
pub use resource::{Action, ResourceAction, ResourceType};

/// Everything the compiler hands back to its caller: the executable native
/// query, the output row signature used to decode result rows, and the
/// resources the authorization collaborator must check before execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub query: NativeQuery,
    pub signature: RowSignature,
    pub resources: Vec<ResourceAction>,
}

/// Compile a relational plan into a native query.
///
/// The pass runs to completion synchronously: expression/filter compilation,
/// datasource construction, shape selection, then rewrites. Errors are
/// surfaced as [`basalt_common::BasaltError::InvalidInput`] for uncompilable
/// queries and `Internal` for compiler invariant violations; no part of
/// compilation retries.
pub fn compile(ctx: &PlannerContext, plan: &RelNode) -> Result<CompiledQuery> {
    let (query, signature) = shape::build_native_query(ctx, plan)?;

    let mut tables = BTreeSet::new();
    let mut lookups = BTreeSet::new();
    query.data_source().collect_resources(&mut tables, &mut lookups);
    let mut resources: Vec<ResourceAction> = tables
        .into_iter()
        .map(ResourceAction::read_datasource)
        .collect();
    resources.extend(lookups.into_iter().map(ResourceAction::read_lookup));

    Ok(CompiledQuery {
        query,
        signature,
        resources,
    })
}

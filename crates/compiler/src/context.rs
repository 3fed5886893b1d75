use basalt_common::{BasaltError, Result};
use basalt_nquery::{ContextMap, JoinAlgorithm};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Recognized per-query context keys.
///
/// Unknown keys pass through untouched into the emitted native query's
/// context map; known keys are validated once at context construction.
pub mod keys {
    pub const QUERY_ID: &str = "sqlQueryId";
    pub const TIMEOUT: &str = "timeout";
    pub const MAX_SCATTER_GATHER_BYTES: &str = "maxScatterGatherBytes";
    pub const STRINGIFY_ARRAYS: &str = "sqlStringifyArrays";
    pub const SKIP_EMPTY_BUCKETS: &str = "skipEmptyBuckets";
    pub const JOIN_FILTER_REWRITE: &str = "enableJoinFilterRewrite";
    pub const JOIN_FILTER_REWRITE_VALUE_COLUMNS: &str =
        "enableJoinFilterRewriteValueColumnFilters";
    pub const REWRITE_JOIN_TO_FILTER: &str = "enableRewriteJoinToFilter";
    pub const USE_LEXICOGRAPHIC_TOPN: &str = "useLexicographicTopN";
    pub const SQL_TIME_ZONE: &str = "sqlTimeZone";
    pub const JOIN_ALGORITHM: &str = "sqlJoinAlgorithm";
}

/// Whether the compiler runs in the legacy coupled pipeline or the decoupled
/// one, which permits extra sub-query fallbacks (for example non-time scan
/// ordering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanningMode {
    #[default]
    Coupled,
    Decoupled,
}

/// Static planner feature flags, constructed by the caller and passed through
/// explicitly.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Maximum threshold a TopN query may carry; larger limits fall back to
    /// GroupBy.
    pub max_top_n_limit: u64,
    /// Compile `COUNT(DISTINCT ...)` to the approximate cardinality
    /// aggregator.
    pub use_approximate_count_distinct: bool,
    /// Allow metric-ordered single-dimension aggregations to compile to TopN.
    pub use_approximate_top_n: bool,
    /// Allow dimension-ordered single-dimension aggregations to compile to
    /// lexicographic TopN.
    pub use_lexicographic_top_n: bool,
    /// Reject queries without a time condition on the primary interval.
    pub require_time_condition: bool,
    /// Time zone applied to time functions when the query does not override.
    pub sql_time_zone: Tz,
    /// Maximum literal count of a numeric IN filter; negative disables the
    /// check.
    pub max_numeric_in_filters: i64,
    pub planning_mode: PlanningMode,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_top_n_limit: 100_000,
            use_approximate_count_distinct: true,
            use_approximate_top_n: true,
            use_lexicographic_top_n: false,
            require_time_condition: false,
            sql_time_zone: chrono_tz::UTC,
            max_numeric_in_filters: -1,
            planning_mode: PlanningMode::Coupled,
        }
    }
}

/// Typed view of the per-query context map, validated once at construction.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_scatter_gather_bytes: Option<u64>,
    /// Render array-typed outputs as JSON strings in result rows.
    pub stringify_arrays: bool,
    /// Suppress timeseries buckets with no input rows.
    pub skip_empty_buckets: bool,
    /// Execution-level join filter push-down toggle (echoed to the engine).
    pub join_filter_rewrite: bool,
    /// Let filters on non-key right-side value columns participate in join
    /// rewrites.
    pub join_filter_rewrite_value_columns: bool,
    /// Compile eligible joins against enumerable key sets into IN filters.
    pub rewrite_join_to_filter: bool,
    /// Per-query override of [`PlannerConfig::use_lexicographic_top_n`].
    pub use_lexicographic_top_n: Option<bool>,
    /// Per-query override of [`PlannerConfig::sql_time_zone`].
    pub time_zone: Option<Tz>,
    pub join_algorithm: Option<JoinAlgorithm>,
    raw: ContextMap,
}

impl QueryContext {
    /// Validate the raw context map into typed fields. Unknown keys are
    /// preserved; known keys with the wrong type fail with `InvalidInput`.
    pub fn from_map(map: &ContextMap) -> Result<QueryContext> {
        let mut ctx = QueryContext {
            query_id: None,
            timeout_ms: None,
            max_scatter_gather_bytes: None,
            stringify_arrays: true,
            skip_empty_buckets: false,
            join_filter_rewrite: true,
            join_filter_rewrite_value_columns: false,
            rewrite_join_to_filter: true,
            use_lexicographic_top_n: None,
            time_zone: None,
            join_algorithm: None,
            raw: map.clone(),
        };
        for (key, value) in map {
            match key.as_str() {
                keys::QUERY_ID => ctx.query_id = Some(get_string(key, value)?),
                keys::TIMEOUT => ctx.timeout_ms = Some(get_u64(key, value)?),
                keys::MAX_SCATTER_GATHER_BYTES => {
                    ctx.max_scatter_gather_bytes = Some(get_u64(key, value)?)
                }
                keys::STRINGIFY_ARRAYS => ctx.stringify_arrays = get_bool(key, value)?,
                keys::SKIP_EMPTY_BUCKETS => ctx.skip_empty_buckets = get_bool(key, value)?,
                keys::JOIN_FILTER_REWRITE => ctx.join_filter_rewrite = get_bool(key, value)?,
                keys::JOIN_FILTER_REWRITE_VALUE_COLUMNS => {
                    ctx.join_filter_rewrite_value_columns = get_bool(key, value)?
                }
                keys::REWRITE_JOIN_TO_FILTER => {
                    ctx.rewrite_join_to_filter = get_bool(key, value)?
                }
                keys::USE_LEXICOGRAPHIC_TOPN => {
                    ctx.use_lexicographic_top_n = Some(get_bool(key, value)?)
                }
                keys::SQL_TIME_ZONE => {
                    let name = get_string(key, value)?;
                    let tz = name.parse::<Tz>().map_err(|_| {
                        BasaltError::invalid_input(format!("unknown time zone [{name}]"))
                    })?;
                    ctx.time_zone = Some(tz);
                }
                keys::JOIN_ALGORITHM => {
                    ctx.join_algorithm = Some(match get_string(key, value)?.as_str() {
                        "broadcast" => JoinAlgorithm::Broadcast,
                        "sortMerge" => JoinAlgorithm::SortMerge,
                        other => {
                            return Err(BasaltError::invalid_input(format!(
                                "unknown join algorithm [{other}]"
                            )))
                        }
                    })
                }
                _ => {}
            }
        }
        Ok(ctx)
    }

    /// The raw map, echoed into the emitted native query.
    pub fn raw(&self) -> &ContextMap {
        &self.raw
    }
}

fn get_bool(key: &str, value: &serde_json::Value) -> Result<bool> {
    match value {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::String(s) if s == "true" => Ok(true),
        serde_json::Value::String(s) if s == "false" => Ok(false),
        other => Err(BasaltError::invalid_input(format!(
            "context key [{key}] expects a boolean, got [{other}]"
        ))),
    }
}

fn get_u64(key: &str, value: &serde_json::Value) -> Result<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().ok_or_else(|| {
            BasaltError::invalid_input(format!(
                "context key [{key}] expects a non-negative integer, got [{n}]"
            ))
        }),
        serde_json::Value::String(s) => s.parse::<u64>().map_err(|_| {
            BasaltError::invalid_input(format!(
                "context key [{key}] expects a non-negative integer, got [{s}]"
            ))
        }),
        other => Err(BasaltError::invalid_input(format!(
            "context key [{key}] expects a non-negative integer, got [{other}]"
        ))),
    }
}

fn get_string(key: &str, value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(BasaltError::invalid_input(format!(
            "context key [{key}] expects a string, got [{other}]"
        ))),
    }
}

/// Everything a single compilation pass reads: static config, the validated
/// per-query context, the resolved time zone and the frozen `now` timestamp.
///
/// Created once per compiled query and read-only thereafter, so the compiler
/// is safely invocable concurrently for independent queries.
#[derive(Debug, Clone)]
pub struct PlannerContext {
    pub config: PlannerConfig,
    pub query_context: QueryContext,
    pub time_zone: Tz,
    pub now: DateTime<Utc>,
}

impl PlannerContext {
    pub fn new(
        config: PlannerConfig,
        context_map: &ContextMap,
        now: DateTime<Utc>,
    ) -> Result<PlannerContext> {
        let query_context = QueryContext::from_map(context_map)?;
        let time_zone = query_context.time_zone.unwrap_or(config.sql_time_zone);
        Ok(PlannerContext {
            config,
            query_context,
            time_zone,
            now,
        })
    }

    /// Effective lexicographic-TopN toggle (context overrides config).
    pub fn use_lexicographic_top_n(&self) -> bool {
        self.query_context
            .use_lexicographic_top_n
            .unwrap_or(self.config.use_lexicographic_top_n)
    }

    /// Context map to attach to the emitted native query.
    pub fn native_query_context(&self) -> ContextMap {
        self.query_context.raw().clone()
    }
}

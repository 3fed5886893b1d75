use std::collections::{BTreeSet, HashMap};

use basalt_common::{BasaltError, Result};
use basalt_nquery::expression::quote_identifier;
use basalt_nquery::types::RowSignature;
use basalt_nquery::{DataSource, DimFilter, VirtualColumn};

use crate::context::PlannerContext;
use crate::expression::{ExpressionCompiler, VirtualColumnRegistry};
use crate::filter::FilterCompiler;
use crate::rel::{join_prefix, unnest_element_type, RelExpr, RelNode, ScalarOp};

/// Table-name prefix routing a scan to a lookup datasource instead of a
/// stored table.
const LOOKUP_TABLE_PREFIX: &str = "lookup.";

/// Result of lowering the base of a relational plan into a datasource tree.
#[derive(Debug)]
pub struct BuiltSource {
    pub source: DataSource,
    /// Effective native signature: unnest output columns under their
    /// `...j0.unnest` names, join right-side columns under their prefixes.
    pub signature: RowSignature,
    /// Relational-plan names that differ from native names (the unnest
    /// output aliases).
    pub aliases: HashMap<String, String>,
    /// Filter that could not be pushed into the tree; the caller attaches it
    /// to the enclosing query (or wraps the source in `Filtered` when used
    /// as a join/unnest input).
    pub residual_filter: Option<DimFilter>,
}

impl BuiltSource {
    /// Fold any residual filter into the tree, for consumers that cannot
    /// carry a query-level filter of their own.
    fn into_filtered(self) -> (DataSource, RowSignature, HashMap<String, String>) {
        match self.residual_filter {
            Some(filter) => (
                DataSource::Filtered {
                    base: Box::new(self.source),
                    filter,
                },
                self.signature,
                self.aliases,
            ),
            None => (self.source, self.signature, self.aliases),
        }
    }
}

/// Builds the native datasource tree bottom-up from the base of a relational
/// plan (everything beneath the Sort/Project/Aggregate/Filter stack).
///
/// Join and unnest prefixes (`j0.`, `_j0.`, ...) are assigned in source
/// order via [`RelNode::prefix_depth`]; filter placement never changes the
/// assignment.
pub struct DataSourceBuilder<'a, 'r> {
    ctx: &'a PlannerContext,
    registry: &'r mut VirtualColumnRegistry,
}

impl<'a, 'r> DataSourceBuilder<'a, 'r> {
    pub fn new(
        ctx: &'a PlannerContext,
        registry: &'r mut VirtualColumnRegistry,
    ) -> DataSourceBuilder<'a, 'r> {
        DataSourceBuilder { ctx, registry }
    }

    /// Lower `rel` with an optional predicate from the enclosing WHERE.
    ///
    /// For unnest bases the predicate's conjuncts are split: conjuncts over
    /// pre-unnest columns push beneath the unnest as a `Filtered` wrapper,
    /// conjuncts over the unnested column only attach as the unnest filter,
    /// and mixed conjuncts stay in `residual_filter` for the enclosing
    /// query.
    pub fn build(&mut self, rel: &RelNode, predicate: Option<&RelExpr>) -> Result<BuiltSource> {
        match rel {
            RelNode::TableScan { table, signature } => {
                let source = if let Some(lookup) = table.strip_prefix(LOOKUP_TABLE_PREFIX) {
                    DataSource::Lookup {
                        lookup: lookup.to_string(),
                    }
                } else {
                    DataSource::table(table.clone())
                };
                self.leaf(source, signature.clone(), predicate)
            }
            RelNode::Values { signature, rows } => {
                let source = DataSource::Inline {
                    column_names: signature.names().map(str::to_string).collect(),
                    column_types: signature.iter().map(|(_, t)| t.clone()).collect(),
                    rows: rows.clone(),
                };
                self.leaf(source, signature.clone(), predicate)
            }
            RelNode::Filter {
                predicate: inner_predicate,
                input,
            } => {
                let merged = match predicate {
                    Some(outer) => RelExpr::Call {
                        op: ScalarOp::And,
                        args: vec![inner_predicate.clone(), outer.clone()],
                    },
                    None => inner_predicate.clone(),
                };
                self.build(input, Some(&merged))
            }
            RelNode::Join {
                left,
                right,
                keys,
                join_type,
            } => self.build_join(left, right, keys, *join_type, predicate),
            RelNode::Unnest {
                target,
                output_name,
                input,
            } => self.build_unnest(target, output_name, input, predicate),
            RelNode::Union { inputs } => {
                let mut sources = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let built = self.build(input, None)?;
                    let (source, _sig, _aliases) = built.into_filtered();
                    sources.push(source);
                }
                let signature = rel.output_signature()?;
                self.leaf(
                    DataSource::Union {
                        data_sources: sources,
                    },
                    signature,
                    predicate,
                )
            }
            // anything query-shaped becomes a sub-query datasource
            RelNode::Project { .. } | RelNode::Aggregate { .. } | RelNode::Sort { .. } => {
                let sub = crate::shape::build_subquery(self.ctx, rel)?;
                self.reserve_generated(&sub.signature);
                let source = DataSource::Query {
                    query: Box::new(sub.query),
                };
                let residual_filter = match predicate {
                    Some(p) => FilterCompiler::new(
                        self.ctx,
                        &sub.signature,
                        &sub.aliases,
                        self.registry,
                    )
                    .compile_root(p)?,
                    None => None,
                };
                Ok(BuiltSource {
                    source,
                    signature: sub.signature,
                    aliases: sub.aliases,
                    residual_filter,
                })
            }
        }
    }

    /// Input columns that look like generated names must never be shadowed
    /// by this level's virtual columns.
    fn reserve_generated(&mut self, signature: &RowSignature) {
        for name in signature.names() {
            if name.len() > 1 && name.starts_with('v') && name[1..].bytes().all(|b| b.is_ascii_digit())
            {
                self.registry.reserve(name);
            }
        }
    }

    /// Leaf-style source: any predicate compiles in full as residual.
    fn leaf(
        &mut self,
        source: DataSource,
        signature: RowSignature,
        predicate: Option<&RelExpr>,
    ) -> Result<BuiltSource> {
        self.reserve_generated(&signature);
        let aliases = HashMap::new();
        let residual_filter = match predicate {
            Some(p) => {
                FilterCompiler::new(self.ctx, &signature, &aliases, self.registry)
                    .compile_root(p)?
            }
            None => None,
        };
        Ok(BuiltSource {
            source,
            signature,
            aliases,
            residual_filter,
        })
    }

    fn build_join(
        &mut self,
        left: &RelNode,
        right: &RelNode,
        keys: &[(String, String)],
        join_type: basalt_nquery::JoinType,
        predicate: Option<&RelExpr>,
    ) -> Result<BuiltSource> {
        let prefix = join_prefix(left.prefix_depth());

        let left_built = self.build_or_subquery(left)?;
        let (left_source, left_sig, left_aliases) = left_built.into_filtered();

        let (right_source, right_sig, right_aliases) = self.build_join_right(right)?;

        // right columns join the effective signature under the prefix
        let mut b = RowSignature::builder();
        for (name, t) in left_sig.iter() {
            b = b.add(name, t.clone());
        }
        for (name, t) in right_sig.iter() {
            b = b.add(format!("{prefix}{name}"), t.clone());
        }
        let signature = b.build();

        let condition = if keys.is_empty() {
            // constant cross product; preserved as a join, not simplified away
            "1".to_string()
        } else {
            let mut terms = Vec::with_capacity(keys.len());
            for (lk, rk) in keys {
                let native_lk = left_aliases.get(lk).cloned().unwrap_or_else(|| lk.clone());
                if !left_sig.contains(&native_lk) {
                    return Err(BasaltError::invalid_input(format!(
                        "unknown left join key [{lk}]"
                    )));
                }
                let native_rk = right_aliases.get(rk).cloned().unwrap_or_else(|| rk.clone());
                if !right_sig.contains(&native_rk) {
                    return Err(BasaltError::invalid_input(format!(
                        "unknown right join key [{rk}]"
                    )));
                }
                terms.push(format!(
                    "({} == {})",
                    quote_identifier(&native_lk),
                    quote_identifier(&format!("{prefix}{native_rk}"))
                ));
            }
            terms.join(" && ")
        };

        let source = DataSource::Join {
            left: Box::new(left_source),
            right: Box::new(right_source),
            right_prefix: prefix.clone(),
            condition,
            join_type,
            join_algorithm: self.ctx.query_context.join_algorithm,
        };

        // downstream nodes reference right-side columns under the prefix
        let mut aliases = left_aliases;
        for (rel_name, native) in right_aliases {
            aliases.insert(format!("{prefix}{rel_name}"), format!("{prefix}{native}"));
        }
        let residual_filter = match predicate {
            Some(p) => {
                FilterCompiler::new(self.ctx, &signature, &aliases, self.registry)
                    .compile_root(p)?
            }
            None => None,
        };
        Ok(BuiltSource {
            source,
            signature,
            aliases,
            residual_filter,
        })
    }

    /// Right sides stay leaves when they are plain tables/lookups/values;
    /// anything else wraps in a sub-query with its own name scope.
    fn build_join_right(
        &mut self,
        right: &RelNode,
    ) -> Result<(DataSource, RowSignature, HashMap<String, String>)> {
        match right {
            RelNode::TableScan { .. } | RelNode::Values { .. } => {
                let built = self.build(right, None)?;
                let (source, sig, aliases) = built.into_filtered();
                Ok((source, sig, aliases))
            }
            other => {
                let sub = crate::shape::build_subquery(self.ctx, other)?;
                self.reserve_generated(&sub.signature);
                Ok((
                    DataSource::Query {
                        query: Box::new(sub.query),
                    },
                    sub.signature,
                    sub.aliases,
                ))
            }
        }
    }

    fn build_or_subquery(&mut self, rel: &RelNode) -> Result<BuiltSource> {
        match rel {
            RelNode::Project { .. } | RelNode::Aggregate { .. } | RelNode::Sort { .. } => {
                let sub = crate::shape::build_subquery(self.ctx, rel)?;
                self.reserve_generated(&sub.signature);
                Ok(BuiltSource {
                    source: DataSource::Query {
                        query: Box::new(sub.query),
                    },
                    signature: sub.signature,
                    aliases: sub.aliases,
                    residual_filter: None,
                })
            }
            other => self.build(other, None),
        }
    }

    fn build_unnest(
        &mut self,
        target: &RelExpr,
        output_name: &str,
        input: &RelNode,
        predicate: Option<&RelExpr>,
    ) -> Result<BuiltSource> {
        let prefix = join_prefix(input.prefix_depth());

        let inner = self.build(input, None)?;
        let (mut base_source, base_sig, base_aliases) = inner.into_filtered();

        let compiled = ExpressionCompiler::new(self.ctx, &base_sig, &base_aliases)
            .compile(target)?;
        let element_type = unnest_element_type(&compiled.output_type)?;
        let unnest_column = format!("{prefix}unnest");
        let virtual_column = VirtualColumn::new(
            unnest_column.clone(),
            compiled.expression.clone(),
            compiled.output_type.clone(),
        );

        let mut b = RowSignature::builder();
        for (name, t) in base_sig.iter() {
            b = b.add(name, t.clone());
        }
        b = b.add(unnest_column.clone(), element_type);
        let signature = b.build();

        let mut aliases = base_aliases.clone();
        aliases.insert(output_name.to_string(), unnest_column.clone());

        // classify WHERE conjuncts relative to this unnest level
        let mut base_conjuncts: Vec<&RelExpr> = Vec::new();
        let mut unnest_conjuncts: Vec<&RelExpr> = Vec::new();
        let mut mixed_conjuncts: Vec<&RelExpr> = Vec::new();
        if let Some(p) = predicate {
            for conjunct in conjuncts(p) {
                let mut referenced = BTreeSet::new();
                conjunct.referenced_columns(&mut referenced);
                let touches_unnest = referenced
                    .iter()
                    .any(|c| c == output_name || *c == unnest_column);
                let touches_base = referenced
                    .iter()
                    .any(|c| c != output_name && *c != unnest_column);
                match (touches_base, touches_unnest) {
                    (true, false) => base_conjuncts.push(conjunct),
                    (false, true) => unnest_conjuncts.push(conjunct),
                    _ => mixed_conjuncts.push(conjunct),
                }
            }
        }

        if !base_conjuncts.is_empty() {
            let pushed = self.compile_conjuncts(&base_conjuncts, &base_sig, &base_aliases)?;
            if let Some(filter) = pushed {
                base_source = DataSource::Filtered {
                    base: Box::new(base_source),
                    filter,
                };
            }
        }

        let unnest_filter =
            self.compile_conjuncts(&unnest_conjuncts, &signature, &aliases)?;
        let residual_filter =
            self.compile_conjuncts(&mixed_conjuncts, &signature, &aliases)?;

        Ok(BuiltSource {
            source: DataSource::Unnest {
                base: Box::new(base_source),
                virtual_column,
                unnest_filter,
            },
            signature,
            aliases,
            residual_filter,
        })
    }

    fn compile_conjuncts(
        &mut self,
        conjuncts: &[&RelExpr],
        signature: &RowSignature,
        aliases: &HashMap<String, String>,
    ) -> Result<Option<DimFilter>> {
        if conjuncts.is_empty() {
            return Ok(None);
        }
        let mut compiler = FilterCompiler::new(self.ctx, signature, aliases, self.registry);
        let fields = conjuncts
            .iter()
            .map(|c| compiler.compile(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(match DimFilter::and(fields) {
            DimFilter::True => None,
            other => Some(other),
        })
    }
}

/// Split a predicate into its top-level AND conjuncts.
pub fn conjuncts(predicate: &RelExpr) -> Vec<&RelExpr> {
    let mut out = Vec::new();
    collect_conjuncts(predicate, &mut out);
    out
}

fn collect_conjuncts<'e>(predicate: &'e RelExpr, out: &mut Vec<&'e RelExpr>) {
    match predicate {
        RelExpr::Call {
            op: ScalarOp::And,
            args,
        } => {
            for a in args {
                collect_conjuncts(a, out);
            }
        }
        other => out.push(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PlannerConfig;
    use crate::rel::TIME_COLUMN;
    use basalt_nquery::types::ColumnType;
    use chrono::TimeZone;

    fn ctx() -> PlannerContext {
        PlannerContext::new(
            PlannerConfig::default(),
            &basalt_nquery::ContextMap::new(),
            chrono::Utc.timestamp_millis_opt(1577836800000).unwrap(),
        )
        .unwrap()
    }

    fn numfoo() -> RelNode {
        RelNode::TableScan {
            table: "numfoo".to_string(),
            signature: RowSignature::builder()
                .add(TIME_COLUMN, ColumnType::Long)
                .add("dim1", ColumnType::String)
                .add("dim3", ColumnType::String)
                .add("l1", ColumnType::Long)
                .build(),
        }
    }

    fn build(rel: &RelNode, predicate: Option<&RelExpr>) -> BuiltSource {
        let ctx = ctx();
        let mut registry = VirtualColumnRegistry::new();
        DataSourceBuilder::new(&ctx, &mut registry)
            .build(rel, predicate)
            .unwrap()
    }

    #[test]
    fn lookup_prefixed_tables_become_lookup_datasources() {
        let rel = RelNode::TableScan {
            table: "lookup.lookyloo".to_string(),
            signature: RowSignature::builder()
                .add("k", ColumnType::String)
                .add("v", ColumnType::String)
                .build(),
        };
        let built = build(&rel, None);
        assert_eq!(
            built.source,
            DataSource::Lookup {
                lookup: "lookyloo".to_string()
            }
        );
    }

    #[test]
    fn unnest_names_virtual_column_by_depth() {
        let rel = RelNode::Unnest {
            target: RelExpr::col("dim3"),
            output_name: "d3".to_string(),
            input: Box::new(numfoo()),
        };
        let built = build(&rel, None);
        let DataSource::Unnest {
            virtual_column, ..
        } = &built.source
        else {
            panic!("expected unnest, got {:?}", built.source);
        };
        assert_eq!(virtual_column.name, "j0.unnest");
        assert_eq!(virtual_column.expression, "\"dim3\"");
        assert_eq!(built.aliases.get("d3"), Some(&"j0.unnest".to_string()));
        assert_eq!(
            built.signature.column_type("j0.unnest"),
            Some(&ColumnType::String)
        );
    }

    #[test]
    fn chained_unnest_prefixes_are_source_ordered() {
        let rel = RelNode::Unnest {
            target: RelExpr::col("dim3"),
            output_name: "outer_d".to_string(),
            input: Box::new(RelNode::Unnest {
                target: RelExpr::col("dim3"),
                output_name: "inner_d".to_string(),
                input: Box::new(numfoo()),
            }),
        };
        let built = build(&rel, None);
        let DataSource::Unnest {
            base,
            virtual_column,
            ..
        } = &built.source
        else {
            panic!("expected unnest");
        };
        assert_eq!(virtual_column.name, "_j0.unnest");
        let DataSource::Unnest {
            virtual_column: inner_vc,
            ..
        } = base.as_ref()
        else {
            panic!("expected nested unnest");
        };
        assert_eq!(inner_vc.name, "j0.unnest");
    }

    #[test]
    fn base_only_filter_pushes_beneath_unnest() {
        let rel = RelNode::Unnest {
            target: RelExpr::col("dim3"),
            output_name: "d3".to_string(),
            input: Box::new(numfoo()),
        };
        let predicate = RelExpr::binary(ScalarOp::Eq, RelExpr::col("dim1"), RelExpr::lit("x"));
        let built = build(&rel, Some(&predicate));
        let DataSource::Unnest { base, .. } = &built.source else {
            panic!("expected unnest");
        };
        assert!(matches!(base.as_ref(), DataSource::Filtered { .. }));
        assert!(built.residual_filter.is_none());
    }

    #[test]
    fn unnest_column_filter_attaches_to_unnest() {
        let rel = RelNode::Unnest {
            target: RelExpr::col("dim3"),
            output_name: "d3".to_string(),
            input: Box::new(numfoo()),
        };
        let predicate = RelExpr::binary(ScalarOp::Eq, RelExpr::col("d3"), RelExpr::lit("b"));
        let built = build(&rel, Some(&predicate));
        let DataSource::Unnest {
            base,
            unnest_filter,
            ..
        } = &built.source
        else {
            panic!("expected unnest");
        };
        assert!(matches!(base.as_ref(), DataSource::Table { .. }));
        assert_eq!(
            unnest_filter,
            &Some(DimFilter::equality("j0.unnest", ColumnType::String, "b"))
        );
    }

    #[test]
    fn mixed_filter_stays_residual() {
        let rel = RelNode::Unnest {
            target: RelExpr::col("dim3"),
            output_name: "d3".to_string(),
            input: Box::new(numfoo()),
        };
        let predicate = RelExpr::binary(
            ScalarOp::Eq,
            RelExpr::col("d3"),
            RelExpr::col("dim1"),
        );
        let built = build(&rel, Some(&predicate));
        let DataSource::Unnest {
            base,
            unnest_filter,
            ..
        } = &built.source
        else {
            panic!("expected unnest");
        };
        assert!(matches!(base.as_ref(), DataSource::Table { .. }));
        assert!(unnest_filter.is_none());
        assert!(built.residual_filter.is_some());
    }

    #[test]
    fn join_condition_uses_prefix() {
        let rel = RelNode::Join {
            left: Box::new(numfoo()),
            right: Box::new(RelNode::TableScan {
                table: "lookup.lookyloo".to_string(),
                signature: RowSignature::builder()
                    .add("k", ColumnType::String)
                    .add("v", ColumnType::String)
                    .build(),
            }),
            keys: vec![("dim1".to_string(), "k".to_string())],
            join_type: basalt_nquery::JoinType::Inner,
        };
        let built = build(&rel, None);
        let DataSource::Join {
            right_prefix,
            condition,
            ..
        } = &built.source
        else {
            panic!("expected join");
        };
        assert_eq!(right_prefix, "j0.");
        assert_eq!(condition, "(\"dim1\" == \"j0.k\")");
        assert_eq!(
            built.signature.column_type("j0.v"),
            Some(&ColumnType::String)
        );
    }

    #[test]
    fn constant_join_is_preserved() {
        let rel = RelNode::Join {
            left: Box::new(numfoo()),
            right: Box::new(RelNode::Values {
                signature: RowSignature::builder().add("x", ColumnType::Long).build(),
                rows: vec![vec![basalt_common::ScalarValue::Long(1)]],
            }),
            keys: vec![],
            join_type: basalt_nquery::JoinType::Inner,
        };
        let built = build(&rel, None);
        let DataSource::Join {
            condition, right, ..
        } = &built.source
        else {
            panic!("expected join");
        };
        assert_eq!(condition, "1");
        assert!(matches!(right.as_ref(), DataSource::Inline { .. }));
    }
}

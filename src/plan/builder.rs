//! Translation of a relation tree into a node graph.
//!
//! Every derived table in a FROM list and every subquery in a WHERE clause
//! becomes its own node, materialized into a temporary table; the parent
//! keeps a placeholder in its place. Aggregates over a scrambled table are
//! split into an async-aggregation subtree instead. The root wraps the
//! whole thing in `SELECT * FROM <placeholder>` so the caller always
//! receives rows from a single final statement. Input queries must not
//! carry placeholders of their own.

use tracing::debug;

use super::{NodeId, PlanNode, QueryPlan};
use crate::config::AqpConfig;
use crate::error::AqpError;
use crate::ola::{AggregateLayout, build_async_subtree};
use crate::scramble::ScrambleMetaSet;
use crate::sql::{Expr, Relation, SelectQuery};

pub struct PlanBuilder<'a> {
    scrambles: &'a ScrambleMetaSet,
    config: &'a AqpConfig,
    aliases: usize,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(scrambles: &'a ScrambleMetaSet, config: &'a AqpConfig) -> Self {
        PlanBuilder {
            scrambles,
            config,
            aliases: 0,
        }
    }

    /// Build the uncompressed plan answering `query`.
    pub fn build(&mut self, query: &SelectQuery) -> Result<QueryPlan, AqpError> {
        self.config.validate()?;
        if query.select_list.is_empty() {
            return Err(AqpError::InvalidArgument("select list is empty".into()));
        }

        let alias = self.next_alias();
        let mut plan = QueryPlan::new(PlanNode::select(
            SelectQuery::select_all_from(Relation::Placeholder { slot: 0, alias }),
            Vec::new(),
        ));
        let child = self.plan_query(&mut plan, query)?;
        let root = plan.root();
        plan.node_mut(root)?.dependencies.push(child);
        plan.validate()?;

        debug!(nodes = plan.len(), "plan built");
        Ok(plan)
    }

    fn next_alias(&mut self) -> String {
        let alias = format!("vt{}", self.aliases);
        self.aliases += 1;
        alias
    }

    fn plan_query(&mut self, plan: &mut QueryPlan, query: &SelectQuery) -> Result<NodeId, AqpError> {
        if let Some(layout) = AggregateLayout::from_query(query, self.scrambles) {
            debug!(
                scramble = %format!("{}.{}", layout.source.schema, layout.source.table),
                blocks = layout.source.total_blocks,
                "aggregate answered progressively"
            );
            return build_async_subtree(plan, layout, self.config);
        }

        let mut template = query.clone();
        let mut dependencies = Vec::new();
        for rel in &mut template.from_list {
            self.extract_relation(plan, rel, &mut dependencies)?;
        }
        if let Some(filter) = &mut template.filter {
            self.extract_expr(plan, filter, &mut dependencies)?;
        }
        Ok(plan.add_node(PlanNode::create_table(template, dependencies)))
    }

    fn extract_relation(
        &mut self,
        plan: &mut QueryPlan,
        rel: &mut Relation,
        dependencies: &mut Vec<NodeId>,
    ) -> Result<(), AqpError> {
        match rel {
            Relation::Subquery { query, alias } => {
                let alias = alias.clone();
                let child = self.plan_query(plan, query)?;
                *rel = Relation::Placeholder {
                    slot: dependencies.len(),
                    alias,
                };
                dependencies.push(child);
            }
            Relation::Join {
                left, right, on, ..
            } => {
                self.extract_relation(plan, left, dependencies)?;
                self.extract_relation(plan, right, dependencies)?;
                if let Some(on) = on {
                    self.extract_expr(plan, on, dependencies)?;
                }
            }
            Relation::Placeholder { slot, .. } => {
                return Err(AqpError::UnsupportedQuery(format!(
                    "input query already contains placeholder relation {slot}"
                )));
            }
            Relation::Base { .. } => {}
        }
        Ok(())
    }

    fn extract_expr(
        &mut self,
        plan: &mut QueryPlan,
        expr: &mut Expr,
        dependencies: &mut Vec<NodeId>,
    ) -> Result<(), AqpError> {
        match expr {
            Expr::Subquery(query) => {
                let child = self.plan_query(plan, query)?;
                *expr = Expr::PlaceholderSubquery {
                    slot: dependencies.len(),
                };
                dependencies.push(child);
            }
            Expr::Binary { left, right, .. } => {
                self.extract_expr(plan, left, dependencies)?;
                self.extract_expr(plan, right, dependencies)?;
            }
            Expr::Unary { expr, .. } | Expr::Cast { expr, .. } => {
                self.extract_expr(plan, expr, dependencies)?;
            }
            Expr::InList { expr, list, .. } => {
                self.extract_expr(plan, expr, dependencies)?;
                for item in list {
                    self.extract_expr(plan, item, dependencies)?;
                }
            }
            Expr::Func { args, .. } => {
                for arg in args {
                    self.extract_expr(plan, arg, dependencies)?;
                }
            }
            Expr::Aggregate { arg: Some(arg), .. } => {
                self.extract_expr(plan, arg, dependencies)?;
            }
            Expr::PlaceholderSubquery { slot } => {
                return Err(AqpError::UnsupportedQuery(format!(
                    "input query already contains placeholder subquery {slot}"
                )));
            }
            Expr::Aggregate { arg: None, .. }
            | Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Asterisk { .. } => {}
        }
        Ok(())
    }
}

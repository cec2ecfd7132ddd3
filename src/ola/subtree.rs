//! Async-aggregation subtrees.
//!
//! An aggregate query over a scrambled table is split into leaves, one per
//! contiguous block range. Leaves feed a tree of combiners with bounded
//! fan-in, and the top of the tree feeds a single fan-out node that
//! finalizes the estimate and materializes it for downstream consumers.

use std::sync::Arc;

use super::estimate::{self, FinalizedAggregate};
use super::partial::{BlockRange, PartialSnapshot};
use crate::config::AqpConfig;
use crate::error::AqpError;
use crate::plan::{NodeId, PlanNode, QueryPlan};
use crate::scramble::ScrambleMetaSet;
use crate::sql::{AggFunc, BinaryOp, Expr, Relation, SelectItem, SelectQuery};

/// The scramble an async subtree reads.
#[derive(Debug, Clone)]
pub struct ScrambleSource {
    pub schema: String,
    pub table: String,
    /// Correlation name the original query used for the base table.
    pub alias: String,
    pub block_column: String,
    pub total_blocks: u32,
    pub sample_ratio: f64,
}

impl PartialEq for ScrambleSource {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema
            && self.table == other.table
            && self.alias == other.alias
            && self.block_column == other.block_column
            && self.total_blocks == other.total_blocks
            && self.sample_ratio.to_bits() == other.sample_ratio.to_bits()
    }
}

impl Eq for ScrambleSource {}

/// One aggregate call of the original select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateCall {
    pub func: AggFunc,
    /// `None` for `count(*)`.
    pub arg: Option<Expr>,
}

/// Where an output column of the original query comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Group(usize),
    Aggregate(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub name: String,
    pub source: OutputSource,
}

/// Decomposition of an aggregate query into mergeable pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateLayout {
    pub source: ScrambleSource,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub aggregates: Vec<AggregateCall>,
    pub outputs: Vec<OutputColumn>,
}

impl AggregateLayout {
    /// Decompose `query` if it can be answered progressively.
    ///
    /// Eligible queries read exactly one base table that has a registered
    /// scramble, carry no ORDER BY or LIMIT, keep subqueries and aggregates
    /// out of WHERE and GROUP BY, and select only non-distinct supported
    /// aggregates or grouping expressions, with at least one aggregate.
    pub fn from_query(query: &SelectQuery, scrambles: &ScrambleMetaSet) -> Option<Self> {
        if !query.is_aggregate()
            || query.from_list.len() != 1
            || !query.order_by.is_empty()
            || query.limit.is_some()
        {
            return None;
        }
        let Relation::Base {
            schema,
            table,
            alias,
        } = &query.from_list[0]
        else {
            return None;
        };
        let meta = scrambles.lookup(schema.as_deref(), table)?;
        if meta.block_count == 0 {
            return None;
        }

        let nested = |e: &Expr| e.contains_aggregate() || e.contains_subquery();
        if query.filter.as_ref().is_some_and(nested) || query.group_by.iter().any(nested) {
            return None;
        }

        let mut aggregates = Vec::new();
        let mut outputs = Vec::with_capacity(query.select_list.len());
        for (position, item) in query.select_list.iter().enumerate() {
            let source = match &item.expr {
                Expr::Aggregate {
                    func,
                    arg,
                    distinct: false,
                } => {
                    if arg.as_deref().is_some_and(nested) {
                        return None;
                    }
                    if arg.is_none() && *func != AggFunc::Count {
                        return None;
                    }
                    aggregates.push(AggregateCall {
                        func: *func,
                        arg: arg.as_deref().cloned(),
                    });
                    OutputSource::Aggregate(aggregates.len() - 1)
                }
                expr => OutputSource::Group(query.group_by.iter().position(|g| g == expr)?),
            };
            outputs.push(OutputColumn {
                name: item.output_name(position),
                source,
            });
        }
        if aggregates.is_empty() {
            return None;
        }

        Some(AggregateLayout {
            source: ScrambleSource {
                schema: meta.schema.clone(),
                table: meta.table.clone(),
                alias: alias.clone().unwrap_or_else(|| table.clone()),
                block_column: meta.block_column.clone(),
                total_blocks: meta.block_count,
                sample_ratio: meta.sample_ratio,
            },
            filter: query.filter.clone(),
            group_by: query.group_by.clone(),
            aggregates,
            outputs,
        })
    }

    /// Total number of partial columns a leaf returns after the groups.
    pub fn partial_width(&self) -> usize {
        self.aggregates.iter().map(|a| a.func.partial_width()).sum()
    }

    /// Partial-aggregate query over one block range of the scramble.
    ///
    /// Columns: `g{i}` per grouping expression, then per aggregate `j` the
    /// partial columns `p{j}_*` in [`PartialState::from_cells`] order.
    ///
    /// [`PartialState::from_cells`]: super::PartialState::from_cells
    pub fn leaf_query(&self, blocks: BlockRange) -> SelectQuery {
        let mut select_list: Vec<SelectItem> = self
            .group_by
            .iter()
            .enumerate()
            .map(|(i, g)| SelectItem::aliased(g.clone(), &format!("g{i}")))
            .collect();

        for (j, call) in self.aggregates.iter().enumerate() {
            let arg = call.arg.clone().unwrap_or_else(|| Expr::int(1));
            let count = match &call.arg {
                Some(a) => Expr::agg(AggFunc::Count, a.clone()),
                None => Expr::count_star(),
            };
            let squared = Expr::binary(BinaryOp::Multiply, arg.clone(), arg.clone());
            let columns = match call.func {
                AggFunc::Count => vec![(count, "count")],
                AggFunc::Sum => vec![(Expr::agg(AggFunc::Sum, arg), "sum"), (count, "count")],
                AggFunc::Avg | AggFunc::Variance | AggFunc::Stddev => vec![
                    (Expr::agg(AggFunc::Sum, arg), "sum"),
                    (Expr::agg(AggFunc::Sum, squared), "sumsq"),
                    (count, "count"),
                ],
                AggFunc::Min => vec![(Expr::agg(AggFunc::Min, arg), "min")],
                AggFunc::Max => vec![(Expr::agg(AggFunc::Max, arg), "max")],
            };
            for (expr, suffix) in columns {
                select_list.push(SelectItem::aliased(expr, &format!("p{j}_{suffix}")));
            }
        }

        let block = Expr::column(&self.source.alias, &self.source.block_column);
        let in_range = Expr::and(
            Expr::binary(BinaryOp::GtEq, block.clone(), Expr::int(i64::from(blocks.start))),
            Expr::binary(BinaryOp::Lt, block, Expr::int(i64::from(blocks.end))),
        );
        let filter = match &self.filter {
            Some(f) => Expr::and(f.clone(), in_range),
            None => in_range,
        };

        SelectQuery::new(
            select_list,
            vec![Relation::base(
                &self.source.schema,
                &self.source.table,
                Some(self.source.alias.as_str()),
            )],
        )
        .with_filter(filter)
        .with_group_by(self.group_by.clone())
    }

    /// Scaled estimate of the original query from a merged partial.
    pub fn finalize(&self, snapshot: &PartialSnapshot, z: f64) -> FinalizedAggregate {
        estimate::finalize(self, snapshot, z)
    }
}

/// Split `[0, total)` into at most `max_leaves` contiguous ranges whose
/// sizes differ by at most one.
pub fn plan_block_ranges(total: u32, max_leaves: usize) -> Vec<BlockRange> {
    let leaves = (total as usize).min(max_leaves).max(1) as u32;
    let base = total / leaves;
    let extra = total % leaves;
    let mut ranges = Vec::with_capacity(leaves as usize);
    let mut start = 0;
    for i in 0..leaves {
        let len = base + u32::from(i < extra);
        ranges.push(BlockRange::new(start, start + len));
        start += len;
    }
    ranges
}

/// Add the leaves, combiners and fan-out node answering `layout` to `plan`.
/// Returns the fan-out node.
pub fn build_async_subtree(
    plan: &mut QueryPlan,
    layout: AggregateLayout,
    config: &AqpConfig,
) -> Result<NodeId, AqpError> {
    let layout = Arc::new(layout);
    let mut level: Vec<NodeId> = plan_block_ranges(layout.source.total_blocks, config.max_async_leaves)
        .into_iter()
        .map(|blocks| plan.add_node(PlanNode::aggregate_leaf(Arc::clone(&layout), blocks)))
        .collect();

    let fan_in = config.combiner_fan_in.max(2);
    while level.len() > 1 {
        level = level
            .chunks(fan_in)
            .map(|chunk| match chunk {
                [single] => *single,
                many => plan.add_node(PlanNode::combiner(many.to_vec())),
            })
            .collect();
    }

    let top = level
        .first()
        .copied()
        .ok_or_else(|| AqpError::InternalError("async subtree has no leaves".into()))?;
    Ok(plan.add_node(PlanNode::async_aggregate(layout, top)))
}

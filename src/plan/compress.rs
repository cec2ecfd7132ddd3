//! Plan compression.
//!
//! Two rewrites run to a fixed point, in this order:
//!
//! 1. **Common subplan merge**: structurally equal subplans are merged
//!    into one node whose token is broadcast to every consumer. Candidates
//!    are bucketed by fingerprint before the recursive comparison.
//! 2. **Chain collapse**: a `CreateTable` node with exactly one consumer
//!    edge is inlined into that consumer as a derived table (or a filter
//!    subquery), and its own dependencies are spliced into the consumer's
//!    dependency list in its place. Placeholder slots are renumbered so
//!    that dependency `i` still resolves slot `i`.
//!
//! Merging first keeps shared work shared: a merged node has several
//! consumer edges and is therefore never inlined.
//!
//! Nodes of an async-aggregation subtree are never inlined, so the
//! subtree survives compression intact and stays observable.

use std::collections::BTreeMap;

use tracing::debug;

use super::{NodeId, NodeKind, QueryPlan};
use crate::error::AqpError;
use crate::sql::SlotReplacement;

/// What one [`compress`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub collapsed: usize,
    pub merged: usize,
    pub pruned: usize,
}

impl CompressionStats {
    pub fn is_noop(&self) -> bool {
        *self == CompressionStats::default()
    }
}

/// Compress `plan` in place. Idempotent: compressing a compressed plan
/// changes nothing.
pub fn compress(plan: &mut QueryPlan) -> Result<CompressionStats, AqpError> {
    plan.validate()?;
    let before = plan.len();
    let mut stats = CompressionStats::default();
    loop {
        let (merged, pruned) = merge_common_subplans(plan)?;
        let collapsed = collapse_chains(plan)?;
        stats.collapsed += collapsed;
        stats.merged += merged;
        stats.pruned += pruned;
        if collapsed == 0 && merged == 0 {
            break;
        }
    }
    plan.validate()?;
    debug!(
        before,
        after = plan.len(),
        collapsed = stats.collapsed,
        merged = stats.merged,
        "plan compressed"
    );
    Ok(stats)
}

/// Compressed copy of `plan`; the input is left untouched.
pub fn compressed(plan: &QueryPlan) -> Result<QueryPlan, AqpError> {
    let mut copy = plan.deep_copy();
    compress(&mut copy)?;
    Ok(copy)
}

fn collapse_candidate(plan: &QueryPlan) -> Option<(NodeId, usize)> {
    plan.node_ids().into_iter().find_map(|id| {
        if id == plan.root() || plan.node(id).ok()?.kind != NodeKind::CreateTable {
            return None;
        }
        match plan.dependents(id).as_slice() {
            [(consumer, position)] => {
                let kind = &plan.node(*consumer).ok()?.kind;
                matches!(kind, NodeKind::Select | NodeKind::CreateTable)
                    .then_some((*consumer, *position))
            }
            _ => None,
        }
    })
}

fn collapse_chains(plan: &mut QueryPlan) -> Result<usize, AqpError> {
    let mut collapsed = 0;
    while let Some((consumer, position)) = collapse_candidate(plan) {
        inline_dependency(plan, consumer, position)?;
        collapsed += 1;
    }
    Ok(collapsed)
}

/// Replace dependency `position` of `consumer` by the dependency's own
/// query.
fn inline_dependency(plan: &mut QueryPlan, consumer: NodeId, position: usize) -> Result<(), AqpError> {
    let child_id = *plan
        .node(consumer)?
        .dependencies
        .get(position)
        .ok_or_else(|| AqpError::InternalError(format!("{consumer} has no dependency {position}")))?;
    let child = plan.remove_node(child_id)?;
    let mut child_query = child
        .query
        .ok_or_else(|| AqpError::InternalError(format!("{child_id} has no query to inline")))?;
    let inherited = child.dependencies.len();

    // Child slot j becomes consumer slot position + j.
    child_query.map_slots(|slot| slot + position);

    let node = plan.node_mut(consumer)?;
    let query = node
        .query
        .as_mut()
        .ok_or_else(|| AqpError::InternalError(format!("{consumer} has no query")))?;
    let mut replacement = Some(child_query);
    query.substitute_slots(&mut |slot| {
        if slot == position {
            match replacement.take() {
                Some(q) => SlotReplacement::Query(q),
                None => SlotReplacement::Slot(slot),
            }
        } else if slot > position {
            SlotReplacement::Slot(slot + inherited - 1)
        } else {
            SlotReplacement::Slot(slot)
        }
    });
    if replacement.is_some() {
        return Err(AqpError::InternalError(format!(
            "{consumer} declares no placeholder {position}"
        )));
    }
    node.dependencies
        .splice(position..=position, child.dependencies);
    Ok(())
}

/// Merge structurally equal subplans. Returns `(merged, pruned)`.
///
/// A consumer that depended on two equal subplans keeps both edges to the
/// surviving node: placeholder slot `i` binds dependency `i`, so dropping a
/// duplicate edge would shift every later slot.
fn merge_common_subplans(plan: &mut QueryPlan) -> Result<(usize, usize), AqpError> {
    let mut buckets: BTreeMap<u64, Vec<NodeId>> = BTreeMap::new();
    for id in plan.node_ids() {
        if id != plan.root() {
            buckets.entry(plan.fingerprint(id)?).or_default().push(id);
        }
    }

    let mut merged = 0;
    for ids in buckets.into_values().filter(|ids| ids.len() > 1) {
        let mut kept: Vec<NodeId> = Vec::new();
        for id in ids {
            let twin = kept.iter().copied().find(|k| plan.subplan_eq(*k, plan, id));
            match twin {
                Some(canonical) => {
                    for (consumer, position) in plan.dependents(id) {
                        plan.node_mut(consumer)?.dependencies[position] = canonical;
                    }
                    merged += 1;
                }
                None => kept.push(id),
            }
        }
    }

    let pruned = plan.prune_unreachable();
    Ok((merged, pruned))
}

//! Executable node graph.
//!
//! A [`QueryPlan`] is an arena of [`PlanNode`]s addressed by [`NodeId`].
//! Each node holds a query template and an ordered list of dependencies;
//! dependency `i` feeds placeholder slot `i` of the template. The root is
//! always a [`NodeKind::Select`] node whose rows are returned to the caller.
//!
//! Consumers of a node are not stored: they are derived from the
//! dependency lists ([`QueryPlan::dependents`]), and the executor wires one
//! token queue per dependency edge.
//!
//! # Prior Art: Graph Algorithms
//!
//! Acyclicity checks and execution order use Kahn's algorithm:
//! - Kahn, A.B. (1962). "Topological sorting of large networks."
//!   Communications of the ACM, 5(11), 558–562.

pub mod builder;
pub mod compress;
pub mod executor;
pub mod token;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::connection::QueryResult;
use crate::error::AqpError;
use crate::hash;
use crate::ola::{AggregateLayout, BlockRange, PartialSnapshot};
use crate::sql::{SelectQuery, SlotReplacement};

pub use builder::PlanBuilder;
pub use compress::{CompressionStats, compress};
pub use executor::{ExecutionHandle, PlanExecutor, PlanOutcome};
pub use token::{ExecutionToken, TableRef, TokenReceiver, TokenSender, token_channel};

/// Build the plan for `query` and compress it.
pub fn compile(
    query: &SelectQuery,
    scrambles: &crate::scramble::ScrambleMetaSet,
    config: &crate::config::AqpConfig,
) -> Result<QueryPlan, AqpError> {
    let mut plan = PlanBuilder::new(scrambles, config).build(query)?;
    compress(&mut plan)?;
    Ok(plan)
}

/// Stable identifier of a node inside one [`QueryPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn from_index(index: usize) -> Self {
        NodeId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What a node does when it runs, and so what kind of token it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs its query and returns the rows. Produces `Rows`.
    Select,
    /// Materializes its query into a temporary table. Produces `Table`.
    CreateTable,
    /// Fan-out node of an async-aggregation subtree: finalizes the merged
    /// partial aggregate and materializes it. Produces `Table`.
    AsyncAggregate { layout: Arc<AggregateLayout> },
    /// Partial aggregate over one block range of a scramble. Produces
    /// `Partial`.
    AggregateLeaf {
        layout: Arc<AggregateLayout>,
        blocks: BlockRange,
    },
    /// Merges the partial aggregates of its dependencies. Produces
    /// `Partial`.
    Combiner,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Select => "select",
            NodeKind::CreateTable => "create_table",
            NodeKind::AsyncAggregate { .. } => "async_aggregate",
            NodeKind::AggregateLeaf { .. } => "aggregate_leaf",
            NodeKind::Combiner => "combiner",
        }
    }

    /// Part of an async-aggregation subtree. Such nodes are never inlined
    /// into their consumer.
    pub fn is_async_member(&self) -> bool {
        matches!(
            self,
            NodeKind::AsyncAggregate { .. } | NodeKind::AggregateLeaf { .. } | NodeKind::Combiner
        )
    }

    /// Produces a partial aggregate rather than a table or rows.
    pub fn is_partial_producer(&self) -> bool {
        matches!(self, NodeKind::AggregateLeaf { .. } | NodeKind::Combiner)
    }
}

/// Raw output of a node before it is wrapped into a token.
#[derive(Debug)]
pub enum NodeOutput {
    Rows(QueryResult),
    Table(TableRef),
    Partial(PartialSnapshot),
}

/// A unit of planned work.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub kind: NodeKind,
    /// Query template. `None` for nodes that do not talk to the backend
    /// through a query of their own (combiners, fan-out nodes).
    pub query: Option<SelectQuery>,
    /// Upstream nodes; entry `i` resolves placeholder slot `i`.
    pub dependencies: Vec<NodeId>,
}

impl PlanNode {
    pub fn select(query: SelectQuery, dependencies: Vec<NodeId>) -> Self {
        PlanNode {
            kind: NodeKind::Select,
            query: Some(query),
            dependencies,
        }
    }

    pub fn create_table(query: SelectQuery, dependencies: Vec<NodeId>) -> Self {
        PlanNode {
            kind: NodeKind::CreateTable,
            query: Some(query),
            dependencies,
        }
    }

    pub fn aggregate_leaf(layout: Arc<AggregateLayout>, blocks: BlockRange) -> Self {
        let query = layout.leaf_query(blocks);
        PlanNode {
            kind: NodeKind::AggregateLeaf { layout, blocks },
            query: Some(query),
            dependencies: Vec::new(),
        }
    }

    pub fn combiner(dependencies: Vec<NodeId>) -> Self {
        PlanNode {
            kind: NodeKind::Combiner,
            query: None,
            dependencies,
        }
    }

    pub fn async_aggregate(layout: Arc<AggregateLayout>, source: NodeId) -> Self {
        PlanNode {
            kind: NodeKind::AsyncAggregate { layout },
            query: None,
            dependencies: vec![source],
        }
    }

    /// Number of placeholders declared by the template.
    pub fn placeholder_count(&self) -> usize {
        self.query.as_ref().map_or(0, SelectQuery::placeholder_count)
    }

    /// Resolve the template from the tokens of the dependencies.
    ///
    /// Token `i` resolves slot `i`; extra tokens are ignored. A template
    /// without placeholders is returned unchanged whatever the input.
    pub fn create_query(&self, tokens: &[ExecutionToken]) -> Result<SelectQuery, AqpError> {
        let template = self.query.as_ref().ok_or_else(|| {
            AqpError::InternalError(format!("{} node has no query template", self.kind.as_str()))
        })?;
        let expected = template.placeholder_count();
        if expected == 0 {
            return Ok(template.clone());
        }
        if tokens.len() < expected {
            return Err(AqpError::MissingTokens {
                expected,
                actual: tokens.len(),
            });
        }

        let mut unresolved = None;
        let mut resolved = template.clone();
        resolved.substitute_slots(&mut |slot| match tokens.get(slot).and_then(|t| t.as_table()) {
            Some(t) => SlotReplacement::Table {
                schema: t.schema.clone(),
                table: t.table.clone(),
            },
            None => {
                unresolved.get_or_insert(slot);
                SlotReplacement::Slot(slot)
            }
        });
        match unresolved {
            Some(slot) => Err(AqpError::InternalError(format!(
                "token for placeholder {slot} does not name a table"
            ))),
            None => Ok(resolved),
        }
    }

    /// Wrap a node output into the token kind this node declares.
    pub fn create_token(&self, output: NodeOutput) -> Result<ExecutionToken, AqpError> {
        match (&self.kind, output) {
            (NodeKind::Select, NodeOutput::Rows(rows)) => Ok(ExecutionToken::Rows(Arc::new(rows))),
            (NodeKind::CreateTable | NodeKind::AsyncAggregate { .. }, NodeOutput::Table(t)) => {
                Ok(ExecutionToken::Table(t))
            }
            (kind, NodeOutput::Partial(p)) if kind.is_partial_producer() => {
                Ok(ExecutionToken::Partial(Arc::new(p)))
            }
            (kind, output) => Err(AqpError::InternalError(format!(
                "{} node cannot produce {output:?}",
                kind.as_str()
            ))),
        }
    }
}

/// Arena of plan nodes with a designated root.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    nodes: Vec<Option<PlanNode>>,
    root: NodeId,
}

impl QueryPlan {
    /// A plan consisting of `root` alone.
    pub fn new(root: PlanNode) -> Self {
        QueryPlan {
            nodes: vec![Some(root)],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn add_node(&mut self, node: PlanNode) -> NodeId {
        self.nodes.push(Some(node));
        NodeId(self.nodes.len() - 1)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    pub fn node(&self, id: NodeId) -> Result<&PlanNode, AqpError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(AqpError::NodeNotFound(id.0))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut PlanNode, AqpError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(AqpError::NodeNotFound(id.0))
    }

    /// Remove a node. Edges pointing at it are left for the caller to fix.
    pub fn remove_node(&mut self, id: NodeId) -> Result<PlanNode, AqpError> {
        if id == self.root {
            return Err(AqpError::InvalidArgument("cannot remove the root node".into()));
        }
        self.nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(AqpError::NodeNotFound(id.0))
    }

    /// Live node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumers of `id` as `(consumer, dependency position)` pairs.
    pub fn dependents(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        let mut out = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(node) = node {
                for (pos, dep) in node.dependencies.iter().enumerate() {
                    if *dep == id {
                        out.push((NodeId(i), pos));
                    }
                }
            }
        }
        out
    }

    /// Human-readable name for a node.
    pub fn node_name(&self, id: NodeId) -> String {
        match self.node(id) {
            Ok(node) => format!("{id}:{}", node.kind.as_str()),
            Err(_) => format!("{id}:missing"),
        }
    }

    /// Live nodes in execution order (dependencies first), via Kahn's
    /// algorithm.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, AqpError> {
        let ids = self.node_ids();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut consumers: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &id in &ids {
            let node = self.node(id)?;
            in_degree.insert(id, node.dependencies.len());
            for &dep in &node.dependencies {
                consumers.entry(dep).or_default().push(id);
            }
        }

        let mut queue: VecDeque<NodeId> = ids
            .iter()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &c in consumers.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(deg) = in_degree.get_mut(&c) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(c);
                    }
                }
            }
        }

        if order.len() < ids.len() {
            let processed: HashSet<_> = order.into_iter().collect();
            let cycle = ids
                .iter()
                .filter(|id| !processed.contains(id))
                .map(|id| self.node_name(*id))
                .collect();
            return Err(AqpError::CycleDetected(cycle));
        }
        Ok(order)
    }

    /// Check the structural invariants of the plan.
    ///
    /// - every dependency is a live node and the graph is acyclic;
    /// - the root is a `Select` node;
    /// - query nodes declare exactly one placeholder per dependency, using
    ///   slots `0..n` once each;
    /// - async-aggregation nodes are wired leaf → combiner → fan-out.
    pub fn validate(&self) -> Result<(), AqpError> {
        let root = self.node(self.root)?;
        if root.kind != NodeKind::Select {
            return Err(AqpError::InternalError(format!(
                "root must be a select node, found {}",
                root.kind.as_str()
            )));
        }

        for id in self.node_ids() {
            let node = self.node(id)?;
            for &dep in &node.dependencies {
                if !self.contains(dep) {
                    return Err(AqpError::InternalError(format!(
                        "{} depends on missing node {dep}",
                        self.node_name(id)
                    )));
                }
            }
            self.validate_node(id, node)?;
        }

        self.topological_order().map(|_| ())
    }

    fn validate_node(&self, id: NodeId, node: &PlanNode) -> Result<(), AqpError> {
        let bad = |msg: String| Err(AqpError::InternalError(format!("{}: {msg}", self.node_name(id))));
        match &node.kind {
            NodeKind::Select | NodeKind::CreateTable => {
                let Some(query) = &node.query else {
                    return bad("missing query template".into());
                };
                let mut slots = query.placeholder_slots();
                slots.sort_unstable();
                let expected: Vec<usize> = (0..node.dependencies.len()).collect();
                if slots != expected {
                    return bad(format!(
                        "placeholder slots {slots:?} do not match {} dependencies",
                        node.dependencies.len()
                    ));
                }
            }
            NodeKind::AggregateLeaf { .. } => {
                if !node.dependencies.is_empty() || node.placeholder_count() != 0 {
                    return bad("aggregate leaves read a scramble directly".into());
                }
            }
            NodeKind::Combiner | NodeKind::AsyncAggregate { .. } => {
                if node.dependencies.is_empty() {
                    return bad("no inputs".into());
                }
                if matches!(node.kind, NodeKind::AsyncAggregate { .. })
                    && node.dependencies.len() != 1
                {
                    return bad("fan-out node takes exactly one merged input".into());
                }
                for &dep in &node.dependencies {
                    if !self.node(dep)?.kind.is_partial_producer() {
                        return bad(format!("input {} is not a partial aggregate", self.node_name(dep)));
                    }
                }
            }
        }
        Ok(())
    }

    /// `id` and every node it transitively depends on.
    pub fn reachable_from(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if let Ok(node) = self.node(n) {
                stack.extend(node.dependencies.iter().copied());
            }
        }
        let mut out: Vec<NodeId> = seen.into_iter().collect();
        out.sort();
        out
    }

    /// Remove nodes the root no longer reaches. Returns how many went.
    pub fn prune_unreachable(&mut self) -> usize {
        let reachable: HashSet<NodeId> = self.reachable_from(self.root).into_iter().collect();
        let mut removed = 0;
        for (i, slot) in self.nodes.iter_mut().enumerate() {
            if slot.is_some() && !reachable.contains(&NodeId(i)) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Independent copy of the subgraph reachable from the root, with ids
    /// renumbered densely.
    pub fn deep_copy(&self) -> QueryPlan {
        let reachable = self.reachable_from(self.root);
        let remap: HashMap<NodeId, NodeId> = reachable
            .iter()
            .enumerate()
            .map(|(new, old)| (*old, NodeId(new)))
            .collect();
        let nodes = reachable
            .iter()
            .map(|old| {
                self.node(*old).ok().map(|node| PlanNode {
                    kind: node.kind.clone(),
                    query: node.query.clone(),
                    dependencies: node
                        .dependencies
                        .iter()
                        .filter_map(|d| remap.get(d).copied())
                        .collect(),
                })
            })
            .collect();
        QueryPlan {
            nodes,
            root: remap.get(&self.root).copied().unwrap_or(NodeId(0)),
        }
    }

    /// Structural equality of the subplan rooted at `a` in `self` and the
    /// subplan rooted at `b` in `other`: same kinds, same templates, and
    /// pairwise equal dependencies in order.
    pub fn subplan_eq(&self, a: NodeId, other: &QueryPlan, b: NodeId) -> bool {
        let (Ok(na), Ok(nb)) = (self.node(a), other.node(b)) else {
            return false;
        };
        na.kind == nb.kind
            && na.query == nb.query
            && na.dependencies.len() == nb.dependencies.len()
            && na
                .dependencies
                .iter()
                .zip(&nb.dependencies)
                .all(|(da, db)| self.subplan_eq(*da, other, *db))
    }

    /// Fingerprint of the subplan rooted at `id`. Structurally equal
    /// subplans have equal fingerprints.
    pub fn fingerprint(&self, id: NodeId) -> Result<u64, AqpError> {
        let mut memo = HashMap::new();
        self.fingerprint_memo(id, &mut memo)
    }

    fn fingerprint_memo(
        &self,
        id: NodeId,
        memo: &mut HashMap<NodeId, u64>,
    ) -> Result<u64, AqpError> {
        if let Some(fp) = memo.get(&id) {
            return Ok(*fp);
        }
        let node = self.node(id)?;
        let kind = format!("{:?}", node.kind);
        let query = node.query.as_ref().map(|q| format!("{q:?}"));
        let own = hash::fingerprint_parts(&[Some(kind.as_str()), query.as_deref()]);
        let children = node
            .dependencies
            .iter()
            .map(|d| self.fingerprint_memo(*d, memo))
            .collect::<Result<Vec<_>, _>>()?;
        let fp = hash::combine(own, &children);
        memo.insert(id, fp);
        Ok(fp)
    }

    /// Indented tree rendering, root first. Shared nodes are printed under
    /// every consumer.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_node(self.root, 0, &mut out);
        out
    }

    fn explain_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        match self.node(id) {
            Ok(node) => {
                let detail = match (&node.kind, &node.query) {
                    (NodeKind::AggregateLeaf { blocks, .. }, _) => {
                        format!(" blocks [{}, {})", blocks.start, blocks.end)
                    }
                    (_, Some(q)) => format!(" {q}"),
                    (_, None) => String::new(),
                };
                out.push_str(&format!("{indent}{}{detail}\n", self.node_name(id)));
                for dep in &node.dependencies {
                    self.explain_node(*dep, depth + 1, out);
                }
            }
            Err(_) => out.push_str(&format!("{indent}{id}:missing\n")),
        }
    }
}

impl PartialEq for QueryPlan {
    fn eq(&self, other: &Self) -> bool {
        self.subplan_eq(self.root, other, other.root)
    }
}

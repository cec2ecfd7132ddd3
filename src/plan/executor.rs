//! Threaded plan execution.
//!
//! Every live node runs on its own scoped thread. A node first receives one
//! token from each of its listening channels (in dependency order), then
//! resolves its template, talks to the backend, and sends its token on
//! every broadcasting channel. A failure travels the same way: the failing
//! node pushes its error downstream instead of a token, and every consumer
//! forwards the first error it sees, so the caller receives exactly one
//! terminal error.
//!
//! Backend access follows [`ConnectionDiscipline`]: either every statement
//! goes through the one connection under a mutex, or each node works on
//! its own clone.
//!
//! Aborting through an [`ExecutionHandle`] cancels in-flight statements,
//! sends an abort error on every channel so waiting nodes wake up, and
//! stops nodes that have not reached the backend yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::token::{ExecutionToken, TableRef, TokenReceiver, TokenSender, token_channel};
use super::{NodeId, NodeKind, NodeOutput, PlanNode, QueryPlan};
use crate::config::{AqpConfig, ConnectionDiscipline};
use crate::connection::{AbortHandle, DbmsConnection, QueryResult};
use crate::error::AqpError;
use crate::ola::{PartialSnapshot, ProgressListener, ProgressTracker};
use crate::sql::SqlSyntax;

/// Result of one plan execution.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub result: QueryResult,
    pub plan_id: Uuid,
    /// Statements sent to the backend, setup and cleanup included.
    pub statements_issued: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    next_backend: AtomicU64,
    /// Live backends keyed by registration; clones leave when closed.
    backends: Mutex<Vec<(u64, Arc<dyn AbortHandle>)>>,
    senders: Mutex<Vec<TokenSender>>,
}

/// Cloneable handle that aborts the executions of one executor.
///
/// Once aborted, the executor refuses further executions.
#[derive(Clone, Default)]
pub struct ExecutionHandle {
    state: Arc<AbortState>,
}

impl ExecutionHandle {
    pub fn abort(&self) {
        if self.state.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("aborting plan execution");
        for (_, backend) in self.state.backends.lock().iter() {
            if let Err(e) = backend.abort() {
                warn!(error = %e, "failed to cancel backend statement");
            }
        }
        for sender in self.state.senders.lock().iter() {
            sender.close(AqpError::Aborted("execution aborted by caller".into()));
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), AqpError> {
        if self.is_aborted() {
            Err(AqpError::Aborted("execution aborted by caller".into()))
        } else {
            Ok(())
        }
    }

    /// Track `handle` until `unregister_backend` is called with the
    /// returned key.
    fn register_backend(&self, handle: Arc<dyn AbortHandle>) -> u64 {
        let key = self.state.next_backend.fetch_add(1, Ordering::SeqCst);
        let mut backends = self.state.backends.lock();
        if self.is_aborted() {
            let _ = handle.abort();
        }
        backends.push((key, handle));
        key
    }

    fn unregister_backend(&self, key: u64) {
        self.state.backends.lock().retain(|(k, _)| *k != key);
    }

    fn registered_backends(&self) -> usize {
        self.state.backends.lock().len()
    }

    fn register_sender(&self, sender: &TokenSender) {
        let mut senders = self.state.senders.lock();
        if self.is_aborted() {
            sender.close(AqpError::Aborted("execution aborted by caller".into()));
        }
        senders.push(sender.clone());
    }

    fn release_senders(&self) {
        self.state.senders.lock().clear();
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("aborted", &self.is_aborted())
            .field("backends", &self.registered_backends())
            .finish()
    }
}

/// Runs query plans against one backend connection.
pub struct PlanExecutor {
    connection: Mutex<Box<dyn DbmsConnection>>,
    syntax: Arc<dyn SqlSyntax>,
    config: AqpConfig,
    handle: ExecutionHandle,
}

/// Per-execution state shared by the node threads.
struct Run<'a> {
    plan_id: Uuid,
    prefix: String,
    statements: AtomicUsize,
    created: Mutex<Vec<TableRef>>,
    trackers: HashMap<NodeId, Arc<ProgressTracker>>,
    listener: Option<&'a dyn ProgressListener>,
}

impl Run<'_> {
    fn temp_table(&self, id: NodeId) -> String {
        format!("{}_{}", self.prefix, id.index())
    }

    fn report(&self, id: NodeId, snapshot: &Arc<PartialSnapshot>) {
        let (Some(listener), Some(tracker)) = (self.listener, self.trackers.get(&id)) else {
            return;
        };
        match tracker.record(Arc::clone(snapshot)) {
            Ok(update) => {
                debug!(
                    node = %tracker.node(),
                    covered = update.estimate.covered_blocks,
                    total = update.estimate.total_blocks,
                    "progress"
                );
                listener.on_progress(&update);
            }
            Err(e) => warn!(node = %id, error = %e, "progress not reported"),
        }
    }
}

impl PlanExecutor {
    pub fn new(connection: Box<dyn DbmsConnection>, config: AqpConfig) -> Self {
        let syntax = connection.syntax();
        let handle = ExecutionHandle::default();
        handle.register_backend(connection.abort_handle());
        PlanExecutor {
            connection: Mutex::new(connection),
            syntax,
            config,
            handle,
        }
    }

    /// Handle for aborting executions from another thread.
    pub fn abort_handle(&self) -> ExecutionHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &AqpConfig {
        &self.config
    }

    pub fn into_connection(self) -> Box<dyn DbmsConnection> {
        self.connection.into_inner()
    }

    /// Execute `plan` and return the rows of its root.
    pub fn execute(&self, plan: &QueryPlan) -> Result<PlanOutcome, AqpError> {
        self.run(plan, None)
    }

    /// Execute `plan`, reporting intermediate estimates of every async
    /// aggregate to `listener` as its leaves complete.
    pub fn execute_with_progress(
        &self,
        plan: &QueryPlan,
        listener: &dyn ProgressListener,
    ) -> Result<PlanOutcome, AqpError> {
        self.run(plan, Some(listener))
    }

    fn run(
        &self,
        plan: &QueryPlan,
        listener: Option<&dyn ProgressListener>,
    ) -> Result<PlanOutcome, AqpError> {
        plan.validate()?;
        self.config.validate()?;
        self.handle.check()?;

        let started = Instant::now();
        let plan_id = Uuid::new_v4();
        let simple = plan_id.simple().to_string();
        let run = Run {
            plan_id,
            prefix: format!("{}_{}", self.config.temp_table_prefix, &simple[..8]),
            statements: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            trackers: self.trackers(plan)?,
            listener,
        };
        info!(
            plan_id = %run.plan_id,
            nodes = plan.len(),
            discipline = self.config.connection_discipline.as_str(),
            "executing plan"
        );

        let result = self.run_nodes(plan, &run);
        self.handle.release_senders();
        self.cleanup(&run);

        let result = match result {
            Err(e) if self.handle.is_aborted() && !e.is_abort() => {
                Err(AqpError::Aborted(e.to_string()))
            }
            other => other,
        };
        let statements_issued = run.statements.load(Ordering::SeqCst);
        match &result {
            Ok(rows) => info!(
                plan_id = %plan_id,
                rows = rows.row_count(),
                statements = statements_issued,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "plan finished"
            ),
            Err(e) => warn!(plan_id = %plan_id, error = %e, "plan failed"),
        }

        result.map(|result| PlanOutcome {
            result,
            plan_id,
            statements_issued,
            elapsed: started.elapsed(),
        })
    }

    /// One tracker per fan-out node, registered under every leaf and
    /// combiner of its subtree.
    fn trackers(&self, plan: &QueryPlan) -> Result<HashMap<NodeId, Arc<ProgressTracker>>, AqpError> {
        let mut trackers = HashMap::new();
        for id in plan.node_ids() {
            if let NodeKind::AsyncAggregate { layout } = &plan.node(id)?.kind {
                let tracker = Arc::new(ProgressTracker::new(
                    id,
                    Arc::clone(layout),
                    self.config.confidence_level_z,
                ));
                for member in plan.reachable_from(id) {
                    if plan.node(member)?.kind.is_partial_producer() {
                        trackers.insert(member, Arc::clone(&tracker));
                    }
                }
            }
        }
        Ok(trackers)
    }

    fn run_nodes(&self, plan: &QueryPlan, run: &Run<'_>) -> Result<QueryResult, AqpError> {
        let ids = plan.node_ids();
        let needs_scratch = ids.iter().any(|id| {
            plan.node(*id).is_ok_and(|n| {
                matches!(n.kind, NodeKind::CreateTable | NodeKind::AsyncAggregate { .. })
            })
        });
        if needs_scratch {
            let ddl = self
                .syntax
                .create_schema_if_not_exists(&self.config.scratch_schema);
            self.update(run, &ddl)?;
        }

        // One channel per dependency edge, plus the sink the root reports to.
        let mut inbound: HashMap<NodeId, Vec<TokenReceiver>> = HashMap::new();
        let mut outbound: HashMap<NodeId, Vec<TokenSender>> = HashMap::new();
        for &id in &ids {
            for &dep in &plan.node(id)?.dependencies {
                let (tx, rx) = token_channel();
                self.handle.register_sender(&tx);
                inbound.entry(id).or_default().push(rx);
                outbound.entry(dep).or_default().push(tx);
            }
        }
        let (sink_tx, sink) = token_channel();
        self.handle.register_sender(&sink_tx);
        outbound.entry(plan.root()).or_default().push(sink_tx);

        let mut work = Vec::with_capacity(ids.len());
        for &id in &ids {
            work.push((
                id,
                plan.node(id)?,
                inbound.remove(&id).unwrap_or_default(),
                outbound.remove(&id).unwrap_or_default(),
            ));
        }

        thread::scope(|scope| {
            for (id, node, inputs, outputs) in work {
                scope.spawn(move || {
                    let item = self.run_node(run, id, node, &inputs);
                    if let Err(e) = &item {
                        debug!(node = %id, error = %e, "node failed");
                    }
                    for sender in &outputs {
                        sender.send(item.clone());
                    }
                });
            }
        });

        match sink.recv()? {
            ExecutionToken::Rows(rows) => Ok(Arc::unwrap_or_clone(rows)),
            other => Err(AqpError::InternalError(format!(
                "root produced a {} token",
                other.kind_name()
            ))),
        }
    }

    fn run_node(
        &self,
        run: &Run<'_>,
        id: NodeId,
        node: &PlanNode,
        inputs: &[TokenReceiver],
    ) -> Result<ExecutionToken, AqpError> {
        let mut tokens = Vec::with_capacity(inputs.len());
        for input in inputs {
            tokens.push(input.recv()?);
        }
        self.handle.check()?;

        let output = match &node.kind {
            NodeKind::Select => {
                let sql = node.create_query(&tokens)?.to_sql(self.syntax.as_ref());
                NodeOutput::Rows(self.query(run, &sql)?)
            }
            NodeKind::CreateTable => {
                let select = node.create_query(&tokens)?.to_sql(self.syntax.as_ref());
                NodeOutput::Table(self.materialize(run, id, &select)?)
            }
            NodeKind::AggregateLeaf { layout, blocks } => {
                let sql = node.create_query(&[])?.to_sql(self.syntax.as_ref());
                let rows = self.query(run, &sql)?;
                NodeOutput::Partial(PartialSnapshot::from_leaf_result(layout, *blocks, &rows)?)
            }
            NodeKind::Combiner => NodeOutput::Partial(PartialSnapshot::merged(
                partials(&tokens)?.into_iter(),
            )?),
            NodeKind::AsyncAggregate { layout } => {
                let merged = PartialSnapshot::merged(partials(&tokens)?.into_iter())?;
                let estimate = layout.finalize(&merged, self.config.confidence_level_z);
                debug!(
                    node = %id,
                    groups = estimate.rows.len(),
                    fraction = estimate.fraction(),
                    "async aggregate finalized"
                );
                let select = estimate.to_select_sql(self.syntax.as_ref());
                NodeOutput::Table(self.materialize(run, id, &select)?)
            }
        };

        let token = node.create_token(output)?;
        if let ExecutionToken::Partial(snapshot) = &token {
            run.report(id, snapshot);
        }
        Ok(token)
    }

    fn materialize(&self, run: &Run<'_>, id: NodeId, select: &str) -> Result<TableRef, AqpError> {
        let table = TableRef::new(&self.config.scratch_schema, &run.temp_table(id));
        let ddl = self
            .syntax
            .create_table_as(&table.schema, &table.table, &[], select);
        self.update(run, &ddl)?;
        run.created.lock().push(table.clone());
        Ok(table)
    }

    /// Run `f` on a connection chosen by the configured discipline. The
    /// abort flag is checked once the connection is in hand.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn DbmsConnection) -> Result<T, AqpError>,
    ) -> Result<T, AqpError> {
        match self.config.connection_discipline {
            ConnectionDiscipline::Serialized => {
                let mut conn = self.connection.lock();
                self.handle.check()?;
                f(conn.as_mut())
            }
            ConnectionDiscipline::ClonePerBranch => {
                let mut conn = self.connection.lock().copy()?;
                let key = self.handle.register_backend(conn.abort_handle());
                let result = self.handle.check().and_then(|()| f(conn.as_mut()));
                self.handle.unregister_backend(key);
                if let Err(e) = conn.close() {
                    warn!(error = %e, "failed to close cloned connection");
                }
                result
            }
        }
    }

    fn query(&self, run: &Run<'_>, sql: &str) -> Result<QueryResult, AqpError> {
        self.with_connection(|conn| {
            run.statements.fetch_add(1, Ordering::SeqCst);
            debug!(sql, "query");
            conn.execute(sql)
        })
    }

    fn update(&self, run: &Run<'_>, sql: &str) -> Result<(), AqpError> {
        self.with_connection(|conn| {
            run.statements.fetch_add(1, Ordering::SeqCst);
            debug!(sql, "update");
            conn.execute_update(sql)?;
            conn.invalidate_metadata();
            Ok(())
        })?;
        if self.config.connection_discipline == ConnectionDiscipline::ClonePerBranch {
            self.connection.lock().invalidate_metadata();
        }
        Ok(())
    }

    /// Drop the temporary tables of a run. Runs after aborts too, on the
    /// primary connection; failures are logged and ignored.
    fn cleanup(&self, run: &Run<'_>) {
        let created = std::mem::take(&mut *run.created.lock());
        if !self.config.drop_temp_tables || created.is_empty() {
            return;
        }
        let mut conn = self.connection.lock();
        for table in created.iter().rev() {
            let sql = self.syntax.drop_table_if_exists(&table.schema, &table.table);
            run.statements.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = conn.execute_update(&sql) {
                warn!(table = %table, error = %e, "failed to drop temporary table");
            }
        }
        conn.invalidate_metadata();
        debug!(plan_id = %run.plan_id, dropped = created.len(), "temporary tables dropped");
    }
}

fn partials(tokens: &[ExecutionToken]) -> Result<Vec<&PartialSnapshot>, AqpError> {
    tokens
        .iter()
        .map(|t| {
            t.as_partial().map(Arc::as_ref).ok_or_else(|| {
                AqpError::InternalError(format!("expected a partial token, got {}", t.kind_name()))
            })
        })
        .collect()
}

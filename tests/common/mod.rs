//! Shared helpers for integration tests.
//!
//! [`StubConnection`] is a scripted in-memory backend: statements are
//! matched against substring rules in registration order, every statement
//! is logged, and catalogue lookups are counted so tests can assert on
//! backend round trips.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use approxql::connection::{AbortHandle, ColumnInfo, DbmsConnection, MetaDataProvider};
use approxql::sql::{
    AggFunc, Expr, PostgresSyntax, Relation, SelectItem, SelectQuery, SqlSyntax,
};
use approxql::{AqpError, QueryResult, ScrambleMeta, ScrambleMetaSet, Value};
use crossbeam::channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

enum Response {
    Rows(QueryResult),
    Fail(String),
    /// Block until the connection is aborted.
    Block,
}

struct Rule {
    pattern: String,
    response: Response,
}

pub struct StubState {
    log: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
    /// Dropped on abort, which disconnects `abort_signal` for every waiter.
    abort_trigger: Mutex<Option<Sender<()>>>,
    abort_signal: Receiver<()>,
    pub schema_calls: AtomicUsize,
    pub table_calls: AtomicUsize,
    pub column_calls: AtomicUsize,
    pub partition_calls: AtomicUsize,
    pub copies: AtomicUsize,
    pub closes: AtomicUsize,
    pub aborts: AtomicUsize,
    pub blocked: AtomicUsize,
}

impl Default for StubState {
    fn default() -> Self {
        let (trigger, signal) = bounded(0);
        StubState {
            log: Mutex::default(),
            rules: Mutex::default(),
            abort_trigger: Mutex::new(Some(trigger)),
            abort_signal: signal,
            schema_calls: AtomicUsize::default(),
            table_calls: AtomicUsize::default(),
            column_calls: AtomicUsize::default(),
            partition_calls: AtomicUsize::default(),
            copies: AtomicUsize::default(),
            closes: AtomicUsize::default(),
            aborts: AtomicUsize::default(),
            blocked: AtomicUsize::default(),
        }
    }
}

/// Scripted backend. Clones (including [`DbmsConnection::copy`]) share
/// state, so a test sees every statement whatever the discipline.
#[derive(Clone, Default)]
pub struct StubConnection {
    state: Arc<StubState>,
}

impl StubConnection {
    pub fn new() -> Self {
        StubConnection::default()
    }

    pub fn state(&self) -> Arc<StubState> {
        Arc::clone(&self.state)
    }

    /// Answer statements containing `pattern` with `result`.
    pub fn on(&self, pattern: &str, result: QueryResult) -> &Self {
        self.push_rule(pattern, Response::Rows(result))
    }

    /// Fail statements containing `pattern` with a backend error.
    pub fn fail_on(&self, pattern: &str, message: &str) -> &Self {
        self.push_rule(pattern, Response::Fail(message.to_string()))
    }

    /// Hang on statements containing `pattern` until aborted.
    pub fn block_on(&self, pattern: &str) -> &Self {
        self.push_rule(pattern, Response::Block)
    }

    fn push_rule(&self, pattern: &str, response: Response) -> &Self {
        self.state.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            response,
        });
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    pub fn statements_matching(&self, needle: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(needle))
            .collect()
    }

    /// Wait until some statement is blocked on a `block_on` rule.
    pub fn wait_until_blocked(&self) {
        for _ in 0..500 {
            if self.state.blocked.load(Ordering::SeqCst) > 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no statement blocked");
    }

    fn respond(&self, sql: &str) -> Result<QueryResult, AqpError> {
        self.state.log.lock().push(sql.to_string());
        let rules = self.state.rules.lock();
        let Some(rule) = rules.iter().find(|r| sql.contains(&r.pattern)) else {
            return Ok(QueryResult::empty());
        };
        match &rule.response {
            Response::Rows(result) => Ok(result.clone()),
            Response::Fail(message) => Err(AqpError::Backend(message.clone())),
            Response::Block => {
                drop(rules);
                self.state.blocked.fetch_add(1, Ordering::SeqCst);
                // nothing is ever sent; recv returns once the trigger drops
                let _ = self.state.abort_signal.recv();
                Err(AqpError::Backend(
                    "canceling statement due to user request".into(),
                ))
            }
        }
    }
}

struct StubAbort {
    state: Arc<StubState>,
}

impl AbortHandle for StubAbort {
    fn abort(&self) -> Result<(), AqpError> {
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        self.state.abort_trigger.lock().take();
        Ok(())
    }
}

impl MetaDataProvider for StubConnection {
    fn schemas(&self) -> Result<Vec<String>, AqpError> {
        self.state.schema_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["public".into(), "originalschema".into()])
    }

    fn tables(&self, schema: &str) -> Result<Vec<String>, AqpError> {
        self.state.table_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match schema {
            "originalschema" => vec!["originaltable".into()],
            _ => vec![],
        })
    }

    fn columns(&self, _schema: &str, _table: &str) -> Result<Vec<ColumnInfo>, AqpError> {
        self.state.column_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            ColumnInfo::new("id", "integer"),
            ColumnInfo::new("value", "double precision"),
        ])
    }

    fn partition_columns(&self, _schema: &str, _table: &str) -> Result<Vec<String>, AqpError> {
        self.state.partition_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![])
    }

    fn default_schema(&self) -> Result<String, AqpError> {
        Ok("public".into())
    }
}

impl DbmsConnection for StubConnection {
    fn execute(&mut self, sql: &str) -> Result<QueryResult, AqpError> {
        self.respond(sql)
    }

    fn execute_update(&mut self, sql: &str) -> Result<u64, AqpError> {
        self.respond(sql).map(|_| 0)
    }

    fn syntax(&self) -> Arc<dyn SqlSyntax> {
        Arc::new(PostgresSyntax)
    }

    fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        Arc::new(StubAbort {
            state: Arc::clone(&self.state),
        })
    }

    fn close(&mut self) -> Result<(), AqpError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy(&self) -> Result<Box<dyn DbmsConnection>, AqpError> {
        self.state.copies.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

// ── Fixtures ───────────────────────────────────────────────────────────────

/// `originalschema.originaltable` registered with a scramble of `blocks`
/// blocks at `newschema.newtable`.
pub fn scrambles(blocks: u32) -> ScrambleMetaSet {
    let mut set = ScrambleMetaSet::new();
    set.add(ScrambleMeta {
        schema: "newschema".into(),
        table: "newtable".into(),
        original_schema: "originalschema".into(),
        original_table: "originaltable".into(),
        method: approxql::scramble::ScrambleMethod::Uniform,
        block_column: "aqp_block".into(),
        block_count: blocks,
        subsample_column: "aqp_subsample".into(),
        tier_column: "aqp_tier".into(),
        sample_ratio: 1.0,
        created_at: chrono::Utc::now(),
    });
    set
}

pub fn original_table(alias: &str) -> Relation {
    Relation::base("originalschema", "originaltable", Some(alias))
}

/// `select avg(t.value) as a from originalschema.originaltable as t`
pub fn avg_query() -> SelectQuery {
    SelectQuery::new(
        vec![SelectItem::aliased(
            Expr::agg(AggFunc::Avg, Expr::column("t", "value")),
            "a",
        )],
        vec![original_table("t")],
    )
}

/// `select count(*) as n from originalschema.originaltable as t`
pub fn count_query() -> SelectQuery {
    SelectQuery::new(
        vec![SelectItem::aliased(Expr::count_star(), "n")],
        vec![original_table("t")],
    )
}

pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
    QueryResult::new(columns.iter().map(|c| c.to_string()).collect(), rows)
}

//! Backend capabilities consumed by the planner and executor.
//!
//! - [`MetaDataProvider`] answers catalogue questions (schemas, tables,
//!   columns, partition columns).
//! - [`DbmsConnection`] executes statements, exposes the dialect, and can be
//!   aborted, closed or cloned.
//!
//! [`CachedDbmsConnection`] decorates any connection with a catalogue cache;
//! [`PostgresConnection`] is the bundled PostgreSQL backend.

pub mod cached;
pub mod postgres;
pub mod result;

use std::sync::Arc;

use crate::error::AqpError;
use crate::sql::SqlSyntax;

pub use cached::CachedDbmsConnection;
pub use postgres::PostgresConnection;
pub use result::{QueryResult, Value, ValueKind};

/// A column of a catalogue table listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: &str, type_name: &str) -> Self {
        ColumnInfo {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }
}

/// Catalogue lookups.
pub trait MetaDataProvider: Send + Sync {
    fn schemas(&self) -> Result<Vec<String>, AqpError>;

    fn tables(&self, schema: &str) -> Result<Vec<String>, AqpError>;

    fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, AqpError>;

    fn partition_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, AqpError>;

    fn default_schema(&self) -> Result<String, AqpError>;
}

/// Cancels the statement currently running on a connection.
///
/// Handles are obtained before execution starts so an abort never has to
/// wait for the connection lock held by the running statement.
pub trait AbortHandle: Send + Sync {
    fn abort(&self) -> Result<(), AqpError>;
}

/// Abort handle for connections that cannot cancel in-flight work.
#[derive(Debug, Default)]
pub struct NoopAbortHandle;

impl AbortHandle for NoopAbortHandle {
    fn abort(&self) -> Result<(), AqpError> {
        Ok(())
    }
}

/// Statement execution against one backend session.
///
/// A connection is not assumed to be callable from several threads at once;
/// the executor either serializes access through a mutex or works on
/// clones obtained with [`DbmsConnection::copy`].
pub trait DbmsConnection: MetaDataProvider {
    /// Run a query and return its rows.
    fn execute(&mut self, sql: &str) -> Result<QueryResult, AqpError>;

    /// Run DDL/DML and return the affected row count.
    fn execute_update(&mut self, sql: &str) -> Result<u64, AqpError>;

    fn syntax(&self) -> Arc<dyn SqlSyntax>;

    fn abort_handle(&self) -> Arc<dyn AbortHandle>;

    fn abort(&self) -> Result<(), AqpError> {
        self.abort_handle().abort()
    }

    fn close(&mut self) -> Result<(), AqpError>;

    /// Open an independent session to the same backend.
    fn copy(&self) -> Result<Box<dyn DbmsConnection>, AqpError>;

    /// Drop cached catalogue state after DDL. No-op unless cached.
    fn invalidate_metadata(&self) {}
}

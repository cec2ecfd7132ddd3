//! PostgreSQL backend over the synchronous `postgres` client.
//!
//! Queries run through the simple query protocol, so every value arrives as
//! text. The statement is prepared first to learn its column types, and each
//! cell is parsed by [`Value::parse`] with the kind of its column. Catalogue
//! lookups read `information_schema` and `pg_partitioned_table`.

use std::sync::Arc;

use parking_lot::Mutex;
use postgres::types::{ToSql, Type};
use postgres::{CancelToken, Client, NoTls, SimpleQueryMessage};
use tracing::debug;

use super::{AbortHandle, ColumnInfo, DbmsConnection, MetaDataProvider, QueryResult, Value, ValueKind};
use crate::error::AqpError;
use crate::sql::{PostgresSyntax, SqlSyntax};

pub struct PostgresConnection {
    params: String,
    // Catalogue lookups take `&self`; the client needs `&mut`.
    // `None` once closed.
    client: Mutex<Option<Client>>,
    cancel: Arc<PostgresAbortHandle>,
    syntax: Arc<PostgresSyntax>,
}

struct PostgresAbortHandle {
    token: CancelToken,
}

impl AbortHandle for PostgresAbortHandle {
    fn abort(&self) -> Result<(), AqpError> {
        debug!("cancelling in-flight postgres statement");
        self.token.cancel_query(NoTls)?;
        Ok(())
    }
}

fn closed() -> AqpError {
    AqpError::Backend("connection is closed".into())
}

impl PostgresConnection {
    /// Connect with a libpq-style connection string,
    /// e.g. `host=localhost user=postgres dbname=postgres`.
    pub fn connect(params: &str) -> Result<Self, AqpError> {
        let client = Client::connect(params, NoTls)?;
        let cancel = Arc::new(PostgresAbortHandle {
            token: client.cancel_token(),
        });
        Ok(PostgresConnection {
            params: params.to_string(),
            client: Mutex::new(Some(client)),
            cancel,
            syntax: Arc::new(PostgresSyntax),
        })
    }

    fn query_strings(&self, sql: &str, params: &[&str]) -> Result<Vec<String>, AqpError> {
        let args: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let mut guard = self.client.lock();
        let client = guard.as_mut().ok_or_else(closed)?;
        let rows = client.query(sql, &args)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(AqpError::from))
            .collect()
    }
}

/// How cells of a column of type `ty` are parsed.
fn value_kind(ty: &Type) -> ValueKind {
    match *ty {
        Type::BOOL => ValueKind::Bool,
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => ValueKind::Int,
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => ValueKind::Float,
        _ => ValueKind::Text,
    }
}

fn run_simple_query(client: &mut Client, sql: &str) -> Result<QueryResult, AqpError> {
    let statement = client.prepare(sql)?;
    let kinds: Vec<ValueKind> = statement.columns().iter().map(|c| value_kind(c.type_())).collect();
    let mut result = QueryResult::new(
        statement.columns().iter().map(|c| c.name().to_string()).collect(),
        Vec::new(),
    );
    for message in client.simple_query(sql)? {
        if let SimpleQueryMessage::Row(row) = message {
            let values = (0..row.len())
                .map(|i| Value::parse(row.get(i), kinds.get(i).copied().unwrap_or(ValueKind::Text)))
                .collect();
            result.rows.push(values);
        }
    }
    Ok(result)
}

impl MetaDataProvider for PostgresConnection {
    fn schemas(&self) -> Result<Vec<String>, AqpError> {
        self.query_strings(
            "SELECT schema_name::text FROM information_schema.schemata ORDER BY 1",
            &[],
        )
    }

    fn tables(&self, schema: &str) -> Result<Vec<String>, AqpError> {
        self.query_strings(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY 1",
            &[schema],
        )
    }

    fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, AqpError> {
        let mut guard = self.client.lock();
        let client = guard.as_mut().ok_or_else(closed)?;
        let rows = client.query(
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
            &[&schema, &table],
        )?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo, AqpError> {
                Ok(ColumnInfo {
                    name: row.try_get(0)?,
                    type_name: row.try_get(1)?,
                })
            })
            .collect()
    }

    fn partition_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, AqpError> {
        self.query_strings(
            "SELECT a.attname::text \
             FROM pg_partitioned_table p \
             JOIN pg_class c ON c.oid = p.partrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY (p.partattrs::int2[]) \
             WHERE n.nspname = $1 AND c.relname = $2",
            &[schema, table],
        )
    }

    fn default_schema(&self) -> Result<String, AqpError> {
        self.query_strings("SELECT current_schema()::text", &[])?
            .into_iter()
            .next()
            .ok_or_else(|| AqpError::Backend("current_schema() returned no row".into()))
    }
}

impl DbmsConnection for PostgresConnection {
    fn execute(&mut self, sql: &str) -> Result<QueryResult, AqpError> {
        debug!(sql, "postgres execute");
        let client = self.client.get_mut().as_mut().ok_or_else(closed)?;
        run_simple_query(client, sql)
    }

    fn execute_update(&mut self, sql: &str) -> Result<u64, AqpError> {
        debug!(sql, "postgres execute_update");
        let client = self.client.get_mut().as_mut().ok_or_else(closed)?;
        Ok(client.execute(sql, &[])?)
    }

    fn syntax(&self) -> Arc<dyn SqlSyntax> {
        self.syntax.clone()
    }

    fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        self.cancel.clone()
    }

    fn close(&mut self) -> Result<(), AqpError> {
        if let Some(client) = self.client.get_mut().take() {
            client.close()?;
        }
        Ok(())
    }

    fn copy(&self) -> Result<Box<dyn DbmsConnection>, AqpError> {
        Ok(Box::new(PostgresConnection::connect(&self.params)?))
    }
}

//! Catalogue cache decorating a live connection.
//!
//! Schema, table, column and partition lookups are answered from per-key
//! maps. A miss is filled while holding a per-instance fetch lock, so
//! concurrent callers asking for the same key issue one backend round trip.
//! Failed lookups are never cached.
//!
//! Statement execution, abort, close and copy go straight to the wrapped
//! connection.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{AbortHandle, ColumnInfo, DbmsConnection, MetaDataProvider, QueryResult};
use crate::error::AqpError;
use crate::sql::SqlSyntax;

type TableKey = (String, String);

#[derive(Debug, Default)]
struct MetaCache {
    schemas: Option<Vec<String>>,
    tables: HashMap<String, Vec<String>>,
    columns: HashMap<TableKey, Vec<ColumnInfo>>,
    partitions: HashMap<TableKey, Vec<String>>,
}

pub struct CachedDbmsConnection {
    inner: Box<dyn DbmsConnection>,
    cache: Mutex<MetaCache>,
    fetch_lock: Mutex<()>,
}

impl CachedDbmsConnection {
    pub fn new(inner: Box<dyn DbmsConnection>) -> Self {
        CachedDbmsConnection {
            inner,
            cache: Mutex::new(MetaCache::default()),
            fetch_lock: Mutex::new(()),
        }
    }

    /// Drop every cached catalogue entry.
    ///
    /// Waits for an in-flight fetch to publish first, so its result cannot
    /// land in the cache after the clear.
    pub fn clear_cache(&self) {
        let _guard = self.fetch_lock.lock();
        let mut cache = self.cache.lock();
        *cache = MetaCache::default();
        debug!("metadata cache cleared");
    }

    pub fn inner(&self) -> &dyn DbmsConnection {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn DbmsConnection> {
        self.inner
    }

    /// Double-checked lookup: read under the cache lock, fetch under the
    /// fetch lock, then publish under the cache lock again.
    fn cached<K, V>(
        &self,
        key: K,
        slot: impl Fn(&mut MetaCache) -> &mut HashMap<K, V>,
        fetch: impl FnOnce(&dyn DbmsConnection) -> Result<V, AqpError>,
    ) -> Result<V, AqpError>
    where
        K: Eq + Hash,
        V: Clone,
    {
        if let Some(hit) = slot(&mut *self.cache.lock()).get(&key) {
            return Ok(hit.clone());
        }
        let _guard = self.fetch_lock.lock();
        if let Some(hit) = slot(&mut *self.cache.lock()).get(&key) {
            return Ok(hit.clone());
        }
        let value = fetch(self.inner.as_ref())?;
        slot(&mut *self.cache.lock()).insert(key, value.clone());
        Ok(value)
    }
}

impl MetaDataProvider for CachedDbmsConnection {
    fn schemas(&self) -> Result<Vec<String>, AqpError> {
        if let Some(hit) = &self.cache.lock().schemas {
            return Ok(hit.clone());
        }
        let _guard = self.fetch_lock.lock();
        if let Some(hit) = &self.cache.lock().schemas {
            return Ok(hit.clone());
        }
        let schemas = self.inner.schemas()?;
        self.cache.lock().schemas = Some(schemas.clone());
        Ok(schemas)
    }

    fn tables(&self, schema: &str) -> Result<Vec<String>, AqpError> {
        self.cached(
            schema.to_string(),
            |c| &mut c.tables,
            |inner| inner.tables(schema),
        )
    }

    fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, AqpError> {
        self.cached(
            (schema.to_string(), table.to_string()),
            |c| &mut c.columns,
            |inner| inner.columns(schema, table),
        )
    }

    fn partition_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, AqpError> {
        self.cached(
            (schema.to_string(), table.to_string()),
            |c| &mut c.partitions,
            |inner| inner.partition_columns(schema, table),
        )
    }

    fn default_schema(&self) -> Result<String, AqpError> {
        self.inner.default_schema()
    }
}

impl DbmsConnection for CachedDbmsConnection {
    fn execute(&mut self, sql: &str) -> Result<QueryResult, AqpError> {
        self.inner.execute(sql)
    }

    fn execute_update(&mut self, sql: &str) -> Result<u64, AqpError> {
        self.inner.execute_update(sql)
    }

    fn syntax(&self) -> Arc<dyn SqlSyntax> {
        self.inner.syntax()
    }

    fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        self.inner.abort_handle()
    }

    fn close(&mut self) -> Result<(), AqpError> {
        self.inner.close()
    }

    /// The clone gets its own, empty cache.
    fn copy(&self) -> Result<Box<dyn DbmsConnection>, AqpError> {
        Ok(Box::new(CachedDbmsConnection::new(self.inner.copy()?)))
    }

    fn invalidate_metadata(&self) {
        self.clear_cache();
        self.inner.invalidate_metadata();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NoopAbortHandle;
    use crate::sql::PostgresSyntax;
    use crossbeam::channel::{Receiver, Sender, unbounded};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        schemas: AtomicUsize,
        tables: AtomicUsize,
        columns: AtomicUsize,
        fail_tables: AtomicUsize,
        /// When set, `schemas` reports that it started and then waits to
        /// be released.
        gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    }

    struct CatalogStub {
        counters: Arc<Counters>,
    }

    impl MetaDataProvider for CatalogStub {
        fn schemas(&self) -> Result<Vec<String>, AqpError> {
            self.counters.schemas.fetch_add(1, Ordering::SeqCst);
            let gate = self.counters.gate.lock().clone();
            if let Some((started, release)) = gate {
                started.send(()).unwrap();
                release.recv().unwrap();
            }
            Ok(vec!["public".into(), "sales".into()])
        }

        fn tables(&self, schema: &str) -> Result<Vec<String>, AqpError> {
            self.counters.tables.fetch_add(1, Ordering::SeqCst);
            if self.counters.fail_tables.load(Ordering::SeqCst) > 0 {
                self.counters.fail_tables.fetch_sub(1, Ordering::SeqCst);
                return Err(AqpError::Backend("catalog unavailable".into()));
            }
            Ok(vec![format!("{schema}_orders")])
        }

        fn columns(&self, _schema: &str, _table: &str) -> Result<Vec<ColumnInfo>, AqpError> {
            self.counters.columns.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ColumnInfo::new("id", "integer")])
        }

        fn partition_columns(&self, _schema: &str, _table: &str) -> Result<Vec<String>, AqpError> {
            Ok(vec![])
        }

        fn default_schema(&self) -> Result<String, AqpError> {
            Ok("public".into())
        }
    }

    impl DbmsConnection for CatalogStub {
        fn execute(&mut self, _sql: &str) -> Result<QueryResult, AqpError> {
            Ok(QueryResult::empty())
        }

        fn execute_update(&mut self, _sql: &str) -> Result<u64, AqpError> {
            Ok(0)
        }

        fn syntax(&self) -> Arc<dyn SqlSyntax> {
            Arc::new(PostgresSyntax)
        }

        fn abort_handle(&self) -> Arc<dyn AbortHandle> {
            Arc::new(NoopAbortHandle)
        }

        fn close(&mut self) -> Result<(), AqpError> {
            Ok(())
        }

        fn copy(&self) -> Result<Box<dyn DbmsConnection>, AqpError> {
            Ok(Box::new(CatalogStub {
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    fn cached() -> (CachedDbmsConnection, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let conn = CachedDbmsConnection::new(Box::new(CatalogStub {
            counters: Arc::clone(&counters),
        }));
        (conn, counters)
    }

    #[test]
    fn test_second_schemas_call_is_served_from_cache() {
        let (conn, counters) = cached();
        let first = conn.schemas().unwrap();
        let second = conn.schemas().unwrap();
        assert_eq!(first, second);
        assert_eq!(counters.schemas.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_cache_forces_refetch() {
        let (conn, counters) = cached();
        conn.schemas().unwrap();
        conn.columns("public", "t").unwrap();
        conn.clear_cache();
        conn.schemas().unwrap();
        conn.columns("public", "t").unwrap();
        assert_eq!(counters.schemas.load(Ordering::SeqCst), 2);
        assert_eq!(counters.columns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_during_fetch_is_not_undone() {
        let (conn, counters) = cached();
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        *counters.gate.lock() = Some((started_tx, release_rx));

        std::thread::scope(|s| {
            let fetch = s.spawn(|| conn.schemas().unwrap());
            started_rx.recv().unwrap();
            let clear = s.spawn(|| conn.clear_cache());
            std::thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
            fetch.join().unwrap();
            clear.join().unwrap();
        });

        *counters.gate.lock() = None;
        conn.schemas().unwrap();
        assert_eq!(counters.schemas.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_is_per_key() {
        let (conn, counters) = cached();
        assert_eq!(conn.tables("a").unwrap(), vec!["a_orders".to_string()]);
        assert_eq!(conn.tables("b").unwrap(), vec!["b_orders".to_string()]);
        conn.tables("a").unwrap();
        assert_eq!(counters.tables.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let (conn, counters) = cached();
        counters.fail_tables.store(1, Ordering::SeqCst);
        assert!(conn.tables("a").is_err());
        assert_eq!(conn.tables("a").unwrap(), vec!["a_orders".to_string()]);
        assert_eq!(counters.tables.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_metadata_clears() {
        let (conn, counters) = cached();
        conn.schemas().unwrap();
        conn.invalidate_metadata();
        conn.schemas().unwrap();
        assert_eq!(counters.schemas.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_copy_starts_with_empty_cache() {
        let (conn, counters) = cached();
        conn.schemas().unwrap();
        let copy = conn.copy().unwrap();
        copy.schemas().unwrap();
        assert_eq!(counters.schemas.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_misses_fetch_once() {
        let (conn, counters) = cached();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| conn.columns("public", "t").unwrap());
            }
        });
        assert_eq!(counters.columns.load(Ordering::SeqCst), 1);
    }
}

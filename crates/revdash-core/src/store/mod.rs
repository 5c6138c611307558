//! Versioned record store on SQLite.
//!
//! Runtime defaults follow the projection database conventions:
//! - `journal_mode = WAL` so readers do not block the single writer
//! - `busy_timeout = 5s` so concurrent invocations queue instead of failing
//! - every transaction is `BEGIN IMMEDIATE`, making read-check-write atomic
//!   across processes sharing the file

pub mod kinds;
pub mod migrations;
pub mod query;
pub mod schema;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::clock::Clock;
use crate::error::ErrorCode;
pub use kinds::{DataKinds, KindSpec, Record};
pub use query::{Filter, Query};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key:?} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key:?}: have modified {stored} but incoming record says {incoming}")]
    Stale {
        kind: String,
        key: String,
        stored: DateTime<Utc>,
        incoming: DateTime<Utc>,
    },

    #[error("{kind} {key:?}: migration to version {version} failed: {source}")]
    Migration {
        kind: String,
        key: String,
        version: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("record kind {0} is not registered")]
    UnknownKind(String),

    #[error("record kind {kind} is registered as {registered}, not {requested}")]
    KindMismatch {
        kind: &'static str,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("{kind} {key:?}: undecodable body: {source}")]
    Decode {
        kind: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::RecordNotFound,
            Self::Stale { .. } => ErrorCode::StaleWrite,
            Self::Migration { .. } => ErrorCode::MigrationFailed,
            Self::UnknownKind(_) | Self::KindMismatch { .. } => ErrorCode::KindMismatch,
            Self::Decode { .. } | Self::Encode(_) => ErrorCode::InternalUnexpected,
            Self::Sqlite(_) => ErrorCode::StoreWriteFailed,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Handle to the record store.
///
/// Holds one SQLite connection; open one `Store` per thread or process.
pub struct Store {
    conn: Connection,
    kinds: Arc<DataKinds>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at `path`, apply pragmas and migrate.
    ///
    /// # Errors
    ///
    /// Returns an error if opening, configuring or migrating the database fails.
    pub fn open(path: &Path, kinds: Arc<DataKinds>, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("open store database {}", path.display()))?;
        configure_connection(&conn).context("configure sqlite pragmas")?;
        migrations::migrate(&mut conn).context("apply store migrations")?;

        Ok(Self { conn, kinds, clock })
    }

    /// Private in-memory store, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory(kinds: Arc<DataKinds>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory store")?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        migrations::migrate(&mut conn).context("apply store migrations")?;
        Ok(Self { conn, kinds, clock })
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn kinds(&self) -> &DataKinds {
        &self.kinds
    }

    pub(crate) const fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn autocommit(&self) -> Tx<'_> {
        Tx {
            conn: &self.conn,
            kinds: &self.kinds,
            now: self.clock.now(),
        }
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a store error if the transaction
    /// cannot be started or committed.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = {
            let view = Tx {
                conn: &tx,
                kinds: &self.kinds,
                now: self.clock.now(),
            };
            f(&view)?
        };
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// See [`Tx::get`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a decode/migration error.
    pub fn get<T: Record>(&self, key: &str) -> Result<T, StoreError> {
        self.autocommit().get(key)
    }

    /// See [`Tx::try_get`].
    ///
    /// # Errors
    ///
    /// Returns a decode or migration error.
    pub fn try_get<T: Record>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.autocommit().try_get(key)
    }

    /// See [`Tx::put`].
    ///
    /// # Errors
    ///
    /// Returns a migration, encode or SQLite error.
    pub fn put<T: Record>(&self, key: &str, record: &mut T) -> Result<(), StoreError> {
        self.autocommit().put(key, record)
    }

    /// See [`Tx::delete`].
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, kind: &str, key: &str) -> Result<bool, StoreError> {
        self.autocommit().delete(kind, key)
    }

    /// See [`Tx::keys`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn keys(&self, query: &Query, limit: usize) -> Result<Vec<String>, StoreError> {
        self.autocommit().keys(query, limit)
    }

    /// See [`Tx::count`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self, query: &Query, limit: usize) -> Result<u64, StoreError> {
        self.autocommit().count(query, limit)
    }

    /// See [`Tx::load_all`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query or any record fails to load.
    pub fn load_all<T: Record>(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<(String, T)>, StoreError> {
        self.autocommit().load_all(query, limit)
    }

    /// Keys of `kind` stored below `version`, oldest key first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stale_keys(
        &self,
        kind: &str,
        version: u32,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key FROM records WHERE kind = ?1 AND version < ?2 ORDER BY key LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![kind, version, sql_limit(limit)], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(StoreError::from)
    }

    /// Read-and-rewrite one record of a registered kind in its own
    /// transaction, bringing it to the current version at rest.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read, migrated or written.
    pub fn rewrite(&self, kind: &str, key: &str) -> Result<(), StoreError> {
        self.transaction(|tx| self.kinds.rewrite(tx, kind, key))
    }
}

/// Store operations bound to one transaction (or autocommit connection).
///
/// `now` is captured once so every derive inside the transaction sees the
/// same instant.
pub struct Tx<'a> {
    conn: &'a Connection,
    kinds: &'a DataKinds,
    now: DateTime<Utc>,
}

impl Tx<'_> {
    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Load a record and bring it to the current version in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent, or a decode/migration
    /// error.
    pub fn get<T: Record>(&self, key: &str) -> Result<T, StoreError> {
        self.try_get(key)?.ok_or_else(|| StoreError::NotFound {
            kind: T::KIND.to_string(),
            key: key.to_string(),
        })
    }

    /// Like [`Tx::get`] but maps absence to `None`.
    ///
    /// # Errors
    ///
    /// Returns a decode or migration error.
    pub fn try_get<T: Record>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some((version, body)) = self.raw_get(T::KIND, key)? else {
            return Ok(None);
        };
        let mut record = decode::<T>(key, &body)?;
        self.kinds.upgrade(key, &mut record, version, self.now)?;
        Ok(Some(record))
    }

    /// Normalize a record to the current version, re-derive it and write it.
    ///
    /// On error nothing is written.
    ///
    /// # Errors
    ///
    /// Returns a migration, encode or SQLite error.
    pub fn put<T: Record>(&self, key: &str, record: &mut T) -> Result<(), StoreError> {
        let version = self.kinds.normalize(key, record, self.now)?;
        let body = serde_json::to_string(record)?;
        self.raw_put(T::KIND, key, version, &body)
    }

    /// Delete a record. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, kind: &str, key: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM records WHERE kind = ?1 AND key = ?2", params![kind, key])?;
        Ok(n > 0)
    }

    /// Keys matching `query`, in key order, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn keys(&self, query: &Query, limit: usize) -> Result<Vec<String>, StoreError> {
        let (mut sql, mut values) = query.to_sql("key");
        sql.push_str(" ORDER BY key LIMIT ?");
        values.push(rusqlite::types::Value::Integer(sql_limit(limit)));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(StoreError::from)
    }

    /// Number of records matching `query`, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self, query: &Query, limit: usize) -> Result<u64, StoreError> {
        let (inner, mut values) = query.to_sql("1");
        let sql = format!("SELECT COUNT(*) FROM ({inner} LIMIT ?)");
        values.push(rusqlite::types::Value::Integer(sql_limit(limit)));

        let n: i64 = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Records matching `query` loaded through the typed read path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or any record fails to decode
    /// or migrate.
    pub fn load_all<T: Record>(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let (mut sql, mut values) = query.to_sql("key, version, body");
        sql.push_str(" ORDER BY key LIMIT ?");
        values.push(rusqlite::types::Value::Integer(sql_limit(limit)));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (key, version, body) in rows {
            let mut record = decode::<T>(&key, &body)?;
            self.kinds
                .upgrade(&key, &mut record, stored_version(version), self.now)?;
            out.push((key, record));
        }
        Ok(out)
    }

    pub(crate) fn raw_get(&self, kind: &str, key: &str) -> Result<Option<(u32, String)>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT version, body FROM records WHERE kind = ?1 AND key = ?2",
                params![kind, key],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(version, body)| (stored_version(version), body)))
    }

    pub(crate) fn raw_put(
        &self,
        kind: &str,
        key: &str,
        version: u32,
        body: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO records (kind, key, version, body, updated_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind, key) DO UPDATE SET
                version = excluded.version,
                body = excluded.body,
                updated_at_us = excluded.updated_at_us",
            params![kind, key, version, body, self.now.timestamp_micros()],
        )?;
        Ok(())
    }
}

fn decode<T: Record>(key: &str, body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|source| StoreError::Decode {
        kind: T::KIND.to_string(),
        key: key.to_string(),
        source,
    })
}

fn stored_version(raw: i64) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        #[serde(default)]
        dv: u32,
        #[serde(default)]
        title: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        open: bool,
        #[serde(default)]
        title_len: usize,
    }

    impl Record for Doc {
        const KIND: &'static str = "Doc";

        fn data_version(&self) -> u32 {
            self.dv
        }

        fn set_data_version(&mut self, version: u32) {
            self.dv = version;
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_400_000_000, 0).expect("valid timestamp"),
        ))
    }

    fn kinds(version: u32) -> Arc<DataKinds> {
        let mut kinds = DataKinds::default();
        let mut spec = KindSpec::<Doc>::new(version)
            .derive(|d: &mut Doc, _| d.title_len = d.title.len());
        if version >= 2 {
            spec = spec.migration(2, |d: &mut Doc| {
                d.title = d.title.trim().to_string();
                Ok(())
            });
        }
        kinds.register(spec).expect("register Doc");
        Arc::new(kinds)
    }

    fn doc(title: &str, tags: &[&str], open: bool) -> Doc {
        Doc {
            title: title.to_string(),
            tags: tags.iter().map(ToString::to_string).collect(),
            open,
            ..Doc::default()
        }
    }

    #[test]
    fn open_sets_wal_and_busy_timeout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(&dir.path().join("nested/revdash.sqlite3"), kinds(1), clock())?;

        let journal_mode: String = store
            .conn()
            .pragma_query_value(None, "journal_mode", |row| row.get(0))?;
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = store
            .conn()
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))?;
        assert_eq!(u128::from(busy_timeout_ms), DEFAULT_BUSY_TIMEOUT.as_millis());
        assert_eq!(
            migrations::current_schema_version(store.conn())?,
            migrations::LATEST_SCHEMA_VERSION
        );
        Ok(())
    }

    #[test]
    fn put_derives_and_get_round_trips() -> Result<()> {
        let store = Store::open_in_memory(kinds(1), clock())?;
        let mut d = doc("hello", &["a"], true);
        store.put("1", &mut d)?;
        assert_eq!(d.title_len, 5);
        assert_eq!(d.dv, 1);

        let back: Doc = store.get("1")?;
        assert_eq!(back, d);
        Ok(())
    }

    #[test]
    fn missing_record_is_not_found() -> Result<()> {
        let store = Store::open_in_memory(kinds(1), clock())?;
        let err = store.get::<Doc>("nope").expect_err("must be missing");
        assert!(err.is_not_found());
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
        assert!(store.try_get::<Doc>("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn get_migrates_in_memory_without_rewriting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.sqlite3");
        {
            let v1 = Store::open(&path, kinds(1), clock())?;
            v1.put("1", &mut doc("  padded  ", &[], true))?;
        }

        let v2 = Store::open(&path, kinds(2), clock())?;
        let loaded: Doc = v2.get("1")?;
        assert_eq!(loaded.title, "padded");
        assert_eq!(loaded.title_len, 6);
        assert_eq!(loaded.dv, 2);

        assert_eq!(v2.stale_keys("Doc", 2, 10)?, vec!["1".to_string()]);

        v2.rewrite("Doc", "1")?;
        assert!(v2.stale_keys("Doc", 2, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_transaction_rolls_back() -> Result<()> {
        let store = Store::open_in_memory(kinds(1), clock())?;
        store.put("1", &mut doc("before", &[], true))?;

        let result: Result<(), anyhow::Error> = store.transaction(|tx| {
            let mut d: Doc = tx.get("1")?;
            d.title = "after".to_string();
            tx.put("1", &mut d)?;
            anyhow::bail!("abort")
        });
        assert!(result.is_err());

        let d: Doc = store.get("1")?;
        assert_eq!(d.title, "before");
        Ok(())
    }

    #[test]
    fn queries_filter_on_body_fields() -> Result<()> {
        let store = Store::open_in_memory(kinds(1), clock())?;
        store.put("a", &mut doc("alpha", &["x", "y"], true))?;
        store.put("b", &mut doc("beta", &[], true))?;
        store.put("c", &mut doc("gamma", &["y"], false))?;

        let open = Query::kind("Doc").eq("open", true);
        assert_eq!(store.keys(&open, 100)?, vec!["a", "b"]);

        let tagged = Query::kind("Doc").non_empty("tags");
        assert_eq!(store.keys(&tagged, 100)?, vec!["a", "c"]);

        let has_y = Query::kind("Doc").contains("tags", "y").eq("open", false);
        assert_eq!(store.keys(&has_y, 100)?, vec!["c"]);

        let short = Query::kind("Doc").lt("title_len", 5);
        assert_eq!(store.keys(&short, 100)?, vec!["b"]);

        assert_eq!(store.count(&Query::kind("Doc"), 100)?, 3);
        assert_eq!(store.count(&Query::kind("Doc"), 2)?, 2);

        let loaded = store.load_all::<Doc>(&open, 1)?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "a");
        assert_eq!(loaded[0].1.title_len, 5);
        Ok(())
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() -> Result<()> {
        let store = Store::open_in_memory(kinds(1), clock())?;
        store.put("1", &mut doc("x", &[], true))?;
        assert!(store.delete("Doc", "1")?);
        assert!(!store.delete("Doc", "1")?);
        Ok(())
    }
}

//! The database handle.
//!
//! One [IoHandle] exists per database file.  It owns the rusqlite connection
//! behind a single mutex -- the *database lock* -- and acquiring that lock is
//! the only way to talk to sqlite.  Nested helpers receive the locked state
//! by reference instead of re-acquiring, so the lock stays non-reentrant.
//!
//! The prepared-statement registry is the connection's statement cache:
//! plain templates run through `prepare_cached`, multi-bind expansions are
//! prepared fresh every time (their text depends on argument arity), and
//! [IoHandle::finalise_prepared_statements] flushes the cache, which must
//! happen before VACUUM, ANALYZE, index creation, and close.
//!
//! Most operations report failure instead of propagating it: they return a
//! bool or an Option, bump the handle's error counter, and log.  Callers
//! poll [IoHandle::get_error_count] for cumulative trouble.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use itertools::Itertools;
use log::*;
use rusqlite::OpenFlags;
use smallvec::SmallVec;

use crate::descriptor::is_valid_identifier;
use crate::result_set::ResultSet;
use crate::statement::{Expanded, Statement};
use crate::value::SqlValue;

/// Durability applied to commits, mapped onto `PRAGMA synchronous`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Synchronicity {
    Off,
    Normal,
    Full,
    Extra,
}

impl Synchronicity {
    fn as_sql(&self) -> &'static str {
        match self {
            Synchronicity::Off => "OFF",
            Synchronicity::Normal => "NORMAL",
            Synchronicity::Full => "FULL",
            Synchronicity::Extra => "EXTRA",
        }
    }
}

/// SQL run when opening a writable connection.
///
/// - Incremental auto-vacuum, so close can trim the file without a full
///   VACUUM.
/// - A raised page cache.
/// - No F_FULLFSYNC; the synchronous level is the durability knob.
/// - Persistent journal with a size cap, so the journal file isn't
///   recreated on every transaction.
const OPEN_SQL: &str = r#"
PRAGMA auto_vacuum = incremental;
PRAGMA cache_size = 2000;
PRAGMA fullfsync = NO;
PRAGMA journal_mode = persist;
PRAGMA journal_size_limit = 5000000;
"#;

/// Milliseconds slept per busy retry slot while stepping.
const STEP_BUSY_SLOT_MS: u64 = 20;

/// Milliseconds slept per busy retry while closing.
const CLOSE_BUSY_SLOT_MS: u64 = 200;

/// State behind the database lock.
struct Active {
    conn: rusqlite::Connection,
    in_transaction: bool,
    uncommitted_updates: u64,
    synchronicity: Synchronicity,
}

pub struct IoHandle {
    path: PathBuf,
    read_only: bool,

    /// The database lock.
    state: Mutex<Option<Active>>,

    error_count: AtomicU64,

    /// Busy retry budget, as a count of 20ms slots.
    busy_retry_timeout: AtomicU32,
}

/// A statement prepared for one execution: cached natives for plain
/// templates, throwaway natives for multi-bind expansions.
enum Prepared<'c> {
    Cached(rusqlite::CachedStatement<'c>),
    Plain(rusqlite::Statement<'c>),
}

impl<'c> Prepared<'c> {
    fn stmt_mut(&mut self) -> &mut rusqlite::Statement<'c> {
        match self {
            Prepared::Cached(s) => s,
            Prepared::Plain(s) => s,
        }
    }
}

fn active_mut<'a>(state: &'a mut Option<Active>) -> Result<&'a mut Active> {
    state
        .as_mut()
        .ok_or_else(|| anyhow::anyhow!("No open database"))
}

fn prepare<'c>(
    conn: &'c rusqlite::Connection,
    cacheable: bool,
    sql: &str,
) -> Result<Prepared<'c>> {
    if cacheable {
        Ok(Prepared::Cached(conn.prepare_cached(sql)?))
    } else {
        Ok(Prepared::Plain(conn.prepare(sql)?))
    }
}

/// Bind the flattened argument list.  An arity mismatch against the prepared
/// statement is logged but binding proceeds with what's there; unbound
/// parameters stay NULL.
fn bind_params(
    stmt: &mut rusqlite::Statement<'_>,
    expanded: &Expanded<'_>,
) -> Result<()> {
    let wanted = stmt.parameter_count();
    if wanted != expanded.binds.len() {
        warn!(
            "{:?}: statement has {} bind points, got {} arguments",
            expanded.sql,
            wanted,
            expanded.binds.len()
        );
    }

    for (i, value) in expanded.binds.iter().take(wanted).enumerate() {
        stmt.raw_bind_parameter(i + 1, value)?;
    }
    Ok(())
}

fn begin_locked(active: &mut Active, deferred: bool) -> Result<()> {
    if active.in_transaction {
        anyhow::bail!("A transaction is already open");
    }
    let sql = if deferred { "BEGIN DEFERRED" } else { "BEGIN" };
    let mut stmt = active.conn.prepare_cached(sql)?;
    stmt.raw_execute()?;
    drop(stmt);
    active.in_transaction = true;
    Ok(())
}

fn commit_locked(active: &mut Active, renew: bool) -> Result<()> {
    if !active.in_transaction {
        anyhow::bail!("No active transaction");
    }
    let mut stmt = active.conn.prepare_cached("COMMIT")?;
    stmt.raw_execute()?;
    drop(stmt);
    active.in_transaction = false;
    active.uncommitted_updates = 0;
    if renew {
        begin_locked(active, false)?;
    }
    Ok(())
}

impl IoHandle {
    /// Open the database, creating the file when writable.
    pub(crate) fn open(
        path: &Path,
        read_only: bool,
        busy_retry_timeout: u32,
        statement_cache_capacity: usize,
    ) -> Result<IoHandle> {
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };

        let conn = rusqlite::Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(
            STEP_BUSY_SLOT_MS * busy_retry_timeout as u64,
        ))?;
        conn.set_prepared_statement_cache_capacity(statement_cache_capacity);
        if !read_only {
            conn.execute_batch(OPEN_SQL)?;
        }
        info!("Opened database at {}", path.display());

        Ok(IoHandle {
            path: path.to_path_buf(),
            read_only,
            state: Mutex::new(Some(Active {
                conn,
                in_transaction: false,
                uncommitted_updates: 0,
                // Sqlite's own default until someone sets it.
                synchronicity: Synchronicity::Full,
            })),
            error_count: AtomicU64::new(0),
            busy_retry_timeout: AtomicU32::new(busy_retry_timeout),
        })
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    pub fn get_error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub(crate) fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_busy_retry_timeout(&self) -> u32 {
        self.busy_retry_timeout.load(Ordering::Relaxed)
    }

    /// Change the busy retry budget.  Applies immediately to the open
    /// connection.
    pub fn set_busy_retry_timeout(&self, slots: u32) -> bool {
        self.busy_retry_timeout.store(slots, Ordering::Relaxed);
        let guard = self.state.lock().unwrap();
        let Some(active) = guard.as_ref() else {
            return false;
        };
        match active
            .conn
            .busy_timeout(Duration::from_millis(STEP_BUSY_SLOT_MS * slots as u64))
        {
            Ok(()) => true,
            Err(e) => {
                self.note_error();
                error!("Failed to set busy timeout: {}", e);
                false
            }
        }
    }

    /// Run a mutating statement.  Returns false on failure, which is counted
    /// and logged.  Successful steps bump the uncommitted-update counter
    /// when a transaction is open.
    pub fn update(&self, stmt: &Statement, args: &[SqlValue]) -> bool {
        let mut guard = self.state.lock().unwrap();
        let res = active_mut(&mut guard).and_then(|active| {
            let expanded = stmt.expand(args)?;
            let mut prepared = prepare(&active.conn, !stmt.is_multi_bind(), &expanded.sql)?;
            bind_params(prepared.stmt_mut(), &expanded)?;
            prepared.stmt_mut().raw_execute()?;
            drop(prepared);
            if active.in_transaction {
                active.uncommitted_updates += 1;
            }
            Ok(())
        });

        match res {
            Ok(()) => true,
            Err(e) => {
                self.note_error();
                error!("Update {:?} failed: {:#}", stmt.get_sql(), e);
                false
            }
        }
    }

    /// Run a query and hand a cursor to the callback.  The database lock is
    /// held for the whole callback: the cursor's lifetime *is* the lock
    /// tenure, so at most one cursor can exist per handle and it cannot leak
    /// past the lock release.
    pub fn with_cursor<R>(
        &self,
        stmt: &Statement,
        args: &[SqlValue],
        f: impl FnOnce(&mut ResultSet<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.state.lock().unwrap();
        let res = (|| {
            let active = active_mut(&mut guard)?;
            let expanded = stmt.expand(args)?;
            let mut prepared = prepare(&active.conn, !stmt.is_multi_bind(), &expanded.sql)?;
            bind_params(prepared.stmt_mut(), &expanded)?;
            let columns: SmallVec<[String; 8]> = prepared
                .stmt_mut()
                .column_names()
                .iter()
                .map(|c| c.to_lowercase())
                .collect();
            let rows = prepared.stmt_mut().raw_query();
            let mut rs = ResultSet::new(rows, columns, &self.error_count);
            f(&mut rs)
        })();

        if let Err(e) = &res {
            self.note_error();
            debug!("Query {:?} failed: {:#}", stmt.get_sql(), e);
        }
        res
    }

    /// One-row, one-column convenience getters.  `None` both for no rows and
    /// for failure (which is counted and logged).
    pub fn string_for(&self, sql: &str, args: &[SqlValue]) -> Option<String> {
        self.one_row(sql, args, |row| row.string_at(0))
    }

    pub fn int64_for(&self, sql: &str, args: &[SqlValue]) -> Option<i64> {
        self.one_row(sql, args, |row| row.int64_at(0))
    }

    pub fn bool_for(&self, sql: &str, args: &[SqlValue]) -> Option<bool> {
        self.one_row(sql, args, |row| row.bool_at(0))
    }

    pub fn number_for(&self, sql: &str, args: &[SqlValue]) -> Option<f64> {
        self.one_row(sql, args, |row| row.number_at(0))
    }

    pub fn date_for(&self, sql: &str, args: &[SqlValue]) -> Option<f64> {
        self.one_row(sql, args, |row| row.timestamp_at(0))
    }

    pub fn data_for(&self, sql: &str, args: &[SqlValue]) -> Option<Vec<u8>> {
        self.one_row(sql, args, |row| row.blob_at(0))
    }

    fn one_row<R>(
        &self,
        sql: &str,
        args: &[SqlValue],
        get: impl FnOnce(&crate::result_set::RowView<'_>) -> Option<R>,
    ) -> Option<R> {
        let stmt = Statement::new(sql);
        self.with_cursor(&stmt, args, |rs| Ok(rs.next().as_ref().and_then(get)))
            .unwrap_or(None)
    }

    pub fn in_transaction(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.in_transaction)
            .unwrap_or(false)
    }

    pub fn get_uncommitted_updates(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.uncommitted_updates)
            .unwrap_or(0)
    }

    pub fn begin_transaction(&self, deferred: bool) -> bool {
        let mut guard = self.state.lock().unwrap();
        match active_mut(&mut guard).and_then(|a| begin_locked(a, deferred)) {
            Ok(()) => true,
            Err(e) => {
                warn!("begin_transaction: {:#}", e);
                false
            }
        }
    }

    /// Commit.  With `renew`, a fresh transaction is opened before the lock
    /// is released, so the in-transaction flag is preserved across the call.
    pub fn commit(&self, renew: bool) -> bool {
        let mut guard = self.state.lock().unwrap();
        match active_mut(&mut guard).and_then(|a| commit_locked(a, renew)) {
            Ok(()) => true,
            Err(e) => {
                warn!("commit: {:#}", e);
                false
            }
        }
    }

    pub fn rollback(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        let res = active_mut(&mut guard).and_then(|active| {
            if !active.in_transaction {
                anyhow::bail!("No active transaction");
            }
            active.conn.execute_batch("ROLLBACK")?;
            active.in_transaction = false;
            active.uncommitted_updates = 0;
            Ok(())
        });
        match res {
            Ok(()) => true,
            Err(e) => {
                warn!("rollback: {:#}", e);
                false
            }
        }
    }

    pub fn get_synchronicity(&self) -> Option<Synchronicity> {
        self.state.lock().unwrap().as_ref().map(|a| a.synchronicity)
    }

    /// Apply a durability level.  Legal mid-transaction: the open
    /// transaction is committed, the pragma applied, and a fresh transaction
    /// opened, all under one lock acquisition.
    pub fn set_synchronicity(&self, level: Synchronicity) -> bool {
        let mut guard = self.state.lock().unwrap();
        let res = active_mut(&mut guard).and_then(|active| {
            let was_in_transaction = active.in_transaction;
            if was_in_transaction {
                commit_locked(active, false)?;
            }
            active
                .conn
                .execute_batch(&format!("PRAGMA synchronous = {}", level.as_sql()))?;
            active.synchronicity = level;
            if was_in_transaction {
                begin_locked(active, false)?;
            }
            Ok(())
        });
        match res {
            Ok(()) => true,
            Err(e) => {
                self.note_error();
                error!("set_synchronicity({:?}): {:#}", level, e);
                false
            }
        }
    }

    pub fn set_locking_mode(&self, exclusive: bool) -> bool {
        let mode = if exclusive { "EXCLUSIVE" } else { "NORMAL" };
        let mut guard = self.state.lock().unwrap();
        let res = active_mut(&mut guard).and_then(|active| {
            active
                .conn
                .execute_batch(&format!("PRAGMA locking_mode = {}", mode))?;
            Ok(())
        });
        match res {
            Ok(()) => true,
            Err(e) => {
                self.note_error();
                error!("set_locking_mode({}): {:#}", mode, e);
                false
            }
        }
    }

    pub fn vacuum(&self) -> bool {
        self.maintenance("VACUUM")
    }

    pub fn analyse(&self) -> bool {
        self.maintenance("ANALYZE")
    }

    /// Prepared statements do not survive VACUUM or ANALYZE, so both flush
    /// the statement cache, commit any open transaction, run, and flush
    /// again to catch anything prepared during the operation.
    fn maintenance(&self, sql: &str) -> bool {
        let mut guard = self.state.lock().unwrap();
        let res = active_mut(&mut guard).and_then(|active| {
            active.conn.flush_prepared_statement_cache();
            if active.in_transaction {
                commit_locked(active, false)?;
            }
            active.conn.execute_batch(sql)?;
            active.conn.flush_prepared_statement_cache();
            Ok(())
        });
        match res {
            Ok(()) => true,
            Err(e) => {
                self.note_error();
                error!("{} failed: {:#}", sql, e);
                false
            }
        }
    }

    /// Create an index.  Named `idx_<table>_<col1>_<col2>_…` unless a name
    /// is supplied; idempotent via IF NOT EXISTS.
    pub fn create_index(&self, table: &str, columns: &[&str], name: Option<&str>) -> bool {
        if !is_valid_identifier(table)
            || columns.is_empty()
            || !columns.iter().all(|c| is_valid_identifier(c))
            || !name.map(is_valid_identifier).unwrap_or(true)
        {
            warn!("create_index: invalid identifier in {}({:?})", table, columns);
            return false;
        }

        let default_name = format!("idx_{}_{}", table, columns.iter().join("_"));
        let name = name.unwrap_or(&default_name);
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            name,
            table,
            columns.iter().join(", ")
        );

        let mut guard = self.state.lock().unwrap();
        let res = active_mut(&mut guard).and_then(|active| {
            // Schema change: cached statements must not survive it.
            active.conn.flush_prepared_statement_cache();
            active.conn.execute_batch(&sql)?;
            Ok(())
        });
        match res {
            Ok(()) => true,
            Err(e) => {
                self.note_error();
                error!("create_index {}: {:#}", name, e);
                false
            }
        }
    }

    /// Finalize every cached prepared statement.
    pub fn finalise_prepared_statements(&self) {
        if let Some(active) = self.state.lock().unwrap().as_ref() {
            active.conn.flush_prepared_statement_cache();
        }
    }

    /// Run raw SQL (no arguments).  Used for schema statements.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let active = active_mut(&mut guard)?;
        active.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Close the handle.  Idempotent.  The caller is responsible for having
    /// drained the background queue first; any still-open cursor simply
    /// holds the lock until it finishes, and close proceeds after it.
    ///
    /// Writable handles commit the terminal transaction, switch the journal
    /// back to delete mode, run an empty BEGIN/COMMIT pair, and trim free
    /// pages.  The native close is retried on busy with 200ms sleeps up to
    /// the retry budget.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let Some(mut active) = guard.take() else {
            return Ok(());
        };

        active.conn.flush_prepared_statement_cache();

        if !self.read_only {
            if active.in_transaction {
                if let Err(e) = commit_locked(&mut active, false) {
                    self.note_error();
                    warn!("Terminal commit failed: {:#}", e);
                }
            }

            for sql in [
                "PRAGMA journal_mode = delete;",
                "BEGIN; COMMIT;",
                "PRAGMA incremental_vacuum(1000);",
            ] {
                if let Err(e) = active.conn.execute_batch(sql) {
                    self.note_error();
                    warn!("Close-time {:?} failed: {}", sql, e);
                }
            }
        }

        let budget = self.busy_retry_timeout.load(Ordering::Relaxed);
        let mut conn = active.conn;
        let mut attempt = 0u32;
        loop {
            match conn.close() {
                Ok(()) => {
                    info!("Closed database at {}", self.path.display());
                    return Ok(());
                }
                Err((returned, e)) => {
                    let busy = matches!(
                        &e,
                        rusqlite::Error::SqliteFailure(f, _)
                            if f.code == rusqlite::ErrorCode::DatabaseBusy
                    );
                    if busy && attempt < budget {
                        attempt += 1;
                        std::thread::sleep(Duration::from_millis(CLOSE_BUSY_SLOT_MS));
                        conn = returned;
                        continue;
                    }
                    self.note_error();
                    error!("Failed to close {}: {}", self.path.display(), e);
                    anyhow::bail!("Failed to close database: {}", e);
                }
            }
        }
    }
}

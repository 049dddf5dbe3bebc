//! Database facade: table manager, flush, eviction, checkpoint, recovery.

use crate::cache::LruTracker;
use crate::checkpoint::{self, CheckpointState};
use crate::config::Config;
use crate::crypto::TableCipher;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventHub, EventKind, EventSink};
use crate::filter::QueryOptions;
use crate::types::{now_millis, validate_key, validate_table_name, WriteOp, WriteOptions};
use crate::wal::{CheckpointRequest, WalEntry, WalLimits, WalManager, WalOp};
use mikrodb_codec::{decode_table, encode_table, Record, Value};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// An entry queued for the next table-file rewrite.
struct PendingWrite {
    table: String,
    key: String,
    record: Record,
}

/// All mutable table state, serialized behind one lock.
struct EngineState {
    /// Resident tables: name → key → record.
    tables: HashMap<String, HashMap<String, Record>>,
    /// Access recency for eviction.
    lru: LruTracker,
    /// Writes awaiting the next table-file rewrite.
    write_buffer: Vec<PendingWrite>,
}

/// Cancellable sleep shared with the timer threads.
struct Shutdown {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Sleeps up to `timeout`; returns true once shutdown was triggered.
    fn wait_for(&self, timeout: std::time::Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return true;
        }
        self.signal.wait_for(&mut stopped, timeout);
        *stopped
    }

    fn trigger(&self) {
        *self.stopped.lock() = true;
        self.signal.notify_all();
    }
}

/// The main database handle.
///
/// `Database` owns every moving part of the engine: the table cache, the
/// WAL, the codec and optional encryption, the LRU tracker, the event hub,
/// and the checkpoint state. All mutating operations are serialized through
/// one internal lock, so a single instance behaves as one logical actor.
///
/// # Opening a database
///
/// ```rust,ignore
/// use mikrodb_core::{Config, Database, WriteOp, WriteOptions};
/// use mikrodb_core::Value;
///
/// let db = Database::open(Config::new("my_database"))?;
/// db.write(
///     WriteOp::new("users", "u1", Value::from("hello")),
///     &WriteOptions::default(),
/// )?;
/// let record = db.get("users", "u1")?;
/// db.close()?;
/// ```
pub struct Database {
    inner: Arc<Inner>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: Config,
    dir: DatabaseDir,
    wal: Arc<WalManager>,
    cipher: Option<TableCipher>,
    state: Mutex<EngineState>,
    checkpoint: Arc<CheckpointState>,
    events: EventHub,
    is_open: AtomicBool,
    shutdown: Shutdown,
}

impl Database {
    /// Opens (or creates) a database in the configured directory.
    ///
    /// If an interrupted checkpoint left its recovery marker behind, a
    /// forced checkpoint runs before the engine serves requests. The
    /// background WAL-flush and checkpoint timers start afterwards unless
    /// `wal_interval` is zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked by another process, key
    /// derivation fails, or the startup checkpoint cannot complete.
    pub fn open(config: Config) -> CoreResult<Self> {
        let dir = DatabaseDir::open(&config.database_dir)?;
        let wal_path = dir.wal_path(&config.wal_file_name);
        let wal = Arc::new(WalManager::open(
            &wal_path,
            WalLimits {
                max_buffer_entries: config.max_wal_buffer_entries,
                max_buffer_size: config.max_wal_buffer_size,
                max_size_before_checkpoint: config.max_wal_size_before_checkpoint,
            },
        )?);

        let cipher = match &config.encryption_key {
            Some(password) => Some(TableCipher::from_password(password)?),
            None => None,
        };

        let checkpoint_state = Arc::new(CheckpointState::new());
        let hook: Weak<dyn CheckpointRequest> =
            Arc::downgrade(&(checkpoint_state.clone() as Arc<dyn CheckpointRequest>));
        wal.set_checkpoint_hook(hook);

        let cache_limit = config.cache_limit;
        let inner = Arc::new(Inner {
            config,
            dir,
            wal,
            cipher,
            state: Mutex::new(EngineState {
                tables: HashMap::new(),
                lru: LruTracker::new(cache_limit),
                write_buffer: Vec::new(),
            }),
            checkpoint: checkpoint_state,
            events: EventHub::new(),
            is_open: AtomicBool::new(true),
            shutdown: Shutdown::new(),
        });

        // An orphaned marker means an earlier checkpoint did not finish;
        // redo it before serving.
        if checkpoint::marker_exists(&inner.marker_path()) {
            warn!("found checkpoint recovery marker, running startup checkpoint");
            inner.run_checkpoint(true)?;
        }

        let db = Self {
            inner,
            timers: Mutex::new(Vec::new()),
        };
        db.spawn_timers();
        Ok(db)
    }

    fn spawn_timers(&self) {
        let interval = self.inner.config.wal_interval;
        if interval.is_zero() {
            return;
        }
        let mut timers = self.timers.lock();

        let flush_inner = Arc::clone(&self.inner);
        timers.push(std::thread::spawn(move || loop {
            if flush_inner.shutdown.wait_for(interval) {
                break;
            }
            if let Err(err) = flush_inner.wal.flush() {
                error!(%err, "periodic WAL flush failed");
            }
        }));

        let ckpt_inner = Arc::clone(&self.inner);
        timers.push(std::thread::spawn(move || loop {
            if ckpt_inner.shutdown.wait_for(interval) {
                break;
            }
            let force = ckpt_inner.checkpoint.take_requested();
            if let Err(err) = ckpt_inner.run_checkpoint(force) {
                error!(%err, "periodic checkpoint failed");
            }
        }));
    }

    /// Reads a single record.
    ///
    /// An expired record found along the way is lazily deleted (WAL entry,
    /// memory removal, `item.expired` event) and reported as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed, the table name is
    /// invalid, or the table cannot be loaded.
    pub fn get(&self, table: &str, key: &str) -> CoreResult<Option<Record>> {
        self.inner.get(table, key)
    }

    /// Reads every `(key, record)` pair of a table.
    ///
    /// Expired records are lazily deleted and excluded.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the table cannot be
    /// loaded.
    pub fn get_all(&self, table: &str) -> CoreResult<Vec<(String, Record)>> {
        self.inner.get_all(table)
    }

    /// Runs a filtered, sorted, sliced read over a table's values.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the table cannot be
    /// loaded.
    pub fn query(&self, table: &str, options: &QueryOptions) -> CoreResult<Vec<Value>> {
        self.inner.query(table, options)
    }

    /// Writes a single record. See [`Database::write_batch`].
    ///
    /// # Errors
    ///
    /// Propagates validation and I/O errors; a version mismatch is reported
    /// as `Ok(false)`.
    pub fn write(&self, op: WriteOp, options: &WriteOptions) -> CoreResult<bool> {
        self.inner.write_batch(vec![op], options)
    }

    /// Writes a batch of records.
    ///
    /// Records are processed in slices of `concurrency_limit`; the first
    /// slice containing a version mismatch ends the batch with `false`,
    /// leaving earlier commits in place. Every batch ends by processing the
    /// pending write buffer; `flush_immediately` flushes the WAL first.
    ///
    /// # Errors
    ///
    /// Propagates validation and I/O errors; version mismatches are
    /// reported as `Ok(false)`.
    pub fn write_batch(&self, ops: Vec<WriteOp>, options: &WriteOptions) -> CoreResult<bool> {
        self.inner.write_batch(ops, options)
    }

    /// Deletes a record, optionally guarded by an expected version.
    ///
    /// Returns `false` if the key is absent or the version does not match.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the WAL append fails.
    pub fn delete(
        &self,
        table: &str,
        key: &str,
        expected_version: Option<u32>,
    ) -> CoreResult<bool> {
        self.inner.delete(table, key, expected_version)
    }

    /// Drops a table from memory and emits `table.deleted`.
    ///
    /// The on-disk file is not removed; a later write to the same table
    /// overwrites it. Returns `false` if the table was not resident.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed.
    pub fn delete_table(&self, table: &str) -> CoreResult<bool> {
        self.inner.delete_table(table)
    }

    /// Returns the number of live keys in a table, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the table cannot be
    /// loaded.
    pub fn table_size(&self, table: &str) -> CoreResult<usize> {
        self.inner.table_size(table)
    }

    /// Returns the number of tables currently resident in memory.
    #[must_use]
    pub fn resident_table_count(&self) -> usize {
        self.inner.state.lock().tables.len()
    }

    /// Flushes the WAL buffer to disk.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error; the buffer is restored first.
    pub fn flush_wal(&self) -> CoreResult<()> {
        self.inner.ensure_open()?;
        self.inner.wal.flush()
    }

    /// Flushes the WAL buffer, then rewrites every table touched by the
    /// pending write buffer.
    ///
    /// # Errors
    ///
    /// Propagates WAL flush errors. Per-table rewrite failures are logged
    /// and do not abort the rest.
    pub fn flush(&self) -> CoreResult<()> {
        self.inner.ensure_open()?;
        self.inner.wal.flush()?;
        let mut state = self.inner.state.lock();
        self.inner.flush_writes_locked(&mut state);
        Ok(())
    }

    /// Runs a checkpoint. With `force`, the interval gate is skipped.
    ///
    /// Returns `false` when a checkpoint was already running or the
    /// interval had not elapsed.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if the WAL cannot be flushed or
    /// truncated; the recovery marker is retained so the next open
    /// retries.
    pub fn checkpoint(&self, force: bool) -> CoreResult<bool> {
        self.inner.ensure_open()?;
        self.inner.run_checkpoint(force)
    }

    /// Removes every expired record from the resident tables.
    ///
    /// Each removal is logged to the WAL and emits `item.expired`.
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or a WAL append fails.
    pub fn cleanup_expired_items(&self) -> CoreResult<usize> {
        self.inner.cleanup_expired_items()
    }

    /// Writes a JSON snapshot of a table to `<table>_dump.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be loaded or the file cannot
    /// be written.
    pub fn dump(&self, table: &str) -> CoreResult<PathBuf> {
        self.inner.dump_table(table)
    }

    /// Dumps every resident table. Returns the paths written.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub fn dump_all(&self) -> CoreResult<Vec<PathBuf>> {
        self.inner.ensure_open()?;
        let tables: Vec<String> = {
            let state = self.inner.state.lock();
            state.tables.keys().cloned().collect()
        };
        let mut paths = Vec::with_capacity(tables.len());
        for table in tables {
            paths.push(self.inner.dump_table(&table)?);
        }
        Ok(paths)
    }

    /// Subscribes to change events.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Registers an external event sink.
    pub fn register_sink(&self, sink: Box<dyn EventSink>) {
        self.inner.events.register_sink(sink);
    }

    /// Checks whether the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open.load(Ordering::SeqCst)
    }

    /// Returns the configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Closes the database: stops the timers, waits for them, then runs a
    /// final flush of the WAL and the pending write buffer.
    ///
    /// # Errors
    ///
    /// Propagates the final flush error. The database counts as closed
    /// either way.
    pub fn close(&self) -> CoreResult<()> {
        if !self.inner.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.trigger();
        for handle in self.timers.lock().drain(..) {
            let _ = handle.join();
        }

        self.inner.wal.flush()?;
        let mut state = self.inner.state.lock();
        self.inner.flush_writes_locked(&mut state);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("resident_tables", &self.resident_table_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.checkpoint_marker_path(&self.config.wal_file_name)
    }

    // ------------------------------------------------------------------
    // Table activation and eviction
    // ------------------------------------------------------------------

    /// Makes a table resident: loads its file on first access, replays any
    /// pending WAL entries, stamps the LRU tracker, and evicts down to the
    /// cache limit.
    fn activate_table(&self, state: &mut EngineState, table: &str) -> CoreResult<()> {
        validate_table_name(table)?;
        let now = now_millis();

        if !state.tables.contains_key(table) {
            let mut records = self.load_table_from_disk(table, now)?;
            self.wal.replay_table(table, now, |entry| match entry.op {
                WalOp::Write => {
                    records.insert(
                        entry.key,
                        Record::new(entry.value, entry.version, entry.timestamp, entry.expiration),
                    );
                }
                WalOp::Delete => {
                    records.remove(&entry.key);
                }
            })?;
            if self.config.debug {
                debug!(table, records = records.len(), "activated table");
            }
            state.tables.insert(table.to_string(), records);
        }

        state.lru.track_access(table);
        self.evict_over_limit(state);
        Ok(())
    }

    fn load_table_from_disk(&self, table: &str, now: u64) -> CoreResult<HashMap<String, Record>> {
        let path = self.dir.table_path(table)?;
        let raw = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };

        let plaintext = match &self.cipher {
            Some(cipher) if TableCipher::looks_encrypted(&raw) => match cipher.open(&raw) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    warn!(table, %err, "table decryption failed, falling back to plaintext read");
                    raw
                }
            },
            _ => raw,
        };

        match decode_table(&plaintext, now) {
            Ok(records) => Ok(records.into_iter().collect()),
            Err(err) => {
                error!(table, %err, "table file unreadable, reinitializing empty");
                Ok(HashMap::new())
            }
        }
    }

    /// Evicts least-recently-used tables while over the cache limit. Each
    /// victim is persisted before its in-memory map is dropped; a victim
    /// that fails to persist stays resident.
    fn evict_over_limit(&self, state: &mut EngineState) {
        let victims = state.lru.find_tables_for_eviction(state.tables.len());
        for victim in victims {
            match self.persist_table_locked(state, &victim) {
                Ok(()) => {
                    state.tables.remove(&victim);
                    if self.config.debug {
                        debug!(table = %victim, "evicted table");
                    }
                }
                Err(err) => {
                    error!(table = %victim, %err, "eviction flush failed, keeping table resident");
                    state.lru.track_access(&victim);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn get(&self, table: &str, key: &str) -> CoreResult<Option<Record>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.activate_table(&mut state, table)?;
        let now = now_millis();

        let expired = match state.tables[table].get(key) {
            None => return Ok(None),
            Some(record) => record.is_expired(now),
        };
        if expired {
            self.purge_expired_locked(&mut state, table, key, now)?;
            return Ok(None);
        }
        Ok(state.tables[table].get(key).cloned())
    }

    fn get_all(&self, table: &str) -> CoreResult<Vec<(String, Record)>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.activate_table(&mut state, table)?;
        let now = now_millis();

        self.purge_all_expired_locked(&mut state, table, now)?;
        Ok(state.tables[table]
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    fn query(&self, table: &str, options: &QueryOptions) -> CoreResult<Vec<Value>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.activate_table(&mut state, table)?;
        let now = now_millis();

        self.purge_all_expired_locked(&mut state, table, now)?;
        Ok(options.run(state.tables[table].values().map(|record| &record.value)))
    }

    fn table_size(&self, table: &str) -> CoreResult<usize> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.activate_table(&mut state, table)?;
        self.purge_all_expired_locked(&mut state, table, now_millis())?;
        Ok(state.tables[table].len())
    }

    // ------------------------------------------------------------------
    // Writes and deletes
    // ------------------------------------------------------------------

    fn write_batch(&self, ops: Vec<WriteOp>, options: &WriteOptions) -> CoreResult<bool> {
        self.ensure_open()?;
        let slice_size = options.concurrency_limit.max(1);
        let mut all_committed = true;

        let mut state = self.state.lock();
        for slice in ops.chunks(slice_size) {
            let mut slice_failed = false;
            for op in slice {
                match self.write_one(&mut state, op) {
                    Ok(()) => {}
                    Err(err) if err.is_version_mismatch() => {
                        warn!(table = %op.table, key = %op.key, %err, "write rejected");
                        slice_failed = true;
                    }
                    Err(err) => return Err(err),
                }
            }
            if slice_failed {
                all_committed = false;
                break;
            }
        }

        // The batch always ends with the pending writes processed; an
        // immediate flush pushes the WAL buffer out first.
        if options.flush_immediately {
            self.wal.flush()?;
        }
        self.flush_writes_locked(&mut state);
        Ok(all_committed)
    }

    fn write_one(&self, state: &mut EngineState, op: &WriteOp) -> CoreResult<()> {
        validate_table_name(&op.table)?;
        validate_key(&op.key)?;
        self.activate_table(state, &op.table)?;
        let now = now_millis();

        // A record that expired while resident does not contribute a
        // version to build on.
        if state.tables[&op.table]
            .get(&op.key)
            .map_or(false, |record| record.is_expired(now))
        {
            self.purge_expired_locked(state, &op.table, &op.key, now)?;
        }

        let current_version = state.tables[&op.table]
            .get(&op.key)
            .map_or(0, |record| record.version);
        if let Some(expected) = op.expected_version {
            if expected != current_version {
                return Err(CoreError::VersionMismatch {
                    table: op.table.clone(),
                    key: op.key.clone(),
                    expected,
                    current: current_version,
                });
            }
        }
        let new_version = current_version + 1;

        let entry = WalEntry::write(
            now,
            &op.table,
            &op.key,
            new_version,
            op.expiration,
            op.value.clone(),
        );
        self.wal.append(&entry)?;

        let record = Record::new(op.value.clone(), new_version, now, op.expiration);
        state
            .tables
            .get_mut(&op.table)
            .ok_or_else(|| CoreError::not_found(format!("table {}", op.table)))?
            .insert(op.key.clone(), record.clone());
        state.write_buffer.push(PendingWrite {
            table: op.table.clone(),
            key: op.key.clone(),
            record,
        });

        if state.write_buffer.len() > self.config.max_write_ops_before_flush {
            self.flush_writes_locked(state);
        }
        Ok(())
    }

    fn delete(&self, table: &str, key: &str, expected_version: Option<u32>) -> CoreResult<bool> {
        self.ensure_open()?;
        validate_table_name(table)?;
        validate_key(key)?;
        let mut state = self.state.lock();
        self.activate_table(&mut state, table)?;
        let now = now_millis();

        let (version, expired) = match state.tables[table].get(key) {
            None => return Ok(false),
            Some(record) => (record.version, record.is_expired(now)),
        };
        if expired {
            self.purge_expired_locked(&mut state, table, key, now)?;
            return Ok(false);
        }
        if let Some(expected) = expected_version {
            if expected != version {
                warn!(table, key, expected, current = version, "delete rejected");
                return Ok(false);
            }
        }

        self.wal.append(&WalEntry::delete(now, table, key, version))?;
        let removed = state
            .tables
            .get_mut(table)
            .and_then(|records| records.remove(key));
        self.events.emit(Event::item(EventKind::ItemDeleted, table, key, removed));
        Ok(true)
    }

    fn delete_table(&self, table: &str) -> CoreResult<bool> {
        self.ensure_open()?;
        validate_table_name(table)?;
        let mut state = self.state.lock();

        let was_resident = state.tables.remove(table).is_some();
        state.lru.remove(table);
        // Pending entries of a dropped table must not emit or persist.
        state.write_buffer.retain(|pending| pending.table != table);

        self.events.emit(Event::table(EventKind::TableDeleted, table));
        Ok(was_resident)
    }

    // ------------------------------------------------------------------
    // Expiration
    // ------------------------------------------------------------------

    /// Removes one expired record: WAL delete entry, memory removal,
    /// `item.expired` event.
    fn purge_expired_locked(
        &self,
        state: &mut EngineState,
        table: &str,
        key: &str,
        now: u64,
    ) -> CoreResult<()> {
        let Some(record) = state.tables.get(table).and_then(|records| records.get(key)) else {
            return Ok(());
        };
        let version = record.version;
        self.wal.append(&WalEntry::delete(now, table, key, version))?;
        let removed = state
            .tables
            .get_mut(table)
            .and_then(|records| records.remove(key));
        self.events.emit(Event::item(EventKind::ItemExpired, table, key, removed));
        Ok(())
    }

    fn purge_all_expired_locked(
        &self,
        state: &mut EngineState,
        table: &str,
        now: u64,
    ) -> CoreResult<usize> {
        let Some(records) = state.tables.get(table) else {
            return Ok(0);
        };
        let expired = LruTracker::find_expired_items(records, now);
        for key in &expired {
            self.purge_expired_locked(state, table, key, now)?;
        }
        Ok(expired.len())
    }

    fn cleanup_expired_items(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let now = now_millis();
        let tables: Vec<String> = state.tables.keys().cloned().collect();

        let mut removed = 0;
        for table in tables {
            removed += self.purge_all_expired_locked(&mut state, &table, now)?;
        }
        if removed > 0 {
            debug!(removed, "expired records cleaned up");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Processes the pending write buffer: emits `item.written` per entry
    /// and rewrites each touched table file. Per-table failures are logged;
    /// the snapshot is consumed either way, so entries appended afterwards
    /// are untouched.
    fn flush_writes_locked(&self, state: &mut EngineState) {
        if state.write_buffer.is_empty() {
            return;
        }
        let snapshot = std::mem::take(&mut state.write_buffer);

        let mut touched: Vec<String> = Vec::new();
        for pending in &snapshot {
            if !touched.contains(&pending.table) {
                touched.push(pending.table.clone());
            }
        }

        for table in touched {
            for pending in snapshot.iter().filter(|p| p.table == table) {
                self.events.emit(Event::item(
                    EventKind::ItemWritten,
                    &table,
                    &pending.key,
                    Some(pending.record.clone()),
                ));
            }
            if let Err(err) = self.persist_table_locked(state, &table) {
                error!(%table, %err, "failed to persist table");
            }
        }
    }

    /// Writes a table's entire in-memory image to disk via atomic replace,
    /// applying the encryption envelope when configured.
    fn persist_table_locked(&self, state: &EngineState, table: &str) -> CoreResult<()> {
        let Some(records) = state.tables.get(table) else {
            // Dropped from memory after its writes were buffered.
            return Ok(());
        };
        let image = encode_table(records.iter().map(|(key, record)| (key.as_str(), record)))?;
        let payload = match &self.cipher {
            Some(cipher) => cipher.seal(&image)?,
            None => image,
        };
        self.dir.atomic_replace(&self.dir.table_path(table)?, &payload)
    }

    /// Enqueues every key of a table and processes the buffer, persisting
    /// the table's current state.
    fn flush_table_locked(&self, state: &mut EngineState, table: &str) {
        let is_resident = match state.tables.get(table) {
            Some(records) => {
                let mut pending: Vec<PendingWrite> = records
                    .iter()
                    .map(|(key, record)| PendingWrite {
                        table: table.to_string(),
                        key: key.clone(),
                        record: record.clone(),
                    })
                    .collect();
                state.write_buffer.append(&mut pending);
                true
            }
            None => false,
        };
        self.flush_writes_locked(state);

        // A table left empty by deletes enqueues nothing, but its file must
        // still reflect the removals before the WAL is truncated.
        if is_resident && state.tables.get(table).map_or(false, HashMap::is_empty) {
            if let Err(err) = self.persist_table_locked(state, table) {
                error!(%table, %err, "failed to persist table");
            }
        }
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    /// Runs the marker-based checkpoint protocol.
    fn run_checkpoint(&self, force: bool) -> CoreResult<bool> {
        let now = now_millis();
        if !self.checkpoint.try_begin(force, self.config.wal_interval, now) {
            return Ok(false);
        }

        let result = self.checkpoint_body(now);
        match result {
            Ok(()) => {
                self.checkpoint.finish(now_millis());
                Ok(true)
            }
            Err(err) => {
                // The marker stays behind so the next open retries.
                self.checkpoint.abort();
                Err(CoreError::checkpoint_failed(err.to_string()))
            }
        }
    }

    fn checkpoint_body(&self, started_ms: u64) -> CoreResult<()> {
        let marker = self.marker_path();
        checkpoint::write_marker(&marker, started_ms)?;

        self.wal.flush()?;
        let tables = self.wal.referenced_tables()?;

        {
            let mut state = self.state.lock();
            for table in &tables {
                // Activation replays the table's WAL entries; the flush
                // then persists its current state. A failing table is
                // logged and the rest still checkpoint.
                match self.activate_table(&mut state, table) {
                    Ok(()) => self.flush_table_locked(&mut state, table),
                    Err(err) => error!(%table, %err, "checkpoint: table activation failed"),
                }
            }
        }

        self.wal.truncate()?;
        checkpoint::remove_marker(&marker)?;
        debug!(tables = tables.len(), "checkpoint complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dumps
    // ------------------------------------------------------------------

    fn dump_table(&self, table: &str) -> CoreResult<PathBuf> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.activate_table(&mut state, table)?;

        let mut snapshot = serde_json::Map::new();
        for (key, record) in &state.tables[table] {
            snapshot.insert(
                key.clone(),
                serde_json::json!({
                    "value": record.value.to_json(),
                    "version": record.version,
                    "timestamp": record.timestamp,
                    "expiration": record.expiration.unwrap_or(0),
                }),
            );
        }

        let path = self.dir.dump_path(table)?;
        let body = serde_json::to_vec_pretty(&serde_json::Value::Object(snapshot))
            .map_err(|err| CoreError::validation(format!("dump serialization failed: {err}")))?;
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Condition, FilterExpr, Operator};
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(path: &std::path::Path) -> Config {
        // Timers off: tests drive flushes and checkpoints explicitly.
        Config::new(path).wal_interval(Duration::ZERO)
    }

    fn open_db(path: &std::path::Path) -> Database {
        Database::open(test_config(path)).unwrap()
    }

    fn obj(pairs: &[(&str, Value)]) -> Value {
        Value::Object(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    fn put(db: &Database, table: &str, key: &str, value: Value) -> bool {
        db.write(WriteOp::new(table, key, value), &WriteOptions::default())
            .unwrap()
    }

    #[test]
    fn version_increments_per_write() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        assert!(put(&db, "users", "u1", obj(&[("name", Value::from("John"))])));
        assert!(put(&db, "users", "u1", obj(&[("name", Value::from("Jane"))])));

        let record = db.get("users", "u1").unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.value.get("name"), Some(&Value::from("Jane")));
    }

    #[test]
    fn version_mismatch_rejected_without_error() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        put(&db, "users", "u1", obj(&[("name", Value::from("John"))]));
        put(&db, "users", "u1", obj(&[("name", Value::from("Jane"))]));

        let rejected = db
            .write(
                WriteOp::new("users", "u1", obj(&[("name", Value::from("X"))]))
                    .expected_version(5),
                &WriteOptions::default(),
            )
            .unwrap();
        assert!(!rejected);

        let record = db.get("users", "u1").unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.value.get("name"), Some(&Value::from("Jane")));
    }

    #[test]
    fn expected_version_zero_guards_creation() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        let created = db
            .write(
                WriteOp::new("t", "k", Value::Int(1)).expected_version(0),
                &WriteOptions::default(),
            )
            .unwrap();
        assert!(created);

        let conflicted = db
            .write(
                WriteOp::new("t", "k", Value::Int(2)).expected_version(0),
                &WriteOptions::default(),
            )
            .unwrap();
        assert!(!conflicted);
    }

    #[test]
    fn delete_resets_version_counting() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        put(&db, "t", "k", Value::Int(1));
        put(&db, "t", "k", Value::Int(2));
        assert!(db.delete("t", "k", None).unwrap());
        assert!(db.get("t", "k").unwrap().is_none());

        put(&db, "t", "k", Value::Int(3));
        assert_eq!(db.get("t", "k").unwrap().unwrap().version, 1);
    }

    #[test]
    fn delete_guards() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        assert!(!db.delete("t", "missing", None).unwrap());

        put(&db, "t", "k", Value::Int(1));
        assert!(!db.delete("t", "k", Some(9)).unwrap());
        assert!(db.get("t", "k").unwrap().is_some());
        assert!(db.delete("t", "k", Some(1)).unwrap());
    }

    #[test]
    fn expired_records_vanish_on_read() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        let deadline = now_millis() - 1;
        db.write(
            WriteOp::new("t", "gone", Value::Int(1)).expiration(deadline),
            &WriteOptions::default(),
        )
        .unwrap();
        put(&db, "t", "kept", Value::Int(2));

        assert!(db.get("t", "gone").unwrap().is_none());
        assert!(db.get("t", "gone").unwrap().is_none());
        assert_eq!(db.table_size("t").unwrap(), 1);

        let all = db.get_all("t").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "kept");
    }

    #[test]
    fn cleanup_expired_items_sweeps_resident_tables() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        let deadline = now_millis() - 1;
        db.write(
            WriteOp::new("a", "dead", Value::Int(1)).expiration(deadline),
            &WriteOptions::default(),
        )
        .unwrap();
        put(&db, "a", "live", Value::Int(2));
        db.write(
            WriteOp::new("b", "dead", Value::Int(3)).expiration(deadline),
            &WriteOptions::default(),
        )
        .unwrap();

        let removed = db.cleanup_expired_items().unwrap();
        assert_eq!(removed, 2);
        assert_eq!(db.table_size("a").unwrap(), 1);
        assert_eq!(db.table_size("b").unwrap(), 0);
    }

    #[test]
    fn filter_between_and_or() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        put(
            &db,
            "users",
            "u1",
            obj(&[
                ("name", Value::from("Ann")),
                ("age", Value::Int(25)),
                ("role", Value::from("admin")),
                (
                    "profile",
                    obj(&[(
                        "location",
                        obj(&[("country", Value::from("Norway"))]),
                    )]),
                ),
            ]),
        );
        put(
            &db,
            "users",
            "u2",
            obj(&[
                ("name", Value::from("Ben")),
                ("age", Value::Int(30)),
                ("role", Value::from("user")),
                (
                    "profile",
                    obj(&[(
                        "location",
                        obj(&[("country", Value::from("Canada"))]),
                    )]),
                ),
            ]),
        );

        let between = db
            .query(
                "users",
                &QueryOptions::new().filter(
                    FilterExpr::new()
                        .condition("age", Condition::new(Operator::Between, vec![24, 26])),
                ),
            )
            .unwrap();
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].get("name"), Some(&Value::from("Ann")));

        let either = db
            .query(
                "users",
                &QueryOptions::new().filter(
                    FilterExpr::new()
                        .or(FilterExpr::new().field("role", "admin"))
                        .or(FilterExpr::new().field("profile.location.country", "Canada")),
                ),
            )
            .unwrap();
        assert_eq!(either.len(), 2);
    }

    #[test]
    fn query_sort_and_slice() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        for (key, age) in [("a", 30), ("b", 10), ("c", 20), ("d", 40)] {
            put(&db, "users", key, obj(&[("age", Value::Int(age))]));
        }

        let sorted = db
            .query(
                "users",
                &QueryOptions::new()
                    .sort_by(|a, b| {
                        a.get("age")
                            .and_then(Value::as_int)
                            .cmp(&b.get("age").and_then(Value::as_int))
                    })
                    .offset(1),
            )
            .unwrap();

        let ages: Vec<Option<i32>> = sorted
            .iter()
            .map(|v| v.get("age").and_then(Value::as_int))
            .collect();
        assert_eq!(ages, vec![Some(20), Some(30), Some(40)]);
    }

    #[test]
    fn delete_table_keeps_file() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        put(&db, "users", "u1", Value::Int(1));
        db.flush().unwrap();
        let file = temp.path().join("users");
        assert!(file.exists());

        assert!(db.delete_table("users").unwrap());
        assert_eq!(db.resident_table_count(), 0);
        assert!(file.exists());

        // Deleting a non-resident table still emits but reports false.
        assert!(!db.delete_table("users").unwrap());
    }

    #[test]
    fn events_for_each_mutation_kind() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let rx = db.subscribe();

        put(&db, "t", "k", Value::Int(1));
        let written = rx.try_recv().unwrap();
        assert_eq!(written.kind, EventKind::ItemWritten);
        assert_eq!(written.key.as_deref(), Some("k"));
        assert_eq!(written.record.as_ref().map(|r| r.version), Some(1));

        db.delete("t", "k", None).unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::ItemDeleted);

        db.write(
            WriteOp::new("t", "tmp", Value::Int(2)).expiration(now_millis() - 1),
            &WriteOptions::default(),
        )
        .unwrap();
        let _written = rx.try_recv().unwrap();
        db.get("t", "tmp").unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::ItemExpired);

        db.delete_table("t").unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::TableDeleted);
    }

    #[test]
    fn whitespace_keys_and_tables_rejected() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        let err = db
            .write(
                WriteOp::new("t", "bad key", Value::Int(1)),
                &WriteOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        let err = db
            .write(
                WriteOp::new("bad table", "k", Value::Int(1)),
                &WriteOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        assert!(db.get("no/such", "k").is_err());
    }

    #[test]
    fn batch_aborts_at_first_failing_slice() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        let ops = vec![
            WriteOp::new("t", "first", Value::Int(1)),
            WriteOp::new("t", "conflict", Value::Int(2)).expected_version(9),
            WriteOp::new("t", "never", Value::Int(3)),
        ];
        let options = WriteOptions {
            concurrency_limit: 1,
            flush_immediately: false,
        };
        let committed = db.write_batch(ops, &options).unwrap();
        assert!(!committed);

        assert!(db.get("t", "first").unwrap().is_some());
        assert!(db.get("t", "conflict").unwrap().is_none());
        assert!(db.get("t", "never").unwrap().is_none());
    }

    #[test]
    fn batch_slice_completes_before_abort() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        let ops = vec![
            WriteOp::new("t", "conflict", Value::Int(1)).expected_version(9),
            WriteOp::new("t", "same_slice", Value::Int(2)),
            WriteOp::new("t", "next_slice", Value::Int(3)),
        ];
        let options = WriteOptions {
            concurrency_limit: 2,
            flush_immediately: false,
        };
        assert!(!db.write_batch(ops, &options).unwrap());

        // The failing slice still committed its other member.
        assert!(db.get("t", "same_slice").unwrap().is_some());
        assert!(db.get("t", "next_slice").unwrap().is_none());
    }

    #[test]
    fn cache_limit_bounds_resident_tables() {
        let temp = tempdir().unwrap();
        let db = Database::open(test_config(temp.path()).cache_limit(2)).unwrap();

        put(&db, "t1", "k", Value::Int(1));
        put(&db, "t2", "k", Value::Int(2));
        put(&db, "t3", "k", Value::Int(3));
        assert!(db.resident_table_count() <= 2);

        // Evicted tables reload transparently.
        assert_eq!(db.get("t1", "k").unwrap().unwrap().value, Value::Int(1));
        assert_eq!(db.get("t2", "k").unwrap().unwrap().value, Value::Int(2));
        assert_eq!(db.get("t3", "k").unwrap().unwrap().value, Value::Int(3));
    }

    #[test]
    fn checkpoint_truncates_wal() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        for i in 0..10 {
            put(&db, "t", &format!("k{i}"), Value::Int(i));
        }
        db.flush_wal().unwrap();
        let wal_file = temp.path().join("wal.log");
        assert!(std::fs::metadata(&wal_file).unwrap().len() > 0);

        assert!(db.checkpoint(true).unwrap());
        assert_eq!(std::fs::metadata(&wal_file).unwrap().len(), 0);
        assert!(temp.path().join("t").exists());
        assert!(!temp.path().join("wal.log.checkpoint").exists());
    }

    #[test]
    fn checkpoint_is_exclusive_and_gated() {
        let temp = tempdir().unwrap();
        let db = Database::open(
            Config::new(temp.path()).wal_interval(Duration::from_secs(3600)),
        )
        .unwrap();

        assert!(db.checkpoint(true).unwrap());
        // Unforced right after a run: the interval has not elapsed.
        assert!(!db.checkpoint(false).unwrap());
        assert!(db.checkpoint(true).unwrap());
        db.close().unwrap();
    }

    #[test]
    fn dump_writes_snapshot() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());

        put(&db, "users", "u1", obj(&[("name", Value::from("Ann"))]));
        let path = db.dump("users").unwrap();
        assert_eq!(path, temp.path().join("users_dump.json"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["u1"]["version"], 1);
        assert_eq!(json["u1"]["value"]["name"], "Ann");
        assert_eq!(json["u1"]["expiration"], 0);
    }

    #[test]
    fn operations_fail_after_close() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        db.close().unwrap();

        assert!(!db.is_open());
        assert!(matches!(
            db.get("t", "k"),
            Err(CoreError::DatabaseClosed)
        ));
        assert!(matches!(
            db.write(WriteOp::new("t", "k", Value::Int(1)), &WriteOptions::default()),
            Err(CoreError::DatabaseClosed)
        ));
        // Closing twice is fine.
        db.close().unwrap();
    }

    #[test]
    fn timers_start_and_stop_cleanly() {
        let temp = tempdir().unwrap();
        let db = Database::open(
            Config::new(temp.path()).wal_interval(Duration::from_millis(20)),
        )
        .unwrap();

        put(&db, "t", "k", Value::Int(1));
        std::thread::sleep(Duration::from_millis(120));
        // The background checkpoint made the write durable and emptied
        // the WAL.
        assert_eq!(
            std::fs::metadata(temp.path().join("wal.log")).unwrap().len(),
            0
        );
        db.close().unwrap();
    }
}

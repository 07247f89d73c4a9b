//! The database facade.
//!
//! A [Database] wires the handle, the write queue, the entity registry, and
//! the built-in counter store together.  There is one per database file;
//! entities are constructed against it and everything else flows through
//! them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::Result;
use log::*;

use crate::counters::CounterStore;
use crate::entity::EntityOps;
use crate::io_handle::{IoHandle, Synchronicity};
use crate::write_queue::{WriteOp, WriteQueue};

/// How to open a database.
#[derive(Clone, Debug, derive_builder::Builder)]
pub struct DatabaseConfig {
    path: std::path::PathBuf,

    #[builder(default = "false")]
    read_only: bool,

    /// Busy retry budget: a count of 20ms retry slots on step, 200ms slots
    /// on close.
    #[builder(default = "10")]
    busy_retry_timeout: u32,

    /// Capacity of the connection's prepared-statement cache.
    #[builder(default = "64")]
    statement_cache_capacity: usize,

    /// Durability applied right after opening.
    #[builder(default = "Synchronicity::Normal")]
    synchronicity: Synchronicity,
}

pub struct Database {
    io: Arc<IoHandle>,
    queue: WriteQueue,
    entities: Mutex<HashMap<String, Weak<dyn EntityOps>>>,
    counters: OnceLock<CounterStore>,
    read_only: bool,
    active: AtomicBool,
}

impl Database {
    /// Open (creating if writable and absent) the database at the
    /// configured path.  Writable databases come up with the durability
    /// level applied and an initial transaction open; callers commit-and-
    /// renew at their own cadence, typically via [Database::background_commit].
    pub fn open(config: DatabaseConfig) -> Result<Arc<Database>> {
        let io = Arc::new(IoHandle::open(
            &config.path,
            config.read_only,
            config.busy_retry_timeout,
            config.statement_cache_capacity,
        )?);

        if !config.read_only {
            if !io.set_synchronicity(config.synchronicity) {
                anyhow::bail!("Failed to apply synchronicity at open");
            }
            if !io.begin_transaction(false) {
                anyhow::bail!("Failed to open the initial transaction");
            }
        }

        let database = Arc::new(Database {
            io,
            queue: WriteQueue::new()?,
            entities: Mutex::new(HashMap::new()),
            counters: OnceLock::new(),
            read_only: config.read_only,
            active: AtomicBool::new(true),
        });

        let counters = CounterStore::new(&database)?;
        let _ = database.counters.set(counters);
        Ok(database)
    }

    pub fn get_io_handle(&self) -> &Arc<IoHandle> {
        &self.io
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// The built-in per-table id counters.
    pub fn get_counters(&self) -> &CounterStore {
        self.counters
            .get()
            .expect("Should always exist because open() installs it")
    }

    pub(crate) fn register_entity(&self, entity: Arc<dyn EntityOps>) {
        let mut entities = self.entities.lock().unwrap();
        let name = entity.get_table_name().to_string();
        if let Some(existing) = entities.get(&name) {
            if existing.strong_count() > 0 {
                warn!("Table {} registered twice; replacing", name);
            }
        }
        entities.insert(name, Arc::downgrade(&entity));
    }

    pub(crate) fn enqueue(&self, op: WriteOp) {
        self.queue.enqueue(op);
    }

    /// Commit on the background queue, ordered after every write already
    /// enqueued.
    pub fn background_commit(&self, renew: bool) {
        self.queue.enqueue(WriteOp::Commit {
            handle: self.io.clone(),
            renew,
        });
    }

    /// The drain barrier: returns once every operation enqueued before the
    /// call has completed.  Reads use this for read-your-writes coherency.
    pub fn wait_for_outstanding_operations(&self) {
        self.queue.wait_for_outstanding_operations();
    }

    /// Background operations enqueued and not yet completed.
    pub fn outstanding_operations(&self) -> u64 {
        self.queue.outstanding_operations()
    }

    fn each_entity(&self, f: impl Fn(&dyn EntityOps)) {
        let mut entities = self.entities.lock().unwrap();
        entities.retain(|_, weak| match weak.upgrade() {
            Some(entity) => {
                f(&*entity);
                true
            }
            None => false,
        });
    }

    /// Sweep every registered entity's cache.
    pub fn flush_caches(&self) {
        self.each_entity(|e| e.flush_cache());
    }

    /// Drop every cached model across all registered entities.
    pub fn uncache_all(&self) {
        self.each_entity(|e| e.uncache_all());
    }

    /// Close: drain and stop the background queue, deactivate entities, and
    /// close the handle (which commits the terminal transaction).
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.queue.wait_for_outstanding_operations();
        self.queue.shutdown();
        self.each_entity(|e| e.deactivate());
        self.io.close()
    }
}

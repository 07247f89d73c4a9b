//! The quicksilver crate.
//!
//! A lightweight object-relational layer over a single-file sqlite database.
//! Applications declare tables as entities and rows as models; this crate
//! handles persistence, caching, and the ordering between reads and
//! asynchronous writes.  There are four moving parts:
//!
//! - The [IoHandle], which owns the sqlite connection behind a single mutex
//!   (the database lock) and runs everything that touches the native API.
//! - Statement templates ([Statement]) with the `#?` multi-bind token, which
//!   expands to a run of `?` markers matching a sequence argument at
//!   execution time.
//! - The background write queue: mutations are enqueued and a single worker
//!   runs them in order, while reads first drain the queue so a caller
//!   always observes its own writes.
//! - Entities ([Entity]) with per-table identity-map caches: at most one
//!   live model object per row, per process.
//!
//! We go through the trouble of a single serialized connection because it
//! gives one-writer semantics for free and keeps transactions, VACUUM, and
//! prepared-statement lifetimes from ever straddling each other.  This crate
//! is an ORM for application object graphs, not a bulk loader; WHERE clauses
//! stay raw SQL by design.
mod counters;
mod database;
mod descriptor;
mod entity;
mod io_handle;
mod model;
mod result_set;
mod statement;
mod value;
mod write_queue;

pub use counters::{Counter, CounterStore};
pub use database::{Database, DatabaseConfig, DatabaseConfigBuilder};
pub use descriptor::{
    ColumnDescriptor, ColumnOption, ColumnType, TableDescriptor, TableDescriptorBuilder,
    RESERVED_COLUMNS,
};
pub use entity::{Entity, EntityOps};
pub use io_handle::{IoHandle, Synchronicity};
pub use model::{Model, ModelBase, ModelRef};
pub use result_set::{ResultSet, RowView};
pub use statement::Statement;
pub use value::{now_seconds, SqlValue};

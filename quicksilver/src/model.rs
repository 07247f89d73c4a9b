//! Models: the in-memory representation of one row.
//!
//! A concrete model type implements [Model], which is the per-table
//! decode-row/encode-row pair plus access to the bookkeeping in [ModelBase].
//! Models never persist themselves; everything flows through their entity,
//! which owns them via its identity-map cache.
use anyhow::Result;
use uuid::Uuid;

use crate::descriptor::TableDescriptor;
use crate::result_set::RowView;
use crate::value::{now_seconds, SqlValue};

/// Shared handle to a cached model.  The entity cache guarantees at most one
/// of these chains exists per row within a process, so object identity is
/// row identity.
pub type ModelRef<M> = std::sync::Arc<std::sync::Mutex<M>>;

/// Lifecycle state every model carries.
#[derive(Debug, Clone)]
pub struct ModelBase {
    uuid: Uuid,
    created: f64,
    modified: f64,
    persisted: bool,
    deleted: bool,
    used_recently: bool,
    notify_on_change: bool,
}

impl ModelBase {
    /// A fresh, never-persisted model with a generated identity.
    pub fn new() -> ModelBase {
        let now = now_seconds();
        ModelBase {
            uuid: Uuid::new_v4(),
            created: now,
            modified: now,
            persisted: false,
            deleted: false,
            used_recently: true,
            notify_on_change: false,
        }
    }

    /// A fresh model with a caller-supplied identity.
    pub fn with_uuid(uuid: Uuid) -> ModelBase {
        ModelBase {
            uuid,
            ..ModelBase::new()
        }
    }

    /// Rebuild the base from a row's reserved columns.  Used by
    /// [Model::from_row] implementations; the result is marked persisted.
    pub fn from_row(row: &RowView<'_>) -> Result<ModelBase> {
        let uuid_text = row
            .string_named("uuid")
            .ok_or_else(|| anyhow::anyhow!("Row has no uuid column"))?;
        let uuid = Uuid::parse_str(&uuid_text)?;
        Ok(ModelBase {
            uuid,
            created: row.timestamp_named("created").unwrap_or(0.0),
            modified: row.timestamp_named("modified").unwrap_or(0.0),
            persisted: true,
            deleted: false,
            used_recently: true,
            notify_on_change: false,
        })
    }

    pub fn get_uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn get_created(&self) -> f64 {
        self.created
    }

    pub fn get_modified(&self) -> f64 {
        self.modified
    }

    /// Stamp `modified` with the current time.
    pub fn touch(&mut self) {
        self.modified = now_seconds();
    }

    pub(crate) fn set_modified(&mut self, seconds: f64) {
        self.modified = seconds;
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn set_persisted(&mut self, persisted: bool) {
        self.persisted = persisted;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn was_used_recently(&self) -> bool {
        self.used_recently
    }

    pub(crate) fn set_used_recently(&mut self, used: bool) {
        self.used_recently = used;
    }

    pub fn notifies_on_change(&self) -> bool {
        self.notify_on_change
    }

    pub fn set_notify_on_change(&mut self, notify: bool) {
        self.notify_on_change = notify;
    }

    /// The reserved-column values, in declaration order.  Entities prepend
    /// these to [Model::column_values] when assembling an insert.
    pub(crate) fn reserved_values(&self) -> [SqlValue; 3] {
        [
            SqlValue::Text(self.uuid.to_string()),
            SqlValue::Timestamp(self.created),
            SqlValue::Timestamp(self.modified),
        ]
    }
}

impl Default for ModelBase {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-table encode/decode pair.
///
/// `build_descriptor` describes the table once, at entity construction;
/// `from_row` and `column_values` are the row codecs.  `column_values` must
/// yield the declared (non-reserved) columns in descriptor order; the
/// reserved triplet comes from the base.
pub trait Model: Send + 'static {
    fn build_descriptor() -> Result<TableDescriptor>;

    fn from_row(row: &RowView<'_>) -> Result<Self>
    where
        Self: Sized;

    fn column_values(&self) -> Vec<SqlValue>;

    fn get_base(&self) -> &ModelBase;

    fn get_base_mut(&mut self) -> &mut ModelBase;
}

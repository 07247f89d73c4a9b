//! Entities: one handler per table.
//!
//! An entity is the sole factory for its table's models and the owner of
//! that table's identity-map cache, a `uuid -> model` map guaranteeing at
//! most one live object per row.  Query helpers drain the write queue before
//! touching the database, so a read always observes writes enqueued before
//! it; mutation helpers enqueue onto the background writer and return.
//!
//! The cache sits behind a per-entity mutex, taken by read and write helpers
//! alike.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use itertools::Itertools;
use log::*;
use uuid::Uuid;

use crate::database::Database;
use crate::descriptor::TableDescriptor;
use crate::model::{Model, ModelRef};
use crate::result_set::ResultSet;
use crate::statement::Statement;
use crate::value::SqlValue;
use crate::write_queue::WriteOp;

/// The type-erased face of an entity, for the facade's registry.
pub trait EntityOps: Send + Sync {
    fn get_table_name(&self) -> &str;

    /// Sweep the cache: models not used since the last sweep are evicted.
    fn flush_cache(&self);

    fn uncache_all(&self);

    fn deactivate(&self);
}

pub struct Entity<M: Model> {
    /// Weak so the facade (which owns the counter entity, and transitively
    /// may own others) never forms a strong cycle with us.  Helpers upgrade
    /// per call and report failure once the database is gone.
    database: Weak<Database>,
    descriptor: TableDescriptor,

    /// `INSERT INTO table(cols…) VALUES(?,…)`, covering every column.  A
    /// plain insert: persisting a uuid that already has a row is a
    /// constraint violation, reported like any other failed write.
    insert_statement: Statement,

    /// `SELECT cols… FROM table`, lazy-load columns excluded, uuid first.
    select_sql: String,

    cache: Mutex<HashMap<Uuid, ModelRef<M>>>,
    active: AtomicBool,
}

impl<M: Model> Entity<M> {
    /// Create the entity, its table, and its declared indexes, and register
    /// it with the database.  Call once per table.
    pub fn new(database: &Arc<Database>) -> Result<Arc<Entity<M>>> {
        let descriptor = M::build_descriptor()?;
        let io = database.get_io_handle();

        if !database.is_read_only() {
            // Schema changes invalidate cached statements.
            io.finalise_prepared_statements();
            io.execute_batch(&descriptor.create_table_sql())?;
            for column in descriptor.indexed_columns() {
                if !io.create_index(descriptor.get_name(), &[column], None) {
                    anyhow::bail!(
                        "Failed to create index on {}.{}",
                        descriptor.get_name(),
                        column
                    );
                }
            }
        }

        let all_columns = descriptor.all_columns();
        let insert_statement = Statement::new(format!(
            "INSERT INTO {}({}) VALUES({})",
            descriptor.get_name(),
            all_columns.iter().join(", "),
            all_columns.iter().map(|_| "?").join(", ")
        ));
        let select_sql = format!(
            "SELECT {} FROM {}",
            descriptor.select_columns().iter().join(", "),
            descriptor.get_name()
        );

        let entity = Arc::new(Entity {
            database: Arc::downgrade(database),
            descriptor,
            insert_statement,
            select_sql,
            cache: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
        });
        database.register_entity(entity.clone());
        Ok(entity)
    }

    pub fn get_table_name(&self) -> &str {
        self.descriptor.get_name()
    }

    pub fn get_descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed) && self.database.strong_count() > 0
    }

    pub fn cached_model_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// The database, when this entity can still be used.
    fn get_database(&self) -> Option<Arc<Database>> {
        if !self.active.load(Ordering::Relaxed) {
            return None;
        }
        let database = self.database.upgrade();
        if database.is_none() {
            debug!("{}: database is gone", self.get_table_name());
        }
        database
    }

    fn compose_select(&self, where_clause: Option<&str>) -> String {
        match where_clause {
            Some(w) => format!("{} WHERE {}", self.select_sql, w),
            None => self.select_sql.clone(),
        }
    }

    /// Build models from a cursor of whole rows.  Column 0 is uuid; rows
    /// already cached come back as the cached object, everything else goes
    /// through [Model::from_row] and into the cache.
    fn load_models_from(
        &self,
        result_set: &mut ResultSet<'_>,
        max: Option<usize>,
    ) -> Result<Vec<ModelRef<M>>> {
        let mut out = vec![];
        let mut cache = self.cache.lock().unwrap();

        while max.map(|m| out.len() < m).unwrap_or(true) {
            let Some(row) = result_set.next() else {
                break;
            };
            let uuid_text = row
                .string_at(0)
                .ok_or_else(|| anyhow::anyhow!("{}: row without a uuid", self.get_table_name()))?;
            let uuid = Uuid::parse_str(&uuid_text)?;

            if let Some(cached) = cache.get(&uuid) {
                cached
                    .lock()
                    .unwrap()
                    .get_base_mut()
                    .set_used_recently(true);
                out.push(cached.clone());
                continue;
            }

            let model = M::from_row(&row)?;
            let model = Arc::new(Mutex::new(model));
            cache.insert(uuid, model.clone());
            out.push(model);
        }

        Ok(out)
    }

    /// Identity lookup.  Cache first; a miss loads the row and caches it.
    pub fn model_with(&self, uuid: &Uuid) -> Option<ModelRef<M>> {
        if let Some(cached) = self.cache.lock().unwrap().get(uuid) {
            cached
                .lock()
                .unwrap()
                .get_base_mut()
                .set_used_recently(true);
            return Some(cached.clone());
        }
        self.any_model(Some("uuid = ?"), &[uuid.into()])
    }

    /// Identity lookups in bulk; one query loads all the misses.
    pub fn models_with(&self, uuids: &[Uuid]) -> Vec<ModelRef<M>> {
        let mut out = vec![];
        let mut missing: Vec<SqlValue> = vec![];
        {
            let cache = self.cache.lock().unwrap();
            for uuid in uuids {
                if let Some(cached) = cache.get(uuid) {
                    cached
                        .lock()
                        .unwrap()
                        .get_base_mut()
                        .set_used_recently(true);
                    out.push(cached.clone());
                } else {
                    missing.push(uuid.into());
                }
            }
        }

        if !missing.is_empty() {
            out.extend(self.models(Some("uuid IN (#?)"), &[SqlValue::List(missing)]));
        }
        out
    }

    /// All models matching the optional WHERE fragment.  Empty on failure.
    pub fn models(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Vec<ModelRef<M>> {
        let Some(database) = self.get_database() else {
            return vec![];
        };
        database.wait_for_outstanding_operations();
        let stmt = Statement::new(self.compose_select(where_clause));
        database
            .get_io_handle()
            .with_cursor(&stmt, args, |rs| self.load_models_from(rs, None))
            .unwrap_or_else(|e| {
                debug!("{}: models query failed: {:#}", self.get_table_name(), e);
                vec![]
            })
    }

    /// The first model matching the WHERE fragment, if any.
    pub fn any_model(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Option<ModelRef<M>> {
        let Some(database) = self.get_database() else {
            return None;
        };
        database.wait_for_outstanding_operations();
        let stmt = Statement::new(self.compose_select(where_clause));
        database
            .get_io_handle()
            .with_cursor(&stmt, args, |rs| {
                Ok(self.load_models_from(rs, Some(1))?.into_iter().next())
            })
            .unwrap_or_else(|e| {
                debug!("{}: any_model query failed: {:#}", self.get_table_name(), e);
                None
            })
    }

    /// Distinct uuids matching the WHERE fragment.
    ///
    /// Two legacy paths are preserved from the original accessors: TEXT
    /// values are taken directly, numeric values go through their decimal
    /// rendering before uuid parsing.  Anything unparseable is skipped.
    pub fn model_uuids(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Vec<Uuid> {
        let Some(database) = self.get_database() else {
            return vec![];
        };
        database.wait_for_outstanding_operations();
        let sql = match where_clause {
            Some(w) => format!(
                "SELECT DISTINCT uuid FROM {} WHERE {}",
                self.get_table_name(),
                w
            ),
            None => format!("SELECT DISTINCT uuid FROM {}", self.get_table_name()),
        };
        let stmt = Statement::new(sql);
        database
            .get_io_handle()
            .with_cursor(&stmt, args, |rs| {
                let mut out = vec![];
                while let Some(row) = rs.next() {
                    let text = match row.value_at(0) {
                        Some(SqlValue::Text(t)) => t,
                        Some(SqlValue::Integer(i)) => i.to_string(),
                        Some(SqlValue::Real(f)) => f.to_string(),
                        _ => continue,
                    };
                    match Uuid::parse_str(&text) {
                        Ok(uuid) => out.push(uuid),
                        Err(_) => {
                            debug!("{}: skipping non-uuid {:?}", self.get_table_name(), text)
                        }
                    }
                }
                Ok(out)
            })
            .unwrap_or_else(|e| {
                debug!("{}: model_uuids failed: {:#}", self.get_table_name(), e);
                vec![]
            })
    }

    pub fn count_of_models(&self, where_clause: Option<&str>, args: &[SqlValue]) -> i64 {
        let Some(database) = self.get_database() else {
            return 0;
        };
        database.wait_for_outstanding_operations();
        let sql = match where_clause {
            Some(w) => format!("SELECT COUNT(*) FROM {} WHERE {}", self.get_table_name(), w),
            None => format!("SELECT COUNT(*) FROM {}", self.get_table_name()),
        };
        database.get_io_handle().int64_for(&sql, args).unwrap_or(0)
    }

    pub fn model_exists(&self, where_clause: Option<&str>, args: &[SqlValue]) -> bool {
        let Some(database) = self.get_database() else {
            return false;
        };
        database.wait_for_outstanding_operations();
        let sql = match where_clause {
            Some(w) => format!(
                "SELECT rowid FROM {} WHERE {} LIMIT 1",
                self.get_table_name(),
                w
            ),
            None => format!("SELECT rowid FROM {} LIMIT 1", self.get_table_name()),
        };
        database.get_io_handle().int64_for(&sql, args).is_some()
    }

    /// Distinct values of one column.  Empty on failure or unknown column.
    pub fn select_distinct(
        &self,
        column: &str,
        where_clause: Option<&str>,
        args: &[SqlValue],
    ) -> Vec<SqlValue> {
        let Some(database) = self.get_database() else {
            return vec![];
        };
        let Some(column) = self.descriptor.get_column(column) else {
            warn!("{}: no column {:?}", self.get_table_name(), column);
            return vec![];
        };
        database.wait_for_outstanding_operations();
        let sql = match where_clause {
            Some(w) => format!(
                "SELECT DISTINCT {} FROM {} WHERE {}",
                column.get_name(),
                self.get_table_name(),
                w
            ),
            None => format!(
                "SELECT DISTINCT {} FROM {}",
                column.get_name(),
                self.get_table_name()
            ),
        };
        let stmt = Statement::new(sql);
        database
            .get_io_handle()
            .with_cursor(&stmt, args, |rs| {
                let mut out = vec![];
                while let Some(row) = rs.next() {
                    if let Some(v) = row.value_at(0) {
                        out.push(v);
                    }
                }
                Ok(out)
            })
            .unwrap_or_else(|e| {
                debug!("{}: select_distinct failed: {:#}", self.get_table_name(), e);
                vec![]
            })
    }

    /// Persist a model: cache it and enqueue the row insert.  Persisting a
    /// uuid that already has a row fails on the background writer as a
    /// constraint violation; rewrites of existing rows go through
    /// [Entity::write] and [Entity::update_column].
    pub fn persist(&self, model: &ModelRef<M>) -> bool {
        let Some(database) = self.get_database() else {
            return false;
        };

        let (uuid, args) = {
            let mut guard = model.lock().unwrap();
            if guard.get_base().is_deleted() {
                warn!(
                    "{}: refusing to persist a deleted model",
                    self.get_table_name()
                );
                return false;
            }
            guard.get_base_mut().set_persisted(true);
            guard.get_base_mut().set_used_recently(true);

            let mut args: Vec<SqlValue> = guard.get_base().reserved_values().into();
            args.extend(guard.column_values());
            (*guard.get_base().get_uuid(), args)
        };

        self.cache.lock().unwrap().insert(uuid, model.clone());
        database.enqueue(WriteOp::Sql {
            handle: database.get_io_handle().clone(),
            statement: self.insert_statement.clone(),
            args,
        });
        true
    }

    /// Set one column across every row matching the WHERE fragment.
    pub fn update_column(
        &self,
        column: &str,
        value: SqlValue,
        where_clause: Option<&str>,
        args: &[SqlValue],
    ) -> bool {
        let Some(database) = self.get_database() else {
            return false;
        };
        let Some(column) = self.descriptor.get_column(column) else {
            warn!("{}: no column {:?}", self.get_table_name(), column);
            return false;
        };

        let sql = match where_clause {
            Some(w) => format!(
                "UPDATE {} SET {} = ? WHERE {}",
                self.get_table_name(),
                column.get_name(),
                w
            ),
            None => format!(
                "UPDATE {} SET {} = ?",
                self.get_table_name(),
                column.get_name()
            ),
        };
        let mut all_args = vec![value];
        all_args.extend_from_slice(args);
        database.enqueue(WriteOp::Sql {
            handle: database.get_io_handle().clone(),
            statement: Statement::new(sql),
            args: all_args,
        });
        true
    }

    /// Write one column of one row, optionally touching `modified`.
    pub fn write(&self, value: SqlValue, column: &str, uuid: &Uuid, modified: Option<f64>) -> bool {
        let Some(database) = self.get_database() else {
            return false;
        };
        let Some(column) = self.descriptor.get_column(column) else {
            warn!("{}: no column {:?}", self.get_table_name(), column);
            return false;
        };

        let (sql, args) = match modified {
            Some(seconds) => (
                format!(
                    "UPDATE {} SET {} = ?, modified = ? WHERE uuid = ?",
                    self.get_table_name(),
                    column.get_name()
                ),
                vec![value, SqlValue::Timestamp(seconds), uuid.into()],
            ),
            None => (
                format!(
                    "UPDATE {} SET {} = ? WHERE uuid = ?",
                    self.get_table_name(),
                    column.get_name()
                ),
                vec![value, uuid.into()],
            ),
        };

        if let Some(seconds) = modified {
            if let Some(cached) = self.cache.lock().unwrap().get(uuid) {
                cached.lock().unwrap().get_base_mut().set_modified(seconds);
            }
        }

        database.enqueue(WriteOp::Sql {
            handle: database.get_io_handle().clone(),
            statement: Statement::new(sql),
            args,
        });
        true
    }

    /// Delete one model: mark it, uncache it, and enqueue the row delete.
    pub fn delete_model(&self, model: &ModelRef<M>) -> bool {
        let Some(database) = self.get_database() else {
            return false;
        };
        let uuid = {
            let mut guard = model.lock().unwrap();
            guard.get_base_mut().set_deleted();
            *guard.get_base().get_uuid()
        };
        self.cache.lock().unwrap().remove(&uuid);
        database.enqueue(WriteOp::Sql {
            handle: database.get_io_handle().clone(),
            statement: Statement::new(format!(
                "DELETE FROM {} WHERE uuid = ?",
                self.get_table_name()
            )),
            args: vec![(&uuid).into()],
        });
        true
    }

    /// Delete by uuid set, one multi-bind statement for the lot.
    pub fn delete_models_with_uuids(&self, uuids: &[Uuid]) -> bool {
        let Some(database) = self.get_database() else {
            return false;
        };
        if uuids.is_empty() {
            return true;
        }

        {
            let mut cache = self.cache.lock().unwrap();
            for uuid in uuids {
                if let Some(model) = cache.remove(uuid) {
                    model.lock().unwrap().get_base_mut().set_deleted();
                }
            }
        }

        database.enqueue(WriteOp::Sql {
            handle: database.get_io_handle().clone(),
            statement: Statement::new(format!(
                "DELETE FROM {} WHERE uuid IN (#?)",
                self.get_table_name()
            )),
            args: vec![SqlValue::List(uuids.iter().map(|u| u.into()).collect())],
        });
        true
    }

    /// Delete everything matching the WHERE fragment.  Resolves the uuids
    /// first so cached models get marked and evicted.
    pub fn delete_models_where(&self, where_clause: Option<&str>, args: &[SqlValue]) -> bool {
        let uuids = self.model_uuids(where_clause, args);
        if uuids.is_empty() {
            return true;
        }
        self.delete_models_with_uuids(&uuids)
    }

    /// Clock-style cache sweep: models used since the last sweep survive
    /// with their flag cleared, the rest are evicted.  Models that were
    /// never persisted are left alone; evicting them would lose data.
    pub fn flush(&self) {
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|_, model| {
            let mut guard = model.lock().unwrap();
            if guard.get_base().was_used_recently() {
                guard.get_base_mut().set_used_recently(false);
                true
            } else {
                !guard.get_base().is_persisted()
            }
        });
    }

    pub fn uncache_model(&self, model: &ModelRef<M>) {
        let uuid = *model.lock().unwrap().get_base().get_uuid();
        self.cache.lock().unwrap().remove(&uuid);
    }

    pub fn uncache_models(&self, models: &[ModelRef<M>]) {
        let mut cache = self.cache.lock().unwrap();
        for model in models {
            let uuid = *model.lock().unwrap().get_base().get_uuid();
            cache.remove(&uuid);
        }
    }

    pub fn uncache_all(&self) {
        self.cache.lock().unwrap().clear();
    }
}

impl<M: Model> EntityOps for Entity<M> {
    fn get_table_name(&self) -> &str {
        Entity::get_table_name(self)
    }

    fn flush_cache(&self) {
        self.flush();
    }

    fn uncache_all(&self) {
        Entity::uncache_all(self);
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

//! The built-in counter entity.
//!
//! Every database carries a `counters` table handing out monotonically
//! increasing 64-bit ids per logical table name.  First use of a name
//! creates its row; creation is serialized so two simultaneous first-uses
//! can't produce two rows.
use std::sync::{Arc, Mutex};

use anyhow::Result;
use uuid::Uuid;

use crate::database::Database;
use crate::descriptor::{ColumnOption, ColumnType, TableDescriptor, TableDescriptorBuilder};
use crate::entity::Entity;
use crate::model::{Model, ModelBase, ModelRef};
use crate::result_set::RowView;
use crate::value::{now_seconds, SqlValue};

/// One row of the `counters` table.
pub struct Counter {
    base: ModelBase,
    table_name: String,
    counter: i64,
}

impl Counter {
    /// A fresh counter row for a table.  The stored value is the next id to
    /// hand out.
    fn new(table_name: &str) -> Counter {
        Counter {
            base: ModelBase::new(),
            table_name: table_name.to_string(),
            counter: 1,
        }
    }

    pub fn get_table(&self) -> &str {
        &self.table_name
    }

    pub fn get_counter(&self) -> i64 {
        self.counter
    }

    fn advance_to(&mut self, value: i64) {
        self.counter = value;
        self.base.touch();
    }

    fn set_table_name(&mut self, table_name: &str) {
        self.table_name = table_name.to_string();
        self.base.touch();
    }
}

impl Model for Counter {
    fn build_descriptor() -> Result<TableDescriptor> {
        let mut builder = TableDescriptorBuilder::new("counters");
        builder.add_column("tablename", ColumnType::Varchar, ColumnOption::CreateIndex)?;
        builder.add_column("counter", ColumnType::Integer, ColumnOption::None)?;
        builder.build()
    }

    fn from_row(row: &RowView<'_>) -> Result<Counter> {
        Ok(Counter {
            base: ModelBase::from_row(row)?,
            table_name: row
                .string_named("tablename")
                .ok_or_else(|| anyhow::anyhow!("counters: row without a tablename"))?,
            counter: row.int64_named("counter").unwrap_or(0),
        })
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.table_name.clone()),
            SqlValue::Integer(self.counter),
        ]
    }

    fn get_base(&self) -> &ModelBase {
        &self.base
    }

    fn get_base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }
}

/// The counter store every database provides at construction.
pub struct CounterStore {
    entity: Arc<Entity<Counter>>,

    /// Serializes id handout and, in particular, row creation on first use.
    serial: Mutex<()>,
}

impl CounterStore {
    pub(crate) fn new(database: &Arc<Database>) -> Result<CounterStore> {
        Ok(CounterStore {
            entity: Entity::new(database)?,
            serial: Mutex::new(()),
        })
    }

    /// The underlying entity, mostly for queries across all counters.
    pub fn get_entity(&self) -> &Arc<Entity<Counter>> {
        &self.entity
    }

    fn model_for(&self, table: &str) -> Option<ModelRef<Counter>> {
        self.entity.any_model(Some("tablename = ?"), &[table.into()])
    }

    /// Hand out the next id for a table: returns the stored counter and
    /// advances it.  First use creates the row (counter = 1) and returns 1.
    pub fn next_model_id(&self, table: &str) -> Result<i64> {
        let _serial = self.serial.lock().unwrap();

        if let Some(model) = self.model_for(table) {
            let (uuid, current) = {
                let mut guard = model.lock().unwrap();
                let current = guard.get_counter();
                guard.advance_to(current + 1);
                (*guard.get_base().get_uuid(), current)
            };
            if !self
                .entity
                .write((current + 1).into(), "counter", &uuid, Some(now_seconds()))
            {
                anyhow::bail!("Failed to advance counter for {}", table);
            }
            return Ok(current);
        }

        // First use: the fresh row is persisted at 1, handed out, and
        // advanced.
        let model = Arc::new(Mutex::new(Counter::new(table)));
        if !self.entity.persist(&model) {
            anyhow::bail!("Failed to create counter row for {}", table);
        }
        let uuid = {
            let mut guard = model.lock().unwrap();
            guard.advance_to(2);
            *guard.get_base().get_uuid()
        };
        if !self
            .entity
            .write(2i64.into(), "counter", &uuid, Some(now_seconds()))
        {
            anyhow::bail!("Failed to advance counter for {}", table);
        }
        Ok(1)
    }

    /// Persist a new next-id for a table, creating the row if needed.
    pub fn set_next_model_id(&self, value: i64, table: &str) -> Result<()> {
        let _serial = self.serial.lock().unwrap();

        if let Some(model) = self.model_for(table) {
            let uuid = {
                let mut guard = model.lock().unwrap();
                guard.advance_to(value);
                *guard.get_base().get_uuid()
            };
            if !self
                .entity
                .write(value.into(), "counter", &uuid, Some(now_seconds()))
            {
                anyhow::bail!("Failed to set counter for {}", table);
            }
            return Ok(());
        }

        let model = Arc::new(Mutex::new(Counter::new(table)));
        model.lock().unwrap().advance_to(value);
        if !self.entity.persist(&model) {
            anyhow::bail!("Failed to create counter row for {}", table);
        }
        Ok(())
    }

    /// Re-point a counter row at a different logical table.  Updates the
    /// `tablename` column.
    pub fn set_table(&self, model: &ModelRef<Counter>, table: &str) -> bool {
        let uuid: Uuid = {
            let mut guard = model.lock().unwrap();
            guard.set_table_name(table);
            *guard.get_base().get_uuid()
        };
        self.entity
            .write(table.into(), "tablename", &uuid, Some(now_seconds()))
    }
}

//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;

use quicksilver::{
    ColumnOption, ColumnType, Database, DatabaseConfigBuilder, Model, ModelBase, SqlValue,
    TableDescriptor, TableDescriptorBuilder,
};

/// Open a fresh database in a temp dir.  Keep the [tempfile::TempDir] alive
/// for as long as the database is.
pub fn open_temp_database() -> (tempfile::TempDir, Arc<Database>) {
    quicksilver_logging::log_to_stderr();

    let tdir = tempfile::TempDir::new().expect("Should create a temp dir");
    let config = DatabaseConfigBuilder::default()
        .path(tdir.path().join("test.db"))
        .build()
        .expect("Config should build");
    let database = Database::open(config).expect("Database should open");
    (tdir, database)
}

/// The demonstration schema: a job posting with a salary band and a lazily
/// loaded blob of notes.
pub struct Job {
    base: ModelBase,
    pub title: String,
    pub min_salary: i64,
    pub max_salary: i64,
    pub notes: Vec<u8>,
}

impl Job {
    pub fn new(title: &str, min_salary: i64, max_salary: i64) -> Job {
        Job {
            base: ModelBase::new(),
            title: title.to_string(),
            min_salary,
            max_salary,
            notes: vec![],
        }
    }
}

impl Model for Job {
    fn build_descriptor() -> Result<TableDescriptor> {
        let mut builder = TableDescriptorBuilder::new("jobs");
        builder.add_column("title", ColumnType::Varchar, ColumnOption::None)?;
        builder.add_column("min_salary", ColumnType::Integer, ColumnOption::CreateIndex)?;
        builder.add_column("max_salary", ColumnType::Integer, ColumnOption::None)?;
        builder.add_column("notes", ColumnType::Blob, ColumnOption::LazyLoad)?;
        builder.build()
    }

    fn from_row(row: &quicksilver::RowView<'_>) -> Result<Job> {
        Ok(Job {
            base: ModelBase::from_row(row)?,
            title: row
                .string_named("title")
                .ok_or_else(|| anyhow::anyhow!("jobs: row without a title"))?,
            min_salary: row.int64_named("min_salary").unwrap_or(0),
            max_salary: row.int64_named("max_salary").unwrap_or(0),
            // Lazy; only present when explicitly selected.
            notes: row.blob_named("notes").unwrap_or_default(),
        })
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.title.clone()),
            SqlValue::Integer(self.min_salary),
            SqlValue::Integer(self.max_salary),
            SqlValue::Blob(self.notes.clone()),
        ]
    }

    fn get_base(&self) -> &ModelBase {
        &self.base
    }

    fn get_base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }
}

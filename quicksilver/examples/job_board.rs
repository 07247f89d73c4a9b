//! A small end-to-end tour: open a database, declare an entity, persist and
//! query models, and hand out per-table ids.
//!
//! Run with `cargo run --example job_board`.
use std::sync::{Arc, Mutex};

use anyhow::Result;

use quicksilver::{
    ColumnOption, ColumnType, Database, DatabaseConfigBuilder, Entity, Model, ModelBase, SqlValue,
    TableDescriptor, TableDescriptorBuilder,
};

struct Job {
    base: ModelBase,
    title: String,
    min_salary: i64,
    max_salary: i64,
}

impl Job {
    fn new(title: &str, min_salary: i64, max_salary: i64) -> Job {
        Job {
            base: ModelBase::new(),
            title: title.to_string(),
            min_salary,
            max_salary,
        }
    }
}

impl Model for Job {
    fn build_descriptor() -> Result<TableDescriptor> {
        let mut builder = TableDescriptorBuilder::new("jobs");
        builder.add_column("title", ColumnType::Varchar, ColumnOption::None)?;
        builder.add_column("min_salary", ColumnType::Integer, ColumnOption::CreateIndex)?;
        builder.add_column("max_salary", ColumnType::Integer, ColumnOption::None)?;
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
        })
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.title.clone()),
            SqlValue::Integer(self.min_salary),
            SqlValue::Integer(self.max_salary),
        ]
    }

    fn get_base(&self) -> &ModelBase {
        &self.base
    }

    fn get_base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }
}

fn main() -> Result<()> {
    quicksilver_logging::log_to_stderr();

    let tdir = tempfile::TempDir::new()?;
    let config = DatabaseConfigBuilder::default()
        .path(tdir.path().join("job_board.db"))
        .build()?;
    let database = Database::open(config)?;
    let jobs = Entity::<Job>::new(&database)?;

    // Writes go to the background queue; the queries below drain it first,
    // so they see everything persisted here.
    for (title, min, max) in [
        ("managing director", 100000, 1000000),
        ("archivist", 40000, 60000),
        ("night auditor", 35000, 45000),
    ] {
        let job = Arc::new(Mutex::new(Job::new(title, min, max)));
        jobs.persist(&job);
    }

    println!("{} postings on the board", jobs.count_of_models(None, &[]));
    for job in jobs.models(Some("min_salary >= ?"), &[40000i64.into()]) {
        let job = job.lock().unwrap();
        println!(
            "  {} ({}..{})",
            job.title, job.min_salary, job.max_salary
        );
    }

    // Per-table ids from the built-in counters.
    for _ in 0..3 {
        println!(
            "next posting number: {}",
            database.get_counters().next_model_id("jobs")?
        );
    }

    database.background_commit(true);
    database.close()?;
    Ok(())
}

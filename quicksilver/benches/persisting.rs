use std::sync::{Arc, Mutex};

use anyhow::Result;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use quicksilver::{
    ColumnOption, ColumnType, Database, DatabaseConfigBuilder, Entity, Model, ModelBase, SqlValue,
    TableDescriptor, TableDescriptorBuilder,
};

struct BenchRow {
    base: ModelBase,
    name: String,
    score: i64,
}

impl Model for BenchRow {
    fn build_descriptor() -> Result<TableDescriptor> {
        let mut builder = TableDescriptorBuilder::new("bench_rows");
        builder.add_column("name", ColumnType::Varchar, ColumnOption::None)?;
        builder.add_column("score", ColumnType::Integer, ColumnOption::None)?;
        builder.build()
    }

    fn from_row(row: &quicksilver::RowView<'_>) -> Result<BenchRow> {
        Ok(BenchRow {
            base: ModelBase::from_row(row)?,
            name: row.string_named("name").unwrap_or_default(),
            score: row.int64_named("score").unwrap_or(0),
        })
    }

    fn column_values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.name.clone()),
            SqlValue::Integer(self.score),
        ]
    }

    fn get_base(&self) -> &ModelBase {
        &self.base
    }

    fn get_base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }
}

fn open_database(path: &std::path::Path) -> Arc<Database> {
    let config = DatabaseConfigBuilder::default()
        .path(path.join("bench.db"))
        .build()
        .unwrap();
    Database::open(config).unwrap()
}

pub fn benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("persisting");
    for size in [5, 10, 20, 50, 100, 500, 5000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, size| {
            let tdir = tempfile::TempDir::new().expect("Should create");
            let database = open_database(tdir.path());
            let rows = Entity::<BenchRow>::new(&database).unwrap();

            b.iter(|| {
                for i in 0..*size {
                    let row = Arc::new(Mutex::new(BenchRow {
                        base: ModelBase::new(),
                        name: format!("row{}", i),
                        score: i as i64,
                    }));
                    assert!(rows.persist(&row));
                }
                database.wait_for_outstanding_operations();
                rows.uncache_all();
                assert!(rows.delete_models_where(None, &[]));
            });

            database.close().unwrap();
        });
    }
    group.finish();
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);

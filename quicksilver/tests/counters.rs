//! The built-in counter entity, exercised end to end.
mod utils;

use utils::open_temp_database;

/// Five successive ids for one table come out 1..=5, and only one counter
/// row ever exists for it.
#[test]
fn ids_increment_per_table() {
    let (_tdir, database) = open_temp_database();
    let counters = database.get_counters();

    for expected in 1..=5i64 {
        assert_eq!(counters.next_model_id("test_table").unwrap(), expected);
    }

    let entity = counters.get_entity();
    assert_eq!(
        entity.count_of_models(Some("tablename = ?"), &["test_table".into()]),
        1
    );
    database.close().unwrap();
}

/// Counters for different tables are independent, and a set value is what
/// the next handout returns.
#[test]
fn tables_are_independent() {
    let (_tdir, database) = open_temp_database();
    let counters = database.get_counters();

    assert_eq!(counters.next_model_id("table1").unwrap(), 1);
    counters.set_next_model_id(2, "table2").unwrap();
    assert_eq!(counters.next_model_id("table2").unwrap(), 2);

    let models = counters.get_entity().models(Some("uuid != ''"), &[]);
    assert_eq!(models.len(), 2);
    database.close().unwrap();
}

/// Counter state survives a close and reopen.
#[test]
fn ids_survive_reopen() {
    let tdir = tempfile::TempDir::new().unwrap();
    let path = tdir.path().join("test.db");

    {
        let config = quicksilver::DatabaseConfigBuilder::default()
            .path(path.clone())
            .build()
            .unwrap();
        let database = quicksilver::Database::open(config).unwrap();
        assert_eq!(database.get_counters().next_model_id("jobs").unwrap(), 1);
        assert_eq!(database.get_counters().next_model_id("jobs").unwrap(), 2);
        database.close().unwrap();
    }

    let config = quicksilver::DatabaseConfigBuilder::default()
        .path(path)
        .build()
        .unwrap();
    let database = quicksilver::Database::open(config).unwrap();
    assert_eq!(database.get_counters().next_model_id("jobs").unwrap(), 3);
    database.close().unwrap();
}

/// Two threads racing the first use of a name still produce exactly one
/// row; the handed-out ids are distinct.
#[test]
fn first_use_is_serialized() {
    let (_tdir, database) = open_temp_database();

    let mut threads = vec![];
    for _ in 0..2 {
        let database = database.clone();
        threads.push(std::thread::spawn(move || {
            database.get_counters().next_model_id("shared").unwrap()
        }));
    }
    let mut ids: Vec<i64> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);

    let counters = database.get_counters();
    assert_eq!(
        counters
            .get_entity()
            .count_of_models(Some("tablename = ?"), &["shared".into()]),
        1
    );
    database.close().unwrap();
}

/// set_table moves a counter row to a new logical name; the old name then
/// starts from scratch.
#[test]
fn set_table_updates_the_table_name() {
    let (_tdir, database) = open_temp_database();
    let counters = database.get_counters();

    assert_eq!(counters.next_model_id("old_name").unwrap(), 1);
    let model = counters
        .get_entity()
        .any_model(Some("tablename = ?"), &["old_name".into()])
        .expect("Counter row should exist");

    assert!(counters.set_table(&model, "new_name"));
    assert_eq!(counters.next_model_id("new_name").unwrap(), 2);
    assert_eq!(counters.next_model_id("old_name").unwrap(), 1);
    database.close().unwrap();
}

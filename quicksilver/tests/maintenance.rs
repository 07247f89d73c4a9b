//! Lifecycle and maintenance behavior of the whole stack.
mod utils;

use std::sync::Arc;

use quicksilver::{DatabaseConfigBuilder, Entity, Synchronicity};

use utils::{open_temp_database, Job};

/// After close, nothing is outstanding, nothing is active, and close is
/// idempotent.
#[test]
fn close_leaves_nothing_behind() {
    let (_tdir, database) = open_temp_database();
    let jobs = Entity::<Job>::new(&database).unwrap();

    for i in 0..20i64 {
        let job = Arc::new(std::sync::Mutex::new(Job::new(&format!("r{}", i), i, i)));
        assert!(jobs.persist(&job));
    }

    database.close().unwrap();
    assert!(!database.is_active());
    assert_eq!(database.outstanding_operations(), 0);
    assert!(!database.get_io_handle().is_active());

    // Entities are deactivated; helpers report rather than panic.
    assert!(jobs.models(None, &[]).is_empty());
    assert!(!jobs.persist(&Arc::new(std::sync::Mutex::new(Job::new("late", 0, 0)))));

    // Second close is a no-op.
    database.close().unwrap();
}

/// Everything persisted before close is on disk afterwards.
#[test]
fn close_drains_pending_writes() {
    let tdir = tempfile::TempDir::new().unwrap();
    let path = tdir.path().join("test.db");

    {
        let config = DatabaseConfigBuilder::default()
            .path(path.clone())
            .build()
            .unwrap();
        let database = quicksilver::Database::open(config).unwrap();
        let jobs = Entity::<Job>::new(&database).unwrap();
        for i in 0..50i64 {
            let job = Arc::new(std::sync::Mutex::new(Job::new(&format!("r{}", i), i, i)));
            assert!(jobs.persist(&job));
        }
        // No drain here: close must do it.
        database.close().unwrap();
    }

    let config = DatabaseConfigBuilder::default().path(path).build().unwrap();
    let database = quicksilver::Database::open(config).unwrap();
    let jobs = Entity::<Job>::new(&database).unwrap();
    assert_eq!(jobs.count_of_models(None, &[]), 50);
    database.close().unwrap();
}

/// A background commit is ordered after the writes enqueued before it and
/// renews the open transaction.
#[test]
fn background_commit_renews() {
    let (_tdir, database) = open_temp_database();
    let jobs = Entity::<Job>::new(&database).unwrap();
    let io = database.get_io_handle();

    for i in 0..5i64 {
        let job = Arc::new(std::sync::Mutex::new(Job::new(&format!("r{}", i), i, i)));
        assert!(jobs.persist(&job));
    }
    database.background_commit(true);
    database.wait_for_outstanding_operations();

    assert!(io.in_transaction());
    assert_eq!(io.get_uncommitted_updates(), 0);
    database.close().unwrap();
}

/// Maintenance runs against a stack with live entities and cached
/// statements, and reads keep working afterwards.
#[test]
fn vacuum_and_analyse_with_live_entities() {
    let (_tdir, database) = open_temp_database();
    let jobs = Entity::<Job>::new(&database).unwrap();

    for i in 0..10i64 {
        let job = Arc::new(std::sync::Mutex::new(Job::new(&format!("r{}", i), i, i)));
        assert!(jobs.persist(&job));
    }
    database.wait_for_outstanding_operations();

    let io = database.get_io_handle();
    assert!(io.vacuum());
    assert!(io.analyse());
    assert!(!io.in_transaction());

    // The handle dropped out of its transaction; reads still work, and a
    // fresh transaction can be opened.
    assert_eq!(jobs.count_of_models(None, &[]), 10);
    assert!(io.begin_transaction(false));
    database.close().unwrap();
}

/// The durability level can change while the stack is running, including
/// mid-transaction.
#[test]
fn synchronicity_is_dynamic() {
    let (_tdir, database) = open_temp_database();
    let io = database.get_io_handle();

    assert_eq!(io.get_synchronicity(), Some(Synchronicity::Normal));
    assert!(io.in_transaction());
    assert!(io.set_synchronicity(Synchronicity::Extra));
    assert!(io.in_transaction());
    assert_eq!(io.int64_for("PRAGMA synchronous", &[]), Some(3));
    assert!(io.set_synchronicity(Synchronicity::Off));
    assert_eq!(io.int64_for("PRAGMA synchronous", &[]), Some(0));
    database.close().unwrap();
}

#[test]
fn locking_mode_is_settable() {
    let (_tdir, database) = open_temp_database();
    let io = database.get_io_handle();

    assert!(io.set_locking_mode(true));
    assert_eq!(
        io.string_for("PRAGMA locking_mode", &[]).as_deref(),
        Some("exclusive")
    );
    assert!(io.set_locking_mode(false));
    assert_eq!(
        io.string_for("PRAGMA locking_mode", &[]).as_deref(),
        Some("normal")
    );
    database.close().unwrap();
}

/// Table creation is IF NOT EXISTS all the way down: a second entity over
/// the same table neither errors nor clobbers rows.
#[test]
fn entity_construction_is_idempotent() {
    let (_tdir, database) = open_temp_database();
    let jobs = Entity::<Job>::new(&database).unwrap();
    let job = Arc::new(std::sync::Mutex::new(Job::new("keeper", 1, 2)));
    assert!(jobs.persist(&job));

    let again = Entity::<Job>::new(&database).unwrap();
    assert_eq!(again.count_of_models(None, &[]), 1);
    database.close().unwrap();
}

/// Entity construction creates declared indexes; both the automatic name
/// and idempotence hold through the public surface.
#[test]
fn declared_indexes_exist() {
    let (_tdir, database) = open_temp_database();
    let _jobs = Entity::<Job>::new(&database).unwrap();

    let io = database.get_io_handle();
    assert_eq!(
        io.string_for(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?",
            &["idx_jobs_min_salary".into()],
        )
        .as_deref(),
        Some("idx_jobs_min_salary")
    );

    // Creating it again, directly, is a no-op that reports success.
    assert!(io.create_index("jobs", &["min_salary"], None));
    assert!(io.create_index("jobs", &["min_salary", "max_salary"], Some("salary_band")));
    assert!(io.create_index("jobs", &["min_salary", "max_salary"], Some("salary_band")));
    database.close().unwrap();
}

/// A read-only handle can query an existing database but refuses writes.
#[test]
fn read_only_reopen() {
    let tdir = tempfile::TempDir::new().unwrap();
    let path = tdir.path().join("test.db");

    {
        let config = DatabaseConfigBuilder::default()
            .path(path.clone())
            .build()
            .unwrap();
        let database = quicksilver::Database::open(config).unwrap();
        let jobs = Entity::<Job>::new(&database).unwrap();
        let job = Arc::new(std::sync::Mutex::new(Job::new("keeper", 1, 2)));
        assert!(jobs.persist(&job));
        database.close().unwrap();
    }

    let config = DatabaseConfigBuilder::default()
        .path(path)
        .read_only(true)
        .build()
        .unwrap();
    let database = quicksilver::Database::open(config).unwrap();
    let jobs = Entity::<Job>::new(&database).unwrap();

    assert_eq!(jobs.count_of_models(None, &[]), 1);

    // The write enqueues, the worker reports the failure, and the error
    // counter records it.
    let before = database.get_io_handle().get_error_count();
    let job = Arc::new(std::sync::Mutex::new(Job::new("rejected", 0, 0)));
    assert!(jobs.persist(&job));
    database.wait_for_outstanding_operations();
    assert!(database.get_io_handle().get_error_count() > before);
    assert_eq!(jobs.count_of_models(None, &[]), 1);
    database.close().unwrap();
}

//! Concurrent clients on one repository
//!
//! Separate `Datastore` handles stand in for separate processes; they share
//! nothing but the repository directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use schema_scheduler::{ApplyOutcome, ConnectOptions, Datastore, SchedulerConfig};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[test]
fn test_simultaneous_connects_apply_once() {
    let dir = TempDir::new().unwrap();
    let config = SchedulerConfig::for_repository(dir.path().join("repo"));

    {
        let ds = Datastore::open(config.clone()).unwrap();
        let conn = ds.connect(ConnectOptions::default()).unwrap();
        conn.install_module(fixture("feature-deps2.yang"), &[], &["featx"]).unwrap();
    }

    let clients = 4;
    let connected = Arc::new(Barrier::new(clients));
    let handles: Vec<_> = (0..clients)
        .map(|_| {
            let config = config.clone();
            let connected = Arc::clone(&connected);
            thread::spawn(move || {
                let ds = Datastore::open(config).unwrap();
                let conn = ds.connect(ConnectOptions::default()).unwrap();
                // hold every connection open until all have connected
                connected.wait();
                let outcome = conn.apply_outcome().cloned();
                conn.disconnect().unwrap();
                outcome
            })
        })
        .collect();

    let outcomes: Vec<Option<ApplyOutcome>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    let runs: Vec<&ApplyOutcome> = outcomes.iter().flatten().collect();
    assert_eq!(runs, vec![&ApplyOutcome::Success { applied: 1 }]);

    let ds = Datastore::open(config).unwrap();
    assert_eq!(ds.connection_count().unwrap(), 0);
    assert_eq!(ds.modules().unwrap().len(), 1);
    assert!(ds.scheduled_changes().unwrap().is_empty());
}

#[test]
fn test_concurrent_submissions_get_distinct_sequence_numbers() {
    let dir = TempDir::new().unwrap();
    let config = SchedulerConfig::for_repository(dir.path().join("repo"));
    let modules_dir = dir.path().join("modules");
    std::fs::create_dir_all(&modules_dir).unwrap();

    let clients = 6;
    let start = Arc::new(Barrier::new(clients));
    let handles: Vec<_> = (0..clients)
        .map(|i| {
            let config = config.clone();
            let start = Arc::clone(&start);
            let path = modules_dir.join(format!("m{i}.yang"));
            std::fs::write(&path, format!("module m{i} {{ prefix m{i}; feature f; }}")).unwrap();
            thread::spawn(move || {
                let ds = Datastore::open(config).unwrap();
                let conn = ds.connect(ConnectOptions::default()).unwrap();
                start.wait();
                let seq = conn.install_module(&path, &[], &[]).unwrap();
                conn.disconnect().unwrap();
                seq
            })
        })
        .collect();

    let mut seqs: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=clients as u64).collect::<Vec<_>>());

    let ds = Datastore::open(config).unwrap();
    let pending = ds.scheduled_changes().unwrap();
    assert_eq!(pending.iter().map(|c| c.seq).collect::<Vec<_>>(), seqs);

    let conn = ds.connect(ConnectOptions::err_on_scheduled_fail()).unwrap();
    assert_eq!(conn.apply_outcome().map(ApplyOutcome::applied), Some(clients));
    assert_eq!(ds.modules().unwrap().len(), clients);
}

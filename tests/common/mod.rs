#![allow(dead_code)]

use duratask::blob_store::{BlobStore, InMemoryBlobStore};
use duratask::providers::in_memory::InMemoryProvider;
use duratask::providers::sqlite::SqliteProvider;
use duratask::providers::Provider;
use duratask::range_files;
use duratask::{ActivityRegistry, BackoffStrategy, Event, OrchestrationRegistry, RetryPolicy, Runtime, RuntimeOptions};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Options tuned for tests: tight polling, short locks, near-instant retries.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep_ms: 2,
        orchestrator_lock_timeout: Duration::from_secs(2),
        worker_lock_timeout: Duration::from_secs(2),
        activity_retry: RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(5),
        }),
        ..RuntimeOptions::default()
    }
}

pub fn create_in_memory_store() -> StdArc<dyn Provider> {
    StdArc::new(InMemoryProvider::new()) as StdArc<dyn Provider>
}

pub async fn create_sqlite_store_disk() -> (StdArc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = open_sqlite_at(&td).await;
    (store, td)
}

/// Open (or reopen) the database inside `td`.
pub async fn open_sqlite_at(td: &TempDir) -> StdArc<dyn Provider> {
    let db_url = format!("sqlite:{}", td.path().join("test.db").display());
    StdArc::new(SqliteProvider::new(&db_url).await.unwrap()) as StdArc<dyn Provider>
}

/// Runtime with only the range-file sample registered.
pub async fn start_range_runtime(store: StdArc<dyn Provider>, blobs: StdArc<dyn BlobStore>) -> StdArc<Runtime> {
    let activities = range_files::register_activities(ActivityRegistry::builder(), blobs).build();
    let orchestrations = range_files::register_orchestrations(OrchestrationRegistry::builder()).build();
    Runtime::start_with_options(store, activities, orchestrations, fast_options())
        .await
        .unwrap()
}

pub fn in_memory_blobs() -> StdArc<InMemoryBlobStore> {
    StdArc::new(InMemoryBlobStore::new())
}

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await {
            if predicate(&hist) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scheduled activity `(id, name, input)` triples in history order.
pub fn scheduled_activities(hist: &[Event]) -> Vec<(u64, String, String)> {
    hist.iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, name, input } => Some((*id, name.clone(), input.clone())),
            _ => None,
        })
        .collect()
}

//! Dispatchers in separate processes sharing one SQLite job store

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use labdash_dispatch::{DispatchConfig, Dispatcher, JobStore, JobTask, SqliteJobStore};
use labdash_shared::{now_ms, JobOutput, JobStatus, ResetOutcome};

const TTL: Duration = Duration::from_secs(60);
const TIMEOUT: Duration = Duration::from_secs(5);

fn config(lease: Duration) -> DispatchConfig {
    DispatchConfig {
        workers: 2,
        queue_capacity: 8,
        poll_interval: Duration::from_millis(10),
        lease,
    }
}

/// A fresh handle on `path`, as a second labdash process would open it
async fn dispatcher(path: &Path, lease: Duration) -> (Arc<SqliteJobStore>, Dispatcher) {
    let store = Arc::new(SqliteJobStore::open(path).await.unwrap());
    let dispatcher = Dispatcher::new(store.clone(), config(lease));
    (store, dispatcher)
}

fn reset_task(calls: &Arc<AtomicUsize>, delay: Duration) -> JobTask {
    let calls = calls.clone();
    JobTask::new(move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(JobOutput::Reset(ResetOutcome::completed("dev2", "reloaded")))
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resets_run_once_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let (_, a) = dispatcher(&path, Duration::from_secs(30)).await;
    let (_, b) = dispatcher(&path, Duration::from_secs(30)).await;
    let (a, b) = (Arc::new(a), Arc::new(b));

    for round in 0..5 {
        let id = format!("dev{}_reset", round);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let (a, id, task) = (a.clone(), id.clone(), reset_task(&calls, Duration::from_millis(50)));
            tokio::spawn(async move { a.run_to_completion(&id, task, TIMEOUT, TTL).await })
        };
        let second = {
            let (b, id, task) = (b.clone(), id.clone(), reset_task(&calls, Duration::from_millis(50)));
            tokio::spawn(async move { b.run_to_completion(&id, task, TIMEOUT, TTL).await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.status(), JobStatus::Finished);
        assert_eq!(second.status(), JobStatus::Finished);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{} ran twice", id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_startup_recovery_spares_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let lease = Duration::from_millis(300);
    let (_, a) = dispatcher(&path, lease).await;
    let calls = Arc::new(AtomicUsize::new(0));

    a.enqueue("dev2_reset", reset_task(&calls, Duration::from_millis(600)), TIMEOUT, TTL)
        .await
        .unwrap();

    // Past the first lease; only renewal keeps the job alive
    tokio::time::sleep(Duration::from_millis(400)).await;
    let late = SqliteJobStore::open(&path).await.unwrap();
    assert!(late.recover_abandoned(now_ms()).await.unwrap().is_empty());

    let done = a
        .run_to_completion("dev2_reset", reset_task(&calls, Duration::ZERO), TIMEOUT, TTL)
        .await
        .unwrap();
    assert_eq!(done.status(), JobStatus::Finished);
    assert!(matches!(done.output(), Some(JobOutput::Reset(r)) if r.reset));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_job_of_dead_process_is_recovered_and_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let (store, a) = dispatcher(&path, Duration::from_millis(100)).await;
        a.enqueue("ise_reset", reset_task(&calls, Duration::from_secs(5)), TIMEOUT, TTL)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store.get("ise_reset").await.unwrap().unwrap().status(),
            JobStatus::Running
        );
        // Process exits: workers and lease renewal stop with it
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let (store, b) = dispatcher(&path, Duration::from_secs(30)).await;
    assert_eq!(
        store.recover_abandoned(now_ms()).await.unwrap(),
        vec!["ise_reset".to_string()]
    );

    // The abandoned failure is cached like any other result
    let cached = b
        .run_to_completion("ise_reset", reset_task(&calls, Duration::ZERO), TIMEOUT, TTL)
        .await
        .unwrap();
    assert_eq!(cached.status(), JobStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

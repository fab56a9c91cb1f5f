//! Job façade and lifecycle registry behaviour.

mod common;

use common::{fast_settings, wait_for_journal, wait_until};
use expensio::config::QueueSettings;
use expensio::error::Error;
use expensio::jobs::backoff::BackoffPolicy;
use expensio::jobs::handler::handler_fn;
use expensio::jobs::registry::{LifecycleRegistry, WorkerHandle};
use expensio::jobs::{JobFactory, JobOptions};
use expensio::model::TaskResult;
use expensio::queue::memory::MemoryBackend;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ok_handler() -> expensio::jobs::handler::SharedHandler {
    handler_fn(|_| async { TaskResult::success("ok") })
}

fn slow_retry_settings(base: Duration) -> QueueSettings {
    QueueSettings {
        max_retries: 3,
        backoff: BackoffPolicy::new(base, base),
        ..QueueSettings::default()
    }
}

#[tokio::test]
async fn factory_rejects_non_positive_settings() {
    let backend = Arc::new(MemoryBackend::new());

    let zero_retries = QueueSettings {
        max_retries: 0,
        ..QueueSettings::default()
    };
    assert!(matches!(
        JobFactory::new(backend.clone(), zero_retries),
        Err(Error::Config(_))
    ));

    let zero_prefetch = QueueSettings {
        prefetch: 0,
        ..QueueSettings::default()
    };
    assert!(matches!(
        JobFactory::new(backend.clone(), zero_prefetch),
        Err(Error::Config(_))
    ));

    let zero_poll = QueueSettings {
        poll_interval: Duration::ZERO,
        ..QueueSettings::default()
    };
    assert!(matches!(
        JobFactory::new(backend, zero_poll),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn start_is_idempotent() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend, fast_settings(3)).unwrap();
    let job = factory.create_job(JobOptions::new("twice").handler(ok_handler()));

    job.start().await.unwrap();
    job.start().await.unwrap();

    assert!(job.is_running().await);
    assert_eq!(factory.running_workers().await, vec!["twice".to_string()]);
    factory.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_launch_one_worker() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend, fast_settings(3)).unwrap();
    let job = factory.create_job(JobOptions::new("racy").handler(ok_handler()));
    let same_name = factory.create_job(JobOptions::new("racy").handler(ok_handler()));

    let (a, b) = tokio::join!(job.start(), same_name.start());
    a.unwrap();
    b.unwrap();

    assert_eq!(factory.running_workers().await, vec!["racy".to_string()]);
    factory.close().await.unwrap();
}

#[tokio::test]
async fn registry_start_with_launches_once_under_contention() {
    let registry = Arc::new(LifecycleRegistry::new());
    let launches = Arc::new(AtomicU32::new(0));

    let start = |registry: Arc<LifecycleRegistry>, launches: Arc<AtomicU32>| async move {
        registry
            .start_with("q", || async {
                launches.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let token = CancellationToken::new();
                let t = token.clone();
                let task = tokio::spawn(async move { t.cancelled().await });
                Ok(WorkerHandle { token, task })
            })
            .await
    };

    let (a, b) = tokio::join!(
        start(Arc::clone(&registry), Arc::clone(&launches)),
        start(Arc::clone(&registry), Arc::clone(&launches)),
    );
    let launched = [a.unwrap(), b.unwrap()];

    assert_eq!(launched.iter().filter(|l| **l).count(), 1);
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert!(registry.is_running("q").await);

    assert!(registry.stop("q").await);
    assert!(!registry.is_running("q").await);
    assert!(!registry.stop("q").await);
}

#[tokio::test]
async fn registry_launch_error_registers_nothing() {
    let registry = LifecycleRegistry::new();
    let result = registry
        .start_with("broken", || async {
            Err(Error::QueueUnavailable("broken".to_string()))
        })
        .await;

    assert!(matches!(result, Err(Error::QueueUnavailable(_))));
    assert!(registry.running().await.is_empty());
}

#[tokio::test]
async fn stop_then_start_leaves_exactly_one_worker() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let job = factory.create_job(JobOptions::new("restart").handler(ok_handler()));

    job.start().await.unwrap();
    job.stop().await;
    assert!(!job.is_running().await);
    job.start().await.unwrap();

    assert!(job.is_running().await);
    assert_eq!(factory.running_workers().await.len(), 1);

    // The restarted worker still consumes.
    job.schedule(&json!({"after": "restart"})).await.unwrap();
    wait_for_journal(&backend, "restart", |j| j.acked.len() == 1).await;

    factory.close().await.unwrap();
}

#[tokio::test]
async fn stop_racing_start_never_runs_two_workers() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let done = Arc::new(AtomicU32::new(0));
    let (a, p, d) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&done));
    let job = factory.create_job(JobOptions::new("q").handler(handler_fn(move |_| {
        let (a, p, d) = (Arc::clone(&a), Arc::clone(&p), Arc::clone(&d));
        async move {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            a.fetch_sub(1, Ordering::SeqCst);
            d.fetch_add(1, Ordering::SeqCst);
            TaskResult::success("ok")
        }
    })));

    job.start().await.unwrap();
    job.schedule(&json!({"n": 1})).await.unwrap();
    wait_until("handler in flight", || active.load(Ordering::SeqCst) == 1).await;

    let stopping = {
        let job = job.clone();
        tokio::spawn(async move { job.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    job.start().await.unwrap();
    job.schedule(&json!({"n": 2})).await.unwrap();
    stopping.await.unwrap();

    wait_until("both deliveries", || done.load(Ordering::SeqCst) == 2).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(factory.running_workers().await, vec!["q".to_string()]);

    factory.close().await.unwrap();
}

#[tokio::test]
async fn slow_start_on_one_queue_does_not_block_another() {
    let registry = Arc::new(LifecycleRegistry::new());
    let slow = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry
                .start_with("slow", || async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let token = CancellationToken::new();
                    let t = token.clone();
                    let task = tokio::spawn(async move { t.cancelled().await });
                    Ok(WorkerHandle { token, task })
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let quick = Duration::from_millis(100);
    assert!(!tokio::time::timeout(quick, registry.is_running("other")).await.unwrap());
    assert!(!tokio::time::timeout(quick, registry.stop("other")).await.unwrap());

    assert!(slow.await.unwrap().unwrap());
    assert!(registry.is_running("slow").await);
    registry.stop_all().await;
    assert!(registry.running().await.is_empty());
}

#[tokio::test]
async fn producer_only_job_never_runs() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let job = factory.create_job(JobOptions::new("outbox"));

    assert!(!job.has_handler());
    job.start().await.unwrap();
    assert!(!job.is_running().await);
    assert!(factory.running_workers().await.is_empty());

    job.schedule(&json!({"text": "hi"})).await.unwrap();
    let journal = backend.journal("outbox").await;
    assert_eq!(journal.published.len(), 1);
    assert_eq!(journal.published[0].attempts, 0);
    assert_eq!(journal.published[0].max_retries, 3);

    factory.close().await.unwrap();
}

#[tokio::test]
async fn schedule_surfaces_publish_rejection() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend.clone(), fast_settings(3)).unwrap();
    let job = factory.create_job(JobOptions::new("rejected"));

    backend.reject_publishes(true);
    let result = job.schedule(&json!({})).await;
    assert!(matches!(result, Err(Error::PublishRejected { .. })));
    assert!(backend.journal("rejected").await.published.is_empty());

    backend.reject_publishes(false);
    job.schedule(&json!({})).await.unwrap();
    assert_eq!(backend.journal("rejected").await.published.len(), 1);
}

#[tokio::test]
async fn invalid_per_job_poll_override_fails_start() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = JobFactory::new(backend, fast_settings(3)).unwrap();
    let job = factory.create_job(
        JobOptions::new("bad_override")
            .handler(ok_handler())
            .visibility_timeout(Duration::from_millis(500)),
    );

    assert!(matches!(job.start().await, Err(Error::Config(_))));
    assert!(!job.is_running().await);
}

#[tokio::test]
async fn pending_retries_survive_stop() {
    let backend = Arc::new(MemoryBackend::new());
    let factory =
        JobFactory::new(backend.clone(), slow_retry_settings(Duration::from_millis(300))).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let job = factory.create_job(JobOptions::new("stopped").handler(handler_fn(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        async { TaskResult::error("boom") }
    })));

    job.start().await.unwrap();
    job.schedule(&json!({})).await.unwrap();
    wait_for_journal(&backend, "stopped", |j| j.acked.len() == 1).await;

    job.stop().await;
    assert_eq!(factory.pending_retries(), 1);

    // The timer still re-publishes although no worker is running.
    let journal = wait_for_journal(&backend, "stopped", |j| j.published.len() == 2).await;
    assert_eq!(journal.published[1].attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Restarting picks the retried copy up.
    job.start().await.unwrap();
    wait_until("second delivery", || calls.load(Ordering::SeqCst) == 2).await;

    factory.close().await.unwrap();
}

#[tokio::test]
async fn close_cancels_pending_retries_and_refuses_further_work() {
    let backend = Arc::new(MemoryBackend::new());
    let factory =
        JobFactory::new(backend.clone(), slow_retry_settings(Duration::from_millis(200))).unwrap();
    let job = factory.create_job(
        JobOptions::new("closing")
            .handler(handler_fn(|_| async { TaskResult::error("boom") })),
    );

    job.start().await.unwrap();
    job.schedule(&json!({})).await.unwrap();
    wait_for_journal(&backend, "closing", |j| j.acked.len() == 1).await;

    factory.close().await.unwrap();
    assert!(factory.is_closed());
    assert_eq!(factory.pending_retries(), 0);
    assert!(factory.running_workers().await.is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(backend.journal("closing").await.published.len(), 1);

    assert!(matches!(job.schedule(&json!({})).await, Err(Error::Closed)));
    assert!(matches!(job.start().await, Err(Error::Closed)));

    // Closing twice is fine.
    factory.close().await.unwrap();
}

//! Shared helpers for the memory-backend scenario tests.

#![allow(dead_code)]

use expensio::config::QueueSettings;
use expensio::jobs::backoff::BackoffPolicy;
use expensio::queue::memory::{MemoryBackend, QueueJournal};
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

/// Settings with a short backoff so retry scenarios finish quickly.
pub fn fast_settings(max_retries: u32) -> QueueSettings {
    QueueSettings {
        max_retries,
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        ..QueueSettings::default()
    }
}

/// Poll the journal for `queue` until `done` accepts it.
pub async fn wait_for_journal(
    backend: &MemoryBackend,
    queue: &str,
    done: impl Fn(&QueueJournal) -> bool,
) -> QueueJournal {
    let started = Instant::now();
    loop {
        let journal = backend.journal(queue).await;
        if done(&journal) {
            return journal;
        }
        assert!(
            started.elapsed() < DEADLINE,
            "timed out waiting on journal for {queue}: {journal:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll a synchronous condition until it holds.
pub async fn wait_until(what: &str, done: impl Fn() -> bool) {
    let started = Instant::now();
    while !done() {
        assert!(started.elapsed() < DEADLINE, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

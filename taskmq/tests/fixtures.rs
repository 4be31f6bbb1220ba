#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskmq::redis_broker::{with_delay_suffix, with_detail_suffix};
use taskmq::{Config, Result, Signature, TaskProcessor};

pub const REDIS_URL: &str = "redis://127.0.0.1:6379/";

pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmq=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub fn test_config(queue: &str) -> Config {
    Config::new(REDIS_URL, queue)
}

/// Drop all three keys a queue uses, before and after each test.
pub async fn cleanup_queue(conn: &mut taskmq::redis::aio::ConnectionManager, queue: &str) {
    let _ = taskmq::redis::cmd("DEL")
        .arg(queue)
        .arg(with_delay_suffix(queue))
        .arg(with_detail_suffix(queue))
        .query_async::<()>(conn)
        .await;
}

/// Records every signature it processes.
pub struct RecordingProcessor {
    pub seen: Arc<Mutex<Vec<Signature>>>,
}

impl RecordingProcessor {
    pub fn new() -> (Self, Arc<Mutex<Vec<Signature>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (Self { seen: seen.clone() }, seen)
    }
}

impl TaskProcessor for RecordingProcessor {
    async fn process(&self, signature: &Signature) -> Result<()> {
        self.seen.lock().unwrap().push(signature.clone());
        Ok(())
    }
}

/// Sleeps per task and tracks how many handlers run at once.
pub struct SleepyProcessor {
    pub sleep: Duration,
    pub current: Arc<AtomicUsize>,
    pub max_seen: Arc<AtomicUsize>,
    pub processed: Arc<AtomicUsize>,
}

impl SleepyProcessor {
    pub fn new(sleep: Duration) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let max_seen = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sleep,
                current: Arc::new(AtomicUsize::new(0)),
                max_seen: max_seen.clone(),
                processed: processed.clone(),
            },
            max_seen,
            processed,
        )
    }
}

impl TaskProcessor for SleepyProcessor {
    async fn process(&self, _signature: &Signature) -> Result<()> {
        let in_flight = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(in_flight, Ordering::SeqCst);

        tokio::time::sleep(self.sleep).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls until `check` returns true or the timeout elapses; true on success.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

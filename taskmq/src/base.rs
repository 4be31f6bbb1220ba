use std::collections::HashSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

const RETRY_BASE_DELAY_MS: u64 = 1_000;
const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Shared broker state: the registered task-name set, the consuming stop
/// channel, and the reconnect retry policy. Concrete brokers embed one.
#[derive(Clone)]
pub struct BrokerBase {
    inner: Arc<BaseInner>,
}

struct BaseInner {
    registered_names: RwLock<HashSet<String>>,
    stop: watch::Sender<bool>,
    retry_stop: watch::Sender<bool>,
    retry: AtomicBool,
    retry_attempts: AtomicU32,
    consuming: AtomicBool,
}

impl BrokerBase {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (retry_stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(BaseInner {
                registered_names: RwLock::new(HashSet::new()),
                stop,
                retry_stop,
                retry: AtomicBool::new(true),
                retry_attempts: AtomicU32::new(0),
                consuming: AtomicBool::new(false),
            }),
        }
    }

    /// Registered task names are written once before consuming starts and
    /// read-only afterwards.
    pub fn set_registered_task_names(&self, names: &[String]) {
        let mut registered = self
            .inner
            .registered_names
            .write()
            .unwrap_or_else(|e| e.into_inner());
        registered.clear();
        registered.extend(names.iter().cloned());
    }

    pub fn is_task_registered(&self, name: &str) -> bool {
        self.inner
            .registered_names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Marks the start of a consume session and re-arms the stop channel.
    pub fn begin_consuming(&self) {
        self.inner.consuming.store(true, Ordering::SeqCst);
        self.inner.stop.send_replace(false);
    }

    pub fn end_consuming(&self) {
        self.inner.consuming.store(false, Ordering::SeqCst);
    }

    pub fn is_consuming(&self) -> bool {
        self.inner.consuming.load(Ordering::SeqCst)
    }

    /// Stops the dispatch loop and aborts any in-progress reconnect backoff.
    /// Also clears the retry flag so callers of `start_consuming` stop
    /// re-entering.
    pub fn signal_stop(&self) {
        self.inner.retry.store(false, Ordering::SeqCst);
        self.inner.stop.send_replace(true);
        self.inner.retry_stop.send_replace(true);
    }

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.inner.stop.subscribe()
    }

    pub fn retry(&self) -> bool {
        self.inner.retry.load(Ordering::SeqCst)
    }

    pub fn reset_retry_attempts(&self) {
        self.inner.retry_attempts.store(0, Ordering::SeqCst);
    }

    /// Exponential reconnect backoff. Sleeps for the attempt-scaled delay,
    /// returning early if the retry stop channel fires.
    pub async fn retry_backoff(&self) {
        let attempt = self.inner.retry_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = Self::backoff_delay(attempt);
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "broker connection retry backoff");

        let mut retry_stop = self.inner.retry_stop.subscribe();
        if *retry_stop.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = retry_stop.changed() => {}
        }
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let exp = attempt.min(6);
        let delay_ms = (RETRY_BASE_DELAY_MS << exp).min(RETRY_MAX_DELAY_MS);
        Duration::from_millis(delay_ms)
    }
}

impl Default for BrokerBase {
    fn default() -> Self {
        Self::new()
    }
}

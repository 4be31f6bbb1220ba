use std::sync::{Arc, RwLock};

use crate::base::BrokerBase;
use crate::error::{BrokerError, Result};
use crate::signature::Signature;
use crate::{Broker, TaskProcessor};

/// In-process broker for tests: `publish` pushes the signature through the
/// wire codec and synchronously invokes the assigned processor. Redis-only
/// operations are not implemented.
pub struct EagerBroker<P> {
    base: BrokerBase,
    worker: RwLock<Option<Arc<P>>>,
}

impl<P: TaskProcessor> EagerBroker<P> {
    pub fn new() -> Self {
        Self {
            base: BrokerBase::new(),
            worker: RwLock::new(None),
        }
    }

    pub fn assign_worker(&self, processor: P) {
        let mut worker = self.worker.write().unwrap_or_else(|e| e.into_inner());
        *worker = Some(Arc::new(processor));
    }

    fn worker(&self) -> Result<Arc<P>> {
        self.worker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                BrokerError::InvalidArgument("no worker is assigned in eager mode".to_string())
            })
    }
}

impl<P: TaskProcessor> Default for EagerBroker<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TaskProcessor + 'static> Broker for EagerBroker<P> {
    fn set_registered_task_names(&self, names: &[String]) {
        self.base.set_registered_task_names(names);
    }

    fn is_task_registered(&self, name: &str) -> bool {
        self.base.is_task_registered(name)
    }

    async fn start_consuming<Proc: TaskProcessor + 'static>(
        &self,
        _consumer_tag: &str,
        _concurrency: usize,
        _processor: Proc,
    ) -> (bool, Result<()>) {
        (true, Ok(()))
    }

    async fn stop_consuming(&self) {}

    async fn publish(&self, signature: &mut Signature) -> Result<()> {
        let worker = self.worker()?;

        // round-trip through the codec, exactly like the real publish path
        let payload = signature.encode()?;
        let decoded = Signature::decode(&payload)?;

        worker.process(&decoded).await
    }

    async fn get_pending_tasks(&self, _start: i64, _end: i64) -> Result<Vec<Signature>> {
        Err(BrokerError::NotImplemented("get_pending_tasks"))
    }

    async fn get_delayed_tasks(&self, _start: i64, _end: i64) -> Result<Vec<Signature>> {
        Ok(Vec::new())
    }

    async fn count_pending_tasks(&self) -> Result<u64> {
        Ok(0)
    }

    async fn count_delayed_tasks(&self) -> Result<u64> {
        Ok(0)
    }

    async fn cancel_delay_task(&self, _uuid: &str) -> Result<()> {
        Err(BrokerError::NotImplemented("cancel_delay_task"))
    }

    async fn transfer_delay_task(
        &self,
        _from: &str,
        _to: &str,
        _start: i64,
        _end: i64,
    ) -> Result<()> {
        Ok(())
    }

    async fn transfer_task(&self, _from: &str, _to: &str, _start: i64, _end: i64) -> Result<()> {
        Ok(())
    }
}

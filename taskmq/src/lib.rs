//! Redis-backed asynchronous task queue broker: publishes task signatures,
//! multiplexes immediate and delayed queues into one delivery stream, and
//! drives a bounded worker pool.

pub mod base;
pub mod config;
pub mod connector;
pub mod eager;
pub mod error;
pub mod hooks;
pub mod redis_broker;
pub mod signature;

pub use config::Config;
pub use eager::EagerBroker;
pub use error::{BrokerError, Result};
pub use hooks::{TaskEvent, TaskEventHook, register_task_event_hook};
pub use redis_broker::RedisBroker;
pub use signature::{Arg, Signature};

pub use redis;

/// Processes one delivered task. This will usually be a worker instance
/// holding a name → handler registry; the broker only knows names.
pub trait TaskProcessor: Send + Sync {
    fn process(&self, signature: &Signature) -> impl Future<Output = Result<()>> + Send;
}

/// Common surface of all brokers.
pub trait Broker: Send + Sync {
    fn set_registered_task_names(&self, names: &[String]);
    fn is_task_registered(&self, name: &str) -> bool;

    /// Consumes until a fatal error or [`stop_consuming`](Broker::stop_consuming).
    /// The returned flag tells the caller whether re-entering under the
    /// reconnect policy makes sense.
    fn start_consuming<P: TaskProcessor + 'static>(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: P,
    ) -> impl Future<Output = (bool, Result<()>)> + Send;

    fn stop_consuming(&self) -> impl Future<Output = ()> + Send;

    fn publish(&self, signature: &mut Signature) -> impl Future<Output = Result<()>> + Send;

    fn get_pending_tasks(
        &self,
        start: i64,
        end: i64,
    ) -> impl Future<Output = Result<Vec<Signature>>> + Send;
    fn get_delayed_tasks(
        &self,
        start: i64,
        end: i64,
    ) -> impl Future<Output = Result<Vec<Signature>>> + Send;
    fn count_pending_tasks(&self) -> impl Future<Output = Result<u64>> + Send;
    fn count_delayed_tasks(&self) -> impl Future<Output = Result<u64>> + Send;

    fn cancel_delay_task(&self, uuid: &str) -> impl Future<Output = Result<()>> + Send;
    fn transfer_delay_task(
        &self,
        from: &str,
        to: &str,
        start: i64,
        end: i64,
    ) -> impl Future<Output = Result<()>> + Send;
    fn transfer_task(
        &self,
        from: &str,
        to: &str,
        start: i64,
        end: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}

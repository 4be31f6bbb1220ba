use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::TaskProcessor;
use crate::base::BrokerBase;
use crate::config::Config;
use crate::connector::RedisConnector;
use crate::error::{BrokerError, Result};
use crate::hooks::{self, TaskEvent};
use crate::signature::Signature;

const BLPOP_TIMEOUT_SECS: u64 = 1;
// Space out delayed-queue scans so redis is not bombarded with relentless
// ZRANGEBYSCOREs.
const DELAYED_SCAN_INTERVAL: Duration = Duration::from_millis(20);
const TRANSFER_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Sorted-set key holding the UUIDs of scheduled tasks, scored by ETA.
pub fn with_delay_suffix(queue: &str) -> String {
    format!("{queue}_delayed")
}

/// Hash key mapping scheduled task UUIDs to their serialized payloads.
pub fn with_detail_suffix(queue: &str) -> String {
    format!("{queue}_detail")
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn coerce_list_range(start: i64, end: i64) -> (i64, i64) {
    if start < 0 || end < start { (0, 10) } else { (start, end) }
}

fn validate_transfer_range(start: i64, end: i64) -> Result<(i64, i64)> {
    if start == 0 && end == 0 {
        Ok((0, -1))
    } else if start < 0 || end <= start {
        Err(BrokerError::InvalidArgument(format!(
            "invalid transfer range [{start}, {end}]"
        )))
    } else {
        Ok((start, end))
    }
}

struct ConsumerHandles {
    stop_receiving: watch::Sender<bool>,
    stop_delayed: watch::Sender<bool>,
    receiving: JoinHandle<()>,
    delayed: JoinHandle<()>,
}

/// The Redis broker. For the configured queue `Q` it drives three keys:
/// the ready list `Q`, the scheduled zset `Q_delayed`, and the payload hash
/// `Q_detail`.
pub struct RedisBroker {
    base: BrokerBase,
    config: Config,
    connector: RedisConnector,
    consumer: Mutex<Option<ConsumerHandles>>,
    session_done: watch::Sender<bool>,
}

impl RedisBroker {
    pub fn new(config: Config) -> Result<Self> {
        let connector = RedisConnector::new(&config)?;
        let (session_done, _) = watch::channel(true);
        Ok(Self {
            base: BrokerBase::new(),
            config,
            connector,
            consumer: Mutex::new(None),
            session_done,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_registered_task_names(&self, names: &[String]) {
        self.base.set_registered_task_names(names);
    }

    pub fn is_task_registered(&self, name: &str) -> bool {
        self.base.is_task_registered(name)
    }

    /// Shared connection handle, mainly useful to tests and tooling.
    pub async fn conn(&self) -> Result<ConnectionManager> {
        self.connector.conn().await
    }

    /// Places a new message on the queue: `eta` in the future goes to the
    /// delayed structures, everything else to the ready list.
    pub async fn publish(&self, signature: &mut Signature) -> Result<()> {
        let payload = signature.encode()?;
        signature.adjust_routing_key(&self.config.default_queue);

        let mut conn = self.connector.conn().await?;

        if let Some(eta) = signature.eta.filter(|eta| *eta > Utc::now()) {
            if signature.uuid.is_empty() {
                return Err(BrokerError::InvalidArgument(
                    "a delayed task needs a UUID".to_string(),
                ));
            }
            let score = eta.timestamp_nanos_opt().ok_or_else(|| {
                BrokerError::InvalidArgument("ETA is out of representable range".to_string())
            })?;

            // detail hash and delayed zset move together or not at all
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("HSET")
                .arg(with_detail_suffix(&self.config.default_queue))
                .arg(&signature.uuid)
                .arg(payload.as_slice())
                .ignore()
                .cmd("ZADD")
                .arg(with_delay_suffix(&self.config.default_queue))
                .arg(score)
                .arg(&signature.uuid)
                .ignore();
            pipe.query_async::<()>(&mut conn).await?;

            tracing::debug!(uuid = %signature.uuid, name = %signature.name, eta = %eta, "published delayed task");
        } else {
            redis::cmd("RPUSH")
                .arg(&signature.routing_key)
                .arg(payload.as_slice())
                .query_async::<()>(&mut conn)
                .await?;

            tracing::debug!(uuid = %signature.uuid, name = %signature.name, queue = %signature.routing_key, "published task");
        }

        hooks::fire(&self.config.default_queue, TaskEvent::Publish, signature);
        Ok(())
    }

    /// Enters the consume loop until a fatal error or `stop_consuming`.
    /// Returns `(retry, result)`: `retry` is false once `stop_consuming` has
    /// been requested, so callers know not to re-enter.
    pub async fn start_consuming<P>(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: P,
    ) -> (bool, Result<()>)
    where
        P: TaskProcessor + 'static,
    {
        self.base.begin_consuming();
        self.session_done.send_replace(false);

        let result = self.run_consumer(consumer_tag, concurrency, processor).await;

        self.base.end_consuming();
        self.session_done.send_replace(true);
        (self.base.retry(), result)
    }

    async fn run_consumer<P>(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: P,
    ) -> Result<()>
    where
        P: TaskProcessor + 'static,
    {
        let manager = match self.connector.conn().await {
            Ok(manager) => manager,
            Err(e) => {
                self.base.retry_backoff().await;
                return Err(e);
            }
        };
        if let Err(e) = self.connector.ping().await {
            self.base.retry_backoff().await;
            return Err(e);
        }
        self.base.reset_retry_attempts();

        let queue = self.config.default_queue.clone();
        tracing::info!(consumer_tag = %consumer_tag, queue = %queue, "waiting for messages");

        // Unbuffered-style delivery channel: a send blocks until the
        // dispatcher takes the payload, which is the backpressure mechanism.
        let (deliveries_tx, deliveries_rx) = mpsc::channel::<Vec<u8>>(1);
        let (stop_receiving_tx, stop_receiving_rx) = watch::channel(false);
        let (stop_delayed_tx, stop_delayed_rx) = watch::channel(false);

        let receiving = tokio::spawn(receiving_loop(
            self.connector.clone(),
            queue.clone(),
            deliveries_tx.clone(),
            stop_receiving_rx,
        ));
        let delayed = tokio::spawn(delayed_loop(
            self.connector.clone(),
            queue.clone(),
            deliveries_tx,
            stop_delayed_rx,
        ));

        {
            let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
            *consumer = Some(ConsumerHandles {
                stop_receiving: stop_receiving_tx,
                stop_delayed: stop_delayed_tx,
                receiving,
                delayed,
            });
        }

        let ctx = ConsumeContext {
            base: self.base.clone(),
            manager,
            queue,
            processor: Arc::new(processor),
        };
        self.consume(deliveries_rx, concurrency, ctx).await
    }

    /// Dispatches deliveries onto the worker pool until stopped or a fatal
    /// error comes back from a worker.
    async fn consume<P>(
        &self,
        mut deliveries: mpsc::Receiver<Vec<u8>>,
        concurrency: usize,
        ctx: ConsumeContext<P>,
    ) -> Result<()>
    where
        P: TaskProcessor + 'static,
    {
        let semaphore = (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency)));
        let (errors_tx, mut errors_rx) =
            mpsc::channel::<BrokerError>(std::cmp::max(1, concurrency * 2));
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut stop_rx = self.base.stop_rx();

        let result = loop {
            if *stop_rx.borrow_and_update() {
                break Ok(());
            }
            tokio::select! {
                Some(err) = errors_rx.recv() => break Err(err),
                delivery = deliveries.recv() => {
                    let Some(payload) = delivery else { break Ok(()) };
                    // a bounded pool blocks here until a worker slot frees up
                    let permit = match &semaphore {
                        Some(semaphore) => Some(
                            semaphore.clone().acquire_owned().await.expect("worker semaphore closed"),
                        ),
                        None => None,
                    };
                    let ctx = ctx.clone();
                    let errors_tx = errors_tx.clone();
                    let span = tracing::info_span!("taskmq_worker", queue = %ctx.queue);
                    workers.spawn(
                        async move {
                            if let Err(e) = ctx.consume_one(&payload).await {
                                let _ = errors_tx.send(e).await;
                            }
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                _ = stop_rx.changed() => break Ok(()),
            }
        };

        // unblock any worker still trying to report an error, then wait for
        // all in-flight handlers to run to completion
        drop(errors_tx);
        drop(errors_rx);
        while workers.join_next().await.is_some() {}

        result
    }

    /// Graceful shutdown: first the producers, then the in-flight handlers.
    /// When this returns no payload can be observed anymore and everything
    /// the delivery channel accepted has been processed or errored.
    pub async fn stop_consuming(&self) {
        self.base.signal_stop();

        let handles = {
            self.consumer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };
        if let Some(handles) = handles {
            handles.stop_receiving.send_replace(true);
            let _ = handles.receiving.await;
            handles.stop_delayed.send_replace(true);
            let _ = handles.delayed.await;
        }

        let mut session_done = self.session_done.subscribe();
        let _ = session_done.wait_for(|done| *done).await;
    }

    pub async fn count_pending_tasks(&self) -> Result<u64> {
        let mut conn = self.connector.conn().await?;
        Ok(redis::cmd("LLEN")
            .arg(&self.config.default_queue)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn count_delayed_tasks(&self) -> Result<u64> {
        let mut conn = self.connector.conn().await?;
        Ok(redis::cmd("ZCARD")
            .arg(with_delay_suffix(&self.config.default_queue))
            .query_async(&mut conn)
            .await?)
    }

    pub async fn get_pending_tasks(&self, start: i64, end: i64) -> Result<Vec<Signature>> {
        let (start, end) = coerce_list_range(start, end);
        let mut conn = self.connector.conn().await?;
        let payloads: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(&self.config.default_queue)
            .arg(start)
            .arg(end)
            .query_async(&mut conn)
            .await?;
        payloads.iter().map(|p| Signature::decode(p)).collect()
    }

    pub async fn get_delayed_tasks(&self, start: i64, end: i64) -> Result<Vec<Signature>> {
        let (start, end) = coerce_list_range(start, end);
        let delayed_key = with_delay_suffix(&self.config.default_queue);
        let detail_key = with_detail_suffix(&self.config.default_queue);

        let mut conn = self.connector.conn().await?;
        let uuids: Vec<String> = redis::cmd("ZRANGE")
            .arg(&delayed_key)
            .arg(start)
            .arg(end)
            .query_async(&mut conn)
            .await?;

        let mut signatures = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let payload: Option<Vec<u8>> = redis::cmd("HGET")
                .arg(&detail_key)
                .arg(&uuid)
                .query_async(&mut conn)
                .await?;
            let payload = payload.ok_or_else(|| {
                BrokerError::Consistency(format!(
                    "detail payload for delayed task {uuid} is missing"
                ))
            })?;
            signatures.push(Signature::decode(&payload)?);
        }
        Ok(signatures)
    }

    /// Removes a delayed task before it is promoted. `NotFound` means the
    /// UUID was never delayed under this queue or has already been claimed.
    pub async fn cancel_delay_task(&self, uuid: &str) -> Result<()> {
        let delayed_key = with_delay_suffix(&self.config.default_queue);
        let detail_key = with_detail_suffix(&self.config.default_queue);
        let mut conn = self.connector.dedicated_conn().await?;

        // recover the signature before it is deleted so CANCEL hooks see it
        let payload: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(&detail_key)
            .arg(uuid)
            .query_async(&mut conn)
            .await?;

        let removed = match remove_delayed_entry(&mut conn, &delayed_key, &detail_key, uuid).await {
            Ok(removed) => removed,
            Err(e) => {
                let _ = redis::cmd("DISCARD").query_async::<()>(&mut conn).await;
                return Err(e);
            }
        };
        if removed == 0 {
            return Err(BrokerError::NotFound {
                uuid: uuid.to_string(),
            });
        }

        let signature = payload
            .and_then(|p| Signature::decode(&p).ok())
            .unwrap_or_else(|| Signature::default().with_uuid(uuid));
        hooks::fire(&self.config.default_queue, TaskEvent::Cancel, &signature);
        tracing::debug!(uuid = %uuid, "cancelled delayed task");
        Ok(())
    }

    /// Copies a range of delayed tasks from one queue's structures to
    /// another's, e.g. to re-shard after a code upgrade. Entries are never
    /// removed from the source: the worst case across retries is a
    /// duplicate, never a loss.
    pub async fn transfer_delay_task(
        &self,
        from: &str,
        to: &str,
        start: i64,
        end: i64,
    ) -> Result<()> {
        let (start, end) = validate_transfer_range(start, end)?;
        let src_delayed = with_delay_suffix(from);
        let src_detail = with_detail_suffix(from);
        let dst_delayed = with_delay_suffix(to);
        let dst_detail = with_detail_suffix(to);

        loop {
            tokio::time::sleep(TRANSFER_RETRY_INTERVAL).await;
            let mut conn = self.connector.dedicated_conn().await?;

            redis::cmd("WATCH")
                .arg(&src_delayed)
                .query_async::<()>(&mut conn)
                .await?;

            let uuids: Vec<String> = redis::cmd("ZRANGE")
                .arg(&src_delayed)
                .arg(start)
                .arg(end)
                .query_async(&mut conn)
                .await?;
            if uuids.is_empty() {
                redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                return Ok(());
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for uuid in &uuids {
                let payload: Option<Vec<u8>> = redis::cmd("HGET")
                    .arg(&src_detail)
                    .arg(uuid)
                    .query_async(&mut conn)
                    .await?;
                let Some(payload) = payload else {
                    redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                    return Err(BrokerError::Consistency(format!(
                        "detail payload for delayed task {uuid} is missing"
                    )));
                };
                let signature = match Signature::decode(&payload) {
                    Ok(signature) => signature,
                    Err(e) => {
                        redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                        return Err(e);
                    }
                };
                let Some(score) = signature.eta.and_then(|eta| eta.timestamp_nanos_opt()) else {
                    redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                    return Err(BrokerError::Consistency(format!(
                        "delayed task {uuid} has no usable ETA"
                    )));
                };
                pipe.cmd("HSET")
                    .arg(&dst_detail)
                    .arg(uuid)
                    .arg(payload.as_slice())
                    .ignore();
                pipe.cmd("ZADD").arg(&dst_delayed).arg(score).arg(uuid).ignore();
            }

            tracing::info!(from = %from, to = %to, count = uuids.len(), "transferring delayed tasks");

            let reply: Option<redis::Value> = pipe.query_async(&mut conn).await?;
            if reply.is_some() {
                return Ok(());
            }
            // the watched key changed under us; take a fresh snapshot
        }
    }

    /// Same as [`transfer_delay_task`](Self::transfer_delay_task) for the
    /// ready list.
    pub async fn transfer_task(&self, from: &str, to: &str, start: i64, end: i64) -> Result<()> {
        let (start, end) = validate_transfer_range(start, end)?;

        loop {
            tokio::time::sleep(TRANSFER_RETRY_INTERVAL).await;
            let mut conn = self.connector.dedicated_conn().await?;

            redis::cmd("WATCH")
                .arg(from)
                .query_async::<()>(&mut conn)
                .await?;

            let payloads: Vec<Vec<u8>> = redis::cmd("LRANGE")
                .arg(from)
                .arg(start)
                .arg(end)
                .query_async(&mut conn)
                .await?;
            if payloads.is_empty() {
                redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                return Ok(());
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for payload in &payloads {
                if let Err(e) = Signature::decode(payload) {
                    redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                    return Err(e);
                }
                pipe.cmd("RPUSH").arg(to).arg(payload.as_slice()).ignore();
            }

            tracing::info!(from = %from, to = %to, count = payloads.len(), "transferring tasks");

            let reply: Option<redis::Value> = pipe.query_async(&mut conn).await?;
            if reply.is_some() {
                return Ok(());
            }
        }
    }
}

impl crate::Broker for RedisBroker {
    fn set_registered_task_names(&self, names: &[String]) {
        RedisBroker::set_registered_task_names(self, names);
    }

    fn is_task_registered(&self, name: &str) -> bool {
        RedisBroker::is_task_registered(self, name)
    }

    async fn start_consuming<P: TaskProcessor + 'static>(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: P,
    ) -> (bool, Result<()>) {
        RedisBroker::start_consuming(self, consumer_tag, concurrency, processor).await
    }

    async fn stop_consuming(&self) {
        RedisBroker::stop_consuming(self).await;
    }

    async fn publish(&self, signature: &mut Signature) -> Result<()> {
        RedisBroker::publish(self, signature).await
    }

    async fn get_pending_tasks(&self, start: i64, end: i64) -> Result<Vec<Signature>> {
        RedisBroker::get_pending_tasks(self, start, end).await
    }

    async fn get_delayed_tasks(&self, start: i64, end: i64) -> Result<Vec<Signature>> {
        RedisBroker::get_delayed_tasks(self, start, end).await
    }

    async fn count_pending_tasks(&self) -> Result<u64> {
        RedisBroker::count_pending_tasks(self).await
    }

    async fn count_delayed_tasks(&self) -> Result<u64> {
        RedisBroker::count_delayed_tasks(self).await
    }

    async fn cancel_delay_task(&self, uuid: &str) -> Result<()> {
        RedisBroker::cancel_delay_task(self, uuid).await
    }

    async fn transfer_delay_task(&self, from: &str, to: &str, start: i64, end: i64) -> Result<()> {
        RedisBroker::transfer_delay_task(self, from, to, start, end).await
    }

    async fn transfer_task(&self, from: &str, to: &str, start: i64, end: i64) -> Result<()> {
        RedisBroker::transfer_task(self, from, to, start, end).await
    }
}

struct ConsumeContext<P> {
    base: BrokerBase,
    manager: ConnectionManager,
    queue: String,
    processor: Arc<P>,
}

impl<P> Clone for ConsumeContext<P> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            manager: self.manager.clone(),
            queue: self.queue.clone(),
            processor: self.processor.clone(),
        }
    }
}

impl<P: TaskProcessor> ConsumeContext<P> {
    async fn consume_one(&self, payload: &[u8]) -> Result<()> {
        let signature = Signature::decode(payload)?;

        // a heterogeneous fleet may share one queue; tasks meant for other
        // workers go back to the tail instead of being dropped
        if !self.base.is_task_registered(&signature.name) {
            let mut conn = self.manager.clone();
            redis::cmd("RPUSH")
                .arg(&self.queue)
                .arg(payload)
                .query_async::<()>(&mut conn)
                .await?;
            tracing::debug!(uuid = %signature.uuid, name = %signature.name, "requeued unregistered task");
            return Ok(());
        }

        tracing::debug!(uuid = %signature.uuid, name = %signature.name, "received new message");
        self.processor.process(&signature).await?;
        hooks::fire(&self.queue, TaskEvent::Process, &signature);
        Ok(())
    }
}

/// Single producer popping ready payloads with `BLPOP` and forwarding them
/// to the delivery channel.
async fn receiving_loop(
    connector: RedisConnector,
    queue: String,
    deliveries: mpsc::Sender<Vec<u8>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut conn: Option<MultiplexedConnection> = None;

    loop {
        if *stop.borrow_and_update() {
            return;
        }

        let mut current = match conn.take() {
            Some(current) => current,
            None => match connector.dedicated_conn().await {
                Ok(current) => current,
                Err(e) => {
                    tracing::debug!(error = ?e, queue = %queue, "receiving loop reconnect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = stop.changed() => return,
                    }
                }
            },
        };

        tokio::select! {
            _ = stop.changed() => return,
            next = next_task(&mut current, &queue) => match next {
                Ok(Some(payload)) => {
                    conn = Some(current);
                    tokio::select! {
                        _ = stop.changed() => return,
                        sent = deliveries.send(payload) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => {
                    conn = Some(current);
                }
                Err(e) => {
                    tracing::trace!(error = ?e, queue = %queue, "receiving loop transient error");
                }
            },
        }
    }
}

async fn next_task(conn: &mut MultiplexedConnection, queue: &str) -> Result<Option<Vec<u8>>> {
    // items, when present, are [popped key, popped value]
    let items: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
        .arg(queue)
        .arg(BLPOP_TIMEOUT_SECS)
        .query_async(conn)
        .await?;
    Ok(items.map(|(_key, value)| value))
}

/// Single producer promoting due delayed tasks into the delivery channel.
async fn delayed_loop(
    connector: RedisConnector,
    queue: String,
    deliveries: mpsc::Sender<Vec<u8>>,
    mut stop: watch::Receiver<bool>,
) {
    let delayed_key = with_delay_suffix(&queue);
    let detail_key = with_detail_suffix(&queue);
    let mut conn: Option<MultiplexedConnection> = None;

    loop {
        if *stop.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(DELAYED_SCAN_INTERVAL) => {}
            _ = stop.changed() => return,
        }

        let mut current = match conn.take() {
            Some(current) => current,
            None => match connector.dedicated_conn().await {
                Ok(current) => current,
                Err(e) => {
                    tracing::debug!(error = ?e, queue = %queue, "delayed loop reconnect failed");
                    continue;
                }
            },
        };

        match next_delayed_task(&mut current, &delayed_key, &detail_key).await {
            Ok(Some(payload)) => {
                conn = Some(current);
                tokio::select! {
                    _ = stop.changed() => return,
                    sent = deliveries.send(payload) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                conn = Some(current);
            }
            Err(BrokerError::AlreadyClaimed { .. }) => {
                // another consumer won the ZREM race; nothing to deliver
                conn = Some(current);
            }
            Err(BrokerError::Consistency(msg)) => {
                conn = Some(current);
                tracing::error!(queue = %queue, "{msg}");
            }
            Err(e) => {
                tracing::trace!(error = ?e, queue = %queue, "delayed loop transient error");
            }
        }
    }
}

async fn next_delayed_task(
    conn: &mut MultiplexedConnection,
    delayed_key: &str,
    detail_key: &str,
) -> Result<Option<Vec<u8>>> {
    let now = now_ns();
    let items: Vec<String> = redis::cmd("ZRANGEBYSCORE")
        .arg(delayed_key)
        .arg(0)
        .arg(now)
        .arg("LIMIT")
        .arg(0)
        .arg(1)
        .query_async(conn)
        .await?;
    let Some(uuid) = items.into_iter().next() else {
        return Ok(None);
    };

    let payload: Option<Vec<u8>> = redis::cmd("HGET")
        .arg(detail_key)
        .arg(&uuid)
        .query_async(conn)
        .await?;
    let Some(payload) = payload else {
        return Err(BrokerError::Consistency(format!(
            "detail payload for delayed task {uuid} is missing"
        )));
    };

    let removed = match remove_delayed_entry(conn, delayed_key, detail_key, &uuid).await {
        Ok(removed) => removed,
        Err(e) => {
            // connection-return hygiene: abort any open transaction state
            let _ = redis::cmd("DISCARD").query_async::<()>(conn).await;
            return Err(e);
        }
    };

    if removed == 0 {
        tracing::info!(uuid = %uuid, "delayed task may already be consumed");
        return Err(BrokerError::AlreadyClaimed { uuid });
    }
    Ok(Some(payload))
}

/// Atomically drops a UUID from both delayed structures. The returned count
/// is the ZREM reply: zero means another consumer got there first.
async fn remove_delayed_entry(
    conn: &mut MultiplexedConnection,
    delayed_key: &str,
    detail_key: &str,
    uuid: &str,
) -> Result<i64> {
    redis::cmd("MULTI").query_async::<()>(conn).await?;
    redis::cmd("ZREM")
        .arg(delayed_key)
        .arg(uuid)
        .query_async::<()>(conn)
        .await?;
    redis::cmd("HDEL")
        .arg(detail_key)
        .arg(uuid)
        .query_async::<()>(conn)
        .await?;
    let (removed, _details_removed): (i64, i64) =
        redis::cmd("EXEC").query_async(conn).await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_suffixes() {
        assert_eq!(with_delay_suffix("tasks"), "tasks_delayed");
        assert_eq!(with_detail_suffix("tasks"), "tasks_detail");
    }

    #[test]
    fn list_range_coercion() {
        assert_eq!(coerce_list_range(0, 5), (0, 5));
        assert_eq!(coerce_list_range(3, 3), (3, 3));
        assert_eq!(coerce_list_range(-1, 5), (0, 10));
        assert_eq!(coerce_list_range(4, 2), (0, 10));
    }

    #[test]
    fn transfer_range_validation() {
        assert_eq!(validate_transfer_range(0, 0).unwrap(), (0, -1));
        assert_eq!(validate_transfer_range(1, 4).unwrap(), (1, 4));
        assert!(validate_transfer_range(-1, 4).is_err());
        assert!(validate_transfer_range(2, 2).is_err());
        assert!(validate_transfer_range(4, 2).is_err());
    }
}

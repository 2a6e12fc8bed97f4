//!
//! This module defines the producer and the queue selectors used for ordered sends.
//!
use crate::config::ProducerConfig;
use crate::error::ClientError;
use crate::message::{DelayLevel, Message, SendResult};
use crate::route::MessageQueue;
use crate::session::Session;
use crate::transport::Transport;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Picks the destination queue of an ordered send.
///
/// Implementations must be deterministic: the same queues, message and argument
/// always yield the same index, so every message sharing an argument lands on the
/// same queue and keeps its relative order.
pub trait MessageQueueSelector<A: ?Sized>: Send + Sync {
    fn select(&self, queues: &[MessageQueue], message: &Message, arg: &A) -> usize;
}

impl<A: ?Sized, F> MessageQueueSelector<A> for F
where
    F: Fn(&[MessageQueue], &Message, &A) -> usize + Send + Sync,
{
    fn select(&self, queues: &[MessageQueue], message: &Message, arg: &A) -> usize {
        self(queues, message, arg)
    }
}

/// `crc32(arg) % queue count`. The hash does not depend on the build, so producers
/// in different processes agree on the queue of a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectMessageQueueByHash;

impl<A: Hash + ?Sized> MessageQueueSelector<A> for SelectMessageQueueByHash {
    fn select(&self, queues: &[MessageQueue], _message: &Message, arg: &A) -> usize {
        hash_index(arg, queues.len())
    }
}

/// `arg % queue count`, for numeric keys such as order ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectMessageQueueByModulo;

impl MessageQueueSelector<u64> for SelectMessageQueueByModulo {
    fn select(&self, queues: &[MessageQueue], _message: &Message, arg: &u64) -> usize {
        (*arg % queues.len().max(1) as u64) as usize
    }
}

fn hash_index<A: Hash + ?Sized>(arg: &A, len: usize) -> usize {
    let mut hasher = crc32fast::Hasher::new();
    arg.hash(&mut hasher);
    bucket(hasher.finalize(), len)
}

fn bucket(hash: u32, len: usize) -> usize {
    (hash as usize) % len.max(1)
}

struct ProducerInner {
    session: Session,
    /// Every attempt of every send variant, retries included.
    attempts: AtomicU64,
    next_queue: AtomicUsize,
}

impl ProducerInner {
    /// Round robin, skipping the queue that failed last. A partition hint pins the queue.
    fn pick_queue(
        &self,
        queues: &[MessageQueue],
        message: &Message,
        last_failed: Option<&MessageQueue>,
    ) -> MessageQueue {
        if let Some(hint) = message.partition_hint() {
            return queues[bucket(crc32fast::hash(hint.as_bytes()), queues.len())].clone();
        }
        let start = self.next_queue.fetch_add(1, Ordering::Relaxed);
        (0..queues.len())
            .map(|i| &queues[(start + i) % queues.len()])
            .find(|queue| Some(*queue) != last_failed)
            .unwrap_or(&queues[start % queues.len()])
            .clone()
    }

    /// A single attempt bounded by the per-attempt timeout.
    async fn attempt(
        &self,
        queue: &MessageQueue,
        message: &Message,
    ) -> Result<SendResult, ClientError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let timeout = self.session.retry_policy().per_attempt_timeout();
        let transport: &Arc<dyn Transport> = self.session.transport();
        let send = transport.send(self.session.identity(), queue, message);
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    async fn send_with_retry<F>(
        &self,
        message: &Message,
        mut pick: F,
    ) -> Result<SendResult, ClientError>
    where
        F: FnMut(&[MessageQueue], Option<&MessageQueue>) -> Result<MessageQueue, ClientError>,
    {
        let max_attempts = self.session.retry_policy().max_attempts;
        let mut last_failed: Option<MessageQueue> = None;
        let mut last_error = ClientError::Unknown;

        for attempt in 1..=max_attempts {
            let queues = match self.session.route(message.topic()).await {
                Ok(queues) => queues,
                Err(e) if e.is_retryable() => {
                    warn!(
                        topic = message.topic(),
                        attempt,
                        error = %e,
                        "Failed to fetch topic route"
                    );
                    last_error = e;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let queue = pick(queues.as_slice(), last_failed.as_ref())?;

            match self.attempt(&queue, message).await {
                Ok(result) => {
                    debug!(
                        topic = message.topic(),
                        queue = %queue,
                        msg_id = %result.msg_id,
                        attempt,
                        "Message sent"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        topic = message.topic(),
                        queue = %queue,
                        attempt,
                        error = %e,
                        "Send attempt failed"
                    );
                    self.session.invalidate_route(message.topic());
                    last_failed = Some(queue);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClientError::SendFailed {
            topic: message.topic().to_owned(),
            attempts: max_attempts,
            source: Box::new(last_error),
        })
    }

    /// One attempt on a round-robin queue, as used by asynchronous and one-way sends.
    async fn send_once(&self, message: &Message) -> Result<SendResult, ClientError> {
        let queues = self.session.route(message.topic()).await?;
        let queue = self.pick_queue(&queues, message, None);
        self.attempt(&queue, message).await
    }
}

fn validate(message: &Message) -> Result<(), ClientError> {
    if message.topic().trim().is_empty() {
        return Err(ClientError::InvalidMessage("topic must not be empty".to_owned()));
    }
    if message.body().is_empty() {
        return Err(ClientError::InvalidMessage("body must not be empty".to_owned()));
    }
    Ok(())
}

/// Publishes messages for one producer group.
///
/// Construct once per process and clone the handle wherever messages are sent.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    pub fn new(
        config: &ProducerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        Ok(Producer::with_session(Session::from_config(
            &config.client,
            transport,
        )?))
    }

    pub fn with_session(session: Session) -> Self {
        Producer {
            inner: Arc::new(ProducerInner {
                session,
                attempts: AtomicU64::new(0),
                next_queue: AtomicUsize::new(0),
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.inner.session.start().await
    }

    /// Stop accepting sends and wait for in-flight ones, callbacks included.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.inner.session.stop().await
    }

    /// Stop immediately. Pending asynchronous callbacks may never run.
    pub fn shutdown_now(&self) {
        self.inner.session.shutdown_now();
    }

    /// Number of send attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Send and wait for the broker acknowledgement.
    ///
    /// Transient failures are retried on another queue up to `retry.maxAttempts`
    /// times; the wait is bounded by `maxAttempts * perAttemptTimeout`.
    ///
    /// # Errors
    /// Raise ClientError::SendFailed, carrying the last cause, once attempts are
    /// exhausted. Non-transient errors are returned as they occur.
    pub async fn send(&self, message: Message) -> Result<SendResult, ClientError> {
        self.inner.session.ensure_started()?;
        validate(&message)?;
        let _guard = self.inner.session.enter();
        let inner = &self.inner;
        inner
            .send_with_retry(&message, |queues, last_failed| {
                Ok(inner.pick_queue(queues, &message, last_failed))
            })
            .await
    }

    /// Like [`Producer::send`], but the broker hides the message from consumers until
    /// `level` elapses.
    pub async fn send_delayed(
        &self,
        message: Message,
        level: DelayLevel,
    ) -> Result<SendResult, ClientError> {
        self.send(message.with_delay_level(level)).await
    }

    /// Send through `selector` so every message sharing `arg` lands on the same queue.
    ///
    /// Retries reuse the queue the selector picks; they never move to another one.
    ///
    /// # Errors
    /// Raise ClientError::QueueSelection if the selector returns an index outside the route.
    pub async fn send_ordered<S, A>(
        &self,
        message: Message,
        selector: &S,
        arg: &A,
    ) -> Result<SendResult, ClientError>
    where
        S: MessageQueueSelector<A> + ?Sized,
        A: Sync + ?Sized,
    {
        self.inner.session.ensure_started()?;
        validate(&message)?;
        let _guard = self.inner.session.enter();
        self.inner
            .send_with_retry(&message, |queues, _| {
                let index = selector.select(queues, &message, arg);
                queues
                    .get(index)
                    .cloned()
                    .ok_or(ClientError::QueueSelection {
                        index,
                        available: queues.len(),
                    })
            })
            .await
    }

    /// Send without blocking the caller.
    ///
    /// Exactly one of `on_success` or `on_failure` runs, once, on a runtime worker.
    /// The attempt is not retried.
    ///
    /// # Errors
    /// Lifecycle and validation errors are returned directly; the callbacks are then
    /// dropped unused.
    pub fn send_async<S, F>(
        &self,
        message: Message,
        on_success: S,
        on_failure: F,
    ) -> Result<(), ClientError>
    where
        S: FnOnce(SendResult) + Send + 'static,
        F: FnOnce(ClientError) + Send + 'static,
    {
        self.inner.session.ensure_started()?;
        validate(&message)?;
        let inner = Arc::clone(&self.inner);
        self.inner.session.spawn(async move {
            match inner.send_once(&message).await {
                Ok(result) => on_success(result),
                Err(e) => {
                    warn!(topic = message.topic(), error = %e, "Asynchronous send failed");
                    on_failure(e)
                }
            }
        })?;
        Ok(())
    }

    /// Fire and forget: returns at once, with no acknowledgement, retry or notification.
    pub fn send_oneway(&self, message: Message) -> Result<(), ClientError> {
        self.inner.session.ensure_started()?;
        validate(&message)?;
        let inner = Arc::clone(&self.inner);
        self.inner.session.spawn(async move {
            let outcome = match inner.session.route(message.topic()).await {
                Ok(queues) => {
                    let queue = inner.pick_queue(&queues, &message, None);
                    inner.attempts.fetch_add(1, Ordering::Relaxed);
                    let timeout = inner.session.retry_policy().per_attempt_timeout();
                    let transport = inner.session.transport();
                    tokio::time::timeout(
                        timeout,
                        transport.send_oneway(inner.session.identity(), &queue, &message),
                    )
                    .await
                    .unwrap_or(Err(ClientError::Timeout(timeout)))
                }
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                debug!(topic = message.topic(), error = %e, "One-way send dropped");
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::in_memory::InMemoryBroker;
    use crate::message::SendStatus;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    fn producer(broker: &InMemoryBroker) -> Result<Producer, ClientError> {
        let mut config = ProducerConfig::new("seckill_producerGroup", "127.0.0.1:9876");
        config.client.retry = RetryPolicy {
            max_attempts: 3,
            per_attempt_timeout_ms: 200,
            connect_timeout_ms: 200,
        };
        Producer::new(&config, Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_send_requires_started_session() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        let result = producer.send(Message::new("T1", "x")).await;
        assert!(matches!(result, Err(ClientError::NotStarted(_))));

        producer.start().await?;
        producer.shutdown().await?;
        let result = producer.send(Message::new("T1", "x")).await;
        assert!(result.unwrap_err().is_lifecycle());
        assert!(matches!(
            producer.send_oneway(Message::new("T1", "x")),
            Err(ClientError::Stopped(_))
        ));
        assert!(producer
            .send_async(Message::new("T1", "x"), |_| {}, |_| {})
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_send_round_robin() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;

        let mut queues = HashSet::new();
        for i in 0..4 {
            let result = producer.send(Message::new("T1", format!("m{}", i))).await?;
            assert_eq!(result.status, SendStatus::SendOk);
            queues.insert(result.queue.queue_id);
        }
        assert_eq!(queues.len(), 4);
        assert_eq!(producer.attempts(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_retries_transient_failures() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;

        broker.fail_next_sends(2);
        let result = producer.send(Message::new("T1", "x")).await?;
        assert_eq!(result.status, SendStatus::SendOk);
        assert_eq!(producer.attempts(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_failed_after_exhaustion() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;

        broker.fail_next_sends(5);
        match producer.send(Message::new("T1", "x")).await {
            Err(ClientError::SendFailed { attempts, source, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ClientError::BrokerBusy(_)));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(producer.attempts(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_timeout_is_bounded() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;

        broker.set_send_latency(Some(Duration::from_secs(10)));
        let started = Instant::now();
        let result = producer.send(Message::new("T1", "x")).await;
        assert!(matches!(result, Err(ClientError::SendFailed { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_retried() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;
        let result = producer.send(Message::new("missing", "x")).await;
        assert!(matches!(result, Err(ClientError::TopicNotFound(_))));
        assert_eq!(producer.attempts(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_ordered_is_deterministic() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("TopicOrder");
        let producer = producer(&broker)?;
        producer.start().await?;

        for order_id in 0u64..8 {
            let mut targets = HashSet::new();
            for step in ["created", "paid", "shipped"] {
                let message = Message::builder("TopicOrder", step).tag("TagA").build();
                let result = producer
                    .send_ordered(message, &SelectMessageQueueByHash, &order_id)
                    .await?;
                targets.insert(result.queue);
            }
            assert_eq!(targets.len(), 1, "order {} spread over queues", order_id);
        }
        Ok(())
    }

    #[test]
    fn test_hash_selector_is_stable_crc32() {
        let queues: Vec<_> = (0..4).map(|id| MessageQueue::new("T1", "b", id)).collect();
        let message = Message::new("T1", "x");
        let select = |arg: &str| SelectMessageQueueByHash.select(&queues, &message, arg);
        // `str` feeds its bytes followed by a 0xff terminator to the hasher.
        let expected = crc32fast::hash(b"order-42\xff") as usize % 4;
        assert_eq!(select("order-42"), expected);
        assert_eq!(select("order-42"), select("order-42"));
        assert_eq!(
            SelectMessageQueueByHash.select(&queues, &message, &7u64),
            crc32fast::hash(&7u64.to_ne_bytes()) as usize % 4
        );
    }

    #[tokio::test]
    async fn test_send_ordered_with_closure_and_modulo() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("TopicOrder");
        let producer = producer(&broker)?;
        producer.start().await?;

        let by_order_id =
            |queues: &[MessageQueue], _: &Message, id: &u64| (*id % queues.len() as u64) as usize;
        let result = producer
            .send_ordered(Message::new("TopicOrder", "x"), &by_order_id, &6u64)
            .await?;
        assert_eq!(result.queue.queue_id, 2);

        let result = producer
            .send_ordered(Message::new("TopicOrder", "x"), &SelectMessageQueueByModulo, &7u64)
            .await?;
        assert_eq!(result.queue.queue_id, 3);

        let broken = |_: &[MessageQueue], _: &Message, _: &u64| 9usize;
        let result = producer
            .send_ordered(Message::new("TopicOrder", "x"), &broken, &1u64)
            .await;
        assert!(matches!(
            result,
            Err(ClientError::QueueSelection { index: 9, available: 4 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_ordered_retry_stays_on_queue() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("TopicOrder");
        let producer = producer(&broker)?;
        producer.start().await?;

        broker.fail_next_sends(2);
        let result = producer
            .send_ordered(Message::new("TopicOrder", "x"), &SelectMessageQueueByModulo, &1u64)
            .await?;
        assert_eq!(result.queue.queue_id, 1);
        assert_eq!(producer.attempts(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_partition_hint_pins_queue() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;

        let mut targets = HashSet::new();
        for _ in 0..5 {
            let message = Message::builder("T1", "x").partition_hint("order-42").build();
            targets.insert(producer.send(message).await?.queue);
        }
        assert_eq!(targets.len(), 1);
        let expected = (crc32fast::hash(b"order-42") % 4) as i32;
        assert!(targets.iter().all(|queue| queue.queue_id == expected));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_delayed() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;

        let result = producer
            .send_delayed(Message::new("T1", "later"), DelayLevel::Secs10)
            .await?;
        let queue_id = result.queue.queue_id;
        assert!(broker.messages("T1", queue_id).is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let visible = broker.messages("T1", queue_id);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].delay_level(), Some(DelayLevel::Secs10));
        Ok(())
    }

    #[tokio::test]
    async fn test_send_oneway_never_blocks() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;

        broker.set_send_latency(Some(Duration::from_secs(5)));
        let started = Instant::now();
        for _ in 0..10 {
            producer.send_oneway(Message::new("T1", "trace"))?;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        producer.shutdown_now();
        Ok(())
    }

    #[tokio::test]
    async fn test_send_oneway_delivers() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;
        producer.send_oneway(Message::new("T1", "trace"))?;
        producer.shutdown().await?;
        let total: usize = (0..4).map(|q| broker.messages("T1", q).len()).sum();
        assert_eq!(total, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_async_invokes_exactly_one_callback() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let producer = producer(&broker)?;
        producer.start().await?;
        broker.fail_next_sends(1);

        let successes = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        for i in 0..4 {
            let s = Arc::clone(&successes);
            let f = Arc::clone(&failures);
            producer.send_async(
                Message::new("T1", format!("m{}", i)),
                move |result| {
                    assert_eq!(result.status, SendStatus::SendOk);
                    s.fetch_add(1, Ordering::SeqCst);
                },
                move |e| {
                    assert!(matches!(e, ClientError::BrokerBusy(_)));
                    f.fetch_add(1, Ordering::SeqCst);
                },
            )?;
        }

        // Graceful shutdown waits for every callback.
        producer.shutdown().await?;
        assert_eq!(successes.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(producer.attempts(), 4);
        Ok(())
    }
}

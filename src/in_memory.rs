//!
//! A process-local broker implementing [`Transport`], for tests and demos.
//!
use crate::error::ClientError;
use crate::message::{Message, MessageExt, SendResult, SendStatus, DLQ_TOPIC_PREFIX};
use crate::route::MessageQueue;
use crate::transport::{PullResult, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

const DEFAULT_QUEUE_NUMS: i32 = 4;

struct Scheduled {
    due: Instant,
    queue: MessageQueue,
    message: Message,
}

/// Dead-letter topics are created on first use with a single queue.
#[derive(Default)]
struct BrokerState {
    /// `None` accepts every endpoint.
    reachable: Option<HashSet<SocketAddr>>,
    topics: HashMap<String, Vec<Vec<MessageExt>>>,
    scheduled: Vec<Scheduled>,
    offsets: HashMap<(String, MessageQueue), i64>,
    consumers: HashMap<String, BTreeSet<String>>,
    failing_sends: u32,
    send_latency: Option<Duration>,
    sequence: u64,
}

impl BrokerState {
    fn log(&mut self, queue: &MessageQueue) -> Result<&mut Vec<MessageExt>, ClientError> {
        if !self.topics.contains_key(&queue.topic) && queue.topic.starts_with(DLQ_TOPIC_PREFIX) {
            self.topics.insert(queue.topic.clone(), vec![Vec::new()]);
        }
        self.topics
            .get_mut(&queue.topic)
            .ok_or_else(|| ClientError::TopicNotFound(queue.topic.clone()))?
            .get_mut(queue.queue_id as usize)
            .ok_or_else(|| ClientError::TopicNotFound(queue.to_string()))
    }

    fn append(
        &mut self,
        queue: &MessageQueue,
        message: Message,
    ) -> Result<(String, i64), ClientError> {
        self.sequence += 1;
        let msg_id = format!("{:08X}{:016X}", queue.queue_id, self.sequence);
        let log = self.log(queue)?;
        let offset = log.len() as i64;
        log.push(MessageExt::new(
            message,
            msg_id.clone(),
            queue.clone(),
            offset,
            now_millis(),
        ));
        Ok((msg_id, offset))
    }

    /// Move delayed messages whose tier elapsed into their queues.
    fn promote_due(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.scheduled.drain(..).partition(|entry| entry.due <= now);
        self.scheduled = waiting;
        let mut due = due;
        due.sort_by_key(|entry| entry.due);
        for entry in due {
            // The topic existed when the message was scheduled.
            let _ = self.append(&entry.queue, entry.message);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct InMemoryBroker {
    name: String,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            name: "broker-a".to_owned(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Broker with one topic of four queues.
    pub fn with_topic(topic: &str) -> Self {
        let broker = InMemoryBroker::new();
        broker.create_topic(topic, DEFAULT_QUEUE_NUMS);
        broker
    }

    pub fn broker_name(&self) -> &str {
        &self.name
    }

    pub fn create_topic(&self, topic: &str, queue_nums: i32) {
        let mut guard = self.state.lock();
        guard
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| (0..queue_nums.max(1)).map(|_| Vec::new()).collect());
    }

    pub fn queue(&self, topic: &str, queue_id: i32) -> MessageQueue {
        MessageQueue::new(topic, &self.name, queue_id)
    }

    /// Accept connections only from the given endpoints.
    pub fn set_reachable(&self, endpoints: &[SocketAddr]) {
        self.state.lock().reachable = Some(endpoints.iter().copied().collect());
    }

    /// Fail the next `count` sends with a retryable busy error.
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().failing_sends = count;
    }

    pub fn set_send_latency(&self, latency: Option<Duration>) {
        self.state.lock().send_latency = latency;
    }

    /// Visible messages of one queue, in offset order.
    pub fn messages(&self, topic: &str, queue_id: i32) -> Vec<MessageExt> {
        let mut guard = self.state.lock();
        guard.promote_due();
        guard
            .topics
            .get(topic)
            .and_then(|queues| queues.get(queue_id as usize))
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, queue: &MessageQueue) -> Option<i64> {
        self.state
            .lock()
            .offsets
            .get(&(group.to_owned(), queue.clone()))
            .copied()
    }

    async fn before_send(&self) -> Result<(), ClientError> {
        let latency = {
            let mut guard = self.state.lock();
            if guard.failing_sends > 0 {
                guard.failing_sends -= 1;
                return Err(ClientError::BrokerBusy(format!(
                    "{} rejected the request",
                    self.name
                )));
            }
            guard.send_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn store(&self, queue: &MessageQueue, message: &Message) -> Result<SendResult, ClientError> {
        let mut guard = self.state.lock();
        guard.promote_due();
        if let Some(level) = message.delay_level() {
            // Validates the destination before parking the message.
            guard.log(queue)?;
            guard.sequence += 1;
            let msg_id = format!("{:08X}{:016X}", queue.queue_id, guard.sequence);
            guard.scheduled.push(Scheduled {
                due: Instant::now() + level.duration(),
                queue: queue.clone(),
                message: message.clone(),
            });
            return Ok(SendResult {
                status: SendStatus::SendOk,
                msg_id,
                queue: queue.clone(),
                queue_offset: -1,
            });
        }
        let (msg_id, offset) = guard.append(queue, message.clone())?;
        Ok(SendResult {
            status: SendStatus::SendOk,
            msg_id,
            queue: queue.clone(),
            queue_offset: offset,
        })
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self, endpoint: SocketAddr) -> Result<(), ClientError> {
        match &self.state.lock().reachable {
            Some(reachable) if !reachable.contains(&endpoint) => Err(ClientError::Io(
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, endpoint.to_string()),
            )),
            _ => Ok(()),
        }
    }

    async fn route(&self, topic: &str) -> Result<Vec<MessageQueue>, ClientError> {
        let mut guard = self.state.lock();
        if topic.starts_with(DLQ_TOPIC_PREFIX) {
            guard.log(&self.queue(topic, 0))?;
        }
        let queue_nums = guard
            .topics
            .get(topic)
            .map(Vec::len)
            .ok_or_else(|| ClientError::TopicNotFound(topic.to_owned()))?;
        Ok((0..queue_nums as i32)
            .map(|queue_id| self.queue(topic, queue_id))
            .collect())
    }

    async fn send(
        &self,
        _group: &str,
        queue: &MessageQueue,
        message: &Message,
    ) -> Result<SendResult, ClientError> {
        self.before_send().await?;
        self.store(queue, message)
    }

    async fn send_oneway(
        &self,
        _group: &str,
        queue: &MessageQueue,
        message: &Message,
    ) -> Result<(), ClientError> {
        self.before_send().await?;
        self.store(queue, message).map(|_| ())
    }

    async fn pull(
        &self,
        _group: &str,
        queue: &MessageQueue,
        offset: i64,
        max_messages: u32,
    ) -> Result<PullResult, ClientError> {
        let mut guard = self.state.lock();
        guard.promote_due();
        let log = guard.log(queue)?;
        let start = offset.clamp(0, log.len() as i64) as usize;
        let end = (start + max_messages as usize).min(log.len());
        Ok(PullResult {
            messages: log[start..end].to_vec(),
            next_begin_offset: end as i64,
        })
    }

    async fn query_offset(
        &self,
        group: &str,
        queue: &MessageQueue,
    ) -> Result<Option<i64>, ClientError> {
        Ok(self.committed_offset(group, queue))
    }

    async fn commit_offset(
        &self,
        group: &str,
        queue: &MessageQueue,
        offset: i64,
    ) -> Result<(), ClientError> {
        self.state
            .lock()
            .offsets
            .insert((group.to_owned(), queue.clone()), offset);
        Ok(())
    }

    async fn min_offset(&self, queue: &MessageQueue) -> Result<i64, ClientError> {
        self.state.lock().log(queue).map(|_| 0)
    }

    async fn max_offset(&self, queue: &MessageQueue) -> Result<i64, ClientError> {
        let mut guard = self.state.lock();
        guard.promote_due();
        guard.log(queue).map(|log| log.len() as i64)
    }

    async fn search_offset(
        &self,
        queue: &MessageQueue,
        timestamp: u64,
    ) -> Result<i64, ClientError> {
        let mut guard = self.state.lock();
        let log = guard.log(queue)?;
        Ok(log
            .iter()
            .find(|message| message.store_timestamp() >= timestamp)
            .map(MessageExt::queue_offset)
            .unwrap_or(log.len() as i64))
    }

    async fn register_consumer(&self, group: &str, client_id: &str) -> Result<(), ClientError> {
        self.state
            .lock()
            .consumers
            .entry(group.to_owned())
            .or_default()
            .insert(client_id.to_owned());
        Ok(())
    }

    async fn unregister_consumer(&self, group: &str, client_id: &str) -> Result<(), ClientError> {
        if let Some(members) = self.state.lock().consumers.get_mut(group) {
            members.remove(client_id);
        }
        Ok(())
    }

    async fn consumer_ids(&self, group: &str) -> Result<Vec<String>, ClientError> {
        Ok(self
            .state
            .lock()
            .consumers
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DelayLevel;

    #[tokio::test]
    async fn test_send_and_pull() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        assert_eq!(broker.route("T1").await?.len(), 4);

        let queue = broker.queue("T1", 2);
        for body in ["a", "b", "c"] {
            broker.send("g", &queue, &Message::new("T1", body)).await?;
        }

        let result = broker.pull("g", &queue, 1, 32).await?;
        assert_eq!(result.next_begin_offset, 3);
        let bodies: Vec<_> = result.messages.iter().map(|m| m.body().clone()).collect();
        assert_eq!(bodies, ["b", "c"]);
        assert_eq!(result.messages[0].queue_offset(), 1);
        assert_eq!(broker.max_offset(&queue).await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.route("missing").await,
            Err(ClientError::TopicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_topic_created_on_demand() -> Result<(), ClientError> {
        let broker = InMemoryBroker::new();
        let queues = broker.route("%DLQ%g").await?;
        assert_eq!(queues.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_is_invisible_until_due() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let queue = broker.queue("T1", 0);
        let message = Message::builder("T1", "later")
            .delay_level(DelayLevel::Secs10)
            .build();
        let result = broker.send("g", &queue, &message).await?;
        assert_eq!(result.queue_offset, -1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(broker.pull("g", &queue, 0, 32).await?.messages.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let pulled = broker.pull("g", &queue, 0, 32).await?;
        assert_eq!(pulled.messages.len(), 1);
        assert_eq!(pulled.messages[0].body().as_ref(), b"later");
        Ok(())
    }

    #[tokio::test]
    async fn test_fault_injection() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let queue = broker.queue("T1", 0);
        broker.fail_next_sends(1);
        let first = broker.send("g", &queue, &Message::new("T1", "x")).await;
        assert!(matches!(first, Err(ClientError::BrokerBusy(_))));
        broker.send("g", &queue, &Message::new("T1", "x")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_offsets_and_consumers() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let queue = broker.queue("T1", 0);
        assert_eq!(broker.query_offset("g", &queue).await?, None);
        broker.commit_offset("g", &queue, 7).await?;
        assert_eq!(broker.query_offset("g", &queue).await?, Some(7));

        broker.register_consumer("g", "c2").await?;
        broker.register_consumer("g", "c1").await?;
        assert_eq!(broker.consumer_ids("g").await?, ["c1", "c2"]);
        broker.unregister_consumer("g", "c1").await?;
        assert_eq!(broker.consumer_ids("g").await?, ["c2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_reachability() {
        let broker = InMemoryBroker::new();
        let up: SocketAddr = "127.0.0.1:9876".parse().unwrap();
        let down: SocketAddr = "127.0.0.1:9877".parse().unwrap();
        broker.set_reachable(&[up]);
        assert!(broker.connect(up).await.is_ok());
        assert!(broker.connect(down).await.is_err());
    }
}

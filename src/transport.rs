//!
//! The seam between the client core and whatever carries requests to brokers.
//!
//! Implementations own the wire protocol. They report transient failures with
//! retryable [`ClientError`] variants so the session can retry below producers and
//! the dispatch loop.
//!
use crate::error::ClientError;
use crate::message::{Message, MessageExt, SendResult};
use crate::route::MessageQueue;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Messages returned by one pull, plus where the next pull should begin.
#[derive(Debug, Clone, Default)]
pub struct PullResult {
    pub messages: Vec<MessageExt>,
    pub next_begin_offset: i64,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish connectivity with one name server or broker endpoint.
    async fn connect(&self, endpoint: SocketAddr) -> Result<(), ClientError>;

    /// Writable queues of a topic.
    async fn route(&self, topic: &str) -> Result<Vec<MessageQueue>, ClientError>;

    /// Store a message and wait for the broker acknowledgement.
    async fn send(
        &self,
        group: &str,
        queue: &MessageQueue,
        message: &Message,
    ) -> Result<SendResult, ClientError>;

    /// Hand a message over without waiting for any acknowledgement.
    async fn send_oneway(
        &self,
        group: &str,
        queue: &MessageQueue,
        message: &Message,
    ) -> Result<(), ClientError>;

    /// Read up to `max_messages` visible messages starting at `offset`.
    async fn pull(
        &self,
        group: &str,
        queue: &MessageQueue,
        offset: i64,
        max_messages: u32,
    ) -> Result<PullResult, ClientError>;

    /// Offset committed by `group` for `queue`, if it ever committed one.
    async fn query_offset(&self, group: &str, queue: &MessageQueue)
        -> Result<Option<i64>, ClientError>;

    async fn commit_offset(
        &self,
        group: &str,
        queue: &MessageQueue,
        offset: i64,
    ) -> Result<(), ClientError>;

    /// Earliest offset still retained.
    async fn min_offset(&self, queue: &MessageQueue) -> Result<i64, ClientError>;

    /// Offset the next stored message will receive.
    async fn max_offset(&self, queue: &MessageQueue) -> Result<i64, ClientError>;

    /// First offset stored at or after `timestamp` milliseconds.
    async fn search_offset(&self, queue: &MessageQueue, timestamp: u64) -> Result<i64, ClientError>;

    async fn register_consumer(&self, group: &str, client_id: &str) -> Result<(), ClientError>;

    async fn unregister_consumer(&self, group: &str, client_id: &str) -> Result<(), ClientError>;

    /// Live members of a consumer group.
    async fn consumer_ids(&self, group: &str) -> Result<Vec<String>, ClientError>;
}

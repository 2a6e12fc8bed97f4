use crate::route::MessageQueue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::slice;
use std::time::Duration;
use std::vec::Vec;

/// Dead-letter topics are named after the consumer group with this prefix.
pub const DLQ_TOPIC_PREFIX: &str = "%DLQ%";

/// Attribute keys stamped on a message when it is moved to the dead-letter topic.
pub const PROPERTY_ORIGIN_TOPIC: &str = "ORIGIN_TOPIC";
pub const PROPERTY_ORIGIN_MESSAGE_ID: &str = "ORIGIN_MESSAGE_ID";
pub const PROPERTY_RECONSUME_TIMES: &str = "RECONSUME_TIMES";

/// Broker defined delay tiers.
///
/// A delayed message is invisible to subscribers until its tier elapses. Arbitrary
/// durations are not supported; use [`DelayLevel::nearest`] to map a wanted delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DelayLevel {
    Secs1 = 1,
    Secs5,
    Secs10,
    Secs30,
    Mins1,
    Mins2,
    Mins3,
    Mins4,
    Mins5,
    Mins6,
    Mins7,
    Mins8,
    Mins9,
    Mins10,
    Mins20,
    Mins30,
    Hours1,
    Hours2,
}

impl DelayLevel {
    pub const ALL: [DelayLevel; 18] = [
        DelayLevel::Secs1,
        DelayLevel::Secs5,
        DelayLevel::Secs10,
        DelayLevel::Secs30,
        DelayLevel::Mins1,
        DelayLevel::Mins2,
        DelayLevel::Mins3,
        DelayLevel::Mins4,
        DelayLevel::Mins5,
        DelayLevel::Mins6,
        DelayLevel::Mins7,
        DelayLevel::Mins8,
        DelayLevel::Mins9,
        DelayLevel::Mins10,
        DelayLevel::Mins20,
        DelayLevel::Mins30,
        DelayLevel::Hours1,
        DelayLevel::Hours2,
    ];

    /// Numeric level as understood by brokers, 1 through 18.
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        DelayLevel::ALL.get(usize::from(level).checked_sub(1)?).copied()
    }

    pub fn duration(self) -> Duration {
        let secs = match self {
            DelayLevel::Secs1 => 1,
            DelayLevel::Secs5 => 5,
            DelayLevel::Secs10 => 10,
            DelayLevel::Secs30 => 30,
            DelayLevel::Mins1 => 60,
            DelayLevel::Mins2 => 2 * 60,
            DelayLevel::Mins3 => 3 * 60,
            DelayLevel::Mins4 => 4 * 60,
            DelayLevel::Mins5 => 5 * 60,
            DelayLevel::Mins6 => 6 * 60,
            DelayLevel::Mins7 => 7 * 60,
            DelayLevel::Mins8 => 8 * 60,
            DelayLevel::Mins9 => 9 * 60,
            DelayLevel::Mins10 => 10 * 60,
            DelayLevel::Mins20 => 20 * 60,
            DelayLevel::Mins30 => 30 * 60,
            DelayLevel::Hours1 => 3600,
            DelayLevel::Hours2 => 2 * 3600,
        };
        Duration::from_secs(secs)
    }

    /// Closest tier to `wanted`; ties resolve to the shorter tier.
    pub fn nearest(wanted: Duration) -> Self {
        let mut best = DelayLevel::Secs1;
        let mut best_gap = Duration::MAX;
        for level in DelayLevel::ALL {
            let tier = level.duration();
            let gap = if tier > wanted {
                tier - wanted
            } else {
                wanted - tier
            };
            if gap < best_gap {
                best = level;
                best_gap = gap;
            }
        }
        best
    }
}

/// A message to publish. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// In the publisher-subscriber model, a topic is an address where messages are
    /// delivered to and subscribed from.
    topic: String,

    tag: Option<String>,

    keys: Vec<String>,

    /// User defined attributes in form of key-value paris.
    attributes: HashMap<String, String>,

    delay_level: Option<DelayLevel>,

    /// Routes the message by hash when sent without an explicit queue selector.
    partition_hint: Option<String>,

    body: Bytes,
}

impl Message {
    pub fn new(topic: &str, body: impl Into<Bytes>) -> Self {
        Message {
            topic: topic.to_owned(),
            tag: None,
            keys: Vec::new(),
            attributes: HashMap::new(),
            delay_level: None,
            partition_hint: None,
            body: body.into(),
        }
    }

    /// Start building a message.
    ///
    /// ```
    /// use rocketmq_client_core::message::Message;
    ///
    /// let message = Message::builder("TopicOrder", "created")
    ///     .tag("TagA")
    ///     .key("KEY0")
    ///     .build();
    /// assert_eq!(message.tag(), Some("TagA"));
    /// ```
    pub fn builder(topic: &str, body: impl Into<Bytes>) -> MessageBuilder {
        MessageBuilder {
            message: Message::new(topic, body),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn delay_level(&self) -> Option<DelayLevel> {
        self.delay_level
    }

    pub fn partition_hint(&self) -> Option<&str> {
        self.partition_hint.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub(crate) fn with_delay_level(&self, level: DelayLevel) -> Self {
        Message {
            delay_level: Some(level),
            ..self.clone()
        }
    }

    /// Copy addressed to `topic`, remembering where it came from.
    pub(crate) fn to_dead_letter(&self, topic: &str, msg_id: &str, reconsume_times: u32) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.insert(PROPERTY_ORIGIN_TOPIC.to_owned(), self.topic.clone());
        attributes.insert(PROPERTY_ORIGIN_MESSAGE_ID.to_owned(), msg_id.to_owned());
        attributes.insert(
            PROPERTY_RECONSUME_TIMES.to_owned(),
            reconsume_times.to_string(),
        );
        Message {
            topic: topic.to_owned(),
            attributes,
            delay_level: None,
            ..self.clone()
        }
    }
}

pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn tag(mut self, tag: &str) -> Self {
        self.message.tag = Some(tag.to_owned());
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.message.keys.push(key.to_owned());
        self
    }

    pub fn attribute(mut self, key: &str, value: &str) -> Self {
        self.message
            .attributes
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn delay_level(mut self, level: DelayLevel) -> Self {
        self.message.delay_level = Some(level);
        self
    }

    pub fn partition_hint(mut self, hint: &str) -> Self {
        self.message.partition_hint = Some(hint.to_owned());
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    SendOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
}

/// Outcome of one acknowledged send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub status: SendStatus,
    pub msg_id: String,
    pub queue: MessageQueue,
    /// Position in the destination queue; `-1` while a delayed message waits for its tier.
    pub queue_offset: i64,
}

/// A message as handed to consumers, with its broker assigned position.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageExt {
    pub(crate) message: Message,
    pub(crate) msg_id: String,
    pub(crate) queue: MessageQueue,
    pub(crate) queue_offset: i64,
    pub(crate) store_timestamp: u64,
    pub(crate) reconsume_times: u32,
}

impl MessageExt {
    pub fn new(
        message: Message,
        msg_id: String,
        queue: MessageQueue,
        queue_offset: i64,
        store_timestamp: u64,
    ) -> Self {
        MessageExt {
            message,
            msg_id,
            queue,
            queue_offset,
            store_timestamp,
            reconsume_times: 0,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn queue_offset(&self) -> i64 {
        self.queue_offset
    }

    /// Milliseconds since the Unix epoch at which the broker stored the message.
    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp
    }

    /// How many times this message has been handed back for another attempt.
    pub fn reconsume_times(&self) -> u32 {
        self.reconsume_times
    }
}

impl Deref for MessageExt {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

/// Ordered messages of one partition handed to a handler in one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedBatch {
    messages: Vec<MessageExt>,
}

impl ConsumedBatch {
    pub(crate) fn new(messages: Vec<MessageExt>) -> Self {
        ConsumedBatch { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, MessageExt> {
        self.messages.iter()
    }

    pub fn as_slice(&self) -> &[MessageExt] {
        &self.messages
    }
}

impl<'a> IntoIterator for &'a ConsumedBatch {
    type Item = &'a MessageExt;
    type IntoIter = slice::Iter<'a, MessageExt>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_level_numbering() {
        assert_eq!(DelayLevel::Secs1.level(), 1);
        assert_eq!(DelayLevel::Secs10.level(), 3);
        assert_eq!(DelayLevel::Hours2.level(), 18);
        assert_eq!(DelayLevel::from_level(3), Some(DelayLevel::Secs10));
        assert_eq!(DelayLevel::from_level(0), None);
        assert_eq!(DelayLevel::from_level(19), None);
    }

    #[test]
    fn test_delay_level_nearest() {
        assert_eq!(DelayLevel::nearest(Duration::ZERO), DelayLevel::Secs1);
        assert_eq!(DelayLevel::nearest(Duration::from_secs(9)), DelayLevel::Secs10);
        assert_eq!(DelayLevel::nearest(Duration::from_secs(100)), DelayLevel::Mins2);
        assert_eq!(DelayLevel::nearest(Duration::from_secs(90)), DelayLevel::Mins1);
        assert_eq!(
            DelayLevel::nearest(Duration::from_secs(24 * 3600)),
            DelayLevel::Hours2
        );
    }

    #[test]
    fn test_builder() {
        let message = Message::builder("TopicOrder", "paid")
            .tag("TagC")
            .key("KEY1")
            .key("order-1")
            .attribute("origin", "web")
            .partition_hint("1")
            .build();
        assert_eq!(message.topic(), "TopicOrder");
        assert_eq!(message.tag(), Some("TagC"));
        assert_eq!(message.keys().len(), 2);
        assert_eq!(message.attribute("origin"), Some("web"));
        assert_eq!(message.partition_hint(), Some("1"));
        assert_eq!(message.delay_level(), None);
        assert_eq!(message.body().as_ref(), b"paid");
    }

    #[test]
    fn test_with_delay_level_leaves_original_untouched() {
        let message = Message::new("T1", "body");
        let delayed = message.with_delay_level(DelayLevel::Secs10);
        assert_eq!(message.delay_level(), None);
        assert_eq!(delayed.delay_level(), Some(DelayLevel::Secs10));
        assert_eq!(delayed.body(), message.body());
    }

    #[test]
    fn test_dead_letter_copy() {
        let message = Message::builder("T1", "x")
            .tag("TagA")
            .delay_level(DelayLevel::Secs5)
            .build();
        let dead = message.to_dead_letter("%DLQ%g", "id-1", 16);
        assert_eq!(dead.topic(), "%DLQ%g");
        assert_eq!(dead.tag(), Some("TagA"));
        assert_eq!(dead.delay_level(), None);
        assert_eq!(dead.attribute(PROPERTY_ORIGIN_TOPIC), Some("T1"));
        assert_eq!(dead.attribute(PROPERTY_ORIGIN_MESSAGE_ID), Some("id-1"));
        assert_eq!(dead.attribute(PROPERTY_RECONSUME_TIMES), Some("16"));
    }
}

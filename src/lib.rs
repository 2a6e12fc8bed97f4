//! This crate provides the core of a message queue client: sessions to a broker
//! cluster, a producer with retrying, delayed, ordered, asynchronous and one-way
//! sends, and a push consumer dispatching to business handlers concurrently or in
//! per-queue order, with redelivery, dead-lettering and offset tracking.
//!
//! The broker itself sits behind the [`transport::Transport`] trait;
//! [`in_memory::InMemoryBroker`] implements it for tests and demos.
pub mod config;
pub mod consumer;
mod dispatch;
pub mod error;
pub mod in_memory;
pub mod listener;
pub mod message;
mod offset;
pub mod producer;
mod rebalance;
pub mod route;
pub mod session;
pub mod transport;

pub use config::{
    ClientConfig, ConsumeFromWhere, ConsumerConfig, MessageModel, ProducerConfig, RetryPolicy,
};
pub use consumer::{PushConsumer, Subscription};
pub use dispatch::PartitionPhase;
pub use error::{ClientError, HandlerError};
pub use listener::{
    ConsumeConcurrentlyStatus, ConsumeMode, ConsumeOrderlyContext, ConsumeOrderlyStatus,
    MessageHandler,
};
pub use message::{ConsumedBatch, DelayLevel, Message, MessageExt, SendResult, SendStatus};
pub use producer::{
    MessageQueueSelector, Producer, SelectMessageQueueByHash, SelectMessageQueueByModulo,
};
pub use route::MessageQueue;
pub use session::{Session, SessionState};
pub use transport::Transport;

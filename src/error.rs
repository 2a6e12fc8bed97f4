use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Bad endpoint address `{0}`")]
    BadAddress(String),

    #[error("No reachable broker among `{0}`")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connect reset by peer")]
    ConnectionReset,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Broker is busy: {0}")]
    BrokerBusy(String),

    #[error("Session `{0}` is not started")]
    NotStarted(String),

    #[error("Session `{0}` is already started")]
    AlreadyStarted(String),

    #[error("Session `{0}` has been stopped")]
    Stopped(String),

    #[error("Failed to send message to topic `{topic}` after {attempts} attempt(s)")]
    SendFailed {
        topic: String,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Topic `{0}` has no route")]
    TopicNotFound(String),

    #[error("Queue selector chose index {index} out of {available} queue(s)")]
    QueueSelection { index: usize, available: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid subscription: {0}")]
    Subscription(String),

    #[error("Cannot subscribe to `{0}` once the consumer has started")]
    AlreadySubscribed(String),

    #[error("Message handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown client error")]
    Unknown,
}

impl ClientError {
    /// Transient transport failures that a send or pull may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectionReset
                | ClientError::Timeout(_)
                | ClientError::BrokerBusy(_)
        )
    }

    /// Errors caused by calling an operation in the wrong session state.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ClientError::NotStarted(_) | ClientError::AlreadyStarted(_) | ClientError::Stopped(_)
        )
    }
}

/// Failure raised by business logic inside a message handler.
///
/// The dispatch loop turns it into a redelivery decision; it is never propagated to
/// the caller of the consumer.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

//!
//! The contract between the consumer and business logic.
//!
use crate::error::HandlerError;
use crate::message::ConsumedBatch;
use crate::route::MessageQueue;
use std::sync::Arc;

/// How a consumer schedules handler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    /// Any worker takes any batch; no ordering guarantee.
    Concurrently,
    /// One worker per queue at a time, batches in offset order.
    Orderly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeConcurrentlyStatus {
    Success,
    Failure,
    ReconsumeLater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOrderlyStatus {
    Success,
    Failure,
    ReconsumeLater,
    /// Pause the queue for a fixed interval and retry the same batch.
    SuspendCurrentQueueAMoment,
}

/// Per-invocation context of orderly consumption.
#[derive(Debug)]
pub struct ConsumeOrderlyContext {
    queue: MessageQueue,
    auto_commit: bool,
    commit_through: Option<usize>,
}

impl ConsumeOrderlyContext {
    pub(crate) fn new(queue: MessageQueue) -> Self {
        Self {
            queue,
            auto_commit: true,
            commit_through: None,
        }
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// With auto commit off, a successful batch only advances the committed offset
    /// as far as [`ConsumeOrderlyContext::commit_through`] says.
    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    /// Mark messages up to and including batch index `index` as committed.
    pub fn commit_through(&mut self, index: usize) {
        self.commit_through = Some(self.commit_through.map_or(index, |current| current.max(index)));
    }

    pub(crate) fn committed_index(&self) -> Option<usize> {
        self.commit_through
    }
}

/// Business logic invoked by the dispatch loop.
///
/// Only the method matching the [`ConsumeMode`] chosen at registration is called.
/// Handlers run on blocking-capable worker threads and may block. Returning an
/// error, or panicking, counts as a failed batch.
pub trait MessageHandler: Send + Sync + 'static {
    fn consume_concurrently(
        &self,
        batch: &ConsumedBatch,
    ) -> Result<ConsumeConcurrentlyStatus, HandlerError> {
        let _ = batch;
        Err(HandlerError::new("handler does not support concurrent consumption"))
    }

    fn consume_orderly(
        &self,
        batch: &ConsumedBatch,
        context: &mut ConsumeOrderlyContext,
    ) -> Result<ConsumeOrderlyStatus, HandlerError> {
        let _ = (batch, context);
        Err(HandlerError::new("handler does not support orderly consumption"))
    }
}

struct ConcurrentlyFn<F>(F);

impl<F> MessageHandler for ConcurrentlyFn<F>
where
    F: Fn(&ConsumedBatch) -> Result<ConsumeConcurrentlyStatus, HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn consume_concurrently(
        &self,
        batch: &ConsumedBatch,
    ) -> Result<ConsumeConcurrentlyStatus, HandlerError> {
        (self.0)(batch)
    }
}

struct OrderlyFn<F>(F);

impl<F> MessageHandler for OrderlyFn<F>
where
    F: Fn(&ConsumedBatch, &mut ConsumeOrderlyContext) -> Result<ConsumeOrderlyStatus, HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn consume_orderly(
        &self,
        batch: &ConsumedBatch,
        context: &mut ConsumeOrderlyContext,
    ) -> Result<ConsumeOrderlyStatus, HandlerError> {
        (self.0)(batch, context)
    }
}

/// Wrap a closure as a concurrent handler.
pub fn concurrently<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&ConsumedBatch) -> Result<ConsumeConcurrentlyStatus, HandlerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(ConcurrentlyFn(f))
}

/// Wrap a closure as an orderly handler.
pub fn orderly<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&ConsumedBatch, &mut ConsumeOrderlyContext) -> Result<ConsumeOrderlyStatus, HandlerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(OrderlyFn(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_through_only_moves_forward() {
        let mut context = ConsumeOrderlyContext::new(MessageQueue::new("T1", "b", 0));
        assert!(context.auto_commit());
        context.set_auto_commit(false);
        context.commit_through(2);
        context.commit_through(1);
        assert_eq!(context.committed_index(), Some(2));
    }

    #[test]
    fn test_unsupported_mode_fails() {
        let handler = concurrently(|_| Ok(ConsumeConcurrentlyStatus::Success));
        let batch = ConsumedBatch::new(Vec::new());
        let mut context = ConsumeOrderlyContext::new(MessageQueue::new("T1", "b", 0));
        assert!(handler.consume_orderly(&batch, &mut context).is_err());
        assert_eq!(
            handler.consume_concurrently(&batch),
            Ok(ConsumeConcurrentlyStatus::Success)
        );
    }
}

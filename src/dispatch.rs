//!
//! The dispatch loop: hands pulled messages to the handler and decides what happens
//! to each batch afterwards.
//!
//! Every assigned queue has a [`ProcessQueue`] holding messages pulled but not yet
//! committed, keyed by offset. The committed offset of a queue is the smallest
//! offset still held there, so a message awaiting redelivery pins the offset until
//! it resolves.
//!
//! Per queue: `Idle -> Assigned -> Processing -> Committed -> Assigned` on success,
//! `Processing -> Failed -> RetryWait -> Processing` on failure.
//!
use crate::config::ConsumerConfig;
use crate::error::ClientError;
use crate::listener::{
    ConsumeConcurrentlyStatus, ConsumeMode, ConsumeOrderlyContext, ConsumeOrderlyStatus,
    MessageHandler,
};
use crate::message::{ConsumedBatch, Message, MessageExt, SendResult, DLQ_TOPIC_PREFIX};
use crate::offset::OffsetStore;
use crate::route::MessageQueue;
use crate::session::{InFlight, Session};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPhase {
    Idle,
    Assigned,
    Processing,
    Committed,
    Failed,
    RetryWait,
}

struct ProcessQueueState {
    msgs: BTreeMap<i64, MessageExt>,
    /// Orderly only: the batch currently handed to the handler.
    consuming: BTreeMap<i64, MessageExt>,
    /// Highest offset ever put, `-1` before the first pull.
    max_offset: i64,
    /// Orderly only: a consume task is scheduled or running for this queue.
    dispatched: bool,
    /// Orderly only: lowest offset consumed without a commit. Filtered ranges do not
    /// advance the committed offset past it.
    uncommitted_from: Option<i64>,
    suspended_until: Option<Instant>,
    phase: PartitionPhase,
}

pub(crate) struct ProcessQueue {
    queue: MessageQueue,
    state: Mutex<ProcessQueueState>,
    /// Held by the single worker allowed to consume this queue in orderly mode.
    consume_lock: tokio::sync::Mutex<()>,
    dropped: AtomicBool,
}

impl ProcessQueue {
    pub(crate) fn new(queue: MessageQueue) -> Self {
        Self {
            queue,
            state: Mutex::new(ProcessQueueState {
                msgs: BTreeMap::new(),
                consuming: BTreeMap::new(),
                max_offset: -1,
                dispatched: false,
                uncommitted_from: None,
                suspended_until: None,
                phase: PartitionPhase::Assigned,
            }),
            consume_lock: tokio::sync::Mutex::new(()),
            dropped: AtomicBool::new(false),
        }
    }

    pub(crate) fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub(crate) fn phase(&self) -> PartitionPhase {
        self.state.lock().phase
    }

    fn set_phase(&self, phase: PartitionPhase) {
        let mut state = self.state.lock();
        if state.phase != phase {
            debug!(
                queue = %self.queue,
                from = ?state.phase,
                to = ?phase,
                "Partition phase changed"
            );
            state.phase = phase;
        }
    }

    /// Stop consuming this queue. Once this returns, no further progress of the queue
    /// reaches the offset store.
    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::SeqCst);
        self.set_phase(PartitionPhase::Idle);
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a running orderly batch of this queue to finish.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.consume_lock.lock()).await.is_ok()
    }

    /// Commits go through the state lock, so checking here orders them against
    /// `mark_dropped`.
    fn record(&self, offsets: &OffsetStore, offset: i64) {
        if !self.is_dropped() {
            offsets.update(&self.queue, offset, true);
        }
    }

    /// Messages pulled and not yet committed.
    pub(crate) fn cached_count(&self) -> usize {
        let state = self.state.lock();
        state.msgs.len() + state.consuming.len()
    }

    /// Cache messages pulled from below `next_offset`.
    ///
    /// Returns true when an orderly consume task has to be dispatched for them.
    pub(crate) fn put(&self, msgs: &[MessageExt], next_offset: i64) -> bool {
        let mut state = self.state.lock();
        state.max_offset = state.max_offset.max(next_offset - 1);
        for msg in msgs {
            state.max_offset = state.max_offset.max(msg.queue_offset);
            state.msgs.entry(msg.queue_offset).or_insert_with(|| msg.clone());
        }
        if !state.msgs.is_empty() && !state.dispatched {
            state.dispatched = true;
            return true;
        }
        false
    }

    /// Advance the committed offset over a filtered-out range, if nothing is in flight
    /// and nothing consumed is waiting for a manual commit.
    pub(crate) fn advance_if_idle(&self, next_offset: i64, offsets: &OffsetStore) {
        let mut state = self.state.lock();
        if state.msgs.is_empty() && state.consuming.is_empty() {
            state.max_offset = state.max_offset.max(next_offset - 1);
            if state.uncommitted_from.is_none() {
                self.record(offsets, next_offset);
            }
        }
    }

    /// Concurrent mode: drop consumed messages and move the committed offset to the
    /// smallest one still held.
    fn remove_and_commit(&self, done: &[i64], offsets: &OffsetStore) -> Option<i64> {
        let mut state = self.state.lock();
        if state.msgs.is_empty() {
            return None;
        }
        for offset in done {
            state.msgs.remove(offset);
        }
        let commit = match state.msgs.keys().next() {
            Some(first) => *first,
            None => state.max_offset + 1,
        };
        self.record(offsets, commit);
        Some(commit)
    }

    /// Concurrent mode: bump the attempt count of messages about to be redelivered.
    fn prepare_redelivery(&self, msgs: Vec<MessageExt>) -> Vec<MessageExt> {
        let mut state = self.state.lock();
        msgs.into_iter()
            .map(|mut msg| {
                msg.reconsume_times += 1;
                if let Some(held) = state.msgs.get_mut(&msg.queue_offset) {
                    held.reconsume_times = msg.reconsume_times;
                }
                msg
            })
            .collect()
    }

    /// Orderly mode: move the next `n` messages, lowest offsets first, into the
    /// consuming set.
    fn take(&self, n: usize) -> Vec<MessageExt> {
        let mut state = self.state.lock();
        let mut taken = Vec::with_capacity(n);
        while taken.len() < n {
            match state.msgs.pop_first() {
                Some((offset, msg)) => {
                    state.consuming.insert(offset, msg.clone());
                    taken.push(msg);
                }
                None => break,
            }
        }
        if taken.is_empty() {
            state.dispatched = false;
        }
        taken
    }

    /// Orderly mode: forget the consuming set and commit through `through`, if given.
    ///
    /// Without `through`, or with one short of the batch, the rest of the batch stays
    /// uncommitted until a later batch commits past it.
    fn commit(&self, through: Option<i64>, offsets: &OffsetStore) {
        let mut state = self.state.lock();
        let consuming = std::mem::take(&mut state.consuming);
        let (first, last) = match (consuming.keys().next(), consuming.keys().next_back()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return,
        };
        match through {
            Some(offset) => {
                self.record(offsets, offset + 1);
                state.uncommitted_from = (offset < last).then(|| offset + 1);
            }
            None => {
                state.uncommitted_from = state.uncommitted_from.or(Some(first));
            }
        }
    }

    /// Orderly mode: put the consuming set back for another attempt and pause the
    /// queue for `delay`. Returns the highest attempt count in the batch.
    fn rollback(&self, delay: Duration) -> u32 {
        let mut state = self.state.lock();
        let consuming = std::mem::take(&mut state.consuming);
        let mut times = 0;
        for (offset, mut msg) in consuming {
            msg.reconsume_times += 1;
            times = times.max(msg.reconsume_times);
            state.msgs.insert(offset, msg);
        }
        // A deadline past the clock range leaves the wait to the resubmit timer.
        state.suspended_until = Instant::now().checked_add(delay);
        times
    }

    /// Remaining suspension, clearing it once elapsed.
    fn suspended(&self) -> bool {
        let mut state = self.state.lock();
        match state.suspended_until {
            Some(until) if Instant::now() < until => true,
            _ => {
                state.suspended_until = None;
                false
            }
        }
    }

    fn release(&self) {
        self.state.lock().dispatched = false;
    }
}

pub(crate) struct DispatchLoop {
    group: String,
    mode: ConsumeMode,
    handler: Arc<dyn MessageHandler>,
    session: Session,
    offsets: Arc<OffsetStore>,
    config: ConsumerConfig,
    workers: Arc<Semaphore>,
    inflight: Arc<InFlight>,
    shutdown: watch::Sender<bool>,
}

impl DispatchLoop {
    pub(crate) fn new(
        handler: Arc<dyn MessageHandler>,
        mode: ConsumeMode,
        session: Session,
        offsets: Arc<OffsetStore>,
        config: ConsumerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            group: session.identity().to_owned(),
            mode,
            handler,
            workers: Arc::new(Semaphore::new(config.consume_thread_min)),
            session,
            offsets,
            config,
            inflight: Arc::new(InFlight::default()),
            shutdown,
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop scheduling: pulls end, redelivery timers are cancelled, queued batches are
    /// dropped.
    pub(crate) fn halt(&self) {
        self.shutdown.send_replace(true);
        self.workers.close();
    }

    /// Halt, then wait for running handlers. Returns whether they finished within
    /// `timeout`.
    pub(crate) async fn stop(&self, timeout: Duration) -> bool {
        self.halt();
        self.inflight.drain(timeout).await
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inflight.count()
    }

    /// Sleep for `delay`; false if shutdown came first.
    pub(crate) async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.inflight.enter();
        tokio::spawn(async move {
            future.await;
            drop(guard);
        });
    }

    /// Hand freshly pulled messages of `pq` to the workers.
    pub(crate) fn submit(
        self: &Arc<Self>,
        pq: &Arc<ProcessQueue>,
        msgs: Vec<MessageExt>,
        dispatch: bool,
    ) {
        match self.mode {
            ConsumeMode::Concurrently => self.submit_concurrently(pq, msgs),
            ConsumeMode::Orderly => {
                if dispatch {
                    self.submit_orderly(pq);
                }
            }
        }
    }

    fn submit_concurrently(self: &Arc<Self>, pq: &Arc<ProcessQueue>, msgs: Vec<MessageExt>) {
        for chunk in msgs.chunks(self.config.consume_message_batch_max_size.max(1)) {
            let this = Arc::clone(self);
            let pq = Arc::clone(pq);
            let chunk = chunk.to_vec();
            self.spawn(async move { this.consume_concurrently(pq, chunk).await });
        }
    }

    fn submit_orderly(self: &Arc<Self>, pq: &Arc<ProcessQueue>) {
        let this = Arc::clone(self);
        let pq = Arc::clone(pq);
        self.spawn(async move { this.consume_orderly(pq).await });
    }

    async fn consume_concurrently(self: Arc<Self>, pq: Arc<ProcessQueue>, msgs: Vec<MessageExt>) {
        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if pq.is_dropped() || self.is_stopped() {
            return;
        }

        pq.set_phase(PartitionPhase::Processing);
        let handler = Arc::clone(&self.handler);
        let batch = ConsumedBatch::new(msgs.clone());
        let outcome =
            tokio::task::spawn_blocking(move || handler.consume_concurrently(&batch)).await;
        drop(permit);

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(group = %self.group, queue = %pq.queue(), error = %e, "Handler failed");
                ConsumeConcurrentlyStatus::Failure
            }
            Err(e) => {
                error!(group = %self.group, queue = %pq.queue(), error = %e, "Handler panicked");
                ConsumeConcurrentlyStatus::Failure
            }
        };

        match status {
            ConsumeConcurrentlyStatus::Success => {
                let done: Vec<i64> = msgs.iter().map(MessageExt::queue_offset).collect();
                if let Some(offset) = pq.remove_and_commit(&done, &self.offsets) {
                    debug!(group = %self.group, queue = %pq.queue(), offset, "Offset advanced");
                }
                pq.set_phase(PartitionPhase::Committed);
                pq.set_phase(PartitionPhase::Assigned);
            }
            ConsumeConcurrentlyStatus::Failure | ConsumeConcurrentlyStatus::ReconsumeLater => {
                pq.set_phase(PartitionPhase::Failed);
                self.redeliver_concurrently(pq, msgs).await;
            }
        }
    }

    async fn redeliver_concurrently(
        self: &Arc<Self>,
        pq: Arc<ProcessQueue>,
        msgs: Vec<MessageExt>,
    ) {
        let max = self.config.max_reconsume_times;
        let (exhausted, mut retry): (Vec<_>, Vec<_>) =
            msgs.into_iter().partition(|msg| msg.reconsume_times >= max);

        let mut dead = Vec::new();
        for msg in exhausted {
            if self.dead_letter(&msg).await {
                dead.push(msg.queue_offset);
            } else {
                retry.push(msg);
            }
        }
        if !dead.is_empty() {
            pq.remove_and_commit(&dead, &self.offsets);
        }
        if retry.is_empty() {
            pq.set_phase(PartitionPhase::Assigned);
            return;
        }

        let retry = pq.prepare_redelivery(retry);
        let times = retry.iter().map(MessageExt::reconsume_times).max().unwrap_or(1);
        let delay = self.config.redelivery_backoff(times);
        debug!(
            group = %self.group,
            queue = %pq.queue(),
            messages = retry.len(),
            reconsume_times = times,
            ?delay,
            "Redeliver later"
        );
        pq.set_phase(PartitionPhase::RetryWait);

        let this = Arc::clone(self);
        self.spawn(async move {
            if this.wait_or_shutdown(delay).await && !pq.is_dropped() {
                this.submit_concurrently(&pq, retry);
            }
        });
    }

    async fn consume_orderly(self: Arc<Self>, pq: Arc<ProcessQueue>) {
        let _partition = pq.consume_lock.lock().await;
        loop {
            if pq.is_dropped() || self.is_stopped() {
                pq.release();
                return;
            }
            if pq.suspended() {
                // A resubmission is already scheduled for when the suspension ends.
                return;
            }
            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    pq.release();
                    return;
                }
            };
            let msgs = pq.take(self.config.consume_message_batch_max_size.max(1));
            if msgs.is_empty() {
                return;
            }

            pq.set_phase(PartitionPhase::Processing);
            let handler = Arc::clone(&self.handler);
            let batch = ConsumedBatch::new(msgs.clone());
            let mut context = ConsumeOrderlyContext::new(pq.queue().clone());
            let outcome = tokio::task::spawn_blocking(move || {
                let status = handler.consume_orderly(&batch, &mut context);
                (context, status)
            })
            .await;
            drop(permit);

            let (context, status) = match outcome {
                Ok((context, Ok(status))) => (Some(context), status),
                Ok((context, Err(e))) => {
                    warn!(group = %self.group, queue = %pq.queue(), error = %e, "Handler failed");
                    (Some(context), ConsumeOrderlyStatus::Failure)
                }
                Err(e) => {
                    error!(
                        group = %self.group,
                        queue = %pq.queue(),
                        error = %e,
                        "Handler panicked"
                    );
                    (None, ConsumeOrderlyStatus::Failure)
                }
            };

            if status == ConsumeOrderlyStatus::Success {
                let through = match &context {
                    Some(context) if !context.auto_commit() => context
                        .committed_index()
                        .and_then(|index| msgs.get(index))
                        .map(MessageExt::queue_offset),
                    _ => msgs.last().map(MessageExt::queue_offset),
                };
                pq.commit(through, &self.offsets);
                pq.set_phase(PartitionPhase::Committed);
                pq.set_phase(PartitionPhase::Assigned);
                continue;
            }

            pq.set_phase(PartitionPhase::Failed);
            if self.dead_letter_exhausted(&msgs).await {
                pq.commit(msgs.last().map(MessageExt::queue_offset), &self.offsets);
                pq.set_phase(PartitionPhase::Assigned);
                continue;
            }

            let delay = match status {
                ConsumeOrderlyStatus::SuspendCurrentQueueAMoment => {
                    self.config.suspend_current_queue_time()
                }
                _ => {
                    let times = msgs.iter().map(MessageExt::reconsume_times).max();
                    self.config.redelivery_backoff(times.unwrap_or(0) + 1)
                }
            };
            let times = pq.rollback(delay);
            debug!(
                group = %self.group,
                queue = %pq.queue(),
                reconsume_times = times,
                ?delay,
                "Queue suspended"
            );
            pq.set_phase(PartitionPhase::RetryWait);

            let this = Arc::clone(&self);
            let pq = Arc::clone(&pq);
            self.spawn(async move {
                if this.wait_or_shutdown(delay).await {
                    this.submit_orderly(&pq);
                } else {
                    pq.release();
                }
            });
            return;
        }
    }

    /// Orderly mode: dead-letter a batch whose every message used up its attempts.
    /// Returns true if the whole batch left the queue.
    async fn dead_letter_exhausted(&self, msgs: &[MessageExt]) -> bool {
        let max = self.config.max_reconsume_times;
        if !msgs.iter().all(|msg| msg.reconsume_times >= max) {
            return false;
        }
        for msg in msgs {
            if !self.dead_letter(msg).await {
                return false;
            }
        }
        true
    }

    /// Move `msg` to the group's dead-letter topic. False if that failed.
    async fn dead_letter(&self, msg: &MessageExt) -> bool {
        let topic = format!("{}{}", DLQ_TOPIC_PREFIX, self.group);
        let message = msg
            .message()
            .to_dead_letter(&topic, msg.msg_id(), msg.reconsume_times());
        match self.send_dead_letter(&topic, &message).await {
            Ok(sent) => {
                error!(
                    group = %self.group,
                    topic = msg.topic(),
                    queue = %msg.queue(),
                    offset = msg.queue_offset(),
                    msg_id = msg.msg_id(),
                    reconsume_times = msg.reconsume_times(),
                    dead_letter_id = %sent.msg_id,
                    "Message exceeded max reconsume times, moved to dead-letter queue"
                );
                true
            }
            Err(e) => {
                error!(
                    group = %self.group,
                    msg_id = msg.msg_id(),
                    error = %e,
                    "Failed to move message to dead-letter queue, redelivering instead"
                );
                false
            }
        }
    }

    async fn send_dead_letter(
        &self,
        topic: &str,
        message: &Message,
    ) -> Result<SendResult, ClientError> {
        let queues = self.session.route(topic).await?;
        let queue = queues
            .first()
            .ok_or_else(|| ClientError::TopicNotFound(topic.to_owned()))?;
        let timeout = self.session.retry_policy().per_attempt_timeout();
        let send = self.session.transport().send(&self.group, queue, message);
        tokio::time::timeout(timeout, send)
            .await
            .unwrap_or(Err(ClientError::Timeout(timeout)))
    }
}

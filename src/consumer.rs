//!
//! This module defines the push consumer: subscriptions, queue assignment and the
//! per-queue pull loops feeding the dispatch loop.
//!
use crate::config::{ConsumeFromWhere, ConsumerConfig, MessageModel};
use crate::dispatch::{DispatchLoop, PartitionPhase, ProcessQueue};
use crate::error::ClientError;
use crate::listener::{ConsumeMode, MessageHandler};
use crate::message::MessageExt;
use crate::offset::OffsetStore;
use crate::rebalance::Rebalance;
use crate::route::MessageQueue;
use crate::session::{Session, SessionState};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interest in one topic, narrowed by a tag expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: String,
    expression: String,
    /// `None` matches every tag.
    tags: Option<BTreeSet<String>>,
}

impl Subscription {
    /// Parse `"*"` (or an empty expression) as match-all, otherwise `"TagA || TagB"`.
    ///
    /// # Errors
    /// Raise ClientError::Subscription for an empty topic or an empty tag.
    pub fn parse(topic: &str, expression: &str) -> Result<Self, ClientError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ClientError::Subscription("topic must not be empty".to_owned()));
        }
        let expression = expression.trim();
        let tags = if expression.is_empty() || expression == "*" {
            None
        } else {
            let mut tags = BTreeSet::new();
            for tag in expression.split("||").map(str::trim) {
                if tag.is_empty() {
                    return Err(ClientError::Subscription(format!(
                        "empty tag in expression '{}'",
                        expression
                    )));
                }
                tags.insert(tag.to_owned());
            }
            Some(tags)
        };
        Ok(Subscription {
            topic: topic.to_owned(),
            expression: if tags.is_none() { "*".to_owned() } else { expression.to_owned() },
            tags,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Untagged messages only match `*`.
    pub fn matches(&self, tag: Option<&str>) -> bool {
        match (&self.tags, tag) {
            (None, _) => true,
            (Some(tags), Some(tag)) => tags.contains(tag),
            (Some(_), None) => false,
        }
    }
}

struct Running {
    dispatch: Arc<DispatchLoop>,
    offsets: Arc<OffsetStore>,
    rebalance: Arc<Rebalance>,
    /// Offset persistence and periodic rebalance.
    tasks: Vec<JoinHandle<()>>,
}

struct ConsumerInner {
    session: Session,
    config: ConsumerConfig,
    subscriptions: Mutex<Vec<Subscription>>,
    handler: Mutex<Option<(Arc<dyn MessageHandler>, ConsumeMode)>>,
    consume_from: Mutex<ConsumeFromWhere>,
    running: Mutex<Option<Running>>,
}

/// Pulls subscribed topics and pushes the messages to the registered handler.
///
/// Construct once per group at process start, subscribe and register the handler,
/// then `start`. Cloning yields another handle to the same consumer.
#[derive(Clone)]
pub struct PushConsumer {
    inner: Arc<ConsumerInner>,
}

impl PushConsumer {
    pub fn new(
        config: &ConsumerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let session = Session::from_config(&config.client, transport)?;
        Ok(PushConsumer {
            inner: Arc::new(ConsumerInner {
                session,
                config: config.clone(),
                subscriptions: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                consume_from: Mutex::new(config.consume_from_where),
                running: Mutex::new(None),
            }),
        })
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Subscribe to `topic`, filtered by a tag `expression`. Call before `start`.
    ///
    /// # Errors
    /// Raise ClientError::AlreadySubscribed once started, ClientError::Subscription for
    /// an invalid expression or a topic subscribed twice.
    pub fn subscribe(&self, topic: &str, expression: &str) -> Result<(), ClientError> {
        if self.inner.session.state() != SessionState::Created {
            return Err(ClientError::AlreadySubscribed(topic.to_owned()));
        }
        let subscription = Subscription::parse(topic, expression)?;
        let mut subscriptions = self.inner.subscriptions.lock();
        if subscriptions.iter().any(|s| s.topic == subscription.topic) {
            return Err(ClientError::Subscription(format!(
                "topic {} is already subscribed",
                subscription.topic
            )));
        }
        debug!(
            group = self.inner.session.identity(),
            topic = %subscription.topic,
            expression = %subscription.expression,
            "Subscribed"
        );
        subscriptions.push(subscription);
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.lock().clone()
    }

    /// Register the one handler of this consumer. `mode` decides how it is scheduled.
    pub fn register_handler(
        &self,
        handler: Arc<dyn MessageHandler>,
        mode: ConsumeMode,
    ) -> Result<(), ClientError> {
        if self.inner.session.state() != SessionState::Created {
            return Err(ClientError::AlreadyStarted(self.inner.session.identity().to_owned()));
        }
        let mut slot = self.inner.handler.lock();
        if slot.is_some() {
            return Err(ClientError::Config("a handler is already registered".to_owned()));
        }
        *slot = Some((handler, mode));
        Ok(())
    }

    /// Where to start on queues this group never committed an offset for.
    /// Queues with a committed offset always resume from it.
    pub fn set_consume_from_where(&self, policy: ConsumeFromWhere) {
        *self.inner.consume_from.lock() = policy;
    }

    /// Queues this consumer pulls, empty unless running. Changes as members join and
    /// leave the group.
    pub fn assigned_queues(&self) -> Vec<MessageQueue> {
        self.partition_phases().into_iter().map(|(queue, _)| queue).collect()
    }

    pub fn partition_phases(&self) -> Vec<(MessageQueue, PartitionPhase)> {
        match &*self.inner.running.lock() {
            Some(running) => running.rebalance.partition_phases(),
            None => Vec::new(),
        }
    }

    /// Start the session, take a share of the subscribed queues and begin pulling.
    /// The share is rebalanced every `rebalanceIntervalMs`.
    ///
    /// # Errors
    /// Raise ClientError::Config without a handler or subscription, and whatever the
    /// session start raises. A failure after the session started stops it.
    pub async fn start(&self) -> Result<(), ClientError> {
        let (handler, mode) = self
            .inner
            .handler
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Config("no handler registered".to_owned()))?;
        let subscriptions = self.subscriptions();
        if subscriptions.is_empty() {
            return Err(ClientError::Config("no topic subscribed".to_owned()));
        }

        let config = &self.inner.config;
        let session = &self.inner.session;
        let offsets = Arc::new(OffsetStore::new(
            session.identity(),
            config.message_model,
            Arc::clone(session.transport()),
            config.offset_store_dir.clone(),
        ));
        offsets.load()?;

        session.start().await?;
        let dispatch = Arc::new(DispatchLoop::new(
            handler,
            mode,
            session.clone(),
            Arc::clone(&offsets),
            config.clone(),
        ));

        match self.launch(subscriptions, &dispatch, &offsets).await {
            Ok(running) => {
                info!(
                    group = session.identity(),
                    client_id = session.client_id(),
                    model = ?config.message_model,
                    mode = ?mode,
                    queues = running.rebalance.partition_phases().len(),
                    "Consumer started"
                );
                *self.inner.running.lock() = Some(running);
                Ok(())
            }
            Err(e) => {
                error!(group = session.identity(), error = %e, "Failed to start consumer");
                dispatch.halt();
                session.shutdown_now();
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        subscriptions: Vec<Subscription>,
        dispatch: &Arc<DispatchLoop>,
        offsets: &Arc<OffsetStore>,
    ) -> Result<Running, ClientError> {
        let config = &self.inner.config;
        let session = &self.inner.session;
        let rebalance = Arc::new(Rebalance::new(
            session.clone(),
            config.clone(),
            *self.inner.consume_from.lock(),
            subscriptions,
            Arc::clone(dispatch),
            Arc::clone(offsets),
        ));
        rebalance.rebalance().await?;

        let mut tasks = vec![session.spawn(Arc::clone(&rebalance).run_periodically())?];
        let interval = config.persist_offset_interval();
        let persist_dispatch = Arc::clone(dispatch);
        let persist_offsets = Arc::clone(offsets);
        tasks.push(session.spawn(async move {
            while persist_dispatch.wait_or_shutdown(interval).await {
                persist_offsets.persist_all().await;
            }
        })?);
        Ok(Running {
            dispatch: Arc::clone(dispatch),
            offsets: Arc::clone(offsets),
            rebalance,
            tasks,
        })
    }

    /// Stop pulling, wait for running handlers, persist offsets and leave the group.
    ///
    /// Handlers still running after the drain timeout are abandoned; their messages
    /// are redelivered after the next start. Idempotent.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let running = self.inner.running.lock().take();
        let running = match running {
            Some(running) => running,
            None => return self.inner.session.stop().await,
        };
        let session = &self.inner.session;
        let group = session.identity();

        if !running.dispatch.stop(session.drain_timeout()).await {
            warn!(
                group,
                abandoned = running.dispatch.in_flight(),
                "Drain timeout elapsed, abandoning running handlers"
            );
        }
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(group, error = %e, "Consumer task ended abnormally");
            }
        }
        for pull in running.rebalance.release_all().await {
            if let Err(e) = pull.await {
                warn!(group, error = %e, "Pull loop ended abnormally");
            }
        }
        running.offsets.persist_all().await;

        if self.inner.config.message_model == MessageModel::Clustering {
            let transport = session.transport();
            if let Err(e) = transport.unregister_consumer(group, session.client_id()).await {
                warn!(group, error = %e, "Failed to unregister consumer");
            }
        }
        session.stop().await?;
        info!(group, "Consumer stopped");
        Ok(())
    }

    /// Stop without waiting for handlers or persisting offsets. Messages not yet
    /// committed are delivered again after the next start.
    pub fn shutdown_now(&self) {
        if let Some(running) = self.inner.running.lock().take() {
            running.dispatch.halt();
            running.rebalance.abort_all();
            for task in &running.tasks {
                task.abort();
            }
        }
        self.inner.session.shutdown_now();
    }
}

/// Pull loop of one assigned queue.
pub(crate) struct PullTask {
    pub(crate) session: Session,
    pub(crate) dispatch: Arc<DispatchLoop>,
    pub(crate) offsets: Arc<OffsetStore>,
    pub(crate) config: ConsumerConfig,
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) pq: Arc<ProcessQueue>,
}

impl PullTask {
    pub(crate) async fn run(self, mut next_offset: i64) {
        let group = self.session.identity();
        let queue = self.pq.queue();
        let timeout = self.session.retry_policy().per_attempt_timeout();
        debug!(group, queue = %queue, offset = next_offset, "Pull loop started");

        loop {
            if self.dispatch.is_stopped() || self.pq.is_dropped() {
                break;
            }

            let cached = self.pq.cached_count();
            if cached >= self.config.pull_threshold_for_queue {
                debug!(group, queue = %queue, cached, "Too many cached messages, pull paused");
                if !self.dispatch.wait_or_shutdown(self.config.pull_idle_interval()).await {
                    break;
                }
                continue;
            }

            let pulled = tokio::time::timeout(
                timeout,
                self.session
                    .transport()
                    .pull(group, queue, next_offset, self.config.pull_batch_size),
            )
            .await
            .unwrap_or(Err(ClientError::Timeout(timeout)));

            let delay = match pulled {
                Ok(result) if result.messages.is_empty() => {
                    if result.next_begin_offset > next_offset {
                        next_offset = result.next_begin_offset;
                        self.pq.advance_if_idle(next_offset, &self.offsets);
                    }
                    self.config.pull_idle_interval()
                }
                Ok(result) => {
                    next_offset = result.next_begin_offset;
                    let matched: Vec<MessageExt> = result
                        .messages
                        .into_iter()
                        .filter(|msg| self.subscription.matches(msg.tag()))
                        .collect();
                    if matched.is_empty() {
                        self.pq.advance_if_idle(next_offset, &self.offsets);
                    } else {
                        let dispatch = self.pq.put(&matched, next_offset);
                        self.dispatch.submit(&self.pq, matched, dispatch);
                    }
                    self.config.pull_interval()
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        group,
                        queue = %queue,
                        offset = next_offset,
                        error = %e,
                        "Pull failed, retrying"
                    );
                    self.config.pull_exception_delay()
                }
                Err(e) => {
                    error!(group, queue = %queue, offset = next_offset, error = %e, "Pull failed");
                    self.config.pull_exception_delay()
                }
            };

            if !self.dispatch.wait_or_shutdown(delay).await {
                break;
            }
        }
        debug!(group, queue = %queue, offset = next_offset, "Pull loop stopped");
    }
}

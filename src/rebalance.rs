//!
//! Queue allocation among the members of a consumer group.
//!
//! A clustering member re-reads the group every `rebalanceIntervalMs` and brings the
//! queues it pulls in line with its share: queues no longer allocated to it are
//! dropped and their offsets persisted before the new owner starts on them, newly
//! allocated queues get a pull loop. Broadcasting members take every queue.
//!
use crate::config::{ConsumeFromWhere, ConsumerConfig, MessageModel};
use crate::consumer::{PullTask, Subscription};
use crate::dispatch::{DispatchLoop, PartitionPhase, ProcessQueue};
use crate::error::ClientError;
use crate::offset::OffsetStore;
use crate::route::MessageQueue;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Assigned {
    pq: Arc<ProcessQueue>,
    pull: JoinHandle<()>,
}

pub(crate) struct Rebalance {
    session: Session,
    config: ConsumerConfig,
    policy: ConsumeFromWhere,
    subscriptions: Vec<Arc<Subscription>>,
    dispatch: Arc<DispatchLoop>,
    offsets: Arc<OffsetStore>,
    table: Mutex<BTreeMap<MessageQueue, Assigned>>,
    /// One rebalance at a time; shutdown takes it to stop further changes.
    running: tokio::sync::Mutex<()>,
}

impl Rebalance {
    pub(crate) fn new(
        session: Session,
        config: ConsumerConfig,
        policy: ConsumeFromWhere,
        subscriptions: Vec<Subscription>,
        dispatch: Arc<DispatchLoop>,
        offsets: Arc<OffsetStore>,
    ) -> Self {
        Self {
            session,
            config,
            policy,
            subscriptions: subscriptions.into_iter().map(Arc::new).collect(),
            dispatch,
            offsets,
            table: Mutex::new(BTreeMap::new()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn partition_phases(&self) -> Vec<(MessageQueue, PartitionPhase)> {
        self.table
            .lock()
            .iter()
            .map(|(queue, assigned)| (queue.clone(), assigned.pq.phase()))
            .collect()
    }

    /// Rebalance every `rebalanceIntervalMs` until the dispatch loop stops.
    pub(crate) async fn run_periodically(self: Arc<Self>) {
        let interval = self.config.rebalance_interval();
        while self.dispatch.wait_or_shutdown(interval).await {
            for subscription in &self.subscriptions {
                self.session.invalidate_route(subscription.topic());
            }
            if let Err(e) = self.rebalance().await {
                warn!(group = self.session.identity(), error = %e, "Rebalance failed");
            }
        }
    }

    /// Re-read the group and the routes, then drop and add queues to match this
    /// member's share.
    pub(crate) async fn rebalance(&self) -> Result<(), ClientError> {
        let _running = self.running.lock().await;
        if self.dispatch.is_stopped() {
            return Ok(());
        }
        let wanted = self.allocate().await?;
        let (removed, added) = {
            let mut table = self.table.lock();
            let stale: Vec<MessageQueue> = table
                .keys()
                .filter(|queue| !wanted.contains_key(*queue))
                .cloned()
                .collect();
            let removed: Vec<(MessageQueue, Assigned)> = stale
                .into_iter()
                .filter_map(|queue| table.remove(&queue).map(|assigned| (queue, assigned)))
                .collect();
            let added: Vec<(MessageQueue, Arc<Subscription>)> = wanted
                .into_iter()
                .filter(|(queue, _)| !table.contains_key(queue))
                .collect();
            (removed, added)
        };

        for (queue, assigned) in removed {
            self.release(&queue, assigned).await;
        }
        for (queue, subscription) in added {
            let offset = self.start_offset(&queue).await?;
            let pq = Arc::new(ProcessQueue::new(queue.clone()));
            let task = PullTask {
                session: self.session.clone(),
                dispatch: Arc::clone(&self.dispatch),
                offsets: Arc::clone(&self.offsets),
                config: self.config.clone(),
                subscription,
                pq: Arc::clone(&pq),
            };
            let pull = self.session.spawn(task.run(offset))?;
            info!(group = self.session.identity(), queue = %queue, offset, "Queue assigned");
            self.table.lock().insert(queue, Assigned { pq, pull });
        }
        Ok(())
    }

    async fn allocate(&self) -> Result<BTreeMap<MessageQueue, Arc<Subscription>>, ClientError> {
        let transport = self.session.transport();
        let group = self.session.identity();
        let client_id = self.session.client_id();
        let members = match self.config.message_model {
            MessageModel::Clustering => {
                // Registering again keeps the membership alive if the broker lost it.
                transport.register_consumer(group, client_id).await?;
                Some(transport.consumer_ids(group).await?)
            }
            MessageModel::Broadcasting => None,
        };

        let mut wanted = BTreeMap::new();
        for subscription in &self.subscriptions {
            let route = self.session.route(subscription.topic()).await?;
            let assigned = match &members {
                Some(members) => allocate_averagely(&route, members, client_id),
                None => route.to_vec(),
            };
            debug!(
                group,
                topic = subscription.topic(),
                assigned = assigned.len(),
                total = route.len(),
                "Queues allocated"
            );
            for queue in assigned {
                wanted.insert(queue, Arc::clone(subscription));
            }
        }
        Ok(wanted)
    }

    /// Stop pulling `queue`, let a running orderly batch finish and hand its offset over.
    async fn release(&self, queue: &MessageQueue, assigned: Assigned) {
        assigned.pq.mark_dropped();
        assigned.pull.abort();
        if !assigned.pq.wait_idle(self.session.drain_timeout()).await {
            warn!(
                group = self.session.identity(),
                queue = %queue,
                "Orderly batch still running on a released queue"
            );
        }
        self.offsets.persist_and_remove(queue).await;
        info!(group = self.session.identity(), queue = %queue, "Queue released");
    }

    async fn start_offset(&self, queue: &MessageQueue) -> Result<i64, ClientError> {
        if let Some(offset) = self.offsets.read_from_store(queue).await? {
            if offset >= 0 {
                debug!(queue = %queue, offset, "Resume from committed offset");
                return Ok(offset);
            }
        }
        let transport = self.session.transport();
        let offset = match self.policy {
            ConsumeFromWhere::First => transport.min_offset(queue).await?,
            ConsumeFromWhere::Last => transport.max_offset(queue).await?,
            ConsumeFromWhere::Timestamp(timestamp) => {
                transport.search_offset(queue, timestamp).await?
            }
        };
        debug!(
            queue = %queue,
            offset,
            policy = ?self.policy,
            "No committed offset, starting from policy"
        );
        self.offsets.update(queue, offset, false);
        Ok(offset)
    }

    /// Drop every assigned queue and hand back their pull loops. No rebalance runs
    /// afterwards.
    pub(crate) async fn release_all(&self) -> Vec<JoinHandle<()>> {
        let _running = self.running.lock().await;
        self.take_all()
    }

    /// Like `release_all`, without waiting for a rebalance in progress.
    pub(crate) fn abort_all(&self) {
        for pull in self.take_all() {
            pull.abort();
        }
    }

    fn take_all(&self) -> Vec<JoinHandle<()>> {
        let table = std::mem::take(&mut *self.table.lock());
        table
            .into_values()
            .map(|assigned| {
                assigned.pq.mark_dropped();
                assigned.pull
            })
            .collect()
    }
}

/// Average allocation: sorted members take contiguous, near-equal ranges of the
/// sorted queues; the first `queues % members` members take one extra.
///
/// Returns nothing if `me` is not a member.
pub(crate) fn allocate_averagely(
    queues: &[MessageQueue],
    members: &[String],
    me: &str,
) -> Vec<MessageQueue> {
    let mut members: Vec<&String> = members.iter().collect();
    members.sort();
    members.dedup();
    let index = match members.iter().position(|member| member.as_str() == me) {
        Some(index) => index,
        None => return Vec::new(),
    };

    let mut queues = queues.to_vec();
    queues.sort();

    let count = members.len();
    let base = queues.len() / count;
    let extra = queues.len() % count;
    let start = index * base + index.min(extra);
    let len = base + usize::from(index < extra);
    queues.into_iter().skip(start).take(len).collect()
}

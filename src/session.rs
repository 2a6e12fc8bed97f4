//!
//! This module defines the connection lifecycle shared by producers and consumers.
//!
//! A [`Session`] moves `Created -> Started -> Stopped` exactly once. Every send and
//! receive path checks the state first, so work submitted after `stop()` fails
//! with a lifecycle error instead of racing the shutdown.
//!
use crate::config::{ClientConfig, RetryPolicy};
use crate::error::ClientError;
use crate::route::{MessageQueue, RouteManager};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Distinguishes sessions created from the same config within one process.
static SESSION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopped,
}

/// Counts work that a graceful stop has to wait for.
#[derive(Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

pub(crate) struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is in flight.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for in-flight work, giving up after `timeout`. Returns whether it drained.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.drained()).await.is_ok()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

struct SessionInner {
    identity: String,
    client_id: String,
    retry: RetryPolicy,
    drain_timeout: Duration,
    routes: RouteManager,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    /// Serializes `start` and `stop`; held across the connect phase.
    transition: tokio::sync::Mutex<()>,
    inflight: Arc<InFlight>,
    runtime: Mutex<Option<Handle>>,
}

/// Connection lifecycle to a broker cluster for one producer or consumer identity.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Build a session in the `Created` state. No I/O happens until [`Session::start`].
    ///
    /// # Errors
    /// Raise ClientError::BadAddress if `addresses` contains no `host:port` entry.
    pub fn create(
        identity: &str,
        addresses: &str,
        retry: RetryPolicy,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let mut config = ClientConfig::new(identity, addresses);
        config.retry = retry;
        Session::from_config(&config, transport)
    }

    /// Build a session from `config`. The client id is `instance@pid` followed by a
    /// sequence number unique within the process.
    pub fn from_config(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let mut config = config.clone();
        config.apply_env();
        config.validate()?;
        let routes = RouteManager::new(&config.namesrv_addr)?;
        let sequence = SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Ok(Session {
            inner: Arc::new(SessionInner {
                identity: config.group.clone(),
                client_id: format!("{}#{}", config.client_id(), sequence),
                retry: config.retry.clone(),
                drain_timeout: config.drain_timeout(),
                routes,
                transport,
                state: Mutex::new(SessionState::Created),
                transition: tokio::sync::Mutex::new(()),
                inflight: Arc::new(InFlight::default()),
                runtime: Mutex::new(None),
            }),
        })
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn reachable_endpoints(&self) -> Vec<std::net::SocketAddr> {
        self.inner.routes.reachable()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn drain_timeout(&self) -> Duration {
        self.inner.drain_timeout
    }

    /// Resolve endpoints and connect to every reachable one.
    ///
    /// # Errors
    /// Raise ClientError::AlreadyStarted on a second call, ClientError::Stopped once
    /// stopped, and ClientError::Connection if no endpoint accepts a connection. A
    /// failed start leaves the session in `Created` so it may be retried.
    pub async fn start(&self) -> Result<(), ClientError> {
        let _transition = self.inner.transition.lock().await;
        match self.state() {
            SessionState::Started => {
                return Err(ClientError::AlreadyStarted(self.inner.identity.clone()))
            }
            SessionState::Stopped => return Err(ClientError::Stopped(self.inner.identity.clone())),
            SessionState::Created => {}
        }

        let connect_timeout = self.inner.retry.connect_timeout();
        let mut reachable = Vec::new();
        for endpoint in self.inner.routes.resolve().await {
            let connect = self.inner.transport.connect(endpoint);
            match tokio::time::timeout(connect_timeout, connect).await {
                Ok(Ok(())) => reachable.push(endpoint),
                Ok(Err(e)) => {
                    warn!(
                        identity = %self.inner.identity,
                        %endpoint,
                        error = %e,
                        "Endpoint is not reachable"
                    );
                }
                Err(_) => {
                    warn!(
                        identity = %self.inner.identity,
                        %endpoint,
                        "Timeout when establishing connection"
                    );
                }
            }
        }

        if reachable.is_empty() {
            return Err(ClientError::Connection(self.inner.routes.endpoints().join(";")));
        }

        info!(
            identity = %self.inner.identity,
            client_id = %self.inner.client_id,
            endpoints = reachable.len(),
            "Session started"
        );
        self.inner.routes.set_reachable(reachable);
        *self.inner.runtime.lock() = Some(Handle::current());
        *self.inner.state.lock() = SessionState::Started;
        Ok(())
    }

    /// Reject new work, then wait for in-flight sends and callbacks to finish.
    ///
    /// Idempotent. In-flight work still running after the drain timeout is abandoned.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let _transition = self.inner.transition.lock().await;
        if !self.mark_stopped() {
            return Ok(());
        }
        if !self.inner.inflight.drain(self.inner.drain_timeout).await {
            warn!(
                identity = %self.inner.identity,
                abandoned = self.inner.inflight.count(),
                "Drain timeout elapsed, abandoning in-flight operations"
            );
        }
        info!(identity = %self.inner.identity, "Session stopped");
        Ok(())
    }

    /// Stop without waiting. Pending asynchronous callbacks may never run.
    pub fn shutdown_now(&self) {
        if self.mark_stopped() {
            let abandoned = self.inner.inflight.count();
            if abandoned > 0 {
                warn!(
                    identity = %self.inner.identity,
                    abandoned,
                    "Forced stop with operations in flight"
                );
            }
            info!(identity = %self.inner.identity, "Session stopped");
        }
    }

    /// Returns false if the session was already stopped.
    fn mark_stopped(&self) -> bool {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Stopped {
            return false;
        }
        *state = SessionState::Stopped;
        true
    }

    pub fn ensure_started(&self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Started => Ok(()),
            SessionState::Created => Err(ClientError::NotStarted(self.inner.identity.clone())),
            SessionState::Stopped => Err(ClientError::Stopped(self.inner.identity.clone())),
        }
    }

    pub(crate) fn enter(&self) -> InFlightGuard {
        self.inner.inflight.enter()
    }

    /// Run `future` on the runtime captured at start, counted as in-flight work.
    pub(crate) fn spawn<F>(&self, future: F) -> Result<JoinHandle<()>, ClientError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self
            .inner
            .runtime
            .lock()
            .clone()
            .ok_or_else(|| ClientError::NotStarted(self.inner.identity.clone()))?;
        let guard = self.enter();
        Ok(handle.spawn(async move {
            future.await;
            drop(guard);
        }))
    }

    /// Queues of `topic`, from cache or the transport.
    pub(crate) async fn route(&self, topic: &str) -> Result<Arc<Vec<MessageQueue>>, ClientError> {
        if let Some(queues) = self.inner.routes.route(topic) {
            return Ok(queues);
        }
        let queues = self.inner.transport.route(topic).await?;
        if queues.is_empty() {
            return Err(ClientError::TopicNotFound(topic.to_owned()));
        }
        debug!(topic, queues = queues.len(), "Topic route updated");
        Ok(self.inner.routes.update(topic, queues))
    }

    pub(crate) fn invalidate_route(&self, topic: &str) {
        self.inner.routes.invalidate(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryBroker;
    use std::net::SocketAddr;

    fn session(broker: &InMemoryBroker, addrs: &str) -> Result<Session, ClientError> {
        Session::create("g", addrs, RetryPolicy::default(), Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_lifecycle() -> Result<(), ClientError> {
        let broker = InMemoryBroker::new();
        let session = session(&broker, "127.0.0.1:9876")?;
        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(session.ensure_started(), Err(ClientError::NotStarted(_))));

        session.start().await?;
        assert_eq!(session.state(), SessionState::Started);
        session.ensure_started()?;

        session.stop().await?;
        assert_eq!(session.state(), SessionState::Stopped);
        let error = session.ensure_started().unwrap_err();
        assert!(error.is_lifecycle());
        assert!(matches!(error, ClientError::Stopped(_)));

        // Stop is idempotent; a stopped session never restarts.
        session.stop().await?;
        assert!(matches!(session.start().await, Err(ClientError::Stopped(_))));
        Ok(())
    }

    #[test]
    fn test_client_ids_are_unique_per_session() -> Result<(), ClientError> {
        let broker = InMemoryBroker::new();
        let config = ClientConfig::new("g", "127.0.0.1:9876");
        let first = Session::from_config(&config, Arc::new(broker.clone()))?;
        let second = Session::from_config(&config, Arc::new(broker.clone()))?;
        let prefix = format!("DEFAULT@{}#", std::process::id());
        assert!(first.client_id().starts_with(&prefix));
        assert!(second.client_id().starts_with(&prefix));
        assert_ne!(first.client_id(), second.client_id());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_twice_keeps_connectivity() -> Result<(), ClientError> {
        let broker = InMemoryBroker::new();
        let session = session(&broker, "127.0.0.1:9876;127.0.0.1:9877")?;
        session.start().await?;
        let before = session.reachable_endpoints();

        assert!(matches!(session.start().await, Err(ClientError::AlreadyStarted(_))));
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.reachable_endpoints(), before);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_reachable_endpoint() -> Result<(), ClientError> {
        let broker = InMemoryBroker::new();
        let up: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        broker.set_reachable(&[up]);
        let session = session(&broker, "127.0.0.1:9876;127.0.0.1:9877")?;

        assert!(matches!(session.start().await, Err(ClientError::Connection(_))));
        assert_eq!(session.state(), SessionState::Created);

        broker.set_reachable(&["127.0.0.1:9877".parse().unwrap()]);
        session.start().await?;
        let expected: SocketAddr = "127.0.0.1:9877".parse().unwrap();
        assert_eq!(session.reachable_endpoints(), [expected]);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight() -> Result<(), ClientError> {
        let broker = InMemoryBroker::new();
        let session = session(&broker, "127.0.0.1:9876")?;
        session.start().await?;

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        session.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(());
        })?;
        session.stop().await?;
        // The spawned work completed before stop returned.
        assert!(rx.try_recv().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_now_is_immediate() -> Result<(), ClientError> {
        let broker = InMemoryBroker::new();
        let session = session(&broker, "127.0.0.1:9876")?;
        session.start().await?;
        session.spawn(tokio::time::sleep(Duration::from_secs(60)))?;
        session.shutdown_now();
        assert_eq!(session.state(), SessionState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn test_route_cache_and_missing_topic() -> Result<(), ClientError> {
        let broker = InMemoryBroker::with_topic("T1");
        let session = session(&broker, "127.0.0.1:9876")?;
        assert_eq!(session.route("T1").await?.len(), 4);
        assert!(matches!(session.route("T2").await, Err(ClientError::TopicNotFound(_))));
        Ok(())
    }
}

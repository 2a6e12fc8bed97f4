//!
//! This module defines RouteManager to resolve name server endpoints and cache routes
//! for each topic in use.
//!
use crate::error::ClientError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// One partition of a topic, hosted by a named broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: i32,
}

impl MessageQueue {
    pub fn new(topic: &str, broker_name: &str, queue_id: i32) -> Self {
        Self {
            topic: topic.to_owned(),
            broker_name: broker_name.to_owned(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.topic, self.broker_name, self.queue_id)
    }
}

/// RouteManager maintains endpoints and route entries for each topic.
pub(crate) struct RouteManager {
    /// Endpoints remain constant after construction.
    endpoints: Vec<String>,

    /// Addresses that accepted a connection when the session started.
    reachable: RwLock<Vec<SocketAddr>>,

    /// Topic routes are dropped whenever a send through them fails transiently.
    topic_routes: Mutex<HashMap<String, Arc<Vec<MessageQueue>>>>,
}

impl RouteManager {
    pub(crate) fn new(addrs: &str) -> Result<Self, ClientError> {
        let endpoints: Vec<String> = addrs
            .split(';')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .filter_map(|addr| match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Some(addr.to_owned())
                }
                _ => {
                    warn!(address = addr, "Skip malformed name server address");
                    None
                }
            })
            .collect();

        if endpoints.is_empty() {
            return Err(ClientError::BadAddress(addrs.to_owned()));
        }

        Ok(Self {
            endpoints,
            reachable: RwLock::new(Vec::new()),
            topic_routes: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Resolve every endpoint, hostnames included. Unresolvable entries are skipped.
    pub(crate) async fn resolve(&self) -> Vec<SocketAddr> {
        let mut resolved = Vec::new();
        for endpoint in &self.endpoints {
            match tokio::net::lookup_host(endpoint.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if !resolved.contains(&addr) {
                            resolved.push(addr);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Failed to resolve name server address"
                    );
                }
            }
        }
        resolved
    }

    pub(crate) fn set_reachable(&self, addrs: Vec<SocketAddr>) {
        *self.reachable.write() = addrs;
    }

    pub(crate) fn reachable(&self) -> Vec<SocketAddr> {
        self.reachable.read().clone()
    }

    pub(crate) fn route(&self, topic: &str) -> Option<Arc<Vec<MessageQueue>>> {
        self.topic_routes.lock().get(topic).map(Arc::clone)
    }

    pub(crate) fn update(
        &self,
        topic: &str,
        mut queues: Vec<MessageQueue>,
    ) -> Arc<Vec<MessageQueue>> {
        queues.sort();
        let queues = Arc::new(queues);
        self.topic_routes
            .lock()
            .insert(topic.to_owned(), Arc::clone(&queues));
        queues
    }

    pub(crate) fn invalidate(&self, topic: &str) {
        self.topic_routes.lock().remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_manager_new() -> Result<(), Box<dyn std::error::Error>> {
        let addrs = "8.8.8.8:80;4.4.4.4.3:80";
        let manager = RouteManager::new(addrs)?;
        assert_eq!(manager.endpoints().len(), 2);
        Ok(())
    }

    #[test]
    fn test_malformed_entries_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let manager = RouteManager::new(" cdh2:9876 ;;cdh2;:9877; cdh2:notaport;cdh2:9877")?;
        assert_eq!(manager.endpoints(), ["cdh2:9876", "cdh2:9877"]);
        Ok(())
    }

    #[test]
    fn test_no_valid_address() {
        assert!(matches!(
            RouteManager::new(";;"),
            Err(ClientError::BadAddress(_))
        ));
        assert!(matches!(
            RouteManager::new("localhost"),
            Err(ClientError::BadAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_ip_literals() -> Result<(), ClientError> {
        let manager = RouteManager::new("127.0.0.1:9876;127.0.0.1:9876;127.0.0.1:9877")?;
        let resolved = manager.resolve().await;
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0], "127.0.0.1:9876".parse::<SocketAddr>().unwrap());
        Ok(())
    }

    #[test]
    fn test_route_cache() -> Result<(), ClientError> {
        let manager = RouteManager::new("127.0.0.1:9876")?;
        assert!(manager.route("T1").is_none());
        let queues = manager.update(
            "T1",
            vec![MessageQueue::new("T1", "b1", 1), MessageQueue::new("T1", "b1", 0)],
        );
        assert_eq!(queues[0].queue_id, 0);
        assert_eq!(manager.route("T1").map(|q| q.len()), Some(2));
        manager.invalidate("T1");
        assert!(manager.route("T1").is_none());
        Ok(())
    }

    #[test]
    fn test_message_queue_display() {
        let queue = MessageQueue::new("TopicOrder", "broker-a", 3);
        assert_eq!(queue.to_string(), "TopicOrder@broker-a#3");
    }
}

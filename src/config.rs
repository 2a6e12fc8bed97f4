//!
//! Configuration of sessions, producers and push consumers.
//!
//! Every struct deserializes from camelCase JSON and falls back to defaults for
//! absent fields, so a config file only lists what it overrides.
//!
use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when no name server address is configured.
pub const NAMESRV_ADDR_ENV: &str = "NAMESRV_ADDR";

/// Upper bound on configured pauses: redelivery backoff, queue suspension, rebalance.
pub const MAX_PAUSE_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempts per synchronous send, the first one included.
    pub max_attempts: u32,
    pub per_attempt_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout_ms: 3000,
            connect_timeout_ms: 3000,
        }
    }
}

impl RetryPolicy {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Name server addresses separated by `;`, e.g. `cdh2:9876;cdh2:9877`.
    pub namesrv_addr: String,
    /// Producer or consumer group name.
    pub group: String,
    pub instance_name: String,
    pub retry: RetryPolicy,
    /// Upper bound on how long a graceful shutdown waits for in-flight work.
    pub drain_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namesrv_addr: String::new(),
            group: String::new(),
            instance_name: "DEFAULT".to_owned(),
            retry: RetryPolicy::default(),
            drain_timeout_ms: 3000,
        }
    }
}

impl ClientConfig {
    pub fn new(group: &str, namesrv_addr: &str) -> Self {
        Self {
            group: group.to_owned(),
            namesrv_addr: namesrv_addr.to_owned(),
            ..Default::default()
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Fill an empty name server address from `NAMESRV_ADDR`.
    pub fn apply_env(&mut self) {
        if self.namesrv_addr.trim().is_empty() {
            if let Ok(addr) = std::env::var(NAMESRV_ADDR_ENV) {
                self.namesrv_addr = addr;
            }
        }
    }

    /// `instance@pid`; each session appends its own sequence number to it.
    pub fn client_id(&self) -> String {
        format!("{}@{}", self.instance_name, std::process::id())
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.group.trim().is_empty() {
            return Err(ClientError::Config("group must not be empty".to_owned()));
        }
        if self.namesrv_addr.trim().is_empty() {
            return Err(ClientError::Config(
                "namesrvAddr must not be empty".to_owned(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ClientError::Config(
                "retry.maxAttempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProducerConfig {
    #[serde(flatten)]
    pub client: ClientConfig,
}

impl ProducerConfig {
    pub fn new(group: &str, namesrv_addr: &str) -> Self {
        Self {
            client: ClientConfig::new(group, namesrv_addr),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ProducerConfig = serde_json::from_str(&content)?;
        config.client.apply_env();
        config.client.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageModel {
    /// Queues are shared out among the group, offsets live on the broker.
    #[default]
    Clustering,
    /// Every member receives every message, offsets stay with the member.
    Broadcasting,
}

/// Where a group starts reading a queue it has never committed an offset for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsumeFromWhere {
    First,
    #[default]
    Last,
    /// Milliseconds since the Unix epoch.
    Timestamp(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerConfig {
    #[serde(flatten)]
    pub client: ClientConfig,
    pub message_model: MessageModel,
    pub consume_from_where: ConsumeFromWhere,
    /// Number of workers that run handlers concurrently.
    pub consume_thread_min: usize,
    pub consume_message_batch_max_size: usize,
    pub pull_batch_size: u32,
    pub pull_interval_ms: u64,
    /// Pause before pulling again from a queue that had nothing new.
    pub pull_idle_interval_ms: u64,
    pub pull_exception_delay_ms: u64,
    /// Cached messages per queue above which pulling pauses.
    pub pull_threshold_for_queue: usize,
    pub max_reconsume_times: u32,
    pub redelivery_backoff_ms: u64,
    pub max_redelivery_backoff_ms: u64,
    pub suspend_current_queue_time_ms: u64,
    pub persist_offset_interval_ms: u64,
    /// Period of re-reading the group members and re-allocating queues.
    pub rebalance_interval_ms: u64,
    /// Directory for broadcasting offsets; offsets stay in memory when unset.
    pub offset_store_dir: Option<PathBuf>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            message_model: MessageModel::default(),
            consume_from_where: ConsumeFromWhere::default(),
            consume_thread_min: 20,
            consume_message_batch_max_size: 1,
            pull_batch_size: 32,
            pull_interval_ms: 0,
            pull_idle_interval_ms: 200,
            pull_exception_delay_ms: 3000,
            pull_threshold_for_queue: 1000,
            max_reconsume_times: 16,
            redelivery_backoff_ms: 1000,
            max_redelivery_backoff_ms: 60_000,
            suspend_current_queue_time_ms: 1000,
            persist_offset_interval_ms: 5000,
            rebalance_interval_ms: 20_000,
            offset_store_dir: None,
        }
    }
}

impl ConsumerConfig {
    pub fn new(group: &str, namesrv_addr: &str) -> Self {
        Self {
            client: ClientConfig::new(group, namesrv_addr),
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ConsumerConfig = serde_json::from_str(&content)?;
        config.client.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        self.client.validate()?;
        if self.consume_thread_min == 0 {
            return Err(ClientError::Config(
                "consumeThreadMin must be at least 1".to_owned(),
            ));
        }
        if self.consume_message_batch_max_size == 0 || self.pull_batch_size == 0 {
            return Err(ClientError::Config(
                "batch sizes must be at least 1".to_owned(),
            ));
        }
        for (name, value) in [
            ("maxRedeliveryBackoffMs", self.max_redelivery_backoff_ms),
            ("suspendCurrentQueueTimeMs", self.suspend_current_queue_time_ms),
            ("rebalanceIntervalMs", self.rebalance_interval_ms),
        ] {
            if value > MAX_PAUSE_MS {
                return Err(ClientError::Config(format!(
                    "{} must not exceed {}",
                    name, MAX_PAUSE_MS
                )));
            }
        }
        if self.rebalance_interval_ms == 0 {
            return Err(ClientError::Config(
                "rebalanceIntervalMs must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Wait before the n-th redelivery of a message, doubling from the base.
    pub fn redelivery_backoff(&self, reconsume_times: u32) -> Duration {
        let exponent = reconsume_times.saturating_sub(1).min(20);
        let backoff = self.redelivery_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(backoff.min(self.max_redelivery_backoff_ms))
    }

    pub fn suspend_current_queue_time(&self) -> Duration {
        Duration::from_millis(self.suspend_current_queue_time_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub fn pull_idle_interval(&self) -> Duration {
        Duration::from_millis(self.pull_idle_interval_ms)
    }

    pub fn pull_exception_delay(&self) -> Duration {
        Duration::from_millis(self.pull_exception_delay_ms)
    }

    pub fn persist_offset_interval(&self) -> Duration {
        Duration::from_millis(self.persist_offset_interval_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"
        {"namesrvAddr": "cdh2:9876;cdh2:9877", "group": "seckill_consumer", "consumeThreadMin": 3,
         "consumeFromWhere": "first", "messageModel": "broadcasting", "retry": {"maxAttempts": 4}}
        "#;
        let config: ConsumerConfig = serde_json::from_str(json)?;
        config.validate()?;
        assert_eq!(config.client.group, "seckill_consumer");
        assert_eq!(config.client.namesrv_addr, "cdh2:9876;cdh2:9877");
        assert_eq!(config.client.instance_name, "DEFAULT");
        assert_eq!(config.client.retry.max_attempts, 4);
        assert_eq!(config.client.retry.per_attempt_timeout_ms, 3000);
        assert_eq!(config.consume_thread_min, 3);
        assert_eq!(config.consume_from_where, ConsumeFromWhere::First);
        assert_eq!(config.message_model, MessageModel::Broadcasting);
        assert_eq!(config.max_reconsume_times, 16);
        Ok(())
    }

    #[test]
    fn test_timestamp_policy_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"
        {"group": "g", "namesrvAddr": "a:1", "consumeFromWhere": {"timestamp": 1700000000000}}
        "#;
        let config: ConsumerConfig = serde_json::from_str(json)?;
        assert_eq!(
            config.consume_from_where,
            ConsumeFromWhere::Timestamp(1_700_000_000_000)
        );
        Ok(())
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            ProducerConfig::default().client.validate(),
            Err(ClientError::Config(_))
        ));

        let mut config = ConsumerConfig::new("g", "127.0.0.1:9876");
        assert!(config.validate().is_ok());
        config.consume_thread_min = 0;
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::new("g", "127.0.0.1:9876");
        config.suspend_current_queue_time_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
        config.suspend_current_queue_time_ms = MAX_PAUSE_MS;
        config.max_redelivery_backoff_ms = MAX_PAUSE_MS + 1;
        assert!(config.validate().is_err());
        config.max_redelivery_backoff_ms = 60_000;
        config.rebalance_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut producer = ProducerConfig::new("g", "127.0.0.1:9876");
        producer.client.retry.max_attempts = 0;
        assert!(producer.client.validate().is_err());
    }

    #[test]
    fn test_redelivery_backoff_grows_and_caps() {
        let mut config = ConsumerConfig::new("g", "a:1");
        config.redelivery_backoff_ms = 100;
        config.max_redelivery_backoff_ms = 1000;
        assert_eq!(config.redelivery_backoff(1), Duration::from_millis(100));
        assert_eq!(config.redelivery_backoff(2), Duration::from_millis(200));
        assert_eq!(config.redelivery_backoff(3), Duration::from_millis(400));
        assert_eq!(config.redelivery_backoff(10), Duration::from_millis(1000));
        assert_eq!(config.redelivery_backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_producer_config_from_file() -> Result<(), Box<dyn std::error::Error>> {
        let path =
            std::env::temp_dir().join(format!("producer-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"group": "seckill_producerGroup", "namesrvAddr": "127.0.0.1:9876",
                "instanceName": "producer1", "retry": {"maxAttempts": 3}}"#,
        )?;
        let config = ProducerConfig::from_json_file(&path);
        std::fs::remove_file(&path)?;
        let config = config?;
        assert_eq!(config.client.instance_name, "producer1");
        assert!(config.client.client_id().starts_with("producer1@"));
        Ok(())
    }
}

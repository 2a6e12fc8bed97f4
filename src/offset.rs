//!
//! Consume progress per queue.
//!
//! Clustering groups commit to the broker; broadcasting members keep offsets to
//! themselves, optionally in a JSON file so a restart resumes where it stopped.
//!
use crate::config::MessageModel;
use crate::error::ClientError;
use crate::route::MessageQueue;
use crate::transport::Transport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueOffset {
    queue: MessageQueue,
    offset: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OffsetSerializeWrapper {
    offset_table: Vec<QueueOffset>,
}

pub(crate) struct OffsetStore {
    group: String,
    model: MessageModel,
    transport: Arc<dyn Transport>,
    table: Mutex<HashMap<MessageQueue, i64>>,
    path: Option<PathBuf>,
}

impl OffsetStore {
    pub(crate) fn new(
        group: &str,
        model: MessageModel,
        transport: Arc<dyn Transport>,
        dir: Option<PathBuf>,
    ) -> Self {
        let path = match model {
            MessageModel::Broadcasting => {
                dir.map(|dir| dir.join(format!("{}.offsets.json", group)))
            }
            MessageModel::Clustering => None,
        };
        Self {
            group: group.to_owned(),
            model,
            transport,
            table: Mutex::new(HashMap::new()),
            path,
        }
    }

    /// Read a previously persisted local table, if there is one.
    pub(crate) fn load(&self) -> Result<(), ClientError> {
        let path = match &self.path {
            Some(path) if path.exists() => path,
            _ => return Ok(()),
        };
        let content = std::fs::read_to_string(path)?;
        let wrapper: OffsetSerializeWrapper = serde_json::from_str(&content)?;
        let mut table = self.table.lock();
        for entry in wrapper.offset_table {
            table.insert(entry.queue, entry.offset);
        }
        debug!(group = %self.group, entries = table.len(), "Loaded local offsets");
        Ok(())
    }

    /// Record progress. With `increase_only` an older offset never overwrites a newer
    /// one.
    pub(crate) fn update(&self, queue: &MessageQueue, offset: i64, increase_only: bool) {
        let mut table = self.table.lock();
        let entry = table.entry(queue.clone()).or_insert(offset);
        if !increase_only || offset > *entry {
            *entry = offset;
        }
    }

    pub(crate) fn get(&self, queue: &MessageQueue) -> Option<i64> {
        self.table.lock().get(queue).copied()
    }

    /// Committed offset as stored: broker side for clustering, local table otherwise.
    pub(crate) async fn read_from_store(
        &self,
        queue: &MessageQueue,
    ) -> Result<Option<i64>, ClientError> {
        match self.model {
            MessageModel::Clustering => {
                let offset = self.transport.query_offset(&self.group, queue).await?;
                if let Some(offset) = offset {
                    self.update(queue, offset, false);
                }
                Ok(offset)
            }
            MessageModel::Broadcasting => Ok(self.get(queue)),
        }
    }

    fn snapshot(&self) -> Vec<(MessageQueue, i64)> {
        self.table
            .lock()
            .iter()
            .map(|(queue, offset)| (queue.clone(), *offset))
            .collect()
    }

    /// Push every recorded offset to its store. Failures are logged and retried next time.
    pub(crate) async fn persist_all(&self) {
        let snapshot = self.snapshot();
        match self.model {
            MessageModel::Clustering => {
                for (queue, offset) in snapshot {
                    self.commit_remote(&queue, offset).await;
                }
            }
            MessageModel::Broadcasting => self.persist_local(snapshot),
        }
    }

    /// Persist the offset of a queue given up in a rebalance, then forget it so later
    /// persists leave the new owner's progress alone.
    pub(crate) async fn persist_and_remove(&self, queue: &MessageQueue) {
        let offset = self.table.lock().remove(queue);
        match (self.model, offset) {
            (MessageModel::Clustering, Some(offset)) => self.commit_remote(queue, offset).await,
            (MessageModel::Clustering, None) => {}
            (MessageModel::Broadcasting, _) => self.persist_local(self.snapshot()),
        }
    }

    async fn commit_remote(&self, queue: &MessageQueue, offset: i64) {
        if let Err(e) = self.transport.commit_offset(&self.group, queue, offset).await {
            warn!(
                group = %self.group,
                queue = %queue,
                offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }

    fn persist_local(&self, snapshot: Vec<(MessageQueue, i64)>) {
        if let Err(e) = self.write_local(snapshot) {
            warn!(group = %self.group, error = %e, "Failed to persist local offsets");
        }
    }

    fn write_local(&self, snapshot: Vec<(MessageQueue, i64)>) -> Result<(), ClientError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let wrapper = OffsetSerializeWrapper {
            offset_table: snapshot
                .into_iter()
                .map(|(queue, offset)| QueueOffset { queue, offset })
                .collect(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&wrapper)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

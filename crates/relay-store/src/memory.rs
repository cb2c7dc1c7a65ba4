use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use relay_kernel::{
    Channel, ChannelValue, ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig,
    CheckpointId, CheckpointMetadata, CheckpointTuple, PendingWrite,
};

use crate::split::{
    apply_list_window, batch_is_replaceable, blob_refs, parent_config, prepare_put,
};
use crate::{CheckpointStore, ListQuery, StoreError};

type ThreadKey = (String, String);

struct StoredCheckpoint {
    parent: Option<CheckpointId>,
    row: Checkpoint,
    metadata: CheckpointMetadata,
}

#[derive(Default)]
struct Tables {
    checkpoints: HashMap<ThreadKey, BTreeMap<CheckpointId, StoredCheckpoint>>,
    blobs: HashMap<(ThreadKey, Channel, ChannelVersion), ChannelValue>,
    writes: HashMap<(ThreadKey, CheckpointId), Vec<PendingWrite>>,
}

/// Process-local store with the same table layout and split rules as the
/// durable backends. Useful for tests and throwaway runs.
pub struct MemoryStore {
    tables: Mutex<Option<Tables>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Some(Tables::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Tables>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn thread_key(config: &CheckpointConfig) -> ThreadKey {
    (config.thread_id.clone(), config.checkpoint_ns.clone())
}

impl Tables {
    fn tuple(
        &self,
        key: &ThreadKey,
        id: &CheckpointId,
        stored: &StoredCheckpoint,
    ) -> Result<CheckpointTuple, StoreError> {
        let mut checkpoint = stored.row.clone();
        for (channel, version) in blob_refs(&stored.row) {
            let Some(value) = self.blobs.get(&(key.clone(), channel, version.clone())) else {
                return Err(StoreError::UnresolvedBlob {
                    id: id.clone(),
                    channel,
                    version: version.to_string(),
                });
            };
            checkpoint.channel_values.insert(channel, value.clone());
        }
        let config = CheckpointConfig {
            thread_id: key.0.clone(),
            checkpoint_ns: key.1.clone(),
            checkpoint_id: Some(id.clone()),
        };
        let pending_writes = self
            .writes
            .get(&(key.clone(), id.clone()))
            .cloned()
            .unwrap_or_default();
        Ok(CheckpointTuple {
            parent_config: parent_config(&config, stored.parent.clone()),
            config,
            checkpoint,
            metadata: stored.metadata.clone(),
            pending_writes,
        })
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &ChannelVersions,
    ) -> Result<CheckpointConfig, StoreError> {
        let prepared = prepare_put(config, checkpoint, new_versions)?;
        let key = thread_key(config);

        let mut guard = self.lock();
        let tables = guard.as_mut().ok_or(StoreError::Closed)?;

        if let Some(parent) = prepared.parent.as_ref() {
            let known = tables
                .checkpoints
                .get(&key)
                .is_some_and(|rows| rows.contains_key(parent));
            if !known {
                return Err(StoreError::MissingParent {
                    thread_id: config.thread_id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let written: Vec<(Channel, ChannelVersion)> = prepared
            .blobs
            .iter()
            .map(|blob| (blob.channel, blob.version.clone()))
            .collect();
        for (channel, version) in &prepared.existing_refs {
            let stored = tables
                .blobs
                .contains_key(&(key.clone(), *channel, version.clone()));
            if !stored && !written.contains(&(*channel, version.clone())) {
                return Err(StoreError::MissingBlob {
                    id: checkpoint.id.clone(),
                    channel: *channel,
                    version: version.to_string(),
                });
            }
        }

        for blob in prepared.blobs {
            tables
                .blobs
                .entry((key.clone(), blob.channel, blob.version))
                .or_insert(blob.value);
        }

        let rows = tables.checkpoints.entry(key).or_default();
        match rows.get_mut(&checkpoint.id) {
            Some(existing) => {
                existing.row = prepared.row;
                existing.metadata = metadata.clone();
            }
            None => {
                rows.insert(
                    checkpoint.id.clone(),
                    StoredCheckpoint {
                        parent: prepared.parent,
                        row: prepared.row,
                        metadata: metadata.clone(),
                    },
                );
            }
        }

        Ok(config.at(checkpoint.id.clone()))
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(Channel, ChannelValue)],
        task_id: &str,
        task_path: &str,
    ) -> Result<(), StoreError> {
        let checkpoint_id = config
            .checkpoint_id
            .clone()
            .ok_or(StoreError::MissingCheckpointId)?;
        let replace = batch_is_replaceable(writes);

        let mut guard = self.lock();
        let tables = guard.as_mut().ok_or(StoreError::Closed)?;
        let entries = tables
            .writes
            .entry((thread_key(config), checkpoint_id))
            .or_default();

        for (channel, value) in writes {
            let mut next_seq = entries.iter().map(|w| w.seq + 1).max().unwrap_or(0);
            if replace {
                if let Some(position) = entries
                    .iter()
                    .position(|w| w.task_id == task_id && w.channel == *channel)
                {
                    next_seq = entries.remove(position).seq;
                }
            }
            entries.push(PendingWrite {
                task_id: task_id.to_string(),
                task_path: task_path.to_string(),
                channel: *channel,
                value: value.clone(),
                seq: next_seq,
            });
            entries.sort_by_key(|w| w.seq);
        }
        Ok(())
    }

    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>, StoreError> {
        let guard = self.lock();
        let tables = guard.as_ref().ok_or(StoreError::Closed)?;
        let key = thread_key(config);
        let Some(rows) = tables.checkpoints.get(&key) else {
            return Ok(None);
        };
        let found = match config.checkpoint_id.as_ref() {
            Some(id) => rows.get_key_value(id),
            None => rows.iter().next_back(),
        };
        found
            .map(|(id, stored)| tables.tuple(&key, id, stored))
            .transpose()
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        query: &ListQuery,
    ) -> Result<Vec<CheckpointTuple>, StoreError> {
        let guard = self.lock();
        let tables = guard.as_ref().ok_or(StoreError::Closed)?;

        let mut tuples = Vec::new();
        for (key, rows) in &tables.checkpoints {
            if let Some(config) = config {
                if key.0 != config.thread_id || key.1 != config.checkpoint_ns {
                    continue;
                }
            }
            for (id, stored) in rows {
                if let Some(exact) = config.and_then(|c| c.checkpoint_id.as_ref()) {
                    if id != exact {
                        continue;
                    }
                }
                tuples.push(tables.tuple(key, id, stored)?);
            }
        }
        tuples.sort_by(|a, b| b.checkpoint.id.cmp(&a.checkpoint.id));
        Ok(apply_list_window(tuples, query))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.lock().take();
        Ok(())
    }
}

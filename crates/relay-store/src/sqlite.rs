use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use relay_kernel::{
    Channel, ChannelValue, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId,
    CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::{JsonCodec, PayloadCodec};
use crate::split::{
    apply_list_window, batch_is_replaceable, blob_refs, parent_config, prepare_put,
};
use crate::{CheckpointStore, ListQuery, StoreError};

const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed ledger. `rusqlite::Connection` is blocking, so every call runs
/// on the blocking pool behind one shared connection; each `put` is a single
/// transaction.
pub struct SqliteStore<C: PayloadCodec = JsonCodec> {
    conn: Arc<Mutex<Option<Connection>>>,
    codec: Arc<C>,
}

impl<C: PayloadCodec> Clone for SqliteStore<C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl SqliteStore<JsonCodec> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_codec(path, JsonCodec)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::in_memory_with_codec(JsonCodec)
    }
}

impl<C: PayloadCodec> SqliteStore<C> {
    pub fn open_with_codec(path: impl AsRef<Path>, codec: C) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Worker(format!("create data dir: {err}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::setup(conn, codec)
    }

    pub fn in_memory_with_codec(codec: C) -> Result<Self, StoreError> {
        Self::setup(Connection::open_in_memory()?, codec)
    }

    fn setup(conn: Connection, codec: C) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            codec: Arc::new(codec),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &C) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard.as_mut().ok_or(StoreError::Closed)?;
            f(conn, codec.as_ref())
        })
        .await
        .map_err(|err| StoreError::Worker(err.to_string()))?
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    if current < 1 {
        debug!(from = current, to = SCHEMA_VERSION, "migrating checkpoint schema");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                checkpoint_ns TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT NOT NULL,
                parent_checkpoint_id TEXT,
                checkpoint BLOB NOT NULL,
                metadata BLOB NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
            );

            CREATE TABLE IF NOT EXISTS channel_blobs (
                thread_id TEXT NOT NULL,
                checkpoint_ns TEXT NOT NULL DEFAULT '',
                channel TEXT NOT NULL,
                version TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_ns, channel, version)
            );

            CREATE TABLE IF NOT EXISTS pending_writes (
                thread_id TEXT NOT NULL,
                checkpoint_ns TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                task_path TEXT NOT NULL DEFAULT '',
                channel TEXT NOT NULL,
                value BLOB NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_pending_writes_task
            ON pending_writes(thread_id, checkpoint_ns, checkpoint_id, task_id, channel);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }
    Ok(())
}

fn encode<C: PayloadCodec, T: Serialize>(codec: &C, value: &T) -> Result<Vec<u8>, StoreError> {
    codec.encode(&serde_json::to_value(value)?)
}

fn decode<C: PayloadCodec, T: DeserializeOwned>(codec: &C, bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_value(codec.decode(bytes)?)?)
}

fn parse_channel(raw: &str) -> Result<Channel, StoreError> {
    raw.parse::<Channel>().map_err(StoreError::Codec)
}

struct RawCheckpoint {
    thread_id: String,
    checkpoint_ns: String,
    checkpoint_id: String,
    parent_checkpoint_id: Option<String>,
    checkpoint: Vec<u8>,
    metadata: Vec<u8>,
}

const SELECT_CHECKPOINT: &str = "SELECT thread_id, checkpoint_ns, checkpoint_id, \
     parent_checkpoint_id, checkpoint, metadata FROM checkpoints";

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        thread_id: row.get(0)?,
        checkpoint_ns: row.get(1)?,
        checkpoint_id: row.get(2)?,
        parent_checkpoint_id: row.get(3)?,
        checkpoint: row.get(4)?,
        metadata: row.get(5)?,
    })
}

/// Resolves blob references and pending writes for one stored row.
fn assemble<C: PayloadCodec>(
    conn: &Connection,
    codec: &C,
    raw: RawCheckpoint,
) -> Result<CheckpointTuple, StoreError> {
    let mut checkpoint: Checkpoint = decode(codec, &raw.checkpoint)?;
    let metadata: CheckpointMetadata = decode(codec, &raw.metadata)?;

    let mut blob_stmt = conn.prepare_cached(
        "SELECT value FROM channel_blobs
         WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND channel = ?3 AND version = ?4",
    )?;
    for (channel, version) in blob_refs(&checkpoint) {
        let bytes: Option<Vec<u8>> = blob_stmt
            .query_row(
                params![
                    raw.thread_id,
                    raw.checkpoint_ns,
                    channel.as_str(),
                    version.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        let Some(bytes) = bytes else {
            return Err(StoreError::UnresolvedBlob {
                id: checkpoint.id.clone(),
                channel,
                version: version.to_string(),
            });
        };
        let value: ChannelValue = decode(codec, &bytes)?;
        checkpoint.channel_values.insert(channel, value);
    }

    let mut writes_stmt = conn.prepare_cached(
        "SELECT task_id, task_path, channel, value, seq FROM pending_writes
         WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
         ORDER BY seq",
    )?;
    let rows = writes_stmt
        .query_map(
            params![raw.thread_id, raw.checkpoint_ns, raw.checkpoint_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let mut pending_writes = Vec::with_capacity(rows.len());
    for (task_id, task_path, channel, value, seq) in rows {
        pending_writes.push(PendingWrite {
            task_id,
            task_path,
            channel: parse_channel(&channel)?,
            value: decode(codec, &value)?,
            seq,
        });
    }

    let config = CheckpointConfig {
        thread_id: raw.thread_id,
        checkpoint_ns: raw.checkpoint_ns,
        checkpoint_id: Some(CheckpointId::new(raw.checkpoint_id)),
    };
    Ok(CheckpointTuple {
        parent_config: parent_config(&config, raw.parent_checkpoint_id.map(CheckpointId::new)),
        config,
        checkpoint,
        metadata,
        pending_writes,
    })
}

#[async_trait]
impl<C: PayloadCodec> CheckpointStore for SqliteStore<C> {
    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %config.thread_id, checkpoint_id = %checkpoint.id))]
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &ChannelVersions,
    ) -> Result<CheckpointConfig, StoreError> {
        let prepared = prepare_put(config, checkpoint, new_versions)?;
        let config = config.clone();
        let checkpoint_id = checkpoint.id.clone();
        let metadata = metadata.clone();

        self.with_conn(move |conn, codec| {
            let tx = conn.transaction()?;
            let thread_id = config.thread_id.as_str();
            let ns = config.checkpoint_ns.as_str();

            if let Some(parent) = prepared.parent.as_ref() {
                let known = tx
                    .query_row(
                        "SELECT 1 FROM checkpoints
                         WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                        params![thread_id, ns, parent.as_str()],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !known {
                    return Err(StoreError::MissingParent {
                        thread_id: thread_id.to_string(),
                        parent: parent.clone(),
                    });
                }
            }

            let written: HashSet<(Channel, String)> = prepared
                .blobs
                .iter()
                .map(|blob| (blob.channel, blob.version.to_string()))
                .collect();
            for (channel, version) in &prepared.existing_refs {
                if written.contains(&(*channel, version.to_string())) {
                    continue;
                }
                let stored = tx
                    .query_row(
                        "SELECT 1 FROM channel_blobs
                         WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND channel = ?3 AND version = ?4",
                        params![thread_id, ns, channel.as_str(), version.as_str()],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !stored {
                    return Err(StoreError::MissingBlob {
                        id: checkpoint_id.clone(),
                        channel: *channel,
                        version: version.to_string(),
                    });
                }
            }

            for blob in &prepared.blobs {
                tx.execute(
                    "INSERT INTO channel_blobs (thread_id, checkpoint_ns, channel, version, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (thread_id, checkpoint_ns, channel, version) DO NOTHING",
                    params![
                        thread_id,
                        ns,
                        blob.channel.as_str(),
                        blob.version.as_str(),
                        encode(codec, &blob.value)?
                    ],
                )?;
            }

            tx.execute(
                "INSERT INTO checkpoints
                 (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, checkpoint, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id)
                 DO UPDATE SET checkpoint = excluded.checkpoint, metadata = excluded.metadata",
                params![
                    thread_id,
                    ns,
                    checkpoint_id.as_str(),
                    prepared.parent.as_ref().map(CheckpointId::as_str),
                    encode(codec, &prepared.row)?,
                    encode(codec, &metadata)?
                ],
            )?;
            tx.commit()?;
            debug!(blobs = prepared.blobs.len(), "checkpoint stored");
            Ok(config.at(checkpoint_id))
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %config.thread_id, task_id = %task_id))]
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
        let writes = writes.to_vec();
        let config = config.clone();
        let task_id = task_id.to_string();
        let task_path = task_path.to_string();

        self.with_conn(move |conn, codec| {
            let tx = conn.transaction()?;
            let key = (
                config.thread_id.as_str(),
                config.checkpoint_ns.as_str(),
                checkpoint_id.as_str(),
            );
            let mut next_seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM pending_writes
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                params![key.0, key.1, key.2],
                |row| row.get(0),
            )?;

            for (channel, value) in &writes {
                let bytes = encode(codec, value)?;
                if replace {
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT seq FROM pending_writes
                             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
                               AND task_id = ?4 AND channel = ?5",
                            params![key.0, key.1, key.2, task_id, channel.as_str()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(seq) = existing {
                        tx.execute(
                            "UPDATE pending_writes SET value = ?1, task_path = ?2
                             WHERE thread_id = ?3 AND checkpoint_ns = ?4 AND checkpoint_id = ?5
                               AND seq = ?6",
                            params![bytes, task_path, key.0, key.1, key.2, seq],
                        )?;
                        continue;
                    }
                }
                tx.execute(
                    "INSERT INTO pending_writes
                     (thread_id, checkpoint_ns, checkpoint_id, task_id, task_path, channel, value, seq)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        key.0,
                        key.1,
                        key.2,
                        task_id,
                        task_path,
                        channel.as_str(),
                        bytes,
                        next_seq
                    ],
                )?;
                next_seq += 1;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %config.thread_id))]
    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>, StoreError> {
        let config = config.clone();
        self.with_conn(move |conn, codec| {
            let raw = match config.checkpoint_id.as_ref() {
                Some(id) => conn
                    .query_row(
                        &format!(
                            "{SELECT_CHECKPOINT}
                             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3"
                        ),
                        params![config.thread_id, config.checkpoint_ns, id.as_str()],
                        read_raw,
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        &format!(
                            "{SELECT_CHECKPOINT}
                             WHERE thread_id = ?1 AND checkpoint_ns = ?2
                             ORDER BY checkpoint_id DESC LIMIT 1"
                        ),
                        params![config.thread_id, config.checkpoint_ns],
                        read_raw,
                    )
                    .optional()?,
            };
            raw.map(|raw| assemble(conn, codec, raw)).transpose()
        })
        .await
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        query: &ListQuery,
    ) -> Result<Vec<CheckpointTuple>, StoreError> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(config) = config {
            clauses.push("thread_id = ?");
            args.push(config.thread_id.clone());
            clauses.push("checkpoint_ns = ?");
            args.push(config.checkpoint_ns.clone());
            if let Some(id) = config.checkpoint_id.as_ref() {
                clauses.push("checkpoint_id = ?");
                args.push(id.to_string());
            }
        }
        if let Some(before) = query.before.as_ref() {
            clauses.push("checkpoint_id < ?");
            args.push(before.to_string());
        }

        let mut sql = SELECT_CHECKPOINT.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY checkpoint_id DESC");
        // Metadata filtering happens after decoding, so only push the limit
        // into SQL when nothing will be filtered out afterwards.
        if query.filter.is_empty() {
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
        }

        let query = query.clone();
        self.with_conn(move |conn, codec| {
            let raws = {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), read_raw)?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let mut tuples = Vec::with_capacity(raws.len());
            for raw in raws {
                tuples.push(assemble(conn, codec, raw)?);
            }
            Ok(apply_list_window(tuples, &query))
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        })
        .await
        .map_err(|err| StoreError::Worker(err.to_string()))
    }
}

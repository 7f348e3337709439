//! Block storage contracts consumed by the engine, plus a local
//! filesystem implementation of them.

pub mod local;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{BlockConfig, Compression};
use crate::Result;

pub use local::{LocalBackend, LocalBackendBlock, LocalEncoding, LocalObjectWriter, LocalWal};

/// Describes one block: identity, time range and size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: Uuid,
    pub tenant_id: String,
    pub version: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_objects: u64,
    /// Stored bytes
    pub size: u64,
    #[serde(default)]
    pub compression: Compression,
}

impl BlockMeta {
    pub fn new(block_id: Uuid, tenant_id: &str, version: &str) -> Self {
        Self {
            block_id,
            tenant_id: tenant_id.to_string(),
            version: version.to_string(),
            start_time: DateTime::<Utc>::default(),
            end_time: DateTime::<Utc>::default(),
            total_objects: 0,
            size: 0,
            compression: Compression::None,
        }
    }

    /// Widens the time range to cover an object spanning `start..=end`
    /// (unix seconds).
    pub fn object_added(&mut self, start: u32, end: u32) {
        let start = unix_seconds(start);
        let end = unix_seconds(end);
        if self.total_objects == 0 || start < self.start_time {
            self.start_time = start;
        }
        if self.total_objects == 0 || end > self.end_time {
            self.end_time = end;
        }
        self.total_objects += 1;
    }
}

fn unix_seconds(secs: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(i64::from(secs), 0)
        .single()
        .unwrap_or_default()
}

/// One serialized trace stored in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Vec<u8>,
    /// Unix seconds
    pub start: u32,
    pub end: u32,
    pub payload: Vec<u8>,
}

/// Finite, single-pass sequence of records. Resources are released on drop.
pub type RecordIterator = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Appendable write-ahead segment
pub trait WalBlock: Send + Sync {
    fn block_meta(&self) -> BlockMeta;

    fn append(&mut self, id: &[u8], payload: &[u8], start: u32, end: u32) -> Result<()>;

    /// Durably persists everything appended so far
    fn flush(&mut self) -> Result<()>;

    fn data_length(&self) -> u64;

    fn iterator(&self) -> Result<RecordIterator>;

    /// Deletes the underlying storage
    fn clear(&mut self) -> Result<()>;
}

/// Immutable, encoded block in the backend
pub trait BackendBlock: Send + Sync {
    fn block_meta(&self) -> &BlockMeta;
}

/// Streaming writer for one backend object. Nothing is durable until
/// `finish` returns.
pub trait ObjectWriter: Write + Send {
    /// Flushes and syncs the object, returning the number of bytes stored
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Reader and writer over the local backend
pub trait Backend: Send + Sync {
    fn tenants(&self) -> Result<Vec<String>>;

    fn blocks(&self, tenant: &str) -> Result<Vec<Uuid>>;

    /// `Error::DoesNotExist` when the block has no meta
    fn block_meta(&self, id: Uuid, tenant: &str) -> Result<BlockMeta>;

    fn write(&self, name: &str, id: Uuid, tenant: &str, data: &[u8]) -> Result<()>;

    /// Opens `name` for streaming writes, replacing any existing object
    fn object_writer(&self, name: &str, id: Uuid, tenant: &str) -> Result<Box<dyn ObjectWriter>>;

    fn read(&self, name: &str, id: Uuid, tenant: &str) -> Result<Vec<u8>>;

    fn write_block_meta(&self, meta: &BlockMeta) -> Result<()>;

    fn clear_block(&self, id: Uuid, tenant: &str) -> Result<()>;
}

/// Write-ahead log directory
pub trait Wal: Send + Sync {
    fn new_block(&self, id: Uuid, tenant: &str, version: &str) -> Result<Box<dyn WalBlock>>;

    /// Replays every segment on disk, for all tenants
    fn rescan_blocks(&self) -> Result<Vec<Box<dyn WalBlock>>>;

    /// Metas of every non-empty segment, for all tenants. Unlike
    /// `rescan_blocks` this never truncates or removes anything.
    fn inspect_blocks(&self) -> Result<Vec<BlockMeta>>;

    fn local_backend(&self) -> Arc<dyn Backend>;
}

/// Block codec: turns a write-ahead block into a backend block
pub trait Encoding: Send + Sync {
    fn version(&self) -> &str;

    fn create_block(
        &self,
        cfg: &BlockConfig,
        meta: &BlockMeta,
        records: RecordIterator,
        backend: &dyn Backend,
    ) -> Result<BlockMeta>;

    fn open_block(&self, meta: BlockMeta, backend: Arc<dyn Backend>) -> Result<Box<dyn BackendBlock>>;
}

//! Head, write-ahead and complete block bookkeeping.
//!
//! All three collections sit behind one lock. Storage calls (append, flush,
//! compaction, deletes) happen while it is held.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LocalBlocksConfig;
use crate::storage::{BackendBlock, BlockMeta, Encoding, Wal, WalBlock};
use crate::Result;

pub(crate) struct BlockState {
    pub(crate) head: Option<Box<dyn WalBlock>>,
    pub(crate) wal_blocks: HashMap<Uuid, Box<dyn WalBlock>>,
    pub(crate) complete_blocks: HashMap<Uuid, Box<dyn BackendBlock>>,
    pub(crate) last_cut_time: DateTime<Utc>,
    /// Write-ahead blocks whose last compaction failed; tried again only
    /// once every other block has had a turn
    pub(crate) failed_compactions: HashSet<Uuid>,
}

/// Point-in-time view of the block collections, each list oldest first
#[derive(Debug, Clone, Default)]
pub struct BlockInventory {
    pub head: Option<BlockMeta>,
    pub wal: Vec<BlockMeta>,
    pub complete: Vec<BlockMeta>,
}

impl BlockInventory {
    /// Sum of the listed block sizes
    pub fn total_bytes(&self) -> u64 {
        self.head
            .iter()
            .chain(&self.wal)
            .chain(&self.complete)
            .map(|m| m.size)
            .sum()
    }
}

pub struct BlockManager {
    pub(crate) tenant: String,
    pub(crate) cfg: LocalBlocksConfig,
    pub(crate) wal: Arc<dyn Wal>,
    pub(crate) encoding: Arc<dyn Encoding>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<BlockState>,
}

/// Time from `then` to `now`, zero if `then` is in the future
fn elapsed_since(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

fn unix_secs(t: DateTime<Utc>) -> u32 {
    t.timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

pub(crate) fn oldest_first(metas: &mut [BlockMeta]) {
    metas.sort_by(|a, b| (a.start_time, a.block_id).cmp(&(b.start_time, b.block_id)));
}

impl BlockManager {
    pub fn new(
        tenant: &str,
        cfg: LocalBlocksConfig,
        wal: Arc<dyn Wal>,
        encoding: Arc<dyn Encoding>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            tenant: tenant.to_string(),
            cfg,
            wal,
            encoding,
            clock,
            state: Mutex::new(BlockState {
                head: None,
                wal_blocks: HashMap::new(),
                complete_blocks: HashMap::new(),
                last_cut_time: now,
                failed_compactions: HashSet::new(),
            }),
        }
    }

    fn reset_head_block(&self, state: &mut BlockState) -> Result<()> {
        let block = self
            .wal
            .new_block(Uuid::new_v4(), &self.tenant, self.encoding.version())?;
        state.head = Some(block);
        state.last_cut_time = self.clock.now();
        Ok(())
    }

    /// Appends one trace record to the head block, creating the head block
    /// if there is none. A failed append leaves the head block in an unknown
    /// state; the error must be surfaced, not retried.
    pub fn write_head_block(&self, id: &[u8], record: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.head.is_none() {
            self.reset_head_block(state)?;
        }

        let now = unix_secs(self.clock.now());
        if let Some(head) = state.head.as_mut() {
            head.append(id, record, now, now)?;
        }
        Ok(())
    }

    pub fn flush_head_block(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(head) = state.head.as_mut() {
            head.flush()?;
        }
        Ok(())
    }

    /// Moves the head block into the write-ahead set once it is big or old
    /// enough, or unconditionally when `immediate`. An empty head block is
    /// never cut.
    pub fn cut_blocks(&self, immediate: bool) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(head) = state.head.as_mut() else {
            return Ok(());
        };
        let length = head.data_length();
        if length == 0 {
            return Ok(());
        }

        let age = elapsed_since(self.clock.now(), state.last_cut_time);
        if !immediate && age < self.cfg.max_block_duration && length < self.cfg.max_block_bytes {
            debug!(tenant = %self.tenant, bytes = length, "Head block below cut thresholds");
            return Ok(());
        }

        head.flush()?;

        if let Some(head) = state.head.take() {
            let meta = head.block_meta();
            info!(
                tenant = %self.tenant,
                block_id = %meta.block_id,
                bytes = length,
                objects = meta.total_objects,
                "Head block cut"
            );
            state.wal_blocks.insert(meta.block_id, head);
        }

        self.reset_head_block(state)
    }

    /// Compacts the oldest write-ahead block into a complete block.
    ///
    /// At most one block per call, to bound the I/O of a single tick. A block
    /// that fails is passed over on later calls until no other block is left,
    /// so one unreadable segment cannot hold back the rest.
    pub fn complete_block(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = state
            .wal_blocks
            .iter()
            .map(|(id, b)| (b.block_meta().start_time, *id))
            .collect();
        candidates.sort();

        let id = match candidates
            .iter()
            .find(|(_, id)| !state.failed_compactions.contains(id))
        {
            Some((_, id)) => *id,
            None => match candidates.first() {
                Some((_, id)) => {
                    state.failed_compactions.clear();
                    *id
                }
                None => return Ok(()),
            },
        };

        match self.compact(state, id) {
            Ok(()) => {
                state.failed_compactions.remove(&id);
                Ok(())
            }
            Err(e) => {
                debug!(tenant = %self.tenant, block_id = %id, "Compaction deferred");
                state.failed_compactions.insert(id);
                Err(e)
            }
        }
    }

    fn compact(&self, state: &mut BlockState, id: Uuid) -> Result<()> {
        let Some(block) = state.wal_blocks.get(&id) else {
            return Ok(());
        };

        let backend = self.wal.local_backend();
        let new_meta = self.encoding.create_block(
            &self.cfg.block,
            &block.block_meta(),
            block.iterator()?,
            &*backend,
        )?;

        let new_block = self.encoding.open_block(new_meta.clone(), backend)?;
        state.complete_blocks.insert(new_meta.block_id, new_block);

        if let Some(block) = state.wal_blocks.get_mut(&id) {
            block.clear()?;
        }
        state.wal_blocks.remove(&id);

        info!(
            tenant = %self.tenant,
            block_id = %new_meta.block_id,
            objects = new_meta.total_objects,
            size = new_meta.size,
            pending = state.wal_blocks.len(),
            "Block completed"
        );
        Ok(())
    }

    /// Deletes write-ahead and complete blocks whose end time is older than
    /// the retention timeout. Stops at the first failure.
    pub fn delete_old_blocks(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let now = self.clock.now();
        let timeout = self.cfg.complete_block_timeout;

        let expired: Vec<Uuid> = state
            .wal_blocks
            .iter()
            .filter(|(_, b)| elapsed_since(now, b.block_meta().end_time) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(block) = state.wal_blocks.get_mut(&id) {
                block.clear()?;
            }
            state.wal_blocks.remove(&id);
            state.failed_compactions.remove(&id);
            info!(tenant = %self.tenant, block_id = %id, "Deleted expired write-ahead block");
        }

        let expired: Vec<Uuid> = state
            .complete_blocks
            .iter()
            .filter(|(_, b)| elapsed_since(now, b.block_meta().end_time) > timeout)
            .map(|(id, _)| *id)
            .collect();
        if !expired.is_empty() {
            let backend = self.wal.local_backend();
            for id in expired {
                backend.clear_block(id, &self.tenant)?;
                state.complete_blocks.remove(&id);
                info!(tenant = %self.tenant, block_id = %id, "Deleted expired complete block");
            }
        }

        Ok(())
    }

    /// Bytes held by the head block, write-ahead blocks and complete blocks
    pub fn total_bytes(&self) -> u64 {
        let state = self.state.lock();

        let head = state.head.as_ref().map_or(0, |h| h.data_length());
        let wal: u64 = state.wal_blocks.values().map(|b| b.data_length()).sum();
        let complete: u64 = state.complete_blocks.values().map(|b| b.block_meta().size).sum();

        head + wal + complete
    }

    pub fn inventory(&self) -> BlockInventory {
        let state = self.state.lock();

        let mut wal: Vec<BlockMeta> = state.wal_blocks.values().map(|b| b.block_meta()).collect();
        let mut complete: Vec<BlockMeta> = state
            .complete_blocks
            .values()
            .map(|b| b.block_meta().clone())
            .collect();
        oldest_first(&mut wal);
        oldest_first(&mut complete);

        BlockInventory {
            head: state.head.as_ref().map(|h| h.block_meta()),
            wal,
            complete,
        }
    }

    pub fn head_block_length(&self) -> u64 {
        self.state.lock().head.as_ref().map_or(0, |h| h.data_length())
    }
}

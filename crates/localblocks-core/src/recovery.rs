//! Startup reload of write-ahead and complete blocks, and the read-only
//! inspection used by tooling.

use tracing::{debug, error, info, warn};

use crate::blocks::{oldest_first, BlockInventory, BlockManager};
use crate::storage::BlockMeta;
use crate::{Error, Result};

impl BlockManager {
    /// Registers this tenant's WAL segments as write-ahead blocks and its
    /// finished backend blocks as complete blocks.
    ///
    /// Backend blocks without a meta object are leftovers of an interrupted
    /// compaction and are removed. Any other failure aborts the reload.
    pub fn reload_blocks(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        for block in self.wal.rescan_blocks()? {
            let meta = block.block_meta();
            if meta.tenant_id != self.tenant {
                continue;
            }
            state.wal_blocks.insert(meta.block_id, block);
        }

        let backend = self.wal.local_backend();
        if backend.tenants()?.is_empty() {
            info!(
                tenant = %self.tenant,
                wal_blocks = state.wal_blocks.len(),
                "Recovery finished, backend is empty"
            );
            return Ok(());
        }

        for id in backend.blocks(&self.tenant)? {
            let meta = match backend.block_meta(id, &self.tenant) {
                Ok(meta) => meta,
                Err(Error::DoesNotExist) => {
                    warn!(tenant = %self.tenant, block_id = %id, "Clearing partially written block");
                    if let Err(e) = backend.clear_block(id, &self.tenant) {
                        error!(tenant = %self.tenant, block_id = %id, "Failed to clear partial block: {}", e);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let block = self.encoding.open_block(meta, backend.clone())?;
            state.complete_blocks.insert(id, block);
        }

        info!(
            tenant = %self.tenant,
            wal_blocks = state.wal_blocks.len(),
            complete_blocks = state.complete_blocks.len(),
            "Recovery finished"
        );
        Ok(())
    }

    /// Lists this tenant's blocks as they are on disk without registering,
    /// repairing or removing anything. Safe to run next to a live processor
    /// on the same directory; the head block is not reported.
    pub fn inspect_blocks(&self) -> Result<BlockInventory> {
        let mut wal: Vec<BlockMeta> = self
            .wal
            .inspect_blocks()?
            .into_iter()
            .filter(|meta| meta.tenant_id == self.tenant)
            .collect();

        let backend = self.wal.local_backend();
        let mut complete = Vec::new();
        for id in backend.blocks(&self.tenant)? {
            match backend.block_meta(id, &self.tenant) {
                Ok(meta) => complete.push(meta),
                Err(Error::DoesNotExist) => {
                    debug!(tenant = %self.tenant, block_id = %id, "Skipping block without meta");
                }
                Err(e) => return Err(e),
            }
        }

        oldest_first(&mut wal);
        oldest_first(&mut complete);
        Ok(BlockInventory {
            head: None,
            wal,
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::blocks::BlockManager;
    use crate::clock::SystemClock;
    use crate::config::LocalBlocksConfig;
    use crate::storage::local::DATA_OBJECT;
    use crate::storage::{Backend, BlockMeta, LocalEncoding, LocalWal, ObjectWriter, Wal, WalBlock};
    use crate::{Error, Result};
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn manager(wal: Arc<LocalWal>, tenant: &str) -> BlockManager {
        manager_with(wal, tenant)
    }

    fn manager_with(wal: Arc<dyn Wal>, tenant: &str) -> BlockManager {
        BlockManager::new(
            tenant,
            LocalBlocksConfig::default(),
            wal,
            Arc::new(LocalEncoding),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn test_reload_empty_directory() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(LocalWal::new(dir.path()).unwrap());
        let blocks = manager(wal, "t");

        blocks.reload_blocks().unwrap();
        let inv = blocks.inventory();
        assert!(inv.head.is_none());
        assert!(inv.wal.is_empty());
        assert!(inv.complete.is_empty());
    }

    #[test]
    fn test_reload_skips_other_tenants() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(LocalWal::new(dir.path()).unwrap());

        for tenant in ["t", "other"] {
            let mut block = wal.new_block(Uuid::new_v4(), tenant, "v1").unwrap();
            block.append(&[1], b"x", 10, 10).unwrap();
            block.flush().unwrap();
        }

        let blocks = manager(wal.clone(), "t");
        blocks.reload_blocks().unwrap();
        let inv = blocks.inventory();
        assert_eq!(inv.wal.len(), 1);
        assert_eq!(inv.wal[0].tenant_id, "t");

        // the other tenant's segment is still on disk
        assert_eq!(wal.rescan_blocks().unwrap().len(), 2);
    }

    #[test]
    fn test_inspect_leaves_live_blocks_alone() {
        let dir = tempdir().unwrap();
        let live = manager(Arc::new(LocalWal::new(dir.path()).unwrap()), "t");

        // one cut block, one head block with unflushed data
        live.write_head_block(&[1], b"first").unwrap();
        live.cut_blocks(true).unwrap();
        live.write_head_block(&[2], b"second").unwrap();
        let head = live.inventory().head.unwrap().block_id;
        let cut = live.inventory().wal[0].block_id;

        // a leftover backend block without meta
        let partial = Uuid::new_v4();
        let backend = live.wal.local_backend();
        backend.write(DATA_OBJECT, partial, "t", b"junk").unwrap();

        let inspector = manager(Arc::new(LocalWal::new(dir.path()).unwrap()), "t");
        let inv = inspector.inspect_blocks().unwrap();
        let wal: Vec<_> = inv.wal.iter().map(|m| m.block_id).collect();
        assert_eq!(wal, vec![cut]);
        assert!(inv.complete.is_empty());
        assert!(inv.head.is_none());
        assert_eq!(inv.total_bytes(), inv.wal[0].size);

        // nothing was registered or removed
        assert!(inspector.inventory().wal.is_empty());
        assert_eq!(backend.blocks("t").unwrap(), vec![partial]);
        assert!(dir.path().join(format!("{}+t+v1", head)).exists());

        // the live manager carries on
        live.flush_head_block().unwrap();
        live.cut_blocks(true).unwrap();
        live.complete_block().unwrap();
        live.complete_block().unwrap();
        let inv = live.inventory();
        assert!(inv.wal.is_empty());
        assert_eq!(inv.complete.len(), 2);

        let inv = inspector.inspect_blocks().unwrap();
        assert!(inv.wal.is_empty());
        assert_eq!(inv.complete.len(), 2);
    }

    /// Backend whose blocks all lack meta, recording the calls it gets
    #[derive(Default)]
    struct StubBackend {
        tenants: Vec<String>,
        blocks: Vec<Uuid>,
        fail_clear: bool,
        listed: AtomicBool,
        cleared: Mutex<Vec<Uuid>>,
    }

    impl Backend for StubBackend {
        fn tenants(&self) -> Result<Vec<String>> {
            Ok(self.tenants.clone())
        }

        fn blocks(&self, _tenant: &str) -> Result<Vec<Uuid>> {
            self.listed.store(true, Ordering::SeqCst);
            Ok(self.blocks.clone())
        }

        fn block_meta(&self, _id: Uuid, _tenant: &str) -> Result<BlockMeta> {
            Err(Error::DoesNotExist)
        }

        fn write(&self, _name: &str, _id: Uuid, _tenant: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn object_writer(&self, _name: &str, _id: Uuid, _tenant: &str) -> Result<Box<dyn ObjectWriter>> {
            Err(Error::Io(io::Error::new(io::ErrorKind::Other, "read-only")))
        }

        fn read(&self, _name: &str, _id: Uuid, _tenant: &str) -> Result<Vec<u8>> {
            Err(Error::DoesNotExist)
        }

        fn write_block_meta(&self, _meta: &BlockMeta) -> Result<()> {
            Ok(())
        }

        fn clear_block(&self, id: Uuid, _tenant: &str) -> Result<()> {
            self.cleared.lock().push(id);
            if self.fail_clear {
                return Err(Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied")));
            }
            Ok(())
        }
    }

    /// Real segment directory in front of a stub backend
    struct StubWal {
        segments: LocalWal,
        backend: Arc<StubBackend>,
    }

    impl Wal for StubWal {
        fn new_block(&self, id: Uuid, tenant: &str, version: &str) -> Result<Box<dyn WalBlock>> {
            self.segments.new_block(id, tenant, version)
        }

        fn rescan_blocks(&self) -> Result<Vec<Box<dyn WalBlock>>> {
            self.segments.rescan_blocks()
        }

        fn inspect_blocks(&self) -> Result<Vec<BlockMeta>> {
            self.segments.inspect_blocks()
        }

        fn local_backend(&self) -> Arc<dyn Backend> {
            self.backend.clone()
        }
    }

    #[test]
    fn test_reload_continues_when_partial_block_cannot_be_cleared() {
        let dir = tempdir().unwrap();
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let backend = Arc::new(StubBackend {
            tenants: vec!["t".to_string()],
            blocks: ids.clone(),
            fail_clear: true,
            ..Default::default()
        });
        let wal = Arc::new(StubWal {
            segments: LocalWal::new(dir.path()).unwrap(),
            backend: backend.clone(),
        });

        let blocks = manager_with(wal, "t");
        blocks.reload_blocks().unwrap();

        assert!(blocks.inventory().complete.is_empty());
        assert_eq!(*backend.cleared.lock(), ids);
    }

    #[test]
    fn test_reload_skips_block_listing_when_backend_is_empty() {
        let dir = tempdir().unwrap();
        let segments = LocalWal::new(dir.path()).unwrap();
        let mut block = segments.new_block(Uuid::new_v4(), "t", "v1").unwrap();
        block.append(&[1], b"x", 10, 10).unwrap();
        block.flush().unwrap();

        let backend = Arc::new(StubBackend {
            blocks: vec![Uuid::new_v4()],
            ..Default::default()
        });
        let wal = Arc::new(StubWal {
            segments,
            backend: backend.clone(),
        });

        let blocks = manager_with(wal, "t");
        blocks.reload_blocks().unwrap();

        assert_eq!(blocks.inventory().wal.len(), 1);
        assert!(!backend.listed.load(Ordering::SeqCst));
        assert!(backend.cleared.lock().is_empty());
    }
}

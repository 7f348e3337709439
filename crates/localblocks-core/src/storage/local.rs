//! Filesystem-backed WAL, backend and block encoding.
//!
//! WAL layout: one segment file per block, named `<uuid>+<tenant>+<version>`.
//! Backend layout: `<root>/<tenant>/<uuid>/{data,meta.json}`, where
//! `meta.json` is written last and marks a finished block.
//!
//! Record frame: `[len: u32 LE][crc32: u32 LE][bincode(Record)]`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Backend, BackendBlock, BlockMeta, Encoding, ObjectWriter, Record, RecordIterator, Wal, WalBlock};
use crate::config::{validate_tenant, BlockConfig, Compression, DEFAULT_BLOCK_VERSION};
use crate::{Error, Result};

pub const DATA_OBJECT: &str = "data";
pub const META_OBJECT: &str = "meta.json";
pub const BACKEND_DIR: &str = "blocks";

const FRAME_HEADER_LEN: u64 = 8;
const MAX_FRAME_LEN: usize = 1 << 30;

// ============================================================================
// Record framing
// ============================================================================

fn write_frame<W: Write>(w: &mut W, record: &Record) -> Result<u64> {
    let body = bincode::serialize(record)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Corrupt(format!("record of {} bytes exceeds frame limit", body.len())));
    }
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&crc32fast::hash(&body).to_le_bytes())?;
    w.write_all(&body)?;
    Ok(FRAME_HEADER_LEN + body.len() as u64)
}

/// Reads until `buf` is full or EOF, returning the bytes read
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Sequential frame decoder. `offset` is the end of the last good frame.
struct FrameReader<R> {
    inner: R,
    offset: u64,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, offset: 0, done: false }
    }

    /// `Ok(None)` on a clean end of stream
    fn next_frame(&mut self) -> Result<Option<Record>> {
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        match read_full(&mut self.inner, &mut header)? {
            0 => return Ok(None),
            n if n < header.len() => {
                return Err(Error::Corrupt(format!("truncated frame header at offset {}", self.offset)))
            }
            _ => {}
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_FRAME_LEN {
            return Err(Error::Corrupt(format!("frame length {} at offset {}", len, self.offset)));
        }

        let mut body = vec![0u8; len];
        if read_full(&mut self.inner, &mut body)? < len {
            return Err(Error::Corrupt(format!("truncated frame body at offset {}", self.offset)));
        }
        if crc32fast::hash(&body) != crc {
            return Err(Error::Corrupt(format!("checksum mismatch at offset {}", self.offset)));
        }

        let record: Record = bincode::deserialize(&body)?;
        self.offset += FRAME_HEADER_LEN + len as u64;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn decode_frames(data: &[u8]) -> Result<Vec<Record>> {
    FrameReader::new(data).collect()
}

// ============================================================================
// WAL
// ============================================================================

fn segment_name(id: Uuid, tenant: &str, version: &str) -> String {
    format!("{}+{}+{}", id, tenant, version)
}

/// Splits `<uuid>+<tenant>+<version>`; the tenant may not contain '+'.
fn parse_segment_name(name: &str) -> Option<(Uuid, String, String)> {
    let mut parts = name.splitn(3, '+');
    let id = Uuid::parse_str(parts.next()?).ok()?;
    let tenant = parts.next()?;
    let version = parts.next()?;
    if tenant.is_empty() || version.is_empty() || version.contains('+') {
        return None;
    }
    Some((id, tenant.to_string(), version.to_string()))
}

/// One WAL segment file
pub struct LocalWalBlock {
    meta: BlockMeta,
    path: PathBuf,
    /// `None` once the segment is recovered from disk or cleared
    writer: Option<BufWriter<File>>,
    data_length: u64,
}

impl LocalWalBlock {
    fn create(dir: &Path, id: Uuid, tenant: &str, version: &str) -> Result<Self> {
        let path = dir.join(segment_name(id, tenant, version));
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;

        Ok(Self {
            meta: BlockMeta::new(id, tenant, version),
            path,
            writer: Some(BufWriter::new(file)),
            data_length: 0,
        })
    }

    /// Replays a segment, keeping the valid prefix. A damaged tail is cut off.
    fn replay(path: PathBuf, id: Uuid, tenant: &str, version: &str) -> Result<Self> {
        let scan = scan_segment(&path, id, tenant, version)?;
        if let Some(e) = &scan.damage {
            warn!(
                "WAL replay: {} in {:?}, keeping first {} bytes",
                e, path, scan.valid_len
            );
        }

        if scan.valid_len < scan.file_len {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            data_length: scan.valid_len,
            meta: scan.meta,
            path,
            writer: None,
        })
    }
}

/// Result of reading a segment without touching it
struct SegmentScan {
    meta: BlockMeta,
    valid_len: u64,
    file_len: u64,
    /// Why reading stopped before the end of the file, if it did
    damage: Option<Error>,
}

fn scan_segment(path: &Path, id: Uuid, tenant: &str, version: &str) -> Result<SegmentScan> {
    let mut meta = BlockMeta::new(id, tenant, version);
    let file_len = fs::metadata(path)?.len();

    let mut reader = FrameReader::new(BufReader::new(File::open(path)?));
    let damage = loop {
        match reader.next_frame() {
            Ok(Some(record)) => meta.object_added(record.start, record.end),
            Ok(None) => break None,
            Err(Error::Io(e)) => return Err(Error::Io(e)),
            Err(e) => break Some(e),
        }
    };

    let valid_len = reader.offset;
    meta.size = valid_len;
    Ok(SegmentScan {
        meta,
        valid_len,
        file_len,
        damage,
    })
}

impl WalBlock for LocalWalBlock {
    fn block_meta(&self) -> BlockMeta {
        self.meta.clone()
    }

    fn append(&mut self, id: &[u8], payload: &[u8], start: u32, end: u32) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("segment {:?} is read-only", self.path),
            ))
        })?;

        let record = Record {
            id: id.to_vec(),
            start,
            end,
            payload: payload.to_vec(),
        };
        self.data_length += write_frame(writer, &record)?;
        self.meta.object_added(start, end);
        self.meta.size = self.data_length;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn data_length(&self) -> u64 {
        self.data_length
    }

    /// Iterates records already flushed to disk
    fn iterator(&self) -> Result<RecordIterator> {
        let file = File::open(&self.path)?;
        Ok(Box::new(FrameReader::new(BufReader::new(file))))
    }

    fn clear(&mut self) -> Result<()> {
        self.writer = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// WAL directory holding segment files, with the local backend under
/// `<path>/blocks`.
pub struct LocalWal {
    path: PathBuf,
    backend: Arc<LocalBackend>,
}

impl LocalWal {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        let backend = Arc::new(LocalBackend::new(path.join(BACKEND_DIR))?);
        Ok(Self { path, backend })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Wal for LocalWal {
    fn new_block(&self, id: Uuid, tenant: &str, version: &str) -> Result<Box<dyn WalBlock>> {
        validate_tenant(tenant)?;
        let block = LocalWalBlock::create(&self.path, id, tenant, version)?;
        debug!("WAL segment {} created for tenant {}", id, tenant);
        Ok(Box::new(block))
    }

    fn rescan_blocks(&self) -> Result<Vec<Box<dyn WalBlock>>> {
        let mut blocks: Vec<Box<dyn WalBlock>> = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((id, tenant, version)) = parse_segment_name(&name) else {
                warn!("WAL rescan: skipping unrecognised file {:?}", name);
                continue;
            };

            let block = LocalWalBlock::replay(entry.path(), id, &tenant, &version)?;
            if block.meta.total_objects == 0 {
                info!("WAL rescan: removing empty segment {:?}", name);
                fs::remove_file(entry.path())?;
                continue;
            }
            blocks.push(Box::new(block));
        }

        info!("WAL rescan: recovered {} segments from {:?}", blocks.len(), self.path);
        Ok(blocks)
    }

    /// Reads the meta of every non-empty segment without modifying the
    /// directory. Segments still being written by another process show up
    /// with whatever complete records they hold so far.
    fn inspect_blocks(&self) -> Result<Vec<BlockMeta>> {
        let mut metas = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((id, tenant, version)) = parse_segment_name(&name) else {
                continue;
            };

            let scan = match scan_segment(&entry.path(), id, &tenant, &version) {
                Ok(scan) => scan,
                // removed between listing and opening
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if let Some(e) = &scan.damage {
                debug!("WAL inspect: {} in {:?}", e, name);
            }
            if scan.meta.total_objects > 0 {
                metas.push(scan.meta);
            }
        }

        Ok(metas)
    }

    fn local_backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn block_dir(&self, id: Uuid, tenant: &str) -> PathBuf {
        self.root.join(tenant).join(id.to_string())
    }

    fn list_dirs(path: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Buffered file in a backend block directory that counts what it stores
pub struct LocalObjectWriter {
    inner: BufWriter<File>,
    written: u64,
}

impl Write for LocalObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ObjectWriter for LocalObjectWriter {
    fn finish(mut self: Box<Self>) -> Result<u64> {
        self.inner.flush()?;
        self.inner.get_ref().sync_all()?;
        Ok(self.written)
    }
}

impl Backend for LocalBackend {
    fn tenants(&self) -> Result<Vec<String>> {
        Self::list_dirs(&self.root)
    }

    fn blocks(&self, tenant: &str) -> Result<Vec<Uuid>> {
        Ok(Self::list_dirs(&self.root.join(tenant))?
            .iter()
            .filter_map(|name| Uuid::parse_str(name).ok())
            .collect())
    }

    fn block_meta(&self, id: Uuid, tenant: &str) -> Result<BlockMeta> {
        let raw = self.read(META_OBJECT, id, tenant)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write(&self, name: &str, id: Uuid, tenant: &str, data: &[u8]) -> Result<()> {
        let dir = self.block_dir(id, tenant);
        fs::create_dir_all(&dir)?;

        let mut file = File::create(dir.join(name))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn object_writer(&self, name: &str, id: Uuid, tenant: &str) -> Result<Box<dyn ObjectWriter>> {
        let dir = self.block_dir(id, tenant);
        fs::create_dir_all(&dir)?;

        Ok(Box::new(LocalObjectWriter {
            inner: BufWriter::new(File::create(dir.join(name))?),
            written: 0,
        }))
    }

    fn read(&self, name: &str, id: Uuid, tenant: &str) -> Result<Vec<u8>> {
        match fs::read(self.block_dir(id, tenant).join(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::DoesNotExist),
            Err(e) => Err(e.into()),
        }
    }

    fn write_block_meta(&self, meta: &BlockMeta) -> Result<()> {
        let data = serde_json::to_vec_pretty(meta)?;
        self.write(META_OBJECT, meta.block_id, &meta.tenant_id, &data)
    }

    fn clear_block(&self, id: Uuid, tenant: &str) -> Result<()> {
        match fs::remove_dir_all(self.block_dir(id, tenant)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Complete block stored in the local backend
pub struct LocalBackendBlock {
    meta: BlockMeta,
    backend: Arc<dyn Backend>,
}

impl LocalBackendBlock {
    /// Reads every record back, in stored order
    pub fn records(&self) -> Result<Vec<Record>> {
        let raw = self.backend.read(DATA_OBJECT, self.meta.block_id, &self.meta.tenant_id)?;
        let data = match self.meta.compression {
            Compression::None => raw,
            Compression::Zstd => zstd::decode_all(raw.as_slice())?,
        };
        decode_frames(&data)
    }
}

impl BackendBlock for LocalBackendBlock {
    fn block_meta(&self) -> &BlockMeta {
        &self.meta
    }
}

/// Frames every record into `w`, widening `meta` as it goes
fn copy_records<W: Write>(records: RecordIterator, w: &mut W, meta: &mut BlockMeta) -> Result<()> {
    for record in records {
        let record = record?;
        write_frame(w, &record)?;
        meta.object_added(record.start, record.end);
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEncoding;

impl LocalEncoding {
    fn check_version(&self, version: &str) -> Result<()> {
        if version != self.version() {
            return Err(Error::UnsupportedVersion(version.to_string()));
        }
        Ok(())
    }

    /// Opens a block with its concrete type, for tooling and tests
    pub fn open_local_block(&self, meta: BlockMeta, backend: Arc<dyn Backend>) -> Result<LocalBackendBlock> {
        self.check_version(&meta.version)?;
        Ok(LocalBackendBlock { meta, backend })
    }
}

impl Encoding for LocalEncoding {
    fn version(&self) -> &str {
        DEFAULT_BLOCK_VERSION
    }

    fn create_block(
        &self,
        cfg: &BlockConfig,
        meta: &BlockMeta,
        records: RecordIterator,
        backend: &dyn Backend,
    ) -> Result<BlockMeta> {
        self.check_version(&cfg.version)?;

        let mut out = BlockMeta::new(meta.block_id, &meta.tenant_id, self.version());
        let mut writer = backend.object_writer(DATA_OBJECT, out.block_id, &out.tenant_id)?;
        out.size = match cfg.compression {
            Compression::None => {
                copy_records(records, &mut writer, &mut out)?;
                writer.finish()?
            }
            Compression::Zstd => {
                let mut encoder = zstd::Encoder::new(writer, cfg.zstd_level)?;
                copy_records(records, &mut encoder, &mut out)?;
                encoder.finish()?.finish()?
            }
        };
        out.compression = cfg.compression;

        backend.write_block_meta(&out)?;
        Ok(out)
    }

    fn open_block(&self, meta: BlockMeta, backend: Arc<dyn Backend>) -> Result<Box<dyn BackendBlock>> {
        Ok(Box::new(self.open_local_block(meta, backend)?))
    }
}

//! A single generation: one append-only file plus its in-memory index.
//!
//! Write path: update buffers ops → commit appends one checksummed frame →
//! sync → index clone + apply → publish.
//! Read path: query pins the published index `Arc`; documents are read from
//! the file on demand.
//!
//! The generational store layers several of these; on its own a generation
//! is already a complete store (see [`Generation::create`]).

pub(crate) mod format;
mod index;

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use k2v_common::config::SyncMode;
use k2v_common::error::{StoreError, StoreResult};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;

use crate::api::{ByteSink, DocumentSink, Query, Update};
use crate::gate::Gate;
use crate::value::{Document, Folder, Missing, Value};

use self::format::{FrameWriter, Header, BODY_PREFIX_SIZE, FRAME_HEADER_SIZE, HEADER_SIZE};
use self::index::{Index, Slot};

/// Copy buffer for document bytes during compaction.
const COPY_CHUNK: usize = 64 * 1024;

/// Shared positional reader over a generation file.
pub(crate) struct ReadHandle {
    name: String,
    file: Mutex<File>,
}

impl ReadHandle {
    fn open(path: &Path, name: &str) -> io::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            file: Mutex::new(File::open(path)?),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

/// Writer-side file state. Only touched by the holder of the writer gate.
struct WriterState {
    /// Opened on first use; generations that are only read never open it.
    file: Option<File>,
    committed_len: u64,
    /// Bytes past `committed_len` may exist (torn or failed commit).
    dirty: bool,
}

/// Statistics snapshot for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStats {
    pub name: String,
    pub first_version: u64,
    pub last_version: u64,
    pub file_len: u64,
    pub live_bytes: u64,
    pub load_factor: f32,
    pub folders: usize,
    pub documents: usize,
    pub frozen: bool,
}

pub struct Generation {
    path: PathBuf,
    name: String,
    header: Header,
    sync_mode: SyncMode,
    reader: Arc<ReadHandle>,
    index: RwLock<Arc<Index>>,
    writer_gate: Gate,
    writer: Mutex<WriterState>,
    frozen: AtomicBool,
    /// Set by `close`; refuses new queries and writers. Pinned queries keep
    /// reading through their own handle.
    closed: AtomicBool,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("header", &self.header)
            .field("sync_mode", &self.sync_mode)
            .field("frozen", &self.frozen)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Versions follow the wall clock but never repeat or run backwards.
fn next_version(last: u64) -> u64 {
    now_millis().max(last + 1)
}

fn sync_file(file: &File, mode: SyncMode) -> io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::FSync => file.sync_all(),
        SyncMode::FDataSync => file.sync_data(),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl Generation {
    /// Create a brand-new store file whose root is authoritative.
    pub fn create<R: RngCore + ?Sized>(path: &Path, rng: &mut R, sync_mode: SyncMode) -> StoreResult<Arc<Self>> {
        let mut tag = [0u8; 16];
        rng.fill_bytes(&mut tag);
        let header = Header {
            first_version: now_millis(),
            tag,
            absolute_root: true,
        };
        let generation = Self::create_with(path, header, sync_mode)?;
        tracing::info!(
            generation = %generation.name,
            first_version = header.first_version,
            "created generation"
        );
        Ok(generation)
    }

    fn create_with(path: &Path, header: Header, sync_mode: SyncMode) -> StoreResult<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut handle = &file;
        handle.write_all(&header.encode())?;
        sync_file(&file, sync_mode)?;
        let index = Index::new(header.first_version, header.absolute_root, HEADER_SIZE);
        Self::assemble(
            path,
            header,
            sync_mode,
            index,
            WriterState {
                file: Some(file),
                committed_len: HEADER_SIZE,
                dirty: false,
            },
        )
    }

    fn assemble(
        path: &Path,
        header: Header,
        sync_mode: SyncMode,
        index: Index,
        writer: WriterState,
    ) -> StoreResult<Arc<Self>> {
        let name = display_name(path);
        let reader = Arc::new(ReadHandle::open(path, &name)?);
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            name,
            header,
            sync_mode,
            reader,
            index: RwLock::new(Arc::new(index)),
            writer_gate: Gate::new(),
            writer: Mutex::new(writer),
            frozen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Open an existing generation file, replaying its committed frames.
    /// A torn final frame is ignored and trimmed by the next writer.
    pub fn open(path: &Path, sync_mode: SyncMode) -> StoreResult<Arc<Self>> {
        let name = display_name(path);
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::MissingGeneration(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE {
            return Err(StoreError::Truncated {
                path: name,
                detail: format!("{} bytes, header needs {}", file_len, HEADER_SIZE),
            });
        }
        let mut raw = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut raw)?;
        let header = Header::decode(&raw).map_err(|detail| StoreError::Corrupt {
            path: name.clone(),
            detail,
        })?;

        let mut index = Index::new(header.first_version, header.absolute_root, HEADER_SIZE);
        let committed_len = Self::replay(&name, &mut BufReader::new(file), file_len, &mut index)?;
        if committed_len < file_len {
            tracing::warn!(
                generation = %name,
                committed_len,
                file_len,
                "ignoring torn commit at generation tail"
            );
        }
        tracing::debug!(
            generation = %name,
            last_version = index.last_version(),
            folders = index.folder_count(),
            "opened generation"
        );
        Self::assemble(
            path,
            header,
            sync_mode,
            index,
            WriterState {
                file: None,
                committed_len,
                dirty: committed_len != file_len,
            },
        )
    }

    /// Apply every intact frame after the header. Returns the committed
    /// length: the offset just past the last intact frame.
    fn replay<R: Read>(name: &str, reader: &mut R, file_len: u64, index: &mut Index) -> StoreResult<u64> {
        let corrupt = |detail: String| StoreError::Corrupt {
            path: name.to_string(),
            detail,
        };
        let mut pos = HEADER_SIZE;
        let mut frame_header = [0u8; FRAME_HEADER_SIZE as usize];
        while pos + FRAME_HEADER_SIZE <= file_len {
            reader.read_exact(&mut frame_header)?;
            let (body_len, crc) = format::decode_frame_header(&frame_header);
            if body_len < BODY_PREFIX_SIZE || body_len > file_len - pos - FRAME_HEADER_SIZE {
                break;
            }
            let mut body = vec![0u8; body_len as usize];
            reader.read_exact(&mut body)?;
            if crc32fast::hash(&body) != crc {
                tracing::warn!("generation {}: checksum mismatch at offset {}", name, pos);
                break;
            }
            let (version, op_count, ops) = format::split_body(&body).map_err(corrupt)?;
            index
                .apply(ops, op_count, version, pos + FRAME_HEADER_SIZE + BODY_PREFIX_SIZE)
                .map_err(|detail| corrupt(format!("frame at offset {}: {}", pos, detail)))?;
            pos += FRAME_HEADER_SIZE + body_len;
        }
        index.set_file_len(pos);
        Ok(pos)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lineage(&self) -> u64 {
        self.header.lineage()
    }

    /// Lower bound of every version committed to this generation.
    pub fn first_version(&self) -> u64 {
        self.header.first_version
    }

    pub fn last_version(&self) -> u64 {
        self.index.read().last_version()
    }

    /// Live bytes over file bytes; 1.0 when nothing has been overwritten.
    pub fn load_factor(&self) -> f32 {
        self.index.read().load_factor()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GenerationStats {
        let index = self.index.read().clone();
        GenerationStats {
            name: self.name.clone(),
            first_version: self.header.first_version,
            last_version: index.last_version(),
            file_len: index.file_len(),
            live_bytes: index.live_bytes(),
            load_factor: index.load_factor(),
            folders: index.folder_count(),
            documents: index.document_count(),
            frozen: self.is_frozen(),
        }
    }

    /// Every byte of the file belongs to a committed frame, and there is at
    /// least one frame.
    pub(crate) fn is_complete(&self) -> bool {
        let writer = self.writer.lock();
        !writer.dirty && writer.committed_len > HEADER_SIZE
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::misuse(format!("generation {} is closed", self.name)));
        }
        Ok(())
    }

    /// Pin the current committed state.
    pub fn query(self: &Arc<Self>) -> StoreResult<GenerationQuery> {
        self.check_open()?;
        let index = self.index.read().clone();
        let root = Folder::root(self.lineage(), index.last_version());
        Ok(GenerationQuery {
            generation: Arc::clone(self),
            index,
            root,
        })
    }

    /// Begin a write transaction, blocking while another one is open.
    pub fn update(self: &Arc<Self>) -> StoreResult<GenerationUpdate> {
        self.check_open()?;
        self.writer_gate.acquire();
        let ready = if self.is_frozen() {
            Err(StoreError::Frozen(self.name.clone()))
        } else {
            self.check_open().and_then(|_| self.prepare_writer())
        };
        if let Err(e) = ready {
            self.writer_gate.release();
            return Err(e);
        }
        Ok(GenerationUpdate {
            generation: Arc::clone(self),
            holding: true,
            version: next_version(self.last_version()),
            ops: Vec::new(),
            op_count: 0,
            document_open: false,
            state: UpdateState::Open,
        })
    }

    /// Spawn a successor generation at `path` and freeze this one.
    pub fn spawn(self: &Arc<Self>, path: &Path) -> StoreResult<Arc<Generation>> {
        let mut update = self.update()?;
        let young = update.spawn(path);
        update.close();
        young
    }

    /// Open the writer file and trim anything past the committed length.
    /// Caller holds the writer gate.
    fn prepare_writer(&self) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        if writer.file.is_none() {
            writer.file = Some(OpenOptions::new().read(true).write(true).open(&self.path)?);
        }
        if writer.dirty {
            let committed_len = writer.committed_len;
            if let Some(file) = writer.file.as_ref() {
                file.set_len(committed_len)?;
                sync_file(file, self.sync_mode)?;
            }
            writer.dirty = false;
            tracing::info!(generation = %self.name, committed_len, "trimmed uncommitted tail");
        }
        Ok(())
    }

    /// Append one frame and publish the index that includes it.
    /// Caller holds the writer gate.
    fn append(&self, version: u64, op_count: u32, ops: &[u8]) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        let start = writer.committed_len;
        let file = writer
            .file
            .as_ref()
            .ok_or_else(|| StoreError::misuse(format!("generation {} has no open writer", self.name)))?;
        let written = Self::write_frame(file, start, self.sync_mode, |frame| {
            frame.write(&format::body_prefix(version, op_count))?;
            frame.write(ops)
        });
        let end = match written {
            Ok(end) => end,
            Err(e) => {
                let trimmed = file.set_len(start);
                writer.dirty = trimmed.is_err();
                tracing::error!(generation = %self.name, error = %e, "commit failed");
                return Err(e.into());
            }
        };

        let mut next = (**self.index.read()).clone();
        next.apply(ops, op_count, version, start + FRAME_HEADER_SIZE + BODY_PREFIX_SIZE)
            .map_err(|detail| StoreError::Corrupt {
                path: self.name.clone(),
                detail,
            })?;
        next.set_file_len(end);
        *self.index.write() = Arc::new(next);
        writer.committed_len = end;
        tracing::debug!(generation = %self.name, version, op_count, bytes = end - start, "committed");
        Ok(())
    }

    fn write_frame(
        file: &File,
        start: u64,
        sync_mode: SyncMode,
        body: impl FnOnce(&mut FrameWriter<'_>) -> io::Result<()>,
    ) -> io::Result<u64> {
        let mut frame = FrameWriter::begin(file, start)?;
        body(&mut frame)?;
        let end = frame.finish()?;
        sync_file(file, sync_mode)?;
        Ok(end)
    }

    fn committed_len(&self) -> u64 {
        self.writer.lock().committed_len
    }

    /// Append every committed frame of `other` to this generation. Other
    /// must be quiescent. Re-running a merge that was interrupted (or even
    /// completed) leaves the same logical content.
    pub fn merge(&self, other: &Generation) -> StoreResult<()> {
        if other.lineage() != self.lineage() {
            return Err(StoreError::misuse(format!(
                "cannot merge {} into {}: different stores",
                other.name, self.name
            )));
        }
        self.check_open()?;
        self.writer_gate.acquire();
        let result = self
            .prepare_writer()
            .and_then(|_| self.merge_locked(other));
        self.writer_gate.release();
        result
    }

    fn merge_locked(&self, other: &Generation) -> StoreResult<()> {
        let source_len = other.committed_len();
        let mut source = BufReader::new(File::open(&other.path)?);
        source.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut writer = self.writer.lock();
        let start = writer.committed_len;
        let file = writer
            .file
            .as_ref()
            .ok_or_else(|| StoreError::misuse(format!("generation {} has no open writer", self.name)))?;
        let mut next = (**self.index.read()).clone();
        let copied = self.copy_frames(file, start, &other.name, &mut source, source_len, &mut next);
        let (end, frames) = match copied {
            Ok(done) => done,
            Err(e) => {
                let trimmed = file.set_len(start);
                writer.dirty = trimmed.is_err();
                return Err(e);
            }
        };
        next.set_file_len(end);
        *self.index.write() = Arc::new(next);
        writer.committed_len = end;
        tracing::info!(
            target_gen = %self.name,
            source_gen = %other.name,
            frames,
            bytes = end - start,
            "merged generation"
        );
        Ok(())
    }

    fn copy_frames<R: Read>(
        &self,
        file: &File,
        start: u64,
        source_name: &str,
        source: &mut R,
        source_len: u64,
        next: &mut Index,
    ) -> StoreResult<(u64, usize)> {
        let corrupt = |detail: String| StoreError::Corrupt {
            path: source_name.to_string(),
            detail,
        };
        let mut read_pos = HEADER_SIZE;
        let mut write_pos = start;
        let mut frames = 0;
        let mut frame_header = [0u8; FRAME_HEADER_SIZE as usize];
        while read_pos < source_len {
            if source_len - read_pos < FRAME_HEADER_SIZE {
                return Err(corrupt(format!("partial frame header at offset {}", read_pos)));
            }
            source.read_exact(&mut frame_header)?;
            let (body_len, crc) = format::decode_frame_header(&frame_header);
            if body_len > source_len - read_pos - FRAME_HEADER_SIZE {
                return Err(corrupt(format!("frame at offset {} overruns committed data", read_pos)));
            }
            let mut body = vec![0u8; body_len as usize];
            source.read_exact(&mut body)?;
            if crc32fast::hash(&body) != crc {
                return Err(corrupt(format!("checksum mismatch at offset {}", read_pos)));
            }
            let (version, op_count, ops) = format::split_body(&body).map_err(corrupt)?;
            next.apply(ops, op_count, version, write_pos + FRAME_HEADER_SIZE + BODY_PREFIX_SIZE)
                .map_err(corrupt)?;
            let mut frame = FrameWriter::begin(file, write_pos)?;
            frame.write(&body)?;
            write_pos = frame.finish()?;
            read_pos += FRAME_HEADER_SIZE + body_len;
            frames += 1;
        }
        sync_file(file, self.sync_mode)?;
        Ok((write_pos, frames))
    }

    /// Write only the live content to a new file at `path` and open it.
    /// Folder versions, authority flags and the first version carry over.
    pub fn compact(&self, path: &Path) -> StoreResult<Arc<Generation>> {
        let index = self.index.read().clone();
        let header = Header {
            first_version: self.header.first_version,
            tag: self.header.tag,
            absolute_root: index.root().absolute,
        };
        let folders = index.folders();
        let op_count = folders.len() + index.document_count();
        let op_count = u32::try_from(op_count)
            .map_err(|_| StoreError::misuse(format!("{} entries exceed one frame", op_count)))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut handle = &file;
        handle.write_all(&header.encode())?;
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; COPY_CHUNK];
        Self::write_frame(&file, HEADER_SIZE, self.sync_mode, |frame| {
            frame.write(&format::body_prefix(0, op_count))?;
            for (folder, node) in &folders {
                buf.clear();
                format::encode_stamp(&mut buf, folder, node.version, node.absolute);
                frame.write(&buf)?;
            }
            for (folder, node) in &folders {
                for (key, slot) in &node.entries {
                    let Slot::Document(doc) = slot else { continue };
                    buf.clear();
                    format::encode_put_head(&mut buf, folder, key, doc.len);
                    frame.write(&buf)?;
                    let mut copied = 0u64;
                    while copied < doc.len {
                        let n = (doc.len - copied).min(COPY_CHUNK as u64) as usize;
                        self.reader.read_exact_at(doc.offset + copied, &mut chunk[..n])?;
                        frame.write(&chunk[..n])?;
                        copied += n as u64;
                    }
                }
            }
            Ok(())
        })?;
        drop(file);

        let compacted = Generation::open(path, self.sync_mode)?;
        tracing::info!(
            source_gen = %self.name,
            target_gen = %compacted.name,
            before_bytes = index.file_len(),
            after_bytes = compacted.stats().file_len,
            "compacted generation"
        );
        Ok(compacted)
    }

    /// Refuse new queries and writers, wait out the current writer, then
    /// release the file. Open queries keep reading through their own handle,
    /// even after the file is unlinked.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer_gate.acquire();
        let file = self.writer.lock().file.take();
        self.writer_gate.release();
        if let Some(file) = file {
            sync_file(&file, self.sync_mode)?;
        }
        tracing::debug!(generation = %self.name, "closed generation");
        Ok(())
    }
}

/// A pinned, immutable view of one generation.
pub struct GenerationQuery {
    generation: Arc<Generation>,
    index: Arc<Index>,
    root: Folder,
}

impl GenerationQuery {
    fn check_folder(&self, folder: &Folder) -> StoreResult<()> {
        if folder.lineage() != self.root.lineage() {
            return Err(StoreError::misuse("folder belongs to a different store"));
        }
        Ok(())
    }

    /// Keys in `folder`, plus whether this generation is authoritative for
    /// the folder (older generations can add nothing).
    pub(crate) fn list(&self, folder: &Folder) -> StoreResult<(Vec<Vec<u8>>, bool)> {
        self.check_folder(folder)?;
        match self.index.resolve(folder.path()) {
            Ok(node) => Ok((node.entries.keys().cloned().collect(), node.absolute)),
            Err(missing) => Ok((Vec::new(), missing.is_absolute())),
        }
    }

    pub(crate) fn first_version(&self) -> u64 {
        self.generation.first_version()
    }
}

impl Query for GenerationQuery {
    fn root(&self) -> &Folder {
        &self.root
    }

    fn find(&self, folder: &Folder, key: &[u8]) -> StoreResult<Value> {
        self.check_folder(folder)?;
        let node = match self.index.resolve(folder.path()) {
            Ok(node) => node,
            Err(missing) => return Ok(Value::Missing(missing)),
        };
        Ok(match node.entries.get(key) {
            Some(Slot::Document(doc)) => Value::Document(Document::new(
                Arc::clone(&self.generation.reader),
                doc.offset,
                doc.len,
            )),
            Some(Slot::Folder) => {
                let path = folder.child_path(key);
                match self.index.resolve(&path) {
                    Ok(child) => Value::Folder(Folder::new(self.root.lineage(), path, child.version)),
                    Err(missing) => Value::Missing(missing),
                }
            }
            None => Value::Missing(Missing::new(node.absolute)),
        })
    }

    fn keys(&self, folder: &Folder) -> StoreResult<Vec<Vec<u8>>> {
        self.list(folder).map(|(keys, _)| keys)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateState {
    Open,
    Committed,
    Closed,
}

/// Exclusive write transaction on one generation. Ops are buffered and hit
/// the file as a single frame at commit.
pub struct GenerationUpdate {
    generation: Arc<Generation>,
    holding: bool,
    version: u64,
    ops: Vec<u8>,
    op_count: u32,
    document_open: bool,
    state: UpdateState,
}

impl GenerationUpdate {
    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    fn ready(&self) -> StoreResult<()> {
        match self.state {
            UpdateState::Committed => return Err(StoreError::misuse("update already committed")),
            UpdateState::Closed => return Err(StoreError::misuse("update is closed")),
            UpdateState::Open => {}
        }
        if self.document_open {
            return Err(StoreError::misuse("a document was left unfinished"));
        }
        Ok(())
    }

    fn begin_op(&self, folder: &Folder) -> StoreResult<()> {
        self.ready()?;
        if folder.lineage() != self.generation.lineage() {
            return Err(StoreError::misuse("folder belongs to a different store"));
        }
        if self.op_count == u32::MAX {
            return Err(StoreError::misuse("too many operations in one update"));
        }
        Ok(())
    }

    /// Create the successor generation at `path` while holding this
    /// generation's writer, and freeze this generation so no later writer
    /// can commit to it.
    pub fn spawn(&mut self, path: &Path) -> StoreResult<Arc<Generation>> {
        self.ready()?;
        let parent = &self.generation;
        let header = Header {
            first_version: next_version(parent.last_version()),
            tag: parent.header.tag,
            absolute_root: false,
        };
        let young = Generation::create_with(path, header, parent.sync_mode)?;
        parent.frozen.store(true, Ordering::Release);
        tracing::info!(
            parent_gen = %parent.name,
            young_gen = %young.name,
            first_version = header.first_version,
            "spawned generation"
        );
        Ok(young)
    }

    fn release(&mut self) {
        if self.holding {
            self.holding = false;
            self.generation.writer_gate.release();
        }
    }
}

impl Update for GenerationUpdate {
    fn open(&mut self, folder: &Folder, key: &[u8]) -> StoreResult<ByteSink<'_>> {
        self.begin_op(folder)?;
        let len_at = format::encode_put_head(&mut self.ops, folder.path(), key, 0);
        let doc_start = self.ops.len();
        self.document_open = true;
        Ok(Box::new(GenerationSink {
            update: self,
            len_at,
            doc_start,
        }))
    }

    fn touch(&mut self, folder: &Folder) -> StoreResult<Folder> {
        self.begin_op(folder)?;
        format::encode_touch(&mut self.ops, folder.path());
        self.op_count += 1;
        Ok(Folder::new(
            folder.lineage(),
            Arc::clone(folder.path_handle()),
            self.version,
        ))
    }

    fn nest(&mut self, folder: &Folder, key: &[u8]) -> StoreResult<Folder> {
        self.begin_op(folder)?;
        let path = folder.child_path(key);
        format::encode_touch(&mut self.ops, &path);
        self.op_count += 1;
        Ok(Folder::new(folder.lineage(), path, self.version))
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.ready()?;
        self.state = UpdateState::Committed;
        let result = if self.op_count == 0 {
            Ok(())
        } else {
            self.generation.append(self.version, self.op_count, &self.ops)
        };
        self.ops = Vec::new();
        self.release();
        result
    }

    fn close(&mut self) {
        if self.state == UpdateState::Open {
            self.state = UpdateState::Closed;
        }
        self.ops = Vec::new();
        self.release();
    }
}

impl Drop for GenerationUpdate {
    fn drop(&mut self) {
        self.close();
    }
}

struct GenerationSink<'a> {
    update: &'a mut GenerationUpdate,
    len_at: usize,
    doc_start: usize,
}

impl Write for GenerationSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update.ops.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DocumentSink for GenerationSink<'_> {
    fn finish(self: Box<Self>) -> StoreResult<()> {
        let len = (self.update.ops.len() - self.doc_start) as u64;
        self.update.ops[self.len_at..self.len_at + 8].copy_from_slice(&len.to_le_bytes());
        self.update.op_count += 1;
        self.update.document_open = false;
        Ok(())
    }
}

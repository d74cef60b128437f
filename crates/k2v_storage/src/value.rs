//! Storable values: documents, folders and the "no such value" marker.
//!
//! A [`Folder`] is a cheap, cloneable token naming a path of keys from the
//! store root. It carries the version of the commit (or query) that produced
//! it; the generational store uses that version to decide which generations
//! are allowed to answer a lookup.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Read};
use std::sync::Arc;

use k2v_common::error::StoreResult;

use crate::generation::ReadHandle;

/// Keys from the store root down to a folder. The root is the empty path.
pub type FolderPath = Arc<[Vec<u8>]>;

/// A versioned handle scoping a set of keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Folder {
    lineage: u64,
    path: FolderPath,
    version: u64,
}

impl Folder {
    pub(crate) fn new(lineage: u64, path: FolderPath, version: u64) -> Self {
        Self {
            lineage,
            path,
            version,
        }
    }

    pub(crate) fn root(lineage: u64, version: u64) -> Self {
        Self::new(lineage, Arc::from(Vec::new()), version)
    }

    /// Version stamp; later commits produce larger versions.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Keys leading from the root to this folder.
    pub fn path(&self) -> &[Vec<u8>] {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub(crate) fn path_handle(&self) -> &FolderPath {
        &self.path
    }

    /// Identifies the store lineage this folder was issued by.
    pub(crate) fn lineage(&self) -> u64 {
        self.lineage
    }

    pub(crate) fn child_path(&self, key: &[u8]) -> FolderPath {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.extend_from_slice(&self.path);
        path.push(key.to_vec());
        Arc::from(path)
    }
}

/// "No such value". Not an error.
///
/// Internally a miss is either absolute (the answering generation is
/// authoritative for this key back to the start of history) or relative
/// (an older generation must be consulted). Callers only see a miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Missing {
    absolute: bool,
}

impl Missing {
    pub(crate) const fn new(absolute: bool) -> Self {
        Self { absolute }
    }

    pub(crate) const fn absolute() -> Self {
        Self::new(true)
    }

    pub(crate) const fn relative() -> Self {
        Self::new(false)
    }

    pub(crate) fn is_absolute(&self) -> bool {
        self.absolute
    }
}

/// A stored byte string, read lazily from the generation that holds it.
#[derive(Clone)]
pub struct Document {
    source: Arc<ReadHandle>,
    offset: u64,
    length: u64,
}

impl Document {
    pub(crate) fn new(source: Arc<ReadHandle>, offset: u64, length: u64) -> Self {
        Self {
            source,
            offset,
            length,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Stream the document's bytes.
    pub fn reader(&self) -> DocumentReader {
        DocumentReader {
            source: Arc::clone(&self.source),
            position: self.offset,
            end: self.offset + self.length,
        }
    }

    pub fn read_all(&self) -> StoreResult<Vec<u8>> {
        let mut bytes = vec![0u8; self.length as usize];
        self.source.read_exact_at(self.offset, &mut bytes)?;
        Ok(bytes)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("generation", &self.source.name())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
            && self.offset == other.offset
            && self.length == other.length
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.source) as usize).hash(state);
        self.offset.hash(state);
        self.length.hash(state);
    }
}

/// `Read` over one document's byte range.
pub struct DocumentReader {
    source: Arc<ReadHandle>,
    position: u64,
    end: u64,
}

impl Read for DocumentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end - self.position;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(remaining as usize);
        self.source.read_exact_at(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Result of a lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Document(Document),
    Folder(Folder),
    Missing(Missing),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing(_))
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_folder(&self) -> Option<&Folder> {
        match self {
            Value::Folder(folder) => Some(folder),
            _ => None,
        }
    }
}

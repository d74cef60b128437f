//! Store-facing traits shared by the generational store, its single
//! generations and the commit batching decorator.

use std::io::Write;
use std::sync::Arc;

use k2v_common::error::StoreResult;

use crate::value::{Folder, Value};

/// A transactional key-value store.
pub trait K2v: Send + Sync {
    /// Open a read-only snapshot. Dropping the query releases it.
    fn query(&self) -> StoreResult<Box<dyn Query>>;

    /// Begin a write transaction. Writers are exclusive: this blocks until
    /// any other update has been committed or closed.
    fn update(&self) -> StoreResult<Box<dyn Update>>;

    /// Release all resources. The store must not be used afterwards.
    fn close(&self) -> StoreResult<()>;
}

impl<T: K2v + ?Sized> K2v for Arc<T> {
    fn query(&self) -> StoreResult<Box<dyn Query>> {
        (**self).query()
    }

    fn update(&self) -> StoreResult<Box<dyn Update>> {
        (**self).update()
    }

    fn close(&self) -> StoreResult<()> {
        (**self).close()
    }
}

/// A repeatable-read snapshot of a store.
pub trait Query: Send {
    /// Root folder, stamped with the snapshot's version.
    fn root(&self) -> &Folder;

    /// Look up `key` in `folder`. Absence is `Value::Missing`, not an error.
    fn find(&self, folder: &Folder, key: &[u8]) -> StoreResult<Value>;

    /// Keys directly inside `folder`, in byte order.
    fn keys(&self, folder: &Folder) -> StoreResult<Vec<Vec<u8>>>;
}

/// A write transaction. Everything written is invisible to queries until
/// [`Update::commit`] returns. Closing without committing discards it.
pub trait Update: Send {
    /// Begin writing the document stored at `key` in `folder`. The returned
    /// sink must be [`DocumentSink::finish`]ed before any other call on this
    /// update; a sink dropped unfinished poisons the transaction.
    fn open(&mut self, folder: &Folder, key: &[u8]) -> StoreResult<ByteSink<'_>>;

    /// Mark `folder` (and its ancestors) modified by this transaction.
    fn touch(&mut self, folder: &Folder) -> StoreResult<Folder>;

    /// Create, or reuse, the subfolder at `key` in `folder`. A document
    /// stored at `key` is replaced by an empty folder.
    fn nest(&mut self, folder: &Folder, key: &[u8]) -> StoreResult<Folder>;

    /// Make the transaction durable and visible, then release the writer.
    fn commit(&mut self) -> StoreResult<()>;

    /// Release the writer. Idempotent; discards uncommitted work.
    fn close(&mut self);

    /// Store `bytes` at `key` in `folder`.
    fn put(&mut self, folder: &Folder, key: &[u8], bytes: &[u8]) -> StoreResult<()> {
        let mut sink = self.open(folder, key)?;
        sink.write_all(bytes)?;
        sink.finish()
    }
}

/// Byte sink for one document.
pub trait DocumentSink: Write {
    /// Seal the document into its transaction.
    fn finish(self: Box<Self>) -> StoreResult<()>;
}

pub type ByteSink<'a> = Box<dyn DocumentSink + 'a>;

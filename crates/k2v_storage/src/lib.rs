pub mod api;
pub mod batch_gate;
mod gate;
pub mod gen_store;
pub mod generation;
pub mod naming;
mod retry;
pub mod value;

pub use api::{ByteSink, DocumentSink, K2v, Query, Update};
pub use batch_gate::{BatchGate, BatchStatsSnapshot};
pub use gen_store::{GenStore, GenStoreStats};
pub use generation::{Generation, GenerationStats};
pub use k2v_common::config::{StoreConfig, SyncMode};
pub use k2v_common::error::{ErrorKind, StoreError, StoreResult};
pub use value::{Document, DocumentReader, Folder, Missing, Value};

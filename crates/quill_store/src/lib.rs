//! # quill_store
//!
//! Naming and storage layer of the quill template cache.
//!
//! This crate provides:
//! - Resolution of logical template, partial and context names into
//!   canonical keys
//! - The [`Store`] contract with memory, file system and key/value backends
//! - Cancellation tokens and a non-short-circuiting batch waiter

mod error;
pub mod filesystem;
pub mod kv;
mod memory;
pub mod naming;
mod record;
mod store;
mod token;
pub mod waiter;

pub use error::{StoreError, TransportDetail};
pub use filesystem::{FileSystemStore, FsStoreConfig, MirrorReport, ModuleFormat};
pub use kv::{EmbeddedKv, KeyValueStore, KvEngine, KvError};
pub use memory::MemoryStore;
pub use naming::{ArtifactKind, DocKind, NameError, NamingConfig, NamingResolver, QueryParams};
pub use record::{
    CodeArtifact, CompiledRecord, Content, PartialRecord, RecordOrigin, RenderError, Renderer,
};
pub use store::{DiscoverFn, Lookup, Store};
pub use token::OpToken;
pub use waiter::{AggregateError, WaitError, wait_all};

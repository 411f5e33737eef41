//! # quill_core
//!
//! Compile orchestration for the quill template cache.
//!
//! This crate provides:
//! - The `Compiler` orchestrator driving resolve, fetch, compile and persist
//! - The partial registry and its precedence rules
//! - Source tree watching for file system stores
//! - Configuration loading
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quill_core::{Compiler, CompilerOptions};
//! use quill_store::{FileSystemStore, FsStoreConfig};
//!
//! let options = CompilerOptions::from_file("quill.json")?;
//! let store = FileSystemStore::new(FsStoreConfig::new("templates"), options.resolver()?);
//! let compiler = Compiler::new(options, Arc::new(store), Arc::new(MyGenerator));
//!
//! compiler.scan().await?;
//! compiler.watch()?;
//! let html = compiler.render("template", &context, &serde_json::Value::Null).await?;
//! ```

mod compiler;
mod config;
mod error;
mod generator;
pub mod registry;
pub mod renderers;
pub mod watcher;

pub use compiler::{CompileRequest, Compiler};
pub use config::{CompilerOptions, RenderTimePolicy};
pub use error::QuillError;
pub use generator::{GenerateError, Generator};
pub use registry::{PartialRegistry, Registration};
pub use renderers::RendererCache;
pub use watcher::{DEBOUNCE_WINDOW, WatchEvent, WatchSink, Watcher};

#[cfg(test)]
mod test_utils;

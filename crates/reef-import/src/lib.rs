//! Reef Import Library
//!
//! Moves data from a source into a target: fetch raw files, parse them into
//! rows, map columns, optionally classify rows against the previous run
//! (delta sync), and write them to a relational database or a local file.
//!
//! # Stages
//!
//! - **Sources**: local directories, FTP/SFTP, paginated HTTP APIs
//! - **Parsers**: CSV/TSV, JSON, JSON-Lines, XML
//! - **Mapper**: column renames, defaults, transforms and type casts
//! - **Delta sync**: content hashes per natural key, persisted between runs
//! - **Targets**: SQL Server, MySQL, Postgres and SQLite tables, or CSV/JSON files
//!
//! # Example
//!
//! ```no_run
//! use reef_import::{ImportPipeline, ImportProfile, PlainTextDecryptor, SourceRegistry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     reef_import::init();
//!     let profile = ImportProfile::load("profiles/customers.toml")?;
//!     let registry = SourceRegistry::new(Arc::new(PlainTextDecryptor));
//!     let pipeline = ImportPipeline::from_profile(profile, &registry, &PlainTextDecryptor).await?;
//!     let summary = pipeline.run(CancellationToken::new()).await?;
//!     println!("{} inserted, {} updated", summary.result.inserted, summary.result.updated);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delta;
pub mod error;
pub mod mapper;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod source;
pub mod target;

pub use crate::config::{ImportProfile, PlainTextDecryptor, SecretDecryptor};
pub use crate::error::{ImportError, Result};
pub use crate::models::{ExecutionSummary, ImportBatchResult, Row, RowError, RowErrorKind, Value};
pub use crate::pipeline::ImportPipeline;
pub use crate::source::{ImportSource, SourceRegistry};
pub use crate::target::{ImportTarget, ImportWriteContext};

/// One-time process setup; call before connecting any sqlx target
pub fn init() {
    sqlx::any::install_default_drivers();
}

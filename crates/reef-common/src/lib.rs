//! Reef Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Reef import workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`ReefError`] and the [`Result`] alias
//! - **Checksums**: streaming digests used for file verification and
//!   delta-sync row hashing
//! - **Logging**: one `tracing` setup shared by every binary
//! - **Types**: small enums shared across crates
//!
//! # Example
//!
//! ```no_run
//! use reef_common::checksum::compute_file_checksum;
//! use reef_common::types::ChecksumAlgorithm;
//!
//! fn fingerprint(path: &str) -> reef_common::Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Sha256)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{ReefError, Result};

//! IHM Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the IHM report collector workspace.
//!
//! - **Error Handling**: [`IhmError`] and the [`Result`] alias
//! - **Checksums**: SHA-256 content hashes used for change detection and backups
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` environment variables
//!
//! # Example
//!
//! ```no_run
//! use ihm_common::checksum::sha256_file;
//! use ihm_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<String> {
//!     sha256_file(path)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{IhmError, Result};

//! # grotto-core
//!
//! A library for locating code caves in Portable Executable (PE) binaries.
//!
//! A code cave is a maximal run of zero bytes inside a section's on-disk raw
//! data, large enough to hold a patch or payload without growing the file.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`pe`]: Section locator, a minimal bounds-checked PE header parser
//! - [`scanner`]: Zero-run scanning over each section's raw data
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use grotto_core::{CaveRecord, CaveScanner, ScannerConfig, SectionTable};
//! use std::fs;
//!
//! // Read a PE file
//! let image = fs::read("./target/release/my_app.exe")?;
//!
//! // Locate its sections
//! let table = SectionTable::parse(&image)?;
//!
//! // Find caves of at least 128 bytes
//! let scanner = CaveScanner::new(ScannerConfig::new(128)?);
//! let mut caves: Vec<CaveRecord> = Vec::new();
//! scanner.scan_image(&image, &table, &mut caves)?;
//!
//! for cave in caves {
//!     println!("{} {:#x} {}", cave.section_name, cave.absolute_offset, cave.length);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`CaveSink`]: Receive records as they are found instead of collecting them
//! - [`TablePolicy`]: Choose between rejecting and truncating a section table
//!   that does not fit in the file
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod error;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod pe;
pub mod scanner;

// Re-export primary types for convenience
pub use error::{Error, Result};
pub use pe::{LocatorConfig, SectionDescriptor, SectionName, SectionTable, TablePolicy};
pub use scanner::{
    scan_file, scan_file_with_config, CaveRecord, CaveScanner, CaveSink, ScanSummary,
    ScannerConfig, SectionCaves,
};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

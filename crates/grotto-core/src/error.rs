//! Error types for the grotto-core library.
//!
//! Every failure is terminal for the image being analysed: a malformed file
//! yields an error and no cave records, never a panic or an out-of-bounds read.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for grotto operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all grotto operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Structurally invalid or truncated header or section table
    #[error("malformed image at offset {offset:#x}: {details}")]
    MalformedImage {
        /// File offset where the structure broke
        offset: u64,
        /// Detailed description of the issue
        details: String,
    },

    /// The legacy `MZ` magic or the `PE\0\0` signature did not match
    #[error("not a PE file: {details}")]
    NotAPeFile {
        /// What was expected and what was found
        details: String,
    },

    /// A caller-supplied parameter is out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new malformed image error
    pub fn malformed(offset: u64, details: impl Into<String>) -> Self {
        Self::MalformedImage {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new signature mismatch error
    pub fn not_a_pe_file(details: impl Into<String>) -> Self {
        Self::NotAPeFile {
            details: details.into(),
        }
    }

    /// Creates a new invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Returns true if the input was recognised as PE but its structure is broken
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedImage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::malformed(0x3c, "e_lfanew points past end of file");
        assert_eq!(
            err.to_string(),
            "malformed image at offset 0x3c: e_lfanew points past end of file"
        );

        let err = Error::not_a_pe_file("missing MZ magic");
        assert!(err.to_string().contains("not a PE file"));
    }

    #[test]
    fn test_is_malformed() {
        assert!(Error::malformed(0, "test").is_malformed());
        assert!(!Error::not_a_pe_file("test").is_malformed());
        assert!(!Error::invalid_argument("test").is_malformed());
    }
}

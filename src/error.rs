//! Error types for registry hive operations.
//!
//! This module provides comprehensive error handling for all hive operations,
//! covering I/O failures, format violations, allocator faults, and the
//! editing/merge layers built on top of them.

use std::io;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while reading or editing a registry hive.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error occurred while reading, extending, or syncing the hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in header or cell.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Cell offset is outside the data region.
    #[error("Invalid cell offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset {
        offset: u32,
        hive_size: usize,
    },

    /// Cell size is not a multiple of 8 of at least 8 bytes.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize {
        size: i32,
        offset: u32,
    },

    /// An allocated cell was required but the offset resolves to a free cell.
    #[error("Cell at offset {offset:#x} is free")]
    FreeCell {
        offset: u32,
    },

    /// Unknown or unsupported cell type.
    #[error("Unknown cell type: {cell_type:?} at offset {offset:#x}")]
    UnknownCellType {
        cell_type: [u8; 2],
        offset: u32,
    },

    /// Key or value not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An operation refused to proceed under the configured conflict policy,
    /// or a structural precondition (such as "no subkeys") did not hold.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A derived-state invariant was violated. Indicates an internal bug.
    #[error("Inconsistent index: {0}")]
    InconsistentIndex(String),

    /// A cancellation token fired during traversal.
    #[error("Traversal cancelled")]
    Cancelled,

    /// Invalid UTF-16 string data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 {
        offset: u32,
    },

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        size: usize,
        minimum: usize,
    },

    /// Hive would exceed the 32-bit file size limit of the format.
    #[error("Hive too large: {size} bytes (offsets are 32-bit)")]
    HiveTooLarge {
        size: u64,
    },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        expected: u32,
        calculated: u32,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        major: u32,
        minor: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// Invalid subkey list type.
    #[error("Invalid subkey list type: {list_type:?}")]
    InvalidSubkeyList {
        list_type: [u8; 2],
    },

    /// The hive was closed mid-transaction; primary and secondary sequence
    /// numbers do not match.
    #[error("Torn transaction: primary sequence {primary} != secondary sequence {secondary}")]
    TornTransaction {
        primary: u32,
        secondary: u32,
    },

    /// A mutating operation was attempted through a read-only handle.
    #[error("Hive handle is read-only")]
    ReadOnlyHive,
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid offset error with context.
    pub fn invalid_offset(offset: u32, hive_size: usize) -> Self {
        Self::InvalidOffset { offset, hive_size }
    }

    /// Creates an invalid cell size error with context.
    pub fn invalid_cell_size(size: i32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a format error with detailed context.
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }

    /// Creates a not found error with context about what was being searched.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use reg_editor::error::RegistryError;
    /// let err = RegistryError::not_found("value", "DisplayName");
    /// ```
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates an unknown cell type error.
    pub fn unknown_cell_type(cell_type: [u8; 2], offset: u32) -> Self {
        Self::UnknownCellType { cell_type, offset }
    }

    /// Returns true if this error indicates structural corruption of the
    /// on-disk hive (as opposed to an absent item or a policy refusal).
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature { .. }
                | Self::InvalidFormat(_)
                | Self::InvalidOffset { .. }
                | Self::InvalidCellSize { .. }
                | Self::FreeCell { .. }
                | Self::UnknownCellType { .. }
                | Self::TruncatedData { .. }
                | Self::InvalidSubkeyList { .. }
        )
    }
}

//! Registry hive base block (header) parsing and serialization.
//!
//! The base block is the first 4096 bytes (0x1000) of a registry hive file.
//! It contains metadata about the hive including version, timestamps, the
//! root key cell offset, and the dual sequence numbers that implement the
//! crash-consistency protocol.

use crate::error::{RegistryError, Result};
use crate::utils::{
    calculate_checksum, encode_utf16_le, read_u32_le, read_utf16_string, write_u32_le,
    write_u64_le,
};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the primary sequence number.
pub const SEQ_PRIMARY_OFFSET: usize = 0x04;

/// Offset of the secondary sequence number.
pub const SEQ_SECONDARY_OFFSET: usize = 0x08;

/// Offset of the last-written FILETIME.
pub const TIMESTAMP_OFFSET: usize = 0x0C;

/// Offset of the root cell offset field.
pub const ROOT_CELL_OFFSET: usize = 0x24;

/// Offset of the hive data size field.
pub const HIVE_LENGTH_OFFSET: usize = 0x28;

/// Offset of the file name in the base block.
const FILE_NAME_OFFSET: usize = 0x30;

/// Length of the file name field (32 UTF-16LE characters = 64 bytes).
const FILE_NAME_LENGTH: usize = 64;

/// Offset of the checksum field in the base block.
pub const CHECKSUM_OFFSET: usize = 0x1FC;

/// Registry hive base block header.
///
/// This structure represents the first 4KB of a registry hive file and
/// contains critical metadata about the hive.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Signature, should be "regf" (0x66676572).
    pub signature: [u8; 4],

    /// Primary sequence number.
    pub primary_sequence: u32,

    /// Secondary sequence number.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = normal, 1 = transaction log).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Offset to root key cell (relative to first hbin).
    pub root_cell_offset: u32,

    /// Length of hive data in bytes.
    pub hive_length: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// File name (embedded, 32 UTF-16LE characters).
    pub file_name: String,

    /// Checksum (XOR-fold of the first 127 DWORDs).
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses a base block from raw bytes.
    ///
    /// Sequence-number equality and checksum verification are left to the
    /// open path: a hive closed mid-transaction legitimately carries
    /// mismatched sequences and a stale checksum, and whether to accept it
    /// is an open-time policy decision.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Version is unsupported
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &signature));
        }

        let primary_sequence = read_u32_le(data, SEQ_PRIMARY_OFFSET)?;
        let secondary_sequence = read_u32_le(data, SEQ_SECONDARY_OFFSET)?;

        // Last written timestamp (8 bytes at offset 0x0C)
        let last_written = u64::from(read_u32_le(data, 0x0C)?)
            | (u64::from(read_u32_le(data, 0x10)?) << 32);

        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, ROOT_CELL_OFFSET)?;
        let hive_length = read_u32_le(data, HIVE_LENGTH_OFFSET)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;

        let file_name_bytes = &data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH];
        let file_name = read_utf16_string(file_name_bytes, FILE_NAME_OFFSET as u32)
            .unwrap_or_default();

        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        // Verify version (support 1.3, 1.4, 1.5, 1.6)
        if major_version != 1 || !(3..=6).contains(&minor_version) {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            hive_length,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// Serializes a fresh version 1.5 base block into `buf`.
    ///
    /// Both sequence numbers start at 1 (a committed, consistent state) and
    /// the checksum is computed over the finished header.
    pub fn write_new(
        buf: &mut [u8],
        root_cell_offset: u32,
        hive_length: u32,
        file_name: &str,
        timestamp: u64,
    ) -> Result<()> {
        if buf.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: buf.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        buf[..BASE_BLOCK_SIZE].fill(0);
        buf[0..4].copy_from_slice(REGF_SIGNATURE);
        write_u32_le(buf, SEQ_PRIMARY_OFFSET, 1)?;
        write_u32_le(buf, SEQ_SECONDARY_OFFSET, 1)?;
        write_u64_le(buf, TIMESTAMP_OFFSET, timestamp)?;
        write_u32_le(buf, 0x14, 1)?; // major version
        write_u32_le(buf, 0x18, 5)?; // minor version
        write_u32_le(buf, 0x1C, 0)?; // file type: normal
        write_u32_le(buf, 0x20, 1)?; // file format: direct memory load
        write_u32_le(buf, ROOT_CELL_OFFSET, root_cell_offset)?;
        write_u32_le(buf, HIVE_LENGTH_OFFSET, hive_length)?;
        write_u32_le(buf, 0x2C, 1)?; // clustering factor

        let name_bytes = encode_utf16_le(file_name);
        let copy_len = name_bytes.len().min(FILE_NAME_LENGTH);
        buf[FILE_NAME_OFFSET..FILE_NAME_OFFSET + copy_len]
            .copy_from_slice(&name_bytes[..copy_len]);

        let checksum = calculate_checksum(buf);
        write_u32_le(buf, CHECKSUM_OFFSET, checksum)?;

        Ok(())
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when primary and secondary sequence numbers
    /// match; inequality marks a torn transaction.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Converts the last written timestamp to a human-readable format.
    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        crate::utils::filetime_to_datetime(self.last_written)
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell Offset: {:#x}\n\
             - Hive Length: {} bytes\n\
             - Consistent: {}\n\
             - File Name: {}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.hive_length,
            self.is_consistent(),
            self.file_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_block_size() {
        assert_eq!(BASE_BLOCK_SIZE, 4096);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), RegistryError::InvalidSignature { .. }));
    }

    #[test]
    fn test_too_small() {
        let data = vec![0u8; 100];
        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), RegistryError::HiveTooSmall { .. }));
    }

    #[test]
    fn test_write_new_round_trip() {
        let mut buf = vec![0u8; BASE_BLOCK_SIZE];
        BaseBlock::write_new(&mut buf, 0x20, 4096, "unit-test", 0x1D8000000000000).unwrap();

        let block = BaseBlock::parse(&buf).unwrap();
        assert_eq!(&block.signature, b"regf");
        assert_eq!(block.primary_sequence, 1);
        assert_eq!(block.secondary_sequence, 1);
        assert!(block.is_consistent());
        assert_eq!(block.root_cell_offset, 0x20);
        assert_eq!(block.hive_length, 4096);
        assert_eq!(block.major_version, 1);
        assert_eq!(block.minor_version, 5);
        assert_eq!(block.file_name, "unit-test");
        assert_eq!(block.checksum, calculate_checksum(&buf));
    }
}

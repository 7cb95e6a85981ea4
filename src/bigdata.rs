//! Big data block (db) parsing and serialization.
//!
//! Registry values larger than 16,344 bytes are stored in big data blocks,
//! which consist of a header cell pointing at a block list whose entries
//! reference fixed-size data segments.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u16_le, read_u32_le, write_u16_le, write_u32_le};

/// Maximum value data size stored in a single data cell. Larger values go
/// through a db structure.
pub const MAX_DIRECT_DATA_SIZE: u32 = 16344;

/// Size of each data segment referenced by a db block list. The final
/// segment may be shorter.
pub const BIG_DATA_SEGMENT_SIZE: usize = 16344;

/// Big data block header structure.
///
/// Format:
/// ```text
/// Offset  Size  Description
/// 0x00    2     Signature ("db")
/// 0x02    2     Number of segments
/// 0x04    4     Offset to segment list
/// ```
#[derive(Debug, Clone)]
pub struct BigDataBlock {
    /// Number of data segments
    pub segment_count: u16,

    /// Offset to the list of segment offsets
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    /// Minimum size of a big data block header
    const MIN_SIZE: usize = 8;

    /// Parses a big data block header from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "db" signature)
    /// * `offset` - Offset of this cell for error reporting
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"db" {
            return Err(RegistryError::invalid_signature(b"db", &data[0..2]));
        }

        let segment_count = read_u16_le(data, 0x02)?;
        let segment_list_offset = read_u32_le(data, 0x04)?;

        Ok(BigDataBlock {
            segment_count,
            segment_list_offset,
        })
    }

    /// Serializes a big data header payload.
    pub fn encode_new(segment_count: u16, segment_list_offset: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; Self::MIN_SIZE];
        buf[0..2].copy_from_slice(b"db");
        write_u16_le(&mut buf, 0x02, segment_count)?;
        write_u32_le(&mut buf, 0x04, segment_list_offset)?;
        Ok(buf)
    }

    /// Number of segments needed to hold `len` bytes of value data.
    pub fn segments_for(len: usize) -> usize {
        (len + BIG_DATA_SEGMENT_SIZE - 1) / BIG_DATA_SEGMENT_SIZE
    }
}

//! Hive bin (hbin) block parsing and initialization.
//!
//! Hive bins are 4KB-aligned blocks that contain registry cells. Each hbin
//! has a 32-byte header followed by a sequence of cells; no cell crosses a
//! bin boundary.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u32_le, write_u32_le, write_u64_le};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of an hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Bins start and size on multiples of this alignment.
pub const HBIN_ALIGNMENT: usize = 4096;

/// Hive bin header structure.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    /// Signature, should be "hbin" (0x6E696268).
    pub signature: [u8; 4],

    /// Offset of this hbin from the start of the hive bins (relative to 0x1000).
    pub offset: u32,

    /// Size of this hbin in bytes (including header).
    pub size: u32,

    /// Reserved fields.
    pub reserved: [u32; 2],

    /// Timestamp (Windows FILETIME).
    pub timestamp: u64,

    /// Spare field.
    pub spare: u32,
}

impl HbinHeader {
    /// Parses an hbin header from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the hbin header.
    /// * `expected_offset` - Expected offset value for validation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Offset doesn't match expected value
    /// - Size is zero or not a multiple of 4096
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != HBIN_SIGNATURE {
            return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &signature));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;

        if offset != expected_offset {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }

        if size == 0 || size as usize % HBIN_ALIGNMENT != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin size {:#x} at offset {:#x} is not a positive multiple of 4096",
                size, offset
            )));
        }

        let reserved = [read_u32_le(data, 0x0C)?, read_u32_le(data, 0x10)?];

        let timestamp = u64::from(read_u32_le(data, 0x14)?)
            | (u64::from(read_u32_le(data, 0x18)?) << 32);

        let spare = read_u32_le(data, 0x1C)?;

        Ok(HbinHeader {
            signature,
            offset,
            size,
            reserved,
            timestamp,
            spare,
        })
    }

    /// Initializes a fresh hbin header in `buf`.
    ///
    /// Used when the allocator appends a new bin to the hive. The remainder
    /// of the bin is expected to be claimed by a single free cell.
    pub fn init(buf: &mut [u8], offset: u32, size: u32, timestamp: u64) -> Result<()> {
        if buf.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: HBIN_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        buf[..HBIN_HEADER_SIZE].fill(0);
        buf[0..4].copy_from_slice(HBIN_SIGNATURE);
        write_u32_le(buf, 0x04, offset)?;
        write_u32_le(buf, 0x08, size)?;
        write_u64_le(buf, 0x14, timestamp)?;

        Ok(())
    }

    /// Returns the size of the data area (excluding the header).
    pub fn data_size(&self) -> u32 {
        self.size.saturating_sub(HBIN_HEADER_SIZE as u32)
    }
}

/// Extent of one bin inside the data region, kept by the hive handle so the
/// allocator can locate bin boundaries without re-parsing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinExtent {
    /// Start of the bin, relative to the first hbin.
    pub start: u32,

    /// Total bin size in bytes (header included).
    pub size: u32,
}

impl BinExtent {
    /// Returns the exclusive end offset of the bin.
    pub fn end(&self) -> u32 {
        self.start + self.size
    }

    /// Returns the offset of the first cell in the bin.
    pub fn first_cell(&self) -> u32 {
        self.start + HBIN_HEADER_SIZE as u32
    }

    /// Returns true if `offset` falls inside this bin.
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// Iterator over cells within an hbin's data area.
///
/// Yields allocated and free cells alike; the allocator uses it to seed the
/// free lists at open and to locate coalescing neighbors.
pub struct HbinCellIterator<'a> {
    data: &'a [u8],
    offset: usize,
    hbin_offset: u32,
}

impl<'a> HbinCellIterator<'a> {
    /// Creates a new cell iterator for an hbin's data area.
    ///
    /// # Arguments
    ///
    /// * `data` - The hbin's data area (excluding header).
    /// * `hbin_offset` - The offset of this hbin from the first hbin.
    pub fn new(data: &'a [u8], hbin_offset: u32) -> Self {
        Self {
            data,
            offset: 0,
            hbin_offset,
        }
    }
}

impl<'a> Iterator for HbinCellIterator<'a> {
    type Item = Result<CellInfo<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let cell_offset = self.hbin_offset + HBIN_HEADER_SIZE as u32 + self.offset as u32;

        let size = match crate::utils::read_i32_le(self.data, self.offset) {
            Ok(s) => s,
            Err(e) => return Some(Err(e)),
        };

        let abs_size = size.unsigned_abs() as usize;

        if abs_size < 8 || abs_size % 8 != 0 {
            return Some(Err(RegistryError::invalid_cell_size(size, cell_offset)));
        }

        let data_start = self.offset + 4;
        let data_end = self.offset + abs_size;

        if data_end > self.data.len() {
            return Some(Err(RegistryError::TruncatedData {
                offset: cell_offset,
                expected: abs_size,
                actual: self.data.len() - self.offset,
            }));
        }

        let cell_info = CellInfo {
            offset: cell_offset,
            size: abs_size as u32,
            is_allocated: size < 0,
            data: &self.data[data_start..data_end],
        };

        self.offset = data_end;
        Some(Ok(cell_info))
    }
}

/// Information about a cell within an hbin.
#[derive(Debug)]
pub struct CellInfo<'a> {
    /// Offset of this cell from the first hbin.
    pub offset: u32,

    /// Size of the cell (including the size field).
    pub size: u32,

    /// Whether this cell is allocated (true) or free (false).
    pub is_allocated: bool,

    /// Cell data (excluding the size field).
    pub data: &'a [u8],
}

impl<'a> CellInfo<'a> {
    /// Returns the cell type signature (first 2 bytes of data).
    pub fn cell_type(&self) -> Option<[u8; 2]> {
        if self.data.len() >= 2 {
            Some([self.data[0], self.data[1]])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hbin_header_size() {
        assert_eq!(HBIN_HEADER_SIZE, 32);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = HbinHeader::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_init_round_trip() {
        let mut buf = vec![0u8; 4096];
        HbinHeader::init(&mut buf, 0x2000, 4096, 42).unwrap();

        let header = HbinHeader::parse(&buf, 0x2000).unwrap();
        assert_eq!(header.offset, 0x2000);
        assert_eq!(header.size, 4096);
        assert_eq!(header.timestamp, 42);
        assert_eq!(header.data_size(), 4096 - 32);
    }

    #[test]
    fn test_cell_iterator() {
        // Two cells: one allocated 16-byte, one free filling the rest.
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&(-16i32).to_le_bytes());
        data[16..20].copy_from_slice(&48i32.to_le_bytes());

        let cells: Vec<_> = HbinCellIterator::new(&data, 0)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].offset, 32);
        assert!(cells[0].is_allocated);
        assert_eq!(cells[0].size, 16);
        assert_eq!(cells[1].offset, 48);
        assert!(!cells[1].is_allocated);
        assert_eq!(cells[1].size, 48);
    }

    #[test]
    fn test_cell_iterator_rejects_bad_size() {
        let mut data = vec![0u8; 16];
        data[0..4].copy_from_slice(&(-12i32).to_le_bytes());

        let result: Result<Vec<_>> = HbinCellIterator::new(&data, 0).collect();
        assert!(matches!(result, Err(RegistryError::InvalidCellSize { .. })));
    }

    #[test]
    fn test_bin_extent() {
        let bin = BinExtent { start: 0x1000, size: 0x2000 };
        assert_eq!(bin.end(), 0x3000);
        assert_eq!(bin.first_cell(), 0x1020);
        assert!(bin.contains(0x1000));
        assert!(bin.contains(0x2FFF));
        assert!(!bin.contains(0x3000));
    }
}

//! Cell arena: resolution, allocation, freeing, and hive growth.
//!
//! The memory-mapped hive is treated as a heap of variable-sized cells.
//! Free cells are tracked in size-class buckets seeded by a full bin scan
//! at open. Allocation is best-fit with tail splitting; freeing coalesces
//! with free neighbors inside the same bin; when nothing fits, a fresh bin
//! is appended and the search retried.

use crate::error::{RegistryError, Result};
use crate::hbin::{BinExtent, HbinCellIterator, HbinHeader, HBIN_HEADER_SIZE};
use crate::header::{BASE_BLOCK_SIZE, HIVE_LENGTH_OFFSET};
use crate::hive::Hive;
use crate::utils::{filetime_now, read_i32_le, round_up, NONE_OFFSET};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Smallest legal cell: the 4-byte header plus 4 bytes of payload.
pub const MIN_CELL_SIZE: u32 = 8;

/// Reads an allocated cell's payload from a hive byte view.
///
/// Shared by the hive handle and the traversal engine (which walks a bare
/// byte slice without a handle).
///
/// # Errors
///
/// - `InvalidOffset` if the offset lies outside the data region.
/// - `FreeCell` if the cell is free (positive length).
/// - `InvalidCellSize` if the length is not a multiple of 8 of at least 8.
/// - `TruncatedData` if the payload extends past the end of the data.
pub(crate) fn cell_payload(data: &[u8], offset: u32) -> Result<&[u8]> {
    if offset == NONE_OFFSET {
        return Err(RegistryError::invalid_offset(offset, data.len()));
    }

    let abs = BASE_BLOCK_SIZE + offset as usize;
    if abs + 4 > data.len() {
        return Err(RegistryError::invalid_offset(offset, data.len()));
    }

    let size = read_i32_le(data, abs)?;
    if size >= 0 {
        return Err(RegistryError::FreeCell { offset });
    }

    let abs_size = size.unsigned_abs() as usize;
    if abs_size < MIN_CELL_SIZE as usize || abs_size % 8 != 0 {
        return Err(RegistryError::invalid_cell_size(size, offset));
    }

    let end = abs + abs_size;
    if end > data.len() {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: abs_size,
            actual: data.len() - abs,
        });
    }

    Ok(&data[abs + 4..end])
}

/// Reads a cell's raw signed length, validating magnitude and bounds but
/// not allocation state.
pub(crate) fn raw_cell_size(data: &[u8], offset: u32) -> Result<i32> {
    let abs = BASE_BLOCK_SIZE + offset as usize;
    if abs + 4 > data.len() {
        return Err(RegistryError::invalid_offset(offset, data.len()));
    }

    let size = read_i32_le(data, abs)?;
    let abs_size = size.unsigned_abs() as usize;
    if abs_size < MIN_CELL_SIZE as usize || abs_size % 8 != 0 {
        return Err(RegistryError::invalid_cell_size(size, offset));
    }
    if abs + abs_size > data.len() {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: abs_size,
            actual: data.len() - abs,
        });
    }

    Ok(size)
}

/// Free-cell lists bucketed by exact cell size, each bucket in address
/// order.
#[derive(Debug, Default)]
pub(crate) struct FreeLists {
    buckets: BTreeMap<u32, BTreeSet<u32>>,
}

impl FreeLists {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a free cell.
    pub(crate) fn insert(&mut self, size: u32, offset: u32) {
        self.buckets.entry(size).or_default().insert(offset);
    }

    /// Removes a specific free cell, returning whether it was present.
    pub(crate) fn remove(&mut self, size: u32, offset: u32) -> bool {
        if let Some(bucket) = self.buckets.get_mut(&size) {
            let removed = bucket.remove(&offset);
            if bucket.is_empty() {
                self.buckets.remove(&size);
            }
            removed
        } else {
            false
        }
    }

    /// Takes the lowest-addressed cell from the smallest bucket that fits
    /// `min_size`.
    pub(crate) fn take_fit(&mut self, min_size: u32) -> Option<(u32, u32)> {
        let (&size, bucket) = self.buckets.range_mut(min_size..).next()?;
        let offset = *bucket.iter().next()?;
        bucket.remove(&offset);
        if bucket.is_empty() {
            self.buckets.remove(&size);
        }
        Some((size, offset))
    }

    /// Total bytes in free cells.
    pub(crate) fn free_bytes(&self) -> u64 {
        self.buckets
            .iter()
            .map(|(size, bucket)| u64::from(*size) * bucket.len() as u64)
            .sum()
    }

    /// Number of free cells.
    pub(crate) fn cell_count(&self) -> usize {
        self.buckets.values().map(BTreeSet::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
    }
}

impl Hive {
    /// Scans every bin, validating bin and cell invariants and seeding the
    /// free lists. Called once at open.
    pub(crate) fn scan_bins(&mut self) -> Result<()> {
        self.bins.clear();
        self.free.clear();

        let data_len = self.base.hive_length;
        let mut pos: u32 = 0;

        while pos < data_len {
            let abs = BASE_BLOCK_SIZE + pos as usize;
            let header = HbinHeader::parse(&self.data.as_slice()[abs..], pos)?;

            if pos + header.size > data_len {
                return Err(RegistryError::TruncatedData {
                    offset: pos,
                    expected: header.size as usize,
                    actual: (data_len - pos) as usize,
                });
            }

            let bin = BinExtent {
                start: pos,
                size: header.size,
            };

            let data_start = abs + HBIN_HEADER_SIZE;
            let data_end = abs + header.size as usize;
            let cells = HbinCellIterator::new(&self.data.as_slice()[data_start..data_end], pos);

            for cell in cells {
                let cell = cell?;
                if !cell.is_allocated {
                    self.free.insert(cell.size, cell.offset);
                }
            }

            self.bins.push(bin);
            pos += header.size;
        }

        debug!(
            bins = self.bins.len(),
            free_cells = self.free.cell_count(),
            free_bytes = self.free.free_bytes(),
            "Seeded allocator from bin scan"
        );

        Ok(())
    }

    /// Locates the bin containing `offset`.
    pub(crate) fn find_bin(&self, offset: u32) -> Result<BinExtent> {
        let idx = self
            .bins
            .partition_point(|bin| bin.start <= offset)
            .checked_sub(1)
            .ok_or_else(|| RegistryError::invalid_offset(offset, self.data.len()))?;

        let bin = self.bins[idx];
        if bin.contains(offset) {
            Ok(bin)
        } else {
            Err(RegistryError::invalid_offset(offset, self.data.len()))
        }
    }

    /// Allocates a cell with room for `payload_len` bytes of payload and
    /// returns its offset. The payload is zeroed.
    ///
    /// Exhaustion is handled by appending a bin, so allocation only fails
    /// when the OS refuses to extend the mapping or the hive would outgrow
    /// 32-bit offsets.
    pub(crate) fn alloc_cell(&mut self, payload_len: usize) -> Result<u32> {
        if !self.is_writable() {
            return Err(RegistryError::ReadOnlyHive);
        }

        let total = round_up(payload_len + 4, 8).max(MIN_CELL_SIZE as usize) as u32;

        loop {
            if let Some((size, offset)) = self.free.take_fit(total) {
                let residual = size - total;

                let cell_size = if residual >= MIN_CELL_SIZE {
                    // Split: re-queue the tail as its own free cell. The
                    // source cell never crosses a bin boundary, so neither
                    // does the tail.
                    self.write_i32_at(
                        BASE_BLOCK_SIZE + (offset + total) as usize,
                        residual as i32,
                    )?;
                    self.free.insert(residual, offset + total);
                    total
                } else {
                    // Absorb sub-minimum slack into the allocation.
                    size
                };

                self.write_i32_at(BASE_BLOCK_SIZE + offset as usize, -(cell_size as i32))?;
                let zeros = vec![0u8; cell_size as usize - 4];
                self.write_bytes(BASE_BLOCK_SIZE + offset as usize + 4, &zeros)?;

                trace!(offset = %format!("{:#x}", offset), cell_size, "Allocated cell");
                return Ok(offset);
            }

            self.append_bin(total)?;
        }
    }

    /// Frees the cell at `offset`, coalescing with free neighbors in the
    /// same bin (forward, then backward) and re-queuing the result.
    pub(crate) fn free_cell(&mut self, offset: u32) -> Result<()> {
        if !self.is_writable() {
            return Err(RegistryError::ReadOnlyHive);
        }

        let size = raw_cell_size(self.data.as_slice(), offset)?;
        if size >= 0 {
            // Double free.
            return Err(RegistryError::FreeCell { offset });
        }

        let bin = self.find_bin(offset)?;
        let mut start = offset;
        let mut total = size.unsigned_abs();

        // Forward: absorb a free successor.
        let next = offset + total;
        if next < bin.end() {
            let next_size = raw_cell_size(self.data.as_slice(), next)?;
            if next_size > 0 {
                let next_size = next_size as u32;
                self.free.remove(next_size, next);
                total += next_size;
            }
        }

        // Backward: find the immediate predecessor by walking the bin.
        let mut cursor = bin.first_cell();
        while cursor < offset {
            let cur_size = raw_cell_size(self.data.as_slice(), cursor)?;
            let cur_len = cur_size.unsigned_abs();
            if cursor + cur_len == offset {
                if cur_size > 0 {
                    self.free.remove(cur_len, cursor);
                    start = cursor;
                    total += cur_len;
                }
                break;
            }
            cursor += cur_len;
        }

        self.write_i32_at(BASE_BLOCK_SIZE + start as usize, total as i32)?;
        self.free.insert(total, start);

        trace!(offset = %format!("{:#x}", offset), coalesced = %format!("{:#x}", start), total, "Freed cell");
        Ok(())
    }

    /// Appends a fresh bin big enough for a cell of `min_cell` bytes:
    /// extends the file and mapping, writes the bin header, queues the
    /// spanning free cell, and updates the header's data-region size.
    pub(crate) fn append_bin(&mut self, min_cell: u32) -> Result<()> {
        if !self.is_writable() {
            return Err(RegistryError::ReadOnlyHive);
        }

        let bin_size = round_up(min_cell as usize + HBIN_HEADER_SIZE, 4096).max(4096);
        let bin_start = self.base.hive_length;
        let new_total = BASE_BLOCK_SIZE + bin_start as usize + bin_size;

        if new_total as u64 > u64::from(u32::MAX) {
            return Err(RegistryError::HiveTooLarge {
                size: new_total as u64,
            });
        }

        if new_total > self.data.len() {
            let file = self.file.as_ref().ok_or(RegistryError::ReadOnlyHive)?;
            file.set_len(new_total as u64)?;
            self.remap()?;
        }

        let timestamp = filetime_now();
        let mut header = [0u8; HBIN_HEADER_SIZE];
        HbinHeader::init(&mut header, bin_start, bin_size as u32, timestamp)?;
        self.write_bytes(BASE_BLOCK_SIZE + bin_start as usize, &header)?;

        let free_offset = bin_start + HBIN_HEADER_SIZE as u32;
        let free_size = bin_size as u32 - HBIN_HEADER_SIZE as u32;
        self.write_i32_at(BASE_BLOCK_SIZE + free_offset as usize, free_size as i32)?;
        self.free.insert(free_size, free_offset);

        self.bins.push(BinExtent {
            start: bin_start,
            size: bin_size as u32,
        });

        self.base.hive_length += bin_size as u32;
        self.write_u32_at(HIVE_LENGTH_OFFSET, self.base.hive_length)?;

        // The entire appended range must reach storage, not only the bytes
        // written above.
        self.dirty
            .add((BASE_BLOCK_SIZE + bin_start as usize) as u64, bin_size as u64);

        debug!(
            bin_start = %format!("{:#x}", bin_start),
            bin_size,
            hive_length = self.base.hive_length,
            "Appended bin"
        );

        Ok(())
    }

    /// Returns `(free cells, free bytes)` currently queued in the
    /// allocator.
    pub fn free_space(&self) -> (usize, u64) {
        (self.free.cell_count(), self.free.free_bytes())
    }
}

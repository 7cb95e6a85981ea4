//! Registry hive handle with memory-mapped read/write support.
//!
//! The handle owns the mapped byte buffer; every other subsystem (arena,
//! index, walker, dirty tracker, transaction manager, editor) operates
//! through it. Mutations funnel through [`Hive::write_bytes`], which
//! bounds-checks, writes through the mapping, and records the touched
//! range with the dirty tracker, so no byte can change without becoming
//! part of the next flush.

use crate::arena::{cell_payload, FreeLists};
use crate::bigdata::{BigDataBlock, BIG_DATA_SEGMENT_SIZE, MAX_DIRECT_DATA_SIZE};
use crate::dirty::DirtyTracker;
use crate::error::{RegistryError, Result};
use crate::hbin::BinExtent;
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::index::{make_index, IndexKind, IndexStats, StructuralIndex};
use crate::key::KeyNode;
use crate::security::SecurityCell;
use crate::utils::{calculate_checksum, filetime_now, read_u32_le, NONE_OFFSET};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Policy applied when an opened hive carries mismatched sequence numbers,
/// the on-disk marker of a torn transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Refuse to open the hive.
    #[default]
    Reject,

    /// Open the hive and report it unclean via [`Hive::is_unclean`].
    AcceptUnclean,
}

/// Open-time configuration for a hive handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct HiveOptions {
    /// Which structural-index implementation to use for this handle.
    pub index: IndexKind,

    /// What to do with a hive whose sequences do not match.
    pub recovery: RecoveryPolicy,
}

/// Represents hive data storage.
pub(crate) enum HiveData {
    /// Read-only memory-mapped file data.
    ReadOnly(Mmap),

    /// Writable memory-mapped file data.
    Writable(MmapMut),

    /// Owned data (used for in-memory images, e.g. after log recovery).
    Owned(Vec<u8>),
}

impl HiveData {
    /// Returns a slice of the hive data.
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            HiveData::ReadOnly(mmap) => mmap,
            HiveData::Writable(mmap) => mmap,
            HiveData::Owned(data) => data,
        }
    }

    /// Returns a mutable slice, or None for non-writable storage.
    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            HiveData::Writable(mmap) => Some(&mut mmap[..]),
            _ => None,
        }
    }

    /// Returns the length of the hive data.
    pub(crate) fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Main registry hive handle.
///
/// A handle is single-threaded and admits at most one mutator at a time;
/// multiple read-only handles over the same file are fine.
pub struct Hive {
    /// Backing file. None for in-memory images.
    pub(crate) file: Option<File>,

    /// Hive bytes.
    pub(crate) data: HiveData,

    /// Parsed base block header, kept in sync with the mapped bytes.
    pub(crate) base: BaseBlock,

    /// Open-time configuration.
    pub(crate) options: HiveOptions,

    /// Bin extents in address order, maintained across growth.
    pub(crate) bins: Vec<BinExtent>,

    /// Free-cell lists bucketed by size class.
    pub(crate) free: FreeLists,

    /// Structural index over keys and values.
    pub(crate) index: Box<dyn StructuralIndex>,

    /// Pending dirty byte ranges.
    pub(crate) dirty: DirtyTracker,

    /// A transaction is in flight.
    pub(crate) in_tx: bool,

    /// The hive carried mismatched sequences at open.
    pub(crate) unclean: bool,
}

impl Hive {
    /// Opens a registry hive file for editing with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, is not a
    /// valid hive, or carries a torn transaction (see [`RecoveryPolicy`]).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use reg_editor::Hive;
    ///
    /// let hive = Hive::open("SYSTEM").unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, HiveOptions::default())
    }

    /// Opens a registry hive file for editing.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open_with<P: AsRef<Path>>(path: P, options: HiveOptions) -> Result<Self> {
        info!("Opening registry hive for editing");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let metadata = file.metadata()?;
        let file_size = metadata.len();
        Self::check_file_size(file_size)?;
        debug!(size = file_size, "File size validated");

        // SAFETY: the mapping is private to this handle, its lifetime is
        // tied to the Hive, and all access is bounds-checked against the
        // validated file size. Writes are exclusive per the single-writer
        // contract of the handle.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!(size = mmap.len(), "Memory mapped hive file");

        Self::from_parts(Some(file), HiveData::Writable(mmap), options)
    }

    /// Opens a secondary, read-only handle over a hive file.
    ///
    /// Mutating operations through this handle fail with `ReadOnlyHive`.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening registry hive read-only");
        let file = File::open(&path)?;

        let metadata = file.metadata()?;
        Self::check_file_size(metadata.len())?;

        // SAFETY: read-only mapping over a validated file; all access is
        // bounds-checked.
        let mmap = unsafe { Mmap::map(&file)? };

        Self::from_parts(Some(file), HiveData::ReadOnly(mmap), HiveOptions::default())
    }

    /// Creates a hive handle from an owned in-memory image.
    ///
    /// The resulting handle is read-only: editing requires a mapped file.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        Self::from_parts(None, HiveData::Owned(data), HiveOptions::default())
    }

    /// Creates a fresh hive file containing a single bin, a root key, and a
    /// minimal security descriptor, then opens it for editing.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn create<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        Self::create_with(path, name, HiveOptions::default())
    }

    /// Creates a fresh hive file with explicit open options.
    pub fn create_with<P: AsRef<Path>>(
        path: P,
        name: &str,
        options: HiveOptions,
    ) -> Result<Self> {
        info!("Creating registry hive");
        let image = Self::empty_image(name)?;
        std::fs::write(&path, image)?;
        Self::open_with(path, options)
    }

    /// Builds the byte image of an empty hive: header, one bin, root key
    /// cell, security cell, and one free cell spanning the rest of the bin.
    fn empty_image(name: &str) -> Result<Vec<u8>> {
        use crate::hbin::{HbinHeader, HBIN_HEADER_SIZE};
        use crate::utils::{round_up, write_i32_le};

        const ROOT_OFFSET: u32 = HBIN_HEADER_SIZE as u32;
        let timestamp = filetime_now();

        let nk_payload = KeyNode::encode_new(
            "ROOT",
            NONE_OFFSET,
            0, // patched below once the sk offset is known
            crate::cell::KeyNodeFlags::ROOT_KEY,
            timestamp,
        )?;
        let nk_cell = round_up(nk_payload.len() + 4, 8);

        let sk_offset = ROOT_OFFSET + nk_cell as u32;
        let descriptor = SecurityCell::minimal_descriptor();
        let sk_payload = SecurityCell::encode_new(sk_offset, sk_offset, 1, &descriptor)?;
        let sk_cell = round_up(sk_payload.len() + 4, 8);

        let bin_size = 4096usize;
        let free_offset = sk_offset as usize + sk_cell;
        let free_size = bin_size - free_offset;

        let mut image = vec![0u8; BASE_BLOCK_SIZE + bin_size];
        BaseBlock::write_new(&mut image, ROOT_OFFSET, bin_size as u32, name, timestamp)?;

        let bin = &mut image[BASE_BLOCK_SIZE..];
        HbinHeader::init(bin, 0, bin_size as u32, timestamp)?;

        // Root key cell.
        write_i32_le(bin, ROOT_OFFSET as usize, -(nk_cell as i32))?;
        let nk_start = ROOT_OFFSET as usize + 4;
        bin[nk_start..nk_start + nk_payload.len()].copy_from_slice(&nk_payload);
        crate::utils::write_u32_le(
            bin,
            nk_start + crate::key::NK_SECURITY_OFFSET,
            sk_offset,
        )?;

        // Security cell.
        write_i32_le(bin, sk_offset as usize, -(sk_cell as i32))?;
        let sk_start = sk_offset as usize + 4;
        bin[sk_start..sk_start + sk_payload.len()].copy_from_slice(&sk_payload);

        // Remaining space is one free cell.
        write_i32_le(bin, free_offset, free_size as i32)?;

        Ok(image)
    }

    /// Rejects files that cannot be valid hives: too small for a header
    /// and one bin, or past the 32-bit offset space of the format.
    fn check_file_size(file_size: u64) -> Result<()> {
        let minimum = (BASE_BLOCK_SIZE + 4096) as u64;
        if file_size < minimum {
            return Err(RegistryError::HiveTooSmall {
                size: file_size as usize,
                minimum: minimum as usize,
            });
        }
        if file_size > u64::from(u32::MAX) {
            return Err(RegistryError::HiveTooLarge { size: file_size });
        }
        Ok(())
    }

    /// Common initialization: parse and validate the header, seed the
    /// allocator from a bin scan, check the root cell, and build the index.
    fn from_parts(file: Option<File>, data: HiveData, options: HiveOptions) -> Result<Self> {
        let base = BaseBlock::parse(data.as_slice())?;

        let unclean = !base.is_consistent();
        if unclean {
            match options.recovery {
                RecoveryPolicy::Reject => {
                    return Err(RegistryError::TornTransaction {
                        primary: base.primary_sequence,
                        secondary: base.secondary_sequence,
                    });
                }
                RecoveryPolicy::AcceptUnclean => {
                    warn!(
                        primary = base.primary_sequence,
                        secondary = base.secondary_sequence,
                        "Hive carries a torn transaction; opening unclean"
                    );
                }
            }
        } else {
            // A cleanly committed hive must carry a valid checksum. An
            // unclean one legitimately does not; the sequences already
            // flagged it.
            let calculated = calculate_checksum(data.as_slice());
            if base.checksum != calculated {
                return Err(RegistryError::ChecksumMismatch {
                    expected: base.checksum,
                    calculated,
                });
            }
        }

        let data_end = BASE_BLOCK_SIZE + base.hive_length as usize;
        if data_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset: 0,
                expected: data_end,
                actual: data.len(),
            });
        }

        let mut hive = Self {
            file,
            data,
            base,
            options,
            bins: Vec::new(),
            free: FreeLists::new(),
            index: make_index(options.index),
            dirty: DirtyTracker::new(),
            in_tx: false,
            unclean,
        };

        hive.scan_bins()?;

        // The root offset named in the header must resolve to a key cell.
        let root = hive.base.root_cell_offset;
        let payload = hive.read_cell(root)?;
        if payload.len() < 2 || &payload[0..2] != b"nk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Root cell at {:#x} is not a key node",
                root
            )));
        }

        let stats = hive.rebuild_index()?;
        debug!(
            keys = stats.keys_indexed,
            values = stats.values_indexed,
            skipped = stats.cells_skipped,
            "Structural index built"
        );

        Ok(hive)
    }

    /// Returns a reference to the base block header.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base
    }

    /// Returns the root key cell offset.
    pub fn root_offset(&self) -> u32 {
        self.base.root_cell_offset
    }

    /// Returns true if the hive carried mismatched sequences at open.
    pub fn is_unclean(&self) -> bool {
        self.unclean
    }

    /// Returns true if this handle can mutate the hive.
    pub fn is_writable(&self) -> bool {
        matches!(self.data, HiveData::Writable(_))
    }

    /// Returns statistics for the structural index.
    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    /// Returns the full hive byte view (header plus data region).
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Exports the hive data as a `Vec<u8>`.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.as_slice().to_vec()
    }

    /// Reads an allocated cell's payload at the given offset.
    ///
    /// # Arguments
    ///
    /// * `offset` - Cell offset (relative to first hbin).
    pub fn read_cell(&self, offset: u32) -> Result<&[u8]> {
        cell_payload(self.data.as_slice(), offset)
    }

    /// Resolves a path of key names from the root, one index lookup per
    /// component. Returns `None` at the first missing component.
    pub fn walk_path(&self, components: &[&str]) -> Option<u32> {
        let mut current = self.base.root_cell_offset;
        for component in components {
            current = self.index.get_key(current, component)?;
        }
        Some(current)
    }

    /// Rebuilds the structural index from the on-disk structure.
    ///
    /// Used at open and after recovery; the editor keeps the index
    /// coherent incrementally otherwise.
    pub fn rebuild_index(&mut self) -> Result<crate::walker::WalkStats> {
        let mut index = make_index(self.options.index);
        let stats = {
            let mut walker = crate::walker::Walker::new(
                self.data.as_slice(),
                self.base.root_cell_offset,
                self.base.hive_length,
            );
            walker.build_index(index.as_mut())?
        };
        self.index = index;
        Ok(stats)
    }

    /// Walks every cell reachable from the root and counts them by
    /// purpose. Malformed cells are skipped and logged by the walker, so
    /// the census doubles as a structural sweep of the hive.
    pub fn census(&self) -> Result<crate::walker::CellCensus> {
        let mut walker = crate::walker::Walker::new(
            self.data.as_slice(),
            self.base.root_cell_offset,
            self.base.hive_length,
        );
        walker.census()
    }

    /// Reads value data at the given offset, handling both single data
    /// cells and big-data (db) structures.
    ///
    /// # Arguments
    ///
    /// * `offset` - Cell offset of the value data
    /// * `length` - Length of the value data in bytes
    pub fn read_value_data(&self, offset: u32, length: u32) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        if length > MAX_DIRECT_DATA_SIZE {
            return self.read_big_data(offset, length);
        }

        let payload = self.read_cell(offset)?;
        if (payload.len() as u32) < length {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: length as usize,
                actual: payload.len(),
            });
        }
        Ok(payload[..length as usize].to_vec())
    }

    /// Reads a big data (db) structure: header, block list, then each
    /// referenced segment, concatenated and truncated to `expected_length`.
    fn read_big_data(&self, offset: u32, expected_length: u32) -> Result<Vec<u8>> {
        debug!(offset = %format!("{:#x}", offset), expected_length, "Reading big data block");

        let db = BigDataBlock::parse(self.read_cell(offset)?, offset)?;

        let list = self.read_cell(db.segment_list_offset)?;
        let expected_list_size = db.segment_count as usize * 4;
        if list.len() < expected_list_size {
            return Err(RegistryError::TruncatedData {
                offset: db.segment_list_offset,
                expected: expected_list_size,
                actual: list.len(),
            });
        }

        let mut segment_offsets = Vec::with_capacity(db.segment_count as usize);
        for i in 0..db.segment_count as usize {
            // The high bit marks the segment as big-data backing storage.
            segment_offsets.push(read_u32_le(list, i * 4)? & 0x7FFF_FFFF);
        }

        let mut data = Vec::with_capacity(expected_length as usize);
        for segment_offset in segment_offsets {
            let segment = self.read_cell(segment_offset)?;
            // Cells are padded to 8-byte multiples; only the segment-sized
            // prefix carries value bytes.
            let remaining = expected_length as usize - data.len();
            let take = segment.len().min(BIG_DATA_SEGMENT_SIZE).min(remaining);
            data.extend_from_slice(&segment[..take]);
            if data.len() >= expected_length as usize {
                break;
            }
        }

        if data.len() < expected_length as usize {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: expected_length as usize,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    // -- write-through primitives ------------------------------------------

    /// Writes bytes at an absolute file offset, marking the range dirty.
    ///
    /// Every mutation in the crate funnels through here.
    pub(crate) fn write_bytes(&mut self, abs: usize, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let total = self.data.len();
        if abs + bytes.len() > total {
            return Err(RegistryError::InvalidOffset {
                offset: abs as u32,
                hive_size: total,
            });
        }

        let slice = self
            .data
            .as_mut_slice()
            .ok_or(RegistryError::ReadOnlyHive)?;
        slice[abs..abs + bytes.len()].copy_from_slice(bytes);
        self.dirty.add(abs as u64, bytes.len() as u64);
        Ok(())
    }

    /// Writes a u32 at an absolute file offset.
    pub(crate) fn write_u32_at(&mut self, abs: usize, value: u32) -> Result<()> {
        self.write_bytes(abs, &value.to_le_bytes())
    }

    /// Writes an i32 at an absolute file offset.
    pub(crate) fn write_i32_at(&mut self, abs: usize, value: i32) -> Result<()> {
        self.write_bytes(abs, &value.to_le_bytes())
    }

    /// Writes a u64 at an absolute file offset.
    pub(crate) fn write_u64_at(&mut self, abs: usize, value: u64) -> Result<()> {
        self.write_bytes(abs, &value.to_le_bytes())
    }

    /// Absolute file offset of a cell's payload.
    pub(crate) fn payload_abs(cell_offset: u32) -> usize {
        BASE_BLOCK_SIZE + cell_offset as usize + 4
    }

    /// Writes a u32 field inside a cell payload.
    pub(crate) fn write_field_u32(
        &mut self,
        cell_offset: u32,
        field_offset: usize,
        value: u32,
    ) -> Result<()> {
        self.write_u32_at(Self::payload_abs(cell_offset) + field_offset, value)
    }

    /// Writes a u64 field inside a cell payload.
    pub(crate) fn write_field_u64(
        &mut self,
        cell_offset: u32,
        field_offset: usize,
        value: u64,
    ) -> Result<()> {
        self.write_u64_at(Self::payload_abs(cell_offset) + field_offset, value)
    }

    /// Reads a u32 field from a cell payload.
    pub(crate) fn read_field_u32(&self, cell_offset: u32, field_offset: usize) -> Result<u32> {
        let payload = self.read_cell(cell_offset)?;
        read_u32_le(payload, field_offset)
    }

    /// Re-establishes the writable mapping after the file was extended.
    pub(crate) fn remap(&mut self) -> Result<()> {
        if !self.is_writable() {
            return Err(RegistryError::ReadOnlyHive);
        }
        let file = self.file.as_ref().ok_or(RegistryError::ReadOnlyHive)?;

        // SAFETY: same justification as the original mapping; the old map
        // is dropped on assignment, and the file was just extended.
        let mmap = unsafe { MmapMut::map_mut(file)? };
        self.data = HiveData::Writable(mmap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.hiv");

        let hive = Hive::create(&path, "unit-test").unwrap();
        assert!(hive.is_writable());
        assert!(!hive.is_unclean());
        assert_eq!(hive.base_block().hive_length, 4096);

        let root = hive.root_offset();
        let payload = hive.read_cell(root).unwrap();
        let nk = KeyNode::parse(payload, root).unwrap();
        assert_eq!(nk.name, "ROOT");
        assert!(nk.is_root());
        assert_eq!(nk.subkey_count, 0);
        assert_ne!(nk.security_offset, NONE_OFFSET);

        let sk_payload = hive.read_cell(nk.security_offset).unwrap();
        let sk = SecurityCell::parse(sk_payload, nk.security_offset).unwrap();
        assert_eq!(sk.reference_count, 1);
        assert_eq!(sk.flink, nk.security_offset);
        assert_eq!(sk.blink, nk.security_offset);

        drop(hive);

        let reopened = Hive::open(&path).unwrap();
        assert!(reopened.base_block().is_consistent());
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.hiv");
        drop(Hive::create(&path, "ro").unwrap());

        let mut hive = Hive::open_read_only(&path).unwrap();
        assert!(!hive.is_writable());

        let result = hive.write_u32_at(BASE_BLOCK_SIZE, 0);
        assert!(matches!(result, Err(RegistryError::ReadOnlyHive)));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.hiv");
        std::fs::write(&path, vec![0xAB; 8192]).unwrap();

        assert!(Hive::open(&path).is_err());
    }

    #[test]
    fn test_from_vec_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.hiv");
        let hive = Hive::create(&path, "img").unwrap();
        let image = hive.to_bytes();
        drop(hive);

        let owned = Hive::from_vec(image).unwrap();
        assert!(!owned.is_writable());
        assert_eq!(owned.base_block().file_name, "img");
    }
}

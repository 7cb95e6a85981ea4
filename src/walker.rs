//! Iterative traversal engine over the cell graph.
//!
//! Drives a depth-first walk from the root key using an explicit stack and
//! a visited bitmap (one bit per 8 bytes of data region), so cycles and
//! shared referents are safe. The walker powers index building, cell
//! census, and structural validation.
//!
//! Malformed cells are logged and skipped wherever skipping keeps the walk
//! meaningful; a broken value must not abort an index build.

use crate::arena::cell_payload;
use crate::bigdata::{BigDataBlock, MAX_DIRECT_DATA_SIZE};
use crate::error::{RegistryError, Result};
use crate::index::StructuralIndex;
use crate::key::KeyNode;
use crate::subkey_list::SubkeyList;
use crate::utils::{read_u32_le, NONE_OFFSET};
use crate::value::ValueKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Cooperative cancellation token polled between stack iterations.
///
/// Clones share the same flag, so a token can be handed to another thread
/// and fired while a walk is in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true once the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Semantic purpose of a visited cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CellPurpose {
    /// An nk cell.
    KeyNode,

    /// An lf/lh/li/ri cell.
    SubkeyList,

    /// A flat array of vk offsets.
    ValueList,

    /// A vk cell.
    ValueKey,

    /// A plain value data cell.
    ValueData,

    /// A db header cell.
    BigDataHeader,

    /// The segment list of a db structure.
    BigDataBlockList,

    /// One big-data segment.
    BigDataBlock,

    /// An sk cell.
    SecurityDescriptor,

    /// A class-name cell.
    ClassName,
}

/// Per-purpose cell counts produced by [`Walker::census`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CellCensus {
    /// nk cells.
    pub key_nodes: usize,
    /// lf/lh/li/ri cells.
    pub subkey_lists: usize,
    /// Value-list cells.
    pub value_lists: usize,
    /// vk cells.
    pub value_keys: usize,
    /// Plain data cells.
    pub data_cells: usize,
    /// db header cells.
    pub big_data_headers: usize,
    /// db segment-list cells.
    pub big_data_block_lists: usize,
    /// db segment cells.
    pub big_data_blocks: usize,
    /// sk cells.
    pub security_descriptors: usize,
    /// Class-name cells.
    pub class_names: usize,
}

impl CellCensus {
    /// Total number of cells counted.
    pub fn total(&self) -> usize {
        self.key_nodes
            + self.subkey_lists
            + self.value_lists
            + self.value_keys
            + self.data_cells
            + self.big_data_headers
            + self.big_data_block_lists
            + self.big_data_blocks
            + self.security_descriptors
            + self.class_names
    }
}

/// Outcome of a walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Cells visited (each exactly once).
    pub cells_visited: usize,

    /// Keys inserted into an index (index builds only).
    pub keys_indexed: usize,

    /// Values inserted into an index (index builds only).
    pub values_indexed: usize,

    /// Malformed cells skipped.
    pub cells_skipped: usize,
}

/// Visited set: one bit per 8 bytes of data region.
///
/// Out-of-range offsets test as "not set" and set as a no-op rather than
/// panicking.
#[derive(Debug)]
pub struct VisitedBitmap {
    bits: Vec<u64>,
    span: u32,
}

impl VisitedBitmap {
    /// Creates a bitmap covering `data_region_size` bytes.
    pub fn new(data_region_size: u32) -> Self {
        let slots = (data_region_size as usize / 8 + 63) / 64;
        Self {
            bits: vec![0; slots],
            span: data_region_size,
        }
    }

    #[inline]
    fn position(&self, offset: u32) -> Option<(usize, u64)> {
        if offset >= self.span {
            return None;
        }
        let bit = offset as usize / 8;
        Some((bit / 64, 1u64 << (bit % 64)))
    }

    /// Returns true if `offset` has been visited.
    #[inline]
    pub fn test(&self, offset: u32) -> bool {
        match self.position(offset) {
            Some((slot, mask)) => self.bits[slot] & mask != 0,
            None => false,
        }
    }

    /// Marks `offset` visited; returns true if it was not set before.
    #[inline]
    pub fn set(&mut self, offset: u32) -> bool {
        match self.position(offset) {
            Some((slot, mask)) => {
                let fresh = self.bits[slot] & mask == 0;
                self.bits[slot] |= mask;
                fresh
            }
            None => false,
        }
    }

    /// Number of bits set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Processing phase of one key-node stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    AfterChildren,
    AfterValues,
    AfterSecurity,
}

/// One key node on the walk stack, with cached fields so later phases do
/// not re-parse the nk cell.
#[derive(Debug)]
struct Frame {
    offset: u32,
    parent: u32,
    phase: Phase,
    value_count: u32,
    value_list_offset: u32,
    security_offset: u32,
    class_name_offset: u32,
}

/// Event sink driven by the core walk loop.
trait WalkSink {
    fn cell(&mut self, offset: u32, purpose: CellPurpose);
    fn key(&mut self, _offset: u32, _parent: u32, _name: &str) {}
    fn value(&mut self, _offset: u32, _parent: u32, _name: &str) {}
}

/// Depth-first walker over all cells reachable from a root key.
pub struct Walker<'a> {
    data: &'a [u8],
    root: u32,
    visited: VisitedBitmap,
    cancel: Option<CancelToken>,
    stats: WalkStats,
}

impl<'a> Walker<'a> {
    /// Creates a walker over a full hive byte view.
    ///
    /// # Arguments
    ///
    /// * `data` - The hive bytes (header included).
    /// * `root` - Root key cell offset.
    /// * `data_region_size` - Size of the data region, for the bitmap.
    pub fn new(data: &'a [u8], root: u32, data_region_size: u32) -> Self {
        Self {
            data,
            root,
            visited: VisitedBitmap::new(data_region_size),
            cancel: None,
            stats: WalkStats::default(),
        }
    }

    /// Attaches a cancellation token, polled once per stack iteration.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Walks the hive, invoking `visit` for every reachable cell exactly
    /// once with its offset and semantic purpose.
    ///
    /// Each key node is visited before its values, security descriptor,
    /// and class name; children are visited in on-disk order.
    pub fn walk<F>(&mut self, mut visit: F) -> Result<WalkStats>
    where
        F: FnMut(u32, CellPurpose),
    {
        struct ClosureSink<'f, F>(&'f mut F);
        impl<'f, F: FnMut(u32, CellPurpose)> WalkSink for ClosureSink<'f, F> {
            fn cell(&mut self, offset: u32, purpose: CellPurpose) {
                (self.0)(offset, purpose)
            }
        }

        let mut sink = ClosureSink(&mut visit);
        self.run(&mut sink)?;
        Ok(self.stats.clone())
    }

    /// Walks the hive and populates `index` with every key and value.
    pub fn build_index(&mut self, index: &mut dyn StructuralIndex) -> Result<WalkStats> {
        struct IndexSink<'i> {
            index: &'i mut dyn StructuralIndex,
            keys: usize,
            values: usize,
        }
        impl<'i> WalkSink for IndexSink<'i> {
            fn cell(&mut self, _offset: u32, _purpose: CellPurpose) {}
            fn key(&mut self, offset: u32, parent: u32, name: &str) {
                self.index.add_key(parent, name, offset);
                self.keys += 1;
            }
            fn value(&mut self, offset: u32, parent: u32, name: &str) {
                self.index.add_value(parent, name, offset);
                self.values += 1;
            }
        }

        let mut sink = IndexSink {
            index,
            keys: 0,
            values: 0,
        };
        self.run(&mut sink)?;
        self.stats.keys_indexed = sink.keys;
        self.stats.values_indexed = sink.values;
        Ok(self.stats.clone())
    }

    /// Walks the hive counting cells by purpose.
    pub fn census(&mut self) -> Result<CellCensus> {
        struct CensusSink(CellCensus);
        impl WalkSink for CensusSink {
            fn cell(&mut self, _offset: u32, purpose: CellPurpose) {
                let slot = match purpose {
                    CellPurpose::KeyNode => &mut self.0.key_nodes,
                    CellPurpose::SubkeyList => &mut self.0.subkey_lists,
                    CellPurpose::ValueList => &mut self.0.value_lists,
                    CellPurpose::ValueKey => &mut self.0.value_keys,
                    CellPurpose::ValueData => &mut self.0.data_cells,
                    CellPurpose::BigDataHeader => &mut self.0.big_data_headers,
                    CellPurpose::BigDataBlockList => &mut self.0.big_data_block_lists,
                    CellPurpose::BigDataBlock => &mut self.0.big_data_blocks,
                    CellPurpose::SecurityDescriptor => &mut self.0.security_descriptors,
                    CellPurpose::ClassName => &mut self.0.class_names,
                };
                *slot += 1;
            }
        }

        let mut sink = CensusSink(CellCensus::default());
        self.run(&mut sink)?;
        Ok(sink.0)
    }

    /// Number of distinct cells marked visited so far.
    pub fn visited_count(&self) -> usize {
        self.visited.count()
    }

    // -- core loop ---------------------------------------------------------

    fn run(&mut self, sink: &mut dyn WalkSink) -> Result<()> {
        let mut stack: Vec<Frame> = Vec::new();

        if self.visited.set(self.root) {
            stack.push(Frame {
                offset: self.root,
                parent: NONE_OFFSET,
                phase: Phase::Initial,
                value_count: 0,
                value_list_offset: NONE_OFFSET,
                security_offset: NONE_OFFSET,
                class_name_offset: NONE_OFFSET,
            });
        }

        while let Some(top) = stack.last_mut() {
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(RegistryError::Cancelled);
                }
            }

            match top.phase {
                Phase::Initial => {
                    let offset = top.offset;
                    let parent = top.parent;

                    let node = match cell_payload(self.data, offset)
                        .and_then(|payload| KeyNode::parse(payload, offset))
                    {
                        Ok(node) => node,
                        Err(e) => {
                            warn!(offset = %format!("{:#x}", offset), error = %e, "Skipping malformed key node");
                            self.stats.cells_skipped += 1;
                            stack.pop();
                            continue;
                        }
                    };

                    self.stats.cells_visited += 1;
                    sink.cell(offset, CellPurpose::KeyNode);
                    sink.key(offset, parent, &node.name);

                    top.phase = Phase::AfterChildren;
                    top.value_count = node.value_count;
                    top.value_list_offset = node.value_list_offset;
                    top.security_offset = node.security_offset;
                    top.class_name_offset = node.class_name_offset;

                    let mut children = Vec::new();
                    if node.subkey_count > 0 {
                        self.collect_subkeys(node.subkey_list_offset, sink, &mut children);
                    }

                    // Push reversed so pop order matches on-disk order.
                    for child in children.into_iter().rev() {
                        if self.visited.set(child) {
                            stack.push(Frame {
                                offset: child,
                                parent: offset,
                                phase: Phase::Initial,
                                value_count: 0,
                                value_list_offset: NONE_OFFSET,
                                security_offset: NONE_OFFSET,
                                class_name_offset: NONE_OFFSET,
                            });
                        }
                    }
                }

                Phase::AfterChildren => {
                    let offset = top.offset;
                    let value_count = top.value_count;
                    let value_list_offset = top.value_list_offset;
                    top.phase = Phase::AfterValues;

                    if value_count > 0 && Self::offset_present(value_list_offset) {
                        self.visit_values(offset, value_list_offset, value_count, sink);
                    }
                }

                Phase::AfterValues => {
                    let security_offset = top.security_offset;
                    top.phase = Phase::AfterSecurity;

                    if Self::offset_present(security_offset) && self.visited.set(security_offset)
                    {
                        self.stats.cells_visited += 1;
                        sink.cell(security_offset, CellPurpose::SecurityDescriptor);
                    }
                }

                Phase::AfterSecurity => {
                    let class_name_offset = top.class_name_offset;

                    if Self::offset_present(class_name_offset)
                        && self.visited.set(class_name_offset)
                    {
                        self.stats.cells_visited += 1;
                        sink.cell(class_name_offset, CellPurpose::ClassName);
                    }

                    stack.pop();
                }
            }
        }

        Ok(())
    }

    fn offset_present(offset: u32) -> bool {
        offset != NONE_OFFSET && offset != 0
    }

    /// Flattens a subkey list (recursing through ri roots) into child key
    /// offsets, visiting each list cell along the way.
    fn collect_subkeys(&mut self, list_offset: u32, sink: &mut dyn WalkSink, out: &mut Vec<u32>) {
        if !Self::offset_present(list_offset) {
            return;
        }

        // An already-visited list means a shared or cyclic reference;
        // processing it again could loop forever on a corrupt ri chain.
        if !self.visited.set(list_offset) {
            return;
        }

        let list = match cell_payload(self.data, list_offset)
            .and_then(|payload| SubkeyList::parse(payload, list_offset))
        {
            Ok(list) => list,
            Err(e) => {
                warn!(offset = %format!("{:#x}", list_offset), error = %e, "Skipping malformed subkey list");
                self.stats.cells_skipped += 1;
                return;
            }
        };

        self.stats.cells_visited += 1;
        sink.cell(list_offset, CellPurpose::SubkeyList);

        if list.is_index_root() {
            for sublist in list.key_offsets_iter() {
                self.collect_subkeys(sublist, sink, out);
            }
        } else {
            out.extend(list.key_offsets_iter());
        }
    }

    /// Visits a value list cell, each vk cell, and each value's data cells.
    fn visit_values(
        &mut self,
        nk_offset: u32,
        list_offset: u32,
        value_count: u32,
        sink: &mut dyn WalkSink,
    ) {
        let entries = match cell_payload(self.data, list_offset) {
            Ok(list_data) => {
                let mut entries = Vec::with_capacity(value_count as usize);
                for i in 0..value_count as usize {
                    match read_u32_le(list_data, i * 4) {
                        Ok(vk_offset) => entries.push(vk_offset),
                        Err(e) => {
                            warn!(offset = %format!("{:#x}", list_offset), error = %e, "Value list shorter than value count");
                            self.stats.cells_skipped += 1;
                            break;
                        }
                    }
                }
                entries
            }
            Err(e) => {
                warn!(offset = %format!("{:#x}", list_offset), error = %e, "Skipping malformed value list");
                self.stats.cells_skipped += 1;
                return;
            }
        };

        if self.visited.set(list_offset) {
            self.stats.cells_visited += 1;
            sink.cell(list_offset, CellPurpose::ValueList);
        }

        for vk_offset in entries {
            if !self.visited.set(vk_offset) {
                continue;
            }

            let vk = match cell_payload(self.data, vk_offset)
                .and_then(|payload| ValueKey::parse(payload, vk_offset))
            {
                Ok(vk) => vk,
                Err(e) => {
                    warn!(offset = %format!("{:#x}", vk_offset), error = %e, "Skipping malformed value key");
                    self.stats.cells_skipped += 1;
                    continue;
                }
            };

            self.stats.cells_visited += 1;
            sink.cell(vk_offset, CellPurpose::ValueKey);
            sink.value(vk_offset, nk_offset, &vk.name);

            self.visit_value_data(&vk, sink);
        }
    }

    /// Visits the data cells behind one value: nothing for inline data, a
    /// single data cell, or the full db header/list/segments structure.
    fn visit_value_data(&mut self, vk: &ValueKey, sink: &mut dyn WalkSink) {
        if vk.is_inline_data() || vk.data_length == 0 || !Self::offset_present(vk.data_offset) {
            return;
        }

        if vk.data_length <= MAX_DIRECT_DATA_SIZE {
            if self.visited.set(vk.data_offset) {
                self.stats.cells_visited += 1;
                sink.cell(vk.data_offset, CellPurpose::ValueData);
            }
            return;
        }

        let db = match cell_payload(self.data, vk.data_offset)
            .and_then(|payload| BigDataBlock::parse(payload, vk.data_offset))
        {
            Ok(db) => db,
            Err(e) => {
                warn!(offset = %format!("{:#x}", vk.data_offset), error = %e, "Skipping malformed big-data header");
                self.stats.cells_skipped += 1;
                return;
            }
        };

        if self.visited.set(vk.data_offset) {
            self.stats.cells_visited += 1;
            sink.cell(vk.data_offset, CellPurpose::BigDataHeader);
        }

        let list_data = match cell_payload(self.data, db.segment_list_offset) {
            Ok(data) => data,
            Err(e) => {
                warn!(offset = %format!("{:#x}", db.segment_list_offset), error = %e, "Skipping malformed big-data block list");
                self.stats.cells_skipped += 1;
                return;
            }
        };

        let mut segments = Vec::with_capacity(db.segment_count as usize);
        for i in 0..db.segment_count as usize {
            match read_u32_le(list_data, i * 4) {
                Ok(segment) => segments.push(segment & 0x7FFF_FFFF),
                Err(_) => break,
            }
        }

        if self.visited.set(db.segment_list_offset) {
            self.stats.cells_visited += 1;
            sink.cell(db.segment_list_offset, CellPurpose::BigDataBlockList);
        }

        for segment in segments {
            if self.visited.set(segment) {
                self.stats.cells_visited += 1;
                sink.cell(segment, CellPurpose::BigDataBlock);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_basics() {
        let mut bitmap = VisitedBitmap::new(4096);
        assert!(!bitmap.test(0x20));
        assert!(bitmap.set(0x20));
        assert!(bitmap.test(0x20));
        assert!(!bitmap.set(0x20));
        assert_eq!(bitmap.count(), 1);
    }

    #[test]
    fn test_bitmap_granularity() {
        let mut bitmap = VisitedBitmap::new(4096);
        // Offsets within the same 8-byte granule share a bit.
        assert!(bitmap.set(0x40));
        assert!(bitmap.test(0x47));
        assert!(!bitmap.set(0x47));
        assert!(bitmap.set(0x48));
    }

    #[test]
    fn test_bitmap_out_of_range_is_noop() {
        let mut bitmap = VisitedBitmap::new(64);
        assert!(!bitmap.test(1_000_000));
        assert!(!bitmap.set(1_000_000));
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}

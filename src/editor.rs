//! Key and value editing: path creation, value upsert/delete, key
//! deletion, and the on-disk list maintenance behind them.
//!
//! Every operation allocates through the arena, keeps the structural index
//! coherent with the on-disk bytes (index updates happen only after the
//! corresponding cell writes succeed), marks every touched range dirty,
//! and participates in the enclosing transaction (one is begun
//! automatically when none is active).

use crate::bigdata::{BigDataBlock, BIG_DATA_SEGMENT_SIZE, MAX_DIRECT_DATA_SIZE};
use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::hive::Hive;
use crate::key::{
    KeyNode, NK_MAX_SUBKEY_NAME_OFFSET, NK_MAX_VALUE_DATA_OFFSET, NK_MAX_VALUE_NAME_OFFSET,
    NK_SUBKEY_COUNT_OFFSET, NK_SUBKEY_LIST_OFFSET, NK_TIMESTAMP_OFFSET, NK_VALUE_COUNT_OFFSET,
    NK_VALUE_LIST_OFFSET,
};
use crate::security::{SecurityCell, SK_BLINK_OFFSET, SK_FLINK_OFFSET, SK_REFCOUNT_OFFSET};
use crate::subkey_list::{hash_leaf_hash, SubkeyList, LEAF_CAPACITY};
use crate::utils::{filetime_now, fold_name, read_u32_le, NONE_OFFSET};
use crate::value::{
    ValueKey, VK_DATA_INLINE_BIT, VK_DATA_LENGTH_OFFSET, VK_DATA_OFFSET_OFFSET, VK_TYPE_OFFSET,
};
use tracing::{debug, instrument};

#[inline]
fn offset_present(offset: u32) -> bool {
    offset != NONE_OFFSET && offset != 0
}

/// Byte length of a name as stored in the NK bookkeeping fields (UTF-16
/// code units, two bytes each).
fn name_utf16_len(name: &str) -> u32 {
    (name.encode_utf16().count() * 2) as u32
}

impl Hive {
    // -- read side ---------------------------------------------------------

    /// Parses the key node at `offset`.
    pub fn key_node(&self, offset: u32) -> Result<KeyNode> {
        KeyNode::parse(self.read_cell(offset)?, offset)
    }

    /// Parses the value key at `offset`.
    pub fn value_key(&self, offset: u32) -> Result<ValueKey> {
        ValueKey::parse(self.read_cell(offset)?, offset)
    }

    /// Reads a value's type and raw bytes by name. `Ok(None)` when the key
    /// has no value of that name.
    pub fn read_value(&self, key_offset: u32, name: &str) -> Result<Option<(ValueType, Vec<u8>)>> {
        let Some(vk_offset) = self.index.get_value(key_offset, name) else {
            return Ok(None);
        };

        let vk = self.value_key(vk_offset)?;
        let bytes = self.value_bytes(&vk)?;
        Ok(Some((vk.data_type, bytes)))
    }

    /// Reads a value's decoded data by name.
    pub fn read_value_parsed(
        &self,
        key_offset: u32,
        name: &str,
    ) -> Result<Option<crate::value::ValueData>> {
        match self.read_value(key_offset, name)? {
            Some((data_type, bytes)) => Ok(Some(crate::value::ValueData::parse(
                &bytes, data_type, key_offset,
            )?)),
            None => Ok(None),
        }
    }

    /// Raw bytes behind a parsed value key.
    fn value_bytes(&self, vk: &ValueKey) -> Result<Vec<u8>> {
        if vk.is_inline_data() {
            Ok(vk.inline_data())
        } else if vk.data_length == 0 || !offset_present(vk.data_offset) {
            Ok(Vec::new())
        } else {
            self.read_value_data(vk.data_offset, vk.data_length)
        }
    }

    /// Names of all subkeys of a key, in on-disk order.
    pub fn subkey_names(&self, key_offset: u32) -> Result<Vec<String>> {
        let node = self.key_node(key_offset)?;
        let mut offsets = Vec::new();
        if node.subkey_count > 0 && offset_present(node.subkey_list_offset) {
            self.collect_subkey_offsets(node.subkey_list_offset, &mut offsets)?;
        }

        let mut names = Vec::with_capacity(offsets.len());
        for offset in offsets {
            names.push(self.key_node(offset)?.name);
        }
        Ok(names)
    }

    /// Names of all values of a key, in value-list order.
    pub fn value_names(&self, key_offset: u32) -> Result<Vec<String>> {
        let node = self.key_node(key_offset)?;
        let offsets = self.value_list_entries(&node)?;

        let mut names = Vec::with_capacity(offsets.len());
        for offset in offsets {
            names.push(self.value_key(offset)?.name);
        }
        Ok(names)
    }

    /// Recursively collects subkey offsets from a subkey list, flattening
    /// ri roots. The format allows exactly one ri level; a nested ri is
    /// corruption.
    fn collect_subkey_offsets(&self, list_offset: u32, out: &mut Vec<u32>) -> Result<()> {
        self.collect_subkey_offsets_depth(list_offset, out, 0)
    }

    fn collect_subkey_offsets_depth(
        &self,
        list_offset: u32,
        out: &mut Vec<u32>,
        depth: u8,
    ) -> Result<()> {
        if !offset_present(list_offset) {
            return Ok(());
        }

        let list = SubkeyList::parse(self.read_cell(list_offset)?, list_offset)?;
        if list.is_index_root() {
            if depth > 0 {
                return Err(RegistryError::InvalidFormat(format!(
                    "Nested index root at {:#x}",
                    list_offset
                )));
            }
            for sublist in list.key_offsets_iter() {
                self.collect_subkey_offsets_depth(sublist, out, depth + 1)?;
            }
        } else {
            out.extend(list.key_offsets_iter());
        }
        Ok(())
    }

    /// Reads the vk offsets of a key's value list.
    fn value_list_entries(&self, node: &KeyNode) -> Result<Vec<u32>> {
        if node.value_count == 0 || !offset_present(node.value_list_offset) {
            return Ok(Vec::new());
        }

        let list_data = self.read_cell(node.value_list_offset)?;
        let count = node.value_count as usize;
        if list_data.len() < count * 4 {
            return Err(RegistryError::TruncatedData {
                offset: node.value_list_offset,
                expected: count * 4,
                actual: list_data.len(),
            });
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            entries.push(read_u32_le(list_data, i * 4)?);
        }
        Ok(entries)
    }

    // -- path / key creation -----------------------------------------------

    /// Walks `components` from the root, creating every missing key along
    /// the way. Returns the leaf offset and how many keys were created.
    ///
    /// Idempotent: a second call with the same path returns the same leaf
    /// and creates nothing.
    #[instrument(skip(self, components), fields(depth = components.len()))]
    pub fn ensure_path(&mut self, components: &[&str]) -> Result<(u32, usize)> {
        self.begin()?;

        let mut current = self.root_offset();
        let mut created = 0usize;

        for component in components {
            if component.is_empty() {
                return Err(RegistryError::InvalidFormat(
                    "Empty path component".to_string(),
                ));
            }

            match self.index.get_key(current, component) {
                Some(child) => current = child,
                None => {
                    current = self.create_subkey(current, component)?;
                    created += 1;
                }
            }
        }

        Ok((current, created))
    }

    /// Allocates and links a new empty subkey under `parent`.
    fn create_subkey(&mut self, parent: u32, name: &str) -> Result<u32> {
        let parent_node = self.key_node(parent)?;
        let timestamp = filetime_now();

        let payload = KeyNode::encode_new(
            name,
            parent,
            parent_node.security_offset,
            0,
            timestamp,
        )?;
        let nk_offset = self.alloc_cell(payload.len())?;
        self.write_bytes(Self::payload_abs(nk_offset), &payload)?;

        // The new key shares its parent's security descriptor.
        if offset_present(parent_node.security_offset) {
            self.sk_reference(parent_node.security_offset)?;
        }

        self.insert_subkey_entry(parent, name, nk_offset)?;

        self.write_field_u32(parent, NK_SUBKEY_COUNT_OFFSET, parent_node.subkey_count + 1)?;
        self.write_field_u64(parent, NK_TIMESTAMP_OFFSET, timestamp)?;
        if name_utf16_len(name) > parent_node.max_subkey_name_len {
            self.write_field_u32(parent, NK_MAX_SUBKEY_NAME_OFFSET, name_utf16_len(name))?;
        }

        self.index.add_key(parent, name, nk_offset);
        debug!(parent = %format!("{:#x}", parent), name, offset = %format!("{:#x}", nk_offset), "Created key");
        Ok(nk_offset)
    }

    /// Inserts `child` into the parent's subkey list, keeping entries
    /// ordered by case-folded name.
    fn insert_subkey_entry(&mut self, parent: u32, name: &str, child: u32) -> Result<()> {
        let node = self.key_node(parent)?;
        let mut entries = self.subkey_entries_with_names(&node)?;

        let folded = fold_name(name);
        let position = entries.partition_point(|(_, n)| fold_name(n) < folded);
        entries.insert(position, (child, name.to_string()));

        self.write_subkey_list(parent, node.subkey_list_offset, &entries)
    }

    /// Removes `child` from the parent's subkey list.
    fn remove_subkey_entry(&mut self, parent: u32, child: u32) -> Result<()> {
        let node = self.key_node(parent)?;
        let mut entries = self.subkey_entries_with_names(&node)?;
        let before = entries.len();
        entries.retain(|(offset, _)| *offset != child);

        if entries.len() == before {
            return Err(RegistryError::InconsistentIndex(format!(
                "Subkey {:#x} missing from parent {:#x} list",
                child, parent
            )));
        }

        if entries.is_empty() {
            self.free_subkey_list(node.subkey_list_offset)?;
            self.write_field_u32(parent, NK_SUBKEY_LIST_OFFSET, NONE_OFFSET)?;
            Ok(())
        } else {
            self.write_subkey_list(parent, node.subkey_list_offset, &entries)
        }
    }

    /// Reads `(offset, name)` for each child in the parent's list.
    fn subkey_entries_with_names(&self, node: &KeyNode) -> Result<Vec<(u32, String)>> {
        let mut offsets = Vec::new();
        if node.subkey_count > 0 && offset_present(node.subkey_list_offset) {
            self.collect_subkey_offsets(node.subkey_list_offset, &mut offsets)?;
        }

        let mut entries = Vec::with_capacity(offsets.len());
        for offset in offsets {
            entries.push((offset, self.key_node(offset)?.name));
        }
        Ok(entries)
    }

    /// Writes the parent's subkey list for the given entries: a single
    /// hash leaf while they fit, an ri-rooted two-level structure beyond
    /// [`LEAF_CAPACITY`]. A shrinking list demotes back automatically.
    ///
    /// The single-leaf case rewrites in place when the existing cell has
    /// room; otherwise the old list cells are freed and replaced.
    fn write_subkey_list(
        &mut self,
        parent: u32,
        old_list: u32,
        entries: &[(u32, String)],
    ) -> Result<()> {
        let hashed: Vec<(u32, u32)> = entries
            .iter()
            .map(|(offset, name)| (*offset, hash_leaf_hash(name)))
            .collect();

        if hashed.len() <= LEAF_CAPACITY {
            let bytes = SubkeyList::encode_hash_leaf(&hashed)?;

            if offset_present(old_list) {
                let payload = self.read_cell(old_list)?;
                let is_leaf = payload.len() >= 2 && matches!(&payload[0..2], b"lf" | b"lh" | b"li");
                if is_leaf && payload.len() >= bytes.len() {
                    self.write_bytes(Self::payload_abs(old_list), &bytes)?;
                    return Ok(());
                }
            }

            let new_list = self.alloc_cell(bytes.len())?;
            self.write_bytes(Self::payload_abs(new_list), &bytes)?;
            self.free_subkey_list(old_list)?;
            self.write_field_u32(parent, NK_SUBKEY_LIST_OFFSET, new_list)?;
            Ok(())
        } else {
            let mut leaves = Vec::new();
            for chunk in hashed.chunks(LEAF_CAPACITY) {
                let bytes = SubkeyList::encode_hash_leaf(chunk)?;
                let leaf = self.alloc_cell(bytes.len())?;
                self.write_bytes(Self::payload_abs(leaf), &bytes)?;
                leaves.push(leaf);
            }

            let root_bytes = SubkeyList::encode_index_root(&leaves)?;
            let root = self.alloc_cell(root_bytes.len())?;
            self.write_bytes(Self::payload_abs(root), &root_bytes)?;

            self.free_subkey_list(old_list)?;
            self.write_field_u32(parent, NK_SUBKEY_LIST_OFFSET, root)?;
            Ok(())
        }
    }

    /// Frees a subkey list: the leaf cell, or an ri root and every leaf it
    /// references.
    fn free_subkey_list(&mut self, list_offset: u32) -> Result<()> {
        if !offset_present(list_offset) {
            return Ok(());
        }

        let list = SubkeyList::parse(self.read_cell(list_offset)?, list_offset)?;
        if list.is_index_root() {
            let sublists: Vec<u32> = list.key_offsets_iter().collect();
            for sublist in sublists {
                self.free_cell(sublist)?;
            }
        }
        self.free_cell(list_offset)
    }

    // -- values ------------------------------------------------------------

    /// Creates or updates the value `name` under `key_offset`.
    ///
    /// An identical upsert is a no-op. A growing value is rewritten in
    /// place when the existing data cell has room, reallocated otherwise;
    /// crossing the big-data threshold switches storage regimes.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn upsert_value(
        &mut self,
        key_offset: u32,
        name: &str,
        data_type: ValueType,
        data: &[u8],
    ) -> Result<()> {
        self.begin()?;

        if let Some(vk_offset) = self.index.get_value(key_offset, name) {
            let vk = self.value_key(vk_offset)?;

            if vk.data_type == data_type && self.value_bytes(&vk)? == data {
                debug!(name, "Upsert is a no-op");
                return Ok(());
            }

            self.rewrite_value_data(vk_offset, &vk, data_type, data)?;
        } else {
            let (raw_length, data_offset) = self.store_value_data(data)?;
            let payload = ValueKey::encode_new(name, data_type, raw_length, data_offset)?;
            let vk_offset = self.alloc_cell(payload.len())?;
            self.write_bytes(Self::payload_abs(vk_offset), &payload)?;

            self.append_value_entry(key_offset, vk_offset)?;

            let node = self.key_node(key_offset)?;
            if name_utf16_len(name) > node.max_value_name_len {
                self.write_field_u32(key_offset, NK_MAX_VALUE_NAME_OFFSET, name_utf16_len(name))?;
            }

            self.index.add_value(key_offset, name, vk_offset);
        }

        let node = self.key_node(key_offset)?;
        if data.len() as u32 > node.max_value_data_len {
            self.write_field_u32(key_offset, NK_MAX_VALUE_DATA_OFFSET, data.len() as u32)?;
        }
        self.write_field_u64(key_offset, NK_TIMESTAMP_OFFSET, filetime_now())?;

        Ok(())
    }

    /// Deletes the value `name` under `key_offset`, freeing its data cells
    /// (including any big-data structure). Deleting an absent value is a
    /// no-op.
    #[instrument(skip(self))]
    pub fn delete_value(&mut self, key_offset: u32, name: &str) -> Result<()> {
        self.begin()?;

        let Some(vk_offset) = self.index.get_value(key_offset, name) else {
            debug!(name, "Value already absent");
            return Ok(());
        };

        let vk = self.value_key(vk_offset)?;
        self.free_value_data(&vk)?;

        let node = self.key_node(key_offset)?;
        let mut entries = self.value_list_entries(&node)?;
        let before = entries.len();
        entries.retain(|&offset| offset != vk_offset);

        if entries.len() == before {
            return Err(RegistryError::InconsistentIndex(format!(
                "Value {:#x} missing from list of key {:#x}",
                vk_offset, key_offset
            )));
        }

        if entries.is_empty() {
            self.free_cell(node.value_list_offset)?;
            self.write_field_u32(key_offset, NK_VALUE_LIST_OFFSET, NONE_OFFSET)?;
        } else {
            for (i, offset) in entries.iter().enumerate() {
                self.write_u32_at(Self::payload_abs(node.value_list_offset) + i * 4, *offset)?;
            }
        }

        self.write_field_u32(key_offset, NK_VALUE_COUNT_OFFSET, entries.len() as u32)?;
        self.write_field_u64(key_offset, NK_TIMESTAMP_OFFSET, filetime_now())?;

        self.free_cell(vk_offset)?;
        self.index.remove_value(key_offset, name);
        Ok(())
    }

    /// Deletes the subkey `name` of `parent`. The key must have no
    /// subkeys; its values are deleted first. Deleting an absent key is a
    /// no-op.
    #[instrument(skip(self))]
    pub fn delete_key(&mut self, parent: u32, name: &str) -> Result<()> {
        self.begin()?;

        let Some(child) = self.index.get_key(parent, name) else {
            debug!(name, "Key already absent");
            return Ok(());
        };

        let node = self.key_node(child)?;
        if node.subkey_count > 0 {
            return Err(RegistryError::Conflict(format!(
                "Key '{}' has {} subkeys",
                name, node.subkey_count
            )));
        }

        for value_name in self.value_names(child)? {
            self.delete_value(child, &value_name)?;
        }

        if offset_present(node.class_name_offset) {
            self.free_cell(node.class_name_offset)?;
        }

        if offset_present(node.security_offset) {
            self.sk_release(node.security_offset)?;
        }

        self.remove_subkey_entry(parent, child)?;

        let parent_node = self.key_node(parent)?;
        self.write_field_u32(parent, NK_SUBKEY_COUNT_OFFSET, parent_node.subkey_count - 1)?;
        self.write_field_u64(parent, NK_TIMESTAMP_OFFSET, filetime_now())?;

        self.free_cell(child)?;
        self.index.remove_key(parent, name);
        debug!(parent = %format!("{:#x}", parent), name, "Deleted key");
        Ok(())
    }

    // -- value data placement ----------------------------------------------

    /// Stores value bytes per the size policy and returns
    /// `(raw data-length field, data-offset field)`.
    ///
    /// - up to 4 bytes: packed into the offset field, inline bit set;
    /// - up to 16344 bytes: one data cell;
    /// - beyond: db header + block list + 16344-byte segments.
    fn store_value_data(&mut self, data: &[u8]) -> Result<(u32, u32)> {
        if data.len() <= 4 {
            let mut packed = [0u8; 4];
            packed[..data.len()].copy_from_slice(data);
            return Ok((
                data.len() as u32 | VK_DATA_INLINE_BIT,
                u32::from_le_bytes(packed),
            ));
        }

        if data.len() <= MAX_DIRECT_DATA_SIZE as usize {
            let offset = self.alloc_cell(data.len())?;
            self.write_bytes(Self::payload_abs(offset), data)?;
            return Ok((data.len() as u32, offset));
        }

        let mut segments = Vec::with_capacity(BigDataBlock::segments_for(data.len()));
        for chunk in data.chunks(BIG_DATA_SEGMENT_SIZE) {
            let segment = self.alloc_cell(chunk.len())?;
            self.write_bytes(Self::payload_abs(segment), chunk)?;
            segments.push(segment);
        }

        let mut list_bytes = Vec::with_capacity(segments.len() * 4);
        for segment in &segments {
            list_bytes.extend_from_slice(&segment.to_le_bytes());
        }
        let list_offset = self.alloc_cell(list_bytes.len())?;
        self.write_bytes(Self::payload_abs(list_offset), &list_bytes)?;

        let header = BigDataBlock::encode_new(segments.len() as u16, list_offset)?;
        let db_offset = self.alloc_cell(header.len())?;
        self.write_bytes(Self::payload_abs(db_offset), &header)?;

        debug!(
            segments = segments.len(),
            total = data.len(),
            "Stored big-data value"
        );
        Ok((data.len() as u32, db_offset))
    }

    /// Rewrites an existing value's data, reusing storage where the new
    /// bytes fit, and updates the vk fields.
    fn rewrite_value_data(
        &mut self,
        vk_offset: u32,
        vk: &ValueKey,
        data_type: ValueType,
        data: &[u8],
    ) -> Result<()> {
        if data.len() <= 4 {
            if !vk.is_inline_data() {
                self.free_value_data(vk)?;
            }
            let mut packed = [0u8; 4];
            packed[..data.len()].copy_from_slice(data);
            self.write_field_u32(vk_offset, VK_DATA_OFFSET_OFFSET, u32::from_le_bytes(packed))?;
            self.write_field_u32(
                vk_offset,
                VK_DATA_LENGTH_OFFSET,
                data.len() as u32 | VK_DATA_INLINE_BIT,
            )?;
        } else {
            let reusable_cell = !vk.is_inline_data()
                && vk.data_length > 0
                && vk.data_length <= MAX_DIRECT_DATA_SIZE
                && data.len() <= MAX_DIRECT_DATA_SIZE as usize
                && offset_present(vk.data_offset)
                && self.read_cell(vk.data_offset)?.len() >= data.len();

            if reusable_cell {
                self.write_bytes(Self::payload_abs(vk.data_offset), data)?;
                self.write_field_u32(vk_offset, VK_DATA_LENGTH_OFFSET, data.len() as u32)?;
            } else {
                self.free_value_data(vk)?;
                let (raw_length, data_offset) = self.store_value_data(data)?;
                self.write_field_u32(vk_offset, VK_DATA_OFFSET_OFFSET, data_offset)?;
                self.write_field_u32(vk_offset, VK_DATA_LENGTH_OFFSET, raw_length)?;
            }
        }

        self.write_field_u32(vk_offset, VK_TYPE_OFFSET, data_type.as_u32())?;
        Ok(())
    }

    /// Frees the data cells behind a value: nothing for inline data, the
    /// single data cell, or the whole db structure (segments, block list,
    /// header).
    fn free_value_data(&mut self, vk: &ValueKey) -> Result<()> {
        if vk.is_inline_data() || vk.data_length == 0 || !offset_present(vk.data_offset) {
            return Ok(());
        }

        if vk.data_length <= MAX_DIRECT_DATA_SIZE {
            return self.free_cell(vk.data_offset);
        }

        let (list_offset, segments) = {
            let db = BigDataBlock::parse(self.read_cell(vk.data_offset)?, vk.data_offset)?;
            let list_data = self.read_cell(db.segment_list_offset)?;
            let mut segments = Vec::with_capacity(db.segment_count as usize);
            for i in 0..db.segment_count as usize {
                segments.push(read_u32_le(list_data, i * 4)? & 0x7FFF_FFFF);
            }
            (db.segment_list_offset, segments)
        };

        for segment in segments {
            self.free_cell(segment)?;
        }
        self.free_cell(list_offset)?;
        self.free_cell(vk.data_offset)
    }

    /// Appends a vk offset to the key's value list, growing the list in
    /// place when the cell has room and reallocating otherwise.
    fn append_value_entry(&mut self, key_offset: u32, vk_offset: u32) -> Result<()> {
        let node = self.key_node(key_offset)?;
        let count = node.value_count as usize;

        if count == 0 || !offset_present(node.value_list_offset) {
            let list = self.alloc_cell(4)?;
            self.write_u32_at(Self::payload_abs(list), vk_offset)?;
            self.write_field_u32(key_offset, NK_VALUE_LIST_OFFSET, list)?;
        } else {
            let list = node.value_list_offset;
            let capacity = self.read_cell(list)?.len();

            if capacity >= (count + 1) * 4 {
                self.write_u32_at(Self::payload_abs(list) + count * 4, vk_offset)?;
            } else {
                let mut entries = self.value_list_entries(&node)?;
                entries.push(vk_offset);

                let new_list = self.alloc_cell(entries.len() * 4)?;
                for (i, offset) in entries.iter().enumerate() {
                    self.write_u32_at(Self::payload_abs(new_list) + i * 4, *offset)?;
                }
                self.free_cell(list)?;
                self.write_field_u32(key_offset, NK_VALUE_LIST_OFFSET, new_list)?;
            }
        }

        self.write_field_u32(key_offset, NK_VALUE_COUNT_OFFSET, count as u32 + 1)
    }

    // -- security descriptors ----------------------------------------------

    /// Adds one reference to a security cell.
    fn sk_reference(&mut self, sk_offset: u32) -> Result<()> {
        let count = self.read_field_u32(sk_offset, SK_REFCOUNT_OFFSET)?;
        self.write_field_u32(sk_offset, SK_REFCOUNT_OFFSET, count + 1)
    }

    /// Drops one reference to a security cell; at zero the cell is
    /// unlinked from the circular sk list and freed.
    fn sk_release(&mut self, sk_offset: u32) -> Result<()> {
        let sk = SecurityCell::parse(self.read_cell(sk_offset)?, sk_offset)?;

        if sk.reference_count > 1 {
            return self.write_field_u32(sk_offset, SK_REFCOUNT_OFFSET, sk.reference_count - 1);
        }

        if sk.flink != sk_offset {
            self.write_field_u32(sk.blink, SK_FLINK_OFFSET, sk.flink)?;
            self.write_field_u32(sk.flink, SK_BLINK_OFFSET, sk.blink)?;
        }
        self.free_cell(sk_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::FlushMode;

    fn scratch_hive() -> (tempfile::TempDir, Hive) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("editor.hiv");
        let hive = Hive::create(&path, "editor-test").unwrap();
        (dir, hive)
    }

    #[test]
    fn test_ensure_path_creates_and_is_idempotent() {
        let (_dir, mut hive) = scratch_hive();

        let (leaf, created) = hive.ensure_path(&["Software", "Vendor", "Product"]).unwrap();
        assert_eq!(created, 3);

        let (again, created_again) = hive.ensure_path(&["Software", "Vendor", "Product"]).unwrap();
        assert_eq!(created_again, 0);
        assert_eq!(leaf, again);

        assert_eq!(hive.walk_path(&["Software", "Vendor", "Product"]), Some(leaf));
        assert_eq!(hive.walk_path(&["software", "VENDOR", "product"]), Some(leaf));
        assert_eq!(hive.walk_path(&["Software", "Missing"]), None);
    }

    #[test]
    fn test_create_updates_parent_bookkeeping() {
        let (_dir, mut hive) = scratch_hive();

        let (child, _) = hive.ensure_path(&["Network"]).unwrap();
        let root = hive.root_offset();
        let root_node = hive.key_node(root).unwrap();

        assert_eq!(root_node.subkey_count, 1);
        let child_node = hive.key_node(child).unwrap();
        assert_eq!(child_node.parent_offset, root);
        assert_eq!(child_node.security_offset, root_node.security_offset);

        // Shared descriptor gained a reference.
        let sk = hive
            .read_cell(root_node.security_offset)
            .map(|payload| SecurityCell::parse(payload, root_node.security_offset).unwrap())
            .unwrap();
        assert_eq!(sk.reference_count, 2);
    }

    #[test]
    fn test_upsert_and_read_back() {
        let (_dir, mut hive) = scratch_hive();
        let (key, _) = hive.ensure_path(&["Config"]).unwrap();

        hive.upsert_value(key, "Path", ValueType::String, b"C\0:\0\\\0\0\0")
            .unwrap();
        hive.upsert_value(key, "Timeout", ValueType::Dword, &30u32.to_le_bytes())
            .unwrap();

        let (dtype, bytes) = hive.read_value(key, "Path").unwrap().unwrap();
        assert_eq!(dtype, ValueType::String);
        assert_eq!(bytes, b"C\0:\0\\\0\0\0");

        // Dword is small enough to be inline.
        let vk_offset = hive.index.get_value(key, "timeout").unwrap();
        let vk = hive.value_key(vk_offset).unwrap();
        assert!(vk.is_inline_data());

        let node = hive.key_node(key).unwrap();
        assert_eq!(node.value_count, 2);
    }

    #[test]
    fn test_upsert_identical_is_noop() {
        let (_dir, mut hive) = scratch_hive();
        let (key, _) = hive.ensure_path(&["Noop"]).unwrap();

        hive.upsert_value(key, "v", ValueType::Binary, &[1, 2, 3, 4, 5])
            .unwrap();
        let (free_cells, free_bytes) = hive.free_space();

        hive.upsert_value(key, "v", ValueType::Binary, &[1, 2, 3, 4, 5])
            .unwrap();
        assert_eq!(hive.free_space(), (free_cells, free_bytes));
        assert_eq!(hive.key_node(key).unwrap().value_count, 1);
    }

    #[test]
    fn test_upsert_rewrites_across_size_classes() {
        let (_dir, mut hive) = scratch_hive();
        let (key, _) = hive.ensure_path(&["Sizes"]).unwrap();

        // inline -> single cell -> big data -> back to inline
        hive.upsert_value(key, "v", ValueType::Binary, &[0xAA; 3]).unwrap();
        let (_, bytes) = hive.read_value(key, "v").unwrap().unwrap();
        assert_eq!(bytes, vec![0xAA; 3]);

        hive.upsert_value(key, "v", ValueType::Binary, &[0xBB; 300]).unwrap();
        let (_, bytes) = hive.read_value(key, "v").unwrap().unwrap();
        assert_eq!(bytes, vec![0xBB; 300]);

        let big: Vec<u8> = (0..40_000u32).map(|i| (i % 256) as u8).collect();
        hive.upsert_value(key, "v", ValueType::Binary, &big).unwrap();
        let (_, bytes) = hive.read_value(key, "v").unwrap().unwrap();
        assert_eq!(bytes, big);

        hive.upsert_value(key, "v", ValueType::Binary, &[0xCC]).unwrap();
        let (_, bytes) = hive.read_value(key, "v").unwrap().unwrap();
        assert_eq!(bytes, vec![0xCC]);

        assert_eq!(hive.key_node(key).unwrap().value_count, 1);
    }

    #[test]
    fn test_empty_value_name_is_distinct() {
        let (_dir, mut hive) = scratch_hive();
        let (key, _) = hive.ensure_path(&["Defaults"]).unwrap();

        hive.upsert_value(key, "", ValueType::String, b"d\0e\0f\0\0\0").unwrap();
        hive.upsert_value(key, "named", ValueType::Dword, &1u32.to_le_bytes()).unwrap();

        let (dtype, bytes) = hive.read_value(key, "").unwrap().unwrap();
        assert_eq!(dtype, ValueType::String);
        assert_eq!(bytes, b"d\0e\0f\0\0\0");

        hive.delete_value(key, "").unwrap();
        assert!(hive.read_value(key, "").unwrap().is_none());
        assert!(hive.read_value(key, "named").unwrap().is_some());
    }

    #[test]
    fn test_delete_value_then_reinsert() {
        let (_dir, mut hive) = scratch_hive();
        let (key, _) = hive.ensure_path(&["Cycle"]).unwrap();

        hive.upsert_value(key, "v", ValueType::Dword, &7u32.to_le_bytes()).unwrap();
        hive.delete_value(key, "v").unwrap();
        assert!(hive.read_value(key, "v").unwrap().is_none());
        assert_eq!(hive.key_node(key).unwrap().value_count, 0);

        // Deleting again is a no-op.
        hive.delete_value(key, "v").unwrap();

        hive.upsert_value(key, "v", ValueType::Dword, &8u32.to_le_bytes()).unwrap();
        let (_, bytes) = hive.read_value(key, "v").unwrap().unwrap();
        assert_eq!(bytes, 8u32.to_le_bytes());
    }

    #[test]
    fn test_delete_key_requires_no_subkeys() {
        let (_dir, mut hive) = scratch_hive();
        hive.ensure_path(&["A", "B"]).unwrap();
        let root = hive.root_offset();

        assert!(matches!(
            hive.delete_key(root, "A"),
            Err(RegistryError::Conflict(_))
        ));

        let (a, _) = hive.ensure_path(&["A"]).unwrap();
        hive.delete_key(a, "B").unwrap();
        hive.delete_key(root, "A").unwrap();
        assert_eq!(hive.walk_path(&["A"]), None);
        assert_eq!(hive.key_node(root).unwrap().subkey_count, 0);
    }

    #[test]
    fn test_delete_key_frees_values_and_security_reference() {
        let (_dir, mut hive) = scratch_hive();
        let (key, _) = hive.ensure_path(&["Doomed"]).unwrap();
        hive.upsert_value(key, "big", ValueType::Binary, &vec![1u8; 5000]).unwrap();

        let root = hive.root_offset();
        let sk_offset = hive.key_node(root).unwrap().security_offset;

        hive.delete_key(root, "Doomed").unwrap();

        let sk = SecurityCell::parse(hive.read_cell(sk_offset).unwrap(), sk_offset).unwrap();
        assert_eq!(sk.reference_count, 1);
        assert!(hive.walk_path(&["Doomed"]).is_none());
    }

    #[test]
    fn test_subkey_list_promotes_to_index_root_and_demotes() {
        let (_dir, mut hive) = scratch_hive();
        let (parent, _) = hive.ensure_path(&["Many"]).unwrap();

        let count = LEAF_CAPACITY + 40;
        for i in 0..count {
            hive.ensure_path(&["Many", &format!("K{:05}", i)]).unwrap();
        }

        let node = hive.key_node(parent).unwrap();
        assert_eq!(node.subkey_count, count as u32);
        let list = SubkeyList::parse(
            hive.read_cell(node.subkey_list_offset).unwrap(),
            node.subkey_list_offset,
        )
        .unwrap();
        assert!(list.is_index_root());

        // Every child remains resolvable through the index.
        assert!(hive.walk_path(&["Many", "K00000"]).is_some());
        assert!(hive.walk_path(&["Many", &format!("K{:05}", count - 1)]).is_some());

        // Shrink back under the threshold; the list demotes to one leaf.
        for i in LEAF_CAPACITY / 2..count {
            hive.delete_key(parent, &format!("K{:05}", i)).unwrap();
        }

        let node = hive.key_node(parent).unwrap();
        assert_eq!(node.subkey_count, (LEAF_CAPACITY / 2) as u32);
        let list = SubkeyList::parse(
            hive.read_cell(node.subkey_list_offset).unwrap(),
            node.subkey_list_offset,
        )
        .unwrap();
        assert!(!list.is_index_root());

        hive.commit(FlushMode::Auto).unwrap();
    }

    #[test]
    fn test_incremental_index_matches_rebuild() {
        let (_dir, mut hive) = scratch_hive();

        hive.ensure_path(&["Software", "Vendor"]).unwrap();
        let (key, _) = hive.ensure_path(&["Software", "Vendor", "App"]).unwrap();
        hive.upsert_value(key, "a", ValueType::Dword, &1u32.to_le_bytes()).unwrap();
        hive.upsert_value(key, "b", ValueType::Binary, &[9u8; 600]).unwrap();
        hive.delete_value(key, "a").unwrap();
        hive.ensure_path(&["Software", "Other"]).unwrap();
        hive.delete_key(hive.walk_path(&["Software"]).unwrap(), "Other").unwrap();

        let incremental = hive.index_stats();
        hive.rebuild_index().unwrap();
        let rebuilt = hive.index_stats();

        assert_eq!(incremental.keys, rebuilt.keys);
        assert_eq!(incremental.values, rebuilt.values);

        // Spot-check the same resolutions hold.
        assert!(hive.walk_path(&["Software", "Vendor", "App"]).is_some());
        assert!(hive.read_value(key, "b").unwrap().is_some());
        assert!(hive.read_value(key, "a").unwrap().is_none());
    }
}

//! Subkey list parsing and serialization (lf, lh, li, ri).
//!
//! Registry keys organize their subkeys in leaf lists (lf/lh/li) or, past a
//! capacity threshold, in a two-level structure rooted at an index root
//! (ri) whose entries point at leaf lists. All four kinds are accepted on
//! read; this crate always writes hash leaves (lh) for new lists.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u32_le, write_u16_le, write_u32_le};

/// Maximum number of entries written into a single leaf before the list is
/// promoted to an ri-rooted two-level structure.
pub const LEAF_CAPACITY: usize = 512;

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list with 4-byte name hints.
    FastLeaf,

    /// Hash leaf (lh) - list with name hash hints.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig }),
        }
    }

    /// Returns the 2-byte signature for this list type.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            SubkeyListType::IndexLeaf => b"li",
            SubkeyListType::FastLeaf => b"lf",
            SubkeyListType::HashLeaf => b"lh",
            SubkeyListType::IndexRoot => b"ri",
        }
    }
}

/// Subkey list entry (for lf/lh lists).
#[derive(Debug, Clone)]
pub struct SubkeyListEntry {
    /// Offset to the key node.
    pub key_offset: u32,

    /// Name hint (first 4 chars for lf, hash for lh).
    pub name_hint: u32,
}

/// Parsed subkey list.
#[derive(Debug, Clone)]
pub enum SubkeyList {
    /// Index leaf - simple list of offsets.
    IndexLeaf(Vec<u32>),

    /// Fast leaf or hash leaf - list with hints.
    LeafWithHints(Vec<SubkeyListEntry>),

    /// Index root - list of sublist offsets.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let sig = [data[0], data[1]];
        let list_type = SubkeyListType::from_signature(&sig)?;

        let count = u16::from_le_bytes([data[2], data[3]]) as usize;

        match list_type {
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => {
                // li/ri: signature (2) + count (2) + offsets (4 * count)
                let expected_size = 4 + (count * 4);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(read_u32_le(data, 4 + i * 4)?);
                }

                if list_type == SubkeyListType::IndexLeaf {
                    Ok(SubkeyList::IndexLeaf(offsets))
                } else {
                    Ok(SubkeyList::IndexRoot(offsets))
                }
            }

            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
                // lf/lh: signature (2) + count (2) + entries (8 * count)
                // Each entry: offset (4) + hint (4)
                let expected_size = 4 + (count * 8);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let entry_pos = 4 + i * 8;
                    entries.push(SubkeyListEntry {
                        key_offset: read_u32_le(data, entry_pos)?,
                        name_hint: read_u32_le(data, entry_pos + 4)?,
                    });
                }

                Ok(SubkeyList::LeafWithHints(entries))
            }
        }
    }

    /// Serializes a hash leaf (lh) payload from `(offset, hash)` entries.
    pub fn encode_hash_leaf(entries: &[(u32, u32)]) -> Result<Vec<u8>> {
        if entries.len() > u16::MAX as usize {
            return Err(RegistryError::InvalidFormat(format!(
                "Subkey leaf too large: {} entries",
                entries.len()
            )));
        }

        let mut buf = vec![0u8; 4 + entries.len() * 8];
        buf[0..2].copy_from_slice(b"lh");
        write_u16_le(&mut buf, 2, entries.len() as u16)?;
        for (i, (offset, hash)) in entries.iter().enumerate() {
            write_u32_le(&mut buf, 4 + i * 8, *offset)?;
            write_u32_le(&mut buf, 8 + i * 8, *hash)?;
        }
        Ok(buf)
    }

    /// Serializes an index root (ri) payload from sublist offsets.
    pub fn encode_index_root(sublists: &[u32]) -> Result<Vec<u8>> {
        if sublists.len() > u16::MAX as usize {
            return Err(RegistryError::InvalidFormat(format!(
                "Index root too large: {} sublists",
                sublists.len()
            )));
        }

        let mut buf = vec![0u8; 4 + sublists.len() * 4];
        buf[0..2].copy_from_slice(b"ri");
        write_u16_le(&mut buf, 2, sublists.len() as u16)?;
        for (i, offset) in sublists.iter().enumerate() {
            write_u32_le(&mut buf, 4 + i * 4, *offset)?;
        }
        Ok(buf)
    }

    /// Returns an iterator over key offsets.
    ///
    /// For IndexRoot lists this yields the sublist offsets, not key offsets.
    pub fn key_offsets_iter(&self) -> impl Iterator<Item = u32> + '_ {
        match self {
            SubkeyList::IndexLeaf(offsets) => {
                Box::new(offsets.iter().copied()) as Box<dyn Iterator<Item = u32> + '_>
            }
            SubkeyList::LeafWithHints(entries) => {
                Box::new(entries.iter().map(|e| e.key_offset))
            }
            SubkeyList::IndexRoot(offsets) => Box::new(offsets.iter().copied()),
        }
    }

    /// Returns the number of entries in this list.
    pub fn len(&self) -> usize {
        match self {
            SubkeyList::IndexLeaf(offsets) => offsets.len(),
            SubkeyList::LeafWithHints(entries) => entries.len(),
            SubkeyList::IndexRoot(offsets) => offsets.len(),
        }
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this is an index root (contains sublists).
    pub fn is_index_root(&self) -> bool {
        matches!(self, SubkeyList::IndexRoot(_))
    }
}

/// Computes the lh-leaf name hash: iterated multiply-by-37 over the
/// uppercased UTF-16 code units of the key name.
pub fn hash_leaf_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for unit in name.encode_utf16() {
        let upper = if unit < 128 {
            (unit as u8).to_ascii_uppercase() as u16
        } else {
            unit
        };
        hash = hash.wrapping_mul(37).wrapping_add(u32::from(upper));
    }
    hash
}

/// Computes the lf-leaf name hint: the first four ASCII bytes of the name,
/// zero-padded.
pub fn fast_leaf_hint(name: &str) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in name.bytes().take(4).enumerate() {
        bytes[i] = b;
    }
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subkey_list_type() {
        assert_eq!(
            SubkeyListType::from_signature(b"li").unwrap(),
            SubkeyListType::IndexLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lf").unwrap(),
            SubkeyListType::FastLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lh").unwrap(),
            SubkeyListType::HashLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"ri").unwrap(),
            SubkeyListType::IndexRoot
        );
    }

    #[test]
    fn test_invalid_signature() {
        let result = SubkeyListType::from_signature(b"XX");
        assert!(result.is_err());
    }

    #[test]
    fn test_hash_leaf_round_trip() {
        let entries = [(0x20u32, hash_leaf_hash("Alpha")), (0x80, hash_leaf_hash("Beta"))];
        let payload = SubkeyList::encode_hash_leaf(&entries).unwrap();

        let list = SubkeyList::parse(&payload, 0).unwrap();
        assert_eq!(list.len(), 2);
        let offsets: Vec<u32> = list.key_offsets_iter().collect();
        assert_eq!(offsets, vec![0x20, 0x80]);

        match list {
            SubkeyList::LeafWithHints(entries) => {
                assert_eq!(entries[0].name_hint, hash_leaf_hash("Alpha"));
            }
            _ => panic!("expected leaf with hints"),
        }
    }

    #[test]
    fn test_index_root_round_trip() {
        let payload = SubkeyList::encode_index_root(&[0x100, 0x200, 0x300]).unwrap();
        let list = SubkeyList::parse(&payload, 0).unwrap();
        assert!(list.is_index_root());
        let offsets: Vec<u32> = list.key_offsets_iter().collect();
        assert_eq!(offsets, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn test_hash_is_case_insensitive() {
        assert_eq!(hash_leaf_hash("system"), hash_leaf_hash("SYSTEM"));
        assert_eq!(hash_leaf_hash("System"), hash_leaf_hash("sYsTeM"));
        assert_ne!(hash_leaf_hash("system"), hash_leaf_hash("system32"));
    }

    #[test]
    fn test_fast_leaf_hint() {
        assert_eq!(fast_leaf_hint("AB"), u32::from_le_bytes([b'A', b'B', 0, 0]));
        assert_eq!(
            fast_leaf_hint("Software"),
            u32::from_le_bytes([b'S', b'o', b'f', b't'])
        );
    }
}

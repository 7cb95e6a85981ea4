//! In-memory structural index over the key tree.
//!
//! The on-disk format encodes navigation as hash-indexed subkey lists; the
//! runtime index replaces that with O(1) maps from
//! `(parent-cell-offset, lowercased-name)` to the child cell offset, one
//! map for keys and one for values. The index is derived state: it is
//! rebuilt from the on-disk structure at open and kept coherent by the
//! editor on every mutation.
//!
//! Three interchangeable implementations are provided behind
//! [`StructuralIndex`]; the implementation is selected once at hive-open
//! time and never mixed within a handle.

use crate::utils::fold_name;
use std::collections::HashMap;
use std::mem::size_of;

/// Index implementation selector, chosen at hive-open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexKind {
    /// Composite string keys `"<parent>:<lowered-name>"`. Simple and the
    /// fastest to build.
    #[default]
    StringKey,

    /// `(parent, interned-name-symbol)` keys over a per-handle interner.
    /// Lower memory when many keys share vocabulary.
    Interned,

    /// 64-bit `(parent << 32) | fnv1a32(name)` keys with a collision
    /// table. Near-zero allocations on lookup.
    Numeric,
}

/// Size and shape statistics for an index.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IndexStats {
    /// Number of key entries.
    pub keys: usize,

    /// Number of value entries.
    pub values: usize,

    /// Approximate heap footprint in bytes.
    pub approx_bytes: usize,

    /// Implementation tag.
    pub implementation: &'static str,
}

/// Capability set shared by all index implementations.
///
/// Names are case-folded inside the index on both insertion and lookup, so
/// callers pass names as stored on disk. The empty value name is a valid
/// name (the key's default value), distinct from "absent".
pub trait StructuralIndex {
    /// Records a subkey under its parent.
    fn add_key(&mut self, parent: u32, name: &str, child: u32);

    /// Records a value under its owning key.
    fn add_value(&mut self, parent: u32, name: &str, vk: u32);

    /// Looks up a subkey offset by name.
    fn get_key(&self, parent: u32, name: &str) -> Option<u32>;

    /// Looks up a value cell offset by name.
    fn get_value(&self, parent: u32, name: &str) -> Option<u32>;

    /// Removes a subkey entry. Absent entries are ignored.
    fn remove_key(&mut self, parent: u32, name: &str);

    /// Removes a value entry. Absent entries are ignored.
    fn remove_value(&mut self, parent: u32, name: &str);

    /// Returns size and shape statistics.
    fn stats(&self) -> IndexStats;

    /// Drops all entries.
    fn clear(&mut self);
}

/// Constructs an empty index of the requested kind.
pub fn make_index(kind: IndexKind) -> Box<dyn StructuralIndex> {
    match kind {
        IndexKind::StringKey => Box::new(StringKeyIndex::default()),
        IndexKind::Interned => Box::new(InternedIndex::default()),
        IndexKind::Numeric => Box::new(NumericIndex::default()),
    }
}

// ---------------------------------------------------------------------------
// String-key variant

/// Index keyed by composite `"<parent>:<lowered-name>"` strings.
#[derive(Debug, Default)]
pub struct StringKeyIndex {
    keys: HashMap<String, u32>,
    values: HashMap<String, u32>,
}

impl StringKeyIndex {
    fn composite(parent: u32, name: &str) -> String {
        format!("{:x}:{}", parent, fold_name(name))
    }
}

impl StructuralIndex for StringKeyIndex {
    fn add_key(&mut self, parent: u32, name: &str, child: u32) {
        self.keys.insert(Self::composite(parent, name), child);
    }

    fn add_value(&mut self, parent: u32, name: &str, vk: u32) {
        self.values.insert(Self::composite(parent, name), vk);
    }

    fn get_key(&self, parent: u32, name: &str) -> Option<u32> {
        self.keys.get(&Self::composite(parent, name)).copied()
    }

    fn get_value(&self, parent: u32, name: &str) -> Option<u32> {
        self.values.get(&Self::composite(parent, name)).copied()
    }

    fn remove_key(&mut self, parent: u32, name: &str) {
        self.keys.remove(&Self::composite(parent, name));
    }

    fn remove_value(&mut self, parent: u32, name: &str) {
        self.values.remove(&Self::composite(parent, name));
    }

    fn stats(&self) -> IndexStats {
        let entry_bytes = |map: &HashMap<String, u32>| {
            map.iter()
                .map(|(k, _)| k.capacity() + size_of::<String>() + size_of::<u32>())
                .sum::<usize>()
        };

        IndexStats {
            keys: self.keys.len(),
            values: self.values.len(),
            approx_bytes: entry_bytes(&self.keys) + entry_bytes(&self.values),
            implementation: "string-key",
        }
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
    }
}

// ---------------------------------------------------------------------------
// Interned variant

/// Index keyed by `(parent, interned-name-symbol)` pairs.
///
/// The interner is per-handle; symbols are never shared across hives.
#[derive(Debug, Default)]
pub struct InternedIndex {
    symbols: HashMap<String, u32>,
    names: Vec<String>,
    keys: HashMap<(u32, u32), u32>,
    values: HashMap<(u32, u32), u32>,
}

impl InternedIndex {
    /// Interns a folded name, allocating a new symbol on first sight.
    fn intern(&mut self, name: &str) -> u32 {
        let folded = fold_name(name);
        if let Some(&sym) = self.symbols.get(&folded) {
            return sym;
        }
        let sym = self.names.len() as u32;
        self.names.push(folded.clone());
        self.symbols.insert(folded, sym);
        sym
    }

    /// Resolves a folded name to its symbol without allocating.
    fn lookup_symbol(&self, name: &str) -> Option<u32> {
        self.symbols.get(&fold_name(name)).copied()
    }
}

impl StructuralIndex for InternedIndex {
    fn add_key(&mut self, parent: u32, name: &str, child: u32) {
        let sym = self.intern(name);
        self.keys.insert((parent, sym), child);
    }

    fn add_value(&mut self, parent: u32, name: &str, vk: u32) {
        let sym = self.intern(name);
        self.values.insert((parent, sym), vk);
    }

    fn get_key(&self, parent: u32, name: &str) -> Option<u32> {
        let sym = self.lookup_symbol(name)?;
        self.keys.get(&(parent, sym)).copied()
    }

    fn get_value(&self, parent: u32, name: &str) -> Option<u32> {
        let sym = self.lookup_symbol(name)?;
        self.values.get(&(parent, sym)).copied()
    }

    fn remove_key(&mut self, parent: u32, name: &str) {
        if let Some(sym) = self.lookup_symbol(name) {
            self.keys.remove(&(parent, sym));
        }
    }

    fn remove_value(&mut self, parent: u32, name: &str) {
        if let Some(sym) = self.lookup_symbol(name) {
            self.values.remove(&(parent, sym));
        }
    }

    fn stats(&self) -> IndexStats {
        let interner_bytes: usize = self
            .names
            .iter()
            .map(|n| n.capacity() + size_of::<String>())
            .sum::<usize>()
            * 2; // interner holds each name in both directions

        let map_bytes = (self.keys.len() + self.values.len())
            * (size_of::<(u32, u32)>() + size_of::<u32>());

        IndexStats {
            keys: self.keys.len(),
            values: self.values.len(),
            approx_bytes: interner_bytes + map_bytes,
            implementation: "interned",
        }
    }

    fn clear(&mut self) {
        self.symbols.clear();
        self.names.clear();
        self.keys.clear();
        self.values.clear();
    }
}

// ---------------------------------------------------------------------------
// Numeric variant

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the folded name bytes.
fn fnv1a32(name: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Primary slot of a numeric-index bucket: the canonical folded name is
/// stored alongside the offset so collisions can be detected.
#[derive(Debug, Clone)]
struct NumericSlot {
    name: String,
    offset: u32,
}

/// One side (keys or values) of the numeric index.
#[derive(Debug, Default)]
struct NumericMap {
    primary: HashMap<u64, NumericSlot>,
    collisions: HashMap<u64, Vec<(String, u32)>>,
}

impl NumericMap {
    fn compose(parent: u32, folded: &str) -> u64 {
        (u64::from(parent) << 32) | u64::from(fnv1a32(folded))
    }

    fn insert(&mut self, parent: u32, name: &str, offset: u32) {
        let folded = fold_name(name);
        let key = Self::compose(parent, &folded);

        match self.primary.get_mut(&key) {
            None => {
                self.primary.insert(key, NumericSlot { name: folded, offset });
            }
            Some(slot) if slot.name == folded => {
                slot.offset = offset;
            }
            Some(_) => {
                // Genuine hash collision: the primary slot keeps its
                // original owner; newcomers are demoted to the collision
                // table.
                let entries = self.collisions.entry(key).or_default();
                if let Some(entry) = entries.iter_mut().find(|(n, _)| *n == folded) {
                    entry.1 = offset;
                } else {
                    entries.push((folded, offset));
                }
            }
        }
    }

    fn get(&self, parent: u32, name: &str) -> Option<u32> {
        let folded = fold_name(name);
        let key = Self::compose(parent, &folded);

        if let Some(slot) = self.primary.get(&key) {
            if slot.name == folded {
                return Some(slot.offset);
            }
        }

        self.collisions
            .get(&key)?
            .iter()
            .find(|(n, _)| *n == folded)
            .map(|(_, off)| *off)
    }

    fn remove(&mut self, parent: u32, name: &str) {
        let folded = fold_name(name);
        let key = Self::compose(parent, &folded);

        if let Some(slot) = self.primary.get(&key) {
            if slot.name == folded {
                self.primary.remove(&key);
                return;
            }
        }

        // A colliding entry is removed from the collision table only; the
        // primary slot belongs to a different name and must stay intact.
        if let Some(entries) = self.collisions.get_mut(&key) {
            entries.retain(|(n, _)| *n != folded);
            if entries.is_empty() {
                self.collisions.remove(&key);
            }
        }
    }

    fn len(&self) -> usize {
        self.primary.len() + self.collisions.values().map(Vec::len).sum::<usize>()
    }

    fn approx_bytes(&self) -> usize {
        let primary: usize = self
            .primary
            .values()
            .map(|s| s.name.capacity() + size_of::<NumericSlot>() + size_of::<u64>())
            .sum();
        let collisions: usize = self
            .collisions
            .values()
            .flatten()
            .map(|(n, _)| n.capacity() + size_of::<(String, u32)>())
            .sum();
        primary + collisions
    }

    fn clear(&mut self) {
        self.primary.clear();
        self.collisions.clear();
    }
}

/// Index keyed by 64-bit `(parent << 32) | fnv1a32(name)` words with a
/// secondary collision table.
#[derive(Debug, Default)]
pub struct NumericIndex {
    keys: NumericMap,
    values: NumericMap,
}

impl StructuralIndex for NumericIndex {
    fn add_key(&mut self, parent: u32, name: &str, child: u32) {
        self.keys.insert(parent, name, child);
    }

    fn add_value(&mut self, parent: u32, name: &str, vk: u32) {
        self.values.insert(parent, name, vk);
    }

    fn get_key(&self, parent: u32, name: &str) -> Option<u32> {
        self.keys.get(parent, name)
    }

    fn get_value(&self, parent: u32, name: &str) -> Option<u32> {
        self.values.get(parent, name)
    }

    fn remove_key(&mut self, parent: u32, name: &str) {
        self.keys.remove(parent, name);
    }

    fn remove_value(&mut self, parent: u32, name: &str) {
        self.values.remove(parent, name);
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            keys: self.keys.len(),
            values: self.values.len(),
            approx_bytes: self.keys.approx_bytes() + self.values.approx_bytes(),
            implementation: "numeric",
        }
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
    }
}

//! Traversal-engine tests: visit ordering, exactly-once guarantees,
//! cancellation, and resilience against malformed cells.

use reg_editor::{
    CancelToken, CellPurpose, FlushMode, Hive, IndexKind, RegistryError, ValueType, Walker,
};
use std::collections::HashMap;
use tempfile::TempDir;

fn populated_hive(name: &str) -> (TempDir, Hive) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    let mut hive = Hive::create(&path, "walk-test").unwrap();

    for branch in ["Software", "System", "Network"] {
        for leaf in ["A", "B"] {
            let (key, _) = hive.ensure_path(&[branch, leaf]).unwrap();
            hive.upsert_value(key, "small", ValueType::Dword, &1u32.to_le_bytes()).unwrap();
            hive.upsert_value(key, "medium", ValueType::Binary, &[7u8; 512]).unwrap();
        }
    }
    let (big_key, _) = hive.ensure_path(&["Software", "Big"]).unwrap();
    hive.upsert_value(big_key, "blob", ValueType::Binary, &vec![3u8; 40_000]).unwrap();

    hive.commit(FlushMode::Auto).unwrap();
    (dir, hive)
}

#[test]
fn test_visits_each_cell_exactly_once() {
    let (_dir, hive) = populated_hive("once.hiv");

    let mut seen: HashMap<u32, usize> = HashMap::new();
    let stats = Walker::new(hive.data(), hive.root_offset(), hive.base_block().hive_length)
        .walk(|offset, _purpose| {
            *seen.entry(offset).or_default() += 1;
        })
        .unwrap();

    assert!(stats.cells_visited > 0);
    assert_eq!(stats.cells_visited, seen.len());
    assert!(seen.values().all(|&count| count == 1));
}

#[test]
fn test_key_visited_before_its_values() {
    let (_dir, hive) = populated_hive("order.hiv");

    let mut order: Vec<(u32, CellPurpose)> = Vec::new();
    Walker::new(hive.data(), hive.root_offset(), hive.base_block().hive_length)
        .walk(|offset, purpose| order.push((offset, purpose)))
        .unwrap();

    let position = |offset: u32| order.iter().position(|(o, _)| *o == offset).unwrap();

    // For the "Software/A" key, the nk cell must precede its value list
    // and value cells.
    let key = hive.walk_path(&["Software", "A"]).unwrap();
    let node = hive.key_node(key).unwrap();

    let key_pos = position(key);
    let list_pos = position(node.value_list_offset);
    assert!(key_pos < list_pos);
    assert!(matches!(order[key_pos].1, CellPurpose::KeyNode));
    assert!(matches!(order[list_pos].1, CellPurpose::ValueList));
}

#[test]
fn test_census_accounts_for_structures() {
    let (_dir, hive) = populated_hive("census.hiv");

    let census = Walker::new(hive.data(), hive.root_offset(), hive.base_block().hive_length)
        .census()
        .unwrap();

    // Root + 3 branches + 6 leaves + Big = 11 keys.
    assert_eq!(census.key_nodes, 11);
    // 6 leaves x 2 values + 1 big value.
    assert_eq!(census.value_keys, 13);
    // One shared security descriptor.
    assert_eq!(census.security_descriptors, 1);
    // The 40000-byte blob takes a db header, a block list, and 3 segments.
    assert_eq!(census.big_data_headers, 1);
    assert_eq!(census.big_data_block_lists, 1);
    assert_eq!(census.big_data_blocks, 3);
    // 512-byte values take real data cells; dwords are inline.
    assert_eq!(census.data_cells, 6);
}

#[test]
fn test_cancellation_stops_walk() {
    let (_dir, hive) = populated_hive("cancel.hiv");

    let token = CancelToken::new();
    token.cancel();

    let result = Walker::new(hive.data(), hive.root_offset(), hive.base_block().hive_length)
        .with_cancel(token)
        .walk(|_, _| {});

    assert!(matches!(result, Err(RegistryError::Cancelled)));
}

#[test]
fn test_cancellation_mid_walk() {
    let (_dir, hive) = populated_hive("cancel-mid.hiv");

    let token = CancelToken::new();
    let trigger = token.clone();
    let mut visited = 0usize;

    let result = Walker::new(hive.data(), hive.root_offset(), hive.base_block().hive_length)
        .with_cancel(token)
        .walk(|_, _| {
            visited += 1;
            if visited == 3 {
                trigger.cancel();
            }
        });

    assert!(matches!(result, Err(RegistryError::Cancelled)));
    assert!(visited >= 3);

    // A fresh walker over the same bytes still completes: cancellation
    // left no derived state behind.
    let stats = Walker::new(hive.data(), hive.root_offset(), hive.base_block().hive_length)
        .walk(|_, _| {})
        .unwrap();
    assert!(stats.cells_visited > visited);
}

#[test]
fn test_malformed_value_skipped_during_index_build() {
    let (_dir, hive) = populated_hive("broken.hiv");

    // Corrupt one vk cell signature in a copy of the hive image.
    let key = hive.walk_path(&["System", "A"]).unwrap();
    let node = hive.key_node(key).unwrap();
    let list = hive.read_cell(node.value_list_offset).unwrap();
    let vk_offset = u32::from_le_bytes([list[0], list[1], list[2], list[3]]);

    let mut image = hive.to_bytes();
    let abs = 4096 + vk_offset as usize + 4;
    image[abs..abs + 2].copy_from_slice(b"XX");

    let mut index = reg_editor::index::make_index(IndexKind::StringKey);
    let root = hive.root_offset();
    let stats = Walker::new(&image, root, hive.base_block().hive_length)
        .build_index(index.as_mut())
        .unwrap();

    // The build survives, records the skip, and indexes everything else.
    assert!(stats.cells_skipped >= 1);
    assert_eq!(stats.keys_indexed, 11);
    assert_eq!(stats.values_indexed, 12);
    assert!(index.get_key(key, "nonexistent").is_none());
}

#[test]
fn test_build_index_matches_incremental_state() {
    let (_dir, hive) = populated_hive("match.hiv");

    let mut index = reg_editor::index::make_index(IndexKind::StringKey);
    let stats = Walker::new(hive.data(), hive.root_offset(), hive.base_block().hive_length)
        .build_index(index.as_mut())
        .unwrap();

    let live = hive.index_stats();
    assert_eq!(stats.keys_indexed, live.keys);
    assert_eq!(stats.values_indexed, live.values);

    // Fresh build resolves the same offsets the live index does.
    let key = hive.walk_path(&["Network", "B"]).unwrap();
    let parent = hive.walk_path(&["Network"]).unwrap();
    assert_eq!(index.get_key(parent, "b"), Some(key));
}

//! Structural-index tests: variant parity, collision handling, and
//! coherence with the on-disk tree.

use reg_editor::index::{make_index, NumericIndex};
use reg_editor::{FlushMode, Hive, HiveOptions, IndexKind, StructuralIndex, ValueType};
use tempfile::TempDir;

fn scratch_with(kind: IndexKind) -> (TempDir, Hive) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.hiv");
    let options = HiveOptions {
        index: kind,
        ..Default::default()
    };
    let hive = Hive::create_with(&path, "index-test", options).unwrap();
    (dir, hive)
}

/// The same edit script must behave identically under every index
/// implementation.
#[test]
fn test_variant_parity() {
    for kind in [IndexKind::StringKey, IndexKind::Interned, IndexKind::Numeric] {
        let (_dir, mut hive) = scratch_with(kind);

        let (key, created) = hive.ensure_path(&["Software", "Vendor", "App"]).unwrap();
        assert_eq!(created, 3, "{:?}", kind);

        hive.upsert_value(key, "Version", ValueType::Dword, &3u32.to_le_bytes()).unwrap();
        hive.upsert_value(key, "", ValueType::Dword, &9u32.to_le_bytes()).unwrap();

        assert_eq!(hive.walk_path(&["software", "vendor", "app"]), Some(key));
        assert!(hive.read_value(key, "VERSION").unwrap().is_some());
        assert!(hive.read_value(key, "").unwrap().is_some());

        hive.delete_value(key, "Version").unwrap();
        assert!(hive.read_value(key, "version").unwrap().is_none());
        assert!(hive.read_value(key, "").unwrap().is_some());

        let stats = hive.index_stats();
        assert_eq!(stats.values, 1, "{:?}", kind);
        hive.commit(FlushMode::Auto).unwrap();
    }
}

#[test]
fn test_stats_tags() {
    for (kind, tag) in [
        (IndexKind::StringKey, "string-key"),
        (IndexKind::Interned, "interned"),
        (IndexKind::Numeric, "numeric"),
    ] {
        let index = make_index(kind);
        assert_eq!(index.stats().implementation, tag);
    }
}

#[test]
fn test_reopen_with_each_variant_rebuilds_equivalent_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rebuild.hiv");

    {
        let mut hive = Hive::create(&path, "rebuild").unwrap();
        for name in ["Alpha", "Beta", "Gamma"] {
            let (key, _) = hive.ensure_path(&["Root", name]).unwrap();
            hive.upsert_value(key, "tag", ValueType::Dword, &1u32.to_le_bytes()).unwrap();
        }
        hive.commit(FlushMode::Auto).unwrap();
    }

    let mut reference: Option<Vec<u32>> = None;
    for kind in [IndexKind::StringKey, IndexKind::Interned, IndexKind::Numeric] {
        let options = HiveOptions { index: kind, ..Default::default() };
        let hive = Hive::open_with(&path, options).unwrap();

        let resolved: Vec<u32> = ["Alpha", "Beta", "Gamma"]
            .iter()
            .map(|name| hive.walk_path(&["Root", name]).unwrap())
            .collect();

        let stats = hive.index_stats();
        assert_eq!(stats.values, 3, "{:?}", kind);

        // All variants resolve names to the same cell offsets.
        match &reference {
            None => reference = Some(resolved),
            Some(expected) => assert_eq!(expected, &resolved, "{:?}", kind),
        }
    }
}

/// fnv1a32 over the already-folded names the numeric index hashes.
fn fnv1a32(name: &str) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Birthday-searches a deterministic name space for pairs that collide in
/// fnv1a32, returning `target` names where every name shares its bucket
/// with at least one other.
fn colliding_names(target: usize) -> Vec<String> {
    let name_for = |seed: u32| format!("coll{:08x}", seed.wrapping_mul(0x9E37_79B9));

    // (hash << 32 | seed), sorted, makes colliding seeds adjacent without
    // holding the names themselves.
    let probe = 8_000_000u32;
    let mut keyed: Vec<u64> = (0..probe)
        .map(|seed| (u64::from(fnv1a32(&name_for(seed))) << 32) | u64::from(seed))
        .collect();
    keyed.sort_unstable();

    let mut names = Vec::with_capacity(target);
    let mut i = 0;
    while i + 1 < keyed.len() && names.len() < target {
        let hash = keyed[i] >> 32;
        let mut j = i + 1;
        while j < keyed.len() && keyed[j] >> 32 == hash {
            j += 1;
        }
        if j - i >= 2 {
            for k in i..j {
                if names.len() < target {
                    names.push(name_for(keyed[k] as u32));
                }
            }
        }
        i = j;
    }

    assert!(
        names.len() == target,
        "probe space yielded only {} colliding names",
        names.len()
    );
    names
}

/// Scenario: 10 000 synthetic names engineered to collide in the 32-bit
/// name hash under one parent. All resolve; removing a subset removes
/// only those entries; primaries stay addressable while the collision
/// table holds the rest.
#[test]
fn test_numeric_index_collision_storm() {
    let names = colliding_names(10_000);
    for pair in names.chunks(2) {
        if let [a, b] = pair {
            assert_ne!(a, b);
        }
    }

    let parent = 0x20u32;
    let mut index = NumericIndex::default();
    for (i, name) in names.iter().enumerate() {
        index.add_key(parent, name, i as u32);
    }

    for (i, name) in names.iter().enumerate() {
        assert_eq!(index.get_key(parent, name), Some(i as u32), "{}", name);
    }
    assert_eq!(index.stats().keys, names.len());

    // Remove every third entry; the others (primary or demoted) survive.
    for name in names.iter().step_by(3) {
        index.remove_key(parent, name);
    }
    for (i, name) in names.iter().enumerate() {
        let expected = if i % 3 == 0 { None } else { Some(i as u32) };
        assert_eq!(index.get_key(parent, name), expected, "{}", name);
    }
}

#[test]
fn test_index_footprint_reporting() {
    let (_dir, mut hive) = scratch_with(IndexKind::Interned);

    let before = hive.index_stats();
    for i in 0..100 {
        hive.ensure_path(&["Repeat", &format!("Entry{:03}", i)]).unwrap();
    }
    let after = hive.index_stats();

    assert!(after.approx_bytes > before.approx_bytes);
    // Root entry, "Repeat", and its 100 children.
    assert_eq!(after.keys, 102);
    hive.commit(FlushMode::Auto).unwrap();
}

//! Transaction manager: the dual-sequence REGF crash-consistency protocol.
//!
//! A transaction brackets a batch of mutations. `begin` bumps the primary
//! sequence number so that a crash before `commit` leaves the sequences
//! mismatched, which readers detect at open. `commit` flushes data pages
//! first, then publishes the header (secondary sequence, timestamp,
//! checksum) and flushes it last, so a crash at any point leaves either
//! the old consistent state or the new one.

use crate::dirty::{DirtyRange, FlushMode};
use crate::error::{RegistryError, Result};
use crate::header::{
    BASE_BLOCK_SIZE, CHECKSUM_OFFSET, SEQ_PRIMARY_OFFSET, SEQ_SECONDARY_OFFSET, TIMESTAMP_OFFSET,
};
use crate::hive::{Hive, HiveData};
use crate::utils::{calculate_checksum, filetime_now};
use tracing::{debug, instrument, warn};

impl Hive {
    /// Returns true if a transaction is in flight.
    pub fn in_transaction(&self) -> bool {
        self.in_tx
    }

    /// Begins a transaction. Idempotent: a no-op when one is already in
    /// flight.
    ///
    /// Bumps the primary sequence number and refreshes the header
    /// timestamp, marking the hive dirty. Until `commit`, the on-disk
    /// sequences disagree, which is exactly the torn-transaction marker.
    #[instrument(skip(self))]
    pub fn begin(&mut self) -> Result<()> {
        if self.in_tx {
            return Ok(());
        }
        if !self.is_writable() {
            return Err(RegistryError::ReadOnlyHive);
        }

        let primary = self.base.primary_sequence.wrapping_add(1);
        self.write_u32_at(SEQ_PRIMARY_OFFSET, primary)?;
        self.base.primary_sequence = primary;

        let timestamp = filetime_now();
        self.write_u64_at(TIMESTAMP_OFFSET, timestamp)?;
        self.base.last_written = timestamp;

        // The whole header page participates in the protocol.
        self.dirty.add(0, BASE_BLOCK_SIZE as u64);

        self.in_tx = true;
        debug!(primary, "Transaction begun");
        Ok(())
    }

    /// Commits the in-flight transaction. Idempotent: a no-op when none is
    /// in flight.
    ///
    /// Data pages must reach storage before the header page does; an
    /// interrupted commit then never publishes a header describing
    /// unflushed data.
    #[instrument(skip(self))]
    pub fn commit(&mut self, mode: FlushMode) -> Result<()> {
        if !self.in_tx {
            return Ok(());
        }

        // 1. Data pages first.
        self.flush_data()?;

        // 2. Sequences agree again.
        let primary = self.base.primary_sequence;
        self.write_u32_at(SEQ_SECONDARY_OFFSET, primary)?;
        self.base.secondary_sequence = primary;

        // 3. Fresh timestamp.
        let timestamp = filetime_now();
        self.write_u64_at(TIMESTAMP_OFFSET, timestamp)?;
        self.base.last_written = timestamp;

        // 4. Checksum over the finished header.
        let checksum = calculate_checksum(self.data.as_slice());
        self.write_u32_at(CHECKSUM_OFFSET, checksum)?;
        self.base.checksum = checksum;

        // 5-6. Header page last.
        self.dirty.add(0, BASE_BLOCK_SIZE as u64);
        self.flush_header_and_meta(mode)?;

        self.in_tx = false;
        self.unclean = false;
        debug!(sequence = primary, "Transaction committed");
        Ok(())
    }

    /// Abandons the in-flight transaction without reverting anything.
    ///
    /// The mapped bytes keep the uncommitted cell writes and the on-disk
    /// sequences stay mismatched as the crash marker. The in-memory index
    /// may be ahead of the durable state afterwards; callers are expected
    /// to reopen the hive (rebuilding the index from disk) or to commit a
    /// later transaction over the same in-memory state.
    pub fn rollback(&mut self) {
        if self.in_tx {
            warn!("Transaction rolled back; sequences left mismatched");
        }
        self.in_tx = false;
    }

    /// Memory-syncs all pending non-header dirty ranges, aligned outward
    /// to page boundaries.
    ///
    /// Commit calls this as its first step; calling it directly makes
    /// uncommitted cell writes durable without publishing them.
    pub fn flush_data(&mut self) -> Result<()> {
        let ranges = self.dirty.take_data_ranges();
        if ranges.is_empty() {
            return Ok(());
        }

        let total: u64 = ranges.iter().map(DirtyRange::len).sum();
        debug!(ranges = ranges.len(), bytes = total, "Flushing data pages");

        for range in ranges {
            self.sync_range(range.page_aligned())?;
        }
        Ok(())
    }

    /// Memory-syncs the header page and applies the mode's metadata
    /// durability.
    pub(crate) fn flush_header_and_meta(&mut self, mode: FlushMode) -> Result<()> {
        if let Some(range) = self.dirty.take_header_range() {
            debug!("Flushing header page");
            self.sync_range(range.page_aligned())?;
        }

        match mode {
            FlushMode::DataOnly => {}
            FlushMode::Auto => {
                if let Some(file) = &self.file {
                    file.sync_data()?;
                }
            }
            FlushMode::Full => {
                if let Some(file) = &self.file {
                    file.sync_all()?;
                }
            }
        }
        Ok(())
    }

    /// Issues one memory-sync over a page-aligned range, clamped to the
    /// mapping.
    fn sync_range(&self, range: DirtyRange) -> Result<()> {
        let len = self.data.as_slice().len() as u64;
        let start = range.start.min(len);
        let end = range.end.min(len);
        if start >= end {
            return Ok(());
        }

        match &self.data {
            HiveData::Writable(mmap) => {
                mmap.flush_range(start as usize, (end - start) as usize)?;
                Ok(())
            }
            // In-memory images have nothing to sync.
            HiveData::Owned(_) => Ok(()),
            HiveData::ReadOnly(_) => Err(RegistryError::ReadOnlyHive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::{HiveOptions, RecoveryPolicy};

    #[test]
    fn test_begin_commit_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.hiv");
        let mut hive = Hive::create(&path, "txn").unwrap();

        let before = hive.base_block().primary_sequence;

        hive.begin().unwrap();
        assert!(hive.in_transaction());
        assert_eq!(hive.base_block().primary_sequence, before + 1);
        assert_eq!(hive.base_block().secondary_sequence, before);
        assert!(!hive.base_block().is_consistent());

        hive.commit(FlushMode::Auto).unwrap();
        assert!(!hive.in_transaction());
        assert!(hive.base_block().is_consistent());
        assert_eq!(hive.base_block().secondary_sequence, before + 1);
    }

    #[test]
    fn test_begin_and_commit_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idem.hiv");
        let mut hive = Hive::create(&path, "idem").unwrap();

        let before = hive.base_block().primary_sequence;
        hive.begin().unwrap();
        hive.begin().unwrap();
        assert_eq!(hive.base_block().primary_sequence, before + 1);

        hive.commit(FlushMode::Auto).unwrap();
        hive.commit(FlushMode::Auto).unwrap();
        assert_eq!(hive.base_block().primary_sequence, before + 1);
    }

    #[test]
    fn test_commit_restores_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sum.hiv");
        let mut hive = Hive::create(&path, "sum").unwrap();

        hive.begin().unwrap();
        hive.commit(FlushMode::Full).unwrap();

        let calculated = calculate_checksum(hive.data());
        assert_eq!(hive.base_block().checksum, calculated);
    }

    #[test]
    fn test_rollback_leaves_crash_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rb.hiv");

        {
            let mut hive = Hive::create(&path, "rb").unwrap();
            hive.begin().unwrap();
            hive.flush_data().unwrap();
            hive.rollback();
            assert!(!hive.in_transaction());
        }

        // Default policy refuses a torn hive.
        assert!(matches!(
            Hive::open(&path),
            Err(RegistryError::TornTransaction { .. })
        ));

        // Accepting policy surfaces the marker.
        let options = HiveOptions {
            recovery: RecoveryPolicy::AcceptUnclean,
            ..Default::default()
        };
        let hive = Hive::open_with(&path, options).unwrap();
        assert!(hive.is_unclean());
        assert_eq!(
            hive.base_block().primary_sequence,
            hive.base_block().secondary_sequence + 1
        );
    }
}

//! Transaction-log (.LOG1/.LOG2) recovery.
//!
//! A hive closed mid-write leaves its pending pages in sibling log files.
//! This module parses the HvLE log format, extracts the DIRT dirty-page
//! vectors, and replays them onto a hive image in sequence order so the
//! normal open path can take over. The replayed image gets a fresh header
//! checksum before parsing.

use crate::error::{RegistryError, Result};
use crate::header::{BaseBlock, BASE_BLOCK_SIZE, CHECKSUM_OFFSET};
use crate::hive::Hive;
use crate::utils::{calculate_checksum, read_u32_le, write_u32_le};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// Size of a log page.
const LOG_PAGE_SIZE: usize = 0x1000;

/// Hard cap on the replayed hive size (512 MB). Prevents a corrupted log
/// from forcing an absurd allocation.
const MAX_REPLAYED_SIZE: usize = 512 * 1024 * 1024;

/// Hard cap on how far a single page may extend the hive (16 MB).
const MAX_PAGE_EXTENSION: usize = 16 * 1024 * 1024;

/// Expected signature for a transaction log base block.
const HVLE_SIGNATURE: &[u8; 4] = b"HvLE";

/// Expected signature for a dirty page vector.
const DIRT_SIGNATURE: &[u8; 4] = b"DIRT";

/// One pending page from a transaction log.
#[derive(Debug, Clone)]
pub struct LogPage {
    /// Offset in the hive where this page applies.
    pub offset: u32,

    /// Size of the pending data.
    pub size: u32,

    /// The pending bytes.
    pub data: Vec<u8>,
}

/// A parsed transaction log file.
#[derive(Debug)]
pub struct TransactionLog {
    /// Sequence number of the log.
    pub sequence: u32,

    /// Pending pages to replay onto the base hive.
    pub pages: Vec<LogPage>,
}

impl TransactionLog {
    /// Opens and parses a `.LOG1`/`.LOG2` file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Self::parse(&data)
    }

    /// Parses transaction log bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < LOG_PAGE_SIZE {
            return Err(RegistryError::InvalidFormat(
                "Transaction log too small".to_string(),
            ));
        }

        if &data[0..4] != HVLE_SIGNATURE {
            return Err(RegistryError::invalid_signature(HVLE_SIGNATURE, &data[0..4]));
        }

        let sequence = read_u32_le(data, 0x04)?;

        // Dirty vectors sit on page boundaries past the log header.
        let mut pages = Vec::new();
        let mut offset = LOG_PAGE_SIZE;
        while offset + DIRT_SIGNATURE.len() <= data.len() {
            if &data[offset..offset + 4] == DIRT_SIGNATURE {
                pages.extend(Self::parse_dirty_vector(&data[offset..]));
            }
            offset += LOG_PAGE_SIZE;

            if pages.len() > 10_000 {
                warn!("Transaction log lists more than 10000 pages; stopping scan");
                break;
            }
        }

        debug!(sequence, pages = pages.len(), "Parsed transaction log");
        Ok(Self { sequence, pages })
    }

    /// Parses one DIRT vector. Malformed entries end the vector rather
    /// than failing the log.
    fn parse_dirty_vector(data: &[u8]) -> Vec<LogPage> {
        let Ok(count) = read_u32_le(data, 0x08) else {
            return Vec::new();
        };
        let count = count as usize;
        if count == 0 || count > 1000 {
            return Vec::new();
        }

        let mut pages = Vec::new();
        let mut offset = 0x10;

        for _ in 0..count {
            let (Ok(page_offset), Ok(page_size)) =
                (read_u32_le(data, offset), read_u32_le(data, offset + 4))
            else {
                break;
            };
            offset += 8;

            if page_size == 0 || page_size as usize > LOG_PAGE_SIZE * 16 {
                continue;
            }

            let end = offset + page_size as usize;
            if end > data.len() {
                break;
            }

            pages.push(LogPage {
                offset: page_offset,
                size: page_size,
                data: data[offset..end].to_vec(),
            });
            offset = end;
        }

        pages
    }

    /// Replays this log onto a hive image, returning how many pages were
    /// applied.
    ///
    /// # Errors
    ///
    /// Fails when a page would overflow its offset, exceed the size caps,
    /// or carry fewer bytes than its declared size.
    pub fn replay(&self, hive_data: &mut Vec<u8>) -> Result<usize> {
        let mut applied = 0;

        for (index, page) in self.pages.iter().enumerate() {
            let start = page.offset as usize;
            let end = start
                .checked_add(page.size as usize)
                .ok_or_else(|| {
                    RegistryError::InvalidFormat(format!(
                        "Log page {} offset overflow: {:#x} + {:#x}",
                        index, page.offset, page.size
                    ))
                })?;

            if end > MAX_REPLAYED_SIZE {
                return Err(RegistryError::InvalidFormat(format!(
                    "Log page {} extends hive past the {} byte cap",
                    index, MAX_REPLAYED_SIZE
                )));
            }

            if end > hive_data.len() {
                let extension = end - hive_data.len();
                if extension > MAX_PAGE_EXTENSION {
                    return Err(RegistryError::InvalidFormat(format!(
                        "Log page {} extends hive by {} bytes at once",
                        index, extension
                    )));
                }
                hive_data.resize(end, 0);
            }

            if page.data.len() != page.size as usize {
                return Err(RegistryError::InvalidFormat(format!(
                    "Log page {} data size mismatch: {} != {}",
                    index,
                    page.data.len(),
                    page.size
                )));
            }

            hive_data[start..end].copy_from_slice(&page.data);
            applied += 1;
        }

        Ok(applied)
    }
}

/// Replays any number of logs onto a hive image in sequence order.
pub fn replay_logs(hive_data: &mut Vec<u8>, logs: &[TransactionLog]) -> Result<usize> {
    let mut ordered: Vec<_> = logs.iter().collect();
    ordered.sort_by_key(|log| log.sequence);

    let mut total = 0;
    for log in ordered {
        total += log.replay(hive_data)?;
    }
    Ok(total)
}

impl Hive {
    /// Opens a hive with its transaction logs replayed.
    ///
    /// Missing or invalid logs are skipped. The replayed image lives in
    /// memory; the handle is read-only and the base file is untouched.
    /// Callers who want the recovered state on disk write the image back
    /// themselves and reopen for editing.
    pub fn open_with_logs<P: AsRef<Path>>(
        hive_path: P,
        log1_path: Option<P>,
        log2_path: Option<P>,
    ) -> Result<Self> {
        let mut image = std::fs::read(hive_path)?;

        let mut logs = Vec::new();
        for path in [log1_path, log2_path].into_iter().flatten() {
            match TransactionLog::open(&path) {
                Ok(log) => logs.push(log),
                Err(e) => {
                    warn!(error = %e, "Skipping unusable transaction log");
                }
            }
        }

        let applied = replay_logs(&mut image, &logs)?;
        if applied > 0 {
            info!(pages = applied, "Replayed transaction logs");

            // Replayed pages invalidate the stored checksum; refresh it so
            // the normal open-time verification applies to the new image.
            if image.len() >= BASE_BLOCK_SIZE {
                let checksum = calculate_checksum(&image);
                write_u32_le(&mut image, CHECKSUM_OFFSET, checksum)?;

                // Replay also heals a torn base image: the log carries the
                // committed state, so the sequences are republished as
                // consistent.
                let base = BaseBlock::parse(&image)?;
                if !base.is_consistent() {
                    write_u32_le(
                        &mut image,
                        crate::header::SEQ_SECONDARY_OFFSET,
                        base.primary_sequence,
                    )?;
                    let checksum = calculate_checksum(&image);
                    write_u32_le(&mut image, CHECKSUM_OFFSET, checksum)?;
                }
            }
        }

        Self::from_vec(image)
    }
}

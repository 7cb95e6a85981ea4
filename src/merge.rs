//! Merge-plan application: an ordered batch of key/value operations
//! applied under a single transaction.
//!
//! A plan either commits in full or rolls back at the first error, leaving
//! the on-disk hive in its pre-plan durable state. Conflict handling for
//! existing values is a caller-chosen policy.

use crate::cell::ValueType;
use crate::dirty::FlushMode;
use crate::error::{RegistryError, Result};
use crate::hive::Hive;
use tracing::{debug, info, instrument};

/// One step of a merge plan. Paths are key-name components relative to the
/// hive root.
#[derive(Debug, Clone)]
pub enum MergeOp {
    /// Create the key (and any missing ancestors).
    EnsureKey { path: Vec<String> },

    /// Set a value, creating the key path as needed.
    SetValue {
        path: Vec<String>,
        name: String,
        data_type: ValueType,
        data: Vec<u8>,
    },

    /// Delete a key and its whole subtree. Deleting an absent key is a
    /// no-op.
    DeleteKey { path: Vec<String> },

    /// Delete a single value. Deleting an absent value is a no-op.
    DeleteValue { path: Vec<String>, name: String },
}

/// What to do when `SetValue` meets an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Replace the existing value.
    #[default]
    Overwrite,

    /// Keep the existing value and count the operation as skipped.
    SkipIfExists,

    /// Fail the whole plan.
    ErrorOnConflict,
}

/// Per-plan operation counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MergeStats {
    /// Keys created (including intermediate path components).
    pub keys_created: usize,

    /// Keys deleted (including subtree members).
    pub keys_deleted: usize,

    /// Values written.
    pub values_set: usize,

    /// Values deleted.
    pub values_deleted: usize,

    /// Operations skipped under [`ConflictPolicy::SkipIfExists`].
    pub skipped: usize,
}

impl Hive {
    /// Applies `plan` in order under one transaction.
    ///
    /// On the first failing operation the transaction is rolled back and
    /// the error propagated; on success the transaction is committed with
    /// [`FlushMode::Auto`].
    #[instrument(skip(self, plan), fields(ops = plan.len()))]
    pub fn apply_plan(&mut self, plan: &[MergeOp], policy: ConflictPolicy) -> Result<MergeStats> {
        self.begin()?;

        let mut stats = MergeStats::default();
        for op in plan {
            if let Err(e) = self.apply_op(op, policy, &mut stats) {
                self.rollback();
                return Err(e);
            }
        }

        self.commit(FlushMode::Auto)?;
        info!(
            keys_created = stats.keys_created,
            keys_deleted = stats.keys_deleted,
            values_set = stats.values_set,
            values_deleted = stats.values_deleted,
            skipped = stats.skipped,
            "Merge plan applied"
        );
        Ok(stats)
    }

    fn apply_op(
        &mut self,
        op: &MergeOp,
        policy: ConflictPolicy,
        stats: &mut MergeStats,
    ) -> Result<()> {
        match op {
            MergeOp::EnsureKey { path } => {
                let components = Self::as_components(path);
                let (_, created) = self.ensure_path(&components)?;
                stats.keys_created += created;
            }

            MergeOp::SetValue {
                path,
                name,
                data_type,
                data,
            } => {
                let components = Self::as_components(path);
                let (key, created) = self.ensure_path(&components)?;
                stats.keys_created += created;

                if self.read_value(key, name)?.is_some() {
                    match policy {
                        ConflictPolicy::Overwrite => {}
                        ConflictPolicy::SkipIfExists => {
                            debug!(name, "Existing value kept per policy");
                            stats.skipped += 1;
                            return Ok(());
                        }
                        ConflictPolicy::ErrorOnConflict => {
                            return Err(RegistryError::Conflict(format!(
                                "Value '{}' already exists at /{}",
                                name,
                                path.join("/")
                            )));
                        }
                    }
                }

                self.upsert_value(key, name, *data_type, data)?;
                stats.values_set += 1;
            }

            MergeOp::DeleteKey { path } => {
                let Some((leaf, parent_path)) = path.split_last() else {
                    return Err(RegistryError::Conflict(
                        "Refusing to delete the root key".to_string(),
                    ));
                };

                let parent_components = Self::as_components(parent_path);
                let Some(parent) = self.walk_path(&parent_components) else {
                    debug!(path = %path.join("/"), "Key already absent");
                    return Ok(());
                };

                stats.keys_deleted += self.delete_tree(parent, leaf)?;
            }

            MergeOp::DeleteValue { path, name } => {
                let components = Self::as_components(path);
                let Some(key) = self.walk_path(&components) else {
                    debug!(path = %path.join("/"), "Key already absent");
                    return Ok(());
                };

                if self.read_value(key, name)?.is_some() {
                    self.delete_value(key, name)?;
                    stats.values_deleted += 1;
                }
            }
        }

        Ok(())
    }

    /// Deletes the named subkey of `parent` and its whole subtree,
    /// children first. Returns how many keys were deleted.
    fn delete_tree(&mut self, parent: u32, name: &str) -> Result<usize> {
        let Some(child) = self.index.get_key(parent, name) else {
            return Ok(0);
        };

        let mut deleted = 0;
        for subkey in self.subkey_names(child)? {
            deleted += self.delete_tree(child, &subkey)?;
        }

        self.delete_key(parent, name)?;
        Ok(deleted + 1)
    }

    fn as_components(path: &[String]) -> Vec<&str> {
        path.iter().map(String::as_str).collect()
    }
}

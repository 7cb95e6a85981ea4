//! # Windows Registry Hive Editor
//!
//! A read/write manipulation library for Windows registry hive files in
//! the REGF format, built on memory-mapped I/O.
//!
//! ## Features
//!
//! - **In-place editing**: create keys, set and delete values, delete
//!   keys, all directly against the mapped hive file
//! - **Crash consistency**: the REGF dual-sequence protocol with ordered
//!   data-then-header flushing; an interrupted commit is detectable at the
//!   next open
//! - **Cell allocator**: free-list allocation with splitting, coalescing,
//!   and bin growth
//! - **O(1) navigation**: an in-memory `(parent, name)` index built by a
//!   bitmap-deduplicated traversal of the cell graph
//! - **Merge plans**: ordered operation batches applied under a single
//!   transaction with conflict policies
//! - **Log recovery**: replay of `.LOG1`/`.LOG2` transaction logs
//!
//! ## Architecture
//!
//! The editor is built on several layers:
//!
//! 1. **Base Block (Header)**: hive metadata, root key offset, and the
//!    primary/secondary sequence numbers
//! 2. **Hive Bins (hbin)**: 4KB-aligned blocks containing cells
//! 3. **Cells**: variable-sized slots (keys, values, lists, data) managed
//!    by the arena allocator
//! 4. **Structural index**: `(parent-offset, lowercased-name)` maps for
//!    keys and values, rebuilt on open and maintained by every edit
//! 5. **Transactions**: a dirty-range tracker plus the dual-sequence
//!    commit protocol
//!
//! ## Binary Layout
//!
//! Registry hives follow this structure:
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Sequence numbers, timestamps, root offset
//!   - Checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Security descriptors (sk)
//!       - Big data (db)
//! ```
//!
//! ## Examples
//!
//! ### Editing a hive
//!
//! ```no_run
//! use reg_editor::{FlushMode, Hive, ValueType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = Hive::open("SOFTWARE")?;
//!
//! hive.begin()?;
//! let (key, _created) = hive.ensure_path(&["Vendor", "Product", "1.0"])?;
//! hive.upsert_value(key, "InstallPath", ValueType::String,
//!     "C:\\Program Files\\Product\0".encode_utf16()
//!         .flat_map(u16::to_le_bytes).collect::<Vec<_>>().as_slice())?;
//! hive.commit(FlushMode::Auto)?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Applying a merge plan
//!
//! ```no_run
//! use reg_editor::{ConflictPolicy, Hive, MergeOp, ValueType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = Hive::open("SOFTWARE")?;
//! let plan = vec![
//!     MergeOp::EnsureKey { path: vec!["Vendor".into(), "Product".into()] },
//!     MergeOp::SetValue {
//!         path: vec!["Vendor".into(), "Product".into()],
//!         name: "EstimatedSize".into(),
//!         data_type: ValueType::Dword,
//!         data: 4096u32.to_le_bytes().to_vec(),
//!     },
//! ];
//! let stats = hive.apply_plan(&plan, ConflictPolicy::Overwrite)?;
//! println!("created {} keys", stats.keys_created);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod bigdata;
pub mod cell;
pub mod dirty;
pub mod editor;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod index;
pub mod key;
pub mod merge;
pub mod recovery;
pub mod security;
pub mod subkey_list;
pub mod txn;
pub mod utils;
pub mod value;
pub mod walker;

// Re-export main types for convenience
pub use cell::{CellType, KeyNodeFlags, ValueType};
pub use dirty::{DirtyRange, DirtyTracker, FlushMode};
pub use error::{RegistryError, Result};
pub use hbin::HbinHeader;
pub use header::BaseBlock;
pub use hive::{Hive, HiveOptions, RecoveryPolicy};
pub use index::{IndexKind, IndexStats, StructuralIndex};
pub use key::KeyNode;
pub use merge::{ConflictPolicy, MergeOp, MergeStats};
pub use recovery::{LogPage, TransactionLog};
pub use security::SecurityCell;
pub use subkey_list::{SubkeyList, SubkeyListEntry, SubkeyListType};
pub use value::{ValueData, ValueKey};
pub use walker::{CancelToken, CellCensus, CellPurpose, WalkStats, Walker};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Stashmap Core — Persistent Disk-Backed Key/Value Map
//!
//! A durable map for keys and values that outgrow memory. Keys are enumerated
//! to stable integer ids by an append-only index; values live in an
//! append-only chunked log addressed by file offset.
//!
//! # Architecture
//!
//! - **Key index**: key -> id enumeration with a per-id address slot
//! - **Value log**: append-only chunks; incremental appends chain onto the
//!   previous chunk and merge lazily on read
//! - **Append cache**: write-back buffers so appends do not hit disk per call
//! - **Compaction**: stop-the-world rewrite of live values once garbage
//!   counters say it pays off
//!
//! # Concurrency
//!
//! One coarse lock guards all storage state. The map handle is `Send + Sync`
//! and operations serialize; there are no background threads.

pub mod addr;
pub mod append_cache;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod counters;
pub mod error;
pub mod key_index;
pub mod low_memory;
pub mod platform_durability;
pub mod store;
pub mod vlog;

// Re-export key types for convenience
pub use addr::ValueRef;
pub use codec::{KeyDescriptor, RawBytesCodec, Utf8Codec, ValueExternalizer};
pub use compaction::{CompactionInputs, CompactionStats};
pub use config::StoreConfig;
pub use counters::LiveGarbageCounter;
pub use error::{StoreError, StoreResult};
pub use low_memory::{MemoryPressureSource, MemoryPressureSubscription};
pub use store::{delete_files_starting_with, PersistentMap};

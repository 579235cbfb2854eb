//! Absolute main storage, storage keys and prefixing.
//!
//! Main storage is one flat big-endian byte slab shared by every CPU in the
//! configuration. Bytes are `AtomicU8` so that concurrently executing CPU
//! threads can reach storage through a shared reference; reference/change
//! bit maintenance is a relaxed `fetch_or`, which makes the loose
//! architectural update rule ("set-only, any order") race-safe by
//! construction. Interlocked-update ordering is the caller's business — the
//! system block's main-storage lock covers CS/CDS-class sequences.

mod prefix;
mod storage;

pub use prefix::{apply_prefixing, reverse_prefixing};
pub use storage::MainStorage;

/// Storage key: four access-control bits.
pub const STORKEY_KEY: u8 = 0xF0;
/// Storage key: fetch-protect bit.
pub const STORKEY_FETCH: u8 = 0x08;
/// Storage key: reference bit.
pub const STORKEY_REF: u8 = 0x04;
/// Storage key: change bit.
pub const STORKEY_CHANGE: u8 = 0x02;
/// Storage key: unusable-frame bit (set by Test Block on a bad frame).
pub const STORKEY_BADFRM: u8 = 0x01;

/// Bytes covered by one storage key.
pub const KEY_FRAME_SIZE: u64 = 2048;

/// Size of the prefix area swapped by prefixing.
pub const PREFIX_FRAME_SIZE: u64 = 4096;

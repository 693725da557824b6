//! Read-mostly concurrent map using kovan memory reclamation
//!
//! [`SyncMap`] splits its contents between an immutable read snapshot, reached
//! without locks, and a mutex-guarded write buffer holding keys added since
//! the snapshot was published. Lookups that fall through to the buffer are
//! counted; once they add up to the buffer's size, the buffer is published as
//! the next snapshot.
//!
//! It suits two workloads well: keys written once and read many times, and
//! threads working on disjoint sets of keys. For balanced read/write traffic
//! on shared keys a sharded map is usually the better fit.
//!
//! # Features
//!
//! - **Lock-Free Reads**: Keys in the snapshot are read, updated and deleted without locks
//! - **Safe Memory Reclamation**: Replaced values and snapshots are freed through kovan
//! - **Atomic Primitives**: Swap, load-or-store, compare-and-swap and compare-and-delete
//! - **Flexible Hashing**: Support for custom hash builders, `foldhash` by default
//! - **Serde**: Optional `serde` feature for (de)serializing as a map
//!
//! # Example
//!
//! ```rust
//! use kovan_syncmap::SyncMap;
//!
//! let map = SyncMap::new();
//!
//! map.put("a", 1);
//! map.put("b", 2);
//! assert_eq!(map.swap("a", 10), Some(1));
//! map.delete("b");
//!
//! let mut seen = Vec::new();
//! map.range(|key, value| {
//!     seen.push((*key, *value));
//!     true
//! });
//! assert_eq!(seen, vec![("a", 10)]);
//! ```

#![warn(missing_docs)]

mod error;
mod map;
#[cfg(feature = "serde")]
mod serde_impl;
mod slot;
mod snapshot;

pub use error::OccupiedError;
pub use map::SyncMap;

/// Hash builder used by [`SyncMap`] unless another one is supplied.
pub use foldhash::fast::RandomState;

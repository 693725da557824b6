use crate::slot::Slot;
use kovan::RetiredNode;
use std::collections::HashMap;
use std::sync::Arc;

/// Key to slot table shared by snapshots and the write buffer.
///
/// A key present in both points at the same [`Slot`], so a store through
/// either one is visible through the other.
pub(crate) type Table<K, V, S> = HashMap<K, Arc<Slot<V>>, S>;

/// Immutable view of the map that readers use without locking.
///
/// # Safety Layout
///
/// `RetiredNode` **must** be the first field. Snapshots are swapped out of
/// the map's root pointer and handed to kovan's `retire`.
#[repr(C)]
pub(crate) struct Snapshot<K, V, S> {
    _retired: RetiredNode,
    pub(crate) table: Arc<Table<K, V, S>>,
    /// The write buffer holds at least one key missing from `table`.
    pub(crate) amended: bool,
}

impl<K, V, S> Snapshot<K, V, S> {
    pub(crate) fn boxed(table: Arc<Table<K, V, S>>, amended: bool) -> *mut Self {
        Box::into_raw(Box::new(Self {
            _retired: RetiredNode::new(),
            table,
            amended,
        }))
    }
}

//! Per-key value cell.
//!
//! A [`Slot`] holds one key's current value behind a kovan [`Atomic`]. Besides
//! pointing at a live [`ValueNode`], the pointer can sit in two sentinel states:
//!
//! - **absent** (null): the key was deleted. If a write buffer exists, it still
//!   maps the key to this slot.
//! - **expunged** (`EXPUNGED_TAG`): the key was deleted *and* the current write
//!   buffer was built without it. Only a writer holding the buffer lock may
//!   bring the slot back, after registering it in the buffer again.
//!
//! Values are never mutated in place. Every store installs a fresh node and the
//! displaced one is handed to kovan for reclamation.
//!
//! Every pointer that gets dereferenced here comes from [`Atomic::load`], which
//! keeps this thread's era in step with the nodes it reads.

use core::marker::PhantomData;
use core::mem::align_of;
use core::ptr;
use core::sync::atomic::Ordering;
use kovan::{Atomic, Guard, RetiredNode, Shared, pin, retire};

/// Address marking an expunged slot. Never dereferenced.
const EXPUNGED_TAG: usize = 1;

/// Heap cell for one stored value.
///
/// `RetiredNode` **must** stay the first field: kovan casts retired pointers
/// to `*mut RetiredNode`.
#[repr(C)]
pub(crate) struct ValueNode<V> {
    _retired: RetiredNode,
    value: V,
}

impl<V> ValueNode<V> {
    pub(crate) fn boxed(value: V) -> Box<Self> {
        // Real nodes can never sit at the expunged tag address.
        const { assert!(align_of::<ValueNode<V>>() > EXPUNGED_TAG) };
        Box::new(Self {
            _retired: RetiredNode::new(),
            value,
        })
    }

    fn into_value(self: Box<Self>) -> V {
        self.value
    }
}

#[inline(always)]
fn expunged<V>() -> *mut ValueNode<V> {
    ptr::without_provenance_mut(EXPUNGED_TAG)
}

#[inline(always)]
fn is_live<V>(node: *mut ValueNode<V>) -> bool {
    !node.is_null() && node != expunged()
}

#[inline(always)]
fn tagged<'g, V>(node: *mut ValueNode<V>) -> Shared<'g, ValueNode<V>> {
    // SAFETY: `Shared` is a plain pointer wrapper; every dereference below
    // checks `is_live` first.
    unsafe { Shared::from_raw(node) }
}

/// Reads the value behind a loaded pointer.
///
/// # Safety
///
/// `current` must come from `Atomic::load` on a slot, under the guard whose
/// lifetime it carries.
#[inline(always)]
unsafe fn value_of<'g, V>(current: Shared<'g, ValueNode<V>>) -> Option<&'g V> {
    let node = current.as_raw();
    if is_live(node) {
        // SAFETY: live nodes are only reclaimed through `retire`, which waits
        // for the guard that loaded them.
        Some(unsafe { &(*node).value })
    } else {
        None
    }
}

/// Result of offering a value to a slot that may already hold one.
pub(crate) enum Claim<'g, V> {
    /// The slot already held `existing`; the offered value comes back.
    Loaded { existing: &'g V, rejected: V },
    /// The offered value now lives in the slot.
    Stored(&'g V),
}

/// A value unlinked from its slot by this thread.
///
/// The node is retired when this is dropped, so read what you need first.
pub(crate) struct Displaced<'g, V: 'static> {
    node: *mut ValueNode<V>,
    _guard: PhantomData<&'g Guard>,
}

impl<'g, V: 'static> Displaced<'g, V> {
    fn new(previous: Shared<'g, ValueNode<V>>) -> Option<Self> {
        let node = previous.as_raw();
        debug_assert!(node != expunged(), "displaced an expunged marker");
        // A null previous pointer means nothing was displaced.
        if is_live(node) {
            Some(Self {
                node,
                _guard: PhantomData,
            })
        } else {
            None
        }
    }

    pub(crate) fn value(&self) -> &V {
        // SAFETY: only this thread unlinked the node and it is not retired yet.
        unsafe { &(*self.node).value }
    }
}

impl<V: 'static> Drop for Displaced<'_, V> {
    fn drop(&mut self) {
        // SAFETY: `ValueNode` is `repr(C)` with `RetiredNode` first, and the
        // node is unreachable from its slot. Retired exactly once, here.
        unsafe { retire(self.node) };
    }
}

/// Atomic indirection cell for one key.
pub(crate) struct Slot<V> {
    value: Atomic<ValueNode<V>>,
}

impl<V> Slot<V> {
    pub(crate) fn new(node: Box<ValueNode<V>>) -> Self {
        Self {
            value: Atomic::new(Box::into_raw(node)),
        }
    }

    /// A slot with no value, ready for a first `try_load_or_store`.
    pub(crate) fn empty() -> Self {
        Self {
            value: Atomic::null(),
        }
    }
}

impl<V: 'static> Slot<V> {
    /// Current value, if the slot is neither absent nor expunged.
    #[inline]
    pub(crate) fn load<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        let current = self.value.load(Ordering::Acquire, guard);
        // SAFETY: loaded under `guard`.
        unsafe { value_of(current) }
    }

    /// Installs `node` unless the slot is expunged.
    ///
    /// On an expunged slot the node comes back untouched so the caller can
    /// retry under the buffer lock.
    pub(crate) fn try_swap<'g>(
        &self,
        node: Box<ValueNode<V>>,
        guard: &'g Guard,
    ) -> Result<Option<Displaced<'g, V>>, Box<ValueNode<V>>> {
        let new = Box::into_raw(node);
        let mut current = self.value.load(Ordering::Acquire, guard);
        loop {
            if current.as_raw() == expunged() {
                // SAFETY: `new` was never published.
                return Err(unsafe { Box::from_raw(new) });
            }
            match self.value.compare_exchange(
                current,
                tagged(new),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(previous) => return Ok(Displaced::new(previous)),
                Err(_) => current = self.value.load(Ordering::Acquire, guard),
            }
        }
    }

    /// Installs `node` unconditionally.
    ///
    /// The caller holds the buffer lock and has already unexpunged the slot.
    pub(crate) fn swap_locked<'g>(
        &self,
        node: Box<ValueNode<V>>,
        guard: &'g Guard,
    ) -> Option<Displaced<'g, V>> {
        let previous = self
            .value
            .swap(tagged(Box::into_raw(node)), Ordering::AcqRel, guard);
        Displaced::new(previous)
    }

    /// Moves an expunged slot back to absent.
    ///
    /// Returns `true` if the slot was expunged, in which case the caller must
    /// register it in the write buffer before releasing the lock.
    pub(crate) fn unexpunge_locked(&self, guard: &Guard) -> bool {
        self.value
            .compare_exchange(
                tagged(expunged()),
                tagged(ptr::null_mut()),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }

    /// Marks an absent slot as expunged.
    ///
    /// Returns `true` if the slot is expunged afterwards, meaning it must be
    /// left out of the write buffer being built.
    pub(crate) fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut current = self.value.load(Ordering::Acquire, guard);
        while current.is_null() {
            match self.value.compare_exchange(
                current,
                tagged(expunged()),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(_) => current = self.value.load(Ordering::Acquire, guard),
            }
        }
        current.as_raw() == expunged()
    }

    /// Loads the current value or stores `value` into an absent slot.
    ///
    /// Hands `value` back as `Err` if the slot is expunged.
    pub(crate) fn try_load_or_store<'g>(
        &self,
        value: V,
        guard: &'g Guard,
    ) -> Result<Claim<'g, V>, V> {
        let current = self.value.load(Ordering::Acquire, guard);
        if current.as_raw() == expunged() {
            return Err(value);
        }
        // SAFETY: loaded under `guard`.
        if let Some(existing) = unsafe { value_of(current) } {
            return Ok(Claim::Loaded {
                existing,
                rejected: value,
            });
        }

        let new = Box::into_raw(ValueNode::boxed(value));
        // Reload after allocating: the era this load records covers `new`, so
        // the reference handed out below survives a concurrent retire.
        let mut current = self.value.load(Ordering::Acquire, guard);
        loop {
            if !current.is_null() {
                // SAFETY: `new` was never published.
                let value = unsafe { Box::from_raw(new) }.into_value();
                // SAFETY: loaded under `guard`.
                return match unsafe { value_of(current) } {
                    Some(existing) => Ok(Claim::Loaded {
                        existing,
                        rejected: value,
                    }),
                    None => Err(value),
                };
            }
            match self.value.compare_exchange(
                current,
                tagged(new),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                // SAFETY: `new` is published and can only be reclaimed through
                // `retire`, which respects this guard.
                Ok(_) => return Ok(Claim::Stored(unsafe { &(*new).value })),
                Err(_) => current = self.value.load(Ordering::Acquire, guard),
            }
        }
    }

    /// [`try_load_or_store`](Self::try_load_or_store) for callers holding
    /// the buffer lock, where the slot cannot be expunged.
    pub(crate) fn load_or_store_locked<'g>(&self, mut value: V, guard: &'g Guard) -> Claim<'g, V> {
        loop {
            match self.try_load_or_store(value, guard) {
                Ok(claim) => return claim,
                Err(rejected) => {
                    // Expunging needs the buffer lock, which the caller holds.
                    // Should it happen anyway, revive the slot and store again.
                    self.unexpunge_locked(guard);
                    value = rejected;
                }
            }
        }
    }

    /// Swaps the value to absent, handing back the previous one.
    pub(crate) fn delete<'g>(&self, guard: &'g Guard) -> Option<Displaced<'g, V>> {
        let mut current = self.value.load(Ordering::Acquire, guard);
        while is_live(current.as_raw()) {
            match self.value.compare_exchange(
                current,
                tagged(ptr::null_mut()),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(previous) => return Displaced::new(previous),
                Err(_) => current = self.value.load(Ordering::Acquire, guard),
            }
        }
        None
    }

    /// Replaces the value with `new` if it currently equals `old`.
    ///
    /// Retries while concurrent writers keep installing values equal to `old`.
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);
        // SAFETY: loaded under `guard`.
        if unsafe { value_of(current) } != Some(old) {
            return false;
        }

        let new = Box::into_raw(ValueNode::boxed(new));
        loop {
            match self.value.compare_exchange(
                current,
                tagged(new),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(previous) => {
                    drop(Displaced::new(previous));
                    return true;
                }
                Err(_) => {
                    current = self.value.load(Ordering::Acquire, guard);
                    // SAFETY: loaded under `guard`.
                    if unsafe { value_of(current) } != Some(old) {
                        // SAFETY: `new` was never published.
                        drop(unsafe { Box::from_raw(new) });
                        return false;
                    }
                }
            }
        }
    }

    /// Swaps the value to absent if it currently equals `old`.
    pub(crate) fn try_compare_and_delete(&self, old: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);
        // SAFETY: loaded under `guard`, on every iteration.
        while unsafe { value_of(current) } == Some(old) {
            match self.value.compare_exchange(
                current,
                tagged(ptr::null_mut()),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(previous) => {
                    drop(Displaced::new(previous));
                    return true;
                }
                Err(_) => current = self.value.load(Ordering::Acquire, guard),
            }
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn is_expunged(&self, guard: &Guard) -> bool {
        self.value.load(Ordering::Acquire, guard).as_raw() == expunged()
    }
}

// SAFETY: the cell only hands out shared references to `V` and moves values
// between threads through kovan.
unsafe impl<V: Send + Sync> Send for Slot<V> {}
unsafe impl<V: Send + Sync> Sync for Slot<V> {}

impl<V> Drop for Slot<V> {
    fn drop(&mut self) {
        // The last owner of a slot is a reclaimed snapshot, a discarded write
        // buffer, or a thread done reading through it; nobody else can still
        // reach the current node.
        let guard = pin();
        let node = self.value.load(Ordering::Relaxed, &guard).as_raw();
        if is_live(node) {
            // SAFETY: allocated by `ValueNode::boxed` and never retired while
            // still installed.
            drop(unsafe { Box::from_raw(node) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn slot(value: u64) -> Slot<u64> {
        Slot::new(ValueNode::boxed(value))
    }

    #[test]
    fn test_load_live_value() {
        let slot = slot(7);
        let guard = pin();
        assert_eq!(slot.load(&guard), Some(&7));
        assert_eq!(Slot::<u64>::empty().load(&guard), None);
    }

    #[test]
    fn test_delete_then_expunge() {
        let slot = slot(7);
        let guard = pin();

        assert!(!slot.try_expunge_locked(&guard), "live slots stay");
        let previous = slot.delete(&guard).map(|old| *old.value());
        assert_eq!(previous, Some(7));
        assert!(slot.delete(&guard).is_none());

        assert!(slot.try_expunge_locked(&guard));
        assert!(slot.is_expunged(&guard));
        assert_eq!(slot.load(&guard), None);
        // Expunging twice reports the same state.
        assert!(slot.try_expunge_locked(&guard));
    }

    #[test]
    fn test_try_swap_refuses_expunged_slot() {
        let slot = Slot::<u64>::empty();
        let guard = pin();
        assert!(slot.try_expunge_locked(&guard));

        let node = match slot.try_swap(ValueNode::boxed(9), &guard) {
            Err(node) => node,
            Ok(_) => panic!("stored into an expunged slot"),
        };
        assert_eq!(node.into_value(), 9);

        assert!(slot.unexpunge_locked(&guard));
        assert!(!slot.unexpunge_locked(&guard));
        assert!(slot.swap_locked(ValueNode::boxed(9), &guard).is_none());
        assert_eq!(slot.load(&guard), Some(&9));
    }

    #[test]
    fn test_swap_into_absent_slot() {
        let slot = slot(1);
        let guard = pin();
        drop(slot.delete(&guard));

        match slot.try_swap(ValueNode::boxed(2), &guard) {
            Ok(previous) => assert!(previous.is_none()),
            Err(_) => panic!("absent slot refused a swap"),
        }
        assert_eq!(slot.load(&guard), Some(&2));

        drop(slot.delete(&guard));
        assert!(slot.swap_locked(ValueNode::boxed(3), &guard).is_none());
        assert_eq!(slot.load(&guard), Some(&3));
    }

    #[test]
    fn test_try_swap_returns_previous() {
        let slot = slot(1);
        let guard = pin();

        let previous = match slot.try_swap(ValueNode::boxed(2), &guard) {
            Ok(previous) => previous.map(|old| *old.value()),
            Err(_) => panic!("live slot refused a swap"),
        };
        assert_eq!(previous, Some(1));
        assert_eq!(slot.load(&guard), Some(&2));
    }

    #[test]
    fn test_load_or_store() {
        let slot = Slot::empty();
        let guard = pin();

        match slot.try_load_or_store(String::from("first"), &guard) {
            Ok(Claim::Stored(stored)) => assert_eq!(stored, "first"),
            _ => panic!("absent slot did not store"),
        }
        match slot.try_load_or_store(String::from("second"), &guard) {
            Ok(Claim::Loaded { existing, rejected }) => {
                assert_eq!(existing, "first");
                assert_eq!(rejected, "second");
            }
            _ => panic!("populated slot did not load"),
        }

        drop(slot.delete(&guard));
        assert!(slot.try_expunge_locked(&guard));
        match slot.try_load_or_store(String::from("third"), &guard) {
            Err(value) => assert_eq!(value, "third"),
            Ok(_) => panic!("expunged slot accepted a value"),
        }
    }

    #[test]
    fn test_compare_and_swap() {
        let slot = slot(10);
        let guard = pin();

        assert!(!slot.try_compare_and_swap(&11, 12, &guard));
        assert!(slot.try_compare_and_swap(&10, 12, &guard));
        assert_eq!(slot.load(&guard), Some(&12));

        drop(slot.delete(&guard));
        assert!(!slot.try_compare_and_swap(&12, 13, &guard));
        assert_eq!(slot.load(&guard), None);
    }

    #[test]
    fn test_compare_and_delete() {
        let slot = slot(10);
        let guard = pin();

        assert!(!slot.try_compare_and_delete(&11, &guard));
        assert!(slot.try_compare_and_delete(&10, &guard));
        assert_eq!(slot.load(&guard), None);
        assert!(!slot.try_compare_and_delete(&10, &guard));
    }

    #[test]
    fn test_load_or_store_locked_fills_absent_slot() {
        let slot = Slot::empty();
        let guard = pin();

        match slot.load_or_store_locked(5u64, &guard) {
            Claim::Stored(stored) => assert_eq!(*stored, 5),
            Claim::Loaded { .. } => panic!("absent slot did not store"),
        }
        match slot.load_or_store_locked(6, &guard) {
            Claim::Loaded { existing, rejected } => {
                assert_eq!(*existing, 5);
                assert_eq!(rejected, 6);
            }
            Claim::Stored(_) => panic!("populated slot stored again"),
        }

        let expunged = Slot::empty();
        assert!(expunged.try_expunge_locked(&guard));
        match expunged.load_or_store_locked(7u64, &guard) {
            Claim::Stored(stored) => assert_eq!(*stored, 7),
            Claim::Loaded { .. } => panic!("expunged slot did not store"),
        }
        assert!(!expunged.is_expunged(&guard));
    }

    #[test]
    fn test_drop_frees_live_value() {
        let tracker = Arc::new(());
        drop(Slot::new(ValueNode::boxed(Arc::clone(&tracker))));
        assert_eq!(Arc::strong_count(&tracker), 1);

        // Absent and expunged slots hold nothing to free.
        let slot = Slot::<Arc<()>>::empty();
        let guard = pin();
        assert!(slot.try_expunge_locked(&guard));
        drop(guard);
        drop(slot);
    }
}

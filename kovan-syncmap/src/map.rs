use crate::error::OccupiedError;
use crate::slot::{Claim, Displaced, Slot, ValueNode};
use crate::snapshot::{Snapshot, Table};
use foldhash::fast::RandomState;
use kovan::{Atomic, Guard, Shared, pin, retire};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::trace;

/// A concurrent map tuned for read-mostly workloads.
///
/// Reads of keys that are already in the published snapshot take no lock.
/// New keys go to a mutex-guarded write buffer; once enough lookups have had
/// to fall back to that buffer, it becomes the next snapshot.
///
/// Values are returned as clones. Store cheap handles such as `Arc<T>` for
/// large values.
///
/// # Examples
///
/// ```rust
/// use kovan_syncmap::SyncMap;
///
/// let map = SyncMap::new();
/// map.put("a", 1);
/// assert_eq!(map.swap("a", 10), Some(1));
/// assert_eq!(map.get("a"), Some(10));
///
/// let (value, loaded) = map.load_or_store("b", 2);
/// assert_eq!((value, loaded), (2, false));
/// ```
pub struct SyncMap<K, V, S = RandomState> {
    read: Atomic<Snapshot<K, V, S>>,
    buffer: Mutex<WriteBuffer<K, V, S>>,
    hasher: S,
    /// Minimum capacity of a freshly built write buffer.
    capacity: usize,
}

struct WriteBuffer<K, V, S> {
    /// Superset of the live snapshot keys plus keys added since the last
    /// promotion. Slots expunged from the snapshot are left out.
    dirty: Option<Table<K, V, S>>,
    /// Lookups that had to take the lock since the last promotion.
    misses: usize,
}

/// A slot found by a lookup.
///
/// Slots that exist only in the write buffer can be dropped as soon as the
/// lock is released, so those are held by `Arc` for as long as a value
/// borrowed from them is in use.
enum SlotRef<'g, V> {
    Published(&'g Slot<V>),
    Buffered(Arc<Slot<V>>),
}

impl<V> Deref for SlotRef<'_, V> {
    type Target = Slot<V>;

    fn deref(&self) -> &Slot<V> {
        match self {
            SlotRef::Published(slot) => slot,
            SlotRef::Buffered(slot) => slot,
        }
    }
}

impl<K, V> SyncMap<K, V, RandomState> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(0, RandomState::default())
    }

    /// Creates an empty map whose write buffer starts with room for at least
    /// `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::default())
    }
}

impl<K, V, S: Clone> SyncMap<K, V, S> {
    /// Creates an empty map using `hasher` for every table it builds.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Creates an empty map with the given write buffer capacity and hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let table = Arc::new(HashMap::with_hasher(hasher.clone()));
        Self {
            read: Atomic::new(Snapshot::boxed(table, false)),
            buffer: Mutex::new(WriteBuffer {
                dirty: None,
                misses: 0,
            }),
            hasher,
            capacity,
        }
    }

    /// Returns the map's hasher.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Returns a clone of the value stored for `key`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// map.put(String::from("key"), 1);
    /// assert_eq!(map.get("key"), Some(1));
    /// assert_eq!(map.get("other"), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = pin();
        let slot = self.find(key, &guard, |dirty| dirty.get(key).cloned())?;
        slot.load(&guard).cloned()
    }

    /// Returns `true` if the map holds a value for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = pin();
        self.find(key, &guard, |dirty| dirty.get(key).cloned())
            .is_some_and(|slot| slot.load(&guard).is_some())
    }

    /// Sets the value for `key`.
    pub fn put(&self, key: K, value: V) {
        let guard = pin();
        drop(self.store(key, ValueNode::boxed(value), &guard));
    }

    /// Sets the value for `key` and returns the value it replaced.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// assert_eq!(map.swap(1, "one"), None);
    /// assert_eq!(map.swap(1, "uno"), Some("one"));
    /// ```
    pub fn swap(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = pin();
        self.store(key, ValueNode::boxed(value), &guard)
            .map(|previous| previous.value().clone())
    }

    /// Returns the existing value for `key` if there is one; otherwise stores
    /// `value` and returns it.
    ///
    /// The flag is `true` when the value was loaded and `false` when it was
    /// stored. Racing callers on an absent key agree on a single winner.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool)
    where
        V: Clone,
    {
        let guard = pin();
        let (_slot, claim) = self.claim(key, value, &guard);
        match claim {
            Claim::Loaded { existing, .. } => (existing.clone(), true),
            Claim::Stored(stored) => (stored.clone(), false),
        }
    }

    /// Stores `value` only if `key` has no value.
    ///
    /// # Errors
    ///
    /// Returns [`OccupiedError`] carrying both the existing and the rejected
    /// value when `key` is already present.
    pub fn try_insert(&self, key: K, value: V) -> Result<(), OccupiedError<V>>
    where
        V: Clone,
    {
        let guard = pin();
        let (_slot, claim) = self.claim(key, value, &guard);
        match claim {
            Claim::Stored(_) => Ok(()),
            Claim::Loaded { existing, rejected } => Err(OccupiedError {
                existing: existing.clone(),
                rejected,
            }),
        }
    }

    /// Returns the value for `key`, computing and storing it first if absent.
    ///
    /// `make` runs only when the key looks absent. When several threads race,
    /// each may compute a value but all of them return the one that won.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
        V: Clone,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        self.load_or_store(key, make()).0
    }

    /// Deletes the value for `key`.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = pin();
        if let Some(slot) = self.find(key, &guard, |dirty| dirty.remove(key)) {
            drop(slot.delete(&guard));
        }
    }

    /// Deletes the value for `key` and returns it.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = pin();
        let slot = self.find(key, &guard, |dirty| dirty.remove(key))?;
        slot.delete(&guard).map(|previous| previous.value().clone())
    }

    /// Replaces the value for `key` with `new` if it currently equals `old`.
    ///
    /// Returns `false` if the key is absent.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// map.put("hits", 0);
    /// assert!(map.compare_and_swap("hits", &0, 1));
    /// assert!(!map.compare_and_swap("hits", &0, 2));
    /// assert_eq!(map.get("hits"), Some(1));
    /// ```
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = pin();
        let read = self.snapshot(&guard);
        if let Some(slot) = read.table.get(key) {
            return slot.try_compare_and_swap(old, new, &guard);
        }
        if !read.amended {
            return false;
        }

        let mut buffer = self.buffer.lock();
        let read = self.snapshot(&guard);
        if let Some(slot) = read.table.get(key) {
            slot.try_compare_and_swap(old, new, &guard)
        } else if let Some(slot) = buffer.dirty.as_ref().and_then(|dirty| dirty.get(key)).cloned() {
            let swapped = slot.try_compare_and_swap(old, new, &guard);
            self.record_miss(&mut buffer, &guard);
            swapped
        } else {
            false
        }
    }

    /// Deletes the value for `key` if it currently equals `old`.
    ///
    /// Returns `false` if the key is absent. The key stays registered in the
    /// write buffer, so a later store reuses its slot.
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = pin();
        self.find(key, &guard, |dirty| dirty.get(key).cloned())
            .is_some_and(|slot| slot.try_compare_and_delete(old, &guard))
    }

    /// Calls `visit` for each key and value until it returns `false`.
    ///
    /// Each key is visited at most once. The map is not locked while `visit`
    /// runs, so it may read and modify the map freely; concurrent changes may
    /// or may not be observed.
    ///
    /// If the map holds keys that have not been promoted yet, this promotes
    /// them first so the walk covers every key present when it started.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map: SyncMap<u32, u32> = (0..10).map(|i| (i, i * i)).collect();
    /// let mut sum = 0;
    /// map.range(|_, value| {
    ///     sum += value;
    ///     true
    /// });
    /// assert_eq!(sum, 285);
    /// ```
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = pin();
        let mut read = self.snapshot(&guard);
        if read.amended {
            let mut buffer = self.buffer.lock();
            read = self.snapshot(&guard);
            if read.amended {
                self.promote(&mut buffer, "range", &guard);
                read = self.snapshot(&guard);
            }
        }

        for (key, slot) in read.table.iter() {
            if let Some(value) = slot.load(&guard) {
                if !visit(key, value) {
                    break;
                }
            }
        }
    }

    /// Number of keys with a value.
    ///
    /// Walks the whole map, so this is O(n) and only a point-in-time estimate
    /// under concurrent writes.
    pub fn len(&self) -> usize {
        let mut len = 0;
        self.range(|_, _| {
            len += 1;
            true
        });
        len
    }

    /// Returns `true` if no key holds a value.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.range(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Removes every key.
    pub fn clear(&self) {
        let guard = pin();
        let read = self.snapshot(&guard);
        if read.table.is_empty() && !read.amended {
            return;
        }

        let discarded = {
            let mut buffer = self.buffer.lock();
            let read = self.snapshot(&guard);
            if !read.table.is_empty() || read.amended {
                let empty = Arc::new(HashMap::with_hasher(self.hasher.clone()));
                self.publish(empty, false, &guard);
            }
            buffer.misses = 0;
            buffer.dirty.take()
        };
        trace!(
            discarded = discarded.as_ref().map_or(0, HashMap::len),
            "cleared map"
        );
        // Dropped outside the lock: values held only here may be large.
        drop(discarded);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    #[inline]
    fn snapshot<'g>(&self, guard: &'g Guard) -> &'g Snapshot<K, V, S> {
        let read = self.read.load(Ordering::Acquire, guard);
        // SAFETY: the root pointer is never null, and replaced snapshots are
        // retired, so they outlive every guard that loaded them.
        unsafe { read.deref() }
    }

    /// Replaces the published snapshot. Caller holds the buffer lock.
    fn publish(&self, table: Arc<Table<K, V, S>>, amended: bool, guard: &Guard) {
        let fresh = Snapshot::boxed(table, amended);
        // SAFETY: `fresh` is a new allocation owned by the map from here on.
        let previous = self
            .read
            .swap(unsafe { Shared::from_raw(fresh) }, Ordering::AcqRel, guard);
        // SAFETY: `Snapshot` is `repr(C)` with `RetiredNode` first, and the old
        // snapshot is now unreachable for new readers.
        unsafe { retire(previous.as_raw()) };
    }

    /// Looks `key` up, falling back to the write buffer under the lock.
    ///
    /// `on_buffer` picks the slot out of the buffer and may remove it. Every
    /// fallback counts as a miss, whether or not it found the key.
    fn find<'g, Q, F>(&self, key: &Q, guard: &'g Guard, on_buffer: F) -> Option<SlotRef<'g, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut Table<K, V, S>) -> Option<Arc<Slot<V>>>,
    {
        let read = self.snapshot(guard);
        if let Some(slot) = read.table.get(key) {
            return Some(SlotRef::Published(slot.as_ref()));
        }
        if !read.amended {
            return None;
        }

        let mut buffer = self.buffer.lock();
        // A promotion may have happened while waiting for the lock.
        let read = self.snapshot(guard);
        if let Some(slot) = read.table.get(key) {
            return Some(SlotRef::Published(slot.as_ref()));
        }
        if !read.amended {
            return None;
        }
        let slot = buffer.dirty.as_mut().and_then(on_buffer);
        self.record_miss(&mut buffer, guard);
        slot.map(SlotRef::Buffered)
    }

    /// Installs `node` for `key`, handing back the value it displaced.
    fn store<'g>(
        &self,
        key: K,
        node: Box<ValueNode<V>>,
        guard: &'g Guard,
    ) -> Option<Displaced<'g, V>> {
        let read = self.snapshot(guard);
        let node = match read.table.get(&key) {
            Some(slot) => match slot.try_swap(node, guard) {
                Ok(previous) => return previous,
                Err(node) => node,
            },
            None => node,
        };

        let mut buffer = self.buffer.lock();
        let read = self.snapshot(guard);
        if let Some(slot) = read.table.get(&key) {
            if slot.unexpunge_locked(guard) {
                // Expunged slots are missing from the buffer.
                self.materialize(&mut buffer, read, guard)
                    .insert(key, Arc::clone(slot));
            }
            slot.swap_locked(node, guard)
        } else if let Some(slot) = buffer.dirty.as_ref().and_then(|dirty| dirty.get(&key)) {
            slot.swap_locked(node, guard)
        } else {
            let slot = Arc::new(Slot::new(node));
            self.insert_locked(&mut buffer, read, key, slot, guard);
            None
        }
    }

    /// Loads the value for `key` or offers `value` for it.
    ///
    /// The returned [`SlotRef`] keeps the claimed value's slot alive.
    fn claim<'g>(&self, key: K, value: V, guard: &'g Guard) -> (SlotRef<'g, V>, Claim<'g, V>) {
        let read = self.snapshot(guard);
        let value = match read.table.get(&key) {
            Some(slot) => match slot.try_load_or_store(value, guard) {
                Ok(claim) => return (SlotRef::Published(slot.as_ref()), claim),
                Err(value) => value,
            },
            None => value,
        };

        let mut buffer = self.buffer.lock();
        let read = self.snapshot(guard);
        if let Some(slot) = read.table.get(&key) {
            if slot.unexpunge_locked(guard) {
                self.materialize(&mut buffer, read, guard)
                    .insert(key, Arc::clone(slot));
            }
            let claim = slot.load_or_store_locked(value, guard);
            (SlotRef::Published(slot.as_ref()), claim)
        } else if let Some(slot) = buffer.dirty.as_ref().and_then(|dirty| dirty.get(&key)).cloned() {
            let claim = slot.load_or_store_locked(value, guard);
            self.record_miss(&mut buffer, guard);
            (SlotRef::Buffered(slot), claim)
        } else {
            let slot = Arc::new(Slot::empty());
            let claim = slot.load_or_store_locked(value, guard);
            self.insert_locked(&mut buffer, read, key, Arc::clone(&slot), guard);
            (SlotRef::Buffered(slot), claim)
        }
    }

    /// Adds a key missing from both the snapshot and the buffer.
    fn insert_locked(
        &self,
        buffer: &mut WriteBuffer<K, V, S>,
        read: &Snapshot<K, V, S>,
        key: K,
        slot: Arc<Slot<V>>,
        guard: &Guard,
    ) {
        self.materialize(buffer, read, guard).insert(key, slot);
        if !read.amended {
            // Readers must start falling back to the buffer for this key.
            self.publish(Arc::clone(&read.table), true, guard);
        }
    }

    /// Returns the write buffer, building it from `read` if there is none.
    ///
    /// Deleted slots are expunged instead of copied.
    fn materialize<'b>(
        &self,
        buffer: &'b mut WriteBuffer<K, V, S>,
        read: &Snapshot<K, V, S>,
        guard: &Guard,
    ) -> &'b mut Table<K, V, S> {
        buffer.dirty.get_or_insert_with(|| {
            let capacity = read.table.len().max(self.capacity);
            let mut dirty = HashMap::with_capacity_and_hasher(capacity, self.hasher.clone());
            let mut expunged = 0usize;
            for (key, slot) in read.table.iter() {
                if slot.try_expunge_locked(guard) {
                    expunged += 1;
                } else {
                    dirty.insert(key.clone(), Arc::clone(slot));
                }
            }
            trace!(copied = dirty.len(), expunged, "built write buffer");
            dirty
        })
    }

    fn record_miss(&self, buffer: &mut WriteBuffer<K, V, S>, guard: &Guard) {
        buffer.misses += 1;
        let Some(dirty) = &buffer.dirty else {
            return;
        };
        if buffer.misses < dirty.len() {
            return;
        }
        self.promote(buffer, "misses", guard);
    }

    /// Publishes the write buffer as the next snapshot.
    fn promote(&self, buffer: &mut WriteBuffer<K, V, S>, trigger: &'static str, guard: &Guard) {
        let Some(dirty) = buffer.dirty.take() else {
            return;
        };
        trace!(
            keys = dirty.len(),
            misses = buffer.misses,
            trigger,
            "promoting write buffer"
        );
        buffer.misses = 0;
        self.publish(Arc::new(dirty), false, guard);
    }
}

impl<K, V, S> Drop for SyncMap<K, V, S> {
    fn drop(&mut self) {
        // `&mut self`: no reader holds the current snapshot. Retired ones are
        // kovan's to free.
        let guard = pin();
        let read = self.read.load(Ordering::Relaxed, &guard).as_raw();
        // SAFETY: allocated by `Snapshot::boxed` and never null.
        drop(unsafe { Box::from_raw(read) });
    }
}

// SAFETY: keys and values are shared across threads through snapshots and
// the mutex-guarded buffer, and moved between threads by kovan.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send + Sync> Send for SyncMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send + Sync> Sync for SyncMap<K, V, S> {}

impl<K, V, S> Default for SyncMap<K, V, S>
where
    S: Clone + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> fmt::Debug for SyncMap<K, V, S>
where
    K: fmt::Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: fmt::Debug + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries = f.debug_map();
        self.range(|key, value| {
            entries.entry(key, value);
            true
        });
        entries.finish()
    }
}

impl<K, V, S> FromIterator<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut map = Self::with_capacity_and_hasher(iter.size_hint().0, S::default());
        map.extend(iter);
        map
    }
}

impl<K, V, S> Extend<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.put(key, value);
        }
    }
}

#[cfg(test)]
impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn is_amended(&self) -> bool {
        let guard = pin();
        self.snapshot(&guard).amended
    }

    fn buffered(&self) -> Option<usize> {
        self.buffer.lock().dirty.as_ref().map(HashMap::len)
    }

    fn misses(&self) -> usize {
        self.buffer.lock().misses
    }

    fn published(&self) -> usize {
        let guard = pin();
        self.snapshot(&guard).table.len()
    }
}

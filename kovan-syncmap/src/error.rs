use thiserror::Error;

/// Returned by [`SyncMap::try_insert`](crate::SyncMap::try_insert) when the
/// key already holds a value.
///
/// Both values are handed back so nothing offered to the map is lost.
#[derive(Debug, Error)]
#[error("key already holds a value")]
pub struct OccupiedError<V> {
    /// The value found in the map.
    pub existing: V,
    /// The value that was offered and not stored.
    pub rejected: V,
}

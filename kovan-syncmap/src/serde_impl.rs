use crate::SyncMap;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

impl<K, V, S> Serialize for SyncMap<K, V, S>
where
    K: Serialize + Hash + Eq + Clone + Send + Sync + 'static,
    V: Serialize + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        // Length is unknown until the walk is done.
        let mut map = serializer.serialize_map(None)?;
        let mut failure = None;
        self.range(|key, value| match map.serialize_entry(key, value) {
            Ok(()) => true,
            Err(err) => {
                failure = Some(err);
                false
            }
        });
        match failure {
            Some(err) => Err(err),
            None => map.end(),
        }
    }
}

struct SyncMapVisitor<K, V, S>(PhantomData<fn() -> SyncMap<K, V, S>>);

impl<'de, K, V, S> Visitor<'de> for SyncMapVisitor<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq + Clone + Send + Sync + 'static,
    V: Deserialize<'de> + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    type Value = SyncMap<K, V, S>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a map")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let map = SyncMap::with_capacity_and_hasher(access.size_hint().unwrap_or(0), S::default());
        while let Some((key, value)) = access.next_entry()? {
            map.put(key, value);
        }
        Ok(map)
    }
}

impl<'de, K, V, S> Deserialize<'de> for SyncMap<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq + Clone + Send + Sync + 'static,
    V: Deserialize<'de> + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(SyncMapVisitor(PhantomData))
    }
}

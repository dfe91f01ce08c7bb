use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Typed index into one of the arenas of the road network (nodes, edges, lanes) or into the
/// vehicle registry of a worker. The type parameter only exists at compile time, so ids of
/// different kinds can't be mixed up, while the runtime representation is a plain u64.
///
/// Ids implement `nohash_hasher::IsEnabled`, so they can be used as keys of `IntMap` and `IntSet`.
pub struct Id<T> {
    internal: u64,
    _type_marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub const fn new(internal: u64) -> Self {
        Self {
            internal,
            _type_marker: PhantomData,
        }
    }

    pub fn internal(&self) -> u64 {
        self.internal
    }

    /// Position of the referenced element in its arena.
    pub fn index(&self) -> usize {
        self.internal as usize
    }
}

impl<T> From<usize> for Id<T> {
    fn from(value: usize) -> Self {
        Id::new(value as u64)
    }
}

impl<T> nohash_hasher::IsEnabled for Id<T> {}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.internal == other.internal
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // use write u64 directly, so that we can use NoHashHasher with ids
        state.write_u64(self.internal);
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.internal.cmp(&other.internal)
    }
}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Debug for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", self.internal)
    }
}

impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.internal)
    }
}

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.internal)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let internal = u64::deserialize(deserializer)?;
        Ok(Id::new(internal))
    }
}

#[cfg(test)]
mod tests {
    use nohash_hasher::IntMap;

    use super::Id;

    struct Marker;

    #[test]
    fn ids_are_keys() {
        let mut map: IntMap<Id<Marker>, &str> = IntMap::default();
        map.insert(Id::new(3), "three");
        map.insert(Id::from(7usize), "seven");

        assert_eq!(Some(&"three"), map.get(&Id::new(3)));
        assert_eq!(Some(&"seven"), map.get(&Id::new(7)));
        assert_eq!(None, map.get(&Id::new(4)));
    }

    #[test]
    fn serializes_as_plain_number() {
        let id: Id<Marker> = Id::new(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!("42", json);

        let back: Id<Marker> = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert_eq!(42, back.index());
    }
}

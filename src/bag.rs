// ABOUTME: Parameter bag - first-writer-wins ordered string->string map transported on the wire

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// An ordered collection of (key, value) byte-string pairs with
/// first-write-wins semantics, as transported by a call/return frame group.
///
/// Keys and values are arbitrary bytes; the escape codec is what makes them
/// safe to carry over the text framing, so `Params` itself stores raw
/// [`Bytes`] rather than `String` (values need not be valid UTF-8).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(Bytes, Bytes)>,
}

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    /// Insert a key/value pair. If `key` is already present, this is a
    /// no-op (first writer wins).
    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let key = key.into();
        if !self.entries.iter().any(|(k, _)| *k == key) {
            self.entries.push((key, value.into()));
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries.iter().find(|(k, _)| k.as_ref() == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key.as_bytes()).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| {
                (
                    String::from_utf8_lossy(k).into_owned(),
                    String::from_utf8_lossy(v).into_owned(),
                )
            }))
            .finish()
    }
}

impl FromIterator<(Bytes, Bytes)> for Params {
    fn from_iter<I: IntoIterator<Item = (Bytes, Bytes)>>(iter: I) -> Self {
        let mut bag = Params::new();
        for (k, v) in iter {
            bag.insert(k, v);
        }
        bag
    }
}

/// Builds a `Params` from a `&str` map, filtering out any entry whose value
/// is absent. Param values are never nil on the wire, so an absent value is
/// simply dropped rather than sent as an empty string.
impl<'a> FromIterator<(&'a str, Option<&'a str>)> for Params {
    fn from_iter<I: IntoIterator<Item = (&'a str, Option<&'a str>)>>(iter: I) -> Self {
        let mut bag = Params::new();
        for (k, v) in iter {
            if let Some(v) = v {
                bag.insert(Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes()));
            }
        }
        bag
    }
}

impl From<HashMap<String, String>> for Params {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter()
            .map(|(k, v)| (Bytes::from(k.into_bytes()), Bytes::from(v.into_bytes())))
            .collect()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Params {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins_on_duplicate_keys() {
        let mut bag = Params::new();
        bag.insert("k", "first");
        bag.insert("k", "second");
        assert_eq!(bag.get_str("k"), Some("first"));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn preserves_insertion_order() {
        let mut bag = Params::new();
        bag.insert("b", "2");
        bag.insert("a", "1");
        let keys: Vec<_> = bag.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![Bytes::from_static(b"b"), Bytes::from_static(b"a")]);
    }

    #[test]
    fn filters_absent_values_on_construction() {
        let bag: Params = [("a", Some("1")), ("b", None)].into_iter().collect();
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get_str("a"), Some("1"));
    }
}

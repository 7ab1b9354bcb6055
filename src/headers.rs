use std::fmt;
use std::slice;

/// An insertion-ordered map with case-insensitive keys.
///
/// Used for message headers and for the form-variable surface. Lookup
/// compares keys ASCII case-insensitively; stored keys keep the casing
/// they were inserted with, so transmit headers emit as written while
/// receive headers are inserted pre-lowercased.
#[derive(Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// An empty map.
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key).map(|i| self.entries[i].1.as_str())
    }

    /// True when `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Set `key` to `value`, replacing any existing value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.position(&key) {
            Some(i) => self.entries[i].1 = value.into(),
            None => self.entries.push((key, value.into())),
        }
    }

    /// Add `key` only if not already present.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.position(&key).is_none() {
            self.entries.push((key, value.into()));
        }
    }

    /// Append `value` to `key`, folding duplicates with `", "` per RFC.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.position(&key) {
            Some(i) => {
                let existing = &mut self.entries[i].1;
                existing.push_str(", ");
                existing.push_str(&value.into());
            }
            None => self.entries.push((key, value.into())),
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.entries.iter(),
        }
    }
}

/// Iterator over header entries.
pub struct Iter<'a> {
    inner: slice::Iter<'a, (String, String)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut map = HeaderMap::new();
        map.set("Content-Length", "5");
        assert_eq!(map.get("content-length"), Some("5"));
        assert_eq!(map.get("CONTENT-LENGTH"), Some("5"));
    }

    #[test]
    fn append_folds_duplicates() {
        let mut map = HeaderMap::new();
        map.append("accept", "text/html");
        map.append("Accept", "text/plain");
        assert_eq!(map.get("accept"), Some("text/html, text/plain"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn add_does_not_replace() {
        let mut map = HeaderMap::new();
        map.add("Server", "weir");
        map.add("Server", "other");
        assert_eq!(map.get("server"), Some("weir"));
    }

    #[test]
    fn insertion_order_preserved() {
        let mut map = HeaderMap::new();
        map.set("b", "2");
        map.set("a", "1");
        map.set("c", "3");
        let keys: Vec<_> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }
}

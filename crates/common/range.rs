use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open key interval `[start, end)` over the raw key space.
///
/// An empty `end` means "unbounded on the right" (the store's maximum key),
/// matching the convention the region map uses for the last region.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Bytes,
    pub end: Bytes,
}

impl KeyRange {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// True when the interval cannot contain any key.
    pub fn is_empty(&self) -> bool {
        !self.end.is_empty() && self.start >= self.end
    }

    /// True when `key` falls inside `[start, end)`.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_ref() <= key && (self.end.is_empty() || key < self.end.as_ref())
    }

    /// Bytes held by this range, for memory accounting.
    pub fn mem_size(&self) -> usize {
        self.start.len() + self.end.len()
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            hex::encode(&self.start),
            if self.end.is_empty() {
                "+inf".to_string()
            } else {
                hex::encode(&self.end)
            }
        )
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_respects_half_open_bounds() {
        let range = KeyRange::new(&b"b"[..], &b"d"[..]);
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));
    }

    #[test]
    fn empty_end_is_right_unbounded() {
        let range = KeyRange::new(&b"b"[..], &b""[..]);
        assert!(range.contains(b"zzzz"));
        assert!(!range.is_empty());
    }

    #[test]
    fn inverted_range_is_empty() {
        let range = KeyRange::new(&b"d"[..], &b"b"[..]);
        assert!(range.is_empty());
        assert!(!range.contains(b"c"));
    }
}

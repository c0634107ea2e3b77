//! Binary-search helpers for vectors kept sorted by an embedded key.
//!
//! The reservoir and dispatcher keep their records in plain `Vec`s sorted
//! by identifier and look them up with a lower-bound search. This module
//! centralizes that pattern so every container agrees on the contract:
//! the vector is sorted ascending by `Keyed::key`, keys are unique unless
//! a caller explicitly manages duplicates itself.

/// A record addressed by an embedded, totally ordered key.
pub trait Keyed {
    type Key: Copy + Ord;

    fn key(&self) -> Self::Key;
}

/// Index of the first element whose key is `>= key` (lower bound).
#[inline]
pub fn insertion_point<T: Keyed>(sorted: &[T], key: T::Key) -> usize {
    sorted.partition_point(|entry| entry.key() < key)
}

/// Index of the element with exactly `key`, if present.
#[inline]
pub fn index_of<T: Keyed>(sorted: &[T], key: T::Key) -> Option<usize> {
    let index = insertion_point(sorted, key);
    if sorted.get(index).is_some_and(|entry| entry.key() == key) {
        Some(index)
    } else {
        None
    }
}

/// Shared reference to the element with exactly `key`, if present.
#[inline]
pub fn find<T: Keyed>(sorted: &[T], key: T::Key) -> Option<&T> {
    index_of(sorted, key).map(|index| &sorted[index])
}

/// Mutable reference to the element with exactly `key`, if present.
#[inline]
pub fn find_mut<T: Keyed>(sorted: &mut [T], key: T::Key) -> Option<&mut T> {
    index_of(sorted, key).map(move |index| &mut sorted[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entry {
        key: u32,
        payload: &'static str,
    }

    impl Keyed for Entry {
        type Key = u32;

        fn key(&self) -> u32 {
            self.key
        }
    }

    fn fixture() -> Vec<Entry> {
        vec![
            Entry { key: 2, payload: "two" },
            Entry { key: 5, payload: "five" },
            Entry { key: 9, payload: "nine" },
        ]
    }

    #[test]
    fn test_find_present_and_absent() {
        let entries = fixture();
        assert_eq!(find(&entries, 5).map(|e| e.payload), Some("five"));
        assert!(find(&entries, 4).is_none());
        assert!(find(&entries, 10).is_none());
    }

    #[test]
    fn test_insertion_point() {
        let entries = fixture();
        assert_eq!(insertion_point(&entries, 1), 0);
        assert_eq!(insertion_point(&entries, 2), 0);
        assert_eq!(insertion_point(&entries, 3), 1);
        assert_eq!(insertion_point(&entries, 100), 3);
    }

    #[test]
    fn test_find_mut() {
        let mut entries = fixture();
        find_mut(&mut entries, 9).unwrap().payload = "NINE";
        assert_eq!(find(&entries, 9).map(|e| e.payload), Some("NINE"));
    }
}

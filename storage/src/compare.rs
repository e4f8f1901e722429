//! Key ordering.
//!
//! Comparators follow an integer convention: `0` when both keys are equal,
//! a positive value when `lhs` sorts before `rhs`, a negative value when
//! `rhs` sorts before `lhs`. Every page algorithm relies on exactly this
//! sign, so implementations must not return a plain `Ord` mapping.

use std::cmp::Ordering;

pub trait KeyComparator: Send + Sync {
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> i32;

    /// `true` when `lhs` sorts strictly before `rhs`.
    fn less(&self, lhs: &[u8], rhs: &[u8]) -> bool {
        self.compare(lhs, rhs) > 0
    }

    fn equal(&self, lhs: &[u8], rhs: &[u8]) -> bool {
        self.compare(lhs, rhs) == 0
    }
}

impl<F> KeyComparator for F
where
    F: Fn(&[u8], &[u8]) -> i32 + Send + Sync,
{
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> i32 {
        self(lhs, rhs)
    }
}

/// Ascending lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> i32 {
        match lhs.cmp(rhs) {
            Ordering::Equal => 0,
            Ordering::Less => 1,
            Ordering::Greater => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_sign_convention() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"a", b"a"), 0);
        assert!(cmp.compare(b"a", b"b") > 0);
        assert!(cmp.compare(b"b", b"a") < 0);
        assert!(cmp.less(b"key1", b"key2"));
    }

    #[test]
    fn test_closure_comparator() {
        // Reverse order: larger keys sort first.
        let reverse = |lhs: &[u8], rhs: &[u8]| -> i32 {
            match lhs.cmp(rhs) {
                Ordering::Equal => 0,
                Ordering::Less => -1,
                Ordering::Greater => 1,
            }
        };
        assert!(reverse.less(b"b", b"a"));
        assert!(reverse.equal(b"x", b"x"));
    }
}

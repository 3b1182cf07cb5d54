//! Merge-join of two id-ordered record sequences.

use std::cmp::Ordering;

/// One step of a merge between an old and a new sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge<T> {
    /// Only in the old sequence.
    Removed(T),
    /// Only in the new sequence.
    Added(T),
    /// In both; `old` is the previous copy.
    Retained { old: T, new: T },
}

/// Walks `old` and `new`, both sorted ascending by `key`, and yields what
/// happened to each key. Steps come out in key order.
///
/// Unsorted input produces spurious add/remove pairs but never panics.
pub fn merge_by_key<T, K, F>(old: Vec<T>, new: Vec<T>, key: F) -> Vec<Merge<T>>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut steps = Vec::with_capacity(old.len().max(new.len()));
    let mut old = old.into_iter().peekable();
    let mut new = new.into_iter().peekable();

    loop {
        let order = match (old.peek(), new.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => key(a).cmp(&key(b)),
        };
        let step = match order {
            Ordering::Less => old.next().map(Merge::Removed),
            Ordering::Greater => new.next().map(Merge::Added),
            Ordering::Equal => match (old.next(), new.next()) {
                (Some(old), Some(new)) => Some(Merge::Retained { old, new }),
                _ => None,
            },
        };
        steps.extend(step);
    }
    steps
}

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Process-wide set of content digests with one-shot insertion.
///
/// Two workers racing on the same bytes see exactly one `true`; the loser
/// skips persisting the duplicate.
#[derive(Default)]
pub(crate) struct DedupSet {
    inner: Mutex<HashSet<String>>,
}

impl DedupSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert `digest`; returns true iff this caller inserted it.
    pub(crate) fn add_if_absent(&self, digest: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest.to_string())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_wins() {
        let set = DedupSet::new();
        assert!(set.add_if_absent("abc"));
        assert!(!set.add_if_absent("abc"));
        assert!(set.add_if_absent("def"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn concurrent_inserts_yield_one_winner() {
        let set = std::sync::Arc::new(DedupSet::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            handles.push(std::thread::spawn(move || set.add_if_absent("same")));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(set.len(), 1);
    }
}

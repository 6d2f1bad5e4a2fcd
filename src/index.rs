//! Logical cache index.
//!
//! `all` lists every cached key, most recently added first, without
//! duplicates; `groups` maps group names to member keys. A group never
//! outlives its last member. The local engine maintains this structure
//! inline; the distributed store derives an equivalent view by scanning.

use std::collections::BTreeMap;

use serde::Serialize;

/// Snapshot of what a cache currently holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheIndex {
    /// Every cached key, most recently added first.
    pub all: Vec<String>,
    /// Group name to member keys.
    pub groups: BTreeMap<String, Vec<String>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key, moving it to the front on re-insertion and pruning
    /// any stale group membership first.
    pub(crate) fn insert(&mut self, key: &str, group: Option<&str>) {
        self.remove_key(key);
        self.all.insert(0, key.to_string());
        if let Some(group) = group {
            self.groups
                .entry(group.to_string())
                .or_default()
                .insert(0, key.to_string());
        }
    }

    /// Drop a key from `all` and from every group, deleting groups left
    /// empty. Returns whether the key was present.
    pub(crate) fn remove_key(&mut self, key: &str) -> bool {
        let before = self.all.len();
        self.all.retain(|candidate| candidate != key);
        self.groups.retain(|_, members| {
            members.retain(|candidate| candidate != key);
            !members.is_empty()
        });
        before != self.all.len()
    }

    /// Drop a whole group, returning its members (also removed from `all`).
    pub(crate) fn remove_group(&mut self, name: &str) -> Vec<String> {
        let members = self.groups.remove(name).unwrap_or_default();
        self.all.retain(|candidate| !members.contains(candidate));
        members
    }

    pub(crate) fn reset(&mut self) {
        self.all.clear();
        self.groups.clear();
    }

    pub fn group(&self, name: &str) -> Option<&[String]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.all.iter().any(|candidate| candidate == key)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_recent_insertion_comes_first() {
        let mut index = CacheIndex::new();
        index.insert("/a", None);
        index.insert("/b", None);
        index.insert("/c", None);
        assert_eq!(index.all, vec!["/c", "/b", "/a"]);
    }

    #[test]
    fn reinsertion_moves_to_front_without_duplicating() {
        let mut index = CacheIndex::new();
        index.insert("/a", None);
        index.insert("/b", None);
        index.insert("/a", None);
        assert_eq!(index.all, vec!["/a", "/b"]);
    }

    #[test]
    fn group_membership_tracks_inserts() {
        let mut index = CacheIndex::new();
        index.insert("/movies/1", Some("movies"));
        index.insert("/movies/2", Some("movies"));
        index.insert("/books/1", Some("books"));
        assert_eq!(
            index.group("movies"),
            Some(["/movies/2".to_string(), "/movies/1".to_string()].as_slice())
        );
        assert!(index.contains("/books/1"));
    }

    #[test]
    fn removing_last_member_drops_the_group() {
        let mut index = CacheIndex::new();
        index.insert("/movies/1", Some("movies"));
        index.insert("/movies/2", Some("movies"));

        assert!(index.remove_key("/movies/1"));
        assert!(index.group("movies").is_some());

        assert!(index.remove_key("/movies/2"));
        assert!(index.group("movies").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn reinsertion_under_a_new_group_prunes_the_old_one() {
        let mut index = CacheIndex::new();
        index.insert("/a", Some("first"));
        index.insert("/a", Some("second"));
        assert!(index.group("first").is_none());
        assert_eq!(index.group("second"), Some(["/a".to_string()].as_slice()));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_group_returns_members_and_prunes_all() {
        let mut index = CacheIndex::new();
        index.insert("/movies/1", Some("movies"));
        index.insert("/movies/2", Some("movies"));
        index.insert("/other", None);

        let mut members = index.remove_group("movies");
        members.sort();
        assert_eq!(members, vec!["/movies/1", "/movies/2"]);
        assert_eq!(index.all, vec!["/other"]);
        assert!(index.group("movies").is_none());
    }

    #[test]
    fn removing_an_unknown_key_is_a_no_op() {
        let mut index = CacheIndex::new();
        index.insert("/a", None);
        assert!(!index.remove_key("/missing"));
        assert_eq!(index.len(), 1);
    }
}

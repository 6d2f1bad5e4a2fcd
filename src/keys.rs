//! Shared-store key space.
//!
//! Entry metadata lives at `<prefix><key>`, group markers at
//! `<prefix>group:<name>`, population locks at `<prefix>lock:<key>`, and
//! body blobs at `<prefix>data:<token>:<key>`. The `group:`, `lock:`, and
//! `data:` namespaces are reserved; enumeration never reports a lock or
//! data key as a logical entry.

pub(crate) const GROUP_PREFIX: &str = "group:";
pub(crate) const LOCK_PREFIX: &str = "lock:";
pub(crate) const DATA_PREFIX: &str = "data:";

pub(crate) fn entry_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

pub(crate) fn group_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{GROUP_PREFIX}{name}")
}

pub(crate) fn lock_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{LOCK_PREFIX}{key}")
}

pub(crate) fn data_key(prefix: &str, token: &str, key: &str) -> String {
    format!("{prefix}{DATA_PREFIX}{token}:{key}")
}

pub(crate) fn scan_pattern(prefix: &str) -> String {
    format!("{prefix}*")
}

/// Classification of a raw store key found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreKey {
    Entry(String),
    Group(String),
    /// Lock or data key; skipped by enumeration.
    Auxiliary,
    /// Outside this cache's prefix.
    Foreign,
}

pub(crate) fn classify(prefix: &str, raw: &str) -> StoreKey {
    let Some(rest) = raw.strip_prefix(prefix) else {
        return StoreKey::Foreign;
    };
    if let Some(name) = rest.strip_prefix(GROUP_PREFIX) {
        StoreKey::Group(name.to_string())
    } else if rest.starts_with(LOCK_PREFIX) || rest.starts_with(DATA_PREFIX) {
        StoreKey::Auxiliary
    } else {
        StoreKey::Entry(rest.to_string())
    }
}

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Identity of one corpus page: document name plus 1-based page number.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PageKey {
    pub document: String,
    pub page: u32,
}

impl PageKey {
    pub fn new(document: impl Into<String>, page: u32) -> Self {
        Self {
            document: document.into(),
            page,
        }
    }
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#p{}", self.document, self.page)
    }
}

static SHARD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh shard id of the form `shard_<unix-secs>_<8 hex>`.
///
/// The suffix hashes the current time in nanoseconds, the process id and
/// a process-wide counter, so ids created in the same second differ.
///
/// # Examples
///
/// ```
/// use rebate_rag::page_key::new_shard_id;
///
/// let id = new_shard_id();
/// assert!(id.starts_with("shard_"));
/// assert_ne!(id, new_shard_id());
/// ```
pub fn new_shard_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&now.as_nanos().to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&SHARD_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let suffix = hasher.finalize().to_hex();
    format!("shard_{}_{}", now.as_secs(), &suffix[..8])
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_document_and_page() {
        assert_eq!(PageKey::new("invoice_a", 3).to_string(), "invoice_a#p3");
    }

    #[test]
    fn keys_order_by_document_then_page() {
        let mut keys = vec![
            PageKey::new("b", 1),
            PageKey::new("a", 10),
            PageKey::new("a", 2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![PageKey::new("a", 2), PageKey::new("a", 10), PageKey::new("b", 1)]
        );
    }

    #[test]
    fn shard_id_shape() {
        let id = new_shard_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "shard");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shard_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..100).map(|_| new_shard_id()).collect();
        assert_eq!(ids.len(), 100);
    }
}

//! Durable per-page processing ledger.
//!
//! Each corpus page ever processed has exactly one [`ManifestEntry`],
//! keyed by `(document, page)`. Status changes follow a small state
//! machine and every change is appended to a transition log in the same
//! transaction, so the recorded history can always be audited.
//!
//! Allowed moves: unseen to `new`, `new` to `staged`, `staged` to
//! `merged`, `merged` back to `staged` when content changes, `staged` or
//! `merged` to `deleted`, and `deleted` to `new` when a page reappears.

use std::{collections::BTreeMap, path::Path};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    fingerprint::Fingerprint,
    page_key::{PageKey, unix_now},
};

const ENTRIES: TableDefinition<(&str, u32), &str> =
    TableDefinition::new("entries");
const TRANSITIONS: TableDefinition<u64, &str> =
    TableDefinition::new("transitions");
const SHARDS: TableDefinition<&str, &str> = TableDefinition::new("shards");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SEQ: &str = "next_seq";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    New,
    Staged,
    Merged,
    Deleted,
}

impl ManifestStatus {
    pub const ALL: [ManifestStatus; 4] =
        [Self::New, Self::Staged, Self::Merged, Self::Deleted];

    /// Whether the ledger allows moving from `from` to `to`.
    ///
    /// `None` stands for a page the manifest has never seen.
    pub fn can_transition(from: Option<Self>, to: Self) -> bool {
        use ManifestStatus::*;
        matches!(
            (from, to),
            (None, New)
                | (Some(New), Staged)
                | (Some(Staged), Merged)
                | (Some(Staged), Deleted)
                | (Some(Merged), Staged)
                | (Some(Merged), Deleted)
                | (Some(Deleted), New)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Staged => "staged",
            Self::Merged => "merged",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: PageKey,
    pub status: ManifestStatus,
    pub fingerprint: Fingerprint,
    /// Present once the page has been staged.
    pub content_hash: Option<String>,
    /// Shard the page was last staged in; kept after merge for audit.
    pub shard_id: Option<String>,
    /// Example currently backing this page, if any.
    pub example_id: Option<u64>,
    pub updated_at: u64,
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub key: PageKey,
    pub from: Option<ManifestStatus>,
    pub to: ManifestStatus,
    pub shard_id: Option<String>,
    pub at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Staged,
    Merged,
}

/// A batch of pages staged together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: String,
    pub created_at: u64,
    pub pages: Vec<PageKey>,
    pub status: ShardStatus,
}

pub struct Manifest {
    db: Database,
}

impl Manifest {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(ENTRIES)?;
        txn.open_table(TRANSITIONS)?;
        txn.open_table(SHARDS)?;
        txn.open_table(META)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Entries --

    pub fn get(&self, key: &PageKey) -> Result<Option<ManifestEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        match table.get((key.document.as_str(), key.page))? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    /// Every entry, ordered by document then page.
    pub fn list(&self) -> Result<Vec<ManifestEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_str(v.value())?);
        }
        Ok(result)
    }

    pub fn list_by_status(
        &self,
        status: ManifestStatus,
    ) -> Result<Vec<ManifestEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    /// Number of entries in each status; absent statuses count zero.
    pub fn counts(&self) -> Result<BTreeMap<ManifestStatus, u64>> {
        let mut counts: BTreeMap<ManifestStatus, u64> =
            ManifestStatus::ALL.iter().map(|&s| (s, 0)).collect();
        for entry in self.list()? {
            *counts.entry(entry.status).or_default() += 1;
        }
        Ok(counts)
    }

    /// Record that `example_id` now backs `key`, staged in `shard_id`.
    ///
    /// Fingerprint, content hash, shard id and status change together in
    /// one transaction, along with the shard record. Unseen and deleted
    /// pages pass through `new` first. Returns the example the page pointed
    /// at before, which the caller should remove.
    ///
    /// Staging a page that is already `staged` is a
    /// [`Error::ManifestInconsistency`].
    pub fn stage(
        &self,
        key: &PageKey,
        fingerprint: Fingerprint,
        content_hash: &str,
        shard_id: &str,
        example_id: u64,
    ) -> Result<Option<u64>> {
        let txn = self.db.begin_write()?;
        let superseded = {
            let previous = read_entry(&txn, key)?;
            let from = previous.as_ref().map(|e| e.status);

            let path: &[(Option<ManifestStatus>, ManifestStatus)] = match from {
                None => &[
                    (None, ManifestStatus::New),
                    (Some(ManifestStatus::New), ManifestStatus::Staged),
                ],
                Some(ManifestStatus::Deleted) => &[
                    (Some(ManifestStatus::Deleted), ManifestStatus::New),
                    (Some(ManifestStatus::New), ManifestStatus::Staged),
                ],
                Some(ManifestStatus::New) => {
                    &[(Some(ManifestStatus::New), ManifestStatus::Staged)]
                }
                Some(ManifestStatus::Merged) => {
                    &[(Some(ManifestStatus::Merged), ManifestStatus::Staged)]
                }
                Some(ManifestStatus::Staged) => {
                    return Err(inconsistency(
                        key,
                        "page is already staged and awaiting merge",
                    ));
                }
            };
            for &(from, to) in path {
                record_transition(&txn, key, from, to, Some(shard_id))?;
            }

            let entry = ManifestEntry {
                key: key.clone(),
                status: ManifestStatus::Staged,
                fingerprint,
                content_hash: Some(content_hash.to_string()),
                shard_id: Some(shard_id.to_string()),
                example_id: Some(example_id),
                updated_at: unix_now(),
            };
            write_entry(&txn, &entry)?;

            let mut shards = txn.open_table(SHARDS)?;
            let mut shard = match shards.get(shard_id)? {
                Some(v) => serde_json::from_str::<ShardRecord>(v.value())?,
                None => ShardRecord {
                    id: shard_id.to_string(),
                    created_at: unix_now(),
                    pages: Vec::new(),
                    status: ShardStatus::Staged,
                },
            };
            shard.pages.push(key.clone());
            shard.status = ShardStatus::Staged;
            let json = serde_json::to_string(&shard)?;
            shards.insert(shard_id, json.as_str())?;

            previous
                .and_then(|e| e.example_id)
                .filter(|&id| id != example_id)
        };
        txn.commit()?;
        debug!(page = %key, shard = shard_id, example_id, "staged page");
        Ok(superseded)
    }

    /// Replace the stored fingerprint of an entry, leaving its status.
    pub fn touch_fingerprint(
        &self,
        key: &PageKey,
        fingerprint: Fingerprint,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let Some(mut entry) = read_entry(&txn, key)? else {
                return Err(Error::NotFound {
                    kind: "manifest entry",
                    name: key.to_string(),
                });
            };
            entry.fingerprint = fingerprint;
            entry.updated_at = unix_now();
            write_entry(&txn, &entry)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Move every page staged in `shard_id` to `merged`.
    ///
    /// Returns the pages that changed. Pages of the shard that were
    /// restaged elsewhere or deleted meanwhile are left alone.
    pub fn merge_shard(&self, shard_id: &str) -> Result<Vec<PageKey>> {
        let txn = self.db.begin_write()?;
        let merged = {
            let mut shards = txn.open_table(SHARDS)?;
            let Some(mut shard) = shards
                .get(shard_id)?
                .map(|v| serde_json::from_str::<ShardRecord>(v.value()))
                .transpose()?
            else {
                return Err(Error::NotFound {
                    kind: "shard",
                    name: shard_id.to_string(),
                });
            };

            let mut merged = Vec::new();
            for key in &shard.pages {
                let Some(mut entry) = read_entry(&txn, key)? else {
                    continue;
                };
                if entry.status != ManifestStatus::Staged
                    || entry.shard_id.as_deref() != Some(shard_id)
                {
                    continue;
                }
                record_transition(
                    &txn,
                    key,
                    Some(ManifestStatus::Staged),
                    ManifestStatus::Merged,
                    Some(shard_id),
                )?;
                entry.status = ManifestStatus::Merged;
                entry.updated_at = unix_now();
                write_entry(&txn, &entry)?;
                merged.push(key.clone());
            }

            shard.status = ShardStatus::Merged;
            let json = serde_json::to_string(&shard)?;
            shards.insert(shard_id, json.as_str())?;
            merged
        };
        txn.commit()?;
        debug!(shard = shard_id, pages = merged.len(), "merged shard");
        Ok(merged)
    }

    /// Mark a vanished page deleted, returning the example that backed it.
    ///
    /// Deleting an already deleted page is a no-op returning `None`.
    pub fn mark_deleted(&self, key: &PageKey) -> Result<Option<u64>> {
        let txn = self.db.begin_write()?;
        let example_id = {
            let Some(mut entry) = read_entry(&txn, key)? else {
                return Err(Error::NotFound {
                    kind: "manifest entry",
                    name: key.to_string(),
                });
            };
            if entry.status == ManifestStatus::Deleted {
                return Ok(None);
            }
            if !ManifestStatus::can_transition(
                Some(entry.status),
                ManifestStatus::Deleted,
            ) {
                return Err(inconsistency(
                    key,
                    &format!("cannot delete a page in status {}", entry.status),
                ));
            }
            record_transition(
                &txn,
                key,
                Some(entry.status),
                ManifestStatus::Deleted,
                None,
            )?;
            entry.status = ManifestStatus::Deleted;
            entry.updated_at = unix_now();
            let example_id = entry.example_id.take();
            write_entry(&txn, &entry)?;
            example_id
        };
        txn.commit()?;
        debug!(page = %key, "marked page deleted");
        Ok(example_id)
    }

    /// Recorded transitions of one page, oldest first.
    pub fn history(&self, key: &PageKey) -> Result<Vec<Transition>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TRANSITIONS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let transition: Transition = serde_json::from_str(v.value())?;
            if &transition.key == key {
                result.push(transition);
            }
        }
        Ok(result)
    }

    // -- Shards --

    pub fn get_shard(&self, shard_id: &str) -> Result<Option<ShardRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SHARDS)?;
        match table.get(shard_id)? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    /// Every shard, oldest first.
    pub fn list_shards(&self) -> Result<Vec<ShardRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SHARDS)?;
        let mut result: Vec<ShardRecord> = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_str(v.value())?);
        }
        result.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
        });
        Ok(result)
    }

    /// Forget every entry, transition and shard.
    pub fn clear(&self) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let removed = {
            let removed = txn.open_table(ENTRIES)?.len()?;
            txn.delete_table(ENTRIES)?;
            txn.delete_table(TRANSITIONS)?;
            txn.delete_table(SHARDS)?;
            txn.open_table(ENTRIES)?;
            txn.open_table(TRANSITIONS)?;
            txn.open_table(SHARDS)?;
            removed
        };
        txn.commit()?;
        Ok(removed)
    }
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").finish_non_exhaustive()
    }
}

fn inconsistency(key: &PageKey, reason: &str) -> Error {
    Error::ManifestInconsistency {
        document: key.document.clone(),
        page: key.page,
        reason: reason.to_string(),
    }
}

fn read_entry(
    txn: &WriteTransaction,
    key: &PageKey,
) -> Result<Option<ManifestEntry>> {
    let table = txn.open_table(ENTRIES)?;
    let value = table
        .get((key.document.as_str(), key.page))?
        .map(|v| v.value().to_string());
    match value {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn write_entry(txn: &WriteTransaction, entry: &ManifestEntry) -> Result<()> {
    let json = serde_json::to_string(entry)?;
    let mut table = txn.open_table(ENTRIES)?;
    table.insert((entry.key.document.as_str(), entry.key.page), json.as_str())?;
    Ok(())
}

fn record_transition(
    txn: &WriteTransaction,
    key: &PageKey,
    from: Option<ManifestStatus>,
    to: ManifestStatus,
    shard_id: Option<&str>,
) -> Result<()> {
    if !ManifestStatus::can_transition(from, to) {
        let from = from.map(|s| s.as_str()).unwrap_or("unseen");
        return Err(inconsistency(key, &format!("illegal transition {from} -> {to}")));
    }

    let mut meta = txn.open_table(META)?;
    let seq = meta.get(NEXT_SEQ)?.map(|g| g.value()).unwrap_or(1);
    meta.insert(NEXT_SEQ, seq + 1)?;

    let transition = Transition {
        seq,
        key: key.clone(),
        from,
        to,
        shard_id: shard_id.map(str::to_string),
        at: unix_now(),
    };
    let json = serde_json::to_string(&transition)?;
    txn.open_table(TRANSITIONS)?.insert(seq, json.as_str())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Manifest) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Manifest::open(&tmp.path().join("manifest.redb")).unwrap();
        (tmp, db)
    }

    fn fp(n: u64) -> Fingerprint {
        Fingerprint {
            source_mtime: n,
            source_size: n,
            answer_mtime: n,
            answer_size: n,
        }
    }

    fn key(page: u32) -> PageKey {
        PageKey::new("invoice_a", page)
    }

    fn statuses(history: &[Transition]) -> Vec<(Option<ManifestStatus>, ManifestStatus)> {
        history.iter().map(|t| (t.from, t.to)).collect()
    }

    use ManifestStatus::*;

    #[test]
    fn transition_table() {
        assert!(ManifestStatus::can_transition(None, New));
        assert!(ManifestStatus::can_transition(Some(New), Staged));
        assert!(ManifestStatus::can_transition(Some(Staged), Merged));
        assert!(ManifestStatus::can_transition(Some(Deleted), New));
        assert!(!ManifestStatus::can_transition(Some(New), Merged));
        assert!(!ManifestStatus::can_transition(None, Staged));
        assert!(!ManifestStatus::can_transition(Some(Deleted), Merged));
        assert!(!ManifestStatus::can_transition(Some(Merged), New));
    }

    #[test]
    fn stage_unseen_page_passes_through_new() {
        let (_tmp, m) = test_db();
        assert_eq!(m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap(), None);

        let entry = m.get(&key(1)).unwrap().unwrap();
        assert_eq!(entry.status, Staged);
        assert_eq!(entry.content_hash.as_deref(), Some("h1"));
        assert_eq!(entry.shard_id.as_deref(), Some("shard_a"));
        assert_eq!(entry.example_id, Some(10));
        assert_eq!(
            statuses(&m.history(&key(1)).unwrap()),
            vec![(None, New), (Some(New), Staged)]
        );
    }

    #[test]
    fn staged_page_cannot_be_restaged() {
        let (_tmp, m) = test_db();
        m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        let err = m.stage(&key(1), fp(2), "h2", "shard_b", 11).unwrap_err();
        assert!(matches!(err, Error::ManifestInconsistency { page: 1, .. }));
        assert_eq!(m.get(&key(1)).unwrap().unwrap().example_id, Some(10));
    }

    #[test]
    fn merge_moves_only_that_shard() {
        let (_tmp, m) = test_db();
        m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        m.stage(&key(2), fp(1), "h2", "shard_b", 11).unwrap();

        assert_eq!(m.merge_shard("shard_a").unwrap(), vec![key(1)]);
        assert_eq!(m.get(&key(1)).unwrap().unwrap().status, Merged);
        assert_eq!(m.get(&key(2)).unwrap().unwrap().status, Staged);
        assert_eq!(
            m.get_shard("shard_a").unwrap().unwrap().status,
            ShardStatus::Merged
        );
        assert!(m.merge_shard("shard_a").unwrap().is_empty());
    }

    #[test]
    fn merge_unknown_shard_is_not_found() {
        let (_tmp, m) = test_db();
        assert!(matches!(
            m.merge_shard("shard_missing").unwrap_err(),
            Error::NotFound { kind: "shard", .. }
        ));
    }

    #[test]
    fn restaging_merged_page_returns_superseded_example() {
        let (_tmp, m) = test_db();
        m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        m.merge_shard("shard_a").unwrap();

        let old = m.stage(&key(1), fp(2), "h2", "shard_b", 20).unwrap();
        assert_eq!(old, Some(10));
        let entry = m.get(&key(1)).unwrap().unwrap();
        assert_eq!(entry.status, Staged);
        assert_eq!(entry.example_id, Some(20));
    }

    #[test]
    fn delete_and_reappear() {
        let (_tmp, m) = test_db();
        m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        m.merge_shard("shard_a").unwrap();

        assert_eq!(m.mark_deleted(&key(1)).unwrap(), Some(10));
        assert_eq!(m.mark_deleted(&key(1)).unwrap(), None);
        let entry = m.get(&key(1)).unwrap().unwrap();
        assert_eq!(entry.status, Deleted);
        assert_eq!(entry.example_id, None);

        m.stage(&key(1), fp(3), "h3", "shard_c", 30).unwrap();
        assert_eq!(
            statuses(&m.history(&key(1)).unwrap()),
            vec![
                (None, New),
                (Some(New), Staged),
                (Some(Staged), Merged),
                (Some(Merged), Deleted),
                (Some(Deleted), New),
                (Some(New), Staged),
            ]
        );
    }

    #[test]
    fn history_never_skips_staged() {
        let (_tmp, m) = test_db();
        for round in 0..3u64 {
            let shard = format!("shard_{round}");
            m.stage(&key(1), fp(round), "h", &shard, round + 1).unwrap();
            m.merge_shard(&shard).unwrap();
        }
        let history = m.history(&key(1)).unwrap();
        for t in &history {
            assert!(ManifestStatus::can_transition(t.from, t.to));
        }
        for w in history.windows(2) {
            assert!(w[0].seq < w[1].seq);
            assert_eq!(Some(w[0].to), w[1].from);
        }
    }

    #[test]
    fn touch_fingerprint_keeps_status() {
        let (_tmp, m) = test_db();
        m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        m.merge_shard("shard_a").unwrap();
        m.touch_fingerprint(&key(1), fp(9)).unwrap();

        let entry = m.get(&key(1)).unwrap().unwrap();
        assert_eq!(entry.fingerprint, fp(9));
        assert_eq!(entry.status, Merged);
        assert!(m.touch_fingerprint(&key(7), fp(1)).is_err());
    }

    #[test]
    fn counts_and_lists() {
        let (_tmp, m) = test_db();
        m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        m.stage(&key(2), fp(1), "h2", "shard_a", 11).unwrap();
        m.merge_shard("shard_a").unwrap();
        m.stage(&key(3), fp(1), "h3", "shard_b", 12).unwrap();

        let counts = m.counts().unwrap();
        assert_eq!(counts[&Merged], 2);
        assert_eq!(counts[&Staged], 1);
        assert_eq!(counts[&Deleted], 0);
        assert_eq!(m.list_by_status(Staged).unwrap()[0].key, key(3));

        let shards = m.list_shards().unwrap();
        assert_eq!(shards.len(), 2);
        let a = m.get_shard("shard_a").unwrap().unwrap();
        assert_eq!(a.pages, vec![key(1), key(2)]);
    }

    #[test]
    fn clear_forgets_everything() {
        let (_tmp, m) = test_db();
        m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        assert_eq!(m.clear().unwrap(), 1);
        assert!(m.list().unwrap().is_empty());
        assert!(m.list_shards().unwrap().is_empty());
        assert!(m.history(&key(1)).unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.redb");

        {
            let m = Manifest::open(&path).unwrap();
            m.stage(&key(1), fp(1), "h1", "shard_a", 10).unwrap();
        }

        {
            let m = Manifest::open(&path).unwrap();
            assert_eq!(m.get(&key(1)).unwrap().unwrap().status, Staged);
            assert_eq!(m.history(&key(1)).unwrap().len(), 2);
        }
    }
}

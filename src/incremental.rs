//! Change detection between a corpus scan and the manifest.

use std::collections::{BTreeMap, HashSet};

use globset::{Glob, GlobMatcher};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    fingerprint::Fingerprint,
    manifest::{Manifest, ManifestEntry, ManifestStatus},
    page_key::PageKey,
    walker::DiscoveredPage,
};

/// Restricts a run to documents whose name matches a glob.
///
/// # Examples
///
/// ```
/// use rebate_rag::incremental::Scope;
///
/// let scope = Scope::parse(Some("2024/*")).unwrap();
/// assert!(scope.matches("2024/march"));
/// assert!(!scope.matches("2023/march"));
/// assert!(Scope::all().matches("anything"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Scope {
    matcher: Option<GlobMatcher>,
}

impl Scope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(pattern: Option<&str>) -> Result<Self> {
        let matcher = pattern
            .map(|p| {
                Glob::new(p).map(|g| g.compile_matcher()).map_err(|e| {
                    Error::Config(format!("invalid scope pattern: {e}"))
                })
            })
            .transpose()?;
        Ok(Self { matcher })
    }

    pub fn matches(&self, document: &str) -> bool {
        self.matcher.as_ref().is_none_or(|m| m.is_match(document))
    }
}

/// A page whose fingerprint says it may need re-embedding.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub page: DiscoveredPage,
    pub fingerprint: Fingerprint,
    /// Manifest entry before this run, absent for unseen pages.
    pub previous: Option<ManifestEntry>,
}

impl Candidate {
    /// New to the ledger, or coming back after deletion.
    pub fn is_new(&self) -> bool {
        self.previous
            .as_ref()
            .is_none_or(|e| e.status == ManifestStatus::Deleted)
    }

    /// Whether `content_hash` matches what was last staged, making the
    /// fingerprint change a false positive.
    pub fn is_false_positive(&self, content_hash: &str) -> bool {
        self.previous.as_ref().is_some_and(|e| {
            e.status == ManifestStatus::Merged
                && e.content_hash.as_deref() == Some(content_hash)
        })
    }
}

/// Outcome of comparing discovered pages against the manifest.
#[derive(Debug, Default)]
pub struct DiffResult {
    pub candidates: Vec<Candidate>,
    /// Fingerprint unchanged since the page was staged or merged.
    pub unchanged: Vec<PageKey>,
    /// Changed while staged; picked up again after the merge.
    pub held: Vec<PageKey>,
    /// Live entries no longer present on disk.
    pub deleted: Vec<PageKey>,
    /// Pages whose files could not be stat'ed.
    pub unreadable: Vec<(PageKey, String)>,
}

/// Compare `discovered` pages against the manifest.
///
/// Only the cheap fingerprint is consulted here. Deletion detection only
/// looks at manifest entries whose document falls inside `scope`.
pub fn diff_pages(
    manifest: &Manifest,
    discovered: &[DiscoveredPage],
    scope: &Scope,
) -> Result<DiffResult> {
    let mut known: BTreeMap<PageKey, ManifestEntry> = manifest
        .list()?
        .into_iter()
        .map(|e| (e.key.clone(), e))
        .collect();

    let mut result = DiffResult::default();
    let mut seen: HashSet<&PageKey> = HashSet::new();

    for page in discovered {
        seen.insert(&page.key);

        let fingerprint =
            match Fingerprint::of_files(&page.source_path, &page.answer_path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(page = %page.key, error = %e, "cannot stat page files");
                    result.unreadable.push((page.key.clone(), e.to_string()));
                    continue;
                }
            };

        let previous = known.remove(&page.key);
        match previous.as_ref().map(|e| e.status) {
            Some(ManifestStatus::Staged | ManifestStatus::Merged)
                if previous.as_ref().map(|e| e.fingerprint) == Some(fingerprint) =>
            {
                result.unchanged.push(page.key.clone());
            }
            Some(ManifestStatus::Staged) => {
                debug!(page = %page.key, "changed while staged, holding until merge");
                result.held.push(page.key.clone());
            }
            _ => result.candidates.push(Candidate {
                page: page.clone(),
                fingerprint,
                previous,
            }),
        }
    }

    for (key, entry) in known {
        if seen.contains(&key) || !scope.matches(&key.document) {
            continue;
        }
        if matches!(
            entry.status,
            ManifestStatus::Staged | ManifestStatus::Merged
        ) {
            result.deleted.push(key);
        }
    }

    debug!(
        candidates = result.candidates.len(),
        unchanged = result.unchanged.len(),
        held = result.held.len(),
        deleted = result.deleted.len(),
        "diffed corpus against manifest"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::walker::discover_pages;

    fn write_page(root: &Path, doc: &str, page: u32, text: &str) {
        let dir = root.join(doc);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("Page{page}.txt")), text).unwrap();
        std::fs::write(dir.join(format!("Page{page}_answer.json")), "{}")
            .unwrap();
    }

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Manifest) {
        let corpus = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let manifest =
            Manifest::open(&data.path().join("manifest.redb")).unwrap();
        (corpus, data, manifest)
    }

    fn stage_all(manifest: &Manifest, pages: &[DiscoveredPage], shard: &str) {
        for (i, page) in pages.iter().enumerate() {
            let fp =
                Fingerprint::of_files(&page.source_path, &page.answer_path)
                    .unwrap();
            manifest
                .stage(&page.key, fp, "hash", shard, i as u64 + 1)
                .unwrap();
        }
    }

    #[test]
    fn everything_is_a_candidate_on_first_run() {
        let (corpus, _data, manifest) = setup();
        write_page(corpus.path(), "doc", 1, "a");
        write_page(corpus.path(), "doc", 2, "b");
        let pages = discover_pages(corpus.path()).unwrap();

        let diff = diff_pages(&manifest, &pages, &Scope::all()).unwrap();
        assert_eq!(diff.candidates.len(), 2);
        assert!(diff.candidates.iter().all(Candidate::is_new));
        assert!(diff.unchanged.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn unchanged_fingerprint_is_skipped() {
        let (corpus, _data, manifest) = setup();
        write_page(corpus.path(), "doc", 1, "a");
        let pages = discover_pages(corpus.path()).unwrap();
        stage_all(&manifest, &pages, "shard_a");
        manifest.merge_shard("shard_a").unwrap();

        let diff = diff_pages(&manifest, &pages, &Scope::all()).unwrap();
        assert!(diff.candidates.is_empty());
        assert_eq!(diff.unchanged, vec![PageKey::new("doc", 1)]);
    }

    #[test]
    fn changed_merged_page_is_a_candidate() {
        let (corpus, _data, manifest) = setup();
        write_page(corpus.path(), "doc", 1, "a");
        let pages = discover_pages(corpus.path()).unwrap();
        stage_all(&manifest, &pages, "shard_a");
        manifest.merge_shard("shard_a").unwrap();

        write_page(corpus.path(), "doc", 1, "longer text");
        let diff = diff_pages(&manifest, &pages, &Scope::all()).unwrap();
        assert_eq!(diff.candidates.len(), 1);
        let candidate = &diff.candidates[0];
        assert!(!candidate.is_new());
        assert!(candidate.is_false_positive("hash"));
        assert!(!candidate.is_false_positive("other"));
    }

    #[test]
    fn changed_staged_page_is_held() {
        let (corpus, _data, manifest) = setup();
        write_page(corpus.path(), "doc", 1, "a");
        let pages = discover_pages(corpus.path()).unwrap();
        stage_all(&manifest, &pages, "shard_a");

        write_page(corpus.path(), "doc", 1, "longer text");
        let diff = diff_pages(&manifest, &pages, &Scope::all()).unwrap();
        assert!(diff.candidates.is_empty());
        assert_eq!(diff.held, vec![PageKey::new("doc", 1)]);
    }

    #[test]
    fn vanished_pages_are_deleted_within_scope() {
        let (corpus, _data, manifest) = setup();
        write_page(corpus.path(), "2024/a", 1, "a");
        write_page(corpus.path(), "2023/b", 1, "b");
        let pages = discover_pages(corpus.path()).unwrap();
        stage_all(&manifest, &pages, "shard_a");

        std::fs::remove_dir_all(corpus.path().join("2024")).unwrap();
        std::fs::remove_dir_all(corpus.path().join("2023")).unwrap();
        std::fs::create_dir(corpus.path().join("empty")).unwrap();
        let pages = discover_pages(corpus.path()).unwrap();

        let scope = Scope::parse(Some("2024/*")).unwrap();
        let diff = diff_pages(&manifest, &pages, &scope).unwrap();
        assert_eq!(diff.deleted, vec![PageKey::new("2024/a", 1)]);

        let diff = diff_pages(&manifest, &pages, &Scope::all()).unwrap();
        assert_eq!(diff.deleted.len(), 2);
    }

    #[test]
    fn deleted_entries_come_back_as_new() {
        let (corpus, _data, manifest) = setup();
        write_page(corpus.path(), "doc", 1, "a");
        let pages = discover_pages(corpus.path()).unwrap();
        stage_all(&manifest, &pages, "shard_a");
        manifest.mark_deleted(&pages[0].key).unwrap();

        let diff = diff_pages(&manifest, &pages, &Scope::all()).unwrap();
        assert_eq!(diff.candidates.len(), 1);
        assert!(diff.candidates[0].is_new());
    }

    #[test]
    fn invalid_scope_is_a_config_error() {
        assert!(matches!(
            Scope::parse(Some("[unclosed")).unwrap_err(),
            Error::Config(_)
        ));
    }
}

//! Shard-and-merge indexing of a corpus into the example store.
//!
//! A run scans the corpus, lets [`incremental::diff_pages`] pick the pages
//! whose files changed, confirms each change with a content hash, and adds
//! the real changes to the store under a fresh shard id. Merging a shard is
//! a manifest transition only: every shard writes straight into the base
//! store.

use std::{
    collections::HashSet,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    example::{ExampleMetadata, Origin},
    example_store::ExampleStore,
    incremental::{self, Candidate, Scope},
    ingestion::{self, PageLoader},
    manifest::{Manifest, ManifestStatus, ShardStatus},
    page_key::{PageKey, new_shard_id},
    walker,
};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Merge the shard as soon as it is staged.
    pub auto_merge: bool,
    pub scope: Scope,
    /// Pages processed concurrently. `1` runs sequentially.
    pub workers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            auto_merge: true,
            scope: Scope::all(),
            workers: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFailure {
    pub document: String,
    pub page: u32,
    pub reason: String,
}

impl PageFailure {
    fn new(key: &PageKey, reason: impl ToString) -> Self {
        Self {
            document: key.document.clone(),
            page: key.page,
            reason: reason.to_string(),
        }
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardResult {
    /// Shard the run staged into; `None` when nothing was staged.
    pub shard_id: Option<String>,
    pub scanned: usize,
    pub new_pages: usize,
    pub changed_pages: usize,
    pub unchanged: usize,
    /// Fingerprint changed but content did not.
    pub false_positives: usize,
    /// Changed while an earlier shard still awaits merge.
    pub held: usize,
    pub deleted: usize,
    pub merged: usize,
    pub failures: Vec<PageFailure>,
    pub corpus_size: u64,
}

impl ShardResult {
    /// Pages embedded and staged by this run.
    pub fn pages_processed(&self) -> usize {
        self.new_pages + self.changed_pages
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub removed: Vec<u64>,
}

enum PageOutcome {
    Staged { new: bool },
    FalsePositive,
    Failed(PageFailure),
}

/// Callback receiving `(pages_done, pages_total)` as candidates finish.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Sync);

pub struct Pipeline<'a> {
    store: &'a ExampleStore,
    manifest: &'a Manifest,
    loader: &'a dyn PageLoader,
    options: PipelineOptions,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        store: &'a ExampleStore,
        manifest: &'a Manifest,
        loader: &'a dyn PageLoader,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            manifest,
            loader,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Index every changed page under `corpus_root` into a new shard.
    ///
    /// Per-page failures never abort the run; they are collected in
    /// [`ShardResult::failures`] and the page keeps its previous manifest
    /// state, so the next run retries it.
    pub fn run(&self, corpus_root: &Path) -> Result<ShardResult> {
        let scope = &self.options.scope;
        let discovered: Vec<_> = walker::discover_pages(corpus_root)?
            .into_iter()
            .filter(|p| scope.matches(&p.key.document))
            .collect();
        let diff = incremental::diff_pages(self.manifest, &discovered, scope)?;

        let mut result = ShardResult {
            scanned: discovered.len(),
            unchanged: diff.unchanged.len(),
            held: diff.held.len(),
            failures: diff
                .unreadable
                .iter()
                .map(|(key, reason)| PageFailure::new(key, reason))
                .collect(),
            ..Default::default()
        };

        let shard_id = new_shard_id();
        if !diff.candidates.is_empty() {
            info!(
                shard = %shard_id,
                candidates = diff.candidates.len(),
                "processing changed pages"
            );
        }

        for outcome in self.process_all(&diff.candidates, &shard_id)? {
            match outcome {
                PageOutcome::Staged { new: true } => result.new_pages += 1,
                PageOutcome::Staged { new: false } => result.changed_pages += 1,
                PageOutcome::FalsePositive => result.false_positives += 1,
                PageOutcome::Failed(failure) => result.failures.push(failure),
            }
        }

        for key in &diff.deleted {
            match self.remove_page(key) {
                Ok(()) => result.deleted += 1,
                Err(e) => {
                    warn!(page = %key, error = %e, "failed to remove deleted page");
                    result.failures.push(PageFailure::new(key, e));
                }
            }
        }

        if result.pages_processed() > 0 {
            if self.options.auto_merge {
                result.merged = self.manifest.merge_shard(&shard_id)?.len();
            }
            result.shard_id = Some(shard_id);
        }
        result.corpus_size = self.store.count()?;

        info!(
            scanned = result.scanned,
            new = result.new_pages,
            changed = result.changed_pages,
            unchanged = result.unchanged,
            deleted = result.deleted,
            failed = result.failures.len(),
            corpus_size = result.corpus_size,
            "indexing run finished"
        );
        Ok(result)
    }

    fn process_all(
        &self,
        candidates: &[Candidate],
        shard_id: &str,
    ) -> Result<Vec<PageOutcome>> {
        let total = candidates.len();
        let done = AtomicUsize::new(0);
        let step = |candidate: &Candidate| {
            let outcome = self.process_page(candidate, shard_id);
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(progress) = self.progress {
                progress(finished, total);
            }
            outcome
        };

        if self.options.workers <= 1 {
            return Ok(candidates.iter().map(step).collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .build()
            .map_err(|e| Error::Config(format!("cannot start worker pool: {e}")))?;
        Ok(pool.install(|| candidates.par_iter().map(step).collect()))
    }

    fn process_page(&self, candidate: &Candidate, shard_id: &str) -> PageOutcome {
        let key = &candidate.page.key;

        let loaded = match ingestion::load_page(self.loader, &candidate.page) {
            Ok(l) => l,
            Err(e) => {
                warn!(page = %key, error = %e, "cannot load page");
                return PageOutcome::Failed(PageFailure::new(key, e));
            }
        };

        if candidate.is_false_positive(&loaded.content_hash) {
            debug!(page = %key, "content unchanged, refreshing fingerprint");
            return match self
                .manifest
                .touch_fingerprint(key, candidate.fingerprint)
            {
                Ok(()) => PageOutcome::FalsePositive,
                Err(e) => PageOutcome::Failed(PageFailure::new(key, e)),
            };
        }

        let metadata = ExampleMetadata {
            document: key.document.clone(),
            page: key.page,
            page_role: loaded.answer.page_role.clone(),
            origin: Origin::Corpus,
            content_hash: Some(loaded.content_hash.clone()),
            shard_id: Some(shard_id.to_string()),
            extra: Default::default(),
        };
        let id = match self.store.add(&loaded.text, loaded.answer, metadata) {
            Ok(id) => id,
            Err(e) => {
                warn!(page = %key, error = %e, "cannot add page to store");
                return PageOutcome::Failed(PageFailure::new(key, e));
            }
        };

        let superseded = match self.manifest.stage(
            key,
            candidate.fingerprint,
            &loaded.content_hash,
            shard_id,
            id,
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(page = %key, error = %e, "cannot stage page, skipping");
                if let Err(e) = self.store.delete(id) {
                    warn!(id, error = %e, "left orphan example for reconcile");
                }
                return PageOutcome::Failed(PageFailure::new(key, e));
            }
        };

        if let Some(old) = superseded
            && let Err(e) = self.store.delete(old)
        {
            warn!(id = old, error = %e, "left superseded example for reconcile");
        }

        debug!(page = %key, id, "staged page");
        PageOutcome::Staged {
            new: candidate.is_new(),
        }
    }

    fn remove_page(&self, key: &PageKey) -> Result<()> {
        if let Some(id) = self.manifest.mark_deleted(key)? {
            self.store.delete(id)?;
        }
        debug!(page = %key, "removed deleted page");
        Ok(())
    }

    /// Merge one shard; returns how many pages moved to `merged`.
    pub fn merge(&self, shard_id: &str) -> Result<usize> {
        let merged = self.manifest.merge_shard(shard_id)?.len();
        info!(shard = shard_id, merged, "merged shard");
        Ok(merged)
    }

    /// Merge every shard still in the staged state, oldest first.
    pub fn merge_all_staged(&self) -> Result<Vec<(String, usize)>> {
        let mut merged = Vec::new();
        for shard in self.manifest.list_shards()? {
            if shard.status == ShardStatus::Staged {
                let count = self.merge(&shard.id)?;
                merged.push((shard.id, count));
            }
        }
        Ok(merged)
    }

    /// Delete corpus examples that no live manifest entry points to.
    ///
    /// These are left behind by crashes between `add` and staging, or by
    /// failed cleanups. Manual examples are never touched.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let live: HashSet<u64> = self
            .manifest
            .list()?
            .into_iter()
            .filter(|e| {
                matches!(e.status, ManifestStatus::Staged | ManifestStatus::Merged)
            })
            .filter_map(|e| e.example_id)
            .collect();

        let mut report = ReconcileReport::default();
        for example in self.store.get_all()? {
            if example.metadata.origin != Origin::Corpus {
                continue;
            }
            report.examined += 1;
            if !live.contains(&example.id) && self.store.delete(example.id)? {
                debug!(id = example.id, document = %example.metadata.document, "removed orphan example");
                report.removed.push(example.id);
            }
        }

        info!(
            examined = report.examined,
            removed = report.removed.len(),
            "reconciled example store"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

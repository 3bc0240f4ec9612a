use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rayon::prelude::*;
use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};
use tracing::{debug, warn};

use crate::{
    embedding::{self, EmbedDeadline, Embedder},
    error::{Error, Result},
    example::{AnswerPayload, Example, ExampleMetadata},
    text_util,
};

const EXAMPLES: TableDefinition<u64, &str> = TableDefinition::new("examples");
const EMBEDDINGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("embeddings");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ID: &str = "next_id";
const VERSION: &str = "version";
const DIMENSION: &str = "dimension";

/// Header size: 4 bytes embedding dimension.
const HEADER_SIZE: usize = 4;

/// Retry and timeout policy for store writes and query embeddings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Total attempts per write or query embedding, including the first.
    pub write_attempts: u32,
    /// Delay before the first retry; doubled on every further retry.
    pub backoff: Duration,
    /// Upper bound on a single embedding call.
    pub embed_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            backoff: Duration::from_millis(200),
            embed_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// A stored example together with its dense similarity to a query.
#[derive(Debug, Clone)]
pub struct DenseHit {
    pub example: Example,
    pub similarity: f32,
}

/// Persistent collection of embedded examples.
///
/// Every example is stored as a JSON record plus one dense vector, keyed by
/// a numeric id that is never reused. A version counter in the meta table is
/// bumped by every committed `add`, `delete` and `repair`; readers use it to
/// tell whether derived state such as the lexical index is stale.
///
/// Binary format per embedding:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
pub struct ExampleStore {
    db: Database,
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    deadline: EmbedDeadline,
    config: StoreConfig,
}

impl ExampleStore {
    /// Open or create an example store at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use std::sync::Arc;
    /// use rebate_rag::{ExampleStore, HashingEmbedder, StoreConfig};
    ///
    /// let store = ExampleStore::open(
    ///     &tmp.path().join("examples.redb"),
    ///     Arc::new(HashingEmbedder::default()),
    ///     StoreConfig::default(),
    /// )
    /// .unwrap();
    /// assert_eq!(store.count().unwrap(), 0);
    /// ```
    pub fn open(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        config: StoreConfig,
    ) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(EXAMPLES)?;
        txn.open_table(EMBEDDINGS)?;
        txn.open_table(META)?;
        txn.commit()?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
            embedder,
            deadline: EmbedDeadline::new(config.embed_timeout),
            config,
        })
    }

    /// Where this store lives on disk.
    pub fn location(&self) -> &Path {
        &self.path
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Normalize, embed and persist one example, returning its fresh id.
    ///
    /// Transient embedding and storage failures are retried with
    /// exponential backoff. Once attempts run out the failure surfaces as
    /// [`Error::StoreWrite`] naming the store location.
    pub fn add(
        &self,
        source_text: &str,
        answer: AnswerPayload,
        metadata: ExampleMetadata,
    ) -> Result<u64> {
        let normalized = text_util::normalize(source_text);
        if normalized.is_empty() {
            return Err(Error::EmptySourceText);
        }

        let vector = self.with_retry("embed", || {
            self.deadline.embed(&self.embedder, &normalized)
        })?;

        let id = self.with_retry("insert", || {
            self.insert(&normalized, &answer, &metadata, &vector)
        })?;
        debug!(
            id,
            document = %metadata.document,
            page = metadata.page,
            "stored example"
        );
        Ok(id)
    }

    fn insert(
        &self,
        normalized: &str,
        answer: &AnswerPayload,
        metadata: &ExampleMetadata,
        vector: &[f32],
    ) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let id = {
            let mut meta = txn.open_table(META)?;
            let dimension = vector.len() as u64;
            let stored = meta.get(DIMENSION)?.map(|g| g.value());
            match stored {
                Some(d) if d != dimension => {
                    return Err(Error::Config(format!(
                        "embedding dimension {dimension} does not match \
                         store dimension {d}; run `rebate-rag repair --yes` \
                         after switching embedders"
                    )));
                }
                Some(_) => {}
                None => {
                    meta.insert(DIMENSION, dimension)?;
                }
            }

            let id = meta.get(NEXT_ID)?.map(|g| g.value()).unwrap_or(1);
            meta.insert(NEXT_ID, id + 1)?;
            bump_version(&mut meta)?;

            let example = Example {
                id,
                source_text: normalized.to_string(),
                answer: answer.clone(),
                metadata: metadata.clone(),
            };
            let json = serde_json::to_string(&example)?;
            txn.open_table(EXAMPLES)?.insert(id, json.as_str())?;

            let mut embeddings = txn.open_table(EMBEDDINGS)?;
            let byte_len = HEADER_SIZE + std::mem::size_of_val(vector);
            let mut guard = embeddings.insert_reserve(id, byte_len)?;
            let dest = guard.as_mut();
            dest[0..HEADER_SIZE]
                .copy_from_slice(&(vector.len() as u32).to_le_bytes());
            dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(vector));
            id
        };
        txn.commit()?;
        Ok(id)
    }

    /// Retry a write; exhaustion surfaces as [`Error::StoreWrite`].
    fn with_retry<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        self.retrying(what, op).map_err(|(e, attempts)| Error::StoreWrite {
            location: self.path.clone(),
            attempts,
            reason: e.to_string(),
        })
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// On failure returns the last error and the number of attempts made.
    fn retrying<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> std::result::Result<T, (Error, u32)> {
        let attempts = self.config.write_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.config.backoff * 2u32.pow(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{what} failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// Embed a query with the store's embedder and timeout.
    ///
    /// Transient backend failures are retried like writes. Once attempts
    /// run out the error stays an [`Error::EmbeddingBackend`], so hybrid
    /// retrieval can still fall back to BM25.
    pub fn embed_query(&self, query_text: &str) -> Result<Vec<f32>> {
        let normalized = text_util::normalize(query_text);
        self.retrying("query embed", || {
            self.deadline.embed(&self.embedder, &normalized)
        })
        .map_err(|(e, attempts)| match e {
            Error::EmbeddingBackend(reason) => Error::EmbeddingBackend(
                format!("{reason} (after {attempts} attempt(s))"),
            ),
            other => other,
        })
    }

    /// Nearest examples to `query_text` by dense similarity.
    ///
    /// Results have `similarity >= min_similarity` and are ordered by
    /// similarity descending, then by id ascending.
    pub fn search_dense(
        &self,
        query_text: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<DenseHit>> {
        if top_k == 0 || text_util::normalize(query_text).is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embed_query(query_text)?;
        self.search_vector(&query, top_k, min_similarity)
    }

    /// Exhaustive cosine scan over every stored vector.
    pub fn search_vector(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<DenseHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let rows = self.load_rows().map_err(|e| self.read_error(e))?;

        let mut hits: Vec<DenseHit> = rows
            .into_par_iter()
            .filter_map(|(example, vector)| {
                let similarity = embedding::similarity(query, &vector);
                (similarity >= min_similarity)
                    .then_some(DenseHit { example, similarity })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.example.id.cmp(&b.example.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn load_rows(&self) -> Result<Vec<(Example, Vec<f32>)>> {
        let txn = self.db.begin_read()?;
        let examples = txn.open_table(EXAMPLES)?;
        let embeddings = txn.open_table(EMBEDDINGS)?;

        let mut rows = Vec::new();
        for entry in examples.iter()? {
            let (k, v) = entry?;
            let id = k.value();
            let example: Example = serde_json::from_str(v.value())?;
            let Some(guard) = embeddings.get(id)? else {
                return Err(Error::Config(format!(
                    "example {id} has no embedding"
                )));
            };
            let vector = decode_vector(guard.value()).ok_or_else(|| {
                Error::Config(format!("embedding for example {id} is corrupt"))
            })?;
            rows.push((example, vector));
        }
        Ok(rows)
    }

    fn read_error(&self, e: Error) -> Error {
        Error::StoreRead {
            location: self.path.clone(),
            reason: e.to_string(),
        }
    }

    /// Every committed example in id order.
    pub fn get_all(&self) -> Result<Vec<Example>> {
        Ok(self.get_all_versioned()?.1)
    }

    /// Every committed example plus the version they were read at.
    pub fn get_all_versioned(&self) -> Result<(u64, Vec<Example>)> {
        self.read_all().map_err(|e| self.read_error(e))
    }

    fn read_all(&self) -> Result<(u64, Vec<Example>)> {
        let txn = self.db.begin_read()?;
        let version = txn
            .open_table(META)?
            .get(VERSION)?
            .map(|g| g.value())
            .unwrap_or(0);
        let table = txn.open_table(EXAMPLES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(serde_json::from_str(v.value())?);
        }
        Ok((version, result))
    }

    pub fn get(&self, id: u64) -> Result<Option<Example>> {
        let read = || -> Result<Option<Example>> {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(EXAMPLES)?;
            match table.get(id)? {
                Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
                None => Ok(None),
            }
        };
        read().map_err(|e| self.read_error(e))
    }

    /// Remove an example. Removing a missing id succeeds and returns false.
    pub fn delete(&self, id: u64) -> Result<bool> {
        let removed = self.with_retry("delete", || {
            let txn = self.db.begin_write()?;
            let removed = {
                let removed = txn.open_table(EXAMPLES)?.remove(id)?.is_some();
                txn.open_table(EMBEDDINGS)?.remove(id)?;
                if removed {
                    bump_version(&mut txn.open_table(META)?)?;
                }
                removed
            };
            txn.commit()?;
            Ok(removed)
        })?;
        if removed {
            debug!(id, "deleted example");
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<u64> {
        let read = || -> Result<u64> {
            let txn = self.db.begin_read()?;
            Ok(txn.open_table(EXAMPLES)?.len()?)
        };
        read().map_err(|e| self.read_error(e))
    }

    /// Monotonic counter of committed mutations.
    pub fn version(&self) -> Result<u64> {
        Ok(self.get_meta(VERSION)?.unwrap_or(0))
    }

    /// Dimension fixed by the first stored embedding, if any.
    pub fn dimension(&self) -> Result<Option<u64>> {
        self.get_meta(DIMENSION)
    }

    fn get_meta(&self, key: &str) -> Result<Option<u64>> {
        let read = || -> Result<Option<u64>> {
            let txn = self.db.begin_read()?;
            Ok(txn.open_table(META)?.get(key)?.map(|g| g.value()))
        };
        read().map_err(|e| self.read_error(e))
    }

    /// Drop every example and embedding and start over.
    ///
    /// Destructive; only ever invoked on explicit operator request. The id
    /// counter survives so ids are never reused. Returns how many examples
    /// were removed.
    pub fn repair(&self) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let removed = {
            let removed = txn.open_table(EXAMPLES)?.len()?;
            txn.delete_table(EXAMPLES)?;
            txn.delete_table(EMBEDDINGS)?;
            txn.open_table(EXAMPLES)?;
            txn.open_table(EMBEDDINGS)?;
            let mut meta = txn.open_table(META)?;
            meta.remove(DIMENSION)?;
            bump_version(&mut meta)?;
            removed
        };
        txn.commit()?;
        warn!(removed, location = %self.path.display(), "example store reset");
        Ok(removed)
    }
}

fn bump_version(meta: &mut redb::Table<'_, &'static str, u64>) -> Result<()> {
    let version = meta.get(VERSION)?.map(|g| g.value()).unwrap_or(0);
    meta.insert(VERSION, version + 1)?;
    Ok(())
}

/// Decode a stored embedding, rejecting malformed byte strings.
fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    let header = bytes.get(..HEADER_SIZE)?;
    let dimension = u32::from_le_bytes(header.try_into().ok()?) as usize;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != dimension * 4 {
        return None;
    }
    Some(
        body.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

impl std::fmt::Debug for ExampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExampleStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

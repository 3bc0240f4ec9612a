//! Dense embedding backends.
//!
//! Retrieval only depends on the [`Embedder`] trait: any backend that maps
//! text to a fixed-dimension vector can be plugged into the example store.
//! Two implementations ship with the crate: the ColBERT model in
//! [`crate::model_manager`] and the offline [`HashingEmbedder`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
        mpsc,
    },
    time::Duration,
};

use crate::{
    error::{Error, Result},
    text_util,
};

/// Maps text to a dense vector of stable dimensionality.
pub trait Embedder: Send + Sync {
    /// Embed one piece of normalized text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Short identifier shown in status output.
    fn name(&self) -> String;
}

/// Calls that missed their deadline and are still running. While this many
/// are outstanding, new calls fail fast instead of queueing behind them.
pub const MAX_STALLED_CALLS: usize = 2;

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

/// Runs embedding calls under a deadline.
///
/// Each call runs on a helper thread. A call that misses its deadline cannot
/// be cancelled: it keeps running, its result is discarded, and it counts as
/// stalled until it returns. A stalled call against a backend that serializes
/// access (such as the ColBERT model mutex) blocks the calls after it, so
/// once [`MAX_STALLED_CALLS`] are outstanding further calls are refused with
/// a transient [`Error::EmbeddingBackend`] rather than spawning more threads.
#[derive(Debug, Default)]
pub struct EmbedDeadline {
    timeout: Option<Duration>,
    stalled: Arc<AtomicUsize>,
}

impl EmbedDeadline {
    /// `None` disables the deadline; calls then run on the current thread.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            stalled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Number of timed-out calls that have not returned yet.
    pub fn stalled(&self) -> usize {
        self.stalled.load(Ordering::SeqCst)
    }

    pub fn embed(
        &self,
        embedder: &Arc<dyn Embedder>,
        text: &str,
    ) -> Result<Vec<f32>> {
        let Some(timeout) = self.timeout else {
            return embedder.embed(text);
        };

        let stalled = self.stalled();
        if stalled >= MAX_STALLED_CALLS {
            return Err(Error::EmbeddingBackend(format!(
                "{stalled} earlier embedding call(s) still running past their deadline"
            )));
        }

        let (tx, rx) = mpsc::channel();
        let state = Arc::new(AtomicU8::new(RUNNING));
        let worker = Arc::clone(embedder);
        let owned = text.to_string();
        let worker_state = Arc::clone(&state);
        let worker_stalled = Arc::clone(&self.stalled);
        std::thread::spawn(move || {
            let result = worker.embed(&owned);
            if worker_state.swap(FINISHED, Ordering::SeqCst) == ABANDONED {
                worker_stalled.fetch_sub(1, Ordering::SeqCst);
            }
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.stalled.fetch_add(1, Ordering::SeqCst);
                if state
                    .compare_exchange(
                        RUNNING,
                        ABANDONED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    // Finished between the deadline and now.
                    self.stalled.fetch_sub(1, Ordering::SeqCst);
                }
                Err(Error::EmbeddingBackend(format!(
                    "embedding timed out after {}ms",
                    timeout.as_millis()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(
                Error::EmbeddingBackend("embedding worker panicked".to_string()),
            ),
        }
    }
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Similarity in `[0, 1]` derived from cosine distance.
///
/// Cosine distance `1 - cos` ranges over `[0, 2]`; halving it gives a
/// normalized distance and the similarity is its complement. Identical
/// directions score 1.0, opposite directions 0.0.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let cos = if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        (dot / (na * nb)).clamp(-1.0, 1.0)
    };
    (1.0 - (1.0 - cos) / 2.0).clamp(0.0, 1.0)
}

pub const DEFAULT_HASHING_DIMENSION: usize = 256;

/// Deterministic feature-hashing embedder.
///
/// Each lexical term from [`text_util::tokenize`] is hashed into one of
/// `dimension` buckets with a hash-derived sign. Needs no model download,
/// so it backs offline use and tests; identical text always maps to the
/// identical vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text_util::tokenize(text) {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
                bytes[6], bytes[7],
            ]) as usize
                % self.dimension;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        Ok(v)
    }

    fn name(&self) -> String {
        format!("hashing-{}", self.dimension)
    }
}

use std::sync::Mutex;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;
use tracing::info;

use crate::{
    embedding::{Embedder, l2_normalize},
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "REBATE_RAG_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

pub(crate) fn backend_err(e: impl std::fmt::Display) -> Error {
    Error::EmbeddingBackend(e.to_string())
}

/// Lazily loaded ColBERT model shared by the embedder and the reranker.
///
/// The model is downloaded and loaded on first use, not at construction,
/// so commands that never embed anything stay fast.
pub struct ModelManager {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// Creates a new `ModelManager`. The model ID is resolved from:
    /// 1. The `REBATE_RAG_MODEL` environment variable, if set
    /// 2. Otherwise, the default model (`lightonai/GTE-ModernColBERT-v1`)
    pub fn new() -> Self {
        let model_id = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        Self::with_model_id(model_id)
    }

    /// Creates a `ModelManager` with an explicit model ID, bypassing
    /// environment variable resolution.
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: Mutex::new(None),
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Encode `texts` into token-level embeddings `[batch, tokens, dim]`.
    pub fn encode(&self, texts: &[String], is_query: bool) -> Result<Tensor> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| backend_err("model lock poisoned"))?;
        if guard.is_none() {
            info!(model = %self.model_id, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(backend_err)?;
            *guard = Some(colbert);
        }
        let Some(model) = guard.as_mut() else {
            return Err(backend_err("model failed to load"));
        };
        model.encode(texts, is_query).map_err(backend_err)
    }

    /// Encodes a query string into a `[Q, D]` token embedding matrix.
    pub fn encode_query(&self, query: &str) -> Result<Tensor> {
        let embeddings = self.encode(&[query.to_string()], true)?;
        embeddings.squeeze(0).map_err(backend_err)
    }
}

impl Embedder for ModelManager {
    /// Mean-pools the token embeddings of `text` into one unit vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = self.encode(&[text.to_string()], false)?;
        let mut pooled = tokens
            .squeeze(0)
            .and_then(|t| t.mean(0))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(backend_err)?;
        l2_normalize(&mut pooled);
        Ok(pooled)
    }

    fn name(&self) -> String {
        format!("colbert:{}", self.model_id)
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

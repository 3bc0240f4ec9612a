//! rebate-rag - few-shot example retrieval for rebate-invoice extraction.
//!
//! Solved invoice pages (page text plus a ground-truth answer) are embedded
//! into a persistent example store. At extraction time the pages most
//! similar to a new page are retrieved with dense search, BM25 fused with
//! dense search, or a dense shortlist reordered by a ColBERT reranker.
//! The store is filled incrementally by a shard-and-merge pipeline that
//! only re-embeds pages whose content actually changed.
//!
//! # Quick start
//!
//! ```
//! # let tmp = tempfile::tempdir().unwrap();
//! use std::sync::Arc;
//!
//! use rebate_rag::{ExampleStore, HashingEmbedder, LexicalIndex, StoreConfig};
//! use rebate_rag::example::{AnswerPayload, ExampleMetadata};
//! use rebate_rag::search::{Retriever, SearchConfig};
//! use serde_json::json;
//!
//! let store = ExampleStore::open(
//!     &tmp.path().join("examples.redb"),
//!     Arc::new(HashingEmbedder::default()),
//!     StoreConfig::default(),
//! )
//! .unwrap();
//! let answer = AnswerPayload::new("detail", vec![json!({"amount": 1200})]);
//! store
//!     .add("請求書 リベート 合計 1,200円", answer, ExampleMetadata::manual("inv", 1, "detail"))
//!     .unwrap();
//!
//! let lexical = LexicalIndex::new();
//! let retrieval = Retriever::new(&store, &lexical)
//!     .retrieve("リベート 合計 1200円", &SearchConfig::default())
//!     .unwrap();
//! assert_eq!(retrieval.results.len(), 1);
//! ```

pub mod config_db;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod example;
pub mod example_store;
pub mod fingerprint;
pub mod incremental;
pub mod ingestion;
pub mod lexical_index;
pub mod manifest;
pub mod model_manager;
pub mod page_key;
pub mod pipeline;
pub mod reranker;
pub mod search;
pub mod text_util;
pub mod walker;

pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use embedding::HashingEmbedder;
pub use error::{Error, Result};
pub use example_store::{ExampleStore, StoreConfig};
pub use lexical_index::LexicalIndex;
pub use manifest::Manifest;
pub use model_manager::ModelManager;
pub use pipeline::Pipeline;

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Page role assumed when an answer file does not name one.
pub const DEFAULT_PAGE_ROLE: &str = "main";

/// Ground-truth structured extraction for one page.
///
/// Extra keys found in answer files are ignored; a missing `page_role` or
/// `items` falls back to [`DEFAULT_PAGE_ROLE`] and an empty list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    #[serde(default = "default_page_role")]
    pub page_role: String,
    #[serde(default)]
    pub items: Vec<Value>,
}

fn default_page_role() -> String {
    DEFAULT_PAGE_ROLE.to_string()
}

impl AnswerPayload {
    pub fn new(page_role: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            page_role: page_role.into(),
            items,
        }
    }

    /// Parse an answer JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Where an example came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Built by the indexing pipeline from a corpus page.
    Corpus,
    /// Added by hand; never garbage-collected by reconciliation.
    Manual,
}

/// Auxiliary fields attached to an example at insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleMetadata {
    pub document: String,
    pub page: u32,
    pub page_role: String,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ExampleMetadata {
    pub fn manual(document: impl Into<String>, page: u32, page_role: &str) -> Self {
        Self {
            document: document.into(),
            page,
            page_role: page_role.to_string(),
            origin: Origin::Manual,
            content_hash: None,
            shard_id: None,
            extra: BTreeMap::new(),
        }
    }
}

/// One retrievable (text, answer) pair as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: u64,
    pub source_text: String,
    pub answer: AnswerPayload,
    pub metadata: ExampleMetadata,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn answer_defaults_missing_fields() {
        let payload: AnswerPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(payload.page_role, DEFAULT_PAGE_ROLE);
        assert!(payload.items.is_empty());
    }

    #[test]
    fn answer_ignores_unknown_keys() {
        let payload: AnswerPayload = serde_json::from_value(json!({
            "page_role": "detail",
            "items": [{"amount": 100}],
            "reviewer": "someone"
        }))
        .unwrap();
        assert_eq!(payload.page_role, "detail");
        assert_eq!(payload.items.len(), 1);
    }

    #[test]
    fn answer_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Page1_answer.json");
        std::fs::write(&path, r#"{"page_role":"cover","items":[]}"#).unwrap();
        let payload = AnswerPayload::from_file(&path).unwrap();
        assert_eq!(payload, AnswerPayload::new("cover", vec![]));
    }

    #[test]
    fn malformed_answer_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Page1_answer.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(AnswerPayload::from_file(&path).is_err());
    }
}

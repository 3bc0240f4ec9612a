//! Two-tier change detection for corpus pages.
//!
//! A [`Fingerprint`] is built from file metadata only and is cheap enough to
//! compute for every page on every run. When it differs from the recorded
//! value, the page text is extracted and a [`content_hash`] decides whether
//! the page really changed.

use std::{fmt, path::Path, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Result, example::AnswerPayload};

/// Stat-derived signature of one page's source and answer files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub source_mtime: u64,
    pub source_size: u64,
    pub answer_mtime: u64,
    pub answer_size: u64,
}

impl Fingerprint {
    /// Stat both files. Reads no file content.
    pub fn of_files(source: &Path, answer: &Path) -> Result<Self> {
        let (source_mtime, source_size) = stat(source)?;
        let (answer_mtime, answer_size) = stat(answer)?;
        Ok(Self {
            source_mtime,
            source_size,
            answer_mtime,
            answer_size,
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}:{}",
            self.source_mtime,
            self.source_size,
            self.answer_mtime,
            self.answer_size
        )
    }
}

fn stat(path: &Path) -> Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    Ok((mtime, meta.len()))
}

/// Hash normalized page text together with its answer payload.
///
/// Object keys are serialized in sorted order, so key order in the answer
/// file does not matter. Array order does: reordering `items` yields a
/// different hash.
///
/// # Examples
///
/// ```
/// use rebate_rag::{example::AnswerPayload, fingerprint::content_hash};
/// use serde_json::json;
///
/// let payload = AnswerPayload::new("detail", vec![json!({"amount": 100})]);
/// let a = content_hash("請求書 合計", &payload);
/// let b = content_hash("請求書 合計", &payload);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn content_hash(normalized_text: &str, payload: &AnswerPayload) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalized_text.as_bytes());
    hasher.update(&[0]);
    hasher.update(payload.page_role.as_bytes());
    hasher.update(&[0]);
    let mut canonical = String::new();
    write_canonical(&Value::Array(payload.items.clone()), &mut canonical);
    hasher.update(canonical.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Serialize `value` as JSON with object keys sorted at every level.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn payload(items: Vec<Value>) -> AnswerPayload {
        AnswerPayload::new("detail", items)
    }

    #[test]
    fn amount_change_changes_hash() {
        let a = content_hash("text", &payload(vec![json!({"amount": 100})]));
        let b = content_hash("text", &payload(vec![json!({"amount": 101})]));
        assert_ne!(a, b);
    }

    #[test]
    fn text_change_changes_hash() {
        let p = payload(vec![json!({"amount": 100})]);
        assert_ne!(content_hash("a", &p), content_hash("b", &p));
    }

    #[test]
    fn page_role_change_changes_hash() {
        let items = vec![json!({"amount": 100})];
        let a = content_hash("t", &AnswerPayload::new("cover", items.clone()));
        let b = content_hash("t", &AnswerPayload::new("detail", items));
        assert_ne!(a, b);
    }

    #[test]
    fn item_order_changes_hash() {
        let a = content_hash(
            "text",
            &payload(vec![json!({"amount": 1}), json!({"amount": 2})]),
        );
        let b = content_hash(
            "text",
            &payload(vec![json!({"amount": 2}), json!({"amount": 1})]),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn key_order_does_not_change_hash() {
        let a: Value =
            serde_json::from_str(r#"{"amount": 1, "name": "x"}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{"name": "x", "amount": 1}"#).unwrap();
        assert_eq!(
            content_hash("text", &payload(vec![a])),
            content_hash("text", &payload(vec![b]))
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let mut out = String::new();
        write_canonical(&json!({"b": {"d": 1, "c": [true, null]}, "a": "x"}), &mut out);
        assert_eq!(out, r#"{"a":"x","b":{"c":[true,null],"d":1}}"#);
    }

    #[test]
    fn fingerprint_tracks_size_and_survives_identical_rewrite() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("Page1.txt");
        let ans = tmp.path().join("Page1_answer.json");
        std::fs::write(&src, "hello").unwrap();
        std::fs::write(&ans, "{}").unwrap();

        let first = Fingerprint::of_files(&src, &ans).unwrap();
        assert_eq!(first.source_size, 5);
        assert_eq!(first.answer_size, 2);

        std::fs::write(&src, "hello world").unwrap();
        let second = Fingerprint::of_files(&src, &ans).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn fingerprint_of_missing_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.txt");
        assert!(Fingerprint::of_files(&missing, &missing).is_err());
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(text in ".{0,40}", amount in any::<i64>()) {
            let p = payload(vec![json!({"amount": amount})]);
            prop_assert_eq!(content_hash(&text, &p), content_hash(&text, &p));
        }
    }
}

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("lexical index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("write to example store at {location} failed after {attempts} attempt(s): {reason}")]
    StoreWrite {
        location: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("read from example store at {location} failed: {reason}")]
    StoreRead { location: PathBuf, reason: String },

    #[error("embedding backend error: {0}")]
    EmbeddingBackend(String),

    #[error("reranker unavailable: {0}")]
    RerankUnavailable(String),

    #[error("manifest inconsistency for {document} page {page}: {reason}")]
    ManifestInconsistency {
        document: String,
        page: u32,
        reason: String,
    },

    #[error("source text is empty after normalization")]
    EmptySourceText,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    ///
    /// Lock contention, I/O hiccups and embedding timeouts are transient;
    /// corrupt data, bad input and configuration mistakes are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::RedbTransaction(_)
            | Error::RedbCommit(_)
            | Error::EmbeddingBackend(_) => true,
            Error::RedbStorage(e) => matches!(e, redb::StorageError::Io(_)),
            Error::Redb(e) => matches!(
                e,
                redb::Error::Io(_) | redb::Error::DatabaseAlreadyOpen
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_errors_are_transient() {
        assert!(Error::EmbeddingBackend("timeout".into()).is_transient());
    }

    #[test]
    fn input_errors_are_not_transient() {
        assert!(!Error::EmptySourceText.is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
        assert!(
            !Error::ManifestInconsistency {
                document: "a".into(),
                page: 1,
                reason: "x".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn store_write_message_names_location() {
        let err = Error::StoreWrite {
            location: PathBuf::from("/data/examples.redb"),
            attempts: 3,
            reason: "locked".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/examples.redb"));
        assert!(msg.contains("3 attempt"));
    }
}

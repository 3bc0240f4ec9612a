use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "REBATE_RAG_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The REBATE_RAG_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/rebate-rag/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("rebate-rag")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn examples_db(&self) -> PathBuf {
        self.root.join("examples.redb")
    }

    pub fn manifest_db(&self) -> PathBuf {
        self.root.join("manifest.redb")
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.examples_db(), tmp.path().join("examples.redb"));
        assert_eq!(dir.manifest_db(), tmp.path().join("manifest.redb"));
        assert_eq!(dir.config_db(), tmp.path().join("config.redb"));
    }

    #[test]
    fn missing_directory_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());
    }
}

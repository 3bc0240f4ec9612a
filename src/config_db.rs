use std::{path::Path, str::FromStr, time::Duration};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    error::{Error, Result},
    example_store::StoreConfig,
    search::{SearchConfig, SearchMode},
};

const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Setting keys understood by [`ConfigDb`], with a short description.
pub const KNOWN_SETTINGS: &[(&str, &str)] = &[
    ("embedder", "embedding backend: hashing or colbert"),
    ("model", "ColBERT model id used by the colbert embedder and reranker"),
    ("search.mode", "dense-only, hybrid or rerank"),
    ("search.top_k", "number of results returned"),
    ("search.min_similarity", "dense similarity floor in [0, 1]"),
    ("search.hybrid_alpha", "dense weight in hybrid fusion, in [0, 1]"),
    ("search.rerank_top_n", "shortlist size handed to the reranker"),
    ("search.fallback", "return the nearest example when nothing qualifies"),
    ("store.write_attempts", "attempts per store write, including the first"),
    ("store.backoff_ms", "delay before the first write retry"),
    ("store.embed_timeout_secs", "embedding call timeout, 0 disables it"),
    ("index.workers", "pages processed concurrently"),
    ("index.auto_merge", "merge shards as soon as they are staged"),
];

pub struct ConfigDb {
    db: Database,
}

impl ConfigDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Settings --

    /// Store a setting after checking the key is known.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        if !is_known(key) {
            return Err(Error::Config(format!("unknown setting '{key}'")));
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.get_setting(key)?
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| {
                    Error::Config(format!("invalid value '{raw}' for {key}: {e}"))
                })
            })
            .transpose()
    }

    // -- Typed overlays --

    /// Built-in search defaults overlaid with persisted settings.
    pub fn search_config(&self) -> Result<SearchConfig> {
        let mut config = SearchConfig::default();
        if let Some(mode) = self.parsed::<SearchMode>("search.mode")? {
            config.mode = mode;
        }
        if let Some(top_k) = self.parsed("search.top_k")? {
            config.top_k = top_k;
        }
        if let Some(min) = self.parsed("search.min_similarity")? {
            config.min_similarity = min;
        }
        if let Some(alpha) = self.parsed("search.hybrid_alpha")? {
            config.hybrid_alpha = alpha;
        }
        if let Some(n) = self.parsed("search.rerank_top_n")? {
            config.rerank_top_n = n;
        }
        if let Some(fallback) = self.parsed("search.fallback")? {
            config.fallback_to_nearest = fallback;
        }
        config.validate()?;
        Ok(config)
    }

    /// Built-in store retry policy overlaid with persisted settings.
    pub fn store_config(&self) -> Result<StoreConfig> {
        let mut config = StoreConfig::default();
        if let Some(attempts) = self.parsed::<u32>("store.write_attempts")? {
            config.write_attempts = attempts.max(1);
        }
        if let Some(ms) = self.parsed("store.backoff_ms")? {
            config.backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = self.parsed::<u64>("store.embed_timeout_secs")? {
            config.embed_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(config)
    }
}

fn is_known(key: &str) -> bool {
    KNOWN_SETTINGS.iter().any(|(k, _)| *k == key)
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn settings_crud() {
        let (_tmp, db) = test_db();

        assert_eq!(db.get_setting("model").unwrap(), None);
        assert_eq!(
            db.get_setting_or("model", "default-model").unwrap(),
            "default-model"
        );

        db.set_setting("model", "custom-model").unwrap();
        assert_eq!(
            db.get_setting("model").unwrap(),
            Some("custom-model".to_string())
        );
        assert_eq!(db.list_settings().unwrap().len(), 1);

        assert!(db.remove_setting("model").unwrap());
        assert!(!db.remove_setting("model").unwrap());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (_tmp, db) = test_db();
        assert!(matches!(
            db.set_setting("search.topk", "3").unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn search_config_defaults_without_settings() {
        let (_tmp, db) = test_db();
        assert_eq!(db.search_config().unwrap(), SearchConfig::default());
    }

    #[test]
    fn search_config_overlays_settings() {
        let (_tmp, db) = test_db();
        db.set_setting("search.mode", "rerank").unwrap();
        db.set_setting("search.top_k", "5").unwrap();
        db.set_setting("search.hybrid_alpha", "0.25").unwrap();
        db.set_setting("search.fallback", "true").unwrap();

        let config = db.search_config().unwrap();
        assert_eq!(config.mode, SearchMode::Rerank);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.hybrid_alpha, 0.25);
        assert!(config.fallback_to_nearest);
        assert_eq!(config.min_similarity, 0.7);
    }

    #[test]
    fn bad_values_name_the_key() {
        let (_tmp, db) = test_db();
        db.set_setting("search.top_k", "many").unwrap();
        let err = db.search_config().unwrap_err().to_string();
        assert!(err.contains("search.top_k"));

        db.set_setting("search.top_k", "3").unwrap();
        db.set_setting("search.min_similarity", "1.5").unwrap();
        assert!(db.search_config().is_err());
    }

    #[test]
    fn store_config_overlays_settings() {
        let (_tmp, db) = test_db();
        db.set_setting("store.write_attempts", "0").unwrap();
        db.set_setting("store.backoff_ms", "10").unwrap();
        db.set_setting("store.embed_timeout_secs", "0").unwrap();

        let config = db.store_config().unwrap();
        assert_eq!(config.write_attempts, 1);
        assert_eq!(config.backoff, Duration::from_millis(10));
        assert_eq!(config.embed_timeout, None);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.redb");

        {
            let db = ConfigDb::open(&path).unwrap();
            db.set_setting("search.top_k", "7").unwrap();
        }

        {
            let db = ConfigDb::open(&path).unwrap();
            assert_eq!(db.search_config().unwrap().top_k, 7);
        }
    }
}

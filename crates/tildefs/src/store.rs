//! Opening a store from configuration.

use crate::config::{ConfigError, StoreConfig};
use crate::error::FilestoreError;
use crate::filepath::Filepath;
use crate::transaction::Transaction;

/// An opened store: its configuration plus the top-level transaction.
#[derive(Debug, Clone)]
pub struct Filestore {
    config: StoreConfig,
    root: Transaction,
}

impl Filestore {
    /// Open the store described by `config`.
    ///
    /// The root must be absolute. Its own directory names are taken as they
    /// are; only names below it are validated.
    pub async fn open(config: &StoreConfig) -> Result<Self, ConfigError> {
        let real = config.absolute_root()?;
        let root = Filepath::from_real(&real)?;

        if config.create_root {
            tokio::fs::create_dir_all(root.resolve())
                .await
                .map_err(|e| FilestoreError::io("create root", root.resolve(), e))?;
        }

        tracing::info!(root = %root, "opened store");
        Ok(Self {
            config: config.clone(),
            root: Transaction::new(root),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The top-level transaction. Clones share one lock set.
    pub fn transaction(&self) -> &Transaction {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityType;

    #[tokio::test]
    async fn test_open_creates_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path().join("nested/store"));

        let store = Filestore::open(&config).await.unwrap();
        assert!(dir.path().join("nested/store").is_dir());

        let txn = store.transaction();
        assert_eq!(txn.get_type(txn.root()).await.unwrap(), EntityType::Node);
    }

    #[tokio::test]
    async fn test_open_without_create() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            root: dir.path().join("absent"),
            create_root: false,
        };

        let store = Filestore::open(&config).await.unwrap();
        assert!(!dir.path().join("absent").exists());

        // The first write brings the root into being.
        let txn = store.transaction();
        txn.set_data(&txn.path(["k"]).unwrap(), "v").await.unwrap();
        assert!(dir.path().join("absent/k").is_file());
    }

    #[tokio::test]
    async fn test_open_under_hidden_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join(".local/share/tildefs");
        let store = Filestore::open(&StoreConfig::new(&root)).await.unwrap();
        assert_eq!(store.config().root, root);

        let txn = store.transaction();
        let k = txn.path(["k"]).unwrap();
        txn.set_data(&k, "v").await.unwrap();
        assert_eq!(txn.get_string(&k).await.unwrap(), "v");
        assert!(root.join("k").is_file());
    }

    #[tokio::test]
    async fn test_open_default_style_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            root: dir.path().join("home+user").join("données"),
            create_root: true,
        };
        let store = Filestore::open(&config).await.unwrap();
        let txn = store.transaction();
        assert_eq!(txn.get_type(txn.root()).await.unwrap(), EntityType::Node);
    }
}

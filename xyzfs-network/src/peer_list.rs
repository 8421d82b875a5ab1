//! Known-peer list persisted between runs
//!
//! Stored as a JSON array of node names in `<meta_path>/gossip_nodes.json`.

use std::path::{Path, PathBuf};
use tracing::debug;
use xyzfs_core::error::Result;

pub const PEER_LIST_FILE: &str = "gossip_nodes.json";

#[derive(Debug, Clone)]
pub struct PeerListStore {
    path: PathBuf,
}

impl PeerListStore {
    pub fn new(meta_path: impl AsRef<Path>) -> Self {
        Self {
            path: meta_path.as_ref().join(PEER_LIST_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored peers; empty when nothing was saved yet.
    pub fn load(&self) -> Result<Vec<String>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, nodes: &[String]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut sorted = nodes.to_vec();
        sorted.sort();
        sorted.dedup();

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&sorted)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), peers = sorted.len(), "Peer list saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = PeerListStore::new(dir.path().join("meta"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = PeerListStore::new(dir.path().join("meta"));
        store
            .save(&["10.0.0.3".to_string(), "10.0.0.2".to_string(), "10.0.0.3".to_string()])
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw, r#"["10.0.0.2","10.0.0.3"]"#);
        assert_eq!(store.load().unwrap(), vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let store = PeerListStore::new(dir.path());
        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load().is_err());
    }
}

//! Snapshot to a single JSON file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tally_core::{Metric, Snapshot, codec};
use tracing::warn;

use super::{SinkFuture, SnapshotSink};
use crate::error::{Result, ServerError};

/// Writes the whole store as one JSON array, replacing the file each time.
///
/// The array is written to a sibling temp file first and renamed over the
/// target, so readers never observe a partial snapshot.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Creates a sink for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let json = codec::serialize(&snapshot.to_metrics())
            .map_err(|e| ServerError::Persistence(format!("cannot encode snapshot: {e}")))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.error("create dir", &e))?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &json)
            .await
            .map_err(|e| self.error("write", &e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.error("rename", &e))?;
        Ok(())
    }

    async fn read(&self) -> Result<Vec<Metric>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "snapshot file not found, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.error("read", &e)),
        };
        codec::deserialize(&bytes).map_err(|e| {
            ServerError::Persistence(format!("cannot decode {}: {e}", self.path.display()))
        })
    }

    fn error(&self, op: &str, err: &std::io::Error) -> ServerError {
        ServerError::Persistence(format!("cannot {op} {}: {err}", self.path.display()))
    }
}

impl SnapshotSink for FileSink {
    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> SinkFuture<'a, ()> {
        Box::pin(self.write(snapshot))
    }

    fn load(&self) -> SinkFuture<'_, Vec<Metric>> {
        Box::pin(self.read())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::MetricStore;
    use tempfile::TempDir;

    fn sink_in(dir: &TempDir) -> FileSink {
        FileSink::new(dir.path().join("metrics-db.json"))
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let store = MetricStore::new();
        store.add_counter("reqs", 8).unwrap();
        store.set_gauge("temp", 36.6).unwrap();

        sink.save(&store.snapshot()).await.unwrap();
        let loaded = sink.load().await.unwrap();

        assert_eq!(
            loaded,
            vec![Metric::counter("reqs", 8), Metric::gauge("temp", 36.6)]
        );
    }

    #[tokio::test]
    async fn test_file_is_one_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let store = MetricStore::new();
        store.set_gauge("temp", 1.5).unwrap();

        sink.save(&store.snapshot()).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json, serde_json::json!([{"id": "temp", "type": "gauge", "value": 1.5}]));
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let store = MetricStore::new();
        store.add_counter("a", 1).unwrap();
        store.add_counter("b", 1).unwrap();
        sink.save(&store.snapshot()).await.unwrap();

        let smaller = MetricStore::new();
        smaller.add_counter("c", 2).unwrap();
        sink.save(&smaller.snapshot()).await.unwrap();

        assert_eq!(sink.load().await.unwrap(), vec![Metric::counter("c", 2)]);
        assert!(!sink.temp_path().exists());
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sink_in(&dir).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        std::fs::write(sink.path(), "not json").unwrap();
        assert!(matches!(sink.load().await, Err(ServerError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("tmp").join("metrics-db.json"));
        sink.save(&Snapshot::default()).await.unwrap();
        assert_eq!(std::fs::read_to_string(sink.path()).unwrap(), "[]");
    }
}

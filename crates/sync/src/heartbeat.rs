//! Liveness signal emitted once per sync iteration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[async_trait::async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self) -> Result<()>;
}

/// Rewrites a file with the current UTC timestamp; a liveness probe checks its age.
#[derive(Debug, Clone)]
pub struct LivenessFile {
    path: PathBuf,
}

impl LivenessFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path from `KAPPLY_LIVENESS_FILE`, default `/tmp/liveness`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("KAPPLY_LIVENESS_FILE").unwrap_or_else(|_| "/tmp/liveness".to_string()))
    }

    pub fn path(&self) -> &Path { &self.path }
}

#[async_trait::async_trait]
impl Heartbeat for LivenessFile {
    async fn beat(&self) -> Result<()> {
        let stamp = chrono::Utc::now().to_rfc3339();
        tokio::fs::write(&self.path, stamp)
            .await
            .with_context(|| format!("writing liveness file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn beat_writes_a_timestamp() {
        let path = std::env::temp_dir().join(format!("kapply-liveness-{}", std::process::id()));
        let hb = LivenessFile::new(&path);
        assert_eq!(hb.path(), path.as_path());
        hb.beat().await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&written).is_ok(), "{written}");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unwritable_path_is_an_error() {
        let hb = LivenessFile::new("/nonexistent-dir/kapply/liveness");
        assert!(hb.beat().await.is_err());
    }
}

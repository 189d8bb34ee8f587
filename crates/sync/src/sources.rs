//! Source URL discovery: explicit URLs plus a directory with one URL per file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reqwest::Url;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct SourceList {
    pub urls: Vec<String>,
    pub dir: Option<PathBuf>,
}

impl SourceList {
    pub fn new(urls: Vec<String>, dir: Option<PathBuf>) -> Self {
        Self { urls, dir }
    }

    /// Current valid sources, explicit URLs first, then directory entries in name order.
    /// Invalid URLs are logged and skipped. A missing or unreadable directory is an error.
    pub async fn read(&self) -> Result<Vec<Url>> {
        let mut raw: Vec<(String, String)> = self.urls.iter().map(|u| ("argument".to_string(), u.clone())).collect();
        if let Some(dir) = &self.dir {
            raw.extend(read_dir_urls(dir).await?);
        }
        Ok(raw
            .into_iter()
            .filter_map(|(origin, candidate)| match validate(&candidate) {
                Some(url) => Some(url),
                None => {
                    warn!(origin = %origin, url = %candidate, "invalid source url; skipping");
                    None
                }
            })
            .collect())
    }
}

/// Only absolute http(s) URLs are accepted.
pub fn validate(candidate: &str) -> Option<Url> {
    let url = Url::parse(candidate.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

async fn read_dir_urls(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut rd = tokio::fs::read_dir(dir).await.with_context(|| format!("reading source dir {}", dir.display()))?;
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await.with_context(|| format!("listing {}", dir.display()))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        // mounted ConfigMaps keep their data under ..data and friends
        if name.starts_with("..") {
            continue;
        }
        let path = entry.path();
        if !tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            debug!(path = %path.display(), "not a file; skipping");
            continue;
        }
        let contents = tokio::fs::read_to_string(&path).await.with_context(|| format!("reading {}", path.display()))?;
        out.push((name, contents.trim().to_string()));
    }
    out.sort();
    Ok(out)
}

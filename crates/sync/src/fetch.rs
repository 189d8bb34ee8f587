//! HTTP fetching with `If-Modified-Since` revalidation against a [`SourceCache`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use tracing::debug;

/// Raw answer of one GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub last_modified: Option<String>,
    pub body: String,
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, if_modified_since: Option<&str>) -> Result<FetchResponse>;
}

fn fetch_timeout() -> Duration {
    let secs = std::env::var("KAPPLY_FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

/// Credentials sent with every source request, for sources behind auth.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum SourceAuth {
    #[default]
    Anonymous,
    Bearer(String),
    Basic { username: String, password: Option<String> },
}

impl fmt::Debug for SourceAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceAuth::Anonymous => f.write_str("Anonymous"),
            SourceAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            SourceAuth::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
        }
    }
}

impl SourceAuth {
    /// `KAPPLY_SOURCE_TOKEN` wins over `KAPPLY_SOURCE_USERNAME` / `KAPPLY_SOURCE_PASSWORD`.
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok();
        Self::from_values(var("KAPPLY_SOURCE_TOKEN"), var("KAPPLY_SOURCE_USERNAME"), var("KAPPLY_SOURCE_PASSWORD"))
    }

    pub fn from_values(token: Option<String>, username: Option<String>, password: Option<String>) -> Self {
        let set = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        match (set(token), set(username)) {
            (Some(token), _) => SourceAuth::Bearer(token),
            (None, Some(username)) => SourceAuth::Basic { username, password: set(password) },
            (None, None) => SourceAuth::Anonymous,
        }
    }

    fn sign(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            SourceAuth::Anonymous => req,
            SourceAuth::Bearer(token) => req.bearer_auth(token),
            SourceAuth::Basic { username, password } => req.basic_auth(username, password.as_deref()),
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    auth: SourceAuth,
}

impl HttpFetcher {
    /// Client with `KAPPLY_FETCH_TIMEOUT_SECS` and credentials from [`SourceAuth::from_env`].
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout())
            .user_agent(concat!("kapply/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        let auth = SourceAuth::from_env();
        debug!(?auth, "source credentials");
        Ok(Self { client, auth })
    }

    pub fn with_auth(mut self, auth: SourceAuth) -> Self {
        self.auth = auth;
        self
    }

    fn request(&self, url: &str, if_modified_since: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self.auth.sign(self.client.get(url));
        if let Some(ims) = if_modified_since {
            req = req.header(IF_MODIFIED_SINCE, ims);
        }
        req
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, if_modified_since: Option<&str>) -> Result<FetchResponse> {
        let resp = self
            .request(url, if_modified_since)
            .send().await.with_context(|| format!("GET {url}"))?;
        let status = resp.status().as_u16();
        let last_modified = resp.headers().get(LAST_MODIFIED).and_then(|v| v.to_str().ok()).map(str::to_string);
        let body = resp.text().await.with_context(|| format!("reading body of {url}"))?;
        debug!(url, status, ?last_modified, bytes = body.len(), "fetched");
        Ok(FetchResponse { status, last_modified, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedSource {
    last_modified: Option<String>,
    body: String,
}

/// Last successful body per URL with its `Last-Modified` validator. Starts empty and lives
/// only as long as its owner.
#[derive(Debug, Default)]
pub struct SourceCache {
    entries: HashMap<String, CachedSource>,
}

impl SourceCache {
    pub fn new() -> Self { Self::default() }

    pub fn last_modified(&self, url: &str) -> Option<&str> {
        self.entries.get(url).and_then(|e| e.last_modified.as_deref())
    }

    pub fn body(&self, url: &str) -> Option<&str> {
        self.entries.get(url).map(|e| e.body.as_str())
    }

    pub fn store(&mut self, url: &str, last_modified: Option<String>, body: String) {
        self.entries.insert(url.to_string(), CachedSource { last_modified, body });
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// GETs `url`, revalidating against the cache. 2xx refreshes the entry, 304 serves the
/// cached body, anything else is an error and leaves the cache alone.
pub async fn conditional_fetch(fetcher: &dyn Fetcher, cache: &mut SourceCache, url: &str) -> Result<String> {
    let ims = cache.last_modified(url).map(str::to_string);
    let res = fetcher.fetch(url, ims.as_deref()).await?;
    match res.status {
        200..=299 => {
            cache.store(url, res.last_modified, res.body.clone());
            Ok(res.body)
        }
        304 => match cache.body(url) {
            Some(body) => {
                debug!(url, "not modified; using cached body");
                Ok(body.to_string())
            }
            None => bail!("{url}: 304 Not Modified with nothing cached"),
        },
        status => bail!("{url}: status {status}: {}", res.body),
    }
}

/// Unconditional GET that must answer 2xx.
pub async fn fetch_text(fetcher: &dyn Fetcher, url: &str) -> Result<String> {
    let res = fetcher.fetch(url, None).await?;
    if !(200..300).contains(&res.status) {
        bail!("{url}: status {}: {}", res.status, res.body);
    }
    Ok(res.body)
}

//! Component catalog: which bundles exist and where their manifests live.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FILE_PATH: &str = "releases/{version}/resource.yaml";
pub const LATEST: &str = "latest";

/// ```yaml
/// fileSource: https://releases.example.io
/// filePath: "releases/{version}/resource.yaml"
/// components:
///   - name: remoteresource
///     dir: RemoteResource
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    #[serde(default)]
    pub file_source: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    /// Path segment between the file source and the file path.
    pub dir: String,
}

/// `--component name[=version]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentPin {
    pub name: String,
    pub version: Option<String>,
}

impl std::str::FromStr for ComponentPin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = match s.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim())),
            None => (s.trim(), None),
        };
        if name.is_empty() {
            return Err(format!("invalid component '{s}': expected name[=version]"));
        }
        Ok(Self { name: name.to_string(), version: version.filter(|v| !v.is_empty()).map(str::to_string) })
    }
}

/// A component picked for this run with its resolved version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected<'a> {
    pub component: &'a Component,
    pub version: String,
}

impl Catalog {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(text).context("parsing catalog")?;
        if catalog.components.is_empty() {
            bail!("catalog lists no components");
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading catalog {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading catalog {}", path.display()))
    }

    /// Pinned components in catalog order, or every component at `latest` when nothing is pinned.
    pub fn select(&self, pins: &[ComponentPin]) -> Result<Vec<Selected<'_>>> {
        for pin in pins {
            if !self.components.iter().any(|c| c.name == pin.name) {
                let known: Vec<&str> = self.components.iter().map(|c| c.name.as_str()).collect();
                bail!("unknown component '{}'; catalog has: {}", pin.name, known.join(", "));
            }
        }
        Ok(self
            .components
            .iter()
            .filter_map(|c| {
                if pins.is_empty() {
                    return Some(Selected { component: c, version: LATEST.to_string() });
                }
                pins.iter().find(|p| p.name == c.name).map(|p| Selected {
                    component: c,
                    version: p.version.clone().unwrap_or_else(|| LATEST.to_string()),
                })
            })
            .collect())
    }
}

/// Where component bundles are downloaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    source: String,
    path: String,
}

impl FileLocation {
    /// Flag values win over catalog values; the path falls back to [`DEFAULT_FILE_PATH`].
    pub fn resolve(catalog: &Catalog, file_source: Option<&str>, file_path: Option<&str>) -> Result<Self> {
        let source = file_source
            .or(catalog.file_source.as_deref())
            .ok_or_else(|| anyhow!("no file source: pass --file-source or set fileSource in the catalog"))?;
        if kapply_sync::sources::validate(source).is_none() {
            bail!("'{source}' is not a valid source url");
        }
        let path = file_path.or(catalog.file_path.as_deref()).unwrap_or(DEFAULT_FILE_PATH);
        Ok(Self { source: source.trim_end_matches('/').to_string(), path: path.trim_start_matches('/').to_string() })
    }

    pub fn url(&self, component: &Component, version: &str) -> String {
        format!("{}/{}/{}", self.source, component.dir, self.path.replace("{version}", version))
    }
}

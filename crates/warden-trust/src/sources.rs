use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use warden_core::fsutil;

use crate::error::{Result, TrustError};

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustedSource {
    pub domain: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub require_signature: bool,
    /// Lower-cased. Empty means any publisher on this domain.
    #[serde(default)]
    pub trusted_publishers: BTreeSet<String>,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
}

fn enabled_default() -> bool {
    true
}

impl TrustedSource {
    pub fn new<I, S>(domain: &str, require_signature: bool, publishers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domain: normalize_domain(domain),
            enabled: true,
            require_signature,
            trusted_publishers: publishers
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            added_at: Some(Utc::now()),
        }
    }

    pub fn allows_publisher(&self, publisher: Option<&str>) -> bool {
        match publisher {
            Some(p) if !self.trusted_publishers.is_empty() => {
                self.trusted_publishers.contains(&p.trim().to_lowercase())
            }
            _ => true,
        }
    }
}

/// Registry seeded on first run.
pub fn default_sources() -> Vec<TrustedSource> {
    vec![
        TrustedSource::new(
            "huggingface.co",
            false,
            ["meta-llama", "microsoft", "mistralai", "google", "qwen", "thebloke"],
        ),
        TrustedSource::new("ollama.com", false, Vec::<String>::new()),
        TrustedSource::new("github.com", true, Vec::<String>::new()),
    ]
}

/// Lower-case, drop a trailing dot and a leading `www.`.
pub fn normalize_domain(domain: &str) -> String {
    let d = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    match d.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => d,
    }
}

/// Host of `source` normalised for registry lookup. Inputs without a scheme
/// are read as `https://`.
pub fn domain_from_url(source: &str) -> Result<String> {
    let trimmed = source.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(u) if u.host_str().is_some() => u,
        _ => Url::parse(&format!("https://{trimmed}"))
            .map_err(|e| TrustError::InvalidUrl(format!("{source}: {e}")))?,
    };
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(normalize_domain(host)),
        _ => Err(TrustError::InvalidUrl(source.to_string())),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SourcesFile {
    version: u32,
    #[serde(default)]
    sources: Vec<TrustedSource>,
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    path: Option<PathBuf>,
    sources: BTreeMap<String, TrustedSource>,
}

impl SourceRegistry {
    /// Defaults only, never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sources: index(default_sources()),
        }
    }

    /// Load `path`, seeding and persisting the defaults when it does not exist.
    pub fn load_or_seed(path: &Path) -> Result<Self> {
        match fsutil::read_json_opt::<SourcesFile>(path)? {
            Some(file) => {
                let sources = index(file.sources);
                debug!(path = %path.display(), count = sources.len(), "trusted sources loaded");
                Ok(Self {
                    path: Some(path.to_path_buf()),
                    sources,
                })
            }
            None => {
                let reg = Self {
                    path: Some(path.to_path_buf()),
                    sources: index(default_sources()),
                };
                reg.save()?;
                info!(path = %path.display(), "seeded default trusted sources");
                Ok(reg)
            }
        }
    }

    pub fn get(&self, domain: &str) -> Option<&TrustedSource> {
        self.sources.get(&normalize_domain(domain))
    }

    pub fn list(&self) -> Vec<TrustedSource> {
        self.sources.values().cloned().collect()
    }

    /// Insert or replace the entry for `source.domain`, keeping the original
    /// `added_at` on replacement.
    pub fn upsert(&mut self, mut source: TrustedSource) -> Result<()> {
        source.domain = normalize_domain(&source.domain);
        if source.domain.is_empty() {
            return Err(TrustError::InvalidUrl("empty domain".into()));
        }
        if let Some(existing) = self.sources.get(&source.domain) {
            source.added_at = existing.added_at.or(source.added_at);
        }
        self.sources.insert(source.domain.clone(), source);
        self.save()
    }

    pub fn remove(&mut self, domain: &str) -> Result<bool> {
        let removed = self.sources.remove(&normalize_domain(domain)).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn set_enabled(&mut self, domain: &str, enabled: bool) -> Result<bool> {
        match self.sources.get_mut(&normalize_domain(domain)) {
            Some(src) => {
                src.enabled = enabled;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let file = SourcesFile {
                version: REGISTRY_VERSION,
                sources: self.list(),
            };
            fsutil::write_json_atomic(path, &file)?;
        }
        Ok(())
    }
}

fn index(sources: Vec<TrustedSource>) -> BTreeMap<String, TrustedSource> {
    sources
        .into_iter()
        .map(|mut s| {
            s.domain = normalize_domain(&s.domain);
            s.trusted_publishers = s
                .trusted_publishers
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect();
            (s.domain.clone(), s)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn domains_normalise() {
        assert_eq!(normalize_domain("WWW.HuggingFace.co."), "huggingface.co");
        assert_eq!(normalize_domain("ollama.com"), "ollama.com");
        assert_eq!(
            domain_from_url("https://www.huggingface.co/microsoft/phi-2").unwrap(),
            "huggingface.co"
        );
        assert_eq!(
            domain_from_url("huggingface.co/TheBloke/x").unwrap(),
            "huggingface.co"
        );
        assert_eq!(domain_from_url("http://GitHub.com:8443/a").unwrap(), "github.com");
        assert!(domain_from_url("").is_err());
    }

    #[test]
    fn publisher_rules() {
        let src = TrustedSource::new("huggingface.co", false, ["Microsoft"]);
        assert!(src.allows_publisher(Some("MICROSOFT")));
        assert!(src.allows_publisher(None));
        assert!(!src.allows_publisher(Some("someone-else")));

        let open = TrustedSource::new("ollama.com", false, Vec::<String>::new());
        assert!(open.allows_publisher(Some("anyone")));
    }

    #[test]
    fn seeded_registry_persists_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trusted_sources.json");
        let mut reg = SourceRegistry::load_or_seed(&path).unwrap();
        assert!(path.exists());
        assert!(reg.get("huggingface.co").unwrap().allows_publisher(Some("qwen")));
        assert!(reg.get("github.com").unwrap().require_signature);

        reg.upsert(TrustedSource::new("www.models.internal", true, ["acme"]))
            .unwrap();
        assert!(reg.set_enabled("ollama.com", false).unwrap());
        assert!(reg.remove("github.com").unwrap());
        assert!(!reg.remove("github.com").unwrap());

        let reg = SourceRegistry::load_or_seed(&path).unwrap();
        assert!(reg.get("models.internal").is_some());
        assert!(!reg.get("ollama.com").unwrap().enabled);
        assert!(reg.get("github.com").is_none());
        assert_eq!(reg.list().len(), 3);
    }

    #[test]
    fn upsert_keeps_added_at() {
        let mut reg = SourceRegistry::in_memory();
        let original = reg.get("huggingface.co").unwrap().added_at;
        reg.upsert(TrustedSource::new("huggingface.co", true, ["google"]))
            .unwrap();
        let src = reg.get("huggingface.co").unwrap();
        assert_eq!(src.added_at, original);
        assert!(src.require_signature);
        assert!(!src.allows_publisher(Some("microsoft")));
    }
}

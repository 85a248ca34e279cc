//! Configuration provider: site catalog and credential list.
//!
//! Sites come from a JSON object keyed by site key; declaration order is
//! preserved and becomes the run order. Credentials come from a JSON list.
//! Both are read-only to the engine; the state store mirrors sites, never
//! the other way around.

use std::path::Path;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;

fn default_checkin_path() -> String {
    "/api/user/checkin".to_string()
}

/// One site record as declared in `sites.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Display name; falls back to the site key.
    #[serde(default)]
    pub name: Option<String>,

    /// Origin, scheme included (e.g. `https://api.example.com`).
    pub domain: String,

    #[serde(default = "default_checkin_path")]
    pub checkin_path: String,

    /// OAuth client id at the identity provider; discovered by probing
    /// when absent.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Site sits behind a script-challenge WAF.
    #[serde(default)]
    pub needs_waf: bool,

    #[serde(default)]
    pub skip: bool,

    #[serde(default)]
    pub skip_reason: Option<String>,

    /// Labels allowed on this site; absent = every configured credential.
    #[serde(default)]
    pub accounts: Option<Vec<String>>,
}

/// Ordered site catalog.
#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    entries: Vec<(String, SiteConfig)>,
}

impl SiteCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read site catalog: {}", path.display()))?;

        // Deserialize through serde_json::Map (preserve_order) so the
        // declaration order survives into the run order.
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse site catalog: {}", path.display()))?;

        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let cfg: SiteConfig = serde_json::from_value(value)
                .with_context(|| format!("Invalid site entry: {key}"))?;
            entries.push((key, cfg));
        }

        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<(String, SiteConfig)>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SiteConfig)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One identity-provider login. The secret is write-only into the
/// automation layer: `SecretString` never serializes and never appears in
/// Debug output.
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub login: String,
    pub secret: SecretString,
    /// Human-readable grouping key; also the account key in site state.
    pub label: String,
}

/// Load the credential list from `accounts.json`.
pub fn load_credentials(path: &Path) -> Result<Vec<Credential>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials: {}", path.display()))?;
    let credentials: Vec<Credential> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse credentials: {}", path.display()))?;
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn catalog_preserves_declaration_order() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sites.json");
        let mut file = std::fs::File::create(&path)?;
        write!(
            file,
            r#"{{
                "zeta": {{"domain": "https://zeta.example"}},
                "alpha": {{"domain": "https://alpha.example"}}
            }}"#
        )?;

        let catalog = SiteCatalog::load(&path)?;
        let keys: Vec<&str> = catalog.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        Ok(())
    }

    #[test]
    fn site_defaults_applied() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sites.json");
        std::fs::write(&path, r#"{"a": {"domain": "https://a.example"}}"#)?;

        let catalog = SiteCatalog::load(&path)?;
        let (_, cfg) = catalog.iter().next().unwrap();
        assert_eq!(cfg.checkin_path, "/api/user/checkin");
        assert!(!cfg.needs_waf);
        assert!(!cfg.skip);
        assert!(cfg.accounts.is_none());
        Ok(())
    }

    #[test]
    fn credential_secret_never_debug_printed() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"[{"login": "a@example.com", "secret": "hunter2", "label": "alice"}]"#,
        )?;

        let credentials = load_credentials(&path)?;
        assert_eq!(credentials.len(), 1);
        let debug = format!("{:?}", credentials[0]);
        assert!(!debug.contains("hunter2"));
        Ok(())
    }
}

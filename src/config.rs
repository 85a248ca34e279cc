use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_sites_file() -> PathBuf {
    PathBuf::from("sites.json")
}

fn default_accounts_file() -> PathBuf {
    PathBuf::from("accounts.json")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("site_info.json")
}

fn default_results_file() -> PathBuf {
    PathBuf::from("checkin_results.json")
}

/// Identity-provider and OAuth flow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OauthConfig {
    /// Authorization endpoint of the shared identity provider.
    pub authorize_url: String,

    /// Benign endpoint navigated first so protection layers see a prior
    /// visit before the login page is requested.
    pub trust_url: String,

    /// Login page of the identity provider.
    pub login_url: String,

    /// Host of the consent page; the allow affordance lives here.
    pub consent_host: String,

    /// Matcher for the consent page's single allow affordance.
    pub consent_selector: String,

    pub scope: String,

    /// Path on the target site the provider redirects back to.
    pub redirect_path: String,

    /// Cookie name the fleet's deployments issue on session grant.
    pub session_cookie: String,

    /// Per-site wait budget for the slow path.
    pub site_wait_secs: u64,

    /// Fixed polling interval inside the wait loops.
    pub poll_interval_secs: u64,
}

impl Default for OauthConfig {
    fn default() -> Self {
        Self {
            authorize_url: "https://connect.linux.do/oauth2/authorize".to_string(),
            trust_url: "https://linux.do/session/csrf".to_string(),
            login_url: "https://linux.do/login".to_string(),
            consent_host: "connect.linux.do".to_string(),
            consent_selector: "text=允许".to_string(),
            scope: "read write".to_string(),
            redirect_path: "/api/oauth/linuxdo".to_string(),
            session_cookie: "session".to_string(),
            site_wait_secs: 180,
            poll_interval_secs: 2,
        }
    }
}

/// Run-mode and failure-budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run credential groups concurrently, one browser each.
    pub parallel: bool,

    /// Below this much available memory, parallel mode degrades to serial
    /// (each group holds a whole Chrome profile).
    pub min_parallel_memory_mb: u64,

    /// Consecutive per-site slow-path failures that abandon the rest of a
    /// group.
    pub max_consecutive_failures: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            min_parallel_memory_mb: 3072,
            max_consecutive_failures: 5,
        }
    }
}

/// Anti-bot challenge sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub node_binary: String,
    pub timeout_secs: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Application configuration, loaded from `rollcall.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory; relative paths below resolve against it. Defaults
    /// to the config file's directory.
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_sites_file")]
    pub sites_file: PathBuf,

    #[serde(default = "default_accounts_file")]
    pub accounts_file: PathBuf,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    #[serde(default = "default_results_file")]
    pub results_file: PathBuf,

    #[serde(default)]
    pub oauth: OauthConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub challenge: ChallengeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            sites_file: default_sites_file(),
            accounts_file: default_accounts_file(),
            state_file: default_state_file(),
            results_file: default_results_file(),
            oauth: OauthConfig::default(),
            run: RunConfig::default(),
            challenge: ChallengeConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return defaults if it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => config_dir.join(dir),
            None => config_dir.to_path_buf(),
        }
    }

    /// Resolve every file path against the config file's directory.
    pub fn resolve(self, config_path: &Path) -> ResolvedConfig {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        let data_dir = self.resolve_data_dir(config_dir);
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                data_dir.join(p)
            }
        };

        ResolvedConfig {
            sites_file: join(&self.sites_file),
            accounts_file: join(&self.accounts_file),
            state_file: join(&self.state_file),
            results_file: join(&self.results_file),
            data_dir,
            oauth: self.oauth,
            run: self.run,
            challenge: self.challenge,
        }
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub sites_file: PathBuf,
    pub accounts_file: PathBuf,
    pub state_file: PathBuf,
    pub results_file: PathBuf,
    pub oauth: OauthConfig,
    pub run: RunConfig,
    pub challenge: ChallengeConfig,
}

/// Default config file path: `./rollcall.toml` if present, else the XDG
/// data directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("rollcall.toml");
    if local.exists() {
        return local;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("rollcall").join("rollcall.toml");
    }

    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.run.parallel);
        assert_eq!(config.run.max_consecutive_failures, 5);
        assert_eq!(config.oauth.site_wait_secs, 180);
        assert_eq!(config.oauth.poll_interval_secs, 2);
        assert_eq!(config.oauth.session_cookie, "session");
        assert_eq!(config.challenge.timeout_secs, 10);
    }

    #[test]
    fn load_overrides_sections() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("rollcall.toml");

        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "[run]")?;
        writeln!(file, "parallel = false")?;
        writeln!(file, "max_consecutive_failures = 2")?;
        writeln!(file, "[oauth]")?;
        writeln!(file, "site_wait_secs = 60")?;

        let config = Config::load(&path)?;
        assert!(!config.run.parallel);
        assert_eq!(config.run.max_consecutive_failures, 2);
        assert_eq!(config.oauth.site_wait_secs, 60);
        // Untouched sections keep defaults.
        assert_eq!(config.oauth.session_cookie, "session");
        Ok(())
    }

    #[test]
    fn resolve_joins_relative_paths_against_data_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "data_dir = \"./data\"\n")?;

        let resolved = Config::load(&path)?.resolve(&path);
        assert_eq!(resolved.data_dir, dir.path().join("data"));
        assert_eq!(resolved.sites_file, dir.path().join("data").join("sites.json"));
        Ok(())
    }

    #[test]
    fn load_or_default_missing_file() -> Result<()> {
        let dir = TempDir::new()?;
        let config = Config::load_or_default(&dir.path().join("missing.toml"))?;
        assert_eq!(config.state_file, PathBuf::from("site_info.json"));
        Ok(())
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provider::SiteConfig;

use super::AccountState;

/// Per-site state persisted in the snapshot: config mirror + probe results
/// + the per-label account map.
///
/// Probe-result fields (`alive`, `has_waf`, `version`, `checkin_enabled`,
/// `min_trust_level`) are sticky: a config sync never touches them, only a
/// fresh probe does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteState {
    pub domain: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    pub checkin_path: String,

    /// Reachability observed this run; `Some(false)` short-circuits all
    /// remaining attempts against the site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_waf: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_waf: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trust_level: Option<i64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Soft delete: site disappeared from config, history kept.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,

    #[serde(default)]
    pub accounts: BTreeMap<String, AccountState>,
}

impl SiteState {
    /// Fresh state for a site first seen in config.
    pub fn from_config(key: &str, cfg: &SiteConfig, allowed: &[String]) -> Self {
        let mut accounts = BTreeMap::new();
        if !cfg.skip {
            for label in allowed {
                accounts.insert(label.clone(), AccountState::default());
            }
        }
        Self {
            domain: cfg.domain.clone(),
            name: cfg.name.clone().unwrap_or_else(|| key.to_string()),
            client_id: cfg.client_id.clone(),
            checkin_path: cfg.checkin_path.clone(),
            alive: None,
            needs_waf: cfg.needs_waf,
            has_waf: None,
            version: None,
            checkin_enabled: None,
            min_trust_level: None,
            skip: cfg.skip,
            skip_reason: cfg.skip_reason.clone(),
            removed: false,
            accounts,
        }
    }

    /// Overwrite config-controlled fields only; probe results stay put.
    pub fn apply_config(&mut self, key: &str, cfg: &SiteConfig) {
        self.removed = false;
        self.domain = cfg.domain.clone();
        self.name = cfg.name.clone().unwrap_or_else(|| key.to_string());
        if cfg.client_id.is_some() {
            self.client_id = cfg.client_id.clone();
        }
        self.checkin_path = cfg.checkin_path.clone();
        self.needs_waf = cfg.needs_waf;
        if cfg.skip {
            self.skip = true;
            self.skip_reason = cfg.skip_reason.clone();
        } else {
            self.skip = false;
            self.skip_reason = None;
        }
    }

    /// Merge a probe result into the sticky fields.
    pub fn apply_probe(&mut self, probe: &SiteProbe) {
        self.alive = Some(true);
        if let Some(client_id) = &probe.client_id {
            self.client_id = Some(client_id.clone());
        }
        if let Some(name) = &probe.system_name {
            if !name.is_empty() {
                self.name = name.clone();
            }
        }
        if probe.version.is_some() {
            self.version = probe.version.clone();
        }
        if probe.checkin_enabled.is_some() {
            self.checkin_enabled = probe.checkin_enabled;
        }
        if probe.min_trust_level.is_some() {
            self.min_trust_level = probe.min_trust_level;
        }
    }

    /// Site takes part in this run.
    pub fn active(&self) -> bool {
        !self.skip && !self.removed
    }
}

/// Values discovered from a site's public status endpoint.
#[derive(Debug, Clone, Default)]
pub struct SiteProbe {
    pub client_id: Option<String>,
    pub system_name: Option<String>,
    pub version: Option<String>,
    pub checkin_enabled: Option<bool>,
    pub min_trust_level: Option<i64>,
}

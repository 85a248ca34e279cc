//! Durable snapshot of per-site / per-account state.
//!
//! The snapshot file is the single source of truth read at the start of
//! every run. Site and credential definitions are mirrored in from the
//! config provider by [`StateStore::sync`]; probe results and account
//! outcomes are written back by the orchestrator. Every externally
//! observable change rewrites the whole snapshot through a temp file +
//! rename, so an interrupted run leaves the last fully-written snapshot.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::models::{AccountState, CheckinStatus, RunMeta, RunSummary, SiteState};
use crate::provider::{Credential, SiteCatalog};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(rename = "_meta", default)]
    meta: RunMeta,

    #[serde(flatten)]
    sites: BTreeMap<String, SiteState>,
}

/// A change detected while merging config into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncChange {
    NewSite(String),
    NewAccount { site: String, label: String },
    RemovedSite(String),
    UnknownLabels { site: String, labels: Vec<String> },
}

impl fmt::Display for SyncChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncChange::NewSite(site) => write!(f, "[NEW] {site}"),
            SyncChange::NewAccount { site, label } => write!(f, "[NEW ACCOUNT] {site}: {label}"),
            SyncChange::RemovedSite(site) => write!(f, "[REMOVED] {site}"),
            SyncChange::UnknownLabels { site, labels } => {
                write!(f, "[WARN] {site}: unknown accounts {labels:?}")
            }
        }
    }
}

pub struct StateStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    file: StateFile,
}

impl StateStore {
    /// Load the snapshot, or start empty when the file doesn't exist yet.
    pub fn load(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file: {}", path.display()))
            }
        };
        Ok(Self { path, clock, file })
    }

    /// Merge the config provider's output into the snapshot.
    ///
    /// New sites get all-pending account entries; existing sites have only
    /// config-controlled fields overwritten (probe results stay sticky);
    /// labels no longer allowed are marked excluded, not deleted; sites
    /// absent from the catalog are soft-deleted with `removed`. Running
    /// sync twice with the same catalog yields an identical snapshot.
    pub fn sync(
        &mut self,
        catalog: &SiteCatalog,
        credentials: &[Credential],
    ) -> Result<Vec<SyncChange>> {
        let today = self.clock.today();
        self.file.meta.checkin_date = Some(today);
        let all_labels: Vec<String> = credentials.iter().map(|c| c.label.clone()).collect();

        let mut changes = Vec::new();

        for (key, cfg) in catalog.iter() {
            let mut allowed: Vec<String> = match &cfg.accounts {
                Some(list) => list.clone(),
                None => all_labels.clone(),
            };
            let unknown: Vec<String> = allowed
                .iter()
                .filter(|l| !all_labels.contains(l))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                changes.push(SyncChange::UnknownLabels {
                    site: cfg.name.clone().unwrap_or_else(|| key.to_string()),
                    labels: unknown.clone(),
                });
                allowed.retain(|l| all_labels.contains(l));
            }

            match self.file.sites.entry(key.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(SiteState::from_config(key, cfg, &allowed));
                    changes.push(SyncChange::NewSite(
                        cfg.name.clone().unwrap_or_else(|| key.to_string()),
                    ));
                }
                Entry::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    entry.apply_config(key, cfg);
                    if !cfg.skip {
                        for label in &allowed {
                            if !entry.accounts.contains_key(label) {
                                entry
                                    .accounts
                                    .insert(label.clone(), AccountState::default());
                                changes.push(SyncChange::NewAccount {
                                    site: entry.name.clone(),
                                    label: label.clone(),
                                });
                            }
                        }
                        for (label, account) in entry.accounts.iter_mut() {
                            account.excluded = !allowed.contains(label);
                        }
                    }
                }
            }
        }

        for (key, entry) in self.file.sites.iter_mut() {
            if !catalog.contains(key) && !entry.removed {
                entry.removed = true;
                changes.push(SyncChange::RemovedSite(entry.name.clone()));
            }
        }

        self.save()?;
        Ok(changes)
    }

    pub fn site(&self, key: &str) -> Option<&SiteState> {
        self.file.sites.get(key)
    }

    pub fn sites(&self) -> impl Iterator<Item = (&str, &SiteState)> {
        self.file.sites.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn account(&self, key: &str, label: &str) -> Option<&AccountState> {
        self.file.sites.get(key)?.accounts.get(label)
    }

    /// Effective, day-aware status for one pair.
    pub fn effective_status(&self, key: &str, label: &str) -> CheckinStatus {
        let today = self.clock.today();
        self.account(key, label)
            .map(|a| a.effective_status(today))
            .unwrap_or_default()
    }

    /// True when the pair resolved to success/already_checked today.
    pub fn done_today(&self, key: &str, label: &str) -> bool {
        self.effective_status(key, label).is_done()
    }

    /// Mutate site-level fields, then persist.
    pub fn update_site(&mut self, key: &str, f: impl FnOnce(&mut SiteState)) -> Result<()> {
        if let Some(site) = self.file.sites.get_mut(key) {
            f(site);
            self.save()?;
        }
        Ok(())
    }

    /// Mutate one account's fields, then persist. Creates the entry when
    /// it is missing (a probe may discover a site before sync saw it).
    pub fn update_account(
        &mut self,
        key: &str,
        label: &str,
        f: impl FnOnce(&mut AccountState),
    ) -> Result<()> {
        if let Some(site) = self.file.sites.get_mut(key) {
            let account = site.accounts.entry(label.to_string()).or_default();
            f(account);
            self.save()?;
        }
        Ok(())
    }

    /// Record a resolution for one pair: status, date = today, message.
    pub fn resolve_account(
        &mut self,
        key: &str,
        label: &str,
        status: CheckinStatus,
        message: Option<String>,
    ) -> Result<()> {
        let today = self.clock.today();
        self.update_account(key, label, |account| {
            account.checkin_status = status;
            account.checkin_date = Some(today);
            account.checkin_msg = message;
        })
    }

    /// Recompute the derived summary and rewrite the whole snapshot.
    pub fn save(&mut self) -> Result<()> {
        self.file.meta.last_run = Some(self.clock.now());
        self.file.meta.summary = Some(self.summary());

        let content =
            serde_json::to_string_pretty(&self.file).context("Failed to serialize state")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory: {}", parent.display())
                })?;
            }
        }

        // Whole-snapshot rewrite through a sibling temp file; a crash mid
        // write leaves the previous snapshot intact.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;
        Ok(())
    }

    /// Derived counts over the whole snapshot, using effective statuses so
    /// yesterday's resolutions count as pending today.
    pub fn summary(&self) -> RunSummary {
        let today = self.clock.today();
        let mut summary = RunSummary::default();

        for site in self.file.sites.values() {
            if site.removed {
                summary.removed_sites += 1;
                continue;
            }
            if site.skip {
                summary.skipped_sites += 1;
                continue;
            }
            summary.active_sites += 1;
            for account in site.accounts.values() {
                if account.excluded {
                    continue;
                }
                summary.total_tasks += 1;
                match account.effective_status(today) {
                    CheckinStatus::Success => summary.success += 1,
                    CheckinStatus::AlreadyChecked => summary.already_checked += 1,
                    CheckinStatus::Failed => summary.failed += 1,
                    CheckinStatus::Pending => summary.pending += 1,
                }
            }
        }
        summary.total_sites = summary.active_sites + summary.skipped_sites;
        summary
    }

    pub fn meta(&self) -> &RunMeta {
        &self.file.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::provider::SiteConfig;
    use secrecy::SecretString;
    use tempfile::TempDir;

    fn credential(label: &str) -> Credential {
        Credential {
            login: format!("{label}@example.com"),
            secret: SecretString::from("pw"),
            label: label.to_string(),
        }
    }

    fn site(domain: &str, accounts: Option<Vec<&str>>) -> SiteConfig {
        SiteConfig {
            name: None,
            domain: domain.to_string(),
            checkin_path: "/api/user/checkin".to_string(),
            client_id: None,
            needs_waf: false,
            skip: false,
            skip_reason: None,
            accounts: accounts.map(|v| v.into_iter().map(String::from).collect()),
        }
    }

    fn fixed_clock(date: &str) -> Arc<dyn Clock> {
        Arc::new(FixedClock::on_date(date.parse().unwrap()))
    }

    #[test]
    fn sync_creates_pending_accounts_for_new_site() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;

        let catalog = SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", None))]);
        let creds = vec![credential("alice"), credential("bob")];

        let changes = store.sync(&catalog, &creds)?;
        assert_eq!(changes, vec![SyncChange::NewSite("a".to_string())]);

        let state = store.site("a").unwrap();
        assert_eq!(state.accounts.len(), 2);
        assert_eq!(
            store.effective_status("a", "alice"),
            CheckinStatus::Pending
        );
        Ok(())
    }

    #[test]
    fn sync_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let catalog = SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", None))]);
        let creds = vec![credential("alice")];

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        store.sync(&catalog, &creds)?;
        let first = std::fs::read_to_string(&path)?;

        store.sync(&catalog, &creds)?;
        let second = std::fs::read_to_string(&path)?;
        assert_eq!(first, second);

        // No duplicate NEW entries on the second pass.
        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        let changes = store.sync(&catalog, &creds)?;
        assert!(changes.is_empty());
        Ok(())
    }

    #[test]
    fn sync_marks_missing_sites_removed_and_revives_returned_ones() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let creds = vec![credential("alice")];
        let both = SiteCatalog::from_entries(vec![
            ("a".into(), site("https://a.example", None)),
            ("b".into(), site("https://b.example", None)),
        ]);
        let only_a = SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", None))]);

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        store.sync(&both, &creds)?;
        let changes = store.sync(&only_a, &creds)?;
        assert!(changes.contains(&SyncChange::RemovedSite("b".to_string())));
        assert!(store.site("b").unwrap().removed);

        // Site returns to config: the flag clears, history intact.
        store.sync(&both, &creds)?;
        assert!(!store.site("b").unwrap().removed);
        Ok(())
    }

    #[test]
    fn sync_excludes_disallowed_labels_without_deleting() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let creds = vec![credential("alice"), credential("bob")];

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        let all = SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", None))]);
        store.sync(&all, &creds)?;
        store.resolve_account("a", "bob", CheckinStatus::Success, None)?;

        let restricted =
            SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", Some(vec!["alice"])))]);
        store.sync(&restricted, &creds)?;

        let bob = store.account("a", "bob").unwrap();
        assert!(bob.excluded);
        assert_eq!(bob.checkin_status, CheckinStatus::Success);

        // Re-allowing clears the exclusion.
        store.sync(&all, &creds)?;
        assert!(!store.account("a", "bob").unwrap().excluded);
        Ok(())
    }

    #[test]
    fn sync_warns_on_unknown_labels() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let creds = vec![credential("alice")];
        let catalog = SiteCatalog::from_entries(vec![(
            "a".into(),
            site("https://a.example", Some(vec!["alice", "ghost"])),
        )]);

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        let changes = store.sync(&catalog, &creds)?;
        assert!(changes.iter().any(|c| matches!(
            c,
            SyncChange::UnknownLabels { labels, .. } if labels == &vec!["ghost".to_string()]
        )));
        assert!(!store.site("a").unwrap().accounts.contains_key("ghost"));
        Ok(())
    }

    #[test]
    fn yesterdays_success_reads_pending_today_but_survives_save() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let creds = vec![credential("alice")];
        let catalog = SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", None))]);

        let mut store = StateStore::load(&path, fixed_clock("2026-08-06"))?;
        store.sync(&catalog, &creds)?;
        store.resolve_account("a", "alice", CheckinStatus::Success, Some("done".into()))?;
        assert!(store.done_today("a", "alice"));

        // Next day: the stored value reads as pending without being
        // rewritten, even across sync + save + reload.
        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        store.sync(&catalog, &creds)?;
        assert_eq!(store.effective_status("a", "alice"), CheckinStatus::Pending);
        let stored = store.account("a", "alice").unwrap();
        assert_eq!(stored.checkin_status, CheckinStatus::Success);
        assert_eq!(stored.checkin_date, Some("2026-08-06".parse().unwrap()));

        let summary = store.summary();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.success, 0);
        Ok(())
    }

    #[test]
    fn same_day_roundtrip_is_identity() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let creds = vec![credential("alice")];
        let catalog = SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", None))]);

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        store.sync(&catalog, &creds)?;
        store.resolve_account("a", "alice", CheckinStatus::AlreadyChecked, None)?;
        let before = std::fs::read_to_string(&path)?;

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        store.save()?;
        let after = std::fs::read_to_string(&path)?;
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn skipped_sites_never_count_as_pending() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let creds = vec![credential("alice")];
        let mut skipped = site("https://a.example", None);
        skipped.skip = true;
        skipped.skip_reason = Some("down for maintenance".into());
        let catalog = SiteCatalog::from_entries(vec![("a".into(), skipped)]);

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        store.sync(&catalog, &creds)?;

        let summary = store.summary();
        assert_eq!(summary.skipped_sites, 1);
        assert_eq!(summary.total_tasks, 0);
        assert_eq!(summary.pending, 0);
        Ok(())
    }

    #[test]
    fn probe_results_survive_sync() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        let creds = vec![credential("alice")];
        let catalog = SiteCatalog::from_entries(vec![("a".into(), site("https://a.example", None))]);

        let mut store = StateStore::load(&path, fixed_clock("2026-08-07"))?;
        store.sync(&catalog, &creds)?;
        store.update_site("a", |s| {
            s.alive = Some(true);
            s.version = Some("v1.2.3".into());
            s.client_id = Some("cid-123".into());
        })?;

        store.sync(&catalog, &creds)?;
        let state = store.site("a").unwrap();
        assert_eq!(state.alive, Some(true));
        assert_eq!(state.version.as_deref(), Some("v1.2.3"));
        // Config carries no client_id, so the discovered one stays.
        assert_eq!(state.client_id.as_deref(), Some("cid-123"));
        Ok(())
    }
}

//! Two-phase check-in controller.
//!
//! Phase 1 replays cached sessions through the fast path. Pairs whose
//! session is confirmed gone (or never existed) are grouped by credential
//! and handed to Phase 2, which drives one browser per group through the
//! OAuth automator and immediately re-submits each fresh session to the
//! fast path. Every outcome funnels through the shared StateStore and the
//! ResultRecord log; no pair failure ever aborts the run.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::browser::BrowserProvider;
use crate::challenge::ChallengeSolver;
use crate::clock::{Clock, SystemClock};
use crate::config::{OauthConfig, RunConfig};
use crate::fastpath::{FastPathClient, FastResult};
use crate::grouping::{self, CredentialGroup, PendingPair};
use crate::models::{CheckinStatus, ResultRecord, RunSummary, SessionAuth, SiteProbe, SiteState};
use crate::oauth::{OAuthAutomator, OAuthError};
use crate::provider::Credential;
use crate::results::ResultLog;
use crate::state::StateStore;

pub type SharedState = Arc<Mutex<StateStore>>;
pub type SharedResults = Arc<Mutex<ResultLog>>;

/// Fast-path seam so orchestrator tests can script outcomes without a
/// network.
#[async_trait]
pub trait CheckinClient: Send + Sync {
    async fn validate_and_checkin(
        &self,
        site: &SiteState,
        auth: &SessionAuth,
        solver: Option<&ChallengeSolver>,
    ) -> FastResult;

    async fn probe(&self, domain: &str) -> Option<SiteProbe>;

    async fn guard_cookies(
        &self,
        domain: &str,
        solver: &ChallengeSolver,
    ) -> Option<HashMap<String, String>>;
}

#[async_trait]
impl CheckinClient for FastPathClient {
    async fn validate_and_checkin(
        &self,
        site: &SiteState,
        auth: &SessionAuth,
        solver: Option<&ChallengeSolver>,
    ) -> FastResult {
        FastPathClient::validate_and_checkin(self, site, auth, solver).await
    }

    async fn probe(&self, domain: &str) -> Option<SiteProbe> {
        FastPathClient::probe(self, domain).await
    }

    async fn guard_cookies(
        &self,
        domain: &str,
        solver: &ChallengeSolver,
    ) -> Option<HashMap<String, String>> {
        FastPathClient::guard_cookies(self, domain, solver).await
    }
}

/// Collaborators and settings for one engine instance: construct with
/// the required pieces, override the rest.
pub struct EngineContext {
    pub state: SharedState,
    pub results: SharedResults,
    pub client: Arc<dyn CheckinClient>,
    pub browsers: Arc<dyn BrowserProvider>,
    pub solver: Option<Arc<ChallengeSolver>>,
    pub credentials: Vec<Credential>,
    pub oauth: OauthConfig,
    pub run: RunConfig,
    pub clock: Arc<dyn Clock>,
    /// Site keys in catalog order; the run order.
    pub run_order: Vec<String>,
}

impl EngineContext {
    pub fn new(
        state: SharedState,
        results: SharedResults,
        client: Arc<dyn CheckinClient>,
        browsers: Arc<dyn BrowserProvider>,
        credentials: Vec<Credential>,
        run_order: Vec<String>,
    ) -> Self {
        Self {
            state,
            results,
            client,
            browsers,
            solver: None,
            credentials,
            oauth: OauthConfig::default(),
            run: RunConfig::default(),
            clock: Arc::new(SystemClock),
            run_order,
        }
    }

    pub fn with_solver(mut self, solver: Option<Arc<ChallengeSolver>>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_oauth(mut self, oauth: OauthConfig) -> Self {
        self.oauth = oauth;
        self
    }

    pub fn with_run(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct CheckinOrchestrator {
    state: SharedState,
    results: SharedResults,
    client: Arc<dyn CheckinClient>,
    browsers: Arc<dyn BrowserProvider>,
    solver: Option<Arc<ChallengeSolver>>,
    credentials: Vec<Credential>,
    oauth: OauthConfig,
    run: RunConfig,
    clock: Arc<dyn Clock>,
    run_order: Vec<String>,
    /// Guard cookies per domain, solved at most once per run; a failed
    /// solve is cached too and not retried mid-run.
    guard_cache: Mutex<HashMap<String, Option<HashMap<String, String>>>>,
}

impl CheckinOrchestrator {
    pub fn new(context: EngineContext) -> Self {
        Self {
            state: context.state,
            results: context.results,
            client: context.client,
            browsers: context.browsers,
            solver: context.solver,
            credentials: context.credentials,
            oauth: context.oauth,
            run: context.run,
            clock: context.clock,
            run_order: context.run_order,
            guard_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Anti-bot guard cookies for a protected domain, at most one solve
    /// attempt per run.
    async fn guard_for(&self, domain: &str) -> Option<HashMap<String, String>> {
        let solver = self.solver.as_ref()?;
        {
            let cache = self.guard_cache.lock().await;
            if let Some(cached) = cache.get(domain) {
                return cached.clone();
            }
        }
        let cookies = self.client.guard_cookies(domain, solver).await;
        self.guard_cache
            .lock()
            .await
            .insert(domain.to_string(), cookies.clone());
        cookies
    }

    /// Run both phases over every pair and return the final summary.
    pub async fn run_all(&self) -> Result<RunSummary> {
        self.resolve_missing_client_ids().await?;

        let pending = self.phase_one().await?;
        tracing::info!(pending = pending.len(), "fast path done");

        if !pending.is_empty() {
            self.phase_two(pending).await?;
        }

        let mut state = self.state.lock().await;
        state.save()?;
        Ok(state.summary())
    }

    /// Fill in missing OAuth client ids over plain HTTP where possible.
    /// Protected sites refuse this; they get browser-side discovery in
    /// Phase 2.
    async fn resolve_missing_client_ids(&self) -> Result<()> {
        let candidates: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .sites()
                .filter(|(_, s)| s.active() && s.client_id.is_none() && !s.needs_waf)
                .map(|(k, s)| (k.to_string(), s.domain.clone()))
                .collect()
        };

        for (key, domain) in candidates {
            if let Some(probe) = self.client.probe(&domain).await {
                if let Some(client_id) = &probe.client_id {
                    tracing::info!(site = %key, client_id = %truncate(client_id, 12),
                        "discovered client id");
                }
                let mut state = self.state.lock().await;
                state.update_site(&key, |s| s.apply_probe(&probe))?;
            }
        }
        Ok(())
    }

    /// Phase 1: fast path over every pair with a cached session. Returns
    /// the pairs that need a browser.
    async fn phase_one(&self) -> Result<Vec<PendingPair>> {
        let mut pending = Vec::new();

        for key in &self.run_order {
            let Some(site) = self.site_snapshot(key).await else {
                continue;
            };
            if !site.active() {
                continue;
            }

            let labels: Vec<String> = self
                .credentials
                .iter()
                .map(|c| c.label.clone())
                .filter(|l| {
                    site.accounts
                        .get(l)
                        .map(|a| !a.excluded)
                        .unwrap_or(false)
                })
                .collect();

            for label in labels {
                // Another pair may have marked the site dead meanwhile.
                let (alive, account) = {
                    let state = self.state.lock().await;
                    let alive = state.site(key).and_then(|s| s.alive);
                    let account = state.account(key, &label).cloned();
                    (alive, account)
                };
                let Some(account) = account else { continue };

                if account.done_today(self.clock.today()) {
                    tracing::debug!(site = %site.name, %label, "already done today");
                    continue;
                }

                if alive == Some(false) {
                    self.record_failure(key, &label, false, "site unreachable")
                        .await?;
                    continue;
                }

                let Some(mut auth) = account.auth() else {
                    pending.push(PendingPair {
                        site_key: key.clone(),
                        label,
                    });
                    continue;
                };

                if site.needs_waf {
                    if let Some(cookies) = self.guard_for(&site.domain).await {
                        auth.extra_cookies.extend(cookies);
                    }
                }

                tracing::info!(site = %site.name, %label, "fast-path check-in");
                let result = self
                    .client
                    .validate_and_checkin(&site, &auth, self.solver.as_deref())
                    .await;

                match result {
                    FastResult::Expired { reason } => {
                        tracing::debug!(site = %site.name, %label, %reason,
                            "cached session expired");
                        let mut state = self.state.lock().await;
                        state.update_account(key, &label, |a| {
                            a.session = None;
                            a.access_token = None;
                            a.session_updated = None;
                        })?;
                        drop(state);
                        pending.push(PendingPair {
                            site_key: key.clone(),
                            label,
                        });
                    }
                    FastResult::Unreachable { message } => {
                        tracing::warn!(site = %site.name, %label, %message,
                            "site unreachable");
                        {
                            let mut state = self.state.lock().await;
                            state.update_site(key, |s| s.alive = Some(false))?;
                        }
                        self.record_failure(key, &label, false, &message).await?;
                    }
                    FastResult::Transient { message } => {
                        tracing::debug!(site = %site.name, %label, %message,
                            "fast path hiccup, deferring to slow path");
                        pending.push(PendingPair {
                            site_key: key.clone(),
                            label,
                        });
                    }
                    FastResult::Outcome { status, message } => {
                        self.record_outcome(key, &label, status, &message).await?;
                    }
                }
            }
        }

        Ok(pending)
    }

    /// Phase 2: one browser per credential group through the OAuth flow.
    async fn phase_two(&self, pending: Vec<PendingPair>) -> Result<()> {
        let grouping = grouping::group_by_credential(pending, &self.credentials);

        for pair in &grouping.unmatched {
            self.record_failure(
                &pair.site_key,
                &pair.label,
                false,
                "no credential configured",
            )
            .await?;
        }

        if grouping.groups.is_empty() {
            return Ok(());
        }

        if self.parallel_allowed(grouping.groups.len()) {
            tracing::info!(groups = grouping.groups.len(), "slow path, parallel groups");
            let futures: Vec<_> = grouping
                .groups
                .iter()
                .map(|group| self.run_group(group))
                .collect();
            for result in futures::future::join_all(futures).await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "credential group failed");
                }
            }
        } else {
            tracing::info!(groups = grouping.groups.len(), "slow path, serial groups");
            for group in &grouping.groups {
                if let Err(e) = self.run_group(group).await {
                    tracing::error!(error = %e, "credential group failed");
                }
            }
        }

        Ok(())
    }

    async fn run_group(&self, group: &CredentialGroup<'_>) -> Result<()> {
        let label = &group.credential.label;
        tracing::info!(%label, sites = group.site_keys.len(), "starting credential group");

        let session = match self.browsers.acquire(label).await {
            Ok(session) => session,
            Err(e) => {
                let reason = format!("browser unavailable: {e:#}");
                self.fail_sites(group, &group.site_keys, false, &reason)
                    .await?;
                return Ok(());
            }
        };

        let automator = OAuthAutomator::new(session.as_ref(), &self.oauth);

        // One interactive login for the whole group; a rejected credential
        // is never retried against the provider.
        if let Err(e) = automator.login(group.credential).await {
            tracing::warn!(%label, error = %e, "login failed, abandoning group");
            self.fail_sites(group, &group.site_keys, false, &format!("{e}"))
                .await?;
            let _ = session.close().await;
            return Ok(());
        }
        tracing::info!(%label, "identity-provider login ok");

        let mut consecutive_failures: u32 = 0;

        for (index, key) in group.site_keys.iter().enumerate() {
            if consecutive_failures >= self.run.max_consecutive_failures {
                tracing::warn!(%label, failures = consecutive_failures,
                    "circuit breaker tripped, abandoning remaining sites");
                let remaining = &group.site_keys[index..];
                let reason = format!(
                    "skipped after {consecutive_failures} consecutive failures"
                );
                self.fail_sites(group, remaining, false, &reason).await?;
                break;
            }

            let Some(site) = self.site_snapshot(key).await else {
                continue;
            };

            if self.state.lock().await.done_today(key, label) {
                continue;
            }

            // A dead-site mark from any group is honored by all others.
            if site.alive == Some(false) {
                self.record_failure(key, label, false, "site unreachable")
                    .await?;
                continue;
            }

            tracing::info!(%label, site = %site.name, "per-site OAuth flow");

            let client_id = match &site.client_id {
                Some(client_id) => client_id.clone(),
                None => match automator.discover_site(&site.domain).await {
                    Some(probe) => {
                        if let Some(client_id) = probe.client_id.clone() {
                            let mut state = self.state.lock().await;
                            state.update_site(key, |s| s.apply_probe(&probe))?;
                            client_id
                        } else {
                            self.record_failure(key, label, false, "site has no OAuth client id")
                                .await?;
                            continue;
                        }
                    }
                    None => {
                        self.record_failure(
                            key,
                            label,
                            false,
                            "could not reach site configuration",
                        )
                        .await?;
                        continue;
                    }
                },
            };

            match automator.authorize_site(&site, &client_id).await {
                Ok(captured) => {
                    consecutive_failures = 0;
                    let today = self.clock.today();
                    {
                        let mut state = self.state.lock().await;
                        state.update_account(key, label, |a| {
                            a.session = Some(captured.session.clone());
                            a.user_id = captured.user_id.clone();
                            a.access_token = captured.access_token.clone();
                            a.session_updated = Some(today);
                        })?;
                    }

                    // Fresh session goes straight back through the fast
                    // path for the actual check-in.
                    let mut auth = SessionAuth::new(captured.session.clone());
                    auth.user_id = captured.user_id.clone();
                    auth.access_token = captured.access_token.clone();

                    if site.needs_waf {
                        if let Some(cookies) = self.guard_for(&site.domain).await {
                            auth.extra_cookies.extend(cookies);
                        }
                    }

                    let result = self
                        .client
                        .validate_and_checkin(&site, &auth, self.solver.as_deref())
                        .await;

                    match result {
                        FastResult::Outcome { status, message } => {
                            self.record_outcome(key, label, status, &message).await?;
                        }
                        FastResult::Expired { reason } => {
                            self.record_failure(
                                key,
                                label,
                                true,
                                &format!("fresh session rejected: {reason}"),
                            )
                            .await?;
                        }
                        FastResult::Unreachable { message } => {
                            {
                                let mut state = self.state.lock().await;
                                state.update_site(key, |s| s.alive = Some(false))?;
                            }
                            self.record_failure(key, label, true, &message).await?;
                        }
                        FastResult::Transient { message } => {
                            self.record_failure(key, label, true, &message).await?;
                        }
                    }
                }
                Err(e @ OAuthError::LoginFailed(_)) => {
                    // Only the login step emits this; treat a stray one as
                    // a group abort all the same.
                    let remaining = &group.site_keys[index..];
                    self.fail_sites(group, remaining, false, &format!("{e}"))
                        .await?;
                    break;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(%label, site = %site.name, error = %e,
                        "per-site OAuth flow failed");
                    self.record_failure(key, label, false, &format!("{e}"))
                        .await?;
                }
            }
        }

        let _ = session.close().await;
        Ok(())
    }

    fn parallel_allowed(&self, groups: usize) -> bool {
        if !self.run.parallel || groups <= 1 {
            return false;
        }
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let available_mb = system.available_memory() / (1024 * 1024);
        if available_mb < self.run.min_parallel_memory_mb {
            tracing::info!(
                available_mb,
                "low memory, degrading to serial groups"
            );
            return false;
        }
        true
    }

    async fn site_snapshot(&self, key: &str) -> Option<SiteState> {
        self.state.lock().await.site(key).cloned()
    }

    async fn record_outcome(
        &self,
        key: &str,
        label: &str,
        status: CheckinStatus,
        message: &str,
    ) -> Result<()> {
        let (site_name, domain) = self.site_identity(key).await;
        let now = self.clock.now();

        let record = match status {
            CheckinStatus::Success => {
                tracing::info!(site = %site_name, %label, %message, "checked in");
                ResultRecord::success(label, key, &site_name, &domain, message, now)
            }
            CheckinStatus::AlreadyChecked => {
                tracing::info!(site = %site_name, %label, %message, "already checked in");
                ResultRecord::already(label, key, &site_name, &domain, message, now)
            }
            _ => {
                tracing::warn!(site = %site_name, %label, %message, "check-in failed");
                ResultRecord::failure(label, key, &site_name, &domain, true, message, now)
            }
        };

        self.results.lock().await.append(record)?;
        self.state.lock().await.resolve_account(
            key,
            label,
            status,
            Some(message.to_string()),
        )?;
        Ok(())
    }

    async fn record_failure(
        &self,
        key: &str,
        label: &str,
        login_ok: bool,
        error: &str,
    ) -> Result<()> {
        let (site_name, domain) = self.site_identity(key).await;
        tracing::warn!(site = %site_name, %label, %error, "pair failed");

        self.results.lock().await.append(ResultRecord::failure(
            label,
            key,
            &site_name,
            &domain,
            login_ok,
            error,
            self.clock.now(),
        ))?;
        self.state.lock().await.resolve_account(
            key,
            label,
            CheckinStatus::Failed,
            Some(error.to_string()),
        )?;
        Ok(())
    }

    async fn fail_sites(
        &self,
        group: &CredentialGroup<'_>,
        keys: &[String],
        login_ok: bool,
        reason: &str,
    ) -> Result<()> {
        for key in keys {
            if self
                .state
                .lock()
                .await
                .done_today(key, &group.credential.label)
            {
                continue;
            }
            self.record_failure(key, &group.credential.label, login_ok, reason)
                .await?;
        }
        Ok(())
    }

    async fn site_identity(&self, key: &str) -> (String, String) {
        let state = self.state.lock().await;
        match state.site(key) {
            Some(site) => (site.name.clone(), site.domain.clone()),
            None => (key.to_string(), String::new()),
        }
    }
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

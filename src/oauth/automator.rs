//! Drives a [`BrowserSession`] through the identity-provider login and
//! the per-site authorization flows.
//!
//! Login is a single programmatic request inside the browser context
//! (CSRF-token fetch, then POST) instead of UI form filling, which keeps
//! it clear of selectors on a themeable login page. The per-site
//! flow navigates the authorize URL and then hands every poll-tick
//! observation to the pure machine in [`super::machine`].

use std::collections::HashSet;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::json;

use crate::browser::{BrowserSession, NavigateWait};
use crate::config::OauthConfig;
use crate::models::{SiteProbe, SiteState};
use crate::provider::Credential;

use super::machine::{
    self, is_challenge_title, FlowOutcome, FlowState, FlowTarget, Observation, StepAction,
};

const NAV_TIMEOUT: Duration = Duration::from_secs(30);
const TRUST_NAV_TIMEOUT: Duration = Duration::from_secs(15);

/// Terminal outcomes of the slow path, per site or per group.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Credential rejected by the identity provider. Aborts the whole
    /// group: a bad credential must not be retried against a provider
    /// that may rate-limit.
    #[error("identity-provider login failed: {0}")]
    LoginFailed(String),

    #[error("could not fetch OAuth state token: {0}")]
    StateFetch(String),

    /// The per-site wait budget elapsed without a session capture.
    #[error("timed out waiting for session")]
    Timeout,

    /// Landed on a login/expired/error page after the consent click.
    #[error("redirected to failure page: {0}")]
    RedirectFailure(String),

    #[error(transparent)]
    Browser(#[from] anyhow::Error),
}

/// Session material captured by a successful per-site flow.
#[derive(Debug, Clone)]
pub struct CapturedAuth {
    pub session: String,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
}

const LOGIN_JS: &str = r#"
try {
    const csrfResp = await fetch('/session/csrf', {
        method: 'GET', credentials: 'same-origin',
        headers: {'Accept': 'application/json', 'X-Requested-With': 'XMLHttpRequest', 'Discourse-Present': 'true'},
    });
    if (csrfResp.status !== 200) return {error: 'csrf ' + csrfResp.status};
    const csrf = (await csrfResp.json()).csrf;
    const body = 'login=' + encodeURIComponent(arg.login)
        + '&password=' + encodeURIComponent(arg.password)
        + '&second_factor_method=1';
    const loginResp = await fetch('/session', {
        method: 'POST', credentials: 'same-origin',
        headers: {
            'Content-Type': 'application/x-www-form-urlencoded',
            'X-CSRF-Token': csrf,
            'X-Requested-With': 'XMLHttpRequest',
            'Discourse-Present': 'true',
        },
        body,
    });
    return {status: loginResp.status};
} catch (e) { return {error: e.message}; }
"#;

const STATE_JS: &str = r#"
try {
    const resp = await fetch('/api/oauth/state', {
        method: 'GET', credentials: 'same-origin',
        headers: {'Accept': 'application/json'},
    });
    const data = await resp.json();
    return {status: resp.status, state: data.data || ''};
} catch (e) { return {error: e.message}; }
"#;

const STATUS_JS: &str = r#"
try {
    const resp = await fetch('/api/status', {
        method: 'GET', credentials: 'same-origin',
        headers: {'Accept': 'application/json'},
    });
    const data = await resp.json();
    return {status: resp.status, data: data.data || {}};
} catch (e) { return {error: e.message}; }
"#;

const USER_IDENTITY_JS: &str = r#"
try {
    const out = {id: null, token: null};
    const known = ['user', 'userInfo', 'currentUser', 'user_info'];
    for (const key of known) {
        const raw = localStorage.getItem(key);
        if (!raw) continue;
        try {
            const obj = JSON.parse(raw);
            if (obj && obj.id !== undefined) { out.id = String(obj.id); break; }
        } catch (e) {}
    }
    if (out.id === null) {
        for (let i = 0; i < localStorage.length; i++) {
            try {
                const obj = JSON.parse(localStorage.getItem(localStorage.key(i)));
                if (obj && typeof obj === 'object' && 'id' in obj && 'username' in obj) {
                    out.id = String(obj.id);
                    if (typeof obj.access_token === 'string') out.token = obj.access_token;
                    break;
                }
            } catch (e) {}
        }
    }
    for (const key of ['access_token', 'token']) {
        if (out.token) break;
        const raw = localStorage.getItem(key);
        if (raw && raw.length > 10) out.token = raw;
    }
    return out;
} catch (e) { return {id: null, token: null}; }
"#;

pub struct OAuthAutomator<'a> {
    session: &'a dyn BrowserSession,
    oauth: &'a OauthConfig,
}

impl<'a> OAuthAutomator<'a> {
    pub fn new(session: &'a dyn BrowserSession, oauth: &'a OauthConfig) -> Self {
        Self { session, oauth }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.oauth.poll_interval_secs.max(1))
    }

    /// Log in at the identity provider once for the whole group.
    pub async fn login(&self, credential: &Credential) -> Result<(), OAuthError> {
        // Some protection layers gate the session path; they must see a
        // benign navigation before the login page is requested.
        tracing::debug!("establishing trust before login");
        let _ = self
            .session
            .navigate(&self.oauth.trust_url, NavigateWait::Commit, TRUST_NAV_TIMEOUT)
            .await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        if self
            .session
            .navigate(&self.oauth.login_url, NavigateWait::Loaded, NAV_TIMEOUT)
            .await
            .is_err()
        {
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.session
                .navigate(&self.oauth.login_url, NavigateWait::Loaded, NAV_TIMEOUT)
                .await?;
        }

        self.wait_out_challenge(30).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        tracing::debug!(login = %credential.login, "submitting scripted login");
        let result = self
            .session
            .evaluate(
                LOGIN_JS,
                json!({
                    "login": credential.login,
                    "password": credential.secret.expose_secret(),
                }),
            )
            .await?;

        let status = result.get("status").and_then(|v| v.as_i64());
        if status == Some(200) {
            Ok(())
        } else {
            let detail = result
                .get("error")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("status {status:?}"));
            Err(OAuthError::LoginFailed(detail))
        }
    }

    /// Fetch a protected site's status record from inside the browser;
    /// used when the plain HTTP probe was refused by the WAF.
    pub async fn discover_site(&self, domain: &str) -> Option<SiteProbe> {
        self.session
            .navigate(&format!("{domain}/"), NavigateWait::Loaded, NAV_TIMEOUT)
            .await
            .ok()?;
        self.wait_out_challenge(30).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let result = self
            .session
            .evaluate(STATUS_JS, serde_json::Value::Null)
            .await
            .ok()?;
        if result.get("status").and_then(|v| v.as_i64()) != Some(200) {
            return None;
        }

        let data = result.get("data")?;
        Some(SiteProbe {
            client_id: data
                .get("linuxdo_client_id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from),
            system_name: data
                .get("system_name")
                .and_then(|v| v.as_str())
                .map(String::from),
            version: data.get("version").and_then(|v| v.as_str()).map(String::from),
            checkin_enabled: data.get("checkin_enabled").and_then(|v| v.as_bool()),
            min_trust_level: data.get("min_trust_level").and_then(|v| v.as_i64()),
        })
    }

    /// Run the per-site OAuth flow and capture a fresh session.
    pub async fn authorize_site(
        &self,
        site: &SiteState,
        client_id: &str,
    ) -> Result<CapturedAuth, OAuthError> {
        let host = host_of(&site.domain);

        // Visit the site first so its guard cookies exist before the
        // authorize redirect comes back.
        tracing::debug!(site = %site.name, "visiting site before authorize");
        let _ = self
            .session
            .navigate(&format!("{}/", site.domain), NavigateWait::Loaded, NAV_TIMEOUT)
            .await;
        self.wait_out_challenge(15).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let state_token = self.fetch_state_token().await?;

        // Baseline snapshot of session cookies already present for this
        // target; only values outside it count as a capture.
        let root = machine::root_domain(&host);
        let baseline: HashSet<String> = self
            .session
            .cookies()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|c| {
                c.name == self.oauth.session_cookie
                    && machine::domain_matches(&c.domain, &host, &root)
            })
            .map(|c| c.value)
            .collect();

        let authorize_url = self.authorize_url(site, client_id, &state_token);
        tracing::debug!(site = %site.name, "navigating to authorize endpoint");
        let _ = self
            .session
            .navigate(&authorize_url, NavigateWait::Commit, NAV_TIMEOUT)
            .await;

        let target = FlowTarget::new(
            host,
            self.oauth.consent_host.clone(),
            self.oauth.session_cookie.clone(),
            baseline,
        );

        let outcome = self.poll_flow(&target).await?;
        match outcome {
            FlowOutcome::Captured {
                session,
                cookie_domain,
            } => {
                if cookie_domain.trim_start_matches('.') != target.host {
                    tracing::debug!(
                        from = %cookie_domain,
                        "session cookie arrived via a redirect domain"
                    );
                }
                let (user_id, access_token) = self.extract_user_identity(&site.domain).await;
                Ok(CapturedAuth {
                    session,
                    user_id,
                    access_token,
                })
            }
            FlowOutcome::RedirectFailure { url } => Err(OAuthError::RedirectFailure(url)),
        }
    }

    async fn poll_flow(&self, target: &FlowTarget) -> Result<FlowOutcome, OAuthError> {
        let interval = self.poll_interval();
        let max_iters = (self.oauth.site_wait_secs / interval.as_secs().max(1)).max(1);
        let mut state = FlowState::default();

        for _ in 0..max_iters {
            tokio::time::sleep(interval).await;

            let obs = match self.observe().await {
                Some(obs) => obs,
                // Page or browser went away mid-flow; let the budget
                // account for it as a timeout.
                None => break,
            };

            match machine::step(&state, &obs, target) {
                StepAction::Wait => continue,
                StepAction::ClickConsent => {
                    tracing::debug!("clicking consent affordance");
                    match self.session.click(&self.oauth.consent_selector).await {
                        Ok(true) => {
                            state.clicked_allow = true;
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        // Affordance not visible yet; keep polling.
                        Ok(false) => continue,
                        Err(_) => continue,
                    }
                }
                StepAction::Finish(outcome) => return Ok(outcome),
            }
        }

        Err(OAuthError::Timeout)
    }

    async fn observe(&self) -> Option<Observation> {
        let url = self.session.current_url().await.ok()?;
        let title = self.session.current_title().await.ok()?;
        let cookies = self.session.cookies().await.ok()?;
        Some(Observation {
            url,
            title,
            cookies,
        })
    }

    async fn fetch_state_token(&self) -> Result<String, OAuthError> {
        let result = self
            .session
            .evaluate(STATE_JS, serde_json::Value::Null)
            .await?;

        let ok = result.get("status").and_then(|v| v.as_i64()) == Some(200);
        let state = result
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if ok && !state.is_empty() {
            Ok(state.to_string())
        } else {
            Err(OAuthError::StateFetch(result.to_string()))
        }
    }

    fn authorize_url(&self, site: &SiteState, client_id: &str, state: &str) -> String {
        let redirect_uri =
            urlencoding::encode(&format!("{}{}", site.domain, self.oauth.redirect_path))
                .into_owned();
        let scope = self.oauth.scope.replace(' ', "+");
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.oauth.authorize_url, client_id, redirect_uri, scope, state
        )
    }

    /// After a capture, pull the numeric user id (and a bearer token when
    /// the SPA exposes one) out of the site's localStorage. Absence is
    /// tolerated; check-in is still attempted with the cookie alone.
    async fn extract_user_identity(&self, domain: &str) -> (Option<String>, Option<String>) {
        if self
            .session
            .navigate(&format!("{domain}/console"), NavigateWait::Loaded, NAV_TIMEOUT)
            .await
            .is_err()
        {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        self.wait_out_challenge(15).await;
        // The SPA needs a beat to populate localStorage.
        tokio::time::sleep(Duration::from_secs(5)).await;

        match self
            .session
            .evaluate(USER_IDENTITY_JS, serde_json::Value::Null)
            .await
        {
            Ok(result) => {
                let id = result
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let token = result
                    .get("token")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                (id, token)
            }
            Err(e) => {
                tracing::debug!(error = %e, "user identity extraction failed");
                (None, None)
            }
        }
    }

    /// Poll the title until the protection interstitial clears or the
    /// iteration budget runs out.
    async fn wait_out_challenge(&self, max_iters: u32) {
        let interval = self.poll_interval();
        for _ in 0..max_iters {
            tokio::time::sleep(interval).await;
            match self.session.current_title().await {
                Ok(title) if !is_challenge_title(&title) => return,
                _ => continue,
            }
        }
    }
}

/// Strip the scheme off an origin.
pub fn host_of(domain: &str) -> String {
    domain
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_strips_scheme_and_slash() {
        assert_eq!(host_of("https://api.example.com"), "api.example.com");
        assert_eq!(host_of("http://api.example.com/"), "api.example.com");
    }
}

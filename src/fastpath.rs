//! Fast path: direct HTTP session validation and check-in, no browser.
//!
//! Every suspension point returns a tagged [`FastResult`] instead of
//! raising, so the orchestrator's control flow is a flat dispatch over
//! tags. A redirect-to-login, a 401, or HTML where JSON was expected all
//! mean the cached session is gone and the slow path is needed;
//! connect-level failures mean the site is down for everyone this run.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;

use crate::challenge::{self, ChallengeSolver};
use crate::models::{CheckinStatus, SessionAuth, SiteProbe, SiteState};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0 Safari/537.36";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Server messages that mean "you already checked in today", scanned
/// case-insensitively. Best-effort heuristic over wording the servers are
/// free to change; do not strengthen it.
const ALREADY_KEYWORDS: &[&str] = &["已签到", "签到过", "already", "checked"];

/// Outcome of one fast-path attempt.
#[derive(Debug, Clone)]
pub enum FastResult {
    /// Session no longer valid; the pair needs the slow path.
    Expired { reason: String },
    /// Connect-level failure; the site is unreachable for every account
    /// this run.
    Unreachable { message: String },
    /// Something went wrong that a fresh slow-path session may fix.
    Transient { message: String },
    /// The check-in call resolved; status is never `Pending`.
    Outcome {
        status: CheckinStatus,
        message: String,
    },
}

impl FastResult {
    fn expired(reason: impl Into<String>) -> Self {
        FastResult::Expired {
            reason: reason.into(),
        }
    }

    fn outcome(status: CheckinStatus, message: impl Into<String>) -> Self {
        FastResult::Outcome {
            status,
            message: message.into(),
        }
    }
}

/// Loose envelope the fleet's API deployments answer with. Older
/// deployments use `ret`/`code`/`msg` instead of `success`/`message`.
#[derive(Debug, Default, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    ret: Option<i64>,
    #[serde(default)]
    code: Option<i64>,
}

impl ApiEnvelope {
    fn ok(&self) -> bool {
        self.success == Some(true) || self.ret == Some(1) || self.code == Some(0)
    }

    fn text(&self) -> &str {
        self.message
            .as_deref()
            .or(self.msg.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatusData {
    #[serde(default)]
    linuxdo_client_id: Option<String>,
    #[serde(default)]
    system_name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    checkin_enabled: Option<bool>,
    #[serde(default)]
    min_trust_level: Option<i64>,
}

/// Classify a check-in response body by the fixed precedence: success
/// flag, then already-done keyword, then failure with the message kept
/// verbatim for diagnostics.
pub fn classify_checkin(envelope_ok: bool, message: &str) -> (CheckinStatus, String) {
    if envelope_ok {
        let msg = if message.is_empty() {
            "checked in".to_string()
        } else {
            message.to_string()
        };
        return (CheckinStatus::Success, msg);
    }

    let lower = message.to_lowercase();
    if ALREADY_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return (CheckinStatus::AlreadyChecked, message.to_string());
    }

    let msg = if message.is_empty() {
        "empty response".to_string()
    } else {
        message.to_string()
    };
    (CheckinStatus::Failed, msg)
}

pub struct FastPathClient {
    /// API calls: redirects disabled so a redirect-to-login is observable.
    api: Client,
    /// Page-level calls (probing, guard-cookie acquisition): follows
    /// redirects like a browser would.
    web: Client,
    session_cookie: String,
}

impl FastPathClient {
    pub fn new(session_cookie: &str) -> Result<Self> {
        // Some fleet deployments sit behind self-signed certificates.
        let api = Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build API client")?;

        let web = Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build web client")?;

        Ok(Self {
            api,
            web,
            session_cookie: session_cookie.to_string(),
        })
    }

    fn authed(&self, method: Method, url: &str, auth: &SessionAuth) -> reqwest::RequestBuilder {
        let mut req = self
            .api
            .request(method, url)
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .header("cookie", auth.cookie_header(&self.session_cookie));

        if let Some(token) = &auth.access_token {
            req = req.header("authorization", format!("Bearer {token}"));
        } else if let Some(user_id) = &auth.user_id {
            req = req.header("new-api-user", user_id.clone());
        }
        req
    }

    /// Validate the cached session with a who-am-I request, then perform
    /// the daily check-in. A 404 on the check-in POST is retried once with
    /// GET; some deployments only accept the alternate verb.
    pub async fn validate_and_checkin(
        &self,
        site: &SiteState,
        auth: &SessionAuth,
        solver: Option<&ChallengeSolver>,
    ) -> FastResult {
        let mut auth = auth.clone();
        let whoami_url = format!("{}/api/user/self", site.domain);

        let response = match self.authed(Method::GET, &whoami_url, &auth).send().await {
            Ok(response) => response,
            Err(e) => return classify_send_error(&e),
        };

        let whoami_body = match check_session(response).await {
            SessionCheck::Valid(body) => {
                // A protected site may interpose a script challenge even on
                // an otherwise valid session; solve it once and retry.
                if site.needs_waf && challenge::looks_like_challenge(&body) {
                    let Some(solver) = solver else {
                        return FastResult::outcome(
                            CheckinStatus::Failed,
                            "anti-bot challenge present but no sandbox runtime",
                        );
                    };
                    let Some(cookies) = solve_from_body(&body, solver).await else {
                        return FastResult::outcome(
                            CheckinStatus::Failed,
                            "anti-bot challenge unsolved",
                        );
                    };
                    auth.extra_cookies.extend(cookies);
                    match self.authed(Method::GET, &whoami_url, &auth).send().await {
                        Ok(retry) => match check_session(retry).await {
                            SessionCheck::Valid(body) => body,
                            SessionCheck::Expired(reason) => {
                                return FastResult::expired(reason)
                            }
                        },
                        Err(e) => return classify_send_error(&e),
                    }
                } else {
                    body
                }
            }
            SessionCheck::Expired(reason) => return FastResult::expired(reason),
        };

        match serde_json::from_str::<ApiEnvelope>(&whoami_body) {
            Ok(envelope) if !envelope.ok() => {
                return FastResult::expired(format!("session rejected: {}", envelope.text()));
            }
            Ok(_) => {}
            Err(_) => return FastResult::expired("session expired (html)"),
        }

        self.checkin(site, &auth).await
    }

    async fn checkin(&self, site: &SiteState, auth: &SessionAuth) -> FastResult {
        let url = format!("{}{}", site.domain, site.checkin_path);

        let response = match self.authed(Method::POST, &url, auth).send().await {
            Ok(response) => response,
            Err(e) => return classify_send_error(&e),
        };

        // Alternate-verb fallback: some deployments front the POST route
        // with a proxy that 404s it.
        let response = if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(site = %site.name, "check-in POST 404, retrying with GET");
            match self.authed(Method::GET, &url, auth).send().await {
                Ok(response) => response,
                Err(e) => return classify_send_error(&e),
            }
        } else {
            response
        };

        let body = match check_session(response).await {
            SessionCheck::Valid(body) => body,
            SessionCheck::Expired(reason) => return FastResult::expired(reason),
        };

        match serde_json::from_str::<ApiEnvelope>(&body) {
            Ok(envelope) => {
                let (status, message) = classify_checkin(envelope.ok(), envelope.text());
                FastResult::outcome(status, message)
            }
            Err(_) => {
                // Unexpected response shape: keep the raw payload for
                // diagnostics, truncated.
                let snippet: String = body.chars().take(120).collect();
                FastResult::outcome(
                    CheckinStatus::Failed,
                    format!("unexpected response: {snippet}"),
                )
            }
        }
    }

    /// Probe a site's public status endpoint for its OAuth client id and
    /// feature flags. Failures are silent; the fields simply stay unknown.
    pub async fn probe(&self, domain: &str) -> Option<SiteProbe> {
        let url = format!("{domain}/api/status");
        let response = self.web.get(&url).send().await.ok()?;
        if response.status() != StatusCode::OK {
            return None;
        }

        #[derive(Deserialize)]
        struct StatusEnvelope {
            #[serde(default)]
            data: StatusData,
        }

        let envelope: StatusEnvelope = response.json().await.ok()?;
        let data = envelope.data;
        Some(SiteProbe {
            client_id: data.linuxdo_client_id.filter(|c| !c.is_empty()),
            system_name: data.system_name,
            version: data.version,
            checkin_enabled: data.checkin_enabled,
            min_trust_level: data.min_trust_level,
        })
    }

    /// Acquire a protected site's guard cookies before authenticated
    /// calls: hit an API path anonymously, collect whatever the CDN sets,
    /// and solve the inline script challenge if one is served.
    pub async fn guard_cookies(
        &self,
        domain: &str,
        solver: &ChallengeSolver,
    ) -> Option<HashMap<String, String>> {
        let url = format!("{domain}/api/user/self");
        let response = self
            .web
            .get(&url)
            .header("accept", "text/html,application/xhtml+xml")
            .send()
            .await
            .ok()?;

        let mut cookies = response_cookies(&response);
        let status = response.status();
        let body = response.text().await.ok()?;

        if status == StatusCode::OK && body.contains("<script>") {
            let solved = solve_from_body(&body, solver).await?;
            cookies.extend(solved);
        }
        Some(cookies)
    }
}

enum SessionCheck {
    Valid(String),
    Expired(String),
}

async fn solve_from_body(
    body: &str,
    solver: &ChallengeSolver,
) -> Option<HashMap<String, String>> {
    let script = challenge::extract_inline_script(body)?;
    solver.solve(&script).await
}

/// Shared expiry classification: redirect, 401, or HTML where JSON was
/// expected.
async fn check_session(response: Response) -> SessionCheck {
    let status = response.status();
    if status.is_redirection() {
        return SessionCheck::Expired("session expired (redirect)".to_string());
    }
    if status == StatusCode::UNAUTHORIZED {
        return SessionCheck::Expired("session expired (401)".to_string());
    }

    let html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);

    let body = response.text().await.unwrap_or_default();
    if html && !challenge::looks_like_challenge(&body) {
        return SessionCheck::Expired("session expired (html)".to_string());
    }
    SessionCheck::Valid(body)
}

fn classify_send_error(e: &reqwest::Error) -> FastResult {
    if e.is_connect() {
        FastResult::Unreachable {
            message: "site unreachable".to_string(),
        }
    } else {
        FastResult::Transient {
            message: e.to_string(),
        }
    }
}

fn response_cookies(response: &Response) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in response.headers().get_all(SET_COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        let pair = value.split(';').next().unwrap_or_default();
        if let Some((name, val)) = pair.split_once('=') {
            cookies.insert(name.trim().to_string(), val.trim().to_string());
        }
    }
    cookies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_flag_wins_over_keywords() {
        let (status, msg) = classify_checkin(true, "已签到过了");
        assert_eq!(status, CheckinStatus::Success);
        assert_eq!(msg, "已签到过了");
    }

    #[test]
    fn already_keywords_match_case_insensitively() {
        let (status, _) = classify_checkin(false, "Already checked in today");
        assert_eq!(status, CheckinStatus::AlreadyChecked);

        let (status, _) = classify_checkin(false, "今日已签到");
        assert_eq!(status, CheckinStatus::AlreadyChecked);
    }

    #[test]
    fn unknown_message_fails_verbatim() {
        let (status, msg) = classify_checkin(false, "quota exhausted");
        assert_eq!(status, CheckinStatus::Failed);
        assert_eq!(msg, "quota exhausted");
    }

    #[test]
    fn empty_success_gets_default_message() {
        let (status, msg) = classify_checkin(true, "");
        assert_eq!(status, CheckinStatus::Success);
        assert_eq!(msg, "checked in");
    }
}

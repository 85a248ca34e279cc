//! Pure decision core of the per-site OAuth flow.
//!
//! Each poll tick the driver snapshots the page (url, title, cookies) and
//! asks [`step`] what to do next. Keeping the decision a pure function
//! means the whole dance (challenge interstitials, the one-shot consent
//! click, fresh-cookie capture against a mandatory baseline, redirect
//! failures) is testable with synthetic observations and no browser.

use std::collections::HashSet;

use crate::browser::BrowserCookie;

/// Interstitial titles the protection layers show while they vet the
/// visitor.
pub const CHALLENGE_MARKERS: &[&str] = &["稍候", "moment", "Cloudflare", "Just a", "checking"];

pub fn is_challenge_title(title: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|m| title.contains(m))
}

/// Approximate eTLD+1: the last two labels of a host, so a cookie issued
/// on `api.example.com` after a redirect still counts for
/// `jp.example.com`.
pub fn root_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        host.to_string()
    }
}

/// Cookie belongs to the target when its domain mentions the exact host
/// or shares the root domain.
pub fn domain_matches(cookie_domain: &str, host: &str, root: &str) -> bool {
    cookie_domain.contains(host) || cookie_domain.trim_start_matches('.').ends_with(root)
}

/// Page snapshot taken each poll tick.
#[derive(Debug, Clone)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub cookies: Vec<BrowserCookie>,
}

/// Everything fixed for one site's flow.
#[derive(Debug, Clone)]
pub struct FlowTarget {
    /// Target host, scheme stripped.
    pub host: String,
    pub root_domain: String,
    /// Identity provider's consent page host.
    pub consent_host: String,
    /// Name of the cookie a session grant issues.
    pub session_cookie: String,
    /// Session-cookie values present before the OAuth navigation began.
    /// Mandatory: without it a stale cookie from a previous flow is
    /// indistinguishable from a freshly issued one.
    pub baseline: HashSet<String>,
}

impl FlowTarget {
    pub fn new(
        host: impl Into<String>,
        consent_host: impl Into<String>,
        session_cookie: impl Into<String>,
        baseline: HashSet<String>,
    ) -> Self {
        let host = host.into();
        let root = root_domain(&host);
        Self {
            host,
            root_domain: root,
            consent_host: consent_host.into(),
            session_cookie: session_cookie.into(),
            baseline,
        }
    }

    fn fresh_session<'a>(&self, cookies: &'a [BrowserCookie]) -> Option<&'a BrowserCookie> {
        cookies.iter().find(|c| {
            c.name == self.session_cookie
                && domain_matches(&c.domain, &self.host, &self.root_domain)
                && !self.baseline.contains(&c.value)
        })
    }
}

/// Mutable flow position between ticks.
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    pub clicked_allow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Nothing decisive on the page yet; sleep and poll again.
    Wait,
    /// Consent page showing and not yet acted on.
    ClickConsent,
    Finish(FlowOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// A session cookie absent from the baseline appeared for the target.
    Captured { session: String, cookie_domain: String },
    /// After the consent click the browser landed on a login/expired/error
    /// page instead of the target.
    RedirectFailure { url: String },
}

pub fn step(state: &FlowState, obs: &Observation, target: &FlowTarget) -> StepAction {
    if is_challenge_title(&obs.title) {
        return StepAction::Wait;
    }

    if obs.url.contains(&target.consent_host) {
        if !state.clicked_allow {
            return StepAction::ClickConsent;
        }
        // Already clicked; a second visit to the consent page is a no-op.
        return StepAction::Wait;
    }

    if let Some(cookie) = target.fresh_session(&obs.cookies) {
        return StepAction::Finish(FlowOutcome::Captured {
            session: cookie.value.clone(),
            cookie_domain: cookie.domain.clone(),
        });
    }

    if state.clicked_allow {
        let on_target = obs.url.contains(&target.host);
        if !on_target && (obs.url.contains("login") || obs.url.contains("expired")) {
            return StepAction::Finish(FlowOutcome::RedirectFailure {
                url: obs.url.clone(),
            });
        }
        if on_target
            && obs.url.contains("/login")
            && (obs.url.contains("expired") || obs.url.contains("error"))
        {
            return StepAction::Finish(FlowOutcome::RedirectFailure {
                url: obs.url.clone(),
            });
        }
    }

    StepAction::Wait
}

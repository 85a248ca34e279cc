use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Resolution of one check-in task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinStatus {
    #[default]
    Pending,
    Success,
    AlreadyChecked,
    Failed,
}

impl CheckinStatus {
    /// True for statuses that mean the task needs no further attempt today.
    pub fn is_done(self) -> bool {
        matches!(self, CheckinStatus::Success | CheckinStatus::AlreadyChecked)
    }
}

/// Per-(site x account) state persisted in the snapshot.
///
/// A non-pending `checkin_status` is only *effective* while `checkin_date`
/// is the current run's date. Callers must go through
/// [`AccountState::effective_status`] rather than reading the stored field;
/// the stored value is left untouched across day boundaries until a fresh
/// attempt resolves it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    /// Cached session cookie value, if one was ever captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    /// Bearer-token alternative to the session cookie.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Numeric user id some deployments require as a header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default)]
    pub checkin_status: CheckinStatus,

    /// Date the stored status was last resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_date: Option<NaiveDate>,

    /// Server message from the last resolution, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_msg: Option<String>,

    /// Date the session was last refreshed via the slow path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_updated: Option<NaiveDate>,

    /// Label no longer in the site's allowed accounts; history kept.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub excluded: bool,
}

impl AccountState {
    /// Day-aware status: a success/already/failed value from a previous day
    /// reads as pending without being overwritten.
    pub fn effective_status(&self, today: NaiveDate) -> CheckinStatus {
        match self.checkin_date {
            Some(date) if date == today => self.checkin_status,
            _ => CheckinStatus::Pending,
        }
    }

    /// True when the task resolved to success or already_checked today.
    pub fn done_today(&self, today: NaiveDate) -> bool {
        self.effective_status(today).is_done()
    }

    /// Auth material for the fast path, if any session was ever cached.
    pub fn auth(&self) -> Option<SessionAuth> {
        let session = self.session.clone()?;
        Some(SessionAuth {
            session,
            user_id: self.user_id.clone(),
            access_token: self.access_token.clone(),
            extra_cookies: HashMap::new(),
        })
    }
}

/// Everything the fast path needs to authenticate one request.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub session: String,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    /// Solved anti-bot cookies, merged into the Cookie header.
    pub extra_cookies: HashMap<String, String>,
}

impl SessionAuth {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            user_id: None,
            access_token: None,
            extra_cookies: HashMap::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Cookie header value: anti-bot cookies first, session last.
    pub fn cookie_header(&self, session_cookie: &str) -> String {
        let mut parts: Vec<String> = self
            .extra_cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.sort();
        parts.push(format!("{session_cookie}={}", self.session));
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn stale_status_reads_as_pending_without_mutation() {
        let state = AccountState {
            checkin_status: CheckinStatus::Success,
            checkin_date: Some(date("2026-08-06")),
            ..Default::default()
        };

        assert_eq!(
            state.effective_status(date("2026-08-07")),
            CheckinStatus::Pending
        );
        // Stored value untouched.
        assert_eq!(state.checkin_status, CheckinStatus::Success);
        assert_eq!(
            state.effective_status(date("2026-08-06")),
            CheckinStatus::Success
        );
    }

    #[test]
    fn missing_date_means_pending() {
        let state = AccountState {
            checkin_status: CheckinStatus::Failed,
            checkin_date: None,
            ..Default::default()
        };
        assert_eq!(
            state.effective_status(date("2026-08-07")),
            CheckinStatus::Pending
        );
    }

    #[test]
    fn cookie_header_orders_session_last() {
        let mut auth = SessionAuth::new("abc");
        auth.extra_cookies.insert("acw_tc".into(), "1".into());
        auth.extra_cookies.insert("acw_sc__v2".into(), "2".into());
        assert_eq!(
            auth.cookie_header("session"),
            "acw_sc__v2=2; acw_tc=1; session=abc"
        );
    }
}

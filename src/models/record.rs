use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One attempt against one (account x site) pair. Append-only; never
/// mutated after being recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub account: String,
    pub site: String,
    pub site_key: String,
    pub domain: String,
    pub login_ok: bool,
    pub checkin_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub time: DateTime<Utc>,
}

impl ResultRecord {
    pub fn success(
        account: &str,
        site_key: &str,
        site: &str,
        domain: &str,
        message: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            account: account.to_string(),
            site: site.to_string(),
            site_key: site_key.to_string(),
            domain: domain.to_string(),
            login_ok: true,
            checkin_ok: true,
            message: Some(message.into()),
            error: None,
            time,
        }
    }

    pub fn already(
        account: &str,
        site_key: &str,
        site: &str,
        domain: &str,
        message: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            account: account.to_string(),
            site: site.to_string(),
            site_key: site_key.to_string(),
            domain: domain.to_string(),
            login_ok: true,
            checkin_ok: false,
            message: Some(message.into()),
            error: None,
            time,
        }
    }

    pub fn failure(
        account: &str,
        site_key: &str,
        site: &str,
        domain: &str,
        login_ok: bool,
        error: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            account: account.to_string(),
            site: site.to_string(),
            site_key: site_key.to_string(),
            domain: domain.to_string(),
            login_ok,
            checkin_ok: false,
            message: None,
            error: Some(error.into()),
            time,
        }
    }
}

/// Derived counts, recomputed on every snapshot save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_sites: usize,
    pub active_sites: usize,
    pub skipped_sites: usize,
    pub removed_sites: usize,
    pub total_tasks: usize,
    pub success: usize,
    pub already_checked: usize,
    pub failed: usize,
    pub pending: usize,
}

impl RunSummary {
    /// True when at least one task resolved usefully; drives the process
    /// exit code.
    pub fn any_effective(&self) -> bool {
        self.success + self.already_checked > 0
    }
}

/// Reserved `_meta` entry of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

//! Anti-bot script-challenge solver.
//!
//! Protected sites answer API requests with an HTML page whose inline
//! script computes a guard cookie and reloads. The solver executes that
//! captured script in a node subprocess with a stubbed DOM surface and
//! harvests whatever cookies it assigns. Execution is untrusted and
//! time-bounded; anything else (timeout, non-zero exit, unparsable
//! output, empty jar) is a failure the caller must treat as retryable
//! with a freshly captured payload.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tempfile::TempDir;
use tokio::process::Command;

use crate::config::ChallengeConfig;

/// Harness that runs a challenge payload with `document.cookie` and
/// `location.reload` intercepted, printing the cookie jar as JSON. It
/// exits the moment anything lands in the jar; the tail of these scripts
/// is reload loops and anti-debug traps.
const HARNESS_JS: &str = r#"const fs = require('fs');

const payload = fs.readFileSync(process.argv[2], 'utf8');

const deadline = setTimeout(() => { console.log('{}'); process.exit(0); }, 5000);

const jar = new Map();
function emit() {
  if (jar.size > 0) {
    clearTimeout(deadline);
    console.log(JSON.stringify(Object.fromEntries(jar)));
    process.exit(0);
  }
}

const document = {
  set cookie(value) {
    const pair = value.split(';')[0];
    const eq = pair.indexOf('=');
    if (eq > 0) jar.set(pair.slice(0, eq).trim(), pair.slice(eq + 1).trim());
    emit();
  },
  get cookie() {
    return [...jar.entries()].map(([k, v]) => `${k}=${v}`).join('; ');
  },
  location: {
    reload() { emit(); },
    href: 'https://localhost/',
    hostname: 'localhost',
    pathname: '/',
    protocol: 'https:',
    search: '',
    hash: '',
  },
};
const location = document.location;

try {
  eval(payload);
} catch (err) {
  // Challenge scripts throw freely once they notice the stub; whatever
  // landed in the jar before that is still good.
}

clearTimeout(deadline);
console.log(jar.size > 0 ? JSON.stringify(Object.fromEntries(jar)) : '{}');
"#;

pub struct ChallengeSolver {
    node_binary: String,
    timeout: Duration,
    harness_path: PathBuf,
    // Owns the harness file for the solver's lifetime.
    _workdir: TempDir,
}

impl ChallengeSolver {
    pub fn new(config: &ChallengeConfig) -> Result<Self> {
        let workdir = TempDir::new().context("Failed to create challenge workdir")?;
        let harness_path = workdir.path().join("harness.js");
        std::fs::write(&harness_path, HARNESS_JS)
            .with_context(|| format!("Failed to write harness: {}", harness_path.display()))?;

        Ok(Self {
            node_binary: config.node_binary.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            harness_path,
            _workdir: workdir,
        })
    }

    /// Check the sandbox runtime exists. Absence only fails the sites
    /// that need it, never the whole run.
    pub async fn runtime_available(&self) -> bool {
        Command::new(&self.node_binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Execute a captured challenge payload and return the cookies it
    /// computed, or `None` on timeout / failure / empty output.
    pub async fn solve(&self, script: &str) -> Option<HashMap<String, String>> {
        let mut payload = tempfile::NamedTempFile::new_in(self._workdir.path()).ok()?;
        payload.write_all(script.as_bytes()).ok()?;
        payload.flush().ok()?;

        let child = Command::new(&self.node_binary)
            .arg(&self.harness_path)
            .arg(payload.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .ok()?;

        // Dropping the future on timeout kills the child (kill_on_drop).
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            _ => {
                tracing::debug!("challenge script timed out or failed to run");
                return None;
            }
        };

        if !output.status.success() {
            return None;
        }

        let cookies: HashMap<String, String> =
            serde_json::from_slice(output.stdout.trim_ascii()).ok()?;
        if cookies.is_empty() {
            None
        } else {
            Some(cookies)
        }
    }
}

/// Pull the first inline `<script>` body out of a challenge page.
pub fn extract_inline_script(html: &str) -> Option<String> {
    let re = Regex::new(r"(?is)<script[^>]*>(.*?)</script>").ok()?;
    re.captures(html)
        .map(|caps| caps[1].to_string())
        .filter(|s| !s.trim().is_empty())
}

/// Heuristic for "this HTML body is a script challenge, not content".
pub fn looks_like_challenge(body: &str) -> bool {
    body.contains("<script>") && body.contains("arg1=")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_script_body() {
        let html = r#"<html><script type="text/javascript">var arg1='AB';</script>
            <script>second()</script></html>"#;
        let script = extract_inline_script(html).unwrap();
        assert_eq!(script, "var arg1='AB';");
    }

    #[test]
    fn no_script_yields_none() {
        assert!(extract_inline_script("<html><body>plain</body></html>").is_none());
        assert!(extract_inline_script("<script>  </script>").is_none());
    }

    #[test]
    fn challenge_detection() {
        assert!(looks_like_challenge("<html><script>var arg1='x';</script></html>"));
        assert!(!looks_like_challenge("<html><script>app()</script></html>"));
        assert!(!looks_like_challenge(r#"{"success":true}"#));
    }

    #[tokio::test]
    async fn solve_captures_cookie_assignment() {
        let solver = ChallengeSolver::new(&ChallengeConfig::default()).unwrap();
        if !solver.runtime_available().await {
            return; // no node on this machine; nothing to assert
        }

        let cookies = solver
            .solve("document.cookie = 'acw_sc__v2=deadbeef; path=/'; location.reload();")
            .await
            .unwrap();
        assert_eq!(cookies.get("acw_sc__v2").map(String::as_str), Some("deadbeef"));
    }

    #[tokio::test]
    async fn solve_rejects_nonterminating_script() {
        let config = ChallengeConfig {
            timeout_secs: 2,
            ..Default::default()
        };
        let solver = ChallengeSolver::new(&config).unwrap();
        if !solver.runtime_available().await {
            return;
        }

        assert!(solver.solve("for(;;){}").await.is_none());
    }

    #[tokio::test]
    async fn solve_rejects_cookieless_script() {
        let solver = ChallengeSolver::new(&ChallengeConfig::default()).unwrap();
        if !solver.runtime_available().await {
            return;
        }

        assert!(solver.solve("var x = 1 + 1;").await.is_none());
    }
}

//! Browser capability layer.
//!
//! The OAuth automator only sees the [`BrowserSession`] trait: navigate,
//! read url/title/cookies, evaluate a script, click. The chromiumoxide
//! implementation drives one Chrome profile per credential group; tests
//! drive the automator with scripted sessions instead.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// How long to wait for a navigation before giving up on it. The flows
/// tolerate navigation failures (a challenge page may never fire load),
/// so callers usually ignore the error and fall into the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigateWait {
    /// Return as soon as the navigation commits.
    Commit,
    /// Wait for the page to finish loading.
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// One live browser profile, as the automation engine consumes it.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str, wait: NavigateWait, timeout: Duration) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn current_title(&self) -> Result<String>;

    async fn cookies(&self) -> Result<Vec<BrowserCookie>>;

    /// Run `js` as the body of an async function receiving `arg`; the
    /// resolved value comes back as JSON.
    async fn evaluate(&self, js: &str, arg: serde_json::Value) -> Result<serde_json::Value>;

    /// Click a matching element. `text=...` selectors match visible
    /// element text; anything else is a CSS selector. Returns false when
    /// nothing matched.
    async fn click(&self, selector: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// Hands out one [`BrowserSession`] per credential group.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn acquire(&self, group: &str) -> Result<Box<dyn BrowserSession>>;
}

pub struct CdpBrowserSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
    // Chrome profile directory, removed when the session goes away.
    _profile: TempDir,
}

#[async_trait]
impl BrowserSession for CdpBrowserSession {
    async fn navigate(&self, url: &str, _wait: NavigateWait, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| anyhow::anyhow!("navigation timed out: {url}"))?
            .with_context(|| format!("navigation failed: {url}"))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn current_title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|c| BrowserCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
            })
            .collect())
    }

    async fn evaluate(&self, js: &str, arg: serde_json::Value) -> Result<serde_json::Value> {
        let arg_json = serde_json::to_string(&arg).context("Failed to encode script arg")?;
        let expression = format!("(async (arg) => {{\n{js}\n}})({arg_json})");

        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build evaluate params: {e}"))?;

        let result = self.page.evaluate(params).await?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        if let Some(text) = selector.strip_prefix("text=") {
            // Text matcher: find a visible clickable element whose text
            // contains the needle and click it in-page.
            let clicked = self
                .evaluate(
                    r#"
                    const needle = arg;
                    const candidates = document.querySelectorAll(
                        'button, a, input[type=submit], [role=button]'
                    );
                    for (const el of candidates) {
                        const label = (el.innerText || el.value || '').trim();
                        if (label.includes(needle) && el.offsetParent !== null) {
                            el.click();
                            return true;
                        }
                    }
                    return false;
                    "#,
                    serde_json::Value::String(text.to_string()),
                )
                .await?;
            return Ok(clicked.as_bool().unwrap_or(false));
        }

        match self.page.find_element(selector).await {
            Ok(element) => {
                element.click().await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn close(&self) -> Result<()> {
        // Dropping the Browser tears down the Chrome child.
        if let Ok(mut guard) = self.browser.lock() {
            guard.take();
        }
        self.handler_task.abort();
        Ok(())
    }
}

/// Launches one headless Chrome per acquired session.
pub struct CdpBrowserProvider {
    headless: bool,
}

impl CdpBrowserProvider {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }
}

#[async_trait]
impl BrowserProvider for CdpBrowserProvider {
    async fn acquire(&self, group: &str) -> Result<Box<dyn BrowserSession>> {
        let profile = TempDir::with_prefix(format!("rollcall-{group}-"))
            .context("Failed to create browser profile dir")?;

        let (browser, mut handler) = launch_browser(profile.path(), self.headless).await?;
        let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;

        Ok(Box::new(CdpBrowserSession {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
            _profile: profile,
        }))
    }
}

async fn launch_browser(
    profile_dir: &Path,
    headless: bool,
) -> Result<(Browser, chromiumoxide::handler::Handler)> {
    let chrome_path = find_chrome()
        .context("Chrome/Chromium not found. Install Chrome or Chromium to use the slow path.")?;

    let mut builder = BrowserConfig::builder()
        .chrome_executable(chrome_path)
        .user_data_dir(profile_dir)
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--no-first-run")
        .arg("--no-default-browser-check");

    if headless {
        builder = builder
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--window-size=1920,1080");
    } else {
        builder = builder.with_head().viewport(None);
    }

    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to configure browser: {e}"))?;

    let (browser, handler) = Browser::launch(config)
        .await
        .context("Failed to launch browser")?;

    Ok((browser, handler))
}

/// Find Chrome/Chromium executable.
fn find_chrome() -> Option<String> {
    for name in ["google-chrome", "google-chrome-stable", "chromium"] {
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
                }
            }
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
    }
    None
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{TabHost, TabInfo};
use crate::bridge::{BridgeRequest, PageTransport, SnapshotSource, TransportError};
use crate::error::{AgentError, Result};
use crate::types::{TabId, VisualSnapshot};

const SNAPSHOT_JPEG_QUALITY: u32 = 60;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Chrome driven over CDP. Created once, reused for every session.
pub struct ChromeHost {
    browser: Browser,
}

#[derive(Debug, Clone, Default)]
pub struct ChromeOptions {
    /// DevTools endpoint of a running Chrome to attach to.
    pub attach_url: Option<String>,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

impl ChromeHost {
    /// Attaches to `attach_url` (a browser websocket URL, see
    /// [`discover_debugger`]) when given and reachable, otherwise launches
    /// Chrome on a persistent agent profile.
    pub fn launch(options: &ChromeOptions) -> Result<Self> {
        if let Some(url) = &options.attach_url {
            info!(%url, "attempting to attach to existing Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    info!("attached to existing Chrome");
                    return Ok(Self { browser });
                }
                Err(e) => warn!(error = %e, "could not attach, launching a new Chrome"),
            }
        }

        let chrome_path = match &options.chrome_path {
            Some(path) => path.clone(),
            None => find_chrome()?,
        };
        let profile = agent_profile_dir()?;
        std::fs::create_dir_all(&profile).map_err(AgentError::browser)?;
        debug!(?profile, "using agent profile");

        let launch = LaunchOptions {
            headless: options.headless,
            path: Some(chrome_path),
            user_data_dir: Some(profile),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        let browser = Browser::new(launch).map_err(AgentError::browser)?;
        info!("Chrome launched");
        Ok(Self { browser })
    }

    /// First tab showing a page, or a fresh one.
    pub fn initial_tab(&self) -> Result<TabId> {
        if let Some(tab) = self.tabs()?.first() {
            return Ok(TabId::new(tab.get_target_id().clone()));
        }
        let tab = self.browser.new_tab().map_err(AgentError::browser)?;
        Ok(TabId::new(tab.get_target_id().clone()))
    }

    fn tabs(&self) -> Result<Vec<Arc<Tab>>> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map_err(|_| AgentError::Browser("tab list lock poisoned".into()))?;
        Ok(tabs.clone())
    }

    fn tab(&self, id: &TabId) -> Result<Arc<Tab>> {
        self.tabs()?
            .into_iter()
            .find(|tab| tab.get_target_id() == id.as_str())
            .ok_or_else(|| AgentError::Browser(format!("tab {id} is gone")))
    }
}

/// Runs a blocking CDP call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AgentError::Browser(format!("CDP task panicked: {e}")))?
        .map_err(AgentError::browser)
}

fn evaluate(tab: &Tab, script: &str) -> anyhow::Result<Value> {
    Ok(tab.evaluate(script, false)?.value.unwrap_or(Value::Null))
}

fn describe(tab: &Tab) -> TabInfo {
    TabInfo {
        id: TabId::new(tab.get_target_id().clone()),
        url: tab.get_url(),
        title: tab.get_title().unwrap_or_default(),
    }
}

#[async_trait]
impl TabHost for ChromeHost {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let tabs = self.tabs()?;
        blocking(move || Ok(tabs.iter().map(|tab| describe(tab)).collect())).await
    }

    async fn tab_info(&self, tab: &TabId) -> Result<TabInfo> {
        let tab = self.tab(tab)?;
        blocking(move || Ok(describe(&tab))).await
    }

    async fn is_load_complete(&self, tab: &TabId) -> Result<bool> {
        let tab = self.tab(tab)?;
        let state = blocking(move || evaluate(&tab, "document.readyState")).await;
        Ok(matches!(state, Ok(Value::String(s)) if s == "complete"))
    }

    async fn inject_script(&self, tab: &TabId, script: &str) -> Result<()> {
        let tab = self.tab(tab)?;
        let script = script.to_string();
        blocking(move || evaluate(&tab, &script).map(|_| ())).await
    }

    async fn navigate(&self, tab: &TabId, url: &str) -> Result<()> {
        let tab = self.tab(tab)?;
        let url = url.to_string();
        blocking(move || {
            tab.navigate_to(&url)?;
            Ok(())
        })
        .await
    }

    async fn go_back(&self, tab: &TabId) -> Result<()> {
        let tab = self.tab(tab)?;
        blocking(move || evaluate(&tab, "history.back()").map(|_| ())).await
    }

    async fn open_tab(&self, url: &str) -> Result<TabId> {
        let browser = self.browser.clone();
        let url = url.to_string();
        blocking(move || {
            let tab = browser.new_tab()?;
            tab.navigate_to(&url)?;
            tab.activate()?;
            Ok(TabId::new(tab.get_target_id().clone()))
        })
        .await
    }

    async fn activate(&self, tab: &TabId) -> Result<()> {
        let tab = self.tab(tab)?;
        blocking(move || {
            tab.activate()?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, tab: &TabId, key: &str) -> Result<()> {
        let tab = self.tab(tab)?;
        let key = key.to_string();
        blocking(move || {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PageTransport for ChromeHost {
    async fn send(&self, tab: &TabId, request: &BridgeRequest) -> std::result::Result<Value, TransportError> {
        let tab = self
            .tab(tab)
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        let payload =
            serde_json::to_string(request).map_err(|e| TransportError::Failed(e.to_string()))?;
        let script = format!(
            "(() => {{ const i = window.__tabpilotInspector; return i ? i.handle({payload}) : null; }})()"
        );
        let reply = blocking(move || evaluate(&tab, &script))
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        match reply {
            Value::String(text) => {
                serde_json::from_str(&text).map_err(|e| TransportError::Failed(e.to_string()))
            }
            _ => Err(TransportError::ReceiverAbsent),
        }
    }
}

#[async_trait]
impl SnapshotSource for ChromeHost {
    async fn capture_visible(&self, tab: &TabId) -> Option<VisualSnapshot> {
        let tab = self.tab(tab).ok()?;
        let captured = blocking(move || {
            Ok(tab.capture_screenshot(
                CaptureScreenshotFormatOption::Jpeg,
                Some(SNAPSHOT_JPEG_QUALITY),
                None,
                true,
            )?)
        })
        .await;
        match captured {
            Ok(data) => Some(VisualSnapshot {
                media_type: "image/jpeg".to_string(),
                data,
            }),
            Err(e) => {
                debug!(error = %e, "screenshot failed");
                None
            }
        }
    }
}

/// Resolves a DevTools HTTP endpoint such as `http://127.0.0.1:9222` to the
/// browser websocket URL. `None` when nothing answers there.
pub async fn discover_debugger(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Some(endpoint.to_string());
    }
    let client = reqwest::Client::builder()
        .timeout(DISCOVERY_TIMEOUT)
        .build()
        .ok()?;
    let version: Value = client
        .get(format!("{}/json/version", endpoint.trim_end_matches('/')))
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    let url = version["webSocketDebuggerUrl"].as_str().map(str::to_string);
    debug!(endpoint, found = url.is_some(), "devtools discovery");
    url
}

fn agent_profile_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| AgentError::Browser("no local data directory".into()))?;
    Ok(base.join("tabpilot").join("chrome-profile"))
}

fn find_chrome() -> Result<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/google-chrome-stable"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }

    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| {
            AgentError::Browser(
                "Chrome executable not found. Install Google Chrome or pass --chrome-path.".into(),
            )
        })
}

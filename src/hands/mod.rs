//! Tab Lifecycle Manager: which tabs may be inspected, keeping the
//! inspector alive in them, waiting out navigations, and finding tabs that
//! already show a URL.

pub mod chrome;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::ChannelBridge;
use crate::config::AgentConfig;
use crate::dom::INSPECTOR_JS;
use crate::error::{AgentError, Result};
use crate::types::TabId;

const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

const BLOCKED_SCHEMES: &[&str] = &[
    "about",
    "blob",
    "brave",
    "chrome",
    "chrome-extension",
    "chrome-search",
    "chrome-untrusted",
    "data",
    "devtools",
    "edge",
    "javascript",
    "moz-extension",
    "opera",
    "view-source",
];

/// Store pages where browsers refuse content scripts.
const BLOCKED_HOSTS: &[(&str, &str)] = &[
    ("chromewebstore.google.com", ""),
    ("chrome.google.com", "/webstore"),
    ("microsoftedge.microsoft.com", "/addons"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    pub title: String,
}

/// Browser operations the agent needs beyond the inspector channel.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>>;
    async fn tab_info(&self, tab: &TabId) -> Result<TabInfo>;
    /// `document.readyState == "complete"`; `false` while that cannot be read.
    async fn is_load_complete(&self, tab: &TabId) -> Result<bool>;
    async fn inject_script(&self, tab: &TabId, script: &str) -> Result<()>;
    async fn navigate(&self, tab: &TabId, url: &str) -> Result<()>;
    async fn go_back(&self, tab: &TabId) -> Result<()>;
    async fn open_tab(&self, url: &str) -> Result<TabId>;
    async fn activate(&self, tab: &TabId) -> Result<()>;
    async fn press_key(&self, tab: &TabId, key: &str) -> Result<()>;
}

/// A URL is inspectable unless it belongs to a browser-internal, extension,
/// blank, data or view-source page (or a store page that blocks scripts).
pub fn is_inspectable(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw.trim()) else {
        return false;
    };
    if BLOCKED_SCHEMES.contains(&url.scheme()) {
        return false;
    }
    let host = url.host_str().unwrap_or_default();
    !BLOCKED_HOSTS
        .iter()
        .any(|(blocked, prefix)| host == *blocked && url.path().starts_with(prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// Same origin only.
    Origin = 1,
    /// Same origin, one path is a segment prefix of the other.
    PathPrefix = 2,
    /// Equal after dropping the fragment and trailing slashes.
    Exact = 3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabMatch {
    pub tab: TabInfo,
    pub tier: MatchTier,
}

/// Fragment- and trailing-slash-insensitive form of a URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);
    let mut text = url.to_string();
    while text.ends_with('/') {
        text.pop();
    }
    Some(text)
}

fn trimmed_path(url: &Url) -> &str {
    url.path().trim_end_matches('/')
}

fn paths_compatible(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let is_prefix = |short: &str, long: &str| {
        long == short
            || (long.starts_with(short) && long.as_bytes().get(short.len()) == Some(&b'/'))
    };
    is_prefix(a, b) || is_prefix(b, a)
}

fn match_tier(target: &Url, target_norm: &str, candidate: &str) -> Option<MatchTier> {
    if normalize_url(candidate).as_deref() == Some(target_norm) {
        return Some(MatchTier::Exact);
    }
    let candidate = Url::parse(candidate.trim()).ok()?;
    if !target.origin().is_tuple() || candidate.origin() != target.origin() {
        return None;
    }
    if paths_compatible(trimmed_path(target), trimmed_path(&candidate)) {
        Some(MatchTier::PathPrefix)
    } else {
        Some(MatchTier::Origin)
    }
}

/// Most precise match for `target` among `tabs`; ties go to the earlier tab.
pub fn best_tab_match(target: &str, tabs: &[TabInfo]) -> Option<TabMatch> {
    let target_url = Url::parse(target.trim()).ok()?;
    let target_norm = normalize_url(target)?;
    let mut best: Option<TabMatch> = None;
    for tab in tabs {
        let Some(tier) = match_tier(&target_url, &target_norm, &tab.url) else {
            continue;
        };
        if best.as_ref().is_none_or(|b| tier > b.tier) {
            best = Some(TabMatch {
                tab: tab.clone(),
                tier,
            });
        }
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationWait {
    Loaded,
    TimedOut,
}

pub struct TabLifecycle {
    host: Arc<dyn TabHost>,
    bridge: ChannelBridge,
    reinject_pause: Duration,
    navigation_timeout: Duration,
    navigation_settle: Duration,
}

impl TabLifecycle {
    pub fn new(host: Arc<dyn TabHost>, bridge: ChannelBridge, config: &AgentConfig) -> Self {
        Self {
            host,
            bridge,
            reinject_pause: config.reinject_pause,
            navigation_timeout: config.navigation_timeout,
            navigation_settle: config.navigation_settle,
        }
    }

    pub fn host(&self) -> &Arc<dyn TabHost> {
        &self.host
    }

    pub fn default_navigation_timeout(&self) -> Duration {
        self.navigation_timeout
    }

    /// Makes sure the inspector answers in `tab`, injecting it at most once.
    pub async fn ensure_ready(&self, tab: &TabId) -> Result<TabInfo> {
        let info = self.host.tab_info(tab).await?;
        if !is_inspectable(&info.url) {
            return Err(AgentError::NavigationBlocked { url: info.url });
        }

        let first = match self.bridge.ping(tab).await {
            Ok(()) => return Ok(info),
            Err(err) => err,
        };
        debug!(%tab, error = %first, "inspector not answering, injecting");

        self.host.inject_script(tab, INSPECTOR_JS).await?;
        tokio::time::sleep(self.reinject_pause).await;

        match self.bridge.ping(tab).await {
            Ok(()) => {
                info!(%tab, "inspector injected");
                Ok(info)
            }
            Err(err) => {
                warn!(%tab, error = %err, "inspector still unresponsive after injection");
                Err(AgentError::ConnectionLost {
                    tab: tab.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Waits for load-complete (or `timeout`), then the settle delay.
    /// A timeout is not an error: slow pages are observed as they are.
    pub async fn wait_for_navigation(&self, tab: &TabId, timeout: Duration) -> NavigationWait {
        let deadline = Instant::now() + timeout;
        let outcome = loop {
            // A wedged renderer can leave the query itself hanging.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let check = tokio::time::timeout(remaining, self.host.is_load_complete(tab)).await;
            if matches!(check, Ok(Ok(true))) {
                break NavigationWait::Loaded;
            }
            if Instant::now() >= deadline {
                warn!(%tab, ?timeout, "navigation did not complete in time");
                break NavigationWait::TimedOut;
            }
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
        };
        tokio::time::sleep(self.navigation_settle).await;
        outcome
    }

    pub async fn find_existing_tab(&self, target: &str) -> Result<Option<TabMatch>> {
        let tabs = self.host.list_tabs().await?;
        Ok(best_tab_match(target, &tabs))
    }
}

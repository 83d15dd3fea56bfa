//! Action Dispatcher: resolves one [`Action`] to inspector or tab calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::brain::catalog::Action;
use crate::bridge::{BridgeError, ChannelBridge};
use crate::dom::describe_action_result;
use crate::error::{AgentError, Result};
use crate::hands::{MatchTier, NavigationWait, TabInfo, TabLifecycle, best_tab_match, is_inspectable};
use crate::types::{ActionResult, ElementRef, TabId};

/// How long a click or key press gets to open a tab or start a navigation
/// before the outcome is checked.
const PAGE_CHANGE_PAUSE: Duration = Duration::from_millis(500);

/// Schemes kept as typed; anything else without `://` is taken for a host.
const LITERAL_SCHEMES: &[&str] = &["about:", "data:", "javascript:", "view-source:", "file:"];

pub struct ActionDispatcher {
    lifecycle: Arc<TabLifecycle>,
    bridge: ChannelBridge,
}

impl ActionDispatcher {
    pub fn new(lifecycle: Arc<TabLifecycle>, bridge: ChannelBridge) -> Self {
        Self { lifecycle, bridge }
    }

    /// Executes `action` against `tab`. `Err` is a step-level error the
    /// controller turns into a failed result.
    pub async fn dispatch(&self, tab: &TabId, action: &Action) -> Result<ActionResult> {
        debug!(%tab, action = action.name(), "dispatching");
        match action {
            Action::Click { target } => self.click(tab, target).await,
            Action::Type { target, text } => {
                self.page_action(tab, "type", json!({"ref": target, "text": text}))
                    .await
            }
            Action::Clear { target } => self.page_action(tab, "clear", json!({"ref": target})).await,
            Action::Select { target, value } => {
                self.page_action(tab, "select", json!({"ref": target, "value": value}))
                    .await
            }
            Action::Hover { target } => self.page_action(tab, "hover", json!({"ref": target})).await,
            Action::Scroll {
                target: Some(target),
                ..
            } => {
                self.page_action(tab, "scroll_into_view", json!({"ref": target}))
                    .await
            }
            Action::Scroll {
                direction,
                target: None,
            } => {
                self.page_action(tab, "scroll", json!({"direction": direction.as_str()}))
                    .await
            }
            Action::PressKey { key } => {
                let host = self.lifecycle.host();
                let before = host.tab_info(tab).await?.url;
                host.press_key(tab, key).await?;
                tokio::time::sleep(PAGE_CHANGE_PAUSE).await;
                self.note_navigation(tab, &before, ActionResult::ok(format!("Pressed {key}")))
                    .await
            }
            Action::Navigate { url } => self.navigate(tab, url).await,
            Action::GoBack {} => {
                self.lifecycle.host().go_back(tab).await?;
                let wait = self.wait(tab).await;
                Ok(ActionResult::ok(format!("Went back{}", wait_note(wait))).with_navigation())
            }
            Action::OpenTab { url } => self.open_tab(url).await,
            Action::SwitchTab { tab_id, url } => self.switch_tab(tab, tab_id.as_ref(), url.as_deref()).await,
            Action::ListTabs {} => {
                let tabs = self.lifecycle.host().list_tabs().await?;
                Ok(ActionResult::ok(render_tabs(&tabs, tab)))
            }
            Action::WaitAndObserve { .. } => Ok(ActionResult::ok(format!(
                "Waited {:.1}s",
                action.settle_delay().as_secs_f64()
            ))),
            Action::TaskComplete { summary } => Ok(ActionResult::ok(summary.clone())),
            Action::TaskFailed { reason } => Ok(ActionResult::ok(reason.clone())),
        }
    }

    async fn page_action(&self, tab: &TabId, name: &str, args: serde_json::Value) -> Result<ActionResult> {
        let reply = self
            .bridge
            .execute(tab, name, args)
            .await
            .map_err(|err| bridge_failure(tab, err))?;
        Ok(ActionResult::ok(describe_action_result(&reply)))
    }

    async fn click(&self, tab: &TabId, target: &ElementRef) -> Result<ActionResult> {
        let host = self.lifecycle.host();
        let tabs = host.list_tabs().await?;
        let url_before = tabs
            .iter()
            .find(|t| &t.id == tab)
            .map(|t| t.url.clone())
            .unwrap_or_default();
        let before: HashSet<TabId> = tabs.into_iter().map(|t| t.id).collect();
        let result = self.page_action(tab, "click", json!({"ref": target})).await?;

        tokio::time::sleep(PAGE_CHANGE_PAUSE).await;
        let opened = host
            .list_tabs()
            .await?
            .into_iter()
            .find(|t| !before.contains(&t.id));
        match opened {
            Some(new_tab) => {
                info!(tab = %new_tab.id, url = %new_tab.url, "click opened a new tab");
                host.activate(&new_tab.id).await?;
                Ok(ActionResult::switched(
                    format!(
                        "{}. This opened a new tab ({}), which is now active.",
                        result.message, new_tab.url
                    ),
                    new_tab.id,
                ))
            }
            None => self.note_navigation(tab, &url_before, result).await,
        }
    }

    /// Marks `result` as a navigation when the tab left `url_before`, and
    /// lets the new document load.
    async fn note_navigation(
        &self,
        tab: &TabId,
        url_before: &str,
        result: ActionResult,
    ) -> Result<ActionResult> {
        let url = self.lifecycle.host().tab_info(tab).await?.url;
        if url == url_before {
            return Ok(result);
        }
        info!(%tab, from = url_before, to = %url, "page navigated");
        let wait = self.wait(tab).await;
        let message = format!("{}. The page is now {url}{}", result.message, wait_note(wait));
        Ok(ActionResult::ok(message).with_navigation())
    }

    async fn navigate(&self, tab: &TabId, raw: &str) -> Result<ActionResult> {
        let url = navigation_target(raw)?;
        if let Some(found) = self.lifecycle.find_existing_tab(&url).await? {
            if found.tier == MatchTier::Exact && &found.tab.id != tab {
                self.lifecycle.host().activate(&found.tab.id).await?;
                return Ok(ActionResult::switched(
                    format!("{url} is already open in another tab; switched to it."),
                    found.tab.id,
                ));
            }
        }

        self.lifecycle.host().navigate(tab, &url).await?;
        let wait = self.wait(tab).await;
        Ok(ActionResult::ok(format!("Navigated to {url}{}", wait_note(wait))).with_navigation())
    }

    async fn open_tab(&self, raw: &str) -> Result<ActionResult> {
        let url = navigation_target(raw)?;
        let host = self.lifecycle.host();
        if let Some(found) = self.lifecycle.find_existing_tab(&url).await? {
            host.activate(&found.tab.id).await?;
            if found.tier == MatchTier::Exact {
                return Ok(ActionResult::switched(
                    format!("Switched to the tab already showing {url}."),
                    found.tab.id,
                ));
            }
            host.navigate(&found.tab.id, &url).await?;
            let wait = self.wait(&found.tab.id).await;
            return Ok(ActionResult::switched(
                format!(
                    "Reused the open tab on {} and navigated it to {url}{}",
                    found.tab.url,
                    wait_note(wait)
                ),
                found.tab.id,
            ));
        }

        let id = host.open_tab(&url).await?;
        let wait = self.wait(&id).await;
        Ok(ActionResult::switched(format!("Opened {url} in a new tab{}", wait_note(wait)), id))
    }

    async fn switch_tab(&self, current: &TabId, tab_id: Option<&TabId>, url: Option<&str>) -> Result<ActionResult> {
        let tabs = self.lifecycle.host().list_tabs().await?;
        let target = match (tab_id, url) {
            (Some(id), _) => tabs.iter().find(|t| &t.id == id).cloned().ok_or_else(|| {
                AgentError::ActionFailed(format!("No tab with id {id}. {}", render_tabs(&tabs, current)))
            })?,
            (None, Some(url)) => {
                let url = navigation_target(url)?;
                best_tab_match(&url, &tabs)
                    .map(|found| found.tab)
                    .ok_or_else(|| AgentError::ActionFailed(format!("No open tab matches {url}")))?
            }
            (None, None) => {
                return Err(AgentError::ActionFailed(
                    "switch_tab needs a tab_id or a url".into(),
                ));
            }
        };

        if &target.id == current {
            return Ok(ActionResult::ok(format!("Already on {}", target.url)));
        }
        self.lifecycle.host().activate(&target.id).await?;
        Ok(ActionResult::switched(
            format!("Switched to tab \"{}\" ({})", target.title, target.url),
            target.id,
        ))
    }

    async fn wait(&self, tab: &TabId) -> NavigationWait {
        self.lifecycle
            .wait_for_navigation(tab, self.lifecycle.default_navigation_timeout())
            .await
    }
}

fn bridge_failure(tab: &TabId, err: BridgeError) -> AgentError {
    match err {
        BridgeError::Page(message) => AgentError::ActionFailed(message),
        other => AgentError::ConnectionLost {
            tab: tab.clone(),
            reason: other.to_string(),
        },
    }
}

fn wait_note(wait: NavigationWait) -> &'static str {
    match wait {
        NavigationWait::Loaded => "",
        NavigationWait::TimedOut => " (the page was still loading)",
    }
}

/// Completes bare hosts to `https://` URLs and refuses pages the
/// inspector cannot run in.
pub fn navigation_target(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AgentError::ActionFailed("URL is empty".into()));
    }
    let candidate = if raw.contains("://") || LITERAL_SCHEMES.iter().any(|s| raw.starts_with(s)) {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&candidate)
        .map_err(|e| AgentError::ActionFailed(format!("Invalid URL '{raw}': {e}")))?;
    if !is_inspectable(url.as_str()) {
        return Err(AgentError::ActionFailed(format!(
            "{url} is a browser-internal or privileged page the agent cannot operate on"
        )));
    }
    Ok(url.to_string())
}

fn render_tabs(tabs: &[TabInfo], current: &TabId) -> String {
    if tabs.is_empty() {
        return "No open tabs.".to_string();
    }
    let mut out = String::from("Open tabs:");
    for tab in tabs {
        out.push_str(&format!("\n- [{}] \"{}\" {}", tab.id, tab.title, tab.url));
        if &tab.id == current {
            out.push_str(" (active)");
        }
    }
    out
}

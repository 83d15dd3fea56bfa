#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tabpilot::bridge::{BridgeRequest, PageTransport, SnapshotSource, TransportError};
use tabpilot::brain::catalog::ToolDeclaration;
use tabpilot::hands::{TabHost, TabInfo};
use tabpilot::types::{ActionCall, ActionRequest, ConversationTurn, Role, TabId, VisualSnapshot};
use tabpilot::{Agent, AgentConfig, AgentError, Decision, DecisionService};

#[derive(Clone)]
pub struct FakeElement {
    pub element_ref: String,
    pub role: String,
    pub tag: String,
    pub name: String,
    /// URL a click on this element opens in a new tab.
    pub opens: Option<String>,
    /// URL a click on this element loads in the same tab.
    pub navigates: Option<String>,
}

pub fn element(element_ref: &str, role: &str, tag: &str, name: &str) -> FakeElement {
    FakeElement {
        element_ref: element_ref.into(),
        role: role.into(),
        tag: tag.into(),
        name: name.into(),
        opens: None,
        navigates: None,
    }
}

/// A link that loads `url` in its own tab when clicked.
pub fn same_tab_link(element_ref: &str, name: &str, url: &str) -> FakeElement {
    let mut link = element(element_ref, "link", "a", name);
    link.navigates = Some(url.into());
    link
}

#[derive(Clone)]
pub struct FakeTab {
    pub id: TabId,
    pub url: String,
    pub title: String,
    pub inspector: bool,
    pub scroll_percent: u32,
    pub elements: Vec<FakeElement>,
}

impl FakeTab {
    pub fn new(id: &str, url: &str) -> Self {
        let mut popup = element("e3", "link", "a", "Open report");
        popup.opens = Some("https://reports.example.com/q3".into());
        Self {
            id: TabId::new(id),
            url: url.into(),
            title: format!("Title of {url}"),
            inspector: true,
            scroll_percent: 0,
            elements: vec![
                element("e1", "textbox", "input", "Search"),
                element("e2", "button", "button", "Go"),
                popup,
            ],
        }
    }

    fn info(&self) -> TabInfo {
        TabInfo {
            id: self.id.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
        }
    }

    fn tree(&self) -> Value {
        let elements: Vec<Value> = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let top = 20.0 + 40.0 * i as f64;
                json!({
                    "ref": e.element_ref, "role": e.role, "tag": e.tag, "name": e.name,
                    "rect": {"top": top, "bottom": top + 30.0, "width": 120, "height": 30},
                    "display": "block", "visibility": "visible", "opacity": 1,
                    "focused": false, "disabled": false
                })
            })
            .collect();
        json!({
            "title": self.title,
            "url": self.url,
            "viewport_height": 800,
            "scroll": {
                "percent": self.scroll_percent,
                "at_top": self.scroll_percent == 0,
                "at_bottom": self.scroll_percent >= 100
            },
            "elements": elements
        })
    }
}

#[derive(Default)]
pub struct BrowserState {
    pub tabs: Vec<FakeTab>,
    pub active: Option<TabId>,
    /// Page actions and key presses, in execution order.
    pub log: Vec<String>,
    pub injections: usize,
    pub inject_works: bool,
    pub captures: usize,
}

/// In-memory browser: tabs, an inspector that forgets itself on
/// navigation, and a screenshot counter.
pub struct FakeBrowser {
    pub state: Mutex<BrowserState>,
    next_tab: AtomicUsize,
}

impl FakeBrowser {
    pub fn new(tabs: Vec<FakeTab>) -> Arc<Self> {
        let active = tabs.first().map(|t| t.id.clone());
        let next_tab = tabs.len();
        Arc::new(Self {
            state: Mutex::new(BrowserState {
                tabs,
                active,
                inject_works: true,
                ..Default::default()
            }),
            next_tab: AtomicUsize::new(next_tab),
        })
    }

    pub fn single(url: &str) -> Arc<Self> {
        Self::new(vec![FakeTab::new("t0", url)])
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn injections(&self) -> usize {
        self.state.lock().unwrap().injections
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().unwrap().tabs.len()
    }

    pub fn tab_url(&self, id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.tabs.iter().find(|t| t.id.as_str() == id).map(|t| t.url.clone())
    }

    fn with_tab<T>(&self, id: &TabId, f: impl FnOnce(&mut FakeTab) -> T) -> tabpilot::Result<T> {
        let mut state = self.state.lock().unwrap();
        let tab = state
            .tabs
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| AgentError::Browser(format!("tab {id} is gone")))?;
        Ok(f(tab))
    }

    fn load(tab: &mut FakeTab, url: &str) {
        tab.url = url.to_string();
        tab.title = format!("Title of {url}");
        tab.inspector = false;
        tab.scroll_percent = 0;
    }
}

#[async_trait]
impl TabHost for FakeBrowser {
    async fn list_tabs(&self) -> tabpilot::Result<Vec<TabInfo>> {
        Ok(self.state.lock().unwrap().tabs.iter().map(FakeTab::info).collect())
    }

    async fn tab_info(&self, tab: &TabId) -> tabpilot::Result<TabInfo> {
        self.with_tab(tab, |t| t.info())
    }

    async fn is_load_complete(&self, _: &TabId) -> tabpilot::Result<bool> {
        Ok(true)
    }

    async fn inject_script(&self, tab: &TabId, _: &str) -> tabpilot::Result<()> {
        let works = {
            let mut state = self.state.lock().unwrap();
            state.injections += 1;
            state.inject_works
        };
        self.with_tab(tab, |t| t.inspector = works)
    }

    async fn navigate(&self, tab: &TabId, url: &str) -> tabpilot::Result<()> {
        self.state.lock().unwrap().log.push(format!("navigate {url}"));
        self.with_tab(tab, |t| Self::load(t, url))
    }

    async fn go_back(&self, tab: &TabId) -> tabpilot::Result<()> {
        self.with_tab(tab, |t| t.inspector = false)
    }

    async fn open_tab(&self, url: &str) -> tabpilot::Result<TabId> {
        let id = TabId::new(format!("t{}", self.next_tab.fetch_add(1, Ordering::SeqCst)));
        let mut tab = FakeTab::new(id.as_str(), url);
        Self::load(&mut tab, url);
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("open_tab {url}"));
        state.tabs.push(tab);
        state.active = Some(id.clone());
        Ok(id)
    }

    async fn activate(&self, tab: &TabId) -> tabpilot::Result<()> {
        self.state.lock().unwrap().active = Some(tab.clone());
        Ok(())
    }

    async fn press_key(&self, _: &TabId, key: &str) -> tabpilot::Result<()> {
        self.state.lock().unwrap().log.push(format!("press_key {key}"));
        Ok(())
    }
}

#[async_trait]
impl PageTransport for FakeBrowser {
    async fn send(&self, tab: &TabId, request: &BridgeRequest) -> Result<Value, TransportError> {
        let mut state = self.state.lock().unwrap();
        let Some(index) = state.tabs.iter().position(|t| &t.id == tab) else {
            return Err(TransportError::Failed(format!("tab {tab} is gone")));
        };
        if !state.tabs[index].inspector {
            return Err(TransportError::ReceiverAbsent);
        }

        let (name, args) = match request {
            BridgeRequest::Ping => return Ok(json!({"pong": true})),
            BridgeRequest::GetTree => return Ok(json!({"result": state.tabs[index].tree()})),
            BridgeRequest::ExecuteAction { name, args } => (name.clone(), args.clone()),
        };

        if name == "scroll" {
            let tab = &mut state.tabs[index];
            tab.scroll_percent = if args["direction"] == "up" {
                tab.scroll_percent.saturating_sub(35)
            } else {
                (tab.scroll_percent + 35).min(100)
            };
            let percent = tab.scroll_percent;
            state.log.push(format!("scroll {}", args["direction"].as_str().unwrap_or("down")));
            return Ok(json!({"result": {
                "message": "Scrolled down",
                "scroll": {"percent": percent, "at_top": percent == 0, "at_bottom": percent >= 100}
            }}));
        }

        let element_ref = args["ref"].as_str().unwrap_or_default().to_string();
        let Some(target) = state.tabs[index]
            .elements
            .iter()
            .find(|e| e.element_ref == element_ref)
            .cloned()
        else {
            return Ok(json!({"error": format!("No element with ref {element_ref}; refresh the tree")}));
        };
        state.log.push(format!("{name} {element_ref}"));

        if name == "click" {
            if let Some(url) = target.opens {
                let id = TabId::new(format!("t{}", self.next_tab.fetch_add(1, Ordering::SeqCst)));
                let mut tab = FakeTab::new(id.as_str(), &url);
                FakeBrowser::load(&mut tab, &url);
                state.tabs.push(tab);
            } else if let Some(url) = target.navigates {
                FakeBrowser::load(&mut state.tabs[index], &url);
            }
        }
        Ok(json!({"result": format!("{name} done on {element_ref}")}))
    }
}

#[async_trait]
impl SnapshotSource for FakeBrowser {
    async fn capture_visible(&self, _: &TabId) -> Option<VisualSnapshot> {
        self.state.lock().unwrap().captures += 1;
        Some(VisualSnapshot {
            media_type: "image/jpeg".into(),
            data: vec![0xff, 0xd8, 0xff],
        })
    }
}

pub type Sent = Arc<Mutex<Vec<Vec<ConversationTurn>>>>;

/// Replays a fixed script of decisions, then scrolls forever.
pub struct ScriptedDecider {
    script: Vec<tabpilot::Result<Decision>>,
    sent: Sent,
}

impl ScriptedDecider {
    pub fn new(script: Vec<tabpilot::Result<Decision>>) -> (Box<Self>, Sent) {
        let sent = Sent::default();
        (
            Box::new(Self {
                script,
                sent: sent.clone(),
            }),
            sent,
        )
    }
}

#[async_trait]
impl DecisionService for ScriptedDecider {
    async fn exchange(
        &mut self,
        turns: &[ConversationTurn],
        _: &[ToolDeclaration],
    ) -> tabpilot::Result<Decision> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(turns.to_vec());
        if self.script.is_empty() {
            let n = sent.len();
            return Ok(decide(vec![call(&format!("auto{n}"), "scroll", json!({}))]));
        }
        self.script.remove(0)
    }
}

pub fn call(id: &str, name: &str, arguments: Value) -> ActionCall {
    ActionCall {
        call_id: id.into(),
        request: ActionRequest {
            name: name.into(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
        },
    }
}

pub fn decide(calls: Vec<ActionCall>) -> Decision {
    Decision {
        narrative: None,
        calls,
    }
}

pub fn step(id: &str, name: &str, arguments: Value) -> tabpilot::Result<Decision> {
    Ok(decide(vec![call(id, name, arguments)]))
}

pub fn agent(browser: &Arc<FakeBrowser>) -> Agent {
    agent_with(browser, AgentConfig::default())
}

pub fn agent_with(browser: &Arc<FakeBrowser>, config: AgentConfig) -> Agent {
    Agent::new(config, browser.clone(), browser.clone(), browser.clone())
}

/// Requester turns the decider actually received, in order.
pub fn observations(sent: &Sent) -> Vec<ConversationTurn> {
    sent.lock()
        .unwrap()
        .iter()
        .flatten()
        .filter(|turn| turn.role == Role::Requester)
        .cloned()
        .collect()
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on the number of elements serialized into one tree.
pub const MAX_TREE_ELEMENTS: usize = 150;

/// Browser-assigned identifier of a tab (a CDP target id for Chrome).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for one interactive element, valid only for the observation that
/// produced it. The inspector stamps it on the element as `data-tp-ref`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ElementRef(pub String);

impl From<String> for ElementRef {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<ElementRef> for String {
    fn from(element: ElementRef) -> Self {
        element.0
    }
}

impl ElementRef {
    /// Accepts `e12` as well as the bracketed `[e12]` form the tree shows.
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.trim()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .trim()
                .to_string(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Screenshot of the visible viewport.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualSnapshot {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// What the agent sees of the active tab at the start of a step.
#[derive(Debug, Clone, Default)]
pub struct PageObservation {
    pub title: String,
    pub url: String,
    pub tree: String,
    pub snapshot: Option<VisualSnapshot>,
    pub error: Option<String>,
}

impl PageObservation {
    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A tool call as the decision service emitted it, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// An [`ActionRequest`] plus the id the decision service uses to pair it
/// with its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub call_id: String,
    pub request: ActionRequest,
}

/// Outcome of one dispatched action, folded back into the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub message: String,
    pub success: bool,
    /// Set when the session must rebind to another tab before observing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_to: Option<TabId>,
    /// The tab now shows another document, so refs handed out before are gone.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub navigated: bool,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
            switch_to: None,
            navigated: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: false,
            switch_to: None,
            navigated: false,
        }
    }

    pub fn switched(message: impl Into<String>, tab: TabId) -> Self {
        Self {
            message: message.into(),
            success: true,
            switch_to: Some(tab),
            navigated: false,
        }
    }

    pub fn with_navigation(mut self) -> Self {
        self.navigated = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requester,
    Decider,
    ActionResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnPart {
    Text(String),
    Image(VisualSnapshot),
    Call(ActionCall),
    Response {
        call_id: String,
        name: String,
        output: String,
    },
}

/// One entry of the append-only conversation log.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub role: Role,
    pub parts: Vec<TurnPart>,
}

impl ConversationTurn {
    pub fn new(role: Role, parts: Vec<TurnPart>) -> Self {
        Self { role, parts }
    }

    /// Concatenated text parts, mostly for logging and tests.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                TurnPart::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_image(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, TurnPart::Image(_)))
    }
}

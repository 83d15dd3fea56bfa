//! Tool catalog offered to the decision service and the closed [`Action`]
//! type its calls are validated into.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AgentError;
use crate::types::{ActionRequest, ElementRef, TabId};

const DEFAULT_WAIT_SECS: f64 = 2.0;
const MAX_WAIT_SECS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

fn tool(name: &str, description: &str, parameters: serde_json::Value) -> ToolDeclaration {
    ToolDeclaration {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn ref_only(what: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "ref": { "type": "string", "description": format!("Element ref from the latest observation, e.g. \"e12\", of the element to {what}") }
        },
        "required": ["ref"]
    })
}

fn no_arguments() -> serde_json::Value {
    json!({ "type": "object", "properties": {} })
}

pub fn tool_catalog() -> Vec<ToolDeclaration> {
    vec![
        tool(
            "click",
            "Click an element (link, button, checkbox, tab, menu item).",
            ref_only("click"),
        ),
        tool(
            "type",
            "Replace the content of a text field or editable region with the given text. Does not submit; use press_key with Enter for that.",
            json!({
                "type": "object",
                "properties": {
                    "ref": { "type": "string", "description": "Element ref of the field" },
                    "text": { "type": "string", "description": "Text to enter" }
                },
                "required": ["ref", "text"]
            }),
        ),
        tool("clear", "Empty a text field.", ref_only("clear")),
        tool(
            "select",
            "Choose an option of a <select> element by value or visible text.",
            json!({
                "type": "object",
                "properties": {
                    "ref": { "type": "string", "description": "Element ref of the select" },
                    "value": { "type": "string", "description": "Option value or visible text" }
                },
                "required": ["ref", "value"]
            }),
        ),
        tool(
            "hover",
            "Move the pointer over an element, e.g. to open a menu.",
            ref_only("hover"),
        ),
        tool(
            "press_key",
            "Press a key in the page, e.g. Enter to submit a form, Escape, Tab, ArrowDown.",
            json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string", "description": "Key name such as Enter, Escape, Tab, ArrowDown" }
                },
                "required": ["key"]
            }),
        ),
        tool(
            "scroll",
            "Scroll the page by most of a screen, or bring one element into view when ref is given.",
            json!({
                "type": "object",
                "properties": {
                    "direction": { "type": "string", "enum": ["up", "down"], "description": "Defaults to down" },
                    "ref": { "type": "string", "description": "Optional element ref to scroll into view" }
                }
            }),
        ),
        tool(
            "navigate",
            "Load a URL in the current tab. Switches to an already open tab showing the same URL instead.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute URL or host name" }
                },
                "required": ["url"]
            }),
        ),
        tool("go_back", "Go back one entry in the tab history.", no_arguments()),
        tool(
            "open_tab",
            "Open a URL in a new tab, reusing an open tab of the same site when there is one.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute URL or host name" }
                },
                "required": ["url"]
            }),
        ),
        tool(
            "switch_tab",
            "Make another open tab the active one. Give tab_id from list_tabs, or a url to match.",
            json!({
                "type": "object",
                "properties": {
                    "tab_id": { "type": "string", "description": "Tab id as shown by list_tabs" },
                    "url": { "type": "string", "description": "URL of the tab to switch to" }
                }
            }),
        ),
        tool("list_tabs", "List the open tabs with their ids, titles and URLs.", no_arguments()),
        tool(
            "wait_and_observe",
            "Wait for the page to change (loading content, animations) and observe it again.",
            json!({
                "type": "object",
                "properties": {
                    "seconds": { "type": "number", "description": "How long to wait, 0 to 10. Defaults to 2." }
                }
            }),
        ),
        tool(
            "task_complete",
            "Declare the task done. Only call this once the goal is visibly achieved.",
            json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string", "description": "What was done and any answer the user asked for" }
                },
                "required": ["summary"]
            }),
        ),
        tool(
            "task_failed",
            "Give up on the task because it cannot be completed.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Why the task cannot be completed" }
                },
                "required": ["reason"]
            }),
        ),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

impl ScrollDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }
}

/// Every call the decision service can make, with typed arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum Action {
    Click {
        #[serde(rename = "ref")]
        target: ElementRef,
    },
    Type {
        #[serde(rename = "ref")]
        target: ElementRef,
        text: String,
    },
    Clear {
        #[serde(rename = "ref")]
        target: ElementRef,
    },
    Select {
        #[serde(rename = "ref")]
        target: ElementRef,
        value: String,
    },
    Hover {
        #[serde(rename = "ref")]
        target: ElementRef,
    },
    PressKey {
        key: String,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(rename = "ref", default)]
        target: Option<ElementRef>,
    },
    Navigate {
        url: String,
    },
    GoBack {},
    OpenTab {
        url: String,
    },
    SwitchTab {
        #[serde(default)]
        tab_id: Option<TabId>,
        #[serde(default)]
        url: Option<String>,
    },
    ListTabs {},
    WaitAndObserve {
        #[serde(default)]
        seconds: Option<f64>,
    },
    TaskComplete {
        summary: String,
    },
    TaskFailed {
        reason: String,
    },
}

impl Action {
    pub fn from_request(request: &ActionRequest) -> Result<Self, AgentError> {
        if !tool_catalog().iter().any(|t| t.name == request.name) {
            let known: Vec<String> = tool_catalog().into_iter().map(|t| t.name).collect();
            return Err(AgentError::ActionFailed(format!(
                "Unknown action '{}'. Available actions: {}",
                request.name,
                known.join(", ")
            )));
        }
        serde_json::from_value(json!({
            "name": request.name,
            "arguments": request.arguments,
        }))
        .map_err(|e| {
            AgentError::ActionFailed(format!("Invalid arguments for {}: {e}", request.name))
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Clear { .. } => "clear",
            Action::Select { .. } => "select",
            Action::Hover { .. } => "hover",
            Action::PressKey { .. } => "press_key",
            Action::Scroll { .. } => "scroll",
            Action::Navigate { .. } => "navigate",
            Action::GoBack {} => "go_back",
            Action::OpenTab { .. } => "open_tab",
            Action::SwitchTab { .. } => "switch_tab",
            Action::ListTabs {} => "list_tabs",
            Action::WaitAndObserve { .. } => "wait_and_observe",
            Action::TaskComplete { .. } => "task_complete",
            Action::TaskFailed { .. } => "task_failed",
        }
    }

    /// Pause after the action before the page is observed again. Navigation
    /// actions already waited for load inside the lifecycle manager.
    pub fn settle_delay(&self) -> Duration {
        let millis = match self {
            Action::Click { .. } => 1000,
            Action::Type { .. } => 300,
            Action::Clear { .. } => 200,
            Action::Select { .. } => 600,
            Action::Hover { .. } => 400,
            Action::PressKey { key } if key.eq_ignore_ascii_case("enter") => 2500,
            Action::PressKey { .. } => 500,
            Action::Scroll { .. } => 800,
            Action::SwitchTab { .. } => 500,
            Action::WaitAndObserve { seconds } => {
                let secs = seconds.unwrap_or(DEFAULT_WAIT_SECS).clamp(0.0, MAX_WAIT_SECS);
                return Duration::from_secs_f64(secs);
            }
            Action::Navigate { .. }
            | Action::GoBack {}
            | Action::OpenTab { .. }
            | Action::ListTabs {}
            | Action::TaskComplete { .. }
            | Action::TaskFailed { .. } => 0,
        };
        Duration::from_millis(millis)
    }

    /// Whether the next observation should carry a screenshot. Text entry
    /// and key presses never do.
    pub fn is_visually_consequential(&self) -> bool {
        matches!(
            self,
            Action::Click { .. }
                | Action::Select { .. }
                | Action::Hover { .. }
                | Action::Scroll { .. }
                | Action::Navigate { .. }
                | Action::GoBack {}
                | Action::OpenTab { .. }
                | Action::SwitchTab { .. }
                | Action::WaitAndObserve { .. }
        )
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(name: &str, arguments: serde_json::Value) -> ActionRequest {
        ActionRequest {
            name: name.into(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn catalog_names_are_the_canonical_actions() {
        let names: Vec<String> = tool_catalog().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "click",
                "type",
                "clear",
                "select",
                "hover",
                "press_key",
                "scroll",
                "navigate",
                "go_back",
                "open_tab",
                "switch_tab",
                "list_tabs",
                "wait_and_observe",
                "task_complete",
                "task_failed",
            ]
        );
    }

    #[test]
    fn every_catalog_entry_parses_from_minimal_arguments() {
        for decl in tool_catalog() {
            let required = decl.parameters["required"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let mut args = serde_json::Map::new();
            for field in required {
                let field = field.as_str().unwrap().to_string();
                args.insert(field, json!("e1"));
            }
            let action = Action::from_request(&request(&decl.name, serde_json::Value::Object(args)))
                .unwrap_or_else(|e| panic!("{} did not parse: {e}", decl.name));
            assert_eq!(action.name(), decl.name);
        }
    }

    #[test]
    fn parses_typed_arguments() {
        assert_eq!(
            Action::from_request(&request("type", json!({"ref": "[e4]", "text": "hello"}))).unwrap(),
            Action::Type {
                target: ElementRef("e4".into()),
                text: "hello".into()
            }
        );
        assert_eq!(
            Action::from_request(&request("scroll", json!({}))).unwrap(),
            Action::Scroll {
                direction: ScrollDirection::Down,
                target: None
            }
        );
        assert_eq!(
            Action::from_request(&request("task_complete", json!({"summary": "done"}))).unwrap(),
            Action::TaskComplete {
                summary: "done".into()
            }
        );
    }

    #[test]
    fn rejects_unknown_names_and_missing_arguments() {
        let err = Action::from_request(&request("teleport", json!({}))).unwrap_err();
        assert!(err.to_string().contains("Unknown action 'teleport'"));

        let err = Action::from_request(&request("click", json!({}))).unwrap_err();
        assert!(matches!(err, AgentError::ActionFailed(msg) if msg.contains("Invalid arguments for click")));
    }

    #[test]
    fn settle_delays_favor_async_triggers() {
        let enter = Action::PressKey { key: "Enter".into() };
        let navigate = Action::Navigate { url: "https://example.com".into() };
        let scroll = Action::Scroll {
            direction: ScrollDirection::Down,
            target: None,
        };
        assert!(enter.settle_delay() > navigate.settle_delay());
        assert!(enter.settle_delay() > Action::PressKey { key: "Tab".into() }.settle_delay());
        assert_eq!(scroll.settle_delay(), Duration::from_millis(800));
        assert_eq!(
            Action::WaitAndObserve { seconds: Some(60.0) }.settle_delay(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn text_entry_is_not_visually_consequential() {
        let typing = Action::Type {
            target: ElementRef("e1".into()),
            text: "x".into(),
        };
        assert!(!typing.is_visually_consequential());
        assert!(!Action::PressKey { key: "Enter".into() }.is_visually_consequential());
        assert!(Action::Click { target: ElementRef("e1".into()) }.is_visually_consequential());
    }
}

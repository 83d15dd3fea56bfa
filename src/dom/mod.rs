//! Page Inspector.
//!
//! The page-context half lives in `inspector.js`: it enumerates candidates
//! from a fixed allow-list, stamps every candidate with a fresh ref and
//! executes primitive actions by ref. This module is the agent-side half:
//! it decides which candidates make it into the tree and serializes them.

use std::collections::HashSet;
use std::fmt::Write;

use serde::Deserialize;

use crate::types::{ElementRef, MAX_TREE_ELEMENTS};

/// Script injected into the page. Evaluating it twice is harmless.
pub const INSPECTOR_JS: &str = include_str!("inspector.js");

/// Smallest box (px, either side) a non-field element may have.
const MIN_BOX_PX: f64 = 4.0;
/// Form fields are kept down to a near-zero box.
const MIN_FIELD_BOX_PX: f64 = 0.5;
/// Elements up to this many viewport heights above/below the viewport stay in.
const OFFSCREEN_TOLERANCE: f64 = 0.5;
const MIN_OPACITY: f64 = 0.05;
const NAME_MAX_CHARS: usize = 80;
const VALUE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Rect {
    pub top: f64,
    pub bottom: f64,
    pub width: f64,
    pub height: f64,
}

/// One candidate as reported by the page script.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawElement {
    #[serde(rename = "ref")]
    pub element_ref: ElementRef,
    pub role: String,
    pub tag: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default = "full_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub checked: Option<bool>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub expanded: Option<bool>,
    #[serde(default)]
    pub value: Option<String>,
}

fn full_opacity() -> f64 {
    1.0
}

impl RawElement {
    fn is_form_field(&self) -> bool {
        matches!(self.tag.as_str(), "input" | "select" | "textarea")
            || matches!(
                self.role.as_str(),
                "textbox" | "searchbox" | "combobox" | "spinbutton"
            )
    }

    fn is_visible(&self, viewport_height: f64) -> bool {
        if self.display == "none" || matches!(self.visibility.as_str(), "hidden" | "collapse") {
            return false;
        }
        if self.opacity < MIN_OPACITY {
            return false;
        }
        let min = if self.is_form_field() {
            MIN_FIELD_BOX_PX
        } else {
            MIN_BOX_PX
        };
        if self.rect.width < min || self.rect.height < min {
            return false;
        }
        let tolerance = viewport_height.max(0.0) * OFFSCREEN_TOLERANCE;
        self.rect.bottom >= -tolerance && self.rect.top <= viewport_height + tolerance
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ScrollPosition {
    pub percent: u32,
    pub at_top: bool,
    pub at_bottom: bool,
}

impl ScrollPosition {
    pub fn describe(&self) -> String {
        format!(
            "{}% (top: {}, bottom: {})",
            self.percent,
            yes_no(self.at_top),
            yes_no(self.at_bottom)
        )
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

/// Payload of a `getTree` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawSnapshot {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub viewport_height: f64,
    #[serde(default)]
    pub scroll: ScrollPosition,
    #[serde(default)]
    pub elements: Vec<RawElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementTree {
    pub title: String,
    pub url: String,
    pub scroll: ScrollPosition,
    pub elements: Vec<RawElement>,
    /// Number of elements that passed the filters before truncation.
    pub visible_count: usize,
}

/// Filters, caps and orders the raw candidates.
///
/// Elements keep document order. The focused element is always present,
/// even when it fails the visibility filters or falls past the cap; in the
/// latter case it takes the last slot.
pub fn build_tree(raw: RawSnapshot) -> ElementTree {
    let RawSnapshot {
        title,
        url,
        viewport_height,
        scroll,
        elements,
    } = raw;

    let mut seen = HashSet::new();
    let mut focused = None;
    let mut kept = Vec::new();
    for element in elements {
        if !seen.insert(element.element_ref.clone()) {
            continue;
        }
        if element.focused && focused.is_none() {
            focused = Some(element.clone());
        }
        if element.is_visible(viewport_height) {
            kept.push(element);
        }
    }

    let visible_count = kept.len();
    kept.truncate(MAX_TREE_ELEMENTS);

    if let Some(focused) = focused {
        if !kept.iter().any(|e| e.element_ref == focused.element_ref) {
            if kept.len() >= MAX_TREE_ELEMENTS {
                kept.pop();
            }
            kept.push(focused);
        }
    }

    ElementTree {
        title,
        url,
        scroll,
        elements: kept,
        visible_count,
    }
}

impl ElementTree {
    /// Text form sent to the decision service.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Page: {}", self.title);
        let _ = writeln!(out, "URL: {}", self.url);
        let _ = writeln!(out, "Scroll: {}", self.scroll.describe());
        if self.elements.is_empty() {
            out.push_str("Interactive elements: none found\n");
            return out;
        }
        let _ = writeln!(out, "Interactive elements ({}):", self.elements.len());
        for element in &self.elements {
            out.push_str(&render_element(element));
            out.push('\n');
        }
        if self.visible_count > self.elements.len() {
            let _ = writeln!(
                out,
                "(showing {} of {} elements; scroll to reach the rest)",
                self.elements.len(),
                self.visible_count
            );
        }
        out
    }
}

fn render_element(element: &RawElement) -> String {
    let mut line = element.role.clone();
    match &element.input_type {
        Some(kind) => {
            let _ = write!(line, " <{} type={}>", element.tag, kind);
        }
        None => {
            let _ = write!(line, " <{}>", element.tag);
        }
    }
    let _ = write!(line, " [{}]", element.element_ref);
    if !element.name.is_empty() {
        let _ = write!(line, " \"{}\"", truncate(&element.name, NAME_MAX_CHARS));
    }

    let mut flags = Vec::new();
    if element.focused {
        flags.push("focused".to_string());
    }
    if let Some(checked) = element.checked {
        flags.push(if checked { "checked" } else { "unchecked" }.to_string());
    }
    if element.disabled {
        flags.push("disabled".to_string());
    }
    if let Some(expanded) = element.expanded {
        flags.push(if expanded { "expanded" } else { "collapsed" }.to_string());
    }
    if let Some(value) = element.value.as_deref().filter(|v| !v.is_empty()) {
        flags.push(format!("value=\"{}\"", truncate(value, VALUE_MAX_CHARS)));
    }
    if !flags.is_empty() {
        let _ = write!(line, " ({})", flags.join(", "));
    }
    line
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

/// Turns an `executeAction` result into the line reported back to the
/// decider. Scroll actions return `{message, scroll}`; the rest a string.
pub fn describe_action_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Object(map) => {
            let message = map
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Done")
                .to_string();
            match map
                .get("scroll")
                .and_then(|s| serde_json::from_value::<ScrollPosition>(s.clone()).ok())
            {
                Some(scroll) => format!("{message}. Page position: {}", scroll.describe()),
                None => message,
            }
        }
        serde_json::Value::Null => "Done".to_string(),
        other => other.to_string(),
    }
}

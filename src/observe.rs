//! Observation Builder: element tree, best-effort screenshot and step
//! framing, folded into the parts of the next requester turn.

use std::sync::Arc;

use tracing::debug;

use crate::bridge::{ChannelBridge, SnapshotSource};
use crate::dom::build_tree;
use crate::error::AgentError;
use crate::hands::TabLifecycle;
use crate::types::{PageObservation, TabId, TurnPart};

pub struct ObservationBuilder {
    lifecycle: Arc<TabLifecycle>,
    bridge: ChannelBridge,
    snapshots: Arc<dyn SnapshotSource>,
}

impl ObservationBuilder {
    pub fn new(
        lifecycle: Arc<TabLifecycle>,
        bridge: ChannelBridge,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            lifecycle,
            bridge,
            snapshots,
        }
    }

    /// Observes `tab`. Failures are reported through the error marker,
    /// never as `Err`.
    pub async fn observe(&self, tab: &TabId, with_snapshot: bool) -> PageObservation {
        let info = match self.lifecycle.ensure_ready(tab).await {
            Ok(info) => info,
            Err(err) => {
                let url = match &err {
                    AgentError::NavigationBlocked { url } => url.clone(),
                    _ => String::new(),
                };
                return PageObservation::failed(url, err.to_string());
            }
        };

        let raw = match self.bridge.get_tree(tab).await {
            Ok(raw) => raw,
            Err(err) => {
                let err = AgentError::ConnectionLost {
                    tab: tab.clone(),
                    reason: err.to_string(),
                };
                return PageObservation::failed(info.url, err.to_string());
            }
        };
        let tree = build_tree(raw);
        debug!(%tab, elements = tree.elements.len(), "observed page");

        let snapshot = if with_snapshot {
            self.snapshots.capture_visible(tab).await
        } else {
            None
        };

        PageObservation {
            title: tree.title.clone(),
            url: tree.url.clone(),
            tree: tree.render(),
            snapshot,
            error: None,
        }
    }
}

/// Turn parts for one observation: step header, tree or error, screenshot.
pub fn observation_parts(observation: &PageObservation, step: usize, max_steps: usize) -> Vec<TurnPart> {
    let mut text = format!("Step {} of {}.\n", step + 1, max_steps);
    match &observation.error {
        Some(error) => {
            if !observation.url.is_empty() {
                text.push_str(&format!("URL: {}\n", observation.url));
            }
            text.push_str(&format!("ERROR observing the page: {error}\n"));
            text.push_str("Navigate to a regular web page or switch to another tab.");
        }
        None => {
            text.push_str(&observation.tree);
            text.push_str("\nWhat is your next step?");
        }
    }

    let mut parts = vec![TurnPart::Text(text)];
    if let Some(snapshot) = &observation.snapshot {
        parts.push(TurnPart::Image(snapshot.clone()));
    }
    parts
}

use thiserror::Error;

use crate::types::TabId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// The tab shows a page scripts cannot be injected into.
    #[error("Cannot inspect {url}: browser-internal or privileged pages are off limits. Navigate to a regular web page.")]
    NavigationBlocked { url: String },

    #[error("Lost connection to the page in tab {tab}: {reason}")]
    ConnectionLost { tab: TabId, reason: String },

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Decision service error: {0}")]
    Protocol(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    pub fn browser(err: impl std::fmt::Display) -> Self {
        AgentError::Browser(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

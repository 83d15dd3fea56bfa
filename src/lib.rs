//! Autonomous browser agent: observes a Chrome tab, asks a tool-calling
//! model what to do and does it, until the task is done or the budget runs
//! out.

pub mod agent;
pub mod brain;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod dom;
pub mod error;
pub mod hands;
pub mod observe;
pub mod types;

pub use agent::{Agent, AgentEvent, AlwaysInvoke, IntentDetector, Session, SessionOutcome, SessionState, TerminalStatus};
pub use brain::{Decision, DecisionService};
pub use config::AgentConfig;
pub use error::{AgentError, Result};

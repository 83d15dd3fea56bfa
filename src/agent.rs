//! Session Controller: the observe, decide, act, verify loop.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::brain::catalog::Action;
use crate::brain::{DecisionProtocol, DecisionService};
use crate::bridge::{ChannelBridge, PageTransport, SnapshotSource};
use crate::config::AgentConfig;
use crate::dispatch::ActionDispatcher;
use crate::hands::{TabHost, TabLifecycle};
use crate::observe::{ObservationBuilder, observation_parts};
use crate::types::{ActionCall, ActionResult, ConversationTurn, TabId};

const EVENT_CAPACITY: usize = 256;
const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_MS: u64 = 8000;

/// Pause after the `n`-th consecutive error (counting from 0).
pub fn error_backoff(n: u32) -> Duration {
    let millis = BACKOFF_BASE_MS.saturating_mul(1u64.checked_shl(n).unwrap_or(u64::MAX));
    Duration::from_millis(millis.min(BACKOFF_CAP_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Observing,
    Deciding,
    Acting,
    Verifying,
    Complete,
    Failed,
    BudgetExhausted,
    AbortedErrors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Complete,
    Failed,
    BudgetExhausted,
    AbortedErrors,
}

impl From<TerminalStatus> for SessionState {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Complete => SessionState::Complete,
            TerminalStatus::Failed => SessionState::Failed,
            TerminalStatus::BudgetExhausted => SessionState::BudgetExhausted,
            TerminalStatus::AbortedErrors => SessionState::AbortedErrors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub status: TerminalStatus,
    /// Summary, failure reason or explanation of why the session stopped.
    pub message: String,
    pub steps: usize,
    /// Set when the session stopped without the task being declared done.
    pub incomplete: bool,
}

/// Progress of a session, published as it happens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Started {
        task: String,
        tab: TabId,
    },
    Observed {
        step: usize,
        url: String,
        title: String,
        snapshot: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Thinking {
        step: usize,
    },
    Narrative {
        step: usize,
        text: String,
    },
    Action {
        step: usize,
        name: String,
        arguments: serde_json::Value,
    },
    ActionResult {
        step: usize,
        name: String,
        success: bool,
        message: String,
    },
    Finished(SessionOutcome),
}

/// Decides whether a piece of user text should start a session at all.
pub trait IntentDetector: Send + Sync {
    fn should_invoke_agent(&self, text: &str) -> bool;
}

/// Treats every non-blank command as a browser task.
pub struct AlwaysInvoke;

impl IntentDetector for AlwaysInvoke {
    fn should_invoke_agent(&self, text: &str) -> bool {
        !text.trim().is_empty()
    }
}

/// Everything one task owns. Dropped when the task ends.
pub struct Session {
    pub task: String,
    pub active_tab: TabId,
    pub step: usize,
    pub consecutive_errors: u32,
    pub state: SessionState,
    conversation: DecisionProtocol,
}

impl Session {
    pub fn new(task: impl Into<String>, tab: TabId, service: Box<dyn DecisionService>) -> Self {
        let task = task.into();
        Self {
            conversation: DecisionProtocol::new(service, task.clone()),
            task,
            active_tab: tab,
            step: 0,
            consecutive_errors: 0,
            state: SessionState::Observing,
        }
    }

    pub fn history(&self) -> &[ConversationTurn] {
        self.conversation.history()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::Complete
                | SessionState::Failed
                | SessionState::BudgetExhausted
                | SessionState::AbortedErrors
        )
    }
}

/// Outcome of executing one decision's batch of calls.
enum BatchOutcome {
    Continue { error: Option<String> },
    Terminal(TerminalStatus, String),
}

pub struct Agent {
    config: AgentConfig,
    observer: ObservationBuilder,
    dispatcher: ActionDispatcher,
    events: broadcast::Sender<AgentEvent>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        host: Arc<dyn TabHost>,
        transport: Arc<dyn PageTransport>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        let bridge = ChannelBridge::new(transport, config.bridge_timeout);
        let lifecycle = Arc::new(TabLifecycle::new(host, bridge.clone(), &config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            observer: ObservationBuilder::new(lifecycle.clone(), bridge.clone(), snapshots),
            dispatcher: ActionDispatcher::new(lifecycle, bridge),
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<AgentEvent> {
        self.events.clone()
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn run(
        &self,
        task: &str,
        tab: TabId,
        service: Box<dyn DecisionService>,
    ) -> SessionOutcome {
        let mut session = Session::new(task, tab, service);
        self.run_session(&mut session).await
    }

    /// Drives `session` until it reaches a terminal state.
    pub async fn run_session(&self, session: &mut Session) -> SessionOutcome {
        info!(task = %session.task, tab = %session.active_tab, "session started");
        self.emit(AgentEvent::Started {
            task: session.task.clone(),
            tab: session.active_tab.clone(),
        });

        let max_steps = self.config.max_steps;
        let mut want_snapshot = true;
        loop {
            if session.step >= max_steps {
                return self.finish(
                    session,
                    TerminalStatus::BudgetExhausted,
                    format!(
                        "Stopped after {max_steps} steps without the task being declared done; it may be incomplete."
                    ),
                );
            }

            session.state = SessionState::Observing;
            let observation = self.observer.observe(&session.active_tab, want_snapshot).await;
            self.emit(AgentEvent::Observed {
                step: session.step,
                url: observation.url.clone(),
                title: observation.title.clone(),
                snapshot: observation.snapshot.is_some(),
                error: observation.error.clone(),
            });
            let observation_error = observation.error.clone();
            session
                .conversation
                .push_observation(observation_parts(&observation, session.step, max_steps));

            session.state = SessionState::Deciding;
            self.emit(AgentEvent::Thinking { step: session.step });
            let decided = session.conversation.decide().await;
            let step = session.step;
            session.step += 1;

            let decision = match decided {
                Ok(decision) => {
                    // The page was seen; until a visual action, the tree is enough.
                    if observation_error.is_none() {
                        want_snapshot = false;
                    }
                    decision
                }
                Err(err) => {
                    if let Some(outcome) = self.record_error(session, err.to_string()).await {
                        return outcome;
                    }
                    continue;
                }
            };
            if let Some(text) = &decision.narrative {
                self.emit(AgentEvent::Narrative {
                    step,
                    text: text.clone(),
                });
            }
            if decision.calls.is_empty() {
                warn!(step, "decision service returned no action");
                let reason = "Decision service returned no action".to_string();
                if let Some(outcome) = self.record_error(session, reason).await {
                    return outcome;
                }
                continue;
            }

            session.state = SessionState::Acting;
            let (results, batch) = self.execute_batch(session, step, decision.calls, &mut want_snapshot).await;
            session.conversation.push_results(results);

            session.state = SessionState::Verifying;
            let error = match batch {
                BatchOutcome::Terminal(status, message) => return self.finish(session, status, message),
                BatchOutcome::Continue { error } => error.or(observation_error),
            };
            match error {
                Some(reason) => {
                    if let Some(outcome) = self.record_error(session, reason).await {
                        return outcome;
                    }
                }
                None => session.consecutive_errors = 0,
            }
        }
    }

    /// Runs the calls in order. After a failure, navigation or tab switch
    /// the remaining calls get a "skipped" response since their refs are
    /// stale. Every call gets exactly one response.
    async fn execute_batch(
        &self,
        session: &mut Session,
        step: usize,
        calls: Vec<ActionCall>,
        want_snapshot: &mut bool,
    ) -> (Vec<(ActionCall, ActionResult)>, BatchOutcome) {
        let mut results = Vec::with_capacity(calls.len());
        let mut error = None;
        let mut stale: Option<&'static str> = None;

        for call in calls {
            if let Some(reason) = stale {
                results.push((
                    call,
                    ActionResult::failed(format!("Skipped: {reason}. Decide again from the next observation.")),
                ));
                continue;
            }

            self.emit(AgentEvent::Action {
                step,
                name: call.request.name.clone(),
                arguments: serde_json::Value::Object(call.request.arguments.clone()),
            });

            let result = match Action::from_request(&call.request) {
                Ok(Action::TaskComplete { summary }) => {
                    results.push((call, ActionResult::ok(summary.clone())));
                    return (results, BatchOutcome::Terminal(TerminalStatus::Complete, summary));
                }
                Ok(Action::TaskFailed { reason }) => {
                    results.push((call, ActionResult::ok(reason.clone())));
                    return (results, BatchOutcome::Terminal(TerminalStatus::Failed, reason));
                }
                Ok(action) => self.execute(session, &action, want_snapshot).await,
                Err(err) => ActionResult::failed(err.to_string()),
            };

            info!(step, action = %call.request.name, success = result.success, "{}", result.message);
            self.emit(AgentEvent::ActionResult {
                step,
                name: call.request.name.clone(),
                success: result.success,
                message: result.message.clone(),
            });

            if !result.success {
                error = Some(result.message.clone());
                stale = Some("an earlier call in this batch failed");
            } else if result.switch_to.is_some() {
                stale = Some("the active tab changed");
            } else if result.navigated {
                stale = Some("the page navigated");
            }
            results.push((call, result));
        }
        (results, BatchOutcome::Continue { error })
    }

    async fn execute(&self, session: &mut Session, action: &Action, want_snapshot: &mut bool) -> ActionResult {
        let result = match self.dispatcher.dispatch(&session.active_tab, action).await {
            Ok(result) => result,
            Err(err) => return ActionResult::failed(err.to_string()),
        };

        tokio::time::sleep(action.settle_delay()).await;
        if let Some(tab) = &result.switch_to {
            info!(from = %session.active_tab, to = %tab, "active tab changed");
            session.active_tab = tab.clone();
        }
        if action.is_visually_consequential() || result.navigated {
            *want_snapshot = true;
        }
        result
    }

    /// Counts an error step. Returns the outcome when the threshold is hit,
    /// otherwise backs off.
    async fn record_error(&self, session: &mut Session, reason: String) -> Option<SessionOutcome> {
        let prior = session.consecutive_errors;
        session.consecutive_errors += 1;
        warn!(
            consecutive = session.consecutive_errors,
            threshold = self.config.error_threshold,
            %reason,
            "error step"
        );
        if session.consecutive_errors >= self.config.error_threshold {
            return Some(self.finish(
                session,
                TerminalStatus::AbortedErrors,
                format!(
                    "Aborted after {} consecutive errors. Last error: {reason}",
                    session.consecutive_errors
                ),
            ));
        }
        tokio::time::sleep(error_backoff(prior)).await;
        None
    }

    fn finish(&self, session: &mut Session, status: TerminalStatus, message: String) -> SessionOutcome {
        session.state = status.into();
        debug_assert!(session.is_terminal());
        let outcome = SessionOutcome {
            status,
            incomplete: status != TerminalStatus::Complete,
            message,
            steps: session.step,
        };
        info!(status = ?outcome.status, steps = outcome.steps, "session finished: {}", outcome.message);
        self.emit(AgentEvent::Finished(outcome.clone()));
        outcome
    }
}

//! Decision Protocol Manager: the conversation with the decision service.

pub mod catalog;
pub mod openai;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{ActionCall, ActionResult, ConversationTurn, Role, TurnPart};
use catalog::{ToolDeclaration, tool_catalog};

/// What the decision service answered to one exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub narrative: Option<String>,
    pub calls: Vec<ActionCall>,
}

/// A turn-based tool-calling oracle. Implementations keep whatever state
/// they need to continue a conversation from the turns they are given, so
/// every call only carries turns not sent before.
#[async_trait]
pub trait DecisionService: Send {
    async fn exchange(
        &mut self,
        turns: &[ConversationTurn],
        tools: &[ToolDeclaration],
    ) -> Result<Decision>;
}

pub struct DecisionProtocol {
    service: Box<dyn DecisionService>,
    tools: Vec<ToolDeclaration>,
    task: String,
    history: Vec<ConversationTurn>,
    /// Turns before this index reached the service.
    delivered: usize,
    task_delivered: bool,
}

impl DecisionProtocol {
    pub fn new(service: Box<dyn DecisionService>, task: impl Into<String>) -> Self {
        Self {
            service,
            tools: tool_catalog(),
            task: task.into(),
            history: Vec::new(),
            delivered: 0,
            task_delivered: false,
        }
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Appends the observation for this step. The task statement leads the
    /// turn until one exchange carrying it has succeeded.
    pub fn push_observation(&mut self, mut parts: Vec<TurnPart>) {
        if !self.task_delivered {
            parts.insert(0, TurnPart::Text(format!("Task: {}", self.task)));
        }
        self.history
            .push(ConversationTurn::new(Role::Requester, parts));
    }

    /// Folds the outcome of every call of the last decision back in, in
    /// call order.
    pub fn push_results(&mut self, results: Vec<(ActionCall, ActionResult)>) {
        if results.is_empty() {
            return;
        }
        let parts = results
            .into_iter()
            .map(|(call, result)| TurnPart::Response {
                call_id: call.call_id,
                name: call.request.name,
                output: if result.success {
                    result.message
                } else {
                    format!("FAILED: {}", result.message)
                },
            })
            .collect();
        self.history
            .push(ConversationTurn::new(Role::ActionResult, parts));
    }

    /// Sends everything not yet delivered and records the reply.
    ///
    /// Pending observations other than the newest are dropped from the
    /// exchange: they describe a page state that no longer exists. They stay
    /// in the history.
    pub async fn decide(&mut self) -> Result<Decision> {
        let pending = &self.history[self.delivered..];
        let newest_observation = pending
            .iter()
            .rposition(|turn| turn.role == Role::Requester);
        let outgoing: Vec<ConversationTurn> = pending
            .iter()
            .enumerate()
            .filter(|(i, turn)| turn.role != Role::Requester || Some(*i) == newest_observation)
            .map(|(_, turn)| turn.clone())
            .collect();
        let superseded = pending.len() - outgoing.len();
        if superseded > 0 {
            debug!(superseded, "dropping stale observations from exchange");
        }
        let carries_task = outgoing.iter().any(|turn| {
            turn.role == Role::Requester
                && turn.parts.first()
                    == Some(&TurnPart::Text(format!("Task: {}", self.task)))
        });

        let decision = match self.service.exchange(&outgoing, &self.tools).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "decision exchange failed");
                return Err(err);
            }
        };

        self.task_delivered |= carries_task;
        let mut parts = Vec::new();
        if let Some(text) = &decision.narrative {
            parts.push(TurnPart::Text(text.clone()));
        }
        parts.extend(decision.calls.iter().cloned().map(TurnPart::Call));
        self.history.push(ConversationTurn::new(Role::Decider, parts));
        self.delivered = self.history.len();
        debug!(calls = decision.calls.len(), "decision received");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::types::ActionRequest;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    type Sent = Arc<Mutex<Vec<Vec<ConversationTurn>>>>;

    /// Records what it was sent and replays canned answers.
    struct Recorder {
        sent: Sent,
        replies: Vec<Result<Decision>>,
    }

    #[async_trait]
    impl DecisionService for Recorder {
        async fn exchange(
            &mut self,
            turns: &[ConversationTurn],
            tools: &[ToolDeclaration],
        ) -> Result<Decision> {
            assert!(!tools.is_empty());
            self.sent.lock().unwrap().push(turns.to_vec());
            if self.replies.is_empty() {
                Ok(Decision::default())
            } else {
                self.replies.remove(0)
            }
        }
    }

    fn protocol(replies: Vec<Result<Decision>>) -> (DecisionProtocol, Sent) {
        let sent: Sent = Arc::default();
        let service = Recorder {
            sent: sent.clone(),
            replies,
        };
        (DecisionProtocol::new(Box::new(service), "find the invoice"), sent)
    }

    fn call(id: &str, name: &str) -> ActionCall {
        ActionCall {
            call_id: id.into(),
            request: ActionRequest {
                name: name.into(),
                arguments: Default::default(),
            },
        }
    }

    fn observation(text: &str) -> Vec<TurnPart> {
        vec![TurnPart::Text(text.into())]
    }

    #[tokio::test]
    async fn task_leads_only_the_first_observation() {
        let (mut protocol, sent) = protocol(vec![Ok(Decision {
            narrative: Some("Looking".into()),
            calls: vec![call("c1", "scroll")],
        })]);

        protocol.push_observation(observation("tree 1"));
        protocol.decide().await.unwrap();
        protocol.push_results(vec![(call("c1", "scroll"), ActionResult::ok("Scrolled down"))]);
        protocol.push_observation(observation("tree 2"));
        protocol.decide().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].len(), 1);
        assert_eq!(sent[0][0].text(), "Task: find the invoice\ntree 1");
        assert_eq!(sent[1].len(), 2);
        assert_eq!(sent[1][0].role, Role::ActionResult);
        assert_eq!(sent[1][1].text(), "tree 2");
    }

    #[tokio::test]
    async fn prior_turns_are_never_resent() {
        let (mut protocol, sent) = protocol(vec![]);
        for n in 0..3 {
            protocol.push_observation(observation(&format!("tree {n}")));
            protocol.decide().await.unwrap();
        }
        let sent = sent.lock().unwrap();
        assert!(sent.iter().all(|turns| turns.len() == 1));
        assert_eq!(protocol.history().len(), 6);
    }

    #[tokio::test]
    async fn failed_exchange_keeps_task_pending_and_supersedes_stale_view() {
        let (mut protocol, sent) = protocol(vec![
            Err(AgentError::Protocol("503".into())),
            Ok(Decision::default()),
        ]);

        protocol.push_observation(observation("tree 1"));
        assert!(protocol.decide().await.is_err());
        protocol.push_observation(observation("tree 2"));
        protocol.decide().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[1].len(), 1);
        assert_eq!(sent[1][0].text(), "Task: find the invoice\ntree 2");

        protocol.push_observation(observation("tree 3"));
        assert_eq!(protocol.history().last().unwrap().text(), "tree 3");
    }

    #[tokio::test]
    async fn failed_results_are_marked_and_keep_call_order() {
        let (mut protocol, _) = protocol(vec![]);
        protocol.push_results(vec![
            (call("a", "click"), ActionResult::failed("No element e4")),
            (call("b", "type"), ActionResult::ok("Typed")),
        ]);
        let turn = protocol.history().last().unwrap();
        assert_eq!(turn.role, Role::ActionResult);
        assert_eq!(
            turn.parts,
            vec![
                TurnPart::Response {
                    call_id: "a".into(),
                    name: "click".into(),
                    output: "FAILED: No element e4".into()
                },
                TurnPart::Response {
                    call_id: "b".into(),
                    name: "type".into(),
                    output: "Typed".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn decider_turn_records_narrative_and_calls() {
        let (mut protocol, _) = protocol(vec![Ok(Decision {
            narrative: Some("Opening the menu".into()),
            calls: vec![call("c1", "click"), call("c2", "hover")],
        })]);
        protocol.push_observation(observation("tree"));
        let decision = protocol.decide().await.unwrap();
        assert_eq!(decision.calls.len(), 2);

        let turn = protocol.history().last().unwrap();
        assert_eq!(turn.role, Role::Decider);
        assert_eq!(turn.text(), "Opening the menu");
        assert_eq!(turn.parts.len(), 3);
    }
}

//! Channel Bridge: request/response messaging with the page-context
//! inspector, plus the screenshot side channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::dom::RawSnapshot;
use crate::types::{TabId, VisualSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BridgeRequest {
    Ping,
    GetTree,
    ExecuteAction { name: String, args: Value },
}

impl BridgeRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeRequest::Ping => "ping",
            BridgeRequest::GetTree => "getTree",
            BridgeRequest::ExecuteAction { .. } => "executeAction",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Nothing is listening in the page, e.g. it navigated since injection.
    #[error("no inspector is listening in the page")]
    ReceiverAbsent,

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("no inspector is listening in the page")]
    ReceiverAbsent,

    #[error("page did not answer {kind} within {timeout:?}")]
    Timeout { kind: &'static str, timeout: Duration },

    #[error("transport failure: {0}")]
    Transport(String),

    /// The inspector answered with `{error}`.
    #[error("{0}")]
    Page(String),

    #[error("malformed reply to {kind}: {detail}")]
    Malformed { kind: &'static str, detail: String },
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ReceiverAbsent => BridgeError::ReceiverAbsent,
            TransportError::Failed(msg) => BridgeError::Transport(msg),
        }
    }
}

/// Delivers one request to the inspector in a tab and returns its raw reply.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn send(&self, tab: &TabId, request: &BridgeRequest) -> Result<Value, TransportError>;
}

/// Screenshot side channel. Any capture failure is reported as `None`.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn capture_visible(&self, tab: &TabId) -> Option<VisualSnapshot>;
}

/// Typed, time-bounded view over a [`PageTransport`].
#[derive(Clone)]
pub struct ChannelBridge {
    transport: Arc<dyn PageTransport>,
    timeout: Duration,
}

impl ChannelBridge {
    pub fn new(transport: Arc<dyn PageTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn ping(&self, tab: &TabId) -> Result<(), BridgeError> {
        let reply = self.request(tab, BridgeRequest::Ping).await?;
        if reply.get("pong").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(BridgeError::Malformed {
                kind: "ping",
                detail: reply.to_string(),
            })
        }
    }

    pub async fn get_tree(&self, tab: &TabId) -> Result<RawSnapshot, BridgeError> {
        let reply = self.request(tab, BridgeRequest::GetTree).await?;
        let result = outcome(reply, "getTree")?;
        serde_json::from_value(result).map_err(|e| BridgeError::Malformed {
            kind: "getTree",
            detail: e.to_string(),
        })
    }

    /// Runs a primitive action. `Err(BridgeError::Page)` means the
    /// inspector refused it (stale ref, disabled element, ...).
    pub async fn execute(&self, tab: &TabId, name: &str, args: Value) -> Result<Value, BridgeError> {
        let reply = self
            .request(
                tab,
                BridgeRequest::ExecuteAction {
                    name: name.to_string(),
                    args,
                },
            )
            .await?;
        outcome(reply, "executeAction")
    }

    async fn request(&self, tab: &TabId, request: BridgeRequest) -> Result<Value, BridgeError> {
        let kind = request.kind();
        debug!(%tab, kind, "bridge request");
        match tokio::time::timeout(self.timeout, self.transport.send(tab, &request)).await {
            Ok(reply) => reply.map_err(BridgeError::from),
            Err(_) => Err(BridgeError::Timeout {
                kind,
                timeout: self.timeout,
            }),
        }
    }
}

fn outcome(reply: Value, kind: &'static str) -> Result<Value, BridgeError> {
    if let Some(error) = reply.get("error").and_then(Value::as_str) {
        return Err(BridgeError::Page(error.to_string()));
    }
    match reply {
        Value::Object(mut map) if map.contains_key("result") => {
            Ok(map.remove("result").unwrap_or(Value::Null))
        }
        other => Err(BridgeError::Malformed {
            kind,
            detail: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Result<Value, TransportError>);

    #[async_trait]
    impl PageTransport for Fixed {
        async fn send(&self, _: &TabId, _: &BridgeRequest) -> Result<Value, TransportError> {
            self.0.clone()
        }
    }

    struct Silent;

    #[async_trait]
    impl PageTransport for Silent {
        async fn send(&self, _: &TabId, _: &BridgeRequest) -> Result<Value, TransportError> {
            std::future::pending().await
        }
    }

    fn bridge(transport: impl PageTransport + 'static) -> ChannelBridge {
        ChannelBridge::new(Arc::new(transport), Duration::from_secs(2))
    }

    #[test]
    fn requests_serialize_with_kind_tag() {
        let value = serde_json::to_value(BridgeRequest::ExecuteAction {
            name: "click".into(),
            args: json!({"ref": "e1"}),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"kind": "executeAction", "name": "click", "args": {"ref": "e1"}})
        );
        assert_eq!(
            serde_json::to_value(BridgeRequest::GetTree).unwrap(),
            json!({"kind": "getTree"})
        );
    }

    #[tokio::test]
    async fn ping_accepts_pong() {
        let tab = TabId::new("t1");
        assert_eq!(bridge(Fixed(Ok(json!({"pong": true})))).ping(&tab).await, Ok(()));
    }

    #[tokio::test]
    async fn receiver_absent_is_a_typed_error() {
        let tab = TabId::new("t1");
        let err = bridge(Fixed(Err(TransportError::ReceiverAbsent)))
            .ping(&tab)
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::ReceiverAbsent);
    }

    #[tokio::test]
    async fn page_errors_surface_as_page_variant() {
        let tab = TabId::new("t1");
        let err = bridge(Fixed(Ok(json!({"error": "No element e9"}))))
            .execute(&tab, "click", json!({"ref": "e9"}))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Page("No element e9".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_page_times_out() {
        let tab = TabId::new("t1");
        let err = bridge(Silent).get_tree(&tab).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { kind: "getTree", .. }));
    }
}

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tabpilot::{AgentEvent, IntentDetector};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

/// Commands waiting behind the running session.
const COMMAND_QUEUE: usize = 4;

#[derive(Clone)]
pub struct AppState {
    pub cmd_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<AgentEvent>,
    pub intent: Arc<dyn IntentDetector>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Starts the intake server on the first free port in 3000..3010 and
/// returns the command receiver and the bound port.
pub async fn start_server(
    event_tx: broadcast::Sender<AgentEvent>,
    intent: Arc<dyn IntentDetector>,
) -> Result<(mpsc::Receiver<String>, u16)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(COMMAND_QUEUE);
    let state = Arc::new(AppState {
        cmd_tx,
        event_tx,
        intent,
    });

    let app = Router::new()
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .with_state(state);

    let mut bound = None;
    for port in 3000..3010 {
        if let Ok(listener) = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await {
            bound = Some((listener, port));
            break;
        }
    }
    let (listener, port) =
        bound.ok_or_else(|| anyhow!("Could not bind to any port 3000-3009. Stop the old agent first."))?;

    info!("accepting commands at http://localhost:{port}/command");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "intake server stopped");
        }
    });

    Ok((cmd_rx, port))
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> (StatusCode, Json<Value>) {
    info!(command = %payload.command, "POST /command");
    if !state.intent.should_invoke_agent(&payload.command) {
        return (
            StatusCode::OK,
            Json(json!({"accepted": false, "reason": "not a browser task"})),
        );
    }
    match state.cmd_tx.try_send(payload.command) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"accepted": true}))),
        Err(mpsc::error::TrySendError::Full(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"accepted": false, "reason": "agent is busy"})),
        ),
        Err(mpsc::error::TrySendError::Closed(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"accepted": false, "reason": "agent is shutting down"})),
        ),
    }
}

/// SSE event named after the `event` tag, carrying the JSON form.
fn to_sse_event(event: &AgentEvent) -> Option<Event> {
    let data = serde_json::to_value(event).ok()?;
    let name = data["event"].as_str().unwrap_or("message").to_string();
    Some(Event::default().event(name).data(data.to_string()))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => to_sse_event(&event).map(Ok::<_, Infallible>),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

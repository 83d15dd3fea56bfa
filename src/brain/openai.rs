use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::catalog::ToolDeclaration;
use super::{Decision, DecisionService};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::types::{ActionCall, ActionRequest, ConversationTurn, Role, TurnPart};

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent. You control a real Chrome tab through the tools you are given.

Every observation lists the interactive elements of the page, each with a ref such as [e12]. Refs are only valid for the observation they came from; after you act, wait for the next observation before using refs again.

Rules:
1. Act through tool calls only. You may call several tools in one reply when they do not depend on each other's outcome (for example filling a form). Calls after a navigation or tab switch are skipped.
2. Use type to fill fields, then press_key with "Enter" or click the submit button.
3. Scroll when what you need is not in the list; the observation tells you where on the page you are.
4. If an action fails, read the error and try another approach.
5. Call task_complete with a summary once the goal is visibly achieved, including any answer the user asked for. Call task_failed if it cannot be done.
6. Keep steps minimal."#;

/// [`DecisionService`] backed by the OpenAI Responses API. The server keeps
/// the conversation; each request chains onto the previous response.
pub struct ResponsesClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    previous_response_id: Option<String>,
}

impl ResponsesClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            previous_response_id: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::Config("OPENAI_API_KEY not set in environment".into()))?;
        Ok(Self::new(api_key, &config.api_base, &config.model))
    }

    fn request_body(&self, turns: &[ConversationTurn], tools: &[ToolDeclaration]) -> Value {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "instructions": SYSTEM_PROMPT,
            "input": input_items(turns),
            "tools": tools,
            "tool_choice": "auto",
            "parallel_tool_calls": true,
            "store": true,
        });
        if let Some(id) = &self.previous_response_id {
            body["previous_response_id"] = json!(id);
        }
        body
    }
}

fn input_items(turns: &[ConversationTurn]) -> Vec<Value> {
    let mut items = Vec::new();
    for turn in turns {
        match turn.role {
            Role::Requester => {
                let content: Vec<Value> = turn
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        TurnPart::Text(text) => Some(json!({"type": "input_text", "text": text})),
                        TurnPart::Image(image) => Some(json!({
                            "type": "input_image",
                            "image_url": format!(
                                "data:{};base64,{}",
                                image.media_type,
                                BASE64.encode(&image.data)
                            ),
                        })),
                        _ => None,
                    })
                    .collect();
                items.push(json!({"role": "user", "content": content}));
            }
            Role::ActionResult => {
                for part in &turn.parts {
                    if let TurnPart::Response { call_id, output, .. } = part {
                        items.push(json!({
                            "type": "function_call_output",
                            "call_id": call_id,
                            "output": output,
                        }));
                    }
                }
            }
            // Stored server-side under previous_response_id.
            Role::Decider => {}
        }
    }
    items
}

fn parse_output(json_resp: &Value) -> Decision {
    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for item in json_resp["output"].as_array().into_iter().flatten() {
        match item["type"].as_str() {
            Some("message") => {
                for content in item["content"].as_array().into_iter().flatten() {
                    if content["type"] == "output_text" {
                        if let Some(text) = content["text"].as_str().filter(|t| !t.trim().is_empty()) {
                            texts.push(text.to_string());
                        }
                    }
                }
            }
            Some("function_call") => {
                let name = item["name"].as_str().unwrap_or_default().to_string();
                let raw = item["arguments"].as_str().unwrap_or("{}");
                let arguments = match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(map)) => map,
                    _ => {
                        warn!(%name, arguments = raw, "unparseable tool arguments");
                        Default::default()
                    }
                };
                calls.push(ActionCall {
                    call_id: item["call_id"].as_str().unwrap_or_default().to_string(),
                    request: ActionRequest { name, arguments },
                });
            }
            _ => {}
        }
    }
    Decision {
        narrative: (!texts.is_empty()).then(|| texts.join("\n")),
        calls,
    }
}

#[async_trait]
impl DecisionService for ResponsesClient {
    async fn exchange(
        &mut self,
        turns: &[ConversationTurn],
        tools: &[ToolDeclaration],
    ) -> Result<Decision> {
        let body = self.request_body(turns, tools);
        debug!(items = body["input"].as_array().map_or(0, Vec::len), "sending to decision service");

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Protocol(format!("request failed: {e}")))?;

        let status = response.status();
        let json_resp: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("unreadable response ({status}): {e}")))?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(%status, err_msg, "decision service error");
            return Err(AgentError::Protocol(format!("OpenAI API error ({status}): {err_msg}")));
        }

        if let Some(id) = json_resp["id"].as_str() {
            self.previous_response_id = Some(id.to_string());
        }
        let decision = parse_output(&json_resp);
        if let Some(text) = &decision.narrative {
            info!("decider says: {text}");
        }
        Ok(decision)
    }
}

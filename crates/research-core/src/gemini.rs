//! Google Gemini `generateContent` client.
//!
//! Auth is the `x-goog-api-key` header, so the key never appears in a
//! request URL or in transport error text. Tool calls travel as
//! `functionCall` / `functionResponse` parts and the assistant role is
//! `"model"`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::llm::{LanguageModel, ModelRequest, ModelResponse, ToolCall, ToolSchema};
use crate::state::ConversationMessage;
use crate::{ResearchError, SecretValue};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const SERVICE: &str = "gemini";

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: SecretValue,
    model: String,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig, api_key: SecretValue) -> Result<Self, ResearchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ResearchError::service(SERVICE, err))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ResearchError> {
        let body = build_request_body(&request);
        debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending gemini request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|err| ResearchError::service(SERVICE, err.without_url()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| ResearchError::service(SERVICE, err.without_url()))?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            warn!(status = status.as_u16(), reason = message, "gemini request rejected");
            return Err(ResearchError::service(
                SERVICE,
                format!("HTTP {}: {message}", status.as_u16()),
            ));
        }

        parse_response(&payload)
    }
}

fn build_request_body(request: &ModelRequest) -> Value {
    let contents: Vec<Value> = request.messages.iter().map(message_to_content).collect();
    let mut body = json!({
        "contents": merge_turns(contents),
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
            "temperature": request.temperature,
        },
    });

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request.tools.iter().map(tool_declaration).collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    body
}

fn message_to_content(message: &ConversationMessage) -> Value {
    match message {
        ConversationMessage::PlannerRequest { content } => json!({
            "role": "user",
            "parts": [{ "text": content }],
        }),
        ConversationMessage::PlannerResponse {
            content,
            tool_calls,
        } => {
            let mut parts = Vec::new();
            if !content.trim().is_empty() {
                parts.push(json!({ "text": content }));
            }
            for call in tool_calls {
                parts.push(json!({
                    "functionCall": { "name": call.name, "args": call.arguments }
                }));
            }
            json!({ "role": "model", "parts": parts })
        }
        ConversationMessage::ToolResult { name, content, .. } => json!({
            "role": "user",
            "parts": [{
                "functionResponse": {
                    "name": name,
                    "response": { "name": name, "content": content },
                }
            }],
        }),
    }
}

/// Gemini rejects consecutive turns with the same role; fold them together.
fn merge_turns(contents: Vec<Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(contents.len());
    for content in contents {
        let parts = content["parts"].as_array().cloned().unwrap_or_default();
        if parts.is_empty() {
            continue;
        }
        if let Some(last) = merged.last_mut() {
            if last["role"] == content["role"] {
                if let Some(existing) = last["parts"].as_array_mut() {
                    existing.extend(parts);
                    continue;
                }
            }
        }
        merged.push(content);
    }
    merged
}

fn tool_declaration(tool: &ToolSchema) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn parse_response(payload: &Value) -> Result<ModelResponse, ResearchError> {
    let parts = payload["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| ResearchError::service(SERVICE, "response contained no candidates"))?;

    let mut calls = Vec::new();
    let mut text = String::new();
    for part in parts {
        if let Some(call) = part.get("functionCall") {
            let name = call["name"].as_str().unwrap_or_default().to_string();
            let arguments = call.get("args").cloned().unwrap_or_else(|| json!({}));
            calls.push(ToolCall {
                id: format!("call_{}", Uuid::new_v4()),
                name,
                arguments,
            });
        } else if let Some(fragment) = part["text"].as_str() {
            text.push_str(fragment);
        }
    }

    if calls.is_empty() {
        Ok(ModelResponse::Text(text))
    } else {
        Ok(ModelResponse::ToolCalls(calls))
    }
}

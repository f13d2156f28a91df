//! Language-model contract and the rate-limited wrapper every caller goes through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ResearchError;
use crate::rate_limiter::{TokenBucket, TokenEstimator};
use crate::state::ConversationMessage;

/// Function the model may ask us to invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelRequest {
    pub fn new(messages: Vec<ConversationMessage>, max_tokens: u32) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            max_tokens,
            temperature: 0.2,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    ToolCalls(Vec<ToolCall>),
    Text(String),
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ResearchError>;
}

pub type DynLanguageModel = Arc<dyn LanguageModel>;

/// Debits the shared token bucket before forwarding each request.
pub struct RateLimitedModel {
    inner: DynLanguageModel,
    bucket: Arc<TokenBucket>,
    estimator: TokenEstimator,
    timeout: Option<Duration>,
}

impl RateLimitedModel {
    pub fn new(inner: DynLanguageModel, bucket: Arc<TokenBucket>, estimator: TokenEstimator) -> Self {
        Self {
            inner,
            bucket,
            estimator,
            timeout: None,
        }
    }

    /// Fail with [`ResearchError::RateLimitTimeout`] instead of waiting longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LanguageModel for RateLimitedModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ResearchError> {
        let cost = self
            .estimator
            .request_cost(&request.messages, request.max_tokens);
        let waited = match self.timeout {
            Some(timeout) => self.bucket.acquire_with_timeout(cost, timeout).await?,
            None => self.bucket.acquire(cost).await,
        };
        debug!(
            cost,
            waited_ms = waited.as_millis() as u64,
            "model call admitted by rate limiter"
        );
        self.inner.complete(request).await
    }
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use research_core::{
    Config, ConfigLoader, ConversationMessage, LanguageModel, ModelRequest, ModelResponse,
    ResearchError, SearchHit, SearchRequest, SearchService, ToolCall,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Config with a bucket large enough that tests never wait on it.
pub fn test_config(max_iterations: u32) -> Config {
    ConfigLoader::parse(&format!(
        r#"
        [research]
        max_iterations = {max_iterations}
        max_curated_documents = 10

        [rate_limit]
        capacity = 1000000
        refill_per_second = 1000000.0
        "#
    ))
    .expect("test config should parse")
}

pub fn hit(url: &str, title: &str, snippet: &str) -> SearchHit {
    SearchHit {
        url: url.to_string(),
        title: title.to_string(),
        content: snippet.to_string(),
        raw_content: None,
        score: None,
    }
}

/// What the planner does once its scripted batches run out.
#[derive(Debug, Clone, Copy)]
pub enum AfterBatches {
    RepeatLast,
    Complete,
    Fail,
    /// A `web_search` call whose arguments lack `sub_queries`.
    Malformed,
}

/// Planner, ranking and drafting replies driven by a fixed script.
pub struct ScriptedModel {
    batches: Vec<Vec<&'static str>>,
    after: AfterBatches,
    ranking: Option<String>,
    draft: Option<String>,
    planner_calls: AtomicUsize,
    other_calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(batches: Vec<Vec<&'static str>>, after: AfterBatches) -> Self {
        Self {
            batches,
            after,
            ranking: None,
            draft: None,
            planner_calls: AtomicUsize::new(0),
            other_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_ranking(mut self, reply: impl Into<String>) -> Self {
        self.ranking = Some(reply.into());
        self
    }

    pub fn with_draft(mut self, reply: impl Into<String>) -> Self {
        self.draft = Some(reply.into());
        self
    }

    pub fn planner_calls(&self) -> usize {
        self.planner_calls.load(Ordering::SeqCst)
    }

    pub fn other_calls(&self) -> usize {
        self.other_calls.load(Ordering::SeqCst)
    }

    fn search_call(call: usize, queries: &[&str]) -> ModelResponse {
        let sub_queries: Vec<_> = queries
            .iter()
            .map(|query| json!({"query": query, "topic": "news", "days": 3}))
            .collect();
        ModelResponse::ToolCalls(vec![ToolCall {
            id: format!("call_{call}"),
            name: "web_search".to_string(),
            arguments: json!({ "sub_queries": sub_queries }),
        }])
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ResearchError> {
        if !request.tools.is_empty() {
            let call = self.planner_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(batch) = self.batches.get(call) {
                return Ok(Self::search_call(call, batch));
            }
            return match (self.after, self.batches.last()) {
                (AfterBatches::RepeatLast, Some(batch)) => Ok(Self::search_call(call, batch)),
                (AfterBatches::Fail, _) => Err(ResearchError::service("model", "503 overloaded")),
                (AfterBatches::Malformed, _) => Ok(ModelResponse::ToolCalls(vec![ToolCall {
                    id: format!("call_{call}"),
                    name: "web_search".to_string(),
                    arguments: json!({ "query": "Acme" }),
                }])),
                _ => Ok(ModelResponse::Text("I have enough information.".into())),
            };
        }

        self.other_calls.fetch_add(1, Ordering::SeqCst);
        let prompt = match request.messages.last() {
            Some(ConversationMessage::PlannerRequest { content }) => content.clone(),
            _ => String::new(),
        };
        let reply = if prompt.contains("\"citations\"") {
            self.draft.clone()
        } else {
            self.ranking.clone()
        };
        Ok(ModelResponse::Text(
            reply.unwrap_or_else(|| "no structured answer".to_string()),
        ))
    }
}

/// Search service answering from a table keyed by query prefix.
///
/// Queries containing `fail` error out; a query containing `hang` cancels
/// the configured token and never returns.
#[derive(Default)]
pub struct TableSearch {
    table: HashMap<&'static str, Vec<SearchHit>>,
    cancel_on_hang: Option<CancellationToken>,
    fail_extract: bool,
    requests: Mutex<Vec<SearchRequest>>,
    extract_calls: AtomicUsize,
}

impl TableSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, query: &'static str, hits: Vec<SearchHit>) -> Self {
        self.table.insert(query, hits);
        self
    }

    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_hang = Some(token);
        self
    }

    pub fn failing_extract(mut self) -> Self {
        self.fail_extract = true;
        self
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchService for TableSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ResearchError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        if request.query.contains("hang") {
            if let Some(token) = &self.cancel_on_hang {
                token.cancel();
            }
            std::future::pending::<()>().await;
        }
        if request.query.contains("fail") {
            return Err(ResearchError::service("search", "connection reset"));
        }

        Ok(self
            .table
            .iter()
            .find(|(query, _)| request.query.starts_with(**query))
            .map(|(_, hits)| hits.clone())
            .unwrap_or_default())
    }

    async fn extract(&self, urls: &[String]) -> Result<HashMap<String, String>, ResearchError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_extract {
            return Err(ResearchError::service("search", "extract timed out"));
        }
        Ok(urls
            .iter()
            .map(|url| (url.clone(), format!("full text of {url}")))
            .collect())
    }
}

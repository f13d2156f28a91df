//! Query planning: ask the model for more searches or a completion signal.
//!
//! The planner sees the target, its keywords and a digest of documents
//! gathered so far, and may call exactly one tool, `web_search`.

use chrono::Local;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::ResearchError;
use crate::llm::{DynLanguageModel, ModelRequest, ModelResponse, ToolCall, ToolSchema};
use crate::search::{SearchQuery, Topic};
use crate::state::{ConversationMessage, ResearchState};

pub const SEARCH_TOOL_NAME: &str = "web_search";

/// Documents listed in the planner prompt; older ones are summarised by count.
const DIGEST_LIMIT: usize = 40;

/// Searches the planner asked for, plus the calls they came from so each
/// call can be answered in the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPlan {
    pub calls: Vec<ToolCall>,
    pub queries: Vec<SearchQuery>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerDecision {
    Search(SearchPlan),
    Complete,
}

#[derive(Debug, Deserialize)]
struct SearchToolArgs {
    sub_queries: Vec<SubQuery>,
}

#[derive(Debug, Deserialize)]
struct SubQuery {
    query: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    days: Option<u32>,
}

/// JSON schema advertised for the search tool.
pub fn search_tool_schema() -> ToolSchema {
    ToolSchema {
        name: SEARCH_TOOL_NAME.to_string(),
        description: "Run several web searches in parallel and collect the resulting documents."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "sub_queries": {
                    "type": "array",
                    "description": "List of search queries to execute in parallel",
                    "items": {
                        "type": "object",
                        "properties": {
                            "query": {"type": "string", "description": "Search query"},
                            "topic": {
                                "type": "string",
                                "enum": ["general", "news"],
                                "description": "Search type: 'general' or 'news'"
                            },
                            "days": {"type": "integer", "description": "Days back for news search"}
                        },
                        "required": ["query", "topic"]
                    }
                }
            },
            "required": ["sub_queries"]
        }),
    }
}

pub struct QueryPlanner {
    model: DynLanguageModel,
    max_tokens: u32,
    temperature: f32,
    default_news_days: u32,
}

impl QueryPlanner {
    pub fn new(model: DynLanguageModel, max_tokens: u32) -> Self {
        Self {
            model,
            max_tokens,
            temperature: 0.2,
            default_news_days: 7,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_default_news_days(mut self, days: u32) -> Self {
        self.default_news_days = days;
        self
    }

    /// Ask the model what to do next.
    ///
    /// Appends the prompt and the model's answer to the conversation.
    /// Service failures become [`ResearchError::PlannerUnavailable`] (a rate
    /// limit timeout is passed through); a tool call whose arguments cannot
    /// be read becomes [`ResearchError::MalformedPlannerOutput`].
    #[instrument(name = "planner.propose", skip_all, fields(iteration = state.iteration()))]
    pub async fn propose(&self, state: &mut ResearchState) -> Result<PlannerDecision, ResearchError> {
        let prompt = build_prompt(state, &Local::now().format("%d/%m/%Y").to_string());
        state.push_message(ConversationMessage::PlannerRequest { content: prompt });

        let request = ModelRequest::new(state.conversation().to_vec(), self.max_tokens)
            .with_tools(vec![search_tool_schema()])
            .with_temperature(self.temperature);

        let response = self.model.complete(request).await.map_err(|err| match err {
            ResearchError::RateLimitTimeout { .. } => err,
            other => ResearchError::PlannerUnavailable(other.to_string()),
        })?;

        match response {
            ModelResponse::Text(text) => {
                info!(chars = text.len(), "planner signalled completion");
                state.push_message(ConversationMessage::PlannerResponse {
                    content: text,
                    tool_calls: Vec::new(),
                });
                Ok(PlannerDecision::Complete)
            }
            ModelResponse::ToolCalls(calls) => {
                state.push_message(ConversationMessage::PlannerResponse {
                    content: String::new(),
                    tool_calls: calls.clone(),
                });
                let queries = self.parse_calls(&calls)?;
                info!(queries = queries.len(), "planner requested searches");
                Ok(PlannerDecision::Search(SearchPlan { calls, queries }))
            }
        }
    }

    fn parse_calls(&self, calls: &[ToolCall]) -> Result<Vec<SearchQuery>, ResearchError> {
        let mut queries = Vec::new();
        for call in calls {
            if call.name != SEARCH_TOOL_NAME {
                warn!(tool = %call.name, "planner called an unknown tool; ignoring");
                continue;
            }
            let args: SearchToolArgs = serde_json::from_value(call.arguments.clone())
                .map_err(|err| ResearchError::MalformedPlannerOutput(err.to_string()))?;
            for sub in args.sub_queries {
                if let Some(query) = self.to_query(sub) {
                    queries.push(query);
                }
            }
        }

        if queries.is_empty() {
            return Err(ResearchError::MalformedPlannerOutput(
                "tool call carried no usable search queries".into(),
            ));
        }
        debug!(?queries, "parsed planner queries");
        Ok(queries)
    }

    fn to_query(&self, sub: SubQuery) -> Option<SearchQuery> {
        let text = sub.query.trim();
        if text.is_empty() {
            return None;
        }
        let topic = match sub.topic.as_deref().map(str::trim) {
            Some(topic) if topic.eq_ignore_ascii_case("news") => Topic::News,
            _ => Topic::General,
        };
        let days = match topic {
            Topic::News => Some(sub.days.unwrap_or(self.default_news_days)),
            Topic::General => None,
        };
        Some(SearchQuery {
            query: text.to_string(),
            topic,
            days,
        })
    }
}

fn build_prompt(state: &ResearchState, today: &str) -> String {
    let target = &state.target;
    let mut prompt = format!(
        "Today's date is {today}.\n\
         You are an expert researcher gathering information for a weekly report on recent \
         developments in portfolio companies.\n\
         Your current objective is to gather documents about any significant events that \
         occurred in the past week for the following company: {}.\n",
        target.company
    );

    if !target.keywords.is_empty() {
        prompt.push_str(&format!(
            "Use these company keywords to find documents about the correct company: {}.\n",
            target.keywords.join(", ")
        ));
    }
    if !target.exclude_keywords.is_empty() {
        prompt.push_str(&format!(
            "Ignore results about: {}.\n",
            target.exclude_keywords.join(", ")
        ));
    }

    let collected = state.collected.len();
    if collected == 0 {
        prompt.push_str("No documents have been collected yet.\n");
    } else {
        prompt.push_str(&format!("Documents collected so far ({collected}):\n"));
        for record in state.collected.iter().take(DIGEST_LIMIT) {
            prompt.push_str(&format!("- {}: {}\n", record.title, record.url));
        }
        if collected > DIGEST_LIMIT {
            prompt.push_str(&format!("- ... and {} more\n", collected - DIGEST_LIMIT));
        }
    }

    prompt.push_str(&format!(
        "Instructions:\n\
         - Use the '{SEARCH_TOOL_NAME}' tool to search for relevant documents.\n\
         - Do not repeat searches that already produced the documents above.\n\
         - If you have gathered enough information, reply without calling any tool.\n"
    ));
    prompt
}

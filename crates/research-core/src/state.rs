//! The aggregate threaded through one research request.

use serde::{Deserialize, Serialize};

use crate::documents::DocumentStore;
use crate::llm::ToolCall;

/// Who is being researched and how to tell them apart from namesakes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchTarget {
    pub company: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
}

impl ResearchTarget {
    pub fn new(company: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            keywords: Vec::new(),
            exclude_keywords: Vec::new(),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(clean_keywords(keywords));
        self
    }

    pub fn with_exclusions<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keywords.extend(clean_keywords(keywords));
        self
    }
}

fn clean_keywords<I, S>(keywords: I) -> impl Iterator<Item = String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keywords
        .into_iter()
        .map(Into::into)
        .map(|keyword| keyword.trim().to_string())
        .filter(|keyword| !keyword.is_empty())
}

/// One entry of the planner's working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationMessage {
    /// Prompt sent to the planner.
    PlannerRequest { content: String },
    /// What the planner answered: free text, tool calls, or both.
    PlannerResponse {
        content: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    /// Result of executing one planner tool call.
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

impl ConversationMessage {
    /// Text used for token estimation; tool-call arguments count too.
    pub fn serialized_content(&self) -> String {
        match self {
            Self::PlannerRequest { content } | Self::ToolResult { content, .. } => content.clone(),
            Self::PlannerResponse {
                content,
                tool_calls,
            } => {
                let mut text = content.clone();
                for call in tool_calls {
                    text.push_str(&call.name);
                    text.push_str(&call.arguments.to_string());
                }
                text
            }
        }
    }
}

/// Mutable research state owned by the controller for the life of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub target: ResearchTarget,
    conversation: Vec<ConversationMessage>,
    pub collected: DocumentStore,
    pub curated: DocumentStore,
    iteration: u32,
    pub report: Option<String>,
}

impl ResearchState {
    pub fn new(target: ResearchTarget) -> Self {
        Self {
            target,
            conversation: Vec::new(),
            collected: DocumentStore::new(),
            curated: DocumentStore::new(),
            iteration: 0,
            report: None,
        }
    }

    pub fn conversation(&self) -> &[ConversationMessage] {
        &self.conversation
    }

    /// Conversation history is append-only.
    pub fn push_message(&mut self, message: ConversationMessage) {
        self.conversation.push(message);
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Called once per completed search dispatch.
    pub(crate) fn complete_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }
}

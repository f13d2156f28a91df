//! Iterative company research loop.
//!
//! A language model plans web searches, results accumulate in a
//! deduplicating document store, and the loop stops on planner completion,
//! an iteration bound, a planner failure or cancellation. The collected
//! documents are then ranked and filtered into a curated set for drafting.

pub mod config;
pub mod controller;
pub mod curation;
pub mod documents;
pub mod drafting;
mod error;
pub mod gemini;
pub mod llm;
mod logging;
mod metrics;
pub mod planner;
pub mod rate_limiter;
pub mod search;
mod security;
pub mod state;
pub mod tavily;
mod telemetry;
mod trace;
mod workflow;

pub use config::{Config, ConfigLoader};
pub use controller::{Phase, ResearchController, ResearchOutcome, StopReason};
pub use curation::{CurationReport, Curator, ExclusionRules};
pub use documents::{DocumentRecord, DocumentStore, MergeOutcome};
pub use drafting::{ReportDrafter, export_markdown};
pub use error::ResearchError;
pub use gemini::GeminiClient;
pub use llm::{
    DynLanguageModel, LanguageModel, ModelRequest, ModelResponse, RateLimitedModel, ToolCall,
    ToolSchema,
};
pub use logging::{RunLogInput, log_run_completion, log_run_completion_in};
pub use metrics::init_metrics_from_env;
pub use planner::{PlannerDecision, QueryPlanner, SearchPlan};
pub use rate_limiter::{TokenBucket, TokenEstimator};
pub use search::{
    BatchReport, DynSearchService, SearchExecutor, SearchHit, SearchQuery, SearchRequest,
    SearchService, Topic,
};
pub use security::{SecretValue, require_env};
pub use state::{ConversationMessage, ResearchState, ResearchTarget};
pub use tavily::TavilyClient;
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{
    SessionOptions, SessionOutcome, build_controller, build_services, run_research,
};

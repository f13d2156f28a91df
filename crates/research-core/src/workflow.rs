use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ResearchError;
use crate::config::Config;
use crate::controller::{ResearchController, StopReason};
use crate::curation::Curator;
use crate::drafting::{ReportDrafter, export_markdown};
use crate::gemini::GeminiClient;
use crate::llm::{DynLanguageModel, RateLimitedModel};
use crate::logging::{RunLogInput, log_run_completion, log_run_completion_in};
use crate::planner::QueryPlanner;
use crate::rate_limiter::{TokenBucket, TokenEstimator};
use crate::search::{DynSearchService, SearchExecutor};
use crate::state::{ResearchState, ResearchTarget};
use crate::tavily::TavilyClient;
use crate::trace::{TraceSummary, persist_trace};

fn new_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("session-{}", nanos)
}

/// Options for running a research session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub target: ResearchTarget,
    pub session_id: Option<String>,
    /// Where the markdown report is written; skipped when `None`.
    pub output_dir: Option<PathBuf>,
    /// Where the trace JSON is written; skipped when `None`.
    pub trace_dir: Option<PathBuf>,
    /// Overrides `RESEARCH_LOG_DIR` for the run log.
    pub log_dir: Option<PathBuf>,
}

impl SessionOptions {
    pub fn new(target: ResearchTarget) -> Self {
        Self {
            target,
            session_id: None,
            output_dir: None,
            trace_dir: None,
            log_dir: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// Everything a finished session produced.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub state: ResearchState,
    pub stop_reason: StopReason,
    pub trace: TraceSummary,
    pub report_path: Option<PathBuf>,
    pub trace_path: Option<PathBuf>,
}

/// Build the Gemini and Tavily clients from configuration and environment secrets.
pub fn build_services(config: &Config) -> Result<(DynLanguageModel, DynSearchService), ResearchError> {
    let model = GeminiClient::new(&config.llm, config.llm_api_key()?)?;
    let search = TavilyClient::new(&config.search, config.search_api_key()?)?;
    Ok((Arc::new(model), Arc::new(search)))
}

/// Wire the controller around `model` and `search`, all model calls sharing one bucket.
pub fn build_controller(
    config: &Config,
    model: DynLanguageModel,
    search: DynSearchService,
) -> (ResearchController, DynLanguageModel) {
    let bucket = Arc::new(TokenBucket::from_config(&config.rate_limit));
    let limited: DynLanguageModel = Arc::new(
        RateLimitedModel::new(model, bucket, TokenEstimator::from_config(&config.rate_limit))
            .with_timeout(config.rate_limit.acquire_timeout()),
    );

    let planner = QueryPlanner::new(limited.clone(), config.llm.planner_max_tokens)
        .with_temperature(config.llm.temperature)
        .with_default_news_days(config.search.default_news_days);
    let executor = SearchExecutor::new(search.clone(), config.search.max_results_per_query);
    let curator = Curator::new(limited.clone(), search, config.research.max_curated_documents)
        .with_max_tokens(config.llm.curation_max_tokens)
        .with_temperature(config.llm.temperature);

    let controller =
        ResearchController::new(planner, executor, curator, config.research.max_iterations);
    (controller, limited)
}

/// Run the loop, draft and export the report, then append the run log.
///
/// Drafting, export, trace and log failures are logged and leave the
/// corresponding output empty; only a loop failure aborts the session.
pub async fn run_research(
    config: &Config,
    options: SessionOptions,
    model: DynLanguageModel,
    search: DynSearchService,
    cancel: &CancellationToken,
) -> Result<SessionOutcome> {
    let session_id = options.session_id.clone().unwrap_or_else(new_session_id);
    let (controller, limited) = build_controller(config, model, search);

    info!(
        session_id = %session_id,
        company = %options.target.company,
        max_iterations = controller.max_iterations(),
        "research session started"
    );

    let outcome = controller.run(options.target, cancel).await?;
    let mut state = outcome.state;

    if !state.curated.is_empty() && !cancel.is_cancelled() {
        let drafter = ReportDrafter::new(limited, config.llm.report_max_tokens);
        if let Err(err) = drafter.draft(&mut state).await {
            warn!(session_id = %session_id, error = %err, "report drafting failed");
        }
    }

    let report_path = match (&options.output_dir, &state.report) {
        (Some(dir), Some(_)) => match export_markdown(&state, dir) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "report export failed");
                None
            }
        },
        _ => None,
    };

    let trace_path = match &options.trace_dir {
        Some(dir) => match persist_trace(dir, &session_id, &outcome.trace) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to persist trace");
                None
            }
        },
        None => None,
    };

    let log_input = RunLogInput {
        session_id: session_id.clone(),
        company: state.target.company.clone(),
        iterations: state.iteration(),
        stop_reason: outcome.stop_reason.as_str().to_string(),
        collected: state.collected.len(),
        curated: state.curated.urls().map(str::to_string).collect(),
        report_path: report_path
            .as_ref()
            .map(|path| path.display().to_string()),
    };
    let logged = match &options.log_dir {
        Some(dir) => log_run_completion_in(dir, log_input),
        None => log_run_completion(log_input),
    };
    if let Err(err) = logged {
        warn!(session_id = %session_id, error = %err, "failed to append run log");
    }

    info!(
        session_id = %session_id,
        stop_reason = outcome.stop_reason.as_str(),
        curated = state.curated.len(),
        report = state.report.is_some(),
        "research session finished"
    );

    Ok(SessionOutcome {
        session_id,
        state,
        stop_reason: outcome.stop_reason,
        trace: outcome.trace,
        report_path,
        trace_path,
    })
}

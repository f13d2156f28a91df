//! The bounded plan → search → plan loop and its exit into curation.
//!
//! ```text
//! PLANNING ──search requested──▶ AWAITING_TOOLS ──batch merged──▶ PLANNING
//!    │
//!    └──complete / limit / failure / cancel──▶ CURATING ──▶ DONE
//! ```
//!
//! Transitions out of `PLANNING` are decided by the pure [`decide`]
//! function. The iteration counter only moves when a search batch
//! completes, so a run makes at most `max_iterations + 1` planner calls.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::ResearchError;
use crate::curation::{CurationReport, Curator};
use crate::metrics;
use crate::planner::{PlannerDecision, QueryPlanner, SearchPlan};
use crate::search::SearchExecutor;
use crate::state::{ConversationMessage, ResearchState, ResearchTarget};
use crate::trace::{TraceCollector, TraceSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    AwaitingTools,
    Curating,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::AwaitingTools => "awaiting_tools",
            Phase::Curating => "curating",
            Phase::Done => "done",
        }
    }
}

/// Why the loop stopped gathering documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    PlannerComplete,
    MalformedPlannerOutput,
    IterationLimit,
    PlannerUnavailable,
    RateLimited,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::PlannerComplete => "planner_complete",
            StopReason::MalformedPlannerOutput => "malformed_planner_output",
            StopReason::IterationLimit => "iteration_limit",
            StopReason::PlannerUnavailable => "planner_unavailable",
            StopReason::RateLimited => "rate_limited",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// What the latest planner step amounted to, stripped of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerSignal {
    RequestedSearch,
    Complete,
    Malformed,
    Unavailable,
    RateLimited,
    Cancelled,
}

impl PlannerSignal {
    fn from_result(result: &Result<PlannerDecision, ResearchError>) -> Self {
        match result {
            Ok(PlannerDecision::Search(_)) => Self::RequestedSearch,
            Ok(PlannerDecision::Complete) => Self::Complete,
            Err(ResearchError::MalformedPlannerOutput(_)) => Self::Malformed,
            Err(ResearchError::RateLimitTimeout { .. }) => Self::RateLimited,
            Err(_) => Self::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Dispatch,
    Curate(StopReason),
}

/// Transition out of `PLANNING`.
///
/// The iteration bound wins over everything, including a pending search.
pub fn decide(iteration: u32, max_iterations: u32, signal: PlannerSignal) -> Transition {
    if iteration >= max_iterations {
        return Transition::Curate(StopReason::IterationLimit);
    }
    match signal {
        PlannerSignal::RequestedSearch => Transition::Dispatch,
        PlannerSignal::Complete => Transition::Curate(StopReason::PlannerComplete),
        PlannerSignal::Malformed => Transition::Curate(StopReason::MalformedPlannerOutput),
        PlannerSignal::Unavailable => Transition::Curate(StopReason::PlannerUnavailable),
        PlannerSignal::RateLimited => Transition::Curate(StopReason::RateLimited),
        PlannerSignal::Cancelled => Transition::Curate(StopReason::Cancelled),
    }
}

/// Final state handed to drafting, with how the run got there.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub state: ResearchState,
    pub stop_reason: StopReason,
    pub curation: CurationReport,
    pub trace: TraceSummary,
}

pub struct ResearchController {
    planner: QueryPlanner,
    executor: SearchExecutor,
    curator: Curator,
    max_iterations: u32,
}

impl ResearchController {
    pub fn new(
        planner: QueryPlanner,
        executor: SearchExecutor,
        curator: Curator,
        max_iterations: u32,
    ) -> Self {
        Self {
            planner,
            executor,
            curator,
            max_iterations,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Drive one research request from `PLANNING` to `DONE`.
    ///
    /// Planner, search and extraction failures degrade the run; the only
    /// error returned is a store that can no longer accept documents.
    #[instrument(name = "controller.run", skip_all, fields(company = %target.company))]
    pub async fn run(
        &self,
        target: ResearchTarget,
        cancel: &CancellationToken,
    ) -> Result<ResearchOutcome, ResearchError> {
        let mut state = ResearchState::new(target);
        let mut trace = TraceCollector::new();
        let mut phase = Phase::Planning;
        let mut pending: Option<SearchPlan> = None;
        let mut stop_reason = StopReason::PlannerComplete;
        let mut curation = CurationReport::default();

        loop {
            match phase {
                Phase::Planning => {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = self.planner.propose(&mut state) => Some(result),
                    };

                    let signal = match &result {
                        Some(result) => PlannerSignal::from_result(result),
                        None => PlannerSignal::Cancelled,
                    };
                    if let Some(Err(err)) = &result {
                        warn!(error = %err, "planner step failed; moving to curation");
                    }

                    match (decide(state.iteration(), self.max_iterations, signal), result) {
                        (Transition::Dispatch, Some(Ok(PlannerDecision::Search(plan)))) => {
                            trace.record(
                                Phase::Planning,
                                state.iteration(),
                                format!("planner requested {} queries", plan.queries.len()),
                            );
                            pending = Some(plan);
                            phase = Phase::AwaitingTools;
                        }
                        (transition, _) => {
                            let reason = match transition {
                                Transition::Curate(reason) => reason,
                                Transition::Dispatch => StopReason::PlannerComplete,
                            };
                            trace.record(
                                Phase::Planning,
                                state.iteration(),
                                format!("stopping search: {}", reason.as_str()),
                            );
                            stop_reason = reason;
                            phase = Phase::Curating;
                        }
                    }
                }
                Phase::AwaitingTools => {
                    let Some(plan) = pending.take() else {
                        phase = Phase::Curating;
                        continue;
                    };

                    let report = self
                        .executor
                        .execute_batch(&plan.queries, &mut state.collected, cancel)
                        .await?;

                    if report.cancelled {
                        trace.record(
                            Phase::AwaitingTools,
                            state.iteration(),
                            format!("batch cancelled after {} new documents", report.added.len()),
                        );
                        stop_reason = StopReason::Cancelled;
                        phase = Phase::Curating;
                        continue;
                    }

                    let iteration = state.complete_iteration();
                    let summary = tool_result_summary(&report.added);
                    for call in &plan.calls {
                        state.push_message(ConversationMessage::ToolResult {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            content: summary.clone(),
                        });
                    }
                    trace.record(
                        Phase::AwaitingTools,
                        iteration,
                        format!(
                            "added {} documents ({} enriched, {} queries failed)",
                            report.added.len(),
                            report.enriched,
                            report.failed_queries
                        ),
                    );
                    phase = Phase::Planning;
                }
                Phase::Curating => {
                    curation = self.curator.curate(&mut state, cancel).await;
                    trace.record(
                        Phase::Curating,
                        state.iteration(),
                        format!(
                            "selected {} of {} documents",
                            curation.selected,
                            state.collected.len()
                        ),
                    );
                    phase = Phase::Done;
                }
                Phase::Done => break,
            }
        }

        metrics::record_iterations(state.iteration(), stop_reason.as_str());
        info!(
            iterations = state.iteration(),
            collected = state.collected.len(),
            curated = state.curated.len(),
            stop_reason = stop_reason.as_str(),
            "research loop finished"
        );

        Ok(ResearchOutcome {
            state,
            stop_reason,
            curation,
            trace: trace.summary(),
        })
    }
}

fn tool_result_summary(added: &[crate::documents::DocumentRecord]) -> String {
    if added.is_empty() {
        return "No new documents were found.".to_string();
    }
    let mut summary = String::from("Found the following new documents/information:\n");
    for record in added {
        summary.push_str(&format!("{}: {}\n", record.title, record.url));
    }
    summary
}

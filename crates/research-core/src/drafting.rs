//! Report drafting from curated documents and markdown export.

use std::fmt::Write as _;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::ResearchError;
use crate::curation::extract_json_object;
use crate::documents::DocumentStore;
use crate::llm::{DynLanguageModel, ModelRequest, ModelResponse};
use crate::state::{ConversationMessage, ResearchState};

/// Characters of extracted content passed per document.
const CONTENT_BUDGET: usize = 6_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub quote: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotedAnswer {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

pub struct ReportDrafter {
    model: DynLanguageModel,
    max_tokens: u32,
}

impl ReportDrafter {
    pub fn new(model: DynLanguageModel, max_tokens: u32) -> Self {
        Self { model, max_tokens }
    }

    /// Draft the report into `state.report`.
    ///
    /// On error the report stays empty; callers log and carry on.
    #[instrument(name = "drafting", skip_all, fields(curated = state.curated.len()))]
    pub async fn draft(&self, state: &mut ResearchState) -> Result<(), ResearchError> {
        let prompt = build_report_prompt(state, &Local::now().format("%d/%m/%Y").to_string());
        let request = ModelRequest::new(
            vec![ConversationMessage::PlannerRequest { content: prompt }],
            self.max_tokens,
        )
        .with_temperature(0.0);

        let text = match self.model.complete(request).await? {
            ModelResponse::Text(text) => text,
            ModelResponse::ToolCalls(_) => {
                return Err(ResearchError::MalformedPlannerOutput(
                    "report draft answered with a tool call".into(),
                ));
            }
        };

        let json = extract_json_object(&text).ok_or_else(|| {
            ResearchError::MalformedPlannerOutput("report draft contained no JSON object".into())
        })?;
        let answer: QuotedAnswer = serde_json::from_str(json)
            .map_err(|err| ResearchError::MalformedPlannerOutput(err.to_string()))?;

        let report = render_report(&answer, &state.curated);
        info!(chars = report.len(), citations = answer.citations.len(), "report drafted");
        state.report = Some(report);
        Ok(())
    }
}

/// Markdown answer followed by a citation list resolved against `curated`.
pub fn render_report(answer: &QuotedAnswer, curated: &DocumentStore) -> String {
    let mut report = answer.answer.trim_end().to_string();
    if answer.citations.is_empty() {
        return report;
    }
    report.push_str("\n\n### Citations\n");
    for citation in &answer.citations {
        let title = curated
            .get(&citation.source_id)
            .map(|record| record.title.as_str())
            .filter(|title| !title.trim().is_empty())
            .unwrap_or(citation.source_id.as_str());
        let _ = writeln!(
            report,
            "- [{}]({}): \"{}\"",
            title, citation.source_id, citation.quote
        );
    }
    report
}

fn build_report_prompt(state: &ResearchState, today: &str) -> String {
    let mut prompt = format!(
        "Today's date is {today}.\n\
         You are an expert researcher writing a weekly report about recent events in \
         portfolio companies.\n\
         Write an in-depth, well-written and detailed report in markdown on the company: {}.\n\
         Base the report only on the documents below and cite them by URL.\n\
         Reply with JSON only: {{\"answer\": \"<markdown>\", \"citations\": \
         [{{\"source_id\": \"<url>\", \"quote\": \"<verbatim quote>\"}}]}}.\n\
         Documents:\n",
        state.target.company
    );
    for record in state.curated.iter() {
        let body = record.raw_content.as_deref().unwrap_or(&record.snippet);
        let body: String = body.chars().take(CONTENT_BUDGET).collect();
        let _ = writeln!(prompt, "## {} ({})\n{}\n", record.title, record.url, body);
    }
    prompt
}

/// Keep alphanumerics and spaces only.
pub fn sanitize_company_name(company: &str) -> String {
    company
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Write the drafted report to `<dir>/<company> Weekly Report <timestamp>.md`.
pub fn export_markdown(state: &ResearchState, dir: &Path) -> Result<PathBuf> {
    let report = state
        .report
        .as_deref()
        .filter(|report| !report.trim().is_empty())
        .context("no report content to export")?;

    create_dir_all(dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;

    let mut company = sanitize_company_name(&state.target.company);
    if company.is_empty() {
        warn!("company name sanitised to nothing; using placeholder file name");
        company = "Company".to_string();
    }
    let file_name = format!(
        "{company} Weekly Report {}.md",
        Local::now().format("%Y-%m-%d %H-%M-%S")
    );
    let path = dir.join(file_name);
    std::fs::write(&path, report)
        .with_context(|| format!("failed to write report {}", path.display()))?;

    info!(path = %path.display(), bytes = report.len(), "report exported");
    Ok(path)
}

//! Selection and enrichment of the documents handed to report drafting.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::ResearchError;
use crate::documents::{DocumentRecord, DocumentStore, canonical_identity};
use crate::llm::{DynLanguageModel, ModelRequest, ModelResponse};
use crate::search::DynSearchService;
use crate::state::{ConversationMessage, ResearchState, ResearchTarget};

/// Characters of each snippet shown to the ranking model.
const SNIPPET_PREVIEW: usize = 300;

/// Case-insensitive exclusion keywords matched against URL and title.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    keywords: Vec<String>,
}

impl ExclusionRules {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|keyword| keyword.as_ref().trim().to_lowercase())
                .filter(|keyword| !keyword.is_empty())
                .collect(),
        }
    }

    pub fn from_target(target: &ResearchTarget) -> Self {
        Self::new(&target.exclude_keywords)
    }

    pub fn excludes(&self, record: &DocumentRecord) -> bool {
        if self.keywords.is_empty() {
            return false;
        }
        let url = record.url.to_lowercase();
        let title = record.title.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| url.contains(keyword) || title.contains(keyword))
    }
}

/// One document the ranking step picked, with an optional relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedUrl {
    pub url: String,
    pub relevance: Option<f64>,
}

/// Accepted ranking replies: `{"urls": [...]}` or
/// `{"documents": [{"url": ..., "relevance": ...}]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RankingReply {
    Scored { documents: Vec<ScoredUrl> },
    Plain { urls: Vec<String> },
}

#[derive(Debug, Deserialize)]
struct ScoredUrl {
    url: String,
    #[serde(default)]
    relevance: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct CurationReport {
    pub selected: usize,
    pub extracted: usize,
    pub ranking_fallback: bool,
    pub extraction_failed: bool,
}

pub struct Curator {
    model: DynLanguageModel,
    search: DynSearchService,
    max_tokens: u32,
    temperature: f32,
    max_documents: usize,
}

impl Curator {
    pub fn new(model: DynLanguageModel, search: DynSearchService, max_documents: usize) -> Self {
        Self {
            model,
            search,
            max_tokens: 3500,
            temperature: 0.2,
            max_documents,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Populate `state.curated` from `state.collected`.
    ///
    /// Never fails: a ranking failure falls back to every non-excluded
    /// document, an extraction failure keeps the snippet-only records. Once
    /// `cancel` has fired neither external call is attempted.
    #[instrument(name = "curation", skip_all, fields(collected = state.collected.len()))]
    pub async fn curate(&self, state: &mut ResearchState, cancel: &CancellationToken) -> CurationReport {
        let mut report = CurationReport::default();
        state.curated.clear();
        if state.collected.is_empty() {
            info!("nothing collected; curated set stays empty");
            return report;
        }

        let ranked = if cancel.is_cancelled() {
            None
        } else {
            match self.rank(state).await {
                Ok(ranked) => Some(ranked),
                Err(err) => {
                    warn!(error = %err, "ranking failed; falling back to collected order");
                    None
                }
            }
        };
        report.ranking_fallback = ranked.is_none();
        let ranked = ranked.unwrap_or_else(|| {
            state
                .collected
                .urls()
                .map(|url| RankedUrl {
                    url: url.to_string(),
                    relevance: None,
                })
                .collect()
        });

        let rules = ExclusionRules::from_target(&state.target);
        let mut selected = select(&state.collected, &ranked, &rules);
        selected.truncate(self.max_documents);
        report.selected = selected.len();

        let missing: Vec<String> = selected
            .iter()
            .filter(|record| record.raw_content.is_none() && record.url.starts_with("http"))
            .map(|record| record.url.clone())
            .collect();

        if !missing.is_empty() && !cancel.is_cancelled() {
            match self.search.extract(&missing).await {
                Ok(contents) => {
                    for (url, content) in contents {
                        let key = canonical_identity(&url);
                        if content.trim().is_empty() {
                            continue;
                        }
                        if let Some(record) = selected.iter_mut().find(|record| record.url == key) {
                            record.raw_content = Some(content);
                            report.extracted += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, urls = missing.len(), "extraction failed; keeping snippets");
                    report.extraction_failed = true;
                }
            }
        }

        for record in selected {
            if let Some(raw) = record.raw_content.clone() {
                state.collected.set_raw_content(&record.url, raw);
            }
            // `curated` is a fresh store bounded by `collected`, so this cannot exhaust it.
            if let Err(err) = state.curated.merge(record) {
                warn!(error = %err, "failed to record curated document");
            }
        }

        info!(
            selected = report.selected,
            extracted = report.extracted,
            fallback = report.ranking_fallback,
            "curation complete"
        );
        report
    }

    async fn rank(&self, state: &ResearchState) -> Result<Vec<RankedUrl>, ResearchError> {
        let prompt = build_ranking_prompt(state);
        let request = ModelRequest::new(
            vec![ConversationMessage::PlannerRequest { content: prompt }],
            self.max_tokens,
        )
        .with_temperature(self.temperature);

        match self.model.complete(request).await? {
            ModelResponse::Text(text) => parse_ranking(&text),
            ModelResponse::ToolCalls(_) => Err(ResearchError::MalformedPlannerOutput(
                "ranking step answered with a tool call".into(),
            )),
        }
    }
}

/// Resolve ranked URLs against the store, drop exclusions and duplicates,
/// and order by relevance, then prior score, then retrieval order.
pub fn select(
    collected: &DocumentStore,
    ranked: &[RankedUrl],
    rules: &ExclusionRules,
) -> Vec<DocumentRecord> {
    let mut seen = HashSet::new();
    let mut picked: Vec<(Option<f64>, usize, DocumentRecord)> = Vec::new();

    for entry in ranked {
        let Some(record) = collected.get(&entry.url) else {
            continue;
        };
        if !seen.insert(record.url.clone()) || rules.excludes(record) {
            continue;
        }
        let position = collected.position(&record.url).unwrap_or(usize::MAX);
        picked.push((entry.relevance, position, record.clone()));
    }

    picked.sort_by(|a, b| {
        desc_option(a.0, b.0)
            .then_with(|| desc_option(a.2.score, b.2.score))
            .then_with(|| a.1.cmp(&b.1))
    });
    picked.into_iter().map(|(_, _, record)| record).collect()
}

/// Higher first; present before absent.
fn desc_option(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn build_ranking_prompt(state: &ResearchState) -> String {
    let target = &state.target;
    let mut prompt = format!(
        "You are an expert researcher specializing in analyzing portfolio companies.\n\
         Review the documents below and select the URLs most relevant to recent developments \
         for the company: {}.\n\
         Some documents may refer to other companies with similar or identical names; choose \
         the ones about the correct company that give consistent information.\n",
        target.company
    );
    if !target.keywords.is_empty() {
        prompt.push_str(&format!(
            "Keywords identifying the correct company: {}.\n",
            target.keywords.join(", ")
        ));
    }
    if !target.exclude_keywords.is_empty() {
        prompt.push_str(&format!(
            "Filter out documents containing any form of these words: {}.\n",
            target.exclude_keywords.join(", ")
        ));
    }
    prompt.push_str(
        "Reply with JSON only, shaped as {\"documents\": [{\"url\": \"...\", \"relevance\": 0.0-1.0}]}.\n\
         Documents:\n",
    );
    for record in state.collected.iter() {
        let preview: String = record.snippet.chars().take(SNIPPET_PREVIEW).collect();
        prompt.push_str(&format!("- {} | {} | {}\n", record.url, record.title, preview));
    }
    prompt
}

/// Pull the JSON object out of a model reply, tolerating code fences and chatter.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_ranking(text: &str) -> Result<Vec<RankedUrl>, ResearchError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ResearchError::MalformedPlannerOutput("no JSON object in ranking".into()))?;
    let reply: RankingReply = serde_json::from_str(json)
        .map_err(|err| ResearchError::MalformedPlannerOutput(err.to_string()))?;
    Ok(match reply {
        RankingReply::Scored { documents } => documents
            .into_iter()
            .map(|doc| RankedUrl {
                url: doc.url,
                relevance: doc.relevance,
            })
            .collect(),
        RankingReply::Plain { urls } => urls
            .into_iter()
            .map(|url| RankedUrl {
                url,
                relevance: None,
            })
            .collect(),
    })
}

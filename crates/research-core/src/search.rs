//! Concurrent, failure-isolated execution of planner search batches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::ResearchError;
use crate::documents::{DocumentRecord, DocumentStore, MergeOutcome};
use crate::metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    #[default]
    General,
    News,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::General => "general",
            Topic::News => "news",
        }
    }
}

/// One planner-proposed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub topic: Topic,
    /// Recency window; only meaningful for news.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

impl SearchQuery {
    pub fn general(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            topic: Topic::General,
            days: None,
        }
    }

    pub fn news(query: impl Into<String>, days: u32) -> Self {
        Self {
            query: query.into(),
            topic: Topic::News,
            days: Some(days),
        }
    }
}

/// Request as sent to the search service.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub topic: Topic,
    pub days: Option<u32>,
    pub max_results: u8,
}

/// Raw search result before it becomes a [`DocumentRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl From<SearchHit> for DocumentRecord {
    fn from(hit: SearchHit) -> Self {
        let mut record = DocumentRecord::new(hit.url, hit.title, hit.content);
        record.raw_content = hit.raw_content.filter(|raw| !raw.trim().is_empty());
        record.score = hit.score;
        record
    }
}

/// Web search and content extraction capability.
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ResearchError>;

    /// Full page content keyed by URL; URLs that could not be fetched are absent.
    async fn extract(&self, urls: &[String]) -> Result<HashMap<String, String>, ResearchError>;
}

pub type DynSearchService = Arc<dyn SearchService>;

/// `MM-YYYY` token appended to every query to bias towards recent results.
pub fn recency_token<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%m-%Y").to_string()
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Records whose identity was new to the store, in first-seen order.
    pub added: Vec<DocumentRecord>,
    /// Known identities that were upgraded with more complete records.
    pub enriched: usize,
    pub failed_queries: usize,
    pub cancelled: bool,
}

/// Fans a batch of queries out as one task per query and merges the results.
pub struct SearchExecutor {
    service: DynSearchService,
    max_results: u8,
    recency_override: Option<String>,
}

impl SearchExecutor {
    pub fn new(service: DynSearchService, max_results: u8) -> Self {
        Self {
            service,
            max_results,
            recency_override: None,
        }
    }

    /// Pin the recency token instead of deriving it from the clock.
    pub fn with_recency_token(mut self, token: impl Into<String>) -> Self {
        self.recency_override = Some(token.into());
        self
    }

    pub fn service(&self) -> &DynSearchService {
        &self.service
    }

    fn build_request(&self, query: &SearchQuery, recency: &str) -> SearchRequest {
        let text = query.query.trim();
        SearchRequest {
            query: if recency.is_empty() {
                text.to_string()
            } else {
                format!("{text} {recency}")
            },
            topic: query.topic,
            days: match query.topic {
                Topic::News => query.days,
                Topic::General => None,
            },
            max_results: self.max_results,
        }
    }

    /// Run every query concurrently, merge into `store`, and report what was new.
    ///
    /// A failing query contributes nothing and never affects its siblings.
    /// On cancellation outstanding tasks are aborted and whatever already
    /// finished is still merged. The only error is store exhaustion.
    #[instrument(name = "search.batch", skip_all, fields(queries = queries.len()))]
    pub async fn execute_batch(
        &self,
        queries: &[SearchQuery],
        store: &mut DocumentStore,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, ResearchError> {
        let recency = self
            .recency_override
            .clone()
            .unwrap_or_else(|| recency_token(&Local::now()));

        let mut tasks = JoinSet::new();
        for (index, query) in queries.iter().enumerate() {
            let request = self.build_request(query, &recency);
            let service = self.service.clone();
            tasks.spawn(async move {
                let result = service.search(&request).await;
                (index, request, result)
            });
        }

        let mut per_query: Vec<Vec<SearchHit>> = vec![Vec::new(); queries.len()];
        let mut report = BatchReport::default();

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    while let Some(finished) = tasks.try_join_next() {
                        record_outcome(finished, &mut per_query, &mut report);
                    }
                    warn!(
                        outstanding = tasks.len(),
                        "search batch cancelled; abandoning in-flight queries"
                    );
                    tasks.abort_all();
                    report.cancelled = true;
                    break;
                }
                joined = tasks.join_next() => joined,
            };

            let Some(joined) = joined else { break };
            record_outcome(joined, &mut per_query, &mut report);
        }

        // Dedupe within the batch first so `added` reflects the best version.
        let mut batch = DocumentStore::with_limit(usize::MAX);
        for hit in per_query.into_iter().flatten() {
            batch.merge(hit.into())?;
        }

        for record in batch.iter() {
            match store.merge(record.clone())? {
                MergeOutcome::Inserted => {
                    if let Some(stored) = store.get(&record.url) {
                        report.added.push(stored.clone());
                    }
                }
                MergeOutcome::Enriched => report.enriched += 1,
                MergeOutcome::Kept => {}
            }
        }

        metrics::record_documents_added(report.added.len());
        info!(
            added = report.added.len(),
            enriched = report.enriched,
            failed = report.failed_queries,
            cancelled = report.cancelled,
            total = store.len(),
            "search batch merged"
        );

        Ok(report)
    }
}

type QueryOutcome = (usize, SearchRequest, Result<Vec<SearchHit>, ResearchError>);

fn record_outcome(
    joined: Result<QueryOutcome, JoinError>,
    per_query: &mut [Vec<SearchHit>],
    report: &mut BatchReport,
) {
    match joined {
        Ok((index, request, Ok(hits))) => {
            debug!(query = %request.query, hits = hits.len(), "search query completed");
            metrics::record_search_query("ok");
            per_query[index] = hits;
        }
        Ok((_, request, Err(err))) => {
            warn!(query = %request.query, error = %err, "search query failed; continuing without it");
            metrics::record_search_query("error");
            report.failed_queries += 1;
        }
        Err(err) => {
            warn!(error = %err, "search task aborted");
            metrics::record_search_query("error");
            report.failed_queries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct EchoSearch;

    #[async_trait]
    impl SearchService for EchoSearch {
        async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ResearchError> {
            if request.query.starts_with("fail") {
                return Err(ResearchError::service("search", "boom"));
            }
            Ok(vec![SearchHit {
                url: format!("https://example.com/{}", request.query.replace(' ', "-")),
                title: request.query.clone(),
                content: "snippet".into(),
                raw_content: None,
                score: None,
            }])
        }

        async fn extract(&self, _urls: &[String]) -> Result<HashMap<String, String>, ResearchError> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn recency_token_is_month_and_year() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(recency_token(&now), "03-2024");
    }

    #[test]
    fn general_queries_drop_recency_window() {
        let executor = SearchExecutor::new(Arc::new(EchoSearch), 5);
        let request = executor.build_request(
            &SearchQuery {
                query: " acme funding ".into(),
                topic: Topic::General,
                days: Some(3),
            },
            "03-2024",
        );
        assert_eq!(request.query, "acme funding 03-2024");
        assert_eq!(request.days, None);
        assert_eq!(request.max_results, 5);

        let news = executor.build_request(&SearchQuery::news("acme", 7), "03-2024");
        assert_eq!(news.days, Some(7));
        assert_eq!(news.topic, Topic::News);
    }

    #[tokio::test]
    async fn failing_query_does_not_sink_batch() {
        let executor = SearchExecutor::new(Arc::new(EchoSearch), 5).with_recency_token("");
        let mut store = DocumentStore::new();
        let report = executor
            .execute_batch(
                &[SearchQuery::general("fail hard"), SearchQuery::general("acme")],
                &mut store,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.failed_queries, 1);
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.added[0].url, "https://example.com/acme");
        assert_eq!(store.len(), 1);
    }

    /// Cancels the batch from inside a query that never finishes.
    struct StallingSearch {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl SearchService for StallingSearch {
        async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ResearchError> {
            if request.query.starts_with("stall") {
                self.cancel.cancel();
                std::future::pending::<()>().await;
            }
            EchoSearch.search(request).await
        }

        async fn extract(&self, _urls: &[String]) -> Result<HashMap<String, String>, ResearchError> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn cancelled_batch_keeps_finished_queries() {
        let cancel = CancellationToken::new();
        let service = Arc::new(StallingSearch {
            cancel: cancel.clone(),
        });
        let executor = SearchExecutor::new(service, 5).with_recency_token("");
        let mut store = DocumentStore::new();

        let report = executor
            .execute_batch(
                &[SearchQuery::general("acme"), SearchQuery::general("stall forever")],
                &mut store,
                &cancel,
            )
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.added.len(), 1);
        assert!(store.contains("https://example.com/acme"));
    }

    #[test]
    fn hit_deserializes_from_service_shape() {
        let hit: SearchHit = serde_json::from_str(
            r#"{"url":"https://a.io","title":"A","content":"c","score":0.42,"raw_content":null}"#,
        )
        .unwrap();
        let record: DocumentRecord = hit.into();
        assert_eq!(record.score, Some(0.42));
        assert!(record.raw_content.is_none());
    }
}

//! Tavily search and extract client.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::search::{SearchHit, SearchRequest, SearchService};
use crate::{ResearchError, SecretValue};

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";
const SERVICE: &str = "tavily";

pub struct TavilyClient {
    client: Client,
    base_url: String,
    api_key: SecretValue,
}

#[derive(Serialize)]
struct SearchBody<'a> {
    api_key: &'a str,
    query: &'a str,
    topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    days: Option<u32>,
    max_results: u8,
}

#[derive(Serialize)]
struct ExtractBody<'a> {
    api_key: &'a str,
    urls: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SearchReply {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct ExtractReply {
    #[serde(default)]
    results: Vec<ExtractedPage>,
    #[serde(default)]
    failed_results: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ExtractedPage {
    url: String,
    #[serde(default)]
    raw_content: Option<String>,
}

impl TavilyClient {
    pub fn new(config: &SearchConfig, api_key: SecretValue) -> Result<Self, ResearchError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| ResearchError::service(SERVICE, err))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ResearchError> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|err| ResearchError::service(SERVICE, err))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ResearchError::service(
                SERVICE,
                format!("HTTP {} from /{path}: {}", status.as_u16(), detail.trim()),
            ));
        }

        response
            .json::<R>()
            .await
            .map_err(|err| ResearchError::service(SERVICE, err))
    }
}

#[async_trait]
impl SearchService for TavilyClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ResearchError> {
        let body = SearchBody {
            api_key: self.api_key.expose(),
            query: &request.query,
            topic: request.topic.as_str(),
            days: request.days,
            max_results: request.max_results,
        };
        let reply: SearchReply = self.post("search", &body).await?;
        debug!(query = %request.query, hits = reply.results.len(), "tavily search returned");
        Ok(reply.results)
    }

    async fn extract(&self, urls: &[String]) -> Result<HashMap<String, String>, ResearchError> {
        if urls.is_empty() {
            return Ok(HashMap::new());
        }
        let body = ExtractBody {
            api_key: self.api_key.expose(),
            urls,
        };
        let reply: ExtractReply = self.post("extract", &body).await?;
        if !reply.failed_results.is_empty() {
            warn!(failed = reply.failed_results.len(), "tavily could not extract some urls");
        }
        Ok(pages_by_url(reply.results))
    }
}

fn pages_by_url(pages: Vec<ExtractedPage>) -> HashMap<String, String> {
    pages
        .into_iter()
        .filter_map(|page| {
            page.raw_content
                .filter(|content| !content.trim().is_empty())
                .map(|content| (page.url, content))
        })
        .collect()
}

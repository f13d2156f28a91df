//! Deduplicated, insertion-ordered document accumulation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResearchError;

/// Hard ceiling on documents held for one research request.
pub const DEFAULT_MAX_DOCUMENTS: usize = 10_000;

/// A single retrieved web document keyed by its canonical URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub url: String,
    pub title: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub retrieved_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(url: impl Into<String>, title: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            snippet: snippet.into(),
            raw_content: None,
            score: None,
            retrieved_at: Utc::now(),
        }
    }

    pub fn with_raw_content(mut self, raw_content: impl Into<String>) -> Self {
        self.raw_content = Some(raw_content.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn identity(&self) -> String {
        canonical_identity(&self.url)
    }

    /// Ordering key for merge decisions: full content dominates, then the
    /// number of populated optional fields.
    fn completeness(&self) -> (bool, usize) {
        let has_raw = self
            .raw_content
            .as_deref()
            .is_some_and(|raw| !raw.trim().is_empty());
        let populated = [
            has_raw,
            self.score.is_some(),
            !self.title.trim().is_empty(),
            !self.snippet.trim().is_empty(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();
        (has_raw, populated)
    }

    /// Fill any gaps in `self` from `other` without overwriting what is there.
    fn absorb(&mut self, other: &DocumentRecord) {
        if self.raw_content.is_none() {
            self.raw_content = other.raw_content.clone();
        }
        if self.score.is_none() {
            self.score = other.score;
        }
        if self.title.trim().is_empty() {
            self.title = other.title.clone();
        }
        if self.snippet.trim().is_empty() {
            self.snippet = other.snippet.clone();
        }
        self.retrieved_at = self.retrieved_at.min(other.retrieved_at);
    }
}

/// Normalise a URL into the deduplication key: whitespace, fragments and a
/// trailing slash do not distinguish documents.
pub fn canonical_identity(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let stripped = without_fragment.strip_suffix('/').unwrap_or(without_fragment);
    if stripped.contains("://") {
        stripped.to_string()
    } else {
        without_fragment.to_string()
    }
}

/// What happened to a record offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New identity.
    Inserted,
    /// Known identity; the incoming record was more complete and replaced it.
    Enriched,
    /// Known identity; the stored record was at least as complete.
    Kept,
}

/// Mapping from canonical URL to document, remembering first-seen order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStore {
    order: Vec<String>,
    records: HashMap<String, DocumentRecord>,
    max_documents: usize,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_DOCUMENTS)
    }

    pub fn with_limit(max_documents: usize) -> Self {
        Self {
            order: Vec::new(),
            records: HashMap::new(),
            max_documents,
        }
    }

    /// Merge a record, keeping whichever version carries more information.
    ///
    /// Ties keep the stored (first-seen) record. Either way the surviving
    /// record picks up optional fields only the other one had.
    pub fn merge(&mut self, mut record: DocumentRecord) -> Result<MergeOutcome, ResearchError> {
        let key = record.identity();
        record.url = key.clone();

        if let Some(existing) = self.records.get_mut(&key) {
            if record.completeness() > existing.completeness() {
                record.absorb(existing);
                *existing = record;
                return Ok(MergeOutcome::Enriched);
            }
            existing.absorb(&record);
            return Ok(MergeOutcome::Kept);
        }

        if self.records.len() >= self.max_documents {
            return Err(ResearchError::StoreExhausted(format!(
                "document limit {} reached while adding {key}",
                self.max_documents
            )));
        }

        self.order.push(key.clone());
        self.records.insert(key, record);
        Ok(MergeOutcome::Inserted)
    }

    pub fn get(&self, url: &str) -> Option<&DocumentRecord> {
        self.records.get(&canonical_identity(url))
    }

    pub fn contains(&self, url: &str) -> bool {
        self.records.contains_key(&canonical_identity(url))
    }

    /// Position of the identity in first-seen order.
    pub fn position(&self, url: &str) -> Option<usize> {
        let key = canonical_identity(url);
        self.order.iter().position(|candidate| *candidate == key)
    }

    /// Attach extracted full content to an existing record.
    pub fn set_raw_content(&mut self, url: &str, raw_content: String) -> bool {
        match self.records.get_mut(&canonical_identity(url)) {
            Some(record) => {
                record.raw_content = Some(raw_content);
                true
            }
            None => false,
        }
    }

    /// Records in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &DocumentRecord> + '_ {
        self.order.iter().filter_map(|key| self.records.get(key))
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.records.clear();
    }
}

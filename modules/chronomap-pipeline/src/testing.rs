//! Mock implementations of the pipeline seams for tests.
//!
//! Enabled for unit tests automatically and for integration tests through
//! the `test-support` feature.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use chronomap_common::{Narrative, SourceOutcome, StructuredFacts};

use crate::extractor::CompletionModel;
use crate::roster::RosterEntry;
use crate::sources::{NarrativeSource, StructuredSource};

// ---------------------------------------------------------------------------
// MockModel
// ---------------------------------------------------------------------------

/// Scripted completion model. Responses are consumed in order; when the
/// script runs dry the default response (if any) repeats.
pub struct MockModel {
    script: Mutex<Vec<String>>,
    default: Option<String>,
    failure: Option<String>,
    calls: Mutex<u32>,
}

impl MockModel {
    /// Always return the same completion.
    pub fn always(response: &str) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            default: Some(response.to_string()),
            failure: None,
            calls: Mutex::new(0),
        }
    }

    /// Return the scripted completions in order, then error.
    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            script: Mutex::new(responses),
            default: None,
            failure: None,
            calls: Mutex::new(0),
        }
    }

    /// Every call fails, as if the model server were unreachable.
    pub fn failing(reason: &str) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            default: None,
            failure: Some(reason.to_string()),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    fn next_response(&self) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        if let Some(reason) = &self.failure {
            return Err(anyhow!("{reason}"));
        }
        let mut script = self.script.lock().unwrap();
        if !script.is_empty() {
            return Ok(script.remove(0));
        }
        self.default
            .clone()
            .ok_or_else(|| anyhow!("mock model script exhausted"))
    }
}

#[async_trait]
impl CompletionModel for MockModel {
    async fn complete_with_schema(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _schema_name: &str,
        _schema: serde_json::Value,
    ) -> Result<String> {
        self.next_response()
    }
}

// ---------------------------------------------------------------------------
// Mock sources
// ---------------------------------------------------------------------------

/// Structured source with per-entity canned outcomes. Entities without an
/// entry come back `NotFound`. Counts fetches so tests can assert that
/// resumed runs skip completed work.
#[derive(Default)]
pub struct MockStructuredSource {
    outcomes: BTreeMap<String, SourceOutcome<StructuredFacts>>,
    fetches: Mutex<u32>,
}

impl MockStructuredSource {
    pub fn with(mut self, entity_id: &str, outcome: SourceOutcome<StructuredFacts>) -> Self {
        self.outcomes.insert(entity_id.to_string(), outcome);
        self
    }

    pub fn fetch_count(&self) -> u32 {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl StructuredSource for MockStructuredSource {
    async fn fetch_structured(&self, entry: &RosterEntry) -> SourceOutcome<StructuredFacts> {
        *self.fetches.lock().unwrap() += 1;
        self.outcomes
            .get(&entry.id)
            .cloned()
            .unwrap_or(SourceOutcome::NotFound)
    }
}

/// Narrative source with per-entity canned narrative and popularity
/// outcomes.
#[derive(Default)]
pub struct MockNarrativeSource {
    narratives: BTreeMap<String, SourceOutcome<Narrative>>,
    popularity: BTreeMap<String, SourceOutcome<f64>>,
    fetches: Mutex<u32>,
}

impl MockNarrativeSource {
    pub fn with_narrative(mut self, entity_id: &str, outcome: SourceOutcome<Narrative>) -> Self {
        self.narratives.insert(entity_id.to_string(), outcome);
        self
    }

    pub fn with_popularity(mut self, entity_id: &str, outcome: SourceOutcome<f64>) -> Self {
        self.popularity.insert(entity_id.to_string(), outcome);
        self
    }

    /// Canned happy path: one paragraph of prose and a popularity score.
    pub fn with_simple(self, entity_id: &str, paragraph: &str, popularity: f64) -> Self {
        self.with_narrative(
            entity_id,
            SourceOutcome::found(Narrative {
                paragraphs: vec![paragraph.to_string()],
                source_url: format!("https://example.org/wiki/{entity_id}"),
            }),
        )
        .with_popularity(entity_id, SourceOutcome::found(popularity))
    }

    pub fn fetch_count(&self) -> u32 {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl NarrativeSource for MockNarrativeSource {
    async fn fetch_narrative(&self, entry: &RosterEntry) -> SourceOutcome<Narrative> {
        *self.fetches.lock().unwrap() += 1;
        self.narratives
            .get(&entry.id)
            .cloned()
            .unwrap_or(SourceOutcome::NotFound)
    }

    async fn fetch_popularity(&self, entry: &RosterEntry) -> SourceOutcome<f64> {
        self.popularity
            .get(&entry.id)
            .cloned()
            .unwrap_or(SourceOutcome::NotFound)
    }
}

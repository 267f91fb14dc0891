//! Timeline event extraction from narrative text.
//!
//! Primary path: one schema-constrained completion per paragraph, parsed as
//! structured JSON. The model is an unreliable oracle, so parsing failures
//! fall back to a deterministic keyword scan of the paragraph rather than
//! discarding it. A paragraph that yields nothing either way is "no events
//! found", not an error.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use chronomap_common::{EventCategory, EventLocation, EventYear, TimelineEvent, YearConfidence};
use lm_client::{LocalModel, StructuredOutput};

use crate::roster::RosterEntry;

/// Confidence assumed for model events that don't report their own.
pub const MODEL_BASELINE_CONFIDENCE: f64 = 0.8;
/// Fallback events are distinctly less trustworthy: half the model baseline.
pub const FALLBACK_CONFIDENCE: f64 = MODEL_BASELINE_CONFIDENCE / 2.0;
/// Sources sometimes date childhood events a little before the recorded
/// birth year; anything earlier than this window is implausible.
pub const PRE_BIRTH_TOLERANCE_YEARS: i32 = 5;

/// Context window (chars each side) around a year mention used by the
/// heuristic scan for classification and place capture.
const HEURISTIC_WINDOW: usize = 140;

// ---------------------------------------------------------------------------
// CompletionModel — the extraction oracle seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Completion constrained to a JSON schema; returns the raw JSON text.
    async fn complete_with_schema(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<String>;
}

#[async_trait]
impl CompletionModel for LocalModel {
    async fn complete_with_schema(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<String> {
        LocalModel::complete_with_schema(self, system_prompt, user_prompt, schema_name, schema)
            .await
    }
}

// ---------------------------------------------------------------------------
// Model response shape
// ---------------------------------------------------------------------------

/// What the model returns for each extracted event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawEvent {
    /// Single year as an integer, or a `"start-end"` range string.
    pub year: serde_json::Value,
    /// "exact", "approximate", or "range"
    #[serde(default)]
    pub year_confidence: Option<String>,
    /// One of: birth, education, position, publication, travel, death, other
    pub event_type: String,
    pub description: String,
    /// Specific place name mentioned for the event, if any
    #[serde(default)]
    pub place_name: Option<String>,
    /// Model's own confidence in the event, 0.0-1.0
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// The full extraction response for one paragraph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are an expert historian extracting dated life events from biographical text.

Extract every dated event in the paragraph: birth, education, career positions, publications, travel and relocations, death. For each event provide:
- year: an integer, or a "start-end" string when the text only supports a range
- year_confidence: "exact", "approximate", or "range"
- event_type: one of "birth", "education", "position", "publication", "travel", "death", "other"
- description: one sentence describing the event
- place_name: the specific place mentioned for the event (city or institution location), or null
- confidence: 0.0-1.0 based on how clearly the text supports the event

Only report events stated in the text. Do not invent dates. Return a JSON object with an "events" array and nothing else."#;

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct Extractor<'a, M: CompletionModel> {
    model: &'a M,
}

impl<'a, M: CompletionModel> Extractor<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }

    /// Extract the ordered event sequence for one entity from its narrative
    /// paragraphs. Never fails: paragraphs that defeat both the model and
    /// the heuristic scan simply contribute nothing.
    pub async fn extract_events(
        &self,
        entry: &RosterEntry,
        paragraphs: &[String],
    ) -> Vec<TimelineEvent> {
        let mut events = Vec::new();

        for paragraph in paragraphs {
            let extracted = match self.extract_paragraph(entry, paragraph).await {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(
                        entity = %entry.id,
                        error = %e,
                        "Malformed extraction output, using heuristic scan"
                    );
                    heuristic_scan(paragraph)
                }
            };
            if extracted.is_empty() {
                debug!(entity = %entry.id, "No events found in paragraph");
            }
            events.extend(extracted);
        }

        let before = events.len();
        events.retain(|event| {
            let plausible = is_plausible(event, entry.birth_year, entry.death_year);
            if !plausible {
                debug!(
                    entity = %entry.id,
                    year = event.year.start(),
                    "Discarding event outside plausible lifespan"
                );
            }
            plausible
        });
        let implausible = before - events.len();

        let events = merge_duplicates(events);
        info!(
            entity = %entry.id,
            count = events.len(),
            implausible_discarded = implausible,
            "Extracted timeline events"
        );
        events
    }

    async fn extract_paragraph(
        &self,
        entry: &RosterEntry,
        paragraph: &str,
    ) -> Result<Vec<TimelineEvent>> {
        let user_prompt = format!(
            "Extract dated life events for {} ({}-{}) from this paragraph:\n\n{}",
            entry.name, entry.birth_year, entry.death_year, paragraph
        );

        let content = self
            .model
            .complete_with_schema(
                EXTRACTION_SYSTEM_PROMPT,
                &user_prompt,
                "ExtractionResponse",
                ExtractionResponse::output_schema(),
            )
            .await?;

        parse_structured(&content, paragraph)
    }
}

// ---------------------------------------------------------------------------
// Structured parsing
// ---------------------------------------------------------------------------

/// Parse model output into events. Tolerates markdown code fences and prose
/// wrapped around the JSON; anything beyond that is malformed output.
pub fn parse_structured(content: &str, source_text: &str) -> Result<Vec<TimelineEvent>> {
    let cleaned = strip_code_fences(content);

    let raw_events: Vec<RawEvent> =
        if let Ok(response) = serde_json::from_str::<ExtractionResponse>(cleaned) {
            response.events
        } else if let Ok(events) = serde_json::from_str::<Vec<RawEvent>>(cleaned) {
            events
        } else if let Some(events) = recover_from_mixed_output(cleaned) {
            events
        } else {
            return Err(anyhow!("model output is not an event list"));
        };

    Ok(raw_events
        .into_iter()
        .filter_map(|raw| normalize_raw(raw, source_text))
        .collect())
}

fn strip_code_fences(content: &str) -> &str {
    let mut s = content.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Pull the first JSON array or `{"events": ...}` object out of output that
/// mixes prose with JSON.
fn recover_from_mixed_output(content: &str) -> Option<Vec<RawEvent>> {
    static ARRAY_RE: OnceLock<Regex> = OnceLock::new();
    let re = ARRAY_RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").expect("static regex"));

    let candidate = re.find(content)?.as_str();
    serde_json::from_str(candidate).ok()
}

fn normalize_raw(raw: RawEvent, source_text: &str) -> Option<TimelineEvent> {
    let year = parse_year(&raw.year)?;

    let description = raw.description.trim().to_string();
    if description.len() < 10 {
        return None;
    }

    let year_confidence = match raw.year_confidence.as_deref() {
        Some("exact") => YearConfidence::Exact,
        Some("approximate") => YearConfidence::Approximate,
        Some("range") => YearConfidence::Range,
        _ => match year {
            EventYear::Year(_) => YearConfidence::Exact,
            EventYear::Span { .. } => YearConfidence::Range,
        },
    };

    let category = match raw.event_type.as_str() {
        "birth" => EventCategory::Birth,
        "education" => EventCategory::Education,
        "position" => EventCategory::Position,
        "publication" => EventCategory::Publication,
        "travel" => EventCategory::Travel,
        "death" => EventCategory::Death,
        "other" => EventCategory::Other,
        unknown => {
            warn!(event_type = unknown, "Unknown event category, keeping as other");
            EventCategory::Other
        }
    };

    let location = raw
        .place_name
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case("null"))
        .map(|place| EventLocation {
            place_name: place.to_string(),
            coordinate: None,
            confidence: 0.0,
        });

    Some(TimelineEvent {
        year,
        year_confidence,
        category,
        description,
        source_text: truncate(source_text, 200),
        location,
        confidence: raw
            .confidence
            .unwrap_or(MODEL_BASELINE_CONFIDENCE)
            .clamp(0.0, 1.0),
    })
}

fn parse_year(value: &serde_json::Value) -> Option<EventYear> {
    match value {
        serde_json::Value::Number(n) => {
            let y = i32::try_from(n.as_i64()?).ok()?;
            Some(EventYear::Year(y))
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(y) = s.parse::<i32>() {
                return Some(EventYear::Year(y));
            }
            let (start, end) = s.split_once('-')?;
            let start: i32 = start.trim().parse().ok()?;
            let end: i32 = end.trim().parse().ok()?;
            if start > end {
                return None;
            }
            Some(EventYear::Span { start, end })
        }
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ---------------------------------------------------------------------------
// Heuristic fallback
// ---------------------------------------------------------------------------

/// Category keywords in priority order. A window matching more than one set
/// gets the earlier category: "joined the Academy" beats the "moved" that
/// usually appears in the same sentence.
const CATEGORY_KEYWORDS: &[(EventCategory, &[&str])] = &[
    (EventCategory::Birth, &["born", "birth"]),
    (EventCategory::Death, &["died", "death"]),
    (
        EventCategory::Education,
        &["studied", "educated", "attended", "graduated", "enrolled", "university"],
    ),
    (
        EventCategory::Position,
        &["professor", "appointed", "became", "joined", "join", "academy", "elected", "chair"],
    ),
    (
        EventCategory::Publication,
        &["published", "wrote", "treatise", "memoir", "paper"],
    ),
    (
        EventCategory::Travel,
        &["moved", "traveled", "travelled", "went", "journey", "emigrated"],
    ),
];

/// Deterministic pattern scan used when structured parsing fails: find
/// four-digit years and classify the text around each one.
pub fn heuristic_scan(paragraph: &str) -> Vec<TimelineEvent> {
    static YEAR_RE: OnceLock<Regex> = OnceLock::new();
    let year_re = YEAR_RE.get_or_init(|| Regex::new(r"\b[12]\d{3}\b").expect("static regex"));

    let mut seen_years = Vec::new();
    let mut events = Vec::new();

    for m in year_re.find_iter(paragraph) {
        let year: i32 = match m.as_str().parse() {
            Ok(y) => y,
            Err(_) => continue,
        };
        if seen_years.contains(&year) {
            continue;
        }
        seen_years.push(year);

        let window = context_window(paragraph, m.start(), m.end());
        let category = classify_window(window);
        let location = capture_place(window).map(|place| EventLocation {
            place_name: place,
            coordinate: None,
            confidence: 0.0,
        });

        events.push(TimelineEvent {
            year: EventYear::Year(year),
            year_confidence: YearConfidence::Approximate,
            category,
            description: window.trim().to_string(),
            source_text: truncate(paragraph, 200),
            location,
            confidence: FALLBACK_CONFIDENCE,
        });
    }

    events
}

fn context_window(text: &str, match_start: usize, match_end: usize) -> &str {
    let mut start = match_start.saturating_sub(HEURISTIC_WINDOW);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (match_end + HEURISTIC_WINDOW).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

fn classify_window(window: &str) -> EventCategory {
    let lower = window.to_lowercase();
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return *category;
        }
    }
    EventCategory::Other
}

/// Capture a capitalized place name after a movement/location preposition.
/// Handles abbreviated prefixes like "St. Petersburg".
fn capture_place(window: &str) -> Option<String> {
    static PLACE_RE: OnceLock<Regex> = OnceLock::new();
    let re = PLACE_RE.get_or_init(|| {
        Regex::new(
            r"(?:moved to|went to|returned to|settled in|to|in|at)\s+((?:[A-Z][A-Za-zÀ-ÿ]*\.\s)?[A-Z][A-Za-zÀ-ÿ]+(?:\s[A-Z][A-Za-zÀ-ÿ]+)*)",
        )
        .expect("static regex")
    });

    let place = re.captures(window)?.get(1)?.as_str().trim().to_string();
    Some(place)
}

// ---------------------------------------------------------------------------
// Plausibility and dedup
// ---------------------------------------------------------------------------

fn is_plausible(event: &TimelineEvent, birth_year: i32, death_year: i32) -> bool {
    let y = event.year.start();
    y >= birth_year - PRE_BIRTH_TOLERANCE_YEARS && y <= death_year
}

/// Overlapping paragraphs report the same event with slightly different
/// dating. Same category within ±1 year merges, keeping the higher
/// confidence.
pub fn merge_duplicates(events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    let mut out: Vec<TimelineEvent> = Vec::new();
    for event in events {
        match out.iter_mut().find(|e| {
            e.category == event.category && (e.year.start() - event.year.start()).abs() <= 1
        }) {
            Some(existing) => {
                if event.confidence > existing.confidence {
                    *existing = event;
                }
            }
            None => out.push(event),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockModel;

    fn euler() -> RosterEntry {
        crate::roster::default_roster()
            .into_iter()
            .find(|e| e.id == "leonhard_euler")
            .unwrap()
    }

    const EULER_PARAGRAPH: &str =
        "In 1727, Euler moved to St. Petersburg to join the Academy of Sciences.";

    #[tokio::test]
    async fn malformed_output_falls_back_to_heuristic_scan() {
        let model = MockModel::always("I am sorry, I cannot produce JSON today.");
        let extractor = Extractor::new(&model);

        let events = extractor
            .extract_events(&euler(), &[EULER_PARAGRAPH.to_string()])
            .await;

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.year, EventYear::Year(1727));
        assert_eq!(event.category, EventCategory::Position);
        assert_eq!(
            event.location.as_ref().unwrap().place_name,
            "St. Petersburg"
        );
        assert!(event.confidence < MODEL_BASELINE_CONFIDENCE);
        assert_eq!(event.confidence, FALLBACK_CONFIDENCE);
        // No coordinate yet, and the zero-confidence invariant holds
        assert!(event.location.as_ref().unwrap().coordinate.is_none());
        assert_eq!(event.location.as_ref().unwrap().confidence, 0.0);
    }

    #[tokio::test]
    async fn model_transport_error_also_falls_back() {
        let model = MockModel::failing("connection refused");
        let extractor = Extractor::new(&model);

        let events = extractor
            .extract_events(&euler(), &[EULER_PARAGRAPH.to_string()])
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].confidence, FALLBACK_CONFIDENCE);
    }

    #[test]
    fn parse_structured_accepts_fenced_event_object() {
        let content = r#"```json
{"events": [{"year": 1741, "year_confidence": "exact", "event_type": "position",
  "description": "Accepted a post at the Berlin Academy", "place_name": "Berlin",
  "confidence": 0.9}]}
```"#;
        let events = parse_structured(content, "src").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].year, EventYear::Year(1741));
        assert_eq!(events[0].category, EventCategory::Position);
        assert_eq!(events[0].confidence, 0.9);
    }

    #[test]
    fn parse_structured_recovers_array_from_mixed_prose() {
        let content = r#"Here are the events you asked for:
[{"year": "1766-1767", "event_type": "travel",
  "description": "Returned to St. Petersburg at the invitation of Catherine II"}]
Hope this helps!"#;
        let events = parse_structured(content, "src").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].year,
            EventYear::Span {
                start: 1766,
                end: 1767
            }
        );
        assert_eq!(events[0].year_confidence, YearConfidence::Range);
        // Unreported confidence defaults to the model baseline
        assert_eq!(events[0].confidence, MODEL_BASELINE_CONFIDENCE);
    }

    #[test]
    fn parse_structured_rejects_non_json() {
        assert!(parse_structured("no events here", "src").is_err());
    }

    #[tokio::test]
    async fn implausible_years_are_discarded() {
        let model = MockModel::always(
            r#"{"events": [
                {"year": 1650, "event_type": "position", "description": "Impossible early event"},
                {"year": 1741, "event_type": "position", "description": "Moved to the Berlin Academy"}
            ]}"#,
        );
        let extractor = Extractor::new(&model);

        let events = extractor
            .extract_events(&euler(), &["one paragraph".to_string()])
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].year, EventYear::Year(1741));
    }

    #[test]
    fn pre_birth_tolerance_is_five_years() {
        let make = |year| TimelineEvent {
            year: EventYear::Year(year),
            year_confidence: YearConfidence::Exact,
            category: EventCategory::Other,
            description: "long enough description".to_string(),
            source_text: String::new(),
            location: None,
            confidence: 0.5,
        };
        assert!(is_plausible(&make(1702), 1707, 1783));
        assert!(!is_plausible(&make(1701), 1707, 1783));
        assert!(is_plausible(&make(1783), 1707, 1783));
        assert!(!is_plausible(&make(1784), 1707, 1783));
    }

    #[test]
    fn duplicate_events_keep_higher_confidence() {
        let make = |year, confidence| TimelineEvent {
            year: EventYear::Year(year),
            year_confidence: YearConfidence::Exact,
            category: EventCategory::Position,
            description: format!("event in {year}"),
            source_text: String::new(),
            location: None,
            confidence,
        };
        let merged = merge_duplicates(vec![make(1727, 0.6), make(1728, 0.9), make(1741, 0.7)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].confidence, 0.9);
        assert_eq!(merged[0].year, EventYear::Year(1728));
    }

    #[test]
    fn paragraph_without_years_yields_no_events() {
        assert!(heuristic_scan("Euler was prolific and widely admired.").is_empty());
    }

    #[test]
    fn heuristic_classifies_birth_sentences() {
        let events = heuristic_scan("Euler was born in 1707 in Basel, Switzerland.");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, EventCategory::Birth);
        assert_eq!(events[0].location.as_ref().unwrap().place_name, "Basel");
    }
}

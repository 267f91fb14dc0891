use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// --- Geo types ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    /// Reject values outside the valid lat/lng range. Model output sometimes
    /// swaps or invents coordinates; those must never reach the artifact.
    pub fn validate(lat: f64, lng: f64) -> Option<Self> {
        if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
            Some(Self { lat, lng })
        } else {
            None
        }
    }
}

/// Which resolution path produced a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    StructuredSource,
    Cache,
    HeuristicDefault,
    ModelGuess,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::StructuredSource => write!(f, "structured-source"),
            Provenance::Cache => write!(f, "cache"),
            Provenance::HeuristicDefault => write!(f, "heuristic-default"),
            Provenance::ModelGuess => write!(f, "model-guess"),
        }
    }
}

/// A de-duplicated place, keyed in the locations artifact by canonical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub place_name: String,
    pub coordinate: Coordinate,
    pub confidence: f64,
    pub provenance: Provenance,
    pub needs_verification: bool,
    pub alternative_names: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub historical_context: Option<String>,
}

// --- Timeline events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Birth,
    Education,
    Position,
    Publication,
    Travel,
    Death,
    Other,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventCategory::Birth => "birth",
            EventCategory::Education => "education",
            EventCategory::Position => "position",
            EventCategory::Publication => "publication",
            EventCategory::Travel => "travel",
            EventCategory::Death => "death",
            EventCategory::Other => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum YearConfidence {
    Exact,
    Approximate,
    Range,
}

/// A single year, or a span when the source is ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EventYear {
    Year(i32),
    Span { start: i32, end: i32 },
}

impl EventYear {
    /// Year used for sorting, plausibility checks, and temporal coverage.
    pub fn start(&self) -> i32 {
        match self {
            EventYear::Year(y) => *y,
            EventYear::Span { start, .. } => *start,
        }
    }

    pub fn end(&self) -> i32 {
        match self {
            EventYear::Year(y) => *y,
            EventYear::Span { end, .. } => *end,
        }
    }
}

/// A place reference on an event. The coordinate is populated by the
/// geocoder; absent coordinate means "omit from spatial display", never
/// (0,0). Invariant: `confidence == 0.0` implies `coordinate.is_none()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLocation {
    pub place_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub coordinate: Option<Coordinate>,
    pub confidence: f64,
}

/// One dated occurrence in an entity's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub year: EventYear,
    pub year_confidence: YearConfidence,
    pub category: EventCategory,
    pub description: String,
    /// Back-reference to the source paragraph, for auditability.
    pub source_text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub location: Option<EventLocation>,
    /// How much the extraction engine trusts this event, independent of
    /// location confidence.
    pub confidence: f64,
}

// --- Entity records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PopularityTier {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl std::fmt::Display for PopularityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PopularityTier::VeryHigh => "very_high",
            PopularityTier::High => "high",
            PopularityTier::Medium => "medium",
            PopularityTier::Low => "low",
            PopularityTier::VeryLow => "very_low",
        };
        write!(f, "{s}")
    }
}

/// One historical person, finalized and frozen when written to the
/// entities artifact. No per-run timestamps here: untouched entities must
/// serialize byte-identically across retry runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    pub birth_year: i32,
    pub death_year: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub structured_source_id: Option<String>,
    pub popularity_score: f64,
    pub popularity_tier: PopularityTier,
    pub fields: BTreeSet<String>,
    pub nationality: String,
    pub timeline_events: Vec<TimelineEvent>,
}

// --- Source adapter outputs ---

/// Per-step fetch result. The merger pattern-matches on this instead of
/// catching errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome<T> {
    Found { data: T },
    NotFound,
    Failed { reason: String },
}

impl<T> SourceOutcome<T> {
    pub fn found(data: T) -> Self {
        SourceOutcome::Found { data }
    }

    pub fn as_found(&self) -> Option<&T> {
        match self {
            SourceOutcome::Found { data } => Some(data),
            _ => None,
        }
    }

    pub fn into_found(self) -> Option<T> {
        match self {
            SourceOutcome::Found { data } => Some(data),
            _ => None,
        }
    }
}

/// Structured facts for one entity from the knowledge-graph source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFacts {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub birth_year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub death_year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub birth_place: Option<NamedCoordinate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub death_place: Option<NamedCoordinate>,
    pub institutions: Vec<String>,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCoordinate {
    pub name: String,
    pub coordinate: Coordinate,
}

/// Biography prose for one entity from the narrative source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub paragraphs: Vec<String>,
    pub source_url: String,
}

// --- Pipeline steps and per-entity status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    IngestStructured,
    IngestNarrative,
    ExtractEvents,
    ResolveLocations,
    MergeAndValidate,
    EmitArtifacts,
}

impl PipelineStep {
    /// Fixed execution order.
    pub const ALL: [PipelineStep; 6] = [
        PipelineStep::IngestStructured,
        PipelineStep::IngestNarrative,
        PipelineStep::ExtractEvents,
        PipelineStep::ResolveLocations,
        PipelineStep::MergeAndValidate,
        PipelineStep::EmitArtifacts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineStep::IngestStructured => "ingest_structured",
            PipelineStep::IngestNarrative => "ingest_narrative",
            PipelineStep::ExtractEvents => "extract_events",
            PipelineStep::ResolveLocations => "resolve_locations",
            PipelineStep::MergeAndValidate => "merge_and_validate",
            PipelineStep::EmitArtifacts => "emit_artifacts",
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for PipelineStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStep::ALL
            .into_iter()
            .find(|step| step.name() == s)
            .ok_or_else(|| format!("unknown step: {s}"))
    }
}

/// Last recorded outcome for an entity, persisted in the status registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Completed,
    Failed { step: PipelineStep, reason: String },
}

// --- Summary artifact ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub dataset_info: DatasetInfo,
    pub event_category_distribution: BTreeMap<String, u32>,
    pub popularity_distribution: BTreeMap<String, u32>,
    pub temporal_coverage: TemporalCoverage,
    pub avg_events_per_entity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub total_entities: u32,
    pub total_timeline_events: u32,
    pub total_unique_locations: u32,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemporalCoverage {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub earliest_year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latest_year: Option<i32>,
    pub distinct_years: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_year_serializes_untagged() {
        let single = serde_json::to_value(EventYear::Year(1727)).unwrap();
        assert_eq!(single, serde_json::json!(1727));

        let span = serde_json::to_value(EventYear::Span {
            start: 1727,
            end: 1730,
        })
        .unwrap();
        assert_eq!(span, serde_json::json!({"start": 1727, "end": 1730}));
    }

    #[test]
    fn absent_coordinate_is_omitted_from_json() {
        let loc = EventLocation {
            place_name: "Basel".to_string(),
            coordinate: None,
            confidence: 0.0,
        };
        let json = serde_json::to_value(&loc).unwrap();
        assert!(json.get("coordinate").is_none());
    }

    #[test]
    fn location_record_context_is_optional() {
        let record = LocationRecord {
            place_name: "Basel".to_string(),
            coordinate: Coordinate {
                lat: 47.55,
                lng: 7.58,
            },
            confidence: 1.0,
            provenance: Provenance::StructuredSource,
            needs_verification: false,
            alternative_names: BTreeSet::new(),
            historical_context: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("historical_context").is_none());
        let back: LocationRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn provenance_uses_kebab_case_tags() {
        let json = serde_json::to_value(Provenance::HeuristicDefault).unwrap();
        assert_eq!(json, serde_json::json!("heuristic-default"));
        assert_eq!(Provenance::ModelGuess.to_string(), "model-guess");
    }

    #[test]
    fn step_round_trips_through_name() {
        for step in PipelineStep::ALL {
            assert_eq!(step.name().parse::<PipelineStep>().unwrap(), step);
        }
        assert!("bogus".parse::<PipelineStep>().is_err());
    }

    #[test]
    fn coordinate_validation_rejects_out_of_range() {
        assert!(Coordinate::validate(47.55, 7.58).is_some());
        assert!(Coordinate::validate(91.0, 0.0).is_none());
        assert!(Coordinate::validate(0.0, -181.0).is_none());
    }
}

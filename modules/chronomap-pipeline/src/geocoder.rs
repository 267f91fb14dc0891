//! Place-name resolution with a durable cache.
//!
//! Resolution chain per place: cache hit, then a model guess, then a
//! nationality-keyed default capital. Structured-source coordinates are
//! seeded into the cache up front and always win. A place that defeats the
//! whole chain stays uncoordinated; there is no (0, 0) sentinel anywhere.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use chronomap_common::{Config, Coordinate, LocationRecord, Provenance, TimelineEvent};
use lm_client::StructuredOutput;

use crate::cache::CacheStore;
use crate::extractor::CompletionModel;
use crate::roster::RosterEntry;

/// Coordinates taken straight from the structured source.
pub const STRUCTURED_CONFIDENCE: f64 = 1.0;
/// Cap on model-guessed coordinates regardless of self-reported confidence.
pub const MODEL_GUESS_MAX_CONFIDENCE: f64 = 0.8;
/// Nationality-capital fallback: a placed dot, barely better than nothing.
pub const DEFAULT_CONFIDENCE: f64 = 0.3;

const CACHE_NAME: &str = "location_cache";

/// Default capital coordinates keyed by a nationality substring, checked in
/// order. Covers the nationalities in the built-in roster plus common
/// neighbors.
const DEFAULT_CAPITALS: &[(&str, &str, f64, f64)] = &[
    ("swiss", "Bern", 46.9480, 7.4474),
    ("french", "Paris", 48.8566, 2.3522),
    ("german", "Berlin", 52.5200, 13.4050),
    ("italian", "Rome", 41.9028, 12.4964),
    ("russian", "Moscow", 55.7558, 37.6173),
    ("english", "London", 51.5074, -0.1278),
    ("british", "London", 51.5074, -0.1278),
    ("dutch", "Amsterdam", 52.3676, 4.9041),
    ("austrian", "Vienna", 48.2082, 16.3738),
];

const GEOCODE_SYSTEM_PROMPT: &str = r#"You are a historical geographer. Given a place name from a biographical text, return its coordinates.

The place may use a historical name or spelling. Prefer the location as it was known in the named era. Respond with:
- found: false if you cannot identify the place with reasonable certainty
- latitude and longitude in decimal degrees
- confidence: 0.0-1.0 in your identification
- alternative_names: other names or spellings the place is known by
- historical_context: one sentence on what the place was in the named era

Never guess coordinates for a place you do not recognize."#;

/// What the model returns for one place lookup.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GeocodeGuess {
    found: bool,
    latitude: f64,
    longitude: f64,
    confidence: f64,
    #[serde(default)]
    alternative_names: Vec<String>,
    #[serde(default)]
    historical_context: Option<String>,
}

/// A resolved place as attached to events. Cached hits report `Cache`
/// provenance here; the stored record keeps the provenance it was created
/// with.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub coordinate: Coordinate,
    pub confidence: f64,
    pub provenance: Provenance,
}

pub struct Geocoder<'a, M: CompletionModel> {
    model: &'a M,
    cache: CacheStore,
    /// Capital-fallback records from this run. Kept out of the durable
    /// cache (so a later run can upgrade them with a real guess) but still
    /// surfaced in the locations artifact.
    fallbacks: BTreeMap<String, LocationRecord>,
    delay: Duration,
}

impl<'a, M: CompletionModel> Geocoder<'a, M> {
    pub fn open(config: &Config, model: &'a M) -> Result<Self> {
        Ok(Self {
            model,
            cache: CacheStore::open(Path::new(&config.data_dir), CACHE_NAME)?,
            fallbacks: BTreeMap::new(),
            delay: Duration::from_millis(config.geocode_delay_ms),
        })
    }

    /// Seed a coordinate known from the structured source. Full confidence,
    /// no verification needed, and never displaced by later guesses.
    pub fn seed_structured(&mut self, place_name: &str, coordinate: Coordinate) -> Result<()> {
        self.upsert(LocationRecord {
            place_name: place_name.to_string(),
            coordinate,
            confidence: STRUCTURED_CONFIDENCE,
            provenance: Provenance::StructuredSource,
            needs_verification: false,
            alternative_names: BTreeSet::new(),
            historical_context: None,
        })
    }

    /// Resolve one place name. `region_hint` is the entity's nationality and
    /// era, used both to steer the model and to pick a default capital.
    pub async fn resolve(&mut self, place_name: &str, region_hint: &str) -> Result<Option<Resolved>> {
        let key = cache_key(place_name);

        if let Some(record) = self.cache.get_as::<LocationRecord>(&key) {
            debug!(place = place_name, "Location cache hit");
            return Ok(Some(Resolved {
                coordinate: record.coordinate,
                confidence: record.confidence,
                provenance: Provenance::Cache,
            }));
        }

        sleep(self.delay).await;
        if let Some(record) = self.model_guess(place_name, region_hint).await {
            let resolved = Resolved {
                coordinate: record.coordinate,
                confidence: record.confidence,
                provenance: Provenance::ModelGuess,
            };
            // Guesses are cached so one model lookup per place is enough.
            self.upsert(record)?;
            return Ok(Some(resolved));
        }

        // The default is deliberately not cached: the next run gets another
        // chance at a real guess. It still gets a location row for this run.
        if let Some((capital, coordinate)) = default_capital(region_hint) {
            info!(
                place = place_name,
                capital,
                "Geocoding fell back to nationality default"
            );
            self.fallbacks.entry(key).or_insert_with(|| LocationRecord {
                place_name: place_name.to_string(),
                coordinate,
                confidence: DEFAULT_CONFIDENCE,
                provenance: Provenance::HeuristicDefault,
                needs_verification: true,
                alternative_names: BTreeSet::new(),
                historical_context: Some(format!("defaulted to {capital}, {region_hint}")),
            });
            return Ok(Some(Resolved {
                coordinate,
                confidence: DEFAULT_CONFIDENCE,
                provenance: Provenance::HeuristicDefault,
            }));
        }

        warn!(place = place_name, "Could not resolve place");
        Ok(None)
    }

    /// Resolve the locations of every event that names a place. Events keep
    /// their place names even when resolution fails.
    pub async fn annotate_events(
        &mut self,
        entry: &RosterEntry,
        mut events: Vec<TimelineEvent>,
    ) -> Result<Vec<TimelineEvent>> {
        let region_hint = format!(
            "{} ({}-{})",
            entry.nationality, entry.birth_year, entry.death_year
        );

        for event in &mut events {
            let Some(location) = &mut event.location else {
                continue;
            };
            if let Some(resolved) = self.resolve(&location.place_name, &region_hint).await? {
                location.coordinate = Some(resolved.coordinate);
                location.confidence = resolved.confidence;
            }
        }
        Ok(events)
    }

    /// Location records for the locations artifact, keyed by canonical
    /// name: everything in the durable cache plus this run's capital
    /// fallbacks. Cache entries win on overlap; provenance is as recorded
    /// at creation time.
    pub fn records(&self) -> BTreeMap<String, LocationRecord> {
        let mut records = self.fallbacks.clone();
        records.extend(self.cache.entries_as::<LocationRecord>());
        records
    }

    async fn model_guess(&self, place_name: &str, region_hint: &str) -> Option<LocationRecord> {
        let user_prompt = format!("Place: {place_name}\nContext: {region_hint}");

        let content = match self
            .model
            .complete_with_schema(
                GEOCODE_SYSTEM_PROMPT,
                &user_prompt,
                "GeocodeGuess",
                GeocodeGuess::output_schema(),
            )
            .await
        {
            Ok(content) => content,
            Err(e) => {
                warn!(place = place_name, error = %e, "Model geocode call failed");
                return None;
            }
        };

        let guess: GeocodeGuess = match serde_json::from_str(content.trim()) {
            Ok(g) => g,
            Err(e) => {
                warn!(place = place_name, error = %e, "Malformed geocode output");
                return None;
            }
        };

        if !guess.found {
            return None;
        }
        // Null island is a failure sentinel in sloppy model output, never a
        // real answer for historical biography.
        if guess.latitude == 0.0 && guess.longitude == 0.0 {
            return None;
        }
        let coordinate = Coordinate::validate(guess.latitude, guess.longitude)?;

        Some(LocationRecord {
            place_name: place_name.to_string(),
            coordinate,
            confidence: guess.confidence.clamp(0.0, 1.0).min(MODEL_GUESS_MAX_CONFIDENCE),
            provenance: Provenance::ModelGuess,
            needs_verification: true,
            alternative_names: guess
                .alternative_names
                .into_iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
            historical_context: guess
                .historical_context
                .filter(|c| !c.trim().is_empty())
                .or_else(|| Some(region_hint.to_string())),
        })
    }

    /// Insert a record unless a higher-confidence one is already stored.
    /// Displaced spellings survive as alternative names.
    fn upsert(&mut self, mut record: LocationRecord) -> Result<()> {
        let key = cache_key(&record.place_name);
        if let Some(existing) = self.cache.get_as::<LocationRecord>(&key) {
            if existing.confidence > record.confidence {
                return Ok(());
            }
            record.alternative_names.extend(existing.alternative_names);
            if existing.place_name != record.place_name {
                record.alternative_names.insert(existing.place_name);
            }
        }
        self.cache.put_as(&key, &record)
    }
}

/// Canonical cache key: lowercased, punctuation stripped, whitespace
/// collapsed. "St. Petersburg" and "St Petersburg" share one entry.
fn cache_key(place_name: &str) -> String {
    place_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn default_capital(region_hint: &str) -> Option<(&'static str, Coordinate)> {
    let hint = region_hint.to_lowercase();
    DEFAULT_CAPITALS
        .iter()
        .find(|(nationality, _, _, _)| hint.contains(nationality))
        .and_then(|(_, capital, lat, lng)| {
            Coordinate::validate(*lat, *lng).map(|c| (*capital, c))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockModel;

    fn test_config(dir: &Path) -> Config {
        Config {
            model_base_url: String::new(),
            model_name: String::new(),
            structured_endpoint: String::new(),
            pageview_endpoint: String::new(),
            structured_delay_ms: 0,
            narrative_delay_ms: 0,
            popularity_delay_ms: 0,
            geocode_delay_ms: 0,
            max_attempts: 1,
            data_dir: dir.display().to_string(),
            roster_file: None,
        }
    }

    const BASEL_GUESS: &str =
        r#"{"found": true, "latitude": 47.5596, "longitude": 7.5886, "confidence": 0.9}"#;

    #[tokio::test]
    async fn structured_seed_wins_and_reports_cache_on_hit() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::failing("should not be called");
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        geocoder
            .seed_structured("Basel", Coordinate { lat: 47.5596, lng: 7.5886 })
            .unwrap();

        let resolved = geocoder.resolve("Basel", "Swiss (1707-1783)").await.unwrap().unwrap();
        assert_eq!(resolved.provenance, Provenance::Cache);
        assert_eq!(resolved.confidence, STRUCTURED_CONFIDENCE);
        assert_eq!(model.call_count(), 0);

        // Stored record keeps its original provenance
        let records = geocoder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records["basel"].provenance, Provenance::StructuredSource);
    }

    #[tokio::test]
    async fn model_guess_is_cached_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::always(
            r#"{"found": true, "latitude": 59.9343, "longitude": 30.3351, "confidence": 0.95}"#,
        );
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        let first = geocoder
            .resolve("St. Petersburg", "Swiss (1707-1783)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.provenance, Provenance::ModelGuess);
        assert_eq!(first.confidence, MODEL_GUESS_MAX_CONFIDENCE);

        let second = geocoder
            .resolve("St. Petersburg", "Swiss (1707-1783)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.provenance, Provenance::Cache);
        assert_eq!(model.call_count(), 1);

        let records = geocoder.records();
        assert_eq!(records.len(), 1);
        assert!(records["st petersburg"].needs_verification);
    }

    #[tokio::test]
    async fn failed_model_falls_back_to_capital_without_caching() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::failing("connection refused");
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        let resolved = geocoder
            .resolve("Riehen", "Swiss (1707-1783)")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.provenance, Provenance::HeuristicDefault);
        assert_eq!(resolved.confidence, DEFAULT_CONFIDENCE);

        // The fallback still gets a location row for the artifact
        let records = geocoder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records["riehen"].provenance, Provenance::HeuristicDefault);
        assert!(records["riehen"].needs_verification);

        // Not durably cached: the model gets another chance next time
        let _ = geocoder.resolve("Riehen", "Swiss (1707-1783)").await.unwrap();
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn fallback_row_is_displaced_by_a_later_guess() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::scripted(vec![
            "not json at all".to_string(),
            BASEL_GUESS.to_string(),
        ]);
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        let first = geocoder.resolve("Riehen", "Swiss (1707-1783)").await.unwrap().unwrap();
        assert_eq!(first.provenance, Provenance::HeuristicDefault);

        let second = geocoder.resolve("Riehen", "Swiss (1707-1783)").await.unwrap().unwrap();
        assert_eq!(second.provenance, Provenance::ModelGuess);

        // The cached guess wins over the run's fallback row
        let records = geocoder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records["riehen"].provenance, Provenance::ModelGuess);
    }

    #[tokio::test]
    async fn unknown_place_and_nationality_resolves_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::always(
            r#"{"found": false, "latitude": 0.0, "longitude": 0.0, "confidence": 0.0}"#,
        );
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        let resolved = geocoder.resolve("Atlantis", "Martian (1-100)").await.unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn null_island_guess_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::always(
            r#"{"found": true, "latitude": 0.0, "longitude": 0.0, "confidence": 0.9}"#,
        );
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        let resolved = geocoder
            .resolve("Nowhere", "Swiss (1707-1783)")
            .await
            .unwrap()
            .unwrap();
        // Falls through to the capital default instead
        assert_eq!(resolved.provenance, Provenance::HeuristicDefault);
    }

    #[tokio::test]
    async fn upsert_never_downgrades() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::always(BASEL_GUESS);
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        geocoder
            .seed_structured("Basel", Coordinate { lat: 47.5596, lng: 7.5886 })
            .unwrap();
        geocoder
            .upsert(LocationRecord {
                place_name: "Basel".to_string(),
                coordinate: Coordinate { lat: 1.0, lng: 1.0 },
                confidence: 0.5,
                provenance: Provenance::ModelGuess,
                needs_verification: true,
                alternative_names: BTreeSet::new(),
                historical_context: None,
            })
            .unwrap();

        let records = geocoder.records();
        assert_eq!(records["basel"].confidence, STRUCTURED_CONFIDENCE);
        assert_eq!(records["basel"].provenance, Provenance::StructuredSource);
    }

    #[tokio::test]
    async fn guess_carries_alternative_names_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::always(
            r#"{"found": true, "latitude": 59.9343, "longitude": 30.3351, "confidence": 0.9,
                "alternative_names": ["Petrograd", "Leningrad", " "],
                "historical_context": "Imperial Russian capital under Peter the Great."}"#,
        );
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        geocoder
            .resolve("St. Petersburg", "Swiss (1707-1783)")
            .await
            .unwrap()
            .unwrap();

        let records = geocoder.records();
        let record = &records["st petersburg"];
        assert!(record.alternative_names.contains("Petrograd"));
        assert!(record.alternative_names.contains("Leningrad"));
        assert_eq!(record.alternative_names.len(), 2);
        assert_eq!(
            record.historical_context.as_deref(),
            Some("Imperial Russian capital under Peter the Great.")
        );
    }

    #[tokio::test]
    async fn guess_without_context_falls_back_to_region_hint() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::always(BASEL_GUESS);
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        geocoder.resolve("Basel", "Swiss (1707-1783)").await.unwrap().unwrap();

        let records = geocoder.records();
        assert_eq!(
            records["basel"].historical_context.as_deref(),
            Some("Swiss (1707-1783)")
        );
    }

    #[test]
    fn cache_key_is_spelling_insensitive() {
        assert_eq!(cache_key("St. Petersburg"), "st petersburg");
        assert_eq!(cache_key("st  petersburg"), "st petersburg");
        assert_eq!(cache_key("BASEL"), "basel");
    }

    #[tokio::test]
    async fn annotate_events_fills_coordinates() {
        use chronomap_common::{EventCategory, EventLocation, EventYear, YearConfidence};

        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::always(BASEL_GUESS);
        let mut geocoder = Geocoder::open(&test_config(dir.path()), &model).unwrap();

        let euler = crate::roster::default_roster()
            .into_iter()
            .find(|e| e.id == "leonhard_euler")
            .unwrap();
        let events = vec![TimelineEvent {
            year: EventYear::Year(1707),
            year_confidence: YearConfidence::Exact,
            category: EventCategory::Birth,
            description: "Born in Basel".to_string(),
            source_text: String::new(),
            location: Some(EventLocation {
                place_name: "Basel".to_string(),
                coordinate: None,
                confidence: 0.0,
            }),
            confidence: 0.8,
        }];

        let annotated = geocoder.annotate_events(&euler, events).await.unwrap();
        let location = annotated[0].location.as_ref().unwrap();
        assert!(location.coordinate.is_some());
        assert!(location.confidence > 0.0);
    }
}

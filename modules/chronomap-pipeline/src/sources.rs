//! Source adapters: structured facts from a knowledge-graph SPARQL endpoint
//! and narrative prose plus a popularity metric from an encyclopedia service.
//!
//! Both adapters apply a minimum inter-request delay and classify failures:
//! 404 is `NotFound` (permanent, no retry); timeouts and 5xx are transient
//! and retried with exponential backoff, then surfaced as `Failed` so the
//! orchestrator can mark the entity degraded instead of aborting the run.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use chronomap_common::{Config, Coordinate, NamedCoordinate, Narrative, SourceOutcome, StructuredFacts};

use crate::roster::{article_title, RosterEntry};

const USER_AGENT: &str = "chronomap/0.1 (historical biography pipeline)";

/// Base backoff for transient failures. Actual delay is base * 2^attempt.
const RETRY_BASE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StructuredSource: Send + Sync {
    /// Fetch birth/death facts, known place coordinates, and institutions.
    async fn fetch_structured(&self, entry: &RosterEntry) -> SourceOutcome<StructuredFacts>;
}

#[async_trait]
pub trait NarrativeSource: Send + Sync {
    /// Fetch biography prose paragraphs plus the canonical source URL.
    async fn fetch_narrative(&self, entry: &RosterEntry) -> SourceOutcome<Narrative>;

    /// Fetch the external popularity metric (average daily article views).
    async fn fetch_popularity(&self, entry: &RosterEntry) -> SourceOutcome<f64>;
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("resource not found")]
    NotFound,
    #[error("{0}")]
    Transient(String),
}

/// One GET returning JSON, classified. 404 and other permanent 4xx map to
/// `NotFound`; 429, 5xx, and transport errors are transient.
async fn get_json(
    http: &reqwest::Client,
    url: &str,
    query: &[(&str, &str)],
) -> Result<serde_json::Value, FetchError> {
    let response = http
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| FetchError::Transient(e.to_string()))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(FetchError::Transient(format!("{url} returned {status}")));
    }
    if !status.is_success() {
        // Remaining 4xx: the request itself is wrong, retrying won't help
        return Err(FetchError::NotFound);
    }

    response
        .json()
        .await
        .map_err(|e| FetchError::Transient(e.to_string()))
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE * 2u32.pow(attempt)
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_default()
}

/// Decode `%XX` escapes in article titles taken from URLs.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Knowledge-graph (SPARQL) structured source
// ---------------------------------------------------------------------------

pub struct SparqlStructuredSource {
    http: reqwest::Client,
    endpoint: String,
    delay: Duration,
    max_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<std::collections::BTreeMap<String, SparqlValue>>,
}

#[derive(Debug, Deserialize)]
struct SparqlValue {
    value: String,
}

impl SparqlStructuredSource {
    pub fn new(config: &Config) -> Self {
        Self {
            http: http_client(),
            endpoint: config.structured_endpoint.clone(),
            delay: Duration::from_millis(config.structured_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    fn query_for(structured_id: &str) -> String {
        format!(
            "SELECT ?birthDate ?deathDate ?birthPlaceLabel ?birthCoord \
             ?deathPlaceLabel ?deathCoord ?institutionLabel WHERE {{\n\
               OPTIONAL {{ wd:{id} wdt:P569 ?birthDate. }}\n\
               OPTIONAL {{ wd:{id} wdt:P570 ?deathDate. }}\n\
               OPTIONAL {{ wd:{id} wdt:P19 ?birthPlace. ?birthPlace wdt:P625 ?birthCoord. }}\n\
               OPTIONAL {{ wd:{id} wdt:P20 ?deathPlace. ?deathPlace wdt:P625 ?deathCoord. }}\n\
               OPTIONAL {{ wd:{id} wdt:P69 ?institution. }}\n\
               SERVICE wikibase:label {{ bd:serviceParam wikibase:language \"en\". }}\n\
             }}",
            id = structured_id
        )
    }

    fn facts_from(response: SparqlResponse, structured_id: &str) -> Option<StructuredFacts> {
        let mut facts = StructuredFacts {
            source_id: structured_id.to_string(),
            ..Default::default()
        };
        let mut institutions = BTreeSet::new();

        for binding in &response.results.bindings {
            let text = |key: &str| binding.get(key).map(|v| v.value.as_str());

            if facts.birth_year.is_none() {
                facts.birth_year = text("birthDate").and_then(year_prefix);
            }
            if facts.death_year.is_none() {
                facts.death_year = text("deathDate").and_then(year_prefix);
            }
            if facts.birth_place.is_none() {
                facts.birth_place = named_coordinate(text("birthPlaceLabel"), text("birthCoord"));
            }
            if facts.death_place.is_none() {
                facts.death_place = named_coordinate(text("deathPlaceLabel"), text("deathCoord"));
            }
            if let Some(name) = text("institutionLabel") {
                if !name.is_empty() {
                    institutions.insert(name.to_string());
                }
            }
        }

        facts.institutions = institutions.into_iter().collect();

        // An entity the graph knows nothing about comes back as one empty
        // binding, not an HTTP error.
        if facts.birth_year.is_none() && facts.death_year.is_none() {
            return None;
        }
        Some(facts)
    }
}

fn year_prefix(date: &str) -> Option<i32> {
    date.get(..4).and_then(|y| y.parse().ok())
}

fn named_coordinate(name: Option<&str>, wkt: Option<&str>) -> Option<NamedCoordinate> {
    let name = name?.trim();
    if name.is_empty() {
        return None;
    }
    Some(NamedCoordinate {
        name: name.to_string(),
        coordinate: parse_wkt_point(wkt?)?,
    })
}

/// Parse a WKT `Point(lng lat)` literal.
fn parse_wkt_point(wkt: &str) -> Option<Coordinate> {
    let inner = wkt.strip_prefix("Point(")?.strip_suffix(')')?;
    let mut parts = inner.split_whitespace();
    let lng: f64 = parts.next()?.parse().ok()?;
    let lat: f64 = parts.next()?.parse().ok()?;
    Coordinate::validate(lat, lng)
}

#[async_trait]
impl StructuredSource for SparqlStructuredSource {
    async fn fetch_structured(&self, entry: &RosterEntry) -> SourceOutcome<StructuredFacts> {
        let Some(structured_id) = entry.structured_id.as_deref() else {
            return SourceOutcome::NotFound;
        };

        let query = Self::query_for(structured_id);

        for attempt in 0..self.max_attempts {
            sleep(self.delay).await;

            let result = get_json(
                &self.http,
                &self.endpoint,
                &[("query", query.as_str()), ("format", "json")],
            )
            .await;

            match result {
                Ok(value) => {
                    let response: SparqlResponse = match serde_json::from_value(value) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(entity = %entry.id, error = %e, "Malformed SPARQL response");
                            return SourceOutcome::Failed {
                                reason: format!("malformed SPARQL response: {e}"),
                            };
                        }
                    };
                    return match Self::facts_from(response, structured_id) {
                        Some(facts) => SourceOutcome::found(facts),
                        None => SourceOutcome::NotFound,
                    };
                }
                Err(FetchError::NotFound) => return SourceOutcome::NotFound,
                Err(FetchError::Transient(reason)) => {
                    if attempt + 1 < self.max_attempts {
                        let wait = backoff(attempt);
                        warn!(
                            entity = %entry.id,
                            attempt,
                            wait_secs = wait.as_secs(),
                            reason = %reason,
                            "Transient structured-source failure, backing off"
                        );
                        sleep(wait).await;
                    } else {
                        return SourceOutcome::Failed { reason };
                    }
                }
            }
        }
        SourceOutcome::Failed {
            reason: "retry budget exhausted".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Encyclopedia narrative + popularity source
// ---------------------------------------------------------------------------

pub struct WikiNarrativeSource {
    http: reqwest::Client,
    pageview_endpoint: String,
    narrative_delay: Duration,
    popularity_delay: Duration,
    max_attempts: u32,
}

/// Substantial-paragraph filter: skip headings and stubs.
const MIN_PARAGRAPH_CHARS: usize = 50;
const MAX_PARAGRAPHS: usize = 5;

/// Popularity window in days.
const PAGEVIEW_WINDOW_DAYS: i64 = 90;

impl WikiNarrativeSource {
    pub fn new(config: &Config) -> Self {
        Self {
            http: http_client(),
            pageview_endpoint: config.pageview_endpoint.clone(),
            narrative_delay: Duration::from_millis(config.narrative_delay_ms),
            popularity_delay: Duration::from_millis(config.popularity_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// MediaWiki action API endpoint for the wiki hosting `narrative_url`.
    fn api_endpoint(narrative_url: &str) -> Option<String> {
        let idx = narrative_url.find("/wiki/")?;
        Some(format!("{}/w/api.php", &narrative_url[..idx]))
    }

    fn paragraphs_from(extract: &str) -> Vec<String> {
        extract
            .split('\n')
            .map(str::trim)
            .filter(|line| !line.starts_with("==") && line.len() >= MIN_PARAGRAPH_CHARS)
            .take(MAX_PARAGRAPHS)
            .map(str::to_string)
            .collect()
    }

    async fn fetch_with_retries(
        &self,
        entity_id: &str,
        delay: Duration,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, SourceOutcome<()>> {
        for attempt in 0..self.max_attempts {
            sleep(delay).await;

            match get_json(&self.http, url, query).await {
                Ok(value) => return Ok(value),
                Err(FetchError::NotFound) => return Err(SourceOutcome::NotFound),
                Err(FetchError::Transient(reason)) => {
                    if attempt + 1 < self.max_attempts {
                        let wait = backoff(attempt);
                        warn!(
                            entity = entity_id,
                            attempt,
                            wait_secs = wait.as_secs(),
                            reason = %reason,
                            "Transient narrative-source failure, backing off"
                        );
                        sleep(wait).await;
                    } else {
                        return Err(SourceOutcome::Failed { reason });
                    }
                }
            }
        }
        Err(SourceOutcome::Failed {
            reason: "retry budget exhausted".to_string(),
        })
    }
}

/// Map a unit outcome error into the caller's outcome type.
fn carry<T>(outcome: SourceOutcome<()>) -> SourceOutcome<T> {
    match outcome {
        SourceOutcome::NotFound => SourceOutcome::NotFound,
        SourceOutcome::Failed { reason } => SourceOutcome::Failed { reason },
        SourceOutcome::Found { .. } => unreachable!("carry is only used for errors"),
    }
}

#[async_trait]
impl NarrativeSource for WikiNarrativeSource {
    async fn fetch_narrative(&self, entry: &RosterEntry) -> SourceOutcome<Narrative> {
        let Some(api) = Self::api_endpoint(&entry.narrative_url) else {
            return SourceOutcome::Failed {
                reason: format!("unrecognized narrative URL: {}", entry.narrative_url),
            };
        };
        let title = percent_decode(article_title(&entry.narrative_url));

        let value = match self
            .fetch_with_retries(
                &entry.id,
                self.narrative_delay,
                &api,
                &[
                    ("action", "query"),
                    ("prop", "extracts"),
                    ("explaintext", "1"),
                    ("redirects", "1"),
                    ("format", "json"),
                    ("titles", title.as_str()),
                ],
            )
            .await
        {
            Ok(v) => v,
            Err(outcome) => return carry(outcome),
        };

        let Some(pages) = value["query"]["pages"].as_object() else {
            return SourceOutcome::Failed {
                reason: "narrative response missing query.pages".to_string(),
            };
        };
        let Some(page) = pages.values().next() else {
            return SourceOutcome::NotFound;
        };
        if page.get("missing").is_some() {
            return SourceOutcome::NotFound;
        }
        let Some(extract) = page["extract"].as_str() else {
            return SourceOutcome::NotFound;
        };

        let paragraphs = Self::paragraphs_from(extract);
        debug!(entity = %entry.id, count = paragraphs.len(), "Fetched narrative paragraphs");
        if paragraphs.is_empty() {
            return SourceOutcome::NotFound;
        }

        SourceOutcome::found(Narrative {
            paragraphs,
            source_url: entry.narrative_url.clone(),
        })
    }

    async fn fetch_popularity(&self, entry: &RosterEntry) -> SourceOutcome<f64> {
        let title = article_title(&entry.narrative_url);
        let end = Utc::now();
        let start = end - chrono::Duration::days(PAGEVIEW_WINDOW_DAYS);
        let url = format!(
            "{}/{}/daily/{}/{}",
            self.pageview_endpoint,
            title,
            start.format("%Y%m%d00"),
            end.format("%Y%m%d00"),
        );

        let value = match self
            .fetch_with_retries(&entry.id, self.popularity_delay, &url, &[])
            .await
        {
            Ok(v) => v,
            Err(outcome) => return carry(outcome),
        };

        let Some(items) = value["items"].as_array() else {
            return SourceOutcome::Failed {
                reason: "pageview response missing items".to_string(),
            };
        };
        if items.is_empty() {
            return SourceOutcome::NotFound;
        }

        let total: u64 = items
            .iter()
            .filter_map(|item| item["views"].as_u64())
            .sum();
        SourceOutcome::found(total as f64 / items.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wkt_point_parses_lng_lat_order() {
        let coord = parse_wkt_point("Point(7.5886 47.5596)").unwrap();
        assert!((coord.lat - 47.5596).abs() < 1e-9);
        assert!((coord.lng - 7.5886).abs() < 1e-9);
        assert!(parse_wkt_point("Point(7.5886)").is_none());
        assert!(parse_wkt_point("47.5596,7.5886").is_none());
    }

    #[test]
    fn wkt_point_rejects_out_of_range() {
        assert!(parse_wkt_point("Point(500.0 47.0)").is_none());
    }

    #[test]
    fn year_prefix_handles_iso_dates() {
        assert_eq!(year_prefix("1707-04-15T00:00:00Z"), Some(1707));
        assert_eq!(year_prefix("bad"), None);
    }

    #[test]
    fn paragraph_filter_drops_headings_and_stubs() {
        let extract = "Leonhard Euler was a Swiss polymath who founded graph theory \
                       and influenced every branch of mathematics.\n\
                       == Early life ==\n\
                       Short.\n\
                       Euler moved to St. Petersburg in 1727 to join the Imperial \
                       Academy of Sciences at the invitation of Catherine I.";
        let paragraphs = WikiNarrativeSource::paragraphs_from(extract);
        assert_eq!(paragraphs.len(), 2);
        assert!(paragraphs[1].contains("St. Petersburg"));
    }

    #[test]
    fn api_endpoint_is_derived_from_article_url() {
        assert_eq!(
            WikiNarrativeSource::api_endpoint("https://en.wikipedia.org/wiki/Leonhard_Euler"),
            Some("https://en.wikipedia.org/w/api.php".to_string())
        );
        assert!(WikiNarrativeSource::api_endpoint("https://example.com/euler").is_none());
    }

    #[test]
    fn percent_decode_handles_escapes() {
        assert_eq!(
            percent_decode("Jean_le_Rond_d%27Alembert"),
            "Jean_le_Rond_d'Alembert"
        );
        assert_eq!(percent_decode("Leonhard_Euler"), "Leonhard_Euler");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
    }
}

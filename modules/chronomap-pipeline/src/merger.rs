//! Merge per-entity source outputs into final records, validate them, rank
//! popularity tiers across the whole dataset, and compute summary stats.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::Utc;
use tracing::debug;

use chronomap_common::{
    ChronomapError, DatasetInfo, EntityRecord, PopularityTier, StructuredFacts, Summary,
    TemporalCoverage, TimelineEvent,
};

use crate::extractor::PRE_BIRTH_TOLERANCE_YEARS;
use crate::roster::RosterEntry;

/// Build the final record for one entity. Structured facts outrank the
/// roster for life dates; the roster fills whatever the source lacked.
/// The popularity tier is provisional until [`assign_tiers`] runs over the
/// whole dataset.
pub fn merge_entity(
    entry: &RosterEntry,
    facts: Option<&StructuredFacts>,
    source_url: Option<&str>,
    popularity_score: f64,
    mut events: Vec<TimelineEvent>,
) -> Result<EntityRecord, ChronomapError> {
    let birth_year = facts
        .and_then(|f| f.birth_year)
        .unwrap_or(entry.birth_year);
    let death_year = facts
        .and_then(|f| f.death_year)
        .unwrap_or(entry.death_year);

    if birth_year > death_year {
        return Err(ChronomapError::Validation(format!(
            "{}: birth year {birth_year} after death year {death_year}",
            entry.id
        )));
    }

    // Re-check plausibility against the merged dates, which may differ from
    // the roster dates the extractor saw.
    let before = events.len();
    events.retain(|event| {
        let y = event.year.start();
        y >= birth_year - PRE_BIRTH_TOLERANCE_YEARS && y <= death_year
    });
    if events.len() < before {
        debug!(
            entity = %entry.id,
            dropped = before - events.len(),
            "Dropped events implausible against merged life dates"
        );
    }

    events.sort_by_key(|event| (event.year.start(), event.year.end()));

    Ok(EntityRecord {
        id: entry.id.clone(),
        name: entry.name.clone(),
        birth_year,
        death_year,
        source_url: source_url.map(str::to_string),
        structured_source_id: facts
            .map(|f| f.source_id.clone())
            .or_else(|| entry.structured_id.clone()),
        popularity_score,
        popularity_tier: PopularityTier::VeryLow,
        fields: entry.fields.clone(),
        nationality: entry.nationality.clone(),
        timeline_events: events,
    })
}

/// Rank all records by popularity score (ties broken by id, ascending) and
/// assign tiers by integer percentile cutoff: top 10% very_high, next 15%
/// high, next 25% medium, next 25% low, rest very_low.
pub fn assign_tiers(records: &mut [EntityRecord]) {
    let n = records.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        records[b]
            .popularity_score
            .partial_cmp(&records[a].popularity_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| records[a].id.cmp(&records[b].id))
    });

    let c1 = n * 10 / 100;
    let c2 = n * 25 / 100;
    let c3 = n * 50 / 100;
    let c4 = n * 75 / 100;

    for (rank, &idx) in order.iter().enumerate() {
        records[idx].popularity_tier = if rank < c1 {
            PopularityTier::VeryHigh
        } else if rank < c2 {
            PopularityTier::High
        } else if rank < c3 {
            PopularityTier::Medium
        } else if rank < c4 {
            PopularityTier::Low
        } else {
            PopularityTier::VeryLow
        };
    }
}

/// Dataset-wide statistics for the summary artifact. The generation
/// timestamp here is the one deliberately volatile field across runs.
pub fn summarize(records: &[EntityRecord], unique_locations: u32) -> Summary {
    let mut category_distribution = std::collections::BTreeMap::new();
    let mut popularity_distribution = std::collections::BTreeMap::new();
    let mut years = BTreeSet::new();
    let mut earliest: Option<i32> = None;
    let mut latest: Option<i32> = None;
    let mut total_events: u32 = 0;

    for record in records {
        *popularity_distribution
            .entry(record.popularity_tier.to_string())
            .or_insert(0u32) += 1;

        for event in &record.timeline_events {
            total_events += 1;
            *category_distribution
                .entry(event.category.to_string())
                .or_insert(0u32) += 1;

            let start = event.year.start();
            let end = event.year.end();
            years.insert(start);
            earliest = Some(earliest.map_or(start, |e| e.min(start)));
            latest = Some(latest.map_or(end, |l| l.max(end)));
        }
    }

    let total_entities = records.len() as u32;
    Summary {
        dataset_info: DatasetInfo {
            total_entities,
            total_timeline_events: total_events,
            total_unique_locations: unique_locations,
            generated_at: Utc::now(),
        },
        event_category_distribution: category_distribution,
        popularity_distribution,
        temporal_coverage: TemporalCoverage {
            earliest_year: earliest,
            latest_year: latest,
            distinct_years: years.len() as u32,
        },
        avg_events_per_entity: if total_entities == 0 {
            0.0
        } else {
            f64::from(total_events) / f64::from(total_entities)
        },
    }
}

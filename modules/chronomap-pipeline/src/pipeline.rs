//! Pipeline orchestration: run every entity through the fixed step sequence,
//! persisting each step's output so interrupted or failed runs resume
//! without repeating network or model work.
//!
//! Failure scoping is per entity, per step. A structured-source miss
//! degrades the entity; a narrative miss fails it; nothing short of a
//! missing roster or unreachable model aborts the run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use chronomap_common::{
    Config, EntityRecord, EntityStatus, Narrative, PipelineStep, SourceOutcome, StructuredFacts,
    TimelineEvent,
};

use crate::cache::CacheStore;
use crate::extractor::{CompletionModel, Extractor};
use crate::geocoder::Geocoder;
use crate::merger::{assign_tiers, merge_entity, summarize};
use crate::report::{RunReport, RunStats};
use crate::roster::{self, RosterEntry};
use crate::sources::{NarrativeSource, StructuredSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Process every roster entity, reusing persisted step outputs.
    Full,
    /// Process only entities that previously failed or were never run.
    Retry,
}

/// Narrative prose and the popularity metric travel together: both come
/// from the same source during the same step.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NarrativeBundle {
    narrative: Narrative,
    popularity: SourceOutcome<f64>,
}

type StepFailure = (PipelineStep, String);

pub struct Pipeline<'a, M: CompletionModel> {
    config: &'a Config,
    model: &'a M,
    structured: &'a dyn StructuredSource,
    narrative: &'a dyn NarrativeSource,
}

impl<'a, M: CompletionModel> Pipeline<'a, M> {
    pub fn new(
        config: &'a Config,
        model: &'a M,
        structured: &'a dyn StructuredSource,
        narrative: &'a dyn NarrativeSource,
    ) -> Self {
        Self {
            config,
            model,
            structured,
            narrative,
        }
    }

    /// Execute one run. `force_step` discards the persisted output of that
    /// step (and everything after it) for each selected entity, forcing
    /// recomputation from there.
    pub async fn run(
        &self,
        mode: RunMode,
        force_step: Option<PipelineStep>,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id, ?mode, ?force_step, "Starting pipeline run");

        let roster = roster::load(self.config)?;
        let data_dir = Path::new(&self.config.data_dir);
        let mut steps = CacheStore::open(data_dir, "step_outputs")?;
        let mut registry = CacheStore::open(data_dir, "registry")?;
        let mut geocoder = Geocoder::open(self.config, self.model)?;

        let mut stats = RunStats::default();
        let mut failures = BTreeMap::new();

        for entry in &roster {
            if mode == RunMode::Retry
                && matches!(
                    registry.get_as::<EntityStatus>(&entry.id),
                    Some(EntityStatus::Completed)
                )
            {
                stats.entities_skipped += 1;
                continue;
            }

            if let Some(step) = force_step {
                invalidate_from(&mut steps, &entry.id, step)?;
            }

            stats.entities_processed += 1;
            match self
                .process_entity(entry, &mut steps, &mut geocoder, &mut stats)
                .await
            {
                Ok(record) => {
                    stats.entities_completed += 1;
                    stats.events_extracted += record.timeline_events.len() as u32;
                    for event in &record.timeline_events {
                        match &event.location {
                            Some(loc) if loc.coordinate.is_some() => {
                                stats.locations_resolved += 1
                            }
                            Some(_) => stats.locations_unresolved += 1,
                            None => {}
                        }
                    }
                    registry.put_as(&entry.id, &EntityStatus::Completed)?;
                    info!(
                        entity = %entry.id,
                        events = record.timeline_events.len(),
                        "Entity complete"
                    );
                }
                Err((step, reason)) => {
                    stats.entities_failed += 1;
                    warn!(entity = %entry.id, step = %step, reason = %reason, "Entity failed");
                    failures.insert(entry.id.clone(), format!("{step}: {reason}"));
                    registry.put_as(&entry.id, &EntityStatus::Failed { step, reason })?;
                }
            }
        }

        self.emit_artifacts(&steps, &registry, &geocoder, &mut stats)?;

        let report = RunReport {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            stats,
            failures,
        };
        let path = report.save(&self.config.data_dir)?;
        info!(report = %path.display(), "Run report saved");
        Ok(report)
    }

    async fn process_entity(
        &self,
        entry: &RosterEntry,
        steps: &mut CacheStore,
        geocoder: &mut Geocoder<'a, M>,
        stats: &mut RunStats,
    ) -> Result<EntityRecord, StepFailure> {
        // --- ingest_structured: miss or failure degrades, never fails ---
        let step = PipelineStep::IngestStructured;
        let key = CacheStore::step_key(&entry.id, step);
        let structured: SourceOutcome<StructuredFacts> = match steps.get_as(&key) {
            Some(cached) => cached,
            None => {
                let outcome = self.structured.fetch_structured(entry).await;
                // Transient failures stay uncached so a retry can try again
                if !matches!(outcome, SourceOutcome::Failed { .. }) {
                    steps.put_as(&key, &outcome).map_err(fail_at(step))?;
                }
                outcome
            }
        };
        let facts = match &structured {
            SourceOutcome::Found { data } => {
                stats.structured_hits += 1;
                for place in [&data.birth_place, &data.death_place].into_iter().flatten() {
                    geocoder
                        .seed_structured(&place.name, place.coordinate)
                        .map_err(fail_at(step))?;
                }
                Some(data.clone())
            }
            SourceOutcome::NotFound => {
                stats.structured_missing += 1;
                info!(entity = %entry.id, "No structured facts, continuing degraded");
                None
            }
            SourceOutcome::Failed { reason } => {
                stats.structured_missing += 1;
                warn!(entity = %entry.id, reason = %reason, "Structured fetch failed, continuing degraded");
                None
            }
        };

        // --- ingest_narrative: the prose is the pipeline's raw material,
        //     without it the entity cannot proceed ---
        let step = PipelineStep::IngestNarrative;
        let key = CacheStore::step_key(&entry.id, step);
        let bundle: NarrativeBundle = match steps.get_as(&key) {
            Some(cached) => cached,
            None => match self.narrative.fetch_narrative(entry).await {
                SourceOutcome::Found { data } => {
                    let popularity = self.narrative.fetch_popularity(entry).await;
                    if let SourceOutcome::Failed { reason } = &popularity {
                        warn!(entity = %entry.id, reason = %reason, "Popularity fetch failed, scoring zero");
                    }
                    let bundle = NarrativeBundle {
                        narrative: data,
                        popularity,
                    };
                    steps.put_as(&key, &bundle).map_err(fail_at(step))?;
                    bundle
                }
                SourceOutcome::NotFound => {
                    return Err((step, "narrative article not found".to_string()))
                }
                SourceOutcome::Failed { reason } => return Err((step, reason)),
            },
        };

        // --- extract_events ---
        let step = PipelineStep::ExtractEvents;
        let key = CacheStore::step_key(&entry.id, step);
        let events: Vec<TimelineEvent> = match steps.get_as(&key) {
            Some(cached) => cached,
            None => {
                let extractor = Extractor::new(self.model);
                let events = extractor
                    .extract_events(entry, &bundle.narrative.paragraphs)
                    .await;
                steps.put_as(&key, &events).map_err(fail_at(step))?;
                events
            }
        };

        // --- resolve_locations ---
        let step = PipelineStep::ResolveLocations;
        let key = CacheStore::step_key(&entry.id, step);
        let located: Vec<TimelineEvent> = match steps.get_as(&key) {
            Some(cached) => cached,
            None => {
                let located = geocoder
                    .annotate_events(entry, events)
                    .await
                    .map_err(fail_at(step))?;
                steps.put_as(&key, &located).map_err(fail_at(step))?;
                located
            }
        };

        // --- merge_and_validate ---
        let step = PipelineStep::MergeAndValidate;
        let key = CacheStore::step_key(&entry.id, step);
        let record: EntityRecord = match steps.get_as(&key) {
            Some(cached) => cached,
            None => {
                let popularity_score = bundle.popularity.as_found().copied().unwrap_or(0.0);
                let record = merge_entity(
                    entry,
                    facts.as_ref(),
                    Some(bundle.narrative.source_url.as_str()),
                    popularity_score,
                    located,
                )
                .map_err(|e| (step, e.to_string()))?;
                steps.put_as(&key, &record).map_err(fail_at(step))?;
                record
            }
        };

        Ok(record)
    }

    /// Rebuild all three artifacts from persisted state. Runs every time:
    /// tiers are relative, so any change to one entity can move another's
    /// tier, and the rebuild is cheap.
    fn emit_artifacts(
        &self,
        steps: &CacheStore,
        registry: &CacheStore,
        geocoder: &Geocoder<'a, M>,
        stats: &mut RunStats,
    ) -> Result<()> {
        let mut records: Vec<EntityRecord> = Vec::new();
        for (entity_id, status) in registry.entries_as::<EntityStatus>() {
            if status != EntityStatus::Completed {
                continue;
            }
            let key = CacheStore::step_key(&entity_id, PipelineStep::MergeAndValidate);
            match steps.get_as::<EntityRecord>(&key) {
                Some(record) => records.push(record),
                None => warn!(
                    entity = %entity_id,
                    "Completed entity has no merged record, omitting from artifacts"
                ),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        assign_tiers(&mut records);

        let locations = geocoder.records();
        let summary = summarize(&records, locations.len() as u32);
        stats.entities_in_dataset = records.len() as u32;

        // Both artifacts are mappings: entity id -> record, canonical place
        // name -> record.
        let entities: BTreeMap<String, EntityRecord> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();

        let dir = Path::new(&self.config.data_dir);
        std::fs::create_dir_all(dir)?;
        write_artifact(&dir.join("entities.json"), &entities)?;
        write_artifact(&dir.join("locations.json"), &locations)?;
        write_artifact(&dir.join("summary.json"), &summary)?;
        info!(
            entities = entities.len(),
            locations = locations.len(),
            "Artifacts written"
        );
        Ok(())
    }
}

fn fail_at(step: PipelineStep) -> impl Fn(anyhow::Error) -> StepFailure {
    move |e| (step, e.to_string())
}

/// Drop the persisted output of `from` and every later step for one entity.
fn invalidate_from(steps: &mut CacheStore, entity_id: &str, from: PipelineStep) -> Result<()> {
    let mut reached = false;
    for step in PipelineStep::ALL {
        if step == from {
            reached = true;
        }
        if reached {
            steps.remove(&CacheStore::step_key(entity_id, step))?;
        }
    }
    Ok(())
}

fn write_artifact<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use anyhow::Context;
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_drops_step_and_everything_after() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = CacheStore::open(dir.path(), "step_outputs").unwrap();
        for step in PipelineStep::ALL {
            steps
                .put(&CacheStore::step_key("e", step), serde_json::json!(1))
                .unwrap();
        }

        invalidate_from(&mut steps, "e", PipelineStep::ExtractEvents).unwrap();

        assert!(steps.contains(&CacheStore::step_key("e", PipelineStep::IngestStructured)));
        assert!(steps.contains(&CacheStore::step_key("e", PipelineStep::IngestNarrative)));
        assert!(!steps.contains(&CacheStore::step_key("e", PipelineStep::ExtractEvents)));
        assert!(!steps.contains(&CacheStore::step_key("e", PipelineStep::ResolveLocations)));
        assert!(!steps.contains(&CacheStore::step_key("e", PipelineStep::MergeAndValidate)));
    }

    #[test]
    fn run_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(RunMode::Retry).unwrap(),
            serde_json::json!("retry")
        );
    }
}

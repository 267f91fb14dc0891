//! Per-run statistics and the persisted run report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::RunMode;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub entities_processed: u32,
    pub entities_completed: u32,
    pub entities_failed: u32,
    pub entities_skipped: u32,
    pub structured_hits: u32,
    pub structured_missing: u32,
    pub events_extracted: u32,
    pub locations_resolved: u32,
    pub locations_unresolved: u32,
    /// Completed entities in the emitted dataset, including prior runs.
    pub entities_in_dataset: u32,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Pipeline Run Complete ===")?;
        writeln!(f, "Entities processed:  {}", self.entities_processed)?;
        writeln!(f, "Entities completed:  {}", self.entities_completed)?;
        writeln!(f, "Entities failed:     {}", self.entities_failed)?;
        writeln!(f, "Entities skipped:    {} (already complete)", self.entities_skipped)?;
        writeln!(f, "\nSources:")?;
        writeln!(f, "  Structured hits:    {}", self.structured_hits)?;
        writeln!(f, "  Structured missing: {}", self.structured_missing)?;
        writeln!(f, "\nExtraction:")?;
        writeln!(f, "  Events extracted:     {}", self.events_extracted)?;
        writeln!(f, "  Locations resolved:   {}", self.locations_resolved)?;
        writeln!(f, "  Locations unresolved: {}", self.locations_unresolved)?;
        writeln!(f, "\nDataset now holds {} entities", self.entities_in_dataset)?;
        Ok(())
    }
}

/// Everything worth keeping about one run, written under
/// `{data_dir}/runs/{run_id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    /// Per-entity failure reasons, keyed by entity id.
    pub failures: std::collections::BTreeMap<String, String>,
}

impl RunReport {
    /// Save the report as JSON. Returns the file path.
    pub fn save(&self, data_dir: &str) -> Result<PathBuf> {
        let dir = Path::new(data_dir).join("runs");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let path = dir.join(format!("{}.json", self.run_id));
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let report = RunReport {
            run_id: "test-run".to_string(),
            mode: RunMode::Full,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stats: RunStats {
                entities_completed: 3,
                ..Default::default()
            },
            failures: std::collections::BTreeMap::new(),
        };

        let path = report.save(&dir.path().display().to_string()).unwrap();
        assert!(path.ends_with("runs/test-run.json"));

        let loaded: RunReport =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(loaded.stats.entities_completed, 3);
    }

    #[test]
    fn display_mentions_every_counter_group() {
        let rendered = RunStats::default().to_string();
        assert!(rendered.contains("Entities processed"));
        assert!(rendered.contains("Structured hits"));
        assert!(rendered.contains("Locations resolved"));
    }
}

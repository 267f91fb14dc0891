//! Entity roster: which historical people the pipeline processes.
//!
//! A compile-time default set of 18th-century mathematicians, overridable
//! with `ROSTER_FILE` pointing at a JSON array of entries.

use std::collections::BTreeSet;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use chronomap_common::{ChronomapError, Config};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Stable slug used as the entity identifier everywhere.
    pub id: String,
    pub name: String,
    pub birth_year: i32,
    pub death_year: i32,
    pub nationality: String,
    pub fields: BTreeSet<String>,
    /// Canonical narrative (encyclopedia) article URL.
    pub narrative_url: String,
    /// Knowledge-graph identifier, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub structured_id: Option<String>,
}

/// Load the roster: `ROSTER_FILE` if configured, otherwise the built-in set.
/// An empty roster is a configuration error and fatal to the run.
pub fn load(config: &Config) -> Result<Vec<RosterEntry>> {
    let roster = match &config.roster_file {
        Some(path) => {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read roster file {path}"))?;
            let entries: Vec<RosterEntry> = serde_json::from_slice(&bytes)
                .with_context(|| format!("roster file {path} is not a valid roster"))?;
            info!(path, count = entries.len(), "Loaded roster from file");
            entries
        }
        None => default_roster(),
    };

    if roster.is_empty() {
        return Err(ChronomapError::Config("roster is empty".to_string()).into());
    }
    Ok(roster)
}

fn entry(
    id: &str,
    name: &str,
    birth_year: i32,
    death_year: i32,
    nationality: &str,
    fields: &[&str],
    narrative_url: &str,
    structured_id: &str,
) -> RosterEntry {
    RosterEntry {
        id: id.to_string(),
        name: name.to_string(),
        birth_year,
        death_year,
        nationality: nationality.to_string(),
        fields: fields.iter().map(|f| f.to_string()).collect(),
        narrative_url: narrative_url.to_string(),
        structured_id: Some(structured_id.to_string()),
    }
}

pub fn default_roster() -> Vec<RosterEntry> {
    vec![
        entry(
            "leonhard_euler",
            "Leonhard Euler",
            1707,
            1783,
            "Swiss",
            &["mathematics", "physics", "astronomy"],
            "https://en.wikipedia.org/wiki/Leonhard_Euler",
            "Q7604",
        ),
        entry(
            "joseph_louis_lagrange",
            "Joseph-Louis Lagrange",
            1736,
            1813,
            "Italian-French",
            &["mathematics", "mechanics", "astronomy"],
            "https://en.wikipedia.org/wiki/Joseph-Louis_Lagrange",
            "Q44197",
        ),
        entry(
            "pierre_simon_laplace",
            "Pierre-Simon Laplace",
            1749,
            1827,
            "French",
            &["mathematics", "astronomy", "physics"],
            "https://en.wikipedia.org/wiki/Pierre-Simon_Laplace",
            "Q44481",
        ),
        entry(
            "daniel_bernoulli",
            "Daniel Bernoulli",
            1700,
            1782,
            "Swiss",
            &["mathematics", "physics", "medicine"],
            "https://en.wikipedia.org/wiki/Daniel_Bernoulli",
            "Q122366",
        ),
        entry(
            "jean_le_rond_dalembert",
            "Jean le Rond d'Alembert",
            1717,
            1783,
            "French",
            &["mathematics", "mechanics", "philosophy"],
            "https://en.wikipedia.org/wiki/Jean_le_Rond_d%27Alembert",
            "Q153232",
        ),
        entry(
            "carl_friedrich_gauss",
            "Carl Friedrich Gauss",
            1777,
            1855,
            "German",
            &["mathematics", "astronomy", "physics"],
            "https://en.wikipedia.org/wiki/Carl_Friedrich_Gauss",
            "Q6722",
        ),
    ]
}

/// Derive the article title from a narrative URL (last path segment).
pub fn article_title(narrative_url: &str) -> &str {
    narrative_url.rsplit('/').next().unwrap_or(narrative_url)
}

//! Durable key/value store backed by a single JSON file.
//!
//! Holds geocoding results and per-entity step outputs so expensive network
//! and model calls are never repeated across runs. Writes go to disk
//! immediately (temp file + rename); a corrupt file on load is discarded
//! with a warning, never fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use chronomap_common::PipelineStep;

pub struct CacheStore {
    path: PathBuf,
    entries: BTreeMap<String, serde_json::Value>,
}

impl CacheStore {
    /// Open (or create) the store named `name` under `dir`.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        let path = dir.join(format!("{name}.json"));

        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Cache file is corrupt, discarding and rebuilding"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache file, starting fresh");
                BTreeMap::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        Ok(Self { path, entries })
    }

    /// Key for a per-entity step output.
    pub fn step_key(entity_id: &str, step: PipelineStep) -> String {
        format!("{entity_id}::{step}")
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// Typed lookup. A value that no longer deserializes (schema drift) is
    /// treated as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.entries.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "Cached value no longer deserializes, ignoring");
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert and persist immediately.
    pub fn put(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        self.persist()
    }

    pub fn put_as<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.put(key, serde_json::to_value(value)?)
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries whose values deserialize as `T`, keyed as stored.
    pub fn entries_as<T: DeserializeOwned>(&self) -> BTreeMap<String, T> {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                serde_json::from_value(v.clone())
                    .ok()
                    .map(|t| (k.clone(), t))
            })
            .collect()
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

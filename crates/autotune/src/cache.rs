//! Persisted tuning results.
//!
//! Each entry stores the comma-separated perf-values text; that text is the
//! only persisted form of a chosen configuration.

use anyhow::Result;
use convtune_kernels::{ConvProblem, HardwareLimits, PerformanceConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AutotuneCache {
    wrw3x3: BTreeMap<String, String>,
}

impl AutotuneCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached config for `problem`, if present and still legal under `limits`.
    pub fn get(&self, problem: &ConvProblem, limits: &HardwareLimits) -> Option<PerformanceConfig> {
        let key = problem.cache_key();
        let text = self.wrw3x3.get(&key)?;
        match text.parse::<PerformanceConfig>() {
            Ok(config) if config.is_valid_with(problem, limits) => Some(config),
            Ok(config) => {
                warn!(
                    key = %key,
                    config = %config,
                    "ignoring cached config that is no longer valid"
                );
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "ignoring malformed cache entry");
                None
            }
        }
    }

    pub fn insert(&mut self, problem: &ConvProblem, config: &PerformanceConfig) {
        self.wrw3x3.insert(problem.cache_key(), config.to_string());
    }

    pub fn remove(&mut self, problem: &ConvProblem) -> bool {
        self.wrw3x3.remove(&problem.cache_key()).is_some()
    }

    pub fn len(&self) -> usize {
        self.wrw3x3.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrw3x3.is_empty()
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read(path)?;
        let cache = serde_json::from_slice(&data)?;
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

//! Empirical search over the legal configuration space.

use crate::backend::TuningBackend;
use crate::cache::AutotuneCache;
use crate::error::TuneError;
use crate::heartbeat::{HeartBeat, DEFAULT_HEARTBEAT_INTERVAL};
use crate::space::ConfigSpace;
use anyhow::{ensure, Result};
use convtune_kernels::{
    parse_override, ConvAsmBwdWrW3x3, ConvProblem, HardwareLimits, KernelArgs, PerformanceConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TunerOptions {
    /// Perf-values text that bypasses the search entirely when non-empty.
    pub perf_vals: Option<String>,
    pub search_limit_wave_cnt: bool,
    pub heartbeat_interval: Duration,
    /// Seed for the input buffer contents.
    pub seed: u64,
    pub limits: HardwareLimits,
}

impl Default for TunerOptions {
    fn default() -> Self {
        Self {
            perf_vals: None,
            search_limit_wave_cnt: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            seed: 0x3a3_5eed,
            limits: HardwareLimits::default(),
        }
    }
}

/// Result of one full pass over the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Fastest measured config, or the heuristic one when nothing ran.
    pub best: PerformanceConfig,
    pub best_time_ms: Option<f64>,
    pub found: bool,
    pub n_total: usize,
    pub n_run: usize,
    pub n_failed: usize,
    /// Position of `best` in enumeration order.
    pub best_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Override,
    Cache,
    Search,
    /// The search ran but every candidate failed.
    Heuristic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub config: PerformanceConfig,
    pub source: SelectionSource,
    pub outcome: Option<SearchOutcome>,
}

pub struct Autotuner {
    solver: ConvAsmBwdWrW3x3,
    options: TunerOptions,
    cache: AutotuneCache,
}

impl Autotuner {
    pub fn new(cache: AutotuneCache) -> Self {
        Self::with_options(cache, TunerOptions::default())
    }

    pub fn with_options(cache: AutotuneCache, options: TunerOptions) -> Self {
        Self {
            solver: ConvAsmBwdWrW3x3::with_limits(options.limits),
            options,
            cache,
        }
    }

    pub fn options(&self) -> &TunerOptions {
        &self.options
    }

    pub fn solver(&self) -> &ConvAsmBwdWrW3x3 {
        &self.solver
    }

    pub fn cache(&self) -> &AutotuneCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut AutotuneCache {
        &mut self.cache
    }

    pub fn space<'p>(&self, problem: &'p ConvProblem) -> ConfigSpace<'p> {
        ConfigSpace::new(problem)
            .with_limits(self.options.limits)
            .search_limit_wave_cnt(self.options.search_limit_wave_cnt)
    }

    /// Pick a config for `problem`: a perf-values override if set, then a
    /// cached result, then a full search. Found search results are cached.
    pub fn select<B: TuningBackend>(
        &mut self,
        problem: &ConvProblem,
        backend: &mut B,
    ) -> Result<Selection, TuneError> {
        self.solver.check_applicable(problem)?;

        if let Some(value) = self.options.perf_vals.as_deref().filter(|v| !v.is_empty()) {
            let config = parse_override(problem, value, &self.options.limits)?;
            info!(config = %config, "using performance config from override");
            return Ok(Selection {
                config,
                source: SelectionSource::Override,
                outcome: None,
            });
        }

        if let Some(config) = self.cache.get(problem, &self.options.limits) {
            debug!(config = %config, "autotune cache hit");
            return Ok(Selection {
                config,
                source: SelectionSource::Cache,
                outcome: None,
            });
        }

        let outcome = self.search(problem, backend)?;
        let source = if outcome.found {
            self.cache.insert(problem, &outcome.best);
            SelectionSource::Search
        } else {
            warn!(
                config = %outcome.best,
                "no candidate could be measured, keeping heuristic config"
            );
            SelectionSource::Heuristic
        };
        Ok(Selection {
            config: outcome.best,
            source,
            outcome: Some(outcome),
        })
    }

    /// Compile, launch and time every legal config in enumeration order.
    ///
    /// Per-candidate failures are counted and skipped; only an inapplicable
    /// problem or a failed buffer allocation abort the search.
    pub fn search<B: TuningBackend>(
        &self,
        problem: &ConvProblem,
        backend: &mut B,
    ) -> Result<SearchOutcome, TuneError> {
        self.solver.check_applicable(problem)?;

        backend.enable_profiling(true);
        let outcome = self.run_search(problem, backend);
        backend.enable_profiling(false);
        outcome
    }

    fn run_search<B: TuningBackend>(
        &self,
        problem: &ConvProblem,
        backend: &mut B,
    ) -> Result<SearchOutcome, TuneError> {
        let mut buffers = backend
            .allocate(problem, self.options.seed)
            .map_err(TuneError::Backend)?;

        let space = self.space(problem);
        let n_total = space.len();
        warn!(backend = backend.name(), "3x3 WrW: searching {n_total} configs");

        let args = self.solver.kernel_args(problem);
        let mut best = self.solver.heuristic_config(problem);
        let mut best_time: Option<f64> = None;
        let mut best_index = None;
        let mut n_run = 0;
        let mut n_failed = 0;

        let mut heartbeat = HeartBeat::new(self.options.heartbeat_interval);
        heartbeat.start();

        for config in &space {
            debug!(index = n_run, config = %config, "measuring candidate");
            let elapsed = match self.measure(problem, &config, backend, &mut buffers, &args) {
                Ok(ms) => {
                    if best_time.map_or(true, |current| ms < current) {
                        info!(index = n_run, config = %config, time_ms = ms, "new best");
                        best = config;
                        best_time = Some(ms);
                        best_index = Some(n_run);
                    }
                    Some(ms)
                }
                Err(err) => {
                    n_failed += 1;
                    info!(config = %config, "candidate failed: {err:#}");
                    None
                }
            };
            heartbeat.monitor(elapsed, n_run, best_time, n_failed, n_total, &config);
            n_run += 1;
        }

        let found = best_time.is_some();
        warn!(
            "Done: {}/{}/{}, best #{:?} {:?} {}",
            n_run, n_failed, n_total, best_index, best_time, best
        );
        Ok(SearchOutcome {
            best,
            best_time_ms: best_time,
            found,
            n_total,
            n_run,
            n_failed,
            best_index,
        })
    }

    fn measure<B: TuningBackend>(
        &self,
        problem: &ConvProblem,
        config: &PerformanceConfig,
        backend: &mut B,
        buffers: &mut B::Buffers,
        args: &KernelArgs,
    ) -> Result<f64> {
        let solution = self.solver.get_solution(problem, config);
        let kernel = backend.compile(problem, &solution)?;
        let elapsed = backend.launch(&kernel, buffers, args, &solution.geometry)?;
        ensure!(
            elapsed.is_finite() && elapsed >= 0.0,
            "launch reported invalid time {elapsed}"
        );
        Ok(elapsed)
    }
}

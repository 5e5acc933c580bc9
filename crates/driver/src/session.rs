//! Tuning session orchestration.

use anyhow::Result;
use convtune_autotune::{SearchOutcome, SelectionSource, TunerOptions};
use convtune_backend_cpu::{
    host_device, CpuBackendOptions, CpuExecutor, CpuExecutorOptions, WrwExecution,
};
use convtune_kernels::{
    ConvAsmBwdWrW3x3, ConvProblem, DeviceInfo, KernelSolution, PerformanceConfig,
};
use ndarray::ArrayView4;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub autotune_cache: Option<PathBuf>,
    pub clear_autotune_cache: bool,
    /// Perf-values text used instead of searching.
    pub perf_vals: Option<String>,
    pub search_limit_wave_cnt: bool,
    pub seed: u64,
    pub heartbeat_interval: Duration,
    pub warmup_runs: usize,
    pub runs: usize,
}

impl SessionOptions {
    pub fn to_cpu_options(&self) -> CpuExecutorOptions {
        let defaults = TunerOptions::default();
        CpuExecutorOptions {
            autotune_cache: self.autotune_cache.clone(),
            clear_cache: self.clear_autotune_cache,
            tuner: TunerOptions {
                perf_vals: self.perf_vals.clone(),
                search_limit_wave_cnt: self.search_limit_wave_cnt,
                heartbeat_interval: self.heartbeat_interval,
                seed: self.seed,
                ..defaults
            },
            backend: CpuBackendOptions {
                warmup_runs: self.warmup_runs,
                runs: self.runs,
            },
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        let tuner = TunerOptions::default();
        let backend = CpuBackendOptions::default();
        Self {
            autotune_cache: None,
            clear_autotune_cache: false,
            perf_vals: None,
            search_limit_wave_cnt: tuner.search_limit_wave_cnt,
            seed: tuner.seed,
            heartbeat_interval: tuner.heartbeat_interval,
            warmup_runs: backend.warmup_runs,
            runs: backend.runs,
        }
    }
}

/// Serializable summary of one tuning decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneReport {
    pub problem: ConvProblem,
    pub config: PerformanceConfig,
    pub source: SelectionSource,
    pub outcome: Option<SearchOutcome>,
    pub solution: KernelSolution,
}

pub struct TuningSession {
    executor: CpuExecutor,
    device: DeviceInfo,
}

impl TuningSession {
    pub fn new(options: SessionOptions) -> Result<Self> {
        let executor = CpuExecutor::with_options(options.to_cpu_options())?;
        Ok(Self {
            executor,
            device: host_device(),
        })
    }

    /// Device problems should target to run on this session's backend.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn solver(&self) -> &ConvAsmBwdWrW3x3 {
        self.executor.planner().autotuner().solver()
    }

    pub fn tune(&mut self, problem: &ConvProblem) -> Result<TuneReport> {
        let plan = self.executor.planner_mut().plan_wrw(problem)?;
        info!(
            key = %problem.cache_key(),
            config = %plan.selection.config,
            source = ?plan.selection.source,
            "tuning finished"
        );
        Ok(TuneReport {
            problem: plan.problem,
            config: plan.selection.config,
            source: plan.selection.source,
            outcome: plan.selection.outcome,
            solution: plan.solution,
        })
    }

    pub fn execute_wrw(
        &mut self,
        problem: &ConvProblem,
        image: ArrayView4<'_, f32>,
        grad_output: ArrayView4<'_, f32>,
    ) -> Result<WrwExecution> {
        self.executor.execute_wrw(problem, image, grad_output)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.executor.shutdown()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_options() -> SessionOptions {
        SessionOptions {
            warmup_runs: 0,
            runs: 1,
            ..SessionOptions::default()
        }
    }

    #[test]
    fn tune_then_cache_hit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = SessionOptions {
            autotune_cache: Some(dir.path().join("cache.json")),
            ..quick_options()
        };
        let mut session = TuningSession::new(options.clone())?;
        let problem = ConvProblem::new(1, 8, 4, 3, 8).with_device(session.device().clone());

        let report = session.tune(&problem)?;
        assert_eq!(report.source, SelectionSource::Search);
        let outcome = report.outcome.as_ref().map(|o| o.found);
        assert_eq!(outcome, Some(true));
        assert_eq!(report.solution.config, report.config);
        session.shutdown()?;

        let mut resumed = TuningSession::new(options)?;
        let again = resumed.tune(&problem)?;
        assert_eq!(again.source, SelectionSource::Cache);
        assert_eq!(again.config, report.config);
        Ok(())
    }

    #[test]
    fn override_is_threaded_through() -> Result<()> {
        let options = SessionOptions {
            perf_vals: Some("0,0,16,1,1,1".into()),
            ..quick_options()
        };
        let mut session = TuningSession::new(options)?;
        let problem = ConvProblem::new(1, 8, 4, 3, 8).with_device(session.device().clone());
        let report = session.tune(&problem)?;
        assert_eq!(report.source, SelectionSource::Override);
        assert_eq!(report.config, PerformanceConfig::new(0, 0, 16, 1, 1, 1));
        Ok(())
    }
}

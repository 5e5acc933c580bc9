//! CPU runtime entrypoints.

use crate::device::{CpuBackend, CpuBackendOptions};
use crate::planner::{CpuPlanner, CpuWrwPlan};
use anyhow::Result;
use convtune_autotune::{AutotuneCache, Autotuner, SelectionSource, TunerOptions};
use convtune_kernels::reference::backward_weights;
use convtune_kernels::{ConvProblem, PerformanceConfig};
use ndarray::{Array4, ArrayView4};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct CpuExecutorOptions {
    pub autotune_cache: Option<PathBuf>,
    pub clear_cache: bool,
    pub tuner: TunerOptions,
    pub backend: CpuBackendOptions,
}

pub struct WrwExecution {
    pub grad_weights: Array4<f32>,
    pub config: PerformanceConfig,
    pub source: SelectionSource,
    pub tuned_time_ms: Option<f64>,
}

pub struct CpuExecutor {
    planner: CpuPlanner,
}

impl CpuExecutor {
    pub fn new(planner: CpuPlanner) -> Self {
        Self { planner }
    }

    pub fn with_options(mut options: CpuExecutorOptions) -> Result<Self> {
        if let Some(path) = &options.autotune_cache {
            if options.clear_cache && path.exists() {
                fs::remove_file(path)?;
            }
        }

        let cache = if let Some(path) = &options.autotune_cache {
            AutotuneCache::load_from_file(path)?
        } else {
            AutotuneCache::new()
        };

        let autotuner = Autotuner::with_options(cache, options.tuner.clone());
        let backend = CpuBackend::new(options.backend.clone());
        let mut planner = CpuPlanner::new(backend, autotuner);

        if let Some(path) = options.autotune_cache.take() {
            planner = planner.with_cache_path(path);
        }

        Ok(Self::new(planner))
    }

    /// Tune (or look up) a config for `problem`, then compute the weight
    /// gradient with it.
    pub fn execute_wrw(
        &mut self,
        problem: &ConvProblem,
        image: ArrayView4<'_, f32>,
        grad_output: ArrayView4<'_, f32>,
    ) -> Result<WrwExecution> {
        let plan = self.planner.plan_wrw(problem)?;
        self.dispatch_wrw(plan, image, grad_output)
    }

    pub fn planner(&self) -> &CpuPlanner {
        &self.planner
    }

    pub fn planner_mut(&mut self) -> &mut CpuPlanner {
        &mut self.planner
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.planner.persist_cache()
    }

    fn dispatch_wrw(
        &self,
        plan: CpuWrwPlan,
        image: ArrayView4<'_, f32>,
        grad_output: ArrayView4<'_, f32>,
    ) -> Result<WrwExecution> {
        let tuned_time_ms = plan
            .selection
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.best_time_ms);
        info!(
            config = %plan.selection.config,
            source = ?plan.selection.source,
            time_ms = ?tuned_time_ms,
            "executing 3x3 WrW plan"
        );
        let grad_weights = backward_weights(&plan.problem, &plan.solution, image, grad_output)?;
        Ok(WrwExecution {
            grad_weights,
            config: plan.selection.config,
            source: plan.selection.source,
            tuned_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{host_device, WrwBuffers};

    #[test]
    fn executes_with_override_and_clears_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{\"wrw3x3\":{}}")?;

        let options = CpuExecutorOptions {
            autotune_cache: Some(path.clone()),
            clear_cache: true,
            tuner: TunerOptions {
                perf_vals: Some("0,0,8,1,2,1".into()),
                ..TunerOptions::default()
            },
            ..CpuExecutorOptions::default()
        };
        let mut executor = CpuExecutor::with_options(options)?;
        assert!(!path.exists());

        let problem = ConvProblem::new(2, 8, 8, 4, 8).with_device(host_device());
        let inputs = WrwBuffers::seeded(&problem, 11);
        let run = executor.execute_wrw(&problem, inputs.image.view(), inputs.grad_output.view())?;
        assert_eq!(run.source, SelectionSource::Override);
        assert_eq!(run.config, PerformanceConfig::new(0, 0, 8, 1, 2, 1));
        assert_eq!(run.tuned_time_ms, None);
        assert_eq!(run.grad_weights.shape(), problem.weight_shape());

        executor.shutdown()?;
        assert!(path.exists());
        Ok(())
    }
}

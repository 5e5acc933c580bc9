//! Planning logic for CPU execution.

use crate::device::CpuBackend;
use anyhow::Result;
use convtune_autotune::{AutotuneCache, Autotuner, Selection, TunerOptions};
use convtune_kernels::{ConvProblem, KernelSolution};
use std::path::PathBuf;

pub struct CpuWrwPlan {
    pub problem: ConvProblem,
    pub selection: Selection,
    pub solution: KernelSolution,
}

pub struct CpuPlanner {
    backend: CpuBackend,
    autotuner: Autotuner,
    cache_path: Option<PathBuf>,
}

impl CpuPlanner {
    pub fn new(backend: CpuBackend, autotuner: Autotuner) -> Self {
        Self {
            backend,
            autotuner,
            cache_path: None,
        }
    }

    pub fn with_cache_path(mut self, cache_path: PathBuf) -> Self {
        self.cache_path = Some(cache_path);
        self
    }

    pub fn from_cache_path(
        backend: CpuBackend,
        options: TunerOptions,
        cache_path: PathBuf,
    ) -> Result<Self> {
        let cache = AutotuneCache::load_from_file(&cache_path)?;
        let autotuner = Autotuner::with_options(cache, options);
        Ok(Self::new(backend, autotuner).with_cache_path(cache_path))
    }

    pub fn plan_wrw(&mut self, problem: &ConvProblem) -> Result<CpuWrwPlan> {
        let selection = self.autotuner.select(problem, &mut self.backend)?;
        let solution = self
            .autotuner
            .solver()
            .get_solution(problem, &selection.config);
        Ok(CpuWrwPlan {
            problem: problem.clone(),
            selection,
            solution,
        })
    }

    pub fn persist_cache(&mut self) -> Result<()> {
        if let Some(path) = self.cache_path.clone() {
            self.autotuner.cache().save_to_file(&path)?;
        }
        Ok(())
    }

    pub fn backend_mut(&mut self) -> &mut CpuBackend {
        &mut self.backend
    }

    pub fn autotuner(&self) -> &Autotuner {
        &self.autotuner
    }

    pub fn autotuner_mut(&mut self) -> &mut Autotuner {
        &mut self.autotuner
    }
}

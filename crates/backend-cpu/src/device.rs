//! Host emulation of the 3x3 WrW kernel as a tuning backend.

use anyhow::{bail, ensure, Result};
use convtune_autotune::TuningBackend;
use convtune_kernels::reference::backward_weights;
use convtune_kernels::{
    ConvAsmBwdWrW3x3, ConvProblem, DeviceInfo, KernelArgs, KernelSolution, LaunchGeometry,
};
use ndarray::Array4;
use std::num::NonZeroUsize;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Device name reported for the host; applicability requires a gfx9 part.
pub const HOST_DEVICE_NAME: &str = "gfx906-host";

pub fn host_device() -> DeviceInfo {
    let units = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    DeviceInfo::new(HOST_DEVICE_NAME, units as u32)
}

#[derive(Debug, Clone)]
pub struct CpuBackendOptions {
    pub warmup_runs: usize,
    pub runs: usize,
}

impl Default for CpuBackendOptions {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            runs: 3,
        }
    }
}

/// Input, weight-gradient and output-gradient tensors for one problem.
#[derive(Debug, Clone)]
pub struct WrwBuffers {
    pub image: Array4<f32>,
    pub grad_output: Array4<f32>,
    pub grad_weights: Array4<f32>,
}

impl WrwBuffers {
    pub fn zeroed(problem: &ConvProblem) -> Self {
        Self {
            image: Array4::zeros(problem.image_shape()),
            grad_output: Array4::zeros(problem.grad_output_shape()),
            grad_weights: Array4::zeros(problem.weight_shape()),
        }
    }

    /// Inputs filled with uniform values in `[-1, 1)` drawn from `seed`.
    pub fn seeded(problem: &ConvProblem, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut sample = || rng.f32() * 2.0 - 1.0;
        let image = Array4::from_shape_simple_fn(problem.image_shape(), &mut sample);
        let grad_output = Array4::from_shape_simple_fn(problem.grad_output_shape(), &mut sample);
        Self {
            image,
            grad_output,
            grad_weights: Array4::zeros(problem.weight_shape()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub problem: ConvProblem,
    pub solution: KernelSolution,
    pub options: String,
}

#[derive(Debug)]
pub struct CpuBackend {
    options: CpuBackendOptions,
    profiling: bool,
}

impl CpuBackend {
    pub fn new(options: CpuBackendOptions) -> Self {
        Self {
            options,
            profiling: false,
        }
    }

    pub fn options(&self) -> &CpuBackendOptions {
        &self.options
    }

    fn run_once(&self, kernel: &CompiledKernel, buffers: &mut WrwBuffers) -> Result<()> {
        buffers.grad_weights = backward_weights(
            &kernel.problem,
            &kernel.solution,
            buffers.image.view(),
            buffers.grad_output.view(),
        )?;
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(CpuBackendOptions::default())
    }
}

impl TuningBackend for CpuBackend {
    type Buffers = WrwBuffers;
    type Kernel = CompiledKernel;

    fn name(&self) -> &str {
        "cpu"
    }

    fn enable_profiling(&mut self, enabled: bool) {
        self.profiling = enabled;
    }

    fn allocate(&mut self, problem: &ConvProblem, seed: u64) -> Result<WrwBuffers> {
        debug!(
            image_bytes = problem.image_bytes(),
            grad_output_bytes = problem.grad_output_bytes(),
            weight_bytes = problem.weight_bytes(),
            "allocating host buffers"
        );
        Ok(WrwBuffers::seeded(problem, seed))
    }

    fn compile(
        &mut self,
        problem: &ConvProblem,
        solution: &KernelSolution,
    ) -> Result<CompiledKernel> {
        ensure!(
            solution.kernel_name == ConvAsmBwdWrW3x3::KERNEL_NAME,
            "unknown kernel {}",
            solution.kernel_name
        );
        for (symbol, expected) in [
            ("batch_size", problem.batch_size),
            ("input_channels", problem.n_outputs),
            ("output_channels", problem.n_inputs),
            ("img_h", problem.out_height),
            ("img_w", problem.out_width),
        ] {
            ensure!(
                solution.defsym(symbol) == Some(expected as i64),
                "symbol {symbol} does not match the problem"
            );
        }
        let [_, grid_c, grid_k] = solution.geometry.global;
        if grid_c == 0
            || grid_k == 0
            || problem.n_outputs % grid_c != 0
            || problem.n_inputs % grid_k != 0
        {
            bail!(
                "grid {:?} does not tile C={} K={}",
                solution.geometry.global,
                problem.n_outputs,
                problem.n_inputs
            );
        }
        ensure!(
            solution.workspace_bytes == 0,
            "kernel requests {} workspace bytes, the host provides none",
            solution.workspace_bytes
        );
        let waves = solution.geometry.waves_per_group();
        ensure!(
            waves == solution.config.n_per_group as usize,
            "workgroup of {waves} waves does not match n_per_group {}",
            solution.config.n_per_group
        );
        let options = solution.compile_options();
        debug!(config = %solution.config, options = %options.trim_start(), "compiled kernel");
        Ok(CompiledKernel {
            problem: problem.clone(),
            solution: solution.clone(),
            options,
        })
    }

    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        buffers: &mut WrwBuffers,
        args: &KernelArgs,
        geometry: &LaunchGeometry,
    ) -> Result<f64> {
        ensure!(self.profiling, "profiling is not enabled");
        ensure!(
            *geometry == kernel.solution.geometry,
            "launch geometry {geometry:?} differs from the compiled one"
        );
        let shape = buffers.image.shape();
        ensure!(
            shape == [
                args.batch_size as usize,
                args.channels as usize,
                args.height as usize,
                args.width as usize
            ],
            "kernel arguments {args:?} do not match buffers {shape:?}"
        );
        debug!(
            workgroups = ?geometry.workgroups(),
            waves_per_group = geometry.waves_per_group(),
            "launching {}",
            kernel.solution.kernel_name
        );

        for _ in 0..self.options.warmup_runs {
            self.run_once(kernel, buffers)?;
        }
        let runs = self.options.runs.max(1);
        let mut total = Duration::default();
        for _ in 0..runs {
            let start = Instant::now();
            self.run_once(kernel, buffers)?;
            total += start.elapsed();
        }
        Ok(total.as_secs_f64() * 1000.0 / runs as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convtune_kernels::PerformanceConfig;

    fn problem() -> ConvProblem {
        ConvProblem::new(2, 8, 8, 6, 10).with_device(host_device())
    }

    #[test]
    fn host_device_is_applicable() {
        assert!(ConvAsmBwdWrW3x3::new().is_applicable(&problem()));
    }

    #[test]
    fn seeded_buffers_are_reproducible() {
        let problem = problem();
        let a = WrwBuffers::seeded(&problem, 7);
        let b = WrwBuffers::seeded(&problem, 7);
        let c = WrwBuffers::seeded(&problem, 8);
        assert_eq!(a.image, b.image);
        assert_eq!(a.grad_output, b.grad_output);
        assert_ne!(a.image, c.image);
        assert_eq!(a.image.len() * 4, problem.image_bytes());
        assert_eq!(a.grad_weights.shape(), problem.weight_shape());
        assert!(a.image.iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn compile_rejects_inconsistent_solutions() {
        let problem = problem();
        let solver = ConvAsmBwdWrW3x3::new();
        let solution = solver.get_solution(&problem, &PerformanceConfig::new(0, 0, 8, 1, 2, 2));
        assert_eq!(solution.geometry.waves_per_group(), 2);
        assert_eq!(solution.geometry.workgroups(), [1, 1, 8]);
        let mut backend = CpuBackend::default();
        assert!(backend.compile(&problem, &solution).is_ok());

        let mut needs_workspace = solution.clone();
        needs_workspace.workspace_bytes = 1024;
        let err = backend.compile(&problem, &needs_workspace).unwrap_err();
        assert!(err.to_string().contains("workspace"));

        let mut narrow = solution;
        narrow.geometry.local[0] = 64;
        let err = backend.compile(&problem, &narrow).unwrap_err();
        assert!(err.to_string().contains("n_per_group 2"));
    }

    #[test]
    fn launch_requires_profiling() -> Result<()> {
        let problem = problem();
        let solver = ConvAsmBwdWrW3x3::new();
        let solution = solver.get_solution(&problem, &PerformanceConfig::new(0, 0, 8, 1, 2, 1));
        let mut backend = CpuBackend::default();
        let kernel = backend.compile(&problem, &solution)?;
        assert!(kernel.options.contains("-Wa,-defsym,chunk_size=8"));
        let mut buffers = backend.allocate(&problem, 1)?;
        let args = solver.kernel_args(&problem);

        assert!(backend
            .launch(&kernel, &mut buffers, &args, &solution.geometry)
            .is_err());

        backend.enable_profiling(true);
        let elapsed = backend.launch(&kernel, &mut buffers, &args, &solution.geometry)?;
        assert!(elapsed >= 0.0);
        assert!(buffers.grad_weights.iter().any(|v| *v != 0.0));
        Ok(())
    }

    #[test]
    fn compile_rejects_foreign_solution() {
        let problem = problem();
        let other = ConvProblem::new(2, 16, 8, 6, 10).with_device(host_device());
        let solution = ConvAsmBwdWrW3x3::new().get_solution(&other, &PerformanceConfig::MIN);
        assert!(CpuBackend::default().compile(&problem, &solution).is_err());
    }

    #[test]
    fn every_config_computes_the_same_gradient() -> Result<()> {
        let problem = problem();
        let solver = ConvAsmBwdWrW3x3::new();
        let mut backend = CpuBackend::new(CpuBackendOptions {
            warmup_runs: 0,
            runs: 1,
        });
        backend.enable_profiling(true);
        let mut buffers = backend.allocate(&problem, 3)?;
        let args = solver.kernel_args(&problem);

        let mut expected: Option<Array4<f32>> = None;
        for config in [
            PerformanceConfig::new(0, 0, 8, 1, 1, 1),
            PerformanceConfig::new(0, 1, 8, 2, 3, 2),
            PerformanceConfig::new(0, 0, 16, 4, 6, 2),
        ] {
            assert!(config.is_valid(&problem), "{config}");
            let solution = solver.get_solution(&problem, &config);
            let kernel = backend.compile(&problem, &solution)?;
            backend.launch(&kernel, &mut buffers, &args, &solution.geometry)?;
            match &expected {
                None => expected = Some(buffers.grad_weights.clone()),
                Some(reference) => {
                    let max_err = (&buffers.grad_weights - reference)
                        .iter()
                        .fold(0.0f32, |acc, v| acc.max(v.abs()));
                    assert!(max_err < 1e-3, "{config}: {max_err}");
                }
            }
        }
        Ok(())
    }
}

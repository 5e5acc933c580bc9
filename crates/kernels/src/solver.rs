//! The 3x3 backward-weights assembler solver: applicability, initial
//! configuration and kernel construction parameters.

use crate::config::{ConvProblem, TensorLayout};
use crate::error::{OverrideError, ProblemError};
use crate::limits::{HardwareLimits, WAVE_SIZE};
use crate::perf_config::PerformanceConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::info;

/// Workgroup and grid sizes, in work-items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub local: [usize; 3],
    pub global: [usize; 3],
}

impl LaunchGeometry {
    pub fn workgroups(&self) -> [usize; 3] {
        let mut groups = [0; 3];
        for (slot, (global, local)) in groups.iter_mut().zip(self.global.iter().zip(&self.local)) {
            *slot = if *local == 0 { 0 } else { global / local };
        }
        groups
    }

    pub fn waves_per_group(&self) -> usize {
        self.local.iter().product::<usize>() / WAVE_SIZE as usize
    }
}

/// Everything the build collaborator needs to assemble a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSolution {
    pub kernel_file: String,
    pub kernel_name: String,
    pub defsyms: Vec<(String, i64)>,
    pub geometry: LaunchGeometry,
    pub config: PerformanceConfig,
    pub workspace_bytes: usize,
}

impl KernelSolution {
    /// Assembler options, one `-defsym` per symbol.
    pub fn compile_options(&self) -> String {
        let mut options = String::new();
        for (name, value) in &self.defsyms {
            let _ = write!(options, " -Wa,-defsym,{name}={value}");
        }
        options
    }

    pub fn defsym(&self, name: &str) -> Option<i64> {
        self.defsyms
            .iter()
            .find(|(symbol, _)| symbol == name)
            .map(|(_, value)| *value)
    }
}

/// Scalar arguments passed to the kernel in launch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelArgs {
    pub batch_size: i32,
    pub channels: i32,
    pub height: i32,
    pub width: i32,
    pub filters: i32,
    pub n_groups: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ConvAsmBwdWrW3x3 {
    limits: HardwareLimits,
}

impl ConvAsmBwdWrW3x3 {
    pub const KERNEL_FILE: &'static str = "conv3x3wrw.s";
    pub const KERNEL_NAME: &'static str = "gcnAsmConv3x3WrW";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: HardwareLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &HardwareLimits {
        &self.limits
    }

    pub fn is_applicable(&self, problem: &ConvProblem) -> bool {
        self.check_applicable(problem).is_ok()
    }

    /// Report the first reason the kernel cannot run `problem`.
    ///
    /// Size products are taken in 64 bits so the 32-bit kernel arguments
    /// derived from them are known not to overflow.
    pub fn check_applicable(&self, problem: &ConvProblem) -> Result<(), ProblemError> {
        let device = &problem.device;
        if !device.assembler_available {
            return Err(ProblemError::NoAssembler {
                device: device.name.clone(),
            });
        }
        if !device.name.contains("gfx8") && !device.name.contains("gfx9") {
            return Err(ProblemError::UnsupportedDevice {
                device: device.name.clone(),
            });
        }
        let shape_ok = problem.pad_w == 1
            && problem.pad_h == 1
            && problem.stride_w <= 2
            && problem.stride_h <= 2
            && problem.stride_w >= 1
            && problem.stride_h >= 1
            && problem.kernel_w == 3
            && problem.kernel_h == 3
            && problem.dilation_w == 1
            && problem.dilation_h == 1
            && !problem.bias
            && problem.layout == TensorLayout::Nchw;
        if !shape_ok {
            return Err(ProblemError::UnsupportedShape(
                "requires 3x3 filter, pad 1, stride <= 2, dilation 1, no bias, NCHW",
            ));
        }
        if problem.out_width == 0 || problem.out_width > 512 {
            return Err(ProblemError::UnsupportedShape("image width must be in 1..=512"));
        }
        if problem.out_height == 0 || problem.batch_size == 0 {
            return Err(ProblemError::UnsupportedShape("empty image or batch"));
        }
        if problem.n_inputs == 0 || problem.n_outputs == 0 {
            return Err(ProblemError::UnsupportedShape("empty channel dimension"));
        }
        let channels_ok = if problem.is_unit_stride() {
            problem.n_outputs % 4 == 0 || problem.n_inputs % 4 == 0
        } else {
            problem.n_outputs % 4 == 0
        };
        if !channels_ok {
            return Err(ProblemError::UnsupportedShape(
                "channel counts are not divisible by 4",
            ));
        }

        const L16: u64 = 1 << 16;
        const L22: u64 = 1 << 22;
        const L29: u64 = 1 << 29;

        let h = problem.out_height as u64;
        let n = problem.batch_size as u64;
        let c = problem.n_outputs as u64;
        let k = problem.n_inputs as u64;
        check_bounds(&[("H", h, L16), ("N", n, L16), ("C", c, L16), ("K", k, L16)])?;

        // Saturate instead of wrapping on oversized extents.
        let h_w = h.saturating_mul(problem.out_width as u64);
        let r_s = (problem.kernel_h as u64).saturating_mul(problem.kernel_w as u64);
        check_bounds(&[
            ("C*H*W", c.saturating_mul(h_w), L22),
            ("K*H*W", k.saturating_mul(h_w), L22),
            ("C*R*S", c.saturating_mul(r_s), L22),
            ("K*R*S", k.saturating_mul(r_s), L22),
            ("N*C*H*W", n.saturating_mul(c).saturating_mul(h_w), L29),
            ("N*K*H*W", n.saturating_mul(k).saturating_mul(h_w), L29),
            ("C*K*R*S", c.saturating_mul(k).saturating_mul(r_s), L29),
        ])?;
        Ok(())
    }

    pub fn is_valid_performance_config(
        &self,
        problem: &ConvProblem,
        config: &PerformanceConfig,
    ) -> bool {
        config.is_valid_range() && config.is_valid_with(problem, &self.limits)
    }

    pub fn heuristic_config(&self, problem: &ConvProblem) -> PerformanceConfig {
        PerformanceConfig::heuristic_with(problem, &self.limits)
    }

    /// Pick the initial config: an explicit perf-values string wins over the
    /// heuristic. A blank string counts as unset.
    pub fn init_performance_config(
        &self,
        problem: &ConvProblem,
        perf_vals: Option<&str>,
    ) -> Result<PerformanceConfig, OverrideError> {
        match perf_vals.filter(|value| !value.is_empty()) {
            Some(value) => {
                let config = parse_override(problem, value, &self.limits)?;
                info!(config = %config, "performance config from override");
                Ok(config)
            }
            None => {
                let config = self.heuristic_config(problem);
                info!(config = %config, "heuristic performance config");
                Ok(config)
            }
        }
    }

    pub fn get_solution(
        &self,
        problem: &ConvProblem,
        config: &PerformanceConfig,
    ) -> KernelSolution {
        let c_per_wave = config.c_per_wave() as usize;
        let k_per_wave = config.k_per_wave as usize;
        let n_per_group = config.n_per_group as usize;

        let symbols: [(&str, i64); 21] = [
            ("batch_size", problem.batch_size as i64),
            ("img_h", problem.out_height as i64),
            ("img_w", problem.out_width as i64),
            ("input_channels", problem.n_outputs as i64),
            ("output_channels", problem.n_inputs as i64),
            ("wei_h", problem.kernel_h as i64),
            ("wei_w", problem.kernel_w as i64),
            ("pad_h", problem.pad_h as i64),
            ("pad_w", problem.pad_w as i64),
            ("stride_h", problem.stride_h as i64),
            ("stride_w", problem.stride_w as i64),
            ("weights_layout", 0),
            ("reverse_weights", 0),
            ("limit_wave_cnt", i64::from(config.limit_wave_cnt)),
            ("chunk_size", i64::from(config.chunk_size)),
            ("c_per_wave", c_per_wave as i64),
            ("k_per_wave", i64::from(config.k_per_wave)),
            ("n_per_group", i64::from(config.n_per_group)),
            ("pipe_lines_depth", i64::from(config.pipe_lines_depth)),
            ("reverse_inout", i64::from(config.reverse_inout)),
            ("enable_debug_output", 0),
        ];

        let group = WAVE_SIZE as usize * n_per_group;
        let (grid_y, grid_z) = if config.is_reversed() {
            (problem.n_outputs / k_per_wave, problem.n_inputs / c_per_wave)
        } else {
            (problem.n_outputs / c_per_wave, problem.n_inputs / k_per_wave)
        };

        KernelSolution {
            kernel_file: Self::KERNEL_FILE.to_string(),
            kernel_name: Self::KERNEL_NAME.to_string(),
            defsyms: symbols
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            geometry: LaunchGeometry {
                local: [group, 1, 1],
                global: [group, grid_y, grid_z],
            },
            config: *config,
            workspace_bytes: 0,
        }
    }

    /// Arguments for an applicable problem; those fit in 32 bits.
    pub fn kernel_args(&self, problem: &ConvProblem) -> KernelArgs {
        KernelArgs {
            batch_size: problem.batch_size as i32,
            channels: problem.n_outputs as i32,
            height: problem.out_height as i32,
            width: problem.out_width as i32,
            filters: problem.n_inputs as i32,
            n_groups: problem.device.max_compute_units as i32,
        }
    }
}

fn check_bounds(bounds: &[(&'static str, u64, u64)]) -> Result<(), ProblemError> {
    for &(quantity, value, limit) in bounds {
        if value >= limit {
            return Err(ProblemError::LimitExceeded {
                quantity,
                value,
                limit,
            });
        }
    }
    Ok(())
}

/// Deserialize and validate a perf-values string for `problem`.
pub fn parse_override(
    problem: &ConvProblem,
    value: &str,
    limits: &HardwareLimits,
) -> Result<PerformanceConfig, OverrideError> {
    let config: PerformanceConfig = value.parse().map_err(|source| OverrideError::Malformed {
        value: value.to_string(),
        source,
    })?;
    config
        .check(problem, limits)
        .map_err(|source| OverrideError::Invalid {
            value: value.to_string(),
            source,
        })?;
    Ok(config)
}

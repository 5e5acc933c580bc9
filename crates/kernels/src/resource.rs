//! Closed-form register, LDS and instruction estimates for a candidate.
//!
//! This stands in for compiling the kernel and inspecting its allocation, so
//! it errs on the conservative side. The arithmetic mirrors the assembler
//! source's own bookkeeping and must stay bit-exact with it.

use crate::config::ConvProblem;
use crate::limits::{HardwareLimits, WAVE_SIZE};
use crate::perf_config::PerformanceConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub accums: i64,
    pub gprs_per_line_in: i64,
    pub gprs_per_line_out: i64,
    pub lines_in: i64,
    pub lines_out: i64,
    pub vgprs: i64,
    pub lds_bytes: i64,
    pub instructions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceViolation {
    #[error("estimate undefined: {0} divisor is not positive")]
    Degenerate(&'static str),
    #[error("{used} vgprs exceed the limit of {limit}")]
    Vgprs { used: i64, limit: i64 },
    #[error("limit_wave_cnt {limit_wave_cnt} cannot host {n_per_group} waves per group")]
    WaveSlots { limit_wave_cnt: i32, n_per_group: i32 },
    #[error("{used} LDS bytes exceed the limit of {limit}")]
    Lds { used: i64, limit: i64 },
    #[error("~{estimated} instructions reach the budget of {budget}")]
    Instructions { estimated: i64, budget: i64 },
}

impl ResourceEstimate {
    /// Evaluate the model. Expects a range-valid config.
    pub fn compute(
        config: &PerformanceConfig,
        problem: &ConvProblem,
        limits: &HardwareLimits,
    ) -> Result<Self, ResourceViolation> {
        let wave = i64::from(WAVE_SIZE);
        let chunk = i64::from(config.chunk_size);
        let k_per_wave = i64::from(config.k_per_wave);
        let depth = i64::from(config.pipe_lines_depth);
        let n_per_group = i64::from(config.n_per_group);

        let kernel_h = problem.kernel_h as i64;
        let kernel_w = problem.kernel_w as i64;
        let stride_h = problem.stride_h as i64;
        let stride_w = problem.stride_w as i64;
        let out_w = problem.out_width as i64;
        let out_h = problem.out_height as i64;

        if chunk <= 0 {
            return Err(ResourceViolation::Degenerate("chunk_size"));
        }
        if stride_h <= 0 || stride_w <= 0 {
            return Err(ResourceViolation::Degenerate("stride"));
        }
        let c_per_wave = wave / chunk;
        let accums = (kernel_w * kernel_h * c_per_wave * k_per_wave * chunk) / wave;

        let mut gprs_per_line_in = if config.chunk_size == 16 {
            (out_w + chunk - 1) / chunk
        } else {
            let divisor = chunk - problem.pad_w as i64;
            if divisor <= 0 {
                return Err(ResourceViolation::Degenerate("chunk_size - pad_w"));
            }
            (out_w + divisor - 1) / divisor
        };
        // Adds the remainder rather than rounding up to a stride multiple.
        gprs_per_line_in += gprs_per_line_in % stride_w;
        let gprs_per_line_out = if gprs_per_line_in > 1 {
            gprs_per_line_in / stride_w
        } else {
            1
        };

        let lines_in = depth + kernel_h - 1;
        let lines_out = (depth + stride_h - 1) / stride_h;
        let vgprs = accums
            + lines_in * gprs_per_line_in
            + lines_out * gprs_per_line_out
            + limits.vgpr_overhead;

        let lds_bytes = (n_per_group - 1) * wave * std::mem::size_of::<f32>() as i64 * accums;

        let unroll_factor = depth * (depth + 2);
        if unroll_factor <= 0 {
            return Err(ResourceViolation::Degenerate("unroll factor"));
        }
        let steps = (out_h - 1 - depth).max(0);
        let loops = depth + unroll_factor + steps % unroll_factor + 1;
        let m_instr = 3 + (gprs_per_line_in + 3) / 4;
        let v_instr = (k_per_wave * kernel_h * gprs_per_line_out * kernel_w * 4) / 3;
        let instructions = loops * (m_instr + v_instr);

        Ok(Self {
            accums,
            gprs_per_line_in,
            gprs_per_line_out,
            lines_in,
            lines_out,
            vgprs,
            lds_bytes,
            instructions,
        })
    }

    /// Apply the budgets in the order the assembler source checks them.
    pub fn check(
        &self,
        config: &PerformanceConfig,
        limits: &HardwareLimits,
    ) -> Result<(), ResourceViolation> {
        if self.vgprs > limits.max_vgprs {
            return Err(ResourceViolation::Vgprs {
                used: self.vgprs,
                limit: limits.max_vgprs,
            });
        }
        if config.n_per_group > limits.wide_group_threshold
            && self.vgprs > limits.max_vgprs_wide_group
        {
            return Err(ResourceViolation::Vgprs {
                used: self.vgprs,
                limit: limits.max_vgprs_wide_group,
            });
        }
        if config.limit_wave_cnt != 0
            && config.limit_wave_cnt * limits.waves_per_limit_unit < config.n_per_group
        {
            return Err(ResourceViolation::WaveSlots {
                limit_wave_cnt: config.limit_wave_cnt,
                n_per_group: config.n_per_group,
            });
        }
        if self.lds_bytes > limits.lds_bytes {
            return Err(ResourceViolation::Lds {
                used: self.lds_bytes,
                limit: limits.lds_bytes,
            });
        }
        if self.instructions >= limits.instruction_budget {
            return Err(ResourceViolation::Instructions {
                estimated: self.instructions,
                budget: limits.instruction_budget,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf_config::ConfigViolation;

    fn estimate(config: PerformanceConfig, problem: &ConvProblem) -> ResourceEstimate {
        ResourceEstimate::compute(&config, problem, &HardwareLimits::default()).unwrap()
    }

    #[test]
    fn chunk8_uses_padded_divisor() {
        let problem = ConvProblem::new(8, 64, 64, 16, 32);
        let est = estimate(PerformanceConfig::new(0, 0, 8, 2, 2, 4), &problem);
        assert_eq!(est.accums, 18);
        // (32 + 8 - 1 - 1) / 7
        assert_eq!(est.gprs_per_line_in, 5);
        assert_eq!(est.gprs_per_line_out, 5);
        assert_eq!(est.lines_in, 4);
        assert_eq!(est.lines_out, 2);
        assert_eq!(est.vgprs, 18 + 4 * 5 + 2 * 5 + 6);
        assert_eq!(est.lds_bytes, 3 * 64 * 4 * 18);
        assert_eq!(est.instructions, 16 * (5 + 120));
    }

    #[test]
    fn stride_adds_remainder() {
        let problem = ConvProblem::new(1, 16, 16, 16, 48).with_stride(2, 2);
        let est = estimate(PerformanceConfig::new(0, 0, 16, 1, 1, 1), &problem);
        // 48 / 16 = 3, plus 3 % 2
        assert_eq!(est.gprs_per_line_in, 4);
        assert_eq!(est.gprs_per_line_out, 2);
        assert_eq!(est.lines_out, 1);
    }

    #[test]
    fn wide_groups_get_half_the_registers() {
        let limits = HardwareLimits::default();
        let config = PerformanceConfig::new(0, 0, 8, 1, 1, 5);
        let est = ResourceEstimate {
            accums: 0,
            gprs_per_line_in: 0,
            gprs_per_line_out: 0,
            lines_in: 0,
            lines_out: 0,
            vgprs: 129,
            lds_bytes: 0,
            instructions: 0,
        };
        assert!(matches!(
            est.check(&config, &limits),
            Err(ResourceViolation::Vgprs { limit: 128, .. })
        ));
        let narrow = PerformanceConfig::new(0, 0, 8, 1, 1, 4);
        assert!(est.check(&narrow, &limits).is_ok());
    }

    fn usage(vgprs: i64, lds_bytes: i64, instructions: i64) -> ResourceEstimate {
        ResourceEstimate {
            accums: 0,
            gprs_per_line_in: 0,
            gprs_per_line_out: 0,
            lines_in: 0,
            lines_out: 0,
            vgprs,
            lds_bytes,
            instructions,
        }
    }

    #[test]
    fn register_ceiling_is_inclusive() {
        let limits = HardwareLimits::default();
        let config = PerformanceConfig::new(0, 0, 8, 1, 1, 4);
        assert!(usage(256, 0, 0).check(&config, &limits).is_ok());
        assert_eq!(
            usage(257, 0, 0).check(&config, &limits),
            Err(ResourceViolation::Vgprs {
                used: 257,
                limit: 256
            })
        );
    }

    #[test]
    fn lds_ceiling_is_inclusive() {
        let limits = HardwareLimits::default();
        let config = PerformanceConfig::new(0, 0, 8, 1, 1, 2);
        assert!(usage(64, 65536, 0).check(&config, &limits).is_ok());
        assert_eq!(
            usage(64, 65537, 0).check(&config, &limits),
            Err(ResourceViolation::Lds {
                used: 65537,
                limit: 65536
            })
        );
    }

    #[test]
    fn instruction_budget_is_exclusive() {
        let limits = HardwareLimits::default();
        let config = PerformanceConfig::new(0, 0, 8, 1, 1, 1);
        assert!(usage(64, 0, 31999).check(&config, &limits).is_ok());
        assert_eq!(
            usage(64, 0, 32000).check(&config, &limits),
            Err(ResourceViolation::Instructions {
                estimated: 32000,
                budget: 32000
            })
        );
    }

    #[test]
    fn deep_pipeline_on_wide_image_exceeds_instruction_budget() {
        let limits = HardwareLimits::default();
        let problem = ConvProblem::new(1, 64, 64, 64, 128);
        let config = PerformanceConfig::new(0, 0, 16, 4, 12, 1);
        let est = estimate(config, &problem);
        // 36 + 14 * 8 + 12 * 8 + 6
        assert_eq!(est.vgprs, 250);
        // (12 + 168 + 51 + 1) * (5 + 384)
        assert_eq!(est.instructions, 232 * 389);
        assert_eq!(
            est.check(&config, &limits),
            Err(ResourceViolation::Instructions {
                estimated: 90248,
                budget: 32000
            })
        );
        assert_eq!(
            config.check(&problem, &limits),
            Err(ConfigViolation::Resources(ResourceViolation::Instructions {
                estimated: 90248,
                budget: 32000
            }))
        );
    }

    #[test]
    fn eight_images_per_group_exceed_lds() {
        let limits = HardwareLimits::default();
        let problem = ConvProblem::new(8, 64, 64, 4, 8);
        let config = PerformanceConfig::new(0, 0, 8, 8, 1, 8);
        let est = estimate(config, &problem);
        assert_eq!(est.accums, 72);
        // 72 + 3 * 2 + 1 * 2 + 6, under the wide-group limit
        assert_eq!(est.vgprs, 86);
        assert_eq!(est.lds_bytes, 7 * 64 * 4 * 72);
        assert_eq!(
            config.check(&problem, &limits),
            Err(ConfigViolation::Resources(ResourceViolation::Lds {
                used: 129024,
                limit: 65536
            }))
        );
    }

    #[test]
    fn wave_slots_follow_limit() {
        let limits = HardwareLimits::default();
        let problem = ConvProblem::new(8, 64, 64, 16, 32);
        let config = PerformanceConfig::new(1, 0, 16, 1, 1, 5);
        let est = estimate(config, &problem);
        assert!(matches!(
            est.check(&config, &limits),
            Err(ResourceViolation::WaveSlots { .. })
        ));
        let unlimited = PerformanceConfig::new(0, 0, 16, 1, 1, 5);
        assert!(est.check(&unlimited, &limits).is_ok());
    }

    #[test]
    fn oversized_pad_is_degenerate() {
        let problem = ConvProblem::new(1, 8, 8, 8, 8).with_padding(8, 8);
        let result = ResourceEstimate::compute(
            &PerformanceConfig::new(0, 0, 8, 1, 1, 1),
            &problem,
            &HardwareLimits::default(),
        );
        assert!(matches!(result, Err(ResourceViolation::Degenerate(_))));
    }
}

//! Hardware budgets used by the resource model.
//!
//! The defaults describe a GCN (gfx8/gfx9) compute unit. They are estimates
//! of what the assembler kernel can afford, not exact device limits.

use serde::{Deserialize, Serialize};

/// Threads per wave.
pub const WAVE_SIZE: i32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareLimits {
    /// Vector registers available to one wave.
    pub max_vgprs: i64,
    /// Register budget once a workgroup holds more than `wide_group_threshold` waves.
    pub max_vgprs_wide_group: i64,
    pub wide_group_threshold: i32,
    /// Registers reserved by the kernel outside accumulators and line buffers.
    pub vgpr_overhead: i64,
    /// Local data share bytes per workgroup.
    pub lds_bytes: i64,
    /// Upper bound (exclusive) on the unrolled instruction estimate.
    pub instruction_budget: i64,
    /// Waves granted per unit of `limit_wave_cnt`.
    pub waves_per_limit_unit: i32,
}

impl Default for HardwareLimits {
    fn default() -> Self {
        Self {
            max_vgprs: 256,
            max_vgprs_wide_group: 128,
            wide_group_threshold: 4,
            vgpr_overhead: 6,
            lds_bytes: 65536,
            instruction_budget: 32000,
            waves_per_limit_unit: 4,
        }
    }
}

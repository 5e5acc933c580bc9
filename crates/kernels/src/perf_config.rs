//! Tunable launch parameters of the 3x3 WrW kernel and their legality rules.

use crate::config::ConvProblem;
use crate::limits::{HardwareLimits, WAVE_SIZE};
use crate::resource::{ResourceEstimate, ResourceViolation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_LIMIT_WAVE_CNT: i32 = 9;
pub const CHUNK_SIZES: [i32; 2] = [8, 16];
pub const K_PER_WAVE_VALUES: [i32; 4] = [1, 2, 4, 8];
pub const MAX_PIPE_LINES_DEPTH: i32 = 16;
pub const MAX_N_PER_GROUP: i32 = 8;

const FIELD_COUNT: usize = 6;

/// One point of the search space.
///
/// Fields are plain integers so that deserialized values can be carried
/// around before they are checked; use [`PerformanceConfig::is_valid`]
/// before handing one to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PerformanceConfig {
    /// [0..9], 0 means unlimited.
    pub limit_wave_cnt: i32,
    /// [0..1], 1 is allowed for stride 1x1 only.
    pub reverse_inout: i32,
    /// {8,16}. Smaller values increase register pressure.
    pub chunk_size: i32,
    /// {1,2,4,8} and chunk_size * k_per_wave <= 64.
    pub k_per_wave: i32,
    /// [1..16] and not above the image height.
    pub pipe_lines_depth: i32,
    /// [1..8] and not above the batch size.
    pub n_per_group: i32,
}

/// First problem-coupled rule a config breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigViolation {
    #[error("a field is outside its admissible range")]
    OutOfRange,
    #[error("neither channel count is divisible by {c_per_wave}")]
    ChannelsPerWave { c_per_wave: i32 },
    #[error("active channel count is not divisible by {c_per_wave}")]
    ActiveChannels { c_per_wave: i32 },
    #[error("chunk_size * k_per_wave = {product} exceeds 64")]
    ChunkTimesKPerWave { product: i32 },
    #[error("other channel count is not divisible by k_per_wave {k_per_wave}")]
    KPerWave { k_per_wave: i32 },
    #[error("n_per_group {n_per_group} exceeds batch size {batch_size}")]
    NPerGroup { n_per_group: i32, batch_size: usize },
    #[error("pipe_lines_depth {depth} is outside 1..={max}")]
    PipeLinesDepth { depth: i32, max: usize },
    #[error("reverse_inout requires a 1x1 stride")]
    ReverseStride,
    #[error(transparent)]
    Resources(#[from] ResourceViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseConfigError {
    #[error("expected 6 comma-separated fields, found {found}")]
    FieldCount { found: usize },
    #[error("field {index} ({value:?}) is not an integer: {source}")]
    Field {
        index: usize,
        value: String,
        source: ParseIntError,
    },
}

impl PerformanceConfig {
    /// Starting point of the search space.
    pub const MIN: Self = Self::new(0, 0, 8, 1, 1, 1);

    /// Fallback used when the heuristic lands on an illegal point.
    pub const CONSERVATIVE: Self = Self::new(0, 0, 16, 1, 2, 1);

    pub const fn new(
        limit_wave_cnt: i32,
        reverse_inout: i32,
        chunk_size: i32,
        k_per_wave: i32,
        pipe_lines_depth: i32,
        n_per_group: i32,
    ) -> Self {
        Self {
            limit_wave_cnt,
            reverse_inout,
            chunk_size,
            k_per_wave,
            pipe_lines_depth,
            n_per_group,
        }
    }

    pub fn is_reversed(&self) -> bool {
        self.reverse_inout != 0
    }

    /// Channels handled per wave; defined for range-valid configs only.
    pub fn c_per_wave(&self) -> i32 {
        debug_assert!(self.chunk_size > 0);
        WAVE_SIZE / self.chunk_size
    }

    pub fn is_valid_range(&self) -> bool {
        (0..=MAX_LIMIT_WAVE_CNT).contains(&self.limit_wave_cnt)
            && (0..=1).contains(&self.reverse_inout)
            && CHUNK_SIZES.contains(&self.chunk_size)
            && K_PER_WAVE_VALUES.contains(&self.k_per_wave)
            && (1..=MAX_PIPE_LINES_DEPTH).contains(&self.pipe_lines_depth)
            && (1..=MAX_N_PER_GROUP).contains(&self.n_per_group)
    }

    pub fn is_valid(&self, problem: &ConvProblem) -> bool {
        self.is_valid_with(problem, &HardwareLimits::default())
    }

    pub fn is_valid_with(&self, problem: &ConvProblem, limits: &HardwareLimits) -> bool {
        self.check(problem, limits).is_ok()
    }

    /// Short-circuit legality check reporting the first broken rule.
    pub fn check(
        &self,
        problem: &ConvProblem,
        limits: &HardwareLimits,
    ) -> Result<(), ConfigViolation> {
        if !self.is_valid_range() {
            return Err(ConfigViolation::OutOfRange);
        }
        let c_per_wave = self.c_per_wave();
        if !divisible(problem.n_outputs, c_per_wave) && !divisible(problem.n_inputs, c_per_wave) {
            return Err(ConfigViolation::ChannelsPerWave { c_per_wave });
        }
        if !divisible(self.active_channels(problem), c_per_wave) {
            return Err(ConfigViolation::ActiveChannels { c_per_wave });
        }
        let product = self.chunk_size * self.k_per_wave;
        if product > WAVE_SIZE {
            return Err(ConfigViolation::ChunkTimesKPerWave { product });
        }
        if !divisible(self.other_channels(problem), self.k_per_wave) {
            return Err(ConfigViolation::KPerWave {
                k_per_wave: self.k_per_wave,
            });
        }
        if self.n_per_group as usize > problem.batch_size {
            return Err(ConfigViolation::NPerGroup {
                n_per_group: self.n_per_group,
                batch_size: problem.batch_size,
            });
        }
        let max_depth = problem.out_height.min(MAX_PIPE_LINES_DEPTH as usize);
        if self.pipe_lines_depth as usize > max_depth {
            return Err(ConfigViolation::PipeLinesDepth {
                depth: self.pipe_lines_depth,
                max: max_depth,
            });
        }
        if self.is_reversed() && !problem.is_unit_stride() {
            return Err(ConfigViolation::ReverseStride);
        }
        ResourceEstimate::compute(self, problem, limits)?.check(self, limits)?;
        Ok(())
    }

    /// Derive a starting point from problem sizes without measuring.
    pub fn heuristic(problem: &ConvProblem) -> Self {
        Self::heuristic_with(problem, &HardwareLimits::default())
    }

    pub fn heuristic_with(problem: &ConvProblem, limits: &HardwareLimits) -> Self {
        let n_inputs = problem.n_inputs;
        let n_outputs = problem.n_outputs;

        let mut chunk_size = if problem.out_width < 48 { 8 } else { 16 };
        let c_per_wave = WAVE_SIZE / chunk_size;
        if !divisible(n_outputs, c_per_wave) && !divisible(n_inputs, c_per_wave) {
            chunk_size = 16;
        }

        let reverse_inout = i32::from(
            problem.is_unit_stride() && (!divisible(n_outputs, 4) || problem.out_width < 8),
        );

        let c_k = n_outputs.saturating_mul(n_inputs);
        let mut k_per_wave = if c_k < 256 {
            1
        } else if c_k < 16384 {
            2
        } else if chunk_size == 8 {
            2
        } else {
            4
        };
        let other = if reverse_inout != 0 { n_outputs } else { n_inputs };
        while !divisible(other, k_per_wave) {
            k_per_wave /= 2;
        }

        let mut n_per_group: i32 = if c_k <= 512 {
            8
        } else if c_k <= 4096 {
            4
        } else if c_k <= 8192 {
            2
        } else {
            1
        };
        if n_per_group as usize > problem.batch_size {
            n_per_group = problem.batch_size as i32;
        }
        if problem.out_width >= 256 && n_per_group > 4 {
            n_per_group = 4;
        }

        let mut pipe_lines_depth = if problem.out_height <= 1 { 1 } else { 2 };
        if problem.out_height < 8 && problem.out_width < 64 {
            pipe_lines_depth = problem.out_height as i32;
        }

        let config = Self::new(
            0,
            reverse_inout,
            chunk_size,
            k_per_wave,
            pipe_lines_depth,
            n_per_group,
        );
        if config.is_valid_with(problem, limits) {
            return config;
        }

        let mut fallback = Self::CONSERVATIVE;
        // Single-row images cannot pipeline two lines.
        fallback.pipe_lines_depth = fallback.pipe_lines_depth.min(problem.out_height as i32);
        if !divisible(n_outputs, 4) {
            // Applicable problems have C or K divisible by 4; with c_per_wave = 4
            // and k_per_wave = 1, swapping the roles always satisfies both.
            fallback.reverse_inout = 1;
        }
        tracing::info!(
            heuristic = %config,
            fallback = %fallback,
            "heuristic config is not valid, using conservative config"
        );
        debug_assert!(
            fallback.is_valid_with(problem, limits),
            "conservative config {fallback} must be valid for an applicable problem"
        );
        fallback
    }

    /// Parse the comma-separated form. The result is not checked for legality.
    pub fn deserialize(text: &str) -> Result<Self, ParseConfigError> {
        text.parse()
    }

    fn active_channels(&self, problem: &ConvProblem) -> usize {
        if self.is_reversed() {
            problem.n_inputs
        } else {
            problem.n_outputs
        }
    }

    fn other_channels(&self, problem: &ConvProblem) -> usize {
        if self.is_reversed() {
            problem.n_outputs
        } else {
            problem.n_inputs
        }
    }
}

fn divisible(count: usize, divisor: i32) -> bool {
    divisor > 0 && count % divisor as usize == 0
}

impl fmt::Display for PerformanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.limit_wave_cnt,
            self.reverse_inout,
            self.chunk_size,
            self.k_per_wave,
            self.pipe_lines_depth,
            self.n_per_group
        )
    }
}

impl FromStr for PerformanceConfig {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != FIELD_COUNT {
            return Err(ParseConfigError::FieldCount { found: parts.len() });
        }
        let mut fields = [0i32; FIELD_COUNT];
        for (index, (slot, part)) in fields.iter_mut().zip(&parts).enumerate() {
            *slot = part
                .trim()
                .parse()
                .map_err(|source| ParseConfigError::Field {
                    index,
                    value: part.to_string(),
                    source,
                })?;
        }
        let [limit_wave_cnt, reverse_inout, chunk_size, k_per_wave, pipe_lines_depth, n_per_group] =
            fields;
        Ok(Self::new(
            limit_wave_cnt,
            reverse_inout,
            chunk_size,
            k_per_wave,
            pipe_lines_depth,
            n_per_group,
        ))
    }
}

impl From<PerformanceConfig> for String {
    fn from(config: PerformanceConfig) -> Self {
        config.to_string()
    }
}

impl TryFrom<String> for PerformanceConfig {
    type Error = ParseConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

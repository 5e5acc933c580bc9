//! Lazy traversal of the legal performance configs for one problem.
//!
//! The six fields form a mixed-radix counter. `limit_wave_cnt` is the least
//! significant digit (and stays at 0 unless searching it is enabled),
//! followed by `reverse_inout`, `chunk_size`, `k_per_wave`,
//! `pipe_lines_depth` and `n_per_group`.

use convtune_kernels::{
    ConvProblem, HardwareLimits, PerformanceConfig, MAX_LIMIT_WAVE_CNT, MAX_N_PER_GROUP,
    MAX_PIPE_LINES_DEPTH,
};

/// Step the odometer once, ignoring legality. `None` once every digit has
/// wrapped around.
pub fn advance(
    config: &PerformanceConfig,
    search_limit_wave_cnt: bool,
) -> Option<PerformanceConfig> {
    let mut next = *config;

    if search_limit_wave_cnt {
        next.limit_wave_cnt += 1;
        if next.limit_wave_cnt <= MAX_LIMIT_WAVE_CNT {
            return Some(next);
        }
    }
    next.limit_wave_cnt = 0;

    next.reverse_inout += 1;
    if next.reverse_inout <= 1 {
        return Some(next);
    }
    next.reverse_inout = 0;

    next.chunk_size += 8;
    if next.chunk_size <= 16 {
        return Some(next);
    }
    next.chunk_size = 8;

    match next.k_per_wave {
        1 | 2 | 4 => {
            next.k_per_wave *= 2;
            return Some(next);
        }
        _ => next.k_per_wave = 1,
    }

    next.pipe_lines_depth += 1;
    if next.pipe_lines_depth <= MAX_PIPE_LINES_DEPTH {
        return Some(next);
    }
    next.pipe_lines_depth = 1;

    next.n_per_group += 1;
    if next.n_per_group <= MAX_N_PER_GROUP {
        return Some(next);
    }
    None
}

/// The legal subset of the search space for a problem. Nothing is
/// materialized; iterate it as often as needed.
#[derive(Debug, Clone)]
pub struct ConfigSpace<'p> {
    problem: &'p ConvProblem,
    limits: HardwareLimits,
    search_limit_wave_cnt: bool,
}

impl<'p> ConfigSpace<'p> {
    pub fn new(problem: &'p ConvProblem) -> Self {
        Self {
            problem,
            limits: HardwareLimits::default(),
            search_limit_wave_cnt: false,
        }
    }

    pub fn with_limits(mut self, limits: HardwareLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn search_limit_wave_cnt(mut self, enabled: bool) -> Self {
        self.search_limit_wave_cnt = enabled;
        self
    }

    pub fn problem(&self) -> &ConvProblem {
        self.problem
    }

    pub fn contains(&self, config: &PerformanceConfig) -> bool {
        config.is_valid_with(self.problem, &self.limits)
    }

    pub fn iter(&self) -> SpaceIter<'_, 'p> {
        let start = PerformanceConfig::MIN;
        let next = if self.contains(&start) {
            Some(start)
        } else {
            self.next_legal(&start)
        };
        SpaceIter { space: self, next }
    }

    /// Number of legal configs; walks the whole space.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    fn next_legal(&self, from: &PerformanceConfig) -> Option<PerformanceConfig> {
        let mut current = *from;
        loop {
            current = advance(&current, self.search_limit_wave_cnt)?;
            if self.contains(&current) {
                return Some(current);
            }
        }
    }
}

impl<'s, 'p> IntoIterator for &'s ConfigSpace<'p> {
    type Item = PerformanceConfig;
    type IntoIter = SpaceIter<'s, 'p>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Forward-only cursor over a [`ConfigSpace`].
#[derive(Debug, Clone)]
pub struct SpaceIter<'s, 'p> {
    space: &'s ConfigSpace<'p>,
    next: Option<PerformanceConfig>,
}

impl Iterator for SpaceIter<'_, '_> {
    type Item = PerformanceConfig;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = self.space.next_legal(&current);
        Some(current)
    }
}

impl std::iter::FusedIterator for SpaceIter<'_, '_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use convtune_kernels::{ConvAsmBwdWrW3x3, CHUNK_SIZES, K_PER_WAVE_VALUES};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn brute_force(problem: &ConvProblem, search_lwc: bool) -> Vec<PerformanceConfig> {
        let lwc_max = if search_lwc { MAX_LIMIT_WAVE_CNT } else { 0 };
        let mut out = Vec::new();
        for n in 1..=MAX_N_PER_GROUP {
            for p in 1..=MAX_PIPE_LINES_DEPTH {
                for k in K_PER_WAVE_VALUES {
                    for c in CHUNK_SIZES {
                        for r in 0..=1 {
                            for l in 0..=lwc_max {
                                let config = PerformanceConfig::new(l, r, c, k, p, n);
                                if config.is_valid(problem) {
                                    out.push(config);
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }

    #[test]
    fn advance_steps_in_odometer_order() {
        let min = PerformanceConfig::MIN;
        assert_eq!(advance(&min, false), Some(PerformanceConfig::new(0, 1, 8, 1, 1, 1)));
        assert_eq!(advance(&min, true), Some(PerformanceConfig::new(1, 0, 8, 1, 1, 1)));
        assert_eq!(
            advance(&PerformanceConfig::new(0, 1, 16, 1, 1, 1), false),
            Some(PerformanceConfig::new(0, 0, 8, 2, 1, 1))
        );
        assert_eq!(
            advance(&PerformanceConfig::new(0, 1, 16, 8, 1, 1), false),
            Some(PerformanceConfig::new(0, 0, 8, 1, 2, 1))
        );
        assert_eq!(
            advance(&PerformanceConfig::new(9, 1, 16, 8, 16, 1), true),
            Some(PerformanceConfig::new(0, 0, 8, 1, 1, 2))
        );
        assert_eq!(advance(&PerformanceConfig::new(0, 1, 16, 8, 16, 8), false), None);
    }

    #[test]
    fn enumeration_matches_brute_force() {
        for problem in [
            ConvProblem::new(8, 64, 64, 16, 32),
            ConvProblem::new(2, 8, 12, 5, 60),
            ConvProblem::new(4, 32, 16, 12, 100).with_stride(2, 2),
        ] {
            let space = ConfigSpace::new(&problem);
            let visited: Vec<_> = space.iter().collect();
            let unique: HashSet<_> = visited.iter().copied().collect();
            assert_eq!(unique.len(), visited.len(), "duplicate config visited");
            assert!(visited.iter().all(|c| c.is_valid(&problem)));

            let expected: HashSet<_> = brute_force(&problem, false).into_iter().collect();
            assert_eq!(unique, expected);
            assert_eq!(space.len(), expected.len());
        }
    }

    #[test]
    fn searching_limit_wave_cnt_widens_the_space() {
        let problem = ConvProblem::new(8, 16, 16, 8, 24);
        let fixed = ConfigSpace::new(&problem);
        let wide = ConfigSpace::new(&problem).search_limit_wave_cnt(true);
        assert!(wide.len() > fixed.len());
        assert_eq!(wide.len(), brute_force(&problem, true).len());
        assert!(fixed.iter().all(|c| c.limit_wave_cnt == 0));
    }

    #[test]
    fn traversal_is_reproducible() {
        let problem = ConvProblem::new(4, 16, 32, 9, 20);
        let space = ConfigSpace::new(&problem);
        let first: Vec<_> = space.iter().collect();
        let second: Vec<_> = (&space).into_iter().collect();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn first_element_skips_illegal_minimum() {
        // C = 4 cannot feed 8 channels per wave, so chunk 8 is never legal.
        let problem = ConvProblem::new(2, 4, 4, 8, 16);
        let space = ConfigSpace::new(&problem);
        assert!(!space.contains(&PerformanceConfig::MIN));
        let first = space.iter().next().unwrap();
        assert_eq!(first, PerformanceConfig::new(0, 0, 16, 1, 1, 1));
    }

    #[test]
    fn exhausted_iterator_stays_exhausted() {
        let problem = ConvProblem::new(1, 4, 4, 1, 8);
        let space = ConfigSpace::new(&problem);
        let mut iter = space.iter();
        while iter.next().is_some() {}
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn empty_space_for_unsupported_channels() {
        // 6 channels divide by neither 4 nor 8.
        let problem = ConvProblem::new(2, 6, 6, 8, 16);
        let space = ConfigSpace::new(&problem);
        assert!(space.is_empty());
        assert_eq!(space.len(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn enumeration_is_exact_for_small_problems(
            batch in 1usize..=4,
            c in prop::sample::select(vec![4usize, 8, 12, 16]),
            k in prop::sample::select(vec![4usize, 6, 8, 16]),
            height in 1usize..=6,
            width in 1usize..=40,
            stride in 1usize..=2,
        ) {
            let problem = ConvProblem::new(batch, k, c, height, width).with_stride(stride, stride);
            let space = ConfigSpace::new(&problem);
            let visited: Vec<_> = space.iter().collect();
            prop_assert_eq!(visited, brute_force(&problem, false));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn heuristic_is_always_in_the_space(
            batch in 1usize..=8,
            c in prop::sample::select(vec![4usize, 8, 12, 20, 64, 128, 256]),
            k in prop::sample::select(vec![4usize, 6, 8, 16, 64, 128, 256]),
            height in 1usize..=24,
            width in 1usize..=512,
            stride in 1usize..=2,
        ) {
            let problem = ConvProblem::new(batch, k, c, height, width).with_stride(stride, stride);
            prop_assume!(ConvAsmBwdWrW3x3::new().is_applicable(&problem));
            let config = PerformanceConfig::heuristic(&problem);
            prop_assert!(ConfigSpace::new(&problem).contains(&config), "{}", config);
            if width >= 256 {
                prop_assert!(config.n_per_group <= 4);
            }
        }
    }
}

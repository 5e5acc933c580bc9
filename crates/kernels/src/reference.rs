//! Host reference implementation of the 3x3 backward-weights kernel.
//!
//! The work decomposition follows a [`KernelSolution`]: one task per grid
//! cell in the channel/filter plane, `n_per_group` images reduced per pass,
//! rows processed `pipe_lines_depth` at a time and columns `chunk_size` at a
//! time. Different configs therefore time differently while producing the
//! same weight gradient.

use crate::config::ConvProblem;
use crate::solver::KernelSolution;
use crate::utils::{clamped_span, validate_wrw_buffers};
use anyhow::{ensure, Result};
use ndarray::{s, Array4, ArrayView4};
use rayon::prelude::*;

pub fn backward_weights(
    problem: &ConvProblem,
    solution: &KernelSolution,
    image: ArrayView4<'_, f32>,
    grad_output: ArrayView4<'_, f32>,
) -> Result<Array4<f32>> {
    validate_wrw_buffers(problem, &image, &grad_output)?;

    let config = &solution.config;
    let [_, grid_c, grid_k] = solution.geometry.global;
    ensure!(
        grid_c > 0 && grid_k > 0,
        "empty launch grid {:?}",
        solution.geometry.global
    );
    ensure!(
        problem.n_outputs % grid_c == 0 && problem.n_inputs % grid_k == 0,
        "grid {:?} does not tile C={} K={}",
        solution.geometry.global,
        problem.n_outputs,
        problem.n_inputs
    );
    let c_tile = problem.n_outputs / grid_c;
    let k_tile = problem.n_inputs / grid_k;

    let tiles: Vec<(usize, usize)> = (0..grid_k)
        .flat_map(|kt| (0..grid_c).map(move |ct| (kt, ct)))
        .collect();

    let blocks: Vec<Array4<f32>> = tiles
        .par_iter()
        .map(|&(kt, ct)| {
            let block = TileTask {
                problem,
                k_range: kt * k_tile..(kt + 1) * k_tile,
                c_range: ct * c_tile..(ct + 1) * c_tile,
                n_per_group: config.n_per_group.max(1) as usize,
                rows: config.pipe_lines_depth.max(1) as usize,
                cols: config.chunk_size.max(1) as usize,
            };
            block.run(&image, &grad_output)
        })
        .collect();

    let mut grad_weights = Array4::<f32>::zeros(problem.weight_shape());
    for (&(kt, ct), block) in tiles.iter().zip(blocks) {
        grad_weights
            .slice_mut(s![
                kt * k_tile..(kt + 1) * k_tile,
                ct * c_tile..(ct + 1) * c_tile,
                ..,
                ..
            ])
            .assign(&block);
    }
    Ok(grad_weights)
}

struct TileTask<'p> {
    problem: &'p ConvProblem,
    k_range: std::ops::Range<usize>,
    c_range: std::ops::Range<usize>,
    n_per_group: usize,
    rows: usize,
    cols: usize,
}

impl TileTask<'_> {
    fn run(&self, image: &ArrayView4<'_, f32>, grad_output: &ArrayView4<'_, f32>) -> Array4<f32> {
        let p = self.problem;
        let [batch, _, grad_h, grad_w] = p.grad_output_shape();
        let (in_h, in_w) = (p.out_height as isize, p.out_width as isize);

        let mut block = Array4::<f32>::zeros((
            self.k_range.len(),
            self.c_range.len(),
            p.kernel_h,
            p.kernel_w,
        ));
        let mut partial = block.clone();

        for group_start in (0..batch).step_by(self.n_per_group) {
            partial.fill(0.0);
            for n in clamped_span(group_start, self.n_per_group, batch) {
                for row_start in (0..grad_h).step_by(self.rows) {
                    for oy in clamped_span(row_start, self.rows, grad_h) {
                        for col_start in (0..grad_w).step_by(self.cols) {
                            for ox in clamped_span(col_start, self.cols, grad_w) {
                                self.accumulate(
                                    &mut partial,
                                    image,
                                    grad_output,
                                    n,
                                    oy,
                                    ox,
                                    in_h,
                                    in_w,
                                );
                            }
                        }
                    }
                }
            }
            block += &partial;
        }
        block
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate(
        &self,
        partial: &mut Array4<f32>,
        image: &ArrayView4<'_, f32>,
        grad_output: &ArrayView4<'_, f32>,
        n: usize,
        oy: usize,
        ox: usize,
        in_h: isize,
        in_w: isize,
    ) {
        let p = self.problem;
        for (kk, k) in self.k_range.clone().enumerate() {
            let dy = grad_output[[n, k, oy, ox]];
            if dy == 0.0 {
                continue;
            }
            for r in 0..p.kernel_h {
                let iy = (oy * p.stride_h + r * p.dilation_h) as isize - p.pad_h as isize;
                if iy < 0 || iy >= in_h {
                    continue;
                }
                for s in 0..p.kernel_w {
                    let ix = (ox * p.stride_w + s * p.dilation_w) as isize - p.pad_w as isize;
                    if ix < 0 || ix >= in_w {
                        continue;
                    }
                    for (cc, c) in self.c_range.clone().enumerate() {
                        partial[[kk, cc, r, s]] += dy * image[[n, c, iy as usize, ix as usize]];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf_config::PerformanceConfig;
    use crate::solver::ConvAsmBwdWrW3x3;

    fn naive(problem: &ConvProblem, image: &Array4<f32>, grad_output: &Array4<f32>) -> Array4<f32> {
        let [batch, filters, grad_h, grad_w] = problem.grad_output_shape();
        let mut out = Array4::<f32>::zeros(problem.weight_shape());
        for n in 0..batch {
            for k in 0..filters {
                for c in 0..problem.n_outputs {
                    for r in 0..3 {
                        for s in 0..3 {
                            for oy in 0..grad_h {
                                for ox in 0..grad_w {
                                    let iy = (oy * problem.stride_h + r) as isize - 1;
                                    let ix = (ox * problem.stride_w + s) as isize - 1;
                                    if iy < 0
                                        || ix < 0
                                        || iy >= problem.out_height as isize
                                        || ix >= problem.out_width as isize
                                    {
                                        continue;
                                    }
                                    out[[k, c, r, s]] += grad_output[[n, k, oy, ox]]
                                        * image[[n, c, iy as usize, ix as usize]];
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn ramp(shape: [usize; 4], scale: f32) -> Array4<f32> {
        let mut value = 0.0f32;
        Array4::from_shape_fn(shape, |_| {
            value += 1.0;
            (value * scale).sin()
        })
    }

    #[test]
    fn matches_naive_for_several_configs() {
        let solver = ConvAsmBwdWrW3x3::new();
        for problem in [
            ConvProblem::new(3, 8, 4, 7, 9),
            ConvProblem::new(2, 4, 8, 8, 10).with_stride(2, 2),
        ] {
            let image = ramp(problem.image_shape(), 0.37);
            let grad = ramp(problem.grad_output_shape(), 0.11);
            let expected = naive(&problem, &image, &grad);

            for config in [
                PerformanceConfig::new(0, 0, 16, 1, 2, 1),
                PerformanceConfig::new(0, 0, 16, 4, 3, 2),
                PerformanceConfig::new(0, 1, 16, 2, 1, 3),
            ] {
                let solution = solver.get_solution(&problem, &config);
                let [_, grid_c, grid_k] = solution.geometry.global;
                assert!(
                    problem.n_outputs % grid_c == 0 && problem.n_inputs % grid_k == 0,
                    "config {config}: grid {:?} does not tile the problem",
                    solution.geometry.global
                );
                let got = backward_weights(&problem, &solution, image.view(), grad.view()).unwrap();
                let max_err = (&got - &expected)
                    .iter()
                    .fold(0.0f32, |acc, v| acc.max(v.abs()));
                assert!(max_err < 1e-3, "config {config}: max error {max_err}");
            }
        }
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let problem = ConvProblem::new(1, 4, 4, 4, 4);
        let solution = ConvAsmBwdWrW3x3::new()
            .get_solution(&problem, &PerformanceConfig::new(0, 0, 16, 1, 1, 1));
        let image = Array4::<f32>::zeros((1, 4, 4, 5));
        let grad = Array4::<f32>::zeros(problem.grad_output_shape());
        assert!(backward_weights(&problem, &solution, image.view(), grad.view()).is_err());
    }
}

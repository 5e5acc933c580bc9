//! Evaluation helpers for end-to-end 3x3 WrW tuning.
//!
//! The suite tunes a handful of representative problems, checks the tuned
//! config computes the same weight gradient as the heuristic one, and
//! collects latency / throughput metrics in a reproducible JSON report.

use crate::session::TuningSession;
use anyhow::Result;
use convtune_autotune::SelectionSource;
use convtune_backend_cpu::WrwBuffers;
use convtune_kernels::reference::backward_weights;
use convtune_kernels::ConvProblem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrwEvalCase {
    pub name: String,
    pub problem: ConvProblem,
}

impl WrwEvalCase {
    pub fn new(name: impl Into<String>, problem: ConvProblem) -> Self {
        Self {
            name: name.into(),
            problem,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrwEvalResult {
    pub case: String,
    pub config: String,
    pub source: SelectionSource,
    pub latency_ms: f64,
    pub gflops: f64,
    pub n_total: usize,
    pub n_failed: usize,
    pub max_abs_error: f64,
    pub mean_abs_error: f64,
    pub problem: ConvProblem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub device: String,
    pub generated_at_unix_ms: u128,
    pub cases: Vec<WrwEvalResult>,
}

impl EvaluationReport {
    pub fn as_map(&self) -> BTreeMap<&str, &WrwEvalResult> {
        self.cases
            .iter()
            .map(|case| (case.case.as_str(), case))
            .collect()
    }

    pub fn diff<'a>(
        &'a self,
        baseline: &'a EvaluationReport,
    ) -> BTreeMap<&'a str, EvaluationDelta<'a>> {
        let mut deltas = BTreeMap::new();
        let current = self.as_map();
        let previous = baseline.as_map();

        for (case, result) in current {
            if let Some(&baseline_result) = previous.get(case) {
                deltas.insert(
                    case,
                    EvaluationDelta {
                        current: result,
                        baseline: baseline_result,
                        latency_ms_delta: result.latency_ms - baseline_result.latency_ms,
                        gflops_delta: result.gflops - baseline_result.gflops,
                        config_changed: result.config != baseline_result.config,
                    },
                );
            }
        }

        deltas
    }
}

#[derive(Debug)]
pub struct EvaluationDelta<'a> {
    pub current: &'a WrwEvalResult,
    pub baseline: &'a WrwEvalResult,
    pub latency_ms_delta: f64,
    pub gflops_delta: f64,
    pub config_changed: bool,
}

pub struct EvaluationSuite {
    cases: Vec<WrwEvalCase>,
}

impl EvaluationSuite {
    pub fn new(cases: Vec<WrwEvalCase>) -> Self {
        Self { cases }
    }

    pub fn cases(&self) -> &[WrwEvalCase] {
        &self.cases
    }

    /// Small shapes covering both chunk sizes, strided and reversed layouts.
    pub fn wrw3x3_smoke(session: &TuningSession) -> Self {
        let device = session.device().clone();
        let cases = vec![
            WrwEvalCase::new(
                "narrow_unit_stride",
                ConvProblem::new(2, 8, 8, 6, 12).with_device(device.clone()),
            ),
            WrwEvalCase::new(
                "wide_unit_stride",
                ConvProblem::new(1, 8, 16, 4, 56).with_device(device.clone()),
            ),
            WrwEvalCase::new(
                "odd_filters",
                ConvProblem::new(2, 6, 8, 5, 10).with_device(device.clone()),
            ),
            WrwEvalCase::new(
                "strided",
                ConvProblem::new(2, 4, 8, 8, 16)
                    .with_stride(2, 2)
                    .with_device(device),
            ),
        ];
        Self::new(cases)
    }

    pub fn run(&self, session: &mut TuningSession) -> Result<EvaluationReport> {
        let mut results = Vec::with_capacity(self.cases.len());

        for (index, case) in self.cases.iter().enumerate() {
            let problem = &case.problem;
            let inputs = WrwBuffers::seeded(problem, index as u64 + 1);

            let heuristic = session.solver().heuristic_config(problem);
            let baseline_solution = session.solver().get_solution(problem, &heuristic);
            let expected = backward_weights(
                problem,
                &baseline_solution,
                inputs.image.view(),
                inputs.grad_output.view(),
            )?;

            let report = session.tune(problem)?;
            let (lap_time, execution) = timed(|| {
                session.execute_wrw(problem, inputs.image.view(), inputs.grad_output.view())
            })?;

            let latency_ms = report
                .outcome
                .as_ref()
                .and_then(|outcome| outcome.best_time_ms)
                .filter(|lat| *lat > 0.0)
                .unwrap_or(lap_time.as_secs_f64() * 1000.0);
            let gflops = if latency_ms > 0.0 {
                problem.flops() / (latency_ms * 1.0e6)
            } else {
                0.0
            };

            let diff = &execution.grad_weights - &expected;
            let max_abs_error = diff
                .iter()
                .fold(0.0_f64, |acc, value| acc.max(value.abs() as f64));
            let mean_abs_error =
                diff.iter().map(|value| value.abs() as f64).sum::<f64>() / diff.len() as f64;

            let (n_total, n_failed) = report
                .outcome
                .as_ref()
                .map_or((0, 0), |outcome| (outcome.n_total, outcome.n_failed));

            results.push(WrwEvalResult {
                case: case.name.clone(),
                config: report.config.to_string(),
                source: report.source,
                latency_ms,
                gflops,
                n_total,
                n_failed,
                max_abs_error,
                mean_abs_error,
                problem: problem.clone(),
            });
        }

        let generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();

        Ok(EvaluationReport {
            device: session.device().name.clone(),
            generated_at_unix_ms,
            cases: results,
        })
    }
}

fn timed<F, T>(f: F) -> Result<(Duration, T)>
where
    F: FnOnce() -> Result<T>,
{
    let start = Instant::now();
    let value = f()?;
    Ok((start.elapsed(), value))
}

//! CLI wiring for the convtune toolkit.

use crate::eval::{EvaluationReport, EvaluationSuite};
use crate::session::{SessionOptions, TuningSession};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use convtune_autotune::{ConfigSpace, DEFAULT_HEARTBEAT_INTERVAL};
use convtune_backend_cpu::host_device;
use convtune_kernels::{ConvAsmBwdWrW3x3, ConvProblem, DeviceInfo, PerformanceConfig};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Environment variable holding a perf-values override.
pub const PERF_VALS_ENV: &str = "CONVTUNE_3X3WRW_PERF_VALS";

#[derive(Parser, Debug)]
#[command(
    name = "convtune",
    about = "Performance-config search for the 3x3 backward-weights convolution kernel"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Shape of a backward-weights problem.
#[derive(Args, Debug, Clone)]
pub struct ProblemArgs {
    #[arg(long, default_value_t = 8)]
    pub batch: usize,
    /// Image channels (C).
    #[arg(long, default_value_t = 64)]
    pub channels: usize,
    /// Filters (K).
    #[arg(long, default_value_t = 64)]
    pub filters: usize,
    #[arg(long, default_value_t = 16)]
    pub height: usize,
    #[arg(long, default_value_t = 32)]
    pub width: usize,
    #[arg(long, default_value_t = 1)]
    pub stride: usize,
    /// Device name; defaults to the host emulation device.
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long)]
    pub compute_units: Option<u32>,
}

impl ProblemArgs {
    pub fn to_problem(&self) -> ConvProblem {
        let host = host_device();
        let device = DeviceInfo::new(
            self.device.clone().unwrap_or(host.name),
            self.compute_units.unwrap_or(host.max_compute_units),
        );
        ConvProblem::new(
            self.batch,
            self.filters,
            self.channels,
            self.height,
            self.width,
        )
        .with_stride(self.stride, self.stride)
        .with_device(device)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search the config space (or use the override / cache) and print the result.
    Tune {
        #[command(flatten)]
        problem: ProblemArgs,
        #[arg(long, env = PERF_VALS_ENV)]
        perf_vals: Option<String>,
        #[arg(long, default_value_t = false)]
        search_limit_wave_cnt: bool,
        #[arg(long)]
        autotune_cache: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        clear_autotune_cache: bool,
        #[arg(long, default_value_t = 1)]
        warmup: usize,
        #[arg(long, default_value_t = 3)]
        runs: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64)]
        heartbeat_ms: u64,
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Print the initial config: the override if set, otherwise the heuristic.
    Heuristic {
        #[command(flatten)]
        problem: ProblemArgs,
        #[arg(long, env = PERF_VALS_ENV)]
        perf_vals: Option<String>,
    },
    /// Count (or list) the legal configs for a problem.
    Space {
        #[command(flatten)]
        problem: ProblemArgs,
        #[arg(long, default_value_t = false)]
        search_limit_wave_cnt: bool,
        #[arg(long, default_value_t = false)]
        list: bool,
    },
    /// Check a perf-values string against a problem.
    Validate {
        #[command(flatten)]
        problem: ProblemArgs,
        config: String,
    },
    /// Print the kernel build options and launch geometry for a config.
    Solution {
        #[command(flatten)]
        problem: ProblemArgs,
        config: String,
    },
    /// Tune a curated set of problems and emit a JSON report.
    Suite {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let solver = ConvAsmBwdWrW3x3::new();

    match cli.command {
        Command::Tune {
            problem,
            perf_vals,
            search_limit_wave_cnt,
            autotune_cache,
            clear_autotune_cache,
            warmup,
            runs,
            seed,
            heartbeat_ms,
            dump,
        } => {
            let defaults = SessionOptions::default();
            let options = SessionOptions {
                autotune_cache,
                clear_autotune_cache,
                perf_vals,
                search_limit_wave_cnt,
                seed: seed.unwrap_or(defaults.seed),
                heartbeat_interval: Duration::from_millis(heartbeat_ms),
                warmup_runs: warmup,
                runs,
            };
            let mut session = TuningSession::new(options)?;
            let problem = problem.to_problem();
            let report = session.tune(&problem)?;
            let json = serde_json::to_string_pretty(&report)?;
            println!("{json}");
            if let Some(path) = dump {
                fs::write(path, json)?;
            }
            session.shutdown()?;
        }
        Command::Heuristic { problem, perf_vals } => {
            let problem = problem.to_problem();
            solver.check_applicable(&problem)?;
            let config = solver.init_performance_config(&problem, perf_vals.as_deref())?;
            println!("{config}");
        }
        Command::Space {
            problem,
            search_limit_wave_cnt,
            list,
        } => {
            let problem = problem.to_problem();
            let space = ConfigSpace::new(&problem)
                .with_limits(*solver.limits())
                .search_limit_wave_cnt(search_limit_wave_cnt);
            if list {
                let mut count = 0usize;
                for config in &space {
                    println!("{config}");
                    count += 1;
                }
                info!(count, "listed legal configs");
            } else {
                println!("{}", space.len());
            }
        }
        Command::Validate { problem, config } => {
            let problem = problem.to_problem();
            let parsed: PerformanceConfig = config
                .parse()
                .with_context(|| format!("cannot parse {config:?}"))?;
            match parsed.check(&problem, solver.limits()) {
                Ok(()) => println!("{parsed}: valid"),
                Err(violation) => println!("{parsed}: invalid ({violation})"),
            }
        }
        Command::Solution { problem, config } => {
            let problem = problem.to_problem();
            solver.check_applicable(&problem)?;
            let config = convtune_kernels::parse_override(&problem, &config, solver.limits())?;
            let solution = solver.get_solution(&problem, &config);
            println!("{} {}", solution.kernel_file, solution.kernel_name);
            println!("options:{}", solution.compile_options());
            println!(
                "local={:?} global={:?}",
                solution.geometry.local, solution.geometry.global
            );
            println!("args: {:?}", solver.kernel_args(&problem));
        }
        Command::Suite { output, baseline } => {
            let options = SessionOptions {
                warmup_runs: 0,
                runs: 1,
                ..SessionOptions::default()
            };
            let mut session = TuningSession::new(options)?;
            let suite = EvaluationSuite::wrw3x3_smoke(&session);
            let report = suite.run(&mut session)?;

            println!(
                "device={}, cases={}, generated_at={}",
                report.device,
                report.cases.len(),
                report.generated_at_unix_ms
            );
            for case in &report.cases {
                println!(
                    "- {}: config={} ({:?}) latency_ms={:.3} gflops={:.3} failed={}/{} max_abs_error={:.3e}",
                    case.case,
                    case.config,
                    case.source,
                    case.latency_ms,
                    case.gflops,
                    case.n_failed,
                    case.n_total,
                    case.max_abs_error
                );
            }

            if let Some(path) = baseline {
                if path.exists() {
                    let baseline_blob = fs::read_to_string(&path)?;
                    let baseline_report: EvaluationReport = serde_json::from_str(&baseline_blob)?;
                    for (name, delta) in report.diff(&baseline_report) {
                        println!(
                            "Δ {}: latency_ms={:+.3} gflops={:+.3}{}",
                            name,
                            delta.latency_ms_delta,
                            delta.gflops_delta,
                            if delta.config_changed {
                                format!(
                                    " config {} -> {}",
                                    delta.baseline.config, delta.current.config
                                )
                            } else {
                                String::new()
                            }
                        );
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                fs::write(path, json)?;
            }

            session.shutdown()?;
        }
    }
    Ok(())
}

//! Periodic progress reports for long searches.

use convtune_kernels::PerformanceConfig;
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3000);

/// One emitted progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatReport {
    pub n_recent: usize,
    pub n_failed: usize,
    pub n_total: usize,
    pub total_best_ms: Option<f64>,
    pub n_within_beat: usize,
    pub beat_best_ms: Option<f64>,
    pub beat_best_index: usize,
    pub beat_best_config: Option<PerformanceConfig>,
    pub eta: Duration,
}

#[derive(Debug)]
pub struct HeartBeat {
    interval: Duration,
    window_start: Instant,
    elapsed_cumulative: Duration,
    n_within_beat: usize,
    best_time: Option<f64>,
    n_best: usize,
    best_config: Option<PerformanceConfig>,
}

impl HeartBeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            elapsed_cumulative: Duration::ZERO,
            n_within_beat: 0,
            best_time: None,
            n_best: 0,
            best_config: None,
        }
    }

    pub fn start(&mut self) {
        self.elapsed_cumulative = Duration::ZERO;
        self.best_config = None;
        self.n_best = 0;
        self.restart_window(Instant::now());
    }

    /// Record one finished candidate; returns (and logs) a report when the
    /// window has run for at least the interval.
    pub fn monitor(
        &mut self,
        recent_time: Option<f64>,
        n_recent: usize,
        total_best: Option<f64>,
        n_failed: usize,
        n_total: usize,
        recent_config: &PerformanceConfig,
    ) -> Option<BeatReport> {
        self.monitor_at(
            Instant::now(),
            recent_time,
            n_recent,
            total_best,
            n_failed,
            n_total,
            recent_config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn monitor_at(
        &mut self,
        now: Instant,
        recent_time: Option<f64>,
        n_recent: usize,
        total_best: Option<f64>,
        n_failed: usize,
        n_total: usize,
        recent_config: &PerformanceConfig,
    ) -> Option<BeatReport> {
        self.n_within_beat += 1;
        if let Some(time) = recent_time {
            if self.best_time.map_or(true, |best| time < best) {
                self.best_time = Some(time);
                self.n_best = n_recent;
                self.best_config = Some(*recent_config);
            }
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        self.elapsed_cumulative += elapsed;
        let eta = if n_recent > 0 {
            self.elapsed_cumulative
                .mul_f64(n_total.saturating_sub(n_recent) as f64 / n_recent as f64)
        } else {
            Duration::ZERO
        };

        let report = BeatReport {
            n_recent,
            n_failed,
            n_total,
            total_best_ms: total_best,
            n_within_beat: self.n_within_beat,
            beat_best_ms: self.best_time,
            beat_best_index: self.n_best,
            beat_best_config: self.best_config,
            eta,
        };
        warn!(
            "{}/{}/{} {:?}, best within recent {}: {:?} #{} {}, ETA: {:.1} sec",
            report.n_recent,
            report.n_failed,
            report.n_total,
            report.total_best_ms,
            report.n_within_beat,
            report.beat_best_ms,
            report.beat_best_index,
            report
                .beat_best_config
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
            report.eta.as_secs_f64()
        );
        self.restart_window(now);
        Some(report)
    }

    fn restart_window(&mut self, now: Instant) {
        self.best_time = None;
        self.n_within_beat = 0;
        self.window_start = now;
    }
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

//! Performance Profiler
//!
//! Benchmarks CPU, memory, and render cost at startup and periodically,
//! then classifies the host machine:
//! - Three timed micro-benchmarks mapped to 0-100 scores via a linear clamp
//! - Constrained/ample classification with fail-safe defaults
//! - Per-feature predicates and tuned knobs derived from the classification
//! - Background monitor with heap-pressure cool-down

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::OptimizeError;

/// Scores below this overall value classify the host as constrained
const OVERALL_CONSTRAINED_THRESHOLD: f64 = 50.0;
/// Memory scores below this value classify the host as constrained
const MEMORY_CONSTRAINED_THRESHOLD: f64 = 30.0;
/// Measurements slower than this classify the host as constrained
const MEASUREMENT_TIME_THRESHOLD_MS: u64 = 1000;

/// Profiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Iterations of the floating-point CPU benchmark
    pub cpu_iterations: u64,
    /// Time budget for the CPU benchmark (score 0 at or beyond this)
    pub cpu_budget_ms: f64,
    /// Bulk allocation rounds for the fallback memory benchmark
    pub alloc_rounds: usize,
    /// Time budget for the fallback memory benchmark
    pub memory_budget_ms: f64,
    /// Element count for the render benchmark
    pub render_nodes: usize,
    /// Time budget for the render benchmark
    pub render_budget_ms: f64,
    /// Background re-sample interval
    pub resample_interval: Duration,
    /// Heap-usage ratio above which an ample machine is temporarily degraded
    pub heap_pressure_threshold: f64,
    /// How long a heap-pressure degradation lasts
    pub pressure_cooldown: Duration,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            cpu_iterations: 2_000_000,
            cpu_budget_ms: 50.0,
            alloc_rounds: 64,
            memory_budget_ms: 80.0,
            render_nodes: 100,
            render_budget_ms: 100.0,
            resample_interval: Duration::from_secs(300),
            heap_pressure_threshold: 0.8,
            pressure_cooldown: Duration::from_secs(120),
        }
    }
}

/// Static hardware snapshot taken alongside each measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// Logical CPU count
    pub cpu_count: usize,
    /// Total system memory in bytes, when the platform exposes it
    pub total_memory_bytes: Option<u64>,
}

impl HardwareInfo {
    /// Probe the host
    pub fn detect() -> Self {
        Self {
            cpu_count: num_cpus::get(),
            total_memory_bytes: read_meminfo_kib("MemTotal:").map(|kib| kib * 1024),
        }
    }
}

/// One measurement of the host's processing capability.
///
/// Immutable per measurement: a refresh publishes a new profile, it never
/// mutates an existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceProfile {
    /// CPU benchmark score (0-100, higher is faster)
    pub cpu_score: f64,
    /// Memory benchmark score (0-100)
    pub memory_score: f64,
    /// Render benchmark score (0-100)
    pub render_score: f64,
    /// Average of the three scores
    pub overall_score: f64,
    /// Constrained/ample classification
    pub is_constrained: bool,
    /// Total wall time the three benchmarks took
    pub measurement_time_ms: u64,
    /// When the measurement was taken
    pub measured_at: DateTime<Utc>,
    /// Hardware snapshot at measurement time
    pub hardware: HardwareInfo,
}

impl PerformanceProfile {
    /// Build a profile from raw scores, applying the classification rule
    pub fn from_scores(
        cpu_score: f64,
        memory_score: f64,
        render_score: f64,
        measurement_time_ms: u64,
    ) -> Self {
        let overall_score = (cpu_score + memory_score + render_score) / 3.0;
        Self {
            cpu_score,
            memory_score,
            render_score,
            overall_score,
            is_constrained: classify(overall_score, measurement_time_ms, memory_score),
            measurement_time_ms,
            measured_at: Utc::now(),
            hardware: HardwareInfo::detect(),
        }
    }

    /// Fail-safe profile used when any benchmark errors: always constrained
    pub fn fail_safe() -> Self {
        Self {
            cpu_score: 0.0,
            memory_score: 0.0,
            render_score: 0.0,
            overall_score: 0.0,
            is_constrained: true,
            measurement_time_ms: 0,
            measured_at: Utc::now(),
            hardware: HardwareInfo::detect(),
        }
    }

    /// Copy of this profile with the classification forced to constrained
    /// (heap-pressure cool-down)
    pub fn forced_constrained(&self) -> Self {
        let mut p = self.clone();
        p.is_constrained = true;
        p
    }

    // Per-feature predicates. Constrained machines get every protection;
    // ample machines keep the cheap wins (caching, input debouncing) and
    // skip the heavier ones.

    pub fn should_use_caching(&self) -> bool {
        true
    }

    pub fn should_use_debouncing(&self) -> bool {
        true
    }

    pub fn should_use_throttling(&self) -> bool {
        self.is_constrained
    }

    pub fn should_use_pagination(&self) -> bool {
        self.is_constrained
    }

    pub fn should_use_lazy_loading(&self) -> bool {
        self.is_constrained
    }

    // Tuned knobs.

    /// Base debounce delay
    pub fn debounce_delay(&self) -> Duration {
        if self.is_constrained {
            Duration::from_millis(500)
        } else {
            Duration::from_millis(300)
        }
    }

    /// Base throttle delay
    pub fn throttle_delay(&self) -> Duration {
        if self.is_constrained {
            Duration::from_millis(200)
        } else {
            Duration::from_millis(100)
        }
    }

    /// Default page size
    pub fn page_size(&self) -> usize {
        if self.is_constrained { 20 } else { 50 }
    }

    /// Cache capacity in entries
    pub fn cache_capacity(&self) -> usize {
        if self.is_constrained { 50 } else { 200 }
    }

    /// Lazy-render materialization batch size
    pub fn lazy_batch_size(&self) -> usize {
        if self.is_constrained { 5 } else { 10 }
    }
}

/// Classification rule: constrained when the overall score is low, the
/// measurement itself was slow, or memory is tight
pub fn classify(overall_score: f64, measurement_time_ms: u64, memory_score: f64) -> bool {
    overall_score < OVERALL_CONSTRAINED_THRESHOLD
        || measurement_time_ms > MEASUREMENT_TIME_THRESHOLD_MS
        || memory_score < MEMORY_CONSTRAINED_THRESHOLD
}

/// Host-suppliable render cost probe. The default builds and lays out a
/// synthetic element batch; a real host can substitute its own off-screen
/// render pass.
pub trait RenderProbe: Send + Sync {
    /// Perform one render pass over `node_count` elements
    fn render_pass(&self, node_count: usize) -> Result<(), OptimizeError>;
}

/// Default probe: builds ~100 element records, runs a layout pass, drops them
pub struct SyntheticRenderProbe;

impl RenderProbe for SyntheticRenderProbe {
    fn render_pass(&self, node_count: usize) -> Result<(), OptimizeError> {
        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            nodes.push(format!("<div class=\"probe\" data-idx=\"{i}\">item {i}</div>"));
        }
        // Layout pass: accumulate widths so the loop is not optimized away
        let total: usize = nodes.iter().map(|n| n.len()).sum();
        if total == 0 {
            return Err(OptimizeError::Benchmark {
                name: "render",
                reason: "empty layout pass".to_string(),
            });
        }
        Ok(())
    }
}

/// Benchmarks the host and owns the current classification
pub struct PerformanceProfiler {
    config: ProfilerConfig,
    probe: Arc<dyn RenderProbe>,
    /// Current measurement; refresh swaps the Arc, never mutates through it
    current: RwLock<Arc<PerformanceProfile>>,
    /// End of the heap-pressure cool-down window, if one is active
    forced_until: Mutex<Option<tokio::time::Instant>>,
}

impl PerformanceProfiler {
    /// Create a profiler and run the initial measurement
    pub fn new(config: ProfilerConfig) -> Self {
        Self::with_probe(config, Arc::new(SyntheticRenderProbe))
    }

    /// Create a profiler with a host-supplied render probe
    pub fn with_probe(config: ProfilerConfig, probe: Arc<dyn RenderProbe>) -> Self {
        let profiler = Self {
            config,
            probe,
            current: RwLock::new(Arc::new(PerformanceProfile::fail_safe())),
            forced_until: Mutex::new(None),
        };
        profiler.measure();
        profiler
    }

    /// Run the three benchmarks and publish a new profile. Benchmark
    /// failures never abort: they publish the fail-safe constrained profile.
    pub fn measure(&self) -> Arc<PerformanceProfile> {
        let started = std::time::Instant::now();
        let profile = match self.run_benchmarks() {
            Ok((cpu, mem, render)) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                PerformanceProfile::from_scores(cpu, mem, render, elapsed_ms)
            }
            Err(e) => {
                tracing::warn!("benchmark failed, defaulting to constrained profile: {e}");
                PerformanceProfile::fail_safe()
            }
        };
        tracing::debug!(
            overall = profile.overall_score,
            constrained = profile.is_constrained,
            "profile measured"
        );
        let profile = Arc::new(profile);
        *self.current.write() = Arc::clone(&profile);
        profile
    }

    /// Current profile, with the heap-pressure override applied
    pub fn current(&self) -> Arc<PerformanceProfile> {
        let profile = Arc::clone(&self.current.read());
        let mut forced = self.forced_until.lock();
        match *forced {
            Some(until) if tokio::time::Instant::now() < until => {
                if profile.is_constrained {
                    profile
                } else {
                    Arc::new(profile.forced_constrained())
                }
            }
            Some(_) => {
                // Cool-down elapsed, revert
                *forced = None;
                profile
            }
            None => profile,
        }
    }

    /// One tick of the background monitor: re-measure, then check heap
    /// pressure on an otherwise-ample machine
    pub fn resample(&self) {
        let profile = self.measure();
        if !profile.is_constrained {
            if let Some(ratio) = heap_usage_ratio() {
                if ratio > self.config.heap_pressure_threshold {
                    tracing::info!(
                        ratio,
                        cooldown_secs = self.config.pressure_cooldown.as_secs(),
                        "heap pressure on ample machine, forcing constrained"
                    );
                    *self.forced_until.lock() =
                        Some(tokio::time::Instant::now() + self.config.pressure_cooldown);
                }
            }
        }
    }

    /// Background re-sample interval (owned and scheduled by the coordinator)
    pub fn resample_interval(&self) -> Duration {
        self.config.resample_interval
    }

    fn run_benchmarks(&self) -> Result<(f64, f64, f64), OptimizeError> {
        let cpu = self.bench_cpu()?;
        let mem = self.bench_memory()?;
        let render = self.bench_render()?;
        Ok((cpu, mem, render))
    }

    /// Fixed-iteration floating-point loop, linear clamp to 0-100
    fn bench_cpu(&self) -> Result<f64, OptimizeError> {
        let start = std::time::Instant::now();
        let mut acc = 0.0f64;
        for i in 0..self.config.cpu_iterations {
            acc += (i as f64).sqrt() * 1.000001;
        }
        if !acc.is_finite() {
            return Err(OptimizeError::Benchmark {
                name: "cpu",
                reason: "accumulator overflow".to_string(),
            });
        }
        Ok(linear_score(
            start.elapsed().as_secs_f64() * 1000.0,
            self.config.cpu_budget_ms,
        ))
    }

    /// Memory score: available/total ratio from the platform when exposed,
    /// otherwise a timed bulk allocation benchmark
    fn bench_memory(&self) -> Result<f64, OptimizeError> {
        if let (Some(avail), Some(total)) = (
            read_meminfo_kib("MemAvailable:"),
            read_meminfo_kib("MemTotal:"),
        ) {
            if total > 0 {
                return Ok(((avail as f64 / total as f64) * 100.0).clamp(0.0, 100.0));
            }
        }
        let start = std::time::Instant::now();
        let mut retained: Vec<Vec<u64>> = Vec::with_capacity(self.config.alloc_rounds);
        for round in 0..self.config.alloc_rounds {
            let mut block = vec![0u64; 16 * 1024];
            let idx = round % block.len();
            block[idx] = round as u64;
            retained.push(block);
        }
        if retained.len() != self.config.alloc_rounds {
            return Err(OptimizeError::Benchmark {
                name: "memory",
                reason: "allocation rounds incomplete".to_string(),
            });
        }
        Ok(linear_score(
            start.elapsed().as_secs_f64() * 1000.0,
            self.config.memory_budget_ms,
        ))
    }

    /// Timed render pass through the probe
    fn bench_render(&self) -> Result<f64, OptimizeError> {
        let start = std::time::Instant::now();
        self.probe.render_pass(self.config.render_nodes)?;
        Ok(linear_score(
            start.elapsed().as_secs_f64() * 1000.0,
            self.config.render_budget_ms,
        ))
    }
}

/// Linear clamp: 100 at zero elapsed, 0 at or beyond the budget
fn linear_score(elapsed_ms: f64, budget_ms: f64) -> f64 {
    if budget_ms <= 0.0 {
        return 0.0;
    }
    ((budget_ms - elapsed_ms) / budget_ms * 100.0).clamp(0.0, 100.0)
}

/// Resident-set / total-memory ratio; `None` when the platform does not
/// expose it (the monitor then never force-degrades)
pub fn heap_usage_ratio() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let total_kib = read_meminfo_kib("MemTotal:")?;
    if total_kib == 0 {
        return None;
    }
    let resident_kib = resident_pages * 4; // 4 KiB pages
    Some(resident_kib as f64 / total_kib as f64)
}

fn read_meminfo_kib(field: &str) -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            return rest.trim().trim_end_matches(" kB").trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_overall_threshold() {
        // Overall score alone is sufficient for the constrained verdict
        assert!(classify(40.0, 500, 60.0));
    }

    #[test]
    fn test_classify_memory_threshold() {
        assert!(classify(80.0, 500, 20.0));
    }

    #[test]
    fn test_classify_slow_measurement() {
        assert!(classify(80.0, 1500, 60.0));
    }

    #[test]
    fn test_classify_ample() {
        assert!(!classify(80.0, 500, 60.0));
    }

    #[test]
    fn test_linear_score_bounds() {
        assert_eq!(linear_score(0.0, 100.0), 100.0);
        assert_eq!(linear_score(100.0, 100.0), 0.0);
        assert_eq!(linear_score(250.0, 100.0), 0.0);
        assert!(linear_score(50.0, 100.0) > 49.0 && linear_score(50.0, 100.0) < 51.0);
    }

    #[test]
    fn test_fail_safe_profile_is_constrained() {
        let profile = PerformanceProfile::fail_safe();
        assert!(profile.is_constrained);
        assert_eq!(profile.overall_score, 0.0);
    }

    #[test]
    fn test_tuned_knobs_differ_by_classification() {
        let constrained = PerformanceProfile::from_scores(10.0, 10.0, 10.0, 100);
        let ample = PerformanceProfile::from_scores(90.0, 90.0, 90.0, 100);
        assert!(constrained.is_constrained);
        assert!(!ample.is_constrained);
        assert_eq!(constrained.page_size(), 20);
        assert_eq!(ample.page_size(), 50);
        assert_eq!(constrained.debounce_delay(), Duration::from_millis(500));
        assert_eq!(ample.debounce_delay(), Duration::from_millis(300));
        assert!(constrained.should_use_lazy_loading());
        assert!(!ample.should_use_lazy_loading());
        assert!(ample.should_use_caching());
    }

    #[test]
    fn test_measure_publishes_profile() {
        let profiler = PerformanceProfiler::new(ProfilerConfig::default());
        let profile = profiler.current();
        // Scores are host dependent; the invariant is a published measurement
        assert!(profile.overall_score >= 0.0 && profile.overall_score <= 100.0);
        assert!(profile.hardware.cpu_count >= 1);
    }

    #[test]
    fn test_failing_probe_defaults_constrained() {
        struct FailingProbe;
        impl RenderProbe for FailingProbe {
            fn render_pass(&self, _n: usize) -> Result<(), OptimizeError> {
                Err(OptimizeError::Benchmark {
                    name: "render",
                    reason: "probe exploded".to_string(),
                })
            }
        }
        let profiler =
            PerformanceProfiler::with_probe(ProfilerConfig::default(), Arc::new(FailingProbe));
        assert!(profiler.current().is_constrained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_constrained_cooldown_reverts() {
        let profiler = PerformanceProfiler::new(ProfilerConfig::default());
        // Publish an ample profile directly, then force the cool-down
        let ample = Arc::new(PerformanceProfile::from_scores(90.0, 90.0, 90.0, 100));
        assert!(!ample.is_constrained);
        *profiler.current.write() = Arc::clone(&ample);
        *profiler.forced_until.lock() =
            Some(tokio::time::Instant::now() + Duration::from_secs(120));

        assert!(profiler.current().is_constrained);
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(!profiler.current().is_constrained);
    }
}

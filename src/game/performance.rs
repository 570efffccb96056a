//! Performance monitoring and adaptive scaling
//!
//! Tracks tick durations against the tick budget and provides signals for:
//! - Admission control (reject joins when degraded)
//! - Demo content scaling (stop spawning, or shed mobs when overloaded)

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Ticks averaged before the status may change
const MIN_SAMPLES: usize = 10;

/// Performance status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PerformanceStatus {
    /// Plenty of headroom
    Excellent,
    /// Normal operation
    Good,
    /// Degraded, should not add entities
    Warning,
    /// Stop adding anything, refuse new clients
    Critical,
    /// Sustained overload, must shed entities
    Catastrophic,
}

impl PerformanceStatus {
    pub fn can_accept_clients(&self) -> bool {
        *self < PerformanceStatus::Critical
    }

    pub fn can_spawn_content(&self) -> bool {
        matches!(self, PerformanceStatus::Excellent | PerformanceStatus::Good)
    }

    /// Only forcibly remove content in catastrophic situations
    pub fn should_shed_content(&self) -> bool {
        matches!(self, PerformanceStatus::Catastrophic)
    }

    /// Gauge value exported to metrics
    pub fn as_gauge(&self) -> u64 {
        *self as u64
    }
}

/// Performance monitor that tracks tick durations
pub struct PerformanceMonitor {
    /// Rolling window of tick durations
    tick_durations: VecDeque<Duration>,
    max_samples: usize,
    /// Target tick duration (budget)
    target_tick_duration: Duration,
    // thresholds as fractions of the budget
    excellent_threshold: f32,
    warning_threshold: f32,
    critical_threshold: f32,
    catastrophic_threshold: f32,
    status: PerformanceStatus,
    tick_start: Option<Instant>,
    last_entity_count: usize,
}

impl PerformanceMonitor {
    pub fn new(tick_rate: u32) -> Self {
        let target_tick_duration = Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32);

        Self {
            tick_durations: VecDeque::with_capacity(120),
            max_samples: 120,
            target_tick_duration,
            excellent_threshold: 0.3,
            warning_threshold: 0.7,
            critical_threshold: 0.9,
            catastrophic_threshold: 1.5,
            status: PerformanceStatus::Excellent,
            tick_start: None,
            last_entity_count: 0,
        }
    }

    /// Start timing a tick
    pub fn tick_start(&mut self) {
        self.tick_start = Some(Instant::now());
    }

    /// End timing a tick and return its duration
    pub fn tick_end(&mut self, entity_count: usize) -> Option<Duration> {
        let start = self.tick_start.take()?;
        let duration = start.elapsed();
        self.record_tick(duration);
        self.last_entity_count = entity_count;
        Some(duration)
    }

    pub(crate) fn record_tick(&mut self, duration: Duration) {
        self.tick_durations.push_back(duration);
        while self.tick_durations.len() > self.max_samples {
            self.tick_durations.pop_front();
        }
        self.update_status();
    }

    fn update_status(&mut self) {
        if self.tick_durations.len() < MIN_SAMPLES {
            return;
        }

        let ratio = self.average_tick_duration().as_secs_f32() / self.target_tick_duration.as_secs_f32();

        self.status = if ratio < self.excellent_threshold {
            PerformanceStatus::Excellent
        } else if ratio < self.warning_threshold {
            PerformanceStatus::Good
        } else if ratio < self.critical_threshold {
            PerformanceStatus::Warning
        } else if ratio < self.catastrophic_threshold {
            PerformanceStatus::Critical
        } else {
            PerformanceStatus::Catastrophic
        };
    }

    pub fn average_tick_duration(&self) -> Duration {
        if self.tick_durations.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.tick_durations.iter().sum();
        sum / self.tick_durations.len() as u32
    }

    pub fn p95_tick_duration(&self) -> Duration {
        if self.tick_durations.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.tick_durations.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    pub fn status(&self) -> PerformanceStatus {
        self.status
    }

    /// Budget usage as percentage (0-100+)
    pub fn budget_usage_percent(&self) -> f32 {
        let avg = self.average_tick_duration();
        (avg.as_secs_f32() / self.target_tick_duration.as_secs_f32()) * 100.0
    }

    pub fn can_accept_clients(&self) -> bool {
        self.status.can_accept_clients()
    }

    pub fn can_spawn_content(&self) -> bool {
        self.status.can_spawn_content()
    }

    pub fn should_shed_content(&self) -> bool {
        self.status.should_shed_content()
    }

    pub fn last_entity_count(&self) -> usize {
        self.last_entity_count
    }

    pub fn status_message(&self) -> String {
        format!(
            "{:?} - {:.1}% budget, {} entities",
            self.status,
            self.budget_usage_percent(),
            self.last_entity_count
        )
    }

    /// Dynamic entity cap from the remaining budget. `None` means no limit.
    pub fn calculate_entity_budget(&self, current_count: usize) -> Option<usize> {
        if self.tick_durations.len() < MIN_SAMPLES {
            return None;
        }

        let budget_used = self.budget_usage_percent() / 100.0;

        if budget_used < 0.5 {
            None
        } else if budget_used >= 1.0 {
            // at or over budget: shrink by a quarter
            Some((current_count as f32 * 0.75).max(1.0) as usize)
        } else {
            let headroom = 1.0 / budget_used;
            let max_entities = (current_count as f32 * headroom).ceil() as usize;
            if max_entities <= current_count + 1 {
                Some(max_entities.max(1))
            } else {
                None
            }
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(30)
    }
}

//! Prometheus-compatible metrics endpoint
//!
//! Exposes tick timing, entity counts and replication traffic in Prometheus
//! text format. Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::game::game_loop::TickReport;

/// Samples kept for tick-time percentiles
const TICK_HISTORY_LEN: usize = 1000;

/// Metrics registry for one game instance
#[derive(Debug)]
pub struct Metrics {
    // World
    pub entity_count: AtomicU64,
    pub client_count: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Performance status (0=Excellent, 1=Good, 2=Warning, 3=Critical, 4=Catastrophic)
    pub performance_status: AtomicU64,
    pub budget_usage_percent: AtomicU64,

    // Replication traffic
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub commands_received: AtomicU64,
    pub joins_rejected: AtomicU64,

    // Per-record interest counters
    #[cfg(feature = "metrics_extended")]
    pub full_records: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub partial_records: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub deleted_records: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub entered_records: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub ids_released: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            entity_count: AtomicU64::new(0),
            client_count: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            performance_status: AtomicU64::new(0),
            budget_usage_percent: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            joins_rejected: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            full_records: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            partial_records: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            deleted_records: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            entered_records: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            ids_released: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY_LEN)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Fold one tick report into the gauges and counters
    pub fn record_tick_report(&self, report: &TickReport) {
        self.entity_count.store(report.entities as u64, Ordering::Relaxed);
        self.client_count.store(report.clients as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(report.packets_sent as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(report.bytes_sent as u64, Ordering::Relaxed);
        self.commands_received.fetch_add(report.commands as u64, Ordering::Relaxed);

        #[cfg(feature = "metrics_extended")]
        {
            self.full_records.fetch_add(report.full_records as u64, Ordering::Relaxed);
            self.partial_records.fetch_add(report.partial_records as u64, Ordering::Relaxed);
            self.deleted_records.fetch_add(report.deleted_records as u64, Ordering::Relaxed);
            self.entered_records.fetch_add(report.entered as u64, Ordering::Relaxed);
            self.ids_released.fetch_add(report.ids_released as u64, Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("bloom_arena_entities", "Live entities in the world", "gauge",
            self.entity_count.load(Ordering::Relaxed));
        metric!("bloom_arena_clients", "Connected clients", "gauge",
            self.client_count.load(Ordering::Relaxed));

        metric!("bloom_arena_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("bloom_arena_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("bloom_arena_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("bloom_arena_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("bloom_arena_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("bloom_arena_performance_status", "Performance status (0=Excellent, 4=Catastrophic)", "gauge",
            self.performance_status.load(Ordering::Relaxed));
        metric!("bloom_arena_budget_usage_percent", "Tick budget usage percentage", "gauge",
            self.budget_usage_percent.load(Ordering::Relaxed));

        let status_name = match self.performance_status.load(Ordering::Relaxed) {
            0 => "excellent",
            1 => "good",
            2 => "warning",
            3 => "critical",
            _ => "catastrophic",
        };
        output.push_str(&format!(
            "# HELP bloom_arena_performance_state Human-readable performance state\n# TYPE bloom_arena_performance_state gauge\nbloom_arena_performance_state{{state=\"{}\"}} 1\n",
            status_name
        ));

        metric!("bloom_arena_packets_sent_total", "Update packets handed to the transport", "counter",
            self.packets_sent.load(Ordering::Relaxed));
        metric!("bloom_arena_packets_dropped_total", "Update packets dropped by full or closed queues", "counter",
            self.packets_dropped.load(Ordering::Relaxed));
        metric!("bloom_arena_bytes_sent_total", "Total update bytes", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("bloom_arena_commands_received_total", "Client commands applied at tick boundaries", "counter",
            self.commands_received.load(Ordering::Relaxed));
        metric!("bloom_arena_joins_rejected_total", "Joins refused by admission control", "counter",
            self.joins_rejected.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            metric!("bloom_arena_full_records_total", "Full entity records sent", "counter",
                self.full_records.load(Ordering::Relaxed));
            metric!("bloom_arena_partial_records_total", "Partial entity records sent", "counter",
                self.partial_records.load(Ordering::Relaxed));
            metric!("bloom_arena_deleted_records_total", "Entity deletions sent", "counter",
                self.deleted_records.load(Ordering::Relaxed));
            metric!("bloom_arena_entered_records_total", "Entities that entered a client view", "counter",
                self.entered_records.load(Ordering::Relaxed));
            metric!("bloom_arena_ids_released_total", "Entity ids returned to the allocator", "counter",
                self.ids_released.load(Ordering::Relaxed));
        }

        metric!("bloom_arena_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = http_response(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn http_response(metrics: &Metrics, request: &str) -> String {
    if request.starts_with("GET /metrics") {
        let body = metrics.to_prometheus();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        let body = "OK";
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

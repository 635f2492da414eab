use serde::Serialize;
use std::sync::Mutex;

use crate::domain::error::ErrorCode;

use super::cache::Lookup;

const MAX_LATENCY_RECORDS: usize = 1000;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    cache_hits: u64,
    cache_misses: u64,
    cache_joins: u64,
    fetches: u64,
    runs_started: u64,
    runs_cancelled: u64,
    steps_completed: u64,
    sequences_finished: u64,
    errors_fetch: u64,
    errors_decode: u64,
    errors_timeout: u64,
    errors_other: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub kind: String,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_joins: u64,
    pub fetches: u64,
    pub runs_started: u64,
    pub runs_cancelled: u64,
    pub steps_completed: u64,
    pub sequences_finished: u64,
    pub error_counts: ErrorCounts,
    pub avg_fetch_latency_ms: Option<f64>,
    pub recent_latencies: Vec<LatencyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCounts {
    pub fetch: u64,
    pub decode: u64,
    pub timeout: u64,
    pub other: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    fn with_counters(&self, f: impl FnOnce(&mut MetricsCounters)) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut c);
    }

    pub fn record_lookup(&self, lookup: Lookup) {
        self.with_counters(|c| match lookup {
            Lookup::Hit => c.cache_hits += 1,
            Lookup::Joined => c.cache_joins += 1,
            Lookup::Fetched => c.cache_misses += 1,
        });
    }

    pub fn inc_fetches(&self) {
        self.with_counters(|c| c.fetches += 1);
    }

    pub fn inc_runs_started(&self) {
        self.with_counters(|c| c.runs_started += 1);
    }

    pub fn inc_runs_cancelled(&self) {
        self.with_counters(|c| c.runs_cancelled += 1);
    }

    pub fn inc_steps_completed(&self) {
        self.with_counters(|c| c.steps_completed += 1);
    }

    pub fn inc_sequences_finished(&self) {
        self.with_counters(|c| c.sequences_finished += 1);
    }

    pub fn inc_error(&self, code: ErrorCode) {
        self.with_counters(|c| match code {
            ErrorCode::Fetch => c.errors_fetch += 1,
            ErrorCode::Decode => c.errors_decode += 1,
            ErrorCode::Timeout => c.errors_timeout += 1,
            // キャンセルはエラーとして数えない
            ErrorCode::Cancelled => {}
            _ => c.errors_other += 1,
        });
    }

    pub fn record_latency(&self, kind: &str, duration_ms: u64) {
        let record = LatencyRecord {
            kind: kind.to_string(),
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        latencies.push(record);
        if latencies.len() > MAX_LATENCY_RECORDS {
            let excess = latencies.len() - MAX_LATENCY_RECORDS;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());

        let avg_fetch_latency_ms = if latencies.is_empty() {
            None
        } else {
            let sum: u64 = latencies.iter().map(|r| r.duration_ms).sum();
            Some(sum as f64 / latencies.len() as f64)
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            cache_hits: c.cache_hits,
            cache_misses: c.cache_misses,
            cache_joins: c.cache_joins,
            fetches: c.fetches,
            runs_started: c.runs_started,
            runs_cancelled: c.runs_cancelled,
            steps_completed: c.steps_completed,
            sequences_finished: c.sequences_finished,
            error_counts: ErrorCounts {
                fetch: c.errors_fetch,
                decode: c.errors_decode,
                timeout: c.errors_timeout,
                other: c.errors_other,
            },
            avg_fetch_latency_ms,
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

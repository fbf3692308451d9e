//! Thread-safe counters, a secrets gauge, and per-operation latency histograms,
//! rendered as Prometheus text exposition.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::store::Store;

/// Upper bounds (seconds) for the fixed-bucket latency histograms, per spec §4.5.
pub const BUCKET_BOUNDS: &[f64] = &[
    0.0005, 0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.200, 0.500, 1.0, 2.0, 5.0, 10.0,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Put,
    Get,
    Delete,
    List,
    Metrics,
}

impl OpKind {
    const ALL: [OpKind; 5] = [OpKind::Put, OpKind::Get, OpKind::Delete, OpKind::List, OpKind::Metrics];

    /// The three operations that record latency histograms, per spec §4.5.
    const TIMED: [OpKind; 3] = [OpKind::Put, OpKind::Get, OpKind::Delete];
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Put => "put",
            OpKind::Get => "get",
            OpKind::Delete => "delete",
            OpKind::List => "list",
            OpKind::Metrics => "metrics",
        };
        f.write_str(s)
    }
}

/// A fixed-bound cumulative histogram: `buckets[i]` counts observations
/// `<= BUCKET_BOUNDS[i]`, with one extra `+Inf` bucket at the end.
#[derive(Clone)]
struct Histogram {
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self { buckets: vec![0; BUCKET_BOUNDS.len() + 1], count: 0, sum: 0.0 }
    }

    fn observe(&mut self, seconds: f64) {
        self.count += 1;
        self.sum += seconds;
        for (i, bound) in BUCKET_BOUNDS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i] += 1;
            }
        }
        *self.buckets.last_mut().unwrap() += 1;
    }
}

struct Inner {
    ops: HashMap<OpKind, u64>,
    errors: HashMap<String, u64>,
    secrets_gauge: u64,
    histograms: HashMap<OpKind, Histogram>,
}

/// All metrics state behind a single mutex; operations are cheap counter
/// bumps so coarse locking costs nothing next to the syscalls already on
/// the request path.
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let histograms = OpKind::TIMED.iter().map(|op| (*op, Histogram::new())).collect();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                ops: HashMap::new(),
                errors: HashMap::new(),
                secrets_gauge: 0,
                histograms,
            }),
        })
    }

    pub fn record_op(&self, op: OpKind) {
        *self.inner.lock().unwrap().ops.entry(op).or_insert(0) += 1;
    }

    pub fn record_error(&self, kind: &str) {
        *self.inner.lock().unwrap().errors.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn observe_latency(&self, op: OpKind, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(h) = inner.histograms.get_mut(&op) {
            h.observe(elapsed.as_secs_f64());
        }
    }

    pub fn set_gauge(&self, value: u64) {
        self.inner.lock().unwrap().secrets_gauge = value;
    }

    /// Renders a Prometheus text-exposition snapshot. Refreshes the gauge
    /// from `store` first so a render always reflects the live count even
    /// if the refresh thread hasn't ticked yet.
    pub fn render(&self, store: &Store) -> String {
        self.set_gauge(store.size() as u64);
        let inner = self.inner.lock().unwrap();

        let mut out = String::new();
        out.push_str("# HELP secmem_ops_total Total number of successful operations.\n");
        out.push_str("# TYPE secmem_ops_total counter\n");
        for op in OpKind::ALL {
            let n = inner.ops.get(&op).copied().unwrap_or(0);
            out.push_str(&format!("secmem_ops_total{{op=\"{op}\"}} {n}\n"));
        }

        out.push_str("# HELP secmem_errors_total Total number of failed operations.\n");
        out.push_str("# TYPE secmem_errors_total counter\n");
        let mut error_kinds: Vec<&String> = inner.errors.keys().collect();
        error_kinds.sort();
        for kind in error_kinds {
            let n = inner.errors[kind];
            out.push_str(&format!("secmem_errors_total{{type=\"{kind}\"}} {n}\n"));
        }

        out.push_str("# HELP secmem_secrets_gauge Current number of secrets held in memory.\n");
        out.push_str("# TYPE secmem_secrets_gauge gauge\n");
        out.push_str(&format!("secmem_secrets_gauge {}\n", inner.secrets_gauge));

        out.push_str("# HELP secmem_latency_seconds Per-operation request latency.\n");
        out.push_str("# TYPE secmem_latency_seconds histogram\n");
        for op in OpKind::TIMED {
            let h = &inner.histograms[&op];
            for (bound, count) in BUCKET_BOUNDS.iter().zip(h.buckets.iter()) {
                out.push_str(&format!(
                    "secmem_latency_seconds_bucket{{op=\"{op}\",le=\"{bound}\"}} {count}\n"
                ));
            }
            out.push_str(&format!(
                "secmem_latency_seconds_bucket{{op=\"{op}\",le=\"+Inf\"}} {}\n",
                h.buckets.last().unwrap()
            ));
            out.push_str(&format!("secmem_latency_seconds_sum{{op=\"{op}\"}} {}\n", h.sum));
            out.push_str(&format!("secmem_latency_seconds_count{{op=\"{op}\"}} {}\n", h.count));
        }

        out
    }
}

/// Refreshes `secrets_gauge` from `store.size()` once per second, per spec §4.5.
pub struct GaugeRefresher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GaugeRefresher {
    pub fn spawn(metrics: Arc<Metrics>, store: Arc<Store>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_cl = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_cl.load(Ordering::Relaxed) {
                thread::sleep(period);
                metrics.set_gauge(store.size() as u64);
            }
        });
        Self { stop, handle: Some(handle) }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Measures a scope's wall-clock duration for latency histogram recording.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Crypto;

    #[test]
    fn histogram_buckets_are_cumulative_and_monotone() {
        let metrics = Metrics::new();
        for ms in [1, 5, 50, 500, 5000] {
            metrics.observe_latency(OpKind::Put, Duration::from_millis(ms));
        }
        let store = Store::new(Arc::new(Crypto::generate().unwrap()), None);
        let text = metrics.render(&store);
        let bucket_lines: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("secmem_latency_seconds_bucket{op=\"put\""))
            .collect();
        let mut prev = 0u64;
        for line in &bucket_lines {
            let n: u64 = line.rsplit(' ').next().unwrap().parse().unwrap();
            assert!(n >= prev, "bucket counts must be non-decreasing");
            prev = n;
        }
        assert_eq!(prev, 5);
    }

    #[test]
    fn render_contains_op_and_gauge_lines() {
        let metrics = Metrics::new();
        metrics.record_op(OpKind::Put);
        metrics.record_op(OpKind::Put);
        metrics.record_error("bad_op");
        let store = Store::new(Arc::new(Crypto::generate().unwrap()), None);
        let text = metrics.render(&store);
        assert!(text.contains("secmem_ops_total{op=\"put\"} 2"));
        assert!(text.contains("secmem_errors_total{type=\"bad_op\"} 1"));
        assert!(text.contains("secmem_secrets_gauge 0"));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Histograms keep at most this many recent observations.
const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

struct Gauge {
    // f64 bits
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn increment(&self, delta: f64) {
        loop {
            let current = self.value.load(Ordering::Relaxed);
            let next = f64::from_bits(current as u64) + delta;
            if self
                .value
                .compare_exchange_weak(
                    current,
                    next.to_bits() as i64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Sliding window of observations; `count` and `sum` cover every
/// observation ever made.
struct Histogram {
    inner: Mutex<HistogramInner>,
}

#[derive(Default)]
struct HistogramInner {
    window: Vec<f64>,
    next: usize,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HistogramInner::default()),
        }
    }

    fn observe(&self, value: f64) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        inner.sum += value;
        if inner.window.len() < HISTOGRAM_WINDOW {
            inner.window.push(value);
        } else {
            let slot = inner.next;
            inner.window[slot] = value;
            inner.next = (slot + 1) % HISTOGRAM_WINDOW;
        }
    }

    fn summary(&self) -> HistogramSummary {
        let inner = self.inner.lock();
        if inner.window.is_empty() {
            return HistogramSummary::default();
        }
        let (count, sum) = (inner.count, inner.sum);
        let mut obs = inner.window.clone();
        drop(inner);
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = obs.len();
        let at = |q: f64| obs[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count,
            sum,
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// One metric series at snapshot time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

/// Point-in-time view of every series, sorted by name then labels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub samples: Vec<MetricSample>,
}

impl MetricsSnapshot {
    pub fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&MetricSample> {
        let wanted = MetricKey::new(name, labels).label_map();
        self.samples
            .iter()
            .find(|s| s.name == name && s.labels == wanted)
    }
}

/// Thread-safe in-process metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        let mut counters = self.counters.write();
        counters.entry(key).or_insert_with(Counter::new).increment(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        gauges.entry(key).or_insert_with(Gauge::new).set(value);
    }

    /// Increment/decrement a gauge by delta.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.increment(delta);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        gauges.entry(key).or_insert_with(Gauge::new).increment(delta);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        let mut histograms = self.histograms.write();
        histograms.entry(key).or_insert_with(Histogram::new).observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    /// Collect every series. Histograms report p50 as `value`.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut samples = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Counter,
                value: counter.get() as f64,
                summary: None,
            });
        }
        for (key, gauge) in self.gauges.read().iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Gauge,
                value: gauge.get(),
                summary: None,
            });
        }
        for (key, histogram) in self.histograms.read().iter() {
            let summary = histogram.summary();
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Histogram,
                value: summary.p50,
                summary: Some(summary),
            });
        }

        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        MetricsSnapshot { samples }
    }
}

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;

use super::MetricKind;

/// Trend values are stored in the histogram as fixed-point integers with
/// three decimal places (milliseconds become microseconds).
const TREND_SCALE: f64 = 1000.0;
const TREND_SIGFIG: u8 = 3;

fn new_histogram() -> Histogram<u64> {
    // Auto-resizing; construction only fails for sigfig > 5.
    Histogram::<u64>::new(TREND_SIGFIG).expect("valid histogram precision")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CounterStats {
    /// Sum of every recorded value.
    pub sum: f64,
    /// Number of samples recorded.
    pub samples: u64,
}

impl CounterStats {
    pub fn per_second(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs > 0.0 {
            self.sum / elapsed_secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateStats {
    /// Samples with a non-zero value.
    pub successes: u64,
    pub total: u64,
}

impl RateStats {
    /// Fraction of non-zero samples; `None` until something is recorded.
    pub fn rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.successes as f64 / self.total as f64)
        }
    }
}

/// Distribution snapshot of a Trend series.
///
/// Percentiles use the nearest-rank rule over the histogram's 3-significant-digit
/// buckets: the reported value is the upper bound of the bucket holding the
/// `ceil(q * count)`-th smallest sample. The same multiset of samples therefore
/// always yields the same percentile regardless of insertion order.
#[derive(Debug, Clone)]
pub struct TrendStats {
    histogram: Histogram<u64>,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl Default for TrendStats {
    fn default() -> Self {
        Self {
            histogram: new_histogram(),
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
        }
    }
}

impl TrendStats {
    fn record(&mut self, value: f64) {
        let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
        // Auto-resizing histogram, so out-of-range cannot happen.
        let _ = self.histogram.record(scaled);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    fn merge(&mut self, other: &TrendStats) {
        let _ = self.histogram.add(&other.histogram);
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// `pct` in `[0, 100]`.
    pub fn percentile(&self, pct: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let q = (pct / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(q) as f64 / TREND_SCALE;
        // Bucket upper bounds can overshoot the largest real sample.
        raw.clamp(self.min.max(0.0), self.max.max(0.0))
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }
}

impl PartialEq for TrendStats {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
            && self.sum == other.sum
            && self.min == other.min
            && self.max == other.max
            && self.histogram == other.histogram
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GaugeStats {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    #[serde(skip)]
    updated: Option<Instant>,
}

impl Default for GaugeStats {
    fn default() -> Self {
        Self {
            value: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            updated: None,
        }
    }
}

/// Aggregated view of one or more series of the same kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesStats {
    Counter(CounterStats),
    Rate(RateStats),
    Trend(TrendStats),
    Gauge(GaugeStats),
}

impl SeriesStats {
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => SeriesStats::Counter(CounterStats::default()),
            MetricKind::Rate => SeriesStats::Rate(RateStats::default()),
            MetricKind::Trend => SeriesStats::Trend(TrendStats::default()),
            MetricKind::Gauge => SeriesStats::Gauge(GaugeStats::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            SeriesStats::Counter(_) => MetricKind::Counter,
            SeriesStats::Rate(_) => MetricKind::Rate,
            SeriesStats::Trend(_) => MetricKind::Trend,
            SeriesStats::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Number of samples folded into this view.
    pub fn sample_count(&self) -> u64 {
        match self {
            SeriesStats::Counter(c) => c.samples,
            SeriesStats::Rate(r) => r.total,
            SeriesStats::Trend(t) => t.count,
            SeriesStats::Gauge(g) => u64::from(g.updated.is_some()),
        }
    }

    fn record(&mut self, value: f64, at: Instant) {
        match self {
            SeriesStats::Counter(c) => {
                c.sum += value;
                c.samples += 1;
            }
            SeriesStats::Rate(r) => {
                r.total += 1;
                if value != 0.0 {
                    r.successes += 1;
                }
            }
            SeriesStats::Trend(t) => t.record(value),
            SeriesStats::Gauge(g) => {
                if g.updated.is_none_or(|prev| at >= prev) {
                    g.value = value;
                    g.updated = Some(at);
                }
                g.min = g.min.min(value);
                g.max = g.max.max(value);
            }
        }
    }

    /// Fold `other` into `self`. Kinds must match; mismatches are ignored.
    pub fn merge(&mut self, other: &SeriesStats) {
        match (self, other) {
            (SeriesStats::Counter(a), SeriesStats::Counter(b)) => {
                a.sum += b.sum;
                a.samples += b.samples;
            }
            (SeriesStats::Rate(a), SeriesStats::Rate(b)) => {
                a.successes += b.successes;
                a.total += b.total;
            }
            (SeriesStats::Trend(a), SeriesStats::Trend(b)) => a.merge(b),
            (SeriesStats::Gauge(a), SeriesStats::Gauge(b)) => {
                if b.updated.is_some() && a.updated.is_none_or(|ta| b.updated >= Some(ta)) {
                    a.value = b.value;
                    a.updated = b.updated;
                }
                a.min = a.min.min(b.min);
                a.max = a.max.max(b.max);
            }
            _ => {}
        }
    }
}

/// One `(name, tags)` series. Each series owns its lock so that workers
/// writing different series never contend.
pub(crate) struct Series {
    kind: MetricKind,
    state: Mutex<SeriesStats>,
}

impl Series {
    pub(crate) fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            state: Mutex::new(SeriesStats::empty(kind)),
        }
    }

    pub(crate) fn kind(&self) -> MetricKind {
        self.kind
    }

    pub(crate) fn record(&self, value: f64, at: Instant) {
        self.state.lock().record(value, at);
    }

    pub(crate) fn stats(&self) -> SeriesStats {
        self.state.lock().clone()
    }

    pub(crate) fn merge_into(&self, acc: &mut SeriesStats) {
        acc.merge(&self.state.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend_of(values: impl IntoIterator<Item = f64>) -> TrendStats {
        let mut stats = SeriesStats::empty(MetricKind::Trend);
        let now = Instant::now();
        for v in values {
            stats.record(v, now);
        }
        match stats {
            SeriesStats::Trend(t) => t,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_trend_basic_stats() {
        let t = trend_of((1..=100).map(|i| i as f64));
        assert_eq!(t.count, 100);
        assert_eq!(t.min, 1.0);
        assert_eq!(t.max, 100.0);
        assert!((t.avg() - 50.5).abs() < 1e-9);
        let p95 = t.percentile(95.0);
        assert!((94.9..=96.1).contains(&p95), "P95 was {}", p95);
        let med = t.med();
        assert!((49.9..=51.1).contains(&med), "Median was {}", med);
    }

    #[test]
    fn test_trend_percentile_is_deterministic() {
        let values: Vec<f64> = (0..1000).map(|i| ((i * 7919) % 1013) as f64 * 0.37).collect();
        let a = trend_of(values.clone());
        let b = trend_of(values.clone());
        assert_eq!(a.percentile(95.0).to_bits(), b.percentile(95.0).to_bits());

        // Insertion order does not matter either.
        let mut reversed = values;
        reversed.reverse();
        let c = trend_of(reversed);
        assert_eq!(a.percentile(95.0).to_bits(), c.percentile(95.0).to_bits());
        assert_eq!(a.percentile(99.0).to_bits(), c.percentile(99.0).to_bits());
    }

    #[test]
    fn test_trend_percentile_stays_within_sample_range() {
        let t = trend_of([12.345]);
        assert_eq!(t.percentile(99.0), 12.345);
        assert_eq!(t.percentile(0.0), 12.345);
    }

    #[test]
    fn test_rate_fraction() {
        let mut stats = SeriesStats::empty(MetricKind::Rate);
        let now = Instant::now();
        for i in 0..10 {
            stats.record(if i < 8 { 1.0 } else { 0.0 }, now);
        }
        match stats {
            SeriesStats::Rate(r) => {
                assert_eq!(r.total, 10);
                assert_eq!(r.successes, 8);
                assert_eq!(r.rate(), Some(0.8));
            }
            _ => unreachable!(),
        }
        assert_eq!(RateStats::default().rate(), None);
    }

    #[test]
    fn test_gauge_keeps_latest() {
        let mut stats = SeriesStats::empty(MetricKind::Gauge);
        let t0 = Instant::now();
        stats.record(10.0, t0);
        stats.record(25.0, t0 + std::time::Duration::from_millis(1));
        stats.record(5.0, t0 + std::time::Duration::from_millis(2));
        match stats {
            SeriesStats::Gauge(g) => {
                assert_eq!(g.value, 5.0);
                assert_eq!(g.min, 5.0);
                assert_eq!(g.max, 25.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_merge_counters_and_mismatch() {
        let now = Instant::now();
        let mut a = SeriesStats::empty(MetricKind::Counter);
        a.record(5.0, now);
        let mut b = SeriesStats::empty(MetricKind::Counter);
        b.record(3.0, now);
        b.record(2.0, now);
        a.merge(&b);
        assert_eq!(
            a,
            SeriesStats::Counter(CounterStats {
                sum: 10.0,
                samples: 3
            })
        );

        let rate = SeriesStats::empty(MetricKind::Rate);
        a.merge(&rate);
        assert_eq!(a.sample_count(), 3);
    }
}

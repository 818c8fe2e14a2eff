//! Performance metric values, cross-client aggregation, and
//! reservoir-sampled latency quantiles.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Default number of latency samples a workload keeps per reservoir.
pub const DEFAULT_RESERVOIR_SIZE: usize = 1000;

/// One named measurement reported by a workload client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfMetric {
    pub name: String,
    pub value: f64,
    /// Averaged metrics are divided by the reporting-client count when
    /// aggregated; additive metrics are summed.
    pub averaged: bool,
    pub format_code: String,
}

impl PerfMetric {
    pub fn new(name: impl Into<String>, value: f64, averaged: bool) -> Self {
        Self {
            name: name.into(),
            value,
            averaged,
            format_code: "%.3g".to_string(),
        }
    }

    pub fn with_format(mut self, format_code: impl Into<String>) -> Self {
        self.format_code = format_code.into();
        self
    }

    /// Prefix the metric name, used by compound workloads to namespace
    /// child metrics by child description.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.name = format!("{prefix}{}", self.name);
        self
    }

    /// Render the value with the metric's C-style format code.
    pub fn formatted(&self) -> String {
        match self.format_code.as_str() {
            "%d" => format!("{}", self.value as i64),
            "%.1f" => format!("{:.1}", self.value),
            "%.2f" => format!("{:.2}", self.value),
            _ => format!("{:.3}", self.value),
        }
    }
}

/// Reduce per-client metric vectors into one vector keyed by metric name.
///
/// Values are summed per name; a group whose first sample is averaged is
/// divided by the group size. The format code comes from the first sample,
/// and a synthetic `Reporting Clients` metric records how many clients
/// contributed.
pub fn aggregate_metrics(per_client: Vec<Vec<PerfMetric>>) -> Vec<PerfMetric> {
    let client_count = per_client.len();
    let mut groups: BTreeMap<String, Vec<PerfMetric>> = BTreeMap::new();
    for metrics in per_client {
        info!(count = metrics.len(), "metrics returned by client");
        for metric in metrics {
            groups.entry(metric.name.clone()).or_default().push(metric);
        }
    }

    let mut result = Vec::with_capacity(groups.len() + 1);
    for (name, samples) in groups {
        let mut sum: f64 = samples.iter().map(|m| m.value).sum();
        if samples[0].averaged {
            sum /= samples.len() as f64;
        }
        result.push(PerfMetric {
            name,
            value: sum,
            averaged: false,
            format_code: samples[0].format_code.clone(),
        });
    }
    result.push(
        PerfMetric::new("Reporting Clients", client_count as f64, false).with_format("%d"),
    );
    result
}

/// Log every aggregated metric as a structured event.
pub fn log_metrics(metrics: &[PerfMetric]) {
    for metric in metrics {
        info!(
            name = %metric.name,
            value = metric.value,
            formatted = %metric.formatted(),
            "metric"
        );
    }
}

/// Fixed-size uniform sample over a latency stream of unknown length.
///
/// The k-th recorded sample (1-based) is stored directly while the
/// reservoir is filling; afterwards it replaces a uniformly random slot
/// with probability R/k, which keeps every observed sample equally likely
/// to be retained.
#[derive(Debug)]
pub struct LatencyReservoir {
    capacity: usize,
    samples: Vec<f64>,
    recorded: u64,
    rng: StdRng,
}

impl LatencyReservoir {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            recorded: 0,
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    fn with_seed(capacity: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            recorded: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn record(&mut self, latency_secs: f64) {
        self.recorded += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(latency_secs);
        } else {
            let index = self.rng.gen_range(0..self.recorded) as usize;
            if index < self.samples.len() {
                self.samples[index] = latency_secs;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total samples ever recorded, not just those retained.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted
    }

    pub fn median(&self) -> f64 {
        self.quantile_at(|n| n / 2)
    }

    pub fn p90(&self) -> f64 {
        self.quantile_at(|n| 9 * n / 10)
    }

    pub fn p99(&self) -> f64 {
        self.quantile_at(|n| 99 * n / 100)
    }

    fn quantile_at(&self, index_of: impl Fn(usize) -> usize) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sorted = self.sorted();
        sorted[index_of(sorted.len()).min(sorted.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn additive_metrics_sum() {
        let aggregated = aggregate_metrics(vec![
            vec![PerfMetric::new("ops", 10.0, false)],
            vec![PerfMetric::new("ops", 20.0, false)],
            vec![PerfMetric::new("ops", 30.0, false)],
        ]);
        let ops = aggregated.iter().find(|m| m.name == "ops").unwrap();
        assert_eq!(ops.value, 60.0);
        assert!(!ops.averaged);
    }

    #[test]
    fn averaged_metrics_divide_by_group_size() {
        let aggregated = aggregate_metrics(vec![
            vec![PerfMetric::new("latency", 2.0, true)],
            vec![PerfMetric::new("latency", 4.0, true)],
        ]);
        let latency = aggregated.iter().find(|m| m.name == "latency").unwrap();
        assert_eq!(latency.value, 3.0);
    }

    #[test]
    fn reporting_clients_reflects_client_count() {
        let aggregated = aggregate_metrics(vec![vec![], vec![], vec![]]);
        let clients = aggregated
            .iter()
            .find(|m| m.name == "Reporting Clients")
            .unwrap();
        assert_eq!(clients.value, 3.0);
        assert_eq!(clients.formatted(), "3");
    }

    #[test]
    fn reservoir_never_exceeds_capacity() {
        let mut reservoir = LatencyReservoir::with_seed(100, 7);
        for i in 0..10_000 {
            reservoir.record(i as f64 / 1000.0);
        }
        assert_eq!(reservoir.len(), 100);
        assert_eq!(reservoir.recorded(), 10_000);
    }

    #[test]
    fn reservoir_fills_in_order_until_capacity() {
        let mut reservoir = LatencyReservoir::with_seed(4, 1);
        for v in [0.4, 0.1, 0.3, 0.2] {
            reservoir.record(v);
        }
        assert_eq!(reservoir.len(), 4);
        assert_eq!(reservoir.median(), 0.3);
        assert_eq!(reservoir.p99(), 0.4);
    }

    #[test]
    fn empty_reservoir_reports_zero_quantiles() {
        let reservoir = LatencyReservoir::new(10);
        assert_eq!(reservoir.median(), 0.0);
        assert_eq!(reservoir.p90(), 0.0);
        assert_eq!(reservoir.p99(), 0.0);
    }

    proptest! {
        #[test]
        fn aggregation_of_additive_groups_is_the_sum(
            values in prop::collection::vec(0.0f64..1e6, 1..20)
        ) {
            let per_client: Vec<_> = values
                .iter()
                .map(|v| vec![PerfMetric::new("m", *v, false)])
                .collect();
            let expected: f64 = values.iter().sum();
            let aggregated = aggregate_metrics(per_client);
            let m = aggregated.iter().find(|m| m.name == "m").unwrap();
            prop_assert!((m.value - expected).abs() < 1e-6);
        }

        #[test]
        fn reservoir_size_bound_holds(count in 1usize..5000, capacity in 1usize..64) {
            let mut reservoir = LatencyReservoir::with_seed(capacity, 42);
            for i in 0..count {
                reservoir.record(i as f64);
            }
            prop_assert!(reservoir.len() <= capacity);
            prop_assert_eq!(reservoir.len(), count.min(capacity));
        }
    }
}

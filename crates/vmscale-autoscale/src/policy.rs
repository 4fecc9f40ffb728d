//! Scaling signals from aggregated utilization.

use std::fmt;

use vmscale_core::ScaleStrategy;
use vmscale_metrics::{MetricsResult, MetricsStore, aggregate};
use vmscale_state::HostRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleSignal {
    Up,
    Down,
    #[default]
    Hold,
}

impl ScaleSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Hold => "hold",
        }
    }
}

impl fmt::Display for ScaleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One target metric reduced to a single value for the decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub metric: String,
    /// Target utilization percent.
    pub target: f64,
    /// `None` when the window held no samples.
    pub value: Option<f64>,
}

/// Combines per-metric observations into one signal.
pub trait DecisionPolicy: Send + Sync {
    fn decide(&self, observations: &[Observation], strategy: &ScaleStrategy) -> ScaleSignal;
}

/// Any metric above its target scales up; every known metric below
/// `target * scaleDownRatio` scales down. Metrics without samples are
/// ignored, and with none known the group holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdPolicy;

impl DecisionPolicy for ThresholdPolicy {
    fn decide(&self, observations: &[Observation], strategy: &ScaleStrategy) -> ScaleSignal {
        let known: Vec<(f64, f64)> = observations
            .iter()
            .filter_map(|o| o.value.map(|v| (v, o.target)))
            .collect();
        if known.is_empty() {
            return ScaleSignal::Hold;
        }
        if known.iter().any(|(value, target)| value > target) {
            return ScaleSignal::Up;
        }
        let ratio = strategy.scale_down_ratio;
        if known.iter().all(|(value, target)| *value < target * ratio) {
            ScaleSignal::Down
        } else {
            ScaleSignal::Hold
        }
    }
}

/// Aggregate every target metric over the trailing window of all `hosts`.
pub fn observe(
    metrics: &MetricsStore,
    hosts: &[HostRecord],
    strategy: &ScaleStrategy,
    trailing: usize,
) -> MetricsResult<Vec<Observation>> {
    let mut observations = Vec::with_capacity(strategy.target_utilization.len());
    for (metric, target) in &strategy.target_utilization {
        let mut values = Vec::new();
        for host in hosts {
            let window = metrics.trailing_window(&host.name, metric, trailing)?;
            values.extend(window.into_iter().map(|s| s.value));
        }
        observations.push(Observation {
            metric: metric.clone(),
            target: *target,
            value: aggregate(strategy.method, &values),
        });
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vmscale_core::{AggregationMethod, HypervisorKind, Protocol, Resources};
    use vmscale_metrics::Sample;

    fn strategy() -> ScaleStrategy {
        let mut targets = BTreeMap::new();
        targets.insert("cpu".to_string(), 70.0);
        targets.insert("memory".to_string(), 80.0);
        ScaleStrategy {
            min: 1,
            max: 4,
            desired: 2,
            increment: 1,
            cooldown: 60,
            method: AggregationMethod::Mean,
            target_utilization: targets,
            scale_down_ratio: 0.5,
        }
    }

    fn obs(metric: &str, target: f64, value: Option<f64>) -> Observation {
        Observation {
            metric: metric.into(),
            target,
            value,
        }
    }

    fn host(name: &str) -> HostRecord {
        HostRecord {
            name: name.into(),
            address: "10.0.0.1".into(),
            protocol: Protocol::Ssh,
            port: 22,
            hypervisor: HypervisorKind::Qemu,
            user: None,
            resources: Resources::new(8, 16384, 100),
            powered: true,
            updated_at: 0,
        }
    }

    #[test]
    fn any_breach_scales_up() {
        let p = ThresholdPolicy;
        let s = strategy();
        let o = [obs("cpu", 70.0, Some(85.0)), obs("memory", 80.0, Some(10.0))];
        assert_eq!(p.decide(&o, &s), ScaleSignal::Up);
    }

    #[test]
    fn all_comfortably_under_scales_down() {
        let p = ThresholdPolicy;
        let s = strategy();
        let o = [obs("cpu", 70.0, Some(20.0)), obs("memory", 80.0, Some(30.0))];
        assert_eq!(p.decide(&o, &s), ScaleSignal::Down);

        // One metric between the bands holds.
        let o = [obs("cpu", 70.0, Some(20.0)), obs("memory", 80.0, Some(50.0))];
        assert_eq!(p.decide(&o, &s), ScaleSignal::Hold);
    }

    #[test]
    fn ties_hold() {
        let p = ThresholdPolicy;
        let s = strategy();
        assert_eq!(p.decide(&[obs("cpu", 70.0, Some(70.0))], &s), ScaleSignal::Hold);
        assert_eq!(p.decide(&[obs("cpu", 70.0, Some(35.0))], &s), ScaleSignal::Hold);
    }

    #[test]
    fn unknown_metrics_are_excluded() {
        let p = ThresholdPolicy;
        let s = strategy();
        assert_eq!(
            p.decide(&[obs("cpu", 70.0, None), obs("memory", 80.0, None)], &s),
            ScaleSignal::Hold
        );
        assert_eq!(
            p.decide(&[obs("cpu", 70.0, Some(5.0)), obs("memory", 80.0, None)], &s),
            ScaleSignal::Down
        );
    }

    #[test]
    fn observe_aggregates_across_hosts_and_window() {
        let metrics = MetricsStore::open_in_memory().unwrap();
        for (ts, v) in [(1, 60.0), (2, 80.0)] {
            metrics.record("hv-1", "cpu", Sample::new(ts, v)).unwrap();
        }
        // The oldest hv-2 sample falls outside a window of two.
        for (ts, v) in [(0, 0.0), (1, 100.0), (2, 20.0)] {
            metrics.record("hv-2", "cpu", Sample::new(ts, v)).unwrap();
        }

        let hosts = [host("hv-1"), host("hv-2")];
        let observed = observe(&metrics, &hosts, &strategy(), 2).unwrap();
        let cpu = observed.iter().find(|o| o.metric == "cpu").unwrap();
        let memory = observed.iter().find(|o| o.metric == "memory").unwrap();
        assert_eq!(cpu.value, Some(65.0));
        assert_eq!(memory.value, None);
    }
}

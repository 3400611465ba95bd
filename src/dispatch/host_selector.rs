//! Strategies for choosing one host out of an eligible pool.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::models::{Host, ParseEnumError};

/// Hosts reporting a startup newer than this look proportionally busier.
const DEFAULT_WARM_UP: Duration = Duration::from_secs(10 * 60);

pub trait HostSelector: Send + Sync {
    /// `None` only when `hosts` is empty.
    fn select(&self, hosts: &[Host]) -> Option<Host>;
}

fn effective_weight(host: &Host) -> i64 {
    i64::from(host.weight.max(1))
}

/// Smooth weighted round robin: each pick adds every host's weight to its
/// running score, takes the highest, then subtracts the pool total from it.
#[derive(Default)]
pub struct RoundRobinSelector {
    scores: Mutex<HashMap<String, i64>>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSelector for RoundRobinSelector {
    fn select(&self, hosts: &[Host]) -> Option<Host> {
        if hosts.len() <= 1 {
            return hosts.first().cloned();
        }
        let mut scores = self.scores.lock().expect("round robin scores poisoned");
        scores.retain(|address, _| hosts.iter().any(|host| &host.address == address));

        let total: i64 = hosts.iter().map(effective_weight).sum();
        let mut best: Option<(usize, i64)> = None;
        for (index, host) in hosts.iter().enumerate() {
            let score = scores.entry(host.address.clone()).or_insert(0);
            *score += effective_weight(host);
            if best.is_none_or(|(_, best_score)| *score > best_score) {
                best = Some((index, *score));
            }
        }
        let (index, _) = best?;
        let chosen = &hosts[index];
        if let Some(score) = scores.get_mut(&chosen.address) {
            *score -= total;
        }
        Some(chosen.clone())
    }
}

/// Weighted random choice.
#[derive(Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl HostSelector for RandomSelector {
    fn select(&self, hosts: &[Host]) -> Option<Host> {
        if hosts.len() <= 1 {
            return hosts.first().cloned();
        }
        let total: i64 = hosts.iter().map(effective_weight).sum();
        let mut ticket = rand::thread_rng().gen_range(0..total);
        for host in hosts {
            ticket -= effective_weight(host);
            if ticket < 0 {
                return Some(host.clone());
            }
        }
        hosts.last().cloned()
    }
}

/// Picks the host with the lowest load score computed from its heartbeat.
/// Hosts without a heartbeat rank after every host that has one; ties rotate.
pub struct LowerWeightSelector {
    warm_up: Duration,
    cursor: AtomicUsize,
}

impl Default for LowerWeightSelector {
    fn default() -> Self {
        Self::new(DEFAULT_WARM_UP)
    }
}

impl LowerWeightSelector {
    pub fn new(warm_up: Duration) -> Self {
        Self {
            warm_up,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Load score for `host` at `now`; lower is better.
    pub fn load_score(&self, host: &Host, now: DateTime<Utc>) -> f64 {
        let Some(workload) = &host.workload else {
            return f64::MAX;
        };
        let cpu = workload.cpu_usage * 10.0;
        let memory = workload.memory_usage * 20.0;
        let load = workload.load_average * 70.0;
        let base = cpu + memory + load;
        let uptime = (now - workload.startup_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if self.warm_up.is_zero() || uptime >= self.warm_up {
            return base;
        }
        let factor = (uptime.as_secs_f64() / self.warm_up.as_secs_f64()).max(0.1);
        (base + 1.0) / factor
    }

    fn select_at(&self, hosts: &[Host], now: DateTime<Utc>) -> Option<Host> {
        let scores: Vec<f64> = hosts.iter().map(|host| self.load_score(host, now)).collect();
        let lowest = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let tied: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|(_, score)| (**score - lowest).abs() <= f64::EPSILON)
            .map(|(index, _)| index)
            .collect();
        if tied.is_empty() {
            return None;
        }
        let pick = self.cursor.fetch_add(1, Ordering::Relaxed) % tied.len();
        Some(hosts[tied[pick]].clone())
    }
}

impl HostSelector for LowerWeightSelector {
    fn select(&self, hosts: &[Host]) -> Option<Host> {
        self.select_at(hosts, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostSelectorKind {
    RoundRobin,
    Random,
    #[default]
    LowerWeight,
}

impl HostSelectorKind {
    pub fn build(self) -> Arc<dyn HostSelector> {
        match self {
            HostSelectorKind::RoundRobin => Arc::new(RoundRobinSelector::new()),
            HostSelectorKind::Random => Arc::new(RandomSelector::new()),
            HostSelectorKind::LowerWeight => Arc::new(LowerWeightSelector::default()),
        }
    }
}

impl FromStr for HostSelectorKind {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ROUND_ROBIN" => Ok(HostSelectorKind::RoundRobin),
            "RANDOM" => Ok(HostSelectorKind::Random),
            "LOWER_WEIGHT" => Ok(HostSelectorKind::LowerWeight),
            _ => Err(ParseEnumError {
                kind: "host selector",
                value: value.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostWorkload;

    fn host(address: &str, weight: u32) -> Host {
        Host::new(address, weight, "default")
    }

    fn loaded(address: &str, cpu: f64, startup_time: DateTime<Utc>) -> Host {
        host(address, 100).with_workload(HostWorkload {
            cpu_usage: cpu,
            memory_usage: 0.2,
            load_average: 0.1,
            startup_time,
        })
    }

    #[test]
    fn empty_pool_selects_nothing() {
        for kind in [
            HostSelectorKind::RoundRobin,
            HostSelectorKind::Random,
            HostSelectorKind::LowerWeight,
        ] {
            assert!(kind.build().select(&[]).is_none());
        }
    }

    #[test]
    fn round_robin_is_smooth_and_weighted() {
        let selector = RoundRobinSelector::new();
        let hosts = vec![host("a:1", 5), host("b:1", 1), host("c:1", 1)];
        let picks: Vec<String> = (0..7)
            .filter_map(|_| selector.select(&hosts))
            .map(|host| host.address)
            .collect();
        assert_eq!(
            picks,
            vec!["a:1", "a:1", "b:1", "a:1", "c:1", "a:1", "a:1"]
        );
    }

    #[test]
    fn round_robin_equal_weights_rotate() {
        let selector = RoundRobinSelector::new();
        let hosts = vec![host("a:1", 1), host("b:1", 1)];
        let first = selector.select(&hosts).expect("host");
        let second = selector.select(&hosts).expect("host");
        assert_ne!(first.address, second.address);
    }

    #[test]
    fn random_only_returns_pool_members() {
        let selector = RandomSelector::new();
        let hosts = vec![host("a:1", 1), host("b:1", 3)];
        for _ in 0..50 {
            let picked = selector.select(&hosts).expect("host");
            assert!(hosts.contains(&picked));
        }
    }

    #[test]
    fn lower_weight_prefers_idle_host() {
        let now = Utc::now();
        let started = now - chrono::Duration::hours(1);
        let selector = LowerWeightSelector::default();
        let hosts = vec![
            loaded("busy:1", 0.9, started),
            loaded("idle:1", 0.1, started),
            host("unknown:1", 100),
        ];
        for _ in 0..3 {
            assert_eq!(
                selector.select_at(&hosts, now).map(|host| host.address),
                Some("idle:1".to_string())
            );
        }
    }

    #[test]
    fn lower_weight_penalises_warming_hosts() {
        let now = Utc::now();
        let selector = LowerWeightSelector::default();
        let fresh = loaded("fresh:1", 0.1, now - chrono::Duration::seconds(30));
        let steady = loaded("steady:1", 0.3, now - chrono::Duration::hours(2));
        assert!(selector.load_score(&fresh, now) > selector.load_score(&steady, now));
        assert_eq!(
            selector
                .select_at(&[fresh, steady], now)
                .map(|host| host.address),
            Some("steady:1".to_string())
        );
    }

    #[test]
    fn selector_kind_parses() {
        assert_eq!(
            "round_robin".parse::<HostSelectorKind>(),
            Ok(HostSelectorKind::RoundRobin)
        );
        assert_eq!(
            "LOWER_WEIGHT".parse::<HostSelectorKind>(),
            Ok(HostSelectorKind::LowerWeight)
        );
        assert!("FASTEST".parse::<HostSelectorKind>().is_err());
    }
}

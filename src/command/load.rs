//! Host load sampling and the overload gate in front of command fetching.

use std::sync::Mutex;

use sysinfo::{Disks, Pid, ProcessesToUpdate, System};

/// Usage ratios in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SystemMetrics {
    pub system_cpu_usage: f64,
    pub process_cpu_usage: f64,
    pub system_memory_usage: f64,
    pub disk_usage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadProtectionConfig {
    pub enabled: bool,
    pub max_system_cpu_usage: f64,
    pub max_process_cpu_usage: f64,
    pub max_system_memory_usage: f64,
    pub max_disk_usage: f64,
}

impl Default for LoadProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_system_cpu_usage: 0.7,
            max_process_cpu_usage: 0.7,
            max_system_memory_usage: 0.7,
            max_disk_usage: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadProtection {
    config: LoadProtectionConfig,
}

impl LoadProtection {
    pub fn new(config: LoadProtectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoadProtectionConfig {
        &self.config
    }

    /// A metric exactly at its threshold is not an overload.
    pub fn is_overload(&self, metrics: &SystemMetrics) -> bool {
        if !self.config.enabled {
            return false;
        }
        metrics.system_cpu_usage > self.config.max_system_cpu_usage
            || metrics.process_cpu_usage > self.config.max_process_cpu_usage
            || metrics.system_memory_usage > self.config.max_system_memory_usage
            || metrics.disk_usage > self.config.max_disk_usage
    }
}

pub trait SystemMetricsCollector: Send + Sync {
    fn collect(&self) -> SystemMetrics;
}

struct Sampler {
    system: System,
    /// Enumerated once; each sample only refreshes usage.
    disks: Disks,
}

/// Samples the local host with `sysinfo`. CPU figures are deltas since the
/// previous sample, so the first reading is low.
pub struct SysinfoMetricsCollector {
    sampler: Mutex<Sampler>,
    pid: Option<Pid>,
    cpus: usize,
}

impl SysinfoMetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            sampler: Mutex::new(Sampler {
                system,
                disks: Disks::new_with_refreshed_list(),
            }),
            pid: sysinfo::get_current_pid().ok(),
            cpus: num_cpus::get().max(1),
        }
    }
}

fn disk_usage(disks: &Disks) -> f64 {
    let (total, available) = disks
        .list()
        .iter()
        .fold((0u64, 0u64), |(total, available), disk| {
            (total + disk.total_space(), available + disk.available_space())
        });
    ratio(total.saturating_sub(available), total)
}

impl Default for SysinfoMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetricsCollector for SysinfoMetricsCollector {
    fn collect(&self) -> SystemMetrics {
        let mut sampler = self.sampler.lock().expect("sysinfo poisoned");
        let Sampler { system, disks } = &mut *sampler;
        disks.refresh();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let process_cpu_usage = match self.pid {
            Some(pid) => {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                system
                    .process(pid)
                    .map(|process| f64::from(process.cpu_usage()) / (100.0 * self.cpus as f64))
                    .unwrap_or(0.0)
            }
            None => 0.0,
        };

        SystemMetrics {
            system_cpu_usage: f64::from(system.global_cpu_usage()) / 100.0,
            process_cpu_usage,
            system_memory_usage: ratio(system.used_memory(), system.total_memory()),
            disk_usage: disk_usage(disks),
        }
    }
}

fn ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64
    }
}

/// Collector returning whatever was last stored.
#[derive(Default)]
pub struct FixedMetricsCollector {
    metrics: Mutex<SystemMetrics>,
}

impl FixedMetricsCollector {
    pub fn new(metrics: SystemMetrics) -> Self {
        Self {
            metrics: Mutex::new(metrics),
        }
    }

    pub fn set(&self, metrics: SystemMetrics) {
        *self.metrics.lock().expect("metrics poisoned") = metrics;
    }
}

impl SystemMetricsCollector for FixedMetricsCollector {
    fn collect(&self) -> SystemMetrics {
        *self.metrics.lock().expect("metrics poisoned")
    }
}

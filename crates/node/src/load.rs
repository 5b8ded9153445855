//! System load sampling for sizing the mining worker pool.

use parking_lot::Mutex;
use sysinfo::System;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadSample {
    /// Fraction of total CPU in use, 0.0 to 1.0.
    pub cpu_busy: f32,
    /// Fraction of memory still available, 0.0 to 1.0.
    pub memory_available: f32,
    pub cores: usize,
}

pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> LoadSample;
}

/// Reads CPU and memory figures from the operating system.
pub struct SystemProbe {
    system: Mutex<System>,
    cores: usize,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            cores: num_cpus::get().max(1),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SystemProbe {
    fn sample(&self) -> LoadSample {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        let cpu_busy = (system.global_cpu_info().cpu_usage() / 100.0).clamp(0.0, 1.0);
        let total = system.total_memory();
        let memory_available = if total == 0 {
            1.0
        } else {
            (system.available_memory() as f64 / total as f64) as f32
        };
        LoadSample {
            cpu_busy,
            memory_available,
            cores: self.cores,
        }
    }
}

/// Always reports the same sample.
pub struct FixedProbe(pub LoadSample);

impl LoadProbe for FixedProbe {
    fn sample(&self) -> LoadSample {
        self.0
    }
}

/// Below this fraction of free memory a mining attempt is refused.
pub const MIN_MEMORY_AVAILABLE: f32 = 0.05;

/// Workers worth running given the idle CPU share, between 1 and `max`.
/// `degrade` halves the result once per step after repeated timeouts.
pub fn adaptive_workers(sample: &LoadSample, max: usize, degrade: u32) -> usize {
    let max = max.max(1);
    let idle = (1.0 - sample.cpu_busy).clamp(0.0, 1.0);
    let mut workers = (sample.cores as f32 * idle).floor() as usize;
    if sample.memory_available < 0.2 {
        workers /= 2;
    }
    workers = workers.clamp(1, max);
    for _ in 0..degrade {
        workers = (workers / 2).max(1);
    }
    workers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu_busy: f32, memory_available: f32, cores: usize) -> LoadSample {
        LoadSample {
            cpu_busy,
            memory_available,
            cores,
        }
    }

    #[test]
    fn idle_machine_uses_all_allowed_workers() {
        assert_eq!(adaptive_workers(&sample(0.0, 0.9, 8), 4, 0), 4);
        assert_eq!(adaptive_workers(&sample(0.0, 0.9, 8), 16, 0), 8);
    }

    #[test]
    fn busy_machine_still_gets_one_worker() {
        assert_eq!(adaptive_workers(&sample(0.75, 0.9, 8), 16, 0), 2);
        assert_eq!(adaptive_workers(&sample(1.0, 0.9, 8), 16, 0), 1);
        assert_eq!(adaptive_workers(&sample(0.0, 0.1, 8), 16, 0), 4);
    }

    #[test]
    fn degrade_halves_down_to_one() {
        assert_eq!(adaptive_workers(&sample(0.0, 0.9, 8), 8, 1), 4);
        assert_eq!(adaptive_workers(&sample(0.0, 0.9, 8), 8, 5), 1);
    }

    #[test]
    fn system_probe_reports_sane_values() {
        let probe = SystemProbe::new();
        let sample = probe.sample();
        assert!(sample.cores >= 1);
        assert!((0.0..=1.0).contains(&sample.cpu_busy));
    }
}

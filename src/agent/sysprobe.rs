//! Host resource probing for registration specs and the per-run usage
//! sampler. Reads straight from /proc on Linux; other platforms report
//! zeros rather than fail.

use crate::registry::NodeSpecs;

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub cpu_percent: f64,
    pub ram_percent: f64,
}

/// One-shot CPU/RAM snapshot of the host.
pub fn sample_usage() -> UsageSnapshot {
    let mut snapshot = UsageSnapshot::default();

    #[cfg(target_os = "linux")]
    {
        if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
            if let Some(cpu_line) = stat.lines().next() {
                let parts: Vec<&str> = cpu_line.split_whitespace().collect();
                if parts.len() >= 5 && parts[0] == "cpu" {
                    let user: u64 = parts[1].parse().unwrap_or(0);
                    let nice: u64 = parts[2].parse().unwrap_or(0);
                    let system: u64 = parts[3].parse().unwrap_or(0);
                    let idle: u64 = parts[4].parse().unwrap_or(0);
                    let total = user + nice + system + idle;
                    if total > 0 {
                        let active = user + nice + system;
                        snapshot.cpu_percent = (active as f64 / total as f64) * 100.0;
                    }
                }
            }
        }

        let (total, available) = meminfo();
        if total > 0 {
            snapshot.ram_percent =
                (total.saturating_sub(available) as f64 / total as f64) * 100.0;
        }
    }

    snapshot
}

/// Specs reported at registration.
pub fn collect_specs() -> NodeSpecs {
    let usage = sample_usage();
    NodeSpecs {
        cpu_usage: usage.cpu_percent,
        ram_usage: usage.ram_percent,
        total_ram_gb: total_ram_gb(),
        os: std::env::consts::OS.to_string(),
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        processor: processor_model(),
        payout_addr: None,
        extra: Default::default(),
    }
}

#[cfg(target_os = "linux")]
fn meminfo() -> (u64, u64) {
    let mut total: u64 = 0;
    let mut available: u64 = 0;
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                match parts[0] {
                    "MemTotal:" => total = parts[1].parse().unwrap_or(0) * 1024,
                    "MemAvailable:" => available = parts[1].parse().unwrap_or(0) * 1024,
                    _ => {}
                }
            }
        }
    }
    (total, available)
}

#[cfg(target_os = "linux")]
fn total_ram_gb() -> f64 {
    let (total, _) = meminfo();
    (total as f64 / (1024.0 * 1024.0 * 1024.0) * 100.0).round() / 100.0
}

#[cfg(not(target_os = "linux"))]
fn total_ram_gb() -> f64 {
    0.0
}

fn processor_model() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
            for line in cpuinfo.lines() {
                if let Some(model) = line.strip_prefix("model name") {
                    if let Some((_, value)) = model.split_once(':') {
                        return value.trim().to_string();
                    }
                }
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_usage_yields_valid_percentages() {
        let snap = sample_usage();
        assert!(snap.cpu_percent >= 0.0 && snap.cpu_percent <= 100.0);
        assert!(snap.ram_percent >= 0.0 && snap.ram_percent <= 100.0);
    }

    #[test]
    fn specs_carry_platform_identity() {
        let specs = collect_specs();
        assert_eq!(specs.os, std::env::consts::OS);
        assert!(specs.platform.contains(std::env::consts::ARCH));
    }
}

use super::capacity::{HardwareCapacityReport, BYTES_PER_GIB};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::process::Command;
use sysinfo::System;
use tracing::{debug, info};

/// Share of unified memory usable by the GPU on Apple silicon.
const UNIFIED_MEMORY_ACCELERATOR_SHARE: f64 = 0.67;

/// Source of hardware capacity figures.
pub trait HardwareProbe: Send + Sync {
    /// Current capacity of the machine.
    fn capacity_snapshot(&self) -> HardwareCapacityReport;

    /// Descriptive machine information sent to the hub.
    fn machine_info(&self) -> MachineInfo {
        MachineInfo::from_report(&self.capacity_snapshot())
    }
}

/// Machine description announced in the startup sequence and on request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub gpu_type: String,
    pub cpu_type: String,
    pub cpu_count: usize,
    /// System memory in GiB
    pub memory_amount: u64,
    /// Accelerator memory in GiB, null when unknown
    pub video_memory_amount: Option<f64>,
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

impl MachineInfo {
    /// Description carrying only the numeric capacity values.
    pub fn from_report(report: &HardwareCapacityReport) -> Self {
        Self {
            gpu_type: "Unknown".to_string(),
            cpu_type: "Unknown".to_string(),
            cpu_count: report.cpu_cores,
            memory_amount: report.system_memory_gib,
            video_memory_amount: report.accelerator_memory_gib,
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Probe backed by `sysinfo` and the vendor GPU tooling.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }

    fn system_memory_gib() -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory() / BYTES_PER_GIB
    }

    fn cpu_cores() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Accelerator memory in GiB.
    ///
    /// Unified-memory Macs report a fixed share of system memory; elsewhere the
    /// first NVIDIA device reported by `nvidia-smi` is used.
    fn accelerator_memory_gib(system_memory_gib: u64) -> Option<f64> {
        if cfg!(target_os = "macos") {
            let share = (system_memory_gib as f64 * UNIFIED_MEMORY_ACCELERATOR_SHARE).floor();
            return (share > 0.0).then_some(share);
        }

        let total_mib = query_nvidia_smi("memory.total")?;
        match total_mib.parse::<f64>() {
            Ok(mib) => Some(mib / 1024.0),
            Err(e) => {
                debug!(value = %total_mib, error = %e, "Unparseable accelerator memory");
                None
            }
        }
    }

    fn gpu_type() -> String {
        if cfg!(target_os = "macos") {
            return "Apple unified memory GPU".to_string();
        }
        query_nvidia_smi("name").unwrap_or_else(|| "Unknown".to_string())
    }
}

impl HardwareProbe for SystemProbe {
    fn capacity_snapshot(&self) -> HardwareCapacityReport {
        let system_memory_gib = Self::system_memory_gib();
        let report = HardwareCapacityReport {
            accelerator_memory_gib: Self::accelerator_memory_gib(system_memory_gib),
            system_memory_gib,
            cpu_cores: Self::cpu_cores(),
        };

        debug!(
            accelerator_memory_gib = ?report.accelerator_memory_gib,
            system_memory_gib = report.system_memory_gib,
            cpu_cores = report.cpu_cores,
            "Hardware capacity snapshot"
        );

        report
    }

    fn machine_info(&self) -> MachineInfo {
        let report = self.capacity_snapshot();

        let mut sys = System::new_all();
        sys.refresh_all();
        let cpu_type = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        MachineInfo {
            gpu_type: Self::gpu_type(),
            cpu_type,
            ..MachineInfo::from_report(&report)
        }
    }
}

/// Run `nvidia-smi` for a single field of the first device.
fn query_nvidia_smi(field: &str) -> Option<String> {
    let output = Command::new("nvidia-smi")
        .arg(format!("--query-gpu={}", field))
        .arg("--format=csv,noheader,nounits")
        .output();

    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty()),
        Ok(output) => {
            debug!(status = %output.status, field, "nvidia-smi query failed");
            None
        }
        Err(e) => {
            debug!(error = %e, "nvidia-smi not available");
            None
        }
    }
}

/// Name this worker registers under: the friendly name (or hostname) plus a
/// short random suffix so restarts on one host do not collide.
pub fn worker_identifier(friendly_name: Option<&str>) -> String {
    let base = friendly_name
        .map(str::to_string)
        .or_else(System::host_name)
        .unwrap_or_else(|| "worker".to_string());
    let suffix: u8 = rand::thread_rng().gen_range(0..=2);
    let identifier = format!("{}-{}", base, suffix);

    info!(identifier = %identifier, "Configured worker identifier");
    identifier
}

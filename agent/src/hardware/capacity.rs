use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const BYTES_PER_GIB: u64 = 1 << 30;

/// Accelerator memory assumed when sizing resolutions on unknown hardware.
const UNKNOWN_ACCELERATOR_GIB: f64 = 8.0;

/// Below this many bytes of accelerator memory per output pixel, generation
/// should not run fully on the accelerator.
const PIXEL_BUDGET_BYTES_PER_PIXEL: f64 = 9000.0;

const OFFLOAD_CEILING_GIB: f64 = 48.0;
const SEQUENTIAL_OFFLOAD_CEILING_GIB: f64 = 10.0;

/// Minimum accelerator memory for advertising image generation.
const ACCELERATOR_JOB_MIN_GIB: f64 = 8.0;
const MEMORY_JOB_MIN_GIB: u64 = 16;
const COMPUTE_JOB_MIN_CORES: usize = 16;

/// Point-in-time capacity of this machine.
///
/// Recomputed per decision; never cached by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapacityReport {
    /// Accelerator memory in GiB, `None` when it could not be determined
    pub accelerator_memory_gib: Option<f64>,

    /// Total system memory in GiB
    pub system_memory_gib: u64,

    /// Logical core count
    pub cpu_cores: usize,
}

/// Limits announced to the hub at registration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardwareLimits {
    pub gpu: Option<f64>,
    pub memory: u64,
    pub cpu: usize,
}

impl HardwareCapacityReport {
    /// Number of model instances that may stay resident at once.
    ///
    /// - unknown accelerator memory: 1
    /// - exactly 8 GiB: 1
    /// - otherwise `floor(GiB / per_instance_footprint_gib)`, at least 1
    pub fn allowed_concurrent(&self, per_instance_footprint_gib: u64) -> usize {
        let Some(memory_gib) = self.accelerator_memory_gib else {
            return 1;
        };

        let whole_gib = memory_gib.max(0.0).floor() as u64;
        if whole_gib == 8 {
            return 1;
        }

        let footprint = per_instance_footprint_gib.max(1);
        ((whole_gib / footprint) as usize).max(1)
    }

    /// Whether the accelerator is too small (or unknown) to hold a model
    /// without offloading parts of it to host memory.
    pub fn offload_advised(&self) -> bool {
        match self.accelerator_memory_gib {
            Some(memory_gib) => memory_gib < OFFLOAD_CEILING_GIB,
            None => true,
        }
    }

    /// Whether layers should be streamed to the accelerator one at a time.
    pub fn sequential_offload_advised(&self) -> bool {
        match self.accelerator_memory_gib {
            Some(memory_gib) => memory_gib < SEQUENTIAL_OFFLOAD_CEILING_GIB,
            None => true,
        }
    }

    /// Whether a `width` x `height` output exceeds what the accelerator can
    /// render without offloading.
    pub fn exceeds_pixel_budget(&self, width: u32, height: u32) -> bool {
        let pixels = u64::from(width) * u64::from(height);
        if pixels == 0 {
            return false;
        }

        let memory_gib = self
            .accelerator_memory_gib
            .unwrap_or(UNKNOWN_ACCELERATOR_GIB);
        let bytes_per_pixel = memory_gib * BYTES_PER_GIB as f64 / pixels as f64;
        bytes_per_pixel < PIXEL_BUDGET_BYTES_PER_PIXEL
    }

    /// Job types this machine can serve, merged with explicitly enabled modules.
    pub fn supported_job_types(&self, enabled_modules: &[String]) -> BTreeMap<String, bool> {
        let mut job_types: BTreeMap<String, bool> = enabled_modules
            .iter()
            .map(|module| (module.clone(), true))
            .collect();

        if self
            .accelerator_memory_gib
            .is_some_and(|gib| gib >= ACCELERATOR_JOB_MIN_GIB)
        {
            job_types.insert("gpu".to_string(), true);
            job_types.insert("variation".to_string(), true);
        }
        if self.system_memory_gib >= MEMORY_JOB_MIN_GIB {
            job_types.insert("memory".to_string(), true);
        }
        if self.cpu_cores >= COMPUTE_JOB_MIN_CORES {
            job_types.insert("compute".to_string(), true);
        }

        job_types
    }

    pub fn hardware_limits(&self) -> HardwareLimits {
        HardwareLimits {
            gpu: self.accelerator_memory_gib,
            memory: self.system_memory_gib,
            cpu: self.cpu_cores,
        }
    }
}

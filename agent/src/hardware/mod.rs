//! Hardware capacity probing.
//!
//! The probe reports numeric capacity only; policy decisions built on top of it
//! (how many model instances fit, when to offload) live with the report so the
//! model cache can recompute them for every decision.

mod capacity;
mod probe;

pub use capacity::{HardwareCapacityReport, HardwareLimits, BYTES_PER_GIB};
pub use probe::{worker_identifier, HardwareProbe, MachineInfo, SystemProbe};

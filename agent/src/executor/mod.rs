//! Job execution for the hub worker.
//!
//! - `dispatcher`: supervised per-job tasks, admission, failure reporting
//! - `router`: maps (module, command) to a handler
//! - `handlers`: built-in `system` and `image_generation` commands
//! - `stats`: completion counters

mod dispatcher;
mod handlers;
mod router;
mod stats;
mod types;

pub use dispatcher::{Dispatcher, JobOutcome, SLOW_JOB_THRESHOLD};
pub use handlers::{HardwareInfoHandler, ImageGenerationHandler};
pub use router::{CommandHandler, CommandRouter, JobContext, ModuleRouter};
pub use stats::{ActiveJob, JobStats, JobStatsSnapshot};
pub use types::{failure_frame, JobError};

//! Local concurrency control.
//!
//! Jobs are admitted per class through counting semaphores, and blocking work
//! (model construction, model execution) runs on a bounded pool of blocking
//! threads. Nothing here coordinates with other workers.

mod admission;
mod pool;

pub use admission::{AdmissionController, AdmissionPermit, JobClass};
pub use pool::{PoolError, WorkerPool};

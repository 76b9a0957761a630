use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Concurrency class a job is admitted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    General,
    Accelerator,
    Specialized,
}

impl JobClass {
    pub const ALL: [JobClass; 3] = [JobClass::General, JobClass::Accelerator, JobClass::Specialized];

    /// Classify by the frame's `job_type`: `gpu` is accelerator work, `llama`
    /// is specialized, anything else (or nothing) is general.
    pub fn from_job_type(job_type: Option<&str>) -> Self {
        match job_type {
            Some("gpu") => JobClass::Accelerator,
            Some("llama") => JobClass::Specialized,
            _ => JobClass::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::General => "general",
            JobClass::Accelerator => "accelerator",
            JobClass::Specialized => "specialized",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permit held for the duration of one admitted job.
#[derive(Debug)]
pub struct AdmissionPermit {
    class: JobClass,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn class(&self) -> JobClass {
        self.class
    }
}

/// Three independent FIFO semaphores, one per [`JobClass`].
///
/// Sizes are fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    general: Arc<Semaphore>,
    accelerator: Arc<Semaphore>,
    specialized: Arc<Semaphore>,
    permits_per_class: usize,
}

impl AdmissionController {
    /// Create a controller with `permits_per_class` permits in every class.
    pub fn new(permits_per_class: usize) -> Self {
        let permits_per_class = permits_per_class.max(1);
        Self {
            general: Arc::new(Semaphore::new(permits_per_class)),
            accelerator: Arc::new(Semaphore::new(permits_per_class)),
            specialized: Arc::new(Semaphore::new(permits_per_class)),
            permits_per_class,
        }
    }

    fn semaphore(&self, class: JobClass) -> &Arc<Semaphore> {
        match class {
            JobClass::General => &self.general,
            JobClass::Accelerator => &self.accelerator,
            JobClass::Specialized => &self.specialized,
        }
    }

    /// Wait for a permit in `class`. Waiters are served in arrival order.
    ///
    /// Dropping the returned permit releases it.
    pub async fn admit(&self, class: JobClass) -> Result<AdmissionPermit, AcquireError> {
        let permit = self.semaphore(class).clone().acquire_owned().await?;
        debug!(
            class = %class,
            available = self.available(class),
            "Job admitted"
        );
        Ok(AdmissionPermit {
            class,
            _permit: permit,
        })
    }

    /// Permits currently free in `class`.
    pub fn available(&self, class: JobClass) -> usize {
        self.semaphore(class).available_permits()
    }

    pub fn permits_per_class(&self) -> usize {
        self.permits_per_class
    }
}

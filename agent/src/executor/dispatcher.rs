//! Job dispatch.
//!
//! The session receive loop hands every text frame to [`Dispatcher::dispatch_frame`]
//! and moves on. Each job runs as its own task in a `JoinSet`:
//!
//! ```text
//! frame → decode → spawn ─┬─ admit(class) → router → replies ─→ session
//!                         └─ any failure ──→ one job_failed frame ─┘
//! ```
//!
//! The dispatcher outlives individual sessions. Replies go to the session the
//! job arrived on, or to the current session if that one has since ended.

use super::router::JobContext;
use super::types::{failure_frame, JobError};
use crate::context::AgentContext;
use crate::protocol::{CommandId, Envelope, JobMessage};
use crate::scheduler::JobClass;
use crate::session::{CurrentSession, SessionError, SessionSender};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Jobs slower than this, admission wait included, are logged.
pub const SLOW_JOB_THRESHOLD: Duration = Duration::from_millis(500);

/// Result of one supervised job task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub command: CommandId,
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
struct InFlight {
    command: CommandId,
    class: JobClass,
    started: Instant,
}

type InFlightMap = Arc<Mutex<HashMap<Uuid, InFlight>>>;

/// Removes a job from the in-flight table when its task ends, however it ends.
struct InFlightGuard {
    job_id: Uuid,
    table: InFlightMap,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        table.remove(&self.job_id);
    }
}

pub struct Dispatcher {
    agent: Arc<AgentContext>,
    tasks: JoinSet<JobOutcome>,
    in_flight: InFlightMap,
}

impl Dispatcher {
    pub fn new(agent: Arc<AgentContext>) -> Self {
        Self {
            agent,
            tasks: JoinSet::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decode a text frame and dispatch it.
    ///
    /// A frame that does not decode still produces one `job_failed` frame.
    pub fn dispatch_frame(&mut self, frame: &str, session: &SessionSender) -> Option<Uuid> {
        match JobMessage::decode(frame) {
            Ok(job) => Some(self.dispatch(job, session.clone())),
            Err(e) => {
                let (module, command, context) = salvage_origin(frame);
                warn!(module = %module, command = %command, error = %e, "Rejecting undecodable frame");

                let error = JobError::from(e);
                let reply = failure_frame(&module, &command, context.as_ref(), &error);
                let session = session.clone();
                let current = self.agent.session.clone();
                let job_id = Uuid::new_v4();
                let command = CommandId::new(module, command);
                self.tasks.spawn(async move {
                    if let Err(send_err) = deliver(&session, &current, &reply).await {
                        error!(job_id = %job_id, error = %send_err, "Could not report undecodable frame");
                    }
                    JobOutcome {
                        job_id,
                        command,
                        succeeded: false,
                    }
                });
                None
            }
        }
    }

    /// Spawn a supervised task for `job`. Returns immediately.
    pub fn dispatch(&mut self, job: JobMessage, session: SessionSender) -> Uuid {
        let job_id = Uuid::new_v4();
        let entry = InFlight {
            command: job.command.clone(),
            class: job.class,
            started: Instant::now(),
        };
        {
            let mut table = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            table.insert(job_id, entry);
        }

        debug!(job_id = %job_id, command = %job.command, class = %job.class, "Dispatching job");

        let guard = InFlightGuard {
            job_id,
            table: Arc::clone(&self.in_flight),
        };
        let ctx = JobContext {
            job_id,
            session,
            agent: Arc::clone(&self.agent),
        };
        self.tasks.spawn(async move {
            let _guard = guard;
            run_job(job, ctx).await
        });

        job_id
    }

    pub fn has_outstanding(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next task to finish.
    pub async fn join_next(&mut self) -> Option<JobOutcome> {
        loop {
            match self.tasks.join_next().await? {
                Ok(outcome) => return Some(outcome),
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    error!(error = %e, "Job task ended abnormally");
                    continue;
                }
            }
        }
    }

    /// Log every job still running.
    pub fn log_outstanding(&self) {
        let table = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if table.is_empty() {
            return;
        }

        warn!(count = table.len(), "Jobs still in flight");
        for (job_id, entry) in table.iter() {
            warn!(
                job_id = %job_id,
                command = %entry.command,
                class = %entry.class,
                running_ms = entry.started.elapsed().as_millis() as u64,
                "Outstanding job"
            );
        }
    }

    /// Abort everything still running.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }
}

async fn run_job(job: JobMessage, ctx: JobContext) -> JobOutcome {
    let stats = Arc::clone(&ctx.agent.stats);
    let started = Instant::now();
    let active = stats.start_job();

    let result = AssertUnwindSafe(execute(&job, &ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(JobError::Execution(panic_message(panic))));

    let result = match result {
        Ok(replies) => deliver_all(&ctx, &replies).await,
        Err(e) => Err(e),
    };

    let elapsed = started.elapsed();
    if elapsed > SLOW_JOB_THRESHOLD {
        stats.record_slow();
        warn!(
            job_id = %ctx.job_id,
            command = %job.command,
            elapsed_ms = elapsed.as_millis() as u64,
            "Slow job"
        );
    }

    let succeeded = match result {
        Ok(()) => {
            active.succeeded(elapsed);
            info!(job_id = %ctx.job_id, command = %job.command, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
            true
        }
        Err(e) => {
            active.failed(elapsed);
            error!(
                job_id = %ctx.job_id,
                command = %job.command,
                error_kind = e.kind(),
                error = %e,
                "Job failed"
            );
            let reply = failure_frame(
                &job.command.module,
                &job.command.action,
                job.context.as_ref(),
                &e,
            );
            if let Err(send_err) = deliver(&ctx.session, &ctx.agent.session, &reply).await {
                error!(job_id = %ctx.job_id, error = %send_err, "Could not deliver failure frame");
            }
            false
        }
    };

    JobOutcome {
        job_id: ctx.job_id,
        command: job.command,
        succeeded,
    }
}

/// Admit, then route. The permit is released when this returns.
async fn execute(job: &JobMessage, ctx: &JobContext) -> Result<Vec<Envelope>, JobError> {
    let _permit = ctx
        .agent
        .admission
        .admit(job.class)
        .await
        .map_err(|_| JobError::AdmissionClosed(job.class))?;

    ctx.agent.router.handle(job, ctx).await
}

async fn deliver_all(ctx: &JobContext, replies: &[Envelope]) -> Result<(), JobError> {
    for reply in replies {
        deliver(&ctx.session, &ctx.agent.session, reply).await?;
    }
    Ok(())
}

/// Send on the originating session, falling back to the current one.
async fn deliver(
    origin: &SessionSender,
    current: &CurrentSession,
    envelope: &Envelope,
) -> Result<(), SessionError> {
    match origin.send(envelope).await {
        Err(SessionError::Gone(generation)) => {
            debug!(generation, "Origin session gone, using current session");
            current.send(envelope).await
        }
        other => other,
    }
}

/// Best-effort module, command and context from a frame that failed to decode.
fn salvage_origin(frame: &str) -> (String, String, Option<Value>) {
    let parsed = serde_json::from_str::<Value>(frame).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    let context = parsed
        .as_ref()
        .and_then(|v| v.get("context"))
        .filter(|v| !v.is_null())
        .cloned();

    (field("module_name"), field("module_command"), context)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("job panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("job panicked: {}", message)
    } else {
        "job panicked".to_string()
    }
}

//! Hub worker agent.
//!
//! Holds a persistent WebSocket session to a central hub, receives job frames,
//! admits them per concurrency class and runs them against a cache of
//! constructed model pipelines sized to the local hardware.

pub mod auth;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod hardware;
pub mod model;
pub mod observability;
pub mod protocol;
pub mod scheduler;
pub mod session;

pub use auth::{AuthProvider, AuthTicket, StaticToken, TicketAuth};
pub use config::AgentConfig;
pub use context::{AgentContext, AgentContextBuilder};
pub use errors::{AgentError, Result};
pub use executor::{CommandRouter, Dispatcher, JobError, ModuleRouter};
pub use hardware::{HardwareCapacityReport, HardwareProbe, MachineInfo, SystemProbe};
pub use model::{ModelBuilder, ModelInstanceCache};
pub use observability::{init_from_config, init_production_logging, init_simple_logging};
pub use protocol::{Envelope, JobMessage};
pub use scheduler::{AdmissionController, JobClass, WorkerPool};
pub use session::{
    startup_sequence, ConnectionSupervisor, SessionError, SessionState, SupervisorOutcome,
    WsTransport,
};

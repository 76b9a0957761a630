//! Process-wide state shared by the supervisor, dispatcher and handlers.

use crate::auth::{AuthProvider, TicketAuth};
use crate::config::{expand_home, AgentConfig};
use crate::errors::Result;
use crate::executor::{CommandRouter, JobStats, ModuleRouter};
use crate::hardware::{worker_identifier, HardwareProbe, SystemProbe};
use crate::model::{CachePolicy, ModelBuilder, ModelInstanceCache, UnavailableBuilder};
use crate::scheduler::{AdmissionController, WorkerPool};
use crate::session::CurrentSession;
use std::sync::Arc;
use tracing::info;

/// Everything a running worker shares, constructed once at startup.
pub struct AgentContext {
    pub config: AgentConfig,
    /// Identity announced to the hub
    pub worker_id: String,
    pub auth: Arc<dyn AuthProvider>,
    pub probe: Arc<dyn HardwareProbe>,
    pub pool: WorkerPool,
    pub cache: Arc<ModelInstanceCache>,
    pub admission: AdmissionController,
    pub router: Arc<dyn CommandRouter>,
    /// Live session, replaced on every reconnect
    pub session: CurrentSession,
    pub stats: Arc<JobStats>,
}

pub struct AgentContextBuilder {
    config: AgentConfig,
    worker_id: Option<String>,
    auth: Option<Arc<dyn AuthProvider>>,
    probe: Option<Arc<dyn HardwareProbe>>,
    model_builder: Option<Arc<dyn ModelBuilder>>,
    router: Option<Arc<dyn CommandRouter>>,
}

impl AgentContextBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            worker_id: None,
            auth: None,
            probe: None,
            model_builder: None,
            router: None,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HardwareProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_model_builder(mut self, builder: Arc<dyn ModelBuilder>) -> Self {
        self.model_builder = Some(builder);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn CommandRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Validate the configuration and wire the components together.
    pub fn build(self) -> Result<Arc<AgentContext>> {
        self.config.validate()?;

        let slots = self.config.worker.concurrent_slots;
        let worker_id = self
            .worker_id
            .unwrap_or_else(|| worker_identifier(self.config.worker.friendly_name.as_deref()));
        let auth = self.auth.unwrap_or_else(|| {
            Arc::new(TicketAuth::new(expand_home(&self.config.auth.ticket_path)))
        });
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemProbe::new()));
        let model_builder = self
            .model_builder
            .unwrap_or_else(|| Arc::new(UnavailableBuilder));
        let router = self
            .router
            .unwrap_or_else(|| Arc::new(ModuleRouter::with_builtin_handlers()));

        let pool = WorkerPool::new(slots);
        let cache = Arc::new(ModelInstanceCache::new(
            model_builder,
            Arc::clone(&probe),
            pool.clone(),
            CachePolicy::from(&self.config.cache),
        ));

        info!(
            worker_id = %worker_id,
            hub = %self.config.hub_url(),
            concurrent_slots = slots,
            "Agent context ready"
        );

        Ok(Arc::new(AgentContext {
            config: self.config,
            worker_id,
            auth,
            probe,
            pool,
            cache,
            admission: AdmissionController::new(slots),
            router,
            session: CurrentSession::new(),
            stats: Arc::new(JobStats::new()),
        }))
    }
}

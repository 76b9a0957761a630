//! Model instance cache
//!
//! Keeps at most a hardware-determined number of constructed model pipelines
//! resident, keyed by model id. Every structural change happens under one async
//! mutex, including construction, so two jobs asking for the same model build it
//! once.
//!
//! ## Acquire flow
//!
//! ```text
//! acquire(id, mode, scheduler, hints)
//!   │
//!   ├─ resident with other mode/scheduler? ──► evict
//!   ├─ not resident? ──► build on worker pool ──► apply scheduler ──► place
//!   ├─ touch recency, apply tiling hint
//!   ├─ over capacity? ──► evict least recently used (never `id`)
//!   └─ lease
//! ```

use super::builder::{ModelArtifact, ModelBuilder};
use super::types::{
    ArtifactError, BuildRecipe, CacheError, ExecutionMode, Placement, Precision,
    ResolutionHints, SchedulerChoice, SchedulerConfig,
};
use crate::config::CacheConfig;
use crate::hardware::{HardwareCapacityReport, HardwareProbe};
use crate::scheduler::WorkerPool;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Accelerators above this size may load full precision weights.
const FULL_PRECISION_MIN_GIB: f64 = 16.0;

/// Sizing and placement policy, read from the `[cache]` config section.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub concurrent_pipes: Option<usize>,
    pub per_instance_footprint_gib: u64,
    pub clear_accelerator_cache: bool,
    pub enable_offload: bool,
    pub enable_sequential_offload: bool,
    pub precision_bits: u8,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            concurrent_pipes: None,
            per_instance_footprint_gib: 10,
            clear_accelerator_cache: false,
            enable_offload: true,
            enable_sequential_offload: false,
            precision_bits: 16,
        }
    }
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            concurrent_pipes: config.concurrent_pipes,
            per_instance_footprint_gib: config.per_instance_footprint_gib,
            clear_accelerator_cache: config.clear_accelerator_cache,
            enable_offload: config.enable_offload,
            enable_sequential_offload: config.enable_sequential_offload,
            precision_bits: config.precision_bits,
        }
    }
}

impl CachePolicy {
    /// Resident instance limit. A configured `concurrent_pipes` wins over
    /// hardware sizing.
    pub fn allowed_concurrent(&self, report: &HardwareCapacityReport) -> usize {
        match self.concurrent_pipes {
            Some(pipes) => pipes.max(1),
            None => report.allowed_concurrent(self.per_instance_footprint_gib),
        }
    }

    pub fn placement(&self, report: &HardwareCapacityReport, hints: &ResolutionHints) -> Placement {
        if !self.enable_offload {
            return Placement::Accelerator;
        }

        let offload =
            report.offload_advised() || report.exceeds_pixel_budget(hints.width, hints.height);
        if !offload {
            return Placement::Accelerator;
        }

        Placement::HostOffload {
            sequential: self.enable_sequential_offload && report.sequential_offload_advised(),
        }
    }

    pub fn precision(&self, report: &HardwareCapacityReport) -> Precision {
        let roomy = report
            .accelerator_memory_gib
            .is_some_and(|gib| gib > FULL_PRECISION_MIN_GIB);
        if self.precision_bits == 32 && roomy {
            Precision::Full
        } else {
            Precision::Half
        }
    }
}

/// A built artifact owned by the cache and any outstanding leases.
///
/// Memory is released when the last holder drops it, so an instance evicted
/// while a job is still executing on it stays intact until that job finishes.
pub struct ResidentArtifact {
    model_id: String,
    artifact: Box<dyn ModelArtifact>,
}

impl ResidentArtifact {
    fn new(model_id: &str, artifact: Box<dyn ModelArtifact>) -> Self {
        Self {
            model_id: model_id.to_string(),
            artifact,
        }
    }
}

impl Deref for ResidentArtifact {
    type Target = dyn ModelArtifact;

    fn deref(&self) -> &Self::Target {
        self.artifact.as_ref()
    }
}

impl Drop for ResidentArtifact {
    fn drop(&mut self) {
        match self.artifact.release() {
            Ok(()) => debug!(model_id = %self.model_id, "Released model instance"),
            Err(e) => error!(
                model_id = %self.model_id,
                error = %e,
                "Failed to release model instance, dropping it anyway"
            ),
        }
    }
}

/// Read-only view of a resident entry handed to callers.
#[derive(Clone)]
pub struct ArtifactLease {
    pub model_id: String,
    pub handle: Arc<ResidentArtifact>,
    pub mode: ExecutionMode,
    pub scheduler_name: String,
    pub placement: Placement,
}

impl fmt::Debug for ArtifactLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactLease")
            .field("model_id", &self.model_id)
            .field("mode", &self.mode)
            .field("scheduler_name", &self.scheduler_name)
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}

/// Diagnostic snapshot of one resident entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidentEntry {
    pub model_id: String,
    pub mode: ExecutionMode,
    pub scheduler_name: String,
    pub placement: Placement,
    pub inserted_at: u64,
    pub last_used: u64,
}

struct CacheEntry {
    handle: Arc<ResidentArtifact>,
    mode: ExecutionMode,
    scheduler_name: String,
    placement: Placement,
    inserted_at: u64,
    last_used: u64,
}

impl CacheEntry {
    fn lease(&self, model_id: &str) -> ArtifactLease {
        ArtifactLease {
            model_id: model_id.to_string(),
            handle: Arc::clone(&self.handle),
            mode: self.mode,
            scheduler_name: self.scheduler_name.clone(),
            placement: self.placement,
        }
    }

    /// Why this entry cannot serve a request, if it cannot.
    fn mismatch(&self, mode: ExecutionMode, scheduler_name: &str) -> Option<String> {
        if self.mode != mode {
            Some(format!("mode {} -> {}", self.mode, mode))
        } else if self.scheduler_name != scheduler_name {
            Some(format!(
                "scheduler {} -> {}",
                self.scheduler_name, scheduler_name
            ))
        } else {
            None
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Logical clock for insertion order and recency
    clock: u64,
}

/// Cache of constructed model pipelines.
pub struct ModelInstanceCache {
    state: Mutex<CacheState>,
    builder: Arc<dyn ModelBuilder>,
    probe: Arc<dyn HardwareProbe>,
    pool: WorkerPool,
    policy: CachePolicy,
}

impl ModelInstanceCache {
    pub fn new(
        builder: Arc<dyn ModelBuilder>,
        probe: Arc<dyn HardwareProbe>,
        pool: WorkerPool,
        policy: CachePolicy,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            builder,
            probe,
            pool,
            policy,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Return a resident instance matching the request, building it if needed.
    #[instrument(skip_all, fields(model_id = %model_id, mode = %mode, scheduler = %scheduler.name))]
    pub async fn acquire(
        &self,
        model_id: &str,
        mode: ExecutionMode,
        scheduler: &SchedulerConfig,
        hints: &ResolutionHints,
    ) -> Result<ArtifactLease, CacheError> {
        let mut state = self.state.lock().await;
        let report = self.probe.capacity_snapshot();

        let mismatch = state
            .entries
            .get(model_id)
            .and_then(|entry| entry.mismatch(mode, &scheduler.name));
        if let Some(reason) = mismatch {
            warn!(model_id, reason = %reason, "Evicting model instance with wrong configuration");
            if let Some(stale) = state.entries.remove(model_id) {
                self.release_entry(model_id, stale);
                self.clear_memory_cache();
            }
        }

        state.clock += 1;
        let tick = state.clock;

        let lease = match state.entries.entry(model_id.to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                debug!(model_id, "Reusing resident model instance");
                entry.last_used = tick;
                entry.handle.set_tiling(hints.enable_tiling);
                entry.lease(model_id)
            }
            Entry::Vacant(vacant) => {
                let built = self
                    .construct(model_id, mode, scheduler, hints, &report, tick)
                    .await?;
                let entry = vacant.insert(built);
                entry.handle.set_tiling(hints.enable_tiling);
                entry.lease(model_id)
            }
        };

        let allowed = self.policy.allowed_concurrent(&report);
        self.enforce_capacity(&mut state, model_id, allowed);

        Ok(lease)
    }

    async fn construct(
        &self,
        model_id: &str,
        mode: ExecutionMode,
        scheduler: &SchedulerConfig,
        hints: &ResolutionHints,
        report: &HardwareCapacityReport,
        tick: u64,
    ) -> Result<CacheEntry, CacheError> {
        let choice = SchedulerChoice::resolve(mode, scheduler)?;
        let placement = self.policy.placement(report, hints);
        let recipe = BuildRecipe::for_mode(mode, self.policy.precision(report));

        info!(
            model_id,
            mode = %mode,
            pipeline = ?recipe.pipeline,
            conditioning = ?recipe.conditioning_network,
            placement = %placement,
            "Building model instance"
        );

        let started = Instant::now();
        let builder = Arc::clone(&self.builder);
        let id = model_id.to_string();
        let (artifact, placement) = self
            .pool
            .run(move || build_artifact(builder.as_ref(), &id, &recipe, &choice, placement))
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))??;

        info!(
            model_id,
            placement = %placement,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model instance ready"
        );

        Ok(CacheEntry {
            handle: Arc::new(ResidentArtifact::new(model_id, artifact)),
            mode,
            scheduler_name: scheduler.name.clone(),
            placement,
            inserted_at: tick,
            last_used: tick,
        })
    }

    /// Evict least recently used entries other than `keep` until at most
    /// `allowed` remain.
    fn enforce_capacity(&self, state: &mut CacheState, keep: &str, allowed: usize) {
        let mut evicted = 0usize;

        while state.entries.len() > allowed {
            let victim = state
                .entries
                .iter()
                .filter(|(id, _)| id.as_str() != keep)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());

            let Some(victim) = victim else {
                break;
            };

            if let Some(entry) = state.entries.remove(&victim) {
                info!(
                    model_id = %victim,
                    requested = keep,
                    allowed,
                    "Evicting least recently used model instance"
                );
                self.release_entry(&victim, entry);
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.clear_memory_cache();
        }
    }

    /// Release a model instance. Unknown ids are ignored.
    pub async fn evict(&self, model_id: &str) -> bool {
        let mut state = self.state.lock().await;

        match state.entries.remove(model_id) {
            Some(entry) => {
                info!(model_id, "Evicting model instance");
                self.release_entry(model_id, entry);
                self.clear_memory_cache();
                true
            }
            None => {
                debug!(model_id, "Model instance not resident, nothing to evict");
                false
            }
        }
    }

    /// Drop the cache's reference. Memory is freed now if no lease is
    /// outstanding, otherwise when the last lease goes away.
    fn release_entry(&self, model_id: &str, entry: CacheEntry) {
        let leases = Arc::strong_count(&entry.handle) - 1;
        if leases > 0 {
            debug!(model_id, leases, "Model instance still in use, release deferred");
        }
        drop(entry);
    }

    /// Hint the runtime to hand cached accelerator memory back.
    ///
    /// Returns whether the hint was issued.
    pub fn clear_memory_cache(&self) -> bool {
        if self.policy.clear_accelerator_cache {
            info!("Clearing accelerator memory cache");
            self.builder.release_cached_memory();
            true
        } else {
            debug!("Accelerator memory cache clearing disabled");
            false
        }
    }

    /// Resident entries, least recently used first.
    pub async fn resident(&self) -> Vec<ResidentEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<ResidentEntry> = state
            .entries
            .iter()
            .map(|(model_id, entry)| ResidentEntry {
                model_id: model_id.clone(),
                mode: entry.mode,
                scheduler_name: entry.scheduler_name.clone(),
                placement: entry.placement,
                inserted_at: entry.inserted_at,
                last_used: entry.last_used,
            })
            .collect();
        entries.sort_by_key(|entry| entry.last_used);
        entries
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Build, configure and place one artifact. Runs on a blocking thread.
fn build_artifact(
    builder: &dyn ModelBuilder,
    model_id: &str,
    recipe: &BuildRecipe,
    choice: &SchedulerChoice,
    placement: Placement,
) -> Result<(Box<dyn ModelArtifact>, Placement), CacheError> {
    let build_error = |e: ArtifactError| CacheError::Build {
        model_id: model_id.to_string(),
        mode: recipe.mode,
        reason: e.0,
    };
    let placement_error = |e: ArtifactError| CacheError::Placement {
        model_id: model_id.to_string(),
        reason: e.0,
    };

    let mut artifact = builder.build(model_id, recipe).map_err(build_error)?;

    if let Err(e) = artifact.apply_scheduler(choice) {
        discard(model_id, artifact.as_ref());
        return Err(build_error(e));
    }

    let placed = match artifact.place(placement) {
        Ok(()) => Ok(placement),
        Err(e) if matches!(placement, Placement::HostOffload { .. }) => {
            error!(model_id, error = %e, "Could not enable host offload, placing on accelerator");
            artifact
                .place(Placement::Accelerator)
                .map(|()| Placement::Accelerator)
        }
        Err(e) => Err(e),
    };

    match placed {
        Ok(placement) => Ok((artifact, placement)),
        Err(e) => {
            discard(model_id, artifact.as_ref());
            Err(placement_error(e))
        }
    }
}

fn discard(model_id: &str, artifact: &dyn ModelArtifact) {
    if let Err(e) = artifact.release() {
        warn!(model_id, error = %e, "Failed to release partially built model instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TILE_CONDITIONING_NETWORK;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct BuildLog {
        builds: AtomicUsize,
        releases: AtomicUsize,
        cache_clears: AtomicUsize,
        fail_builds: AtomicBool,
        reject_offload: AtomicBool,
        recipes: std::sync::Mutex<Vec<BuildRecipe>>,
    }

    struct FakeArtifact {
        model_id: String,
        log: Arc<BuildLog>,
        tiling: AtomicBool,
    }

    impl ModelArtifact for FakeArtifact {
        fn apply_scheduler(&mut self, _choice: &SchedulerChoice) -> Result<(), ArtifactError> {
            Ok(())
        }

        fn place(&mut self, placement: Placement) -> Result<(), ArtifactError> {
            let offload = matches!(placement, Placement::HostOffload { .. });
            if offload && self.log.reject_offload.load(Ordering::SeqCst) {
                return Err("offload unsupported".into());
            }
            Ok(())
        }

        fn set_tiling(&self, enabled: bool) {
            self.tiling.store(enabled, Ordering::SeqCst);
        }

        fn execute(&self, _request: &Value) -> Result<Value, ArtifactError> {
            Ok(json!({ "model_id": self.model_id }))
        }

        fn release(&self) -> Result<(), ArtifactError> {
            self.log.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeBuilder {
        log: Arc<BuildLog>,
        delay: Duration,
    }

    impl ModelBuilder for FakeBuilder {
        fn build(
            &self,
            model_id: &str,
            recipe: &BuildRecipe,
        ) -> Result<Box<dyn ModelArtifact>, ArtifactError> {
            if self.log.fail_builds.load(Ordering::SeqCst) {
                return Err("weights not found".into());
            }
            std::thread::sleep(self.delay);
            self.log.builds.fetch_add(1, Ordering::SeqCst);
            self.log.recipes.lock().unwrap().push(recipe.clone());
            Ok(Box::new(FakeArtifact {
                model_id: model_id.to_string(),
                log: Arc::clone(&self.log),
                tiling: AtomicBool::new(false),
            }))
        }

        fn release_cached_memory(&self) {
            self.log.cache_clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeProbe {
        accelerator_memory_gib: std::sync::Mutex<Option<f64>>,
    }

    impl FakeProbe {
        fn set(&self, memory: Option<f64>) {
            *self.accelerator_memory_gib.lock().unwrap() = memory;
        }
    }

    impl HardwareProbe for FakeProbe {
        fn capacity_snapshot(&self) -> HardwareCapacityReport {
            HardwareCapacityReport {
                accelerator_memory_gib: *self.accelerator_memory_gib.lock().unwrap(),
                system_memory_gib: 64,
                cpu_cores: 8,
            }
        }
    }

    struct Harness {
        cache: Arc<ModelInstanceCache>,
        log: Arc<BuildLog>,
        probe: Arc<FakeProbe>,
    }

    fn harness(memory: Option<f64>, policy: CachePolicy, delay: Duration) -> Harness {
        let log = Arc::new(BuildLog::default());
        let probe = Arc::new(FakeProbe {
            accelerator_memory_gib: std::sync::Mutex::new(memory),
        });
        let builder = Arc::new(FakeBuilder {
            log: Arc::clone(&log),
            delay,
        });
        let cache = Arc::new(ModelInstanceCache::new(
            builder,
            probe.clone(),
            WorkerPool::new(2),
            policy,
        ));
        Harness { cache, log, probe }
    }

    fn default_harness(memory: Option<f64>) -> Harness {
        harness(memory, CachePolicy::default(), Duration::ZERO)
    }

    async fn acquire(cache: &ModelInstanceCache, model_id: &str) -> ArtifactLease {
        cache
            .acquire(
                model_id,
                ExecutionMode::TextToImage,
                &SchedulerConfig::pipeline_default(),
                &ResolutionHints::default(),
            )
            .await
            .unwrap()
    }

    async fn resident_ids(cache: &ModelInstanceCache) -> Vec<String> {
        cache
            .resident()
            .await
            .into_iter()
            .map(|entry| entry.model_id)
            .collect()
    }

    #[tokio::test]
    async fn test_same_request_reuses_instance() {
        let h = default_harness(Some(24.0));

        let first = acquire(&h.cache, "sd-1.5").await;
        let second = acquire(&h.cache, "sd-1.5").await;

        assert!(Arc::ptr_eq(&first.handle, &second.handle));
        assert_eq!(h.log.builds.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_mode_change_rebuilds() {
        let h = default_harness(Some(24.0));
        let scheduler = SchedulerConfig::pipeline_default();
        let hints = ResolutionHints::default();

        let text = acquire(&h.cache, "sd-1.5").await;
        let variation = h
            .cache
            .acquire("sd-1.5", ExecutionMode::Variation, &scheduler, &hints)
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&text.handle, &variation.handle));
        assert_eq!(variation.mode, ExecutionMode::Variation);
        assert_eq!(h.log.builds.load(Ordering::SeqCst), 2);
        assert_eq!(h.cache.len().await, 1);

        // The text-to-image instance goes once its last lease does
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 0);
        drop(text);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 1);

        let recipes = h.log.recipes.lock().unwrap();
        assert_eq!(recipes[1].conditioning_network, Some(TILE_CONDITIONING_NETWORK));
    }

    #[tokio::test]
    async fn test_scheduler_change_rebuilds() {
        let h = default_harness(Some(24.0));
        let hints = ResolutionHints::default();

        acquire(&h.cache, "sd-1.5").await;
        let lease = h
            .cache
            .acquire(
                "sd-1.5",
                ExecutionMode::TextToImage,
                &SchedulerConfig::new("euler-a", "EulerAncestralDiscreteScheduler"),
                &hints,
            )
            .await
            .unwrap();

        assert_eq!(lease.scheduler_name, "euler-a");
        assert_eq!(h.log.builds.load(Ordering::SeqCst), 2);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_slot_keeps_only_requested_model() {
        let h = default_harness(Some(24.0));

        acquire(&h.cache, "model-a").await;
        acquire(&h.cache, "model-b").await;
        assert_eq!(h.cache.len().await, 2);

        // Capacity drops to one instance
        h.probe.set(Some(8.0));
        acquire(&h.cache, "model-c").await;

        assert_eq!(resident_ids(&h.cache).await, vec!["model-c".to_string()]);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capacity_eviction_waits_for_outstanding_lease() {
        let h = default_harness(Some(24.0));

        let running = acquire(&h.cache, "model-a").await;
        h.probe.set(Some(8.0));
        acquire(&h.cache, "model-b").await;

        assert_eq!(resident_ids(&h.cache).await, vec!["model-b".to_string()]);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 0);

        // Still usable by the job holding it
        let output = running.handle.execute(&json!({})).unwrap();
        assert_eq!(output["model_id"], "model-a");

        drop(running);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_defers_release_while_leased() {
        let h = default_harness(Some(24.0));

        let lease = acquire(&h.cache, "sd-1.5").await;
        assert!(h.cache.evict("sd-1.5").await);
        assert!(h.cache.is_empty().await);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 0);

        drop(lease);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_least_recently_used_evicted_first() {
        let h = default_harness(Some(24.0));

        acquire(&h.cache, "model-a").await;
        acquire(&h.cache, "model-b").await;
        acquire(&h.cache, "model-a").await;
        acquire(&h.cache, "model-c").await;

        assert_eq!(
            resident_ids(&h.cache).await,
            vec!["model-a".to_string(), "model-c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let h = default_harness(None);
        let memories = [None, Some(8.0), Some(24.0), Some(36.0), Some(12.0)];
        let models = ["a", "b", "c", "d", "e"];

        for step in 0..30 {
            let memory = memories[(step * 7) % memories.len()];
            h.probe.set(memory);
            let model_id = models[(step * 3) % models.len()];

            acquire(&h.cache, model_id).await;

            let allowed = h.cache.policy().allowed_concurrent(&h.probe.capacity_snapshot());
            let resident = resident_ids(&h.cache).await;
            assert!(resident.len() <= allowed, "step {}: {:?} > {}", step, resident, allowed);
            assert!(resident.contains(&model_id.to_string()));
        }
    }

    #[tokio::test]
    async fn test_pipe_override_bypasses_hardware() {
        let policy = CachePolicy {
            concurrent_pipes: Some(3),
            ..CachePolicy::default()
        };
        let h = harness(None, policy, Duration::ZERO);

        for model_id in ["a", "b", "c", "d"] {
            acquire(&h.cache, model_id).await;
        }

        assert_eq!(h.cache.len().await, 3);
    }

    #[tokio::test]
    async fn test_construction_failure_leaves_no_entry() {
        let h = default_harness(Some(24.0));
        h.log.fail_builds.store(true, Ordering::SeqCst);

        let result = h
            .cache
            .acquire(
                "missing-model",
                ExecutionMode::Upscale,
                &SchedulerConfig::pipeline_default(),
                &ResolutionHints::default(),
            )
            .await;

        assert!(matches!(result, Err(CacheError::Build { ref model_id, .. }) if model_id == "missing-model"));
        assert!(h.cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_scheduler_is_construction_fault() {
        let h = default_harness(Some(24.0));

        let result = h
            .cache
            .acquire(
                "sd-1.5",
                ExecutionMode::TextToImage,
                &SchedulerConfig::new("weird", "WeirdScheduler"),
                &ResolutionHints::default(),
            )
            .await;

        assert!(matches!(result, Err(CacheError::UnknownScheduler(_))));
        assert_eq!(h.log.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let h = default_harness(Some(24.0));
        acquire(&h.cache, "sd-1.5").await;

        assert!(h.cache.evict("sd-1.5").await);
        assert!(!h.cache.evict("sd-1.5").await);
        assert!(!h.cache.evict("never-loaded").await);
        assert_eq!(h.log.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_memory_cache_gated() {
        let h = default_harness(Some(24.0));
        assert!(!h.cache.clear_memory_cache());
        assert_eq!(h.log.cache_clears.load(Ordering::SeqCst), 0);

        let policy = CachePolicy {
            clear_accelerator_cache: true,
            ..CachePolicy::default()
        };
        let h = harness(Some(24.0), policy, Duration::ZERO);
        assert!(h.cache.clear_memory_cache());
        assert_eq!(h.log.cache_clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tiling_hint_applied_on_reuse() {
        let h = default_harness(Some(24.0));
        let scheduler = SchedulerConfig::pipeline_default();
        let mut hints = ResolutionHints::default();

        h.cache
            .acquire("sd-1.5", ExecutionMode::TextToImage, &scheduler, &hints)
            .await
            .unwrap();
        hints.enable_tiling = false;
        let lease = h
            .cache
            .acquire("sd-1.5", ExecutionMode::TextToImage, &scheduler, &hints)
            .await
            .unwrap();

        assert_eq!(h.log.builds.load(Ordering::SeqCst), 1);
        let output = lease.handle.execute(&json!({})).unwrap();
        assert_eq!(output["model_id"], "sd-1.5");
    }

    #[tokio::test]
    async fn test_offload_falls_back_to_accelerator() {
        let h = default_harness(Some(12.0));
        h.log.reject_offload.store(true, Ordering::SeqCst);

        let lease = acquire(&h.cache, "sd-1.5").await;
        assert_eq!(lease.placement, Placement::Accelerator);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_builds_once() {
        let h = harness(Some(24.0), CachePolicy::default(), Duration::from_millis(50));

        let first = {
            let cache = Arc::clone(&h.cache);
            tokio::spawn(async move { acquire(&cache, "sd-1.5").await })
        };
        let second = {
            let cache = Arc::clone(&h.cache);
            tokio::spawn(async move { acquire(&cache, "sd-1.5").await })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert!(Arc::ptr_eq(&first.handle, &second.handle));
        assert_eq!(h.log.builds.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.len().await, 1);
    }

    #[test]
    fn test_placement_policy() {
        let policy = CachePolicy::default();
        let hints = ResolutionHints::default();
        let report = |memory| HardwareCapacityReport {
            accelerator_memory_gib: memory,
            system_memory_gib: 64,
            cpu_cores: 8,
        };

        assert_eq!(
            policy.placement(&report(Some(80.0)), &hints),
            Placement::Accelerator
        );
        assert_eq!(
            policy.placement(&report(Some(24.0)), &hints),
            Placement::HostOffload { sequential: false }
        );

        let huge = ResolutionHints {
            width: 4096,
            height: 4096,
            enable_tiling: true,
        };
        assert_eq!(
            policy.placement(&report(Some(80.0)), &huge),
            Placement::HostOffload { sequential: false }
        );

        let sequential = CachePolicy {
            enable_sequential_offload: true,
            ..CachePolicy::default()
        };
        assert_eq!(
            sequential.placement(&report(Some(8.0)), &hints),
            Placement::HostOffload { sequential: true }
        );

        let no_offload = CachePolicy {
            enable_offload: false,
            ..CachePolicy::default()
        };
        assert_eq!(
            no_offload.placement(&report(None), &huge),
            Placement::Accelerator
        );
    }

    #[test]
    fn test_precision_policy() {
        let report = |memory| HardwareCapacityReport {
            accelerator_memory_gib: memory,
            system_memory_gib: 64,
            cpu_cores: 8,
        };
        let full = CachePolicy {
            precision_bits: 32,
            ..CachePolicy::default()
        };

        assert_eq!(full.precision(&report(Some(24.0))), Precision::Full);
        assert_eq!(full.precision(&report(Some(16.0))), Precision::Half);
        assert_eq!(full.precision(&report(None)), Precision::Half);
        assert_eq!(
            CachePolicy::default().precision(&report(Some(80.0))),
            Precision::Half
        );
    }
}

//! Cluster Manager
//!
//! The cluster singleton: dispatches requests across instances, polls
//! instance snapshots, triggers pair migration, scales the fleet up and
//! down, and serializes collective-group rebuilds on membership change.
//!
//! All state mutation goes through this manager; remote work runs as
//! background tasks whose results are posted back through manager methods.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use floo_common::{
    EngineState, Error, InstanceInfo, InstanceType, MigrationPair, PairMigrationConstraint,
    Result,
};

use crate::config::{FlooConfig, ManagerConfig, MigrationConfig};
use crate::constants::{
    CHECK_ENGINE_STATE_INTERVAL, CLEAR_REQUEST_INSTANCE_INTERVAL, INSTANCE_NAME_PREFIX,
    INSTANCE_READY_TIMEOUT, NO_INSTANCE_RETRY_GENERATE_INTERVAL,
    WAIT_ALL_MIGRATIONS_DONE_INTERVAL,
};
use crate::instance::InstanceHandle;
use crate::scheduler::TokenGenerator;
use crate::transport::CollectiveRegistry;
use crate::policy::{AutoScalingPolicy, DispatchPolicy, PairMigrationPolicy, ScaleDecision};
use crate::request::{SamplingParams, ServerInfo};
use crate::worker::WorkerCommand;

/// Provisions fresh instances on a scale-up decision. Injected because the
/// actor placement and packaging layer is an external collaborator.
pub type InstanceFactory = Arc<
    dyn Fn(usize) -> Result<Vec<(String, InstanceHandle, InstanceType)>> + Send + Sync,
>;

/// Appends one row per polled snapshot to `<log_filename>_instance.csv`.
/// Repeated all-empty snapshots of the same instance are suppressed.
struct InstanceInfoLog {
    file: std::fs::File,
    last_logged_empty: HashMap<String, bool>,
}

impl InstanceInfoLog {
    fn create(log_filename: &str) -> Result<Self> {
        let path = format!("{}_instance.csv", log_filename);
        let mut file = std::fs::File::create(&path)?;
        writeln!(
            file,
            "timestamp,instance_id,step_id,kv_cache_usage,num_available_gpu_blocks,\
             dispatch_load_metric,migration_load_metric,num_running_requests,\
             num_waiting_requests,num_killed_requests,num_blocking_requests,\
             inference_type,num_instances,num_blocks_first_waiting_request,\
             expected_steps_first_waiting,sm_active,sm_occupancy,dram_active,power_watts"
        )?;
        Ok(Self {
            file,
            last_logged_empty: HashMap::new(),
        })
    }

    fn log(&mut self, info: &InstanceInfo, num_instances: usize) {
        let empty = info.kv_usage_ratio == 0.0;
        let was_empty = self
            .last_logged_empty
            .get(&info.instance_id)
            .copied()
            .unwrap_or(false);
        if empty && was_empty {
            return;
        }
        self.last_logged_empty
            .insert(info.instance_id.clone(), empty);
        let _ = writeln!(
            self.file,
            "{},{},{},{:.4},{},{:.4},{:.4},{},{},{},{},{:?},{},{},{},{:.3},{:.3},{:.3},{:.3}",
            info.timestamp.to_rfc3339(),
            info.instance_id,
            info.step_id,
            info.kv_usage_ratio,
            info.num_free_blocks,
            info.dispatch_load_metric,
            info.migration_load_metric,
            info.num_running_requests,
            info.num_waiting_requests,
            info.num_killed_requests,
            info.num_blocking_requests,
            info.inference_type,
            num_instances,
            info.num_blocks_first_waiting_request,
            info.expected_steps_first_waiting.unwrap_or(-1),
            info.gpu_metrics.sm_active,
            info.gpu_metrics.sm_occupancy,
            info.gpu_metrics.dram_active,
            info.gpu_metrics.power_watts,
        );
        let _ = self.file.flush();
    }
}

pub struct ClusterManager {
    manager_config: ManagerConfig,
    migration_config: MigrationConfig,
    dispatch_policy: DispatchPolicy,
    pair_policy: PairMigrationPolicy,
    scaling_policy: AutoScalingPolicy,
    instance_factory: std::sync::Mutex<Option<InstanceFactory>>,
    last_scale_check: std::sync::Mutex<tokio::time::Instant>,

    instances: RwLock<HashMap<String, InstanceHandle>>,
    instance_types: RwLock<HashMap<String, InstanceType>>,
    instance_migrating: RwLock<HashMap<String, bool>>,
    latest_infos: RwLock<HashMap<String, InstanceInfo>>,
    request_instance: RwLock<HashMap<String, String>>,
    /// Instances whose collective group failed to initialize; excluded from
    /// pair-picking until the next successful rebuild
    migration_excluded: RwLock<HashSet<String>>,

    enable_migration: AtomicBool,
    pending_rebuild_migration_instances: AtomicUsize,
    num_instance_info_updates: AtomicU64,
    rebuild_lock: AsyncMutex<()>,
    stopped: AtomicBool,
    info_log: std::sync::Mutex<Option<InstanceInfoLog>>,
}

impl ClusterManager {
    pub fn new(config: &FlooConfig) -> Arc<Self> {
        let info_log = if config.manager.log_instance_info {
            match InstanceInfoLog::create(&config.manager.log_filename) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!(error = %e, "failed to create instance info log");
                    None
                }
            }
        } else {
            None
        };
        Arc::new(Self {
            dispatch_policy: DispatchPolicy,
            pair_policy: PairMigrationPolicy::new(config.manager.migrate_out_threshold),
            scaling_policy: AutoScalingPolicy {
                policy: config.manager.scaling_policy,
                scale_up_threshold: config.manager.scale_up_threshold,
                scale_down_threshold: config.manager.scale_down_threshold,
                min_instances: config.manager.min_instances,
                max_instances: config.manager.max_instances,
            },
            instance_factory: std::sync::Mutex::new(None),
            last_scale_check: std::sync::Mutex::new(tokio::time::Instant::now()),
            enable_migration: AtomicBool::new(config.manager.enable_migration),
            manager_config: config.manager.clone(),
            migration_config: config.migration.clone(),
            instances: RwLock::new(HashMap::new()),
            instance_types: RwLock::new(HashMap::new()),
            instance_migrating: RwLock::new(HashMap::new()),
            latest_infos: RwLock::new(HashMap::new()),
            request_instance: RwLock::new(HashMap::new()),
            migration_excluded: RwLock::new(HashSet::new()),
            pending_rebuild_migration_instances: AtomicUsize::new(0),
            num_instance_info_updates: AtomicU64::new(0),
            rebuild_lock: AsyncMutex::new(()),
            stopped: AtomicBool::new(false),
            info_log: std::sync::Mutex::new(info_log),
        })
    }

    /// Spawn the polling and request-map maintenance loops.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move { manager.poll_instance_info_loop().await });
        let manager = self.clone();
        tokio::spawn(async move { manager.clear_request_instance_loop().await });
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub async fn num_instances(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn request_instance_of(&self, request_id: &str) -> Option<String> {
        self.request_instance.read().await.get(request_id).cloned()
    }

    pub async fn num_tracked_requests(&self) -> usize {
        self.request_instance.read().await.len()
    }

    pub fn migration_enabled(&self) -> bool {
        self.enable_migration.load(Ordering::SeqCst)
    }

    /// Membership changes not yet absorbed by a collective-group rebuild.
    pub fn pending_rebuild_instances(&self) -> usize {
        self.pending_rebuild_migration_instances.load(Ordering::SeqCst)
    }

    pub async fn excluded_instances(&self) -> HashSet<String> {
        self.migration_excluded.read().await.clone()
    }

    /// Install the provisioner scale-up decisions draw new instances from.
    pub fn set_instance_factory(&self, factory: InstanceFactory) {
        *self.instance_factory.lock().unwrap() = Some(factory);
    }

    // -- membership ----------------------------------------------------------

    /// Adopt already-running instances discovered by their name prefix.
    pub async fn connect_to_instances(
        self: &Arc<Self>,
        candidates: Vec<(String, InstanceHandle, InstanceType)>,
    ) -> usize {
        let discovered: Vec<_> = candidates
            .into_iter()
            .filter(|(id, _, _)| id.starts_with(INSTANCE_NAME_PREFIX))
            .collect();
        for (instance_id, _, _) in &discovered {
            info!(instance_id = %instance_id, "connected to instance");
        }
        self.scale_up(discovered).await
    }

    /// The only entry point that adds instances. Returns the new fleet size.
    pub async fn scale_up(
        self: &Arc<Self>,
        new_instances: Vec<(String, InstanceHandle, InstanceType)>,
    ) -> usize {
        let no_pending_instance =
            self.pending_rebuild_migration_instances.load(Ordering::SeqCst) == 0;
        let mut indeed_update = false;
        {
            let mut instances = self.instances.write().await;
            let mut types = self.instance_types.write().await;
            let mut migrating = self.instance_migrating.write().await;
            for (instance_id, handle, instance_type) in new_instances {
                if instances.contains_key(&instance_id) {
                    continue;
                }
                indeed_update = true;
                info!(instance_id = %instance_id, instance_type = ?instance_type, "scale up");
                instances.insert(instance_id.clone(), handle.clone());
                types.insert(instance_id.clone(), instance_type);
                migrating.insert(instance_id.clone(), false);
                self.pending_rebuild_migration_instances
                    .fetch_add(1, Ordering::SeqCst);
                self.spawn_engine_state_watcher(instance_id, handle);
            }
        }
        let num_instances = self.instances.read().await.len();

        // A pending counter above zero means a rebuild coroutine is already
        // running and will pick up this membership change.
        if self.manager_config.enable_migration
            && self.migration_config.migration_backend.is_group_kind()
            && indeed_update
            && no_pending_instance
        {
            let manager = self.clone();
            tokio::spawn(async move { manager.rebuild_migration_backend().await });
        }
        num_instances
    }

    /// The only entry point that removes instances. Idempotent for unknown
    /// ids. Returns the new fleet size.
    pub fn scale_down<'a>(
        self: &'a Arc<Self>,
        instance_ids: &'a [String],
        rebuild: bool,
    ) -> futures::future::BoxFuture<'a, usize> {
        Box::pin(async move {
            let no_pending_instance =
                self.pending_rebuild_migration_instances.load(Ordering::SeqCst) == 0;
            let mut indeed_update = false;
            {
                let mut instances = self.instances.write().await;
                let mut types = self.instance_types.write().await;
                let mut migrating = self.instance_migrating.write().await;
                let mut infos = self.latest_infos.write().await;
                for instance_id in instance_ids {
                    if instances.remove(instance_id).is_none() {
                        continue;
                    }
                    indeed_update = true;
                    info!(instance_id = %instance_id, "scale down");
                    types.remove(instance_id);
                    migrating.remove(instance_id);
                    infos.remove(instance_id);
                    self.pending_rebuild_migration_instances
                        .fetch_add(1, Ordering::SeqCst);
                }
            }
            let num_instances = self.instances.read().await.len();

            if self.manager_config.enable_migration
                && self.migration_config.migration_backend.is_group_kind()
            {
                if num_instances == 0 {
                    self.pending_rebuild_migration_instances
                        .store(0, Ordering::SeqCst);
                } else if indeed_update && no_pending_instance && rebuild {
                    let manager = self.clone();
                    tokio::spawn(async move { manager.rebuild_migration_backend().await });
                }
            }
            num_instances
        })
    }

    fn spawn_engine_state_watcher(self: &Arc<Self>, instance_id: String, handle: InstanceHandle) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHECK_ENGINE_STATE_INTERVAL).await;
                if manager.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if !manager.instances.read().await.contains_key(&instance_id) {
                    return;
                }
                match handle.engine_state().await {
                    Ok(EngineState::Crashed) => {
                        warn!(instance_id = %instance_id, "engine crashed, removing instance");
                        manager.scale_down(&[instance_id.clone()], true).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        info!(instance_id = %instance_id, "instance is dead");
                        manager.scale_down(&[instance_id.clone()], true).await;
                        return;
                    }
                }
            }
        });
    }

    /// Create `count` fresh instances and adopt them into the fleet.
    pub async fn init_instances(
        self: &Arc<Self>,
        count: usize,
        instance_type: InstanceType,
        config: &FlooConfig,
        tp_size: usize,
        registry: &Arc<CollectiveRegistry>,
        generator: &Arc<dyn TokenGenerator>,
    ) -> Result<(Vec<String>, Vec<InstanceHandle>)> {
        let (instance_ids, handles) =
            crate::instance::init_instances(count, instance_type, config, tp_size, registry, generator)?;
        self.scale_up(
            instance_ids
                .iter()
                .zip(handles.iter())
                .map(|(id, handle)| (id.clone(), handle.clone(), instance_type))
                .collect(),
        )
        .await;
        Ok((instance_ids, handles))
    }

    /// True once every instance reports ready.
    pub async fn is_ready(&self) -> bool {
        let handles: Vec<InstanceHandle> =
            self.instances.read().await.values().cloned().collect();
        let results =
            futures::future::join_all(handles.iter().map(|handle| handle.is_ready())).await;
        results.into_iter().all(|r| matches!(r, Ok(true)))
    }

    /// Block until the fleet reports ready, bounded by the instance
    /// readiness deadline. Returns false on timeout.
    pub async fn wait_until_ready(&self) -> bool {
        let deadline = tokio::time::Instant::now() + INSTANCE_READY_TIMEOUT;
        while !self.is_ready().await {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        true
    }

    // -- dispatch ------------------------------------------------------------

    /// Dispatch a request to an instance, retrying while the pool is empty.
    pub async fn generate(
        self: &Arc<Self>,
        request_id: &str,
        server_info: ServerInfo,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
    ) {
        loop {
            let Some((instance_id, handle, expected_steps)) = self.pick_dispatch_target().await
            else {
                warn!(
                    request_id,
                    "no instance available, sleeping {:?} and regenerating",
                    NO_INSTANCE_RETRY_GENERATE_INTERVAL
                );
                tokio::time::sleep(NO_INSTANCE_RETRY_GENERATE_INTERVAL).await;
                continue;
            };
            match handle
                .generate(
                    request_id,
                    server_info.clone(),
                    expected_steps,
                    prompt_token_ids.clone(),
                    sampling_params.clone(),
                )
                .await
            {
                Ok(()) => {
                    if !self.manager_config.disable_log_requests {
                        info!(request_id, instance_id = %instance_id, "dispatched request");
                    }
                    self.request_instance
                        .write()
                        .await
                        .insert(request_id.to_string(), instance_id);
                    return;
                }
                Err(e) => {
                    warn!(request_id, instance_id = %instance_id, error = %e, "dispatch failed");
                    self.scale_down(&[instance_id], true).await;
                }
            }
        }
    }

    async fn pick_dispatch_target(&self) -> Option<(String, InstanceHandle, i64)> {
        let (wanted_type, expected_steps) = if self.manager_config.enable_pd_disagg {
            // Prefill instances run exactly one step before the handoff.
            (Some(InstanceType::Prefill), 1)
        } else {
            (None, -1)
        };

        let instances = self.instances.read().await;
        let types = self.instance_types.read().await;
        let infos = self.latest_infos.read().await;
        let candidates: Vec<InstanceInfo> = instances
            .keys()
            .filter(|id| match wanted_type {
                Some(wanted) => types.get(*id).copied() == Some(wanted),
                None => true,
            })
            .map(|id| {
                infos.get(id).cloned().unwrap_or_else(|| {
                    InstanceInfo::new(id, types.get(id).copied().unwrap_or(InstanceType::Neutral))
                })
            })
            .collect();
        let instance_id = self.dispatch_policy.dispatch(candidates.iter())?;
        let handle = instances.get(&instance_id)?.clone();
        Some((instance_id, handle, expected_steps))
    }

    /// Abort requests, fanned out by their last known instance. Unknown
    /// request ids are tolerated; abort is idempotent.
    pub async fn abort(&self, request_ids: Vec<String>) {
        let mut by_instance: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut request_instance = self.request_instance.write().await;
            for request_id in request_ids {
                match request_instance.remove(&request_id) {
                    Some(instance_id) => {
                        by_instance.entry(instance_id).or_default().push(request_id)
                    }
                    None => {
                        debug!(request_id = %request_id, "abort for untracked request");
                    }
                }
            }
        }
        let instances = self.instances.read().await;
        for (instance_id, ids) in by_instance {
            if let Some(handle) = instances.get(&instance_id) {
                info!(instance_id = %instance_id, requests = ?ids, "aborting requests");
                let _ = handle.abort(ids).await;
            }
        }
    }

    // -- polling -------------------------------------------------------------

    async fn poll_instance_info_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs_f64(
            self.manager_config.polling_interval_secs,
        );
        loop {
            tokio::time::sleep(interval).await;
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.poll_instance_info_once().await;

            let updates = self.num_instance_info_updates.fetch_add(1, Ordering::SeqCst) + 1;
            if self.migration_enabled()
                && updates % self.manager_config.pair_migration_frequency == 0
            {
                let manager = self.clone();
                tokio::spawn(async move { manager.push_migrations().await });
            }

            if self.manager_config.enable_scaling && self.scale_check_due() {
                let manager = self.clone();
                tokio::spawn(async move { manager.check_scale().await });
            }
        }
    }

    fn scale_check_due(&self) -> bool {
        let interval =
            std::time::Duration::from_secs_f64(self.manager_config.scaling_interval_secs);
        let mut last = self.last_scale_check.lock().unwrap();
        if last.elapsed() < interval {
            return false;
        }
        *last = tokio::time::Instant::now();
        true
    }

    /// One info sweep over the fleet; dead instances are scaled down.
    pub async fn poll_instance_info_once(self: &Arc<Self>) {
        let handles: Vec<(String, InstanceHandle)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();
        let num_instances = handles.len();
        let results = futures::future::join_all(
            handles
                .iter()
                .map(|(_, handle)| handle.get_instance_info()),
        )
        .await;

        for ((instance_id, _), result) in handles.into_iter().zip(results) {
            match result {
                Ok(info) => {
                    if let Some(log) = self.info_log.lock().unwrap().as_mut() {
                        log.log(&info, num_instances);
                    }
                    self.latest_infos
                        .write()
                        .await
                        .insert(instance_id, info);
                }
                Err(_) => {
                    info!(instance_id = %instance_id, "instance is dead");
                    self.scale_down(&[instance_id], true).await;
                }
            }
        }
    }

    // -- autoscaling ---------------------------------------------------------

    /// One autoscaling pass over the latest snapshots: grow the fleet
    /// through the instance factory when load crosses the scale-up
    /// threshold, retire a drained instance when it falls under the
    /// scale-down threshold. Instances with a migration in flight are never
    /// retired.
    pub async fn check_scale(self: &Arc<Self>) {
        let infos: Vec<InstanceInfo> =
            self.latest_infos.read().await.values().cloned().collect();
        match self.scaling_policy.check(&infos) {
            ScaleDecision::Up => {
                let factory = self.instance_factory.lock().unwrap().clone();
                let Some(factory) = factory else {
                    debug!("scale up wanted but no instance factory installed");
                    return;
                };
                match factory(1) {
                    Ok(new_instances) => {
                        let num_new = new_instances.len();
                        let num_instances = self.num_instances().await;
                        info!(num_new, num_instances, "autoscaling up");
                        self.scale_up(new_instances).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "instance factory failed during scale up");
                    }
                }
            }
            ScaleDecision::Down(instance_id) => {
                let migrating = self
                    .instance_migrating
                    .read()
                    .await
                    .get(&instance_id)
                    .copied()
                    .unwrap_or(false);
                if migrating {
                    return;
                }
                info!(instance_id = %instance_id, "autoscaling down");
                self.scale_down(&[instance_id], true).await;
            }
            ScaleDecision::Hold => {}
        }
    }

    // -- pair migration ------------------------------------------------------

    /// Run one pair-migration pass for every active constraint.
    pub async fn push_migrations(self: &Arc<Self>) {
        if self.manager_config.enable_pd_disagg {
            self.migrate(PairMigrationConstraint::PrefillToDecode).await;
            self.migrate(PairMigrationConstraint::DecodeToDecode).await;
        } else {
            self.migrate(PairMigrationConstraint::NoConstraints).await;
        }
    }

    async fn migrate(self: &Arc<Self>, constraint: PairMigrationConstraint) {
        if !self.migration_enabled() {
            return;
        }
        let infos: Vec<InstanceInfo> =
            self.latest_infos.read().await.values().cloned().collect();
        let excluded = self.migration_excluded.read().await.clone();
        let pairs = self.pair_policy.pair_migration(constraint, &infos, &excluded);
        if pairs.is_empty() {
            return;
        }
        info!(constraint = ?constraint, num_pairs = pairs.len(), "migration tasks start");

        for pair in pairs {
            // At most one inbound and one outbound migration per instance.
            {
                let mut migrating = self.instance_migrating.write().await;
                let src_busy = migrating
                    .get(&pair.src_instance_id)
                    .copied()
                    .unwrap_or(true);
                let dst_busy = migrating
                    .get(&pair.dst_instance_id)
                    .copied()
                    .unwrap_or(true);
                if src_busy || dst_busy {
                    continue;
                }
                migrating.insert(pair.src_instance_id.clone(), true);
                migrating.insert(pair.dst_instance_id.clone(), true);
            }
            let (src_handle, dst_handle) = {
                let instances = self.instances.read().await;
                (
                    instances.get(&pair.src_instance_id).cloned(),
                    instances.get(&pair.dst_instance_id).cloned(),
                )
            };
            let (Some(src_handle), Some(dst_handle)) = (src_handle, dst_handle) else {
                self.clear_migrating_flags(&pair).await;
                continue;
            };

            let manager = self.clone();
            tokio::spawn(async move {
                let result = src_handle.migrate_out(&dst_handle).await;
                manager.migrate_done(result, pair).await;
            });
        }
    }

    async fn clear_migrating_flags(&self, pair: &MigrationPair) {
        let mut migrating = self.instance_migrating.write().await;
        for instance_id in [&pair.src_instance_id, &pair.dst_instance_id] {
            if let Some(flag) = migrating.get_mut(instance_id) {
                *flag = false;
            }
        }
    }

    async fn migrate_done(self: &Arc<Self>, result: Result<Vec<String>>, pair: MigrationPair) {
        self.clear_migrating_flags(&pair).await;
        match result {
            Ok(migrated_request_ids) => {
                if !migrated_request_ids.is_empty() {
                    let mut request_instance = self.request_instance.write().await;
                    for request_id in &migrated_request_ids {
                        request_instance
                            .insert(request_id.clone(), pair.dst_instance_id.clone());
                    }
                    info!(
                        src = %pair.src_instance_id,
                        dst = %pair.dst_instance_id,
                        requests = ?migrated_request_ids,
                        "migration done"
                    );
                }
            }
            Err(e) => {
                warn!(
                    src = %pair.src_instance_id,
                    dst = %pair.dst_instance_id,
                    error = %e,
                    "migration failed, checking both sides"
                );
                // The side that survived clears its half of the migration
                // state; the dead side is scaled down.
                let sides = [(&pair.src_instance_id, false), (&pair.dst_instance_id, true)];
                for (instance_id, is_migrate_in) in sides {
                    let handle = self.instances.read().await.get(instance_id).cloned();
                    let mut dead = handle.is_none();
                    if let Some(handle) = handle {
                        let alive = matches!(handle.is_ready().await, Ok(_));
                        if alive {
                            if handle.clear_migration_states(is_migrate_in).await.is_err() {
                                dead = true;
                            }
                        } else {
                            dead = true;
                        }
                    }
                    if dead {
                        info!(instance_id = %instance_id, "instance is dead");
                        self.scale_down(std::slice::from_ref(&instance_id.clone()), true)
                            .await;
                    }
                }
            }
        }
    }

    // -- collective group rebuild --------------------------------------------

    /// Serialize a full collective-group rebuild: wait for migrations to
    /// drain, disable migration, assign ranks over the sorted alive set,
    /// fan out the rebuild and warmup, and retry until convergence or an
    /// empty cluster.
    pub async fn rebuild_migration_backend(self: &Arc<Self>) {
        let _guard = self.rebuild_lock.lock().await;

        loop {
            let any_migrating = self
                .instance_migrating
                .read()
                .await
                .values()
                .any(|busy| *busy);
            if !any_migrating {
                break;
            }
            tokio::time::sleep(WAIT_ALL_MIGRATIONS_DONE_INTERVAL).await;
        }

        let origin_enabled = self.enable_migration.swap(false, Ordering::SeqCst);
        let mut group_name: Option<String> = None;
        let mut init_failed: HashSet<String> = HashSet::new();

        let mut alive: Vec<String> = {
            let mut ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
            ids.sort();
            ids
        };
        let mut pending_task = self
            .pending_rebuild_migration_instances
            .load(Ordering::SeqCst);

        while !alive.is_empty()
            && self
                .pending_rebuild_migration_instances
                .load(Ordering::SeqCst)
                > 0
        {
            let name = uuid::Uuid::new_v4().to_string();
            init_failed.clear();
            let mut dead: HashSet<String> = HashSet::new();

            // Rank assignment: instance order over the sorted alive set,
            // worker global rank = preceding tp sizes + local rank.
            let mut instance_rank: HashMap<String, usize> = HashMap::new();
            let mut instance_rank_tp_size: HashMap<usize, usize> = HashMap::new();
            for (index, instance_id) in alive.iter().enumerate() {
                let handle = self.instances.read().await.get(instance_id).cloned();
                let world_size = match handle {
                    Some(handle) => handle.get_world_size().await.ok(),
                    None => None,
                };
                match world_size {
                    Some(world_size) => {
                        instance_rank.insert(instance_id.clone(), index);
                        instance_rank_tp_size.insert(index, world_size);
                    }
                    None => {
                        dead.insert(instance_id.clone());
                    }
                }
            }

            if dead.is_empty() {
                let command = WorkerCommand::RebuildMigrationBackend {
                    instance_rank: instance_rank.clone(),
                    group_name: Some(name.clone()),
                    instance_rank_tp_size: instance_rank_tp_size.clone(),
                };
                dead.extend(self.run_workers_fanout(&alive, command, &mut init_failed).await);
            }
            if dead.is_empty()
                && self
                    .pending_rebuild_migration_instances
                    .load(Ordering::SeqCst)
                    == pending_task
            {
                dead.extend(
                    self.run_workers_fanout(&alive, WorkerCommand::Warmup, &mut init_failed)
                        .await,
                );
            }
            if dead.is_empty() {
                self.pending_rebuild_migration_instances
                    .fetch_sub(pending_task, Ordering::SeqCst);
                group_name = Some(name);
            } else {
                let dead_ids: Vec<String> = dead.iter().cloned().collect();
                self.scale_down(&dead_ids, false).await;
            }

            alive = {
                let instances = self.instances.read().await;
                let mut ids: Vec<String> = instances
                    .keys()
                    .filter(|id| !dead.contains(*id))
                    .cloned()
                    .collect();
                ids.sort();
                ids
            };
            pending_task = self
                .pending_rebuild_migration_instances
                .load(Ordering::SeqCst);
        }

        if alive.is_empty() {
            self.pending_rebuild_migration_instances
                .store(0, Ordering::SeqCst);
            group_name = None;
        }

        *self.migration_excluded.write().await = init_failed;

        info!(
            group_name = group_name.as_deref().unwrap_or("none"),
            num_alive = alive.len(),
            alive = ?alive,
            "rebuild migration backend done"
        );
        self.enable_migration
            .store(origin_enabled, Ordering::SeqCst);
    }

    /// Fan a worker command out to the named instances. Dead instances are
    /// returned; instances whose workers report failure are recorded in
    /// `init_failed`.
    async fn run_workers_fanout(
        &self,
        instance_ids: &[String],
        command: WorkerCommand,
        init_failed: &mut HashSet<String>,
    ) -> HashSet<String> {
        let handles: Vec<(String, Option<InstanceHandle>)> = {
            let instances = self.instances.read().await;
            instance_ids
                .iter()
                .map(|id| (id.clone(), instances.get(id).cloned()))
                .collect()
        };
        let results = futures::future::join_all(handles.iter().map(|(_, handle)| {
            let command = command.clone();
            async move {
                match handle {
                    Some(handle) => handle.run_workers(command).await,
                    None => Err(Error::RemoteDead("gone".to_string())),
                }
            }
        }))
        .await;

        let mut dead = HashSet::new();
        for ((instance_id, _), result) in handles.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    init_failed.remove(&instance_id);
                }
                Ok(false) => {
                    warn!(instance_id = %instance_id, "worker command reported failure");
                    init_failed.insert(instance_id);
                }
                Err(e) => {
                    info!(instance_id = %instance_id, error = %e, "instance is dead");
                    dead.insert(instance_id);
                }
            }
        }
        dead
    }

    // -- request map maintenance ---------------------------------------------

    async fn clear_request_instance_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(CLEAR_REQUEST_INSTANCE_INTERVAL).await;
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.clear_request_instance().await;
        }
    }

    /// Rebuild the request map from authoritative instance state, dropping
    /// every stale entry.
    pub async fn clear_request_instance(self: &Arc<Self>) {
        let handles: Vec<(String, InstanceHandle)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut rebuilt: HashMap<String, String> = HashMap::new();
        for (instance_id, handle) in handles {
            match handle.get_all_request_ids().await {
                Ok(request_ids) => {
                    for request_id in request_ids {
                        rebuilt.insert(request_id, instance_id.clone());
                    }
                }
                Err(_) => {
                    info!(instance_id = %instance_id, "instance is dead");
                    self.scale_down(&[instance_id], true).await;
                }
            }
        }
        *self.request_instance.write().await = rebuilt;
    }
}

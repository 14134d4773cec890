//! Instance Runtime
//!
//! One model replica: its workers, scheduler, engine, and block pool,
//! behind the remote interface the cluster manager drives. Handles carry
//! only the logical instance id across the wire and gate every call on the
//! peer being alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{info, warn};

use floo_common::{EngineState, Error, InstanceInfo, InstanceType, RequestStatus, Result};

use crate::cache::{KvCacheSpec, KvCacheStore};
use crate::config::FlooConfig;
use crate::constants::RPC_TIMEOUT;
use crate::engine::InstanceEngine;
use crate::migration;
use crate::request::{GenerationRequest, RequestOutput, SamplingParams, ServerInfo};
use crate::scheduler::{InstanceScheduler, TokenGenerator};
use crate::transport::{build_transport, CollectiveRegistry};
use crate::worker::{MigrationWorker, WorkerCommand, WorkerHandle};

pub struct Instance {
    instance_id: String,
    instance_type: InstanceType,
    engine_disagg_inst_id: String,
    tp_size: usize,
    scheduler: Arc<AsyncMutex<InstanceScheduler>>,
    engine: Arc<InstanceEngine>,
    workers: Vec<Arc<MigrationWorker>>,
    alive: Arc<AtomicBool>,
}

impl Instance {
    /// Build an instance with `tp_size` workers. Each worker holds
    /// `1 / tp_size` of the kv heads over the shared block-index space.
    pub fn new(
        instance_id: impl Into<String>,
        instance_type: InstanceType,
        config: &FlooConfig,
        tp_size: usize,
        registry: Arc<CollectiveRegistry>,
        generator: Arc<dyn TokenGenerator>,
    ) -> Result<Arc<Self>> {
        let instance_id = instance_id.into();
        let spec = config.cache;
        if tp_size == 0 || spec.num_kv_heads % tp_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "{} kv heads cannot be split across {} workers",
                spec.num_kv_heads, tp_size
            )));
        }
        let migration_config = config.migration.clamped(&spec);
        let worker_spec = KvCacheSpec {
            num_kv_heads: spec.num_kv_heads / tp_size,
            ..spec
        };

        let mut workers = Vec::with_capacity(tp_size);
        for rank in 0..tp_size {
            let store = Arc::new(AsyncMutex::new(KvCacheStore::new(worker_spec)));
            let transport = build_transport(&migration_config, store.clone(), registry.clone());
            workers.push(Arc::new(MigrationWorker::new(
                &instance_id,
                rank,
                tp_size,
                worker_spec,
                &migration_config,
                store,
                transport,
            )));
        }

        let scheduler = Arc::new(AsyncMutex::new(InstanceScheduler::new(
            &spec,
            migration_config.migration_last_stage_max_blocks,
        )));
        let engine = InstanceEngine::new(
            &instance_id,
            instance_type,
            scheduler.clone(),
            workers.clone(),
            generator,
        );

        info!(
            instance_id = %instance_id,
            instance_type = ?instance_type,
            tp_size,
            num_gpu_blocks = spec.num_gpu_blocks,
            "instance created"
        );

        Ok(Arc::new(Self {
            instance_id,
            instance_type,
            engine_disagg_inst_id: uuid::Uuid::new_v4().to_string(),
            tp_size,
            scheduler,
            engine,
            workers,
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }

    /// Start the engine step loop.
    pub fn start(self: &Arc<Self>) {
        self.engine.start_engine_step_loop();
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn worker_handles(&self) -> Vec<WorkerHandle> {
        self.workers.iter().map(|w| WorkerHandle::new(w.clone())).collect()
    }

    pub fn workers(&self) -> &[Arc<MigrationWorker>] {
        &self.workers
    }

    pub(crate) fn scheduler(&self) -> &Arc<AsyncMutex<InstanceScheduler>> {
        &self.scheduler
    }

    pub(crate) fn engine(&self) -> &Arc<InstanceEngine> {
        &self.engine
    }

    // -- remote interface ----------------------------------------------------

    pub async fn generate(
        &self,
        request_id: &str,
        server_info: ServerInfo,
        expected_steps: i64,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
    ) {
        let request = GenerationRequest::new(
            request_id,
            server_info,
            expected_steps,
            prompt_token_ids,
            sampling_params,
        );
        self.scheduler.lock().await.add_waiting_request(request);
    }

    /// Abort the given requests; unknown ids are ignored.
    pub async fn abort(&self, request_ids: Vec<String>) {
        let mut scheduler = self.scheduler.lock().await;
        for request_id in request_ids {
            if let Some(request) = scheduler.abort_request(&request_id) {
                info!(instance_id = %self.instance_id, request_id = %request.request_id, "request aborted");
                for worker in &self.workers {
                    worker.drop_seq_group_metadata(&request.request_id);
                }
                request.server_info.deliver(RequestOutput {
                    request_id: request.request_id.clone(),
                    output_token_ids: request.output_token_ids.clone(),
                    finished: true,
                    aborted: true,
                });
            }
        }
    }

    pub fn get_instance_info(&self) -> InstanceInfo {
        self.engine.latest_info()
    }

    pub async fn get_all_request_ids(&self) -> Vec<String> {
        self.scheduler.lock().await.get_all_request_ids()
    }

    /// Migrate the most block-heavy eligible running request to `dst`.
    /// Returns the migrated request ids (empty when no candidate or the
    /// migration was softly aborted).
    pub async fn migrate_out(self: &Arc<Self>, dst: &InstanceHandle) -> Result<Vec<String>> {
        migration::migrate_out(self, dst).await
    }

    /// Drop any migration state this instance carries, after the peer of an
    /// in-flight migration died.
    pub async fn clear_migration_states(&self, is_migrate_in: bool) {
        if is_migrate_in {
            self.scheduler.lock().await.free_dst_pre_alloc_cache(None);
            for worker in &self.workers {
                worker.free_migrating_in_seq_group_metadata();
            }
            return;
        }
        let stranded = {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.free_migrating_out_requests_last_stage()
        };
        for worker in &self.workers {
            worker.restore_migrating_out_seq_group_metadata();
        }
        let mut scheduler = self.scheduler.lock().await;
        for mut request in stranded {
            warn!(
                instance_id = %self.instance_id,
                request_id = %request.request_id,
                "reinstating request stranded by a dead migration peer"
            );
            request.reset_status();
            match request.status {
                RequestStatus::Running => scheduler.add_running_request(request),
                _ => scheduler.add_waiting_request(request),
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.engine.state(), EngineState::Running)
    }

    pub fn get_world_size(&self) -> usize {
        self.tp_size
    }

    pub fn get_engine_disagg_inst_id(&self) -> &str {
        &self.engine_disagg_inst_id
    }

    /// Fan a command out to every worker; true when all workers succeed.
    pub async fn run_workers(&self, command: WorkerCommand) -> Result<bool> {
        let results = futures::future::join_all(
            self.workers
                .iter()
                .map(|worker| worker.execute_command(command.clone())),
        )
        .await;
        let mut all_ok = true;
        for result in results {
            all_ok &= result?;
        }
        Ok(all_ok)
    }

    /// Narrow reflective escape hatch for tests and ops tooling.
    pub async fn execute_engine_method(&self, name: &str) -> Result<bool> {
        let results = futures::future::join_all(
            self.workers.iter().map(|worker| worker.execute_method(name)),
        )
        .await;
        let mut all_ok = true;
        for result in results {
            all_ok &= result?;
        }
        Ok(all_ok)
    }

    // -- migration support (driver-facing) -----------------------------------

    /// Ship a block delta to the destination by having every destination
    /// worker pull from this instance's workers.
    pub async fn send_blocks(
        &self,
        dst: &InstanceHandle,
        src_blocks: &[usize],
        dst_blocks: &[usize],
        request_id: &str,
        is_last_stage: bool,
    ) -> Result<()> {
        dst.migrate_cache(
            self.worker_handles(),
            src_blocks.to_vec(),
            dst_blocks.to_vec(),
            request_id,
            is_last_stage,
        )
        .await
    }

    pub(crate) async fn migrate_cache_local(
        &self,
        src_workers: Vec<WorkerHandle>,
        src_blocks: Vec<usize>,
        dst_blocks: Vec<usize>,
        request_id: &str,
        is_last_stage: bool,
    ) -> Result<()> {
        let results = futures::future::join_all(self.workers.iter().map(|worker| {
            let src_workers = src_workers.clone();
            let src_blocks = src_blocks.clone();
            let dst_blocks = dst_blocks.clone();
            async move {
                worker
                    .migrate_cache(&src_workers, &src_blocks, &dst_blocks, request_id, is_last_stage)
                    .await
            }
        }))
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Commit an inbound migrated request: install pre-allocated blocks,
    /// adopt the request into the proper queue, and promote the staged
    /// worker metadata.
    pub async fn commit_dst_request(&self, request: GenerationRequest) -> Result<()> {
        let request_id = request.request_id.clone();
        let was_running = request.status == RequestStatus::RunningMigrating;
        let committed = self.scheduler.lock().await.commit_dst_request(request);
        if committed.is_none() {
            return Err(Error::MigrationAborted(format!(
                "no pre-allocated blocks recorded for request {}",
                request_id
            )));
        }
        if was_running {
            for worker in &self.workers {
                worker.commit_seq_group_metadata(&request_id)?;
            }
        }
        Ok(())
    }

    pub async fn pre_alloc(
        &self,
        request_id: &str,
        status: RequestStatus,
        expected_steps: i64,
        block_num: usize,
        token_ids: Vec<u32>,
    ) -> Vec<usize> {
        self.scheduler
            .lock()
            .await
            .pre_alloc(request_id, status, expected_steps, block_num, token_ids)
    }

    pub async fn free_dst_pre_alloc_cache(&self, request_id: Option<&str>) {
        self.scheduler.lock().await.free_dst_pre_alloc_cache(request_id);
        if request_id.is_none() {
            for worker in &self.workers {
                worker.free_migrating_in_seq_group_metadata();
            }
        }
    }

    // -- teardown ------------------------------------------------------------

    /// Mark this instance dead: stop the engine, flag the workers, and
    /// surface aborts for every queued request.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.engine.stop();
        for worker in &self.workers {
            worker.alive_flag().store(false, Ordering::SeqCst);
        }
        let request_ids = self.scheduler.lock().await.get_all_request_ids();
        self.abort(request_ids).await;
        warn!(instance_id = %self.instance_id, "instance killed");
    }

    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }
}

/// Handle to an instance, addressed by id. Every call checks liveness and is
/// bounded by the RPC deadline; a dead or unresponsive peer surfaces as
/// `RemoteDead`.
#[derive(Clone)]
pub struct InstanceHandle {
    pub instance_id: String,
    instance: Arc<Instance>,
    alive: Arc<AtomicBool>,
}

impl InstanceHandle {
    pub fn new(instance: Arc<Instance>) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            alive: instance.alive_flag(),
            instance,
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::RemoteDead(self.instance_id.clone()))
        }
    }

    /// Kill the underlying instance; subsequent calls through any handle
    /// fail with `RemoteDead`.
    pub async fn kill(&self) {
        self.instance.kill().await;
    }

    pub async fn generate(
        &self,
        request_id: &str,
        server_info: ServerInfo,
        expected_steps: i64,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
    ) -> Result<()> {
        self.check_alive()?;
        self.instance
            .generate(request_id, server_info, expected_steps, prompt_token_ids, sampling_params)
            .await;
        Ok(())
    }

    pub async fn abort(&self, request_ids: Vec<String>) -> Result<()> {
        self.check_alive()?;
        self.instance.abort(request_ids).await;
        Ok(())
    }

    pub async fn get_instance_info(&self) -> Result<InstanceInfo> {
        self.check_alive()?;
        Ok(self.instance.get_instance_info())
    }

    pub async fn get_all_request_ids(&self) -> Result<Vec<String>> {
        self.check_alive()?;
        Ok(self.instance.get_all_request_ids().await)
    }

    pub async fn migrate_out(&self, dst: &InstanceHandle) -> Result<Vec<String>> {
        self.check_alive()?;
        self.instance.migrate_out(dst).await
    }

    pub async fn clear_migration_states(&self, is_migrate_in: bool) -> Result<()> {
        self.check_alive()?;
        self.instance.clear_migration_states(is_migrate_in).await;
        Ok(())
    }

    pub async fn is_ready(&self) -> Result<bool> {
        self.check_alive()?;
        Ok(self.instance.is_ready())
    }

    pub async fn get_world_size(&self) -> Result<usize> {
        self.check_alive()?;
        Ok(self.instance.get_world_size())
    }

    pub async fn get_engine_disagg_inst_id(&self) -> Result<String> {
        self.check_alive()?;
        Ok(self.instance.get_engine_disagg_inst_id().to_string())
    }

    pub async fn run_workers(&self, command: WorkerCommand) -> Result<bool> {
        self.check_alive()?;
        // No deadline here: a collective group join legitimately blocks
        // until every rank arrives, bounded by the group init timeout.
        self.instance.run_workers(command).await
    }

    pub async fn execute_engine_method(&self, name: &str) -> Result<bool> {
        self.check_alive()?;
        self.instance.execute_engine_method(name).await
    }

    pub async fn engine_state(&self) -> Result<EngineState> {
        self.check_alive()?;
        Ok(self.instance.engine_state())
    }

    pub async fn migrate_cache(
        &self,
        src_workers: Vec<WorkerHandle>,
        src_blocks: Vec<usize>,
        dst_blocks: Vec<usize>,
        request_id: &str,
        is_last_stage: bool,
    ) -> Result<()> {
        self.check_alive()?;
        match timeout(
            RPC_TIMEOUT,
            self.instance.migrate_cache_local(
                src_workers,
                src_blocks,
                dst_blocks,
                request_id,
                is_last_stage,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteDead(self.instance_id.clone())),
        }
    }

    pub async fn pre_alloc(
        &self,
        request_id: &str,
        status: RequestStatus,
        expected_steps: i64,
        block_num: usize,
        token_ids: Vec<u32>,
    ) -> Result<Vec<usize>> {
        self.check_alive()?;
        Ok(self
            .instance
            .pre_alloc(request_id, status, expected_steps, block_num, token_ids)
            .await)
    }

    pub async fn free_dst_pre_alloc_cache(&self, request_id: Option<&str>) -> Result<()> {
        self.check_alive()?;
        self.instance.free_dst_pre_alloc_cache(request_id).await;
        Ok(())
    }

    pub async fn commit_dst_request(&self, request: GenerationRequest) -> Result<()> {
        self.check_alive()?;
        self.instance.commit_dst_request(request).await
    }
}

/// Create `count` instances with sequential ids, mirroring the scaler's
/// `init_instances` entry point.
pub fn init_instances(
    count: usize,
    instance_type: InstanceType,
    config: &FlooConfig,
    tp_size: usize,
    registry: &Arc<CollectiveRegistry>,
    generator: &Arc<dyn TokenGenerator>,
) -> Result<(Vec<String>, Vec<InstanceHandle>)> {
    let mut instance_ids = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let instance_id = format!(
            "{}{}",
            crate::constants::INSTANCE_NAME_PREFIX,
            uuid::Uuid::new_v4()
        );
        let instance = Instance::new(
            &instance_id,
            instance_type,
            config,
            tp_size,
            registry.clone(),
            generator.clone(),
        )?;
        instance.start();
        instance_ids.push(instance_id);
        handles.push(InstanceHandle::new(instance));
    }
    Ok((instance_ids, handles))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DeterministicTokenGenerator;

    fn config() -> FlooConfig {
        let mut config = FlooConfig::default();
        config.cache = KvCacheSpec {
            block_size: 4,
            num_kv_heads: 4,
            head_size: 2,
            num_layers: 2,
            num_gpu_blocks: 32,
        };
        config
    }

    fn generator() -> Arc<dyn TokenGenerator> {
        Arc::new(DeterministicTokenGenerator)
    }

    #[tokio::test]
    async fn test_generate_and_complete() {
        let registry = CollectiveRegistry::new();
        let instance = Instance::new(
            "instance-1",
            InstanceType::Neutral,
            &config(),
            1,
            registry,
            generator(),
        )
        .unwrap();
        instance.start();

        let (server_info, mut rx) = ServerInfo::new("server-1");
        instance
            .generate(
                "req-1",
                server_info,
                -1,
                vec![1, 2, 3],
                SamplingParams {
                    max_tokens: 2,
                    ..SamplingParams::default()
                },
            )
            .await;

        let mut finished = false;
        while let Some(output) = rx.recv().await {
            if output.finished {
                assert_eq!(output.output_token_ids.len(), 2);
                assert!(!output.aborted);
                finished = true;
                break;
            }
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_and_delivers_signal() {
        let registry = CollectiveRegistry::new();
        let instance = Instance::new(
            "instance-1",
            InstanceType::Neutral,
            &config(),
            1,
            registry,
            generator(),
        )
        .unwrap();

        let (server_info, mut rx) = ServerInfo::new("server-1");
        instance
            .generate("req-1", server_info, -1, vec![1], SamplingParams::default())
            .await;

        instance.abort(vec!["req-1".to_string()]).await;
        let output = rx.recv().await.unwrap();
        assert!(output.finished);
        assert!(output.aborted);

        // Second abort is a no-op.
        instance.abort(vec!["req-1".to_string()]).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_killed_handle_returns_remote_dead() {
        let registry = CollectiveRegistry::new();
        let instance = Instance::new(
            "instance-1",
            InstanceType::Neutral,
            &config(),
            1,
            registry,
            generator(),
        )
        .unwrap();
        let handle = InstanceHandle::new(instance);
        handle.kill().await;

        let err = handle.get_instance_info().await.unwrap_err();
        assert!(matches!(err, Error::RemoteDead(_)));
    }

    #[tokio::test]
    async fn test_world_size_and_disagg_id() {
        let registry = CollectiveRegistry::new();
        let instance = Instance::new(
            "instance-1",
            InstanceType::Decode,
            &config(),
            2,
            registry,
            generator(),
        )
        .unwrap();
        let handle = InstanceHandle::new(instance);
        assert_eq!(handle.get_world_size().await.unwrap(), 2);
        assert!(!handle.get_engine_disagg_inst_id().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_engine_method_escape_hatch() {
        let registry = CollectiveRegistry::new();
        let instance = Instance::new(
            "instance-1",
            InstanceType::Neutral,
            &config(),
            1,
            registry,
            generator(),
        )
        .unwrap();
        let handle = InstanceHandle::new(instance);

        // The rpc transport warms up against its own staging path.
        assert!(handle.execute_engine_method("warmup").await.unwrap());
        assert!(handle.execute_engine_method("no_such_method").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_unsplittable_heads() {
        let registry = CollectiveRegistry::new();
        let result = Instance::new(
            "instance-1",
            InstanceType::Neutral,
            &config(),
            3,
            registry,
            generator(),
        );
        assert!(result.is_err());
    }
}

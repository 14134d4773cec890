//! Migration Worker
//!
//! One per model worker. Wraps the block transport with per-request
//! bookkeeping:
//! - the destination-driven `migrate_cache` pull loop, chunked by the
//!   staging-buffer capacity
//! - the tensor-parallel reshape path (fan-out when the destination is
//!   wider, fan-in when the source is wider)
//! - sequence-group metadata staging, piggybacked on the final transfer
//! - collective-group rebuild with global-rank recomputation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use floo_common::{Error, Result};

use crate::cache::{KvCacheSpec, KvCacheStore, StagingPayload};
use crate::config::MigrationConfig;
use crate::request::SeqGroupMetadata;
use crate::transport::{BlockTransport, RecvSource, TransportMode};

/// The worker operation set, dispatched as a tagged variant instead of by
/// method name. `execute_method` remains as a string escape hatch for tests
/// and ops tooling.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    RebuildMigrationBackend {
        instance_rank: HashMap<String, usize>,
        group_name: Option<String>,
        instance_rank_tp_size: HashMap<usize, usize>,
    },
    Warmup,
    Shutdown,
    CommitSeqGroupMetadata { request_id: String },
    PopMigratingOutSeqGroupMetadata { request_id: String },
    RestoreMigratingOutSeqGroupMetadata,
    FreeMigratingInSeqGroupMetadata,
}

/// Transfer geometry between two tensor-parallel widths.
///
/// Only integer width ratios are supported; the check runs when a migration
/// starts, never at transport time.
#[derive(Debug, Clone, Copy)]
pub struct TransferPlan {
    /// Destination at least as wide as the source (fan-out)
    pub add_tp: bool,
    pub chunk_size: usize,
}

impl TransferPlan {
    pub fn new(src_tp: usize, dst_tp: usize) -> Result<Self> {
        if src_tp == 0 || dst_tp == 0 || (dst_tp % src_tp != 0 && src_tp % dst_tp != 0) {
            return Err(Error::InvalidConfig(format!(
                "unsupported tensor-parallel ratio {} -> {}",
                src_tp, dst_tp
            )));
        }
        let add_tp = dst_tp >= src_tp;
        let chunk_size = if add_tp {
            dst_tp / src_tp
        } else {
            src_tp / dst_tp
        };
        Ok(Self { add_tp, chunk_size })
    }
}

pub struct MigrationWorker {
    instance_id: String,
    /// Rank within this instance's tensor-parallel group
    local_rank: usize,
    /// This instance's tensor-parallel width
    tp_size: usize,
    spec: KvCacheSpec,
    buffer_blocks: usize,
    store: Arc<AsyncMutex<KvCacheStore>>,
    transport: Arc<dyn BlockTransport>,
    global_rank: AtomicI64,
    global_world_size: AtomicUsize,
    /// Metadata of requests actively stepping on this worker
    metadata_cache: Mutex<HashMap<String, SeqGroupMetadata>>,
    /// Metadata popped for an outbound migration, kept for restore-on-abort
    migrating_out_metadata: Mutex<HashMap<String, SeqGroupMetadata>>,
    /// Metadata received with an inbound last stage, kept until commit
    migrating_in_metadata: Mutex<HashMap<String, SeqGroupMetadata>>,
    alive: Arc<AtomicBool>,
}

impl MigrationWorker {
    pub fn new(
        instance_id: impl Into<String>,
        local_rank: usize,
        tp_size: usize,
        spec: KvCacheSpec,
        migration_config: &MigrationConfig,
        store: Arc<AsyncMutex<KvCacheStore>>,
        transport: Arc<dyn BlockTransport>,
    ) -> Self {
        let config = migration_config.clamped(&spec);
        Self {
            instance_id: instance_id.into(),
            local_rank,
            tp_size,
            spec,
            buffer_blocks: config.migration_buffer_blocks,
            store,
            transport,
            global_rank: AtomicI64::new(-1),
            global_world_size: AtomicUsize::new(0),
            metadata_cache: Mutex::new(HashMap::new()),
            migrating_out_metadata: Mutex::new(HashMap::new()),
            migrating_in_metadata: Mutex::new(HashMap::new()),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn global_rank(&self) -> i64 {
        self.global_rank.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> Arc<AsyncMutex<KvCacheStore>> {
        self.store.clone()
    }

    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    // -- source side ---------------------------------------------------------

    /// Stage one batch of blocks and publish slice `chunk_rank`. On the final
    /// communication of a last stage the request's sequence-group metadata is
    /// popped from the active cache and attached.
    pub async fn do_send(
        &self,
        dst_rank: Option<usize>,
        blocks: &[usize],
        chunk_size: usize,
        chunk_rank: usize,
        request_id: Option<&str>,
        send_worker_metadata: bool,
    ) -> Result<(Option<StagingPayload>, Option<SeqGroupMetadata>)> {
        let payload = self
            .transport
            .send(dst_rank, blocks, chunk_size, chunk_rank)
            .await?;
        let metadata = if send_worker_metadata {
            let request_id = request_id.ok_or_else(|| {
                Error::System("metadata send requested without a request id".to_string())
            })?;
            Some(self.take_seq_group_metadata(request_id)?)
        } else {
            None
        };
        Ok((payload, metadata))
    }

    /// Pop the request's metadata from the active cache into the
    /// migrating-out store. Fan-out sends hit this once per destination
    /// chunk, so a second take returns the already-staged copy.
    fn take_seq_group_metadata(&self, request_id: &str) -> Result<SeqGroupMetadata> {
        let mut cache = self.metadata_cache.lock().unwrap();
        if let Some(metadata) = cache.remove(request_id) {
            self.migrating_out_metadata
                .lock()
                .unwrap()
                .insert(request_id.to_string(), metadata.clone());
            return Ok(metadata);
        }
        drop(cache);
        self.migrating_out_metadata
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .ok_or_else(|| {
                Error::System(format!(
                    "no sequence-group metadata cached for migrating request {}",
                    request_id
                ))
            })
    }

    // -- destination side ----------------------------------------------------

    /// Pull `src_blocks` from the source workers into `dst_blocks`, staged in
    /// batches of the buffer capacity. Runs on every destination worker; the
    /// chunk mapping is derived from the two tensor-parallel widths.
    pub async fn migrate_cache(
        &self,
        src_workers: &[WorkerHandle],
        src_blocks: &[usize],
        dst_blocks: &[usize],
        request_id: &str,
        is_last_stage: bool,
    ) -> Result<()> {
        let plan = TransferPlan::new(src_workers.len(), self.tp_size)?;
        if src_blocks.len() != dst_blocks.len() {
            return Err(Error::Transport(format!(
                "source sends {} blocks, destination reserved {}",
                src_blocks.len(),
                dst_blocks.len()
            )));
        }

        let started = Instant::now();
        let chunk_size = plan.chunk_size;
        if plan.add_tp {
            let src = &src_workers[self.local_rank / chunk_size];
            let chunk_rank = self.local_rank % chunk_size;
            self.pull_fan_out(src, src_blocks, dst_blocks, request_id, is_last_stage, chunk_size, chunk_rank)
                .await?;
        } else {
            let srcs = &src_workers[self.local_rank * chunk_size..(self.local_rank + 1) * chunk_size];
            self.pull_fan_in(srcs, src_blocks, dst_blocks, request_id, is_last_stage, chunk_size)
                .await?;
        }

        let elapsed = started.elapsed().as_secs_f64().max(1e-9);
        let total_bytes = src_blocks.len() * self.spec.block_bytes();
        info!(
            instance_id = %self.instance_id,
            local_rank = self.local_rank,
            request_id,
            num_blocks = src_blocks.len(),
            total_bytes,
            seconds = format!("{:.3}", elapsed),
            gb_per_s = format!("{:.3}", total_bytes as f64 / 1e9 / elapsed),
            "kv cache migration batch done"
        );
        Ok(())
    }

    /// Destination is as wide or wider: one source worker fans out, this
    /// worker receives its own heads slice.
    async fn pull_fan_out(
        &self,
        src: &WorkerHandle,
        src_blocks: &[usize],
        dst_blocks: &[usize],
        request_id: &str,
        is_last_stage: bool,
        chunk_size: usize,
        chunk_rank: usize,
    ) -> Result<()> {
        let total = src_blocks.len();
        let by_value = self.transport.mode() == TransportMode::ByValue;
        let dst_rank = if by_value {
            None
        } else {
            Some(self.require_global_rank()? as usize)
        };
        let src_rank = if by_value {
            0
        } else {
            src.get_global_rank().await? as usize
        };

        let mut metadata: Option<SeqGroupMetadata> = None;
        // Overlap transport of batch i with the pool copy of batch i-1.
        let mut pending: Option<(StagingPayload, Vec<usize>)> = None;

        let mut start = 0;
        loop {
            let end = (start + self.buffer_blocks).min(total);
            let is_last_comm = end == total;
            let send_batch = src_blocks[start..end].to_vec();
            let recv_batch = dst_blocks[start..end].to_vec();
            let send_worker_metadata = is_last_stage && is_last_comm;

            let src_clone = src.clone();
            let request_id_owned = request_id.to_string();
            let send_task = tokio::spawn(async move {
                src_clone
                    .do_send(
                        dst_rank,
                        &send_batch,
                        chunk_size,
                        chunk_rank,
                        Some(&request_id_owned),
                        send_worker_metadata,
                    )
                    .await
            });

            if by_value {
                if let Some((payload, blocks)) = pending.take() {
                    self.do_recv(RecvSource::Payloads(vec![payload]), &blocks, chunk_size)
                        .await?;
                }
            } else {
                self.do_recv(RecvSource::Ranks(vec![src_rank]), &recv_batch, chunk_size)
                    .await?;
            }

            let (payload, batch_metadata) = send_task
                .await
                .map_err(|e| Error::System(format!("send task failed: {}", e)))??;
            if let Some(batch_metadata) = batch_metadata {
                metadata = Some(batch_metadata);
            }
            if by_value {
                let payload = payload.ok_or_else(|| {
                    Error::Transport("by-value send returned no payload".to_string())
                })?;
                pending = Some((payload, recv_batch));
            }

            if is_last_comm {
                break;
            }
            start = end;
        }

        if let Some((payload, blocks)) = pending.take() {
            self.do_recv(RecvSource::Payloads(vec![payload]), &blocks, chunk_size)
                .await?;
        }
        if let Some(metadata) = metadata {
            self.stage_seq_group_metadata(request_id, metadata);
        }
        Ok(())
    }

    /// Source is wider: this worker fans in `chunk_size` sources and
    /// concatenates their slices along the heads axis before each pool copy.
    async fn pull_fan_in(
        &self,
        srcs: &[WorkerHandle],
        src_blocks: &[usize],
        dst_blocks: &[usize],
        request_id: &str,
        is_last_stage: bool,
        chunk_size: usize,
    ) -> Result<()> {
        let total = src_blocks.len();
        let by_value = self.transport.mode() == TransportMode::ByValue;
        let dst_rank = if by_value {
            None
        } else {
            Some(self.require_global_rank()? as usize)
        };
        let mut src_ranks = Vec::with_capacity(srcs.len());
        if !by_value {
            for src in srcs {
                src_ranks.push(src.get_global_rank().await? as usize);
            }
        }

        let mut metadata: Option<SeqGroupMetadata> = None;
        let mut start = 0;
        loop {
            let end = (start + self.buffer_blocks).min(total);
            let is_last_comm = end == total;
            let send_batch = src_blocks[start..end].to_vec();
            let recv_batch = &dst_blocks[start..end];
            let send_worker_metadata = is_last_stage && is_last_comm;

            let mut tasks = Vec::with_capacity(srcs.len());
            for src in srcs {
                let src = src.clone();
                let batch = send_batch.clone();
                let request_id_owned = request_id.to_string();
                tasks.push(tokio::spawn(async move {
                    src.do_send(dst_rank, &batch, 1, 0, Some(&request_id_owned), send_worker_metadata)
                        .await
                }));
            }

            let mut payloads = Vec::with_capacity(srcs.len());
            for task in tasks {
                let (payload, batch_metadata) = task
                    .await
                    .map_err(|e| Error::System(format!("send task failed: {}", e)))??;
                if let Some(batch_metadata) = batch_metadata {
                    metadata = Some(batch_metadata);
                }
                if let Some(payload) = payload {
                    payloads.push(payload);
                }
            }

            if by_value {
                self.do_recv(RecvSource::Payloads(payloads), recv_batch, chunk_size)
                    .await?;
            } else {
                self.do_recv(RecvSource::Ranks(src_ranks.clone()), recv_batch, chunk_size)
                    .await?;
            }

            if is_last_comm {
                break;
            }
            start = end;
        }

        if let Some(metadata) = metadata {
            self.stage_seq_group_metadata(request_id, metadata);
        }
        Ok(())
    }

    /// Install received slices into the live pool at `blocks`.
    pub async fn do_recv(
        &self,
        src: RecvSource,
        blocks: &[usize],
        chunk_size: usize,
    ) -> Result<()> {
        self.transport.recv(src, blocks, chunk_size).await
    }

    fn require_global_rank(&self) -> Result<i64> {
        let rank = self.global_rank();
        if rank < 0 {
            return Err(Error::Transport(format!(
                "worker {}:{} has no collective rank",
                self.instance_id, self.local_rank
            )));
        }
        Ok(rank)
    }

    // -- metadata bookkeeping ------------------------------------------------

    /// Record metadata for a request actively stepping on this worker.
    pub fn cache_seq_group_metadata(&self, metadata: SeqGroupMetadata) {
        self.metadata_cache
            .lock()
            .unwrap()
            .insert(metadata.request_id.clone(), metadata);
    }

    pub fn drop_seq_group_metadata(&self, request_id: &str) {
        self.metadata_cache.lock().unwrap().remove(request_id);
    }

    fn stage_seq_group_metadata(&self, request_id: &str, metadata: SeqGroupMetadata) {
        self.migrating_in_metadata
            .lock()
            .unwrap()
            .insert(request_id.to_string(), metadata);
    }

    /// Install the staged inbound metadata into the active cache.
    pub fn commit_seq_group_metadata(&self, request_id: &str) -> Result<()> {
        let metadata = self
            .migrating_in_metadata
            .lock()
            .unwrap()
            .remove(request_id)
            .ok_or_else(|| {
                Error::System(format!(
                    "no staged inbound metadata for request {}",
                    request_id
                ))
            })?;
        self.metadata_cache
            .lock()
            .unwrap()
            .insert(request_id.to_string(), metadata);
        Ok(())
    }

    /// Drop the outbound copy after the destination has committed.
    pub fn pop_migrating_out_seq_group_metadata(&self, request_id: &str) {
        self.migrating_out_metadata.lock().unwrap().remove(request_id);
    }

    /// Put every staged outbound metadata back into the active cache.
    /// Always runs on abort before commit; a second restore is a no-op.
    pub fn restore_migrating_out_seq_group_metadata(&self) {
        let mut out = self.migrating_out_metadata.lock().unwrap();
        let mut cache = self.metadata_cache.lock().unwrap();
        for (request_id, metadata) in out.drain() {
            cache.insert(request_id, metadata);
        }
    }

    pub fn free_migrating_in_seq_group_metadata(&self) {
        self.migrating_in_metadata.lock().unwrap().clear();
    }

    pub fn has_cached_metadata(&self, request_id: &str) -> bool {
        self.metadata_cache.lock().unwrap().contains_key(request_id)
    }

    pub fn has_staged_in_metadata(&self, request_id: &str) -> bool {
        self.migrating_in_metadata
            .lock()
            .unwrap()
            .contains_key(request_id)
    }

    // -- group management ----------------------------------------------------

    /// Rebuild the collective backend after a membership change.
    ///
    /// `instance_rank` orders the alive instances; this worker's global rank
    /// is the sum of the preceding instances' tensor-parallel sizes plus its
    /// local rank. A `None` group name only tears the old group down.
    pub async fn rebuild_migration_backend(
        &self,
        instance_rank: &HashMap<String, usize>,
        group_name: Option<&str>,
        instance_rank_tp_size: &HashMap<usize, usize>,
    ) -> Result<bool> {
        self.transport.destroy_group().await;
        self.global_rank.store(-1, Ordering::SeqCst);
        self.global_world_size.store(0, Ordering::SeqCst);

        let Some(group_name) = group_name else {
            return Ok(true);
        };
        let cur_rank = *instance_rank.get(&self.instance_id).ok_or_else(|| {
            Error::System(format!(
                "instance {} missing from rank assignment",
                self.instance_id
            ))
        })?;

        let mut global_size = 0usize;
        let mut my_global_rank = None;
        for rank in 0..instance_rank_tp_size.len() {
            let tp_size = *instance_rank_tp_size.get(&rank).ok_or_else(|| {
                Error::System(format!("rank {} missing from tp-size table", rank))
            })?;
            if rank == cur_rank {
                my_global_rank = Some(global_size + self.local_rank);
            }
            global_size += tp_size;
        }
        let my_global_rank = my_global_rank.ok_or_else(|| {
            Error::System(format!("rank {} not covered by tp-size table", cur_rank))
        })?;

        debug!(
            instance_id = %self.instance_id,
            local_rank = self.local_rank,
            group_name,
            global_rank = my_global_rank,
            global_world_size = global_size,
            "rebuilding migration backend"
        );

        let ok = self
            .transport
            .init_group(group_name, global_size, my_global_rank)
            .await;
        if ok {
            self.global_rank.store(my_global_rank as i64, Ordering::SeqCst);
            self.global_world_size.store(global_size, Ordering::SeqCst);
        } else {
            warn!(
                instance_id = %self.instance_id,
                local_rank = self.local_rank,
                group_name,
                "migration backend rebuild failed"
            );
        }
        Ok(ok)
    }

    pub async fn warmup(&self) -> bool {
        self.transport.warmup().await
    }

    /// Release transport resources and drop migration state. Invoked when
    /// the owning engine crashes or the instance is torn down.
    pub async fn shutdown(&self) {
        self.transport.destroy_group().await;
        self.metadata_cache.lock().unwrap().clear();
        self.migrating_out_metadata.lock().unwrap().clear();
        self.migrating_in_metadata.lock().unwrap().clear();
        self.alive.store(false, Ordering::SeqCst);
    }

    // -- command dispatch ----------------------------------------------------

    pub async fn execute_command(&self, command: WorkerCommand) -> Result<bool> {
        match command {
            WorkerCommand::RebuildMigrationBackend {
                instance_rank,
                group_name,
                instance_rank_tp_size,
            } => {
                self.rebuild_migration_backend(
                    &instance_rank,
                    group_name.as_deref(),
                    &instance_rank_tp_size,
                )
                .await
            }
            WorkerCommand::Warmup => Ok(self.warmup().await),
            WorkerCommand::Shutdown => {
                self.shutdown().await;
                Ok(true)
            }
            WorkerCommand::CommitSeqGroupMetadata { request_id } => {
                self.commit_seq_group_metadata(&request_id)?;
                Ok(true)
            }
            WorkerCommand::PopMigratingOutSeqGroupMetadata { request_id } => {
                self.pop_migrating_out_seq_group_metadata(&request_id);
                Ok(true)
            }
            WorkerCommand::RestoreMigratingOutSeqGroupMetadata => {
                self.restore_migrating_out_seq_group_metadata();
                Ok(true)
            }
            WorkerCommand::FreeMigratingInSeqGroupMetadata => {
                self.free_migrating_in_seq_group_metadata();
                Ok(true)
            }
        }
    }

    /// String escape hatch over the nullary commands, for tests and ops.
    pub async fn execute_method(&self, name: &str) -> Result<bool> {
        let command = match name {
            "warmup" => WorkerCommand::Warmup,
            "shutdown" => WorkerCommand::Shutdown,
            "restore_migrating_out_seq_group_metadata" => {
                WorkerCommand::RestoreMigratingOutSeqGroupMetadata
            }
            "free_migrating_in_seq_group_metadata" => {
                WorkerCommand::FreeMigratingInSeqGroupMetadata
            }
            other => {
                return Err(Error::System(format!("unknown worker method: {}", other)));
            }
        };
        self.execute_command(command).await
    }
}

/// Handle to a worker addressed by `(instance id, rank)`; only the logical
/// ids cross the wire. Calls against a dead worker fail with `RemoteDead`.
#[derive(Clone)]
pub struct WorkerHandle {
    pub instance_id: String,
    pub rank: usize,
    worker: Arc<MigrationWorker>,
    alive: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn new(worker: Arc<MigrationWorker>) -> Self {
        Self {
            instance_id: worker.instance_id.clone(),
            rank: worker.local_rank,
            alive: worker.alive_flag(),
            worker,
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::RemoteDead(format!(
                "{}:{}",
                self.instance_id, self.rank
            )))
        }
    }

    pub async fn do_send(
        &self,
        dst_rank: Option<usize>,
        blocks: &[usize],
        chunk_size: usize,
        chunk_rank: usize,
        request_id: Option<&str>,
        send_worker_metadata: bool,
    ) -> Result<(Option<StagingPayload>, Option<SeqGroupMetadata>)> {
        self.check_alive()?;
        self.worker
            .do_send(
                dst_rank,
                blocks,
                chunk_size,
                chunk_rank,
                request_id,
                send_worker_metadata,
            )
            .await
    }

    pub async fn get_global_rank(&self) -> Result<i64> {
        self.check_alive()?;
        Ok(self.worker.global_rank())
    }
}

//! Block Transport Backends
//!
//! Moves batches of KV-cache blocks between workers while preserving the
//! `layer x {K,V} x block x heads x head_size` layout:
//! - RPC variant: stage the blocks, serialize the staging buffer, return it
//!   by value to the caller
//! - Collective variants: stage the blocks and push them through a named
//!   communication group, on host (CPU) or device (GPU) memory
//!
//! When source and destination tensor-parallel widths differ, the staged
//! batch is split along the kv-heads axis into `chunk_size` slices; only
//! chunk rank 0 performs the copy and the split, the remaining ranks wait on
//! the split event, and all ranks rendezvous on a per-send barrier before
//! returning.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Barrier, Mutex, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use floo_common::{Error, Result};

use crate::cache::{KvCacheStore, StagingPayload};
use crate::config::MigrationConfig;

/// Deadline for one collective receive before the migration is aborted
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// How staged slices reach the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Slices are returned by value from the send call
    ByValue,
    /// Slices travel through a collective group and are received by rank
    Collective,
}

/// Where a receive takes its slices from
pub enum RecvSource {
    /// Slices already in hand, returned by value from the RPC path
    Payloads(Vec<StagingPayload>),
    /// Global ranks to pull one slice each from, collective path
    Ranks(Vec<usize>),
}

/// A pluggable transport for KV-cache block batches.
///
/// One batch is at most `migration_buffer_blocks` blocks; the caller loops
/// over larger transfers.
#[async_trait]
pub trait BlockTransport: Send + Sync {
    /// Join the named communication group. Idempotent and time-bounded; a
    /// timeout returns `false` and leaves the transport uninitialized.
    async fn init_group(&self, group_name: &str, world_size: usize, rank: usize) -> bool;

    /// Leave the current group, releasing collective resources.
    async fn destroy_group(&self);

    /// One minimal exchange verifying the peers are reachable.
    async fn warmup(&self) -> bool;

    /// Stage `blocks` out of the live pool and publish slice `chunk_rank` of
    /// `chunk_size`. Returns the slice by value on the RPC path, `None` on
    /// the collective path (the slice went through the group to `dst_rank`).
    async fn send(
        &self,
        dst_rank: Option<usize>,
        blocks: &[usize],
        chunk_size: usize,
        chunk_rank: usize,
    ) -> Result<Option<StagingPayload>>;

    /// Receive `chunk_size` slices, concatenate them along the heads axis,
    /// and install them into the live pool at `blocks`.
    async fn recv(&self, src: RecvSource, blocks: &[usize], chunk_size: usize) -> Result<()>;

    /// Rank within the current group, if one is initialized.
    fn group_rank(&self) -> Option<usize>;

    fn mode(&self) -> TransportMode;
}

// ---------------------------------------------------------------------------
// Chunk-split send coordination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitStatus {
    Pending,
    Ready,
    Failed,
}

struct SendShared {
    barrier: Barrier,
    slices: std::sync::Mutex<Vec<StagingPayload>>,
    ready_tx: watch::Sender<SplitStatus>,
}

/// Serializes staging-buffer use and coordinates the fan-out split.
///
/// One batch is in flight per worker at a time; the `chunk_size` concurrent
/// send calls of a fan-out all join the same [`SendShared`].
struct ChunkedSender {
    slot: Mutex<Option<Arc<SendShared>>>,
    slot_set: Notify,
    slot_free: Notify,
}

impl ChunkedSender {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            slot_set: Notify::new(),
            slot_free: Notify::new(),
        }
    }

    async fn install(&self, chunk_size: usize) -> Arc<SendShared> {
        loop {
            let notified = self.slot_free.notified();
            {
                let mut slot = self.slot.lock().await;
                if slot.is_none() {
                    let (ready_tx, _) = watch::channel(SplitStatus::Pending);
                    let shared = Arc::new(SendShared {
                        barrier: Barrier::new(chunk_size),
                        slices: std::sync::Mutex::new(Vec::new()),
                        ready_tx,
                    });
                    *slot = Some(shared.clone());
                    self.slot_set.notify_waiters();
                    return shared;
                }
            }
            notified.await;
        }
    }

    async fn join(&self) -> Arc<SendShared> {
        loop {
            let notified = self.slot_set.notified();
            {
                let slot = self.slot.lock().await;
                if let Some(shared) = slot.as_ref() {
                    return shared.clone();
                }
            }
            notified.await;
        }
    }

    async fn clear(&self) {
        let mut slot = self.slot.lock().await;
        *slot = None;
        self.slot_free.notify_waiters();
    }

    /// Stage `blocks` and return slice `chunk_rank`. Rank 0 performs the
    /// pool copy and the heads split; other ranks wait for the split event.
    /// All ranks rendezvous before returning.
    async fn stage(
        &self,
        store: &Mutex<KvCacheStore>,
        blocks: &[usize],
        chunk_size: usize,
        chunk_rank: usize,
    ) -> Result<StagingPayload> {
        if chunk_rank >= chunk_size {
            return Err(Error::Transport(format!(
                "chunk rank {} out of range for chunk size {}",
                chunk_rank, chunk_size
            )));
        }
        let shared = if chunk_rank == 0 {
            let shared = self.install(chunk_size).await;
            let split = async {
                let payload = store.lock().await.read_blocks(blocks)?;
                payload.split_heads(chunk_size)
            }
            .await;
            match split {
                Ok(slices) => {
                    *shared.slices.lock().unwrap() = slices;
                    let _ = shared.ready_tx.send(SplitStatus::Ready);
                }
                Err(e) => {
                    // Release the waiting ranks before surfacing the error.
                    let _ = shared.ready_tx.send(SplitStatus::Failed);
                    self.clear().await;
                    return Err(e);
                }
            }
            shared
        } else {
            let shared = self.join().await;
            let mut ready_rx = shared.ready_tx.subscribe();
            loop {
                match *ready_rx.borrow() {
                    SplitStatus::Ready => break,
                    SplitStatus::Failed => {
                        return Err(Error::Transport("split producer failed".to_string()))
                    }
                    SplitStatus::Pending => {}
                }
                if ready_rx.changed().await.is_err() {
                    return Err(Error::Transport("split producer went away".to_string()));
                }
            }
            shared
        };

        let slice = shared
            .slices
            .lock()
            .unwrap()
            .get(chunk_rank)
            .cloned()
            .ok_or_else(|| Error::Transport("split slice missing".to_string()))?;

        shared.barrier.wait().await;
        if chunk_rank == 0 {
            self.clear().await;
        }
        Ok(slice)
    }
}

// ---------------------------------------------------------------------------
// RPC transport
// ---------------------------------------------------------------------------

/// Serializes the staging buffer and returns it by value; the shared-memory
/// RPC path. Needs no communication group.
pub struct RpcTransport {
    buffer_blocks: usize,
    store: Arc<Mutex<KvCacheStore>>,
    sender: ChunkedSender,
}

impl RpcTransport {
    pub fn new(config: &MigrationConfig, store: Arc<Mutex<KvCacheStore>>) -> Self {
        Self {
            buffer_blocks: config.migration_buffer_blocks,
            store,
            sender: ChunkedSender::new(),
        }
    }
}

#[async_trait]
impl BlockTransport for RpcTransport {
    async fn init_group(&self, _group_name: &str, _world_size: usize, _rank: usize) -> bool {
        // RPC transfers ride on direct worker calls; no group to build.
        true
    }

    async fn destroy_group(&self) {}

    async fn warmup(&self) -> bool {
        match self.store.lock().await.read_blocks(&[0]) {
            Ok(_) => {
                info!("rpc transport warmup successful");
                true
            }
            Err(e) => {
                warn!(error = %e, "rpc transport warmup failed");
                false
            }
        }
    }

    async fn send(
        &self,
        _dst_rank: Option<usize>,
        blocks: &[usize],
        chunk_size: usize,
        chunk_rank: usize,
    ) -> Result<Option<StagingPayload>> {
        if blocks.len() > self.buffer_blocks {
            return Err(Error::Transport(format!(
                "batch of {} blocks exceeds staging capacity {}",
                blocks.len(),
                self.buffer_blocks
            )));
        }
        let slice = self
            .sender
            .stage(&self.store, blocks, chunk_size, chunk_rank)
            .await?;
        Ok(Some(slice))
    }

    async fn recv(&self, src: RecvSource, blocks: &[usize], _chunk_size: usize) -> Result<()> {
        let slices = match src {
            RecvSource::Payloads(slices) => slices,
            RecvSource::Ranks(_) => {
                return Err(Error::Transport(
                    "rpc transport receives payloads by value, not by rank".to_string(),
                ))
            }
        };
        let payload = StagingPayload::concat_heads(&slices)?;
        self.store.lock().await.write_blocks(&payload, blocks)
    }

    fn group_rank(&self) -> Option<usize> {
        None
    }

    fn mode(&self) -> TransportMode {
        TransportMode::ByValue
    }
}

// ---------------------------------------------------------------------------
// Collective transport
// ---------------------------------------------------------------------------

/// Whether collective staging lives in host or device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveKind {
    Cpu,
    Gpu,
}

struct Mailbox {
    // src rank -> queued slices
    queues: std::sync::Mutex<HashMap<usize, VecDeque<StagingPayload>>>,
    notify: Notify,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queues: std::sync::Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, src_rank: usize, payload: StagingPayload) {
        self.queues
            .lock()
            .unwrap()
            .entry(src_rank)
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    async fn pop(&self, src_rank: usize, deadline: Duration) -> Result<StagingPayload> {
        let recv = async {
            loop {
                let notified = self.notify.notified();
                if let Some(payload) = self
                    .queues
                    .lock()
                    .unwrap()
                    .get_mut(&src_rank)
                    .and_then(|q| q.pop_front())
                {
                    return payload;
                }
                notified.await;
            }
        };
        timeout(deadline, recv).await.map_err(|_| {
            Error::Transport(format!("receive from rank {} timed out", src_rank))
        })
    }
}

struct GroupState {
    world_size: usize,
    joined: HashSet<usize>,
    mailboxes: HashMap<usize, Arc<Mailbox>>,
}

/// In-process rendezvous point for collective groups, keyed by group name.
///
/// `init_group` blocks until all `world_size` ranks have joined, mirroring a
/// collective bring-up; a rank that never shows up turns into an init
/// timeout on every waiting peer.
pub struct CollectiveRegistry {
    groups: std::sync::Mutex<HashMap<String, GroupState>>,
    changed: Notify,
}

impl CollectiveRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: std::sync::Mutex::new(HashMap::new()),
            changed: Notify::new(),
        })
    }

    fn join_inner(&self, group_name: &str, world_size: usize, rank: usize) -> Result<Arc<Mailbox>> {
        let mut groups = self.groups.lock().unwrap();
        let state = groups.entry(group_name.to_string()).or_insert(GroupState {
            world_size,
            joined: HashSet::new(),
            mailboxes: HashMap::new(),
        });
        if state.world_size != world_size {
            return Err(Error::InvalidConfig(format!(
                "group {} created with world size {}, joined with {}",
                group_name, state.world_size, world_size
            )));
        }
        state.joined.insert(rank);
        let mailbox = state
            .mailboxes
            .entry(rank)
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone();
        self.changed.notify_waiters();
        Ok(mailbox)
    }

    fn is_complete(&self, group_name: &str) -> bool {
        let groups = self.groups.lock().unwrap();
        groups
            .get(group_name)
            .map(|s| s.joined.len() == s.world_size)
            .unwrap_or(false)
    }

    /// Join the group and wait for all ranks, bounded by `deadline`.
    pub async fn join(
        &self,
        group_name: &str,
        world_size: usize,
        rank: usize,
        deadline: Duration,
    ) -> Result<Arc<Mailbox>> {
        let mailbox = self.join_inner(group_name, world_size, rank)?;
        let wait_all = async {
            loop {
                let notified = self.changed.notified();
                if self.is_complete(group_name) {
                    return;
                }
                notified.await;
            }
        };
        timeout(deadline, wait_all)
            .await
            .map_err(|_| Error::GroupInitTimeout(group_name.to_string()))?;
        Ok(mailbox)
    }

    pub fn leave(&self, group_name: &str, rank: usize) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(state) = groups.get_mut(group_name) {
            state.joined.remove(&rank);
            state.mailboxes.remove(&rank);
            if state.joined.is_empty() {
                groups.remove(group_name);
            }
        }
        self.changed.notify_waiters();
    }

    fn mailbox_of(&self, group_name: &str, rank: usize) -> Result<Arc<Mailbox>> {
        self.groups
            .lock()
            .unwrap()
            .get(group_name)
            .and_then(|s| s.mailboxes.get(&rank).cloned())
            .ok_or_else(|| Error::Transport(format!("rank {} unreachable in group {}", rank, group_name)))
    }

    fn send_to(&self, group_name: &str, src_rank: usize, dst_rank: usize, payload: StagingPayload) -> Result<()> {
        self.mailbox_of(group_name, dst_rank)?.push(src_rank, payload);
        Ok(())
    }
}

struct GroupMembership {
    name: String,
    world_size: usize,
    rank: usize,
    mailbox: Arc<Mailbox>,
}

/// Send/recv through a named collective group.
pub struct CollectiveTransport {
    kind: CollectiveKind,
    buffer_blocks: usize,
    init_timeout: Duration,
    store: Arc<Mutex<KvCacheStore>>,
    registry: Arc<CollectiveRegistry>,
    membership: Mutex<Option<GroupMembership>>,
    sender: ChunkedSender,
}

impl CollectiveTransport {
    pub fn new(
        kind: CollectiveKind,
        config: &MigrationConfig,
        store: Arc<Mutex<KvCacheStore>>,
        registry: Arc<CollectiveRegistry>,
    ) -> Self {
        Self {
            kind,
            buffer_blocks: config.migration_buffer_blocks,
            init_timeout: config.init_timeout(),
            store,
            registry,
            membership: Mutex::new(None),
            sender: ChunkedSender::new(),
        }
    }
}

#[async_trait]
impl BlockTransport for CollectiveTransport {
    async fn init_group(&self, group_name: &str, world_size: usize, rank: usize) -> bool {
        let mut membership = self.membership.lock().await;
        if let Some(current) = membership.take() {
            self.registry.leave(&current.name, current.rank);
        }
        match self
            .registry
            .join(group_name, world_size, rank, self.init_timeout)
            .await
        {
            Ok(mailbox) => {
                info!(
                    group_name,
                    world_size,
                    rank,
                    kind = ?self.kind,
                    "collective group created"
                );
                *membership = Some(GroupMembership {
                    name: group_name.to_string(),
                    world_size,
                    rank,
                    mailbox,
                });
                true
            }
            Err(e) => {
                // Leave the half-joined group so later rebuilds start clean.
                self.registry.leave(group_name, rank);
                warn!(group_name, world_size, rank, error = %e, "collective group init failed");
                false
            }
        }
    }

    async fn destroy_group(&self) {
        let mut membership = self.membership.lock().await;
        if let Some(current) = membership.take() {
            self.registry.leave(&current.name, current.rank);
            info!(group_name = %current.name, rank = current.rank, "collective group destroyed");
        }
    }

    async fn warmup(&self) -> bool {
        let (name, world_size, rank) = {
            let membership = self.membership.lock().await;
            match membership.as_ref() {
                Some(m) => (m.name.clone(), m.world_size, m.rank),
                None => return false,
            }
        };
        if world_size <= 1 {
            return true;
        }
        // Ring exchange of a one-element payload.
        let probe = StagingPayload::zeroed(0, 1, 1, 1, 1);
        let next = (rank + 1) % world_size;
        let prev = (rank + world_size - 1) % world_size;
        if let Err(e) = self.registry.send_to(&name, rank, next, probe) {
            warn!(group_name = %name, rank, error = %e, "warmup send failed");
            return false;
        }
        let mailbox = {
            let membership = self.membership.lock().await;
            membership.as_ref().map(|m| m.mailbox.clone())
        };
        let Some(mailbox) = mailbox else { return false };
        match mailbox.pop(prev, RECV_TIMEOUT).await {
            Ok(_) => {
                debug!(group_name = %name, rank, "collective warmup successful");
                true
            }
            Err(e) => {
                warn!(group_name = %name, rank, error = %e, "warmup recv failed");
                false
            }
        }
    }

    async fn send(
        &self,
        dst_rank: Option<usize>,
        blocks: &[usize],
        chunk_size: usize,
        chunk_rank: usize,
    ) -> Result<Option<StagingPayload>> {
        if blocks.len() > self.buffer_blocks {
            return Err(Error::Transport(format!(
                "batch of {} blocks exceeds staging capacity {}",
                blocks.len(),
                self.buffer_blocks
            )));
        }
        let dst_rank = dst_rank.ok_or_else(|| {
            Error::Transport("collective send requires a destination rank".to_string())
        })?;
        let (name, rank) = {
            let membership = self.membership.lock().await;
            let m = membership
                .as_ref()
                .ok_or_else(|| Error::Transport("collective group not initialized".to_string()))?;
            (m.name.clone(), m.rank)
        };
        let slice = self
            .sender
            .stage(&self.store, blocks, chunk_size, chunk_rank)
            .await?;
        self.registry.send_to(&name, rank, dst_rank, slice)?;
        Ok(None)
    }

    async fn recv(&self, src: RecvSource, blocks: &[usize], _chunk_size: usize) -> Result<()> {
        let src_ranks = match src {
            RecvSource::Ranks(ranks) => ranks,
            RecvSource::Payloads(_) => {
                return Err(Error::Transport(
                    "collective transport receives by rank, not by value".to_string(),
                ))
            }
        };
        let mailbox = {
            let membership = self.membership.lock().await;
            membership
                .as_ref()
                .map(|m| m.mailbox.clone())
                .ok_or_else(|| Error::Transport("collective group not initialized".to_string()))?
        };
        let mut slices = Vec::with_capacity(src_ranks.len());
        for src_rank in src_ranks {
            slices.push(mailbox.pop(src_rank, RECV_TIMEOUT).await?);
        }
        let payload = StagingPayload::concat_heads(&slices)?;
        self.store.lock().await.write_blocks(&payload, blocks)
    }

    fn group_rank(&self) -> Option<usize> {
        self.membership
            .try_lock()
            .ok()
            .and_then(|m| m.as_ref().map(|m| m.rank))
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Collective
    }
}

/// Build the transport configured for this worker.
pub fn build_transport(
    config: &MigrationConfig,
    store: Arc<Mutex<KvCacheStore>>,
    registry: Arc<CollectiveRegistry>,
) -> Arc<dyn BlockTransport> {
    use crate::config::MigrationBackendKind;
    match config.migration_backend {
        MigrationBackendKind::Rpc => Arc::new(RpcTransport::new(config, store)),
        MigrationBackendKind::CollectiveCpu => Arc::new(CollectiveTransport::new(
            CollectiveKind::Cpu,
            config,
            store,
            registry,
        )),
        MigrationBackendKind::CollectiveGpu => Arc::new(CollectiveTransport::new(
            CollectiveKind::Gpu,
            config,
            store,
            registry,
        )),
    }
}

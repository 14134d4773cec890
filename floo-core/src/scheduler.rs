//! Instance Scheduler
//!
//! Per-instance request state: waiting/running queues, the block pool
//! accounting, pre-allocation reservations for inbound migrations, and the
//! migrating-out bookkeeping the migration driver relies on.
//!
//! Invariant: blocks held by running, waiting, migrating-last-stage, and
//! pre-alloc reservations are pairwise disjoint subsets of the block pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use tracing::{debug, info};

use floo_common::{InferenceType, RequestStatus};

use crate::cache::KvCacheSpec;
use crate::request::{GenerationRequest, RequestOutput, ServerInfo};

/// Produces the next token for a running request.
///
/// Stands in for the sampler/forward-pass collaborator; injected into the
/// engine so tests can drive deterministic streams.
pub trait TokenGenerator: Send + Sync {
    fn next_token(&self, request: &GenerationRequest) -> floo_common::Result<u32>;
}

/// Deterministic generator: the next token is a function of the request id
/// and the position, so migrated requests continue the same stream.
#[derive(Debug, Default)]
pub struct DeterministicTokenGenerator;

impl TokenGenerator for DeterministicTokenGenerator {
    fn next_token(&self, request: &GenerationRequest) -> floo_common::Result<u32> {
        let mut hash: u32 = 2166136261;
        for byte in request.request_id.bytes() {
            hash = (hash ^ byte as u32).wrapping_mul(16777619);
        }
        Ok(hash.wrapping_add(request.output_token_ids.len() as u32) % 32000)
    }
}

/// Uniform sampler over the vocabulary, for load generation where streams
/// need not be reproducible.
#[derive(Debug)]
pub struct RandomTokenGenerator {
    pub vocab_size: u32,
}

impl Default for RandomTokenGenerator {
    fn default() -> Self {
        Self { vocab_size: 32000 }
    }
}

impl TokenGenerator for RandomTokenGenerator {
    fn next_token(&self, _request: &GenerationRequest) -> floo_common::Result<u32> {
        use rand::Rng;
        Ok(rand::thread_rng().gen_range(0..self.vocab_size))
    }
}

/// Free-list allocator over the instance's block pool
#[derive(Debug)]
pub struct BlockManager {
    num_blocks: usize,
    free_blocks: Vec<usize>,
}

impl BlockManager {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            num_blocks,
            free_blocks: (0..num_blocks).rev().collect(),
        }
    }

    pub fn num_free(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_blocks
    }

    pub fn allocate(&mut self, count: usize) -> Option<Vec<usize>> {
        if count > self.free_blocks.len() {
            return None;
        }
        let at = self.free_blocks.len() - count;
        Some(self.free_blocks.split_off(at))
    }

    pub fn free(&mut self, blocks: &[usize]) {
        self.free_blocks.extend_from_slice(blocks);
    }
}

/// Blocks reserved on a destination ahead of the transfer
#[derive(Debug)]
struct PreAllocEntry {
    blocks: Vec<usize>,
    status: RequestStatus,
    expected_steps: i64,
    token_ids: Vec<u32>,
}

/// Per-instance queue and block-table manager
pub struct InstanceScheduler {
    block_size: usize,
    last_stage_max_blocks: usize,
    block_manager: BlockManager,
    waiting: VecDeque<GenerationRequest>,
    running: Vec<GenerationRequest>,
    migrating_out_last_stage: Vec<GenerationRequest>,
    pre_alloc_cache: HashMap<String, PreAllocEntry>,
    num_killed_requests: usize,
    next_seq_id: u64,
}

impl InstanceScheduler {
    pub fn new(spec: &KvCacheSpec, last_stage_max_blocks: usize) -> Self {
        Self {
            block_size: spec.block_size,
            last_stage_max_blocks,
            block_manager: BlockManager::new(spec.num_gpu_blocks),
            waiting: VecDeque::new(),
            running: Vec::new(),
            migrating_out_last_stage: Vec::new(),
            pre_alloc_cache: HashMap::new(),
            num_killed_requests: 0,
            next_seq_id: 0,
        }
    }

    // -- queue entry points --------------------------------------------------

    pub fn add_waiting_request(&mut self, request: GenerationRequest) {
        debug_assert_eq!(request.status, RequestStatus::Waiting);
        self.waiting.push_back(request);
    }

    pub fn add_running_request(&mut self, request: GenerationRequest) {
        debug_assert_eq!(request.status, RequestStatus::Running);
        self.running.push(request);
    }

    pub fn remove_running_request(&mut self, request_id: &str) -> Option<GenerationRequest> {
        let idx = self.running.iter().position(|r| r.request_id == request_id)?;
        Some(self.running.remove(idx))
    }

    pub fn remove_waiting_request(&mut self, request_id: &str) -> Option<GenerationRequest> {
        let idx = self.waiting.iter().position(|r| r.request_id == request_id)?;
        self.waiting.remove(idx)
    }

    pub fn running_requests(&self) -> &[GenerationRequest] {
        &self.running
    }

    pub fn running_request_mut(&mut self, request_id: &str) -> Option<&mut GenerationRequest> {
        self.running.iter_mut().find(|r| r.request_id == request_id)
    }

    pub fn get_all_request_ids(&self) -> Vec<String> {
        self.running
            .iter()
            .chain(self.waiting.iter())
            .chain(self.migrating_out_last_stage.iter())
            .map(|r| r.request_id.clone())
            .collect()
    }

    /// Remove a request from whichever queue holds it, freeing its blocks.
    /// Returns the request for abort delivery; `None` when unknown (abort is
    /// idempotent).
    pub fn abort_request(&mut self, request_id: &str) -> Option<GenerationRequest> {
        if let Some(mut request) = self.remove_running_request(request_id) {
            self.block_manager.free(&request.block_table);
            request.block_table.clear();
            request.status = RequestStatus::Finished;
            return Some(request);
        }
        if let Some(mut request) = self.remove_waiting_request(request_id) {
            request.status = RequestStatus::Finished;
            return Some(request);
        }
        None
    }

    // -- migration: source side ----------------------------------------------

    /// Next block delta for an outbound migration.
    ///
    /// Returns `(incremental_blocks, incremental_tokens, is_last_stage)`;
    /// last stage is reached when the remainder fits the last-stage cap or
    /// the request is blocked on a migration handoff.
    pub fn get_request_incremental_blocks(
        &self,
        request_id: &str,
        pre_stage_num_blocks: usize,
    ) -> Option<(Vec<usize>, Vec<u32>, bool)> {
        let request = self
            .running
            .iter()
            .chain(self.migrating_out_last_stage.iter())
            .find(|r| r.request_id == request_id)?;
        let blocks: Vec<usize> = request
            .block_table
            .iter()
            .skip(pre_stage_num_blocks)
            .copied()
            .collect();
        let tokens: Vec<u32> = request
            .prompt_token_ids
            .iter()
            .chain(request.output_token_ids.iter())
            .skip(pre_stage_num_blocks * self.block_size)
            .copied()
            .collect();
        let is_last_stage =
            blocks.len() <= self.last_stage_max_blocks || request.blocking_migration();
        Some((blocks, tokens, is_last_stage))
    }

    /// All token ids (prompt then outputs) of a request known to this
    /// scheduler; the destination reserves state against the full list.
    pub fn full_token_ids(&self, request_id: &str) -> Option<Vec<u32>> {
        self.running
            .iter()
            .chain(self.migrating_out_last_stage.iter())
            .chain(self.waiting.iter())
            .find(|r| r.request_id == request_id)
            .map(|r| {
                r.prompt_token_ids
                    .iter()
                    .chain(r.output_token_ids.iter())
                    .copied()
                    .collect()
            })
    }

    /// True when the migrating request finished or was reset underneath the
    /// migration and the transfer must be abandoned.
    pub fn should_abort_migration(&self, request_id: &str, arrival_time: Instant) -> bool {
        let request = self
            .running
            .iter()
            .chain(self.migrating_out_last_stage.iter())
            .find(|r| r.request_id == request_id);
        match request {
            Some(request) => request.is_finished() || request.arrival_time != arrival_time,
            None => true,
        }
    }

    pub fn add_migrating_out_request_last_stage(&mut self, request: GenerationRequest) {
        self.migrating_out_last_stage.push(request);
    }

    pub fn pop_migrating_out_request_last_stage(
        &mut self,
        request_id: &str,
    ) -> Option<GenerationRequest> {
        let idx = self
            .migrating_out_last_stage
            .iter()
            .position(|r| r.request_id == request_id)?;
        Some(self.migrating_out_last_stage.remove(idx))
    }

    /// Drain the migrating-out last-stage list, used when clearing source
    /// migration state after an abort.
    pub fn free_migrating_out_requests_last_stage(&mut self) -> Vec<GenerationRequest> {
        std::mem::take(&mut self.migrating_out_last_stage)
    }

    /// Release all source-side blocks of a successfully migrated request.
    pub fn free_src_request(&mut self, request: &GenerationRequest) {
        debug!(
            request_id = %request.request_id,
            num_blocks = request.block_table.len(),
            "freeing source blocks of migrated request"
        );
        self.block_manager.free(&request.block_table);
    }

    // -- migration: destination side ----------------------------------------

    /// Reserve `block_num` blocks for an inbound migration stage. Returns the
    /// reserved block indices, empty when the pool cannot accommodate them.
    pub fn pre_alloc(
        &mut self,
        request_id: &str,
        status: RequestStatus,
        expected_steps: i64,
        block_num: usize,
        token_ids: Vec<u32>,
    ) -> Vec<usize> {
        let Some(blocks) = self.block_manager.allocate(block_num) else {
            debug!(
                request_id,
                block_num,
                num_free = self.block_manager.num_free(),
                "pre-alloc refused, insufficient free blocks"
            );
            return Vec::new();
        };
        let entry = self
            .pre_alloc_cache
            .entry(request_id.to_string())
            .or_insert(PreAllocEntry {
                blocks: Vec::new(),
                status,
                expected_steps,
                token_ids: Vec::new(),
            });
        entry.blocks.extend_from_slice(&blocks);
        entry.status = status;
        entry.expected_steps = expected_steps;
        entry.token_ids = token_ids;
        blocks
    }

    /// Release reserved blocks; `None` releases every reservation.
    pub fn free_dst_pre_alloc_cache(&mut self, request_id: Option<&str>) {
        match request_id {
            Some(request_id) => {
                if let Some(entry) = self.pre_alloc_cache.remove(request_id) {
                    self.block_manager.free(&entry.blocks);
                }
            }
            None => {
                for (_, entry) in self.pre_alloc_cache.drain() {
                    self.block_manager.free(&entry.blocks);
                }
            }
        }
    }

    /// Atomically adopt a migrated request: install its pre-allocated blocks
    /// and queue it as running or waiting per its pre-migration status.
    pub fn commit_dst_request(&mut self, mut request: GenerationRequest) -> Option<u64> {
        let entry = self.pre_alloc_cache.remove(&request.request_id)?;
        debug_assert!(request.status.is_migrating());
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        request.seq_id = seq_id;
        request.block_table = entry.blocks;
        request.reset_status();
        request.reset_migration_args();
        info!(
            request_id = %request.request_id,
            seq_id,
            num_blocks = request.block_table.len(),
            status = ?request.status,
            "committed migrated request"
        );
        match request.status {
            RequestStatus::Running => self.running.push(request),
            _ => {
                request.status = RequestStatus::Waiting;
                self.waiting.push_back(request);
            }
        }
        Some(seq_id)
    }

    // -- stepping ------------------------------------------------------------

    /// One scheduling step: admit waiting requests while blocks last, then
    /// decode one token for every running request. Outputs of migrating
    /// requests are suppressed.
    pub fn step(
        &mut self,
        generator: &dyn TokenGenerator,
    ) -> floo_common::Result<Vec<(RequestOutput, ServerInfo)>> {
        self.admit_waiting();

        let block_size = self.block_size;
        let mut outputs = Vec::new();
        let mut killed: Vec<String> = Vec::new();

        for request in self.running.iter_mut() {
            if request.status != RequestStatus::Running {
                // Migrating out; the destination owns the stream now.
                continue;
            }
            if request.blocking_migration() {
                // Expected-step budget spent; wait for the handoff.
                continue;
            }
            let token = generator.next_token(request)?;
            request.output_token_ids.push(token);
            if request.total_tokens() > request.block_table.len() * block_size {
                match self.block_manager.allocate(1) {
                    Some(blocks) => request.block_table.extend(blocks),
                    None => {
                        killed.push(request.request_id.clone());
                        continue;
                    }
                }
            }
            if request.output_token_ids.len() >= request.sampling_params.max_tokens {
                request.status = RequestStatus::Finished;
            }
            outputs.push((
                RequestOutput {
                    request_id: request.request_id.clone(),
                    output_token_ids: request.output_token_ids.clone(),
                    finished: request.is_finished(),
                    aborted: false,
                },
                request.server_info.clone(),
            ));
        }

        for request_id in killed {
            if let Some(request) = self.abort_request(&request_id) {
                self.num_killed_requests += 1;
                outputs.push((
                    RequestOutput {
                        request_id: request.request_id.clone(),
                        output_token_ids: request.output_token_ids.clone(),
                        finished: true,
                        aborted: true,
                    },
                    request.server_info.clone(),
                ));
            }
        }

        // Drop finished requests and release their blocks.
        let block_manager = &mut self.block_manager;
        self.running.retain(|request| {
            if request.is_finished() {
                block_manager.free(&request.block_table);
                false
            } else {
                true
            }
        });

        Ok(outputs)
    }

    fn admit_waiting(&mut self) {
        while let Some(front) = self.waiting.front() {
            let required = front.num_required_blocks(self.block_size).max(1);
            if required > self.block_manager.num_total() {
                // Can never fit; surface the kill instead of stalling the queue.
                let mut request = self.waiting.pop_front().unwrap();
                request.status = RequestStatus::Finished;
                self.num_killed_requests += 1;
                request.server_info.deliver(RequestOutput {
                    request_id: request.request_id.clone(),
                    output_token_ids: Vec::new(),
                    finished: true,
                    aborted: true,
                });
                continue;
            }
            // A request adopted from a migration already holds its blocks;
            // allocate only the remainder.
            let needed = required.saturating_sub(front.block_table.len());
            let blocks = if needed > 0 {
                match self.block_manager.allocate(needed) {
                    Some(blocks) => blocks,
                    None => break,
                }
            } else {
                Vec::new()
            };
            let mut request = self.waiting.pop_front().unwrap();
            request.block_table.extend(blocks);
            request.status = RequestStatus::Running;
            request.seq_id = self.next_seq_id;
            self.next_seq_id += 1;
            self.running.push(request);
        }
    }

    // -- snapshots -----------------------------------------------------------

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_manager.num_free()
    }

    pub fn num_total_blocks(&self) -> usize {
        self.block_manager.num_total()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_killed(&self) -> usize {
        self.num_killed_requests
    }

    pub fn kv_usage_ratio(&self) -> f64 {
        let total = self.block_manager.num_total();
        if total == 0 {
            return 0.0;
        }
        1.0 - self.block_manager.num_free() as f64 / total as f64
    }

    pub fn inference_type(&self) -> InferenceType {
        let active: Vec<_> = self
            .running
            .iter()
            .filter(|r| r.status == RequestStatus::Running)
            .collect();
        if active.is_empty() {
            return InferenceType::Idle;
        }
        let prefilling = active.iter().filter(|r| r.output_token_ids.is_empty()).count();
        if prefilling == active.len() {
            InferenceType::Prefill
        } else if prefilling == 0 {
            InferenceType::Decode
        } else {
            InferenceType::Mixed
        }
    }

    pub fn first_waiting(&self) -> Option<&GenerationRequest> {
        self.waiting.front()
    }

    /// Running requests whose expected-step budget is spent and which wait
    /// on a prefill-to-decode handoff.
    pub fn num_blocking(&self) -> usize {
        self.running
            .iter()
            .filter(|r| r.status == RequestStatus::Running && r.blocking_migration())
            .count()
    }

    /// Check the block-disjointness invariant; used by tests.
    pub fn block_accounting_is_disjoint(&self) -> bool {
        let mut seen: HashSet<usize> = HashSet::new();
        let held = self
            .running
            .iter()
            .chain(self.waiting.iter())
            .chain(self.migrating_out_last_stage.iter())
            .flat_map(|r| r.block_table.iter().copied())
            .chain(
                self.pre_alloc_cache
                    .values()
                    .flat_map(|e| e.blocks.iter().copied()),
            );
        for block in held {
            if block >= self.block_manager.num_total() || !seen.insert(block) {
                return false;
            }
        }
        // Held blocks must not also be on the free list.
        self.block_manager
            .free_blocks
            .iter()
            .all(|b| !seen.contains(b))
    }

    /// Token ids reserved for a migrating-in request, for commit assembly.
    pub fn pre_alloc_token_ids(&self, request_id: &str) -> Option<(Vec<u32>, RequestStatus, i64)> {
        self.pre_alloc_cache
            .get(request_id)
            .map(|e| (e.token_ids.clone(), e.status, e.expected_steps))
    }
}

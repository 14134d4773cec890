//! Generation requests, sampling parameters, and token outputs

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use floo_common::RequestStatus;

/// Sampling parameters attached to a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 16,
        }
    }
}

/// Identifies the API server a request arrived through, together with the
/// queue its outputs are delivered to.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_id: String,
    output_tx: mpsc::UnboundedSender<RequestOutput>,
}

impl ServerInfo {
    /// Create a server handle and the receiving end of its output queue.
    pub fn new(server_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<RequestOutput>) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        (
            Self {
                server_id: server_id.into(),
                output_tx,
            },
            output_rx,
        )
    }

    /// Push one output onto the server's queue. Errors (client gone) are
    /// dropped; the client has already disconnected.
    pub fn deliver(&self, output: RequestOutput) {
        let _ = self.output_tx.send(output);
    }
}

/// One step's output for one request, as observed by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestOutput {
    pub request_id: String,
    /// All output tokens produced so far, in position order
    pub output_token_ids: Vec<u32>,
    pub finished: bool,
    pub aborted: bool,
}

/// Worker-side per-request metadata, carried with the final migration stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeqGroupMetadata {
    pub request_id: String,
    pub seq_id: u64,
    pub num_prompt_tokens: usize,
    pub num_output_tokens: usize,
    pub sampling_params: SamplingParams,
}

/// A token-generation request owned by exactly one instance scheduler.
///
/// During migration the request transiently also appears in the source's
/// migrating-out last-stage list and the destination's pre-alloc map.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub server_info: ServerInfo,
    pub sampling_params: SamplingParams,
    /// Steps this request is expected to run on its current instance before
    /// handoff; negative means unbounded.
    pub expected_steps: i64,
    pub status: RequestStatus,
    pub prompt_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
    /// Ordered block indices into the owning instance's pool
    pub block_table: Vec<usize>,
    /// Engine-internal sequence id, reassigned when a destination adopts the
    /// request
    pub seq_id: u64,
    pub arrival_time: Instant,
    pub num_migrations: u32,
}

impl GenerationRequest {
    pub fn new(
        request_id: impl Into<String>,
        server_info: ServerInfo,
        expected_steps: i64,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            server_info,
            sampling_params,
            expected_steps,
            status: RequestStatus::Waiting,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            block_table: Vec::new(),
            seq_id: 0,
            arrival_time: Instant::now(),
            num_migrations: 0,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn is_finished(&self) -> bool {
        self.status == RequestStatus::Finished
    }

    /// The expected-step budget is spent; the request must migrate before it
    /// can produce further tokens.
    pub fn blocking_migration(&self) -> bool {
        self.expected_steps >= 0 && self.output_token_ids.len() as i64 >= self.expected_steps
    }

    /// Mark the request as being migrated out.
    pub fn set_migrating(&mut self) {
        self.status = self.status.migrating_status();
    }

    /// Return a migrating request to its base status.
    pub fn reset_status(&mut self) {
        self.status = self.status.base_status();
    }

    /// Clear migration-specific state after adoption by a destination.
    pub fn reset_migration_args(&mut self) {
        self.expected_steps = -1;
        self.num_migrations += 1;
    }

    /// Blocks this request's tokens occupy given the instance's block size.
    pub fn num_required_blocks(&self, block_size: usize) -> usize {
        self.total_tokens().div_ceil(block_size)
    }

    pub fn metadata(&self, seq_id: u64) -> SeqGroupMetadata {
        SeqGroupMetadata {
            request_id: self.request_id.clone(),
            seq_id,
            num_prompt_tokens: self.prompt_token_ids.len(),
            num_output_tokens: self.output_token_ids.len(),
            sampling_params: self.sampling_params.clone(),
        }
    }
}

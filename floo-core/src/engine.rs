//! Instance Engine
//!
//! Drives the per-instance step loop:
//! - drains the step-boundary removal queue between steps, the only safe way
//!   to pull a running request mid-flight
//! - publishes an `InstanceInfo` snapshot after every step
//! - hands outputs to a background delivery task that batches them by server
//!
//! State machine: INIT -> RUNNING -> {STOPPED, CRASHED}. Any uncaught step
//! error shuts the workers down and leaves the engine CRASHED.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{error, info};

use floo_common::{EngineState, GpuMetrics, InstanceInfo, InstanceType};

use crate::constants::NO_OUTPUTS_STEP_INTERVAL;
use crate::request::{GenerationRequest, RequestOutput, ServerInfo};
use crate::scheduler::{InstanceScheduler, TokenGenerator};
use crate::worker::MigrationWorker;

type RemovalRequest = (String, oneshot::Sender<Option<GenerationRequest>>);

pub struct InstanceEngine {
    instance_id: String,
    instance_type: InstanceType,
    state: std::sync::Mutex<EngineState>,
    scheduler: Arc<AsyncMutex<InstanceScheduler>>,
    workers: Vec<Arc<MigrationWorker>>,
    generator: Arc<dyn TokenGenerator>,
    remove_tx: mpsc::UnboundedSender<RemovalRequest>,
    remove_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RemovalRequest>>>,
    output_tx: mpsc::UnboundedSender<Vec<(RequestOutput, ServerInfo)>>,
    info_tx: watch::Sender<InstanceInfo>,
    stop_flag: AtomicBool,
    step_counter: AtomicU64,
}

impl InstanceEngine {
    pub fn new(
        instance_id: impl Into<String>,
        instance_type: InstanceType,
        scheduler: Arc<AsyncMutex<InstanceScheduler>>,
        workers: Vec<Arc<MigrationWorker>>,
        generator: Arc<dyn TokenGenerator>,
    ) -> Arc<Self> {
        let instance_id = instance_id.into();
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (info_tx, _) = watch::channel(InstanceInfo::new(&instance_id, instance_type));

        let engine = Arc::new(Self {
            instance_id,
            instance_type,
            state: std::sync::Mutex::new(EngineState::Init),
            scheduler,
            workers,
            generator,
            remove_tx,
            remove_rx: std::sync::Mutex::new(Some(remove_rx)),
            output_tx,
            info_tx,
            stop_flag: AtomicBool::new(false),
            step_counter: AtomicU64::new(0),
        });
        tokio::spawn(Self::output_delivery_loop(output_rx));
        engine
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock().unwrap();
        info!(
            instance_id = %self.instance_id,
            from = %*state,
            to = %next,
            "engine state change"
        );
        *state = next;
    }

    /// Latest per-step snapshot; the receiver updates after every step.
    pub fn subscribe_info(&self) -> watch::Receiver<InstanceInfo> {
        self.info_tx.subscribe()
    }

    pub fn latest_info(&self) -> InstanceInfo {
        self.info_tx.borrow().clone()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Remove a running request at the next step boundary. Resolves with the
    /// removed request, or `None` if it was not running anymore.
    pub async fn remove_running_request(&self, request_id: &str) -> Option<GenerationRequest> {
        let (tx, rx) = oneshot::channel();
        if self.remove_tx.send((request_id.to_string(), tx)).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Spawn the step loop. Idempotent: later calls find the removal
    /// receiver taken and return.
    pub fn start_engine_step_loop(self: &Arc<Self>) {
        let Some(remove_rx) = self.remove_rx.lock().unwrap().take() else {
            return;
        };
        let engine = self.clone();
        tokio::spawn(engine.engine_step_loop(remove_rx));
    }

    async fn engine_step_loop(
        self: Arc<Self>,
        mut remove_rx: mpsc::UnboundedReceiver<RemovalRequest>,
    ) {
        self.set_state(EngineState::Running);

        while !self.stop_flag.load(Ordering::SeqCst) {
            // Removal events interpose between steps, never inside one.
            while let Ok((request_id, done_tx)) = remove_rx.try_recv() {
                let removed = self
                    .scheduler
                    .lock()
                    .await
                    .remove_running_request(&request_id);
                let _ = done_tx.send(removed);
            }
            tokio::task::yield_now().await;

            match self.step().await {
                Ok(outputs) => {
                    if outputs.is_empty() {
                        tokio::time::sleep(NO_OUTPUTS_STEP_INTERVAL).await;
                    } else {
                        let _ = self.output_tx.send(outputs);
                    }
                }
                Err(e) => {
                    error!(
                        instance_id = %self.instance_id,
                        error = %e,
                        "error in engine step loop"
                    );
                    for worker in &self.workers {
                        worker.shutdown().await;
                    }
                    self.set_state(EngineState::Crashed);
                    return;
                }
            }
        }

        if self.state() == EngineState::Running {
            self.set_state(EngineState::Stopped);
        }
    }

    async fn step(&self) -> floo_common::Result<Vec<(RequestOutput, ServerInfo)>> {
        let mut scheduler = self.scheduler.lock().await;
        let outputs = scheduler.step(self.generator.as_ref())?;

        // Keep worker-side metadata in sync with the running set; migrated
        // and finished requests are handled by their own paths.
        for request in scheduler.running_requests() {
            if request.status == floo_common::RequestStatus::Running {
                let metadata = request.metadata(request.seq_id);
                for worker in &self.workers {
                    worker.cache_seq_group_metadata(metadata.clone());
                }
            }
        }
        for (output, _) in &outputs {
            if output.finished {
                for worker in &self.workers {
                    worker.drop_seq_group_metadata(&output.request_id);
                }
            }
        }

        let step_id = self.step_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let info = self.build_instance_info(&scheduler, step_id);
        drop(scheduler);
        let _ = self.info_tx.send(info);

        Ok(outputs)
    }

    fn build_instance_info(&self, scheduler: &InstanceScheduler, step_id: u64) -> InstanceInfo {
        let num_running = scheduler.num_running();
        let num_waiting = scheduler.num_waiting();
        let kv_usage_ratio = scheduler.kv_usage_ratio();
        InstanceInfo {
            instance_id: self.instance_id.clone(),
            step_id,
            timestamp: chrono::Utc::now(),
            instance_type: self.instance_type,
            inference_type: scheduler.inference_type(),
            num_running_requests: num_running,
            num_waiting_requests: num_waiting,
            num_killed_requests: scheduler.num_killed(),
            num_blocking_requests: scheduler.num_blocking(),
            num_free_blocks: scheduler.num_free_blocks(),
            num_total_blocks: scheduler.num_total_blocks(),
            kv_usage_ratio,
            num_blocks_last_running_request: scheduler
                .running_requests()
                .last()
                .map(|r| r.block_table.len())
                .unwrap_or(0),
            num_blocks_first_waiting_request: scheduler
                .first_waiting()
                .map(|r| r.num_required_blocks(scheduler.block_size()))
                .unwrap_or(0),
            expected_steps_first_waiting: scheduler.first_waiting().map(|r| r.expected_steps),
            dispatch_load_metric: num_waiting as f64 + num_running as f64 * kv_usage_ratio,
            migration_load_metric: kv_usage_ratio,
            gpu_metrics: GpuMetrics::default(),
        }
    }

    /// Batch outputs by server id and push them onto each server's queue.
    async fn output_delivery_loop(
        mut output_rx: mpsc::UnboundedReceiver<Vec<(RequestOutput, ServerInfo)>>,
    ) {
        while let Some(outputs) = output_rx.recv().await {
            let mut by_server: HashMap<String, (ServerInfo, Vec<RequestOutput>)> = HashMap::new();
            for (output, server_info) in outputs {
                by_server
                    .entry(server_info.server_id.clone())
                    .or_insert_with(|| (server_info, Vec::new()))
                    .1
                    .push(output);
            }
            for (_, (server_info, batch)) in by_server {
                for output in batch {
                    server_info.deliver(output);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KvCacheSpec;
    use crate::request::SamplingParams;
    use crate::scheduler::DeterministicTokenGenerator;

    struct FailingTokenGenerator;

    impl TokenGenerator for FailingTokenGenerator {
        fn next_token(&self, _request: &GenerationRequest) -> floo_common::Result<u32> {
            Err(floo_common::Error::System("forward pass failed".to_string()))
        }
    }

    fn spec() -> KvCacheSpec {
        KvCacheSpec {
            block_size: 4,
            num_kv_heads: 2,
            head_size: 2,
            num_layers: 1,
            num_gpu_blocks: 16,
        }
    }

    fn engine_with_generator(generator: Arc<dyn TokenGenerator>) -> Arc<InstanceEngine> {
        let scheduler = Arc::new(AsyncMutex::new(InstanceScheduler::new(&spec(), 2)));
        InstanceEngine::new(
            "instance-1",
            InstanceType::Neutral,
            scheduler,
            Vec::new(),
            generator,
        )
    }

    async fn submit(
        engine: &InstanceEngine,
        request_id: &str,
        max_tokens: usize,
    ) -> mpsc::UnboundedReceiver<RequestOutput> {
        let (server_info, rx) = ServerInfo::new("server-1");
        let request = GenerationRequest::new(
            request_id,
            server_info,
            -1,
            vec![1, 2],
            SamplingParams {
                max_tokens,
                ..SamplingParams::default()
            },
        );
        engine.scheduler.lock().await.add_waiting_request(request);
        rx
    }

    #[tokio::test]
    async fn test_engine_runs_request_to_completion() {
        let engine = engine_with_generator(Arc::new(DeterministicTokenGenerator));
        let mut rx = submit(&engine, "req-1", 3).await;
        engine.start_engine_step_loop();

        let mut last = None;
        while let Some(output) = rx.recv().await {
            let finished = output.finished;
            last = Some(output);
            if finished {
                break;
            }
        }
        let last = last.unwrap();
        assert_eq!(last.output_token_ids.len(), 3);
        assert!(last.finished);

        engine.stop();
    }

    #[tokio::test]
    async fn test_outputs_are_prefix_extending() {
        let engine = engine_with_generator(Arc::new(DeterministicTokenGenerator));
        let mut rx = submit(&engine, "req-1", 5).await;
        engine.start_engine_step_loop();

        let mut prev: Vec<u32> = Vec::new();
        while let Some(output) = rx.recv().await {
            assert!(output.output_token_ids.starts_with(&prev));
            assert_eq!(output.output_token_ids.len(), prev.len() + 1);
            prev = output.output_token_ids;
            if prev.len() == 5 {
                break;
            }
        }
        engine.stop();
    }

    #[tokio::test]
    async fn test_step_error_crashes_engine() {
        let engine = engine_with_generator(Arc::new(FailingTokenGenerator));
        let _rx = submit(&engine, "req-1", 3).await;
        engine.start_engine_step_loop();

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if engine.state() == EngineState::Crashed {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("engine should crash");
    }

    #[tokio::test]
    async fn test_stop_transitions_to_stopped() {
        let engine = engine_with_generator(Arc::new(DeterministicTokenGenerator));
        engine.start_engine_step_loop();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        engine.stop();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if engine.state() == EngineState::Stopped {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("engine should stop");
    }

    #[tokio::test]
    async fn test_remove_running_request_at_step_boundary() {
        let engine = engine_with_generator(Arc::new(DeterministicTokenGenerator));
        let _rx = submit(&engine, "req-1", 1000).await;
        engine.start_engine_step_loop();

        // Wait until the request is running.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let removed = engine.remove_running_request("req-1").await;
        assert!(removed.is_some());
        assert_eq!(engine.scheduler.lock().await.num_running(), 0);

        // Second removal finds nothing; the call is idempotent.
        let removed = engine.remove_running_request("req-1").await;
        assert!(removed.is_none());
        engine.stop();
    }

    #[tokio::test]
    async fn test_instance_info_published_per_step() {
        let engine = engine_with_generator(Arc::new(DeterministicTokenGenerator));
        let mut info_rx = engine.subscribe_info();
        let _rx = submit(&engine, "req-1", 4).await;
        engine.start_engine_step_loop();

        info_rx.changed().await.unwrap();
        let info = info_rx.borrow().clone();
        assert_eq!(info.instance_id, "instance-1");
        assert!(info.step_id >= 1);
        assert_eq!(info.num_total_blocks, 16);
        engine.stop();
    }
}

//! Migration Driver
//!
//! Drives one outbound migration for a `(source, destination, request)`
//! triple: pick the candidate, stream its block deltas stage by stage while
//! the source keeps generating, pull the request off the running queue at a
//! step boundary, ship the final delta together with the worker metadata,
//! commit on the destination, and free on the source.
//!
//! Aborts are classified: transport failures and pre-alloc refusals are
//! soft (the request stays on the source), a dead peer propagates so the
//! manager can scale the peer down.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use floo_common::{Error, RequestStatus, Result};

use crate::instance::{Instance, InstanceHandle};
use crate::worker::TransferPlan;

/// Stages of one request migration, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    Selecting,
    Staging(u32),
    LastStage,
    Committing,
    Done,
    Aborted,
}

enum Outcome {
    Migrated,
    Aborted(&'static str),
}

/// Migrate the most block-heavy eligible running request from `src` to
/// `dst`. Returns the migrated request ids; empty when there was no
/// candidate or the migration aborted softly.
pub async fn migrate_out(src: &Arc<Instance>, dst: &InstanceHandle) -> Result<Vec<String>> {
    let candidate = {
        let scheduler = src.scheduler().lock().await;
        scheduler
            .running_requests()
            .iter()
            .filter(|r| r.status == RequestStatus::Running && !r.is_finished())
            .max_by_key(|r| r.block_table.len())
            .map(|r| (r.request_id.clone(), r.arrival_time, r.expected_steps))
    };
    let Some((request_id, arrival_time, expected_steps)) = candidate else {
        debug!(
            src = %src.instance_id(),
            dst = %dst.instance_id,
            stage = ?MigrationStage::Selecting,
            "no eligible running request to migrate"
        );
        return Ok(Vec::new());
    };

    // Width mismatch is rejected before any state is touched.
    let dst_tp = dst.get_world_size().await?;
    TransferPlan::new(src.get_world_size(), dst_tp)?;

    let mut driver = MigrateOutDriver {
        src,
        dst,
        request_id: request_id.clone(),
        arrival_time,
        expected_steps,
        stage_num_blocks: 0,
        in_last_stage_list: false,
    };
    match driver.run().await {
        Ok(Outcome::Migrated) => Ok(vec![request_id]),
        Ok(Outcome::Aborted(reason)) => {
            info!(
                src = %src.instance_id(),
                dst = %dst.instance_id,
                request_id = %request_id,
                reason,
                stage = ?MigrationStage::Aborted,
                "migration aborted"
            );
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

struct MigrateOutDriver<'a> {
    src: &'a Arc<Instance>,
    dst: &'a InstanceHandle,
    request_id: String,
    arrival_time: Instant,
    expected_steps: i64,
    /// Blocks already shipped in earlier stages
    stage_num_blocks: usize,
    /// Whether the request has been moved to the last-stage list
    in_last_stage_list: bool,
}

impl MigrateOutDriver<'_> {
    async fn run(&mut self) -> Result<Outcome> {
        // Mark the request as migrating so the source stops emitting its
        // outputs to the client.
        {
            let mut scheduler = self.src.scheduler().lock().await;
            match scheduler.running_request_mut(&self.request_id) {
                Some(request) => request.set_migrating(),
                None => return Ok(Outcome::Aborted("request left the running queue")),
            }
        }

        let mut stage: u32 = 0;
        loop {
            let delta = self
                .src
                .scheduler()
                .lock()
                .await
                .get_request_incremental_blocks(&self.request_id, self.stage_num_blocks);
            let Some((blocks, _tokens, is_last_stage)) = delta else {
                self.abort_src_side(true).await;
                return Ok(Outcome::Aborted("request vanished between stages"));
            };
            if is_last_stage {
                break;
            }

            if self
                .src
                .scheduler()
                .lock()
                .await
                .should_abort_migration(&self.request_id, self.arrival_time)
            {
                self.abort_src_side(true).await;
                return Ok(Outcome::Aborted("request finished mid-migration"));
            }

            stage += 1;
            debug!(
                request_id = %self.request_id,
                stage = ?MigrationStage::Staging(stage),
                num_blocks = blocks.len(),
                "migrating block delta"
            );
            match self.ship_stage(&blocks, false).await? {
                StageResult::Shipped => {}
                StageResult::DstFull => {
                    self.abort_src_side(true).await;
                    return Ok(Outcome::Aborted("destination cannot reserve blocks"));
                }
                StageResult::TransportFailed => {
                    self.abort_src_side(true).await;
                    return Ok(Outcome::Aborted("block transfer failed"));
                }
            }
            self.stage_num_blocks += blocks.len();
            tokio::task::yield_now().await;
        }

        // Take the request off the running queue at a step boundary; from
        // here the source produces no further tokens for it.
        let removed = self.src.engine().remove_running_request(&self.request_id).await;
        let request = match removed {
            Some(request) if !request.is_finished() => request,
            Some(request) => {
                // Finished right at the boundary; its stream already closed.
                self.src.scheduler().lock().await.free_src_request(&request);
                self.abort_dst_side().await;
                return Ok(Outcome::Aborted("request finished before last stage"));
            }
            None => {
                self.abort_dst_side().await;
                return Ok(Outcome::Aborted("request finished before last stage"));
            }
        };

        self.src
            .scheduler()
            .lock()
            .await
            .add_migrating_out_request_last_stage(request.clone());
        self.in_last_stage_list = true;

        // Steps may have run since the previous stage; recompute the
        // residual delta.
        let delta = self
            .src
            .scheduler()
            .lock()
            .await
            .get_request_incremental_blocks(&self.request_id, self.stage_num_blocks);
        let Some((blocks, _tokens, _)) = delta else {
            self.abort_src_side(true).await;
            return Ok(Outcome::Aborted("request vanished before last stage"));
        };

        debug!(
            request_id = %self.request_id,
            stage = ?MigrationStage::LastStage,
            num_blocks = blocks.len(),
            "shipping final delta with worker metadata"
        );
        match self.ship_stage(&blocks, true).await? {
            StageResult::Shipped => {}
            StageResult::DstFull => {
                self.abort_src_side(true).await;
                return Ok(Outcome::Aborted("destination cannot reserve blocks"));
            }
            StageResult::TransportFailed => {
                self.abort_src_side(true).await;
                return Ok(Outcome::Aborted("block transfer failed"));
            }
        }

        debug!(
            request_id = %self.request_id,
            stage = ?MigrationStage::Committing,
            "committing on destination"
        );
        if let Err(e) = self.dst.commit_dst_request(request).await {
            warn!(
                request_id = %self.request_id,
                error = %e,
                "destination commit failed"
            );
            self.abort_src_side(true).await;
            if matches!(e, Error::RemoteDead(_)) {
                return Err(e);
            }
            return Ok(Outcome::Aborted("destination commit failed"));
        }

        // The destination owns the request now; release the source copy.
        // Outbound metadata is dropped only here, after the commit ack.
        {
            let mut scheduler = self.src.scheduler().lock().await;
            if let Some(popped) =
                scheduler.pop_migrating_out_request_last_stage(&self.request_id)
            {
                scheduler.free_src_request(&popped);
            }
        }
        for worker in self.src.workers() {
            worker.pop_migrating_out_seq_group_metadata(&self.request_id);
        }

        info!(
            src = %self.src.instance_id(),
            dst = %self.dst.instance_id,
            request_id = %self.request_id,
            total_blocks = self.stage_num_blocks,
            stage = ?MigrationStage::Done,
            "migration done"
        );
        Ok(Outcome::Migrated)
    }

    /// Reserve matching destination blocks and ship one delta.
    async fn ship_stage(&mut self, blocks: &[usize], is_last_stage: bool) -> Result<StageResult> {
        let token_ids = self
            .src
            .scheduler()
            .lock()
            .await
            .full_token_ids(&self.request_id)
            .unwrap_or_default();

        let dst_blocks = match self
            .dst
            .pre_alloc(
                &self.request_id,
                RequestStatus::RunningMigrating,
                self.expected_steps,
                blocks.len(),
                token_ids,
            )
            .await
        {
            Ok(dst_blocks) => dst_blocks,
            Err(e) => {
                // Destination is gone; clean our side and let the manager
                // deal with the peer.
                self.abort_src_side(true).await;
                return Err(e);
            }
        };
        if dst_blocks.is_empty() && !blocks.is_empty() {
            return Ok(StageResult::DstFull);
        }

        match self
            .src
            .send_blocks(self.dst, blocks, &dst_blocks, &self.request_id, is_last_stage)
            .await
        {
            Ok(()) => {
                if is_last_stage {
                    self.stage_num_blocks += blocks.len();
                }
                Ok(StageResult::Shipped)
            }
            Err(Error::Transport(reason)) => {
                warn!(request_id = %self.request_id, reason, "stage transfer failed");
                Ok(StageResult::TransportFailed)
            }
            Err(e) => {
                self.abort_src_side(true).await;
                Err(e)
            }
        }
    }

    /// Reinstate the request on the source and restore staged metadata.
    async fn abort_src_side(&mut self, free_dst: bool) {
        {
            let mut scheduler = self.src.scheduler().lock().await;
            if self.in_last_stage_list {
                if let Some(mut request) =
                    scheduler.pop_migrating_out_request_last_stage(&self.request_id)
                {
                    request.reset_status();
                    match request.status {
                        RequestStatus::Running => scheduler.add_running_request(request),
                        _ => scheduler.add_waiting_request(request),
                    }
                }
            } else if let Some(request) = scheduler.running_request_mut(&self.request_id) {
                request.reset_status();
            }
        }
        for worker in self.src.workers() {
            worker.restore_migrating_out_seq_group_metadata();
        }
        if free_dst {
            let _ = self.dst.free_dst_pre_alloc_cache(Some(&self.request_id)).await;
        }
    }

    /// Free destination reservations only; the source request completed on
    /// its own and needs no reinstating.
    async fn abort_dst_side(&self) {
        let _ = self.dst.free_dst_pre_alloc_cache(Some(&self.request_id)).await;
    }

}

enum StageResult {
    Shipped,
    DstFull,
    TransportFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KvCacheSpec;
    use crate::config::FlooConfig;
    use crate::instance::InstanceHandle;
    use crate::request::{SamplingParams, ServerInfo};
    use crate::scheduler::DeterministicTokenGenerator;
    use crate::transport::CollectiveRegistry;
    use floo_common::InstanceType;
    use tokio::sync::mpsc;

    fn config(num_gpu_blocks: usize, buffer_blocks: usize) -> FlooConfig {
        let mut config = FlooConfig::default();
        config.cache = KvCacheSpec {
            block_size: 2,
            num_kv_heads: 2,
            head_size: 2,
            num_layers: 2,
            num_gpu_blocks,
        };
        config.migration.migration_buffer_blocks = buffer_blocks;
        config.migration.migration_last_stage_max_blocks = 2;
        config
    }

    async fn instance_pair(
        config: &FlooConfig,
    ) -> (Arc<Instance>, Arc<Instance>, InstanceHandle) {
        let registry = CollectiveRegistry::new();
        let generator: Arc<dyn crate::scheduler::TokenGenerator> =
            Arc::new(DeterministicTokenGenerator);
        let src = Instance::new(
            "instance-src",
            InstanceType::Neutral,
            config,
            1,
            registry.clone(),
            generator.clone(),
        )
        .unwrap();
        let dst = Instance::new(
            "instance-dst",
            InstanceType::Neutral,
            config,
            1,
            registry,
            generator,
        )
        .unwrap();
        let dst_handle = InstanceHandle::new(dst.clone());
        (src, dst, dst_handle)
    }

    async fn submit_and_run(
        src: &Arc<Instance>,
        request_id: &str,
        prompt_len: usize,
        steps: usize,
    ) -> mpsc::UnboundedReceiver<crate::request::RequestOutput> {
        let (server_info, rx) = ServerInfo::new("server-1");
        src.generate(
            request_id,
            server_info,
            -1,
            (0..prompt_len as u32).collect(),
            SamplingParams {
                max_tokens: 1000,
                ..SamplingParams::default()
            },
        )
        .await;
        let generator = DeterministicTokenGenerator;
        let mut scheduler = src.scheduler().lock().await;
        for _ in 0..steps {
            scheduler.step(&generator).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_migrate_out_no_candidate() {
        let config = config(16, 4);
        let (src, _dst, dst_handle) = instance_pair(&config).await;
        let migrated = migrate_out(&src, &dst_handle).await.unwrap();
        assert!(migrated.is_empty());
    }

    #[tokio::test]
    async fn test_migrate_out_moves_request_and_blocks() {
        let config = config(32, 2);
        let (src, dst, dst_handle) = instance_pair(&config).await;
        // 10 prompt tokens over 2-token blocks: 5 blocks, plus decode growth.
        let _rx = submit_and_run(&src, "req-1", 10, 3).await;
        src.start();
        dst.start();

        let src_blocks_before = {
            let scheduler = src.scheduler().lock().await;
            scheduler.running_requests()[0].block_table.clone()
        };
        // Give the source blocks recognizable content.
        {
            let store = src.workers()[0].store();
            let mut store = store.lock().await;
            for &block in &src_blocks_before {
                store.fill_block(block, block as u64 + 500);
            }
        }

        let migrated = migrate_out(&src, &dst_handle).await.unwrap();
        assert_eq!(migrated, vec!["req-1".to_string()]);

        // Source no longer tracks the request, destination runs it.
        assert!(src
            .scheduler()
            .lock()
            .await
            .get_all_request_ids()
            .is_empty());
        let dst_scheduler = dst.scheduler().lock().await;
        assert_eq!(dst_scheduler.num_running(), 1);
        assert!(dst_scheduler.block_accounting_is_disjoint());
        drop(dst_scheduler);

        // All source blocks were freed.
        let src_scheduler = src.scheduler().lock().await;
        assert_eq!(src_scheduler.num_free_blocks(), 32);
        assert!(src_scheduler.block_accounting_is_disjoint());
    }

    #[tokio::test]
    async fn test_migrated_content_matches() {
        let config = config(32, 2);
        let (src, dst, dst_handle) = instance_pair(&config).await;
        let _rx = submit_and_run(&src, "req-1", 8, 2).await;
        src.start();
        dst.start();

        let src_blocks = {
            let scheduler = src.scheduler().lock().await;
            scheduler.running_requests()[0].block_table.clone()
        };
        {
            let store = src.workers()[0].store();
            let mut store = store.lock().await;
            for &block in &src_blocks {
                store.fill_block(block, block as u64 + 900);
            }
        }
        let expected: Vec<Vec<f32>> = {
            let store = src.workers()[0].store();
            let store = store.lock().await;
            src_blocks
                .iter()
                .map(|&b| store.block_data(b).unwrap().to_vec())
                .collect()
        };

        migrate_out(&src, &dst_handle).await.unwrap();

        let dst_blocks = {
            let scheduler = dst.scheduler().lock().await;
            scheduler.running_requests()[0].block_table.clone()
        };
        // Content must match block for block, in table order. Decode steps
        // that ran between stages may have appended new (unfilled) blocks,
        // so compare the prefix that carried data.
        let store = dst.workers()[0].store();
        let store = store.lock().await;
        for (expected_data, &dst_block) in expected.iter().zip(dst_blocks.iter()) {
            assert_eq!(store.block_data(dst_block).unwrap(), expected_data.as_slice());
        }
    }

    #[tokio::test]
    async fn test_migrate_aborts_when_destination_full() {
        // Destination pool too small for the source request.
        let config_src = config(32, 2);
        let mut config_dst = config_src.clone();
        config_dst.cache.num_gpu_blocks = 2;

        let registry = CollectiveRegistry::new();
        let generator: Arc<dyn crate::scheduler::TokenGenerator> =
            Arc::new(DeterministicTokenGenerator);
        let src = Instance::new(
            "instance-src",
            InstanceType::Neutral,
            &config_src,
            1,
            registry.clone(),
            generator.clone(),
        )
        .unwrap();
        let dst = Instance::new(
            "instance-dst",
            InstanceType::Neutral,
            &config_dst,
            1,
            registry,
            generator,
        )
        .unwrap();
        let dst_handle = InstanceHandle::new(dst.clone());
        let _rx = submit_and_run(&src, "req-1", 20, 2).await;
        src.start();

        let migrated = migrate_out(&src, &dst_handle).await.unwrap();
        assert!(migrated.is_empty());

        // Request stays on the source, back in plain running state.
        let scheduler = src.scheduler().lock().await;
        assert_eq!(scheduler.num_running(), 1);
        assert_eq!(
            scheduler.running_requests()[0].status,
            RequestStatus::Running
        );
        drop(scheduler);

        // Destination reservations were rolled back.
        let dst_scheduler = dst.scheduler().lock().await;
        assert_eq!(dst_scheduler.num_free_blocks(), 2);
        assert!(dst_scheduler.block_accounting_is_disjoint());
    }

    #[tokio::test]
    async fn test_migrate_to_dead_destination_propagates() {
        let config = config(32, 2);
        let (src, _dst, dst_handle) = instance_pair(&config).await;
        let _rx = submit_and_run(&src, "req-1", 10, 2).await;
        src.start();
        dst_handle.kill().await;

        let err = migrate_out(&src, &dst_handle).await.unwrap_err();
        assert!(matches!(err, Error::RemoteDead(_)));

        // Source request survives, reset to running.
        let scheduler = src.scheduler().lock().await;
        assert_eq!(scheduler.num_running(), 1);
        assert_eq!(
            scheduler.running_requests()[0].status,
            RequestStatus::Running
        );
    }

    #[tokio::test]
    async fn test_source_worker_death_mid_migration() {
        // Workers die while the instance façade is still reachable; the
        // stage send surfaces RemoteDead for the manager to arbitrate.
        let config = config(32, 2);
        let (src, dst, dst_handle) = instance_pair(&config).await;
        let _rx = submit_and_run(&src, "req-1", 10, 2).await;
        src.start();
        for worker in src.workers() {
            worker
                .alive_flag()
                .store(false, std::sync::atomic::Ordering::SeqCst);
        }

        let err = migrate_out(&src, &dst_handle).await.unwrap_err();
        assert!(matches!(err, Error::RemoteDead(_)));

        // Destination-side cleanup, as the manager would run it.
        dst_handle.clear_migration_states(true).await.unwrap();
        let dst_scheduler = dst.scheduler().lock().await;
        assert_eq!(dst_scheduler.num_free_blocks(), 32);
        assert!(dst_scheduler.block_accounting_is_disjoint());
    }

    async fn tp_instance_pair(
        src_tp: usize,
        dst_tp: usize,
        num_kv_heads: usize,
    ) -> (Arc<Instance>, Arc<Instance>, InstanceHandle) {
        let mut config = config(32, 4);
        config.cache.num_kv_heads = num_kv_heads;
        let registry = CollectiveRegistry::new();
        let generator: Arc<dyn crate::scheduler::TokenGenerator> =
            Arc::new(DeterministicTokenGenerator);
        let src = Instance::new(
            "instance-src",
            InstanceType::Neutral,
            &config,
            src_tp,
            registry.clone(),
            generator.clone(),
        )
        .unwrap();
        let dst = Instance::new(
            "instance-dst",
            InstanceType::Neutral,
            &config,
            dst_tp,
            registry,
            generator,
        )
        .unwrap();
        let dst_handle = InstanceHandle::new(dst.clone());
        (src, dst, dst_handle)
    }

    async fn fill_and_snapshot(
        src: &Arc<Instance>,
        blocks: &[usize],
    ) -> Vec<Vec<Vec<f32>>> {
        // Per source worker, per block: the worker's slice of the content.
        let mut snapshot = Vec::new();
        for worker in src.workers() {
            let store = worker.store();
            let mut store = store.lock().await;
            for &block in blocks {
                store.fill_block(block, (worker.local_rank() * 1000 + block) as u64);
            }
            snapshot.push(
                blocks
                    .iter()
                    .map(|&b| store.block_data(b).unwrap().to_vec())
                    .collect(),
            );
        }
        snapshot
    }

    #[tokio::test]
    async fn test_add_tp_instance_migration() {
        // tp=2 source fans out to a tp=4 destination: each source worker
        // feeds two destination workers, which each keep half of its heads.
        let (src, dst, dst_handle) = tp_instance_pair(2, 4, 4).await;
        let _rx = submit_and_run(&src, "req-1", 8, 1).await;
        src.start();
        dst.start();

        let src_blocks = {
            let scheduler = src.scheduler().lock().await;
            scheduler.running_requests()[0].block_table.clone()
        };
        let _ = fill_and_snapshot(&src, &src_blocks).await;
        let expected: Vec<Vec<Vec<f32>>> = {
            // Destination worker 2w + r holds head slice r of source worker w.
            let mut expected = Vec::new();
            for worker in src.workers() {
                let store = worker.store();
                let store = store.lock().await;
                for rank in 0..2 {
                    expected.push(
                        src_blocks
                            .iter()
                            .map(|&b| store.block_head_slice(b, 2, rank))
                            .collect(),
                    );
                }
            }
            expected
        };

        let migrated = migrate_out(&src, &dst_handle).await.unwrap();
        assert_eq!(migrated, vec!["req-1".to_string()]);

        let dst_blocks = {
            let scheduler = dst.scheduler().lock().await;
            scheduler.running_requests()[0].block_table.clone()
        };
        for (dst_worker, expected_blocks) in dst.workers().iter().zip(expected.iter()) {
            let store = dst_worker.store();
            let store = store.lock().await;
            for (expected_data, &dst_block) in expected_blocks.iter().zip(dst_blocks.iter()) {
                assert_eq!(
                    store.block_data(dst_block).unwrap(),
                    expected_data.as_slice()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_subtract_tp_instance_migration() {
        // tp=4 source fans into a tp=2 destination: each destination worker
        // concatenates the head slices of two source workers.
        let (src, dst, dst_handle) = tp_instance_pair(4, 2, 4).await;
        let _rx = submit_and_run(&src, "req-1", 8, 1).await;
        src.start();
        dst.start();

        let src_blocks = {
            let scheduler = src.scheduler().lock().await;
            scheduler.running_requests()[0].block_table.clone()
        };
        let snapshot = fill_and_snapshot(&src, &src_blocks).await;

        let migrated = migrate_out(&src, &dst_handle).await.unwrap();
        assert_eq!(migrated, vec!["req-1".to_string()]);

        let dst_blocks = {
            let scheduler = dst.scheduler().lock().await;
            scheduler.running_requests()[0].block_table.clone()
        };
        // Destination worker d holds sources 2d and 2d+1 concatenated along
        // the heads axis, position by position.
        for (d, dst_worker) in dst.workers().iter().enumerate() {
            let store = dst_worker.store();
            let store = store.lock().await;
            for (i, &dst_block) in dst_blocks.iter().enumerate() {
                if i >= src_blocks.len() {
                    break;
                }
                let got = store.block_data(dst_block).unwrap();
                let left = &snapshot[2 * d][i];
                let right = &snapshot[2 * d + 1][i];
                // Interleave per position: heads of src 2d then src 2d+1.
                let head_elems = 2; // head_size of the test spec
                let heads_per_src = 1; // 4 heads over 4 source workers
                let slice_len = heads_per_src * head_elems;
                let positions = left.len() / slice_len;
                let mut expected = Vec::with_capacity(left.len() + right.len());
                for p in 0..positions {
                    expected
                        .extend_from_slice(&left[p * slice_len..(p + 1) * slice_len]);
                    expected
                        .extend_from_slice(&right[p * slice_len..(p + 1) * slice_len]);
                }
                assert_eq!(got, expected.as_slice());
            }
        }
    }

    #[tokio::test]
    async fn test_output_stream_continues_on_destination() {
        let config = config(32, 2);
        let (src, dst, dst_handle) = instance_pair(&config).await;
        let mut rx = submit_and_run(&src, "req-1", 6, 4).await;
        src.start();

        let tokens_before = {
            let scheduler = src.scheduler().lock().await;
            scheduler.running_requests()[0].output_token_ids.clone()
        };
        migrate_out(&src, &dst_handle).await.unwrap();
        dst.start();

        // Drain the queue; outputs observed after migration must extend the
        // pre-migration stream without gaps or duplicates.
        let mut last: Option<Vec<u32>> = None;
        for _ in 0..200 {
            match rx.try_recv() {
                Ok(output) => last = Some(output.output_token_ids),
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
            if last.as_ref().map(|t| t.len() >= tokens_before.len() + 3) == Some(true) {
                break;
            }
        }
        let last = last.expect("destination should keep producing outputs");
        assert!(last.starts_with(&tokens_before));
        assert!(last.len() > tokens_before.len());
    }
}

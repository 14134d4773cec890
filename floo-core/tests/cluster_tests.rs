//! Cluster Manager Tests
//!
//! End-to-end dispatch, readiness, request-map maintenance, and
//! collective-group rebuild under membership churn.

use std::sync::Arc;
use std::time::Duration;

use floo_common::InstanceType;
use floo_core::cache::KvCacheSpec;
use floo_core::config::{FlooConfig, MigrationBackendKind};
use floo_core::instance::init_instances;
use floo_core::manager::ClusterManager;
use floo_core::request::{SamplingParams, ServerInfo};
use floo_core::scheduler::{DeterministicTokenGenerator, TokenGenerator};
use floo_core::transport::CollectiveRegistry;

fn base_config() -> FlooConfig {
    let mut config = FlooConfig::default();
    config.cache = KvCacheSpec {
        block_size: 16,
        num_kv_heads: 2,
        head_size: 2,
        num_layers: 2,
        num_gpu_blocks: 8,
    };
    config
}

fn generator() -> Arc<dyn TokenGenerator> {
    Arc::new(DeterministicTokenGenerator)
}

fn prompt_tokens(prompt: &str) -> Vec<u32> {
    prompt.bytes().map(u32::from).collect()
}

async fn wait_for_rebuild(manager: &ClusterManager, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.pending_rebuild_instances() != 0 || !manager.migration_enabled() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_single_instance_dispatch() {
    // One instance with 8 free blocks serving four prompts.
    let config = base_config();
    let manager = ClusterManager::new(&config);
    let registry = CollectiveRegistry::new();
    manager
        .init_instances(1, InstanceType::Neutral, &config, 1, &registry, &generator())
        .await
        .unwrap();
    assert!(manager.wait_until_ready().await);

    let prompts = ["Hello", "The president", "The capital", "The future"];
    let sampling_params = SamplingParams {
        temperature: 0.8,
        top_p: 0.95,
        max_tokens: 3,
    };

    let mut receivers = Vec::new();
    for (i, prompt) in prompts.iter().enumerate() {
        let (server_info, rx) = ServerInfo::new("server-1");
        manager
            .generate(
                &format!("req-{}", i),
                server_info,
                prompt_tokens(prompt),
                sampling_params.clone(),
            )
            .await;
        receivers.push(rx);
    }
    assert_eq!(manager.num_tracked_requests().await, 4);

    // All four requests run to completion.
    for mut rx in receivers {
        let mut finished = false;
        while let Ok(Some(output)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            if output.finished {
                assert!(!output.aborted);
                assert_eq!(output.output_token_ids.len(), 3);
                finished = true;
                break;
            }
        }
        assert!(finished, "request did not complete");
    }

    // The authoritative refresh drops the completed requests from the map.
    manager.clear_request_instance().await;
    assert_eq!(manager.num_tracked_requests().await, 0);
}

#[tokio::test]
async fn test_manager_is_ready_once_engines_run() {
    let config = base_config();
    let manager = ClusterManager::new(&config);
    assert!(manager.is_ready().await);

    let registry = CollectiveRegistry::new();
    let (ids, handles) =
        init_instances(2, InstanceType::Neutral, &config, 1, &registry, &generator()).unwrap();
    manager
        .scale_up(
            ids.iter()
                .zip(handles.iter())
                .map(|(id, handle)| (id.clone(), handle.clone(), InstanceType::Neutral))
                .collect(),
        )
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !manager.is_ready().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for readiness"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_generate_waits_for_instance_pool() {
    let config = base_config();
    let manager = ClusterManager::new(&config);

    let (server_info, mut rx) = ServerInfo::new("server-1");
    let dispatch = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .generate(
                    "req-late",
                    server_info,
                    vec![1, 2, 3],
                    SamplingParams {
                        max_tokens: 2,
                        ..SamplingParams::default()
                    },
                )
                .await;
        })
    };

    // The dispatch loop is parked on the empty pool; give it an instance.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let registry = CollectiveRegistry::new();
    let (ids, handles) =
        init_instances(1, InstanceType::Neutral, &config, 1, &registry, &generator()).unwrap();
    manager
        .scale_up(vec![(ids[0].clone(), handles[0].clone(), InstanceType::Neutral)])
        .await;

    dispatch.await.unwrap();
    let output = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let output = rx.recv().await.unwrap();
            if output.finished {
                return output;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(output.output_token_ids.len(), 2);
}

#[tokio::test]
async fn test_collective_rebuild_on_scale_up() {
    let mut config = base_config();
    config.migration.migration_backend = MigrationBackendKind::CollectiveCpu;
    config.migration.migration_backend_init_timeout_secs = 5.0;

    let manager = ClusterManager::new(&config);
    let registry = CollectiveRegistry::new();
    let (ids, handles) =
        init_instances(3, InstanceType::Neutral, &config, 1, &registry, &generator()).unwrap();
    manager
        .scale_up(
            ids.iter()
                .zip(handles.iter())
                .map(|(id, handle)| (id.clone(), handle.clone(), InstanceType::Neutral))
                .collect(),
        )
        .await;

    wait_for_rebuild(&manager, "initial group rebuild").await;
    assert!(manager.migration_enabled());
    assert!(manager.excluded_instances().await.is_empty());

    // Membership churn: a fourth instance joins; a fresh group is built and
    // migration is re-enabled.
    let (new_ids, new_handles) =
        init_instances(1, InstanceType::Neutral, &config, 1, &registry, &generator()).unwrap();
    manager
        .scale_up(vec![(
            new_ids[0].clone(),
            new_handles[0].clone(),
            InstanceType::Neutral,
        )])
        .await;

    wait_for_rebuild(&manager, "rebuild after churn").await;
    assert_eq!(manager.num_instances().await, 4);
    assert!(manager.migration_enabled());
    assert!(manager.excluded_instances().await.is_empty());
}

#[tokio::test]
async fn test_rebuild_is_convergent() {
    let mut config = base_config();
    config.migration.migration_backend = MigrationBackendKind::CollectiveCpu;
    config.migration.migration_backend_init_timeout_secs = 5.0;

    let manager = ClusterManager::new(&config);
    let registry = CollectiveRegistry::new();
    let (ids, handles) =
        init_instances(2, InstanceType::Neutral, &config, 1, &registry, &generator()).unwrap();
    manager
        .scale_up(
            ids.iter()
                .zip(handles.iter())
                .map(|(id, handle)| (id.clone(), handle.clone(), InstanceType::Neutral))
                .collect(),
        )
        .await;

    wait_for_rebuild(&manager, "first rebuild").await;

    // A second rebuild over the same alive set converges immediately and
    // leaves migration enabled.
    manager.rebuild_migration_backend().await;
    assert_eq!(manager.pending_rebuild_instances(), 0);
    assert!(manager.migration_enabled());
}

#[tokio::test]
async fn test_scale_down_to_empty_resets_pending() {
    let mut config = base_config();
    config.migration.migration_backend = MigrationBackendKind::CollectiveCpu;
    config.migration.migration_backend_init_timeout_secs = 5.0;

    let manager = ClusterManager::new(&config);
    let registry = CollectiveRegistry::new();
    let (ids, handles) =
        init_instances(1, InstanceType::Neutral, &config, 1, &registry, &generator()).unwrap();
    manager
        .scale_up(vec![(ids[0].clone(), handles[0].clone(), InstanceType::Neutral)])
        .await;

    wait_for_rebuild(&manager, "initial rebuild").await;

    manager.scale_down(&ids, true).await;
    assert_eq!(manager.num_instances().await, 0);
    assert_eq!(manager.pending_rebuild_instances(), 0);
}

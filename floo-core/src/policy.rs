//! Dispatch, Pair-Migration, and Autoscaling Policies
//!
//! Stateless decisions over the latest `InstanceInfo` snapshots:
//! - dispatch picks the least-loaded instance of the requested kind
//! - the pair-picker proposes `(source, destination)` migration pairs under
//!   a constraint, pairing loaded sources with free destinations
//! - the autoscaler turns aggregate fleet load into scale-up/scale-down
//!   decisions bounded by the instance limits

use std::collections::HashSet;

use floo_common::{InstanceInfo, InstanceType, MigrationPair, PairMigrationConstraint};

use crate::config::ScalingPolicy;

/// Least-loaded dispatch over a candidate set
#[derive(Debug, Default)]
pub struct DispatchPolicy;

impl DispatchPolicy {
    /// Pick the instance with the lowest dispatch load among `candidates`.
    pub fn dispatch<'a, I>(&self, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a InstanceInfo>,
    {
        candidates
            .into_iter()
            .min_by(|a, b| {
                a.dispatch_load_metric
                    .partial_cmp(&b.dispatch_load_metric)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|info| info.instance_id.clone())
    }
}

/// Threshold-based pair-picker
#[derive(Debug)]
pub struct PairMigrationPolicy {
    /// KV usage at or above which an instance becomes a migration source
    pub migrate_out_threshold: f64,
}

impl PairMigrationPolicy {
    pub fn new(migrate_out_threshold: f64) -> Self {
        Self {
            migrate_out_threshold,
        }
    }

    /// Propose migration pairs under `constraint`. `excluded` holds
    /// instances whose transport group failed to initialize; they never
    /// appear in a pair.
    pub fn pair_migration(
        &self,
        constraint: PairMigrationConstraint,
        infos: &[InstanceInfo],
        excluded: &HashSet<String>,
    ) -> Vec<MigrationPair> {
        let eligible: Vec<&InstanceInfo> = infos
            .iter()
            .filter(|info| !excluded.contains(&info.instance_id))
            .collect();
        if eligible.len() < 2 {
            return Vec::new();
        }

        let (mut sources, mut destinations): (Vec<&InstanceInfo>, Vec<&InstanceInfo>) =
            match constraint {
                PairMigrationConstraint::NoConstraints => {
                    let sources = eligible
                        .iter()
                        .copied()
                        .filter(|info| {
                            info.num_running_requests > 0
                                && info.kv_usage_ratio >= self.migrate_out_threshold
                        })
                        .collect();
                    let destinations = eligible
                        .iter()
                        .copied()
                        .filter(|info| info.kv_usage_ratio < self.migrate_out_threshold)
                        .collect();
                    (sources, destinations)
                }
                PairMigrationConstraint::PrefillToDecode => {
                    let sources = eligible
                        .iter()
                        .copied()
                        .filter(|info| {
                            info.instance_type == InstanceType::Prefill
                                && info.num_blocking_requests > 0
                        })
                        .collect();
                    let destinations = eligible
                        .iter()
                        .copied()
                        .filter(|info| info.instance_type == InstanceType::Decode)
                        .collect();
                    (sources, destinations)
                }
                PairMigrationConstraint::DecodeToDecode => {
                    let decode: Vec<&InstanceInfo> = eligible
                        .iter()
                        .copied()
                        .filter(|info| info.instance_type == InstanceType::Decode)
                        .collect();
                    let sources = decode
                        .iter()
                        .copied()
                        .filter(|info| {
                            info.num_running_requests > 0
                                && info.kv_usage_ratio >= self.migrate_out_threshold
                        })
                        .collect();
                    let destinations = decode
                        .iter()
                        .copied()
                        .filter(|info| info.kv_usage_ratio < self.migrate_out_threshold)
                        .collect();
                    (sources, destinations)
                }
            };

        // Most loaded source paired with the freest destination.
        sources.sort_by(|a, b| {
            b.migration_load_metric
                .partial_cmp(&a.migration_load_metric)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        destinations.sort_by(|a, b| {
            a.migration_load_metric
                .partial_cmp(&b.migration_load_metric)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        sources
            .iter()
            .zip(destinations.iter())
            .filter(|(src, dst)| src.instance_id != dst.instance_id)
            .map(|(src, dst)| MigrationPair {
                src_instance_id: src.instance_id.clone(),
                dst_instance_id: dst.instance_id.clone(),
                constraint,
            })
            .collect()
    }
}

/// Outcome of one autoscaling check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Ask for one more instance
    Up,
    /// Retire the named (fully drained) instance
    Down(String),
    Hold,
}

/// Threshold autoscaler over aggregate KV usage
#[derive(Debug)]
pub struct AutoScalingPolicy {
    pub policy: ScalingPolicy,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_instances: usize,
    pub max_instances: usize,
}

impl AutoScalingPolicy {
    fn cluster_load(&self, infos: &[InstanceInfo]) -> f64 {
        match self.policy {
            ScalingPolicy::MaxLoad => infos
                .iter()
                .map(|info| info.kv_usage_ratio)
                .fold(0.0, f64::max),
            ScalingPolicy::AvgLoad => {
                infos.iter().map(|info| info.kv_usage_ratio).sum::<f64>() / infos.len() as f64
            }
        }
    }

    /// Decide whether the fleet should grow or shrink. Only an instance with
    /// no running or waiting requests may be retired; with the fleet loaded
    /// but no drained instance the decision is to hold, letting migration
    /// drain one first.
    pub fn check(&self, infos: &[InstanceInfo]) -> ScaleDecision {
        if infos.is_empty() {
            return ScaleDecision::Hold;
        }
        let load = self.cluster_load(infos);
        if load >= self.scale_up_threshold && infos.len() < self.max_instances {
            return ScaleDecision::Up;
        }
        if load <= self.scale_down_threshold && infos.len() > self.min_instances {
            let candidate = infos
                .iter()
                .filter(|info| {
                    info.num_running_requests == 0 && info.num_waiting_requests == 0
                })
                .min_by(|a, b| {
                    a.kv_usage_ratio
                        .partial_cmp(&b.kv_usage_ratio)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            if let Some(candidate) = candidate {
                return ScaleDecision::Down(candidate.instance_id.clone());
            }
        }
        ScaleDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(
        instance_id: &str,
        instance_type: InstanceType,
        kv_usage: f64,
        num_running: usize,
    ) -> InstanceInfo {
        let mut info = InstanceInfo::new(instance_id, instance_type);
        info.kv_usage_ratio = kv_usage;
        info.migration_load_metric = kv_usage;
        info.dispatch_load_metric = kv_usage * 10.0;
        info.num_running_requests = num_running;
        info
    }

    #[test]
    fn test_dispatch_picks_least_loaded() {
        let policy = DispatchPolicy;
        let infos = vec![
            info("a", InstanceType::Neutral, 0.9, 3),
            info("b", InstanceType::Neutral, 0.1, 0),
            info("c", InstanceType::Neutral, 0.5, 1),
        ];
        assert_eq!(policy.dispatch(infos.iter()), Some("b".to_string()));
    }

    #[test]
    fn test_dispatch_empty_pool() {
        let policy = DispatchPolicy;
        assert_eq!(policy.dispatch(std::iter::empty()), None);
    }

    #[test]
    fn test_pair_migration_pairs_loaded_with_free() {
        let policy = PairMigrationPolicy::new(0.5);
        let infos = vec![
            info("hot", InstanceType::Neutral, 0.9, 4),
            info("cold", InstanceType::Neutral, 0.1, 0),
        ];
        let pairs =
            policy.pair_migration(PairMigrationConstraint::NoConstraints, &infos, &HashSet::new());
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].src_instance_id, "hot");
        assert_eq!(pairs[0].dst_instance_id, "cold");
    }

    #[test]
    fn test_single_instance_yields_no_pairs() {
        let policy = PairMigrationPolicy::new(0.5);
        let infos = vec![info("only", InstanceType::Neutral, 0.9, 4)];
        let pairs =
            policy.pair_migration(PairMigrationConstraint::NoConstraints, &infos, &HashSet::new());
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_excluded_instances_never_paired() {
        let policy = PairMigrationPolicy::new(0.5);
        let infos = vec![
            info("hot", InstanceType::Neutral, 0.9, 4),
            info("cold", InstanceType::Neutral, 0.1, 0),
        ];
        let excluded: HashSet<String> = ["cold".to_string()].into_iter().collect();
        let pairs =
            policy.pair_migration(PairMigrationConstraint::NoConstraints, &infos, &excluded);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_prefill_to_decode_requires_blocking_request() {
        let policy = PairMigrationPolicy::new(0.5);
        let mut prefill = info("prefill", InstanceType::Prefill, 0.2, 1);
        let decode = info("decode", InstanceType::Decode, 0.2, 0);

        let pairs = policy.pair_migration(
            PairMigrationConstraint::PrefillToDecode,
            &[prefill.clone(), decode.clone()],
            &HashSet::new(),
        );
        assert!(pairs.is_empty());

        prefill.num_blocking_requests = 1;
        let pairs = policy.pair_migration(
            PairMigrationConstraint::PrefillToDecode,
            &[prefill, decode],
            &HashSet::new(),
        );
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].constraint, PairMigrationConstraint::PrefillToDecode);
    }

    fn scaler(policy: ScalingPolicy) -> AutoScalingPolicy {
        AutoScalingPolicy {
            policy,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.1,
            min_instances: 1,
            max_instances: 4,
        }
    }

    #[test]
    fn test_scale_up_when_fleet_loaded() {
        let policy = scaler(ScalingPolicy::AvgLoad);
        let infos = vec![
            info("a", InstanceType::Neutral, 0.9, 3),
            info("b", InstanceType::Neutral, 0.8, 2),
        ];
        assert_eq!(policy.check(&infos), ScaleDecision::Up);
    }

    #[test]
    fn test_scale_up_respects_max_instances() {
        let policy = scaler(ScalingPolicy::MaxLoad);
        let infos: Vec<InstanceInfo> = (0..4)
            .map(|i| info(&format!("i{}", i), InstanceType::Neutral, 0.9, 3))
            .collect();
        assert_eq!(policy.check(&infos), ScaleDecision::Hold);
    }

    #[test]
    fn test_scale_down_retires_drained_instance() {
        let policy = scaler(ScalingPolicy::AvgLoad);
        let infos = vec![
            info("busy", InstanceType::Neutral, 0.1, 1),
            info("idle", InstanceType::Neutral, 0.0, 0),
        ];
        assert_eq!(policy.check(&infos), ScaleDecision::Down("idle".to_string()));
    }

    #[test]
    fn test_scale_down_respects_min_and_undrained_fleet() {
        let policy = scaler(ScalingPolicy::AvgLoad);
        // At the floor: the lone idle instance stays.
        let infos = vec![info("only", InstanceType::Neutral, 0.0, 0)];
        assert_eq!(policy.check(&infos), ScaleDecision::Hold);

        // Low load but every instance still holds requests: hold and let
        // migration drain one first.
        let infos = vec![
            info("a", InstanceType::Neutral, 0.05, 1),
            info("b", InstanceType::Neutral, 0.05, 1),
        ];
        assert_eq!(policy.check(&infos), ScaleDecision::Hold);
    }

    #[test]
    fn test_max_load_policy_sees_single_hot_instance() {
        let policy = scaler(ScalingPolicy::MaxLoad);
        let infos = vec![
            info("hot", InstanceType::Neutral, 0.9, 3),
            info("cold", InstanceType::Neutral, 0.0, 0),
            info("cold2", InstanceType::Neutral, 0.0, 0),
        ];
        assert_eq!(policy.check(&infos), ScaleDecision::Up);

        // The average of the same fleet stays under the threshold.
        let policy = scaler(ScalingPolicy::AvgLoad);
        assert_ne!(policy.check(&infos), ScaleDecision::Up);
    }

    #[test]
    fn test_decode_to_decode_ignores_prefill_instances() {
        let policy = PairMigrationPolicy::new(0.5);
        let infos = vec![
            info("prefill-hot", InstanceType::Prefill, 0.9, 4),
            info("decode-hot", InstanceType::Decode, 0.9, 4),
            info("decode-cold", InstanceType::Decode, 0.1, 0),
        ];
        let pairs = policy.pair_migration(
            PairMigrationConstraint::DecodeToDecode,
            &infos,
            &HashSet::new(),
        );
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].src_instance_id, "decode-hot");
        assert_eq!(pairs[0].dst_instance_id, "decode-cold");
    }
}

//! Pipeline templates — quick sync, canary, blue-green.
//!
//! Templates only lay out stages and their parameters. Retry policy and
//! timeouts are attached by the planner when it numbers the stages.

use rudder_core::{ApprovalPolicy, ProgressiveConfig, ProgressiveStrategy, Stage};

/// Single-stage pipeline applying the whole desired snapshot at once.
pub fn quick_sync() -> Vec<Stage> {
    vec![Stage::Sync { prune: false }]
}

/// Stages for a progressive rollout under `config`.
pub fn progressive(
    config: &ProgressiveConfig,
    approval: &ApprovalPolicy,
    target_replicas: Option<u32>,
) -> Vec<Stage> {
    match config.strategy {
        ProgressiveStrategy::Canary => canary(config, approval, target_replicas),
        ProgressiveStrategy::BlueGreen => blue_green(config, approval, target_replicas),
    }
}

fn approval_gate(approval: &ApprovalPolicy) -> Option<Stage> {
    approval.required.then(|| Stage::ManualApproval {
        approvers: approval.approvers.clone(),
    })
}

/// `ROLLOUT(step), ANALYSIS` for every step below 100, then
/// `[MANUAL_APPROVAL], ROLLOUT(100), [WAIT(bake)], CLEANUP`.
fn canary(
    config: &ProgressiveConfig,
    approval: &ApprovalPolicy,
    target_replicas: Option<u32>,
) -> Vec<Stage> {
    let mut stages = Vec::new();
    for &percent in config.canary_steps.iter().filter(|&&p| p < 100) {
        stages.push(Stage::Rollout {
            canary_percent: percent,
            target_replicas,
        });
        stages.push(Stage::Analysis {
            duration_secs: config.analysis_secs,
        });
    }
    stages.extend(approval_gate(approval));
    stages.push(Stage::Rollout {
        canary_percent: 100,
        target_replicas,
    });
    if let Some(bake) = config.bake_secs {
        stages.push(Stage::Wait {
            duration_secs: bake,
        });
    }
    stages.push(Stage::Cleanup);
    stages
}

/// `ROLLOUT(100), ANALYSIS, [MANUAL_APPROVAL], PRIMARY_SWITCH, [WAIT(bake)], CLEANUP`.
fn blue_green(
    config: &ProgressiveConfig,
    approval: &ApprovalPolicy,
    target_replicas: Option<u32>,
) -> Vec<Stage> {
    let mut stages = vec![
        Stage::Rollout {
            canary_percent: 100,
            target_replicas,
        },
        Stage::Analysis {
            duration_secs: config.analysis_secs,
        },
    ];
    stages.extend(approval_gate(approval));
    stages.push(Stage::PrimarySwitch);
    if let Some(bake) = config.bake_secs {
        stages.push(Stage::Wait {
            duration_secs: bake,
        });
    }
    stages.push(Stage::Cleanup);
    stages
}

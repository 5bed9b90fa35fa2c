//! Policy validation.
//!
//! Out-of-range values fail with [`PlanError::InvalidPolicy`]; nothing is
//! clamped. Negative numbers never reach this point because every policy
//! field is unsigned and fails deserialization.

use rudder_core::{DeploymentPolicy, DriverBounds};

use crate::error::{PlanError, PlanResult};

fn invalid(msg: impl Into<String>) -> PlanError {
    PlanError::InvalidPolicy(msg.into())
}

/// Check `policy` for internal consistency and against `bounds`.
pub fn validate_policy(policy: &DeploymentPolicy, bounds: &DriverBounds) -> PlanResult<()> {
    if !policy.quick_sync && policy.progressive.is_none() {
        return Err(invalid("no pipeline template enabled"));
    }

    let retry = &policy.retry;
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if retry.max_attempts > bounds.max_attempts {
        return Err(invalid(format!(
            "retry.max_attempts {} exceeds driver limit {}",
            retry.max_attempts, bounds.max_attempts
        )));
    }
    if retry.backoff_ms > bounds.max_backoff_ms || retry.max_backoff_ms > bounds.max_backoff_ms {
        return Err(invalid(format!(
            "retry backoff exceeds driver limit of {}ms",
            bounds.max_backoff_ms
        )));
    }

    if policy.stage_timeout_secs == 0 {
        return Err(invalid("stage_timeout_secs must be positive"));
    }
    if policy.stage_timeout_secs > bounds.max_stage_timeout_secs {
        return Err(invalid(format!(
            "stage_timeout_secs {} exceeds driver limit {}",
            policy.stage_timeout_secs, bounds.max_stage_timeout_secs
        )));
    }
    if policy.deployment_timeout_secs > 0
        && policy.deployment_timeout_secs < policy.stage_timeout_secs
    {
        return Err(invalid(format!(
            "deployment_timeout_secs {} is shorter than stage_timeout_secs {}",
            policy.deployment_timeout_secs, policy.stage_timeout_secs
        )));
    }

    if let Some(progressive) = &policy.progressive {
        let steps = &progressive.canary_steps;
        if steps.is_empty() {
            return Err(invalid("canary_steps must not be empty"));
        }
        if let Some(bad) = steps.iter().find(|&&s| s == 0 || s > 100) {
            return Err(invalid(format!("canary step {bad} is outside 1..=100")));
        }
        if steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("canary_steps must be strictly increasing"));
        }
        if steps.last() != Some(&100) {
            return Err(invalid("the last canary step must be 100"));
        }
        if progressive.analysis_secs > bounds.max_analysis_secs {
            return Err(invalid(format!(
                "analysis_secs {} exceeds driver limit {}",
                progressive.analysis_secs, bounds.max_analysis_secs
            )));
        }
        if let Some(bake) = progressive.bake_secs
            && bake > bounds.max_wait_secs
        {
            return Err(invalid(format!(
                "bake_secs {bake} exceeds driver limit {}",
                bounds.max_wait_secs
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::{ProgressiveConfig, RetryPolicy};

    fn progressive(steps: Vec<u32>) -> DeploymentPolicy {
        DeploymentPolicy {
            progressive: Some(ProgressiveConfig {
                canary_steps: steps,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(validate_policy(&DeploymentPolicy::default(), &DriverBounds::default()).is_ok());
        assert!(validate_policy(&progressive(vec![25, 100]), &DriverBounds::default()).is_ok());
    }

    #[test]
    fn rejects_policy_without_template() {
        let policy = DeploymentPolicy {
            quick_sync: false,
            ..Default::default()
        };
        let err = validate_policy(&policy, &DriverBounds::default()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPolicy(_)));
    }

    #[test]
    fn rejects_bad_canary_steps() {
        let bounds = DriverBounds::default();
        for steps in [vec![], vec![0, 100], vec![50, 25, 100], vec![25, 50], vec![25, 150]] {
            assert!(
                validate_policy(&progressive(steps.clone()), &bounds).is_err(),
                "{steps:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_values_beyond_driver_bounds() {
        let bounds = DriverBounds {
            max_attempts: 2,
            max_analysis_secs: 60,
            ..Default::default()
        };

        let too_many_attempts = DeploymentPolicy {
            retry: RetryPolicy {
                max_attempts: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_policy(&too_many_attempts, &bounds).is_err());

        let mut long_analysis = progressive(vec![100]);
        long_analysis.retry.max_attempts = 1;
        if let Some(p) = long_analysis.progressive.as_mut() {
            p.analysis_secs = 61;
        }
        assert!(validate_policy(&long_analysis, &bounds).is_err());
    }

    #[test]
    fn rejects_zero_attempts_and_stage_timeout() {
        let bounds = DriverBounds::default();
        let mut policy = DeploymentPolicy::default();
        policy.retry.max_attempts = 0;
        assert!(validate_policy(&policy, &bounds).is_err());

        let mut policy = DeploymentPolicy::default();
        policy.stage_timeout_secs = 0;
        assert!(validate_policy(&policy, &bounds).is_err());

        // Zero disables the deployment-wide deadline.
        let mut policy = DeploymentPolicy::default();
        policy.deployment_timeout_secs = 0;
        assert!(validate_policy(&policy, &bounds).is_ok());
    }

    #[test]
    fn deployment_timeout_must_cover_one_stage() {
        let bounds = DriverBounds::default();
        let mut policy = DeploymentPolicy::default();
        policy.stage_timeout_secs = 600;
        policy.deployment_timeout_secs = 599;
        let err = validate_policy(&policy, &bounds).unwrap_err();
        assert!(err.to_string().contains("deployment_timeout_secs"), "{err}");

        policy.deployment_timeout_secs = 600;
        assert!(validate_policy(&policy, &bounds).is_ok());
    }
}

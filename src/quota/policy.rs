use crate::models::catalog::ModelId;
use crate::quota::types::{DenialReason, QuotaCheckResult, QuotaSnapshot};

/// Admission decision for `estimated_tokens` more on `model`. The model
/// check comes first; a request that would push usage past a cap is denied
/// even if the counters are currently under it.
pub fn evaluate(snapshot: &QuotaSnapshot, estimated_tokens: u64, model: ModelId) -> QuotaCheckResult {
    if !snapshot.allowed_models.contains(&model) {
        return QuotaCheckResult::deny(
            snapshot,
            DenialReason::ModelNotAllowed,
            format!("{} is not available on the {} plan", model, snapshot.tier),
        );
    }

    if snapshot.daily_used.saturating_add(estimated_tokens) > snapshot.daily_limit {
        return QuotaCheckResult::deny(
            snapshot,
            DenialReason::DailyLimit,
            format!(
                "Daily token limit reached ({} of {} used)",
                snapshot.daily_used, snapshot.daily_limit
            ),
        );
    }

    if snapshot.monthly_used.saturating_add(estimated_tokens) > snapshot.monthly_limit {
        return QuotaCheckResult::deny(
            snapshot,
            DenialReason::MonthlyLimit,
            format!(
                "Monthly token limit reached ({} of {} used)",
                snapshot.monthly_used, snapshot.monthly_limit
            ),
        );
    }

    QuotaCheckResult::allow(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::tier::UserTier;

    #[test]
    fn test_allows_within_limits() {
        let snapshot = QuotaSnapshot::fresh("u1", UserTier::Pro);
        let result = evaluate(&snapshot, 1_000, ModelId::ClaudeSonnet);
        assert!(result.allowed);
        assert_eq!(result.daily_limit, 500_000);
        assert!(result.reason.is_none());
    }

    #[test]
    fn test_model_outside_plan_is_denied_first() {
        let mut snapshot = QuotaSnapshot::fresh("u1", UserTier::Free);
        snapshot.daily_used = snapshot.daily_limit;
        let result = evaluate(&snapshot, 10, ModelId::ClaudeOpus);
        assert!(!result.allowed);
        assert_eq!(result.denial, Some(DenialReason::ModelNotAllowed));
    }

    #[test]
    fn test_projected_usage_counts() {
        let mut snapshot = QuotaSnapshot::fresh("u1", UserTier::Free);
        snapshot.daily_used = 49_000;
        assert!(evaluate(&snapshot, 1_000, ModelId::GeminiFlash).allowed);

        let result = evaluate(&snapshot, 1_001, ModelId::GeminiFlash);
        assert_eq!(result.denial, Some(DenialReason::DailyLimit));
        assert_eq!(result.daily_used, 49_000);
    }

    #[test]
    fn test_monthly_cap() {
        let mut snapshot = QuotaSnapshot::fresh("u1", UserTier::Pro);
        snapshot.monthly_used = snapshot.monthly_limit;
        let result = evaluate(&snapshot, 1, ModelId::ClaudeHaiku);
        assert_eq!(result.denial, Some(DenialReason::MonthlyLimit));
        assert!(result.denial.unwrap().is_over_limit());
    }
}

//! Structured routing telemetry.
//!
//! The router and chat service report decisions through `RoutingObserver`
//! instead of formatting log lines, so tests can assert on the exact
//! sequence of events. `TracingObserver` is the production implementation.

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::models::catalog::ModelId;
use crate::quota::tier::UserTier;

/// Why a candidate was passed over without being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No registered provider, or its credentials are missing.
    Unavailable,
    /// The caller's tier does not allow this substitute.
    NotInTier,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Unavailable => "unavailable",
            SkipReason::NotInTier => "not allowed for tier",
        }
    }
}

pub trait RoutingObserver: Send + Sync {
    fn on_model_selected(&self, _requested: ModelId, _selected: ModelId, _tier: UserTier) {}

    /// A candidate that was never tried.
    fn on_candidate_skipped(&self, _model: ModelId, _reason: SkipReason) {}

    /// A candidate that was tried and failed before producing output.
    fn on_fallback(&self, _failed: ModelId, _error: &Error) {}

    fn on_exhausted(&self, _attempted: usize, _skipped: usize) {}

    fn on_quota_denied(&self, _user_id: &str, _model: ModelId, _reason: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RoutingObserver for TracingObserver {
    fn on_model_selected(&self, requested: ModelId, selected: ModelId, tier: UserTier) {
        debug!("Model selected: requested={}, selected={}, tier={}", requested, selected, tier);
    }

    fn on_candidate_skipped(&self, model: ModelId, reason: SkipReason) {
        debug!("Skipping candidate {}: {}", model, reason.as_str());
    }

    fn on_fallback(&self, failed: ModelId, error: &Error) {
        warn!("Model {} failed before producing output, falling back: {}", failed, error);
    }

    fn on_exhausted(&self, attempted: usize, skipped: usize) {
        warn!("Fallback chain exhausted: {} attempted, {} skipped", attempted, skipped);
    }

    fn on_quota_denied(&self, user_id: &str, model: ModelId, reason: &str) {
        info!("Quota denied for user {} on {}: {}", user_id, model, reason);
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RoutingEvent {
        Selected { requested: ModelId, selected: ModelId },
        Skipped { model: ModelId, reason: SkipReason },
        Fallback { failed: ModelId },
        Exhausted { attempted: usize, skipped: usize },
        QuotaDenied { user_id: String, model: ModelId },
    }

    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<RoutingEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<RoutingEvent> {
            self.events.lock().clone()
        }
    }

    impl RoutingObserver for RecordingObserver {
        fn on_model_selected(&self, requested: ModelId, selected: ModelId, _tier: UserTier) {
            self.events.lock().push(RoutingEvent::Selected { requested, selected });
        }

        fn on_candidate_skipped(&self, model: ModelId, reason: SkipReason) {
            self.events.lock().push(RoutingEvent::Skipped { model, reason });
        }

        fn on_fallback(&self, failed: ModelId, _error: &Error) {
            self.events.lock().push(RoutingEvent::Fallback { failed });
        }

        fn on_exhausted(&self, attempted: usize, skipped: usize) {
            self.events.lock().push(RoutingEvent::Exhausted { attempted, skipped });
        }

        fn on_quota_denied(&self, user_id: &str, model: ModelId, _reason: &str) {
            self.events.lock().push(RoutingEvent::QuotaDenied {
                user_id: user_id.to_string(),
                model,
            });
        }
    }
}

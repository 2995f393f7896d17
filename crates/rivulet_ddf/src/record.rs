//! Per-actor scheduling records.

use serde::{Deserialize, Serialize};

/// Admission classification of one actor for the current basic iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnablingStatus {
    /// Some input channel lacks the tokens the actor's rates demand
    NotEnabled,
    /// Ready to fire, but firing would only grow an already-satisfied
    /// downstream queue
    EnabledDeferrable,
    /// Ready to fire and some consumer is waiting on the output
    EnabledNotDeferrable,
}

impl EnablingStatus {
    /// True for either enabled classification
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::NotEnabled)
    }
}

/// Scheduling bookkeeping for one live actor
///
/// Created lazily the first time the scheduler references the actor,
/// updated after every firing of the actor or of a directly connected
/// neighbor, and dropped when the actor is disabled.
#[derive(Debug, Clone)]
pub struct ActorRecord {
    /// Cached enabling classification
    pub status: EnablingStatus,
    /// Firings so far in the current logical iteration
    pub firings: u64,
    /// Largest backlog across the actor's output receivers, used for
    /// minimax selection among deferrable actors
    pub max_tokens_on_outputs: usize,
    /// Firings this actor must reach before a logical iteration may end
    pub required_firings: Option<u64>,
}

impl ActorRecord {
    /// A fresh record with the given classification
    #[must_use]
    pub fn new(status: EnablingStatus, max_tokens_on_outputs: usize) -> Self {
        Self {
            status,
            firings: 0,
            max_tokens_on_outputs,
            required_firings: None,
        }
    }

    /// True if a required-firings constraint exists and is not yet met
    #[must_use]
    pub fn required_unmet(&self) -> bool {
        self.required_firings
            .is_some_and(|required| self.firings < required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabling_status() {
        assert!(!EnablingStatus::NotEnabled.is_enabled());
        assert!(EnablingStatus::EnabledDeferrable.is_enabled());
        assert!(EnablingStatus::EnabledNotDeferrable.is_enabled());
    }

    #[test]
    fn test_required_unmet() {
        let mut record = ActorRecord::new(EnablingStatus::NotEnabled, 0);
        assert!(!record.required_unmet());
        record.required_firings = Some(2);
        assert!(record.required_unmet());
        record.firings = 2;
        assert!(!record.required_unmet());
    }
}

//! The breakpoint table.
//!
//! An ordered set of future model times at which an integration step must
//! land exactly. Entries are deduplicated structurally: two times within
//! one resolution quantize to the same [`ModelTime`] tick count before they
//! reach the table.

use std::collections::BTreeSet;

use rivulet_core::{CoreError, CoreResult, ModelTime};

/// Ordered, deduplicated set of pending breakpoints
///
/// Invariant: never contains a time strictly less than the current model
/// time. Enforced at insertion; consumption from the front keeps it as
/// time advances.
#[derive(Debug, Clone, Default)]
pub struct BreakpointTable {
    points: BTreeSet<ModelTime>,
}

impl BreakpointTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a breakpoint requested by `requester`
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FireAtInPast`] if `time` is earlier than
    /// `current`.
    pub fn insert(
        &mut self,
        requester: &str,
        current: ModelTime,
        time: ModelTime,
    ) -> CoreResult<()> {
        if time < current {
            return Err(CoreError::FireAtInPast {
                actor: requester.to_string(),
            });
        }
        self.points.insert(time);
        Ok(())
    }

    /// The earliest pending breakpoint
    #[must_use]
    pub fn first(&self) -> Option<ModelTime> {
        self.points.iter().next().copied()
    }

    /// Remove and return the earliest pending breakpoint
    pub fn remove_first(&mut self) -> Option<ModelTime> {
        self.points.pop_first()
    }

    /// True if the exact time is a pending breakpoint
    #[must_use]
    pub fn contains(&self, time: ModelTime) -> bool {
        self.points.contains(&time)
    }

    /// Number of pending breakpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if no breakpoints are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Drop all pending breakpoints
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Iterate pending breakpoints in chronological order
    pub fn iter(&self) -> impl Iterator<Item = ModelTime> + '_ {
        self.points.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rivulet_core::TimeResolution;

    #[test]
    fn test_insert_rejects_past() {
        let mut table = BreakpointTable::new();
        let now = ModelTime::from_ticks(100);
        let err = table
            .insert("clock", now, ModelTime::from_ticks(99))
            .unwrap_err();
        assert!(matches!(err, CoreError::FireAtInPast { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_insert_at_current_time_allowed() {
        let mut table = BreakpointTable::new();
        let now = ModelTime::from_ticks(100);
        table.insert("clock", now, now).unwrap();
        assert!(table.contains(now));
    }

    #[test]
    fn test_duplicates_collapse() {
        let res = TimeResolution::default();
        let mut table = BreakpointTable::new();
        let now = ModelTime::ZERO;
        table
            .insert("a", now, res.time_from_seconds(0.6))
            .unwrap();
        table
            .insert("b", now, res.time_from_seconds(0.6 + 0.3e-10))
            .unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_consumption_order() {
        let mut table = BreakpointTable::new();
        let now = ModelTime::ZERO;
        table.insert("a", now, ModelTime::from_ticks(30)).unwrap();
        table.insert("a", now, ModelTime::from_ticks(10)).unwrap();
        table.insert("a", now, ModelTime::from_ticks(20)).unwrap();

        assert_eq!(table.remove_first(), Some(ModelTime::from_ticks(10)));
        assert_eq!(table.remove_first(), Some(ModelTime::from_ticks(20)));
        assert_eq!(table.remove_first(), Some(ModelTime::from_ticks(30)));
        assert_eq!(table.remove_first(), None);
    }

    proptest! {
        /// For any sequence of valid fire-at requests, iterating the table
        /// yields strictly increasing times, all at or after the request
        /// floor.
        #[test]
        fn prop_breakpoints_monotone(times in proptest::collection::vec(0_i64..1_000_000, 0..64)) {
            let mut table = BreakpointTable::new();
            let now = ModelTime::ZERO;
            for t in &times {
                table.insert("any", now, ModelTime::from_ticks(*t)).unwrap();
            }
            let collected: Vec<ModelTime> = table.iter().collect();
            for pair in collected.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
            if let Some(first) = table.first() {
                prop_assert!(first >= now);
            }
        }
    }
}

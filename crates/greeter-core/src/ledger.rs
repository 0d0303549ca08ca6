//! Tracking continuity ledger: which on-screen tracks were already handled.

use crate::types::VisitorId;
use std::collections::HashMap;

/// Outcome recorded for a handled track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackStatus {
    Unknown,
    Matched(VisitorId),
}

/// Maps detector track ids to their handled status for the lifetime of a
/// recognition loop.
#[derive(Debug, Default)]
pub struct TrackLedger {
    entries: HashMap<u32, TrackStatus>,
}

impl TrackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A track is processed unless it already has an entry.
    /// Detections without a track id are always processed.
    pub fn should_process(&self, track_id: Option<u32>) -> bool {
        match track_id {
            Some(id) => !self.entries.contains_key(&id),
            None => true,
        }
    }

    /// Record the outcome for a track. No-op without a track id.
    pub fn mark_handled(&mut self, track_id: Option<u32>, status: TrackStatus) {
        if let Some(id) = track_id {
            self.entries.insert(id, status);
        }
    }

    pub fn status(&self, track_id: u32) -> Option<&TrackStatus> {
        self.entries.get(&track_id)
    }

    /// Clear everything when the frame holds zero or several Near persons:
    /// departure and ambiguity both invalidate continuity.
    ///
    /// Returns true if entries were dropped.
    pub fn sweep_if_empty(&mut self, near_count: usize) -> bool {
        if near_count == 1 || self.entries.is_empty() {
            return false;
        }
        tracing::debug!(near_count, forgotten = self.entries.len(), "clearing track ledger");
        self.entries.clear();
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_always_processed() {
        let mut ledger = TrackLedger::new();
        ledger.mark_handled(None, TrackStatus::Unknown);
        assert!(ledger.should_process(None));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_handled_track_is_skipped() {
        let mut ledger = TrackLedger::new();
        assert!(ledger.should_process(Some(7)));
        ledger.mark_handled(Some(7), TrackStatus::Matched(VisitorId("v1".into())));
        assert!(!ledger.should_process(Some(7)));
        assert!(ledger.should_process(Some(8)));
        assert_eq!(
            ledger.status(7),
            Some(&TrackStatus::Matched(VisitorId("v1".into())))
        );
    }

    #[test]
    fn test_unknown_track_is_also_skipped() {
        let mut ledger = TrackLedger::new();
        ledger.mark_handled(Some(3), TrackStatus::Unknown);
        assert!(!ledger.should_process(Some(3)));
    }

    #[test]
    fn test_sweep_on_empty_and_multiple() {
        let mut ledger = TrackLedger::new();
        ledger.mark_handled(Some(1), TrackStatus::Unknown);
        assert!(!ledger.sweep_if_empty(1));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.sweep_if_empty(0));
        assert!(ledger.should_process(Some(1)));

        ledger.mark_handled(Some(1), TrackStatus::Unknown);
        assert!(ledger.sweep_if_empty(2));
        assert!(ledger.is_empty());
    }
}

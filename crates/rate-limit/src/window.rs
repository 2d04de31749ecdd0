use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// A fixed look-back duration over which events are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Minute,
    Hour,
    Day,
}

impl Horizon {
    /// Shortest first: the order caps are evaluated in.
    pub const ALL: [Horizon; 3] = [Horizon::Minute, Horizon::Hour, Horizon::Day];

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    pub fn as_secs(&self) -> u64 {
        match self {
            Horizon::Minute => 60,
            Horizon::Hour => 3_600,
            Horizon::Day => 86_400,
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.as_secs() * 1000
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Horizon::Minute => "minute",
            Horizon::Hour => "hour",
            Horizon::Day => "day",
        };
        f.write_str(name)
    }
}

/// Event timestamps (unix ms) for one identity over one horizon.
///
/// Pruned lazily: after [`prune`](WindowEntry::prune) every timestamp is
/// younger than the horizon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowEntry {
    events: VecDeque<u64>,
}

impl WindowEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every event at least `horizon` old relative to `now_ms`.
    pub fn prune(&mut self, now_ms: u64, horizon: Horizon) {
        let span = horizon.as_millis();
        self.events.retain(|ts| now_ms.saturating_sub(*ts) < span);
    }

    /// Events younger than `horizon`, without pruning.
    pub fn live_count(&self, now_ms: u64, horizon: Horizon) -> usize {
        let span = horizon.as_millis();
        self.events
            .iter()
            .filter(|ts| now_ms.saturating_sub(**ts) < span)
            .count()
    }

    pub fn record(&mut self, now_ms: u64) {
        self.events.push_back(now_ms);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Most recent event, if any.
    pub fn last(&self) -> Option<u64> {
        self.events.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_drops_only_expired_events() {
        let mut entry = WindowEntry::new();
        entry.record(1_000);
        entry.record(30_000);
        entry.record(61_000);

        entry.prune(61_000, Horizon::Minute);

        // 1_000 is exactly 60s old and therefore outside the window.
        assert_eq!(entry.len(), 2);
        assert_eq!(entry.last(), Some(61_000));
    }

    #[test]
    fn live_count_does_not_mutate() {
        let mut entry = WindowEntry::new();
        entry.record(0);
        entry.record(3_080_000);
        assert_eq!(entry.live_count(3_100_000, Horizon::Minute), 1);
        assert_eq!(entry.live_count(3_100_000, Horizon::Hour), 2);
        assert_eq!(entry.len(), 2);
    }

    #[test]
    fn prune_tolerates_clock_moving_backwards() {
        let mut entry = WindowEntry::new();
        entry.record(10_000);
        entry.prune(5_000, Horizon::Minute);
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn horizons_are_ordered_shortest_first() {
        let secs: Vec<u64> = Horizon::ALL.iter().map(Horizon::as_secs).collect();
        assert_eq!(secs, vec![60, 3_600, 86_400]);
    }

    #[test]
    fn serializes_as_plain_array() {
        let mut entry = WindowEntry::new();
        entry.record(5);
        entry.record(7);
        assert_eq!(serde_json::to_string(&entry).unwrap(), "[5,7]");
    }
}

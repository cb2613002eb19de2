use std::collections::BTreeMap;

use crate::types::ParticipantId;

/// Ordered queue of raised hands, local participant included.
///
/// Interoperable with the `handRaisedAt` field of state-updates: an RFC 3339
/// timestamp (integer epoch millis accepted for compat). Ties and unparsable
/// values fall back to arrival order.
#[derive(Debug, Default)]
pub struct HandRaiseQueue {
    /// (raised-at millis, arrival seq) -> participant
    queue: BTreeMap<(i64, u64), ParticipantId>,
    next_seq: u64,
}

impl HandRaiseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in the wire format.
    pub fn now_timestamp() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Record a raised hand. Raising an already raised hand keeps its place.
    /// Returns the 1-based position.
    pub fn raise(&mut self, id: &ParticipantId, raised_at: Option<&str>) -> u32 {
        if let Some(pos) = self.position(id) {
            return pos;
        }
        let ts = raised_at
            .and_then(parse_timestamp)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.queue.insert((ts, self.next_seq), id.clone());
        self.next_seq += 1;
        self.position(id).unwrap_or(0)
    }

    /// Returns true when the hand was raised.
    pub fn lower(&mut self, id: &ParticipantId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|_, p| p != id);
        self.queue.len() != before
    }

    pub fn position(&self, id: &ParticipantId) -> Option<u32> {
        self.queue
            .values()
            .position(|p| p == id)
            .map(|idx| idx as u32 + 1)
    }

    pub fn is_raised(&self, id: &ParticipantId) -> bool {
        self.position(id).is_some()
    }

    /// Raised hands in queue order.
    pub fn positions(&self) -> Vec<(ParticipantId, u32)> {
        self.queue
            .values()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx as u32 + 1))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

fn parse_timestamp(value: &str) -> Option<i64> {
    if value.is_empty() {
        return None;
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .ok()
        .or_else(|| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_raise_time_not_arrival() {
        let mut q = HandRaiseQueue::new();
        q.raise(&"late".into(), Some("2026-03-01T10:00:05.000Z"));
        q.raise(&"early".into(), Some("2026-03-01T10:00:01.000Z"));
        assert_eq!(q.position(&"early".into()), Some(1));
        assert_eq!(q.position(&"late".into()), Some(2));
    }

    #[test]
    fn accepts_epoch_millis_and_keeps_existing_place() {
        let mut q = HandRaiseQueue::new();
        assert_eq!(q.raise(&"a".into(), Some("1000")), 1);
        assert_eq!(q.raise(&"b".into(), Some("2000")), 2);
        // Re-raising with a newer timestamp does not move the hand.
        assert_eq!(q.raise(&"a".into(), Some("3000")), 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn lower_removes_and_shifts_positions() {
        let mut q = HandRaiseQueue::new();
        q.raise(&"a".into(), Some("1000"));
        q.raise(&"b".into(), Some("2000"));
        assert!(q.lower(&"a".into()));
        assert!(!q.lower(&"a".into()));
        assert_eq!(q.positions(), vec![(ParticipantId::from("b"), 1)]);
    }

    #[test]
    fn equal_timestamps_fall_back_to_arrival() {
        let mut q = HandRaiseQueue::new();
        q.raise(&"z".into(), Some("5000"));
        q.raise(&"a".into(), Some("5000"));
        assert_eq!(q.positions(), vec![(ParticipantId::from("z"), 1), (ParticipantId::from("a"), 2)]);
    }

    #[test]
    fn now_timestamp_round_trips() {
        let ts = HandRaiseQueue::now_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(parse_timestamp(&ts).is_some());
    }
}

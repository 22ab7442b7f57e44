use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// HTTP statuses counted as a working link. 401 and 403 qualify because the
/// URL demonstrably identifies something; whether we hold credentials for it
/// is out of scope.
pub const SUCCESS_STATUSES: [i32; 3] = [200, 401, 403];

/// Check whether a recorded return code counts as success.
/// `-1` (connection, timeout, and read failures) never does.
pub fn is_success_code(code: i32) -> bool {
    SUCCESS_STATUSES.contains(&code)
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A single probe result kept in a row's bounded history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictEntry {
    /// When the probe completed (seconds since the epoch).
    pub time: u64,

    /// HTTP status, or -1 for connection, timeout, and read failures.
    pub return_code: i32,

    /// MIME type on success, exception text on failure.
    pub detail: String,
}

impl VerdictEntry {
    pub fn new(time: u64, return_code: i32, detail: String) -> Self {
        Self {
            time,
            return_code,
            detail,
        }
    }

    pub fn is_failure(&self) -> bool {
        !is_success_code(self.return_code)
    }
}

/// The checker's durable record for one tracked identifier.
///
/// A row exists only for public, non-test identifiers whose target is not the
/// service-generated default; the reconciler enforces that filter. A row with
/// `last_check_time == 0` has never been probed and carries no verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRow {
    /// Opaque identifier string; primary key, total-ordered.
    pub identifier: String,

    /// The account that minted the identifier; the unit of fairness.
    pub owner_id: String,

    /// URL the identifier resolves to.
    pub target: String,

    /// Completion time of the most recent probe (seconds since the epoch);
    /// 0 means unvisited.
    pub last_check_time: u64,

    /// Verdict of the most recent probe. Meaningless while unvisited.
    pub is_bad: bool,

    /// Most recent probe results, oldest first. Bounded; cleared whenever the
    /// target changes.
    pub history: VecDeque<VerdictEntry>,
}

impl LinkRow {
    /// Create an unvisited row with an empty history.
    pub fn new(identifier: String, owner_id: String, target: String) -> Self {
        Self {
            identifier,
            owner_id,
            target,
            last_check_time: 0,
            is_bad: false,
            history: VecDeque::new(),
        }
    }

    pub fn is_visited(&self) -> bool {
        self.last_check_time > 0
    }

    pub fn is_good(&self) -> bool {
        self.is_visited() && !self.is_bad
    }

    /// Point the row at a new (owner, target) pair. Accumulated verdicts
    /// describe the old target, so the history is dropped and the row reverts
    /// to unvisited.
    pub fn retarget(&mut self, owner_id: String, target: String) {
        self.owner_id = owner_id;
        self.target = target;
        self.last_check_time = 0;
        self.is_bad = false;
        self.history.clear();
    }

    /// Append a probe verdict, evicting the oldest entry past `capacity`,
    /// and recompute the row's state from it.
    pub fn record(&mut self, entry: VerdictEntry, capacity: usize) {
        self.is_bad = entry.is_failure();
        self.last_check_time = entry.time;
        self.history.push_back(entry);
        while self.history.len() > capacity.max(1) {
            self.history.pop_front();
        }
    }

    /// Number of trailing failures in the history.
    pub fn consecutive_failures(&self) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|e| e.is_failure())
            .count()
    }

    /// Whether an external notifier should act on this row: the trailing
    /// failure run has filled out to `threshold` entries and the oldest of
    /// those failures is more than `min_span_secs` old.
    pub fn is_notification_worthy(&self, threshold: usize, min_span_secs: u64, now: u64) -> bool {
        let failures = self.consecutive_failures();
        if failures < threshold.max(1) {
            return false;
        }
        let oldest = self.history[self.history.len() - failures].time;
        now.saturating_sub(oldest) > min_span_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> LinkRow {
        LinkRow::new(
            "ark:/13030/test1".to_string(),
            "owner-1".to_string(),
            "https://example.com/a".to_string(),
        )
    }

    fn failure(time: u64) -> VerdictEntry {
        VerdictEntry::new(time, -1, "connection refused".to_string())
    }

    fn success(time: u64) -> VerdictEntry {
        VerdictEntry::new(time, 200, "text/html".to_string())
    }

    #[test]
    fn test_success_code_set() {
        assert!(is_success_code(200));
        assert!(is_success_code(401));
        assert!(is_success_code(403));
        assert!(!is_success_code(500));
        assert!(!is_success_code(404));
        assert!(!is_success_code(-1));
    }

    #[test]
    fn test_new_row_is_unvisited() {
        let r = row();
        assert!(!r.is_visited());
        assert!(!r.is_good());
        assert!(!r.is_bad);
        assert!(r.history.is_empty());
    }

    #[test]
    fn test_record_sets_verdict() {
        let mut r = row();
        r.record(success(100), 5);
        assert!(r.is_visited());
        assert!(r.is_good());
        assert!(!r.is_bad);
        assert_eq!(r.last_check_time, 100);

        r.record(failure(200), 5);
        assert!(r.is_bad);
        assert!(!r.is_good());
        assert_eq!(r.last_check_time, 200);
        assert_eq!(r.history.len(), 2);
    }

    #[test]
    fn test_visited_rows_have_exactly_one_verdict() {
        let mut r = row();
        for t in 1..20 {
            if t % 3 == 0 {
                r.record(failure(t), 7);
            } else {
                r.record(success(t), 7);
            }
            assert!(r.is_visited());
            assert_ne!(r.is_good(), r.is_bad);
        }
    }

    #[test]
    fn test_history_eviction() {
        let mut r = row();
        for t in 1..=10 {
            r.record(failure(t), 7);
            assert!(r.history.len() <= 7);
        }
        assert_eq!(r.history.len(), 7);
        // Oldest entries were evicted
        assert_eq!(r.history.front().unwrap().time, 4);
        assert_eq!(r.history.back().unwrap().time, 10);
    }

    #[test]
    fn test_retarget_clears_history() {
        let mut r = row();
        r.record(failure(100), 7);
        r.record(failure(200), 7);
        r.retarget("owner-2".to_string(), "https://example.com/b".to_string());
        assert!(r.history.is_empty());
        assert!(!r.is_visited());
        assert!(!r.is_bad);
        assert_eq!(r.owner_id, "owner-2");
        assert_eq!(r.target, "https://example.com/b");
    }

    #[test]
    fn test_consecutive_failures() {
        let mut r = row();
        assert_eq!(r.consecutive_failures(), 0);
        r.record(failure(1), 7);
        r.record(failure(2), 7);
        assert_eq!(r.consecutive_failures(), 2);
        r.record(success(3), 7);
        assert_eq!(r.consecutive_failures(), 0);
        r.record(failure(4), 7);
        assert_eq!(r.consecutive_failures(), 1);
    }

    #[test]
    fn test_notification_worthiness() {
        let mut r = row();
        for t in 1..=3 {
            r.record(failure(t * 100), 3);
        }
        // Threshold met, span met
        assert!(r.is_notification_worthy(3, 500, 1000));
        // Threshold met, span not yet met
        assert!(!r.is_notification_worthy(3, 5000, 1000));
        // Threshold not met
        assert!(!r.is_notification_worthy(4, 500, 1000));
    }

    #[test]
    fn test_notification_resets_after_success() {
        let mut r = row();
        r.record(failure(100), 3);
        r.record(failure(200), 3);
        r.record(success(300), 3);
        assert!(!r.is_notification_worthy(2, 0, 10_000));
    }
}

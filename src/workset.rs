//! Round-robin, per-owner dispatch of links to probe workers.
//!
//! Each round the scheduler loads a bounded workset per owner (failing links
//! first) and then hands out one link at a time under a single mutex. The
//! rotating cursor, the per-owner lock, and the per-owner cooldown together
//! guarantee that no owner monopolizes the workers and no external server
//! sees more than one concurrent probe per owner.

use crate::exclusions::ExclusionRegistry;
use crate::models::LinkRow;
use crate::store::{LinkStore, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One owner's slice of the current round.
#[derive(Debug)]
pub struct OwnerWorkset {
    pub owner_id: String,
    /// Links to probe this round, failing links first.
    pub links: Vec<LinkRow>,
    /// Position of the next unchecked link; past the end means finished.
    pub next_index: usize,
    /// Set while a worker is probing one of this owner's links.
    pub is_locked: bool,
    /// Completion time of this owner's most recent probe.
    pub last_probe: Option<Instant>,
}

impl OwnerWorkset {
    pub fn new(owner_id: String, links: Vec<LinkRow>) -> Self {
        Self {
            owner_id,
            links,
            next_index: 0,
            is_locked: false,
            last_probe: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.next_index >= self.links.len()
    }

    fn cooled_down(&self, revisit: Duration) -> bool {
        self.last_probe.map_or(true, |t| t.elapsed() >= revisit)
    }
}

/// Outcome of one dispatch attempt.
#[derive(Debug)]
pub enum Dispatch {
    /// A link to probe; echo `index` back through `mark_checked`.
    Ready { index: usize, row: LinkRow },
    /// Unfinished owners exist but all are locked or cooling down.
    Wait,
    /// Every workset is finished; the round is over.
    Finished,
}

/// Read-only view of one loaded workset, for logs and assertions.
#[derive(Debug, Clone)]
pub struct WorksetSnapshot {
    pub owner_id: String,
    pub identifiers: Vec<String>,
    pub next_index: usize,
}

struct SchedulerInner {
    worksets: Vec<OwnerWorkset>,
    cursor: usize,
}

/// The round's shared dispatch state. All mutation happens under one mutex;
/// `next_link` never blocks on I/O.
pub struct Scheduler {
    exclusions: Arc<ExclusionRegistry>,
    revisit_interval: Duration,
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new(exclusions: Arc<ExclusionRegistry>, revisit_interval: Duration) -> Self {
        Self {
            exclusions,
            revisit_interval,
            inner: Mutex::new(SchedulerInner {
                worksets: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Build the round's worksets: for each non-excluded owner, up to
    /// `max_links` failing links last checked before `bad_before`, topped up
    /// with good-or-unvisited links last checked before `good_before`.
    /// Returns the total number of links loaded.
    ///
    /// Two separate queries keep an owner's failing links from being crowded
    /// out by a large pool of eligible good ones.
    pub fn load(
        &self,
        store: &LinkStore,
        max_links: usize,
        bad_before: u64,
        good_before: u64,
    ) -> Result<usize, StoreError> {
        self.exclusions.refresh();

        let mut worksets = Vec::new();
        let mut total = 0;
        for owner in store.owners()? {
            if self.exclusions.is_excluded(&owner) {
                continue;
            }
            let mut links = store.candidates(&owner, true, bad_before, max_links)?;
            if links.len() < max_links {
                let top_up = store.candidates(&owner, false, good_before, max_links - links.len())?;
                links.extend(top_up);
            }
            if links.is_empty() {
                continue;
            }
            total += links.len();
            worksets.push(OwnerWorkset::new(owner, links));
        }

        let mut inner = self.inner.lock();
        inner.worksets = worksets;
        inner.cursor = 0;
        Ok(total)
    }

    /// Dispense the next link to probe, sweeping the cursor over every owner
    /// at most once. Owners that became excluded since the round was loaded
    /// are finished on the spot, so mid-round exclusions take effect within
    /// the refresh debounce plus one sweep.
    pub fn next_link(&self) -> Dispatch {
        self.exclusions.refresh();

        let mut inner = self.inner.lock();
        if inner.worksets.is_empty() {
            return Dispatch::Finished;
        }
        let len = inner.worksets.len();
        let start = inner.cursor;
        let mut saw_blocked = false;

        loop {
            let i = inner.cursor;
            let excluded = self.exclusions.is_excluded(&inner.worksets[i].owner_id);
            let w = &mut inner.worksets[i];
            if excluded && !w.is_finished() {
                w.next_index = w.links.len();
            }
            if !w.is_finished() {
                if !w.is_locked && w.cooled_down(self.revisit_interval) {
                    w.is_locked = true;
                    let row = w.links[w.next_index].clone();
                    // Move past the dispatched owner so consecutive
                    // dispatches favor different owners.
                    inner.cursor = (i + 1) % len;
                    return Dispatch::Ready { index: i, row };
                }
                saw_blocked = true;
            }
            inner.cursor = (i + 1) % len;
            if inner.cursor == start {
                return if saw_blocked {
                    Dispatch::Wait
                } else {
                    Dispatch::Finished
                };
            }
        }
    }

    /// Record a probe completion: keep the updated row, advance past it,
    /// stamp the owner's completion time, and release the owner lock.
    pub fn mark_checked(&self, index: usize, row: LinkRow) {
        let mut inner = self.inner.lock();
        let Some(w) = inner.worksets.get_mut(index) else {
            return;
        };
        if w.next_index < w.links.len() {
            w.links[w.next_index] = row;
        }
        w.next_index += 1;
        w.last_probe = Some(Instant::now());
        w.is_locked = false;
    }

    pub fn snapshot(&self) -> Vec<WorksetSnapshot> {
        self.inner
            .lock()
            .worksets
            .iter()
            .map(|w| WorksetSnapshot {
                owner_id: w.owner_id.clone(),
                identifiers: w.links.iter().map(|r| r.identifier.clone()).collect(),
                next_index: w.next_index,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusions::OwnerDirectory;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    const DAY: u64 = 86_400;
    const NOW: u64 = 1_700_000_000;

    fn store() -> (TempDir, LinkStore) {
        let dir = TempDir::new().unwrap();
        let store = LinkStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn put_row(store: &LinkStore, id: &str, owner: &str, last_check: u64, bad: bool) {
        let mut row = LinkRow::new(
            id.to_string(),
            owner.to_string(),
            format!("https://example.com/{id}"),
        );
        row.last_check_time = last_check;
        row.is_bad = bad;
        store.put(&row).unwrap();
    }

    fn no_exclusions() -> Arc<ExclusionRegistry> {
        Arc::new(ExclusionRegistry::new(
            None,
            Arc::new(RwLock::new(HashMap::new())),
        ))
    }

    fn drain_owner_sequence(scheduler: &Scheduler) -> Vec<String> {
        let mut owners = Vec::new();
        loop {
            match scheduler.next_link() {
                Dispatch::Ready { index, row } => {
                    owners.push(row.owner_id.clone());
                    scheduler.mark_checked(index, row);
                }
                Dispatch::Wait => panic!("unexpected Wait with zero revisit interval"),
                Dispatch::Finished => break,
            }
        }
        owners
    }

    #[test]
    fn test_empty_scheduler_is_finished() {
        let scheduler = Scheduler::new(no_exclusions(), Duration::ZERO);
        assert!(matches!(scheduler.next_link(), Dispatch::Finished));
    }

    #[test]
    fn test_two_owner_fairness() {
        let (_dir, store) = store();
        for i in 0..50 {
            put_row(&store, &format!("ark:/1/alpha{i:02}"), "alpha", 0, false);
        }
        for i in 0..2 {
            put_row(&store, &format!("ark:/1/beta{i}"), "beta", 0, false);
        }

        let scheduler = Scheduler::new(no_exclusions(), Duration::ZERO);
        let loaded = scheduler.load(&store, 10, NOW, NOW).unwrap();
        assert_eq!(loaded, 12);

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].identifiers.len(), 10);
        assert_eq!(snapshot[1].identifiers.len(), 2);

        let owners = drain_owner_sequence(&scheduler);
        assert_eq!(owners.len(), 12);
        // Strict alternation until beta exhausts, then alpha alone.
        assert_eq!(
            &owners[..4],
            &["alpha", "beta", "alpha", "beta"]
        );
        assert!(owners[4..].iter().all(|o| o == "alpha"));
    }

    #[test]
    fn test_bad_links_come_first() {
        let (_dir, store) = store();
        for i in 0..5 {
            put_row(&store, &format!("ark:/1/bad{i}"), "x", NOW - 2 * DAY, true);
        }
        for i in 0..100 {
            // Good rows with staggered ages; the two oldest should win the
            // top-up slots.
            put_row(
                &store,
                &format!("ark:/1/good{i:03}"),
                "x",
                NOW - 40 * DAY + i,
                false,
            );
        }

        let scheduler = Scheduler::new(no_exclusions(), Duration::ZERO);
        scheduler
            .load(&store, 7, NOW - DAY, NOW - 30 * DAY)
            .unwrap();

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.len(), 1);
        let ids = &snapshot[0].identifiers;
        assert_eq!(ids.len(), 7);
        assert!(ids[..5].iter().all(|id| id.starts_with("ark:/1/bad")));
        assert_eq!(ids[5], "ark:/1/good000");
        assert_eq!(ids[6], "ark:/1/good001");
    }

    #[test]
    fn test_blackout_window() {
        let (_dir, store) = store();
        put_row(&store, "ark:/1/fresh", "x", NOW - 10, false);

        let scheduler = Scheduler::new(no_exclusions(), Duration::ZERO);
        // Within the blackout window: nothing eligible.
        let loaded = scheduler.load(&store, 10, NOW - DAY, NOW - 3600).unwrap();
        assert_eq!(loaded, 0);
        assert!(matches!(scheduler.next_link(), Dispatch::Finished));

        // After the window has elapsed the row is loadable again.
        let later = NOW + 3600;
        let loaded = scheduler
            .load(&store, 10, later - DAY, later - 3600)
            .unwrap();
        assert_eq!(loaded, 1);
    }

    #[test]
    fn test_owner_lock_blocks_second_dispatch() {
        let (_dir, store) = store();
        put_row(&store, "ark:/1/a", "x", 0, false);
        put_row(&store, "ark:/1/b", "x", 0, false);

        let scheduler = Scheduler::new(no_exclusions(), Duration::ZERO);
        scheduler.load(&store, 10, NOW, NOW).unwrap();

        let Dispatch::Ready { index, row } = scheduler.next_link() else {
            panic!("expected a dispatch");
        };
        // Owner is locked: the only other link must wait.
        assert!(matches!(scheduler.next_link(), Dispatch::Wait));

        scheduler.mark_checked(index, row);
        assert!(matches!(scheduler.next_link(), Dispatch::Ready { .. }));
    }

    #[test]
    fn test_owner_cooldown_blocks_until_elapsed() {
        let (_dir, store) = store();
        put_row(&store, "ark:/1/a", "x", 0, false);
        put_row(&store, "ark:/1/b", "x", 0, false);

        let scheduler = Scheduler::new(no_exclusions(), Duration::from_secs(3600));
        scheduler.load(&store, 10, NOW, NOW).unwrap();

        let Dispatch::Ready { index, row } = scheduler.next_link() else {
            panic!("expected a dispatch");
        };
        scheduler.mark_checked(index, row);
        // Completion stamped just now; the hour-long cooldown holds.
        assert!(matches!(scheduler.next_link(), Dispatch::Wait));
    }

    #[test]
    fn test_each_row_dispatched_once() {
        let (_dir, store) = store();
        for i in 0..9 {
            put_row(&store, &format!("ark:/1/{i}"), &format!("owner{}", i % 3), 0, false);
        }

        let scheduler = Scheduler::new(no_exclusions(), Duration::ZERO);
        scheduler.load(&store, 10, NOW, NOW).unwrap();

        let mut seen = Vec::new();
        loop {
            match scheduler.next_link() {
                Dispatch::Ready { index, row } => {
                    seen.push(row.identifier.clone());
                    scheduler.mark_checked(index, row);
                }
                Dispatch::Wait => panic!("unexpected Wait"),
                Dispatch::Finished => break,
            }
        }
        assert_eq!(seen.len(), 9);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_excluded_owner_not_loaded() {
        let (_dir, store) = store();
        put_row(&store, "ark:/1/a", "alice", 0, false);
        put_row(&store, "ark:/1/b", "bob", 0, false);

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("exclusions");
        File::create(&path)
            .unwrap()
            .write_all(b"alice-user temporary\n")
            .unwrap();
        let directory: OwnerDirectory = Arc::new(RwLock::new(HashMap::from([(
            "alice-user".to_string(),
            "alice".to_string(),
        )])));
        let exclusions = Arc::new(
            ExclusionRegistry::new(Some(path), directory).with_debounce(Duration::ZERO),
        );

        let scheduler = Scheduler::new(exclusions, Duration::ZERO);
        scheduler.load(&store, 10, NOW, NOW).unwrap();
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].owner_id, "bob");
    }

    fn write_exclusion_file(path: &std::path::Path, content: &str, mtime_offset_secs: u64) {
        let mut f = File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        // Pin a distinct mtime so back-to-back writes are always observable.
        f.set_modified(
            std::time::SystemTime::UNIX_EPOCH
                + Duration::from_secs(1_000_000 + mtime_offset_secs),
        )
        .unwrap();
    }

    #[test]
    fn test_mid_round_exclusion_skips_remaining_links() {
        let (_dir, store) = store();
        for i in 0..5 {
            put_row(&store, &format!("ark:/1/a{i}"), "alice", 0, false);
        }

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("exclusions");
        write_exclusion_file(&path, "\n", 0);
        let directory: OwnerDirectory = Arc::new(RwLock::new(HashMap::from([(
            "alice-user".to_string(),
            "alice".to_string(),
        )])));
        let exclusions = Arc::new(
            ExclusionRegistry::new(Some(path.clone()), directory).with_debounce(Duration::ZERO),
        );

        let scheduler = Scheduler::new(exclusions, Duration::ZERO);
        scheduler.load(&store, 10, NOW, NOW).unwrap();

        let Dispatch::Ready { index, row } = scheduler.next_link() else {
            panic!("expected a dispatch");
        };
        scheduler.mark_checked(index, row);

        // The owner is excluded mid-round; its remaining links are skipped.
        write_exclusion_file(&path, "alice-user temporary\n", 1);
        assert!(matches!(scheduler.next_link(), Dispatch::Finished));
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot[0].next_index, 5);
    }

    #[test]
    fn test_all_owners_excluded_finishes_immediately() {
        let (_dir, store) = store();
        put_row(&store, "ark:/1/a", "alice", 0, false);

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("exclusions");
        write_exclusion_file(&path, "\n", 0);
        let directory: OwnerDirectory = Arc::new(RwLock::new(HashMap::from([(
            "alice-user".to_string(),
            "alice".to_string(),
        )])));
        let exclusions = Arc::new(
            ExclusionRegistry::new(Some(path.clone()), directory).with_debounce(Duration::ZERO),
        );

        let scheduler = Scheduler::new(exclusions, Duration::ZERO);
        scheduler.load(&store, 10, NOW, NOW).unwrap();
        write_exclusion_file(&path, "alice-user temporary\n", 1);
        assert!(matches!(scheduler.next_link(), Dispatch::Finished));
    }
}

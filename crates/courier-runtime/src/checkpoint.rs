//! The update checkpoint.
//!
//! Tracks which update ids were begun and finished, and derives the
//! committed cursor: the highest id such that it and every begun id before
//! it has finished. Units that never finish (cancelled on hard stop) hold
//! the cursor back, so their updates are fetched again on the next start.
//!
//! Push sources (webhooks, in-process queues) may hand over ids out of
//! order, so for them redeliveries are recognised by a bounded window of
//! recently begun ids instead of the cursor.

use std::collections::{BTreeSet, HashSet, VecDeque};

use parking_lot::Mutex;

/// How many begun ids are remembered for push-source deduplication.
pub const RECENT_WINDOW: usize = 1024;

#[derive(Debug, Default)]
struct Ledger {
    committed: Option<i64>,
    in_flight: BTreeSet<i64>,
    /// Finished ids above the committed cursor.
    done: BTreeSet<i64>,
    /// Recently begun ids, oldest first.
    recent: VecDeque<i64>,
    seen: HashSet<i64>,
}

impl Ledger {
    fn remember(&mut self, id: i64) {
        if !self.seen.insert(id) {
            return;
        }
        self.recent.push_back(id);
        if self.recent.len() > RECENT_WINDOW
            && let Some(oldest) = self.recent.pop_front()
        {
            self.seen.remove(&oldest);
        }
    }

    fn start(&mut self, id: i64) {
        self.in_flight.insert(id);
        self.remember(id);
    }

    fn advance(&mut self) {
        let barrier = self.in_flight.first().copied();
        let ready: Vec<i64> = match barrier {
            Some(barrier) => self.done.range(..barrier).copied().collect(),
            None => self.done.iter().copied().collect(),
        };
        if let Some(&last) = ready.last() {
            self.committed = Some(self.committed.map_or(last, |c| c.max(last)));
        }
        for id in ready {
            self.done.remove(&id);
        }
    }
}

/// Thread-safe checkpoint of processed update ids.
#[derive(Debug, Default)]
pub struct Checkpoint {
    ledger: Mutex<Ledger>,
}

impl Checkpoint {
    /// Creates a checkpoint that starts after `committed`.
    pub fn new(committed: Option<i64>) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                committed,
                ..Ledger::default()
            }),
        }
    }

    /// Marks `update_id` as started.
    ///
    /// Returns `false` for redeliveries: ids at or below the cursor and ids
    /// that were already begun.
    pub fn begin(&self, update_id: i64) -> bool {
        let mut ledger = self.ledger.lock();
        if ledger.committed.is_some_and(|c| update_id <= c)
            || ledger.in_flight.contains(&update_id)
            || ledger.done.contains(&update_id)
        {
            return false;
        }
        ledger.start(update_id);
        true
    }

    /// Marks a pushed `update_id` as started.
    ///
    /// Ids below the cursor are accepted; only ids begun within the last
    /// [`RECENT_WINDOW`] starts count as redeliveries. The cursor never moves
    /// backwards when such an id completes.
    pub fn begin_pushed(&self, update_id: i64) -> bool {
        let mut ledger = self.ledger.lock();
        if ledger.seen.contains(&update_id)
            || ledger.in_flight.contains(&update_id)
            || ledger.done.contains(&update_id)
        {
            return false;
        }
        ledger.start(update_id);
        true
    }

    /// Marks `update_id` as finished and returns the new cursor if it moved.
    pub fn complete(&self, update_id: i64) -> Option<i64> {
        let mut ledger = self.ledger.lock();
        if !ledger.in_flight.remove(&update_id) {
            return None;
        }
        ledger.done.insert(update_id);

        let before = ledger.committed;
        ledger.advance();
        (ledger.committed != before).then_some(ledger.committed).flatten()
    }

    /// Moves the cursor forward to `update_id` without processing, e.g.
    /// after pending updates were dropped.
    pub fn skip_to(&self, update_id: i64) {
        let mut ledger = self.ledger.lock();
        if ledger.committed.is_none_or(|c| c < update_id) {
            ledger.committed = Some(update_id);
        }
    }

    /// The committed cursor.
    pub fn committed(&self) -> Option<i64> {
        self.ledger.lock().committed
    }

    /// Number of begun, unfinished updates.
    pub fn in_flight(&self) -> usize {
        self.ledger.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_redelivery() {
        let checkpoint = Checkpoint::new(Some(10));
        assert!(!checkpoint.begin(9));
        assert!(!checkpoint.begin(10));
        assert!(checkpoint.begin(11));
        assert!(!checkpoint.begin(11));
        checkpoint.complete(11);
        assert!(!checkpoint.begin(11));
    }

    #[test]
    fn test_cursor_waits_for_earlier_units() {
        let checkpoint = Checkpoint::default();
        for id in [1, 2, 3] {
            assert!(checkpoint.begin(id));
        }

        assert_eq!(checkpoint.complete(2), None);
        assert_eq!(checkpoint.complete(3), None);
        assert_eq!(checkpoint.committed(), None);

        assert_eq!(checkpoint.complete(1), Some(3));
        assert_eq!(checkpoint.in_flight(), 0);
    }

    #[test]
    fn test_unfinished_unit_holds_cursor() {
        let checkpoint = Checkpoint::new(Some(0));
        checkpoint.begin(1);
        checkpoint.begin(2);
        checkpoint.begin(3);
        assert_eq!(checkpoint.complete(1), Some(1));
        // 2 never finishes.
        checkpoint.complete(3);
        assert_eq!(checkpoint.committed(), Some(1));
    }

    #[test]
    fn test_gaps_in_ids_are_fine() {
        let checkpoint = Checkpoint::new(Some(5));
        checkpoint.begin(9);
        assert_eq!(checkpoint.complete(9), Some(9));

        checkpoint.skip_to(20);
        assert_eq!(checkpoint.committed(), Some(20));
        checkpoint.skip_to(15);
        assert_eq!(checkpoint.committed(), Some(20));
    }

    #[test]
    fn test_pushed_ids_below_cursor_still_run() {
        let checkpoint = Checkpoint::default();
        assert!(checkpoint.begin_pushed(5));
        assert_eq!(checkpoint.complete(5), Some(5));

        assert!(checkpoint.begin_pushed(4));
        assert!(!checkpoint.begin_pushed(4));
        assert_eq!(checkpoint.complete(4), None);
        assert_eq!(checkpoint.committed(), Some(5));

        assert!(!checkpoint.begin_pushed(5));
        assert!(!checkpoint.begin_pushed(4));
    }

    #[test]
    fn test_pushed_window_forgets_oldest() {
        let checkpoint = Checkpoint::default();
        for id in 0..=RECENT_WINDOW as i64 {
            assert!(checkpoint.begin_pushed(id));
            checkpoint.complete(id);
        }
        assert!(!checkpoint.begin_pushed(1));
        assert!(checkpoint.begin_pushed(0));
    }
}

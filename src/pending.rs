use std::sync::atomic::{AtomicUsize, Ordering};

use antidote::Mutex;
use chrono::{DateTime, Duration, Utc};
use hashbrown::HashMap;
use uuid::Uuid;

use crate::actions::Action;
use crate::clock::AbsoluteTimestamp;
use crate::features::StateVector;

/// A decision that has been handed out and is waiting for feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecommendation {
    pub id: Uuid,
    pub user_id: String,
    pub action: Action,
    /// The exact state the decision was made on.
    pub state: StateVector,
    pub created_at: AbsoluteTimestamp,
    pub expires_at: AbsoluteTimestamp,
}

impl PendingRecommendation {
    pub fn new(
        user_id: String,
        action: Action,
        state: StateVector,
        created_at: AbsoluteTimestamp,
        window: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            action,
            state,
            created_at,
            // Past the end of representable time the entry simply never expires.
            expires_at: created_at
                .checked_add_signed(window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: AbsoluteTimestamp) -> bool {
        self.expires_at <= now
    }
}

/// Outstanding decisions keyed by correlation id.
///
/// Entries are never updated in place. The only way out is `pop_if_present`,
/// which both the feedback path and the sweeper go through, so each entry is
/// resolved exactly once.
pub struct PendingStore {
    entries: Mutex<HashMap<Uuid, PendingRecommendation>>,
    // Kept outside the lock for statistics.
    num_inserted: AtomicUsize,
    num_resolved: AtomicUsize,
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            num_inserted: AtomicUsize::new(0),
            num_resolved: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, recommendation: PendingRecommendation) {
        let previous = self
            .entries
            .lock()
            .insert(recommendation.id, recommendation);
        debug_assert!(previous.is_none(), "correlation id collision");
        self.num_inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically removes and returns the entry, if it is still there.
    pub fn pop_if_present(&self, id: &Uuid) -> Option<PendingRecommendation> {
        let popped = self.entries.lock().remove(id);
        if popped.is_some() {
            self.num_resolved.fetch_add(1, Ordering::Relaxed);
        }
        popped
    }

    /// Point-in-time copy of every outstanding entry.
    pub fn snapshot_all(&self) -> Vec<PendingRecommendation> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<PendingRecommendation> {
        self.entries.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_inserted(&self) -> usize {
        self.num_inserted.load(Ordering::Relaxed)
    }

    pub fn num_resolved(&self) -> usize {
        self.num_resolved.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::clock::ClockManager;

    fn recommendation(window_hours: f64) -> PendingRecommendation {
        PendingRecommendation::new(
            "learner-1".to_string(),
            Action::BadgeInjection,
            StateVector::from_element(0.5),
            ClockManager::utc_now(),
            ClockManager::hours(window_hours),
        )
    }

    #[test]
    fn expiry_is_created_plus_window() {
        let rec = recommendation(12.0);
        assert_eq!(rec.expires_at - rec.created_at, Duration::hours(12));
        assert!(!rec.is_expired(rec.created_at));
        assert!(rec.is_expired(rec.expires_at));
    }

    #[test]
    fn unrepresentable_deadline_saturates() {
        let rec = PendingRecommendation::new(
            "learner-1".to_string(),
            Action::StandardXp,
            StateVector::from_element(0.5),
            DateTime::<Utc>::MAX_UTC - Duration::hours(1),
            Duration::hours(2),
        );
        assert_eq!(rec.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!rec.is_expired(ClockManager::utc_now()));
    }

    #[test]
    fn ids_are_unique() {
        let a = recommendation(1.0);
        let b = recommendation(1.0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn pop_returns_the_entry_once() {
        let store = PendingStore::new();
        let rec = recommendation(1.0);
        let id = rec.id;
        store.insert(rec.clone());
        assert!(store.contains(&id));
        assert_eq!(store.get(&id), Some(rec.clone()));

        assert_eq!(store.pop_if_present(&id), Some(rec));
        assert_eq!(store.pop_if_present(&id), None);
        assert!(store.is_empty());
        assert_eq!(store.num_inserted(), 1);
        assert_eq!(store.num_resolved(), 1);
    }

    #[test]
    fn snapshot_is_not_a_live_view() {
        let store = PendingStore::new();
        let first = recommendation(1.0);
        store.insert(first.clone());
        let snapshot = store.snapshot_all();
        store.pop_if_present(&first.id);
        store.insert(recommendation(1.0));
        assert_eq!(snapshot, vec![first]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn racing_pops_see_exactly_one_winner() {
        let store = PendingStore::new();
        for _ in 0..50 {
            let rec = recommendation(1.0);
            let id = rec.id;
            store.insert(rec);

            let barrier = Barrier::new(8);
            let winners = thread::scope(|s| {
                let handles = (0..8)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            store.pop_if_present(&id).is_some()
                        })
                    })
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .filter(|won| *won)
                    .count()
            });
            assert_eq!(winners, 1);
        }
        assert_eq!(store.num_resolved(), 50);
    }
}

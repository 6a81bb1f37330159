use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::agent::UpdateReason;
use crate::clock::{AbsoluteTimestamp, ClockManager};
use crate::coach::Coach;
use crate::pending::PendingRecommendation;

/// What one sweep cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries in the snapshot.
    pub scanned: usize,
    /// Overdue entries we actually popped. Entries resolved by feedback
    /// between the snapshot and the pop are not counted.
    pub expired: usize,
    /// Expirations that led to a training pass.
    pub trained: usize,
    /// Expirations whose resolution panicked. They are dropped.
    pub failed: usize,
}

/// Resolves one expired entry; returns whether training ran.
pub type Resolver = Arc<dyn Fn(&PendingRecommendation) -> bool + Send + Sync>;

/// Periodically penalizes decisions whose feedback never arrived.
#[derive(Clone)]
pub struct ExpirySweeper {
    coach: Arc<Coach>,
    interval: Duration,
    resolve: Resolver,
}

impl ExpirySweeper {
    /// Expired entries are fed to the coach with the configured timeout penalty.
    pub fn new(coach: Arc<Coach>) -> Self {
        let interval = coach.config().loop_interval();
        let penalty = coach.config().timeout_penalty;
        let learner = Arc::clone(&coach);
        let resolve: Resolver = Arc::new(move |expired: &PendingRecommendation| {
            learner.apply_update(expired, penalty, UpdateReason::Timeout)
        });
        Self {
            coach,
            interval,
            resolve,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replaces what happens to an expired entry once it has been popped.
    pub fn with_resolver(mut self, resolve: Resolver) -> Self {
        self.resolve = resolve;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Expires every pending entry whose deadline is at or before `now`.
    /// A resolution that panics is logged and skipped; the rest of the
    /// cycle goes on.
    pub fn sweep_once(&self, now: AbsoluteTimestamp) -> SweepReport {
        let pending = self.coach.pending();
        let snapshot = pending.snapshot_all();

        let mut report = SweepReport {
            scanned: snapshot.len(),
            ..Default::default()
        };
        for entry in snapshot.iter().filter(|e| e.is_expired(now)) {
            // Feedback may have won the race since the snapshot.
            let Some(expired) = pending.pop_if_present(&entry.id) else {
                continue;
            };
            report.expired += 1;
            log::info!(
                "[SWEEPER] Recommendation {} for user {} expired at {}",
                expired.id,
                expired.user_id,
                expired.expires_at
            );
            match panic::catch_unwind(AssertUnwindSafe(|| (self.resolve)(&expired))) {
                Ok(true) => report.trained += 1,
                Ok(false) => {}
                Err(cause) => {
                    report.failed += 1;
                    log::error!(
                        "[SWEEPER] Resolving {} failed: {}",
                        expired.id,
                        panic_message(cause.as_ref())
                    );
                }
            }
        }
        report
    }

    /// Runs the sweeper on the current Tokio runtime until the returned
    /// handle is shut down.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        SweeperHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "[SWEEPER] Started, checking for expired recommendations every {:?}",
            self.interval
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                // Either an explicit shutdown or the handle was dropped.
                _ = shutdown.changed() => break,
            }

            let sweeper = self.clone();
            let cycle =
                tokio::task::spawn_blocking(move || sweeper.sweep_once(ClockManager::utc_now()));
            match cycle.await {
                Ok(report) if report.expired > 0 => log::info!(
                    "[SWEEPER] Expired {} of {} pending recommendations ({} trained, {} failed)",
                    report.expired,
                    report.scanned,
                    report.trained,
                    report.failed
                ),
                Ok(_) => {}
                // A failing cycle must not take the sweeper down with it.
                Err(e) => log::error!("[SWEEPER] Sweep cycle failed: {}", e),
            }
        }
        log::info!("[SWEEPER] Stopped");
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = cause.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = cause.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// Controls a running sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the loop and waits for an in-flight cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("[SWEEPER] Sweeper task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::coach::tests::{request, test_coach};
    use crate::config::CoachConfig;

    fn coach_with_batch(batch_size: usize, timeout_hours: f64) -> Arc<Coach> {
        let config = CoachConfig {
            batch_size,
            timeout_hours,
            ..Default::default()
        };
        Arc::new(test_coach(0.2, config, None))
    }

    #[test]
    fn expired_entries_are_penalized_once() {
        let coach = coach_with_batch(32, 12.0);
        let now = ClockManager::utc_now();
        let old = coach
            .recommend_at(&request(), now - ChronoDuration::hours(13))
            .unwrap();
        let fresh = coach.recommend_at(&request(), now).unwrap();

        let sweeper = ExpirySweeper::new(coach.clone());
        let report = sweeper.sweep_once(now);
        assert_eq!(
            report,
            SweepReport {
                scanned: 2,
                expired: 1,
                trained: 0,
                failed: 0
            }
        );
        assert!(!coach.pending().contains(&old.recommendation_id));
        assert!(coach.pending().contains(&fresh.recommendation_id));

        let learning = coach.learning();
        let penalized = learning.memory().iter().last().unwrap();
        assert_eq!(penalized.reward, -2.0);
        assert_eq!(penalized.action, old.recommendation.action_id);
        drop(learning);

        assert_eq!(sweeper.sweep_once(now).expired, 0);
        assert_eq!(coach.learning().memory().len(), 1);
    }

    #[test]
    fn deadline_is_inclusive() {
        let coach = coach_with_batch(32, 1.0);
        let now = ClockManager::utc_now();
        let rec = coach.recommend_at(&request(), now).unwrap();
        let sweeper = ExpirySweeper::new(coach.clone());
        assert_eq!(sweeper.sweep_once(rec.expires_at - ChronoDuration::milliseconds(1)).expired, 0);
        assert_eq!(sweeper.sweep_once(rec.expires_at).expired, 1);
    }

    #[test]
    fn feedback_and_expiry_never_double_resolve() {
        let coach = coach_with_batch(4, 12.0);
        let now = ClockManager::utc_now();
        let ids = (0..64)
            .map(|_| {
                coach
                    .recommend_at(&request(), now - ChronoDuration::hours(24))
                    .unwrap()
                    .recommendation_id
                    .to_string()
            })
            .collect::<Vec<_>>();

        let sweeper = ExpirySweeper::new(coach.clone());
        let (by_feedback, by_sweeper) = thread::scope(|s| {
            let feedback = s.spawn(|| {
                ids.iter()
                    .filter(|id| coach.feedback(id, true).is_ok())
                    .count()
            });
            let sweep = s.spawn(|| sweeper.sweep_once(now).expired);
            (feedback.join().unwrap(), sweep.join().unwrap())
        });

        assert_eq!(by_feedback + by_sweeper, ids.len());
        assert!(coach.pending().is_empty());
        assert_eq!(coach.learning().memory().len(), ids.len());
    }

    #[tokio::test]
    async fn background_loop_expires_and_stops() {
        // A few milliseconds of window.
        let coach = coach_with_batch(32, 0.000_001);
        let rec = coach.recommend(&request()).unwrap();

        let handle = ExpirySweeper::new(coach.clone())
            .with_interval(Duration::from_millis(10))
            .spawn();

        let mut waited = Duration::ZERO;
        while coach.pending().contains(&rec.recommendation_id) && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert!(!coach.pending().contains(&rec.recommendation_id));
        assert_eq!(coach.learning().memory().len(), 1);

        handle.shutdown().await;
    }

    /// Resolver that panics on the first call and counts the ones after it.
    fn flaky_resolver(calls: Arc<AtomicUsize>) -> Resolver {
        Arc::new(move |_: &PendingRecommendation| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("resolution failed");
            }
            false
        })
    }

    #[test]
    fn one_failing_resolution_does_not_stop_the_cycle() {
        let coach = coach_with_batch(32, 12.0);
        let now = ClockManager::utc_now();
        for _ in 0..5 {
            coach
                .recommend_at(&request(), now - ChronoDuration::hours(13))
                .unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let sweeper = ExpirySweeper::new(coach.clone()).with_resolver(flaky_resolver(calls.clone()));
        let report = sweeper.sweep_once(now);

        assert_eq!(report.expired, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(coach.pending().is_empty());
    }

    #[tokio::test]
    async fn background_loop_survives_a_failing_resolution() {
        let coach = coach_with_batch(32, 12.0);
        let now = ClockManager::utc_now();
        coach
            .recommend_at(&request(), now - ChronoDuration::hours(13))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let handle = ExpirySweeper::new(coach.clone())
            .with_interval(Duration::from_millis(10))
            .with_resolver(flaky_resolver(calls.clone()))
            .spawn();

        let mut waited = Duration::ZERO;
        while calls.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Entries that expire after the failure are still picked up.
        let later = coach
            .recommend_at(&request(), ClockManager::utc_now() - ChronoDuration::hours(13))
            .unwrap();
        let mut waited = Duration::ZERO;
        while calls.load(Ordering::SeqCst) < 2 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!coach.pending().contains(&later.recommendation_id));
        assert!(!handle.is_finished());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_for_the_next_tick() {
        let coach = coach_with_batch(32, 12.0);
        let handle = ExpirySweeper::new(coach)
            .with_interval(Duration::from_secs(3600))
            .spawn();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("sweeper did not stop");
    }
}

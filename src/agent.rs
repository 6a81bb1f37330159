use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::actions::{Action, NUM_ACTIONS};
use crate::approximator::{QVector, ValueApproximator, DEFAULT_LEARNING_RATE};
use crate::checkpoint::{Checkpoint, CheckpointStore, DEFAULT_CHECKPOINT_MEMORY};
use crate::clock::ClockManager;
use crate::error::CheckpointError;
use crate::features::StateVector;
use crate::policy::{
    EpsilonGreedyPolicy, Selection, DEFAULT_EPSILON, DEFAULT_EPSILON_DECAY, DEFAULT_EPSILON_MIN,
};
use crate::replay::{ReplayBuffer, Transition, DEFAULT_MEMORY_CAPACITY};

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_AUTO_SAVE_INTERVAL: u64 = 50;

/// Hyper-parameters of the learning loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningSettings {
    pub batch_size: usize,
    pub memory_capacity: usize,
    /// How many of the most recent transitions go into a checkpoint.
    pub checkpoint_memory: usize,
    /// Save a checkpoint every this many successful trainings. 0 disables auto-save.
    pub auto_save_interval: u64,
    pub epsilon: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    pub learning_rate: f64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            checkpoint_memory: DEFAULT_CHECKPOINT_MEMORY,
            auto_save_interval: DEFAULT_AUTO_SAVE_INTERVAL,
            epsilon: DEFAULT_EPSILON,
            epsilon_min: DEFAULT_EPSILON_MIN,
            epsilon_decay: DEFAULT_EPSILON_DECAY,
            learning_rate: DEFAULT_LEARNING_RATE,
        }
    }
}

/// Why a transition is being learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    Feedback,
    Timeout,
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateReason::Feedback => write!(f, "feedback"),
            UpdateReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// A checkpoint that fell due during an update. Taken while the learning
/// loop is locked, written once the lock has been released.
pub struct AutoSave<S> {
    store: CheckpointStore,
    checkpoint: Checkpoint<S>,
}

impl<S: Serialize> AutoSave<S> {
    pub fn snapshot(&self) -> &Checkpoint<S> {
        &self.checkpoint
    }

    pub fn write(self) -> Result<(), CheckpointError> {
        if self.store.save(&self.checkpoint)? {
            log::info!(
                "[RL] Auto-saved checkpoint after {} updates to {}",
                self.checkpoint.training_updates,
                self.store.path().display()
            );
        }
        Ok(())
    }
}

/// What `LearningLoop::apply_update` did.
#[must_use = "a due checkpoint is only written by `finish`"]
pub struct Update<S> {
    pub trained: bool,
    pub auto_save: Option<AutoSave<S>>,
}

impl<S: Serialize> Update<S> {
    /// Writes the due checkpoint, if any, and reports whether training ran.
    /// A failed save is logged; the model carries on in memory.
    pub fn finish(self) -> bool {
        if let Some(auto_save) = self.auto_save {
            if let Err(err) = auto_save.write() {
                log::warn!("[RL] Auto-save failed: {}", err);
            }
        }
        self.trained
    }
}

/// Owns the value function, the exploration rate and the replay memory,
/// and is the only thing allowed to mutate them. It is not synchronized
/// itself; callers keep it behind a single lock.
///
/// Every recommendation is a one-step episode, so training regresses the
/// chosen action's value directly onto the observed reward. There is no
/// bootstrapped next-state term.
pub struct LearningLoop<A: ValueApproximator> {
    approximator: A,
    policy: EpsilonGreedyPolicy,
    memory: ReplayBuffer,
    settings: LearningSettings,
    /// Successful trainings since the process started.
    training_updates: u64,
    store: Option<CheckpointStore>,
    rng: StdRng,
}

impl<A: ValueApproximator> LearningLoop<A> {
    pub fn new(approximator: A, settings: LearningSettings, store: Option<CheckpointStore>) -> Self {
        let policy = EpsilonGreedyPolicy::new(
            settings.epsilon,
            settings.epsilon_min,
            settings.epsilon_decay,
        );
        let memory = ReplayBuffer::new(settings.memory_capacity);
        Self {
            approximator,
            policy,
            memory,
            settings,
            training_updates: 0,
            store,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replaces the entropy-seeded RNG, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn settings(&self) -> &LearningSettings {
        &self.settings
    }

    pub fn epsilon(&self) -> f64 {
        self.policy.epsilon()
    }

    /// Overrides exploration, e.g. to pin a test to pure exploitation.
    pub fn set_epsilon(&mut self, epsilon: f64) {
        self.policy.set_epsilon(epsilon);
    }

    pub fn memory(&self) -> &ReplayBuffer {
        &self.memory
    }

    pub fn training_updates(&self) -> u64 {
        self.training_updates
    }

    pub fn store(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    pub fn select(&mut self, state: &StateVector, risk_score: f64) -> Selection {
        self.policy
            .select(&self.approximator, state, risk_score, &mut self.rng)
    }

    pub fn q_values(&self, state: &StateVector) -> QVector {
        self.approximator.predict(state)
    }

    pub fn remember(&mut self, transition: Transition) {
        self.memory.remember(transition);
    }

    /// One replay pass over `batch_size` random transitions followed by one
    /// epsilon decay. Returns false, without touching anything, if the memory
    /// does not hold a full batch yet.
    pub fn train(&mut self, batch_size: usize) -> bool {
        let batch = match self.memory.sample(batch_size, &mut self.rng) {
            Some(batch) => batch.into_iter().cloned().collect::<Vec<_>>(),
            None => return false,
        };
        let mut total_loss = 0.0;
        for transition in &batch {
            // Terminal transitions: the target is the reward itself.
            let target = transition.reward;
            total_loss += self
                .approximator
                .train_step(&transition.state, transition.action, target);
        }
        self.policy.decay();
        log::debug!(
            "[RL] Trained on {} transitions, mean loss {:.5}, epsilon {:.4}",
            batch.len(),
            total_loss / batch.len().max(1) as f64,
            self.policy.epsilon()
        );
        true
    }

    /// Records the outcome of a decision and trains on the replay memory.
    /// Every `auto_save_interval` successful trainings a checkpoint falls due.
    /// It is handed back instead of written, so the caller can release its
    /// lock before `Update::finish` touches the disk.
    pub fn apply_update(
        &mut self,
        state: StateVector,
        action: Action,
        reward: f64,
        reason: UpdateReason,
    ) -> Update<A::Snapshot> {
        self.remember(Transition::terminal(state, action.id(), reward));
        let trained = self.train(self.settings.batch_size);
        log::info!(
            "[RL] Update ({}) -> action={} reward={} trained={}",
            reason,
            action,
            reward,
            trained
        );

        let mut auto_save = None;
        if trained {
            self.training_updates += 1;
            let interval = self.settings.auto_save_interval;
            if interval > 0 && self.training_updates % interval == 0 {
                auto_save = self.store.clone().map(|store| AutoSave {
                    store,
                    checkpoint: self.checkpoint(),
                });
            }
        }
        Update { trained, auto_save }
    }

    pub fn checkpoint(&self) -> Checkpoint<A::Snapshot> {
        Checkpoint {
            approximator: self.approximator.snapshot(),
            epsilon: self.policy.epsilon(),
            memory: self.memory.recent(self.settings.checkpoint_memory),
            training_updates: self.training_updates,
            saved_at: ClockManager::utc_now(),
        }
    }

    /// Adopts a checkpoint. It is validated first, so a rejected checkpoint
    /// leaves the current parameters, epsilon and memory as they were.
    pub fn restore(&mut self, checkpoint: Checkpoint<A::Snapshot>) -> Result<(), CheckpointError> {
        let Checkpoint {
            approximator,
            epsilon,
            memory,
            training_updates,
            ..
        } = checkpoint;

        if !epsilon.is_finite() || !(0.0..=1.0).contains(&epsilon) {
            return Err(CheckpointError::Shape(format!("epsilon {} outside [0, 1]", epsilon)));
        }
        if let Some(bad) = memory.iter().find(|t| t.action >= NUM_ACTIONS) {
            return Err(CheckpointError::Shape(format!(
                "transition with unknown action {}",
                bad.action
            )));
        }
        self.approximator.restore(approximator)?;

        self.policy.set_epsilon(epsilon);
        self.memory.clear();
        for transition in memory {
            self.memory.remember(transition);
        }
        self.training_updates = training_updates;
        Ok(())
    }

    pub fn save_checkpoint(&self) -> Result<(), CheckpointError> {
        let store = self.store.as_ref().ok_or(CheckpointError::NoStore)?;
        if store.save(&self.checkpoint())? {
            log::info!("[CHECKPOINT] Saved checkpoint to {}", store.path().display());
        }
        Ok(())
    }

    /// Loads the configured checkpoint, if there is one. Returns whether
    /// anything was loaded.
    pub fn load_checkpoint(&mut self) -> Result<bool, CheckpointError> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(false),
        };
        match store.load::<A::Snapshot>()? {
            Some(checkpoint) => {
                self.restore(checkpoint)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approximator::{MlpApproximator, MlpSnapshot};

    fn settings() -> LearningSettings {
        LearningSettings {
            batch_size: 4,
            memory_capacity: 16,
            checkpoint_memory: 5,
            auto_save_interval: 3,
            epsilon: 0.5,
            epsilon_min: 0.1,
            epsilon_decay: 0.5,
            learning_rate: 0.01,
        }
    }

    fn learner(store: Option<CheckpointStore>) -> LearningLoop<MlpApproximator> {
        LearningLoop::new(MlpApproximator::with_seed(0.01, 17), settings(), store).with_seed(17)
    }

    fn state(x: f64) -> StateVector {
        StateVector::from_element(x)
    }

    #[test]
    fn train_is_a_noop_below_batch_size() {
        let mut agent = learner(None);
        for _ in 0..3 {
            agent.remember(Transition::terminal(state(0.1), 0, 1.0));
        }
        let before = agent.q_values(&state(0.1));
        assert!(!agent.train(4));
        assert_eq!(agent.epsilon(), 0.5);
        assert_eq!(agent.q_values(&state(0.1)), before);
    }

    #[test]
    fn training_decays_epsilon_once_per_batch() {
        let mut agent = learner(None);
        for _ in 0..4 {
            agent.remember(Transition::terminal(state(0.1), 0, 1.0));
        }
        assert!(agent.train(4));
        assert_eq!(agent.epsilon(), 0.25);
        assert!(agent.train(4));
        assert!(agent.train(4));
        assert_eq!(agent.epsilon(), 0.1);
    }

    #[test]
    fn targets_are_rewards_without_bootstrapping() {
        let mut agent = learner(None);
        let s = state(0.3);
        for _ in 0..8 {
            agent.remember(Transition::terminal(s, 2, -2.0));
        }
        for _ in 0..300 {
            agent.train(4);
        }
        // Converges on the reward itself, not reward + gamma * max Q.
        let q = agent.q_values(&s)[2];
        assert!((q + 2.0).abs() < 0.2, "q = {}", q);
    }

    #[test]
    fn apply_update_counts_only_successful_trainings() {
        let mut agent = learner(None);
        for i in 0..3 {
            let update = agent.apply_update(state(0.2), Action::BadgeInjection, 0.8, UpdateReason::Feedback);
            assert!(!update.finish());
            assert_eq!(agent.memory().len(), i + 1);
        }
        assert_eq!(agent.training_updates(), 0);
        let update = agent.apply_update(state(0.2), Action::BadgeInjection, 0.8, UpdateReason::Feedback);
        assert!(update.finish());
        assert_eq!(agent.training_updates(), 1);

        let last = agent.memory().iter().last().unwrap();
        assert_eq!(last.action, Action::BadgeInjection.id());
        assert!(last.terminal);
    }

    #[test]
    fn auto_save_falls_due_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("agent.json"));
        let mut agent = learner(Some(store.clone()));

        for _ in 0..3 {
            agent.remember(Transition::terminal(state(0.4), 1, 0.8));
        }
        // Trainings 1 and 2 do not save, training 3 does.
        for _ in 0..2 {
            let update = agent.apply_update(state(0.4), Action::MultiplierBoost, 0.8, UpdateReason::Feedback);
            assert!(update.auto_save.is_none());
            assert!(update.finish());
        }
        assert!(!store.exists());

        let update = agent.apply_update(state(0.4), Action::MultiplierBoost, -2.0, UpdateReason::Timeout);
        let due = update.auto_save.as_ref().expect("checkpoint due");
        assert_eq!(due.snapshot().training_updates, 3);
        // Nothing touches the disk until the update is finished.
        assert!(!store.exists());
        assert!(update.finish());
        assert!(store.exists());

        let saved = store.load::<MlpSnapshot>().unwrap().unwrap();
        assert_eq!(saved.training_updates, 3);
        assert_eq!(saved.memory.len(), 5);
        assert_eq!(saved.memory.last().unwrap().reward, -2.0);
    }

    #[test]
    fn failed_auto_save_keeps_learning_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        // The checkpoint's parent is a regular file, so every save fails.
        let store = CheckpointStore::new(blocker.join("agent.json"));
        let mut agent = learner(Some(store.clone()));

        for _ in 0..3 {
            agent.remember(Transition::terminal(state(0.4), 1, 0.8));
        }
        let trained = (0..3)
            .map(|_| {
                agent
                    .apply_update(state(0.4), Action::ExtraGoals, 0.8, UpdateReason::Feedback)
                    .finish()
            })
            .collect::<Vec<_>>();

        assert_eq!(trained, vec![true, true, true]);
        assert_eq!(agent.training_updates(), 3);
        assert_eq!(agent.memory().len(), 6);
        assert_eq!(agent.memory().iter().last().unwrap().action, Action::ExtraGoals.id());
        assert!(!store.exists());
        assert!(matches!(agent.save_checkpoint(), Err(CheckpointError::Io(_))));

        let update = agent.apply_update(state(0.4), Action::ExtraGoals, 0.8, UpdateReason::Feedback);
        assert!(update.finish());
        assert_eq!(agent.training_updates(), 4);
    }

    #[test]
    fn checkpoint_round_trip_restores_learning_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("agent.json"));
        let mut agent = learner(Some(store.clone()));
        for i in 0..10 {
            let _ = agent
                .apply_update(state(0.1 * i as f64), Action::ExtraGoals, 0.8, UpdateReason::Feedback)
                .finish();
        }
        agent.save_checkpoint().unwrap();

        let mut restored = LearningLoop::new(MlpApproximator::with_seed(0.01, 99), settings(), Some(store));
        assert!(restored.load_checkpoint().unwrap());
        assert_eq!(restored.epsilon(), agent.epsilon());
        assert_eq!(restored.memory().len(), 5);
        assert_eq!(restored.q_values(&state(0.5)), agent.q_values(&state(0.5)));
    }

    #[test]
    fn bad_checkpoint_keeps_current_state() {
        let mut agent = learner(None);
        let before = agent.q_values(&state(0.5));
        let mut checkpoint = agent.checkpoint();
        checkpoint.epsilon = 3.0;
        assert!(agent.restore(checkpoint).is_err());

        let mut checkpoint = agent.checkpoint();
        checkpoint.memory.push(Transition::terminal(state(0.5), NUM_ACTIONS, 1.0));
        assert!(agent.restore(checkpoint).is_err());

        assert_eq!(agent.epsilon(), 0.5);
        assert_eq!(agent.q_values(&state(0.5)), before);
    }

    #[test]
    fn missing_store_reports_no_store() {
        let mut agent = learner(None);
        assert!(matches!(agent.save_checkpoint(), Err(CheckpointError::NoStore)));
        assert!(!agent.load_checkpoint().unwrap());
    }
}

use rand::Rng;

use crate::actions::{Action, NUM_ACTIONS};
use crate::approximator::{QVector, ValueApproximator};
use crate::features::StateVector;
use crate::risk::HIGH_RISK_THRESHOLD;

pub const DEFAULT_EPSILON: f64 = 0.01;
pub const DEFAULT_EPSILON_MIN: f64 = 0.01;
pub const DEFAULT_EPSILON_DECAY: f64 = 0.995;

/// Outcome of one action selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub action: Action,
    /// Chosen at random rather than by value.
    pub explored: bool,
    /// The comparison action was replaced by the low-risk fallback.
    pub overridden: bool,
}

/// Epsilon-greedy policy chooses the "best" action with
/// probability 1-eps and a random action with probability eps.
/// Epsilon decays after every training batch and never grows
/// again, except when a checkpoint is loaded.
#[derive(Debug, Clone)]
pub struct EpsilonGreedyPolicy {
    epsilon: f64,
    epsilon_min: f64,
    epsilon_decay: f64,
    num_actions: usize,
}

impl Default for EpsilonGreedyPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON, DEFAULT_EPSILON_MIN, DEFAULT_EPSILON_DECAY)
    }
}

impl EpsilonGreedyPolicy {
    pub fn new(epsilon: f64, epsilon_min: f64, epsilon_decay: f64) -> Self {
        Self {
            epsilon,
            epsilon_min,
            epsilon_decay,
            num_actions: NUM_ACTIONS,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn set_epsilon(&mut self, epsilon: f64) {
        self.epsilon = epsilon;
    }

    /// One decay step, floored at `epsilon_min`.
    pub fn decay(&mut self) {
        if self.epsilon > self.epsilon_min {
            self.epsilon = (self.epsilon * self.epsilon_decay).max(self.epsilon_min);
        }
    }

    /// Picks an action for `state`. The value function is only consulted
    /// when exploiting.
    pub fn select<A, R>(
        &self,
        approximator: &A,
        state: &StateVector,
        risk_score: f64,
        rng: &mut R,
    ) -> Selection
    where
        A: ValueApproximator + ?Sized,
        R: Rng,
    {
        let explored = self.epsilon > 0.0 && rng.gen::<f64>() <= self.epsilon;
        let chosen = if explored {
            Action::ALL[rng.gen_range(0..self.num_actions)]
        } else {
            greedy_action(&approximator.predict(state))
        };
        let action = safety_override(chosen, risk_score);
        Selection {
            action,
            explored,
            overridden: action != chosen,
        }
    }
}

/// Argmax over the Q-values; ties go to the lowest action id.
pub fn greedy_action(q_row: &QVector) -> Action {
    let mut best = 0;
    for (action, value) in q_row.iter().enumerate().take(NUM_ACTIONS) {
        if *value > q_row[best] {
            best = action;
        }
    }
    Action::ALL[best]
}

/// Learners at high risk never get compared against their peers.
pub fn safety_override(action: Action, risk_score: f64) -> Action {
    if action == Action::COMPARISON && risk_score > HIGH_RISK_THRESHOLD {
        Action::LOW_RISK_FALLBACK
    } else {
        action
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::actions::ActionId;
    use crate::error::CheckpointError;

    /// Value function with fixed outputs.
    struct FixedValues(QVector);

    impl ValueApproximator for FixedValues {
        type Snapshot = Vec<f64>;

        fn predict(&self, _state: &StateVector) -> QVector {
            self.0.clone()
        }

        fn train_step(&mut self, _state: &StateVector, _action: ActionId, _target: f64) -> f64 {
            0.0
        }

        fn snapshot(&self) -> Vec<f64> {
            self.0.iter().copied().collect()
        }

        fn restore(&mut self, snapshot: Vec<f64>) -> Result<(), CheckpointError> {
            self.0 = QVector::from_vec(snapshot);
            Ok(())
        }
    }

    fn values(v: [f64; NUM_ACTIONS]) -> FixedValues {
        FixedValues(QVector::from_column_slice(&v))
    }

    #[test]
    fn greedy_ties_go_to_lowest_id() {
        let q = QVector::from_column_slice(&[1.0, 3.0, 3.0, 0.0, 3.0]);
        assert_eq!(greedy_action(&q), Action::MultiplierBoost);
        let q = QVector::from_column_slice(&[0.0; NUM_ACTIONS]);
        assert_eq!(greedy_action(&q), Action::StandardXp);
    }

    #[test]
    fn zero_epsilon_exploits_deterministically() {
        let policy = EpsilonGreedyPolicy::new(0.0, 0.0, 0.995);
        let approx = values([0.1, -0.4, 0.9, 0.3, 0.2]);
        let state = StateVector::zeros();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let selection = policy.select(&approx, &state, 0.9, &mut rng);
            assert_eq!(selection.action, Action::BadgeInjection);
            assert!(!selection.explored && !selection.overridden);
        }
    }

    #[test]
    fn high_risk_never_sees_comparison() {
        let approx = values([0.0, 0.0, 0.0, 5.0, 0.0]);
        let state = StateVector::zeros();
        let mut rng = StdRng::seed_from_u64(2);
        for epsilon in [0.0, 0.3, 1.0] {
            let policy = EpsilonGreedyPolicy::new(epsilon, 0.0, 1.0);
            for _ in 0..200 {
                let selection = policy.select(&approx, &state, 0.61, &mut rng);
                assert_ne!(selection.action, Action::RankComparison);
            }
        }

        let greedy = EpsilonGreedyPolicy::new(0.0, 0.0, 1.0);
        let selection = greedy.select(&approx, &state, 0.75, &mut rng);
        assert_eq!(selection.action, Action::ExtraGoals);
        assert!(selection.overridden);
    }

    #[test]
    fn comparison_allowed_at_threshold() {
        let approx = values([0.0, 0.0, 0.0, 5.0, 0.0]);
        let policy = EpsilonGreedyPolicy::new(0.0, 0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(3);
        let selection = policy.select(&approx, &StateVector::zeros(), 0.6, &mut rng);
        assert_eq!(selection.action, Action::RankComparison);
    }

    #[test]
    fn full_exploration_covers_every_action() {
        let approx = values([9.0, 0.0, 0.0, 0.0, 0.0]);
        let policy = EpsilonGreedyPolicy::new(1.0, 0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(4);
        let mut seen = [false; NUM_ACTIONS];
        for _ in 0..500 {
            let selection = policy.select(&approx, &StateVector::zeros(), 0.0, &mut rng);
            assert!(selection.explored);
            seen[selection.action.id()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn decay_is_monotone_and_floored() {
        let mut policy = EpsilonGreedyPolicy::new(1.0, 0.05, 0.5);
        let mut last = policy.epsilon();
        for _ in 0..10 {
            policy.decay();
            assert!(policy.epsilon() <= last);
            last = policy.epsilon();
        }
        assert_eq!(policy.epsilon(), 0.05);

        let mut at_floor = EpsilonGreedyPolicy::default();
        at_floor.decay();
        assert_eq!(at_floor.epsilon(), DEFAULT_EPSILON_MIN);
    }
}

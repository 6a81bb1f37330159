use std::collections::VecDeque;

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::actions::ActionId;
use crate::features::StateVector;

pub const DEFAULT_MEMORY_CAPACITY: usize = 2000;

/// One recorded training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: StateVector,
    pub action: ActionId,
    pub reward: f64,
    pub next_state: StateVector,
    pub terminal: bool,
}

impl Transition {
    /// A recommendation is a one-step episode: it ends where it started.
    pub fn terminal(state: StateVector, action: ActionId, reward: f64) -> Self {
        Self {
            state,
            action,
            reward,
            next_state: state,
            terminal: true,
        }
    }
}

/// Bounded experience memory. Appending beyond capacity drops the oldest transition.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    memory: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "replay capacity must be positive");
        Self {
            memory: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn remember(&mut self, transition: Transition) {
        if self.memory.len() == self.capacity {
            self.memory.pop_front();
        }
        self.memory.push_back(transition);
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.memory.clear();
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.memory.iter()
    }

    /// `batch_size` distinct transitions drawn uniformly, or `None` if the
    /// buffer holds fewer than that.
    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Option<Vec<&Transition>> {
        if self.memory.len() < batch_size {
            return None;
        }
        let picked = index::sample(rng, self.memory.len(), batch_size)
            .into_iter()
            .map(|i| &self.memory[i])
            .collect();
        Some(picked)
    }

    /// The `k` most recent transitions, oldest first.
    pub fn recent(&self, k: usize) -> Vec<Transition> {
        let skip = self.memory.len().saturating_sub(k);
        self.memory.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn transition(reward: f64) -> Transition {
        Transition::terminal(StateVector::zeros(), 0, reward)
    }

    #[test]
    fn terminal_transitions_loop_back_to_their_state() {
        let state = StateVector::from_element(0.5);
        let t = Transition::terminal(state, 3, -2.0);
        assert!(t.terminal);
        assert_eq!(t.next_state, state);
    }

    #[test]
    fn never_exceeds_capacity_and_keeps_most_recent() {
        let capacity = 10;
        let mut buffer = ReplayBuffer::new(capacity);
        for i in 0..(capacity + 7) {
            buffer.remember(transition(i as f64));
            assert!(buffer.len() <= capacity);
        }
        assert_eq!(buffer.len(), capacity);
        let rewards = buffer.iter().map(|t| t.reward).collect::<Vec<_>>();
        let expected = (7..17).map(|i| i as f64).collect::<Vec<_>>();
        assert_eq!(rewards, expected);
    }

    #[test]
    fn sampling_needs_a_full_batch_and_draws_without_replacement() {
        let mut buffer = ReplayBuffer::new(100);
        let mut rng = StdRng::seed_from_u64(9);
        for i in 0..31 {
            buffer.remember(transition(i as f64));
        }
        assert!(buffer.sample(32, &mut rng).is_none());

        buffer.remember(transition(31.0));
        let batch = buffer.sample(32, &mut rng).unwrap();
        let mut rewards = batch.iter().map(|t| t.reward as i64).collect::<Vec<_>>();
        rewards.sort_unstable();
        assert_eq!(rewards, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn recent_truncates_from_the_front() {
        let mut buffer = ReplayBuffer::new(100);
        for i in 0..8 {
            buffer.remember(transition(i as f64));
        }
        let recent = buffer.recent(3);
        assert_eq!(
            recent.iter().map(|t| t.reward).collect::<Vec<_>>(),
            vec![5.0, 6.0, 7.0]
        );
        assert_eq!(buffer.recent(50).len(), 8);
    }
}

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;

pub const HIGH_RISK_THRESHOLD: f64 = 0.6;
pub const MEDIUM_RISK_THRESHOLD: f64 = 0.35;

/// Seed of the synthetic population the default risk model is fitted on.
pub const RISK_MODEL_SEED: u64 = 42;

const SYNTHETIC_SAMPLES: usize = 1000;
const HELD_OUT_FRACTION: f64 = 0.2;
const FIT_ITERATIONS: usize = 3000;
const FIT_LEARNING_RATE: f64 = 1.0;

/// Black-box churn estimator consulted for every decision.
pub trait RiskScorer: Send + Sync {
    /// Probability in [0, 1] that the learner stays engaged.
    fn retention_probability(&self, engagement: f64, reward_sensitivity: f64) -> f64;

    fn risk_score(&self, engagement: f64, reward_sensitivity: f64) -> f64 {
        1.0 - self.retention_probability(engagement, reward_sensitivity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(risk_score: f64) -> RiskLevel {
        if risk_score > HIGH_RISK_THRESHOLD {
            RiskLevel::High
        } else if risk_score > MEDIUM_RISK_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A labelled observation: `(engagement, reward_sensitivity)` and whether the learner was retained.
pub type RiskSample = ([f64; 2], bool);

/// Two-feature logistic regression over engagement and reward sensitivity.
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRiskModel {
    weights: [f64; 2],
    bias: f64,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl LogisticRiskModel {
    pub fn new(weights: [f64; 2], bias: f64) -> Self {
        Self { weights, bias }
    }

    pub fn weights(&self) -> [f64; 2] {
        self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// Fits the model on a synthetic population where retention is driven
    /// 60/40 by engagement and reward sensitivity plus Gaussian noise.
    /// Returns the model and its accuracy on the held-out split.
    pub fn fit_synthetic(seed: u64) -> (Self, f64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = synthetic_population(&mut rng, SYNTHETIC_SAMPLES);
        let split = ((1.0 - HELD_OUT_FRACTION) * samples.len() as f64).round() as usize;
        let (train, test) = samples.split_at(split);
        let model = Self::fit(train, 1.0);
        let accuracy = model.accuracy(test);
        (model, accuracy)
    }

    /// Batch gradient descent on the mean log-loss with an L2 penalty of
    /// `||w||^2 / (2 * c * n)`, i.e. inverse regularization strength `c`.
    pub fn fit(samples: &[RiskSample], c: f64) -> Self {
        let mut model = Self::new([0.0, 0.0], 0.0);
        if samples.is_empty() {
            return model;
        }
        let n = samples.len() as f64;
        for _ in 0..FIT_ITERATIONS {
            let mut grad_w = [0.0; 2];
            let mut grad_b = 0.0;
            for (x, retained) in samples {
                let label = if *retained { 1.0 } else { 0.0 };
                let err = model.retention_probability(x[0], x[1]) - label;
                grad_w[0] += err * x[0];
                grad_w[1] += err * x[1];
                grad_b += err;
            }
            for (w, g) in model.weights.iter_mut().zip(grad_w) {
                let penalty = *w / (c * n);
                *w -= FIT_LEARNING_RATE * (g / n + penalty);
            }
            model.bias -= FIT_LEARNING_RATE * grad_b / n;
        }
        model
    }

    /// Fraction of samples classified correctly at the 0.5 threshold.
    pub fn accuracy(&self, samples: &[RiskSample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let correct = samples
            .iter()
            .filter(|(x, retained)| (self.retention_probability(x[0], x[1]) > 0.5) == *retained)
            .count();
        correct as f64 / samples.len() as f64
    }
}

impl RiskScorer for LogisticRiskModel {
    fn retention_probability(&self, engagement: f64, reward_sensitivity: f64) -> f64 {
        sigmoid(self.weights[0] * engagement + self.weights[1] * reward_sensitivity + self.bias)
    }
}

fn synthetic_population<R: Rng>(rng: &mut R, n: usize) -> Vec<RiskSample> {
    let noise = Normal::new(0.0, 0.1).expect("constant standard deviation is valid");
    (0..n)
        .map(|_| {
            let engagement: f64 = rng.gen();
            let reward: f64 = rng.gen();
            let retention = 0.6 * engagement + 0.4 * reward + noise.sample(&mut *rng);
            ([engagement, reward], retention > 0.5)
        })
        .collect()
}

use nalgebra::SVector;
use serde::{Deserialize, Serialize};

pub const STATE_DIM: usize = 8;

/// Feature vector fed to the value function:
/// `[beginner, intermediate, expert, session, risk, quiz, streak, daily_xp]`.
pub type StateVector = SVector<f64, STATE_DIM>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Beginner,
    Intermediate,
    Expert,
}

impl Level {
    pub fn parse(level: &str) -> Option<Level> {
        match level {
            "Beginner" => Some(Level::Beginner),
            "Intermediate" => Some(Level::Intermediate),
            "Expert" => Some(Level::Expert),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Raw learner metrics with domain defaults already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerMetrics {
    /// Level tier as reported by the caller. Unknown tiers encode as all zeros.
    pub level: String,
    pub daily_xp: f64,
    pub active_minutes: f64,
    pub quiz_accuracy: f64,
    pub modules_done: f64,
    pub days_since_last_login: f64,
    pub recent_points: f64,
    pub total_badges: f64,
    /// Seconds.
    pub session_duration: f64,
    /// Percentage, 0-100.
    pub quiz_score: f64,
    pub consecutive_completions: f64,
}

impl Default for LearnerMetrics {
    fn default() -> Self {
        Self {
            level: "Beginner".to_string(),
            daily_xp: 0.0,
            active_minutes: 0.0,
            quiz_accuracy: 0.0,
            modules_done: 0.0,
            days_since_last_login: 0.0,
            recent_points: 0.0,
            total_badges: 0.0,
            session_duration: 0.0,
            quiz_score: 0.0,
            consecutive_completions: 1.0,
        }
    }
}

impl LearnerMetrics {
    /// Recency-decayed engagement in [0, 1].
    pub fn engagement(&self) -> f64 {
        let time_score = (self.active_minutes.max(0.0) / 60.0).min(1.0);
        let accuracy_score = self.quiz_accuracy.clamp(0.0, 1.0);
        let modules_score = if self.modules_done > 0.0 { 1.0 } else { 0.0 };
        let decay = (-0.5 * self.days_since_last_login.max(0.0)).exp();
        (0.5 * time_score + 0.3 * accuracy_score + 0.2 * modules_score) * decay
    }

    /// How responsive the learner has been to rewards so far, in [0, 1).
    pub fn reward_sensitivity(&self) -> f64 {
        let points_value = (self.recent_points.max(0.0) / 500.0).tanh();
        let badge_value = if self.total_badges > 0.0 { 1.0 } else { 0.0 };
        0.7 * points_value + 0.3 * badge_value
    }
}

/// Maps learner metrics plus the risk score into the fixed-length state vector.
pub fn build_state_vector(metrics: &LearnerMetrics, risk_score: f64) -> StateVector {
    let mut features = [0.0; STATE_DIM];
    if let Some(level) = Level::parse(&metrics.level) {
        features[level.index()] = 1.0;
    }
    features[3] = (metrics.session_duration.max(0.0) / 600.0).min(1.5);
    features[4] = risk_score.clamp(0.0, 1.0);
    features[5] = (metrics.quiz_score / 100.0).clamp(0.0, 1.0);
    features[6] = (metrics.consecutive_completions.max(0.0) / 10.0).min(1.0);
    // Saturating, deliberately not clamped.
    features[7] = (metrics.daily_xp / 500.0).tanh();
    StateVector::from_column_slice(&features)
}

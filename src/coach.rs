use std::collections::BTreeMap;

use antidote::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actions::{Action, ActionId, Audience, NUM_ACTIONS};
use crate::agent::{LearningLoop, UpdateReason};
use crate::approximator::MlpApproximator;
use crate::checkpoint::CheckpointStore;
use crate::clock::{AbsoluteTimestamp, ClockManager};
use crate::config::CoachConfig;
use crate::error::{CheckpointError, CoachError};
use crate::features::{build_state_vector, LearnerMetrics};
use crate::pending::{PendingRecommendation, PendingStore};
use crate::risk::{RiskLevel, RiskScorer};

/// Fields a decision request cannot do without.
pub const REQUIRED_FIELDS: [&str; 5] = [
    "user_id",
    "level",
    "active_minutes",
    "quiz_accuracy",
    "days_since_last_login",
];

/// A decision request as sent by clients. Everything is optional at the
/// wire level; `validate` enforces the required fields and applies defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecisionRequest {
    /// Echoed back verbatim; clients send both strings and numbers.
    pub user_id: Option<serde_json::Value>,
    pub level: Option<String>,
    pub daily_xp: Option<f64>,
    pub active_minutes: Option<f64>,
    pub quiz_accuracy: Option<f64>,
    pub modules_done: Option<f64>,
    pub days_since_last_login: Option<f64>,
    pub recent_points: Option<f64>,
    pub total_badges: Option<f64>,
    pub session_duration: Option<f64>,
    pub quiz_score: Option<f64>,
    pub consecutive_completions: Option<f64>,
}

impl DecisionRequest {
    fn missing_fields(&self) -> Vec<&'static str> {
        let present = [
            self.user_id.is_some(),
            self.level.is_some(),
            self.active_minutes.is_some(),
            self.quiz_accuracy.is_some(),
            self.days_since_last_login.is_some(),
        ];
        REQUIRED_FIELDS
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(field, _)| *field)
            .collect()
    }

    /// Checks the required fields and fills in the rest with defaults.
    pub fn validate(&self) -> Result<LearnerMetrics, CoachError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(CoachError::Validation(format!(
                "Missing required fields: {:?}",
                missing
            )));
        }
        let defaults = LearnerMetrics::default();
        let metrics = LearnerMetrics {
            level: self.level.clone().unwrap_or(defaults.level),
            daily_xp: self.daily_xp.unwrap_or(defaults.daily_xp),
            active_minutes: self.active_minutes.unwrap_or(defaults.active_minutes),
            quiz_accuracy: self.quiz_accuracy.unwrap_or(defaults.quiz_accuracy),
            modules_done: self.modules_done.unwrap_or(defaults.modules_done),
            days_since_last_login: self
                .days_since_last_login
                .unwrap_or(defaults.days_since_last_login),
            recent_points: self.recent_points.unwrap_or(defaults.recent_points),
            total_badges: self.total_badges.unwrap_or(defaults.total_badges),
            session_duration: self.session_duration.unwrap_or(defaults.session_duration),
            quiz_score: self.quiz_score.unwrap_or(defaults.quiz_score),
            consecutive_completions: self
                .consecutive_completions
                .unwrap_or(defaults.consecutive_completions),
        };
        let non_finite = [
            metrics.daily_xp,
            metrics.active_minutes,
            metrics.quiz_accuracy,
            metrics.modules_done,
            metrics.days_since_last_login,
            metrics.recent_points,
            metrics.total_badges,
            metrics.session_duration,
            metrics.quiz_score,
            metrics.consecutive_completions,
        ]
        .iter()
        .any(|v| !v.is_finite());
        if non_finite {
            return Err(CoachError::Validation(
                "Numeric fields must be finite numbers".to_string(),
            ));
        }
        Ok(metrics)
    }

    /// The learner id as text, for logs and the pending store.
    fn user_key(&self) -> String {
        match &self.user_id {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeedbackRequest {
    pub recommendation_id: Option<String>,
    /// Clients usually only report engagement, so a missing flag means engaged.
    pub engaged: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendedAction {
    pub action_id: ActionId,
    pub action_code: &'static str,
    pub action_name: &'static str,
    pub description: &'static str,
    pub target_audience: Audience,
}

impl From<Action> for RecommendedAction {
    fn from(action: Action) -> Self {
        Self {
            action_id: action.id(),
            action_code: action.code(),
            action_name: action.name(),
            description: action.description(),
            target_audience: action.target(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentAnalysis {
    pub engagement_score: f64,
    pub reward_score: f64,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionFlags {
    pub explored: bool,
    pub safety_override: bool,
}

/// What a decision request gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub user_id: serde_json::Value,
    pub recommendation_id: Uuid,
    pub created_at: AbsoluteTimestamp,
    pub expires_at: AbsoluteTimestamp,
    pub window_hours: f64,
    pub recommendation: RecommendedAction,
    pub student_analysis: StudentAnalysis,
    pub all_action_scores: BTreeMap<&'static str, f64>,
    pub decision: DecisionFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub memory_size: usize,
    pub epsilon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackOutcome {
    pub feedback_recorded: bool,
    pub user_id: String,
    pub recommendation_id: Uuid,
    pub engaged: bool,
    pub reward: f64,
    pub action_taken: &'static str,
    pub model_stats: ModelSummary,
    pub training_performed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatistics {
    pub loaded: bool,
    pub path: String,
    pub epsilon: f64,
    pub memory_size: usize,
    pub memory_capacity: usize,
    pub training_updates: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub model: ModelStatistics,
    pub pending_recommendations: usize,
    pub resolved_recommendations: usize,
    pub actions_available: usize,
    pub timeout_policy_hours: f64,
    pub positive_reward: f64,
    pub negative_reward: f64,
    pub timeout_penalty: f64,
    pub auto_save_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub model_loaded: bool,
    pub agent_epsilon: f64,
    pub memory_size: usize,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// The decision/feedback engine behind the HTTP surface.
///
/// Two independent locks: one around the learning loop (every inference and
/// every update goes through it) and the pending store's own map lock. Neither
/// is held while the other is taken.
pub struct Coach {
    config: CoachConfig,
    risk: Box<dyn RiskScorer>,
    learning: Mutex<LearningLoop<MlpApproximator>>,
    pending: PendingStore,
}

impl Coach {
    /// Fresh parameters, then a best-effort load of the configured checkpoint.
    pub fn new(config: CoachConfig, risk: Box<dyn RiskScorer>) -> Self {
        let approximator =
            MlpApproximator::new(config.learning_rate, &mut StdRng::from_entropy());
        let store = CheckpointStore::new(&config.model_path);
        let mut learning = LearningLoop::new(approximator, config.learning_settings(), Some(store));

        match learning.load_checkpoint() {
            Ok(true) => log::info!(
                "[CHECKPOINT] Loaded model from {} (epsilon={:.4}, memory={})",
                config.model_path,
                learning.epsilon(),
                learning.memory().len()
            ),
            Ok(false) => log::info!(
                "[CHECKPOINT] No checkpoint at {}, starting from fresh parameters",
                config.model_path
            ),
            Err(e) => log::warn!(
                "[CHECKPOINT] Could not load {}: {}. Starting from fresh parameters",
                config.model_path,
                e
            ),
        }
        Self::with_learning(config, risk, learning)
    }

    /// Uses an already built learning loop as is.
    pub fn with_learning(
        config: CoachConfig,
        risk: Box<dyn RiskScorer>,
        learning: LearningLoop<MlpApproximator>,
    ) -> Self {
        Self {
            config,
            risk,
            learning: Mutex::new(learning),
            pending: PendingStore::new(),
        }
    }

    pub fn config(&self) -> &CoachConfig {
        &self.config
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    pub fn learning(&self) -> MutexGuard<'_, LearningLoop<MlpApproximator>> {
        self.learning.lock()
    }

    pub fn recommend(&self, request: &DecisionRequest) -> Result<Recommendation, CoachError> {
        self.recommend_at(request, ClockManager::utc_now())
    }

    /// Picks an action for the learner and registers it as pending until `now + window`.
    pub fn recommend_at(
        &self,
        request: &DecisionRequest,
        now: AbsoluteTimestamp,
    ) -> Result<Recommendation, CoachError> {
        let metrics = request.validate()?;
        let user_id = request.user_key();

        let engagement = metrics.engagement();
        let reward_score = metrics.reward_sensitivity();
        let risk_score = self.risk.risk_score(engagement, reward_score);
        let state = build_state_vector(&metrics, risk_score);

        let (selection, q_values) = {
            let mut learning = self.learning.lock();
            let selection = learning.select(&state, risk_score);
            (selection, learning.q_values(&state))
        };

        let pending = PendingRecommendation::new(
            user_id.clone(),
            selection.action,
            state,
            now,
            self.config.window(),
        );
        let recommendation_id = pending.id;
        let expires_at = pending.expires_at;
        self.pending.insert(pending);

        log::info!(
            "[RL] Recommended {} to user {} (risk={:.3}, explored={}, override={}) id={}",
            selection.action,
            user_id,
            risk_score,
            selection.explored,
            selection.overridden,
            recommendation_id
        );

        let all_action_scores = Action::ALL
            .iter()
            .zip(q_values.iter().take(NUM_ACTIONS))
            .map(|(action, q)| (action.code(), round4(*q)))
            .collect();

        Ok(Recommendation {
            user_id: request.user_id.clone().unwrap_or(serde_json::Value::Null),
            recommendation_id,
            created_at: now,
            expires_at,
            window_hours: self.config.timeout_hours,
            recommendation: selection.action.into(),
            student_analysis: StudentAnalysis {
                engagement_score: round4(engagement),
                reward_score: round4(reward_score),
                risk_score: round4(risk_score),
                risk_level: RiskLevel::from_score(risk_score),
            },
            all_action_scores,
            decision: DecisionFlags {
                explored: selection.explored,
                safety_override: selection.overridden,
            },
        })
    }

    /// Resolves a pending decision with the learner's reaction.
    pub fn feedback(
        &self,
        recommendation_id: &str,
        engaged: bool,
    ) -> Result<FeedbackOutcome, CoachError> {
        let recommendation_id = recommendation_id.trim();
        if recommendation_id.is_empty() {
            return Err(CoachError::Validation(
                "recommendation_id is required".to_string(),
            ));
        }
        // An id we could never have issued is just as unknown as a resolved one.
        let not_found = || CoachError::NotFound(recommendation_id.to_string());
        let id = Uuid::parse_str(recommendation_id).map_err(|_| not_found())?;
        let pending = self.pending.pop_if_present(&id).ok_or_else(not_found)?;

        let reward = if engaged {
            self.config.positive_reward
        } else {
            self.config.negative_reward
        };
        let (update, model_stats) = {
            let mut learning = self.learning.lock();
            let update =
                learning.apply_update(pending.state, pending.action, reward, UpdateReason::Feedback);
            let stats = ModelSummary {
                memory_size: learning.memory().len(),
                epsilon: round4(learning.epsilon()),
            };
            (update, stats)
        };
        let trained = update.finish();

        Ok(FeedbackOutcome {
            feedback_recorded: true,
            user_id: pending.user_id,
            recommendation_id: id,
            engaged,
            reward,
            action_taken: pending.action.code(),
            model_stats,
            training_performed: trained,
        })
    }

    /// Feeds a resolved decision to the learning loop. A checkpoint that
    /// falls due is written after the learning lock is released.
    pub fn apply_update(
        &self,
        pending: &PendingRecommendation,
        reward: f64,
        reason: UpdateReason,
    ) -> bool {
        let update = self
            .learning
            .lock()
            .apply_update(pending.state, pending.action, reward, reason);
        update.finish()
    }

    pub fn stats(&self) -> Statistics {
        let model = {
            let learning = self.learning.lock();
            ModelStatistics {
                loaded: self.model_present(),
                path: self.config.model_path.clone(),
                epsilon: round4(learning.epsilon()),
                memory_size: learning.memory().len(),
                memory_capacity: learning.memory().capacity(),
                training_updates: learning.training_updates(),
            }
        };
        Statistics {
            model,
            pending_recommendations: self.pending.len(),
            resolved_recommendations: self.pending.num_resolved(),
            actions_available: NUM_ACTIONS,
            timeout_policy_hours: self.config.timeout_hours,
            positive_reward: self.config.positive_reward,
            negative_reward: self.config.negative_reward,
            timeout_penalty: self.config.timeout_penalty,
            auto_save_interval: self.config.auto_save_interval,
        }
    }

    pub fn health(&self) -> Health {
        let learning = self.learning.lock();
        Health {
            status: "healthy",
            model_loaded: self.model_present(),
            agent_epsilon: learning.epsilon(),
            memory_size: learning.memory().len(),
        }
    }

    /// Writes a checkpoint now. The snapshot is taken under the learning
    /// lock; the file is written after it is released.
    pub fn save(&self) -> Result<String, CoachError> {
        let (checkpoint, store) = {
            let learning = self.learning.lock();
            (learning.checkpoint(), learning.store().cloned())
        };
        let store = store.ok_or(CheckpointError::NoStore)?;
        if store.save(&checkpoint)? {
            log::info!("[CHECKPOINT] Saved checkpoint to {}", store.path().display());
        } else {
            log::info!(
                "[CHECKPOINT] {} already holds a newer checkpoint",
                store.path().display()
            );
        }
        Ok(store.path().display().to_string())
    }

    fn model_present(&self) -> bool {
        std::path::Path::new(&self.config.model_path).exists()
    }
}

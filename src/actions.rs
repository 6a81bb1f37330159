use std::fmt;

use serde::Serialize;

pub type ActionId = usize;
pub const NUM_ACTIONS: usize = 5;

/// The motivational interventions the coach can recommend.
/// Discriminants are the stable action ids used by the value function
/// and stored in checkpoints, so they must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    StandardXp = 0,
    MultiplierBoost = 1,
    BadgeInjection = 2,
    RankComparison = 3,
    ExtraGoals = 4,
}

/// Who an action is designed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    AllStudents,
    SkillfulStudents,
    StrugglingStudents,
}

impl Audience {
    pub const fn as_str(self) -> &'static str {
        match self {
            Audience::AllStudents => "all_students",
            Audience::SkillfulStudents => "skillful_students",
            Audience::StrugglingStudents => "struggling_students",
        }
    }
}

/// Display metadata of an action, as exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionInfo {
    pub id: ActionId,
    pub code: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub target: Audience,
}

impl Action {
    pub const ALL: [Action; NUM_ACTIONS] = [
        Action::StandardXp,
        Action::MultiplierBoost,
        Action::BadgeInjection,
        Action::RankComparison,
        Action::ExtraGoals,
    ];

    /// Compares the learner against peers; unsafe for learners at high risk.
    pub const COMPARISON: Action = Action::RankComparison;
    /// What we show instead of `COMPARISON` to learners at high risk.
    pub const LOW_RISK_FALLBACK: Action = Action::ExtraGoals;

    pub const fn id(self) -> ActionId {
        self as ActionId
    }

    pub fn from_id(id: ActionId) -> Option<Action> {
        Self::ALL.get(id).copied()
    }

    pub const fn code(self) -> &'static str {
        match self {
            Action::StandardXp => "STANDARD_XP",
            Action::MultiplierBoost => "MULTIPLIER_BOOST",
            Action::BadgeInjection => "BADGE_INJECTION",
            Action::RankComparison => "RANK_COMPARISON",
            Action::ExtraGoals => "EXTRA_GOALS",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Action::StandardXp => "Standard XP",
            Action::MultiplierBoost => "Multiplier Boost",
            Action::BadgeInjection => "Badge Injection",
            Action::RankComparison => "Rank Comparison",
            Action::ExtraGoals => "Extra Goals",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Action::StandardXp => "Award normal XP points for activity",
            Action::MultiplierBoost => "Apply XP multiplier (e.g., 2x, 3x) next activity",
            Action::BadgeInjection => "Award a surprise badge to boost motivation",
            Action::RankComparison => "Show 'X points to reach Top N' message",
            Action::ExtraGoals => "Set additional achievable micro-goals",
        }
    }

    pub const fn target(self) -> Audience {
        match self {
            Action::RankComparison => Audience::SkillfulStudents,
            Action::ExtraGoals => Audience::StrugglingStudents,
            _ => Audience::AllStudents,
        }
    }

    pub fn info(self) -> ActionInfo {
        ActionInfo {
            id: self.id(),
            code: self.code(),
            name: self.name(),
            description: self.description(),
            target: self.target(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

use std::cmp::Ordering;

use ulid::Ulid;

use crate::model::Ms;

use super::EngineError;

/// Weights of the priority formula. They sum to 1 so the score stays in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub share: f64,
    pub usage: f64,
    pub recency: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            share: 0.5,
            usage: 0.3,
            recency: 0.2,
        }
    }
}

impl Weights {
    pub fn validate(&self) -> Result<(), EngineError> {
        let parts = [self.share, self.usage, self.recency];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::LimitExceeded("weights must be finite and non-negative"));
        }
        if (parts.iter().sum::<f64>() - 1.0).abs() > 1e-9 {
            return Err(EngineError::LimitExceeded("weights must sum to 1"));
        }
        Ok(())
    }
}

/// Inputs of a booking's priority. Rebuilt from the stores for every decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityFactors {
    /// Percent, 0..=100.
    pub ownership_share: u8,
    pub recent_usage_minutes: u64,
    /// 0..=1, see [`recency_bonus`].
    pub recency_bonus: f64,
}

/// Advance-notice bonus: how far ahead of its start a booking was requested,
/// as a fraction of `lead_horizon`.
pub fn recency_bonus(span_start: Ms, created_at: Ms, lead_horizon: Ms) -> f64 {
    if lead_horizon <= 0 {
        return 0.0;
    }
    let lead = (span_start - created_at).max(0) as f64;
    (lead / lead_horizon as f64).min(1.0)
}

pub fn priority_score(factors: &PriorityFactors, weights: &Weights) -> f64 {
    let share = f64::from(factors.ownership_share.min(100)) / 100.0;
    let usage = 1.0 / (1.0 + factors.recent_usage_minutes as f64);
    let recency = if factors.recency_bonus.is_finite() {
        factors.recency_bonus.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (weights.share * share + weights.usage * usage + weights.recency * recency).clamp(0.0, 1.0)
}

/// A scored booking competing for a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Contender {
    pub booking_id: Ulid,
    pub user_id: String,
    pub created_at: Ms,
    pub score: f64,
}

/// Total order on contenders; `Greater` means `a` beats `b`.
/// Higher score, then earlier request, then smaller user id, then smaller booking id.
pub fn rank(a: &Contender, b: &Contender) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.user_id.cmp(&a.user_id))
        .then_with(|| b.booking_id.cmp(&a.booking_id))
}

pub fn pick_winner(contenders: &[Contender]) -> Option<&Contender> {
    contenders.iter().max_by(|a, b| rank(a, b))
}

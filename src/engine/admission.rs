//! Booking admission.
//!
//! A request either fits the vehicle's calendar, or it collides with active
//! bookings and every party to the collision is scored with the same
//! formula. The best contender keeps the slot; the rest are rejected. A
//! losing request is rejected with nearby free slots as suggestions.
//!
//! The whole read-score-write sequence runs under the vehicle's write lock,
//! and all status changes of one decision go to the WAL as a single record.

use std::collections::HashMap;
use std::time::Instant;

use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_VEHICLE;
use crate::limits::MAX_ESTIMATED_USAGE_KM;
use crate::model::*;

use super::conflict::{checked_span, find_conflicts, validate_user_id};
use super::priority::{Contender, PriorityFactors, pick_winner, priority_score, recency_bonus};
use super::suggest::{distance, nearest_free_slots};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq)]
pub struct BookingRequest {
    pub vehicle_id: Ulid,
    pub user_id: String,
    pub start: Ms,
    pub end: Ms,
    pub estimated_usage_km: Option<f64>,
    /// When the request was made; also the booking's `created_at`.
    pub requested_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Admitted,
    Rejected,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Admitted => "admitted",
            Outcome::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Winner {
    pub booking_id: Ulid,
    pub user_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub span: Span,
    /// Score the requester would have with this slot.
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub booking_id: Ulid,
    pub outcome: Outcome,
    pub status: BookingStatus,
    pub score: f64,
    /// Present whenever a conflict had to be resolved.
    pub winner: Option<Winner>,
    /// Existing bookings rejected by this decision.
    pub displaced: Vec<Ulid>,
    pub suggestions: Vec<Suggestion>,
    /// Rejected and no free slot exists within the search horizon.
    pub no_availability: bool,
}

/// Share and usage of one requester; the recency part depends on the slot.
#[derive(Debug, Clone, Copy)]
struct RequesterStanding {
    share: u8,
    usage_minutes: u64,
}

impl Engine {
    /// Decide a new booking request. See the module docs for the policy.
    pub async fn evaluate(&self, req: BookingRequest) -> Result<Decision, EngineError> {
        let span = checked_span(req.start, req.end)?;
        validate_user_id(&req.user_id)?;
        if let Some(km) = req.estimated_usage_km
            && (!km.is_finite() || !(0.0..=MAX_ESTIMATED_USAGE_KM).contains(&km))
        {
            return Err(EngineError::LimitExceeded("estimated usage out of range"));
        }

        let guard = self.lock_vehicle(&req.vehicle_id).await?;
        let started = Instant::now();
        if guard.active_count() >= MAX_BOOKINGS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many bookings on vehicle"));
        }

        let group = self
            .stores
            .membership
            .group(req.vehicle_id)
            .await?
            .filter(|g| g.is_member(&req.user_id))
            .ok_or_else(|| EngineError::NotAMember {
                vehicle_id: req.vehicle_id,
                user_id: req.user_id.clone(),
            })?;

        let mut candidate = Booking {
            id: Ulid::new(),
            vehicle_id: req.vehicle_id,
            user_id: req.user_id,
            span,
            status: group.initial_status(),
            priority_score: 0.0,
            estimated_usage_km: req.estimated_usage_km,
            created_at: req.requested_at,
        };
        let conflicts = find_conflicts(&guard, &span, None);

        let mut standings = HashMap::new();
        let mine = self
            .standing(&mut standings, &group, &candidate.user_id, req.requested_at)
            .await?;
        candidate.priority_score = self.score_at(mine, &candidate.span, candidate.created_at);

        if conflicts.is_empty() {
            let decision = Decision {
                booking_id: candidate.id,
                outcome: Outcome::Admitted,
                status: candidate.status,
                score: candidate.priority_score,
                winner: None,
                displaced: Vec::new(),
                suggestions: Vec::new(),
                no_availability: false,
            };
            let event = Event::BookingAdmitted { booking: candidate, displaced: Vec::new() };
            self.persist_and_apply(guard, event).await?;
            return Ok(self.finish(decision, &span, started));
        }

        let mut contenders = vec![contender(&candidate)];
        for existing in &conflicts {
            let standing = self
                .standing(&mut standings, &group, &existing.user_id, req.requested_at)
                .await?;
            let mut c = contender(existing);
            c.score = self.score_at(standing, &existing.span, existing.created_at);
            contenders.push(c);
        }
        let winner = pick_winner(&contenders)
            .cloned()
            .ok_or(EngineError::NotFound(candidate.id))?;
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);

        let decision = if winner.booking_id == candidate.id {
            let displaced: Vec<Ulid> = conflicts.iter().map(|b| b.id).collect();
            let decision = Decision {
                booking_id: candidate.id,
                outcome: Outcome::Admitted,
                status: candidate.status,
                score: candidate.priority_score,
                winner: Some(winner_of(&winner)),
                displaced: displaced.clone(),
                suggestions: Vec::new(),
                no_availability: false,
            };
            self.persist_and_apply(guard, Event::BookingAdmitted { booking: candidate, displaced })
                .await?;
            decision
        } else {
            candidate.status = BookingStatus::Rejected;
            let suggestions = self.suggest(&guard, &candidate, None, mine, req.requested_at);
            let decision = Decision {
                booking_id: candidate.id,
                outcome: Outcome::Rejected,
                status: BookingStatus::Rejected,
                score: candidate.priority_score,
                winner: Some(winner_of(&winner)),
                displaced: Vec::new(),
                no_availability: suggestions.is_empty(),
                suggestions,
            };
            self.persist_and_apply(guard, Event::BookingRejected { booking: candidate })
                .await?;
            decision
        };
        Ok(self.finish(decision, &span, started))
    }

    /// Re-run the decision for an existing active booking against the other
    /// active bookings on its vehicle. Without conflicts nothing is written.
    pub async fn reevaluate(&self, booking_id: Ulid, now: Ms) -> Result<Decision, EngineError> {
        let (vehicle_id, guard) = self.lock_booking(&booking_id).await?;
        let started = Instant::now();
        let booking = guard
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.status.is_active() {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: booking.status,
                to: BookingStatus::Approved,
            });
        }

        // Former members keep their bookings but score with a zero share.
        let group = self
            .stores
            .membership
            .group(vehicle_id)
            .await?
            .unwrap_or_else(|| OwnershipGroup {
                vehicle_id,
                members: Vec::new(),
                require_approval: false,
            });

        let mut standings = HashMap::new();
        let mine = self.standing(&mut standings, &group, &booking.user_id, now).await?;
        let score = self.score_at(mine, &booking.span, booking.created_at);
        let conflicts = find_conflicts(&guard, &booking.span, Some(booking_id));

        if conflicts.is_empty() {
            let decision = Decision {
                booking_id,
                outcome: Outcome::Admitted,
                status: booking.status,
                score,
                winner: None,
                displaced: Vec::new(),
                suggestions: Vec::new(),
                no_availability: false,
            };
            return Ok(self.finish(decision, &booking.span, started));
        }

        let mut me = contender(&booking);
        me.score = score;
        let mut contenders = vec![me];
        for existing in &conflicts {
            let standing = self.standing(&mut standings, &group, &existing.user_id, now).await?;
            let mut c = contender(existing);
            c.score = self.score_at(standing, &existing.span, existing.created_at);
            contenders.push(c);
        }
        let winner = pick_winner(&contenders)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);

        let decision = if winner.booking_id == booking_id {
            let displaced: Vec<Ulid> = conflicts.iter().map(|b| b.id).collect();
            let event = Event::BookingsDisplaced {
                vehicle_id,
                ids: displaced.clone(),
                winner: booking_id,
            };
            self.persist_and_apply(guard, event).await?;
            Decision {
                booking_id,
                outcome: Outcome::Admitted,
                status: booking.status,
                score,
                winner: Some(winner_of(&winner)),
                displaced,
                suggestions: Vec::new(),
                no_availability: false,
            }
        } else {
            let event = Event::BookingsDisplaced {
                vehicle_id,
                ids: vec![booking_id],
                winner: winner.booking_id,
            };
            let suggestions = self.suggest(&guard, &booking, Some(booking_id), mine, now);
            self.persist_and_apply(guard, event).await?;
            Decision {
                booking_id,
                outcome: Outcome::Rejected,
                status: BookingStatus::Rejected,
                score,
                winner: Some(winner_of(&winner)),
                displaced: Vec::new(),
                no_availability: suggestions.is_empty(),
                suggestions,
            }
        };
        Ok(self.finish(decision, &booking.span, started))
    }

    /// Share and recent usage of `user_id`, looked up once per decision.
    async fn standing(
        &self,
        seen: &mut HashMap<String, RequesterStanding>,
        group: &OwnershipGroup,
        user_id: &str,
        now: Ms,
    ) -> Result<RequesterStanding, EngineError> {
        if let Some(s) = seen.get(user_id) {
            return Ok(*s);
        }
        let window = Span::new(now - self.config.scoring_window_ms, now);
        let usage_minutes = self
            .stores
            .usage
            .recent_usage_minutes(group.vehicle_id, user_id, window)
            .await?;
        let standing = RequesterStanding {
            share: group.share_of(user_id).unwrap_or(0),
            usage_minutes,
        };
        seen.insert(user_id.to_string(), standing);
        Ok(standing)
    }

    fn score_at(&self, standing: RequesterStanding, span: &Span, created_at: Ms) -> f64 {
        let factors = PriorityFactors {
            ownership_share: standing.share,
            recent_usage_minutes: standing.usage_minutes,
            recency_bonus: recency_bonus(span.start, created_at, self.config.lead_horizon_ms),
        };
        priority_score(&factors, &self.config.weights)
    }

    /// Alternative slots for a losing booking, best projected score first,
    /// then nearest to the original start.
    fn suggest(
        &self,
        vehicle: &VehicleState,
        loser: &Booking,
        exclude: Option<Ulid>,
        standing: RequesterStanding,
        not_before: Ms,
    ) -> Vec<Suggestion> {
        let mut suggestions: Vec<Suggestion> = nearest_free_slots(
            vehicle,
            &loser.span,
            exclude,
            not_before,
            self.config.search_horizon_ms,
            self.config.max_suggestions,
        )
        .into_iter()
        .map(|span| Suggestion {
            score: self.score_at(standing, &span, loser.created_at),
            span,
        })
        .collect();
        suggestions.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| distance(&loser.span, &a.span).cmp(&distance(&loser.span, &b.span)))
                .then_with(|| a.span.start.cmp(&b.span.start))
        });
        suggestions
    }

    fn finish(&self, decision: Decision, span: &Span, started: Instant) -> Decision {
        metrics::histogram!(crate::observability::EVALUATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "outcome" => decision.outcome.as_str())
            .increment(1);
        if !decision.displaced.is_empty() {
            metrics::counter!(crate::observability::BOOKINGS_DISPLACED_TOTAL)
                .increment(decision.displaced.len() as u64);
        }
        if decision.no_availability {
            metrics::counter!(crate::observability::NO_AVAILABILITY_TOTAL).increment(1);
        }
        tracing::info!(
            booking = %decision.booking_id,
            outcome = decision.outcome.as_str(),
            start = span.start,
            end = span.end,
            score = decision.score,
            displaced = decision.displaced.len(),
            suggestions = decision.suggestions.len(),
            "admission decided"
        );
        decision
    }
}

fn contender(b: &Booking) -> Contender {
    Contender {
        booking_id: b.id,
        user_id: b.user_id.clone(),
        created_at: b.created_at,
        score: b.priority_score,
    }
}

fn winner_of(c: &Contender) -> Winner {
    Winner {
        booking_id: c.booking_id,
        user_id: c.user_id.clone(),
        score: c.score,
    }
}

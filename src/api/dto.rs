//! JSON bodies of the HTTP interface. Timestamps travel as RFC 3339 and are
//! converted to epoch milliseconds at this boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{Decision, Suggestion, Winner};
use crate::model::*;

pub fn to_ms(at: DateTime<Utc>) -> Ms {
    at.timestamp_millis()
}

pub fn from_ms(ms: Ms) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBooking {
    pub vehicle_id: Ulid,
    pub user_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub estimated_usage_km: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberBody {
    pub user_id: String,
    pub share: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVehicle {
    #[serde(default)]
    pub id: Option<Ulid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
    pub members: Vec<MemberBody>,
}

fn group_of(vehicle_id: Ulid, members: Vec<MemberBody>, require_approval: bool) -> OwnershipGroup {
    OwnershipGroup {
        vehicle_id,
        members: members
            .into_iter()
            .map(|m| GroupMember { user_id: m.user_id, share: m.share })
            .collect(),
        require_approval,
    }
}

impl RegisterVehicle {
    pub fn into_parts(self) -> (Ulid, Option<String>, OwnershipGroup) {
        let id = self.id.unwrap_or_else(Ulid::new);
        (id, self.name, group_of(id, self.members, self.require_approval))
    }
}

/// Replacement ownership group for an existing vehicle.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupBody {
    #[serde(default)]
    pub require_approval: bool,
    pub members: Vec<MemberBody>,
}

impl GroupBody {
    pub fn into_group(self, vehicle_id: Ulid) -> OwnershipGroup {
        group_of(vehicle_id, self.members, self.require_approval)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub min_duration_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerBody {
    pub booking_id: Ulid,
    pub user_id: String,
    pub score: f64,
}

impl From<Winner> for WinnerBody {
    fn from(w: Winner) -> Self {
        Self { booking_id: w.booking_id, user_id: w.user_id, score: w.score }
    }
}

#[derive(Debug, Serialize)]
pub struct SuggestionBody {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub score: f64,
}

impl From<Suggestion> for SuggestionBody {
    fn from(s: Suggestion) -> Self {
        Self {
            start: from_ms(s.span.start),
            end: from_ms(s.span.end),
            score: s.score,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    pub booking_id: Ulid,
    pub outcome: &'static str,
    pub status: BookingStatus,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<WinnerBody>,
    pub displaced: Vec<Ulid>,
    pub suggestions: Vec<SuggestionBody>,
    pub no_availability: bool,
}

impl From<Decision> for DecisionBody {
    fn from(d: Decision) -> Self {
        Self {
            booking_id: d.booking_id,
            outcome: d.outcome.as_str(),
            status: d.status,
            score: d.score,
            winner: d.winner.map(WinnerBody::from),
            displaced: d.displaced,
            suggestions: d.suggestions.into_iter().map(SuggestionBody::from).collect(),
            no_availability: d.no_availability,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingBody {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub user_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: BookingStatus,
    pub priority_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_usage_km: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<Booking> for BookingBody {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            vehicle_id: b.vehicle_id,
            user_id: b.user_id,
            start_at: from_ms(b.span.start),
            end_at: from_ms(b.span.end),
            status: b.status,
            priority_score: b.priority_score,
            estimated_usage_km: b.estimated_usage_km,
            created_at: from_ms(b.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SpanBody {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl From<Span> for SpanBody {
    fn from(s: Span) -> Self {
        Self { start: from_ms(s.start), end: from_ms(s.end) }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredVehicle {
    pub id: Ulid,
    pub name: Option<String>,
    pub require_approval: bool,
    pub members: usize,
}

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Pending and approved bookings hold their slot on the calendar.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Approved | Rejected | Cancelled) | (Approved, Rejected | Cancelled | Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub user_id: String,
    pub span: Span,
    pub status: BookingStatus,
    /// Score from the most recent admission decision. Informational only:
    /// every decision recomputes scores from current data.
    pub priority_score: f64,
    pub estimated_usage_km: Option<f64>,
    pub created_at: Ms,
}

impl Booking {
    /// Active bookings are always kept; terminal ones until they end before `cutoff`.
    pub fn retained_at(&self, cutoff: Ms) -> bool {
        self.status.is_active() || self.span.end > cutoff
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub user_id: String,
    /// Ownership share in percent (0..=100).
    pub share: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipGroup {
    pub vehicle_id: Ulid,
    pub members: Vec<GroupMember>,
    /// When set, admitted bookings wait in `pending` for an explicit approval.
    pub require_approval: bool,
}

impl OwnershipGroup {
    pub fn share_of(&self, user_id: &str) -> Option<u8> {
        self.members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.share)
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.share_of(user_id).is_some()
    }

    pub fn initial_status(&self) -> BookingStatus {
        if self.require_approval {
            BookingStatus::Pending
        } else {
            BookingStatus::Approved
        }
    }
}

/// Calendar of a single vehicle. Guarded by the vehicle's lock.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Bookings recorded for this vehicle, sorted by `span.start`.
    /// Compaction drops terminal ones past the retention cutoff.
    pub bookings: Vec<Booking>,
    /// Last ownership group written to the ledger.
    pub group: Option<OwnershipGroup>,
}

impl VehicleState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            bookings: Vec::new(),
            group: None,
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn set_status(&mut self, id: &Ulid, status: BookingStatus) -> bool {
        match self.bookings.iter_mut().find(|b| b.id == *id) {
            Some(b) => {
                b.status = status;
                true
            }
            None => false,
        }
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Active (pending/approved) bookings overlapping the query window.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.status.is_active()).count()
    }

    /// Remove terminal bookings that ended at or before `cutoff`; returns their ids.
    pub fn prune_terminal(&mut self, cutoff: Ms) -> Vec<Ulid> {
        let mut pruned = Vec::new();
        self.bookings.retain(|b| {
            let keep = b.retained_at(cutoff);
            if !keep {
                pruned.push(b.id);
            }
            keep
        });
        pruned
    }
}

/// Ledger events, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        name: Option<String>,
    },
    VehicleRemoved {
        id: Ulid,
    },
    /// A candidate was admitted; `displaced` bookings lost the conflict and
    /// become rejected in the same record.
    BookingAdmitted {
        booking: Booking,
        displaced: Vec<Ulid>,
    },
    /// A candidate lost its conflict and is recorded as rejected.
    BookingRejected {
        booking: Booking,
    },
    /// Existing bookings that lost a re-evaluation, rejected in one record.
    BookingsDisplaced {
        vehicle_id: Ulid,
        ids: Vec<Ulid>,
        winner: Ulid,
    },
    BookingApproved {
        id: Ulid,
        vehicle_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        vehicle_id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
        vehicle_id: Ulid,
    },
    /// Written by compaction: restores a booking with whatever status it had.
    BookingRestored {
        booking: Booking,
    },
    /// Ownership group replaced; the latest one per vehicle wins on replay.
    GroupSet {
        group: OwnershipGroup,
    },
}

impl Event {
    /// Vehicle the event applies to.
    pub fn vehicle_id(&self) -> Ulid {
        match self {
            Event::VehicleRegistered { id, .. } | Event::VehicleRemoved { id } => *id,
            Event::BookingAdmitted { booking, .. }
            | Event::BookingRejected { booking }
            | Event::BookingRestored { booking } => booking.vehicle_id,
            Event::GroupSet { group } => group.vehicle_id,
            Event::BookingsDisplaced { vehicle_id, .. }
            | Event::BookingApproved { vehicle_id, .. }
            | Event::BookingCancelled { vehicle_id, .. }
            | Event::BookingCompleted { vehicle_id, .. } => *vehicle_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::VehicleRegistered { .. } => "vehicle_registered",
            Event::VehicleRemoved { .. } => "vehicle_removed",
            Event::BookingAdmitted { .. } => "booking_admitted",
            Event::BookingRejected { .. } => "booking_rejected",
            Event::BookingsDisplaced { .. } => "bookings_displaced",
            Event::BookingApproved { .. } => "booking_approved",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::BookingCompleted { .. } => "booking_completed",
            Event::BookingRestored { .. } => "booking_restored",
            Event::GroupSet { .. } => "group_set",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active_bookings: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            vehicle_id: Ulid::nil(),
            user_id: "u".into(),
            span: Span::new(start, end),
            status,
            priority_score: 0.0,
            estimated_usage_km: None,
            created_at: 0,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(Span::new(0, 1000).contains_span(&a));
        assert!(!a.contains_span(&b));
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(Pending.is_active() && Approved.is_active());
        assert!(!Rejected.is_active());
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut vs = VehicleState::new(Ulid::new(), None);
        vs.insert_booking(booking(300, 400, BookingStatus::Approved));
        vs.insert_booking(booking(100, 200, BookingStatus::Approved));
        vs.insert_booking(booking(200, 300, BookingStatus::Pending));
        let starts: Vec<Ms> = vs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn active_overlapping_skips_terminal() {
        let mut vs = VehicleState::new(Ulid::new(), None);
        vs.insert_booking(booking(100, 200, BookingStatus::Rejected));
        vs.insert_booking(booking(150, 250, BookingStatus::Approved));
        vs.insert_booking(booking(1000, 1100, BookingStatus::Approved));
        let query = Span::new(120, 300);
        assert_eq!(vs.overlapping(&query).count(), 2);
        let active: Vec<_> = vs.active_overlapping(&query).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].span, Span::new(150, 250));
    }

    #[test]
    fn prune_terminal_keeps_active_and_recent() {
        let mut vs = VehicleState::new(Ulid::new(), None);
        let old_rejected = booking(100, 200, BookingStatus::Rejected);
        let old_completed = booking(150, 250, BookingStatus::Completed);
        vs.insert_booking(old_rejected.clone());
        vs.insert_booking(old_completed.clone());
        vs.insert_booking(booking(180, 260, BookingStatus::Approved));
        vs.insert_booking(booking(900, 1000, BookingStatus::Cancelled));

        let mut pruned = vs.prune_terminal(500);
        pruned.sort();
        let mut expected = vec![old_rejected.id, old_completed.id];
        expected.sort();
        assert_eq!(pruned, expected);
        let left: Vec<_> = vs.bookings.iter().map(|b| b.status).collect();
        assert_eq!(left, vec![BookingStatus::Approved, BookingStatus::Cancelled]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut vs = VehicleState::new(Ulid::new(), None);
        vs.insert_booking(booking(100, 200, BookingStatus::Approved));
        assert_eq!(vs.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(vs.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(vs.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn group_share_lookup() {
        let group = OwnershipGroup {
            vehicle_id: Ulid::new(),
            members: vec![
                GroupMember { user_id: "a".into(), share: 70 },
                GroupMember { user_id: "b".into(), share: 30 },
            ],
            require_approval: true,
        };
        assert_eq!(group.share_of("b"), Some(30));
        assert!(!group.is_member("c"));
        assert_eq!(group.initial_status(), BookingStatus::Pending);
    }

    #[test]
    fn event_bincode_roundtrip_keeps_booking() {
        let event = Event::BookingAdmitted {
            booking: booking(100, 200, BookingStatus::Approved),
            displaced: vec![Ulid::new()],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

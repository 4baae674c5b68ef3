use std::collections::HashSet;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Reject reversed/empty intervals before they ever become a `Span`.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    let span = Span::new(start, end);
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.is_empty() {
        return Err(EngineError::LimitExceeded("user id is empty"));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

/// Members non-empty and unique, each share 0..=100, shares summing to 100.
pub(crate) fn validate_group(group: &OwnershipGroup) -> Result<(), EngineError> {
    if group.members.is_empty() {
        return Err(EngineError::InvalidGroup("group has no members".into()));
    }
    if group.members.len() > MAX_GROUP_MEMBERS {
        return Err(EngineError::LimitExceeded("too many group members"));
    }
    let mut seen = HashSet::new();
    let mut total: u32 = 0;
    for member in &group.members {
        validate_user_id(&member.user_id)?;
        if !seen.insert(member.user_id.as_str()) {
            return Err(EngineError::InvalidGroup(format!(
                "duplicate member {}",
                member.user_id
            )));
        }
        if member.share > 100 {
            return Err(EngineError::InvalidGroup(format!(
                "share of {} exceeds 100",
                member.user_id
            )));
        }
        total += u32::from(member.share);
    }
    if total != 100 {
        return Err(EngineError::InvalidGroup(format!(
            "shares sum to {total}, expected 100"
        )));
    }
    Ok(())
}

/// Active bookings overlapping `span`, optionally leaving one out.
pub(crate) fn find_conflicts(
    vehicle: &VehicleState,
    span: &Span,
    exclude: Option<ulid::Ulid>,
) -> Vec<Booking> {
    vehicle
        .active_overlapping(span)
        .filter(|b| Some(b.id) != exclude)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn group(shares: &[(&str, u8)]) -> OwnershipGroup {
        OwnershipGroup {
            vehicle_id: Ulid::new(),
            members: shares
                .iter()
                .map(|(u, s)| GroupMember { user_id: (*u).into(), share: *s })
                .collect(),
            require_approval: false,
        }
    }

    #[test]
    fn reversed_interval_is_invalid() {
        let t = MIN_VALID_TIMESTAMP_MS + HOUR_MS;
        assert!(matches!(
            checked_span(t, t),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert!(matches!(
            checked_span(t + 1, t),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert!(checked_span(t, t + HOUR_MS).is_ok());
    }

    #[test]
    fn span_limits() {
        assert!(matches!(
            checked_span(0, HOUR_MS),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        let t = MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(
            checked_span(t, t + MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
    }

    #[test]
    fn group_validation() {
        assert!(validate_group(&group(&[("a", 60), ("b", 40)])).is_ok());
        assert!(validate_group(&group(&[("a", 100), ("b", 0)])).is_ok());
        assert!(matches!(
            validate_group(&group(&[("a", 60), ("b", 30)])),
            Err(EngineError::InvalidGroup(_))
        ));
        assert!(matches!(
            validate_group(&group(&[("a", 50), ("a", 50)])),
            Err(EngineError::InvalidGroup(_))
        ));
        assert!(matches!(
            validate_group(&group(&[("a", 150)])),
            Err(EngineError::InvalidGroup(_))
        ));
        assert!(matches!(validate_group(&group(&[])), Err(EngineError::InvalidGroup(_))));
    }

    #[test]
    fn conflicts_exclude_self_and_terminal() {
        let mut vs = VehicleState::new(Ulid::new(), None);
        let mk = |start, end, status| Booking {
            id: Ulid::new(),
            vehicle_id: Ulid::nil(),
            user_id: "a".into(),
            span: Span::new(start, end),
            status,
            priority_score: 0.0,
            estimated_usage_km: None,
            created_at: 0,
        };
        let me = mk(100, 200, BookingStatus::Approved);
        let my_id = me.id;
        vs.insert_booking(me);
        vs.insert_booking(mk(150, 250, BookingStatus::Rejected));
        vs.insert_booking(mk(190, 300, BookingStatus::Pending));

        let hits = find_conflicts(&vs, &Span::new(100, 200), Some(my_id));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status, BookingStatus::Pending);
    }
}

use ulid::Ulid;

use crate::model::*;

use super::availability::free_spans;

/// Nearest free placements of `requested`'s duration, taken alternately
/// forward and backward from `requested.start`. A long gap yields
/// back-to-back placements stepping away from the request.
///
/// The search window reaches `horizon` on either side of the request and
/// never starts before `not_before`.
pub(crate) fn nearest_free_slots(
    vehicle: &VehicleState,
    requested: &Span,
    exclude: Option<Ulid>,
    not_before: Ms,
    horizon: Ms,
    limit: usize,
) -> Vec<Span> {
    let duration = requested.duration_ms();
    let window_start = (requested.start - horizon).max(not_before);
    let window_end = requested.end + horizon;
    if limit == 0 || window_end - window_start < duration {
        return Vec::new();
    }
    let window = Span::new(window_start, window_end);

    let mut forward = Vec::new();
    let mut backward = Vec::new();
    for gap in free_spans(vehicle, &window, exclude) {
        if gap.duration_ms() < duration {
            continue;
        }
        let nearest = requested.start.clamp(gap.start, gap.end - duration);
        if nearest >= requested.start {
            let mut start = nearest;
            while start + duration <= gap.end && forward.len() < limit {
                forward.push(Span::new(start, start + duration));
                start += duration;
            }
        } else {
            // Nearest-first inside the gap; gaps themselves are reversed below
            let mut placements = Vec::new();
            let mut start = nearest;
            while start >= gap.start && placements.len() < limit {
                placements.push(Span::new(start, start + duration));
                start -= duration;
            }
            placements.reverse();
            backward.extend(placements);
        }
    }
    // Gaps come back sorted; forward ones are already nearest-first.
    backward.reverse();

    let mut slots = Vec::with_capacity(limit);
    let mut fwd = forward.into_iter();
    let mut bwd = backward.into_iter();
    while slots.len() < limit {
        let mut took = false;
        for next in [fwd.next(), bwd.next()].into_iter().flatten() {
            if slots.len() < limit {
                slots.push(next);
                took = true;
            }
        }
        if !took {
            break;
        }
    }
    slots
}

/// Distance of a suggested slot from the originally requested start.
pub(crate) fn distance(requested: &Span, slot: &Span) -> Ms {
    (slot.start - requested.start).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;

    fn vehicle(busy: &[(Ms, Ms)]) -> VehicleState {
        let mut vs = VehicleState::new(Ulid::new(), None);
        for &(start, end) in busy {
            vs.insert_booking(Booking {
                id: Ulid::new(),
                vehicle_id: vs.id,
                user_id: "a".into(),
                span: Span::new(start, end),
                status: BookingStatus::Approved,
                priority_score: 0.0,
                estimated_usage_km: None,
                created_at: 0,
            });
        }
        vs
    }

    #[test]
    fn forward_then_backward() {
        let vs = vehicle(&[(9 * H, 12 * H)]);
        let requested = Span::new(10 * H, 11 * H);
        let slots = nearest_free_slots(&vs, &requested, None, 0, DAY_MS, 3);
        assert_eq!(
            slots,
            vec![
                Span::new(12 * H, 13 * H),
                Span::new(8 * H, 9 * H),
                Span::new(13 * H, 14 * H),
            ]
        );
    }

    #[test]
    fn alternates_across_several_gaps() {
        let vs = vehicle(&[(6 * H, 8 * H), (9 * H, 12 * H), (13 * H, 15 * H)]);
        let requested = Span::new(10 * H, 11 * H);
        let slots = nearest_free_slots(&vs, &requested, None, 0, DAY_MS, 4);
        assert_eq!(
            slots,
            vec![
                Span::new(12 * H, 13 * H),
                Span::new(8 * H, 9 * H),
                Span::new(15 * H, 16 * H),
                Span::new(5 * H, 6 * H),
            ]
        );
    }

    #[test]
    fn long_gap_offers_back_to_back_placements() {
        let vs = vehicle(&[(9 * H, 12 * H), (20 * H, 30 * H)]);
        let requested = Span::new(10 * H, 12 * H);
        let slots = nearest_free_slots(&vs, &requested, None, 9 * H, DAY_MS, 5);
        assert_eq!(
            slots,
            vec![
                Span::new(12 * H, 14 * H),
                Span::new(14 * H, 16 * H),
                Span::new(16 * H, 18 * H),
                Span::new(18 * H, 20 * H),
                Span::new(30 * H, 32 * H),
            ]
        );
    }

    #[test]
    fn gap_shorter_than_request_is_skipped() {
        let vs = vehicle(&[(9 * H, 12 * H), (12 * H + 30 * MINUTE_MS, 14 * H)]);
        let requested = Span::new(10 * H, 11 * H);
        let slots = nearest_free_slots(&vs, &requested, None, 9 * H, DAY_MS, 1);
        assert_eq!(slots, vec![Span::new(14 * H, 15 * H)]);
    }

    #[test]
    fn never_suggests_before_not_before() {
        let vs = vehicle(&[(9 * H, 12 * H)]);
        let requested = Span::new(10 * H, 11 * H);
        let slots = nearest_free_slots(&vs, &requested, None, 8 * H + 30 * MINUTE_MS, DAY_MS, 3);
        assert_eq!(
            slots,
            vec![
                Span::new(12 * H, 13 * H),
                Span::new(13 * H, 14 * H),
                Span::new(14 * H, 15 * H),
            ]
        );
    }

    #[test]
    fn fully_booked_horizon_yields_nothing() {
        let vs = vehicle(&[(0, 30 * H)]);
        let requested = Span::new(10 * H, 11 * H);
        let slots = nearest_free_slots(&vs, &requested, None, 0, 2 * H, 3);
        assert!(slots.is_empty());
    }

    #[test]
    fn limit_is_respected() {
        let vs = vehicle(&[(9 * H, 12 * H)]);
        let requested = Span::new(10 * H, 11 * H);
        assert_eq!(nearest_free_slots(&vs, &requested, None, 0, DAY_MS, 1).len(), 1);
        assert!(nearest_free_slots(&vs, &requested, None, 0, DAY_MS, 0).is_empty());
    }

    #[test]
    fn distance_is_symmetric() {
        let requested = Span::new(10 * H, 11 * H);
        assert_eq!(distance(&requested, &Span::new(12 * H, 13 * H)), 2 * H);
        assert_eq!(distance(&requested, &Span::new(8 * H, 9 * H)), 2 * H);
    }
}

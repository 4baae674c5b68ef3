use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_group;
use super::{Engine, EngineError, detached};

impl Engine {
    pub async fn register_vehicle(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("vehicle name too long"));
        }
        let catalog = self.catalog.clone().lock_owned().await;
        if self.state.len() >= MAX_VEHICLES {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleRegistered { id, name: name.clone() };
        let state = self.state.clone();
        let committer = self.committer();
        detached(async move {
            let _catalog = catalog;
            committer.wal.append(event.clone()).await?;
            state.insert(id, Arc::new(RwLock::new(VehicleState::new(id, name))));
            committer.notify.send(&event);
            metrics::gauge!(crate::observability::VEHICLES_ACTIVE).set(state.len() as f64);
            Ok::<_, EngineError>(())
        })
        .await?;
        tracing::info!(vehicle = %id, "vehicle registered");
        Ok(())
    }

    /// Remove a vehicle with no active bookings, and its ownership group.
    pub async fn remove_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let catalog = self.catalog.clone().lock_owned().await;
        let guard = self.lock_vehicle(&id).await?;
        if guard.active_count() > 0 {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::VehicleRemoved { id };
        let state = self.state.clone();
        let committer = self.committer();
        let membership = self.stores.membership.clone();
        detached(async move {
            let _catalog = catalog;
            committer.wal.append(event.clone()).await?;
            for b in &guard.bookings {
                committer.index.remove(&b.id);
            }
            state.remove(&id);
            drop(guard);

            committer.notify.send(&event);
            committer.notify.remove(&id);
            if let Err(e) = membership.remove_group(id).await {
                tracing::warn!(vehicle = %id, "ownership group not removed: {e}");
            }
            metrics::gauge!(crate::observability::VEHICLES_ACTIVE).set(state.len() as f64);
            Ok::<_, EngineError>(())
        })
        .await?;
        tracing::info!(vehicle = %id, "vehicle removed");
        Ok(())
    }

    /// Replace the ownership group of a registered vehicle. The group goes to
    /// the membership store and to the ledger, so a restart restores it.
    pub async fn put_group(&self, group: OwnershipGroup) -> Result<(), EngineError> {
        validate_group(&group)?;
        let vehicle_id = group.vehicle_id;
        let mut guard = self.lock_vehicle(&vehicle_id).await?;
        let membership = self.stores.membership.clone();
        let committer = self.committer();
        detached(async move {
            let previous = guard.group.clone();
            membership.put_group(group.clone()).await?;
            if let Err(e) = committer.commit(&mut guard, Event::GroupSet { group }).await {
                let undo = match previous {
                    Some(prev) => membership.put_group(prev).await,
                    None => membership.remove_group(vehicle_id).await,
                };
                if let Err(undo) = undo {
                    tracing::error!(vehicle = %vehicle_id, "membership store diverged from ledger: {undo}");
                }
                return Err(e);
            }
            Ok::<_, EngineError>(())
        })
        .await?;
        tracing::info!(vehicle = %vehicle_id, "ownership group set");
        Ok(())
    }

    pub async fn approve_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Approved).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Cancelled).await
    }

    /// Mark an elapsed approved booking completed and record its usage.
    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.transition(id, BookingStatus::Completed).await?;
        if let Err(e) = self
            .stores
            .usage
            .record_usage(booking.vehicle_id, &booking.user_id, booking.span)
            .await
        {
            tracing::warn!(booking = %id, "usage not recorded: {e}");
        }
        metrics::counter!(crate::observability::BOOKINGS_COMPLETED_TOTAL).increment(1);
        Ok(booking)
    }

    async fn transition(&self, id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let (vehicle_id, guard) = self.lock_booking(&id).await?;
        let from = guard
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }

        let event = match to {
            BookingStatus::Approved => Event::BookingApproved { id, vehicle_id },
            BookingStatus::Cancelled => Event::BookingCancelled { id, vehicle_id },
            BookingStatus::Completed => Event::BookingCompleted { id, vehicle_id },
            BookingStatus::Pending | BookingStatus::Rejected => {
                return Err(EngineError::InvalidTransition { id, from, to });
            }
        };
        let guard = self.persist_and_apply(guard, event).await?;
        tracing::info!(booking = %id, %from, %to, "booking transitioned");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Approved bookings whose interval has elapsed at `now`.
    /// Vehicles busy with a write are skipped; the next sweep picks them up.
    pub fn collect_elapsed(&self, now: Ms) -> Vec<Ulid> {
        let mut elapsed = Vec::new();
        for entry in self.state.iter() {
            if let Ok(guard) = entry.value().try_read() {
                elapsed.extend(
                    guard
                        .bookings
                        .iter()
                        .filter(|b| b.status == BookingStatus::Approved && b.span.end <= now)
                        .map(|b| b.id),
                );
            }
        }
        elapsed
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Terminal bookings that ended a full scoring window before `now` are
    /// dropped from both the log and memory. Holds the catalog lock and every
    /// vehicle's write lock until the rewrite is durable.
    pub async fn compact_wal(&self, now: Ms) -> Result<(), EngineError> {
        let catalog = self.catalog.clone().lock_owned().await;
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(vs) = self.get_vehicle(id) {
                guards.push(vs.write_owned().await);
            }
        }

        let cutoff = now - self.config.scoring_window_ms;
        let committer = self.committer();
        detached(async move {
            let _catalog = catalog;
            let mut events = Vec::new();
            for guard in &guards {
                events.push(Event::VehicleRegistered {
                    id: guard.id,
                    name: guard.name.clone(),
                });
                if let Some(group) = &guard.group {
                    events.push(Event::GroupSet { group: group.clone() });
                }
                events.extend(
                    guard
                        .bookings
                        .iter()
                        .filter(|b| b.retained_at(cutoff))
                        .map(|b| Event::BookingRestored { booking: b.clone() }),
                );
            }

            let count = events.len();
            committer.wal.rewrite(events).await?;
            let mut pruned = 0;
            for guard in &mut guards {
                for id in guard.prune_terminal(cutoff) {
                    committer.index.remove(&id);
                    pruned += 1;
                }
            }
            tracing::info!(vehicles = guards.len(), events = count, pruned, "WAL compacted");
            Ok::<_, EngineError>(())
        })
        .await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

mod admission;
mod availability;
mod conflict;
mod error;
mod mutations;
mod priority;
mod queries;
mod store;
mod suggest;

pub use admission::{BookingRequest, Decision, Outcome, Suggestion, Winner};
pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use priority::{Contender, PriorityFactors, Weights, pick_winner, priority_score, rank, recency_bonus};
pub use store::{InMemoryMembership, InMemoryUsage, MembershipStore, StoreError, UsageStore};

pub use conflict::now_ms;
pub(crate) use conflict::validate_group;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_SUGGESTIONS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Wal, WalHandle};

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;
type VehicleGuard = OwnedRwLockWriteGuard<VehicleState>;

/// Tunables of the admission policy.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub weights: Weights,
    /// Suggestions offered to a rejected request.
    pub max_suggestions: usize,
    /// How far either side of the request the suggestion search looks.
    pub search_horizon_ms: Ms,
    /// Usage inside this window before the request lowers a requester's score.
    pub scoring_window_ms: Ms,
    /// Advance notice at which the recency bonus saturates.
    pub lead_horizon_ms: Ms,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            max_suggestions: 3,
            search_horizon_ms: 14 * DAY_MS,
            scoring_window_ms: 30 * DAY_MS,
            lead_horizon_ms: 7 * DAY_MS,
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.weights.validate()?;
        if self.max_suggestions > MAX_SUGGESTIONS {
            return Err(EngineError::LimitExceeded("too many suggestions requested"));
        }
        if self.search_horizon_ms <= 0 || self.scoring_window_ms <= 0 || self.lead_horizon_ms <= 0 {
            return Err(EngineError::LimitExceeded("horizons must be positive"));
        }
        Ok(())
    }
}

/// Collaborator stores injected into the engine.
#[derive(Clone)]
pub struct Stores {
    pub membership: Arc<dyn MembershipStore>,
    pub usage: Arc<dyn UsageStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            membership: Arc::new(InMemoryMembership::new()),
            usage: Arc::new(InMemoryUsage::new()),
        }
    }
}

pub struct Engine {
    state: Arc<DashMap<Ulid, SharedVehicleState>>,
    /// Reverse lookup: booking id → vehicle id.
    booking_to_vehicle: Arc<DashMap<Ulid, Ulid>>,
    /// Serializes vehicle registration/removal against compaction.
    catalog: Arc<Mutex<()>>,
    wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    stores: Stores,
    config: AdmissionConfig,
}

/// Apply an event to a vehicle's calendar. The caller holds the lock.
fn apply_to_vehicle(vs: &mut VehicleState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingAdmitted { booking, displaced } => {
            for id in displaced {
                vs.set_status(id, BookingStatus::Rejected);
            }
            index.insert(booking.id, vs.id);
            vs.insert_booking(booking.clone());
        }
        Event::BookingRejected { booking } | Event::BookingRestored { booking } => {
            index.insert(booking.id, vs.id);
            vs.insert_booking(booking.clone());
        }
        Event::BookingsDisplaced { ids, .. } => {
            for id in ids {
                vs.set_status(id, BookingStatus::Rejected);
            }
        }
        Event::BookingApproved { id, .. } => {
            vs.set_status(id, BookingStatus::Approved);
        }
        Event::BookingCancelled { id, .. } => {
            vs.set_status(id, BookingStatus::Cancelled);
        }
        Event::BookingCompleted { id, .. } => {
            vs.set_status(id, BookingStatus::Completed);
        }
        Event::GroupSet { group } => {
            vs.group = Some(group.clone());
        }
        // Registration/removal are handled at the DashMap level, not here
        Event::VehicleRegistered { .. } | Event::VehicleRemoved { .. } => {}
    }
}

/// Handles a detached write needs once the caller may be gone.
#[derive(Clone)]
struct Committer {
    wal: WalHandle,
    index: Arc<DashMap<Ulid, Ulid>>,
    notify: Arc<NotifyHub>,
}

impl Committer {
    /// WAL-append + apply + notify. Nothing is applied if the append fails.
    async fn commit(&self, vs: &mut VehicleState, event: Event) -> Result<(), EngineError> {
        self.wal.append(event.clone()).await?;
        apply_to_vehicle(vs, &event, &self.index);
        self.notify.send(&event);
        Ok(())
    }
}

/// Run a write on its own task. Dropping the caller's future then cannot
/// stop it between the WAL append and the in-memory apply.
async fn detached<T, F>(work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
}

impl Engine {
    /// Replay the WAL at `wal_path`, start its writer task and push the
    /// recorded ownership groups back into the membership store.
    pub async fn new(wal_path: PathBuf, stores: Stores, config: AdmissionConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let engine = Self {
            state: Arc::new(DashMap::new()),
            booking_to_vehicle: Arc::new(DashMap::new()),
            catalog: Arc::new(Mutex::new(())),
            wal,
            notify: Arc::new(NotifyHub::new()),
            stores,
            config,
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        for event in &events {
            match event {
                Event::VehicleRegistered { id, name } => {
                    let vs = VehicleState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(vs)));
                }
                Event::VehicleRemoved { id } => {
                    if let Some((_, vs)) = engine.state.remove(id)
                        && let Ok(guard) = vs.try_read()
                    {
                        for b in &guard.bookings {
                            engine.booking_to_vehicle.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(entry) = engine.state.get(&other.vehicle_id())
                        && let Ok(mut guard) = entry.value().try_write()
                    {
                        apply_to_vehicle(&mut guard, other, &engine.booking_to_vehicle);
                    }
                }
            }
        }

        let groups: Vec<OwnershipGroup> = engine
            .state
            .iter()
            .filter_map(|entry| entry.value().try_read().ok().and_then(|vs| vs.group.clone()))
            .collect();
        for group in &groups {
            engine.stores.membership.put_group(group.clone()).await?;
        }

        metrics::gauge!(crate::observability::VEHICLES_ACTIVE).set(engine.state.len() as f64);
        tracing::info!(
            vehicles = engine.state.len(),
            groups = groups.len(),
            bookings = engine.booking_to_vehicle.len(),
            "ledger replayed"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn vehicle_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_vehicle.get(booking_id).map(|e| *e.value())
    }

    fn committer(&self) -> Committer {
        Committer {
            wal: self.wal.clone(),
            index: self.booking_to_vehicle.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Commit `event` against the locked vehicle and hand the lock back.
    /// Runs to completion even if the caller is dropped mid-way.
    async fn persist_and_apply(&self, mut guard: VehicleGuard, event: Event) -> Result<VehicleGuard, EngineError> {
        let committer = self.committer();
        detached(async move {
            committer.commit(&mut guard, event).await?;
            Ok::<_, EngineError>(guard)
        })
        .await
    }

    /// Lock the vehicle's calendar for writing. A vehicle removed while we
    /// waited for the lock is reported as not found.
    async fn lock_vehicle(&self, vehicle_id: &Ulid) -> Result<VehicleGuard, EngineError> {
        let vs = self
            .get_vehicle(vehicle_id)
            .ok_or(EngineError::VehicleNotFound(*vehicle_id))?;
        let guard = vs.clone().write_owned().await;
        let still_registered = self
            .get_vehicle(vehicle_id)
            .is_some_and(|current| Arc::ptr_eq(&current, &vs));
        if !still_registered {
            return Err(EngineError::VehicleNotFound(*vehicle_id));
        }
        Ok(guard)
    }

    /// Booking → vehicle, then lock the vehicle for writing.
    async fn lock_booking(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, VehicleGuard), EngineError> {
        let vehicle_id = self
            .vehicle_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.lock_vehicle(&vehicle_id).await.map_err(|e| match e {
            EngineError::VehicleNotFound(_) => EngineError::NotFound(*booking_id),
            other => other,
        })?;
        Ok((vehicle_id, guard))
    }
}

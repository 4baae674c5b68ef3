use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_spans;
use super::conflict::checked_span;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let vehicle_id = self
            .vehicle_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = vs.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every booking of a vehicle, all statuses, sorted by start.
    pub async fn list_bookings(&self, vehicle_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(guard.bookings.clone())
    }

    pub async fn list_vehicles(&self) -> Vec<VehicleInfo> {
        let handles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut vehicles = Vec::with_capacity(handles.len());
        for vs in handles {
            let guard = vs.read().await;
            vehicles.push(VehicleInfo {
                id: guard.id,
                name: guard.name.clone(),
                active_bookings: guard.active_count(),
            });
        }
        vehicles.sort_by_key(|v| v.id);
        vehicles
    }

    pub async fn group(&self, vehicle_id: Ulid) -> Result<Option<OwnershipGroup>, EngineError> {
        if !self.state.contains_key(&vehicle_id) {
            return Err(EngineError::VehicleNotFound(vehicle_id));
        }
        Ok(self.stores.membership.group(vehicle_id).await?)
    }

    /// Free spans of a vehicle inside `[start, end)`, optionally only those
    /// at least `min_duration_ms` long.
    pub async fn availability(
        &self,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let window = checked_span(start, end)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;

        let mut free = free_spans(&guard, &window, None);
        if let Some(min) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min);
        }
        Ok(free)
    }
}

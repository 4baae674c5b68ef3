//! Collaborator stores consulted by the engine.
//!
//! The engine owns the booking ledger itself; ownership groups and usage
//! history live elsewhere in the platform and are reached through these
//! traits. The in-memory implementations back the server binary and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn group(&self, vehicle_id: Ulid) -> Result<Option<OwnershipGroup>, StoreError>;
    async fn put_group(&self, group: OwnershipGroup) -> Result<(), StoreError>;
    async fn remove_group(&self, vehicle_id: Ulid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Minutes of completed use of `vehicle_id` by `user_id` inside `window`.
    async fn recent_usage_minutes(
        &self,
        vehicle_id: Ulid,
        user_id: &str,
        window: Span,
    ) -> Result<u64, StoreError>;

    async fn record_usage(&self, vehicle_id: Ulid, user_id: &str, span: Span)
        -> Result<(), StoreError>;
}

// ── In-memory implementations ────────────────────────────

#[derive(Default)]
pub struct InMemoryMembership {
    groups: DashMap<Ulid, OwnershipGroup>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembership {
    async fn group(&self, vehicle_id: Ulid) -> Result<Option<OwnershipGroup>, StoreError> {
        Ok(self.groups.get(&vehicle_id).map(|g| g.value().clone()))
    }

    async fn put_group(&self, group: OwnershipGroup) -> Result<(), StoreError> {
        self.groups.insert(group.vehicle_id, group);
        Ok(())
    }

    async fn remove_group(&self, vehicle_id: Ulid) -> Result<(), StoreError> {
        self.groups.remove(&vehicle_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUsage {
    trips: DashMap<(Ulid, String), Vec<Span>>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsage {
    async fn recent_usage_minutes(
        &self,
        vehicle_id: Ulid,
        user_id: &str,
        window: Span,
    ) -> Result<u64, StoreError> {
        let Some(trips) = self.trips.get(&(vehicle_id, user_id.to_string())) else {
            return Ok(0);
        };
        let used_ms: Ms = trips
            .iter()
            .filter(|t| t.overlaps(&window))
            .map(|t| t.end.min(window.end) - t.start.max(window.start))
            .sum();
        Ok((used_ms / MINUTE_MS) as u64)
    }

    async fn record_usage(
        &self,
        vehicle_id: Ulid,
        user_id: &str,
        span: Span,
    ) -> Result<(), StoreError> {
        self.trips
            .entry((vehicle_id, user_id.to_string()))
            .or_default()
            .push(span);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn usage_is_clipped_to_window() {
        let usage = InMemoryUsage::new();
        let vid = Ulid::new();
        usage.record_usage(vid, "ana", Span::new(0, 2 * HOUR_MS)).await.unwrap();
        usage
            .record_usage(vid, "ana", Span::new(10 * HOUR_MS, 11 * HOUR_MS))
            .await
            .unwrap();
        usage.record_usage(vid, "ben", Span::new(0, DAY_MS)).await.unwrap();

        let window = Span::new(HOUR_MS, 12 * HOUR_MS);
        let minutes = usage.recent_usage_minutes(vid, "ana", window).await.unwrap();
        assert_eq!(minutes, 120);

        let other_vehicle = usage
            .recent_usage_minutes(Ulid::new(), "ana", window)
            .await
            .unwrap();
        assert_eq!(other_vehicle, 0);
    }

    #[tokio::test]
    async fn membership_put_and_remove() {
        let store = InMemoryMembership::new();
        let vid = Ulid::new();
        assert!(store.group(vid).await.unwrap().is_none());

        let group = OwnershipGroup {
            vehicle_id: vid,
            members: vec![GroupMember { user_id: "ana".into(), share: 100 }],
            require_approval: false,
        };
        store.put_group(group.clone()).await.unwrap();
        assert_eq!(store.group(vid).await.unwrap(), Some(group));

        store.remove_group(vid).await.unwrap();
        assert!(store.group(vid).await.unwrap().is_none());
    }
}

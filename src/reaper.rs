use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, now_ms};

/// Background task that completes approved bookings whose interval has elapsed.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        sweep(&engine, now_ms()).await;
    }
}

/// One reaper pass; returns how many bookings were completed.
pub async fn sweep(engine: &Engine, now: crate::model::Ms) -> usize {
    let mut completed = 0;
    for id in engine.collect_elapsed(now) {
        match engine.complete_booking(id).await {
            Ok(_) => {
                completed += 1;
                info!("completed elapsed booking {id}");
            }
            Err(e) => {
                // Cancelled or displaced between collection and completion
                tracing::debug!("reaper skip {id}: {e}");
            }
        }
    }
    completed
}

/// Background task that rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal(now_ms()).await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AdmissionConfig, BookingRequest, Stores};
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    const BASE: Ms = 1_767_225_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("evshare_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_completes_elapsed_bookings_and_records_usage() {
        let path = test_wal_path("reaper_sweep.wal");
        let engine = Engine::new(path, Stores::in_memory(), AdmissionConfig::default()).await.unwrap();

        let vid = Ulid::new();
        engine.register_vehicle(vid, None).await.unwrap();
        engine
            .put_group(OwnershipGroup {
                vehicle_id: vid,
                members: vec![GroupMember { user_id: "alice".into(), share: 100 }],
                require_approval: false,
            })
            .await
            .unwrap();

        let decision = engine
            .evaluate(BookingRequest {
                vehicle_id: vid,
                user_id: "alice".into(),
                start: BASE,
                end: BASE + 2 * HOUR_MS,
                estimated_usage_km: None,
                requested_at: BASE - DAY_MS,
            })
            .await
            .unwrap();

        // Not yet over
        assert_eq!(sweep(&engine, BASE + HOUR_MS).await, 0);

        assert_eq!(sweep(&engine, BASE + 2 * HOUR_MS).await, 1);
        let booking = engine.get_booking(decision.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Completed);

        let usage = engine
            .stores()
            .usage
            .recent_usage_minutes(vid, "alice", Span::new(BASE - DAY_MS, BASE + DAY_MS))
            .await
            .unwrap();
        assert_eq!(usage, 120);

        // Nothing left to complete
        assert!(engine.collect_elapsed(BASE + 3 * HOUR_MS).is_empty());
    }
}

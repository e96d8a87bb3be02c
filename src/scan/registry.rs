use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use super::controller::ScanController;

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Live sessions kept at once; the least recently used one goes first.
    pub capacity: usize,
    /// Sessions untouched for longer than this are dropped by the sweeper.
    pub idle_ttl: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            capacity: 256,
            idle_ttl: Duration::from_secs(15 * 60),
        }
    }
}

struct Entry {
    controller: Arc<ScanController>,
    last_seen: Instant,
}

/// In-memory scan sessions keyed by id. Nothing here outlives the process.
/// Evicted sessions have their in-flight run cancelled, which releases the camera.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Entry>>>,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: Arc::default(),
            limits: SessionLimits {
                capacity: limits.capacity.max(1),
                ..limits
            },
        }
    }

    pub fn insert(&self, controller: ScanController) -> (Uuid, Arc<ScanController>) {
        self.insert_at(controller, Instant::now())
    }

    fn insert_at(&self, controller: ScanController, now: Instant) -> (Uuid, Arc<ScanController>) {
        let id = Uuid::new_v4();
        let controller = Arc::new(controller);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.limits.capacity {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(id, _)| *id);
            if let Some((old_id, evicted)) = oldest.and_then(|old| sessions.remove_entry(&old)) {
                info!(session_id = %old_id, capacity = self.limits.capacity, "scan session evicted");
                evicted.controller.cancel();
            }
        }

        sessions.insert(
            id,
            Entry {
                controller: controller.clone(),
                last_seen: now,
            },
        );
        (id, controller)
    }

    /// Looks a session up and marks it as recently used.
    pub fn get(&self, id: &Uuid) -> Option<Arc<ScanController>> {
        self.get_at(id, Instant::now())
    }

    fn get_at(&self, id: &Uuid, now: Instant) -> Option<Arc<ScanController>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.get_mut(id)?;
        entry.last_seen = entry.last_seen.max(now);
        Some(entry.controller.clone())
    }

    /// Removes the session and abandons its in-flight run, releasing the camera.
    pub fn remove(&self, id: &Uuid) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(entry) => {
                entry.controller.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let ttl = self.limits.idle_ttl;
        let mut expired = Vec::new();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, e| {
                let keep = now.saturating_duration_since(e.last_seen) <= ttl;
                if !keep {
                    expired.push(e.controller.clone());
                }
                keep
            });
        for controller in &expired {
            controller.cancel();
        }
        expired.len()
    }

    /// Periodically drops idle sessions for the lifetime of the process.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let every = (self.limits.idle_ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = registry.evict_idle();
                if evicted > 0 {
                    debug!(evicted, remaining = registry.len(), "idle scan sessions evicted");
                }
            }
        })
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::products::model::ProductRecord;
    use crate::products::resolver::ProductResolver;
    use crate::products::source::{ProductSource, SourceError};
    use crate::scan::acquire::SnapshotCamera;
    use crate::scan::decode::{testing::barcode_png, BarcodeDecoder};
    use crate::scan::session::Phase;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// A backing source that never answers, so runs park in Resolving.
    struct Stalled;

    #[async_trait]
    impl ProductSource for Stalled {
        async fn lookup(&self, _code: &str) -> Result<Option<ProductRecord>, SourceError> {
            std::future::pending().await
        }
        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    fn controller() -> ScanController {
        ScanController::new(
            BarcodeDecoder::default(),
            ProductResolver::new(Arc::new(Stalled)),
            Arc::new(SnapshotCamera::default()),
        )
    }

    fn registry(capacity: usize, ttl_secs: u64) -> SessionRegistry {
        SessionRegistry::new(SessionLimits {
            capacity,
            idle_ttl: Duration::from_secs(ttl_secs),
        })
    }

    async fn park_in_resolving(ctrl: &Arc<ScanController>) {
        ctrl.spawn_upload(Bytes::from(barcode_png("5901234123457")));
        let mut rx = ctrl.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == Phase::Resolving))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_their_runs_cancelled() {
        let reg = registry(8, 60);
        let start = Instant::now();
        let (stale_id, stale) = reg.insert_at(controller(), start);
        let (fresh_id, _) = reg.insert_at(controller(), start + Duration::from_secs(100));
        park_in_resolving(&stale).await;

        assert_eq!(reg.evict_idle_at(start + Duration::from_secs(120)), 1);
        assert!(reg.get(&stale_id).is_none());
        assert!(reg.get(&fresh_id).is_some());
        assert_eq!(stale.snapshot().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn full_registry_drops_least_recently_used() {
        let reg = registry(2, 600);
        let start = Instant::now();
        let (first, first_ctrl) = reg.insert_at(controller(), start);
        let (second, _) = reg.insert_at(controller(), start + Duration::from_secs(1));
        park_in_resolving(&first_ctrl).await;

        let (third, _) = reg.insert_at(controller(), start + Duration::from_secs(2));
        assert_eq!(reg.len(), 2);
        assert!(reg.get(&first).is_none());
        assert!(reg.get(&second).is_some());
        assert!(reg.get(&third).is_some());
        assert_eq!(first_ctrl.snapshot().phase, Phase::Idle);
    }

    #[test]
    fn access_refreshes_idle_clock() {
        let reg = registry(8, 60);
        let start = Instant::now();
        let (id, _) = reg.insert_at(controller(), start);
        assert!(reg.get_at(&id, start + Duration::from_secs(50)).is_some());
        assert_eq!(reg.evict_idle_at(start + Duration::from_secs(100)), 0);
        assert_eq!(reg.evict_idle_at(start + Duration::from_secs(111)), 1);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn remove_reports_unknown_ids() {
        let reg = SessionRegistry::default();
        let (id, _) = reg.insert(controller());
        assert!(reg.remove(&id));
        assert!(!reg.remove(&id));
        assert_eq!(reg.len(), 0);
    }
}

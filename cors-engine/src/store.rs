//! Per-source latest observation epoch, latest navigation cache, latest
//! station metadata. One writer per source (the decoder worker for that
//! source), many readers.

use cors_types::{Ephemeris, GTime, GlonassEphemeris, NavRecord, ObservationEpoch, SatObs, SourceId, StationMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Slot<T> {
    value: RwLock<T>,
}

impl<T> Slot<T> {
    fn new(value: T) -> Arc<Self> {
        Arc::new(Self { value: RwLock::new(value) })
    }
}

/// Each source owns one fixed slot per table, created once on first touch;
/// after that, updates are in-place writes to the slot, never a reallocation
/// of the outer map.
#[derive(Default)]
pub struct ObservationStore {
    obs: RwLock<HashMap<SourceId, Arc<Slot<ObservationEpoch>>>>,
    nav: RwLock<HashMap<SourceId, Arc<Slot<NavRecord>>>>,
    meta: RwLock<HashMap<SourceId, Arc<Slot<StationMetadata>>>>,
}

impl ObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn obs_slot(&self, source: SourceId) -> Arc<Slot<ObservationEpoch>> {
        if let Some(slot) = self.obs.read().await.get(&source) {
            return slot.clone();
        }
        let mut w = self.obs.write().await;
        w.entry(source)
            .or_insert_with(|| Slot::new(ObservationEpoch::empty(source)))
            .clone()
    }

    async fn nav_slot(&self, source: SourceId) -> Arc<Slot<NavRecord>> {
        if let Some(slot) = self.nav.read().await.get(&source) {
            return slot.clone();
        }
        let mut w = self.nav.write().await;
        w.entry(source).or_insert_with(|| Slot::new(NavRecord::default())).clone()
    }

    async fn meta_slot(&self, source: SourceId) -> Arc<Slot<StationMetadata>> {
        if let Some(slot) = self.meta.read().await.get(&source) {
            return slot.clone();
        }
        let mut w = self.meta.write().await;
        w.entry(source)
            .or_insert_with(|| Slot::new(StationMetadata::default()))
            .clone()
    }

    /// Atomic whole-epoch replace: readers see either the previous or the
    /// new epoch, never a torn mix of satellites from two epochs.
    pub async fn update_obs(&self, source: SourceId, time: GTime, obs: Vec<SatObs>) {
        let slot = self.obs_slot(source).await;
        let mut guard = slot.value.write().await;
        *guard = ObservationEpoch { source, time, obs };
    }

    pub async fn latest_obs(&self, source: SourceId) -> Option<ObservationEpoch> {
        let slot = {
            let r = self.obs.read().await;
            r.get(&source)?.clone()
        };
        let guard = slot.value.read().await;
        if guard.time.is_zero() {
            None
        } else {
            Some(guard.clone())
        }
    }

    pub async fn update_eph(&self, source: SourceId, eph: Ephemeris) -> bool {
        let slot = self.nav_slot(source).await;
        let mut guard = slot.value.write().await;
        guard.update_eph(eph)
    }

    pub async fn update_geph(&self, source: SourceId, geph: GlonassEphemeris) -> bool {
        let slot = self.nav_slot(source).await;
        let mut guard = slot.value.write().await;
        guard.update_geph(geph)
    }

    pub async fn nav_snapshot(&self, source: SourceId) -> NavRecord {
        let slot = self.nav_slot(source).await;
        slot.value.read().await.clone()
    }

    pub async fn update_metadata(&self, source: SourceId, meta: StationMetadata) {
        let slot = self.meta_slot(source).await;
        *slot.value.write().await = meta;
    }

    pub async fn metadata(&self, source: SourceId) -> Option<StationMetadata> {
        let slot = {
            let r = self.meta.read().await;
            r.get(&source)?.clone()
        };
        Some(slot.value.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cors_types::SourceId;

    #[tokio::test]
    async fn epoch_replace_is_atomic_and_whole() {
        let store = ObservationStore::new();
        let s = SourceId(1);
        store
            .update_obs(s, GTime(100.0), vec![SatObs::new(5), SatObs::new(6)])
            .await;
        let e = store.latest_obs(s).await.unwrap();
        assert_eq!(e.obs.len(), 2);
        assert!((e.time.0 - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn eph_debounce_rejects_same_iode() {
        let store = ObservationStore::new();
        let s = SourceId(1);
        let mut eph = Ephemeris::empty(3);
        eph.iode = 10;
        assert!(store.update_eph(s, eph).await);
        assert!(!store.update_eph(s, eph).await);
        eph.iode = 11;
        assert!(store.update_eph(s, eph).await);
    }
}

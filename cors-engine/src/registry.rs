//! Ground truth mapping of logical station name ↔ numeric id ↔ position ↔
//! NTRIP credentials. Sole writer of ids.

use crate::errors::NotFound;
use cors_types::{Ecef, SourceId, SourceKind};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: String,
    pub id: SourceId,
    pub addr: String,
    pub port: u16,
    pub user: String,
    pub passwd: String,
    pub mntpnt: String,
    pub pos: Ecef,
    pub kind: SourceKind,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_name: HashMap<String, SourceId>,
    by_mntpnt: HashMap<String, SourceId>,
    by_id: HashMap<SourceId, SourceInfo>,
    next_physical_id: i32,
    next_virtual_id: i32,
}

impl RegistryInner {
    fn nearest_linear(&self, target: &Ecef) -> Option<&SourceInfo> {
        self.by_id
            .values()
            .filter(|s| !s.pos.is_zero())
            .min_by(|a, b| {
                a.pos
                    .dist(target)
                    .partial_cmp(&b.pos.dist(target))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Writes are serialized under the single lock; reads take a read guard.
/// Nearest-neighbor is a linear scan over the live set — CORS networks here
/// are in the hundreds-to-low-thousands of stations, well within a scan's
/// budget; a real k-d tree could replace `nearest_linear` without touching
/// callers.
#[derive(Debug, Default)]
pub struct StationRegistry {
    inner: RwLock<RegistryInner>,
}

pub struct NewSource {
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub user: String,
    pub passwd: String,
    pub mntpnt: String,
    pub pos: Ecef,
    pub kind: SourceKind,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                next_physical_id: 1,
                next_virtual_id: -1,
                ..Default::default()
            }),
        }
    }

    pub async fn add(&self, new: NewSource) -> Result<SourceId, NotFound> {
        let mut inner = self.inner.write().await;
        if inner.by_name.contains_key(&new.name) {
            return Err(NotFound::DuplicateName(new.name));
        }
        let id = match new.kind {
            SourceKind::Physical => {
                let id = SourceId(inner.next_physical_id);
                inner.next_physical_id += 1;
                id
            }
            SourceKind::Virtual => {
                let id = SourceId(inner.next_virtual_id);
                inner.next_virtual_id -= 1;
                id
            }
        };
        let info = SourceInfo {
            name: new.name.clone(),
            id,
            addr: new.addr,
            port: new.port,
            user: new.user,
            passwd: new.passwd,
            mntpnt: new.mntpnt,
            pos: new.pos,
            kind: new.kind,
        };
        inner.by_name.insert(new.name, id);
        inner.by_mntpnt.insert(info.mntpnt.clone(), id);
        inner.by_id.insert(id, info);
        Ok(id)
    }

    pub async fn del(&self, name: &str) -> Result<SourceInfo, NotFound> {
        let mut inner = self.inner.write().await;
        let id = inner
            .by_name
            .remove(name)
            .ok_or_else(|| NotFound::Source(name.to_string()))?;
        let info = inner.by_id.remove(&id).expect("by_name/by_id desync");
        inner.by_mntpnt.remove(&info.mntpnt);
        Ok(info)
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<SourceId> {
        self.inner.read().await.by_name.get(name).copied()
    }

    /// A source's `mntpnt` (what rovers `GET` on the Agent) is independent
    /// of its `name` (what console commands and the Solver key baselines
    /// by) — callers that parse an inbound NTRIP request line must resolve
    /// through this, not `lookup_by_name`.
    pub async fn lookup_by_mntpnt(&self, mntpnt: &str) -> Option<SourceId> {
        self.inner.read().await.by_mntpnt.get(mntpnt).copied()
    }

    pub async fn lookup_by_id(&self, id: SourceId) -> Option<SourceInfo> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    pub async fn nearest(&self, pos: &Ecef) -> Option<String> {
        self.inner.read().await.nearest_linear(pos).map(|s| s.name.clone())
    }

    /// Applied when a 1005/1006 decode refines a station's ARP position.
    pub async fn update_position(&self, id: SourceId, pos: Ecef) -> Result<(), NotFound> {
        let mut inner = self.inner.write().await;
        let info = inner.by_id.get_mut(&id).ok_or(NotFound::SourceId(id.0))?;
        info.pos = pos;
        Ok(())
    }

    pub async fn all(&self) -> Vec<SourceInfo> {
        self.inner.read().await.by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(name: &str) -> NewSource {
        NewSource {
            name: name.to_string(),
            addr: "127.0.0.1".into(),
            port: 2101,
            user: "u".into(),
            passwd: "p".into(),
            mntpnt: name.into(),
            pos: Ecef::ZERO,
            kind: SourceKind::Physical,
        }
    }

    #[tokio::test]
    async fn assigns_dense_monotonic_ids_and_rejects_dup_names() {
        let reg = StationRegistry::new();
        let a = reg.add(src("A")).await.unwrap();
        let b = reg.add(src("B")).await.unwrap();
        assert!(b.0 > a.0);
        assert!(matches!(reg.add(src("A")).await, Err(NotFound::DuplicateName(_))));
    }

    #[tokio::test]
    async fn virtual_ids_are_negative_and_disjoint() {
        let reg = StationRegistry::new();
        let mut v = src("V1");
        v.kind = SourceKind::Virtual;
        let id = reg.add(v).await.unwrap();
        assert!(id.is_virtual());
    }

    #[tokio::test]
    async fn lookup_by_mntpnt_resolves_a_mountpoint_distinct_from_name() {
        let reg = StationRegistry::new();
        let mut a = src("STA01");
        a.mntpnt = "RTCM32_GGA".to_string();
        let id = reg.add(a).await.unwrap();

        assert_eq!(reg.lookup_by_mntpnt("RTCM32_GGA").await, Some(id));
        assert_eq!(reg.lookup_by_name("RTCM32_GGA").await, None);
        assert_eq!(reg.lookup_by_name("STA01").await, Some(id));
    }

    #[tokio::test]
    async fn nearest_returns_closest_nonzero_position() {
        let reg = StationRegistry::new();
        let mut a = src("A");
        a.pos = Ecef::new(1000.0, 0.0, 0.0);
        let mut b = src("B");
        b.pos = Ecef::new(100.0, 0.0, 0.0);
        reg.add(a).await.unwrap();
        reg.add(b).await.unwrap();
        let nearest = reg.nearest(&Ecef::new(90.0, 0.0, 0.0)).await;
        assert_eq!(nearest.as_deref(), Some("B"));
    }
}

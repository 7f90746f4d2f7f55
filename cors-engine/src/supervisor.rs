//! The sole writer of the Delaunay network. Runs on a dedicated OS thread,
//! draining control-plane queues for
//! source/virtual-station topology changes, translating triangulation edge
//! diffs into Solver Pool baseline adds/removes, triggering VRS updates on
//! new master epochs, and checking per-triangle ambiguity closure.

use crate::delaunay::{parse_edge_id, DelaunayNetwork, TriangulationDiff};
use crate::solver::SolverPool;
use crate::store::ObservationStore;
use crate::vrs::VrsEngine;
use cors_types::{Ecef, GTime, SolutionQuality, SourceId, NFREQ};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

const TICK_PERIOD: Duration = Duration::from_millis(100);
/// A vertex's incident baselines must carry a solution within this age of
/// the vertex's new epoch before a VRS update is triggered (§4.6 step 2);
/// mirrors the solver's own lenient-mode age since subnet sync runs on this
/// coarser supervisor tick rather than the solver's own dispatch cadence.
const SUBNET_SOLUTION_AGE_SECS: f64 = 15.0;
/// Triangle ambiguity closure is expected to sum to zero; this tolerance
/// absorbs the float engine's own residual noise.
const AMBIGUITY_CLOSURE_TOLERANCE_CYCLES: f64 = 0.3;

pub enum ControlMsg {
    AddSource { id: SourceId, pos: Ecef },
    DelSource { id: SourceId },
    UpdSourcePos { id: SourceId, pos: Ecef },
    AddVirtualStation { id: SourceId, name: String, pos: Ecef },
    DelVirtualStation { id: SourceId },
    Shutdown(oneshot::Sender<()>),
}

pub struct Supervisor {
    control_tx: mpsc::UnboundedSender<ControlMsg>,
}

impl Supervisor {
    /// Spawns the supervisor thread and returns a handle plus the shared,
    /// lock-guarded triangulation that read-only subsystems (Monitor) may
    /// inspect — the Supervisor is the only writer.
    pub fn spawn(
        store: Arc<ObservationStore>,
        solver: Arc<SolverPool>,
        vrs: Arc<VrsEngine>,
    ) -> (Self, Arc<RwLock<DelaunayNetwork>>) {
        let net = Arc::new(RwLock::new(DelaunayNetwork::new()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let loop_net = net.clone();
        std::thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("build supervisor runtime");
                rt.block_on(supervisor_loop(loop_net, store, solver, vrs, control_rx));
            })
            .expect("spawn supervisor thread");

        (Self { control_tx }, net)
    }

    pub fn add_source(&self, id: SourceId, pos: Ecef) {
        let _ = self.control_tx.send(ControlMsg::AddSource { id, pos });
    }

    pub fn del_source(&self, id: SourceId) {
        let _ = self.control_tx.send(ControlMsg::DelSource { id });
    }

    pub fn upd_source_pos(&self, id: SourceId, pos: Ecef) {
        let _ = self.control_tx.send(ControlMsg::UpdSourcePos { id, pos });
    }

    pub fn add_virtual_station(&self, id: SourceId, name: String, pos: Ecef) {
        let _ = self.control_tx.send(ControlMsg::AddVirtualStation { id, name, pos });
    }

    pub fn del_virtual_station(&self, id: SourceId) {
        let _ = self.control_tx.send(ControlMsg::DelVirtualStation { id });
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control_tx.send(ControlMsg::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn supervisor_loop(
    net: Arc<RwLock<DelaunayNetwork>>,
    store: Arc<ObservationStore>,
    solver: Arc<SolverPool>,
    vrs: Arc<VrsEngine>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
) {
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    let mut last_epoch: HashMap<SourceId, GTime> = HashMap::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                subnet_sync_tick(&net, &store, &solver, &vrs, &mut last_epoch).await;
                ambiguity_closure_tick(&net, &solver).await;
            }
            msg = control_rx.recv() => {
                match msg {
                    Some(ControlMsg::AddSource { id, pos }) => {
                        let diff = { net.write().await.add_vertex(id, pos) };
                        apply_diff(&solver, &net, diff).await;
                        vrs.rederive_all_attachments(&*net.read().await).await;
                        reattach_virtual_stations(&net, &vrs).await;
                    }
                    Some(ControlMsg::DelSource { id }) => {
                        let diff = { net.write().await.del_vertex(id) };
                        apply_diff(&solver, &net, diff).await;
                        vrs.rederive_all_attachments(&*net.read().await).await;
                        reattach_virtual_stations(&net, &vrs).await;
                        last_epoch.remove(&id);
                    }
                    Some(ControlMsg::UpdSourcePos { id, pos }) => {
                        // Position drift alone does not re-triangulate.
                        net.write().await.upd_vertex_pos(id, pos);
                        vrs.rederive_all_attachments(&*net.read().await).await;
                        reattach_virtual_stations(&net, &vrs).await;
                    }
                    Some(ControlMsg::AddVirtualStation { id, name, pos }) => {
                        vrs.add_station(id, name, pos).await;
                        vrs.rederive_all_attachments(&*net.read().await).await;
                        reattach_virtual_stations(&net, &vrs).await;
                    }
                    Some(ControlMsg::DelVirtualStation { id }) => {
                        let master = vrs.stations().await.into_iter().find(|s| s.id == id).and_then(|s| s.master);
                        vrs.del_station(id).await;
                        if let Some(master) = master {
                            net.write().await.detach_virtual_station(master, id);
                        }
                    }
                    Some(ControlMsg::Shutdown(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Re-attaches every virtual station's `virtual_stations` back-pointer on
/// its (possibly new) master vertex, after a topology change has driven
/// [`VrsEngine::rederive_all_attachments`].
async fn reattach_virtual_stations(net: &Arc<RwLock<DelaunayNetwork>>, vrs: &Arc<VrsEngine>) {
    let mut g = net.write().await;
    for v in g.vertices().map(|v| v.source).collect::<Vec<_>>() {
        // clear any stale attachments before re-applying current ones
        let stale: Vec<SourceId> = g.vertex(v).map(|vert| vert.virtual_stations.clone()).unwrap_or_default();
        for vsta in stale {
            g.detach_virtual_station(v, vsta);
        }
    }
    for vsta in vrs.stations().await {
        if let Some(master) = vsta.master {
            g.attach_virtual_station(master, vsta.id);
        }
    }
}

/// Translates a [`TriangulationDiff`] into Solver Pool baseline adds/removes,
/// and records the canonical baseline identity on both directed edges of
/// each pair (both directions share one baseline).
async fn apply_diff(solver: &Arc<SolverPool>, net: &Arc<RwLock<DelaunayNetwork>>, diff: TriangulationDiff) {
    let mut processed: HashSet<(SourceId, SourceId)> = HashSet::new();

    for id in &diff.added_edges {
        let Some((a, b)) = parse_edge_id(id) else { continue };
        let baseline = canonical(a, b);
        if !processed.insert(baseline) {
            net.write().await.upd_edge(a, b, Some(baseline));
            continue;
        }
        let (pos_base, pos_rover) = {
            let g = net.read().await;
            (g.vertex(baseline.0).map(|v| v.pos), g.vertex(baseline.1).map(|v| v.pos))
        };
        if let (Some(pos_base), Some(pos_rover)) = (pos_base, pos_rover) {
            solver.add_baseline(baseline.0, baseline.1, pos_base, pos_rover).await;
        }
        net.write().await.upd_edge(a, b, Some(baseline));
    }

    processed.clear();
    for id in &diff.removed_edges {
        let Some((a, b)) = parse_edge_id(id) else { continue };
        let baseline = canonical(a, b);
        if !processed.insert(baseline) {
            continue;
        }
        solver.del_baseline(baseline.0, baseline.1).await;
    }
}

fn canonical(a: SourceId, b: SourceId) -> (SourceId, SourceId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

/// On a new observation epoch for a master vertex, verify the vertex's
/// incident baselines all carry a fresh RTK solution, then invoke the VRS
/// update for every virtual station attached to it.
async fn subnet_sync_tick(
    net: &Arc<RwLock<DelaunayNetwork>>,
    store: &Arc<ObservationStore>,
    solver: &Arc<SolverPool>,
    vrs: &Arc<VrsEngine>,
    last_epoch: &mut HashMap<SourceId, GTime>,
) {
    let vertex_ids: Vec<SourceId> = net.read().await.vertices().map(|v| v.source).collect();

    for id in vertex_ids {
        let Some(epoch) = store.latest_obs(id).await else { continue };
        let is_new = last_epoch.get(&id).map(|t| epoch.time.abs_diff(t) > 1e-9).unwrap_or(true);
        if !is_new {
            continue;
        }
        last_epoch.insert(id, epoch.time);
        net.write().await.mark_epoch_arrival(id, epoch.time);

        let attached = vrs.stations_attached_to(id).await;
        if attached.is_empty() {
            continue;
        }
        if !incident_baselines_fresh(&net.read().await, solver, id, epoch.time).await {
            debug!(source = %id, "subnet sync: incident baselines not fresh, skipping VRS update");
            continue;
        }
        let snapshot = net.read().await;
        for vsta_id in attached {
            vrs.update_station(vsta_id, &snapshot).await;
        }
    }
}

/// True when every incident baseline of `vertex` (that has one) carries a
/// solution within [`SUBNET_SOLUTION_AGE_SECS`] of `epoch_time`. A vertex
/// with no incident baselines (e.g. the lone station before any edge
/// exists) is vacuously fresh.
async fn incident_baselines_fresh(net: &DelaunayNetwork, solver: &Arc<SolverPool>, vertex: SourceId, epoch_time: GTime) -> bool {
    let Some(v) = net.vertex(vertex) else { return false };
    for &eh in &v.edges {
        let Some(edge) = net.edge(eh) else { continue };
        let Some((base, rover)) = edge.baseline else { continue };
        match solver.latest_solution(base, rover).await {
            Some(sol) if sol.time.abs_diff(&epoch_time) < SUBNET_SOLUTION_AGE_SECS => {}
            _ => return false,
        }
    }
    true
}

/// For each triangle whose three baselines all carry a fresh fixed
/// solution at the same epoch, sum the signed double-difference ambiguity
/// residuals per shared satellite/frequency and log any nonzero closure.
async fn ambiguity_closure_tick(net: &Arc<RwLock<DelaunayNetwork>>, solver: &Arc<SolverPool>) {
    let triangles: Vec<crate::delaunay::Triangle> = net.read().await.triangles().cloned().collect();

    for tri in triangles {
        let mut legs = Vec::with_capacity(3);
        let mut complete = true;

        for &eh in &tri.edges {
            let edge = net.read().await.edge(eh).cloned();
            let Some(edge) = edge else {
                complete = false;
                break;
            };
            let Some((base, rover)) = edge.baseline else {
                complete = false;
                break;
            };
            let Some(sol) = solver.latest_solution(base, rover).await else {
                complete = false;
                break;
            };
            if sol.quality != SolutionQuality::Fix {
                complete = false;
                break;
            }
            legs.push((edge, sol));
        }
        if !complete || legs.len() != 3 {
            continue;
        }

        let t0 = legs[0].1.time;
        if !legs.iter().all(|(_, s)| s.time.abs_diff(&t0) < 1e-6) {
            continue;
        }

        let mut shared_sats: HashSet<u8> = legs[0].1.residuals.iter().map(|r| r.sat).collect();
        for (_, sol) in &legs[1..] {
            let these: HashSet<u8> = sol.residuals.iter().map(|r| r.sat).collect();
            shared_sats.retain(|s| these.contains(s));
        }

        for sat in shared_sats {
            for freq in 0..NFREQ {
                let mut sum = 0.0;
                let mut all_present = true;
                for (edge, sol) in &legs {
                    match sol.residual_for(sat, freq) {
                        Some(r) => sum += edge.residual_sign() * r,
                        None => {
                            all_present = false;
                            break;
                        }
                    }
                }
                if !all_present {
                    continue;
                }
                if sum.abs() > AMBIGUITY_CLOSURE_TOLERANCE_CYCLES {
                    warn!(triangle = %tri.id, sat, freq, closure = sum, "triangle ambiguity closure nonzero");
                } else {
                    debug!(triangle = %tri.id, sat, freq, closure = sum, "triangle ambiguity closure holds");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_orders_by_source_id() {
        assert_eq!(canonical(SourceId(3), SourceId(1)), (SourceId(1), SourceId(3)));
        assert_eq!(canonical(SourceId(-2), SourceId(5)), (SourceId(-2), SourceId(5)));
    }

    #[tokio::test]
    async fn apply_diff_creates_exactly_one_baseline_for_a_directed_pair() {
        let store = Arc::new(ObservationStore::new());
        let engine: Arc<dyn crate::kernels::RtkEngine> = Arc::new(crate::kernels::FloatDdEngine::default());
        let solver = Arc::new(SolverPool::new(store, engine, crate::solver::SyncMode::Strict));
        let net = Arc::new(RwLock::new(DelaunayNetwork::new()));

        net.write().await.add_vertex(SourceId(1), Ecef::new(0.0, 0.0, 6_378_137.0));
        let diff = net.write().await.add_vertex(SourceId(2), Ecef::new(100.0, 0.0, 6_378_137.0));

        apply_diff(&solver, &net, diff).await;

        let g = net.read().await;
        let e12 = g.edge_by_id("1→2").unwrap();
        let e21 = g.edge_by_id("2→1").unwrap();
        assert_eq!(e12.baseline, Some((SourceId(1), SourceId(2))));
        assert_eq!(e21.baseline, Some((SourceId(1), SourceId(2))));
    }
}

//! Synthesizes observations for a virtual station from a master station's
//! observations and the surrounding baselines' fixed ambiguity residuals,
//! then encodes the result to RTCM3 for the NTRIP Agent's fan-out.

use crate::delaunay::DelaunayNetwork;
use crate::kernels::{RinexSink, SatelliteGeometry, TroposphereModel, SPEED_OF_LIGHT};
use cors_types::rtcm::crc24q;
use crate::solver::SolverPool;
use crate::store::ObservationStore;
use cors_types::{Ecef, GTime, NFREQ, RtcmFanout};
use cors_types::{ObservationEpoch, SatObs, SourceId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A pragmatic regularization constant; its statistical justification is
/// not independently re-derivable, so it is kept at its known-good value.
pub const VRS_RIDGE_VARIANCE: f64 = 1e-6;
const MIN_SURROUNDING_BASELINES: usize = 2;
/// Subnet-mode fallback: how many nearest vertices to the master are
/// considered as candidate surrounding baselines when a virtual station
/// isn't enclosed in any triangle.
const SUBNET_NEIGHBOR_COUNT: usize = 4;

#[derive(Debug, Clone)]
pub struct VirtualStationState {
    pub name: String,
    pub id: SourceId,
    pub pos: Ecef,
    pub master: Option<SourceId>,
    pub triangle_id: Option<String>,
    pub in_triangle: bool,
}

pub struct VrsEngine {
    stations: RwLock<HashMap<SourceId, VirtualStationState>>,
    store: Arc<ObservationStore>,
    solver: Arc<SolverPool>,
    geom: Arc<dyn SatelliteGeometry>,
    tropo: Arc<dyn TroposphereModel>,
    rinex: Arc<dyn RinexSink>,
    fanout_tx: tokio::sync::mpsc::UnboundedSender<RtcmFanout>,
    /// Guardrail: skip entirely when `in_triangle == false` and strict
    /// mode is set, rather than falling back to a wider subnet search.
    pub strict_triangle_mode: bool,
}

impl VrsEngine {
    pub fn new(
        store: Arc<ObservationStore>,
        solver: Arc<SolverPool>,
        geom: Arc<dyn SatelliteGeometry>,
        tropo: Arc<dyn TroposphereModel>,
        rinex: Arc<dyn RinexSink>,
        fanout_tx: tokio::sync::mpsc::UnboundedSender<RtcmFanout>,
        strict_triangle_mode: bool,
    ) -> Self {
        Self {
            stations: RwLock::new(HashMap::new()),
            store,
            solver,
            geom,
            tropo,
            rinex,
            fanout_tx,
            strict_triangle_mode,
        }
    }

    pub async fn add_station(&self, id: SourceId, name: String, pos: Ecef) {
        self.stations.write().await.insert(
            id,
            VirtualStationState { name, id, pos, master: None, triangle_id: None, in_triangle: false },
        );
    }

    pub async fn del_station(&self, id: SourceId) {
        self.stations.write().await.remove(&id);
    }

    pub async fn stations(&self) -> Vec<VirtualStationState> {
        self.stations.read().await.values().cloned().collect()
    }

    /// Re-derives (master, enclosing triangle) for every virtual station.
    /// Called whenever the triangulation changes; a virtual station's
    /// attachment to a master/triangle is re-derived rather than cached.
    pub async fn rederive_all_attachments(&self, net: &DelaunayNetwork) {
        let mut stations = self.stations.write().await;
        for vsta in stations.values_mut() {
            match net.enclosing_triangle(vsta.pos) {
                Some(tri) => {
                    let master = tri
                        .vertices
                        .iter()
                        .min_by(|a, b| {
                            let pa = net.vertex(**a).map(|v| v.pos).unwrap_or(Ecef::ZERO);
                            let pb = net.vertex(**b).map(|v| v.pos).unwrap_or(Ecef::ZERO);
                            pa.dist(&vsta.pos).partial_cmp(&pb.dist(&vsta.pos)).unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .copied();
                    vsta.master = master;
                    vsta.triangle_id = Some(tri.id.clone());
                    vsta.in_triangle = true;
                }
                None => {
                    vsta.master = None;
                    vsta.triangle_id = None;
                    vsta.in_triangle = false;
                }
            }
        }
    }

    /// Returns the virtual stations attached to `master`, each of which
    /// gets a VRS update whenever a fresh epoch arrives at this vertex.
    pub async fn stations_attached_to(&self, master: SourceId) -> Vec<SourceId> {
        self.stations
            .read()
            .await
            .values()
            .filter(|v| v.master == Some(master))
            .map(|v| v.id)
            .collect()
    }

    /// Runs the full synthesis pipeline for one virtual station given its
    /// master's latest observation epoch and the current triangulation.
    pub async fn update_station(&self, vsta_id: SourceId, net: &DelaunayNetwork) {
        let vsta = {
            let stations = self.stations.read().await;
            match stations.get(&vsta_id) {
                Some(v) => v.clone(),
                None => return,
            }
        };

        if self.strict_triangle_mode && !vsta.in_triangle {
            debug!(name = %vsta.name, "strict mode: skipping VRS update, station not in a triangle");
            return;
        }
        let Some(master) = vsta.master else { return };
        let Some(master_obs) = self.store.latest_obs(master).await else { return };
        let Some(master_meta) = self.store.metadata(master).await else { return };
        let master_pos = master_meta.arp;
        let master_pos = if master_pos.is_zero() {
            net.vertex(master).map(|v| v.pos).unwrap_or(master_pos)
        } else {
            master_pos
        };

        let neighbors = self.surrounding_baselines(&vsta, net, master).await;
        if neighbors.is_empty() {
            debug!(name = %vsta.name, "no surrounding baselines with a fixed solution; skipping");
            return;
        }

        let nav = self.store.nav_snapshot(master).await;
        let mut synth_obs = Vec::new();

        for sat_obs in &master_obs.obs {
            let Some(sat_geom_master) = self.geom.locate(master_obs.time, master_pos, sat_obs.sat, &nav) else {
                continue;
            };
            let sat_geom_virtual = match self.geom.locate(master_obs.time, vsta.pos, sat_obs.sat, &nav) {
                Some(g) => g,
                None => continue,
            };
            let trop_master = self.tropo.delay(master_pos, sat_geom_master.elevation_rad);
            let trop_virtual = self.tropo.delay(vsta.pos, sat_geom_virtual.elevation_rad);
            let enu_displacement = master_pos.enu_vector_to(&vsta.pos);
            let dt_term = SPEED_OF_LIGHT * (sat_geom_virtual.sat_clock_bias - sat_geom_master.sat_clock_bias);
            let geom_term = sat_geom_virtual.range - sat_geom_master.range + trop_virtual - trop_master + dt_term;

            let mut out = SatObs::new(sat_obs.sat);
            let mut any_freq = false;

            for freq in 0..NFREQ {
                if sat_obs.phase[freq] == 0.0 && sat_obs.code[freq] == 0.0 {
                    continue;
                }
                let Some(correction) = self.fit_residual_correction(&neighbors, sat_obs.sat, freq) else {
                    continue;
                };
                let dot = correction.e * enu_displacement.e + correction.n * enu_displacement.n + correction.u * enu_displacement.u;
                let range_term = geom_term + dot;

                let wavelength = SPEED_OF_LIGHT / carrier_freq_hz(freq);
                if sat_obs.phase[freq] != 0.0 {
                    out.phase[freq] = sat_obs.phase[freq] + range_term / wavelength;
                }
                if sat_obs.code[freq] != 0.0 {
                    out.code[freq] = sat_obs.code[freq] + range_term;
                }
                out.snr[freq] = sat_obs.snr[freq];
                any_freq = true;
            }

            if any_freq {
                synth_obs.push(out);
            }
        }

        if synth_obs.is_empty() {
            return;
        }

        let epoch = ObservationEpoch { source: vsta_id, time: master_obs.time, obs: synth_obs };
        self.store.update_obs(vsta_id, epoch.time, epoch.obs.clone()).await;

        let payload = encode_msm_stub(&epoch);
        let _ = self.fanout_tx.send(RtcmFanout { mountpoint: vsta.name.clone(), payload });

        if let Err(e) = self.rinex.write_epoch(&vsta.name, &epoch) {
            warn!(name = %vsta.name, error = %e, "RINEX sink write failed");
        }
    }

    async fn surrounding_baselines(
        &self,
        vsta: &VirtualStationState,
        net: &DelaunayNetwork,
        master: SourceId,
    ) -> Vec<SurroundingBaseline> {
        let mut neighbors = Vec::new();

        // The two edges fanning out from `master` inside the enclosing
        // triangle name exactly the neighbors used for the fit; when the
        // station isn't enclosed in any triangle, fall back to subnet mode:
        // the master's N nearest neighbor vertices by position.
        let candidate_neighbors: Vec<SourceId> = vsta
            .triangle_id
            .as_ref()
            .and_then(|tid| net.triangles().find(|t| &t.id == tid))
            .and_then(|tri| tri.fanout.get(&master).copied())
            .map(|[e1, e2]| [e1, e2].iter().filter_map(|h| net.edge(*h).map(|e| e.b)).collect())
            .unwrap_or_else(|| nearest_neighbor_vertices(net, master, SUBNET_NEIGHBOR_COUNT));

        for neighbor in candidate_neighbors {
            if let Some(sol) = self.solver.latest_solution(master, neighbor).await {
                if sol.quality == cors_types::SolutionQuality::Fix {
                    neighbors.push(SurroundingBaseline { neighbor, solution: sol });
                }
            }
        }
        neighbors
    }

    /// Solves the planar residual-correction model: rows of `H` are
    /// surrounding-baseline ENU vectors, `v` their signed residuals; when
    /// only two baselines are available, a zero-height ridge row
    /// (`VRS_RIDGE_VARIANCE`) is appended to keep the normal-equations
    /// system solvable.
    fn fit_residual_correction(
        &self,
        neighbors: &[SurroundingBaseline],
        sat: u8,
        freq: usize,
    ) -> Option<cors_types::Enu> {
        let mut rows: Vec<([f64; 3], f64, f64)> = Vec::new(); // (enu row, residual, weight)
        for nb in neighbors {
            let Some(resc) = nb.solution.residual_for(sat, freq) else { continue };
            let enu = nb.solution.enu;
            rows.push(([enu.e, enu.n, enu.u], resc, 1.0));
        }
        if rows.len() < MIN_SURROUNDING_BASELINES {
            return None;
        }
        if rows.len() == 2 {
            rows.push(([0.0, 0.0, 1.0], 0.0, 1.0 / VRS_RIDGE_VARIANCE));
        }

        let mut ata = [[0.0f64; 3]; 3];
        let mut atb = [0.0f64; 3];
        for (h, v, w) in &rows {
            for r in 0..3 {
                atb[r] += w * h[r] * v;
                for c in 0..3 {
                    ata[r][c] += w * h[r] * h[c];
                }
            }
        }
        let c = solve3x3(&ata, &atb)?;
        Some(cors_types::Enu { e: c[0], n: c[1], u: c[2] })
    }
}

struct SurroundingBaseline {
    #[allow(dead_code)]
    neighbor: SourceId,
    solution: crate::kernels::RtkSolution,
}

/// Subnet mode: the `n` vertices nearest `master` by straight-line ECEF
/// distance, excluding `master` itself. Used as the surrounding-baseline
/// candidate set for virtual stations outside any triangle.
fn nearest_neighbor_vertices(net: &DelaunayNetwork, master: SourceId, n: usize) -> Vec<SourceId> {
    let Some(master_pos) = net.vertex(master).map(|v| v.pos) else {
        return Vec::new();
    };
    let mut others: Vec<(SourceId, f64)> = net
        .vertices()
        .filter(|v| v.source != master)
        .map(|v| (v.source, v.pos.dist(&master_pos)))
        .collect();
    others.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    others.into_iter().take(n).map(|(id, _)| id).collect()
}

fn solve3x3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut m = *a;
    let mut v = *b;
    for col in 0..3 {
        let mut pivot = col;
        for row in (col + 1)..3 {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        v.swap(col, pivot);
        for row in (col + 1)..3 {
            let f = m[row][col] / m[col][col];
            for c in col..3 {
                m[row][c] -= f * m[col][c];
            }
            v[row] -= f * v[col];
        }
    }
    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let mut sum = v[row];
        for c in (row + 1)..3 {
            sum -= m[row][c] * x[c];
        }
        x[row] = sum / m[row][row];
    }
    Some(x)
}

fn carrier_freq_hz(freq: usize) -> f64 {
    match freq {
        0 => 1_575.42e6, // L1/E1/B1
        1 => 1_227.60e6, // L2
        _ => 1_176.45e6, // L5/E5a/B2a
    }
}

/// Default high-resolution MSM type per constellation band (the
/// 1076/1086/1096/1126/1116 family used in high-resolution mode).
const MSM_HIGH_RES_MSG_NUM: u16 = 1076;

/// Frame/length/CRC are real RTCM3 framing; the payload itself is a
/// compact stand-in for true MSM bit-packing, which stays a black box.
fn encode_msm_stub(epoch: &ObservationEpoch) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push((MSM_HIGH_RES_MSG_NUM >> 4) as u8);
    payload.push(((MSM_HIGH_RES_MSG_NUM & 0xF) << 4) as u8);
    payload.extend_from_slice(&(epoch.source.0).to_be_bytes());
    payload.extend_from_slice(&epoch.time.0.to_be_bytes());
    payload.push(epoch.obs.len() as u8);
    for o in &epoch.obs {
        payload.push(o.sat);
        for f in 0..NFREQ {
            payload.extend_from_slice(&o.code[f].to_be_bytes());
            payload.extend_from_slice(&o.phase[f].to_be_bytes());
        }
    }

    let len = payload.len();
    let mut frame = vec![0xD3u8, ((len >> 8) & 0x03) as u8, (len & 0xFF) as u8];
    frame.extend_from_slice(&payload);
    let crc = crc24q(&frame);
    frame.push((crc >> 16) as u8);
    frame.push((crc >> 8) as u8);
    frame.push(crc as u8);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ridge_row_makes_two_baseline_system_solvable() {
        let ata_input = [([1.0, 0.0, 0.0], 0.5, 1.0), ([0.0, 1.0, 0.0], 0.3, 1.0)];
        let mut ata = [[0.0; 3]; 3];
        let mut atb = [0.0; 3];
        for (h, v, w) in ata_input.iter() {
            for r in 0..3 {
                atb[r] += w * h[r] * v;
                for c in 0..3 {
                    ata[r][c] += w * h[r] * h[c];
                }
            }
        }
        // without the ridge row the 3rd row/col is all zero -> singular
        assert!(solve3x3(&ata, &atb).is_none());

        ata[2][2] += 1.0 / VRS_RIDGE_VARIANCE;
        let sol = solve3x3(&ata, &atb).unwrap();
        assert!((sol[0] - 0.5).abs() < 1e-9);
        assert!((sol[1] - 0.3).abs() < 1e-9);
        assert!(sol[2].abs() < 1e-6);
    }

    #[test]
    fn encode_msm_stub_produces_valid_rtcm3_frame() {
        let epoch = ObservationEpoch { source: SourceId(-1), time: GTime(100.0), obs: vec![SatObs::new(5)] };
        let frame = encode_msm_stub(&epoch);
        assert_eq!(frame[0], 0xD3);
        let len = (((frame[1] & 0x03) as usize) << 8) | frame[2] as usize;
        let crc_expected = crc24q(&frame[..3 + len]);
        let crc_in_frame = ((frame[3 + len] as u32) << 16) | ((frame[3 + len + 1] as u32) << 8) | frame[3 + len + 2] as u32;
        assert_eq!(crc_expected, crc_in_frame);
    }

    #[test]
    fn carrier_freq_matches_l1_band() {
        assert!((carrier_freq_hz(0) - 1_575.42e6).abs() < 1.0);
    }
}

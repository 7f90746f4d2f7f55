//! Numeric kernel interfaces, isolated behind stable pure-function
//! contracts rather than their internals. Everything in this module is a
//! trait plus one stand-in implementation; a real RTKLIB-equivalent
//! PNT/RTK/ephemeris engine could replace any one of these without
//! touching the subsystems that call them (solver, VRS, supervisor).

use cors_types::{Ecef, Enu, GTime, NavRecord, ObservationEpoch, SolutionQuality};
use std::collections::HashMap;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// One emitted frequency band's residual ambiguity, as carried by an
/// [`RtkSolution`] and consumed by the Supervisor's closure check and the
/// VRS engine's residual fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbiguityResidual {
    pub sat: u8,
    pub freq: usize,
    /// Double-difference ambiguity residual in cycles, relative to `ref_sat`.
    pub resc: f64,
}

/// Result of one (rover, base) epoch step.
#[derive(Debug, Clone)]
pub struct RtkSolution {
    pub time: GTime,
    pub quality: SolutionQuality,
    /// Pivot satellite used to form double differences, per frequency band.
    pub ref_sat: HashMap<usize, u8>,
    pub residuals: Vec<AmbiguityResidual>,
    /// Rover-minus-base baseline vector in the base's local ENU frame.
    pub enu: Enu,
}

impl RtkSolution {
    pub fn none(time: GTime) -> Self {
        Self {
            time,
            quality: SolutionQuality::None,
            ref_sat: HashMap::new(),
            residuals: Vec::new(),
            enu: Enu::default(),
        }
    }

    pub fn residual_for(&self, sat: u8, freq: usize) -> Option<f64> {
        self.residuals
            .iter()
            .find(|r| r.sat == sat && r.freq == freq)
            .map(|r| r.resc)
    }
}

/// One (rover, base) epoch-pair step. The real RTKLIB `rtkpos` internals —
/// Kalman filter propagation/update, LAMBDA search — stay a black box;
/// only this contract is needed by the solver, supervisor, and VRS engine
/// above it.
pub trait RtkEngine: Send + Sync {
    fn step(&self, base: &ObservationEpoch, rover: &ObservationEpoch, base_pos: Ecef, rover_pos: Ecef) -> RtkSolution;
}

/// Double-difference float solution with a simple fixed/float classifier:
/// not a full Kalman filter/LAMBDA search, but produces the same solution
/// contract so downstream closure-checking and VRS code is real.
pub struct FloatDdEngine {
    /// Residuals within this many cycles of an integer are classified FIX.
    pub fix_tolerance_cycles: f64,
}

impl Default for FloatDdEngine {
    fn default() -> Self {
        Self { fix_tolerance_cycles: 0.15 }
    }
}

impl RtkEngine for FloatDdEngine {
    fn step(&self, base: &ObservationEpoch, rover: &ObservationEpoch, base_pos: Ecef, rover_pos: Ecef) -> RtkSolution {
        let shared: Vec<u8> = rover
            .obs
            .iter()
            .filter_map(|o| base.find(o.sat).map(|_| o.sat))
            .collect();

        if shared.len() < 2 {
            return RtkSolution::none(rover.time);
        }
        let ref_sat = shared[0];

        let mut residuals = Vec::new();
        let mut all_near_integer = true;
        for &sat in shared.iter().skip(1) {
            for freq in 0..cors_types::NFREQ {
                let rb = base.find(ref_sat).unwrap();
                let rr = rover.find(ref_sat).unwrap();
                let sb = base.find(sat).unwrap();
                let sr = rover.find(sat).unwrap();
                if rb.phase[freq] == 0.0 || rr.phase[freq] == 0.0 || sb.phase[freq] == 0.0 || sr.phase[freq] == 0.0 {
                    continue;
                }
                // single differences, then double difference against ref_sat
                let sd_rover = sr.phase[freq] - rr.phase[freq];
                let sd_base = sb.phase[freq] - rb.phase[freq];
                let dd = sd_rover - sd_base;
                let resc = dd - dd.round();
                if resc.abs() > self.fix_tolerance_cycles {
                    all_near_integer = false;
                }
                residuals.push(AmbiguityResidual { sat, freq, resc });
            }
        }

        let quality = if residuals.is_empty() {
            SolutionQuality::Single
        } else if all_near_integer {
            SolutionQuality::Fix
        } else {
            SolutionQuality::Float
        };

        let mut ref_sat_map = HashMap::new();
        for freq in 0..cors_types::NFREQ {
            ref_sat_map.insert(freq, ref_sat);
        }

        RtkSolution {
            time: rover.time,
            quality,
            ref_sat: ref_sat_map,
            residuals,
            enu: base_pos.enu_vector_to(&rover_pos),
        }
    }
}

/// Single point positioning from one epoch's pseudoranges. Stand-in:
/// weighted code-only least-squares, the trilateration Gauss-Newton
/// normal-equations pattern generalized from 2D anchors to 4D (x, y, z,
/// clock bias).
pub trait PntSolver: Send + Sync {
    fn solve(&self, obs: &ObservationEpoch, nav: &NavRecord, geom: &dyn SatelliteGeometry) -> PntResult;
}

#[derive(Debug, Clone, Copy)]
pub struct PntResult {
    pub quality: SolutionQuality,
    pub pos: Ecef,
    pub clock_bias: f64,
}

pub struct GaussNewtonPnt {
    pub max_iter: u32,
    pub converge_threshold: f64,
}

impl Default for GaussNewtonPnt {
    fn default() -> Self {
        Self { max_iter: 10, converge_threshold: 1e-3 }
    }
}

impl PntSolver for GaussNewtonPnt {
    fn solve(&self, obs: &ObservationEpoch, nav: &NavRecord, geom: &dyn SatelliteGeometry) -> PntResult {
        if obs.obs.len() < 4 {
            return PntResult { quality: SolutionQuality::None, pos: Ecef::ZERO, clock_bias: 0.0 };
        }
        let mut x = [0.0f64; 4]; // x, y, z, clock bias (meters)
        for iter in 0..self.max_iter {
            let mut atwa = [[0.0f64; 4]; 4];
            let mut atwb = [0.0f64; 4];
            let mut n_used = 0;
            let station = Ecef::new(x[0], x[1], x[2]);

            for sat_obs in &obs.obs {
                let pr = sat_obs.code[0];
                if pr == 0.0 {
                    continue;
                }
                let Some(sg) = geom.locate(obs.time, station, sat_obs.sat, nav) else {
                    continue;
                };
                if sg.elevation_rad < 5f64.to_radians() {
                    continue;
                }
                let predicted = sg.range + x[3] - SPEED_OF_LIGHT * sg.sat_clock_bias;
                let residual = pr - predicted;

                let d = sat_obs.sat; // jacobian direction stand-in below uses geometry helper
                let _ = d;
                let los = sg.line_of_sight;
                let jac = [-los[0], -los[1], -los[2], 1.0];

                for r in 0..4 {
                    atwb[r] += jac[r] * residual;
                    for c in 0..4 {
                        atwa[r][c] += jac[r] * jac[c];
                    }
                }
                n_used += 1;
            }

            if n_used < 4 {
                return PntResult { quality: SolutionQuality::None, pos: Ecef::ZERO, clock_bias: 0.0 };
            }

            let Some(delta) = solve4x4(&atwa, &atwb) else {
                return PntResult { quality: SolutionQuality::None, pos: Ecef::ZERO, clock_bias: 0.0 };
            };
            let mut update_norm = 0.0;
            for i in 0..4 {
                x[i] += delta[i];
                update_norm += delta[i] * delta[i];
            }
            if update_norm.sqrt() < self.converge_threshold {
                break;
            }
            let _ = iter;
        }

        PntResult {
            quality: SolutionQuality::Single,
            pos: Ecef::new(x[0], x[1], x[2]),
            clock_bias: x[3] / SPEED_OF_LIGHT,
        }
    }
}

/// Gaussian elimination with partial pivoting for the 4x4 normal-equations
/// system; returns `None` when the system is singular (insufficient/degenerate geometry).
fn solve4x4(a: &[[f64; 4]; 4], b: &[f64; 4]) -> Option<[f64; 4]> {
    let mut m = *a;
    let mut v = *b;
    for col in 0..4 {
        let mut pivot = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        v.swap(col, pivot);
        for row in (col + 1)..4 {
            let f = m[row][col] / m[col][col];
            for c in col..4 {
                m[row][c] -= f * m[col][c];
            }
            v[row] -= f * v[col];
        }
    }
    let mut x = [0.0; 4];
    for row in (0..4).rev() {
        let mut sum = v[row];
        for c in (row + 1)..4 {
            sum -= m[row][c] * x[c];
        }
        x[row] = sum / m[row][row];
    }
    Some(x)
}

/// Satellite position/clock/elevation at a station and epoch from broadcast
/// ephemerides. Stand-in: simplified Keplerian propagation, sufficient to
/// produce a geometric range, elevation, clock bias, and line-of-sight
/// unit vector; GLONASS/other constellations fall back to a straight-line
/// position/velocity propagation of their broadcast state vector.
pub trait SatelliteGeometry: Send + Sync {
    fn locate(&self, time: GTime, station: Ecef, sat: u8, nav: &NavRecord) -> Option<SatGeometry>;
}

#[derive(Debug, Clone, Copy)]
pub struct SatGeometry {
    pub sat_pos: Ecef,
    pub range: f64,
    pub elevation_rad: f64,
    pub sat_clock_bias: f64,
    pub line_of_sight: [f64; 3],
}

const MU_EARTH: f64 = 3.986005e14;
const OMEGA_EARTH: f64 = 7.2921151467e-5;

pub struct KeplerianGeometry;

impl SatelliteGeometry for KeplerianGeometry {
    fn locate(&self, time: GTime, station: Ecef, sat: u8, nav: &NavRecord) -> Option<SatGeometry> {
        if let Some(eph) = nav.current_eph(sat) {
            return Some(locate_keplerian(time, station, eph));
        }
        if let Some(geph) = nav.current_geph(sat) {
            return Some(locate_glonass(time, station, geph));
        }
        None
    }
}

fn locate_keplerian(time: GTime, station: Ecef, eph: &cors_types::Ephemeris) -> SatGeometry {
    let a = eph.sqrt_a * eph.sqrt_a;
    let dt = time.diff(&eph.toe);
    let n0 = (MU_EARTH / a.powi(3)).sqrt();
    let n = n0 + eph.delta_n;
    let m = eph.m0 + n * dt;

    let mut ecc_anom = m;
    for _ in 0..8 {
        ecc_anom = m + eph.e * ecc_anom.sin();
    }

    let v = 2.0 * ((1.0 + eph.e).sqrt() * (ecc_anom / 2.0).sin()).atan2((1.0 - eph.e).sqrt() * (ecc_anom / 2.0).cos());
    let phi = v + eph.omega;
    let du = eph.cus * (2.0 * phi).sin() + eph.cuc * (2.0 * phi).cos();
    let dr = eph.crs * (2.0 * phi).sin() + eph.crc * (2.0 * phi).cos();
    let di = eph.cis * (2.0 * phi).sin() + eph.cic * (2.0 * phi).cos();

    let u = phi + du;
    let r = a * (1.0 - eph.e * ecc_anom.cos()) + dr;
    let inc = eph.i0 + di + eph.idot * dt;

    let x_orb = r * u.cos();
    let y_orb = r * u.sin();

    let omega = eph.omega0 + (eph.omega_dot - OMEGA_EARTH) * dt - OMEGA_EARTH * eph.toe.0;

    let sat_pos = Ecef::new(
        x_orb * omega.cos() - y_orb * inc.cos() * omega.sin(),
        x_orb * omega.sin() + y_orb * inc.cos() * omega.cos(),
        y_orb * inc.sin(),
    );

    let clock_bias = eph.af0 + eph.af1 * time.diff(&eph.toc) + eph.af2 * time.diff(&eph.toc).powi(2);

    geometry_from(station, sat_pos, clock_bias)
}

fn locate_glonass(time: GTime, station: Ecef, geph: &cors_types::GlonassEphemeris) -> SatGeometry {
    let dt = time.diff(&geph.toe);
    let sat_pos = Ecef::new(
        geph.pos[0] + geph.vel[0] * dt + 0.5 * geph.acc[0] * dt * dt,
        geph.pos[1] + geph.vel[1] * dt + 0.5 * geph.acc[1] * dt * dt,
        geph.pos[2] + geph.vel[2] * dt + 0.5 * geph.acc[2] * dt * dt,
    );
    geometry_from(station, sat_pos, -geph.taun)
}

fn geometry_from(station: Ecef, sat_pos: Ecef, clock_bias: f64) -> SatGeometry {
    let d = sat_pos.sub(&station);
    let range = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
    let los = [d[0] / range, d[1] / range, d[2] / range];
    let enu = station.enu_vector_to(&sat_pos);
    let horiz = enu.horizontal_len();
    let elevation_rad = enu.u.atan2(horiz);
    SatGeometry { sat_pos, range, elevation_rad, sat_clock_bias: clock_bias, line_of_sight: los }
}

/// Saastamoinen zenith delay + elevation mapping function. A real,
/// non-stand-in implementation: closed-form and small enough that a
/// black-box interface would only add indirection.
pub trait TroposphereModel: Send + Sync {
    fn delay(&self, station: Ecef, elevation_rad: f64) -> f64;
}

pub struct Saastamoinen;

impl TroposphereModel for Saastamoinen {
    fn delay(&self, station: Ecef, elevation_rad: f64) -> f64 {
        let height = station.to_geodetic().height.max(0.0);
        let pressure = 1013.25 * (1.0 - 2.2557e-5 * height).powf(5.2568);
        let temp_k = 291.15 - 6.5e-3 * height;
        let rel_humidity = 0.5;
        let e = rel_humidity
            * (-37.2465 + 0.213166 * temp_k - 0.000256908 * temp_k * temp_k).exp();

        let zenith_dry = 0.0022768 * pressure / (1.0 - 0.00266 * (2.0 * 0.0_f64).cos() - 0.00028 * height / 1000.0);
        let zenith_wet = 0.0022768 * (1255.0 / temp_k + 0.05) * e;
        let zenith = zenith_dry + zenith_wet;

        let elevation = elevation_rad.max(5f64.to_radians());
        let mapping = 1.0 / elevation.sin();
        zenith * mapping
    }
}

/// Optional per-virtual-station RINEX observation sink. RINEX I/O is a
/// non-goal as a primary product here; this hook exists only so the call
/// site is real.
pub trait RinexSink: Send + Sync {
    fn write_epoch(&self, station_name: &str, epoch: &ObservationEpoch) -> std::io::Result<()>;
}

pub struct NoopRinexSink;

impl RinexSink for NoopRinexSink {
    fn write_epoch(&self, _station_name: &str, _epoch: &ObservationEpoch) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cors_types::{SatObs, SourceId};

    #[test]
    fn float_dd_engine_classifies_fix_when_residuals_near_integer() {
        let engine = FloatDdEngine::default();
        let mut base = cors_types::ObservationEpoch::empty(SourceId(1));
        let mut rover = cors_types::ObservationEpoch::empty(SourceId(2));
        base.time = GTime(10.0);
        rover.time = GTime(10.0);

        for sat in [1u8, 2, 3] {
            let mut o = SatObs::new(sat);
            o.phase[0] = sat as f64 * 100.0;
            base.obs.push(o);
            let mut o2 = SatObs::new(sat);
            o2.phase[0] = sat as f64 * 100.0 + 5.0; // integer cycle offset
            rover.obs.push(o2);
        }

        let sol = engine.step(&base, &rover, Ecef::new(1.0, 0.0, 0.0), Ecef::new(1.0, 1.0, 0.0));
        assert_eq!(sol.quality, SolutionQuality::Fix);
    }

    #[test]
    fn float_dd_engine_none_with_insufficient_shared_sats() {
        let engine = FloatDdEngine::default();
        let base = cors_types::ObservationEpoch::empty(SourceId(1));
        let rover = cors_types::ObservationEpoch::empty(SourceId(2));
        let sol = engine.step(&base, &rover, Ecef::ZERO, Ecef::ZERO);
        assert_eq!(sol.quality, SolutionQuality::None);
    }

    #[test]
    fn saastamoinen_delay_decreases_towards_zenith() {
        let model = Saastamoinen;
        let station = cors_types::geo::Geodetic { lat: 0.6, lon: 0.2, height: 100.0 }.to_ecef();
        let low = model.delay(station, 10f64.to_radians());
        let high = model.delay(station, 90f64.to_radians());
        assert!(low > high);
    }
}

//! Observation epochs and the navigation (broadcast ephemeris) cache, per §3.

use crate::ids::SourceId;
use crate::time::GTime;
use serde::{Deserialize, Serialize};

pub const MAXOBS: usize = 64;
pub const NFREQ: usize = 3;
pub const EPH_SLOTS_DEFAULT: usize = 3;
pub const EPH_SLOTS_GLONASS: usize = 2;

/// One satellite's code/phase/doppler/SNR observation on up to `NFREQ` bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SatObs {
    pub sat: u8,
    pub code: [f64; NFREQ],
    pub phase: [f64; NFREQ],
    pub doppler: [f32; NFREQ],
    pub snr: [f32; NFREQ],
    pub lli: [u8; NFREQ],
}

impl SatObs {
    pub fn new(sat: u8) -> Self {
        Self {
            sat,
            code: [0.0; NFREQ],
            phase: [0.0; NFREQ],
            doppler: [0.0; NFREQ],
            snr: [0.0; NFREQ],
            lli: [0; NFREQ],
        }
    }
}

/// Per-source observation epoch. Replaced atomically (§4.2): readers never
/// observe a half-written set of satellites for a time instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEpoch {
    pub source: SourceId,
    pub time: GTime,
    pub obs: Vec<SatObs>,
}

impl ObservationEpoch {
    pub fn empty(source: SourceId) -> Self {
        Self {
            source,
            time: GTime::default(),
            obs: Vec::new(),
        }
    }

    pub fn find(&self, sat: u8) -> Option<&SatObs> {
        self.obs.iter().find(|o| o.sat == sat)
    }
}

/// GPS/Galileo/BeiDou/QZSS-family broadcast ephemeris (Keplerian elements).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ephemeris {
    pub sat: u8,
    pub iode: i32,
    pub toe: GTime,
    pub toc: GTime,
    pub sqrt_a: f64,
    pub e: f64,
    pub i0: f64,
    pub omega0: f64,
    pub omega: f64,
    pub m0: f64,
    pub delta_n: f64,
    pub idot: f64,
    pub omega_dot: f64,
    pub cus: f64,
    pub cuc: f64,
    pub crs: f64,
    pub crc: f64,
    pub cis: f64,
    pub cic: f64,
    pub af0: f64,
    pub af1: f64,
    pub af2: f64,
}

impl Ephemeris {
    pub fn empty(sat: u8) -> Self {
        Self {
            sat,
            iode: -1,
            toe: GTime::default(),
            toc: GTime::default(),
            sqrt_a: 0.0,
            e: 0.0,
            i0: 0.0,
            omega0: 0.0,
            omega: 0.0,
            m0: 0.0,
            delta_n: 0.0,
            idot: 0.0,
            omega_dot: 0.0,
            cus: 0.0,
            cuc: 0.0,
            crs: 0.0,
            crc: 0.0,
            cis: 0.0,
            cic: 0.0,
            af0: 0.0,
            af1: 0.0,
            af2: 0.0,
        }
    }
}

/// GLONASS broadcast ephemeris (position/velocity/acceleration at reference time).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlonassEphemeris {
    pub sat: u8,
    pub iode: i32,
    pub toe: GTime,
    pub pos: [f64; 3],
    pub vel: [f64; 3],
    pub acc: [f64; 3],
    pub taun: f64,
    pub gamn: f64,
}

impl GlonassEphemeris {
    pub fn empty(sat: u8) -> Self {
        Self {
            sat,
            iode: -1,
            toe: GTime::default(),
            pos: [0.0; 3],
            vel: [0.0; 3],
            acc: [0.0; 3],
            taun: 0.0,
            gamn: 0.0,
        }
    }
}

/// Debounced three-bucket (GPS-family) / two-bucket (GLONASS) ephemeris
/// cache per satellite (§3 "Navigation Record"). A newest ephemeris replaces
/// the current bucket only if its IODE differs from both current and
/// previous — this debounces identical re-broadcasts, which arrive every
/// subframe cycle.
#[derive(Debug, Clone, Default)]
pub struct EphRing<T> {
    slots: Vec<T>,
    cap: usize,
}

impl<T: Clone> EphRing<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            slots: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn current(&self) -> Option<&T> {
        self.slots.first()
    }

    pub fn slots(&self) -> &[T] {
        &self.slots
    }
}

impl EphRing<Ephemeris> {
    /// Apply the debounce update rule; returns true if the cache changed.
    /// Only current and previous are checked (not the 3rd/oldest bucket),
    /// per §3's "differs from both current and previous".
    pub fn update(&mut self, new_eph: Ephemeris) -> bool {
        let dup = self.slots.iter().take(2).any(|e| e.iode == new_eph.iode);
        if dup {
            return false;
        }
        self.slots.insert(0, new_eph);
        self.slots.truncate(self.cap);
        true
    }
}

impl EphRing<GlonassEphemeris> {
    pub fn update(&mut self, new_eph: GlonassEphemeris) -> bool {
        let dup = self.slots.iter().any(|e| e.iode == new_eph.iode);
        if dup {
            return false;
        }
        self.slots.insert(0, new_eph);
        self.slots.truncate(self.cap);
        true
    }
}

/// Full per-source navigation cache: one `EphRing` per GPS-family satellite
/// slot plus one per GLONASS PRN slot, keyed loosely by satellite number.
#[derive(Debug, Clone, Default)]
pub struct NavRecord {
    pub gps_family: std::collections::HashMap<u8, EphRing<Ephemeris>>,
    pub glonass: std::collections::HashMap<u8, EphRing<GlonassEphemeris>>,
    pub ion_gps: [f64; 8],
    pub utc_gps: [f64; 8],
}

impl NavRecord {
    pub fn update_eph(&mut self, eph: Ephemeris) -> bool {
        self.gps_family
            .entry(eph.sat)
            .or_insert_with(|| EphRing::new(EPH_SLOTS_DEFAULT))
            .update(eph)
    }

    pub fn update_geph(&mut self, geph: GlonassEphemeris) -> bool {
        self.glonass
            .entry(geph.sat)
            .or_insert_with(|| EphRing::new(EPH_SLOTS_GLONASS))
            .update(geph)
    }

    pub fn current_eph(&self, sat: u8) -> Option<&Ephemeris> {
        self.gps_family.get(&sat).and_then(|r| r.current())
    }

    pub fn current_geph(&self, sat: u8) -> Option<&GlonassEphemeris> {
        self.glonass.get(&sat).and_then(|r| r.current())
    }
}

/// Antenna/receiver descriptor written on 1005/1006/1007/1008/1033 (§3 "Station Metadata").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationMetadata {
    pub antenna_descriptor: String,
    pub receiver_descriptor: String,
    pub antenna_offset: [f64; 3],
    pub arp: crate::geo::Ecef,
}

//! GPS-ish time handling. Observation epochs, ephemeris timestamps, and
//! solver sync windows are all compared as seconds since the Unix epoch
//! (f64), which is sufficient precision for the millisecond-scale sync
//! windows in §4.4/§4.6 and avoids pulling in a full GNSS-time crate for a
//! single scalar.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct GTime(pub f64);

impl GTime {
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(dur.as_secs_f64())
    }

    pub fn diff(&self, other: &GTime) -> f64 {
        self.0 - other.0
    }

    pub fn abs_diff(&self, other: &GTime) -> f64 {
        self.diff(other).abs()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}

impl Default for GTime {
    fn default() -> Self {
        Self(0.0)
    }
}

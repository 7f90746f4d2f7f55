//! Decoder output contract (§4.3): "a tagged variant ∈ {None, Observation,
//! Navigation(sat, nav_set), StationPos, StationDesc, Other}".

use crate::obs::{Ephemeris, GlonassEphemeris, ObservationEpoch, StationMetadata};

#[derive(Debug, Clone)]
pub enum NavUpdate {
    Gps(Ephemeris),
    Glonass(GlonassEphemeris),
}

#[derive(Debug, Clone)]
pub enum DecodedMessage {
    None,
    Observation(ObservationEpoch),
    Navigation(NavUpdate),
    StationPos(crate::geo::Ecef),
    StationDesc(StationMetadata),
    Other(u16),
}

/// One RTCM3 payload destined for every rover connected to `mountpoint`
/// (§4.3 "enqueue RTCM passthrough to NTRIP-Agent fan-out queue keyed by
/// source name", §4.7 step 4, §4.8 "Fan-out"). Shared between the ingest
/// decoder's observation passthrough and the VRS engine's synthetic stream,
/// so the Agent's fan-out task only ever drains one channel shape.
#[derive(Debug, Clone)]
pub struct RtcmFanout {
    pub mountpoint: String,
    pub payload: Vec<u8>,
}

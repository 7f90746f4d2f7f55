//! # cors-types
//!
//! Domain types shared between `cors-engine` and `cors-sim`: identifiers and
//! arena handles, ECEF/ENU geometry, GPS-style time, observation epochs and
//! the navigation cache, the decoder's output contract, and the small
//! string-backed enums used throughout the service.
//!
//! Nothing here owns subsystem state or logic — it is the wire-adjacent
//! vocabulary both binaries agree on.

pub mod geo;
pub mod ids;
pub mod messages;
pub mod obs;
pub mod quality;
pub mod rtcm;
pub mod time;

pub use geo::{CentroidProjector, Ecef, Enu, Geodetic};
pub use ids::{
    BaselineHandle, EdgeHandle, RoverConnHandle, SourceId, TriangleHandle, VertexHandle,
    VirtualStationHandle,
};
pub use messages::{DecodedMessage, NavUpdate, RtcmFanout};
pub use obs::{
    Ephemeris, GlonassEphemeris, NavRecord, ObservationEpoch, SatObs, StationMetadata, MAXOBS,
    NFREQ,
};
pub use quality::{ConnState, SolutionQuality, SourceKind};
pub use time::GTime;

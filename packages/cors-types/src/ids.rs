//! Identifiers and arena handles shared across every subsystem.
//!
//! Per the arena-with-handles design note, cross-structure links (vertex ↔
//! edge, triangle ↔ edge, baseline ↔ edge) are plain integers into a `Vec`-backed
//! arena, never raw pointers or address-keyed hash tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense identifier assigned by the Station Registry. Positive ids are
/// physical sources; negative ids are virtual stations (disjoint namespace,
/// §3 "Virtual Station"). Never reused once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(pub i32);

impl SourceId {
    pub fn is_virtual(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! arena_handle {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

arena_handle!(VertexHandle, "Arena slot for a triangulation vertex.");
arena_handle!(EdgeHandle, "Arena slot for a directed triangulation edge.");
arena_handle!(TriangleHandle, "Arena slot for a triangulation triangle.");
arena_handle!(BaselineHandle, "Arena slot for an RTK baseline filter instance.");
arena_handle!(VirtualStationHandle, "Arena slot for a virtual (VRS) station.");
arena_handle!(RoverConnHandle, "Arena slot for an NTRIP Agent rover connection.");

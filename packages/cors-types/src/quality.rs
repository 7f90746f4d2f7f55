//! Solution-quality and connection-state enums, given `strum` string
//! conversions for their wire/log representations.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// RTK solution quality (§GLOSSARY "FIX / FLOAT").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SolutionQuality {
    None,
    Single,
    Float,
    Fix,
}

impl Default for SolutionQuality {
    fn default() -> Self {
        Self::None
    }
}

/// Logical kind of a Station Registry entry (§3 "Source").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SourceKind {
    Physical,
    Virtual,
}

/// NTRIP Agent rover connection lifecycle state (§3 "Rover Connection").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ConnState {
    AwaitingRequest,
    Authenticated,
}

//! Canned network layouts exercising the testable properties a running
//! cors-engine is expected to satisfy end to end. Each scenario bundles the
//! synthetic source profiles a caster simulator should serve and, where
//! relevant, a rover config to drive against the engine's Agent. These are
//! the fixtures `cors-sim run <scenario>` hands to `caster_sim`/`rover_sim`;
//! the actual pass/fail judgment is left to whatever is polling the
//! engine's monitor API, not to this binary.

use crate::caster_sim::SourceProfile;
use crate::rover_sim::RoverConfig;
use cors_types::Ecef;
use std::time::Duration;

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub sources: Vec<SourceProfile>,
    pub rover: Option<RoverConfig>,
}

fn station(mountpoint: &'static str, station_id: u16, pos: Ecef, n_sats: u8) -> SourceProfile {
    SourceProfile {
        mountpoint: mountpoint.to_string(),
        station_id,
        pos,
        n_sats,
        msg_num: 1077, // MSM7 GPS, within the observation-family range
        epoch_period: Duration::from_secs(1),
    }
}

/// S1 (ingest -> pnt): a single physical source streaming observations,
/// enough for the Observation Store to hold a decoded epoch and for a PNT
/// result to come out the other side.
pub fn s1_ingest_to_pnt() -> Scenario {
    Scenario {
        name: "s1",
        description: "single source; expect the store to hold a decoded epoch and a PNT fix to publish",
        sources: vec![station("BASE01", 1, Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0), 8)],
        rover: None,
    }
}

/// S2 (baseline sync): two sources close enough to form one baseline,
/// streaming synchronized epochs; expect a steady run of published
/// solutions with monotonic time.
pub fn s2_baseline_sync() -> Scenario {
    Scenario {
        name: "s2",
        description: "two-source baseline; expect one solution per synchronized epoch pair",
        sources: vec![
            station("BASEA", 1, Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0), 8),
            station("BASEB", 2, Ecef::new(-2_070_100.0, 4_380_050.0, 4_090_020.0), 8),
        ],
        rover: None,
    }
}

/// S3 (triangulation diff): four non-collinear sources; the engine's
/// supervisor should weave them into a Delaunay network reachable via
/// `/triangulation` on the monitor.
pub fn s3_triangulation_diff() -> Scenario {
    Scenario {
        name: "s3",
        description: "four-source network; expect a triangulated edge/triangle count via monitor /triangulation",
        sources: vec![
            station("TRIA", 1, Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0), 8),
            station("TRIB", 2, Ecef::new(-2_070_500.0, 4_380_000.0, 4_090_000.0), 8),
            station("TRIC", 3, Ecef::new(-2_070_250.0, 4_380_400.0, 4_090_000.0), 8),
            station("TRID", 4, Ecef::new(-2_070_250.0, 4_380_150.0, 4_090_400.0), 8),
        ],
        rover: None,
    }
}

/// S4 (closure): a tight three-station triangle, all three baselines close
/// enough to the same epochs that their ambiguity residuals should sum near
/// zero around the loop.
pub fn s4_triangle_closure() -> Scenario {
    Scenario {
        name: "s4",
        description: "three mutually short baselines; expect small signed DD ambiguity closure per satellite",
        sources: vec![
            station("CLOA", 1, Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0), 10),
            station("CLOB", 2, Ecef::new(-2_070_080.0, 4_380_020.0, 4_090_010.0), 10),
            station("CLOC", 3, Ecef::new(-2_070_040.0, 4_380_070.0, 4_090_030.0), 10),
        ],
        rover: None,
    }
}

/// S5 (VRS near master): one physical source streaming, paired with a
/// virtual station 1 m away configured separately in the engine's vstas
/// file; this scenario only needs the master streaming.
pub fn s5_vrs_near_master() -> Scenario {
    Scenario {
        name: "s5",
        description: "master source near a configured virtual station; expect sub-cm synthetic divergence",
        sources: vec![station("VMASTER", 1, Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0), 10)],
        rover: None,
    }
}

/// S6 (agent remap): an anchor source plus a rover on the aggregator
/// mountpoint, moving its GGA fix from near one configured virtual station
/// to another.
pub fn s6_agent_remap() -> Scenario {
    let v1 = Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0);
    Scenario {
        name: "s6",
        description: "rover on RTCM32 moves from near V1 to near V2; expect a mountpoint remap with a leading 1005",
        sources: vec![station("ANCHOR", 1, v1, 8)],
        rover: Some(RoverConfig {
            addr: "127.0.0.1".to_string(),
            port: 2102,
            mountpoint: "RTCM32".to_string(),
            user: "sim".to_string(),
            passwd: "sim".to_string(),
            gga_period: Duration::from_secs(3),
        }),
    }
}

pub fn by_name(name: &str) -> Option<Scenario> {
    match name {
        "s1" => Some(s1_ingest_to_pnt()),
        "s2" => Some(s2_baseline_sync()),
        "s3" => Some(s3_triangulation_diff()),
        "s4" => Some(s4_triangle_closure()),
        "s5" => Some(s5_vrs_near_master()),
        "s6" => Some(s6_agent_remap()),
        _ => None,
    }
}

pub fn all_names() -> &'static [&'static str] {
    &["s1", "s2", "s3", "s4", "s5", "s6"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_scenario_name_resolves() {
        for name in all_names() {
            assert!(by_name(name).is_some());
        }
    }
}

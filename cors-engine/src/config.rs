//! Config-file and CSV side-file loading.
//!
//! The top-level format is `key = value` lines with `#` comments, not
//! TOML/YAML/JSON — a bespoke line format gets a bespoke small parser rather
//! than a generic one, matching how little schema it actually has.

use crate::errors::ConfigError;
use clap::Parser;
use cors_types::Ecef;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Engine binary CLI flags.
#[derive(Debug, Parser)]
#[command(name = "cors-engine", about = "CORS network-RTK service")]
pub struct Cli {
    /// Path to the `key = value` config file.
    #[arg(short = 'o', long = "config")]
    pub config: Option<PathBuf>,

    /// Trace (log) verbosity level, 1-5.
    #[arg(short = 't', long = "trace", default_value_t = 2)]
    pub trace_level: u8,

    /// Console tty device (ignored when stdin is used as the console).
    #[arg(short = 'd', long = "tty")]
    pub tty: Option<String>,

    /// Start the service immediately instead of waiting for a `start` command.
    #[arg(short = 's', long = "start")]
    pub start: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CorsOptions {
    pub ntrip_sources_file: String,
    pub trace_file: String,
    pub baselines_file: String,
    pub bstas_info_file: String,
    pub vstas_file: String,
    pub agent_user_file: String,
    pub rtk_conf_file: String,
    pub pnt_conf_file: String,
    pub monitor_port: u16,
    pub agent_port: u16,
}

/// Parses the top-level `key = value` config file into a plain map, then
/// projects the known keys into `CorsOptions`. Unknown keys are ignored
/// (forward-compatible, matches the original's table-driven lookup which
/// silently skips keys it doesn't recognize).
pub fn load_options(path: &Path) -> Result<CorsOptions, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut kv = HashMap::new();
    for (line_no, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::MalformedLine {
                line_no: line_no + 1,
                text: raw.to_string(),
            });
        };
        kv.insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(CorsOptions {
        ntrip_sources_file: kv.get("ntrip-sources-file").cloned().unwrap_or_default(),
        trace_file: kv.get("trace-file").cloned().unwrap_or_default(),
        baselines_file: kv.get("baselines-file").cloned().unwrap_or_default(),
        bstas_info_file: kv.get("base-stations-info-file").cloned().unwrap_or_default(),
        vstas_file: kv.get("virtual-stations-file").cloned().unwrap_or_default(),
        agent_user_file: kv.get("agent-user-file").cloned().unwrap_or_default(),
        rtk_conf_file: kv.get("rtk-conf-file").cloned().unwrap_or_default(),
        pnt_conf_file: kv.get("pnt-conf-file").cloned().unwrap_or_default(),
        monitor_port: kv
            .get("monitor-port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(2101),
        // Distinct from monitor-port's default: the two listeners bind
        // independently at startup and must never collide.
        agent_port: kv
            .get("agent-port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(2102),
    })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// `name,addr,port,user,passwd,mntpnt,lat,lon,h`
#[derive(Debug, Clone)]
pub struct SourceConfigRow {
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub user: String,
    pub passwd: String,
    pub mntpnt: String,
    pub pos: Ecef,
}

/// `base,rover`
#[derive(Debug, Clone)]
pub struct BaselineConfigRow {
    pub base: String,
    pub rover: String,
}

/// `id,address,province,city,lat,lon,h,itrf,type`
#[derive(Debug, Clone)]
pub struct StationInfoRow {
    pub id: i32,
    pub address: String,
    pub province: String,
    pub city: String,
    pub pos: Ecef,
    pub itrf: String,
    pub station_type: String,
}

/// `name,x,y,z` (ECEF)
#[derive(Debug, Clone)]
pub struct VirtualStationRow {
    pub name: String,
    pub pos: Ecef,
}

/// `user,passwd`
#[derive(Debug, Clone)]
pub struct UserRow {
    pub user: String,
    pub passwd: String,
}

fn read_csv_rows(path: &str) -> Result<Vec<(usize, Vec<String>)>, ConfigError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    let mut rows = Vec::new();
    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rows.push((line_no + 1, line.split(',').map(|s| s.trim().to_string()).collect()));
    }
    Ok(rows)
}

fn field<'a>(
    path: &str,
    line_no: usize,
    raw: &str,
    cols: &'a [String],
    idx: usize,
) -> Result<&'a str, ConfigError> {
    cols.get(idx).map(String::as_str).ok_or_else(|| ConfigError::MalformedCsvRow {
        path: path.to_string(),
        line_no,
        text: raw.to_string(),
    })
}

fn parse_f64(path: &str, line_no: usize, raw: &str, s: &str) -> Result<f64, ConfigError> {
    s.parse().map_err(|_| ConfigError::MalformedCsvRow {
        path: path.to_string(),
        line_no,
        text: raw.to_string(),
    })
}

const D2R: f64 = std::f64::consts::PI / 180.0;

pub fn load_sources_csv(path: &str) -> Result<Vec<SourceConfigRow>, ConfigError> {
    let mut out = Vec::new();
    for (line_no, cols) in read_csv_rows(path)? {
        let raw = cols.join(",");
        let lat = parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 6)?)? * D2R;
        let lon = parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 7)?)? * D2R;
        let h = parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 8)?)?;
        out.push(SourceConfigRow {
            name: field(path, line_no, &raw, &cols, 0)?.to_string(),
            addr: field(path, line_no, &raw, &cols, 1)?.to_string(),
            port: field(path, line_no, &raw, &cols, 2)?
                .parse()
                .map_err(|_| ConfigError::MalformedCsvRow { path: path.to_string(), line_no, text: raw.clone() })?,
            user: field(path, line_no, &raw, &cols, 3)?.to_string(),
            passwd: field(path, line_no, &raw, &cols, 4)?.to_string(),
            mntpnt: field(path, line_no, &raw, &cols, 5)?.to_string(),
            pos: cors_types::geo::Geodetic { lat, lon, height: h }.to_ecef(),
        });
    }
    Ok(out)
}

pub fn load_baselines_csv(path: &str) -> Result<Vec<BaselineConfigRow>, ConfigError> {
    let mut out = Vec::new();
    for (line_no, cols) in read_csv_rows(path)? {
        let raw = cols.join(",");
        out.push(BaselineConfigRow {
            base: field(path, line_no, &raw, &cols, 0)?.to_string(),
            rover: field(path, line_no, &raw, &cols, 1)?.to_string(),
        });
    }
    Ok(out)
}

pub fn load_station_info_csv(path: &str) -> Result<Vec<StationInfoRow>, ConfigError> {
    let mut out = Vec::new();
    for (line_no, cols) in read_csv_rows(path)? {
        let raw = cols.join(",");
        let lat = parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 4)?)? * D2R;
        let lon = parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 5)?)? * D2R;
        let h = parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 6)?)?;
        out.push(StationInfoRow {
            id: field(path, line_no, &raw, &cols, 0)?
                .parse()
                .map_err(|_| ConfigError::MalformedCsvRow { path: path.to_string(), line_no, text: raw.clone() })?,
            address: field(path, line_no, &raw, &cols, 1)?.to_string(),
            province: field(path, line_no, &raw, &cols, 2)?.to_string(),
            city: field(path, line_no, &raw, &cols, 3)?.to_string(),
            pos: cors_types::geo::Geodetic { lat, lon, height: h }.to_ecef(),
            itrf: field(path, line_no, &raw, &cols, 7)?.to_string(),
            station_type: field(path, line_no, &raw, &cols, 8)?.to_string(),
        });
    }
    Ok(out)
}

pub fn load_virtual_stations_csv(path: &str) -> Result<Vec<VirtualStationRow>, ConfigError> {
    let mut out = Vec::new();
    for (line_no, cols) in read_csv_rows(path)? {
        let raw = cols.join(",");
        out.push(VirtualStationRow {
            name: field(path, line_no, &raw, &cols, 0)?.to_string(),
            pos: Ecef::new(
                parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 1)?)?,
                parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 2)?)?,
                parse_f64(path, line_no, &raw, field(path, line_no, &raw, &cols, 3)?)?,
            ),
        });
    }
    Ok(out)
}

pub fn load_users_csv(path: &str) -> Result<Vec<UserRow>, ConfigError> {
    let mut out = Vec::new();
    for (line_no, cols) in read_csv_rows(path)? {
        let raw = cols.join(",");
        out.push(UserRow {
            user: field(path, line_no, &raw, &cols, 0)?.to_string(),
            passwd: field(path, line_no, &raw, &cols, 1)?.to_string(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_key_value_with_comments() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "ntrip-sources-file = sources.csv # comment").unwrap();
        writeln!(f, "monitor-port = 2101").unwrap();
        writeln!(f, "agent-port = 2102").unwrap();
        let opts = load_options(f.path()).unwrap();
        assert_eq!(opts.ntrip_sources_file, "sources.csv");
        assert_eq!(opts.monitor_port, 2101);
        assert_eq!(opts.agent_port, 2102);
    }
}

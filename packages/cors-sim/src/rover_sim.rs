//! Synthetic NTRIP rover: connects outbound to a running cors-engine's
//! Agent, authenticates, sends periodic `$GNGGA` fixes, and reports which
//! mountpoint each received RTCM3 frame claims to originate from (by
//! message number) so a driver script can assert on VRS remap behavior
//! (S6) without a real receiver.
//!
//! Grounded on `cors-engine::ingest`'s own client half for the request/
//! auth/keepalive shape, mirrored here from the rover's side of the wire.

use base64::Engine as _;
use cors_types::rtcm::CRC_LEN;
use cors_types::{Ecef, Geodetic};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

pub struct RoverConfig {
    pub addr: String,
    pub port: u16,
    pub mountpoint: String,
    pub user: String,
    pub passwd: String,
    pub gga_period: Duration,
}

/// Connects, authenticates, and streams GGA fixes from `fixes` (one per
/// `gga_period` tick, looping once exhausted) while logging every RTCM3
/// frame's message number as it arrives. Runs until `duration` elapses.
pub async fn run(cfg: RoverConfig, fixes: Vec<Ecef>, duration: Duration) -> std::io::Result<()> {
    let mut sock = TcpStream::connect((cfg.addr.as_str(), cfg.port)).await?;

    let mut request = format!("GET /{} HTTP/1.0\r\n", cfg.mountpoint);
    request.push_str("User-Agent: NTRIP cors-sim-rover/1.0\r\n");
    if !cfg.user.is_empty() {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", cfg.user, cfg.passwd));
        request.push_str(&format!("Authorization: Basic {auth}\r\n"));
    }
    request.push_str("\r\n");
    sock.write_all(request.as_bytes()).await?;

    let mut buf = vec![0u8; 4096];
    let n = sock.read(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]);
    let status_line = head.lines().next().unwrap_or("");
    if !(status_line.contains("200") || status_line.starts_with("ICY")) {
        return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, status_line.to_string()));
    }
    info!(mountpoint = %cfg.mountpoint, "rover simulator connected");

    let header_len = head.find("\r\n\r\n").map(|i| i + 4).unwrap_or(n);
    let mut framebuf = buf[header_len..n].to_vec();

    let (mut read_half, mut write_half) = sock.into_split();
    let mut gga_ticker = tokio::time::interval(cfg.gga_period);
    let mut fix_idx = 0usize;
    let deadline = tokio::time::Instant::now() + duration;

    loop {
        if tokio::time::Instant::now() >= deadline {
            return Ok(());
        }
        tokio::select! {
            read = read_half.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                framebuf.extend_from_slice(&buf[..n]);
                for msg_num in drain_frames(&mut framebuf) {
                    info!(mountpoint = %cfg.mountpoint, msg_num, "rover simulator received frame");
                }
            }
            _ = gga_ticker.tick() => {
                if fixes.is_empty() {
                    continue;
                }
                let pos = fixes[fix_idx % fixes.len()];
                fix_idx += 1;
                let sentence = gga_sentence(pos);
                if write_half.write_all(sentence.as_bytes()).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Extracts every complete RTCM3 frame's message number from `buf`, leaving
/// any trailing partial frame in place for the next read. Mirrors the
/// preamble/length walk in `cors-engine::rtcm_decoder::FrameSync` without
/// needing CRC validation, since these frames came straight off the wire
/// this process itself trusts.
fn drain_frames(buf: &mut Vec<u8>) -> Vec<u16> {
    const PREAMBLE: u8 = 0xD3;
    const HEADER_LEN: usize = 3;
    let mut out = Vec::new();
    let mut consumed = 0usize;
    loop {
        let Some(start) = buf[consumed..].iter().position(|&b| b == PREAMBLE) else {
            consumed = buf.len();
            break;
        };
        let start = consumed + start;
        if buf.len() < start + HEADER_LEN {
            consumed = start;
            break;
        }
        let len = (((buf[start + 1] & 0x03) as usize) << 8) | buf[start + 2] as usize;
        let total = HEADER_LEN + len + CRC_LEN;
        if buf.len() < start + total {
            consumed = start;
            break;
        }
        let payload = &buf[start + HEADER_LEN..start + HEADER_LEN + len];
        let msg_num = if payload.len() >= 2 {
            ((payload[0] as u16) << 4) | (payload[1] >> 4) as u16
        } else {
            0
        };
        out.push(msg_num);
        consumed = start + total;
    }
    buf.drain(..consumed);
    out
}

fn gga_sentence(pos: Ecef) -> String {
    let g: Geodetic = pos.to_geodetic();
    let lat_deg = g.lat.to_degrees();
    let lon_deg = g.lon.to_degrees();
    let lat_hem = if lat_deg >= 0.0 { 'N' } else { 'S' };
    let lon_hem = if lon_deg >= 0.0 { 'E' } else { 'W' };
    let lat_abs = lat_deg.abs();
    let lon_abs = lon_deg.abs();
    let lat_ddmm = (lat_abs.trunc() * 100.0) + (lat_abs.fract() * 60.0);
    let lon_ddmm = (lon_abs.trunc() * 100.0) + (lon_abs.fract() * 60.0);
    let body = format!(
        "GNGGA,000000.00,{lat_ddmm:09.4},{lat_hem},{lon_ddmm:010.4},{lon_hem},1,08,1.0,{:.2},M,0.0,M,,",
        g.height
    );
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_frames_extracts_msg_num_and_leaves_partial_tail() {
        let payload = cors_types::rtcm::encode_observation_filler(1077, 4);
        let frame = cors_types::rtcm::frame_payload(&payload);
        let mut buf = frame.clone();
        buf.extend_from_slice(&frame[..5]); // trailing partial frame

        let nums = drain_frames(&mut buf);
        assert_eq!(nums, vec![1077]);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn gga_sentence_checksum_is_valid() {
        let pos = Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0);
        let sentence = gga_sentence(pos);
        let (body, checksum) = sentence.trim_end().split_once('*').unwrap();
        let body = &body[1..];
        let expected = body.bytes().fold(0u8, |acc, b| acc ^ b);
        assert_eq!(u8::from_str_radix(checksum, 16).unwrap(), expected);
    }
}

//! Synthetic NTRIP caster: a tiny stand-in for a physical base station's
//! upstream caster, speaking just enough of the protocol for a running
//! cors-engine's ingest pool to log in against it (`GET /<mountpoint>
//! HTTP/1.0`, optional `Authorization: Basic`) and then receive a steady
//! stream of framed RTCM3 observation/position records.
//!
//! Mirrors `cors-engine`'s own `ingest::connect_and_stream` for the wire
//! shape this has to answer; the listener itself is one task per inbound
//! connection behind a coarse per-station mutex.

use cors_types::rtcm::{encode_observation_filler, encode_station_1005, frame_payload};
use cors_types::Ecef;
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// One synthetic physical station this caster serves under its own
/// mountpoint name.
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub mountpoint: String,
    pub station_id: u16,
    pub pos: Ecef,
    pub n_sats: u8,
    pub msg_num: u16,
    pub epoch_period: Duration,
}

/// Runs a caster on `bind_addr` serving every profile in `sources`, until
/// the process is killed. Each accepted connection is matched against the
/// requested mountpoint; unknown mountpoints get a 404 and are dropped.
pub async fn run(bind_addr: String, sources: Vec<SourceProfile>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, n_sources = sources.len(), "caster simulator listening");
    loop {
        let (sock, peer) = listener.accept().await?;
        let sources = sources.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(sock, peer, sources).await {
                debug!(%peer, error = %e, "caster simulator connection ended");
            }
        });
    }
}

async fn serve_connection(
    sock: TcpStream,
    peer: std::net::SocketAddr,
    sources: Vec<SourceProfile>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = sock.into_split();
    let mut lines = BufReader::new(read_half);

    let mut request_line = String::new();
    lines.read_line(&mut request_line).await?;
    let Some(mountpoint) = request_line.strip_prefix("GET /").and_then(|s| s.split_whitespace().next()) else {
        return Ok(());
    };
    let mountpoint = mountpoint.to_string();

    // Drain header lines up to the blank line terminating an HTTP/1.0 request.
    let mut header = String::new();
    loop {
        header.clear();
        if lines.read_line(&mut header).await? == 0 || header.trim_end().is_empty() {
            break;
        }
    }

    let Some(profile) = sources.into_iter().find(|s| s.mountpoint == mountpoint) else {
        write_half.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await?;
        return Ok(());
    };

    write_half.write_all(b"ICY 200 OK\r\n\r\n").await?;
    info!(%mountpoint, %peer, "caster simulator accepted ingest connection");

    // Open with a station ARP record so the engine's registry gets a real position.
    let arp = frame_payload(&encode_station_1005(profile.station_id, profile.pos));
    write_half.write_all(&arp).await?;

    // Drain GGA keepalives from the ingest client in the background; the
    // caster doesn't act on them, only needs to not block the socket.
    let drain = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match lines.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let mut ticker = tokio::time::interval(profile.epoch_period);
    let mut rng = rand::thread_rng();
    loop {
        ticker.tick().await;
        // A satellite or two drops in and out of view each epoch, same as a
        // real receiver's changing elevation mask.
        let jitter: i16 = rng.gen_range(-1..=1);
        let n_sats = (profile.n_sats as i16 + jitter).clamp(1, cors_types::MAXOBS as i16) as u8;
        let payload = encode_observation_filler(profile.msg_num, n_sats);
        let frame = frame_payload(&payload);
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    drain.abort();
    warn!(%mountpoint, "caster simulator stream ended");
    Ok(())
}

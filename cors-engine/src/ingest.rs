//! A pool of outbound TCP clients, one per upstream physical source, each
//! logging in as an NTRIP rover against that source's mountpoint and
//! streaming RTCM3 bytes back into this process.
//!
//! A raw `TcpStream`, a hand-written HTTP/1.0 request line plus
//! `Authorization: Basic` header, then a read loop feeding a byte buffer to
//! a frame parser. The decoder fan-out runs inline against
//! [`crate::rtcm_decoder::RtcmDecoderPool`]: the decoder worker is, in this
//! implementation, the tail end of each ingest task rather than a separate
//! pool.

use crate::pnt::PntQueue;
use crate::registry::StationRegistry;
use crate::rtcm_decoder::RtcmDecoderPool;
use crate::store::ObservationStore;
use crate::supervisor::Supervisor;
use base64::Engine as _;
use cors_types::{DecodedMessage, Ecef, NavUpdate, RtcmFanout, SourceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sources are grouped into caster partitions of at most this many. Each
/// ingest task here is its own Tokio task rather than a partition-owning OS
/// thread, since the per-source work is I/O-bound and the runtime already
/// multiplexes tasks across its worker threads.
pub const MAX_SOURCES_PER_PARTITION: usize = 1024;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const GGA_KEEPALIVE_PERIOD: Duration = Duration::from_secs(3);
const READ_BUF_SIZE: usize = 4096;

pub struct IngestClientConfig {
    pub source: SourceId,
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub user: String,
    pub passwd: String,
    pub mntpnt: String,
    /// Approximate position sent upstream in the keepalive GGA, refined once
    /// a 1005/1006 arrives for this source.
    pub approx_pos: Ecef,
}

/// The pool of ingest clients. `stop_flags` lets [`IngestPool::remove`]
/// signal a running task to exit on its next I/O-suspension point, a
/// cooperative cancellation model.
pub struct IngestPool {
    decoder: Arc<RtcmDecoderPool>,
    store: Arc<ObservationStore>,
    registry: Arc<StationRegistry>,
    supervisor: Arc<Supervisor>,
    pnt: PntQueue,
    fanout_tx: mpsc::UnboundedSender<RtcmFanout>,
    stop_flags: tokio::sync::Mutex<std::collections::HashMap<SourceId, Arc<AtomicBool>>>,
}

impl IngestPool {
    pub fn new(
        decoder: Arc<RtcmDecoderPool>,
        store: Arc<ObservationStore>,
        registry: Arc<StationRegistry>,
        supervisor: Arc<Supervisor>,
        pnt: PntQueue,
        fanout_tx: mpsc::UnboundedSender<RtcmFanout>,
    ) -> Arc<Self> {
        Arc::new(Self {
            decoder,
            store,
            registry,
            supervisor,
            pnt,
            fanout_tx,
            stop_flags: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Spawns the per-source ingest task. A no-op if this source already has
    /// a running client (idempotent re-add, e.g. on config reload).
    pub async fn add_source(self: &Arc<Self>, cfg: IngestClientConfig) {
        let mut flags = self.stop_flags.lock().await;
        if flags.contains_key(&cfg.source) {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        flags.insert(cfg.source, stop.clone());
        drop(flags);

        let pool = self.clone();
        tokio::spawn(async move {
            pool.run_client(cfg, stop).await;
        });
    }

    /// Signals the running client for `source` to stop; it exits at its next
    /// suspension point (socket read or reconnect sleep).
    pub async fn remove_source(&self, source: SourceId) {
        if let Some(flag) = self.stop_flags.lock().await.remove(&source) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    async fn run_client(&self, cfg: IngestClientConfig, stop: Arc<AtomicBool>) {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        while !stop.load(Ordering::SeqCst) {
            match self.connect_and_stream(&cfg, &stop).await {
                Ok(()) => {
                    // Clean EOF or explicit stop: reset backoff for the next attempt.
                    backoff = RECONNECT_BACKOFF_INITIAL;
                }
                Err(e) => {
                    // Transient I/O: reported at trace level, handled
                    // by automatic reconnect. Never escalated.
                    debug!(source = %cfg.name, error = %e, "ingest connection error, reconnecting");
                }
            }
            if stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
        info!(source = %cfg.name, "ingest client stopped");
    }

    async fn connect_and_stream(&self, cfg: &IngestClientConfig, stop: &Arc<AtomicBool>) -> std::io::Result<()> {
        let mut sock = TcpStream::connect((cfg.addr.as_str(), cfg.port)).await?;

        let mut request = format!("GET /{} HTTP/1.0\r\n", cfg.mntpnt);
        request.push_str(&format!("User-Agent: NTRIP cors-engine/{}\r\n", env!("CARGO_PKG_VERSION")));
        if !cfg.user.is_empty() {
            let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", cfg.user, cfg.passwd));
            request.push_str(&format!("Authorization: Basic {auth}\r\n"));
        }
        request.push_str("\r\n");
        sock.write_all(request.as_bytes()).await?;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = sock.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty response"));
        }
        let head = String::from_utf8_lossy(&buf[..n]);
        let status_line = head.lines().next().unwrap_or("");
        if !(status_line.contains("200") || status_line.starts_with("ICY")) {
            warn!(source = %cfg.name, status = %status_line, "ingest rejected by upstream caster");
            return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, status_line.to_string()));
        }

        // Anything after the header line in this first read is already RTCM3.
        let header_len = head.find("\r\n\r\n").map(|i| i + 4).unwrap_or(n);
        let leftover = buf[header_len..n].to_vec();

        info!(source = %cfg.name, "ingest connected");

        let (mut read_half, mut write_half) = sock.into_split();
        let mut gga_ticker = tokio::time::interval(GGA_KEEPALIVE_PERIOD);
        gga_ticker.tick().await; // consume the immediate first tick

        if !leftover.is_empty() {
            self.handle_bytes(cfg, &leftover).await;
        }

        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                read = read_half.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"));
                    }
                    self.handle_bytes(cfg, &buf[..n]).await;
                }
                _ = gga_ticker.tick() => {
                    // The NTRIP client sends a GGA keepalive every 3 s.
                    let pos = self.registry.lookup_by_id(cfg.source).await.map(|s| s.pos).unwrap_or(cfg.approx_pos);
                    let sentence = gngga_sentence(pos);
                    if write_half.write_all(sentence.as_bytes()).await.is_err() {
                        return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gga write failed"));
                    }
                }
            }
        }
    }

    /// The decoder fan-out, performed inline at the tail of the ingest
    /// task that owns this source's byte stream.
    async fn handle_bytes(&self, cfg: &IngestClientConfig, data: &[u8]) {
        let decoded = self.decoder.decode_with_raw(cfg.source, data).await;
        for (raw, msg) in decoded {
            match msg {
                DecodedMessage::Observation(epoch) => {
                    self.store.update_obs(cfg.source, epoch.time, epoch.obs).await;
                    self.pnt.enqueue(cfg.source);
                    let _ = self.fanout_tx.send(RtcmFanout { mountpoint: cfg.mntpnt.clone(), payload: raw });
                }
                DecodedMessage::Navigation(NavUpdate::Gps(eph)) => {
                    self.store.update_eph(cfg.source, eph).await;
                }
                DecodedMessage::Navigation(NavUpdate::Glonass(geph)) => {
                    self.store.update_geph(cfg.source, geph).await;
                }
                DecodedMessage::StationPos(pos) => {
                    if self.registry.update_position(cfg.source, pos).await.is_ok() {
                        self.supervisor.upd_source_pos(cfg.source, pos);
                    }
                    let mut meta = self.store.metadata(cfg.source).await.unwrap_or_default();
                    meta.arp = pos;
                    self.store.update_metadata(cfg.source, meta).await;
                }
                DecodedMessage::StationDesc(meta) => {
                    let mut existing = self.store.metadata(cfg.source).await.unwrap_or_default();
                    existing.antenna_descriptor = meta.antenna_descriptor;
                    existing.receiver_descriptor = meta.receiver_descriptor;
                    existing.antenna_offset = meta.antenna_offset;
                    self.store.update_metadata(cfg.source, existing).await;
                }
                DecodedMessage::Other(_) | DecodedMessage::None => {}
            }
        }
    }
}

/// Builds a minimal `$GNGGA` sentence from an ECEF position, used for the
/// upstream keepalive (only `$GNGGA` is emitted upstream as keepalive).
/// Precision beyond keeping the upstream mountpoint alive is not needed —
/// this engine is not itself a positioning client.
fn gngga_sentence(pos: Ecef) -> String {
    let g = pos.to_geodetic();
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
    fn gga_sentence_has_valid_checksum() {
        let pos = Ecef::new(-2_070_000.0, 4_380_000.0, 4_090_000.0);
        let sentence = gngga_sentence(pos);
        assert!(sentence.starts_with("$GNGGA"));
        let (body, checksum) = sentence.trim_end().split_once('*').unwrap();
        let body = &body[1..];
        let expected = body.bytes().fold(0u8, |acc, b| acc ^ b);
        assert_eq!(u8::from_str_radix(checksum, 16).unwrap(), expected);
    }
}

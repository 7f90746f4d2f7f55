//! Accepts rover connections, authenticates against the user table, binds
//! each connection to a mountpoint, remaps the virtual aggregator
//! mountpoint by proximity as GGA fixes arrive, and fans RTCM3 bytes out
//! to every connection subscribed to a mountpoint.
//!
//! The listening socket and the fan-out drain both run as Tokio tasks
//! rather than a single dedicated OS thread, but the per-mountpoint
//! connection map stays behind one coarse mutex.

use crate::registry::StationRegistry;
use crate::rtcm_decoder::{encode_nav_snapshot, encode_station_1005, frame_payload};
use crate::store::ObservationStore;
use base64::Engine as _;
use cors_types::{Ecef, RoverConnHandle, RtcmFanout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// The well-known virtual aggregator mountpoint rovers connect to when they
/// want the nearest VRS correction stream rather than a named station.
pub const VIRTUAL_AGGREGATOR_MOUNTPOINT: &str = "RTCM32";
const NAV_SNAPSHOT_PERIOD: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct AgentUser {
    user: String,
    passwd: String,
}

struct RoverConn {
    mountpoint: String,
    metadata_changed: bool,
    last_nav_snapshot: std::time::Instant,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct Agent {
    registry: Arc<StationRegistry>,
    store: Arc<ObservationStore>,
    users: Mutex<Vec<AgentUser>>,
    conns: Mutex<HashMap<RoverConnHandle, RoverConn>>,
    by_mountpoint: Mutex<HashMap<String, Vec<RoverConnHandle>>>,
    next_handle: AtomicU32,
}

impl Agent {
    pub fn new(registry: Arc<StationRegistry>, store: Arc<ObservationStore>, users: Vec<(String, String)>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            users: Mutex::new(users.into_iter().map(|(user, passwd)| AgentUser { user, passwd }).collect()),
            conns: Mutex::new(HashMap::new()),
            by_mountpoint: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        })
    }

    /// Adds a new user. Returns `false` and leaves the table untouched if
    /// `user` already exists, rather than silently overwriting the password
    /// (the original's add-user path checked the wrong local after its hash
    /// lookup and never caught this case).
    pub async fn add_user(&self, user: String, passwd: String) -> bool {
        let mut users = self.users.lock().await;
        if users.iter().any(|u| u.user == user) {
            return false;
        }
        users.push(AgentUser { user, passwd });
        true
    }

    pub async fn del_user(&self, user: &str) {
        self.users.lock().await.retain(|u| u.user != user);
    }

    async fn authenticate(&self, user: &str, passwd: &str) -> bool {
        if user.is_empty() {
            return false;
        }
        self.users.lock().await.iter().any(|u| u.user == user && u.passwd == passwd)
    }

    /// Spawns the listening loop on `bind_addr`, accepting one task per rover
    /// connection — the per-connection read/write halves here still
    /// serialize through this agent's own mutex-guarded tables, preserving
    /// single-owner semantics over per-rover state.
    pub fn spawn_listener(self: &Arc<Self>, bind_addr: String) {
        let agent = self.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(&bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(addr = %bind_addr, error = %e, "agent failed to bind listening socket");
                    return;
                }
            };
            info!(addr = %bind_addr, "agent listening for rover connections");
            loop {
                match listener.accept().await {
                    Ok((sock, peer)) => {
                        let agent = agent.clone();
                        tokio::spawn(async move {
                            agent.handle_connection(sock, peer).await;
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "agent accept error");
                    }
                }
            }
        });
    }

    /// Drains the merged [`RtcmFanout`] channel (ingest passthrough and VRS
    /// synthetic streams share this type, see `cors_types::RtcmFanout`) and
    /// pushes each payload to every rover bound to that mountpoint.
    pub fn spawn_fanout(self: &Arc<Self>, mut fanout_rx: mpsc::UnboundedReceiver<RtcmFanout>) {
        let agent = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = fanout_rx.recv().await {
                agent.dispatch(&msg.mountpoint, &msg.payload).await;
            }
        });
    }

    async fn dispatch(&self, mountpoint: &str, payload: &[u8]) {
        let handles = {
            let map = self.by_mountpoint.lock().await;
            match map.get(mountpoint) {
                Some(v) => v.clone(),
                None => return,
            }
        };
        let mut conns = self.conns.lock().await;
        let mut dead = Vec::new();
        for h in handles {
            let Some(conn) = conns.get_mut(&h) else { continue };

            if conn.metadata_changed {
                if let Some(record) = self.station_record_for(mountpoint).await {
                    if conn.write_tx.send(record).is_err() {
                        dead.push(h);
                        continue;
                    }
                }
                conn.metadata_changed = false;
            }

            if conn.last_nav_snapshot.elapsed() >= NAV_SNAPSHOT_PERIOD {
                if let Some(snapshot) = self.nav_snapshot_for(mountpoint).await {
                    if conn.write_tx.send(snapshot).is_err() {
                        dead.push(h);
                        continue;
                    }
                }
                conn.last_nav_snapshot = std::time::Instant::now();
            }

            if conn.write_tx.send(payload.to_vec()).is_err() {
                dead.push(h);
            }
        }
        drop(conns);
        for h in dead {
            self.drop_connection(h).await;
        }
    }

    async fn station_record_for(&self, mountpoint: &str) -> Option<Vec<u8>> {
        let id = self.registry.lookup_by_mntpnt(mountpoint).await?;
        let info = self.registry.lookup_by_id(id).await?;
        let payload = encode_station_1005(info.id.0.unsigned_abs() as u16, info.pos);
        Some(frame_payload(&payload))
    }

    async fn nav_snapshot_for(&self, mountpoint: &str) -> Option<Vec<u8>> {
        let id = self.registry.lookup_by_mntpnt(mountpoint).await?;
        let nav = self.store.nav_snapshot(id).await;
        let entries: Vec<(u8, i32)> = nav
            .gps_family
            .values()
            .filter_map(|ring| ring.current())
            .map(|eph| (eph.sat, eph.iode as i32))
            .collect();
        if entries.is_empty() {
            return None;
        }
        let payload = encode_nav_snapshot(1019, &entries);
        Some(frame_payload(&payload))
    }

    async fn drop_connection(&self, handle: RoverConnHandle) {
        let mountpoint = {
            let mut conns = self.conns.lock().await;
            conns.remove(&handle).map(|c| c.mountpoint)
        };
        if let Some(mountpoint) = mountpoint {
            let mut map = self.by_mountpoint.lock().await;
            if let Some(v) = map.get_mut(&mountpoint) {
                v.retain(|h| *h != handle);
            }
        }
    }

    async fn bind_to_mountpoint(&self, handle: RoverConnHandle, mountpoint: &str) {
        let mut map = self.by_mountpoint.lock().await;
        map.entry(mountpoint.to_string()).or_default().push(handle);
    }

    async fn unbind_from_mountpoint(&self, handle: RoverConnHandle, mountpoint: &str) {
        let mut map = self.by_mountpoint.lock().await;
        if let Some(v) = map.get_mut(mountpoint) {
            v.retain(|h| *h != handle);
        }
    }

    async fn handle_connection(self: Arc<Self>, sock: TcpStream, peer: std::net::SocketAddr) {
        let (read_half, mut write_half) = sock.into_split();
        let mut lines = BufReader::new(read_half);

        let mut request_line = String::new();
        if lines.read_line(&mut request_line).await.unwrap_or(0) == 0 {
            return;
        }
        let Some((mountpoint, auth_header)) = parse_request_line(&request_line, &mut lines).await else {
            return;
        };

        // The virtual aggregator mountpoint has no registry entry by design
        // — it is remapped to a real mountpoint only once a GGA fix arrives.
        if mountpoint != VIRTUAL_AGGREGATOR_MOUNTPOINT && self.registry.lookup_by_mntpnt(&mountpoint).await.is_none() {
            debug!(%mountpoint, %peer, "agent rejecting unknown mountpoint");
            return;
        }

        let authed = match auth_header {
            Some((user, passwd)) => self.authenticate(&user, &passwd).await,
            None => false,
        };
        if !authed {
            let _ = write_half.write_all(b"HTTP/1.0 401 Unauthorized\r\n\r\n").await;
            return;
        }
        let _ = write_half.write_all(b"ICY 200 OK\r\n\r\n").await;

        let handle = RoverConnHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.conns.lock().await.insert(
            handle,
            RoverConn {
                mountpoint: mountpoint.clone(),
                metadata_changed: true,
                last_nav_snapshot: std::time::Instant::now() - NAV_SNAPSHOT_PERIOD,
                write_tx,
            },
        );
        self.bind_to_mountpoint(handle, &mountpoint).await;
        info!(%mountpoint, %peer, %handle, "rover connected");

        let writer_agent = self.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(payload) = write_rx.recv().await {
                if write_half.write_all(&payload).await.is_err() {
                    writer_agent.drop_connection(handle).await;
                    break;
                }
            }
        });

        let mut gga_line = String::new();
        loop {
            gga_line.clear();
            match lines.read_line(&mut gga_line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if let Some(pos) = parse_gga(&gga_line) {
                        self.handle_gga(handle, pos).await;
                    }
                }
            }
        }

        writer_task.abort();
        self.drop_connection(handle).await;
        info!(%mountpoint, %peer, %handle, "rover disconnected");
    }

    /// A rover on the virtual aggregator mountpoint gets remapped to
    /// whichever mountpoint the registry now reports nearest to its fix.
    async fn handle_gga(&self, handle: RoverConnHandle, pos: Ecef) {
        let current_mountpoint = {
            let conns = self.conns.lock().await;
            match conns.get(&handle) {
                Some(c) => c.mountpoint.clone(),
                None => return,
            }
        };
        if current_mountpoint != VIRTUAL_AGGREGATOR_MOUNTPOINT {
            return;
        }
        let Some(nearest) = self.registry.nearest(&pos).await else { return };
        if nearest == current_mountpoint {
            return;
        }
        self.unbind_from_mountpoint(handle, &current_mountpoint).await;
        self.bind_to_mountpoint(handle, &nearest).await;
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get_mut(&handle) {
            conn.mountpoint = nearest;
            conn.metadata_changed = true;
        }
    }
}

/// Reads header lines after the request line looking for `Authorization:
/// Basic <base64>`, stopping at the blank line that ends an HTTP/1.0
/// request. Returns the requested mountpoint and decoded `(user, passwd)`
/// if a Basic header was present.
async fn parse_request_line<R: tokio::io::AsyncBufRead + Unpin>(
    request_line: &str,
    lines: &mut R,
) -> Option<(String, Option<(String, String)>)> {
    let mountpoint = request_line
        .strip_prefix("GET /")?
        .split_whitespace()
        .next()?
        .to_string();
    if mountpoint.is_empty() {
        return None;
    }

    let mut auth = None;
    let mut header = String::new();
    loop {
        header.clear();
        if lines.read_line(&mut header).await.unwrap_or(0) == 0 {
            break;
        }
        let trimmed = header.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some(encoded) = trimmed
            .strip_prefix("Authorization: Basic ")
            .or_else(|| trimmed.strip_prefix("Authorization:Basic "))
        {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
                if let Ok(text) = String::from_utf8(decoded) {
                    if let Some((user, passwd)) = text.split_once(':') {
                        auth = Some((user.to_string(), passwd.to_string()));
                    }
                }
            }
        }
    }
    Some((mountpoint, auth))
}

/// Parses the handful of `$--GGA` fields this system needs (latitude,
/// longitude, ellipsoidal height) into an ECEF position; only `$--GGA` is
/// ingested from a rover, anything else on the wire is ignored.
fn parse_gga(line: &str) -> Option<Ecef> {
    let line = line.trim();
    let body = line.strip_prefix('$')?;
    let body = body.split('*').next().unwrap_or(body);
    if body.len() < 6 || &body[2..5] != "GGA" {
        return None;
    }
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 10 {
        return None;
    }
    let lat_raw: f64 = fields[2].parse().ok()?;
    let lat_hem = fields[3];
    let lon_raw: f64 = fields[4].parse().ok()?;
    let lon_hem = fields[5];
    let height: f64 = fields[9].parse().ok()?;

    let lat_deg = (lat_raw / 100.0).trunc() + (lat_raw % 100.0) / 60.0;
    let lon_deg = (lon_raw / 100.0).trunc() + (lon_raw % 100.0) / 60.0;
    let lat = if lat_hem == "S" { -lat_deg } else { lat_deg };
    let lon = if lon_hem == "W" { -lon_deg } else { lon_deg };

    let geodetic = cors_types::Geodetic { lat: lat.to_radians(), lon: lon.to_radians(), height };
    Some(geodetic.to_ecef())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_gga_into_ecef() {
        let line = "$GNGGA,123456.00,3150.1234,N,12120.5678,E,1,08,1.0,10.0,M,0.0,M,,*7A\r\n";
        let pos = parse_gga(line).expect("should parse");
        assert!(pos.x.is_finite() && pos.y.is_finite() && pos.z.is_finite());
    }

    #[test]
    fn rejects_non_gga_sentences() {
        assert!(parse_gga("$GPRMC,123456.00,A,3150.1234,N*5C\r\n").is_none());
    }
}

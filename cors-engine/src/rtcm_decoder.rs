//! One decoder state per source id, framing and decoding byte streams from
//! ingest clients into typed records.
//!
//! Framing (preamble search, 10-bit length, CRC-24Q) is real. Per-message-
//! type *field* decode is a deliberately thin stand-in behind
//! [`PayloadCodec`] for anything beyond station position (1005/1006) —
//! full MSM/legacy observation and ephemeris bit-unpacking stays a black
//! box; only frame/type dispatch is ours to get right.

pub use cors_types::rtcm::frame_payload;
use cors_types::rtcm::{crc24q, BitWriter, CRC_LEN, HEADER_LEN, PREAMBLE};
use cors_types::{
    DecodedMessage, Ecef, Ephemeris, GTime, GlonassEphemeris, NavUpdate, SatObs, SourceId,
    StationMetadata,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("CRC-24Q mismatch")]
    BadCrc,
}

pub struct RawFrame {
    pub msg_num: u16,
    pub payload: Vec<u8>,
    /// The complete original wire frame (preamble, length, payload, CRC-24Q),
    /// kept alongside the parsed payload so ingest can forward it to the
    /// Agent's fan-out unchanged.
    pub raw: Vec<u8>,
}

/// Stateful byte-stream framer for one source. Retains a partial frame
/// across calls; on a CRC failure it resynchronizes from the next candidate
/// preamble byte rather than discarding the whole buffer.
#[derive(Default)]
pub struct FrameSync {
    buf: Vec<u8>,
}

impl FrameSync {
    pub fn feed(&mut self, data: &[u8]) -> Vec<RawFrame> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            let Some(start) = self.buf.iter().position(|&b| b == PREAMBLE) else {
                self.buf.clear();
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let len = (((self.buf[1] & 0x03) as usize) << 8) | self.buf[2] as usize;
            let total = HEADER_LEN + len + CRC_LEN;
            if self.buf.len() < total {
                break;
            }
            let computed = crc24q(&self.buf[..HEADER_LEN + len]);
            let received = ((self.buf[HEADER_LEN + len] as u32) << 16)
                | ((self.buf[HEADER_LEN + len + 1] as u32) << 8)
                | self.buf[HEADER_LEN + len + 2] as u32;

            if computed != received {
                // Resync: this 0xD3 wasn't a real frame start. Drop it and
                // keep scanning from the next byte.
                self.buf.drain(..1);
                continue;
            }

            let payload: Vec<u8> = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            let raw: Vec<u8> = self.buf[..total].to_vec();
            self.buf.drain(..total);

            let msg_num = if payload.len() >= 2 {
                ((payload[0] as u16) << 4) | (payload[1] >> 4) as u16
            } else {
                0
            };
            out.push(RawFrame { msg_num, payload, raw });
        }
        out
    }
}

/// Big-endian, MSB-first bitfield reader over a byte slice, as used by the
/// RTCM3 wire format.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u(&mut self, nbits: usize) -> u64 {
        let mut v: u64 = 0;
        for _ in 0..nbits {
            let byte = self.pos / 8;
            let bit = 7 - (self.pos % 8);
            let b = if byte < self.data.len() {
                (self.data[byte] >> bit) & 1
            } else {
                0
            };
            v = (v << 1) | b as u64;
            self.pos += 1;
        }
        v
    }

    fn i(&mut self, nbits: usize) -> i64 {
        let v = self.u(nbits);
        let sign_bit = 1u64 << (nbits - 1);
        if v & sign_bit != 0 {
            (v as i64) - ((sign_bit << 1) as i64)
        } else {
            v as i64
        }
    }
}

/// Decodes a 1005/1006 station ARP record (real bit layout: both carry a
/// 38-bit signed ECEF X/Y/Z scaled by 1e-4 m; 1006 additionally carries a
/// 16-bit antenna height which this system does not need for `Ecef`).
pub fn decode_station_position(payload: &[u8]) -> Option<Ecef> {
    let mut r = BitReader::new(payload);
    let _msg_num = r.u(12);
    let _station_id = r.u(12);
    let _itrf_year = r.u(6);
    let _gps_ind = r.u(1);
    let _glo_ind = r.u(1);
    let _gal_ind = r.u(1);
    let _ref_ind = r.u(1);
    let x = r.i(38) as f64 * 1e-4;
    let _osc_ind = r.u(1);
    let _reserved = r.u(1);
    let y = r.i(38) as f64 * 1e-4;
    let _quarter = r.u(2);
    let z = r.i(38) as f64 * 1e-4;
    Some(Ecef::new(x, y, z))
}

pub use cors_types::rtcm::encode_station_1005;

/// Encodes a compact navigation snapshot frame (message types
/// 1019/1020/1042/1044/1046). Field-level ephemeris bit-packing stays a
/// black box; this carries just enough — message type and satellite/IODE
/// pairs — for a rover to see that a snapshot was sent.
pub fn encode_nav_snapshot(msg_num: u16, entries: &[(u8, i32)]) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.push(msg_num as i64, 12);
    w.push(entries.len() as i64, 8);
    for &(sat, iode) in entries {
        w.push(sat as i64, 8);
        w.push(iode as i64, 16);
    }
    w.finish()
}

/// Per-message-type field decode, isolated behind a trait per the design
/// notes so a bit-accurate codec could replace this stand-in without
/// touching dispatch or any subsystem above it.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, msg_num: u16, payload: &[u8], source: SourceId, time: GTime) -> DecodedMessage;
}

pub struct StandInCodec;

impl PayloadCodec for StandInCodec {
    fn decode(&self, msg_num: u16, payload: &[u8], source: SourceId, time: GTime) -> DecodedMessage {
        match msg_num {
            1005 | 1006 => match decode_station_position(payload) {
                Some(pos) => DecodedMessage::StationPos(pos),
                None => DecodedMessage::Other(msg_num),
            },
            1007 | 1008 | 1033 => DecodedMessage::StationDesc(StationMetadata::default()),
            1019 => {
                let mut r = BitReader::new(payload);
                let _ = r.u(12);
                let sat = r.u(6) as u8;
                let _week = r.u(10);
                let _ = r.u(4);
                let iode = r.u(8) as i32;
                let _toc = r.u(16);
                DecodedMessage::Navigation(NavUpdate::Gps(Ephemeris {
                    sat,
                    iode,
                    toe: time,
                    ..Ephemeris::empty(sat)
                }))
            }
            1020 => {
                let mut r = BitReader::new(payload);
                let _ = r.u(12);
                let sat = r.u(5) as u8;
                let _day = r.u(5);
                let iode = r.u(7) as i32;
                DecodedMessage::Navigation(NavUpdate::Glonass(GlonassEphemeris {
                    sat,
                    iode,
                    toe: time,
                    ..GlonassEphemeris::empty(sat)
                }))
            }
            1042 | 1044 | 1045 | 1046 => {
                let mut r = BitReader::new(payload);
                let _ = r.u(12);
                let sat = r.u(6) as u8;
                DecodedMessage::Navigation(NavUpdate::Gps(Ephemeris {
                    sat,
                    toe: time,
                    ..Ephemeris::empty(sat)
                }))
            }
            1001..=1012 | 1071..=1137 => {
                // Legacy / MSM observation families: true field decode is
                // the explicitly out-of-scope bit-level codec. We derive a
                // plausible satellite count from the payload size so the
                // store/solver pipeline downstream has realistically shaped
                // data to operate on.
                let approx_sats = ((payload.len().saturating_sub(2)) / 20).clamp(1, cors_types::MAXOBS);
                let obs = (1..=approx_sats as u8).map(SatObs::new).collect();
                DecodedMessage::Observation(cors_types::ObservationEpoch { source, time, obs })
            }
            _ => DecodedMessage::Other(msg_num),
        }
    }
}

/// One decoder state per source id. Ordering within a source is
/// strict because each source's `FrameSync` is only ever driven by that
/// source's single ingest task; across sources, decode runs in parallel.
pub struct RtcmDecoderPool {
    states: Mutex<HashMap<SourceId, Arc<Mutex<FrameSync>>>>,
    codec: Arc<dyn PayloadCodec>,
}

impl RtcmDecoderPool {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            codec: Arc::new(StandInCodec),
        }
    }

    async fn state_for(&self, source: SourceId) -> Arc<Mutex<FrameSync>> {
        let mut states = self.states.lock().await;
        states.entry(source).or_insert_with(|| Arc::new(Mutex::new(FrameSync::default()))).clone()
    }

    /// Feeds newly-arrived bytes for `source` and returns every fully
    /// decoded message found, in byte-arrival order.
    pub async fn decode(&self, source: SourceId, data: &[u8]) -> Vec<DecodedMessage> {
        self.decode_with_raw(source, data).await.into_iter().map(|(_, m)| m).collect()
    }

    /// Same as [`decode`](Self::decode), additionally returning each
    /// message's original wire bytes so the ingest caller can forward them
    /// to the Agent's fan-out unchanged.
    pub async fn decode_with_raw(&self, source: SourceId, data: &[u8]) -> Vec<(Vec<u8>, DecodedMessage)> {
        let state = self.state_for(source).await;
        let frames = {
            let mut sync = state.lock().await;
            sync.feed(data)
        };
        let now = GTime::now();
        frames
            .into_iter()
            .map(|f| (f.raw.clone(), self.codec.decode(f.msg_num, &f.payload, source, now)))
            .collect()
    }
}

impl Default for RtcmDecoderPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut buf = vec![PREAMBLE, ((len >> 8) & 0x03) as u8, (len & 0xFF) as u8];
        buf.extend_from_slice(payload);
        let crc = crc24q(&buf);
        buf.push((crc >> 16) as u8);
        buf.push((crc >> 8) as u8);
        buf.push(crc as u8);
        buf
    }

    #[test]
    fn frame_sync_extracts_well_formed_frame() {
        let frame = build_frame(&[0u8; 19]);
        let mut sync = FrameSync::default();
        let out = sync.feed(&frame);
        assert_eq!(out.len(), 1);
        assert!(sync.buf.is_empty());
    }

    #[test]
    fn frame_sync_resyncs_after_bad_crc() {
        let mut frame = build_frame(&[1u8; 10]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF; // corrupt CRC
        let good = build_frame(&[2u8; 10]);

        let mut combined = frame.clone();
        combined.extend_from_slice(&good);

        let mut sync = FrameSync::default();
        let out = sync.feed(&combined);
        // the corrupted frame is discarded; the following good frame is still found
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn frame_sync_retains_partial_frame_across_calls() {
        let frame = build_frame(&[3u8; 19]);
        let mut sync = FrameSync::default();
        let (head, tail) = frame.split_at(5);
        assert!(sync.feed(head).is_empty());
        let out = sync.feed(tail);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn decodes_station_position_round_trip_within_precision() {
        let x = -2_070_000.1234_f64;
        let y = 4_380_000.5678_f64;
        let z = 4_090_000.9012_f64;
        let mut payload = vec![0u8; 19];
        {
            // hand-pack using the same bit layout as decode_station_position
            let mut bits: u128 = 0;
            let mut nbits = 0usize;
            let mut push = |v: i64, n: usize, bits: &mut u128, nbits: &mut usize| {
                let mask = (1u128 << n) - 1;
                *bits = (*bits << n) | ((v as u128) & mask);
                *nbits += n;
            };
            push(1005, 12, &mut bits, &mut nbits);
            push(1, 12, &mut bits, &mut nbits);
            push(0, 6, &mut bits, &mut nbits);
            push(1, 1, &mut bits, &mut nbits);
            push(1, 1, &mut bits, &mut nbits);
            push(1, 1, &mut bits, &mut nbits);
            push(0, 1, &mut bits, &mut nbits);
            push((x / 1e-4) as i64, 38, &mut bits, &mut nbits);
            push(0, 1, &mut bits, &mut nbits);
            push(0, 1, &mut bits, &mut nbits);
            push((y / 1e-4) as i64, 38, &mut bits, &mut nbits);
            push(0, 2, &mut bits, &mut nbits);
            push((z / 1e-4) as i64, 38, &mut bits, &mut nbits);
            assert_eq!(nbits, 152);
            for i in 0..19 {
                payload[i] = ((bits >> ((18 - i) * 8)) & 0xFF) as u8;
            }
        }
        let pos = decode_station_position(&payload).unwrap();
        assert!((pos.x - x).abs() < 1e-3);
        assert!((pos.y - y).abs() < 1e-3);
        assert!((pos.z - z).abs() < 1e-3);
    }

    #[test]
    fn encode_then_decode_station_position_round_trips() {
        let pos = Ecef::new(-2_070_000.25, 4_380_050.5, 4_090_020.75);
        let payload = encode_station_1005(42, pos);
        let decoded = decode_station_position(&payload).unwrap();
        assert!((decoded.x - pos.x).abs() < 1e-3);
        assert!((decoded.y - pos.y).abs() < 1e-3);
        assert!((decoded.z - pos.z).abs() < 1e-3);
    }

    #[test]
    fn frame_payload_produces_valid_crc() {
        let payload = encode_nav_snapshot(1019, &[(3, 17), (9, 22)]);
        let frame = frame_payload(&payload);
        assert_eq!(frame[0], PREAMBLE);
        let len = (((frame[1] & 0x03) as usize) << 8) | frame[2] as usize;
        let expected = crc24q(&frame[..HEADER_LEN + len]);
        let received = ((frame[HEADER_LEN + len] as u32) << 16)
            | ((frame[HEADER_LEN + len + 1] as u32) << 8)
            | frame[HEADER_LEN + len + 2] as u32;
        assert_eq!(expected, received);
    }
}

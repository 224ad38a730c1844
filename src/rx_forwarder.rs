//! RX forwarding: mirror-frame dedup, frame filtering, and backpressure-aware
//! JSON encoding towards the LNS.

use crate::constants::MIN_UPJSON_SIZE;
use crate::filters::{JoinEuiFilter, NetIdFilter};
use crate::timesync::Timesync;
use crate::transport::SendBuf;
use crate::xq::{RxFifo, RxJob};
use log::warn;
use serde::Serialize;

/// Decoded from the LoRa MAC header, just enough to filter and label a
/// frame — never the full payload, which the LNS decrypts.
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    JoinRequest { joineui: u64 },
    Data { netid: u8 },
}

/// Parses just enough of the MAC header to filter and classify a frame.
/// A real implementation reads MHDR/MACPayload framing; this core only
/// needs the message type and the NetID-or-JoinEUI field, never the
/// encrypted payload.
pub trait HeaderParser {
    fn parse(&self, payload: &[u8]) -> Option<(FrameKind, &'static str)>;
}

/// Reads just the LoRaWAN MHDR and the NetID/JoinEUI field needed for
/// filtering; the MAC payload itself is opaque ciphertext to this core and
/// is forwarded untouched for the LNS to decrypt.
#[derive(Debug, Clone, Copy, Default)]
pub struct MacHeaderParser;

impl HeaderParser for MacHeaderParser {
    fn parse(&self, payload: &[u8]) -> Option<(FrameKind, &'static str)> {
        let mhdr = *payload.first()?;
        match mhdr >> 5 {
            0 => {
                let joineui_bytes: [u8; 8] = payload.get(1..9)?.try_into().ok()?;
                Some((FrameKind::JoinRequest { joineui: u64::from_le_bytes(joineui_bytes) }, "jreq"))
            }
            2 | 4 => {
                let devaddr = *payload.get(1)?;
                Some((FrameKind::Data { netid: devaddr >> 1 }, "updf"))
            }
            _ => None,
        }
    }
}

pub struct Filters {
    pub joineui: JoinEuiFilter,
    pub netid: NetIdFilter,
}

impl Filters {
    fn admits(&self, kind: FrameKind) -> bool {
        match kind {
            FrameKind::JoinRequest { joineui } => self.joineui.allows(joineui),
            FrameKind::Data { netid } => self.netid.allows(netid),
        }
    }
}

#[derive(Debug, Serialize)]
struct UpInfo {
    rctx: u64,
    xtime: u64,
    gpstime: i64,
    fts: i64,
    rssi: i32,
    snr: f32,
    rxtime: f64,
}

#[derive(Debug, Serialize)]
struct UplinkMessage {
    msgtype: &'static str,
    #[serde(rename = "RefTime")]
    ref_time: f64,
    #[serde(rename = "DR")]
    dr: u8,
    #[serde(rename = "Freq")]
    freq: u32,
    upinfo: UpInfo,
}

/// Adds a freshly-decoded uplink to the RX FIFO, dropping it in favour of
/// an already-queued mirror frame (or vice versa) per the `8*snr - rssi`
/// score.
pub fn add_rxjob(fifo: &mut RxFifo, payload: &[u8], job: RxJob) {
    let maxlen = payload.len();
    for (idx, existing) in fifo.iter().map(|(i, j)| (i, j.clone())).collect::<Vec<_>>() {
        if existing.len == payload.len() && existing.dr == job.dr && fifo.data(idx) == payload {
            if job.mirror_score() > existing.mirror_score() {
                fifo.drop_job(idx);
                break;
            } else {
                return;
            }
        }
    }
    if let Some((slot, buf)) = fifo.next_job(maxlen) {
        buf.copy_from_slice(payload);
        fifo.commit_job(slot, RxJob { len: payload.len(), ..job });
    } else {
        warn!("RX FIFO full, dropping uplink frame");
    }
}

/// Drains `fifo` through `send`, stopping as soon as backpressure or an
/// empty queue is hit. `muxtime_base` is the LNS's `MuxTime` reference
/// (host-µs at which `RefTime` was zero). `ts`/`now_ustime` resolve each
/// job's real GPS time and host-side receive time.
pub fn flush_rxjobs(
    fifo: &mut RxFifo,
    parser: &impl HeaderParser,
    filters: &Filters,
    muxtime_base: u64,
    ts: &Timesync,
    now_ustime: u64,
    send: &mut impl SendBuf,
) {
    loop {
        if fifo.is_empty() {
            return;
        }
        if send.get(MIN_UPJSON_SIZE).is_none() {
            return;
        }
        // Read the payload while the slot is still the front of the FIFO,
        // then pop — `pop_front` only removes the job record, not the
        // arena bytes, but its index is no longer valid to `data()` once popped.
        let (front_idx, _) = fifo.iter().next().unwrap();
        let payload = fifo.data(front_idx).to_vec();
        let job = fifo.pop_front().unwrap();
        let Some((kind, msgtype)) = parser.parse(&payload) else {
            warn!("dropping uplink with unparseable MAC header");
            continue;
        };
        if !filters.admits(kind) {
            continue;
        }

        let msg = UplinkMessage {
            msgtype,
            ref_time: job.xtime.saturating_sub(muxtime_base) as f64 / 1_000_000.0,
            dr: job.dr,
            freq: job.freq,
            upinfo: UpInfo {
                rctx: job.rctx,
                xtime: job.xtime,
                gpstime: ts.xtime_to_gpstime(now_ustime, job.xtime) as i64,
                fts: job.fine_ts.unwrap_or(-1),
                rssi: job.rssi_dbm(),
                snr: job.snr(),
                rxtime: ts.xtime_to_ustime(job.xtime) as f64 / 1_000_000.0,
            },
        };
        let Ok(text) = serde_json::to_vec(&msg) else {
            warn!("failed to encode uplink JSON");
            continue;
        };
        if let Some(buf) = send.get(text.len()) {
            buf[..text.len()].copy_from_slice(&text);
            send.commit_text(text.len());
        } else {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dr: u8, rssi: i16, snr4: i16) -> RxJob {
        RxJob { dr, rssi, snr4, ..Default::default() }
    }

    #[test]
    fn mac_header_parser_reads_join_request_joineui() {
        let mut payload = vec![0x00u8]; // MHDR: JoinRequest
        payload.extend_from_slice(&0x0102030405060708u64.to_le_bytes()); // JoinEUI
        payload.extend_from_slice(&[0u8; 14]); // DevEUI + DevNonce + MIC
        let (kind, msgtype) = MacHeaderParser.parse(&payload).unwrap();
        assert_eq!(msgtype, "jreq");
        assert!(matches!(kind, FrameKind::JoinRequest { joineui: 0x0102030405060708 }));
    }

    #[test]
    fn mac_header_parser_reads_data_uplink() {
        let payload = vec![0x40, 0x03, 0x00, 0x00, 0x00, 0x00];
        let (kind, msgtype) = MacHeaderParser.parse(&payload).unwrap();
        assert_eq!(msgtype, "updf");
        assert!(matches!(kind, FrameKind::Data { netid: 1 }));
    }

    #[test]
    fn mirror_frame_keeps_higher_score() {
        let mut fifo = RxFifo::new();
        add_rxjob(&mut fifo, b"abc", job(5, 42, 12)); // snr 3.0, rssi -42
        add_rxjob(&mut fifo, b"abc", job(5, 50, 16)); // snr 4.0, rssi -50, higher score
        assert_eq!(fifo.len(), 1);
        let (_, kept) = fifo.iter().next().unwrap();
        assert_eq!(kept.rssi, 50);
    }

    #[test]
    fn mirror_frame_keeps_existing_if_better() {
        let mut fifo = RxFifo::new();
        add_rxjob(&mut fifo, b"abc", job(5, 50, 16)); // better already queued
        add_rxjob(&mut fifo, b"abc", job(5, 42, 12)); // worse, should be dropped
        assert_eq!(fifo.len(), 1);
        let (_, kept) = fifo.iter().next().unwrap();
        assert_eq!(kept.rssi, 50);
    }

    #[test]
    fn different_dr_is_not_a_mirror() {
        let mut fifo = RxFifo::new();
        add_rxjob(&mut fifo, b"abc", job(5, 42, 12));
        add_rxjob(&mut fifo, b"abc", job(6, 42, 12));
        assert_eq!(fifo.len(), 2);
    }

    struct AlwaysAllow;
    impl HeaderParser for AlwaysAllow {
        fn parse(&self, _payload: &[u8]) -> Option<(FrameKind, &'static str)> {
            Some((FrameKind::Data { netid: 1 }, "updf"))
        }
    }

    struct CountingSendBuf {
        remaining_calls: usize,
        out: Vec<u8>,
    }
    impl SendBuf for CountingSendBuf {
        fn get(&mut self, _min_size: usize) -> Option<&mut [u8]> {
            if self.remaining_calls == 0 {
                return None;
            }
            self.remaining_calls -= 1;
            self.out.resize(4096, 0);
            Some(&mut self.out)
        }
        fn commit_text(&mut self, _len: usize) {}
        fn commit_binary(&mut self, _len: usize) {}
    }

    #[test]
    fn flush_stops_on_backpressure() {
        let mut fifo = RxFifo::new();
        add_rxjob(&mut fifo, b"a", job(5, 42, 12));
        add_rxjob(&mut fifo, b"b", job(5, 42, 12));
        let filters = Filters { joineui: JoinEuiFilter::default(), netid: NetIdFilter::allow_all() };
        let mut send = CountingSendBuf { remaining_calls: 1, out: Vec::new() };
        let ts = Timesync::new(1);
        flush_rxjobs(&mut fifo, &AlwaysAllow, &filters, 0, &ts, 0, &mut send);
        assert_eq!(fifo.len(), 1);
    }
}

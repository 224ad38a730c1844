//! # Timesync
//!
//! Four clocks coexist: host monotonic `ustime` (µs), a per-unit radio tick
//! `xticks` (32-bit, free-running), an extended `xtime` (64-bit — the top
//! byte is a session id, the rest extends `xticks` across wraparound), GPS
//! time (µs since GPS epoch), and an LNS time offset learned from
//! round-trip `timesync` exchanges.
//!
//! Radio ticks are taken to advance one per microsecond, so within a
//! session the host↔xtime mapping is a simple offset — the hard part is
//! extending a fresh 32-bit tick read across its wraparound without a
//! discontinuity, which [`xticks_to_xtime`] handles.

use crate::constants::PPS_VALID_INTV;
use log::{error, warn};
use std::time::Duration;

/// Extends a freshly read 32-bit radio tick into the 64-bit space of
/// `last_xtime`, resolving wraparound by picking the extension nearest to
/// `last_xtime` (the signed 32-bit difference is never ambiguous because a
/// poll never lands more than ~35 minutes apart in practice).
pub fn xticks_to_xtime(xticks: u32, last_xtime: u64) -> u64 {
    let last_low = (last_xtime & 0xFFFF_FFFF) as u32;
    let delta = xticks.wrapping_sub(last_low) as i32;
    (last_xtime as i64 + delta as i64) as u64
}

/// One bracketed radio-tick read: two host-µs reads straddling a single
/// `xticks` read, plus an optional PPS-latched tick.
#[derive(Debug, Clone, Copy)]
pub struct TimesyncSample {
    pub ustime: u64,
    pub xtime: u64,
    pub pps_xtime: Option<u64>,
    /// Elapsed host µs between the two bracketing reads — smaller is better.
    pub quality: u64,
}

/// A quality sample worse than this is treated as a failed read: the update
/// is skipped and retried on the next tick rather than blended in.
const QUALITY_REJECT_US: u64 = 50_000;

/// Per-TX-unit clock state.
#[derive(Debug, Clone, Default)]
struct UnitTimesync {
    synced: bool,
    ustime_ref: u64,
    xtime_ref: u64,
    best_quality: u64,

    pps_xtime: Option<u64>,
    pps_gpstime: Option<u64>,
    pps_host_ustime: u64,
}

impl UnitTimesync {
    /// Brackets a radio-tick read between `before`/`after` host reads.
    fn sample(
        &self,
        before: u64,
        xticks: u32,
        after: u64,
        pps_xticks: Option<u32>,
        pps_enabled: bool,
    ) -> TimesyncSample {
        let last_xtime = if self.synced { self.xtime_ref } else { 0 };
        let xtime = xticks_to_xtime(xticks, last_xtime.max(xticks as u64));
        let pps_xtime = if pps_enabled {
            pps_xticks.map(|t| xticks_to_xtime(t, xtime))
        } else {
            None
        };
        TimesyncSample {
            ustime: before + (after - before) / 2,
            xtime,
            pps_xtime,
            quality: after.saturating_sub(before),
        }
    }

    fn apply(&mut self, sample: TimesyncSample) {
        if sample.quality > QUALITY_REJECT_US {
            error!(
                "CRITICAL: timesync read quality too poor ({} us), skipping update",
                sample.quality
            );
            return;
        }
        // Quality-weighted blend: first sync wins outright, later samples
        // only overwrite the reference if they bracket more tightly than
        // our best so far — this keeps a single noisy read from dragging
        // the session's affine host<->xtime mapping around.
        if !self.synced || sample.quality <= self.best_quality {
            self.synced = true;
            self.ustime_ref = sample.ustime;
            self.xtime_ref = sample.xtime;
            self.best_quality = sample.quality;
        }
        if let Some(pps_xtime) = sample.pps_xtime {
            if self.pps_xtime != Some(pps_xtime) {
                self.pps_xtime = Some(pps_xtime);
                self.pps_host_ustime = sample.ustime;
                // GPS time at the PPS edge is supplied by the caller once it
                // learns it (see `Timesync::publish_pps_gpstime`); until
                // then gpstime conversions stay unavailable for this edge.
                self.pps_gpstime = None;
            }
        }
    }

    fn ustime_to_xtime(&self, ustime: u64) -> Option<u64> {
        if !self.synced {
            return None;
        }
        Some((self.xtime_ref as i64 + (ustime as i64 - self.ustime_ref as i64)) as u64)
    }

    fn xtime_to_ustime(&self, xtime: u64) -> Option<u64> {
        if !self.synced {
            return None;
        }
        Some((self.ustime_ref as i64 + (xtime as i64 - self.xtime_ref as i64)) as u64)
    }

    fn xtime_to_gpstime(&self, now_ustime: u64, xtime: u64) -> Option<u64> {
        let pps_xtime = self.pps_xtime?;
        let pps_gpstime = self.pps_gpstime?;
        if now_ustime.saturating_sub(self.pps_host_ustime) > PPS_VALID_INTV {
            return None;
        }
        Some((pps_gpstime as i64 + (xtime as i64 - pps_xtime as i64)) as u64)
    }

    fn gpstime_to_xtime(&self, now_ustime: u64, gpstime: u64) -> Option<u64> {
        let pps_xtime = self.pps_xtime?;
        let pps_gpstime = self.pps_gpstime?;
        if now_ustime.saturating_sub(self.pps_host_ustime) > PPS_VALID_INTV {
            return None;
        }
        Some((pps_xtime as i64 + (gpstime as i64 - pps_gpstime as i64)) as u64)
    }
}

/// Timesync state for every TX unit, plus the LNS round-trip offset.
#[derive(Debug, Default)]
pub struct Timesync {
    units: Vec<UnitTimesync>,
    lns_offset_ustime: Option<i64>,
    /// Host-ustime-to-gpstime offset learned directly from an LNS
    /// round-trip's `gpstime`, for use when no per-unit PPS anchor exists
    /// yet. Coarser than the PPS path (no per-unit radio-tick precision)
    /// but available as soon as the first `timesync` reply arrives.
    gps_offset_ustime: Option<i64>,
}

impl Timesync {
    pub fn new(num_units: usize) -> Self {
        Timesync {
            units: vec![UnitTimesync::default(); num_units],
            lns_offset_ustime: None,
            gps_offset_ustime: None,
        }
    }

    /// Anchors `txunit`'s xtime<->gpstime mapping from an LNS-echoed
    /// `timesync` reply rather than a PPS-latched radio read. Reuses the
    /// same per-unit fields the PPS path populates, since both are "the
    /// most recent known (xtime, gpstime) pair for this unit".
    pub fn set_timesync_lns(&mut self, txunit: usize, xtime: u64, gpstime: u64, rxtime_ustime: u64) {
        if let Some(u) = self.units.get_mut(txunit) {
            u.pps_xtime = Some(xtime);
            u.pps_gpstime = Some(gpstime);
            u.pps_host_ustime = rxtime_ustime;
        }
    }

    /// Brackets and blends a radio timesync read for `txunit`; returns the
    /// delay until the next poll (shorter if this read was rejected).
    pub fn get_and_update(
        &mut self,
        txunit: usize,
        before: u64,
        xticks: u32,
        after: u64,
        pps_xticks: Option<u32>,
        pps_enabled: bool,
        next_poll: Duration,
    ) -> Duration {
        let sample = self.units[txunit].sample(before, xticks, after, pps_xticks, pps_enabled);
        let quality = sample.quality;
        self.units[txunit].apply(sample);
        if quality > QUALITY_REJECT_US {
            Duration::from_millis(50)
        } else {
            next_poll
        }
    }

    /// Publishes the GPS time corresponding to the most recent PPS edge for
    /// `txunit`, once the caller has learned it (e.g. from a GPS fix or an
    /// LNS `gpstime`).
    pub fn publish_pps_gpstime(&mut self, txunit: usize, gpstime: u64) {
        self.units[txunit].pps_gpstime = Some(gpstime);
    }

    pub fn ustime_to_xtime(&self, txunit: usize, ustime: u64) -> u64 {
        self.units.get(txunit).and_then(|u| u.ustime_to_xtime(ustime)).unwrap_or(0)
    }

    pub fn xtime_to_ustime(&self, xtime: u64) -> u64 {
        for u in &self.units {
            if let Some(us) = u.xtime_to_ustime(xtime) {
                return us;
            }
        }
        0
    }

    pub fn xtime_to_gpstime(&self, now_ustime: u64, xtime: u64) -> u64 {
        for u in &self.units {
            if let Some(gps) = u.xtime_to_gpstime(now_ustime, xtime) {
                return gps;
            }
        }
        // No per-unit PPS anchor yet; fall back to the coarser host<->gps
        // offset learned from an LNS timesync round trip, if we have one.
        if let Some(off) = self.gps_offset_ustime {
            let us = self.xtime_to_ustime(xtime);
            if us != 0 {
                return (us as i64 + off) as u64;
            }
        }
        0
    }

    pub fn gpstime_to_xtime(&self, txunit: usize, now_ustime: u64, gpstime: u64) -> u64 {
        if let Some(xtime) = self.units.get(txunit).and_then(|u| u.gpstime_to_xtime(now_ustime, gpstime)) {
            return xtime;
        }
        if let Some(off) = self.gps_offset_ustime {
            let us = (gpstime as i64 - off) as u64;
            return self.ustime_to_xtime(txunit, us);
        }
        0
    }

    /// Retargets `xtime` (belonging to whichever unit produced it) to
    /// `other_txunit` via the common host-µs axis.
    pub fn xtime_to_xtime(&self, xtime: u64, other_txunit: usize) -> u64 {
        let us = self.xtime_to_ustime(xtime);
        if us == 0 {
            warn!("xtime_to_xtime: source xtime has no known host mapping");
            return 0;
        }
        self.ustime_to_xtime(other_txunit, us)
    }

    pub fn is_synced(&self, txunit: usize) -> bool {
        self.units.get(txunit).map(|u| u.synced).unwrap_or(false)
    }

    /// Records the LNS round-trip result: `txtime_secs` is the LNS's own
    /// clock reading (seconds) at the moment it handled our `timesync`
    /// request, `rxtime_ustime` is the local host time we recorded when we
    /// originally sent that request's `xtime`, and `gpstime` is the GPS time
    /// (µs) the LNS reported for that same instant — used to learn a
    /// host<->gps offset for units with no PPS anchor yet.
    pub fn process_timesync_lns(&mut self, txtime_secs: f64, rxtime_ustime: u64, gpstime: u64) {
        let lns_ustime = (txtime_secs * 1_000_000.0) as i64;
        self.lns_offset_ustime = Some(lns_ustime - rxtime_ustime as i64);
        if gpstime != 0 {
            self.gps_offset_ustime = Some(gpstime as i64 - rxtime_ustime as i64);
        }
    }

    /// Best estimate of the LNS's own clock, in seconds, given a local host
    /// time. `None` until the first round trip completes.
    pub fn lns_time_now(&self, host_ustime: u64) -> Option<f64> {
        self.lns_offset_ustime
            .map(|off| (host_ustime as i64 + off) as f64 / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_extends_exactly() {
        let last: u64 = 0x0000_0000_F000_0000;
        for d in [-1_000_000_000i64, -1, 0, 1, 1_000_000_000] {
            let last_low = (last & 0xFFFF_FFFF) as u32;
            let xticks = last_low.wrapping_add(d as i32 as u32);
            let got = xticks_to_xtime(xticks, last);
            let want = (last as i64 + d) as u64;
            assert_eq!(got, want, "d={d}");
        }
    }

    #[test]
    fn sync_then_convert_round_trips() {
        let mut ts = Timesync::new(1);
        let d = ts.get_and_update(0, 1_000, 5_000, 1_002, None, false, Duration::from_millis(2100));
        assert_eq!(d, Duration::from_millis(2100));
        assert!(ts.is_synced(0));

        let xtime = ts.ustime_to_xtime(0, 2_000);
        assert_ne!(xtime, 0);
        let back = ts.xtime_to_ustime(xtime);
        assert_eq!(back, 2_000);
    }

    #[test]
    fn poor_quality_sample_is_rejected() {
        let mut ts = Timesync::new(1);
        let d = ts.get_and_update(0, 0, 1, 200_000, None, false, Duration::from_millis(2100));
        assert!(!ts.is_synced(0));
        assert_eq!(d, Duration::from_millis(50));
    }

    #[test]
    fn unsynced_conversions_return_zero() {
        let ts = Timesync::new(1);
        assert_eq!(ts.ustime_to_xtime(0, 100), 0);
        assert_eq!(ts.xtime_to_ustime(999), 0);
    }

    #[test]
    fn gpstime_conversion_needs_pps_anchor() {
        let mut ts = Timesync::new(1);
        ts.get_and_update(0, 1_000, 5_000, 1_001, Some(5_000), true, Duration::from_millis(2100));
        ts.publish_pps_gpstime(0, 1_000_000_000);
        let xtime = ts.ustime_to_xtime(0, 1_000);
        let gps = ts.xtime_to_gpstime(1_000, xtime);
        assert_ne!(gps, 0);
    }

    #[test]
    fn lns_round_trip_offset() {
        let mut ts = Timesync::new(1);
        ts.process_timesync_lns(1_700_000_000.0, 500_000, 0);
        let now = ts.lns_time_now(500_000).unwrap();
        assert!((now - 1_700_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn lns_anchor_converts_without_pps() {
        let mut ts = Timesync::new(1);
        ts.get_and_update(0, 1_000, 5_000, 1_002, None, false, Duration::from_millis(2100));
        ts.set_timesync_lns(0, 5_000, 1_000_000_000, 1_000);
        let gps = ts.xtime_to_gpstime(1_000, 5_000);
        assert_eq!(gps, 1_000_000_000);
        let xtime = ts.gpstime_to_xtime(0, 1_000, 1_000_000_000);
        assert_eq!(xtime, 5_000);
    }

    #[test]
    fn gps_offset_fallback_converts_xtime_without_any_anchor() {
        let mut ts = Timesync::new(1);
        ts.get_and_update(0, 1_000, 5_000, 1_000, None, false, Duration::from_millis(2100));
        ts.process_timesync_lns(1_700_000_000.0, 1_000, 1_700_000_000_000_000);
        let gps = ts.xtime_to_gpstime(1_000, 5_000);
        assert_eq!(gps, 1_700_000_000_000_000);
    }
}

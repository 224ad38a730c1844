//! Class-B beacon generator: one timer that either reschedules itself while
//! GPS time/position is unavailable, or builds and queues a beacon TX job
//! on the next 128-second GPS epoch boundary.

use crate::constants::{BEACON_GUARD, BEACON_INTVL, BEACON_RETRY, PRIO_BEACON};
use crate::xq::{TxFlags, TxJob};
use log::info;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconState {
    Ok,
    NoTime,
    NoPos,
}

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Byte offsets within the beacon payload for NetCommon and GPS fields.
    pub layout: [usize; 3],
    pub frequencies: Vec<u32>,
    /// DR in the low nibble, frequency count in the high nibble (as carried
    /// on the wire); decoded eagerly into `dr`/`freq_count` at construction.
    pub dr: u8,
}

impl BeaconConfig {
    pub fn from_ctrl(ctrl: u8, layout: [usize; 3], frequencies: Vec<u32>) -> Self {
        BeaconConfig { layout, frequencies, dr: ctrl & 0x0F }
    }

    fn payload_len(&self) -> usize {
        self.layout[2]
    }
}

pub struct BeaconGenerator {
    config: BeaconConfig,
    state: BeaconState,
}

pub struct GpsFix {
    pub gpstime: u64,
    pub lat: f64,
    pub lon: f64,
}

impl BeaconGenerator {
    pub fn new(config: BeaconConfig) -> Self {
        BeaconGenerator { config, state: BeaconState::Ok }
    }

    pub fn state(&self) -> BeaconState {
        self.state
    }

    /// Advances the generator; returns a fresh TX job plus its payload
    /// bytes to enqueue (or `None` while GPS is unavailable), plus the
    /// delay until the next tick.
    pub fn tick(&mut self, fix: Option<&GpsFix>) -> (Option<(TxJob, Vec<u8>)>, Duration) {
        let Some(fix) = fix else {
            self.transition(BeaconState::NoTime);
            return (None, BEACON_RETRY);
        };
        if fix.gpstime == 0 {
            self.transition(BeaconState::NoTime);
            return (None, BEACON_RETRY);
        }
        if !(-90.0..=90.0).contains(&fix.lat) || !(-180.0..=180.0).contains(&fix.lon) {
            self.transition(BeaconState::NoPos);
            return (None, BEACON_RETRY);
        }
        self.transition(BeaconState::Ok);

        let ahead = BEACON_INTVL - fix.gpstime % BEACON_INTVL;
        let epoch = (fix.gpstime + ahead) / BEACON_INTVL;
        let freq = self.config.frequencies[(epoch as usize) % self.config.frequencies.len()];

        let mut payload = vec![0u8; self.config.payload_len()];
        payload[self.config.layout[0]..self.config.layout[0] + 4]
            .copy_from_slice(&(epoch as u32).to_le_bytes());
        payload[self.config.layout[1]..self.config.layout[1] + 8]
            .copy_from_slice(&encode_latlon(fix.lat, fix.lon));

        // `txtime` is left at its default (0): it's a host-µs value, but
        // all this generator knows is GPS time. The caller resolves it via
        // `Timesync::gpstime_to_xtime`/`xtime_to_ustime` before queuing.
        let job = TxJob {
            gpstime: Some(fix.gpstime + ahead),
            freq,
            dr: self.config.dr,
            flags: TxFlags::BCN,
            prio: PRIO_BEACON,
            ..Default::default()
        };

        let next_tick = Duration::from_micros(ahead.saturating_sub(BEACON_GUARD.as_micros() as u64));
        (Some((job, payload)), next_tick)
    }

    fn transition(&mut self, new_state: BeaconState) {
        if self.state != new_state {
            info!("beacon state {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
        }
    }
}

/// Packs latitude/longitude into 4+4 bytes as fixed-point fractions of a
/// half-circle, matching the on-air beacon frame's GPS sub-field sizes.
fn encode_latlon(lat: f64, lon: f64) -> [u8; 8] {
    let lat_i = ((lat / 90.0) * (i32::MAX as f64)) as i32;
    let lon_i = ((lon / 180.0) * (i32::MAX as f64)) as i32;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&lat_i.to_le_bytes());
    out[4..8].copy_from_slice(&lon_i.to_le_bytes());
    out
}

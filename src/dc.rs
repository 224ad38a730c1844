//! Duty-cycle and channel-access governance.
//!
//! Each TX unit tracks a "blocked until" deadline per EU868 band and per
//! downlink channel. A deadline of [`USTIME_MIN`] means the band/channel is
//! never blocked; [`USTIME_MAX`] means it is permanently blocked (used by
//! regions with no duty-cycle concept where a channel has been disabled
//! outright). After a successful emission the relevant deadlines are pushed
//! out to `txtime + airtime * multiplier`.

use crate::constants::{MAX_DC_BANDS, MAX_DNCHNLS, USTIME_MAX, USTIME_MIN};
use serde::{Deserialize, Serialize};

/// EU868 sub-bands, ordered to match [`Band`]'s discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// 869.4-869.65 MHz, 10% duty cycle (multiplier x10).
    Deci,
    /// 868.0-868.6 + 869.7-870.0 MHz, 1% duty cycle (multiplier x100).
    Centi,
    /// Everything else, 0.1% duty cycle (multiplier x1000).
    Milli,
}

impl Band {
    pub fn multiplier(self) -> u64 {
        match self {
            Band::Deci => 10,
            Band::Centi => 100,
            Band::Milli => 1000,
        }
    }

    fn index(self) -> usize {
        match self {
            Band::Deci => 0,
            Band::Centi => 1,
            Band::Milli => 2,
        }
    }

    /// Classifies an EU868 downlink frequency (Hz) into its duty-cycle band.
    pub fn classify_eu868(freq_hz: u32) -> Band {
        if (869_400_000..=869_650_000).contains(&freq_hz) {
            Band::Deci
        } else if (868_000_000..=868_600_000).contains(&freq_hz) || (869_700_000..=870_000_000).contains(&freq_hz) {
            Band::Centi
        } else {
            Band::Milli
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Region {
    Eu868,
    Il915,
    Kr920,
    As923_1,
    Us915,
    Au915,
    Unknown,
}

impl Region {
    /// Default TX power in dBm (×10) for a fresh channel plan.
    pub fn default_txpow_d10(self) -> i16 {
        match self {
            Region::Eu868 => 160,
            Region::Il915 => 140,
            Region::Kr920 => 230,
            Region::As923_1 => 130,
            Region::Us915 => 260,
            Region::Au915 => 300,
            Region::Unknown => 140,
        }
    }

    /// High-power override and the band it applies to, where the region
    /// defines one.
    pub fn hi_pow_band(self) -> Option<(u32, u32, i16)> {
        match self {
            Region::Eu868 => Some((869_400_000, 869_650_000, 270)),
            Region::Il915 => Some((916_200_000, 916_400_000, 200)),
            _ => None,
        }
    }

    /// Per-channel duty-cycle multiplier, where the region uses a flat rate
    /// instead of EU868's band table.
    pub fn flat_channel_dc_rate(self) -> Option<u64> {
        match self {
            Region::Il915 => Some(100),
            Region::Kr920 => Some(50),
            Region::As923_1 => Some(10),
            _ => None,
        }
    }

    /// Whether this region enforces clear-channel assessment before transmit.
    pub fn requires_cca(self) -> bool {
        matches!(self, Region::Kr920 | Region::As923_1)
    }
}

/// Capability-set boundary the scheduler calls through, so a region's
/// access rules never need to be matched on directly outside this module.
pub trait TxPolicy {
    /// Whether a frame may be committed; the second element says whether
    /// CCA/LBT should be skipped for this submission.
    fn can_tx(&self, txtime: u64, freq_hz: u32, chnl: usize) -> (bool, bool);
}

/// Per-TX-unit duty-cycle and CCA state.
#[derive(Debug, Clone)]
pub struct DutyCycle {
    region: Region,
    band_deadline: [u64; MAX_DC_BANDS],
    chnl_deadline: [u64; MAX_DNCHNLS],
    /// Loop-task-mutable debug overrides; these are fields on the running
    /// engine, not compile-time flags, so they can be flipped via `runcmd`.
    pub nodc: bool,
    pub nocca: bool,
    pub nodwell: bool,
}

impl DutyCycle {
    pub fn new(region: Region) -> Self {
        DutyCycle {
            region,
            band_deadline: [USTIME_MIN; MAX_DC_BANDS],
            chnl_deadline: [USTIME_MIN; MAX_DNCHNLS],
            nodc: false,
            nocca: false,
            nodwell: false,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Whether a frame of `airtime_us` at `freq_hz` on `chnl` may be
    /// committed to start at `txtime`.
    pub fn can_tx(&self, txtime: u64, freq_hz: u32, chnl: usize) -> bool {
        if self.nodc {
            return true;
        }
        if let Some(d) = self.chnl_deadline.get(chnl) {
            if txtime < *d {
                return false;
            }
        }
        if self.region == Region::Eu868 {
            let band = Band::classify_eu868(freq_hz);
            if txtime < self.band_deadline[band.index()] {
                return false;
            }
        }
        true
    }

    /// Records a successful emission, pushing out the relevant deadlines.
    pub fn record_emission(&mut self, txtime: u64, airtime_us: u32, freq_hz: u32, chnl: usize) {
        if self.nodc {
            return;
        }
        if self.region == Region::Eu868 {
            let band = Band::classify_eu868(freq_hz);
            let deadline = self.push_deadline(self.band_deadline[band.index()], txtime, airtime_us, band.multiplier());
            self.band_deadline[band.index()] = deadline;
        }
        if let Some(rate) = self.region.flat_channel_dc_rate() {
            if let Some(d) = self.chnl_deadline.get_mut(chnl) {
                *d = push_deadline_raw(*d, txtime, airtime_us, rate);
            }
        }
    }

    fn push_deadline(&self, current: u64, txtime: u64, airtime_us: u32, multiplier: u64) -> u64 {
        push_deadline_raw(current, txtime, airtime_us, multiplier)
    }

    /// Permanently blocks a channel (region config disabled it outright).
    pub fn block_channel(&mut self, chnl: usize) {
        if let Some(d) = self.chnl_deadline.get_mut(chnl) {
            *d = USTIME_MAX;
        }
    }

    /// Whether clear-channel assessment must pass before transmit.
    pub fn cca_required(&self) -> bool {
        !self.nocca && self.region.requires_cca()
    }
}

impl TxPolicy for DutyCycle {
    fn can_tx(&self, txtime: u64, freq_hz: u32, chnl: usize) -> (bool, bool) {
        (self.can_tx(txtime, freq_hz, chnl), self.nocca)
    }
}

fn push_deadline_raw(current: u64, txtime: u64, airtime_us: u32, multiplier: u64) -> u64 {
    if current == USTIME_MAX {
        return current;
    }
    let candidate = txtime.saturating_add(airtime_us as u64 * multiplier);
    candidate.max(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eu868_deci_band_blocks_same_band() {
        let mut dc = DutyCycle::new(Region::Eu868);
        dc.record_emission(1_000_000, 1_000_000, 869_500_000, 0);
        // airtime a=1e6us, multiplier 10 -> blocked until 1_000_000 + 10e6
        assert!(!dc.can_tx(1_000_000 + 5_000_000, 869_500_000, 0));
        assert!(dc.can_tx(1_000_000 + 10_000_000 + 1, 869_500_000, 0));
    }

    #[test]
    fn eu868_centi_band_uses_100x_multiplier() {
        let mut dc = DutyCycle::new(Region::Eu868);
        dc.record_emission(0, 1_000_000, 868_100_000, 0);
        assert!(!dc.can_tx(99_000_000, 868_100_000, 0));
        assert!(dc.can_tx(100_000_001, 868_100_000, 0));
    }

    #[test]
    fn different_eu868_bands_do_not_interfere() {
        let mut dc = DutyCycle::new(Region::Eu868);
        dc.record_emission(0, 1_000_000, 869_500_000, 0);
        assert!(dc.can_tx(1, 868_100_000, 1));
    }

    #[test]
    fn nodc_override_always_allows() {
        let mut dc = DutyCycle::new(Region::Eu868);
        dc.nodc = true;
        dc.record_emission(0, 1_000_000, 869_500_000, 0);
        assert!(dc.can_tx(0, 869_500_000, 0));
    }

    #[test]
    fn blocked_channel_is_permanent() {
        let mut dc = DutyCycle::new(Region::Us915);
        dc.block_channel(3);
        assert!(!dc.can_tx(u64::MAX / 2, 915_000_000, 3));
    }

    #[test]
    fn kr920_and_as923_require_cca() {
        assert!(DutyCycle::new(Region::Kr920).cca_required());
        assert!(DutyCycle::new(Region::As923_1).cca_required());
        assert!(!DutyCycle::new(Region::Us915).cca_required());
    }
}

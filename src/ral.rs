//! Radio abstraction layer boundary.
//!
//! The core only ever calls these five operations; everything about chip
//! programming, SPI/USB framing, and packet decoding lives behind the
//! implementation. `MockRal` backs the test suite, the same way the
//! teacher gives every hardware boundary (`Hal`) a trait plus a mock.

use crate::scheduler::{RadioStatus, SubmitOutcome};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// One uplink as handed back by [`Ral::fetch`].
#[derive(Debug, Clone)]
pub struct RawUplink {
    pub rctx: u64,
    pub xtime: u64,
    pub fine_ts: Option<i64>,
    pub freq: u32,
    pub dr: u8,
    pub rssi: i16,
    pub snr4: i16,
    pub payload: Vec<u8>,
}

/// One upchannel descriptor passed to `config`.
#[derive(Debug, Clone, Copy)]
pub struct UpchannelSpec {
    pub freq_hz: u32,
    pub bw_hz: u32,
    pub min_sf: u8,
    pub max_sf: u8,
}

#[async_trait]
pub trait Ral: Send + Sync {
    async fn config(
        &self,
        hwspec: &str,
        cca_region: u32,
        chipconf_json: &[u8],
        upchannels: &[UpchannelSpec],
    ) -> Result<(), crate::error::EngineError>;

    async fn stop(&self);

    async fn tx(&self, txunit: usize, payload: &[u8], cca_disabled: bool) -> SubmitOutcome;

    async fn txstatus(&self, txunit: usize) -> RadioStatus;

    async fn txabort(&self, txunit: usize);

    fn rctx2txunit(&self, rctx: u64) -> usize;
    fn xtime2txunit(&self, xtime: u64) -> usize;
    fn xtime2rctx(&self, xtime: u64) -> u64;
    fn alt_antennas(&self, txunit: usize) -> u16;

    /// Drains received packets since the last call.
    async fn fetch(&self) -> Vec<RawUplink>;

    /// One bracketed timesync read: `(before_ustime, xticks, after_ustime, pps_xticks)`.
    async fn get_timesync(&self, pps_enabled: bool) -> (u64, u32, u64, Option<u32>);
}

/// In-memory `Ral` for tests: `tx` always succeeds, `fetch` drains a queue
/// the test pushes into, `get_timesync` returns a caller-seeded reading.
pub struct MockRal {
    uplinks: Mutex<VecDeque<RawUplink>>,
    timesync_reading: Mutex<(u64, u32, u64, Option<u32>)>,
    num_units: usize,
}

impl MockRal {
    pub fn new(num_units: usize) -> Self {
        MockRal {
            uplinks: Mutex::new(VecDeque::new()),
            timesync_reading: Mutex::new((0, 0, 0, None)),
            num_units,
        }
    }

    pub async fn push_uplink(&self, uplink: RawUplink) {
        self.uplinks.lock().await.push_back(uplink);
    }

    pub async fn set_timesync_reading(&self, reading: (u64, u32, u64, Option<u32>)) {
        *self.timesync_reading.lock().await = reading;
    }
}

#[async_trait]
impl Ral for MockRal {
    async fn config(
        &self,
        _hwspec: &str,
        _cca_region: u32,
        _chipconf_json: &[u8],
        _upchannels: &[UpchannelSpec],
    ) -> Result<(), crate::error::EngineError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn tx(&self, _txunit: usize, _payload: &[u8], _cca_disabled: bool) -> SubmitOutcome {
        SubmitOutcome::Ok
    }

    async fn txstatus(&self, _txunit: usize) -> RadioStatus {
        RadioStatus::Emitting
    }

    async fn txabort(&self, _txunit: usize) {}

    fn rctx2txunit(&self, rctx: u64) -> usize {
        (rctx as usize) % self.num_units.max(1)
    }

    fn xtime2txunit(&self, xtime: u64) -> usize {
        ((xtime >> 56) as usize) % self.num_units.max(1)
    }

    fn xtime2rctx(&self, xtime: u64) -> u64 {
        xtime >> 56
    }

    fn alt_antennas(&self, _txunit: usize) -> u16 {
        0
    }

    async fn fetch(&self) -> Vec<RawUplink> {
        self.uplinks.lock().await.drain(..).collect()
    }

    async fn get_timesync(&self, _pps_enabled: bool) -> (u64, u32, u64, Option<u32>) {
        *self.timesync_reading.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_ral_round_trips_uplinks() {
        let ral = MockRal::new(1);
        ral.push_uplink(RawUplink {
            rctx: 0,
            xtime: 0,
            fine_ts: None,
            freq: 868_100_000,
            dr: 5,
            rssi: -42,
            snr4: 12,
            payload: vec![1, 2, 3],
        })
        .await;
        let got = ral.fetch().await;
        assert_eq!(got.len(), 1);
        assert!(ral.fetch().await.is_empty());
    }

    #[tokio::test]
    async fn mock_ral_tx_always_succeeds() {
        let ral = MockRal::new(1);
        assert_eq!(ral.tx(0, b"hi", false).await, SubmitOutcome::Ok);
    }
}

//! S2E engine tuning constants.
//!
//! Timing values are in microseconds unless noted otherwise, matching the
//! currency the scheduler and DC governance trade in internally.

use std::time::Duration;

/// TX job pool capacity, shared across all TX units.
pub const MAX_TXJOBS: usize = 128;
/// TX data arena size in bytes.
pub const TX_ARENA_SIZE: usize = 16 * 1024;

/// RX job FIFO capacity.
pub const MAX_RXJOBS: usize = 64;
/// RX data arena size in bytes.
pub const RX_ARENA_SIZE: usize = 8 * 1024;

/// Maximum number of TX units (antenna/radio front-ends) a station may drive.
pub const MAX_TXUNITS: usize = 4;

/// Maximum number of EU868-style DC bands tracked per TX unit.
pub const MAX_DC_BANDS: usize = 3;
/// Maximum number of downlink channels tracked per TX unit.
pub const MAX_DNCHNLS: usize = 48;

/// A job may not be scheduled further ahead of `now` than this.
pub const TX_MAX_AHEAD: u64 = 60_000_000; // 60s
/// Minimum lead time the scheduler wants before committing to the radio.
pub const TX_AIM_GAP: u64 = 50_000; // 50ms
/// Minimum gap enforced between two consecutive transmissions on one unit.
pub const TX_MIN_GAP: u64 = 10_000; // 10ms
/// Grace period after `txtime` during which we still expect the radio to report EMITTING.
pub const TXCHECK_FUDGE: u64 = 5_000; // 5ms

/// Class-C retry count before a job is dropped.
pub const CLASS_C_BACKOFF_MAX: u32 = 10;
/// Class-C retry spacing.
pub const CLASS_C_BACKOFF_BY: u64 = 100_000; // 100ms
/// RX2 fallback delay added to a Class A job's txtime.
pub const RX2_DELAY: u64 = 1_000_000; // 1s

/// Priority bias applied when a job has been pushed to an alternate time.
pub const ALTTXTIME_PENALTY: i32 = 20;
/// Priority bias applied when a job has been pushed to an alternate antenna.
pub const ALTANTENNA_PENALTY: i32 = 10;
/// Reserved priority value used for Class-B beacons.
pub const PRIO_BEACON: u8 = 255;

/// RAL uplink drain cadence.
pub const RX_POLL_INTV: Duration = Duration::from_millis(20);
/// Radio timesync read cadence.
pub const TIMESYNC_RADIO_INTV: Duration = Duration::from_millis(2_100);
/// Cadence at which timesync quality is logged.
pub const TIMESYNC_REPORTS: Duration = Duration::from_secs(300);
/// How long a PPS-derived gpstime anchor stays valid once stale.
pub const PPS_VALID_INTV: u64 = 10_000_000; // 10s

/// Class-B beacon period (128s GPS epochs).
pub const BEACON_INTVL: u64 = 128_000_000;
/// How long before the next beacon slot the generator (re)arms its timer.
pub const BEACON_GUARD: Duration = Duration::from_millis(800);
/// Retry interval while GPS time or position is unavailable.
pub const BEACON_RETRY: Duration = Duration::from_secs(10);

/// Minimum writable send-buffer size the RX forwarder requires before it
/// will pop and encode another job (otherwise it waits for backpressure to clear).
pub const MIN_UPJSON_SIZE: usize = 384;

/// Maximum arguments accepted by the `runcmd` LNS message.
pub const MAX_CMDARGS: usize = 16;

/// Sentinel: DC deadline disabled (channel/band never blocks).
pub const USTIME_MIN: u64 = 0;
/// Sentinel: DC deadline permanently blocked.
pub const USTIME_MAX: u64 = u64::MAX;

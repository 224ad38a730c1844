//! Property tests for invariants that must hold over arbitrary input, not
//! just the handful of examples covered by each module's own unit tests.

use proptest::prelude::*;
use station_engine::airtime::{airtime_us, FrameParams, Modulation};
use station_engine::timesync::xticks_to_xtime;
use station_engine::xq::{RxFifo, RxJob, TxPool};

proptest! {
    /// §4.2: re-extending a 32-bit tick that wrapped from `last_xtime` by
    /// exactly `d` must recover `last_xtime + d` exactly, for any signed
    /// 32-bit delta.
    #[test]
    fn xtime_wraparound_recovers_exact_delta(
        last_hi in 0u32..0xFFFF,
        last_lo in any::<u32>(),
        d in any::<i32>(),
    ) {
        let last_xtime = ((last_hi as u64) << 32) | last_lo as u64;
        let xticks = last_lo.wrapping_add(d as u32);
        let got = xticks_to_xtime(xticks, last_xtime);
        let want = (last_xtime as i64 + d as i64) as u64;
        prop_assert_eq!(got, want);
    }

    /// §4.3: for a fixed spreading factor and bandwidth, a longer payload
    /// never takes less time on air.
    #[test]
    fn airtime_is_monotonic_in_payload_length(
        sf in 7u8..=12,
        len_a in 1u16..200,
        len_b in 1u16..200,
    ) {
        let modulation = Modulation::Lora { sf, bw_hz: 125_000, coding_rate: 1, low_rate_opt: false };
        let t_a = airtime_us(modulation, FrameParams { payload_len: len_a, preamble: 8, crc: true });
        let t_b = airtime_us(modulation, FrameParams { payload_len: len_b, preamble: 8, crc: true });
        if len_a <= len_b {
            prop_assert!(t_a <= t_b);
        } else {
            prop_assert!(t_a >= t_b);
        }
    }

    /// §3.1: across any sequence of reserve/commit/free operations, the
    /// pool's free-list count plus the committed-job count must always
    /// equal its total capacity.
    #[test]
    fn txpool_conserves_slot_count(ops in prop::collection::vec(0u8..3, 1..200)) {
        let mut pool = TxPool::new();
        let mut live: Vec<u8> = Vec::new();
        let capacity = pool.free_count();

        for op in ops {
            match op {
                0 => {
                    if let Some(idx) = pool.reserve_job() {
                        if pool.commit_job(idx, 0).is_ok() {
                            live.push(idx);
                        }
                    }
                }
                1 => {
                    if let Some(idx) = live.pop() {
                        pool.free_job(idx);
                    }
                }
                _ => {}
            }
        }
        prop_assert_eq!(pool.free_count() + live.len(), capacity);
    }

    /// §3.2: the RX FIFO's committed jobs always form a contiguous,
    /// non-overlapping layout in the data arena, regardless of how much
    /// churn (push/pop/drop) precedes a given snapshot.
    #[test]
    fn rx_fifo_layout_never_overlaps(ops in prop::collection::vec(0u8..3, 1..150)) {
        let mut fifo = RxFifo::new();
        for (i, op) in ops.into_iter().enumerate() {
            match op {
                0 => {
                    let payload = vec![i as u8; 1 + (i % 5)];
                    if let Some((idx, buf)) = fifo.next_job(payload.len()) {
                        buf.copy_from_slice(&payload);
                        fifo.commit_job(idx, RxJob { len: payload.len(), ..Default::default() });
                    }
                }
                1 => {
                    fifo.pop_front();
                }
                _ => {
                    let jobs: Vec<_> = fifo.iter().map(|(idx, _)| idx).collect();
                    if let Some(&mid) = jobs.get(jobs.len() / 2) {
                        fifo.drop_job(mid);
                    }
                }
            }
        }
        let spans: Vec<(usize, usize)> = fifo.iter().map(|(idx, j)| (j.off, j.off + j.len)).collect();
        for w in spans.windows(2) {
            prop_assert!(w[0].1 <= w[1].0);
        }
    }
}

//! RX job FIFO: two indices (`first`, `next`) into a fixed-capacity job
//! array, with a sliding-window data arena compacted by a wholesale
//! `memmove` whenever either array fills up.

use crate::constants::{MAX_RXJOBS, RX_ARENA_SIZE};

/// One uplink frame awaiting JSON encoding and forwarding to the LNS.
#[derive(Debug, Clone, Default)]
pub struct RxJob {
    /// Radio context (opaque antenna/chain id).
    pub rctx: u64,
    pub xtime: u64,
    /// Fine timestamp, or `None` if unavailable.
    pub fine_ts: Option<i64>,
    pub freq: u32,
    pub dr: u8,
    /// RSSI, stored negated (i.e. a positive magnitude).
    pub rssi: i16,
    /// SNR, stored x4.
    pub snr4: i16,
    pub off: usize,
    pub len: usize,
}

impl RxJob {
    /// Un-scaled SNR in dB.
    pub fn snr(&self) -> f32 {
        self.snr4 as f32 / 4.0
    }

    /// Un-negated RSSI in dBm.
    pub fn rssi_dbm(&self) -> i32 {
        -(self.rssi as i32)
    }

    /// Mirror-frame dedup score: `8*snr - rssi`, higher wins.
    pub fn mirror_score(&self) -> f32 {
        8.0 * self.snr() - self.rssi_dbm() as f32
    }
}

/// Fixed-capacity RX FIFO with an in-place-compacting data arena.
pub struct RxFifo {
    jobs: Vec<RxJob>,
    arena: Vec<u8>,
    first: usize,
    next: usize,
    /// Write position of the sliding data window.
    tail: usize,
}

impl RxFifo {
    pub fn new() -> Self {
        RxFifo {
            jobs: (0..MAX_RXJOBS).map(|_| RxJob::default()).collect(),
            arena: vec![0u8; RX_ARENA_SIZE],
            first: 0,
            next: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.next
    }

    pub fn len(&self) -> usize {
        self.next - self.first
    }

    /// Shifts the committed span down to index/offset 0, making room at the
    /// tail without losing any still-queued job.
    fn compact(&mut self) {
        if self.first == 0 {
            return;
        }
        let base = if self.next > self.first { self.jobs[self.first].off } else { self.tail };
        let count = self.next - self.first;
        for i in 0..count {
            let mut job = self.jobs[self.first + i].clone();
            job.off -= base;
            self.jobs[i] = job;
        }
        self.arena.copy_within(base..self.tail, 0);
        self.tail -= base;
        self.first = 0;
        self.next = count;
    }

    /// Returns a writable job slot index at `next` and a data-arena view of
    /// up to `maxlen` bytes, compacting first if either array is full.
    /// Returns `None` if there is no room even after compaction.
    pub fn next_job(&mut self, maxlen: usize) -> Option<(usize, &mut [u8])> {
        if self.next >= MAX_RXJOBS || self.tail + maxlen > self.arena.len() {
            self.compact();
        }
        if self.next >= MAX_RXJOBS || self.tail + maxlen > self.arena.len() {
            return None;
        }
        let off = self.tail;
        Some((self.next, &mut self.arena[off..off + maxlen]))
    }

    /// Commits job metadata for the slot previously returned by
    /// [`next_job`], advancing `next`. `idx` must equal the slot at `next`,
    /// and `job.len` must be no greater than the `maxlen` reserved above.
    pub fn commit_job(&mut self, idx: usize, mut job: RxJob) {
        assert_eq!(idx, self.next, "commit_job: idx must be the slot at next");
        job.off = self.tail;
        self.tail += job.len;
        self.jobs[idx] = job;
        self.next += 1;
    }

    /// Pops and returns the oldest committed job.
    pub fn pop_front(&mut self) -> Option<RxJob> {
        if self.is_empty() {
            return None;
        }
        let job = self.jobs[self.first].clone();
        self.first += 1;
        if self.first == self.next {
            // Fully drained: reset to the front so writes don't creep
            // rightwards through the arena forever.
            self.first = 0;
            self.next = 0;
            self.tail = 0;
        }
        Some(job)
    }

    /// Reads back the payload bytes for a still-queued job at `idx`
    /// (`first <= idx < next`).
    pub fn data(&self, idx: usize) -> &[u8] {
        let job = &self.jobs[idx];
        &self.arena[job.off..job.off + job.len]
    }

    /// Iterates the committed jobs in FIFO order, front first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RxJob)> {
        (self.first..self.next).map(move |i| (i, &self.jobs[i]))
    }

    /// Removes a committed slot (used to discard a mirror frame), memmove'ing
    /// trailing jobs and data down and patching their offsets.
    pub fn drop_job(&mut self, idx: usize) {
        assert!(idx >= self.first && idx < self.next, "drop_job: idx out of range");
        let len = self.jobs[idx].len;
        let off = self.jobs[idx].off;

        self.arena.copy_within(off + len..self.tail, off);
        self.tail -= len;

        for i in idx..self.next - 1 {
            let mut job = self.jobs[i + 1].clone();
            job.off -= len;
            self.jobs[i] = job;
        }
        self.next -= 1;
    }
}

impl Default for RxFifo {
    fn default() -> Self {
        Self::new()
    }
}

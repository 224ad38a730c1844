//! TX job pool: fixed-capacity slot array plus a single forward-filled data
//! arena. Sentinel pointers from the C original (`NIL=255`) become
//! `Option<TxIdx>`; the free list and every TX unit's queue are singly
//! linked chains through [`TxJob::next`].

use crate::constants::{MAX_TXJOBS, TX_ARENA_SIZE};
use crate::error::EngineError;
use bitflags::bitflags;

/// Index into the TX job pool's slot array.
pub type TxIdx = u8;

bitflags! {
    /// Per-job state/class flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxFlags: u16 {
        /// Class A downlink (default when no other class bit is set).
        const CLSA = 0;
        /// Class B ping-slot downlink.
        const CLSB = 0b0000_0001;
        /// Class C downlink.
        const CLSC = 0b0000_0010;
        /// Class-B beacon frame.
        const BCN  = 0b0000_0100;
        /// Submitted to the radio (`tx` returned OK).
        const TXING = 0b0001_0000;
        /// Radio status confirmed EMITTING and DC/dntxed have been processed.
        const TXCHECKED = 0b0010_0000;
    }
}

/// RX2 alternate window parameters carried on a job.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TxRx2 {
    pub freq: u32,
    pub dr: u8,
    pub chnl: u8,
}

/// One downlink awaiting or undergoing transmission.
#[derive(Debug, Clone)]
pub struct TxJob {
    /// Downlink interaction id, opaque to the core.
    pub diid: u64,
    /// Device identifier, opaque 64-bit (0 for beacons and silent `dnsched` entries).
    pub deveui: u64,
    /// Absolute host-µs fire time.
    pub txtime: u64,
    /// Radio-xtime equivalent of `txtime`.
    pub xtime: u64,
    /// Optional GPS time (µs since GPS epoch).
    pub gpstime: Option<u64>,
    pub freq: u32,
    pub dr: u8,
    pub rx2: Option<TxRx2>,
    /// Transmit power, scaled x10 dBm.
    pub txpow: i16,
    /// Computed time-on-air in µs.
    pub airtime: u32,
    pub preamble: u16,
    pub add_crc: bool,
    pub flags: TxFlags,
    pub prio: u8,
    pub retries: u32,
    /// Bitmask of alternate antennas still available to try.
    pub alt_ants: u16,
    /// Set once `alt_antenna` has reassigned this job's `rctx`; feeds
    /// `scheduler::priority::effective_prio`'s antenna-switch penalty.
    pub switched_antenna: bool,
    pub rx1_chnl: u8,
    pub rx2_chnl: u8,
    /// Radio context (antenna/chain) this job targets.
    pub rctx: u64,

    /// Offset into the TX data arena, once committed.
    pub data_off: Option<u16>,
    pub data_len: u16,

    /// Next node in whichever list currently owns this slot (free list or
    /// a TX unit's queue). `None` only while the slot is transiently
    /// unlinked during relocation.
    pub next: Option<TxIdx>,
}

impl Default for TxJob {
    fn default() -> Self {
        TxJob {
            diid: 0,
            deveui: 0,
            txtime: 0,
            xtime: 0,
            gpstime: None,
            freq: 0,
            dr: 0,
            rx2: None,
            txpow: 0,
            airtime: 0,
            preamble: 8,
            add_crc: true,
            flags: TxFlags::CLSA,
            prio: 0,
            retries: 0,
            alt_ants: 0,
            switched_antenna: false,
            rx1_chnl: 0,
            rx2_chnl: 0,
            rctx: 0,
            data_off: None,
            data_len: 0,
            next: None,
        }
    }
}

impl TxJob {
    pub fn payload_end(&self) -> u64 {
        self.txtime + self.airtime as u64
    }
}

/// Fixed-capacity TX job pool with a compacting data arena.
pub struct TxPool {
    jobs: Vec<TxJob>,
    committed: Vec<bool>,
    free_head: Option<TxIdx>,
    arena: Vec<u8>,
    data_in_use: usize,
}

impl TxPool {
    pub fn new() -> Self {
        let mut jobs = Vec::with_capacity(MAX_TXJOBS);
        let mut committed = Vec::with_capacity(MAX_TXJOBS);
        for i in 0..MAX_TXJOBS {
            let mut job = TxJob::default();
            job.next = if i + 1 < MAX_TXJOBS { Some((i + 1) as TxIdx) } else { None };
            jobs.push(job);
            committed.push(false);
        }
        TxPool {
            jobs,
            committed,
            free_head: Some(0),
            arena: vec![0u8; TX_ARENA_SIZE],
            data_in_use: 0,
        }
    }

    pub fn job(&self, idx: TxIdx) -> &TxJob {
        &self.jobs[idx as usize]
    }

    pub fn job_mut(&mut self, idx: TxIdx) -> &mut TxJob {
        &mut self.jobs[idx as usize]
    }

    pub fn is_committed(&self, idx: TxIdx) -> bool {
        self.committed[idx as usize]
    }

    /// Number of bytes currently owned by committed jobs.
    pub fn data_in_use(&self) -> usize {
        self.data_in_use
    }

    /// Number of slots on the free list.
    pub fn free_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while let Some(idx) = cur {
            n += 1;
            cur = self.jobs[idx as usize].next;
        }
        n
    }

    /// Returns the current free-list head, pre-zeroed, without unlinking it.
    /// The caller fills in fields and then either calls [`commit_job`] or
    /// simply leaves the slot untouched (an uncommitted reservation is a
    /// no-op: the slot was never unlinked from the free list).
    ///
    /// [`commit_job`]: TxPool::commit_job
    pub fn reserve_job(&mut self) -> Option<TxIdx> {
        let idx = self.free_head?;
        let next = self.jobs[idx as usize].next;
        let mut fresh = TxJob::default();
        fresh.next = next;
        self.jobs[idx as usize] = fresh;
        Some(idx)
    }

    /// Returns a writable view at the arena tail of up to `maxlen` bytes.
    /// Does not consume arena space; [`commit_job`] finalises the actual
    /// length used.
    ///
    /// [`commit_job`]: TxPool::commit_job
    pub fn reserve_data(&mut self, maxlen: usize) -> Option<&mut [u8]> {
        if self.arena.len() - self.data_in_use < maxlen {
            return None;
        }
        let start = self.data_in_use;
        Some(&mut self.arena[start..start + maxlen])
    }

    /// Commits `idx`, which must be the current free-list head, taking
    /// ownership of `data_len` bytes at the arena tail.
    pub fn commit_job(&mut self, idx: TxIdx, data_len: u16) -> Result<(), EngineError> {
        if self.free_head != Some(idx) {
            return Err(EngineError::Fatal(format!(
                "commit_job: {idx} is not the free-list head"
            )));
        }
        let next_free = self.jobs[idx as usize].next;
        self.free_head = next_free;

        let off = self.data_in_use as u16;
        self.jobs[idx as usize].data_off = Some(off);
        self.jobs[idx as usize].data_len = data_len;
        self.jobs[idx as usize].next = None;
        self.data_in_use += data_len as usize;
        self.committed[idx as usize] = true;
        Ok(())
    }

    /// Releases `idx` back to the free list, compacting the data arena and
    /// patching every other committed job's offset so the invariant
    /// `txdataInUse == sum(len)` keeps holding.
    pub fn free_job(&mut self, idx: TxIdx) {
        if let Some(off) = self.jobs[idx as usize].data_off {
            let len = self.jobs[idx as usize].data_len as usize;
            let off = off as usize;
            self.arena.copy_within(off + len..self.data_in_use, off);
            for (i, job) in self.jobs.iter_mut().enumerate() {
                if self.committed[i] && i != idx as usize {
                    if let Some(joff) = job.data_off {
                        if joff as usize >= off + len {
                            job.data_off = Some(joff - len as u16);
                        }
                    }
                }
            }
            self.data_in_use -= len;
        }
        self.committed[idx as usize] = false;
        self.jobs[idx as usize].data_off = None;
        self.jobs[idx as usize].data_len = 0;
        self.jobs[idx as usize].next = self.free_head;
        self.free_head = Some(idx);
    }

    /// Reads back the committed payload bytes for `idx`.
    pub fn data(&self, idx: TxIdx) -> &[u8] {
        match self.jobs[idx as usize].data_off {
            Some(off) => {
                let off = off as usize;
                let len = self.jobs[idx as usize].data_len as usize;
                &self.arena[off..off + len]
            }
            None => &[],
        }
    }

    /// Prepends `idx` to the list rooted at `*head`.
    pub fn insert_job(&mut self, head: &mut Option<TxIdx>, idx: TxIdx) {
        self.jobs[idx as usize].next = *head;
        *head = Some(idx);
    }

    /// Pops the front of the list rooted at `*head`.
    pub fn unqueue_job(&mut self, head: &mut Option<TxIdx>) -> Option<TxIdx> {
        let idx = (*head)?;
        *head = self.jobs[idx as usize].next;
        self.jobs[idx as usize].next = None;
        Some(idx)
    }

    /// Inserts `idx` into the ascending-`txtime` list rooted at `*head`,
    /// preserving order. Used by the scheduler's `add_txjob`.
    pub fn insert_sorted(&mut self, head: &mut Option<TxIdx>, idx: TxIdx) {
        let txtime = self.jobs[idx as usize].txtime;
        let mut cur = *head;
        let mut prev: Option<TxIdx> = None;
        while let Some(c) = cur {
            if self.jobs[c as usize].txtime > txtime {
                break;
            }
            prev = Some(c);
            cur = self.jobs[c as usize].next;
        }
        match prev {
            None => {
                self.jobs[idx as usize].next = *head;
                *head = Some(idx);
            }
            Some(p) => {
                self.jobs[idx as usize].next = self.jobs[p as usize].next;
                self.jobs[p as usize].next = Some(idx);
            }
        }
    }

    /// Removes `idx` from the list rooted at `*head`, wherever it is.
    pub fn unlink(&mut self, head: &mut Option<TxIdx>, idx: TxIdx) {
        if *head == Some(idx) {
            *head = self.jobs[idx as usize].next;
            self.jobs[idx as usize].next = None;
            return;
        }
        let mut cur = *head;
        while let Some(c) = cur {
            let next = self.jobs[c as usize].next;
            if next == Some(idx) {
                self.jobs[c as usize].next = self.jobs[idx as usize].next;
                self.jobs[idx as usize].next = None;
                return;
            }
            cur = next;
        }
    }

    /// Iterates a list's indices in order, head first.
    pub fn iter_list(&self, head: Option<TxIdx>) -> ListIter<'_> {
        ListIter { pool: self, cur: head }
    }
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ListIter<'a> {
    pool: &'a TxPool,
    cur: Option<TxIdx>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = TxIdx;
    fn next(&mut self) -> Option<TxIdx> {
        let idx = self.cur?;
        self.cur = self.pool.jobs[idx as usize].next;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_with(pool: &mut TxPool, len: u16, txtime: u64) -> TxIdx {
        let idx = pool.reserve_job().expect("pool has room");
        pool.job_mut(idx).txtime = txtime;
        let buf = pool.reserve_data(len as usize).unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        pool.commit_job(idx, len).unwrap();
        idx
    }

    #[test]
    fn fresh_pool_has_all_slots_free() {
        let pool = TxPool::new();
        assert_eq!(pool.free_count(), MAX_TXJOBS);
        assert_eq!(pool.data_in_use(), 0);
    }

    #[test]
    fn commit_consumes_free_list_head_and_arena() {
        let mut pool = TxPool::new();
        let idx = commit_with(&mut pool, 10, 100);
        assert_eq!(pool.free_count(), MAX_TXJOBS - 1);
        assert_eq!(pool.data_in_use(), 10);
        assert_eq!(pool.data(idx).len(), 10);
    }

    #[test]
    fn commit_rejects_non_head_slot() {
        let mut pool = TxPool::new();
        let _first = pool.reserve_job().unwrap();
        let second = pool.reserve_job().unwrap();
        assert!(pool.commit_job(second, 4).is_err());
    }

    #[test]
    fn free_job_compacts_arena_and_patches_offsets() {
        let mut pool = TxPool::new();
        let a = commit_with(&mut pool, 10, 100);
        let b = commit_with(&mut pool, 20, 200);
        let c = commit_with(&mut pool, 5, 300);

        assert_eq!(pool.job(b).data_off, Some(10));
        assert_eq!(pool.job(c).data_off, Some(30));

        pool.free_job(a);

        assert_eq!(pool.data_in_use(), 25);
        assert_eq!(pool.job(b).data_off, Some(0));
        assert_eq!(pool.job(c).data_off, Some(20));
        assert_eq!(pool.free_count(), MAX_TXJOBS - 2);
    }

    #[test]
    fn insert_sorted_keeps_ascending_txtime() {
        let mut pool = TxPool::new();
        let mut head = None;
        for t in [500u64, 100, 300, 200, 400] {
            let idx = pool.reserve_job().unwrap();
            pool.job_mut(idx).txtime = t;
            pool.commit_job(idx, 0).unwrap();
            pool.insert_sorted(&mut head, idx);
        }
        let times: Vec<u64> = pool.iter_list(head).map(|i| pool.job(i).txtime).collect();
        assert_eq!(times, vec![100, 200, 300, 400, 500]);
    }

    #[test]
    fn unlink_removes_from_middle() {
        let mut pool = TxPool::new();
        let mut head = None;
        let mut idxs = vec![];
        for t in [100u64, 200, 300] {
            let idx = pool.reserve_job().unwrap();
            pool.job_mut(idx).txtime = t;
            pool.commit_job(idx, 0).unwrap();
            pool.insert_sorted(&mut head, idx);
            idxs.push(idx);
        }
        pool.unlink(&mut head, idxs[1]);
        let times: Vec<u64> = pool.iter_list(head).map(|i| pool.job(i).txtime).collect();
        assert_eq!(times, vec![100, 300]);
    }

    #[test]
    fn conservation_holds_across_reserve_commit_free() {
        let mut pool = TxPool::new();
        let mut live = vec![];
        for i in 0..20u16 {
            live.push(commit_with(&mut pool, i % 7, i as u64));
        }
        for idx in live.iter().step_by(2) {
            pool.free_job(*idx);
        }
        let expected_free: usize = MAX_TXJOBS - 10;
        assert_eq!(pool.free_count(), expected_free);
        let expected_data: usize = (0..20u16).step_by(2).map(|i| (i % 7) as usize).sum();
        assert_eq!(pool.data_in_use(), expected_data);
    }
}

//! Handlers for each `msgtype` the LNS can send (§4.8). Each handler is a
//! free function taking exactly the engine state it touches, so the event
//! loop in `engine.rs` stays the only place that holds everything at once.

use super::protocol::{Dnmsg, DnschedEntry, GetxtimeReply, RuncmdMsg};
use crate::channel_plan::ChannelPlan;
use crate::error::EngineError;
use crate::runcmd::RunCmd;
use crate::timesync::Timesync;
use crate::xq::{TxFlags, TxPool, TxRx2};
use log::warn;

/// Resolves a downlink channel index for `freq`/`dr` via `plan`, falling
/// back to channel 0 when the DR has no known RPS mapping yet (e.g. before
/// `router_config`'s `DRs` table was applied).
fn resolve_chnl(plan: &mut ChannelPlan, freq: u32, dr: u8) -> u8 {
    plan.dr2rps(dr)
        .and_then(|rps| plan.discover_dnchannel(freq, rps))
        .unwrap_or(0) as u8
}

/// Converts a decoded `dnmsg` into a pool-committed TX job. Returns the
/// slot index; the caller is responsible for queuing it with the
/// scheduler (`add_txjob`), which may still reject it.
pub fn handle_dnmsg(
    msg: &Dnmsg,
    pool: &mut TxPool,
    ts: &Timesync,
    _txunit: usize,
    base_xtime: u64,
    plan: &mut ChannelPlan,
) -> Result<crate::xq::TxIdx, EngineError> {
    let has_rx1 = msg.rx1_dr.is_some() && msg.rx1_freq.is_some();
    let has_rx2 = msg.rx2_dr.is_some() && msg.rx2_freq.is_some();
    if !has_rx1 && !has_rx2 {
        return Err(EngineError::Protocol(
            "dnmsg missing both RX1 and RX2 parameters".to_string(),
        ));
    }

    // RxDelay=0 is coerced to 1; preserved per the source's behaviour even
    // though current LoRaWAN semantics are debatable (see DESIGN.md).
    let rx_delay = match msg.rx_delay.unwrap_or(1) {
        0 => {
            warn!("dnmsg: RxDelay=0 coerced to 1");
            1
        }
        d => d,
    };

    let xtime = base_xtime + rx_delay as u64 * 1_000_000;
    let txtime = ts.xtime_to_ustime(xtime);
    if txtime == 0 {
        return Err(EngineError::Timesync("dnmsg: xtime has no known host mapping".to_string()));
    }

    let idx = pool.reserve_job().ok_or_else(|| EngineError::ResourceExhausted("TX pool full".to_string()))?;
    {
        let job = pool.job_mut(idx);
        job.diid = msg.diid;
        job.deveui = msg.deveui;
        job.txtime = txtime;
        job.xtime = xtime;
        job.gpstime = msg.gpstime;
        job.rctx = msg.rctx.unwrap_or(0);
        job.preamble = msg.preamble.unwrap_or(8);
        job.add_crc = msg.addcrc.unwrap_or(true);
        job.prio = msg.priority.unwrap_or(0);
        job.flags = class_flags(msg.device_class);

        if has_rx1 {
            job.dr = msg.rx1_dr.unwrap();
            job.freq = msg.rx1_freq.unwrap();
            job.rx1_chnl = resolve_chnl(plan, job.freq, job.dr);
        } else {
            // Pre-switched straight to RX2, as the RX1-absent path requires.
            job.dr = msg.rx2_dr.unwrap();
            job.freq = msg.rx2_freq.unwrap();
            job.retries = 1;
            job.rx1_chnl = resolve_chnl(plan, job.freq, job.dr);
        }
        if has_rx2 {
            let rx2_freq = msg.rx2_freq.unwrap();
            let rx2_dr = msg.rx2_dr.unwrap();
            let chnl = resolve_chnl(plan, rx2_freq, rx2_dr);
            job.rx2_chnl = chnl;
            job.rx2 = Some(TxRx2 { freq: rx2_freq, dr: rx2_dr, chnl });
        }
    }

    let buf = pool
        .reserve_data(msg.pdu.len())
        .ok_or_else(|| EngineError::ResourceExhausted("TX data arena full".to_string()))?;
    buf.copy_from_slice(&msg.pdu);
    pool.commit_job(idx, msg.pdu.len() as u16)?;
    Ok(idx)
}

fn class_flags(device_class: u8) -> TxFlags {
    match device_class {
        1 => TxFlags::CLSB,
        2 => TxFlags::CLSC,
        _ => TxFlags::CLSA,
    }
}

/// Converts one `dnsched` entry into a committed TX job using whichever of
/// `ontime`/`gpstime`/`xtime` was supplied, in that preference order.
pub fn handle_dnsched_entry(
    entry: &DnschedEntry,
    pool: &mut TxPool,
    ts: &Timesync,
    txunit: usize,
    now_ustime: u64,
    plan: &mut ChannelPlan,
) -> Result<crate::xq::TxIdx, EngineError> {
    let txtime = if let Some(on) = entry.ontime {
        on
    } else if let Some(gps) = entry.gpstime {
        let xtime = ts.gpstime_to_xtime(txunit, now_ustime, gps);
        let t = ts.xtime_to_ustime(xtime);
        if t == 0 {
            return Err(EngineError::Timesync("dnsched: gpstime has no PPS anchor".to_string()));
        }
        t
    } else if let Some(xt) = entry.xtime {
        let t = ts.xtime_to_ustime(xt);
        if t == 0 {
            return Err(EngineError::Timesync("dnsched: xtime has no known host mapping".to_string()));
        }
        t
    } else {
        return Err(EngineError::Protocol(
            "dnsched entry missing ontime/gpstime/xtime".to_string(),
        ));
    };

    let idx = pool.reserve_job().ok_or_else(|| EngineError::ResourceExhausted("TX pool full".to_string()))?;
    {
        let job = pool.job_mut(idx);
        job.txtime = txtime;
        job.dr = entry.dr;
        job.freq = entry.freq;
        job.gpstime = entry.gpstime;
        job.rx1_chnl = resolve_chnl(plan, entry.freq, entry.dr);
        // dnsched entries carry no DevEUI, so no dntxed will ever be emitted for them.
    }
    let buf = pool
        .reserve_data(entry.pdu.len())
        .ok_or_else(|| EngineError::ResourceExhausted("TX data arena full".to_string()))?;
    buf.copy_from_slice(&entry.pdu);
    pool.commit_job(idx, entry.pdu.len() as u16)?;
    Ok(idx)
}

/// `timesync`: anchors `txunit`'s xtime<->gpstime mapping from the echoed
/// `xtime`/`gpstime` pair, then records the LNS round-trip offset if
/// `txtime` and `gpstime` were both supplied too.
pub fn handle_timesync(
    xtime: Option<u64>,
    txtime: Option<f64>,
    gpstime: Option<u64>,
    rxtime_ustime: u64,
    txunit: usize,
    ts: &mut Timesync,
) {
    if let (Some(x), Some(g)) = (xtime, gpstime) {
        ts.set_timesync_lns(txunit, x, g, rxtime_ustime);
    }
    if let (Some(t), Some(g)) = (txtime, gpstime) {
        ts.process_timesync_lns(t, rxtime_ustime, g);
    }
}

pub fn handle_getxtime(muxtime: f64, ustime: u64, ts: &Timesync, num_units: usize) -> GetxtimeReply {
    GetxtimeReply {
        muxtime,
        ustime,
        utctime: ustime,
        xtimes: (0..num_units).map(|u| ts.ustime_to_xtime(u, ustime)).collect(),
    }
}

pub fn handle_runcmd(msg: &RuncmdMsg) -> Result<RunCmd, EngineError> {
    RunCmd::new(msg.command.clone(), msg.arguments.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timesync::Timesync;

    fn synced_ts() -> Timesync {
        let mut ts = Timesync::new(1);
        ts.get_and_update(0, 1_000, 5_000, 1_002, None, false, std::time::Duration::from_millis(2100));
        ts
    }

    #[test]
    fn dnmsg_requires_rx1_or_rx2() {
        let mut pool = TxPool::new();
        let ts = synced_ts();
        let msg = Dnmsg {
            deveui: 1,
            device_class: 0,
            diid: 1,
            pdu: vec![1, 2, 3],
            rx_delay: Some(1),
            rx1_dr: None,
            rx1_freq: None,
            rx2_dr: None,
            rx2_freq: None,
            gpstime: None,
            priority: None,
            rctx: None,
            preamble: None,
            addcrc: None,
            muxtime: None,
        };
        let mut plan = ChannelPlan::new(4);
        assert!(handle_dnmsg(&msg, &mut pool, &ts, 0, 0, &mut plan).is_err());
    }

    #[test]
    fn dnmsg_rxdelay_zero_coerced_to_one() {
        let mut pool = TxPool::new();
        let ts = synced_ts();
        let msg = Dnmsg {
            deveui: 1,
            device_class: 0,
            diid: 1,
            pdu: vec![1, 2, 3],
            rx_delay: Some(0),
            rx1_dr: Some(5),
            rx1_freq: Some(868_100_000),
            rx2_dr: None,
            rx2_freq: None,
            gpstime: None,
            priority: None,
            rctx: None,
            preamble: None,
            addcrc: None,
            muxtime: None,
        };
        let mut plan = ChannelPlan::new(4);
        let idx = handle_dnmsg(&msg, &mut pool, &ts, 0, 0, &mut plan).unwrap();
        assert_eq!(pool.job(idx).txtime, ts.xtime_to_ustime(1_000_000));
    }

    #[test]
    fn timesync_anchors_and_records_offset() {
        let mut ts = synced_ts();
        handle_timesync(Some(5_000), Some(1_700_000_000.0), Some(1_000_000_000), 1_001, 0, &mut ts);
        assert_eq!(ts.xtime_to_gpstime(1_001, 5_000), 1_000_000_000);
        assert!(ts.lns_time_now(1_001).is_some());
    }

    #[test]
    fn runcmd_rejects_too_many_args() {
        let msg = RuncmdMsg {
            command: "echo".to_string(),
            arguments: vec!["x".to_string(); 20],
        };
        assert!(handle_runcmd(&msg).is_err());
    }
}

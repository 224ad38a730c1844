//! The event loop: one cooperative task that owns every core component and
//! drives it from a recomputed single timer plus the downstream message
//! channel. Real radio I/O is awaited through [`Ral`]; everything else
//! (scheduler, timesync, duty cycle, RX dedup) stays synchronous so it can
//! be tested without a radio at all.

use crate::beacon::{BeaconGenerator, GpsFix};
use crate::channel_plan::ChannelPlan;
use crate::constants::{RX_POLL_INTV, TIMESYNC_RADIO_INTV};
use crate::dc::{DutyCycle, Region};
use crate::error::EngineError;
use crate::filters::{JoinEuiFilter, NetIdFilter};
use crate::lns::protocol::{DntxedMsg, DownstreamMessage, UpstreamMessage};
use crate::lns::{dispatch, protocol};
use crate::ral::{RawUplink, Ral};
use crate::rx_forwarder::{self, Filters, HeaderParser};
use crate::scheduler::{NextAction, Scheduler, SubmitOutcome};
use crate::timesync::Timesync;
use crate::transport::SendBuf;
use crate::xq::RxFifo;
use log::{info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Sleep};
use std::pin::Pin;

/// Host-µs (Unix-epoch-anchored, see [`Engine::host_now`]) to whole UTC
/// seconds, for wire fields documented as "UTC seconds".
fn ustime_to_utc_seconds(ustime: u64) -> u64 {
    ustime / 1_000_000
}

fn region_from_str(s: &str) -> Region {
    match s.to_ascii_uppercase().as_str() {
        "EU868" => Region::Eu868,
        "IL915" => Region::Il915,
        "KR920" => Region::Kr920,
        "AS923-1" | "AS923_1" => Region::As923_1,
        "US915" => Region::Us915,
        "AU915" => Region::Au915,
        _ => Region::Unknown,
    }
}

/// Owns every core component and runs the event loop. Generic over the
/// radio boundary, the uplink header parser, and the outbound transport so
/// tests can swap in in-memory doubles for all three.
pub struct Engine<R: Ral, P: HeaderParser, S: SendBuf> {
    ral: R,
    scheduler: Scheduler,
    timesync: Timesync,
    rx_fifo: RxFifo,
    channel_plans: Vec<ChannelPlan>,
    filters: Filters,
    header_parser: P,
    beacon: Option<BeaconGenerator>,
    gps_fix: Option<GpsFix>,
    send: S,
    muxtime_base: u64,
    num_units: usize,
    dntxed_seqno: u64,
    pps_enabled: bool,
    configured: bool,
}

impl<R: Ral, P: HeaderParser, S: SendBuf> Engine<R, P, S> {
    pub fn new(ral: R, header_parser: P, send: S, num_units: usize) -> Self {
        let dc = (0..num_units).map(|_| DutyCycle::new(Region::Unknown)).collect();
        Engine {
            ral,
            scheduler: Scheduler::new(dc),
            timesync: Timesync::new(num_units),
            rx_fifo: RxFifo::new(),
            channel_plans: (0..num_units).map(|_| ChannelPlan::new(crate::constants::MAX_DNCHNLS)).collect(),
            filters: Filters { joineui: JoinEuiFilter::default(), netid: NetIdFilter::allow_all() },
            header_parser,
            beacon: None,
            gps_fix: None,
            send,
            muxtime_base: 0,
            num_units,
            dntxed_seqno: 0,
            pps_enabled: false,
            configured: false,
        }
    }

    /// Runs until `downstream` closes. Each iteration waits on either a
    /// fresh message from the LNS or the nearest of the pending subsystem
    /// deadlines, recomputed from scratch after every wakeup.
    pub async fn run(mut self, mut downstream: mpsc::UnboundedReceiver<String>) {
        let mut rx_deadline = Instant::now();
        let mut timesync_deadlines = vec![Instant::now(); self.num_units];
        let mut tx_deadlines = vec![Instant::now(); self.num_units];
        let mut beacon_deadline = Instant::now() + Duration::from_secs(3600);

        loop {
            let next = [rx_deadline]
                .into_iter()
                .chain(timesync_deadlines.iter().copied())
                .chain(tx_deadlines.iter().copied())
                .chain([beacon_deadline])
                .min()
                .unwrap();
            let sleep: Pin<Box<Sleep>> = Box::pin(time::sleep_until(next));

            tokio::select! {
                msg = downstream.recv() => {
                    match msg {
                        Some(text) => {
                            if let Err(e) = self.handle_downstream(&text).await {
                                warn!("downstream message rejected: {e}");
                            }
                        }
                        None => return,
                    }
                }
                _ = sleep => {
                    let now = Instant::now();
                    if now >= rx_deadline {
                        self.poll_rx().await;
                        rx_deadline = now + RX_POLL_INTV;
                    }
                    for u in 0..self.num_units {
                        if now >= timesync_deadlines[u] {
                            let next_poll = self.poll_timesync(u).await;
                            timesync_deadlines[u] = now + next_poll;
                        }
                        if now >= tx_deadlines[u] {
                            tx_deadlines[u] = now + self.drive_tx(u).await;
                        }
                    }
                    if self.beacon.is_some() && now >= beacon_deadline {
                        beacon_deadline = now + self.tick_beacon();
                    }
                }
            }
        }
    }

    async fn poll_rx(&mut self) {
        let uplinks = self.ral.fetch().await;
        for u in uplinks {
            self.ingest_uplink(u);
        }
        let now = self.host_now();
        rx_forwarder::flush_rxjobs(
            &mut self.rx_fifo,
            &self.header_parser,
            &self.filters,
            self.muxtime_base,
            &self.timesync,
            now,
            &mut self.send,
        );
    }

    fn ingest_uplink(&mut self, raw: RawUplink) {
        let job = crate::xq::RxJob {
            rctx: raw.rctx,
            xtime: raw.xtime,
            fine_ts: raw.fine_ts,
            freq: raw.freq,
            dr: raw.dr,
            // RawUplink carries the true negative dBm reading; RxJob stores
            // it negated (a positive magnitude), per `RxJob::rssi_dbm`.
            rssi: -raw.rssi,
            snr4: raw.snr4,
            off: 0,
            len: raw.payload.len(),
        };
        rx_forwarder::add_rxjob(&mut self.rx_fifo, &raw.payload, job);
    }

    async fn poll_timesync(&mut self, txunit: usize) -> Duration {
        let (before, xticks, after, pps_xticks) = self.ral.get_timesync(self.pps_enabled).await;
        self.timesync.get_and_update(txunit, before, xticks, after, pps_xticks, self.pps_enabled, TIMESYNC_RADIO_INTV)
    }

    /// Advances unit `txunit`'s TX queue by one step, awaiting the radio
    /// when the scheduler asks for a submit or status query.
    async fn drive_tx(&mut self, txunit: usize) -> Duration {
        let now = self.host_now();
        match self.scheduler.next_tx_action(txunit, now) {
            None => Duration::from_millis(500),
            Some(NextAction::Wait(d)) => d,
            Some(NextAction::QueryStatus(idx)) => {
                let status = self.ral.txstatus(txunit).await;
                if let Some(ev) = self.scheduler.on_status(txunit, idx, status, self.host_now()) {
                    self.send_dntxed(ev);
                }
                Duration::ZERO
            }
            Some(NextAction::Submit { idx, cca_disabled }) => {
                let payload = self.scheduler.pool().data(idx).to_vec();
                let outcome = self.ral.tx(txunit, &payload, cca_disabled).await;
                self.scheduler.on_submit_result(txunit, idx, outcome, self.host_now());
                if outcome != SubmitOutcome::Ok {
                    warn!("tx submission failed on unit {txunit}: {outcome:?}");
                }
                Duration::ZERO
            }
        }
    }

    fn tick_beacon(&mut self) -> Duration {
        let Some(beacon) = self.beacon.as_mut() else { return Duration::from_secs(3600) };
        let (scheduled, delay) = beacon.tick(self.gps_fix.as_ref());
        if let Some((mut job, payload)) = scheduled {
            let now = self.host_now();
            let gpstime = job.gpstime.unwrap_or(0);
            let xtime = self.timesync.gpstime_to_xtime(0, now, gpstime);
            let txtime = self.timesync.xtime_to_ustime(xtime);
            if txtime == 0 {
                warn!("beacon: no gpstime<->host mapping yet, dropping this epoch's beacon");
                return delay;
            }
            job.xtime = xtime;
            job.txtime = txtime;
            if let Some(idx) = self.scheduler.pool_mut().reserve_job() {
                let data_len = payload.len() as u16;
                *self.scheduler.pool_mut().job_mut(idx) = job;
                if let Some(buf) = self.scheduler.pool_mut().reserve_data(payload.len()) {
                    buf.copy_from_slice(&payload);
                    if self.scheduler.pool_mut().commit_job(idx, data_len).is_ok() {
                        let _ = self.scheduler.add_txjob(0, idx, now);
                    } else {
                        self.scheduler.pool_mut().free_job(idx);
                    }
                } else {
                    self.scheduler.pool_mut().free_job(idx);
                }
            }
        }
        delay
    }

    /// Host monotonic clock, µs. The scheduler and timesync only ever
    /// compare deltas against values they were themselves handed, so any
    /// monotonically increasing source works here.
    fn host_now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn send_dntxed(&mut self, ev: crate::scheduler::DntxedEvent) {
        self.dntxed_seqno += 1;
        let msg = UpstreamMessage::Dntxed(DntxedMsg {
            diid: ev.diid,
            seqno: self.dntxed_seqno,
            dr: ev.dr,
            freq: ev.freq,
            deveui: ev.deveui,
            rctx: ev.rctx,
            xtime: ev.xtime,
            txtime: ustime_to_utc_seconds(ev.txtime),
            gpstime: ev.gpstime,
        });
        self.send_json(&msg);
    }

    fn send_json(&mut self, msg: &UpstreamMessage) {
        let Ok(text) = serde_json::to_vec(msg) else {
            warn!("failed to encode upstream message");
            return;
        };
        if let Some(buf) = self.send.get(text.len()) {
            buf[..text.len()].copy_from_slice(&text);
            self.send.commit_text(text.len());
        } else {
            warn!("dropping upstream message, send buffer full");
        }
    }

    async fn handle_downstream(&mut self, text: &str) -> Result<(), EngineError> {
        let msg: DownstreamMessage = serde_json::from_str(text)?;
        let now = self.host_now();
        match msg {
            DownstreamMessage::RouterConfig(cfg) => self.handle_router_config(cfg).await,
            DownstreamMessage::Dnmsg(m) => self.guarded_downlink(|e| e.handle_dnmsg(m, now)),
            DownstreamMessage::Dnsched(s) => self.guarded_downlink(|e| e.handle_dnsched(s, now)),
            DownstreamMessage::Dnframe(f) => self.guarded_downlink(|e| e.handle_dnframe(f, now)),
            DownstreamMessage::Timesync(t) => {
                let txunit = t.xtime.map(|x| self.ral.xtime2txunit(x)).unwrap_or(0);
                dispatch::handle_timesync(t.xtime, t.txtime, t.gpstime, now, txunit, &mut self.timesync);
                Ok(())
            }
            DownstreamMessage::Getxtime(req) => {
                let reply = dispatch::handle_getxtime(req.muxtime.unwrap_or(0.0), now, &self.timesync, self.num_units);
                self.send_json(&UpstreamMessage::Getxtime(reply));
                Ok(())
            }
            DownstreamMessage::Runcmd(m) => {
                let cmd = dispatch::handle_runcmd(&m)?;
                match cmd.run().await {
                    Ok(result) => info!("runcmd '{}' exited {:?}", m.command, result.exit_code),
                    Err(e) => warn!("runcmd '{}' failed: {e}", m.command),
                }
                Ok(())
            }
            DownstreamMessage::Unknown => {
                self.send_json(&UpstreamMessage::Error { error: "unsupported msgtype".to_string() });
                Ok(())
            }
        }
    }

    /// `router_config` gates every downlink handler: messages that arrive
    /// before the engine has been configured are dropped with a warning
    /// rather than acted on.
    fn guarded_downlink(&mut self, f: impl FnOnce(&mut Self) -> Result<(), EngineError>) -> Result<(), EngineError> {
        if !self.configured {
            warn!("downlink message dropped, router_config not yet applied");
            return Ok(());
        }
        f(self)
    }

    async fn handle_router_config(&mut self, cfg: protocol::RouterConfig) -> Result<(), EngineError> {
        if self.configured {
            warn!("router_config already applied, ignoring repeat");
            return Ok(());
        }
        let region = region_from_str(&cfg.region);
        self.scheduler.dc = (0..self.num_units).map(|_| DutyCycle::new(region)).collect();
        if let Some(ranges) = cfg.jo_in_eui_range {
            self.filters.joineui = JoinEuiFilter::new(ranges);
        }
        if let Some(netids) = cfg.netids {
            self.filters.netid = NetIdFilter::from_netids(netids);
        }

        let upchannels: Vec<crate::ral::UpchannelSpec> = cfg
            .upchannels
            .iter()
            .flatten()
            .map(|&(freq_hz, bw_hz, min_sf, max_sf)| crate::ral::UpchannelSpec { freq_hz, bw_hz, min_sf, max_sf })
            .collect();
        for plan in &mut self.channel_plans {
            plan.set_upchannels(
                upchannels
                    .iter()
                    .map(|u| crate::channel_plan::UpChannel {
                        freq_hz: u.freq_hz,
                        bw_hz: u.bw_hz,
                        min_sf: u.min_sf,
                        max_sf: u.max_sf,
                    })
                    .collect(),
            );
            if let Some(drs) = &cfg.drs {
                for (dr, &(sf, bw_index, dn_only)) in drs.iter().enumerate() {
                    plan.set_dr(dr as u8, crate::channel_plan::Rps::new(sf, bw_index, dn_only));
                }
            }
        }

        self.ral.config(&cfg.hwspec, region as u32, &[], &upchannels).await?;
        self.configured = true;
        info!("router_config applied: region={region:?} hwspec={}", cfg.hwspec);
        Ok(())
    }

    fn handle_dnmsg(&mut self, m: protocol::Dnmsg, now: u64) -> Result<(), EngineError> {
        let txunit = self.ral.xtime2txunit(self.timesync.ustime_to_xtime(0, now));
        let base_xtime = self.timesync.ustime_to_xtime(txunit, now);
        let idx = dispatch::handle_dnmsg(
            &m,
            self.scheduler.pool_mut(),
            &self.timesync,
            txunit,
            base_xtime,
            &mut self.channel_plans[txunit],
        )?;
        self.scheduler
            .add_txjob(txunit, idx, now)
            .map_err(|e| EngineError::Regulatory(e.to_string()))
    }

    fn handle_dnsched(&mut self, s: protocol::Dnsched, now: u64) -> Result<(), EngineError> {
        for entry in &s.dnsched {
            let idx = dispatch::handle_dnsched_entry(
                entry,
                self.scheduler.pool_mut(),
                &self.timesync,
                0,
                now,
                &mut self.channel_plans[0],
            )?;
            if let Err(e) = self.scheduler.add_txjob(0, idx, now) {
                warn!("dnsched entry dropped: {e}");
            }
        }
        Ok(())
    }

    fn handle_dnframe(&mut self, f: protocol::Dnframe, now: u64) -> Result<(), EngineError> {
        let dnmsg = protocol::Dnmsg {
            deveui: f.deveui,
            device_class: 0,
            diid: f.diid,
            pdu: f.pdu,
            rx_delay: Some(1),
            rx1_dr: f.rx1_dr,
            rx1_freq: f.rx1_freq,
            rx2_dr: None,
            rx2_freq: None,
            gpstime: None,
            priority: None,
            rctx: None,
            preamble: None,
            addcrc: None,
            muxtime: f.muxtime,
        };
        self.handle_dnmsg(dnmsg, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ral::MockRal;
    use crate::rx_forwarder::FrameKind;
    use crate::transport::TestSendBuf;

    struct AlwaysUpdf;
    impl HeaderParser for AlwaysUpdf {
        fn parse(&self, _payload: &[u8]) -> Option<(FrameKind, &'static str)> {
            Some((FrameKind::Data { netid: 1 }, "updf"))
        }
    }

    #[tokio::test]
    async fn router_config_reconfigures_duty_cycle_region() {
        let ral = MockRal::new(1);
        let mut engine = Engine::new(ral, AlwaysUpdf, TestSendBuf::new(8), 1);
        let json = r#"{"msgtype":"router_config","region":"US915","hwspec":"sx1301/1"}"#;
        engine.handle_downstream(json).await.unwrap();
        assert_eq!(engine.scheduler.dc[0].region(), Region::Us915);
    }

    #[tokio::test]
    async fn dnmsg_before_router_config_is_dropped() {
        let ral = MockRal::new(1);
        let mut engine = Engine::new(ral, AlwaysUpdf, TestSendBuf::new(8), 1);
        let free_before = engine.scheduler.pool().free_count();
        let json = r#"{"msgtype":"dnmsg","DevEui":1,"dC":0,"diid":1,"pdu":"00","RxDelay":1,"RX1DR":0,"RX1Freq":868100000}"#;
        engine.handle_downstream(json).await.unwrap();
        assert_eq!(engine.scheduler.pool().free_count(), free_before);
    }

    #[tokio::test]
    async fn unknown_msgtype_reports_json_error() {
        let ral = MockRal::new(1);
        let mut engine = Engine::new(ral, AlwaysUpdf, TestSendBuf::new(8), 1);
        engine.handle_downstream(r#"{"msgtype":"totally_unknown"}"#).await.unwrap();
        assert_eq!(engine.send.sent.len(), 1);
        let text = String::from_utf8(engine.send.sent[0].clone()).unwrap();
        assert!(text.contains("\"msgtype\":\"error\""));
    }
}

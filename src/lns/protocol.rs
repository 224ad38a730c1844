//! Wire types for the LNS JSON protocol (§4.8, §6.1). One line of text per
//! message; `msgtype` selects the variant on the way in, and tags the
//! struct on the way out via `#[serde(tag = "msgtype")]`.

use serde::{Deserialize, Serialize};

fn hex_decode<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let s: String = Deserialize::deserialize(d)?;
    hex::decode(s).map_err(serde::de::Error::custom)
}

fn hex_encode<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

/// One alternate RX window: data rate and frequency.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RxWindow {
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "msgtype")]
#[serde(rename_all = "snake_case")]
pub enum DownstreamMessage {
    RouterConfig(RouterConfig),
    Dnmsg(Dnmsg),
    Dnsched(Dnsched),
    Dnframe(Dnframe),
    Timesync(TimesyncMsg),
    Getxtime(GetxtimeRequest),
    Runcmd(RuncmdMsg),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    pub region: String,
    #[serde(rename = "hwspec")]
    pub hwspec: String,
    #[serde(default)]
    pub jo_in_eui_range: Option<Vec<(u64, u64)>>,
    #[serde(rename = "NetID", default)]
    pub netids: Option<Vec<u8>>,
    #[serde(rename = "MuxTime", default)]
    pub muxtime: Option<f64>,
    /// `(freq_hz, bw_hz, min_sf, max_sf)` per upchannel, passed through to
    /// the RAL and used to seed each unit's channel plan.
    #[serde(rename = "upchannels", default)]
    pub upchannels: Option<Vec<(u32, u32, u8, u8)>>,
    /// `(sf, bw_index, dn_only)` indexed positionally by DR.
    #[serde(rename = "DRs", default)]
    pub drs: Option<Vec<(u8, u8, bool)>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dnmsg {
    #[serde(rename = "DevEui")]
    pub deveui: u64,
    #[serde(rename = "dC")]
    pub device_class: u8,
    pub diid: u64,
    #[serde(deserialize_with = "hex_decode")]
    pub pdu: Vec<u8>,
    #[serde(rename = "RxDelay", default)]
    pub rx_delay: Option<u32>,
    #[serde(rename = "RX1DR", default)]
    pub rx1_dr: Option<u8>,
    #[serde(rename = "RX1Freq", default)]
    pub rx1_freq: Option<u32>,
    #[serde(rename = "RX2DR", default)]
    pub rx2_dr: Option<u8>,
    #[serde(rename = "RX2Freq", default)]
    pub rx2_freq: Option<u32>,
    #[serde(default)]
    pub gpstime: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub rctx: Option<u64>,
    #[serde(default)]
    pub preamble: Option<u16>,
    #[serde(default)]
    pub addcrc: Option<bool>,
    #[serde(rename = "MuxTime", default)]
    pub muxtime: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnschedEntry {
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    #[serde(deserialize_with = "hex_decode")]
    pub pdu: Vec<u8>,
    #[serde(default)]
    pub ontime: Option<u64>,
    #[serde(default)]
    pub gpstime: Option<u64>,
    #[serde(default)]
    pub xtime: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dnsched {
    pub dnsched: Vec<DnschedEntry>,
    #[serde(rename = "MuxTime", default)]
    pub muxtime: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dnframe {
    #[serde(rename = "DevEui")]
    pub deveui: u64,
    pub diid: u64,
    #[serde(deserialize_with = "hex_decode")]
    pub pdu: Vec<u8>,
    #[serde(rename = "RX1DR", default)]
    pub rx1_dr: Option<u8>,
    #[serde(rename = "RX1Freq", default)]
    pub rx1_freq: Option<u32>,
    #[serde(rename = "MuxTime", default)]
    pub muxtime: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimesyncMsg {
    #[serde(default)]
    pub xtime: Option<u64>,
    #[serde(default)]
    pub txtime: Option<f64>,
    #[serde(default)]
    pub gpstime: Option<u64>,
    #[serde(rename = "MuxTime", default)]
    pub muxtime: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetxtimeRequest {
    #[serde(rename = "MuxTime", default)]
    pub muxtime: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuncmdMsg {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "msgtype")]
#[serde(rename_all = "snake_case")]
pub enum UpstreamMessage {
    Dntxed(DntxedMsg),
    Getxtime(GetxtimeReply),
    Error { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DntxedMsg {
    pub diid: u64,
    pub seqno: u64,
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq: u32,
    #[serde(rename = "DevEui")]
    pub deveui: u64,
    pub rctx: u64,
    pub xtime: u64,
    /// UTC seconds (the engine's host clock is Unix-epoch µs, so this is
    /// that value divided down, not a raw host-µs passthrough).
    pub txtime: u64,
    pub gpstime: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetxtimeReply {
    #[serde(rename = "MuxTime")]
    pub muxtime: f64,
    pub ustime: u64,
    #[serde(rename = "UTCtime")]
    pub utctime: u64,
    pub xtimes: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnmsg_decodes_hex_pdu() {
        let json = r#"{"msgtype":"dnmsg","DevEui":1,"dC":0,"diid":9,"pdu":"deadbeef","RX1DR":5,"RX1Freq":868100000}"#;
        let msg: DownstreamMessage = serde_json::from_str(json).unwrap();
        match msg {
            DownstreamMessage::Dnmsg(m) => {
                assert_eq!(m.pdu, vec![0xde, 0xad, 0xbe, 0xef]);
                assert_eq!(m.rx1_freq, Some(868_100_000));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_msgtype_falls_back() {
        let json = r#"{"msgtype":"something_future"}"#;
        let msg: DownstreamMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, DownstreamMessage::Unknown));
    }

    #[test]
    fn dntxed_serializes_with_tag() {
        let msg = UpstreamMessage::Dntxed(DntxedMsg {
            diid: 1,
            seqno: 1,
            dr: 5,
            freq: 868_100_000,
            deveui: 42,
            rctx: 0,
            xtime: 0,
            txtime: 0,
            gpstime: None,
        });
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"msgtype\":\"dntxed\""));
    }
}

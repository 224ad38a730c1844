//! Station-to-Engine (S2E) protocol core: the portable packet-forwarding
//! logic a LoRaWAN basestation runs between its radio hardware and an LNS
//! (LoRaWAN Network Server) WebSocket, independent of any particular radio
//! chip driver or transport.

pub mod airtime;
pub mod beacon;
pub mod channel_plan;
pub mod config;
pub mod constants;
pub mod dc;
pub mod engine;
pub mod error;
pub mod filters;
pub mod lns;
pub mod logging;
pub mod ral;
pub mod runcmd;
pub mod rx_forwarder;
pub mod scheduler;
pub mod timesync;
pub mod transport;
pub mod xq;

pub use engine::Engine;
pub use error::EngineError;

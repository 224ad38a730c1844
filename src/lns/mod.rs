//! LNS JSON protocol: wire types plus the per-`msgtype` handlers.

pub mod dispatch;
pub mod protocol;

pub use protocol::{DownstreamMessage, UpstreamMessage};

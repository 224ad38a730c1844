//! # S2E Engine Error Handling
//!
//! This module defines the `EngineError` enum, one variant per failure
//! taxonomy row the core distinguishes: protocol errors, regulatory
//! rejections, transient radio errors, time-sync failures, resource
//! exhaustion, and fatal conditions. Only the last of these is ever allowed
//! to unwind out of the event loop; everything else is logged and absorbed
//! at the point it occurs.

use thiserror::Error;

/// Errors surfaced by the S2E core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A message from the LNS was malformed, missing a mandatory field, or
    /// otherwise violated the protocol. The offending message is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A JSON payload failed to decode.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// A downlink could not be scheduled within the regulatory envelope
    /// (duty cycle exhausted, LBT busy, no viable RX1/RX2) after exhausting
    /// alternates.
    #[error("regulatory rejection: {0}")]
    Regulatory(String),

    /// The radio reported a transmission failure, or its status disagreed
    /// with what the scheduler expected.
    #[error("radio error: {0}")]
    Radio(String),

    /// A time conversion could not be performed (no sync yet, stale PPS,
    /// wraparound inconsistency).
    #[error("timesync failure: {0}")]
    Timesync(String),

    /// A pool (TX job pool, RX job FIFO, TX data arena) was exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An unrecoverable condition: broken invariant, allocation failure, or
    /// equivalent. The process should terminate.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Error from the radio-abstraction-layer boundary.
    #[error("RAL error: {0}")]
    Ral(String),

    /// Station configuration could not be loaded or was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error, e.g. reading station.conf or spawning a runcmd child.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for the taxonomy rows that are logged-and-absorbed rather than
    /// propagated out of the event loop.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Fatal(_))
    }
}

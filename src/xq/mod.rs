//! # XQ — Extended Queues
//!
//! Pooled allocation and compaction of TX jobs (priority list) and RX jobs
//! (FIFO), each with an out-of-band payload arena. The pool uses typed
//! slot indices rather than pointer arithmetic: `NIL` (`Option::None`)
//! stands in for the C source's null sentinel, and every list — the shared
//! free list, each TX unit's queue — is a singly linked chain of indices
//! threaded through the slot array itself.

pub mod rx_fifo;
pub mod tx_pool;

pub use rx_fifo::{RxFifo, RxJob};
pub use tx_pool::{TxFlags, TxIdx, TxJob, TxPool, TxRx2};

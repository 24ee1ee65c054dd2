//! TunForge: a user-space "tun2socks" bridge. Raw IPv4 packets from a TUN
//! device feed an embedded TCP/IP engine; every inbound TCP flow —
//! regardless of destination — is captured at SYN time and surfaced to the
//! upper layer as a bidirectional byte-stream connection suitable for
//! forwarding to a SOCKS-like proxy.
//!
//! The engine is not thread-safe: all engine interaction funnels through the
//! scheduler's packets context, and all upper-layer callbacks are delivered
//! on its connections context. See [`IpStack`] for the entry point and
//! [`TcpConnection`] for the per-flow contract.

#![deny(unsafe_op_in_unsafe_fn)]

mod batcher;
pub mod config;
mod conn;
mod device;
pub mod error;
mod handle;
pub mod logger;
pub mod parse;
mod registry;
pub mod scheduler;
mod stack;
mod stats;

pub use config::{Ipv4Settings, StackConfig};
pub use conn::{
    AcceptDecision, ConnectionInfo, ConnectionState, ReceiveCompletion, TcpConnection,
    TerminationReason, MAX_WRITE_LEN,
};
pub use error::{StackError, WriteResult, WriteStatus};
pub use stack::{IpStack, StackDelegate};
pub use stats::StackStats;

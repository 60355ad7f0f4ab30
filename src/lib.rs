//! Auto-reconnecting stream client built on a serialized connection state machine.
//!
//! The [`machine::ConnectionMachine`] owns the connection lifecycle, the outbound queue
//! and the health monitor; [`client::StreamClient`] drives it through a kameo actor.

pub mod client;
pub mod core;
pub mod machine;
pub mod testing;
pub mod transport;

pub use client::StreamClient;
pub use crate::core::{
    ClientConfig, ConnectionState, ErrorCategory, HealthConfig, OverflowPolicy, Priority,
    RateLimitConfig, RejectReason, SendOutcome, StreamError, StreamResult,
};
pub use machine::{ClientSnapshot, ConnectionMachine, StateChange, StateObserver};
pub use transport::tungstenite::TungsteniteTransport;
pub use transport::{Transport, TransportHandle};

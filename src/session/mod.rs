//! # Session
//!
//! Glue between a message channel and a conversation:
//!
//! - **engine**: the protocol state machine driven by inbound frames
//! - **delivery**: immediate and delayed delivery of bot replies
//! - **sink**: the outbound channel abstraction implemented by the transports

pub mod delivery;
pub mod engine;
pub mod sink;

pub use engine::{ProtocolSession, SessionSettings};
pub use sink::MessageSink;

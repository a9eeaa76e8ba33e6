//! # Bot Protocol
//!
//! Wire types shared by the websocket engine and the REST API.

pub mod activity;
pub mod messages;

pub use activity::{event_name, Activity, ActivityKind};
pub use messages::{parse_inbound, Alternative, InboundFrame, InboundMessage, OutboundEnvelope, OutboundMessage};

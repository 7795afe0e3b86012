//! # Server
//!
//! Announces itself to the agents on the LAN, hands out their configuration and
//! collects their alerts into the event stream.

pub mod engine;
pub mod events;
pub mod hosts;

pub use engine::ServerEngine;

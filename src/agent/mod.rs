//! # Agent
//!
//! Watches the local host and reports alerts to the selected server.
//!
//! ```text
//!   SRVHB / CONFIG / RESET / ACK           CONFREQ / ALERT
//!  ─────────────────────────────▶ engine ─────────────────────▶ server (port + 1)
//!                                   │
//!                 ┌─────────────────┼──────────────────┐
//!                 ▼                 ▼                  ▼
//!           file_consumer        process            command
//!                 │                 │                  │
//!                 └───────────▶   queue   ◀────────────┘
//! ```
//!
//! [`directives`] turns the configuration text into rule instances; the engine owns
//! them together with the [`queue`] and rebuilds them on every `CONFIG`.

pub mod command;
pub mod directives;
pub mod engine;
pub mod file_consumer;
pub mod process;
pub mod queue;

pub use engine::{AgentEngine, AgentSettings, AgentState};

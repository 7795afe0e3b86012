//! Host monitoring over UDP.
//!
//! A [`server`] broadcasts its presence, hands out per-host configuration and collects
//! alerts. Each [`agent`] picks the first server it hears, asks for its configuration and
//! reports what its log files, process table and probe commands show.

pub mod agent;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod util;
pub mod window;

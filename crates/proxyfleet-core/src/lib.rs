// proxyfleet-core: Pure types, port allocation, config, node state machine
// No process or network access; everything else builds on it.

pub mod config;
pub mod error;
pub mod instance;
pub mod naming;
pub mod ports;
pub mod retry;
pub mod time;

// proxyfleet-cli: Clap commands, logging, UI
// Depends on proxyfleet-core, proxyfleet-runtime

pub mod commands;
pub mod display;
pub mod logging;
pub mod output;
pub mod ui;

pub use commands::run;

//! # proxyfleet
//!
//! Facade crate that re-exports the proxyfleet workspace crates so
//! consumers can depend on a single `proxyfleet` library.
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | proxyfleet-core | Instance types, state machine, port pool, config |
//! | [`runtime`] | proxyfleet-runtime | Provider client, tunnels, HAProxy, reconcile loop |
//! | [`cli`] | proxyfleet-cli | Command tree, logging, output |

pub use proxyfleet_cli as cli;
pub use proxyfleet_core as core;
pub use proxyfleet_runtime as runtime;

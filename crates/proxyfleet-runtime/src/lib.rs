// proxyfleet-runtime: Provider client, process supervision, HAProxy control, reconcile loop
// Depends on proxyfleet-core

pub mod balancer;
pub mod node;
pub mod process;
pub mod process_mock;
pub mod provider;
pub mod provider_mock;
pub mod reconcile;
pub mod registry;
pub mod shell;
pub mod shutdown;
pub mod tunnel;

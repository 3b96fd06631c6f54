//! The reconciliation loop.
//!
//! One [`Reconciler`] owns the registry, the port pool and the load
//! balancer. Each tick runs to completion on the calling thread:
//!
//! 1. refresh every tracked node from the provider
//! 2. promote pending nodes that are running (reload per promotion)
//! 3. demote running nodes that are not (one batched reload)
//! 4. repair dead tunnels on the same ports
//! 5. halt on drift
//! 6. rotate the oldest node past its TTL while above target
//! 7. create at most one instance while below the scale ceiling

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::balancer::{BalancerSettings, LoadBalancer};
use crate::node::Node;
use crate::process::ProcessLauncher;
use crate::provider::{CloudProvider, LaunchSpec};
use crate::registry::FleetRegistry;
use crate::shutdown::ShutdownSignal;
use crate::tunnel::SshSettings;
use proxyfleet_core::config::FleetConfig;
use proxyfleet_core::error::FleetError;
use proxyfleet_core::instance::{InstanceRecord, InstanceState, Transition, next_transition};
use proxyfleet_core::ports::PortAllocator;
use proxyfleet_core::retry::retry;
use proxyfleet_core::time::age_secs;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub promoted: Vec<String>,
    /// Pending nodes that died before running.
    pub discarded: Vec<String>,
    pub demoted: Vec<String>,
    /// Running nodes whose tunnel set was recreated.
    pub repaired: Vec<String>,
    pub rotated: Option<String>,
    pub created: Option<String>,
    pub creation_error: Option<String>,
    /// Load-balancer reloads issued during the tick.
    pub reloads: u32,
}

impl TickReport {
    pub fn running_set_changed(&self) -> bool {
        !self.promoted.is_empty() || !self.demoted.is_empty() || self.rotated.is_some()
    }

    fn log(&self) {
        if *self == Self::default() {
            return;
        }
        info!(
            promoted = self.promoted.len(),
            discarded = self.discarded.len(),
            demoted = self.demoted.len(),
            repaired = self.repaired.len(),
            rotated = self.rotated.as_deref().unwrap_or("-"),
            created = self.created.as_deref().unwrap_or("-"),
            reloads = self.reloads,
            "Tick complete"
        );
    }
}

pub struct Reconciler {
    config: FleetConfig,
    provider: Box<dyn CloudProvider>,
    launcher: Arc<dyn ProcessLauncher>,
    ssh: SshSettings,
    launch_spec: LaunchSpec,
    registry: FleetRegistry,
    ports: PortAllocator,
    balancer: LoadBalancer,
    torn_down: bool,
}

impl Reconciler {
    pub fn new(
        config: FleetConfig,
        provider: Box<dyn CloudProvider>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let ssh = SshSettings {
            program: config.ssh_program.clone(),
            key_file: config.key_file.clone(),
        };
        let launch_spec = LaunchSpec::from_config(&config);
        let ports = PortAllocator::new(config.port_range());
        let balancer = LoadBalancer::new(BalancerSettings::from_config(&config), launcher.clone());
        Self {
            config,
            provider,
            launcher,
            ssh,
            launch_spec,
            registry: FleetRegistry::new(),
            ports,
            balancer,
            torn_down: false,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Start HAProxy on an empty config, adopt every active instance the
    /// provider reports, then render and reload for the adopted set.
    #[instrument(skip_all, fields(target_instances = self.config.target_instances))]
    pub fn startup(&mut self) -> Result<()> {
        self.balancer.render(std::iter::empty::<&Node>())?;
        self.balancer.start()?;

        for record in self.provider.describe_instances(None)? {
            if !record.state.is_active() {
                continue;
            }
            if self.registry.contains(&record.instance_id) {
                warn!(instance_id = %record.instance_id, "Instance reported twice, ignoring");
                continue;
            }
            self.adopt(record)?;
        }

        info!(
            pending = self.registry.pending_len(),
            running = self.registry.running_len(),
            "Adopted existing instances"
        );
        self.regenerate()
    }

    fn adopt(&mut self, record: InstanceRecord) -> Result<()> {
        let block = self.ports.allocate(self.config.tunnels_per_instance)?;
        let state = record.state;
        let mut node = Node::new(record, block);
        if state == InstanceState::Running {
            if let Err(e) = node.start_tunnels(self.launcher.as_ref(), &self.ssh) {
                self.ports.release(node.decommission());
                return Err(e);
            }
            info!(instance_id = %node.id(), ports = ?node.ports(), "Adopted running instance");
            self.registry.insert_running(node)?;
        } else {
            info!(instance_id = %node.id(), "Adopted pending instance");
            self.registry.insert_pending(node)?;
        }
        Ok(())
    }

    pub fn tick(&mut self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    /// One full reconciliation pass with `now` as the clock for TTL checks.
    #[instrument(
        skip_all,
        fields(pending = self.registry.pending_len(), running = self.registry.running_len())
    )]
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let transitions = self.refresh()?;

        for (id, transition) in &transitions {
            match transition {
                Transition::Promote => self.promote(id, &mut report)?,
                Transition::Discard => self.discard(id, &mut report)?,
                Transition::Stay | Transition::Demote => {}
            }
        }

        for (id, transition) in &transitions {
            if *transition == Transition::Demote {
                self.demote(id, &mut report)?;
            }
        }
        if !report.demoted.is_empty() {
            self.regenerate()?;
            report.reloads += 1;
        }

        self.repair_tunnels(&mut report)?;
        self.check_drift()?;
        self.rotate(now, &mut report)?;

        if self.registry.tracked_len() < self.config.scale_ceiling() {
            match self.provision() {
                Ok(id) => report.created = Some(id),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Instance creation failed, retrying next tick");
                    report.creation_error = Some(format!("{:#}", e));
                }
            }
        }

        report.log();
        Ok(report)
    }

    /// Replace every tracked node's snapshot with one batched describe.
    fn refresh(&mut self) -> Result<Vec<(String, Transition)>> {
        let ids = self.registry.tracked_ids();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<String, InstanceRecord> = self
            .provider
            .describe_instances(Some(&ids))?
            .into_iter()
            .map(|r| (r.instance_id.clone(), r))
            .collect();

        let mut transitions = Vec::with_capacity(ids.len());
        for id in ids {
            let record = by_id
                .remove(&id)
                .ok_or_else(|| FleetError::InstanceVanished(id.clone()))?;
            let Some(phase) = self.registry.phase_of(&id) else {
                continue;
            };
            let transition = next_transition(phase, record.state);
            if let Some(node) = self.registry.get_mut(&id) {
                node.refresh(record);
            }
            transitions.push((id, transition));
        }
        Ok(transitions)
    }

    fn promote(&mut self, id: &str, report: &mut TickReport) -> Result<()> {
        let Some(node) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if let Err(e) = node.start_tunnels(self.launcher.as_ref(), &self.ssh) {
            warn!(instance_id = %id, error = %format!("{:#}", e), "Failed to start tunnels, staying pending");
            return Ok(());
        }
        self.registry.promote(id);
        info!(instance_id = %id, "Instance promoted from pending to running");
        self.regenerate()?;
        report.promoted.push(id.to_string());
        report.reloads += 1;
        Ok(())
    }

    fn discard(&mut self, id: &str, report: &mut TickReport) -> Result<()> {
        let Some(node) = self.registry.take(id) else {
            return Ok(());
        };
        warn!(instance_id = %id, state = %node.record().state, "Pending instance died before running");
        self.dispose(node)?;
        report.discarded.push(id.to_string());
        Ok(())
    }

    fn demote(&mut self, id: &str, report: &mut TickReport) -> Result<()> {
        let Some(node) = self.registry.take(id) else {
            return Ok(());
        };
        warn!(instance_id = %id, state = %node.record().state, "Running instance left the running state");
        self.dispose(node)?;
        report.demoted.push(id.to_string());
        Ok(())
    }

    /// Stop tunnels, return ports, and request termination.
    fn dispose(&mut self, node: Node) -> Result<()> {
        let id = node.id().to_string();
        self.ports.release(node.decommission());
        self.provider.terminate_instances(std::slice::from_ref(&id))?;
        info!(instance_id = %id, "Instance termination requested");
        Ok(())
    }

    fn repair_tunnels(&mut self, report: &mut TickReport) -> Result<()> {
        for node in self.registry.running_mut() {
            let health = node.check_tunnels()?;
            let incomplete = node.tunnels().len() != node.ports().len();
            if !health.any_exited() && !incomplete {
                continue;
            }
            warn!(
                instance_id = %node.id(),
                exited = ?health.exited,
                "Recreating tunnel set"
            );
            match node.restart_tunnels(self.launcher.as_ref(), &self.ssh) {
                Ok(()) => report.repaired.push(node.id().to_string()),
                Err(e) => {
                    warn!(instance_id = %node.id(), error = %format!("{:#}", e), "Tunnel restart failed");
                }
            }
        }
        Ok(())
    }

    fn check_drift(&self) -> Result<()> {
        let reported = self
            .provider
            .describe_instances(None)?
            .iter()
            .filter(|r| r.state.is_active())
            .count();
        let tracked = self.registry.tracked_len();
        if reported > tracked {
            error!(reported, tracked, "Provider reports instances this controller does not track");
            return Err(FleetError::Drift { reported, tracked }.into());
        }
        Ok(())
    }

    fn rotate(&mut self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        if self.registry.running_len() <= self.config.target_instances {
            return Ok(());
        }
        let Some((id, launched)) = self.registry.oldest_running() else {
            return Ok(());
        };
        let age = age_secs(launched, now);
        if age <= self.config.ttl_secs {
            return Ok(());
        }
        let Some(node) = self.registry.take(&id) else {
            return Ok(());
        };
        info!(instance_id = %id, age_secs = age, ttl_secs = self.config.ttl_secs, "Rotating oldest instance");
        self.dispose(node)?;
        self.regenerate()?;
        report.rotated = Some(id);
        report.reloads += 1;
        Ok(())
    }

    /// Allocate ports, create one instance, and track it as pending once the
    /// provider can describe it.
    fn provision(&mut self) -> Result<String> {
        let block = self.ports.allocate(self.config.tunnels_per_instance)?;

        let id = match self.provider.create_instance(&self.launch_spec) {
            Ok(id) => id,
            Err(e) => {
                self.ports.release(block);
                return Err(e);
            }
        };
        info!(instance_id = %id, "Instance created");

        if self.registry.contains(&id) {
            self.ports.release(block);
            return Err(FleetError::DuplicateNode(id).into());
        }

        let ids = [id.clone()];
        let described = retry(
            self.config.provision_attempts,
            self.config.provision_delay(),
            "describe new instance",
            || {
                self.provider
                    .describe_instances(Some(&ids))?
                    .into_iter()
                    .find(|r| r.instance_id == id)
                    .ok_or_else(|| anyhow!("instance {} is not visible yet", id))
            },
        );

        match described {
            Ok(record) => {
                self.registry.insert_pending(Node::new(record, block))?;
                Ok(id)
            }
            Err(e) => {
                self.ports.release(block);
                if let Err(te) = self.provider.terminate_instances(&ids) {
                    warn!(instance_id = %id, error = %te, "Failed to terminate unreachable instance");
                }
                Err(e)
            }
        }
    }

    fn regenerate(&mut self) -> Result<()> {
        self.balancer.regenerate(self.registry.running())
    }

    /// Stop every running node's tunnels and HAProxy. Safe to call twice.
    ///
    /// Instances are left alive; the next startup adopts them.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!(running = self.registry.running_len(), "Tearing down tunnels and HAProxy");
        for node in self.registry.running_mut() {
            node.stop_tunnels();
        }
        self.balancer.stop();
    }

    /// Startup followed by ticks until shutdown, drift, or an unhandled error.
    /// Teardown runs on every exit path.
    pub fn run(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        let mut fleet = TeardownGuard(self);
        fleet.startup()?;

        let interval = fleet.config.loop_interval();
        while !shutdown.is_requested() {
            fleet.tick()?;
            if shutdown.wait(interval) {
                break;
            }
        }
        info!("Shutdown requested, leaving control loop");
        Ok(())
    }
}

struct TeardownGuard<'a>(&'a mut Reconciler);

impl Deref for TeardownGuard<'_> {
    type Target = Reconciler;

    fn deref(&self) -> &Reconciler {
        &*self.0
    }
}

impl DerefMut for TeardownGuard<'_> {
    fn deref_mut(&mut self) -> &mut Reconciler {
        &mut *self.0
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_mock::FakeLauncher;
    use crate::provider_mock::FakeCloud;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        _dir: tempfile::TempDir,
        cloud: FakeCloud,
        launcher: FakeLauncher,
        reconciler: Reconciler,
    }

    fn fixture(target: usize, tunnels: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("haproxy.cfg.tera"),
            "{% for i in instances %}{{ i.instance_id }}\n{% endfor %}",
        )
        .unwrap();
        let key = dir.path().join("key.pem");
        std::fs::write(&key, "key").unwrap();

        let mut config = FleetConfig::new(
            dir.path(),
            "haproxy.cfg.tera",
            &key,
            "kp",
            "t2.micro",
            "ami-1",
            "sg-1",
            target,
            900,
            tunnels,
        );
        config.haproxy_config = dir.path().join("haproxy.cfg");
        config.port_range_start = 8080;
        config.port_range_end = 8090;
        config.provision_attempts = 2;
        config.provision_delay_ms = 1;

        let cloud = FakeCloud::new();
        let launcher = FakeLauncher::new();
        let reconciler = Reconciler::new(
            config,
            Box::new(cloud.clone()),
            Arc::new(launcher.clone()),
        );
        Fixture {
            _dir: dir,
            cloud,
            launcher,
            reconciler,
        }
    }

    #[test]
    fn test_startup_adopts_existing_instances() {
        let mut f = fixture(2, 2);
        let launched = Utc::now() - ChronoDuration::seconds(60);
        f.cloud.add_instance("i-run", InstanceState::Running, launched, "ami-1");
        f.cloud.add_instance("i-pend", InstanceState::Pending, launched, "ami-1");
        f.cloud.add_instance("i-dead", InstanceState::Terminated, launched, "ami-1");

        f.reconciler.startup().unwrap();

        let reg = f.reconciler.registry();
        assert_eq!(reg.running_ids(), vec!["i-run"]);
        assert_eq!(reg.pending_ids(), vec!["i-pend"]);
        assert_eq!(f.reconciler.ports().available(), 6);
        assert_eq!(f.launcher.live("ssh").len(), 2);
        // Initial start plus the post-scan reload.
        assert_eq!(f.launcher.launched("haproxy").len(), 2);
        let rendered = std::fs::read_to_string(&f.reconciler.config().haproxy_config).unwrap();
        assert_eq!(rendered, "i-run\n");
    }

    #[test]
    fn test_pending_node_that_dies_is_discarded() {
        let mut f = fixture(1, 1);
        f.reconciler.startup().unwrap();
        let created = f.reconciler.tick().unwrap().created.unwrap();

        f.cloud.set_state(&created, InstanceState::Terminated);
        let report = f.reconciler.tick().unwrap();

        assert_eq!(report.discarded, vec![created.clone()]);
        assert_eq!(report.reloads, 0);
        assert!(f.cloud.terminated().contains(&created));
        // A replacement is requested in the same tick.
        assert!(report.created.is_some());
        assert_eq!(f.reconciler.registry().tracked_len(), 1);
        assert_eq!(f.reconciler.ports().available(), 9);
    }

    #[test]
    fn test_unqueryable_new_instance_is_terminated() {
        let mut f = fixture(1, 2);
        f.reconciler.startup().unwrap();
        f.cloud.hide_new_instances(true);

        let report = f.reconciler.tick().unwrap();

        assert!(report.created.is_none());
        assert!(report.creation_error.unwrap().contains("describe new instance"));
        assert_eq!(f.cloud.terminated(), f.cloud.created());
        assert_eq!(f.reconciler.ports().available(), 10);
        assert_eq!(f.reconciler.registry().tracked_len(), 0);
    }

    #[test]
    fn test_exhausted_pool_creates_nothing() {
        let mut f = fixture(1, 1);
        f.reconciler.ports = PortAllocator::new(8080..8080);
        f.reconciler.startup().unwrap();

        let report = f.reconciler.tick().unwrap();

        assert!(report.creation_error.unwrap().contains("port pool exhausted"));
        assert_eq!(f.cloud.create_attempts(), 0);
    }

    #[test]
    fn test_vanished_instance_is_an_error() {
        let mut f = fixture(1, 1);
        f.cloud.add_instance("i-1", InstanceState::Running, Utc::now(), "ami-1");
        f.reconciler.startup().unwrap();

        // A provider that no longer knows the tracked instance.
        f.reconciler.provider = Box::new(FakeCloud::new());

        let err = f.reconciler.tick().unwrap_err();
        assert_eq!(
            err.downcast_ref::<FleetError>(),
            Some(&FleetError::InstanceVanished("i-1".to_string()))
        );
    }

    #[test]
    fn test_describe_failure_propagates() {
        let mut f = fixture(1, 1);
        f.cloud.add_instance("i-1", InstanceState::Running, Utc::now(), "ami-1");
        f.reconciler.startup().unwrap();
        f.cloud.fail_describe(true);
        assert!(f.reconciler.tick().is_err());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut f = fixture(1, 2);
        f.cloud.add_instance("i-1", InstanceState::Running, Utc::now(), "ami-1");
        f.reconciler.startup().unwrap();

        f.reconciler.teardown();
        f.reconciler.teardown();

        assert!(f.launcher.live("ssh").is_empty());
        assert!(f.launcher.live("haproxy").is_empty());
        // Instances are not terminated on shutdown.
        assert!(f.cloud.terminated().is_empty());
    }

    #[test]
    fn test_guard_tears_down_on_drift() {
        let mut f = fixture(1, 1);
        f.cloud.add_instance("i-1", InstanceState::Running, Utc::now(), "ami-1");

        let err = {
            let mut fleet = TeardownGuard(&mut f.reconciler);
            fleet.startup().unwrap();
            f.cloud.add_instance("i-rogue", InstanceState::Pending, Utc::now(), "ami-1");
            fleet.tick().unwrap_err()
        };

        assert!(proxyfleet_core::error::is_drift(&err));
        assert!(f.launcher.live("ssh").is_empty());
        assert!(f.launcher.live("haproxy").is_empty());
        assert_eq!(f.cloud.create_attempts(), 0);
    }

    #[test]
    fn test_run_returns_after_shutdown_and_tears_down() {
        let mut f = fixture(1, 1);
        f.cloud.add_instance("i-1", InstanceState::Running, Utc::now(), "ami-1");
        let (signal, trigger) = ShutdownSignal::new();
        trigger.fire();

        f.reconciler.run(&signal).unwrap();

        assert_eq!(f.launcher.launched("ssh").len(), 1);
        assert!(f.launcher.live("ssh").is_empty());
        assert!(f.launcher.live("haproxy").is_empty());
        assert_eq!(f.cloud.create_attempts(), 0);
    }
}

use anyhow::Result;

use crate::process::ProcessLauncher;
use crate::tunnel::{SshSettings, TunnelHealth, TunnelSet};
use proxyfleet_core::instance::InstanceRecord;
use proxyfleet_core::naming::login_user_for_image;
use proxyfleet_core::ports::PortBlock;

/// One remote instance, its allocated local ports and its tunnels.
pub struct Node {
    record: InstanceRecord,
    login_user: String,
    ports: PortBlock,
    tunnels: TunnelSet,
}

impl Node {
    pub fn new(record: InstanceRecord, ports: PortBlock) -> Self {
        let login_user = login_user_for_image(&record.image_id).to_string();
        Self {
            record,
            login_user,
            ports,
            tunnels: TunnelSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.instance_id
    }

    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    pub fn login_user(&self) -> &str {
        &self.login_user
    }

    pub fn ports(&self) -> &[u16] {
        self.ports.ports()
    }

    pub fn tunnels(&self) -> &TunnelSet {
        &self.tunnels
    }

    /// Replace the provider snapshot with a fresh one for the same instance.
    pub fn refresh(&mut self, record: InstanceRecord) {
        debug_assert_eq!(record.instance_id, self.record.instance_id);
        self.record = record;
    }

    pub fn start_tunnels(&mut self, launcher: &dyn ProcessLauncher, ssh: &SshSettings) -> Result<()> {
        self.tunnels.start(
            launcher,
            ssh,
            &self.record.instance_id,
            &self.login_user,
            &self.record.public_address,
            self.ports.ports(),
        )
    }

    pub fn stop_tunnels(&mut self) -> Vec<u16> {
        self.tunnels.stop()
    }

    pub fn check_tunnels(&mut self) -> Result<TunnelHealth> {
        self.tunnels.health_check()
    }

    /// Replace the whole tunnel set on the same ports.
    pub fn restart_tunnels(
        &mut self,
        launcher: &dyn ProcessLauncher,
        ssh: &SshSettings,
    ) -> Result<()> {
        self.stop_tunnels();
        self.start_tunnels(launcher, ssh)
    }

    /// Stop the tunnels and give up the node's ports.
    pub fn decommission(mut self) -> PortBlock {
        self.tunnels.stop();
        self.ports
    }
}

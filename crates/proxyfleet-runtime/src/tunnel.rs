//! Per-node SSH dynamic-forward tunnels.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::process::{ProcessLauncher, Supervised, terminate_all};
use proxyfleet_core::error::FleetError;
use proxyfleet_core::naming::socks_bind;

/// ssh refuses private keys readable by anyone but the owner.
const KEY_FILE_MODE: u32 = 0o400;

/// How tunnels are launched; shared by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub program: String,
    pub key_file: PathBuf,
}

/// Arguments for one non-interactive SOCKS tunnel on `127.0.0.1:port`.
pub fn ssh_args(key_file: &Path, login_user: &str, host: &str, port: u16) -> Vec<String> {
    vec![
        "-N".to_string(),
        "-q".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-i".to_string(),
        key_file.display().to_string(),
        "-D".to_string(),
        socks_bind(port),
        "-l".to_string(),
        login_user.to_string(),
        host.to_string(),
    ]
}

/// Tighten the key file's mode before handing it to ssh.
pub fn restrict_key_permissions(key_file: &Path) -> Result<()> {
    std::fs::set_permissions(key_file, std::fs::Permissions::from_mode(KEY_FILE_MODE))
        .with_context(|| format!("Failed to chmod key file {}", key_file.display()))
}

struct Tunnel {
    port: u16,
    process: Box<dyn Supervised>,
}

/// Result of one liveness sweep over a tunnel set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelHealth {
    pub live: Vec<u16>,
    pub exited: Vec<u16>,
}

impl TunnelHealth {
    pub fn any_exited(&self) -> bool {
        !self.exited.is_empty()
    }
}

/// The tunnel processes of one node: either none, or one per assigned port.
#[derive(Default)]
pub struct TunnelSet {
    tunnels: Vec<Tunnel>,
}

impl TunnelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Ports that currently have a tunnel process, in start order.
    pub fn ports(&self) -> Vec<u16> {
        self.tunnels.iter().map(|t| t.port).collect()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.tunnels.iter().map(|t| t.process.pid()).collect()
    }

    /// Launch one tunnel per port.
    ///
    /// Refuses to run over an existing set. If any launch fails, the tunnels
    /// already started are stopped so the set is left empty.
    pub fn start(
        &mut self,
        launcher: &dyn ProcessLauncher,
        ssh: &SshSettings,
        instance_id: &str,
        login_user: &str,
        host: &str,
        ports: &[u16],
    ) -> Result<()> {
        if !self.tunnels.is_empty() {
            return Err(FleetError::TunnelsAlreadyRunning(instance_id.to_string()).into());
        }

        restrict_key_permissions(&ssh.key_file)?;

        for &port in ports {
            let args = ssh_args(&ssh.key_file, login_user, host, port);
            match launcher.launch(&ssh.program, &args) {
                Ok(process) => {
                    info!(instance_id, port, pid = process.pid(), "Tunnel started");
                    self.tunnels.push(Tunnel { port, process });
                }
                Err(e) => {
                    self.stop();
                    return Err(e.context(format!(
                        "Failed to start tunnel on port {} for {}",
                        port, instance_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Terminate every tunnel and clear the set, returning the ports they held.
    pub fn stop(&mut self) -> Vec<u16> {
        for (pid, e) in terminate_all(self.tunnels.iter_mut().map(|t| &mut t.process)) {
            warn!(pid, error = %format!("{:#}", e), "Failed to stop tunnel");
        }
        self.tunnels.drain(..).map(|t| t.port).collect()
    }

    /// Poll every tunnel for exit without blocking.
    pub fn health_check(&mut self) -> Result<TunnelHealth> {
        let mut health = TunnelHealth::default();
        for tunnel in &mut self.tunnels {
            match tunnel.process.try_exit()? {
                Some(status) => {
                    warn!(port = tunnel.port, pid = tunnel.process.pid(), %status, "Tunnel exited");
                    health.exited.push(tunnel.port);
                }
                None => health.live.push(tunnel.port),
            }
        }
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_mock::FakeLauncher;

    fn settings(dir: &tempfile::TempDir) -> SshSettings {
        let key_file = dir.path().join("fleet.pem");
        std::fs::write(&key_file, "-----BEGIN KEY-----\n").unwrap();
        std::fs::set_permissions(&key_file, std::fs::Permissions::from_mode(0o644)).unwrap();
        SshSettings {
            program: "ssh".to_string(),
            key_file,
        }
    }

    #[test]
    fn test_ssh_args() {
        let args = ssh_args(Path::new("/keys/fleet.pem"), "admin", "ec2-host", 8081);
        let line = args.join(" ");
        assert!(line.starts_with("-N -q"));
        assert!(line.contains("-o BatchMode=yes"));
        assert!(line.contains("-o StrictHostKeyChecking=no"));
        assert!(line.contains("-o UserKnownHostsFile=/dev/null"));
        assert!(line.contains("-i /keys/fleet.pem"));
        assert!(line.contains("-D 127.0.0.1:8081"));
        assert!(line.ends_with("-l admin ec2-host"));
    }

    #[test]
    fn test_start_launches_one_tunnel_per_port() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = settings(&dir);
        let launcher = FakeLauncher::new();
        let mut set = TunnelSet::new();

        set.start(&launcher, &ssh, "i-1", "admin", "host", &[8080, 8081, 8082])
            .unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.ports(), vec![8080, 8081, 8082]);
        let launched = launcher.live("ssh");
        assert_eq!(launched.len(), 3);
        assert!(launched[1].args.contains(&"127.0.0.1:8081".to_string()));
    }

    #[test]
    fn test_start_restricts_key_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = settings(&dir);
        let mut set = TunnelSet::new();
        set.start(&FakeLauncher::new(), &ssh, "i-1", "admin", "host", &[8080])
            .unwrap();
        let mode = std::fs::metadata(&ssh.key_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = settings(&dir);
        let launcher = FakeLauncher::new();
        let mut set = TunnelSet::new();
        set.start(&launcher, &ssh, "i-1", "admin", "host", &[8080])
            .unwrap();

        let err = set
            .start(&launcher, &ssh, "i-1", "admin", "host", &[8080])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleetError>(),
            Some(FleetError::TunnelsAlreadyRunning(_))
        ));
        assert_eq!(launcher.launched("ssh").len(), 1);
    }

    #[test]
    fn test_failed_launch_leaves_set_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = settings(&dir);
        let launcher = FakeLauncher::new();
        launcher.fail_launches_of("ssh");
        let mut set = TunnelSet::new();
        assert!(
            set.start(&launcher, &ssh, "i-1", "admin", "host", &[8080, 8081])
                .is_err()
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_stop_returns_ports_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = settings(&dir);
        let launcher = FakeLauncher::new();
        let mut set = TunnelSet::new();
        set.start(&launcher, &ssh, "i-1", "admin", "host", &[9000, 9001])
            .unwrap();

        assert_eq!(set.stop(), vec![9000, 9001]);
        assert!(set.is_empty());
        assert!(launcher.live("ssh").is_empty());
        assert!(launcher.launched("ssh").iter().all(|p| p.terminated));
    }

    #[test]
    fn test_health_check_reports_exited_tunnels() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = settings(&dir);
        let launcher = FakeLauncher::new();
        let mut set = TunnelSet::new();
        set.start(&launcher, &ssh, "i-1", "admin", "host", &[9000, 9001])
            .unwrap();

        assert!(!set.health_check().unwrap().any_exited());

        launcher.kill(set.pids()[1]);
        let health = set.health_check().unwrap();
        assert_eq!(health.live, vec![9000]);
        assert_eq!(health.exited, vec![9001]);
    }
}

//! Supervision of long-lived child processes (SSH tunnels, HAProxy).
//!
//! The reconciler never waits on a child; it only polls for exit with
//! [`Supervised::try_exit`], which returns immediately.

use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::shell::display_command;

/// How long a terminated child gets to exit before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(2);
const TERM_POLL: Duration = Duration::from_millis(50);

/// A running child process owned by the controller.
pub trait Supervised: Send {
    fn pid(&self) -> u32;

    /// Non-blocking liveness probe: `Some(status)` once the process has exited.
    fn try_exit(&mut self) -> Result<Option<ExitStatus>>;

    /// Send SIGTERM without waiting. Returns `false` if the process had
    /// already exited.
    fn request_stop(&mut self) -> Result<bool>;

    /// Kill the process and reap it.
    fn kill(&mut self) -> Result<()>;
}

/// Stop a group of processes against one shared grace period.
///
/// Every process is signalled before any is waited on, and the whole group
/// shares one deadline. Stragglers are killed.
/// Returns the pids that could not be stopped cleanly, with the cause.
pub fn terminate_all<'a, I>(processes: I) -> Vec<(u32, anyhow::Error)>
where
    I: IntoIterator<Item = &'a mut Box<dyn Supervised>>,
{
    let mut failures = Vec::new();
    let mut waiting = Vec::new();
    for process in processes {
        match process.request_stop() {
            Ok(true) => waiting.push(process),
            Ok(false) => {}
            Err(e) => failures.push((process.pid(), e)),
        }
    }

    let deadline = Instant::now() + TERM_GRACE;
    while !waiting.is_empty() && Instant::now() < deadline {
        waiting.retain_mut(|p| match p.try_exit() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                failures.push((p.pid(), e));
                false
            }
        });
        if !waiting.is_empty() {
            thread::sleep(TERM_POLL);
        }
    }

    for process in waiting {
        let pid = process.pid();
        warn!(pid, "Process ignored SIGTERM, killing");
        if let Err(e) = process.kill() {
            failures.push((pid, e));
        }
    }
    failures
}

/// Starts supervised processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, program: &str, args: &[String]) -> Result<Box<dyn Supervised>>;
}

/// Launches real OS processes with inherited stdio.
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(&self, program: &str, args: &[String]) -> Result<Box<dyn Supervised>> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", display_command(program, args)))?;
        debug!(pid = child.id(), program, "Spawned child process");
        Ok(Box::new(OsProcess { child }))
    }
}

/// A child spawned by [`OsLauncher`].
pub struct OsProcess {
    child: Child,
}

impl Supervised for OsProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .with_context(|| format!("Failed to poll process {}", self.child.id()))
    }

    fn request_stop(&mut self) -> Result<bool> {
        if self.try_exit()?.is_some() {
            return Ok(false);
        }

        let pid = self.child.id();
        // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("Failed to signal process {}", pid));
            }
        }
        Ok(true)
    }

    fn kill(&mut self) -> Result<()> {
        let pid = self.child.id();
        self.child
            .kill()
            .with_context(|| format!("Failed to kill process {}", pid))?;
        self.child
            .wait()
            .with_context(|| format!("Failed to reap process {}", pid))?;
        Ok(())
    }
}

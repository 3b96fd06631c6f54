//! In-memory [`ProcessLauncher`] for tests.
//!
//! Records every launch and lets a test kill a process to simulate a
//! tunnel or proxy dying.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::process::{ProcessLauncher, Supervised};

/// One launched fake process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProcess {
    pub pid: u32,
    pub program: String,
    pub args: Vec<String>,
    /// Died on its own (see [`FakeLauncher::kill`]).
    pub crashed: bool,
    /// Stopped through [`Supervised::terminate`].
    pub terminated: bool,
}

impl FakeProcess {
    pub fn is_live(&self) -> bool {
        !self.crashed && !self.terminated
    }
}

#[derive(Debug, Default)]
struct LauncherState {
    next_pid: u32,
    processes: Vec<FakeProcess>,
    failing_program: Option<String>,
    /// Launches of `failing_program` left to fail; `None` fails forever.
    failures_left: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LauncherState> {
        lock(&self.state)
    }

    /// Launched processes of `program`, in launch order.
    pub fn launched(&self, program: &str) -> Vec<FakeProcess> {
        self.lock()
            .processes
            .iter()
            .filter(|p| p.program == program)
            .cloned()
            .collect()
    }

    /// Live processes of `program`.
    pub fn live(&self, program: &str) -> Vec<FakeProcess> {
        self.launched(program)
            .into_iter()
            .filter(FakeProcess::is_live)
            .collect()
    }

    pub fn find(&self, pid: u32) -> Option<FakeProcess> {
        self.lock().processes.iter().find(|p| p.pid == pid).cloned()
    }

    /// Simulate `pid` exiting unexpectedly.
    pub fn kill(&self, pid: u32) {
        if let Some(p) = self.lock().processes.iter_mut().find(|p| p.pid == pid) {
            p.crashed = true;
        }
    }

    /// Make every future launch of `program` fail.
    pub fn fail_launches_of(&self, program: &str) {
        let mut state = self.lock();
        state.failing_program = Some(program.to_string());
        state.failures_left = None;
    }

    /// Make only the next `count` launches of `program` fail.
    pub fn fail_next_launches_of(&self, program: &str, count: usize) {
        let mut state = self.lock();
        state.failing_program = Some(program.to_string());
        state.failures_left = Some(count);
    }

    /// Let launches succeed again.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.failing_program = None;
        state.failures_left = None;
    }
}

fn lock(state: &Arc<Mutex<LauncherState>>) -> MutexGuard<'_, LauncherState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, program: &str, args: &[String]) -> Result<Box<dyn Supervised>> {
        let mut state = self.lock();
        if state.failing_program.as_deref() == Some(program) {
            let left = state.failures_left;
            match left {
                Some(0) => state.failing_program = None,
                Some(n) => {
                    state.failures_left = Some(n - 1);
                    anyhow::bail!("Failed to spawn: {}: No such file or directory", program);
                }
                None => anyhow::bail!("Failed to spawn: {}: No such file or directory", program),
            }
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.processes.push(FakeProcess {
            pid,
            program: program.to_string(),
            args: args.to_vec(),
            crashed: false,
            terminated: false,
        });
        Ok(Box::new(FakeHandle {
            pid,
            state: self.state.clone(),
        }))
    }
}

struct FakeHandle {
    pid: u32,
    state: Arc<Mutex<LauncherState>>,
}

impl Supervised for FakeHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        let state = lock(&self.state);
        let process = state.processes.iter().find(|p| p.pid == self.pid);
        Ok(match process {
            Some(p) if p.crashed => Some(ExitStatus::from_raw(255 << 8)),
            Some(p) if p.terminated => Some(ExitStatus::from_raw(libc::SIGTERM)),
            _ => None,
        })
    }

    /// Fake processes exit as soon as they are signalled.
    fn request_stop(&mut self) -> Result<bool> {
        let mut state = lock(&self.state);
        match state.processes.iter_mut().find(|p| p.pid == self.pid) {
            Some(p) if p.is_live() => {
                p.terminated = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn kill(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(p) = state.processes.iter_mut().find(|p| p.pid == self.pid) {
            p.terminated = true;
        }
        Ok(())
    }
}

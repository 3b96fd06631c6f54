//! In-memory [`CloudProvider`] for tests.
//!
//! Cloneable handle over shared state, so a test can keep one clone to
//! script the fleet while the reconciler owns another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::provider::{CloudProvider, LaunchSpec};
use proxyfleet_core::error::FleetError;
use proxyfleet_core::instance::{InstanceRecord, InstanceState};

#[derive(Debug, Default)]
struct CloudState {
    instances: BTreeMap<String, InstanceRecord>,
    /// Created but not yet returned by describe.
    invisible: BTreeSet<String>,
    next_id: u32,
    now: Option<DateTime<Utc>>,
    failing_creates: u32,
    hide_new_instances: bool,
    fail_describe: bool,
    /// Identifier handed back by the next create instead of a new instance.
    repeat_id: Option<String>,
    created: Vec<String>,
    terminated: Vec<String>,
    create_attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch time stamped on instances created from now on.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = Some(now);
    }

    /// Seed an instance that exists before the controller starts.
    pub fn add_instance(
        &self,
        instance_id: &str,
        state: InstanceState,
        launch_time: DateTime<Utc>,
        image_id: &str,
    ) {
        self.lock().instances.insert(
            instance_id.to_string(),
            InstanceRecord {
                instance_id: instance_id.to_string(),
                public_address: format!("{}.compute.example", instance_id),
                state,
                launch_time,
                image_id: image_id.to_string(),
            },
        );
    }

    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(record) = self.lock().instances.get_mut(instance_id) {
            record.state = state;
        }
    }

    /// Move every pending instance to running.
    pub fn boot_all(&self) {
        for record in self.lock().instances.values_mut() {
            if record.state == InstanceState::Pending {
                record.state = InstanceState::Running;
            }
        }
    }

    pub fn state_of(&self, instance_id: &str) -> Option<InstanceState> {
        self.lock().instances.get(instance_id).map(|r| r.state)
    }

    /// Make the next `n` creation requests fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.lock().failing_creates = n;
    }

    /// New instances never become describable.
    pub fn hide_new_instances(&self, hide: bool) {
        self.lock().hide_new_instances = hide;
    }

    /// Answer the next creation request with an existing identifier.
    pub fn repeat_id_on_next_create(&self, instance_id: &str) {
        self.lock().repeat_id = Some(instance_id.to_string());
    }

    pub fn fail_describe(&self, fail: bool) {
        self.lock().fail_describe = fail;
    }

    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn create_attempts(&self) -> u32 {
        self.lock().create_attempts
    }

    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    /// Instances in pending or running state.
    pub fn active_count(&self) -> usize {
        self.lock()
            .instances
            .values()
            .filter(|r| r.state.is_active())
            .count()
    }
}

impl CloudProvider for FakeCloud {
    fn describe_instances(&self, ids: Option<&[String]>) -> Result<Vec<InstanceRecord>> {
        let state = self.lock();
        if state.fail_describe {
            anyhow::bail!("describe-instances: service unavailable");
        }
        let visible = |r: &&InstanceRecord| !state.invisible.contains(&r.instance_id);
        Ok(match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| state.instances.get(id))
                .filter(visible)
                .cloned()
                .collect(),
            None => state.instances.values().filter(visible).cloned().collect(),
        })
    }

    fn create_instance(&self, spec: &LaunchSpec) -> Result<String> {
        let mut state = self.lock();
        state.create_attempts += 1;
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            anyhow::bail!("InsufficientInstanceCapacity: {}", spec.instance_type);
        }
        if let Some(instance_id) = state.repeat_id.take() {
            return Ok(instance_id);
        }
        state.next_id += 1;
        let instance_id = format!("i-{:08x}", state.next_id);
        let launch_time = state.now.unwrap_or_else(Utc::now);
        state.instances.insert(
            instance_id.clone(),
            InstanceRecord {
                instance_id: instance_id.clone(),
                public_address: format!("{}.compute.example", instance_id),
                state: InstanceState::Pending,
                launch_time,
                image_id: spec.image_id.clone(),
            },
        );
        if state.hide_new_instances {
            state.invisible.insert(instance_id.clone());
        }
        state.created.push(instance_id.clone());
        Ok(instance_id)
    }

    fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        for id in ids {
            let record = state
                .instances
                .get_mut(id)
                .ok_or_else(|| FleetError::InstanceVanished(id.clone()))?;
            if record.state.is_active() {
                record.state = InstanceState::ShuttingDown;
            }
            state.terminated.push(id.clone());
        }
        Ok(())
    }
}

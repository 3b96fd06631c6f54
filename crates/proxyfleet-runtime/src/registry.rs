//! The controller's view of which instances it owns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::node::Node;
use proxyfleet_core::error::FleetError;
use proxyfleet_core::instance::NodePhase;

/// Pending and running nodes, keyed by instance id.
///
/// An id lives in at most one of the two maps. Removed nodes are not kept;
/// taking a node out of the registry hands ownership to the caller.
#[derive(Default)]
pub struct FleetRegistry {
    pending: BTreeMap<String, Node>,
    running: BTreeMap<String, Node>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pending(&mut self, node: Node) -> Result<(), FleetError> {
        self.check_untracked(node.id())?;
        self.pending.insert(node.id().to_string(), node);
        Ok(())
    }

    pub fn insert_running(&mut self, node: Node) -> Result<(), FleetError> {
        self.check_untracked(node.id())?;
        self.running.insert(node.id().to_string(), node);
        Ok(())
    }

    fn check_untracked(&self, id: &str) -> Result<(), FleetError> {
        if self.contains(id) {
            return Err(FleetError::DuplicateNode(id.to_string()));
        }
        Ok(())
    }

    /// Move a pending node to running. Returns false if `id` was not pending.
    pub fn promote(&mut self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some(node) => {
                self.running.insert(id.to_string(), node);
                true
            }
            None => false,
        }
    }

    /// Remove a node from whichever set holds it.
    pub fn take(&mut self, id: &str) -> Option<Node> {
        self.pending.remove(id).or_else(|| self.running.remove(id))
    }

    pub fn phase_of(&self, id: &str) -> Option<NodePhase> {
        if self.pending.contains_key(id) {
            Some(NodePhase::Pending)
        } else if self.running.contains_key(id) {
            Some(NodePhase::Running)
        } else {
            None
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.running.contains_key(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        match self.pending.get_mut(id) {
            Some(node) => Some(node),
            None => self.running.get_mut(id),
        }
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    /// Every tracked id, pending first.
    pub fn tracked_ids(&self) -> Vec<String> {
        self.pending.keys().chain(self.running.keys()).cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn tracked_len(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Node> {
        self.pending.values()
    }

    /// Running nodes ordered by instance id.
    pub fn running(&self) -> impl Iterator<Item = &Node> {
        self.running.values()
    }

    pub fn running_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.running.values_mut()
    }

    /// The running node with the earliest launch time. Ties go to the lowest id.
    pub fn oldest_running(&self) -> Option<(String, DateTime<Utc>)> {
        self.running
            .values()
            .min_by_key(|n| n.record().launch_time)
            .map(|n| (n.id().to_string(), n.record().launch_time))
    }
}

//! Node registry: registration, heartbeat reconciliation, and health.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::RegistryError;

/// Heartbeat older than this is considered stale for placement purposes.
pub const STALE_HEARTBEAT_SECS: i64 = 300;

/// Heartbeat older than this means the node is dead and is removed.
pub const DEAD_HEARTBEAT_SECS: i64 = 60;

/// Consecutive RPC failures at or above this exclude a node from placement.
pub const MAX_FAILURE_COUNT: u32 = 3;

/// One registered compute node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Network address the agent's listener is reachable at.
    pub host: String,
    /// TCP port of the agent's listener.
    pub port: u16,
    /// All GPU indices the node has, as reported at registration.
    pub total: HashSet<u32>,
    /// GPU indices currently free, per the agent's last heartbeat.
    pub available: HashSet<u32>,
    /// Job ids currently running on this node.
    pub running_jobs: HashSet<String>,
    /// When the master last processed a heartbeat from this node.
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive RPC failures since the last success.
    pub failure_count: u32,
}

impl NodeEntry {
    /// Seconds since the last processed heartbeat.
    #[must_use]
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds()
    }

    /// Whether the node is eligible for new placements: not failing too
    /// often and not stale. A node that is both online (fresh heartbeat)
    /// and otherwise healthy always wins over a merely-not-yet-expired
    /// stale one.
    #[must_use]
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        self.failure_count < MAX_FAILURE_COUNT
            && self.heartbeat_age_secs(now) < STALE_HEARTBEAT_SECS
    }

    /// Whether the node has gone past the dead threshold and should be
    /// dropped from the registry, failing any jobs assigned to it.
    #[must_use]
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        self.heartbeat_age_secs(now) >= DEAD_HEARTBEAT_SECS
    }
}

/// The master's view of every registered node.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeEntry>,
}

impl NodeRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a new node, or wholesale-replace an existing one's
    /// entry: address, GPU inventory, availability, and running-job set
    /// are all reset from scratch on every call, not only on first
    /// insert. A node that re-registers with a smaller `gpu_count` than
    /// before (e.g. an agent restart that detects fewer GPUs) must not
    /// be left with stale `available`/`running_jobs` referencing
    /// now-out-of-range indices, which would violate `available ⊆ total`.
    pub fn register(
        &mut self,
        node_id: String,
        host: String,
        port: u16,
        gpu_count: u32,
    ) {
        let total: HashSet<u32> = (0..gpu_count).collect();
        self.nodes.insert(
            node_id,
            NodeEntry {
                host,
                port,
                available: total.clone(),
                total,
                running_jobs: HashSet::new(),
                last_heartbeat: Utc::now(),
                failure_count: 0,
            },
        );
    }

    /// Reconcile a heartbeat: the agent's `available_gpus` and
    /// `running_jobs` are authoritative and overwrite the master's view,
    /// since the agent's heartbeat wins over any drift the master observes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the node was never registered.
    pub fn heartbeat(
        &mut self,
        node_id: &str,
        available_gpus: HashSet<u32>,
        running_jobs: HashSet<String>,
    ) -> Result<(), RegistryError> {
        let entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        entry.available = available_gpus;
        entry.running_jobs = running_jobs;
        entry.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Record an RPC success: resets the node's failure count.
    pub fn record_success(&mut self, node_id: &str) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.failure_count = 0;
        }
    }

    /// Record an RPC failure: increments the node's failure count.
    pub fn record_failure(&mut self, node_id: &str) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.failure_count += 1;
        }
    }

    /// Remove GPU indices from a node's available set (placement commit).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if `node_id` is unregistered,
    /// or [`RegistryError::MissingGpus`] if any index is not free.
    pub fn reserve(
        &mut self,
        node_id: &str,
        gpus: &[u32],
        job_id: String,
    ) -> Result<(), RegistryError> {
        let entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        let missing: Vec<u32> = gpus
            .iter()
            .copied()
            .filter(|g| !entry.available.contains(g))
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingGpus {
                node_id: node_id.to_string(),
                missing,
            });
        }
        for g in gpus {
            entry.available.remove(g);
        }
        entry.running_jobs.insert(job_id);
        Ok(())
    }

    /// Return GPU indices to a node's available set (release on finalize
    /// or failed dispatch rollback).
    pub fn release(&mut self, node_id: &str, gpus: &[u32], job_id: &str) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            for g in gpus {
                entry.available.insert(*g);
            }
            entry.running_jobs.remove(job_id);
        }
    }

    /// Remove a node from the registry (on death), returning its prior
    /// entry so the caller can finalize jobs that were running on it.
    pub fn remove(&mut self, node_id: &str) -> Option<NodeEntry> {
        self.nodes.remove(node_id)
    }

    /// Look up a node by id.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&NodeEntry> {
        self.nodes.get(node_id)
    }

    /// Iterate all registered nodes by id.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeEntry)> {
        self.nodes.iter()
    }

    /// Ids of nodes whose heartbeat has gone past the dead threshold.
    #[must_use]
    pub fn dead_node_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, e)| e.is_dead(now))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_seeds_full_availability() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "127.0.0.1".to_string(), 9000, 2);
        let entry = reg.get("n1").expect("registered");
        assert_eq!(entry.available, HashSet::from([0, 1]));
        assert_eq!(entry.total, HashSet::from([0, 1]));
    }

    #[test]
    fn re_register_with_fewer_gpus_drops_now_out_of_range_availability() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "h".to_string(), 1, 4);
        reg.reserve("n1", &[0], "J1".to_string()).expect("reserve");
        // Agent restarts and re-registers with only 2 GPUs detected this
        // time; the stale available/running_jobs from the old, larger
        // inventory must not survive.
        reg.register("n1".to_string(), "h".to_string(), 1, 2);
        let entry = reg.get("n1").expect("registered");
        assert_eq!(entry.total, HashSet::from([0, 1]));
        assert_eq!(entry.available, HashSet::from([0, 1]));
        assert!(entry.running_jobs.is_empty());
    }

    #[test]
    fn reserve_rejects_unavailable_gpu() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "h".to_string(), 1, 2);
        reg.reserve("n1", &[0], "J1".to_string()).expect("reserve 0");
        let err = reg.reserve("n1", &[0], "J2".to_string()).unwrap_err();
        assert!(matches!(err, RegistryError::MissingGpus { .. }));
    }

    #[test]
    fn release_restores_availability_and_running_set() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "h".to_string(), 1, 2);
        reg.reserve("n1", &[0, 1], "J1".to_string()).expect("reserve");
        reg.release("n1", &[0, 1], "J1");
        let entry = reg.get("n1").expect("exists");
        assert_eq!(entry.available, HashSet::from([0, 1]));
        assert!(!entry.running_jobs.contains("J1"));
    }

    #[test]
    fn heartbeat_overwrites_available_even_if_more_free_than_tracked() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "h".to_string(), 1, 2);
        reg.reserve("n1", &[0], "J1".to_string()).expect("reserve");
        reg.heartbeat("n1", HashSet::from([0, 1]), HashSet::new())
            .expect("heartbeat");
        let entry = reg.get("n1").expect("exists");
        assert_eq!(entry.available, HashSet::from([0, 1]));
    }

    #[test]
    fn failure_count_excludes_from_health_at_threshold() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "h".to_string(), 1, 1);
        for _ in 0..MAX_FAILURE_COUNT {
            reg.record_failure("n1");
        }
        let entry = reg.get("n1").expect("exists");
        assert!(!entry.is_healthy(Utc::now()));
    }

    #[test]
    fn success_resets_failure_count() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "h".to_string(), 1, 1);
        reg.record_failure("n1");
        reg.record_failure("n1");
        reg.record_success("n1");
        let entry = reg.get("n1").expect("exists");
        assert_eq!(entry.failure_count, 0);
    }

    #[test]
    fn dead_node_ids_detects_stale_heartbeat() {
        let mut reg = NodeRegistry::new();
        reg.register("n1".to_string(), "h".to_string(), 1, 1);
        let far_future = Utc::now() + chrono::Duration::seconds(DEAD_HEARTBEAT_SECS + 5);
        assert_eq!(reg.dead_node_ids(far_future), vec!["n1".to_string()]);
    }
}

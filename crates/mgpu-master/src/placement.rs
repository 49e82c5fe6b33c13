//! The placement algorithm: turns a job's `ResourceRequest` plus the
//! current registry snapshot into a concrete node→GPU-index assignment,
//! or a diagnosis of why none could be found.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use mgpu_proto::ResourceRequest;

use crate::registry::NodeRegistry;

/// A concrete placement: node id → reserved GPU indices.
pub type Assignment = HashMap<String, Vec<u32>>;

/// Why a single node was rejected for a placement attempt, for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The node id was never registered.
    Unregistered,
    /// The node is unhealthy (too many failures or stale heartbeat).
    Unhealthy,
    /// The node doesn't have enough free GPUs.
    InsufficientGpus {
        /// GPUs the request needed on this node.
        needed: u32,
        /// GPUs the node actually had free.
        available: u32,
    },
    /// Specific requested GPU indices were not free (pinned requests).
    MissingIndices(Vec<u32>),
    /// The node was explicitly excluded by the request.
    Excluded,
}

/// A recorded explanation for why a job could not be placed, attached
/// to its output buffer on retry exhaustion.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    /// Per-node rejection reasons considered during this attempt.
    pub rejected: Vec<(String, RejectReason)>,
    /// A free-text summary of unmet request-level constraints.
    pub unmet_constraints: String,
}

impl Diagnosis {
    /// Render the diagnosis as human-readable lines, suitable for
    /// appending to a job's output buffer.
    #[must_use]
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "placement diagnosis: {}",
            self.unmet_constraints
        )];
        for (node_id, reason) in &self.rejected {
            lines.push(format!("  node {node_id}: {reason:?}"));
        }
        lines
    }
}

/// Attempt to place `request` against the current registry snapshot.
///
/// Returns `Ok(assignment)` on success, or `Err(diagnosis)` naming why
/// every candidate node was rejected.
pub fn find_placement(
    request: &ResourceRequest,
    registry: &NodeRegistry,
    now: DateTime<Utc>,
) -> Result<Assignment, Diagnosis> {
    match request {
        ResourceRequest::Pinned { assignment } => place_pinned(assignment, registry, now),
        ResourceRequest::Shaped {
            node_count,
            gpus_per_node,
            include,
            exclude,
        } => place_shaped(
            *node_count,
            *gpus_per_node,
            include.as_deref(),
            exclude.as_deref(),
            registry,
            now,
        ),
        ResourceRequest::Flat { gpus_needed } => place_flat(*gpus_needed, registry, now),
    }
}

fn place_pinned(
    requested: &HashMap<mgpu_proto::NodeId, Vec<u32>>,
    registry: &NodeRegistry,
    now: DateTime<Utc>,
) -> Result<Assignment, Diagnosis> {
    let mut rejected = Vec::new();
    for (node_id, gpus) in requested {
        match registry.get(node_id.as_str()) {
            None => rejected.push((node_id.to_string(), RejectReason::Unregistered)),
            Some(entry) if !entry.is_healthy(now) => {
                rejected.push((node_id.to_string(), RejectReason::Unhealthy));
            }
            Some(entry) => {
                let missing: Vec<u32> = gpus
                    .iter()
                    .copied()
                    .filter(|g| !entry.available.contains(g))
                    .collect();
                if !missing.is_empty() {
                    rejected.push((node_id.to_string(), RejectReason::MissingIndices(missing)));
                }
            }
        }
    }
    if !rejected.is_empty() {
        return Err(Diagnosis {
            rejected,
            unmet_constraints: "pinned placement requires every requested node/GPU pair free"
                .to_string(),
        });
    }
    Ok(requested
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect())
}

fn place_shaped(
    node_count: u32,
    gpus_per_node: u32,
    include: Option<&[mgpu_proto::NodeId]>,
    exclude: Option<&[mgpu_proto::NodeId]>,
    registry: &NodeRegistry,
    now: DateTime<Utc>,
) -> Result<Assignment, Diagnosis> {
    let excluded: HashSet<&str> = exclude
        .unwrap_or(&[])
        .iter()
        .map(mgpu_proto::NodeId::as_str)
        .collect();
    let included: Option<HashSet<&str>> = include
        .map(|ids| ids.iter().map(mgpu_proto::NodeId::as_str).collect());

    let mut rejected = Vec::new();
    let mut candidates: Vec<(&String, usize)> = Vec::new();
    for (node_id, entry) in registry.iter() {
        if excluded.contains(node_id.as_str()) {
            rejected.push((node_id.clone(), RejectReason::Excluded));
            continue;
        }
        if let Some(allow) = &included {
            if !allow.contains(node_id.as_str()) {
                rejected.push((node_id.clone(), RejectReason::Excluded));
                continue;
            }
        }
        if !entry.is_healthy(now) {
            rejected.push((node_id.clone(), RejectReason::Unhealthy));
            continue;
        }
        if entry.available.len() < gpus_per_node as usize {
            rejected.push((
                node_id.clone(),
                RejectReason::InsufficientGpus {
                    needed: gpus_per_node,
                    available: entry.available.len() as u32,
                },
            ));
            continue;
        }
        candidates.push((node_id, entry.available.len()));
    }

    // Fill-first: prefer already-partly-used (smaller residual) large
    // nodes, keeping fully-free nodes intact for future large requests.
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    if candidates.len() < node_count as usize {
        return Err(Diagnosis {
            rejected,
            unmet_constraints: format!(
                "need {node_count} nodes with {gpus_per_node} free GPUs each, found {}",
                candidates.len()
            ),
        });
    }

    let mut assignment = Assignment::new();
    for (node_id, _) in candidates.into_iter().take(node_count as usize) {
        let entry = registry.get(node_id).expect("candidate came from registry");
        let mut indices: Vec<u32> = entry.available.iter().copied().collect();
        indices.sort_unstable();
        indices.truncate(gpus_per_node as usize);
        assignment.insert(node_id.clone(), indices);
    }
    Ok(assignment)
}

fn place_flat(
    gpus_needed: u32,
    registry: &NodeRegistry,
    now: DateTime<Utc>,
) -> Result<Assignment, Diagnosis> {
    let mut rejected = Vec::new();
    let mut best: Option<(&String, i64)> = None;
    for (node_id, entry) in registry.iter() {
        if !entry.is_healthy(now) {
            rejected.push((node_id.clone(), RejectReason::Unhealthy));
            continue;
        }
        let available = entry.available.len() as u32;
        if available < gpus_needed {
            rejected.push((
                node_id.clone(),
                RejectReason::InsufficientGpus {
                    needed: gpus_needed,
                    available,
                },
            ));
            continue;
        }
        // Best-fit: minimize residual free GPUs after placement. Ties
        // broken by node id string order.
        let residual = i64::from(available) - i64::from(gpus_needed);
        best = match best {
            None => Some((node_id, residual)),
            Some((best_id, best_residual)) => {
                if residual < best_residual || (residual == best_residual && node_id < best_id) {
                    Some((node_id, residual))
                } else {
                    Some((best_id, best_residual))
                }
            }
        };
    }

    let Some((node_id, _)) = best else {
        return Err(Diagnosis {
            rejected,
            unmet_constraints: format!("no healthy node with {gpus_needed} free GPUs"),
        });
    };
    let entry = registry.get(node_id).expect("best came from registry");
    let mut indices: Vec<u32> = entry.available.iter().copied().collect();
    indices.sort_unstable();
    indices.truncate(gpus_needed as usize);
    let mut assignment = Assignment::new();
    assignment.insert(node_id.clone(), indices);
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgpu_proto::NodeId;

    fn registry_with(nodes: &[(&str, u32)]) -> NodeRegistry {
        let mut reg = NodeRegistry::new();
        for (id, gpu_count) in nodes {
            reg.register((*id).to_string(), "h".to_string(), 1, *gpu_count);
        }
        reg
    }

    #[test]
    fn flat_prefers_minimal_residual_best_fit() {
        let reg = registry_with(&[("n1", 4), ("n2", 2)]);
        let req = ResourceRequest::Flat { gpus_needed: 2 };
        let assignment = find_placement(&req, &reg, Utc::now()).expect("placement found");
        assert_eq!(assignment.len(), 1);
        assert!(assignment.contains_key("n2"));
    }

    #[test]
    fn flat_ties_break_by_node_id() {
        let reg = registry_with(&[("n2", 2), ("n1", 2)]);
        let req = ResourceRequest::Flat { gpus_needed: 2 };
        let assignment = find_placement(&req, &reg, Utc::now()).expect("placement found");
        assert!(assignment.contains_key("n1"));
    }

    #[test]
    fn flat_fails_when_no_node_has_enough() {
        let reg = registry_with(&[("n1", 1)]);
        let req = ResourceRequest::Flat { gpus_needed: 2 };
        assert!(find_placement(&req, &reg, Utc::now()).is_err());
    }

    #[test]
    fn pinned_requires_all_indices_free() {
        let mut reg = registry_with(&[("n1", 2)]);
        reg.reserve("n1", &[0], "other".to_string()).expect("reserve");
        let mut requested = HashMap::new();
        requested.insert(NodeId::new("n1"), vec![0, 1]);
        let req = ResourceRequest::Pinned {
            assignment: requested,
        };
        let err = find_placement(&req, &reg, Utc::now()).unwrap_err();
        assert_eq!(err.rejected.len(), 1);
    }

    #[test]
    fn pinned_succeeds_when_all_indices_free() {
        let reg = registry_with(&[("n1", 2)]);
        let mut requested = HashMap::new();
        requested.insert(NodeId::new("n1"), vec![0, 1]);
        let req = ResourceRequest::Pinned {
            assignment: requested.clone(),
        };
        let assignment = find_placement(&req, &reg, Utc::now()).expect("placement found");
        assert_eq!(assignment.get("n1"), Some(&vec![0, 1]));
    }

    #[test]
    fn shaped_fill_first_prefers_partly_used_larger_node() {
        let mut reg = registry_with(&[("n1", 4), ("n2", 2)]);
        reg.reserve("n1", &[0], "other".to_string()).expect("reserve");
        let req = ResourceRequest::Shaped {
            node_count: 1,
            gpus_per_node: 2,
            include: None,
            exclude: None,
        };
        let assignment = find_placement(&req, &reg, Utc::now()).expect("placement found");
        // n1 now has 3 free (more than n2's 2), fill-first sorts by
        // available descending so n1 (3) is preferred over n2 (2).
        assert!(assignment.contains_key("n1"));
    }

    #[test]
    fn shaped_respects_exclude_list() {
        let reg = registry_with(&[("n1", 4)]);
        let req = ResourceRequest::Shaped {
            node_count: 1,
            gpus_per_node: 2,
            include: None,
            exclude: Some(vec![NodeId::new("n1")]),
        };
        assert!(find_placement(&req, &reg, Utc::now()).is_err());
    }

    #[test]
    fn unhealthy_node_excluded_from_flat_placement() {
        let mut reg = registry_with(&[("n1", 4)]);
        for _ in 0..3 {
            reg.record_failure("n1");
        }
        let req = ResourceRequest::Flat { gpus_needed: 1 };
        assert!(find_placement(&req, &reg, Utc::now()).is_err());
    }
}

//! Transitive closure of upstream/downstream edges.
//!
//! Contract: after every successful [`add_edge`], for each node `x` of the
//! affected kind, `x.all_upstream` is exactly the set of nodes reachable from
//! `x` by following `upstream` edges, and `x.all_downstream` is exactly the
//! set reachable by following `downstream` edges. The update touches only the
//! nodes whose closures change and is independent of insertion order.
//! [`verify`] recomputes the closures by traversal and must pass after any
//! bulk edge insertion.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::database::EntityId;
use crate::entity::Entity;
use crate::error::QuoremError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    #[serde(default)]
    pub upstream: BTreeSet<EntityId>,
    #[serde(default)]
    pub downstream: BTreeSet<EntityId>,
    #[serde(default)]
    pub all_upstream: BTreeSet<EntityId>,
    #[serde(default)]
    pub all_downstream: BTreeSet<EntityId>,
}

/// Records `upstream` as a direct upstream of `downstream`. Returns `false`
/// when the edge already existed.
pub fn add_edge(
    nodes: &mut [Entity],
    downstream: EntityId,
    upstream: EntityId,
) -> Result<bool, QuoremError> {
    let (down, up) = match (nodes.get(downstream.0), nodes.get(upstream.0)) {
        (Some(down), Some(up)) => (down, up),
        _ => {
            return Err(QuoremError::CorruptState(format!(
                "edge {upstream} -> {downstream} references a missing record"
            )));
        }
    };
    if down.kind != up.kind {
        return Err(QuoremError::CorruptState(format!(
            "upstream edges must join records of one kind, got {} and {}",
            down.kind, up.kind
        )));
    }
    if !down.kind.has_upstream() {
        return Err(QuoremError::UnknownField {
            kind: down.kind.to_string(),
            field: "upstream".to_string(),
        });
    }
    if downstream == upstream || up.closure.all_upstream.contains(&downstream) {
        return Err(QuoremError::CycleDetected {
            kind: down.kind.to_string(),
            downstream: down.identity.clone(),
            upstream: up.identity.clone(),
        });
    }
    if down.closure.upstream.contains(&upstream) {
        return Ok(false);
    }

    let mut ancestors = up.closure.all_upstream.clone();
    ancestors.insert(upstream);
    let mut descendants = down.closure.all_downstream.clone();
    descendants.insert(downstream);

    nodes[downstream.0].closure.upstream.insert(upstream);
    nodes[upstream.0].closure.downstream.insert(downstream);
    for id in &descendants {
        nodes[id.0].closure.all_upstream.extend(ancestors.iter().copied());
    }
    for id in &ancestors {
        nodes[id.0].closure.all_downstream.extend(descendants.iter().copied());
    }
    Ok(true)
}

fn reachable(
    nodes: &[Entity],
    start: EntityId,
    next: impl Fn(&Closure) -> &BTreeSet<EntityId>,
) -> BTreeSet<EntityId> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if let Some(node) = nodes.get(id.0) {
            for neighbour in next(&node.closure) {
                if seen.insert(*neighbour) {
                    queue.push_back(*neighbour);
                }
            }
        }
    }
    seen
}

pub fn verify(nodes: &[Entity]) -> Result<(), QuoremError> {
    for node in nodes.iter().filter(|node| node.kind.has_upstream()) {
        for up in &node.closure.upstream {
            let mirrored = nodes
                .get(up.0)
                .is_some_and(|other| other.closure.downstream.contains(&node.id));
            if !mirrored {
                return Err(QuoremError::CorruptState(format!(
                    "{} {}: upstream edge to {up} has no downstream mirror",
                    node.kind, node.identity
                )));
            }
        }
        if reachable(nodes, node.id, |closure| &closure.upstream) != node.closure.all_upstream {
            return Err(QuoremError::CorruptState(format!(
                "{} {}: cached upstream closure is stale",
                node.kind, node.identity
            )));
        }
        if reachable(nodes, node.id, |closure| &closure.downstream)
            != node.closure.all_downstream
        {
            return Err(QuoremError::CorruptState(format!(
                "{} {}: cached downstream closure is stale",
                node.kind, node.identity
            )));
        }
    }
    Ok(())
}

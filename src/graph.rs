//! Service dependency graph
//!
//! The dependency relationships between managed services are data, not
//! call order: this module builds an adjacency view over the descriptor
//! table, rejects cycles and dangling references, and produces the
//! topological order the sequencer walks. Declaration order is used as
//! the tie-break so the resulting sequence is deterministic.

use std::collections::HashSet;

use crate::registry::{ServiceId, SERVICES};
use crate::{Error, Result};

/// Compute the sequencer's step order from the compiled-in service table.
///
/// Returns the services in an order where every service appears after
/// all of its dependencies. Fails if the table declares a dependency
/// cycle; that is a build-time defect surfaced at operator startup, not
/// something reconciliation can recover from.
pub fn sequence() -> Result<Vec<ServiceId>> {
    let nodes: Vec<(ServiceId, &[ServiceId])> =
        SERVICES.iter().map(|d| (d.id, d.depends_on)).collect();
    topo_sort(&nodes)
}

/// Stable topological sort over `(node, dependencies)` pairs.
///
/// Dependencies must reference declared nodes. Ties are broken by
/// declaration order, so a table that is already dependency-ordered
/// sorts to itself.
fn topo_sort(nodes: &[(ServiceId, &[ServiceId])]) -> Result<Vec<ServiceId>> {
    let declared: HashSet<ServiceId> = nodes.iter().map(|(id, _)| *id).collect();
    for (id, deps) in nodes {
        for dep in *deps {
            if !declared.contains(dep) {
                return Err(Error::validation(format!(
                    "service {id} depends on undeclared service {dep}"
                )));
            }
            if dep == id {
                return Err(Error::validation(format!(
                    "service {id} depends on itself"
                )));
            }
        }
    }

    let mut placed: HashSet<ServiceId> = HashSet::new();
    let mut order = Vec::with_capacity(nodes.len());

    while order.len() < nodes.len() {
        let next = nodes.iter().find(|(id, deps)| {
            !placed.contains(id) && deps.iter().all(|dep| placed.contains(dep))
        });
        match next {
            Some((id, _)) => {
                placed.insert(*id);
                order.push(*id);
            }
            None => {
                let stuck: Vec<String> = nodes
                    .iter()
                    .filter(|(id, _)| !placed.contains(id))
                    .map(|(id, _)| id.to_string())
                    .collect();
                return Err(Error::validation(format!(
                    "dependency cycle among services: {}",
                    stuck.join(", ")
                )));
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_respects_every_dependency() {
        let order = sequence().unwrap();
        assert_eq!(order.len(), SERVICES.len());

        for d in SERVICES {
            let pos = order.iter().position(|id| *id == d.id).unwrap();
            for dep in d.depends_on {
                let dep_pos = order.iter().position(|id| id == dep).unwrap();
                assert!(
                    dep_pos < pos,
                    "{} must come before {} in {:?}",
                    dep,
                    d.id,
                    order
                );
            }
        }
    }

    #[test]
    fn declaration_order_is_already_topological() {
        // The table is maintained in dependency order; the stable sort
        // should therefore return it unchanged.
        let order = sequence().unwrap();
        let declared: Vec<ServiceId> = SERVICES.iter().map(|d| d.id).collect();
        assert_eq!(order, declared);
    }

    #[test]
    fn cycles_are_rejected() {
        let nodes: Vec<(ServiceId, &[ServiceId])> = vec![
            (ServiceId::Broker, &[ServiceId::Database][..]),
            (ServiceId::Database, &[ServiceId::Broker][..]),
        ];
        let err = topo_sort(&nodes).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
        assert!(err.to_string().contains("broker"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let nodes: Vec<(ServiceId, &[ServiceId])> =
            vec![(ServiceId::Broker, &[ServiceId::Broker][..])];
        let err = topo_sort(&nodes).unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let nodes: Vec<(ServiceId, &[ServiceId])> =
            vec![(ServiceId::Broker, &[ServiceId::Identity][..])];
        let err = topo_sort(&nodes).unwrap_err();
        assert!(err.to_string().contains("undeclared"));
    }
}

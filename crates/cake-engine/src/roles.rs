//! Node role assignment for multi-node clusters built from a flat inventory

use std::fmt;

use serde::Serialize;

use cake_common::config::NodeAddress;

/// Role a node plays in the permanent cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Distributed key-value store member
    Etcd,
    /// Kubernetes control plane
    ControlPlane,
    /// Workload node
    Worker,
}

impl NodeRole {
    /// Name as written in cluster.yml
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Etcd => "etcd",
            NodeRole::ControlPlane => "controlplane",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node and the roles it was given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedNode {
    /// The inventory entry
    pub node: NodeAddress,
    /// Roles, consensus first when present
    pub roles: Vec<NodeRole>,
}

impl AssignedNode {
    /// Whether this node holds `role`
    pub fn has(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }
}

/// Result of [`assign_roles`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleAssignment {
    /// Nodes in inventory order
    pub nodes: Vec<AssignedNode>,
    /// Topology warnings to surface to the operator
    pub warnings: Vec<String>,
}

impl RoleAssignment {
    /// Number of etcd members
    pub fn consensus_members(&self) -> usize {
        self.nodes.iter().filter(|n| n.has(NodeRole::Etcd)).count()
    }
}

/// Assign roles over an ordered inventory.
///
/// Every node joins etcd. Nodes matching `is_control_plane` also get the
/// control-plane role, the rest become workers. A lone node gets all three
/// roles and a non-HA warning. With an even node count the last node leaves
/// etcd so membership stays odd.
pub fn assign_roles<F>(inventory: &[NodeAddress], is_control_plane: F) -> RoleAssignment
where
    F: Fn(&str) -> bool,
{
    let mut assignment = RoleAssignment::default();

    if let [only] = inventory {
        assignment.nodes.push(AssignedNode {
            node: only.clone(),
            roles: vec![NodeRole::Etcd, NodeRole::ControlPlane, NodeRole::Worker],
        });
        assignment.warnings.push(format!(
            "only one node ({}) was provided, the cluster will not be highly available",
            only.name
        ));
        return assignment;
    }

    assignment.nodes = inventory
        .iter()
        .map(|node| {
            let role = if is_control_plane(&node.name) {
                NodeRole::ControlPlane
            } else {
                NodeRole::Worker
            };
            AssignedNode {
                node: node.clone(),
                roles: vec![NodeRole::Etcd, role],
            }
        })
        .collect();

    if inventory.len() % 2 == 0 {
        if let Some(last) = assignment.nodes.last_mut() {
            last.roles.retain(|r| *r != NodeRole::Etcd);
        }
    }
    assignment
}

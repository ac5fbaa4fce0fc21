use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::worker::stable_hash;

/// One collector node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// `host:port` the member's inbound endpoint listens on.
    pub address: String,
}

impl Member {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// The static member list as seen from one node.
///
/// Members are sorted by name and de-duplicated by address, so every node
/// configured with the same list computes the same owner for a key.
#[derive(Debug, Clone)]
pub struct ClusterView {
    members: Vec<Member>,
    self_index: usize,
}

impl ClusterView {
    /// Builds the view of `local` over `members`. `local` is added when the
    /// list does not already contain it.
    pub fn new(local: Member, members: impl IntoIterator<Item = Member>) -> Result<Self> {
        if local.name.is_empty() || local.address.is_empty() {
            bail!("local member needs both a name and an address");
        }

        let mut all: Vec<Member> = members
            .into_iter()
            .filter(|m| m.address != local.address)
            .collect();
        all.push(local.clone());
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)));

        let mut seen = HashSet::new();
        all.retain(|m| seen.insert(m.address.clone()));

        for pair in all.windows(2) {
            if let [a, b] = pair {
                if a.name == b.name {
                    bail!(
                        "member name {} is used by both {} and {}",
                        a.name,
                        a.address,
                        b.address
                    );
                }
            }
        }

        let Some(self_index) = all.iter().position(|m| *m == local) else {
            bail!("local member {} missing from cluster view", local.name);
        };

        Ok(Self {
            members: all,
            self_index,
        })
    }

    /// A single-node cluster.
    pub fn standalone(local: Member) -> Result<Self> {
        Self::new(local, Vec::new())
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn local(&self) -> &Member {
        &self.members[self.self_index]
    }

    pub fn is_local(&self, member: &Member) -> bool {
        *member == self.members[self.self_index]
    }

    /// Members other than this node.
    pub fn peers(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.self_index)
            .map(|(_, m)| m)
    }

    /// The member responsible for aggregating `key`.
    pub fn owner(&self, key: &str) -> &Member {
        let index = (stable_hash(key) % self.members.len() as u64) as usize;
        &self.members[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trio() -> Vec<Member> {
        vec![
            Member::new("node-c", "10.0.0.3:11800"),
            Member::new("node-a", "10.0.0.1:11800"),
            Member::new("node-b", "10.0.0.2:11800"),
        ]
    }

    #[test]
    fn test_members_sorted_and_deduplicated() {
        let mut members = trio();
        members.push(Member::new("node-a", "10.0.0.1:11800"));

        let view = ClusterView::new(Member::new("node-b", "10.0.0.2:11800"), members).unwrap();
        let names: Vec<&str> = view.members().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["node-a", "node-b", "node-c"]);
        assert_eq!(view.local().name, "node-b");
        assert_eq!(view.peers().count(), 2);
    }

    #[test]
    fn test_local_added_when_missing() {
        let view = ClusterView::new(
            Member::new("node-d", "10.0.0.4:11800"),
            trio(),
        )
        .unwrap();
        assert_eq!(view.len(), 4);
        assert!(view.is_local(&Member::new("node-d", "10.0.0.4:11800")));
    }

    #[test]
    fn test_owner_agrees_across_members() {
        let views: Vec<ClusterView> = trio()
            .into_iter()
            .map(|local| ClusterView::new(local, trio()).unwrap())
            .collect();

        for key in ["k", "svcA", "svcB", "202401011230_svcA"] {
            let owners: Vec<&Member> = views.iter().map(|v| v.owner(key)).collect();
            assert!(owners.windows(2).all(|w| w[0] == w[1]), "key {key}");
        }

        // stable_hash("k") % 3 == 1
        assert_eq!(views[0].owner("k").name, "node-b");
    }

    #[test]
    fn test_conflicting_names_rejected() {
        let members = vec![Member::new("node-a", "10.0.0.9:11800")];
        assert!(ClusterView::new(Member::new("node-a", "10.0.0.1:11800"), members).is_err());
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

/// Information about a BTRFS subvolume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSubvolume {
    pub id: u64,
    pub parent_id: Option<u64>,
    /// Path relative to the top-level subvolume, without a leading slash.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeNode {
    pub subvolume: BtrfsSubvolume,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Subvolumes of one Btrfs volume, nested by path prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeTree {
    nodes: Vec<SubvolumeNode>,
}

impl SubvolumeTree {
    pub fn build(subvolumes: &[BtrfsSubvolume]) -> Self {
        let mut sorted: Vec<&BtrfsSubvolume> = subvolumes.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut nodes: Vec<SubvolumeNode> = Vec::with_capacity(sorted.len());
        for subvolume in sorted {
            // Lexicographic order puts every ancestor before its descendants.
            let parent = nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| is_path_parent(&node.subvolume.path, &subvolume.path))
                .max_by_key(|(_, node)| node.subvolume.path.len())
                .map(|(index, _)| index);

            let index = nodes.len();
            nodes.push(SubvolumeNode {
                subvolume: subvolume.clone(),
                parent,
                children: Vec::new(),
            });
            if let Some(parent) = parent {
                nodes[parent].children.push(index);
            }
        }
        Self { nodes }
    }

    pub fn roots(&self) -> impl Iterator<Item = &SubvolumeNode> {
        self.nodes.iter().filter(|node| node.parent.is_none())
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &SubvolumeNode> {
        self.nodes
            .get(index)
            .into_iter()
            .flat_map(|node| node.children.iter())
            .map(|child| &self.nodes[*child])
    }

    pub fn find(&self, path: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.subvolume.path == path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn is_path_parent(parent: &str, child: &str) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// A Btrfs filesystem, possibly spanning several block devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsVolume {
    pub uuid: String,
    pub label: String,
    pub members: Vec<ObjectPath>,
    /// Member used for mount and subvolume operations; a mounted one when possible.
    pub representative: ObjectPath,
    pub subvolumes: SubvolumeTree,
}

impl BtrfsVolume {
    pub fn is_multi_device(&self) -> bool {
        self.members.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subvolume(id: u64, path: &str) -> BtrfsSubvolume {
        BtrfsSubvolume {
            id,
            parent_id: None,
            path: path.to_string(),
        }
    }

    #[test]
    fn nests_by_path_prefix() {
        let tree = SubvolumeTree::build(&[
            subvolume(258, "home/user"),
            subvolume(256, "home"),
            subvolume(259, "homework"),
            subvolume(257, "root"),
            subvolume(260, "home/user/.snapshots"),
        ]);

        let roots: Vec<_> = tree.roots().map(|node| node.subvolume.path.as_str()).collect();
        assert_eq!(roots, vec!["home", "homework", "root"]);

        let home = tree.find("home").expect("home node");
        let children: Vec<_> = tree
            .children(home)
            .map(|node| node.subvolume.path.as_str())
            .collect();
        assert_eq!(children, vec!["home/user"]);

        let user = tree.find("home/user").expect("user node");
        assert_eq!(tree.children(user).count(), 1);
        assert_eq!(tree.len(), 5);
    }
}

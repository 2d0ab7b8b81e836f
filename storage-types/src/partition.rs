// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::common::ByteRange;
use crate::path::ObjectPath;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    Gpt,
    Dos,
    #[default]
    Unknown,
}

impl PartitionTableType {
    pub fn parse(value: &str) -> Self {
        match value {
            "gpt" => Self::Gpt,
            "dos" => Self::Dos,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub block: ObjectPath,
    pub table_type: PartitionTableType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub block: ObjectPath,
    pub table: Option<ObjectPath>,
    pub number: u32,
    pub offset: u64,
    pub size: u64,
    pub name: String,
    pub type_id: String,
    /// Extended partition holding logical partitions.
    pub is_container: bool,
    /// Logical partition inside an extended one.
    pub is_contained: bool,
}

impl Partition {
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PartitionNodeKind {
    Table { block: ObjectPath },
    Container { block: ObjectPath },
    Partition { block: ObjectPath },
    Free,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionNode {
    pub kind: PartitionNodeKind,
    pub range: ByteRange,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Partitions and unallocated regions of one partition table as an arena tree.
///
/// Node 0 is the table itself. Extended partitions are `Container` nodes whose
/// children are the logical partitions and the free space between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTree {
    nodes: Vec<PartitionNode>,
}

impl PartitionTree {
    /// Lay out `partitions` (sorted by offset) of a table spanning `table_size` bytes.
    ///
    /// Gaps strictly larger than `min_free` become free nodes. Partitions that
    /// stick out of their container are ignored.
    pub fn build(
        table: &ObjectPath,
        table_size: u64,
        partitions: &[Partition],
        min_free: u64,
    ) -> Self {
        let mut tree = Self {
            nodes: vec![PartitionNode {
                kind: PartitionNodeKind::Table {
                    block: table.clone(),
                },
                range: ByteRange::new(0, table_size),
                parent: None,
                children: Vec::new(),
            }],
        };
        tree.fill_level(0, false, partitions, min_free);
        tree
    }

    fn fill_level(&mut self, parent: usize, contained: bool, partitions: &[Partition], min_free: u64) {
        let container = self.nodes[parent].range;
        let mut last_end = container.start;

        for partition in partitions {
            if partition.is_contained != contained {
                continue;
            }
            let range = partition.range();
            if !container.contains(&range) {
                continue;
            }

            self.push_free(parent, last_end, range.start, min_free);
            let kind = if partition.is_container && !contained {
                PartitionNodeKind::Container {
                    block: partition.block.clone(),
                }
            } else {
                PartitionNodeKind::Partition {
                    block: partition.block.clone(),
                }
            };
            let index = self.push(parent, kind, range);
            if partition.is_container && !contained {
                self.fill_level(index, true, partitions, min_free);
            }
            last_end = last_end.max(range.end);
        }

        self.push_free(parent, last_end, container.end, min_free);
    }

    fn push_free(&mut self, parent: usize, start: u64, end: u64, min_free: u64) {
        if end > start && end - start > min_free {
            self.push(parent, PartitionNodeKind::Free, ByteRange { start, end });
        }
    }

    fn push(&mut self, parent: usize, kind: PartitionNodeKind, range: ByteRange) -> usize {
        let index = self.nodes.len();
        self.nodes.push(PartitionNode {
            kind,
            range,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        index
    }

    pub fn root(&self) -> &PartitionNode {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> Option<&PartitionNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[PartitionNode] {
        &self.nodes
    }

    /// Index of the node describing `block`, if it was laid out.
    pub fn find(&self, block: &ObjectPath) -> Option<usize> {
        self.nodes.iter().position(|node| match &node.kind {
            PartitionNodeKind::Container { block: candidate }
            | PartitionNodeKind::Partition { block: candidate } => candidate == block,
            _ => false,
        })
    }

    pub fn free_regions(&self) -> impl Iterator<Item = ByteRange> + '_ {
        self.nodes
            .iter()
            .filter(|node| node.kind == PartitionNodeKind::Free)
            .map(|node| node.range)
    }

    /// Size of the free region that starts right where `block` ends, within
    /// the same container. Zero when the partition is followed by another one.
    pub fn free_space_after(&self, block: &ObjectPath) -> u64 {
        let Some(index) = self.find(block) else {
            return 0;
        };
        let node = &self.nodes[index];
        let Some(parent) = node.parent else {
            return 0;
        };
        self.nodes[parent]
            .children
            .iter()
            .map(|child| &self.nodes[*child])
            .find(|sibling| {
                sibling.kind == PartitionNodeKind::Free && sibling.range.start == node.range.end
            })
            .map(|free| free.range.size())
            .unwrap_or(0)
    }
}

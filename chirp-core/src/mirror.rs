use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytemuck::Zeroable;
use chirp_protocol::mirror::{MirrorHeader, NodeRecord, MIRROR_HEADER_SIZE, NODE_RECORD_SIZE, NO_NODE};

use crate::region::SharedRegion;

/// How many unstable reads to tolerate before giving up on a snapshot.
const READ_RETRIES: usize = 3;

/// One node of the reconstructed tree view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub id: i32,
    pub def_name: String,
    pub is_group: bool,
    pub children: Vec<NodeView>,
}

/// Hierarchical snapshot of the engine's node tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTreeView {
    pub version: u32,
    /// False when the engine had more nodes than mirror capacity; the
    /// nodes present are still valid.
    pub complete: bool,
    pub roots: Vec<NodeView>,
}

/// Reader over the engine-written node-tree mirror region.
pub struct MirrorReader {
    region: Arc<SharedRegion>,
    offset: usize,
    capacity: usize,
}

impl MirrorReader {
    pub fn new(region: Arc<SharedRegion>, offset: usize, capacity: usize) -> MirrorReader {
        MirrorReader { region, offset, capacity }
    }

    fn version(&self) -> u32 {
        // version is the second header word
        self.region.atomic_u32(self.offset + 4).load(Ordering::Acquire)
    }

    /// Parse the mirror into a tree. None when the engine never wrote a
    /// snapshot, or kept writing across every retry.
    pub fn read(&self) -> Option<NodeTreeView> {
        for _ in 0..READ_RETRIES {
            let version_before = self.version();

            // odd version: engine mid-write
            if version_before == 0 || version_before % 2 != 0 {
                std::thread::yield_now();
                continue;
            }

            let mut header_bytes = [0u8; MIRROR_HEADER_SIZE];
            self.region.read_into(self.offset, &mut header_bytes);
            let header: MirrorHeader = bytemuck::pod_read_unaligned(&header_bytes);

            let count = (header.node_count as usize).min(self.capacity);
            let mut records = vec![NodeRecord::zeroed(); count];
            for (index, record) in records.iter_mut().enumerate() {
                let mut bytes = [0u8; NODE_RECORD_SIZE];
                self.region.read_into(self.offset + MIRROR_HEADER_SIZE + index * NODE_RECORD_SIZE, &mut bytes);
                *record = bytemuck::pod_read_unaligned(&bytes);
            }

            if self.version() != version_before {
                continue;
            }

            return Some(build_tree(&records, header));
        }

        None
    }
}

fn build_tree(records: &[NodeRecord], header: MirrorHeader) -> NodeTreeView {
    let by_id: HashMap<i32, &NodeRecord> =
        records.iter().map(|record| (record.id, record)).collect();

    let mut visited = HashSet::new();
    let roots = records
        .iter()
        .filter(|record| record.parent == NO_NODE)
        .filter_map(|record| build_node(record.id, &by_id, &mut visited))
        .collect();

    NodeTreeView {
        version: header.version,
        complete: header.dropped == 0,
        roots,
    }
}

fn build_node(
    id: i32,
    by_id: &HashMap<i32, &NodeRecord>,
    visited: &mut HashSet<i32>,
) -> Option<NodeView> {
    // the visited set guards against a half-written sibling chain looping
    // back on itself
    if !visited.insert(id) {
        return None;
    }

    let record = by_id.get(&id)?;
    let mut children = Vec::new();

    if record.is_group() {
        let mut cursor = record.head;
        while cursor != NO_NODE {
            let next = by_id.get(&cursor).map_or(NO_NODE, |r| r.next);
            let Some(child) = build_node(cursor, by_id, visited) else { break };
            children.push(child);
            cursor = next;
        }
    }

    Some(NodeView {
        id: record.id,
        def_name: String::from_utf8_lossy(record.def_name()).into_owned(),
        is_group: record.is_group(),
        children,
    })
}

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Fixed bytes reserved for a synthdef name in a mirror record; longer
/// names are truncated by the engine when it serializes the snapshot.
pub const MIRROR_NAME_LEN: usize = 32;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
    #[repr(transparent)]
    pub struct NodeFlags: u32 {
        const GROUP = 0x01;
    }
}

/// Header the engine writes ahead of the record array.
///
/// `version` is bumped before and after each snapshot write, so an even
/// and unchanged version brackets a stable read. `dropped` counts nodes
/// that did not fit the mirror capacity.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct MirrorHeader {
    pub node_count: u32,
    pub version: u32,
    pub dropped: u32,
    pub reserved: u32,
}

pub const MIRROR_HEADER_SIZE: usize = size_of::<MirrorHeader>();

/// One node of the engine's tree, flattened. Sibling order is carried by
/// the `prev`/`next` chain; `head` is the first child of a group. An id
/// of -1 in any link field means "none".
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct NodeRecord {
    pub id: i32,
    pub parent: i32,
    pub flags: NodeFlags,
    pub prev: i32,
    pub next: i32,
    pub head: i32,
    pub def_name: [u8; MIRROR_NAME_LEN],
}

pub const NODE_RECORD_SIZE: usize = size_of::<NodeRecord>();

pub const NO_NODE: i32 = -1;

const_assert_eq!(MIRROR_HEADER_SIZE, 16);
const_assert_eq!(NODE_RECORD_SIZE, 56);

impl NodeRecord {
    pub fn is_group(&self) -> bool {
        self.flags.contains(NodeFlags::GROUP)
    }

    /// Synthdef name bytes up to the first NUL.
    pub fn def_name(&self) -> &[u8] {
        let end = self.def_name.iter().position(|b| *b == 0).unwrap_or(MIRROR_NAME_LEN);
        &self.def_name[..end]
    }
}

pub const fn mirror_region_size(capacity: usize) -> usize {
    MIRROR_HEADER_SIZE + capacity * NODE_RECORD_SIZE
}

//! Indirect dispatch records sized from the tree's root sum.
//!
//! Both records share one GPU-friendly 8-word layout so they can be
//! written into an indirect argument buffer as-is.

use bytemuck::{Pod, Zeroable};

/// Invocations per work group in every kernel pass.
pub const GROUP_WIDTH: u32 = 256;

/// Work groups needed to cover `count` invocations. Never zero, so a pass
/// always launches and its in-kernel guard does the trimming.
pub fn workgroup_count(count: u32) -> u32 {
    count.div_ceil(GROUP_WIDTH).max(1)
}

/// 8 x u32 indirect argument record.
///
/// Compute form: `[groups, 1, 1, 0, ...]` (x/y/z group counts).
/// Draw form: `[3, instances, 0, 0, ...]` (three domain vertices per
/// active leaf, one instance per leaf).
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Pod, Zeroable)]
pub struct DispatchRecord(pub [u32; 8]);

impl DispatchRecord {
    pub fn for_compute(count: u32) -> Self {
        DispatchRecord([workgroup_count(count), 1, 1, 0, 0, 0, 0, 0])
    }

    pub fn for_draw(leaf_count: u32) -> Self {
        DispatchRecord([3, leaf_count, 0, 0, 0, 0, 0, 0])
    }

    pub fn group_count(&self) -> u32 {
        self.0[0]
    }

    /// Guarded upper bound on invocations actually launched.
    pub fn thread_count(&self) -> u32 {
        self.0[0] * GROUP_WIDTH
    }

    pub fn vertex_count(&self) -> u32 {
        self.0[0]
    }

    pub fn instance_count(&self) -> u32 {
        self.0[1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

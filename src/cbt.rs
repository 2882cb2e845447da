//! Concurrent binary tree over a packed bit heap.
//!
//! The tree is stored as a binary heap of subtree sums on top of a leaf
//! bitfield. A node at depth `d` in a tree of maximum depth `D` owns a
//! `D - d + 1` bit field, which is exactly wide enough for the largest sum
//! its subtree can reach, so the whole structure fits in `2^(D+2)` bits.
//! Leaf bits are written with single atomic ops; the interior sums are
//! rebuilt by [`Cbt::reduce`] between kernel passes.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::dispatch::GROUP_WIDTH;
use crate::error::EngineError;

/// Deepest supported tree. The widest sum field (the root, `D + 1` bits)
/// must stay within a 31-bit read so a field never spans more than two
/// heap words.
pub const MAX_TREE_DEPTH: u32 = 30;

/// Heap coordinate of a tree node. The root is 1; the children of `k` are
/// `2k` and `2k + 1`, so the binary digits of `id` below the leading one
/// spell the root-to-node path.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Node {
    pub id: u32,
}

impl Node {
    pub const ROOT: Node = Node { id: 1 };

    pub fn depth(self) -> u32 {
        self.id.ilog2()
    }

    pub fn parent(self) -> Node {
        Node { id: self.id >> 1 }
    }

    pub fn left_child(self) -> Node {
        Node { id: self.id << 1 }
    }

    pub fn right_child(self) -> Node {
        Node {
            id: (self.id << 1) | 1,
        }
    }

    pub fn sibling(self) -> Node {
        Node { id: self.id ^ 1 }
    }

    pub fn right_sibling(self) -> Node {
        Node { id: self.id | 1 }
    }

    pub fn is_root(self) -> bool {
        self.id == 1
    }

    /// Left/right choice taken at `step` on the way down from the root,
    /// step 0 being the choice made at the root.
    pub fn path_bit(self, step: u32) -> u32 {
        (self.id >> (self.depth() - 1 - step)) & 1
    }
}

pub struct Cbt {
    max_depth: u32,
    heap: Vec<AtomicU32>,
}

impl Cbt {
    /// Allocates a tree of maximum depth `max_depth` seeded with the
    /// complete set of leaves at `init_depth`, sums already reduced.
    pub fn with_depth(max_depth: u32, init_depth: u32) -> Result<Self, EngineError> {
        if max_depth > MAX_TREE_DEPTH {
            return Err(EngineError::InvalidDepthRequest {
                requested: max_depth,
                min: 0,
                max: MAX_TREE_DEPTH,
            });
        }
        if init_depth > max_depth {
            return Err(EngineError::InvalidDepthRequest {
                requested: init_depth,
                min: 0,
                max: max_depth,
            });
        }

        let bits = 1u64 << (max_depth + 2);
        let words = bits.div_ceil(32) as usize;
        let mut heap = Vec::new();
        heap.try_reserve_exact(words)
            .map_err(|source| EngineError::AllocationFailure {
                bytes: words * 4,
                source,
            })?;
        heap.resize_with(words, || AtomicU32::new(0));

        let mut cbt = Cbt { max_depth, heap };
        cbt.reset_to_depth(init_depth);
        cbt.reduce();
        Ok(cbt)
    }

    /// Zeroes the heap in place and re-seeds the complete set of leaves at
    /// `depth`. Interior sums are stale until the next [`Cbt::reduce`].
    pub fn reset_to_depth(&mut self, depth: u32) {
        debug_assert!(depth <= self.max_depth);
        let d = self.max_depth;
        for word in self.heap.iter_mut() {
            *word.get_mut() = 0;
        }
        // depth marker, recoverable from the buffer alone as the lowest set
        // bit of word 0 (no sum field ever touches bits 0..=D)
        *self.heap[0].get_mut() = 1u32 << d;

        let stride = d - depth;
        if d >= 5 && stride < 5 {
            // seed bits recur within every bitfield word
            let mut pattern = 0u32;
            let mut bit = 0;
            while bit < 32 {
                pattern |= 1 << bit;
                bit += 1 << stride;
            }
            let first = 3usize << (d - 5);
            for word in first..(4usize << (d - 5)) {
                *self.heap[word].get_mut() = pattern;
            }
        } else {
            for id in (1u32 << depth)..(2u32 << depth) {
                let bit = (2u64 << d) + ((id as u64) << stride);
                *self.heap[(bit >> 5) as usize].get_mut() |= 1 << (bit & 31);
            }
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Maximum depth as encoded in the buffer itself.
    pub fn encoded_max_depth(&self) -> u32 {
        self.heap[0].load(Ordering::Relaxed).trailing_zeros()
    }

    pub fn heap_byte_size(&self) -> usize {
        self.heap.len() * 4
    }

    /// Number of active leaves. Valid after a reduction.
    pub fn node_count(&self) -> u32 {
        self.node_value(Node::ROOT)
    }

    /// Subtree sum stored for `node`. Valid after a reduction.
    pub fn node_value(&self, node: Node) -> u32 {
        let depth = node.depth();
        self.read_bits(self.node_bit_offset(node), self.max_depth - depth + 1)
    }

    /// Snapshot of the raw heap words, e.g. for upload to a GPU buffer.
    pub fn heap_words(&self) -> Vec<u32> {
        self.heap
            .iter()
            .map(|word| word.load(Ordering::Relaxed))
            .collect()
    }

    pub fn heap_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice::<u32, u8>(&self.heap_words()).to_vec()
    }

    /// Subdivides a leaf by activating its right child. The leaf's own bit
    /// doubles as the left child's bit, so a single atomic OR suffices.
    /// No-op at the depth ceiling; idempotent.
    pub fn split_node(&self, node: Node) {
        if node.depth() < self.max_depth {
            self.set_bitfield_bit(node.right_child());
        }
    }

    /// Coarsens a leaf pair by clearing the right sibling's bit. Both
    /// siblings resolve to the same bit, so concurrent merges of a pair
    /// collapse into one write. No-op at the root; idempotent.
    pub fn merge_node(&self, node: Node) {
        if !node.is_root() {
            self.clear_bitfield_bit(node.right_sibling());
        }
    }

    /// Finds the `rank`-th active leaf (left to right) by walking sums down
    /// from the root.
    pub fn decode_leaf(&self, mut rank: u32) -> Node {
        debug_assert!(rank < self.node_count());
        let mut node = Node::ROOT;
        while self.node_value(node) > 1 {
            let left = node.left_child();
            let left_value = self.node_value(left);
            if rank < left_value {
                node = left;
            } else {
                rank -= left_value;
                node = left.sibling();
            }
        }
        node
    }

    /// Inverse of [`Cbt::decode_leaf`]: the leaf's rank is the sum of every
    /// left sibling passed on the way back up.
    pub fn encode_leaf(&self, node: Node) -> u32 {
        let mut rank = 0;
        let mut n = node;
        while !n.is_root() {
            if n.id & 1 == 1 {
                rank += self.node_value(Node { id: n.id - 1 });
            }
            n = n.parent();
        }
        rank
    }

    /// Rebuilds every interior sum from the leaf bitfield. Each level is one
    /// parallel pass; the pass join is the barrier that orders it against
    /// the next level up. The bottom five levels come from a SWAR prepass
    /// over whole bitfield words.
    pub fn reduce(&mut self) {
        let d = self.max_depth;
        if d == 0 {
            return;
        }
        if d >= 5 {
            self.reduce_prepass();
            for level in (0..d - 5).rev() {
                self.reduce_level(level);
            }
        } else {
            for level in (0..d).rev() {
                self.reduce_level(level);
            }
        }
    }

    fn reduce_level(&self, level: u32) {
        let d = self.max_depth;
        let count = 1u32 << level;
        let groups = count.div_ceil(GROUP_WIDTH);
        (0..groups).into_par_iter().for_each(|group| {
            for lane in 0..GROUP_WIDTH {
                let i = group * GROUP_WIDTH + lane;
                if i >= count {
                    break;
                }
                let node = Node { id: count + i };
                let sum =
                    self.node_value(node.left_child()) + self.node_value(node.right_child());
                self.write_bits(self.node_bit_offset(node), d - level + 1, sum);
            }
        });
    }

    fn reduce_prepass(&self) {
        let units = 1u32 << (self.max_depth - 5); // one unit per 32-leaf word
        let groups = units.div_ceil(GROUP_WIDTH);
        (0..groups).into_par_iter().for_each(|group| {
            for lane in 0..GROUP_WIDTH {
                let unit = group * GROUP_WIDTH + lane;
                if unit >= units {
                    break;
                }
                self.prepass_unit(unit);
            }
        });
    }

    /// Sums one 32-leaf word pairwise in registers and scatters the results
    /// into the packed fields of levels `D-1 ..= D-5`.
    fn prepass_unit(&self, unit: u32) {
        let d = self.max_depth;
        let node_id = (unit << 5) + (1 << d); // first leaf handled by this unit
        let aligned_bit = (2u64 << d) + node_id as u64;
        let mut field = self.heap[(aligned_bit >> 5) as usize].load(Ordering::Relaxed);

        // level D-1: sixteen 2-bit sums fill one aligned word
        field = (field & 0x5555_5555) + ((field >> 1) & 0x5555_5555);
        self.heap[((aligned_bit - (1u64 << d)) >> 5) as usize].store(field, Ordering::Relaxed);

        // level D-2: eight 4-bit lanes compacted to 3-bit fields
        field = (field & 0x3333_3333) + ((field >> 2) & 0x3333_3333);
        let mut data = 0u32;
        for i in 0..8 {
            data |= (field >> i) & (0x7 << (3 * i));
        }
        self.write_bits(self.node_bit_offset(Node { id: node_id >> 2 }), 24, data);

        // level D-3: four 8-bit lanes to 4-bit fields
        field = (field & 0x0F0F_0F0F) + ((field >> 4) & 0x0F0F_0F0F);
        let mut data = 0u32;
        for i in 0..4 {
            data |= (field >> (4 * i)) & (0xF << (4 * i));
        }
        self.write_bits(self.node_bit_offset(Node { id: node_id >> 3 }), 16, data);

        // level D-4: two 16-bit lanes to 5-bit fields
        field = (field & 0x00FF_00FF) + ((field >> 8) & 0x00FF_00FF);
        let data = (field & 0x1F) | ((field >> 11) & (0x1F << 5));
        self.write_bits(self.node_bit_offset(Node { id: node_id >> 4 }), 10, data);

        // level D-5: the word's whole popcount in one 6-bit field
        field = (field & 0x0000_FFFF) + (field >> 16);
        self.write_bits(self.node_bit_offset(Node { id: node_id >> 5 }), 6, field);
    }

    fn node_bit_offset(&self, node: Node) -> u64 {
        let depth = node.depth();
        (2u64 << depth) + (node.id as u64) * ((self.max_depth - depth + 1) as u64)
    }

    /// Bit carrying `node`'s leaf representation: its leftmost descendant on
    /// the deepest level.
    fn bitfield_bit(&self, node: Node) -> u64 {
        (2u64 << self.max_depth) + ((node.id as u64) << (self.max_depth - node.depth()))
    }

    fn set_bitfield_bit(&self, node: Node) {
        let bit = self.bitfield_bit(node);
        self.heap[(bit >> 5) as usize].fetch_or(1 << (bit & 31), Ordering::Relaxed);
    }

    fn clear_bitfield_bit(&self, node: Node) {
        let bit = self.bitfield_bit(node);
        self.heap[(bit >> 5) as usize].fetch_and(!(1 << (bit & 31)), Ordering::Relaxed);
    }

    fn field_mask(width: u32) -> u32 {
        if width >= 32 {
            u32::MAX
        } else {
            (1 << width) - 1
        }
    }

    fn read_bits(&self, offset: u64, width: u32) -> u32 {
        let word = (offset >> 5) as usize;
        let bit = (offset & 31) as u32;
        let low = self.heap[word].load(Ordering::Relaxed) >> bit;
        let value = if bit + width > 32 {
            // field straddles into the next word
            let high = self.heap[word + 1].load(Ordering::Relaxed);
            low | (high << (32 - bit))
        } else {
            low
        };
        value & Self::field_mask(width)
    }

    /// Masked field write. Concurrent writers of distinct fields sharing a
    /// word interleave safely through the AND/OR pair; the caller must not
    /// race writers of the same field.
    fn write_bits(&self, offset: u64, width: u32, value: u32) {
        let word = (offset >> 5) as usize;
        let bit = (offset & 31) as u32;
        let mask = Self::field_mask(width);
        self.heap[word].fetch_and(!(mask << bit), Ordering::Relaxed);
        self.heap[word].fetch_or((value & mask) << bit, Ordering::Relaxed);
        if bit + width > 32 {
            let spill = bit + width - 32;
            let high_mask = Self::field_mask(spill);
            self.heap[word + 1].fetch_and(!high_mask, Ordering::Relaxed);
            self.heap[word + 1].fetch_or((value >> (32 - bit)) & high_mask, Ordering::Relaxed);
        }
    }
}

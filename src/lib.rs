//! Adaptive subdivision of a triangle or square domain, driven by a moving
//! target point.
//!
//! The topology lives in a concurrent binary tree ([`cbt::Cbt`]): a packed
//! heap of subtree sums over a leaf bitfield, mutated by single atomic bit
//! writes and re-summed by a parallel reduction. Leaf geometry is never
//! stored; [`leb`] decodes it from the leaf's heap index by longest-edge
//! bisection. [`engine::Subdivision`] ties the pieces into a frame loop of
//! alternating split and merge passes, with [`dispatch`] sizing each pass
//! from the previous frame's leaf count.

pub mod cbt;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod leb;

pub use cbt::{Cbt, Node, MAX_TREE_DEPTH};
pub use dispatch::{DispatchRecord, GROUP_WIDTH};
pub use engine::{Phase, RefinementStrategy, Subdivision, SubdivisionParams, TargetRefinement};
pub use error::EngineError;
pub use leb::{LeafTransform, Mode, Winding};

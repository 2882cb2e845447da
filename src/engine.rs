//! Frame orchestration: one update is a sized kernel pass (split or
//! merge, alternating), a sum reduction, and a dispatch record refresh.

use glam::Vec2;
use rayon::prelude::*;

use crate::cbt::{Cbt, Node};
use crate::dispatch::{DispatchRecord, GROUP_WIDTH};
use crate::error::EngineError;
use crate::leb::{self, Mode};

/// Per-leaf refinement decision. Implementations must be pure with respect
/// to one kernel pass: every invocation sees the same tree snapshot, and a
/// sibling pair only merges when both cells agree.
pub trait RefinementStrategy: Send + Sync {
    fn want_split(&self, cell: &[Vec2; 3], target: Vec2) -> bool;
    fn want_merge(&self, cell: &[Vec2; 3], target: Vec2) -> bool;
}

/// Refine toward a point: split the cell holding the target, merge cells
/// the target has left.
pub struct TargetRefinement;

impl RefinementStrategy for TargetRefinement {
    fn want_split(&self, cell: &[Vec2; 3], target: Vec2) -> bool {
        leb::triangle_contains(cell, target)
    }

    fn want_merge(&self, cell: &[Vec2; 3], target: Vec2) -> bool {
        !leb::triangle_contains(cell, target)
    }
}

/// Direction of the next kernel pass. Splits and merges never share a
/// pass, so a cell cannot split and collapse within one epoch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Split,
    Merge,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Split => Phase::Merge,
            Phase::Merge => Phase::Split,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SubdivisionParams {
    pub max_depth: u32,
    pub init_depth: u32,
    pub mode: Mode,
    pub target: Vec2,
}

impl Default for SubdivisionParams {
    fn default() -> Self {
        SubdivisionParams {
            max_depth: 10,
            init_depth: 1,
            mode: Mode::Triangle,
            target: Vec2::new(0.49951, 0.41204),
        }
    }
}

pub struct Subdivision {
    cbt: Cbt,
    params: SubdivisionParams,
    phase: Phase,
    strategy: Box<dyn RefinementStrategy>,
    update_record: DispatchRecord,
    draw_record: DispatchRecord,
}

impl Subdivision {
    pub fn new(params: SubdivisionParams) -> Result<Self, EngineError> {
        Self::with_strategy(params, Box::new(TargetRefinement))
    }

    pub fn with_strategy(
        params: SubdivisionParams,
        strategy: Box<dyn RefinementStrategy>,
    ) -> Result<Self, EngineError> {
        check_mode_depth(params.mode, params.init_depth, params.max_depth)?;
        let cbt = Cbt::with_depth(params.max_depth, params.init_depth)?;
        let count = cbt.node_count();
        log::info!(
            "subdivision ready: max depth {}, {} leaves, {} heap bytes",
            params.max_depth,
            count,
            cbt.heap_byte_size()
        );
        Ok(Subdivision {
            cbt,
            params,
            phase: Phase::Split,
            strategy,
            update_record: DispatchRecord::for_compute(count),
            draw_record: DispatchRecord::for_draw(count),
        })
    }

    /// Runs one epoch: the phase's kernel over every active leaf, then the
    /// reduction, then the record refresh, then the phase flip.
    pub fn update(&mut self) {
        let count = self.cbt.node_count();
        let groups = self.update_record.group_count();
        let phase = self.phase;
        let mode = self.params.mode;
        let target = self.params.target;
        let merge_floor = match mode {
            Mode::Triangle => 1,
            Mode::Square => 2,
        };

        {
            let cbt = &self.cbt;
            let strategy = &*self.strategy;
            (0..groups).into_par_iter().for_each(|group| {
                for lane in 0..GROUP_WIDTH {
                    let thread = group * GROUP_WIDTH + lane;
                    if thread >= count {
                        break;
                    }
                    let node = cbt.decode_leaf(thread);
                    match phase {
                        Phase::Split => {
                            let cell = leb::decode_vertices(node, mode);
                            if strategy.want_split(&cell, target) {
                                cbt.split_node(node);
                            }
                        }
                        Phase::Merge => {
                            // the two root triangles of a square never
                            // coalesce into the non-triangular square
                            if node.depth() < merge_floor {
                                continue;
                            }
                            let sibling = node.sibling();
                            if cbt.node_value(sibling) != 1 {
                                continue;
                            }
                            let cell = leb::decode_vertices(node, mode);
                            let sibling_cell = leb::decode_vertices(sibling, mode);
                            if strategy.want_merge(&cell, target)
                                && strategy.want_merge(&sibling_cell, target)
                            {
                                cbt.merge_node(node);
                            }
                        }
                    }
                }
            });
        }

        self.cbt.reduce();
        self.refresh_records();
        self.phase = phase.next();
        log::debug!(
            "{:?} pass: {} -> {} leaves",
            phase,
            count,
            self.cbt.node_count()
        );
    }

    /// Moves the refinement target. Takes effect next update; the topology
    /// is untouched.
    pub fn set_target(&mut self, target: Vec2) {
        self.params.target = target;
    }

    /// Swaps the root domain and resets the topology to the seed depth.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), EngineError> {
        check_mode_depth(mode, self.params.init_depth, self.params.max_depth)?;
        if mode != self.params.mode {
            self.params.mode = mode;
            self.reset();
        }
        Ok(())
    }

    /// Rebuilds the tree with a new depth ceiling. The old tree stays live
    /// until the replacement allocates, so a failure leaves every query
    /// answering as before.
    pub fn set_max_depth(&mut self, max_depth: u32) -> Result<(), EngineError> {
        check_mode_depth(self.params.mode, self.params.init_depth, max_depth)?;
        self.cbt = Cbt::with_depth(max_depth, self.params.init_depth)?;
        self.params.max_depth = max_depth;
        self.phase = Phase::Split;
        self.refresh_records();
        log::info!(
            "rebuilt at max depth {max_depth}, {} heap bytes",
            self.cbt.heap_byte_size()
        );
        Ok(())
    }

    pub fn set_strategy(&mut self, strategy: Box<dyn RefinementStrategy>) {
        self.strategy = strategy;
    }

    /// Back to the seed topology, keeping the allocation.
    pub fn reset(&mut self) {
        self.cbt.reset_to_depth(self.params.init_depth);
        self.cbt.reduce();
        self.phase = Phase::Split;
        self.refresh_records();
        log::info!(
            "reset to depth {} ({} leaves)",
            self.params.init_depth,
            self.cbt.node_count()
        );
    }

    fn refresh_records(&mut self) {
        let count = self.cbt.node_count();
        self.update_record = DispatchRecord::for_compute(count);
        self.draw_record = DispatchRecord::for_draw(count);
    }

    pub fn node_count(&self) -> u32 {
        self.cbt.node_count()
    }

    pub fn heap_byte_size(&self) -> usize {
        self.cbt.heap_byte_size()
    }

    pub fn max_depth(&self) -> u32 {
        self.params.max_depth
    }

    pub fn mode(&self) -> Mode {
        self.params.mode
    }

    pub fn target(&self) -> Vec2 {
        self.params.target
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn update_record(&self) -> DispatchRecord {
        self.update_record
    }

    pub fn draw_record(&self) -> DispatchRecord {
        self.draw_record
    }

    pub fn cbt(&self) -> &Cbt {
        &self.cbt
    }

    /// Active leaves in rank order.
    pub fn leaf_nodes(&self) -> Vec<Node> {
        (0..self.cbt.node_count())
            .map(|rank| self.cbt.decode_leaf(rank))
            .collect()
    }

    /// Domain-space corners of every active leaf, for the render pass.
    pub fn leaf_geometry(&self) -> Vec<[Vec2; 3]> {
        self.leaf_nodes()
            .iter()
            .map(|&node| leb::decode_vertices(node, self.params.mode))
            .collect()
    }
}

fn check_mode_depth(mode: Mode, init_depth: u32, max_depth: u32) -> Result<(), EngineError> {
    if mode == Mode::Square && init_depth < 1 {
        return Err(EngineError::InvalidDepthRequest {
            requested: init_depth,
            min: 1,
            max: max_depth,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::MAX_TREE_DEPTH;

    struct Always {
        split: bool,
        merge: bool,
    }

    impl RefinementStrategy for Always {
        fn want_split(&self, _cell: &[Vec2; 3], _target: Vec2) -> bool {
            self.split
        }

        fn want_merge(&self, _cell: &[Vec2; 3], _target: Vec2) -> bool {
            self.merge
        }
    }

    fn leaf_ids(subdivision: &Subdivision) -> Vec<u32> {
        subdivision.leaf_nodes().iter().map(|n| n.id).collect()
    }

    fn check_sums(subdivision: &Subdivision) {
        let cbt = subdivision.cbt();
        for depth in 0..subdivision.max_depth() {
            for id in (1u32 << depth)..(2u32 << depth) {
                let node = Node { id };
                assert_eq!(
                    cbt.node_value(node),
                    cbt.node_value(node.left_child()) + cbt.node_value(node.right_child()),
                    "sum broken at node {id}"
                );
            }
        }
    }

    #[test]
    fn split_pass_refines_the_cell_holding_the_target() {
        let mut subdivision = Subdivision::new(SubdivisionParams {
            target: Vec2::new(0.25, 0.1),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(subdivision.node_count(), 2);
        assert_eq!(subdivision.phase(), Phase::Split);

        subdivision.update();
        // only the lower-right half holds (0.25, 0.1)
        assert_eq!(subdivision.node_count(), 3);
        assert_eq!(subdivision.phase(), Phase::Merge);
        assert_eq!(subdivision.draw_record().instance_count(), 3);
        check_sums(&subdivision);
    }

    #[test]
    fn tree_follows_a_moving_target() {
        let mut subdivision = Subdivision::new(SubdivisionParams {
            target: Vec2::new(0.25, 0.1),
            ..Default::default()
        })
        .unwrap();
        for _ in 0..8 {
            subdivision.update();
        }
        let refined = subdivision.node_count();
        assert!(refined > 3);

        subdivision.set_target(Vec2::new(0.9, 0.05));
        for _ in 0..40 {
            subdivision.update();
        }
        let cells = subdivision.leaf_geometry();
        assert!(cells
            .iter()
            .any(|cell| leb::triangle_contains(cell, Vec2::new(0.9, 0.05))));
        check_sums(&subdivision);
        assert_eq!(
            subdivision.draw_record().instance_count(),
            subdivision.node_count()
        );
    }

    #[test]
    fn constant_refinement_alternation_is_stable() {
        let mut subdivision = Subdivision::new(SubdivisionParams {
            target: Vec2::new(0.3, 0.2),
            ..Default::default()
        })
        .unwrap();
        for _ in 0..5 {
            subdivision.update();
        }
        if subdivision.phase() == Phase::Merge {
            subdivision.update();
        }

        subdivision.set_strategy(Box::new(Always {
            split: true,
            merge: true,
        }));
        let before = leaf_ids(&subdivision);
        subdivision.update(); // splits every leaf
        assert_eq!(subdivision.node_count() as usize, 2 * before.len());
        subdivision.update(); // merges every new pair back
        assert_eq!(leaf_ids(&subdivision), before);
    }

    #[test]
    fn square_roots_never_merge_together() {
        let mut subdivision = Subdivision::with_strategy(
            SubdivisionParams {
                mode: Mode::Square,
                ..Default::default()
            },
            Box::new(Always {
                split: false,
                merge: true,
            }),
        )
        .unwrap();
        assert_eq!(subdivision.node_count(), 2);
        subdivision.update(); // split pass, nothing wants to
        subdivision.update(); // merge pass held off by the depth floor
        assert_eq!(subdivision.node_count(), 2);
    }

    #[test]
    fn square_mode_requires_an_initial_split() {
        let result = Subdivision::new(SubdivisionParams {
            mode: Mode::Square,
            init_depth: 0,
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(EngineError::InvalidDepthRequest { min: 1, .. })
        ));
    }

    #[test]
    fn failed_depth_change_keeps_the_old_tree() {
        let mut subdivision = Subdivision::new(SubdivisionParams::default()).unwrap();
        subdivision.update();
        let count = subdivision.node_count();

        assert!(subdivision.set_max_depth(MAX_TREE_DEPTH + 1).is_err());
        assert_eq!(subdivision.node_count(), count);
        assert_eq!(subdivision.max_depth(), 10);
    }

    #[test]
    fn mode_switch_resets_the_topology() {
        let mut subdivision = Subdivision::new(SubdivisionParams {
            target: Vec2::new(0.25, 0.1),
            ..Default::default()
        })
        .unwrap();
        for _ in 0..4 {
            subdivision.update();
        }
        assert!(subdivision.node_count() > 2);

        subdivision.set_mode(Mode::Square).unwrap();
        assert_eq!(subdivision.node_count(), 2);
        assert_eq!(subdivision.phase(), Phase::Split);
        assert_eq!(subdivision.draw_record().instance_count(), 2);
    }

    #[test]
    fn initial_depth_may_equal_max_depth() {
        let subdivision = Subdivision::new(SubdivisionParams {
            max_depth: 6,
            init_depth: 6,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(subdivision.node_count(), 64);
        assert_eq!(subdivision.draw_record().instance_count(), 64);
        assert_eq!(subdivision.update_record().group_count(), 1);
    }

    #[test]
    fn records_track_counts_across_updates() {
        let mut subdivision = Subdivision::new(SubdivisionParams {
            max_depth: 12,
            init_depth: 10,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(subdivision.node_count(), 1024);
        assert_eq!(subdivision.update_record().group_count(), 4);
        assert_eq!(subdivision.draw_record().instance_count(), 1024);

        subdivision.update();
        assert_eq!(
            subdivision.draw_record().instance_count(),
            subdivision.node_count()
        );
        assert_eq!(
            subdivision.update_record().group_count(),
            subdivision.node_count().div_ceil(GROUP_WIDTH)
        );
        check_sums(&subdivision);
    }
}

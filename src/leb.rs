//! Longest-edge bisection decoding.
//!
//! A heap index doubles as a bisection path: every bit below the leading
//! one picks a half at one bisection step. Decoding folds the per-bit
//! splitting matrices into a single 3x3 barycentric transform, so leaves
//! are materialized on demand and nothing is stored per cell.

use glam::{Mat3, Vec2, Vec3};

use crate::cbt::Node;

/// Domain covered by the root of the tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Unit right triangle (0,1), (0,0), (1,0).
    Triangle,
    /// Unit square as two root triangles sharing the diagonal; the first
    /// path bit selects the triangle, so square trees need depth >= 1.
    Square,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Winding {
    Ccw,
    Cw,
}

/// Barycentric transform from root corners to a leaf's corners.
#[derive(Clone, Copy, Debug)]
pub struct LeafTransform {
    pub matrix: Mat3,
    pub winding: Winding,
}

/// One bisection step: each row gives a child corner as barycentric
/// weights of the parent corners. Bit 0 keeps the half at `v0`, bit 1 the
/// half at `v2`; both children share the midpoint of the longest edge
/// `v0-v2` as their new `v1`.
pub fn splitting_matrix(bit: u32) -> Mat3 {
    let b = bit as f32;
    let c = 1.0 - b;
    Mat3::from_cols(
        Vec3::new(c, 0.5, 0.0),
        Vec3::new(b, 0.0, c),
        Vec3::new(0.0, 0.5, b),
    )
}

/// Folds `node`'s path into a leaf transform. Deeper steps multiply on the
/// left, so `decode(child) == splitting_matrix(bit) * decode(parent)`.
pub fn decode(node: Node, mode: Mode) -> LeafTransform {
    let depth = node.depth();
    let skip = match mode {
        Mode::Triangle => 0,
        Mode::Square => {
            debug_assert!(depth >= 1, "square trees start below the root");
            1
        }
    };
    let mut matrix = Mat3::IDENTITY;
    for step in skip..depth {
        matrix = splitting_matrix(node.path_bit(step)) * matrix;
    }
    let winding = if (depth - skip) & 1 == 0 {
        Winding::Ccw
    } else {
        Winding::Cw
    };
    LeafTransform { matrix, winding }
}

/// Domain-space corners of `node`'s cell.
pub fn decode_vertices(node: Node, mode: Mode) -> [Vec2; 3] {
    let (xs, ys) = root_attributes(node, mode);
    let transform = decode(node, mode);
    let x = transform.matrix * xs;
    let y = transform.matrix * ys;
    [
        Vec2::new(x.x, y.x),
        Vec2::new(x.y, y.y),
        Vec2::new(x.z, y.z),
    ]
}

// per-corner attribute arrays of the root triangle owning `node`
fn root_attributes(node: Node, mode: Mode) -> (Vec3, Vec3) {
    match mode {
        Mode::Triangle => (Vec3::new(0.0, 0.0, 1.0), Vec3::new(1.0, 0.0, 0.0)),
        Mode::Square => {
            if node.path_bit(0) == 0 {
                (Vec3::new(0.0, 0.0, 1.0), Vec3::new(1.0, 0.0, 0.0))
            } else {
                (Vec3::new(1.0, 1.0, 0.0), Vec3::new(0.0, 1.0, 1.0))
            }
        }
    }
}

/// Point-in-triangle test that accepts both windings; cells alternate
/// orientation every bisection.
pub fn triangle_contains(triangle: &[Vec2; 3], point: Vec2) -> bool {
    let w0 = (triangle[1] - triangle[0]).perp_dot(point - triangle[0]);
    let w1 = (triangle[2] - triangle[1]).perp_dot(point - triangle[1]);
    let w2 = (triangle[0] - triangle[2]).perp_dot(point - triangle[2]);
    (w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0) || (w0 <= 0.0 && w1 <= 0.0 && w2 <= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_area(triangle: &[Vec2; 3]) -> f32 {
        0.5 * (triangle[1] - triangle[0]).perp_dot(triangle[2] - triangle[0])
    }

    #[test]
    fn child_decode_composes_with_the_splitting_matrix() {
        for mode in [Mode::Triangle, Mode::Square] {
            let first = match mode {
                Mode::Triangle => 1u32,
                Mode::Square => 2,
            };
            for id in first..64 {
                let parent = Node { id };
                for bit in 0..2u32 {
                    let child = Node { id: (id << 1) | bit };
                    let got = decode(child, mode).matrix;
                    let expected = splitting_matrix(bit) * decode(parent, mode).matrix;
                    assert!(
                        got.abs_diff_eq(expected, 1e-6),
                        "id {id} bit {bit} ({mode:?})"
                    );
                }
            }
        }
    }

    #[test]
    fn square_roots_cover_the_unit_square() {
        let lo = decode_vertices(Node { id: 0b10 }, Mode::Square);
        let hi = decode_vertices(Node { id: 0b11 }, Mode::Square);
        assert_eq!(
            lo,
            [Vec2::new(0.0, 1.0), Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0)]
        );
        assert_eq!(
            hi,
            [Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0), Vec2::new(0.0, 1.0)]
        );
    }

    #[test]
    fn depth_slices_tile_the_domain() {
        for (mode, domain_area) in [(Mode::Triangle, 0.5f32), (Mode::Square, 1.0)] {
            let mut total = 0.0f32;
            for id in (1u32 << 6)..(1u32 << 7) {
                let cell = decode_vertices(Node { id }, mode);
                total += signed_area(&cell).abs();
            }
            assert!(
                (total - domain_area).abs() < 1e-4,
                "{mode:?} tiles {total}"
            );
        }
    }

    #[test]
    fn sibling_cells_are_distinct() {
        for id in (1u32 << 4)..(1u32 << 5) {
            let left = decode_vertices(Node { id: id << 1 }, Mode::Triangle);
            let right = decode_vertices(Node { id: (id << 1) | 1 }, Mode::Triangle);
            assert_ne!(left, right, "children of {id}");
        }
    }

    #[test]
    fn winding_tracks_cell_orientation() {
        for id in (1u32 << 4)..(1u32 << 6) {
            let node = Node { id };
            let cell = decode_vertices(node, Mode::Triangle);
            let area = signed_area(&cell);
            match decode(node, Mode::Triangle).winding {
                Winding::Ccw => assert!(area > 0.0, "id {id}"),
                Winding::Cw => assert!(area < 0.0, "id {id}"),
            }
        }
    }

    #[test]
    fn contains_is_orientation_agnostic() {
        let ccw = [Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(0.0, 1.0)];
        let cw = [ccw[0], ccw[2], ccw[1]];
        let inside = Vec2::new(0.25, 0.25);
        let outside = Vec2::new(0.75, 0.75);
        assert!(triangle_contains(&ccw, inside));
        assert!(triangle_contains(&cw, inside));
        assert!(!triangle_contains(&ccw, outside));
        assert!(!triangle_contains(&cw, outside));
    }
}

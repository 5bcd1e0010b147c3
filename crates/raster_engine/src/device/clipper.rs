//! Homogeneous clipping and clip-flag computation
//!
//! Vertices carry a six-bit frustum summary plus a finite bit. A primitive
//! whose vertices all share an outside bit is culled before clipping; one
//! with any outside bit is clipped plane by plane in a fixed order (±x, ±y,
//! then the [0, w] depth range) using Sutherland-Hodgman traversal. Each
//! crossed plane can add at most one vertex per edge, bounded overall by the
//! polygon's in-place capacity.

use super::primitive::{ClipFlags, Polygon};
use crate::foundation::math::Vec4;
use crate::pipeline::constants::MAX_CLIPPED_VERTICES;
use arrayvec::ArrayVec;

/// Computes the clip-flag summary of one clip-space position
pub fn compute_clip_flags(p: Vec4) -> ClipFlags {
    let mut flags = ClipFlags::empty();
    if p.x > p.w {
        flags |= ClipFlags::MAX_X;
    }
    if p.y > p.w {
        flags |= ClipFlags::MAX_Y;
    }
    if p.z > p.w {
        flags |= ClipFlags::MAX_Z;
    }
    if p.x < -p.w {
        flags |= ClipFlags::MIN_X;
    }
    if p.y < -p.w {
        flags |= ClipFlags::MIN_Y;
    }
    if p.z < 0.0 {
        flags |= ClipFlags::MIN_Z;
    }
    if p.x.is_finite() && p.y.is_finite() && p.z.is_finite() && p.w.is_finite() {
        flags |= ClipFlags::FINITE;
    }
    flags
}

type Scratch = ArrayVec<[f32; 4], MAX_CLIPPED_VERTICES>;

/// Signed distance of a vertex from one frustum plane (≥ 0 is inside)
fn plane_distance(v: &[f32; 4], plane: ClipFlags) -> f32 {
    let [x, y, z, w] = *v;
    match plane {
        ClipFlags::MIN_X => x + w,
        ClipFlags::MAX_X => w - x,
        ClipFlags::MIN_Y => y + w,
        ClipFlags::MAX_Y => w - y,
        ClipFlags::MIN_Z => z,
        ClipFlags::MAX_Z => w - z,
        _ => unreachable!("not a clip plane"),
    }
}

fn lerp_vertex(a: &[f32; 4], b: &[f32; 4], t: f32) -> [f32; 4] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

fn clip_against(input: &Scratch, output: &mut Scratch, plane: ClipFlags) {
    output.clear();
    let n = input.len();
    for i in 0..n {
        let current = &input[i];
        let next = &input[(i + 1) % n];
        let d0 = plane_distance(current, plane);
        let d1 = plane_distance(next, plane);

        if d0 >= 0.0 {
            if output.is_full() {
                return;
            }
            output.push(*current);
        }
        if (d0 >= 0.0) != (d1 >= 0.0) {
            if output.is_full() {
                return;
            }
            let t = d0 / (d0 - d1);
            output.push(lerp_vertex(current, next, t));
        }
    }
}

/// Clips `polygon` against every plane named in `crossed`. Returns whether a
/// rasterizable polygon (three or more vertices) remains.
pub fn clip(polygon: &mut Polygon, crossed: ClipFlags) -> bool {
    let mut current: Scratch = polygon.vertices().iter().copied().collect();
    let mut next = Scratch::new();

    for plane in [
        ClipFlags::MIN_X,
        ClipFlags::MAX_X,
        ClipFlags::MIN_Y,
        ClipFlags::MAX_Y,
        ClipFlags::MIN_Z,
        ClipFlags::MAX_Z,
    ] {
        if !crossed.contains(plane) {
            continue;
        }
        clip_against(&current, &mut next, plane);
        std::mem::swap(&mut current, &mut next);
        if current.len() < 3 {
            polygon.count = 0;
            return false;
        }
    }

    *polygon = Polygon::from_slice(&current);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_of(x: f32, y: f32, z: f32, w: f32) -> ClipFlags {
        compute_clip_flags(Vec4::new(x, y, z, w))
    }

    #[test]
    fn test_inside_vertex_is_finite_only() {
        assert_eq!(flags_of(0.0, 0.0, 0.5, 1.0), ClipFlags::FINITE);
    }

    #[test]
    fn test_outside_bits() {
        assert_eq!(
            flags_of(2.0, 0.0, 0.5, 1.0),
            ClipFlags::FINITE | ClipFlags::MAX_X
        );
        assert_eq!(
            flags_of(0.0, -3.0, -0.5, 1.0),
            ClipFlags::FINITE | ClipFlags::MIN_Y | ClipFlags::MIN_Z
        );
        assert!(!flags_of(f32::NAN, 0.0, 0.0, 1.0).contains(ClipFlags::FINITE));
    }

    #[test]
    fn test_fully_inside_triangle_is_untouched() {
        let mut polygon = Polygon::from_slice(&[
            [-0.5, -0.5, 0.2, 1.0],
            [0.5, -0.5, 0.2, 1.0],
            [0.0, 0.5, 0.2, 1.0],
        ]);
        assert!(clip(&mut polygon, ClipFlags::empty()));
        assert_eq!(polygon.vertices().len(), 3);
    }

    #[test]
    fn test_clip_adds_vertices_on_crossed_plane() {
        // One vertex far out the +x plane.
        let mut polygon = Polygon::from_slice(&[
            [-0.5, -0.5, 0.2, 1.0],
            [3.0, 0.0, 0.2, 1.0],
            [-0.5, 0.5, 0.2, 1.0],
        ]);
        assert!(clip(&mut polygon, ClipFlags::MAX_X));
        assert_eq!(polygon.vertices().len(), 4);
        for v in polygon.vertices() {
            assert!(v[0] <= v[3] + 1e-4, "vertex {v:?} outside +x plane");
        }
    }

    #[test]
    fn test_fully_outside_after_clip_reports_empty() {
        let mut polygon = Polygon::from_slice(&[
            [2.0, 0.0, 0.2, 1.0],
            [3.0, 0.0, 0.2, 1.0],
            [2.5, 1.0, 0.2, 1.0],
        ]);
        assert!(!clip(&mut polygon, ClipFlags::MAX_X));
        assert_eq!(polygon.vertices().len(), 0);
    }

    #[test]
    fn test_clipped_output_stays_in_frustum() {
        // A large triangle crossing several planes at once.
        let mut polygon = Polygon::from_slice(&[
            [-4.0, -4.0, -1.0, 1.0],
            [4.0, -4.0, 2.0, 1.0],
            [0.0, 4.0, 0.5, 1.0],
        ]);
        let crossed = ClipFlags::MIN_X
            | ClipFlags::MAX_X
            | ClipFlags::MIN_Y
            | ClipFlags::MAX_Y
            | ClipFlags::MIN_Z
            | ClipFlags::MAX_Z;
        assert!(clip(&mut polygon, crossed));
        assert!(polygon.vertices().len() >= 3);
        assert!(polygon.vertices().len() <= MAX_CLIPPED_VERTICES);
        let eps = 1e-4;
        for v in polygon.vertices() {
            let [x, y, z, w] = *v;
            assert!(x >= -w - eps && x <= w + eps);
            assert!(y >= -w - eps && y <= w + eps);
            assert!(z >= -eps && z <= w + eps);
        }
    }
}

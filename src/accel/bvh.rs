//! SAH-binned BVH over instance bounds.
//!
//! Produces a flat node array for GPU upload. Leaves index into a
//! reordered primitive list; primitives themselves are never moved.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::util::Aabb;

/// Number of SAH bins per axis.
const NUM_BINS: usize = 12;

const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Leaves never exceed this many instances.
const MAX_LEAF_SIZE: usize = 2;

/// GPU BVH node (32 bytes).
///
/// Internal node: `left_or_first` = left child index, `count` = 0; the
/// right child follows the left one.
/// Leaf node: `left_or_first` = first entry in the primitive list, `count` > 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    fn leaf(bounds: &Aabb, first: usize, count: usize) -> Self {
        Self {
            aabb_min: bounds.min.to_array(),
            left_or_first: first as u32,
            aabb_max: bounds.max.to_array(),
            count: count as u32,
        }
    }

    fn internal(bounds: &Aabb, left: usize) -> Self {
        Self {
            aabb_min: bounds.min.to_array(),
            left_or_first: left as u32,
            aabb_max: bounds.max.to_array(),
            count: 0,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// Built hierarchy.
#[derive(Debug, Clone, Default)]
pub struct Bvh {
    /// Flat node array, index 0 = root.
    pub nodes: Vec<BvhNode>,
    /// Primitive indices in leaf order.
    pub prim_indices: Vec<u32>,
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

/// Build a BVH over primitive bounds.
///
/// Empty input yields a single empty leaf so kernels always find a root.
#[tracing::instrument(skip_all, fields(prim_count = bounds.len()))]
pub fn build_bvh(bounds: &[Aabb]) -> Bvh {
    let n = bounds.len();
    if n == 0 {
        return Bvh {
            nodes: vec![BvhNode::zeroed()],
            prim_indices: vec![],
        };
    }

    let centroids: Vec<Vec3> = bounds.iter().map(Aabb::centroid).collect();
    let mut indices: Vec<u32> = (0..n as u32).collect();
    let mut nodes: Vec<BvhNode> = Vec::with_capacity(2 * n);
    nodes.push(BvhNode::zeroed());

    struct Task {
        node_idx: usize,
        start: usize,
        end: usize,
    }

    let mut stack = vec![Task { node_idx: 0, start: 0, end: n }];

    while let Some(Task { node_idx, start, end }) = stack.pop() {
        let count = end - start;

        let mut node_bounds = Aabb::EMPTY;
        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            node_bounds.grow(&bounds[idx as usize]);
            centroid_bounds.grow_point(centroids[idx as usize]);
        }

        if count <= MAX_LEAF_SIZE {
            nodes[node_idx] = BvhNode::leaf(&node_bounds, start, count);
            continue;
        }

        let split = find_best_split(&indices[start..end], bounds, &centroids, &centroid_bounds);
        let leaf_cost = count as f32 * INTERSECT_COST * node_bounds.area();

        let mid = match split {
            Some((axis, pos, cost)) if cost < leaf_cost => {
                start + partition(&mut indices[start..end], |&idx| {
                    centroids[idx as usize][axis] < pos
                })
            }
            // Coincident centroids: an even split still bounds leaf size.
            _ => (start + end) / 2,
        };
        let mid = if mid == start || mid == end { (start + end) / 2 } else { mid };

        let left = nodes.len();
        nodes.push(BvhNode::zeroed());
        nodes.push(BvhNode::zeroed());
        nodes[node_idx] = BvhNode::internal(&node_bounds, left);

        stack.push(Task { node_idx: left + 1, start: mid, end });
        stack.push(Task { node_idx: left, start, end: mid });
    }

    Bvh {
        nodes,
        prim_indices: indices,
    }
}

/// Binned SAH split search across all axes: (axis, position, cost).
fn find_best_split(
    indices: &[u32],
    bounds: &[Aabb],
    centroids: &[Vec3],
    centroid_bounds: &Aabb,
) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32, f32)> = None;

    for axis in 0..3 {
        let lo = centroid_bounds.min[axis];
        let extent = centroid_bounds.max[axis] - lo;
        if extent < 1e-8 {
            continue;
        }

        let mut bins = [Bin { bounds: Aabb::EMPTY, count: 0 }; NUM_BINS];
        let inv_extent = NUM_BINS as f32 / extent;
        for &idx in indices {
            let bin = ((centroids[idx as usize][axis] - lo) * inv_extent) as usize;
            let bin = bin.min(NUM_BINS - 1);
            bins[bin].bounds.grow(&bounds[idx as usize]);
            bins[bin].count += 1;
        }

        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            let cost = TRAVERSAL_COST
                + INTERSECT_COST
                    * (left_count[i - 1] as f32 * left_area[i - 1]
                        + sweep_count as f32 * sweep.area());
            if best.map_or(true, |(_, _, c)| cost < c) {
                best = Some((axis, lo + (i as f32 / NUM_BINS as f32) * extent, cost));
            }
        }
    }

    best
}

/// In-place partition; returns the number of elements matching `pred`.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(x: f32) -> Aabb {
        Aabb::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn test_empty_bvh() {
        let bvh = build_bvh(&[]);
        assert_eq!(bvh.nodes.len(), 1);
        assert!(bvh.prim_indices.is_empty());
    }

    #[test]
    fn test_single_leaf() {
        let bvh = build_bvh(&[unit_box(0.0)]);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 1);
    }

    #[test]
    fn test_spread_instances_build_tree() {
        let boxes: Vec<Aabb> = (0..50).map(|i| unit_box(i as f32 * 3.0)).collect();
        let bvh = build_bvh(&boxes);
        assert!(bvh.nodes.len() > 1);

        let mut sorted = bvh.prim_indices.clone();
        sorted.sort();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());

        let root = &bvh.nodes[0];
        assert_eq!(root.aabb_min[0], 0.0);
        assert_eq!(root.aabb_max[0], 148.0);

        // Every primitive is referenced by exactly one leaf.
        let covered: u32 = bvh.nodes.iter().filter(|n| n.is_leaf()).map(|n| n.count).sum();
        assert_eq!(covered, 50);
    }

    #[test]
    fn test_coincident_instances_still_split() {
        let boxes = vec![unit_box(0.0); 9];
        let bvh = build_bvh(&boxes);
        assert!(bvh
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .all(|n| n.count as usize <= MAX_LEAF_SIZE));
    }
}

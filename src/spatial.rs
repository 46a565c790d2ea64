use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::primitives::FVal;

/// A labeled point in the plane. The label is the owning registry's index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: FVal,
    pub y: FVal,
    pub label: u32,
}

impl Point {
    pub fn new(x: FVal, y: FVal, label: u32) -> Self {
        Self { x, y, label }
    }

    /// Squared euclidean distance; all comparisons happen on squares.
    pub fn dist2(&self, x: FVal, y: FVal) -> FVal {
        let dx = self.x - x;
        let dy = self.y - y;
        dx * dx + dy * dy
    }
}

struct Node {
    point: Point,
    left: Option<u32>,
    right: Option<u32>,
}

// Max-heap entry for the bounded k-nearest heap.
struct HeapEntry {
    dist2: FVal,
    node: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .total_cmp(&other.dist2)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// A balanced k-d tree over 2-D points, split on alternating axes at the
/// median. Nodes live in an arena vector and refer to each other by index.
pub struct KdTree {
    nodes: Vec<Node>,
    root: Option<u32>,
}

impl KdTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }

    pub fn is_built(&self) -> bool {
        self.root.is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Rebuilds the tree from scratch over the given points.
    pub fn build(&mut self, mut points: Vec<Point>) {
        self.nodes.clear();
        self.nodes.reserve(points.len());
        self.root = self.build_rec(&mut points, 0);
    }

    fn build_rec(&mut self, points: &mut [Point], depth: usize) -> Option<u32> {
        if points.is_empty() {
            return None;
        }
        let axis = depth % 2;
        points.sort_unstable_by(|a, b| {
            if axis == 0 {
                a.x.total_cmp(&b.x)
            } else {
                a.y.total_cmp(&b.y)
            }
        });
        let median = points.len() / 2;
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            point: points[median],
            left: None,
            right: None,
        });
        let (lower, rest) = points.split_at_mut(median);
        let left = self.build_rec(lower, depth + 1);
        let right = self.build_rec(&mut rest[1..], depth + 1);
        let node = &mut self.nodes[id as usize];
        node.left = left;
        node.right = right;
        Some(id)
    }

    /// The nearest point to (x, y), or None if the tree is not built.
    pub fn nearest(&self, x: FVal, y: FVal) -> Option<Point> {
        let root = self.root?;
        let mut best: Option<(u32, FVal)> = None;
        self.nearest_rec(root, x, y, 0, &mut best);
        best.map(|(id, _)| self.nodes[id as usize].point)
    }

    fn nearest_rec(&self, id: u32, x: FVal, y: FVal, depth: usize, best: &mut Option<(u32, FVal)>) {
        let node = &self.nodes[id as usize];
        let d2 = node.point.dist2(x, y);
        if best.map_or(true, |(_, bd)| d2 < bd) {
            *best = Some((id, d2));
        }

        let axis_dist = if depth % 2 == 0 {
            x - node.point.x
        } else {
            y - node.point.y
        };
        let (near, far) = if axis_dist < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(near) = near {
            self.nearest_rec(near, x, y, depth + 1, best);
        }
        if let Some(far) = far {
            if axis_dist * axis_dist < best.map_or(FVal::MAX, |(_, bd)| bd) {
                self.nearest_rec(far, x, y, depth + 1, best);
            }
        }
    }

    /// The k nearest points to (x, y), closest first. Returns fewer than k
    /// points when the tree is smaller, and nothing when it is not built.
    pub fn k_nearest(&self, x: FVal, y: FVal, k: usize) -> Vec<Point> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
        self.k_nearest_rec(root, x, y, 0, k, &mut heap);
        heap.into_sorted_vec()
            .into_iter()
            .map(|e| self.nodes[e.node as usize].point)
            .collect()
    }

    fn k_nearest_rec(
        &self,
        id: u32,
        x: FVal,
        y: FVal,
        depth: usize,
        k: usize,
        heap: &mut BinaryHeap<HeapEntry>,
    ) {
        let node = &self.nodes[id as usize];
        heap.push(HeapEntry {
            dist2: node.point.dist2(x, y),
            node: id,
        });
        if heap.len() > k {
            heap.pop();
        }

        let axis_dist = if depth % 2 == 0 {
            x - node.point.x
        } else {
            y - node.point.y
        };
        let (near, far) = if axis_dist < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(near) = near {
            self.k_nearest_rec(near, x, y, depth + 1, k, heap);
        }
        if let Some(far) = far {
            let worst = heap.peek().map_or(FVal::MAX, |e| e.dist2);
            if heap.len() < k || axis_dist * axis_dist < worst {
                self.k_nearest_rec(far, x, y, depth + 1, k, heap);
            }
        }
    }
}

impl Default for KdTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn grid_points() -> Vec<Point> {
        let mut pts = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                pts.push(Point::new(i as FVal * 10.0, j as FVal * 10.0, (i * 5 + j) as u32));
            }
        }
        pts
    }

    fn brute_k_nearest(points: &[Point], x: FVal, y: FVal, k: usize) -> Vec<u32> {
        points
            .iter()
            .sorted_by(|a, b| a.dist2(x, y).total_cmp(&b.dist2(x, y)))
            .take(k)
            .map(|p| p.label)
            .collect()
    }

    #[test]
    fn empty_tree_answers_nothing() {
        let tree = KdTree::new();
        assert!(!tree.is_built());
        assert_eq!(tree.nearest(0.0, 0.0), None);
        assert!(tree.k_nearest(0.0, 0.0, 3).is_empty());
    }

    #[test]
    fn nearest_matches_brute_force() {
        let pts = grid_points();
        let mut tree = KdTree::new();
        tree.build(pts.clone());
        for &(x, y) in &[(0.0, 0.0), (12.0, 17.0), (41.0, 3.0), (-5.0, 55.0)] {
            let got = tree.nearest(x, y).unwrap();
            let want = brute_k_nearest(&pts, x, y, 1)[0];
            assert_eq!(
                got.dist2(x, y),
                pts.iter().find(|p| p.label == want).unwrap().dist2(x, y)
            );
        }
    }

    #[test]
    fn k_nearest_matches_brute_force_as_a_set() {
        let pts = grid_points();
        let mut tree = KdTree::new();
        tree.build(pts.clone());
        for k in 1..=pts.len() {
            let got = tree.k_nearest(13.0, 22.0, k);
            assert_eq!(got.len(), k);
            // Compare distance multisets so equidistant points may swap.
            let got_d2 = got.iter().map(|p| p.dist2(13.0, 22.0)).collect_vec();
            let want_d2 = brute_k_nearest(&pts, 13.0, 22.0, k)
                .into_iter()
                .map(|l| pts.iter().find(|p| p.label == l).unwrap().dist2(13.0, 22.0))
                .collect_vec();
            assert_eq!(got_d2, want_d2, "k = {k}");
            // Closest first.
            for w in got.windows(2) {
                assert!(w[0].dist2(13.0, 22.0) <= w[1].dist2(13.0, 22.0));
            }
        }
    }
}

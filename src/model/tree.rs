//! Bounding volume hierarchy over the dynamic nodes.
//!
//! The tree over `N` dynamic nodes has `N` leaves and `N - 1` clusters, all addressed
//! by a single tree index: leaves occupy `0..N` (leaf `i` is dynamic node `i`) and
//! cluster `c` lives at `N + c`. Clusters are numbered so every child has a lower
//! index than its parent, which makes the root cluster `N - 2` and lets bounds be
//! refit in one forward sweep.

use nalgebra::Vector3;
use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::Aabb;

/// Cluster hierarchy used for broadphase against the dynamic nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CollisionTree {
    /// Parent tree index of every leaf and cluster; the root points at itself.
    pub parents: Vec<usize>,
    /// Child tree indices of every cluster.
    pub children: Vec<[usize; 2]>,
    /// Collision groups per tree index; clusters hold the union of their children.
    pub collision_masks: Vec<u16>,
    /// Number of levels from the root to the deepest leaf.
    pub depth: usize,
}

impl CollisionTree {
    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.children.len() + usize::from(!self.parents.is_empty())
    }

    /// Number of clusters.
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.children.len()
    }

    /// Tree index of the root cluster, if the tree has any clusters.
    #[must_use]
    pub fn root(&self) -> Option<usize> {
        let n = self.leaf_count();
        (n >= 2).then(|| 2 * n - 2)
    }

    /// Build from cluster children, deriving parents, masks and depth.
    ///
    /// `children[c]` holds the tree indices merged into cluster `c`; every child must be
    /// lower than `N + c`.
    #[must_use]
    pub fn from_children(children: Vec<[usize; 2]>, leaf_masks: &[u16]) -> Self {
        let n = leaf_masks.len();
        if n < 2 {
            return Self {
                parents: vec![0; n],
                children: Vec::new(),
                collision_masks: leaf_masks.to_vec(),
                depth: n,
            };
        }
        let total = 2 * n - 1;
        let mut parents = vec![total - 1; total];
        let mut collision_masks = vec![0u16; total];
        collision_masks[..n].copy_from_slice(leaf_masks);
        for (c, pair) in children.iter().enumerate() {
            debug_assert!(pair[0] < n + c && pair[1] < n + c);
            parents[pair[0]] = n + c;
            parents[pair[1]] = n + c;
            collision_masks[n + c] = collision_masks[pair[0]] | collision_masks[pair[1]];
        }

        let mut levels = vec![0usize; total];
        levels[total - 1] = 1;
        let mut depth = 1;
        for c in (0..children.len()).rev() {
            let level = levels[n + c] + 1;
            for &child in &children[c] {
                levels[child] = level;
                depth = depth.max(level);
            }
        }

        Self {
            parents,
            children,
            collision_masks,
            depth,
        }
    }

    /// Refit every cluster box around the dynamic node positions.
    ///
    /// `aabbs` holds one box per cluster. `radii` is either empty or one radius per
    /// dynamic node, multiplied by `scale`.
    pub fn compute_bounds(
        &self,
        aabbs: &mut [Aabb],
        dynamic_positions: &[Vector3<f64>],
        radii: &[f64],
        scale: f64,
    ) {
        let n = self.leaf_count();
        if n < 2 || aabbs.len() + 1 != n {
            return;
        }
        for aabb in aabbs.iter_mut() {
            *aabb = Aabb::empty();
        }
        for (i, p) in dynamic_positions.iter().enumerate().take(n) {
            let cluster = self.parents[i] - n;
            match radii.get(i) {
                Some(&r) => aabbs[cluster].add_sphere(p, r * scale),
                None => aabbs[cluster].add_point(p),
            }
        }
        for c in 0..n - 2 {
            let parent = self.parents[n + c] - n;
            let child_box = aabbs[c];
            aabbs[parent].union(&child_box);
        }
    }

    /// Visit every leaf under clusters overlapping `query`.
    ///
    /// Clusters and leaves whose collision groups miss `mask` are pruned unless
    /// `IGNORE_MASK` is set. `f` receives the dynamic node index of each leaf.
    pub fn cast_box<const IGNORE_MASK: bool>(
        &self,
        aabbs: &[Aabb],
        query: &Aabb,
        mask: u16,
        mut f: impl FnMut(usize),
    ) {
        let Some(root) = self.root() else {
            return;
        };
        let n = self.leaf_count();
        if aabbs.len() + 1 != n {
            return;
        }
        let mut stack: SmallVec<[usize; 32]> = SmallVec::with_capacity(self.depth + 2);
        stack.push(root);
        while let Some(index) = stack.pop() {
            if !IGNORE_MASK && self.collision_masks[index] & mask == 0 {
                continue;
            }
            if index < n {
                f(index);
                continue;
            }
            let cluster = index - n;
            if !aabbs[cluster].overlaps(query) {
                continue;
            }
            let [a, b] = self.children[cluster];
            stack.push(b);
            stack.push(a);
        }
    }
}

//! Prefix-sum tree urn with O(log m) draws.
//!
//! Counts live in the leaves of a full binary tree; every internal node
//! stores the ball count of its *left* subtree. A draw walks from the root,
//! steering left or right by comparing the remaining variate against the left
//! sum, and the removing variant repairs the sums on the way down. Merging
//! two tree urns adds the whole node arrays directly, so the epoch-boundary
//! merge of the batch engine stays O(m).

use rand::Rng;

use crate::urn::{State, Urn};

#[derive(Clone, Debug)]
pub struct TreeUrn {
    num_colors: usize,
    /// Index of the first leaf; also the number of slots reserved for the
    /// internal nodes (1-indexed, slot 0 unused).
    first_leaf: usize,
    /// Internal nodes in `[1, first_leaf)`, leaves in
    /// `[first_leaf, first_leaf + num_colors)`.
    tree: Vec<u64>,
    num_balls: u64,
}

impl TreeUrn {
    pub fn from_counts(counts: &[u64]) -> Self {
        let mut urn = Self::with_colors(counts.len());
        for (color, &n) in counts.iter().enumerate() {
            if n > 0 {
                urn.add(color, n);
            }
        }
        urn
    }

    #[inline]
    fn leaf(&self, color: State) -> usize {
        self.first_leaf + color
    }

    /// Propagates a count change at `leaf` up to the root. Only ancestors
    /// reached from a left child change, since nodes store left-subtree sums.
    fn update_path(&mut self, mut i: usize, n: u64, add: bool) {
        while i > 1 {
            let parent = i / 2;
            if i % 2 == 0 {
                if add {
                    self.tree[parent] += n;
                } else {
                    self.tree[parent] -= n;
                }
            }
            i = parent;
        }
    }

    #[cfg(test)]
    fn subtree_leaf_sum(&self, i: usize) -> u64 {
        if i >= self.first_leaf {
            if i < self.first_leaf + self.num_colors {
                self.tree[i]
            } else {
                0
            }
        } else {
            self.subtree_leaf_sum(2 * i) + self.subtree_leaf_sum(2 * i + 1)
        }
    }

    /// Every internal node must equal the ball count of its left subtree.
    #[cfg(test)]
    pub fn check_structure(&self) {
        for i in 1..self.first_leaf {
            assert_eq!(self.tree[i], self.subtree_leaf_sum(2 * i), "node {}", i);
        }
        let total: u64 = (0..self.num_colors).map(|c| self.tree[self.leaf(c)]).sum();
        assert_eq!(total, self.num_balls);
    }
}

impl Urn for TreeUrn {
    fn with_colors(num_colors: usize) -> Self {
        assert!(num_colors > 0, "urn needs at least one color");
        let first_leaf = num_colors.next_power_of_two();
        Self {
            num_colors,
            first_leaf,
            tree: vec![0; first_leaf + num_colors],
            num_balls: 0,
        }
    }

    fn num_colors(&self) -> usize {
        self.num_colors
    }

    fn num_balls(&self) -> u64 {
        self.num_balls
    }

    fn count(&self, color: State) -> u64 {
        self.tree[self.leaf(color)]
    }

    fn add(&mut self, color: State, n: u64) {
        let leaf = self.leaf(color);
        self.tree[leaf] += n;
        self.num_balls += n;
        self.update_path(leaf, n, true);
    }

    fn remove(&mut self, color: State, n: u64) {
        let leaf = self.leaf(color);
        debug_assert!(self.tree[leaf] >= n, "removing more balls than stored");
        self.tree[leaf] -= n;
        self.num_balls -= n;
        self.update_path(leaf, n, false);
    }

    fn peek_random<R: Rng>(&self, rng: &mut R) -> State {
        debug_assert!(!self.is_empty(), "drawing from an empty urn");
        let mut variate = rng.gen_range(0..self.num_balls);

        let mut i = 1;
        while i < self.first_leaf {
            let left = self.tree[i];
            if variate >= left {
                variate -= left;
                i = 2 * i + 1;
            } else {
                i = 2 * i;
            }
        }

        i - self.first_leaf
    }

    fn draw_random<R: Rng>(&mut self, rng: &mut R) -> State {
        debug_assert!(!self.is_empty(), "drawing from an empty urn");
        let mut variate = rng.gen_range(0..self.num_balls);

        let mut i = 1;
        while i < self.first_leaf {
            let left = self.tree[i];
            if variate >= left {
                variate -= left;
                i = 2 * i + 1;
            } else {
                // the drawn ball sits in the left subtree; fix the sum now
                self.tree[i] -= 1;
                i = 2 * i;
            }
        }

        let color = i - self.first_leaf;
        self.tree[i] -= 1;
        self.num_balls -= 1;
        color
    }

    fn merge(&mut self, other: &Self) {
        assert_eq!(self.num_colors, other.num_colors);
        for (mine, theirs) in self.tree.iter_mut().zip(&other.tree) {
            *mine += theirs;
        }
        self.num_balls += other.num_balls;
    }

    fn clear(&mut self) {
        self.tree.fill(0);
        self.num_balls = 0;
    }
}

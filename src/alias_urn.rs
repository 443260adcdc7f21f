//! Alias-table urn with amortized O(1) draws (Walker 1974).
//!
//! Each color owns one table row with two slots: a primary weight for the
//! row's own color and a secondary weight attributed to an alias color. A
//! draw picks a uniform row and a uniform weight below the common row
//! ceiling, accepts the primary slot, falls through to the alias, or rejects.
//!
//! Mutations keep the table valid locally: a row whose total weight drifts
//! outside its tolerance band first tries to swap secondary slots with a few
//! random partner rows, and only a failed repair triggers the O(m) rebuild.
//! Primary weights are signed because a removal can hit a row whose balls
//! mostly live in *other* rows' secondary slots.

use rand::Rng;

use crate::rng::split_mix_64;
use crate::urn::{State, Urn};

const REPAIR_ATTEMPTS: usize = 5;

#[derive(Clone, Copy, Debug, Default)]
struct Row {
    weights: [i64; 2],
    alias: State,
}

impl Row {
    #[inline]
    fn total(&self) -> i64 {
        self.weights[0] + self.weights[1]
    }
}

#[derive(Clone, Debug)]
pub struct AliasUrn {
    num_balls: u64,
    lower_threshold: f64,
    upper_threshold: f64,
    rows: Vec<Row>,
    counts: Vec<u64>,
    row_weight_lower: i64,
    row_weight_upper: i64,
    row_current_max: i64,
}

impl AliasUrn {
    pub fn from_counts(counts: &[u64]) -> Self {
        let mut urn = Self::with_colors(counts.len());
        urn.counts.copy_from_slice(counts);
        urn.num_balls = counts.iter().sum();
        urn.rebuild();
        urn
    }

    /// After a rebuild every row totals `floor(n/m)` or `floor(n/m) + 1` and
    /// the rows sum to the ball count.
    fn rebuild(&mut self) {
        let num_colors = self.num_colors();
        let average = (self.num_balls / num_colors as u64) as i64;
        let mut above_average = (self.num_balls - average as u64 * num_colors as u64) as i64;

        self.row_weight_lower = (average as f64 * self.lower_threshold) as i64;
        self.row_current_max = average + (above_average > 0) as i64;
        self.row_weight_upper = (self.row_current_max as f64 * self.upper_threshold).ceil() as i64;

        let mut small = Vec::with_capacity(num_colors);
        let mut large = Vec::with_capacity(num_colors);
        for color in 0..num_colors {
            let n = self.counts[color] as i64;
            self.rows[color] = Row {
                weights: [n, 0],
                alias: 0,
            };
            if n > average {
                large.push(color);
            } else {
                small.push(color);
            }
        }

        // Classic alias construction: top up underfull rows from the tail of
        // the overfull ones until every row reaches its target.
        while let Some(&large_id) = large.last() {
            let small_id = small.pop().expect("floor average leaves a small row");

            let target = average + (above_average > 0) as i64;
            above_average -= 1;
            let remaining = target - self.rows[small_id].weights[0];
            if remaining == 0 {
                continue;
            }

            debug_assert!(self.rows[large_id].weights[0] >= remaining);
            self.rows[large_id].weights[0] -= remaining;
            self.rows[small_id].weights[1] = remaining;
            self.rows[small_id].alias = large_id;

            if self.rows[large_id].weights[0] <= average {
                large.pop();
                small.push(large_id);
            }
        }

        self.assert_consistency(false);
        debug_assert!(self
            .rows
            .iter()
            .all(|r| average <= r.total() && r.total() <= average + 1));
    }

    /// Swaps the secondary slots of `row_id` and `partner` if that leaves
    /// both rows inside the tolerance band.
    fn swap_with_partner(&mut self, row_id: State, partner: State) -> bool {
        if partner == row_id {
            return false;
        }
        let w1 = self.rows[row_id].weights[0] + self.rows[partner].weights[1];
        let w2 = self.rows[row_id].weights[1] + self.rows[partner].weights[0];

        let ok = self.row_weight_lower < w1
            && self.row_weight_lower < w2
            && w1 < self.row_weight_upper
            && w2 < self.row_weight_upper;
        if ok {
            let (a, b) = (self.rows[row_id], self.rows[partner]);
            self.rows[row_id].weights[1] = b.weights[1];
            self.rows[row_id].alias = b.alias;
            self.rows[partner].weights[1] = a.weights[1];
            self.rows[partner].alias = a.alias;
        }
        ok
    }

    fn try_fix_row<R: Rng>(&mut self, rng: &mut R, row_id: State) -> bool {
        for _ in 0..REPAIR_ATTEMPTS {
            let partner = rng.gen_range(0..self.num_colors());
            if self.swap_with_partner(row_id, partner) {
                return true;
            }
        }
        false
    }

    /// Repair variant for the add/remove path, which carries no caller RNG:
    /// partner candidates come from a SplitMix64 stream seeded by the row
    /// identity and its current weights.
    fn try_fix_row_seeded(&mut self, row_id: State) -> bool {
        let row = &self.rows[row_id];
        let seed = (row_id as u64)
            .wrapping_mul(0x9e3779b9)
            .wrapping_add(row.weights[0] as u64)
            .wrapping_mul(31)
            .wrapping_add(row.weights[1] as u64);
        for i in 0..REPAIR_ATTEMPTS as u64 {
            let partner = (split_mix_64(seed.wrapping_add(i)) % self.num_colors() as u64) as State;
            if self.swap_with_partner(row_id, partner) {
                return true;
            }
        }
        false
    }

    fn pick<R: Rng>(&self, rng: &mut R) -> (State, State, usize) {
        debug_assert!(!self.is_empty(), "drawing from an empty urn");
        let span = self.num_colors() as u64 * self.row_current_max as u64;

        loop {
            let variate = rng.gen_range(0..span);
            let row_id = (variate / self.row_current_max as u64) as State;
            let weight = (variate % self.row_current_max as u64) as i64;

            let row = &self.rows[row_id];
            if weight < row.weights[0] {
                return (row_id, row_id, 0);
            }
            if weight - row.weights[0] < row.weights[1] {
                return (row_id, row.alias, 1);
            }
        }
    }

    fn assert_consistency(&self, _counts_only: bool) {
        #[cfg(debug_assertions)]
        {
            assert_eq!(self.counts.iter().sum::<u64>(), self.num_balls);
            if !_counts_only {
                let table_total: i64 = self.rows.iter().map(Row::total).sum();
                assert_eq!(table_total, self.num_balls as i64);
                assert!(self.rows.iter().all(|r| r.total() <= self.row_current_max));
            }
        }
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        assert_eq!(self.counts.iter().sum::<u64>(), self.num_balls);
        let table_total: i64 = self.rows.iter().map(Row::total).sum();
        assert_eq!(table_total, self.num_balls as i64);
        assert!(self.rows.iter().all(|r| r.total() <= self.row_current_max));
        assert!(self
            .rows
            .iter()
            .all(|r| r.weights[1] == 0 || r.alias < self.num_colors()));
    }
}

impl Urn for AliasUrn {
    fn with_colors(num_colors: usize) -> Self {
        assert!(num_colors > 0, "urn needs at least one color");
        Self {
            num_balls: 0,
            lower_threshold: 0.8,
            upper_threshold: 1.5,
            rows: vec![Row::default(); num_colors],
            counts: vec![0; num_colors],
            row_weight_lower: 0,
            row_weight_upper: 0,
            row_current_max: 0,
        }
    }

    fn num_colors(&self) -> usize {
        self.counts.len()
    }

    fn num_balls(&self) -> u64 {
        self.num_balls
    }

    fn count(&self, color: State) -> u64 {
        self.counts[color]
    }

    fn add(&mut self, color: State, n: u64) {
        self.rows[color].weights[0] += n as i64;
        self.counts[color] += n;
        self.num_balls += n;

        let new_weight = self.rows[color].total();
        if self.row_current_max < new_weight {
            self.row_current_max = new_weight;
        }
        self.assert_consistency(false);

        if (new_weight < self.row_weight_lower || self.row_weight_upper < new_weight)
            && !self.try_fix_row_seeded(color)
        {
            self.rebuild();
        }
    }

    fn remove(&mut self, color: State, n: u64) {
        debug_assert!(self.counts[color] >= n, "removing more balls than stored");
        self.rows[color].weights[0] -= n as i64;
        self.counts[color] -= n;
        self.num_balls -= n;
        self.assert_consistency(false);

        let new_weight = self.rows[color].total();
        if (new_weight < self.row_weight_lower || self.row_weight_upper < new_weight)
            && !self.try_fix_row_seeded(color)
        {
            self.rebuild();
        }
    }

    fn peek_random<R: Rng>(&self, rng: &mut R) -> State {
        self.pick(rng).1
    }

    fn draw_random<R: Rng>(&mut self, rng: &mut R) -> State {
        let (row_id, color, slot) = self.pick(rng);

        self.counts[color] -= 1;
        self.num_balls -= 1;
        self.rows[row_id].weights[slot] -= 1;
        self.assert_consistency(false);

        if self.rows[row_id].total() < self.row_weight_lower && !self.try_fix_row(rng, row_id) {
            self.rebuild();
        }

        color
    }

    fn merge(&mut self, other: &Self) {
        assert_eq!(self.num_colors(), other.num_colors());
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        self.num_balls += other.num_balls;
        self.rebuild();
    }

    fn clear(&mut self) {
        self.counts.fill(0);
        self.rows.fill(Row::default());
        self.num_balls = 0;
        self.row_weight_lower = 0;
        self.row_weight_upper = 0;
        self.row_current_max = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_add_get_remove_single_color() {
        let mut rng = StdRng::seed_from_u64(1);
        for num_colors in 2..64 {
            for c in 0..num_colors {
                let mut urn = AliasUrn::with_colors(num_colors);
                urn.add(c, num_colors as u64);
                urn.check_invariants();

                assert!(!urn.is_empty());
                assert_eq!(urn.peek_random(&mut rng), c);
                assert_eq!(urn.draw_random(&mut rng), c);
                assert_eq!(urn.num_balls(), num_colors as u64 - 1);
            }
        }
    }

    #[test]
    fn test_rebuild_row_bounds() {
        let urn = AliasUrn::from_counts(&[100, 0, 3, 57, 1, 0, 9, 30]);
        urn.check_invariants();
        assert_eq!(urn.num_balls(), 200);
        let average = 200 / 8;
        for row in &urn.rows {
            assert!(row.total() == average || row.total() == average + 1);
        }
    }

    #[test]
    fn test_invariants_after_mixed_ops() {
        let mut rng = StdRng::seed_from_u64(11);
        let num_colors = 23;
        let mut urn = AliasUrn::from_counts(&vec![4u64; num_colors]);
        let mut reference = vec![4u64; num_colors];

        for _ in 0..5_000 {
            if rng.gen_bool(0.45) || urn.num_balls() <= 1 {
                let color = rng.gen_range(0..num_colors);
                let n = rng.gen_range(1..6);
                urn.add(color, n);
                reference[color] += n;
            } else if rng.gen_bool(0.5) {
                let color = urn.draw_random(&mut rng);
                assert!(reference[color] > 0);
                reference[color] -= 1;
            } else {
                let color = rng.gen_range(0..num_colors);
                let n = reference[color].min(rng.gen_range(1..3));
                if n > 0 {
                    urn.remove(color, n);
                    reference[color] -= n;
                }
            }
            urn.check_invariants();
        }

        for c in 0..num_colors {
            assert_eq!(urn.count(c), reference[c]);
        }
    }

    #[test]
    fn test_draws_hit_every_color() {
        let mut rng = StdRng::seed_from_u64(3);
        let counts = [1u64, 100, 2, 0, 50];
        let mut urn = AliasUrn::from_counts(&counts);

        let mut seen = vec![0u64; counts.len()];
        while !urn.is_empty() {
            seen[urn.draw_random(&mut rng)] += 1;
        }
        assert_eq!(seen.to_vec(), counts.to_vec());
    }

    #[test]
    fn test_merge_rebuilds() {
        let mut a = AliasUrn::from_counts(&[10, 0, 5]);
        let b = AliasUrn::from_counts(&[1, 7, 2]);
        a.merge(&b);
        a.check_invariants();
        assert_eq!(a.num_balls(), 25);
        assert_eq!(a.count(1), 7);
    }
}

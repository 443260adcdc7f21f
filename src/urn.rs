//! Weighted multisets of colored balls.
//!
//! An urn holds `n` balls in `m` colors with `m << n`. Balls of the same
//! color are indistinguishable, so we only store per-color counts; this moves
//! most operations from Theta(n) to O~(m) or better. All backends share one
//! contract (the [`Urn`] trait) so the simulators never depend on which one
//! they were given.

use rand::Rng;
use rand_distr::{Distribution, Hypergeometric};

/// An agent's state doubles as its ball color.
pub type State = usize;

/// Number of successes when drawing `draws` balls without replacement from an
/// urn with `successes` good and `failures` bad balls.
pub fn hypergeometric<R: Rng>(successes: u64, failures: u64, draws: u64, rng: &mut R) -> u64 {
    debug_assert!(draws <= successes + failures);
    Hypergeometric::new(successes + failures, successes, draws)
        .expect("hypergeometric parameters out of range")
        .sample(rng)
}

/// Common contract of all urn backends.
///
/// Drawing from an empty urn is a usage error: debug builds assert, release
/// builds are free to misbehave at that call.
pub trait Urn {
    /// Build an empty urn over `num_colors` colors.
    fn with_colors(num_colors: usize) -> Self
    where
        Self: Sized;

    fn num_colors(&self) -> usize;

    fn num_balls(&self) -> u64;

    fn count(&self, color: State) -> u64;

    /// Adds `n` balls of one color.
    fn add(&mut self, color: State, n: u64);

    /// Removes `n` balls of one color; requires `count(color) >= n`.
    fn remove(&mut self, color: State, n: u64);

    /// Picks a ball uniformly at random and returns its color.
    fn peek_random<R: Rng>(&self, rng: &mut R) -> State;

    /// Same as [`Urn::peek_random`], but also removes the ball.
    fn draw_random<R: Rng>(&mut self, rng: &mut R) -> State;

    /// Element-wise addition of another urn over the same color set.
    fn merge(&mut self, other: &Self);

    /// Resets all counts to zero.
    fn clear(&mut self);

    fn is_empty(&self) -> bool {
        self.num_balls() == 0
    }

    /// Draws `k <= num_balls` distinct balls uniformly without replacement and
    /// reports them as `(color, count)` pairs in ascending color order,
    /// skipping colors that contributed nothing. The urn is left unchanged.
    ///
    /// Walking the colors in index order and drawing each count from the
    /// hypergeometric distribution over the not-yet-visited remainder yields
    /// exactly the joint distribution of `k` individual draws.
    fn sample_without_replacement<R, F>(&self, k: u64, rng: &mut R, mut sink: F)
    where
        R: Rng,
        F: FnMut(State, u64),
    {
        if self.num_balls() == 0 || k == 0 {
            return;
        }
        debug_assert!(k <= self.num_balls());

        let mut left = k;
        let mut unconsidered = self.num_balls();

        for color in 0..self.num_colors() {
            if left == 0 {
                break;
            }
            let balls = self.count(color);
            unconsidered -= balls;
            let selected = if balls == 0 {
                0
            } else if unconsidered == 0 {
                left.min(balls)
            } else {
                hypergeometric(balls, unconsidered, left, rng)
            };
            if selected > 0 {
                sink(color, selected);
                left -= selected;
            }
        }
        debug_assert_eq!(left, 0);
    }

    /// Same as [`Urn::sample_without_replacement`], but removes the drawn
    /// balls in lockstep.
    fn draw_without_replacement<R, F>(&mut self, k: u64, rng: &mut R, mut sink: F)
    where
        R: Rng,
        F: FnMut(State, u64),
    {
        if self.num_balls() == 0 || k == 0 {
            return;
        }
        debug_assert!(k <= self.num_balls());

        let mut left = k;
        let mut unconsidered = self.num_balls();

        for color in 0..self.num_colors() {
            if left == 0 {
                break;
            }
            let balls = self.count(color);
            unconsidered -= balls;
            let selected = if balls == 0 {
                0
            } else if unconsidered == 0 {
                left.min(balls)
            } else {
                hypergeometric(balls, unconsidered, left, rng)
            };
            if selected > 0 {
                self.remove(color, selected);
                sink(color, selected);
                left -= selected;
            }
        }
        debug_assert_eq!(left, 0);
    }
}

/// The plainest backend: per-color counts and linear-scan draws.
///
/// Draws cost O(m), which is perfectly fine for small alphabets and makes
/// this the yardstick the fancier backends are tested against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearUrn {
    counts: Vec<u64>,
    num_balls: u64,
}

impl LinearUrn {
    /// Builds an urn holding `counts[c]` balls of each color `c`.
    pub fn from_counts(counts: &[u64]) -> Self {
        Self {
            counts: counts.to_vec(),
            num_balls: counts.iter().sum(),
        }
    }
}

impl Urn for LinearUrn {
    fn with_colors(num_colors: usize) -> Self {
        assert!(num_colors > 0, "urn needs at least one color");
        Self {
            counts: vec![0; num_colors],
            num_balls: 0,
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
        self.counts[color] += n;
        self.num_balls += n;
    }

    fn remove(&mut self, color: State, n: u64) {
        debug_assert!(self.counts[color] >= n, "removing more balls than stored");
        self.counts[color] -= n;
        self.num_balls -= n;
    }

    fn peek_random<R: Rng>(&self, rng: &mut R) -> State {
        debug_assert!(!self.is_empty(), "drawing from an empty urn");
        let mut variate = rng.gen_range(0..self.num_balls);
        let mut color = 0;
        loop {
            if self.counts[color] > variate {
                return color;
            }
            variate -= self.counts[color];
            color += 1;
        }
    }

    fn draw_random<R: Rng>(&mut self, rng: &mut R) -> State {
        let color = self.peek_random(rng);
        self.counts[color] -= 1;
        self.num_balls -= 1;
        color
    }

    fn merge(&mut self, other: &Self) {
        assert_eq!(self.num_colors(), other.num_colors());
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        self.num_balls += other.num_balls;
    }

    fn clear(&mut self) {
        self.counts.fill(0);
        self.num_balls = 0;
    }
}

//! The protocols shipped with the simulator: leader election, a phase clock,
//! exact majority, the increment family used by the conservation tests, and
//! random transition tables for benchmarking.
//!
//! Note: some encode/decode helpers are only exercised by tests and the CLI.

#![allow(dead_code)]

use rand::Rng;

use crate::protocol::{Protocol, State};

/// One-way leader election: two leaders meeting demote the initiator,
/// everything else is a no-op. Starting from all leaders, the leader count is
/// non-increasing and reaches one after O(n log n) interactions in
/// expectation.
pub struct LeaderElection;

impl LeaderElection {
    pub const FOLLOWER: State = 0;
    pub const LEADER: State = 1;
}

impl Protocol for LeaderElection {
    const ONE_WAY: bool = true;

    fn num_states(&self) -> usize {
        2
    }

    fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
        let out = if initiator == Self::LEADER && responder == Self::LEADER {
            Self::FOLLOWER
        } else {
            initiator
        };
        (out, responder)
    }
}

/// Is `b` ahead of `a` on a clock with `m` digits?
fn clock_gt(a: u32, b: u32, m: u32) -> bool {
    (b > a && b < a + m / 2) || (b < a && b + (m + 1) / 2 < a)
}

/// Logical state of a clock agent: a digit plus a marked bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockState {
    pub digit: u32,
    pub marked: bool,
}

/// One-way phase clock over `2m` states (digit and marked bit). The
/// initiator catches up by one tick when the responder is ahead, or when a
/// marked responder shows the same digit.
pub struct Clock {
    digits: u32,
}

impl Clock {
    pub fn new(digits: u32) -> Self {
        assert!(digits >= 2, "a clock needs at least two digits");
        Self { digits }
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    pub fn encode(&self, s: ClockState) -> State {
        debug_assert!(s.digit < self.digits);
        (s.digit + self.digits * s.marked as u32) as State
    }

    pub fn decode(&self, s: State) -> ClockState {
        debug_assert!(s < 2 * self.digits as usize);
        let marked = s >= self.digits as usize;
        ClockState {
            digit: s as u32 - self.digits * marked as u32,
            marked,
        }
    }

    /// Longest run of consecutive digits currently holding at most
    /// `threshold` agents (marked or not). A healthy running clock has gap 0.
    pub fn max_gap(&self, count_of: impl Fn(State) -> u64, threshold: u64) -> u32 {
        let is_empty = |digit: u32| {
            let unmarked = count_of(self.encode(ClockState {
                digit,
                marked: false,
            }));
            let marked = count_of(self.encode(ClockState {
                digit,
                marked: true,
            }));
            unmarked + marked <= threshold
        };

        let mut max_gap = 0;
        for start in 0..self.digits {
            if !is_empty(start) {
                continue;
            }
            let mut gap = 1;
            while gap < self.digits - 1 && is_empty((start + gap) % self.digits) {
                gap += 1;
            }
            max_gap = max_gap.max(gap);
        }
        max_gap
    }
}

impl Protocol for Clock {
    const ONE_WAY: bool = true;

    fn num_states(&self) -> usize {
        2 * self.digits as usize
    }

    fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
        let mut active = self.decode(initiator);
        let passive = self.decode(responder);

        let advance = clock_gt(active.digit, passive.digit, self.digits)
            || (active.digit == passive.digit && passive.marked);
        active.digit += advance as u32;
        if active.digit >= self.digits {
            active.digit = 0;
        }

        (self.encode(active), responder)
    }
}

/// Logical state of a majority agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MajorityState {
    pub opinion: bool,
    pub strong: bool,
}

/// Two-way exact majority over four states. Two strong agents cancel into
/// weak ones; a strong agent converts a weak partner to its opinion.
pub struct Majority;

impl Majority {
    pub fn encode(&self, s: MajorityState) -> State {
        2 * s.strong as State | s.opinion as State
    }

    pub fn decode(&self, s: State) -> MajorityState {
        MajorityState {
            opinion: s & 0b01 != 0,
            strong: s & 0b10 != 0,
        }
    }
}

impl Protocol for Majority {
    fn num_states(&self) -> usize {
        4
    }

    fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
        let mut first = self.decode(initiator);
        let mut second = self.decode(responder);

        if first.strong == second.strong {
            first.strong = false;
            second.strong = false;
        } else if first.strong {
            second.opinion = first.opinion;
        } else {
            first.opinion = second.opinion;
        }

        (self.encode(first), self.encode(second))
    }
}

/// One-way increment: the initiator moves up one state per interaction, so
/// the configuration itself encodes the number of interactions performed.
pub struct IncrementOneWay {
    num_states: usize,
}

impl IncrementOneWay {
    pub fn new(num_states: usize) -> Self {
        Self { num_states }
    }

    pub const INCREMENTS_PER_INTERACTION: u64 = 1;
}

impl Protocol for IncrementOneWay {
    const ONE_WAY: bool = true;

    fn num_states(&self) -> usize {
        self.num_states
    }

    fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
        (initiator + 1, responder)
    }
}

/// Two-way increment with a choice of which partners move up. Summing
/// `state * count` over the configuration and dividing by the increments per
/// interaction reconstructs the engine's interaction counter exactly.
pub struct IncrementTwoWay {
    num_states: usize,
    bump_initiator: bool,
    bump_responder: bool,
}

impl IncrementTwoWay {
    pub fn first(num_states: usize) -> Self {
        Self {
            num_states,
            bump_initiator: true,
            bump_responder: false,
        }
    }

    pub fn second(num_states: usize) -> Self {
        Self {
            num_states,
            bump_initiator: false,
            bump_responder: true,
        }
    }

    pub fn both(num_states: usize) -> Self {
        Self {
            num_states,
            bump_initiator: true,
            bump_responder: true,
        }
    }

    pub fn increments_per_interaction(&self) -> u64 {
        self.bump_initiator as u64 + self.bump_responder as u64
    }
}

impl Protocol for IncrementTwoWay {
    fn num_states(&self) -> usize {
        self.num_states
    }

    fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
        (
            initiator + self.bump_initiator as State,
            responder + self.bump_responder as State,
        )
    }
}

/// Uniformly random one-way transition table; a worst case for the no-op and
/// partition precomputations and the standard benchmarking protocol.
pub struct RandomOneWay {
    num_states: usize,
    table: Vec<State>,
}

impl RandomOneWay {
    pub fn new<R: Rng>(rng: &mut R, num_states: usize) -> Self {
        let table = (0..num_states * num_states)
            .map(|_| rng.gen_range(0..num_states))
            .collect();
        Self { num_states, table }
    }
}

impl Protocol for RandomOneWay {
    const ONE_WAY: bool = true;

    fn num_states(&self) -> usize {
        self.num_states
    }

    fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
        debug_assert!(initiator < self.num_states && responder < self.num_states);
        (self.table[initiator * self.num_states + responder], responder)
    }
}

/// Uniformly random two-way transition table.
pub struct RandomTwoWay {
    num_states: usize,
    table: Vec<(State, State)>,
}

impl RandomTwoWay {
    pub fn new<R: Rng>(rng: &mut R, num_states: usize) -> Self {
        let table = (0..num_states * num_states)
            .map(|_| (rng.gen_range(0..num_states), rng.gen_range(0..num_states)))
            .collect();
        Self { num_states, table }
    }
}

impl Protocol for RandomTwoWay {
    fn num_states(&self) -> usize {
        self.num_states
    }

    fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
        debug_assert!(initiator < self.num_states && responder < self.num_states);
        self.table[initiator * self.num_states + responder]
    }
}

//! Protocol abstraction: the pairwise transition function plus the static
//! capabilities the simulators dispatch on.
//!
//! Capabilities are associated consts, so every engine instantiation is
//! monomorphized for its protocol's combination of deterministic/randomised
//! and one-way/two-way; the per-interaction hot paths carry no runtime
//! branching on protocol kind.

use std::collections::BTreeMap;

pub use crate::urn::State;

pub trait Protocol {
    /// Transitions are a pure function of the input pair. Randomised
    /// protocols set this to false and override [`Protocol::transition_batch`].
    const DETERMINISTIC: bool = true;

    /// Only the initiator may change state. One-way protocols must return the
    /// responder unchanged from [`Protocol::transition`].
    const ONE_WAY: bool = false;

    /// Size of the state alphabet.
    fn num_states(&self) -> usize;

    /// Resolves one interaction of `(initiator, responder)`.
    fn transition(&mut self, initiator: State, responder: State) -> (State, State);

    /// Resolves `num` independent interactions of the same input pair,
    /// depositing `(state, count)` outputs into `sink`. Exactly `2 * num`
    /// states must be deposited (`num` for one-way protocols). The default
    /// body covers every deterministic protocol; randomised protocols
    /// override it and spread their outputs.
    fn transition_batch<F>(&mut self, initiator: State, responder: State, num: u64, mut sink: F)
    where
        F: FnMut(State, u64),
    {
        let (a, b) = self.transition(initiator, responder);
        sink(a, num);
        if !Self::ONE_WAY {
            sink(b, num);
        }
    }
}

/// Partner sets that leave an interaction without effect: for each initiator
/// state the sorted responders `s2` with `delta(s1, s2)` equal to `(s1, s2)`
/// or `(s2, s1)`. Returns the table and the total number of no-op pairs; the
/// engine only pays for skipping when that total exceeds the alphabet size.
pub fn noop_partners<P: Protocol>(protocol: &mut P) -> (Vec<Vec<State>>, usize) {
    let num_states = protocol.num_states();
    let mut table = vec![Vec::new(); num_states];
    let mut total = 0;

    for first in 0..num_states {
        for second in 0..num_states {
            let to = protocol.transition(first, second);
            if to == (first, second) || to == (second, first) {
                table[first].push(second);
                total += 1;
            }
        }
    }

    (table, total)
}

/// Responder groups of a one-way protocol: for each initiator state, the
/// preimage of `delta(s1, .)` partitioned by output state, as
/// `(partner_set, out_state)` pairs in ascending output order.
pub type OneWayPartitions = Vec<Vec<(Vec<State>, State)>>;

pub fn one_way_partitions<P: Protocol>(protocol: &mut P) -> OneWayPartitions {
    let num_states = protocol.num_states();
    let mut partitions = Vec::with_capacity(num_states);

    for first in 0..num_states {
        let mut groups: BTreeMap<State, Vec<State>> = BTreeMap::new();
        for second in 0..num_states {
            let (out, responder) = protocol.transition(first, second);
            assert_eq!(responder, second, "one-way protocol changed the responder");
            groups.entry(out).or_default().push(second);
        }
        partitions.push(groups.into_iter().map(|(out, set)| (set, out)).collect());
    }

    partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{IncrementTwoWay, LeaderElection, Majority};

    #[test]
    fn test_noop_partners_of_majority() {
        let (table, total) = noop_partners(&mut Majority);
        // both-weak pairs plus strong-meets-agreeing-weak pairs
        assert_eq!(total, 8);
        assert_eq!(table[0], vec![0, 1, 2]);
        assert_eq!(table[1], vec![0, 1, 3]);
        assert_eq!(table[2], vec![0]);
        assert_eq!(table[3], vec![1]);
    }

    #[test]
    fn test_noop_partners_of_increment() {
        // increment always changes something, so nothing can be skipped
        let (_, total) = noop_partners(&mut IncrementTwoWay::both(100));
        assert_eq!(total, 0);
    }

    #[test]
    fn test_one_way_partitions_of_leader_election() {
        let partitions = one_way_partitions(&mut LeaderElection);

        // a follower stays a follower against anyone
        assert_eq!(partitions[0], vec![(vec![0, 1], 0)]);
        // a leader falls against a leader, survives a follower
        assert_eq!(partitions[1], vec![(vec![1], 0), (vec![0], 1)]);
    }

    #[test]
    fn test_partitions_cover_every_responder() {
        let partitions = one_way_partitions(&mut LeaderElection);
        for row in &partitions {
            let mut covered: Vec<State> = row.iter().flat_map(|(set, _)| set.clone()).collect();
            covered.sort_unstable();
            assert_eq!(covered, vec![0, 1]);
        }
    }
}

//! The batched epoch engine.
//!
//! The naive simulator pays Theta(1) per interaction; this engine processes
//! interactions in epochs of roughly `B` at a much lower amortized cost by
//! exploiting that agents are anonymous. Within an epoch, most interactions
//! involve agents that have not been touched yet, and those can be resolved
//! in bulk at the end. Only the "collisions" -- interactions touching an
//! agent that already interacted this epoch -- need individual treatment,
//! and their positions are exactly what the collision waiting-time
//! distribution samples.
//!
//! An epoch has two phases. The sampling phase repeatedly draws how many
//! plain draws pass until the next collision, books the passed draws as
//! *delayed* pairs, and plants the collision itself with the correct
//! endpoint statistics. The bulk phase then resolves all delayed pairs at
//! once: the first partners come out of a single without-replacement draw
//! grouped by state, the second partners are allocated per state with
//! hypergeometric counts, and the transition is applied once per state pair
//! with multiplicity. Post-interaction states collect in a second urn that
//! is merged back at the epoch boundary, so nothing interacts twice within
//! one epoch through the untouched pool.

use std::mem;

use rand::Rng;

use crate::collision::CollisionDistribution;
use crate::controller::EpochLengthController;
use crate::monitor::Simulator;
use crate::protocol::{noop_partners, one_way_partitions, OneWayPartitions, Protocol, State};
use crate::rng::FairCoin;
use crate::urn::{hypergeometric, Urn};

pub struct BatchSimulator<'a, U: Urn, P: Protocol, R: Rng> {
    agents: U,
    updated: U,
    /// Agents booked into delayed pairs but still sitting in `agents`.
    /// Always even; collisions consume agents pairwise.
    num_delayed: u64,

    controller: EpochLengthController,
    protocol: P,
    rng: &'a mut R,
    coin: FairCoin,
    collision: CollisionDistribution,

    /// Reused buffer for the bulk phase's first partners.
    first_agents: Vec<(State, u64)>,

    /// Per initiator state, partners whose interaction changes nothing
    /// (two-way deterministic only).
    skip_partners: Vec<Vec<State>>,
    use_skip: bool,
    /// Responder groups per initiator state (one-way deterministic only).
    partitions: OneWayPartitions,

    num_interactions: u64,
    num_runs: u64,
    num_epochs: u64,
}

impl<'a, U: Urn, P: Protocol, R: Rng> BatchSimulator<'a, U, P, R> {
    pub fn new(urn: U, mut protocol: P, rng: &'a mut R) -> Self {
        assert!(urn.num_balls() > 0, "simulator needs a non-empty urn");
        assert!(
            protocol.num_states() <= urn.num_colors(),
            "urn has fewer colors than the protocol has states"
        );

        let num_agents = urn.num_balls();
        let num_colors = urn.num_colors();
        let controller = EpochLengthController::new(num_agents);
        let collision =
            CollisionDistribution::new(num_agents, 0, (2 * controller.max()).min(num_agents));

        let mut skip_partners = Vec::new();
        let mut use_skip = false;
        let mut partitions = OneWayPartitions::new();

        if P::DETERMINISTIC {
            if P::ONE_WAY {
                partitions = one_way_partitions(&mut protocol);
            } else {
                let (table, total_skips) = noop_partners(&mut protocol);
                skip_partners = table;
                use_skip = total_skips > num_colors;
            }
        }
        if skip_partners.is_empty() {
            skip_partners = vec![Vec::new(); num_colors];
        }

        Self {
            updated: U::with_colors(num_colors),
            agents: urn,
            num_delayed: 0,
            controller,
            protocol,
            rng,
            coin: FairCoin::default(),
            collision,
            first_agents: Vec::new(),
            skip_partners,
            use_skip,
            partitions,
            num_interactions: 0,
            num_runs: 0,
            num_epochs: 0,
        }
    }

    /// Runs epochs until `monitor` returns false. The monitor observes a
    /// consistent post-epoch snapshot and is the sole termination signal.
    pub fn run<M: FnMut(&Self) -> bool>(&mut self, mut monitor: M) {
        self.controller.start();
        loop {
            debug_assert_eq!(self.updated.num_balls(), 0);

            self.plant_collisions();
            self.resolve_delayed();

            self.agents.merge(&self.updated);
            self.updated.clear();
            self.num_delayed = 0;
            self.num_epochs += 1;
            self.controller.update(self.num_interactions);

            if !monitor(self) {
                break;
            }
        }
    }

    pub fn agents(&self) -> &U {
        &self.agents
    }

    #[allow(dead_code)]
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Mutable access for protocols that carry inspection state.
    #[allow(dead_code)]
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Sampling phase: book delayed pairs run by run and plant each run's
    /// terminating collision until the epoch target is reached.
    fn plant_collisions(&mut self) {
        let num_agents = self.agents.num_balls() + self.updated.num_balls();

        while self.num_delayed + self.updated.num_balls() < self.controller.current() {
            let mut colliding = self.num_delayed + self.updated.num_balls();
            self.collision.set_red(colliding);

            // with nothing touched yet the first two draws cannot collide
            let run_length = loop {
                let l = self.collision.sample(&mut *self.rng);
                if colliding != 0 || l >= 2 {
                    break l;
                }
            };

            self.num_delayed += 2 * (run_length / 2);
            colliding = self.num_delayed + self.updated.num_balls();

            // an even run length puts the collision on the first endpoint of
            // the next pair; otherwise the first endpoint is still untouched
            // and the collision lands on the second
            let collide_first = run_length % 2 == 0;
            let collide_second =
                !collide_first || self.with_probability(colliding, num_agents);

            let first = self.sample_agent(collide_first, colliding);
            let second = self.sample_agent(collide_second, colliding);

            let (a, b) = self.interact(first, second);
            self.updated.add(a, 1);
            self.updated.add(b, 1);

            self.num_runs += 1;
            debug_assert_eq!(self.num_delayed % 2, 0);
        }
    }

    fn sample_agent(&mut self, has_collision: bool, colliding: u64) -> State {
        if !has_collision {
            return self.agents.draw_random(&mut *self.rng);
        }
        if self.with_probability(self.num_delayed, colliding) {
            self.sample_delayed_agent()
        } else {
            self.updated.draw_random(&mut *self.rng)
        }
    }

    /// Materializes one delayed pair: both partners leave the main urn and
    /// interact now; a fair coin picks which result is handed to the caller
    /// while the other goes straight into the updated pool.
    fn sample_delayed_agent(&mut self) -> State {
        debug_assert!(self.num_delayed >= 2);

        let first = self.agents.draw_random(&mut *self.rng);
        let second = self.agents.draw_random(&mut *self.rng);
        self.num_delayed -= 2;

        let (mut keep, mut store) = self.interact(first, second);
        if self.coin.flip(&mut *self.rng) {
            mem::swap(&mut keep, &mut store);
        }
        self.updated.add(store, 1);

        keep
    }

    fn with_probability(&mut self, good: u64, total: u64) -> bool {
        self.rng.gen_range(1..=total) <= good
    }

    fn interact(&mut self, first: State, second: State) -> (State, State) {
        self.num_interactions += 1;
        self.protocol.transition(first, second)
    }

    fn resolve_delayed(&mut self) {
        if P::DETERMINISTIC && P::ONE_WAY {
            return self.resolve_delayed_partitioned();
        }

        debug_assert!(self.first_agents.is_empty());
        let mut tasks = mem::take(&mut self.first_agents);
        self.agents
            .draw_without_replacement(self.num_delayed / 2, &mut *self.rng, |color, n| {
                tasks.push((color, n))
            });

        let outputs_per_interaction: u64 = if P::ONE_WAY { 1 } else { 2 };

        for &(first_state, group_size) in &tasks {
            let skips = &self.skip_partners[first_state];
            let mut left = group_size;
            let mut unconsidered = self.agents.num_balls();

            // skim off the partners that would change nothing with a single
            // draw; those initiators come back unchanged
            let skippable: u64 = if self.use_skip {
                skips.iter().map(|&s| self.agents.count(s)).sum()
            } else {
                0
            };
            if skippable > 0 {
                unconsidered -= skippable;
                let skipped = hypergeometric(skippable, unconsidered, left, &mut *self.rng);
                left -= skipped;
                self.updated.add(first_state, skipped);
            }

            let mut skip_cursor = 0;
            let mut second = 0;
            while left > 0 {
                debug_assert!(second < self.agents.num_colors());

                if self.use_skip {
                    while skip_cursor < skips.len() && skips[skip_cursor] < second {
                        skip_cursor += 1;
                    }
                    if skip_cursor < skips.len() && skips[skip_cursor] == second {
                        second += 1;
                        continue;
                    }
                }

                let balls = self.agents.count(second);
                unconsidered -= balls;
                let selected = if balls == 0 {
                    0
                } else if unconsidered == 0 {
                    left.min(balls)
                } else {
                    hypergeometric(balls, unconsidered, left, &mut *self.rng)
                };

                if selected > 0 {
                    // one-way responders never change, so they stay in place
                    if !P::ONE_WAY {
                        self.agents.remove(second, selected);
                    }
                    let before = self.updated.num_balls();
                    self.protocol
                        .transition_batch(first_state, second, selected, |state, n| {
                            self.updated.add(state, n)
                        });
                    if !P::DETERMINISTIC {
                        assert_eq!(
                            self.updated.num_balls(),
                            before + outputs_per_interaction * selected,
                            "protocol deposited a wrong number of post-interaction states"
                        );
                    }
                    self.num_interactions += selected;
                }

                left -= selected;
                second += 1;
            }
        }

        tasks.clear();
        self.first_agents = tasks;
    }

    /// One-way deterministic bulk phase: instead of walking all states, walk
    /// the precomputed responder groups per initiator and deposit each
    /// group's single output state with multiplicity. Responders keep their
    /// state and never leave the main urn.
    fn resolve_delayed_partitioned(&mut self) {
        debug_assert!(self.first_agents.is_empty());
        let mut tasks = mem::take(&mut self.first_agents);
        self.agents
            .draw_without_replacement(self.num_delayed / 2, &mut *self.rng, |color, n| {
                tasks.push((color, n))
            });

        for &(first_state, group_size) in &tasks {
            if group_size == 0 {
                continue;
            }

            let row = &self.partitions[first_state];
            if row.len() == 1 {
                // the whole group maps to one output state
                self.updated.add(row[0].1, group_size);
                continue;
            }

            let mut left = group_size;
            let mut unconsidered = self.agents.num_balls();

            for (partner_set, out_state) in row {
                let balls: u64 = partner_set.iter().map(|&s| self.agents.count(s)).sum();
                unconsidered -= balls;
                let selected = if balls == 0 {
                    0
                } else if unconsidered == 0 {
                    left.min(balls)
                } else {
                    hypergeometric(balls, unconsidered, left, &mut *self.rng)
                };

                self.updated.add(*out_state, selected);
                left -= selected;
                if left == 0 {
                    break;
                }
            }
        }

        self.num_interactions += self.num_delayed / 2;

        tasks.clear();
        self.first_agents = tasks;
    }
}

impl<'a, U: Urn, P: Protocol, R: Rng> Simulator for BatchSimulator<'a, U, P, R> {
    fn num_interactions(&self) -> u64 {
        self.num_interactions
    }

    fn num_runs(&self) -> u64 {
        self.num_runs
    }

    fn num_epochs(&self) -> u64 {
        self.num_epochs
    }

    fn num_agents(&self) -> u64 {
        self.agents.num_balls()
    }

    fn target_epoch_length(&self) -> u64 {
        self.controller.current_best()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{
        Clock, ClockState, IncrementOneWay, IncrementTwoWay, LeaderElection, Majority,
        MajorityState, RandomTwoWay,
    };
    use crate::reference::DistributionSimulator;
    use crate::tree_urn::TreeUrn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Reconstructs the interaction count from the configuration of an
    /// increment protocol: sum of state * count over the increments applied
    /// per interaction.
    fn reconstruct_interactions<U: Urn>(agents: &U, increments_per_interaction: u64) -> u64 {
        let sum: u64 = (0..agents.num_colors())
            .map(|s| s as u64 * agents.count(s))
            .sum();
        sum / increments_per_interaction
    }

    fn check_count_law<P: Protocol>(protocol: P, increments_per_interaction: u64, seed: u64) {
        let num_agents = 100;
        let num_states = 1_000;
        let max_state = (num_states as f64 * 0.9) as usize;

        let mut urn = TreeUrn::with_colors(num_states);
        urn.add(0, num_agents);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = BatchSimulator::new(urn, protocol, &mut rng);

        let mut checks = 0;
        sim.run(|sim| {
            let expected = reconstruct_interactions(sim.agents(), increments_per_interaction);
            assert_eq!(expected, sim.num_interactions());
            checks += 1;

            let highest_used = (0..num_states)
                .rev()
                .find(|&s| sim.agents().count(s) > 0)
                .unwrap_or(0);
            highest_used < max_state
        });

        assert!(checks > 1);
        assert!(sim.num_interactions() >= max_state as u64 * num_agents / 2 / increments_per_interaction);
    }

    #[test]
    fn test_count_law_one_way() {
        check_count_law(IncrementOneWay::new(1_000), 1, 12);
    }

    #[test]
    fn test_count_law_two_way_first() {
        check_count_law(IncrementTwoWay::first(1_000), 1, 13);
    }

    #[test]
    fn test_count_law_two_way_second() {
        check_count_law(IncrementTwoWay::second(1_000), 1, 14);
    }

    #[test]
    fn test_count_law_two_way_both() {
        check_count_law(IncrementTwoWay::both(1_000), 2, 15);
    }

    #[test]
    fn test_conservation_under_random_protocol() {
        let num_agents = 10_000u64;
        let num_states = 30;

        let mut rng = StdRng::seed_from_u64(99);
        let protocol = RandomTwoWay::new(&mut rng, num_states);

        let mut urn = TreeUrn::with_colors(num_states);
        for s in 0..num_states {
            urn.add(s, num_agents / num_states as u64 + (s == 0) as u64 * (num_agents % num_states as u64));
        }

        let mut sim = BatchSimulator::new(urn, protocol, &mut rng);
        let mut epochs = 0;
        sim.run(|sim| {
            assert_eq!(sim.num_agents(), num_agents);
            epochs += 1;
            epochs < 100
        });
    }

    #[test]
    fn test_determinism_under_seed() {
        // The controller retunes the epoch length from wall-clock throughput,
        // and its first timing-dependent decision falls after the third
        // measurement phase; within that window identical seeds must give
        // bit-identical counters.
        let trace = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            let protocol = RandomTwoWay::new(&mut rng, 12);
            let mut urn = TreeUrn::with_colors(12);
            urn.add(0, 5_000);
            let mut sim = BatchSimulator::new(urn, protocol, &mut rng);

            let mut per_epoch = Vec::new();
            sim.run(|sim| {
                per_epoch.push((sim.num_interactions(), sim.num_runs()));
                sim.num_epochs() < 30
            });
            per_epoch
        };

        assert_eq!(trace(77), trace(77));
        assert_ne!(trace(77), trace(78));
    }

    /// Randomised two-way protocol whose multiset effect is the identity;
    /// exercises the randomised bulk path and its output-count check.
    struct ShuffledIdentity;

    impl Protocol for ShuffledIdentity {
        const DETERMINISTIC: bool = false;

        fn num_states(&self) -> usize {
            10
        }

        fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
            (initiator, responder)
        }

        fn transition_batch<F>(&mut self, initiator: State, responder: State, num: u64, mut sink: F)
        where
            F: FnMut(State, u64),
        {
            sink(initiator, num);
            sink(responder, num);
        }
    }

    /// Randomised one-way identity; responders must stay in the main urn.
    struct OneWayIdentity;

    impl Protocol for OneWayIdentity {
        const DETERMINISTIC: bool = false;
        const ONE_WAY: bool = true;

        fn num_states(&self) -> usize {
            10
        }

        fn transition(&mut self, initiator: State, responder: State) -> (State, State) {
            (initiator, responder)
        }

        fn transition_batch<F>(&mut self, initiator: State, _responder: State, num: u64, mut sink: F)
        where
            F: FnMut(State, u64),
        {
            sink(initiator, num);
        }
    }

    fn check_identity_preserves_configuration<P: Protocol>(protocol: P, seed: u64) {
        let counts: Vec<u64> = (0..10).map(|s| 50 + 13 * s as u64).collect();
        let urn = TreeUrn::from_counts(&counts);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = BatchSimulator::new(urn, protocol, &mut rng);
        sim.run(|sim| sim.num_epochs() < 200);

        for (s, &expected) in counts.iter().enumerate() {
            assert_eq!(sim.agents().count(s), expected);
        }
    }

    #[test]
    fn test_randomized_two_way_identity_configuration() {
        check_identity_preserves_configuration(ShuffledIdentity, 5);
    }

    #[test]
    fn test_randomized_one_way_identity_configuration() {
        check_identity_preserves_configuration(OneWayIdentity, 6);
    }

    #[test]
    fn test_leader_election_small_population_reaches_one() {
        let num_agents = 100u64;
        let mut urn = TreeUrn::with_colors(2);
        urn.add(LeaderElection::LEADER, num_agents);

        let mut rng = StdRng::seed_from_u64(10);
        let mut sim = BatchSimulator::new(urn, LeaderElection, &mut rng);

        let mut last_leaders = num_agents;
        sim.run(|sim| {
            let leaders = sim.agents().count(LeaderElection::LEADER);
            assert!(leaders <= last_leaders, "leader count increased");
            assert!(leaders >= 1);
            last_leaders = leaders;
            leaders > 1 && sim.num_interactions() < 10_000_000
        });

        assert_eq!(sim.agents().count(LeaderElection::LEADER), 1);
    }

    #[test]
    fn test_leader_election_large_population_thins_out() {
        let num_agents = 1_000_000u64;
        let mut urn = TreeUrn::with_colors(2);
        urn.add(LeaderElection::LEADER, num_agents);

        let mut rng = StdRng::seed_from_u64(10);
        let mut sim = BatchSimulator::new(urn, LeaderElection, &mut rng);

        let mut last_leaders = num_agents;
        sim.run(|sim| {
            let leaders = sim.agents().count(LeaderElection::LEADER);
            assert!(leaders <= last_leaders, "leader count increased");
            last_leaders = leaders;
            sim.num_interactions() < 50 * num_agents
        });

        // pairwise elimination thins leaders roughly like n / rounds
        assert!(last_leaders < num_agents / 10, "still {} leaders", last_leaders);
        assert!(last_leaders >= 1);
    }

    #[test]
    fn test_clock_keeps_every_digit_populated() {
        let digits = 12u32;
        let clock = Clock::new(digits);
        let num_agents = 1_000_000u64;
        let num_marked = (num_agents as f64).sqrt() as u64 + 1;

        // uniform fill over digits, marked agents included
        let mut urn = TreeUrn::with_colors(clock.num_states());
        let per_digit = num_agents / digits as u64;
        let marked_per_digit = num_marked / digits as u64 + 1;
        for digit in 0..digits {
            urn.add(
                clock.encode(ClockState { digit, marked: false }),
                per_digit - marked_per_digit,
            );
            urn.add(
                clock.encode(ClockState { digit, marked: true }),
                marked_per_digit,
            );
        }

        let total = urn.num_balls();
        let mut rng = StdRng::seed_from_u64(10);
        let mut sim = BatchSimulator::new(urn, clock, &mut rng);
        sim.run(|sim| sim.num_interactions() < 2 * total);

        let gap = sim
            .protocol()
            .max_gap(|s| sim.agents().count(s), 0);
        assert_eq!(gap, 0);
    }

    #[test]
    fn test_majority_keeps_initial_winner_dominant() {
        let num_agents = 1_000_000u64;
        let p = Majority;
        let true_strong = p.encode(MajorityState { opinion: true, strong: true });
        let false_strong = p.encode(MajorityState { opinion: false, strong: true });
        let true_weak = p.encode(MajorityState { opinion: true, strong: false });

        let mut urn = TreeUrn::with_colors(4);
        urn.add(false_strong, num_agents / 4 - 1);
        urn.add(true_strong, num_agents - num_agents / 4 + 1);

        let mut rng = StdRng::seed_from_u64(10);
        let mut sim = BatchSimulator::new(urn, p, &mut rng);
        sim.run(|sim| {
            let winners = sim.agents().count(true_strong) + sim.agents().count(true_weak);
            winners < num_agents && sim.num_interactions() < 30 * num_agents
        });

        // strong agents cancel pairwise and the surviving true-strong pool
        // keeps converting weak agents, so the 3:1 start stays dominant
        let strong = sim.agents().count(true_strong) + sim.agents().count(false_strong);
        let winners = sim.agents().count(true_strong) + sim.agents().count(true_weak);
        assert!(strong < num_agents / 20, "strong pool barely shrank: {}", strong);
        assert!(
            winners > num_agents * 7 / 10,
            "initial majority lost its lead: {}",
            winners
        );
    }

    /// Approximate upper chi-squared quantile (Wilson-Hilferty).
    fn chi_squared_critical(dof: f64, z: f64) -> f64 {
        let a = 2.0 / (9.0 * dof);
        dof * (1.0 - a + z * a.sqrt()).powi(3)
    }

    #[test]
    fn test_batch_matches_naive_distribution() {
        // Final leader counts must be statistically indistinguishable
        // between the batch engine and the naive simulator. The population
        // is large enough that the up-to-one-epoch overshoot past the
        // stopping point shifts the leader count by far less than its
        // spread.
        let num_agents = 1_000u64;
        let trials = 600;
        let rounds = 4;

        let run_batch = |seed: u64| {
            let mut urn = TreeUrn::with_colors(2);
            urn.add(LeaderElection::LEADER, num_agents);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut sim = BatchSimulator::new(urn, LeaderElection, &mut rng);
            sim.run(|sim| sim.num_interactions() < rounds * num_agents);
            sim.agents().count(LeaderElection::LEADER)
        };

        let run_naive = |seed: u64| {
            let mut urn = TreeUrn::with_colors(2);
            urn.add(LeaderElection::LEADER, num_agents);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut sim = DistributionSimulator::new(urn, LeaderElection, &mut rng);
            sim.run(|sim| sim.num_interactions() < rounds * num_agents);
            sim.agents().count(LeaderElection::LEADER)
        };

        let mut batch_hist = vec![0u64; num_agents as usize + 1];
        let mut naive_hist = vec![0u64; num_agents as usize + 1];
        for trial in 0..trials {
            batch_hist[run_batch(1_000 + trial) as usize] += 1;
            naive_hist[run_naive(2_000_000 + trial) as usize] += 1;
        }

        // pool adjacent outcomes until each bin carries enough mass
        let mut pooled = Vec::new();
        let (mut acc_a, mut acc_b) = (0u64, 0u64);
        for i in 0..batch_hist.len() {
            acc_a += batch_hist[i];
            acc_b += naive_hist[i];
            if acc_a + acc_b >= 20 {
                pooled.push((acc_a, acc_b));
                acc_a = 0;
                acc_b = 0;
            }
        }
        if acc_a + acc_b > 0 {
            if let Some(last) = pooled.last_mut() {
                last.0 += acc_a;
                last.1 += acc_b;
            }
        }
        assert!(pooled.len() >= 3, "degenerate pooling: {:?}", pooled);

        let chi_squared: f64 = pooled
            .iter()
            .map(|&(a, b)| {
                let diff = a as f64 - b as f64;
                diff * diff / (a + b) as f64
            })
            .sum();

        let dof = (pooled.len() - 1) as f64;
        let critical = chi_squared_critical(dof, 3.1);
        assert!(
            chi_squared < critical,
            "chi^2 = {:.1} exceeds critical {:.1} over {} bins",
            chi_squared,
            critical,
            pooled.len()
        );
    }

    #[test]
    #[should_panic(expected = "non-empty urn")]
    fn test_empty_urn_is_rejected() {
        let urn = TreeUrn::with_colors(2);
        let mut rng = StdRng::seed_from_u64(0);
        let _ = BatchSimulator::new(urn, LeaderElection, &mut rng);
    }
}

//! Reference simulators: one interaction at a time, Theta(1) each.
//!
//! These define the semantics the batch engine must reproduce and serve as
//! its baseline in benchmarks. Both still report in epochs so a monitor sees
//! a comparable cadence to the batch engine.
//!
//! Note: accessors are kept in parity with the batch engine even where the
//! CLI does not use them.

#![allow(dead_code)]

use rand::Rng;

use crate::monitor::Simulator;
use crate::protocol::{Protocol, State};
use crate::urn::{LinearUrn, Urn};

/// Urn-backed naive simulator: remove the initiator, remove (or for one-way
/// protocols just look at) the responder, transition, reinsert.
pub struct DistributionSimulator<'a, U: Urn, P: Protocol, R: Rng> {
    agents: U,
    protocol: P,
    rng: &'a mut R,
    epoch_length: u64,

    num_interactions: u64,
    num_epochs: u64,
}

impl<'a, U: Urn, P: Protocol, R: Rng> DistributionSimulator<'a, U, P, R> {
    pub fn new(urn: U, protocol: P, rng: &'a mut R) -> Self {
        assert!(urn.num_balls() > 1, "need at least two agents");
        let epoch_length = (urn.num_balls() as f64).sqrt() as u64 + 1;
        Self {
            agents: urn,
            protocol,
            rng,
            epoch_length,
            num_interactions: 0,
            num_epochs: 0,
        }
    }

    pub fn run<M: FnMut(&Self) -> bool>(&mut self, mut monitor: M) {
        loop {
            for _ in 0..self.epoch_length {
                self.single_interaction();
            }
            self.num_interactions += self.epoch_length;
            self.num_epochs += 1;
            if !monitor(self) {
                break;
            }
        }
    }

    pub fn agents(&self) -> &U {
        &self.agents
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    fn single_interaction(&mut self) {
        // the initiator may change, so it leaves the urn first
        let first = self.agents.draw_random(&mut *self.rng);

        // a one-way responder never changes; peeking saves the reinsert
        let second = if P::ONE_WAY {
            self.agents.peek_random(&mut *self.rng)
        } else {
            self.agents.draw_random(&mut *self.rng)
        };

        let (a, b) = self.protocol.transition(first, second);
        self.agents.add(a, 1);
        if !P::ONE_WAY {
            self.agents.add(b, 1);
        }
    }
}

impl<'a, U: Urn, P: Protocol, R: Rng> Simulator for DistributionSimulator<'a, U, P, R> {
    fn num_interactions(&self) -> u64 {
        self.num_interactions
    }

    fn num_runs(&self) -> u64 {
        0
    }

    fn num_epochs(&self) -> u64 {
        self.num_epochs
    }

    fn num_agents(&self) -> u64 {
        self.agents.num_balls()
    }

    fn target_epoch_length(&self) -> u64 {
        self.epoch_length
    }
}

/// Array-backed naive simulator: every agent is an explicit slot, an
/// interaction picks two distinct indices. The cache-friendliest baseline
/// for small state counts.
pub struct PopulationSimulator<'a, P: Protocol, R: Rng> {
    population: Vec<State>,
    num_states: usize,
    protocol: P,
    rng: &'a mut R,
    epoch_length: u64,

    num_interactions: u64,
    num_epochs: u64,
}

impl<'a, P: Protocol, R: Rng> PopulationSimulator<'a, P, R> {
    pub fn new<U: Urn>(urn: &U, protocol: P, rng: &'a mut R) -> Self {
        assert!(urn.num_balls() > 1, "need at least two agents");

        let mut population = Vec::with_capacity(urn.num_balls() as usize);
        for state in 0..urn.num_colors() {
            population.resize(population.len() + urn.count(state) as usize, state);
        }

        let epoch_length = (population.len() as f64).sqrt() as u64 + 1;
        Self {
            population,
            num_states: urn.num_colors(),
            protocol,
            rng,
            epoch_length,
            num_interactions: 0,
            num_epochs: 0,
        }
    }

    pub fn run<M: FnMut(&Self) -> bool>(&mut self, mut monitor: M) {
        loop {
            for _ in 0..self.epoch_length {
                self.single_interaction();
            }
            self.num_interactions += self.epoch_length;
            self.num_epochs += 1;
            if !monitor(self) {
                break;
            }
        }
    }

    pub fn population(&self) -> &[State] {
        &self.population
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Materializes the configuration as an urn. Walks the whole population,
    /// so use it for reporting only.
    pub fn agents(&self) -> LinearUrn {
        let mut urn = LinearUrn::with_colors(self.num_states);
        for &state in &self.population {
            urn.add(state, 1);
        }
        urn
    }

    fn single_interaction(&mut self) {
        let first = self.rng.gen_range(0..self.population.len());
        let second = loop {
            let candidate = self.rng.gen_range(0..self.population.len());
            if candidate != first {
                break candidate;
            }
        };

        let (a, b) = self
            .protocol
            .transition(self.population[first], self.population[second]);
        debug_assert!(a < self.num_states && b < self.num_states);

        self.population[first] = a;
        if !P::ONE_WAY {
            self.population[second] = b;
        }
    }
}

impl<'a, P: Protocol, R: Rng> Simulator for PopulationSimulator<'a, P, R> {
    fn num_interactions(&self) -> u64 {
        self.num_interactions
    }

    fn num_runs(&self) -> u64 {
        0
    }

    fn num_epochs(&self) -> u64 {
        self.num_epochs
    }

    fn num_agents(&self) -> u64 {
        self.population.len() as u64
    }

    fn target_epoch_length(&self) -> u64 {
        self.epoch_length
    }
}

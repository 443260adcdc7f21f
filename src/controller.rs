//! Online tuning of the batch size.
//!
//! The engine's throughput depends on how many interactions an epoch packs:
//! too few and the per-epoch overhead dominates, too many and the delayed
//! pool grows so large that collision handling eats the gain. Rather than
//! deriving the optimum, measure it: cycle through three candidate lengths
//! (10% below, at, and 10% above the current best), time each for a fixed
//! number of epochs, and keep the fastest. The measurement window is itself
//! recalibrated so a full cycle stays around 60 ms of wall clock.

use std::time::Instant;

const TARGET_MS_PER_PHASE: f64 = 60.0;
const CALIBRATION_BIAS: f64 = 0.8;
const MIN_EPOCHS_PER_PHASE: u64 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    MeasureBelow = 0,
    MeasureCurrent = 1,
    MeasureAbove = 2,
}

impl Phase {
    fn next(self) -> Option<Phase> {
        match self {
            Phase::MeasureBelow => Some(Phase::MeasureCurrent),
            Phase::MeasureCurrent => Some(Phase::MeasureAbove),
            Phase::MeasureAbove => None,
        }
    }

    fn scale(self) -> f64 {
        1.0 + (self as i32 - 1) as f64 * 0.1
    }
}

pub struct EpochLengthController {
    min: u64,
    max: u64,
    current_best: u64,
    current_measurement: u64,

    phase: Phase,
    epochs_per_phase: u64,
    epochs_in_phase: u64,
    throughputs: [f64; 3],

    phase_start: Instant,
    measure_start: Instant,
    interactions_at_measure_start: u64,
}

impl EpochLengthController {
    /// Derives the search range from the population size: batches between
    /// n^0.4 and n^0.8, starting at n^0.6.
    pub fn new(num_agents: u64) -> Self {
        let n = num_agents as f64;
        let min = n.powf(0.4) as u64 + 1;
        let max = (n.powf(0.8) as u64 + 1).min(num_agents);
        let current_best = (n.powf(0.6) as u64 + 1).min(max);
        Self::with_range(min, max, current_best)
    }

    pub fn with_range(min: u64, max: u64, current_best: u64) -> Self {
        assert!(min <= max, "degenerate epoch-length range");
        let now = Instant::now();
        Self {
            min,
            max,
            current_best,
            current_measurement: current_best,
            phase: Phase::MeasureBelow,
            epochs_per_phase: MIN_EPOCHS_PER_PHASE,
            epochs_in_phase: 0,
            throughputs: [0.0; 3],
            phase_start: now,
            measure_start: now,
            interactions_at_measure_start: 0,
        }
    }

    /// Arms the measurement clocks; call right before the first epoch.
    pub fn start(&mut self) {
        self.phase = Phase::MeasureBelow;
        self.phase_start = Instant::now();
        self.measure_start = self.phase_start;
        self.epochs_in_phase = 0;
        self.current_measurement = self.value_for(self.phase);
    }

    /// Feeds the interaction counter after every epoch.
    pub fn update(&mut self, num_interactions: u64) {
        if self.epochs_in_phase < self.epochs_per_phase {
            self.epochs_in_phase += 1;
            return;
        }
        self.epochs_in_phase = 0;

        let now = Instant::now();
        let elapsed = now.duration_since(self.measure_start).as_secs_f64();
        let progress = num_interactions - self.interactions_at_measure_start;
        self.throughputs[self.phase as usize] = progress as f64 / elapsed.max(f64::MIN_POSITIVE);
        self.measure_start = now;
        self.interactions_at_measure_start = num_interactions;

        match self.phase.next() {
            Some(next) => self.phase = next,
            None => {
                // all three measurements are in; adopt the fastest
                let best = [Phase::MeasureBelow, Phase::MeasureCurrent, Phase::MeasureAbove]
                    .into_iter()
                    .max_by(|a, b| {
                        self.throughputs[*a as usize].total_cmp(&self.throughputs[*b as usize])
                    })
                    .unwrap();
                self.current_best = self.value_for(best);
                self.phase = Phase::MeasureBelow;

                let phase_ms = now.duration_since(self.phase_start).as_secs_f64() * 1_000.0;
                let scaled = self.epochs_per_phase as f64
                    * (CALIBRATION_BIAS
                        + (1.0 - CALIBRATION_BIAS) * TARGET_MS_PER_PHASE / phase_ms);
                self.epochs_per_phase = (scaled as u64).max(MIN_EPOCHS_PER_PHASE);
                self.phase_start = now;
            }
        }

        self.current_measurement = self.value_for(self.phase);
    }

    fn value_for(&self, phase: Phase) -> u64 {
        let value = (self.current_best as f64 * phase.scale()) as u64;
        value.clamp(self.min, self.max)
    }

    #[allow(dead_code)]
    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Epoch length to use for the epoch being built.
    pub fn current(&self) -> u64 {
        self.current_measurement
    }

    /// Best known epoch length (the tuning target).
    pub fn current_best(&self) -> u64 {
        self.current_best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_derived_from_population() {
        let ctrl = EpochLengthController::new(1_000_000);
        assert_eq!(ctrl.min(), (1e6_f64.powf(0.4)) as u64 + 1);
        assert_eq!(ctrl.max(), (1e6_f64.powf(0.8)) as u64 + 1);
        assert!(ctrl.current_best() >= ctrl.min() && ctrl.current_best() <= ctrl.max());
    }

    #[test]
    fn test_max_clamped_to_population() {
        let ctrl = EpochLengthController::new(4);
        assert!(ctrl.max() <= 4);
        assert!(ctrl.current_best() <= ctrl.max());
    }

    #[test]
    fn test_measurement_stays_in_range() {
        let mut ctrl = EpochLengthController::with_range(100, 200, 150);
        ctrl.start();
        let mut interactions = 0;
        for _ in 0..500 {
            interactions += ctrl.current();
            ctrl.update(interactions);
            assert!(ctrl.current() >= 100 && ctrl.current() <= 200);
            assert!(ctrl.current_best() >= 100 && ctrl.current_best() <= 200);
        }
    }

    #[test]
    fn test_cycles_through_all_three_phases() {
        let mut ctrl = EpochLengthController::with_range(1_000, 100_000, 10_000);
        ctrl.start();
        let mut seen = std::collections::HashSet::new();
        let mut interactions = 0;
        for _ in 0..100 {
            seen.insert(ctrl.current());
            interactions += ctrl.current();
            ctrl.update(interactions);
        }
        // below / current / above candidates must all have been proposed
        assert!(seen.len() >= 3, "saw only {:?}", seen);
    }
}

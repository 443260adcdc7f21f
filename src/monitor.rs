//! Epoch observers: the accessor trait all simulators share and a
//! round-based progress monitor.
//!
//! Simulators yield to their monitor after every epoch; returning `false`
//! ends the run after the epoch that just completed. That makes cancellation
//! cooperative and epoch-granular, which is the only control-flow exit the
//! simulators have.

use std::time::Instant;

/// Read-only counters every simulator exposes to monitors and reporting.
pub trait Simulator {
    fn num_interactions(&self) -> u64;
    fn num_runs(&self) -> u64;
    fn num_epochs(&self) -> u64;
    fn num_agents(&self) -> u64;
    fn target_epoch_length(&self) -> u64;
}

/// Handle a report callback can use to request a graceful stop.
pub struct MonitorControl {
    stop_requested: bool,
}

impl MonitorControl {
    #[allow(dead_code)]
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }
}

/// Converts epoch ticks into round-based reporting: one round is `n`
/// interactions. Invokes the wrapped callback every `report_gap` rounds and
/// stops the simulation after `stop_round` rounds (0 means never).
pub struct RoundMonitor<C> {
    callback: C,
    stop_round: u64,
    report_gap: u64,
    next_report_round: u64,

    started: Instant,
    last_report: Instant,
    interactions_at_last_report: u64,
    runs_at_last_report: u64,
    epochs_at_last_report: u64,
}

impl<C> RoundMonitor<C> {
    pub fn new(report_gap: u64, stop_round: u64, callback: C) -> Self {
        let now = Instant::now();
        Self {
            callback,
            stop_round,
            report_gap,
            next_report_round: if report_gap == 0 { u64::MAX } else { report_gap },
            started: now,
            last_report: now,
            interactions_at_last_report: 0,
            runs_at_last_report: 0,
            epochs_at_last_report: 0,
        }
    }

    /// Feed one completed epoch; the return value is the simulator's
    /// keep-running signal.
    pub fn tick<S: Simulator>(&mut self, sim: &S) -> bool
    where
        C: FnMut(&S, &mut MonitorControl),
    {
        let round = sim.num_interactions() / sim.num_agents();
        let mut control = MonitorControl {
            stop_requested: false,
        };

        if self.stop_round > 0 && round >= self.stop_round {
            if self.report_gap > 0 {
                self.report(sim);
            }
            (self.callback)(sim, &mut control);
            return false;
        }

        if round >= self.next_report_round {
            self.report(sim);
            (self.callback)(sim, &mut control);
            self.next_report_round += self.report_gap;
            if control.stop_requested {
                println!("stopped early as requested by the report callback");
                return false;
            }
        }

        true
    }

    fn report<S: Simulator>(&mut self, sim: &S) {
        let now = Instant::now();
        let total_ms = now.duration_since(self.started).as_secs_f64() * 1_000.0;
        let delta_ms = now.duration_since(self.last_report).as_secs_f64() * 1_000.0;
        let through_total = sim.num_interactions() as f64 / total_ms / 1_000.0;
        let through_delta = (sim.num_interactions() - self.interactions_at_last_report) as f64
            / delta_ms
            / 1_000.0;

        let epochs = (sim.num_epochs() - self.epochs_at_last_report).max(1);
        let runs = sim.num_runs() - self.runs_at_last_report;
        // batch-size exponent: how the tuned epoch length relates to n
        let exponent =
            (sim.target_epoch_length() as f64).ln() / (sim.num_agents() as f64).ln();

        println!(
            "round {:>8}: {:>10.1} ms total ({:>7.2} inter/us), {:>10.1} ms since last ({:>7.2} inter/us)",
            sim.num_interactions() / sim.num_agents(),
            total_ms,
            through_total,
            delta_ms,
            through_delta
        );
        println!(
            "  epoch target length n^{:.2}, {} runs per epoch",
            exponent,
            runs / epochs
        );

        self.last_report = now;
        self.interactions_at_last_report = sim.num_interactions();
        self.runs_at_last_report = sim.num_runs();
        self.epochs_at_last_report = sim.num_epochs();
    }
}

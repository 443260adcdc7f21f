//! Population protocol simulator.
//!
//! Simulates pairwise interactions between anonymous agents: every step
//! draws two agents without replacement and rewrites their states through a
//! protocol's transition function. The batch simulator advances many
//! interactions per epoch and is the default; the two reference simulators
//! exist as baselines and for cross-checking. Each run prints one CSV
//! summary line.

mod alias_urn;
mod collision;
mod controller;
mod engine;
mod monitor;
mod protocol;
mod protocols;
mod reference;
mod rng;
mod tree_urn;
mod urn;

use std::env;
use std::fs;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use alias_urn::AliasUrn;
use engine::BatchSimulator;
use monitor::{MonitorControl, RoundMonitor, Simulator};
use protocol::Protocol;
use protocols::{Clock, ClockState, IncrementOneWay, LeaderElection, Majority, MajorityState, RandomOneWay, RandomTwoWay};
use reference::{DistributionSimulator, PopulationSimulator};
use rng::BlockRng;
use tree_urn::TreeUrn;
use urn::{LinearUrn, Urn};

const CSV_HEADER: &str =
    "simulator,protocol,num_agents,num_states,num_rounds,seed,num_interactions,walltime";

/// Run configuration (can be loaded from YAML via --config)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Simulator: "batch", "distr", or "pop"
    pub simulator: String,
    /// Protocol: leader, majority, clock, running-clock, random1, random2,
    /// increment
    pub protocol: String,
    /// Urn backend for the urn-based simulators: "tree", "alias", "linear"
    pub urn: String,
    /// Number of agents (start of the doubling sweep if max_agents is set)
    pub agents: u64,
    /// Upper end of the doubling sweep over agent counts (0 = no sweep)
    pub max_agents: u64,
    /// Number of states (protocols with a fixed alphabet ignore this)
    pub states: usize,
    /// Stop after this many rounds of n interactions each
    pub rounds: u64,
    /// Repeat the whole sweep this often
    pub repeats: u32,
    pub seed: u64,
    /// Wall-clock budget per run in seconds
    pub time_budget_secs: f64,
    /// Rounds between progress reports (0 = quiet, CSV only)
    pub report_gap: u64,
    /// Print an ASCII histogram of the configuration at every report
    pub histogram: bool,
    /// Pull random numbers from a background producer thread
    pub block_rng: bool,

    #[serde(skip)]
    header_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulator: "batch".to_string(),
            protocol: "random1".to_string(),
            urn: "tree".to_string(),
            agents: 1_024,
            max_agents: 0,
            states: 20,
            rounds: 10,
            repeats: 1,
            seed: 1,
            time_budget_secs: 10.0,
            report_gap: 0,
            histogram: false,
            block_rng: false,
            header_only: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SimulatorKind {
    Batch,
    Distribution,
    Population,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ProtocolKind {
    Leader,
    Majority,
    Clock,
    RunningClock,
    RandomOneWay,
    RandomTwoWay,
    Increment,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UrnKind {
    Tree,
    Alias,
    Linear,
}

impl Config {
    fn from_yaml(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    fn write_template(path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let yaml = serde_yaml::to_string(&Config::default())?;
        fs::write(path, yaml)?;
        Ok(())
    }

    fn simulator_kind(&self) -> Result<SimulatorKind, String> {
        match self.simulator.as_str() {
            "batch" => Ok(SimulatorKind::Batch),
            "distr" => Ok(SimulatorKind::Distribution),
            "pop" => Ok(SimulatorKind::Population),
            other => Err(format!("unknown simulator '{}'", other)),
        }
    }

    fn protocol_kind(&self) -> Result<ProtocolKind, String> {
        match self.protocol.as_str() {
            "leader" => Ok(ProtocolKind::Leader),
            "majority" => Ok(ProtocolKind::Majority),
            "clock" => Ok(ProtocolKind::Clock),
            "running-clock" => Ok(ProtocolKind::RunningClock),
            "random1" => Ok(ProtocolKind::RandomOneWay),
            "random2" => Ok(ProtocolKind::RandomTwoWay),
            "increment" => Ok(ProtocolKind::Increment),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }

    fn urn_kind(&self) -> Result<UrnKind, String> {
        match self.urn.as_str() {
            "tree" => Ok(UrnKind::Tree),
            "alias" => Ok(UrnKind::Alias),
            "linear" => Ok(UrnKind::Linear),
            other => Err(format!("unknown urn '{}'", other)),
        }
    }

    fn validate(&self) -> Result<(), String> {
        self.simulator_kind()?;
        let protocol = self.protocol_kind()?;
        self.urn_kind()?;

        if self.agents < 2 {
            return Err("need at least two agents".to_string());
        }
        if self.states < 2 {
            return Err("need at least two states".to_string());
        }
        if matches!(protocol, ProtocolKind::Clock | ProtocolKind::RunningClock)
            && (self.states % 2 != 0 || self.states < 4)
        {
            return Err("clock protocols need an even number of states >= 4".to_string());
        }
        if self.rounds == 0 && self.time_budget_secs <= 0.0 {
            return Err("either rounds or a time budget must bound the run".to_string());
        }
        Ok(())
    }
}

fn usage_and_exit(message: Option<&str>) -> ! {
    if let Some(m) = message {
        eprintln!("Error: {}\n", m);
    }
    eprintln!("popsim - population protocol simulator");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  popsim [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("  -c, --config FILE     Load configuration from YAML file");
    eprintln!("      --generate-config [FILE]  Write a config template and exit");
    eprintln!("  -a, --simulator NAME  batch | distr | pop (default: batch)");
    eprintln!("  -p, --protocol NAME   leader | majority | clock | running-clock |");
    eprintln!("                        random1 | random2 | increment (default: random1)");
    eprintln!("  -u, --urn NAME        tree | alias | linear (default: tree)");
    eprintln!("  -n, --agents N        Number of agents (default: 1024)");
    eprintln!("  -N, --max-agents N    Double the agent count up to N per repeat");
    eprintln!("  -d, --states N        Number of states (default: 20)");
    eprintln!("  -r, --rounds N        Rounds of n interactions to simulate (default: 10)");
    eprintln!("  -R, --repeats N       Repeat each run N times (default: 1)");
    eprintln!("  -s, --seed N          Seed value (default: 1)");
    eprintln!("  -t, --time SECS       Time budget per run in seconds (default: 10)");
    eprintln!("  -g, --report-gap N    Report progress every N rounds (default: quiet)");
    eprintln!("      --histogram       Print the configuration histogram at reports");
    eprintln!("      --block-rng       Generate randomness on a background thread");
    eprintln!("      --header-only     Print the CSV header and exit");
    std::process::exit(if message.is_some() { 1 } else { 0 });
}

fn parse_args() -> Config {
    let argv: Vec<String> = env::args().collect();
    let mut config = Config::default();

    // first pass: config file handling, so CLI flags can override the file
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= argv.len() {
                    usage_and_exit(Some("--config needs a file path"));
                }
                match Config::from_yaml(&argv[i]) {
                    Ok(loaded) => config = loaded,
                    Err(e) => {
                        eprintln!("error loading config file '{}': {}", argv[i], e);
                        std::process::exit(1);
                    }
                }
            }
            "--generate-config" => {
                let path = if i + 1 < argv.len() && !argv[i + 1].starts_with('-') {
                    argv[i + 1].clone()
                } else {
                    "popsim.yaml".to_string()
                };
                match Config::write_template(&path) {
                    Ok(()) => {
                        println!("wrote config template: {}", path);
                        std::process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("error writing config template: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    // second pass: flags override config file values
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1; // handled in the first pass
            }
            "--generate-config" => {}
            "--simulator" | "-a" => {
                i += 1;
                config.simulator = argv[i].clone();
            }
            "--protocol" | "-p" => {
                i += 1;
                config.protocol = argv[i].clone();
            }
            "--urn" | "-u" => {
                i += 1;
                config.urn = argv[i].clone();
            }
            "--agents" | "-n" => {
                i += 1;
                config.agents = argv[i].parse().expect("invalid agents");
            }
            "--max-agents" | "-N" => {
                i += 1;
                config.max_agents = argv[i].parse().expect("invalid max-agents");
            }
            "--states" | "-d" => {
                i += 1;
                config.states = argv[i].parse().expect("invalid states");
            }
            "--rounds" | "-r" => {
                i += 1;
                config.rounds = argv[i].parse().expect("invalid rounds");
            }
            "--repeats" | "-R" => {
                i += 1;
                config.repeats = argv[i].parse().expect("invalid repeats");
            }
            "--seed" | "-s" => {
                i += 1;
                config.seed = argv[i].parse().expect("invalid seed");
            }
            "--time" | "-t" => {
                i += 1;
                config.time_budget_secs = argv[i].parse().expect("invalid time budget");
            }
            "--report-gap" | "-g" => {
                i += 1;
                config.report_gap = argv[i].parse().expect("invalid report-gap");
            }
            "--histogram" => config.histogram = true,
            "--block-rng" => config.block_rng = true,
            "--header-only" => config.header_only = true,
            "--help" | "-h" => usage_and_exit(None),
            other => usage_and_exit(Some(&format!("unknown option '{}'", other))),
        }
        i += 1;
    }

    config
}

fn main() {
    let config = parse_args();

    if config.header_only {
        println!("{}", CSV_HEADER);
        return;
    }

    if let Err(e) = config.validate() {
        usage_and_exit(Some(&e));
    }

    if config.block_rng {
        let rng = BlockRng::new(StdRng::seed_from_u64(config.seed), 16);
        drive(&config, rng);
    } else {
        drive(&config, StdRng::seed_from_u64(config.seed));
    }
}

/// Runs the configured sweep: doubling agent counts until the budget or the
/// configured maximum is hit, repeated as requested.
fn drive<R: Rng>(config: &Config, mut rng: R) {
    let max_agents = if config.max_agents == 0 {
        config.agents
    } else {
        config.max_agents
    };

    for _ in 0..config.repeats {
        let mut num_agents = config.agents;
        loop {
            let elapsed = run_once(config, num_agents, &mut rng);
            if elapsed >= config.time_budget_secs {
                break;
            }
            num_agents = num_agents.saturating_mul(2);
            if num_agents > max_agents {
                break;
            }
        }
    }
}

/// Spreads `total` agents over `slots` states starting at `offset`, exactly.
fn spread_uniformly(counts: &mut [u64], offset: usize, slots: usize, total: u64) {
    let mut remaining = total;
    for s in 0..slots {
        let n = remaining / (slots - s) as u64;
        counts[offset + s] = n;
        remaining -= n;
    }
}

fn run_once<R: Rng>(config: &Config, num_agents: u64, rng: &mut R) -> f64 {
    let protocol = config.protocol_kind().expect("validated earlier");

    match protocol {
        ProtocolKind::Leader => {
            let mut counts = vec![0u64; 2];
            counts[LeaderElection::LEADER] = num_agents;
            with_urn(config, num_agents, &counts, LeaderElection, rng)
        }
        ProtocolKind::Majority => {
            let p = Majority;
            let minority = num_agents / 4;
            let mut counts = vec![0u64; 4];
            counts[p.encode(MajorityState {
                opinion: false,
                strong: true,
            })] = minority;
            counts[p.encode(MajorityState {
                opinion: true,
                strong: true,
            })] = num_agents - minority;
            with_urn(config, num_agents, &counts, p, rng)
        }
        ProtocolKind::Clock => {
            let clock = Clock::new((config.states / 2) as u32);
            let num_marked = (num_agents as f64).sqrt() as u64 + 1;
            let mut counts = vec![0u64; clock.num_states()];
            spread_uniformly(&mut counts, 0, config.states / 2, num_agents - num_marked);
            spread_uniformly(&mut counts, config.states / 2, config.states / 2, num_marked);
            with_urn(config, num_agents, &counts, clock, rng)
        }
        ProtocolKind::RunningClock => {
            // everyone at digit zero, the marked agents start the wave
            let clock = Clock::new((config.states / 2) as u32);
            let num_marked = (num_agents as f64).sqrt() as u64 + 1;
            let mut counts = vec![0u64; clock.num_states()];
            counts[clock.encode(ClockState {
                digit: 0,
                marked: false,
            })] = num_agents - num_marked;
            counts[clock.encode(ClockState {
                digit: 0,
                marked: true,
            })] = num_marked;
            with_urn(config, num_agents, &counts, clock, rng)
        }
        ProtocolKind::RandomOneWay => {
            let p = RandomOneWay::new(rng, config.states);
            let mut counts = vec![0u64; config.states];
            spread_uniformly(&mut counts, 0, config.states, num_agents);
            with_urn(config, num_agents, &counts, p, rng)
        }
        ProtocolKind::RandomTwoWay => {
            let p = RandomTwoWay::new(rng, config.states);
            let mut counts = vec![0u64; config.states];
            spread_uniformly(&mut counts, 0, config.states, num_agents);
            with_urn(config, num_agents, &counts, p, rng)
        }
        ProtocolKind::Increment => {
            let mut counts = vec![0u64; config.states];
            counts[0] = num_agents;
            with_urn(config, num_agents, &counts, IncrementOneWay::new(config.states), rng)
        }
    }
}

fn with_urn<P: Protocol, R: Rng>(
    config: &Config,
    num_agents: u64,
    counts: &[u64],
    protocol: P,
    rng: &mut R,
) -> f64 {
    match config.urn_kind().expect("validated earlier") {
        UrnKind::Tree => run_sim(config, num_agents, TreeUrn::from_counts(counts), protocol, rng),
        UrnKind::Alias => run_sim(config, num_agents, AliasUrn::from_counts(counts), protocol, rng),
        UrnKind::Linear => {
            run_sim(config, num_agents, LinearUrn::from_counts(counts), protocol, rng)
        }
    }
}

fn run_sim<U: Urn, P: Protocol, R: Rng>(
    config: &Config,
    num_agents: u64,
    urn: U,
    protocol: P,
    rng: &mut R,
) -> f64 {
    let budget = config.time_budget_secs;
    let start = Instant::now();

    let num_interactions = match config.simulator_kind().expect("validated earlier") {
        SimulatorKind::Batch => {
            let mut sim = BatchSimulator::new(urn, protocol, rng);
            let mut monitor = RoundMonitor::new(
                config.report_gap,
                config.rounds,
                |s: &BatchSimulator<'_, U, P, R>, _: &mut MonitorControl| {
                    if config.histogram {
                        print_histogram(s.agents());
                    }
                },
            );
            sim.run(|s| monitor.tick(s) && start.elapsed().as_secs_f64() < budget);
            sim.num_interactions()
        }
        SimulatorKind::Distribution => {
            let mut sim = DistributionSimulator::new(urn, protocol, rng);
            let mut monitor = RoundMonitor::new(
                config.report_gap,
                config.rounds,
                |s: &DistributionSimulator<'_, U, P, R>, _: &mut MonitorControl| {
                    if config.histogram {
                        print_histogram(s.agents());
                    }
                },
            );
            sim.run(|s| monitor.tick(s) && start.elapsed().as_secs_f64() < budget);
            sim.num_interactions()
        }
        SimulatorKind::Population => {
            let mut sim = PopulationSimulator::new(&urn, protocol, rng);
            let mut monitor = RoundMonitor::new(
                config.report_gap,
                config.rounds,
                |s: &PopulationSimulator<'_, P, R>, _: &mut MonitorControl| {
                    if config.histogram {
                        print_histogram(&s.agents());
                    }
                },
            );
            sim.run(|s| monitor.tick(s) && start.elapsed().as_secs_f64() < budget);
            sim.num_interactions()
        }
    };

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "{},{},{},{},{},{},{},{:.6}",
        config.simulator,
        config.protocol,
        num_agents,
        config.states,
        config.rounds,
        config.seed,
        num_interactions,
        elapsed
    );
    elapsed
}

fn print_histogram<U: Urn>(agents: &U) {
    const WIDTH: u64 = 60;
    let total = agents.num_balls();
    if total == 0 {
        return;
    }
    for color in 0..agents.num_colors() {
        let n = agents.count(color);
        if n == 0 {
            continue;
        }
        let bar = (n * WIDTH / total) as usize;
        println!(
            "{:>5} |{}{}| {:>12}",
            color,
            "*".repeat(bar),
            " ".repeat(WIDTH as usize - bar),
            n
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_names() {
        let mut config = Config::default();
        config.simulator = "warp".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.protocol = "clock".to_string();
        config.states = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let mut config = Config::default();
        config.protocol = "majority".to_string();
        config.agents = 4_096;

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.protocol, "majority");
        assert_eq!(parsed.agents, 4_096);
    }

    #[test]
    fn test_spread_uniformly_is_exact() {
        let mut counts = vec![0u64; 10];
        spread_uniformly(&mut counts, 0, 7, 1_000);
        assert_eq!(counts.iter().sum::<u64>(), 1_000);
        assert!(counts[7..].iter().all(|&c| c == 0));
        assert!(counts[..7].iter().all(|&c| c == 142 || c == 143));
    }
}

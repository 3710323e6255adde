use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use socmem::coherence::CoherenceProtocol;
use socmem::sim::config::DriverConfig;
use socmem::sim::top::MemorySystem;
use socmem::traffic::TrafficDriver;
use toml::Table;

#[derive(Parser)]
#[command(version, about)]
struct SocmemArgs {
    #[arg(help = "Path to config.toml")]
    config_path: Option<PathBuf>,
    #[arg(long, help = "Override number of agents")]
    num_agents: Option<usize>,
    #[arg(long, value_enum, help = "Override coherence protocol")]
    protocol: Option<ProtocolArg>,
    #[arg(long, help = "Override total number of requests")]
    requests: Option<u64>,
    #[arg(long, help = "Override traffic seed")]
    seed: Option<u64>,
    #[arg(long, help = "Stream the command log to this file as JSON lines")]
    command_log: Option<PathBuf>,
    #[arg(long, help = "Enable log at level (0:warn, 1:info, 2:debug, 3:trace)")]
    log: Option<u64>,
    #[arg(long, help = "Write the metrics JSON here instead of stdout")]
    output: Option<PathBuf>,
    #[arg(long, help = "Include the topology in the output")]
    topology: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProtocolArg {
    Mesi,
    Moesi,
}

fn level(log: u64) -> LevelFilter {
    match log {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn load_config(argv: &SocmemArgs) -> Result<DriverConfig> {
    let table: Table = match &argv.config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))?
        }
        None => Table::new(),
    };
    let mut config = DriverConfig::from_table(&table).context("invalid configuration")?;

    // override toml configs with argv
    let sim = &mut config.system.sim;
    sim.num_agents = argv.num_agents.unwrap_or(sim.num_agents);
    sim.log_level = argv.log.unwrap_or(sim.log_level);
    if let Some(protocol) = argv.protocol {
        sim.protocol = match protocol {
            ProtocolArg::Mesi => CoherenceProtocol::Mesi,
            ProtocolArg::Moesi => CoherenceProtocol::Moesi,
        };
    }
    if argv.command_log.is_some() {
        sim.command_log = argv.command_log.clone();
    }
    config.traffic.requests = argv.requests.unwrap_or(config.traffic.requests);
    config.traffic.seed = argv.seed.unwrap_or(config.traffic.seed);
    Ok(config)
}

pub fn main() -> Result<()> {
    let argv = SocmemArgs::parse();
    let config = load_config(&argv)?;

    let mut builder = env_logger::Builder::from_default_env();
    if config.system.sim.log_level > 0 || std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(level(config.system.sim.log_level));
    }
    builder.init();

    let num_agents = config.system.sim.num_agents;
    let mut system =
        MemorySystem::new(config.system.clone()).context("cannot build the memory system")?;
    let mut driver =
        TrafficDriver::new(&config.traffic, num_agents).context("invalid traffic configuration")?;
    let report = driver
        .run(&mut system)
        .with_context(|| format!("simulation failed at cycle {}", system.now()))?;

    let mut output = serde_json::to_value(&report).context("cannot serialize metrics")?;
    if argv.topology {
        output["topology"] =
            serde_json::to_value(system.topology()).context("cannot serialize topology")?;
    }
    let text = serde_json::to_string_pretty(&output)?;
    match &argv.output {
        Some(path) => fs::write(path, text + "\n")
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => println!("{text}"),
    }
    Ok(())
}

//! Application definition.

extern crate simplelog;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;

use dspace_core::{Communicator, Config, Inspector, LocalCluster};
use dspace_net::{QueryClient, QueryServer, TcpComm, TcpCommConfig};

use crate::inspect::{self, Queries};
use crate::workload::{self, LoadMetric, Settings, Summary};

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

fn workload_args<'a, 'b>() -> Vec<Arg<'a, 'b>> {
    vec![
        Arg::with_name("config")
            .long("config")
            .short("c")
            .takes_value(true)
            .value_name("path")
            .help("Path to a toml or yaml config file"),
        Arg::with_name("extent")
            .long("extent")
            .takes_value(true)
            .value_name("x,y,..")
            .help("Domain extent, overrides the config file (default 64,64)"),
        Arg::with_name("toroidal")
            .long("toroidal")
            .help("Wrap the domain around at its edges"),
        Arg::with_name("steps")
            .long("steps")
            .short("s")
            .takes_value(true)
            .value_name("count")
            .help("Number of steps to run"),
        Arg::with_name("walkers")
            .long("walkers")
            .takes_value(true)
            .value_name("count")
            .help("Walkers created by rank 0, rank n creates n + 1 times as many"),
        Arg::with_name("seed")
            .long("seed")
            .takes_value(true)
            .value_name("number"),
        Arg::with_name("load")
            .long("load")
            .takes_value(true)
            .possible_values(&["time", "walkers"])
            .help("What counts as load when balancing"),
        Arg::with_name("publish-interval")
            .long("publish-interval")
            .takes_value(true)
            .value_name("steps")
            .help("Steps between inspector publishes, 0 disables publishing"),
        Arg::with_name("inspect")
            .long("inspect")
            .takes_value(true)
            .value_name("address")
            .help("Serve inspection queries at the given address (e.g. 127.0.0.1:9123)"),
    ]
}

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("dspace")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run and inspect spatially partitioned simulations.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))

        // run subcommand
        .subcommand(SubCommand::with_name("run")
            .display_order(10)
            .about("Run the demo workload with every participant in this process")
            .arg(Arg::with_name("procs")
                .long("procs")
                .short("p")
                .takes_value(true)
                .default_value("4")
                .value_name("count")
                .help("Number of participants, must match the split scheme"))
            .args(&workload_args()))

        // worker subcommand
        .subcommand(SubCommand::with_name("worker")
            .display_order(20)
            .about("Run a single participant of the demo workload over TCP")
            .long_about("Run a single participant of the demo workload over TCP.\n\n\
            Every worker is started with the same list of peer addresses and \n\
            its own rank within that list. Workers connect to each other and \n\
            start stepping once all of them are up. Only rank 0 serves \n\
            inspection queries.")
            .arg(Arg::with_name("rank")
                .long("rank")
                .short("r")
                .required(true)
                .takes_value(true)
                .value_name("rank"))
            .arg(Arg::with_name("peers")
                .long("peers")
                .required(true)
                .takes_value(true)
                .value_name("addresses")
                .help("Comma separated addresses of all workers, in rank order"))
            .args(&workload_args()))

        // inspect subcommand
        .subcommand(SubCommand::with_name("inspect")
            .display_order(30)
            .about("Query the snapshot published by a running deployment")
            .arg(Arg::with_name("server")
                .long("server")
                .short("s")
                .required(true)
                .takes_value(true)
                .value_name("address"))
            .arg(Arg::with_name("owner")
                .long("owner")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("x,y,..")
                .help("Print the process owning the given cell"))
            .arg(Arg::with_name("leaf")
                .long("leaf")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("pid")
                .help("Only fetch storage of the given leaf")))
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("run", Some(m)) => start_run(m),
        ("worker", Some(m)) => start_worker(m),
        ("inspect", Some(m)) => start_inspect(m),
        _ => Ok(()),
    }
}

fn start_run(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let (config, settings) = load_config(matches)?;
    let procs: usize = matches.value_of("procs").unwrap_or("4").parse()?;
    let running = setup_interrupt()?;

    let inspector = Arc::new(Inspector::new());
    let server = match matches.value_of("inspect") {
        Some(addr) => Some(start_query_server(addr, inspector.clone())?),
        None => None,
    };

    println!(
        "running {} steps on {} participants, domain {:?}",
        settings.steps, procs, config.domain.extent
    );
    let shared = (config, settings, inspector, running.clone());
    let results = LocalCluster::run(procs, move |comm| {
        let (config, settings, inspector, running) = &shared;
        let inspector = match comm.rank() {
            0 => Some(inspector.clone()),
            _ => None,
        };
        workload::run(comm, config, settings, inspector, running.clone())
    });
    let mut summaries = Vec::with_capacity(results.len());
    for result in results {
        summaries.push(result?);
    }
    print_summaries(&summaries);

    if let Some((flag, handle)) = server {
        hold_until_interrupted(&running);
        flag.store(false, Ordering::SeqCst);
        if let Ok(result) = handle.join() {
            result?;
        }
    }
    Ok(())
}

fn start_worker(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let (config, settings) = load_config(matches)?;
    let rank: usize = matches
        .value_of("rank")
        .ok_or_else(|| Error::msg("rank must be provided"))?
        .parse()?;
    let peers = matches
        .value_of("peers")
        .ok_or_else(|| Error::msg("peer addresses must be provided"))?
        .split(',')
        .map(|s| s.trim().parse::<SocketAddr>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let running = setup_interrupt()?;

    let inspector = Arc::new(Inspector::new());
    let server = match (rank, matches.value_of("inspect")) {
        (0, Some(addr)) => Some(start_query_server(addr, inspector.clone())?),
        (_, Some(_)) => {
            warn!("only rank 0 serves inspection queries, ignoring --inspect");
            None
        }
        _ => None,
    };

    println!("worker {} connecting to {} peers", rank, peers.len());
    let comm = TcpComm::connect(rank, &peers, TcpCommConfig::default())?;
    let inspector = if rank == 0 { Some(inspector) } else { None };
    let summary = workload::run(comm, &config, &settings, inspector, running.clone())?;
    print_summaries(&[summary]);

    if let Some((flag, handle)) = server {
        hold_until_interrupted(&running);
        flag.store(false, Ordering::SeqCst);
        if let Ok(result) = handle.join() {
            result?;
        }
    }
    Ok(())
}

fn start_inspect(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let addr = matches
        .value_of("server")
        .ok_or_else(|| Error::msg("server address must be provided"))?;
    let mut queries = Queries::default();
    if let Some(owners) = matches.values_of("owner") {
        for owner in owners {
            queries.owners.push(inspect::parse_coord(owner)?);
        }
    }
    if let Some(leaves) = matches.values_of("leaf") {
        for leaf in leaves {
            queries.leaves.push(leaf.parse()?);
        }
    }
    let client = QueryClient::connect(addr)?;
    client.set_timeout(Some(Duration::from_secs(10)))?;
    inspect::inspect(&client, &queries)
}

/// Builds the config from the config file, if any, and applies command
/// line overrides.
fn load_config(matches: &ArgMatches) -> Result<(Config, Settings)> {
    let (mut config, mut settings) = match matches.value_of("config") {
        Some(path) => {
            let path = Path::new(path);
            let config = Config::from_path(path)?;
            (config, workload_settings(path)?)
        }
        None => (Config::new(vec![64, 64]), Settings::default()),
    };
    if let Some(extent) = matches.value_of("extent") {
        config.domain.extent = inspect::parse_coord(extent)?;
    }
    if matches.is_present("toroidal") {
        config.domain.toroidal = true;
    }
    if let Some(steps) = matches.value_of("steps") {
        settings.steps = steps.parse()?;
    }
    if let Some(walkers) = matches.value_of("walkers") {
        settings.walkers = walkers.parse()?;
    }
    if let Some(seed) = matches.value_of("seed") {
        settings.seed = seed.parse()?;
    }
    if let Some(load) = matches.value_of("load") {
        settings.load = match load {
            "time" => LoadMetric::Time,
            _ => LoadMetric::Walkers,
        };
    }
    if let Some(interval) = matches.value_of("publish-interval") {
        settings.publish_interval = interval.parse()?;
    }
    config.validate()?;
    if config.domain.aoi < 1 {
        return Err(Error::msg("the demo workload needs an aoi of at least 1"));
    }
    Ok((config, settings))
}

#[derive(Deserialize)]
struct WorkloadFile {
    #[serde(default)]
    workload: Settings,
}

/// Reads the optional `workload` table from the config file, in any format
/// the config itself can be read from.
fn workload_settings(path: &Path) -> Result<Settings> {
    let file: WorkloadFile = dspace_core::util::deser_struct_from_path(path)?;
    Ok(file.workload)
}

fn start_query_server(
    addr: &str,
    inspector: Arc<Inspector>,
) -> Result<(Arc<AtomicBool>, thread::JoinHandle<dspace_net::Result<()>>)> {
    let server = QueryServer::bind(addr, inspector)?;
    println!("serving inspection queries at {}", server.local_addr()?);
    let flag = server.running();
    Ok((flag, server.spawn()))
}

fn setup_interrupt() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn hold_until_interrupted(running: &AtomicBool) {
    if running.load(Ordering::SeqCst) {
        println!("run finished, still serving the last snapshot, press ctrl-c to quit");
    }
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
}

fn print_summaries(summaries: &[Summary]) {
    println!(
        "{}",
        format!(
            "{:>4} {:>24} {:>8} {:>8} {:>8} {:>12}",
            "pid", "region", "walkers", "moving", "commits", "heat"
        )
        .bold()
    );
    for s in summaries {
        println!(
            "{:>4} {:>24} {:>8} {:>8} {:>8} {:>12.2}",
            s.pid,
            s.region.to_string(),
            s.walkers,
            s.in_flight,
            s.commits,
            s.heat
        );
    }
    if let Some(s) = summaries.first() {
        let leader = match s.leader {
            Some(pid) => pid.to_string(),
            None => "unknown".to_string(),
        };
        println!("{} steps, leader held by {}", s.steps, leader);
    }
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    if TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed).is_err() {
        eprintln!("failed to set up logging");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn flags_override_defaults() {
        let matches = app().get_matches_from(vec![
            "dspace", "run", "--extent", "32,16", "--toroidal", "--steps", "7", "--load", "time",
        ]);
        let (config, settings) = match matches.subcommand() {
            ("run", Some(m)) => load_config(m).unwrap(),
            _ => panic!("expected run subcommand"),
        };
        assert_eq!(config.domain.extent, vec![32, 16]);
        assert!(config.domain.toroidal);
        assert_eq!(settings.steps, 7);
        assert_eq!(settings.load, LoadMetric::Time);
        assert_eq!(settings.walkers, Settings::default().walkers);
    }

    fn config_file_workload(name: &str, contents: &str) -> Settings {
        let path = std::env::temp_dir().join(name);
        fs::write(&path, contents).unwrap();
        let path_str = path.to_string_lossy().to_string();
        let matches = app().get_matches_from(vec!["dspace", "run", "--config", path_str.as_str()]);
        let (_, settings) = match matches.subcommand() {
            ("run", Some(m)) => load_config(m).unwrap(),
            _ => panic!("expected run subcommand"),
        };
        let _ = fs::remove_file(&path);
        settings
    }

    #[test]
    fn workload_table_is_read_from_toml() {
        let settings = config_file_workload(
            "dspace-cli-workload.toml",
            "[domain]\nextent = [32, 32]\n\n[workload]\nsteps = 12\nwalkers = 3\n",
        );
        assert_eq!(settings.steps, 12);
        assert_eq!(settings.walkers, 3);
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn workload_table_is_read_from_yaml() {
        let settings = config_file_workload(
            "dspace-cli-workload.yaml",
            "domain:\n  extent: [32, 32]\nworkload:\n  steps: 12\n  load: time\n",
        );
        assert_eq!(settings.steps, 12);
        assert_eq!(settings.load, LoadMetric::Time);
        assert_eq!(settings.walkers, Settings::default().walkers);
    }

    #[test]
    fn invalid_extent_is_rejected() {
        let matches = app().get_matches_from(vec!["dspace", "run", "--extent", "0,16"]);
        match matches.subcommand() {
            ("run", Some(m)) => assert!(load_config(m).is_err()),
            _ => panic!("expected run subcommand"),
        }
    }
}

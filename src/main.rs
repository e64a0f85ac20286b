use acars_link_simulator::common::config::SimulationConfig;
use acars_link_simulator::common::scenario::{PlannedMessage, load_scenario};
use acars_link_simulator::simulation::{Episode, EpisodeReport, episode_task};
use acars_link_simulator::time_driver;
use anyhow::{Context, bail};
use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, info};
use std::path::Path;
use std::sync::{Arc, mpsc};
use std::thread;

const USAGE: &str = "usage: acars-link-simulator <scenario.json> [config.toml] [episodes] [--virtual]";

/// Horizon for a virtual-time episode before it is reported as unsettled.
const VIRTUAL_HORIZON: embassy_time::Duration = embassy_time::Duration::from_secs(24 * 3_600);

struct Args {
    scenario_path: String,
    config_path: Option<String>,
    episodes: u32,
    virtual_time: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut virtual_time = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--virtual" => virtual_time = true,
            flag if flag.starts_with("--") => bail!("unknown option {}\n{}", flag, USAGE),
            _ => positional.push(arg),
        }
    }
    let mut positional = positional.into_iter();
    let scenario_path = positional.next().context(USAGE)?;
    let config_path = positional.next();
    let episodes = match positional.next() {
        Some(count) => count.parse::<u32>().with_context(|| format!("invalid episode count: {}", count))?,
        None => 1,
    };
    Ok(Args {
        scenario_path,
        config_path,
        episodes,
        virtual_time,
    })
}

fn print_report(report: &EpisodeReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report).context("failed to encode episode report")?);
    Ok(())
}

fn embassy_init(spawner: Spawner, episode: Arc<Episode>, plan: Vec<PlannedMessage>, episodes: u32, report_tx: mpsc::Sender<EpisodeReport>) {
    match episode_task(spawner, episode, plan, episodes, report_tx) {
        Ok(token) => spawner.spawn(token),
        Err(e) => log::error!("Failed to start episode task: {:?}", e),
    }
}

fn main() -> anyhow::Result<()> {
    // Logging setup
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("acars_link_simulator"), LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = parse_args()?;

    let config = match &args.config_path {
        Some(path) => SimulationConfig::load(Path::new(path)).with_context(|| format!("loading configuration {}", path))?,
        None => SimulationConfig::default(),
    };
    let scenario = load_scenario(&args.scenario_path).with_context(|| format!("loading scenario {}", args.scenario_path))?;
    let plan = scenario.planned_messages();
    let episode = Arc::new(Episode::new(&config, &scenario));

    info!(
        "Starting up: {} aircraft, {} messages per episode, {} episode(s)",
        scenario.aircraft.len(),
        plan.len(),
        args.episodes
    );

    if args.virtual_time {
        for n in 1..=args.episodes {
            match episode.run_virtual(n, &plan, u64::from(n), VIRTUAL_HORIZON)? {
                Some(report) => print_report(&report)?,
                None => bail!("episode {} did not settle within the virtual horizon", n),
            }
        }
        return Ok(());
    }

    time_driver::set_speed_percent(config.speed_percent);
    let (report_tx, report_rx) = mpsc::channel();
    let episodes = args.episodes;

    // Embassy executor on a dedicated background thread
    thread::Builder::new()
        .name("embassy-executor".to_string())
        .spawn(move || {
            // Leak the executor to satisfy the 'static lifetime required by run()
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| embassy_init(spawner, episode, plan, episodes, report_tx));
        })
        .context("failed to spawn embassy thread")?;

    for _ in 0..episodes {
        let report = report_rx.recv().context("simulation stopped before all episodes were reported")?;
        print_report(&report)?;
    }
    Ok(())
}

use busgps::config::Config;
use busgps::shutdown::shutdown_signal;
use busgps::{BusMonitor, Watchdog};
use clap::{App, Arg, ArgMatches};
use colored::*;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("bus-watchdog")
        .version("0.1.0")
        .author("Vehicle Telemetry Engineering Team")
        .about("🚜 Fail when the vehicle bus goes quiet")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bus")
                .short("b")
                .long("bus")
                .value_name("HOST:PORT")
                .help("Gateway streaming bus frames, one per line")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("SECS")
                .help("Seconds without traffic before the watchdog fires")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(secs) if secs > 0 => Ok(()),
                    _ => Err("Timeout must be a positive number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("keep-alive")
                .short("k")
                .long("keep-alive")
                .help("Log expiries and keep monitoring instead of exiting"),
        )
        .get_matches();

    if let Err(e) = run(&matches).await {
        eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
        return Err(e);
    }
    Ok(())
}

fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(bus) = matches.value_of("bus") {
        config.bus.address = bus.to_string();
    }
    if let Some(secs) = matches.value_of("timeout") {
        config.bus.timeout_secs = secs.parse()?;
    }
    if matches.is_present("keep-alive") {
        config.bus.keep_alive = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(matches)?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut monitor = BusMonitor::connect(&config.bus.address).await?;
    let (watchdog, mut faults) = Watchdog::with_fault_channel(config.bus.timeout())?;
    info!("⏱️  Watching bus traffic with a {:?} timeout", watchdog.timeout());

    let traffic = monitor.run(&watchdog);
    tokio::pin!(traffic);
    let mut stream_open = true;

    loop {
        tokio::select! {
            () = &mut shutdown => {
                watchdog.stop();
                println!("{} Bus watchdog stopped", "🛑".yellow());
                return Ok(());
            }
            result = &mut traffic, if stream_open => {
                stream_open = false;
                match result {
                    Ok(frames) => warn!("Bus gateway closed after {} frames", frames),
                    Err(e) => warn!("Bus gateway read failed: {}", e),
                }
                // No more resets arrive; the watchdog decides what happens next
            }
            Some(expired) = faults.recv() => {
                if !config.bus.keep_alive {
                    error!("Bus liveness failure: {}", expired);
                    return Err(Box::new(expired));
                }
                warn!("Bus liveness failure, restarting watchdog: {}", expired);
                watchdog.start()?;
            }
        }
    }
}

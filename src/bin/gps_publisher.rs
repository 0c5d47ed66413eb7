use busgps::config::Config;
use busgps::shutdown::shutdown_signal;
use busgps::{GpsdSource, Publisher, RecordEncoder, RecordSchema, TcpBroker};
use clap::{App, Arg, ArgMatches};
use colored::*;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("gps-publisher")
        .version("0.1.0")
        .author("Vehicle Telemetry Engineering Team")
        .about("🛰️  Stream gpsd position fixes to a broker topic as Avro records")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("broker")
                .short("b")
                .long("broker")
                .value_name("HOST:PORT")
                .help("Broker gateway address (framed records, one status byte per record)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("topic")
                .short("t")
                .long("topic")
                .value_name("TOPIC")
                .help("Topic to publish records to")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("schema")
                .short("s")
                .long("schema")
                .value_name("FILE")
                .help("Avro schema (.avsc) for the position record")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("gpsd-host")
                .long("gpsd-host")
                .value_name("HOST")
                .help("gpsd host")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("gpsd-port")
                .long("gpsd-port")
                .value_name("PORT")
                .help("gpsd port")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("flush-timeout")
                .long("flush-timeout")
                .value_name("SECS")
                .help("Give up on the shutdown flush after SECS seconds (0 waits forever)")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Timeout must be a whole number of seconds".into()),
                }),
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

    if let Some(broker) = matches.value_of("broker") {
        config.broker.address = broker.to_string();
    }
    if let Some(topic) = matches.value_of("topic") {
        config.broker.topic = topic.to_string();
    }
    if let Some(schema) = matches.value_of("schema") {
        config.schema_path = schema.into();
    }
    if let Some(host) = matches.value_of("gpsd-host") {
        config.gpsd.host = host.to_string();
    }
    if let Some(port) = matches.value_of("gpsd-port") {
        config.gpsd.port = port.parse()?;
    }
    if let Some(secs) = matches.value_of("flush-timeout") {
        config.broker.flush_timeout_secs = match secs.parse::<u64>()? {
            0 => None,
            secs => Some(secs),
        };
    }

    config.validate()?;
    Ok(config)
}

async fn run(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(matches)?;

    // A mismatched schema must stop us before anything is published
    let schema = RecordSchema::load(&config.schema_path)?;
    info!("Loaded schema {} from {}", schema.name(), config.schema_path.display());
    let encoder = RecordEncoder::new(schema);

    let shutdown = shutdown_signal();

    let source = GpsdSource::connect(&config.gpsd.address()).await?;
    let broker = TcpBroker::connect(&config.broker).await?;

    let stats = Publisher::new(config.broker.clone(), encoder, source, broker)
        .run(shutdown)
        .await?;
    info!("Final stats: {}", serde_json::to_string(&stats)?);

    println!(
        "{} {} records published, {} samples dropped, {} send failures",
        "✅".green(),
        stats.records_published.to_string().bright_cyan(),
        stats.samples_dropped,
        stats.send_failures
    );
    Ok(())
}

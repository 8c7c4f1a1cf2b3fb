use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;

use clap::ArgMatches;
use skistream_core::sink::log::LogIngest;
use skistream_core::sink::simulated::SimulatedIngest;
use skistream_core::{BufferStore, LogType, Settings, SinkKind, pipeline};
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

/// How long the simulated ingestion service takes to commit a batch.
const SIMULATED_COMMIT_LAG: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let mut settings = Settings::from_env()?;

    match matches.subcommand() {
        Some(("stream", args)) => {
            cmdline::apply_overrides(&mut settings, args)?;
            stream(settings, args).await?;
        }
        Some(("append", args)) => {
            cmdline::apply_overrides(&mut settings, args)?;
            append(settings, args).await?;
        }
        Some(("pending", args)) => {
            cmdline::apply_overrides(&mut settings, args)?;
            pending(settings).await?;
        }
        other => return Err(format!("unknown subcommand {other:?}").into()),
    }
    Ok(())
}

async fn stream(settings: Settings, args: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let sink = args.get_one::<SinkKind>("sink").copied().unwrap_or_default();
    info!(
        %sink,
        data_dir = %settings.store.data_dir.display(),
        batch_size = settings.streamer.batch_size,
        "Starting streamers"
    );
    match sink {
        SinkKind::Log => pipeline::run(settings, LogIngest::new()).await?,
        SinkKind::Simulated => {
            let sink = SimulatedIngest::with_commit_lag(SIMULATED_COMMIT_LAG);
            pipeline::run(settings, sink).await?
        }
    }
    Ok(())
}

async fn append(settings: Settings, args: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let log = args
        .get_one::<LogType>("log")
        .copied()
        .ok_or("missing --log")?;
    let payload = args
        .get_one::<String>("payload")
        .ok_or("missing --payload")?;

    let store = BufferStore::initialize(&settings.store).await?;
    let sequence_id = store.append(log, payload).await;
    store.close().await;

    println!("{}", sequence_id?);
    Ok(())
}

async fn pending(settings: Settings) -> Result<(), Box<dyn Error>> {
    let store = BufferStore::initialize(&settings.store).await?;
    let mut counts = BTreeMap::new();
    for log in LogType::ALL {
        counts.insert(log, store.pending(log).await?);
    }
    store.close().await;

    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

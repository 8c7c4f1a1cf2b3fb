use std::net::SocketAddr;
use std::path::PathBuf;

use clap::builder::RangedU64ValueParser;
use clap::{Arg, ArgAction, ArgMatches, Command};
use skistream_core::{LogType, Result, Settings, SinkKind};

pub(super) fn root_cli() -> Command {
    Command::new("skistream")
        .about("Buffers ski resort events locally and streams them to the ingestion service")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(stream_subcmd())
        .subcommand(append_subcmd())
        .subcommand(pending_subcmd())
}

fn data_dir_arg() -> Arg {
    Arg::new("data-dir")
        .long("data-dir")
        .help("Directory holding the logs, overrides SKISTREAM_DATA_DIR")
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(PathBuf))
}

fn stream_subcmd() -> Command {
    Command::new("stream")
        .about("Stream every log to the ingestion service until SIGINT or SIGTERM")
        .arg(data_dir_arg())
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .help("Records per batch, overrides SKISTREAM_BATCH_SIZE")
                .action(ArgAction::Set)
                .value_parser(RangedU64ValueParser::<usize>::new().range(1..)),
        )
        .arg(
            Arg::new("sink")
                .long("sink")
                .help("Ingestion service to stream to")
                .action(ArgAction::Set)
                .value_parser(|s: &str| s.parse::<SinkKind>().map_err(|e| e.to_string()))
                .default_value("log"),
        )
        .arg(
            Arg::new("metrics-addr")
                .long("metrics-addr")
                .help("Serve metrics on this address, overrides SKISTREAM_METRICS_ADDR")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(SocketAddr)),
        )
}

fn append_subcmd() -> Command {
    Command::new("append")
        .about("Append one record to a log and print its sequence id")
        .arg_required_else_help(true)
        .arg(data_dir_arg())
        .arg(
            Arg::new("log")
                .long("log")
                .help("SEASON_PASS, RESORT_TICKET or LIFT_RIDE")
                .required(true)
                .action(ArgAction::Set)
                .value_parser(|s: &str| s.parse::<LogType>().map_err(|e| e.to_string())),
        )
        .arg(
            Arg::new("payload")
                .long("payload")
                .help("The serialized record")
                .required(true)
                .action(ArgAction::Set),
        )
}

fn pending_subcmd() -> Command {
    Command::new("pending")
        .about("Print how many records each log holds")
        .arg(data_dir_arg())
}

/// Lays the flags common to the subcommands over the settings from the environment, then
/// validates the result.
pub(super) fn apply_overrides(settings: &mut Settings, args: &ArgMatches) -> Result<()> {
    if let Some(dir) = args.get_one::<PathBuf>("data-dir") {
        settings.store.data_dir = dir.clone();
    }
    if let Ok(Some(batch_size)) = args.try_get_one::<usize>("batch-size") {
        settings.streamer.batch_size = *batch_size;
    }
    if let Ok(Some(addr)) = args.try_get_one::<SocketAddr>("metrics-addr") {
        settings.metrics_addr = Some(*addr);
    }
    settings.streamer.validate()
}

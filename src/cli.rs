use crate::client::Client;
use crate::daemon::daemon;
use crate::filter::Filter;
use crate::milter::constants::SMFIF_VERSION;
use crate::milter::{Actions, StepFlags};
use crate::negotiate::NegotiateOption;
use crate::status::{FallbackStatusError, Status};
use clap::Parser;
use log::LevelFilter;
use std::error::Error;
use std::process::ExitCode;

#[derive(clap::Parser)]
#[command()]
struct Cli {
    /// More log output; repeat for trace level. RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DaemonArgs {
    /// Address to listen on, unless systemd passes a socket.
    #[arg(default_value = "0.0.0.0:7044")]
    pub address: String,
    /// Serve each connection in a forked child, at most this many at once.
    #[arg(long = "fork", default_value_t = 0)]
    pub fork_max: u16,
    /// Serve each connection in a thread, at most this many at once.
    #[arg(long = "threads", default_value_t = 0)]
    pub threads_max: u16,
    /// Status sent when a filter handler fails; it has to end the message.
    #[arg(long, value_parser = parse_fallback)]
    pub fallback_status: Option<Status>,
}

fn parse_fallback(value: &str) -> Result<Status, FallbackStatusError> {
    Status::fallback(value)
}

#[derive(clap::Subcommand)]
enum Command {
    Daemon(DaemonArgs),
    /// Print what the filter negotiates against an MTA offering everything.
    Capabilities,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn cmd_capabilities<F: Filter>(client: &Client<F>) {
    let capabilities = client.capabilities();
    let offered = NegotiateOption::new(SMFIF_VERSION, Actions::all(), StepFlags::all());
    let resolved = capabilities.resolve(&offered);
    println!("events: {:?}", capabilities.events);
    println!("version: {}", resolved.version);
    println!("actions: {:?}", resolved.actions);
    println!("steps: {:?}", resolved.steps);
    for (stage, names) in capabilities.macro_lists() {
        println!("macros {stage:?}: {names}");
    }
}

pub fn xmain<F: Filter>(mut client: Client<F>) -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Command::Daemon(args) => {
            if let Some(status) = args.fallback_status {
                client.set_fallback_status(status)?;
            }
            daemon(&client, &args)
        }
        Command::Capabilities => {
            cmd_capabilities(&client);
            Ok(())
        }
    }
}

/// Entry point for filter binaries: `fn main() -> ExitCode { cli(client) }`.
pub fn cli<F: Filter>(client: Client<F>) -> ExitCode {
    match xmain(client) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

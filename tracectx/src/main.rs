use std::path::PathBuf;
use std::process::exit;

use anyhow::{Result, ensure};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tracectx_common::{
    EgressKey, INCOMING_TRACE_MAP_ENTRIES, OUTGOING_TRACE_MAP_ENTRIES, SOCK_DIR_ENTRIES,
};

mod ebpf_loader;
mod inspect;

#[derive(Parser)]
#[command(name = "tracectx")]
#[command(about = "Wire-level trace context propagation agent", long_about = None)]
struct Cli {
    /// Log level for the agent and forwarded eBPF logs
    #[arg(long, global = true, env = "TRACECTX_LOG_LEVEL", default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the tc classifiers, pin the maps and attach to an interface
    Attach(AttachCommand),
    /// Print the incoming context map as JSON
    Incoming(PinArgs),
    /// Print the outgoing context map as JSON
    Outgoing(PinArgs),
    /// Register a pending outgoing context for a port pair
    Seed(SeedCommand),
    /// Run a hex-encoded Ethernet frame through the packet pipeline offline
    Decode(DecodeCommand),
}

#[derive(Args)]
struct PinArgs {
    /// Directory holding the pinned maps
    #[arg(long, value_name = "DIR", env = "TRACECTX_PIN_DIR", default_value = ebpf_loader::DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
}

#[derive(Args)]
struct AttachCommand {
    /// Network interface to attach to
    #[arg(long, value_name = "IFACE", env = "TRACECTX_IFACE")]
    iface: String,
    #[command(flatten)]
    pins: PinArgs,
    /// Which hooks to attach
    #[arg(long, value_enum, default_value_t = ebpf_loader::Direction::Both)]
    direction: ebpf_loader::Direction,
    /// Max entries for the outgoing context map
    #[arg(long, value_name = "N", env = "TRACECTX_OUTGOING_ENTRIES", default_value_t = OUTGOING_TRACE_MAP_ENTRIES)]
    outgoing_entries: u32,
    /// Max entries for the incoming context map
    #[arg(long, value_name = "N", env = "TRACECTX_INCOMING_ENTRIES", default_value_t = INCOMING_TRACE_MAP_ENTRIES)]
    incoming_entries: u32,
    /// Max entries for the socket directory
    #[arg(long, value_name = "N", env = "TRACECTX_SOCK_ENTRIES", default_value_t = SOCK_DIR_ENTRIES)]
    sock_entries: u32,
}

#[derive(Args)]
struct SeedCommand {
    #[command(flatten)]
    pins: PinArgs,
    /// Client-side (ephemeral) port of the connection
    #[arg(long, value_name = "PORT")]
    src_port: u16,
    /// Server-side port of the connection
    #[arg(long, value_name = "PORT")]
    dst_port: u16,
    /// Trace id as 32 hex characters
    #[arg(long, value_name = "HEX")]
    trace_id: String,
    /// Process id recorded with the context
    #[arg(long, default_value_t = 0)]
    pid: u32,
}

#[derive(Args)]
struct DecodeCommand {
    /// Frame bytes in hex, starting at the Ethernet header
    #[arg(value_name = "HEX")]
    frame: String,
    /// Register this trace id for the frame's connection before processing
    #[arg(long, value_name = "HEX")]
    inject: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("tracectx error: {err:?}");
        exit(1);
    }
}

fn init_tracing(level: tracing::Level) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::env::var("NO_COLOR").is_err());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,tracectx={level},tracectx_ebpf={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = ebpf_loader::AttachOptions {
                iface: cmd.iface,
                pin_dir: cmd.pins.pin_dir,
                direction: cmd.direction,
                outgoing_entries: cmd.outgoing_entries,
                incoming_entries: cmd.incoming_entries,
                sock_entries: cmd.sock_entries,
            };
            ebpf_loader::attach_program(opts).await?;
        }
        Some(Commands::Incoming(args)) => {
            let value = inspect::dump_incoming(&args.pin_dir)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Some(Commands::Outgoing(args)) => {
            let value = inspect::dump_outgoing(&args.pin_dir)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Some(Commands::Seed(cmd)) => {
            ensure!(
                cmd.src_port != 0 && cmd.dst_port != 0,
                "ports must be non-zero"
            );
            let trace_id = inspect::parse_trace_id(&cmd.trace_id)?;
            let key = EgressKey {
                s_port: cmd.src_port,
                d_port: cmd.dst_port,
            };
            inspect::seed_outgoing(&cmd.pins.pin_dir, key, trace_id, cmd.pid)?;
            tracing::info!(
                s_port = key.s_port,
                d_port = key.d_port,
                trace_id = %cmd.trace_id,
                "outgoing context registered"
            );
        }
        Some(Commands::Decode(cmd)) => {
            let frame = inspect::parse_hex(&cmd.frame)?;
            let inject = cmd
                .inject
                .as_deref()
                .map(inspect::parse_trace_id)
                .transpose()?;
            let value = inspect::decode_frame(frame, inject)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

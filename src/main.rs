use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arp_ipam::driver::{Driver, DriverConfigBuilder};
use arp_ipam::plugin;

#[derive(Parser)]
#[command(name = "arp-ipam", about = "Docker ARP IPAM plugin", version)]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Plugin name. Useful to run multiple instances of the plugin.
    #[arg(long = "plugin-name", default_value = "arp-ipam")]
    plugin_name: String,

    /// TCP address to bind the plugin on.
    #[arg(long, default_value = ":8080")]
    address: String,

    /// Addresses after the network address to keep out of random
    /// allocation.
    #[arg(long = "exclude-first", default_value_t = 0)]
    exclude_first: u32,

    /// Addresses before the broadcast address to keep out of random
    /// allocation.
    #[arg(long = "exclude-last", default_value_t = 0)]
    exclude_last: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "error running plugin");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> arp_ipam::Result<()> {
    let quit = CancellationToken::new();
    spawn_signal_handler(quit.clone())?;

    let config = DriverConfigBuilder::new()
        .with_exclude_first(cli.exclude_first)
        .with_exclude_last(cli.exclude_last)
        .build();
    let (driver, tasks) = Driver::new(config, quit.clone())?;

    match plugin::write_spec_file(&cli.plugin_name, &cli.address) {
        Ok(path) => info!(path = %path.display(), "wrote plugin spec file"),
        Err(err) => warn!(error = %err, "unable to write plugin spec file"),
    }

    let served = plugin::serve(&cli.address, Arc::new(driver), quit.clone()).await;
    quit.cancel();
    tasks.shutdown().await;
    info!("shut down");
    served.map_err(Into::into)
}

fn spawn_signal_handler(quit: CancellationToken) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
        quit.cancel();
    });
    Ok(())
}

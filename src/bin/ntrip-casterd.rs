use clap::Parser;
use ntrip_caster::{Caster, CasterConfig};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt::Subscriber as FmtSubscriber, EnvFilter};

/// NTRIP caster daemon: accepts publisher and subscriber connections and
/// fans out each mount point's stream.
#[derive(Clone, Debug, Parser)]
struct Args {
    #[clap(flatten)]
    caster: CasterConfig,

    #[clap(long, default_value = "info")]
    /// Set log level
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());
    let _ = FmtSubscriber::builder()
        .compact()
        .without_time()
        .with_max_level(args.log_level)
        .with_env_filter(filter)
        .try_init();

    info!("Starting NTRIP caster on {}", args.caster.bind_addr());

    let handle = Caster::start(args.caster)?;
    info!(addr = %handle.local_addr(), "listening");

    // Setup interrupt / exit handler
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down...");
    handle.stop().await;

    Ok(())
}

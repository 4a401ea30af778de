use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use grid_lite::config::ClusterConfig;
use grid_lite::controller::ControllerBuilder;
use grid_lite::rpc::handlers::admin::install_log_level_hook;
use grid_lite::rpc::server::RpcServer;
use grid_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "grid-lite")]
#[command(about = "A lightweight cluster workload manager controller")]
struct Args {
    /// Config file path (overrides the GRID_CONF environment variable)
    #[arg(long)]
    conf: Option<PathBuf>,

    /// Listen address override, host:port
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

fn level_filter(level: u32) -> EnvFilter {
    let directive = match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    EnvFilter::new(directive)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Reloadable filter so the set_debug_level RPC can retarget it.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log.clone()));
    let (filter, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    install_log_level_hook(Box::new(move |level| {
        if let Err(e) = reload_handle.reload(level_filter(level)) {
            tracing::warn!(error = %e, "log filter reload failed");
        }
    }));

    let mut config = ClusterConfig::load(args.conf.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    let listen_addr = config.listen_addr;

    tracing::info!(
        cluster = %config.cluster_name,
        listen = %listen_addr,
        nodes = config.nodes.len(),
        partitions = config.partitions.len(),
        "starting grid-lite controller"
    );

    let shutdown = install_shutdown_handler();
    let controller = ControllerBuilder::new(config)
        .shutdown(shutdown)
        .build()
        .await?;
    controller.spawn_background();

    let server = RpcServer::bind(controller, listen_addr).await?;
    server.run().await?;

    Ok(())
}

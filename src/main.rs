//! ferrotun CLI
//!
//! Brings up a tunnel device from a wg-quick style configuration file and
//! serves the UAPI control socket until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use ferrotun::tun::{NativeTun, TunInterface};
use ferrotun::udp::NativeUdp;
use ferrotun::{Device, TunnelConfig};

/// Userspace WireGuard-protocol tunnel device
#[derive(Parser, Debug)]
#[command(name = "ferrotun")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the tunnel configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Directory for the UAPI control socket
    #[arg(long, default_value = "/var/run/ferrotun")]
    uapi_dir: PathBuf,

    /// Disable the UAPI control socket
    #[arg(long)]
    no_uapi: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let config = TunnelConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let tun_addr = config
        .interface
        .addresses
        .iter()
        .find_map(|net| match net {
            ipnet::IpNet::V4(v4) => Some((v4.addr(), v4.prefix_len())),
            ipnet::IpNet::V6(_) => None,
        })
        .context("configuration has no IPv4 Address for the interface")?;

    let mtu = config.interface.mtu.unwrap_or(ferrotun::device::DEFAULT_MTU);
    let tun = Arc::new(
        NativeTun::create(tun_addr.0, tun_addr.1, mtu).context("creating TUN device")?,
    );
    let tun_name = tun.name().to_string();

    let device = Device::new(tun, Arc::new(NativeUdp::new()));
    device
        .apply_update(config.to_update())
        .await
        .context("applying configuration")?;
    device.start();

    let uapi_task = if args.no_uapi {
        None
    } else {
        let socket_path = args.uapi_dir.join(format!("{}.sock", tun_name));
        std::fs::create_dir_all(&args.uapi_dir)
            .with_context(|| format!("creating {}", args.uapi_dir.display()))?;
        let _ = std::fs::remove_file(&socket_path);

        let listener = tokio::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        tracing::info!(socket = %socket_path.display(), "UAPI socket ready");

        Some((
            tokio::spawn(ferrotun::device::api::serve(Arc::clone(&device), listener)),
            socket_path,
        ))
    };

    wait_for_shutdown().await;
    tracing::info!("shutting down");

    device.close().await;
    if let Some((task, socket_path)) = uapi_task {
        task.abort();
        let _ = std::fs::remove_file(socket_path);
    }

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

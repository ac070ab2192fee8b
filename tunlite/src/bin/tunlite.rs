use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};

use tunlite::{ProxyConfig, RelayConfig, TrafficStats, TunnelController, TunnelOptions};

#[derive(Parser, Debug)]
#[command(name = "tunlite", about = "Route all host traffic through a local SOCKS proxy")]
struct Args {
    /// Home directory for config files, logs and the lock.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// JSON options file.
    #[arg(long, global = true)]
    options: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the tunnel and keep it up until revoked.
    Up {
        #[arg(long)]
        proxy_config: PathBuf,
        #[arg(long, default_value_t = 10808)]
        socks_port: u16,
        /// Seconds between traffic reports; 0 disables them.
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
    /// Print the relay config document.
    RelayConfig {
        #[arg(long, default_value_t = 3)]
        fd: i32,
        #[arg(long, default_value_t = 10808)]
        socks_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let options = load_options(args.options.as_ref(), args.home)?;

    match args.command {
        Command::RelayConfig { fd, socks_port } => {
            print!("{}", render_relay_config(&options, fd, socks_port));
            Ok(())
        }
        Command::Up {
            proxy_config,
            socks_port,
            stats_interval,
        } => {
            // Installed before anything is spawned so a signal during start
            // still goes through revoke.
            let shutdown = shutdown_signal()?;
            let raw = std::fs::read_to_string(&proxy_config).with_context(|| {
                format!("failed to read proxy config {}", proxy_config.display())
            })?;
            let controller = TunnelController::new(options)?;
            run_up(
                &controller,
                ProxyConfig::new(raw),
                socks_port,
                stats_interval,
                shutdown,
            )
            .await
        }
    }
}

fn load_options(path: Option<&PathBuf>, home: Option<PathBuf>) -> Result<TunnelOptions> {
    let mut options = match path {
        Some(path) => TunnelOptions::load(path)?,
        None => TunnelOptions::default(),
    };
    if let Some(home) = home {
        options.home_dir = home;
    }
    Ok(options)
}

fn render_relay_config(options: &TunnelOptions, fd: i32, socks_port: u16) -> String {
    RelayConfig::from_options(&options.relay, fd, socks_port)
        .with_interface(options.interface.address, options.interface.mtu)
        .render()
}

/// Resolves with the signal name on SIGINT, SIGTERM or SIGHUP.
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => "SIGHUP",
        }
    })
}

/// Start the tunnel and hold it until `shutdown` resolves or the session ends.
///
/// A shutdown while starting revokes the half-built session.
async fn run_up(
    controller: &TunnelController,
    config: ProxyConfig,
    socks_port: u16,
    stats_interval: u64,
    shutdown: impl Future<Output = &'static str>,
) -> Result<()> {
    tokio::pin!(shutdown);

    tokio::select! {
        started = controller.start(config, socks_port) => started?,
        reason = &mut shutdown => {
            controller.revoke(reason).await?;
            return Ok(());
        }
    }

    let info = controller.info();
    tracing::info!(
        interface = ?info.interface,
        proxy_pid = ?info.proxy_pid,
        relay_pid = ?info.relay_pid,
        "Tunnel is up"
    );

    let reporting = stats_interval > 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;
    let mut last = TrafficStats::default();

    let reason = loop {
        tokio::select! {
            reason = &mut shutdown => break Some(reason),
            _ = controller.wait_until_idle(Duration::from_millis(250)) => break None,
            _ = ticker.tick(), if reporting => {
                let now = controller.query_stats().await;
                let delta = now.since(&last);
                tracing::info!(
                    upload = now.upload,
                    download = now.download,
                    upload_delta = delta.upload,
                    download_delta = delta.download,
                    "Traffic"
                );
                last = now;
            }
        }
    };

    match reason {
        Some(signal) => controller.revoke(signal).await?,
        None => {
            if let Some(err) = controller.status().last_error {
                anyhow::bail!("tunnel stopped: {}", err);
            }
        }
    }
    Ok(())
}

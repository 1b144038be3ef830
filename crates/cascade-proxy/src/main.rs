use anyhow::Context;
use cascade_proxy::config::{Config, MetricsConfig};
use cascade_proxy::metrics;
use cascade_proxy::mode::{CascadeSettings, HttpProbe, ModeController};
use cascade_proxy::{ProxyServer, RoutingTable};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Forwarding proxy that switches between direct and upstream (cascade) mode
#[derive(Parser, Debug)]
#[command(name = "cascade-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file; flags below override its values
    #[arg(short, long, env = "CASCADE_CONFIG")]
    config: Option<String>,

    /// Local port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Local address to listen on
    #[arg(long)]
    host: Option<IpAddr>,

    /// Upstream proxy, e.g. proxy.corp:3128
    #[arg(long, env = "CASCADE_PROXY_URL")]
    proxy_url: Option<String>,

    /// Upstream proxy username
    #[arg(short, long, env = "CASCADE_USERNAME")]
    username: Option<String>,

    /// Upstream proxy password
    #[arg(long, env = "CASCADE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// URL fetched to decide whether direct access works
    #[arg(long)]
    check_address: Option<String>,

    /// Seconds between reachability checks
    #[arg(long)]
    health: Option<u64>,

    /// Comma-separated host overrides: `host` or `host->upstream`
    #[arg(long)]
    host_list: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<Config, anyhow::Error> {
        let mut config = match self.config {
            Some(ref path) => Config::from_file(path)
                .with_context(|| format!("failed to load config from {path}"))?,
            None => Config::default(),
        };

        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(host) = self.host {
            config.listen.host = host;
        }
        if let Some(url) = self.proxy_url {
            config.upstream.url = url;
        }
        if let Some(username) = self.username {
            config.upstream.username = username;
        }
        if let Some(password) = self.password {
            config.upstream.password = password;
        }
        if let Some(address) = self.check_address {
            config.health_check.address = address;
        }
        if let Some(interval) = self.health {
            config.health_check.interval_seconds = interval;
        }
        if let Some(list) = self.host_list {
            config.host_overrides.extend(
                list.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(String::from),
            );
        }
        if let Some(port) = self.metrics_port {
            config.metrics = Some(MetricsConfig { port });
        }
        config.verbose |= self.verbose;

        config.validate()?;
        Ok(config)
    }
}

/// `RUST_LOG` wins; `verbose` only raises this crate to debug.
fn tracing_filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        "info,cascade_proxy=debug"
    } else {
        "info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(tracing_filter(verbose))
        .init();
}


#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Args::parse().into_config()?;
    init_tracing(config.verbose);

    let settings = CascadeSettings::from_config(&config)?;
    match settings.upstream {
        Some(ref upstream) => info!("Cascade upstream: {}", upstream),
        None => info!("No upstream proxy configured; direct mode only"),
    }

    let shutdown = CancellationToken::new();
    if let Some(ref metrics_config) = config.metrics {
        let addr = SocketAddr::new(config.listen.host, metrics_config.port);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(addr, token).await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let probe = Arc::new(HttpProbe::new(
        config.health_check.address.clone(),
        config.health_check.timeout(),
    )?);
    let server = ProxyServer::new(
        config.listen.socket_addr(),
        config.connection.drain_timeout(),
    );
    let mut controller = ModeController::new(settings, Arc::new(RoutingTable::new()), server);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    info!(
        "Checking {} every {:?}",
        probe.address(),
        config.health_check.interval()
    );
    controller
        .run(
            probe,
            config.health_check.interval(),
            config.health_check.timeout(),
            shutdown,
        )
        .await;
    Ok(())
}

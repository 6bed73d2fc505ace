use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use slowdns::{
    blocklist::Blocklist,
    config::AppConfig,
    forwarder::{self, UdpUpstream},
    handler::DnsHandler,
    health,
    observer::MetricsObserver,
};

#[derive(Debug, Parser)]
#[command(name = "slowdns", version, about = "Proxy DNS selectivo: reenvía, demora o falsea consultas")]
struct Cli {
    /// Archivo TOML; las variables de entorno pisan sus valores.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Atiende consultas (por defecto).
    Serve,

    /// Consulta al proxy local y sale con error si no responde marcado.
    Health {
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::from_sources(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::Health { timeout_ms } => {
            let addr = cfg.probe_addr();
            health::probe(addr, Duration::from_millis(timeout_ms))
                .await
                .with_context(|| format!("{addr} no está sano"))?;
            tracing::info!("{addr} sano");
            Ok(())
        }
    }
}

async fn serve(cfg: AppConfig) -> anyhow::Result<()> {
    let endpoints = forwarder::resolve_endpoints(&cfg.upstreams)
        .await
        .context("no pude resolver los upstreams")?;
    tracing::info!("Upstreams: {:?}", endpoints);
    let upstream = UdpUpstream::new(endpoints, cfg.proxy.timeout())?;

    let soft = load_or_empty("soft", &cfg.blocklists.soft).await;
    let hard = load_or_empty("hard", &cfg.blocklists.hard).await;

    match cfg.metrics_addr() {
        Some(addr) => {
            MetricsObserver::install(addr)?;
            tracing::info!("Métricas en http://{addr}/metrics");
        }
        None => MetricsObserver::describe(),
    }

    let handler = DnsHandler::new(
        &cfg,
        soft,
        hard,
        Arc::new(upstream),
        Arc::new(MetricsObserver),
    );
    tracing::info!(
        soft = handler.soft_count(),
        hard = handler.hard_count(),
        cache = cfg.cache.enabled,
        "blocklists listas"
    );

    handler.serve(cfg.listen_addr()).await
}

// Una fuente caída no impide arrancar: se sigue con la lista vacía.
async fn load_or_empty(kind: &str, uris: &[String]) -> Blocklist {
    match Blocklist::load_all(uris).await {
        Ok(list) => list,
        Err(e) => {
            let e = anyhow::Error::from(e);
            tracing::warn!("no pude cargar blocklists {kind}: {e:#}");
            Blocklist::new()
        }
    }
}

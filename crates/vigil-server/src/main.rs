use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_config::{ConfigLoader, LogFormat, LoggingConfig};
use vigil_server::{create_router, Engine};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "vigil.toml")]
    config: String,

    /// Validate the config, print the effective values and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG 优先于配置文件
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
    tracing::info!("Received Ctrl+C");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ConfigLoader::new(&args.config).load()?;

    if args.check {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(&config.logging);
    tracing::info!(config = %args.config, "Starting Vigil");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let autostart = config.server.autostart;

    let engine = Engine::build(config).await?;
    if autostart {
        engine.start_all().await;
    }

    let app = create_router(Arc::clone(&engine));
    tracing::info!(%addr, "HTTP API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

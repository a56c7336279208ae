use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voice_relay::{factory_from_config, http, AppState, Config, NatsBroker, RelayEngine};

#[derive(Parser, Debug)]
#[command(name = "voice-relay")]
#[command(about = "Relay IoT device audio between a message broker and a realtime voice AI", long_about = None)]
struct Args {
    /// Config file path, without extension
    #[arg(short, long, default_value = "config/voice-relay")]
    config: String,

    /// Log filter when RUST_LOG is unset (e.g. info, voice_relay=debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the configured upstream provider (openai, echo)
    #[arg(long)]
    provider: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let overrides: Vec<(&str, String)> = args
        .provider
        .iter()
        .map(|provider| ("upstream.provider", provider.clone()))
        .collect();
    let cfg = Config::load_with_overrides(&args.config, &overrides)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    info!("Voice Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {:?}", cfg.redacted());

    if args.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let factory = factory_from_config(&cfg.upstream)?;
    info!("Checking upstream provider {}", factory.name());
    if !factory.health_check().await {
        bail!("Upstream provider {} failed its startup health check", factory.name());
    }

    let broker = Arc::new(NatsBroker::connect(&cfg.broker).await?);
    let engine = RelayEngine::new(broker.clone(), factory, &cfg);

    let http_task = if cfg.server.http.enabled {
        let state = AppState::new(engine.clone());
        let bind = cfg.server.http.bind.clone();
        let port = cfg.server.http.port;
        let cancel = engine.cancel_token().child_token();
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(state, &bind, port, cancel).await {
                error!("{:#}", e);
            }
        }))
    } else {
        None
    };

    let mut relay = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            None
        }
        finished = &mut relay => Some(finished),
    };

    engine.shutdown().await;

    let finished = match finished {
        Some(finished) => finished,
        None => relay.await,
    };
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Relay failed: {:#}", e),
        Err(e) => error!("Relay task panicked: {}", e),
    }
    if let Some(task) = http_task {
        if let Err(e) = task.await {
            warn!("Admin API task ended abnormally: {}", e);
        }
    }

    broker.close().await?;
    info!("Goodbye");
    Ok(())
}

use std::time::Duration;

use clap::{Parser, ValueEnum};
use flagwatch::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Feature flag evaluation service with live watch over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "flagwatch", version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "FLAGWATCH_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Base URL of the evaluation engine.
    #[arg(long, env = "FLAGWATCH_EVALUATION_URL")]
    evaluation_url: String,

    /// Base URL of the change relay.
    #[arg(long, env = "FLAGWATCH_EVENTS_URL")]
    events_url: String,

    /// Server-side API key for the engine and the relay.
    #[arg(long, env = "FLAGWATCH_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Hard cap on a watch's lifetime, in seconds.
    #[arg(long, env = "FLAGWATCH_MAX_CONNECTION_SECS", default_value_t = 1800)]
    max_connection_secs: u64,

    /// Keep-alive ping interval in seconds. 0 disables pings.
    #[arg(long, env = "FLAGWATCH_PING_SECS", default_value_t = 30)]
    ping_secs: u64,

    /// How long a watch client has to send its setup message, in seconds.
    #[arg(long, env = "FLAGWATCH_SETUP_TIMEOUT_SECS", default_value_t = 60)]
    setup_timeout_secs: u64,

    /// Bound on every evaluation, in milliseconds.
    #[arg(long, env = "FLAGWATCH_EVALUATION_TIMEOUT_MS", default_value_t = 5000)]
    evaluation_timeout_ms: u64,

    #[arg(long, env = "FLAGWATCH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            session: SessionConfig {
                max_lifetime: Duration::from_secs(self.max_connection_secs),
                setup_timeout: Duration::from_secs(self.setup_timeout_secs),
                ping_interval: Duration::from_secs(self.ping_secs),
                evaluation_timeout: Duration::from_millis(self.evaluation_timeout_ms),
            },
            ..ServerConfig::default()
        }
    }
}

fn init_logging(format: LogFormat) {
    let json = (format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json());
    let pretty = (format == LogFormat::Pretty).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(json)
        .with(pretty)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), FlagwatchError> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = cli.server_config();
    tracing::info!(
        bind = %config.bind_addr,
        evaluation_url = %cli.evaluation_url,
        events_url = %cli.events_url,
        max_connection_secs = cli.max_connection_secs,
        "starting flagwatch"
    );

    let evaluator = HttpEvaluator::new(HttpEvaluatorConfig {
        evaluation_url: cli.evaluation_url.clone(),
        api_key: cli.api_key.clone(),
        timeout: config.session.evaluation_timeout,
    })?;
    if let Err(e) = evaluator.authenticate().await {
        tracing::warn!(error = %e, "initial engine authentication failed, will retry on demand");
    }
    let relay = SseRelay::new(&cli.events_url, cli.api_key.clone())?;

    let server = FlagwatchServerBuilder::new()
        .config(config)
        .build(evaluator, relay)
        .await?;
    server.run_until(shutdown_signal()).await
}

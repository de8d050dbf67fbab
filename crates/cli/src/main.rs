//! mq-trigger entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML file named by `--config`, apply
//!    command-line overrides, and validate it (`--check` stops here).
//! 2. **Wire observability**: install a `tracing-subscriber` registry with an
//!    `EnvFilter`, a pretty or JSON console layer, and an OpenTelemetry OTLP
//!    layer when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! 3. **Construct infrastructure**: a `ProcessInvoker` and a message source,
//!    either an `AmqpListener` or newline-delimited JSON on stdin (`--stdin`).
//! 4. **Run** the `Dispatcher` until the source ends, a fatal error occurs, or
//!    SIGINT/SIGTERM requests a graceful shutdown.
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Clean shutdown |
//! | 1 | Any other startup or runtime failure |
//! | 2 | Configuration error |
//! | 3 | Broker connection lost and retries exhausted |

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dispatcher::Dispatcher;
use invoker::ProcessInvoker;
use listener::{redact_url, AmqpListener};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod observability;
mod settings;

use observability::LogFormat;

/// Runs a command when qualifying messages arrive on a message queue.
#[derive(Debug, Parser)]
#[command(name = "mq-trigger", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "MQ_TRIGGER_CONFIG", default_value = "mq-trigger.toml")]
    config: PathBuf,

    /// Broker URL; overrides `broker.broker_url` from the file
    #[arg(long, env = "MQ_TRIGGER_BROKER_URL")]
    broker_url: Option<String>,

    /// Console log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Read newline-delimited JSON messages from stdin instead of a broker
    #[arg(long)]
    stdin: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = match observability::init(cli.log_format) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("mq-trigger: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(cli).await;
    if let Err(e) = &result {
        error!("mq-trigger failed: {e:#}");
    }
    telemetry.shutdown();
    ExitCode::from(settings::exit_code(&result))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = settings::load(&cli.config, cli.broker_url.as_deref())
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.check {
        info!(config = %cli.config.display(), "configuration is valid");
        return Ok(());
    }

    let dispatcher = Dispatcher::from_config(&config, Arc::new(ProcessInvoker::new()))?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let stats = if cli.stdin {
        info!("reading messages from stdin");
        let (mut source, reader) = listener::stdin_source();
        let stats = dispatcher.run(&mut source, cancel).await?;
        reader.abort();
        stats
    } else {
        info!(
            broker = %redact_url(&config.broker.broker_url),
            exchange = %config.broker.exchange,
            queue = %config.broker.queue,
            "connecting to broker"
        );
        let mut source = tokio::select! {
            connected = AmqpListener::connect(config.broker.clone()) => connected?,
            _ = cancel.cancelled() => {
                info!("shutdown requested before the broker connection was established");
                return Ok(());
            }
        };
        dispatcher.run(&mut source, cancel).await?
    };

    info!(
        received = stats.received,
        fired = stats.fired,
        suppressed = stats.suppressed(),
        launch_failures = stats.launch_failures,
        timed_out = stats.timed_out,
        "mq-trigger stopped"
    );
    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["mq-trigger"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Pretty);
        assert!(!cli.stdin && !cli.check);
    }

    #[test]
    fn cli_accepts_all_flags() {
        let cli = Cli::try_parse_from([
            "mq-trigger",
            "--config",
            "/etc/mq-trigger.toml",
            "--broker-url",
            "amqp://mq:5672",
            "--log-format",
            "json",
            "--stdin",
            "--check",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/mq-trigger.toml"));
        assert_eq!(cli.broker_url.as_deref(), Some("amqp://mq:5672"));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.stdin && cli.check);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["mq-trigger", "--log-format", "xml"]).is_err());
    }
}

//! claw-watch - tail the dashboard event stream.
//!
//! Prints every matching envelope as one JSON line on stdout and logs
//! connection lifecycle events to stderr.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use claw_stream::{
    ANY_EVENT_TYPE, ConnectionEvent, DeliveryMode, EventStream, Severity, StreamConfig,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "claw-watch")]
#[command(about = "Tail the dashboard event stream")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dashboard origin, overrides the config file
    #[arg(long)]
    base_url: Option<String>,

    /// Durable API credential
    #[arg(long, env = "CLAW_STREAM_CREDENTIAL", hide_env_values = true)]
    credential: Option<String>,

    /// Event category to print, repeatable
    #[arg(long = "type", value_name = "TYPE", default_value = ANY_EVENT_TYPE)]
    types: Vec<String>,

    /// Only events of this severity
    #[arg(long)]
    severity: Option<Severity>,

    /// Only events from this module
    #[arg(long)]
    module: Option<String>,

    /// Start in polling mode instead of streaming
    #[arg(long)]
    poll: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<StreamConfig> {
        let mut config = match (&self.config, &self.base_url) {
            (Some(path), _) => StreamConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            (None, Some(base_url)) => StreamConfig::new(base_url.clone()),
            (None, None) => bail!("either --config or --base-url is required"),
        };

        if let Some(base_url) = &self.base_url {
            config.base_url.clone_from(base_url);
        }
        if let Some(credential) = &self.credential {
            config = config.with_credential(credential.clone());
        }
        if let Some(severity) = self.severity {
            config.filters.severity = Some(severity);
        }
        if let Some(module) = &self.module {
            config.filters.module = Some(module.clone());
        }
        if self.poll {
            config = config.with_start_mode(DeliveryMode::Polling);
        }

        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn log_lifecycle(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Opened => info!("stream open"),
        ConnectionEvent::Error(err) => warn!(error = %err, "delivery error"),
        ConnectionEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        }
        ConnectionEvent::PolicyBlocked { reason } => {
            warn!(reason = reason.as_deref().unwrap_or("unspecified"), "blocked by policy");
        }
        ConnectionEvent::MaxRetriesExceeded { attempts } => {
            warn!(attempts, "retry budget exhausted");
        }
        ConnectionEvent::TokenUnavailable => warn!("stream token unavailable"),
        ConnectionEvent::ModeChanged(mode) => info!(%mode, "delivery mode changed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.load_config()?;
    let stream = EventStream::http(&config).context("invalid configuration")?;
    let mut lifecycle = stream.lifecycle();

    let (tx, mut envelopes) = mpsc::unbounded_channel();
    for event_type in &cli.types {
        let tx = tx.clone();
        stream.subscribe(event_type.clone(), move |envelope| {
            let _ = tx.send(envelope);
        });
    }
    drop(tx);

    let mut stdout = io::stdout().lock();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing");
                break;
            }
            Some(envelope) = envelopes.recv() => {
                let line = serde_json::to_string(envelope.as_ref())?;
                writeln!(stdout, "{line}")?;
                stdout.flush()?;
            }
            event = lifecycle.recv() => match event {
                Ok(event) => log_lifecycle(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lifecycle events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    stream.close().await;
    Ok(())
}

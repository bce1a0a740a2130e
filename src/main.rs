// # AgentGate Server
//
// Main entry point for the protocol-bridging reverse proxy.
// Loads the properties file, installs logging, starts the service and
// waits for a termination signal.

use agentgate::config::{load_properties, AgentConfig, LogConfig};
use agentgate::extension::DefaultExtension;
use agentgate::{AgentError, Result, Service, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./agent.properties", "./conf/agent.properties"];

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path().ok_or_else(|| {
        AgentError::Config(format!(
            "no configuration file; pass -cf <path> or provide one of {:?}",
            DEFAULT_CONFIG_PATHS
        ))
    })?;

    let props = load_properties(&config_path)?;
    // Install the subscriber before the full parse so config warnings
    // are not lost.
    init_logging(&peek_log_config(&props))?;
    let conf = AgentConfig::from_properties(props)?;

    info!(
        version = VERSION,
        config = %config_path.display(),
        "starting agentgate"
    );

    let service = Service::new(conf.service, Arc::new(DefaultExtension::new()))?;
    if let Err(err) = service.start().await {
        error!(error = %err, "startup failed");
        return Err(err);
    }

    wait_for_shutdown().await;
    service.stop();
    info!("shutdown complete");
    Ok(())
}

/// Resolve the configuration file: the `-cf` flag wins, then the
/// default locations.
fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-cf" {
            return args.next().map(PathBuf::from);
        }
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn peek_log_config(props: &std::collections::HashMap<String, String>) -> LogConfig {
    LogConfig {
        dir: props.get("agent.log.dir").cloned(),
        file: props.get("agent.log.file").cloned(),
        level: props.get("agent.log.level").cloned(),
    }
}

fn init_logging(conf: &LogConfig) -> Result<()> {
    let level = conf
        .level
        .as_deref()
        .unwrap_or("info")
        .parse::<tracing::Level>()
        .map_err(|_| {
            AgentError::Config(format!(
                "invalid log level: {}",
                conf.level.as_deref().unwrap_or_default()
            ))
        })?;

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_max_level(level);

    match &conf.file {
        Some(file) => {
            let dir = conf.dir.as_deref().unwrap_or(".");
            std::fs::create_dir_all(dir)?;
            let path = PathBuf::from(dir).join(file);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = term.recv() => info!("terminate received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}

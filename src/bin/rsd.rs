//! rsd: audio relay server
//!
//! Accepts streams from rsound clients and plays them on a local backend.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rsound::{
    backend::{available_backends, create_backend},
    config::{AppConfig, ServerConfig},
    server::Server,
};

#[derive(Parser, Debug)]
#[command(version)]
/// Audio relay server
///
/// Accepts PCM streams from rsound clients and plays them on a local
/// backend. Command-line options override the configuration file.
struct Args {
    /// Configuration file
    #[arg(long = "config", short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long = "bind", short = 'b')]
    bind: Option<String>,

    /// Port to listen on
    #[arg(long = "port", short = 'p')]
    port: Option<u16>,

    /// Output backend
    #[arg(long = "backend", short = 'B')]
    backend: Option<String>,

    /// Output device
    #[arg(long = "device", short = 'd')]
    device: Option<String>,

    /// Serve one client at a time
    #[arg(long = "single", short = 's')]
    single: bool,

    /// Print the compiled-in backends and exit
    #[arg(long = "list-backends")]
    list_backends: bool,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if self.device.is_some() {
            config.device = self.device;
        }
        config.single_connection |= self.single;
    }
}

/// Clear `running` on Ctrl-C or SIGTERM so the server drains and exits
fn install_shutdown_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::info!("Signal received, stopping");
        running.store(false, Ordering::Relaxed);
    })
    .context("Failed to install signal handler")
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.list_backends {
        println!("{}", available_backends().join("\n"));
        return Ok(());
    }

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let server_config = &mut config.server;
    args.apply(server_config);

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| server_config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting rsd");

    let backend = create_backend(&server_config.backend, server_config.device.as_deref())
        .context("Failed to create backend")?;

    let server = Server::bind(server_config, backend)
        .with_context(|| format!("Failed to listen on {}", server_config.bind_endpoint()))?;
    install_shutdown_handler(server.running_flag())?;

    let stats = server.run()?;
    tracing::info!(
        "Served {} connection(s), {} failed, {} bytes relayed",
        stats.connections,
        stats.failed_sessions,
        stats.bytes_relayed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "rsd", "-b", "0.0.0.0", "--port", "4000", "-B", "null", "-d", "hw:1", "--single",
        ])
        .unwrap();

        let mut config = ServerConfig::default();
        args.apply(&mut config);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 4000);
        assert_eq!(config.backend, "null");
        assert_eq!(config.device.as_deref(), Some("hw:1"));
        assert!(config.single_connection);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let args = Args::try_parse_from(["rsd"]).unwrap();
        let mut config = ServerConfig::default();
        let before = config.clone();
        args.apply(&mut config);

        assert_eq!(config.port, before.port);
        assert_eq!(config.backend, before.backend);
        assert_eq!(config.single_connection, before.single_connection);
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(Args::try_parse_from(["rsd", "-p", "99999"]).is_err());
        assert!(Args::try_parse_from(["rsd", "--bogus"]).is_err());
    }
}

//! # vigil
//!
//! Vigil event core binary: loads settings, wires authentication, the
//! optional shared bus and metrics into a [`VigilServer`], and serves until
//! ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use vigil_auth::{AccessDirectory, ChannelAuthorizer, InMemoryDirectory, JwtAuthenticator};
use vigil_bus::{Bus, RedisBus, SyncConfig};
use vigil_server::{ServerConfig, VigilServer};
use vigil_settings::VigilSettings;

/// Vigil real-time event server.
#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Vigil real-time event server")]
struct Cli {
    /// Settings file (defaults to `~/.vigil/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent connections (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Shared bus URL; implies the bus is enabled.
    #[arg(long, conflicts_with = "no_bus")]
    bus_url: Option<String>,

    /// Run standalone without cross-instance sync.
    #[arg(long)]
    no_bus: bool,

    /// JSON snapshot seeding the access directory.
    #[arg(long)]
    directory: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut VigilSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
        if let Some(url) = &self.bus_url {
            settings.bus.url.clone_from(url);
            settings.bus.enabled = true;
        }
        if self.no_bus {
            settings.bus.enabled = false;
        }
        if let Some(path) = &self.directory {
            settings.directory_path = Some(path.to_string_lossy().into_owned());
        }
    }
}

fn load(cli: &Cli) -> Result<VigilSettings> {
    let path = cli.settings.clone().unwrap_or_else(vigil_settings::settings_path);
    let mut settings = vigil_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    Ok(settings)
}

fn build_directory(settings: &VigilSettings) -> Result<Arc<dyn AccessDirectory>> {
    match &settings.directory_path {
        Some(path) => {
            let directory = InMemoryDirectory::from_json_file(Path::new(path))
                .with_context(|| format!("Failed to load access directory from {path}"))?;
            Ok(Arc::new(directory))
        }
        None => {
            tracing::warn!("no access directory configured; patient and device channels will be denied");
            Ok(Arc::new(InMemoryDirectory::new()))
        }
    }
}

fn build_bus(settings: &VigilSettings) -> Result<Option<Arc<dyn Bus>>> {
    if !settings.bus.enabled {
        tracing::info!("shared bus disabled, running standalone");
        return Ok(None);
    }
    let bus = RedisBus::new(&settings.bus.url).context("Invalid bus URL")?;
    Ok(Some(Arc::new(bus)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    vigil_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let secret = settings
        .auth
        .jwt_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .context("No JWT secret configured (set JWT_SECRET or auth.jwtSecret)")?;
    let authenticator = JwtAuthenticator::new(secret.as_bytes());
    let authorizer = ChannelAuthorizer::new(build_directory(&settings)?, settings.auth.admin_roles.clone());
    let bus = build_bus(&settings)?;

    let prometheus = vigil_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let server = VigilServer::new(
        ServerConfig::from(&settings),
        authenticator,
        authorizer,
        bus,
        SyncConfig::from(&settings.bus),
        Some(prometheus),
    );

    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!(instance_id = %server.instance_id(), "Vigil listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown_gracefully().await {
        tracing::warn!("background tasks did not finish before the shutdown timeout");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["vigil"]);
        let mut settings = VigilSettings::default();
        let defaults = VigilSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, defaults.server.host);
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(settings.bus.enabled, defaults.bus.enabled);
        assert_eq!(settings.directory_path, None);
    }

    #[test]
    fn cli_overrides_listener() {
        let cli = Cli::parse_from(["vigil", "--host", "0.0.0.0", "--port", "9000", "--max-connections", "5"]);
        let mut settings = VigilSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.max_connections, 5);
    }

    #[test]
    fn bus_url_enables_bus() {
        let cli = Cli::parse_from(["vigil", "--bus-url", "redis://cache:6379"]);
        let mut settings = VigilSettings::default();
        settings.bus.enabled = false;
        cli.apply(&mut settings);
        assert!(settings.bus.enabled);
        assert_eq!(settings.bus.url, "redis://cache:6379");
    }

    #[test]
    fn no_bus_disables_bus() {
        let cli = Cli::parse_from(["vigil", "--no-bus"]);
        let mut settings = VigilSettings::default();
        cli.apply(&mut settings);
        assert!(!settings.bus.enabled);
        assert!(build_bus(&settings).unwrap().is_none());
    }

    #[test]
    fn bus_flags_conflict() {
        assert!(Cli::try_parse_from(["vigil", "--no-bus", "--bus-url", "redis://x"]).is_err());
    }

    #[test]
    fn load_reads_explicit_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"port":7001}}"#).unwrap();
        let cli = Cli::parse_from(["vigil", "--settings", path.to_str().unwrap()]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.port, 7001);
    }

    #[test]
    fn missing_directory_file_is_an_error() {
        let mut settings = VigilSettings::default();
        settings.directory_path = Some("/nonexistent/vigil/directory.json".into());
        assert!(build_directory(&settings).is_err());
    }
}

#![deny(unsafe_code)]

//! Warden CLI: runs the daemon and talks to it over its IPC socket.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden_config::AppConfig;
use warden_core::ipc::{IpcClient, StatusReport};
use warden_core::{Daemon, ScanType};

static LONG_VERSION: LazyLock<String> = LazyLock::new(warden_core::build_info::version_string);

/// Warden: endpoint protection daemon and control client.
#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version = warden_core::build_info::VERSION,
    long_version = LONG_VERSION.as_str(),
    about,
    long_about = None
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/warden/warden.toml")]
    config: PathBuf,

    /// Daemon socket, overriding the configured path.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the daemon in the foreground until Ctrl-C.
    Start,

    /// Check that the daemon is responding.
    Ping,

    /// Show protection state, firewall flag and scan times.
    Status,

    /// Pause real-time protection.
    Pause,

    /// Resume protection.
    Resume,

    /// Start a scan job.
    Scan {
        #[arg(value_enum)]
        kind: ScanKind,
    },

    /// Control the firewall.
    Firewall {
        #[arg(value_enum)]
        action: FirewallAction,
    },

    /// Print protection state changes as they happen.
    Watch,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum ScanKind {
    Quick,
    Full,
}

impl From<ScanKind> for ScanType {
    fn from(kind: ScanKind) -> Self {
        match kind {
            ScanKind::Quick => ScanType::Quick,
            ScanKind::Full => ScanType::Full,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum FirewallAction {
    Enable,
    Disable,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| config.daemon.socket_path.clone());

    match cli.command {
        Commands::Start => cmd_start(config, &socket).await?,
        Commands::Watch => cmd_watch(&socket).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
        command => {
            let output = run_client_command(&command, &socket).await?;
            println!("{output}");
        }
    }

    Ok(())
}

async fn cmd_start(config: AppConfig, socket: &Path) -> Result<()> {
    info!(version = %warden_core::build_info::version_string(), "Starting warden daemon");
    let daemon = Arc::new(Daemon::new(config));
    daemon.run_at(socket).await?;
    Ok(())
}

/// Run one request/response command and return what to print.
async fn run_client_command(command: &Commands, socket: &Path) -> Result<String> {
    let mut client = connect(socket).await?;
    let output = match command {
        Commands::Ping => client.ping().await?,
        Commands::Status => render_status(&client.status().await?),
        Commands::Pause => client.pause().await?,
        Commands::Resume => client.resume().await?,
        Commands::Scan { kind } => {
            let started = client.scan((*kind).into()).await?;
            format!("scan started: {}", started.job_id)
        }
        Commands::Firewall { action } => match action {
            FirewallAction::Enable => client.set_firewall(true).await?,
            FirewallAction::Disable => client.set_firewall(false).await?,
            FirewallAction::Status => {
                let status = client.firewall_status().await?;
                format!("firewall: {}", if status.enabled { "enabled" } else { "disabled" })
            }
        },
        Commands::Start | Commands::Watch | Commands::Config { .. } => {
            anyhow::bail!("{command:?} is not a client command")
        }
    };
    Ok(output)
}

async fn cmd_watch(socket: &Path) -> Result<()> {
    let mut client = connect(socket).await?;
    client.subscribe().await?;
    let current = client.status().await?.state;
    println!("state: {current}");

    loop {
        tokio::select! {
            change = client.next_event() => {
                let change = change.context("lost connection to daemon")?;
                println!("{} -> {}", change.old_state, change.new_state);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn connect(socket: &Path) -> Result<IpcClient> {
    IpcClient::connect(socket)
        .await
        .with_context(|| format!("cannot reach warden daemon at {}", socket.display()))
}

fn render_status(status: &StatusReport) -> String {
    let last_scan = status.last_scan.map(|t| t.to_rfc3339());
    let rules_updated = status.rules_updated.map(|t| t.to_rfc3339());
    format!(
        "state:          {}\nfirewall:       {}\nlast scan:      {}\nrules updated:  {}",
        status.state,
        if status.firewall_enabled { "enabled" } else { "disabled" },
        last_scan.as_deref().unwrap_or("never"),
        rules_updated.as_deref().unwrap_or("never"),
    )
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use warden_core::ProtectionState;
    use warden_test_utils::config::TestConfigBuilder;
    use warden_test_utils::daemon::TestServer;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["warden", "scan", "full"]).unwrap();
        assert_eq!(cli.command, Commands::Scan { kind: ScanKind::Full });

        let cli = Cli::try_parse_from(["warden", "-s", "/tmp/w.sock", "firewall", "status"])
            .unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/w.sock")));
        assert_eq!(
            cli.command,
            Commands::Firewall {
                action: FirewallAction::Status
            }
        );

        assert!(Cli::try_parse_from(["warden", "scan", "deep"]).is_err());
    }

    #[test]
    fn test_render_status() {
        let text = render_status(&StatusReport {
            state: ProtectionState::Paused,
            firewall_enabled: true,
            last_scan: None,
            rules_updated: None,
        });
        assert!(text.contains("state:          paused"));
        assert!(text.contains("firewall:       enabled"));
        assert!(text.contains("last scan:      never"));
    }

    #[test_log::test(tokio::test)]
    async fn test_client_commands_against_daemon() {
        let server = TestServer::start(TestConfigBuilder::new().build()).await;
        let socket = server.socket_path();

        assert_eq!(run_client_command(&Commands::Ping, socket).await.unwrap(), "pong");
        assert_eq!(
            run_client_command(&Commands::Pause, socket).await.unwrap(),
            "protection paused"
        );
        let status = run_client_command(&Commands::Status, socket).await.unwrap();
        assert!(status.contains("paused"));
        assert_eq!(
            run_client_command(
                &Commands::Firewall {
                    action: FirewallAction::Status
                },
                socket
            )
            .await
            .unwrap(),
            "firewall: disabled"
        );
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_client_command(&Commands::Ping, &dir.path().join("none.sock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot reach warden daemon"));
    }

    #[tokio::test]
    async fn test_load_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.daemon.health_interval_secs, 300);
    }
}

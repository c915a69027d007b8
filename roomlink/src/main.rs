mod balancer;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use roomlink_core::{bootstrap::load_config, logging};

#[derive(Parser, Debug)]
#[command(name = "roomlink")]
#[command(about = "Multi-party media session server and room balancer", long_about = None)]
struct Cli {
    /// Config file (YAML or TOML); falls back to ROOMLINK_CONFIG_PATH and ./config.yaml
    #[arg(short, long, env = "ROOMLINK_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run a media server hosting rooms on the in-process loopback engine (signaling only, no media forwarding)
    Server,
    /// Run the balancer placing rooms onto media servers
    Balancer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    logging::init_logging(&config.logging)?;

    match cli.command {
        Command::Server => {
            info!("roomlink media server starting...");
            server::run(config).await
        }
        Command::Balancer => {
            info!("roomlink balancer starting...");
            balancer::run(config).await
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["roomlink", "server"]).unwrap();
        assert_eq!(cli.command, Command::Server);

        let cli = Cli::try_parse_from(["roomlink", "balancer", "--config", "lb.yaml"]).unwrap();
        assert_eq!(cli.command, Command::Balancer);
        assert_eq!(cli.config.as_deref(), Some("lb.yaml"));
    }

    #[test]
    fn test_server_help_names_the_loopback_engine() {
        use clap::CommandFactory;

        let cli = Cli::command();
        let server = cli.find_subcommand("server").unwrap();
        let about = server.get_about().unwrap().to_string();
        assert!(about.contains("loopback engine"));
        assert!(about.contains("no media forwarding"));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["roomlink"]).is_err());
    }
}

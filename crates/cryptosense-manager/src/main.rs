//! CLI entry point for the cryptosense-manager service.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cryptosense_manager::ca::{CA_CERT_FILE, CA_KEY_FILE};
use cryptosense_manager::{config, server, CertificateAuthority, ControlPlane};

#[derive(Parser)]
#[command(name = "cryptosense-manager")]
#[command(about = "Control plane for CryptoSense sensors")]
struct Cli {
    /// Config file prefix (default: cryptosense).
    #[arg(short, long, default_value = "cryptosense", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Serve the control plane API (default).
    Serve,
    /// Create the certificate authority if it does not exist yet.
    InitCa {
        /// Directory for ca.pem and ca.key (default: configured ca_dir).
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Print the manager version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Cmd::Serve) {
        Cmd::Version => {
            println!("cryptosense-manager {}", env!("CARGO_PKG_VERSION"));
        }
        Cmd::Serve => {
            let config = config::load(&cli.config)?;
            tracing::info!(
                listen = %config.listen,
                tenant_id = %config.tenant_id,
                tls = config.tls.enabled,
                "Starting cryptosense-manager"
            );
            let state = Arc::new(ControlPlane::from_config(config)?);
            server::serve(state, shutdown_signal()).await?;
        }
        Cmd::InitCa { dir } => {
            let config = config::load(&cli.config)?;
            let Some(dir) = dir.or(config.ca_dir) else {
                anyhow::bail!("No CA directory: pass --dir or set manager.ca_dir");
            };
            CertificateAuthority::load_or_create(&dir)?;
            println!(
                "CA ready: {} and {}",
                dir.join(CA_CERT_FILE).display(),
                dir.join(CA_KEY_FILE).display()
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

//! CLI entry point for the cryptosense-sensor daemon.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cryptosense_core::Discovery;
use cryptosense_store::read_segment;

use cryptosense_sensor::backend::PcapBackend;
use cryptosense_sensor::client::OutboundClient;
use cryptosense_sensor::reporter::{existing_cipher, export_stored, upload_export};
use cryptosense_sensor::{agent, config, Agent, SensorIdentity};

#[derive(Parser)]
#[command(name = "cryptosense-sensor")]
#[command(about = "Passive TLS/SSH discovery sensor for CryptoSense")]
struct Cli {
    /// Config file prefix (default: cryptosense).
    #[arg(short, long, default_value = "cryptosense", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the sensor daemon (default).
    Run,
    /// Register with the control plane and save the issued identity.
    Register,
    /// Write every stored discovery into an air-gapped export file.
    Export {
        /// Directory receiving the export file.
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Submit an export file to the control plane.
    Upload {
        file: PathBuf,
    },
    /// Decrypt a segment file and print its records as JSON lines.
    Inspect {
        segment: PathBuf,
    },
    /// Print the sensor version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Version => {
            println!("cryptosense-sensor {}", env!("CARGO_PKG_VERSION"));
        }
        Cmd::Run => {
            let config = config::load(&cli.config)?;
            let identity = agent::ensure_identity(&config).await?;
            tracing::info!(
                sensor_id = %identity.sensor_id,
                tenant_id = %identity.tenant_id,
                "Sensor identity ready"
            );
            Agent::new(config, identity, Arc::new(PcapBackend))?
                .run()
                .await?;
        }
        Cmd::Register => {
            let config = config::load(&cli.config)?;
            if let Some(existing) = SensorIdentity::load(&config.storage.data_path)? {
                anyhow::bail!(
                    "Sensor already registered as {}; remove {} to re-register",
                    existing.sensor_id,
                    SensorIdentity::path(&config.storage.data_path).display()
                );
            }
            let identity = agent::register(&config).await?;
            println!("{}", identity.sensor_id);
        }
        Cmd::Export { out } => {
            let config = config::load(&cli.config)?;
            let sensor_id = SensorIdentity::load(&config.storage.data_path)?
                .map(|i| i.sensor_id)
                .unwrap_or_else(|| config.name.clone());

            let (export, path) = export_stored(&config.storage, &sensor_id, &out)?;
            tracing::info!(
                export_id = %export.export_id,
                records = export.record_count,
                path = %path.display(),
                "Export written"
            );
            println!("{}", path.display());
        }
        Cmd::Upload { file } => {
            let config = config::load(&cli.config)?;
            let identity = SensorIdentity::load(&config.storage.data_path)?
                .ok_or_else(|| anyhow::anyhow!("Sensor is not registered"))?;
            let base_url = if identity.control_plane_url.is_empty() {
                config.control_plane_url.clone()
            } else {
                identity.control_plane_url.clone()
            };
            let client = OutboundClient::new(
                &base_url,
                Duration::from_secs(config.reporting.request_timeout_secs),
                Some(&identity),
            )?;
            let receipt = upload_export(&client, &file).await?;
            println!("{} {}", receipt.export_id, receipt.records);
        }
        Cmd::Inspect { segment } => {
            let config = config::load(&cli.config)?;
            let cipher = existing_cipher(&config.storage)?;
            let contents = read_segment(&segment, &cipher)?;

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for record in &contents.records {
                let discovery: Discovery = serde_json::from_slice(record)?;
                writeln!(out, "{}", serde_json::to_string(&discovery)?)?;
            }
            if contents.corrupt > 0 {
                tracing::warn!(
                    segment = %segment.display(),
                    corrupt = contents.corrupt,
                    "Skipped corrupt records"
                );
            }
        }
    }

    Ok(())
}

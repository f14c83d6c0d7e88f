use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cloudstack_cloud::{CloudConnector, CloudStackClient, CloudStackConfig};
use cloudstack_csi_driver::server;
use cloudstack_mount::{LinuxMounter, Mounter};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CSI plugin for Apache CloudStack.
#[derive(Debug, Parser)]
#[command(name = "cloudstack-csi-driver", version)]
struct Cli {
  /// CSI gRPC endpoint (unix:// or tcp://)
  #[arg(long, default_value = "unix:///tmp/csi.sock")]
  endpoint: String,

  /// CloudStack configuration file
  #[arg(long = "cloudstack-config", default_value = "./cloud-config")]
  cloudstack_config: PathBuf,

  /// Node name, as registered in the container orchestrator
  #[arg(long = "node-name", env = "NODE_NAME", default_value = "")]
  node_name: String,

  /// Enable debug logging
  #[arg(long)]
  debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  let filter = if cli.debug {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  };
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let config = CloudStackConfig::load(&cli.cloudstack_config)
    .with_context(|| format!("cannot load {}", cli.cloudstack_config.display()))?;
  let cloud: Arc<dyn CloudConnector> = Arc::new(CloudStackClient::new(&config)?);
  let mounter: Arc<dyn Mounter> = Arc::new(LinuxMounter::new());

  info!(
    endpoint = %cli.endpoint,
    version = env!("CARGO_PKG_VERSION"),
    "starting CloudStack CSI driver"
  );
  server::run(
    &cli.endpoint,
    cloud,
    mounter,
    cli.node_name,
    env!("CARGO_PKG_VERSION"),
  )
  .await?;
  Ok(())
}

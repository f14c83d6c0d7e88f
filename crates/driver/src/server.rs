//! gRPC front-end serving the Identity, Controller and Node services on
//! a single endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cloudstack_cloud::CloudConnector;
use cloudstack_mount::Mounter;
use csi_proto::v1::controller_server::ControllerServer;
use csi_proto::v1::identity_server::IdentityServer;
use csi_proto::v1::node_server::NodeServer;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::controller::ControllerService;
use crate::identity::IdentityService;
use crate::node::NodeService;

#[derive(Debug, Error)]
pub enum ServerError {
  #[error("invalid endpoint: {0}")]
  InvalidEndpoint(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  AddrParse(#[from] std::net::AddrParseError),

  #[error(transparent)]
  Transport(#[from] tonic::transport::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
  Unix(PathBuf),
  Tcp(String),
}

/// Parses a `unix://` or `tcp://` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint, ServerError> {
  let lower = endpoint.to_ascii_lowercase();
  let (scheme, addr) = if let Some(addr) = lower.strip_prefix("unix://") {
    ("unix", addr)
  } else if let Some(addr) = lower.strip_prefix("tcp://") {
    ("tcp", addr)
  } else {
    return Err(ServerError::InvalidEndpoint(endpoint.to_string()));
  };
  if addr.is_empty() {
    return Err(ServerError::InvalidEndpoint(endpoint.to_string()));
  }
  // keep the original casing of the address part
  let addr = &endpoint[endpoint.len() - addr.len()..];
  Ok(match scheme {
    "unix" => {
      let path = if addr.starts_with('/') {
        addr.to_string()
      } else {
        format!("/{addr}")
      };
      Endpoint::Unix(PathBuf::from(path))
    }
    _ => Endpoint::Tcp(addr.to_string()),
  })
}

/// Runs the CSI gRPC server until it is shut down.
pub async fn run(
  endpoint: &str,
  cloud: Arc<dyn CloudConnector>,
  mounter: Arc<dyn Mounter>,
  node_name: String,
  version: &str,
) -> Result<(), ServerError> {
  let router = Server::builder()
    .add_service(IdentityServer::new(IdentityService::new(version)))
    .add_service(ControllerServer::new(ControllerService::new(Arc::clone(
      &cloud,
    ))))
    .add_service(NodeServer::new(NodeService::new(cloud, mounter, node_name)));

  match parse_endpoint(endpoint)? {
    Endpoint::Unix(path) => {
      // a previous run may have left its socket behind
      match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
      }
      let listener = UnixListener::bind(&path)?;
      info!(socket = %path.display(), "listening for connections");
      router
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await?;
    }
    Endpoint::Tcp(addr) => {
      let addr: SocketAddr = addr.parse()?;
      info!(%addr, "listening for connections");
      router.serve(addr).await?;
    }
  }
  Ok(())
}

//! CloudStack connector for the CSI driver.
//!
//! The [`CloudConnector`] trait is the seam between the CSI services and
//! the CloudStack management API. The real implementation
//! ([`CloudStackClient`]) talks HTTP to the management server; tests use
//! the in-memory [`fake::FakeCloud`].

use async_trait::async_trait;
use thiserror::Error;

mod client;
pub mod config;
pub mod fake;
pub mod metadata;

pub use client::CloudStackClient;
pub use config::CloudStackConfig;

/// A CloudStack block volume, as reported by `listVolumes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
  pub id: String,
  pub name: String,

  /// Size in bytes.
  pub size: i64,

  pub disk_offering_id: String,
  pub zone_id: String,

  /// VM the volume is attached to, if any.
  pub virtual_machine_id: Option<String>,
  /// Device slot on the VM bus, if attached.
  pub device_id: Option<i64>,
  /// Hypervisor running the attached VM; drives device slot
  /// correction on the node.
  pub hypervisor: String,
}

/// A CloudStack virtual machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachine {
  pub id: String,
  pub zone_id: String,
}

#[derive(Debug, Error)]
pub enum CloudError {
  #[error("not found")]
  NotFound,

  #[error("too many results")]
  TooManyResults,

  #[error("CloudStack API error {code}: {message}")]
  Api { code: i64, message: String },

  #[error("CloudStack async job failed: {0}")]
  JobFailed(String),

  #[error("volume {0} must be in Allocated or Ready state to be resized")]
  NotResizable(String),

  #[error("cannot initialize request signer")]
  Signing,

  #[error(transparent)]
  Http(#[from] reqwest::Error),

  #[error("unexpected CloudStack API response: {0}")]
  InvalidResponse(String),
}

/// Operations against the CloudStack management API used by the driver.
///
/// All lookups that expect exactly one result return
/// [`CloudError::NotFound`] for zero matches and
/// [`CloudError::TooManyResults`] for more than one.
#[async_trait]
pub trait CloudConnector: Send + Sync {
  /// Resolves the VM backing a node, preferring the instance ID from
  /// local metadata over a name lookup.
  async fn resolve_node(&self, node_name: &str) -> Result<VirtualMachine, CloudError>;

  async fn vm_by_id(&self, vm_id: &str) -> Result<VirtualMachine, CloudError>;

  /// IDs of all available zones.
  async fn list_zone_ids(&self) -> Result<Vec<String>, CloudError>;

  async fn volume_by_id(&self, volume_id: &str) -> Result<Volume, CloudError>;

  async fn volume_by_name(&self, name: &str) -> Result<Volume, CloudError>;

  /// Creates a volume and returns its ID.
  async fn create_volume(
    &self,
    disk_offering_id: &str,
    zone_id: &str,
    name: &str,
    size_gb: i64,
  ) -> Result<String, CloudError>;

  async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError>;

  /// Attaches a volume to a VM and returns the device slot.
  async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<i64, CloudError>;

  async fn detach_volume(&self, volume_id: &str) -> Result<(), CloudError>;

  /// Resizes a volume to `new_size_gb`.
  async fn expand_volume(&self, volume_id: &str, new_size_gb: i64) -> Result<(), CloudError>;
}

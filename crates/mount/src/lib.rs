//! Mount operations for the CSI node service.
//!
//! The [`Mounter`] trait covers everything the node service does to the
//! local machine: formatting and mounting devices, bind mounts,
//! `/proc/mounts` inspection, SCSI bus maintenance and volume
//! statistics. [`LinuxMounter`] shells out to the usual system tools;
//! [`fake::FakeMounter`] records calls for tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub mod fake;
mod linux;

pub use linux::LinuxMounter;

#[derive(Debug, Error)]
pub enum MountError {
  #[error("`{command}` failed: {message}")]
  CommandFailed { command: String, message: String },

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("cannot parse {0}")]
  Parse(String),
}

/// Capacity and inode usage of a mounted volume. For raw block volumes
/// only `total_bytes` is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeStatistics {
  pub available_bytes: i64,
  pub total_bytes: i64,
  pub used_bytes: i64,
  pub available_inodes: i64,
  pub total_inodes: i64,
  pub used_inodes: i64,
}

/// Local filesystem and device operations needed to stage and publish
/// volumes.
#[async_trait]
pub trait Mounter: Send + Sync {
  /// Mounts `source` on `target`, formatting the device first when it
  /// carries no filesystem yet.
  async fn format_and_mount(
    &self,
    source: &Path,
    target: &Path,
    fs_type: &str,
    options: &[String],
  ) -> Result<(), MountError>;

  async fn mount(
    &self,
    source: &Path,
    target: &Path,
    fs_type: Option<&str>,
    options: &[String],
  ) -> Result<(), MountError>;

  async fn unmount(&self, target: &Path) -> Result<(), MountError>;

  async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError>;

  /// The device mounted at `mount_path` and the number of times that
  /// device appears in the mount table. `None` when nothing is mounted
  /// there.
  async fn device_ref_count(
    &self,
    mount_path: &Path,
  ) -> Result<Option<(String, usize)>, MountError>;

  async fn path_exists(&self, path: &Path) -> Result<bool, MountError>;

  async fn make_dir(&self, path: &Path) -> Result<(), MountError>;

  async fn make_file(&self, path: &Path) -> Result<(), MountError>;

  async fn remove_path(&self, path: &Path) -> Result<(), MountError>;

  /// Best-effort SCSI bus rescan, used while waiting for a freshly
  /// attached device to appear.
  async fn rescan_scsi(&self);

  /// Best-effort removal of the SCSI device in the given slot after
  /// the volume is gone.
  async fn cleanup_scsi(&self, slot: i64);

  async fn statistics(&self, path: &Path) -> Result<VolumeStatistics, MountError>;

  async fn is_block_device(&self, path: &Path) -> Result<bool, MountError>;
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
  pub device: String,
  pub path: PathBuf,
  pub fs_type: String,
}

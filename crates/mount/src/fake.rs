//! Recording [`Mounter`] for tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{MountEntry, MountError, Mounter, VolumeStatistics};

/// In-memory mount table that records every action so tests can assert
/// on what the node service did to the machine.
#[derive(Clone, Default)]
pub struct FakeMounter(Arc<Mutex<Inner>>);

#[derive(Default)]
struct Inner {
  mounts: Vec<MountEntry>,
  paths: HashSet<PathBuf>,
  block_devices: HashSet<PathBuf>,
  statistics: VolumeStatistics,
  mount_error: Option<String>,
  log: Vec<String>,
}

impl FakeMounter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes a path visible to `path_exists`.
  pub fn add_path(&self, path: impl Into<PathBuf>) {
    self.0.lock().unwrap().paths.insert(path.into());
  }

  pub fn add_block_device(&self, path: impl Into<PathBuf>) {
    let path = path.into();
    let mut inner = self.0.lock().unwrap();
    inner.paths.insert(path.clone());
    inner.block_devices.insert(path);
  }

  pub fn add_mount(&self, device: &str, path: impl Into<PathBuf>, fs_type: &str) {
    self.0.lock().unwrap().mounts.push(MountEntry {
      device: device.to_string(),
      path: path.into(),
      fs_type: fs_type.to_string(),
    });
  }

  pub fn set_statistics(&self, statistics: VolumeStatistics) {
    self.0.lock().unwrap().statistics = statistics;
  }

  /// Makes every subsequent `mount` fail with `message`.
  pub fn fail_mounts(&self, message: &str) {
    self.0.lock().unwrap().mount_error = Some(message.to_string());
  }

  pub fn mounts(&self) -> Vec<MountEntry> {
    self.0.lock().unwrap().mounts.clone()
  }

  pub fn log(&self) -> Vec<String> {
    self.0.lock().unwrap().log.clone()
  }

  pub fn reset_log(&self) {
    self.0.lock().unwrap().log.clear();
  }
}

#[async_trait]
impl Mounter for FakeMounter {
  async fn format_and_mount(
    &self,
    source: &Path,
    target: &Path,
    fs_type: &str,
    options: &[String],
  ) -> Result<(), MountError> {
    let mut inner = self.0.lock().unwrap();
    inner.log.push(format!(
      "format_and_mount {} {} {} [{}]",
      source.display(),
      target.display(),
      fs_type,
      options.join(",")
    ));
    inner.mounts.push(MountEntry {
      device: source.display().to_string(),
      path: target.to_path_buf(),
      fs_type: fs_type.to_string(),
    });
    Ok(())
  }

  async fn mount(
    &self,
    source: &Path,
    target: &Path,
    fs_type: Option<&str>,
    options: &[String],
  ) -> Result<(), MountError> {
    let mut inner = self.0.lock().unwrap();
    inner.log.push(format!(
      "mount {} {} {} [{}]",
      source.display(),
      target.display(),
      fs_type.unwrap_or("-"),
      options.join(",")
    ));
    if let Some(message) = inner.mount_error.clone() {
      return Err(MountError::CommandFailed {
        command: "mount".to_string(),
        message,
      });
    }
    inner.mounts.push(MountEntry {
      device: source.display().to_string(),
      path: target.to_path_buf(),
      fs_type: fs_type.unwrap_or_default().to_string(),
    });
    Ok(())
  }

  async fn unmount(&self, target: &Path) -> Result<(), MountError> {
    let mut inner = self.0.lock().unwrap();
    inner.log.push(format!("unmount {}", target.display()));
    match inner.mounts.iter().position(|m| m.path == target) {
      Some(idx) => {
        inner.mounts.remove(idx);
        Ok(())
      }
      None => Err(MountError::CommandFailed {
        command: "umount".to_string(),
        message: format!("{}: not mounted", target.display()),
      }),
    }
  }

  async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
    Ok(self.0.lock().unwrap().mounts.iter().any(|m| m.path == path))
  }

  async fn device_ref_count(
    &self,
    mount_path: &Path,
  ) -> Result<Option<(String, usize)>, MountError> {
    let inner = self.0.lock().unwrap();
    let device = match inner.mounts.iter().find(|m| m.path == mount_path) {
      Some(entry) => entry.device.clone(),
      None => return Ok(None),
    };
    let refs = inner.mounts.iter().filter(|m| m.device == device).count();
    Ok(Some((device, refs)))
  }

  async fn path_exists(&self, path: &Path) -> Result<bool, MountError> {
    let inner = self.0.lock().unwrap();
    Ok(inner.paths.contains(path) || inner.mounts.iter().any(|m| m.path == path))
  }

  async fn make_dir(&self, path: &Path) -> Result<(), MountError> {
    let mut inner = self.0.lock().unwrap();
    inner.log.push(format!("make_dir {}", path.display()));
    inner.paths.insert(path.to_path_buf());
    Ok(())
  }

  async fn make_file(&self, path: &Path) -> Result<(), MountError> {
    let mut inner = self.0.lock().unwrap();
    inner.log.push(format!("make_file {}", path.display()));
    inner.paths.insert(path.to_path_buf());
    Ok(())
  }

  async fn remove_path(&self, path: &Path) -> Result<(), MountError> {
    let mut inner = self.0.lock().unwrap();
    inner.log.push(format!("remove_path {}", path.display()));
    inner.paths.remove(path);
    Ok(())
  }

  async fn rescan_scsi(&self) {
    self.0.lock().unwrap().log.push("rescan_scsi".to_string());
  }

  async fn cleanup_scsi(&self, slot: i64) {
    self
      .0
      .lock()
      .unwrap()
      .log
      .push(format!("cleanup_scsi {slot}"));
  }

  async fn statistics(&self, path: &Path) -> Result<VolumeStatistics, MountError> {
    let mut inner = self.0.lock().unwrap();
    inner.log.push(format!("statistics {}", path.display()));
    Ok(inner.statistics)
  }

  async fn is_block_device(&self, path: &Path) -> Result<bool, MountError> {
    Ok(self.0.lock().unwrap().block_devices.contains(path))
  }
}

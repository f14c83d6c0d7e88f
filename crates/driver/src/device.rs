//! Discovery of the local block device backing an attached volume.
//!
//! CloudStack reports the SCSI slot of an attachment; on the guest the
//! device shows up under `/dev/disk/by-path`. The device can take a
//! while to appear after `attachVolume` completes, so discovery retries
//! with exponential backoff, rescanning the SCSI bus between attempts.

use std::path::PathBuf;
use std::time::Duration;

use cloudstack_mount::{MountError, Mounter};
use thiserror::Error;
use tracing::{debug, warn};

const DISK_BY_PATH_DIR: &str = "/dev/disk/by-path";

#[derive(Debug, Error)]
pub enum DeviceError {
  #[error("device for slot {0} did not appear in time")]
  Timeout(i64),

  #[error(transparent)]
  Mount(#[from] MountError),
}

/// Retry schedule for device discovery.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
  pub initial: Duration,
  pub factor: f64,
  pub steps: u32,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    BackoffPolicy {
      initial: Duration::from_secs(1),
      factor: 1.1,
      steps: 15,
    }
  }
}

impl BackoffPolicy {
  /// The full delay schedule, one entry per attempt.
  pub fn delays(&self) -> Vec<Duration> {
    let mut delays = Vec::with_capacity(self.steps as usize);
    let mut current = self.initial.as_secs_f64();
    for _ in 0..self.steps {
      delays.push(Duration::from_secs_f64(current));
      current *= self.factor;
    }
    delays
  }
}

/// Translates the slot CloudStack reports into the slot the guest
/// actually sees.
///
/// On VMware, CloudStack skips slot 3 (it assumes the CD-ROM lives
/// there) and slot 7 is reserved for the virtual SCSI controller, so
/// reported slots 4 through 7 are off by one.
pub fn correct_device_slot(slot: i64, hypervisor: &str) -> i64 {
  if hypervisor.eq_ignore_ascii_case("vmware") && slot > 3 && slot <= 7 {
    debug!(slot, corrected = slot - 1, "correcting VMware SCSI slot");
    slot - 1
  } else {
    slot
  }
}

/// by-path link for a SCSI slot on the first controller.
pub fn device_path(slot: i64) -> PathBuf {
  PathBuf::from(format!(
    "{DISK_BY_PATH_DIR}/pci-0000:00:10.0-scsi-0:0:{slot}:0"
  ))
}

/// Waits for the device in `slot` (as reported by CloudStack) to
/// appear, returning its by-path link.
pub async fn wait_for_device(
  mounter: &dyn Mounter,
  slot: i64,
  hypervisor: &str,
  policy: &BackoffPolicy,
) -> Result<PathBuf, DeviceError> {
  let slot = correct_device_slot(slot, hypervisor);
  let path = device_path(slot);
  debug!(path = %path.display(), "waiting for device");

  let delays = policy.delays();
  for (attempt, delay) in delays.iter().enumerate() {
    if mounter.path_exists(&path).await? {
      debug!(path = %path.display(), "device found");
      return Ok(path);
    }
    mounter.rescan_scsi().await;
    // no point sleeping once the last attempt has failed
    if attempt + 1 < delays.len() {
      tokio::time::sleep(*delay).await;
    }
  }

  warn!(slot, "device discovery timed out");
  Err(DeviceError::Timeout(slot))
}

#[cfg(test)]
mod tests {
  use super::*;
  use cloudstack_mount::fake::FakeMounter;

  fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
      initial: Duration::from_millis(1),
      factor: 1.1,
      steps: 3,
    }
  }

  #[test]
  fn vmware_slots_above_cdrom_shift_down() {
    assert_eq!(correct_device_slot(5, "VMware"), 4);
    assert_eq!(correct_device_slot(4, "vmware"), 3);
    assert_eq!(correct_device_slot(7, "VMware"), 6);
    // slot 3 and below, and slot 8 upwards, are untouched
    assert_eq!(correct_device_slot(3, "VMware"), 3);
    assert_eq!(correct_device_slot(8, "VMware"), 8);
    // other hypervisors never shift
    assert_eq!(correct_device_slot(5, "KVM"), 5);
  }

  #[test]
  fn device_path_names_the_slot() {
    assert_eq!(
      device_path(4),
      PathBuf::from("/dev/disk/by-path/pci-0000:00:10.0-scsi-0:0:4:0")
    );
  }

  #[test]
  fn default_schedule_grows_slowly() {
    let delays = BackoffPolicy::default().delays();
    assert_eq!(delays.len(), 15);
    assert_eq!(delays[0], Duration::from_secs(1));
    for pair in delays.windows(2) {
      assert!(pair[1] > pair[0]);
    }
    let total: Duration = delays.iter().sum();
    assert!(total < Duration::from_secs(60));
  }

  #[tokio::test]
  async fn finds_device_already_present() {
    let mounter = FakeMounter::new();
    mounter.add_path(device_path(2));
    let path = wait_for_device(&mounter, 2, "KVM", &fast_policy())
      .await
      .unwrap();
    assert_eq!(path, device_path(2));
    // no rescan was needed
    assert!(mounter.log().is_empty());
  }

  #[tokio::test]
  async fn applies_slot_correction_before_lookup() {
    let mounter = FakeMounter::new();
    mounter.add_path(device_path(4));
    let path = wait_for_device(&mounter, 5, "VMware", &fast_policy())
      .await
      .unwrap();
    assert_eq!(path, device_path(4));
  }

  #[tokio::test]
  async fn last_attempt_fails_without_a_trailing_delay() {
    let mounter = FakeMounter::new();
    let policy = BackoffPolicy {
      initial: Duration::from_millis(250),
      factor: 1.1,
      steps: 1,
    };
    let start = std::time::Instant::now();
    let err = wait_for_device(&mounter, 1, "KVM", &policy)
      .await
      .unwrap_err();
    assert!(matches!(err, DeviceError::Timeout(1)));
    // a single attempt never sleeps at all
    assert!(start.elapsed() < Duration::from_millis(200));
  }

  #[tokio::test]
  async fn rescans_each_attempt_then_times_out() {
    let mounter = FakeMounter::new();
    let err = wait_for_device(&mounter, 1, "KVM", &fast_policy())
      .await
      .unwrap_err();
    assert!(matches!(err, DeviceError::Timeout(1)));
    let rescans = mounter.log().iter().filter(|l| *l == "rescan_scsi").count();
    assert_eq!(rescans, 3);
  }
}

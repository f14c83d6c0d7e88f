//! [`Mounter`] implementation shelling out to the standard Linux
//! tooling (`mount`, `umount`, `mkfs.*`, `blkid`, `blockdev`,
//! `rescan-scsi-bus.sh`).

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{MountEntry, MountError, Mounter, VolumeStatistics};

const MOUNT_TABLE: &str = "/proc/mounts";

#[derive(Debug, Default)]
pub struct LinuxMounter;

impl LinuxMounter {
  pub fn new() -> Self {
    LinuxMounter
  }

  async fn run(&self, program: &str, args: &[&OsStr]) -> Result<String, MountError> {
    debug!(program, ?args, "running command");
    let output = Command::new(program).args(args).output().await?;
    check_output(program, output)
  }

  async fn read_mounts(&self) -> Result<Vec<MountEntry>, MountError> {
    let raw = tokio::fs::read_to_string(MOUNT_TABLE).await?;
    Ok(parse_mounts(&raw))
  }

  /// The filesystem on a device, if any, via `blkid`. An exit status
  /// of 2 means the probe found nothing.
  async fn detect_fs(&self, device: &Path) -> Result<Option<String>, MountError> {
    let output = Command::new("blkid")
      .args(["-p", "-s", "TYPE", "-o", "value"])
      .arg(device)
      .output()
      .await?;
    if output.status.code() == Some(2) {
      return Ok(None);
    }
    let value = check_output("blkid", output)?;
    let fs = value.trim();
    if fs.is_empty() {
      Ok(None)
    } else {
      Ok(Some(fs.to_string()))
    }
  }

  async fn format(&self, device: &Path, fs_type: &str) -> Result<(), MountError> {
    let mkfs = format!("mkfs.{fs_type}");
    let mut args: Vec<&OsStr> = Vec::new();
    // ext* refuses to clobber without -F; xfs uses -f
    if fs_type.starts_with("ext") {
      args.push(OsStr::new("-F"));
      args.push(OsStr::new("-m0"));
    } else if fs_type == "xfs" {
      args.push(OsStr::new("-f"));
    }
    args.push(device.as_os_str());
    self.run(&mkfs, &args).await?;
    Ok(())
  }
}

#[async_trait]
impl Mounter for LinuxMounter {
  async fn format_and_mount(
    &self,
    source: &Path,
    target: &Path,
    fs_type: &str,
    options: &[String],
  ) -> Result<(), MountError> {
    if self.detect_fs(source).await?.is_none() {
      debug!(device = %source.display(), fs_type, "no filesystem on device, formatting");
      self.format(source, fs_type).await?;
    }
    self.mount(source, target, Some(fs_type), options).await
  }

  async fn mount(
    &self,
    source: &Path,
    target: &Path,
    fs_type: Option<&str>,
    options: &[String],
  ) -> Result<(), MountError> {
    let mut args: Vec<&OsStr> = Vec::new();
    if let Some(fs) = fs_type.filter(|fs| !fs.is_empty()) {
      args.push(OsStr::new("-t"));
      args.push(OsStr::new(fs));
    }
    let joined = options.join(",");
    if !joined.is_empty() {
      args.push(OsStr::new("-o"));
      args.push(OsStr::new(&joined));
    }
    args.push(source.as_os_str());
    args.push(target.as_os_str());
    self.run("mount", &args).await?;
    Ok(())
  }

  async fn unmount(&self, target: &Path) -> Result<(), MountError> {
    self.run("umount", &[target.as_os_str()]).await?;
    Ok(())
  }

  async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
    let resolved = canonical_or_original(path);
    Ok(self.read_mounts().await?.iter().any(|m| m.path == resolved))
  }

  async fn device_ref_count(
    &self,
    mount_path: &Path,
  ) -> Result<Option<(String, usize)>, MountError> {
    let resolved = canonical_or_original(mount_path);
    let mounts = self.read_mounts().await?;
    let device = match mounts.iter().find(|m| m.path == resolved) {
      Some(entry) => entry.device.clone(),
      None => return Ok(None),
    };
    let refs = mounts.iter().filter(|m| m.device == device).count();
    Ok(Some((device, refs)))
  }

  async fn path_exists(&self, path: &Path) -> Result<bool, MountError> {
    match tokio::fs::metadata(path).await {
      Ok(_) => Ok(true),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(err) => Err(err.into()),
    }
  }

  async fn make_dir(&self, path: &Path) -> Result<(), MountError> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
  }

  async fn make_file(&self, path: &Path) -> Result<(), MountError> {
    let file = tokio::fs::OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(false)
      .open(path)
      .await?;
    drop(file);
    Ok(())
  }

  async fn remove_path(&self, path: &Path) -> Result<(), MountError> {
    // publish targets are directories for mount volumes and plain
    // files for block volumes
    let result = match tokio::fs::metadata(path).await {
      Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(path).await,
      Ok(_) => tokio::fs::remove_file(path).await,
      Err(err) => Err(err),
    };
    match result {
      Ok(()) => Ok(()),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(err) => Err(err.into()),
    }
  }

  async fn rescan_scsi(&self) {
    debug!("rescanning SCSI hosts");
    if let Err(err) = self.run("rescan-scsi-bus.sh", &[]).await {
      warn!(%err, "SCSI rescan failed");
    }
  }

  async fn cleanup_scsi(&self, slot: i64) {
    let control = format!("/sys/class/scsi_device/0:0:{slot}:0/device/delete");
    debug!(path = %control, "removing SCSI device");
    if let Err(err) = tokio::fs::write(&control, "1\n").await {
      warn!(path = %control, %err, "cannot remove SCSI device");
    }
  }

  async fn statistics(&self, path: &Path) -> Result<VolumeStatistics, MountError> {
    if self.is_block_device(path).await? {
      let size = self.run("blockdev", &[OsStr::new("--getsize64"), path.as_os_str()]).await?;
      let total_bytes = size
        .trim()
        .parse::<i64>()
        .map_err(|_| MountError::Parse(format!("blockdev output {size:?}")))?;
      return Ok(VolumeStatistics {
        total_bytes,
        ..Default::default()
      });
    }
    statfs(path).await
  }

  async fn is_block_device(&self, path: &Path) -> Result<bool, MountError> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.file_type().is_block_device())
  }
}

fn check_output(program: &str, output: Output) -> Result<String, MountError> {
  if output.status.success() {
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
  } else {
    let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if message.is_empty() {
      message = String::from_utf8_lossy(&output.stdout).trim().to_string();
    }
    if message.is_empty() {
      message = output.status.to_string();
    }
    Err(MountError::CommandFailed {
      command: program.to_string(),
      message,
    })
  }
}

fn canonical_or_original(path: &Path) -> PathBuf {
  path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

async fn statfs(path: &Path) -> Result<VolumeStatistics, MountError> {
  let c_path = CString::new(path.as_os_str().as_bytes())
    .map_err(|_| MountError::Parse(format!("path {}", path.display())))?;
  tokio::task::spawn_blocking(move || {
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
      return Err(MountError::Io(std::io::Error::last_os_error()));
    }
    let block_size = stat.f_bsize as i64;
    Ok(VolumeStatistics {
      available_bytes: stat.f_bavail as i64 * block_size,
      total_bytes: stat.f_blocks as i64 * block_size,
      used_bytes: (stat.f_blocks as i64 - stat.f_bfree as i64) * block_size,
      available_inodes: stat.f_ffree as i64,
      total_inodes: stat.f_files as i64,
      used_inodes: stat.f_files as i64 - stat.f_ffree as i64,
    })
  })
  .await
  .map_err(|err| MountError::Io(std::io::Error::other(err)))?
}

/// Parses `/proc/mounts` content. Paths with special characters are
/// octal-escaped by the kernel.
fn parse_mounts(raw: &str) -> Vec<MountEntry> {
  raw
    .lines()
    .filter_map(|line| {
      let mut fields = line.split_whitespace();
      let device = fields.next()?;
      let path = fields.next()?;
      let fs_type = fields.next()?;
      Some(MountEntry {
        device: unescape_mount_path(device),
        path: PathBuf::from(unescape_mount_path(path)),
        fs_type: fs_type.to_string(),
      })
    })
    .collect()
}

fn unescape_mount_path(field: &str) -> String {
  let bytes = field.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    // escapes are \ooo with exactly three octal digits; multi-byte
    // UTF-8 arrives as one escape per byte
    if bytes[i] == b'\\' && i + 3 < bytes.len() {
      let digits = &bytes[i + 1..i + 4];
      if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
        let code = digits
          .iter()
          .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
        if code <= 0xFF {
          out.push(code as u8);
          i += 4;
          continue;
        }
      }
    }
    out.push(bytes[i]);
    i += 1;
  }
  String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb /var/lib/kubelet/staging ext4 rw,relatime 0 0
/dev/sdb /var/lib/kubelet/pods/pod-1/mount ext4 rw,relatime 0 0
tmpfs /run tmpfs rw,nosuid 0 0
/dev/sdc /mnt/with\\040space ext4 rw 0 0
";

  #[test]
  fn parses_mount_table() {
    let mounts = parse_mounts(SAMPLE);
    assert_eq!(mounts.len(), 5);
    assert_eq!(mounts[0].device, "/dev/sda1");
    assert_eq!(mounts[0].path, PathBuf::from("/"));
    assert_eq!(mounts[3].fs_type, "tmpfs");
  }

  #[test]
  fn unescapes_octal_sequences() {
    let mounts = parse_mounts(SAMPLE);
    assert_eq!(mounts[4].path, PathBuf::from("/mnt/with space"));
    assert_eq!(unescape_mount_path("a\\011b"), "a\tb");
    assert_eq!(unescape_mount_path("plain"), "plain");
  }

  #[test]
  fn unescapes_multibyte_utf8_paths() {
    // é is the two-byte sequence 0xC3 0xA9, one escape per byte
    assert_eq!(unescape_mount_path("/mnt/caf\\303\\251"), "/mnt/café");
    // out-of-range and truncated escapes stay literal
    assert_eq!(unescape_mount_path("a\\777b"), "a\\777b");
    assert_eq!(unescape_mount_path("tail\\04"), "tail\\04");
  }

  #[test]
  fn ref_counting_over_parsed_table() {
    let mounts = parse_mounts(SAMPLE);
    let refs = mounts.iter().filter(|m| m.device == "/dev/sdb").count();
    assert_eq!(refs, 2);
  }

  #[tokio::test]
  async fn path_exists_distinguishes_missing() {
    let mounter = LinuxMounter::new();
    let dir = tempfile::tempdir().unwrap();
    assert!(mounter.path_exists(dir.path()).await.unwrap());
    assert!(!mounter
      .path_exists(&dir.path().join("missing"))
      .await
      .unwrap());
  }

  #[tokio::test]
  async fn make_file_is_idempotent() {
    let mounter = LinuxMounter::new();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("device");
    mounter.make_file(&file).await.unwrap();
    mounter.make_file(&file).await.unwrap();
    assert!(file.exists());
    mounter.remove_path(&file).await.unwrap();
    mounter.remove_path(&file).await.unwrap();
    assert!(!file.exists());
  }

  #[tokio::test]
  async fn statistics_on_a_directory() {
    let mounter = LinuxMounter::new();
    let dir = tempfile::tempdir().unwrap();
    let stats = mounter.statistics(dir.path()).await.unwrap();
    assert!(stats.total_bytes > 0);
    assert!(stats.total_bytes >= stats.used_bytes);
  }
}

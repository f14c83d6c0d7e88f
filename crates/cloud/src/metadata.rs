//! Node identity from local metadata.
//!
//! On a CloudStack guest the VM ID and project ID can be discovered
//! without an API round trip: from the `NODE_ID` environment variable,
//! or from the cloud-init instance data left at
//! `/run/cloud-init/instance-data.json`.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

const CLOUD_INIT_INSTANCE_FILE: &str = "/run/cloud-init/instance-data.json";
const CLOUDSTACK_CLOUD_NAME: &str = "cloudstack";

#[derive(Debug, Deserialize)]
struct InstanceData {
  v1: V1Data,
  #[serde(default)]
  ds: DsData,
}

#[derive(Debug, Deserialize)]
struct V1Data {
  cloud_name: String,
  #[serde(default)]
  instance_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct DsData {
  #[serde(default)]
  meta_data: MetaData,
}

#[derive(Debug, Default, Deserialize)]
struct MetaData {
  #[serde(default, rename = "project-uuid")]
  project_id: String,
}

/// The VM ID of the local instance, from the `NODE_ID` environment
/// variable or from cloud-init instance data.
pub fn instance_id() -> Option<String> {
  if let Ok(id) = std::env::var("NODE_ID") {
    if !id.is_empty() {
      debug!(node_id = %id, "VM ID found in NODE_ID environment variable");
      return Some(id);
    }
  }
  instance_id_from(Path::new(CLOUD_INIT_INSTANCE_FILE))
}

/// The CloudStack project the local instance belongs to, if cloud-init
/// recorded one.
pub fn project_id() -> Option<String> {
  project_id_from(Path::new(CLOUD_INIT_INSTANCE_FILE))
}

fn instance_id_from(path: &Path) -> Option<String> {
  let data = read_instance_data(path)?;
  if data.v1.instance_id.is_empty() {
    warn!("cloud-init instance data has no instance ID");
    return None;
  }
  debug!(instance_id = %data.v1.instance_id, "VM ID found in cloud-init instance data");
  Some(data.v1.instance_id)
}

fn project_id_from(path: &Path) -> Option<String> {
  let data = read_instance_data(path)?;
  if data.ds.meta_data.project_id.is_empty() {
    return None;
  }
  Some(data.ds.meta_data.project_id)
}

fn read_instance_data(path: &Path) -> Option<InstanceData> {
  let raw = match std::fs::read_to_string(path) {
    Ok(raw) => raw,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
      debug!(path = %path.display(), "no cloud-init instance data");
      return None;
    }
    Err(err) => {
      warn!(path = %path.display(), %err, "cannot read cloud-init instance data");
      return None;
    }
  };

  let data: InstanceData = match serde_json::from_str(&raw) {
    Ok(data) => data,
    Err(err) => {
      warn!(path = %path.display(), %err, "cannot parse cloud-init instance data");
      return None;
    }
  };

  if !data.v1.cloud_name.eq_ignore_ascii_case(CLOUDSTACK_CLOUD_NAME) {
    warn!(cloud_name = %data.v1.cloud_name, "cloud-init data is not from a CloudStack cloud");
    return None;
  }

  Some(data)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_instance_data(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
  }

  #[test]
  fn reads_instance_and_project_id() {
    let file = write_instance_data(
      r#"{
        "v1": {"cloud_name": "CloudStack", "instance_id": "vm-1"},
        "ds": {"meta_data": {"project-uuid": "proj-9"}}
      }"#,
    );
    assert_eq!(instance_id_from(file.path()).as_deref(), Some("vm-1"));
    assert_eq!(project_id_from(file.path()).as_deref(), Some("proj-9"));
  }

  #[test]
  fn rejects_other_clouds() {
    let file = write_instance_data(
      r#"{"v1": {"cloud_name": "aws", "instance_id": "i-123"}}"#,
    );
    assert_eq!(instance_id_from(file.path()), None);
  }

  #[test]
  fn missing_file_yields_none() {
    assert_eq!(instance_id_from(Path::new("/nonexistent/instance-data.json")), None);
  }

  #[test]
  fn empty_ids_yield_none() {
    let file = write_instance_data(r#"{"v1": {"cloud_name": "cloudstack"}}"#);
    assert_eq!(instance_id_from(file.path()), None);
    assert_eq!(project_id_from(file.path()), None);
  }
}

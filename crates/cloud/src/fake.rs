//! Deterministic in-memory CloudStack for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{CloudConnector, CloudError, VirtualMachine, Volume};

/// In-memory [`CloudConnector`] keeping volumes and VMs in maps and
/// recording every call so tests can assert on API traffic.
#[derive(Clone, Default)]
pub struct FakeCloud(Arc<Mutex<Inner>>);

#[derive(Default)]
struct Inner {
  volumes: HashMap<String, Volume>,
  vms: HashMap<String, VirtualMachine>,
  vm_names: HashMap<String, String>,
  zones: Vec<String>,
  next_volume: u64,
  next_device: i64,
  calls: Vec<String>,
}

impl FakeCloud {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_zone(&self, zone_id: &str) {
    self.0.lock().unwrap().zones.push(zone_id.to_string());
  }

  pub fn add_vm(&self, vm_id: &str, name: &str, zone_id: &str) {
    let mut inner = self.0.lock().unwrap();
    inner.vms.insert(
      vm_id.to_string(),
      VirtualMachine {
        id: vm_id.to_string(),
        zone_id: zone_id.to_string(),
      },
    );
    inner.vm_names.insert(name.to_string(), vm_id.to_string());
  }

  pub fn add_volume(&self, volume: Volume) {
    self.0.lock().unwrap().volumes.insert(volume.id.clone(), volume);
  }

  /// The device slot the next attachment gets.
  pub fn set_next_device(&self, slot: i64) {
    self.0.lock().unwrap().next_device = slot;
  }

  pub fn volume(&self, volume_id: &str) -> Option<Volume> {
    self.0.lock().unwrap().volumes.get(volume_id).cloned()
  }

  pub fn calls(&self) -> Vec<String> {
    self.0.lock().unwrap().calls.clone()
  }

  pub fn reset_calls(&self) {
    self.0.lock().unwrap().calls.clear();
  }
}

#[async_trait]
impl CloudConnector for FakeCloud {
  async fn resolve_node(&self, node_name: &str) -> Result<VirtualMachine, CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner.calls.push(format!("resolve_node {node_name}"));
    let id = inner
      .vm_names
      .get(node_name)
      .cloned()
      .ok_or(CloudError::NotFound)?;
    inner.vms.get(&id).cloned().ok_or(CloudError::NotFound)
  }

  async fn vm_by_id(&self, vm_id: &str) -> Result<VirtualMachine, CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner.calls.push(format!("vm_by_id {vm_id}"));
    inner.vms.get(vm_id).cloned().ok_or(CloudError::NotFound)
  }

  async fn list_zone_ids(&self) -> Result<Vec<String>, CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner.calls.push("list_zone_ids".to_string());
    Ok(inner.zones.clone())
  }

  async fn volume_by_id(&self, volume_id: &str) -> Result<Volume, CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner.calls.push(format!("volume_by_id {volume_id}"));
    inner
      .volumes
      .get(volume_id)
      .cloned()
      .ok_or(CloudError::NotFound)
  }

  async fn volume_by_name(&self, name: &str) -> Result<Volume, CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner.calls.push(format!("volume_by_name {name}"));
    let matches: Vec<_> = inner
      .volumes
      .values()
      .filter(|v| v.name == name)
      .cloned()
      .collect();
    match matches.len() {
      0 => Err(CloudError::NotFound),
      1 => Ok(matches.into_iter().next().unwrap()),
      _ => Err(CloudError::TooManyResults),
    }
  }

  async fn create_volume(
    &self,
    disk_offering_id: &str,
    zone_id: &str,
    name: &str,
    size_gb: i64,
  ) -> Result<String, CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner
      .calls
      .push(format!("create_volume {disk_offering_id} {zone_id} {name} {size_gb}"));
    inner.next_volume += 1;
    let id = format!("vol-{}", inner.next_volume);
    inner.volumes.insert(
      id.clone(),
      Volume {
        id: id.clone(),
        name: name.to_string(),
        size: size_gb << 30,
        disk_offering_id: disk_offering_id.to_string(),
        zone_id: zone_id.to_string(),
        virtual_machine_id: None,
        device_id: None,
        hypervisor: "KVM".to_string(),
      },
    );
    Ok(id)
  }

  async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner.calls.push(format!("delete_volume {volume_id}"));
    inner
      .volumes
      .remove(volume_id)
      .map(|_| ())
      .ok_or(CloudError::NotFound)
  }

  async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<i64, CloudError> {
    let mut guard = self.0.lock().unwrap();
    let inner = &mut *guard;
    inner.calls.push(format!("attach_volume {volume_id} {vm_id}"));
    let slot = inner.next_device;
    let volume = inner.volumes.get_mut(volume_id).ok_or(CloudError::NotFound)?;
    match volume.virtual_machine_id.as_deref() {
      Some(attached) if attached != vm_id => Err(CloudError::Api {
        code: 431,
        message: format!("volume {volume_id} is attached to another VM"),
      }),
      Some(_) => Ok(volume.device_id.unwrap_or(slot)),
      None => {
        volume.virtual_machine_id = Some(vm_id.to_string());
        volume.device_id = Some(slot);
        inner.next_device += 1;
        Ok(slot)
      }
    }
  }

  async fn detach_volume(&self, volume_id: &str) -> Result<(), CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner.calls.push(format!("detach_volume {volume_id}"));
    let volume = inner.volumes.get_mut(volume_id).ok_or(CloudError::NotFound)?;
    volume.virtual_machine_id = None;
    volume.device_id = None;
    Ok(())
  }

  async fn expand_volume(&self, volume_id: &str, new_size_gb: i64) -> Result<(), CloudError> {
    let mut inner = self.0.lock().unwrap();
    inner
      .calls
      .push(format!("expand_volume {volume_id} {new_size_gb}"));
    let volume = inner.volumes.get_mut(volume_id).ok_or(CloudError::NotFound)?;
    volume.size = new_size_gb << 30;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn create_then_lookup_by_name() {
    let cloud = FakeCloud::new();
    let id = cloud.create_volume("do-1", "z1", "pvc-a", 5).await.unwrap();
    let vol = cloud.volume_by_name("pvc-a").await.unwrap();
    assert_eq!(vol.id, id);
    assert_eq!(vol.size, 5 << 30);
  }

  #[tokio::test]
  async fn attach_is_sticky_per_vm() {
    let cloud = FakeCloud::new();
    cloud.set_next_device(2);
    let id = cloud.create_volume("do-1", "z1", "pvc-a", 1).await.unwrap();
    let slot = cloud.attach_volume(&id, "vm-1").await.unwrap();
    assert_eq!(slot, 2);
    // same VM gets the same slot back
    assert_eq!(cloud.attach_volume(&id, "vm-1").await.unwrap(), 2);
    // another VM is refused
    assert!(matches!(
      cloud.attach_volume(&id, "vm-2").await,
      Err(CloudError::Api { .. })
    ));
  }

  #[tokio::test]
  async fn delete_missing_is_not_found() {
    let cloud = FakeCloud::new();
    assert!(matches!(
      cloud.delete_volume("nope").await,
      Err(CloudError::NotFound)
    ));
  }
}

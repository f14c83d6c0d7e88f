//! Node service behavior against the in-memory cloud and mount table.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cloudstack_cloud::fake::FakeCloud;
use cloudstack_cloud::Volume;
use cloudstack_csi_driver::device::{device_path, BackoffPolicy};
use cloudstack_csi_driver::node::{NodeService, DEFAULT_FS_TYPE, MAX_VOLUMES_PER_NODE};
use cloudstack_csi_driver::ZONE_TOPOLOGY_KEY;
use cloudstack_mount::fake::FakeMounter;
use cloudstack_mount::Mounter;
use csi_proto::v1::node_server::Node;
use csi_proto::v1::{self, volume_capability};
use tonic::{Code, Request};

const GIB: i64 = 1024 * 1024 * 1024;
const STAGING: &str = "/var/lib/kubelet/staging/vol-1";
const TARGET: &str = "/var/lib/kubelet/pods/pod-1/volumes/vol-1/mount";

fn mount_cap(fs_type: &str) -> v1::VolumeCapability {
  v1::VolumeCapability {
    access_mode: Some(volume_capability::AccessMode {
      mode: volume_capability::access_mode::Mode::SingleNodeWriter as i32,
    }),
    access_type: Some(volume_capability::AccessType::Mount(
      volume_capability::MountVolume {
        fs_type: fs_type.to_string(),
        mount_flags: vec![],
      },
    )),
  }
}

fn block_cap() -> v1::VolumeCapability {
  v1::VolumeCapability {
    access_mode: Some(volume_capability::AccessMode {
      mode: volume_capability::access_mode::Mode::SingleNodeWriter as i32,
    }),
    access_type: Some(volume_capability::AccessType::Block(
      volume_capability::BlockVolume {},
    )),
  }
}

fn attached_volume(hypervisor: &str, slot: i64) -> Volume {
  Volume {
    id: "vol-1".into(),
    name: "pvc-a".into(),
    size: 10 * GIB,
    disk_offering_id: "do-1".into(),
    zone_id: "z1".into(),
    virtual_machine_id: Some("vm-1".into()),
    device_id: Some(slot),
    hypervisor: hypervisor.into(),
  }
}

fn fast_backoff() -> BackoffPolicy {
  BackoffPolicy {
    initial: Duration::from_millis(1),
    factor: 1.1,
    steps: 2,
  }
}

fn service_with(volume: Volume) -> (FakeCloud, FakeMounter, NodeService) {
  let cloud = FakeCloud::new();
  cloud.add_vm("vm-1", "node-1", "z1");
  cloud.add_volume(volume);
  let mounter = FakeMounter::new();
  let service = NodeService::with_backoff(
    Arc::new(cloud.clone()),
    Arc::new(mounter.clone()),
    "node-1".to_string(),
    fast_backoff(),
  );
  (cloud, mounter, service)
}

fn stage_request(cap: v1::VolumeCapability) -> v1::NodeStageVolumeRequest {
  v1::NodeStageVolumeRequest {
    volume_id: "vol-1".into(),
    staging_target_path: STAGING.into(),
    volume_capability: Some(cap),
    ..Default::default()
  }
}

fn publish_request(cap: v1::VolumeCapability, readonly: bool) -> v1::NodePublishVolumeRequest {
  v1::NodePublishVolumeRequest {
    volume_id: "vol-1".into(),
    staging_target_path: STAGING.into(),
    target_path: TARGET.into(),
    volume_capability: Some(cap),
    readonly,
    ..Default::default()
  }
}

#[tokio::test]
async fn stage_formats_with_default_filesystem() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  mounter.add_path(device_path(2));

  service
    .node_stage_volume(Request::new(stage_request(mount_cap(""))))
    .await
    .unwrap();

  let mounts = mounter.mounts();
  assert_eq!(mounts.len(), 1);
  assert_eq!(mounts[0].path.to_str(), Some(STAGING));
  assert_eq!(mounts[0].fs_type, DEFAULT_FS_TYPE);
  assert!(mounter
    .log()
    .iter()
    .any(|l| l.starts_with("format_and_mount")));
}

#[tokio::test]
async fn stage_twice_formats_once() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  mounter.add_path(device_path(2));

  let req = stage_request(mount_cap("ext4"));
  service
    .node_stage_volume(Request::new(req.clone()))
    .await
    .unwrap();
  mounter.reset_log();
  service.node_stage_volume(Request::new(req)).await.unwrap();
  assert!(mounter
    .log()
    .iter()
    .all(|l| !l.starts_with("format_and_mount")));
}

#[tokio::test]
async fn stage_block_volume_does_not_mount() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  mounter.add_path(device_path(2));

  service
    .node_stage_volume(Request::new(stage_request(block_cap())))
    .await
    .unwrap();
  assert!(mounter.mounts().is_empty());
}

#[tokio::test]
async fn stage_corrects_vmware_slot() {
  let (_, mounter, service) = service_with(attached_volume("VMware", 5));
  // CloudStack says slot 5, the guest sees slot 4
  mounter.add_path(device_path(4));

  service
    .node_stage_volume(Request::new(stage_request(block_cap())))
    .await
    .unwrap();
}

#[tokio::test]
async fn stage_fails_when_device_never_appears() {
  let (_, _, service) = service_with(attached_volume("KVM", 2));
  let err = service
    .node_stage_volume(Request::new(stage_request(block_cap())))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn stage_unknown_volume_is_not_found() {
  let (_, _, service) = service_with(attached_volume("KVM", 2));
  let mut req = stage_request(mount_cap("ext4"));
  req.volume_id = "vol-9".into();
  let err = service.node_stage_volume(Request::new(req)).await.unwrap_err();
  assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn unstage_with_nothing_mounted_is_ok() {
  let (_, _, service) = service_with(attached_volume("KVM", 2));
  service
    .node_unstage_volume(Request::new(v1::NodeUnstageVolumeRequest {
      volume_id: "vol-1".into(),
      staging_target_path: STAGING.into(),
    }))
    .await
    .unwrap();
}

#[tokio::test]
async fn unstage_unmounts_and_removes_scsi_device() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  mounter.add_path(device_path(2));
  service
    .node_stage_volume(Request::new(stage_request(mount_cap("ext4"))))
    .await
    .unwrap();

  service
    .node_unstage_volume(Request::new(v1::NodeUnstageVolumeRequest {
      volume_id: "vol-1".into(),
      staging_target_path: STAGING.into(),
    }))
    .await
    .unwrap();
  assert!(mounter.mounts().is_empty());
  assert!(mounter.log().iter().any(|l| l == "cleanup_scsi 2"));
}

#[tokio::test]
async fn publish_bind_mounts_the_staging_path() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));

  service
    .node_publish_volume(Request::new(publish_request(mount_cap("ext4"), false)))
    .await
    .unwrap();
  let mounts = mounter.mounts();
  assert_eq!(mounts.len(), 1);
  assert_eq!(mounts[0].device, STAGING);
  assert_eq!(mounts[0].path.to_str(), Some(TARGET));
  assert!(mounter.log().iter().any(|l| l.contains("[bind]")));
}

#[tokio::test]
async fn publish_readonly_adds_ro_option() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  service
    .node_publish_volume(Request::new(publish_request(mount_cap("ext4"), true)))
    .await
    .unwrap();
  assert!(mounter.log().iter().any(|l| l.contains("[bind,ro]")));
}

#[tokio::test]
async fn publish_block_volume_mounts_the_device() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  mounter.add_path(device_path(2));

  service
    .node_publish_volume(Request::new(publish_request(block_cap(), false)))
    .await
    .unwrap();
  let mounts = mounter.mounts();
  assert_eq!(mounts.len(), 1);
  assert_eq!(mounts[0].device, device_path(2).display().to_string());
  assert!(mounter
    .log()
    .iter()
    .any(|l| l.starts_with(&format!("make_file {TARGET}"))));
}

#[tokio::test]
async fn failed_block_publish_removes_the_target_file() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  mounter.add_path(device_path(2));
  mounter.fail_mounts("device or resource busy");

  let err = service
    .node_publish_volume(Request::new(publish_request(block_cap(), false)))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::Internal);
  assert!(mounter
    .log()
    .iter()
    .any(|l| l.starts_with(&format!("remove_path {TARGET}"))));
  assert!(!mounter.path_exists(Path::new(TARGET)).await.unwrap());
}

#[tokio::test]
async fn unpublish_with_nothing_mounted_is_ok() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  service
    .node_unpublish_volume(Request::new(v1::NodeUnpublishVolumeRequest {
      volume_id: "vol-1".into(),
      target_path: TARGET.into(),
    }))
    .await
    .unwrap();
  assert!(mounter
    .log()
    .iter()
    .any(|l| l.starts_with("remove_path")));
}

#[tokio::test]
async fn unpublish_unmounts_target() {
  let (_, mounter, service) = service_with(attached_volume("KVM", 2));
  service
    .node_publish_volume(Request::new(publish_request(mount_cap("ext4"), false)))
    .await
    .unwrap();

  service
    .node_unpublish_volume(Request::new(v1::NodeUnpublishVolumeRequest {
      volume_id: "vol-1".into(),
      target_path: TARGET.into(),
    }))
    .await
    .unwrap();
  assert!(mounter.mounts().is_empty());
}

#[tokio::test]
async fn get_info_reports_vm_topology_and_limit() {
  let (_, _, service) = service_with(attached_volume("KVM", 2));
  let info = service
    .node_get_info(Request::new(v1::NodeGetInfoRequest {}))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(info.node_id, "vm-1");
  assert_eq!(info.max_volumes_per_node, MAX_VOLUMES_PER_NODE);
  let topology = info.accessible_topology.unwrap();
  assert_eq!(topology.segments[ZONE_TOPOLOGY_KEY], "z1");
}

#[tokio::test]
async fn get_info_rejects_a_vm_without_an_id() {
  let cloud = FakeCloud::new();
  cloud.add_vm("", "node-1", "z1");
  let service = NodeService::with_backoff(
    Arc::new(cloud),
    Arc::new(FakeMounter::new()),
    "node-1".to_string(),
    fast_backoff(),
  );

  let err = service
    .node_get_info(Request::new(v1::NodeGetInfoRequest {}))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn get_capabilities_advertises_stage_unstage() {
  let (_, _, service) = service_with(attached_volume("KVM", 2));
  let caps = service
    .node_get_capabilities(Request::new(v1::NodeGetCapabilitiesRequest {}))
    .await
    .unwrap()
    .into_inner()
    .capabilities;
  assert_eq!(caps.len(), 1);
}

//! CSI Node service: staging and publishing volumes on the host.

use std::path::Path;
use std::sync::Arc;

use cloudstack_cloud::{CloudConnector, CloudError, Volume};
use cloudstack_mount::Mounter;
use csi_proto::v1::node_server::Node;
use csi_proto::v1::{self, node_service_capability, volume_capability};
use csi_proto::StripSecrets;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use crate::controller::is_valid_volume_capabilities;
use crate::device::{self, BackoffPolicy};
use crate::topology::Topology;

/// Filesystem used when the volume capability does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// CloudStack exposes a limited number of device slots per VM.
pub const MAX_VOLUMES_PER_NODE: i64 = 10;

pub struct NodeService {
  cloud: Arc<dyn CloudConnector>,
  mounter: Arc<dyn Mounter>,
  node_name: String,
  backoff: BackoffPolicy,
}

impl NodeService {
  pub fn new(cloud: Arc<dyn CloudConnector>, mounter: Arc<dyn Mounter>, node_name: String) -> Self {
    Self::with_backoff(cloud, mounter, node_name, BackoffPolicy::default())
  }

  pub fn with_backoff(
    cloud: Arc<dyn CloudConnector>,
    mounter: Arc<dyn Mounter>,
    node_name: String,
    backoff: BackoffPolicy,
  ) -> Self {
    NodeService {
      cloud,
      mounter,
      node_name,
      backoff,
    }
  }

  async fn lookup_volume(&self, volume_id: &str) -> Result<Volume, Status> {
    match self.cloud.volume_by_id(volume_id).await {
      Err(CloudError::NotFound) => Err(Status::not_found(format!(
        "volume {volume_id} not found"
      ))),
      Err(err) => Err(Status::internal(format!("CloudStack error: {err}"))),
      Ok(vol) => Ok(vol),
    }
  }

  async fn attached_device(&self, vol: &Volume) -> Result<std::path::PathBuf, Status> {
    let slot = vol.device_id.ok_or_else(|| {
      Status::internal(format!("volume {} is not attached to this node", vol.id))
    })?;
    device::wait_for_device(self.mounter.as_ref(), slot, &vol.hypervisor, &self.backoff)
      .await
      .map_err(|err| {
        Status::internal(format!("cannot find device path for volume {}: {err}", vol.id))
      })
  }

  /// Removes the SCSI device left behind by a detached volume. Failures
  /// only get logged: the volume itself is already gone.
  async fn cleanup_device(&self, volume_id: &str) {
    match self.cloud.volume_by_id(volume_id).await {
      Ok(vol) => {
        if let Some(slot) = vol.device_id {
          let slot = device::correct_device_slot(slot, &vol.hypervisor);
          self.mounter.cleanup_scsi(slot).await;
        }
      }
      Err(err) => warn!(volume_id, %err, "skipping SCSI cleanup"),
    }
  }
}

#[tonic::async_trait]
impl Node for NodeService {
  #[instrument(skip_all)]
  async fn node_stage_volume(
    &self,
    request: Request<v1::NodeStageVolumeRequest>,
  ) -> Result<Response<v1::NodeStageVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "stage volume");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID not provided"));
    }
    if req.staging_target_path.is_empty() {
      return Err(Status::invalid_argument("staging target not provided"));
    }
    let capability = req
      .volume_capability
      .as_ref()
      .ok_or_else(|| Status::invalid_argument("volume capability not provided"))?;
    if !is_valid_volume_capabilities(std::slice::from_ref(capability)) {
      return Err(Status::invalid_argument("volume capability not supported"));
    }

    let vol = self.lookup_volume(&req.volume_id).await?;
    let device_path = self.attached_device(&vol).await?;
    debug!(device = %device_path.display(), "device found");

    let mount = match &capability.access_type {
      // raw block volumes are published straight from the device
      Some(volume_capability::AccessType::Block(_)) => {
        return Ok(Response::new(v1::NodeStageVolumeResponse {}))
      }
      Some(volume_capability::AccessType::Mount(mount)) => mount,
      None => {
        return Err(Status::invalid_argument(
          "neither block nor mount volume capability",
        ))
      }
    };

    let target = Path::new(&req.staging_target_path);
    if !map_mount_err(self.mounter.path_exists(target).await)? {
      map_mount_err(self.mounter.make_dir(target).await)?;
    }
    if map_mount_err(self.mounter.is_mount_point(target).await)? {
      // already staged
      return Ok(Response::new(v1::NodeStageVolumeResponse {}));
    }

    let fs_type = if mount.fs_type.is_empty() {
      DEFAULT_FS_TYPE
    } else {
      &mount.fs_type
    };
    let mut options: Vec<String> = Vec::new();
    for flag in &mount.mount_flags {
      if !options.contains(flag) {
        options.push(flag.clone());
      }
    }

    map_mount_err(
      self
        .mounter
        .format_and_mount(&device_path, target, fs_type, &options)
        .await,
    )?;
    debug!(volume_id = %req.volume_id, target = %target.display(), "volume staged");
    Ok(Response::new(v1::NodeStageVolumeResponse {}))
  }

  #[instrument(skip_all)]
  async fn node_unstage_volume(
    &self,
    request: Request<v1::NodeUnstageVolumeRequest>,
  ) -> Result<Response<v1::NodeUnstageVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(?req, "unstage volume");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID not provided"));
    }
    if req.staging_target_path.is_empty() {
      return Err(Status::invalid_argument("staging target not provided"));
    }

    let target = Path::new(&req.staging_target_path);
    match map_mount_err(self.mounter.device_ref_count(target).await)? {
      // nothing staged here, unstage is idempotent
      None => return Ok(Response::new(v1::NodeUnstageVolumeResponse {})),
      Some((dev, refs)) if refs > 1 => {
        warn!(device = %dev, refs, target = %target.display(), "device still referenced elsewhere");
      }
      Some(_) => {}
    }

    map_mount_err(self.mounter.unmount(target).await)?;
    self.cleanup_device(&req.volume_id).await;
    Ok(Response::new(v1::NodeUnstageVolumeResponse {}))
  }

  #[instrument(skip_all)]
  async fn node_publish_volume(
    &self,
    request: Request<v1::NodePublishVolumeRequest>,
  ) -> Result<Response<v1::NodePublishVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "publish volume");

    let capability = req
      .volume_capability
      .as_ref()
      .ok_or_else(|| Status::invalid_argument("volume capability missing in request"))?;
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID missing in request"));
    }
    if req.target_path.is_empty() {
      return Err(Status::invalid_argument("target path missing in request"));
    }
    if req.staging_target_path.is_empty() {
      return Err(Status::invalid_argument(
        "staging target path missing in request",
      ));
    }

    let vol = self.lookup_volume(&req.volume_id).await?;
    let target = Path::new(&req.target_path);

    let mut options = vec!["bind".to_string()];
    if req.readonly {
      options.push("ro".to_string());
    }

    match &capability.access_type {
      Some(volume_capability::AccessType::Mount(mount)) => {
        if !map_mount_err(self.mounter.path_exists(target).await)? {
          map_mount_err(self.mounter.make_dir(target).await)?;
        }
        if map_mount_err(self.mounter.is_mount_point(target).await)? {
          // already published
          return Ok(Response::new(v1::NodePublishVolumeResponse {}));
        }
        let source = Path::new(&req.staging_target_path);
        let fs_type = (!mount.fs_type.is_empty()).then_some(mount.fs_type.as_str());
        map_mount_err(self.mounter.mount(source, target, fs_type, &options).await)?;
      }
      Some(volume_capability::AccessType::Block(_)) => {
        let device_path = self.attached_device(&vol).await?;
        if let Some(parent) = target.parent() {
          if !map_mount_err(self.mounter.path_exists(parent).await)? {
            map_mount_err(self.mounter.make_dir(parent).await)?;
          }
        }
        if map_mount_err(self.mounter.is_mount_point(target).await)? {
          return Ok(Response::new(v1::NodePublishVolumeResponse {}));
        }
        map_mount_err(self.mounter.make_file(target).await)?;
        if let Err(err) = self.mounter.mount(&device_path, target, None, &options).await {
          // do not leave an empty target file with nothing mounted on it
          if let Err(remove_err) = self.mounter.remove_path(target).await {
            warn!(target = %target.display(), %remove_err, "cannot remove publish target");
          }
          return Err(Status::internal(err.to_string()));
        }
      }
      None => {
        return Err(Status::invalid_argument(
          "neither block nor mount volume capability",
        ))
      }
    }

    debug!(volume_id = %req.volume_id, target = %target.display(), "volume published");
    Ok(Response::new(v1::NodePublishVolumeResponse {}))
  }

  #[instrument(skip_all)]
  async fn node_unpublish_volume(
    &self,
    request: Request<v1::NodeUnpublishVolumeRequest>,
  ) -> Result<Response<v1::NodeUnpublishVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(?req, "unpublish volume");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID missing in request"));
    }
    if req.target_path.is_empty() {
      return Err(Status::invalid_argument("target path missing in request"));
    }

    self.lookup_volume(&req.volume_id).await?;

    let target = Path::new(&req.target_path);
    if map_mount_err(self.mounter.is_mount_point(target).await)? {
      map_mount_err(self.mounter.unmount(target).await)?;
    }
    map_mount_err(self.mounter.remove_path(target).await)?;
    self.cleanup_device(&req.volume_id).await;
    Ok(Response::new(v1::NodeUnpublishVolumeResponse {}))
  }

  #[instrument(skip_all)]
  async fn node_get_capabilities(
    &self,
    _request: Request<v1::NodeGetCapabilitiesRequest>,
  ) -> Result<Response<v1::NodeGetCapabilitiesResponse>, Status> {
    Ok(Response::new(v1::NodeGetCapabilitiesResponse {
      capabilities: vec![v1::NodeServiceCapability {
        r#type: Some(node_service_capability::Type::Rpc(
          node_service_capability::Rpc {
            r#type: node_service_capability::rpc::Type::StageUnstageVolume as i32,
          },
        )),
      }],
    }))
  }

  #[instrument(skip_all)]
  async fn node_get_info(
    &self,
    _request: Request<v1::NodeGetInfoRequest>,
  ) -> Result<Response<v1::NodeGetInfoResponse>, Status> {
    if self.node_name.is_empty() {
      return Err(Status::internal("missing node name"));
    }

    let vm = self
      .cloud
      .resolve_node(&self.node_name)
      .await
      .map_err(|err| Status::internal(format!("cannot resolve node: {err}")))?;
    if vm.id.is_empty() {
      return Err(Status::internal("node VM ID not found"));
    }
    if vm.zone_id.is_empty() {
      return Err(Status::internal("node zone ID not found"));
    }

    Ok(Response::new(v1::NodeGetInfoResponse {
      node_id: vm.id,
      max_volumes_per_node: MAX_VOLUMES_PER_NODE,
      accessible_topology: Some(Topology::new(vm.zone_id).to_csi()),
    }))
  }
}

fn map_mount_err<T>(result: Result<T, cloudstack_mount::MountError>) -> Result<T, Status> {
  result.map_err(|err| Status::internal(err.to_string()))
}

//! CSI Controller service: volume lifecycle against the CloudStack API.

use std::sync::Arc;

use cloudstack_cloud::{CloudConnector, CloudError, Volume};
use csi_proto::v1::controller_server::Controller;
use csi_proto::v1::{self, controller_service_capability, volume_capability};
use csi_proto::StripSecrets;
use rand::seq::SliceRandom;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument};

use crate::lock::KeyedMutex;
use crate::topology::Topology;
use crate::{util, DEVICE_ID_CONTEXT_KEY, DISK_OFFERING_PARAMETER};

// A CloudStack volume attaches to a single VM at a time, so
// SINGLE_NODE_WRITER is the only access mode the driver accepts.
const ONLY_ACCESS_MODE: volume_capability::access_mode::Mode =
  volume_capability::access_mode::Mode::SingleNodeWriter;

pub struct ControllerService {
  cloud: Arc<dyn CloudConnector>,
  locks: KeyedMutex,
}

impl ControllerService {
  pub fn new(cloud: Arc<dyn CloudConnector>) -> Self {
    ControllerService {
      cloud,
      locks: KeyedMutex::new(),
    }
  }
}

/// All capabilities must be unset or SINGLE_NODE_WRITER.
pub(crate) fn is_valid_volume_capabilities(caps: &[v1::VolumeCapability]) -> bool {
  caps.iter().all(|cap| match &cap.access_mode {
    Some(mode) => mode.mode == ONLY_ACCESS_MODE as i32,
    None => true,
  })
}

/// Volume size in GB for a create request, rounding the required bytes
/// up to whole gigabytes. Fails when the rounded size would exceed the
/// limit; never shrinks to fit.
pub(crate) fn determine_size(range: Option<&v1::CapacityRange>) -> Result<i64, String> {
  let mut size_gb = 0;
  if let Some(range) = range {
    size_gb = util::round_up_bytes_to_gb(range.required_bytes);
    if size_gb == 0 {
      size_gb = 1;
    }
    if range.limit_bytes > 0 && util::gb_to_bytes(size_gb) > range.limit_bytes {
      return Err(format!(
        "after round-up, volume size {size_gb} GB exceeds the limit of {} bytes",
        range.limit_bytes
      ));
    }
  }
  if size_gb == 0 {
    size_gb = 1;
  }
  Ok(size_gb)
}

/// Whether an existing volume with the requested name can be returned
/// as-is for this create request.
fn check_volume_suitable(
  vol: &Volume,
  disk_offering_id: &str,
  range: Option<&v1::CapacityRange>,
  requirements: Option<&v1::TopologyRequirement>,
) -> Result<(), String> {
  if vol.disk_offering_id != disk_offering_id {
    return Err(format!(
      "disk offering {}; requested disk offering {disk_offering_id}",
      vol.disk_offering_id
    ));
  }

  if let Some(range) = range {
    if range.limit_bytes > 0 && vol.size > range.limit_bytes {
      return Err(format!(
        "disk size {} bytes > requested limit size {} bytes",
        vol.size, range.limit_bytes
      ));
    }
    if range.required_bytes > 0 && vol.size < range.required_bytes {
      return Err(format!(
        "disk size {} bytes < requested required size {} bytes",
        vol.size, range.required_bytes
      ));
    }
  }

  if let Some(requirements) = requirements.filter(|r| !r.requisite.is_empty()) {
    if requirements.requisite.len() > 1 {
      return Err("too many topology requirements".to_string());
    }
    let topology = Topology::from_csi(&requirements.requisite[0])
      .map_err(|_| "cannot parse topology requirements".to_string())?;
    if topology.zone_id != vol.zone_id {
      return Err(format!(
        "volume in zone {}, requested zone is {}",
        vol.zone_id, topology.zone_id
      ));
    }
  }

  Ok(())
}

fn cloud_internal(err: CloudError) -> Status {
  Status::internal(format!("CloudStack error: {err}"))
}

fn rpc_capability(t: controller_service_capability::rpc::Type) -> v1::ControllerServiceCapability {
  v1::ControllerServiceCapability {
    r#type: Some(controller_service_capability::Type::Rpc(
      controller_service_capability::Rpc { r#type: t as i32 },
    )),
  }
}

#[tonic::async_trait]
impl Controller for ControllerService {
  #[instrument(skip_all)]
  async fn create_volume(
    &self,
    request: Request<v1::CreateVolumeRequest>,
  ) -> Result<Response<v1::CreateVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "create volume");

    if req.name.is_empty() {
      return Err(Status::invalid_argument("volume name missing in request"));
    }
    if req.volume_capabilities.is_empty() {
      return Err(Status::invalid_argument(
        "volume capabilities missing in request",
      ));
    }
    if !is_valid_volume_capabilities(&req.volume_capabilities) {
      return Err(Status::invalid_argument(
        "volume capabilities not supported; only SINGLE_NODE_WRITER is supported",
      ));
    }
    let disk_offering_id = req
      .parameters
      .get(DISK_OFFERING_PARAMETER)
      .filter(|v| !v.is_empty())
      .ok_or_else(|| {
        Status::invalid_argument(format!("missing parameter {DISK_OFFERING_PARAMETER}"))
      })?
      .clone();

    // Volume names are the idempotency token: reuse an existing volume
    // when it satisfies the request, refuse when it does not.
    match self.cloud.volume_by_name(&req.name).await {
      Err(CloudError::NotFound) => {}
      Err(err) => return Err(cloud_internal(err)),
      Ok(vol) => {
        check_volume_suitable(
          &vol,
          &disk_offering_id,
          req.capacity_range.as_ref(),
          req.accessibility_requirements.as_ref(),
        )
        .map_err(|message| {
          Status::already_exists(format!(
            "volume {} already exists but does not satisfy request: {message}",
            req.name
          ))
        })?;
        return Ok(Response::new(v1::CreateVolumeResponse {
          volume: Some(v1::Volume {
            volume_id: vol.id,
            capacity_bytes: vol.size,
            accessible_topology: vec![Topology::new(vol.zone_id).to_csi()],
            ..Default::default()
          }),
        }));
      }
    }

    let size_gb = determine_size(req.capacity_range.as_ref()).map_err(Status::invalid_argument)?;

    let zone_id = match req
      .accessibility_requirements
      .as_ref()
      .filter(|r| !r.requisite.is_empty())
    {
      None => {
        let zones = self
          .cloud
          .list_zone_ids()
          .await
          .map_err(cloud_internal)?;
        zones
          .choose(&mut rand::thread_rng())
          .cloned()
          .ok_or_else(|| Status::internal("no zone available"))?
      }
      Some(requirements) => {
        if requirements.requisite.len() > 1 {
          return Err(Status::invalid_argument("too many topology requirements"));
        }
        Topology::from_csi(&requirements.requisite[0])
          .map_err(|_| Status::invalid_argument("cannot parse topology requirements"))?
          .zone_id
      }
    };

    let volume_id = self
      .cloud
      .create_volume(&disk_offering_id, &zone_id, &req.name, size_gb)
      .await
      .map_err(|err| Status::internal(format!("cannot create volume {}: {err}", req.name)))?;

    Ok(Response::new(v1::CreateVolumeResponse {
      volume: Some(v1::Volume {
        volume_id,
        capacity_bytes: util::gb_to_bytes(size_gb),
        accessible_topology: vec![Topology::new(zone_id).to_csi()],
        ..Default::default()
      }),
    }))
  }

  #[instrument(skip_all)]
  async fn delete_volume(
    &self,
    request: Request<v1::DeleteVolumeRequest>,
  ) -> Result<Response<v1::DeleteVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "delete volume");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID missing in request"));
    }
    match self.cloud.delete_volume(&req.volume_id).await {
      // already gone, deletion is idempotent
      Ok(()) | Err(CloudError::NotFound) => Ok(Response::new(v1::DeleteVolumeResponse {})),
      Err(err) => Err(Status::internal(format!(
        "cannot delete volume {}: {err}",
        req.volume_id
      ))),
    }
  }

  #[instrument(skip_all)]
  async fn controller_publish_volume(
    &self,
    request: Request<v1::ControllerPublishVolumeRequest>,
  ) -> Result<Response<v1::ControllerPublishVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "publish volume");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID missing in request"));
    }
    if req.node_id.is_empty() {
      return Err(Status::invalid_argument("node ID missing in request"));
    }

    // One attach at a time per node: CloudStack assigns device slots
    // sequentially and concurrent attaches to one VM race.
    let _guard = self.locks.lock(&req.node_id).await;

    if req.readonly {
      return Err(Status::invalid_argument("readonly not possible"));
    }
    let capability = req
      .volume_capability
      .as_ref()
      .ok_or_else(|| Status::invalid_argument("volume capability missing in request"))?;
    let mode = capability
      .access_mode
      .as_ref()
      .ok_or_else(|| Status::invalid_argument("access mode missing in request"))?;
    if mode.mode != ONLY_ACCESS_MODE as i32 {
      return Err(Status::invalid_argument("access mode not accepted"));
    }

    let vol = match self.cloud.volume_by_id(&req.volume_id).await {
      Err(CloudError::NotFound) => {
        return Err(Status::not_found(format!(
          "volume {} not found",
          req.volume_id
        )))
      }
      Err(err) => return Err(cloud_internal(err)),
      Ok(vol) => vol,
    };

    if let Some(attached_to) = vol.virtual_machine_id.as_deref() {
      if attached_to != req.node_id {
        return Err(Status::already_exists(
          "volume already assigned to another node",
        ));
      }
    }

    match self.cloud.vm_by_id(&req.node_id).await {
      Err(CloudError::NotFound) => {
        return Err(Status::not_found(format!("VM {} not found", req.node_id)))
      }
      Err(err) => return Err(cloud_internal(err)),
      Ok(_) => {}
    }

    let slot = if vol.virtual_machine_id.as_deref() == Some(req.node_id.as_str()) {
      // already attached here, report the existing slot
      vol.device_id.ok_or_else(|| {
        Status::internal(format!(
          "volume {} is attached but has no device ID",
          req.volume_id
        ))
      })?
    } else {
      self
        .cloud
        .attach_volume(&req.volume_id, &req.node_id)
        .await
        .map_err(|err| {
          Status::internal(format!("cannot attach volume {}: {err}", req.volume_id))
        })?
    };

    let publish_context = [(DEVICE_ID_CONTEXT_KEY.to_string(), slot.to_string())]
      .into_iter()
      .collect();
    Ok(Response::new(v1::ControllerPublishVolumeResponse {
      publish_context,
    }))
  }

  #[instrument(skip_all)]
  async fn controller_unpublish_volume(
    &self,
    request: Request<v1::ControllerUnpublishVolumeRequest>,
  ) -> Result<Response<v1::ControllerUnpublishVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "unpublish volume");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID missing in request"));
    }

    let vol = match self.cloud.volume_by_id(&req.volume_id).await {
      // volume gone from CloudStack, nothing left to detach
      Err(CloudError::NotFound) => {
        return Ok(Response::new(v1::ControllerUnpublishVolumeResponse {}))
      }
      Err(err) => return Err(cloud_internal(err)),
      Ok(vol) => vol,
    };

    match vol.virtual_machine_id.as_deref() {
      // already detached
      None => return Ok(Response::new(v1::ControllerUnpublishVolumeResponse {})),
      // attached elsewhere, not ours to detach
      Some(attached_to) if !req.node_id.is_empty() && attached_to != req.node_id => {
        return Ok(Response::new(v1::ControllerUnpublishVolumeResponse {}))
      }
      Some(_) => {}
    }

    if !req.node_id.is_empty() {
      match self.cloud.vm_by_id(&req.node_id).await {
        Err(CloudError::NotFound) => {
          return Err(Status::not_found(format!("VM {} not found", req.node_id)))
        }
        Err(err) => return Err(cloud_internal(err)),
        Ok(_) => {}
      }
    }

    self
      .cloud
      .detach_volume(&req.volume_id)
      .await
      .map_err(|err| Status::internal(format!("cannot detach volume {}: {err}", req.volume_id)))?;

    Ok(Response::new(v1::ControllerUnpublishVolumeResponse {}))
  }

  #[instrument(skip_all)]
  async fn validate_volume_capabilities(
    &self,
    request: Request<v1::ValidateVolumeCapabilitiesRequest>,
  ) -> Result<Response<v1::ValidateVolumeCapabilitiesResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "validate volume capabilities");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID not provided"));
    }
    if req.volume_capabilities.is_empty() {
      return Err(Status::invalid_argument("volume capabilities not provided"));
    }

    match self.cloud.volume_by_id(&req.volume_id).await {
      Err(CloudError::NotFound) => {
        return Err(Status::not_found(format!(
          "volume {} not found",
          req.volume_id
        )))
      }
      Err(err) => return Err(cloud_internal(err)),
      Ok(_) => {}
    }

    let confirmed = if is_valid_volume_capabilities(&req.volume_capabilities) {
      Some(v1::validate_volume_capabilities_response::Confirmed {
        volume_capabilities: req.volume_capabilities,
        ..Default::default()
      })
    } else {
      None
    };

    Ok(Response::new(v1::ValidateVolumeCapabilitiesResponse {
      confirmed,
      message: String::new(),
    }))
  }

  #[instrument(skip_all)]
  async fn controller_get_capabilities(
    &self,
    _request: Request<v1::ControllerGetCapabilitiesRequest>,
  ) -> Result<Response<v1::ControllerGetCapabilitiesResponse>, Status> {
    use controller_service_capability::rpc::Type;
    Ok(Response::new(v1::ControllerGetCapabilitiesResponse {
      capabilities: vec![
        rpc_capability(Type::CreateDeleteVolume),
        rpc_capability(Type::PublishUnpublishVolume),
        rpc_capability(Type::ExpandVolume),
      ],
    }))
  }

  #[instrument(skip_all)]
  async fn controller_expand_volume(
    &self,
    request: Request<v1::ControllerExpandVolumeRequest>,
  ) -> Result<Response<v1::ControllerExpandVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(req = ?req.clone().strip_secrets(), "expand volume");

    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("volume ID missing in request"));
    }
    let range = req
      .capacity_range
      .as_ref()
      .ok_or_else(|| Status::invalid_argument("capacity range missing in request"))?;

    let mut size_gb = util::round_up_bytes_to_gb(range.required_bytes);
    if size_gb == 0 {
      size_gb = 1;
    }
    let new_size = util::gb_to_bytes(size_gb);
    if range.limit_bytes > 0 && new_size > range.limit_bytes {
      return Err(Status::out_of_range(format!(
        "after round-up, volume size {size_gb} GB exceeds the limit of {} bytes",
        range.limit_bytes
      )));
    }

    let vol = match self.cloud.volume_by_id(&req.volume_id).await {
      Err(CloudError::NotFound) => {
        return Err(Status::not_found(format!(
          "volume {} not found",
          req.volume_id
        )))
      }
      Err(err) => return Err(cloud_internal(err)),
      Ok(vol) => vol,
    };

    if vol.size >= new_size {
      // already at least as big, nothing to resize
      return Ok(Response::new(v1::ControllerExpandVolumeResponse {
        capacity_bytes: vol.size,
        node_expansion_required: true,
      }));
    }

    self
      .cloud
      .expand_volume(&req.volume_id, size_gb)
      .await
      .map_err(|err| Status::internal(format!("cannot expand volume {}: {err}", req.volume_id)))?;

    Ok(Response::new(v1::ControllerExpandVolumeResponse {
      capacity_bytes: new_size,
      node_expansion_required: true,
    }))
  }
}

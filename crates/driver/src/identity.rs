//! CSI Identity service.

use csi_proto::v1::identity_server::Identity;
use csi_proto::v1::{
  plugin_capability, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
  GetPluginInfoRequest, GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::DRIVER_NAME;

pub struct IdentityService {
  version: String,
}

impl IdentityService {
  pub fn new(version: impl Into<String>) -> Self {
    IdentityService {
      version: version.into(),
    }
  }
}

#[tonic::async_trait]
impl Identity for IdentityService {
  #[instrument(skip_all)]
  async fn get_plugin_info(
    &self,
    _request: Request<GetPluginInfoRequest>,
  ) -> Result<Response<GetPluginInfoResponse>, Status> {
    Ok(Response::new(GetPluginInfoResponse {
      name: DRIVER_NAME.to_string(),
      vendor_version: self.version.clone(),
      manifest: Default::default(),
    }))
  }

  #[instrument(skip_all)]
  async fn get_plugin_capabilities(
    &self,
    _request: Request<GetPluginCapabilitiesRequest>,
  ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
    let service = |t: plugin_capability::service::Type| PluginCapability {
      r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
        r#type: t as i32,
      })),
    };
    let expansion = PluginCapability {
      r#type: Some(plugin_capability::Type::VolumeExpansion(
        plugin_capability::VolumeExpansion {
          r#type: plugin_capability::volume_expansion::Type::Online as i32,
        },
      )),
    };
    Ok(Response::new(GetPluginCapabilitiesResponse {
      capabilities: vec![
        service(plugin_capability::service::Type::ControllerService),
        service(plugin_capability::service::Type::VolumeAccessibilityConstraints),
        expansion,
      ],
    }))
  }

  #[instrument(skip_all)]
  async fn probe(
    &self,
    _request: Request<ProbeRequest>,
  ) -> Result<Response<ProbeResponse>, Status> {
    Ok(Response::new(ProbeResponse { ready: Some(true) }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn reports_driver_name_and_version() {
    let identity = IdentityService::new("1.2.3");
    let info = identity
      .get_plugin_info(Request::new(GetPluginInfoRequest {}))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(info.name, "csi.cloudstack.apache.org");
    assert_eq!(info.vendor_version, "1.2.3");
  }

  #[tokio::test]
  async fn advertises_controller_topology_and_expansion() {
    let identity = IdentityService::new("test");
    let caps = identity
      .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
      .await
      .unwrap()
      .into_inner()
      .capabilities;
    assert_eq!(caps.len(), 3);
  }

  #[tokio::test]
  async fn probe_is_ready() {
    let identity = IdentityService::new("test");
    let resp = identity
      .probe(Request::new(ProbeRequest {}))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(resp.ready, Some(true));
  }
}

//! Conversion between CloudStack placement and CSI topology segments.

use std::collections::HashMap;

use csi_proto::v1;
use thiserror::Error;

use crate::{HOST_TOPOLOGY_KEY, ZONE_TOPOLOGY_KEY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
  #[error("topology has no segments")]
  NoSegments,

  #[error("topology has no zone segment")]
  NoZone,
}

/// CloudStack placement of a volume or node. The zone is mandatory,
/// the host is only known for host-local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
  pub zone_id: String,
  pub host_id: Option<String>,
}

impl Topology {
  pub fn new(zone_id: impl Into<String>) -> Self {
    Topology {
      zone_id: zone_id.into(),
      host_id: None,
    }
  }

  /// Reads a CSI topology. The zone segment is required.
  pub fn from_csi(t: &v1::Topology) -> Result<Self, TopologyError> {
    if t.segments.is_empty() {
      return Err(TopologyError::NoSegments);
    }
    let zone_id = t
      .segments
      .get(ZONE_TOPOLOGY_KEY)
      .ok_or(TopologyError::NoZone)?
      .clone();
    let host_id = t.segments.get(HOST_TOPOLOGY_KEY).cloned();
    Ok(Topology { zone_id, host_id })
  }

  pub fn to_csi(&self) -> v1::Topology {
    let mut segments = HashMap::new();
    segments.insert(ZONE_TOPOLOGY_KEY.to_string(), self.zone_id.clone());
    if let Some(host) = &self.host_id {
      segments.insert(HOST_TOPOLOGY_KEY.to_string(), host.clone());
    }
    v1::Topology { segments }
  }
}

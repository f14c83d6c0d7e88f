//! CSI plugin for Apache CloudStack block volumes.
//!
//! The plugin exposes the three CSI v1 services over a single gRPC
//! endpoint: Identity, Controller (volume lifecycle against the
//! CloudStack API) and Node (device discovery, formatting and mounts on
//! the host).

pub mod controller;
pub mod device;
pub mod identity;
mod lock;
pub mod node;
pub mod server;
pub mod topology;
pub mod util;

/// CSI driver name, in reverse-domain notation.
pub const DRIVER_NAME: &str = "csi.cloudstack.apache.org";

/// Topology segment keys advertised by the driver.
pub const ZONE_TOPOLOGY_KEY: &str = "topology.csi.cloudstack.apache.org/zone";
pub const HOST_TOPOLOGY_KEY: &str = "topology.csi.cloudstack.apache.org/host";

/// Storage-class parameter naming the CloudStack disk offering.
pub const DISK_OFFERING_PARAMETER: &str = "csi.cloudstack.apache.org/disk-offering-id";

/// Publish-context key carrying the device slot from the controller to
/// the node.
pub const DEVICE_ID_CONTEXT_KEY: &str = "deviceID";

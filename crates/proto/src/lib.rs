//! CSI v1 protocol bindings.
//!
//! The message and service types are generated from `proto/csi.proto` at
//! build time. Field numbers follow the upstream CSI definition, so any
//! container orchestrator speaking CSI v1 can talk to servers built on
//! these types.

pub mod v1 {
  tonic::include_proto!("csi.v1");
}

mod sanitize;

pub use sanitize::StripSecrets;

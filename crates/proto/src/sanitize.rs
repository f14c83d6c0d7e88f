use crate::v1;

const REDACTED: &str = "***";

/// Replaces secret values in a request with a fixed placeholder so the
/// request can be logged.
///
/// Only the values of the `secrets` map are redacted; the keys stay
/// visible since they identify which credentials were supplied.
pub trait StripSecrets {
  fn strip_secrets(self) -> Self;
}

fn redact(secrets: &mut std::collections::HashMap<String, String>) {
  for value in secrets.values_mut() {
    *value = REDACTED.into();
  }
}

macro_rules! strip_secrets_field {
  ($($ty:ty),+ $(,)?) => {
    $(impl StripSecrets for $ty {
      fn strip_secrets(mut self) -> Self {
        redact(&mut self.secrets);
        self
      }
    })+
  };
}

strip_secrets_field!(
  v1::CreateVolumeRequest,
  v1::DeleteVolumeRequest,
  v1::ControllerPublishVolumeRequest,
  v1::ControllerUnpublishVolumeRequest,
  v1::ValidateVolumeCapabilitiesRequest,
  v1::ControllerExpandVolumeRequest,
  v1::NodeStageVolumeRequest,
  v1::NodePublishVolumeRequest,
);

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_secret_values_keeps_keys() {
    let req = v1::CreateVolumeRequest {
      name: "vol".into(),
      secrets: [("api-key".to_string(), "hunter2".to_string())]
        .into_iter()
        .collect(),
      ..Default::default()
    };
    let stripped = req.strip_secrets();
    assert_eq!(stripped.secrets["api-key"], "***");
    assert_eq!(stripped.name, "vol");
  }

  #[test]
  fn empty_secrets_is_noop() {
    let req = v1::DeleteVolumeRequest {
      volume_id: "id".into(),
      ..Default::default()
    };
    assert!(req.strip_secrets().secrets.is_empty());
  }
}

//! Command validation against the registry and capability schemas.
//!
//! All parameter failures are collected into one report so a caller
//! can fix everything in a single round trip.

use alicia_protocol::envelope::FieldError;
use alicia_protocol::{CommandRequest, Device, DeviceStatus, ParamViolation};

use crate::registry::DeviceRegistry;

#[derive(thiserror::Error, Debug)]
pub enum EnqueueError {
    #[error("validation failed: {}", summarize(.0))]
    Validation(Vec<FieldError>),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("device {0} is {1:?}")]
    DeviceUnavailable(String, DeviceStatus),
    #[error("device {device_id} does not support {capability}")]
    CapabilityNotSupported {
        device_id: String,
        capability: String,
    },
}

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{} ({})", f.parameter, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check a command request against the registry. On success, returns the
/// resolved target devices in request order.
pub fn validate_request(
    registry: &DeviceRegistry,
    request: &CommandRequest,
) -> Result<Vec<Device>, EnqueueError> {
    if request.device_ids.is_empty() {
        return Err(EnqueueError::Validation(vec![FieldError {
            parameter: "device_ids".into(),
            reason: "empty".into(),
            allowed: None,
        }]));
    }
    if request.capability.is_empty() {
        return Err(EnqueueError::Validation(vec![FieldError {
            parameter: "capability".into(),
            reason: "empty".into(),
            allowed: None,
        }]));
    }

    let mut devices = Vec::with_capacity(request.device_ids.len());
    for device_id in &request.device_ids {
        let device = registry
            .get(device_id)
            .ok_or_else(|| EnqueueError::UnknownDevice(device_id.clone()))?;

        if matches!(device.status, DeviceStatus::Offline | DeviceStatus::Faulted)
            && !request.allow_offline
        {
            return Err(EnqueueError::DeviceUnavailable(device_id.clone(), device.status));
        }

        let capability = device.capability(&request.capability).ok_or_else(|| {
            EnqueueError::CapabilityNotSupported {
                device_id: device_id.clone(),
                capability: request.capability.clone(),
            }
        })?;

        // Collect every parameter failure for this device's schema.
        let mut fields = Vec::new();
        for (name, schema) in &capability.parameters {
            match request.parameters.get(name) {
                Some(value) => {
                    if let Err(violation) = schema.check(value) {
                        fields.push(field_error(name, &violation));
                    }
                }
                None if schema.required => {
                    fields.push(field_error(name, &ParamViolation::Missing));
                }
                None => {}
            }
        }
        for name in request.parameters.keys() {
            if !capability.parameters.contains_key(name) {
                fields.push(field_error(name, &ParamViolation::Unknown));
            }
        }
        if !fields.is_empty() {
            return Err(EnqueueError::Validation(fields));
        }

        devices.push(device);
    }

    Ok(devices)
}

fn field_error(parameter: &str, violation: &ParamViolation) -> FieldError {
    FieldError {
        parameter: parameter.to_owned(),
        reason: violation.reason().to_owned(),
        allowed: violation.allowed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alicia_protocol::{Capability, ParamSchema};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn registry_with_light() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry
            .register(Device {
                device_id: "light.living_room_1".into(),
                device_type: "light".into(),
                room: None,
                capabilities: BTreeMap::from([
                    ("turn_on".into(), Capability::default()),
                    (
                        "set_brightness".into(),
                        Capability {
                            parameters: BTreeMap::from([(
                                "level".into(),
                                ParamSchema::int(0, 100).required(),
                            )]),
                        },
                    ),
                ]),
                status: alicia_protocol::DeviceStatus::Online,
                last_seen: Utc::now(),
                metadata: BTreeMap::new(),
            })
            .unwrap();
        registry
    }

    fn request(capability: &str, parameters: BTreeMap<String, serde_json::Value>) -> CommandRequest {
        CommandRequest {
            device_ids: vec!["light.living_room_1".into()],
            capability: capability.into(),
            parameters,
            allow_offline: false,
        }
    }

    #[test]
    fn valid_command_passes() {
        let registry = registry_with_light();
        let devices = validate_request(
            &registry,
            &request("set_brightness", BTreeMap::from([("level".into(), json!(80))])),
        )
        .unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn out_of_range_reports_parameter_and_allowed() {
        let registry = registry_with_light();
        let err = validate_request(
            &registry,
            &request("set_brightness", BTreeMap::from([("level".into(), json!(150))])),
        )
        .unwrap_err();

        let EnqueueError::Validation(fields) = err else {
            panic!("expected Validation");
        };
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].parameter, "level");
        assert_eq!(fields[0].reason, "out_of_range");
        assert_eq!(fields[0].allowed.as_deref(), Some("[0,100]"));
    }

    #[test]
    fn all_failures_reported_together() {
        let registry = registry_with_light();
        let err = validate_request(
            &registry,
            &request(
                "set_brightness",
                BTreeMap::from([("bogus".into(), json!(1))]), // missing level + unknown bogus
            ),
        )
        .unwrap_err();

        let EnqueueError::Validation(fields) = err else {
            panic!("expected Validation");
        };
        let reasons: Vec<(&str, &str)> = fields
            .iter()
            .map(|f| (f.parameter.as_str(), f.reason.as_str()))
            .collect();
        assert!(reasons.contains(&("level", "missing")));
        assert!(reasons.contains(&("bogus", "unknown_parameter")));
    }

    #[test]
    fn empty_device_ids_rejected() {
        let registry = registry_with_light();
        let err = validate_request(
            &registry,
            &CommandRequest {
                device_ids: vec![],
                capability: "turn_on".into(),
                parameters: BTreeMap::new(),
                allow_offline: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));
    }

    #[test]
    fn unknown_capability_and_device() {
        let registry = registry_with_light();
        assert!(matches!(
            validate_request(&registry, &request("fly", BTreeMap::new())).unwrap_err(),
            EnqueueError::CapabilityNotSupported { .. }
        ));

        let mut req = request("turn_on", BTreeMap::new());
        req.device_ids = vec!["light.basement".into()];
        assert!(matches!(
            validate_request(&registry, &req).unwrap_err(),
            EnqueueError::UnknownDevice(_)
        ));
    }

    #[test]
    fn offline_device_fails_fast_unless_allowed() {
        let registry = registry_with_light();
        registry.set_status("light.living_room_1", alicia_protocol::DeviceStatus::Offline);

        let mut req = request("turn_on", BTreeMap::new());
        assert!(matches!(
            validate_request(&registry, &req).unwrap_err(),
            EnqueueError::DeviceUnavailable(..)
        ));

        req.allow_offline = true;
        assert!(validate_request(&registry, &req).is_ok());
    }
}

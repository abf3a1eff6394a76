//! Device and capability model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Registered,
    Online,
    Offline,
    Faulted,
}

/// A device known to the registry. This struct is also the payload of
/// `alicia/devices/register` and the retained `…/state` messages, so a
/// restarted registry can rebuild itself from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Capability name → parameter schemas.
    #[serde(default)]
    pub capabilities: BTreeMap<String, Capability>,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Device {
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities & parameter schemas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named operation a device supports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamSchema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    String,
    Enum,
}

/// Schema for one command parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSchema {
    pub kind: ParamKind,
    /// Inclusive numeric range for `int`/`float`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Permitted values for `enum`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

impl ParamSchema {
    pub fn bool() -> Self {
        Self::of(ParamKind::Bool)
    }

    pub fn int(min: i64, max: i64) -> Self {
        let mut s = Self::of(ParamKind::Int);
        s.min = Some(min as f64);
        s.max = Some(max as f64);
        s
    }

    pub fn float(min: f64, max: f64) -> Self {
        let mut s = Self::of(ParamKind::Float);
        s.min = Some(min);
        s.max = Some(max);
        s
    }

    pub fn string() -> Self {
        Self::of(ParamKind::String)
    }

    pub fn enumeration(values: &[&str]) -> Self {
        let mut s = Self::of(ParamKind::Enum);
        s.values = values.iter().map(|v| (*v).to_owned()).collect();
        s
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn of(kind: ParamKind) -> Self {
        Self {
            kind,
            min: None,
            max: None,
            values: Vec::new(),
            required: false,
        }
    }

    /// Check a supplied value against this schema.
    pub fn check(&self, value: &Value) -> Result<(), ParamViolation> {
        match self.kind {
            ParamKind::Bool => {
                if !value.is_boolean() {
                    return Err(ParamViolation::WrongType { expected: "bool" });
                }
            }
            ParamKind::Int => {
                let Some(n) = value.as_i64() else {
                    return Err(ParamViolation::WrongType { expected: "int" });
                };
                self.check_range(n as f64)?;
            }
            ParamKind::Float => {
                let Some(n) = value.as_f64() else {
                    return Err(ParamViolation::WrongType { expected: "float" });
                };
                self.check_range(n)?;
            }
            ParamKind::String => {
                if !value.is_string() {
                    return Err(ParamViolation::WrongType { expected: "string" });
                }
            }
            ParamKind::Enum => {
                let Some(s) = value.as_str() else {
                    return Err(ParamViolation::WrongType { expected: "enum" });
                };
                if !self.values.iter().any(|v| v == s) {
                    return Err(ParamViolation::NotInEnum {
                        allowed: self.values.join("|"),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_range(&self, n: f64) -> Result<(), ParamViolation> {
        let below = self.min.is_some_and(|min| n < min);
        let above = self.max.is_some_and(|max| n > max);
        if below || above {
            return Err(ParamViolation::OutOfRange {
                allowed: self.range_display(),
            });
        }
        Ok(())
    }

    fn range_display(&self) -> String {
        let fmt = |v: f64| {
            if v.fract() == 0.0 {
                format!("{}", v as i64)
            } else {
                format!("{v}")
            }
        };
        match (self.min, self.max) {
            (Some(a), Some(b)) => format!("[{},{}]", fmt(a), fmt(b)),
            (Some(a), None) => format!("[{},∞)", fmt(a)),
            (None, Some(b)) => format!("(-∞,{}]", fmt(b)),
            (None, None) => "(-∞,∞)".into(),
        }
    }
}

/// Why a single parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamViolation {
    Missing,
    WrongType { expected: &'static str },
    OutOfRange { allowed: String },
    NotInEnum { allowed: String },
    Unknown,
}

impl ParamViolation {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::WrongType { .. } => "wrong_type",
            Self::OutOfRange { .. } => "out_of_range",
            Self::NotInEnum { .. } => "not_in_enum",
            Self::Unknown => "unknown_parameter",
        }
    }

    /// The allowed range/set, where one exists.
    pub fn allowed(&self) -> Option<String> {
        match self {
            Self::WrongType { expected } => Some((*expected).to_owned()),
            Self::OutOfRange { allowed } | Self::NotInEnum { allowed } => Some(allowed.clone()),
            Self::Missing | Self::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn int_range_check() {
        let schema = ParamSchema::int(0, 100);
        assert!(schema.check(&json!(50)).is_ok());
        assert!(schema.check(&json!(0)).is_ok());
        assert!(schema.check(&json!(100)).is_ok());

        let err = schema.check(&json!(150)).unwrap_err();
        assert_eq!(err.reason(), "out_of_range");
        assert_eq!(err.allowed().as_deref(), Some("[0,100]"));
    }

    #[test]
    fn type_mismatches() {
        assert_eq!(
            ParamSchema::bool().check(&json!("true")).unwrap_err().reason(),
            "wrong_type"
        );
        assert_eq!(
            ParamSchema::int(0, 10).check(&json!(1.5)).unwrap_err().reason(),
            "wrong_type"
        );
        assert!(ParamSchema::float(0.0, 1.0).check(&json!(1)).is_ok()); // ints coerce to float
    }

    #[test]
    fn enum_membership() {
        let schema = ParamSchema::enumeration(&["low", "medium", "high"]);
        assert!(schema.check(&json!("medium")).is_ok());
        let err = schema.check(&json!("extreme")).unwrap_err();
        assert_eq!(err.reason(), "not_in_enum");
        assert_eq!(err.allowed().as_deref(), Some("low|medium|high"));
    }

    #[test]
    fn device_serde_round_trip() {
        let mut caps = BTreeMap::new();
        caps.insert(
            "set_brightness".to_owned(),
            Capability {
                parameters: BTreeMap::from([(
                    "level".to_owned(),
                    ParamSchema::int(0, 100).required(),
                )]),
            },
        );
        let device = Device {
            device_id: "light.living_room_1".into(),
            device_type: "light".into(),
            room: Some("living_room".into()),
            capabilities: caps,
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
            metadata: BTreeMap::new(),
        };

        let json = serde_json::to_string(&device).unwrap();
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(back.device_id, device.device_id);
        assert!(back.capability("set_brightness").is_some());
        assert_eq!(back.status, DeviceStatus::Online);
    }
}

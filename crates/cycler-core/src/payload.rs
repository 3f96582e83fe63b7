//! Job payloads: ordered technique lists plus resource constraints.
//!
//! A payload is fixed at submission time and never mutated afterwards, so
//! that snapshot and status queries always show what was actually submitted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One technique to run on the instrument, in submission order.
///
/// Parameter values are driver-opaque JSON; the driver's `translate` step
/// turns them into the instrument's native format. Current and voltage may
/// be given relative to cell capacity (e.g. C-rates), which is why
/// [`Sample::capacity_mah`] travels with the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technique {
    /// Technique name understood by the driver (e.g. "constant_current").
    pub name: String,
    /// Driver-specific parameters.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Description of the material loaded into the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Cell charge capacity in mAh, used to resolve capacity-relative
    /// technique parameters. Zero means "not specified".
    #[serde(default)]
    pub capacity_mah: f64,
}

/// Resource constraints a pipeline must satisfy to run this payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Required device tag; `None` matches any pipeline.
    #[serde(default)]
    pub device_tag: Option<String>,
    /// Minimum cell capacity in mAh required by the techniques.
    #[serde(default)]
    pub min_capacity_mah: Option<f64>,
}

/// A submitted unit of work: techniques in execution order plus the
/// constraints and sample information needed to place and translate them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub techniques: Vec<Technique>,
    #[serde(default)]
    pub sample: Sample,
    #[serde(default)]
    pub constraints: Constraints,
}

impl Payload {
    /// Whether a pipeline with the given tags and capacity can run this
    /// payload.
    pub fn matches(&self, tags: &[String], capacity_mah: f64) -> bool {
        if let Some(tag) = &self.constraints.device_tag {
            if !tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(min) = self.constraints.min_capacity_mah {
            if capacity_mah < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_with(tag: Option<&str>, min_cap: Option<f64>) -> Payload {
        Payload {
            constraints: Constraints {
                device_tag: tag.map(String::from),
                min_capacity_mah: min_cap,
            },
            ..Default::default()
        }
    }

    #[test]
    fn unconstrained_payload_matches_anything() {
        let p = payload_with(None, None);
        assert!(p.matches(&[], 0.0));
    }

    #[test]
    fn tag_constraint_requires_matching_tag() {
        let p = payload_with(Some("worker"), None);
        assert!(p.matches(&["worker".into()], 0.0));
        assert!(!p.matches(&["other".into()], 0.0));
        assert!(!p.matches(&[], 0.0));
    }

    #[test]
    fn capacity_constraint_requires_enough_capacity() {
        let p = payload_with(None, Some(100.0));
        assert!(p.matches(&[], 150.0));
        assert!(!p.matches(&[], 50.0));
    }

    #[test]
    fn payload_round_trips_through_json() {
        let p = Payload {
            techniques: vec![Technique {
                name: "open_circuit_voltage".into(),
                parameters: HashMap::from([("time".into(), serde_json::json!(60))]),
            }],
            sample: Sample { capacity_mah: 45.0 },
            constraints: Constraints::default(),
        };
        let text = serde_json::to_string(&p).expect("serialize");
        let back: Payload = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(p, back);
    }
}

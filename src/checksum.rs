//! Content checksums of the worker deployment.
//!
//! Drift is detected by comparing the checksums of the freshly computed
//! deployment against the checksums persisted when the last deployment was
//! submitted. Both checksums are SHA-256 over a canonical JSON encoding
//! (object keys sorted at every level), so they do not depend on map
//! iteration order.
//!
//! The worker boot configuration is passed as a base64 parameter. It embeds a
//! short-lived blob URL that changes on every render without changing what the
//! nodes boot, so that URL is blanked before hashing.

use aws_lc_rs::digest::{digest, SHA256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

use crate::crd::UpgradeStatus;

/// Deployment parameter carrying the base64 worker boot configuration
pub const BOOT_CONFIG_PARAMETER: &str = "workerCloudConfigData";

/// Checksums of a deployment's template and parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumPair {
    /// Checksum of the template
    pub template: String,
    /// Checksum of the parameters with volatile content removed
    pub parameters: String,
}

impl ChecksumPair {
    /// Compute both checksums
    pub fn compute(template: &Value, parameters: &Map<String, Value>) -> Self {
        Self {
            template: template_checksum(template),
            parameters: parameters_checksum(parameters),
        }
    }

    /// True if `status` records exactly this pair
    pub fn matches(&self, status: &UpgradeStatus) -> bool {
        status.template_checksum.as_deref() == Some(self.template.as_str())
            && status.parameters_checksum.as_deref() == Some(self.parameters.as_str())
    }
}

/// Checksum of a deployment template
pub fn template_checksum(template: &Value) -> String {
    sha256_hex(canonical_json(template).as_bytes())
}

/// Checksum of deployment parameters
///
/// Parameters use the ARM shape `{ "<name>": { "value": <v> } }`.
pub fn parameters_checksum(parameters: &Map<String, Value>) -> String {
    let mut normalized = parameters.clone();

    if let Some(encoded) = normalized
        .get(BOOT_CONFIG_PARAMETER)
        .and_then(|p| p.get("value"))
        .and_then(Value::as_str)
    {
        let stable = stable_boot_config(encoded);
        normalized.insert(
            BOOT_CONFIG_PARAMETER.to_string(),
            serde_json::json!({ "value": stable }),
        );
    }

    sha256_hex(canonical_json(&Value::Object(normalized)).as_bytes())
}

/// Decode the boot configuration and blank its volatile blob URLs.
///
/// Content that is not base64 JSON is hashed verbatim.
fn stable_boot_config(encoded: &str) -> Value {
    let Ok(bytes) = STANDARD.decode(encoded) else {
        return Value::String(encoded.to_string());
    };
    let Ok(mut config) = serde_json::from_slice::<Value>(&bytes) else {
        return Value::String(encoded.to_string());
    };

    if let Some(append) = config
        .pointer_mut("/ignition/config/append")
        .and_then(Value::as_array_mut)
    {
        for entry in append.iter_mut() {
            if let Some(source) = entry.get_mut("source") {
                *source = Value::String(String::new());
            }
        }
    }

    config
}

/// Serialize JSON with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(input: &[u8]) -> String {
    let hash = digest(&SHA256, input);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn boot_config(source: &str, version: &str) -> String {
        let config = json!({
            "ignition": {
                "version": "2.2.0",
                "config": {
                    "append": [{ "source": source, "verification": {} }]
                }
            },
            "operatorVersion": version
        });
        STANDARD.encode(config.to_string())
    }

    fn params(entries: Vec<(&str, Value)>) -> Map<String, Value> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), json!({ "value": v })))
            .collect()
    }

    /// Story: Parameter order never causes a spurious upgrade
    #[test]
    fn story_parameter_order_is_irrelevant() {
        let a = params(vec![("a", json!(1)), ("b", json!(2))]);
        let b = params(vec![("b", json!(2)), ("a", json!(1))]);
        assert_eq!(parameters_checksum(&a), parameters_checksum(&b));

        let nested_a = json!({ "x": { "p": 1, "q": [ { "m": 1, "n": 2 } ] } });
        let nested_b = json!({ "x": { "q": [ { "n": 2, "m": 1 } ], "p": 1 } });
        assert_eq!(template_checksum(&nested_a), template_checksum(&nested_b));
    }

    /// Story: A freshly signed blob URL does not trigger node replacement
    #[test]
    fn story_volatile_boot_config_url_is_ignored() {
        let first = params(vec![
            ("vmSize", json!("Standard_D4s_v3")),
            (
                BOOT_CONFIG_PARAMETER,
                json!(boot_config("https://blob/worker?sig=aaa", "4.2.0")),
            ),
        ]);
        let second = params(vec![
            ("vmSize", json!("Standard_D4s_v3")),
            (
                BOOT_CONFIG_PARAMETER,
                json!(boot_config("https://blob/worker?sig=bbb", "4.2.0")),
            ),
        ]);
        assert_eq!(parameters_checksum(&first), parameters_checksum(&second));
    }

    /// Story: Real changes are always detected
    #[test]
    fn story_semantic_changes_change_the_checksum() {
        let base = params(vec![
            ("vmSize", json!("Standard_D4s_v3")),
            (
                BOOT_CONFIG_PARAMETER,
                json!(boot_config("https://blob/worker?sig=aaa", "4.2.0")),
            ),
        ]);
        let resized = params(vec![
            ("vmSize", json!("Standard_D8s_v3")),
            (
                BOOT_CONFIG_PARAMETER,
                json!(boot_config("https://blob/worker?sig=aaa", "4.2.0")),
            ),
        ]);
        let new_boot = params(vec![
            ("vmSize", json!("Standard_D4s_v3")),
            (
                BOOT_CONFIG_PARAMETER,
                json!(boot_config("https://blob/worker?sig=aaa", "4.3.0")),
            ),
        ]);

        let base_sum = parameters_checksum(&base);
        assert_ne!(base_sum, parameters_checksum(&resized));
        assert_ne!(base_sum, parameters_checksum(&new_boot));
    }

    #[test]
    fn test_undecodable_boot_config_is_hashed_verbatim() {
        let a = params(vec![(BOOT_CONFIG_PARAMETER, json!("not base64 !!"))]);
        let b = params(vec![(BOOT_CONFIG_PARAMETER, json!("not base64 ??"))]);
        assert_ne!(parameters_checksum(&a), parameters_checksum(&b));
    }

    #[test]
    fn test_checksums_are_hex_sha256() {
        let sum = template_checksum(&json!({}));
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        // sha256("{}")
        assert_eq!(
            sum,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_pair_matches_persisted_status() {
        let pair = ChecksumPair::compute(&json!({"a": 1}), &params(vec![("b", json!(2))]));
        let status = UpgradeStatus {
            template_checksum: Some(pair.template.clone()),
            parameters_checksum: Some(pair.parameters.clone()),
            ..Default::default()
        };
        assert!(pair.matches(&status));
        assert!(!pair.matches(&UpgradeStatus::default()));
    }
}

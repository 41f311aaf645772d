//! Field validation helpers for inbound control messages.

use excavator_common::consts::{MAX_RATE, MIN_RATE};
use serde_json::Value;

/// Parse a permissive boolean: accepts JSON booleans, 0/1 numbers and
/// the strings true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool(value: &Value, context: &str) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => {
            let lower = s.to_ascii_lowercase();
            if ["false", "no", "off", "0"].contains(&lower.as_str()) {
                Ok(false)
            } else if ["true", "yes", "on", "1"].contains(&lower.as_str()) {
                Ok(true)
            } else {
                Err(format!(
                    "Invalid value for {context}. Possible values false/no/true/yes/0/1"
                ))
            }
        }
        _ => Err(format!(
            "Invalid value for {context}. Possible values false/no/true/yes/0/1"
        )),
    }
}

/// Parse a number from a JSON number or numeric string.
pub fn parse_number(value: &Value, context: &str) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{context} has to be a number")),
        Value::String(s) => s.parse().map_err(|_| format!("{context} has to be a number")),
        _ => Err(format!("{context} has to be a number")),
    }
}

/// Validate a loop rate against the global band and an optional
/// per-site cap.
pub fn validate_rate(rate: f64, context: &str, cap: Option<f64>) -> Result<f64, String> {
    let max = cap.unwrap_or(MAX_RATE);
    if !(rate > MIN_RATE && rate < max) {
        return Err(format!("rate: {context} has to be between {MIN_RATE}-{max}"));
    }
    Ok(rate)
}

/// Lowercase, deduplicate-check and existence-check a channel-name
/// list. The pump is never remotely drivable.
pub fn validate_channel_names(
    raw: &Value,
    existing: &[String],
) -> Result<Vec<String>, String> {
    let array = raw
        .as_array()
        .ok_or_else(|| "channel_names has to be a list of strings".to_string())?;
    let mut names = Vec::with_capacity(array.len());
    for item in array {
        let name = item
            .as_str()
            .ok_or_else(|| "channel_names have to be strings".to_string())?;
        names.push(name.to_ascii_lowercase());
    }

    let mut seen = names.clone();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != names.len() {
        return Err("Channel names must be unique".to_string());
    }
    if names.iter().any(|n| n == "pump") {
        return Err("Pump is not allowed to be remote controlled".to_string());
    }
    for name in &names {
        if !existing.contains(name) {
            return Err(format!(
                "Channel name {name} is not available. Available channels: {}",
                existing.join(",")
            ));
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn booleans_are_permissive() {
        for truthy in [json!(true), json!(1), json!("yes"), json!("ON"), json!("true")] {
            assert!(parse_bool(&truthy, "x").unwrap(), "{truthy}");
        }
        for falsy in [json!(false), json!(0), json!("no"), json!("off"), json!("False")] {
            assert!(!parse_bool(&falsy, "x").unwrap(), "{falsy}");
        }
        assert!(parse_bool(&json!("maybe"), "x").is_err());
        assert!(parse_bool(&json!([1]), "x").is_err());
    }

    #[test]
    fn rates_respect_caps() {
        assert!(validate_rate(20.0, "r", Some(25.0)).is_ok());
        assert!(validate_rate(25.0, "r", Some(25.0)).is_err());
        assert!(validate_rate(0.05, "r", None).is_err());
        assert!(validate_rate(299.0, "r", None).is_ok());
    }

    #[test]
    fn channel_names_lowercased_and_checked() {
        let existing = vec!["lift_boom".to_string(), "tilt_bucket".to_string()];
        let names =
            validate_channel_names(&json!(["Lift_Boom", "tilt_bucket"]), &existing).unwrap();
        assert_eq!(names, vec!["lift_boom", "tilt_bucket"]);

        assert!(validate_channel_names(&json!(["lift_boom", "lift_boom"]), &existing).is_err());
        assert!(validate_channel_names(&json!(["pump"]), &existing).is_err());
        assert!(validate_channel_names(&json!(["swing"]), &existing).is_err());
        assert!(validate_channel_names(&json!([1]), &existing).is_err());
        assert!(validate_channel_names(&json!("lift_boom"), &existing).is_err());
    }
}

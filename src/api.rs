//! Public-API descriptors: the method catalogue a service advertises via
//! `setPublicApi` and exposes through `getServicesList`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NsrvmError, Result};

pub const MAX_METHODS: usize = 16;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 128;

/// One advertised public method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiMethod {
    pub name: String,
    pub description: String,
}

/// Validate a raw descriptor list as received on the wire.
///
/// Accepted iff the list holds at most [`MAX_METHODS`] objects, each with
/// exactly the two fields `name` (1–32 chars) and `description`
/// (0–128 chars).
pub fn parse_api(raw: &[Value]) -> Result<Vec<ApiMethod>> {
    if raw.len() > MAX_METHODS {
        return Err(NsrvmError::ApiValidation(format!(
            "{} methods exceed the limit of {MAX_METHODS}",
            raw.len()
        )));
    }
    let mut methods = Vec::with_capacity(raw.len());
    for (i, entry) in raw.iter().enumerate() {
        let obj = entry
            .as_object()
            .ok_or_else(|| NsrvmError::ApiValidation(format!("entry {i} is not an object")))?;
        if obj.len() != 2 || !obj.contains_key("name") || !obj.contains_key("description") {
            return Err(NsrvmError::ApiValidation(format!(
                "entry {i} must have exactly the fields 'name' and 'description'"
            )));
        }
        let name = obj["name"]
            .as_str()
            .ok_or_else(|| NsrvmError::ApiValidation(format!("entry {i}: 'name' must be a string")))?;
        let description = obj["description"].as_str().ok_or_else(|| {
            NsrvmError::ApiValidation(format!("entry {i}: 'description' must be a string"))
        })?;
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(NsrvmError::ApiValidation(format!(
                "entry {i}: name length must be 1-{MAX_NAME_LEN}"
            )));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(NsrvmError::ApiValidation(format!(
                "entry {i}: description exceeds {MAX_DESCRIPTION_LEN} chars"
            )));
        }
        methods.push(ApiMethod {
            name: name.to_string(),
            description: description.to_string(),
        });
    }
    Ok(methods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, description: &str) -> Value {
        json!({"name": name, "description": description})
    }

    #[test]
    fn test_valid_list() {
        let raw = vec![entry("status", "current status"), entry("ping", "")];
        let api = parse_api(&raw).unwrap();
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].name, "status");
        assert_eq!(api[1].description, "");
    }

    #[test]
    fn test_empty_list_is_valid() {
        assert!(parse_api(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_limit_of_sixteen() {
        let raw: Vec<Value> = (0..16).map(|i| entry(&format!("m{i}"), "")).collect();
        assert_eq!(parse_api(&raw).unwrap().len(), 16);

        let raw: Vec<Value> = (0..17).map(|i| entry(&format!("m{i}"), "")).collect();
        assert!(parse_api(&raw).is_err());
    }

    #[test]
    fn test_extra_field_rejected() {
        let raw = vec![json!({"name": "x", "description": "", "extra": 1})];
        assert!(parse_api(&raw).is_err());
    }

    #[test]
    fn test_missing_description_rejected() {
        let raw = vec![json!({"name": "x", "other": ""})];
        assert!(parse_api(&raw).is_err());
    }

    #[test]
    fn test_name_bounds() {
        assert!(parse_api(&[entry("", "")]).is_err());
        assert!(parse_api(&[entry(&"n".repeat(32), "")]).is_ok());
        assert!(parse_api(&[entry(&"n".repeat(33), "")]).is_err());
    }

    #[test]
    fn test_description_bounds() {
        assert!(parse_api(&[entry("m", &"d".repeat(128))]).is_ok());
        assert!(parse_api(&[entry("m", &"d".repeat(129))]).is_err());
    }

    #[test]
    fn test_non_object_entry_rejected() {
        assert!(parse_api(&[json!("status")]).is_err());
        assert!(parse_api(&[json!(42)]).is_err());
    }
}

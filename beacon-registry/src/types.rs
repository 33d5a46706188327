//! Registry records and the JSON bodies of the registry HTTP surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque per-service metadata (version, capabilities, ...)
pub type Metadata = HashMap<String, serde_json::Value>;

/// One registered service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceRecord {
    #[must_use]
    pub fn new(name: String, info: ServiceInfo, last_heartbeat: DateTime<Utc>) -> Self {
        Self {
            name,
            url: info.url,
            health_check_url: info.health_check_url,
            metadata: info.metadata,
            last_heartbeat,
        }
    }

    /// Whether the last heartbeat precedes `threshold`
    #[must_use]
    pub fn is_stale_at(&self, threshold: DateTime<Utc>) -> bool {
        self.last_heartbeat < threshold
    }
}

/// Everything about a service except its name and liveness
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ServiceInfo {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Partial update; absent fields are left as they are, `metadata` is replaced wholesale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ServiceUpdate {
    pub(crate) fn apply_to(self, record: &mut ServiceRecord) {
        if let Some(url) = self.url {
            record.url = url;
        }
        if let Some(health_check_url) = self.health_check_url {
            record.health_check_url = Some(health_check_url);
        }
        if let Some(metadata) = self.metadata {
            record.metadata = metadata;
        }
    }
}

/// Body of `POST /register`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl RegisterRequest {
    /// Split into the record key and its fields, rejecting a missing or blank name/url.
    pub fn into_parts(self) -> Result<(String, ServiceInfo), String> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| "name is required".to_string())?;
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| "url is required".to_string())?;

        Ok((
            name,
            ServiceInfo {
                url,
                health_check_url: self.health_check_url,
                metadata: self.metadata.unwrap_or_default(),
            },
        ))
    }
}

/// Body of a successful `POST /heartbeat/{name}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub success: bool,
    pub name: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Body of a successful `DELETE /services/{name}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub name: String,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Live records after the health-check sweep
    pub services: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_uses_camel_case() {
        let record = ServiceRecord::new(
            "policy-service".to_string(),
            ServiceInfo {
                url: "http://policy:4000".to_string(),
                health_check_url: Some("http://policy:4000/health".to_string()),
                metadata: Metadata::from([("version".to_string(), json!("1.2.0"))]),
            },
            Utc::now(),
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["healthCheckUrl"], "http://policy:4000/health");
        assert_eq!(value["metadata"]["version"], "1.2.0");
        assert!(value.get("lastHeartbeat").is_some());
    }

    #[test]
    fn test_register_request_requires_name_and_url() {
        let missing_name = RegisterRequest {
            url: Some("http://a".to_string()),
            ..RegisterRequest::default()
        };
        assert_eq!(missing_name.into_parts().unwrap_err(), "name is required");

        let blank_url = RegisterRequest {
            name: Some("a".to_string()),
            url: Some("   ".to_string()),
            ..RegisterRequest::default()
        };
        assert_eq!(blank_url.into_parts().unwrap_err(), "url is required");

        let (name, info) = RegisterRequest {
            name: Some("a".to_string()),
            url: Some("http://a".to_string()),
            ..RegisterRequest::default()
        }
        .into_parts()
        .unwrap();
        assert_eq!(name, "a");
        assert_eq!(info.url, "http://a");
        assert!(info.metadata.is_empty());
    }

    #[test]
    fn test_update_replaces_metadata_wholesale() {
        let mut record = ServiceRecord::new(
            "svc".to_string(),
            ServiceInfo {
                url: "http://old".to_string(),
                health_check_url: None,
                metadata: Metadata::from([
                    ("version".to_string(), json!("1")),
                    ("region".to_string(), json!("eu")),
                ]),
            },
            Utc::now(),
        );

        ServiceUpdate {
            metadata: Some(Metadata::from([("version".to_string(), json!("2"))])),
            ..ServiceUpdate::default()
        }
        .apply_to(&mut record);

        assert_eq!(record.url, "http://old");
        assert_eq!(record.metadata.len(), 1);
        assert_eq!(record.metadata["version"], json!("2"));
    }
}

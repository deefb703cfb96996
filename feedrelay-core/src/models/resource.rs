//! Resource payload types shared by the hub and the HTTP surface
//!
//! Inbound payloads go through a typed decode that fails closed: anything
//! that is not `{resourceId: <non-empty string>, data: <object|array>}` is
//! rejected as malformed before it can reach the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::ResourceId;
use crate::error::{Error, Result};

/// Latest known value of a resource
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub resource_id: ResourceId,
    pub data: Value,
    /// Starts at 1 when the resource is first stored, +1 per replacement
    pub version: u64,
    pub received_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    #[must_use]
    pub fn new(resource_id: ResourceId, data: Value, version: u64) -> Self {
        Self {
            resource_id,
            data,
            version,
            received_at: Utc::now(),
        }
    }

    /// Wire form sent to subscribers: the data only
    #[must_use]
    pub fn encode_data(&self) -> String {
        self.data.to_string()
    }
}

/// "Resource requested" signal sent to upstream producers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    #[serde(alias = "id")]
    pub resource_id: ResourceId,
}

impl ResourceRequest {
    #[must_use]
    pub const fn new(resource_id: ResourceId) -> Self {
        Self { resource_id }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUpdate {
    #[serde(alias = "id")]
    resource_id: ResourceId,
    data: Value,
}

/// A validated "resource updated" payload from a producer
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    resource_id: ResourceId,
    data: Value,
}

impl ResourceUpdate {
    /// Build an update, rejecting data that is not an object or array
    pub fn new(resource_id: ResourceId, data: Value) -> Result<Self> {
        if !(data.is_object() || data.is_array()) {
            return Err(Error::MalformedUpdate(format!(
                "data for {resource_id} must be a JSON object or array"
            )));
        }
        Ok(Self { resource_id, data })
    }

    /// Decode a raw message body (bus payload or HTTP body)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: RawUpdate = serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedUpdate(e.to_string()))?;
        Self::new(raw.resource_id, raw.data)
    }

    /// Decode an already parsed JSON document
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawUpdate =
            serde_json::from_value(value).map_err(|e| Error::MalformedUpdate(e.to_string()))?;
        Self::new(raw.resource_id, raw.data)
    }

    #[must_use]
    pub const fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.data
    }

    #[must_use]
    pub fn into_parts(self) -> (ResourceId, Value) {
        (self.resource_id, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_update() {
        let update =
            ResourceUpdate::from_slice(br#"{"resourceId":"feed/8/main","data":{"score":1}}"#)
                .unwrap();

        assert_eq!(update.resource_id().as_str(), "feed/8/main");
        assert_eq!(update.data(), &json!({"score": 1}));
    }

    #[test]
    fn test_decode_accepts_legacy_id_field() {
        let update = ResourceUpdate::from_value(json!({"id": "feed/1", "data": [1, 2]})).unwrap();
        assert_eq!(update.resource_id().as_str(), "feed/1");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let cases: [&[u8]; 6] = [
            b"not json",
            br#"{"data":{"score":1}}"#,
            br#"{"resourceId":"","data":{"score":1}}"#,
            br#"{"resourceId":"feed/1"}"#,
            br#"{"resourceId":"feed/1","data":"{\"score\":1}"}"#,
            br#"{"resourceId":"feed/1","data":null}"#,
        ];

        for body in cases {
            assert!(
                matches!(ResourceUpdate::from_slice(body), Err(Error::MalformedUpdate(_))),
                "expected malformed: {}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request = ResourceRequest::new(ResourceId::parse("feed/8/main").unwrap());
        assert_eq!(request.to_json().unwrap(), r#"{"resourceId":"feed/8/main"}"#);
    }

    #[test]
    fn test_snapshot_encodes_data_only() {
        let snapshot =
            ResourceSnapshot::new(ResourceId::parse("feed/1").unwrap(), json!({"score": 1}), 1);
        assert_eq!(snapshot.encode_data(), r#"{"score":1}"#);
    }
}

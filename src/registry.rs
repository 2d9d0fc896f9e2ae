// Registry descriptors: the lightweight lookup records served by the
// shell/submodel registry surface, projected from stored documents plus
// this instance's endpoint base URL.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TitanError};
use crate::ids::encode_id_to_b64url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorEndpoint {
    pub interface: String,
    pub protocol_information: ProtocolInformation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolInformation {
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmodelDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Value>,
    pub endpoints: Vec<DescriptorEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_asset_id: Option<String>,
    pub endpoints: Vec<DescriptorEndpoint>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub submodel_descriptors: Vec<SubmodelDescriptor>,
}

fn endpoint(base_url: &str, collection: &str, identifier: &str, interface: &str) -> DescriptorEndpoint {
    DescriptorEndpoint {
        interface: interface.to_string(),
        protocol_information: ProtocolInformation {
            href: format!(
                "{}/{collection}/{}",
                base_url.trim_end_matches('/'),
                encode_id_to_b64url(identifier)
            ),
            endpoint_protocol: Some("HTTP".to_string()),
        },
    }
}

/// Descriptor for one stored shell document.
pub fn shell_descriptor(doc: &Value, base_url: &str) -> Result<ShellDescriptor> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| TitanError::BadRequest("shell document without id".into()))?;
    Ok(ShellDescriptor {
        id: id.to_string(),
        id_short: doc
            .get("idShort")
            .and_then(Value::as_str)
            .map(str::to_string),
        global_asset_id: doc
            .pointer("/assetInformation/globalAssetId")
            .and_then(Value::as_str)
            .map(str::to_string),
        endpoints: vec![endpoint(base_url, "shells", id, "AAS-3.0")],
        submodel_descriptors: Vec::new(),
    })
}

/// Descriptor for one stored submodel document.
pub fn submodel_descriptor(doc: &Value, base_url: &str) -> Result<SubmodelDescriptor> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| TitanError::BadRequest("submodel document without id".into()))?;
    Ok(SubmodelDescriptor {
        id: id.to_string(),
        id_short: doc
            .get("idShort")
            .and_then(Value::as_str)
            .map(str::to_string),
        semantic_id: doc.get("semanticId").cloned(),
        endpoints: vec![endpoint(base_url, "submodels", id, "SUBMODEL-3.0")],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shell_descriptor_projection() {
        let doc = json!({
            "id": "urn:x:aas:1",
            "idShort": "Pump",
            "assetInformation": {"assetKind": "Instance", "globalAssetId": "urn:x:asset:1"}
        });
        let descriptor = shell_descriptor(&doc, "http://localhost:8080/").unwrap();
        assert_eq!(descriptor.id, "urn:x:aas:1");
        assert_eq!(descriptor.global_asset_id.as_deref(), Some("urn:x:asset:1"));
        assert_eq!(
            descriptor.endpoints[0].protocol_information.href,
            format!("http://localhost:8080/shells/{}", encode_id_to_b64url("urn:x:aas:1"))
        );

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["globalAssetId"], "urn:x:asset:1");
        assert!(json.get("submodelDescriptors").is_none());
    }

    #[test]
    fn test_submodel_descriptor_keeps_semantic_id() {
        let doc = json!({
            "id": "urn:x:sm:1",
            "semanticId": {"type": "ExternalReference", "keys": [{"type": "GlobalReference", "value": "urn:sem:x"}]}
        });
        let descriptor = submodel_descriptor(&doc, "http://localhost:8080").unwrap();
        assert!(descriptor.semantic_id.is_some());
        assert_eq!(descriptor.endpoints[0].interface, "SUBMODEL-3.0");
    }

    #[test]
    fn test_descriptor_requires_id() {
        assert!(shell_descriptor(&json!({"idShort": "x"}), "http://h").is_err());
    }
}

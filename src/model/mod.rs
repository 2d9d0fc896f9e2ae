// IDTA AAS v3.0 data model: the identifiable roots and shared value types.
//
// Serde attributes produce the external camelCase JSON form directly, with
// optional members elided, so `canonical::canonical_bytes_for` yields the
// stored wire shape without a separate mapping layer.

pub mod elements;

pub use elements::{
    Entity, EntityType, OperationVariable, Property, Range, SubmodelElement,
    SubmodelElementCollection, SubmodelElementList,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Reference.type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceType {
    ExternalReference,
    ModelReference,
}

/// One link in a reference's key chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    #[serde(rename = "type")]
    pub key_type: String,
    pub value: String,
}

/// A chain of typed keys pointing at an identifiable or an element inside
/// one. Must carry at least one key (enforced by `validation`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    #[serde(rename = "type")]
    pub reference_type: ReferenceType,
    pub keys: Vec<Key>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referred_semantic_id: Option<Box<Reference>>,
}

impl Reference {
    /// External reference with a single key.
    pub fn external(value: impl Into<String>) -> Self {
        Self {
            reference_type: ReferenceType::ExternalReference,
            keys: vec![Key {
                key_type: "GlobalReference".to_string(),
                value: value.into(),
            }],
            referred_semantic_id: None,
        }
    }

    /// Model reference from a key chain.
    pub fn model(keys: Vec<Key>) -> Self {
        Self {
            reference_type: ReferenceType::ModelReference,
            keys,
            referred_semantic_id: None,
        }
    }

    /// The last key's value, used as the submodel semantic-id filter column.
    pub fn last_key_value(&self) -> Option<&str> {
        self.keys.last().map(|k| k.value.as_str())
    }
}

/// Localized text entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LangString {
    pub language: String,
    pub text: String,
}

/// Version/revision metadata on identifiables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdministrativeInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

/// Qualifier attached to a submodel or element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Qualifier {
    #[serde(rename = "type")]
    pub qualifier_type: String,
    pub value_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_id: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Reference>,
}

/// Proprietary extension entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refers_to: Option<Vec<Reference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Reference>,
}

/// Domain-specific asset identifier (serial number, batch, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecificAssetId {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_subject_id: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Reference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetKind {
    Instance,
    Type,
    NotApplicable,
}

/// Asset linkage carried by every shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetInformation {
    pub asset_kind: AssetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_asset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub specific_asset_ids: Option<Vec<SpecificAssetId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
}

/// Top-level descriptor of an asset's digital twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAdministrationShell {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    pub asset_information: AssetInformation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub administration: Option<AdministrativeInformation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submodels: Option<Vec<Reference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<Extension>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_data_specifications: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModellingKind {
    Instance,
    Template,
}

/// One aspect of an asset: a typed tree of submodel elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submodel {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ModellingKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub administration: Option<AdministrativeInformation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submodel_elements: Option<Vec<SubmodelElement>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifiers: Option<Vec<Qualifier>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<Extension>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_data_specifications: Option<Vec<Value>>,
}

/// Shared vocabulary entry referenced by semanticIds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptDescription {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub administration: Option<AdministrativeInformation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_case_of: Option<Vec<Reference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_data_specifications: Option<Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shell_camel_case_roundtrip() {
        let doc = json!({
            "id": "urn:x:aas:1",
            "idShort": "A",
            "assetInformation": {
                "assetKind": "Instance",
                "globalAssetId": "urn:x:asset:1"
            }
        });
        let shell: AssetAdministrationShell = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(shell.id_short.as_deref(), Some("A"));
        assert_eq!(shell.asset_information.asset_kind, AssetKind::Instance);
        let back = serde_json::to_value(&shell).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_reference_last_key_value() {
        let r = Reference::external("urn:sem:battery-passport");
        assert_eq!(r.last_key_value(), Some("urn:sem:battery-passport"));
    }

    #[test]
    fn test_submodel_kind_strings() {
        let doc = json!({"id": "urn:x:sm:1", "kind": "Template"});
        let sm: Submodel = serde_json::from_value(doc).unwrap();
        assert_eq!(sm.kind, Some(ModellingKind::Template));
        assert_eq!(serde_json::to_value(&sm).unwrap()["kind"], "Template");
    }
}

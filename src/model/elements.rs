// SubmodelElement: a 14-variant tagged union, recursive through
// collections, lists, entity statements, relationship annotations and
// operation variables.
//
// The `modelType` member is the discriminator; serde's internally tagged
// representation resolves the concrete variant in one map lookup and
// rejects unknown modelType values outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LangString, Qualifier, Reference, SpecificAssetId};

/// Members common to every element variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplemental_semantic_ids: Option<Vec<Reference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifiers: Option<Vec<Qualifier>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_data_specifications: Option<Vec<Value>>,
}

/// Single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub value_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_id: Option<Reference>,
}

/// Localized text value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiLanguageProperty {
    #[serde(flatten)]
    pub meta: ElementMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<LangString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_id: Option<Reference>,
}

/// Min/max bounds of one value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub value_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// Embedded binary content, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Reference to a packaged or external file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceElement {
    #[serde(flatten)]
    pub meta: ElementMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Reference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipElement {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub first: Reference,
    pub second: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedRelationshipElement {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub first: Reference,
    pub second: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<SubmodelElement>>,
}

/// Unordered grouping of child elements with unique idShorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmodelElementCollection {
    #[serde(flatten)]
    pub meta: ElementMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<SubmodelElement>>,
}

/// Ordered, homogeneous list; children are addressed by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmodelElementList {
    #[serde(flatten)]
    pub meta: ElementMeta,
    #[serde(default = "default_order_relevant")]
    pub order_relevant: bool,
    pub type_value_list_element: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type_list_element: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_id_list_element: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<SubmodelElement>>,
}

fn default_order_relevant() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    SelfManagedEntity,
    CoManagedEntity,
}

/// Nested entity with its own asset linkage and statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub entity_type: EntityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_asset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specific_asset_ids: Option<Vec<SpecificAssetId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statements: Option<Vec<SubmodelElement>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicEventElement {
    #[serde(flatten)]
    pub meta: ElementMeta,
    pub observed: Reference,
    pub direction: EventDirection,
    pub state: EventState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_broker: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<String>,
}

/// An operation parameter; its value is itself an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationVariable {
    pub value: Box<SubmodelElement>,
}

/// Invokable functionality. Execution is delegated; only the signature is
/// stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(flatten)]
    pub meta: ElementMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_variables: Option<Vec<OperationVariable>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_variables: Option<Vec<OperationVariable>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inoutput_variables: Option<Vec<OperationVariable>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    #[serde(flatten)]
    pub meta: ElementMeta,
}

/// The element union. Variant names are exactly the external modelType
/// strings, so serde's tag handling doubles as the constant-time
/// discriminator lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modelType")]
pub enum SubmodelElement {
    Property(Property),
    MultiLanguageProperty(MultiLanguageProperty),
    Range(Range),
    Blob(Blob),
    File(File),
    ReferenceElement(ReferenceElement),
    RelationshipElement(RelationshipElement),
    AnnotatedRelationshipElement(AnnotatedRelationshipElement),
    SubmodelElementCollection(SubmodelElementCollection),
    SubmodelElementList(SubmodelElementList),
    Entity(Entity),
    BasicEventElement(BasicEventElement),
    Operation(Operation),
    Capability(Capability),
}

impl SubmodelElement {
    /// The external modelType string.
    pub fn model_type(&self) -> &'static str {
        match self {
            SubmodelElement::Property(_) => "Property",
            SubmodelElement::MultiLanguageProperty(_) => "MultiLanguageProperty",
            SubmodelElement::Range(_) => "Range",
            SubmodelElement::Blob(_) => "Blob",
            SubmodelElement::File(_) => "File",
            SubmodelElement::ReferenceElement(_) => "ReferenceElement",
            SubmodelElement::RelationshipElement(_) => "RelationshipElement",
            SubmodelElement::AnnotatedRelationshipElement(_) => "AnnotatedRelationshipElement",
            SubmodelElement::SubmodelElementCollection(_) => "SubmodelElementCollection",
            SubmodelElement::SubmodelElementList(_) => "SubmodelElementList",
            SubmodelElement::Entity(_) => "Entity",
            SubmodelElement::BasicEventElement(_) => "BasicEventElement",
            SubmodelElement::Operation(_) => "Operation",
            SubmodelElement::Capability(_) => "Capability",
        }
    }

    pub fn id_short(&self) -> Option<&str> {
        self.meta().id_short.as_deref()
    }

    pub fn meta(&self) -> &ElementMeta {
        match self {
            SubmodelElement::Property(e) => &e.meta,
            SubmodelElement::MultiLanguageProperty(e) => &e.meta,
            SubmodelElement::Range(e) => &e.meta,
            SubmodelElement::Blob(e) => &e.meta,
            SubmodelElement::File(e) => &e.meta,
            SubmodelElement::ReferenceElement(e) => &e.meta,
            SubmodelElement::RelationshipElement(e) => &e.meta,
            SubmodelElement::AnnotatedRelationshipElement(e) => &e.meta,
            SubmodelElement::SubmodelElementCollection(e) => &e.meta,
            SubmodelElement::SubmodelElementList(e) => &e.meta,
            SubmodelElement::Entity(e) => &e.meta,
            SubmodelElement::BasicEventElement(e) => &e.meta,
            SubmodelElement::Operation(e) => &e.meta,
            SubmodelElement::Capability(e) => &e.meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_property_discriminator() {
        let doc = json!({
            "modelType": "Property",
            "idShort": "T",
            "valueType": "xs:double",
            "value": "23.5"
        });
        let element: SubmodelElement = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(element.model_type(), "Property");
        assert_eq!(element.id_short(), Some("T"));
        assert_eq!(serde_json::to_value(&element).unwrap(), doc);
    }

    #[test]
    fn test_unknown_model_type_is_rejected() {
        let doc = json!({"modelType": "Widget", "idShort": "x"});
        assert!(serde_json::from_value::<SubmodelElement>(doc).is_err());
    }

    #[test]
    fn test_recursive_collection() {
        let doc = json!({
            "modelType": "SubmodelElementCollection",
            "idShort": "Motor",
            "value": [
                {"modelType": "Property", "idShort": "Rpm", "valueType": "xs:int", "value": "1500"},
                {
                    "modelType": "SubmodelElementList",
                    "idShort": "Stack",
                    "orderRelevant": true,
                    "typeValueListElement": "Property",
                    "valueTypeListElement": "xs:double",
                    "value": [
                        {"modelType": "Property", "valueType": "xs:double", "value": "1.0"}
                    ]
                }
            ]
        });
        let element: SubmodelElement = serde_json::from_value(doc.clone()).unwrap();
        let SubmodelElement::SubmodelElementCollection(collection) = &element else {
            panic!("expected collection");
        };
        assert_eq!(collection.value.as_ref().unwrap().len(), 2);
        assert_eq!(serde_json::to_value(&element).unwrap(), doc);
    }

    #[test]
    fn test_operation_variables_nest_elements() {
        let doc = json!({
            "modelType": "Operation",
            "idShort": "Calibrate",
            "inputVariables": [
                {"value": {"modelType": "Property", "idShort": "Target", "valueType": "xs:double"}}
            ]
        });
        let element: SubmodelElement = serde_json::from_value(doc).unwrap();
        let SubmodelElement::Operation(op) = element else {
            panic!("expected operation");
        };
        let vars = op.input_variables.unwrap();
        assert_eq!(vars[0].value.model_type(), "Property");
    }

    #[test]
    fn test_entity_type_strings() {
        let doc = json!({
            "modelType": "Entity",
            "idShort": "Cell",
            "entityType": "CoManagedEntity"
        });
        let element: SubmodelElement = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(serde_json::to_value(&element).unwrap(), doc);
    }
}

// Projection and navigation over submodel-element trees.
//
// This module is the only place that walks element trees. It operates on
// the stored document form (`serde_json::Value`), so the hot read path can
// project without round-tripping through the typed model; writers validate
// the typed model after transformation.

pub mod crud;
pub mod path;

pub use crud::{
    delete_element, insert_element, patch_element, replace_element, update_element_value,
};
pub use path::{IdShortPath, PathToken};

use serde_json::{json, Map, Value};

use crate::error::{Result, TitanError};
use crate::model::{Key, Reference};

/// `level` query modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    Core,
    #[default]
    Deep,
}

/// `extent` query modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Extent {
    WithoutBlobValue,
    #[default]
    WithBlobValue,
}

/// `content` query modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Content {
    #[default]
    Normal,
    Trimmed,
    Value,
    Path,
    Reference,
    Metadata,
}

impl std::str::FromStr for Level {
    type Err = TitanError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core" => Ok(Level::Core),
            "deep" => Ok(Level::Deep),
            other => Err(TitanError::BadRequest(format!("unknown level {other:?}"))),
        }
    }
}

impl std::str::FromStr for Extent {
    type Err = TitanError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "withoutBlobValue" => Ok(Extent::WithoutBlobValue),
            "withBlobValue" => Ok(Extent::WithBlobValue),
            other => Err(TitanError::BadRequest(format!("unknown extent {other:?}"))),
        }
    }
}

impl std::str::FromStr for Content {
    type Err = TitanError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Content::Normal),
            "trimmed" => Ok(Content::Trimmed),
            "value" => Ok(Content::Value),
            "path" => Ok(Content::Path),
            "reference" => Ok(Content::Reference),
            "metadata" => Ok(Content::Metadata),
            other => Err(TitanError::BadRequest(format!("unknown content {other:?}"))),
        }
    }
}

/// Member name holding a node's navigable children, by modelType.
pub(crate) fn children_slot(node: &Value) -> Option<&'static str> {
    match node.get("modelType").and_then(Value::as_str) {
        Some("SubmodelElementCollection") | Some("SubmodelElementList") => Some("value"),
        Some("Entity") => Some("statements"),
        Some("AnnotatedRelationshipElement") => Some("annotations"),
        _ => None,
    }
}

fn is_list(node: &Value) -> bool {
    node.get("modelType").and_then(Value::as_str) == Some("SubmodelElementList")
}

fn id_short_of(node: &Value) -> Option<&str> {
    node.get("idShort").and_then(Value::as_str)
}

/// Resolve an idShortPath inside a submodel document.
pub fn navigate<'a>(submodel_doc: &'a Value, path: &IdShortPath) -> Result<&'a Value> {
    let mut children: &[Value] = submodel_doc
        .get("submodelElements")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let mut current: Option<&Value> = None;

    for token in path.tokens() {
        let next = match token {
            PathToken::IdShort(name) => children
                .iter()
                .find(|child| id_short_of(child) == Some(name.as_str())),
            PathToken::Index(index) => {
                let list = current.ok_or_else(|| {
                    TitanError::InvalidPath(format!("{path}: index without a list"))
                })?;
                if !is_list(list) {
                    return Err(TitanError::InvalidPath(format!(
                        "{path}: index into a non-list element"
                    )));
                }
                children.get(*index)
            }
        };
        let node = next.ok_or_else(|| TitanError::ElementNotFound(path.to_string()))?;
        children = node
            .get(children_slot(node).unwrap_or("value"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        current = Some(node);
    }

    current.ok_or_else(|| TitanError::ElementNotFound(path.to_string()))
}

/// `$value` of a single element.
pub fn element_value(node: &Value) -> Value {
    match node.get("modelType").and_then(Value::as_str) {
        Some("Property") => node.get("value").cloned().unwrap_or(Value::Null),
        Some("MultiLanguageProperty") => {
            let mut out = Map::new();
            if let Some(entries) = node.get("value").and_then(Value::as_array) {
                for entry in entries {
                    if let (Some(lang), Some(text)) = (
                        entry.get("language").and_then(Value::as_str),
                        entry.get("text").and_then(Value::as_str),
                    ) {
                        out.insert(lang.to_string(), Value::String(text.to_string()));
                    }
                }
            }
            Value::Object(out)
        }
        Some("Range") => json!({
            "min": node.get("min").cloned().unwrap_or(Value::Null),
            "max": node.get("max").cloned().unwrap_or(Value::Null),
        }),
        Some("Blob") | Some("File") => node.get("value").cloned().unwrap_or(Value::Null),
        Some("ReferenceElement") => node.get("value").cloned().unwrap_or(Value::Null),
        Some("RelationshipElement") => json!({
            "first": node.get("first").cloned().unwrap_or(Value::Null),
            "second": node.get("second").cloned().unwrap_or(Value::Null),
        }),
        Some("AnnotatedRelationshipElement") => {
            let annotations = node
                .get("annotations")
                .and_then(Value::as_array)
                .map(|children| children_value_map(children))
                .unwrap_or_default();
            json!({
                "first": node.get("first").cloned().unwrap_or(Value::Null),
                "second": node.get("second").cloned().unwrap_or(Value::Null),
                "annotations": Value::Object(annotations),
            })
        }
        Some("SubmodelElementCollection") => {
            let children = node.get("value").and_then(Value::as_array);
            Value::Object(children.map(|c| children_value_map(c)).unwrap_or_default())
        }
        Some("SubmodelElementList") => {
            let children = node.get("value").and_then(Value::as_array);
            Value::Array(
                children
                    .map(|c| c.iter().map(element_value).collect())
                    .unwrap_or_default(),
            )
        }
        Some("Entity") => {
            let statements = node
                .get("statements")
                .and_then(Value::as_array)
                .map(|children| children_value_map(children))
                .unwrap_or_default();
            let mut out = Map::new();
            out.insert("statements".to_string(), Value::Object(statements));
            if let Some(entity_type) = node.get("entityType") {
                out.insert("entityType".to_string(), entity_type.clone());
            }
            if let Some(global) = node.get("globalAssetId") {
                out.insert("globalAssetId".to_string(), global.clone());
            }
            Value::Object(out)
        }
        Some("BasicEventElement") => json!({
            "observed": node.get("observed").cloned().unwrap_or(Value::Null),
        }),
        // Operation and Capability have no value representation.
        _ => Value::Null,
    }
}

fn children_value_map(children: &[Value]) -> Map<String, Value> {
    children
        .iter()
        .filter_map(|child| {
            id_short_of(child).map(|id_short| (id_short.to_string(), element_value(child)))
        })
        .collect()
}

/// `$value` of a whole submodel: `idShort -> value` over the root elements.
pub fn submodel_value(doc: &Value) -> Value {
    let children = doc
        .get("submodelElements")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    Value::Object(children_value_map(children))
}

/// Members stripped by the `$metadata` projection.
const VALUE_MEMBERS: &[&str] = &["value", "min", "max", "statements", "annotations"];

/// `$metadata` of an element: the node without its value-carrying members.
pub fn element_metadata(node: &Value) -> Value {
    let mut out = node.clone();
    if let Some(map) = out.as_object_mut() {
        for member in VALUE_MEMBERS {
            map.remove(*member);
        }
    }
    out
}

/// `$metadata` of a submodel: the document without its element tree.
pub fn submodel_metadata(doc: &Value) -> Value {
    let mut out = doc.clone();
    if let Some(map) = out.as_object_mut() {
        map.remove("submodelElements");
    }
    out
}

/// `$reference` of a submodel.
pub fn submodel_reference(submodel_id: &str) -> Reference {
    Reference::model(vec![Key {
        key_type: "Submodel".to_string(),
        value: submodel_id.to_string(),
    }])
}

/// `$reference` of an element: a ModelReference whose key chain starts at
/// the submodel and adds one key per path token, typed by the element at
/// that prefix.
pub fn element_reference(doc: &Value, submodel_id: &str, path: &IdShortPath) -> Result<Reference> {
    let mut keys = vec![Key {
        key_type: "Submodel".to_string(),
        value: submodel_id.to_string(),
    }];

    let mut prefix = Vec::new();
    for token in path.tokens() {
        prefix.push(token.clone());
        let node = navigate(doc, &IdShortPath::from_tokens(prefix.clone()))?;
        let key_type = node
            .get("modelType")
            .and_then(Value::as_str)
            .unwrap_or("SubmodelElement")
            .to_string();
        let value = match token {
            PathToken::IdShort(name) => name.clone(),
            PathToken::Index(index) => index.to_string(),
        };
        keys.push(Key {
            key_type,
            value,
        });
    }
    Ok(Reference::model(keys))
}

/// `$path` of an element subtree: the recursively flattened leaf paths.
pub fn element_paths(node: &Value, base: &IdShortPath) -> Vec<String> {
    let mut out = Vec::new();
    collect_paths(node, base, &mut out);
    out
}

/// `$path` of a whole submodel.
pub fn submodel_paths(doc: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let children = doc
        .get("submodelElements")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for child in children {
        if let Some(id_short) = id_short_of(child) {
            let base = IdShortPath::from_tokens(vec![PathToken::IdShort(id_short.to_string())]);
            collect_paths(child, &base, &mut out);
        }
    }
    out
}

fn collect_paths(node: &Value, base: &IdShortPath, out: &mut Vec<String>) {
    let children = children_slot(node)
        .and_then(|slot| node.get(slot))
        .and_then(Value::as_array);
    match children {
        Some(children) if !children.is_empty() => {
            let listy = is_list(node);
            for (index, child) in children.iter().enumerate() {
                if listy {
                    collect_paths(child, &base.indexed(index), out);
                } else if let Some(id_short) = id_short_of(child) {
                    collect_paths(child, &base.child(id_short), out);
                }
            }
        }
        _ => out.push(base.to_string()),
    }
}

/// Apply `level=core`: drop element subtrees beyond the first depth.
pub fn apply_level_core(node: &mut Value) {
    if let Some(children) = children_slot(node)
        .and_then(|slot| node.get_mut(slot))
        .and_then(Value::as_array_mut)
    {
        for child in children {
            prune_children(child);
        }
    }
    if let Some(children) = node
        .get_mut("submodelElements")
        .and_then(Value::as_array_mut)
    {
        for child in children {
            prune_children(child);
        }
    }
}

fn prune_children(node: &mut Value) {
    if let Some(slot) = children_slot(node) {
        if let Some(map) = node.as_object_mut() {
            map.remove(slot);
        }
    }
}

/// Apply `extent=withoutBlobValue`: strip Blob payloads everywhere.
pub fn apply_extent_without_blob(node: &mut Value) {
    if node.get("modelType").and_then(Value::as_str) == Some("Blob") {
        if let Some(map) = node.as_object_mut() {
            map.remove("value");
        }
        return;
    }
    for slot in ["submodelElements", "value", "statements", "annotations"] {
        if let Some(children) = node.get_mut(slot).and_then(Value::as_array_mut) {
            for child in children {
                if child.is_object() {
                    apply_extent_without_blob(child);
                }
            }
        }
    }
}

/// Combined modifier application for a submodel-level response.
pub fn project_submodel(
    doc: &Value,
    submodel_id: &str,
    level: Level,
    extent: Extent,
    content: Content,
) -> Result<Value> {
    let projected = match content {
        Content::Value => submodel_value(doc),
        Content::Metadata => submodel_metadata(doc),
        Content::Reference => serde_json::to_value(submodel_reference(submodel_id))?,
        Content::Path => serde_json::to_value(submodel_paths(doc))?,
        Content::Normal | Content::Trimmed => doc.clone(),
    };
    Ok(finish_projection(projected, level, extent, content))
}

/// Combined modifier application for an element-level response.
pub fn project_element(
    doc: &Value,
    submodel_id: &str,
    path: &IdShortPath,
    level: Level,
    extent: Extent,
    content: Content,
) -> Result<Value> {
    let node = navigate(doc, path)?;
    let projected = match content {
        Content::Value => element_value(node),
        Content::Metadata => element_metadata(node),
        Content::Reference => serde_json::to_value(element_reference(doc, submodel_id, path)?)?,
        Content::Path => serde_json::to_value(element_paths(node, path))?,
        Content::Normal | Content::Trimmed => node.clone(),
    };
    Ok(finish_projection(projected, level, extent, content))
}

fn finish_projection(mut projected: Value, level: Level, extent: Extent, content: Content) -> Value {
    let structural = matches!(content, Content::Normal | Content::Trimmed);
    if structural {
        if level == Level::Core || content == Content::Trimmed {
            apply_level_core(&mut projected);
        }
        if extent == Extent::WithoutBlobValue {
            apply_extent_without_blob(&mut projected);
        }
    }
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReferenceType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_submodel() -> Value {
        json!({
            "id": "urn:x:sm:1",
            "idShort": "Telemetry",
            "submodelElements": [
                {"modelType": "Property", "idShort": "T", "valueType": "xs:double", "value": "23.5"},
                {
                    "modelType": "SubmodelElementCollection",
                    "idShort": "Motor",
                    "value": [
                        {"modelType": "Property", "idShort": "Rpm", "valueType": "xs:int", "value": "1500"},
                        {"modelType": "MultiLanguageProperty", "idShort": "Label", "value": [
                            {"language": "en", "text": "Motor"},
                            {"language": "de", "text": "Antrieb"}
                        ]}
                    ]
                },
                {
                    "modelType": "SubmodelElementList",
                    "idShort": "Stack",
                    "orderRelevant": true,
                    "typeValueListElement": "Property",
                    "valueTypeListElement": "xs:double",
                    "value": [
                        {"modelType": "Property", "valueType": "xs:double", "value": "1.0"},
                        {"modelType": "Property", "valueType": "xs:double", "value": "2.0"}
                    ]
                }
            ]
        })
    }

    #[test]
    fn test_navigate_nested() {
        let doc = sample_submodel();
        let node = navigate(&doc, &IdShortPath::parse("Motor.Rpm").unwrap()).unwrap();
        assert_eq!(node["value"], "1500");

        let node = navigate(&doc, &IdShortPath::parse("Stack[1]").unwrap()).unwrap();
        assert_eq!(node["value"], "2.0");
    }

    #[test]
    fn test_navigate_failures() {
        let doc = sample_submodel();
        assert!(matches!(
            navigate(&doc, &IdShortPath::parse("Nope").unwrap()),
            Err(TitanError::ElementNotFound(_))
        ));
        assert!(matches!(
            navigate(&doc, &IdShortPath::parse("Stack[9]").unwrap()),
            Err(TitanError::ElementNotFound(_))
        ));
        assert!(matches!(
            navigate(&doc, &IdShortPath::parse("T[0]").unwrap()),
            Err(TitanError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_submodel_value() {
        let doc = sample_submodel();
        let value = submodel_value(&doc);
        assert_eq!(
            value,
            json!({
                "T": "23.5",
                "Motor": {"Rpm": "1500", "Label": {"en": "Motor", "de": "Antrieb"}},
                "Stack": ["1.0", "2.0"]
            })
        );
    }

    #[test]
    fn test_element_metadata_strips_values() {
        let doc = sample_submodel();
        let node = navigate(&doc, &IdShortPath::parse("Motor").unwrap()).unwrap();
        let metadata = element_metadata(node);
        assert!(metadata.get("value").is_none());
        assert_eq!(metadata["idShort"], "Motor");
    }

    #[test]
    fn test_element_reference_chain() {
        let doc = sample_submodel();
        let reference =
            element_reference(&doc, "urn:x:sm:1", &IdShortPath::parse("Stack[0]").unwrap())
                .unwrap();
        assert_eq!(reference.reference_type, ReferenceType::ModelReference);
        let keys: Vec<(&str, &str)> = reference
            .keys
            .iter()
            .map(|k| (k.key_type.as_str(), k.value.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("Submodel", "urn:x:sm:1"),
                ("SubmodelElementList", "Stack"),
                ("Property", "0"),
            ]
        );
    }

    #[test]
    fn test_submodel_paths_are_leaves() {
        let doc = sample_submodel();
        let paths = submodel_paths(&doc);
        assert_eq!(
            paths,
            vec![
                "T".to_string(),
                "Motor.Rpm".to_string(),
                "Motor.Label".to_string(),
                "Stack[0]".to_string(),
                "Stack[1]".to_string(),
            ]
        );
    }

    #[test]
    fn test_level_core_prunes_subtrees() {
        let mut doc = sample_submodel();
        apply_level_core(&mut doc);
        let motor = navigate(&doc, &IdShortPath::parse("Motor").unwrap()).unwrap();
        assert!(motor.get("value").is_none());
    }

    #[test]
    fn test_extent_strips_blob_values() {
        let mut doc = json!({
            "id": "urn:x:sm:2",
            "submodelElements": [
                {"modelType": "Blob", "idShort": "Manual", "contentType": "application/pdf", "value": "QUJD"}
            ]
        });
        apply_extent_without_blob(&mut doc);
        let blob = navigate(&doc, &IdShortPath::parse("Manual").unwrap()).unwrap();
        assert!(blob.get("value").is_none());
        assert_eq!(blob["contentType"], "application/pdf");
    }

    #[test]
    fn test_value_projection_matches_navigation() {
        // Projection conservation: navigate-then-value equals value-then-index.
        let doc = sample_submodel();
        let node = navigate(&doc, &IdShortPath::parse("Motor.Rpm").unwrap()).unwrap();
        let direct = element_value(node);
        let whole = submodel_value(&doc);
        assert_eq!(direct, whole["Motor"]["Rpm"]);
    }
}

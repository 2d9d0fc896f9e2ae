// In-place element CRUD on the stored submodel document.
//
// All operations here are pure transformations of a `serde_json::Value`
// tree; persistence, cache invalidation and event emission happen at the
// calling layer, after the mutated document has been re-validated against
// the typed model.

use serde_json::Value;

use super::path::{IdShortPath, PathToken};
use super::{children_slot, navigate};
use crate::error::{Result, TitanError};

fn id_short_of(node: &Value) -> Option<&str> {
    node.get("idShort").and_then(Value::as_str)
}

fn model_type_of(node: &Value) -> Option<&str> {
    node.get("modelType").and_then(Value::as_str)
}

/// The mutable child array a path prefix resolves to. An empty prefix
/// resolves to the submodel's root element array (created when absent).
fn resolve_children_mut<'a>(
    doc: &'a mut Value,
    prefix: &IdShortPath,
) -> Result<&'a mut Vec<Value>> {
    if prefix.is_empty() {
        let map = doc
            .as_object_mut()
            .ok_or_else(|| TitanError::BadRequest("submodel document is not an object".into()))?;
        return map
            .entry("submodelElements")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| TitanError::BadRequest("submodelElements is not an array".into()));
    }

    // Check existence (and container-ness) on the shared view first, then
    // redo the walk mutably; the borrow checker cannot thread a mutable
    // reference through the shared-navigation helper.
    let slot = {
        let node = navigate(doc, prefix)?;
        children_slot(node).ok_or_else(|| {
            TitanError::BadRequest(format!(
                "{prefix} is a {} and cannot hold child elements",
                model_type_of(node).unwrap_or("unknown element")
            ))
        })?
    };

    let mut current = doc
        .get_mut("submodelElements")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| TitanError::ElementNotFound(prefix.to_string()))?;

    let tokens = prefix.tokens();
    for (position, token) in tokens.iter().enumerate() {
        let node = match token {
            PathToken::IdShort(name) => current
                .iter_mut()
                .find(|child| id_short_of(child) == Some(name.as_str())),
            PathToken::Index(index) => current.get_mut(*index),
        }
        .ok_or_else(|| TitanError::ElementNotFound(prefix.to_string()))?;

        let last = position == tokens.len() - 1;
        let child_slot = if last {
            slot
        } else {
            children_slot(node).unwrap_or("value")
        };
        current = node
            .as_object_mut()
            .ok_or_else(|| TitanError::ElementNotFound(prefix.to_string()))?
            .entry(child_slot)
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| TitanError::ElementNotFound(prefix.to_string()))?;
    }
    Ok(current)
}

fn check_duplicate(children: &[Value], element: &Value) -> Result<()> {
    if let Some(id_short) = id_short_of(element) {
        if children
            .iter()
            .any(|child| id_short_of(child) == Some(id_short))
        {
            return Err(TitanError::ElementExists(id_short.to_string()));
        }
    }
    Ok(())
}

fn check_list_membership(doc: &Value, prefix: &IdShortPath, element: &Value) -> Result<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    let parent = navigate(doc, prefix)?;
    if model_type_of(parent) != Some("SubmodelElementList") {
        return Ok(());
    }
    let expected = parent
        .get("typeValueListElement")
        .and_then(Value::as_str)
        .unwrap_or("SubmodelElement");
    let actual = model_type_of(element).unwrap_or("unknown");
    if actual != expected {
        return Err(TitanError::BadRequest(format!(
            "list {prefix} accepts {expected} elements, got {actual}"
        )));
    }
    if let (Some(expected_vt), Some("Property")) = (
        parent.get("valueTypeListElement").and_then(Value::as_str),
        model_type_of(element),
    ) {
        let actual_vt = element.get("valueType").and_then(Value::as_str).unwrap_or("");
        if actual_vt != expected_vt {
            return Err(TitanError::BadRequest(format!(
                "list {prefix} requires valueType {expected_vt}, got {actual_vt}"
            )));
        }
    }
    Ok(())
}

/// Insert a new element.
///
/// `target` of `None` inserts at the submodel root; a path naming a
/// container appends to it; `<list>[<i>]` inserts into the list at the
/// given position.
pub fn insert_element(
    doc: &mut Value,
    target: Option<&IdShortPath>,
    element: Value,
) -> Result<()> {
    match target {
        None => {
            let prefix = IdShortPath::from_tokens(Vec::new());
            let children = resolve_children_mut(doc, &prefix)?;
            check_duplicate(children, &element)?;
            children.push(element);
            Ok(())
        }
        Some(path) => {
            let (prefix, last) = path.split_last();
            if let PathToken::Index(index) = last {
                // Positional insert into a list.
                let index = *index;
                let parent = navigate(doc, &prefix)?;
                if model_type_of(parent) != Some("SubmodelElementList") {
                    return Err(TitanError::InvalidPath(format!(
                        "{path}: positional insert into a non-list element"
                    )));
                }
                check_list_membership(doc, &prefix, &element)?;
                let children = resolve_children_mut(doc, &prefix)?;
                check_duplicate(children, &element)?;
                if index > children.len() {
                    return Err(TitanError::BadRequest(format!(
                        "index {index} out of bounds for list {prefix} of length {}",
                        children.len()
                    )));
                }
                children.insert(index, element);
                Ok(())
            } else {
                check_list_membership(doc, path, &element)?;
                let children = resolve_children_mut(doc, path)?;
                check_duplicate(children, &element)?;
                children.push(element);
                Ok(())
            }
        }
    }
}

/// Replace the element at `path`. The replacement's idShort may differ but
/// must not collide with a sibling.
pub fn replace_element(doc: &mut Value, path: &IdShortPath, element: Value) -> Result<()> {
    navigate(doc, path)?;
    let (prefix, last) = path.split_last();
    if !prefix.is_empty() {
        check_list_membership(doc, &prefix, &element)?;
    }
    let children = resolve_children_mut(doc, &prefix)?;
    let position = position_of(children, last)
        .ok_or_else(|| TitanError::ElementNotFound(path.to_string()))?;

    if let Some(new_id) = id_short_of(&element) {
        let collision = children.iter().enumerate().any(|(i, child)| {
            i != position && id_short_of(child) == Some(new_id)
        });
        if collision {
            return Err(TitanError::ElementExists(new_id.to_string()));
        }
    }
    children[position] = element;
    Ok(())
}

/// Merge `partial` into the element at `path`. The partial may not change
/// the modelType; `null` members are removed.
pub fn patch_element(doc: &mut Value, path: &IdShortPath, partial: &Value) -> Result<()> {
    let patch = partial
        .as_object()
        .ok_or_else(|| TitanError::BadRequest("patch body must be an object".into()))?;

    let current_type = model_type_of(navigate(doc, path)?)
        .unwrap_or("unknown")
        .to_string();
    if let Some(patch_type) = patch.get("modelType").and_then(Value::as_str) {
        if patch_type != current_type {
            return Err(TitanError::BadRequest(format!(
                "cannot change modelType from {current_type} to {patch_type}"
            )));
        }
    }

    let node = navigate_mut(doc, path)?;
    let map = node
        .as_object_mut()
        .ok_or_else(|| TitanError::ElementNotFound(path.to_string()))?;
    for (key, value) in patch {
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.clone(), value.clone());
        }
    }
    Ok(())
}

/// Remove the element at `path`.
pub fn delete_element(doc: &mut Value, path: &IdShortPath) -> Result<()> {
    navigate(doc, path)?;
    let (prefix, last) = path.split_last();
    let children = resolve_children_mut(doc, &prefix)?;
    let position = position_of(children, last)
        .ok_or_else(|| TitanError::ElementNotFound(path.to_string()))?;
    children.remove(position);
    Ok(())
}

/// Value-only update of a data element, checked against its value type.
pub fn update_element_value(doc: &mut Value, path: &IdShortPath, value: &Value) -> Result<()> {
    let node = navigate_mut(doc, path)?;
    let model_type = model_type_of(node).unwrap_or("unknown").to_string();

    match model_type.as_str() {
        "Property" => {
            let value_type = node
                .get("valueType")
                .and_then(Value::as_str)
                .unwrap_or("xs:string")
                .to_string();
            let raw = scalar_to_string(value)?;
            check_value_against_type(&value_type, &raw)?;
            set_member(node, "value", Value::String(raw))
        }
        "MultiLanguageProperty" => {
            let entries = lang_entries(value)?;
            set_member(node, "value", Value::Array(entries))
        }
        "Range" => {
            let bounds = value
                .as_object()
                .ok_or_else(|| TitanError::BadRequest("range value must be an object".into()))?;
            let value_type = node
                .get("valueType")
                .and_then(Value::as_str)
                .unwrap_or("xs:string")
                .to_string();
            let mut min = None;
            let mut max = None;
            if let Some(raw) = bounds.get("min").filter(|v| !v.is_null()) {
                let raw = scalar_to_string(raw)?;
                check_value_against_type(&value_type, &raw)?;
                min = Some(raw);
            }
            if let Some(raw) = bounds.get("max").filter(|v| !v.is_null()) {
                let raw = scalar_to_string(raw)?;
                check_value_against_type(&value_type, &raw)?;
                max = Some(raw);
            }
            let map = node.as_object_mut().expect("element node is an object");
            match min {
                Some(raw) => {
                    map.insert("min".into(), Value::String(raw));
                }
                None => {
                    map.remove("min");
                }
            }
            match max {
                Some(raw) => {
                    map.insert("max".into(), Value::String(raw));
                }
                None => {
                    map.remove("max");
                }
            }
            Ok(())
        }
        "Blob" | "File" => {
            let raw = value
                .as_str()
                .ok_or_else(|| TitanError::BadRequest(format!("{model_type} value must be a string")))?;
            set_member(node, "value", Value::String(raw.to_string()))
        }
        "ReferenceElement" => {
            if !value.is_object() {
                return Err(TitanError::BadRequest(
                    "reference value must be a Reference object".into(),
                ));
            }
            set_member(node, "value", value.clone())
        }
        other => Err(TitanError::BadRequest(format!(
            "value-only update is not supported for {other}"
        ))),
    }
}

fn navigate_mut<'a>(doc: &'a mut Value, path: &IdShortPath) -> Result<&'a mut Value> {
    navigate(doc, path)?;
    let (prefix, last) = path.split_last();
    let children = resolve_parent_children_mut(doc, &prefix)?;
    let position = position_of(children, last)
        .ok_or_else(|| TitanError::ElementNotFound(path.to_string()))?;
    Ok(&mut children[position])
}

/// Like `resolve_children_mut` but tolerates a non-container prefix tail
/// never occurring: callers have already validated the path resolves.
fn resolve_parent_children_mut<'a>(
    doc: &'a mut Value,
    prefix: &IdShortPath,
) -> Result<&'a mut Vec<Value>> {
    if prefix.is_empty() {
        return doc
            .get_mut("submodelElements")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| TitanError::ElementNotFound(prefix.to_string()));
    }
    resolve_children_mut(doc, prefix)
}

fn position_of(children: &[Value], token: &PathToken) -> Option<usize> {
    match token {
        PathToken::IdShort(name) => children
            .iter()
            .position(|child| id_short_of(child) == Some(name.as_str())),
        PathToken::Index(index) => {
            if *index < children.len() {
                Some(*index)
            } else {
                None
            }
        }
    }
}

fn set_member(node: &mut Value, member: &str, value: Value) -> Result<()> {
    node.as_object_mut()
        .ok_or_else(|| TitanError::BadRequest("element node is not an object".into()))?
        .insert(member.to_string(), value);
    Ok(())
}

fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(TitanError::BadRequest(format!(
            "expected a scalar value, got {other}"
        ))),
    }
}

/// Accept both wire shapes for multi-language values: the `{lang: text}`
/// map and the stored `[{language, text}]` array.
fn lang_entries(value: &Value) -> Result<Vec<Value>> {
    match value {
        Value::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (language, text) in map {
                let text = text.as_str().ok_or_else(|| {
                    TitanError::BadRequest("language text must be a string".into())
                })?;
                entries.push(serde_json::json!({"language": language, "text": text}));
            }
            Ok(entries)
        }
        Value::Array(items) => {
            for item in items {
                let ok = item.get("language").map(Value::is_string).unwrap_or(false)
                    && item.get("text").map(Value::is_string).unwrap_or(false);
                if !ok {
                    return Err(TitanError::BadRequest(
                        "expected [{language, text}] entries".into(),
                    ));
                }
            }
            Ok(items.clone())
        }
        _ => Err(TitanError::BadRequest(
            "multi-language value must be an object or array".into(),
        )),
    }
}

fn check_value_against_type(value_type: &str, raw: &str) -> Result<()> {
    let ok = match value_type {
        "xs:double" | "xs:float" | "xs:decimal" => raw.parse::<f64>().is_ok(),
        "xs:int" | "xs:integer" | "xs:long" | "xs:short" | "xs:byte" => {
            raw.parse::<i64>().is_ok()
        }
        "xs:unsignedInt" | "xs:unsignedLong" | "xs:unsignedShort" | "xs:unsignedByte"
        | "xs:nonNegativeInteger" | "xs:positiveInteger" => raw.parse::<u64>().is_ok(),
        "xs:boolean" => matches!(raw, "true" | "false" | "1" | "0"),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(TitanError::BadRequest(format!(
            "value {raw:?} does not conform to {value_type}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "id": "urn:x:sm:1",
            "submodelElements": [
                {"modelType": "Property", "idShort": "T", "valueType": "xs:double", "value": "23.5"},
                {
                    "modelType": "SubmodelElementCollection",
                    "idShort": "Motor",
                    "value": [
                        {"modelType": "Property", "idShort": "Rpm", "valueType": "xs:int", "value": "1500"}
                    ]
                },
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
        })
    }

    fn path(raw: &str) -> IdShortPath {
        IdShortPath::parse(raw).unwrap()
    }

    #[test]
    fn test_insert_at_root_rejects_duplicates() {
        let mut d = doc();
        let dup = json!({"modelType": "Capability", "idShort": "T"});
        assert!(matches!(
            insert_element(&mut d, None, dup),
            Err(TitanError::ElementExists(_))
        ));
        let fresh = json!({"modelType": "Capability", "idShort": "Diag"});
        insert_element(&mut d, None, fresh).unwrap();
        assert!(navigate(&d, &path("Diag")).is_ok());
    }

    #[test]
    fn test_insert_into_collection() {
        let mut d = doc();
        let element = json!({"modelType": "Property", "idShort": "Torque", "valueType": "xs:double"});
        insert_element(&mut d, Some(&path("Motor")), element).unwrap();
        assert!(navigate(&d, &path("Motor.Torque")).is_ok());
    }

    #[test]
    fn test_insert_list_append_and_positional() {
        let mut d = doc();
        let element = json!({"modelType": "Property", "valueType": "xs:double", "value": "2.0"});
        insert_element(&mut d, Some(&path("Stack")), element).unwrap();
        assert_eq!(navigate(&d, &path("Stack[1]")).unwrap()["value"], "2.0");

        let head = json!({"modelType": "Property", "valueType": "xs:double", "value": "0.5"});
        insert_element(&mut d, Some(&path("Stack[0]")), head).unwrap();
        assert_eq!(navigate(&d, &path("Stack[0]")).unwrap()["value"], "0.5");
        assert_eq!(navigate(&d, &path("Stack[2]")).unwrap()["value"], "2.0");
    }

    #[test]
    fn test_insert_list_type_checked() {
        let mut d = doc();
        let wrong = json!({"modelType": "Capability", "idShort": "X"});
        assert!(insert_element(&mut d, Some(&path("Stack")), wrong).is_err());
        let wrong_vt = json!({"modelType": "Property", "valueType": "xs:int", "value": "1"});
        assert!(insert_element(&mut d, Some(&path("Stack")), wrong_vt).is_err());
    }

    #[test]
    fn test_insert_delete_restores_document() {
        let mut d = doc();
        let before = d.clone();
        let element = json!({"modelType": "Capability", "idShort": "Diag"});
        insert_element(&mut d, None, element).unwrap();
        delete_element(&mut d, &path("Diag")).unwrap();
        assert_eq!(d, before);
    }

    #[test]
    fn test_replace_element() {
        let mut d = doc();
        let replacement =
            json!({"modelType": "Property", "idShort": "T", "valueType": "xs:double", "value": "30.0"});
        replace_element(&mut d, &path("T"), replacement).unwrap();
        assert_eq!(navigate(&d, &path("T")).unwrap()["value"], "30.0");
    }

    #[test]
    fn test_replace_rejects_sibling_collision() {
        let mut d = doc();
        let renamed = json!({"modelType": "Property", "idShort": "Motor", "valueType": "xs:int"});
        assert!(matches!(
            replace_element(&mut d, &path("T"), renamed),
            Err(TitanError::ElementExists(_))
        ));
    }

    #[test]
    fn test_patch_merges_same_model_type() {
        let mut d = doc();
        patch_element(&mut d, &path("T"), &json!({"value": "24.1"})).unwrap();
        assert_eq!(navigate(&d, &path("T")).unwrap()["value"], "24.1");

        let type_change = json!({"modelType": "Range", "min": "0"});
        assert!(patch_element(&mut d, &path("T"), &type_change).is_err());
    }

    #[test]
    fn test_patch_null_removes_member() {
        let mut d = doc();
        patch_element(&mut d, &path("T"), &json!({"value": null})).unwrap();
        assert!(navigate(&d, &path("T")).unwrap().get("value").is_none());
    }

    #[test]
    fn test_delete_missing_element() {
        let mut d = doc();
        assert!(matches!(
            delete_element(&mut d, &path("Nope")),
            Err(TitanError::ElementNotFound(_))
        ));
    }

    #[test]
    fn test_update_property_value_typed() {
        let mut d = doc();
        update_element_value(&mut d, &path("T"), &json!("24.1")).unwrap();
        assert_eq!(navigate(&d, &path("T")).unwrap()["value"], "24.1");

        update_element_value(&mut d, &path("T"), &json!(25.5)).unwrap();
        assert_eq!(navigate(&d, &path("T")).unwrap()["value"], "25.5");

        assert!(matches!(
            update_element_value(&mut d, &path("T"), &json!("hot")),
            Err(TitanError::BadRequest(_))
        ));
    }

    #[test]
    fn test_update_value_in_list_member() {
        let mut d = doc();
        update_element_value(&mut d, &path("Stack[0]"), &json!("9.9")).unwrap();
        assert_eq!(navigate(&d, &path("Stack[0]")).unwrap()["value"], "9.9");
    }

    #[test]
    fn test_update_value_unsupported_type() {
        let mut d = doc();
        assert!(matches!(
            update_element_value(&mut d, &path("Motor"), &json!("x")),
            Err(TitanError::BadRequest(_))
        ));
    }
}

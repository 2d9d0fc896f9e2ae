// Structural validation applied by the repositories before anything is
// canonicalized and stored. These are the hard invariants of the data
// model; semantic-vocabulary checking is advisory and lives elsewhere.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TitanError};
use crate::model::{
    AssetAdministrationShell, ConceptDescription, Reference, Submodel, SubmodelElement,
};

static ID_SHORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("idShort pattern compiles"));

/// XSD types for which Range bounds are numerically comparable.
const NUMERIC_VALUE_TYPES: &[&str] = &[
    "xs:double",
    "xs:float",
    "xs:decimal",
    "xs:int",
    "xs:integer",
    "xs:long",
    "xs:short",
    "xs:byte",
    "xs:unsignedInt",
    "xs:unsignedLong",
    "xs:unsignedShort",
    "xs:unsignedByte",
    "xs:nonNegativeInteger",
    "xs:positiveInteger",
];

pub fn validate_id_short(id_short: &str) -> Result<()> {
    if ID_SHORT_RE.is_match(id_short) {
        Ok(())
    } else {
        Err(TitanError::BadRequest(format!(
            "invalid idShort {id_short:?}: must match ^[a-zA-Z_][a-zA-Z0-9_]*$"
        )))
    }
}

pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(TitanError::BadRequest("identifier must be non-empty".to_string()));
    }
    Ok(())
}

pub fn validate_reference(reference: &Reference) -> Result<()> {
    if reference.keys.is_empty() {
        return Err(TitanError::BadRequest("reference must have at least one key".to_string()));
    }
    if let Some(inner) = &reference.referred_semantic_id {
        validate_reference(inner)?;
    }
    Ok(())
}

pub fn validate_shell(shell: &AssetAdministrationShell) -> Result<()> {
    validate_identifier(&shell.id)?;
    if let Some(id_short) = &shell.id_short {
        validate_id_short(id_short)?;
    }
    if let Some(submodels) = &shell.submodels {
        for reference in submodels {
            validate_reference(reference)?;
        }
    }
    if let Some(derived) = &shell.derived_from {
        validate_reference(derived)?;
    }
    Ok(())
}

pub fn validate_submodel(submodel: &Submodel) -> Result<()> {
    validate_identifier(&submodel.id)?;
    if let Some(id_short) = &submodel.id_short {
        validate_id_short(id_short)?;
    }
    if let Some(semantic_id) = &submodel.semantic_id {
        validate_reference(semantic_id)?;
    }
    if let Some(elements) = &submodel.submodel_elements {
        validate_sibling_id_shorts(elements)?;
        for element in elements {
            validate_element(element)?;
        }
    }
    Ok(())
}

pub fn validate_concept_description(cd: &ConceptDescription) -> Result<()> {
    validate_identifier(&cd.id)?;
    if let Some(id_short) = &cd.id_short {
        validate_id_short(id_short)?;
    }
    if let Some(is_case_of) = &cd.is_case_of {
        for reference in is_case_of {
            validate_reference(reference)?;
        }
    }
    Ok(())
}

/// Validate one element and its subtree.
pub fn validate_element(element: &SubmodelElement) -> Result<()> {
    if let Some(id_short) = element.id_short() {
        validate_id_short(id_short)?;
    }
    if let Some(semantic_id) = &element.meta().semantic_id {
        validate_reference(semantic_id)?;
    }

    match element {
        SubmodelElement::Range(range) => {
            if NUMERIC_VALUE_TYPES.contains(&range.value_type.as_str()) {
                if let (Some(min), Some(max)) = (&range.min, &range.max) {
                    if let (Ok(min), Ok(max)) = (min.parse::<f64>(), max.parse::<f64>()) {
                        if min > max {
                            return Err(TitanError::BadRequest(format!(
                                "range min {min} exceeds max {max}"
                            )));
                        }
                    }
                }
            }
        }
        SubmodelElement::ReferenceElement(re) => {
            if let Some(value) = &re.value {
                validate_reference(value)?;
            }
        }
        SubmodelElement::RelationshipElement(rel) => {
            validate_reference(&rel.first)?;
            validate_reference(&rel.second)?;
        }
        SubmodelElement::AnnotatedRelationshipElement(rel) => {
            validate_reference(&rel.first)?;
            validate_reference(&rel.second)?;
            if let Some(annotations) = &rel.annotations {
                validate_sibling_id_shorts(annotations)?;
                for child in annotations {
                    validate_element(child)?;
                }
            }
        }
        SubmodelElement::SubmodelElementCollection(collection) => {
            if let Some(children) = &collection.value {
                validate_sibling_id_shorts(children)?;
                for child in children {
                    validate_element(child)?;
                }
            }
        }
        SubmodelElement::SubmodelElementList(list) => {
            if let Some(children) = &list.value {
                for child in children {
                    validate_list_member(list, child)?;
                    validate_element(child)?;
                }
            }
        }
        SubmodelElement::Entity(entity) => {
            if let Some(statements) = &entity.statements {
                validate_sibling_id_shorts(statements)?;
                for child in statements {
                    validate_element(child)?;
                }
            }
        }
        SubmodelElement::Operation(op) => {
            for variables in [&op.input_variables, &op.output_variables, &op.inoutput_variables]
                .into_iter()
                .flatten()
            {
                for variable in variables {
                    validate_element(&variable.value)?;
                }
            }
        }
        SubmodelElement::BasicEventElement(event) => {
            validate_reference(&event.observed)?;
        }
        _ => {}
    }
    Ok(())
}

/// A list member must match the declared element type, and for Property
/// members the declared value type.
pub fn validate_list_member(
    list: &crate::model::SubmodelElementList,
    member: &SubmodelElement,
) -> Result<()> {
    if member.model_type() != list.type_value_list_element {
        return Err(TitanError::BadRequest(format!(
            "list accepts {} elements, got {}",
            list.type_value_list_element,
            member.model_type()
        )));
    }
    if let (Some(expected), SubmodelElement::Property(property)) =
        (&list.value_type_list_element, member)
    {
        if &property.value_type != expected {
            return Err(TitanError::BadRequest(format!(
                "list valueTypeListElement is {expected}, property has {}",
                property.value_type
            )));
        }
    }
    Ok(())
}

/// Child idShorts must be unique within one parent scope.
pub fn validate_sibling_id_shorts(children: &[SubmodelElement]) -> Result<()> {
    let mut seen = HashSet::new();
    for child in children {
        if let Some(id_short) = child.id_short() {
            if !seen.insert(id_short) {
                return Err(TitanError::Conflict(format!(
                    "duplicate idShort {id_short:?} within parent"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(doc: serde_json::Value) -> SubmodelElement {
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn test_id_short_pattern() {
        assert!(validate_id_short("Temperature").is_ok());
        assert!(validate_id_short("_internal9").is_ok());
        assert!(validate_id_short("9lives").is_err());
        assert!(validate_id_short("with-dash").is_err());
        assert!(validate_id_short("").is_err());
    }

    #[test]
    fn test_duplicate_sibling_id_shorts() {
        let children = vec![
            element(json!({"modelType": "Capability", "idShort": "A"})),
            element(json!({"modelType": "Capability", "idShort": "A"})),
        ];
        assert!(matches!(
            validate_sibling_id_shorts(&children),
            Err(TitanError::Conflict(_))
        ));
    }

    #[test]
    fn test_range_bounds() {
        let bad = element(json!({
            "modelType": "Range", "idShort": "R",
            "valueType": "xs:int", "min": "10", "max": "2"
        }));
        assert!(validate_element(&bad).is_err());

        let ok = element(json!({
            "modelType": "Range", "idShort": "R",
            "valueType": "xs:int", "min": "2", "max": "10"
        }));
        assert!(validate_element(&ok).is_ok());

        // Non-numeric value types are not compared.
        let strings = element(json!({
            "modelType": "Range", "idShort": "R",
            "valueType": "xs:string", "min": "z", "max": "a"
        }));
        assert!(validate_element(&strings).is_ok());
    }

    #[test]
    fn test_list_member_type_mismatch() {
        let bad = element(json!({
            "modelType": "SubmodelElementList", "idShort": "L",
            "typeValueListElement": "Property",
            "value": [{"modelType": "Capability"}]
        }));
        assert!(validate_element(&bad).is_err());
    }

    #[test]
    fn test_list_property_value_type() {
        let bad = element(json!({
            "modelType": "SubmodelElementList", "idShort": "L",
            "typeValueListElement": "Property",
            "valueTypeListElement": "xs:double",
            "value": [{"modelType": "Property", "valueType": "xs:int", "value": "1"}]
        }));
        assert!(validate_element(&bad).is_err());
    }

    #[test]
    fn test_reference_needs_keys() {
        let bad = element(json!({
            "modelType": "ReferenceElement", "idShort": "Ref",
            "value": {"type": "ExternalReference", "keys": []}
        }));
        assert!(validate_element(&bad).is_err());
    }
}

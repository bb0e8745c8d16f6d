//! Post-render object transforms
//!
//! Every rendered object passes through the registered transforms before it
//! is applied: ownership labels, the do-not-edit disclaimer, component and
//! managed-by markers. Transforms receive the owning Manifest (as a dynamic
//! object) and mutate the rendered set in place.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::labels;

/// A transformation applied to the rendered object set before apply
pub type ObjectTransform = fn(&DynamicObject, &mut Vec<DynamicObject>) -> Result<()>;

/// Disclaimer stamped on every applied object
const DISCLAIMER: &str = "DO NOT EDIT - This resource is applied and reconciled by the \
                          manifest operator.\nAny modifications are discarded and the resource \
                          is reverted to the rendered state.";

/// The transform chain applied to every install
pub fn default_transforms() -> Vec<ObjectTransform> {
    vec![
        owner_transform,
        disclaimer_transform,
        component_transform,
        managed_by_transform,
    ]
}

/// Stamp the owning Manifest's key on each object
pub fn owner_transform(owner: &DynamicObject, objects: &mut Vec<DynamicObject>) -> Result<()> {
    let value = labels::owned_by_value(
        &owner.namespace().unwrap_or_default(),
        &owner.name_any(),
    );
    for object in objects {
        object
            .labels_mut()
            .insert(labels::OWNED_BY.to_string(), value.clone());
    }
    Ok(())
}

/// Warn against manual edits of applied objects
pub fn disclaimer_transform(_owner: &DynamicObject, objects: &mut Vec<DynamicObject>) -> Result<()> {
    for object in objects {
        object
            .annotations_mut()
            .insert(labels::DISCLAIMER_ANNOTATION.to_string(), DISCLAIMER.to_string());
    }
    Ok(())
}

/// Mark each object with its component and the part-of label
pub fn component_transform(owner: &DynamicObject, objects: &mut Vec<DynamicObject>) -> Result<()> {
    let component = owner.name_any();
    for object in objects {
        let object_labels = object.labels_mut();
        object_labels.insert("app.kubernetes.io/component".to_string(), component.clone());
        object_labels.insert(
            "app.kubernetes.io/part-of".to_string(),
            labels::OPERATOR_NAME.to_string(),
        );
    }
    Ok(())
}

/// Mark each object as managed by this operator
pub fn managed_by_transform(_owner: &DynamicObject, objects: &mut Vec<DynamicObject>) -> Result<()> {
    for object in objects {
        object
            .labels_mut()
            .insert(labels::MANAGED_BY.to_string(), labels::OPERATOR_NAME.to_string());
    }
    Ok(())
}

/// Parse a multi-document manifest into dynamic objects.
///
/// Empty and null documents are dropped; documents that do not carry
/// apiVersion/kind (raw blobs) are skipped.
pub fn parse_manifest_objects(manifest: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_json::Value::deserialize(document)
            .map_err(|err| Error::serialization(format!("invalid YAML document: {err}")))?;
        if value.is_null() {
            continue;
        }
        if !value.is_object() {
            debug!("skipping non-object manifest document");
            continue;
        }
        if value.get("apiVersion").is_none() || value.get("kind").is_none() {
            debug!("skipping manifest document without apiVersion/kind");
            continue;
        }
        let object: DynamicObject = serde_json::from_value(value)
            .map_err(|err| Error::serialization(format!("invalid manifest object: {err}")))?;
        objects.push(object);
    }
    Ok(objects)
}

/// Parse a rendered manifest and run the transform chain over it
pub fn build_target_objects(
    manifest: &str,
    transforms: &[ObjectTransform],
    owner: &DynamicObject,
) -> Result<Vec<DynamicObject>> {
    let mut objects = parse_manifest_objects(manifest)?;
    for transform in transforms {
        transform(owner, &mut objects)?;
    }
    Ok(objects)
}

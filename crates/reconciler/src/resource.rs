//! Typed view over stored objects.

use std::collections::BTreeMap;

use fleet_store::{DynamicObject, GroupVersionKind, ObjectKey, ObjectMeta};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::status::Status;

/// A kind managed by the engine.
///
/// Implementors serialize as an object with `metadata`, `spec` and `status`
/// fields; the default conversions rely on that shape.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind identity in the store.
    fn gvk() -> GroupVersionKind;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn status(&self) -> &Status;

    fn status_mut(&mut self) -> &mut Status;

    /// Labels every pass makes sure are present.
    fn ensured_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Annotations every pass makes sure are present.
    fn ensured_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    fn to_dynamic(&self) -> Result<DynamicObject> {
        let mut value = serde_json::to_value(self)?;
        let spec = value.get_mut("spec").map(Value::take).unwrap_or(Value::Null);
        Ok(DynamicObject {
            gvk: Self::gvk(),
            metadata: self.metadata().clone(),
            spec,
            status: serde_json::to_value(self.status())?,
        })
    }

    fn from_dynamic(object: DynamicObject) -> Result<Self> {
        let mut fields = serde_json::Map::new();
        fields.insert("metadata".into(), serde_json::to_value(&object.metadata)?);
        // Missing parts fall back to the implementor's serde defaults.
        if !object.spec.is_null() {
            fields.insert("spec".into(), object.spec);
        }
        if !object.status.is_null() {
            fields.insert("status".into(), object.status);
        }
        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

//! Per-pass scratch values shared between steps.

use std::any::Any;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Typed key/value cache owned by one request.
///
/// Nothing here is persisted; a later pass starts empty.
#[derive(Default)]
pub struct Locals {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Locals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Borrow the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocalNotFound`] when the key was never set and
    /// [`Error::LocalTypeMismatch`] when it holds another type.
    pub fn get<V: Any>(&self, key: &str) -> Result<&V> {
        self.values
            .get(key)
            .ok_or_else(|| Error::local_not_found(key))?
            .downcast_ref::<V>()
            .ok_or_else(|| Error::LocalTypeMismatch {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for Locals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

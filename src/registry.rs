//! Static lookup from an action type identifier to its output codec.
//!
//! The registry is built once during process warm-up and injected into the
//! [`TaskManager`](crate::tasks::TaskManager); there is no global table and
//! no runtime mutation. Worker processes build their own registry from the
//! same registrations.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{JsonCodec, OutputCodec};

/// Immutable map of `registry_id` to output codec.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    inner: Arc<HashMap<String, Arc<dyn OutputCodec>>>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Codec for the given registry id, or `None` when the action type has
    /// no declared output.
    pub fn output_codec(&self, registry_id: &str) -> Option<Arc<dyn OutputCodec>> {
        let codec = self.inner.get(registry_id).cloned();
        if codec.is_none() {
            tracing::debug!(
                registry_id = %registry_id,
                registered_count = self.inner.len(),
                registered_ids = ?self.list_ids(),
                "registry lookup miss"
            );
        }
        codec
    }

    pub fn has(&self, registry_id: &str) -> bool {
        self.inner.contains_key(registry_id)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

/// Builder collecting registrations; duplicates accumulate as errors.
pub struct ActionRegistryBuilder {
    map: HashMap<String, Arc<dyn OutputCodec>>,
    errors: Vec<String>,
}

impl ActionRegistryBuilder {
    /// Register a JSON output codec for `T` under the given registry id.
    pub fn register<T>(self, registry_id: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register_codec(registry_id, Arc::new(JsonCodec::<T>::new()))
    }

    /// Register a custom codec under the given registry id.
    pub fn register_codec(mut self, registry_id: impl Into<String>, codec: Arc<dyn OutputCodec>) -> Self {
        let registry_id = registry_id.into();
        if self.map.contains_key(&registry_id) {
            self.errors.push(format!("duplicate action registration: {registry_id}"));
            return self;
        }
        self.map.insert(registry_id, codec);
        self
    }

    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, failing if any registration was rejected.
    ///
    /// # Errors
    ///
    /// Returns the accumulated registration errors joined with `; `.
    pub fn build_result(self) -> Result<ActionRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Output {
        value: i64,
    }

    #[test]
    fn lookup_hits_and_misses() {
        let registry = ActionRegistry::builder().register::<Output>("demo.add").build();
        assert!(registry.has("demo.add"));
        assert!(registry.output_codec("demo.add").is_some());
        assert!(registry.output_codec("demo.unknown").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let result = ActionRegistry::builder()
            .register::<Output>("demo.add")
            .register::<Output>("demo.add")
            .build_result();
        let err = result.err().unwrap();
        assert!(err.contains("duplicate action registration: demo.add"));
    }

    #[test]
    fn registered_codec_decodes() {
        let registry = ActionRegistry::builder().register::<Output>("demo.add").build();
        let codec = registry.output_codec("demo.add").unwrap();
        let value = codec.decode(r#"{"value":3}"#).unwrap();
        assert_eq!(value.as_json(), &serde_json::json!({"value": 3}));
    }
}

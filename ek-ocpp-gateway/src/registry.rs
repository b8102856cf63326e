//! Per-operation dispatch descriptors
//!
//! Everything that varies between operations, other than their payload
//! types, lives here keyed by [`Action`]: serializer overrides for nested
//! sub-objects, an optional per-operation timeout, and post-success hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use crate::ocpp::Action;

/// Rewrites one nested sub-object during serialization
pub type FieldSerializer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Serialization strategies keyed by the name of the sub-object they apply to
#[derive(Clone, Default)]
pub struct SerializerOverrides {
    by_field: HashMap<String, FieldSerializer>,
}

impl fmt::Debug for SerializerOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_field.keys()).finish()
    }
}

impl SerializerOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `serializer` for every member named `field`, at any depth
    ///
    /// The serializer receives the member exactly as serde produced it. The
    /// outermost match wins: nothing inside a rewritten member is visited,
    /// so a sub-object may reuse its own name for a scalar field.
    pub fn with(
        mut self,
        field: impl Into<String>,
        serializer: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.by_field.insert(field.into(), Arc::new(serializer));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_field.is_empty()
    }

    /// Apply the registered strategies to a serialized payload
    pub fn apply(&self, value: Value) -> Value {
        if self.is_empty() {
            return value;
        }
        self.rewrite(value)
    }

    fn rewrite(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, child)| {
                        let child = match self.by_field.get(&key) {
                            Some(serializer) => serializer(child),
                            None => self.rewrite(child),
                        };
                        (key, child)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.rewrite(v)).collect()),
            other => other,
        }
    }
}

/// Side effect run after a successful response to one operation
pub trait ResponseHook: Send + Sync {
    fn on_success(&self, action: Action, payload: &Value);
}

/// Everything the engine needs to know about one operation beyond its types
#[derive(Clone, Default)]
pub struct OperationDescriptor {
    pub serializers: SerializerOverrides,
    pub timeout: Option<Duration>,
    pub hooks: Vec<Arc<dyn ResponseHook>>,
}

/// Descriptor table shared by all dispatches
#[derive(Default)]
pub struct OperationRegistry {
    descriptors: RwLock<HashMap<Action, OperationDescriptor>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_serializers(&self, action: Action, serializers: SerializerOverrides) {
        self.descriptors.write().entry(action).or_default().serializers = serializers;
    }

    pub fn set_timeout(&self, action: Action, timeout: Duration) {
        self.descriptors.write().entry(action).or_default().timeout = Some(timeout);
    }

    pub fn add_hook(&self, action: Action, hook: Arc<dyn ResponseHook>) {
        self.descriptors.write().entry(action).or_default().hooks.push(hook);
    }

    /// Descriptor for an action; operations without one get the defaults
    pub fn descriptor(&self, action: Action) -> OperationDescriptor {
        self.descriptors
            .read()
            .get(&action)
            .cloned()
            .unwrap_or_default()
    }
}

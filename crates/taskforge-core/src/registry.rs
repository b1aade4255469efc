//! Handler registry -- a named collection of available task handlers.
//!
//! The dispatcher looks up a handler by task type at dispatch time. There
//! is no directory-walking or plugin-discovery step: every handler is
//! registered explicitly from the composition root at startup.

use std::collections::HashMap;

use taskforge_db::models::TaskType;

use crate::handler::TaskHandler;

/// A collection of registered [`TaskHandler`] implementations, keyed by
/// [`TaskType`].
///
/// # Example
///
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register(TaskType::DatabaseCleanup, DatabaseCleanupHandler::new());
/// let handler = registry.get(TaskType::DatabaseCleanup).unwrap();
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Box<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `task_type`.
    ///
    /// If a handler is already registered for that type, it is replaced
    /// and the old one is returned.
    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: impl TaskHandler + 'static,
    ) -> Option<Box<dyn TaskHandler>> {
        self.handlers.insert(task_type, Box::new(handler))
    }

    /// Look up the handler for `task_type`.
    pub fn get(&self, task_type: TaskType) -> Option<&dyn TaskHandler> {
        self.handlers.get(&task_type).map(|b| b.as_ref())
    }

    /// List the task types with a registered handler.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field(
                "handlers",
                &self.handlers.keys().map(|t| t.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// Compile-time assertion: TaskHandler must be object-safe, since the
// registry stores it as `Box<dyn TaskHandler>`.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::reporter::ProgressReporter;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct FakeHandler {
        handler_name: &'static str,
    }

    #[async_trait]
    impl TaskHandler for FakeHandler {
        async fn execute(&self, _input: &Value, _reporter: &ProgressReporter) -> Result<Value> {
            Ok(json!({"ok": true}))
        }

        fn name(&self) -> &'static str {
            self.handler_name
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        let old = registry.register(
            TaskType::DatabaseCleanup,
            FakeHandler {
                handler_name: "database_cleanup",
            },
        );
        assert!(old.is_none());

        let handler = registry.get(TaskType::DatabaseCleanup);
        assert!(handler.is_some());
        assert_eq!(handler.unwrap().name(), "database_cleanup");
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            TaskType::DatabaseCleanup,
            FakeHandler {
                handler_name: "first",
            },
        );
        let old = registry.register(
            TaskType::DatabaseCleanup,
            FakeHandler {
                handler_name: "second",
            },
        );
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(TaskType::DatabaseCleanup).unwrap().name(), "second");
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(TaskType::InventoryAudit).is_none());
    }
}

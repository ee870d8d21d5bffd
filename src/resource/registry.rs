//! Resource type registry.
//!
//! A process-wide table mapping a [`TypeId`] to the factory that builds its
//! state machine. Registration happens during startup and the table is
//! frozen before the first network request is accepted; lookups after the
//! freeze take no locks on the registration path's behalf.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;

use crate::error::{CoordError, CoordResult};
use crate::machine::StateMachine;
use crate::types::TypeId;

/// Builds a fresh state machine for a resource type.
pub type MachineFactory = std::sync::Arc<dyn Fn() -> Box<dyn StateMachine> + Send + Sync>;

/// Registry of resource types available on this replica.
pub struct ResourceTypeRegistry {
    factories: RwLock<HashMap<TypeId, MachineFactory>>,
    frozen: AtomicBool,
}

impl ResourceTypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// A registry with the built-in `value` and `counter` types registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry
            .register(super::value::VALUE_TYPE, std::sync::Arc::new(|| {
                Box::new(super::value::ValueMachine::new()) as Box<dyn StateMachine>
            }))
            .expect("fresh registry accepts builtins");
        registry
            .register(super::counter::COUNTER_TYPE, std::sync::Arc::new(|| {
                Box::new(super::counter::CounterMachine::new()) as Box<dyn StateMachine>
            }))
            .expect("fresh registry accepts builtins");
        registry
    }

    /// Register a factory for `type_id`.
    ///
    /// Fails once the registry is frozen or if the type is already taken.
    pub fn register(&self, type_id: TypeId, factory: MachineFactory) -> CoordResult<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(CoordError::IllegalMemberState(format!(
                "registry is frozen; cannot register type {type_id}"
            )));
        }
        let mut factories = self.factories.write().expect("registry lock poisoned");
        if factories.contains_key(&type_id) {
            return Err(CoordError::Protocol(format!(
                "resource type {type_id} already registered"
            )));
        }
        factories.insert(type_id, factory);
        Ok(())
    }

    /// Close registration. Idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Instantiate a machine of the given type.
    pub fn create(&self, type_id: TypeId) -> CoordResult<Box<dyn StateMachine>> {
        let factories = self.factories.read().expect("registry lock poisoned");
        match factories.get(&type_id) {
            Some(factory) => Ok(factory()),
            None => Err(CoordError::UnknownType(type_id)),
        }
    }

    /// Whether `type_id` has a registered factory.
    pub fn contains(&self, type_id: TypeId) -> bool {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .contains_key(&type_id)
    }
}

impl Default for ResourceTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry, pre-populated with the built-in types.
///
/// Servers freeze it before accepting their first request.
pub fn global() -> &'static ResourceTypeRegistry {
    static GLOBAL: Lazy<ResourceTypeRegistry> = Lazy::new(ResourceTypeRegistry::with_builtins);
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::counter::COUNTER_TYPE;
    use crate::resource::value::VALUE_TYPE;

    #[test]
    fn test_builtins_are_registered() {
        let registry = ResourceTypeRegistry::with_builtins();
        assert!(registry.contains(VALUE_TYPE));
        assert!(registry.contains(COUNTER_TYPE));
        assert!(registry.create(VALUE_TYPE).is_ok());
    }

    #[test]
    fn test_unknown_type_fails() {
        let registry = ResourceTypeRegistry::new();
        assert!(matches!(
            registry.create(TypeId::new(42)),
            Err(CoordError::UnknownType(t)) if t == TypeId::new(42)
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ResourceTypeRegistry::with_builtins();
        let result = registry.register(
            VALUE_TYPE,
            std::sync::Arc::new(|| {
                Box::new(super::super::value::ValueMachine::new()) as Box<dyn StateMachine>
            }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_frozen_registry_rejects_registration() {
        let registry = ResourceTypeRegistry::new();
        registry.freeze();
        assert!(registry.is_frozen());

        let result = registry.register(
            TypeId::new(9),
            std::sync::Arc::new(|| {
                Box::new(super::super::value::ValueMachine::new()) as Box<dyn StateMachine>
            }),
        );
        assert!(matches!(result, Err(CoordError::IllegalMemberState(_))));
    }
}

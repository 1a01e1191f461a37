//! Component registry
//!
//! Tracks the components registered on an engine, their declared writable
//! properties, and the change handlers attached to them. Writable properties
//! are a static declaration made at registration time; only declared
//! properties receive automatic acknowledgements.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::ack::AckOverrides;
use crate::error::{TwinError, TwinResult};
use crate::types::TwinVersion;

/// Handler invoked with a component's full desired delta
///
/// Receives `(component_delta, version)`. Errors are logged by the dispatch
/// layer and do not abort processing of other components or properties.
/// Handlers are `Arc` so the engine can clone them out of the registry and
/// invoke them without holding the registry lock; a handler may therefore
/// call back into the engine or its component handle.
pub type ComponentHandler = Arc<dyn Fn(&Value, TwinVersion) -> TwinResult<()> + Send + Sync>;

/// Handler invoked with a single writable property's new value
///
/// Receives `(value, version)`. Returning `Ok(None)` accepts the change with
/// the default acknowledgement; `Ok(Some(overrides))` customizes the success
/// envelope; `Err` produces a failure (400) acknowledgement. `Arc` for the
/// same reason as [`ComponentHandler`].
pub type PropertyHandler =
    Arc<dyn Fn(&Value, TwinVersion) -> TwinResult<Option<AckOverrides>> + Send + Sync>;

/// A registered component: a named, independently addressable subtree of the
/// twin with its own writable-property set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Unique component key
    pub key: String,
    /// Property names eligible for automatic acknowledgement
    pub writable_properties: Vec<String>,
}

impl Component {
    /// Whether a property name is declared writable for this component
    pub fn is_writable(&self, property: &str) -> bool {
        self.writable_properties.iter().any(|p| p == property)
    }
}

/// Registry entry: the component plus its attached handlers
///
/// Cloning shares the handler objects.
#[derive(Clone)]
pub struct ComponentEntry {
    component: Component,
    component_handler: Option<ComponentHandler>,
    property_handlers: HashMap<String, PropertyHandler>,
}

impl ComponentEntry {
    /// The registered component
    pub fn component(&self) -> &Component {
        &self.component
    }

    /// The component-level handler, if one is attached
    pub fn component_handler(&self) -> Option<&ComponentHandler> {
        self.component_handler.as_ref()
    }

    /// The handler attached to a property, if any
    pub fn property_handler(&self, property: &str) -> Option<&PropertyHandler> {
        self.property_handlers.get(property)
    }
}

/// Registry of components owned by one engine instance
///
/// Components are created at registration and never removed (a component's
/// reported state can be cleared, but the registration stays). At most one
/// component handler per component and one property handler per
/// (component, property) pair; later registration overwrites earlier.
///
/// Cloning snapshots the current entries (handlers are shared). The engine
/// dispatches against such a snapshot so user handlers run with the registry
/// lock released.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    entries: HashMap<String, ComponentEntry>,
}

impl ComponentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component with its writable-property declaration
    ///
    /// # Errors
    ///
    /// Returns `TwinError::DuplicateComponent` if the key is already
    /// registered. Silent replacement would orphan handlers attached to the
    /// existing entry.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        writable_properties: Vec<String>,
    ) -> TwinResult<Component> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(TwinError::DuplicateComponent(key));
        }

        let component = Component {
            key: key.clone(),
            writable_properties,
        };
        self.entries.insert(
            key,
            ComponentEntry {
                component: component.clone(),
                component_handler: None,
                property_handlers: HashMap::new(),
            },
        );
        Ok(component)
    }

    /// Look up a registered component by key
    pub fn lookup(&self, key: &str) -> Option<&ComponentEntry> {
        self.entries.get(key)
    }

    /// Whether a component key is registered
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of registered components
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all registered entries
    pub fn entries(&self) -> impl Iterator<Item = &ComponentEntry> {
        self.entries.values()
    }

    /// Attach a component-level handler, replacing any existing one
    ///
    /// # Errors
    ///
    /// Returns `TwinError::ComponentNotFound` if the key is not registered.
    pub fn set_component_handler(
        &mut self,
        key: &str,
        handler: ComponentHandler,
    ) -> TwinResult<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| TwinError::ComponentNotFound(key.to_string()))?;
        entry.component_handler = Some(handler);
        Ok(())
    }

    /// Attach a property-level handler, replacing any existing one for the
    /// same (component, property) pair
    ///
    /// # Errors
    ///
    /// Returns `TwinError::ComponentNotFound` if the key is not registered.
    pub fn set_property_handler(
        &mut self,
        key: &str,
        property: impl Into<String>,
        handler: PropertyHandler,
    ) -> TwinResult<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| TwinError::ComponentNotFound(key.to_string()))?;
        entry.property_handlers.insert(property.into(), handler);
        Ok(())
    }
}

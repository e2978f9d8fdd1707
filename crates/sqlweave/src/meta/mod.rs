//! Type metadata: compiled accessor tables
//!
//! There is no runtime reflection here. Application types are described once
//! as [`TypeDescriptor`]s — ordered properties with declared types, a
//! case-insensitive name index, and an optional positional constructor — and
//! the [`MetaRegistry`] serves cached descriptors for the process lifetime.
//! Types without a descriptor fall back to free-form object semantics where
//! every property is readable and writable.

pub mod path;

use indexmap::IndexMap;
use sqlweave_rdbc::{DriverType, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::convert::AppType;
use crate::error::{Error, Result};

/// One described property
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    /// Property name
    pub name: String,
    /// Declared application type
    pub app_type: AppType,
    /// Declared driver type hint
    pub driver_type: DriverType,
    /// Whether reads are allowed
    pub readable: bool,
    /// Whether writes are allowed
    pub writable: bool,
}

/// Compiled accessor table for one named application type
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    name: String,
    properties: IndexMap<String, PropertyDescriptor>,
    upper_index: HashMap<String, String>,
    constructor: Option<Vec<String>>,
}

impl TypeDescriptor {
    /// Start building a descriptor for the given type name
    pub fn builder(name: impl Into<String>) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            name: name.into(),
            properties: IndexMap::new(),
            constructor: None,
            conflict: None,
        }
    }

    /// The described type's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Properties in declaration order
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.values()
    }

    /// Names of readable properties
    pub fn readable_properties(&self) -> Vec<&str> {
        self.properties
            .values()
            .filter(|p| p.readable)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Names of writable properties
    pub fn writable_properties(&self) -> Vec<&str> {
        self.properties
            .values()
            .filter(|p| p.writable)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Exact-name lookup
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    /// Case-insensitive lookup, optionally mapping underscores to camel case
    /// first (`user_name` finds `userName`).
    pub fn find_property(&self, name: &str, map_underscore: bool) -> Option<&PropertyDescriptor> {
        let candidate = if map_underscore {
            name.replace('_', "")
        } else {
            name.to_string()
        };
        let actual = self.upper_index.get(&candidate.to_uppercase())?;
        self.properties.get(actual)
    }

    /// Positional constructor property names, if declared
    pub fn constructor(&self) -> Option<&[String]> {
        self.constructor.as_deref()
    }

    /// A default instance: an object holding every writable property as null
    pub fn create_default(&self) -> Value {
        Value::Object(
            self.properties
                .values()
                .filter(|p| p.writable)
                .map(|p| (p.name.clone(), Value::Null))
                .collect(),
        )
    }
}

/// Builder for [`TypeDescriptor`]
pub struct TypeDescriptorBuilder {
    name: String,
    properties: IndexMap<String, PropertyDescriptor>,
    constructor: Option<Vec<String>>,
    conflict: Option<String>,
}

impl TypeDescriptorBuilder {
    /// Declare a readable, writable property
    pub fn property(self, name: impl Into<String>, app_type: AppType) -> Self {
        self.property_full(name, app_type, DriverType::Undefined, true, true)
    }

    /// Declare a read-only property
    pub fn read_only(self, name: impl Into<String>, app_type: AppType) -> Self {
        self.property_full(name, app_type, DriverType::Undefined, true, false)
    }

    /// Declare a property with full control
    pub fn property_full(
        mut self,
        name: impl Into<String>,
        app_type: AppType,
        driver_type: DriverType,
        readable: bool,
        writable: bool,
    ) -> Self {
        let name = name.into();
        if let Some(existing) = self.properties.get(&name) {
            if existing.app_type != app_type {
                self.conflict = Some(format!(
                    "property '{}' of '{}' declared as both {:?} and {:?}",
                    name, self.name, existing.app_type, app_type
                ));
            }
            return self;
        }
        self.properties.insert(
            name.clone(),
            PropertyDescriptor {
                name,
                app_type,
                driver_type,
                readable,
                writable,
            },
        );
        self
    }

    /// Declare the positional constructor signature
    pub fn constructor(mut self, properties: Vec<String>) -> Self {
        self.constructor = Some(properties);
        self
    }

    /// Finish the descriptor. Conflicting duplicate declarations and
    /// constructor references to undeclared properties are rejected.
    pub fn build(self) -> Result<TypeDescriptor> {
        if let Some(conflict) = self.conflict {
            return Err(Error::ambiguous(conflict));
        }
        if let Some(ctor) = &self.constructor {
            for prop in ctor {
                if !self.properties.contains_key(prop) {
                    return Err(Error::missing_property(&self.name, prop));
                }
            }
        }
        let upper_index = self
            .properties
            .keys()
            .map(|k| (k.to_uppercase(), k.clone()))
            .collect();
        Ok(TypeDescriptor {
            name: self.name,
            properties: self.properties,
            upper_index,
            constructor: self.constructor,
        })
    }
}

/// Process-wide descriptor cache keyed by type name
#[derive(Default)]
pub struct MetaRegistry {
    descriptors: parking_lot::RwLock<HashMap<String, Arc<TypeDescriptor>>>,
}

impl MetaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one for the same name
    pub fn register(&self, descriptor: TypeDescriptor) {
        self.descriptors
            .write()
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
    }

    /// Fetch a descriptor by type name
    pub fn descriptor(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.descriptors.read().get(name).cloned()
    }

    /// Whether a descriptor exists for the name
    pub fn describes(&self, name: &str) -> bool {
        self.descriptors.read().contains_key(name)
    }
}

/// Convert `under_score` column names to `camelCase` property names.
pub fn underscore_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_descriptor() -> TypeDescriptor {
        TypeDescriptor::builder("User")
            .property("id", AppType::I64)
            .property("userName", AppType::String)
            .read_only("version", AppType::I32)
            .build()
            .unwrap()
    }

    #[test]
    fn readable_and_writable_sets() {
        let d = user_descriptor();
        assert_eq!(d.readable_properties(), vec!["id", "userName", "version"]);
        assert_eq!(d.writable_properties(), vec!["id", "userName"]);
    }

    #[test]
    fn case_insensitive_lookup() {
        let d = user_descriptor();
        assert!(d.find_property("USERNAME", false).is_some());
        assert!(d.find_property("user_name", true).is_some());
        assert!(d.find_property("user_name", false).is_none());
        assert!(d.find_property("missing", true).is_none());
    }

    #[test]
    fn default_instance_holds_writable_nulls() {
        let d = user_descriptor();
        let v = d.create_default();
        let map = v.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("id"), Some(&Value::Null));
        assert!(!map.contains_key("version"));
    }

    #[test]
    fn conflicting_duplicate_declaration_is_ambiguous() {
        let err = TypeDescriptor::builder("User")
            .property("id", AppType::I64)
            .property("id", AppType::String)
            .build()
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ReflectionAmbiguous);
    }

    #[test]
    fn constructor_must_reference_declared_properties() {
        let err = TypeDescriptor::builder("User")
            .property("id", AppType::I64)
            .constructor(vec!["id".into(), "ghost".into()])
            .build()
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ReflectionMissing);
    }

    #[test]
    fn registry_caches_descriptors() {
        let registry = MetaRegistry::new();
        registry.register(user_descriptor());
        assert!(registry.describes("User"));
        let d = registry.descriptor("User").unwrap();
        assert_eq!(d.name(), "User");
        assert!(registry.descriptor("Ghost").is_none());
    }

    #[test]
    fn underscore_to_camel_conversion() {
        assert_eq!(underscore_to_camel("user_name"), "userName");
        assert_eq!(underscore_to_camel("ID"), "id");
        assert_eq!(underscore_to_camel("a_b_c"), "aBC");
    }
}

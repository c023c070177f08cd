use std::collections::BTreeMap;

use super::value::Variant;
use super::{Result, StoreError};

/// Property holding an instance's object path, used to address method calls.
pub const PATH_PROPERTY: &str = "__PATH";

/// Class name given to method parameter instances.
pub const PARAMETERS_CLASS: &str = "__PARAMETERS";

/// A remote object: a class name and a bag of named properties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instance {
    class: String,
    properties: BTreeMap<String, Variant>,
}

impl Instance {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn get(&self, name: &str) -> Option<&Variant> {
        self.properties.get(name)
    }

    pub fn put(&mut self, name: impl Into<String>, value: Variant) {
        self.properties.insert(name.into(), value);
    }

    /// Builder form of [`Instance::put`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.put(name, value.into());
        self
    }

    /// Object path of this instance, if the provider supplied one.
    pub fn path(&self) -> Option<String> {
        self.get(PATH_PROPERTY).and_then(Variant::as_string)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keep only the named properties (plus the object path).
    pub fn project(&self, fields: &[String]) -> Self {
        let properties = self
            .properties
            .iter()
            .filter(|(name, _)| {
                name.as_str() == PATH_PROPERTY
                    || fields.iter().any(|f| f.eq_ignore_ascii_case(name))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            class: self.class.clone(),
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub in_params: Vec<String>,
    pub out_params: Vec<String>,
}

/// Class definition as returned by the provider: the class name and the
/// signatures of the methods it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassObject {
    name: String,
    methods: BTreeMap<String, MethodSignature>,
}

impl ClassObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn with_method(mut self, name: &str, in_params: &[&str], out_params: &[&str]) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodSignature {
                name: name.to_string(),
                in_params: in_params.iter().map(|p| p.to_string()).collect(),
                out_params: out_params.iter().map(|p| p.to_string()).collect(),
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&MethodSignature> {
        self.methods.get(name)
    }

    /// Create an empty in-parameter instance for `method`.
    ///
    /// Every declared parameter starts out as [`Variant::Empty`].
    pub fn spawn_in_params(&self, method: &str) -> Result<Instance> {
        let signature = self.method(method).ok_or_else(|| {
            StoreError::NotFound(format!("method '{}' on class '{}'", method, self.name))
        })?;

        let mut params = Instance::new(PARAMETERS_CLASS);
        for name in &signature.in_params {
            params.put(name.clone(), Variant::Empty);
        }
        Ok(params)
    }
}

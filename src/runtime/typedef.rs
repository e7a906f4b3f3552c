//! The recursive type grammar for ports
//!
//! A [`TypeDef`] describes the shape of a port tree: scalar leaves,
//! streams with exactly one child, maps with named children, and named
//! generics that must be substituted away before execution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::error::{Result, RuntimeError};
use super::expr::expand_expression;
use super::value::{Properties, Value};

/// Bindings from generic identifiers to concrete types
pub type Generics = BTreeMap<String, TypeDef>;

/// Schema for an operator's properties, one type per property name
pub type TypeDefMap = BTreeMap<String, TypeDef>;

/// Discriminant of a type definition node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    /// Any scalar value
    Primitive,
    /// Any value; used for pure synchronization inputs
    Trigger,
    /// Floating point number
    Number,
    /// UTF-8 string
    String,
    /// Boolean
    Boolean,
    /// Raw bytes
    Binary,
    /// Ordered sequence of one child type
    Stream,
    /// Named children, keys unique
    Map,
    /// Named type variable, resolved at specialization
    Generic,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Primitive => "primitive",
            TypeKind::Trigger => "trigger",
            TypeKind::Number => "number",
            TypeKind::String => "string",
            TypeKind::Boolean => "boolean",
            TypeKind::Binary => "binary",
            TypeKind::Stream => "stream",
            TypeKind::Map => "map",
            TypeKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// A node of the recursive type grammar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    /// Discriminant of this node
    #[serde(rename = "type")]
    pub kind: TypeKind,

    /// Child type, present iff `kind` is `stream`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<Box<TypeDef>>,

    /// Named children, present iff `kind` is `map`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<String, TypeDef>>,

    /// Generic identifier, present iff `kind` is `generic`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<String>,

    #[serde(skip)]
    valid: bool,
}

impl PartialEq for TypeDef {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.stream == other.stream
            && self.map == other.map
            && self.generic == other.generic
    }
}

impl TypeDef {
    fn leaf(kind: TypeKind) -> Self {
        Self {
            kind,
            stream: None,
            map: None,
            generic: None,
            valid: false,
        }
    }

    /// Any scalar value
    pub fn primitive() -> Self {
        Self::leaf(TypeKind::Primitive)
    }

    /// Any value, used for synchronization
    pub fn trigger() -> Self {
        Self::leaf(TypeKind::Trigger)
    }

    /// Floating point number
    pub fn number() -> Self {
        Self::leaf(TypeKind::Number)
    }

    /// UTF-8 string
    pub fn string() -> Self {
        Self::leaf(TypeKind::String)
    }

    /// Boolean
    pub fn boolean() -> Self {
        Self::leaf(TypeKind::Boolean)
    }

    /// Raw bytes
    pub fn binary() -> Self {
        Self::leaf(TypeKind::Binary)
    }

    /// Stream of `child`
    pub fn stream(child: TypeDef) -> Self {
        Self {
            kind: TypeKind::Stream,
            stream: Some(Box::new(child)),
            map: None,
            generic: None,
            valid: false,
        }
    }

    /// Map with the given named children
    pub fn map<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, TypeDef)>,
        S: Into<String>,
    {
        Self {
            kind: TypeKind::Map,
            stream: None,
            map: Some(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v))
                    .collect(),
            ),
            generic: None,
            valid: false,
        }
    }

    /// Generic identified by `name`
    pub fn generic(name: impl Into<String>) -> Self {
        Self {
            kind: TypeKind::Generic,
            stream: None,
            map: None,
            generic: Some(name.into()),
            valid: false,
        }
    }

    /// Whether [`TypeDef::validate`] has succeeded on this node
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Ensure this node and all children conform to the type grammar.
    pub fn validate(&mut self) -> Result<()> {
        match self.kind {
            TypeKind::Generic => {
                if self.generic.as_deref().unwrap_or("").is_empty() {
                    return Err(RuntimeError::InvalidType(
                        "generic identifier missing".to_string(),
                    ));
                }
            }
            TypeKind::Stream => match self.stream.as_mut() {
                Some(child) => child.validate()?,
                None => {
                    return Err(RuntimeError::InvalidType("stream missing".to_string()));
                }
            },
            TypeKind::Map => match self.map.as_mut() {
                Some(entries) if !entries.is_empty() => {
                    for (name, child) in entries.iter_mut() {
                        if name.is_empty() {
                            return Err(RuntimeError::InvalidType(
                                "map key must not be empty".to_string(),
                            ));
                        }
                        child.validate()?;
                    }
                }
                _ => {
                    return Err(RuntimeError::InvalidType(
                        "map missing or empty".to_string(),
                    ));
                }
            },
            _ => {}
        }

        self.valid = true;
        Ok(())
    }

    /// Replace generic nodes with deep copies of their bindings.
    ///
    /// Unbound generics are left intact; call [`TypeDef::generics_specified`]
    /// to require that none remain.
    pub fn specify_generics(&mut self, generics: &Generics) -> Result<()> {
        if self.kind == TypeKind::Generic {
            if let Some(binding) = self.generic.as_ref().and_then(|id| generics.get(id)) {
                *self = binding.clone();
            }
            return Ok(());
        }

        match self.kind {
            TypeKind::Stream => {
                if let Some(child) = self.stream.as_mut() {
                    child.specify_generics(generics)?;
                }
            }
            TypeKind::Map => {
                if let Some(entries) = self.map.as_mut() {
                    for child in entries.values_mut() {
                        child.specify_generics(generics)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Succeeds iff no generic node remains anywhere in this tree.
    pub fn generics_specified(&self) -> Result<()> {
        if self.kind == TypeKind::Generic || self.generic.is_some() {
            return Err(RuntimeError::GenericUnresolved(
                self.generic.clone().unwrap_or_default(),
            ));
        }

        match self.kind {
            TypeKind::Stream => {
                if let Some(child) = self.stream.as_ref() {
                    child.generics_specified()?;
                }
            }
            TypeKind::Map => {
                if let Some(entries) = self.map.as_ref() {
                    for child in entries.values() {
                        child.generics_specified()?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Structural check of a runtime value against this type.
    pub fn verify_data(&self, data: &Value) -> Result<()> {
        let mismatch = || RuntimeError::DataMismatch {
            expected: self.kind.to_string(),
            got: format!("{data:?}"),
        };

        match self.kind {
            TypeKind::Trigger => match data {
                Value::Marker(_) => Err(mismatch()),
                _ => Ok(()),
            },
            TypeKind::Primitive => match data {
                Value::Null
                | Value::Number(_)
                | Value::String(_)
                | Value::Bool(_)
                | Value::Binary(_) => Ok(()),
                _ => Err(mismatch()),
            },
            TypeKind::Number => match data {
                Value::Null | Value::Number(_) => Ok(()),
                _ => Err(mismatch()),
            },
            TypeKind::String => match data {
                Value::Null | Value::String(_) => Ok(()),
                _ => Err(mismatch()),
            },
            TypeKind::Boolean => match data {
                Value::Null | Value::Bool(_) => Ok(()),
                _ => Err(mismatch()),
            },
            TypeKind::Binary => match data {
                Value::Binary(_) => Ok(()),
                _ => Err(mismatch()),
            },
            TypeKind::Stream => match data {
                Value::Null => Ok(()),
                Value::Stream(items) => {
                    let child = self.stream.as_ref().ok_or_else(|| {
                        RuntimeError::InvalidType("stream missing".to_string())
                    })?;
                    for item in items {
                        child.verify_data(item)?;
                    }
                    Ok(())
                }
                _ => Err(mismatch()),
            },
            TypeKind::Map => {
                let entries = self
                    .map
                    .as_ref()
                    .ok_or_else(|| RuntimeError::InvalidType("map missing".to_string()))?;
                let data_map = match data {
                    Value::Map(m) => m,
                    _ => return Err(mismatch()),
                };
                for (key, child) in entries {
                    let entry = data_map.get(key).ok_or_else(|| RuntimeError::DataMismatch {
                        expected: format!("map entry \"{key}\""),
                        got: format!("{data:?}"),
                    })?;
                    child.verify_data(entry)?;
                }
                for key in data_map.keys() {
                    if !entries.contains_key(key) {
                        return Err(RuntimeError::DataMismatch {
                            expected: self.kind.to_string(),
                            got: format!("unexpected entry \"{key}\""),
                        });
                    }
                }
                Ok(())
            }
            TypeKind::Generic => Err(RuntimeError::GenericUnresolved(
                self.generic.clone().unwrap_or_default(),
            )),
        }
    }

    /// Expand `{name}` expressions in generic identifiers and map keys.
    ///
    /// A map key referencing a stream-typed property expands to one child
    /// per element, each with a freshly expanded child type.
    pub fn apply_properties(&mut self, props: &Properties, prop_defs: &TypeDefMap) -> Result<()> {
        match self.kind {
            TypeKind::Generic => {
                let identifier = self.generic.clone().unwrap_or_default();
                let expanded = expand_expression(&identifier, props, prop_defs)?;
                if expanded.len() != 1 {
                    return Err(RuntimeError::InvalidType(format!(
                        "generic identifier \"{identifier}\" must expand to exactly one name"
                    )));
                }
                self.generic = Some(expanded.into_iter().next().unwrap_or_default());
                Ok(())
            }
            TypeKind::Stream => {
                if let Some(child) = self.stream.as_mut() {
                    child.apply_properties(props, prop_defs)?;
                }
                Ok(())
            }
            TypeKind::Map => {
                let entries = self.map.take().unwrap_or_default();
                let mut expanded_entries = BTreeMap::new();
                for (key, child) in entries {
                    for expanded_key in expand_expression(&key, props, prop_defs)? {
                        let mut child_copy = child.clone();
                        child_copy.apply_properties(props, prop_defs)?;
                        expanded_entries.insert(expanded_key, child_copy);
                    }
                }
                self.map = Some(expanded_entries);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn parse(json: &str) -> TypeDef {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_validate_rejects_bare_stream() {
        let mut td = parse(r#"{"type": "stream"}"#);
        assert!(td.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_map() {
        let mut td = parse(r#"{"type": "map", "map": {}}"#);
        assert!(td.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_anonymous_generic() {
        let mut td = parse(r#"{"type": "generic"}"#);
        assert!(td.validate().is_err());
    }

    #[test]
    fn test_equality_ignores_map_key_order() {
        let a = parse(r#"{"type":"map","map":{"x":{"type":"number"},"y":{"type":"string"}}}"#);
        let b = parse(r#"{"type":"map","map":{"y":{"type":"string"},"x":{"type":"number"}}}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn test_specify_generics_substitutes_bound_identifier() {
        let mut td = parse(r#"{"type": "generic", "generic": "g1"}"#);
        td.validate().unwrap();

        let mut bindings = Generics::new();
        bindings.insert("g1".to_string(), TypeDef::boolean());
        td.specify_generics(&bindings).unwrap();

        assert_eq!(td.kind, TypeKind::Boolean);
        assert!(td.generics_specified().is_ok());
    }

    #[test]
    fn test_specify_generics_leaves_unbound_identifier() {
        let mut td = parse(r#"{"type": "generic", "generic": "g1"}"#);
        let mut bindings = Generics::new();
        bindings.insert("g2".to_string(), TypeDef::boolean());
        td.specify_generics(&bindings).unwrap();

        assert_eq!(td.kind, TypeKind::Generic);
        assert!(td.generics_specified().is_err());
    }

    #[test]
    fn test_specify_generics_descends_into_streams_and_maps() {
        let mut td = TypeDef::stream(TypeDef::map([("item", TypeDef::generic("t"))]));
        let mut bindings = Generics::new();
        bindings.insert("t".to_string(), TypeDef::number());
        td.specify_generics(&bindings).unwrap();
        assert!(td.generics_specified().is_ok());

        let item = td.stream.unwrap().map.unwrap().remove("item").unwrap();
        assert_eq!(item.kind, TypeKind::Number);
    }

    #[test]
    fn test_verify_data_scalars() {
        assert!(TypeDef::number().verify_data(&Value::Number(1.5)).is_ok());
        assert!(TypeDef::number().verify_data(&Value::String("x".into())).is_err());
        assert!(TypeDef::primitive().verify_data(&Value::Bool(true)).is_ok());
        assert!(TypeDef::primitive().verify_data(&value_map! {}).is_err());
        assert!(TypeDef::trigger().verify_data(&value_map! { "a" => 1.0 }).is_ok());
    }

    #[test]
    fn test_verify_data_streams_and_maps() {
        let td = TypeDef::stream(TypeDef::number());
        assert!(td.verify_data(&Value::Stream(vec![1.0.into(), 2.0.into()])).is_ok());
        assert!(td.verify_data(&Value::Stream(vec![Value::Bool(true)])).is_err());

        let td = TypeDef::map([("a", TypeDef::number())]);
        assert!(td.verify_data(&value_map! { "a" => 1.0 }).is_ok());
        assert!(td.verify_data(&value_map! {}).is_err());
        assert!(td.verify_data(&value_map! { "a" => 1.0, "b" => 2.0 }).is_err());
    }

    #[test]
    fn test_apply_properties_expands_map_keys() {
        let mut props = Properties::new();
        props.insert(
            "keys".to_string(),
            Value::Stream(vec!["x".into(), "y".into()]),
        );
        let mut prop_defs = TypeDefMap::new();
        prop_defs.insert("keys".to_string(), TypeDef::stream(TypeDef::string()));

        let mut td = TypeDef::map([("{keys}", TypeDef::number())]);
        td.apply_properties(&props, &prop_defs).unwrap();

        let entries = td.map.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["x"].kind, TypeKind::Number);
        assert_eq!(entries["y"].kind, TypeKind::Number);
    }
}

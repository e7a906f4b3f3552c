//! Declarative operator definitions
//!
//! An [`OperatorDef`] is the on-disk shape of an operator: named services
//! and delegates, a property schema, child instances, and connections.
//! After validation it is specialized — generics substituted, properties
//! verified and expanded into names — to yield a monomorphic definition
//! the builder can instantiate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{Result, RuntimeError};
use super::expr::expand_expression;
use super::typedef::{Generics, TypeDef, TypeDefMap};
use super::value::{Properties, Value};

/// Name of the default service every operator exposes
pub const MAIN_SERVICE: &str = "main";

/// In/Out type pair of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDef {
    /// Type of values the operator reads
    #[serde(rename = "in")]
    pub in_: TypeDef,
    /// Type of values the operator emits
    pub out: TypeDef,

    #[serde(skip)]
    valid: bool,
}

impl ServiceDef {
    /// Create a service definition from its port types.
    pub fn new(in_: TypeDef, out: TypeDef) -> Self {
        Self {
            in_,
            out,
            valid: false,
        }
    }

    /// Whether [`ServiceDef::validate`] has succeeded.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Validate both port types.
    pub fn validate(&mut self) -> Result<()> {
        self.in_.validate()?;
        self.out.validate()?;
        self.valid = true;
        Ok(())
    }
}

/// In/Out type pair of a delegate.
///
/// Semantically reversed from a service: the operator writes to the
/// delegate's Out and reads the answer from its In.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateDef {
    /// Type of values flowing back into the operator
    #[serde(rename = "in")]
    pub in_: TypeDef,
    /// Type of values the operator hands to the surrounding graph
    pub out: TypeDef,

    #[serde(skip)]
    valid: bool,
}

impl DelegateDef {
    /// Create a delegate definition from its port types.
    pub fn new(in_: TypeDef, out: TypeDef) -> Self {
        Self {
            in_,
            out,
            valid: false,
        }
    }

    /// Whether [`DelegateDef::validate`] has succeeded.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Validate both port types.
    pub fn validate(&mut self) -> Result<()> {
        self.in_.validate()?;
        self.out.validate()?;
        self.valid = true;
        Ok(())
    }
}

/// A child operator instance inside a parent definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDef {
    /// Instance name, the key of the `operators` mapping
    #[serde(skip)]
    pub name: String,

    /// Operator reference: a builtin id or a dot-separated library path
    pub operator: String,

    /// Property values bound to this instance
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,

    /// Generic bindings for this instance
    #[serde(default, skip_serializing_if = "Generics::is_empty")]
    pub generics: Generics,

    /// Resolved definition, filled by the loader for non-builtin children
    #[serde(default, rename = "definition", skip_serializing_if = "Option::is_none")]
    pub operator_def: Option<OperatorDef>,

    #[serde(skip)]
    valid: bool,
}

impl InstanceDef {
    /// Create an instance referencing `operator`.
    pub fn new(name: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator: operator.into(),
            properties: Properties::new(),
            generics: Generics::new(),
            operator_def: None,
            valid: false,
        }
    }

    /// Whether [`InstanceDef::validate`] has succeeded.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Check name and operator reference shape.
    pub fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RuntimeError::InvalidType(
                "instance name may not be empty".to_string(),
            ));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(RuntimeError::InvalidType(format!(
                "instance name may not contain whitespace: \"{}\"",
                self.name
            )));
        }
        if self.operator.is_empty() {
            return Err(RuntimeError::UnknownOperator(
                "operator may not be empty".to_string(),
            ));
        }
        if self.operator.chars().any(char::is_whitespace) {
            return Err(RuntimeError::UnknownOperator(format!(
                "operator may not contain whitespace: \"{}\"",
                self.operator
            )));
        }
        self.valid = true;
        Ok(())
    }
}

/// The declarative shape of an operator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorDef {
    /// Named services, typically just `main`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceDef>,

    /// Named delegates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delegates: BTreeMap<String, DelegateDef>,

    /// Child operator instances, keyed by instance name on disk
    #[serde(
        default,
        rename = "operators",
        with = "instance_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub instances: Vec<InstanceDef>,

    /// Property schema: property name to declared type
    #[serde(default, rename = "properties", skip_serializing_if = "BTreeMap::is_empty")]
    pub property_defs: TypeDefMap,

    /// Connections: source port reference to destination references
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connections: BTreeMap<String, Vec<String>>,

    /// Builtin id this definition was resolved from, if any
    #[serde(skip)]
    pub elementary: Option<String>,

    #[serde(skip)]
    valid: bool,
}

impl OperatorDef {
    /// Whether [`OperatorDef::validate`] has succeeded.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Look up a service definition.
    pub fn service(&self, name: &str) -> Option<&ServiceDef> {
        self.services.get(name)
    }

    /// The default `main` service definition.
    pub fn main(&self) -> Option<&ServiceDef> {
        self.services.get(MAIN_SERVICE)
    }

    /// Validate services, delegates, and child instances.
    pub fn validate(&mut self) -> Result<()> {
        for service in self.services.values_mut() {
            service.validate()?;
        }
        for delegate in self.delegates.values_mut() {
            delegate.validate()?;
        }

        let mut used_names = std::collections::BTreeSet::new();
        for instance in &mut self.instances {
            instance.validate()?;
            if !used_names.insert(instance.name.clone()) {
                return Err(RuntimeError::DuplicateInstanceName(instance.name.clone()));
            }
        }

        self.valid = true;
        Ok(())
    }

    /// Deep copy of services, delegates, and the property schema.
    ///
    /// Children and connections are deliberately not carried over; the
    /// copy serves as a fresh blueprint for re-specialization.
    pub fn copy(&self) -> OperatorDef {
        OperatorDef {
            services: self.services.clone(),
            delegates: self.delegates.clone(),
            instances: Vec::new(),
            property_defs: self.property_defs.clone(),
            connections: BTreeMap::new(),
            elementary: self.elementary.clone(),
            valid: false,
        }
    }

    /// Succeeds iff no generic remains in any service, delegate, or
    /// child generic binding.
    pub fn generics_specified(&self) -> Result<()> {
        for service in self.services.values() {
            service.in_.generics_specified()?;
            service.out.generics_specified()?;
        }
        for delegate in self.delegates.values() {
            delegate.in_.generics_specified()?;
            delegate.out.generics_specified()?;
        }
        for instance in &self.instances {
            for binding in instance.generics.values() {
                binding.generics_specified()?;
            }
            if let Some(def) = instance.operator_def.as_ref() {
                def.generics_specified()?;
            }
        }
        Ok(())
    }

    /// Specialize this definition: substitute generics, verify and
    /// expand properties, propagate `$name` property references to
    /// children, and recursively specialize child definitions. On
    /// success the property schema is cleared, marking the definition
    /// monomorphic.
    pub fn specify_operator(&mut self, generics: &Generics, properties: &Properties) -> Result<()> {
        if !self.valid {
            self.validate()?;
        }

        for service in self.services.values_mut() {
            service.in_.specify_generics(generics)?;
            service.out.specify_generics(generics)?;
        }
        for delegate in self.delegates.values_mut() {
            delegate.in_.specify_generics(generics)?;
            delegate.out.specify_generics(generics)?;
        }
        for prop_def in self.property_defs.values_mut() {
            prop_def.specify_generics(generics)?;
        }

        for (name, prop_def) in &self.property_defs {
            let value = properties
                .get(name)
                .ok_or_else(|| RuntimeError::MissingProperty(name.clone()))?;
            prop_def.verify_data(value)?;
        }

        let prop_defs = self.property_defs.clone();

        let old_services = std::mem::take(&mut self.services);
        for (name, service) in old_services {
            for expanded_name in expand_expression(&name, properties, &prop_defs)? {
                let mut copy = service.clone();
                copy.in_.apply_properties(properties, &prop_defs)?;
                copy.out.apply_properties(properties, &prop_defs)?;
                self.services.insert(expanded_name, copy);
            }
        }

        let old_delegates = std::mem::take(&mut self.delegates);
        for (name, delegate) in old_delegates {
            for expanded_name in expand_expression(&name, properties, &prop_defs)? {
                let mut copy = delegate.clone();
                copy.in_.apply_properties(properties, &prop_defs)?;
                copy.out.apply_properties(properties, &prop_defs)?;
                self.delegates.insert(expanded_name, copy);
            }
        }

        for instance in &mut self.instances {
            // Property values of the form "$name" pull the parent's value.
            for value in instance.properties.values_mut() {
                let key = match value {
                    Value::String(s) => match s.strip_prefix('$') {
                        Some(key) => key.to_string(),
                        None => continue,
                    },
                    _ => continue,
                };
                let parent_value = properties
                    .get(&key)
                    .ok_or_else(|| RuntimeError::MissingProperty(key.clone()))?;
                *value = parent_value.clone();
            }

            for binding in instance.generics.values_mut() {
                binding.specify_generics(generics)?;
            }

            if let Some(def) = instance.operator_def.as_mut() {
                let child_generics = instance.generics.clone();
                let child_properties = instance.properties.clone();
                def.specify_operator(&child_generics, &child_properties)?;
            }
        }

        self.property_defs.clear();
        Ok(())
    }
}

/// Serialize the instance list as a name-keyed mapping, the way
/// definitions are written on disk.
mod instance_list {
    use super::InstanceDef;
    use serde::de::Deserializer;
    use serde::ser::Serializer;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    pub fn serialize<S>(list: &[InstanceDef], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let map: BTreeMap<&str, &InstanceDef> =
            list.iter().map(|inst| (inst.name.as_str(), inst)).collect();
        map.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<InstanceDef>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: BTreeMap<String, InstanceDef> = BTreeMap::deserialize(deserializer)?;
        Ok(map
            .into_iter()
            .map(|(name, mut inst)| {
                inst.name = name;
                inst
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::typedef::TypeKind;
    use crate::value_map;

    fn parse(json: &str) -> OperatorDef {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_and_validate_minimal_definition() {
        let mut def = parse(
            r#"{
                "services": {
                    "main": {
                        "in": {"type": "number"},
                        "out": {"type": "string"}
                    }
                }
            }"#,
        );
        assert!(!def.valid());
        def.validate().unwrap();
        assert!(def.valid());
        assert_eq!(def.main().unwrap().in_.kind, TypeKind::Number);
    }

    #[test]
    fn test_validate_rejects_colliding_instance_names() {
        let mut def = OperatorDef::default();
        def.instances.push(InstanceDef::new("a", "op1"));
        def.instances.push(InstanceDef::new("a", "op2"));
        let err = def.validate().unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateInstanceName(name) if name == "a"));
    }

    #[test]
    fn test_validate_rejects_whitespace_in_names() {
        let mut inst = InstanceDef::new("has space", "op");
        assert!(inst.validate().is_err());
        let mut inst = InstanceDef::new("", "op");
        assert!(inst.validate().is_err());
    }

    #[test]
    fn test_specify_operator_substitutes_generics() {
        let mut def = parse(
            r#"{
                "services": {
                    "main": {
                        "in": {"type": "generic", "generic": "g1"},
                        "out": {"type": "number"}
                    }
                }
            }"#,
        );
        def.validate().unwrap();

        let mut generics = Generics::new();
        generics.insert("g1".to_string(), TypeDef::boolean());
        def.specify_operator(&generics, &Properties::new()).unwrap();

        assert_eq!(def.main().unwrap().in_.kind, TypeKind::Boolean);
        assert!(def.generics_specified().is_ok());
    }

    #[test]
    fn test_specify_operator_leaves_unbound_generic() {
        let mut def = parse(
            r#"{
                "services": {
                    "main": {
                        "in": {"type": "generic", "generic": "g1"},
                        "out": {"type": "number"}
                    }
                }
            }"#,
        );
        def.validate().unwrap();

        let mut generics = Generics::new();
        generics.insert("g2".to_string(), TypeDef::boolean());
        def.specify_operator(&generics, &Properties::new()).unwrap();

        assert_eq!(def.main().unwrap().in_.kind, TypeKind::Generic);
        assert!(def.generics_specified().is_err());
    }

    #[test]
    fn test_specify_operator_expands_property_map_keys() {
        let mut def = OperatorDef::default();
        def.services.insert(
            MAIN_SERVICE.to_string(),
            ServiceDef::new(
                TypeDef::map([("{keys}", TypeDef::number())]),
                TypeDef::trigger(),
            ),
        );
        def.property_defs
            .insert("keys".to_string(), TypeDef::stream(TypeDef::string()));

        let mut props = Properties::new();
        props.insert(
            "keys".to_string(),
            Value::Stream(vec!["x".into(), "y".into()]),
        );
        def.specify_operator(&Generics::new(), &props).unwrap();

        let entries = def.main().unwrap().in_.map.clone().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("x"));
        assert!(entries.contains_key("y"));
        assert!(def.property_defs.is_empty(), "schema cleared after specialization");
    }

    #[test]
    fn test_specify_operator_expands_service_names() {
        let mut def = OperatorDef::default();
        def.services.insert(
            "port_{which}".to_string(),
            ServiceDef::new(TypeDef::trigger(), TypeDef::number()),
        );
        def.property_defs
            .insert("which".to_string(), TypeDef::stream(TypeDef::string()));

        let mut props = Properties::new();
        props.insert(
            "which".to_string(),
            Value::Stream(vec!["a".into(), "b".into()]),
        );
        def.specify_operator(&Generics::new(), &props).unwrap();

        assert!(def.service("port_a").is_some());
        assert!(def.service("port_b").is_some());
        assert!(def.service("port_{which}").is_none());
    }

    #[test]
    fn test_specify_operator_verifies_property_types() {
        let mut def = OperatorDef::default();
        def.services.insert(
            MAIN_SERVICE.to_string(),
            ServiceDef::new(TypeDef::trigger(), TypeDef::trigger()),
        );
        def.property_defs.insert("n".to_string(), TypeDef::number());

        let err = def
            .specify_operator(&Generics::new(), &Properties::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MissingProperty(name) if name == "n"));

        let mut props = Properties::new();
        props.insert("n".to_string(), Value::String("nope".into()));
        let err = def.specify_operator(&Generics::new(), &props).unwrap_err();
        assert!(matches!(err, RuntimeError::DataMismatch { .. }));
    }

    #[test]
    fn test_specify_operator_resolves_dollar_properties() {
        let mut child_def = OperatorDef::default();
        child_def.services.insert(
            MAIN_SERVICE.to_string(),
            ServiceDef::new(TypeDef::trigger(), TypeDef::number()),
        );
        child_def
            .property_defs
            .insert("limit".to_string(), TypeDef::number());

        let mut inst = InstanceDef::new("child", "some.op");
        inst.properties
            .insert("limit".to_string(), Value::String("$bound".into()));
        inst.operator_def = Some(child_def);

        let mut def = OperatorDef::default();
        def.property_defs
            .insert("bound".to_string(), TypeDef::number());
        def.instances.push(inst);

        let mut props = Properties::new();
        props.insert("bound".to_string(), Value::Number(7.0));
        def.specify_operator(&Generics::new(), &props).unwrap();

        assert_eq!(
            def.instances[0].properties,
            value_map! { "limit" => 7.0 }.as_map().cloned().unwrap()
        );
    }

    #[test]
    fn test_roundtrip_through_yaml() {
        let yaml = r#"
services:
  main:
    in:
      type: map
      map:
        min:
          type: number
        max:
          type: number
    out:
      type: number
operators:
  doubler:
    operator: math.double
connections:
  "(min": ["doubler("]
"#;
        let mut def: OperatorDef = serde_yaml::from_str(yaml).unwrap();
        def.validate().unwrap();
        assert_eq!(def.instances.len(), 1);
        assert_eq!(def.instances[0].name, "doubler");
        assert_eq!(def.connections["(min"], vec!["doubler("]);
    }
}

//! Builtin operator catalog
//!
//! Maps builtin ids to blueprints and body functions. Builtins are
//! registered once at process start; afterwards the catalog is
//! effectively read-only. The global instance is populated from
//! [`crate::elem`]; tests may register additional builtins of their own.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::def::{InstanceDef, OperatorDef};
use super::error::{Result, RuntimeError};
use super::operator::{BodyFn, ConnectHook, Operator};

/// A registered builtin: blueprint plus native behavior
pub struct BuiltinConfig {
    /// Unique id of this builtin
    pub id: Uuid,
    /// Human-readable dotted name, for diagnostics
    pub name: &'static str,
    /// Declarative shape, specialized per instance
    pub blueprint: OperatorDef,
    /// Worker body
    pub body: BodyFn,
    /// Optional hook invoked on each inbound connection
    pub connect_hook: Option<ConnectHook>,
}

/// Catalog of builtin operators
pub struct BuiltinCatalog {
    entries: RwLock<HashMap<String, Arc<BuiltinConfig>>>,
}

static CATALOG: Lazy<BuiltinCatalog> = Lazy::new(|| {
    let catalog = BuiltinCatalog {
        entries: RwLock::new(HashMap::new()),
    };
    crate::elem::register_all(&catalog);
    catalog
});

impl BuiltinCatalog {
    /// The global catalog instance.
    pub fn global() -> &'static BuiltinCatalog {
        &CATALOG
    }

    /// Register a builtin under its id.
    pub fn register(&self, config: BuiltinConfig) {
        let mut entries = self.entries.write();
        entries.insert(config.id.to_string(), Arc::new(config));
    }

    /// Whether the id names a registered builtin.
    pub fn is_registered(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    fn config(&self, id: &str) -> Option<Arc<BuiltinConfig>> {
        self.entries.read().get(id).cloned()
    }

    /// A fresh copy of the builtin's blueprint.
    pub fn operator_def(&self, id: &str) -> Result<OperatorDef> {
        let config = self
            .config(id)
            .ok_or_else(|| RuntimeError::UnknownOperator(id.to_string()))?;
        Ok(config.blueprint.clone())
    }

    /// Instantiate a builtin: specialize its blueprint with the
    /// instance's generics and properties, then construct the native
    /// operator.
    pub fn make_operator(&self, instance: &InstanceDef) -> Result<Arc<Operator>> {
        let config = self
            .config(&instance.operator)
            .ok_or_else(|| RuntimeError::UnknownOperator(instance.operator.clone()))?;

        let mut def = config.blueprint.clone();
        def.validate()?;
        def.specify_operator(&instance.generics, &instance.properties)?;
        def.generics_specified()?;
        def.elementary = Some(config.id.to_string());

        Operator::new(
            instance.name.clone(),
            Some(config.body.clone()),
            config.connect_hook.clone(),
            instance.generics.clone(),
            instance.properties.clone(),
            def,
        )
    }

    /// Ids of every registered builtin, for diagnostics.
    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::def::{ServiceDef, MAIN_SERVICE};
    use crate::runtime::typedef::TypeDef;
    use crate::runtime::value::Value;

    fn null_body() -> BodyFn {
        Arc::new(|op| {
            while !op.check_stop() {
                let value = op.main().input().pull();
                if value.is_stop() {
                    continue;
                }
            }
        })
    }

    fn test_blueprint() -> OperatorDef {
        let mut def = OperatorDef::default();
        def.services.insert(
            MAIN_SERVICE.to_string(),
            ServiceDef::new(TypeDef::generic("t"), TypeDef::generic("t")),
        );
        def
    }

    #[test]
    fn test_register_and_lookup() {
        let catalog = BuiltinCatalog {
            entries: RwLock::new(HashMap::new()),
        };
        let id = Uuid::new_v4();
        catalog.register(BuiltinConfig {
            id,
            name: "test.null",
            blueprint: test_blueprint(),
            body: null_body(),
            connect_hook: None,
        });

        assert!(catalog.is_registered(&id.to_string()));
        assert!(!catalog.is_registered(&Uuid::new_v4().to_string()));
        assert!(catalog.operator_def(&id.to_string()).is_ok());
    }

    #[test]
    fn test_make_operator_specializes_blueprint() {
        let catalog = BuiltinCatalog {
            entries: RwLock::new(HashMap::new()),
        };
        let id = Uuid::new_v4();
        catalog.register(BuiltinConfig {
            id,
            name: "test.null",
            blueprint: test_blueprint(),
            body: null_body(),
            connect_hook: None,
        });

        let mut instance = InstanceDef::new("inst", id.to_string());
        instance
            .generics
            .insert("t".to_string(), TypeDef::string());
        let op = catalog.make_operator(&instance).unwrap();
        assert!(op.is_native());
        assert_eq!(op.name(), "inst");
        assert_eq!(op.def().elementary.as_deref(), Some(id.to_string().as_str()));

        // Without the binding the blueprint keeps a bare generic.
        let instance = InstanceDef::new("bad", id.to_string());
        assert!(catalog.make_operator(&instance).is_err());
    }

    #[test]
    fn test_unknown_operator() {
        let catalog = BuiltinCatalog {
            entries: RwLock::new(HashMap::new()),
        };
        let instance = InstanceDef::new("x", "not-an-id");
        let err = catalog.make_operator(&instance).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownOperator(_)));
    }

    #[test]
    fn test_global_catalog_carries_elem_builtins() {
        let catalog = BuiltinCatalog::global();
        assert!(catalog.is_registered(&crate::elem::RAND_RANGE_ID.to_string()));
        assert!(!catalog.ids().is_empty());
    }

    #[test]
    fn test_make_operator_runs() {
        let catalog = BuiltinCatalog {
            entries: RwLock::new(HashMap::new()),
        };
        let id = Uuid::new_v4();
        catalog.register(BuiltinConfig {
            id,
            name: "test.echoing",
            blueprint: test_blueprint(),
            body: Arc::new(|op| {
                while !op.check_stop() {
                    let value = op.main().input().pull();
                    if value.is_stop() {
                        continue;
                    }
                    op.main().output().push(value);
                }
            }),
            connect_hook: None,
        });

        let mut instance = InstanceDef::new("echo", id.to_string());
        instance
            .generics
            .insert("t".to_string(), TypeDef::number());
        let op = catalog.make_operator(&instance).unwrap();
        op.main().output().bufferize();
        op.start().unwrap();
        op.main().input().push(Value::Number(11.0));
        assert_eq!(op.main().output().pull(), Value::Number(11.0));
        op.stop();
    }
}

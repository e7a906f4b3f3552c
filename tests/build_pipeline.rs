//! Building, flattening, and rebuilding composite definitions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use weft::elem::{RAND_RANGE_ID, VALUE_ID};
use weft::runtime::builder::build_and_compile;
use weft::runtime::def::{InstanceDef, OperatorDef, ServiceDef, MAIN_SERVICE};
use weft::runtime::error::RuntimeError;
use weft::runtime::registry::{BuiltinCatalog, BuiltinConfig};
use weft::runtime::typedef::{Generics, TypeDef};
use weft::runtime::value::{Properties, Value};
use weft::value_map;

fn rand_range_composite() -> OperatorDef {
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::map([("min", TypeDef::number()), ("max", TypeDef::number())]),
            TypeDef::number(),
        ),
    );
    def.instances
        .push(InstanceDef::new("rr", RAND_RANGE_ID.to_string()));
    def.connections
        .insert("(".to_string(), vec!["rr(".to_string()]);
    def.connections
        .insert("rr)".to_string(), vec![")".to_string()]);
    def
}

#[test]
fn test_composite_builds_and_runs() {
    let op = build_and_compile(
        rand_range_composite(),
        &Generics::new(),
        &Properties::new(),
    )
    .unwrap();

    let child = op.child("rr").unwrap();
    assert!(child.is_native());

    op.main().output().bufferize();
    op.start().unwrap();
    op.main().input().push(value_map! { "min" => 3.0, "max" => 5.0 });
    let drawn = op.main().output().pull().as_f64().unwrap();
    assert!((3.0..=5.0).contains(&drawn));
    op.stop();
}

#[test]
fn test_compile_is_idempotent_on_flat_operator() {
    let op = build_and_compile(
        rand_range_composite(),
        &Generics::new(),
        &Properties::new(),
    )
    .unwrap();

    let first = op.compile();
    let def_before = serde_json::to_value(op.define().unwrap()).unwrap();
    let second = op.compile();
    let def_after = serde_json::to_value(op.define().unwrap()).unwrap();

    assert_eq!(first, second);
    assert_eq!(def_before, def_after);
}

#[test]
fn test_unconnected_input_fails_compilation() {
    let mut def = rand_range_composite();
    def.connections.remove("(");
    let err = build_and_compile(def, &Generics::new(), &Properties::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::UnconnectedInput(_)));
}

#[test]
fn test_bad_reference_aborts_build() {
    let mut def = rand_range_composite();
    def.connections
        .insert("ghost)".to_string(), vec![")".to_string()]);
    let err = build_and_compile(def, &Generics::new(), &Properties::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::BadReference { .. }));
}

#[test]
fn test_nested_composites_flatten_with_qualified_names() {
    let mut inner = rand_range_composite();
    inner.validate().unwrap();

    let mut outer = OperatorDef::default();
    outer.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::map([("min", TypeDef::number()), ("max", TypeDef::number())]),
            TypeDef::number(),
        ),
    );
    let mut instance = InstanceDef::new("wrapped", "local.rand-wrapper");
    instance.operator_def = Some(inner);
    outer.instances.push(instance);
    outer
        .connections
        .insert("(".to_string(), vec!["wrapped(".to_string()]);
    outer
        .connections
        .insert("wrapped)".to_string(), vec![")".to_string()]);

    let op = build_and_compile(outer, &Generics::new(), &Properties::new()).unwrap();

    // The composite boundary is gone; the native child carries a
    // qualified name.
    let lifted = op.child("wrapped#rr").unwrap();
    assert!(lifted.is_native());
    assert!(op.child("wrapped").is_none());

    op.main().output().bufferize();
    op.start().unwrap();
    op.main().input().push(value_map! { "min" => 1.0, "max" => 1.0 });
    assert_eq!(op.main().output().pull(), Value::Number(1.0));
    op.stop();
}

#[test]
fn test_fan_out_from_one_source() {
    // One property value feeds two adders; both outputs observe it.
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::trigger(),
            TypeDef::map([("first", TypeDef::number()), ("second", TypeDef::number())]),
        ),
    );
    let mut value_inst = InstanceDef::new("v", VALUE_ID.to_string());
    value_inst
        .generics
        .insert("valueType".to_string(), TypeDef::number());
    value_inst
        .properties
        .insert("value".to_string(), Value::Number(21.0));
    def.instances.push(value_inst);

    for name in ["a1", "a2"] {
        def.instances
            .push(InstanceDef::new(name, weft::elem::ADD_ID.to_string()));
    }

    def.connections
        .insert("(".to_string(), vec!["v(".to_string()]);
    def.connections.insert(
        "v)".to_string(),
        vec![
            "a1(a".to_string(),
            "a1(b".to_string(),
            "a2(a".to_string(),
            "a2(b".to_string(),
        ],
    );
    def.connections
        .insert("a1)".to_string(), vec![")first".to_string()]);
    def.connections
        .insert("a2)".to_string(), vec![")second".to_string()]);

    let op = build_and_compile(def, &Generics::new(), &Properties::new()).unwrap();
    op.main().output().bufferize();
    op.start().unwrap();

    op.main().input().push(Value::Null);
    assert_eq!(
        op.main().output().pull(),
        value_map! { "first" => 42.0, "second" => 42.0 }
    );
    op.stop();
}

#[test]
fn test_connect_hook_called_per_inbound_connection() {
    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

    let id = Uuid::new_v4();
    let mut blueprint = OperatorDef::default();
    blueprint.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::map([("a", TypeDef::number()), ("b", TypeDef::number())]),
            TypeDef::number(),
        ),
    );
    BuiltinCatalog::global().register(BuiltinConfig {
        id,
        name: "test.hooked",
        blueprint,
        body: Arc::new(|op| {
            while !op.check_stop() {
                let value = op.main().input().pull();
                if value.is_stop() {
                    continue;
                }
                if value.is_marker() {
                    op.main().output().push(value);
                    continue;
                }
                op.main().output().push(Value::Number(0.0));
            }
        }),
        connect_hook: Some(Arc::new(|_op, _dst, _src| {
            HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })),
    });

    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::map([("a", TypeDef::number()), ("b", TypeDef::number())]),
            TypeDef::number(),
        ),
    );
    def.instances.push(InstanceDef::new("h", id.to_string()));
    def.connections
        .insert("(a".to_string(), vec!["h(a".to_string()]);
    def.connections
        .insert("(b".to_string(), vec!["h(b".to_string()]);
    def.connections
        .insert("h)".to_string(), vec![")".to_string()]);

    build_and_compile(def, &Generics::new(), &Properties::new()).unwrap();

    // Two inbound connections, applied once while building and once
    // more on the ordered rebuild of the flattened definition.
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 4);
}

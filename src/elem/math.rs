//! Arithmetic builtins

use std::sync::Arc;
use uuid::Uuid;

use crate::runtime::def::{OperatorDef, ServiceDef, MAIN_SERVICE};
use crate::runtime::registry::{BuiltinCatalog, BuiltinConfig};
use crate::runtime::typedef::TypeDef;
use crate::runtime::value::Value;

/// Id of the `math.add` builtin
pub const ADD_ID: Uuid = Uuid::from_u128(0x9b7a51c4_12de_4f0b_a6c8_3e2d70b4f20a);

fn blueprint() -> OperatorDef {
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::map([("a", TypeDef::number()), ("b", TypeDef::number())]),
            TypeDef::number(),
        ),
    );
    def
}

pub(crate) fn register(catalog: &BuiltinCatalog) {
    catalog.register(BuiltinConfig {
        id: ADD_ID,
        name: "math.add",
        blueprint: blueprint(),
        body: Arc::new(|op| {
            let input = op.main().input().clone();
            let output = op.main().output().clone();
            while !op.check_stop() {
                let value = input.pull();
                if value.is_stop() {
                    continue;
                }
                if value.is_marker() {
                    output.push(value);
                    continue;
                }
                let operands = value.as_map().expect("add expects {a, b}");
                let a = operands["a"].as_f64().expect("a must be a number");
                let b = operands["b"].as_f64().expect("b must be a number");
                output.push(Value::Number(a + b));
            }
        }),
        connect_hook: None,
    });
}

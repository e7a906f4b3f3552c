//! Data generation builtins

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use uuid::Uuid;

use crate::runtime::def::{OperatorDef, ServiceDef, MAIN_SERVICE};
use crate::runtime::registry::{BuiltinCatalog, BuiltinConfig};
use crate::runtime::typedef::TypeDef;
use crate::runtime::value::Value;

/// Id of the `data.rand-range` builtin
pub const RAND_RANGE_ID: Uuid = Uuid::from_u128(0x7d33a1b0_5f2c_4e8a_9c41_d06a38f1e002);

/// Id of the `data.value` builtin
pub const VALUE_ID: Uuid = Uuid::from_u128(0x2ca61c10_88e4_4a3f_b1d7_55c0f9ae1101);

fn rand_range_blueprint() -> OperatorDef {
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::map([("min", TypeDef::number()), ("max", TypeDef::number())]),
            TypeDef::number(),
        ),
    );
    def
}

fn value_blueprint() -> OperatorDef {
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(TypeDef::trigger(), TypeDef::generic("valueType")),
    );
    def.property_defs
        .insert("value".to_string(), TypeDef::generic("valueType"));
    def
}

pub(crate) fn register(catalog: &BuiltinCatalog) {
    catalog.register(BuiltinConfig {
        id: RAND_RANGE_ID,
        name: "data.rand-range",
        blueprint: rand_range_blueprint(),
        body: Arc::new(|op| {
            let input = op.main().input().clone();
            let output = op.main().output().clone();
            // One RNG per operator instance keeps runs independent.
            let mut rng = SmallRng::from_entropy();
            while !op.check_stop() {
                let value = input.pull();
                if value.is_stop() {
                    continue;
                }
                if value.is_marker() {
                    output.push(value);
                    continue;
                }

                let bounds = value.as_map().expect("rand-range expects {min, max}");
                let min = bounds["min"].as_f64().expect("min must be a number") as i64;
                let max = bounds["max"].as_f64().expect("max must be a number") as i64;
                // Inclusive on both ends: min <= x <= max.
                let drawn = rng.gen_range(min..=max);
                output.push(Value::Number(drawn as f64));
            }
        }),
        connect_hook: None,
    });

    catalog.register(BuiltinConfig {
        id: VALUE_ID,
        name: "data.value",
        blueprint: value_blueprint(),
        body: Arc::new(|op| {
            let input = op.main().input().clone();
            let output = op.main().output().clone();
            let value = op
                .property("value")
                .cloned()
                .expect("data.value requires the \"value\" property");
            while !op.check_stop() {
                let trigger = input.pull();
                if trigger.is_stop() {
                    continue;
                }
                if trigger.is_marker() {
                    output.push(trigger);
                    continue;
                }
                output.push(value.clone());
            }
        }),
        connect_hook: None,
    });
}

//! Control-flow builtins

use std::sync::Arc;
use uuid::Uuid;

use crate::runtime::def::{DelegateDef, OperatorDef, ServiceDef, MAIN_SERVICE};
use crate::runtime::registry::{BuiltinCatalog, BuiltinConfig};
use crate::runtime::typedef::TypeDef;
use crate::runtime::value::Value;
use crate::value_map;

/// Id of the `flow.aggregate` builtin
pub const AGGREGATE_ID: Uuid = Uuid::from_u128(0xc3f08a96_6d41_4b0f_bd12_7aa5190c5be4);

fn blueprint() -> OperatorDef {
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::map([
                ("init", TypeDef::generic("stateType")),
                ("items", TypeDef::stream(TypeDef::generic("itemType"))),
            ]),
            TypeDef::generic("stateType"),
        ),
    );
    def.delegates.insert(
        "iteration".to_string(),
        DelegateDef::new(
            TypeDef::stream(TypeDef::generic("stateType")),
            TypeDef::stream(TypeDef::map([
                ("item", TypeDef::generic("itemType")),
                ("state", TypeDef::generic("stateType")),
            ])),
        ),
    );
    def
}

pub(crate) fn register(catalog: &BuiltinCatalog) {
    catalog.register(BuiltinConfig {
        id: AGGREGATE_ID,
        name: "flow.aggregate",
        blueprint: blueprint(),
        body: Arc::new(|op| {
            let input = op.main().input().clone();
            let output = op.main().output().clone();
            let iteration = op.delegate("iteration").expect("aggregate has iteration");
            let iter_in = iteration.input().clone();
            let iter_out = iteration.output().clone();

            let init_port = input.map("init").expect("aggregate input has init");
            let items_port = input.map("items").expect("aggregate input has items");

            'run: while !op.check_stop() {
                let mut state = init_port.pull();
                if state.is_stop() {
                    break;
                }
                if state.is_marker() {
                    // The broadcast copy on the items side must match.
                    let twin = items_port.pull();
                    if !twin.is_marker() {
                        panic!("expected matching marker on items, got {twin:?}");
                    }
                    output.push(state);
                    continue;
                }

                let items = match items_port.pull() {
                    Value::Stream(items) => items,
                    value if value.is_stop() => break,
                    other => panic!("expected item stream, got {other:?}"),
                };

                iter_out.push_bos();
                let opening = iter_in.stream().expect("iteration in is a stream").pull();
                if opening.is_stop() {
                    break;
                }
                if !iter_in.own_bos(&opening) {
                    panic!("expected begin marker back from iteration, got {opening:?}");
                }

                for item in items {
                    iter_out
                        .stream()
                        .expect("iteration out is a stream")
                        .push(value_map! { "item" => item, "state" => state });
                    state = iter_in.stream().expect("iteration in is a stream").pull();
                    if state.is_stop() {
                        break 'run;
                    }
                }

                iter_out.push_eos();
                let closing = iter_in.stream().expect("iteration in is a stream").pull();
                if closing.is_stop() {
                    break;
                }
                if !iter_in.own_eos(&closing) {
                    panic!("expected end marker back from iteration, got {closing:?}");
                }

                output.push(state);
            }
        }),
        connect_hook: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::def::InstanceDef;
    use crate::runtime::typedef::Generics;

    fn aggregate_op() -> Arc<crate::runtime::operator::Operator> {
        let mut generics = Generics::new();
        generics.insert("stateType".to_string(), TypeDef::number());
        generics.insert("itemType".to_string(), TypeDef::number());
        let mut instance = InstanceDef::new("agg", AGGREGATE_ID.to_string());
        instance.generics = generics;
        BuiltinCatalog::global().make_operator(&instance).unwrap()
    }

    #[test]
    fn test_aggregate_sums_via_delegate() {
        let op = aggregate_op();
        op.main().output().bufferize();
        let iteration = op.delegate("iteration").unwrap();
        op.start().unwrap();

        let input = op.main().input();
        input.map("init").unwrap().push(Value::Number(0.0));
        input.map("items").unwrap().push_bos();
        for n in [1.0, 2.0, 3.0] {
            input
                .map("items")
                .unwrap()
                .stream()
                .unwrap()
                .push(Value::Number(n));
        }
        input.map("items").unwrap().push_eos();

        // Drive the iteration by hand: read {item, state}, answer item+state.
        let iter_out_sub = iteration.output().stream().unwrap();
        let iter_in = iteration.input();

        let opening = iter_out_sub.pull();
        assert!(iteration.output().own_bos(&opening));
        iter_in.push_bos();

        for _ in 0..3 {
            let step = iter_out_sub.pull();
            let pair = step.as_map().unwrap();
            let sum = pair["item"].as_f64().unwrap() + pair["state"].as_f64().unwrap();
            iter_in.stream().unwrap().push(Value::Number(sum));
        }

        let closing = iter_out_sub.pull();
        assert!(iteration.output().own_eos(&closing));
        iter_in.push_eos();

        assert_eq!(op.main().output().pull(), Value::Number(6.0));
        op.stop();
    }
}

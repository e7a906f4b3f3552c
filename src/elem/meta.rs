//! Observer builtins
//!
//! `meta.store` watches every leaf of its examined input independently
//! and answers queries with the sequence of values seen so far. Parts
//! of a value that have not arrived yet are reported as placeholder
//! sentinels: `PhSingle` for an absent single value, `PhMultiple` for
//! the open tail of a stream.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

use crate::runtime::def::{OperatorDef, ServiceDef, MAIN_SERVICE};
use crate::runtime::port::Port;
use crate::runtime::registry::{BuiltinCatalog, BuiltinConfig};
use crate::runtime::typedef::{TypeDef, TypeKind};
use crate::runtime::value::{Marker, Value};

/// Id of the `meta.store` builtin
pub const STORE_ID: Uuid = Uuid::from_u128(0xe1b4a7d8_0c25_4f6e_9a3b_417f86d2c909);

fn blueprint() -> OperatorDef {
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(TypeDef::generic("examineType"), TypeDef::trigger()),
    );
    def.services.insert(
        "query".to_string(),
        ServiceDef::new(
            TypeDef::trigger(),
            TypeDef::stream(TypeDef::generic("examineType")),
        ),
    );
    def
}

/// Recorded tokens of one observed leaf, with a render cursor.
struct LeafTape {
    values: Vec<Value>,
    cursor: usize,
}

impl LeafTape {
    fn head(&self) -> Option<&Value> {
        self.values.get(self.cursor)
    }

    fn take(&mut self) -> Value {
        let value = self.values[self.cursor].clone();
        self.cursor += 1;
        value
    }
}

fn leaf_count(port: &Arc<Port>) -> usize {
    match port.kind() {
        TypeKind::Stream => leaf_count(&port.stream().expect("stream has sub")),
        TypeKind::Map => port
            .map_keys()
            .iter()
            .map(|key| leaf_count(&port.map(key).expect("known key")))
            .sum(),
        _ => 1,
    }
}

fn head_is(tape: &LeafTape, marker: Marker) -> bool {
    matches!(tape.head(), Some(Value::Marker(m)) if *m == marker)
}

/// Whether rendering at `port` can still consume a token.
fn consumable(port: &Arc<Port>, start: usize, tapes: &[LeafTape]) -> bool {
    match port.kind() {
        TypeKind::Stream => {
            let own = port.stream_identity().expect("stream has identity");
            let count = leaf_count(port);
            let boundary = tapes[start..start + count].iter().any(|tape| {
                head_is(tape, Marker::Bos(own)) || head_is(tape, Marker::Eos(own))
            });
            boundary || consumable(&port.stream().expect("stream has sub"), start, tapes)
        }
        TypeKind::Map => {
            let mut offset = start;
            for key in port.map_keys() {
                let child = port.map(&key).expect("known key");
                if consumable(&child, offset, tapes) {
                    return true;
                }
                offset += leaf_count(&child);
            }
            false
        }
        _ => matches!(tapes[start].head(), Some(v) if !v.is_control_marker()),
    }
}

/// Render the next examined value at `port`, consuming tokens.
fn render_one(port: &Arc<Port>, start: usize, tapes: &mut [LeafTape]) -> Value {
    match port.kind() {
        TypeKind::Stream => {
            let own = port.stream_identity().expect("stream has identity");
            let count = leaf_count(port);
            let sub = port.stream().expect("stream has sub");

            let mut opened = false;
            for tape in &mut tapes[start..start + count] {
                if head_is(tape, Marker::Bos(own)) {
                    tape.take();
                    opened = true;
                }
            }
            if !opened {
                let mut stray_end = false;
                for tape in &mut tapes[start..start + count] {
                    if head_is(tape, Marker::Eos(own)) {
                        tape.take();
                        stray_end = true;
                    }
                }
                if stray_end {
                    return Value::Stream(Vec::new());
                }
                if !consumable(&sub, start, tapes) {
                    return Value::Marker(Marker::PhSingle);
                }
            }

            let mut items = Vec::new();
            loop {
                let mut closed = false;
                for tape in &mut tapes[start..start + count] {
                    if head_is(tape, Marker::Eos(own)) {
                        tape.take();
                        closed = true;
                    }
                }
                if closed {
                    return Value::Stream(items);
                }
                if !consumable(&sub, start, tapes) {
                    items.push(Value::Marker(Marker::PhMultiple));
                    return Value::Stream(items);
                }
                items.push(render_one(&sub, start, tapes));
            }
        }
        TypeKind::Map => {
            let mut composed = BTreeMap::new();
            let mut offset = start;
            for key in port.map_keys() {
                let child = port.map(&key).expect("known key");
                composed.insert(key.clone(), render_one(&child, offset, tapes));
                offset += leaf_count(&child);
            }
            Value::Map(composed)
        }
        _ => {
            let tape = &mut tapes[start];
            match tape.head() {
                Some(v) if !v.is_control_marker() => tape.take(),
                _ => Value::Marker(Marker::PhSingle),
            }
        }
    }
}

fn render_examined(root: &Arc<Port>, tapes: &mut [LeafTape]) -> Vec<Value> {
    let mut rendered = Vec::new();
    while consumable(root, 0, tapes) {
        rendered.push(render_one(root, 0, tapes));
    }
    rendered
}

pub(crate) fn register(catalog: &BuiltinCatalog) {
    catalog.register(BuiltinConfig {
        id: STORE_ID,
        name: "meta.store",
        blueprint: blueprint(),
        body: Arc::new(|op| {
            let main_in = op.main().input().clone();
            let query = op.service("query").expect("meta.store has query service");
            let query_in = query.input().clone();
            let query_out = query.output().clone();

            let leaves = main_in.leaves();
            let records: Arc<Vec<Mutex<Vec<Value>>>> =
                Arc::new(leaves.iter().map(|_| Mutex::new(Vec::new())).collect());

            let mut observers = Vec::new();
            for (index, leaf) in leaves.iter().enumerate() {
                let leaf = leaf.clone();
                let records = records.clone();
                observers.push(thread::spawn(move || loop {
                    let value = leaf.pull();
                    if value.is_stop() {
                        break;
                    }
                    records[index].lock().push(value);
                }));
            }

            while !op.check_stop() {
                let trigger = query_in.pull();
                if trigger.is_stop() {
                    break;
                }
                if trigger.is_marker() {
                    query_out.push(trigger);
                    continue;
                }

                let mut tapes: Vec<LeafTape> = records
                    .iter()
                    .map(|record| LeafTape {
                        values: record.lock().clone(),
                        cursor: 0,
                    })
                    .collect();
                let rendered = render_examined(&main_in, &mut tapes);

                query_out.push_bos();
                let element = query_out.stream().expect("query out is a stream");
                for value in rendered {
                    element.push(value);
                }
                query_out.push_eos();
            }

            for observer in observers {
                let _ = observer.join();
            }
        }),
        connect_hook: None,
    });
}

//! Building runnable operators from specialized definitions
//!
//! [`create_and_connect_operator`] turns a validated, specialized
//! definition into a live operator tree: children are instantiated
//! (natively from the builtin catalog, or recursively for composites),
//! connections are parsed and applied breadth-first from the operator's
//! own inputs outward. [`build_and_compile`] runs the full pipeline:
//! build, flatten, re-serialize, rebuild ordered, verify connectedness.

use std::sync::Arc;

use super::def::OperatorDef;
use super::error::{Result, RuntimeError};
use super::operator::Operator;
use super::port::{Attachment, Direction, Port};
use super::reference::parse_port_reference;
use super::registry::BuiltinCatalog;
use super::typedef::Generics;
use super::value::Properties;

struct Connection {
    src: Arc<Port>,
    dsts: Vec<Arc<Port>>,
    done: bool,
}

/// Create a live operator tree from a specialized definition and wire
/// its connections.
///
/// With `ordered` set, connection application only advances to an
/// operator once all its service inputs are wired, so connect-time
/// hooks observe a deterministic order.
pub fn create_and_connect_operator(
    name: &str,
    def: &OperatorDef,
    ordered: bool,
) -> Result<Arc<Operator>> {
    let op = Operator::new(
        name,
        None,
        None,
        Generics::new(),
        Properties::new(),
        def.clone(),
    )?;

    let catalog = BuiltinCatalog::global();
    for instance in &def.instances {
        if catalog.is_registered(&instance.operator) {
            let child = catalog.make_operator(instance)?;
            child.set_parent(&op);
            continue;
        }
        let child_def = instance
            .operator_def
            .as_ref()
            .ok_or_else(|| RuntimeError::UnknownOperator(instance.operator.clone()))?;
        let child = create_and_connect_operator(&instance.name, child_def, ordered)?;
        child.set_parent(&op);
    }

    let mut plan = Vec::with_capacity(def.connections.len());
    for (src_ref, dst_refs) in &def.connections {
        let src = parse_port_reference(src_ref, &op)?;
        let mut dsts = Vec::with_capacity(dst_refs.len());
        for dst_ref in dst_refs {
            dsts.push(parse_port_reference(dst_ref, &op)?);
        }
        plan.push(Connection {
            src,
            dsts,
            done: false,
        });
    }

    connect_destinations(&op, &mut plan, ordered)?;
    Ok(op)
}

/// Connect every planned source owned by `op`, then recurse into the
/// operators that became reachable.
fn connect_destinations(
    op: &Arc<Operator>,
    plan: &mut [Connection],
    ordered: bool,
) -> Result<()> {
    let mut reached: Vec<Arc<Operator>> = Vec::new();

    for index in 0..plan.len() {
        if plan[index].done || !Arc::ptr_eq(&plan[index].src.operator(), op) {
            continue;
        }
        plan[index].done = true;

        let src = plan[index].src.clone();
        let dsts = plan[index].dsts.clone();
        for dst in dsts {
            src.connect(&dst)?;
            let dst_op = dst.operator();
            if let Some(hook) = dst_op.connect_hook() {
                hook(&dst_op, &dst, &src)?;
            }
            if !reached.iter().any(|o| Arc::ptr_eq(o, &dst_op)) {
                reached.push(dst_op);
            }
        }
    }

    let follow: Vec<Arc<Operator>> = if ordered {
        reached
            .into_iter()
            .filter(|candidate| {
                !plan.iter().any(|conn| {
                    !conn.done
                        && conn.dsts.iter().any(|dst| {
                            Arc::ptr_eq(&dst.operator(), candidate)
                                && dst.direction() == Direction::In
                                && matches!(dst.attachment(), Attachment::Service(_))
                        })
                })
            })
            .collect()
    } else {
        reached
    };

    for next in follow {
        connect_destinations(&next, plan, ordered)?;
    }
    Ok(())
}

/// Full build pipeline: specialize, build, flatten, re-serialize as a
/// flat definition, rebuild with ordered connection, and verify every
/// input is wired. The returned operator is runnable.
pub fn build_and_compile(
    mut def: OperatorDef,
    generics: &Generics,
    properties: &Properties,
) -> Result<Arc<Operator>> {
    def.specify_operator(generics, properties)?;
    def.generics_specified()?;

    let op = create_and_connect_operator("", &def, false)?;
    op.compile();
    let flat_def = op.define()?;

    let flat = create_and_connect_operator("", &flat_def, true)?;
    flat.correctly_compiled()?;
    Ok(flat)
}

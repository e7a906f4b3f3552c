//! Textual port references
//!
//! A connection names its endpoints with strings of the form
//! `opPart sep pathPart`, where `sep` is `(` for input ports and `)`
//! for output ports. The op part selects the parent operator itself
//! (empty), a child's main service (`child`), an explicit service
//! (`srv@child`), or a delegate (`child.delegate`); the path part
//! descends the port tree through map keys and `~` for streams.

use std::sync::Arc;

use super::def::MAIN_SERVICE;
use super::error::{Result, RuntimeError};
use super::operator::Operator;
use super::port::{Direction, Port};
use super::typedef::TypeKind;

/// Resolve a port reference against an operator.
pub fn parse_port_reference(reference: &str, operator: &Arc<Operator>) -> Result<Arc<Port>> {
    let bad = |detail: String| RuntimeError::BadReference {
        reference: reference.to_string(),
        detail,
    };

    if reference.is_empty() {
        return Err(bad("empty connection string".to_string()));
    }

    let (direction, sep_index) = match (reference.find('('), reference.find(')')) {
        (Some(index), None) => (Direction::In, index),
        (None, Some(index)) => (Direction::Out, index),
        (Some(_), Some(_)) => {
            return Err(bad("more than one direction separator".to_string()));
        }
        (None, None) => return Err(bad("cannot derive direction".to_string())),
    };

    let op_part = &reference[..sep_index];
    let path_part = &reference[sep_index + 1..];

    let port = resolve_op_part(op_part, direction, operator, &bad)?;
    descend(port, path_part, &bad)
}

fn resolve_op_part(
    op_part: &str,
    direction: Direction,
    operator: &Arc<Operator>,
    bad: &dyn Fn(String) -> RuntimeError,
) -> Result<Arc<Port>> {
    let pick = |input: &Arc<Port>, output: &Arc<Port>| match direction {
        Direction::In => input.clone(),
        Direction::Out => output.clone(),
    };

    if op_part.is_empty() {
        let service = operator
            .service(MAIN_SERVICE)
            .ok_or_else(|| bad(format!("operator \"{}\" has no main service", operator.name())))?;
        return Ok(pick(service.input(), service.output()));
    }

    if op_part.contains('.') && op_part.contains('@') {
        return Err(bad(
            "cannot reference both service and delegate".to_string(),
        ));
    }

    if let Some((child_name, delegate_name)) = op_part.split_once('.') {
        if delegate_name.contains('.') {
            return Err(bad("malformed delegate reference".to_string()));
        }
        let target = child_or_self(child_name, operator, bad)?;
        let delegate = target.delegate(delegate_name).ok_or_else(|| {
            bad(format!(
                "operator \"{}\" has no delegate \"{delegate_name}\"",
                target.name()
            ))
        })?;
        return Ok(pick(delegate.input(), delegate.output()));
    }

    if let Some((service_name, child_name)) = op_part.split_once('@') {
        if child_name.contains('@') {
            return Err(bad("malformed service reference".to_string()));
        }
        let target = child_or_self(child_name, operator, bad)?;
        let service = target.service(service_name).ok_or_else(|| {
            bad(format!(
                "operator \"{}\" has no service \"{service_name}\"",
                target.name()
            ))
        })?;
        return Ok(pick(service.input(), service.output()));
    }

    let child = operator
        .child(op_part)
        .ok_or_else(|| bad(format!("operator \"{}\" has no child \"{op_part}\"", operator.name())))?;
    let service = child
        .service(MAIN_SERVICE)
        .ok_or_else(|| bad(format!("operator \"{op_part}\" has no main service")))?;
    Ok(pick(service.input(), service.output()))
}

fn child_or_self(
    child_name: &str,
    operator: &Arc<Operator>,
    bad: &dyn Fn(String) -> RuntimeError,
) -> Result<Arc<Operator>> {
    if child_name.is_empty() {
        return Ok(operator.clone());
    }
    operator.child(child_name).ok_or_else(|| {
        bad(format!(
            "operator \"{}\" has no child \"{child_name}\"",
            operator.name()
        ))
    })
}

fn descend(
    mut port: Arc<Port>,
    path_part: &str,
    bad: &dyn Fn(String) -> RuntimeError,
) -> Result<Arc<Port>> {
    if path_part.is_empty() {
        return Ok(port);
    }

    for segment in path_part.split('.') {
        if segment == "~" {
            port = port
                .stream()
                .ok_or_else(|| bad("descending ~ on a non-stream".to_string()))?;
            continue;
        }
        if port.kind() != TypeKind::Map {
            return Err(bad("descending into a non-map".to_string()));
        }
        port = port
            .map(segment)
            .ok_or_else(|| bad(format!("unknown port: {segment}")))?;
    }
    Ok(port)
}

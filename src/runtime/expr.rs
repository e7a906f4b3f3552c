//! Property expression expansion for names
//!
//! Service, delegate, and map-key names may contain `{name}` tokens that
//! are replaced by property values during specialization. A stream-typed
//! property expands an expression into one output per element; scalar
//! properties expand to exactly one output.

use super::error::{Result, RuntimeError};
use super::typedef::{TypeDefMap, TypeKind};
use super::value::{Properties, Value};

/// Locate the leftmost `{name}` token in `expr`.
fn leftmost_token(expr: &str) -> Option<(usize, usize, &str)> {
    let open = expr.find('{')?;
    let close = expr[open..].find('}')? + open;
    Some((open, close, &expr[open + 1..close]))
}

/// The scalar renderings a single property contributes to an expansion.
fn property_values(name: &str, props: &Properties, prop_defs: &TypeDefMap) -> Result<Vec<String>> {
    let value = props
        .get(name)
        .ok_or_else(|| RuntimeError::MissingProperty(name.to_string()))?;

    let is_stream = prop_defs
        .get(name)
        .map(|td| td.kind == TypeKind::Stream)
        .unwrap_or(false);

    if is_stream {
        match value {
            Value::Stream(items) => Ok(items.iter().map(Value::expression_string).collect()),
            other => Ok(vec![other.expression_string()]),
        }
    } else {
        Ok(vec![value.expression_string()])
    }
}

/// Expand every `{name}` token in `expr` against the property bag.
///
/// Replacement proceeds leftmost-first; each stream-typed property
/// multiplies the output list by one entry per element, preserving the
/// property's sequence order. An expression without tokens expands to
/// itself.
pub fn expand_expression(
    expr: &str,
    props: &Properties,
    prop_defs: &TypeDefMap,
) -> Result<Vec<String>> {
    let mut expansions = vec![expr.to_string()];

    while let Some((open, close, name)) = expansions
        .first()
        .and_then(|e| leftmost_token(e))
        .map(|(o, c, n)| (o, c, n.to_string()))
    {
        let values = property_values(&name, props, prop_defs)?;
        let token = expansions[0][open..=close].to_string();

        let mut next = Vec::with_capacity(expansions.len() * values.len());
        for value in &values {
            for expansion in &expansions {
                next.push(expansion.replacen(&token, value, 1));
            }
        }
        expansions = next;
    }

    Ok(expansions)
}

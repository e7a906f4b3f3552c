//! Builtin operator catalog
//!
//! Native operators shipped with the runtime, registered into the
//! global [`BuiltinCatalog`] at process start. Each builtin provides a
//! blueprint definition, a body run by its worker, and optionally a
//! connect-time hook.

mod data;
mod files;
mod flow;
mod math;
mod meta;

pub use data::{RAND_RANGE_ID, VALUE_ID};
pub use files::ZIP_PACK_ID;
pub use flow::AGGREGATE_ID;
pub use math::ADD_ID;
pub use meta::STORE_ID;

use crate::runtime::registry::BuiltinCatalog;

/// Register every shipped builtin.
pub(crate) fn register_all(catalog: &BuiltinCatalog) {
    data::register(catalog);
    files::register(catalog);
    flow::register(catalog);
    math::register(catalog);
    meta::register(catalog);
}

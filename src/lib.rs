//! Weft – A typed dataflow runtime
//!
//! This crate implements a dataflow execution substrate:
//! - Declarative operator definitions with generics and properties
//! - Typed port trees carrying dynamic values and stream markers
//! - One worker thread per native operator, communicating only via ports
//! - Composite operators flattened into a graph of natives before execution
//! - A definition loader with library search paths and recursion detection
//! - An HTTP runner daemon for starting and stopping operator instances

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules implementing the dataflow substrate
pub mod runtime;

/// Builtin operator catalog
pub mod elem;

/// Definition loader and library environment
pub mod loader;

/// HTTP runner daemon
pub mod daemon;

// Re-export key types for convenience
pub use runtime::def::OperatorDef;
pub use runtime::operator::Operator;
pub use runtime::value::Value;

/// Current version of the weft runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

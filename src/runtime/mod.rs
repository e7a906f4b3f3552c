//! Dataflow execution substrate
//!
//! The core of the runtime: the type grammar and declarative operator
//! definitions, the typed port trees values stream through, operators
//! with their worker lifecycle, the reference parser, the builder and
//! flattener, and the builtin catalog.

pub mod builder;
pub mod def;
pub mod error;
pub mod expr;
pub mod operator;
pub mod port;
pub mod reference;
pub mod registry;
pub mod typedef;
pub mod value;

pub use builder::{build_and_compile, create_and_connect_operator};
pub use def::{DelegateDef, InstanceDef, OperatorDef, ServiceDef, MAIN_SERVICE};
pub use error::{Result, RuntimeError};
pub use operator::{Delegate, Operator, Service};
pub use port::{Direction, Port};
pub use reference::parse_port_reference;
pub use registry::{BuiltinCatalog, BuiltinConfig};
pub use typedef::{Generics, TypeDef, TypeDefMap, TypeKind};
pub use value::{Marker, Properties, StreamId, Value};

//! Operators, services, delegates, and worker lifecycle
//!
//! An operator owns the port trees of its services and delegates. Native
//! operators run one worker thread executing their body; composite
//! operators own children and are inlined by [`Operator::compile`]
//! before execution so that values only ever flow between natives.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use super::def::{InstanceDef, OperatorDef};
use super::error::{Result, RuntimeError};
use super::port::{Attachment, Direction, FrameRef, Port};
use super::typedef::Generics;
use super::value::{Marker, Properties, Value};

/// Body function of a native operator, run by its worker thread
pub type BodyFn = Arc<dyn Fn(&Arc<Operator>) + Send + Sync>;

/// Connect-time hook of a native operator, called for each inbound
/// connection as `hook(op, dst, src)`
pub type ConnectHook =
    Arc<dyn Fn(&Arc<Operator>, &Arc<Port>, &Arc<Port>) -> Result<()> + Send + Sync>;

/// In/Out port tree pair exposing an operator interface
#[derive(Debug)]
pub struct Service {
    name: String,
    input: Arc<Port>,
    output: Arc<Port>,
}

impl Service {
    /// Name of this service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port tree the operator reads.
    pub fn input(&self) -> &Arc<Port> {
        &self.input
    }

    /// The port tree the operator emits on.
    pub fn output(&self) -> &Arc<Port> {
        &self.output
    }
}

/// Inverted port pair through which an operator calls back into the
/// surrounding graph: the body writes to [`Delegate::output`] and reads
/// the answer from [`Delegate::input`].
#[derive(Debug)]
pub struct Delegate {
    name: String,
    input: Arc<Port>,
    output: Arc<Port>,
}

impl Delegate {
    /// Name of this delegate.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port tree carrying answers back to the operator.
    pub fn input(&self) -> &Arc<Port> {
        &self.input
    }

    /// The port tree the operator hands values to the graph on.
    pub fn output(&self) -> &Arc<Port> {
        &self.output
    }
}

/// A node in the dataflow graph
pub struct Operator {
    name: RwLock<String>,
    me: Weak<Operator>,
    parent: RwLock<Weak<Operator>>,
    children: RwLock<BTreeMap<String, Arc<Operator>>>,
    services: BTreeMap<String, Service>,
    delegates: BTreeMap<String, Delegate>,
    properties: Properties,
    generics: Generics,
    def: OperatorDef,
    body: Option<BodyFn>,
    connect_hook: Option<ConnectHook>,
    ambient: Mutex<Vec<FrameRef>>,
    stopped: AtomicBool,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("services", &self.services)
            .field("delegates", &self.delegates)
            .field("properties", &self.properties)
            .field("generics", &self.generics)
            .field("def", &self.def)
            .field("has_body", &self.body.is_some())
            .field("has_connect_hook", &self.connect_hook.is_some())
            .field("stopped", &self.stopped)
            .field("started", &self.started)
            .finish()
    }
}

impl Operator {
    /// Construct an operator from a fully specialized definition.
    ///
    /// Native operators pass a body (and optionally a connect hook);
    /// composites pass neither and get their children attached by the
    /// builder.
    pub fn new(
        name: impl Into<String>,
        body: Option<BodyFn>,
        connect_hook: Option<ConnectHook>,
        generics: Generics,
        properties: Properties,
        def: OperatorDef,
    ) -> Result<Arc<Operator>> {
        for service in def.services.values() {
            service.in_.generics_specified()?;
            service.out.generics_specified()?;
        }
        for delegate in def.delegates.values() {
            delegate.in_.generics_specified()?;
            delegate.out.generics_specified()?;
        }

        let name = name.into();
        Ok(Arc::new_cyclic(|me: &Weak<Operator>| {
            let services = def
                .services
                .iter()
                .map(|(service_name, sdef)| {
                    let attachment = Attachment::Service(service_name.clone());
                    (
                        service_name.clone(),
                        Service {
                            name: service_name.clone(),
                            input: Port::from_type_unchecked(
                                &sdef.in_,
                                Direction::In,
                                me,
                                attachment.clone(),
                            ),
                            output: Port::from_type_unchecked(
                                &sdef.out,
                                Direction::Out,
                                me,
                                attachment,
                            ),
                        },
                    )
                })
                .collect();

            let delegates = def
                .delegates
                .iter()
                .map(|(delegate_name, ddef)| {
                    let attachment = Attachment::Delegate(delegate_name.clone());
                    (
                        delegate_name.clone(),
                        Delegate {
                            name: delegate_name.clone(),
                            input: Port::from_type_unchecked(
                                &ddef.in_,
                                Direction::In,
                                me,
                                attachment.clone(),
                            ),
                            output: Port::from_type_unchecked(
                                &ddef.out,
                                Direction::Out,
                                me,
                                attachment,
                            ),
                        },
                    )
                })
                .collect();

            Operator {
                name: RwLock::new(name.clone()),
                me: me.clone(),
                parent: RwLock::new(Weak::new()),
                children: RwLock::new(BTreeMap::new()),
                services,
                delegates,
                properties,
                generics,
                def,
                body,
                connect_hook,
                ambient: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                started: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }
        }))
    }

    /// Instance name of this operator.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    fn arc(&self) -> Arc<Operator> {
        self.me.upgrade().expect("operator accessed after teardown")
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    /// The specialized definition this operator was built from.
    pub fn def(&self) -> &OperatorDef {
        &self.def
    }

    /// True iff this operator has a body and runs a worker.
    pub fn is_native(&self) -> bool {
        self.body.is_some()
    }

    /// The enclosing operator, if any.
    pub fn parent(&self) -> Option<Arc<Operator>> {
        self.parent.read().upgrade()
    }

    /// Attach this operator as a child of `parent`.
    pub fn set_parent(&self, parent: &Arc<Operator>) {
        *self.parent.write() = Arc::downgrade(parent);
        parent.children.write().insert(self.name(), self.arc());
    }

    /// The named child operator.
    pub fn child(&self, name: &str) -> Option<Arc<Operator>> {
        self.children.read().get(name).cloned()
    }

    /// Names of all children, in deterministic order.
    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    /// The default `main` service.
    ///
    /// Every buildable operator declares `main`; a missing one is a
    /// blueprint authoring bug, so this panics rather than propagating.
    pub fn main(&self) -> &Service {
        self.services
            .get(super::def::MAIN_SERVICE)
            .expect("operator has no main service")
    }

    /// The named service.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// The named delegate.
    pub fn delegate(&self, name: &str) -> Option<&Delegate> {
        self.delegates.get(name)
    }

    /// All services, in deterministic order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// All delegates, in deterministic order.
    pub fn delegates(&self) -> impl Iterator<Item = &Delegate> {
        self.delegates.values()
    }

    /// The immutable property value bound at construction.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Property bag bound at construction.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Generic bindings this instance was specialized with.
    pub fn generics(&self) -> &Generics {
        &self.generics
    }

    pub(crate) fn connect_hook(&self) -> Option<ConnectHook> {
        self.connect_hook.clone()
    }

    pub(crate) fn ambient_frames(&self) -> Vec<FrameRef> {
        self.ambient.lock().clone()
    }

    pub(crate) fn set_ambient_frames(&self, frames: Vec<FrameRef>) {
        *self.ambient.lock() = frames;
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Start this operator: children first, then the own worker thread
    /// for natives. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let children: Vec<Arc<Operator>> = self.children.read().values().cloned().collect();
        for child in children {
            child.start()?;
        }

        if let Some(body) = self.body.clone() {
            let op = self.arc();
            let name = self.name();
            let handle = thread::Builder::new()
                .name(format!("weft-{name}"))
                .spawn(move || {
                    tracing::debug!(operator = %name, "worker started");
                    if std::panic::catch_unwind(AssertUnwindSafe(|| body(&op))).is_err() {
                        tracing::error!(
                            operator = %name,
                            "worker tore down after protocol violation"
                        );
                    } else {
                        tracing::debug!(operator = %name, "worker stopped");
                    }
                })?;
            self.workers.lock().push(handle);
        }
        Ok(())
    }

    /// Stop this operator and its children, top-down.
    ///
    /// Sets the stop flag, pushes a stop sentinel into every input leaf
    /// so parked pulls wake at the next protocol checkpoint, and joins
    /// the worker.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for service in self.services.values() {
            service.input().push(Value::Marker(Marker::Stop));
        }
        for delegate in self.delegates.values() {
            delegate.input().push(Value::Marker(Marker::Stop));
        }

        let children: Vec<Arc<Operator>> = self.children.read().values().cloned().collect();
        for child in children {
            child.stop();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Polled by worker bodies between pulls.
    pub fn check_stop(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Flattening

    /// Inline composite children so only natives remain, reconnecting
    /// boundary ports directly. Idempotent on an already-flat operator.
    /// Returns the number of native operators below this one.
    pub fn compile(&self) -> usize {
        let children: Vec<Arc<Operator>> = self.children.read().values().cloned().collect();
        let mut natives = 0;

        for child in children {
            if child.is_native() {
                natives += 1;
                continue;
            }
            natives += child.compile();

            for service in child.services.values() {
                for leaf in service.input().leaves() {
                    leaf.splice();
                }
                for leaf in service.output().leaves() {
                    leaf.splice();
                }
            }
            for delegate in child.delegates.values() {
                for leaf in delegate.input().leaves() {
                    leaf.splice();
                }
                for leaf in delegate.output().leaves() {
                    leaf.splice();
                }
            }

            let child_name = child.name();
            let grandchildren = std::mem::take(&mut *child.children.write());
            let mut my_children = self.children.write();
            my_children.remove(&child_name);
            for (grandchild_name, grandchild) in grandchildren {
                let lifted_name = format!("{child_name}#{grandchild_name}");
                grandchild.set_name(lifted_name.clone());
                *grandchild.parent.write() = self.me.clone();
                my_children.insert(lifted_name, grandchild);
            }
        }

        natives
    }

    /// Serialize the currently built operator tree as a flat definition:
    /// children are the native leaves, connections every wire.
    pub fn define(&self) -> Result<OperatorDef> {
        let mut def = self.def.copy();

        let children = self.children.read();
        for (name, child) in children.iter() {
            let elementary = child.def.elementary.clone().ok_or_else(|| {
                RuntimeError::UnknownOperator(format!(
                    "operator \"{name}\" is not elementary after flattening"
                ))
            })?;
            let mut instance = InstanceDef::new(name.clone(), elementary);
            instance.properties = child.properties.clone();
            instance.generics = child.generics.clone();
            def.instances.push(instance);
        }

        let mut source_leaves: Vec<Arc<Port>> = Vec::new();
        for service in self.services.values() {
            source_leaves.extend(service.input().leaves());
        }
        for delegate in self.delegates.values() {
            source_leaves.extend(delegate.input().leaves());
        }
        for child in children.values() {
            for service in child.services.values() {
                source_leaves.extend(service.output().leaves());
            }
            for delegate in child.delegates.values() {
                source_leaves.extend(delegate.output().leaves());
            }
        }

        for source in source_leaves {
            let destinations = source.destinations();
            if destinations.is_empty() {
                continue;
            }
            let mut refs = Vec::with_capacity(destinations.len());
            for dest in destinations {
                refs.push(dest.reference_string(self)?);
            }
            def.connections.insert(source.reference_string(self)?, refs);
        }

        Ok(def)
    }

    /// Verify every leaf input of every child (and every own output
    /// leaf) has exactly one source.
    pub fn correctly_compiled(&self) -> Result<()> {
        let unconnected = |leaf: &Arc<Port>, top: &Operator| -> RuntimeError {
            match leaf.reference_string(top) {
                Ok(reference) => RuntimeError::UnconnectedInput(reference),
                Err(err) => err,
            }
        };

        for child in self.children.read().values() {
            for service in child.services.values() {
                for leaf in service.input().leaves() {
                    if leaf.source_count() != 1 {
                        return Err(unconnected(&leaf, self));
                    }
                }
            }
            for delegate in child.delegates.values() {
                for leaf in delegate.input().leaves() {
                    if leaf.source_count() != 1 {
                        return Err(unconnected(&leaf, self));
                    }
                }
            }
        }
        for service in self.services.values() {
            for leaf in service.output().leaves() {
                if leaf.source_count() != 1 {
                    return Err(unconnected(&leaf, self));
                }
            }
        }
        Ok(())
    }
}

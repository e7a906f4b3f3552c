//! Typed port trees and the value protocol
//!
//! A port tree is the runtime mirror of a [`TypeDef`]: leaf ports carry
//! queues of values, parent ports aggregate shape. Markers pushed at a
//! parent fan out to every descendant leaf; pulls at a parent compose a
//! value (or synchronize on a marker present at every leaf). Stream
//! ports carry an identity used to tag BOS/EOS markers, letting readers
//! distinguish their own stream boundaries from those of an enclosing
//! stream passing through.
//!
//! Connections are wired leaf-to-leaf, lifted to parents by structural
//! recursion. Wiring also threads stream identities downstream: the
//! destination port of a stream connection adopts the source's frame,
//! and the enclosing frames of a connection propagate through operators
//! so that markers issued far upstream are still recognized as "own" by
//! the ports they eventually frame.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

use super::error::{Result, RuntimeError};
use super::operator::Operator;
use super::typedef::{TypeDef, TypeKind};
use super::value::{Marker, StreamId, Value};

/// Direction of a port tree relative to its owning operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Values flow into the operator
    In,
    /// Values flow out of the operator
    Out,
}

/// Where a port tree hangs on its operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Part of the named service
    Service(String),
    /// Part of the named delegate
    Delegate(String),
}

/// A stream identity cell; ports sharing a frame recognize the same
/// BOS/EOS markers as their own.
#[derive(Debug)]
pub struct Frame {
    id: StreamId,
}

/// Shared handle to a frame
pub type FrameRef = Arc<Frame>;

impl Frame {
    fn fresh() -> FrameRef {
        Arc::new(Frame {
            id: StreamId::new(),
        })
    }

    /// The identity markers issued under this frame carry.
    pub fn id(&self) -> StreamId {
        self.id
    }
}

#[derive(Debug)]
struct LeafState {
    queue: VecDeque<Value>,
    dests: Vec<Arc<Port>>,
    sources: Vec<Weak<Port>>,
    buffered: bool,
}

/// A node of a port tree
#[derive(Debug)]
pub struct Port {
    kind: TypeKind,
    direction: Direction,
    operator: Weak<Operator>,
    attachment: Attachment,
    me: Weak<Port>,
    parent: Weak<Port>,
    /// Key under the parent map port, if any
    key: Option<String>,
    /// Substream child, present iff `kind` is `stream`
    sub: Option<Arc<Port>>,
    /// Named children, present iff `kind` is `map`
    entries: BTreeMap<String, Arc<Port>>,
    /// Stream identity slot, present iff `kind` is `stream`
    frame: Option<Mutex<FrameRef>>,
    state: Mutex<LeafState>,
    ready: Condvar,
}

impl Port {
    /// Build a port tree mirroring `td`. The type must be fully
    /// specialized; bare generics cannot become ports.
    pub(crate) fn from_type(
        td: &TypeDef,
        direction: Direction,
        operator: &Weak<Operator>,
        attachment: Attachment,
    ) -> Result<Arc<Port>> {
        td.generics_specified()?;
        Ok(Self::build(td, direction, operator, attachment, &Weak::new(), None))
    }

    /// Build a port tree for a type already known to be specialized.
    pub(crate) fn from_type_unchecked(
        td: &TypeDef,
        direction: Direction,
        operator: &Weak<Operator>,
        attachment: Attachment,
    ) -> Arc<Port> {
        Self::build(td, direction, operator, attachment, &Weak::new(), None)
    }

    fn build(
        td: &TypeDef,
        direction: Direction,
        operator: &Weak<Operator>,
        attachment: Attachment,
        parent: &Weak<Port>,
        key: Option<String>,
    ) -> Arc<Port> {
        Arc::new_cyclic(|me: &Weak<Port>| {
            let sub = td.stream.as_ref().map(|child| {
                Self::build(child, direction, operator, attachment.clone(), me, None)
            });
            let entries = td
                .map
                .as_ref()
                .map(|children| {
                    children
                        .iter()
                        .map(|(name, child)| {
                            (
                                name.clone(),
                                Self::build(
                                    child,
                                    direction,
                                    operator,
                                    attachment.clone(),
                                    me,
                                    Some(name.clone()),
                                ),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();

            Port {
                kind: td.kind,
                direction,
                operator: operator.clone(),
                attachment: attachment.clone(),
                me: me.clone(),
                parent: parent.clone(),
                key,
                sub,
                entries,
                frame: (td.kind == TypeKind::Stream).then(|| Mutex::new(Frame::fresh())),
                state: Mutex::new(LeafState {
                    queue: VecDeque::new(),
                    dests: Vec::new(),
                    sources: Vec::new(),
                    buffered: false,
                }),
                ready: Condvar::new(),
            }
        })
    }

    /// Discriminant of this node.
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Direction relative to the owning operator.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Service or delegate this port belongs to.
    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    /// The operator owning this port.
    pub fn operator(&self) -> Arc<Operator> {
        self.operator
            .upgrade()
            .expect("port outlived its owning operator")
    }

    fn arc(&self) -> Arc<Port> {
        self.me.upgrade().expect("port accessed outside its tree")
    }

    /// True iff this node carries a queue rather than children.
    pub fn is_leaf(&self) -> bool {
        !matches!(self.kind, TypeKind::Stream | TypeKind::Map)
    }

    /// Descend into the substream child.
    pub fn stream(&self) -> Option<Arc<Port>> {
        self.sub.clone()
    }

    /// Descend into the named map child.
    pub fn map(&self, key: &str) -> Option<Arc<Port>> {
        self.entries.get(key).cloned()
    }

    /// Keys of the map children, in deterministic order.
    pub fn map_keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// The identity of this stream port, if it is one. Markers issued
    /// by the connected upstream source carry this identity.
    pub fn stream_identity(&self) -> Option<StreamId> {
        self.frame.as_ref().map(|_| self.frame_id())
    }

    fn sub_port(&self) -> &Arc<Port> {
        self.sub.as_ref().expect("stream port without substream")
    }

    // ------------------------------------------------------------------
    // Stream identity

    fn frame_ref(&self) -> FrameRef {
        self.frame
            .as_ref()
            .expect("not a stream port")
            .lock()
            .clone()
    }

    fn frame_id(&self) -> StreamId {
        self.frame_ref().id()
    }

    fn adopt_frame(&self, frame: FrameRef) {
        *self.frame.as_ref().expect("not a stream port").lock() = frame;
    }

    /// Allocate a BOS marker tagged with this stream's identity.
    pub fn new_bos(&self) -> Value {
        Value::Marker(Marker::Bos(self.frame_id()))
    }

    /// Allocate an EOS marker tagged with this stream's identity.
    pub fn new_eos(&self) -> Value {
        Value::Marker(Marker::Eos(self.frame_id()))
    }

    /// Emit a BOS marker into every descendant leaf.
    pub fn push_bos(&self) {
        self.push(self.new_bos());
    }

    /// Emit an EOS marker into every descendant leaf.
    pub fn push_eos(&self) {
        self.push(self.new_eos());
    }

    /// True iff `value` is a begin marker of this stream.
    pub fn own_bos(&self, value: &Value) -> bool {
        self.frame.is_some()
            && matches!(value, Value::Marker(Marker::Bos(id)) if *id == self.frame_id())
    }

    /// True iff `value` is an end marker of this stream.
    pub fn own_eos(&self, value: &Value) -> bool {
        self.frame.is_some()
            && matches!(value, Value::Marker(Marker::Eos(id)) if *id == self.frame_id())
    }

    // ------------------------------------------------------------------
    // Push / pull

    /// Send a value or marker through this port.
    ///
    /// Markers fan out to every descendant leaf. Composed data pushed at
    /// a parent is decomposed: a stream body is framed by this port's
    /// BOS/EOS, a map value is split among the children.
    ///
    /// Panics on a protocol violation: data of the wrong shape for this
    /// node. The panic tears down the calling worker only.
    pub fn push(&self, value: Value) {
        if value.is_marker() {
            self.broadcast(value);
            return;
        }

        match self.kind {
            TypeKind::Stream => match value {
                Value::Stream(items) => {
                    self.push_bos();
                    for item in items {
                        self.sub_port().push(item);
                    }
                    self.push_eos();
                }
                Value::Null => {
                    self.push_bos();
                    self.push_eos();
                }
                other => panic!("stream port cannot carry {other:?}"),
            },
            TypeKind::Map => {
                let mut composed = match value {
                    Value::Map(m) => m,
                    other => panic!("map port cannot carry {other:?}"),
                };
                for (key, child) in &self.entries {
                    let entry = composed
                        .remove(key)
                        .unwrap_or_else(|| panic!("missing map entry \"{key}\""));
                    child.push(entry);
                }
            }
            _ => self.deliver(value),
        }
    }

    fn broadcast(&self, marker: Value) {
        if self.is_leaf() {
            self.deliver(marker);
            return;
        }
        if let Some(sub) = self.sub.as_ref() {
            sub.broadcast(marker);
            return;
        }
        for child in self.entries.values() {
            child.broadcast(marker.clone());
        }
    }

    fn deliver(&self, value: Value) {
        let (dests, buffered) = {
            let state = self.state.lock();
            (state.dests.clone(), state.buffered)
        };

        if dests.is_empty() {
            self.enqueue(value);
            return;
        }
        if buffered {
            self.enqueue(value.clone());
        }
        let mut iter = dests.into_iter().peekable();
        while let Some(dest) = iter.next() {
            if iter.peek().is_none() {
                dest.deliver(value);
                break;
            }
            dest.deliver(value.clone());
        }
    }

    fn enqueue(&self, value: Value) {
        let mut state = self.state.lock();
        state.queue.push_back(value);
        self.ready.notify_all();
    }

    /// Blocking receive.
    ///
    /// On a leaf, dequeues the next value or marker. On a map port,
    /// composes one value from every child (or returns a marker present
    /// at the head of every child). On a stream port, assembles the
    /// sequence between this stream's own BOS and EOS; a foreign marker
    /// at the head passes through untouched.
    ///
    /// Panics on a protocol violation such as mixed markers at a map
    /// port or an element outside BOS/EOS framing.
    pub fn pull(&self) -> Value {
        match self.kind {
            TypeKind::Stream => {
                let head = self.sub_port().pull();
                match head {
                    Value::Marker(marker) => {
                        if self.own_bos(&Value::Marker(marker)) {
                            self.assemble()
                        } else {
                            Value::Marker(marker)
                        }
                    }
                    other => panic!("stream element outside BOS/EOS framing: {other:?}"),
                }
            }
            TypeKind::Map => {
                let mut composed = BTreeMap::new();
                let mut marker: Option<Marker> = None;
                for (index, (key, child)) in self.entries.iter().enumerate() {
                    let value = child.pull();
                    match (index, &value) {
                        (0, Value::Marker(m)) if m.is_control() => marker = Some(*m),
                        (_, Value::Marker(m)) if m.is_control() => {
                            let expected = marker.unwrap_or_else(|| {
                                panic!("marker {m:?} mixed with data at map port")
                            });
                            if *m != expected {
                                panic!("mismatched markers at map port: {expected:?} vs {m:?}");
                            }
                        }
                        (_, _) => {
                            if let Some(m) = marker {
                                panic!("data mixed with marker {m:?} at map port");
                            }
                            composed.insert(key.clone(), value);
                        }
                    }
                }
                match marker {
                    Some(m) => Value::Marker(m),
                    None => Value::Map(composed),
                }
            }
            _ => self.dequeue(),
        }
    }

    fn assemble(&self) -> Value {
        let mut items = Vec::new();
        loop {
            let value = self.sub_port().pull();
            if let Value::Marker(marker) = value {
                if self.own_eos(&Value::Marker(marker)) {
                    return Value::Stream(items);
                }
                if marker == Marker::Stop {
                    return Value::Marker(Marker::Stop);
                }
                if !marker.is_control() {
                    items.push(Value::Marker(marker));
                    continue;
                }
                panic!("unexpected marker {marker:?} inside stream body");
            }
            items.push(value);
        }
    }

    fn dequeue(&self) -> Value {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.queue.pop_front() {
                return value;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Install an unbounded local buffer so this (typically output)
    /// port retains a copy of everything it forwards.
    pub fn bufferize(&self) {
        if self.is_leaf() {
            self.state.lock().buffered = true;
            return;
        }
        if let Some(sub) = self.sub.as_ref() {
            sub.bufferize();
        }
        for child in self.entries.values() {
            child.bufferize();
        }
    }

    // ------------------------------------------------------------------
    // Connection

    /// Wire this port to `dst`, lifting leaf connections over the whole
    /// subtree by structural recursion. A source may fan out to many
    /// destinations; each destination accepts exactly one source.
    pub fn connect(&self, dst: &Arc<Port>) -> Result<()> {
        unify_enclosing_frames(self, dst);
        self.connect_inner(dst)
    }

    fn connect_inner(&self, dst: &Arc<Port>) -> Result<()> {
        match (self.kind, dst.kind) {
            (TypeKind::Stream, TypeKind::Stream) => {
                dst.adopt_frame(self.frame_ref());
                self.sub_port().connect_inner(dst.sub_port())
            }
            (TypeKind::Map, TypeKind::Map) => {
                if self.entries.len() != dst.entries.len()
                    || !self.entries.keys().eq(dst.entries.keys())
                {
                    return Err(RuntimeError::IncompatibleConnection(format!(
                        "map ports with different keys: {:?} vs {:?}",
                        self.entries.keys().collect::<Vec<_>>(),
                        dst.entries.keys().collect::<Vec<_>>()
                    )));
                }
                for (key, child) in &self.entries {
                    child.connect_inner(&dst.entries[key])?;
                }
                Ok(())
            }
            (src_kind, dst_kind) if self.is_leaf() && dst.is_leaf() => {
                let compatible = src_kind == dst_kind
                    || matches!(dst_kind, TypeKind::Primitive | TypeKind::Trigger)
                    || src_kind == TypeKind::Primitive;
                if !compatible {
                    return Err(RuntimeError::IncompatibleConnection(format!(
                        "{src_kind} port cannot feed {dst_kind} port"
                    )));
                }

                {
                    let mut dst_state = dst.state.lock();
                    if !dst_state.sources.is_empty() {
                        return Err(RuntimeError::IncompatibleConnection(
                            "destination already has a source".to_string(),
                        ));
                    }
                    dst_state.sources.push(self.me.clone());
                }
                self.state.lock().dests.push(dst.clone());
                Ok(())
            }
            (src_kind, dst_kind) => Err(RuntimeError::IncompatibleConnection(format!(
                "{src_kind} port cannot feed {dst_kind} port"
            ))),
        }
    }

    /// Number of sources wired into this leaf.
    pub(crate) fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Destination leaves wired from this leaf.
    pub(crate) fn destinations(&self) -> Vec<Arc<Port>> {
        self.state.lock().dests.clone()
    }

    /// Every leaf below (or at) this node, in deterministic order.
    pub fn leaves(&self) -> Vec<Arc<Port>> {
        if self.is_leaf() {
            return vec![self.arc()];
        }
        if let Some(sub) = self.sub.as_ref() {
            return sub.leaves();
        }
        self.entries.values().flat_map(|child| child.leaves()).collect()
    }

    /// Remove this boundary leaf from the wiring, reconnecting its
    /// sources directly to its destinations. Used when composites are
    /// inlined.
    pub(crate) fn splice(&self) {
        let (sources, dests) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.sources),
                std::mem::take(&mut state.dests),
            )
        };

        let sources: Vec<Arc<Port>> = sources.iter().filter_map(Weak::upgrade).collect();

        for source in &sources {
            let mut state = source.state.lock();
            state.dests.retain(|d| !std::ptr::eq(d.as_ref(), self));
            state.dests.extend(dests.iter().cloned());
        }
        for dest in &dests {
            let mut state = dest.state.lock();
            state.sources.retain(|s| {
                s.upgrade()
                    .map(|s| !std::ptr::eq(s.as_ref(), self))
                    .unwrap_or(false)
            });
            state
                .sources
                .extend(sources.iter().map(Arc::downgrade));
        }
    }

    // ------------------------------------------------------------------
    // Reference formatting

    /// Render the textual reference resolving to this port against the
    /// given top-level operator, the inverse of the reference parser.
    pub(crate) fn reference_string(&self, top: &Operator) -> Result<String> {
        let mut segments = Vec::new();
        let mut node = self.arc();
        loop {
            let parent = match node.parent.upgrade() {
                Some(parent) => parent,
                None => break,
            };
            match node.key.as_ref() {
                Some(key) => segments.push(key.clone()),
                None => segments.push("~".to_string()),
            }
            node = parent;
        }
        segments.reverse();
        let path = segments.join(".");

        let owner = self.operator();
        let own = std::ptr::eq(owner.as_ref(), top);
        let op_part = match (&self.attachment, own) {
            (Attachment::Service(name), true) if name == super::def::MAIN_SERVICE => String::new(),
            (Attachment::Service(name), true) => format!("{name}@"),
            (Attachment::Delegate(name), true) => format!(".{name}"),
            (Attachment::Service(name), false) if name == super::def::MAIN_SERVICE => owner.name(),
            (Attachment::Service(name), false) => format!("{name}@{}", owner.name()),
            (Attachment::Delegate(name), false) => format!("{}.{name}", owner.name()),
        };

        let sep = match self.direction {
            Direction::In => '(',
            Direction::Out => ')',
        };
        Ok(format!("{op_part}{sep}{path}"))
    }
}

/// Thread the enclosing stream identities of a new connection.
///
/// The stream ports strictly above the destination adopt the frames
/// enclosing the source, innermost first. Frames of the source beyond
/// the destination's depth become the ambient frames of the destination
/// operator when the connection feeds its main input, so that markers
/// passing through the operator's body are still recognized downstream.
fn unify_enclosing_frames(src: &Port, dst: &Port) {
    let mut src_frames: Vec<FrameRef> = Vec::new();
    let mut cursor = src.parent.upgrade();
    while let Some(port) = cursor {
        if port.kind == TypeKind::Stream {
            src_frames.push(port.frame_ref());
        }
        cursor = port.parent.upgrade();
    }
    src_frames.extend(src.operator().ambient_frames());

    let mut dst_ports: Vec<Arc<Port>> = Vec::new();
    let mut cursor = dst.parent.upgrade();
    while let Some(port) = cursor {
        if port.kind == TypeKind::Stream {
            dst_ports.push(port.clone());
        }
        cursor = port.parent.upgrade();
    }

    let mut src_iter = src_frames.into_iter();
    for dst_port in &dst_ports {
        match src_iter.next() {
            Some(frame) => dst_port.adopt_frame(frame),
            None => break,
        }
    }

    let remainder: Vec<FrameRef> = src_iter.collect();
    if dst.direction == Direction::In
        && matches!(&dst.attachment, Attachment::Service(name) if name == super::def::MAIN_SERVICE)
    {
        dst.operator().set_ambient_frames(remainder);
    }
}

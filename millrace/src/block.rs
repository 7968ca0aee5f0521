//! The block contract: what user computation implements and what it sees
//! inside `work()`.

use std::any::Any;
use std::collections::HashMap;

use crate::buffer::BufferManager;
use crate::dtype::DType;
use crate::error::Error;
use crate::object::{ArgKind, CallReturn, CallTable, OpaqueFn, Value};
use crate::port::{InputPort, OutputPort};

/// A unit of computation with typed ports.
///
/// Implementations declare their ports, calls, signals, slots, and probes
/// in [`Block::setup`], then process data in [`Block::work`]. The owning
/// actor never calls `work()` concurrently with itself; registered calls
/// arriving from other threads run between `work()` invocations.
pub trait Block: Send + 'static {
    /// Declares ports and registered calls. Runs once at registration.
    fn setup(&mut self, setup: &mut BlockSetup);

    /// The work method, called when resources are available.
    ///
    /// May read inputs, produce outputs, post labels and messages, and
    /// request a reschedule. Must not block. An error fails this block
    /// (surfaced through its stats) without tearing down the topology.
    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        let _ = io;
        Ok(())
    }

    /// Hook invoked when topology execution begins.
    fn activate(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Hook invoked when topology execution ends. Failures are logged.
    fn deactivate(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Whether the block could do any work this tick, regardless of port
    /// state. A false return short-circuits activation.
    fn prepare(&mut self) -> bool {
        true
    }

    /// Forwards labels consumed by the last `work()` to the outputs.
    ///
    /// The default forwards every consumed-window label to every
    /// stream-typed output. Override to mutate, drop, or reindex.
    fn propagate_labels(&mut self, input: &InputPort, outputs: &mut [OutputPort]) {
        default_label_propagation(input, outputs);
    }

    /// Offers a buffer manager for an input port, given the upstream
    /// domain. Return `Ok(None)` to defer to the peer, a manager to
    /// provide one, or an error to protest the domain.
    fn input_buffer_manager(
        &mut self,
        name: &str,
        upstream_domain: &str,
    ) -> Result<Option<Box<dyn BufferManager>>, Error> {
        let _ = (name, upstream_domain);
        Ok(None)
    }

    /// Offers a buffer manager for an output port, given the downstream
    /// domain. Same contract as [`Block::input_buffer_manager`].
    fn output_buffer_manager(
        &mut self,
        name: &str,
        downstream_domain: &str,
    ) -> Result<Option<Box<dyn BufferManager>>, Error> {
        let _ = (name, downstream_domain);
        Ok(None)
    }

    /// Wildcard call handler, consulted after registered overloads and
    /// probes.
    fn opaque_call(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let _ = args;
        Err(Error::no_call("", name))
    }

    /// Dispatch hook used by registered calls.
    fn as_any(&mut self) -> &mut dyn Any;
}

/// The default label propagation policy: forward every consumed-window
/// label to every stream-typed output.
pub fn default_label_propagation(input: &InputPort, outputs: &mut [OutputPort]) {
    for label in input.consumed_labels() {
        for output in outputs.iter_mut() {
            if !output.dtype().is_empty() && !output.is_signal() {
                output.forward_label(label.clone());
            }
        }
    }
}

pub(crate) struct PortDef {
    pub(crate) name: String,
    pub(crate) dtype: DType,
    pub(crate) domain: String,
    pub(crate) sig_slot: bool,
}

/// Collects a block's ports, calls, signals, slots, and probes during
/// [`Block::setup`].
pub struct BlockSetup {
    pub(crate) name: String,
    pub(crate) inputs: Vec<PortDef>,
    pub(crate) outputs: Vec<PortDef>,
    pub(crate) calls: CallTable,
    pub(crate) named_handlers: HashMap<String, OpaqueFn>,
    /// slot name -> (registered call, triggered signal)
    pub(crate) probes: HashMap<String, (String, String)>,
}

impl BlockSetup {
    pub(crate) fn new() -> Self {
        Self {
            name: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            calls: CallTable::new(),
            named_handlers: HashMap::new(),
            probes: HashMap::new(),
        }
    }

    /// Sets the block's display name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Configures an input port. Numeric names are also indexed.
    pub fn input(&mut self, name: impl ToString, dtype: DType, domain: &str) {
        self.inputs.push(PortDef {
            name: name.to_string(),
            dtype,
            domain: domain.to_owned(),
            sig_slot: false,
        });
    }

    /// Configures an output port. Numeric names are also indexed.
    pub fn output(&mut self, name: impl ToString, dtype: DType, domain: &str) {
        self.outputs.push(PortDef {
            name: name.to_string(),
            dtype,
            domain: domain.to_owned(),
            sig_slot: false,
        });
    }

    /// Registers a callable method.
    ///
    /// The call becomes an RPC endpoint; a unit-returning call whose name
    /// does not start with `_` also registers a slot of the same name.
    pub fn register_call<B, F>(&mut self, name: &str, signature: &[ArgKind], ret: CallReturn, f: F)
    where
        B: Block,
        F: FnMut(&mut B, &[Value]) -> Result<Value, Error> + Send + 'static,
    {
        let mut f = f;
        let handler: OpaqueFn = Box::new(move |any, args| {
            let block = any
                .downcast_mut::<B>()
                .ok_or_else(|| Error::runtime("registered call bound to a different block type"))?;
            f(block, args)
        });
        self.calls.register(name, signature, handler);
        if ret == CallReturn::Unit && !name.starts_with('_') {
            self.register_slot(name);
        }
    }

    /// Registers an opaque handler consulted for exactly this name when no
    /// typed overload binds.
    pub fn register_opaque<B, F>(&mut self, name: &str, f: F)
    where
        B: Block,
        F: FnMut(&mut B, &[Value]) -> Result<Value, Error> + Send + 'static,
    {
        let mut f = f;
        let handler: OpaqueFn = Box::new(move |any, args| {
            let block = any
                .downcast_mut::<B>()
                .ok_or_else(|| Error::runtime("opaque handler bound to a different block type"))?;
            f(block, args)
        });
        self.named_handlers.insert(name.to_owned(), handler);
    }

    /// Registers a signal: an outbound, message-only event port.
    pub fn register_signal(&mut self, name: &str) {
        if self.outputs.iter().any(|p| p.name == name) {
            return;
        }
        self.outputs.push(PortDef {
            name: name.to_owned(),
            dtype: DType::empty(),
            domain: String::new(),
            sig_slot: true,
        });
    }

    /// Registers a slot: an inbound, message-only event port whose
    /// messages dispatch the call of the same name.
    pub fn register_slot(&mut self, name: &str) {
        if self.inputs.iter().any(|p| p.name == name) {
            return;
        }
        self.inputs.push(PortDef {
            name: name.to_owned(),
            dtype: DType::empty(),
            domain: String::new(),
            sig_slot: true,
        });
    }

    /// Registers a probe for a registered call.
    ///
    /// The probe slot (default `probe<Name>`) invokes the call and emits
    /// its result on the triggered signal (default `<name>Triggered`).
    pub fn register_probe(&mut self, call: &str, signal: Option<&str>, slot: Option<&str>) {
        let mut upper = call.to_owned();
        if let Some(first) = upper.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        let slot_name = slot
            .map(|s| s.to_owned())
            .unwrap_or_else(|| format!("probe{upper}"));
        let signal_name = signal
            .map(|s| s.to_owned())
            .unwrap_or_else(|| format!("{call}Triggered"));
        self.register_slot(&slot_name);
        self.register_signal(&signal_name);
        self.probes
            .insert(slot_name, (call.to_owned(), signal_name));
    }
}

/// Session-wide work information, valid during `work()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkInfo {
    /// Minimum elements available across all streaming ports.
    pub min_elements: usize,
    /// Minimum elements available across streaming inputs.
    pub min_in_elements: usize,
    /// Minimum writable elements across streaming outputs.
    pub min_out_elements: usize,
}

/// The port surface handed to `work()`.
pub struct WorkIo<'a> {
    pub(crate) inputs: &'a mut [InputPort],
    pub(crate) outputs: &'a mut [OutputPort],
    pub(crate) info: WorkInfo,
    pub(crate) reschedule: bool,
}

impl<'a> WorkIo<'a> {
    /// The input port at this position.
    pub fn input(&mut self, index: usize) -> &mut InputPort {
        &mut self.inputs[index]
    }

    /// The input port with this name.
    pub fn input_named(&mut self, name: &str) -> Option<&mut InputPort> {
        self.inputs.iter_mut().find(|p| p.name() == name)
    }

    /// All input ports.
    pub fn inputs(&mut self) -> &mut [InputPort] {
        &mut *self.inputs
    }

    /// The output port at this position.
    pub fn output(&mut self, index: usize) -> &mut OutputPort {
        &mut self.outputs[index]
    }

    /// The output port with this name.
    pub fn output_named(&mut self, name: &str) -> Option<&mut OutputPort> {
        self.outputs.iter_mut().find(|p| p.name() == name)
    }

    /// All output ports.
    pub fn outputs(&mut self) -> &mut [OutputPort] {
        &mut *self.outputs
    }

    /// Both port slices, for loops that copy input to output.
    pub fn split(&mut self) -> (&mut [InputPort], &mut [OutputPort]) {
        (&mut *self.inputs, &mut *self.outputs)
    }

    /// The number of input ports.
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// The number of output ports.
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Session-wide work information.
    pub fn work_info(&self) -> &WorkInfo {
        &self.info
    }

    /// Asks the scheduler to call `work()` again without an external
    /// stimulus. Use when the block is making progress without consuming
    /// or producing.
    pub fn reschedule(&mut self) {
        self.reschedule = true;
    }

    /// Emits a signal to all subscribed slots.
    pub fn emit(&mut self, signal: &str, args: &[Value]) -> Result<(), Error> {
        let port = self
            .outputs
            .iter_mut()
            .find(|p| p.is_signal() && p.name() == signal)
            .ok_or_else(|| Error::no_port("", signal))?;
        port.post_message(Value::List(args.to_vec()));
        Ok(())
    }
}

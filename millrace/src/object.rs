//! Opaque values and the per-block call table.
//!
//! Messages, call arguments, and label data are `Value`s: a tagged variant
//! type for primitives with an `Opaque` fallback for arbitrary shared
//! objects. Every variant except `Opaque` round-trips through a bincode
//! blob, which is how labels and messages cross the mVRL boundary.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// An opaque message, call argument, or label payload.
#[derive(Clone, Debug)]
pub enum Value {
    /// Nothing; the return of slot-like calls.
    Unit,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A double precision float.
    Float(f64),
    /// A string.
    Str(String),
    /// A byte blob.
    Bytes(Vec<u8>),
    /// A list of values; signal emissions pack their arguments this way.
    List(Vec<Value>),
    /// An arbitrary shared object. Not serializable.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// A list value.
    pub fn list(values: Vec<Value>) -> Self {
        Value::List(values)
    }

    /// Wraps an arbitrary object.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    /// True for `Unit`.
    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    /// The integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The numeric payload as a float; integers convert.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Downcasts an opaque payload.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Value::Opaque(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Serializes this value into a blob.
    ///
    /// Opaque values refuse: the error propagates as a message-level
    /// failure without disturbing the framer that asked.
    pub fn to_blob(&self) -> Result<Vec<u8>, Error> {
        let wire = self.to_wire()?;
        bincode::serialize(&wire).map_err(|e| Error::runtime(format!("value serialization: {e}")))
    }

    /// Deserializes a value from a blob produced by [`Value::to_blob`].
    pub fn from_blob(blob: &[u8]) -> Result<Value, Error> {
        let wire: WireValue = bincode::deserialize(blob)
            .map_err(|e| Error::runtime(format!("value deserialization: {e}")))?;
        Ok(Value::from_wire(wire))
    }

    pub(crate) fn to_wire(&self) -> Result<WireValue, Error> {
        Ok(match self {
            Value::Unit => WireValue::Unit,
            Value::Bool(v) => WireValue::Bool(*v),
            Value::Int(v) => WireValue::Int(*v),
            Value::Float(v) => WireValue::Float(*v),
            Value::Str(v) => WireValue::Str(v.clone()),
            Value::Bytes(v) => WireValue::Bytes(v.clone()),
            Value::List(vs) => {
                let mut out = Vec::with_capacity(vs.len());
                for v in vs {
                    out.push(v.to_wire()?);
                }
                WireValue::List(out)
            }
            Value::Opaque(_) => {
                return Err(Error::runtime("opaque values are not serializable"));
            }
        })
    }

    pub(crate) fn from_wire(wire: WireValue) -> Value {
        match wire {
            WireValue::Unit => Value::Unit,
            WireValue::Bool(v) => Value::Bool(v),
            WireValue::Int(v) => Value::Int(v),
            WireValue::Float(v) => Value::Float(v),
            WireValue::Str(v) => Value::Str(v),
            WireValue::Bytes(v) => Value::Bytes(v),
            WireValue::List(vs) => Value::List(vs.into_iter().map(Value::from_wire).collect()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// The serializable mirror of [`Value`], minus `Opaque`.
#[derive(Serialize, Deserialize)]
pub(crate) enum WireValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
}

/// The kind of a call argument, used for overload matching.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// Accepts `Bool`.
    Bool,
    /// Accepts `Int`.
    Int,
    /// Accepts `Float` and, by conversion, `Int`.
    Float,
    /// Accepts `Str`.
    Str,
    /// Accepts `Bytes`.
    Bytes,
    /// Accepts `List`.
    List,
    /// Accepts anything.
    Any,
}

impl ArgKind {
    /// Whether a value of this kind can bind the given argument.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgKind::Bool => matches!(value, Value::Bool(_)),
            ArgKind::Int => matches!(value, Value::Int(_)),
            ArgKind::Float => matches!(value, Value::Float(_) | Value::Int(_)),
            ArgKind::Str => matches!(value, Value::Str(_)),
            ArgKind::Bytes => matches!(value, Value::Bytes(_)),
            ArgKind::List => matches!(value, Value::List(_)),
            ArgKind::Any => true,
        }
    }
}

/// Whether a registered call returns a value or unit.
///
/// Unit-returning calls whose name does not start with `_` also register a
/// slot of the same name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallReturn {
    /// The call returns nothing.
    Unit,
    /// The call returns a value.
    Value,
}

/// A dispatchable call handler over a type-erased block.
pub(crate) type OpaqueFn = Box<dyn FnMut(&mut dyn Any, &[Value]) -> Result<Value, Error> + Send>;

struct Overload {
    signature: Vec<ArgKind>,
    handler: OpaqueFn,
}

/// Registered calls of one block: typed overloads keyed by name.
///
/// Matching is exact-arity first, then argument-kind acceptance (with
/// numeric convertibility). Resolution falls through to the block's named
/// opaque handlers and wildcard handler, which the actor owns.
pub(crate) struct CallTable {
    overloads: HashMap<String, Vec<Overload>>,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        Self {
            overloads: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, name: &str, signature: &[ArgKind], handler: OpaqueFn) {
        self.overloads
            .entry(name.to_owned())
            .or_default()
            .push(Overload {
                signature: signature.to_vec(),
                handler,
            });
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.overloads.contains_key(name)
    }

    /// Exact-arity overload dispatch; `BlockCallNotFound` when nothing binds.
    pub(crate) fn dispatch(
        &mut self,
        block: &str,
        target: &mut dyn Any,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        if let Some(overloads) = self.overloads.get_mut(name) {
            for overload in overloads.iter_mut() {
                if overload.signature.len() == args.len()
                    && overload
                        .signature
                        .iter()
                        .zip(args)
                        .all(|(kind, arg)| kind.accepts(arg))
                {
                    return (overload.handler)(target, args);
                }
            }
        }
        Err(Error::no_call(block, name))
    }
}

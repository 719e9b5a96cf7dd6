//! Callable values: bytecode closures and native functions.

use std::sync::Arc;

use crate::compiler::Program;
use crate::vm::interpreter::Vm;
use crate::vm::stash::{PrivateEnvRef, StashRef};

use super::object::ObjRef;
use super::value::Value;

/// A callable value.
#[derive(Clone)]
pub enum Callable {
    /// A compiled function plus everything it captured at instantiation.
    Closure(Closure),
    /// A native Rust function.
    Native(NativeFunction),
}

impl Callable {
    /// Whether `new` may be applied to this callable.
    pub fn is_constructible(&self) -> bool {
        match self {
            Callable::Closure(closure) => !closure.program.flags.no_construct,
            Callable::Native(_) => false,
        }
    }

    /// The display name.
    pub fn name(&self) -> &str {
        match self {
            Callable::Closure(closure) => &closure.program.name,
            Callable::Native(native) => &native.name,
        }
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callable::Closure(closure) => write!(f, "Closure({:?})", closure.program.name),
            Callable::Native(native) => write!(f, "NativeFunction({})", native.name),
        }
    }
}

/// A closure: an immutable program plus a pointer to the stash chain (and
/// private-environment chain) captured at the instant the function literal
/// was evaluated. Captured variables are shared by reference through the
/// chain, never copied per closure.
#[derive(Clone)]
pub struct Closure {
    /// The compiled function, shared by all closures over the same literal.
    pub program: Arc<Program>,
    /// Head of the captured stash chain.
    pub stash: Option<StashRef>,
    /// Head of the captured private-environment chain.
    pub private_env: Option<PrivateEnvRef>,
    /// For arrows: the lexical `this`.
    pub this: Option<Value>,
    /// For arrows: the lexical `new.target`.
    pub new_target: Option<Value>,
    /// The property bag backing the function-as-object surface
    /// (`f.prototype` and friends).
    pub object: ObjRef,
}

/// The Rust signature of a native function: receives the VM (for reentrant
/// calls and job enqueueing), `this`, and the argument slice. An `Err` value
/// is thrown as a catchable exception.
pub type NativeFn = fn(&mut Vm, &Value, &[Value]) -> Result<Value, Value>;

/// A native (Rust) function.
#[derive(Clone)]
pub struct NativeFunction {
    /// The function name, for display and traces.
    pub name: String,
    /// The function pointer.
    pub func: NativeFn,
}

impl Value {
    /// Wraps a native function as a callable value.
    pub fn native(name: &str, func: NativeFn) -> Value {
        Value::Function(Arc::new(Callable::Native(NativeFunction {
            name: name.to_string(),
            func,
        })))
    }
}

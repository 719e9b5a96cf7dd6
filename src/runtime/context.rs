//! Execution context: the global environment, the deferred-job queue, and
//! the interrupt handle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::function::Callable;
use super::object::ObjRef;
use super::value::Value;

/// The state one VM instance executes against.
///
/// The global environment is an explicit, owned value: the top-level
/// binding table is an ordinary object handed to the VM at construction, not
/// ambient process state.
#[derive(Debug)]
pub struct Context {
    globals: ObjRef,
    jobs: VecDeque<Job>,
}

/// One deferred job: a callable plus its arguments, run by the trampoline
/// after the triggering synchronous call unwinds.
#[derive(Debug)]
pub struct Job {
    /// What to call.
    pub callable: Arc<Callable>,
    /// The arguments.
    pub args: Vec<Value>,
}

impl Context {
    /// Creates a context with an empty global environment.
    pub fn new() -> Self {
        Self { globals: ObjRef::new(None), jobs: VecDeque::new() }
    }

    /// The global environment object (`this` at the top level).
    pub fn global_object(&self) -> ObjRef {
        self.globals.clone()
    }

    /// Reads a global binding.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    /// Creates or overwrites a global binding.
    pub fn set_global(&self, name: &str, value: Value) {
        self.globals.set(name, value);
    }

    /// Ensures a global binding exists (hoisted `var` declarations).
    pub fn declare_global(&self, name: &str) {
        if self.globals.get(name).is_none() {
            self.globals.set(name, Value::Undefined);
        }
    }

    /// Removes a global binding.
    pub fn delete_global(&self, name: &str) -> bool {
        if self.globals.get(name).is_some() {
            self.globals.delete(name)
        } else {
            true
        }
    }

    /// Appends a job to the FIFO queue. This is the external enqueue
    /// primitive deferred reactions use; nothing runs until the trampoline
    /// drains the queue at a top-level boundary.
    pub fn enqueue_job(&mut self, callable: Arc<Callable>, args: Vec<Value>) {
        self.jobs.push_back(Job { callable, args });
    }

    /// Takes the next queued job.
    pub fn next_job(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Whether jobs are waiting.
    pub fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for aborting a running VM from another thread.
///
/// Setting the flag does not stop execution mid-instruction: the VM polls it
/// at a fixed instruction-count cadence, and the poll after `interrupt` is
/// observed deterministically aborts the run, unwinding every active frame,
/// stash, and iterator.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl InterruptHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>, reason: Arc<Mutex<Option<String>>>) -> Self {
        Self { flag, reason }
    }

    /// Requests an abort with the given reason.
    pub fn interrupt(&self, reason: impl Into<String>) {
        *self.reason.lock() = Some(reason.into());
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Withdraws a pending interrupt request.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
        *self.reason.lock() = None;
    }

    /// Whether an interrupt is pending.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The pending reason, if any.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_bindings() {
        let ctx = Context::new();
        assert_eq!(ctx.get_global("x"), None);
        ctx.declare_global("x");
        assert_eq!(ctx.get_global("x"), Some(Value::Undefined));
        ctx.set_global("x", Value::Number(3.0));
        assert_eq!(ctx.get_global("x"), Some(Value::Number(3.0)));
        assert!(ctx.delete_global("x"));
        assert_eq!(ctx.get_global("x"), None);
    }

    #[test]
    fn test_job_queue_is_fifo() {
        let mut ctx = Context::new();
        let f = Value::native("f", |_, _, _| Ok(Value::Undefined));
        let Value::Function(callable) = f else { unreachable!() };
        ctx.enqueue_job(callable.clone(), vec![Value::Number(1.0)]);
        ctx.enqueue_job(callable, vec![Value::Number(2.0)]);
        assert_eq!(ctx.next_job().unwrap().args, vec![Value::Number(1.0)]);
        assert_eq!(ctx.next_job().unwrap().args, vec![Value::Number(2.0)]);
        assert!(ctx.next_job().is_none());
    }

    #[test]
    fn test_interrupt_handle_roundtrip() {
        let handle = InterruptHandle::new(Arc::default(), Arc::default());
        assert!(!handle.is_set());
        handle.interrupt("timeout");
        assert!(handle.is_set());
        assert_eq!(handle.reason().as_deref(), Some("timeout"));
        handle.clear();
        assert!(!handle.is_set());
        assert_eq!(handle.reason(), None);
    }
}

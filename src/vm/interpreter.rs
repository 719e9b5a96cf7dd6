//! The bytecode interpreter.
//!
//! One [`Vm`] owns a contiguous, growable value stack shared by all nested
//! calls, a frame stack, the stash chain, an iterator stack, and the
//! interrupt flag. Execution is a single dispatch loop over the closed
//! instruction set; exception handling is explicit: a fault value unwinds
//! through per-frame try records with local restoration of stack, stash,
//! iterator, and private-environment depth, never through host unwinding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use parking_lot::Mutex;

use crate::Error;
use crate::compiler::bytecode::{Op, Program, SlotRef};
use crate::runtime::context::{Context, InterruptHandle};
use crate::runtime::function::{Callable, Closure};
use crate::runtime::object::ObjRef;
use crate::runtime::value::Value;

use super::stash::{DynamicSlot, PrivateEnv, PrivateEnvRef, Stash, StashRef, dynamic_lookup};

/// How many instructions execute between interrupt-flag polls.
const INTERRUPT_PERIOD: u32 = 1024;

/// Default bound on nested call depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;

/// One entry of a captured call trace.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// Function name.
    pub name: String,
    /// Script name.
    pub file: Arc<str>,
    /// Source offset active at the faulting instruction.
    pub pos: u32,
}

/// An uncaught exception as surfaced to the host: the thrown value plus the
/// call trace captured at the moment of the throw.
#[derive(Debug, Clone)]
pub struct JsException {
    /// The thrown value.
    pub value: Value,
    /// Innermost frame first.
    pub trace: Vec<TraceEntry>,
}

impl std::fmt::Display for JsException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Value::Object(obj) => {
                let name = obj.get("name").map(|v| v.to_js_string());
                let message = obj.get("message").map(|v| v.to_js_string());
                match (name, message) {
                    (Some(n), Some(m)) => write!(f, "{}: {}", n, m)?,
                    _ => write!(f, "{}", self.value)?,
                }
            }
            other => write!(f, "{}", other)?,
        }
        for entry in &self.trace {
            write!(f, "\n    at {} ({}:{})", entry.name, entry.file, entry.pos)?;
        }
        Ok(())
    }
}

/// A throw in flight.
#[derive(Debug, Clone)]
struct Thrown {
    value: Value,
    trace: Vec<TraceEntry>,
}

/// Why execution of an instruction could not continue.
enum Fault {
    /// A catchable exception searching for a handler.
    Throw(Box<Thrown>),
    /// Call depth exceeded. Unrecoverable: bypasses every handler.
    Overflow,
    /// The interrupt flag was observed. Unrecoverable.
    Interrupted,
}

type Step<T = ()> = Result<T, Fault>;

/// One active protected region.
#[derive(Debug)]
struct TryRecord {
    catch_pc: Option<usize>,
    finally_pc: Option<usize>,
    sp: usize,
    stash: Option<StashRef>,
    private: Option<PrivateEnvRef>,
    iter_depth: usize,
}

/// The completion a finally section resumes when it ends.
#[derive(Debug)]
enum Completion {
    /// Continue at an address (normal completion of the protected region).
    Normal { target: usize },
    /// A return travelling outward.
    Return(Value),
    /// A break/continue travelling outward.
    Leave { tries: u16, stashes: u16, iters: u16, target: usize },
    /// A throw travelling outward.
    Throw(Box<Thrown>),
}

#[derive(Debug)]
struct FinallyEntry {
    completion: Completion,
    /// `try_stack.len()` at the moment the finally was entered; entries
    /// whose depth exceeds the current length are stale and dropped.
    try_depth: usize,
}

/// Saved VM state for one call.
struct Frame {
    program: Arc<Program>,
    pc: usize,
    /// Stack index of local slot 0; arguments sit below it.
    base: usize,
    /// Stack index of the callee slot; everything from here up is torn down
    /// when the frame pops.
    frame_start: usize,
    this: Value,
    new_target: Value,
    /// For `new`: the freshly built object, which becomes the result unless
    /// the constructor returns an object itself.
    construct: Option<ObjRef>,
    saved_stash: Option<StashRef>,
    saved_private: Option<PrivateEnvRef>,
    iter_base: usize,
    try_stack: Vec<TryRecord>,
    finally_stack: Vec<FinallyEntry>,
}

/// An open iterator.
struct IterRecord {
    kind: IterKind,
    done: bool,
}

enum IterKind {
    /// Indexed elements of an array-backed object.
    Array(ObjRef, usize),
    /// Precomputed values (string characters, enumerated keys).
    Values(Vec<Value>, usize),
    /// An object honoring the `next()` protocol.
    Protocol(ObjRef),
}

/// The virtual machine.
///
/// Single-threaded and synchronous: one instance's stacks must never be
/// driven from two contexts at once. Compiled programs are immutable and may
/// be shared freely across instances.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    stash: Option<StashRef>,
    private_env: Option<PrivateEnvRef>,
    iters: Vec<IterRecord>,
    ctx: Context,
    interrupt: Arc<AtomicBool>,
    interrupt_reason: Arc<Mutex<Option<String>>>,
    max_call_depth: usize,
    tick: u32,
    /// Set while tearing down after an unrecoverable condition so cleanup
    /// code (iterator close notifications) is not itself interrupted.
    aborting: bool,
    private_serial: u64,
}

impl Vm {
    /// Creates a VM with a fresh global environment.
    pub fn new() -> Self {
        Self::with_context(Context::new())
    }

    /// Creates a VM executing against the given context.
    pub fn with_context(ctx: Context) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            stash: None,
            private_env: None,
            iters: Vec::new(),
            ctx,
            interrupt: Arc::new(AtomicBool::new(false)),
            interrupt_reason: Arc::new(Mutex::new(None)),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            tick: INTERRUPT_PERIOD,
            aborting: false,
            private_serial: 0,
        }
    }

    /// The execution context (global environment and job queue).
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Mutable access to the execution context.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Reconfigures the call-depth bound.
    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    /// A handle for interrupting this VM from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle::new(self.interrupt.clone(), self.interrupt_reason.clone())
    }

    /// Executes a compiled program to completion, returning its completion
    /// value. Uncaught exceptions, stack overflow, and interrupts surface as
    /// errors; internal stacks are restored either way.
    pub fn run(&mut self, program: &Arc<Program>) -> Result<Value, Error> {
        tracing::debug!(name = %program.name, "running program");
        let base = self.frames.len();
        self.push_main_frame(program);
        match self.run_loop(base) {
            Ok(value) => Ok(value),
            Err(fault) => Err(self.fault_to_error(fault)),
        }
    }

    /// Like [`Vm::run`], but additionally drains the deferred-job queue once
    /// the synchronous run has unwound. A job's exception does not stop
    /// later jobs; job failures are logged and the synchronous result is
    /// returned. Use [`Vm::drain_jobs`] directly to observe job errors.
    pub fn run_protected(&mut self, program: &Arc<Program>) -> Result<Value, Error> {
        let result = self.run(program);
        let job_errors = self.drain_jobs();
        for error in &job_errors {
            tracing::warn!(%error, "deferred job failed");
        }
        result
    }

    /// Runs queued jobs in FIFO order until the queue is empty, collecting
    /// the errors of jobs that failed. Jobs enqueued by running jobs run in
    /// the same drain.
    pub fn drain_jobs(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();
        while let Some(job) = self.ctx.next_job() {
            let callee = Value::Function(job.callable.clone());
            match self.call(callee, Value::Undefined, &job.args) {
                Ok(_) => {}
                Err(error) => errors.push(error),
            }
        }
        errors
    }

    /// Calls a callable value from the host.
    pub fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, Error> {
        match self.invoke(callee, this, args) {
            Ok(value) => Ok(value),
            Err(fault) => Err(self.fault_to_error(fault)),
        }
    }

    fn fault_to_error(&mut self, fault: Fault) -> Error {
        match fault {
            Fault::Throw(thrown) => {
                Error::Runtime(JsException { value: thrown.value, trace: thrown.trace })
            }
            Fault::Overflow => Error::StackOverflow,
            Fault::Interrupted => {
                let reason = self.interrupt_reason.lock().clone().unwrap_or_default();
                Error::Interrupted(reason)
            }
        }
    }

    // ========================================================================
    // Frame management
    // ========================================================================

    fn push_main_frame(&mut self, program: &Arc<Program>) {
        let frame_start = self.stack.len();
        self.stack.push(Value::Undefined); // callee slot
        self.stack.push(Value::Object(self.ctx.global_object()));
        let base = self.stack.len();
        self.stack.extend(std::iter::repeat_n(Value::Uninit, program.num_locals as usize));
        let saved_stash = self.stash.take();
        if let Some(idx) = program.func_stash {
            let template = program.stash_templates[idx as usize].clone();
            self.stash = Some(Stash::from_template(template, None));
        }
        self.frames.push(Frame {
            program: program.clone(),
            pc: 0,
            base,
            frame_start,
            this: Value::Object(self.ctx.global_object()),
            new_target: Value::Undefined,
            construct: None,
            saved_stash,
            saved_private: self.private_env.take(),
            iter_base: self.iters.len(),
            try_stack: Vec::new(),
            finally_stack: Vec::new(),
        });
    }

    /// Enters a closure whose callee/this/arguments are already on the
    /// stack: `stack[frame_start] = callee`, `stack[frame_start + 1] = this`,
    /// then `argc` arguments.
    fn push_closure_frame(
        &mut self,
        frame_start: usize,
        argc: usize,
        construct: Option<ObjRef>,
    ) -> Step {
        if self.frames.len() >= self.max_call_depth {
            return Err(Fault::Overflow);
        }
        let callee = self.stack[frame_start].clone();
        let closure = match &callee {
            Value::Function(callable) => match callable.as_ref() {
                Callable::Closure(closure) => closure.clone(),
                Callable::Native(_) => unreachable!("native calls never build frames"),
            },
            _ => unreachable!("frame push requires a function"),
        };
        let program = closure.program.clone();
        if program.flags.ctor && construct.is_none() {
            return Err(self.throw_type_error(format!(
                "class constructor {} cannot be invoked without new",
                program.name
            )));
        }

        // The arguments object observes the actual arguments, before the
        // frame is normalized to the declared parameter count.
        let arguments_obj = if program.flags.needs_arguments {
            let actuals = self.stack[frame_start + 2..frame_start + 2 + argc].to_vec();
            let obj = ObjRef::array(actuals);
            obj.set("callee", callee.clone());
            Some(obj)
        } else {
            None
        };

        let declared = program.num_args as usize;
        if argc < declared {
            self.stack
                .extend(std::iter::repeat_n(Value::Undefined, declared - argc));
        } else if argc > declared {
            self.stack.truncate(frame_start + 2 + declared);
        }
        let base = self.stack.len();
        self.stack.extend(std::iter::repeat_n(Value::Uninit, program.num_locals as usize));

        let saved_stash = std::mem::replace(&mut self.stash, closure.stash.clone());
        let saved_private = std::mem::replace(&mut self.private_env, closure.private_env.clone());
        if let Some(idx) = program.func_stash {
            let template = program.stash_templates[idx as usize].clone();
            self.stash = Some(Stash::from_template(template, self.stash.take()));
        }

        // Captured parameters are copied into the stash once, here; every
        // access thereafter goes through the stash slot.
        for &(arg_index, slot) in program.param_copies.iter() {
            let value = self.stack[base - declared + arg_index as usize].clone();
            self.stash_head().write().set(slot, value);
        }
        if let (Some(slot), Some(obj)) = (program.arguments_at, arguments_obj) {
            self.write_slot(base, slot, Value::Object(obj));
        }
        if let Some(slot) = program.callee_at {
            self.write_slot(base, slot, callee.clone());
        }

        let this = if program.flags.arrow {
            closure.this.clone().unwrap_or(Value::Undefined)
        } else {
            let passed = self.stack[frame_start + 1].clone();
            if passed.is_nullish() && !program.flags.strict {
                Value::Object(self.ctx.global_object())
            } else {
                passed
            }
        };
        let new_target = if program.flags.arrow {
            closure.new_target.clone().unwrap_or(Value::Undefined)
        } else if construct.is_some() {
            callee
        } else {
            Value::Undefined
        };

        self.frames.push(Frame {
            program,
            pc: 0,
            base,
            frame_start,
            this,
            new_target,
            construct,
            saved_stash,
            saved_private,
            iter_base: self.iters.len(),
            try_stack: Vec::new(),
            finally_stack: Vec::new(),
        });
        Ok(())
    }

    fn write_slot(&mut self, base: usize, slot: SlotRef, value: Value) {
        match slot {
            SlotRef::Stack(off) => {
                let idx = (base as i64 + off as i64) as usize;
                self.stack[idx] = value;
            }
            SlotRef::Stash(idx) => {
                self.stash_head().write().set(idx, value);
            }
        }
    }

    fn stash_head(&self) -> StashRef {
        self.stash.clone().expect("instruction requires a stash on the chain")
    }

    /// Tears the current frame down, leaving the stack as the caller left
    /// it, and produces the frame's result value.
    fn complete_frame_return(&mut self, value: Value) -> Value {
        let frame = self.frames.pop().expect("return requires a frame");
        self.close_iters_to(frame.iter_base);
        self.stash = frame.saved_stash.clone();
        self.private_env = frame.saved_private.clone();
        // Dropping the frame region also clears stale values from the
        // shared stack so reused regions never leak previous frames' data.
        self.stack.truncate(frame.frame_start);
        match frame.construct {
            Some(obj) => match value {
                Value::Object(_) => value,
                _ => Value::Object(obj),
            },
            None => value,
        }
    }

    // ========================================================================
    // Faults, throws, unwinding
    // ========================================================================

    fn capture_trace(&self) -> Vec<TraceEntry> {
        self.frames
            .iter()
            .rev()
            .map(|frame| TraceEntry {
                name: frame.program.name.clone(),
                file: frame.program.file.clone(),
                pos: frame.program.pos_at(frame.pc.saturating_sub(1)),
            })
            .collect()
    }

    fn throw_value(&self, value: Value) -> Fault {
        Fault::Throw(Box::new(Thrown { value, trace: self.capture_trace() }))
    }

    /// Builds an error object lazily, only at the point it is thrown.
    fn make_error(&self, kind: &str, message: String) -> Value {
        let obj = ObjRef::new(None);
        obj.set("name", Value::string(kind));
        obj.set("message", Value::string(message));
        Value::Object(obj)
    }

    fn throw_type_error(&self, message: impl Into<String>) -> Fault {
        self.throw_value(self.make_error("TypeError", message.into()))
    }

    fn throw_reference_error(&self, message: impl Into<String>) -> Fault {
        self.throw_value(self.make_error("ReferenceError", message.into()))
    }

    fn throw_range_error(&self, message: impl Into<String>) -> Fault {
        self.throw_value(self.make_error("RangeError", message.into()))
    }

    /// Drops finally entries whose protected region is gone.
    fn truncate_finallies(frame: &mut Frame) {
        let depth = frame.try_stack.len();
        frame.finally_stack.retain(|entry| entry.try_depth <= depth);
    }

    /// Restores the state snapshotted by a try record: operand stack depth,
    /// stash chain, private environments, and open iterators.
    fn restore_record(&mut self, record: &TryRecord) {
        self.close_iters_to(record.iter_depth);
        self.stack.truncate(record.sp);
        self.stash = record.stash.clone();
        self.private_env = record.private.clone();
    }

    /// Walks try records (and then frames) looking for a handler for
    /// `thrown`. Frames below `base` belong to an outer invocation and are
    /// left alone. Returns the unhandled throw if nothing caught it.
    fn handle_throw(&mut self, thrown: Box<Thrown>, base: usize) -> Option<Box<Thrown>> {
        let mut thrown = thrown;
        loop {
            if self.frames.len() <= base {
                return Some(thrown);
            }
            loop {
                let record = {
                    let frame = self.frames.last_mut().expect("length checked");
                    match frame.try_stack.pop() {
                        Some(record) => {
                            Self::truncate_finallies(frame);
                            record
                        }
                        None => break,
                    }
                };
                self.restore_record(&record);
                if let Some(catch) = record.catch_pc {
                    // The region stays armed with its catch consumed: the
                    // catch body's closing EndTry pops it, and a rethrow
                    // inside the catch still reaches the finally section.
                    let mut record = record;
                    record.catch_pc = None;
                    let frame = self.frames.last_mut().expect("length checked");
                    frame.try_stack.push(record);
                    frame.pc = catch;
                    self.stack.push(thrown.value.clone());
                    return None;
                }
                if let Some(finally) = record.finally_pc {
                    let frame = self.frames.last_mut().expect("length checked");
                    frame.finally_stack.push(FinallyEntry {
                        completion: Completion::Throw(thrown),
                        try_depth: frame.try_stack.len(),
                    });
                    frame.pc = finally;
                    return None;
                }
                // A consumed catch-only record: keep searching outward.
            }
            // No handler in this frame; pop it and continue in the caller.
            let frame = self.frames.pop().expect("length checked");
            self.close_iters_to(frame.iter_base);
            self.stash = frame.saved_stash;
            self.private_env = frame.saved_private;
            self.stack.truncate(frame.frame_start);
        }
    }

    /// Unwinds every frame above `base` after an unrecoverable condition,
    /// giving open iterators their close notification on the way out.
    fn unwind_frames_to(&mut self, base: usize) {
        let was_aborting = std::mem::replace(&mut self.aborting, true);
        while self.frames.len() > base {
            let frame = self.frames.pop().expect("length checked");
            self.close_iters_to(frame.iter_base);
            self.stash = frame.saved_stash.clone();
            self.private_env = frame.saved_private.clone();
            self.stack.truncate(frame.frame_start);
        }
        self.aborting = was_aborting;
    }

    /// Closes iterators down to `depth`, discarding exceptions raised by
    /// close steps: unwind paths already carry a completion of their own.
    fn close_iters_to(&mut self, depth: usize) {
        while self.iters.len() > depth {
            if let Err(Fault::Throw(thrown)) = self.close_top_iter() {
                tracing::debug!(value = %thrown.value, "iterator close step failed during unwind");
            }
        }
    }

    /// Pops the innermost iterator, invoking its `return` method when the
    /// iteration did not run to exhaustion.
    fn close_top_iter(&mut self) -> Step {
        let record = self.iters.pop().expect("iterator stack underflow");
        if record.done {
            return Ok(());
        }
        if let IterKind::Protocol(obj) = &record.kind {
            if let Some(ret) = obj.get("return") {
                if ret.is_callable() {
                    let this = Value::Object(obj.clone());
                    self.invoke(ret, this, &[])?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Return / leave protocol
    // ========================================================================

    /// What became of a return once pending finallys were consulted:
    /// `Some(value)` when the frame actually popped, `None` when control
    /// entered a finally section first.
    fn begin_return(&mut self, value: Value) -> Step<Option<Value>> {
        loop {
            let record = {
                let frame = self.frames.last_mut().expect("return requires a frame");
                match frame.try_stack.pop() {
                    Some(record) => {
                        Self::truncate_finallies(frame);
                        record
                    }
                    None => return Ok(Some(self.complete_frame_return(value))),
                }
            };
            self.restore_record(&record);
            if let Some(finally) = record.finally_pc {
                let frame = self.frames.last_mut().expect("frame exists");
                frame.finally_stack.push(FinallyEntry {
                    completion: Completion::Return(value),
                    try_depth: frame.try_stack.len(),
                });
                frame.pc = finally;
                return Ok(None);
            }
        }
    }

    /// Executes an unwinding branch: runs the finallys of `tries` protected
    /// regions, then pops `stashes` stashes and closes `iters` iterators,
    /// and finally jumps to `target`.
    fn begin_leave(&mut self, mut tries: u16, stashes: u16, iters: u16, target: usize) -> Step {
        while tries > 0 {
            let frame = self.frames.last_mut().expect("leave requires a frame");
            let record = frame.try_stack.pop().expect("leave count matches open regions");
            Self::truncate_finallies(frame);
            self.restore_record(&record);
            tries -= 1;
            if let Some(finally) = record.finally_pc {
                let frame = self.frames.last_mut().expect("frame exists");
                frame.finally_stack.push(FinallyEntry {
                    completion: Completion::Leave { tries, stashes, iters, target },
                    try_depth: frame.try_stack.len(),
                });
                frame.pc = finally;
                return Ok(());
            }
        }
        for _ in 0..stashes {
            let outer = self.stash_head().read().outer.clone();
            self.stash = outer;
        }
        for _ in 0..iters {
            self.close_top_iter()?;
        }
        let frame = self.frames.last_mut().expect("leave requires a frame");
        frame.pc = target;
        Ok(())
    }

    // ========================================================================
    // Host-facing invocation
    // ========================================================================

    /// Calls a callable value, running nested bytecode to completion. This
    /// is the reentrant entry used by iterator protocol steps, deferred
    /// jobs, and host callers.
    fn invoke(&mut self, callee: Value, this: Value, args: &[Value]) -> Step<Value> {
        let callable = match &callee {
            Value::Function(callable) => callable.clone(),
            other => {
                return Err(
                    self.throw_type_error(format!("{} is not a function", other.to_js_string()))
                );
            }
        };
        match callable.as_ref() {
            Callable::Native(native) => {
                (native.func)(self, &this, args).map_err(|value| self.throw_value(value))
            }
            Callable::Closure(_) => {
                let base = self.frames.len();
                let frame_start = self.stack.len();
                self.stack.push(callee);
                self.stack.push(this);
                self.stack.extend_from_slice(args);
                self.push_closure_frame(frame_start, args.len(), None)
                    .inspect_err(|_| self.stack.truncate(frame_start))?;
                self.run_loop(base)
            }
        }
    }

    // ========================================================================
    // The dispatch loop
    // ========================================================================

    /// Executes until the frame at depth `base` returns, yielding its
    /// result. Faults unwind all frames above `base` before surfacing.
    fn run_loop(&mut self, base: usize) -> Step<Value> {
        loop {
            match self.step(base) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(Fault::Throw(thrown)) => {
                    if let Some(unhandled) = self.handle_throw(thrown, base) {
                        return Err(Fault::Throw(unhandled));
                    }
                }
                Err(fault) => {
                    self.unwind_frames_to(base);
                    return Err(fault);
                }
            }
        }
    }

    /// Executes one instruction. Returns `Some(value)` when the base frame
    /// returned.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, base: usize) -> Step<Option<Value>> {
        // Interrupt poll, at a fixed instruction cadence.
        self.tick -= 1;
        if self.tick == 0 {
            self.tick = INTERRUPT_PERIOD;
            if !self.aborting && self.interrupt.load(Ordering::SeqCst) {
                return Err(Fault::Interrupted);
            }
        }

        let frame = self.frames.last().expect("dispatch requires a frame");
        let at = frame.pc;
        let op = frame.program.code[at];
        self.frames.last_mut().expect("frame exists").pc = at + 1;

        match op {
            Op::Const(idx) => {
                let value = self.cur_program().constants[idx as usize].clone();
                self.stack.push(value);
            }
            Op::Undefined => self.stack.push(Value::Undefined),
            Op::Null => self.stack.push(Value::Null),
            Op::True => self.stack.push(Value::Boolean(true)),
            Op::False => self.stack.push(Value::Boolean(false)),
            Op::Pop => {
                self.pop();
            }
            Op::Dup => {
                let top = self.peek(0).clone();
                self.stack.push(top);
            }
            Op::Dup2 => {
                let b = self.peek(0).clone();
                let a = self.peek(1).clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            Op::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Op::Nop => {}
            Op::Unresolved(_) => unreachable!("unresolved placeholder survived compilation"),

            Op::LoadStack(off) => {
                let value = self.read_stack(off);
                self.stack.push(value);
            }
            Op::LoadStackTdz(off) => {
                let value = self.read_stack(off);
                if matches!(value, Value::Uninit) {
                    return Err(self
                        .throw_reference_error("cannot access lexical binding before initialization"));
                }
                self.stack.push(value);
            }
            Op::StoreStack(off) | Op::InitStack(off) => {
                let value = self.pop();
                self.write_stack(off, value);
            }
            Op::ResetStack(off) => {
                self.write_stack(off, Value::Uninit);
            }

            Op::LoadStash { level, idx } => {
                let value = self.stash_at(level).read().get(idx);
                self.stack.push(value);
            }
            Op::LoadStashTdz { level, idx } => {
                let value = self.stash_at(level).read().get(idx);
                if matches!(value, Value::Uninit) {
                    return Err(self
                        .throw_reference_error("cannot access lexical binding before initialization"));
                }
                self.stack.push(value);
            }
            Op::StoreStash { level, idx } | Op::InitStash { level, idx } => {
                let value = self.pop();
                self.stash_at(level).write().set(idx, value);
            }

            Op::LoadDynamic(idx) => {
                let name = self.const_str(idx);
                let value = self.dynamic_load(&name, false)?;
                self.stack.push(value);
            }
            Op::LoadDynamicTypeof(idx) => {
                let name = self.const_str(idx);
                let value = self.dynamic_load(&name, true)?;
                self.stack.push(value);
            }
            Op::StoreDynamic(idx) => {
                let name = self.const_str(idx);
                let value = self.pop();
                match dynamic_lookup(&self.stash, &name) {
                    Some(DynamicSlot::With(obj)) => obj.set(&name, value),
                    Some(DynamicSlot::Stash(stash, slot)) => stash.write().set(slot, value),
                    None => self.ctx.set_global(&name, value),
                }
            }
            Op::ThrowConst(idx) => {
                let name = self.const_str(idx);
                self.pop();
                return Err(
                    self.throw_type_error(format!("assignment to constant variable '{name}'"))
                );
            }

            Op::LoadGlobal(idx) => {
                let name = self.const_str(idx);
                match self.ctx.get_global(&name) {
                    Some(value) => self.stack.push(value),
                    None => {
                        return Err(self.throw_reference_error(format!("{name} is not defined")));
                    }
                }
            }
            Op::LoadGlobalTypeof(idx) => {
                let name = self.const_str(idx);
                let value = self.ctx.get_global(&name).unwrap_or(Value::Undefined);
                self.stack.push(value);
            }
            Op::StoreGlobal(idx) => {
                let name = self.const_str(idx);
                let value = self.pop();
                self.ctx.set_global(&name, value);
            }
            Op::StoreGlobalStrict(idx) => {
                let name = self.const_str(idx);
                let value = self.pop();
                if self.ctx.get_global(&name).is_none() {
                    return Err(self.throw_reference_error(format!("{name} is not defined")));
                }
                self.ctx.set_global(&name, value);
            }
            Op::DeclareGlobal(idx) => {
                let name = self.const_str(idx);
                self.ctx.declare_global(&name);
            }
            Op::DeleteGlobal(idx) => {
                let name = self.const_str(idx);
                let deleted = self.ctx.delete_global(&name);
                self.stack.push(Value::Boolean(deleted));
            }

            Op::PushStash(idx) => {
                let template = self.cur_program().stash_templates[idx as usize].clone();
                self.stash = Some(Stash::from_template(template, self.stash.take()));
            }
            Op::PushWith => {
                let value = self.pop();
                let object = match value {
                    Value::Object(obj) => obj,
                    other => {
                        return Err(self.throw_type_error(format!(
                            "cannot use {} as a with scope",
                            other.type_of()
                        )));
                    }
                };
                self.stash = Some(Stash::with_object(object, self.stash.take()));
            }
            Op::PopStash => {
                let outer = self.stash_head().read().outer.clone();
                self.stash = outer;
            }

            Op::This => {
                let this = self.frames.last().expect("frame exists").this.clone();
                self.stack.push(this);
            }
            Op::NewTarget => {
                let target = self.frames.last().expect("frame exists").new_target.clone();
                self.stack.push(target);
            }

            Op::NewObject => {
                self.stack.push(Value::Object(ObjRef::new(None)));
            }
            Op::NewArray(count) => {
                let start = self.stack.len() - count as usize;
                let elements = self.stack.split_off(start);
                self.stack.push(Value::Object(ObjRef::array(elements)));
            }
            Op::GetProp(idx) => {
                let key = self.const_str(idx);
                let object = self.pop();
                let value = self.get_property(&object, &key)?;
                self.stack.push(value);
            }
            Op::SetProp(idx) => {
                let key = self.const_str(idx);
                let value = self.pop();
                let object = self.pop();
                self.set_property(&object, &key, value.clone())?;
                self.stack.push(value);
            }
            Op::GetElem => {
                let key = self.pop();
                let object = self.pop();
                let value = self.get_property(&object, &key.to_js_string())?;
                self.stack.push(value);
            }
            Op::SetElem => {
                let value = self.pop();
                let key = self.pop();
                let object = self.pop();
                self.set_property(&object, &key.to_js_string(), value.clone())?;
                self.stack.push(value);
            }
            Op::DeleteProp(idx) => {
                let key = self.const_str(idx);
                let object = self.pop();
                let deleted = self.delete_property(&object, &key)?;
                self.stack.push(Value::Boolean(deleted));
            }
            Op::DeleteElem => {
                let key = self.pop();
                let object = self.pop();
                let deleted = self.delete_property(&object, &key.to_js_string())?;
                self.stack.push(Value::Boolean(deleted));
            }

            Op::GetPrivate { level, idx } => {
                let object = self.pop();
                let value = self.private_get(&object, level, idx)?;
                self.stack.push(value);
            }
            Op::SetPrivate { level, idx } => {
                let value = self.pop();
                let object = self.pop();
                self.private_set(&object, level, idx, value.clone(), false)?;
                self.stack.push(value);
            }
            Op::InitPrivate { level, idx } => {
                let value = self.pop();
                let object = self.pop();
                self.private_set(&object, level, idx, value, true)?;
            }
            Op::GetPrivateDyn(idx) => {
                let name = self.const_str(idx);
                let (level, slot) = self.locate_private(&name)?;
                let object = self.pop();
                let value = self.private_get(&object, level, slot)?;
                self.stack.push(value);
            }
            Op::SetPrivateDyn(idx) => {
                let name = self.const_str(idx);
                let (level, slot) = self.locate_private(&name)?;
                let value = self.pop();
                let object = self.pop();
                self.private_set(&object, level, slot, value.clone(), false)?;
                self.stack.push(value);
            }
            Op::PrivateIn { level, idx } => {
                let object = self.pop();
                let env = PrivateEnv::at_level(&self.private_env, level)
                    .expect("brand check level fixed at compile time");
                let has = match object {
                    Value::Object(obj) => obj.private_has((env.serial, idx)),
                    _ => false,
                };
                self.stack.push(Value::Boolean(has));
            }
            Op::PushPrivateEnv(idx) => {
                let template = self.cur_program().private_envs[idx as usize].clone();
                self.private_serial += 1;
                self.private_env = Some(Arc::new(PrivateEnv {
                    template,
                    serial: self.private_serial,
                    outer: self.private_env.take(),
                }));
            }
            Op::PopPrivateEnv => {
                self.private_env = self
                    .private_env
                    .take()
                    .expect("private environments are balanced")
                    .outer
                    .clone();
            }

            Op::Add => self.binary_add()?,
            Op::Sub => self.binary_arith(f64_sub, bigint_sub)?,
            Op::Mul => self.binary_arith(f64_mul, bigint_mul)?,
            Op::Div => self.binary_arith(f64_div, bigint_div)?,
            Op::Mod => self.binary_arith(f64_mod, bigint_mod)?,
            Op::Exp => self.binary_exp()?,
            Op::Neg => {
                let value = self.pop();
                let negated = match &value {
                    Value::BigInt(b) => Value::bigint(-b.as_ref().clone()),
                    other => match other.to_number() {
                        Some(n) => Value::Number(-n),
                        None => return Err(self.throw_type_error("cannot negate this value")),
                    },
                };
                self.stack.push(negated);
            }
            Op::ToNum => {
                let value = self.pop();
                let converted = match &value {
                    Value::BigInt(_) => {
                        return Err(
                            self.throw_type_error("cannot convert a BigInt to a number")
                        );
                    }
                    other => Value::Number(other.to_number().unwrap_or(f64::NAN)),
                };
                self.stack.push(converted);
            }
            Op::Not => {
                let value = self.pop();
                self.stack.push(Value::Boolean(!value.to_boolean()));
            }
            Op::BitNot => {
                let value = self.pop();
                let result = match &value {
                    Value::BigInt(b) => Value::bigint(!b.as_ref().clone()),
                    other => match other.to_int32() {
                        Some(n) => Value::Number(!n as f64),
                        None => return Err(self.throw_type_error("invalid bitwise operand")),
                    },
                };
                self.stack.push(result);
            }

            Op::Eq => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Boolean(abstract_equals(&a, &b)));
            }
            Op::Ne => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Boolean(!abstract_equals(&a, &b)));
            }
            Op::StrictEq => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Boolean(a.strict_equals(&b)));
            }
            Op::StrictNe => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Boolean(!a.strict_equals(&b)));
            }
            Op::Lt => self.compare_op(|ord| ord == std::cmp::Ordering::Less)?,
            Op::Le => self.compare_op(|ord| ord != std::cmp::Ordering::Greater)?,
            Op::Gt => self.compare_op(|ord| ord == std::cmp::Ordering::Greater)?,
            Op::Ge => self.compare_op(|ord| ord != std::cmp::Ordering::Less)?,

            Op::BitAnd => self.bitwise_op(|a, b| a & b, |a, b| a & b)?,
            Op::BitOr => self.bitwise_op(|a, b| a | b, |a, b| a | b)?,
            Op::BitXor => self.bitwise_op(|a, b| a ^ b, |a, b| a ^ b)?,
            Op::Shl => self.shift_op(false, |n, s| n.wrapping_shl(s))?,
            Op::Shr => self.shift_op(false, |n, s| n.wrapping_shr(s))?,
            Op::Ushr => self.shift_op(true, |n, s| n.wrapping_shr(s))?,

            Op::TypeOf => {
                let value = self.pop();
                self.stack.push(Value::string(value.type_of()));
            }
            Op::InstanceOf => {
                let constructor = self.pop();
                let value = self.pop();
                let result = self.instance_of(&value, &constructor)?;
                self.stack.push(Value::Boolean(result));
            }
            Op::InOp => {
                let object = self.pop();
                let key = self.pop();
                let has = match &object {
                    Value::Object(obj) => obj.has_property(&key.to_js_string()),
                    other => {
                        return Err(self.throw_type_error(format!(
                            "cannot use 'in' operator on {}",
                            other.type_of()
                        )));
                    }
                };
                self.stack.push(Value::Boolean(has));
            }

            Op::Jump(rel) => {
                self.jump(at, rel);
            }
            Op::JumpIfFalse(rel) => {
                if !self.pop().to_boolean() {
                    self.jump(at, rel);
                }
            }
            Op::JumpIfTrue(rel) => {
                if self.pop().to_boolean() {
                    self.jump(at, rel);
                }
            }
            Op::JumpIfNullish(rel) => {
                if self.pop().is_nullish() {
                    self.jump(at, rel);
                }
            }
            Op::JumpIfNotNullish(rel) => {
                if !self.pop().is_nullish() {
                    self.jump(at, rel);
                }
            }

            Op::Call(argc) => {
                self.op_call(argc as usize)?;
            }
            Op::New(argc) => {
                self.op_new(argc as usize)?;
            }
            Op::MakeClosure(idx) => {
                let closure = self.make_closure(idx);
                self.stack.push(closure);
            }
            Op::Return => {
                let value = self.pop();
                if let Some(result) = self.begin_return(value)? {
                    if self.frames.len() == base {
                        return Ok(Some(result));
                    }
                    self.stack.push(result);
                }
            }

            Op::Try { catch, finally } => {
                let record = TryRecord {
                    catch_pc: (catch != 0).then(|| (at as i64 + catch as i64) as usize),
                    finally_pc: (finally != 0).then(|| (at as i64 + finally as i64) as usize),
                    sp: self.stack.len(),
                    stash: self.stash.clone(),
                    private: self.private_env.clone(),
                    iter_depth: self.iters.len(),
                };
                self.frames.last_mut().expect("frame exists").try_stack.push(record);
            }
            Op::EndTry(rel) => {
                let target = (at as i64 + rel as i64) as usize;
                let frame = self.frames.last_mut().expect("frame exists");
                let record = frame.try_stack.pop().expect("EndTry matches an open region");
                Self::truncate_finallies(frame);
                if let Some(finally) = record.finally_pc {
                    frame.finally_stack.push(FinallyEntry {
                        completion: Completion::Normal { target },
                        try_depth: frame.try_stack.len(),
                    });
                    frame.pc = finally;
                } else {
                    frame.pc = target;
                }
            }
            Op::EndFinally => {
                let entry = self
                    .frames
                    .last_mut()
                    .expect("frame exists")
                    .finally_stack
                    .pop()
                    .expect("finally entry exists");
                match entry.completion {
                    Completion::Normal { target } => {
                        self.frames.last_mut().expect("frame exists").pc = target;
                    }
                    Completion::Return(value) => {
                        if let Some(result) = self.begin_return(value)? {
                            if self.frames.len() == base {
                                return Ok(Some(result));
                            }
                            self.stack.push(result);
                        }
                    }
                    Completion::Leave { tries, stashes, iters, target } => {
                        self.begin_leave(tries, stashes, iters, target)?;
                    }
                    Completion::Throw(thrown) => {
                        return Err(Fault::Throw(thrown));
                    }
                }
            }
            Op::Throw => {
                let value = self.pop();
                return Err(self.throw_value(value));
            }
            Op::Leave { tries, pendings, stashes, iters, target } => {
                let frame = self.frames.last_mut().expect("frame exists");
                for _ in 0..pendings {
                    frame.finally_stack.pop().expect("pending completion exists");
                }
                let target = (at as i64 + target as i64) as usize;
                self.begin_leave(tries, stashes, iters, target)?;
            }

            Op::IterIn => {
                let value = self.pop();
                let keys = match &value {
                    Value::Object(obj) => {
                        obj.own_keys().into_iter().map(Value::string).collect()
                    }
                    Value::String(s) => {
                        (0..s.chars().count()).map(|i| Value::string(i.to_string())).collect()
                    }
                    _ => Vec::new(),
                };
                self.iters.push(IterRecord { kind: IterKind::Values(keys, 0), done: false });
            }
            Op::IterOf => {
                let value = self.pop();
                let kind = match &value {
                    Value::Object(obj) if obj.is_array() => IterKind::Array(obj.clone(), 0),
                    Value::Object(obj) => {
                        let next = obj.get("next");
                        if next.as_ref().is_some_and(Value::is_callable) {
                            IterKind::Protocol(obj.clone())
                        } else {
                            return Err(self
                                .throw_type_error(format!("{} is not iterable", value.to_js_string())));
                        }
                    }
                    Value::String(s) => {
                        IterKind::Values(s.chars().map(|c| Value::string(c.to_string())).collect(), 0)
                    }
                    other => {
                        return Err(
                            self.throw_type_error(format!("{} is not iterable", other.type_of()))
                        );
                    }
                };
                self.iters.push(IterRecord { kind, done: false });
            }
            Op::IterNext(rel) => {
                match self.iter_next()? {
                    Some(value) => self.stack.push(value),
                    None => self.jump(at, rel),
                }
            }
            Op::IterClose => {
                self.close_top_iter()?;
            }
        }
        Ok(None)
    }

    fn cur_program(&self) -> &Arc<Program> {
        &self.frames.last().expect("frame exists").program
    }

    fn jump(&mut self, at: usize, rel: i32) {
        let frame = self.frames.last_mut().expect("frame exists");
        frame.pc = (at as i64 + rel as i64) as usize;
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, depth: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - depth]
    }

    fn const_str(&self, idx: u32) -> Arc<str> {
        match &self.cur_program().constants[idx as usize] {
            Value::String(s) => s.clone(),
            other => unreachable!("name constant is not a string: {other:?}"),
        }
    }

    fn read_stack(&self, off: i32) -> Value {
        let base = self.frames.last().expect("frame exists").base;
        self.stack[(base as i64 + off as i64) as usize].clone()
    }

    fn write_stack(&mut self, off: i32, value: Value) {
        let base = self.frames.last().expect("frame exists").base;
        let idx = (base as i64 + off as i64) as usize;
        self.stack[idx] = value;
    }

    fn stash_at(&self, level: u16) -> StashRef {
        let mut cursor = self.stash_head();
        for _ in 0..level {
            let outer = cursor.read().outer.clone();
            cursor = outer.expect("stash level fixed at compile time");
        }
        cursor
    }

    fn dynamic_load(&mut self, name: &str, for_typeof: bool) -> Step<Value> {
        match dynamic_lookup(&self.stash, name) {
            Some(DynamicSlot::With(obj)) => {
                Ok(obj.get(name).unwrap_or(Value::Undefined))
            }
            Some(DynamicSlot::Stash(stash, idx)) => {
                let value = stash.read().get(idx);
                if matches!(value, Value::Uninit) {
                    return Err(self.throw_reference_error(format!(
                        "cannot access '{name}' before initialization"
                    )));
                }
                Ok(value)
            }
            None => match self.ctx.get_global(name) {
                Some(value) => Ok(value),
                None if for_typeof => Ok(Value::Undefined),
                None => Err(self.throw_reference_error(format!("{name} is not defined"))),
            },
        }
    }

    // ========================================================================
    // Properties
    // ========================================================================

    fn get_property(&mut self, object: &Value, key: &str) -> Step<Value> {
        match object {
            Value::Object(obj) => Ok(obj.get(key).unwrap_or(Value::Undefined)),
            Value::Function(callable) => match callable.as_ref() {
                Callable::Closure(closure) => {
                    Ok(closure.object.get(key).unwrap_or(Value::Undefined))
                }
                Callable::Native(_) => Ok(Value::Undefined),
            },
            Value::String(s) => {
                if key == "length" {
                    return Ok(Value::Number(s.chars().count() as f64));
                }
                if let Ok(index) = key.parse::<usize>() {
                    return Ok(s
                        .chars()
                        .nth(index)
                        .map(|c| Value::string(c.to_string()))
                        .unwrap_or(Value::Undefined));
                }
                Ok(Value::Undefined)
            }
            Value::Undefined | Value::Null => Err(self.throw_type_error(format!(
                "cannot read properties of {} (reading '{}')",
                object.to_js_string(),
                key
            ))),
            _ => Ok(Value::Undefined),
        }
    }

    fn set_property(&mut self, object: &Value, key: &str, value: Value) -> Step {
        match object {
            Value::Object(obj) => {
                obj.set(key, value);
                Ok(())
            }
            Value::Function(callable) => {
                if let Callable::Closure(closure) = callable.as_ref() {
                    closure.object.set(key, value);
                }
                Ok(())
            }
            Value::Undefined | Value::Null => Err(self.throw_type_error(format!(
                "cannot set properties of {} (setting '{}')",
                object.to_js_string(),
                key
            ))),
            // Property writes on primitives are silently dropped.
            _ => Ok(()),
        }
    }

    fn delete_property(&mut self, object: &Value, key: &str) -> Step<bool> {
        match object {
            Value::Object(obj) => Ok(obj.delete(key)),
            Value::Undefined | Value::Null => Err(self.throw_type_error(format!(
                "cannot delete properties of {}",
                object.to_js_string()
            ))),
            _ => Ok(true),
        }
    }

    fn instance_of(&mut self, value: &Value, constructor: &Value) -> Step<bool> {
        let prototype = match constructor {
            Value::Function(callable) => match callable.as_ref() {
                Callable::Closure(closure) => closure.object.get("prototype"),
                Callable::Native(_) => None,
            },
            _ => {
                return Err(
                    self.throw_type_error("right-hand side of 'instanceof' is not callable")
                );
            }
        };
        let Some(Value::Object(prototype)) = prototype else {
            return Ok(false);
        };
        let Value::Object(obj) = value else {
            return Ok(false);
        };
        let mut cursor = obj.proto();
        while let Some(p) = cursor {
            if p.ptr_eq(&prototype) {
                return Ok(true);
            }
            cursor = p.proto();
        }
        Ok(false)
    }

    // ========================================================================
    // Private members
    // ========================================================================

    fn private_key(&self, level: u16, idx: u16) -> (u64, u16, String) {
        let env = PrivateEnv::at_level(&self.private_env, level)
            .expect("private level fixed at compile time");
        (env.serial, idx, env.name_of(idx))
    }

    fn private_get(&mut self, object: &Value, level: u16, idx: u16) -> Step<Value> {
        let (serial, slot, name) = self.private_key(level, idx);
        match object {
            Value::Object(obj) => obj.private_get((serial, slot)).ok_or_else(|| {
                self.throw_type_error(format!(
                    "private member #{name} is not present on this object"
                ))
            }),
            _ => Err(self.throw_type_error(format!(
                "cannot read private member #{name} from a non-object"
            ))),
        }
    }

    fn private_set(
        &mut self,
        object: &Value,
        level: u16,
        idx: u16,
        value: Value,
        define: bool,
    ) -> Step {
        let (serial, slot, name) = self.private_key(level, idx);
        match object {
            Value::Object(obj) => {
                if !define && !obj.private_has((serial, slot)) {
                    return Err(self.throw_type_error(format!(
                        "private member #{name} is not present on this object"
                    )));
                }
                obj.private_set((serial, slot), value);
                Ok(())
            }
            _ => Err(self.throw_type_error(format!(
                "cannot write private member #{name} on a non-object"
            ))),
        }
    }

    /// Name-keyed private resolution for accesses inside dynamic regions.
    fn locate_private(&mut self, name: &str) -> Step<(u16, u16)> {
        let mut level = 0u16;
        let mut cursor = self.private_env.clone();
        while let Some(env) = cursor {
            if let Some(&idx) = env.template.names.get(name) {
                return Ok((level, idx));
            }
            level += 1;
            cursor = env.outer.clone();
        }
        Err(self.throw_type_error(format!("private member #{name} is not declared")))
    }

    // ========================================================================
    // Calls and closures
    // ========================================================================

    fn make_closure(&mut self, idx: u32) -> Value {
        let program = self.cur_program().functions[idx as usize].clone();
        let frame = self.frames.last().expect("frame exists");
        let (this, new_target) = if program.flags.arrow {
            (Some(frame.this.clone()), Some(frame.new_target.clone()))
        } else {
            (None, None)
        };
        let object = ObjRef::new(None);
        if !program.flags.no_construct {
            object.set("prototype", Value::Object(ObjRef::new(None)));
        }
        Value::Function(Arc::new(Callable::Closure(Closure {
            program,
            stash: self.stash.clone(),
            private_env: self.private_env.clone(),
            this,
            new_target,
            object,
        })))
    }

    fn op_call(&mut self, argc: usize) -> Step {
        let frame_start = self.stack.len() - argc - 2;
        let callee = self.stack[frame_start].clone();
        match &callee {
            Value::Function(callable) => match callable.as_ref() {
                Callable::Native(native) => {
                    let this = self.stack[frame_start + 1].clone();
                    let args = self.stack[frame_start + 2..].to_vec();
                    self.stack.truncate(frame_start);
                    let result =
                        (native.func)(self, &this, &args).map_err(|v| self.throw_value(v))?;
                    self.stack.push(result);
                    Ok(())
                }
                Callable::Closure(_) => self.push_closure_frame(frame_start, argc, None),
            },
            other => {
                let message = format!("{} is not a function", other.to_js_string());
                self.stack.truncate(frame_start);
                Err(self.throw_type_error(message))
            }
        }
    }

    fn op_new(&mut self, argc: usize) -> Step {
        let callee_idx = self.stack.len() - argc - 1;
        let callee = self.stack[callee_idx].clone();
        let callable = match &callee {
            Value::Function(callable) => callable.clone(),
            other => {
                let message = format!("{} is not a constructor", other.to_js_string());
                self.stack.truncate(callee_idx);
                return Err(self.throw_type_error(message));
            }
        };
        if !callable.is_constructible() {
            let message = format!("{} is not a constructor", callable.name());
            self.stack.truncate(callee_idx);
            return Err(self.throw_type_error(message));
        }
        let proto = match callable.as_ref() {
            Callable::Closure(closure) => match closure.object.get("prototype") {
                Some(Value::Object(p)) => Some(p),
                _ => None,
            },
            Callable::Native(_) => None,
        };
        let this = ObjRef::new(proto);
        self.stack.insert(callee_idx + 1, Value::Object(this.clone()));
        self.push_closure_frame(callee_idx, argc, Some(this))
    }

    // ========================================================================
    // Iterators
    // ========================================================================

    fn iter_next(&mut self) -> Step<Option<Value>> {
        enum Advance {
            Yield(Value),
            Exhausted,
            Protocol(ObjRef),
        }
        let idx = self.iters.len() - 1;
        let advance = match &mut self.iters[idx].kind {
            IterKind::Array(obj, index) => {
                let len = obj.len().unwrap_or(0);
                if *index < len {
                    let value = obj.element(*index).unwrap_or(Value::Undefined);
                    *index += 1;
                    Advance::Yield(value)
                } else {
                    Advance::Exhausted
                }
            }
            IterKind::Values(values, index) => {
                if *index < values.len() {
                    let value = values[*index].clone();
                    *index += 1;
                    Advance::Yield(value)
                } else {
                    Advance::Exhausted
                }
            }
            IterKind::Protocol(obj) => Advance::Protocol(obj.clone()),
        };
        match advance {
            Advance::Yield(value) => Ok(Some(value)),
            Advance::Exhausted => {
                self.iters[idx].done = true;
                Ok(None)
            }
            Advance::Protocol(iterator) => {
                let next =
                    iterator.get("next").expect("protocol iterators were checked for next()");
                let result = self.invoke(next, Value::Object(iterator), &[])?;
                let Value::Object(step) = result else {
                    return Err(self.throw_type_error("iterator result is not an object"));
                };
                let done = step.get("done").map(|d| d.to_boolean()).unwrap_or(false);
                if done {
                    self.iters[idx].done = true;
                    Ok(None)
                } else {
                    Ok(Some(step.get("value").unwrap_or(Value::Undefined)))
                }
            }
        }
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn binary_add(&mut self) -> Step {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::BigInt(x), Value::BigInt(y)) => {
                Value::bigint(x.as_ref().clone() + y.as_ref().clone())
            }
            (Value::BigInt(_), _) | (_, Value::BigInt(_)) => {
                return Err(self.throw_type_error("cannot mix BigInt and other types in addition"));
            }
            _ if matches!(&a, Value::String(_) | Value::Object(_) | Value::Function(_))
                || matches!(&b, Value::String(_) | Value::Object(_) | Value::Function(_)) =>
            {
                Value::string(format!("{}{}", a.to_js_string(), b.to_js_string()))
            }
            _ => {
                let (x, y) = (a.to_number(), b.to_number());
                match (x, y) {
                    (Some(x), Some(y)) => Value::Number(x + y),
                    _ => return Err(self.throw_type_error("invalid operands for addition")),
                }
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn binary_arith(
        &mut self,
        num_op: fn(f64, f64) -> f64,
        big_op: fn(&BigInt, &BigInt) -> Option<BigInt>,
    ) -> Step {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::BigInt(x), Value::BigInt(y)) => match big_op(x, y) {
                Some(v) => Value::bigint(v),
                None => return Err(self.throw_range_error("division by zero")),
            },
            (Value::BigInt(_), _) | (_, Value::BigInt(_)) => {
                return Err(self.throw_type_error("cannot mix BigInt and other types"));
            }
            _ => match (a.to_number(), b.to_number()) {
                (Some(x), Some(y)) => Value::Number(num_op(x, y)),
                _ => return Err(self.throw_type_error("invalid arithmetic operands")),
            },
        };
        self.stack.push(result);
        Ok(())
    }

    fn binary_exp(&mut self) -> Step {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::BigInt(x), Value::BigInt(y)) => {
                if y.is_negative() {
                    return Err(self.throw_range_error("BigInt exponent must not be negative"));
                }
                match y.to_u32() {
                    Some(exp) => Value::bigint(x.as_ref().pow(exp)),
                    None => return Err(self.throw_range_error("BigInt exponent is too large")),
                }
            }
            (Value::BigInt(_), _) | (_, Value::BigInt(_)) => {
                return Err(self.throw_type_error("cannot mix BigInt and other types"));
            }
            _ => match (a.to_number(), b.to_number()) {
                (Some(x), Some(y)) => Value::Number(x.powf(y)),
                _ => return Err(self.throw_type_error("invalid arithmetic operands")),
            },
        };
        self.stack.push(result);
        Ok(())
    }

    fn compare_op(&mut self, pick: fn(std::cmp::Ordering) -> bool) -> Step {
        let b = self.pop();
        let a = self.pop();
        let ordering = match (&a, &b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            (Value::BigInt(x), Value::BigInt(y)) => Some(x.cmp(y)),
            (Value::BigInt(x), y) => match y.to_number() {
                Some(n) => x.to_f64().unwrap_or(f64::NAN).partial_cmp(&n),
                None => None,
            },
            (x, Value::BigInt(y)) => match x.to_number() {
                Some(n) => n.partial_cmp(&y.to_f64().unwrap_or(f64::NAN)),
                None => None,
            },
            (x, y) => match (x.to_number(), y.to_number()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        };
        // NaN comparisons are false for every operator.
        self.stack.push(Value::Boolean(ordering.is_some_and(pick)));
        Ok(())
    }

    fn bitwise_op(
        &mut self,
        num_op: fn(i32, i32) -> i32,
        big_op: fn(&BigInt, &BigInt) -> BigInt,
    ) -> Step {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::BigInt(x), Value::BigInt(y)) => Value::bigint(big_op(x, y)),
            (Value::BigInt(_), _) | (_, Value::BigInt(_)) => {
                return Err(self.throw_type_error("cannot mix BigInt and other types"));
            }
            _ => match (a.to_int32(), b.to_int32()) {
                (Some(x), Some(y)) => Value::Number(num_op(x, y) as f64),
                _ => return Err(self.throw_type_error("invalid bitwise operands")),
            },
        };
        self.stack.push(result);
        Ok(())
    }

    fn shift_op(&mut self, unsigned: bool, op: fn(u32, u32) -> u32) -> Step {
        let b = self.pop();
        let a = self.pop();
        if matches!(a, Value::BigInt(_)) || matches!(b, Value::BigInt(_)) {
            if unsigned {
                return Err(self.throw_type_error("BigInts have no unsigned right shift"));
            }
            let (Value::BigInt(x), Value::BigInt(y)) = (&a, &b) else {
                return Err(self.throw_type_error("cannot mix BigInt and other types"));
            };
            let shift = y.to_i64().unwrap_or(0);
            let result = if shift >= 0 {
                x.as_ref().clone() << (shift as usize)
            } else {
                x.as_ref().clone() >> ((-shift) as usize)
            };
            self.stack.push(Value::bigint(result));
            return Ok(());
        }
        let (Some(x), Some(shift)) = (a.to_uint32(), b.to_uint32()) else {
            return Err(self.throw_type_error("invalid shift operands"));
        };
        let shifted = op(x, shift & 0x1f);
        let result = if unsigned {
            shifted as f64
        } else {
            // Signed shifts reinterpret the bits after the operation.
            (shifted as i32) as f64
        };
        self.stack.push(Value::Number(result));
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// Arithmetic helpers kept as plain functions so the dispatch arms stay flat.

fn f64_sub(a: f64, b: f64) -> f64 {
    a - b
}
fn f64_mul(a: f64, b: f64) -> f64 {
    a * b
}
fn f64_div(a: f64, b: f64) -> f64 {
    a / b
}
fn f64_mod(a: f64, b: f64) -> f64 {
    a % b
}
fn bigint_sub(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    Some(a - b)
}
fn bigint_mul(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    Some(a * b)
}
fn bigint_div(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    if b.is_zero() { None } else { Some(a / b) }
}
fn bigint_mod(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    if b.is_zero() { None } else { Some(a % b) }
}

/// The abstract (loose) equality comparison, with type coercion.
fn abstract_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        // Same-type comparisons defer to strict equality.
        (Value::Undefined, Value::Undefined)
        | (Value::Null, Value::Null) => true,
        (Value::Boolean(_), Value::Boolean(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::BigInt(_), Value::BigInt(_))
        | (Value::Object(_), Value::Object(_))
        | (Value::Function(_), Value::Function(_)) => a.strict_equals(b),

        // null == undefined
        (Value::Null, Value::Undefined) | (Value::Undefined, Value::Null) => true,

        // Number/string compare numerically.
        (Value::Number(n), Value::String(_)) => {
            b.to_number().map(|s| !n.is_nan() && *n == s).unwrap_or(false)
        }
        (Value::String(_), Value::Number(n)) => {
            a.to_number().map(|s| !n.is_nan() && s == *n).unwrap_or(false)
        }

        // BigInt against number or string compares numerically when exact.
        (Value::BigInt(x), Value::Number(n)) | (Value::Number(n), Value::BigInt(x)) => {
            n.is_finite() && n.trunc() == *n && x.to_f64().map(|f| f == *n).unwrap_or(false)
        }
        (Value::BigInt(x), Value::String(s)) | (Value::String(s), Value::BigInt(x)) => {
            s.trim().parse::<BigInt>().map(|parsed| parsed == **x).unwrap_or(false)
        }

        // Booleans convert to numbers first.
        (Value::Boolean(x), _) => {
            abstract_equals(&Value::Number(if *x { 1.0 } else { 0.0 }), b)
        }
        (_, Value::Boolean(y)) => {
            abstract_equals(a, &Value::Number(if *y { 1.0 } else { 0.0 }))
        }

        // Objects against primitives compare through their string form.
        (Value::Object(_), Value::Number(_) | Value::String(_)) => {
            abstract_equals(&Value::string(a.to_js_string()), b)
        }
        (Value::Number(_) | Value::String(_), Value::Object(_)) => {
            abstract_equals(a, &Value::string(b.to_js_string()))
        }

        _ => false,
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # pulsar-js
//!
//! A JavaScript engine core, implemented in Rust: a bytecode compiler with
//! two-pass variable storage allocation and a stack-based virtual machine
//! executing the compiled programs.
//!
//! ## Overview
//!
//! This crate covers the compilation and execution pipeline:
//! - Scope and binding resolution over a host-provided AST
//! - Storage allocation (transient stack slots vs. heap stash slots) and
//!   closure capture across nested functions
//! - Bytecode emission with back-patched control flow
//! - A single-dispatch-loop interpreter with a shared growable value stack,
//!   try/catch/finally unwinding, and interruptible execution
//!
//! Parsing source text into the [`ast`] structures is an external concern;
//! trees can also be built programmatically through [`ast::build`].
//!
//! ## Quick Start
//!
//! ```rust
//! use pulsar_js::{Engine, Value, ast::build};
//!
//! let mut engine = Engine::new();
//! let program = build::program(vec![build::expr(build::add(
//!     build::num(1.0),
//!     build::num(2.0),
//! ))]);
//! let result = engine.eval(&program).unwrap();
//! assert_eq!(result, Value::Number(3.0));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod compiler;
pub mod runtime;
pub mod vm;

#[cfg(feature = "async")]
pub mod async_engine;

use std::fmt;
use std::sync::Arc;

pub use compiler::{CompileError, Program};
pub use runtime::context::InterruptHandle;
pub use runtime::value::Value;
pub use vm::{JsException, Vm};

#[cfg(feature = "async")]
pub use async_engine::AsyncEngine;

/// The engine: a compiler front plus one owned VM instance.
///
/// Compiled [`Program`]s are immutable and may be shared across engines;
/// each engine's stacks and global environment are exclusively its own.
pub struct Engine {
    vm: Vm,
}

impl Engine {
    /// Creates an engine with a fresh global environment.
    pub fn new() -> Self {
        Self { vm: Vm::new() }
    }

    /// Compiles a syntax tree into an executable program.
    pub fn compile(&self, program: &ast::Program) -> Result<Arc<Program>, Error> {
        compiler::compile(program).map_err(Error::Compile)
    }

    /// Runs a compiled program, returning its completion value. An uncaught
    /// exception surfaces as [`Error::Runtime`]; global bindings it created
    /// before the throw remain visible.
    pub fn run(&mut self, program: &Arc<Program>) -> Result<Value, Error> {
        self.vm.run(program)
    }

    /// Runs a compiled program and then drains the deferred-job queue.
    pub fn run_protected(&mut self, program: &Arc<Program>) -> Result<Value, Error> {
        self.vm.run_protected(program)
    }

    /// Compiles and runs in one step.
    pub fn eval(&mut self, program: &ast::Program) -> Result<Value, Error> {
        let compiled = self.compile(program)?;
        self.run_protected(&compiled)
    }

    /// A handle for aborting execution from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.vm.interrupt_handle()
    }

    /// The underlying VM, for host integration (globals, natives, jobs).
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Mutable access to the underlying VM.
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced by compilation or execution.
#[derive(Debug)]
pub enum Error {
    /// A static error; nothing ran.
    Compile(CompileError),
    /// An uncaught (but catchable) exception, with the call trace captured
    /// at the moment of the throw.
    Runtime(JsException),
    /// Call depth exceeded the configured bound. Unrecoverable: bypasses
    /// every catch/finally handler.
    StackOverflow,
    /// The interrupt flag was observed. Unrecoverable, carries the reason
    /// given to [`InterruptHandle::interrupt`].
    Interrupted(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compile(e) => write!(f, "{}", e),
            Error::Runtime(e) => write!(f, "{}", e),
            Error::StackOverflow => write!(f, "RangeError: maximum call depth exceeded"),
            Error::Interrupted(reason) => write!(f, "execution interrupted: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Error::Compile(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;

    #[test]
    fn test_engine_eval_expression() {
        let mut engine = Engine::new();
        let program = build::program(vec![build::expr(build::add(
            build::num(20.0),
            build::num(22.0),
        ))]);
        assert_eq!(engine.eval(&program).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_compile_error_prevents_execution() {
        let mut engine = Engine::new();
        let program = build::program(vec![
            build::let_("x", build::num(1.0)),
            build::let_("x", build::num(2.0)),
            build::expr(build::assign("leaked", build::num(1.0))),
        ]);
        assert!(matches!(engine.eval(&program), Err(Error::Compile(_))));
        // Nothing ran, so the global assignment never happened.
        assert_eq!(engine.vm().context().get_global("leaked"), None);
    }

    #[test]
    fn test_programs_are_shareable_across_engines() {
        let program = build::program(vec![build::expr(build::add(
            build::num(1.0),
            build::num(2.0),
        ))]);
        let compiled = Engine::new().compile(&program).unwrap();
        let mut first = Engine::new();
        let mut second = Engine::new();
        assert_eq!(first.run(&compiled).unwrap(), Value::Number(3.0));
        assert_eq!(second.run(&compiled).unwrap(), Value::Number(3.0));
    }
}

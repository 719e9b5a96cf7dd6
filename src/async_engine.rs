//! Asynchronous execution wrappers.
//!
//! The VM itself is synchronous; this module provides async-friendly entry
//! points for hosts on tokio, including timeout-driven interruption built on
//! the engine's interrupt handle.
//!
//! # Example
//!
//! ```ignore
//! use pulsar_js::AsyncEngine;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = AsyncEngine::new();
//!     let program = engine.compile(&tree).unwrap();
//!     let result = engine
//!         .run_with_timeout(program, std::time::Duration::from_millis(50))
//!         .await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::compiler::Program;
use crate::runtime::context::InterruptHandle;
use crate::runtime::value::Value;
use crate::vm::Vm;
use crate::{Error, ast, compiler};

/// An asynchronous wrapper around one VM instance.
pub struct AsyncEngine {
    vm: Arc<RwLock<Vm>>,
}

impl AsyncEngine {
    /// Creates a new async engine.
    pub fn new() -> Self {
        Self { vm: Arc::new(RwLock::new(Vm::new())) }
    }

    /// Compiles a syntax tree (CPU-bound, done inline).
    pub fn compile(&self, program: &ast::Program) -> Result<Arc<Program>, Error> {
        compiler::compile(program).map_err(Error::Compile)
    }

    /// Runs a program, holding the VM write lock for the duration.
    pub async fn run(&self, program: Arc<Program>) -> Result<Value, Error> {
        let mut vm = self.vm.write().await;
        vm.run_protected(&program)
    }

    /// Runs a program on a blocking thread, interrupting it if it is still
    /// executing when the timeout elapses.
    pub async fn run_with_timeout(
        &self,
        program: Arc<Program>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let handle = { self.vm.read().await.interrupt_handle() };
        let watchdog = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                handle.interrupt("timeout");
            })
        };
        let vm = self.vm.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut vm = vm.blocking_write();
            vm.run_protected(&program)
        })
        .await
        .expect("VM execution task never panics");
        watchdog.abort();
        handle.clear();
        result
    }

    /// The interrupt handle of the wrapped VM.
    pub async fn interrupt_handle(&self) -> InterruptHandle {
        self.vm.read().await.interrupt_handle()
    }
}

impl Default for AsyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;

    #[tokio::test]
    async fn test_async_run() {
        let engine = AsyncEngine::new();
        let program = engine
            .compile(&build::program(vec![build::expr(build::add(
                build::num(1.0),
                build::num(2.0),
            ))]))
            .unwrap();
        let result = engine.run(program).await.unwrap();
        assert_eq!(result, Value::Number(3.0));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_infinite_loop() {
        let engine = AsyncEngine::new();
        // while (true) {}
        let program = engine
            .compile(&build::program(vec![build::while_(
                build::boolean(true),
                build::block(vec![]),
            )]))
            .unwrap();
        let result = engine
            .run_with_timeout(program, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Interrupted(reason)) if reason == "timeout"));
    }

    #[tokio::test]
    async fn test_timeout_unused_on_fast_programs() {
        let engine = AsyncEngine::new();
        let program = engine
            .compile(&build::program(vec![build::expr(build::num(7.0))]))
            .unwrap();
        let result = engine
            .run_with_timeout(program, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, Value::Number(7.0));
    }
}

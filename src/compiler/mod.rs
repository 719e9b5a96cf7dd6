//! The bytecode compiler: scope resolution, storage allocation, and
//! instruction emission.

pub mod bytecode;
pub mod codegen;

pub use bytecode::{Op, PrivateTemplate, Program, ProgramFlags, SlotRef, StashTemplate};
pub use codegen::Compiler;

use std::fmt;
use std::sync::Arc;

use crate::ast::{self, Pos};

/// Compiles a syntax tree into an immutable, shareable program.
pub fn compile(program: &ast::Program) -> Result<Arc<Program>, CompileError> {
    Compiler::compile(program)
}

/// What made a program unacceptable at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Malformed or disallowed construct.
    Syntax,
    /// A name that can never resolve.
    Reference,
}

/// A static error. Carries the source offset of the offending construct;
/// no code runs when compilation fails.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// Which class of error this is.
    pub kind: CompileErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Byte offset into the source.
    pub pos: Pos,
}

impl CompileError {
    /// A syntax-class compile error.
    pub fn syntax(message: impl Into<String>, pos: Pos) -> Self {
        Self { kind: CompileErrorKind::Syntax, message: message.into(), pos }
    }

    /// A reference-class compile error.
    pub fn reference(message: impl Into<String>, pos: Pos) -> Self {
        Self { kind: CompileErrorKind::Reference, message: message.into(), pos }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CompileErrorKind::Syntax => "SyntaxError",
            CompileErrorKind::Reference => "ReferenceError",
        };
        write!(f, "{}: {} (at offset {})", kind, self.message, self.pos)
    }
}

impl std::error::Error for CompileError {}

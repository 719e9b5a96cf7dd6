//! Code generation from AST to bytecode.
//!
//! The [`Compiler`] walks the tree once, building a scope/binding arena as it
//! goes and emitting placeholder instructions for every variable access and
//! forward jump. Storage allocation is two-pass: when a function or block
//! scope finishes compiling, [`Compiler::finalize_scope`] decides each
//! binding's storage class (transient stack slot vs. heap stash slot) and
//! rewrites the recorded placeholders into concrete accessor instructions.
//! Only after the whole tree is compiled are the per-function code buffers
//! frozen into immutable [`Program`]s.

mod expressions;
mod scope;
mod statements;

#[cfg(test)]
mod tests;

pub use scope::{
    AccessMode, AccessPoint, Binding, BindingId, BindingKind, Block, BlockKind, JumpOut, ProgId,
    Resolution, Scope, ScopeArena, ScopeId, ScopeKind, Storage,
};

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ast::{self, Pos};
use crate::compiler::CompileError;
use crate::compiler::bytecode::{
    Op, PrivateTemplate, Program, ProgramFlags, SlotRef, StashTemplate,
};
use crate::runtime::value::Value;

/// Sentinel operand for a not-yet-decided block stash.
const STASH_PENDING: u32 = u32::MAX;

/// One function's code under construction.
#[derive(Debug)]
pub(crate) struct ProgBuilder {
    name: String,
    code: Vec<Op>,
    constants: Vec<Value>,
    str_consts: FxHashMap<String, u32>,
    /// Child builders, by compiler-wide index; becomes `Program::functions`.
    functions: Vec<usize>,
    stash_templates: Vec<StashTemplate>,
    func_stash: Option<u32>,
    private_envs: Vec<Arc<PrivateTemplate>>,
    src_map: Vec<(u32, Pos)>,
    num_args: u16,
    next_local: u16,
    param_copies: Vec<(u16, u16)>,
    arguments_at: Option<SlotRef>,
    callee_at: Option<SlotRef>,
    flags: ProgramFlags,
    /// Break/continue tracking for constructs inside this function.
    blocks: Vec<Block>,
    scope: ScopeId,
    last_pos: Pos,
}

impl ProgBuilder {
    fn new(name: String, scope: ScopeId) -> Self {
        Self {
            name,
            code: Vec::new(),
            constants: Vec::new(),
            str_consts: FxHashMap::default(),
            functions: Vec::new(),
            stash_templates: Vec::new(),
            func_stash: None,
            private_envs: Vec::new(),
            src_map: Vec::new(),
            num_args: 0,
            next_local: 0,
            param_copies: Vec::new(),
            arguments_at: None,
            callee_at: None,
            flags: ProgramFlags::default(),
            blocks: Vec::new(),
            scope,
            last_pos: 0,
        }
    }
}

/// A private-name environment open during class-body compilation.
#[derive(Debug)]
struct PrivateCtx {
    names: FxHashMap<String, u16>,
    /// The scope in which the class literal appears; a `with` scope between
    /// an access site and this scope forces the name-keyed fallback.
    scope: ScopeId,
}

/// Rollback state for dummy (dead-branch) compilation.
#[derive(Debug)]
struct DummyMark {
    code_len: usize,
    src_len: usize,
    fn_len: usize,
    access_len: usize,
    /// (breaks, continues) lengths per open block at mark time.
    block_lens: Vec<(usize, usize)>,
}

/// Compiles an AST into executable [`Program`]s.
pub struct Compiler {
    pub(crate) arena: ScopeArena,
    progs: Vec<ProgBuilder>,
    /// Index of the builder currently emitted into.
    cur: usize,
    /// The scope currently open.
    pub(crate) scope: ScopeId,
    file: Arc<str>,
    /// Access points logged in emission order, with the binding's previous
    /// `captured` flag, so dummy compilation can be rolled back.
    access_log: Vec<(BindingId, bool)>,
    /// Open class-body private environments, innermost last.
    private_stack: Vec<PrivateCtx>,
    /// Depth of nested dummy regions; anything emitted while non-zero is
    /// discarded.
    dummy_depth: u32,
}

impl Compiler {
    /// Compiles a whole script into its top-level program.
    pub fn compile(program: &ast::Program) -> Result<Arc<Program>, CompileError> {
        tracing::debug!(file = %program.file, "compiling program");
        let mut arena = ScopeArena::new();
        let root = arena.push_scope(None, ScopeKind::Global, ProgId(0));
        arena.scope_mut(root).strict = program.strict;
        let mut compiler = Compiler {
            arena,
            progs: vec![ProgBuilder::new("<main>".to_string(), root)],
            cur: 0,
            scope: root,
            file: Arc::from(program.file.as_str()),
            access_log: Vec::new(),
            private_stack: Vec::new(),
            dummy_depth: 0,
        };
        compiler.builder_mut().flags.strict = program.strict;
        compiler.compile_body(&program.body, true)?;
        compiler.emit(Op::Return);
        compiler.finalize_scope(root, None, None)?;
        Ok(compiler.freeze())
    }

    // ========================================================================
    // Builder plumbing
    // ========================================================================

    pub(crate) fn builder(&self) -> &ProgBuilder {
        &self.progs[self.cur]
    }

    /// Index of the program currently being emitted.
    pub(crate) fn cur_prog(&self) -> u32 {
        self.cur as u32
    }

    pub(crate) fn builder_mut(&mut self) -> &mut ProgBuilder {
        &mut self.progs[self.cur]
    }

    /// Appends an instruction and returns its index.
    pub(crate) fn emit(&mut self, op: Op) -> u32 {
        let builder = self.builder_mut();
        let pc = builder.code.len() as u32;
        builder.code.push(op);
        pc
    }

    /// Current instruction index.
    pub(crate) fn here(&self) -> u32 {
        self.builder().code.len() as u32
    }

    /// Records a source position for instructions emitted from here on.
    pub(crate) fn set_pos(&mut self, pos: Pos) {
        let here = self.here();
        let builder = self.builder_mut();
        if builder.last_pos == pos && !builder.src_map.is_empty() {
            return;
        }
        builder.last_pos = pos;
        match builder.src_map.last_mut() {
            Some(last) if last.0 == here => last.1 = pos,
            _ => builder.src_map.push((here, pos)),
        }
    }

    /// Interns a value in the constant pool.
    pub(crate) fn const_idx(&mut self, value: Value) -> u32 {
        let builder = self.builder_mut();
        let idx = builder.constants.len() as u32;
        builder.constants.push(value);
        idx
    }

    /// Interns a string constant, deduplicating repeats.
    pub(crate) fn str_idx(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.builder().str_consts.get(s) {
            return idx;
        }
        let idx = self.const_idx(Value::string(s));
        self.builder_mut().str_consts.insert(s.to_string(), idx);
        idx
    }

    /// Interns a string constant into an arbitrary builder (used while
    /// rewriting access placeholders in already-compiled children).
    fn str_idx_in(&mut self, prog: usize, s: &str) -> u32 {
        let builder = &mut self.progs[prog];
        if let Some(&idx) = builder.str_consts.get(s) {
            return idx;
        }
        let idx = builder.constants.len() as u32;
        builder.constants.push(Value::string(s));
        builder.str_consts.insert(s.to_string(), idx);
        idx
    }

    /// Points the relative-jump operand at `pc` to the current end of code.
    pub(crate) fn patch_jump(&mut self, pc: u32) {
        let target = self.here();
        self.patch_jump_to(pc, target);
    }

    /// Points the relative-jump operand at `pc` to `target`.
    pub(crate) fn patch_jump_to(&mut self, pc: u32, target: u32) {
        let rel = target as i32 - pc as i32;
        match &mut self.builder_mut().code[pc as usize] {
            Op::Jump(o)
            | Op::JumpIfFalse(o)
            | Op::JumpIfTrue(o)
            | Op::JumpIfNullish(o)
            | Op::JumpIfNotNullish(o)
            | Op::IterNext(o)
            | Op::EndTry(o)
            | Op::Leave { target: o, .. } => *o = rel,
            other => unreachable!("patching non-jump instruction {other:?}"),
        }
    }

    pub(crate) fn error(&self, message: impl Into<String>, pos: Pos) -> CompileError {
        CompileError::syntax(message, pos)
    }

    // ========================================================================
    // Dummy compilation of statically dead branches
    // ========================================================================

    /// Statically known truthiness of an expression, for dead-branch
    /// detection. Only literals participate.
    pub(crate) fn static_truthiness(expr: &ast::Expression) -> Option<bool> {
        if let ast::Expression::Literal(lit) = expr {
            return Some(match &lit.value {
                ast::LiteralValue::Number(n) => *n != 0.0 && !n.is_nan(),
                ast::LiteralValue::String(s) => !s.is_empty(),
                ast::LiteralValue::Boolean(b) => *b,
                ast::LiteralValue::Null | ast::LiteralValue::Undefined => false,
                ast::LiteralValue::BigInt(b) => {
                    use num_traits::Zero;
                    !b.is_zero()
                }
            });
        }
        None
    }

    fn dummy_mark(&self) -> DummyMark {
        let builder = self.builder();
        DummyMark {
            code_len: builder.code.len(),
            src_len: builder.src_map.len(),
            fn_len: builder.functions.len(),
            access_len: self.access_log.len(),
            block_lens: builder
                .blocks
                .iter()
                .map(|b| (b.breaks.len(), b.continues.len()))
                .collect(),
        }
    }

    fn dummy_rollback(&mut self, mark: DummyMark) {
        // Un-record accesses newest-first so the captured flag ends up as it
        // was before the dead branch touched anything.
        while self.access_log.len() > mark.access_len {
            let (binding, was_captured) = self.access_log.pop().expect("log length checked");
            let b = self.arena.binding_mut(binding);
            b.accesses.pop();
            b.captured = was_captured;
        }
        let builder = self.builder_mut();
        builder.code.truncate(mark.code_len);
        builder.src_map.truncate(mark.src_len);
        builder.functions.truncate(mark.fn_len);
        for (block, (breaks, continues)) in
            builder.blocks.iter_mut().zip(mark.block_lens.into_iter())
        {
            block.breaks.truncate(breaks);
            block.continues.truncate(continues);
        }
    }

    /// Compiles a statically-dead statement for error checking only; all
    /// emitted code and recorded bookkeeping are discarded.
    pub(crate) fn compile_dead_statement(&mut self, stmt: &ast::Statement) -> Result<(), CompileError> {
        let mark = self.dummy_mark();
        self.dummy_depth += 1;
        let result = self.compile_statement(stmt, false);
        self.dummy_depth -= 1;
        self.dummy_rollback(mark);
        result
    }

    /// Compiles a statically-dead expression for error checking only.
    pub(crate) fn compile_dead_expression(
        &mut self,
        expr: &ast::Expression,
    ) -> Result<(), CompileError> {
        let mark = self.dummy_mark();
        self.dummy_depth += 1;
        let result = self.compile_expression(expr, true);
        self.dummy_depth -= 1;
        self.dummy_rollback(mark);
        result
    }

    // ========================================================================
    // Variable access
    // ========================================================================

    /// Emits the placeholder for a static binding access and records the
    /// access point for the allocation finalizer.
    pub(crate) fn record_access(&mut self, binding: BindingId, mode: AccessMode) {
        let pc = self.emit(Op::Unresolved(binding.0));
        let origin = self.scope;
        let prog = ProgId(self.cur as u32);
        let crosses_frame = {
            let b = self.arena.binding(binding);
            self.arena.scope(origin).func_depth > self.arena.scope(b.scope).func_depth
        };
        let was_captured = self.arena.binding(binding).captured;
        let b = self.arena.binding_mut(binding);
        b.accesses.push(AccessPoint { prog, pc, origin, mode });
        if crosses_frame {
            b.captured = true;
        }
        self.access_log.push((binding, was_captured));
    }

    /// Marks a binding as dynamically reachable (resolved through a `with`
    /// scope), forcing stash storage without adding an access point.
    pub(crate) fn force_stash(&mut self, binding: BindingId) {
        let was = self.arena.binding(binding).captured;
        self.arena.binding_mut(binding).captured = true;
        // Logged so dead branches can undo it.
        self.access_log.push((binding, was));
        self.arena.binding_mut(binding).accesses.push(AccessPoint {
            prog: ProgId(self.cur as u32),
            pc: u32::MAX,
            origin: self.scope,
            mode: AccessMode::Load,
        });
    }

    /// Emits a read of `name` from the current scope.
    pub(crate) fn compile_ident_load(&mut self, name: &str, typeof_mode: bool) {
        match self.arena.resolve(self.scope, name) {
            Resolution::Static(binding) => {
                let mode = if typeof_mode { AccessMode::LoadTypeof } else { AccessMode::Load };
                self.record_access(binding, mode);
            }
            Resolution::Dynamic(found) => {
                if let Some(binding) = found {
                    self.force_stash(binding);
                }
                let idx = self.str_idx(name);
                self.emit(if typeof_mode {
                    Op::LoadDynamicTypeof(idx)
                } else {
                    Op::LoadDynamic(idx)
                });
            }
            Resolution::Unresolved => {
                if name == "arguments" {
                    if let Some(binding) = self.materialize_arguments() {
                        let mode =
                            if typeof_mode { AccessMode::LoadTypeof } else { AccessMode::Load };
                        self.record_access(binding, mode);
                        return;
                    }
                }
                let idx = self.str_idx(name);
                self.emit(if typeof_mode {
                    Op::LoadGlobalTypeof(idx)
                } else {
                    Op::LoadGlobal(idx)
                });
            }
        }
    }

    /// Emits a write of the stack top into `name`.
    pub(crate) fn compile_ident_store(&mut self, name: &str) {
        match self.arena.resolve(self.scope, name) {
            Resolution::Static(binding) => {
                self.record_access(binding, AccessMode::Store);
            }
            Resolution::Dynamic(found) => {
                if let Some(binding) = found {
                    self.force_stash(binding);
                }
                let idx = self.str_idx(name);
                self.emit(Op::StoreDynamic(idx));
            }
            Resolution::Unresolved => {
                if name == "arguments" {
                    if let Some(binding) = self.materialize_arguments() {
                        self.record_access(binding, AccessMode::Store);
                        return;
                    }
                }
                let idx = self.str_idx(name);
                let strict = self.arena.scope(self.scope).strict;
                self.emit(if strict { Op::StoreGlobalStrict(idx) } else { Op::StoreGlobal(idx) });
            }
        }
    }

    /// Lazily creates the `arguments` binding in the nearest non-arrow
    /// function scope. Returns `None` at the top level, where `arguments`
    /// stays an ordinary global reference.
    fn materialize_arguments(&mut self) -> Option<BindingId> {
        let home = self.arena.home_function_scope(self.scope);
        if self.arena.scope(home).kind != ScopeKind::Function {
            return None;
        }
        let binding = self
            .arena
            .declare(home, "arguments", BindingKind::Var, 0)
            .expect("arguments cannot collide after failed resolution");
        let prog = self.arena.scope(home).prog;
        self.progs[prog.0 as usize].flags.needs_arguments = true;
        Some(binding)
    }

    // ========================================================================
    // Scopes and allocation finalization
    // ========================================================================

    /// Opens a block scope and emits its (possibly unnecessary) stash push.
    /// Returns the scope and the push placeholder to hand back to
    /// [`Compiler::leave_block_scope`].
    pub(crate) fn enter_block_scope(&mut self) -> (ScopeId, u32) {
        let scope =
            self.arena
                .push_scope(Some(self.scope), ScopeKind::Block, ProgId(self.cur as u32));
        self.scope = scope;
        let push_pc = self.emit(Op::PushStash(STASH_PENDING));
        (scope, push_pc)
    }

    /// Closes a block scope: emits the pop placeholder, finalizes the
    /// scope's allocations, and rewrites both placeholders.
    pub(crate) fn leave_block_scope(
        &mut self,
        scope: ScopeId,
        push_pc: u32,
    ) -> Result<(), CompileError> {
        let pop_pc = self.emit(Op::PopStash);
        self.finalize_scope(scope, Some(push_pc), Some(pop_pc))?;
        self.scope = self.arena.scope(scope).outer.expect("block scopes have an outer scope");
        Ok(())
    }

    /// Emits TDZ resets for a block's stack-allocated lexicals, so re-entry
    /// (loop iterations) restores the dead zone. Recorded as ordinary access
    /// points; the finalizer rewrites stash-allocated ones to `Nop` because
    /// a fresh stash is pushed on re-entry anyway.
    pub(crate) fn emit_tdz_resets(&mut self, scope: ScopeId) {
        let lexicals: Vec<BindingId> = self
            .arena
            .scope(scope)
            .bindings
            .iter()
            .copied()
            .filter(|&b| self.arena.binding(b).kind.has_tdz())
            .collect();
        for binding in lexicals {
            self.record_access(binding, AccessMode::Reset);
        }
    }

    /// Decides storage for every binding of `scope` and rewrites all of its
    /// recorded placeholder instructions to concrete accessors.
    ///
    /// Inner scopes always finalize before outer ones, so by the time a
    /// binding's level is computed every scope between an access origin and
    /// the binding has already made its stash decision.
    pub(crate) fn finalize_scope(
        &mut self,
        scope: ScopeId,
        push_pc: Option<u32>,
        pop_pc: Option<u32>,
    ) -> Result<(), CompileError> {
        debug_assert!(!self.arena.scope(scope).finalized, "scope finalized twice");
        let is_global = self.arena.scope(scope).kind == ScopeKind::Global;
        let is_function = self.arena.scope(scope).is_function_boundary();
        let prog = self.arena.scope(scope).prog.0 as usize;
        let bindings: Vec<BindingId> = self.arena.scope(scope).bindings.clone();

        // Pass one: assign storage.
        let mut template = StashTemplate::default();
        for &id in &bindings {
            let (kind, captured, arg_index, name) = {
                let b = self.arena.binding(id);
                (b.kind, b.captured, b.arg_index, b.name.clone())
            };
            let storage = if is_global
                && matches!(kind, BindingKind::Var | BindingKind::Function)
            {
                Storage::Global
            } else if captured {
                let idx = template.size;
                template.names.insert(name, idx);
                template.size += 1;
                Storage::Stash(idx)
            } else if kind == BindingKind::Arg {
                let num_args = self.progs[prog].num_args as i32;
                Storage::Stack(arg_index as i32 - num_args)
            } else {
                let local = self.progs[prog].next_local;
                self.progs[prog].next_local += 1;
                Storage::Stack(local as i32)
            };
            self.arena.binding_mut(id).storage = Some(storage);
            if kind == BindingKind::Arg {
                if let Storage::Stash(idx) = storage {
                    self.progs[prog].param_copies.push((arg_index, idx));
                }
            }
            if name_is_arguments(&self.arena, id) && self.progs[prog].flags.needs_arguments {
                self.progs[prog].arguments_at = Some(match storage {
                    Storage::Stack(off) => SlotRef::Stack(off),
                    Storage::Stash(idx) => SlotRef::Stash(idx),
                    Storage::Global => unreachable!("arguments is never a global binding"),
                });
            }
        }

        // Record the stash decision and patch the scope instructions.
        if template.size > 0 {
            self.arena.scope_mut(scope).stash_size = Some(template.size);
            if is_function {
                let idx = self.progs[prog].stash_templates.len() as u32;
                self.progs[prog].stash_templates.push(template);
                self.progs[prog].func_stash = Some(idx);
            } else {
                let idx = self.progs[prog].stash_templates.len() as u32;
                self.progs[prog].stash_templates.push(template);
                let push = push_pc.expect("block scopes emit a stash push placeholder");
                self.progs[prog].code[push as usize] = Op::PushStash(idx);
            }
        } else {
            if let Some(push) = push_pc {
                self.progs[prog].code[push as usize] = Op::Nop;
            }
            if let Some(pop) = pop_pc {
                self.progs[prog].code[pop as usize] = Op::Nop;
            }
        }

        self.arena.scope_mut(scope).finalized = true;

        // Pass two: rewrite every access point into its concrete accessor.
        for &id in &bindings {
            let accesses = self.arena.binding(id).accesses.clone();
            for ap in accesses {
                if ap.pc == u32::MAX {
                    continue; // capture marker without an instruction
                }
                self.rewrite_access(id, ap);
            }
        }
        Ok(())
    }

    fn rewrite_access(&mut self, id: BindingId, ap: AccessPoint) {
        let (kind, storage, scope, name) = {
            let b = self.arena.binding(id);
            (b.kind, b.storage.expect("storage decided before rewrite"), b.scope, b.name.clone())
        };
        let tdz = kind.has_tdz();
        let is_const = kind == BindingKind::Const;
        let op = match storage {
            Storage::Global => {
                let idx = self.str_idx_in(ap.prog.0 as usize, &name);
                match ap.mode {
                    AccessMode::Load => Op::LoadGlobal(idx),
                    AccessMode::LoadTypeof => Op::LoadGlobalTypeof(idx),
                    AccessMode::Store | AccessMode::Init => Op::StoreGlobal(idx),
                    AccessMode::Reset => Op::Nop,
                }
            }
            Storage::Stack(off) => match ap.mode {
                AccessMode::Load => {
                    if tdz {
                        Op::LoadStackTdz(off)
                    } else {
                        Op::LoadStack(off)
                    }
                }
                AccessMode::LoadTypeof => {
                    if tdz {
                        Op::LoadStackTdz(off)
                    } else {
                        Op::LoadStack(off)
                    }
                }
                AccessMode::Store => {
                    if is_const {
                        let idx = self.str_idx_in(ap.prog.0 as usize, &name);
                        Op::ThrowConst(idx)
                    } else {
                        Op::StoreStack(off)
                    }
                }
                AccessMode::Init => Op::InitStack(off),
                AccessMode::Reset => Op::ResetStack(off),
            },
            Storage::Stash(idx) => {
                let level = self.arena.stash_level(ap.origin, scope);
                match ap.mode {
                    AccessMode::Load | AccessMode::LoadTypeof => {
                        if tdz {
                            Op::LoadStashTdz { level, idx }
                        } else {
                            Op::LoadStash { level, idx }
                        }
                    }
                    AccessMode::Store => {
                        if is_const {
                            let name_idx = self.str_idx_in(ap.prog.0 as usize, &name);
                            Op::ThrowConst(name_idx)
                        } else {
                            Op::StoreStash { level, idx }
                        }
                    }
                    AccessMode::Init => Op::InitStash { level, idx },
                    // Re-entry pushes a fresh stash, which is born
                    // uninitialized already.
                    AccessMode::Reset => Op::Nop,
                }
            }
        };
        self.progs[ap.prog.0 as usize].code[ap.pc as usize] = op;
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Compiles a function literal into a child program and returns its
    /// index for [`Op::MakeClosure`]. `class_members` carries the class body
    /// when compiling a constructor, whose instance fields initialize in a
    /// preamble; `self_binding` gives named function expressions a binding
    /// for recursive self-reference.
    pub(crate) fn compile_function(
        &mut self,
        name: Option<&str>,
        params: &[ast::Pattern],
        body: FunctionBody<'_>,
        strict: bool,
        flags_init: ProgramFlags,
        class_members: Option<&[ast::ClassMember]>,
        self_binding: bool,
        pos: Pos,
    ) -> Result<u32, CompileError> {
        let child = self.progs.len();
        let fn_idx = {
            let parent = self.builder_mut();
            parent.functions.push(child);
            (parent.functions.len() - 1) as u32
        };

        let scope = self
            .arena
            .push_scope(Some(self.scope), ScopeKind::Function, ProgId(child as u32));
        if strict {
            self.arena.scope_mut(scope).strict = true;
        }
        self.arena.scope_mut(scope).arrow = flags_init.arrow;

        let display_name = name.unwrap_or("<anonymous>").to_string();
        let mut builder = ProgBuilder::new(display_name, scope);
        builder.num_args = params.len() as u16;
        builder.flags = flags_init;
        builder.flags.strict = strict || self.builder().flags.strict;
        self.progs.push(builder);

        let saved_cur = self.cur;
        let saved_scope = self.scope;
        self.cur = child;
        self.scope = scope;
        self.set_pos(pos);

        // A named function expression can call itself through its own name.
        let self_name = if self_binding { name.map(|n| n.to_string()) } else { None };
        if let Some(n) = &self_name {
            self.arena.declare(scope, n, BindingKind::Function, pos)?;
        }

        // Declare identifier parameters; pattern parameters destructure from
        // their raw argument slot in the entry preamble below.
        let num_args = params.len() as u16;
        for (i, param) in params.iter().enumerate() {
            if let ast::Pattern::Identifier(ident) = param {
                let binding =
                    self.arena.declare(scope, &ident.name, BindingKind::Arg, ident.pos)?;
                self.arena.binding_mut(binding).arg_index = i as u16;
            }
        }
        for (i, param) in params.iter().enumerate() {
            if !matches!(param, ast::Pattern::Identifier(_)) {
                self.declare_pattern(param, BindingKind::Var)?;
                self.emit(Op::LoadStack(i as i32 - num_args as i32));
                self.init_pattern(param)?;
            }
        }

        let result = (|| -> Result<(), CompileError> {
            if let Some(members) = class_members {
                self.emit_field_initializers(members)?;
            }
            match body {
                FunctionBody::Block(stmts) => {
                    self.compile_body(stmts, false)?;
                    self.emit(Op::Undefined);
                    self.emit(Op::Return);
                }
                FunctionBody::Expression(expr) => {
                    self.compile_expression(expr, true)?;
                    self.emit(Op::Return);
                }
            }
            self.finalize_scope(scope, None, None)?;
            if let Some(n) = &self_name {
                if let Resolution::Static(binding) = self.arena.resolve(scope, n) {
                    let callee_at = match self.arena.binding(binding).storage {
                        Some(Storage::Stack(off)) => Some(SlotRef::Stack(off)),
                        Some(Storage::Stash(idx)) => Some(SlotRef::Stash(idx)),
                        _ => None,
                    };
                    self.builder_mut().callee_at = callee_at;
                }
            }
            Ok(())
        })();

        self.cur = saved_cur;
        self.scope = saved_scope;
        result?;
        Ok(fn_idx)
    }

    /// Compiles a statement list with `var`/function hoisting, used for both
    /// function bodies and the top-level script.
    pub(crate) fn compile_body(
        &mut self,
        statements: &[ast::Statement],
        keep_last: bool,
    ) -> Result<(), CompileError> {
        self.declare_lexicals(statements)?;
        self.hoist_vars(statements)?;
        self.hoist_functions(statements)?;
        let len = statements.len();
        for (i, stmt) in statements.iter().enumerate() {
            let keep = keep_last && i == len - 1;
            self.compile_statement(stmt, keep)?;
        }
        if keep_last && len == 0 {
            self.emit(Op::Undefined);
        }
        Ok(())
    }

    /// Pre-declares the lexical (`let`/`const`/class) bindings of a
    /// statement list in the current scope, so that code above the
    /// declaration site resolves to the right binding and faults in its
    /// temporal dead zone rather than reaching an outer name.
    pub(crate) fn declare_lexicals(
        &mut self,
        statements: &[ast::Statement],
    ) -> Result<(), CompileError> {
        for stmt in statements {
            match stmt {
                ast::Statement::VariableDeclaration(decl) if decl.kind != ast::VariableKind::Var => {
                    let kind = if decl.kind == ast::VariableKind::Const {
                        BindingKind::Const
                    } else {
                        BindingKind::Let
                    };
                    for declarator in &decl.declarations {
                        self.declare_pattern(&declarator.id, kind)?;
                    }
                }
                ast::Statement::ClassDeclaration(decl) => {
                    self.arena.declare(self.scope, &decl.id.name, BindingKind::Let, decl.id.pos)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Hoists `var` declarations (recursively collected) to the nearest
    /// variable-target scope, initializing each to `undefined`. Names that
    /// collapse onto an existing parameter or function binding keep their
    /// value instead.
    pub(crate) fn hoist_vars(&mut self, statements: &[ast::Statement]) -> Result<(), CompileError> {
        let mut var_names: Vec<(String, Pos)> = Vec::new();
        for stmt in statements {
            collect_hoisted_vars(stmt, &mut var_names);
        }
        let target = self.arena.variable_scope(self.scope);
        let is_global = self.arena.scope(target).kind == ScopeKind::Global;
        for (name, pos) in var_names {
            let pre_existing = self.arena.scope(target).names.contains_key(&name);
            let binding = self.arena.declare(target, &name, BindingKind::Var, pos)?;
            if pre_existing {
                continue;
            }
            if is_global {
                let idx = self.str_idx(&name);
                self.emit(Op::DeclareGlobal(idx));
            } else {
                self.emit(Op::Undefined);
                self.record_access(binding, AccessMode::Init);
            }
        }
        Ok(())
    }

    /// Binds the function declarations of one statement list and creates
    /// their closures up front, so calls above the declaration site work.
    pub(crate) fn hoist_functions(
        &mut self,
        statements: &[ast::Statement],
    ) -> Result<(), CompileError> {
        for stmt in statements {
            if let ast::Statement::FunctionDeclaration(func) = stmt {
                let ident = func
                    .name
                    .as_ref()
                    .ok_or_else(|| self.error("function declaration requires a name", func.pos))?
                    .clone();
                let binding =
                    self.arena.declare(self.scope, &ident.name, BindingKind::Function, ident.pos)?;
                let fn_idx = self.compile_function(
                    Some(&ident.name),
                    &func.params,
                    FunctionBody::Block(&func.body),
                    func.strict,
                    ProgramFlags::default(),
                    None,
                    false,
                    func.pos,
                )?;
                self.emit(Op::MakeClosure(fn_idx));
                self.record_access(binding, AccessMode::Init);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Break/continue tracking
    // ========================================================================

    /// Opens a break/continue tracking block. `boundary` is the scope jumps
    /// out of the construct land in: stash pops are counted up to it, so a
    /// construct that wraps itself in its own scope (for-let, switch) passes
    /// the scope *outside* that wrapper.
    pub(crate) fn push_block(
        &mut self,
        kind: BlockKind,
        label: Option<String>,
        has_iter: bool,
        boundary: ScopeId,
    ) {
        self.builder_mut().blocks.push(Block {
            kind,
            label,
            breaks: Vec::new(),
            continues: Vec::new(),
            scope: boundary,
            has_iter,
        });
    }

    pub(crate) fn pop_block(&mut self) -> Block {
        self.builder_mut().blocks.pop().expect("unbalanced block stack")
    }

    /// Emits an unwinding branch out to the block at `target_index` (an
    /// index into the block stack) and registers it for patching. `for_break`
    /// selects the break list; continue jumps keep the target loop's own
    /// iterator open.
    pub(crate) fn emit_jump_out(
        &mut self,
        target_index: usize,
        for_break: bool,
    ) -> Result<(), CompileError> {
        let mut tries: u16 = 0;
        let mut pendings: u16 = 0;
        let mut iters: u16 = 0;
        let mut effective_scope = self.scope;
        let mut crossed_try = false;
        {
            // Walk outward-in from the target. Unwinding a protected region
            // restores stash chain and iterator depth to that region's entry
            // state, so stash pops count from the outermost crossed region
            // and iterators inside any crossed region are excluded; its
            // record already closes them.
            let blocks = &self.builder().blocks;
            for (i, block) in blocks.iter().enumerate().skip(target_index) {
                match block.kind {
                    BlockKind::Try => {
                        tries += 1;
                        if !crossed_try {
                            crossed_try = true;
                            effective_scope = block.scope;
                        }
                    }
                    BlockKind::Finally => pendings += 1,
                    BlockKind::Loop | BlockKind::Switch | BlockKind::Label => {}
                }
                if block.has_iter && !crossed_try {
                    let crossing_target = i == target_index;
                    if for_break || !crossing_target {
                        iters += 1;
                    }
                }
            }
        }
        let pc = self.emit(Op::Leave { tries, pendings, stashes: 0, iters, target: 0 });
        let out = JumpOut { pc, effective_scope };
        let block = &mut self.builder_mut().blocks[target_index];
        if for_break {
            block.breaks.push(out);
        } else {
            block.continues.push(out);
        }
        Ok(())
    }

    /// Finds the innermost block a break/continue targets.
    pub(crate) fn find_jump_target(
        &self,
        label: Option<&str>,
        for_break: bool,
        pos: Pos,
    ) -> Result<usize, CompileError> {
        let blocks = &self.builder().blocks;
        for (i, block) in blocks.iter().enumerate().rev() {
            let matches = match (label, for_break) {
                (Some(l), _) => {
                    block.label.as_deref() == Some(l)
                        && (for_break || block.kind == BlockKind::Loop)
                }
                (None, true) => matches!(block.kind, BlockKind::Loop | BlockKind::Switch),
                (None, false) => block.kind == BlockKind::Loop,
            };
            if matches {
                return Ok(i);
            }
        }
        Err(self.error(
            match (label, for_break) {
                (Some(l), true) => format!("undefined label '{l}' for break"),
                (Some(l), false) => format!("undefined label '{l}' for continue"),
                (None, true) => "break outside of a loop or switch".to_string(),
                (None, false) => "continue outside of a loop".to_string(),
            },
            pos,
        ))
    }

    /// Patches a block's pending break (or continue) branches to `target`,
    /// filling in each branch's stash-pop count now that every scope on its
    /// path has been finalized.
    pub(crate) fn patch_jump_outs(&mut self, outs: Vec<JumpOut>, boundary: ScopeId, target: u32) {
        for out in outs {
            let stashes = self.arena.stashes_between(out.effective_scope, boundary);
            match &mut self.builder_mut().code[out.pc as usize] {
                Op::Leave { stashes: s, target: t, .. } => {
                    *s = stashes;
                    *t = target as i32 - out.pc as i32;
                }
                other => unreachable!("jump-out patch hit {other:?}"),
            }
        }
    }

    // ========================================================================
    // Private environments
    // ========================================================================

    pub(crate) fn push_private_env(&mut self, names: FxHashMap<String, u16>) -> u32 {
        self.private_stack.push(PrivateCtx { names, scope: self.scope });
        let ctx = self.private_stack.last().expect("just pushed");
        let template = Arc::new(PrivateTemplate { names: ctx.names.clone() });
        let builder = self.builder_mut();
        builder.private_envs.push(template);
        (builder.private_envs.len() - 1) as u32
    }

    pub(crate) fn pop_private_env(&mut self) {
        self.private_stack.pop().expect("unbalanced private environments");
    }

    /// Resolves a private name to its (level, index) address, or signals
    /// that the name-keyed fallback is needed because the access site sits
    /// inside a dynamic region of the class body.
    pub(crate) fn resolve_private(
        &self,
        name: &str,
        pos: Pos,
    ) -> Result<PrivateResolution, CompileError> {
        for (level, ctx) in self.private_stack.iter().rev().enumerate() {
            if let Some(&idx) = ctx.names.get(name) {
                // A `with` scope between here and the class body defeats
                // static addressing.
                let mut cursor = self.scope;
                while cursor != ctx.scope {
                    let s = self.arena.scope(cursor);
                    if s.kind == ScopeKind::With {
                        return Ok(PrivateResolution::Dynamic);
                    }
                    match s.outer {
                        Some(outer) => cursor = outer,
                        None => break,
                    }
                }
                return Ok(PrivateResolution::Static { level: level as u16, idx });
            }
        }
        Err(CompileError::syntax(
            format!("private field '#{name}' must be declared in an enclosing class"),
            pos,
        ))
    }

    // ========================================================================
    // Freezing
    // ========================================================================

    /// Freezes every builder into an immutable [`Program`], children first,
    /// and returns the top-level program. Builders orphaned by discarded
    /// dead branches are unreachable from the root and skipped; their code
    /// may still hold access placeholders whose outer bindings rolled back.
    fn freeze(mut self) -> Arc<Program> {
        let mut reachable = vec![false; self.progs.len()];
        let mut worklist = vec![0usize];
        while let Some(idx) = worklist.pop() {
            if std::mem::replace(&mut reachable[idx], true) {
                continue;
            }
            worklist.extend(self.progs[idx].functions.iter().copied());
        }
        let mut frozen: Vec<Option<Arc<Program>>> = vec![None; self.progs.len()];
        for idx in (0..self.progs.len()).rev() {
            if !reachable[idx] {
                continue;
            }
            let builder = std::mem::replace(&mut self.progs[idx], ProgBuilder::new(String::new(), ScopeId(0)));
            debug_assert!(
                !builder.code.iter().any(|op| matches!(op, Op::Unresolved(_))),
                "unresolved access survived finalization in {}",
                builder.name
            );
            let functions: Box<[Arc<Program>]> = builder
                .functions
                .iter()
                .map(|&child| frozen[child].clone().expect("children freeze before parents"))
                .collect();
            let program = Program {
                name: builder.name,
                file: self.file.clone(),
                code: builder.code.into_boxed_slice(),
                constants: builder.constants.into_boxed_slice(),
                functions,
                stash_templates: builder
                    .stash_templates
                    .into_iter()
                    .map(Arc::new)
                    .collect(),
                func_stash: builder.func_stash,
                private_envs: builder.private_envs.into_boxed_slice(),
                src_map: builder.src_map.into_boxed_slice(),
                num_args: builder.num_args,
                num_locals: builder.next_local,
                param_copies: builder.param_copies.into_boxed_slice(),
                arguments_at: builder.arguments_at,
                callee_at: builder.callee_at,
                flags: builder.flags,
            };
            frozen[idx] = Some(Arc::new(program));
        }
        frozen[0].take().expect("main program always exists")
    }
}

/// How a private member access resolved.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PrivateResolution {
    /// Fixed (level, index) addressing.
    Static { level: u16, idx: u16 },
    /// Name-keyed runtime table lookup.
    Dynamic,
}

/// The body handed to [`Compiler::compile_function`].
pub(crate) enum FunctionBody<'a> {
    /// An ordinary statement-list body.
    Block(&'a [ast::Statement]),
    /// An expression-bodied arrow.
    Expression(&'a ast::Expression),
}

fn name_is_arguments(arena: &ScopeArena, id: BindingId) -> bool {
    arena.binding(id).name == "arguments"
}

/// Collects `var` names hoisted out of a statement, recursing into nested
/// non-function constructs.
fn collect_hoisted_vars(stmt: &ast::Statement, out: &mut Vec<(String, Pos)>) {
    use ast::Statement::*;
    match stmt {
        VariableDeclaration(decl) => {
            if decl.kind == ast::VariableKind::Var {
                for declarator in &decl.declarations {
                    collect_pattern_names(&declarator.id, out);
                }
            }
        }
        Block(block) => {
            for inner in &block.body {
                collect_hoisted_vars(inner, out);
            }
        }
        If(if_stmt) => {
            collect_hoisted_vars(&if_stmt.consequent, out);
            if let Some(alt) = &if_stmt.alternate {
                collect_hoisted_vars(alt, out);
            }
        }
        While(w) => collect_hoisted_vars(&w.body, out),
        DoWhile(d) => collect_hoisted_vars(&d.body, out),
        For(f) => {
            if let Some(ast::ForInit::Declaration(decl)) = &f.init {
                if decl.kind == ast::VariableKind::Var {
                    for declarator in &decl.declarations {
                        collect_pattern_names(&declarator.id, out);
                    }
                }
            }
            collect_hoisted_vars(&f.body, out);
        }
        ForIn(f) => {
            if let ast::ForTarget::Declaration(ast::VariableKind::Var, pattern) = &f.left {
                collect_pattern_names(pattern, out);
            }
            collect_hoisted_vars(&f.body, out);
        }
        ForOf(f) => {
            if let ast::ForTarget::Declaration(ast::VariableKind::Var, pattern) = &f.left {
                collect_pattern_names(pattern, out);
            }
            collect_hoisted_vars(&f.body, out);
        }
        Switch(s) => {
            for case in &s.cases {
                for inner in &case.consequent {
                    collect_hoisted_vars(inner, out);
                }
            }
        }
        Try(t) => {
            for inner in &t.block.body {
                collect_hoisted_vars(inner, out);
            }
            if let Some(handler) = &t.handler {
                for inner in &handler.body.body {
                    collect_hoisted_vars(inner, out);
                }
            }
            if let Some(finalizer) = &t.finalizer {
                for inner in &finalizer.body {
                    collect_hoisted_vars(inner, out);
                }
            }
        }
        With(w) => collect_hoisted_vars(&w.body, out),
        Labeled(l) => collect_hoisted_vars(&l.body, out),
        _ => {}
    }
}

fn collect_pattern_names(pattern: &ast::Pattern, out: &mut Vec<(String, Pos)>) {
    match pattern {
        ast::Pattern::Identifier(ident) => {
            if !out.iter().any(|(name, _)| name == &ident.name) {
                out.push((ident.name.clone(), ident.pos));
            }
        }
        ast::Pattern::Array(array) => {
            for element in array.elements.iter().flatten() {
                collect_pattern_names(element, out);
            }
        }
        ast::Pattern::Object(object) => {
            for property in &object.properties {
                collect_pattern_names(&property.value, out);
            }
        }
    }
}

//! Statement compilation.

use super::scope::{AccessMode, BindingKind, BlockKind, Resolution, ScopeKind};
use super::{Compiler, ProgId};
use crate::ast;
use crate::compiler::CompileError;
use crate::compiler::bytecode::Op;

impl Compiler {
    /// Compiles one statement. When `keep` is set the statement leaves
    /// exactly one value on the stack (used for the top-level completion
    /// value); otherwise it leaves the stack untouched.
    pub(crate) fn compile_statement(
        &mut self,
        stmt: &ast::Statement,
        keep: bool,
    ) -> Result<(), CompileError> {
        match stmt {
            ast::Statement::Expression(expr_stmt) => {
                self.set_pos(expr_stmt.expression.pos());
                self.compile_expression(&expr_stmt.expression, keep)?;
            }
            ast::Statement::VariableDeclaration(decl) => {
                self.compile_variable_declaration(decl)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::FunctionDeclaration(func) => {
                // Usually bound and initialized up front by the enclosing
                // statement list's hoisting pass. A declaration sitting in a
                // single-statement position (an unbraced if-branch) never
                // went through one, so it binds here instead.
                let already_bound = func
                    .name
                    .as_ref()
                    .is_some_and(|ident| {
                        self.arena.scope(self.scope).names.contains_key(&ident.name)
                    });
                if !already_bound {
                    self.hoist_functions(std::slice::from_ref(stmt))?;
                }
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::ClassDeclaration(decl) => {
                self.set_pos(decl.class.pos);
                // Pre-declared by the enclosing list; a class declaration in
                // a single-statement position has no binding to initialize.
                let binding = self.arena.scope(self.scope).names.get(&decl.id.name).copied();
                match binding {
                    Some(binding) => {
                        self.compile_class(&decl.class, true)?;
                        self.record_access(binding, AccessMode::Init);
                    }
                    None => {
                        return Err(self.error(
                            "class declarations are only allowed inside blocks",
                            decl.class.pos,
                        ));
                    }
                }
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::Block(block) => {
                self.compile_block_statement(block, keep)?;
            }
            ast::Statement::If(if_stmt) => {
                self.compile_if_statement(if_stmt, keep)?;
            }
            ast::Statement::While(while_stmt) => {
                self.compile_while_statement(while_stmt, None)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::DoWhile(do_while) => {
                self.compile_do_while_statement(do_while, None)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::For(for_stmt) => {
                self.compile_for_statement(for_stmt, None)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::ForIn(for_in) => {
                self.compile_for_in_of(
                    &for_in.left,
                    &for_in.right,
                    &for_in.body,
                    for_in.pos,
                    true,
                    None,
                )?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::ForOf(for_of) => {
                self.compile_for_in_of(
                    &for_of.left,
                    &for_of.right,
                    &for_of.body,
                    for_of.pos,
                    false,
                    None,
                )?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::Switch(switch_stmt) => {
                self.compile_switch_statement(switch_stmt, None)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::Return(ret) => {
                if self.in_main_program() {
                    return Err(self.error("return outside of a function", ret.pos));
                }
                self.set_pos(ret.pos);
                if let Some(arg) = &ret.argument {
                    self.compile_expression(arg, true)?;
                } else {
                    self.emit(Op::Undefined);
                }
                self.emit(Op::Return);
            }
            ast::Statement::Break(brk) => {
                let target = self.find_jump_target(brk.label.as_deref(), true, brk.pos)?;
                self.emit_jump_out(target, true)?;
            }
            ast::Statement::Continue(cont) => {
                let target = self.find_jump_target(cont.label.as_deref(), false, cont.pos)?;
                self.emit_jump_out(target, false)?;
            }
            ast::Statement::Throw(throw_stmt) => {
                self.compile_expression(&throw_stmt.argument, true)?;
                self.set_pos(throw_stmt.pos);
                self.emit(Op::Throw);
            }
            ast::Statement::Try(try_stmt) => {
                self.compile_try_statement(try_stmt)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::With(with_stmt) => {
                self.compile_with_statement(with_stmt)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::Labeled(labeled) => {
                self.compile_labeled_statement(labeled)?;
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::Debugger(_) => {
                self.emit(Op::Nop);
                if keep {
                    self.emit(Op::Undefined);
                }
            }
            ast::Statement::Empty => {
                if keep {
                    self.emit(Op::Undefined);
                }
            }
        }
        Ok(())
    }

    fn in_main_program(&self) -> bool {
        self.arena.scope(self.builder().scope).kind == ScopeKind::Global
    }

    /// Compiles `{ ... }` with its own scope, hoisted functions, and
    /// pre-declared lexicals.
    pub(crate) fn compile_block_statement(
        &mut self,
        block: &ast::BlockStatement,
        keep: bool,
    ) -> Result<(), CompileError> {
        let (scope, push_pc) = self.enter_block_scope();
        let result = (|| -> Result<(), CompileError> {
            self.declare_lexicals(&block.body)?;
            self.emit_tdz_resets(scope);
            self.hoist_functions(&block.body)?;
            let len = block.body.len();
            for (i, stmt) in block.body.iter().enumerate() {
                self.compile_statement(stmt, keep && i == len - 1)?;
            }
            if keep && len == 0 {
                self.emit(Op::Undefined);
            }
            Ok(())
        })();
        result?;
        self.leave_block_scope(scope, push_pc)
    }

    fn compile_variable_declaration(
        &mut self,
        decl: &ast::VariableDeclaration,
    ) -> Result<(), CompileError> {
        self.set_pos(decl.pos);
        let is_var = decl.kind == ast::VariableKind::Var;
        for declarator in &decl.declarations {
            match (&declarator.id, &declarator.init) {
                (ast::Pattern::Identifier(ident), Some(init)) => {
                    self.compile_expression(init, true)?;
                    self.compile_declared_init(&ident.name, is_var, ident.pos)?;
                }
                (ast::Pattern::Identifier(ident), None) => {
                    if !is_var {
                        // Uninitialized let leaves the dead zone as
                        // undefined at the declaration site.
                        self.emit(Op::Undefined);
                        self.compile_declared_init(&ident.name, false, ident.pos)?;
                    }
                    // A bare var is already undefined from hoisting.
                }
                (pattern, Some(init)) => {
                    self.compile_expression(init, true)?;
                    self.init_pattern(pattern)?;
                }
                (_, None) => {
                    return Err(
                        self.error("destructuring declaration requires an initializer", decl.pos)
                    );
                }
            }
        }
        Ok(())
    }

    /// Emits the initializing store for a declared name, resolving to the
    /// binding created by hoisting or lexical pre-declaration.
    fn compile_declared_init(
        &mut self,
        name: &str,
        is_var: bool,
        pos: ast::Pos,
    ) -> Result<(), CompileError> {
        match self.arena.resolve(self.scope, name) {
            Resolution::Static(binding) => {
                self.record_access(binding, AccessMode::Init);
                Ok(())
            }
            Resolution::Dynamic(found) => {
                // A var initializer inside a `with` body assigns through
                // the dynamic chain, which may hit the with object.
                debug_assert!(is_var, "lexicals are declared inside the with body's own scope");
                if let Some(binding) = found {
                    self.force_stash(binding);
                }
                let idx = self.str_idx(name);
                self.emit(Op::StoreDynamic(idx));
                Ok(())
            }
            Resolution::Unresolved => {
                Err(self.error(format!("declaration of '{name}' was not hoisted"), pos))
            }
        }
    }

    fn compile_if_statement(
        &mut self,
        if_stmt: &ast::IfStatement,
        keep: bool,
    ) -> Result<(), CompileError> {
        self.set_pos(if_stmt.pos);

        // Statically decided branches still compile, for error detection,
        // but into a discarded buffer so dead code cannot shift addresses.
        if let Some(truthy) = Self::static_truthiness(&if_stmt.test) {
            if truthy {
                self.compile_statement(&if_stmt.consequent, keep)?;
                if let Some(alternate) = &if_stmt.alternate {
                    self.compile_dead_statement(alternate)?;
                }
            } else {
                self.compile_dead_statement(&if_stmt.consequent)?;
                if let Some(alternate) = &if_stmt.alternate {
                    self.compile_statement(alternate, keep)?;
                } else if keep {
                    self.emit(Op::Undefined);
                }
            }
            return Ok(());
        }

        self.compile_expression(&if_stmt.test, true)?;
        let jump_to_else = self.emit(Op::JumpIfFalse(0));
        self.compile_statement(&if_stmt.consequent, keep)?;

        if let Some(alternate) = &if_stmt.alternate {
            let jump_to_end = self.emit(Op::Jump(0));
            self.patch_jump(jump_to_else);
            self.compile_statement(alternate, keep)?;
            self.patch_jump(jump_to_end);
        } else if keep {
            let jump_to_end = self.emit(Op::Jump(0));
            self.patch_jump(jump_to_else);
            self.emit(Op::Undefined);
            self.patch_jump(jump_to_end);
        } else {
            self.patch_jump(jump_to_else);
        }
        Ok(())
    }

    pub(crate) fn compile_while_statement(
        &mut self,
        while_stmt: &ast::WhileStatement,
        label: Option<String>,
    ) -> Result<(), CompileError> {
        self.set_pos(while_stmt.pos);

        if Self::static_truthiness(&while_stmt.test) == Some(false) {
            // The loop never runs, but its body still compiles (and may
            // legally break/continue against this loop) into a discarded
            // buffer.
            self.push_block(BlockKind::Loop, label, false, self.scope);
            let result = self.compile_dead_statement(&while_stmt.body);
            self.pop_block();
            return result;
        }

        self.push_block(BlockKind::Loop, label, false, self.scope);
        let loop_start = self.here();
        let exit = if Self::static_truthiness(&while_stmt.test) == Some(true) {
            None
        } else {
            self.compile_expression(&while_stmt.test, true)?;
            Some(self.emit(Op::JumpIfFalse(0)))
        };
        self.compile_statement(&while_stmt.body, false)?;
        let back = self.emit(Op::Jump(0));
        self.patch_jump_to(back, loop_start);
        if let Some(exit) = exit {
            self.patch_jump(exit);
        }
        let block = self.pop_block();
        self.patch_jump_outs(block.continues, block.scope, loop_start);
        let end = self.here();
        self.patch_jump_outs(block.breaks, block.scope, end);
        Ok(())
    }

    pub(crate) fn compile_do_while_statement(
        &mut self,
        do_while: &ast::DoWhileStatement,
        label: Option<String>,
    ) -> Result<(), CompileError> {
        self.set_pos(do_while.pos);
        self.push_block(BlockKind::Loop, label, false, self.scope);
        let loop_start = self.here();
        self.compile_statement(&do_while.body, false)?;
        let test_start = self.here();
        self.compile_expression(&do_while.test, true)?;
        let back = self.emit(Op::JumpIfTrue(0));
        self.patch_jump_to(back, loop_start);
        let block = self.pop_block();
        self.patch_jump_outs(block.continues, block.scope, test_start);
        let end = self.here();
        self.patch_jump_outs(block.breaks, block.scope, end);
        Ok(())
    }

    pub(crate) fn compile_for_statement(
        &mut self,
        for_stmt: &ast::ForStatement,
        label: Option<String>,
    ) -> Result<(), CompileError> {
        self.set_pos(for_stmt.pos);

        // A lexical init gets its own scope wrapping the whole loop.
        let boundary = self.scope;
        let lexical_init = matches!(
            &for_stmt.init,
            Some(ast::ForInit::Declaration(decl)) if decl.kind != ast::VariableKind::Var
        );
        let scope_guard = if lexical_init { Some(self.enter_block_scope()) } else { None };

        match &for_stmt.init {
            Some(ast::ForInit::Declaration(decl)) => {
                if lexical_init {
                    let kind = if decl.kind == ast::VariableKind::Const {
                        BindingKind::Const
                    } else {
                        BindingKind::Let
                    };
                    for declarator in &decl.declarations {
                        self.declare_pattern(&declarator.id, kind)?;
                    }
                }
                self.compile_variable_declaration(decl)?;
            }
            Some(ast::ForInit::Expression(expr)) => {
                self.compile_expression(expr, false)?;
            }
            None => {}
        }

        self.push_block(BlockKind::Loop, label, false, boundary);
        let loop_start = self.here();
        let exit = match &for_stmt.test {
            Some(test) if Self::static_truthiness(test) != Some(true) => {
                self.compile_expression(test, true)?;
                Some(self.emit(Op::JumpIfFalse(0)))
            }
            _ => None,
        };
        self.compile_statement(&for_stmt.body, false)?;
        let update_start = self.here();
        if let Some(update) = &for_stmt.update {
            self.compile_expression(update, false)?;
        }
        let back = self.emit(Op::Jump(0));
        self.patch_jump_to(back, loop_start);
        if let Some(exit) = exit {
            self.patch_jump(exit);
        }
        let block = self.pop_block();
        // A continue stays inside the loop's own scope, so its stash pops
        // stop there; only breaks unwind past it.
        let continue_boundary = scope_guard.as_ref().map_or(block.scope, |(scope, _)| *scope);
        self.patch_jump_outs(block.continues, continue_boundary, update_start);
        if let Some((scope, push_pc)) = scope_guard {
            self.leave_block_scope(scope, push_pc)?;
        }
        let end = self.here();
        self.patch_jump_outs(block.breaks, block.scope, end);
        Ok(())
    }

    /// Shared lowering for for-in (key enumeration) and for-of (iterator
    /// protocol). The opened iterator lives on the VM's iterator stack and
    /// is closed on every exit path.
    pub(crate) fn compile_for_in_of(
        &mut self,
        left: &ast::ForTarget,
        right: &ast::Expression,
        body: &ast::Statement,
        pos: ast::Pos,
        keyed: bool,
        label: Option<String>,
    ) -> Result<(), CompileError> {
        self.set_pos(pos);
        self.compile_expression(right, true)?;
        self.emit(if keyed { Op::IterIn } else { Op::IterOf });

        let boundary = self.scope;
        let lexical = matches!(
            left,
            ast::ForTarget::Declaration(kind, _) if *kind != ast::VariableKind::Var
        );
        let scope_guard = if lexical {
            let guard = self.enter_block_scope();
            if let ast::ForTarget::Declaration(kind, pattern) = left {
                let kind = if *kind == ast::VariableKind::Const {
                    BindingKind::Const
                } else {
                    BindingKind::Let
                };
                self.declare_pattern(pattern, kind)?;
            }
            Some(guard)
        } else {
            None
        };

        self.push_block(BlockKind::Loop, label, true, boundary);
        let loop_start = self.here();
        let next = self.emit(Op::IterNext(0));

        // The produced value is on the stack; bind or assign it.
        match left {
            ast::ForTarget::Declaration(_, pattern) => self.init_pattern(pattern)?,
            ast::ForTarget::Assignment(target) => self.store_into_target(target)?,
        }

        self.compile_statement(body, false)?;
        let back = self.emit(Op::Jump(0));
        self.patch_jump_to(back, loop_start);
        self.patch_jump(next);

        let block = self.pop_block();
        let continue_boundary = scope_guard.as_ref().map_or(block.scope, |(scope, _)| *scope);
        self.patch_jump_outs(block.continues, continue_boundary, loop_start);
        if let Some((scope, push_pc)) = scope_guard {
            self.leave_block_scope(scope, push_pc)?;
        }
        self.emit(Op::IterClose);
        let end = self.here();
        self.patch_jump_outs(block.breaks, block.scope, end);
        Ok(())
    }

    pub(crate) fn compile_switch_statement(
        &mut self,
        switch_stmt: &ast::SwitchStatement,
        label: Option<String>,
    ) -> Result<(), CompileError> {
        self.set_pos(switch_stmt.pos);
        self.compile_expression(&switch_stmt.discriminant, true)?;

        // The discriminant lives in a hidden frame slot so that branches out
        // of the switch never leave residue on the operand stack.
        let slot = {
            let builder = self.builder_mut();
            let slot = builder.next_local;
            builder.next_local += 1;
            slot as i32
        };
        self.emit(Op::InitStack(slot));

        let boundary = self.scope;
        let (scope, push_pc) = self.enter_block_scope();
        let result = (|| -> Result<(), CompileError> {
            for case in &switch_stmt.cases {
                self.declare_lexicals(&case.consequent)?;
            }
            self.emit_tdz_resets(scope);
            for case in &switch_stmt.cases {
                self.hoist_functions(&case.consequent)?;
            }

            self.push_block(BlockKind::Switch, label, false, boundary);

            let mut case_jumps = Vec::new();
            let mut default_case = None;
            for (i, case) in switch_stmt.cases.iter().enumerate() {
                if let Some(test) = &case.test {
                    self.emit(Op::LoadStack(slot));
                    self.compile_expression(test, true)?;
                    self.emit(Op::StrictEq);
                    case_jumps.push((i, self.emit(Op::JumpIfTrue(0))));
                } else {
                    default_case = Some(i);
                }
            }
            let no_match = self.emit(Op::Jump(0));

            let mut case_starts = Vec::with_capacity(switch_stmt.cases.len());
            for case in &switch_stmt.cases {
                case_starts.push(self.here());
                for stmt in &case.consequent {
                    self.compile_statement(stmt, false)?;
                }
            }

            for (case_idx, jump) in case_jumps {
                self.patch_jump_to(jump, case_starts[case_idx]);
            }
            match default_case {
                Some(idx) => self.patch_jump_to(no_match, case_starts[idx]),
                None => self.patch_jump(no_match),
            }
            Ok(())
        })();
        result?;

        let block = self.pop_block();
        self.leave_block_scope(scope, push_pc)?;
        let end = self.here();
        self.patch_jump_outs(block.breaks, block.scope, end);
        debug_assert!(block.continues.is_empty(), "switch blocks are not continue targets");
        Ok(())
    }

    fn compile_try_statement(&mut self, try_stmt: &ast::TryStatement) -> Result<(), CompileError> {
        if try_stmt.handler.is_none() && try_stmt.finalizer.is_none() {
            return Err(self.error("try statement requires a catch or finally clause", try_stmt.pos));
        }
        self.set_pos(try_stmt.pos);
        self.push_block(BlockKind::Try, None, false, self.scope);
        let try_pc = self.emit(Op::Try { catch: 0, finally: 0 });

        self.compile_block_statement(&try_stmt.block, false)?;
        let end_body = self.emit(Op::EndTry(0));

        let mut end_catch = None;
        if let Some(handler) = &try_stmt.handler {
            let catch_off = self.here() as i32 - try_pc as i32;
            self.set_try_offsets(try_pc, Some(catch_off), None);

            // The thrown value is on the stack; bind it in a fresh block
            // scope supporting plain identifiers and destructuring.
            let (scope, push_pc) = self.enter_block_scope();
            let result = (|| -> Result<(), CompileError> {
                self.declare_lexicals(&handler.body.body)?;
                if let Some(pattern) = &handler.param {
                    self.declare_pattern(pattern, BindingKind::Let)?;
                }
                self.emit_tdz_resets(scope);
                match &handler.param {
                    Some(pattern) => self.init_pattern(pattern)?,
                    None => {
                        self.emit(Op::Pop);
                    }
                }
                self.hoist_functions(&handler.body.body)?;
                for stmt in &handler.body.body {
                    self.compile_statement(stmt, false)?;
                }
                Ok(())
            })();
            result?;
            self.leave_block_scope(scope, push_pc)?;
            end_catch = Some(self.emit(Op::EndTry(0)));
        }

        if let Some(finalizer) = &try_stmt.finalizer {
            let finally_off = self.here() as i32 - try_pc as i32;
            self.set_try_offsets(try_pc, None, Some(finally_off));

            // The runtime record is already popped once the finally starts;
            // branches out of the finally body discard its pending
            // completion instead of unwinding it again.
            if let Some(block) = self.builder_mut().blocks.last_mut() {
                block.kind = BlockKind::Finally;
            }
            self.compile_block_statement(finalizer, false)?;
            self.emit(Op::EndFinally);
        }

        self.pop_block();
        self.patch_jump(end_body);
        if let Some(end_catch) = end_catch {
            self.patch_jump(end_catch);
        }
        Ok(())
    }

    fn set_try_offsets(&mut self, try_pc: u32, catch: Option<i32>, finally: Option<i32>) {
        match &mut self.builder_mut().code[try_pc as usize] {
            Op::Try { catch: c, finally: f } => {
                if let Some(catch) = catch {
                    *c = catch;
                }
                if let Some(finally) = finally {
                    *f = finally;
                }
            }
            other => unreachable!("try patch hit {other:?}"),
        }
    }

    fn compile_with_statement(&mut self, with_stmt: &ast::WithStatement) -> Result<(), CompileError> {
        if self.arena.scope(self.scope).strict {
            return Err(self.error("with statements are not allowed in strict code", with_stmt.pos));
        }
        self.set_pos(with_stmt.pos);
        self.compile_expression(&with_stmt.object, true)?;
        self.emit(Op::PushWith);

        let with_scope =
            self.arena
                .push_scope(Some(self.scope), ScopeKind::With, ProgId(self.cur_prog()));
        let saved = self.scope;
        self.scope = with_scope;
        let result = self.compile_statement(&with_stmt.body, false);
        self.scope = saved;
        result?;

        self.emit(Op::PopStash);
        self.finalize_scope(with_scope, None, None)?;
        Ok(())
    }

    fn compile_labeled_statement(&mut self, labeled: &ast::LabeledStatement) -> Result<(), CompileError> {
        let label = Some(labeled.label.clone());
        match labeled.body.as_ref() {
            ast::Statement::While(w) => self.compile_while_statement(w, label),
            ast::Statement::DoWhile(d) => self.compile_do_while_statement(d, label),
            ast::Statement::For(f) => self.compile_for_statement(f, label),
            ast::Statement::ForIn(f) => {
                self.compile_for_in_of(&f.left, &f.right, &f.body, f.pos, true, label)
            }
            ast::Statement::ForOf(f) => {
                self.compile_for_in_of(&f.left, &f.right, &f.body, f.pos, false, label)
            }
            ast::Statement::Switch(s) => self.compile_switch_statement(s, label),
            body => {
                self.push_block(BlockKind::Label, label, false, self.scope);
                self.compile_statement(body, false)?;
                let block = self.pop_block();
                let end = self.here();
                self.patch_jump_outs(block.breaks, block.scope, end);
                debug_assert!(block.continues.is_empty(), "labels on plain statements only break");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Binding patterns
    // ========================================================================

    /// Declares every name bound by a pattern.
    pub(crate) fn declare_pattern(
        &mut self,
        pattern: &ast::Pattern,
        kind: BindingKind,
    ) -> Result<(), CompileError> {
        match pattern {
            ast::Pattern::Identifier(ident) => {
                let scope = if kind == BindingKind::Var {
                    self.arena.variable_scope(self.scope)
                } else {
                    self.scope
                };
                self.arena.declare(scope, &ident.name, kind, ident.pos)?;
                Ok(())
            }
            ast::Pattern::Array(array) => {
                for element in array.elements.iter().flatten() {
                    self.declare_pattern(element, kind)?;
                }
                Ok(())
            }
            ast::Pattern::Object(object) => {
                for property in &object.properties {
                    self.declare_pattern(&property.value, kind)?;
                }
                Ok(())
            }
        }
    }

    /// Consumes the stack top, initializing the pattern's declared bindings.
    /// Elements are read left to right.
    pub(crate) fn init_pattern(&mut self, pattern: &ast::Pattern) -> Result<(), CompileError> {
        self.bind_pattern(pattern, true)
    }

    /// Consumes the stack top, assigning into existing targets.
    pub(crate) fn store_pattern(&mut self, pattern: &ast::Pattern) -> Result<(), CompileError> {
        self.bind_pattern(pattern, false)
    }

    fn bind_pattern(&mut self, pattern: &ast::Pattern, init: bool) -> Result<(), CompileError> {
        match pattern {
            ast::Pattern::Identifier(ident) => {
                if init {
                    match self.arena.resolve(self.scope, &ident.name) {
                        Resolution::Static(binding) => {
                            self.record_access(binding, AccessMode::Init);
                        }
                        _ => {
                            return Err(self.error(
                                format!("pattern binding '{}' is not declared", ident.name),
                                ident.pos,
                            ));
                        }
                    }
                } else {
                    self.compile_ident_store(&ident.name);
                }
                Ok(())
            }
            ast::Pattern::Array(array) => {
                for (i, element) in array.elements.iter().enumerate() {
                    if let Some(element) = element {
                        self.emit(Op::Dup);
                        let idx = self.const_idx(crate::runtime::value::Value::Number(i as f64));
                        self.emit(Op::Const(idx));
                        self.emit(Op::GetElem);
                        self.bind_pattern(element, init)?;
                    }
                }
                self.emit(Op::Pop);
                Ok(())
            }
            ast::Pattern::Object(object) => {
                for property in &object.properties {
                    self.emit(Op::Dup);
                    let idx = self.str_idx(&property.key);
                    self.emit(Op::GetProp(idx));
                    self.bind_pattern(&property.value, init)?;
                }
                self.emit(Op::Pop);
                Ok(())
            }
        }
    }
}

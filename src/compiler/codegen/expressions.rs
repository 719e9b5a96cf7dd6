//! Expression compilation.
//!
//! Every expression is lowered so that sub-expressions evaluate in source
//! left-to-right order. The `needed` flag threads through each form: when it
//! is clear, the expression still evaluates for its effects (including TDZ
//! and reference faults) but avoids leaving a value behind.

use rustc_hash::FxHashMap;

use super::scope::Resolution;
use super::{Compiler, FunctionBody, PrivateResolution};
use crate::ast;
use crate::compiler::CompileError;
use crate::compiler::bytecode::{Op, ProgramFlags};
use crate::runtime::value::Value;

impl Compiler {
    pub(crate) fn compile_expression(
        &mut self,
        expr: &ast::Expression,
        needed: bool,
    ) -> Result<(), CompileError> {
        match expr {
            ast::Expression::Literal(lit) => {
                if needed {
                    self.compile_literal(lit);
                }
            }
            ast::Expression::Identifier(ident) => {
                // Loads always execute: a dead-zone read must fault even
                // when the value is unused.
                self.compile_ident_load(&ident.name, false);
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::This(_) => {
                if needed {
                    self.emit(Op::This);
                }
            }
            ast::Expression::NewTarget(_) => {
                if needed {
                    self.emit(Op::NewTarget);
                }
            }
            ast::Expression::Array(array) => {
                for element in &array.elements {
                    match element {
                        Some(expr) => self.compile_expression(expr, true)?,
                        None => {
                            self.emit(Op::Undefined);
                        }
                    }
                }
                self.emit(Op::NewArray(array.elements.len() as u16));
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::Object(object) => {
                self.compile_object_literal(object)?;
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::Function(func) => {
                let fn_idx = self.compile_function(
                    func.name.as_ref().map(|i| i.name.as_str()),
                    &func.params,
                    FunctionBody::Block(&func.body),
                    func.strict,
                    ProgramFlags::default(),
                    None,
                    func.name.is_some(),
                    func.pos,
                )?;
                self.emit(Op::MakeClosure(fn_idx));
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::Arrow(arrow) => {
                let body = match &arrow.body {
                    ast::ArrowBody::Block(stmts) => FunctionBody::Block(stmts),
                    ast::ArrowBody::Expression(expr) => FunctionBody::Expression(expr),
                };
                let flags = ProgramFlags { arrow: true, no_construct: true, ..Default::default() };
                let fn_idx = self.compile_function(
                    None,
                    &arrow.params,
                    body,
                    arrow.strict,
                    flags,
                    None,
                    false,
                    arrow.pos,
                )?;
                self.emit(Op::MakeClosure(fn_idx));
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::Class(class) => {
                self.compile_class(class, needed)?;
            }
            ast::Expression::Unary(unary) => {
                self.compile_unary(unary, needed)?;
            }
            ast::Expression::Update(update) => {
                self.compile_update(update, needed)?;
            }
            ast::Expression::Binary(binary) => {
                self.compile_expression(&binary.left, true)?;
                self.compile_expression(&binary.right, true)?;
                self.set_pos(binary.pos);
                self.emit(binary_op(binary.operator));
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::Logical(logical) => {
                self.compile_logical(logical)?;
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::Assignment(assign) => {
                self.compile_assignment(assign, needed)?;
            }
            ast::Expression::Conditional(cond) => {
                self.compile_conditional(cond, needed)?;
            }
            ast::Expression::Call(_)
            | ast::Expression::Member(_)
            | ast::Expression::PrivateMember(_) => {
                self.compile_chain_root(expr, needed)?;
            }
            ast::Expression::New(new_expr) => {
                self.compile_expression(&new_expr.callee, true)?;
                for arg in &new_expr.arguments {
                    self.compile_expression(arg, true)?;
                }
                self.set_pos(new_expr.pos);
                self.emit(Op::New(new_expr.arguments.len() as u16));
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::PrivateIn(private_in) => {
                self.compile_expression(&private_in.object, true)?;
                match self.resolve_private(&private_in.name, private_in.pos)? {
                    PrivateResolution::Static { level, idx } => {
                        self.emit(Op::PrivateIn { level, idx });
                    }
                    PrivateResolution::Dynamic => {
                        return Err(self.error(
                            "private brand checks are not available inside with statements",
                            private_in.pos,
                        ));
                    }
                }
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::Expression::Sequence(seq) => {
                let len = seq.expressions.len();
                for (i, expr) in seq.expressions.iter().enumerate() {
                    self.compile_expression(expr, needed && i == len - 1)?;
                }
            }
        }
        Ok(())
    }

    fn compile_literal(&mut self, lit: &ast::Literal) {
        match &lit.value {
            ast::LiteralValue::Number(n) => {
                let idx = self.const_idx(Value::Number(*n));
                self.emit(Op::Const(idx));
            }
            ast::LiteralValue::String(s) => {
                let idx = self.str_idx(s);
                self.emit(Op::Const(idx));
            }
            ast::LiteralValue::Boolean(true) => {
                self.emit(Op::True);
            }
            ast::LiteralValue::Boolean(false) => {
                self.emit(Op::False);
            }
            ast::LiteralValue::Null => {
                self.emit(Op::Null);
            }
            ast::LiteralValue::Undefined => {
                self.emit(Op::Undefined);
            }
            ast::LiteralValue::BigInt(b) => {
                let idx = self.const_idx(Value::bigint(b.clone()));
                self.emit(Op::Const(idx));
            }
        }
    }

    fn compile_object_literal(&mut self, object: &ast::ObjectExpression) -> Result<(), CompileError> {
        self.emit(Op::NewObject);
        for property in &object.properties {
            self.emit(Op::Dup);
            match &property.key {
                ast::PropertyKey::Literal(name) => {
                    self.compile_expression(&property.value, true)?;
                    let idx = self.str_idx(name);
                    self.emit(Op::SetProp(idx));
                }
                ast::PropertyKey::Computed(key) => {
                    self.compile_expression(key, true)?;
                    self.compile_expression(&property.value, true)?;
                    self.emit(Op::SetElem);
                }
            }
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn compile_unary(&mut self, unary: &ast::UnaryExpression, needed: bool) -> Result<(), CompileError> {
        match unary.operator {
            ast::UnaryOperator::Typeof => {
                if let ast::Expression::Identifier(ident) = unary.argument.as_ref() {
                    // typeof never throws on unresolvable names.
                    self.compile_ident_load(&ident.name, true);
                } else {
                    self.compile_expression(&unary.argument, true)?;
                }
                self.emit(Op::TypeOf);
            }
            ast::UnaryOperator::Void => {
                self.compile_expression(&unary.argument, false)?;
                self.emit(Op::Undefined);
            }
            ast::UnaryOperator::Delete => {
                self.compile_delete(unary)?;
            }
            ast::UnaryOperator::Minus => {
                self.compile_expression(&unary.argument, true)?;
                self.emit(Op::Neg);
            }
            ast::UnaryOperator::Plus => {
                self.compile_expression(&unary.argument, true)?;
                self.emit(Op::ToNum);
            }
            ast::UnaryOperator::LogicalNot => {
                self.compile_expression(&unary.argument, true)?;
                self.emit(Op::Not);
            }
            ast::UnaryOperator::BitwiseNot => {
                self.compile_expression(&unary.argument, true)?;
                self.emit(Op::BitNot);
            }
        }
        if !needed {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn compile_delete(&mut self, unary: &ast::UnaryExpression) -> Result<(), CompileError> {
        match unary.argument.as_ref() {
            ast::Expression::Member(member) => {
                self.compile_expression(&member.object, true)?;
                match &member.property {
                    ast::MemberProperty::Identifier(name) => {
                        let idx = self.str_idx(name);
                        self.emit(Op::DeleteProp(idx));
                    }
                    ast::MemberProperty::Computed(key) => {
                        self.compile_expression(key, true)?;
                        self.emit(Op::DeleteElem);
                    }
                }
            }
            ast::Expression::Identifier(ident) => {
                if self.arena.scope(self.scope).strict {
                    return Err(self.error(
                        "delete of an unqualified name is not allowed in strict code",
                        unary.pos,
                    ));
                }
                match self.arena.resolve(self.scope, &ident.name) {
                    Resolution::Unresolved => {
                        let idx = self.str_idx(&ident.name);
                        self.emit(Op::DeleteGlobal(idx));
                    }
                    _ => {
                        // Declared bindings are not deletable.
                        self.emit(Op::False);
                    }
                }
            }
            other => {
                self.compile_expression(other, false)?;
                self.emit(Op::True);
            }
        }
        Ok(())
    }

    fn compile_update(&mut self, update: &ast::UpdateExpression, needed: bool) -> Result<(), CompileError> {
        let one = |compiler: &mut Compiler| {
            let idx = compiler.const_idx(Value::Number(1.0));
            compiler.emit(Op::Const(idx));
        };
        let step = match update.operator {
            ast::UpdateOperator::Increment => Op::Add,
            ast::UpdateOperator::Decrement => Op::Sub,
        };
        let postfix_value = !update.prefix && needed;
        match update.argument.as_ref() {
            ast::AssignmentTarget::Identifier(ident) => {
                self.compile_ident_load(&ident.name, false);
                self.emit(Op::ToNum);
                if postfix_value {
                    self.emit(Op::Dup);
                    one(self);
                    self.emit(step);
                    self.compile_ident_store(&ident.name);
                } else {
                    one(self);
                    self.emit(step);
                    if needed {
                        self.emit(Op::Dup);
                    }
                    self.compile_ident_store(&ident.name);
                }
            }
            ast::AssignmentTarget::Member(member) => match &member.property {
                ast::MemberProperty::Identifier(name) => {
                    let idx = self.str_idx(name);
                    if postfix_value {
                        let temp = self.alloc_temp();
                        self.compile_expression(&member.object, true)?;
                        self.emit(Op::InitStack(temp));
                        self.emit(Op::LoadStack(temp));
                        self.emit(Op::GetProp(idx));
                        self.emit(Op::ToNum);
                        self.emit(Op::Dup);
                        one(self);
                        self.emit(step);
                        self.emit(Op::LoadStack(temp));
                        self.emit(Op::Swap);
                        self.emit(Op::SetProp(idx));
                        self.emit(Op::Pop);
                    } else {
                        self.compile_expression(&member.object, true)?;
                        self.emit(Op::Dup);
                        self.emit(Op::GetProp(idx));
                        self.emit(Op::ToNum);
                        one(self);
                        self.emit(step);
                        self.emit(Op::SetProp(idx));
                        if !needed {
                            self.emit(Op::Pop);
                        }
                    }
                }
                ast::MemberProperty::Computed(key) => {
                    if postfix_value {
                        let temp_obj = self.alloc_temp();
                        let temp_key = self.alloc_temp();
                        self.compile_expression(&member.object, true)?;
                        self.emit(Op::InitStack(temp_obj));
                        self.compile_expression(key, true)?;
                        self.emit(Op::InitStack(temp_key));
                        self.emit(Op::LoadStack(temp_obj));
                        self.emit(Op::LoadStack(temp_key));
                        self.emit(Op::GetElem);
                        self.emit(Op::ToNum);
                        self.emit(Op::Dup);
                        one(self);
                        self.emit(step);
                        self.emit(Op::LoadStack(temp_obj));
                        self.emit(Op::Swap);
                        self.emit(Op::LoadStack(temp_key));
                        self.emit(Op::Swap);
                        self.emit(Op::SetElem);
                        self.emit(Op::Pop);
                    } else {
                        self.compile_expression(&member.object, true)?;
                        self.compile_expression(key, true)?;
                        self.emit(Op::Dup2);
                        self.emit(Op::GetElem);
                        self.emit(Op::ToNum);
                        one(self);
                        self.emit(step);
                        self.emit(Op::SetElem);
                        if !needed {
                            self.emit(Op::Pop);
                        }
                    }
                }
            },
            ast::AssignmentTarget::PrivateMember(private) => {
                let (level, idx) = self.static_private(&private.name, private.pos)?;
                if postfix_value {
                    let temp = self.alloc_temp();
                    self.compile_expression(&private.object, true)?;
                    self.emit(Op::InitStack(temp));
                    self.emit(Op::LoadStack(temp));
                    self.emit(Op::GetPrivate { level, idx });
                    self.emit(Op::ToNum);
                    self.emit(Op::Dup);
                    one(self);
                    self.emit(step);
                    self.emit(Op::LoadStack(temp));
                    self.emit(Op::Swap);
                    self.emit(Op::SetPrivate { level, idx });
                    self.emit(Op::Pop);
                } else {
                    self.compile_expression(&private.object, true)?;
                    self.emit(Op::Dup);
                    self.emit(Op::GetPrivate { level, idx });
                    self.emit(Op::ToNum);
                    one(self);
                    self.emit(step);
                    self.emit(Op::SetPrivate { level, idx });
                    if !needed {
                        self.emit(Op::Pop);
                    }
                }
            }
            ast::AssignmentTarget::Pattern(_) => {
                return Err(self.error("invalid increment/decrement target", update.pos));
            }
        }
        Ok(())
    }

    fn compile_logical(&mut self, logical: &ast::LogicalExpression) -> Result<(), CompileError> {
        self.compile_expression(&logical.left, true)?;
        self.emit(Op::Dup);
        let short = match logical.operator {
            ast::LogicalOperator::And => self.emit(Op::JumpIfFalse(0)),
            ast::LogicalOperator::Or => self.emit(Op::JumpIfTrue(0)),
            ast::LogicalOperator::Nullish => self.emit(Op::JumpIfNotNullish(0)),
        };
        self.emit(Op::Pop);
        self.compile_expression(&logical.right, true)?;
        self.patch_jump(short);
        Ok(())
    }

    fn compile_assignment(
        &mut self,
        assign: &ast::AssignmentExpression,
        needed: bool,
    ) -> Result<(), CompileError> {
        if assign.operator == ast::AssignmentOperator::Assign {
            match assign.target.as_ref() {
                ast::AssignmentTarget::Identifier(ident) => {
                    self.compile_expression(&assign.value, true)?;
                    if needed {
                        self.emit(Op::Dup);
                    }
                    self.compile_ident_store(&ident.name);
                }
                ast::AssignmentTarget::Member(member) => {
                    self.compile_expression(&member.object, true)?;
                    match &member.property {
                        ast::MemberProperty::Identifier(name) => {
                            let idx = self.str_idx(name);
                            self.compile_expression(&assign.value, true)?;
                            self.emit(Op::SetProp(idx));
                        }
                        ast::MemberProperty::Computed(key) => {
                            self.compile_expression(key, true)?;
                            self.compile_expression(&assign.value, true)?;
                            self.emit(Op::SetElem);
                        }
                    }
                    if !needed {
                        self.emit(Op::Pop);
                    }
                }
                ast::AssignmentTarget::PrivateMember(private) => {
                    let resolution = self.resolve_private(&private.name, private.pos)?;
                    self.compile_expression(&private.object, true)?;
                    self.compile_expression(&assign.value, true)?;
                    match resolution {
                        PrivateResolution::Static { level, idx } => {
                            self.emit(Op::SetPrivate { level, idx });
                        }
                        PrivateResolution::Dynamic => {
                            let name_idx = self.str_idx(&private.name);
                            self.emit(Op::SetPrivateDyn(name_idx));
                        }
                    }
                    if !needed {
                        self.emit(Op::Pop);
                    }
                }
                ast::AssignmentTarget::Pattern(pattern) => {
                    self.compile_expression(&assign.value, true)?;
                    if needed {
                        self.emit(Op::Dup);
                    }
                    self.store_pattern(pattern)?;
                }
            }
            return Ok(());
        }

        // Compound assignment reads through the same reference it writes.
        let op = compound_op(assign.operator);
        match assign.target.as_ref() {
            ast::AssignmentTarget::Identifier(ident) => {
                self.compile_ident_load(&ident.name, false);
                self.compile_expression(&assign.value, true)?;
                self.emit(op);
                if needed {
                    self.emit(Op::Dup);
                }
                self.compile_ident_store(&ident.name);
            }
            ast::AssignmentTarget::Member(member) => match &member.property {
                ast::MemberProperty::Identifier(name) => {
                    let idx = self.str_idx(name);
                    self.compile_expression(&member.object, true)?;
                    self.emit(Op::Dup);
                    self.emit(Op::GetProp(idx));
                    self.compile_expression(&assign.value, true)?;
                    self.emit(op);
                    self.emit(Op::SetProp(idx));
                    if !needed {
                        self.emit(Op::Pop);
                    }
                }
                ast::MemberProperty::Computed(key) => {
                    self.compile_expression(&member.object, true)?;
                    self.compile_expression(key, true)?;
                    self.emit(Op::Dup2);
                    self.emit(Op::GetElem);
                    self.compile_expression(&assign.value, true)?;
                    self.emit(op);
                    self.emit(Op::SetElem);
                    if !needed {
                        self.emit(Op::Pop);
                    }
                }
            },
            ast::AssignmentTarget::PrivateMember(private) => {
                let (level, idx) = self.static_private(&private.name, private.pos)?;
                self.compile_expression(&private.object, true)?;
                self.emit(Op::Dup);
                self.emit(Op::GetPrivate { level, idx });
                self.compile_expression(&assign.value, true)?;
                self.emit(op);
                self.emit(Op::SetPrivate { level, idx });
                if !needed {
                    self.emit(Op::Pop);
                }
            }
            ast::AssignmentTarget::Pattern(_) => {
                return Err(self.error("invalid compound assignment target", assign.pos));
            }
        }
        Ok(())
    }

    fn compile_conditional(
        &mut self,
        cond: &ast::ConditionalExpression,
        needed: bool,
    ) -> Result<(), CompileError> {
        if let Some(truthy) = Self::static_truthiness(&cond.test) {
            if truthy {
                self.compile_expression(&cond.consequent, needed)?;
                self.compile_dead_expression(&cond.alternate)?;
            } else {
                self.compile_dead_expression(&cond.consequent)?;
                self.compile_expression(&cond.alternate, needed)?;
            }
            return Ok(());
        }
        self.compile_expression(&cond.test, true)?;
        let to_alternate = self.emit(Op::JumpIfFalse(0));
        self.compile_expression(&cond.consequent, needed)?;
        let to_end = self.emit(Op::Jump(0));
        self.patch_jump(to_alternate);
        self.compile_expression(&cond.alternate, needed)?;
        self.patch_jump(to_end);
        Ok(())
    }

    // ========================================================================
    // Member/call chains (including optional chaining)
    // ========================================================================

    /// Compiles the root of a member/call chain. Optional links register
    /// short-circuit jumps that land on a shared cleanup pad, so a nullish
    /// base anywhere in the chain produces `undefined` for the whole chain
    /// without evaluating the rest.
    fn compile_chain_root(
        &mut self,
        expr: &ast::Expression,
        needed: bool,
    ) -> Result<(), CompileError> {
        let mut jumps = ChainJumps::default();
        self.compile_chain(expr, &mut jumps)?;
        if !jumps.one.is_empty() || !jumps.two.is_empty() {
            let done = self.emit(Op::Jump(0));
            // Pads: jumps with two leftover values fall through an extra pop.
            let two_jumps = std::mem::take(&mut jumps.two);
            let one_jumps = std::mem::take(&mut jumps.one);
            if !two_jumps.is_empty() {
                for pc in two_jumps {
                    self.patch_jump(pc);
                }
                self.emit(Op::Pop);
            }
            for pc in one_jumps {
                self.patch_jump(pc);
            }
            self.emit(Op::Pop);
            self.emit(Op::Undefined);
            self.patch_jump(done);
        }
        if !needed {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn compile_chain(
        &mut self,
        expr: &ast::Expression,
        jumps: &mut ChainJumps,
    ) -> Result<(), CompileError> {
        match expr {
            ast::Expression::Member(member) => {
                self.compile_chain_operand(&member.object, jumps)?;
                if member.optional {
                    self.emit(Op::Dup);
                    jumps.one.push(self.emit(Op::JumpIfNullish(0)));
                }
                self.set_pos(member.pos);
                match &member.property {
                    ast::MemberProperty::Identifier(name) => {
                        let idx = self.str_idx(name);
                        self.emit(Op::GetProp(idx));
                    }
                    ast::MemberProperty::Computed(key) => {
                        self.compile_expression(key, true)?;
                        self.emit(Op::GetElem);
                    }
                }
            }
            ast::Expression::PrivateMember(private) => {
                self.compile_chain_operand(&private.object, jumps)?;
                self.set_pos(private.pos);
                match self.resolve_private(&private.name, private.pos)? {
                    PrivateResolution::Static { level, idx } => {
                        self.emit(Op::GetPrivate { level, idx });
                    }
                    PrivateResolution::Dynamic => {
                        let name_idx = self.str_idx(&private.name);
                        self.emit(Op::GetPrivateDyn(name_idx));
                    }
                }
            }
            ast::Expression::Call(call) => {
                match call.callee.as_ref() {
                    ast::Expression::Member(member) => {
                        // Method call: the receiver becomes `this`.
                        self.compile_chain_operand(&member.object, jumps)?;
                        if member.optional {
                            self.emit(Op::Dup);
                            jumps.one.push(self.emit(Op::JumpIfNullish(0)));
                        }
                        self.emit(Op::Dup);
                        match &member.property {
                            ast::MemberProperty::Identifier(name) => {
                                let idx = self.str_idx(name);
                                self.emit(Op::GetProp(idx));
                            }
                            ast::MemberProperty::Computed(key) => {
                                self.compile_expression(key, true)?;
                                self.emit(Op::GetElem);
                            }
                        }
                        if call.optional {
                            self.emit(Op::Dup);
                            jumps.two.push(self.emit(Op::JumpIfNullish(0)));
                        }
                        // [receiver, callee] -> [callee, this]
                        self.emit(Op::Swap);
                    }
                    ast::Expression::PrivateMember(private) => {
                        self.compile_chain_operand(&private.object, jumps)?;
                        self.emit(Op::Dup);
                        match self.resolve_private(&private.name, private.pos)? {
                            PrivateResolution::Static { level, idx } => {
                                self.emit(Op::GetPrivate { level, idx });
                            }
                            PrivateResolution::Dynamic => {
                                let name_idx = self.str_idx(&private.name);
                                self.emit(Op::GetPrivateDyn(name_idx));
                            }
                        }
                        if call.optional {
                            self.emit(Op::Dup);
                            jumps.two.push(self.emit(Op::JumpIfNullish(0)));
                        }
                        self.emit(Op::Swap);
                    }
                    callee => {
                        self.compile_chain_operand(callee, jumps)?;
                        if call.optional {
                            self.emit(Op::Dup);
                            jumps.one.push(self.emit(Op::JumpIfNullish(0)));
                        }
                        self.emit(Op::Undefined);
                    }
                }
                for arg in &call.arguments {
                    self.compile_expression(arg, true)?;
                }
                self.set_pos(call.pos);
                self.emit(Op::Call(call.arguments.len() as u16));
            }
            other => unreachable!("chain compilation reached {other:?}"),
        }
        Ok(())
    }

    /// Compiles the object/callee position of a chain link: nested chain
    /// nodes extend the same short-circuit set, anything else is an
    /// ordinary expression.
    fn compile_chain_operand(
        &mut self,
        expr: &ast::Expression,
        jumps: &mut ChainJumps,
    ) -> Result<(), CompileError> {
        match expr {
            ast::Expression::Member(_)
            | ast::Expression::Call(_)
            | ast::Expression::PrivateMember(_) => self.compile_chain(expr, jumps),
            other => self.compile_expression(other, true),
        }
    }

    // ========================================================================
    // Assignment target helpers
    // ========================================================================

    /// Consumes the stack top and writes it into an assignment target.
    /// Used where the value already exists before the target reference can
    /// be evaluated (for-in/for-of bindings).
    pub(crate) fn store_into_target(
        &mut self,
        target: &ast::AssignmentTarget,
    ) -> Result<(), CompileError> {
        match target {
            ast::AssignmentTarget::Identifier(ident) => {
                self.compile_ident_store(&ident.name);
            }
            ast::AssignmentTarget::Member(member) => {
                self.compile_expression(&member.object, true)?;
                self.emit(Op::Swap);
                match &member.property {
                    ast::MemberProperty::Identifier(name) => {
                        let idx = self.str_idx(name);
                        self.emit(Op::SetProp(idx));
                    }
                    ast::MemberProperty::Computed(key) => {
                        self.compile_expression(key, true)?;
                        self.emit(Op::Swap);
                        self.emit(Op::SetElem);
                    }
                }
                self.emit(Op::Pop);
            }
            ast::AssignmentTarget::PrivateMember(private) => {
                let (level, idx) = self.static_private(&private.name, private.pos)?;
                self.compile_expression(&private.object, true)?;
                self.emit(Op::Swap);
                self.emit(Op::SetPrivate { level, idx });
                self.emit(Op::Pop);
            }
            ast::AssignmentTarget::Pattern(pattern) => {
                self.store_pattern(pattern)?;
            }
        }
        Ok(())
    }

    fn static_private(&mut self, name: &str, pos: ast::Pos) -> Result<(u16, u16), CompileError> {
        match self.resolve_private(name, pos)? {
            PrivateResolution::Static { level, idx } => Ok((level, idx)),
            PrivateResolution::Dynamic => Err(self.error(
                "private member writes are not available inside with statements",
                pos,
            )),
        }
    }

    /// Grabs a hidden frame slot for intermediate values.
    pub(crate) fn alloc_temp(&mut self) -> i32 {
        let builder = self.builder_mut();
        let slot = builder.next_local;
        builder.next_local += 1;
        slot as i32
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Compiles a class literal, leaving the constructor on the stack when
    /// `needed`. Methods and field initializers are compiled while the
    /// class's private-name environment is open, so their private accesses
    /// resolve to (level, index) addresses fixed now.
    pub(crate) fn compile_class(
        &mut self,
        class: &ast::ClassLiteral,
        needed: bool,
    ) -> Result<(), CompileError> {
        let mut names: FxHashMap<String, u16> = FxHashMap::default();
        for member in &class.members {
            if let ast::ClassKey::Private(name) = &member.key {
                let next = names.len() as u16;
                names.entry(name.clone()).or_insert(next);
            }
        }
        let env_idx = self.push_private_env(names);
        self.emit(Op::PushPrivateEnv(env_idx));

        let result = (|| -> Result<(), CompileError> {
            let ctor = class.members.iter().find_map(|member| match &member.kind {
                ast::ClassMemberKind::Constructor(func) => Some(func),
                _ => None,
            });
            let class_name = class.name.as_ref().map(|ident| ident.name.as_str());
            let empty_params: Vec<ast::Pattern> = Vec::new();
            let empty_body: Vec<ast::Statement> = Vec::new();
            let (params, body, ctor_pos) = match ctor {
                Some(func) => (&func.params, &func.body, func.pos),
                None => (&empty_params, &empty_body, class.pos),
            };
            let flags = ProgramFlags { ctor: true, ..Default::default() };
            let fn_idx = self.compile_function(
                class_name.or(Some("<class>")),
                params,
                FunctionBody::Block(body),
                true,
                flags,
                Some(&class.members),
                false,
                ctor_pos,
            )?;
            self.emit(Op::MakeClosure(fn_idx));
            self.emit(Op::NewObject);

            let proto_key = self.str_idx("prototype");
            let ctor_key = self.str_idx("constructor");
            self.emit(Op::Dup2);
            self.emit(Op::SetProp(proto_key));
            self.emit(Op::Pop);
            self.emit(Op::Dup2);
            self.emit(Op::Swap);
            self.emit(Op::SetProp(ctor_key));
            self.emit(Op::Pop);

            for member in &class.members {
                match (&member.kind, &member.key, member.is_static) {
                    (ast::ClassMemberKind::Constructor(_), _, _) => {}
                    (ast::ClassMemberKind::Method(func), ast::ClassKey::Public(name), false) => {
                        self.emit(Op::Dup);
                        let idx = self.compile_method(Some(name), func)?;
                        self.emit(Op::MakeClosure(idx));
                        let key = self.str_idx(name);
                        self.emit(Op::SetProp(key));
                        self.emit(Op::Pop);
                    }
                    (ast::ClassMemberKind::Method(func), ast::ClassKey::Public(name), true) => {
                        self.emit(Op::Dup2);
                        self.emit(Op::Pop);
                        let idx = self.compile_method(Some(name), func)?;
                        self.emit(Op::MakeClosure(idx));
                        let key = self.str_idx(name);
                        self.emit(Op::SetProp(key));
                        self.emit(Op::Pop);
                    }
                    (ast::ClassMemberKind::Method(func), ast::ClassKey::Private(name), true) => {
                        self.emit(Op::Dup2);
                        self.emit(Op::Pop);
                        let idx = self.compile_method(Some(name), func)?;
                        self.emit(Op::MakeClosure(idx));
                        let (level, slot) = self.static_private(name, member.pos)?;
                        self.emit(Op::InitPrivate { level, idx: slot });
                    }
                    (ast::ClassMemberKind::Field(init), ast::ClassKey::Public(name), true) => {
                        self.emit(Op::Dup2);
                        self.emit(Op::Pop);
                        match init {
                            Some(expr) => self.compile_expression(expr, true)?,
                            None => {
                                self.emit(Op::Undefined);
                            }
                        }
                        let key = self.str_idx(name);
                        self.emit(Op::SetProp(key));
                        self.emit(Op::Pop);
                    }
                    (ast::ClassMemberKind::Field(init), ast::ClassKey::Private(name), true) => {
                        self.emit(Op::Dup2);
                        self.emit(Op::Pop);
                        match init {
                            Some(expr) => self.compile_expression(expr, true)?,
                            None => {
                                self.emit(Op::Undefined);
                            }
                        }
                        let (level, slot) = self.static_private(name, member.pos)?;
                        self.emit(Op::InitPrivate { level, idx: slot });
                    }
                    // Instance fields and private instance methods install
                    // from the constructor preamble.
                    (ast::ClassMemberKind::Field(_), _, false) => {}
                    (ast::ClassMemberKind::Method(_), ast::ClassKey::Private(_), false) => {}
                }
            }

            self.emit(Op::Pop); // drop the prototype, leaving the constructor
            Ok(())
        })();

        self.emit(Op::PopPrivateEnv);
        self.pop_private_env();
        result?;
        if !needed {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn compile_method(&mut self, name: Option<&str>, func: &ast::Function) -> Result<u32, CompileError> {
        let flags = ProgramFlags { no_construct: true, ..Default::default() };
        self.compile_function(
            name,
            &func.params,
            FunctionBody::Block(&func.body),
            true,
            flags,
            None,
            false,
            func.pos,
        )
    }

    /// Emits the constructor preamble installing instance fields and
    /// private instance methods on the freshly constructed `this`.
    pub(crate) fn emit_field_initializers(
        &mut self,
        members: &[ast::ClassMember],
    ) -> Result<(), CompileError> {
        for member in members {
            if member.is_static {
                continue;
            }
            match (&member.kind, &member.key) {
                (ast::ClassMemberKind::Field(init), ast::ClassKey::Public(name)) => {
                    self.emit(Op::This);
                    match init {
                        Some(expr) => self.compile_expression(expr, true)?,
                        None => {
                            self.emit(Op::Undefined);
                        }
                    }
                    let key = self.str_idx(name);
                    self.emit(Op::SetProp(key));
                    self.emit(Op::Pop);
                }
                (ast::ClassMemberKind::Field(init), ast::ClassKey::Private(name)) => {
                    self.emit(Op::This);
                    match init {
                        Some(expr) => self.compile_expression(expr, true)?,
                        None => {
                            self.emit(Op::Undefined);
                        }
                    }
                    let (level, idx) = self.static_private(name, member.pos)?;
                    self.emit(Op::InitPrivate { level, idx });
                }
                (ast::ClassMemberKind::Method(func), ast::ClassKey::Private(name)) => {
                    self.emit(Op::This);
                    let fn_idx = self.compile_method(Some(name), func)?;
                    self.emit(Op::MakeClosure(fn_idx));
                    let (level, idx) = self.static_private(name, member.pos)?;
                    self.emit(Op::InitPrivate { level, idx });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Short-circuit jumps collected while compiling one optional chain,
/// grouped by how many chain values are on the stack at the jump site.
#[derive(Debug, Default)]
struct ChainJumps {
    one: Vec<u32>,
    two: Vec<u32>,
}

fn binary_op(operator: ast::BinaryOperator) -> Op {
    use ast::BinaryOperator::*;
    match operator {
        Add => Op::Add,
        Subtract => Op::Sub,
        Multiply => Op::Mul,
        Divide => Op::Div,
        Modulo => Op::Mod,
        Exponent => Op::Exp,
        LessThan => Op::Lt,
        LessThanEqual => Op::Le,
        GreaterThan => Op::Gt,
        GreaterThanEqual => Op::Ge,
        Equal => Op::Eq,
        NotEqual => Op::Ne,
        StrictEqual => Op::StrictEq,
        StrictNotEqual => Op::StrictNe,
        BitwiseAnd => Op::BitAnd,
        BitwiseOr => Op::BitOr,
        BitwiseXor => Op::BitXor,
        LeftShift => Op::Shl,
        RightShift => Op::Shr,
        UnsignedRightShift => Op::Ushr,
        In => Op::InOp,
        InstanceOf => Op::InstanceOf,
    }
}

fn compound_op(operator: ast::AssignmentOperator) -> Op {
    use ast::AssignmentOperator::*;
    match operator {
        Assign => unreachable!("plain assignment handled separately"),
        Add => Op::Add,
        Subtract => Op::Sub,
        Multiply => Op::Mul,
        Divide => Op::Div,
        Modulo => Op::Mod,
        Exponent => Op::Exp,
        BitwiseAnd => Op::BitAnd,
        BitwiseOr => Op::BitOr,
        BitwiseXor => Op::BitXor,
        LeftShift => Op::Shl,
        RightShift => Op::Shr,
        UnsignedRightShift => Op::Ushr,
    }
}

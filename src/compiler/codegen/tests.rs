//! Tests for the bytecode compiler.

use std::sync::Arc;

use super::*;
use crate::ast::{self, build};
use crate::compiler::bytecode::Op;
use crate::compiler::{CompileError, Program};

fn compile_stmts(stmts: Vec<ast::Statement>) -> Arc<Program> {
    Compiler::compile(&build::program(stmts)).expect("compilation should succeed")
}

fn compile_err(stmts: Vec<ast::Statement>) -> CompileError {
    Compiler::compile(&build::program(stmts)).expect_err("compilation should fail")
}

fn has_op(program: &Program, pred: impl Fn(&Op) -> bool) -> bool {
    program.code.iter().any(|op| pred(op))
}

#[test]
fn test_compile_empty_program() {
    let program = compile_stmts(vec![]);
    assert_eq!(&*program.code, &[Op::Undefined, Op::Return][..]);
}

#[test]
fn test_compile_is_deterministic() {
    let stmts = || {
        vec![
            build::let_("x", build::num(1.0)),
            build::if_(
                build::id("x"),
                build::block(vec![build::expr(build::assign("x", build::num(2.0)))]),
            ),
            build::while_(
                build::binary(ast::BinaryOperator::LessThan, build::id("x"), build::num(9.0)),
                build::expr(build::assign("x", build::add(build::id("x"), build::num(1.0)))),
            ),
        ]
    };
    let first = compile_stmts(stmts());
    let second = compile_stmts(stmts());
    assert_eq!(first.code, second.code);
    assert_eq!(first.src_map, second.src_map);
    assert_eq!(first.num_locals, second.num_locals);
}

#[test]
fn test_captured_binding_gets_stash_slot() {
    // function outer() { let x = 1; let y = 2; return function () { return x; }; }
    let program = compile_stmts(vec![build::func_decl(
        "outer",
        &[],
        vec![
            build::let_("x", build::num(1.0)),
            build::let_("y", build::num(2.0)),
            build::ret(build::func_expr(&[], vec![build::ret(build::id("x"))])),
        ],
    )]);
    let outer = &program.functions[0];
    // Exactly the captured binding lives in the stash; the other one stays
    // on the stack.
    let stash = outer.func_stash.expect("outer captures a binding");
    assert_eq!(outer.stash_templates[stash as usize].size, 1);
    assert!(outer.num_locals >= 1, "y stays a frame slot");
    // The nested function reads it through the chain with a TDZ check.
    let inner = &outer.functions[0];
    assert!(has_op(inner, |op| matches!(op, Op::LoadStashTdz { level: 0, idx: 0 })));
}

#[test]
fn test_uncaptured_function_has_no_stash() {
    let program = compile_stmts(vec![build::func_decl(
        "f",
        &["a"],
        vec![
            build::let_("x", build::num(1.0)),
            build::ret(build::add(build::id("a"), build::id("x"))),
        ],
    )]);
    let f = &program.functions[0];
    assert_eq!(f.func_stash, None);
    assert!(f.param_copies.is_empty());
}

#[test]
fn test_parameter_offsets_are_negative() {
    let program = compile_stmts(vec![build::func_decl(
        "f",
        &["a", "b"],
        vec![build::ret(build::id("a"))],
    )]);
    let f = &program.functions[0];
    assert_eq!(f.num_args, 2);
    assert!(has_op(f, |op| matches!(op, Op::LoadStack(-2))));
}

#[test]
fn test_captured_parameter_is_copied_into_stash() {
    // function f(a) { return function () { return a; }; }
    let program = compile_stmts(vec![build::func_decl(
        "f",
        &["a"],
        vec![build::ret(build::func_expr(&[], vec![build::ret(build::id("a"))]))],
    )]);
    let f = &program.functions[0];
    assert!(f.func_stash.is_some());
    assert_eq!(f.param_copies.to_vec(), vec![(0, 0)]);
}

#[test]
fn test_duplicate_lexical_declaration_fails() {
    let error = compile_err(vec![
        build::let_("x", build::num(1.0)),
        build::let_("x", build::num(2.0)),
    ]);
    assert_eq!(error.kind, crate::compiler::CompileErrorKind::Syntax);
}

#[test]
fn test_var_collapses_with_var() {
    compile_stmts(vec![
        build::var("x", build::num(1.0)),
        build::var("x", build::num(2.0)),
    ]);
}

#[test]
fn test_break_outside_loop_fails() {
    compile_err(vec![build::brk()]);
}

#[test]
fn test_continue_outside_loop_fails() {
    compile_err(vec![build::cont()]);
}

#[test]
fn test_unknown_label_fails() {
    let break_missing =
        ast::Statement::Break(ast::BreakStatement { label: Some("missing".to_string()), pos: 0 });
    let error = compile_err(vec![build::while_(build::boolean(true), break_missing)]);
    assert!(error.message.contains("missing"));
}

#[test]
fn test_return_at_top_level_fails() {
    compile_err(vec![build::ret(build::num(1.0))]);
}

#[test]
fn test_with_in_strict_code_fails() {
    let program = ast::Program {
        file: "main".to_string(),
        body: vec![ast::Statement::With(ast::WithStatement {
            object: build::object(vec![]),
            body: Box::new(ast::Statement::Empty),
            pos: 3,
        })],
        strict: true,
    };
    let error = Compiler::compile(&program).expect_err("with is rejected in strict code");
    assert_eq!(error.pos, 3);
}

#[test]
fn test_dead_branch_is_discarded_but_checked() {
    // A statically-false branch adds no instructions...
    let live = compile_stmts(vec![build::if_(
        build::boolean(false),
        build::expr(build::assign("x", build::num(1.0))),
    )]);
    let empty = compile_stmts(vec![ast::Statement::Empty]);
    assert_eq!(live.code.len(), empty.code.len());

    // ...but errors inside it still surface.
    compile_err(vec![build::if_(build::boolean(false), build::brk())]);
}

#[test]
fn test_dead_branch_does_not_capture() {
    // The closure reference to x sits in dead code, so x must not be
    // promoted to a stash slot.
    let program = compile_stmts(vec![build::func_decl(
        "f",
        &[],
        vec![
            build::let_("x", build::num(1.0)),
            build::if_(
                build::boolean(false),
                build::expr(build::func_expr(&[], vec![build::ret(build::id("x"))])),
            ),
            build::ret(build::id("x")),
        ],
    )]);
    assert_eq!(program.functions[0].func_stash, None);
}

#[test]
fn test_loop_reentry_resets_dead_zone() {
    let program = compile_stmts(vec![build::while_(
        build::boolean(true),
        build::block(vec![build::let_("x", build::num(1.0))]),
    )]);
    assert!(has_op(&program, |op| matches!(op, Op::ResetStack(_))));
}

#[test]
fn test_try_offsets_are_patched() {
    let program = compile_stmts(vec![build::try_catch_finally(
        vec![build::expr(build::num(1.0))],
        "e",
        vec![],
        vec![],
    )]);
    assert!(has_op(&program, |op| matches!(
        op,
        Op::Try { catch, finally } if *catch > 0 && *finally > *catch
    )));
    assert!(has_op(&program, |op| matches!(op, Op::EndFinally)));
}

#[test]
fn test_break_through_finally_unwinds_one_region() {
    let program = compile_stmts(vec![build::while_(
        build::boolean(true),
        build::block(vec![build::try_finally(vec![build::brk()], vec![])]),
    )]);
    assert!(has_op(&program, |op| matches!(op, Op::Leave { tries: 1, .. })));
}

#[test]
fn test_global_var_declares_global() {
    let program = compile_stmts(vec![build::var("x", build::num(1.0))]);
    assert!(has_op(&program, |op| matches!(op, Op::DeclareGlobal(_))));
    assert!(has_op(&program, |op| matches!(op, Op::StoreGlobal(_))));
}

#[test]
fn test_with_forces_dynamic_accessors() {
    // var v; with (o) { v = x; }
    let program = compile_stmts(vec![
        build::var("v", build::num(0.0)),
        ast::Statement::With(ast::WithStatement {
            object: build::id("o"),
            body: Box::new(build::expr(build::assign("v", build::id("x")))),
            pos: 0,
        }),
    ]);
    assert!(has_op(&program, |op| matches!(op, Op::PushWith)));
    assert!(has_op(&program, |op| matches!(op, Op::LoadDynamic(_))));
    assert!(has_op(&program, |op| matches!(op, Op::StoreDynamic(_))));
}

#[test]
fn test_optional_chain_compiles_to_jumps() {
    let program = compile_stmts(vec![build::expr(ast::Expression::Member(
        ast::MemberExpression {
            object: Box::new(build::id("o")),
            property: ast::MemberProperty::Identifier("a".to_string()),
            optional: true,
            pos: 0,
        },
    ))]);
    assert!(has_op(&program, |op| matches!(op, Op::JumpIfNullish(_))));
    assert!(!has_op(&program, |op| matches!(op, Op::Call(_))));
}

#[test]
fn test_arguments_materializes_lazily() {
    let with_args = compile_stmts(vec![build::func_decl(
        "f",
        &[],
        vec![build::ret(build::member(build::id("arguments"), "length"))],
    )]);
    let f = &with_args.functions[0];
    assert!(f.flags.needs_arguments);
    assert!(f.arguments_at.is_some());

    let without = compile_stmts(vec![build::func_decl(
        "g",
        &[],
        vec![build::ret(build::num(1.0))],
    )]);
    assert!(!without.functions[0].flags.needs_arguments);
}

#[test]
fn test_switch_uses_hidden_discriminant_slot() {
    let program = compile_stmts(vec![ast::Statement::Switch(ast::SwitchStatement {
        discriminant: build::num(1.0),
        cases: vec![ast::SwitchCase {
            test: Some(build::num(1.0)),
            consequent: vec![build::brk()],
        }],
        pos: 0,
    })]);
    assert!(program.num_locals >= 1);
    assert!(has_op(&program, |op| matches!(op, Op::StrictEq)));
}

#[test]
fn test_class_compiles_private_environment() {
    let class = ast::ClassLiteral {
        name: Some(build::ident("C")),
        members: vec![
            ast::ClassMember {
                key: ast::ClassKey::Private("x".to_string()),
                kind: ast::ClassMemberKind::Field(Some(build::num(0.0))),
                is_static: false,
                pos: 0,
            },
            ast::ClassMember {
                key: ast::ClassKey::Public("get".to_string()),
                kind: ast::ClassMemberKind::Method(build::function(
                    None,
                    &[],
                    vec![build::ret(build::private_member(build::this(), "x"))],
                )),
                is_static: false,
                pos: 0,
            },
        ],
        pos: 0,
    };
    let program = compile_stmts(vec![ast::Statement::ClassDeclaration(ast::ClassDeclaration {
        id: build::ident("C"),
        class,
    })]);
    assert!(has_op(&program, |op| matches!(op, Op::PushPrivateEnv(_))));
    assert!(has_op(&program, |op| matches!(op, Op::PopPrivateEnv)));
    // The constructor installs the field; the method reads it at the level
    // fixed at class-compile time.
    let ctor = &program.functions[0];
    assert!(has_op(ctor, |op| matches!(op, Op::InitPrivate { level: 0, idx: 0 })));
    let method = &program.functions[1];
    assert!(has_op(method, |op| matches!(op, Op::GetPrivate { level: 0, idx: 0 })));
}

#[test]
fn test_private_access_outside_class_fails() {
    let error = compile_err(vec![build::expr(build::private_member(build::this(), "x"))]);
    assert!(error.message.contains("#x"));
}

#[test]
fn test_unresolved_placeholders_never_survive() {
    let program = compile_stmts(vec![
        build::let_("a", build::num(1.0)),
        build::func_decl(
            "f",
            &["p"],
            vec![build::ret(build::add(build::id("a"), build::id("p")))],
        ),
        build::expr(build::call(build::id("f"), vec![build::num(2.0)])),
    ]);
    fn check(program: &Program) {
        assert!(!program.code.iter().any(|op| matches!(op, Op::Unresolved(_))));
        for child in program.functions.iter() {
            check(child);
        }
    }
    check(&program);
}

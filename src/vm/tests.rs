//! End-to-end execution tests: compiled programs driven through the VM.

use std::sync::Arc;

use crate::Error;
use crate::ast::{self, build};
use crate::compiler;
use crate::runtime::value::Value;

use super::Vm;

fn compile(stmts: Vec<ast::Statement>) -> Arc<crate::compiler::Program> {
    compiler::compile(&build::program(stmts)).expect("compilation should succeed")
}

fn eval(stmts: Vec<ast::Statement>) -> Value {
    Vm::new().run(&compile(stmts)).expect("execution should succeed")
}

fn eval_in(vm: &mut Vm, stmts: Vec<ast::Statement>) -> Result<Value, Error> {
    vm.run(&compile(stmts))
}

fn global(vm: &Vm, name: &str) -> Value {
    vm.context().get_global(name).unwrap_or(Value::Undefined)
}

fn global_strings(vm: &Vm, name: &str) -> Vec<String> {
    match global(vm, name) {
        Value::Object(obj) => obj
            .elements()
            .expect("expected an array")
            .iter()
            .map(Value::to_js_string)
            .collect(),
        other => panic!("expected an array global, got {other:?}"),
    }
}

fn lt(a: ast::Expression, b: ast::Expression) -> ast::Expression {
    build::binary(ast::BinaryOperator::LessThan, a, b)
}

fn strict_eq(a: ast::Expression, b: ast::Expression) -> ast::Expression {
    build::binary(ast::BinaryOperator::StrictEqual, a, b)
}

/// `mark(x)` appends x to the global `log` array.
fn mark_prelude() -> Vec<ast::Statement> {
    vec![
        build::var("log", build::array(vec![])),
        build::var("n", build::num(0.0)),
        build::func_decl(
            "mark",
            &["x"],
            vec![
                build::expr(build::assign_to(
                    ast::AssignmentTarget::Member(build::index_expr(
                        build::id("log"),
                        build::id("n"),
                    )),
                    ast::AssignmentOperator::Assign,
                    build::id("x"),
                )),
                build::expr(build::assign("n", build::add(build::id("n"), build::num(1.0)))),
            ],
        ),
    ]
}

// ============================================================================
// Basics
// ============================================================================

#[test]
fn test_arithmetic_and_strings() {
    assert_eq!(eval(vec![build::expr(build::add(build::num(2.0), build::num(3.0)))]), Value::Number(5.0));
    assert_eq!(
        eval(vec![build::expr(build::add(build::str("a"), build::num(1.0)))]),
        Value::string("a1")
    );
    assert_eq!(
        eval(vec![build::expr(build::binary(
            ast::BinaryOperator::Exponent,
            build::num(2.0),
            build::num(10.0),
        ))]),
        Value::Number(1024.0)
    );
}

#[test]
fn test_variables_and_assignment() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("x", build::num(1.0)),
            build::expr(build::assign("x", build::add(build::id("x"), build::num(4.0)))),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "x"), Value::Number(5.0));
}

#[test]
fn test_function_call_and_return() {
    let result = eval(vec![
        build::func_decl(
            "add",
            &["a", "b"],
            vec![build::ret(build::add(build::id("a"), build::id("b")))],
        ),
        build::expr(build::call(build::id("add"), vec![build::num(2.0), build::num(40.0)])),
    ]);
    assert_eq!(result, Value::Number(42.0));
}

#[test]
fn test_function_hoisting_allows_early_calls() {
    let result = eval(vec![
        build::var("r", build::call(build::id("later"), vec![])),
        build::func_decl("later", &[], vec![build::ret(build::num(7.0))]),
        build::expr(build::id("r")),
    ]);
    assert_eq!(result, Value::Number(7.0));
}

#[test]
fn test_missing_arguments_are_undefined() {
    let result = eval(vec![
        build::func_decl("f", &["a", "b"], vec![build::ret(build::id("b"))]),
        build::expr(build::call(build::id("f"), vec![build::num(1.0)])),
    ]);
    assert_eq!(result, Value::Undefined);
}

#[test]
fn test_loops_and_update_expressions() {
    let mut vm = Vm::new();
    // var total = 0; for (var i = 0; i < 5; i++) { total += i; }
    eval_in(
        &mut vm,
        vec![
            build::var("total", build::num(0.0)),
            build::var("i", build::num(0.0)),
            build::for_(
                None,
                Some(lt(build::id("i"), build::num(5.0))),
                Some(ast::Expression::Update(ast::UpdateExpression {
                    operator: ast::UpdateOperator::Increment,
                    prefix: false,
                    argument: Box::new(ast::AssignmentTarget::Identifier(build::ident("i"))),
                    pos: 0,
                })),
                build::expr(build::assign_to(
                    ast::AssignmentTarget::Identifier(build::ident("total")),
                    ast::AssignmentOperator::Add,
                    build::id("i"),
                )),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "total"), Value::Number(10.0));
}

#[test]
fn test_postfix_and_prefix_updates() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("x", build::num(5.0)),
            build::var(
                "a",
                ast::Expression::Update(ast::UpdateExpression {
                    operator: ast::UpdateOperator::Increment,
                    prefix: false,
                    argument: Box::new(ast::AssignmentTarget::Identifier(build::ident("x"))),
                    pos: 0,
                }),
            ),
            build::var(
                "b",
                ast::Expression::Update(ast::UpdateExpression {
                    operator: ast::UpdateOperator::Increment,
                    prefix: true,
                    argument: Box::new(ast::AssignmentTarget::Identifier(build::ident("x"))),
                    pos: 0,
                }),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "a"), Value::Number(5.0));
    assert_eq!(global(&vm, "b"), Value::Number(7.0));
    assert_eq!(global(&vm, "x"), Value::Number(7.0));
}

#[test]
fn test_logical_and_nullish_short_circuit() {
    assert_eq!(
        eval(vec![build::expr(build::logical(
            ast::LogicalOperator::Nullish,
            build::num(0.0),
            build::num(5.0),
        ))]),
        Value::Number(0.0)
    );
    assert_eq!(
        eval(vec![build::expr(build::logical(
            ast::LogicalOperator::Nullish,
            build::null(),
            build::num(5.0),
        ))]),
        Value::Number(5.0)
    );
    assert_eq!(
        eval(vec![build::expr(build::logical(
            ast::LogicalOperator::Or,
            build::num(0.0),
            build::num(5.0),
        ))]),
        Value::Number(5.0)
    );
    // The right side must not evaluate when the left short-circuits.
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("ran", build::boolean(false)),
            build::func_decl(
                "sideEffect",
                &[],
                vec![
                    build::expr(build::assign("ran", build::boolean(true))),
                    build::ret(build::boolean(true)),
                ],
            ),
            build::expr(build::logical(
                ast::LogicalOperator::And,
                build::boolean(false),
                build::call(build::id("sideEffect"), vec![]),
            )),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "ran"), Value::Boolean(false));
}

// ============================================================================
// Operand evaluation order
// ============================================================================

#[test]
fn test_member_assignment_evaluates_left_to_right() {
    // f()[g()] = h() must evaluate f, then g, then h.
    let mut vm = Vm::new();
    let mut stmts = mark_prelude();
    stmts.extend(vec![
        build::func_decl(
            "f",
            &[],
            vec![
                build::expr(build::call(build::id("mark"), vec![build::str("f")])),
                build::ret(build::object(vec![])),
            ],
        ),
        build::func_decl(
            "g",
            &[],
            vec![
                build::expr(build::call(build::id("mark"), vec![build::str("g")])),
                build::ret(build::str("k")),
            ],
        ),
        build::func_decl(
            "h",
            &[],
            vec![
                build::expr(build::call(build::id("mark"), vec![build::str("h")])),
                build::ret(build::num(1.0)),
            ],
        ),
        build::expr(build::assign_to(
            ast::AssignmentTarget::Member(build::index_expr(
                build::call(build::id("f"), vec![]),
                build::call(build::id("g"), vec![]),
            )),
            ast::AssignmentOperator::Assign,
            build::call(build::id("h"), vec![]),
        )),
    ]);
    eval_in(&mut vm, stmts).unwrap();
    assert_eq!(global_strings(&vm, "log"), vec!["f", "g", "h"]);
}

#[test]
fn test_call_arguments_evaluate_in_order() {
    let mut vm = Vm::new();
    let mut stmts = mark_prelude();
    stmts.push(build::func_decl("take", &["a", "b", "c"], vec![]));
    stmts.push(build::expr(build::call(
        build::id("take"),
        vec![
            build::call(build::id("mark"), vec![build::num(1.0)]),
            build::call(build::id("mark"), vec![build::num(2.0)]),
            build::call(build::id("mark"), vec![build::num(3.0)]),
        ],
    )));
    eval_in(&mut vm, stmts).unwrap();
    assert_eq!(global_strings(&vm, "log"), vec!["1", "2", "3"]);
}

// ============================================================================
// Closures and capture
// ============================================================================

#[test]
fn test_closure_shares_captured_slot_across_calls() {
    // function f() { let x = 0; return function () { x = x + 1; return x; }; }
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::func_decl(
                "f",
                &[],
                vec![
                    build::let_("x", build::num(0.0)),
                    build::ret(build::func_expr(
                        &[],
                        vec![
                            build::expr(build::assign(
                                "x",
                                build::add(build::id("x"), build::num(1.0)),
                            )),
                            build::ret(build::id("x")),
                        ],
                    )),
                ],
            ),
            build::var("c", build::call(build::id("f"), vec![])),
            build::var("r1", build::call(build::id("c"), vec![])),
            build::var("r2", build::call(build::id("c"), vec![])),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r1"), Value::Number(1.0));
    assert_eq!(global(&vm, "r2"), Value::Number(2.0));
}

#[test]
fn test_two_closures_from_one_literal_are_independent() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::func_decl(
                "counter",
                &[],
                vec![
                    build::let_("x", build::num(0.0)),
                    build::ret(build::func_expr(
                        &[],
                        vec![
                            build::expr(build::assign(
                                "x",
                                build::add(build::id("x"), build::num(1.0)),
                            )),
                            build::ret(build::id("x")),
                        ],
                    )),
                ],
            ),
            build::var("a", build::call(build::id("counter"), vec![])),
            build::var("b", build::call(build::id("counter"), vec![])),
            build::expr(build::call(build::id("a"), vec![])),
            build::expr(build::call(build::id("a"), vec![])),
            build::var("ra", build::call(build::id("a"), vec![])),
            build::var("rb", build::call(build::id("b"), vec![])),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "ra"), Value::Number(3.0));
    assert_eq!(global(&vm, "rb"), Value::Number(1.0));
}

#[test]
fn test_arrow_captures_lexical_this() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var(
                "obj",
                build::object(vec![
                    ("tag", build::str("yes")),
                    (
                        "get",
                        build::func_expr(
                            &[],
                            vec![build::ret(build::call(
                                build::arrow_expr(&[], build::member(build::this(), "tag")),
                                vec![],
                            ))],
                        ),
                    ),
                ]),
            ),
            build::var("r", build::call(build::member(build::id("obj"), "get"), vec![])),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::string("yes"));
}

// ============================================================================
// Temporal dead zone
// ============================================================================

#[test]
fn test_tdz_read_through_closure_created_earlier() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::func_decl("probe", &[], vec![build::ret(build::id("x"))]),
            build::var("r", build::str("")),
            build::try_catch(
                vec![build::expr(build::call(build::id("probe"), vec![]))],
                "e",
                vec![build::expr(build::assign("r", build::member(build::id("e"), "name")))],
            ),
            build::let_("x", build::num(1.0)),
            build::var("after", build::call(build::id("probe"), vec![])),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::string("ReferenceError"));
    // Once the declaration executed, the same closure reads normally.
    assert_eq!(global(&vm, "after"), Value::Number(1.0));
}

#[test]
fn test_tdz_resets_on_loop_reentry() {
    // Each iteration re-enters the block, so reading before the declaration
    // faults every time, not just the first.
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("faults", build::num(0.0)),
            build::var("i", build::num(0.0)),
            build::while_(
                lt(build::id("i"), build::num(2.0)),
                build::block(vec![
                    build::expr(build::assign("i", build::add(build::id("i"), build::num(1.0)))),
                    build::try_catch(
                        vec![build::expr(build::id("y"))],
                        "e",
                        vec![build::expr(build::assign(
                            "faults",
                            build::add(build::id("faults"), build::num(1.0)),
                        ))],
                    ),
                    build::let_("y", build::num(1.0)),
                ]),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "faults"), Value::Number(2.0));
}

#[test]
fn test_typeof_respects_tdz_but_not_unresolved_names() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("t", build::unary(ast::UnaryOperator::Typeof, build::id("missing"))),
            build::var("r", build::str("")),
            build::try_catch(
                vec![build::expr(build::unary(ast::UnaryOperator::Typeof, build::id("z")))],
                "e",
                vec![build::expr(build::assign("r", build::member(build::id("e"), "name")))],
            ),
            build::let_("z", build::num(1.0)),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "t"), Value::string("undefined"));
    assert_eq!(global(&vm, "r"), Value::string("ReferenceError"));
}

#[test]
fn test_const_assignment_throws_type_error() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::const_("k", build::num(1.0)),
            build::var("r", build::str("")),
            build::try_catch(
                vec![build::expr(build::assign("k", build::num(2.0)))],
                "e",
                vec![build::expr(build::assign("r", build::member(build::id("e"), "name")))],
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::string("TypeError"));
}

// ============================================================================
// Exceptions, try/catch/finally
// ============================================================================

#[test]
fn test_catch_binds_thrown_value() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("r", build::num(0.0)),
            build::try_catch(
                vec![build::throw(build::num(41.0))],
                "e",
                vec![build::expr(build::assign("r", build::add(build::id("e"), build::num(1.0))))],
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::Number(42.0));
}

#[test]
fn test_catch_param_destructuring() {
    let mut vm = Vm::new();
    let catch = ast::Statement::Try(ast::TryStatement {
        block: ast::BlockStatement {
            body: vec![build::throw(build::object(vec![("code", build::num(5.0))]))],
            pos: 0,
        },
        handler: Some(ast::CatchClause {
            param: Some(build::object_pattern(&[("code", "code")])),
            body: ast::BlockStatement {
                body: vec![build::expr(build::assign("r", build::id("code")))],
                pos: 0,
            },
            pos: 0,
        }),
        finalizer: None,
        pos: 0,
    });
    eval_in(&mut vm, vec![build::var("r", build::num(0.0)), catch]).unwrap();
    assert_eq!(global(&vm, "r"), Value::Number(5.0));
}

#[test]
fn test_finally_runs_once_on_return() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("count", build::num(0.0)),
            build::func_decl(
                "f",
                &[],
                vec![build::try_finally(
                    vec![build::ret(build::num(1.0))],
                    vec![build::expr(build::assign(
                        "count",
                        build::add(build::id("count"), build::num(1.0)),
                    ))],
                )],
            ),
            build::var("r", build::call(build::id("f"), vec![])),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::Number(1.0));
    assert_eq!(global(&vm, "count"), Value::Number(1.0));
}

#[test]
fn test_finally_runs_once_on_break_and_continue() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("count", build::num(0.0)),
            // One finally per loop exit: two continues, then the loop ends.
            build::var("i", build::num(0.0)),
            build::while_(
                lt(build::id("i"), build::num(2.0)),
                build::block(vec![
                    build::expr(build::assign("i", build::add(build::id("i"), build::num(1.0)))),
                    build::try_finally(
                        vec![build::cont()],
                        vec![build::expr(build::assign(
                            "count",
                            build::add(build::id("count"), build::num(1.0)),
                        ))],
                    ),
                ]),
            ),
            // And a break path.
            build::while_(
                build::boolean(true),
                build::try_finally(
                    vec![build::brk()],
                    vec![build::expr(build::assign(
                        "count",
                        build::add(build::id("count"), build::num(10.0)),
                    ))],
                ),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "count"), Value::Number(12.0));
}

#[test]
fn test_finally_runs_once_on_throw() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("count", build::num(0.0)),
            build::try_catch(
                vec![build::try_finally(
                    vec![build::throw(build::num(1.0))],
                    vec![build::expr(build::assign(
                        "count",
                        build::add(build::id("count"), build::num(1.0)),
                    ))],
                )],
                "e",
                vec![],
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "count"), Value::Number(1.0));
}

#[test]
fn test_catch_rethrow_wins_over_original() {
    // try { throw 1 } catch (e) { throw 2 } finally {} propagates 2.
    let error = Vm::new()
        .run(&compile(vec![build::try_catch_finally(
            vec![build::throw(build::num(1.0))],
            "e",
            vec![build::throw(build::num(2.0))],
            vec![],
        )]))
        .expect_err("the rethrow escapes");
    match error {
        Error::Runtime(exception) => assert_eq!(exception.value, Value::Number(2.0)),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn test_finally_return_overrides_pending_completion() {
    let result = eval(vec![
        build::func_decl(
            "f",
            &[],
            vec![build::try_finally(
                vec![build::ret(build::num(1.0))],
                vec![build::ret(build::num(2.0))],
            )],
        ),
        build::expr(build::call(build::id("f"), vec![])),
    ]);
    assert_eq!(result, Value::Number(2.0));
}

#[test]
fn test_finally_override_swallows_exception() {
    let result = eval(vec![
        build::func_decl(
            "f",
            &[],
            vec![build::try_finally(
                vec![build::throw(build::num(1.0))],
                vec![build::ret(build::num(3.0))],
            )],
        ),
        build::expr(build::call(build::id("f"), vec![])),
    ]);
    assert_eq!(result, Value::Number(3.0));
}

#[test]
fn test_uncaught_exception_carries_trace() {
    let error = Vm::new()
        .run(&compile(vec![
            build::func_decl("inner", &[], vec![build::throw(build::str("boom"))]),
            build::func_decl(
                "outer",
                &[],
                vec![build::expr(build::call(build::id("inner"), vec![]))],
            ),
            build::expr(build::call(build::id("outer"), vec![])),
        ]))
        .expect_err("the throw is uncaught");
    match error {
        Error::Runtime(exception) => {
            assert_eq!(exception.value, Value::string("boom"));
            let names: Vec<&str> = exception.trace.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, vec!["inner", "outer", "<main>"]);
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn test_exception_restores_operand_stack_depth() {
    // The throw happens mid-expression; the catch still leaves a clean
    // stack, so the surrounding computation completes correctly.
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::func_decl("boom", &[], vec![build::throw(build::num(1.0))]),
            build::var("r", build::num(0.0)),
            build::try_catch(
                vec![build::expr(build::assign(
                    "r",
                    build::add(build::num(10.0), build::call(build::id("boom"), vec![])),
                ))],
                "e",
                vec![build::expr(build::assign("r", build::num(99.0)))],
            ),
            build::var("check", build::add(build::num(1.0), build::num(2.0))),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::Number(99.0));
    assert_eq!(global(&vm, "check"), Value::Number(3.0));
}

// ============================================================================
// Unrecoverable conditions
// ============================================================================

#[test]
fn test_stack_overflow_is_unrecoverable_and_restores_state() {
    let mut vm = Vm::new();
    // Even a try/catch around the recursion must not catch the overflow.
    let error = eval_in(
        &mut vm,
        vec![
            build::func_decl(
                "f",
                &[],
                vec![build::ret(build::call(build::id("f"), vec![]))],
            ),
            build::try_catch(
                vec![build::expr(build::call(build::id("f"), vec![]))],
                "e",
                vec![build::expr(build::assign("caught", build::boolean(true)))],
            ),
        ],
    )
    .expect_err("the overflow bypasses catch");
    assert!(matches!(error, Error::StackOverflow));
    assert_eq!(global(&vm, "caught"), Value::Undefined);
    // Internal stacks were restored: the same VM keeps working.
    let result = eval_in(&mut vm, vec![build::expr(build::num(5.0))]).unwrap();
    assert_eq!(result, Value::Number(5.0));
}

fn trip(vm: &mut Vm, _this: &Value, _args: &[Value]) -> Result<Value, Value> {
    vm.interrupt_handle().interrupt("test interrupt");
    Ok(Value::Undefined)
}

#[test]
fn test_interrupt_aborts_past_poll_boundary() {
    let mut vm = Vm::new();
    vm.context().set_global("trip", Value::native("trip", trip));
    let error = eval_in(
        &mut vm,
        vec![
            build::expr(build::call(build::id("trip"), vec![])),
            build::while_(
                build::boolean(true),
                build::try_catch(
                    vec![build::expr(build::num(1.0))],
                    "e",
                    vec![build::expr(build::assign("caught", build::boolean(true)))],
                ),
            ),
        ],
    )
    .expect_err("the interrupt aborts the loop");
    assert!(matches!(error, Error::Interrupted(ref reason) if reason == "test interrupt"));
    // The interrupt bypassed the catch entirely.
    assert_eq!(global(&vm, "caught"), Value::Undefined);
    vm.interrupt_handle().clear();
    assert_eq!(eval_in(&mut vm, vec![build::expr(build::num(2.0))]).unwrap(), Value::Number(2.0));
}

#[test]
fn test_interrupt_closes_open_iterators() {
    let mut vm = Vm::new();
    vm.context().set_global("trip", Value::native("trip", trip));
    let error = eval_in(
        &mut vm,
        vec![
            build::var("closed", build::boolean(false)),
            build::var(
                "iter",
                build::object(vec![
                    (
                        "next",
                        build::func_expr(
                            &[],
                            vec![build::ret(build::object(vec![
                                ("done", build::boolean(false)),
                                ("value", build::num(1.0)),
                            ]))],
                        ),
                    ),
                    (
                        "return",
                        build::func_expr(
                            &[],
                            vec![
                                build::expr(build::assign("closed", build::boolean(true))),
                                build::ret(build::object(vec![])),
                            ],
                        ),
                    ),
                ]),
            ),
            build::for_of(
                ast::VariableKind::Var,
                "v",
                build::id("iter"),
                build::expr(build::call(build::id("trip"), vec![])),
            ),
        ],
    )
    .expect_err("the interrupt aborts the iteration");
    assert!(matches!(error, Error::Interrupted(_)));
    assert_eq!(global(&vm, "closed"), Value::Boolean(true));
    vm.interrupt_handle().clear();
}

// ============================================================================
// Iterators
// ============================================================================

#[test]
fn test_for_of_over_array_and_string() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("sum", build::num(0.0)),
            build::for_of(
                ast::VariableKind::Const,
                "v",
                build::array(vec![build::num(1.0), build::num(2.0), build::num(3.0)]),
                build::expr(build::assign("sum", build::add(build::id("sum"), build::id("v")))),
            ),
            build::var("s", build::str("")),
            build::for_of(
                ast::VariableKind::Const,
                "c",
                build::str("ab"),
                build::expr(build::assign("s", build::add(build::id("s"), build::id("c")))),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "sum"), Value::Number(6.0));
    assert_eq!(global(&vm, "s"), Value::string("ab"));
}

#[test]
fn test_for_in_enumerates_own_keys_in_insertion_order() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("keys", build::str("")),
            build::var(
                "obj",
                build::object(vec![("b", build::num(1.0)), ("a", build::num(2.0))]),
            ),
            build::for_in(
                ast::VariableKind::Var,
                "k",
                build::id("obj"),
                build::expr(build::assign("keys", build::add(build::id("keys"), build::id("k")))),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "keys"), Value::string("ba"));
}

#[test]
fn test_break_gives_iterator_its_close_notification() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("closed", build::boolean(false)),
            build::var("seen", build::num(0.0)),
            build::var(
                "iter",
                build::object(vec![
                    (
                        "next",
                        build::func_expr(
                            &[],
                            vec![build::ret(build::object(vec![
                                ("done", build::boolean(false)),
                                ("value", build::num(1.0)),
                            ]))],
                        ),
                    ),
                    (
                        "return",
                        build::func_expr(
                            &[],
                            vec![
                                build::expr(build::assign("closed", build::boolean(true))),
                                build::ret(build::object(vec![])),
                            ],
                        ),
                    ),
                ]),
            ),
            build::for_of(
                ast::VariableKind::Var,
                "v",
                build::id("iter"),
                build::block(vec![
                    build::expr(build::assign("seen", build::add(build::id("seen"), build::id("v")))),
                    build::brk(),
                ]),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "seen"), Value::Number(1.0));
    assert_eq!(global(&vm, "closed"), Value::Boolean(true));
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn test_switch_fallthrough_and_default() {
    let pick = |x: f64| {
        vec![
            build::var("out", build::str("")),
            ast::Statement::Switch(ast::SwitchStatement {
                discriminant: build::num(x),
                cases: vec![
                    ast::SwitchCase {
                        test: Some(build::num(1.0)),
                        consequent: vec![build::expr(build::assign(
                            "out",
                            build::add(build::id("out"), build::str("one")),
                        ))],
                    },
                    ast::SwitchCase {
                        test: Some(build::num(2.0)),
                        consequent: vec![
                            build::expr(build::assign(
                                "out",
                                build::add(build::id("out"), build::str("two")),
                            )),
                            build::brk(),
                        ],
                    },
                    ast::SwitchCase {
                        test: None,
                        consequent: vec![build::expr(build::assign("out", build::str("other")))],
                    },
                ],
                pos: 0,
            }),
            build::expr(build::id("out")),
        ]
    };
    assert_eq!(eval(pick(1.0)), Value::string("onetwo"));
    assert_eq!(eval(pick(2.0)), Value::string("two"));
    assert_eq!(eval(pick(9.0)), Value::string("other"));
}

#[test]
fn test_labeled_continue_crosses_inner_loop() {
    let mut vm = Vm::new();
    let inner_body = build::block(vec![
        build::expr(build::assign("hits", build::add(build::id("hits"), build::num(1.0)))),
        build::if_(
            strict_eq(build::id("j"), build::num(1.0)),
            ast::Statement::Continue(ast::ContinueStatement {
                label: Some("outer".to_string()),
                pos: 0,
            }),
        ),
    ]);
    let inner = build::for_(
        Some(ast::ForInit::Declaration(Box::new(ast::VariableDeclaration {
            kind: ast::VariableKind::Var,
            declarations: vec![ast::VariableDeclarator {
                id: ast::Pattern::Identifier(build::ident("j")),
                init: Some(build::num(0.0)),
                pos: 0,
            }],
            pos: 0,
        }))),
        Some(lt(build::id("j"), build::num(3.0))),
        Some(build::assign("j", build::add(build::id("j"), build::num(1.0)))),
        inner_body,
    );
    let outer = ast::Statement::Labeled(ast::LabeledStatement {
        label: "outer".to_string(),
        body: Box::new(build::for_(
            Some(ast::ForInit::Declaration(Box::new(ast::VariableDeclaration {
                kind: ast::VariableKind::Var,
                declarations: vec![ast::VariableDeclarator {
                    id: ast::Pattern::Identifier(build::ident("i")),
                    init: Some(build::num(0.0)),
                    pos: 0,
                }],
                pos: 0,
            }))),
            Some(lt(build::id("i"), build::num(3.0))),
            Some(build::assign("i", build::add(build::id("i"), build::num(1.0)))),
            inner,
        )),
        pos: 0,
    });
    eval_in(&mut vm, vec![build::var("hits", build::num(0.0)), outer]).unwrap();
    assert_eq!(global(&vm, "hits"), Value::Number(6.0));
}

// ============================================================================
// Destructuring
// ============================================================================

#[test]
fn test_array_and_object_destructuring() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::decl_pattern(
                ast::VariableKind::Let,
                build::array_pattern(&["a", "b"]),
                build::array(vec![build::num(10.0), build::num(20.0)]),
            ),
            build::decl_pattern(
                ast::VariableKind::Const,
                build::object_pattern(&[("x", "px"), ("y", "py")]),
                build::object(vec![("x", build::num(1.0)), ("y", build::num(2.0))]),
            ),
            build::expr(build::assign("ra", build::id("a"))),
            build::expr(build::assign("rb", build::id("b"))),
            build::expr(build::assign("rx", build::id("px"))),
            build::expr(build::assign("ry", build::id("py"))),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "ra"), Value::Number(10.0));
    assert_eq!(global(&vm, "rb"), Value::Number(20.0));
    assert_eq!(global(&vm, "rx"), Value::Number(1.0));
    assert_eq!(global(&vm, "ry"), Value::Number(2.0));
}

// ============================================================================
// Dynamic scopes
// ============================================================================

#[test]
fn test_with_reads_and_writes_route_through_object() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("o", build::object(vec![("x", build::num(1.0))])),
            build::var("before", build::num(0.0)),
            ast::Statement::With(ast::WithStatement {
                object: build::id("o"),
                body: Box::new(build::block(vec![
                    build::expr(build::assign("before", build::id("x"))),
                    build::expr(build::assign("x", build::num(42.0))),
                ])),
                pos: 0,
            }),
            build::var("after", build::member(build::id("o"), "x")),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "before"), Value::Number(1.0));
    assert_eq!(global(&vm, "after"), Value::Number(42.0));
}

#[test]
fn test_with_falls_through_to_outer_bindings() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("o", build::object(vec![])),
            build::var("y", build::num(7.0)),
            build::var("r", build::num(0.0)),
            ast::Statement::With(ast::WithStatement {
                object: build::id("o"),
                body: Box::new(build::expr(build::assign("r", build::id("y")))),
                pos: 0,
            }),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::Number(7.0));
}

// ============================================================================
// Objects, classes, private members
// ============================================================================

#[test]
fn test_new_prototype_and_instanceof() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::func_decl(
                "Point",
                &["x"],
                vec![build::expr(build::assign_to(
                    ast::AssignmentTarget::Member(build::member_expr(build::this(), "x")),
                    ast::AssignmentOperator::Assign,
                    build::id("x"),
                ))],
            ),
            build::expr(build::assign_to(
                ast::AssignmentTarget::Member(build::member_expr(
                    build::member(build::id("Point"), "prototype"),
                    "getX",
                )),
                ast::AssignmentOperator::Assign,
                build::func_expr(&[], vec![build::ret(build::member(build::this(), "x"))]),
            )),
            build::var("p", build::new_(build::id("Point"), vec![build::num(3.0)])),
            build::var("r", build::call(build::member(build::id("p"), "getX"), vec![])),
            build::var(
                "isInstance",
                build::binary(ast::BinaryOperator::InstanceOf, build::id("p"), build::id("Point")),
            ),
            build::var(
                "plainIsNot",
                build::binary(
                    ast::BinaryOperator::InstanceOf,
                    build::object(vec![]),
                    build::id("Point"),
                ),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::Number(3.0));
    assert_eq!(global(&vm, "isInstance"), Value::Boolean(true));
    assert_eq!(global(&vm, "plainIsNot"), Value::Boolean(false));
}

fn counter_class() -> ast::Statement {
    let increment = build::function(
        None,
        &[],
        vec![
            build::expr(build::assign_to(
                ast::AssignmentTarget::PrivateMember(ast::PrivateMemberExpression {
                    object: Box::new(build::this()),
                    name: "count".to_string(),
                    pos: 0,
                }),
                ast::AssignmentOperator::Assign,
                build::add(
                    build::private_member(build::this(), "count"),
                    build::private_member(build::this(), "step"),
                ),
            )),
            build::ret(build::private_member(build::this(), "count")),
        ],
    );
    let brand_check = build::function(
        None,
        &["obj"],
        vec![build::ret(ast::Expression::PrivateIn(ast::PrivateInExpression {
            name: "count".to_string(),
            object: Box::new(build::id("obj")),
            pos: 0,
        }))],
    );
    let ctor = build::function(
        None,
        &["step"],
        vec![build::expr(build::assign_to(
            ast::AssignmentTarget::PrivateMember(ast::PrivateMemberExpression {
                object: Box::new(build::this()),
                name: "step".to_string(),
                pos: 0,
            }),
            ast::AssignmentOperator::Assign,
            build::id("step"),
        ))],
    );
    ast::Statement::ClassDeclaration(ast::ClassDeclaration {
        id: build::ident("Counter"),
        class: ast::ClassLiteral {
            name: Some(build::ident("Counter")),
            members: vec![
                ast::ClassMember {
                    key: ast::ClassKey::Private("count".to_string()),
                    kind: ast::ClassMemberKind::Field(Some(build::num(0.0))),
                    is_static: false,
                    pos: 0,
                },
                ast::ClassMember {
                    key: ast::ClassKey::Private("step".to_string()),
                    kind: ast::ClassMemberKind::Field(None),
                    is_static: false,
                    pos: 0,
                },
                ast::ClassMember {
                    key: ast::ClassKey::Public("constructor".to_string()),
                    kind: ast::ClassMemberKind::Constructor(ctor),
                    is_static: false,
                    pos: 0,
                },
                ast::ClassMember {
                    key: ast::ClassKey::Public("increment".to_string()),
                    kind: ast::ClassMemberKind::Method(increment),
                    is_static: false,
                    pos: 0,
                },
                ast::ClassMember {
                    key: ast::ClassKey::Public("hasBrand".to_string()),
                    kind: ast::ClassMemberKind::Method(brand_check),
                    is_static: false,
                    pos: 0,
                },
            ],
            pos: 0,
        },
    })
}

#[test]
fn test_class_private_fields_and_methods() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            counter_class(),
            build::var("c", build::new_(build::id("Counter"), vec![build::num(2.0)])),
            build::var("r1", build::call(build::member(build::id("c"), "increment"), vec![])),
            build::var("r2", build::call(build::member(build::id("c"), "increment"), vec![])),
            build::var(
                "branded",
                build::call(build::member(build::id("c"), "hasBrand"), vec![build::id("c")]),
            ),
            build::var(
                "unbranded",
                build::call(
                    build::member(build::id("c"), "hasBrand"),
                    vec![build::object(vec![])],
                ),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r1"), Value::Number(2.0));
    assert_eq!(global(&vm, "r2"), Value::Number(4.0));
    assert_eq!(global(&vm, "branded"), Value::Boolean(true));
    assert_eq!(global(&vm, "unbranded"), Value::Boolean(false));
}

#[test]
fn test_private_access_on_foreign_object_faults() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            counter_class(),
            build::var("c", build::new_(build::id("Counter"), vec![build::num(1.0)])),
            build::var("r", build::str("")),
            // Borrow the method, call it with a plain object as `this`.
            build::var("stolen", build::member(build::id("c"), "increment")),
            build::var(
                "holder",
                build::object(vec![("m", build::id("stolen"))]),
            ),
            build::try_catch(
                vec![build::expr(build::call(
                    build::member(build::id("holder"), "m"),
                    vec![],
                ))],
                "e",
                vec![build::expr(build::assign("r", build::member(build::id("e"), "name")))],
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::string("TypeError"));
}

#[test]
fn test_class_constructor_requires_new() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            counter_class(),
            build::var("r", build::str("")),
            build::try_catch(
                vec![build::expr(build::call(build::id("Counter"), vec![build::num(1.0)]))],
                "e",
                vec![build::expr(build::assign("r", build::member(build::id("e"), "name")))],
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::string("TypeError"));
}

#[test]
fn test_new_target_distinguishes_construction() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::func_decl(
                "T",
                &[],
                vec![build::expr(build::assign(
                    "sawTarget",
                    build::binary(
                        ast::BinaryOperator::StrictNotEqual,
                        ast::Expression::NewTarget(0),
                        build::undefined(),
                    ),
                ))],
            ),
            build::expr(build::new_(build::id("T"), vec![])),
            build::var("viaNew", build::id("sawTarget")),
            build::expr(build::call(build::id("T"), vec![])),
            build::var("viaCall", build::id("sawTarget")),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "viaNew"), Value::Boolean(true));
    assert_eq!(global(&vm, "viaCall"), Value::Boolean(false));
}

// ============================================================================
// Optional chaining, arguments, misc operators
// ============================================================================

#[test]
fn test_optional_chaining_short_circuits_whole_chain() {
    let mut vm = Vm::new();
    let opt_member = |object: ast::Expression, name: &str| {
        ast::Expression::Member(ast::MemberExpression {
            object: Box::new(object),
            property: ast::MemberProperty::Identifier(name.to_string()),
            optional: true,
            pos: 0,
        })
    };
    eval_in(
        &mut vm,
        vec![
            build::var("o", build::null()),
            // o?.a.b: the non-optional .b must not fault when o is nullish.
            build::var("r1", build::member(opt_member(build::id("o"), "a"), "b")),
            build::var("m", build::object(vec![("f", build::func_expr(&[], vec![build::ret(build::num(5.0))]))])),
            build::var(
                "r2",
                ast::Expression::Call(ast::CallExpression {
                    callee: Box::new(ast::Expression::Member(ast::MemberExpression {
                        object: Box::new(build::id("m")),
                        property: ast::MemberProperty::Identifier("missing".to_string()),
                        optional: false,
                        pos: 0,
                    })),
                    arguments: vec![],
                    optional: true,
                    pos: 0,
                }),
            ),
            build::var("r3", build::call(build::member(build::id("m"), "f"), vec![])),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r1"), Value::Undefined);
    assert_eq!(global(&vm, "r2"), Value::Undefined);
    assert_eq!(global(&vm, "r3"), Value::Number(5.0));
}

#[test]
fn test_arguments_object_sees_actual_arguments() {
    let result = eval(vec![
        build::func_decl(
            "f",
            &["a"],
            vec![build::ret(build::add(
                build::member(build::id("arguments"), "length"),
                build::index(build::id("arguments"), build::num(1.0)),
            ))],
        ),
        build::expr(build::call(build::id("f"), vec![build::num(10.0), build::num(30.0)])),
    ]);
    // length 2 + arguments[1] 30
    assert_eq!(result, Value::Number(32.0));
}

#[test]
fn test_named_function_expression_self_reference() {
    // var fact = function self(n) { return n < 2 ? 1 : n * self(n - 1); };
    let result = eval(vec![
        build::var(
            "fact",
            ast::Expression::Function(build::function(
                Some("self"),
                &["n"],
                vec![build::ret(build::cond(
                    lt(build::id("n"), build::num(2.0)),
                    build::num(1.0),
                    build::binary(
                        ast::BinaryOperator::Multiply,
                        build::id("n"),
                        build::call(
                            build::id("self"),
                            vec![build::binary(
                                ast::BinaryOperator::Subtract,
                                build::id("n"),
                                build::num(1.0),
                            )],
                        ),
                    ),
                ))],
            )),
        ),
        build::expr(build::call(build::id("fact"), vec![build::num(5.0)])),
    ]);
    assert_eq!(result, Value::Number(120.0));
}

#[test]
fn test_delete_and_in_operators() {
    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("o", build::object(vec![("a", build::num(1.0))])),
            build::var(
                "d",
                build::unary(
                    ast::UnaryOperator::Delete,
                    build::member(build::id("o"), "a"),
                ),
            ),
            build::var(
                "has",
                build::binary(ast::BinaryOperator::In, build::str("a"), build::id("o")),
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "d"), Value::Boolean(true));
    assert_eq!(global(&vm, "has"), Value::Boolean(false));
}

#[test]
fn test_bigint_arithmetic_and_mixing_fault() {
    let result = eval(vec![build::expr(build::add(build::bigint(20), build::bigint(22)))]);
    assert_eq!(result, Value::bigint(num_bigint::BigInt::from(42)));

    let mut vm = Vm::new();
    eval_in(
        &mut vm,
        vec![
            build::var("r", build::str("")),
            build::try_catch(
                vec![build::expr(build::add(build::bigint(1), build::num(1.0)))],
                "e",
                vec![build::expr(build::assign("r", build::member(build::id("e"), "name")))],
            ),
        ],
    )
    .unwrap();
    assert_eq!(global(&vm, "r"), Value::string("TypeError"));
}

#[test]
fn test_strict_mode_rejects_undeclared_assignment() {
    let program = compiler::compile(&build::strict_program(vec![build::expr(build::assign(
        "undeclared",
        build::num(1.0),
    ))]))
    .unwrap();
    let error = Vm::new().run(&program).expect_err("strict assignment faults");
    match error {
        Error::Runtime(exception) => {
            let Value::Object(obj) = &exception.value else { panic!("expected an error object") };
            assert_eq!(obj.get("name"), Some(Value::string("ReferenceError")));
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

// ============================================================================
// Deferred jobs
// ============================================================================

fn defer(vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    match args.first() {
        Some(Value::Function(callable)) => {
            let rest = args[1..].to_vec();
            vm.context_mut().enqueue_job(callable.clone(), rest);
            Ok(Value::Undefined)
        }
        _ => Err(Value::string("defer requires a function")),
    }
}

#[test]
fn test_jobs_drain_fifo_after_run() {
    let mut vm = Vm::new();
    vm.context().set_global("defer", Value::native("defer", defer));
    let mut stmts = mark_prelude();
    stmts.extend(vec![
        build::expr(build::call(
            build::id("defer"),
            vec![build::func_expr(
                &[],
                vec![
                    build::expr(build::call(build::id("mark"), vec![build::str("job1")])),
                    build::throw(build::str("job failure")),
                ],
            )],
        )),
        build::expr(build::call(
            build::id("defer"),
            vec![build::func_expr(
                &[],
                vec![build::expr(build::call(build::id("mark"), vec![build::str("job2")]))],
            )],
        )),
        build::expr(build::call(build::id("mark"), vec![build::str("main")])),
    ]);
    let program = compiler::compile(&build::program(stmts)).unwrap();
    vm.run_protected(&program).unwrap();
    // Jobs ran after the synchronous code, in order, and the first job's
    // exception did not stop the second.
    assert_eq!(global_strings(&vm, "log"), vec!["main", "job1", "job2"]);
}

#[test]
fn test_jobs_enqueued_by_jobs_run_in_same_drain() {
    let mut vm = Vm::new();
    vm.context().set_global("defer", Value::native("defer", defer));
    let mut stmts = mark_prelude();
    stmts.push(build::expr(build::call(
        build::id("defer"),
        vec![build::func_expr(
            &[],
            vec![
                build::expr(build::call(build::id("mark"), vec![build::str("outer")])),
                build::expr(build::call(
                    build::id("defer"),
                    vec![build::func_expr(
                        &[],
                        vec![build::expr(build::call(
                            build::id("mark"),
                            vec![build::str("inner")],
                        ))],
                    )],
                )),
            ],
        )],
    )));
    let program = compiler::compile(&build::program(stmts)).unwrap();
    vm.run_protected(&program).unwrap();
    assert_eq!(global_strings(&vm, "log"), vec!["outer", "inner"]);
}

// ============================================================================
// Program sharing
// ============================================================================

#[test]
fn test_program_runs_concurrently_on_independent_vms() {
    let program = compile(vec![
        build::func_decl(
            "fib",
            &["n"],
            vec![build::ret(build::cond(
                lt(build::id("n"), build::num(2.0)),
                build::id("n"),
                build::add(
                    build::call(
                        build::id("fib"),
                        vec![build::binary(
                            ast::BinaryOperator::Subtract,
                            build::id("n"),
                            build::num(1.0),
                        )],
                    ),
                    build::call(
                        build::id("fib"),
                        vec![build::binary(
                            ast::BinaryOperator::Subtract,
                            build::id("n"),
                            build::num(2.0),
                        )],
                    ),
                ),
            ))],
        ),
        build::expr(build::call(build::id("fib"), vec![build::num(15.0)])),
    ]);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let program = program.clone();
            std::thread::spawn(move || Vm::new().run(&program).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Value::Number(610.0));
    }
}

#[test]
fn test_completion_value_of_last_statement() {
    assert_eq!(
        eval(vec![
            build::var("x", build::num(2.0)),
            build::expr(build::binary(
                ast::BinaryOperator::Multiply,
                build::id("x"),
                build::num(21.0),
            )),
        ]),
        Value::Number(42.0)
    );
}

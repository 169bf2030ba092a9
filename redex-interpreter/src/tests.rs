// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::sync::Arc;

use redex::core::{FunctionId, InstructionPointer, TaskId};
use redex_compiler::bytecode::BytecodeModule;
use redex_compiler::program::{Instruction, Program};
use redex_compiler::syntax::{Binding, Module, SNode, Scomb};
use redex_compiler::{Compiler, CompilerOptions};
use redex::stdlib::Builtin;

use super::*;

fn compile(module: Module) -> Arc<BytecodeModule> {
    Arc::new(
        Compiler::new(CompilerOptions::default())
            .compile(module)
            .unwrap(),
    )
}

fn machine(module: Module) -> Machine {
    Machine::new(
        compile(module),
        TaskId(0),
        1,
        InterpreterOptions::default(),
    )
}

fn run(module: Module) -> (Value, Machine) {
    let mut machine = machine(module);
    let result = machine.run_to_completion().unwrap();
    let value = machine.read_back(result);
    (value, machine)
}

fn function_id(machine: &Machine, name: &str) -> FunctionId {
    (0..machine.module().functions.len())
        .map(FunctionId::from)
        .find(|id| machine.module().function_name(*id) == Some(name))
        .unwrap()
}

/// A definition that fails the whole task if anything ever forces it
fn bomb() -> Scomb {
    Scomb::new(
        "bomb",
        [] as [&str; 0],
        SNode::app(SNode::builtin(Builtin::Error), SNode::string("boom")),
    )
}

#[test]
fn basic_operation() {
    let module = BytecodeModule {
        instructions: Program::new([
            Instruction::Begin,
            Instruction::PushNumber { value: 3.0.into() },
            Instruction::Eval { offset: 0 },
            Instruction::Resolve { offset: 0 },
            Instruction::End,
        ]),
        locations: Vec::new(),
        functions: Vec::new(),
        strings: Vec::new(),
        entry: InstructionPointer::default(),
        evaldo: InstructionPointer::default(),
    };
    let mut machine = Machine::new(
        Arc::new(module),
        TaskId(0),
        1,
        InterpreterOptions::default(),
    );
    let result = machine.run_to_completion().unwrap();
    assert_eq!(machine.read_back(result), Value::Number(3.0));
}

#[test]
fn nested_arithmetic() {
    let mut module = Module::default();
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(
            SNode::builtin(Builtin::Add),
            [
                SNode::apps(
                    SNode::builtin(Builtin::Multiply),
                    [SNode::number(2.0), SNode::number(3.0)],
                ),
                SNode::number(1.0),
            ],
        ),
    ));
    let (value, _) = run(module);
    assert_eq!(value, Value::Number(7.0));
}

#[test]
fn twice_applies_its_function_twice_with_one_outer_update() {
    // twice f x = f (f x); inc n = + n 1; main = twice inc 3
    let mut module = Module::default();
    module.add(Scomb::new(
        "inc",
        ["n"],
        SNode::apps(
            SNode::builtin(Builtin::Add),
            [SNode::symbol("n"), SNode::number(1.0)],
        ),
    ));
    module.add(Scomb::new(
        "twice",
        ["f", "x"],
        SNode::app(
            SNode::symbol("f"),
            SNode::app(SNode::symbol("f"), SNode::symbol("x")),
        ),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(
            SNode::scref("twice"),
            [SNode::scref("inc"), SNode::number(3.0)],
        ),
    ));
    let (value, machine) = run(module);
    assert_eq!(value, Value::Number(5.0));
    let inc = function_id(&machine, "inc");
    let twice = function_id(&machine, "twice");
    assert_eq!(machine.stats.calls(inc), 2);
    assert_eq!(machine.stats.calls(twice), 1);
}

#[test]
fn shared_thunks_reduce_once() {
    // slow x = * x 2; main = letrec t = slow 3 in if nil 0 (+ t t)
    // The conditional keeps t lazy, so both forces hit the same suspended
    // frame; the second must observe the indirection left by the first
    let mut module = Module::default();
    module.add(Scomb::new(
        "slow",
        ["x"],
        SNode::apps(
            SNode::builtin(Builtin::Multiply),
            [SNode::symbol("x"), SNode::number(2.0)],
        ),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::letrec(
            [Binding::new(
                "t",
                SNode::app(SNode::scref("slow"), SNode::number(3.0)),
            )],
            SNode::apps(
                SNode::builtin(Builtin::If),
                [
                    SNode::nil(),
                    SNode::number(0.0),
                    SNode::apps(
                        SNode::builtin(Builtin::Add),
                        [SNode::symbol("t"), SNode::symbol("t")],
                    ),
                ],
            ),
        ),
    ));
    let (value, machine) = run(module);
    assert_eq!(value, Value::Number(12.0));
    let slow = function_id(&machine, "slow");
    assert_eq!(
        machine.stats.calls(slow),
        1,
        "second force must observe the indirection"
    );
}

#[test]
fn lazy_constructor_arguments_are_never_forced() {
    // main = head (cons 42 bomb)
    let mut module = Module::default();
    module.add(bomb());
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::app(
            SNode::builtin(Builtin::Head),
            SNode::apps(
                SNode::builtin(Builtin::Cons),
                [SNode::number(42.0), SNode::scref("bomb")],
            ),
        ),
    ));
    let (value, _) = run(module);
    assert_eq!(value, Value::Number(42.0));
}

#[test]
fn branch_only_usage_is_not_strict() {
    // f x y = if x (+ y 1) 7; main = f nil bomb
    let mut module = Module::default();
    module.add(bomb());
    module.add(Scomb::new(
        "f",
        ["x", "y"],
        SNode::apps(
            SNode::builtin(Builtin::If),
            [
                SNode::symbol("x"),
                SNode::apps(
                    SNode::builtin(Builtin::Add),
                    [SNode::symbol("y"), SNode::number(1.0)],
                ),
                SNode::number(7.0),
            ],
        ),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(SNode::scref("f"), [SNode::nil(), SNode::scref("bomb")]),
    ));
    let (value, _) = run(module);
    assert_eq!(value, Value::Number(7.0));
}

fn len_scomb() -> Scomb {
    // len xs = if (nil? xs) 0 (+ 1 (len (tail xs)))
    Scomb::new(
        "len",
        ["xs"],
        SNode::apps(
            SNode::builtin(Builtin::If),
            [
                SNode::app(SNode::builtin(Builtin::IsNil), SNode::symbol("xs")),
                SNode::number(0.0),
                SNode::apps(
                    SNode::builtin(Builtin::Add),
                    [
                        SNode::number(1.0),
                        SNode::app(
                            SNode::scref("len"),
                            SNode::app(SNode::builtin(Builtin::Tail), SNode::symbol("xs")),
                        ),
                    ],
                ),
            ],
        ),
    )
}

#[test]
fn length_traversal_does_not_force_elements() {
    // main = len [bomb, bomb, bomb]
    let mut module = Module::default();
    module.add(bomb());
    module.add(len_scomb());
    let list = [(); 3].iter().fold(SNode::nil(), |tail, _| {
        SNode::apps(SNode::builtin(Builtin::Cons), [SNode::scref("bomb"), tail])
    });
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::app(SNode::scref("len"), list),
    ));
    let (value, _) = run(module);
    assert_eq!(value, Value::Number(3.0));
}

#[test]
fn cyclic_lists_are_traversable() {
    // main = letrec xs = cons 1 (cons 2 xs) in head (tail (tail xs))
    let mut module = Module::default();
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::letrec(
            [Binding::new(
                "xs",
                SNode::apps(
                    SNode::builtin(Builtin::Cons),
                    [
                        SNode::number(1.0),
                        SNode::apps(
                            SNode::builtin(Builtin::Cons),
                            [SNode::number(2.0), SNode::symbol("xs")],
                        ),
                    ],
                ),
            )],
            SNode::app(
                SNode::builtin(Builtin::Head),
                SNode::app(
                    SNode::builtin(Builtin::Tail),
                    SNode::app(SNode::builtin(Builtin::Tail), SNode::symbol("xs")),
                ),
            ),
        ),
    ));
    let (value, _) = run(module);
    assert_eq!(value, Value::Number(1.0));
}

#[test]
fn par_sparks_parallel_work() {
    // dub x = * x 2; main = letrec t = dub 21 in par t (+ t 0)
    let mut module = Module::default();
    module.add(Scomb::new(
        "dub",
        ["x"],
        SNode::apps(
            SNode::builtin(Builtin::Multiply),
            [SNode::symbol("x"), SNode::number(2.0)],
        ),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::letrec(
            [Binding::new(
                "t",
                SNode::app(SNode::scref("dub"), SNode::number(21.0)),
            )],
            SNode::apps(
                SNode::builtin(Builtin::Par),
                [
                    SNode::symbol("t"),
                    SNode::apps(
                        SNode::builtin(Builtin::Add),
                        [SNode::symbol("t"), SNode::number(0.0)],
                    ),
                ],
            ),
        ),
    ));
    let (value, machine) = run(module);
    assert_eq!(value, Value::Number(42.0));
    assert_eq!(machine.stats.nsparks, 1);
}

#[test]
fn partial_applications_saturate_through_dispatch() {
    // plus a b = + a b; apply f = f 4; main = apply (plus 1)
    let mut module = Module::default();
    module.add(Scomb::new(
        "plus",
        ["a", "b"],
        SNode::apps(
            SNode::builtin(Builtin::Add),
            [SNode::symbol("a"), SNode::symbol("b")],
        ),
    ));
    module.add(Scomb::new(
        "apply",
        ["f"],
        SNode::app(SNode::symbol("f"), SNode::number(4.0)),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::app(
            SNode::scref("apply"),
            SNode::app(SNode::scref("plus"), SNode::number(1.0)),
        ),
    ));
    let (value, _) = run(module);
    assert_eq!(value, Value::Number(5.0));
}

#[test]
fn over_application_dispatches_the_returned_function() {
    // minus a b = - a b; plus a b = + a b;
    // choose n = if (== n 0) minus plus; main = choose 0 7 2
    let mut module = Module::default();
    module.add(Scomb::new(
        "minus",
        ["a", "b"],
        SNode::apps(
            SNode::builtin(Builtin::Subtract),
            [SNode::symbol("a"), SNode::symbol("b")],
        ),
    ));
    module.add(Scomb::new(
        "plus",
        ["a", "b"],
        SNode::apps(
            SNode::builtin(Builtin::Add),
            [SNode::symbol("a"), SNode::symbol("b")],
        ),
    ));
    module.add(Scomb::new(
        "choose",
        ["n"],
        SNode::apps(
            SNode::builtin(Builtin::If),
            [
                SNode::apps(
                    SNode::builtin(Builtin::Eq),
                    [SNode::symbol("n"), SNode::number(0.0)],
                ),
                SNode::scref("minus"),
                SNode::scref("plus"),
            ],
        ),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(
            SNode::scref("choose"),
            [SNode::number(0.0), SNode::number(7.0), SNode::number(2.0)],
        ),
    ));
    let (value, _) = run(module);
    assert_eq!(value, Value::Number(5.0));
}

#[test]
fn collection_pressure_does_not_disturb_evaluation() {
    // build n = if (== n 0) nil (cons n (build (- n 1)))
    // sum xs = if (nil? xs) 0 (+ (head xs) (sum (tail xs)))
    // main = sum (build 50)
    let mut module = Module::default();
    module.add(Scomb::new(
        "build",
        ["n"],
        SNode::apps(
            SNode::builtin(Builtin::If),
            [
                SNode::apps(
                    SNode::builtin(Builtin::Eq),
                    [SNode::symbol("n"), SNode::number(0.0)],
                ),
                SNode::nil(),
                SNode::apps(
                    SNode::builtin(Builtin::Cons),
                    [
                        SNode::symbol("n"),
                        SNode::app(
                            SNode::scref("build"),
                            SNode::apps(
                                SNode::builtin(Builtin::Subtract),
                                [SNode::symbol("n"), SNode::number(1.0)],
                            ),
                        ),
                    ],
                ),
            ],
        ),
    ));
    module.add(Scomb::new(
        "sum",
        ["xs"],
        SNode::apps(
            SNode::builtin(Builtin::If),
            [
                SNode::app(SNode::builtin(Builtin::IsNil), SNode::symbol("xs")),
                SNode::number(0.0),
                SNode::apps(
                    SNode::builtin(Builtin::Add),
                    [
                        SNode::app(SNode::builtin(Builtin::Head), SNode::symbol("xs")),
                        SNode::app(
                            SNode::scref("sum"),
                            SNode::app(SNode::builtin(Builtin::Tail), SNode::symbol("xs")),
                        ),
                    ],
                ),
            ],
        ),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::app(
            SNode::scref("sum"),
            SNode::app(SNode::scref("build"), SNode::number(50.0)),
        ),
    ));
    let mut machine = Machine::new(
        compile(module),
        TaskId(0),
        1,
        InterpreterOptions {
            collect_threshold: 64,
            ..InterpreterOptions::default()
        },
    );
    let result = machine.run_to_completion().unwrap();
    assert_eq!(machine.read_back(result), Value::Number(1275.0));
    assert!(machine.heap.collections() > 0);
}

#[test]
fn division_by_zero_is_fatal() {
    let mut module = Module::default();
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(
            SNode::builtin(Builtin::Divide),
            [SNode::number(1.0), SNode::number(0.0)],
        ),
    ));
    let mut machine = machine(module);
    let error = machine.run_to_completion().err().unwrap();
    assert!(error.contains("Division by zero"), "{}", error);
}

#[test]
fn error_primitive_halts_the_task() {
    let mut module = Module::default();
    module.add(bomb());
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::scref("bomb"),
    ));
    let mut machine = machine(module);
    let error = machine.run_to_completion().err().unwrap();
    assert!(error.contains("boom"), "{}", error);
}

#[test]
fn arithmetic_on_non_numbers_is_fatal() {
    let mut module = Module::default();
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(
            SNode::builtin(Builtin::Add),
            [SNode::nil(), SNode::number(1.0)],
        ),
    ));
    let mut machine = machine(module);
    let error = machine.run_to_completion().err().unwrap();
    assert!(error.contains("must be a number"), "{}", error);
}

#[test]
fn conditional_on_partial_application_is_fatal() {
    // main = if (plus 1) 1 2
    let mut module = Module::default();
    module.add(Scomb::new(
        "plus",
        ["a", "b"],
        SNode::apps(
            SNode::builtin(Builtin::Add),
            [SNode::symbol("a"), SNode::symbol("b")],
        ),
    ));
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(
            SNode::builtin(Builtin::If),
            [
                SNode::app(SNode::scref("plus"), SNode::number(1.0)),
                SNode::number(1.0),
                SNode::number(2.0),
            ],
        ),
    ));
    let mut machine = machine(module);
    let error = machine.run_to_completion().err().unwrap();
    assert!(error.contains("incomplete function application"), "{}", error);
}

#[test]
fn lists_read_back_structurally() {
    let mut module = Module::default();
    module.add(Scomb::new(
        "main",
        [] as [&str; 0],
        SNode::apps(
            SNode::builtin(Builtin::Cons),
            [
                SNode::number(1.0),
                SNode::apps(
                    SNode::builtin(Builtin::Cons),
                    [SNode::number(2.0), SNode::nil()],
                ),
            ],
        ),
    ));
    let (value, _) = run(module);
    assert_eq!(
        value,
        Value::list([Value::Number(1.0), Value::Number(2.0)])
    );
}

#[test]
fn array_chunks_behave_like_cons_spines() {
    use redex::cell::{CellArray, CellValue};
    let mut module = Module::default();
    module.add(Scomb::new("main", [] as [&str; 0], SNode::number(0.0)));
    let mut machine = machine(module);
    let nil = machine.nil_ptr();
    let elements = (1..=5)
        .map(|value| machine.heap.alloc(CellValue::Number(value as f64)))
        .collect::<Vec<_>>();
    let array = machine
        .heap
        .alloc(CellValue::Array(CellArray::new(elements, nil)));
    assert_eq!(
        machine.read_back(array),
        Value::list((1..=5).map(|value| Value::Number(value as f64)))
    );
}

// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use redex::core::{FunctionId, InstructionPointer};
use redex::hash::FnvHashMap;
use redex::stdlib::Builtin;

use crate::bytecode::BytecodeModule;
use crate::program::{FunInfo, Instruction, Program};
use crate::renaming::real_name;
use crate::syntax::{Binding, Module, SNode, SNodeKind, SourceLoc};
use crate::CompilerOptions;

/// String literal pool builder with de-duplication
#[derive(Default)]
struct StringPool {
    strings: Vec<String>,
    index: FnvHashMap<String, usize>,
}
impl StringPool {
    fn add(&mut self, value: &str) -> usize {
        if let Some(existing) = self.index.get(value) {
            return *existing;
        }
        let index = self.strings.len();
        self.strings.push(String::from(value));
        self.index.insert(String::from(value), index);
        index
    }
    fn into_strings(self) -> Vec<String> {
        self.strings
    }
}

type Label = usize;

/// Instruction emitter with label backpatching and a static model of the
/// local stack depth, used to compute each function's frame size
struct Emitter {
    program: Program,
    locs: Vec<SourceLoc>,
    depth: usize,
    max_depth: usize,
    labels: Vec<Option<InstructionPointer>>,
    patches: Vec<(usize, Label)>,
}
impl Emitter {
    fn new() -> Self {
        Self {
            program: Program::default(),
            locs: Vec::new(),
            depth: 0,
            max_depth: 0,
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }
    fn next_address(&self) -> InstructionPointer {
        self.program.next_address()
    }
    fn depth(&self) -> usize {
        self.depth
    }
    fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
        self.max_depth = self.max_depth.max(depth);
    }
    fn begin_function(&mut self, arity: usize) {
        self.depth = arity;
        self.max_depth = arity;
    }
    fn take_max_depth(&mut self) -> usize {
        self.max_depth
    }
    fn emit(&mut self, instruction: Instruction, loc: SourceLoc) {
        let depth = match &instruction {
            Instruction::Begin | Instruction::End => self.depth,
            Instruction::GlobStart { arity, .. } => *arity,
            Instruction::Return
            | Instruction::Do { .. }
            | Instruction::JFun { .. }
            | Instruction::Jump { .. }
            | Instruction::Eval { .. }
            | Instruction::Resolve { .. } => self.depth,
            Instruction::JFalse { .. } => self.depth - 1,
            Instruction::Push { .. }
            | Instruction::PushNil
            | Instruction::PushNumber { .. }
            | Instruction::PushString { .. } => self.depth + 1,
            Instruction::Update { .. } => self.depth - 1,
            Instruction::Alloc { count } => self.depth + count,
            Instruction::Squeeze { remove, .. } => self.depth - remove,
            Instruction::Pop { count } => self.depth - count,
            Instruction::MkCap { num_args, .. } | Instruction::MkFrame { num_args, .. } => {
                self.depth + 1 - num_args
            }
            Instruction::Bif { target } => self.depth + 1 - target.nargs(),
        };
        self.program.push(instruction);
        self.locs.push(loc);
        self.set_depth(depth);
    }
    /// Force the value at the given offset: an EVAL is always paired with
    /// a RESOLVE normalizing the slot once the value is available
    fn eval(&mut self, offset: usize, loc: SourceLoc) {
        self.emit(Instruction::Eval { offset }, loc);
        self.emit(Instruction::Resolve { offset }, loc);
    }
    fn new_label(&mut self) -> Label {
        let label = self.labels.len();
        self.labels.push(None);
        label
    }
    fn bind_label(&mut self, label: Label) {
        self.labels[label] = Some(self.next_address());
    }
    fn jump(&mut self, label: Label, loc: SourceLoc) {
        self.patches.push((self.program.len(), label));
        self.emit(
            Instruction::Jump {
                target: InstructionPointer::new(usize::MAX),
            },
            loc,
        );
    }
    fn jfalse(&mut self, label: Label, loc: SourceLoc) {
        self.patches.push((self.program.len(), label));
        self.emit(
            Instruction::JFalse {
                target: InstructionPointer::new(usize::MAX),
            },
            loc,
        );
    }
    fn patch_labels(&mut self) -> Result<(), String> {
        for (index, label) in self.patches.drain(..) {
            let target = self.labels[label]
                .ok_or_else(|| format!("Unbound label {} at instruction {:x}", label, index))?;
            match self.program.get_mut(InstructionPointer::new(index)) {
                Some(Instruction::Jump { target: slot }) => *slot = target,
                Some(Instruction::JFalse { target: slot }) => *slot = target,
                other => {
                    return Err(format!(
                        "Label patch target is not a jump: {:?}",
                        other
                    ))
                }
            }
        }
        Ok(())
    }
}

struct FunctionInfo {
    id: FunctionId,
    arity: usize,
    strict_params: Vec<bool>,
}

struct Ctx<'a> {
    module: &'a Module,
    functions: FnvHashMap<String, FunctionInfo>,
    strings: StringPool,
    /// Positional environment: maps a variable to its 1-based index from
    /// the bottom of the frame's local stack. The offset of a variable at
    /// depth `n` is `n - index`.
    pmap: Vec<(String, usize)>,
}
impl<'a> Ctx<'a> {
    fn presolve(&self, name: &str, loc: SourceLoc) -> Result<usize, String> {
        self.pmap
            .iter()
            .rev()
            .find(|(existing, _)| existing == name)
            .map(|(_, index)| *index)
            .ok_or_else(|| format!("{}: Unknown variable: {}", loc, real_name(name)))
    }
}

enum Callable {
    Function {
        id: FunctionId,
        arity: usize,
        strict_params: Vec<bool>,
    },
    Primitive(Builtin),
}
impl Callable {
    fn id(&self) -> FunctionId {
        match self {
            Self::Function { id, .. } => *id,
            Self::Primitive(builtin) => builtin.function_id(),
        }
    }
    fn arity(&self) -> usize {
        match self {
            Self::Function { arity, .. } => *arity,
            Self::Primitive(builtin) => builtin.nargs(),
        }
    }
}

fn resolve_callable(ctx: &Ctx, node: &SNode) -> Result<Option<Callable>, String> {
    match &node.kind {
        SNodeKind::ScRef(name) => {
            let info = ctx
                .functions
                .get(name)
                .ok_or_else(|| format!("{}: Unknown function: {}", node.loc, real_name(name)))?;
            Ok(Some(Callable::Function {
                id: info.id,
                arity: info.arity,
                strict_params: info.strict_params.clone(),
            }))
        }
        SNodeKind::Builtin(builtin) => Ok(Some(Callable::Primitive(*builtin))),
        _ => Ok(None),
    }
}

/// Arguments along an application spine, outermost first (the outermost
/// argument is the function's last), with their strictness flags
fn spine_args(node: &SNode) -> Vec<(&SNode, bool)> {
    let mut args = Vec::new();
    let mut current = node;
    while let SNodeKind::Application {
        function,
        argument,
        strict,
    } = &current.kind
    {
        args.push((argument.as_ref(), *strict));
        current = function;
    }
    args
}

fn letrecs_used(value: &SNode, bindings: &[Binding]) -> usize {
    let used = value.free_vars();
    bindings
        .iter()
        .filter(|binding| used.iter().any(|name| *name == binding.name))
        .count()
}

/// Lazy construction scheme: build an unevaluated graph fragment on the
/// stack without forcing it
fn compile_c(e: &mut Emitter, ctx: &mut Ctx, node: &SNode, n: usize) -> Result<(), String> {
    match &node.kind {
        SNodeKind::Application { .. } => {
            let args = spine_args(node);
            let m = args.len();
            for (index, (arg, _)) in args.iter().enumerate() {
                compile_c(e, ctx, arg, n + index)?;
            }
            let head = node.spine_head();
            let callable = resolve_callable(ctx, head)?.ok_or_else(|| {
                format!("{}: constant cannot be applied to arguments", head.loc)
            })?;
            let k = callable.arity();
            if m > k {
                return Err(format!(
                    "{}: Over-saturated application survived lifting",
                    node.loc
                ));
            }
            if m == k {
                e.emit(
                    Instruction::MkFrame {
                        target: callable.id(),
                        num_args: k,
                    },
                    node.loc,
                );
            } else {
                e.emit(
                    Instruction::MkCap {
                        target: callable.id(),
                        num_args: m,
                    },
                    node.loc,
                );
            }
            Ok(())
        }
        SNodeKind::ScRef(_) | SNodeKind::Builtin(_) => {
            let callable = resolve_callable(ctx, node)?.unwrap();
            if callable.arity() == 0 {
                e.emit(
                    Instruction::MkFrame {
                        target: callable.id(),
                        num_args: 0,
                    },
                    node.loc,
                );
            } else {
                e.emit(
                    Instruction::MkCap {
                        target: callable.id(),
                        num_args: 0,
                    },
                    node.loc,
                );
            }
            Ok(())
        }
        SNodeKind::Symbol(name) => {
            let index = ctx.presolve(name, node.loc)?;
            e.emit(Instruction::Push { offset: n - index }, node.loc);
            Ok(())
        }
        SNodeKind::Nil => {
            e.emit(Instruction::PushNil, node.loc);
            Ok(())
        }
        SNodeKind::Number(value) => {
            e.emit(
                Instruction::PushNumber {
                    value: (*value).into(),
                },
                node.loc,
            );
            Ok(())
        }
        SNodeKind::Str(value) => {
            let index = ctx.strings.add(value);
            e.emit(Instruction::PushString { index }, node.loc);
            Ok(())
        }
        SNodeKind::Letrec { bindings, body } => {
            let saved = ctx.pmap.len();
            compile_letrec(e, ctx, bindings, n, false)?;
            let count = ctx.pmap.len() - saved;
            compile_c(e, ctx, body, n + count)?;
            e.emit(
                Instruction::Squeeze {
                    count: 1,
                    remove: count,
                },
                node.loc,
            );
            ctx.pmap.truncate(saved);
            Ok(())
        }
        SNodeKind::Lambda { .. } => Err(format!(
            "{}: Lambda survived lifting",
            node.loc
        )),
    }
}

/// Letrec construction: leading strict bindings free of forward
/// dependencies are evaluated directly; the rest allocate placeholder
/// holes which are updated in place once their graphs exist
fn compile_letrec(
    e: &mut Emitter,
    ctx: &mut Ctx,
    bindings: &[Binding],
    n: usize,
    strict_context: bool,
) -> Result<(), String> {
    for (index, binding) in bindings.iter().enumerate() {
        ctx.pmap.push((binding.name.clone(), n + index + 1));
    }
    let mut n = n;
    let mut next = 0;
    if strict_context {
        while next < bindings.len() {
            let binding = &bindings[next];
            if binding.strict && letrecs_used(&binding.value, &bindings[next..]) == 0 {
                compile_e(e, ctx, &binding.value, n)?;
                n += 1;
                next += 1;
            } else {
                break;
            }
        }
    }
    let remaining = bindings.len() - next;
    if remaining == 0 {
        return Ok(());
    }
    e.emit(
        Instruction::Alloc { count: remaining },
        bindings[next].value.loc,
    );
    n += remaining;
    for (index, binding) in bindings.iter().enumerate().skip(next) {
        if strict_context && binding.strict && letrecs_used(&binding.value, &bindings[index..]) == 0
        {
            compile_e(e, ctx, &binding.value, n)?;
        } else {
            compile_c(e, ctx, &binding.value, n)?;
        }
        let target = ctx.presolve(&binding.name, binding.value.loc)?;
        e.emit(
            Instruction::Update {
                offset: n + 1 - target,
            },
            binding.value.loc,
        );
    }
    Ok(())
}

/// Forced evaluation scheme: like the lazy scheme followed by a forced
/// EVAL, with a fast path that computes fully-saturated builtin and
/// strict applications directly rather than constructing then evaluating
fn compile_e(e: &mut Emitter, ctx: &mut Ctx, node: &SNode, n: usize) -> Result<(), String> {
    match &node.kind {
        SNodeKind::Application { .. } => {
            let args = spine_args(node);
            let m = args.len();
            let head = node.spine_head();
            let callable = resolve_callable(ctx, head)?.ok_or_else(|| {
                format!("{}: constant cannot be applied to arguments", head.loc)
            })?;
            let k = callable.arity();
            if m > k {
                return Err(format!(
                    "{}: Over-saturated application survived lifting",
                    node.loc
                ));
            }
            if let (Callable::Primitive(Builtin::If), 3) = (&callable, m) {
                let false_branch = args[0].0;
                let true_branch = args[1].0;
                let cond = args[2].0;
                compile_e(e, ctx, cond, n)?;
                let l_else = e.new_label();
                let l_end = e.new_label();
                e.jfalse(l_else, cond.loc);
                let entry_depth = e.depth();
                compile_e(e, ctx, true_branch, n)?;
                e.jump(l_end, cond.loc);
                e.set_depth(entry_depth);
                e.bind_label(l_else);
                compile_e(e, ctx, false_branch, n)?;
                e.bind_label(l_end);
                return Ok(());
            }
            let mut strict_by_argno = vec![false; m];
            for (index, (arg, strict)) in args.iter().enumerate() {
                let argno = m - 1 - index;
                strict_by_argno[argno] = *strict;
                if *strict {
                    compile_e(e, ctx, arg, n + index)?;
                } else {
                    compile_c(e, ctx, arg, n + index)?;
                }
            }
            if m == k {
                match &callable {
                    Callable::Primitive(builtin) => {
                        // Arguments flowing into strict positions were
                        // evaluated above whenever the analysis flagged
                        // them; force any it could not prove
                        for argno in 0..builtin.nstrict() {
                            if !strict_by_argno[argno] {
                                e.eval(argno, node.loc);
                            }
                        }
                        e.emit(Instruction::Bif { target: *builtin }, node.loc);
                        if !builtin.info().whnf_result {
                            e.eval(0, node.loc);
                        }
                    }
                    Callable::Function { .. } => {
                        e.emit(
                            Instruction::MkFrame {
                                target: callable.id(),
                                num_args: k,
                            },
                            node.loc,
                        );
                        e.eval(0, node.loc);
                    }
                }
            } else {
                e.emit(
                    Instruction::MkCap {
                        target: callable.id(),
                        num_args: m,
                    },
                    node.loc,
                );
                e.eval(0, node.loc);
            }
            Ok(())
        }
        SNodeKind::Letrec { bindings, body } => {
            let saved = ctx.pmap.len();
            compile_letrec(e, ctx, bindings, n, true)?;
            let count = ctx.pmap.len() - saved;
            compile_e(e, ctx, body, n + count)?;
            e.emit(
                Instruction::Squeeze {
                    count: 1,
                    remove: count,
                },
                node.loc,
            );
            ctx.pmap.truncate(saved);
            Ok(())
        }
        SNodeKind::Symbol(name) => {
            let index = ctx.presolve(name, node.loc)?;
            e.eval(n - index, node.loc);
            e.emit(Instruction::Push { offset: n - index }, node.loc);
            Ok(())
        }
        _ => {
            compile_c(e, ctx, node, n)?;
            e.eval(0, node.loc);
            Ok(())
        }
    }
}

/// Compile a sequence of expressions then squeeze out everything beneath
/// them, in preparation for a tail transfer
fn compile_s(
    e: &mut Emitter,
    ctx: &mut Ctx,
    exprs: &[(&SNode, bool)],
    n: usize,
    loc: SourceLoc,
) -> Result<(), String> {
    for (index, (node, strict)) in exprs.iter().enumerate() {
        if *strict {
            compile_e(e, ctx, node, n + index)?;
        } else {
            compile_c(e, ctx, node, n + index)?;
        }
    }
    e.emit(
        Instruction::Squeeze {
            count: exprs.len(),
            remove: n,
        },
        loc,
    );
    Ok(())
}

/// Tail-position reduction scheme: like the evaluation scheme but ending
/// in stack cleanup plus a control transfer instead of leaving a value
/// for a caller
fn compile_r(e: &mut Emitter, ctx: &mut Ctx, node: &SNode, n: usize) -> Result<(), String> {
    match &node.kind {
        SNodeKind::Application { .. } => {
            let args = spine_args(node);
            let m = args.len();
            let head = node.spine_head();
            if let SNodeKind::Symbol(_) = &head.kind {
                // The called function is not statically known: evaluate it
                // along with the arguments and dispatch through the
                // generic unwind sequence
                let mut exprs = args.clone();
                exprs.push((head, false));
                compile_s(e, ctx, &exprs, n, node.loc)?;
                e.eval(0, node.loc);
                e.emit(Instruction::Do { or_value: false }, node.loc);
                return Ok(());
            }
            let callable = resolve_callable(ctx, head)?.ok_or_else(|| {
                format!("{}: constant cannot be applied to arguments", head.loc)
            })?;
            let k = callable.arity();
            if m > k {
                compile_s(e, ctx, &args, n, node.loc)?;
                e.emit(
                    Instruction::MkFrame {
                        target: callable.id(),
                        num_args: k,
                    },
                    node.loc,
                );
                e.eval(0, node.loc);
                e.emit(Instruction::Do { or_value: false }, node.loc);
                return Ok(());
            }
            if m == k {
                match &callable {
                    Callable::Primitive(Builtin::If) => {
                        let false_branch = args[0].0;
                        let true_branch = args[1].0;
                        let cond = args[2].0;
                        compile_e(e, ctx, cond, n)?;
                        let l_else = e.new_label();
                        e.jfalse(l_else, cond.loc);
                        let entry_depth = e.depth();
                        compile_r(e, ctx, true_branch, n)?;
                        e.set_depth(entry_depth);
                        e.bind_label(l_else);
                        compile_r(e, ctx, false_branch, n)?;
                    }
                    Callable::Primitive(builtin) => {
                        compile_s(e, ctx, &args, n, node.loc)?;
                        for argno in 0..builtin.nstrict() {
                            if !args[m - 1 - argno].1 {
                                e.eval(argno, node.loc);
                            }
                        }
                        e.emit(Instruction::Bif { target: *builtin }, node.loc);
                        if builtin.info().whnf_result {
                            e.emit(Instruction::Return, node.loc);
                        } else {
                            e.emit(Instruction::Do { or_value: true }, node.loc);
                        }
                    }
                    Callable::Function { strict_params, .. } => {
                        compile_s(e, ctx, &args, n, node.loc)?;
                        // Entry can skip the callee's evaluation prologue
                        // only if every strict parameter was evaluated here
                        let noeval = strict_params
                            .iter()
                            .enumerate()
                            .all(|(argno, strict)| !*strict || args[m - 1 - argno].1);
                        e.emit(
                            Instruction::JFun {
                                target: callable.id(),
                                noeval,
                            },
                            node.loc,
                        );
                    }
                }
                return Ok(());
            }
            // m < k: under-saturated, the closure is already a result
            for (index, (arg, _)) in args.iter().enumerate() {
                compile_c(e, ctx, arg, n + index)?;
            }
            e.emit(
                Instruction::MkCap {
                    target: callable.id(),
                    num_args: m,
                },
                node.loc,
            );
            e.emit(Instruction::Return, node.loc);
            Ok(())
        }
        SNodeKind::Symbol(_) => {
            compile_c(e, ctx, node, n)?;
            e.emit(
                Instruction::Squeeze {
                    count: 1,
                    remove: n,
                },
                node.loc,
            );
            e.eval(0, node.loc);
            e.emit(Instruction::Return, node.loc);
            Ok(())
        }
        SNodeKind::ScRef(_) | SNodeKind::Builtin(_) => {
            let callable = resolve_callable(ctx, node)?.unwrap();
            if callable.arity() == 0 {
                e.emit(
                    Instruction::JFun {
                        target: callable.id(),
                        noeval: false,
                    },
                    node.loc,
                );
            } else {
                e.emit(
                    Instruction::MkCap {
                        target: callable.id(),
                        num_args: 0,
                    },
                    node.loc,
                );
                e.emit(Instruction::Return, node.loc);
            }
            Ok(())
        }
        SNodeKind::Nil | SNodeKind::Number(_) | SNodeKind::Str(_) => {
            compile_c(e, ctx, node, n)?;
            e.emit(Instruction::Return, node.loc);
            Ok(())
        }
        SNodeKind::Letrec { bindings, body } => {
            let saved = ctx.pmap.len();
            compile_letrec(e, ctx, bindings, n, true)?;
            let count = ctx.pmap.len() - saved;
            compile_r(e, ctx, body, n + count)?;
            ctx.pmap.truncate(saved);
            Ok(())
        }
        SNodeKind::Lambda { .. } => Err(format!("{}: Lambda survived lifting", node.loc)),
    }
}

/// Compile one supercombinator: entry marker, strict-parameter evaluation
/// prologue, then the body under the tail reduction scheme
fn compile_function(
    e: &mut Emitter,
    ctx: &mut Ctx,
    sc_index: usize,
) -> Result<FunInfo, String> {
    let module = ctx.module;
    let sc = module.get(sc_index);
    let id = ctx.functions[&sc.name].id;
    let arity = sc.arity();
    let address = e.next_address();
    e.begin_function(arity);
    e.emit(
        Instruction::GlobStart { target: id, arity },
        sc.body.loc,
    );
    for (index, strict) in sc.strict_params.iter().enumerate() {
        if *strict {
            e.eval(index, sc.body.loc);
        }
    }
    let noeval_address = e.next_address();
    let saved = ctx.pmap.len();
    for (index, param) in sc.params.iter().enumerate() {
        ctx.pmap.push((param.clone(), arity - index));
    }
    compile_r(e, ctx, &sc.body, arity)?;
    ctx.pmap.truncate(saved);
    let name = ctx.strings.add(real_name(&sc.name));
    Ok(FunInfo {
        address,
        noeval_address,
        arity,
        stack_size: e.take_max_depth(),
        name,
    })
}

/// Compile the code block backing a builtin when it is applied
/// higher-order (through a cap or frame rather than a direct BIF)
fn compile_builtin_block(e: &mut Emitter, ctx: &mut Ctx, builtin: Builtin) -> FunInfo {
    let loc = SourceLoc::default();
    let info = builtin.info();
    let address = e.next_address();
    e.begin_function(info.nargs);
    e.emit(
        Instruction::GlobStart {
            target: builtin.function_id(),
            arity: info.nargs,
        },
        loc,
    );
    if builtin == Builtin::If {
        let l_else = e.new_label();
        let l_end = e.new_label();
        e.emit(Instruction::Push { offset: 0 }, loc);
        e.eval(0, loc);
        e.jfalse(l_else, loc);
        let entry_depth = e.depth();
        e.emit(Instruction::Push { offset: 1 }, loc);
        e.jump(l_end, loc);
        e.set_depth(entry_depth);
        e.bind_label(l_else);
        e.emit(Instruction::Push { offset: 2 }, loc);
        e.bind_label(l_end);
        e.eval(0, loc);
        e.emit(Instruction::Return, loc);
    } else {
        for argno in 0..info.nstrict {
            e.eval(argno, loc);
        }
        e.emit(Instruction::Bif { target: builtin }, loc);
        if !info.whnf_result {
            e.eval(0, loc);
        }
        e.emit(Instruction::Return, loc);
    }
    let name = ctx.strings.add(info.name);
    FunInfo {
        address,
        noeval_address: address,
        arity: info.nargs,
        stack_size: e.take_max_depth(),
        name,
    }
}

/// Generate the complete bytecode module: prelude, the generic
/// evaluate-and-dispatch sequence, every supercombinator body and every
/// builtin code block
pub fn generate(module: &Module, _options: &CompilerOptions) -> Result<BytecodeModule, String> {
    let mut strings = StringPool::default();
    for file in module.files.iter() {
        strings.add(file);
    }

    let num_builtins = Builtin::count();
    let functions = module
        .iter()
        .enumerate()
        .map(|(index, sc)| {
            (
                sc.name.clone(),
                FunctionInfo {
                    id: FunctionId::from(num_builtins + index),
                    arity: sc.arity(),
                    strict_params: sc.strict_params.clone(),
                },
            )
        })
        .collect::<FnvHashMap<_, _>>();

    let entry = module.entry_point()?;
    if entry.arity() != 0 {
        return Err(format!(
            "Entry point {} must take no arguments, has {}",
            real_name(&entry.name),
            entry.arity()
        ));
    }
    let entry_id = functions[&entry.name].id;

    let mut ctx = Ctx {
        module,
        functions,
        strings,
        pmap: Vec::new(),
    };
    let mut e = Emitter::new();
    let loc = SourceLoc::default();

    // Program prelude: build and force the entry frame
    e.set_depth(0);
    e.emit(Instruction::Begin, loc);
    e.emit(
        Instruction::MkFrame {
            target: entry_id,
            num_args: 0,
        },
        loc,
    );
    e.eval(0, loc);
    e.emit(Instruction::End, loc);

    // Generic dispatch sequence entered when a frame has applied a value
    // to further arguments
    let evaldo = e.next_address();
    e.set_depth(2);
    e.eval(0, loc);
    e.emit(Instruction::Do { or_value: false }, loc);

    let mut table = vec![None; num_builtins + module.len()];
    for index in 0..module.len() {
        let info = compile_function(&mut e, &mut ctx, index)?;
        let id = ctx.functions[&module.get(index).name].id;
        table[id.get()] = Some(info);
    }
    for builtin in Builtin::entries() {
        let info = compile_builtin_block(&mut e, &mut ctx, builtin);
        table[builtin.function_id().get()] = Some(info);
    }
    e.patch_labels()?;

    let functions = table
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| String::from("Incomplete function table"))?;

    Ok(BytecodeModule {
        instructions: e.program,
        locations: e.locs,
        functions,
        strings: ctx.strings.into_strings(),
        entry: InstructionPointer::new(0),
        evaldo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::Scomb;
    use crate::Compiler;

    fn compile(module: Module) -> BytecodeModule {
        Compiler::new(CompilerOptions::default())
            .compile(module)
            .unwrap()
    }

    fn function_body<'a>(
        compiled: &'a BytecodeModule,
        name: &str,
    ) -> &'a [Instruction] {
        let index = compiled
            .strings
            .iter()
            .position(|existing| existing == name)
            .unwrap();
        let info = compiled
            .functions
            .iter()
            .find(|info| info.name == index)
            .unwrap();
        let end = compiled
            .functions
            .iter()
            .map(|other| other.address.get())
            .filter(|address| *address > info.address.get())
            .min()
            .unwrap_or(compiled.instructions.len());
        &compiled.instructions.instructions()[info.address.get()..end]
    }

    #[test]
    fn saturated_builtins_compile_to_direct_application() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "f",
            ["x", "y"],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::symbol("x"), SNode::symbol("y")],
            ),
        ));
        module.add(Scomb::new("main", [] as [&str; 0], SNode::number(0.0)));
        let compiled = compile(module);
        let body = function_body(&compiled, "f");
        assert!(
            body.iter()
                .take_while(|instr| !matches!(instr, Instruction::Return))
                .any(|instr| matches!(instr, Instruction::Bif { target: Builtin::Add })),
            "expected a direct builtin application"
        );
        assert!(
            !body
                .iter()
                .take_while(|instr| !matches!(instr, Instruction::Return))
                .any(|instr| matches!(instr, Instruction::MkFrame { .. })),
            "strict arguments should not be suspended"
        );
    }

    #[test]
    fn lazy_arguments_become_frames() {
        // f x = cons (g x) nil; g x = + x 1
        let mut module = Module::default();
        module.add(Scomb::new(
            "g",
            ["x"],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::symbol("x"), SNode::number(1.0)],
            ),
        ));
        module.add(Scomb::new(
            "f",
            ["x"],
            SNode::apps(
                SNode::builtin(Builtin::Cons),
                [
                    SNode::app(SNode::scref("g"), SNode::symbol("x")),
                    SNode::nil(),
                ],
            ),
        ));
        module.add(Scomb::new("main", [] as [&str; 0], SNode::number(0.0)));
        let compiled = compile(module);
        let body = function_body(&compiled, "f");
        assert!(body
            .iter()
            .take_while(|instr| !matches!(instr, Instruction::Return))
            .any(|instr| matches!(instr, Instruction::MkFrame { .. })));
    }

    #[test]
    fn tail_calls_jump_instead_of_building_frames() {
        // even n = if (== n 0) 1 (odd (- n 1)) ; odd n = if (== n 0) nil (even (- n 1))
        fn conditional(callee: &str) -> SNode {
            SNode::apps(
                SNode::builtin(Builtin::If),
                [
                    SNode::apps(
                        SNode::builtin(Builtin::Eq),
                        [SNode::symbol("n"), SNode::number(0.0)],
                    ),
                    SNode::number(1.0),
                    SNode::app(
                        SNode::scref(callee),
                        SNode::apps(
                            SNode::builtin(Builtin::Subtract),
                            [SNode::symbol("n"), SNode::number(1.0)],
                        ),
                    ),
                ],
            )
        }
        let mut module = Module::default();
        module.add(Scomb::new("even", ["n"], conditional("odd")));
        module.add(Scomb::new("odd", ["n"], conditional("even")));
        module.add(Scomb::new("main", [] as [&str; 0], SNode::number(0.0)));
        let compiled = compile(module);
        let body = function_body(&compiled, "even");
        assert!(body
            .iter()
            .any(|instr| matches!(instr, Instruction::JFun { .. })));
        assert!(!body
            .iter()
            .any(|instr| matches!(instr, Instruction::MkFrame { .. })));
    }

    #[test]
    fn letrec_compiles_to_holes_and_updates() {
        // main = letrec xs = cons 1 xs in head xs
        let mut module = Module::default();
        module.add(Scomb::new(
            "main",
            [] as [&str; 0],
            SNode::letrec(
                [crate::syntax::Binding::new(
                    "xs",
                    SNode::apps(
                        SNode::builtin(Builtin::Cons),
                        [SNode::number(1.0), SNode::symbol("xs")],
                    ),
                )],
                SNode::app(SNode::builtin(Builtin::Head), SNode::symbol("xs")),
            ),
        ));
        let compiled = compile(module);
        let body = function_body(&compiled, "main");
        assert!(body
            .iter()
            .any(|instr| matches!(instr, Instruction::Alloc { count: 1 })));
        assert!(body
            .iter()
            .any(|instr| matches!(instr, Instruction::Update { .. })));
    }

    #[test]
    fn every_eval_is_followed_by_a_resolve() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "main",
            [] as [&str; 0],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::number(1.0), SNode::number(2.0)],
            ),
        ));
        let compiled = compile(module);
        let instructions = compiled.instructions.instructions();
        for (index, instruction) in instructions.iter().enumerate() {
            if let Instruction::Eval { offset } = instruction {
                assert_eq!(
                    instructions.get(index + 1),
                    Some(&Instruction::Resolve { offset: *offset })
                );
            }
        }
    }
}

// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use redex::hash::FnvHashMap;
use redex::stdlib::Builtin;

use crate::renaming::NameGenerator;
use crate::syntax::{Module, SNode, SNodeKind, Scomb};

/// Lambda lifting: abstract each lambda's free variables into parameters
/// and float it out as a fresh supercombinator. After this pass no lambda
/// remains anywhere in the module.
pub fn lift(module: &mut Module, names: &mut NameGenerator) -> Result<(), String> {
    let mut index = 0;
    while index < module.len() {
        absorb_top_level_lambdas(module.get_mut(index));
        let mut body = std::mem::replace(&mut module.get_mut(index).body, SNode::nil());
        let base_name = module.get(index).name.clone();
        let mut lifted = Vec::new();
        lift_lambdas(&mut body, &base_name, names, &mut lifted);
        module.get_mut(index).body = body;
        for sc in lifted {
            module.add(sc);
        }
        index += 1;
    }
    Ok(())
}

/// A definition whose body is itself a lambda chain is just a function of
/// more arguments
fn absorb_top_level_lambdas(sc: &mut Scomb) {
    while let SNodeKind::Lambda { .. } = &sc.body.kind {
        let kind = std::mem::replace(&mut sc.body.kind, SNodeKind::Nil);
        match kind {
            SNodeKind::Lambda { param, body } => {
                sc.params.push(param);
                sc.strict_params.push(false);
                sc.body = *body;
            }
            _ => unreachable!(),
        }
    }
}

fn lift_lambdas(node: &mut SNode, base_name: &str, names: &mut NameGenerator, out: &mut Vec<Scomb>) {
    if let SNodeKind::Lambda { .. } = &node.kind {
        // Collect the whole chain before recursing, so multi-parameter
        // lambdas become a single supercombinator
        let free = node.free_vars();
        let mut params = Vec::new();
        let mut kind = std::mem::replace(&mut node.kind, SNodeKind::Nil);
        let mut inner = loop {
            match kind {
                SNodeKind::Lambda { param, body } => {
                    params.push(param);
                    let body = *body;
                    if let SNodeKind::Lambda { .. } = &body.kind {
                        kind = body.kind;
                    } else {
                        break body;
                    }
                }
                _ => unreachable!(),
            }
        };
        lift_lambdas(&mut inner, base_name, names, out);
        let name = names.fresh_scomb(base_name);
        let mut sc = Scomb::new(
            name.clone(),
            free.iter().cloned().chain(params),
            inner,
        );
        sc.strict_params = vec![false; sc.params.len()];
        out.push(sc);
        *node = SNode::apps(SNode::scref(name), free.into_iter().map(SNode::symbol));
        return;
    }
    match &mut node.kind {
        SNodeKind::Application {
            function, argument, ..
        } => {
            lift_lambdas(function, base_name, names, out);
            lift_lambdas(argument, base_name, names, out);
        }
        SNodeKind::Letrec { bindings, body } => {
            for binding in bindings.iter_mut() {
                lift_lambdas(&mut binding.value, base_name, names, out);
            }
            lift_lambdas(body, base_name, names, out);
        }
        SNodeKind::Lambda { .. } => unreachable!(),
        SNodeKind::Symbol(_)
        | SNodeKind::ScRef(_)
        | SNodeKind::Builtin(_)
        | SNodeKind::Nil
        | SNodeKind::Number(_)
        | SNodeKind::Str(_) => {}
    }
}

/// Application lifting: the lazy-construction and strict-evaluation code
/// generation schemes can only compile applications whose spine bottoms
/// out in a known function applied to at most its arity. Applications
/// headed by a variable, by a letrec, or over-applied, are floated into
/// fresh supercombinators when they occur outside tail position (tail
/// position dispatches through the generic unwind sequence instead).
pub fn applift(module: &mut Module, names: &mut NameGenerator) -> Result<(), String> {
    let mut index = 0;
    while index < module.len() {
        let arities = scomb_arities(module);
        let mut body = std::mem::replace(&mut module.get_mut(index).body, SNode::nil());
        let base_name = module.get(index).name.clone();
        let mut lifted = Vec::new();
        applift_node(&mut body, true, &arities, &base_name, names, &mut lifted);
        module.get_mut(index).body = body;
        for sc in lifted {
            module.add(sc);
        }
        index += 1;
    }
    Ok(())
}

fn scomb_arities(module: &Module) -> FnvHashMap<String, usize> {
    module
        .iter()
        .map(|sc| (sc.name.clone(), sc.arity()))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn applift_spine(
    current: &mut SNode,
    argno: usize,
    tail: bool,
    is_tail_if: bool,
    arities: &FnvHashMap<String, usize>,
    base_name: &str,
    names: &mut NameGenerator,
    out: &mut Vec<Scomb>,
) {
    if let SNodeKind::Application {
        function, argument, ..
    } = &mut current.kind
    {
        let argno = argno - 1;
        // Branch arguments of a conditional are positions 1
        // and 2; the condition (position 0) is always strict
        let arg_tail = tail && is_tail_if && argno >= 1;
        applift_node(argument, arg_tail, arities, base_name, names, out);
        applift_spine(
            function.as_mut(),
            argno,
            tail,
            is_tail_if,
            arities,
            base_name,
            names,
            out,
        );
    } else {
        applift_node(current, false, arities, base_name, names, out);
    }
}

fn applift_node(
    node: &mut SNode,
    tail: bool,
    arities: &FnvHashMap<String, usize>,
    base_name: &str,
    names: &mut NameGenerator,
    out: &mut Vec<Scomb>,
) {
    match &node.kind {
        SNodeKind::Application { .. } => {
            let m = node.spine_len();
            let needs_lift = match &node.spine_head().kind {
                SNodeKind::Symbol(_) => !tail,
                SNodeKind::Letrec { .. } => true,
                SNodeKind::ScRef(name) => {
                    !tail && arities.get(name).map(|arity| m > *arity).unwrap_or(false)
                }
                SNodeKind::Builtin(builtin) => !tail && m > builtin.nargs(),
                _ => false,
            };
            if needs_lift {
                let free = node.free_vars();
                let name = names.fresh_scomb(base_name);
                let loc = node.loc;
                let replacement = SNode::apps(
                    SNode::scref(name.clone()),
                    free.iter().cloned().map(SNode::symbol),
                );
                let lifted_body = std::mem::replace(node, replacement);
                node.loc = loc;
                let mut sc = Scomb::new(name, free, lifted_body);
                sc.strict_params = vec![false; sc.params.len()];
                out.push(sc);
                return;
            }
            // Saturated conditionals pass tail position through to their
            // branches, matching how the reduction schemes compile them
            let is_tail_if = matches!(
                node.spine_head().kind,
                SNodeKind::Builtin(Builtin::If)
            ) && m == Builtin::If.nargs();
            applift_spine(node, m, tail, is_tail_if, arities, base_name, names, out);
        }
        SNodeKind::Letrec { .. } => {
            if let SNodeKind::Letrec { bindings, body } = &mut node.kind {
                for binding in bindings.iter_mut() {
                    applift_node(&mut binding.value, false, arities, base_name, names, out);
                }
                applift_node(body, tail, arities, base_name, names, out);
            }
        }
        SNodeKind::Lambda { .. } => unreachable!("lambdas are lifted before application lifting"),
        SNodeKind::Symbol(_)
        | SNodeKind::ScRef(_)
        | SNodeKind::Builtin(_)
        | SNodeKind::Nil
        | SNodeKind::Number(_)
        | SNodeKind::Str(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renaming::rename_variables;

    fn run_lift(mut module: Module) -> Module {
        let mut names = NameGenerator::default();
        for index in 0..module.len() {
            rename_variables(module.get_mut(index), &mut names);
        }
        lift(&mut module, &mut names).unwrap();
        applift(&mut module, &mut names).unwrap();
        module
    }

    fn assert_no_lambdas(node: &SNode) {
        match &node.kind {
            SNodeKind::Lambda { .. } => panic!("lambda survived lifting: {}", node),
            SNodeKind::Application {
                function, argument, ..
            } => {
                assert_no_lambdas(function);
                assert_no_lambdas(argument);
            }
            SNodeKind::Letrec { bindings, body } => {
                for binding in bindings {
                    assert_no_lambdas(&binding.value);
                }
                assert_no_lambdas(body);
            }
            _ => {}
        }
    }

    #[test]
    fn lambdas_are_floated_to_supercombinators() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "main",
            Vec::<String>::new(),
            SNode::app(
                SNode::lambda(
                    "x",
                    SNode::apps(
                        SNode::builtin(Builtin::Add),
                        [SNode::symbol("x"), SNode::number(1.0)],
                    ),
                ),
                SNode::number(2.0),
            ),
        ));
        let module = run_lift(module);
        assert_eq!(module.len(), 2);
        for sc in module.iter() {
            assert_no_lambdas(&sc.body);
        }
    }

    #[test]
    fn free_variables_become_leading_parameters() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "add3",
            ["n"],
            SNode::app(
                SNode::lambda(
                    "m",
                    SNode::apps(
                        SNode::builtin(Builtin::Add),
                        [SNode::symbol("n"), SNode::symbol("m")],
                    ),
                ),
                SNode::number(3.0),
            ),
        ));
        let module = run_lift(module);
        let lifted = module
            .iter()
            .find(|sc| sc.name != "add3")
            .expect("expected a lifted supercombinator");
        assert_eq!(lifted.arity(), 2);
    }

    #[test]
    fn variable_headed_arguments_are_lifted_out_of_lazy_positions() {
        // f g x = cons (g x) nil -- (g x) cannot be constructed by the
        // lazy scheme directly, since g is not statically known
        let mut module = Module::default();
        module.add(Scomb::new(
            "f",
            ["g", "x"],
            SNode::apps(
                SNode::builtin(Builtin::Cons),
                [
                    SNode::app(SNode::symbol("g"), SNode::symbol("x")),
                    SNode::nil(),
                ],
            ),
        ));
        let module = run_lift(module);
        assert_eq!(module.len(), 2);
        let lifted = module.iter().find(|sc| sc.name != "f").unwrap();
        // The lifted body keeps the variable application in tail position
        assert!(matches!(
            lifted.body.spine_head().kind,
            SNodeKind::Symbol(_)
        ));
    }

    #[test]
    fn tail_position_variable_applications_stay_in_place() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "apply",
            ["g", "x"],
            SNode::app(SNode::symbol("g"), SNode::symbol("x")),
        ));
        let module = run_lift(module);
        assert_eq!(module.len(), 1);
    }

    #[test]
    fn over_applications_of_known_functions_are_lifted() {
        // id x = x; main = cons (id id 1) nil -- (id id 1) applies id to
        // two arguments, beyond its arity
        let mut module = Module::default();
        module.add(Scomb::new("id", ["x"], SNode::symbol("x")));
        module.add(Scomb::new(
            "main",
            Vec::<String>::new(),
            SNode::apps(
                SNode::builtin(Builtin::Cons),
                [
                    SNode::apps(
                        SNode::scref("id"),
                        [SNode::scref("id"), SNode::number(1.0)],
                    ),
                    SNode::nil(),
                ],
            ),
        ));
        let module = run_lift(module);
        assert_eq!(module.len(), 3);
    }
}

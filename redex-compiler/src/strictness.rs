// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::collections::BTreeSet;

use redex::hash::FnvHashMap;
use redex::stdlib::Builtin;

use crate::syntax::{Module, SNode, SNodeKind, Scomb};

/// Per-iteration snapshot of every supercombinator's strictness vector.
/// Each pass reads the previous iteration's vectors while computing the
/// next, which keeps the fixpoint well-defined.
type Vectors = FnvHashMap<String, Vec<bool>>;

/// Iterative strictness analysis over a set of supercombinators.
///
/// On each iteration every supercombinator is examined to determine which
/// arguments it definitely evaluates, and application nodes passing
/// arguments into known-strict positions are flagged. Newly discovered
/// strictness can expose more cases in callers, so the process repeats
/// until nothing changes. Strictness is only ever added, so the iteration
/// terminates.
///
/// It is always safe to miss strictness, never to invent it: an argument
/// wrongly treated as strict could force an expression the lazy semantics
/// would never have demanded, turning a terminating program into a
/// diverging one. Whenever in doubt an argument stays lazy.
pub fn strictness_analysis(module: &mut Module) {
    loop {
        let mut changed = false;
        let vectors = module
            .iter()
            .map(|sc| (sc.name.clone(), sc.strict_params.clone()))
            .collect::<Vectors>();
        for index in 0..module.len() {
            check_strictness(module.get_mut(index), &vectors, &mut changed);
        }
        if !changed {
            break;
        }
    }
}

fn check_strictness(sc: &mut Scomb, vectors: &Vectors, changed: &mut bool) {
    let mut used = BTreeSet::new();
    check_node(&mut sc.body, &mut used, vectors, changed);
    let updated = sc
        .params
        .iter()
        .enumerate()
        .map(|(index, param)| sc.strict_params[index] || used.contains(param))
        .collect::<Vec<_>>();
    if updated != sc.strict_params {
        sc.strict_params = updated;
        *changed = true;
    }
}

enum HeadInfo {
    Sc(Vec<bool>),
    Builtin(Builtin),
}
impl HeadInfo {
    fn nargs(&self) -> usize {
        match self {
            Self::Sc(vector) => vector.len(),
            Self::Builtin(builtin) => builtin.nargs(),
        }
    }
    fn strict_in(&self, argno: usize) -> bool {
        match self {
            Self::Sc(vector) => vector[argno],
            Self::Builtin(builtin) => argno < builtin.nstrict(),
        }
    }
}

fn head_info(node: &SNode, vectors: &Vectors) -> Option<HeadInfo> {
    match &node.spine_head().kind {
        SNodeKind::ScRef(name) => vectors.get(name).cloned().map(HeadInfo::Sc),
        SNodeKind::Builtin(builtin) => Some(HeadInfo::Builtin(*builtin)),
        _ => None,
    }
}

/// Walk an expression in a strict context: record which variables are
/// definitely evaluated, flag application nodes whose argument flows into
/// a known-strict position, and mark letrec bindings demanded by their
/// body.
fn check_node(
    node: &mut SNode,
    used: &mut BTreeSet<String>,
    vectors: &Vectors,
    changed: &mut bool,
) {
    match &mut node.kind {
        SNodeKind::Letrec { bindings, body } => {
            let mut body_used = BTreeSet::new();
            loop {
                let mut again = false;
                for binding in bindings.iter_mut() {
                    if binding.strict {
                        check_node(&mut binding.value, &mut body_used, vectors, changed);
                    }
                }
                check_node(body, &mut body_used, vectors, changed);
                for binding in bindings.iter_mut() {
                    if !binding.strict && body_used.contains(&binding.name) {
                        binding.strict = true;
                        again = true;
                        *changed = true;
                    }
                }
                if !again {
                    break;
                }
            }
            let bound = bindings
                .iter()
                .map(|binding| binding.name.clone())
                .collect::<BTreeSet<_>>();
            used.extend(
                body_used
                    .into_iter()
                    .filter(|name| !bound.contains(name)),
            );
        }
        SNodeKind::Application { .. } => {
            let m = node.spine_len();
            let info = head_info(node, vectors);
            let saturated = info
                .as_ref()
                .map(|info| info.nargs() == m)
                .unwrap_or(false);
            if let (true, Some(info)) = (saturated, info) {
                let is_if = matches!(info, HeadInfo::Builtin(Builtin::If));
                let is_seq = matches!(info, HeadInfo::Builtin(Builtin::Seq));
                let mut true_used = BTreeSet::new();
                let mut false_used = BTreeSet::new();
                let mut discarded = BTreeSet::new();
                let mut current = &mut *node;
                for argno in (0..m).rev() {
                    let SNodeKind::Application {
                        function,
                        argument,
                        strict,
                    } = &mut current.kind
                    else {
                        unreachable!()
                    };
                    if is_if && argno == 1 {
                        // A branch definitely returns a value if taken, so
                        // its contents are a strict context; but its
                        // variables only count if used in *both* branches
                        check_node(argument, &mut true_used, vectors, changed);
                    } else if is_if && argno == 2 {
                        check_node(argument, &mut false_used, vectors, changed);
                    } else if is_seq && argno == 1 {
                        // seq's continuation definitely runs, but nothing
                        // it references may be forced before the first
                        // argument
                        check_node(argument, &mut discarded, vectors, changed);
                    } else if info.strict_in(argno) {
                        if !*strict {
                            *strict = true;
                            *changed = true;
                        }
                        check_node(argument, used, vectors, changed);
                    }
                    current = function.as_mut();
                }
                if is_if {
                    used.extend(true_used.intersection(&false_used).cloned());
                }
            }
            // The function being applied is always demanded
            let SNodeKind::Application { function, .. } = &mut node.kind else {
                unreachable!()
            };
            check_node(function, used, vectors, changed);
        }
        SNodeKind::Symbol(name) => {
            used.insert(name.clone());
        }
        SNodeKind::Lambda { body, .. } => {
            // Nothing under a lambda is definitely evaluated; analyse it
            // for application flags only
            let mut discarded = BTreeSet::new();
            check_node(body, &mut discarded, vectors, changed);
        }
        SNodeKind::ScRef(_)
        | SNodeKind::Builtin(_)
        | SNodeKind::Nil
        | SNodeKind::Number(_)
        | SNodeKind::Str(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::Binding;

    fn strict_vector(module: &Module, name: &str) -> Vec<bool> {
        module.lookup(name).unwrap().strict_params.clone()
    }

    #[test]
    fn builtin_arguments_propagate_to_parameters() {
        // f x y = + x y
        let mut module = Module::default();
        module.add(Scomb::new(
            "f",
            ["x", "y"],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::symbol("x"), SNode::symbol("y")],
            ),
        ));
        strictness_analysis(&mut module);
        assert_eq!(strict_vector(&module, "f"), vec![true, true]);
    }

    #[test]
    fn conditional_branches_intersect() {
        // f a b c d = if (== 0 a) (+ b c) (- c d)
        // strict in a and c, but not b or d
        let mut module = Module::default();
        module.add(Scomb::new(
            "f",
            ["a", "b", "c", "d"],
            SNode::apps(
                SNode::builtin(Builtin::If),
                [
                    SNode::apps(
                        SNode::builtin(Builtin::Eq),
                        [SNode::number(0.0), SNode::symbol("a")],
                    ),
                    SNode::apps(
                        SNode::builtin(Builtin::Add),
                        [SNode::symbol("b"), SNode::symbol("c")],
                    ),
                    SNode::apps(
                        SNode::builtin(Builtin::Subtract),
                        [SNode::symbol("c"), SNode::symbol("d")],
                    ),
                ],
            ),
        ));
        strictness_analysis(&mut module);
        assert_eq!(strict_vector(&module, "f"), vec![true, false, true, false]);
    }

    #[test]
    fn strictness_flows_through_supercombinator_calls() {
        // inc n = + n 1 ; f x = inc x -- f becomes strict in x once inc is
        // known strict in n
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
            "f",
            ["x"],
            SNode::app(SNode::scref("inc"), SNode::symbol("x")),
        ));
        strictness_analysis(&mut module);
        assert_eq!(strict_vector(&module, "inc"), vec![true]);
        assert_eq!(strict_vector(&module, "f"), vec![true]);
    }

    #[test]
    fn lazy_constructor_arguments_stay_lazy() {
        // f x = cons x nil
        let mut module = Module::default();
        module.add(Scomb::new(
            "f",
            ["x"],
            SNode::apps(
                SNode::builtin(Builtin::Cons),
                [SNode::symbol("x"), SNode::nil()],
            ),
        ));
        strictness_analysis(&mut module);
        assert_eq!(strict_vector(&module, "f"), vec![false]);
    }

    #[test]
    fn demanded_letrec_bindings_are_marked_strict() {
        // f x = letrec a = + x 1 in + a 2
        let mut module = Module::default();
        module.add(Scomb::new(
            "f",
            ["x"],
            SNode::letrec(
                [Binding::new(
                    "a",
                    SNode::apps(
                        SNode::builtin(Builtin::Add),
                        [SNode::symbol("x"), SNode::number(1.0)],
                    ),
                )],
                SNode::apps(
                    SNode::builtin(Builtin::Add),
                    [SNode::symbol("a"), SNode::number(2.0)],
                ),
            ),
        ));
        strictness_analysis(&mut module);
        assert_eq!(strict_vector(&module, "f"), vec![true]);
        match &module.lookup("f").unwrap().body.kind {
            SNodeKind::Letrec { bindings, .. } => assert!(bindings[0].strict),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn application_nodes_record_strict_positions() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "f",
            ["x"],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::symbol("x"), SNode::number(1.0)],
            ),
        ));
        strictness_analysis(&mut module);
        fn count_strict(node: &SNode) -> usize {
            match &node.kind {
                SNodeKind::Application {
                    function,
                    argument,
                    strict,
                } => (*strict as usize) + count_strict(function) + count_strict(argument),
                _ => 0,
            }
        }
        assert_eq!(count_strict(&module.lookup("f").unwrap().body), 2);
    }
}

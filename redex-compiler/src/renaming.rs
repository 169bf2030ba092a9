// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use crate::syntax::{SNode, SNodeKind, Scomb};

/// Source of generated variable and supercombinator names. One generator
/// is threaded through the whole pipeline so names stay unique across
/// passes.
#[derive(Default)]
pub struct NameGenerator {
    counter: usize,
}
impl NameGenerator {
    pub fn fresh_var(&mut self, base: &str) -> String {
        let index = self.counter;
        self.counter += 1;
        format!("{}#{}", base, index)
    }
    pub fn fresh_scomb(&mut self, base: &str) -> String {
        let index = self.counter;
        self.counter += 1;
        format!("{}^{}", base, index)
    }
}

/// Strip a generated suffix for diagnostics
pub fn real_name(name: &str) -> &str {
    name.split(['#', '^']).next().unwrap_or(name)
}

/// Give every bound name in the supercombinator a unique generated
/// identifier, so that later passes can resolve scoping purely
/// positionally without capture concerns.
pub fn rename_variables(sc: &mut Scomb, names: &mut NameGenerator) {
    let mut mappings = Vec::new();
    for param in sc.params.iter_mut() {
        let renamed = names.fresh_var(param);
        mappings.push((param.clone(), renamed.clone()));
        *param = renamed;
    }
    rename_node(&mut sc.body, &mut mappings, names);
}

fn rename_node(node: &mut SNode, mappings: &mut Vec<(String, String)>, names: &mut NameGenerator) {
    match &mut node.kind {
        SNodeKind::Application {
            function, argument, ..
        } => {
            rename_node(function, mappings, names);
            rename_node(argument, mappings, names);
        }
        SNodeKind::Lambda { param, body } => {
            let renamed = names.fresh_var(param);
            mappings.push((param.clone(), renamed.clone()));
            *param = renamed;
            rename_node(body, mappings, names);
            mappings.pop();
        }
        SNodeKind::Letrec { bindings, body } => {
            let base = mappings.len();
            for binding in bindings.iter_mut() {
                let renamed = names.fresh_var(&binding.name);
                mappings.push((binding.name.clone(), renamed.clone()));
                binding.name = renamed;
            }
            for binding in bindings.iter_mut() {
                rename_node(&mut binding.value, mappings, names);
            }
            rename_node(body, mappings, names);
            mappings.truncate(base);
        }
        SNodeKind::Symbol(name) => {
            // Innermost binding wins
            if let Some((_, renamed)) = mappings
                .iter()
                .rev()
                .find(|(original, _)| original == name)
            {
                *name = renamed.clone();
            }
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
    use redex::stdlib::Builtin;

    #[test]
    fn shadowed_names_become_distinct() {
        let mut sc = Scomb::new(
            "f",
            ["x"],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [
                    SNode::symbol("x"),
                    SNode::app(SNode::lambda("x", SNode::symbol("x")), SNode::number(1.0)),
                ],
            ),
        );
        rename_variables(&mut sc, &mut NameGenerator::default());
        let outer = sc.params[0].clone();
        let free = sc.body.free_vars();
        assert_eq!(free, vec![outer.clone()]);
        assert_ne!(outer, "x");
        assert_eq!(real_name(&outer), "x");
    }

    #[test]
    fn letrec_bindings_are_renamed_recursively() {
        let mut sc = Scomb::new(
            "f",
            Vec::<String>::new(),
            SNode::letrec(
                [crate::syntax::Binding::new(
                    "loop",
                    SNode::app(SNode::scref("g"), SNode::symbol("loop")),
                )],
                SNode::symbol("loop"),
            ),
        );
        rename_variables(&mut sc, &mut NameGenerator::default());
        match &sc.body.kind {
            SNodeKind::Letrec { bindings, body } => {
                let bound = bindings[0].name.clone();
                assert_ne!(bound, "loop");
                match &body.kind {
                    SNodeKind::Symbol(name) => assert_eq!(*name, bound),
                    other => panic!("unexpected body: {:?}", other),
                }
                match &bindings[0].value.kind {
                    SNodeKind::Application { argument, .. } => match &argument.kind {
                        SNodeKind::Symbol(name) => assert_eq!(*name, bound),
                        other => panic!("unexpected argument: {:?}", other),
                    },
                    other => panic!("unexpected value: {:?}", other),
                }
            }
            other => panic!("unexpected node: {:?}", other),
        }
    }
}

// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use crate::syntax::{SNode, SNodeKind};

/// Reorder each letrec's bindings so that a binding's right-hand side is
/// compiled after any binding it depends on is already in place, where the
/// dependency graph permits. Genuinely cyclic groups keep their relative
/// order and are constructed through placeholder holes.
pub fn reorder_letrecs(node: &mut SNode) {
    match &mut node.kind {
        SNodeKind::Application {
            function, argument, ..
        } => {
            reorder_letrecs(function);
            reorder_letrecs(argument);
        }
        SNodeKind::Lambda { body, .. } => {
            reorder_letrecs(body);
        }
        SNodeKind::Letrec { bindings, body } => {
            let original = std::mem::take(bindings);
            let mut remaining = original;
            let mut ordered = Vec::with_capacity(remaining.len());
            while !remaining.is_empty() {
                let selectable = remaining.iter().position(|candidate| {
                    let used = candidate.value.free_vars();
                    !remaining
                        .iter()
                        .any(|other| used.iter().any(|name| *name == other.name))
                });
                // No binding is free of dependencies on the rest: the
                // group is cyclic, take the first as-is
                let index = selectable.unwrap_or(0);
                ordered.push(remaining.remove(index));
            }
            *bindings = ordered;
            for binding in bindings.iter_mut() {
                reorder_letrecs(&mut binding.value);
            }
            reorder_letrecs(body);
        }
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
    use crate::syntax::Binding;
    use redex::stdlib::Builtin;

    fn binding_names(node: &SNode) -> Vec<String> {
        match &node.kind {
            SNodeKind::Letrec { bindings, .. } => {
                bindings.iter().map(|binding| binding.name.clone()).collect()
            }
            other => panic!("expected letrec, got {:?}", other),
        }
    }

    #[test]
    fn dependencies_move_ahead_of_their_users() {
        let mut node = SNode::letrec(
            [
                Binding::new(
                    "a",
                    SNode::apps(
                        SNode::builtin(Builtin::Add),
                        [SNode::symbol("b"), SNode::number(1.0)],
                    ),
                ),
                Binding::new("b", SNode::number(2.0)),
            ],
            SNode::symbol("a"),
        );
        reorder_letrecs(&mut node);
        assert_eq!(binding_names(&node), vec!["b", "a"]);
    }

    #[test]
    fn cyclic_groups_keep_their_order() {
        let mut node = SNode::letrec(
            [
                Binding::new(
                    "xs",
                    SNode::apps(
                        SNode::builtin(Builtin::Cons),
                        [SNode::number(1.0), SNode::symbol("ys")],
                    ),
                ),
                Binding::new(
                    "ys",
                    SNode::apps(
                        SNode::builtin(Builtin::Cons),
                        [SNode::number(2.0), SNode::symbol("xs")],
                    ),
                ),
            ],
            SNode::symbol("xs"),
        );
        reorder_letrecs(&mut node);
        assert_eq!(binding_names(&node), vec!["xs", "ys"]);
    }
}

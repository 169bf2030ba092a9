// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};

use redex::hash::FnvHashMap;
use redex::stdlib::Builtin;

/// Source position carried through compilation for diagnostics. The file
/// component indexes the module's file-name pool.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Debug, Hash, Serialize, Deserialize,
)]
pub struct SourceLoc {
    pub file: Option<u32>,
    pub line: Option<u32>,
}
impl SourceLoc {
    pub fn new(file: u32, line: u32) -> Self {
        Self {
            file: Some(file),
            line: Some(line),
        }
    }
}
impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "<{}>:{}", file, line),
            (None, Some(line)) => write!(f, "<input>:{}", line),
            _ => write!(f, "<unknown>"),
        }
    }
}

/// One letrec binding. The strict flag is set by the strictness analyser
/// when the binding is definitely demanded by the letrec body, allowing
/// the code generator to evaluate it directly instead of allocating a
/// suspension.
#[derive(Clone, Debug)]
pub struct Binding {
    pub name: String,
    pub value: SNode,
    pub strict: bool,
}
impl Binding {
    pub fn new(name: impl Into<String>, value: SNode) -> Self {
        Self {
            name: name.into(),
            value,
            strict: false,
        }
    }
}

/// Expression graph node. Lambdas, letrecs and unresolved symbols exist
/// only at this stage: lifting and code generation resolve them all away
/// before anything reaches the runtime heap.
#[derive(Clone, Debug)]
pub enum SNodeKind {
    Application {
        function: Box<SNode>,
        argument: Box<SNode>,
        /// Set by the strictness analyser when this argument is definitely
        /// demanded by the called function
        strict: bool,
    },
    Lambda {
        param: String,
        body: Box<SNode>,
    },
    Letrec {
        bindings: Vec<Binding>,
        body: Box<SNode>,
    },
    Symbol(String),
    ScRef(String),
    Builtin(Builtin),
    Nil,
    Number(f64),
    Str(String),
}

#[derive(Clone, Debug)]
pub struct SNode {
    pub kind: SNodeKind,
    pub loc: SourceLoc,
}
impl SNode {
    pub fn new(kind: SNodeKind, loc: SourceLoc) -> Self {
        Self { kind, loc }
    }
    pub fn app(function: SNode, argument: SNode) -> Self {
        let loc = function.loc;
        Self::new(
            SNodeKind::Application {
                function: Box::new(function),
                argument: Box::new(argument),
                strict: false,
            },
            loc,
        )
    }
    /// Left-nested application of a function to several arguments
    pub fn apps(function: SNode, args: impl IntoIterator<Item = SNode>) -> Self {
        args.into_iter().fold(function, Self::app)
    }
    pub fn lambda(param: impl Into<String>, body: SNode) -> Self {
        let loc = body.loc;
        Self::new(
            SNodeKind::Lambda {
                param: param.into(),
                body: Box::new(body),
            },
            loc,
        )
    }
    pub fn letrec(bindings: impl IntoIterator<Item = Binding>, body: SNode) -> Self {
        let loc = body.loc;
        Self::new(
            SNodeKind::Letrec {
                bindings: bindings.into_iter().collect(),
                body: Box::new(body),
            },
            loc,
        )
    }
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::new(SNodeKind::Symbol(name.into()), SourceLoc::default())
    }
    pub fn scref(name: impl Into<String>) -> Self {
        Self::new(SNodeKind::ScRef(name.into()), SourceLoc::default())
    }
    pub fn builtin(builtin: Builtin) -> Self {
        Self::new(SNodeKind::Builtin(builtin), SourceLoc::default())
    }
    pub fn nil() -> Self {
        Self::new(SNodeKind::Nil, SourceLoc::default())
    }
    pub fn number(value: f64) -> Self {
        Self::new(SNodeKind::Number(value), SourceLoc::default())
    }
    pub fn string(value: impl Into<String>) -> Self {
        Self::new(SNodeKind::Str(value.into()), SourceLoc::default())
    }

    /// Number of arguments applied along this node's application spine
    pub fn spine_len(&self) -> usize {
        let mut count = 0;
        let mut current = self;
        while let SNodeKind::Application { function, .. } = &current.kind {
            count += 1;
            current = function;
        }
        count
    }
    /// The node at the bottom of this node's application spine
    pub fn spine_head(&self) -> &SNode {
        let mut current = self;
        while let SNodeKind::Application { function, .. } = &current.kind {
            current = function;
        }
        current
    }
    /// Reject structurally malformed recursive bindings: two bindings of
    /// the same name within one letrec have no coherent meaning
    pub fn validate_letrecs(&self) -> Result<(), String> {
        match &self.kind {
            SNodeKind::Application {
                function, argument, ..
            } => {
                function.validate_letrecs()?;
                argument.validate_letrecs()
            }
            SNodeKind::Lambda { body, .. } => body.validate_letrecs(),
            SNodeKind::Letrec { bindings, body } => {
                for (index, binding) in bindings.iter().enumerate() {
                    if bindings[..index]
                        .iter()
                        .any(|earlier| earlier.name == binding.name)
                    {
                        return Err(format!(
                            "{}: Duplicate recursive binding: {}",
                            binding.value.loc, binding.name
                        ));
                    }
                    binding.value.validate_letrecs()?;
                }
                body.validate_letrecs()
            }
            _ => Ok(()),
        }
    }

    /// Free variables of the expression, in first-use order
    pub fn free_vars(&self) -> Vec<String> {
        fn walk(node: &SNode, bound: &mut Vec<String>, out: &mut Vec<String>) {
            match &node.kind {
                SNodeKind::Application {
                    function, argument, ..
                } => {
                    walk(function, bound, out);
                    walk(argument, bound, out);
                }
                SNodeKind::Lambda { param, body } => {
                    bound.push(param.clone());
                    walk(body, bound, out);
                    bound.pop();
                }
                SNodeKind::Letrec { bindings, body } => {
                    let base = bound.len();
                    bound.extend(bindings.iter().map(|binding| binding.name.clone()));
                    for binding in bindings {
                        walk(&binding.value, bound, out);
                    }
                    walk(body, bound, out);
                    bound.truncate(base);
                }
                SNodeKind::Symbol(name) => {
                    if !bound.iter().any(|existing| existing == name)
                        && !out.iter().any(|existing| existing == name)
                    {
                        out.push(name.clone());
                    }
                }
                SNodeKind::ScRef(_)
                | SNodeKind::Builtin(_)
                | SNodeKind::Nil
                | SNodeKind::Number(_)
                | SNodeKind::Str(_) => {}
            }
        }
        let mut out = Vec::new();
        walk(self, &mut Vec::new(), &mut out);
        out
    }
}
impl std::fmt::Display for SNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SNodeKind::Application {
                function, argument, ..
            } => write!(f, "({} {})", function, argument),
            SNodeKind::Lambda { param, body } => write!(f, "(\\{} -> {})", param, body),
            SNodeKind::Letrec { bindings, body } => {
                write!(f, "(letrec")?;
                for binding in bindings {
                    write!(f, " {} = {};", binding.name, binding.value)?;
                }
                write!(f, " in {})", body)
            }
            SNodeKind::Symbol(name) => write!(f, "{}", name),
            SNodeKind::ScRef(name) => write!(f, "{}", name),
            SNodeKind::Builtin(builtin) => write!(f, "{}", builtin),
            SNodeKind::Nil => write!(f, "nil"),
            SNodeKind::Number(value) => write!(f, "{}", value),
            SNodeKind::Str(value) => write!(f, "{:?}", value),
        }
    }
}

/// A top-level function definition: the unit of compilation
#[derive(Clone, Debug)]
pub struct Scomb {
    pub name: String,
    pub params: Vec<String>,
    pub body: SNode,
    /// One entry per parameter: the function is guaranteed to evaluate
    /// that argument whenever it is called
    pub strict_params: Vec<bool>,
}
impl Scomb {
    pub fn new(
        name: impl Into<String>,
        params: impl IntoIterator<Item = impl Into<String>>,
        body: SNode,
    ) -> Self {
        let params = params
            .into_iter()
            .map(|param| param.into())
            .collect::<Vec<_>>();
        let strict_params = vec![false; params.len()];
        Self {
            name: name.into(),
            params,
            body,
            strict_params,
        }
    }
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}
impl std::fmt::Display for Scomb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        for param in self.params.iter() {
            write!(f, " {}", param)?;
        }
        write!(f, " = {}", self.body)
    }
}

/// The supercombinator set fed to code generation, with a distinguished
/// entry point
pub struct Module {
    scombs: Vec<Scomb>,
    by_name: FnvHashMap<String, usize>,
    pub entry: String,
    pub files: Vec<String>,
}
impl Default for Module {
    fn default() -> Self {
        Self {
            scombs: Vec::new(),
            by_name: FnvHashMap::default(),
            entry: String::from("main"),
            files: Vec::new(),
        }
    }
}
impl Module {
    pub fn add(&mut self, scomb: Scomb) -> usize {
        let index = self.scombs.len();
        self.by_name.insert(scomb.name.clone(), index);
        self.scombs.push(scomb);
        index
    }
    pub fn len(&self) -> usize {
        self.scombs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.scombs.is_empty()
    }
    pub fn get(&self, index: usize) -> &Scomb {
        &self.scombs[index]
    }
    pub fn get_mut(&mut self, index: usize) -> &mut Scomb {
        &mut self.scombs[index]
    }
    pub fn lookup(&self, name: &str) -> Option<&Scomb> {
        self.by_name.get(name).map(|index| &self.scombs[*index])
    }
    pub fn lookup_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Scomb> {
        self.scombs.iter()
    }
    pub fn entry_point(&self) -> Result<&Scomb, String> {
        self.lookup(&self.entry)
            .ok_or_else(|| format!("Undefined entry point: {}", self.entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spine_walks_to_the_applied_function() {
        let expr = SNode::apps(
            SNode::builtin(Builtin::Add),
            [SNode::number(1.0), SNode::number(2.0)],
        );
        assert_eq!(expr.spine_len(), 2);
        assert!(matches!(
            expr.spine_head().kind,
            SNodeKind::Builtin(Builtin::Add)
        ));
    }

    #[test]
    fn free_vars_respect_binders() {
        let expr = SNode::lambda(
            "x",
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::symbol("x"), SNode::symbol("y")],
            ),
        );
        assert_eq!(expr.free_vars(), vec![String::from("y")]);
    }

    #[test]
    fn letrec_binders_are_in_scope_for_all_bindings() {
        let expr = SNode::letrec(
            [
                Binding::new("a", SNode::symbol("b")),
                Binding::new("b", SNode::symbol("outer")),
            ],
            SNode::symbol("a"),
        );
        assert_eq!(expr.free_vars(), vec![String::from("outer")]);
    }
}

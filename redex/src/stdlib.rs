// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::core::FunctionId;

/// Builtin primitive opcodes. The declared order is load-bearing: a
/// builtin's position in the combined function table is its enum index,
/// with supercombinators numbered after the final builtin.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash, Serialize, Deserialize, EnumIter,
)]
pub enum Builtin {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Sqrt,
    Floor,
    Ceil,
    If,
    Cons,
    Head,
    Tail,
    ArraySize,
    ArraySkip,
    ArrayItem,
    IsNil,
    IsNumber,
    IsString,
    IsCons,
    IsFunction,
    Seq,
    Par,
    ParHead,
    Error,
}

/// Static dispatch metadata for one builtin: name, arity, how many of its
/// leading arguments it is strict in, and whether its result is guaranteed
/// to already be in weak-head normal form.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct BuiltinInfo {
    pub name: &'static str,
    pub nargs: usize,
    pub nstrict: usize,
    pub whnf_result: bool,
}

impl Builtin {
    pub fn info(&self) -> BuiltinInfo {
        match self {
            Self::Add => BuiltinInfo {
                name: "+",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Subtract => BuiltinInfo {
                name: "-",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Multiply => BuiltinInfo {
                name: "*",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Divide => BuiltinInfo {
                name: "/",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Mod => BuiltinInfo {
                name: "%",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Eq => BuiltinInfo {
                name: "==",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Ne => BuiltinInfo {
                name: "!=",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Lt => BuiltinInfo {
                name: "<",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Le => BuiltinInfo {
                name: "<=",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Gt => BuiltinInfo {
                name: ">",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Ge => BuiltinInfo {
                name: ">=",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::And => BuiltinInfo {
                name: "and",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Or => BuiltinInfo {
                name: "or",
                nargs: 2,
                nstrict: 2,
                whnf_result: true,
            },
            Self::Not => BuiltinInfo {
                name: "not",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::Sqrt => BuiltinInfo {
                name: "sqrt",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::Floor => BuiltinInfo {
                name: "floor",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::Ceil => BuiltinInfo {
                name: "ceil",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::If => BuiltinInfo {
                name: "if",
                nargs: 3,
                nstrict: 1,
                whnf_result: false,
            },
            Self::Cons => BuiltinInfo {
                name: "cons",
                nargs: 2,
                nstrict: 0,
                whnf_result: true,
            },
            Self::Head => BuiltinInfo {
                name: "head",
                nargs: 1,
                nstrict: 1,
                whnf_result: false,
            },
            Self::Tail => BuiltinInfo {
                name: "tail",
                nargs: 1,
                nstrict: 1,
                whnf_result: false,
            },
            Self::ArraySize => BuiltinInfo {
                name: "arraysize",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::ArraySkip => BuiltinInfo {
                name: "arrayskip",
                nargs: 2,
                nstrict: 2,
                whnf_result: false,
            },
            Self::ArrayItem => BuiltinInfo {
                name: "arrayitem",
                nargs: 2,
                nstrict: 2,
                whnf_result: false,
            },
            Self::IsNil => BuiltinInfo {
                name: "nil?",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::IsNumber => BuiltinInfo {
                name: "number?",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::IsString => BuiltinInfo {
                name: "string?",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::IsCons => BuiltinInfo {
                name: "cons?",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::IsFunction => BuiltinInfo {
                name: "function?",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
            Self::Seq => BuiltinInfo {
                name: "seq",
                nargs: 2,
                nstrict: 1,
                whnf_result: false,
            },
            Self::Par => BuiltinInfo {
                name: "par",
                nargs: 2,
                nstrict: 0,
                whnf_result: false,
            },
            Self::ParHead => BuiltinInfo {
                name: "parhead",
                nargs: 2,
                nstrict: 0,
                whnf_result: false,
            },
            Self::Error => BuiltinInfo {
                name: "error",
                nargs: 1,
                nstrict: 1,
                whnf_result: true,
            },
        }
    }
    pub fn name(&self) -> &'static str {
        self.info().name
    }
    pub fn nargs(&self) -> usize {
        self.info().nargs
    }
    pub fn nstrict(&self) -> usize {
        self.info().nstrict
    }
    /// Position of this builtin in the combined function table
    pub fn function_id(&self) -> FunctionId {
        FunctionId::from(*self as usize)
    }
    pub fn count() -> usize {
        Self::iter().count()
    }
    pub fn from_function_id(id: FunctionId) -> Option<Self> {
        Self::iter().nth(id.get())
    }
    pub fn from_name(name: &str) -> Option<Self> {
        Self::iter().find(|builtin| builtin.name() == name)
    }
    pub fn entries() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}
impl std::fmt::Display for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_ids_are_stable_across_lookup() {
        for builtin in Builtin::entries() {
            assert_eq!(Builtin::from_function_id(builtin.function_id()), Some(builtin));
        }
    }

    #[test]
    fn name_lookup() {
        assert_eq!(Builtin::from_name("+"), Some(Builtin::Add));
        assert_eq!(Builtin::from_name("parhead"), Some(Builtin::ParHead));
        assert_eq!(Builtin::from_name("bogus"), None);
    }

    #[test]
    fn strict_argument_counts_never_exceed_arity() {
        for builtin in Builtin::entries() {
            let info = builtin.info();
            assert!(info.nstrict <= info.nargs, "{}", info.name);
        }
    }
}

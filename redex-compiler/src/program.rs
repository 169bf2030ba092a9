// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::iter::FromIterator;

use serde::{Deserialize, Serialize};

use redex::core::{FunctionId, InstructionPointer, StackOffset};
use redex::stdlib::Builtin;

#[derive(PartialEq, Clone, Debug, Serialize, Deserialize, Copy)]
pub struct FloatValue(f64);

impl std::hash::Hash for FloatValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.0.to_be_bytes())
    }
}
impl Eq for FloatValue {}

impl From<f64> for FloatValue {
    fn from(v: f64) -> Self {
        FloatValue(v)
    }
}

impl From<FloatValue> for f64 {
    fn from(v: FloatValue) -> Self {
        v.0
    }
}

/// Stack-machine instruction set. Stack offsets count down from the top
/// of the executing frame's local stack (0 = topmost entry).
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize, Hash)]
pub enum Instruction {
    /// Start of the program prelude
    Begin,
    /// End of the program prelude: the root frame's value is final
    End,
    /// Function entry marker
    GlobStart {
        target: FunctionId,
        arity: usize,
    },
    /// Complete the current frame with the value on top of the stack
    Return,
    /// Dispatch the applied value on top of the stack against the
    /// arguments below it. With `or_value` set (tail position after a
    /// primitive), a non-applicable value completes the frame instead of
    /// being an error.
    Do {
        or_value: bool,
    },
    /// Tail call: continue the current frame at another function's code.
    /// With `noeval` set, entry skips the strict-parameter evaluation
    /// prologue (the arguments are known to be evaluated already).
    JFun {
        target: FunctionId,
        noeval: bool,
    },
    /// Pop the condition; jump if it is nil
    JFalse {
        target: InstructionPointer,
    },
    Jump {
        target: InstructionPointer,
    },
    /// Push a copy of the value at the given offset
    Push {
        offset: StackOffset,
    },
    /// Pop the value on top of the stack and overwrite the placeholder
    /// hole at the given offset with an indirection to it
    Update {
        offset: StackOffset,
    },
    /// Push `count` placeholder holes
    Alloc {
        count: usize,
    },
    /// Remove `remove` entries below the top `count` entries
    Squeeze {
        count: usize,
        remove: usize,
    },
    /// Pop `num_args` arguments into a partial application closure
    MkCap {
        target: FunctionId,
        num_args: usize,
    },
    /// Pop `num_args` arguments into a new (unstarted) frame
    MkFrame {
        target: FunctionId,
        num_args: usize,
    },
    /// Apply a builtin primitive to the top arguments
    Bif {
        target: Builtin,
    },
    PushNil,
    PushNumber {
        value: FloatValue,
    },
    /// Push a literal from the string pool
    PushString {
        index: usize,
    },
    Pop {
        count: usize,
    },
    /// Force the value at the given offset to weak-head normal form,
    /// suspending the current frame if the value is a frame or an
    /// unfetched remote reference. Always followed by `Resolve` on the
    /// same offset.
    Eval {
        offset: StackOffset,
    },
    /// Replace the value at the given offset with its indirection target
    Resolve {
        offset: StackOffset,
    },
}

#[derive(Hash, PartialEq, Eq, Clone, Debug, Serialize, Deserialize, Default)]
pub struct Program {
    instructions: Vec<Instruction>,
}
impl Program {
    pub fn new(instructions: impl IntoIterator<Item = Instruction>) -> Self {
        Self {
            instructions: instructions.into_iter().collect(),
        }
    }
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
    pub fn get(&self, address: InstructionPointer) -> Option<&Instruction> {
        self.instructions.get(address.0)
    }
    pub fn get_mut(&mut self, address: InstructionPointer) -> Option<&mut Instruction> {
        self.instructions.get_mut(address.0)
    }
    pub fn len(&self) -> usize {
        self.instructions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
    pub fn next_address(&self) -> InstructionPointer {
        InstructionPointer::new(self.instructions.len())
    }
    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }
    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }
    pub fn extend(&mut self, instructions: impl IntoIterator<Item = Instruction>) {
        self.instructions.extend(instructions)
    }
}
impl IntoIterator for Program {
    type Item = Instruction;
    type IntoIter = std::vec::IntoIter<Instruction>;
    fn into_iter(self) -> Self::IntoIter {
        self.instructions.into_iter()
    }
}
impl FromIterator<Instruction> for Program {
    fn from_iter<T: IntoIterator<Item = Instruction>>(iter: T) -> Self {
        Self::new(iter)
    }
}
impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.instructions
                .iter()
                .enumerate()
                .map(|(offset, instruction)| { format!("0x{:08x} {:?}", offset, instruction) })
                .collect::<Vec<_>>()
                .join("\n")
        )
    }
}

/// Function table entry: one per builtin and per supercombinator
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize, Deserialize)]
pub struct FunInfo {
    /// Entry address (strict-parameter evaluation prologue)
    pub address: InstructionPointer,
    /// Entry address bypassing the prologue
    pub noeval_address: InstructionPointer,
    pub arity: usize,
    /// Maximum local stack depth of any instruction in the body
    pub stack_size: usize,
    /// String-pool index of the function name
    pub name: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_values_hash_by_bit_pattern() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        fn hash(value: FloatValue) -> u64 {
            let mut hasher = DefaultHasher::new();
            value.hash(&mut hasher);
            hasher.finish()
        }
        assert_eq!(hash(FloatValue::from(1.5)), hash(FloatValue::from(1.5)));
        assert_ne!(hash(FloatValue::from(1.5)), hash(FloatValue::from(2.5)));
    }

    #[test]
    fn programs_display_addressed_listings() {
        let program = Program::new([
            Instruction::Begin,
            Instruction::PushNil,
            Instruction::Return,
        ]);
        let listing = program.to_string();
        assert!(listing.contains("0x00000000 Begin"));
        assert!(listing.contains("0x00000002 Return"));
    }
}

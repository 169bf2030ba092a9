// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};

use redex::core::{FunctionId, InstructionPointer};
use redex::stdlib::Builtin;

use crate::program::{FloatValue, FunInfo, Instruction, Program};
use crate::syntax::SourceLoc;

const SIGNATURE: &[u8; 8] = b"REDEXBC\0";

/// A compiled program in its portable form: header, flat instruction
/// array, function table and string pool. This is the complete input the
/// execution engine needs; nothing from the source module survives.
#[derive(PartialEq, Clone, Debug, Serialize, Deserialize)]
pub struct BytecodeModule {
    pub instructions: Program,
    /// Source location of each instruction, parallel to the instruction
    /// array, for runtime diagnostics
    pub locations: Vec<SourceLoc>,
    /// Indexed by function id: builtins first, then supercombinators
    pub functions: Vec<FunInfo>,
    pub strings: Vec<String>,
    /// Address of the program prelude
    pub entry: InstructionPointer,
    /// Address of the generic evaluate-and-dispatch sequence
    pub evaldo: InstructionPointer,
}
impl BytecodeModule {
    pub fn function(&self, id: FunctionId) -> Option<&FunInfo> {
        self.functions.get(id.get())
    }
    pub fn function_name(&self, id: FunctionId) -> Option<&str> {
        self.function(id)
            .and_then(|info| self.strings.get(info.name))
            .map(|name| name.as_str())
    }
    pub fn max_stack_size(&self) -> usize {
        self.functions
            .iter()
            .map(|info| info.stack_size)
            .max()
            .unwrap_or(0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(SIGNATURE);
        write_u32(&mut out, self.instructions.len() as u32);
        write_u32(&mut out, self.functions.len() as u32);
        write_u32(&mut out, self.strings.len() as u32);
        write_u64(&mut out, self.entry.get() as u64);
        write_u64(&mut out, self.evaldo.get() as u64);
        for (index, instruction) in self.instructions.instructions().iter().enumerate() {
            let (opcode, arg0, arg1) = encode_instruction(instruction);
            out.push(opcode);
            write_u64(&mut out, arg0);
            write_u64(&mut out, arg1);
            let loc = self.locations.get(index).copied().unwrap_or_default();
            write_u32(&mut out, loc.file.unwrap_or(u32::MAX));
            write_u32(&mut out, loc.line.unwrap_or(u32::MAX));
        }
        for info in self.functions.iter() {
            write_u64(&mut out, info.address.get() as u64);
            write_u64(&mut out, info.noeval_address.get() as u64);
            write_u32(&mut out, info.arity as u32);
            write_u32(&mut out, info.stack_size as u32);
            write_u32(&mut out, info.name as u32);
        }
        for value in self.strings.iter() {
            write_u32(&mut out, value.len() as u32);
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut reader = ByteReader::new(bytes);
        let signature = reader.bytes(SIGNATURE.len())?;
        if signature != SIGNATURE {
            return Err(String::from("Invalid bytecode signature"));
        }
        let nops = reader.u32()? as usize;
        let nfunctions = reader.u32()? as usize;
        let nstrings = reader.u32()? as usize;
        let entry = InstructionPointer::new(reader.u64()? as usize);
        let evaldo = InstructionPointer::new(reader.u64()? as usize);
        let mut instructions = Vec::with_capacity(nops);
        let mut locations = Vec::with_capacity(nops);
        for _ in 0..nops {
            let opcode = reader.u8()?;
            let arg0 = reader.u64()?;
            let arg1 = reader.u64()?;
            let file = reader.u32()?;
            let line = reader.u32()?;
            instructions.push(decode_instruction(opcode, arg0, arg1)?);
            locations.push(SourceLoc {
                file: (file != u32::MAX).then(|| file),
                line: (line != u32::MAX).then(|| line),
            });
        }
        let mut functions = Vec::with_capacity(nfunctions);
        for _ in 0..nfunctions {
            let address = InstructionPointer::new(reader.u64()? as usize);
            let noeval_address = InstructionPointer::new(reader.u64()? as usize);
            let arity = reader.u32()? as usize;
            let stack_size = reader.u32()? as usize;
            let name = reader.u32()? as usize;
            if address.get() > nops || noeval_address.get() > nops || name >= nstrings {
                return Err(String::from("Function table entry out of bounds"));
            }
            functions.push(FunInfo {
                address,
                noeval_address,
                arity,
                stack_size,
                name,
            });
        }
        let mut strings = Vec::with_capacity(nstrings);
        for _ in 0..nstrings {
            let length = reader.u32()? as usize;
            let bytes = reader.bytes(length)?;
            strings.push(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| String::from("Invalid string pool entry"))?,
            );
        }
        if entry.get() >= nops || evaldo.get() >= nops {
            return Err(String::from("Entry address out of bounds"));
        }
        for instruction in instructions.iter() {
            validate_instruction(instruction, nops, nfunctions, nstrings)?;
        }
        Ok(Self {
            instructions: Program::new(instructions),
            locations,
            functions,
            strings,
            entry,
            evaldo,
        })
    }
}

fn validate_instruction(
    instruction: &Instruction,
    nops: usize,
    nfunctions: usize,
    nstrings: usize,
) -> Result<(), String> {
    let check_target = |target: FunctionId| {
        if target.get() >= nfunctions {
            Err(format!("Function reference out of bounds: {}", target))
        } else {
            Ok(())
        }
    };
    match instruction {
        Instruction::GlobStart { target, .. }
        | Instruction::JFun { target, .. }
        | Instruction::MkCap { target, .. }
        | Instruction::MkFrame { target, .. } => check_target(*target),
        Instruction::Jump { target } | Instruction::JFalse { target } => {
            if target.get() >= nops {
                Err(format!("Jump target out of bounds: {}", target))
            } else {
                Ok(())
            }
        }
        Instruction::PushString { index } => {
            if *index >= nstrings {
                Err(format!("String reference out of bounds: {}", index))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

fn encode_instruction(instruction: &Instruction) -> (u8, u64, u64) {
    match instruction {
        Instruction::Begin => (0, 0, 0),
        Instruction::End => (1, 0, 0),
        Instruction::GlobStart { target, arity } => (2, target.get() as u64, *arity as u64),
        Instruction::Return => (3, 0, 0),
        Instruction::Do { or_value } => (4, *or_value as u64, 0),
        Instruction::JFun { target, noeval } => (5, target.get() as u64, *noeval as u64),
        Instruction::JFalse { target } => (6, target.get() as u64, 0),
        Instruction::Jump { target } => (7, target.get() as u64, 0),
        Instruction::Push { offset } => (8, *offset as u64, 0),
        Instruction::Update { offset } => (9, *offset as u64, 0),
        Instruction::Alloc { count } => (10, *count as u64, 0),
        Instruction::Squeeze { count, remove } => (11, *count as u64, *remove as u64),
        Instruction::MkCap { target, num_args } => (12, target.get() as u64, *num_args as u64),
        Instruction::MkFrame { target, num_args } => (13, target.get() as u64, *num_args as u64),
        Instruction::Bif { target } => (14, target.function_id().get() as u64, 0),
        Instruction::PushNil => (15, 0, 0),
        Instruction::PushNumber { value } => (16, f64::from(*value).to_bits(), 0),
        Instruction::PushString { index } => (17, *index as u64, 0),
        Instruction::Pop { count } => (18, *count as u64, 0),
        Instruction::Eval { offset } => (19, *offset as u64, 0),
        Instruction::Resolve { offset } => (20, *offset as u64, 0),
    }
}

fn decode_instruction(opcode: u8, arg0: u64, arg1: u64) -> Result<Instruction, String> {
    Ok(match opcode {
        0 => Instruction::Begin,
        1 => Instruction::End,
        2 => Instruction::GlobStart {
            target: FunctionId::from(arg0 as usize),
            arity: arg1 as usize,
        },
        3 => Instruction::Return,
        4 => Instruction::Do {
            or_value: arg0 != 0,
        },
        5 => Instruction::JFun {
            target: FunctionId::from(arg0 as usize),
            noeval: arg1 != 0,
        },
        6 => Instruction::JFalse {
            target: InstructionPointer::new(arg0 as usize),
        },
        7 => Instruction::Jump {
            target: InstructionPointer::new(arg0 as usize),
        },
        8 => Instruction::Push {
            offset: arg0 as usize,
        },
        9 => Instruction::Update {
            offset: arg0 as usize,
        },
        10 => Instruction::Alloc {
            count: arg0 as usize,
        },
        11 => Instruction::Squeeze {
            count: arg0 as usize,
            remove: arg1 as usize,
        },
        12 => Instruction::MkCap {
            target: FunctionId::from(arg0 as usize),
            num_args: arg1 as usize,
        },
        13 => Instruction::MkFrame {
            target: FunctionId::from(arg0 as usize),
            num_args: arg1 as usize,
        },
        14 => Instruction::Bif {
            target: Builtin::from_function_id(FunctionId::from(arg0 as usize))
                .ok_or_else(|| format!("Unknown builtin opcode: {}", arg0))?,
        },
        15 => Instruction::PushNil,
        16 => Instruction::PushNumber {
            value: FloatValue::from(f64::from_bits(arg0)),
        },
        17 => Instruction::PushString {
            index: arg0 as usize,
        },
        18 => Instruction::Pop {
            count: arg0 as usize,
        },
        19 => Instruction::Eval {
            offset: arg0 as usize,
        },
        20 => Instruction::Resolve {
            offset: arg0 as usize,
        },
        other => return Err(format!("Unknown opcode: {}", other)),
    })
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}
impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }
    fn bytes(&mut self, count: usize) -> Result<&'a [u8], String> {
        if self.position + count > self.bytes.len() {
            return Err(String::from("Truncated bytecode module"));
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }
    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.bytes(1)?[0])
    }
    fn u32(&mut self) -> Result<u32, String> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
    fn u64(&mut self) -> Result<u64, String> {
        let bytes = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{Module, SNode, Scomb};
    use crate::{Compiler, CompilerOptions};

    fn sample_module() -> BytecodeModule {
        let mut module = Module::default();
        module.add(Scomb::new(
            "main",
            [] as [&str; 0],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::number(1.0), SNode::number(2.0)],
            ),
        ));
        Compiler::new(CompilerOptions::default())
            .compile(module)
            .unwrap()
    }

    #[test]
    fn encode_decode_round_trip() {
        let original = sample_module();
        let decoded = BytecodeModule::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn rejects_invalid_signature() {
        let mut bytes = sample_module().encode();
        bytes[0] = b'X';
        let error = BytecodeModule::decode(&bytes).err().unwrap();
        assert!(error.contains("signature"), "{}", error);
    }

    #[test]
    fn rejects_truncated_modules() {
        let bytes = sample_module().encode();
        let error = BytecodeModule::decode(&bytes[..bytes.len() / 2])
            .err()
            .unwrap();
        assert!(error.contains("Truncated"), "{}", error);
    }

    #[test]
    fn rejects_unknown_opcodes() {
        let mut bytes = sample_module().encode();
        // First instruction record starts after the 36-byte header
        bytes[36] = 0xEE;
        assert!(BytecodeModule::decode(&bytes).is_err());
    }
}

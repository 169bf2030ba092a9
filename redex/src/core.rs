// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};

/// Offset into a compiled instruction stream
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Debug, Hash, Serialize, Deserialize,
)]
pub struct InstructionPointer(pub usize);
impl InstructionPointer {
    pub fn new(address: usize) -> Self {
        Self(address)
    }
    pub fn get(&self) -> usize {
        let Self(address) = self;
        *address
    }
    pub fn advance(&self) -> Self {
        self.offset(1)
    }
    pub fn offset(&self, offset: usize) -> Self {
        let Self(address) = self;
        Self(address + offset)
    }
}
impl std::fmt::LowerHex for InstructionPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(value) = self;
        write!(f, "0x{:08x}", value)
    }
}
impl std::fmt::Display for InstructionPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self)
    }
}

/// Offset from the top of a frame's local value stack (0 = topmost entry)
pub type StackOffset = usize;

/// Index into the combined builtin + supercombinator function table
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Debug, Hash, Serialize, Deserialize,
)]
pub struct FunctionId(pub usize);
impl FunctionId {
    pub fn get(&self) -> usize {
        let Self(value) = self;
        *value
    }
}
impl From<usize> for FunctionId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(value) = self;
        write!(f, "<fn:{}>", value)
    }
}

/// Identifies one VM instance within a cluster
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Debug, Hash, Serialize, Deserialize,
)]
pub struct TaskId(pub usize);
impl TaskId {
    pub fn get(&self) -> usize {
        let Self(value) = self;
        *value
    }
}
impl From<usize> for TaskId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(value) = self;
        write!(f, "<task:{}>", value)
    }
}

/// Task-unique identifier assigned to an exported heap object
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Debug, Hash, Serialize, Deserialize,
)]
pub struct LocalId(pub u64);
impl LocalId {
    pub fn next(&self) -> Self {
        let Self(value) = self;
        Self(value + 1)
    }
}
impl From<u64> for LocalId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(value) = self;
        write!(f, "{}", value)
    }
}

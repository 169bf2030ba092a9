// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};

use crate::cell::{CapId, CellPtr, FrameId};
use crate::core::{FunctionId, InstructionPointer};
use crate::global::GAddr;

/// Lifecycle of an activation record. `New` frames exist only as graph
/// nodes; `Sparked` frames are queued as available parallel work; `Running`
/// frames are on the runnable queue; `Blocked` frames await a value owned
/// by another frame or another task; `Done` frames have had their heap
/// cell overwritten with the result.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum FrameState {
    New,
    Sparked,
    Running,
    Blocked,
    Done,
}

/// Activation record for one supercombinator or builtin invocation
#[derive(Clone, Debug)]
pub struct Frame {
    pub function: Option<FunctionId>,
    pub address: InstructionPointer,
    /// Local value stack; index 0 is the bottom
    pub data: Vec<CellPtr>,
    pub state: FrameState,
    /// Heap cell representing this frame as a graph node
    pub cell: Option<CellPtr>,
    /// Local frames blocked waiting for this frame's value
    pub waiters: Vec<FrameId>,
    /// Remote store addresses awaiting this frame's value
    pub fetchers: Vec<GAddr>,
}
impl Frame {
    pub fn new(address: InstructionPointer) -> Self {
        Self {
            function: None,
            address,
            data: Vec::new(),
            state: FrameState::New,
            cell: None,
            waiters: Vec::new(),
            fetchers: Vec::new(),
        }
    }
    pub fn top(&self) -> Option<CellPtr> {
        self.data.last().copied()
    }
    /// Value at the given offset from the top of the local stack
    pub fn at_offset(&self, offset: usize) -> CellPtr {
        self.data[self.data.len() - 1 - offset]
    }
    pub fn set_at_offset(&mut self, offset: usize, value: CellPtr) {
        let index = self.data.len() - 1 - offset;
        self.data[index] = value;
    }
}

/// Partial application: a closure capturing fewer arguments than the
/// function requires. Becomes a frame once saturated.
#[derive(Clone, Debug)]
pub struct Cap {
    pub function: FunctionId,
    pub arity: usize,
    pub address: InstructionPointer,
    /// Captured arguments, in stack order (earliest-declared argument last)
    pub args: Vec<CellPtr>,
}
impl Cap {
    pub fn new(
        function: FunctionId,
        arity: usize,
        address: InstructionPointer,
        args: Vec<CellPtr>,
    ) -> Self {
        Self {
            function,
            arity,
            address,
            args,
        }
    }
}

/// Slab of frame records with id-based handles; frames are engine-owned
/// mutable state, kept out of cell payloads so heap slots stay plain data
pub struct FrameArena {
    entries: Vec<Option<Frame>>,
    free: Vec<FrameId>,
}
impl Default for FrameArena {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}
impl FrameArena {
    pub fn insert(&mut self, frame: Frame) -> FrameId {
        match self.free.pop() {
            Some(id) => {
                self.entries[id.index()] = Some(frame);
                id
            }
            None => {
                let id = FrameId(self.entries.len() as u32);
                self.entries.push(Some(frame));
                id
            }
        }
    }
    pub fn get(&self, id: FrameId) -> &Frame {
        self.entries[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("Access to deallocated frame {:?}", id))
    }
    pub fn get_mut(&mut self, id: FrameId) -> &mut Frame {
        self.entries[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("Access to deallocated frame {:?}", id))
    }
    pub fn contains(&self, id: FrameId) -> bool {
        self.entries
            .get(id.index())
            .map(|entry| entry.is_some())
            .unwrap_or(false)
    }
    pub fn remove(&mut self, id: FrameId) -> Frame {
        let frame = self.entries[id.index()]
            .take()
            .unwrap_or_else(|| panic!("Double free of frame {:?}", id));
        self.free.push(id);
        frame
    }
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &Frame)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry.as_ref().map(|frame| (FrameId(index as u32), frame))
            })
    }
}

/// Slab of partial application records
pub struct CapArena {
    entries: Vec<Option<Cap>>,
    free: Vec<CapId>,
}
impl Default for CapArena {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}
impl CapArena {
    pub fn insert(&mut self, cap: Cap) -> CapId {
        match self.free.pop() {
            Some(id) => {
                self.entries[id.index()] = Some(cap);
                id
            }
            None => {
                let id = CapId(self.entries.len() as u32);
                self.entries.push(Some(cap));
                id
            }
        }
    }
    pub fn get(&self, id: CapId) -> &Cap {
        self.entries[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("Access to deallocated cap {:?}", id))
    }
    pub fn remove(&mut self, id: CapId) -> Cap {
        let cap = self.entries[id.index()]
            .take()
            .unwrap_or_else(|| panic!("Double free of cap {:?}", id));
        self.free.push(id);
        cap
    }
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reuses_freed_slots() {
        let mut arena = FrameArena::default();
        let first = arena.insert(Frame::new(InstructionPointer::default()));
        let second = arena.insert(Frame::new(InstructionPointer::default()));
        assert_ne!(first, second);
        arena.remove(first);
        let third = arena.insert(Frame::new(InstructionPointer::default()));
        assert_eq!(first, third);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn stack_offsets_count_from_the_top() {
        let mut frame = Frame::new(InstructionPointer::default());
        frame.data = vec![CellPtr(10), CellPtr(11), CellPtr(12)];
        assert_eq!(frame.at_offset(0), CellPtr(12));
        assert_eq!(frame.at_offset(2), CellPtr(10));
        frame.set_at_offset(1, CellPtr(20));
        assert_eq!(frame.data, vec![CellPtr(10), CellPtr(20), CellPtr(12)]);
    }
}

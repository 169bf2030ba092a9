// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use redex::cell::{CellPtr, CellValue};
use redex::core::{FunctionId, LocalId, TaskId};
use redex::frame::FrameState;
use redex::global::GAddr;
use redex::stdlib::Builtin;
use redex_interpreter::Machine;

const TAG_NUMBER: u8 = 1;
const TAG_NIL: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_BUILTIN: u8 = 4;
const TAG_SCREF: u8 = 5;
const TAG_REF: u8 = 6;
const TAG_CONS: u8 = 7;
const TAG_FRAME: u8 = 8;
const TAG_CAP: u8 = 9;

/// Serializes heap sub-graphs into the recursive self-describing wire
/// encoding: numbers and nil inline, cons spines one cell at a time with
/// children as either inline values or global-address references, frames
/// by code address plus locals. Every address written is recorded so the
/// sender can keep it alive until acknowledged.
pub struct Writer {
    bytes: Vec<u8>,
    addrs: Vec<GAddr>,
}
impl Writer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            addrs: Vec::new(),
        }
    }
    pub fn into_parts(self) -> (Vec<u8>, Vec<GAddr>) {
        (self.bytes, self.addrs)
    }

    pub fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }
    pub fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }
    pub fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }
    pub fn f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_bits().to_le_bytes());
    }
    pub fn str(&mut self, value: &str) {
        self.u32(value.len() as u32);
        self.bytes.extend_from_slice(value.as_bytes());
    }
    pub fn gaddr(&mut self, addr: GAddr) {
        self.u32(addr.owner.get() as u32);
        self.u64(addr.lid.map(|lid| lid.0).unwrap_or(u64::MAX));
        self.addrs.push(addr);
    }

    /// Write one graph node in full. The node itself is always encoded;
    /// its children are inline only when they are immediate values.
    pub fn value(&mut self, machine: &mut Machine, ptr: CellPtr) -> Result<(), String> {
        let ptr = machine.heap.resolve(ptr);
        let task_id = machine.task_id();
        let in_dist_gc = machine.heap.in_dist_gc();
        match machine.heap.value(ptr).clone() {
            CellValue::Number(value) => {
                self.u8(TAG_NUMBER);
                self.f64(value);
                Ok(())
            }
            CellValue::Nil => {
                self.u8(TAG_NIL);
                Ok(())
            }
            CellValue::Str(value) => {
                self.u8(TAG_STRING);
                self.str(&value);
                Ok(())
            }
            CellValue::Builtin(builtin) => {
                self.u8(TAG_BUILTIN);
                self.u32(builtin.function_id().get() as u32);
                Ok(())
            }
            CellValue::ScRef(function) => {
                self.u8(TAG_SCREF);
                self.u32(function.get() as u32);
                Ok(())
            }
            CellValue::RemoteRef(global_id) => {
                let addr = machine.heap.globals.get(global_id).addr;
                if addr.is_pending() {
                    return Err(String::from(
                        "Cannot export a reference awaiting address assignment",
                    ));
                }
                self.u8(TAG_REF);
                self.gaddr(addr);
                Ok(())
            }
            CellValue::Cons { head, tail } => {
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_CONS);
                self.gaddr(addr);
                self.reference(machine, head)?;
                self.reference(machine, tail)
            }
            CellValue::Array(array) => {
                if array.is_empty() {
                    return self.value(machine, array.tail);
                }
                let head = array.elements[0];
                let rest = machine.array_suffix_ptr(ptr, 1);
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_CONS);
                self.gaddr(addr);
                self.reference(machine, head)?;
                self.reference(machine, rest)
            }
            CellValue::ArrayRef { array, index } => {
                let (head, rest) = match machine.heap.value(array).clone() {
                    CellValue::Array(chunk) if index < chunk.len() => {
                        (chunk.elements[index], machine.array_suffix_ptr(array, index + 1))
                    }
                    _ => return Err(String::from("Dangling array reference")),
                };
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_CONS);
                self.gaddr(addr);
                self.reference(machine, head)?;
                self.reference(machine, rest)
            }
            CellValue::Frame(frame_id) => {
                let frame = machine.heap.frames.get(frame_id);
                if frame.state != FrameState::New {
                    return Err(String::from("Cannot export a started frame"));
                }
                let function = frame
                    .function
                    .ok_or_else(|| String::from("Cannot export the program root frame"))?;
                let locals = frame.data.clone();
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_FRAME);
                self.gaddr(addr);
                self.u32(function.get() as u32);
                self.u32(locals.len() as u32);
                for local in locals {
                    self.reference(machine, local)?;
                }
                Ok(())
            }
            CellValue::Cap(cap_id) => {
                let cap = machine.heap.caps.get(cap_id).clone();
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_CAP);
                self.gaddr(addr);
                self.u32(cap.function.get() as u32);
                self.u32(cap.args.len() as u32);
                for arg in cap.args {
                    self.reference(machine, arg)?;
                }
                Ok(())
            }
            CellValue::Hole => {
                // A not-yet-computed recursive binding crosses the wire as
                // a reference back to the owner
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_REF);
                self.gaddr(addr);
                Ok(())
            }
            CellValue::Application { .. } => {
                // An unevaluated redex crosses the wire as a reference back
                // to the owner (everything not encoded by value travels as a
                // GAddr reference)
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_REF);
                self.gaddr(addr);
                Ok(())
            }
            CellValue::Ind(_) | CellValue::Empty => {
                Err(String::from("Cannot export a reclaimed cell"))
            }
        }
    }

    /// Write a child pointer: immediate values inline, anything else as a
    /// global-address reference for the receiver to fetch on demand
    pub fn reference(&mut self, machine: &mut Machine, ptr: CellPtr) -> Result<(), String> {
        let ptr = machine.heap.resolve(ptr);
        match machine.heap.value(ptr) {
            CellValue::Number(_) | CellValue::Nil => self.value(machine, ptr),
            CellValue::RemoteRef(global_id) => {
                let addr = machine.heap.globals.get(*global_id).addr;
                if addr.is_pending() {
                    return Err(String::from(
                        "Cannot export a reference awaiting address assignment",
                    ));
                }
                self.u8(TAG_REF);
                self.gaddr(addr);
                Ok(())
            }
            _ => {
                let task_id = machine.task_id();
                let in_dist_gc = machine.heap.in_dist_gc();
                let export = machine.heap.globals.export(task_id, ptr, in_dist_gc);
                let addr = machine.heap.globals.get(export).addr;
                self.u8(TAG_REF);
                self.gaddr(addr);
                Ok(())
            }
        }
    }
}

/// Deserializes wire payloads back into heap graphs, tracking how many
/// global addresses were read so receipt can be acknowledged. A truncated
/// or mis-tagged payload is a corrupt-channel condition reported as an
/// error; the reading task halts rather than attempting recovery.
pub struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
    naddrs: usize,
}
impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            naddrs: 0,
        }
    }
    pub fn addr_count(&self) -> usize {
        self.naddrs
    }
    pub fn is_empty(&self) -> bool {
        self.position >= self.bytes.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], String> {
        if self.position + count > self.bytes.len() {
            return Err(String::from("Truncated message payload"));
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }
    pub fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }
    pub fn u32(&mut self) -> Result<u32, String> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
    pub fn u64(&mut self) -> Result<u64, String> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }
    pub fn f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_bits(self.u64()?))
    }
    pub fn str(&mut self) -> Result<String, String> {
        let length = self.u32()? as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| String::from("Invalid string payload"))
    }
    pub fn gaddr(&mut self) -> Result<GAddr, String> {
        let owner = TaskId(self.u32()? as usize);
        let lid = self.u64()?;
        self.naddrs += 1;
        if lid == u64::MAX {
            Err(String::from("Pending address in message payload"))
        } else {
            Ok(GAddr::new(owner, LocalId(lid)))
        }
    }

    /// Read one graph node, materializing it in the receiving machine's
    /// heap. References to objects already known locally are resolved
    /// through the global table rather than duplicated.
    pub fn value(&mut self, machine: &mut Machine) -> Result<CellPtr, String> {
        match self.u8()? {
            TAG_NUMBER => {
                let value = self.f64()?;
                Ok(machine.heap.alloc(CellValue::Number(value)))
            }
            TAG_NIL => Ok(machine.nil_ptr()),
            TAG_STRING => {
                let value = self.str()?;
                Ok(machine.heap.alloc(CellValue::Str(value.into())))
            }
            TAG_BUILTIN => {
                let id = FunctionId::from(self.u32()? as usize);
                let builtin = Builtin::from_function_id(id)
                    .ok_or_else(|| format!("Unknown builtin in payload: {}", id))?;
                Ok(machine.heap.alloc(CellValue::Builtin(builtin)))
            }
            TAG_SCREF => {
                let id = FunctionId::from(self.u32()? as usize);
                if id.get() >= machine.module().functions.len() {
                    return Err(format!("Unknown function in payload: {}", id));
                }
                Ok(machine.heap.alloc(CellValue::ScRef(id)))
            }
            TAG_REF => {
                let addr = self.gaddr()?;
                import_reference(machine, addr)
            }
            TAG_CONS => {
                let addr = self.gaddr()?;
                let head = self.value(machine)?;
                let tail = self.value(machine)?;
                if let Some(existing) = machine.heap.globals.lookup_by_addr(addr) {
                    return Ok(machine.heap.globals.get(existing).ptr);
                }
                let cell = machine.heap.alloc(CellValue::Cons { head, tail });
                let in_dist_gc = machine.heap.in_dist_gc();
                machine.heap.globals.add(addr, cell, in_dist_gc);
                Ok(cell)
            }
            TAG_FRAME => {
                let addr = self.gaddr()?;
                let function = FunctionId::from(self.u32()? as usize);
                if function.get() >= machine.module().functions.len() {
                    return Err(format!("Unknown function in payload: {}", function));
                }
                let count = self.u32()? as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count {
                    locals.push(self.value(machine)?);
                }
                if let Some(existing) = machine.heap.globals.lookup_by_addr(addr) {
                    return Ok(machine.heap.globals.get(existing).ptr);
                }
                let cell = machine.alloc_frame(function, locals);
                let in_dist_gc = machine.heap.in_dist_gc();
                machine.heap.globals.add(addr, cell, in_dist_gc);
                Ok(cell)
            }
            TAG_CAP => {
                let addr = self.gaddr()?;
                let function = FunctionId::from(self.u32()? as usize);
                let info = *machine
                    .module()
                    .functions
                    .get(function.get())
                    .ok_or_else(|| format!("Unknown function in payload: {}", function))?;
                let count = self.u32()? as usize;
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(self.value(machine)?);
                }
                if let Some(existing) = machine.heap.globals.lookup_by_addr(addr) {
                    return Ok(machine.heap.globals.get(existing).ptr);
                }
                let cap = redex::frame::Cap::new(function, info.arity, info.address, args);
                let cap_id = machine.heap.caps.insert(cap);
                let cell = machine.heap.alloc(CellValue::Cap(cap_id));
                let in_dist_gc = machine.heap.in_dist_gc();
                machine.heap.globals.add(addr, cell, in_dist_gc);
                Ok(cell)
            }
            other => Err(format!("Unknown payload tag: {}", other)),
        }
    }
}

/// Resolve an incoming address: the owner resolves it in its own table; a
/// non-owner reuses its existing binding or creates a fresh remote
/// reference whose value will be fetched on demand
pub fn import_reference(machine: &mut Machine, addr: GAddr) -> Result<CellPtr, String> {
    if addr.owner.get() >= machine.group_size() {
        return Err(format!("Reference to unknown task: {}", addr));
    }
    if addr.owner == machine.task_id() {
        let existing = machine
            .heap
            .globals
            .lookup_by_addr(addr)
            .ok_or_else(|| format!("Reference to unknown local object: {}", addr))?;
        return Ok(machine.heap.globals.get(existing).ptr);
    }
    if let Some(existing) = machine.heap.globals.lookup_by_addr(addr) {
        return Ok(machine.heap.globals.get(existing).ptr);
    }
    let in_dist_gc = machine.heap.in_dist_gc();
    let cell = machine.heap.alloc(CellValue::Hole);
    let global_id = machine.heap.globals.add(addr, cell, in_dist_gc);
    machine.heap.update(cell, CellValue::RemoteRef(global_id));
    Ok(cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use redex_compiler::syntax::{Module, SNode, Scomb};
    use redex_compiler::{Compiler, CompilerOptions};
    use redex_interpreter::{InterpreterOptions, Value};

    fn test_machine(task_id: TaskId) -> Machine {
        let mut module = Module::default();
        module.add(Scomb::new("main", [] as [&str; 0], SNode::number(0.0)));
        let compiled = Arc::new(
            Compiler::new(CompilerOptions::default())
                .compile(module)
                .unwrap(),
        );
        Machine::new(compiled, task_id, 2, InterpreterOptions::default())
    }

    #[test]
    fn immediate_values_round_trip() {
        let mut sender = test_machine(TaskId(0));
        let mut receiver = test_machine(TaskId(1));
        let value = sender.heap.alloc(CellValue::Number(42.5));
        let mut writer = Writer::new();
        writer.value(&mut sender, value).unwrap();
        let (bytes, addrs) = writer.into_parts();
        assert!(addrs.is_empty());
        let mut reader = Reader::new(&bytes);
        let imported = reader.value(&mut receiver).unwrap();
        assert_eq!(receiver.read_back(imported), Value::Number(42.5));
    }

    #[test]
    fn cons_cells_transfer_one_spine_level_at_a_time() {
        let mut sender = test_machine(TaskId(0));
        let mut receiver = test_machine(TaskId(1));
        // [1, 2, 3] built from cons cells
        let nil = sender.nil_ptr();
        let list = [3.0, 2.0, 1.0].iter().fold(nil, |tail, value| {
            let head = sender.heap.alloc(CellValue::Number(*value));
            sender.heap.alloc(CellValue::Cons { head, tail })
        });
        let mut writer = Writer::new();
        writer.value(&mut sender, list).unwrap();
        let (bytes, _) = writer.into_parts();
        let imported = Reader::new(&bytes).value(&mut receiver).unwrap();
        // Only the first cell crossed the boundary: the head is present,
        // the rest of the spine is an unfetched remote reference
        match receiver.read_back(imported) {
            Value::Cons(head, tail) => {
                assert_eq!(*head, Value::Number(1.0));
                assert_eq!(*tail, Value::Thunk);
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn references_to_known_objects_are_shared_not_duplicated() {
        let mut sender = test_machine(TaskId(0));
        let mut receiver = test_machine(TaskId(1));
        let head = sender.heap.alloc(CellValue::Number(7.0));
        let nil = sender.nil_ptr();
        let pair = sender.heap.alloc(CellValue::Cons { head, tail: nil });
        let mut writer = Writer::new();
        writer.value(&mut sender, pair).unwrap();
        let (bytes, _) = writer.into_parts();
        let first = Reader::new(&bytes).value(&mut receiver).unwrap();
        let second = Reader::new(&bytes).value(&mut receiver).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn owners_resolve_references_to_their_own_objects() {
        let mut sender = test_machine(TaskId(0));
        let value = sender.heap.alloc(CellValue::Number(3.0));
        let task_id = sender.task_id();
        let export = sender.heap.globals.export(task_id, value, false);
        let addr = sender.heap.globals.get(export).addr;
        let resolved = import_reference(&mut sender, addr).unwrap();
        assert_eq!(resolved, value);
    }

    #[test]
    fn truncated_payloads_are_protocol_errors() {
        let mut sender = test_machine(TaskId(0));
        let mut receiver = test_machine(TaskId(1));
        let value = sender.heap.alloc(CellValue::Str("hello".into()));
        let mut writer = Writer::new();
        writer.value(&mut sender, value).unwrap();
        let (bytes, _) = writer.into_parts();
        let error = Reader::new(&bytes[..bytes.len() - 2])
            .value(&mut receiver)
            .err()
            .unwrap();
        assert!(error.contains("Truncated"), "{}", error);
    }

    #[test]
    fn array_chunks_cross_the_wire_as_cons_spines() {
        use redex::cell::CellArray;
        let mut sender = test_machine(TaskId(0));
        let mut receiver = test_machine(TaskId(1));
        let nil = sender.nil_ptr();
        let elements = (1..=3)
            .map(|value| sender.heap.alloc(CellValue::Number(value as f64)))
            .collect::<Vec<_>>();
        let array = sender
            .heap
            .alloc(CellValue::Array(CellArray::new(elements, nil)));
        let mut writer = Writer::new();
        writer.value(&mut sender, array).unwrap();
        let (bytes, _) = writer.into_parts();
        let imported = Reader::new(&bytes).value(&mut receiver).unwrap();
        match receiver.read_back(imported) {
            Value::Cons(head, _) => assert_eq!(*head, Value::Number(1.0)),
            other => panic!("unexpected value: {:?}", other),
        }
    }
}

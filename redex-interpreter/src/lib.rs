// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use redex::cell::{CapId, CellPtr, CellValue, FrameId};
use redex::core::{FunctionId, InstructionPointer, TaskId};
use redex::frame::{Cap, Frame, FrameState};
use redex::global::GAddr;
use redex::hash::IntMap;
use redex::heap::{GcRoots, Heap};
use redex::stdlib::Builtin;
use redex_compiler::bytecode::BytecodeModule;
use redex_compiler::program::Instruction;

mod builtins;

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct InterpreterOptions {
    pub debug_instructions: bool,
    /// Cell allocations between collection cycles
    pub collect_threshold: usize,
}
impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            debug_instructions: false,
            collect_threshold: 8192,
        }
    }
}
impl InterpreterOptions {
    pub fn debug() -> Self {
        Self {
            debug_instructions: true,
            ..Self::default()
        }
    }
}

/// Why a run slice stopped
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MachineStatus {
    /// The root frame has produced its final value
    Done,
    /// No runnable or sparked frames remain; any blocked frames await
    /// values from other tasks
    Idle,
    OutOfFuel,
}

/// Engine-to-runtime requests crossing the task boundary. The engine
/// never performs IO itself; the runtime layer drains these into protocol
/// messages.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum RemoteRequest {
    /// A frame dereferenced an unfetched remote value
    Fetch { target: GAddr, store: GAddr },
    /// A previously requested value now exists locally and the given
    /// remote store address awaits it
    Transfer { value: CellPtr, store: GAddr },
}

#[derive(Default, Clone, Debug)]
pub struct MachineStats {
    pub ninstrs: usize,
    /// Completed reductions (each writes one indirection over its redex)
    pub nreductions: usize,
    pub nsparks: usize,
    pub sparks_used: usize,
    pub fetches: usize,
    /// Completed calls per function id
    pub funcalls: IntMap<usize, usize>,
}
impl MachineStats {
    pub fn calls(&self, id: FunctionId) -> usize {
        self.funcalls.get(&id.get()).copied().unwrap_or(0)
    }
}

/// A single-threaded virtual machine instance: one heap, one instruction
/// pointer, scheduling queues for its frames. Parallelism exists only
/// across machines, which communicate exclusively through the outbox and
/// the runtime layer's message protocol.
pub struct Machine {
    pub heap: Heap,
    module: Arc<BytecodeModule>,
    strings: Vec<CellPtr>,
    nil: CellPtr,
    truth: CellPtr,
    runnable: Vec<FrameId>,
    sparked: VecDeque<FrameId>,
    result: Option<CellPtr>,
    done: bool,
    options: InterpreterOptions,
    pub stats: MachineStats,
    outbox: Vec<RemoteRequest>,
    group_size: usize,
}

impl Machine {
    pub fn new(
        module: Arc<BytecodeModule>,
        task_id: TaskId,
        group_size: usize,
        options: InterpreterOptions,
    ) -> Self {
        let mut heap = Heap::new(task_id);
        let strings = module
            .strings
            .iter()
            .map(|value| heap.alloc_pinned(CellValue::Str(value.as_str().into())))
            .collect::<Vec<_>>();
        let nil = heap.alloc_pinned(CellValue::Nil);
        let truth = heap.alloc_pinned(CellValue::Number(1.0));
        let entry = module.entry;
        let mut machine = Self {
            heap,
            module,
            strings,
            nil,
            truth,
            runnable: Vec::new(),
            sparked: VecDeque::new(),
            result: None,
            done: false,
            options,
            stats: MachineStats::default(),
            outbox: Vec::new(),
            group_size,
        };
        // The program root lives on the first task; the rest of the
        // cluster starts idle and acquires work by stealing sparks
        if task_id == TaskId::default() {
            let root = machine.heap.frames.insert(Frame::new(entry));
            machine.heap.frames.get_mut(root).state = FrameState::Running;
            machine.runnable.push(root);
        }
        machine
    }

    pub fn task_id(&self) -> TaskId {
        self.heap.task_id()
    }
    pub fn group_size(&self) -> usize {
        self.group_size
    }
    pub fn module(&self) -> &Arc<BytecodeModule> {
        &self.module
    }
    pub fn is_done(&self) -> bool {
        self.done
    }
    pub fn result(&self) -> Option<CellPtr> {
        self.result
    }
    pub fn nil_ptr(&self) -> CellPtr {
        self.nil
    }
    pub fn true_ptr(&self) -> CellPtr {
        self.truth
    }
    pub fn string_ptr(&self, index: usize) -> Option<CellPtr> {
        self.strings.get(index).copied()
    }
    pub fn take_outbox(&mut self) -> Vec<RemoteRequest> {
        std::mem::take(&mut self.outbox)
    }
    pub fn has_sparks(&self) -> bool {
        !self.sparked.is_empty()
    }
    pub fn has_runnable(&self) -> bool {
        !self.runnable.is_empty() || !self.sparked.is_empty()
    }

    // --- frame scheduling -------------------------------------------------

    pub fn spark_frame(&mut self, id: FrameId) {
        let frame = self.heap.frames.get_mut(id);
        if frame.state == FrameState::New {
            frame.state = FrameState::Sparked;
            self.sparked.push_back(id);
            self.stats.nsparks += 1;
        }
    }
    pub fn unspark_frame(&mut self, id: FrameId) {
        let frame = self.heap.frames.get_mut(id);
        if frame.state == FrameState::Sparked {
            frame.state = FrameState::New;
            self.sparked.retain(|existing| *existing != id);
        }
    }
    pub fn run_frame(&mut self, id: FrameId) {
        match self.heap.frames.get(id).state {
            FrameState::New => {}
            FrameState::Sparked => self.unspark_frame(id),
            _ => return,
        }
        self.begin_running(id);
    }
    fn begin_running(&mut self, id: FrameId) {
        let function = {
            let frame = self.heap.frames.get_mut(id);
            frame.state = FrameState::Running;
            frame.function
        };
        self.runnable.push(id);
        if let Some(function) = function {
            self.count_call(function);
        }
    }
    /// Applications are counted as functions are entered (a tail call
    /// re-enters the same activation record under a new function)
    fn count_call(&mut self, function: FunctionId) {
        *self.stats.funcalls.entry(function.get()).or_default() += 1;
    }
    fn block_frame(&mut self, id: FrameId) {
        debug_assert_eq!(self.runnable.last(), Some(&id));
        self.runnable.pop();
        self.heap.frames.get_mut(id).state = FrameState::Blocked;
    }
    fn unblock_frame(&mut self, id: FrameId) {
        let frame = self.heap.frames.get_mut(id);
        if frame.state == FrameState::Blocked {
            frame.state = FrameState::Running;
            self.runnable.push(id);
        }
    }
    fn done_frame(&mut self, id: FrameId) {
        debug_assert_eq!(self.runnable.last(), Some(&id));
        self.runnable.pop();
        self.heap.frames.get_mut(id).state = FrameState::Done;
    }
    /// Resume a frame blocked on a value that has since arrived
    pub fn wake_frame(&mut self, id: FrameId) {
        self.unblock_frame(id);
    }
    /// Remove up to `max` frames from the cold end of the spark pool, for
    /// migration to an idle task
    pub fn steal_sparks(&mut self, max: usize) -> Vec<FrameId> {
        let mut stolen = Vec::new();
        while stolen.len() < max {
            match self.sparked.pop_back() {
                Some(id) => {
                    self.heap.frames.get_mut(id).state = FrameState::New;
                    stolen.push(id);
                }
                None => break,
            }
        }
        stolen
    }

    // --- frame completion -------------------------------------------------

    /// Overwrite the frame's redex cell with an indirection to the result
    /// (memoizing the reduction), wake everything waiting on it, and
    /// reclaim the activation record
    fn frame_return(&mut self, id: FrameId, value: CellPtr) {
        let value = self.heap.resolve(value);
        let (cell, waiters, fetchers) = {
            let frame = self.heap.frames.get_mut(id);
            (
                frame.cell.take(),
                std::mem::take(&mut frame.waiters),
                std::mem::take(&mut frame.fetchers),
            )
        };
        if let Some(cell) = cell {
            self.heap.update(cell, CellValue::Ind(value));
        }
        self.stats.nreductions += 1;
        self.done_frame(id);
        for waiter in waiters {
            self.unblock_frame(waiter);
        }
        for store in fetchers {
            self.outbox.push(RemoteRequest::Transfer { value, store });
        }
        self.heap.frames.remove(id);
    }

    /// Complete a frame whose application turned out to be under-saturated:
    /// its cell becomes a partial application closure rather than an
    /// indirection
    fn frame_return_cap(&mut self, id: FrameId, cap: Cap) {
        let cap_id = self.heap.caps.insert(cap);
        let (cell, waiters, fetchers) = {
            let frame = self.heap.frames.get_mut(id);
            (
                frame.cell.take(),
                std::mem::take(&mut frame.waiters),
                std::mem::take(&mut frame.fetchers),
            )
        };
        let cap_cell = match cell {
            Some(cell) => {
                self.heap.update(cell, CellValue::Cap(cap_id));
                cell
            }
            None => self.heap.alloc(CellValue::Cap(cap_id)),
        };
        self.done_frame(id);
        for waiter in waiters {
            self.unblock_frame(waiter);
        }
        for store in fetchers {
            self.outbox.push(RemoteRequest::Transfer {
                value: cap_cell,
                store,
            });
        }
        self.heap.frames.remove(id);
    }

    // --- allocation helpers -----------------------------------------------

    pub fn alloc_number(&mut self, value: f64) -> CellPtr {
        self.heap.alloc(CellValue::Number(value))
    }
    pub fn bool_ptr(&self, value: bool) -> CellPtr {
        if value {
            self.truth
        } else {
            self.nil
        }
    }
    /// Allocate an unstarted frame for the given function with the given
    /// arguments (in stack order), returning its graph cell
    pub fn alloc_frame(&mut self, function: FunctionId, args: Vec<CellPtr>) -> CellPtr {
        let info = self.module.functions[function.get()];
        let mut frame = Frame::new(info.address);
        frame.function = Some(function);
        frame.data = args;
        let id = self.heap.frames.insert(frame);
        let cell = self.heap.alloc(CellValue::Frame(id));
        self.heap.frames.get_mut(id).cell = Some(cell);
        cell
    }

    // --- diagnostics ------------------------------------------------------

    fn function_name(&self, id: FunctionId) -> String {
        self.module
            .function_name(id)
            .map(String::from)
            .unwrap_or_else(|| id.to_string())
    }
    fn location(&self, address: InstructionPointer) -> String {
        self.module
            .locations
            .get(address.get())
            .map(|loc| loc.to_string())
            .unwrap_or_else(|| String::from("<unknown>"))
    }
    fn cap_error(&self, cap_id: CapId) -> String {
        let cap = self.heap.caps.get(cap_id);
        format!(
            "Attempt to evaluate incomplete function application: {} requires {} args, only have {}",
            self.function_name(cap.function),
            cap.arity,
            cap.args.len(),
        )
    }

    // --- garbage collection -----------------------------------------------

    pub fn gc_roots(&self) -> GcRoots {
        let mut roots = GcRoots::default();
        roots.cells.extend(self.strings.iter().copied());
        roots.cells.push(self.nil);
        roots.cells.push(self.truth);
        roots.cells.extend(self.result.iter().copied());
        for request in self.outbox.iter() {
            if let RemoteRequest::Transfer { value, .. } = request {
                roots.cells.push(*value);
            }
        }
        roots.frames.extend(self.runnable.iter().copied());
        roots.frames.extend(self.sparked.iter().copied());
        roots.frames.extend(
            self.heap
                .frames
                .iter()
                .filter(|(_, frame)| frame.state == FrameState::Blocked)
                .map(|(id, _)| id),
        );
        roots
    }
    pub fn collect(&mut self) {
        let roots = self.gc_roots();
        let metrics = self.heap.collect(&roots);
        trace!(task = %self.task_id(), "collected: {}", metrics);
    }
    fn collect_if_needed(&mut self) {
        if self.heap.allocs_since_collect() >= self.options.collect_threshold {
            self.collect();
        }
    }

    // --- execution --------------------------------------------------------

    /// Execute up to `fuel` instructions. Returns how the slice ended; an
    /// `Err` is a fatal runtime error that halts this task.
    pub fn run_slice(&mut self, fuel: usize) -> Result<MachineStatus, String> {
        let mut remaining = fuel;
        while remaining > 0 {
            if self.done {
                return Ok(MachineStatus::Done);
            }
            let current = match self.runnable.last().copied() {
                Some(id) => id,
                None => match self.sparked.pop_front() {
                    Some(id) => {
                        self.begin_running(id);
                        self.stats.sparks_used += 1;
                        continue;
                    }
                    None => return Ok(MachineStatus::Idle),
                },
            };
            self.collect_if_needed();
            remaining -= 1;
            self.step(current)?;
        }
        if self.done {
            Ok(MachineStatus::Done)
        } else {
            Ok(MachineStatus::OutOfFuel)
        }
    }

    /// Run a single-task machine until its root frame completes
    pub fn run_to_completion(&mut self) -> Result<CellPtr, String> {
        loop {
            match self.run_slice(usize::MAX)? {
                MachineStatus::Done => {
                    return self
                        .result
                        .ok_or_else(|| String::from("Machine completed without a result"))
                }
                MachineStatus::Idle => {
                    return Err(String::from(
                        "Deadlock: all frames blocked with no runnable work",
                    ))
                }
                MachineStatus::OutOfFuel => continue,
            }
        }
    }

    fn step(&mut self, current: FrameId) -> Result<(), String> {
        let address = self.heap.frames.get(current).address;
        let instruction = match self.module.instructions.get(address) {
            Some(instruction) => instruction.clone(),
            None => {
                return Err(format!(
                    "Invalid program instruction offset: {:x}",
                    address
                ))
            }
        };
        if self.options.debug_instructions {
            eprintln!("{:x} {:?}", address, instruction);
        }
        self.stats.ninstrs += 1;
        self.heap.frames.get_mut(current).address = address.advance();
        match instruction {
            Instruction::Begin | Instruction::GlobStart { .. } => {}
            Instruction::End => {
                let frame = self.heap.frames.get(current);
                let value = frame
                    .top()
                    .ok_or_else(|| String::from("End with empty stack"))?;
                self.result = Some(self.heap.resolve(value));
                self.done = true;
                self.done_frame(current);
                self.heap.frames.remove(current);
            }
            Instruction::Eval { offset } => {
                self.execute_eval(current, address, offset)?;
            }
            Instruction::Resolve { offset } => {
                let resolved = {
                    let frame = self.heap.frames.get(current);
                    self.heap.resolve(frame.at_offset(offset))
                };
                self.heap
                    .frames
                    .get_mut(current)
                    .set_at_offset(offset, resolved);
            }
            Instruction::Return => {
                let value = self
                    .heap
                    .frames
                    .get(current)
                    .top()
                    .ok_or_else(|| String::from("Return with empty stack"))?;
                self.frame_return(current, value);
            }
            Instruction::Do { or_value } => {
                self.execute_do(current, address, or_value)?;
            }
            Instruction::JFun { target, noeval } => {
                let info = self.module.functions[target.get()];
                {
                    let frame = self.heap.frames.get_mut(current);
                    frame.function = Some(target);
                    frame.address = if noeval {
                        info.noeval_address
                    } else {
                        info.address
                    };
                }
                self.count_call(target);
            }
            Instruction::JFalse { target } => {
                let frame = self.heap.frames.get_mut(current);
                let test = frame
                    .data
                    .pop()
                    .ok_or_else(|| String::from("JFalse with empty stack"))?;
                let test = self.heap.resolve(test);
                match *self.heap.value(test) {
                    CellValue::Cap(cap_id) => {
                        return Err(format!(
                            "{}: {}",
                            self.location(address),
                            self.cap_error(cap_id)
                        ))
                    }
                    CellValue::Nil => {
                        self.heap.frames.get_mut(current).address = target;
                    }
                    _ => {}
                }
            }
            Instruction::Jump { target } => {
                self.heap.frames.get_mut(current).address = target;
            }
            Instruction::Push { offset } => {
                let frame = self.heap.frames.get_mut(current);
                let value = frame.at_offset(offset);
                frame.data.push(value);
            }
            Instruction::Update { offset } => {
                let (value, slot_index) = {
                    let frame = self.heap.frames.get_mut(current);
                    let index = frame.data.len() - 1 - offset;
                    let value = frame
                        .data
                        .pop()
                        .ok_or_else(|| String::from("Update with empty stack"))?;
                    (value, index)
                };
                let value = self.heap.resolve(value);
                let target = self.heap.frames.get(current).data[slot_index];
                if !matches!(self.heap.value(target), CellValue::Hole) {
                    return Err(format!(
                        "{}: Update target is not a hole",
                        self.location(address)
                    ));
                }
                if target == value {
                    return Err(format!(
                        "{}: Attempt to update cell with itself",
                        self.location(address)
                    ));
                }
                self.heap.update(target, CellValue::Ind(value));
                self.heap.frames.get_mut(current).data[slot_index] = value;
            }
            Instruction::Alloc { count } => {
                for _ in 0..count {
                    let hole = self.heap.alloc(CellValue::Hole);
                    self.heap.frames.get_mut(current).data.push(hole);
                }
            }
            Instruction::Squeeze { count, remove } => {
                let frame = self.heap.frames.get_mut(current);
                let len = frame.data.len();
                frame.data.drain(len - count - remove..len - count);
            }
            Instruction::Pop { count } => {
                let frame = self.heap.frames.get_mut(current);
                let len = frame.data.len();
                frame.data.truncate(len - count);
            }
            Instruction::MkCap { target, num_args } => {
                let info = self.module.functions[target.get()];
                let args = {
                    let frame = self.heap.frames.get_mut(current);
                    let len = frame.data.len();
                    frame.data.split_off(len - num_args)
                };
                let cap_id = self
                    .heap
                    .caps
                    .insert(Cap::new(target, info.arity, info.address, args));
                let cell = self.heap.alloc(CellValue::Cap(cap_id));
                self.heap.frames.get_mut(current).data.push(cell);
            }
            Instruction::MkFrame { target, num_args } => {
                let args = {
                    let frame = self.heap.frames.get_mut(current);
                    let len = frame.data.len();
                    frame.data.split_off(len - num_args)
                };
                let cell = self.alloc_frame(target, args);
                self.heap.frames.get_mut(current).data.push(cell);
            }
            Instruction::Bif { target } => {
                self.execute_bif(current, address, target)?;
            }
            Instruction::PushNil => {
                let nil = self.nil;
                self.heap.frames.get_mut(current).data.push(nil);
            }
            Instruction::PushNumber { value } => {
                let cell = self.alloc_number(value.into());
                self.heap.frames.get_mut(current).data.push(cell);
            }
            Instruction::PushString { index } => {
                let cell = self
                    .string_ptr(index)
                    .ok_or_else(|| format!("Invalid string pool index: {}", index))?;
                self.heap.frames.get_mut(current).data.push(cell);
            }
        }
        Ok(())
    }

    /// Force the value at the given offset to weak-head normal form. A
    /// local value is immediate (and skips the paired RESOLVE); a frame
    /// suspends the current frame until the target completes; an unfetched
    /// remote reference issues a FETCH and suspends until the TRANSFER
    /// arrives.
    fn execute_eval(
        &mut self,
        current: FrameId,
        address: InstructionPointer,
        offset: usize,
    ) -> Result<(), String> {
        let ptr = {
            let frame = self.heap.frames.get(current);
            self.heap.resolve(frame.at_offset(offset))
        };
        self.heap
            .frames
            .get_mut(current)
            .set_at_offset(offset, ptr);
        match *self.heap.value(ptr) {
            CellValue::Frame(target) => {
                self.heap.frames.get_mut(current).address = address;
                self.block_frame(current);
                self.run_frame(target);
                self.heap.frames.get_mut(target).waiters.push(current);
                Ok(())
            }
            CellValue::RemoteRef(global_id) => {
                let (fetching, target_addr) = {
                    let global = self.heap.globals.get(global_id);
                    (global.fetching, global.addr)
                };
                if !fetching && !target_addr.is_pending() {
                    let in_dist_gc = self.heap.in_dist_gc();
                    let task_id = self.task_id();
                    let store_id = self.heap.globals.export(task_id, ptr, in_dist_gc);
                    let store_addr = self.heap.globals.get(store_id).addr;
                    self.outbox.push(RemoteRequest::Fetch {
                        target: target_addr,
                        store: store_addr,
                    });
                    self.heap.globals.get_mut(global_id).fetching = true;
                    self.stats.fetches += 1;
                }
                self.heap.globals.get_mut(global_id).waiters.push(current);
                self.heap.frames.get_mut(current).address = address;
                self.block_frame(current);
                Ok(())
            }
            CellValue::Application { .. } => {
                // Classic unwind: runtime-built application spines are
                // dispatched here rather than through compiled code
                self.unwind_application(current, address, ptr)
            }
            CellValue::Hole => Err(format!(
                "{}: Evaluation of incomplete recursive binding",
                self.location(address)
            )),
            _ => {
                // Already in weak-head normal form: skip the paired RESOLVE
                let frame = self.heap.frames.get_mut(current);
                frame.address = frame.address.advance();
                Ok(())
            }
        }
    }

    /// Unwind an application spine to its head and dispatch: a saturated
    /// known function becomes a frame over the innermost arguments, an
    /// under-saturated one becomes a partial application closure, and an
    /// over-saturated one becomes a frame whose result is re-dispatched
    /// against the remaining arguments. The current frame then re-executes
    /// its EVAL against the rewritten graph.
    fn unwind_application(
        &mut self,
        current: FrameId,
        address: InstructionPointer,
        root: CellPtr,
    ) -> Result<(), String> {
        let mut spine = Vec::new();
        let mut head = root;
        while let CellValue::Application { function, .. } = *self.heap.value(head) {
            spine.push(head);
            head = self.heap.resolve(function);
        }
        match *self.heap.value(head) {
            CellValue::Frame(target) => {
                self.heap.frames.get_mut(current).address = address;
                self.block_frame(current);
                self.run_frame(target);
                self.heap.frames.get_mut(target).waiters.push(current);
                Ok(())
            }
            CellValue::RemoteRef(_) => {
                // Block on the head; once fetched, unwinding resumes from
                // the updated graph
                self.heap.frames.get_mut(current).address = address;
                self.block_on_remote(current, head)
            }
            CellValue::ScRef(function) => {
                let info = self.module.functions[function.get()];
                self.dispatch_spine(current, address, &spine, head, info.arity, function, Vec::new())
            }
            CellValue::Builtin(builtin) => {
                let function = builtin.function_id();
                let info = self.module.functions[function.get()];
                self.dispatch_spine(current, address, &spine, head, info.arity, function, Vec::new())
            }
            CellValue::Cap(cap_id) => {
                let cap = self.heap.caps.get(cap_id).clone();
                self.dispatch_spine(
                    current,
                    address,
                    &spine,
                    head,
                    cap.arity,
                    cap.function,
                    cap.args,
                )
            }
            _ => Err(format!(
                "{}: constant cannot be applied to arguments",
                self.location(address)
            )),
        }
    }

    fn block_on_remote(&mut self, current: FrameId, ptr: CellPtr) -> Result<(), String> {
        match *self.heap.value(ptr) {
            CellValue::RemoteRef(global_id) => {
                let (fetching, target_addr) = {
                    let global = self.heap.globals.get(global_id);
                    (global.fetching, global.addr)
                };
                if !fetching && !target_addr.is_pending() {
                    let in_dist_gc = self.heap.in_dist_gc();
                    let task_id = self.task_id();
                    let store_id = self.heap.globals.export(task_id, ptr, in_dist_gc);
                    let store_addr = self.heap.globals.get(store_id).addr;
                    self.outbox.push(RemoteRequest::Fetch {
                        target: target_addr,
                        store: store_addr,
                    });
                    self.heap.globals.get_mut(global_id).fetching = true;
                    self.stats.fetches += 1;
                }
                self.heap.globals.get_mut(global_id).waiters.push(current);
                self.block_frame(current);
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    /// Rewrite the spine node carrying exactly `arity` available arguments
    /// (captured plus applied) into a frame or closure. The current frame
    /// then retries its EVAL against the rewritten graph.
    fn dispatch_spine(
        &mut self,
        current: FrameId,
        address: InstructionPointer,
        spine: &[CellPtr],
        head: CellPtr,
        arity: usize,
        function: FunctionId,
        captured: Vec<CellPtr>,
    ) -> Result<(), String> {
        let m = spine.len();
        let have = captured.len();
        let argument_of = |heap: &Heap, node: CellPtr| match *heap.value(node) {
            CellValue::Application { argument, .. } => argument,
            _ => unreachable!(),
        };
        self.heap.frames.get_mut(current).address = address;
        let info = self.module.functions[function.get()];
        if m + have < arity {
            // Under-saturated: the whole spine is already in weak-head
            // normal form as a closure
            let root = spine[0];
            let mut args = spine
                .iter()
                .map(|node| argument_of(&self.heap, *node))
                .collect::<Vec<_>>();
            args.extend(captured);
            let cap_id = self
                .heap
                .caps
                .insert(Cap::new(function, arity, info.address, args));
            self.heap.update(root, CellValue::Cap(cap_id));
            Ok(())
        } else {
            // The innermost applications saturate the function; the node
            // carrying the last required argument becomes the frame cell
            // (for a zero-arity head, the head cell itself is the redex)
            let take = arity - have;
            let pivot = if take == 0 {
                head
            } else {
                spine[m - take]
            };
            let mut args = spine[m - take..]
                .iter()
                .map(|node| argument_of(&self.heap, *node))
                .collect::<Vec<_>>();
            args.extend(captured);
            let mut frame = Frame::new(info.address);
            frame.function = Some(function);
            frame.data = args;
            let id = self.heap.frames.insert(frame);
            self.heap.frames.get_mut(id).cell = Some(pivot);
            self.heap.update(pivot, CellValue::Frame(id));
            Ok(())
        }
    }

    /// DO: dispatch the applied value on top of the stack against the
    /// arguments below it
    fn execute_do(
        &mut self,
        current: FrameId,
        address: InstructionPointer,
        or_value: bool,
    ) -> Result<(), String> {
        let top = {
            let frame = self.heap.frames.get_mut(current);
            frame
                .data
                .pop()
                .ok_or_else(|| String::from("Do with empty stack"))?
        };
        let top = self.heap.resolve(top);
        if or_value {
            if let CellValue::Frame(target) = *self.heap.value(top) {
                // Tail migration: the current frame's redex becomes the new
                // frame's value; anything waiting on us now waits on it
                let (waiters, fetchers) = {
                    let frame = self.heap.frames.get_mut(current);
                    (
                        std::mem::take(&mut frame.waiters),
                        std::mem::take(&mut frame.fetchers),
                    )
                };
                {
                    let new_frame = self.heap.frames.get_mut(target);
                    new_frame.waiters.extend(waiters);
                    new_frame.fetchers.extend(fetchers);
                }
                self.frame_return(current, top);
                self.run_frame(target);
                return Ok(());
            }
            if !matches!(*self.heap.value(top), CellValue::Cap(_)) {
                self.frame_return(current, top);
                return Ok(());
            }
        }
        let cap_id = match *self.heap.value(top) {
            CellValue::Cap(cap_id) => cap_id,
            _ => {
                return Err(format!(
                    "{}: constant cannot be applied to arguments",
                    self.location(address)
                ))
            }
        };
        let cap = self.heap.caps.get(cap_id).clone();
        let s = self.heap.frames.get(current).data.len();
        let have = cap.args.len();
        if s + have < cap.arity {
            // Still under-saturated: merge into a wider closure and return
            // it to the caller
            let mut args = std::mem::take(&mut self.heap.frames.get_mut(current).data);
            args.extend(cap.args.iter().copied());
            let merged = Cap::new(cap.function, cap.arity, cap.address, args);
            self.frame_return_cap(current, merged);
            Ok(())
        } else if s + have == cap.arity {
            // Saturated: enter the function's code in place
            {
                let frame = self.heap.frames.get_mut(current);
                frame.data.extend(cap.args.iter().copied());
                frame.function = Some(cap.function);
                frame.address = cap.address;
            }
            self.count_call(cap.function);
            Ok(())
        } else {
            // Over-saturated: the innermost `arity` arguments saturate a
            // new frame; the remainder re-dispatch against its result
            // through the generic evaluate-and-dispatch sequence
            let extra = cap.arity - have;
            let mut args = {
                let frame = self.heap.frames.get_mut(current);
                frame.data.split_off(s - extra)
            };
            args.extend(cap.args.iter().copied());
            let mut frame = Frame::new(cap.address);
            frame.function = Some(cap.function);
            frame.data = args;
            let id = self.heap.frames.insert(frame);
            let cell = self.heap.alloc(CellValue::Frame(id));
            self.heap.frames.get_mut(id).cell = Some(cell);
            let current_frame = self.heap.frames.get_mut(current);
            current_frame.data.push(cell);
            current_frame.function = None;
            current_frame.address = self.module.evaldo;
            Ok(())
        }
    }

    fn execute_bif(
        &mut self,
        current: FrameId,
        address: InstructionPointer,
        builtin: Builtin,
    ) -> Result<(), String> {
        let info = builtin.info();
        // Strict arguments are guaranteed evaluated by the compiled
        // prologue; anything else here is a code generation fault
        for argno in 0..info.nstrict {
            let ptr = {
                let frame = self.heap.frames.get(current);
                self.heap.resolve(frame.at_offset(argno))
            };
            match *self.heap.value(ptr) {
                CellValue::Cap(cap_id) => {
                    return Err(format!(
                        "{}: {}",
                        self.location(address),
                        self.cap_error(cap_id)
                    ))
                }
                CellValue::Frame(_) | CellValue::RemoteRef(_) => {
                    return Err(format!(
                        "{}: Unevaluated strict argument to {}",
                        self.location(address),
                        info.name
                    ))
                }
                _ => {}
            }
            self.heap
                .frames
                .get_mut(current)
                .set_at_offset(argno, ptr);
        }
        self.apply_builtin(current, address, builtin)
    }

    // --- value readback ---------------------------------------------------

    /// Shallow structural readback of a heap value for inspection; does
    /// not force anything
    pub fn read_back(&self, ptr: CellPtr) -> Value {
        let ptr = self.heap.resolve(ptr);
        match self.heap.value(ptr) {
            CellValue::Number(value) => Value::Number(*value),
            CellValue::Str(value) => Value::Str(value.to_string()),
            CellValue::Nil => Value::Nil,
            CellValue::Cons { head, tail } => Value::Cons(
                Box::new(self.read_back(*head)),
                Box::new(self.read_back(*tail)),
            ),
            CellValue::Array(array) => {
                let mut result = self.read_back(array.tail);
                for element in array.elements.iter().rev() {
                    result = Value::Cons(Box::new(self.read_back(*element)), Box::new(result));
                }
                result
            }
            CellValue::ArrayRef { array, index } => match self.heap.value(*array) {
                CellValue::Array(chunk) => {
                    let mut result = self.read_back(chunk.tail);
                    for element in chunk.elements[*index..].iter().rev() {
                        result =
                            Value::Cons(Box::new(self.read_back(*element)), Box::new(result));
                    }
                    result
                }
                _ => Value::Thunk,
            },
            CellValue::Cap(_) | CellValue::ScRef(_) | CellValue::Builtin(_) => Value::Function,
            _ => Value::Thunk,
        }
    }
}

/// Observable form of a heap value, used by tests and diagnostics
#[derive(PartialEq, Clone, Debug)]
pub enum Value {
    Number(f64),
    Str(String),
    Nil,
    Cons(Box<Value>, Box<Value>),
    Function,
    Thunk,
}
impl Value {
    pub fn list(values: impl IntoIterator<Item = Value>) -> Value {
        let values = values.into_iter().collect::<Vec<_>>();
        values
            .into_iter()
            .rev()
            .fold(Value::Nil, |tail, head| {
                Value::Cons(Box::new(head), Box::new(tail))
            })
    }
}

#[cfg(test)]
mod tests;

// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::collections::VecDeque;

use crate::cell::{Cell, CellPtr, CellValue, FrameId, GlobalId};
use crate::core::TaskId;
use crate::frame::{CapArena, FrameArena};
use crate::global::{GAddr, GlobalTable};

/// Number of cells the heap grows by when the free list is exhausted
pub const BLOCK_SIZE: usize = 1024;

/// Which mark bit a collection cycle operates on: the per-cycle local bit,
/// or the distributed mark bit that protects objects while cross-task
/// marking is outstanding
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MarkBit {
    Local,
    Dist,
}

pub struct GcMetrics {
    pub purged: usize,
    pub remaining: usize,
}
impl std::fmt::Display for GcMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} purged, {} remaining", self.purged, self.remaining)
    }
}

/// Externally-held roots for a collection cycle: raw cell pointers (string
/// pool, in-flight values) and frames on the scheduling queues
#[derive(Default)]
pub struct GcRoots {
    pub cells: Vec<CellPtr>,
    pub frames: Vec<FrameId>,
}

/// Cell arena for one task. Owns the cell slots plus the frame/cap side
/// arenas and the global table, so the collector can traverse every kind
/// of child reference without leaving the heap.
pub struct Heap {
    task_id: TaskId,
    cells: Vec<Cell>,
    free: Vec<CellPtr>,
    pub frames: FrameArena,
    pub caps: CapArena,
    pub globals: GlobalTable,
    allocs_since_collect: usize,
    total_allocs: usize,
    collections: usize,
    /// While a distributed collection cycle is open, freshly allocated
    /// cells and globals carry the `new` flag and survive the sweep
    in_dist_gc: bool,
    /// Marks against remote addresses accumulated during a distributed
    /// mark phase, to be flushed as MARKENTRY messages by the owner task
    dist_pending: Vec<GAddr>,
}
impl Heap {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            cells: Vec::new(),
            free: Vec::new(),
            frames: FrameArena::default(),
            caps: CapArena::default(),
            globals: GlobalTable::default(),
            allocs_since_collect: 0,
            total_allocs: 0,
            collections: 0,
            in_dist_gc: false,
            dist_pending: Vec::new(),
        }
    }
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn grow(&mut self) {
        let base = self.cells.len();
        self.cells
            .extend((0..BLOCK_SIZE).map(|_| Cell::new(CellValue::Empty)));
        // Free slots are pushed in reverse so allocation proceeds in
        // ascending address order within a block
        self.free
            .extend((0..BLOCK_SIZE).rev().map(|index| CellPtr((base + index) as u32)));
    }

    pub fn alloc(&mut self, value: CellValue) -> CellPtr {
        if self.free.is_empty() {
            self.grow();
        }
        let ptr = self.free.pop().unwrap();
        let slot = &mut self.cells[ptr.index()];
        *slot = Cell::new(value);
        slot.new = self.in_dist_gc;
        self.allocs_since_collect += 1;
        self.total_allocs += 1;
        ptr
    }
    /// Allocate a cell that is never reclaimed (literals embedded in
    /// generated code)
    pub fn alloc_pinned(&mut self, value: CellValue) -> CellPtr {
        let ptr = self.alloc(value);
        self.cells[ptr.index()].pinned = true;
        ptr
    }

    pub fn get(&self, ptr: CellPtr) -> &Cell {
        &self.cells[ptr.index()]
    }
    pub fn get_mut(&mut self, ptr: CellPtr) -> &mut Cell {
        &mut self.cells[ptr.index()]
    }
    pub fn value(&self, ptr: CellPtr) -> &CellValue {
        &self.cells[ptr.index()].value
    }

    /// Follow indirection cells until a non-indirection cell is reached.
    /// Chains always terminate: an indirection is only ever written over a
    /// redex, pointing at the (younger) result of reducing it.
    pub fn resolve(&self, ptr: CellPtr) -> CellPtr {
        let mut current = ptr;
        while let CellValue::Ind(target) = self.cells[current.index()].value {
            current = target;
        }
        current
    }

    /// Overwrite a slot's variant in place, preserving the collector flags
    pub fn update(&mut self, target: CellPtr, value: CellValue) {
        self.cells[target.index()].value = value;
    }

    pub fn allocs_since_collect(&self) -> usize {
        self.allocs_since_collect
    }
    pub fn total_allocs(&self) -> usize {
        self.total_allocs
    }
    pub fn collections(&self) -> usize {
        self.collections
    }
    pub fn count_alive(&self) -> usize {
        self.cells.iter().filter(|cell| !cell.is_empty()).count()
    }
    pub fn count_pinned(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| !cell.is_empty() && cell.pinned)
            .count()
    }

    pub fn set_in_dist_gc(&mut self, value: bool) {
        self.in_dist_gc = value;
    }
    pub fn in_dist_gc(&self) -> bool {
        self.in_dist_gc
    }
    pub fn take_pending_marks(&mut self) -> Vec<GAddr> {
        std::mem::take(&mut self.dist_pending)
    }
    pub fn add_pending_mark(&mut self, addr: GAddr) {
        self.dist_pending.push(addr);
    }

    fn flag(&self, ptr: CellPtr, bit: MarkBit) -> bool {
        let cell = &self.cells[ptr.index()];
        match bit {
            MarkBit::Local => cell.marked,
            MarkBit::Dist => cell.dmb,
        }
    }
    fn set_flag(&mut self, ptr: CellPtr, bit: MarkBit) {
        let cell = &mut self.cells[ptr.index()];
        match bit {
            MarkBit::Local => cell.marked = true,
            MarkBit::Dist => cell.dmb = true,
        }
    }

    pub fn clear_marks(&mut self, bit: MarkBit) {
        for cell in self.cells.iter_mut() {
            match bit {
                MarkBit::Local => cell.marked = false,
                MarkBit::Dist => cell.dmb = false,
            }
        }
        for id in self.globals.ids() {
            let global = self.globals.get_mut(id);
            match bit {
                MarkBit::Local => global.marked = false,
                MarkBit::Dist => global.dmb = false,
            }
        }
    }
    pub fn clear_new_flags(&mut self) {
        for cell in self.cells.iter_mut() {
            cell.new = false;
        }
        for id in self.globals.ids() {
            self.globals.get_mut(id).new = false;
        }
    }

    /// Mark every cell reachable from the given pointer. Children of
    /// frames, caps, arrays and remote references are not plain
    /// application links, so each gets its own traversal case; cons and
    /// array spines are walked via the worklist rather than recursion.
    pub fn mark_cell(&mut self, ptr: CellPtr, bit: MarkBit) {
        let mut queue = VecDeque::new();
        queue.push_back(ptr);
        while let Some(next) = queue.pop_front() {
            let next = self.resolve(next);
            if self.flag(next, bit) {
                continue;
            }
            self.set_flag(next, bit);
            match self.cells[next.index()].value.clone() {
                CellValue::Application { function, argument } => {
                    queue.push_back(function);
                    queue.push_back(argument);
                }
                CellValue::Cons { head, tail } => {
                    queue.push_back(head);
                    queue.push_back(tail);
                }
                CellValue::Array(array) => {
                    queue.extend(array.elements.iter().copied());
                    queue.push_back(array.tail);
                }
                CellValue::ArrayRef { array, .. } => {
                    queue.push_back(array);
                }
                CellValue::Ind(target) => {
                    queue.push_back(target);
                }
                CellValue::Frame(frame_id) => {
                    let frame = self.frames.get(frame_id);
                    if let Some(cell) = frame.cell {
                        queue.push_back(cell);
                    }
                    queue.extend(frame.data.iter().copied());
                }
                CellValue::Cap(cap_id) => {
                    queue.extend(self.caps.get(cap_id).args.iter().copied());
                }
                CellValue::RemoteRef(global_id) => {
                    self.mark_global_children(global_id, bit, &mut queue);
                }
                CellValue::Builtin(_)
                | CellValue::ScRef(_)
                | CellValue::Nil
                | CellValue::Number(_)
                | CellValue::Str(_)
                | CellValue::Hole
                | CellValue::Empty => {}
            }
        }
    }

    fn mark_global_children(
        &mut self,
        id: GlobalId,
        bit: MarkBit,
        queue: &mut VecDeque<CellPtr>,
    ) {
        let (already, ptr, addr) = {
            let global = self.globals.get(id);
            let already = match bit {
                MarkBit::Local => global.marked,
                MarkBit::Dist => global.dmb,
            };
            (already, global.ptr, global.addr)
        };
        if already {
            return;
        }
        {
            let global = self.globals.get_mut(id);
            match bit {
                MarkBit::Local => global.marked = true,
                MarkBit::Dist => global.dmb = true,
            }
        }
        queue.push_back(ptr);
        // Marks propagate across task boundaries: a distributed mark on a
        // reference to a remote object is queued for the owner
        if bit == MarkBit::Dist && !addr.is_pending() && addr.owner != self.task_id {
            self.dist_pending.push(addr);
        }
    }

    pub fn mark_global(&mut self, id: GlobalId, bit: MarkBit) {
        let mut queue = VecDeque::new();
        self.mark_global_children(id, bit, &mut queue);
        while let Some(ptr) = queue.pop_front() {
            self.mark_cell(ptr, bit);
        }
    }
    pub fn mark_frame(&mut self, id: FrameId, bit: MarkBit) {
        let (cell, data) = {
            let frame = self.frames.get(id);
            (frame.cell, frame.data.clone())
        };
        if let Some(cell) = cell {
            self.mark_cell(cell, bit);
        }
        for ptr in data {
            self.mark_cell(ptr, bit);
        }
    }

    pub fn mark_roots(&mut self, roots: &GcRoots, bit: MarkBit) {
        for ptr in roots.cells.iter().copied() {
            self.mark_cell(ptr, bit);
        }
        for frame in roots.frames.iter().copied() {
            self.mark_frame(frame, bit);
        }
        // A remote reference mid-fetch must survive: the TRANSFER response
        // will be written through its global record
        for id in self.globals.ids() {
            if self.globals.get(id).fetching {
                self.mark_global(id, bit);
            }
        }
    }

    fn sweep(&mut self) -> GcMetrics {
        // Globals and cells created while a distributed cycle was open were
        // never visible to the mark phase; treat them as roots
        if self.in_dist_gc {
            for id in self.globals.ids() {
                if self.globals.get(id).new {
                    self.mark_global(id, MarkBit::Local);
                }
            }
            for index in 0..self.cells.len() {
                if !self.cells[index].is_empty() && self.cells[index].new {
                    self.mark_cell(CellPtr(index as u32), MarkBit::Local);
                }
            }
        }

        for id in self.globals.ids() {
            let global = self.globals.get(id);
            let cell = &self.cells[global.ptr.index()];
            let needed = global.marked || global.dmb || cell.marked || cell.dmb;
            if !needed {
                self.globals.remove(id);
            }
        }

        let mut purged = 0;
        for index in 0..self.cells.len() {
            let cell = &self.cells[index];
            if cell.is_empty() || cell.marked || cell.dmb || cell.pinned {
                continue;
            }
            // Release non-heap resources owned by the payload before
            // reclaiming the slot itself
            match self.cells[index].value.clone() {
                CellValue::Frame(frame_id) => {
                    if self.frames.contains(frame_id) {
                        self.frames.remove(frame_id);
                    }
                }
                CellValue::Cap(cap_id) => {
                    self.caps.remove(cap_id);
                }
                _ => {}
            }
            self.cells[index] = Cell::new(CellValue::Empty);
            self.free.push(CellPtr(index as u32));
            purged += 1;
        }
        GcMetrics {
            purged,
            remaining: self.count_alive(),
        }
    }

    /// Full local stop-the-world collection cycle: clear, mark from the
    /// given roots plus every object another task holds a reference to,
    /// then sweep
    pub fn collect(&mut self, roots: &GcRoots) -> GcMetrics {
        self.collect_inner(roots, true)
    }

    /// The sweep phase of a distributed cycle: exported objects are *not*
    /// unconditional roots here; cross-task liveness is carried by the
    /// distributed mark bit established during the mark phase
    pub fn dist_sweep(&mut self, roots: &GcRoots) -> GcMetrics {
        self.collect_inner(roots, false)
    }

    fn collect_inner(&mut self, roots: &GcRoots, export_roots: bool) -> GcMetrics {
        self.allocs_since_collect = 0;
        self.collections += 1;
        self.clear_marks(MarkBit::Local);
        self.mark_roots(roots, MarkBit::Local);
        if export_roots {
            let owned = self
                .globals
                .ids()
                .into_iter()
                .filter(|id| self.globals.get(*id).addr.owner == self.task_id)
                .collect::<Vec<_>>();
            for id in owned {
                self.mark_global(id, MarkBit::Local);
            }
        }
        self.sweep()
    }
}

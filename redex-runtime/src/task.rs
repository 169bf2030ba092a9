// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use redex::cell::{CellPtr, CellValue};
use redex::core::TaskId;
use redex::frame::FrameState;
use redex::global::GAddr;
use redex_compiler::bytecode::BytecodeModule;
use redex_interpreter::{InterpreterOptions, Machine, MachineStatus, RemoteRequest};

use crate::distgc::DistGcCoordinator;
use crate::message::TaskMessage;
use crate::wire::{Reader, Writer};

/// How many sparked frames one work-stealing probe asks for
pub const SPARK_REQUEST: usize = 8;

pub type Outgoing = Vec<(TaskId, TaskMessage)>;

/// One cluster process: a virtual machine plus the distributed-protocol
/// bookkeeping that surrounds it (in-flight address tracking, work
/// stealing, distributed collection state)
pub struct RuntimeTask {
    pub machine: Machine,
    group_size: usize,
    /// Termination-detection counter deltas for the current distributed
    /// mark phase, indexed by owning task
    pub(crate) gcsent: Vec<i64>,
    /// Per peer: addresses sent but not yet acknowledged. These keep their
    /// referents alive until the receiver has recorded them.
    inflight: Vec<VecDeque<GAddr>>,
    /// Per peer: address counts of each outstanding message
    unack_counts: Vec<VecDeque<usize>>,
    newfish: bool,
    done: bool,
    paused: bool,
    /// Present only on the task coordinating a distributed collection
    pub(crate) coordinator: Option<DistGcCoordinator>,
}

impl RuntimeTask {
    pub fn new(
        module: Arc<BytecodeModule>,
        task_id: TaskId,
        group_size: usize,
        options: InterpreterOptions,
    ) -> Self {
        Self {
            machine: Machine::new(module, task_id, group_size, options),
            group_size,
            gcsent: vec![0; group_size],
            inflight: (0..group_size).map(|_| VecDeque::new()).collect(),
            unack_counts: (0..group_size).map(|_| VecDeque::new()).collect(),
            newfish: group_size > 1,
            done: false,
            paused: false,
            coordinator: None,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.machine.task_id()
    }
    pub fn group_size(&self) -> usize {
        self.group_size
    }
    pub fn is_done(&self) -> bool {
        self.done
    }
    pub fn mark_done(&mut self) {
        self.done = true;
    }
    pub(crate) fn peers(&self) -> impl Iterator<Item = TaskId> + '_ {
        let own = self.task_id();
        (0..self.group_size)
            .map(TaskId::from)
            .filter(move |task| *task != own)
    }
    fn next_peer(&self) -> Option<TaskId> {
        if self.group_size < 2 {
            return None;
        }
        Some(TaskId::from((self.task_id().get() + 1) % self.group_size))
    }
    pub(crate) fn inflight_addrs(&self) -> impl Iterator<Item = GAddr> + '_ {
        self.inflight.iter().flatten().copied()
    }

    fn record_outgoing(&mut self, dest: TaskId, addrs: Vec<GAddr>) {
        if addrs.is_empty() {
            return;
        }
        self.unack_counts[dest.get()].push_back(addrs.len());
        self.inflight[dest.get()].extend(addrs);
    }

    /// Serialize a value in response to a fetch, recording the embedded
    /// addresses against the destination until acknowledged
    fn build_transfer(&mut self, dest: TaskId, store: GAddr, value: CellPtr) -> Result<TaskMessage, String> {
        let mut writer = Writer::new();
        writer.gaddr(store);
        writer.value(&mut self.machine, value)?;
        let (bytes, addrs) = writer.into_parts();
        self.record_outgoing(dest, addrs);
        Ok(TaskMessage::Transfer { bytes })
    }

    /// Execute a slice of the machine and convert everything it emitted
    /// into protocol messages. Returns the slice status alongside the
    /// messages to deliver.
    pub fn pump(&mut self, fuel: usize) -> Result<(MachineStatus, Outgoing), String> {
        if self.done || self.paused {
            return Ok((MachineStatus::Idle, Vec::new()));
        }
        let status = self.machine.run_slice(fuel)?;
        let mut out = Vec::new();
        for request in self.machine.take_outbox() {
            match request {
                RemoteRequest::Fetch { target, store } => {
                    out.push((
                        target.owner,
                        TaskMessage::Fetch {
                            objaddr: target,
                            storeaddr: store,
                        },
                    ));
                }
                RemoteRequest::Transfer { value, store } => {
                    let message = self.build_transfer(store.owner, store, value)?;
                    out.push((store.owner, message));
                }
            }
        }
        if self.machine.is_done() {
            self.done = true;
        } else if status == MachineStatus::Idle && self.newfish {
            if let Some(peer) = self.next_peer() {
                trace!(task = %self.task_id(), "idle, fishing for work");
                out.push((
                    peer,
                    TaskMessage::Fish {
                        requester: self.task_id(),
                        age: self.group_size,
                        nframes: SPARK_REQUEST,
                    },
                ));
                self.newfish = false;
            }
        }
        Ok((status, out))
    }

    /// Process one protocol message. Malformed payloads and references to
    /// unknown objects are corrupt-channel conditions: the error halts
    /// this task rather than attempting partial recovery.
    pub fn handle_message(
        &mut self,
        from: TaskId,
        message: TaskMessage,
    ) -> Result<Outgoing, String> {
        match message {
            TaskMessage::Done => {
                self.done = true;
                Ok(Vec::new())
            }
            TaskMessage::Resume => {
                self.paused = false;
                Ok(Vec::new())
            }
            TaskMessage::Pause => {
                self.paused = true;
                Ok(Vec::new())
            }
            TaskMessage::Fish {
                requester,
                age,
                nframes,
            } => self.handle_fish(requester, age, nframes),
            TaskMessage::Fetch { objaddr, storeaddr } => {
                self.handle_fetch(from, objaddr, storeaddr)
            }
            TaskMessage::Transfer { bytes } => self.handle_transfer(from, &bytes),
            TaskMessage::Ack { count, naddrs } => self.handle_ack(from, count, naddrs),
            TaskMessage::Schedule { bytes } => self.handle_schedule(from, &bytes),
            TaskMessage::UpdateRef { entries } => self.handle_updateref(from, entries),
            TaskMessage::StartDistGc => self.handle_start_dist_gc(),
            TaskMessage::MarkRoots => self.handle_mark_roots(),
            TaskMessage::MarkEntry { addrs } => self.handle_mark_entry(addrs),
            TaskMessage::GcUpdate { counts } => self.handle_gc_update(from, counts),
            TaskMessage::Sweep => self.handle_sweep(from),
            TaskMessage::SweepAck => self.handle_sweep_ack(from),
            TaskMessage::Stats => {
                debug!(
                    task = %self.task_id(),
                    instructions = self.machine.stats.ninstrs,
                    reductions = self.machine.stats.nreductions,
                    sparks = self.machine.stats.nsparks,
                    fetches = self.machine.stats.fetches,
                    "task statistics"
                );
                Ok(Vec::new())
            }
        }
    }

    /// An idle task is looking for work: hand over sparked frames if any
    /// exist, otherwise pass the probe along until its age expires
    fn handle_fish(
        &mut self,
        requester: TaskId,
        age: usize,
        nframes: usize,
    ) -> Result<Outgoing, String> {
        if requester == self.task_id() {
            return Ok(Vec::new());
        }
        let stolen = self.machine.steal_sparks(nframes);
        if stolen.is_empty() {
            if age > 1 {
                if let Some(peer) = self.next_peer() {
                    return Ok(vec![(
                        peer,
                        TaskMessage::Fish {
                            requester,
                            age: age - 1,
                            nframes,
                        },
                    )]);
                }
            }
            return Ok(Vec::new());
        }
        let mut writer = Writer::new();
        writer.u32(stolen.len() as u32);
        let own = self.task_id();
        for frame_id in stolen {
            let cell = self
                .machine
                .heap
                .frames
                .get(frame_id)
                .cell
                .ok_or_else(|| String::from("Sparked frame has no graph cell"))?;
            writer.value(&mut self.machine, cell)?;
            // The reference address lets the receiver tell us where the
            // frame now lives
            let lid = self.machine.heap.globals.fresh_lid();
            let refaddr = GAddr::new(own, lid);
            let in_dist_gc = self.machine.heap.in_dist_gc();
            self.machine.heap.globals.add(refaddr, cell, in_dist_gc);
            writer.gaddr(refaddr);
            // Replace the local frame with a reference to wherever the
            // requester places it
            let pending = self
                .machine
                .heap
                .globals
                .add(GAddr::pending(requester), cell, in_dist_gc);
            self.machine
                .heap
                .update(cell, CellValue::RemoteRef(pending));
            self.machine.heap.frames.remove(frame_id);
        }
        let (bytes, addrs) = writer.into_parts();
        self.record_outgoing(requester, addrs);
        trace!(task = %self.task_id(), to = %requester, "scheduling stolen sparks");
        Ok(vec![(requester, TaskMessage::Schedule { bytes })])
    }

    /// Another task wants one of our objects. A plain value is shipped
    /// immediately; a frame that is already executing registers the
    /// fetcher and responds on completion; an unstarted frame migrates to
    /// the requester outright.
    fn handle_fetch(
        &mut self,
        from: TaskId,
        objaddr: GAddr,
        storeaddr: GAddr,
    ) -> Result<Outgoing, String> {
        if objaddr.owner != self.task_id() || storeaddr.owner != from {
            return Err(format!(
                "Fetch for {} routed to {}",
                objaddr,
                self.task_id()
            ));
        }
        let global_id = self
            .machine
            .heap
            .globals
            .lookup_by_addr(objaddr)
            .ok_or_else(|| format!("Fetch for unknown object {}", objaddr))?;
        let obj = self.machine.heap.resolve(self.machine.heap.globals.get(global_id).ptr);
        match *self.machine.heap.value(obj) {
            CellValue::RemoteRef(target) => {
                // Forwarded elsewhere; respond once the value arrives
                self.machine
                    .heap
                    .globals
                    .get_mut(target)
                    .fetchers
                    .push(storeaddr);
                Ok(Vec::new())
            }
            CellValue::Frame(frame_id) => {
                match self.machine.heap.frames.get(frame_id).state {
                    FrameState::Running | FrameState::Blocked => {
                        self.machine
                            .heap
                            .frames
                            .get_mut(frame_id)
                            .fetchers
                            .push(storeaddr);
                        Ok(Vec::new())
                    }
                    FrameState::New | FrameState::Sparked => {
                        // Migrate the unstarted frame to the requester
                        self.machine.unspark_frame(frame_id);
                        let message = self.build_transfer(from, storeaddr, obj)?;
                        let in_dist_gc = self.machine.heap.in_dist_gc();
                        let moved = self
                            .machine
                            .heap
                            .globals
                            .add(storeaddr, obj, in_dist_gc);
                        self.machine
                            .heap
                            .update(obj, CellValue::RemoteRef(moved));
                        self.machine.heap.frames.remove(frame_id);
                        Ok(vec![(from, message)])
                    }
                    FrameState::Done => {
                        Err(String::from("Completed frame left behind a frame cell"))
                    }
                }
            }
            _ => {
                let message = self.build_transfer(from, storeaddr, obj)?;
                Ok(vec![(from, message)])
            }
        }
    }

    /// A requested value has arrived: write it through the store address,
    /// wake every frame that was blocked on it, and forward it to any
    /// fetcher queued behind our own request
    fn handle_transfer(&mut self, from: TaskId, bytes: &[u8]) -> Result<Outgoing, String> {
        let mut reader = Reader::new(bytes);
        let storeaddr = reader.gaddr()?;
        if storeaddr.owner != self.task_id() {
            return Err(format!("Transfer for {} routed to {}", storeaddr, self.task_id()));
        }
        let value = reader.value(&mut self.machine)?;
        let naddrs = reader.addr_count();
        let store_id = self
            .machine
            .heap
            .globals
            .lookup_by_addr(storeaddr)
            .ok_or_else(|| format!("Transfer for unknown store address {}", storeaddr))?;
        let refcell = self.machine.heap.globals.get(store_id).ptr;
        let (waiters, fetchers) = match *self.machine.heap.value(refcell) {
            CellValue::RemoteRef(target) => {
                let global = self.machine.heap.globals.get_mut(target);
                global.fetching = false;
                (
                    std::mem::take(&mut global.waiters),
                    std::mem::take(&mut global.fetchers),
                )
            }
            // Duplicate delivery: the reference was already resolved
            _ => (Vec::new(), Vec::new()),
        };
        self.machine.heap.update(refcell, CellValue::Ind(value));
        for waiter in waiters {
            self.machine.wake_frame(waiter);
        }
        let mut out = Vec::new();
        for store in fetchers {
            let message = self.build_transfer(store.owner, store, value)?;
            out.push((store.owner, message));
        }
        let value = self.machine.heap.resolve(value);
        if let CellValue::Frame(frame_id) = *self.machine.heap.value(value) {
            self.machine.run_frame(frame_id);
        }
        self.newfish = true;
        out.push((
            from,
            TaskMessage::Ack {
                count: 1,
                naddrs,
            },
        ));
        Ok(out)
    }

    /// Stolen frames arrive: place them in our heap, start them running,
    /// and tell the sender where each one now lives
    fn handle_schedule(&mut self, from: TaskId, bytes: &[u8]) -> Result<Outgoing, String> {
        let mut reader = Reader::new(bytes);
        let count = reader.u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        let own = self.task_id();
        for _ in 0..count {
            let frame_ptr = reader.value(&mut self.machine)?;
            let tellsrc = reader.gaddr()?;
            let in_dist_gc = self.machine.heap.in_dist_gc();
            let export = self
                .machine
                .heap
                .globals
                .export(own, frame_ptr, in_dist_gc);
            entries.push((tellsrc, self.machine.heap.globals.get(export).addr));
            if let CellValue::Frame(frame_id) = *self.machine.heap.value(frame_ptr) {
                self.machine.spark_frame(frame_id);
                self.machine.run_frame(frame_id);
            }
        }
        let naddrs = reader.addr_count();
        debug!(task = %self.task_id(), count, "imported stolen frames");
        self.newfish = true;
        Ok(vec![
            (from, TaskMessage::UpdateRef { entries }),
            (
                from,
                TaskMessage::Ack {
                    count: 1,
                    naddrs,
                },
            ),
        ])
    }

    /// The receiver of our stolen frames tells us their new addresses;
    /// frames that blocked on the placeholder can now issue fetches
    fn handle_updateref(
        &mut self,
        from: TaskId,
        entries: Vec<(GAddr, GAddr)>,
    ) -> Result<Outgoing, String> {
        for (refaddr, remoteaddr) in entries {
            if refaddr.owner != self.task_id() || remoteaddr.owner != from {
                return Err(format!("UpdateRef for {} routed to {}", refaddr, self.task_id()));
            }
            let ref_id = self
                .machine
                .heap
                .globals
                .lookup_by_addr(refaddr)
                .ok_or_else(|| format!("UpdateRef for unknown reference {}", refaddr))?;
            let refcell = self.machine.heap.globals.get(ref_id).ptr;
            if let CellValue::RemoteRef(pending) = *self.machine.heap.value(refcell) {
                self.machine.heap.globals.assign_addr(pending, remoteaddr);
                let waiters =
                    std::mem::take(&mut self.machine.heap.globals.get_mut(pending).waiters);
                for waiter in waiters {
                    self.machine.wake_frame(waiter);
                }
            }
        }
        Ok(Vec::new())
    }

    fn handle_ack(&mut self, from: TaskId, count: usize, naddrs: usize) -> Result<Outgoing, String> {
        let mut released = 0;
        for _ in 0..count {
            released += self.unack_counts[from.get()]
                .pop_front()
                .ok_or_else(|| String::from("Acknowledgement for unknown message"))?;
        }
        if released != naddrs {
            return Err(format!(
                "Acknowledged {} addresses, expected {}",
                naddrs, released
            ));
        }
        for _ in 0..released {
            self.inflight[from.get()].pop_front();
        }
        Ok(Vec::new())
    }
}

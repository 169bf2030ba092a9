// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use tracing::debug;

use redex::core::TaskId;
use redex::global::GAddr;
use redex::hash::FnvHashMap;
use redex::heap::MarkBit;

use crate::message::TaskMessage;
use crate::task::{Outgoing, RuntimeTask};

/// Termination detection for the distributed mark phase, held by the
/// coordinating task. Every address sent in a MARKENTRY batch counts +1
/// against its owner, every address processed counts -1; once every task
/// has reported and all counters cancel out, no mark is in flight and the
/// sweep may proceed.
pub(crate) struct DistGcCoordinator {
    counts: Vec<i64>,
    reported: Vec<bool>,
    swept: Vec<bool>,
    sweeping: bool,
}
impl DistGcCoordinator {
    fn new(group_size: usize) -> Self {
        Self {
            counts: vec![0; group_size],
            reported: vec![false; group_size],
            swept: vec![false; group_size],
            sweeping: false,
        }
    }
    fn mark_phase_complete(&self) -> bool {
        self.reported.iter().all(|reported| *reported)
            && self.counts.iter().all(|count| *count == 0)
    }
}

impl RuntimeTask {
    fn coordinator_task(&self) -> TaskId {
        TaskId::from(self.group_size() - 1)
    }

    fn begin_cycle(&mut self) {
        self.machine.heap.clear_marks(MarkBit::Dist);
        self.machine.heap.set_in_dist_gc(true);
    }

    /// Open a distributed collection cycle. The coordinating task
    /// broadcasts the cycle start followed by the root-marking request;
    /// per-channel ordering guarantees every task opens the cycle before
    /// it starts marking. A request received while a cycle is already
    /// open is ignored rather than overlapped.
    pub(crate) fn handle_start_dist_gc(&mut self) -> Result<Outgoing, String> {
        let is_coordinator = self.task_id() == self.coordinator_task();
        if is_coordinator && self.coordinator.is_none() && !self.machine.heap.in_dist_gc() {
            let mut coordinator = DistGcCoordinator::new(self.group_size());
            let mut out = Vec::new();
            for task in (0..self.group_size()).map(TaskId::from) {
                out.push((task, TaskMessage::StartDistGc));
            }
            for task in (0..self.group_size()).map(TaskId::from) {
                coordinator.counts[task.get()] += 1;
                out.push((task, TaskMessage::MarkRoots));
            }
            self.coordinator = Some(coordinator);
            debug!(task = %self.task_id(), "starting distributed collection");
            return Ok(out);
        }
        if self.machine.heap.in_dist_gc() {
            return Ok(Vec::new());
        }
        self.begin_cycle();
        Ok(Vec::new())
    }

    /// Mark everything reachable from this task's roots with the
    /// distributed mark bit, buffering marks against remote addresses for
    /// their owners
    pub(crate) fn handle_mark_roots(&mut self) -> Result<Outgoing, String> {
        if !self.machine.heap.in_dist_gc() {
            return Err(String::from("Root marking request outside a collection cycle"));
        }
        let roots = self.machine.gc_roots();
        self.machine.heap.mark_roots(&roots, MarkBit::Dist);
        // Addresses currently in flight to other tasks are roots too: the
        // receiver has not recorded them yet
        let own = self.task_id();
        let inflight = self.inflight_addrs().collect::<Vec<_>>();
        for addr in inflight {
            if addr.is_pending() {
                continue;
            }
            if addr.owner == own {
                if let Some(global_id) = self.machine.heap.globals.lookup_by_addr(addr) {
                    self.machine.heap.mark_global(global_id, MarkBit::Dist);
                }
            } else {
                self.machine.heap.add_pending_mark(addr);
            }
        }
        self.gcsent[own.get()] -= 1;
        Ok(self.flush_marks())
    }

    /// Mark owned objects on behalf of a remote task, recursively
    /// propagating across any further remote references they contain
    pub(crate) fn handle_mark_entry(&mut self, addrs: Vec<GAddr>) -> Result<Outgoing, String> {
        if !self.machine.heap.in_dist_gc() {
            return Err(String::from("Marking request outside a collection cycle"));
        }
        let own = self.task_id();
        for addr in addrs {
            if addr.owner != own {
                return Err(format!("Marking request for {} routed to {}", addr, own));
            }
            let global_id = self
                .machine
                .heap
                .globals
                .lookup_by_addr(addr)
                .ok_or_else(|| format!("Marking request for deleted global {}", addr))?;
            self.machine.heap.mark_global(global_id, MarkBit::Dist);
            self.gcsent[own.get()] -= 1;
        }
        Ok(self.flush_marks())
    }

    /// Send buffered cross-task marks to their owners and report counter
    /// deltas to the coordinator
    fn flush_marks(&mut self) -> Outgoing {
        let mut batches: FnvHashMap<TaskId, Vec<GAddr>> = FnvHashMap::default();
        for addr in self.machine.heap.take_pending_marks() {
            batches.entry(addr.owner).or_default().push(addr);
        }
        let mut out = Vec::new();
        for (owner, addrs) in batches {
            self.gcsent[owner.get()] += addrs.len() as i64;
            out.push((owner, TaskMessage::MarkEntry { addrs }));
        }
        let group_size = self.group_size();
        let counts = std::mem::replace(&mut self.gcsent, vec![0; group_size]);
        out.push((self.coordinator_task(), TaskMessage::GcUpdate { counts }));
        out
    }

    pub(crate) fn handle_gc_update(
        &mut self,
        from: TaskId,
        counts: Vec<i64>,
    ) -> Result<Outgoing, String> {
        let group_size = self.group_size();
        let own = self.task_id();
        let sweep = {
            let coordinator = self
                .coordinator
                .as_mut()
                .ok_or_else(|| String::from("Counter update received by non-coordinating task"))?;
            if counts.len() != group_size {
                return Err(String::from("Malformed counter update"));
            }
            for (accumulated, delta) in coordinator.counts.iter_mut().zip(counts) {
                *accumulated += delta;
            }
            coordinator.reported[from.get()] = true;
            if !coordinator.sweeping && coordinator.mark_phase_complete() {
                coordinator.sweeping = true;
                true
            } else {
                false
            }
        };
        if sweep {
            debug!(task = %own, "mark phase complete, sweeping");
            return Ok((0..group_size)
                .map(|task| (TaskId::from(task), TaskMessage::Sweep))
                .collect());
        }
        Ok(Vec::new())
    }

    /// All marking has quiesced: run a full local collection in which the
    /// distributed mark bit (rather than export records) carries
    /// cross-task liveness, then close the cycle
    pub(crate) fn handle_sweep(&mut self, from: TaskId) -> Result<Outgoing, String> {
        if !self.machine.heap.in_dist_gc() {
            return Err(String::from("Sweep request outside a collection cycle"));
        }
        let roots = self.machine.gc_roots();
        let metrics = self.machine.heap.dist_sweep(&roots);
        debug!(task = %self.task_id(), "distributed sweep: {}", metrics);
        self.machine.heap.set_in_dist_gc(false);
        self.machine.heap.clear_new_flags();
        self.machine.heap.clear_marks(MarkBit::Dist);
        Ok(vec![(from, TaskMessage::SweepAck)])
    }

    pub(crate) fn handle_sweep_ack(&mut self, from: TaskId) -> Result<Outgoing, String> {
        let complete = {
            let coordinator = self.coordinator.as_mut().ok_or_else(|| {
                String::from("Sweep acknowledgement received by non-coordinating task")
            })?;
            coordinator.swept[from.get()] = true;
            coordinator.swept.iter().all(|swept| *swept)
        };
        if complete {
            self.coordinator = None;
            debug!(task = %self.task_id(), "distributed collection complete");
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use redex::cell::CellValue;
    use redex_compiler::bytecode::BytecodeModule;
    use redex_compiler::syntax::{Module, SNode, Scomb};
    use redex_compiler::{Compiler, CompilerOptions};
    use redex_interpreter::InterpreterOptions;

    use super::*;
    use crate::wire::import_reference;

    fn test_module() -> Arc<BytecodeModule> {
        let mut module = Module::default();
        module.add(Scomb::new("main", [] as [&str; 0], SNode::number(0.0)));
        Arc::new(
            Compiler::new(CompilerOptions::default())
                .compile(module)
                .unwrap(),
        )
    }

    fn make_pair() -> [RuntimeTask; 2] {
        let module = test_module();
        [
            RuntimeTask::new(module.clone(), TaskId(0), 2, InterpreterOptions::default()),
            RuntimeTask::new(module, TaskId(1), 2, InterpreterOptions::default()),
        ]
    }

    /// Run a full distributed collection cycle by delivering protocol
    /// messages until quiescence
    fn run_cycle(tasks: &mut [RuntimeTask; 2]) {
        let coordinator = TaskId(1);
        let mut queue: VecDeque<(TaskId, TaskId, TaskMessage)> = VecDeque::new();
        let initial = tasks[coordinator.get()]
            .handle_message(coordinator, TaskMessage::StartDistGc)
            .unwrap();
        queue.extend(
            initial
                .into_iter()
                .map(|(dest, message)| (coordinator, dest, message)),
        );
        while let Some((from, dest, message)) = queue.pop_front() {
            let out = tasks[dest.get()].handle_message(from, message).unwrap();
            queue.extend(out.into_iter().map(|(next, message)| (dest, next, message)));
        }
        assert!(tasks[coordinator.get()].coordinator.is_none());
        assert!(!tasks[0].machine.heap.in_dist_gc());
        assert!(!tasks[1].machine.heap.in_dist_gc());
    }

    /// Export a cons cell from task 0 and import the reference on task 1,
    /// returning the owner-side pointer and the shared address
    fn export_pair(tasks: &mut [RuntimeTask; 2]) -> (redex::cell::CellPtr, GAddr) {
        let value = {
            let machine = &mut tasks[0].machine;
            let head = machine.heap.alloc(CellValue::Number(5.0));
            let nil = machine.nil_ptr();
            machine.heap.alloc(CellValue::Cons { head, tail: nil })
        };
        let addr = {
            let machine = &mut tasks[0].machine;
            let export = machine.heap.globals.export(TaskId(0), value, false);
            machine.heap.globals.get(export).addr
        };
        import_reference(&mut tasks[1].machine, addr).unwrap();
        (value, addr)
    }

    #[test]
    fn remotely_referenced_objects_survive_the_cycle() {
        let mut tasks = make_pair();
        let (value, addr) = export_pair(&mut tasks);
        // The requester's reference is live (mid-fetch), so the mark
        // phase must propagate liveness back to the owner
        {
            let machine = &mut tasks[1].machine;
            let global_id = machine.heap.globals.lookup_by_addr(addr).unwrap();
            machine.heap.globals.get_mut(global_id).fetching = true;
        }
        run_cycle(&mut tasks);
        assert!(
            !tasks[0].machine.heap.get(value).is_empty(),
            "owner must keep an object another task still references"
        );
        assert!(tasks[0].machine.heap.globals.lookup_by_addr(addr).is_some());
    }

    #[test]
    fn unreferenced_exports_are_reclaimed_by_the_cycle() {
        let mut tasks = make_pair();
        let (value, addr) = export_pair(&mut tasks);
        // Drop the requester's interest: nothing roots the reference, so
        // no mark flows back and the owner's export dies with the cycle
        run_cycle(&mut tasks);
        assert!(
            tasks[0].machine.heap.get(value).is_empty(),
            "a purely local collection would have kept this alive via its export record"
        );
        assert!(tasks[0].machine.heap.globals.lookup_by_addr(addr).is_none());
    }

    #[test]
    fn cycles_cannot_overlap() {
        let mut tasks = make_pair();
        let coordinator = TaskId(1);
        let first = tasks[1]
            .handle_message(coordinator, TaskMessage::StartDistGc)
            .unwrap();
        assert!(!first.is_empty());
        // A second request while the cycle is open is ignored
        let second = tasks[1]
            .handle_message(coordinator, TaskMessage::StartDistGc)
            .unwrap();
        assert!(second.is_empty());
    }
}

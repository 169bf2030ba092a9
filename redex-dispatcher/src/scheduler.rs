// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::collections::{hash_map::Entry, HashMap, VecDeque};

use crate::{
    Action, Actor, BoxedWorkerInstance, MessageData, MessageOffset, OperationStream, ProcessId,
    StateOperation, WorkerContext,
};

pub struct NoopTaskRunner;
impl<T: Action> TaskRunner<T> for NoopTaskRunner {
    fn run(&mut self, _task: OperationStream<T>) -> TaskHandle {
        TaskHandle::new(|| {})
    }
}

pub trait TaskRunner<T: Action> {
    fn run(&mut self, task: OperationStream<T>) -> TaskHandle;
}

pub struct TaskHandle {
    abort: Box<dyn FnOnce() + 'static>,
}
impl TaskHandle {
    pub fn new(abort: impl FnOnce() + 'static) -> Self {
        Self {
            abort: Box::new(abort),
        }
    }
    pub fn abort(self) {
        (self.abort)()
    }
}

enum SyncProcess<TAction>
where
    TAction: Action + Send + 'static,
{
    Task(TaskHandle),
    Worker(BoxedWorkerInstance<TAction>),
}

/// Queue-driven synchronous scheduler: every dispatched action drains to
/// quiescence before `dispatch` returns. Operations between any pair of
/// processes are delivered in FIFO order; workers never run concurrently,
/// so worker state needs no synchronization.
pub struct SyncScheduler<TActor, TAction, TRunner>
where
    TActor: Actor<TAction>,
    TAction: Action + Send + 'static,
    TRunner: TaskRunner<TAction>,
{
    actor: TActor,
    actor_state: Option<TActor::State>,
    root_pid: ProcessId,
    next_pid: ProcessId,
    next_offset: MessageOffset,
    processes: HashMap<ProcessId, SyncProcess<TAction>>,
    task_runner: TRunner,
}
impl<TActor, TAction, TRunner> SyncScheduler<TActor, TAction, TRunner>
where
    TActor: Actor<TAction>,
    TAction: Action + Send + 'static,
    TRunner: TaskRunner<TAction>,
{
    pub fn new(actor: TActor, runner: TRunner) -> Self {
        let root_pid = ProcessId::default();
        let next_pid = root_pid.next();
        let actor_state = actor.init();
        Self {
            actor_state: Some(actor_state),
            actor,
            root_pid,
            next_pid,
            task_runner: runner,
            processes: Default::default(),
            next_offset: Default::default(),
        }
    }
    pub fn root_pid(&self) -> ProcessId {
        self.root_pid
    }
    /// The root actor's state after the most recent dispatch
    pub fn state(&self) -> &TActor::State {
        self.actor_state.as_ref().unwrap()
    }
    pub fn dispatch(&mut self, action: TAction) {
        let mut queue = VecDeque::default();
        queue.push_back((StateOperation::Send(self.root_pid, action), None));
        while let Some((operation, caller)) = queue.pop_front() {
            let metadata = MessageData {
                offset: {
                    let next_offset = self.next_offset.next();
                    std::mem::replace(&mut self.next_offset, next_offset)
                },
                parent: caller.map(|(parent, _)| parent),
                timestamp: std::time::Instant::now(),
            };
            let caller_pid = caller.map(|(_, caller_pid)| caller_pid);
            match operation {
                StateOperation::Send(pid, action) => {
                    let mut context = WorkerContext::new(pid, caller_pid, self.next_pid);
                    let child_commands = if pid == self.root_pid {
                        let (updated_state, child_commands) = self
                            .actor
                            .handle(
                                self.actor_state.take().unwrap(),
                                &action,
                                &metadata,
                                &mut context,
                            )
                            .into_parts();
                        self.actor_state.replace(updated_state);
                        child_commands
                    } else if let Some(SyncProcess::Worker(worker)) = self.processes.get_mut(&pid) {
                        worker.handle_dyn(action, &metadata, &mut context)
                    } else {
                        Default::default()
                    };
                    self.next_pid = context.next_pid();
                    queue.extend(
                        child_commands
                            .into_iter()
                            .map(|operation| (operation, Some((metadata.offset, pid)))),
                    );
                }
                StateOperation::Task(pid, task) => {
                    if let Entry::Vacant(entry) = self.processes.entry(pid) {
                        entry.insert(SyncProcess::Task(self.task_runner.run(task)));
                    }
                }
                StateOperation::Spawn(pid, factory) => {
                    if let Entry::Vacant(entry) = self.processes.entry(pid) {
                        entry.insert(SyncProcess::Worker(factory.create()));
                    }
                }
                StateOperation::Kill(pid) => {
                    if let Entry::Occupied(entry) = self.processes.entry(pid) {
                        match entry.remove() {
                            SyncProcess::Task(task) => task.abort(),
                            SyncProcess::Worker(_) => {}
                        }
                    }
                }
            };
        }
    }
}

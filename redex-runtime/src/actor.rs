// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::sync::Arc;

use tracing::debug;

use redex::core::TaskId;
use redex_compiler::bytecode::BytecodeModule;
use redex_dispatcher::{
    HandlerContext, MessageData, ProcessId, StateOperation, StateTransition, Worker, WorkerFactory,
};
use redex_interpreter::{InterpreterOptions, MachineStatus, Value};

use crate::message::{ClusterAction, TaskMessage};
use crate::task::{Outgoing, RuntimeTask};

/// Scheduler process id hosting the given task (the cluster root actor
/// occupies the zero pid; workers are spawned in task order)
pub fn task_pid(task: TaskId) -> ProcessId {
    ProcessId::from(task.get() + 1)
}

pub struct TaskWorkerFactory {
    pub module: Arc<BytecodeModule>,
    pub task_id: TaskId,
    pub group_size: usize,
    pub options: InterpreterOptions,
    pub fuel: usize,
}
impl WorkerFactory<ClusterAction> for TaskWorkerFactory {
    type Worker = TaskWorker;
    fn create(&self) -> Self::Worker {
        TaskWorker {
            task: RuntimeTask::new(
                self.module.clone(),
                self.task_id,
                self.group_size,
                self.options,
            ),
            fuel: self.fuel,
            halted: false,
            reported_done: false,
        }
    }
}

/// One cluster process as a scheduler worker: protocol messages in,
/// protocol messages out, with a slice of machine execution after every
/// delivery and a self-addressed resume while runnable work remains
pub struct TaskWorker {
    task: RuntimeTask,
    fuel: usize,
    halted: bool,
    reported_done: bool,
}
impl TaskWorker {
    fn convert(&self, out: Outgoing) -> Vec<StateOperation<ClusterAction>> {
        let own = self.task.task_id();
        out.into_iter()
            .map(|(dest, message)| {
                StateOperation::Send(
                    task_pid(dest),
                    ClusterAction::Message { from: own, message },
                )
            })
            .collect()
    }
    fn halt(&mut self, error: String) -> StateTransition<ClusterAction> {
        debug!(task = %self.task.task_id(), %error, "task halted");
        self.halted = true;
        StateTransition::new(std::iter::once(StateOperation::Send(
            ProcessId::default(),
            ClusterAction::TaskFailed {
                task: self.task.task_id(),
                error,
            },
        )))
    }
}
impl Worker<ClusterAction> for TaskWorker {
    fn handle(
        &mut self,
        action: ClusterAction,
        _metadata: &MessageData,
        context: &mut impl HandlerContext,
    ) -> StateTransition<ClusterAction> {
        let ClusterAction::Message { from, message } = action else {
            return Default::default();
        };
        if self.halted {
            return Default::default();
        }
        let mut operations = match self.task.handle_message(from, message) {
            Ok(out) => self.convert(out),
            Err(error) => return self.halt(error),
        };
        let status = match self.task.pump(self.fuel) {
            Ok((status, out)) => {
                operations.extend(self.convert(out));
                status
            }
            Err(error) => return self.halt(error),
        };
        if self.task.machine.is_done() && !self.reported_done {
            self.reported_done = true;
            let value = self
                .task
                .machine
                .result()
                .map(|result| self.task.machine.read_back(result))
                .unwrap_or(Value::Nil);
            operations.push(StateOperation::Send(
                ProcessId::default(),
                ClusterAction::TaskDone {
                    task: self.task.task_id(),
                    value,
                },
            ));
            operations.extend(self.convert(
                self.task
                    .peers()
                    .map(|peer| (peer, TaskMessage::Done))
                    .collect(),
            ));
        } else if status == MachineStatus::OutOfFuel {
            // More work remains: requeue ourselves so other tasks'
            // messages interleave with execution
            operations.push(StateOperation::Send(
                context.pid(),
                ClusterAction::Message {
                    from: self.task.task_id(),
                    message: TaskMessage::Resume,
                },
            ));
        }
        StateTransition::new(operations)
    }
}

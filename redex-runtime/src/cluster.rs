// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use redex::core::TaskId;
use redex_compiler::bytecode::BytecodeModule;
use redex_dispatcher::scheduler::{NoopTaskRunner, SyncScheduler};
use redex_dispatcher::{
    Actor, ActorTransition, HandlerContext, MessageData, StateOperation, StateTransition,
};
use redex_interpreter::{InterpreterOptions, Value};

use crate::actor::{task_pid, TaskWorkerFactory};
use crate::message::{ClusterAction, TaskMessage};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// Number of cooperating VM instances
    pub tasks: usize,
    /// Instructions each task executes between message deliveries
    pub fuel: usize,
    pub interpreter: InterpreterOptions,
}
impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            tasks: 1,
            fuel: 10_000,
            interpreter: InterpreterOptions::default(),
        }
    }
}

#[derive(Default)]
pub struct ClusterState {
    started: bool,
    result: Option<Value>,
    failures: Vec<(TaskId, String)>,
}
impl ClusterState {
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }
    pub fn failures(&self) -> &[(TaskId, String)] {
        &self.failures
    }
}

/// Root actor: spawns one worker per task, kicks off execution, and
/// records the final value or the first fatal error
struct ClusterRoot {
    module: Arc<BytecodeModule>,
    options: ClusterOptions,
}
impl Actor<ClusterAction> for ClusterRoot {
    type State = ClusterState;
    fn init(&self) -> Self::State {
        Default::default()
    }
    fn handle(
        &self,
        mut state: Self::State,
        action: &ClusterAction,
        _metadata: &MessageData,
        context: &mut impl HandlerContext,
    ) -> ActorTransition<Self::State, ClusterAction> {
        let operations = match action {
            ClusterAction::Start if !state.started => {
                state.started = true;
                let mut operations = Vec::new();
                for task in (0..self.options.tasks).map(TaskId::from) {
                    let pid = context.generate_pid();
                    debug_assert_eq!(pid, task_pid(task));
                    operations.push(StateOperation::spawn(
                        pid,
                        TaskWorkerFactory {
                            module: self.module.clone(),
                            task_id: task,
                            group_size: self.options.tasks,
                            options: self.options.interpreter,
                            fuel: self.options.fuel,
                        },
                    ));
                }
                for task in (0..self.options.tasks).map(TaskId::from) {
                    operations.push(StateOperation::Send(
                        task_pid(task),
                        ClusterAction::Message {
                            from: task,
                            message: TaskMessage::Resume,
                        },
                    ));
                }
                StateTransition::new(operations)
            }
            ClusterAction::Route { to, message } => {
                StateTransition::new(std::iter::once(StateOperation::Send(
                    task_pid(*to),
                    ClusterAction::Message {
                        from: *to,
                        message: message.clone(),
                    },
                )))
            }
            ClusterAction::TaskDone { task, value } => {
                debug!(task = %task, "cluster evaluation complete");
                state.result = Some(value.clone());
                Default::default()
            }
            ClusterAction::TaskFailed { task, error } => {
                state.failures.push((*task, error.clone()));
                Default::default()
            }
            _ => Default::default(),
        };
        ActorTransition::new(state, operations)
    }
}

/// A cluster of cooperating single-threaded VM instances evaluating one
/// program, communicating exclusively through the message protocol over
/// the synchronous scheduler
pub struct Cluster {
    scheduler: SyncScheduler<ClusterRoot, ClusterAction, NoopTaskRunner>,
    options: ClusterOptions,
}
impl Cluster {
    pub fn new(module: Arc<BytecodeModule>, options: ClusterOptions) -> Self {
        let scheduler = SyncScheduler::new(
            ClusterRoot {
                module,
                options,
            },
            NoopTaskRunner,
        );
        Self { scheduler, options }
    }
    pub fn state(&self) -> &ClusterState {
        self.scheduler.state()
    }
    /// Evaluate the program to completion across the cluster
    pub fn run(&mut self) -> Result<Value, String> {
        self.scheduler.dispatch(ClusterAction::Start);
        let state = self.scheduler.state();
        if let Some((task, error)) = state.failures.first() {
            return Err(format!("{}: {}", task, error));
        }
        state
            .result
            .clone()
            .ok_or_else(|| String::from("Deadlock: cluster quiesced without a result"))
    }
    /// Trigger a cluster-wide distributed collection cycle
    pub fn collect_distributed(&mut self) -> Result<(), String> {
        let coordinator = TaskId::from(self.options.tasks - 1);
        self.scheduler.dispatch(ClusterAction::Route {
            to: coordinator,
            message: TaskMessage::StartDistGc,
        });
        match self.scheduler.state().failures.first() {
            Some((task, error)) => Err(format!("{}: {}", task, error)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redex::stdlib::Builtin;
    use redex_compiler::syntax::{Binding, Module, SNode, Scomb};
    use redex_compiler::{Compiler, CompilerOptions};

    fn compiled(module: Module) -> Arc<BytecodeModule> {
        Arc::new(
            Compiler::new(CompilerOptions::default())
                .compile(module)
                .unwrap(),
        )
    }

    fn parallel_fib_module() -> Arc<BytecodeModule> {
        // pfib n = if (< n 2) n
        //          (letrec a = pfib (- n 1); b = pfib (- n 2)
        //           in par a (+ a b))
        let mut module = Module::default();
        module.add(Scomb::new(
            "pfib",
            ["n"],
            SNode::apps(
                SNode::builtin(Builtin::If),
                [
                    SNode::apps(
                        SNode::builtin(Builtin::Lt),
                        [SNode::symbol("n"), SNode::number(2.0)],
                    ),
                    SNode::symbol("n"),
                    SNode::letrec(
                        [
                            Binding::new(
                                "a",
                                SNode::app(
                                    SNode::scref("pfib"),
                                    SNode::apps(
                                        SNode::builtin(Builtin::Subtract),
                                        [SNode::symbol("n"), SNode::number(1.0)],
                                    ),
                                ),
                            ),
                            Binding::new(
                                "b",
                                SNode::app(
                                    SNode::scref("pfib"),
                                    SNode::apps(
                                        SNode::builtin(Builtin::Subtract),
                                        [SNode::symbol("n"), SNode::number(2.0)],
                                    ),
                                ),
                            ),
                        ],
                        SNode::apps(
                            SNode::builtin(Builtin::Par),
                            [
                                SNode::symbol("a"),
                                SNode::apps(
                                    SNode::builtin(Builtin::Add),
                                    [SNode::symbol("a"), SNode::symbol("b")],
                                ),
                            ],
                        ),
                    ),
                ],
            ),
        ));
        module.add(Scomb::new(
            "main",
            [] as [&str; 0],
            SNode::app(SNode::scref("pfib"), SNode::number(10.0)),
        ));
        compiled(module)
    }

    #[test]
    fn single_task_cluster_evaluates_to_completion() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "main",
            [] as [&str; 0],
            SNode::apps(
                SNode::builtin(Builtin::Add),
                [SNode::number(40.0), SNode::number(2.0)],
            ),
        ));
        let mut cluster = Cluster::new(compiled(module), ClusterOptions::default());
        assert_eq!(cluster.run().unwrap(), Value::Number(42.0));
    }

    #[test]
    fn parallel_evaluation_agrees_with_sequential() {
        let module = parallel_fib_module();
        let mut sequential = Cluster::new(module.clone(), ClusterOptions::default());
        let expected = sequential.run().unwrap();
        assert_eq!(expected, Value::Number(55.0));
        let mut parallel = Cluster::new(
            module,
            ClusterOptions {
                tasks: 2,
                // A small slice forces frequent interleaving, giving the
                // idle task plenty of chances to steal sparks
                fuel: 200,
                ..ClusterOptions::default()
            },
        );
        assert_eq!(parallel.run().unwrap(), expected);
    }

    #[test]
    fn four_task_clusters_converge() {
        let module = parallel_fib_module();
        let mut cluster = Cluster::new(
            module,
            ClusterOptions {
                tasks: 4,
                fuel: 150,
                ..ClusterOptions::default()
            },
        );
        assert_eq!(cluster.run().unwrap(), Value::Number(55.0));
    }

    #[test]
    fn distributed_collection_runs_between_evaluations() {
        let module = parallel_fib_module();
        let mut cluster = Cluster::new(
            module,
            ClusterOptions {
                tasks: 2,
                fuel: 200,
                ..ClusterOptions::default()
            },
        );
        assert_eq!(cluster.run().unwrap(), Value::Number(55.0));
        cluster.collect_distributed().unwrap();
    }

    #[test]
    fn runtime_errors_surface_as_cluster_failures() {
        let mut module = Module::default();
        module.add(Scomb::new(
            "main",
            [] as [&str; 0],
            SNode::apps(
                SNode::builtin(Builtin::Divide),
                [SNode::number(1.0), SNode::number(0.0)],
            ),
        ));
        let mut cluster = Cluster::new(compiled(module), ClusterOptions::default());
        let error = cluster.run().err().unwrap();
        assert!(error.contains("Division by zero"), "{}", error);
    }
}

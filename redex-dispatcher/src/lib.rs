// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::iter::empty;

use futures::{
    future::{AbortHandle, Abortable},
    Stream,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub mod scheduler;

pub trait Action {}

pub trait NamedAction: Action {
    fn name(&self) -> &'static str;
}

pub trait SerializableAction: NamedAction {
    fn to_json(&self) -> SerializedAction;
}

pub struct SerializedAction {
    inner: Vec<(String, JsonValue)>,
}
impl From<SerializedAction> for JsonValue {
    fn from(value: SerializedAction) -> Self {
        JsonValue::Object(JsonMap::from_iter(value.inner))
    }
}
impl FromIterator<(&'static str, JsonValue)> for SerializedAction {
    fn from_iter<T: IntoIterator<Item = (&'static str, JsonValue)>>(iter: T) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(key, value)| (String::from(key), value))
                .collect(),
        }
    }
}
impl IntoIterator for SerializedAction {
    type Item = (String, JsonValue);
    type IntoIter = std::vec::IntoIter<Self::Item>;
    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Default, Debug, Serialize, Deserialize)]
pub struct ProcessId(usize);
impl ProcessId {
    pub fn next(&self) -> Self {
        let Self(value) = self;
        Self(value + 1)
    }
}
impl From<usize> for ProcessId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
impl From<ProcessId> for usize {
    fn from(value: ProcessId) -> Self {
        let ProcessId(value) = value;
        value
    }
}
impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(value) = self;
        write!(f, "<pid:{}>", value)
    }
}

#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Debug, Serialize, Deserialize, Hash,
)]
pub struct MessageOffset(usize);
impl MessageOffset {
    pub fn next(&self) -> MessageOffset {
        let Self(value) = self;
        Self(*value + 1)
    }
}
impl From<usize> for MessageOffset {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
impl From<MessageOffset> for usize {
    fn from(value: MessageOffset) -> Self {
        let MessageOffset(value) = value;
        value
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MessageData {
    pub offset: MessageOffset,
    pub parent: Option<MessageOffset>,
    pub timestamp: std::time::Instant,
}

pub trait HandlerContext {
    fn pid(&self) -> ProcessId;
    fn caller_pid(&self) -> Option<ProcessId>;
    fn generate_pid(&mut self) -> ProcessId;
}

/// Stateful message handler driving the root of a scheduler: each
/// incoming action produces a new state plus any number of outgoing
/// operations
pub trait Actor<TAction: Action> {
    type State;
    fn init(&self) -> Self::State;
    fn handle(
        &self,
        state: Self::State,
        action: &TAction,
        metadata: &MessageData,
        context: &mut impl HandlerContext,
    ) -> ActorTransition<Self::State, TAction>;
}

pub struct ActorTransition<S, TAction: Action> {
    state: S,
    actions: StateTransition<TAction>,
}
impl<S, TAction: Action> ActorTransition<S, TAction> {
    pub fn new(state: S, actions: StateTransition<TAction>) -> Self {
        Self { state, actions }
    }
    pub fn into_parts(self) -> (S, StateTransition<TAction>) {
        let Self { state, actions } = self;
        (state, actions)
    }
}

pub struct StateTransition<TAction: Action>(Vec<StateOperation<TAction>>);
impl<TAction: Action> Default for StateTransition<TAction> {
    fn default() -> Self {
        Self(Default::default())
    }
}
impl<TAction: Action> StateTransition<TAction> {
    pub fn new(operations: impl IntoIterator<Item = StateOperation<TAction>>) -> Self {
        Self::from_iter(operations)
    }
    pub fn append(self, other: StateTransition<TAction>) -> StateTransition<TAction> {
        let Self(mut operations) = self;
        let Self(other_operations) = other;
        operations.extend(other_operations);
        Self(operations)
    }
    pub fn len(&self) -> usize {
        let Self(operations) = self;
        operations.len()
    }
    pub fn is_empty(&self) -> bool {
        let Self(operations) = self;
        operations.is_empty()
    }
    pub fn into_operations(self) -> Vec<StateOperation<TAction>> {
        let Self(operations) = self;
        operations
    }
}
impl<TAction: Action> FromIterator<StateOperation<TAction>> for StateTransition<TAction> {
    fn from_iter<T: IntoIterator<Item = StateOperation<TAction>>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
impl<TAction: Action> IntoIterator for StateTransition<TAction> {
    type Item = StateOperation<TAction>;
    type IntoIter = std::vec::IntoIter<StateOperation<TAction>>;
    fn into_iter(self) -> Self::IntoIter {
        let Self(actions) = self;
        actions.into_iter()
    }
}

pub enum StateOperation<TAction: Action> {
    /// Deliver an action to the given process's queue
    Send(ProcessId, TAction),
    /// Attach an externally-driven action source
    Task(ProcessId, OperationStream<TAction>),
    /// Create a worker process
    Spawn(ProcessId, BoxedWorkerFactory<TAction>),
    Kill(ProcessId),
}
impl<TAction> StateOperation<TAction>
where
    TAction: Action + Send + 'static,
{
    pub fn spawn(pid: ProcessId, worker: impl WorkerFactory<TAction>) -> Self {
        Self::Spawn(pid, BoxedWorkerFactory::new(worker))
    }
}

/// A stream of operations injected from outside the scheduler (console
/// input, timers), with a handle that aborts the underlying source when
/// the owning process is killed
pub struct OperationStream<TAction: Action> {
    task: Box<dyn Stream<Item = StateOperation<TAction>> + Send + Unpin + 'static>,
    abort: Option<AbortHandle>,
}
impl<TAction> OperationStream<TAction>
where
    TAction: Action + Send + 'static,
{
    pub fn new(task: impl Stream<Item = StateOperation<TAction>> + Send + Unpin + 'static) -> Self {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let task = Abortable::new(task, abort_registration);
        Self {
            task: Box::new(task),
            abort: Some(abort_handle),
        }
    }
    pub fn noop() -> Self {
        Self {
            task: Box::new(futures::stream::empty()),
            abort: None,
        }
    }
    pub fn into_inner(
        self,
    ) -> (
        Box<dyn Stream<Item = StateOperation<TAction>> + Send + Unpin + 'static>,
        Option<AbortHandle>,
    ) {
        (self.task, self.abort)
    }
}

/// Worker processes handle actions addressed to their own process id
pub trait Worker<TAction: Action>: Send + 'static {
    fn handle(
        &mut self,
        action: TAction,
        metadata: &MessageData,
        context: &mut impl HandlerContext,
    ) -> StateTransition<TAction>;
}

pub trait WorkerFactory<TAction: Action>: Send + 'static {
    type Worker: Worker<TAction>;
    fn create(&self) -> Self::Worker;
}

pub struct NoopWorkerFactory;
impl<TAction: Action + Send + 'static> WorkerFactory<TAction> for NoopWorkerFactory {
    type Worker = NoopWorker;
    fn create(&self) -> Self::Worker {
        NoopWorker
    }
}
pub struct NoopWorker;
impl<TAction: Action + Send + 'static> Worker<TAction> for NoopWorker {
    fn handle(
        &mut self,
        _action: TAction,
        _metadata: &MessageData,
        _context: &mut impl HandlerContext,
    ) -> StateTransition<TAction> {
        StateTransition::new(empty())
    }
}

/// Object-safe worker wrapper allowing heterogeneous workers in one
/// scheduler
pub trait DynWorker<TAction: Action>: Send + 'static {
    fn handle_dyn(
        &mut self,
        action: TAction,
        metadata: &MessageData,
        context: &mut WorkerContext,
    ) -> StateTransition<TAction>;
}
impl<T, TAction> DynWorker<TAction> for T
where
    TAction: Action,
    T: Worker<TAction>,
{
    fn handle_dyn(
        &mut self,
        action: TAction,
        metadata: &MessageData,
        context: &mut WorkerContext,
    ) -> StateTransition<TAction> {
        self.handle(action, metadata, context)
    }
}

pub type BoxedWorkerInstance<TAction> = Box<dyn DynWorker<TAction>>;

pub struct BoxedWorkerFactory<TAction: Action> {
    factory: Box<dyn Fn() -> BoxedWorkerInstance<TAction> + Send + 'static>,
}
impl<TAction> BoxedWorkerFactory<TAction>
where
    TAction: Action + Send + 'static,
{
    pub fn new<TFactory>(factory: TFactory) -> Self
    where
        TFactory: WorkerFactory<TAction>,
    {
        Self {
            factory: Box::new(move || Box::new(factory.create())),
        }
    }
    pub fn noop() -> Self {
        Self {
            factory: Box::new(|| Box::new(NoopWorker)),
        }
    }
    pub fn create(&self) -> BoxedWorkerInstance<TAction> {
        (self.factory)()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pid: ProcessId,
    caller_pid: Option<ProcessId>,
    next_pid: ProcessId,
}
impl WorkerContext {
    pub(crate) fn new(pid: ProcessId, caller_pid: Option<ProcessId>, next_pid: ProcessId) -> Self {
        Self {
            pid,
            caller_pid,
            next_pid,
        }
    }
    pub(crate) fn next_pid(&self) -> ProcessId {
        self.next_pid
    }
}
impl HandlerContext for WorkerContext {
    fn pid(&self) -> ProcessId {
        self.pid
    }
    fn caller_pid(&self) -> Option<ProcessId> {
        self.caller_pid
    }
    fn generate_pid(&mut self) -> ProcessId {
        let next_pid = self.next_pid.next();
        std::mem::replace(&mut self.next_pid, next_pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[derive(Clone, Debug, PartialEq)]
    enum TestAction {
        Ping(usize),
    }
    impl Action for TestAction {}
    impl NamedAction for TestAction {
        fn name(&self) -> &'static str {
            "ping"
        }
    }

    #[test]
    fn operation_streams_yield_their_operations() {
        let source = stream::iter(
            (0..3).map(|index| StateOperation::Send(ProcessId::from(1), TestAction::Ping(index))),
        );
        let (task, abort) = OperationStream::new(source).into_inner();
        assert!(abort.is_some());
        let collected = futures::executor::block_on_stream(task)
            .map(|operation| match operation {
                StateOperation::Send(pid, action) => (pid, action),
                _ => panic!("unexpected operation"),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            collected,
            vec![
                (ProcessId::from(1), TestAction::Ping(0)),
                (ProcessId::from(1), TestAction::Ping(1)),
                (ProcessId::from(1), TestAction::Ping(2)),
            ]
        );
    }

    #[test]
    fn aborted_streams_terminate() {
        let source = stream::iter(
            (0..3).map(|index| StateOperation::Send(ProcessId::from(1), TestAction::Ping(index))),
        );
        let stream = OperationStream::new(source);
        let (task, abort) = stream.into_inner();
        abort.unwrap().abort();
        let collected = futures::executor::block_on_stream(task).count();
        assert_eq!(collected, 0);
    }
}

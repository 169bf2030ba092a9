// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use redex::core::TaskId;
use redex::global::GAddr;
use redex_dispatcher::{Action, NamedAction, SerializableAction, SerializedAction};
use redex_interpreter::Value;

/// Inter-task protocol. Heap graphs cross task boundaries only inside the
/// byte payloads of `Transfer` and `Schedule`, encoded by the wire module;
/// tasks never exchange cell handles directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TaskMessage {
    /// Evaluation is complete cluster-wide; stop executing
    Done,
    /// Continue executing (also used by a task to self-schedule the next
    /// run slice)
    Resume,
    /// Suspend execution until the next Resume
    Pause,
    /// Work-stealing probe: an idle task is looking for sparked frames
    Fish {
        requester: TaskId,
        age: usize,
        nframes: usize,
    },
    /// Request the object at `objaddr` (owned by the receiver) to be sent
    /// to the requester's `storeaddr`
    Fetch { objaddr: GAddr, storeaddr: GAddr },
    /// Response to a Fetch: a serialized sub-graph plus the store address
    /// it answers
    Transfer { bytes: Vec<u8> },
    /// Acknowledge receipt of `count` messages carrying `naddrs` global
    /// addresses in total
    Ack { count: usize, naddrs: usize },
    /// Migrated sparked frames: pairs of serialized frame graph and the
    /// sender-side reference address awaiting the receiver's assignment
    Schedule { bytes: Vec<u8> },
    /// Assignment replies for previously scheduled frames
    UpdateRef { entries: Vec<(GAddr, GAddr)> },
    /// Open a distributed collection cycle
    StartDistGc,
    /// Mark local roots with the distributed mark bit and propagate
    MarkRoots,
    /// Mark the given owned objects, propagating to further references
    MarkEntry { addrs: Vec<GAddr> },
    /// Termination-detection counter deltas, sent to the coordinator
    GcUpdate { counts: Vec<i64> },
    /// All marking has quiesced; sweep and acknowledge
    Sweep,
    SweepAck,
    /// Log execution statistics
    Stats,
}
impl TaskMessage {
    /// Number of global addresses embedded in a value-carrying payload,
    /// for acknowledgement bookkeeping
    pub fn requires_ack(&self) -> bool {
        matches!(self, Self::Transfer { .. } | Self::Schedule { .. })
    }
}

/// Scheduler-level action envelope: the root actor coordinates the
/// cluster while task messages flow between worker processes
#[derive(Clone, Debug)]
pub enum ClusterAction {
    /// Spawn the task workers and begin evaluation
    Start,
    /// Inject a message addressed to a specific task
    Route { to: TaskId, message: TaskMessage },
    /// A task-to-task (or self-scheduled) protocol message
    Message { from: TaskId, message: TaskMessage },
    /// The task owning the program root has produced the final value
    TaskDone { task: TaskId, value: Value },
    /// A task halted with a fatal runtime or protocol error
    TaskFailed { task: TaskId, error: String },
}
impl Action for ClusterAction {}
impl NamedAction for ClusterAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Route { .. } => "Route",
            Self::Message { message, .. } => match message {
                TaskMessage::Done => "Done",
                TaskMessage::Resume => "Resume",
                TaskMessage::Pause => "Pause",
                TaskMessage::Fish { .. } => "Fish",
                TaskMessage::Fetch { .. } => "Fetch",
                TaskMessage::Transfer { .. } => "Transfer",
                TaskMessage::Ack { .. } => "Ack",
                TaskMessage::Schedule { .. } => "Schedule",
                TaskMessage::UpdateRef { .. } => "UpdateRef",
                TaskMessage::StartDistGc => "StartDistGc",
                TaskMessage::MarkRoots => "MarkRoots",
                TaskMessage::MarkEntry { .. } => "MarkEntry",
                TaskMessage::GcUpdate { .. } => "GcUpdate",
                TaskMessage::Sweep => "Sweep",
                TaskMessage::SweepAck => "SweepAck",
                TaskMessage::Stats => "Stats",
            },
            Self::TaskDone { .. } => "TaskDone",
            Self::TaskFailed { .. } => "TaskFailed",
        }
    }
}
impl SerializableAction for ClusterAction {
    fn to_json(&self) -> SerializedAction {
        match self {
            Self::Start => {
                SerializedAction::from_iter(std::iter::empty::<(&'static str, JsonValue)>())
            }
            Self::Route { to, message } => SerializedAction::from_iter([
                ("to", json!(to.get())),
                ("message", message_json(message)),
            ]),
            Self::Message { from, message } => SerializedAction::from_iter([
                ("from", json!(from.get())),
                ("message", message_json(message)),
            ]),
            Self::TaskDone { task, .. } => {
                SerializedAction::from_iter([("task", json!(task.get()))])
            }
            Self::TaskFailed { task, error } => SerializedAction::from_iter([
                ("task", json!(task.get())),
                ("error", json!(error)),
            ]),
        }
    }
}

fn message_json(message: &TaskMessage) -> JsonValue {
    serde_json::to_value(message).unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redex::core::LocalId;

    #[test]
    fn value_carrying_messages_require_acknowledgement() {
        assert!(TaskMessage::Transfer { bytes: Vec::new() }.requires_ack());
        assert!(TaskMessage::Schedule { bytes: Vec::new() }.requires_ack());
        assert!(!TaskMessage::MarkRoots.requires_ack());
        assert!(!TaskMessage::Fish {
            requester: TaskId(0),
            age: 1,
            nframes: 1
        }
        .requires_ack());
    }

    #[test]
    fn actions_render_to_json_diagnostics() {
        let action = ClusterAction::Message {
            from: TaskId(1),
            message: TaskMessage::Fetch {
                objaddr: GAddr::new(TaskId(0), LocalId(3)),
                storeaddr: GAddr::new(TaskId(1), LocalId(7)),
            },
        };
        assert_eq!(action.name(), "Fetch");
        let rendered = JsonValue::from(action.to_json());
        assert_eq!(rendered["from"], json!(1));
        assert!(rendered["message"].is_object() || rendered["message"].is_string());
    }
}

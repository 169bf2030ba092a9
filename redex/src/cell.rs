// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use std::sync::Arc;

use crate::core::FunctionId;
use crate::stdlib::Builtin;

/// Handle to a heap cell slot. Handles are plain indices into the owning
/// task's arena and are only meaningful within that task.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct CellPtr(pub u32);
impl CellPtr {
    pub fn index(&self) -> usize {
        let Self(value) = self;
        *value as usize
    }
}
impl std::fmt::Display for CellPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(value) = self;
        write!(f, "<cell:{}>", value)
    }
}

/// Handle to an activation record in the frame arena
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct FrameId(pub u32);
impl FrameId {
    pub fn index(&self) -> usize {
        let Self(value) = self;
        *value as usize
    }
}

/// Handle to a partial application record in the cap arena
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct CapId(pub u32);
impl CapId {
    pub fn index(&self) -> usize {
        let Self(value) = self;
        *value as usize
    }
}

/// Handle to a global addressing record
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct GlobalId(pub u32);
impl GlobalId {
    pub fn index(&self) -> usize {
        let Self(value) = self;
        *value as usize
    }
}

/// Chunked representation of a list spine, used to avoid cons-cell
/// explosion on long lists. Referenced from the heap via `ArrayRef` cells
/// which address individual offsets within the chunk.
#[derive(Clone, Debug)]
pub struct CellArray {
    pub elements: Vec<CellPtr>,
    pub tail: CellPtr,
}
impl CellArray {
    pub fn new(elements: impl IntoIterator<Item = CellPtr>, tail: CellPtr) -> Self {
        Self {
            elements: elements.into_iter().collect(),
            tail,
        }
    }
    pub fn len(&self) -> usize {
        self.elements.len()
    }
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// The universal heap unit. Compile-time-only variants (lambdas, letrecs,
/// unresolved symbols) never appear here: code generation resolves them
/// all away before anything reaches the runtime heap.
#[derive(Clone, Debug)]
pub enum CellValue {
    /// Free-list slot; never observable through a live handle
    Empty,
    Application {
        function: CellPtr,
        argument: CellPtr,
    },
    Builtin(Builtin),
    ScRef(FunctionId),
    Cons {
        head: CellPtr,
        tail: CellPtr,
    },
    Nil,
    Number(f64),
    Str(Arc<str>),
    /// Forwarding pointer written when a redex has been reduced
    Ind(CellPtr),
    /// Placeholder for a not-yet-computed letrec binding
    Hole,
    Frame(FrameId),
    Cap(CapId),
    Array(CellArray),
    ArrayRef {
        array: CellPtr,
        index: usize,
    },
    /// Reference to an object owned by another task
    RemoteRef(GlobalId),
}
impl CellValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Application { .. } => "APPLICATION",
            Self::Builtin(_) => "BUILTIN",
            Self::ScRef(_) => "SCREF",
            Self::Cons { .. } => "CONS",
            Self::Nil => "NIL",
            Self::Number(_) => "NUMBER",
            Self::Str(_) => "STRING",
            Self::Ind(_) => "IND",
            Self::Hole => "HOLE",
            Self::Frame(_) => "FRAME",
            Self::Cap(_) => "CAP",
            Self::Array(_) => "ARRAY",
            Self::ArrayRef { .. } => "AREF",
            Self::RemoteRef(_) => "REMOTEREF",
        }
    }
    /// Whether the cell is already in weak-head normal form
    pub fn is_value(&self) -> bool {
        matches!(
            self,
            Self::Cons { .. }
                | Self::Nil
                | Self::Number(_)
                | Self::Str(_)
                | Self::Array(_)
                | Self::ArrayRef { .. }
        )
    }
}

/// A heap slot: the tagged value plus the collector's side-flags. The
/// original bit-packed these into the cell tag; they are explicit fields
/// here so the value enum stays a closed sum over genuine variants.
#[derive(Clone, Debug)]
pub struct Cell {
    pub value: CellValue,
    /// Per-cycle local mark bit
    pub marked: bool,
    /// Set on cells embedded in generated code as literals; never collected
    pub pinned: bool,
    /// Distributed mark bit; protects the cell while cross-task marking is
    /// outstanding
    pub dmb: bool,
    /// Allocated while a distributed collection cycle was in progress
    pub new: bool,
}
impl Cell {
    pub fn new(value: CellValue) -> Self {
        Self {
            value,
            marked: false,
            pinned: false,
            dmb: false,
            new: false,
        }
    }
    pub fn is_empty(&self) -> bool {
        matches!(self.value, CellValue::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_classification() {
        assert!(CellValue::Nil.is_value());
        assert!(CellValue::Number(3.0).is_value());
        assert!(!CellValue::Hole.is_value());
        assert!(!CellValue::Ind(CellPtr(0)).is_value());
        assert!(!CellValue::Frame(FrameId(0)).is_value());
    }

    #[test]
    fn type_names_match_variants() {
        assert_eq!(CellValue::Nil.type_name(), "NIL");
        assert_eq!(
            CellValue::Cons {
                head: CellPtr(0),
                tail: CellPtr(1)
            }
            .type_name(),
            "CONS"
        );
        assert_eq!(CellValue::RemoteRef(GlobalId(4)).type_name(), "REMOTEREF");
    }
}

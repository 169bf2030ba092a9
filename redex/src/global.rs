// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};

use crate::cell::{CellPtr, FrameId, GlobalId};
use crate::core::{LocalId, TaskId};
use crate::hash::FnvHashMap;

/// Global address: uniquely names a heap object within the cluster. The
/// local id is absent while an export is awaiting address assignment by
/// the receiving task (a frame migrated by a SCHEDULE message does not
/// learn its remote id until the UPDATEREF reply arrives).
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash, Serialize, Deserialize)]
pub struct GAddr {
    pub owner: TaskId,
    pub lid: Option<LocalId>,
}
impl GAddr {
    pub fn new(owner: TaskId, lid: LocalId) -> Self {
        Self {
            owner,
            lid: Some(lid),
        }
    }
    pub fn pending(owner: TaskId) -> Self {
        Self { owner, lid: None }
    }
    pub fn is_pending(&self) -> bool {
        self.lid.is_none()
    }
}
impl std::fmt::Display for GAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.lid {
            Some(lid) => write!(f, "{}@{}", lid, self.owner.get()),
            None => write!(f, "?@{}", self.owner.get()),
        }
    }
}

/// Bidirectional binding between a global address and a local cell.
///
/// For entry items (objects this task owns) the pointer leads to the
/// actual object; for exit items (objects another task owns) it leads to
/// the local `RemoteRef` cell standing in for the object.
#[derive(Clone, Debug)]
pub struct Global {
    pub addr: GAddr,
    pub ptr: CellPtr,
    /// A FETCH for this object is outstanding
    pub fetching: bool,
    /// Local frames blocked until the value arrives
    pub waiters: Vec<FrameId>,
    /// Remote store addresses to respond to once the value exists locally
    pub fetchers: Vec<GAddr>,
    pub marked: bool,
    pub dmb: bool,
    pub new: bool,
}
impl Global {
    fn new(addr: GAddr, ptr: CellPtr, in_dist_gc: bool) -> Self {
        Self {
            addr,
            ptr,
            fetching: false,
            waiters: Vec::new(),
            fetchers: Vec::new(),
            marked: false,
            dmb: false,
            new: in_dist_gc,
        }
    }
}

/// Owns every global record of one task, indexed both by local pointer
/// and by address. The sweep phase of the collector drops records that
/// are neither marked nor bound to a surviving cell.
pub struct GlobalTable {
    entries: Vec<Option<Global>>,
    free: Vec<GlobalId>,
    by_ptr: FnvHashMap<CellPtr, Vec<GlobalId>>,
    by_addr: FnvHashMap<GAddr, GlobalId>,
    next_lid: LocalId,
}
impl Default for GlobalTable {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            by_ptr: FnvHashMap::default(),
            by_addr: FnvHashMap::default(),
            next_lid: LocalId::default(),
        }
    }
}
impl GlobalTable {
    pub fn add(&mut self, addr: GAddr, ptr: CellPtr, in_dist_gc: bool) -> GlobalId {
        let global = Global::new(addr, ptr, in_dist_gc);
        let id = match self.free.pop() {
            Some(id) => {
                self.entries[id.index()] = Some(global);
                id
            }
            None => {
                let id = GlobalId(self.entries.len() as u32);
                self.entries.push(Some(global));
                id
            }
        };
        self.by_ptr.entry(ptr).or_default().push(id);
        if !addr.is_pending() {
            self.by_addr.insert(addr, id);
        }
        id
    }
    /// Return the export record for a cell this task owns, assigning a
    /// fresh local id on first export
    pub fn export(&mut self, owner: TaskId, ptr: CellPtr, in_dist_gc: bool) -> GlobalId {
        if let Some(existing) = self.lookup_owned_by_ptr(owner, ptr) {
            return existing;
        }
        let lid = self.fresh_lid();
        self.add(GAddr::new(owner, lid), ptr, in_dist_gc)
    }
    pub fn fresh_lid(&mut self) -> LocalId {
        let lid = self.next_lid;
        self.next_lid = lid.next();
        lid
    }
    pub fn get(&self, id: GlobalId) -> &Global {
        self.entries[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("Access to freed global {:?}", id))
    }
    pub fn get_mut(&mut self, id: GlobalId) -> &mut Global {
        self.entries[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("Access to freed global {:?}", id))
    }
    pub fn lookup_by_addr(&self, addr: GAddr) -> Option<GlobalId> {
        self.by_addr.get(&addr).copied()
    }
    pub fn lookup_by_ptr(&self, ptr: CellPtr) -> Option<GlobalId> {
        self.by_ptr
            .get(&ptr)
            .and_then(|ids| ids.first())
            .copied()
    }
    pub fn lookup_owned_by_ptr(&self, owner: TaskId, ptr: CellPtr) -> Option<GlobalId> {
        self.by_ptr.get(&ptr).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|id| self.get(*id).addr.owner == owner && !self.get(*id).addr.is_pending())
        })
    }
    /// Rebind a record whose address was pending to its assigned address
    pub fn assign_addr(&mut self, id: GlobalId, addr: GAddr) {
        let old = self.get(id).addr;
        if !old.is_pending() {
            self.by_addr.remove(&old);
        }
        self.get_mut(id).addr = addr;
        if !addr.is_pending() {
            self.by_addr.insert(addr, id);
        }
    }
    /// Point an existing record at a different local cell
    pub fn rebind_ptr(&mut self, id: GlobalId, ptr: CellPtr) {
        let old = self.get(id).ptr;
        if let Some(ids) = self.by_ptr.get_mut(&old) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.by_ptr.remove(&old);
            }
        }
        self.get_mut(id).ptr = ptr;
        self.by_ptr.entry(ptr).or_default().push(id);
    }
    pub fn remove(&mut self, id: GlobalId) -> Global {
        let global = self.entries[id.index()]
            .take()
            .unwrap_or_else(|| panic!("Double free of global {:?}", id));
        if let Some(ids) = self.by_ptr.get_mut(&global.ptr) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.by_ptr.remove(&global.ptr);
            }
        }
        if !global.addr.is_pending() {
            self.by_addr.remove(&global.addr);
        }
        self.free.push(id);
        global
    }
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
    pub fn ids(&self) -> Vec<GlobalId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|_| GlobalId(index as u32)))
            .collect()
    }
    pub fn iter(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry.as_ref().map(|global| (GlobalId(index as u32), global))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_assigns_each_cell_one_address() {
        let mut table = GlobalTable::default();
        let owner = TaskId(0);
        let first = table.export(owner, CellPtr(1), false);
        let again = table.export(owner, CellPtr(1), false);
        assert_eq!(first, again);
        let other = table.export(owner, CellPtr(2), false);
        assert_ne!(table.get(first).addr, table.get(other).addr);
    }

    #[test]
    fn pending_addresses_are_not_indexed_until_assigned() {
        let mut table = GlobalTable::default();
        let id = table.add(GAddr::pending(TaskId(1)), CellPtr(7), false);
        let addr = GAddr::new(TaskId(1), LocalId(42));
        assert_eq!(table.lookup_by_addr(addr), None);
        table.assign_addr(id, addr);
        assert_eq!(table.lookup_by_addr(addr), Some(id));
    }

    #[test]
    fn a_cell_may_carry_several_records() {
        let mut table = GlobalTable::default();
        let ptr = CellPtr(3);
        let exit = table.add(GAddr::new(TaskId(2), LocalId(0)), ptr, false);
        let store = table.export(TaskId(0), ptr, false);
        assert_ne!(exit, store);
        assert_eq!(table.lookup_owned_by_ptr(TaskId(0), ptr), Some(store));
        table.remove(exit);
        assert_eq!(table.lookup_by_ptr(ptr), Some(store));
    }
}

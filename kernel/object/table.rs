// Copyright 2025 The Pigweed Authors
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License. You may obtain a copy of
// the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
// License for the specific language governing permissions and limitations under
// the License.

//! The object table: a fixed-initial, geometrically-expanding array of
//! descriptors, with pseudorandom handle allocation.
//!
//! Handles are produced by stepping a linear-feedback shift register
//! whose mask and polynomial scale with the table size.  The LFSR visits
//! every slot once before any repeat and scatters reuse across the
//! table, so a freshly-destroyed handle is never immediately re-issued
//! to a new object, where a racing holder of the stale handle would
//! silently talk to the successor.  Each descriptor is additionally
//! stamped with a strictly-increasing unique id so that a consumer that
//! cached a handle across a yield can detect replacement.

use status::{Error, Result};

use crate::dispatch::MessageQueue;
use crate::object::{
    ActionPerms, CreateFlags, DEFAULT_USER_HANDLE, FIRST_DYNAMIC_HANDLE, Handle, KernelObject,
    ObjectInfo, ObjectType, Subtype, SubtypeA, SubtypeB, SYSTEM_OBJECT_HANDLE,
};

/// Initial table allocation.  Slot zero is permanently empty so that the
/// zero handle never names an object.
pub(crate) const TABLE_ALLOC_SIZE: usize = 1024;

/// Hard cap on the table size; prevents both runaway object creation and
/// memory-exhaustion attacks.
pub(crate) const MAX_OBJECTS: usize = 1 << 16;

const INITIAL_LFSR_POLY: usize = 0x409;

/// Primitive polynomials for each table period the table can grow
/// through, from 2^7 up.
const LFSR_POLY_TABLE: [usize; 16] = [
    0x83, 0x11d, 0x211, 0x409, 0x805, 0x1053, 0x201b, 0x402b, 0x8003, 0x1002d, 0x20009, 0x40027,
    0x80027, 0x100009, 0x200005, 0x400003,
];

pub(crate) struct ObjectTable {
    entries: Vec<ObjectInfo>,
    lfsr_mask: usize,
    lfsr_poly: usize,
    /// The most recently issued handle; the allocation walk starts from
    /// here.
    last_handle: usize,
    next_unique_id: u64,
    /// The global message queue shares the table's lock: every queue
    /// operation happens inside a dispatch critical section anyway.
    pub(crate) queue: MessageQueue,
}

impl ObjectTable {
    pub(crate) fn new() -> Self {
        let mut entries = Vec::with_capacity(TABLE_ALLOC_SIZE);
        entries.resize_with(TABLE_ALLOC_SIZE, ObjectInfo::cleared);
        Self {
            entries,
            lfsr_mask: TABLE_ALLOC_SIZE,
            lfsr_poly: INITIAL_LFSR_POLY,
            last_handle: 0,
            next_unique_id: 0,
            queue: MessageQueue::new(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_valid_handle(&self, handle: Handle) -> bool {
        let index = handle as usize;
        index >= 1 && index < self.entries.len()
    }

    pub(crate) fn is_valid_object(&self, handle: Handle) -> bool {
        self.is_valid_handle(handle) && self.entries[handle as usize].is_occupied()
    }

    pub(crate) fn info(&self, handle: Handle) -> &ObjectInfo {
        &self.entries[handle as usize]
    }

    pub(crate) fn info_mut(&mut self, handle: Handle) -> &mut ObjectInfo {
        &mut self.entries[handle as usize]
    }

    /// Resets a slot to the cleared template, dropping the body.
    pub(crate) fn clear_entry(&mut self, handle: Handle) {
        self.entries[handle as usize] = ObjectInfo::cleared();
    }

    /// Swaps two descriptors wholesale, used by the aliased-object
    /// destroy path to make the caller's handle name the survivor.
    pub(crate) fn swap_entries(&mut self, handle1: Handle, handle2: Handle) {
        self.entries.swap(handle1 as usize, handle2 as usize);
    }

    /// Whether two objects share an owner.  System objects (no owner)
    /// match anything, and a user object owns everything it is the
    /// recorded owner of.
    pub(crate) fn same_owner(&self, handle1: Handle, handle2: Handle) -> bool {
        let info1 = self.info(handle1);
        let info2 = self.info(handle2);
        match (info1.owner, info2.owner) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a == b || handle1 == b,
        }
    }

    /// Walks the dependency chain from `start` towards an object of one
    /// of the target types: the owner link for user targets, the
    /// dependent device for device targets, the dependent object
    /// otherwise.  At most three hops.
    pub(crate) fn find_target(&self, start: Handle, targets: &[ObjectType]) -> Result<Handle> {
        debug_assert!(!targets.is_empty());
        let mut handle = start;
        for _ in 0..=3 {
            if targets.contains(&self.info(handle).object_type) {
                return Ok(handle);
            }
            let info = self.info(handle);
            let next = if targets.contains(&ObjectType::Device) {
                info.dependent_device
            } else if targets.contains(&ObjectType::User) {
                info.owner
            } else {
                info.dependent_object
            };
            match next {
                Some(next) if self.is_valid_object(next) => handle = next,
                _ => return Err(Error::ArgObject),
            }
        }
        Err(Error::ArgObject)
    }

    /// The nesting depth of an object in the dependency graph, used by
    /// the shutdown waves.  Dependent devices are terminal, so only the
    /// dependent-object path is followed down.
    pub(crate) fn dependency_depth(&self, handle: Handle) -> usize {
        let info = self.info(handle);
        if let Some(dependent) = info.dependent_object {
            if self.is_valid_object(dependent) {
                let inner = self.info(dependent);
                if inner.dependent_object.is_some() || inner.dependent_device.is_some() {
                    return 3;
                }
            }
            return 2;
        }
        if info.dependent_device.is_some() { 2 } else { 1 }
    }

    /// Steps the LFSR from `value`: multiply by x and reduce by the
    /// polynomial.  The sequence ranges over [1, table size) with full
    /// period.
    fn lfsr_step(&self, mut value: usize) -> usize {
        value <<= 1;
        if value & self.lfsr_mask != 0 {
            value ^= self.lfsr_poly;
        }
        value
    }

    /// Steps through the table looking for a free slot, starting from
    /// the last issued handle.
    fn find_free_slot(&self, start: usize) -> Option<usize> {
        let mut value = self.lfsr_step(start);
        while value != start {
            if !self.entries[value].is_occupied() {
                return Some(value);
            }
            value = self.lfsr_step(value);
        }
        None
    }

    /// Doubles the table, upgrading the LFSR mask and polynomial so the
    /// walk covers the new period.
    fn expand(&mut self) -> Result<()> {
        if self.entries.len() >= MAX_OBJECTS {
            return Err(Error::Memory);
        }
        let new_size = self.entries.len() * 2;
        self.entries.resize_with(new_size, ObjectInfo::cleared);
        self.lfsr_mask <<= 1;
        self.lfsr_poly = LFSR_POLY_TABLE
            .iter()
            .copied()
            .find(|&poly| poly > self.lfsr_poly)
            .unwrap_or(self.lfsr_poly);
        debug_assert_eq!(self.lfsr_mask, new_size);
        Ok(())
    }

    /// Creates a new object, installing a not-inited descriptor and
    /// returning its handle.  The object is always created internal;
    /// it's up to the caller to make it externally visible.
    ///
    /// The first objects created ratchet up through the fixed system
    /// handles; afterwards handles come from the LFSR walk starting at a
    /// randomised position.
    pub(crate) fn create_object(
        &mut self,
        object_type: ObjectType,
        subtype: Subtype,
        flags: CreateFlags,
        owner: Option<Handle>,
        action_perms: ActionPerms,
        body: Box<dyn KernelObject>,
    ) -> Result<Handle> {
        if object_type == ObjectType::None {
            return Err(Error::ArgValue);
        }
        if !subtype.is_valid_for_create() {
            return Err(Error::ArgValue);
        }
        if (CreateFlags::all() & !(CreateFlags::SECURE | CreateFlags::DUMMY)).intersects(flags) {
            return Err(Error::ArgValue);
        }

        let handle = if self.last_handle < DEFAULT_USER_HANDLE as usize {
            // Still creating the fixed-handle system objects.
            debug_assert!(
                (self.last_handle + 1 == SYSTEM_OBJECT_HANDLE as usize
                    && owner.is_none()
                    && object_type == ObjectType::Device
                    && subtype == Subtype::A(SubtypeA::DEV_SYSTEM))
                    || (self.last_handle + 1 == DEFAULT_USER_HANDLE as usize
                        && owner == Some(SYSTEM_OBJECT_HANDLE)
                        && object_type == ObjectType::User
                        && subtype == Subtype::B(SubtypeB::USER_DEFAULT))
            );
            self.last_handle + 1
        } else {
            if owner.is_none_or(|o| !self.is_valid_object(o)) {
                return Err(Error::ArgObject);
            }
            match self.find_free_slot(self.last_handle) {
                Some(slot) => slot,
                None => {
                    self.expand()?;
                    self.find_free_slot(self.last_handle).ok_or(Error::Memory)?
                }
            }
        };

        let entry = &mut self.entries[handle];
        debug_assert!(!entry.is_occupied());
        *entry = ObjectInfo::cleared();
        entry.object_type = object_type;
        entry.subtype = subtype;
        entry.body = Some(body);
        entry.owner = owner;
        entry.action_perms = action_perms;
        entry.unique_id = self.next_unique_id;
        self.next_unique_id += 1;

        if handle == DEFAULT_USER_HANDLE as usize {
            // The last system object has been created; from here on,
            // allocation starts from a randomised table position.
            let seed = std::time::UNIX_EPOCH
                .elapsed()
                .map(|d| d.subsec_nanos() as usize)
                .unwrap_or(0);
            self.last_handle = seed & (self.lfsr_mask - 1);
            if self.last_handle < FIRST_DYNAMIC_HANDLE as usize {
                self.last_handle = FIRST_DYNAMIC_HANDLE as usize + 42;
            }
        } else {
            self.last_handle = handle;
        }

        Ok(handle as Handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kernel;
    use crate::message::{MessageData, MessageType};

    struct NullBody;

    impl KernelObject for NullBody {
        fn handle_message(
            &mut self,
            _kernel: &Kernel,
            _msg: MessageType,
            _data: &mut MessageData,
            _value: i32,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn table_with_system_objects() -> ObjectTable {
        let mut table = ObjectTable::new();
        let system = table
            .create_object(
                ObjectType::Device,
                Subtype::A(SubtypeA::DEV_SYSTEM),
                CreateFlags::empty(),
                None,
                ActionPerms::NONE,
                Box::new(NullBody),
            )
            .unwrap();
        assert_eq!(system, SYSTEM_OBJECT_HANDLE);
        let user = table
            .create_object(
                ObjectType::User,
                Subtype::B(SubtypeB::USER_DEFAULT),
                CreateFlags::empty(),
                Some(SYSTEM_OBJECT_HANDLE),
                ActionPerms::NONE,
                Box::new(NullBody),
            )
            .unwrap();
        assert_eq!(user, DEFAULT_USER_HANDLE);
        table
    }

    fn create_context(table: &mut ObjectTable) -> Handle {
        table
            .create_object(
                ObjectType::Context,
                Subtype::A(SubtypeA::CTX_CONV),
                CreateFlags::empty(),
                Some(DEFAULT_USER_HANDLE),
                ActionPerms::NONE,
                Box::new(NullBody),
            )
            .unwrap()
    }

    #[test]
    fn system_objects_get_fixed_handles() {
        let table = table_with_system_objects();
        assert!(table.is_valid_object(SYSTEM_OBJECT_HANDLE));
        assert!(table.is_valid_object(DEFAULT_USER_HANDLE));
        assert!(!table.is_valid_object(0));
    }

    #[test]
    fn unique_ids_strictly_increase() {
        let mut table = table_with_system_objects();
        let mut last = table.info(DEFAULT_USER_HANDLE).unique_id;
        for _ in 0..64 {
            let handle = create_context(&mut table);
            let id = table.info(handle).unique_id;
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn freed_handle_is_not_immediately_reissued() {
        let mut table = table_with_system_objects();
        let first = create_context(&mut table);
        table.clear_entry(first);
        let second = create_context(&mut table);
        // The LFSR walk moves on before it revisits the freed slot.
        assert_ne!(first, second);
    }

    #[test]
    fn lfsr_visits_every_slot_once_per_period() {
        let table = ObjectTable::new();
        let mut seen = vec![false; TABLE_ALLOC_SIZE];
        let mut value = FIRST_DYNAMIC_HANDLE as usize;
        for _ in 0..TABLE_ALLOC_SIZE - 1 {
            assert!(!seen[value], "slot {value} visited twice");
            seen[value] = true;
            value = table.lfsr_step(value);
        }
        // Full period: every slot except the zero slot was visited.
        assert!(!seen[0]);
        assert_eq!(seen.iter().filter(|&&v| v).count(), TABLE_ALLOC_SIZE - 1);
    }

    #[test]
    fn table_expands_when_full() {
        let mut table = table_with_system_objects();
        for _ in 0..TABLE_ALLOC_SIZE + 8 {
            create_context(&mut table);
        }
        assert_eq!(table.size(), TABLE_ALLOC_SIZE * 2);
        assert_eq!(table.lfsr_mask, TABLE_ALLOC_SIZE * 2);
        assert_eq!(table.lfsr_poly, 0x805);
    }

    #[test]
    fn dynamic_creation_requires_a_valid_owner() {
        let mut table = table_with_system_objects();
        let status = table.create_object(
            ObjectType::Context,
            Subtype::A(SubtypeA::CTX_CONV),
            CreateFlags::empty(),
            None,
            ActionPerms::NONE,
            Box::new(NullBody),
        );
        assert_eq!(status.unwrap_err(), Error::ArgObject);
    }

    #[test]
    fn dependency_depth_follows_dependent_objects() {
        let mut table = table_with_system_objects();
        let leaf = create_context(&mut table);
        let mid = create_context(&mut table);
        let top = create_context(&mut table);
        assert_eq!(table.dependency_depth(leaf), 1);
        table.info_mut(mid).dependent_object = Some(leaf);
        assert_eq!(table.dependency_depth(mid), 2);
        table.info_mut(top).dependent_object = Some(mid);
        assert_eq!(table.dependency_depth(top), 3);
        table.info_mut(leaf).dependent_device = Some(SYSTEM_OBJECT_HANDLE);
        assert_eq!(table.dependency_depth(leaf), 2);
        assert_eq!(table.dependency_depth(mid), 3);
    }

    #[test]
    fn same_owner_matches_owner_and_system_objects() {
        let mut table = table_with_system_objects();
        let a = create_context(&mut table);
        let b = create_context(&mut table);
        assert!(table.same_owner(a, b));
        // A user object is the same-owner peer of everything it owns.
        assert!(table.same_owner(DEFAULT_USER_HANDLE, a));
        // System objects (no owner) match anything.
        assert!(table.same_owner(SYSTEM_OBJECT_HANDLE, a));
    }
}

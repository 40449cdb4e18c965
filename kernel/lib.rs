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

//! The security kernel: the object-and-message dispatcher that mediates
//! every operation performed on every cryptographic resource.
//!
//! External callers hold handles; every operation is a message sent
//! through [`Kernel::send`], the single entry point and single error
//! channel.  The kernel resolves the handle, routes the message along
//! the dependency chain, runs the pre-dispatch checks selected by the
//! message type against the attribute, mechanism and key-management
//! ACLs, forwards the call to the object's own handler with the object
//! table unlocked, and runs the post-dispatch checks.
//!
//! At the base sit two process-wide system objects with fixed handles: a
//! root system device and a default user that owns every object not
//! explicitly claimed by another user.

pub mod attribute;
pub mod message;
pub mod object;
pub mod keymgmt;
pub mod mechanism;
pub mod sync;

pub(crate) mod cow;
pub(crate) mod dispatch;
mod extract;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use secure_heap::SecureHeap;
use status::{Error, Result};

pub use extract::ClaimedObject;
pub use message::{
    CertFormat, CheckType, CompareType, CreateArgs, KeyDeriveArgs, KeyIdKind, KeyMgmtArgs,
    KeyMgmtFlags, KeySignArgs, KeyWrapArgs, MessageData, MessageType, SETDEP_INCREF,
    SETDEP_NO_INCREF, USE_DEFAULT_ALGO,
};
pub use attribute::{Attribute, MIN_TIME_VALUE, STATUS_BUSY, STATUS_OK, VALUE_UNUSED, algo};
pub use keymgmt::ItemType;
pub use mechanism::Mechanism;
pub use object::{
    Action, ActionPerm, ActionPerms, ContextContents, CreateFlags, DEFAULT_USER_HANDLE,
    FIRST_DYNAMIC_HANDLE, Handle, KernelObject, KeyFormat, ObjectType, SYSTEM_OBJECT_HANDLE,
    Subtype, SubtypeA, SubtypeB,
};
pub use sync::{MutexId, OsEvent, SemaphoreId};

use message::Msg;
use object::table::ObjectTable;
use sync::mutex::MutexTable;
use sync::semaphore::SemaphoreTable;

/// The kernel value: the object table and its lock, the semaphore and
/// mutex tables, the secure heap, and the process-wide initialisation
/// flag pair.  The boot path creates one and threads it through every
/// API entry.
pub struct Kernel {
    table: Mutex<ObjectTable>,
    semaphores: SemaphoreTable,
    mutexes: MutexTable,
    heap: SecureHeap,
    is_initialised: AtomicBool,
    is_closing_down: AtomicBool,
    /// Serialises initialisation and shutdown; exactly one may be in
    /// progress at any time.
    init_lock: Mutex<()>,
}

impl Kernel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(ObjectTable::new()),
            semaphores: SemaphoreTable::new(),
            mutexes: MutexTable::new(),
            heap: SecureHeap::new(),
            is_initialised: AtomicBool::new(false),
            is_closing_down: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, ObjectTable> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn is_closing_down(&self) -> bool {
        self.is_closing_down.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_initialised(&self) -> bool {
        self.is_initialised.load(Ordering::Acquire)
    }

    /// Boots the kernel: consistency-checks the compile-time tables,
    /// then creates and completes the two system objects.
    pub fn init(&self) -> Result<()> {
        let _guard = self
            .init_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.is_initialised() {
            return Err(Error::AlreadyInited);
        }
        consistency_check();

        // Everything in the library depends on the creation of objects,
        // so any attempt to use it before this point fails at the object
        // table.
        self.is_initialised.store(true, Ordering::Release);
        let status = self.create_system_objects();
        if status.is_err() {
            let _ = self.destroy_objects();
            *self.lock_table() = ObjectTable::new();
            self.is_initialised.store(false, Ordering::Release);
            self.is_closing_down.store(false, Ordering::Release);
        }
        status
    }

    fn create_system_objects(&self) -> Result<()> {
        let system = self.create_object(
            ObjectType::Device,
            Subtype::A(SubtypeA::DEV_SYSTEM),
            CreateFlags::empty(),
            None,
            ActionPerms::NONE,
            Box::new(SystemDevice::new()),
        )?;
        debug_assert_eq!(system, SYSTEM_OBJECT_HANDLE);
        let mut status = MessageData::Value(STATUS_OK);
        self.send_internal(
            system,
            MessageType::SetAttribute,
            &mut status,
            Attribute::IntStatus as i32,
        )?;

        let user = self.create_object(
            ObjectType::User,
            Subtype::B(SubtypeB::USER_DEFAULT),
            CreateFlags::empty(),
            Some(SYSTEM_OBJECT_HANDLE),
            ActionPerms::NONE,
            Box::new(DefaultUser::new()),
        )?;
        debug_assert_eq!(user, DEFAULT_USER_HANDLE);
        let mut status = MessageData::Value(STATUS_OK);
        self.send_internal(
            user,
            MessageType::SetAttribute,
            &mut status,
            Attribute::IntStatus as i32,
        )
    }

    /// Shuts the kernel down: all further messages except destruction
    /// are rejected, remaining objects are destroyed in dependency-depth
    /// waves, and the system objects are torn down last.  Reports
    /// `incomplete` when unclaimed objects had to be cleaned up.
    pub fn shutdown(&self) -> Result<()> {
        let _guard = self
            .init_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !self.is_initialised() {
            return Err(Error::NotInited);
        }
        let status = self.destroy_objects();
        *self.lock_table() = ObjectTable::new();
        self.is_initialised.store(false, Ordering::Release);
        self.is_closing_down.store(false, Ordering::Release);
        status
    }

    /// Destroys every object in the table.  Unclaimed leftover objects
    /// have dependents underneath them, so destruction works in order of
    /// dependency depth, first three-level objects (e.g. cert ->
    /// context -> device), then two-level, then one-level, so that no
    /// object is ever deleted out from under a dependent.  The system
    /// objects are destroyed by direct handler invocation since the
    /// dispatcher refuses explicit destroys of them.
    fn destroy_objects(&self) -> Result<()> {
        // From here on the kernel rejects everything except destruction;
        // set before taking the table lock so that anything holding it
        // exits quickly.
        self.is_closing_down.store(true, Ordering::Release);

        let mut leftovers = false;
        let mut table = self.lock_table();

        // The non-root system objects go first: leftover objects may
        // depend on them, and destroying them later would misreport them
        // as leftovers.
        for handle in (SYSTEM_OBJECT_HANDLE + 1)..FIRST_DYNAMIC_HANDLE {
            if table.is_valid_object(handle) {
                let mut none = MessageData::None;
                if let Some(body) = table.info_mut(handle).body.as_mut() {
                    let _ = body.handle_message(self, MessageType::Destroy, &mut none, 0);
                }
                table.clear_entry(handle);
            }
        }

        for depth in (1..=3).rev() {
            let mut handle = FIRST_DYNAMIC_HANDLE;
            while (handle as usize) < table.size() {
                if table.is_valid_object(handle) && table.dependency_depth(handle) >= depth {
                    leftovers = true;
                    // Unlock around the destroy so remaining active
                    // objects can't block the shutdown; the closing-down
                    // flag gates everything else that might arrive.
                    drop(table);
                    let mut none = MessageData::None;
                    let _ = self.send_internal(handle, MessageType::Destroy, &mut none, 0);
                    table = self.lock_table();
                }
                handle += 1;
            }
        }

        // Finally, the root system object.
        if table.is_valid_object(SYSTEM_OBJECT_HANDLE) {
            let mut none = MessageData::None;
            if let Some(body) = table.info_mut(SYSTEM_OBJECT_HANDLE).body.as_mut() {
                let _ = body.handle_message(self, MessageType::Destroy, &mut none, 0);
            }
            table.clear_entry(SYSTEM_OBJECT_HANDLE);
        }
        drop(table);

        if leftovers { Err(Error::Incomplete) } else { Ok(()) }
    }

    /// The single entry point for external callers: sends a message to
    /// an object and returns its status.
    pub fn send(
        &self,
        handle: Handle,
        msg: MessageType,
        data: &mut MessageData,
        value: i32,
    ) -> Result<()> {
        dispatch::send_message(
            self,
            handle,
            Msg {
                kind: msg,
                internal: false,
            },
            data,
            value,
        )
    }

    /// Sends a message originating inside the library; internal messages
    /// can reach internal objects and the internal attribute range.
    pub fn send_internal(
        &self,
        handle: Handle,
        msg: MessageType,
        data: &mut MessageData,
        value: i32,
    ) -> Result<()> {
        dispatch::send_message(
            self,
            handle,
            Msg {
                kind: msg,
                internal: true,
            },
            data,
            value,
        )
    }

    /// Creates a new object, atomically installing a not-inited
    /// descriptor.  The handle is internal-only until the object is
    /// explicitly externalised, and the object accepts nothing but a
    /// destroy and the init-completion message until the creator sends
    /// the latter.
    pub fn create_object(
        &self,
        object_type: ObjectType,
        subtype: Subtype,
        flags: CreateFlags,
        owner: Option<Handle>,
        action_perms: ActionPerms,
        body: Box<dyn KernelObject>,
    ) -> Result<Handle> {
        // No new objects once a shutdown has started.
        if self.is_closing_down() {
            return Err(Error::PermissionDenied);
        }
        if !self.is_initialised() {
            return Err(Error::NotInited);
        }
        self.lock_table()
            .create_object(object_type, subtype, flags, owner, action_perms, body)
    }

    /// The secure allocator; object bodies keep key material in it.
    #[must_use]
    pub fn secure_heap(&self) -> &SecureHeap {
        &self.heap
    }

    /// Sets a one-shot semaphore, handing it the event waiters block on.
    pub fn set_semaphore(&self, id: SemaphoreId, event: std::sync::Arc<OsEvent>) {
        self.semaphores.set(id, event);
    }

    /// Clears a one-shot semaphore; the last waiter out releases the
    /// underlying event.
    pub fn clear_semaphore(&self, id: SemaphoreId) {
        self.semaphores.clear(id);
    }

    /// Waits on a semaphore; returns immediately if it was never set or
    /// has been cleared.
    pub fn wait_semaphore(&self, id: SemaphoreId) {
        self.semaphores.wait(id);
    }

    pub fn enter_mutex(&self, id: MutexId) {
        self.mutexes.enter(id);
    }

    pub fn exit_mutex(&self, id: MutexId) {
        self.mutexes.exit(id);
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Boot-time consistency check over the compile-time tables; all
/// assertions compile out of release builds.
fn consistency_check() {
    debug_assert_eq!(SYSTEM_OBJECT_HANDLE + 1, DEFAULT_USER_HANDLE);
    debug_assert_eq!(DEFAULT_USER_HANDLE + 1, FIRST_DYNAMIC_HANDLE);
    dispatch::check_handling_table();
    #[cfg(debug_assertions)]
    {
        for id in 0..2048 {
            if let Some(acl) = attribute::find_attribute_acl(id, true) {
                debug_assert_eq!(acl.attribute as i32, id);
            }
        }
    }
}

/// The root system device.  Owns the entropy pool fed through the
/// internal entropy attributes; everything else it might do (querying
/// algorithm capabilities, acting as the default object factory) lives
/// behind the device message set.
struct SystemDevice {
    entropy_bytes: usize,
    entropy_quality: i32,
}

impl SystemDevice {
    fn new() -> Self {
        Self {
            entropy_bytes: 0,
            entropy_quality: 0,
        }
    }
}

impl KernelObject for SystemDevice {
    fn handle_message(
        &mut self,
        _kernel: &Kernel,
        msg: MessageType,
        data: &mut MessageData,
        value: i32,
    ) -> Result<()> {
        match msg {
            MessageType::Destroy => {
                self.entropy_bytes = 0;
                self.entropy_quality = 0;
                Ok(())
            }
            MessageType::SetAttributeData if value == Attribute::IntEntropy as i32 => {
                let MessageData::Bytes(bytes) = data else {
                    return Err(Error::ArgStr1);
                };
                self.entropy_bytes += bytes.len();
                Ok(())
            }
            MessageType::SetAttribute if value == Attribute::IntEntropyQuality as i32 => {
                let MessageData::Value(quality) = data else {
                    return Err(Error::ArgNum1);
                };
                self.entropy_quality = *quality as i32;
                Ok(())
            }
            MessageType::ChangeNotify => Ok(()),
            _ => Err(Error::NotAvail),
        }
    }
}

/// The default user: owner of every object not claimed by another user,
/// and keeper of the process-wide configuration options.
struct DefaultUser {
    compliance_level: i64,
    side_channel_protection: bool,
    keying_iterations: i64,
    encr_algo: i64,
    hash_algo: i64,
}

impl DefaultUser {
    fn new() -> Self {
        Self {
            compliance_level: 1,
            side_channel_protection: false,
            keying_iterations: 500,
            encr_algo: algo::AES,
            hash_algo: algo::SHA1,
        }
    }
}

impl KernelObject for DefaultUser {
    fn handle_message(
        &mut self,
        _kernel: &Kernel,
        msg: MessageType,
        data: &mut MessageData,
        value: i32,
    ) -> Result<()> {
        match msg {
            MessageType::Destroy | MessageType::ChangeNotify => Ok(()),
            MessageType::GetAttribute => {
                let result = match value {
                    v if v == Attribute::OptionComplianceLevel as i32 => self.compliance_level,
                    v if v == Attribute::OptionSideChannelProtection as i32 => {
                        i64::from(self.side_channel_protection)
                    }
                    v if v == Attribute::OptionKeyingIterations as i32 => self.keying_iterations,
                    v if v == Attribute::OptionEncrAlgo as i32 => self.encr_algo,
                    v if v == Attribute::OptionHashAlgo as i32 => self.hash_algo,
                    _ => return Err(Error::NotAvail),
                };
                *data = MessageData::Value(result);
                Ok(())
            }
            MessageType::SetAttribute => {
                let MessageData::Value(new_value) = data else {
                    return Err(Error::ArgNum1);
                };
                match value {
                    v if v == Attribute::OptionComplianceLevel as i32 => {
                        self.compliance_level = *new_value;
                    }
                    v if v == Attribute::OptionSideChannelProtection as i32 => {
                        self.side_channel_protection = *new_value != 0;
                    }
                    v if v == Attribute::OptionKeyingIterations as i32 => {
                        self.keying_iterations = *new_value;
                    }
                    v if v == Attribute::OptionEncrAlgo as i32 => {
                        self.encr_algo = *new_value;
                    }
                    v if v == Attribute::OptionHashAlgo as i32 => {
                        self.hash_algo = *new_value;
                    }
                    _ => return Err(Error::NotAvail),
                }
                Ok(())
            }
            MessageType::SetAttributeData if value == Attribute::UserPassword as i32 => Ok(()),
            _ => Err(Error::NotAvail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_creates_the_system_objects() {
        let kernel = Kernel::new();
        kernel.init().unwrap();
        // The configuration surface answers through the default user.
        let mut data = MessageData::Value(0);
        kernel
            .send_internal(
                DEFAULT_USER_HANDLE,
                MessageType::GetAttribute,
                &mut data,
                Attribute::OptionComplianceLevel as i32,
            )
            .unwrap();
        assert_eq!(data.value(), Some(1));
        kernel.shutdown().unwrap();
    }

    #[test]
    fn double_init_is_rejected() {
        let kernel = Kernel::new();
        kernel.init().unwrap();
        assert_eq!(kernel.init(), Err(Error::AlreadyInited));
        kernel.shutdown().unwrap();
        assert_eq!(kernel.shutdown(), Err(Error::NotInited));
    }

    #[test]
    fn no_objects_before_init() {
        let kernel = Kernel::new();
        let status = kernel.create_object(
            ObjectType::Context,
            Subtype::A(SubtypeA::CTX_HASH),
            CreateFlags::empty(),
            Some(DEFAULT_USER_HANDLE),
            ActionPerms::NONE,
            Box::new(SystemDevice::new()),
        );
        assert_eq!(status.unwrap_err(), Error::NotInited);
    }

    #[test]
    fn options_route_to_the_owning_user() {
        let kernel = Kernel::new();
        kernel.init().unwrap();
        let mut data = MessageData::Value(3);
        kernel
            .send_internal(
                DEFAULT_USER_HANDLE,
                MessageType::SetAttribute,
                &mut data,
                Attribute::OptionComplianceLevel as i32,
            )
            .unwrap();
        let mut readback = MessageData::Value(0);
        kernel
            .send_internal(
                DEFAULT_USER_HANDLE,
                MessageType::GetAttribute,
                &mut readback,
                Attribute::OptionComplianceLevel as i32,
            )
            .unwrap();
        assert_eq!(readback.value(), Some(3));
        // Out-of-range compliance levels never reach the user object.
        let mut bad = MessageData::Value(9);
        assert_eq!(
            kernel.send_internal(
                DEFAULT_USER_HANDLE,
                MessageType::SetAttribute,
                &mut bad,
                Attribute::OptionComplianceLevel as i32,
            ),
            Err(Error::ArgNum1)
        );
        kernel.shutdown().unwrap();
    }
}

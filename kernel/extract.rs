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

//! Alternative object acquisition and the key-extract trust hooks.
//!
//! Sending a message makes exactly one object available for use.  The
//! handful of operations that need simultaneous access to two objects
//! (copying certificate state, device-resident context operations, user
//! configuration updates) acquire the second object directly through
//! [`Kernel::get_object`], which reproduces the dispatch path's checks
//! and busy-wait protocol and hands back a guard.
//!
//! The second form of direct access is the trusted-downgrader set: the
//! four routines that legitimately bypass the action-permission checks
//! because they *define* trust: extracting a session key, exporting and
//! importing private-key material, and the internal context clone.
//! These are the only routes by which raw key material leaves a context.
//!
//! [`Kernel::get_object`]: crate::Kernel::get_object

use status::{Error, Result};

use crate::Kernel;
use crate::attribute::{Attribute, VALUE_UNUSED};
use crate::dispatch::{TableRef, wait_for_object};
use crate::message::MessageData;
use crate::object::{
    Action, ActionPerm, ActionPerms, Handle, KernelObject, KeyFormat, ObjectType,
    SYSTEM_OBJECT_HANDLE,
};

/// What kind of acquisition produced a [`ClaimedObject`]; release
/// re-checks the type set it came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ClaimKind {
    /// Public two-object access: certificate, device or user.
    External,
    /// Kernel-internal context access for the key-extract hooks.
    Context,
}

/// Guard over a directly-acquired object.  The object stays marked busy
/// (and so unreachable by other threads' messages) until the guard is
/// dropped.
pub struct ClaimedObject<'k> {
    kernel: &'k Kernel,
    handle: Handle,
    body: *mut dyn KernelObject,
    kind: ClaimKind,
}

impl ClaimedObject<'_> {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn body(&mut self) -> &mut dyn KernelObject {
        // SAFETY: the claim holds the object's busy lock on this thread,
        // so nothing else can reach the body, and the body's heap
        // allocation is stable while the descriptor exists.
        unsafe { &mut *self.body }
    }
}

impl Drop for ClaimedObject<'_> {
    fn drop(&mut self) {
        let released = {
            let mut table = self.kernel.lock_table();
            if !table.is_valid_object(self.handle) {
                debug_assert!(false, "claimed object vanished");
                return;
            }
            let expected = match self.kind {
                ClaimKind::External => [
                    ObjectType::Certificate,
                    ObjectType::Device,
                    ObjectType::User,
                ]
                .contains(&table.info(self.handle).object_type),
                ClaimKind::Context => {
                    table.info(self.handle).object_type == ObjectType::Context
                }
            };
            let info = table.info_mut(self.handle);
            // Releasing an object we don't hold or of the wrong type is
            // a kernel bug, not a caller error.
            debug_assert!(expected);
            debug_assert!(info.lock_count > 0 && info.is_owned_by_current_thread());
            if expected && info.lock_count > 0 && info.is_owned_by_current_thread() {
                info.lock_count -= 1;
            }
            info.lock_count == 0
        };
        // Leaving the lock frame: run any messages that were deferred
        // onto the queue while the claim was held.
        if released {
            let mut tr = TableRef::new(self.kernel);
            let _ = crate::dispatch::drain_queue(&mut tr, self.handle, None);
        }
    }
}

/// Shared acquisition path: validity and ownership checks matching the
/// dispatcher's, a busy-wait if another thread holds the object, then
/// the busy marking.
fn acquire<'k>(
    kernel: &'k Kernel,
    handle: Handle,
    kind: ClaimKind,
    error: Error,
) -> Result<ClaimedObject<'k>> {
    let mut tr = TableRef::new(kernel);
    {
        let table = tr.table();
        if !table.is_valid_object(handle) || !table.info(handle).thread_access_ok() {
            return Err(error);
        }
        let object_type = table.info(handle).object_type;
        let type_ok = match kind {
            ClaimKind::External => {
                handle != SYSTEM_OBJECT_HANDLE
                    && matches!(
                        object_type,
                        ObjectType::Certificate | ObjectType::Device | ObjectType::User
                    )
            }
            ClaimKind::Context => object_type == ObjectType::Context,
        };
        if !type_ok {
            return Err(error);
        }
    }

    if tr.table().info(handle).is_in_use()
        && !tr.table().info(handle).is_owned_by_current_thread()
    {
        wait_for_object(&mut tr, handle)?;
    }

    let table = tr.table();
    let info = table.info_mut(handle);
    info.lock_count += 1;
    info.lock_owner = Some(std::thread::current().id());
    let body = match info.body.as_mut() {
        Some(body) => &mut **body as *mut dyn KernelObject,
        None => {
            info.lock_count -= 1;
            return Err(Error::Signalled);
        }
    };
    Ok(ClaimedObject {
        kernel,
        handle,
        body,
        kind,
    })
}

impl Kernel {
    /// Directly acquires an object for two-object operations.  Available
    /// for certificates (copying internal state between cert objects),
    /// crypto devices other than the system object (device-resident
    /// context operations), and user objects (committing configuration
    /// updates); everything else fails with the supplied error.
    pub fn get_object(
        &self,
        handle: Handle,
        object_type: ObjectType,
    ) -> Result<ClaimedObject<'_>> {
        if !matches!(
            object_type,
            ObjectType::Certificate | ObjectType::Device | ObjectType::User
        ) {
            return Err(Error::ArgValue);
        }
        {
            let table = self.lock_table();
            if !table.is_valid_object(handle)
                || table.info(handle).object_type != object_type
            {
                return Err(Error::ArgObject);
            }
        }
        acquire(self, handle, ClaimKind::External, Error::ArgObject)
    }

    /// Relinquishes ownership of the system object to another thread, so
    /// a background polling thread can feed entropy to the system device
    /// while the caller suspends itself.
    pub fn release_system_object(&self, new_owner: std::thread::ThreadId) -> Result<()> {
        let mut table = self.lock_table();
        let info = table.info_mut(SYSTEM_OBJECT_HANDLE);
        debug_assert!(info.is_in_use() && info.is_owned_by_current_thread());
        if !info.is_in_use() {
            return Err(Error::PermissionDenied);
        }
        info.lock_owner = Some(new_owner);
        Ok(())
    }

    /// Reacquires the system object after [`release_system_object`].
    ///
    /// [`release_system_object`]: Kernel::release_system_object
    pub fn reacquire_system_object(&self) -> Result<()> {
        let mut table = self.lock_table();
        let info = table.info_mut(SYSTEM_OBJECT_HANDLE);
        debug_assert!(info.is_in_use());
        if !info.is_in_use() {
            return Err(Error::PermissionDenied);
        }
        info.lock_owner = Some(std::thread::current().id());
        Ok(())
    }

    /// Extracts the loaded session key from a conventional or MAC
    /// context, ahead of wrapping with a KEK.  Returns the key length.
    pub fn extract_key_data(&self, context: Handle, out: &mut [u8]) -> Result<usize> {
        let mut claim = acquire(self, context, ClaimKind::Context, Error::ArgObject)?;
        let ctx = claim.body().as_context().ok_or(Error::ArgObject)?;
        ctx.extract_key(out)
    }

    /// Serialises private-key data from a context (or from whatever has
    /// a context attached) ahead of encryption with a KEK.
    pub fn export_private_key_data(&self, handle: Handle, format: KeyFormat) -> Result<Vec<u8>> {
        // The caller may have passed something else with a context
        // attached; find the context itself.
        let mut data = MessageData::Value(0);
        self.send_internal(
            handle,
            crate::message::MessageType::GetDependent,
            &mut data,
            ObjectType::Context as i32,
        )?;
        let context = data
            .value()
            .and_then(|v| Handle::try_from(v).ok())
            .ok_or(Error::ArgObject)?;

        let mut claim = acquire(self, context, ClaimKind::Context, Error::ArgObject)?;
        let ctx = claim.body().as_context().ok_or(Error::ArgObject)?;
        let mut out = Vec::new();
        ctx.write_private_key(format, &mut out)?;
        Ok(out)
    }

    /// Loads private-key data into a context after decryption with a
    /// KEK, completing the import with an internal key load and the
    /// initialised transition.
    pub fn import_private_key_data(
        &self,
        context: Handle,
        format: KeyFormat,
        data: &[u8],
    ) -> Result<()> {
        let status = {
            let mut claim = acquire(self, context, ClaimKind::Context, Error::ArgObject)?;
            let ctx = claim.body().as_context().ok_or(Error::ArgObject)?;
            ctx.read_private_key(format, data).and_then(|()| {
                ctx.load_key().map_err(|e| {
                    // Key-load argument errors mean the decrypted data
                    // was garbage.
                    if e.is_arg_error() { Error::BadData } else { e }
                })
            })
        };
        status?;
        let mut value = MessageData::Value(VALUE_UNUSED);
        self.send_internal(
            context,
            crate::message::MessageType::SetAttribute,
            &mut value,
            Attribute::IntInitialised as i32,
        )
    }
}

/// Copies the contents of one context into another; the internal half of
/// copy-on-write cloning.  The destination ends up restricted to
/// internal-only encrypt/decrypt/hash use: there's already a key loaded,
/// so keygen is disabled entirely, and signing isn't possible with a
/// non-PKC object anyway.
pub(crate) fn clone_context(kernel: &Kernel, dest: Handle, source: Handle) -> Result<()> {
    debug_assert_ne!(dest, source);

    let mut source_claim = acquire(kernel, source, ClaimKind::Context, Error::ArgObject)?;
    let mut dest_claim = acquire(kernel, dest, ClaimKind::Context, Error::ArgObject)?;

    {
        let dest_ctx = dest_claim.body().as_context().ok_or(Error::ArgObject)?;
        let source_ctx = source_claim.body().as_context().ok_or(Error::ArgObject)?;
        dest_ctx.copy_state_from(source_ctx)?;
    }
    drop(dest_claim);
    drop(source_claim);

    let perms = ActionPerms::NONE
        .with(Action::Encrypt, ActionPerm::InternalOnly)
        .with(Action::Decrypt, ActionPerm::InternalOnly)
        .with(Action::Hash, ActionPerm::InternalOnly);
    let mut data = MessageData::Value(perms.raw());
    kernel.send_internal(
        dest,
        crate::message::MessageType::SetAttribute,
        &mut data,
        Attribute::IntActionPerms as i32,
    )
}

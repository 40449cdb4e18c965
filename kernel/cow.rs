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

//! Copy-on-write cloning of stateful contexts.
//!
//! A clone message doesn't copy anything: it marks source and
//! destination as aliases of each other and returns.  The copy is
//! deferred until a message arrives that could modify either side's
//! state, at which point the resolver performs a shallow state copy into
//! the clone and severs the link, so the aliasing is never observable
//! externally.  A destroy on an aliased pair always destroys the clone,
//! even when the caller named the original, by swapping the two
//! descriptors so the caller's handle names the survivor.

use status::{Error, Result};

use crate::dispatch::TableRef;
use crate::extract::clone_context;
use crate::message::{MessageData, MessageType};
use crate::object::{
    FIRST_DYNAMIC_HANDLE, Handle, ObjectFlags, ObjectType, SYSTEM_OBJECT_HANDLE,
};

/// Kernel handler for the clone message.  Validates the pair, propagates
/// the source's action permissions to the clone reduced to
/// internal-only, and links the two as aliases; the actual state copy is
/// deferred to the resolver.
pub(crate) fn clone_object(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let clone = Handle::try_from(value).map_err(|_| Error::ArgValue)?;

    // A second clone of an already-aliased original forces the pending
    // copy through first, keeping the alias relation at most pairwise.
    if tr.table().info(handle).flags.contains(ObjectFlags::ALIASED) {
        handle_aliased_object(tr, handle, MessageType::Clone)?;
    }
    let table = tr.table();

    if !table.is_valid_object(clone)
        || clone < FIRST_DYNAMIC_HANDLE
        || handle < FIRST_DYNAMIC_HANDLE
        || handle == clone
    {
        return Err(Error::ArgValue);
    }
    let info = table.info(handle);
    let clone_info = table.info(clone);
    if info.object_type != ObjectType::Context
        || clone_info.object_type != ObjectType::Context
        || info.flags.intersects(ObjectFlags::ALIASED | ObjectFlags::CLONE)
        || clone_info.flags.intersects(ObjectFlags::ALIASED | ObjectFlags::CLONE)
    {
        return Err(Error::ArgValue);
    }

    // The original must hold state worth cloning.
    if !info.is_in_high_state() {
        return Err(Error::NotInited);
    }

    // A device-resident context usually can't be cloned, so requests to
    // clone one degrade to taking another reference.  Native contexts
    // are always created for clonable algorithms, so this only matters
    // when the user explicitly forces a device context into multiple
    // envelopes.
    if info
        .dependent_device
        .is_some_and(|device| device != SYSTEM_OBJECT_HANDLE)
    {
        table.info_mut(handle).ref_count += 1;
        return Ok(());
    }

    // The clone can only ever be used internally.
    let capped = info.action_perms.capped_at_internal();
    let clone_info = table.info_mut(clone);
    clone_info.action_perms = clone_info.action_perms.tightened(capped);

    table.info_mut(handle).flags |= ObjectFlags::ALIASED;
    table.info_mut(handle).clone_peer = Some(clone);
    let clone_info = table.info_mut(clone);
    clone_info.flags |= ObjectFlags::ALIASED | ObjectFlags::CLONE;
    clone_info.clone_peer = Some(handle);

    Ok(())
}

/// Whether a message could modify an aliased context's state and so must
/// force the pending copy first.
fn modifies_state(msg: MessageType) -> bool {
    msg.is_action_message()
        || matches!(
            msg,
            MessageType::SetAttribute
                | MessageType::SetAttributeData
                | MessageType::DeleteAttribute
                | MessageType::CtxGenIv
                | MessageType::Clone
        )
}

/// The copy-on-write resolver, run on any message to an aliased object
/// before pre-dispatch.
pub(crate) fn handle_aliased_object(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: MessageType,
) -> Result<()> {
    let table = tr.table();
    let peer = table.info(handle).clone_peer.ok_or(Error::Invalid)?;
    debug_assert!(table.is_valid_object(peer));
    debug_assert!(table.info(peer).flags.contains(ObjectFlags::ALIASED));

    // A destroy takes out the (incomplete) clone rather than the
    // original.
    if msg == MessageType::Destroy {
        if table.info(handle).flags.contains(ObjectFlags::CLONE) {
            // The caller named the clone; unlink the original so it
            // doesn't keep an alias link to a vanishing slot.
            let original = table.info_mut(peer);
            original.flags &= !ObjectFlags::ALIASED;
            original.clone_peer = None;
            let doomed = table.info_mut(handle);
            doomed.flags &= !(ObjectFlags::ALIASED | ObjectFlags::CLONE);
            doomed.clone_peer = None;
            return Ok(());
        }

        // The caller named the original: swap it with the clone so the
        // caller's handle names the survivor and the destroy falls on
        // the clone.
        table.swap_entries(handle, peer);

        let original = table.info_mut(peer);
        original.flags &= !ObjectFlags::ALIASED;
        original.clone_peer = None;
        let doomed = table.info_mut(handle);
        doomed.flags &= !(ObjectFlags::ALIASED | ObjectFlags::CLONE);
        doomed.clone_peer = None;
        return Ok(());
    }

    if !modifies_state(msg) {
        return Ok(());
    }

    // Sort out which is the original and which the clone; the message
    // may have arrived at either.
    let (original, clone) = if table.info(handle).flags.contains(ObjectFlags::CLONE) {
        (peer, handle)
    } else {
        (handle, peer)
    };

    // We're about to modify one of the two aliased objects: create
    // distinct objects to enforce the copy-on-write semantics.  A second
    // clone of an already-aliased original is resolved the same way,
    // keeping the alias relation at most pairwise.
    //
    // Both objects are pinned with their busy locks across the copy so
    // that another thread can't slip a message into the half-split pair
    // while the table is unlocked.
    for object in [original, clone] {
        let info = table.info_mut(object);
        info.lock_count += 1;
        info.lock_owner = Some(std::thread::current().id());
    }
    let status = tr.unlocked(|kernel| clone_context(kernel, clone, original));
    let table = tr.table();
    for object in [original, clone] {
        let info = table.info_mut(object);
        debug_assert!(info.lock_count > 0);
        info.lock_count = info.lock_count.saturating_sub(1);
    }
    status?;

    let info = table.info_mut(original);
    info.flags &= !ObjectFlags::ALIASED;
    info.clone_peer = None;
    let clone_info = table.info_mut(clone);
    clone_info.flags &= !(ObjectFlags::ALIASED | ObjectFlags::CLONE);
    clone_info.flags |= ObjectFlags::HIGH;
    clone_info.clone_peer = None;

    Ok(())
}

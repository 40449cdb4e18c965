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

//! The message dispatcher: the single choke point through which every
//! operation on every object flows.
//!
//! A compile-time table describes each message type: how it routes, which
//! object subtypes accept it, the shape of its parameters, the
//! pre-dispatch and post-dispatch checks bracketing the object's own
//! handler, and for kernel-handled messages the internal handler that
//! replaces it.  The dispatch sequence is: validate the parameters, look
//! up ACLs, gate on shutdown, resolve and route the handle, check the
//! subtype, run kernel handlers or the pre-check, call the object's
//! handler with the table unlocked and the object marked busy, then run
//! the post-check.
//!
//! Messages to an object that is already processing one are enqueued on
//! a single global queue with per-object FIFO order: a handler's message
//! to its own object is deferred until the handler exits its lock frame,
//! while its messages to other objects dispatch immediately.

use status::{Error, Result};
use std::sync::MutexGuard;

use crate::attribute::{
    self, AttrFlags, Attribute, AttributeAcl, VALUE_UNUSED, ValueKind,
};
use crate::message::{
    CERT_FORMAT_LAST, CHECK_TYPE_LAST, CompareType, MessageData, MessageType, Msg, ParamShape,
};
use crate::object::table::ObjectTable;
use crate::object::{
    Action, ActionPerm, ActionPerms, DEFAULT_USER_HANDLE, FIRST_DYNAMIC_HANDLE, Handle,
    KernelObject, ObjectFlags, ObjectType, SYSTEM_OBJECT_HANDLE, SubtypeA, SubtypeB,
};
use crate::{Kernel, cow, keymgmt, mechanism};

/// Iteration cap for the busy-wait on an in-use object.
const MAX_WAIT_COUNT: u32 = 10000;
/// Wait iterations beyond this mark the object as a bottleneck suspect.
const WAIT_WARN_THRESHOLD: u32 = 10;

/// The maximum nesting depth of messages sent by an object.  It's hard
/// to get more than two or three entries into the queue unless an object
/// starts recursively sending itself messages.
pub(crate) const MESSAGE_QUEUE_SIZE: usize = 16;

/// A borrow of the kernel with the object-table lock held.  Handlers
/// that need to send messages mid-check drop and reacquire the lock
/// through [`unlocked`]; everything else works on [`table`].
///
/// [`unlocked`]: TableRef::unlocked
/// [`table`]: TableRef::table
pub(crate) struct TableRef<'k> {
    kernel: &'k Kernel,
    guard: Option<MutexGuard<'k, ObjectTable>>,
}

impl<'k> TableRef<'k> {
    pub(crate) fn new(kernel: &'k Kernel) -> Self {
        Self {
            kernel,
            guard: Some(kernel.lock_table()),
        }
    }

    pub(crate) fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    pub(crate) fn table(&mut self) -> &mut ObjectTable {
        // The guard is only absent inside `unlocked`, which doesn't hand
        // out `self`.
        self.guard.as_mut().expect("object table lock held")
    }

    /// Runs `f` with the object table unlocked, reacquiring the lock
    /// afterwards.  Anything read from the table before this call may be
    /// stale afterwards and must be re-fetched.
    pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce(&'k Kernel) -> R) -> R {
        self.guard = None;
        let result = f(self.kernel);
        self.guard = Some(self.kernel.lock_table());
        result
    }
}

/// ACL attached to a message before dispatch.
#[derive(Clone, Copy)]
pub(crate) enum Acl {
    None,
    Attribute(&'static AttributeAcl),
    Param(&'static ParamAcl),
}

/// Parameter ACL for the messages that carry an object handle as their
/// value parameter.
pub(crate) struct ParamAcl {
    msg: MessageType,
    subtype_a: SubtypeA,
    subtype_b: SubtypeB,
}

static PARAM_ACLS: [ParamAcl; 2] = [
    // Certs can only be signed by (private-key) PKC contexts.
    ParamAcl {
        msg: MessageType::CrtSign,
        subtype_a: SubtypeA::CTX_PKC,
        subtype_b: SubtypeB::empty(),
    },
    // Signatures can be checked with a raw PKC context or a cert or cert
    // chain; the object being checked can also be checked against a CRL,
    // against revocation data in a cert store, or against an RTCS or
    // OCSP responder.
    ParamAcl {
        msg: MessageType::CrtSigCheck,
        subtype_a: SubtypeA::CTX_PKC
            .union(SubtypeA::CERT_CERT)
            .union(SubtypeA::CERT_CERTCHAIN)
            .union(SubtypeA::CERT_CRL)
            .union(SubtypeA::KEYSET_DBMS),
        subtype_b: SubtypeB::SESS_RTCS.union(SubtypeB::SESS_OCSP),
    },
];

fn find_param_acl(msg: MessageType) -> &'static ParamAcl {
    let acl = PARAM_ACLS
        .iter()
        .find(|acl| acl.msg == msg);
    debug_assert!(acl.is_some());
    acl.unwrap_or(&PARAM_ACLS[0])
}

/// How a message finds its ultimate target object.
#[derive(Clone, Copy)]
pub(crate) enum Routing {
    /// Not routed; the addressed object is the target.
    None,
    /// Routed using the attribute ACL's own target.
    Implicit,
    /// Walk the dependency chain to the nearest object of this type.
    Target(ObjectType),
    /// Not routed, but the addressed object must be of this type.
    Fixed(ObjectType),
    /// Not routed; the addressed object must be one of these types.
    FixedAlt(ObjectType, ObjectType),
    /// Routed by the compare type carried in the value parameter.
    Compare,
}

type PreFn = fn(&mut TableRef<'_>, Handle, Msg, &mut MessageData, i32, Acl) -> Result<()>;
type PostFn = PreFn;
type InternalFn = fn(&mut TableRef<'_>, Handle, &mut MessageData, i32) -> Result<()>;

/// Per-message-type handling information, in the order in which it's
/// applied.
pub(crate) struct MessageHandling {
    msg: MessageType,
    routing: Routing,
    subtype_a: SubtypeA,
    subtype_b: SubtypeB,
    shape: ParamShape,
    pre: Option<PreFn>,
    post: Option<PostFn>,
    internal: Option<InternalFn>,
}

const fn entry(
    msg: MessageType,
    routing: Routing,
    subtype_a: SubtypeA,
    subtype_b: SubtypeB,
    shape: ParamShape,
    pre: Option<PreFn>,
    post: Option<PostFn>,
    internal: Option<InternalFn>,
) -> MessageHandling {
    MessageHandling {
        msg,
        routing,
        subtype_a,
        subtype_b,
        shape,
        pre,
        post,
        internal,
    }
}

use MessageType as MT;
use ParamShape as PS;

const ST_ANY_A: SubtypeA = SubtypeA::all();
const ST_ANY_B: SubtypeB = SubtypeB::all();
const ST_NONE_A: SubtypeA = SubtypeA::empty();
const ST_NONE_B: SubtypeB = SubtypeB::empty();

static MESSAGE_HANDLING: [MessageHandling; 38] = [
    // Control messages: not routed, valid for all object types, handled
    // by the kernel.
    entry(MT::Destroy, Routing::None, ST_ANY_A, ST_ANY_B, PS::NoneNone,
          Some(pre_signal_dependent_objects), None, None),
    entry(MT::IncRefCount, Routing::None, ST_ANY_A, ST_ANY_B, PS::NoneNone,
          None, None, Some(internal_inc_ref_count)),
    entry(MT::DecRefCount, Routing::None, ST_ANY_A, ST_ANY_B, PS::NoneNone,
          None, None, Some(internal_dec_ref_count)),
    entry(MT::GetDependent, Routing::None, ST_ANY_A, ST_ANY_B, PS::DataObjectType,
          None, None, Some(internal_get_dependent)),
    entry(MT::SetDependent, Routing::None, ST_ANY_A, ST_ANY_B, PS::DataBool,
          None, None, Some(internal_set_dependent)),
    entry(MT::Clone, Routing::Fixed(ObjectType::Context),
          SubtypeA::CTX_CONV.union(SubtypeA::CTX_HASH), ST_NONE_B, PS::NoneAny,
          None, None, Some(cow::clone_object)),

    // Attribute messages: implicitly routed by attribute type, with the
    // detailed checking done against the attribute ACLs.
    entry(MT::GetAttribute, Routing::Implicit, ST_ANY_A, ST_ANY_B, PS::DataAny,
          Some(pre_check_attribute_access), Some(post_make_object_external), None),
    entry(MT::GetAttributeData, Routing::Implicit, ST_ANY_A, ST_ANY_B, PS::DataAny,
          Some(pre_check_attribute_access), None, None),
    entry(MT::SetAttribute, Routing::Implicit, ST_ANY_A, ST_ANY_B, PS::DataAny,
          Some(pre_check_attribute_access), Some(post_change_state_opt), None),
    entry(MT::SetAttributeData, Routing::Implicit, ST_ANY_A, ST_ANY_B, PS::DataAny,
          Some(pre_check_attribute_access), Some(post_change_state_opt), None),
    entry(MT::DeleteAttribute, Routing::Implicit,
          SubtypeA::CTX_ANY.union(SubtypeA::CERT_ANY),
          SubtypeB::SESS_ANY.union(SubtypeB::USER_NORMAL).union(SubtypeB::USER_SO),
          PS::NoneAny, Some(pre_check_attribute_access), None, None),

    // General messages.
    entry(MT::Compare, Routing::Compare,
          SubtypeA::CTX_ANY.union(SubtypeA::CERT_ANY), ST_NONE_B, PS::DataCompareType,
          Some(pre_check_compare_param), None, None),
    entry(MT::Check, Routing::None, ST_ANY_A, ST_ANY_B, PS::NoneCheckType,
          None, Some(post_forward_to_dependent), None),

    // Sent from the kernel to object handlers only; everything arriving
    // from outside is rejected by the empty subtype masks.
    entry(MT::ChangeNotify, Routing::None, ST_NONE_A, ST_NONE_B, PS::NoneAny,
          None, None, None),

    // Context messages.
    entry(MT::CtxEncrypt, Routing::Target(ObjectType::Context),
          SubtypeA::CTX_CONV.union(SubtypeA::CTX_PKC), ST_NONE_B, PS::DataLength,
          Some(pre_check_action_access), Some(post_update_usage_count), None),
    entry(MT::CtxDecrypt, Routing::Target(ObjectType::Context),
          SubtypeA::CTX_CONV.union(SubtypeA::CTX_PKC), ST_NONE_B, PS::DataLength,
          Some(pre_check_action_access), Some(post_update_usage_count), None),
    entry(MT::CtxSign, Routing::Target(ObjectType::Context),
          SubtypeA::CTX_PKC, ST_NONE_B, PS::DataLength,
          Some(pre_check_action_access), Some(post_update_usage_count), None),
    entry(MT::CtxSigCheck, Routing::Target(ObjectType::Context),
          SubtypeA::CTX_PKC, ST_NONE_B, PS::DataLength,
          Some(pre_check_action_access), Some(post_update_usage_count), None),
    entry(MT::CtxHash, Routing::Target(ObjectType::Context),
          SubtypeA::CTX_HASH.union(SubtypeA::CTX_MAC), ST_NONE_B, PS::DataLength,
          Some(pre_check_action_access), Some(post_update_usage_count), None),
    entry(MT::CtxGenKey, Routing::Target(ObjectType::Context),
          SubtypeA::CTX_CONV.union(SubtypeA::CTX_PKC).union(SubtypeA::CTX_MAC),
          ST_NONE_B, PS::NoneBool,
          Some(pre_check_state), Some(post_change_state), None),
    entry(MT::CtxGenIv, Routing::Target(ObjectType::Context),
          SubtypeA::CTX_CONV, ST_NONE_B, PS::NoneNone, None, None, None),

    // Certificate messages.
    entry(MT::CrtSign, Routing::Target(ObjectType::Certificate),
          SubtypeA::CERT_ANY_CERT
              .union(SubtypeA::CERT_ATTRCERT)
              .union(SubtypeA::CERT_CRL)
              .union(SubtypeA::CERT_OCSP_REQ)
              .union(SubtypeA::CERT_OCSP_RESP),
          ST_NONE_B, PS::NoneAny,
          Some(pre_check_state_param_handle), Some(post_change_state), None),
    entry(MT::CrtSigCheck, Routing::Target(ObjectType::Certificate),
          SubtypeA::CERT_ANY_CERT
              .union(SubtypeA::CERT_ATTRCERT)
              .union(SubtypeA::CERT_CRL)
              .union(SubtypeA::CERT_RTCS_RESP)
              .union(SubtypeA::CERT_OCSP_RESP),
          ST_NONE_B, PS::NoneAny,
          Some(pre_check_param_handle_opt), None, None),
    entry(MT::CrtExport, Routing::Target(ObjectType::Certificate),
          SubtypeA::CERT_ANY, ST_NONE_B, PS::DataFormatType,
          Some(pre_check_export_access), None, None),

    // Device messages.
    entry(MT::DevQueryCapability, Routing::Fixed(ObjectType::Device),
          SubtypeA::DEV_ANY, ST_NONE_B, PS::DataAny, None, None, None),
    entry(MT::DevExport, Routing::Target(ObjectType::Device),
          SubtypeA::DEV_ANY, ST_NONE_B, PS::DataMechanism,
          Some(pre_check_mechanism_wrap), None, None),
    entry(MT::DevImport, Routing::Target(ObjectType::Device),
          SubtypeA::DEV_ANY, ST_NONE_B, PS::DataMechanism,
          Some(pre_check_mechanism_wrap), None, None),
    entry(MT::DevSign, Routing::Target(ObjectType::Device),
          SubtypeA::DEV_ANY, ST_NONE_B, PS::DataMechanism,
          Some(pre_check_mechanism_sign), None, None),
    entry(MT::DevSigCheck, Routing::Target(ObjectType::Device),
          SubtypeA::DEV_ANY, ST_NONE_B, PS::DataMechanism,
          Some(pre_check_mechanism_sign), None, None),
    entry(MT::DevDerive, Routing::Target(ObjectType::Device),
          SubtypeA::DEV_ANY, ST_NONE_B, PS::DataMechanism,
          Some(pre_check_mechanism_derive), None, None),
    entry(MT::DevCreateObject, Routing::Fixed(ObjectType::Device),
          SubtypeA::DEV_ANY, ST_NONE_B, PS::DataObjectType,
          Some(pre_set_object_owner), Some(post_make_object_external), None),

    // Envelope messages.
    entry(MT::EnvPushData, Routing::FixedAlt(ObjectType::Envelope, ObjectType::Session),
          ST_NONE_A, SubtypeB::ENV_ANY.union(SubtypeB::SESS_ANY_DATA), PS::DataNone,
          Some(pre_check_data), None, None),
    entry(MT::EnvPopData, Routing::FixedAlt(ObjectType::Envelope, ObjectType::Session),
          ST_NONE_A, SubtypeB::ENV_ANY.union(SubtypeB::SESS_ANY_DATA), PS::DataNone,
          Some(pre_check_data), None, None),

    // Keyset messages.
    entry(MT::KeyGetKey, Routing::FixedAlt(ObjectType::Keyset, ObjectType::Device),
          SubtypeA::KEYSET_ANY.union(SubtypeA::DEV_ANY_STD), ST_NONE_B, PS::DataItemType,
          Some(pre_check_keyset_access), Some(post_make_object_external), None),
    entry(MT::KeySetKey, Routing::FixedAlt(ObjectType::Keyset, ObjectType::Device),
          SubtypeA::KEYSET_ANY.union(SubtypeA::DEV_ANY_STD), ST_NONE_B, PS::DataItemType,
          Some(pre_check_keyset_access), None, None),
    entry(MT::KeyDeleteKey, Routing::FixedAlt(ObjectType::Keyset, ObjectType::Device),
          SubtypeA::KEYSET_ANY.union(SubtypeA::DEV_ANY_STD), ST_NONE_B, PS::DataItemType,
          Some(pre_check_keyset_access), None, None),
    entry(MT::KeyGetFirst, Routing::FixedAlt(ObjectType::Keyset, ObjectType::Device),
          SubtypeA::KEYSET_ANY.union(SubtypeA::DEV_ANY_STD), ST_NONE_B, PS::DataItemType,
          Some(pre_check_keyset_access), None, None),
    entry(MT::KeyGetNext, Routing::FixedAlt(ObjectType::Keyset, ObjectType::Device),
          SubtypeA::KEYSET_ANY.union(SubtypeA::DEV_ANY_STD), ST_NONE_B, PS::DataItemType,
          Some(pre_check_keyset_access), Some(post_make_object_external), None),
];

pub(crate) fn handling(msg: MessageType) -> &'static MessageHandling {
    let entry = &MESSAGE_HANDLING[msg as usize - 1];
    debug_assert_eq!(entry.msg as usize, msg as usize);
    entry
}

/// Consistency check over the handling table, run once at boot in debug
/// builds.
pub(crate) fn check_handling_table() {
    for (index, entry) in MESSAGE_HANDLING.iter().enumerate() {
        debug_assert_eq!(entry.msg as usize, index + 1);
        debug_assert!(!(entry.internal.is_some() && entry.post.is_some()));
    }
    for acl in &PARAM_ACLS {
        debug_assert!(acl.msg.is_param_message());
    }
}

/// Validates the data/value parameter combination against the message's
/// shape tag.
fn check_param_shape(shape: ParamShape, data: &MessageData, value: i32) -> Result<()> {
    let data_ok = match shape {
        PS::NoneNone | PS::NoneAny | PS::NoneBool | PS::NoneCheckType => data.is_none(),
        _ => !data.is_none(),
    };
    if !data_ok {
        return Err(Error::ArgStr1);
    }
    let value_ok = match shape {
        PS::NoneAny | PS::DataAny => true,
        PS::NoneNone | PS::DataNone => value == 0,
        PS::NoneBool | PS::DataBool => value == 0 || value == 1,
        PS::NoneCheckType => value > 0 && value <= CHECK_TYPE_LAST,
        PS::DataLength => value >= 0,
        PS::DataObjectType => ObjectType::from_value(value).is_some(),
        PS::DataMechanism => mechanism::Mechanism::from_value(value).is_some(),
        PS::DataItemType => keymgmt::ItemType::from_value(value).is_some(),
        PS::DataFormatType => value > 0 && value <= CERT_FORMAT_LAST,
        PS::DataCompareType => CompareType::from_value(value).is_some(),
    };
    if !value_ok {
        return Err(Error::ArgValue);
    }
    Ok(())
}

/// Resolves a message's target object, following dependent-object
/// pointers where the message type calls for it.
fn route_message(
    table: &ObjectTable,
    handle: Handle,
    value: i32,
    handling: &MessageHandling,
    acl: Acl,
) -> Result<Handle> {
    match handling.routing {
        Routing::None => Ok(handle),
        Routing::Implicit => {
            let Acl::Attribute(attribute_acl) = acl else {
                debug_assert!(false, "implicit routing without an attribute ACL");
                return Err(Error::ArgObject);
            };
            match attribute_acl.route {
                Some(target) => table.find_target(handle, &[target]),
                None => Ok(handle),
            }
        }
        Routing::Target(target) => table.find_target(handle, &[target]),
        Routing::Fixed(target) => {
            if table.info(handle).object_type == target {
                Ok(handle)
            } else {
                Err(Error::ArgObject)
            }
        }
        Routing::FixedAlt(target, alt) => {
            let object_type = table.info(handle).object_type;
            if object_type == target || object_type == alt {
                Ok(handle)
            } else {
                Err(Error::ArgObject)
            }
        }
        Routing::Compare => {
            let target = match CompareType::from_value(value) {
                Some(
                    CompareType::Hash
                    | CompareType::KeyId
                    | CompareType::KeyIdPgp
                    | CompareType::KeyIdOpenPgp,
                ) => ObjectType::Context,
                Some(_) => ObjectType::Certificate,
                None => return Err(Error::ArgValue),
            };
            table.find_target(handle, &[target])
        }
    }
    .map_err(|_| Error::ArgObject)
}

/// One message parked on the queue.
pub(crate) struct QueueEntry {
    pub handle: Handle,
    pub msg: Msg,
    pub data: MessageData,
    pub value: i32,
    pub acl: Acl,
    /// This destroy started out as a different message that found its
    /// target signalled.
    pub converted: bool,
    seq: u64,
}

/// The global message queue.  Lives inside the object table so that it
/// shares the table's lock; every operation on it happens inside a
/// dispatch critical section.
pub(crate) struct MessageQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MESSAGE_QUEUE_SIZE),
            next_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Enqueues a message.  If a message for the same object is already
    /// present, the new one is inserted after it and deferred; otherwise
    /// it's placed at the front for immediate processing.  Returns the
    /// entry's sequence number and whether processing was deferred.
    fn enqueue(
        &mut self,
        handle: Handle,
        msg: Msg,
        data: MessageData,
        value: i32,
        acl: Acl,
        converted: bool,
    ) -> Result<(u64, bool)> {
        // An object that won't respond to messages eventually fills the
        // queue; treat that the same as any other unresponsive object.
        if self.entries.len() >= MESSAGE_QUEUE_SIZE {
            return Err(Error::Timeout);
        }

        let position = self
            .entries
            .iter()
            .rposition(|entry| entry.handle == handle)
            .map(|position| position + 1);
        let deferred = position.is_some();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            position.unwrap_or(0),
            QueueEntry {
                handle,
                msg,
                data,
                value,
                acl,
                converted,
                seq,
            },
        );
        Ok((seq, deferred))
    }

    /// Removes and returns the next message for an object.  Other
    /// messages can come and go between calls, so the scan restarts from
    /// the front each time; that's also what keeps per-object FIFO
    /// order.
    fn next_for(&mut self, handle: Handle) -> Option<QueueEntry> {
        let position = self.entries.iter().position(|entry| entry.handle == handle)?;
        Some(self.entries.remove(position))
    }

    /// Drops every queued message for an object.
    pub(crate) fn remove_all(&mut self, handle: Handle) {
        self.entries.retain(|entry| entry.handle != handle);
    }
}

/// Busy-wait for an in-use object, yielding the thread between polls.
/// Gives up after [`MAX_WAIT_COUNT`] iterations, and detects both
/// shutdown and the object being replaced while we yielded.
pub(crate) fn wait_for_object(tr: &mut TableRef<'_>, handle: Handle) -> Result<()> {
    let unique_id = tr.table().info(handle).unique_id;
    let mut wait_count = 0;

    while tr.table().is_valid_object(handle)
        && tr.table().info(handle).unique_id == unique_id
        && tr.table().info(handle).is_in_use()
        && wait_count < MAX_WAIT_COUNT
        && !tr.kernel().is_closing_down()
    {
        // Give up the timeslice so the thread holding the object can
        // run.
        tr.unlocked(|_| std::thread::yield_now());
        wait_count += 1;
    }
    if cfg!(debug_assertions) && wait_count > WAIT_WARN_THRESHOLD {
        let info = tr.table().info(handle);
        log::warn!(
            "waited {} iterations for object {} (type {:?}, subtype {:?})",
            wait_count,
            handle,
            info.object_type,
            info.subtype,
        );
    }

    if tr.kernel().is_closing_down() {
        return Err(Error::PermissionDenied);
    }
    if wait_count >= MAX_WAIT_COUNT {
        return Err(Error::Timeout);
    }
    // Make sure nothing happened to the object while we were waiting.
    if !tr.table().is_valid_object(handle) || tr.table().info(handle).unique_id != unique_id {
        return Err(Error::Signalled);
    }
    Ok(())
}

/// Calls the object's message handler with the table lock released and
/// the object marked busy.  The lock count is only restored if the
/// handler didn't legitimately relinquish the object (the system and
/// user objects unlock themselves when they forward work elsewhere).
fn dispatch_to_object(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: MessageType,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let body_ptr: *mut dyn KernelObject = {
        let info = tr.table().info_mut(handle);
        let Some(body) = info.body.as_mut() else {
            return Err(Error::Signalled);
        };
        info.lock_count += 1;
        info.lock_owner = Some(std::thread::current().id());
        &mut **body
    };
    let expected_lock = tr.table().info(handle).lock_count;

    // SAFETY: the busy marking above gives this thread exclusive access
    // to the body until the lock count drops, and the body's heap
    // allocation is stable even if the descriptor array grows while the
    // lock is released.
    let status = tr.unlocked(|kernel| unsafe { (*body_ptr).handle_message(kernel, msg, data, value) });

    let info = tr.table().info_mut(handle);
    if info.lock_count == expected_lock && info.is_owned_by_current_thread() {
        info.lock_count -= 1;
    }
    status
}

/// The central send primitive.
pub(crate) fn send_message(
    kernel: &Kernel,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let mut local_handling = handling(msg.kind);
    check_param_shape(local_handling.shape, data, value)?;

    // Attribute and object-parameter messages carry a mandatory ACL;
    // neither lookup needs the object table, so both happen before the
    // lock.
    let acl = if msg.kind.is_attribute_message() {
        match attribute::find_attribute_acl(value, msg.internal) {
            Some(attribute_acl) => Acl::Attribute(attribute_acl),
            None => return Err(Error::ArgValue),
        }
    } else if msg.kind.is_param_message() {
        Acl::Param(find_param_acl(msg.kind))
    } else {
        Acl::None
    };

    // During shutdown only destruction-related messages (and the status
    // read the shutdown code itself needs) get through.  Checked outside
    // the lock so remaining active objects exit quickly.
    if kernel.is_closing_down()
        && !(msg.kind == MessageType::Destroy
            || msg.kind == MessageType::DecRefCount
            || (msg.kind == MessageType::GetAttribute
                && value == Attribute::IntStatus as i32))
    {
        return Err(Error::PermissionDenied);
    }

    let mut tr = TableRef::new(kernel);

    // The first line of defence: the handle must name an object, and for
    // an external message the object must be externally visible and not
    // bound to another thread.  All three failures look identical to the
    // caller.
    {
        let table = tr.table();
        if !table.is_valid_object(handle) {
            return Err(Error::ArgObject);
        }
        if !msg.internal {
            let info = table.info(handle);
            if info.is_internal() || !info.thread_access_ok() {
                return Err(Error::ArgObject);
            }
        }
        // The system objects can never be explicitly destroyed or have
        // their reference counts altered.
        if handle < FIRST_DYNAMIC_HANDLE
            && matches!(
                msg.kind,
                MessageType::Destroy | MessageType::IncRefCount | MessageType::DecRefCount
            )
        {
            return Err(Error::ArgObject);
        }
    }

    // Route to the ultimate target, then make sure the message is valid
    // for the target's subtype.
    let target = route_message(tr.table(), handle, value, local_handling, acl)?;
    if !tr
        .table()
        .info(target)
        .subtype
        .matches(local_handling.subtype_a, local_handling.subtype_b)
    {
        return Err(Error::ArgObject);
    }

    let mut local_msg = msg;
    let mut converted = false;

    // Kernel-handled messages and object-property attributes execute
    // immediately; the object's state doesn't affect them.  A completion
    // that found its target signalled comes back as the out-of-band
    // status and is converted into a destroy below.
    let is_property_attribute = matches!(acl, Acl::Attribute(attribute_acl)
        if attribute_acl.flags.contains(AttrFlags::PROPERTY));
    if local_handling.internal.is_some() || is_property_attribute {
        let mut status = Ok(());
        if let Some(pre) = local_handling.pre {
            status = pre(&mut tr, target, local_msg, data, value, acl);
        }
        if status.is_ok() {
            status = if let Some(internal_handler) = local_handling.internal {
                internal_handler(&mut tr, target, data, value)
            } else {
                let Acl::Attribute(attribute_acl) = acl else {
                    debug_assert!(false);
                    return Err(Error::ArgValue);
                };
                if local_msg.kind == MessageType::GetAttribute {
                    attribute::get_property(tr.table(), target, attribute_acl.attribute, data)
                } else {
                    attribute::set_property(&mut tr, target, attribute_acl.attribute, data)
                }
            };
        }
        if status != Err(Error::SpecialCase) {
            return status;
        }

        // The object was signalled while it was being initialised and
        // can't be used; convert the completion into a destroy, keeping
        // the original message data so later code can see what
        // triggered it.
        local_msg = Msg {
            kind: MessageType::Destroy,
            internal: true,
        };
        local_handling = handling(MessageType::Destroy);
        converted = true;
    }

    // An aliased object (cloned, subject to copy-on-write) resolves the
    // pending copy before anything can observe or modify it.
    if tr.table().info(target).flags.contains(ObjectFlags::ALIASED) {
        cow::handle_aliased_object(&mut tr, target, local_msg.kind)?;
    }

    // If the object isn't busy and this isn't a destroy, dispatch
    // immediately; the queue only sees recursive self-sends and
    // destroys.  After the handler exits its lock frame, any messages
    // it sent to its own object get drained in order.
    if !tr.table().info(target).is_in_use() && local_msg.kind != MessageType::Destroy {
        if tr.table().info(target).in_invalid_state() {
            return Err(tr.table().info(target).status_error());
        }
        // A shutdown may have been signalled while the checks above ran.
        if kernel.is_closing_down() {
            return Err(Error::PermissionDenied);
        }

        if let Some(pre) = local_handling.pre {
            pre(&mut tr, target, local_msg, data, value, acl)?;
        }
        let mut status = dispatch_to_object(&mut tr, target, local_msg.kind, data, value);
        if status.is_ok() {
            if let Some(post) = local_handling.post {
                status = post(&mut tr, target, local_msg, data, value, acl);
            }
        }
        // The handler has left its lock frame; run whatever it posted
        // to itself.  Failures there belong to the queued messages, not
        // to this send.
        let _ = drain_queue(&mut tr, target, None);
        return status;
    }

    // A sender whose own lock count exceeds half the queue is stuck in
    // a recursive loop; stop it before it fills the queue to the
    // detriment of every other object.
    if tr.table().info(target).lock_count as usize > MESSAGE_QUEUE_SIZE / 2 {
        return Err(Error::Timeout);
    }

    // If another thread holds the object, wait it out.
    if tr.table().info(target).is_in_use()
        && !tr.table().info(target).is_owned_by_current_thread()
    {
        wait_for_object(&mut tr, target)?;
    }

    // A message from a handler back to its own object is parked on the
    // queue and executed after the handler exits its lock frame; the
    // sender sees success now, and any reply the handler would have
    // produced is lost.
    if tr.table().info(target).is_in_use() {
        tr.table()
            .queue
            .enqueue(target, local_msg, std::mem::take(data), value, acl, converted)?;
        return Ok(());
    }

    // A destroy of a free object (or any message that waited out
    // another thread) goes through the queue machinery so that the
    // destroy bookkeeping lives in exactly one place.
    let (seq, deferred) =
        tr.table()
            .queue
            .enqueue(target, local_msg, std::mem::take(data), value, acl, converted)?;
    let result = if deferred {
        // Leftover queued messages precede ours; everything drains in
        // order and our status is lost to the earlier sender's frame.
        let _ = drain_queue(&mut tr, target, None);
        Ok(())
    } else {
        drain_queue(&mut tr, target, Some((seq, data)))
    };

    if converted && result.is_ok() {
        // The completion was converted into a destroy; let the creator
        // know its object is gone.
        return Err(Error::SpecialCase);
    }
    result
}

/// Drains the queued messages for one object in FIFO order.  Messages
/// for other objects stay parked; they belong to other levels of the
/// recursion.  With `restore` given, the named entry's payload (and
/// status) is handed back to the caller that enqueued it.
pub(crate) fn drain_queue(
    tr: &mut TableRef<'_>,
    target: Handle,
    mut restore: Option<(u64, &mut MessageData)>,
) -> Result<()> {
    let mut result = Ok(());
    while let Some(mut queue_entry) = tr.table().queue.next_for(target) {
        let entry_handling = handling(queue_entry.msg.kind);
        let is_destroy = queue_entry.msg.kind == MessageType::Destroy;
        let wanted = matches!(&restore, Some((seq, _)) if *seq == queue_entry.seq);

        // A problem with the object stops everything except a destroy
        // sent to a busy object and a destroy that was converted from
        // another message type.
        let flags = tr.table().info(target).flags;
        let mut status;
        if tr.table().info(target).in_invalid_state()
            && !(is_destroy && (queue_entry.converted || flags.contains(ObjectFlags::BUSY)))
        {
            if is_destroy && flags.contains(ObjectFlags::NOT_INITED) {
                // Destroy of an object still being created: record the
                // signal and let the creator's completion finish the
                // job.
                tr.table().info_mut(target).flags |= ObjectFlags::SIGNALLED;
                status = Ok(());
            } else {
                tr.table().queue.remove_all(target);
                status = Err(tr.table().info(target).status_error());
            }
            if wanted {
                result = status;
            }
            continue;
        }

        status = Ok(());
        if let Some(pre) = entry_handling.pre {
            status = pre(
                &mut *tr,
                target,
                queue_entry.msg,
                &mut queue_entry.data,
                queue_entry.value,
                queue_entry.acl,
            );
        }
        if status.is_ok() {
            status = dispatch_to_object(
                tr,
                target,
                queue_entry.msg.kind,
                &mut queue_entry.data,
                queue_entry.value,
            );
        }
        // A destroy always proceeds even when the handler reports an
        // error (typically an incomplete teardown).
        if status.is_ok() || is_destroy {
            if let Some(post) = entry_handling.post {
                status = post(
                    &mut *tr,
                    target,
                    queue_entry.msg,
                    &mut queue_entry.data,
                    queue_entry.value,
                    queue_entry.acl,
                );
            }
        }

        if is_destroy {
            // The object's handler can't remove its own table entry;
            // that's done here, along with any remaining messages for
            // it.
            tr.table().clear_entry(target);
            tr.table().queue.remove_all(target);
        } else if status.is_err() {
            tr.table().queue.remove_all(target);
        }

        if wanted {
            // Hand any reply back to the caller's payload.
            if let Some((_, data)) = restore.as_mut() {
                **data = std::mem::take(&mut queue_entry.data);
            }
            result = status;
        }
    }
    result
}

/*
 * Pre-dispatch handlers.
 */

/// Destroy: adjust the reference counts of dependent objects and mark
/// the object signalled before its handler runs, so that other threads
/// fail cleanly instead of racing the partially-destroyed object.
fn pre_signal_dependent_objects(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _msg: Msg,
    _data: &mut MessageData,
    _value: i32,
    _acl: Acl,
) -> Result<()> {
    let (dependent_object, dependent_device) = {
        let info = tr.table().info(handle);
        (info.dependent_object, info.dependent_device)
    };
    if let Some(device) = dependent_device {
        let _ = internal_dec_ref_count(tr, device, &mut MessageData::None, 0);
    }
    if let Some(object) = dependent_object {
        let _ = internal_dec_ref_count(tr, object, &mut MessageData::None, 0);
    }
    tr.table().info_mut(handle).flags |= ObjectFlags::SIGNALLED;
    Ok(())
}

fn pre_check_attribute_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
    acl: Acl,
) -> Result<()> {
    let Acl::Attribute(attribute_acl) = acl else {
        debug_assert!(false, "attribute message without an attribute ACL");
        return Err(Error::ArgValue);
    };
    attribute::check_attribute_access(tr, handle, msg, data, value, attribute_acl)
}

fn pre_check_compare_param(
    tr: &mut TableRef<'_>,
    _handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
    _acl: Acl,
) -> Result<()> {
    let compare = CompareType::from_value(value).ok_or(Error::ArgValue)?;
    if compare == CompareType::CertObject {
        let object = data
            .value()
            .and_then(|v| Handle::try_from(v).ok())
            .ok_or(Error::ArgNum1)?;
        let table = tr.table();
        if !table.is_valid_object(object)
            || (!msg.internal && table.info(object).is_internal())
        {
            return Err(Error::ArgNum1);
        }
        return Ok(());
    }
    match data {
        MessageData::Bytes(bytes) if !bytes.is_empty() => Ok(()),
        _ => Err(Error::ArgStr1),
    }
}

/// Action messages: the object must be in the high state with the action
/// enabled at the level the message source requires and the usage
/// ratchet not exhausted.
fn pre_check_action_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    _data: &mut MessageData,
    _value: i32,
    _acl: Acl,
) -> Result<()> {
    let info = tr.table().info(handle);

    // In the low state the object can't be used for any action.
    if !info.is_in_high_state() {
        return Err(Error::NotInited);
    }
    // In the high state it can't receive another message of the kind
    // that causes the state change.
    if msg.kind == MessageType::CtxGenKey {
        return Err(Error::AlreadyInited);
    }
    if info.usage_count.is_some_and(|count| count <= 0) {
        return Err(Error::PermissionDenied);
    }

    let Some(action) = Action::from_message(msg.kind) else {
        debug_assert!(false, "non-action message in action check");
        return Err(Error::ArgValue);
    };
    // Like protection rings, the lower the level the higher the
    // privilege: internal messages get by with internal-only, external
    // ones need all-access.
    let required = info.action_perms.get(action);
    let needed = if msg.internal {
        ActionPerm::InternalOnly
    } else {
        ActionPerm::All
    };
    if required < needed {
        return Err(if required == ActionPerm::NotAvailable {
            Error::NotAvail
        } else {
            Error::PermissionDenied
        });
    }
    Ok(())
}

/// State-change trigger messages are only valid in the low state.
fn pre_check_state(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _msg: Msg,
    _data: &mut MessageData,
    _value: i32,
    _acl: Acl,
) -> Result<()> {
    if tr.table().info(handle).is_in_high_state() {
        return Err(Error::AlreadyInited);
    }
    Ok(())
}

fn check_param_handle(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    value: i32,
    acl: Acl,
) -> Result<()> {
    let Acl::Param(param_acl) = acl else {
        debug_assert!(false, "parameter message without a parameter ACL");
        return Err(Error::ArgValue);
    };
    let param = Handle::try_from(value).map_err(|_| Error::ArgValue)?;
    let table = tr.table();
    if !table.is_valid_object(param)
        || (!msg.internal
            && (table.info(param).is_internal() || !table.info(param).thread_access_ok()))
        || !table.same_owner(handle, param)
    {
        return Err(Error::ArgValue);
    }
    if !table
        .info(param)
        .subtype
        .matches(param_acl.subtype_a, param_acl.subtype_b)
    {
        return Err(Error::ArgValue);
    }
    Ok(())
}

/// Cert sig-check: the verification object is optional (self-signed
/// certs pass the unused sentinel).
fn pre_check_param_handle_opt(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    _data: &mut MessageData,
    value: i32,
    acl: Acl,
) -> Result<()> {
    if i64::from(value) == VALUE_UNUSED {
        return Ok(());
    }
    check_param_handle(tr, handle, msg, value, acl)
}

/// Cert sign: combined state check and signing-key check.
fn pre_check_state_param_handle(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    _data: &mut MessageData,
    value: i32,
    acl: Acl,
) -> Result<()> {
    if tr.table().info(handle).is_in_high_state() {
        return Err(Error::PermissionDenied);
    }
    check_param_handle(tr, handle, msg, value, acl)
}

/// Rule for one certificate-export format, treating the format as a
/// pseudo-attribute.
struct ExportFormatRule {
    subtype_a: SubtypeA,
    internal_only: bool,
}

static EXPORT_FORMAT_RULES: [ExportFormatRule; 7] = [
    // Encoded cert data.
    ExportFormatRule {
        subtype_a: SubtypeA::CERT_ANY_CERT
            .union(SubtypeA::CERT_ATTRCERT)
            .union(SubtypeA::CERT_CRL)
            .union(SubtypeA::CERT_OCSP_RESP),
        internal_only: false,
    },
    // Encoded cert chain.
    ExportFormatRule {
        subtype_a: SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN),
        internal_only: false,
    },
    // Base64-encoded certificate.
    ExportFormatRule {
        subtype_a: SubtypeA::CERT_ANY_CERT
            .union(SubtypeA::CERT_ATTRCERT)
            .union(SubtypeA::CERT_CRL),
        internal_only: false,
    },
    // Base64-encoded cert chain.
    ExportFormatRule {
        subtype_a: SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN),
        internal_only: false,
    },
    // SET OF cert in chain.
    ExportFormatRule {
        subtype_a: SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN),
        internal_only: true,
    },
    // SEQUENCE OF cert in chain.
    ExportFormatRule {
        subtype_a: SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN),
        internal_only: true,
    },
    // Encoded non-signed object data.  Readable in the high state as
    // well since the object may have been imported from its encoded
    // form.
    ExportFormatRule {
        subtype_a: SubtypeA::CERT_CMSATTR
            .union(SubtypeA::CERT_REQ_REV)
            .union(SubtypeA::CERT_RTCS_REQ)
            .union(SubtypeA::CERT_RTCS_RESP)
            .union(SubtypeA::CERT_OCSP_REQ)
            .union(SubtypeA::CERT_OCSP_RESP)
            .union(SubtypeA::CERT_PKIUSER),
        internal_only: true,
    },
];

/// Cert export: the requested format must be valid for the cert subtype,
/// and the internal encodings don't exist for external callers.
fn pre_check_export_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
    _acl: Acl,
) -> Result<()> {
    if !matches!(data, MessageData::Bytes(_)) {
        return Err(Error::ArgStr1);
    }
    let rule = usize::try_from(value - 1)
        .ok()
        .and_then(|index| EXPORT_FORMAT_RULES.get(index))
        .ok_or(Error::ArgValue)?;
    if rule.internal_only && !msg.internal {
        return Err(Error::ArgValue);
    }
    let table = tr.table();
    if !table
        .info(handle)
        .subtype
        .matches(rule.subtype_a, SubtypeB::empty())
    {
        return Err(Error::ArgValue);
    }
    Ok(())
}

/// Enveloped data being pushed or popped: a push with an empty buffer is
/// a flush, a pop must have somewhere to put the data.
fn pre_check_data(
    _tr: &mut TableRef<'_>,
    _handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    _value: i32,
    _acl: Acl,
) -> Result<()> {
    let MessageData::Bytes(bytes) = data else {
        return Err(Error::ArgStr1);
    };
    if msg.kind == MessageType::EnvPopData && bytes.is_empty() {
        return Err(Error::ArgStr1);
    }
    Ok(())
}

/// Object creation through a device: the new object belongs to the owner
/// of the object it's created through, or to the default user when it
/// comes through the system device.
fn pre_set_object_owner(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _msg: Msg,
    data: &mut MessageData,
    _value: i32,
    _acl: Acl,
) -> Result<()> {
    let MessageData::Create(args) = data else {
        return Err(Error::ArgStr1);
    };
    debug_assert!(args.owner.is_none());
    args.owner = if handle == SYSTEM_OBJECT_HANDLE {
        Some(DEFAULT_USER_HANDLE)
    } else {
        tr.table().info(handle).owner
    };
    Ok(())
}

fn pre_check_mechanism_wrap(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
    _acl: Acl,
) -> Result<()> {
    mechanism::check_wrap_access(tr, handle, msg, data, value)
}

fn pre_check_mechanism_sign(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
    _acl: Acl,
) -> Result<()> {
    mechanism::check_sign_access(tr, handle, msg, data, value)
}

fn pre_check_mechanism_derive(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
    _acl: Acl,
) -> Result<()> {
    mechanism::check_derive_access(tr, handle, msg, data, value)
}

fn pre_check_keyset_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
    _acl: Acl,
) -> Result<()> {
    keymgmt::check_keyset_access(tr, handle, msg, data, value)
}

/*
 * Post-dispatch handlers.
 */

/// Objects fetched or created on behalf of an external caller are
/// internal until the kernel explicitly externalises them here.
fn post_make_object_external(
    tr: &mut TableRef<'_>,
    _handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    _value: i32,
    acl: Acl,
) -> Result<()> {
    // Internal messages have no visibility problem, and most messages
    // are internal, so this weeds out the majority of cases first.
    if msg.internal {
        return Ok(());
    }

    let object = match msg.kind {
        MessageType::GetAttribute => {
            // Only reads of object-valued attributes hand out an object.
            let Acl::Attribute(attribute_acl) = acl else {
                debug_assert!(false);
                return Ok(());
            };
            if !matches!(attribute_acl.kind, ValueKind::Object(_)) {
                return Ok(());
            }
            data.value().and_then(|v| Handle::try_from(v).ok())
        }
        MessageType::DevCreateObject => match data {
            MessageData::Create(args) => args.handle,
            _ => None,
        },
        MessageType::KeyGetKey | MessageType::KeyGetNext => match data {
            MessageData::KeyMgmt(args) => args.object,
            _ => None,
        },
        _ => {
            debug_assert!(false, "unexpected message in make-external");
            None
        }
    };
    let Some(object) = object else {
        return Ok(());
    };

    tr.unlocked(|kernel| {
        let mut value = MessageData::Value(0);
        kernel.send_internal(
            object,
            MessageType::SetAttribute,
            &mut value,
            Attribute::IntInternal as i32,
        )
    })
}

/// Check messages sent to one half of a context/certificate pair also
/// apply to the other half, so the kernel forwards them rather than
/// tying up both objects in a relay.
fn post_forward_to_dependent(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _msg: Msg,
    _data: &mut MessageData,
    value: i32,
    _acl: Acl,
) -> Result<()> {
    let (object_type, dependent) = {
        let info = tr.table().info(handle);
        (info.object_type, info.dependent_object)
    };
    let Some(dependent) = dependent else {
        return Ok(());
    };
    let dependent_type = tr.table().info(dependent).object_type;
    let related = (object_type == ObjectType::Context
        && dependent_type == ObjectType::Certificate)
        || (object_type == ObjectType::Certificate && dependent_type == ObjectType::Context);
    if !related {
        return Ok(());
    }

    // The dependent object may be internal-only and owned by another
    // thread, so the forwarded message is internal and sent with the
    // table unlocked.
    tr.unlocked(|kernel| {
        let mut none = MessageData::None;
        kernel.send_internal(dependent, MessageType::Check, &mut none, value)
    })
}

/// Objects with a usage ratchet burn one use per action.
fn post_update_usage_count(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _msg: Msg,
    _data: &mut MessageData,
    _value: i32,
    _acl: Acl,
) -> Result<()> {
    let info = tr.table().info_mut(handle);
    if let Some(count) = info.usage_count {
        debug_assert!(count > 0);
        info.usage_count = Some(count.saturating_sub(1));
    }
    Ok(())
}

/// A state-change trigger message was processed successfully; the kernel
/// (not the object) moves the object into the high state, so the
/// transition can't be bypassed.
fn post_change_state(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _msg: Msg,
    _data: &mut MessageData,
    _value: i32,
    _acl: Acl,
) -> Result<()> {
    debug_assert!(!tr.table().info(handle).is_in_high_state());
    tr.table().info_mut(handle).flags |= ObjectFlags::HIGH;
    Ok(())
}

/// Attribute sets only trigger the state change when the ACL says so.
fn post_change_state_opt(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _msg: Msg,
    _data: &mut MessageData,
    _value: i32,
    acl: Acl,
) -> Result<()> {
    let Acl::Attribute(attribute_acl) = acl else {
        debug_assert!(false);
        return Ok(());
    };
    if attribute_acl.flags.contains(AttrFlags::TRIGGER) {
        tr.table().info_mut(handle).flags |= ObjectFlags::HIGH;
    }
    Ok(())
}

/*
 * Kernel-internal message handlers.
 */

fn internal_inc_ref_count(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _data: &mut MessageData,
    _value: i32,
) -> Result<()> {
    tr.table().info_mut(handle).ref_count += 1;
    Ok(())
}

/// Dropping the last reference destroys the object.  The destroy is
/// dispatched with the table unlocked since the teardown may itself call
/// back into the kernel.
fn internal_dec_ref_count(
    tr: &mut TableRef<'_>,
    handle: Handle,
    _data: &mut MessageData,
    _value: i32,
) -> Result<()> {
    {
        let info = tr.table().info_mut(handle);
        if info.ref_count > 0 {
            info.ref_count -= 1;
            return Ok(());
        }
    }
    if handle < FIRST_DYNAMIC_HANDLE {
        // The system objects are destroyed by the shutdown path, never
        // by running out of references.
        debug_assert!(false, "system object reference count underflow");
        return Ok(());
    }
    tr.unlocked(|kernel| {
        let mut none = MessageData::None;
        kernel.send_internal(handle, MessageType::Destroy, &mut none, 0)
    })
}

fn internal_get_dependent(
    tr: &mut TableRef<'_>,
    handle: Handle,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let Some(target_type) = ObjectType::from_value(value) else {
        return Err(Error::ArgValue);
    };
    let found = tr
        .table()
        .find_target(handle, &[target_type])
        .map_err(|_| Error::ArgObject)?;
    *data = MessageData::Value(i64::from(found));
    Ok(())
}

/// Attaching a dependent object: refuses dependency cycles, optionally
/// takes a reference, and composes action permissions when the pair is a
/// context and a certificate.
fn internal_set_dependent(
    tr: &mut TableRef<'_>,
    handle: Handle,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let dependent = data
        .value()
        .and_then(|v| Handle::try_from(v).ok())
        .ok_or(Error::ArgValue)?;
    let take_reference = value != 0;

    {
        let table = tr.table();
        if !table.is_valid_object(dependent) {
            // The object was signalled after the message was sent.
            return Err(Error::Signalled);
        }

        // Which dependency slot gets updated depends on the dependent's
        // type.
        let attach_device = table.info(dependent).object_type == ObjectType::Device;
        let current = if attach_device {
            table.info(handle).dependent_device
        } else {
            table.info(handle).dependent_object
        };
        if current.is_some() {
            // There's already a dependent object present and this would
            // overwrite it.
            return Err(Error::ArgValue);
        }

        // Refuse a length-2 dependency cycle: the object is already
        // dependent on the dependent object, so attaching would loop
        // the reference counts.
        let back = if table.info(handle).object_type == ObjectType::Device {
            table.info(dependent).dependent_device
        } else {
            table.info(dependent).dependent_object
        };
        if back == Some(handle) {
            return Err(Error::ArgValue);
        }

        if !table.same_owner(handle, dependent) {
            return Err(Error::ArgValue);
        }

        // An existing object attached to a second owner is referenced by
        // both; a newly created object attached to its controlling
        // object keeps its single reference.
        if take_reference {
            table.info_mut(dependent).ref_count += 1;
        }
        if attach_device {
            table.info_mut(handle).dependent_device = Some(dependent);
        } else {
            table.info_mut(handle).dependent_object = Some(dependent);
        }
    }

    // Certs and contexts have a special relationship: the cert can
    // constrain the use of the context beyond its normal level.
    let (object_type, dependent_type) = {
        let table = tr.table();
        (
            table.info(handle).object_type,
            table.info(dependent).object_type,
        )
    };
    if (object_type == ObjectType::Context && dependent_type == ObjectType::Certificate)
        || (object_type == ObjectType::Certificate && dependent_type == ObjectType::Context)
    {
        return update_dependent_object_perms(tr, handle, dependent);
    }
    Ok(())
}

/// Composes a context's action permissions with the capabilities of an
/// attached certificate: each action survives only if the certificate
/// passes the corresponding check, and what survives is reduced to
/// internal-only.  A key with a certificate attached is probably bound
/// to a relying party, so it shouldn't be reachable through unbounded
/// external interfaces, and capping it also stops the signature/
/// encryption duality of some algorithms from resurrecting a disallowed
/// operation.
///
/// This runs with the object table unlocked, since the certificate may
/// be owned by another thread; the context's unique id is re-verified
/// after the queries in case it was replaced during the yield.
fn update_dependent_object_perms(
    tr: &mut TableRef<'_>,
    handle: Handle,
    dependent: Handle,
) -> Result<()> {
    use crate::message::CheckType;

    let (object_type, context, cert) = {
        let table = tr.table();
        let object_type = table.info(handle).object_type;
        if object_type == ObjectType::Context {
            (object_type, handle, dependent)
        } else {
            (object_type, dependent, handle)
        }
    };
    let unique_id = tr.table().info(context).unique_id;

    // A certificate that's already bound to one context can't be
    // attached to another; the reference counts would no longer form a
    // DAG (the length-3 cycle form).
    if object_type == ObjectType::Context {
        let cert_dependent = tr.table().info(cert).dependent_object;
        if cert_dependent.is_some_and(|inner| tr.table().is_valid_object(inner)) {
            return Err(Error::ArgObject);
        }
    }

    let composed = tr.unlocked(|kernel| {
        let check_object = |object: Handle, check_type: CheckType| {
            let mut none = MessageData::None;
            kernel
                .send_internal(object, MessageType::Check, &mut none, check_type as i32)
                .is_ok()
        };
        let check = |check_type: CheckType| check_object(cert, check_type);

        // A private key can't be made dependent on a cert, which is a
        // public-key object.
        if object_type == ObjectType::Certificate && check_object(context, CheckType::PkcPrivate)
        {
            return Err(Error::ArgObject);
        }

        // Every action the certificate vouches for survives at
        // internal-only; everything else drops to denied.
        let mut perms = ActionPerms::uniform(ActionPerm::None);
        if check(CheckType::PkcSign) {
            perms = perms.with(Action::Sign, ActionPerm::InternalOnly);
        }
        if check(CheckType::PkcSigCheck) {
            perms = perms.with(Action::SigCheck, ActionPerm::InternalOnly);
        }
        if check(CheckType::PkcEncrypt) {
            perms = perms.with(Action::Encrypt, ActionPerm::InternalOnly);
        }
        if check(CheckType::PkcDecrypt) {
            perms = perms.with(Action::Decrypt, ActionPerm::InternalOnly);
        }
        if check(CheckType::PkcKaExport) || check(CheckType::PkcKaImport) {
            perms = perms.with(Action::KeyExchange, ActionPerm::InternalOnly);
        }
        Ok(perms)
    })?;

    // Make sure the context wasn't replaced while the table was
    // unlocked.
    let table = tr.table();
    if !table.is_valid_object(context) || table.info(context).unique_id != unique_id {
        return Err(Error::Signalled);
    }
    let info = table.info_mut(context);
    info.action_perms = info.action_perms.tightened(composed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: MessageType) -> Msg {
        Msg {
            kind,
            internal: true,
        }
    }

    #[test]
    fn handling_table_is_indexed_by_message_type() {
        check_handling_table();
        assert!(matches!(
            handling(MessageType::Destroy).routing,
            Routing::None
        ));
        assert!(handling(MessageType::KeyGetNext).post.is_some());
    }

    #[test]
    fn queue_defers_messages_for_the_same_object() {
        let mut queue = MessageQueue::new();
        let (_, deferred) = queue
            .enqueue(7, msg(MessageType::CtxHash), MessageData::None, 0, Acl::None, false)
            .unwrap();
        assert!(!deferred);
        let (_, deferred) = queue
            .enqueue(7, msg(MessageType::CtxHash), MessageData::None, 1, Acl::None, false)
            .unwrap();
        assert!(deferred);
        // Messages for other objects jump the queue.
        let (_, deferred) = queue
            .enqueue(9, msg(MessageType::Destroy), MessageData::None, 0, Acl::None, false)
            .unwrap();
        assert!(!deferred);

        let entry = queue.next_for(9).unwrap();
        assert_eq!(entry.handle, 9);
        // Per-object FIFO: the object-7 messages come out in send order.
        assert_eq!(queue.next_for(7).unwrap().value, 0);
        assert_eq!(queue.next_for(7).unwrap().value, 1);
        assert!(queue.next_for(7).is_none());
    }

    #[test]
    fn queue_overflow_reports_timeout() {
        let mut queue = MessageQueue::new();
        for value in 0..MESSAGE_QUEUE_SIZE {
            queue
                .enqueue(
                    3,
                    msg(MessageType::CtxHash),
                    MessageData::None,
                    value as i32,
                    Acl::None,
                    false,
                )
                .unwrap();
        }
        let status = queue.enqueue(3, msg(MessageType::CtxHash), MessageData::None, 99, Acl::None, false);
        assert!(matches!(status, Err(Error::Timeout)));
    }

    #[test]
    fn remove_all_clears_only_the_given_object() {
        let mut queue = MessageQueue::new();
        queue
            .enqueue(1, msg(MessageType::CtxHash), MessageData::None, 0, Acl::None, false)
            .unwrap();
        queue
            .enqueue(2, msg(MessageType::CtxHash), MessageData::None, 0, Acl::None, false)
            .unwrap();
        queue
            .enqueue(1, msg(MessageType::CtxHash), MessageData::None, 1, Acl::None, false)
            .unwrap();
        queue.remove_all(1);
        assert_eq!(queue.len(), 1);
        assert!(queue.next_for(1).is_none());
        assert!(queue.next_for(2).is_some());
    }

    #[test]
    fn param_shapes() {
        assert!(check_param_shape(PS::NoneNone, &MessageData::None, 0).is_ok());
        assert!(check_param_shape(PS::NoneNone, &MessageData::None, 1).is_err());
        assert!(check_param_shape(PS::NoneNone, &MessageData::Value(0), 0).is_err());
        assert!(check_param_shape(PS::DataLength, &MessageData::Bytes(vec![1]), -1).is_err());
        assert!(check_param_shape(PS::DataMechanism, &MessageData::Value(0), 1).is_ok());
        assert!(check_param_shape(PS::DataMechanism, &MessageData::Value(0), 999).is_err());
        assert!(check_param_shape(PS::NoneCheckType, &MessageData::None, CHECK_TYPE_LAST).is_ok());
        assert!(
            check_param_shape(PS::NoneCheckType, &MessageData::None, CHECK_TYPE_LAST + 1).is_err()
        );
    }
}

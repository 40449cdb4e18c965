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

//! End-to-end behaviour of the dispatcher: lifecycle, ratchets,
//! permission composition, copy-on-write, queue ordering and shutdown.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use kernel::{
    Action, ActionPerm, ActionPerms, Attribute, CheckType, ContextContents, CreateFlags,
    DEFAULT_USER_HANDLE, Handle, ItemType, Kernel, KernelObject, KeyFormat, KeyIdKind,
    KeyMgmtArgs, KeyMgmtFlags, MessageData, MessageType, ObjectType, SETDEP_INCREF, STATUS_OK,
    Subtype, SubtypeA, VALUE_UNUSED,
};
use status::{Error, Result};

type Log = Arc<Mutex<Vec<String>>>;

fn log(entries: &Log, entry: impl Into<String>) {
    entries.lock().unwrap().push(entry.into());
}

/// Minimal context body: records action payloads as its running state
/// and plays the key-extract seam.
struct TestContext {
    state: Vec<u8>,
    key: Vec<u8>,
    private_key: bool,
    loaded: bool,
    destroy_log: Option<(Log, &'static str)>,
}

impl TestContext {
    fn new() -> Self {
        Self {
            state: Vec::new(),
            key: Vec::new(),
            private_key: false,
            loaded: false,
            destroy_log: None,
        }
    }

    fn private_key() -> Self {
        Self {
            private_key: true,
            ..Self::new()
        }
    }

    fn logged(entries: &Log, name: &'static str) -> Self {
        Self {
            destroy_log: Some((Arc::clone(entries), name)),
            ..Self::new()
        }
    }
}

impl KernelObject for TestContext {
    fn handle_message(
        &mut self,
        _kernel: &Kernel,
        msg: MessageType,
        data: &mut MessageData,
        value: i32,
    ) -> Result<()> {
        match msg {
            MessageType::Destroy => {
                if let Some((entries, name)) = &self.destroy_log {
                    log(entries, *name);
                }
                self.state.clear();
                self.key.clear();
                Ok(())
            }
            MessageType::ChangeNotify => Ok(()),
            MessageType::CtxEncrypt
            | MessageType::CtxDecrypt
            | MessageType::CtxSign
            | MessageType::CtxSigCheck
            | MessageType::CtxHash => {
                if let MessageData::Bytes(bytes) = data {
                    self.state.extend_from_slice(bytes);
                }
                Ok(())
            }
            MessageType::CtxGenKey => {
                self.loaded = true;
                Ok(())
            }
            MessageType::SetAttributeData if value == Attribute::CtxKey as i32 => {
                let MessageData::Bytes(bytes) = data else {
                    return Err(Error::ArgStr1);
                };
                self.key = bytes.clone();
                self.loaded = true;
                Ok(())
            }
            MessageType::GetAttributeData if value == Attribute::CtxHashValue as i32 => {
                *data = MessageData::Bytes(self.state.clone());
                Ok(())
            }
            MessageType::SetAttribute if value == Attribute::IntInitialised as i32 => Ok(()),
            MessageType::Check => {
                if value == CheckType::PkcPrivate as i32 && self.private_key {
                    Ok(())
                } else {
                    Err(Error::PermissionDenied)
                }
            }
            _ => Err(Error::NotAvail),
        }
    }

    fn as_context(&mut self) -> Option<&mut dyn ContextContents> {
        Some(self)
    }
}

impl ContextContents for TestContext {
    fn extract_key(&self, out: &mut [u8]) -> Result<usize> {
        if self.key.is_empty() {
            return Err(Error::NotInited);
        }
        let length = self.key.len().min(out.len());
        out[..length].copy_from_slice(&self.key[..length]);
        Ok(length)
    }

    fn write_private_key(&self, _format: KeyFormat, out: &mut Vec<u8>) -> Result<()> {
        if !self.private_key {
            return Err(Error::ArgObject);
        }
        out.extend_from_slice(&self.key);
        Ok(())
    }

    fn read_private_key(&mut self, _format: KeyFormat, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::BadData);
        }
        self.key = data.to_vec();
        Ok(())
    }

    fn load_key(&mut self) -> Result<()> {
        self.loaded = true;
        Ok(())
    }

    fn copy_state_from(&mut self, source: &dyn ContextContents) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<TestContext>()
            .ok_or(Error::ArgObject)?;
        self.state = source.state.clone();
        self.key = source.key.clone();
        self.loaded = source.loaded;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Certificate body answering capability checks from a fixed list.
struct TestCert {
    allowed: Vec<CheckType>,
    checks_seen: Arc<AtomicU32>,
    destroy_log: Option<(Log, &'static str)>,
}

impl TestCert {
    fn new(allowed: &[CheckType]) -> Self {
        Self {
            allowed: allowed.to_vec(),
            checks_seen: Arc::new(AtomicU32::new(0)),
            destroy_log: None,
        }
    }

    fn logged(entries: &Log, name: &'static str, allowed: &[CheckType]) -> Self {
        Self {
            destroy_log: Some((Arc::clone(entries), name)),
            ..Self::new(allowed)
        }
    }
}

impl KernelObject for TestCert {
    fn handle_message(
        &mut self,
        _kernel: &Kernel,
        msg: MessageType,
        _data: &mut MessageData,
        value: i32,
    ) -> Result<()> {
        match msg {
            MessageType::Destroy => {
                if let Some((entries, name)) = &self.destroy_log {
                    log(entries, *name);
                }
                Ok(())
            }
            MessageType::ChangeNotify => Ok(()),
            MessageType::Check => {
                self.checks_seen.fetch_add(1, Ordering::SeqCst);
                let allowed = self
                    .allowed
                    .iter()
                    .any(|check| *check as i32 == value);
                if allowed { Ok(()) } else { Err(Error::PermissionDenied) }
            }
            MessageType::CrtSign => Ok(()),
            _ => Err(Error::NotAvail),
        }
    }
}

/// Crypto-device body; probes the shutdown gate from inside its own
/// destroy handler.
struct TestDevice {
    destroy_log: Option<(Log, &'static str)>,
    shutdown_probe: Arc<Mutex<Option<Result<()>>>>,
}

impl TestDevice {
    fn new() -> Self {
        Self {
            destroy_log: None,
            shutdown_probe: Arc::new(Mutex::new(None)),
        }
    }

    fn logged(entries: &Log, name: &'static str) -> Self {
        Self {
            destroy_log: Some((Arc::clone(entries), name)),
            shutdown_probe: Arc::new(Mutex::new(None)),
        }
    }
}

impl KernelObject for TestDevice {
    fn handle_message(
        &mut self,
        kernel: &Kernel,
        msg: MessageType,
        _data: &mut MessageData,
        _value: i32,
    ) -> Result<()> {
        match msg {
            MessageType::Destroy => {
                if let Some((entries, name)) = &self.destroy_log {
                    log(entries, *name);
                }
                // During shutdown, anything that isn't destruction must
                // bounce off the gate.
                let mut data = MessageData::Value(0);
                let probe = kernel.send_internal(
                    DEFAULT_USER_HANDLE,
                    MessageType::GetAttribute,
                    &mut data,
                    Attribute::OptionComplianceLevel as i32,
                );
                *self.shutdown_probe.lock().unwrap() = Some(probe);
                Ok(())
            }
            MessageType::ChangeNotify => Ok(()),
            MessageType::DevDerive | MessageType::DevExport | MessageType::DevImport => Ok(()),
            _ => Err(Error::NotAvail),
        }
    }
}

/// File-keyset body accepting reads and writes once the ACLs let them
/// through.
struct TestKeyset;

impl KernelObject for TestKeyset {
    fn handle_message(
        &mut self,
        _kernel: &Kernel,
        msg: MessageType,
        _data: &mut MessageData,
        _value: i32,
    ) -> Result<()> {
        match msg {
            MessageType::Destroy | MessageType::ChangeNotify => Ok(()),
            MessageType::KeyGetKey
            | MessageType::KeySetKey
            | MessageType::KeyDeleteKey => Ok(()),
            _ => Err(Error::NotAvail),
        }
    }
}

/// Body for the queue-ordering scenario: on a zero-tagged trigger it
/// sends itself two messages and a third to a peer, logging everything.
struct Recorder {
    name: &'static str,
    entries: Log,
    self_handle: Arc<AtomicU32>,
    peer: Arc<AtomicU32>,
}

impl KernelObject for Recorder {
    fn handle_message(
        &mut self,
        kernel: &Kernel,
        msg: MessageType,
        data: &mut MessageData,
        _value: i32,
    ) -> Result<()> {
        match msg {
            MessageType::Destroy | MessageType::ChangeNotify => Ok(()),
            MessageType::SetAttribute => Ok(()),
            MessageType::CtxHash => {
                let MessageData::Bytes(bytes) = data else {
                    return Err(Error::ArgStr1);
                };
                let tag = bytes[0];
                if tag == 0 {
                    log(&self.entries, format!("{}:start", self.name));
                    let own = self.self_handle.load(Ordering::Relaxed);
                    let mut m1 = MessageData::Bytes(vec![1]);
                    kernel.send_internal(own, MessageType::CtxHash, &mut m1, 1)?;
                    let mut m2 = MessageData::Bytes(vec![2]);
                    kernel.send_internal(own, MessageType::CtxHash, &mut m2, 1)?;
                    let peer = self.peer.load(Ordering::Relaxed);
                    let mut other = MessageData::Bytes(vec![9]);
                    kernel.send_internal(peer, MessageType::CtxHash, &mut other, 1)?;
                    log(&self.entries, format!("{}:end", self.name));
                } else {
                    log(&self.entries, format!("{}:{}", self.name, tag));
                }
                Ok(())
            }
            _ => Err(Error::NotAvail),
        }
    }
}

fn boot() -> Kernel {
    let kernel = Kernel::new();
    kernel.init().unwrap();
    kernel
}

/// Creates an object and completes its initialisation.
fn create(
    kernel: &Kernel,
    object_type: ObjectType,
    subtype: Subtype,
    perms: ActionPerms,
    body: Box<dyn KernelObject>,
) -> Handle {
    let handle = kernel
        .create_object(
            object_type,
            subtype,
            CreateFlags::empty(),
            Some(DEFAULT_USER_HANDLE),
            perms,
            body,
        )
        .unwrap();
    let mut status = MessageData::Value(STATUS_OK);
    kernel
        .send_internal(
            handle,
            MessageType::SetAttribute,
            &mut status,
            Attribute::IntStatus as i32,
        )
        .unwrap();
    handle
}

fn create_hash_context(kernel: &Kernel) -> Handle {
    let handle = create(
        kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_HASH),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::new()),
    );
    // Hash contexts have no key to load; the initialised attribute is
    // their transition into the high state.
    let mut unused = MessageData::Value(VALUE_UNUSED);
    kernel
        .send_internal(
            handle,
            MessageType::SetAttribute,
            &mut unused,
            Attribute::IntInitialised as i32,
        )
        .unwrap();
    handle
}

fn externalise(kernel: &Kernel, handle: Handle) {
    let mut value = MessageData::Value(0);
    kernel
        .send_internal(
            handle,
            MessageType::SetAttribute,
            &mut value,
            Attribute::IntInternal as i32,
        )
        .unwrap();
}

fn set_property(kernel: &Kernel, handle: Handle, attribute: Attribute, value: i64) -> Result<()> {
    let mut data = MessageData::Value(value);
    kernel.send_internal(handle, MessageType::SetAttribute, &mut data, attribute as i32)
}

#[test]
fn forward_count_ratchet_limits_ownership_transfers() {
    let kernel = boot();
    let context = create_hash_context(&kernel);

    set_property(&kernel, context, Attribute::PropertyForwardCount, 2).unwrap();
    // Two transfers use up the ratchet, the third is refused.
    set_property(&kernel, context, Attribute::PropertyOwner, 0x1111).unwrap();
    set_property(&kernel, context, Attribute::PropertyOwner, 0x2222).unwrap();
    assert_eq!(
        set_property(&kernel, context, Attribute::PropertyOwner, 0x3333),
        Err(Error::PermissionDenied)
    );
    kernel.shutdown().ok();
}

#[test]
fn destroy_during_init_converts_the_completion() {
    let kernel = boot();
    let handle = kernel
        .create_object(
            ObjectType::Context,
            Subtype::A(SubtypeA::CTX_HASH),
            CreateFlags::empty(),
            Some(DEFAULT_USER_HANDLE),
            ActionPerms::uniform(ActionPerm::All),
            Box::new(TestContext::new()),
        )
        .unwrap();

    // Before the creator completes initialisation, another party
    // destroys the handle; the destroy is recorded as a signal.
    let mut none = MessageData::None;
    kernel
        .send_internal(handle, MessageType::Destroy, &mut none, 0)
        .unwrap();

    // A not-yet-initialised object accepts nothing else.
    let mut probe = MessageData::Bytes(vec![0]);
    assert_eq!(
        kernel.send_internal(handle, MessageType::CtxHash, &mut probe, 1),
        Err(Error::NotInited)
    );

    // The creator's completion is converted into the deferred destroy.
    let mut status = MessageData::Value(STATUS_OK);
    assert_eq!(
        kernel.send_internal(
            handle,
            MessageType::SetAttribute,
            &mut status,
            Attribute::IntStatus as i32,
        ),
        Err(Error::SpecialCase)
    );

    // The handle no longer names an object.
    let mut late = MessageData::Bytes(vec![0]);
    assert_eq!(
        kernel.send_internal(handle, MessageType::CtxHash, &mut late, 1),
        Err(Error::ArgObject)
    );
    kernel.shutdown().ok();
}

#[test]
fn certificate_attach_composes_action_permissions() {
    let kernel = boot();
    let context = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_PKC),
        ActionPerms::NONE
            .with(Action::Encrypt, ActionPerm::All)
            .with(Action::Decrypt, ActionPerm::All)
            .with(Action::Sign, ActionPerm::All)
            .with(Action::SigCheck, ActionPerm::All),
        Box::new(TestContext::private_key()),
    );
    // Key generation drives the context into the high state.
    let mut none = MessageData::None;
    kernel
        .send_internal(context, MessageType::CtxGenKey, &mut none, 0)
        .unwrap();
    externalise(&kernel, context);

    // A signature-only certificate.
    let cert = create(
        &kernel,
        ObjectType::Certificate,
        Subtype::A(SubtypeA::CERT_CERT),
        ActionPerms::NONE,
        Box::new(TestCert::new(&[CheckType::PkcSign])),
    );

    let mut attach = MessageData::Value(i64::from(cert));
    kernel
        .send_internal(context, MessageType::SetDependent, &mut attach, SETDEP_INCREF)
        .unwrap();

    // External encrypt is refused outright.
    let mut payload = MessageData::Bytes(vec![0; 16]);
    assert_eq!(
        kernel.send(context, MessageType::CtxEncrypt, &mut payload, 16),
        Err(Error::PermissionDenied)
    );
    // Internal encrypt is also rejected: the cert didn't pass the
    // encrypt check.
    let mut payload = MessageData::Bytes(vec![0; 16]);
    assert_eq!(
        kernel.send_internal(context, MessageType::CtxEncrypt, &mut payload, 16),
        Err(Error::PermissionDenied)
    );
    // Internal sign still works.
    let mut payload = MessageData::Bytes(vec![0; 16]);
    kernel
        .send_internal(context, MessageType::CtxSign, &mut payload, 16)
        .unwrap();
    // But external sign is capped at internal-only now.
    let mut payload = MessageData::Bytes(vec![0; 16]);
    assert_eq!(
        kernel.send(context, MessageType::CtxSign, &mut payload, 16),
        Err(Error::PermissionDenied)
    );
    kernel.shutdown().ok();
}

#[test]
fn clone_is_copy_on_write() {
    let kernel = boot();
    let original = create_hash_context(&kernel);

    // Hash something before the clone so the snapshot is non-trivial.
    let mut data = MessageData::Bytes(b"abc".to_vec());
    kernel
        .send_internal(original, MessageType::CtxHash, &mut data, 3)
        .unwrap();

    let clone = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_HASH),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::new()),
    );
    let mut none = MessageData::None;
    kernel
        .send_internal(original, MessageType::Clone, &mut none, clone as i32)
        .unwrap();

    // Hashing another byte into the original forces the split first.
    let mut data = MessageData::Bytes(b"d".to_vec());
    kernel
        .send_internal(original, MessageType::CtxHash, &mut data, 1)
        .unwrap();

    // The clone still holds the clone-time state, not the post-byte
    // state.
    let mut snapshot = MessageData::Bytes(Vec::new());
    kernel
        .send_internal(
            clone,
            MessageType::GetAttributeData,
            &mut snapshot,
            Attribute::CtxHashValue as i32,
        )
        .unwrap();
    assert_eq!(snapshot, MessageData::Bytes(b"abc".to_vec()));

    let mut current = MessageData::Bytes(Vec::new());
    kernel
        .send_internal(
            original,
            MessageType::GetAttributeData,
            &mut current,
            Attribute::CtxHashValue as i32,
        )
        .unwrap();
    assert_eq!(current, MessageData::Bytes(b"abcd".to_vec()));
    kernel.shutdown().ok();
}

#[test]
fn destroying_an_aliased_original_destroys_the_clone() {
    let kernel = boot();
    let original = create_hash_context(&kernel);
    let mut data = MessageData::Bytes(b"state".to_vec());
    kernel
        .send_internal(original, MessageType::CtxHash, &mut data, 5)
        .unwrap();

    let clone = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_HASH),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::new()),
    );
    let mut none = MessageData::None;
    kernel
        .send_internal(original, MessageType::Clone, &mut none, clone as i32)
        .unwrap();

    // Destroying the original actually takes out the clone; the
    // caller's other handle now names the survivor with the original's
    // state.
    let mut none = MessageData::None;
    kernel
        .send_internal(original, MessageType::Destroy, &mut none, 0)
        .unwrap();

    let mut probe = MessageData::Bytes(vec![0]);
    assert_eq!(
        kernel.send_internal(original, MessageType::CtxHash, &mut probe, 1),
        Err(Error::ArgObject)
    );
    let mut survivor = MessageData::Bytes(Vec::new());
    kernel
        .send_internal(
            clone,
            MessageType::GetAttributeData,
            &mut survivor,
            Attribute::CtxHashValue as i32,
        )
        .unwrap();
    assert_eq!(survivor, MessageData::Bytes(b"state".to_vec()));
    kernel.shutdown().ok();
}

#[test]
fn self_messages_queue_behind_messages_to_others() {
    let kernel = boot();
    let entries: Log = Arc::new(Mutex::new(Vec::new()));
    let a_handle = Arc::new(AtomicU32::new(0));
    let b_handle = Arc::new(AtomicU32::new(0));

    let a = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_HASH),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(Recorder {
            name: "A",
            entries: Arc::clone(&entries),
            self_handle: Arc::clone(&a_handle),
            peer: Arc::clone(&b_handle),
        }),
    );
    let b = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_HASH),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(Recorder {
            name: "B",
            entries: Arc::clone(&entries),
            self_handle: Arc::clone(&b_handle),
            peer: Arc::clone(&a_handle),
        }),
    );
    a_handle.store(a, Ordering::Relaxed);
    b_handle.store(b, Ordering::Relaxed);
    for handle in [a, b] {
        let mut unused = MessageData::Value(VALUE_UNUSED);
        kernel
            .send_internal(
                handle,
                MessageType::SetAttribute,
                &mut unused,
                Attribute::IntInitialised as i32,
            )
            .unwrap();
    }

    // A's handler sends itself M1 and M2 and sends one message to B.
    let mut trigger = MessageData::Bytes(vec![0]);
    kernel
        .send_internal(a, MessageType::CtxHash, &mut trigger, 1)
        .unwrap();

    // B runs while A's handler is still inside its lock frame; the
    // self-messages run afterwards, in order.
    assert_eq!(
        *entries.lock().unwrap(),
        vec!["A:start", "B:9", "A:end", "A:1", "A:2"]
    );
    kernel.shutdown().ok();
}

#[test]
fn shutdown_destroys_by_dependency_depth() {
    let kernel = boot();
    let entries: Log = Arc::new(Mutex::new(Vec::new()));

    let device = create(
        &kernel,
        ObjectType::Device,
        Subtype::A(SubtypeA::DEV_PKCS11),
        ActionPerms::NONE,
        Box::new(TestDevice::logged(&entries, "device")),
    );
    let context = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_CONV),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::logged(&entries, "context")),
    );
    let mut attach = MessageData::Value(i64::from(device));
    kernel
        .send_internal(context, MessageType::SetDependent, &mut attach, SETDEP_INCREF)
        .unwrap();

    let cert = create(
        &kernel,
        ObjectType::Certificate,
        Subtype::A(SubtypeA::CERT_CERT),
        ActionPerms::NONE,
        Box::new(TestCert::logged(&entries, "cert", &[])),
    );
    let mut attach = MessageData::Value(i64::from(context));
    kernel
        .send_internal(cert, MessageType::SetDependent, &mut attach, SETDEP_INCREF)
        .unwrap();

    // Leftover objects make the shutdown report incomplete, and the
    // two-hop-dependent cert goes down in the wave before its one-hop
    // dependents.
    assert_eq!(kernel.shutdown(), Err(Error::Incomplete));
    assert_eq!(*entries.lock().unwrap(), vec!["cert", "context", "device"]);
}

#[test]
fn shutdown_gate_rejects_non_destroy_messages() {
    let kernel = boot();
    let device_body = TestDevice::new();
    let probe = Arc::clone(&device_body.shutdown_probe);
    let _device = create(
        &kernel,
        ObjectType::Device,
        Subtype::A(SubtypeA::DEV_PKCS11),
        ActionPerms::NONE,
        Box::new(device_body),
    );

    assert_eq!(kernel.shutdown(), Err(Error::Incomplete));
    // The device's destroy handler probed the gate mid-shutdown.
    assert_eq!(*probe.lock().unwrap(), Some(Err(Error::PermissionDenied)));
}

#[test]
fn usage_count_ratchet_exhausts() {
    let kernel = boot();
    let context = create_hash_context(&kernel);
    set_property(&kernel, context, Attribute::PropertyUsageCount, 1).unwrap();
    // The ratchet can only be set once.
    assert_eq!(
        set_property(&kernel, context, Attribute::PropertyUsageCount, 5),
        Err(Error::PermissionDenied)
    );

    let mut data = MessageData::Bytes(vec![1]);
    kernel
        .send_internal(context, MessageType::CtxHash, &mut data, 1)
        .unwrap();
    let mut data = MessageData::Bytes(vec![2]);
    assert_eq!(
        kernel.send_internal(context, MessageType::CtxHash, &mut data, 1),
        Err(Error::PermissionDenied)
    );
    kernel.shutdown().ok();
}

#[test]
fn internal_attributes_are_invisible_externally() {
    let kernel = boot();
    let context = create_hash_context(&kernel);
    externalise(&kernel, context);

    // The internal attribute range reports an argument error, exactly
    // as if the attribute id didn't exist; a permission error would
    // leak its existence.
    let mut data = MessageData::Value(0);
    assert_eq!(
        kernel.send(
            context,
            MessageType::GetAttribute,
            &mut data,
            Attribute::IntActionPerms as i32,
        ),
        Err(Error::ArgValue)
    );
    kernel.shutdown().ok();
}

#[test]
fn internal_objects_are_unreachable_externally() {
    let kernel = boot();
    let context = create_hash_context(&kernel);

    // Objects are born internal; an external message can't see them.
    let mut data = MessageData::Bytes(vec![1]);
    assert_eq!(
        kernel.send(context, MessageType::CtxHash, &mut data, 1),
        Err(Error::ArgObject)
    );
    externalise(&kernel, context);
    let mut data = MessageData::Bytes(vec![1]);
    kernel.send(context, MessageType::CtxHash, &mut data, 1).unwrap();
    kernel.shutdown().ok();
}

#[test]
fn trigger_attribute_seals_the_object() {
    let kernel = boot();
    let context = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_CONV),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::new()),
    );

    // Loading a key drives the context into the high state...
    let mut key = MessageData::Bytes(vec![0x5a; 16]);
    kernel
        .send_internal(
            context,
            MessageType::SetAttributeData,
            &mut key,
            Attribute::CtxKey as i32,
        )
        .unwrap();
    // ...after which the key can never be loaded again: the write bits
    // only exist for the low state.
    let mut key = MessageData::Bytes(vec![0xa5; 16]);
    assert_eq!(
        kernel.send_internal(
            context,
            MessageType::SetAttributeData,
            &mut key,
            Attribute::CtxKey as i32,
        ),
        Err(Error::PermissionDenied)
    );
    kernel.shutdown().ok();
}

#[test]
fn key_extract_hooks_reach_the_context_body() {
    let kernel = boot();
    let context = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_CONV),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::new()),
    );
    let mut key = MessageData::Bytes(vec![0x42; 16]);
    kernel
        .send_internal(
            context,
            MessageType::SetAttributeData,
            &mut key,
            Attribute::CtxKey as i32,
        )
        .unwrap();

    let mut out = [0u8; 32];
    let length = kernel.extract_key_data(context, &mut out).unwrap();
    assert_eq!(&out[..length], &[0x42; 16]);

    // Import loads key material and completes with the initialised
    // transition.
    let target = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_PKC),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::private_key()),
    );
    kernel
        .import_private_key_data(target, KeyFormat::Pkcs8, &[1, 2, 3])
        .unwrap();
    let exported = kernel
        .export_private_key_data(target, KeyFormat::Pkcs8)
        .unwrap();
    assert_eq!(exported, vec![1, 2, 3]);
    kernel.shutdown().ok();
}

#[test]
fn derive_mechanism_parameters_are_gated() {
    let kernel = boot();
    let device = create(
        &kernel,
        ObjectType::Device,
        Subtype::A(SubtypeA::DEV_PKCS11),
        ActionPerms::NONE,
        Box::new(TestDevice::new()),
    );

    let good = kernel::KeyDeriveArgs {
        out: vec![0; 16],
        input: vec![0; 32],
        hash_algo: kernel::algo::SHA1 as i32,
        salt: vec![0; 8],
        iterations: 1000,
    };
    let mut data = MessageData::Derive(good.clone());
    kernel
        .send_internal(
            device,
            MessageType::DevDerive,
            &mut data,
            kernel::Mechanism::Pkcs5 as i32,
        )
        .unwrap();

    // An out-of-range salt never reaches the device.
    let mut bad = good;
    bad.salt = vec![0; 2];
    let mut data = MessageData::Derive(bad);
    assert_eq!(
        kernel.send_internal(
            device,
            MessageType::DevDerive,
            &mut data,
            kernel::Mechanism::Pkcs5 as i32,
        ),
        Err(Error::ArgStr1)
    );
    kernel.shutdown().ok();
}

#[test]
fn private_key_writes_to_keysets_need_a_password() {
    let kernel = boot();
    let keyset = create(
        &kernel,
        ObjectType::Keyset,
        Subtype::A(SubtypeA::KEYSET_FILE),
        ActionPerms::NONE,
        Box::new(TestKeyset),
    );
    let context = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_PKC),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::private_key()),
    );
    let mut none = MessageData::None;
    kernel
        .send_internal(context, MessageType::CtxGenKey, &mut none, 0)
        .unwrap();

    let args = KeyMgmtArgs {
        object: Some(context),
        id_kind: KeyIdKind::None,
        key_id: Vec::new(),
        aux_info: None,
        flags: KeyMgmtFlags::empty(),
    };

    // No password: refused before the keyset sees it.
    let mut data = MessageData::KeyMgmt(args.clone());
    assert_eq!(
        kernel.send_internal(
            keyset,
            MessageType::KeySetKey,
            &mut data,
            ItemType::PrivateKey as i32,
        ),
        Err(Error::ArgStr1)
    );

    // With a password the write goes through.
    let mut with_password = args;
    with_password.aux_info = Some(b"password".to_vec());
    let mut data = MessageData::KeyMgmt(with_password);
    kernel
        .send_internal(
            keyset,
            MessageType::KeySetKey,
            &mut data,
            ItemType::PrivateKey as i32,
        )
        .unwrap();
    kernel.shutdown().ok();
}

#[test]
fn messages_route_through_the_dependency_chain() {
    let kernel = boot();
    let context = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_PKC),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::private_key()),
    );
    let mut none = MessageData::None;
    kernel
        .send_internal(context, MessageType::CtxGenKey, &mut none, 0)
        .unwrap();
    let cert = create(
        &kernel,
        ObjectType::Certificate,
        Subtype::A(SubtypeA::CERT_CERT),
        ActionPerms::NONE,
        Box::new(TestCert::new(&[CheckType::PkcSign, CheckType::PkcSigCheck])),
    );
    let mut attach = MessageData::Value(i64::from(cert));
    kernel
        .send_internal(context, MessageType::SetDependent, &mut attach, SETDEP_INCREF)
        .unwrap();

    // A context action sent to the certificate routes through to the
    // attached context.
    let mut payload = MessageData::Bytes(vec![0; 16]);
    kernel
        .send_internal(cert, MessageType::CtxSign, &mut payload, 16)
        .unwrap();

    // The dependent is discoverable through the kernel as well.
    let mut lookup = MessageData::Value(0);
    kernel
        .send_internal(
            cert,
            MessageType::GetDependent,
            &mut lookup,
            ObjectType::Context as i32,
        )
        .unwrap();
    assert_eq!(lookup.value(), Some(i64::from(context)));
    kernel.shutdown().ok();
}

#[test]
fn reference_counting_cascades_to_dependents() {
    let kernel = boot();
    let device = create(
        &kernel,
        ObjectType::Device,
        Subtype::A(SubtypeA::DEV_PKCS11),
        ActionPerms::NONE,
        Box::new(TestDevice::new()),
    );
    let context = create(
        &kernel,
        ObjectType::Context,
        Subtype::A(SubtypeA::CTX_CONV),
        ActionPerms::uniform(ActionPerm::All),
        Box::new(TestContext::new()),
    );
    let mut attach = MessageData::Value(i64::from(device));
    kernel
        .send_internal(context, MessageType::SetDependent, &mut attach, SETDEP_INCREF)
        .unwrap();

    // Destroying the context drops the reference it held on the device;
    // the device's own reference then dies with a decrement.
    let mut none = MessageData::None;
    kernel
        .send_internal(context, MessageType::Destroy, &mut none, 0)
        .unwrap();
    let mut none = MessageData::None;
    kernel
        .send_internal(device, MessageType::DecRefCount, &mut none, 0)
        .unwrap();
    let mut probe = MessageData::Value(0);
    assert_eq!(
        kernel.send_internal(
            device,
            MessageType::GetAttribute,
            &mut probe,
            Attribute::IntType as i32,
        ),
        Err(Error::ArgObject)
    );
    kernel.shutdown().ok();
}

#[test]
fn dependency_cycles_are_refused() {
    let kernel = boot();
    let first = create_hash_context(&kernel);
    let second = create_hash_context(&kernel);

    let mut attach = MessageData::Value(i64::from(second));
    kernel
        .send_internal(first, MessageType::SetDependent, &mut attach, SETDEP_INCREF)
        .unwrap();
    // The reverse attachment would create a two-cycle.
    let mut back = MessageData::Value(i64::from(first));
    assert_eq!(
        kernel.send_internal(second, MessageType::SetDependent, &mut back, SETDEP_INCREF),
        Err(Error::ArgValue)
    );
    kernel.shutdown().ok();
}

#[test]
fn messages_to_a_claimed_object_defer_until_release() {
    let kernel = boot();
    let body = TestCert::new(&[CheckType::PkcSign]);
    let checks = Arc::clone(&body.checks_seen);
    let cert = create(
        &kernel,
        ObjectType::Certificate,
        Subtype::A(SubtypeA::CERT_CERT),
        ActionPerms::NONE,
        Box::new(body),
    );

    {
        let _claim = kernel.get_object(cert, ObjectType::Certificate).unwrap();
        // The claim holds the object's busy lock, so the message parks
        // on the queue; the sender sees success immediately.
        let mut none = MessageData::None;
        kernel
            .send_internal(cert, MessageType::Check, &mut none, CheckType::PkcSign as i32)
            .unwrap();
        assert_eq!(checks.load(Ordering::SeqCst), 0);
    }
    // Releasing the claim exits the lock frame and runs the deferred
    // message.
    assert_eq!(checks.load(Ordering::SeqCst), 1);
    kernel.shutdown().ok();
}

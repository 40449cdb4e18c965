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

//! Object descriptors and the information the kernel keeps for every
//! object it mediates.
//!
//! Objects are identified externally by a [`Handle`] and internally by a
//! table slot holding an [`ObjectInfo`] descriptor.  The descriptor owns
//! the object's opaque body (its subsystem-private state) and all of the
//! security-relevant metadata: type, subtype, flags, action permissions,
//! reference count, busy lock, ratchets, and the owner/dependent handles
//! that make up the dependency graph.

pub mod table;

use core::any::Any;
use std::thread::ThreadId;

use bitflags::bitflags;
use status::Result;

use crate::Kernel;
use crate::message::{MessageData, MessageType};

/// Handle identifying an object to external callers.  The zero value
/// never names an object, so a zero-initialised handle field is always
/// invalid.
pub type Handle = u32;

/// Handle of the root system device.
pub const SYSTEM_OBJECT_HANDLE: Handle = 1;
/// Handle of the default user object.
pub const DEFAULT_USER_HANDLE: Handle = 2;
/// First handle available for normal allocation; everything below this
/// is a fixed-handle system object (or the reserved zero slot).
pub const FIRST_DYNAMIC_HANDLE: Handle = 3;

/// Coarse object types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ObjectType {
    None = 0,
    Context = 1,
    Keyset = 2,
    Envelope = 3,
    Certificate = 4,
    Device = 5,
    Session = 6,
    User = 7,
}

impl ObjectType {
    pub(crate) fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Context),
            2 => Some(Self::Keyset),
            3 => Some(Self::Envelope),
            4 => Some(Self::Certificate),
            5 => Some(Self::Device),
            6 => Some(Self::Session),
            7 => Some(Self::User),
            _ => None,
        }
    }
}

bitflags! {
    /// Fine-grained subtypes for class-A objects: contexts, certificates,
    /// keysets and devices.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SubtypeA: u32 {
        const CTX_CONV = 1 << 0;
        const CTX_PKC = 1 << 1;
        const CTX_HASH = 1 << 2;
        const CTX_MAC = 1 << 3;

        const CERT_CERT = 1 << 4;
        const CERT_CERTREQ = 1 << 5;
        const CERT_REQ_CERT = 1 << 6;
        const CERT_REQ_REV = 1 << 7;
        const CERT_CERTCHAIN = 1 << 8;
        const CERT_ATTRCERT = 1 << 9;
        const CERT_CRL = 1 << 10;
        const CERT_CMSATTR = 1 << 11;
        const CERT_RTCS_REQ = 1 << 12;
        const CERT_RTCS_RESP = 1 << 13;
        const CERT_OCSP_REQ = 1 << 14;
        const CERT_OCSP_RESP = 1 << 15;
        const CERT_PKIUSER = 1 << 16;

        const KEYSET_FILE = 1 << 17;
        const KEYSET_FILE_PARTIAL = 1 << 18;
        const KEYSET_DBMS = 1 << 19;
        const KEYSET_DBMS_STORE = 1 << 20;
        const KEYSET_HTTP = 1 << 21;
        const KEYSET_LDAP = 1 << 22;

        const DEV_SYSTEM = 1 << 23;
        const DEV_PKCS11 = 1 << 24;
        const DEV_CRYPTOAPI = 1 << 25;

        const CTX_ANY = Self::CTX_CONV.bits() | Self::CTX_PKC.bits()
            | Self::CTX_HASH.bits() | Self::CTX_MAC.bits();
        const CERT_ANY_CERT = Self::CERT_CERT.bits() | Self::CERT_CERTREQ.bits()
            | Self::CERT_REQ_CERT.bits() | Self::CERT_CERTCHAIN.bits();
        const CERT_ANY = Self::CERT_ANY_CERT.bits() | Self::CERT_REQ_REV.bits()
            | Self::CERT_ATTRCERT.bits() | Self::CERT_CRL.bits()
            | Self::CERT_CMSATTR.bits() | Self::CERT_RTCS_REQ.bits()
            | Self::CERT_RTCS_RESP.bits() | Self::CERT_OCSP_REQ.bits()
            | Self::CERT_OCSP_RESP.bits() | Self::CERT_PKIUSER.bits();
        const KEYSET_ANY = Self::KEYSET_FILE.bits() | Self::KEYSET_FILE_PARTIAL.bits()
            | Self::KEYSET_DBMS.bits() | Self::KEYSET_DBMS_STORE.bits()
            | Self::KEYSET_HTTP.bits() | Self::KEYSET_LDAP.bits();
        const DEV_ANY = Self::DEV_SYSTEM.bits() | Self::DEV_PKCS11.bits()
            | Self::DEV_CRYPTOAPI.bits();
        // Standard crypto devices, i.e. everything except the built-in
        // system device.
        const DEV_ANY_STD = Self::DEV_PKCS11.bits() | Self::DEV_CRYPTOAPI.bits();
    }
}

bitflags! {
    /// Fine-grained subtypes for class-B objects: envelopes, sessions and
    /// users.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SubtypeB: u32 {
        const ENV_ENV = 1 << 0;
        const ENV_ENV_PGP = 1 << 1;
        const ENV_DEENV = 1 << 2;

        const SESS_SSH = 1 << 3;
        const SESS_SSL = 1 << 4;
        const SESS_RTCS = 1 << 5;
        const SESS_OCSP = 1 << 6;
        const SESS_TSP = 1 << 7;
        const SESS_CMP = 1 << 8;
        const SESS_SCEP = 1 << 9;

        const USER_NORMAL = 1 << 10;
        const USER_SO = 1 << 11;
        const USER_CA = 1 << 12;

        const ENV_ANY = Self::ENV_ENV.bits() | Self::ENV_ENV_PGP.bits()
            | Self::ENV_DEENV.bits();
        const SESS_ANY = Self::SESS_SSH.bits() | Self::SESS_SSL.bits()
            | Self::SESS_RTCS.bits() | Self::SESS_OCSP.bits()
            | Self::SESS_TSP.bits() | Self::SESS_CMP.bits()
            | Self::SESS_SCEP.bits();
        // Sessions with a data-transport interface.
        const SESS_ANY_DATA = Self::SESS_SSH.bits() | Self::SESS_SSL.bits();
        const USER_ANY = Self::USER_NORMAL.bits() | Self::USER_SO.bits()
            | Self::USER_CA.bits();
        // The default user acts as both a normal user and an SO, the one
        // permitted composite subtype.
        const USER_DEFAULT = Self::USER_NORMAL.bits() | Self::USER_SO.bits();
    }
}

/// An object's subtype: one bit within one of the two subtype classes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Subtype {
    A(SubtypeA),
    B(SubtypeB),
}

impl Subtype {
    /// A subtype mask pair matches an object if the object's bit is
    /// within the mask for its class.
    #[must_use]
    pub fn matches(self, mask_a: SubtypeA, mask_b: SubtypeB) -> bool {
        match self {
            Subtype::A(bits) => !bits.is_empty() && mask_a.contains(bits),
            Subtype::B(bits) => !bits.is_empty() && mask_b.contains(bits),
        }
    }

    /// Whether this is a legal subtype for a newly created object:
    /// exactly one bit, or the composite default-user subtype.
    #[must_use]
    pub fn is_valid_for_create(self) -> bool {
        match self {
            Subtype::A(bits) => bits.bits().count_ones() == 1,
            Subtype::B(bits) => {
                bits.bits().count_ones() == 1 || bits == SubtypeB::USER_DEFAULT
            }
        }
    }

    pub(crate) fn empty() -> Self {
        Subtype::A(SubtypeA::empty())
    }
}

bitflags! {
    /// Per-object state flags.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ObjectFlags: u16 {
        /// Only reachable through internal messages.
        const INTERNAL = 1 << 0;
        /// Created but not yet driven to its usable state.
        const NOT_INITED = 1 << 1;
        /// In the high (sealed/keyed/signed) state.
        const HIGH = 1 << 2;
        /// Destroyed but still referenced.
        const SIGNALLED = 1 << 3;
        /// A long asynchronous operation is in progress.
        const BUSY = 1 << 4;
        /// One half of a copy-on-write pair.
        const ALIASED = 1 << 5;
        /// The aliased object that is the (incomplete) clone.
        const CLONE = 1 << 6;
        /// Bound to a single thread.
        const OWNED = 1 << 7;
        /// Security properties can no longer be modified.
        const ATTR_LOCKED = 1 << 8;

        const STATUS_MASK = Self::NOT_INITED.bits() | Self::SIGNALLED.bits()
            | Self::BUSY.bits();
    }
}

/// The actions a context can perform, each gated by a two-bit permission
/// in the descriptor's action-permission word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Action {
    Encrypt = 0,
    Decrypt = 1,
    Sign = 2,
    SigCheck = 3,
    Hash = 4,
    GenerateKey = 5,
    KeyExchange = 6,
}

pub(crate) const ACTION_COUNT: usize = 7;

impl Action {
    /// The action gated by an action message, if the message is one.
    pub(crate) fn from_message(msg: MessageType) -> Option<Self> {
        match msg {
            MessageType::CtxEncrypt => Some(Self::Encrypt),
            MessageType::CtxDecrypt => Some(Self::Decrypt),
            MessageType::CtxSign => Some(Self::Sign),
            MessageType::CtxSigCheck => Some(Self::SigCheck),
            MessageType::CtxHash => Some(Self::Hash),
            MessageType::CtxGenKey => Some(Self::GenerateKey),
            _ => None,
        }
    }
}

/// Permission level for one action.  Lower values are more restrictive;
/// like protection rings, level 3 is all-access and level 0 is
/// not-available.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ActionPerm {
    NotAvailable = 0,
    None = 1,
    InternalOnly = 2,
    All = 3,
}

impl ActionPerm {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x3 {
            0 => Self::NotAvailable,
            1 => Self::None,
            2 => Self::InternalOnly,
            _ => Self::All,
        }
    }
}

/// The per-object action-permission word: a two-bit [`ActionPerm`] for
/// each [`Action`].  Updates ratchet downwards only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ActionPerms(u16);

impl ActionPerms {
    /// Everything not-available.
    pub const NONE: Self = Self(0);

    /// The same permission for every action.
    #[must_use]
    pub const fn uniform(perm: ActionPerm) -> Self {
        let mut word = 0;
        let mut i = 0;
        while i < ACTION_COUNT {
            word |= (perm as u16) << (i * 2);
            i += 1;
        }
        Self(word)
    }

    /// Builder for the compile-time permission templates.
    #[must_use]
    pub const fn with(self, action: Action, perm: ActionPerm) -> Self {
        let shift = (action as usize) * 2;
        Self((self.0 & !(0x3 << shift)) | ((perm as u16) << shift))
    }

    #[must_use]
    pub fn get(self, action: Action) -> ActionPerm {
        ActionPerm::from_bits(self.0 >> ((action as usize) * 2))
    }

    /// Pointwise minimum with `new`: each field is replaced only where
    /// the incoming field is more restrictive, so the word can never
    /// become more permissive.
    #[must_use]
    pub fn tightened(self, new: ActionPerms) -> ActionPerms {
        let mut word = 0;
        for i in 0..ACTION_COUNT {
            let shift = i * 2;
            let current = (self.0 >> shift) & 0x3;
            let incoming = (new.0 >> shift) & 0x3;
            word |= current.min(incoming) << shift;
        }
        ActionPerms(word)
    }

    /// Caps every field at internal-only; fields already more
    /// restrictive are left alone.
    #[must_use]
    pub fn capped_at_internal(self) -> ActionPerms {
        self.tightened(Self::uniform(ActionPerm::InternalOnly))
    }

    /// True if no field of `self` exceeds the corresponding field of
    /// `other`.
    #[must_use]
    pub fn is_at_most(self, other: ActionPerms) -> bool {
        (0..ACTION_COUNT).all(|i| {
            let shift = i * 2;
            ((self.0 >> shift) & 0x3) <= ((other.0 >> shift) & 0x3)
        })
    }

    pub(crate) fn from_raw(raw: i64) -> Option<Self> {
        u16::try_from(raw).ok().filter(|w| *w < (1 << (ACTION_COUNT * 2))).map(Self)
    }

    pub(crate) fn raw(self) -> i64 {
        i64::from(self.0)
    }
}

impl Default for ActionPerms {
    fn default() -> Self {
        Self::NONE
    }
}

bitflags! {
    /// Flags accepted by [`Kernel::create_object`].
    ///
    /// [`Kernel::create_object`]: crate::Kernel::create_object
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct CreateFlags: u8 {
        /// The body keeps key material and should place it in the secure
        /// heap.
        const SECURE = 1 << 0;
        /// Dummy object for capability queries; never dispatched to.
        const DUMMY = 1 << 1;
    }
}

/// Trait implemented by every object body the kernel manages.  The
/// single dispatch method is the only way a message reaches an object;
/// it is always invoked with the object marked busy and the object table
/// unlocked.
pub trait KernelObject: Any + Send {
    /// Process one message.  `data` carries the message payload in and
    /// any reply out; `value` is the message's numeric parameter, already
    /// validated against the message's parameter shape and ACLs.
    fn handle_message(
        &mut self,
        kernel: &Kernel,
        msg: MessageType,
        data: &mut MessageData,
        value: i32,
    ) -> Result<()>;

    /// Narrow seam used by the key-extract trust hooks and the
    /// copy-on-write resolver.  Only context bodies return `Some`.
    fn as_context(&mut self) -> Option<&mut dyn ContextContents> {
        None
    }
}

/// Encoding used when private-key material crosses the context boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyFormat {
    Der,
    Pkcs8,
    Pgp,
}

/// The interface the kernel requires from a context body in order to
/// implement the four key-extract trust hooks and copy-on-write cloning.
/// These are the only routes by which raw key material leaves a context.
pub trait ContextContents {
    /// Copies the loaded session key into `out`, returning its length.
    fn extract_key(&self, out: &mut [u8]) -> Result<usize>;

    /// Serialises the private key in the given format.
    fn write_private_key(&self, format: KeyFormat, out: &mut Vec<u8>) -> Result<()>;

    /// Loads private-key components from their serialised form.  The
    /// kernel completes the import by calling [`load_key`].
    ///
    /// [`load_key`]: ContextContents::load_key
    fn read_private_key(&mut self, format: KeyFormat, data: &[u8]) -> Result<()>;

    /// Internal key load using components already present in the context.
    fn load_key(&mut self) -> Result<()>;

    /// Shallow state copy for copy-on-write resolution.  `source` is
    /// always a body of the same concrete type.
    fn copy_state_from(&mut self, source: &dyn ContextContents) -> Result<()>;

    /// Concrete-type escape hatch for [`copy_state_from`] implementations.
    ///
    /// [`copy_state_from`]: ContextContents::copy_state_from
    fn as_any(&self) -> &dyn Any;
}

/// The information maintained by the kernel for each object.
pub(crate) struct ObjectInfo {
    /// Object type and value.
    pub object_type: ObjectType,
    pub subtype: Subtype,
    pub body: Option<Box<dyn KernelObject>>,

    /// Object properties.
    pub flags: ObjectFlags,
    pub action_perms: ActionPerms,
    pub ref_count: i32,
    pub lock_count: u32,
    pub lock_owner: Option<ThreadId>,
    pub unique_id: u64,

    /// Object security properties.  `None` ratchet values mean
    /// unlimited.  The owner is a thread token (see
    /// `attribute::thread_token`) rather than a raw thread id so that it
    /// can round-trip through the numeric owner property.
    pub forward_count: Option<i32>,
    pub usage_count: Option<i32>,
    pub object_owner: Option<u64>,

    /// Owning and dependent objects.
    pub owner: Option<Handle>,
    pub dependent_object: Option<Handle>,
    pub dependent_device: Option<Handle>,
    pub clone_peer: Option<Handle>,
}

impl ObjectInfo {
    /// The template every new descriptor starts from: internal and
    /// not-inited, everything else cleared.
    pub(crate) fn cleared() -> Self {
        Self {
            object_type: ObjectType::None,
            subtype: Subtype::empty(),
            body: None,
            flags: ObjectFlags::INTERNAL | ObjectFlags::NOT_INITED,
            action_perms: ActionPerms::NONE,
            ref_count: 0,
            lock_count: 0,
            lock_owner: None,
            unique_id: 0,
            forward_count: None,
            usage_count: None,
            object_owner: None,
            owner: None,
            dependent_object: None,
            dependent_device: None,
            clone_peer: None,
        }
    }

    pub(crate) fn is_occupied(&self) -> bool {
        self.body.is_some()
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.flags.contains(ObjectFlags::INTERNAL)
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.lock_count > 0
    }

    pub(crate) fn is_owned_by_current_thread(&self) -> bool {
        self.lock_owner == Some(std::thread::current().id())
    }

    pub(crate) fn is_in_high_state(&self) -> bool {
        self.flags.contains(ObjectFlags::HIGH)
    }

    pub(crate) fn in_invalid_state(&self) -> bool {
        self.flags.intersects(ObjectFlags::STATUS_MASK)
    }

    /// Thread-binding check: if the object is bound to a thread, only
    /// that thread may address it externally.
    pub(crate) fn thread_access_ok(&self) -> bool {
        !self.flags.contains(ObjectFlags::OWNED)
            || self.object_owner == Some(crate::attribute::thread_token())
    }

    /// Turns an abnormal state flagged on the object into a status code,
    /// prioritised not-inited > signalled > busy.
    pub(crate) fn status_error(&self) -> status::Error {
        if self.flags.contains(ObjectFlags::NOT_INITED) {
            status::Error::NotInited
        } else if self.flags.contains(ObjectFlags::SIGNALLED) {
            status::Error::Signalled
        } else {
            debug_assert!(self.flags.contains(ObjectFlags::BUSY));
            status::Error::Timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtype_matching_respects_class() {
        let sub = Subtype::A(SubtypeA::CTX_PKC);
        assert!(sub.matches(SubtypeA::CTX_ANY, SubtypeB::empty()));
        assert!(!sub.matches(SubtypeA::CERT_ANY, SubtypeB::empty()));
        // A class-B mask never matches a class-A subtype even when the
        // raw bit patterns overlap.
        let env = Subtype::B(SubtypeB::ENV_ENV);
        assert!(!env.matches(SubtypeA::CTX_CONV, SubtypeB::empty()));
        assert!(env.matches(SubtypeA::empty(), SubtypeB::ENV_ANY));
    }

    #[test]
    fn create_subtype_must_be_single_bit() {
        assert!(Subtype::A(SubtypeA::CTX_HASH).is_valid_for_create());
        assert!(!Subtype::A(SubtypeA::CTX_ANY).is_valid_for_create());
        assert!(!Subtype::A(SubtypeA::empty()).is_valid_for_create());
        // The one composite exception.
        assert!(Subtype::B(SubtypeB::USER_DEFAULT).is_valid_for_create());
        assert!(!Subtype::B(SubtypeB::USER_ANY).is_valid_for_create());
    }

    #[test]
    fn action_perms_ratchet_down_only() {
        let perms = ActionPerms::uniform(ActionPerm::All)
            .with(Action::Hash, ActionPerm::InternalOnly);
        // Trying to raise hash back to All has no effect; lowering
        // encrypt works.
        let update = ActionPerms::uniform(ActionPerm::All)
            .with(Action::Encrypt, ActionPerm::None);
        let tightened = perms.tightened(update);
        assert_eq!(tightened.get(Action::Hash), ActionPerm::InternalOnly);
        assert_eq!(tightened.get(Action::Encrypt), ActionPerm::None);
        assert_eq!(tightened.get(Action::Sign), ActionPerm::All);
        assert!(tightened.is_at_most(perms));
    }

    #[test]
    fn capped_at_internal_never_raises() {
        let perms = ActionPerms::NONE.with(Action::Sign, ActionPerm::All)
            .with(Action::Encrypt, ActionPerm::None);
        let capped = perms.capped_at_internal();
        assert_eq!(capped.get(Action::Sign), ActionPerm::InternalOnly);
        assert_eq!(capped.get(Action::Encrypt), ActionPerm::None);
        assert_eq!(capped.get(Action::Hash), ActionPerm::NotAvailable);
    }

    #[test]
    fn action_perm_raw_roundtrip() {
        let perms = ActionPerms::uniform(ActionPerm::InternalOnly);
        assert_eq!(ActionPerms::from_raw(perms.raw()), Some(perms));
        assert_eq!(ActionPerms::from_raw(1 << 14), None);
        assert_eq!(ActionPerms::from_raw(-1), None);
    }

    #[test]
    fn cleared_descriptor_matches_template() {
        let info = ObjectInfo::cleared();
        assert_eq!(info.object_type, ObjectType::None);
        assert_eq!(info.flags, ObjectFlags::INTERNAL | ObjectFlags::NOT_INITED);
        assert!(!info.is_occupied());
        assert_eq!(info.action_perms, ActionPerms::NONE);
        assert_eq!(info.forward_count, None);
        assert_eq!(info.usage_count, None);
        assert_eq!(info.owner, None);
        assert_eq!(info.dependent_object, None);
        assert_eq!(info.dependent_device, None);
    }
}

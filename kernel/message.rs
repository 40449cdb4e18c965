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

//! Message types and payloads.
//!
//! Every operation on every object is a message
//! `send(handle, message type, data, value)`.  The data parameter is an
//! owned [`MessageData`] payload so that a message deferred onto the
//! kernel's queue can outlive its sender's stack frame; replies are
//! written back into the same payload.  The numeric `value` parameter is
//! interpreted per message type according to the parameter-shape tag in
//! the message-handling table.

use bitflags::bitflags;

use crate::object::Handle;

/// The message types the kernel dispatches.  The discriminant doubles as
/// the index into the message-handling table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum MessageType {
    /// Destroy the object.
    Destroy = 1,
    /// Increment the object's reference count.
    IncRefCount = 2,
    /// Decrement the object's reference count.
    DecRefCount = 3,
    /// Get a dependent object of a given type.
    GetDependent = 4,
    /// Set a dependent object (e.g. attach a cert to a context).
    SetDependent = 5,
    /// Clone the object (contexts only, copy-on-write).
    Clone = 6,

    /// Get a numeric attribute.
    GetAttribute = 7,
    /// Get a data attribute.
    GetAttributeData = 8,
    /// Set a numeric attribute.
    SetAttribute = 9,
    /// Set a data attribute.
    SetAttributeData = 10,
    /// Delete an attribute.
    DeleteAttribute = 11,

    /// Compare the object with a value or another object.
    Compare = 12,
    /// Check the object's suitability for an operation.
    Check = 13,
    /// Kernel-to-object status-change notification; never sent by
    /// callers.
    ChangeNotify = 14,

    CtxEncrypt = 15,
    CtxDecrypt = 16,
    CtxSign = 17,
    CtxSigCheck = 18,
    CtxHash = 19,
    CtxGenKey = 20,
    CtxGenIv = 21,

    CrtSign = 22,
    CrtSigCheck = 23,
    CrtExport = 24,

    DevQueryCapability = 25,
    /// Key wrap via a mechanism.
    DevExport = 26,
    /// Key unwrap via a mechanism.
    DevImport = 27,
    DevSign = 28,
    DevSigCheck = 29,
    DevDerive = 30,
    DevCreateObject = 31,

    EnvPushData = 32,
    EnvPopData = 33,

    KeyGetKey = 34,
    KeySetKey = 35,
    KeyDeleteKey = 36,
    KeyGetFirst = 37,
    KeyGetNext = 38,
}

pub(crate) const MESSAGE_COUNT: usize = MessageType::KeyGetNext as usize + 1;

impl MessageType {
    pub(crate) fn is_attribute_message(self) -> bool {
        matches!(
            self,
            Self::GetAttribute
                | Self::GetAttributeData
                | Self::SetAttribute
                | Self::SetAttributeData
                | Self::DeleteAttribute
        )
    }

    /// Messages that carry an object handle in the value parameter and
    /// have a parameter ACL.
    pub(crate) fn is_param_message(self) -> bool {
        matches!(self, Self::CrtSign | Self::CrtSigCheck)
    }

    /// Messages that run a context action and so are gated by the
    /// action-permission word.
    pub(crate) fn is_action_message(self) -> bool {
        matches!(
            self,
            Self::CtxEncrypt
                | Self::CtxDecrypt
                | Self::CtxSign
                | Self::CtxSigCheck
                | Self::CtxHash
                | Self::CtxGenKey
        )
    }
}

/// A message with its source marked: internal messages originate inside
/// the library and may reach internal objects and internal attributes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Msg {
    pub kind: MessageType,
    pub internal: bool,
}

/// Owned message payload.  `None` is used for messages whose parameter
/// shape carries no data.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum MessageData {
    #[default]
    None,
    /// Numeric value, in or out: attribute values, booleans, object
    /// handles.
    Value(i64),
    /// Byte-string value, in or out: data attributes, action payloads,
    /// compare operands, enveloped data.
    Bytes(Vec<u8>),
    /// Time value in seconds since the epoch.
    Time(i64),
    /// Key wrap/unwrap mechanism parameters.
    Wrap(KeyWrapArgs),
    /// Sign/sig-check mechanism parameters.
    Sign(KeySignArgs),
    /// Key-derivation mechanism parameters.
    Derive(KeyDeriveArgs),
    /// Keyset access parameters.
    KeyMgmt(KeyMgmtArgs),
    /// Object-creation parameters.
    Create(CreateArgs),
}

impl MessageData {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The reply value of a numeric get, if one was produced.
    #[must_use]
    pub fn value(&self) -> Option<i64> {
        match self {
            Self::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// Parameters for the key wrap/unwrap mechanisms (`DevExport` /
/// `DevImport`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyWrapArgs {
    /// Wrapped key: output for export, input for import.  Left empty on
    /// export to query the required length.
    pub wrapped_data: Vec<u8>,
    /// Raw data for the raw-wrap mechanisms.
    pub key_data: Vec<u8>,
    /// Context holding (or to hold) the session key.  Unused for raw
    /// mechanisms.
    pub key_context: Option<Handle>,
    /// The wrapping/unwrapping key.
    pub wrap_context: Option<Handle>,
    /// Auxiliary context (KEA only).
    pub aux_context: Option<Handle>,
}

/// Parameters for the sign/sig-check mechanisms (`DevSign` /
/// `DevSigCheck`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeySignArgs {
    /// Signature: output for sign (empty = length query), input for
    /// check.
    pub signature: Vec<u8>,
    pub hash_context: Option<Handle>,
    pub sign_context: Option<Handle>,
}

/// Parameters for the key-derivation mechanisms (`DevDerive`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyDeriveArgs {
    /// Output keying material, pre-sized to the requested length.
    pub out: Vec<u8>,
    /// Input keying material.
    pub input: Vec<u8>,
    /// Hash algorithm identifier; `USE_DEFAULT_ALGO` selects the
    /// mechanism's fixed algorithm.
    pub hash_algo: i32,
    pub salt: Vec<u8>,
    pub iterations: i32,
}

/// Placeholder algorithm value for mechanisms with a fixed or composite
/// hash (the SSL/TLS dual hash).
pub const USE_DEFAULT_ALGO: i32 = -100;

bitflags! {
    /// Option flags in keyset-access parameters.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct KeyMgmtFlags: u16 {
        /// Check for presence only, don't instantiate.
        const CHECK_ONLY = 1 << 0;
        /// Read the key label only.
        const LABEL_ONLY = 1 << 1;
        /// Update an existing entry in place.
        const UPDATE = 1 << 2;
        /// Fetch the issuer of the given object.
        const GET_ISSUER = 1 << 3;
        /// Prefer the encryption-usage key.
        const USAGE_CRYPT = 1 << 4;
        /// Prefer the signing-usage key.
        const USAGE_SIGN = 1 << 5;

        const USAGE_MASK = Self::USAGE_CRYPT.bits() | Self::USAGE_SIGN.bits();
        const CERT_OPTIONS = Self::USAGE_MASK.bits() | Self::GET_ISSUER.bits();
    }
}

/// How the key ID in keyset-access parameters is interpreted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum KeyIdKind {
    #[default]
    None,
    Name,
    Uri,
    KeyId,
    IssuerAndSerial,
}

/// Parameters for the keyset-access messages (`KeyGetKey` .. `KeyGetNext`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyMgmtArgs {
    /// Object read from or written to the keyset.
    pub object: Option<Handle>,
    pub id_kind: KeyIdKind,
    pub key_id: Vec<u8>,
    /// Password or other auxiliary data; for getFirst/getNext, the
    /// presence of this field marks externally-held iteration state.
    pub aux_info: Option<Vec<u8>>,
    pub flags: KeyMgmtFlags,
}

/// Parameters for `DevCreateObject`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateArgs {
    /// Handle of the created object, written by the device.
    pub handle: Option<Handle>,
    /// Owner for the created object; filled in by the kernel's
    /// pre-dispatch from the device the message was sent through.
    pub owner: Option<Handle>,
    pub arg1: i32,
    pub arg2: i32,
    pub str_arg: Vec<u8>,
}

/// Comparison selectors for `Compare`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum CompareType {
    Hash = 1,
    KeyId = 2,
    KeyIdPgp = 3,
    KeyIdOpenPgp = 4,
    Subject = 5,
    IssuerAndSerialNumber = 6,
    Fingerprint = 7,
    CertObject = 8,
}

impl CompareType {
    pub(crate) fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Hash),
            2 => Some(Self::KeyId),
            3 => Some(Self::KeyIdPgp),
            4 => Some(Self::KeyIdOpenPgp),
            5 => Some(Self::Subject),
            6 => Some(Self::IssuerAndSerialNumber),
            7 => Some(Self::Fingerprint),
            8 => Some(Self::CertObject),
            _ => None,
        }
    }
}

/// Capability selectors for `Check`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum CheckType {
    PkcPrivate = 1,
    PkcEncrypt = 2,
    PkcDecrypt = 3,
    PkcSign = 4,
    PkcSigCheck = 5,
    PkcKaExport = 6,
    PkcKaImport = 7,
}

pub(crate) const CHECK_TYPE_LAST: i32 = CheckType::PkcKaImport as i32;

impl CheckType {
    pub(crate) fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::PkcPrivate),
            2 => Some(Self::PkcEncrypt),
            3 => Some(Self::PkcDecrypt),
            4 => Some(Self::PkcSign),
            5 => Some(Self::PkcSigCheck),
            6 => Some(Self::PkcKaExport),
            7 => Some(Self::PkcKaImport),
            _ => None,
        }
    }
}

/// Export encodings for `CrtExport`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum CertFormat {
    Certificate = 1,
    CertChain = 2,
    TextCertificate = 3,
    TextCertChain = 4,
    /// Internal: SET OF certificate.
    CertSet = 5,
    /// Internal: SEQUENCE OF certificate.
    CertSequence = 6,
    /// Internal: encoded non-signed object data.
    Data = 7,
}

pub(crate) const CERT_FORMAT_LAST: i32 = CertFormat::Data as i32;

/// `SetDependent` value parameter: whether attaching also takes a
/// reference.  An existing object attached to a second owner is
/// referenced by both; a newly created object attached to its single
/// controlling object is not.
pub const SETDEP_INCREF: i32 = 1;
pub const SETDEP_NO_INCREF: i32 = 0;

/// The expected combination of the data and value parameters for each
/// message type, checked by the dispatcher before anything else looks at
/// the message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ParamShape {
    /// No data, value = 0.
    NoneNone,
    /// No data, any value.
    NoneAny,
    /// No data, boolean value.
    NoneBool,
    /// No data, value = check type.
    NoneCheckType,
    /// Data, value = 0.
    DataNone,
    /// Data, any value.
    DataAny,
    /// Data, boolean value.
    DataBool,
    /// Data, value = length >= 0.
    DataLength,
    /// Data, value = object type.
    DataObjectType,
    /// Data, value = mechanism type.
    DataMechanism,
    /// Data, value = key-management item type.
    DataItemType,
    /// Data, value = certificate format type.
    DataFormatType,
    /// Data, value = compare type.
    DataCompareType,
}

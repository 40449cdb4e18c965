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

//! Attribute ACLs.
//!
//! Attributes are uniformly numbered in contiguous per-class ranges, and
//! every attribute has exactly one compile-time ACL entry fixing which
//! object subtypes carry it, which accesses are allowed in which object
//! state from which message source, the shape and range of its value,
//! where a message manipulating it routes to, and whether setting it
//! triggers the object's transition into the high state.  The map from
//! attribute id to ACL is closed; there is no runtime registration.
//!
//! One deliberate asymmetry: an external caller touching an attribute
//! that has no external-access bits gets an argument error, exactly as
//! if the attribute did not exist.  Reporting a permission error instead
//! would leak the shape of the internal attribute space through the
//! error channel.

use bitflags::bitflags;
use status::{Error, Result};

use crate::dispatch::TableRef;
use crate::message::{Msg, MessageData, MessageType};
use crate::object::table::ObjectTable;
use crate::object::{
    ActionPerms, FIRST_DYNAMIC_HANDLE, Handle, ObjectFlags, ObjectType, SubtypeA, SubtypeB,
};

/// Attribute identifiers.  Discriminants are grouped into contiguous
/// ranges; the range bounds below must be kept in step when attributes
/// are added.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Attribute {
    // Object properties, handled inside the kernel.
    PropertyHighSecurity = 1,
    PropertyOwner = 2,
    PropertyForwardCount = 3,
    PropertyLocked = 4,
    PropertyUsageCount = 5,

    // Generic attributes.
    ErrorType = 100,
    ErrorLocus = 101,

    // Configuration options, held by user objects.
    OptionComplianceLevel = 200,
    OptionSideChannelProtection = 201,
    OptionKeyingIterations = 202,
    OptionEncrAlgo = 203,
    OptionHashAlgo = 204,

    // Context attributes.
    CtxAlgo = 300,
    CtxMode = 301,
    CtxKeySize = 302,
    CtxBlockSize = 303,
    CtxIv = 304,
    CtxKey = 305,
    CtxKeyingSalt = 306,
    CtxKeyingIterations = 307,
    CtxKeyingValue = 308,
    CtxHashValue = 309,
    CtxLabel = 310,

    // Certificate attributes.
    CertFingerprint = 400,
    CertSerialNumber = 401,
    CertSubjectName = 402,
    CertValidFrom = 403,
    CertValidTo = 404,
    CertSelfSigned = 405,
    CertImmutable = 406,
    CertKeyUsage = 407,
    CertCrlReason = 408,

    // Keyset attributes.
    KeysetQuery = 500,
    KeysetConfigData = 501,

    // Device attributes.
    DevInitialise = 600,
    DevAuthentUser = 601,
    DevAuthentSupervisor = 602,

    // Envelope attributes.
    EnvDataSize = 700,
    EnvCompression = 701,
    EnvContentType = 702,
    EnvPassword = 703,
    EnvSignature = 704,

    // Session attributes.
    SessActive = 800,
    SessServerName = 801,
    SessServerPort = 802,
    SessUsername = 803,
    SessPassword = 804,

    // User attributes.
    UserPassword = 900,
    UserCaCertificate = 901,

    // Internal attributes; no external-access bits anywhere in this
    // range.
    IntType = 1000,
    IntSubtype = 1001,
    IntStatus = 1002,
    IntInternal = 1003,
    IntActionPerms = 1004,
    IntLocked = 1005,
    IntInitialised = 1006,
    IntEntropy = 1007,
    IntEntropyQuality = 1008,
    IntKeyId = 1009,
}

const PROPERTY_FIRST: i32 = 1;
const PROPERTY_LAST: i32 = 5;
const GENERIC_FIRST: i32 = 100;
const GENERIC_LAST: i32 = 101;
const OPTION_FIRST: i32 = 200;
const OPTION_LAST: i32 = 204;
const CTX_FIRST: i32 = 300;
const CTX_LAST: i32 = 310;
const CERT_FIRST: i32 = 400;
const CERT_LAST: i32 = 408;
const KEYSET_FIRST: i32 = 500;
const KEYSET_LAST: i32 = 501;
const DEV_FIRST: i32 = 600;
const DEV_LAST: i32 = 602;
const ENV_FIRST: i32 = 700;
const ENV_LAST: i32 = 704;
const SESS_FIRST: i32 = 800;
const SESS_LAST: i32 = 804;
const USER_FIRST: i32 = 900;
const USER_LAST: i32 = 901;
const INT_FIRST: i32 = 1000;
const INT_LAST: i32 = 1009;

/// Times before this floor are assumed to be clock glitches and are
/// rejected wherever a time attribute is set.
pub const MIN_TIME_VALUE: i64 = 946_684_800; // 2000-01-01

bitflags! {
    /// Per-attribute access word: read/write/delete, split by object
    /// state and message source.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct Access: u16 {
        const EXT_R_LOW = 1 << 0;
        const EXT_W_LOW = 1 << 1;
        const EXT_D_LOW = 1 << 2;
        const EXT_R_HIGH = 1 << 3;
        const EXT_W_HIGH = 1 << 4;
        const EXT_D_HIGH = 1 << 5;
        const INT_R_LOW = 1 << 6;
        const INT_W_LOW = 1 << 7;
        const INT_D_LOW = 1 << 8;
        const INT_R_HIGH = 1 << 9;
        const INT_W_HIGH = 1 << 10;
        const INT_D_HIGH = 1 << 11;

        const EXT_MASK = Self::EXT_R_LOW.bits() | Self::EXT_W_LOW.bits()
            | Self::EXT_D_LOW.bits() | Self::EXT_R_HIGH.bits()
            | Self::EXT_W_HIGH.bits() | Self::EXT_D_HIGH.bits();
    }
}

pub(crate) const R: u8 = 4;
pub(crate) const W: u8 = 2;
pub(crate) const D: u8 = 1;

/// Builds an access word from four R/W/D triplets: external low/high
/// state, then internal low/high state.
pub(crate) const fn access(ext_low: u8, ext_high: u8, int_low: u8, int_high: u8) -> Access {
    const fn triplet(bits: u8, r: u16, w: u16, d: u16) -> u16 {
        let mut word = 0;
        if bits & R != 0 {
            word |= r;
        }
        if bits & W != 0 {
            word |= w;
        }
        if bits & D != 0 {
            word |= d;
        }
        word
    }
    Access::from_bits_retain(
        triplet(ext_low, 1 << 0, 1 << 1, 1 << 2)
            | triplet(ext_high, 1 << 3, 1 << 4, 1 << 5)
            | triplet(int_low, 1 << 6, 1 << 7, 1 << 8)
            | triplet(int_high, 1 << 9, 1 << 10, 1 << 11),
    )
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct AttrFlags: u8 {
        /// Setting this attribute successfully drives the object into
        /// the high state.
        const TRIGGER = 1 << 0;
        /// Object property: the get/set is executed inside the kernel
        /// rather than dispatched to the object.
        const PROPERTY = 1 << 1;
    }
}

/// Numeric-range rule for an attribute value.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Range {
    /// Any value accepted.
    Any,
    /// Inclusive bounds.  Negative ranges are stored (low, high) with
    /// low ≥ high, and the comparison is reversed.
    Bounds(i64, i64),
    /// Only the unused-sentinel is accepted.
    SelectValue,
    /// One of an explicit list of values.
    Allowed(&'static [i64]),
    /// One of a list of inclusive subranges.
    Subranges(&'static [(i64, i64)]),
}

/// The unused-sentinel accepted by `Range::SelectValue` attributes.
pub const VALUE_UNUSED: i64 = -1;

impl Range {
    pub(crate) fn contains(&self, value: i64) -> bool {
        match *self {
            Range::Any => true,
            Range::Bounds(low, high) => {
                if low >= 0 {
                    value >= low && value <= high
                } else {
                    // Negative ranges (e.g. cursor codes) are stored
                    // reversed.
                    debug_assert!(high <= low);
                    value >= high && value <= low
                }
            }
            Range::SelectValue => value == VALUE_UNUSED,
            Range::Allowed(values) => values.contains(&value),
            Range::Subranges(ranges) => ranges
                .iter()
                .any(|&(low, high)| value >= low && value <= high),
        }
    }
}

/// Required state for an object-valued attribute's parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum StateReq {
    Any,
    Low,
    High,
}

pub(crate) fn check_object_state(state: StateReq, table: &ObjectTable, handle: Handle) -> bool {
    match state {
        StateReq::Any => true,
        StateReq::Low => !table.info(handle).is_in_high_state(),
        StateReq::High => table.info(handle).is_in_high_state(),
    }
}

/// Rule for an object-valued attribute or mechanism parameter.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ObjectAcl {
    pub subtype_a: SubtypeA,
    pub subtype_b: SubtypeB,
    pub state: StateReq,
    /// Re-target the parameter by walking its dependency chain before
    /// the subtype/state check.
    pub route_to: Option<ObjectType>,
}

/// The value shape and range of an attribute.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ValueKind {
    Bool,
    Numeric(Range),
    String { min: usize, max: usize },
    WideString { min: usize, max: usize },
    /// Time in seconds, validated against [`MIN_TIME_VALUE`].
    Time,
    Object(ObjectAcl),
    /// Indirection to a subtype-specific nested ACL.
    Special(&'static [AttributeAcl]),
}

#[derive(Debug)]
pub(crate) struct AttributeAcl {
    pub attribute: Attribute,
    pub subtype_a: SubtypeA,
    pub subtype_b: SubtypeB,
    pub access: Access,
    pub route: Option<ObjectType>,
    pub kind: ValueKind,
    pub flags: AttrFlags,
}

const fn acl(
    attribute: Attribute,
    subtype_a: SubtypeA,
    subtype_b: SubtypeB,
    access_word: Access,
    route: Option<ObjectType>,
    kind: ValueKind,
    flags: AttrFlags,
) -> AttributeAcl {
    AttributeAcl {
        attribute,
        subtype_a,
        subtype_b,
        access: access_word,
        route,
        kind,
        flags,
    }
}

const ST_NONE_A: SubtypeA = SubtypeA::empty();
const ST_NONE_B: SubtypeB = SubtypeB::empty();
const ST_ANY_A: SubtypeA = SubtypeA::all();
const ST_ANY_B: SubtypeB = SubtypeB::all();

use Attribute as A;
use ObjectType as OT;

static PROPERTY_ACL: [AttributeAcl; 5] = [
    // Combination property: makes the object owned, non-forwardable and
    // locked in one step.
    acl(
        A::PropertyHighSecurity,
        ST_ANY_A,
        ST_ANY_B,
        access(W, W, W, W),
        None,
        ValueKind::Bool,
        AttrFlags::PROPERTY,
    ),
    // Readable since its value can be determined with a trial access
    // anyway.
    acl(
        A::PropertyOwner,
        ST_ANY_A,
        ST_ANY_B,
        access(R | W, R | W, R | W, R | W),
        None,
        ValueKind::Numeric(Range::Any),
        AttrFlags::PROPERTY,
    ),
    acl(
        A::PropertyForwardCount,
        ST_ANY_A,
        ST_ANY_B,
        access(R | W, R | W, R | W, R | W),
        None,
        ValueKind::Numeric(Range::Bounds(0, 1000)),
        AttrFlags::PROPERTY,
    ),
    acl(
        A::PropertyLocked,
        ST_ANY_A,
        ST_ANY_B,
        access(R | W, R | W, R | W, R | W),
        None,
        ValueKind::Bool,
        AttrFlags::PROPERTY,
    ),
    acl(
        A::PropertyUsageCount,
        ST_ANY_A,
        ST_ANY_B,
        access(R | W, R | W, R | W, R | W),
        None,
        ValueKind::Numeric(Range::Bounds(0, i32::MAX as i64)),
        AttrFlags::PROPERTY,
    ),
];

static GENERIC_ACL: [AttributeAcl; 2] = [
    acl(
        A::ErrorType,
        ST_ANY_A,
        ST_ANY_B,
        access(R, R, R, R),
        None,
        ValueKind::Numeric(Range::Bounds(0, 12)),
        AttrFlags::empty(),
    ),
    acl(
        A::ErrorLocus,
        ST_ANY_A,
        ST_ANY_B,
        access(R, R, R, R),
        None,
        ValueKind::Numeric(Range::Bounds(0, INT_LAST as i64)),
        AttrFlags::empty(),
    ),
];

static OPTION_ACL: [AttributeAcl; 5] = [
    acl(
        A::OptionComplianceLevel,
        ST_NONE_A,
        SubtypeB::USER_ANY,
        access(R | W, R | W, R | W, R | W),
        Some(OT::User),
        ValueKind::Numeric(Range::Bounds(0, 4)),
        AttrFlags::empty(),
    ),
    acl(
        A::OptionSideChannelProtection,
        ST_NONE_A,
        SubtypeB::USER_ANY,
        access(R | W, R | W, R | W, R | W),
        Some(OT::User),
        ValueKind::Bool,
        AttrFlags::empty(),
    ),
    acl(
        A::OptionKeyingIterations,
        ST_NONE_A,
        SubtypeB::USER_ANY,
        access(R | W, R | W, R | W, R | W),
        Some(OT::User),
        ValueKind::Numeric(Range::Bounds(1, 20000)),
        AttrFlags::empty(),
    ),
    acl(
        A::OptionEncrAlgo,
        ST_NONE_A,
        SubtypeB::USER_ANY,
        access(R | W, R | W, R | W, R | W),
        Some(OT::User),
        ValueKind::Numeric(Range::Allowed(&[algo::DES3, algo::AES, algo::RC4, algo::IDEA])),
        AttrFlags::empty(),
    ),
    acl(
        A::OptionHashAlgo,
        ST_NONE_A,
        SubtypeB::USER_ANY,
        access(R | W, R | W, R | W, R | W),
        Some(OT::User),
        ValueKind::Numeric(Range::Bounds(algo::HASH_FIRST, algo::HASH_LAST)),
        AttrFlags::empty(),
    ),
];

static CONTEXT_ACL: [AttributeAcl; 11] = [
    acl(
        A::CtxAlgo,
        SubtypeA::CTX_ANY,
        ST_NONE_B,
        access(R, R, R, R),
        Some(OT::Context),
        ValueKind::Numeric(Range::Bounds(algo::FIRST, algo::LAST)),
        AttrFlags::empty(),
    ),
    acl(
        A::CtxMode,
        SubtypeA::CTX_CONV,
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Context),
        ValueKind::Numeric(Range::Bounds(1, 4)),
        AttrFlags::empty(),
    ),
    acl(
        A::CtxKeySize,
        SubtypeA::CTX_CONV
            .union(SubtypeA::CTX_PKC)
            .union(SubtypeA::CTX_MAC),
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Context),
        ValueKind::Numeric(Range::Bounds(5, 512)),
        AttrFlags::empty(),
    ),
    acl(
        A::CtxBlockSize,
        SubtypeA::CTX_CONV
            .union(SubtypeA::CTX_HASH)
            .union(SubtypeA::CTX_MAC),
        ST_NONE_B,
        access(R, R, R, R),
        Some(OT::Context),
        ValueKind::Numeric(Range::Bounds(1, 32)),
        AttrFlags::empty(),
    ),
    acl(
        A::CtxIv,
        SubtypeA::CTX_CONV,
        ST_NONE_B,
        access(R | W, R | W, R | W, R | W),
        Some(OT::Context),
        ValueKind::String { min: 8, max: 32 },
        AttrFlags::empty(),
    ),
    // Loading a key is one of the transitions into the high state.
    acl(
        A::CtxKey,
        SubtypeA::CTX_CONV.union(SubtypeA::CTX_MAC),
        ST_NONE_B,
        access(W, 0, W, 0),
        Some(OT::Context),
        ValueKind::String { min: 8, max: 64 },
        AttrFlags::TRIGGER,
    ),
    acl(
        A::CtxKeyingSalt,
        SubtypeA::CTX_CONV.union(SubtypeA::CTX_MAC),
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Context),
        ValueKind::String { min: 8, max: 64 },
        AttrFlags::empty(),
    ),
    acl(
        A::CtxKeyingIterations,
        SubtypeA::CTX_CONV.union(SubtypeA::CTX_MAC),
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Context),
        ValueKind::Numeric(Range::Bounds(1, 20000)),
        AttrFlags::empty(),
    ),
    // Deriving from keying material also loads a key.
    acl(
        A::CtxKeyingValue,
        SubtypeA::CTX_CONV.union(SubtypeA::CTX_MAC),
        ST_NONE_B,
        access(W, 0, W, 0),
        Some(OT::Context),
        ValueKind::String { min: 2, max: 64 },
        AttrFlags::TRIGGER,
    ),
    acl(
        A::CtxHashValue,
        SubtypeA::CTX_HASH.union(SubtypeA::CTX_MAC),
        ST_NONE_B,
        access(0, R, 0, R),
        Some(OT::Context),
        ValueKind::String { min: 16, max: 64 },
        AttrFlags::empty(),
    ),
    acl(
        A::CtxLabel,
        SubtypeA::CTX_ANY,
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Context),
        ValueKind::String { min: 1, max: 64 },
        AttrFlags::empty(),
    ),
];

/// Subtype-specific sub-ACL for the serial-number attribute: CRLs carry
/// it read-only, certificate objects allow it to be set before signing.
static CERT_SERIAL_SUBACL: [AttributeAcl; 2] = [
    acl(
        A::CertSerialNumber,
        SubtypeA::CERT_CRL,
        ST_NONE_B,
        access(R, R, R, R),
        Some(OT::Certificate),
        ValueKind::String { min: 1, max: 32 },
        AttrFlags::empty(),
    ),
    acl(
        A::CertSerialNumber,
        SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN),
        ST_NONE_B,
        access(W, R, W, R),
        Some(OT::Certificate),
        ValueKind::String { min: 1, max: 32 },
        AttrFlags::empty(),
    ),
];

static CERT_ACL: [AttributeAcl; 9] = [
    acl(
        A::CertFingerprint,
        SubtypeA::CERT_ANY,
        ST_NONE_B,
        access(R, R, R, R),
        Some(OT::Certificate),
        ValueKind::String { min: 16, max: 20 },
        AttrFlags::empty(),
    ),
    acl(
        A::CertSerialNumber,
        SubtypeA::CERT_CERT
            .union(SubtypeA::CERT_CERTCHAIN)
            .union(SubtypeA::CERT_CRL),
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Certificate),
        ValueKind::Special(&CERT_SERIAL_SUBACL),
        AttrFlags::empty(),
    ),
    acl(
        A::CertSubjectName,
        SubtypeA::CERT_ANY,
        ST_NONE_B,
        access(R | W | D, R, R | W | D, R),
        Some(OT::Certificate),
        ValueKind::WideString { min: 1, max: 1024 },
        AttrFlags::empty(),
    ),
    acl(
        A::CertValidFrom,
        SubtypeA::CERT_ANY_CERT.union(SubtypeA::CERT_ATTRCERT),
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Certificate),
        ValueKind::Time,
        AttrFlags::empty(),
    ),
    acl(
        A::CertValidTo,
        SubtypeA::CERT_ANY_CERT.union(SubtypeA::CERT_ATTRCERT),
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Certificate),
        ValueKind::Time,
        AttrFlags::empty(),
    ),
    acl(
        A::CertSelfSigned,
        SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN),
        ST_NONE_B,
        access(R | W, R, R | W, R),
        Some(OT::Certificate),
        ValueKind::Bool,
        AttrFlags::empty(),
    ),
    acl(
        A::CertImmutable,
        SubtypeA::CERT_ANY,
        ST_NONE_B,
        access(R, R, R, R),
        Some(OT::Certificate),
        ValueKind::Bool,
        AttrFlags::empty(),
    ),
    acl(
        A::CertKeyUsage,
        SubtypeA::CERT_CERT
            .union(SubtypeA::CERT_CERTREQ)
            .union(SubtypeA::CERT_REQ_CERT)
            .union(SubtypeA::CERT_CERTCHAIN),
        ST_NONE_B,
        access(R | W | D, R, R | W | D, R),
        Some(OT::Certificate),
        ValueKind::Numeric(Range::Bounds(0, 0x7ff)),
        AttrFlags::empty(),
    ),
    acl(
        A::CertCrlReason,
        SubtypeA::CERT_CRL.union(SubtypeA::CERT_REQ_REV),
        ST_NONE_B,
        access(R | W, R | W, R | W, R | W),
        Some(OT::Certificate),
        ValueKind::Numeric(Range::Subranges(&[(0, 10), (0x100, 0x10a)])),
        AttrFlags::empty(),
    ),
];

static KEYSET_ACL: [AttributeAcl; 2] = [
    acl(
        A::KeysetQuery,
        SubtypeA::KEYSET_DBMS
            .union(SubtypeA::KEYSET_DBMS_STORE)
            .union(SubtypeA::KEYSET_LDAP),
        ST_NONE_B,
        access(R | W, R | W, R | W, R | W),
        Some(OT::Keyset),
        ValueKind::String { min: 6, max: 1024 },
        AttrFlags::empty(),
    ),
    acl(
        A::KeysetConfigData,
        SubtypeA::KEYSET_FILE,
        ST_NONE_B,
        access(0, 0, R | W, R | W),
        Some(OT::Keyset),
        ValueKind::String { min: 1, max: 4096 },
        AttrFlags::empty(),
    ),
];

static DEVICE_ACL: [AttributeAcl; 3] = [
    acl(
        A::DevInitialise,
        SubtypeA::DEV_ANY_STD,
        ST_NONE_B,
        access(W, W, W, W),
        Some(OT::Device),
        ValueKind::String { min: 4, max: 16 },
        AttrFlags::empty(),
    ),
    acl(
        A::DevAuthentUser,
        SubtypeA::DEV_ANY_STD,
        ST_NONE_B,
        access(W, W, W, W),
        Some(OT::Device),
        ValueKind::String { min: 4, max: 16 },
        AttrFlags::empty(),
    ),
    acl(
        A::DevAuthentSupervisor,
        SubtypeA::DEV_ANY_STD,
        ST_NONE_B,
        access(W, W, W, W),
        Some(OT::Device),
        ValueKind::String { min: 4, max: 16 },
        AttrFlags::empty(),
    ),
];

static ENVELOPE_ACL: [AttributeAcl; 5] = [
    acl(
        A::EnvDataSize,
        ST_NONE_A,
        SubtypeB::ENV_ENV.union(SubtypeB::ENV_ENV_PGP),
        access(W, 0, W, 0),
        Some(OT::Envelope),
        ValueKind::Numeric(Range::Bounds(0, i32::MAX as i64)),
        AttrFlags::empty(),
    ),
    acl(
        A::EnvCompression,
        ST_NONE_A,
        SubtypeB::ENV_ENV.union(SubtypeB::ENV_ENV_PGP),
        access(R | W, R, R | W, R),
        Some(OT::Envelope),
        ValueKind::Bool,
        AttrFlags::empty(),
    ),
    acl(
        A::EnvContentType,
        ST_NONE_A,
        SubtypeB::ENV_ANY,
        access(R | W, R, R | W, R),
        Some(OT::Envelope),
        ValueKind::Numeric(Range::Bounds(1, 9)),
        AttrFlags::empty(),
    ),
    acl(
        A::EnvPassword,
        ST_NONE_A,
        SubtypeB::ENV_ANY,
        access(W, W, W, W),
        Some(OT::Envelope),
        ValueKind::WideString { min: 1, max: 64 },
        AttrFlags::empty(),
    ),
    acl(
        A::EnvSignature,
        ST_NONE_A,
        SubtypeB::ENV_ENV.union(SubtypeB::ENV_ENV_PGP),
        access(W, 0, W, 0),
        Some(OT::Envelope),
        ValueKind::Object(ObjectAcl {
            subtype_a: SubtypeA::CTX_PKC
                .union(SubtypeA::CERT_CERT)
                .union(SubtypeA::CERT_CERTCHAIN),
            subtype_b: ST_NONE_B,
            state: StateReq::High,
            route_to: Some(OT::Context),
        }),
        AttrFlags::empty(),
    ),
];

static SESSION_ACL: [AttributeAcl; 5] = [
    // Activating the session is its transition into the high state.
    acl(
        A::SessActive,
        ST_NONE_A,
        SubtypeB::SESS_ANY,
        access(R | W, R, R | W, R),
        Some(OT::Session),
        ValueKind::Bool,
        AttrFlags::TRIGGER,
    ),
    acl(
        A::SessServerName,
        ST_NONE_A,
        SubtypeB::SESS_ANY,
        access(R | W, R, R | W, R),
        Some(OT::Session),
        ValueKind::String { min: 2, max: 1024 },
        AttrFlags::empty(),
    ),
    acl(
        A::SessServerPort,
        ST_NONE_A,
        SubtypeB::SESS_ANY,
        access(R | W, R, R | W, R),
        Some(OT::Session),
        ValueKind::Numeric(Range::Bounds(21, 65534)),
        AttrFlags::empty(),
    ),
    acl(
        A::SessUsername,
        ST_NONE_A,
        SubtypeB::SESS_ANY,
        access(R | W, R, R | W, R),
        Some(OT::Session),
        ValueKind::String { min: 1, max: 64 },
        AttrFlags::empty(),
    ),
    acl(
        A::SessPassword,
        ST_NONE_A,
        SubtypeB::SESS_ANY,
        access(W, 0, W, 0),
        Some(OT::Session),
        ValueKind::String { min: 1, max: 64 },
        AttrFlags::empty(),
    ),
];

static USER_ACL: [AttributeAcl; 2] = [
    acl(
        A::UserPassword,
        ST_NONE_A,
        SubtypeB::USER_ANY,
        access(W, W, W, W),
        Some(OT::User),
        ValueKind::WideString { min: 1, max: 64 },
        AttrFlags::empty(),
    ),
    acl(
        A::UserCaCertificate,
        ST_NONE_A,
        SubtypeB::USER_SO.union(SubtypeB::USER_CA),
        access(0, 0, R | W, R | W),
        Some(OT::User),
        ValueKind::Object(ObjectAcl {
            subtype_a: SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN),
            subtype_b: ST_NONE_B,
            state: StateReq::High,
            route_to: Some(OT::Certificate),
        }),
        AttrFlags::empty(),
    ),
];

static INTERNAL_ACL: [AttributeAcl; 10] = [
    acl(
        A::IntType,
        ST_ANY_A,
        ST_ANY_B,
        access(0, 0, R, R),
        None,
        ValueKind::Numeric(Range::Bounds(1, 7)),
        AttrFlags::PROPERTY,
    ),
    acl(
        A::IntSubtype,
        ST_ANY_A,
        ST_ANY_B,
        access(0, 0, R, R),
        None,
        ValueKind::Numeric(Range::Any),
        AttrFlags::PROPERTY,
    ),
    acl(
        A::IntStatus,
        ST_ANY_A,
        ST_ANY_B,
        access(0, 0, R | W, R | W),
        None,
        ValueKind::Numeric(Range::Any),
        AttrFlags::PROPERTY,
    ),
    acl(
        A::IntInternal,
        ST_ANY_A,
        ST_ANY_B,
        access(0, 0, R | W, R | W),
        None,
        ValueKind::Bool,
        AttrFlags::PROPERTY,
    ),
    acl(
        A::IntActionPerms,
        SubtypeA::CTX_ANY,
        ST_NONE_B,
        access(0, 0, R | W, R | W),
        None,
        ValueKind::Numeric(Range::Bounds(0, (1 << 14) - 1)),
        AttrFlags::PROPERTY,
    ),
    acl(
        A::IntLocked,
        ST_ANY_A,
        ST_ANY_B,
        access(0, 0, W, W),
        None,
        ValueKind::Bool,
        AttrFlags::PROPERTY,
    ),
    // Completion of an internal key load; drives the context high.
    acl(
        A::IntInitialised,
        SubtypeA::CTX_ANY,
        ST_NONE_B,
        access(0, 0, W, 0),
        Some(OT::Context),
        ValueKind::Numeric(Range::SelectValue),
        AttrFlags::TRIGGER,
    ),
    // Polled entropy can be arbitrarily large.
    acl(
        A::IntEntropy,
        SubtypeA::DEV_SYSTEM,
        ST_NONE_B,
        access(0, 0, W, W),
        Some(OT::Device),
        ValueKind::String { min: 1, max: usize::MAX },
        AttrFlags::empty(),
    ),
    acl(
        A::IntEntropyQuality,
        SubtypeA::DEV_SYSTEM,
        ST_NONE_B,
        access(0, 0, W, W),
        Some(OT::Device),
        ValueKind::Numeric(Range::Bounds(0, 100)),
        AttrFlags::empty(),
    ),
    acl(
        A::IntKeyId,
        SubtypeA::CTX_PKC,
        ST_NONE_B,
        access(0, 0, 0, R),
        Some(OT::Context),
        ValueKind::String { min: 1, max: 128 },
        AttrFlags::empty(),
    ),
];

/// Algorithm identifier space used by the option and context attribute
/// ranges.
pub mod algo {
    pub const FIRST: i64 = 1;
    pub const DES3: i64 = 2;
    pub const RC4: i64 = 3;
    pub const IDEA: i64 = 4;
    pub const AES: i64 = 5;
    pub const HASH_FIRST: i64 = 20;
    pub const SHA1: i64 = 20;
    pub const SHA2: i64 = 21;
    pub const MD5: i64 = 22;
    pub const RIPEMD160: i64 = 23;
    pub const HASH_LAST: i64 = 25;
    pub const LAST: i64 = 45;
}

/// Finds the ACL for an attribute id.  A hardcoded two-level range
/// search keeps the number of comparisons to find a match small.  For
/// external messages the internal range doesn't exist at all.
pub(crate) fn find_attribute_acl(
    attribute: i32,
    is_internal_message: bool,
) -> Option<&'static AttributeAcl> {
    let entry = if attribute < CTX_LAST + 1 {
        if attribute <= OPTION_LAST {
            if (PROPERTY_FIRST..=PROPERTY_LAST).contains(&attribute) {
                &PROPERTY_ACL[(attribute - PROPERTY_FIRST) as usize]
            } else if (GENERIC_FIRST..=GENERIC_LAST).contains(&attribute) {
                &GENERIC_ACL[(attribute - GENERIC_FIRST) as usize]
            } else if (OPTION_FIRST..=OPTION_LAST).contains(&attribute) {
                &OPTION_ACL[(attribute - OPTION_FIRST) as usize]
            } else {
                return None;
            }
        } else if (CTX_FIRST..=CTX_LAST).contains(&attribute) {
            &CONTEXT_ACL[(attribute - CTX_FIRST) as usize]
        } else {
            return None;
        }
    } else if attribute <= DEV_LAST {
        if (CERT_FIRST..=CERT_LAST).contains(&attribute) {
            &CERT_ACL[(attribute - CERT_FIRST) as usize]
        } else if (KEYSET_FIRST..=KEYSET_LAST).contains(&attribute) {
            &KEYSET_ACL[(attribute - KEYSET_FIRST) as usize]
        } else if (DEV_FIRST..=DEV_LAST).contains(&attribute) {
            &DEVICE_ACL[(attribute - DEV_FIRST) as usize]
        } else {
            return None;
        }
    } else if (ENV_FIRST..=ENV_LAST).contains(&attribute) {
        &ENVELOPE_ACL[(attribute - ENV_FIRST) as usize]
    } else if (SESS_FIRST..=SESS_LAST).contains(&attribute) {
        &SESSION_ACL[(attribute - SESS_FIRST) as usize]
    } else if (USER_FIRST..=USER_LAST).contains(&attribute) {
        &USER_ACL[(attribute - USER_FIRST) as usize]
    } else if (INT_FIRST..=INT_LAST).contains(&attribute) {
        // If it's an external message the internal attributes don't
        // exist.
        if !is_internal_message {
            return None;
        }
        &INTERNAL_ACL[(attribute - INT_FIRST) as usize]
    } else {
        return None;
    };
    debug_assert_eq!(entry.attribute as i32, attribute);
    Some(entry)
}

/// Widechar-tolerant string length check.  Strings bloated out into
/// 16-bit units from 8-bit text are range-checked in units rather than
/// bytes; everything else gets a straight byte-range check.
fn check_range_widechar(data: &[u8], min: usize, max: usize) -> bool {
    const UNIT: usize = 2;
    if data.len() % UNIT != 0 || data.len() < UNIT * 2 {
        return data.len() >= min && data.len() <= max;
    }
    // Bloated text has the high byte of the first units clear.
    if data[1] == 0 && data[3] == 0 {
        let units = data.len() / UNIT;
        return units >= min && units <= max;
    }
    data.len() >= min && data.len() <= max
}

/// The pre-dispatch check for attribute get/set/delete: the access
/// conditions for the object and the shape and range of the message
/// parameters.
pub(crate) fn check_attribute_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    _value: i32,
    acl: &AttributeAcl,
) -> Result<()> {
    let acl = resolve_subacl(acl, tr.table(), handle)?;
    let table = tr.table();
    let info = table.info(handle);
    let high = info.is_in_high_state();

    // Make sure the attribute is valid for this object subtype.
    if !info.subtype.matches(acl.subtype_a, acl.subtype_b) {
        return Err(Error::ArgValue);
    }

    // Make sure this type of access is valid for this attribute in the
    // object's current state.
    let wanted = match (msg.kind, msg.internal, high) {
        (MessageType::GetAttribute | MessageType::GetAttributeData, false, false) => {
            Access::EXT_R_LOW
        }
        (MessageType::GetAttribute | MessageType::GetAttributeData, false, true) => {
            Access::EXT_R_HIGH
        }
        (MessageType::GetAttribute | MessageType::GetAttributeData, true, false) => {
            Access::INT_R_LOW
        }
        (MessageType::GetAttribute | MessageType::GetAttributeData, true, true) => {
            Access::INT_R_HIGH
        }
        (MessageType::SetAttribute | MessageType::SetAttributeData, false, false) => {
            Access::EXT_W_LOW
        }
        (MessageType::SetAttribute | MessageType::SetAttributeData, false, true) => {
            Access::EXT_W_HIGH
        }
        (MessageType::SetAttribute | MessageType::SetAttributeData, true, false) => {
            Access::INT_W_LOW
        }
        (MessageType::SetAttribute | MessageType::SetAttributeData, true, true) => {
            Access::INT_W_HIGH
        }
        (MessageType::DeleteAttribute, false, false) => Access::EXT_D_LOW,
        (MessageType::DeleteAttribute, false, true) => Access::EXT_D_HIGH,
        (MessageType::DeleteAttribute, true, false) => Access::INT_D_LOW,
        (MessageType::DeleteAttribute, true, true) => Access::INT_D_HIGH,
        _ => {
            debug_assert!(false, "non-attribute message in attribute check");
            return Err(Error::ArgValue);
        }
    };
    if !acl.access.contains(wanted) {
        // An internal-only attribute accessed through an external
        // message isn't visible to the user, so the attribute appears
        // not to exist rather than being off-limits.
        if !acl.access.intersects(Access::EXT_MASK) && !msg.internal {
            return Err(Error::ArgValue);
        }
        return Err(Error::PermissionDenied);
    }

    // A delete carries no attribute data.
    if msg.kind == MessageType::DeleteAttribute {
        return Ok(());
    }

    let is_get =
        matches!(msg.kind, MessageType::GetAttribute | MessageType::GetAttributeData);

    // Make sure the attribute type matches the supplied value type, and
    // for sets that the value is within the allowed range.
    match acl.kind {
        ValueKind::Bool => {
            let MessageData::Value(value) = data else {
                return Err(Error::ArgValue);
            };
            if !is_get && *value != 0 && *value != 1 {
                return Err(Error::ArgNum1);
            }
        }
        ValueKind::Numeric(range) => {
            let MessageData::Value(value) = data else {
                return Err(Error::ArgValue);
            };
            if !is_get && !range.contains(*value) {
                return Err(Error::ArgNum1);
            }
        }
        ValueKind::Object(object_acl) => {
            let MessageData::Value(value) = data else {
                return Err(Error::ArgValue);
            };
            if is_get {
                return Ok(());
            }
            let param = Handle::try_from(*value).map_err(|_| Error::ArgNum1)?;
            if !table.is_valid_object(param)
                || (!msg.internal
                    && (table.info(param).is_internal()
                        || !table.info(param).thread_access_ok()))
                || !table.same_owner(handle, param)
            {
                return Err(Error::ArgNum1);
            }
            let target = match object_acl.route_to {
                Some(route) => table.find_target(param, &[route]).map_err(|_| Error::ArgNum1)?,
                None => param,
            };
            if !table
                .info(target)
                .subtype
                .matches(object_acl.subtype_a, object_acl.subtype_b)
            {
                return Err(Error::ArgNum1);
            }
            if !check_object_state(object_acl.state, table, target) {
                return Err(Error::ArgNum1);
            }
        }
        ValueKind::String { min, max } => {
            let MessageData::Bytes(bytes) = data else {
                return Err(Error::ArgValue);
            };
            if is_get {
                return Ok(());
            }
            if bytes.len() < min || bytes.len() > max {
                return Err(Error::ArgNum1);
            }
        }
        ValueKind::WideString { min, max } => {
            let MessageData::Bytes(bytes) = data else {
                return Err(Error::ArgValue);
            };
            if is_get {
                return Ok(());
            }
            if !check_range_widechar(bytes, min, max) {
                return Err(Error::ArgNum1);
            }
        }
        ValueKind::Time => {
            let MessageData::Time(value) = data else {
                return Err(Error::ArgValue);
            };
            if !is_get && *value < MIN_TIME_VALUE {
                return Err(Error::ArgStr1);
            }
        }
        ValueKind::Special(_) => {
            // Resolved before the match.
            debug_assert!(false);
            return Err(Error::ArgValue);
        }
    }

    Ok(())
}

/// Resolves a `Special` ACL to the sub-ACL entry for the object's
/// subtype.
fn resolve_subacl<'a>(
    acl: &'a AttributeAcl,
    table: &ObjectTable,
    handle: Handle,
) -> Result<&'a AttributeAcl> {
    let ValueKind::Special(subacls) = acl.kind else {
        return Ok(acl);
    };
    let subtype = table.info(handle).subtype;
    subacls
        .iter()
        .find(|sub| subtype.matches(sub.subtype_a, sub.subtype_b))
        .ok_or(Error::ArgValue)
}

/// Token identifying the calling thread for the ownership properties.
/// Stable for the thread's lifetime, and never zero.
pub(crate) fn thread_token() -> u64 {
    use std::hash::{BuildHasher, Hasher, RandomState};
    use std::sync::OnceLock;
    static SEED: OnceLock<RandomState> = OnceLock::new();
    let mut hasher = SEED.get_or_init(RandomState::new).build_hasher();
    std::hash::Hash::hash(&std::thread::current().id(), &mut hasher);
    hasher.finish() | 1
}

/// Kernel-handled property-attribute reads.
pub(crate) fn get_property(
    table: &ObjectTable,
    handle: Handle,
    attribute: Attribute,
    data: &mut MessageData,
) -> Result<()> {
    let info = table.info(handle);
    let value = match attribute {
        // Readable since its value can be determined with a trial
        // access anyway.
        Attribute::PropertyOwner => {
            if !info.flags.contains(ObjectFlags::OWNED) {
                return Err(Error::NotInited);
            }
            info.object_owner.unwrap_or(0) as i64
        }
        Attribute::PropertyForwardCount => {
            if info.flags.contains(ObjectFlags::ATTR_LOCKED) {
                return Err(Error::PermissionDenied);
            }
            info.forward_count.map_or(VALUE_UNUSED, i64::from)
        }
        Attribute::PropertyLocked => i64::from(info.flags.contains(ObjectFlags::ATTR_LOCKED)),
        Attribute::PropertyUsageCount => info.usage_count.map_or(VALUE_UNUSED, i64::from),
        Attribute::IntType => info.object_type as i64,
        Attribute::IntSubtype => match info.subtype {
            crate::object::Subtype::A(bits) => i64::from(bits.bits()),
            crate::object::Subtype::B(bits) => i64::from(bits.bits()),
        },
        Attribute::IntStatus => i64::from((info.flags & ObjectFlags::STATUS_MASK).bits()),
        Attribute::IntInternal => i64::from(info.is_internal()),
        Attribute::IntActionPerms => info.action_perms.raw(),
        _ => {
            debug_assert!(false, "non-property attribute {attribute:?}");
            return Err(Error::ArgValue);
        }
    };
    *data = MessageData::Value(value);
    Ok(())
}

/// Status values accepted by an internal-status property write.
pub const STATUS_OK: i64 = 0;
pub const STATUS_BUSY: i64 = Error::Timeout as i64;

/// Kernel-handled property-attribute writes.  Runs with the object
/// table locked; status notifications to the object body are made
/// directly and must not send further messages.
pub(crate) fn set_property(
    tr: &mut TableRef<'_>,
    handle: Handle,
    attribute: Attribute,
    data: &MessageData,
) -> Result<()> {
    let value = match data {
        MessageData::Value(value) => *value,
        _ => return Err(Error::ArgValue),
    };
    debug_assert!(
        handle >= FIRST_DYNAMIC_HANDLE || attribute == Attribute::IntStatus,
        "system-object property write"
    );

    match attribute {
        // Combination property making the object owned, non-forwardable
        // and locked.
        Attribute::PropertyHighSecurity => {
            let info = tr.table().info_mut(handle);
            info.object_owner = Some(thread_token());
            info.forward_count = Some(0);
            info.flags |= ObjectFlags::ATTR_LOCKED | ObjectFlags::OWNED;
        }

        Attribute::PropertyOwner => {
            // Ownership transfers are permitted (even on a locked
            // object) until the forwarding ratchet runs out, otherwise
            // locking the object would prevent any forwarding.
            let info = tr.table().info_mut(handle);
            if let Some(count) = info.forward_count {
                if count <= 0 {
                    return Err(Error::PermissionDenied);
                }
                info.forward_count = Some(count - 1);
            }
            if value == VALUE_UNUSED {
                info.flags &= !ObjectFlags::OWNED;
                info.object_owner = None;
            } else {
                info.object_owner = Some(value as u64);
                info.flags |= ObjectFlags::OWNED;
            }
        }

        Attribute::PropertyForwardCount => {
            let info = tr.table().info_mut(handle);
            if info.flags.contains(ObjectFlags::ATTR_LOCKED) {
                return Err(Error::PermissionDenied);
            }
            info.forward_count = Some(value as i32);
        }

        Attribute::PropertyLocked => {
            // This property can only be turned on.
            if value == 0 {
                return Err(Error::ArgNum1);
            }
            tr.table().info_mut(handle).flags |= ObjectFlags::ATTR_LOCKED;
        }

        Attribute::PropertyUsageCount => {
            let info = tr.table().info_mut(handle);
            // The usage ratchet can be set exactly once.
            if info.flags.contains(ObjectFlags::ATTR_LOCKED) || info.usage_count.is_some() {
                return Err(Error::PermissionDenied);
            }
            info.usage_count = Some(value as i32);
        }

        Attribute::IntStatus => return set_status(tr, handle, value),

        Attribute::IntInternal => {
            let info = tr.table().info_mut(handle);
            if value != 0 {
                info.flags |= ObjectFlags::INTERNAL;
            } else {
                info.flags &= !ObjectFlags::INTERNAL;
            }
        }

        Attribute::IntActionPerms => {
            let new = ActionPerms::from_raw(value).ok_or(Error::ArgNum1)?;
            let info = tr.table().info_mut(handle);
            info.action_perms = info.action_perms.tightened(new);
        }

        Attribute::IntLocked => {
            let kernel = tr.kernel();
            let table = tr.table();
            if value != 0 {
                let info = table.info_mut(handle);
                info.lock_count += 1;
                info.lock_owner = Some(std::thread::current().id());
            } else {
                let info = table.info_mut(handle);
                debug_assert!(info.lock_count > 0);
                info.lock_count = info.lock_count.saturating_sub(1);
            }
            // Certificates get notified so they can save/restore their
            // cursor state around the two-object operation.
            if table.info(handle).object_type == ObjectType::Certificate {
                let mut notify = MessageData::Value(value);
                if let Some(body) = table.info_mut(handle).body.as_mut() {
                    let _ = body.handle_message(
                        kernel,
                        MessageType::ChangeNotify,
                        &mut notify,
                        Attribute::IntLocked as i32,
                    );
                }
            }
        }

        _ => {
            debug_assert!(false, "non-property attribute {attribute:?}");
            return Err(Error::ArgValue);
        }
    }
    Ok(())
}

/// Internal-status writes: clearing an abnormal state or flagging the
/// object busy for an async operation.
fn set_status(tr: &mut TableRef<'_>, handle: Handle, value: i64) -> Result<()> {
    if value != STATUS_OK && value != STATUS_BUSY {
        return Err(Error::ArgNum1);
    }
    let kernel = tr.kernel();
    let table = tr.table();
    let info = table.info_mut(handle);

    if info.in_invalid_state() {
        // An abnormal state can only be cleared, not entered again.
        if value != STATUS_OK {
            return Err(Error::ArgNum1);
        }

        // Coming back from busy: notify the object in case there's
        // cleanup pending; if it objects, it's still mid-operation and
        // keeps the busy state.
        if info.flags.contains(ObjectFlags::BUSY) {
            debug_assert_eq!(info.object_type, ObjectType::Context);
            let mut notify = MessageData::Value(STATUS_OK);
            if let Some(body) = info.body.as_mut() {
                if body
                    .handle_message(
                        kernel,
                        MessageType::ChangeNotify,
                        &mut notify,
                        Attribute::IntStatus as i32,
                    )
                    .is_ok()
                {
                    info.flags &= !ObjectFlags::BUSY;
                }
            }
            return Ok(());
        }

        // The caller is signalling that the object's init is complete.
        // If the object was destroyed while it was being created, the
        // completion gets converted into a destroy, unless it's a
        // system object, which can't be explicitly destroyed, in which
        // case the whole boot fails.
        if info.flags.contains(ObjectFlags::SIGNALLED) {
            return if handle < FIRST_DYNAMIC_HANDLE {
                Err(Error::Signalled)
            } else {
                Err(Error::SpecialCase)
            };
        }

        debug_assert!(info.flags.contains(ObjectFlags::NOT_INITED));
        info.flags &= !ObjectFlags::NOT_INITED;
        return Ok(());
    }

    // The object is in a normal state; the only transition from here is
    // into the busy state for an async operation.
    if value == STATUS_BUSY {
        info.flags |= ObjectFlags::BUSY;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_table_entries_match_their_ids() {
        for id in 0..=INT_LAST {
            if let Some(acl) = find_attribute_acl(id, true) {
                assert_eq!(acl.attribute as i32, id);
            }
        }
    }

    #[test]
    fn internal_attributes_dont_exist_externally() {
        assert!(find_attribute_acl(Attribute::IntStatus as i32, true).is_some());
        assert!(find_attribute_acl(Attribute::IntStatus as i32, false).is_none());
        // Gaps between the ranges never resolve.
        assert!(find_attribute_acl(50, true).is_none());
        assert!(find_attribute_acl(999, true).is_none());
        assert!(find_attribute_acl(-1, true).is_none());
    }

    #[test]
    fn range_checks() {
        assert!(Range::Bounds(1, 10).contains(10));
        assert!(!Range::Bounds(1, 10).contains(0));
        // Reversed comparison for negative ranges.
        assert!(Range::Bounds(-1, -4).contains(-2));
        assert!(!Range::Bounds(-1, -4).contains(-5));
        assert!(Range::SelectValue.contains(VALUE_UNUSED));
        assert!(!Range::SelectValue.contains(0));
        assert!(Range::Allowed(&[2, 5]).contains(5));
        assert!(!Range::Allowed(&[2, 5]).contains(3));
        assert!(Range::Subranges(&[(0, 10), (0x100, 0x10a)]).contains(0x105));
        assert!(!Range::Subranges(&[(0, 10), (0x100, 0x10a)]).contains(64));
    }

    #[test]
    fn widechar_length_uses_units_for_bloated_text() {
        // "abcd" bloated to 16-bit units: 8 bytes, 4 units.
        let bloated = [b'a', 0, b'b', 0, b'c', 0, b'd', 0];
        assert!(check_range_widechar(&bloated, 1, 4));
        assert!(!check_range_widechar(&bloated, 5, 8));
        // Plain text gets a byte check.
        let plain = *b"abcdefgh";
        assert!(check_range_widechar(&plain, 5, 8));
        assert!(!check_range_widechar(&plain, 1, 4));
    }

    #[test]
    fn thread_token_is_stable_and_nonzero() {
        let token = thread_token();
        assert_ne!(token, 0);
        assert_eq!(token, thread_token());
        let other = std::thread::spawn(thread_token).join().unwrap();
        assert_ne!(token, other);
    }
}

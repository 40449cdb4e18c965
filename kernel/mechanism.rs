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

//! Mechanism ACLs.
//!
//! Each cryptographic mechanism (the key wrap/unwrap, sign and derive
//! transforms reachable through the device messages) has a fixed
//! parameter tuple, and every parameter is pinned by a compile-time rule:
//! string bounds, numeric bounds, or an object rule giving the allowed
//! subtypes, the required object state, and whether the parameter is
//! routed to its underlying context before checking.  The pre-dispatch
//! checkers here validate every caller-supplied parameter against the
//! table and make sure all object parameters share an owner with the
//! target device.

use status::{Error, Result};

use crate::attribute::{ObjectAcl, StateReq, check_object_state};
use crate::dispatch::TableRef;
use crate::message::{KeyDeriveArgs, KeySignArgs, KeyWrapArgs, Msg, MessageData, MessageType,
                     USE_DEFAULT_ALGO};
use crate::object::table::ObjectTable;
use crate::object::{Handle, ObjectType, SubtypeA, SubtypeB};

/// Mechanism identifiers, shared across the wrap, sign and derive
/// message classes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Mechanism {
    Pkcs1 = 1,
    Pkcs1Pgp = 2,
    Pkcs1Raw = 3,
    Cms = 4,
    Kea = 5,
    PrivateKeyWrap = 6,
    PrivateKeyWrapPkcs8 = 7,
    PrivateKeyWrapPgp = 8,
    PrivateKeyWrapOpenPgp = 9,
    Pkcs5 = 10,
    Pkcs12 = 11,
    Ssl = 12,
    Tls = 13,
    Cmp = 14,
    PgpS2k = 15,
}

impl Mechanism {
    pub(crate) fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Pkcs1),
            2 => Some(Self::Pkcs1Pgp),
            3 => Some(Self::Pkcs1Raw),
            4 => Some(Self::Cms),
            5 => Some(Self::Kea),
            6 => Some(Self::PrivateKeyWrap),
            7 => Some(Self::PrivateKeyWrapPkcs8),
            8 => Some(Self::PrivateKeyWrapPgp),
            9 => Some(Self::PrivateKeyWrapOpenPgp),
            10 => Some(Self::Pkcs5),
            11 => Some(Self::Pkcs12),
            12 => Some(Self::Ssl),
            13 => Some(Self::Tls),
            14 => Some(Self::Cmp),
            15 => Some(Self::PgpS2k),
            _ => None,
        }
    }
}

// Size limits shared by the parameter rules.
const MAX_PKC_ENCRYPTED_SIZE: usize = 512;
const MAX_PKC_SIZE: usize = 512;
const MAX_KEY_SIZE: usize = 64;
const MAX_PRIVATE_KEY_SIZE: usize = 1280;
const MAX_ATTRIBUTE_SIZE: usize = 1024;
const MAX_TEXT_SIZE: usize = 64;

/// Rule for one mechanism parameter.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ParamAclEntry {
    Unused,
    /// String that may be absent (a zero length queries the needed
    /// output size).
    StringOpt { min: usize, max: usize },
    String { min: usize, max: usize },
    Numeric { min: i32, max: i32 },
    Object(ObjectAcl),
}

use ParamAclEntry as P;

impl ParamAclEntry {
    fn check_string(&self, data: &[u8]) -> bool {
        match *self {
            P::Unused => data.is_empty(),
            P::StringOpt { min, max } => data.is_empty() || (data.len() >= min && data.len() <= max),
            P::String { min, max } => data.len() >= min && data.len() <= max,
            _ => false,
        }
    }

    fn check_numeric(&self, value: i32) -> bool {
        match *self {
            P::Unused => true,
            P::Numeric { min, max } => {
                if value == USE_DEFAULT_ALGO {
                    return min == USE_DEFAULT_ALGO;
                }
                value >= min && value <= max
            }
            _ => false,
        }
    }
}

pub(crate) struct MechanismAcl {
    pub mechanism: Mechanism,
    pub params: [ParamAclEntry; 5],
}

const fn obj(subtype_a: SubtypeA, state: StateReq, route_to_ctx: bool) -> ParamAclEntry {
    P::Object(ObjectAcl {
        subtype_a,
        subtype_b: SubtypeB::empty(),
        state,
        route_to: if route_to_ctx { Some(ObjectType::Context) } else { None },
    })
}

const CTX_CONV_OR_MAC: SubtypeA = SubtypeA::CTX_CONV.union(SubtypeA::CTX_MAC);

/// Key wrap.  Parameter order: wrapped data, raw key data, context
/// holding the key, wrapping context, auxiliary context.
static WRAP_ACL: [MechanismAcl; 7] = [
    MechanismAcl {
        mechanism: Mechanism::Pkcs1,
        params: [
            P::StringOpt { min: 64, max: MAX_PKC_ENCRYPTED_SIZE },
            P::Unused,
            obj(CTX_CONV_OR_MAC, StateReq::High, false),
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Pkcs1Pgp,
        params: [
            P::StringOpt { min: 64, max: MAX_PKC_ENCRYPTED_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Pkcs1Raw,
        params: [
            P::StringOpt { min: 64, max: MAX_PKC_SIZE },
            P::String { min: 8, max: MAX_KEY_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Cms,
        params: [
            P::StringOpt { min: 8 + 8, max: MAX_KEY_SIZE + 16 },
            P::Unused,
            obj(CTX_CONV_OR_MAC, StateReq::High, false),
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Kea,
        params: [
            // sizeof(TEK(MEK) + Ra)
            P::String { min: 140, max: 140 },
            P::Unused,
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            obj(SubtypeA::CTX_PKC, StateReq::High, false),
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::PrivateKeyWrap,
        params: [
            P::StringOpt { min: 16, max: MAX_PRIVATE_KEY_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::PrivateKeyWrapPkcs8,
        params: [
            P::StringOpt { min: 16, max: MAX_PRIVATE_KEY_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            P::Unused,
        ],
    },
];

/// Key unwrap.  The key-bearing contexts are in the low state here since
/// the unwrap is what loads them.
static UNWRAP_ACL: [MechanismAcl; 8] = [
    MechanismAcl {
        mechanism: Mechanism::Pkcs1,
        params: [
            P::StringOpt { min: 60, max: MAX_PKC_SIZE },
            P::Unused,
            obj(CTX_CONV_OR_MAC, StateReq::Low, false),
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Pkcs1Pgp,
        params: [
            P::StringOpt { min: 60, max: 4 + 2 * MAX_PKC_SIZE },
            P::Unused,
            // Placeholder for the context to contain the key.
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Pkcs1Raw,
        params: [
            P::StringOpt { min: 64, max: MAX_PKC_SIZE },
            P::String { min: 8, max: MAX_PKC_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Cms,
        params: [
            P::String { min: 8 + 8, max: MAX_KEY_SIZE + 16 },
            P::Unused,
            obj(CTX_CONV_OR_MAC, StateReq::Low, false),
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Kea,
        params: [
            P::String { min: 140, max: 140 },
            P::Unused,
            obj(SubtypeA::CTX_CONV, StateReq::Low, false),
            obj(SubtypeA::CTX_PKC, StateReq::High, false),
            obj(SubtypeA::CTX_PKC, StateReq::High, true),
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::PrivateKeyWrap,
        params: [
            P::String { min: 16, max: MAX_PRIVATE_KEY_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::Low, false),
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::PrivateKeyWrapPgp,
        params: [
            P::String { min: 16, max: MAX_PRIVATE_KEY_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::Low, false),
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            P::Unused,
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::PrivateKeyWrapOpenPgp,
        params: [
            P::String { min: 16, max: MAX_PRIVATE_KEY_SIZE },
            P::Unused,
            obj(SubtypeA::CTX_PKC, StateReq::Low, false),
            obj(SubtypeA::CTX_CONV, StateReq::High, false),
            P::Unused,
        ],
    },
];

/// Sign.  Parameter order: signature, hash context, signing context.
static SIGN_ACL: [MechanismAcl; 1] = [MechanismAcl {
    mechanism: Mechanism::Pkcs1,
    params: [
        P::StringOpt { min: 64, max: MAX_PKC_SIZE },
        obj(SubtypeA::CTX_HASH, StateReq::High, false),
        obj(SubtypeA::CTX_PKC, StateReq::High, true),
        P::Unused,
        P::Unused,
    ],
}];

static SIGCHECK_ACL: [MechanismAcl; 1] = [MechanismAcl {
    mechanism: Mechanism::Pkcs1,
    params: [
        P::String { min: 60, max: MAX_PKC_SIZE },
        obj(SubtypeA::CTX_HASH, StateReq::High, false),
        obj(SubtypeA::CTX_PKC, StateReq::High, true),
        P::Unused,
        P::Unused,
    ],
}];

/// Derive.  Parameter order: output data, input data, hash algorithm,
/// salt, iterations.
static DERIVE_ACL: [MechanismAcl; 6] = [
    MechanismAcl {
        mechanism: Mechanism::Pkcs5,
        params: [
            P::String { min: 1, max: MAX_KEY_SIZE },
            P::String { min: 2, max: MAX_ATTRIBUTE_SIZE },
            P::Numeric { min: crate::attribute::algo::SHA1 as i32,
                         max: crate::attribute::algo::SHA2 as i32 },
            P::String { min: 4, max: 512 },
            P::Numeric { min: 1, max: i32::MAX },
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Ssl,
        params: [
            P::String { min: 48, max: 512 },
            P::String { min: 48, max: 512 },
            // SSL uses a fixed dual hash.
            P::Numeric { min: USE_DEFAULT_ALGO, max: USE_DEFAULT_ALGO },
            P::String { min: 64, max: 64 },
            P::Numeric { min: 1, max: 1 },
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Tls,
        params: [
            // The odd lower bounds on the output and salt are needed
            // when generating the TLS hashed MAC and when generating a
            // master secret from a fixed shared key.
            P::String { min: 12, max: 512 },
            P::String { min: 48, max: 512 },
            P::Numeric { min: USE_DEFAULT_ALGO, max: USE_DEFAULT_ALGO },
            P::String { min: 13, max: 512 },
            P::Numeric { min: 1, max: 1 },
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Cmp,
        params: [
            P::String { min: 20, max: 20 },
            P::String { min: 1, max: 512 },
            P::Numeric { min: crate::attribute::algo::SHA1 as i32,
                         max: crate::attribute::algo::SHA1 as i32 },
            P::String { min: 1, max: 512 },
            P::Numeric { min: 1, max: i32::MAX },
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::PgpS2k,
        params: [
            P::String { min: 16, max: MAX_KEY_SIZE },
            P::String { min: 2, max: MAX_ATTRIBUTE_SIZE },
            P::Numeric { min: crate::attribute::algo::HASH_FIRST as i32,
                         max: crate::attribute::algo::HASH_LAST as i32 },
            P::String { min: 8, max: 8 },
            // Zero iterations means don't iterate.
            P::Numeric { min: 0, max: i32::MAX },
        ],
    },
    MechanismAcl {
        mechanism: Mechanism::Pkcs12,
        params: [
            P::String { min: 20, max: 20 },
            P::String { min: 2, max: MAX_TEXT_SIZE },
            P::Numeric { min: crate::attribute::algo::SHA1 as i32,
                         max: crate::attribute::algo::SHA1 as i32 },
            // Salt plus ID byte.
            P::String { min: 9, max: 9 },
            P::Numeric { min: 1, max: i32::MAX },
        ],
    },
];

fn find_acl(table: &'static [MechanismAcl], mechanism: Mechanism) -> Result<&'static MechanismAcl> {
    table
        .iter()
        .find(|acl| acl.mechanism == mechanism)
        .ok_or(Error::ArgValue)
}

/// Validates an object parameter: it must exist, be reachable by the
/// message source, share an owner with the target device, and (after
/// optional routing to its context) satisfy the rule's subtype and state
/// requirements.
fn check_param_object(
    table: &ObjectTable,
    rule: &ParamAclEntry,
    device: Handle,
    msg: Msg,
    param: Option<Handle>,
) -> bool {
    let P::Object(object_acl) = rule else {
        return param.is_none();
    };
    let Some(param) = param else {
        return false;
    };
    if !table.is_valid_object(param)
        || (!msg.internal
            && (table.info(param).is_internal() || !table.info(param).thread_access_ok()))
        || !table.same_owner(device, param)
    {
        return false;
    }
    let target = match object_acl.route_to {
        Some(route) => match table.find_target(param, &[route]) {
            Ok(target) => target,
            Err(_) => return false,
        },
        None => param,
    };
    table
        .info(target)
        .subtype
        .matches(object_acl.subtype_a, object_acl.subtype_b)
        && check_object_state(object_acl.state, table, target)
}

/// Pre-dispatch check for the key wrap/unwrap mechanism messages.
pub(crate) fn check_wrap_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let MessageData::Wrap(args) = data else {
        return Err(Error::ArgStr1);
    };
    let mechanism = Mechanism::from_value(value).ok_or(Error::ArgValue)?;
    let acl = if msg.kind == MessageType::DevExport {
        find_acl(&WRAP_ACL, mechanism)?
    } else {
        find_acl(&UNWRAP_ACL, mechanism)?
    };
    let table = tr.table();

    check_wrap_args(table, acl, handle, msg, args)
}

fn check_wrap_args(
    table: &ObjectTable,
    acl: &MechanismAcl,
    handle: Handle,
    msg: Msg,
    args: &KeyWrapArgs,
) -> Result<()> {
    // A raw mechanism carries its key as string data rather than in a
    // context.
    let is_raw = matches!(acl.params[2], P::Unused);

    if !acl.params[0].check_string(&args.wrapped_data) {
        return Err(Error::ArgStr1);
    }
    if !acl.params[1].check_string(&args.key_data) {
        return Err(Error::ArgStr2);
    }
    if !check_param_object(table, &acl.params[4], handle, msg, args.aux_context) {
        return Err(Error::ArgNum2);
    }

    // The session key must be a valid context of the correct type with a
    // key loaded or not loaded as the mechanism requires.  For raw
    // mechanisms the key travels as string data and no context may be
    // supplied.
    if is_raw {
        if args.key_context.is_some() {
            return Err(Error::ArgNum1);
        }
    } else if !check_param_object(table, &acl.params[2], handle, msg, args.key_context) {
        return Err(Error::ArgNum1);
    }

    // The wrapping key likewise.
    if !check_param_object(table, &acl.params[3], handle, msg, args.wrap_context) {
        return Err(Error::ArgNum2);
    }

    // All the objects involved must have the same owner.
    if is_raw {
        if let Some(wrap) = args.wrap_context {
            if !table.same_owner(handle, wrap) {
                return Err(Error::ArgNum2);
            }
        }
    } else {
        let key = args.key_context.ok_or(Error::ArgNum1)?;
        let wrap = args.wrap_context.ok_or(Error::ArgNum2)?;
        if !table.same_owner(handle, key) {
            return Err(Error::ArgNum1);
        }
        if !table.same_owner(key, wrap) {
            return Err(Error::ArgNum2);
        }
    }

    Ok(())
}

/// Pre-dispatch check for the sign/sig-check mechanism messages.
pub(crate) fn check_sign_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let MessageData::Sign(args) = data else {
        return Err(Error::ArgStr1);
    };
    let mechanism = Mechanism::from_value(value).ok_or(Error::ArgValue)?;
    let acl = if msg.kind == MessageType::DevSign {
        find_acl(&SIGN_ACL, mechanism)?
    } else {
        find_acl(&SIGCHECK_ACL, mechanism)?
    };
    let table = tr.table();

    check_sign_args(table, acl, handle, msg, args)
}

fn check_sign_args(
    table: &ObjectTable,
    acl: &MechanismAcl,
    handle: Handle,
    msg: Msg,
    args: &KeySignArgs,
) -> Result<()> {
    if !acl.params[0].check_string(&args.signature) {
        return Err(Error::ArgStr1);
    }
    if !check_param_object(table, &acl.params[1], handle, msg, args.hash_context) {
        return Err(Error::ArgNum1);
    }
    if !check_param_object(table, &acl.params[2], handle, msg, args.sign_context) {
        return Err(Error::ArgNum2);
    }

    let hash = args.hash_context.ok_or(Error::ArgNum1)?;
    let sign = args.sign_context.ok_or(Error::ArgNum2)?;
    if !table.same_owner(handle, hash) {
        return Err(Error::ArgNum1);
    }
    if !table.same_owner(hash, sign) {
        return Err(Error::ArgNum2);
    }

    Ok(())
}

/// Pre-dispatch check for the key-derivation mechanism messages.  These
/// are pure data transformations, so there are no object parameters and
/// no ownership checks.
pub(crate) fn check_derive_access(
    _tr: &mut TableRef<'_>,
    _handle: Handle,
    _msg: Msg,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let MessageData::Derive(args) = data else {
        return Err(Error::ArgStr1);
    };
    let mechanism = Mechanism::from_value(value).ok_or(Error::ArgValue)?;
    let acl = find_acl(&DERIVE_ACL, mechanism)?;

    check_derive_args(acl, args)
}

fn check_derive_args(acl: &MechanismAcl, args: &KeyDeriveArgs) -> Result<()> {
    if !acl.params[0].check_string(&args.out) {
        return Err(Error::ArgStr1);
    }
    if !acl.params[1].check_string(&args.input) {
        return Err(Error::ArgStr2);
    }
    if !acl.params[2].check_numeric(args.hash_algo) {
        return Err(Error::ArgNum1);
    }
    if !acl.params[3].check_string(&args.salt) {
        return Err(Error::ArgStr1);
    }
    if !acl.params[4].check_numeric(args.iterations) {
        return Err(Error::ArgNum2);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_wrap_mechanism_has_an_unwrap_rule() {
        for acl in &WRAP_ACL {
            assert!(
                UNWRAP_ACL.iter().any(|u| u.mechanism == acl.mechanism
                    || matches!(acl.mechanism, Mechanism::PrivateKeyWrapPkcs8)),
                "no unwrap rule for {:?}",
                acl.mechanism
            );
        }
    }

    #[test]
    fn string_rules() {
        let opt = P::StringOpt { min: 4, max: 8 };
        assert!(opt.check_string(&[]));
        assert!(opt.check_string(&[0; 4]));
        assert!(!opt.check_string(&[0; 3]));
        assert!(!opt.check_string(&[0; 9]));

        let fixed = P::String { min: 4, max: 8 };
        assert!(!fixed.check_string(&[]));
        assert!(fixed.check_string(&[0; 8]));

        assert!(P::Unused.check_string(&[]));
        assert!(!P::Unused.check_string(&[0; 1]));
    }

    #[test]
    fn numeric_rules() {
        let rule = P::Numeric { min: 1, max: 10 };
        assert!(rule.check_numeric(1));
        assert!(!rule.check_numeric(0));
        assert!(!rule.check_numeric(USE_DEFAULT_ALGO));

        let fixed = P::Numeric { min: USE_DEFAULT_ALGO, max: USE_DEFAULT_ALGO };
        assert!(fixed.check_numeric(USE_DEFAULT_ALGO));
    }

    #[test]
    fn derive_rules_reject_out_of_range_iterations() {
        let acl = find_acl(&DERIVE_ACL, Mechanism::Pkcs5).unwrap();
        let mut args = KeyDeriveArgs {
            out: vec![0; 16],
            input: vec![0; 32],
            hash_algo: crate::attribute::algo::SHA1 as i32,
            salt: vec![0; 8],
            iterations: 1000,
        };
        assert_eq!(check_derive_args(acl, &args), Ok(()));
        args.iterations = 0;
        assert_eq!(check_derive_args(acl, &args), Err(Error::ArgNum2));
        args.iterations = 1000;
        args.salt = vec![0; 2];
        assert_eq!(check_derive_args(acl, &args), Err(Error::ArgStr1));
    }

    #[test]
    fn ssl_derive_uses_the_fixed_dual_hash() {
        let acl = find_acl(&DERIVE_ACL, Mechanism::Ssl).unwrap();
        let mut args = KeyDeriveArgs {
            out: vec![0; 48],
            input: vec![0; 48],
            hash_algo: USE_DEFAULT_ALGO,
            salt: vec![0; 64],
            iterations: 1,
        };
        assert_eq!(check_derive_args(acl, &args), Ok(()));
        args.hash_algo = crate::attribute::algo::SHA1 as i32;
        assert_eq!(check_derive_args(acl, &args), Err(Error::ArgNum1));
    }
}

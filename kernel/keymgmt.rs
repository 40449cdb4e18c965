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

//! Key-management ACLs.
//!
//! For each item type a keyset or device can hold, the ACL fixes which
//! keyset/device subtypes accept each access type, which object subtypes
//! may be written, which option flags are legal, and for which access
//! types an ID and/or a password is required.  The ID/password entries
//! cover all access types for which those parameters would be required
//! even if the access itself is currently disallowed, so enabling an
//! access type later only means touching the subtype masks.
//!
//! A few cases are too irregular for a table entry and are hardcoded in
//! the checker: private-key reads take a password for keysets but never
//! for devices (the device password was supplied at login), and
//! getFirst/getNext is told apart from a general query by whether the
//! caller holds the iteration state.

use bitflags::bitflags;
use status::{Error, Result};

use crate::dispatch::TableRef;
use crate::message::{KeyIdKind, KeyMgmtArgs, KeyMgmtFlags, Msg, MessageData, MessageType};
use crate::object::table::ObjectTable;
use crate::object::{Handle, ObjectType, SubtypeA, SubtypeB};

/// The types of item a keyset can hold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ItemType {
    PublicKey = 1,
    PrivateKey = 2,
    SecretKey = 3,
    CertRequest = 4,
    PkiUser = 5,
    RevocationInfo = 6,
    Data = 7,
}

impl ItemType {
    pub(crate) fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::PublicKey),
            2 => Some(Self::PrivateKey),
            3 => Some(Self::SecretKey),
            4 => Some(Self::CertRequest),
            5 => Some(Self::PkiUser),
            6 => Some(Self::RevocationInfo),
            7 => Some(Self::Data),
            _ => None,
        }
    }
}

bitflags! {
    /// Access types, used both to classify the incoming message and to
    /// mark which access types need an ID or password.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct AccessSet: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DELETE = 1 << 2;
        const GET_FIRST = 1 << 3;
        const GET_NEXT = 1 << 4;
        const QUERY = 1 << 5;
    }
}

pub(crate) struct KeymgmtAcl {
    pub item: ItemType,
    /// Keyset/device subtypes accepting read, write and delete.
    pub read: SubtypeA,
    pub write: SubtypeA,
    pub delete: SubtypeA,
    /// Keyset/device subtypes accepting getFirst/getNext.
    pub get_first_next: SubtypeA,
    /// Keyset/device subtypes accepting general queries.
    pub query: SubtypeA,
    /// Object subtypes that may be written for this item.
    pub obj_subtype: SubtypeA,
    pub allowed_flags: KeyMgmtFlags,
    /// Access types for which an ID parameter is required.
    pub id_required: AccessSet,
    /// Access types for which a password (or other aux info) is
    /// required.
    pub password_required: AccessSet,
    /// Keyset subtypes that take a specific object type rather than any
    /// PKC-equivalent, and the object subtypes they demand.
    pub specific_keyset: SubtypeA,
    pub specific_obj: SubtypeA,
}

const ST_NONE: SubtypeA = SubtypeA::empty();
const CERT_OR_CHAIN: SubtypeA = SubtypeA::CERT_CERT.union(SubtypeA::CERT_CERTCHAIN);

static KEY_MANAGEMENT_ACL: [KeymgmtAcl; 7] = [
    KeymgmtAcl {
        item: ItemType::PublicKey,
        read: SubtypeA::KEYSET_ANY.union(SubtypeA::DEV_ANY_STD),
        write: SubtypeA::KEYSET_FILE
            .union(SubtypeA::KEYSET_DBMS)
            .union(SubtypeA::KEYSET_LDAP)
            .union(SubtypeA::DEV_ANY_STD),
        delete: SubtypeA::KEYSET_FILE
            .union(SubtypeA::KEYSET_DBMS)
            .union(SubtypeA::KEYSET_LDAP)
            .union(SubtypeA::DEV_ANY_STD),
        get_first_next: SubtypeA::KEYSET_FILE
            .union(SubtypeA::KEYSET_DBMS)
            .union(SubtypeA::KEYSET_DBMS_STORE),
        query: SubtypeA::KEYSET_DBMS
            .union(SubtypeA::KEYSET_DBMS_STORE)
            .union(SubtypeA::KEYSET_LDAP),
        obj_subtype: SubtypeA::CTX_PKC.union(CERT_OR_CHAIN),
        allowed_flags: KeyMgmtFlags::CHECK_ONLY
            .union(KeyMgmtFlags::LABEL_ONLY)
            .union(KeyMgmtFlags::CERT_OPTIONS),
        id_required: AccessSet::READ
            .union(AccessSet::DELETE)
            .union(AccessSet::GET_FIRST),
        password_required: AccessSet::empty(),
        specific_keyset: SubtypeA::KEYSET_DBMS
            .union(SubtypeA::KEYSET_DBMS_STORE)
            .union(SubtypeA::KEYSET_LDAP),
        specific_obj: CERT_OR_CHAIN,
    },
    KeymgmtAcl {
        item: ItemType::PrivateKey,
        read: SubtypeA::KEYSET_FILE
            .union(SubtypeA::KEYSET_FILE_PARTIAL)
            .union(SubtypeA::DEV_ANY_STD),
        write: SubtypeA::KEYSET_FILE.union(SubtypeA::DEV_ANY_STD),
        delete: SubtypeA::KEYSET_FILE.union(SubtypeA::DEV_ANY_STD),
        get_first_next: ST_NONE,
        query: ST_NONE,
        obj_subtype: SubtypeA::CTX_PKC,
        allowed_flags: KeyMgmtFlags::CHECK_ONLY
            .union(KeyMgmtFlags::LABEL_ONLY)
            .union(KeyMgmtFlags::USAGE_MASK),
        id_required: AccessSet::READ.union(AccessSet::DELETE),
        // Representative entry only; the real private-key password
        // semantics are hardcoded in the checker.
        password_required: AccessSet::READ.union(AccessSet::WRITE),
        specific_keyset: ST_NONE,
        specific_obj: ST_NONE,
    },
    KeymgmtAcl {
        item: ItemType::SecretKey,
        read: SubtypeA::KEYSET_FILE,
        write: SubtypeA::KEYSET_FILE,
        delete: SubtypeA::KEYSET_FILE,
        get_first_next: ST_NONE,
        query: ST_NONE,
        obj_subtype: SubtypeA::CTX_CONV,
        allowed_flags: KeyMgmtFlags::empty(),
        id_required: AccessSet::READ.union(AccessSet::DELETE),
        password_required: AccessSet::READ.union(AccessSet::WRITE),
        specific_keyset: ST_NONE,
        specific_obj: ST_NONE,
    },
    KeymgmtAcl {
        item: ItemType::CertRequest,
        read: SubtypeA::KEYSET_DBMS_STORE,
        write: SubtypeA::KEYSET_DBMS_STORE,
        delete: ST_NONE,
        get_first_next: ST_NONE,
        query: SubtypeA::KEYSET_DBMS_STORE,
        obj_subtype: SubtypeA::CERT_CERTREQ
            .union(SubtypeA::CERT_REQ_CERT)
            .union(SubtypeA::CERT_REQ_REV),
        allowed_flags: KeyMgmtFlags::UPDATE,
        id_required: AccessSet::READ
            .union(AccessSet::DELETE)
            .union(AccessSet::GET_FIRST),
        password_required: AccessSet::empty(),
        specific_keyset: ST_NONE,
        specific_obj: ST_NONE,
    },
    KeymgmtAcl {
        item: ItemType::PkiUser,
        read: SubtypeA::KEYSET_DBMS_STORE,
        write: SubtypeA::KEYSET_DBMS_STORE,
        delete: ST_NONE,
        get_first_next: ST_NONE,
        query: ST_NONE,
        obj_subtype: SubtypeA::CERT_PKIUSER,
        allowed_flags: KeyMgmtFlags::GET_ISSUER,
        id_required: AccessSet::READ
            .union(AccessSet::DELETE)
            .union(AccessSet::GET_FIRST),
        password_required: AccessSet::empty(),
        specific_keyset: ST_NONE,
        specific_obj: ST_NONE,
    },
    KeymgmtAcl {
        item: ItemType::RevocationInfo,
        read: SubtypeA::KEYSET_DBMS.union(SubtypeA::KEYSET_DBMS_STORE),
        write: SubtypeA::KEYSET_DBMS,
        delete: ST_NONE,
        get_first_next: ST_NONE,
        query: ST_NONE,
        obj_subtype: SubtypeA::CERT_CRL,
        allowed_flags: KeyMgmtFlags::CHECK_ONLY,
        id_required: AccessSet::READ
            .union(AccessSet::DELETE)
            .union(AccessSet::GET_FIRST),
        password_required: AccessSet::empty(),
        specific_keyset: ST_NONE,
        specific_obj: ST_NONE,
    },
    KeymgmtAcl {
        item: ItemType::Data,
        read: SubtypeA::KEYSET_FILE,
        write: SubtypeA::KEYSET_FILE,
        delete: ST_NONE,
        get_first_next: ST_NONE,
        query: ST_NONE,
        obj_subtype: ST_NONE,
        allowed_flags: KeyMgmtFlags::empty(),
        id_required: AccessSet::READ.union(AccessSet::WRITE).union(AccessSet::DELETE),
        password_required: AccessSet::empty(),
        specific_keyset: ST_NONE,
        specific_obj: ST_NONE,
    },
];

fn find_acl(item: ItemType) -> &'static KeymgmtAcl {
    let acl = &KEY_MANAGEMENT_ACL[item as usize - 1];
    debug_assert_eq!(acl.item, item);
    acl
}

/// Pre-dispatch check for the keyset access messages: the item type must
/// be appropriate for the keyset subtype and access type, the required
/// ID/password parameters must be present, and any object being written
/// must be of the right subtype and state.
pub(crate) fn check_keyset_access(
    tr: &mut TableRef<'_>,
    handle: Handle,
    msg: Msg,
    data: &mut MessageData,
    value: i32,
) -> Result<()> {
    let MessageData::KeyMgmt(args) = data else {
        return Err(Error::ArgStr1);
    };
    let item = ItemType::from_value(value).ok_or(Error::ArgValue)?;
    let acl = find_acl(item);
    let table = tr.table();

    let access = match msg.kind {
        MessageType::KeyGetKey => AccessSet::READ,
        MessageType::KeySetKey => AccessSet::WRITE,
        MessageType::KeyDeleteKey => AccessSet::DELETE,
        MessageType::KeyGetFirst => AccessSet::GET_FIRST,
        MessageType::KeyGetNext => AccessSet::GET_NEXT,
        _ => {
            debug_assert!(false, "non-keyset message in keyset check");
            return Err(Error::ArgValue);
        }
    };

    // Combined check that the item type is appropriate for this keyset
    // type and the access type is valid.
    let subtype = table.info(handle).subtype;
    match msg.kind {
        MessageType::KeyGetKey => {
            if !subtype.matches(acl.read, SubtypeB::empty()) {
                return Err(Error::ArgObject);
            }
        }
        MessageType::KeySetKey => {
            if !subtype.matches(acl.write, SubtypeB::empty()) {
                return Err(Error::ArgObject);
            }
        }
        MessageType::KeyDeleteKey => {
            if !subtype.matches(acl.delete, SubtypeB::empty()) {
                return Err(Error::ArgObject);
            }
        }
        MessageType::KeyGetFirst | MessageType::KeyGetNext => {
            // The two special-purpose accesses are told apart by where
            // the iteration state lives: getFirst/getNext keeps it in a
            // caller-supplied location, a general query keeps it in the
            // keyset with the result set fixed by an earlier submitted
            // query.
            if args.aux_info.is_none() {
                if !subtype.matches(acl.query, SubtypeB::empty()) {
                    // Report an argument error: there's nothing wrong
                    // with the object, the problem is the missing key
                    // ID.
                    return Err(if args.id_kind == KeyIdKind::None {
                        Error::ArgNum1
                    } else {
                        Error::ArgStr1
                    });
                }
            } else if !subtype.matches(acl.get_first_next, SubtypeB::empty()) {
                return Err(Error::ArgObject);
            }
        }
        _ => unreachable!(),
    }

    // Make sure there's ID information present if required.
    if acl.id_required.contains(access) {
        if args.id_kind == KeyIdKind::None {
            return Err(Error::ArgNum1);
        }
        if args.key_id.is_empty() {
            return Err(Error::ArgStr1);
        }
    }

    // Only allowed option flags, and at most one usage preference.
    if args.flags.intersects(!acl.allowed_flags) {
        return Err(Error::ArgNum2);
    }
    if args.flags.contains(KeyMgmtFlags::USAGE_MASK) {
        return Err(Error::ArgNum2);
    }

    // Password presence.  The private-key semantics are too complex for
    // the table entry: keyset writes must supply one, device accesses
    // never use one (it was supplied at device login), and reads are
    // opportunistic (try without, retry with).
    if item == ItemType::PrivateKey {
        if table.info(handle).object_type == ObjectType::Keyset {
            if msg.kind == MessageType::KeySetKey
                && args.aux_info.as_ref().is_none_or(|aux| aux.is_empty())
            {
                return Err(Error::ArgStr1);
            }
        } else if args.aux_info.is_some() {
            return Err(if acl.password_required.contains(access) {
                Error::ArgStr2
            } else {
                Error::ArgStr1
            });
        }
    } else if acl.password_required.contains(access)
        && msg.kind == MessageType::KeySetKey
        && args.aux_info.as_ref().is_none_or(|aux| aux.is_empty())
    {
        return Err(Error::ArgStr1);
    }

    // Message-type-specific parameter checks.
    if msg.kind == MessageType::KeySetKey {
        check_set_object(table, acl, handle, msg, args)?;
    }

    Ok(())
}

/// Write-specific checks: the object being written must be valid, share
/// an owner with the keyset, be of an appropriate subtype (possibly via
/// an attached context), be in the high state, and for keysets with a
/// specific-object requirement actually be a certificate of the demanded
/// subtype.
fn check_set_object(
    table: &ObjectTable,
    acl: &KeymgmtAcl,
    handle: Handle,
    msg: Msg,
    args: &KeyMgmtArgs,
) -> Result<()> {
    let Some(object) = args.object else {
        return Err(Error::ArgNum1);
    };
    if !table.is_valid_object(object)
        || (!msg.internal
            && (table.info(object).is_internal() || !table.info(object).thread_access_ok()))
        || !table.same_owner(handle, object)
    {
        return Err(Error::ArgNum1);
    }

    // Check for inclusion in the set of valid objects.  A public-key
    // context can have almost any certificate object attached and still
    // be valid here; if only contexts are allowed, look for an attached
    // context and try again.
    let mut checked = object;
    if !table
        .info(object)
        .subtype
        .matches(acl.obj_subtype, SubtypeB::empty())
    {
        if acl.obj_subtype != SubtypeA::CTX_PKC {
            return Err(Error::ArgNum1);
        }
        checked = table
            .find_target(object, &[ObjectType::Context])
            .map_err(|_| Error::ArgNum1)?;
        if !table
            .info(checked)
            .subtype
            .matches(SubtypeA::CTX_PKC, SubtypeB::empty())
        {
            return Err(Error::ArgNum1);
        }
    }

    // PKI user info and revocation requests aren't signed; like the
    // private-key password semantics, that's hardcoded.
    let checked_subtype = table.info(checked).subtype;
    let unsigned_ok = checked_subtype.matches(
        SubtypeA::CERT_PKIUSER.union(SubtypeA::CERT_REQ_REV),
        SubtypeB::empty(),
    );
    if !table.info(checked).is_in_high_state() && !unsigned_ok {
        return Err(Error::ArgNum1);
    }

    // If this keyset subtype doesn't demand a specific object, we're
    // done.
    if !table
        .info(handle)
        .subtype
        .matches(acl.specific_keyset, SubtypeB::empty())
    {
        return Ok(());
    }

    // This keyset needs an actual certificate of a specific subtype, not
    // just a generic PKC-equivalent object.
    let cert = table
        .find_target(object, &[ObjectType::Certificate])
        .map_err(|_| Error::ArgNum1)?;
    if !table
        .info(cert)
        .subtype
        .matches(acl.specific_obj, SubtypeB::empty())
    {
        return Err(Error::ArgNum1);
    }
    if !table.info(cert).is_in_high_state() {
        return Err(Error::ArgNum1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_rows_are_indexed_by_item_type() {
        for item in [
            ItemType::PublicKey,
            ItemType::PrivateKey,
            ItemType::SecretKey,
            ItemType::CertRequest,
            ItemType::PkiUser,
            ItemType::RevocationInfo,
            ItemType::Data,
        ] {
            assert_eq!(find_acl(item).item, item);
        }
    }

    #[test]
    fn private_keys_never_leave_public_keysets() {
        let acl = find_acl(ItemType::PrivateKey);
        assert!(!acl.read.intersects(SubtypeA::KEYSET_DBMS.union(SubtypeA::KEYSET_LDAP)));
        assert_eq!(acl.query, SubtypeA::empty());
        assert_eq!(acl.get_first_next, SubtypeA::empty());
    }

    #[test]
    fn item_type_values_round_trip() {
        for value in 1..=7 {
            assert_eq!(ItemType::from_value(value).map(|i| i as i32), Some(value));
        }
        assert_eq!(ItemType::from_value(0), None);
        assert_eq!(ItemType::from_value(8), None);
    }
}

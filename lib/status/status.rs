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

//! # status
//!
//! The kernel's closed status-code space.  Every operation mediated by the
//! kernel reports its outcome through this one error channel; there is no
//! out-of-band error information, and no code outside this crate may extend
//! the set.  In order to keep the interface idiomatic for Rust, the success
//! code is omitted from the `Error` enum and a `StatusCode` trait is
//! provided to turn a `Result` into a canonical numeric status code.
//!
//! The first six codes are argument errors identifying *which* parameter of
//! a call was bad.  Several kernel checks deliberately collapse more
//! detailed failures onto these codes so that probing for the existence of
//! internal attributes through the error channel is not possible.
//!
//! # Example
//!
//! ```
//! use status::{Error, Result};
//!
//! fn check_len(len: usize) -> Result<usize> {
//!     if len == 0 {
//!         Err(Error::ArgStr1)
//!     } else {
//!         Ok(len)
//!     }
//! }
//!
//! assert_eq!(check_len(16), Ok(16));
//! assert_eq!(check_len(0), Err(Error::ArgStr1));
//! ```

/// Status code for no error.
pub const OK: u32 = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The object handle parameter was invalid.
    ArgObject = 1,
    /// The message value parameter (attribute id, item type, etc) was
    /// invalid.
    ArgValue = 2,
    /// The first string parameter was invalid.
    ArgStr1 = 3,
    /// The second string parameter was invalid.
    ArgStr2 = 4,
    /// The first numeric parameter was invalid.
    ArgNum1 = 5,
    /// The second numeric parameter was invalid.
    ArgNum2 = 6,
    /// A memory allocation failed.
    Memory = 7,
    /// The object hasn't been initialised into its usable state yet.
    NotInited = 8,
    /// The object is already in the high state and can't accept another
    /// state-change trigger.
    AlreadyInited = 9,
    /// A busy-wait on an in-use object ran out of iterations, or the
    /// message queue overflowed.
    Timeout = 10,
    /// The operation is denied by an ACL, a permission ratchet, or the
    /// shutdown gate.
    PermissionDenied = 11,
    /// The requested capability isn't available for this object.
    NotAvail = 12,
    /// The object has been destroyed but is still referenced.
    Signalled = 13,
    /// A fixed-capacity structure overflowed.
    Overflow = 14,
    /// Data failed an integrity or format check.
    BadData = 15,
    /// Decryption produced recognisably-wrong plaintext.
    WrongKey = 16,
    /// A signature check failed.
    Signature = 17,
    /// Generic invalid-state error.
    Invalid = 18,
    /// The operation was only partially completed.
    Incomplete = 19,
    /// Catch-all internal failure.
    Failed = 20,
    /// Out-of-band completion status.  Returned when a completion message
    /// found its target signalled and was converted into a destroy, and
    /// used internally to mark a queued message as deferred.  Never
    /// returned to external callers.
    SpecialCase = 21,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Returns true for the argument-error subset of the code space.
    #[must_use]
    pub const fn is_arg_error(self) -> bool {
        (self as u32) <= (Error::ArgNum2 as u32)
    }
}

/// Convert a Result into a numeric status code.
pub trait StatusCode {
    /// Return the canonical status code for this result.
    fn status_code(self) -> u32;
}

impl<T> StatusCode for Result<T> {
    fn status_code(self) -> u32 {
        match self {
            Ok(_) => OK,
            Err(e) => e as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code() {
        assert_eq!(Result::Ok(()).status_code(), 0);
        assert_eq!(Result::<()>::Err(Error::ArgObject).status_code(), 1);
        assert_eq!(Result::<()>::Err(Error::ArgValue).status_code(), 2);
        assert_eq!(Result::<()>::Err(Error::ArgStr1).status_code(), 3);
        assert_eq!(Result::<()>::Err(Error::ArgStr2).status_code(), 4);
        assert_eq!(Result::<()>::Err(Error::ArgNum1).status_code(), 5);
        assert_eq!(Result::<()>::Err(Error::ArgNum2).status_code(), 6);
        assert_eq!(Result::<()>::Err(Error::Memory).status_code(), 7);
        assert_eq!(Result::<()>::Err(Error::NotInited).status_code(), 8);
        assert_eq!(Result::<()>::Err(Error::AlreadyInited).status_code(), 9);
        assert_eq!(Result::<()>::Err(Error::Timeout).status_code(), 10);
        assert_eq!(
            Result::<()>::Err(Error::PermissionDenied).status_code(),
            11
        );
        assert_eq!(Result::<()>::Err(Error::NotAvail).status_code(), 12);
        assert_eq!(Result::<()>::Err(Error::Signalled).status_code(), 13);
        assert_eq!(Result::<()>::Err(Error::Overflow).status_code(), 14);
        assert_eq!(Result::<()>::Err(Error::BadData).status_code(), 15);
        assert_eq!(Result::<()>::Err(Error::WrongKey).status_code(), 16);
        assert_eq!(Result::<()>::Err(Error::Signature).status_code(), 17);
        assert_eq!(Result::<()>::Err(Error::Invalid).status_code(), 18);
        assert_eq!(Result::<()>::Err(Error::Incomplete).status_code(), 19);
        assert_eq!(Result::<()>::Err(Error::Failed).status_code(), 20);
        assert_eq!(Result::<()>::Err(Error::SpecialCase).status_code(), 21);
    }

    #[test]
    fn test_arg_error_subset() {
        assert!(Error::ArgObject.is_arg_error());
        assert!(Error::ArgNum2.is_arg_error());
        assert!(!Error::Memory.is_arg_error());
        assert!(!Error::SpecialCase.is_arg_error());
    }
}

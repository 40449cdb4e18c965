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

//! Synchronisation primitives the kernel exposes to its collaborators:
//! one-shot semaphores and centrally-managed named mutexes, both keyed
//! by small enum ids so users never initialise or tear down their own
//! OS objects.

pub mod mutex;
pub mod semaphore;

pub use mutex::MutexId;
pub use semaphore::SemaphoreId;

use std::sync::{Condvar, Mutex};

/// The OS-level synchronisation object behind a semaphore: a one-way
/// event that threads can wait on.  Wrapped in an `Arc` by the semaphore
/// table so that the last user out releases it.
pub struct OsEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl OsEvent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = lock(&self.signaled);
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut signaled = lock(&self.signaled);
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

impl Default for OsEvent {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

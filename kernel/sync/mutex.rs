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

//! Centrally-managed named mutexes.
//!
//! Collaborator subsystems share a handful of locks (the session cache,
//! the network socket pool, the randomness poller) without having to
//! initialise or tear down their own.  Since the users hold these
//! across arbitrary code regions rather than lexical scopes, the
//! interface is an explicit enter/exit pair rather than a guard.  The
//! locks are process-local, so they're not exposed to the handle-
//! squatting problems that named OS-global mutexes have.

use std::sync::{Condvar, Mutex};

use super::lock;

/// The mutexes the kernel manages, keyed by id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum MutexId {
    SessionCache = 0,
    SocketPool = 1,
    RandomPolling = 2,
}

pub(crate) const MUTEX_COUNT: usize = 3;

/// A binary semaphore with enter/exit semantics.  Not re-entrant.
struct NamedMutex {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl NamedMutex {
    const fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn enter(&self) {
        let mut locked = lock(&self.locked);
        while *locked {
            locked = self
                .cond
                .wait(locked)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *locked = true;
    }

    fn exit(&self) {
        let mut locked = lock(&self.locked);
        debug_assert!(*locked, "exiting a mutex that isn't held");
        *locked = false;
        self.cond.notify_one();
    }
}

pub(crate) struct MutexTable {
    mutexes: [NamedMutex; MUTEX_COUNT],
}

impl MutexTable {
    pub(crate) const fn new() -> Self {
        Self {
            mutexes: [NamedMutex::new(), NamedMutex::new(), NamedMutex::new()],
        }
    }

    pub(crate) fn enter(&self, id: MutexId) {
        self.mutexes[id as usize].enter();
    }

    pub(crate) fn exit(&self, id: MutexId) {
        self.mutexes[id as usize].exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn enter_exit_provides_mutual_exclusion() {
        let table = Arc::new(MutexTable::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            let counter = Arc::clone(&counter);
            threads.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    table.enter(MutexId::SocketPool);
                    let value = counter.load(Ordering::Relaxed);
                    std::thread::yield_now();
                    counter.store(value + 1, Ordering::Relaxed);
                    table.exit(MutexId::SocketPool);
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 400);
    }

    #[test]
    fn distinct_ids_are_independent() {
        let table = MutexTable::new();
        table.enter(MutexId::SessionCache);
        // A different id can still be taken by the same thread.
        table.enter(MutexId::RandomPolling);
        table.exit(MutexId::RandomPolling);
        table.exit(MutexId::SessionCache);
    }
}

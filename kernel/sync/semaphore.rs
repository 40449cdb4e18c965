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

//! One-shot semaphores.
//!
//! A semaphore is set once, waited on by any number of threads, and
//! cleared once; after clearing it can never be re-set.  The permitted
//! state transitions are:
//!
//! ```text
//!     Uninited -> Set | Clear
//!     Set      -> Set | Clear
//!     Clear    -> Clear
//! ```
//!
//! The complication is teardown: only the last thread using the
//! underlying OS object can safely release it.  The table
//! reference-counts each semaphore, and clearing while waiters remain
//! moves it to the pre-clear state, telling the last waiter out to turn
//! out the lights.

use std::sync::Arc;
use std::sync::Mutex;

use super::{OsEvent, lock};

/// The semaphores the kernel manages, keyed by id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum SemaphoreId {
    /// Device-driver binding has completed.
    DriverBind = 0,
    /// A background randomness poll has completed.
    RandomPoll = 1,
}

pub(crate) const SEMAPHORE_COUNT: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SemaphoreState {
    Uninited,
    Clear,
    PreClear,
    Set,
}

struct SemaphoreInfo {
    state: SemaphoreState,
    event: Option<Arc<OsEvent>>,
    ref_count: u32,
}

impl SemaphoreInfo {
    const fn cleared() -> Self {
        Self {
            state: SemaphoreState::Uninited,
            event: None,
            ref_count: 0,
        }
    }
}

pub(crate) struct SemaphoreTable {
    semaphores: Mutex<[SemaphoreInfo; SEMAPHORE_COUNT]>,
}

impl SemaphoreTable {
    pub(crate) fn new() -> Self {
        Self {
            semaphores: Mutex::new([SemaphoreInfo::cleared(), SemaphoreInfo::cleared()]),
        }
    }

    /// Sets a semaphore, handing it the synchronisation object that
    /// waiters will block on.  Only possible from the uninited state.
    pub(crate) fn set(&self, id: SemaphoreId, event: Arc<OsEvent>) {
        let mut semaphores = lock(&self.semaphores);
        let entry = &mut semaphores[id as usize];
        if entry.state == SemaphoreState::Uninited {
            *entry = SemaphoreInfo::cleared();
            entry.state = SemaphoreState::Set;
            entry.event = Some(event);
        }
    }

    /// Clears a set semaphore.  If threads are still waiting, the entry
    /// moves to pre-clear and the last waiter releases the OS object.
    pub(crate) fn clear(&self, id: SemaphoreId) {
        let mut semaphores = lock(&self.semaphores);
        let entry = &mut semaphores[id as usize];
        if entry.state == SemaphoreState::Set {
            if entry.ref_count > 0 {
                entry.state = SemaphoreState::PreClear;
            } else {
                // No threads waiting, the object can go away now.
                *entry = SemaphoreInfo::cleared();
                entry.state = SemaphoreState::Clear;
            }
        }
    }

    /// Waits until a set semaphore's event fires.  A semaphore that was
    /// never set, or has already been cleared, returns immediately.
    pub(crate) fn wait(&self, id: SemaphoreId) {
        // Extract what we need and drop the table lock before blocking;
        // the wait can take arbitrarily long and must not tie up the
        // other semaphores.
        let event = {
            let mut semaphores = lock(&self.semaphores);
            let entry = &mut semaphores[id as usize];
            if entry.state != SemaphoreState::Set {
                return;
            }
            entry.ref_count += 1;
            match entry.event.as_ref() {
                Some(event) => Arc::clone(event),
                None => {
                    debug_assert!(false, "set semaphore with no event");
                    return;
                }
            }
        };

        event.wait();
        drop(event);

        let mut semaphores = lock(&self.semaphores);
        let entry = &mut semaphores[id as usize];
        if entry.state == SemaphoreState::Set || entry.state == SemaphoreState::PreClear {
            debug_assert!(entry.ref_count > 0);
            entry.ref_count = entry.ref_count.saturating_sub(1);

            // The owner has signalled that it's done with the object and
            // we're the last one out: release it.
            if entry.state == SemaphoreState::PreClear || entry.ref_count == 0 {
                *entry = SemaphoreInfo::cleared();
                entry.state = SemaphoreState::Clear;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_on_unset_semaphore_returns_immediately() {
        let table = SemaphoreTable::new();
        table.wait(SemaphoreId::DriverBind);
    }

    #[test]
    fn set_then_clear_without_waiters_goes_to_clear() {
        let table = SemaphoreTable::new();
        table.set(SemaphoreId::DriverBind, Arc::new(OsEvent::new()));
        table.clear(SemaphoreId::DriverBind);
        {
            let semaphores = lock(&table.semaphores);
            assert_eq!(
                semaphores[SemaphoreId::DriverBind as usize].state,
                SemaphoreState::Clear
            );
            assert!(semaphores[SemaphoreId::DriverBind as usize].event.is_none());
        }
        // A cleared semaphore can never be re-set.
        table.set(SemaphoreId::DriverBind, Arc::new(OsEvent::new()));
        let semaphores = lock(&table.semaphores);
        assert_eq!(
            semaphores[SemaphoreId::DriverBind as usize].state,
            SemaphoreState::Clear
        );
    }

    #[test]
    fn last_waiter_out_releases_the_event() {
        let table = Arc::new(SemaphoreTable::new());
        let event = Arc::new(OsEvent::new());
        table.set(SemaphoreId::RandomPoll, Arc::clone(&event));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.wait(SemaphoreId::RandomPoll))
            })
            .collect();

        // Give the waiters a moment to register, then fire the event and
        // clear the semaphore.
        while lock(&table.semaphores)[SemaphoreId::RandomPoll as usize].ref_count < 4 {
            std::thread::yield_now();
        }
        event.set();
        table.clear(SemaphoreId::RandomPoll);
        for waiter in waiters {
            waiter.join().unwrap();
        }

        let semaphores = lock(&table.semaphores);
        let entry = &semaphores[SemaphoreId::RandomPoll as usize];
        assert_eq!(entry.state, SemaphoreState::Clear);
        assert_eq!(entry.ref_count, 0);
        assert!(entry.event.is_none());
    }
}

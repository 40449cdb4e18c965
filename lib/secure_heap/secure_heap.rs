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

//! # secure_heap
//!
//! Secure-memory allocator for key material and other sensitive data.
//!
//! Every allocation carries a header holding the block size, a page-lock
//! flag, and a link in a doubly-linked list of all live blocks, and is
//! bracketed by canary words that are verified whenever the block is
//! touched through this API.  Where the platform supports it the pages
//! backing a block are locked so that key material never reaches swap.
//! Freeing a block zeroises the payload and the header before the memory
//! is returned to the system allocator.
//!
//! The live-block list exists so that a background sweeper can walk all
//! secure allocations and touch their pages to keep them resident; it
//! also gives the debug build a structure to validate when heap
//! corruption is suspected.

use core::mem;
use core::ptr::{self, NonNull};
use std::alloc::{self, Layout};
use std::sync::Mutex;

use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use status::{Error, Result};

/// Size reserved ahead of the payload for the block header.  Scales with
/// the pointer width so that the payload keeps a generous alignment on
/// every platform.
pub const HEADER_SIZE: usize = if mem::size_of::<usize>() <= 2 {
    16
} else if mem::size_of::<usize>() == 4 {
    32
} else {
    64
};

const CANARY_SIZE: usize = 4;
const CANARY_START: [u8; CANARY_SIZE] = [0xb1, 0x7e, 0x5a, 0xfe];
const CANARY_END: [u8; CANARY_SIZE] = [0x4d, 0x2c, 0x91, 0x6b];

const HEADER_ALIGN: usize = 16;

/// Per-block bookkeeping stored in the reserved space ahead of the
/// payload.  `size` is the full allocation size including the header and
/// the trailing canary.
#[repr(C)]
struct BlockHeader {
    link: LinkedListLink,
    size: usize,
    locked: bool,
    canary: [u8; CANARY_SIZE],
}

const _: () = assert!(mem::size_of::<BlockHeader>() <= HEADER_SIZE);
const _: () = assert!(mem::align_of::<BlockHeader>() <= HEADER_ALIGN);

intrusive_adapter!(BlockAdapter = UnsafeRef<BlockHeader>: BlockHeader { link: LinkedListLink });

/// The secure heap.  One instance is owned by the kernel; all secure
/// allocations in the process go through it so that the sweeper sees
/// every block.
pub struct SecureHeap {
    blocks: Mutex<LinkedList<BlockAdapter>>,
}

// SAFETY: every access to a block header goes through the `blocks` mutex,
// and payload pointers handed out by `alloc` are exclusively owned by the
// caller until passed back to `free`.
unsafe impl Send for SecureHeap {}
unsafe impl Sync for SecureHeap {}

impl SecureHeap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(LinkedList::new(BlockAdapter::new())),
        }
    }

    /// Allocates `size` bytes of zeroed secure memory and returns a
    /// pointer to the payload.  The pages backing the block are locked in
    /// memory where the platform allows it.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 || size > isize::MAX as usize / 2 {
            return Err(Error::ArgNum1);
        }
        let total = HEADER_SIZE + size + CANARY_SIZE;
        let layout = Layout::from_size_align(total, HEADER_ALIGN).map_err(|_| Error::Memory)?;

        // SAFETY: `layout` has non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            return Err(Error::Memory);
        };

        let header = base.as_ptr() as *mut BlockHeader;
        // SAFETY: `base` is a fresh allocation of at least `total` bytes,
        // aligned for `BlockHeader`.
        unsafe {
            ptr::write(
                header,
                BlockHeader {
                    link: LinkedListLink::new(),
                    size: total,
                    locked: page_lock(base.as_ptr(), total),
                    canary: CANARY_START,
                },
            );
            ptr::copy_nonoverlapping(
                CANARY_END.as_ptr(),
                base.as_ptr().add(total - CANARY_SIZE),
                CANARY_SIZE,
            );
        }

        let mut blocks = lock(&self.blocks);
        // SAFETY: the header stays at a stable address until `free`
        // removes it from the list.
        blocks.push_back(unsafe { UnsafeRef::from_raw(header) });

        // SAFETY: the payload starts HEADER_SIZE bytes into the block.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE)) })
    }

    /// Zeroises and frees a block previously returned by [`alloc`].
    ///
    /// Fails with [`Error::BadData`] if either canary has been
    /// overwritten, in which case the block is leaked rather than risking
    /// a free through corrupted list links.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by `alloc` on this heap and not
    /// yet freed.
    ///
    /// [`alloc`]: SecureHeap::alloc
    pub unsafe fn free(&self, payload: NonNull<u8>) -> Result<()> {
        // SAFETY: per the contract, the header sits HEADER_SIZE bytes
        // before the payload.
        let base = unsafe { payload.as_ptr().sub(HEADER_SIZE) };
        let header = base as *mut BlockHeader;

        let mut blocks = lock(&self.blocks);
        // SAFETY: the caller guarantees the block is live, so the header
        // is readable.
        let total = unsafe { (*header).size };
        if !check_canaries(header) {
            debug_assert!(false, "secure heap canary overwritten");
            return Err(Error::BadData);
        }
        #[cfg(debug_assertions)]
        {
            // Walk the live list to detect corruption of the links
            // themselves before we unlink.
            let mut found = false;
            let mut cursor = blocks.front();
            while let Some(block) = cursor.get() {
                if ptr::eq(block, header) {
                    found = true;
                }
                cursor.move_next();
            }
            debug_assert!(found, "freeing a block that isn't on the live list");
        }
        // SAFETY: the header is a live member of `blocks`.
        let _ = unsafe { blocks.cursor_mut_from_ptr(header) }.remove();
        drop(blocks);

        // SAFETY: `header` is no longer reachable from the list and the
        // caller owns the block.
        unsafe {
            if (*header).locked {
                page_unlock(base, total);
            }
            zeroise(base, total);
            let layout = Layout::from_size_align_unchecked(total, HEADER_ALIGN);
            alloc::dealloc(base, layout);
        }
        Ok(())
    }

    /// Returns the payload size of a live block.  O(1) from the header.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by `alloc` on this heap and not
    /// yet freed.
    #[must_use]
    pub unsafe fn size_of(&self, payload: NonNull<u8>) -> usize {
        // SAFETY: per the contract, the header sits HEADER_SIZE bytes
        // before the payload.
        let header = unsafe { payload.as_ptr().sub(HEADER_SIZE) } as *const BlockHeader;
        debug_assert!(check_canaries(header as *mut BlockHeader));
        // SAFETY: the block is live.
        unsafe { (*header).size - HEADER_SIZE - CANARY_SIZE }
    }

    /// Walks the live list touching one byte per page of every block,
    /// keeping locked-out pages resident on platforms where the page lock
    /// is advisory.
    pub fn touch_pages(&self) {
        const PAGE_SIZE: usize = 4096;
        let blocks = lock(&self.blocks);
        let mut cursor = blocks.front();
        while let Some(block) = cursor.get() {
            let base = block as *const BlockHeader as *const u8;
            let mut offset = 0;
            while offset < block.size {
                // SAFETY: `offset` stays inside the block, which is live
                // while it's on the list and the lock is held.
                unsafe { ptr::read_volatile(base.add(offset)) };
                offset += PAGE_SIZE;
            }
            cursor.move_next();
        }
    }

    /// Number of live blocks, for diagnostics and tests.
    #[must_use]
    pub fn block_count(&self) -> usize {
        lock(&self.blocks).iter().count()
    }
}

impl Default for SecureHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SecureHeap {
    fn drop(&mut self) {
        // Any blocks still live at teardown are zeroised and released so
        // that key material can't outlive the heap.
        let mut blocks = lock(&self.blocks);
        while let Some(block) = blocks.pop_front() {
            let header = UnsafeRef::into_raw(block);
            // SAFETY: the block was live on the list and is now unlinked.
            unsafe {
                let total = (*header).size;
                let base = header as *mut u8;
                if (*header).locked {
                    page_unlock(base, total);
                }
                zeroise(base, total);
                alloc::dealloc(base, Layout::from_size_align_unchecked(total, HEADER_ALIGN));
            }
        }
    }
}

fn check_canaries(header: *mut BlockHeader) -> bool {
    // SAFETY: callers only pass headers of live blocks.
    unsafe {
        let base = header as *const u8;
        let total = (*header).size;
        (*header).canary == CANARY_START
            && *(base.add(total - CANARY_SIZE) as *const [u8; CANARY_SIZE]) == CANARY_END
    }
}

/// Overwrites `len` bytes with zeroes through volatile writes so the
/// compiler can't elide the scrub ahead of the free.
unsafe fn zeroise(ptr: *mut u8, len: usize) {
    for i in 0..len {
        // SAFETY: the caller guarantees `ptr..ptr+len` is writable.
        unsafe { ptr::write_volatile(ptr.add(i), 0) };
    }
}

#[cfg(unix)]
fn page_lock(ptr: *mut u8, len: usize) -> bool {
    // mlock can fail for unprivileged processes that have exhausted
    // RLIMIT_MEMLOCK; the allocation is still usable, just swappable.
    // SAFETY: the range is a single live allocation.
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(unix)]
fn page_unlock(ptr: *mut u8, len: usize) {
    // SAFETY: the range was locked by `page_lock`.
    unsafe { libc::munlock(ptr as *const libc::c_void, len) };
}

#[cfg(not(unix))]
fn page_lock(_ptr: *mut u8, _len: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn page_unlock(_ptr: *mut u8, _len: usize) {}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Owning wrapper over a secure allocation.  Frees (and therefore
/// zeroises) the block on drop.
pub struct SecureBuffer<'heap> {
    heap: &'heap SecureHeap,
    payload: NonNull<u8>,
    len: usize,
}

impl<'heap> SecureBuffer<'heap> {
    pub fn new(heap: &'heap SecureHeap, len: usize) -> Result<Self> {
        let payload = heap.alloc(len)?;
        Ok(Self { heap, payload, len })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `payload` points at `len` initialised bytes owned by
        // this buffer.
        unsafe { core::slice::from_raw_parts(self.payload.as_ptr(), self.len) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` gives exclusive access.
        unsafe { core::slice::from_raw_parts_mut(self.payload.as_ptr(), self.len) }
    }
}

impl Drop for SecureBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: `payload` came from `heap.alloc` and is freed once.
        let _ = unsafe { self.heap.free(self.payload) };
    }
}

// SAFETY: the buffer exclusively owns its payload range.
unsafe impl Send for SecureBuffer<'_> {}
unsafe impl Sync for SecureBuffer<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_zeroed_payload() {
        let heap = SecureHeap::new();
        let ptr = heap.alloc(64).unwrap();
        let payload = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(payload.iter().all(|&b| b == 0));
        unsafe { heap.free(ptr).unwrap() };
    }

    #[test]
    fn size_query_is_exact() {
        let heap = SecureHeap::new();
        let ptr = heap.alloc(100).unwrap();
        assert_eq!(unsafe { heap.size_of(ptr) }, 100);
        unsafe { heap.free(ptr).unwrap() };
    }

    #[test]
    fn live_list_tracks_blocks() {
        let heap = SecureHeap::new();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(32).unwrap();
        assert_eq!(heap.block_count(), 2);
        heap.touch_pages();
        unsafe { heap.free(a).unwrap() };
        assert_eq!(heap.block_count(), 1);
        unsafe { heap.free(b).unwrap() };
        assert_eq!(heap.block_count(), 0);
    }

    #[test]
    fn zero_sized_alloc_is_rejected() {
        let heap = SecureHeap::new();
        assert_eq!(heap.alloc(0).unwrap_err(), Error::ArgNum1);
    }

    #[test]
    fn buffer_wrapper_frees_on_drop() {
        let heap = SecureHeap::new();
        {
            let mut buf = SecureBuffer::new(&heap, 24).unwrap();
            buf.as_mut_slice()[0] = 0xa5;
            assert_eq!(buf.len(), 24);
            assert_eq!(heap.block_count(), 1);
        }
        assert_eq!(heap.block_count(), 0);
    }
}

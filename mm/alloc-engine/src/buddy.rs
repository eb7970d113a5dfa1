// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Buddy-system memory allocation.
//!
//! This is a thin wrapper around `buddy_system_allocator::Heap`.

use core::{alloc::Layout, mem::size_of, ptr::NonNull};

use buddy_system_allocator::Heap;

use crate::{AllocError, AllocResult, BaseAllocator, ByteAllocator};

/// Size of the buddy block backing `layout`.
fn block_size(layout: Layout) -> usize {
    layout
        .size()
        .next_power_of_two()
        .max(layout.align())
        .max(size_of::<usize>())
}

/// A byte-granularity memory allocator based on the [buddy_system_allocator].
///
/// Allocations are rounded up to a power of two. An allocation resized in
/// place keeps its block and its original layout, as long as the new size
/// still fits the block.
///
/// [buddy_system_allocator]: https://docs.rs/buddy_system_allocator/latest/buddy_system_allocator/
pub struct BuddyByteAllocator {
    inner: Heap<32>,
    max_used: usize,
}

impl BuddyByteAllocator {
    /// Creates a new empty `BuddyByteAllocator`.
    pub const fn new() -> Self {
        Self {
            inner: Heap::<32>::new(),
            max_used: 0,
        }
    }
}

impl Default for BuddyByteAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseAllocator for BuddyByteAllocator {
    fn init_region(&mut self, start: usize, size: usize) {
        unsafe { self.inner.init(start, size) };
    }

    fn add_region(&mut self, start: usize, size: usize) -> AllocResult {
        let end = start.checked_add(size).ok_or(AllocError::InvalidInput)?;
        unsafe { self.inner.add_to_heap(start, end) };
        Ok(())
    }
}

impl ByteAllocator for BuddyByteAllocator {
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        let ptr = self.inner.alloc(layout).map_err(|_| AllocError::NoMemory)?;
        self.max_used = self.max_used.max(self.inner.stats_alloc_actual());
        Ok(ptr)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.dealloc(ptr, layout)
    }

    fn resize_in_place(
        &mut self,
        _ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> AllocResult<Layout> {
        if new_size <= block_size(layout) {
            Ok(layout)
        } else {
            Err(AllocError::NoMemory)
        }
    }

    fn total_bytes(&self) -> usize {
        self.inner.stats_total_bytes()
    }

    fn used_bytes(&self) -> usize {
        self.inner.stats_alloc_actual()
    }

    fn available_bytes(&self) -> usize {
        self.inner.stats_total_bytes() - self.inner.stats_alloc_actual()
    }

    fn max_used_bytes(&self) -> usize {
        self.max_used
    }

    fn check(&self) -> AllocResult {
        let (user, actual) = (self.inner.stats_alloc_user(), self.inner.stats_alloc_actual());
        if user > actual || actual > self.inner.stats_total_bytes() {
            return Err(AllocError::Corrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::alloc::Layout;
    use std::vec;

    use super::BuddyByteAllocator;
    use crate::{AllocError, BaseAllocator, ByteAllocator};

    fn allocator(heap: &mut [u8]) -> BuddyByteAllocator {
        let mut alloc = BuddyByteAllocator::new();
        alloc.init_region(heap.as_mut_ptr() as usize, heap.len());
        alloc
    }

    #[test]
    fn buddy_allocate_deallocate() {
        let mut heap = vec![0u8; 4096].into_boxed_slice();
        let mut alloc = allocator(&mut heap);
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = alloc.allocate(layout).unwrap();
        assert!(alloc.used_bytes() >= 64);
        alloc.check().unwrap();
        alloc.deallocate(ptr, layout);
        assert_eq!(alloc.used_bytes(), 0);
        assert!(alloc.max_used_bytes() >= 64);
    }

    #[test]
    fn buddy_available_bytes() {
        let mut heap = vec![0u8; 4096].into_boxed_slice();
        let alloc = allocator(&mut heap);
        assert_eq!(alloc.total_bytes(), alloc.available_bytes());
    }

    #[test]
    fn buddy_resize_within_block() {
        let mut heap = vec![0u8; 4096].into_boxed_slice();
        let mut alloc = allocator(&mut heap);
        let layout = Layout::from_size_align(100, 8).unwrap();
        let ptr = alloc.allocate(layout).unwrap();
        assert_eq!(alloc.resize_in_place(ptr, layout, 128), Ok(layout));
        assert_eq!(alloc.resize_in_place(ptr, layout, 8), Ok(layout));
        assert_eq!(
            alloc.resize_in_place(ptr, layout, 129),
            Err(AllocError::NoMemory)
        );
        alloc.deallocate(ptr, layout);
        alloc.check().unwrap();
    }
}

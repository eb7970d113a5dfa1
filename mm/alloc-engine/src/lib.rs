// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Heap allocation algorithms with a unified interface.
//!
//! Every algorithm manages one or more caller-supplied memory ranges and
//! implements [`ByteAllocator`]:
//!
//! - [`FirstFitByteAllocator`]: boundary-tag chunks on a doubly linked free
//!   list, first fit, with splitting and coalescing.
//! - [`BuddyByteAllocator`]: power-of-two blocks from
//!   [`buddy_system_allocator`].
//!
//! None of them locks: callers serialize access, one lock per allocator.
//!
//! [`buddy_system_allocator`]: https://docs.rs/buddy_system_allocator

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "buddy")]
mod buddy;
#[cfg(feature = "buddy")]
pub use buddy::BuddyByteAllocator;

#[cfg(feature = "firstfit")]
mod firstfit;
#[cfg(feature = "firstfit")]
pub use firstfit::FirstFitByteAllocator;

use core::{alloc::Layout, ptr::NonNull};

#[cfg(feature = "kerrno")]
use kerrno::KError;

/// The error type used for allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size` or `align_pow2`. (e.g. unaligned)
    InvalidInput,
    /// Memory added by `add_region` overlapped with existing memory.
    MemoryOverlap,
    /// No enough memory to allocate.
    NoMemory,
    /// Deallocate an unallocated memory region.
    NotAllocated,
    /// The allocator metadata is inconsistent.
    Corrupted,
}

#[cfg(feature = "kerrno")]
impl From<AllocError> for KError {
    fn from(value: AllocError) -> Self {
        match value {
            AllocError::NoMemory => KError::NoMemory,
            AllocError::Corrupted => KError::Corruption,
            _ => KError::InvalidInput,
        }
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// The base allocator inherited by other allocators.
pub trait BaseAllocator {
    /// Initialize the allocator with a free memory region.
    fn init_region(&mut self, base: usize, size: usize);

    /// Add a free memory region to the allocator.
    fn add_region(&mut self, base: usize, size: usize) -> AllocResult;
}

/// Byte-granularity allocator.
pub trait ByteAllocator: BaseAllocator {
    /// Allocate memory with the given size (in bytes) and alignment.
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Deallocate memory at the given position, size, and alignment.
    ///
    /// `layout` is the one returned by the last successful
    /// [`resize_in_place`](Self::resize_in_place) on `ptr`, if any.
    fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);

    /// Resizes the allocation at `ptr` to `new_size` bytes without moving
    /// it, keeping its alignment.
    ///
    /// On success returns the layout `ptr` must be deallocated with from now
    /// on. Fails with [`AllocError::NoMemory`] when the allocation cannot
    /// change size where it is.
    fn resize_in_place(
        &mut self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> AllocResult<Layout> {
        let _ = (ptr, layout, new_size);
        Err(AllocError::NoMemory)
    }

    /// Returns total memory size in bytes.
    fn total_bytes(&self) -> usize;

    /// Returns allocated memory size in bytes.
    fn used_bytes(&self) -> usize;

    /// Returns available memory size in bytes.
    fn available_bytes(&self) -> usize;

    /// Returns the highest [`used_bytes`](Self::used_bytes) ever reached.
    fn max_used_bytes(&self) -> usize;

    /// Walks the allocator metadata and reports any inconsistency as
    /// [`AllocError::Corrupted`]. Never panics on corrupted metadata.
    fn check(&self) -> AllocResult {
        Ok(())
    }
}

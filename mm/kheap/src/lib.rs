// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The kernel heap.
//!
//! A [`Heap`] is a chain of up to [`HEAP_MAX_REGIONS`] memory regions,
//! registered once at boot. Each region runs its own allocation algorithm
//! (see [`HeapAlgorithm`]) under its own lock, so allocations from different
//! regions never contend. Heap operations never block: exhaustion is
//! reported as [`KError::NoMemory`].
//!
//! Every allocation is preceded by a small header recording the region it
//! came from and how to give it back, so [`Heap::free`] finds the owner in
//! O(1) and rejects pointers the heap never handed out.
//!
//! ```no_run
//! use kheap::{HeapAlgorithm, system};
//!
//! static mut ARENA: [u8; 64 * 1024] = [0; 64 * 1024];
//!
//! let heap = system();
//! unsafe {
//!     heap.register_region(&raw mut ARENA as usize, 64 * 1024, HeapAlgorithm::FirstFit)
//!         .unwrap();
//! }
//! let ptr = heap.malloc(100).unwrap();
//! unsafe { heap.free(ptr).unwrap() };
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

mod region;

use core::{
    alloc::{GlobalAlloc, Layout},
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use kerrno::{KError, KResult, k_err};
use kspin::SpinNoIrq;
use lazyinit::LazyInit;
use region::Region;

pub use self::region::{HeapAlgorithm, RegionInfo};

/// Most regions one heap can hold.
pub const HEAP_MAX_REGIONS: usize = kconfig::HEAP_MAX_REGIONS;

/// Alignment of every heap allocation, unless more is asked for.
pub const MIN_ALIGN: usize = 2 * size_of::<usize>();

/// Smallest region [`Heap::register_region`] accepts.
pub const MIN_REGION_SIZE: usize = 256;

const HEAP_MAGIC: u32 = 0x4b48_5041;
const FREED_MAGIC: u32 = 0x4b48_5046;

/// Bookkeeping stored right below every allocation.
#[repr(C)]
#[derive(Clone, Copy)]
struct Header {
    magic: u32,
    region: u32,
    /// Distance from the start of the engine block to the user pointer.
    offset: usize,
    align: usize,
    /// Size asked for by the caller.
    size: usize,
    /// Size of the engine block, as allocated.
    raw_size: usize,
}

const HDR: usize = (size_of::<Header>() + MIN_ALIGN - 1) & !(MIN_ALIGN - 1);

impl Header {
    unsafe fn slot(ptr: NonNull<u8>) -> *mut Header {
        unsafe { ptr.as_ptr().sub(HDR).cast() }
    }

    fn raw(&self, ptr: NonNull<u8>) -> NonNull<u8> {
        // offset was checked against the region bounds
        unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(self.offset)) }
    }

    fn raw_layout(&self) -> Layout {
        // built from a valid layout at allocation time
        unsafe { Layout::from_size_align_unchecked(self.raw_size, MIN_ALIGN) }
    }
}

/// Totals over every region of a heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapInfo {
    /// Bytes the regions can hand out, metadata excluded.
    pub total: usize,
    /// Bytes handed out, headers and alignment padding included.
    pub used: usize,
    /// Sum of the regions' high-water marks.
    pub max_used: usize,
    /// Number of registered regions.
    pub regions: usize,
}

/// A chain of heap regions.
pub struct Heap {
    regions: [LazyInit<Region>; HEAP_MAX_REGIONS],
    count: AtomicUsize,
    registering: SpinNoIrq<()>,
}

static SYSTEM: Heap = Heap::new();

fn check_request(align: usize, size: usize) -> KResult {
    if size == 0 {
        return k_err!(InvalidInput, "zero-sized allocation");
    }
    if !align.is_power_of_two() {
        return k_err!(InvalidInput, "alignment is not a power of two");
    }
    Ok(())
}

/// The process-wide heap.
pub fn system() -> &'static Heap {
    &SYSTEM
}

impl Heap {
    /// Creates a heap without regions.
    pub const fn new() -> Self {
        Self {
            regions: [const { LazyInit::new() }; HEAP_MAX_REGIONS],
            count: AtomicUsize::new(0),
            registering: SpinNoIrq::new(()),
        }
    }

    fn regions(&self) -> impl Iterator<Item = &Region> {
        let count = self.count.load(Ordering::Acquire);
        self.regions[..count].iter().filter_map(LazyInit::get)
    }

    fn region(&self, index: usize) -> Option<&Region> {
        if index < self.count.load(Ordering::Acquire) {
            self.regions[index].get()
        } else {
            None
        }
    }

    /// Adds `[start, start + size)` to the heap as a new region.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if the region is smaller than
    ///   [`MIN_REGION_SIZE`] once aligned, or overlaps a registered region.
    /// - [`KError::NoMemory`] if the heap already has [`HEAP_MAX_REGIONS`].
    ///
    /// # Safety
    ///
    /// The memory must be valid for the rest of the program and must not be
    /// used other than through this heap.
    pub unsafe fn register_region(
        &self,
        start: usize,
        size: usize,
        algorithm: HeapAlgorithm,
    ) -> KResult<usize> {
        let end = start.checked_add(size).ok_or(KError::InvalidInput)? & !(MIN_ALIGN - 1);
        let start = start
            .checked_add(MIN_ALIGN - 1)
            .ok_or(KError::InvalidInput)?
            & !(MIN_ALIGN - 1);
        if end <= start || end - start < MIN_REGION_SIZE {
            return k_err!(InvalidInput, "heap region too small");
        }

        let _guard = self.registering.lock();
        let index = self.count.load(Ordering::Relaxed);
        if self
            .regions()
            .any(|r| start < r.range().end && r.range().start < end)
        {
            return k_err!(InvalidInput, "heap region overlaps another one");
        }
        if index == HEAP_MAX_REGIONS {
            return k_err!(NoMemory, "heap region chain is full");
        }
        let region = unsafe { Region::new(start..end, algorithm) }.map_err(KError::from)?;
        self.regions[index].init_once(region);
        self.count.store(index + 1, Ordering::Release);
        debug!(
            "heap region {}: [{:#x}, {:#x}) {}",
            index, start, end, algorithm
        );
        Ok(index)
    }

    fn alloc_in(&self, index: usize, region: &Region, align: usize, size: usize) -> KResult<NonNull<u8>> {
        let raw_size = size
            .checked_add(HDR + align - MIN_ALIGN)
            .ok_or(KError::NoMemory)?;
        let raw_layout = Layout::from_size_align(raw_size, MIN_ALIGN).map_err(|_| KError::NoMemory)?;
        let raw = region
            .with_engine(|engine| engine.allocate(raw_layout))
            .map_err(|_| KError::NoMemory)?;

        let user = (raw.as_ptr() as usize + HDR + align - 1) & !(align - 1);
        let header = Header {
            magic: HEAP_MAGIC,
            region: index as u32,
            offset: user - raw.as_ptr() as usize,
            align,
            size,
            raw_size,
        };
        unsafe {
            let user = raw.add(header.offset);
            Header::slot(user).write(header);
            Ok(user)
        }
    }

    /// Allocates `size` bytes aligned to `align` from region `index` only.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if `size` is zero, `align` is not a power
    ///   of two or there is no region `index`.
    /// - [`KError::NoMemory`] if the region cannot serve the request.
    pub fn malloc_in(&self, index: usize, align: usize, size: usize) -> KResult<NonNull<u8>> {
        check_request(align, size)?;
        let region = self.region(index).ok_or(KError::InvalidInput)?;
        self.alloc_in(index, region, align.max(MIN_ALIGN), size)
    }

    /// Allocates `size` bytes aligned to `align`, from the first region that
    /// can serve it.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if `size` is zero or `align` is not a power
    ///   of two.
    /// - [`KError::NoMemory`] if no region can serve the request.
    pub fn aligned_malloc(&self, align: usize, size: usize) -> KResult<NonNull<u8>> {
        check_request(align, size)?;
        let align = align.max(MIN_ALIGN);
        self.regions()
            .enumerate()
            .find_map(|(index, region)| self.alloc_in(index, region, align, size).ok())
            .ok_or(KError::NoMemory)
    }

    /// Allocates `size` bytes aligned to [`MIN_ALIGN`].
    pub fn malloc(&self, size: usize) -> KResult<NonNull<u8>> {
        self.aligned_malloc(MIN_ALIGN, size)
    }

    /// Allocates `count * size` zeroed bytes. An empty request, or one whose
    /// size overflows, is [`KError::InvalidInput`].
    pub fn calloc(&self, count: usize, size: usize) -> KResult<NonNull<u8>> {
        let Some(bytes) = count.checked_mul(size) else {
            return k_err!(InvalidInput, "calloc size overflows");
        };
        let ptr = self.malloc(bytes)?;
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Ok(ptr)
    }

    /// Reads and validates the header of `ptr`.
    unsafe fn lookup(&self, ptr: NonNull<u8>) -> KResult<(usize, &Region, Header)> {
        let header = unsafe { Header::slot(ptr).read() };
        if header.magic != HEAP_MAGIC {
            return k_err!(Corruption, "heap block tag mismatch");
        }
        let index = header.region as usize;
        let addr = ptr.as_ptr() as usize;
        match self.region(index) {
            Some(region)
                if header.offset >= HDR
                    && addr >= header.offset
                    && region.contains(addr - header.offset)
                    && region.contains(addr) =>
            {
                Ok((index, region, header))
            }
            _ => k_err!(Corruption, "heap block header is damaged"),
        }
    }

    /// Returns an allocation to its region.
    ///
    /// # Errors
    ///
    /// [`KError::Corruption`] if `ptr` does not carry a valid heap header,
    /// e.g. it was freed already. Nothing is released then.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> KResult {
        let (_, region, mut header) = unsafe { self.lookup(ptr)? };
        let raw = header.raw(ptr);
        header.magic = FREED_MAGIC;
        unsafe { Header::slot(ptr).write(header) };
        region.with_engine(|engine| engine.deallocate(raw, header.raw_layout()));
        Ok(())
    }

    /// Resizes an allocation, keeping its first `min(old, new_size)` bytes.
    ///
    /// `realloc(None, n)` is `malloc(n)`, so `realloc(None, 0)` fails with
    /// [`KError::InvalidInput`], and `realloc(Some(p), 0)` frees
    /// `p` and returns `None`. Otherwise the block is resized in place if
    /// its region allows it, or moved to a new block in the same region,
    /// then in any region. On failure the old block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap. If the block moves or is
    /// freed, the old pointer must not be used afterwards.
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> KResult<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.malloc(new_size).map(Some);
        };
        if new_size == 0 {
            unsafe { self.free(ptr)? };
            return Ok(None);
        }

        let (index, region, mut header) = unsafe { self.lookup(ptr)? };
        let raw = header.raw(ptr);
        if let Some(raw_size) = header.offset.checked_add(new_size) {
            let resized =
                region.with_engine(|engine| engine.resize_in_place(raw, header.raw_layout(), raw_size));
            if let Ok(layout) = resized {
                header.raw_size = layout.size();
                header.size = new_size;
                unsafe { Header::slot(ptr).write(header) };
                return Ok(Some(ptr));
            }
        }

        let new = self
            .alloc_in(index, region, header.align, new_size)
            .or_else(|_| self.aligned_malloc(header.align, new_size))?;
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), header.size.min(new_size));
            self.free(ptr)?;
        }
        Ok(Some(new))
    }

    /// Size the caller asked for when `ptr` was allocated or last resized.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> KResult<usize> {
        unsafe { self.lookup(ptr) }.map(|(_, _, header)| header.size)
    }

    /// Totals over all regions.
    pub fn info(&self) -> HeapInfo {
        self.regions().fold(HeapInfo::default(), |acc, region| {
            let info = region.info();
            HeapInfo {
                total: acc.total + info.total,
                used: acc.used + info.used,
                max_used: acc.max_used + info.max_used,
                regions: acc.regions + 1,
            }
        })
    }

    /// A snapshot of region `index`.
    pub fn region_info(&self, index: usize) -> Option<RegionInfo> {
        self.region(index).map(Region::info)
    }

    /// Number of registered regions.
    pub fn region_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Walks the metadata of every region and returns
    /// [`KError::Corruption`] at the first damaged one, which is logged.
    pub fn check_integrity(&self) -> KResult {
        for (index, region) in self.regions().enumerate() {
            if let Err(err) = region.check() {
                error!("heap region {} is corrupted: {:?}", index, err);
                return Err(KError::Corruption);
            }
        }
        Ok(())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.aligned_malloc(layout.align(), layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            if let Err(err) = unsafe { self.free(ptr) } {
                error!("bad heap free of {:p}: {:?}", ptr, err);
            }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        match unsafe { Heap::realloc(self, NonNull::new(ptr), new_size) } {
            Ok(Some(new)) => new.as_ptr(),
            _ => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests;

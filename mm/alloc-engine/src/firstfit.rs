// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! First-fit allocation over boundary-tagged chunks.
//!
//! Memory is cut into chunks. Every chunk starts with a two-word header:
//!
//! ```text
//! +-----------+-----------------+---------------------------------+
//! | left size | size | USED bit | payload (next, prev if free) .. |
//! +-----------+-----------------+---------------------------------+
//! ```
//!
//! `left size` is the size of the chunk right below, or 0 for the first
//! chunk of a region, so both neighbours are reachable in O(1). Each region
//! ends with a used, zero-sized sentinel header. Free chunks are linked
//! through their payload into one doubly linked list, and two free chunks
//! are never adjacent.

use core::{alloc::Layout, mem::size_of, ptr::NonNull};

use crate::{AllocError, AllocResult, BaseAllocator, ByteAllocator};

const WORD: usize = size_of::<usize>();
const HDR: usize = 2 * WORD;
/// Chunk sizes and addresses are multiples of this.
const GRAN: usize = 2 * WORD;
/// Header plus the two free-list links.
const MIN_CHUNK: usize = 4 * WORD;

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}
const USED: usize = 1;

const MAX_SEGMENTS: usize = 4;

/// Chunk size holding a `size`-byte payload.
fn chunk_size_for(size: usize) -> Option<usize> {
    let payload = size.max(2 * WORD).checked_add(GRAN - 1)? & !(GRAN - 1);
    payload.checked_add(HDR)
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Chunk(usize);

impl Chunk {
    fn from_payload(ptr: NonNull<u8>) -> Self {
        Self(ptr.as_ptr() as usize - HDR)
    }

    fn payload(self) -> usize {
        self.0 + HDR
    }

    unsafe fn word(self, i: usize) -> usize {
        unsafe { ((self.0 + i * WORD) as *const usize).read() }
    }

    unsafe fn set_word(self, i: usize, val: usize) {
        unsafe { ((self.0 + i * WORD) as *mut usize).write(val) }
    }

    unsafe fn left_size(self) -> usize {
        unsafe { self.word(0) }
    }

    unsafe fn set_left_size(self, size: usize) {
        unsafe { self.set_word(0, size) }
    }

    unsafe fn size(self) -> usize {
        unsafe { self.word(1) & !USED }
    }

    unsafe fn is_used(self) -> bool {
        unsafe { self.word(1) & USED != 0 }
    }

    unsafe fn set_header(self, size: usize, used: bool) {
        unsafe { self.set_word(1, size | used as usize) }
    }

    unsafe fn right(self) -> Chunk {
        unsafe { Chunk(self.0 + self.size()) }
    }

    unsafe fn left(self) -> Option<Chunk> {
        match unsafe { self.left_size() } {
            0 => None,
            size => Some(Chunk(self.0 - size)),
        }
    }

    unsafe fn next_free(self) -> usize {
        unsafe { self.word(2) }
    }

    unsafe fn prev_free(self) -> usize {
        unsafe { self.word(3) }
    }

    unsafe fn set_links(self, next: usize, prev: usize) {
        unsafe {
            self.set_word(2, next);
            self.set_word(3, prev);
        }
    }
}

#[derive(Clone, Copy)]
struct Segment {
    start: usize,
    sentinel: usize,
}

impl Segment {
    const EMPTY: Self = Self {
        start: 0,
        sentinel: 0,
    };

    fn end(&self) -> usize {
        self.sentinel + HDR
    }
}

/// A first-fit byte allocator.
///
/// Allocation takes the first free chunk that fits, splitting off the
/// remainder; freeing merges the chunk with free neighbours. Allocations
/// can shrink in place, and grow in place into a free right neighbour.
///
/// Up to four disjoint regions can be added.
pub struct FirstFitByteAllocator {
    free_head: usize,
    segments: [Segment; MAX_SEGMENTS],
    nr_segments: usize,
    total: usize,
    used: usize,
    max_used: usize,
}

impl FirstFitByteAllocator {
    /// Creates a new empty `FirstFitByteAllocator`.
    pub const fn new() -> Self {
        Self {
            free_head: 0,
            segments: [Segment::EMPTY; MAX_SEGMENTS],
            nr_segments: 0,
            total: 0,
            used: 0,
            max_used: 0,
        }
    }

    fn segments(&self) -> &[Segment] {
        &self.segments[..self.nr_segments]
    }

    /// Whether `addr` may be a chunk header of this allocator.
    fn owns(&self, addr: usize) -> bool {
        addr % GRAN == 0
            && self
                .segments()
                .iter()
                .any(|seg| (seg.start..seg.sentinel).contains(&addr))
    }

    fn account_alloc(&mut self, bytes: usize) {
        self.used += bytes;
        self.max_used = self.max_used.max(self.used);
    }

    unsafe fn push_free(&mut self, chunk: Chunk) {
        unsafe {
            chunk.set_links(self.free_head, 0);
            if self.free_head != 0 {
                let head = Chunk(self.free_head);
                head.set_links(head.next_free(), chunk.0);
            }
        }
        self.free_head = chunk.0;
    }

    unsafe fn unlink_free(&mut self, chunk: Chunk) {
        unsafe {
            let (next, prev) = (chunk.next_free(), chunk.prev_free());
            if prev == 0 {
                self.free_head = next;
            } else {
                let p = Chunk(prev);
                p.set_links(next, p.prev_free());
            }
            if next != 0 {
                let n = Chunk(next);
                n.set_links(n.next_free(), prev);
            }
        }
    }

    /// Frees `chunk`, merging it with free neighbours.
    unsafe fn insert_coalesced(&mut self, chunk: Chunk) {
        unsafe {
            let mut chunk = chunk;
            let mut size = chunk.size();
            let right = chunk.right();
            if !right.is_used() {
                self.unlink_free(right);
                size += right.size();
            }
            if let Some(left) = chunk.left() {
                if !left.is_used() {
                    self.unlink_free(left);
                    size += left.size();
                    chunk = left;
                }
            }
            chunk.set_header(size, false);
            chunk.right().set_left_size(size);
            self.push_free(chunk);
        }
    }

    /// Cuts a free tail off `chunk` (currently `size` bytes) so it keeps
    /// `need` bytes, if the tail can stand as a chunk. Returns the size
    /// `chunk` ends up with.
    unsafe fn split_off(&mut self, chunk: Chunk, size: usize, need: usize) -> usize {
        if size - need < MIN_CHUNK {
            return size;
        }
        unsafe {
            let rest = Chunk(chunk.0 + need);
            rest.set_left_size(need);
            rest.set_header(size - need, false);
            rest.right().set_left_size(size - need);
            self.push_free(rest);
        }
        need
    }

    /// Bytes to skip at the start of `chunk`'s payload so that it is aligned
    /// to `align`, leaving room for a free chunk in the gap.
    fn lead_for(chunk: Chunk, align: usize) -> usize {
        let payload = chunk.payload();
        let mut aligned = align_up(payload, align);
        if aligned != payload && aligned - payload < MIN_CHUNK {
            aligned = align_up(payload + MIN_CHUNK, align);
        }
        aligned - payload
    }

    unsafe fn take(&mut self, chunk: Chunk, lead: usize, need: usize) -> usize {
        unsafe {
            self.unlink_free(chunk);
            let mut chunk = chunk;
            let mut size = chunk.size();
            if lead > 0 {
                let aligned = Chunk(chunk.0 + lead);
                chunk.set_header(lead, false);
                self.push_free(chunk);
                size -= lead;
                aligned.set_left_size(lead);
                aligned.set_header(size, false);
                aligned.right().set_left_size(size);
                chunk = aligned;
            }
            let size = self.split_off(chunk, size, need);
            chunk.set_header(size, true);
            self.account_alloc(size);
            chunk.payload()
        }
    }
}

impl Default for FirstFitByteAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseAllocator for FirstFitByteAllocator {
    fn init_region(&mut self, start: usize, size: usize) {
        *self = Self::new();
        if let Err(err) = self.add_region(start, size) {
            panic!("first-fit region {start:#x}+{size:#x} rejected: {err:?}");
        }
    }

    fn add_region(&mut self, base: usize, size: usize) -> AllocResult {
        let start = align_up(base, GRAN);
        let end = align_down(base.checked_add(size).ok_or(AllocError::InvalidInput)?, GRAN);
        if end <= start || end - start < HDR + MIN_CHUNK {
            return Err(AllocError::InvalidInput);
        }
        if self
            .segments()
            .iter()
            .any(|seg| start < seg.end() && seg.start < end)
        {
            return Err(AllocError::MemoryOverlap);
        }
        if self.nr_segments == MAX_SEGMENTS {
            return Err(AllocError::NoMemory);
        }

        let first = Chunk(start);
        let sentinel = Chunk(end - HDR);
        let size = sentinel.0 - start;
        unsafe {
            first.set_left_size(0);
            first.set_header(size, false);
            sentinel.set_left_size(size);
            sentinel.set_header(0, true);
            self.push_free(first);
        }
        self.segments[self.nr_segments] = Segment {
            start,
            sentinel: sentinel.0,
        };
        self.nr_segments += 1;
        self.total += size;
        Ok(())
    }
}

impl ByteAllocator for FirstFitByteAllocator {
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        let need = chunk_size_for(layout.size()).ok_or(AllocError::NoMemory)?;
        let align = layout.align().max(GRAN);
        let mut cur = self.free_head;
        while cur != 0 {
            let chunk = Chunk(cur);
            let (size, next) = unsafe { (chunk.size(), chunk.next_free()) };
            let lead = Self::lead_for(chunk, align);
            if lead.checked_add(need).is_some_and(|n| n <= size) {
                let payload = unsafe { self.take(chunk, lead, need) };
                return NonNull::new(payload as *mut u8).ok_or(AllocError::NoMemory);
            }
            cur = next;
        }
        Err(AllocError::NoMemory)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        let chunk = Chunk::from_payload(ptr);
        unsafe {
            assert!(
                self.owns(chunk.0) && chunk.is_used(),
                "first-fit: {ptr:p} is not an allocated chunk"
            );
            self.used -= chunk.size();
            self.insert_coalesced(chunk);
        }
    }

    fn resize_in_place(
        &mut self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> AllocResult<Layout> {
        let new_layout =
            Layout::from_size_align(new_size, layout.align()).map_err(|_| AllocError::InvalidInput)?;
        let need = chunk_size_for(new_size).ok_or(AllocError::NoMemory)?;
        let chunk = Chunk::from_payload(ptr);
        unsafe {
            let cur = chunk.size();
            if need <= cur {
                if cur - need >= MIN_CHUNK {
                    let rest = Chunk(chunk.0 + need);
                    chunk.set_header(need, true);
                    rest.set_left_size(need);
                    rest.set_header(cur - need, false);
                    self.used -= cur - need;
                    self.insert_coalesced(rest);
                }
                return Ok(new_layout);
            }

            let right = chunk.right();
            if right.is_used() || cur + right.size() < need {
                return Err(AllocError::NoMemory);
            }
            self.unlink_free(right);
            let size = self.split_off(chunk, cur + right.size(), need);
            chunk.set_header(size, true);
            chunk.right().set_left_size(size);
            self.account_alloc(size - cur);
        }
        Ok(new_layout)
    }

    fn total_bytes(&self) -> usize {
        self.total
    }

    fn used_bytes(&self) -> usize {
        self.used
    }

    fn available_bytes(&self) -> usize {
        self.total - self.used
    }

    fn max_used_bytes(&self) -> usize {
        self.max_used
    }

    fn check(&self) -> AllocResult {
        let mut used = 0;
        let mut free_chunks = 0;
        for seg in self.segments() {
            let mut chunk = Chunk(seg.start);
            let mut left = 0;
            let mut left_free = false;
            while chunk.0 < seg.sentinel {
                let (size, free) = unsafe {
                    if chunk.left_size() != left {
                        return Err(AllocError::Corrupted);
                    }
                    (chunk.size(), !chunk.is_used())
                };
                if size < MIN_CHUNK || size % GRAN != 0 || size > seg.sentinel - chunk.0 {
                    return Err(AllocError::Corrupted);
                }
                if free && left_free {
                    return Err(AllocError::Corrupted);
                }
                if free {
                    free_chunks += 1;
                } else {
                    used += size;
                }
                left_free = free;
                left = size;
                chunk = Chunk(chunk.0 + size);
            }
            let sentinel_ok = unsafe { chunk.left_size() == left && chunk.word(1) == USED };
            if chunk.0 != seg.sentinel || !sentinel_ok {
                return Err(AllocError::Corrupted);
            }
        }
        if used != self.used {
            return Err(AllocError::Corrupted);
        }

        let mut listed = 0;
        let mut prev = 0;
        let mut cur = self.free_head;
        while cur != 0 {
            listed += 1;
            if listed > free_chunks || !self.owns(cur) {
                return Err(AllocError::Corrupted);
            }
            let chunk = Chunk(cur);
            unsafe {
                if chunk.is_used() || chunk.prev_free() != prev {
                    return Err(AllocError::Corrupted);
                }
                prev = cur;
                cur = chunk.next_free();
            }
        }
        if listed != free_chunks {
            return Err(AllocError::Corrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{vec, vec::Vec};

    use rand::{Rng, SeedableRng, rngs::SmallRng};

    use super::*;

    /// Heap memory aligned to 16 bytes.
    fn arena(bytes: usize) -> Vec<u128> {
        vec![0u128; bytes / 16]
    }

    fn allocator(mem: &mut [u128]) -> FirstFitByteAllocator {
        let mut alloc = FirstFitByteAllocator::new();
        alloc.init_region(mem.as_mut_ptr() as usize, mem.len() * 16);
        alloc
    }

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn allocate_deallocate() {
        let mut mem = arena(4096);
        let mut alloc = allocator(&mut mem);
        assert_eq!(alloc.total_bytes(), alloc.available_bytes());

        let l = layout(64, 8);
        let ptr = alloc.allocate(l).unwrap();
        assert!(alloc.used_bytes() >= 64);
        alloc.check().unwrap();
        alloc.deallocate(ptr, l);
        assert_eq!(alloc.used_bytes(), 0);
        assert!(alloc.max_used_bytes() >= 64);
        alloc.check().unwrap();
    }

    #[test]
    fn aligned_allocations() {
        let mut mem = arena(64 * 1024);
        let mut alloc = allocator(&mut mem);
        let mut ptrs = Vec::new();
        for align in [8, 32, 64, 256, 4096] {
            let l = layout(40, align);
            let ptr = alloc.allocate(l).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            ptrs.push((ptr, l));
            alloc.check().unwrap();
        }
        for (ptr, l) in ptrs {
            alloc.deallocate(ptr, l);
        }
        alloc.check().unwrap();
        assert_eq!(alloc.used_bytes(), 0);
    }

    #[test]
    fn free_neighbours_coalesce() {
        let mut mem = arena(4096);
        let mut alloc = allocator(&mut mem);
        let total = alloc.total_bytes();
        let l = layout(500, 8);
        let a = alloc.allocate(l).unwrap();
        let b = alloc.allocate(l).unwrap();
        let c = alloc.allocate(l).unwrap();
        alloc.deallocate(b, l);
        alloc.deallocate(a, l);
        alloc.deallocate(c, l);
        alloc.check().unwrap();

        // one chunk again, big enough for everything
        let all = layout(total - HDR, 8);
        let ptr = alloc.allocate(all).unwrap();
        assert_eq!(alloc.available_bytes(), 0);
        alloc.deallocate(ptr, all);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut mem = arena(1024);
        let mut alloc = allocator(&mut mem);
        assert_eq!(alloc.allocate(layout(4096, 8)), Err(AllocError::NoMemory));
        assert_eq!(
            alloc.allocate(layout(isize::MAX as usize - 64, 8)),
            Err(AllocError::NoMemory)
        );
        alloc.check().unwrap();
    }

    #[test]
    fn resize_in_place_shrinks_and_grows() {
        let mut mem = arena(4096);
        let mut alloc = allocator(&mut mem);
        let l = layout(256, 8);
        let ptr = alloc.allocate(l).unwrap();
        let used = alloc.used_bytes();

        let small = alloc.resize_in_place(ptr, l, 64).unwrap();
        assert_eq!(small.size(), 64);
        assert!(alloc.used_bytes() < used);
        alloc.check().unwrap();

        let big = alloc.resize_in_place(ptr, small, 1024).unwrap();
        assert_eq!(big.size(), 1024);
        alloc.check().unwrap();

        // a used right neighbour blocks growth
        let blocker = alloc.allocate(layout(16, 8)).unwrap();
        assert_eq!(
            alloc.resize_in_place(ptr, big, 4000),
            Err(AllocError::NoMemory)
        );
        alloc.deallocate(blocker, layout(16, 8));
        alloc.deallocate(ptr, big);
        assert_eq!(alloc.used_bytes(), 0);
        alloc.check().unwrap();
    }

    #[test]
    fn regions_are_disjoint() {
        let mut mem = arena(4096);
        let base = mem.as_mut_ptr() as usize;
        let mut alloc = FirstFitByteAllocator::new();
        alloc.add_region(base, 2048).unwrap();
        assert_eq!(alloc.add_region(base + 1024, 2048), Err(AllocError::MemoryOverlap));
        assert_eq!(alloc.add_region(base + 2048, 8), Err(AllocError::InvalidInput));
        alloc.add_region(base + 2048, 2048).unwrap();

        // chunks never span two regions
        assert_eq!(alloc.allocate(layout(3000, 8)), Err(AllocError::NoMemory));
        let l = layout(1500, 8);
        let a = alloc.allocate(l).unwrap();
        let b = alloc.allocate(l).unwrap();
        alloc.check().unwrap();
        alloc.deallocate(a, l);
        alloc.deallocate(b, l);
        alloc.check().unwrap();
    }

    #[test]
    fn check_reports_corruption() {
        let mut mem = arena(4096);
        let mut alloc = allocator(&mut mem);
        let l = layout(64, 8);
        let a = alloc.allocate(l).unwrap();
        let _b = alloc.allocate(l).unwrap();
        alloc.check().unwrap();

        // scribble over a's header through an underflow
        unsafe { (a.as_ptr() as *mut usize).sub(1).write(0xdead_beef) };
        assert_eq!(alloc.check(), Err(AllocError::Corrupted));
    }

    #[test]
    #[should_panic(expected = "not an allocated chunk")]
    fn double_free_panics() {
        let mut mem = arena(4096);
        let mut alloc = allocator(&mut mem);
        let l = layout(64, 8);
        let a = alloc.allocate(l).unwrap();
        let _b = alloc.allocate(l).unwrap();
        alloc.deallocate(a, l);
        alloc.deallocate(a, l);
    }

    #[test]
    fn random_workload_keeps_metadata_sound() {
        let mut mem = arena(256 * 1024);
        let mut alloc = allocator(&mut mem);
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut live: Vec<(NonNull<u8>, Layout, u8)> = Vec::new();

        for round in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let l = layout(rng.gen_range(1..2048), 1 << rng.gen_range(0..8));
                if let Ok(ptr) = alloc.allocate(l) {
                    let fill = round as u8;
                    unsafe { ptr.as_ptr().write_bytes(fill, l.size()) };
                    live.push((ptr, l, fill));
                }
            } else {
                let (ptr, l, fill) = live.swap_remove(rng.gen_range(0..live.len()));
                let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), l.size()) };
                assert!(bytes.iter().all(|&b| b == fill));
                alloc.deallocate(ptr, l);
            }
            assert!(alloc.used_bytes() <= alloc.total_bytes());
            if round % 64 == 0 {
                alloc.check().unwrap();
            }
        }
        for (ptr, l, _) in live {
            alloc.deallocate(ptr, l);
        }
        alloc.check().unwrap();
        assert_eq!(alloc.used_bytes(), 0);
    }
}

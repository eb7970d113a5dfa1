// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Fixed-block memory pools.
//!
//! A [`MemPool`] cuts one buffer into equal blocks kept on an intrusive free
//! list: the first word of every free block links to the next free block.
//! Allocation and release are O(1). A task may wait for a block with a
//! timeout; a released block then goes straight to the waiter chosen by the
//! pool's [`WakePolicy`].
//!
//! With the `tag` feature (on by default) every block starts with a
//! signature word derived from the pool, written on allocation and checked
//! on release, so foreign pointers, double frees and underflowing writes are
//! caught as [`KError::Corruption`]. The usable block size excludes that
//! word.
//!
//! ```no_run
//! use ktask::Timeout;
//! use mempool::MemPool;
//!
//! let pool = MemPool::create("frames", 16, 128).unwrap();
//! let frame = pool.alloc(Timeout::from_millis(10)).unwrap();
//! pool.free(frame).unwrap();
//! pool.destroy().unwrap();
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::sync::Arc;
use core::{
    fmt,
    mem::{align_of, size_of},
    ptr::NonNull,
};

use kerrno::{KError, KResult, k_err};
use kheap::Heap;
use ksync::{
    KName, WakePolicy,
    wait_list::{WaitList, Waiter, wait_for},
};
use kspin::SpinNoIrq;
use ktask::Timeout;

/// Alignment of every block.
pub const POOL_ALIGN: usize = align_of::<usize>();

/// Bytes of each block taken by the signature word.
#[cfg(feature = "tag")]
pub const TAG_SIZE: usize = size_of::<usize>();
/// Bytes of each block taken by the signature word.
#[cfg(not(feature = "tag"))]
pub const TAG_SIZE: usize = 0;

/// Odd, so a tag never reads as a free-list link.
#[cfg(feature = "tag")]
const POOL_MAGIC: usize = 0x4d50_4f4f;

const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Distance between two blocks for a usable size of `block_size`.
fn stride_for(block_size: usize) -> Option<usize> {
    let raw = block_size.checked_add(TAG_SIZE + POOL_ALIGN - 1)? & !(POOL_ALIGN - 1);
    Some(raw.max(size_of::<usize>()))
}

/// A snapshot of a pool, see [`MemPool::info`].
#[derive(Clone, Copy, Debug)]
pub struct PoolInfo {
    /// Name given at creation.
    pub name: KName,
    /// Usable bytes per block.
    pub block_size: usize,
    /// Number of blocks the pool was carved into.
    pub total_blocks: usize,
    /// Number of blocks on the free list.
    pub free_blocks: usize,
    /// Policy choosing which blocked allocator gets a freed block.
    pub policy: WakePolicy,
    /// Number of tasks waiting for a block.
    pub waiters: usize,
}

enum Backing {
    /// Caller memory, borrowed for the life of the program.
    Static,
    /// A buffer from `heap`, given back when the pool is dropped.
    Heap { heap: &'static Heap, buf: usize },
}

struct PoolState {
    free_head: usize,
    free_blocks: usize,
    waiters: WaitList,
    destroyed: bool,
}

/// A pool of fixed-size blocks.
pub struct MemPool {
    name: KName,
    start: usize,
    stride: usize,
    total_blocks: usize,
    backing: Backing,
    state: SpinNoIrq<PoolState>,
}

impl MemPool {
    fn build(name: &str, start: usize, len: usize, stride: usize, backing: Backing) -> Self {
        let total_blocks = len / stride;
        // address order: block 0 first
        let mut next = 0;
        for i in (0..total_blocks).rev() {
            let block = start + i * stride;
            unsafe { (block as *mut usize).write(next) };
            next = block;
        }
        Self {
            name: KName::new(name),
            start,
            stride,
            total_blocks,
            backing,
            state: SpinNoIrq::new(PoolState {
                free_head: next,
                free_blocks: total_blocks,
                waiters: WaitList::new(WakePolicy::Priority),
                destroyed: false,
            }),
        }
    }

    /// Builds a pool of `block_size`-byte blocks in caller memory.
    ///
    /// The buffer is trimmed to [`POOL_ALIGN`] and holds as many blocks as
    /// fit.
    ///
    /// # Errors
    ///
    /// [`KError::InvalidInput`] if `block_size` is zero or not even one block
    /// fits.
    pub fn init(name: &str, buf: &'static mut [u8], block_size: usize) -> KResult<Self> {
        let stride = match stride_for(block_size) {
            Some(stride) if block_size > 0 => stride,
            _ => return k_err!(InvalidInput, "bad pool block size"),
        };
        let addr = buf.as_mut_ptr() as usize;
        let start = align_up(addr, POOL_ALIGN);
        let end = (addr + buf.len()) & !(POOL_ALIGN - 1);
        if end <= start || end - start < stride {
            return k_err!(InvalidInput, "pool buffer holds no block");
        }
        let pool = Self::build(name, start, end - start, stride, Backing::Static);
        debug!(
            "pool {} over [{:#x}, {:#x}): {} x {}",
            pool.name,
            start,
            end,
            pool.total_blocks,
            pool.block_size()
        );
        Ok(pool)
    }

    /// Creates a pool of `count` blocks with a buffer from `heap`.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if `count` or `block_size` is zero.
    /// - [`KError::NoMemory`] if the heap cannot provide the buffer.
    pub fn create_in(
        heap: &'static Heap,
        name: &str,
        count: usize,
        block_size: usize,
    ) -> KResult<Arc<Self>> {
        let stride = match stride_for(block_size) {
            Some(stride) if block_size > 0 && count > 0 => stride,
            _ => return k_err!(InvalidInput, "bad pool geometry"),
        };
        let len = count.checked_mul(stride).ok_or(KError::NoMemory)?;
        let buf = heap.aligned_malloc(POOL_ALIGN, len)?.as_ptr() as usize;
        let pool = Self::build(name, buf, len, stride, Backing::Heap { heap, buf });
        debug!("pool {} created: {} x {}", pool.name, count, pool.block_size());
        Ok(Arc::new(pool))
    }

    /// Creates a pool of `count` blocks on the [system heap](kheap::system).
    pub fn create(name: &str, count: usize, block_size: usize) -> KResult<Arc<Self>> {
        Self::create_in(kheap::system(), name, count, block_size)
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Usable bytes per block.
    pub fn block_size(&self) -> usize {
        self.stride - TAG_SIZE
    }

    /// Number of blocks in the pool.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Number of blocks on the free list.
    pub fn free_blocks(&self) -> usize {
        self.state.lock().free_blocks
    }

    #[cfg(feature = "tag")]
    fn signature(&self) -> usize {
        POOL_MAGIC ^ self.start
    }

    /// Whether `block` is the start of one of the pool's blocks.
    fn is_block(&self, block: usize) -> bool {
        block >= self.start
            && block < self.start + self.total_blocks * self.stride
            && (block - self.start) % self.stride == 0
    }

    fn pop_free(&self, state: &mut PoolState) -> Option<usize> {
        let block = state.free_head;
        if block == 0 {
            return None;
        }
        let next = unsafe { (block as *const usize).read() };
        assert!(
            next == 0 || self.is_block(next),
            "pool {}: free list corrupted at {:#x}",
            self.name,
            block
        );
        state.free_head = next;
        state.free_blocks -= 1;
        Some(block)
    }

    /// Turns a block into the pointer handed to the caller.
    fn hand_out(&self, block: usize) -> NonNull<u8> {
        #[cfg(feature = "tag")]
        unsafe {
            (block as *mut usize).write(self.signature())
        };
        // blocks lie inside a non-null buffer
        unsafe { NonNull::new_unchecked((block + TAG_SIZE) as *mut u8) }
    }

    /// Takes a block, waiting up to `timeout` for one to be freed.
    ///
    /// # Errors
    ///
    /// - [`KError::NoMemory`] if the pool is empty and `timeout` is
    ///   [`Timeout::NoWait`].
    /// - [`KError::TimedOut`] if no block was freed in time.
    /// - [`KError::Destroyed`] if the pool is or gets torn down.
    pub fn alloc(&self, timeout: Timeout) -> KResult<NonNull<u8>> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        if let Some(block) = self.pop_free(&mut state) {
            drop(state);
            return Ok(self.hand_out(block));
        }
        if timeout.is_no_wait() {
            return Err(KError::NoMemory);
        }

        let waiter = Waiter::current();
        state.waiters.push(waiter.clone())?;
        drop(state);

        let block = wait_for(&self.state, &waiter, timeout.deadline(), |state, waiter| {
            state.waiters.remove(waiter);
        })?;
        Ok(self.hand_out(block))
    }

    /// Takes a block only if one is free.
    pub fn try_alloc(&self) -> KResult<NonNull<u8>> {
        self.alloc(Timeout::NoWait)
    }

    /// Gives a block back, or hands it to the next waiter.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if `ptr` is not a block of this pool.
    /// - [`KError::Corruption`] if the block's tag is wrong, e.g. the block
    ///   is already free. The block is not released.
    /// - [`KError::Destroyed`] if the pool has been torn down.
    pub fn free(&self, ptr: NonNull<u8>) -> KResult {
        let Some(block) = (ptr.as_ptr() as usize).checked_sub(TAG_SIZE) else {
            return k_err!(InvalidInput, self.name);
        };
        if !self.is_block(block) {
            return k_err!(InvalidInput, self.name);
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        #[cfg(feature = "tag")]
        if unsafe { (block as *const usize).read() } != self.signature() {
            return k_err!(Corruption, self.name);
        }

        if let Some(waiter) = state.waiters.pop() {
            trace!("pool {} hands {:#x} to task {}", self.name, block, waiter.task().as_u64());
            waiter.grant(block);
            return Ok(());
        }
        unsafe { (block as *mut usize).write(state.free_head) };
        state.free_head = block;
        state.free_blocks += 1;
        assert!(
            state.free_blocks <= self.total_blocks,
            "pool {}: more free blocks than blocks",
            self.name
        );
        Ok(())
    }

    /// Whether `ptr` points into the pool's buffer.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.start && addr < self.start + self.total_blocks * self.stride
    }

    /// The policy choosing which waiter gets the next freed block.
    pub fn wake_policy(&self) -> WakePolicy {
        self.state.lock().waiters.policy()
    }

    /// Changes the wake policy. Only allowed while nobody waits.
    pub fn set_wake_policy(&self, policy: WakePolicy) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        state.waiters.set_policy(policy)
    }

    /// Takes a snapshot of the pool.
    pub fn info(&self) -> PoolInfo {
        let state = self.state.lock();
        PoolInfo {
            name: self.name,
            block_size: self.block_size(),
            total_blocks: self.total_blocks,
            free_blocks: state.free_blocks,
            policy: state.waiters.policy(),
            waiters: state.waiters.len(),
        }
    }

    /// Tears the pool down, waking every waiter with [`KError::Destroyed`].
    ///
    /// Blocks still allocated stay valid memory until the pool is dropped,
    /// but can no longer be freed.
    pub fn deinit(&self) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        state.destroyed = true;
        let woken = state.waiters.cancel_all();
        let outstanding = self.total_blocks - state.free_blocks;
        debug!(
            "pool {} torn down, {} waiters woken, {} blocks outstanding",
            self.name, woken, outstanding
        );
        Ok(())
    }

    /// Tears down a pool made by [`create`](Self::create).
    pub fn destroy(self: Arc<Self>) -> KResult {
        self.deinit()
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        if let Backing::Heap { heap, buf } = self.backing {
            if let Some(buf) = NonNull::new(buf as *mut u8) {
                if let Err(err) = unsafe { heap.free(buf) } {
                    error!("pool {} buffer not returned: {:?}", self.name, err);
                }
            }
        }
    }
}

impl fmt::Debug for MemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("name", &self.name)
            .field("block_size", &self.block_size())
            .field("total_blocks", &self.total_blocks)
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use core::ops::Range;

use alloc_engine::{
    AllocResult, BaseAllocator, BuddyByteAllocator, ByteAllocator, FirstFitByteAllocator,
};
use kspin::SpinNoIrq;
use strum::Display;

/// Allocation strategy of one heap region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
pub enum HeapAlgorithm {
    /// First fit over boundary-tagged chunks.
    #[default]
    #[strum(to_string = "first-fit")]
    FirstFit,
    /// Power-of-two buddy blocks.
    #[strum(to_string = "buddy")]
    Buddy,
}

enum Engine {
    FirstFit(FirstFitByteAllocator),
    Buddy(BuddyByteAllocator),
}

impl Engine {
    fn get(&mut self) -> &mut dyn ByteAllocator {
        match self {
            Self::FirstFit(engine) => engine,
            Self::Buddy(engine) => engine,
        }
    }

    fn get_ref(&self) -> &dyn ByteAllocator {
        match self {
            Self::FirstFit(engine) => engine,
            Self::Buddy(engine) => engine,
        }
    }
}

/// A snapshot of one heap region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    /// Address the region was registered at.
    pub start: usize,
    /// Size the region was registered with, in bytes.
    pub size: usize,
    /// Allocation algorithm of the region.
    pub algorithm: HeapAlgorithm,
    /// Bytes the engine can hand out, metadata excluded.
    pub total: usize,
    /// Bytes handed out right now.
    pub used: usize,
    /// Most bytes ever handed out at once.
    pub max_used: usize,
}

pub(crate) struct Region {
    range: Range<usize>,
    algorithm: HeapAlgorithm,
    engine: SpinNoIrq<Engine>,
}

impl Region {
    /// # Safety
    ///
    /// `range` must be unused memory that stays valid and is only ever
    /// accessed through this region.
    pub(crate) unsafe fn new(range: Range<usize>, algorithm: HeapAlgorithm) -> AllocResult<Self> {
        let (start, size) = (range.start, range.end - range.start);
        let engine = match algorithm {
            HeapAlgorithm::FirstFit => {
                let mut engine = FirstFitByteAllocator::new();
                engine.add_region(start, size)?;
                Engine::FirstFit(engine)
            }
            HeapAlgorithm::Buddy => {
                let mut engine = BuddyByteAllocator::new();
                engine.add_region(start, size)?;
                Engine::Buddy(engine)
            }
        };
        Ok(Self {
            range,
            algorithm,
            engine: SpinNoIrq::new(engine),
        })
    }

    pub(crate) fn range(&self) -> &Range<usize> {
        &self.range
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.range.contains(&addr)
    }

    /// Runs `f` on the engine under the region lock.
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut dyn ByteAllocator) -> R) -> R {
        f(self.engine.lock().get())
    }

    pub(crate) fn check(&self) -> AllocResult {
        self.engine.lock().get_ref().check()
    }

    pub(crate) fn info(&self) -> RegionInfo {
        let engine = self.engine.lock();
        let engine = engine.get_ref();
        RegionInfo {
            start: self.range.start,
            size: self.range.end - self.range.start,
            algorithm: self.algorithm,
            total: engine.total_bytes(),
            used: engine.used_bytes(),
            max_used: engine.max_used_bytes(),
        }
    }
}

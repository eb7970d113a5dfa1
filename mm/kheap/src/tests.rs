//! Test suite for kheap

use std::{boxed::Box, sync::Arc, thread, vec, vec::Vec};

use super::*;

/// Leaks `bytes` of 16-byte aligned memory.
fn arena(bytes: usize) -> usize {
    Box::leak(vec![0u128; bytes / 16].into_boxed_slice()).as_mut_ptr() as usize
}

fn heap_with(regions: &[(usize, HeapAlgorithm)]) -> Heap {
    let heap = Heap::new();
    for &(size, algorithm) in regions {
        unsafe { heap.register_region(arena(size), size, algorithm).unwrap() };
    }
    heap
}

#[test]
fn malloc_free_accounting() {
    let heap = heap_with(&[(16 * 1024, HeapAlgorithm::FirstFit)]);
    let before = heap.info();
    assert_eq!(before.used, 0);
    assert_eq!(before.regions, 1);

    let a = heap.malloc(100).unwrap();
    let b = heap.malloc(300).unwrap();
    assert_eq!(a.as_ptr() as usize % MIN_ALIGN, 0);
    let during = heap.info();
    assert!(during.used >= 400 && during.used <= during.total);

    unsafe {
        heap.free(a).unwrap();
        heap.free(b).unwrap();
    }
    let after = heap.info();
    assert_eq!(after.used, 0);
    assert_eq!(after.max_used, during.used);
    heap.check_integrity().unwrap();
}

#[test]
fn aligned_malloc_honours_alignment() {
    for algorithm in [HeapAlgorithm::FirstFit, HeapAlgorithm::Buddy] {
        let heap = heap_with(&[(64 * 1024, algorithm)]);
        for align in [1, 8, 64, 512, 4096] {
            let ptr = heap.aligned_malloc(align, 24).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "{algorithm}");
            unsafe { heap.free(ptr).unwrap() };
        }
        assert_eq!(heap.aligned_malloc(24, 8), Err(KError::InvalidInput));
        assert_eq!(heap.info().used, 0);
    }
}

#[test]
fn empty_requests_are_rejected() {
    for algorithm in [HeapAlgorithm::FirstFit, HeapAlgorithm::Buddy] {
        let heap = heap_with(&[(16 * 1024, algorithm)]);
        assert_eq!(heap.malloc(0), Err(KError::InvalidInput), "{algorithm}");
        assert_eq!(heap.aligned_malloc(64, 0), Err(KError::InvalidInput));
        assert_eq!(heap.malloc_in(0, MIN_ALIGN, 0), Err(KError::InvalidInput));
        assert_eq!(heap.calloc(0, 8), Err(KError::InvalidInput));
        assert_eq!(heap.calloc(8, 0), Err(KError::InvalidInput));
        assert_eq!(unsafe { heap.realloc(None, 0) }, Err(KError::InvalidInput));
        assert_eq!(heap.info().used, 0);
    }
}

#[test]
fn exhaustion_returns_no_memory() {
    let heap = heap_with(&[(4096, HeapAlgorithm::FirstFit)]);
    assert_eq!(heap.malloc(8192), Err(KError::NoMemory));
    let empty = Heap::new();
    assert_eq!(empty.malloc(8), Err(KError::NoMemory));
}

#[test]
fn realloc_keeps_prefix() {
    for algorithm in [HeapAlgorithm::FirstFit, HeapAlgorithm::Buddy] {
        let heap = heap_with(&[(64 * 1024, algorithm)]);
        unsafe {
            let p = heap.malloc(64).unwrap();
            for i in 0..64 {
                p.as_ptr().add(i).write(i as u8);
            }
            // keep a neighbour so growth cannot always stay in place
            let q = heap.malloc(64).unwrap();

            let p = heap.realloc(Some(p), 3000).unwrap().unwrap();
            assert_eq!(heap.usable_size(p), Ok(3000));
            assert!((0..64).all(|i| p.as_ptr().add(i).read() == i as u8));

            let p = heap.realloc(Some(p), 16).unwrap().unwrap();
            assert_eq!(heap.usable_size(p), Ok(16));
            assert!((0..16).all(|i| p.as_ptr().add(i).read() == i as u8));

            assert_eq!(heap.realloc(Some(p), 0), Ok(None));
            heap.free(q).unwrap();
        }
        assert_eq!(heap.info().used, 0, "{algorithm}");
        heap.check_integrity().unwrap();
    }
}

#[test]
fn realloc_of_nothing_allocates() {
    let heap = heap_with(&[(4096, HeapAlgorithm::FirstFit)]);
    let p = unsafe { heap.realloc(None, 32) }.unwrap().unwrap();
    assert_eq!(unsafe { heap.usable_size(p) }, Ok(32));
    unsafe { heap.free(p).unwrap() };
}

#[test]
fn failed_realloc_keeps_the_block() {
    let heap = heap_with(&[(4096, HeapAlgorithm::FirstFit)]);
    unsafe {
        let p = heap.malloc(32).unwrap();
        p.as_ptr().write(0xa5);
        assert_eq!(heap.realloc(Some(p), 1 << 20), Err(KError::NoMemory));
        assert_eq!(p.as_ptr().read(), 0xa5);
        assert_eq!(heap.usable_size(p), Ok(32));
        heap.free(p).unwrap();
    }
}

#[test]
fn calloc_zeroes_and_checks_overflow() {
    let heap = heap_with(&[(8192, HeapAlgorithm::FirstFit)]);
    unsafe {
        // dirty the memory first
        let p = heap.malloc(512).unwrap();
        p.as_ptr().write_bytes(0xff, 512);
        heap.free(p).unwrap();
    }
    let z = heap.calloc(16, 32).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 512) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert_eq!(heap.calloc(usize::MAX, 2), Err(KError::InvalidInput));
    unsafe { heap.free(z).unwrap() };
}

#[test]
fn regions_are_tried_in_order() {
    let heap = heap_with(&[(2048, HeapAlgorithm::FirstFit), (32 * 1024, HeapAlgorithm::Buddy)]);
    assert_eq!(heap.region_count(), 2);

    let small = heap.malloc(64).unwrap();
    assert!(heap.region_info(0).unwrap().used > 0);
    assert_eq!(heap.region_info(1).unwrap().used, 0);

    // too big for the first region
    let big = heap.malloc(4096).unwrap();
    assert!(heap.region_info(1).unwrap().used > 0);

    let pinned = heap.malloc_in(1, 8, 16).unwrap();
    let r1 = heap.region_info(1).unwrap();
    assert!((r1.start..r1.start + r1.size).contains(&(pinned.as_ptr() as usize)));
    assert_eq!(r1.algorithm, HeapAlgorithm::Buddy);
    assert_eq!(heap.malloc_in(5, 8, 16), Err(KError::InvalidInput));

    unsafe {
        heap.free(small).unwrap();
        heap.free(big).unwrap();
        heap.free(pinned).unwrap();
    }
    assert_eq!(heap.info().used, 0);
}

#[test]
fn register_rejects_bad_regions() {
    let heap = Heap::new();
    let base = arena(8192);
    unsafe {
        assert_eq!(heap.register_region(base, 4096, HeapAlgorithm::FirstFit), Ok(0));
        assert_eq!(
            heap.register_region(base + 2048, 4096, HeapAlgorithm::FirstFit),
            Err(KError::InvalidInput)
        );
        assert_eq!(
            heap.register_region(base + 4096, 64, HeapAlgorithm::FirstFit),
            Err(KError::InvalidInput)
        );
        assert_eq!(heap.register_region(base + 4096, 4096, HeapAlgorithm::Buddy), Ok(1));
    }

    let full = Heap::new();
    for _ in 0..HEAP_MAX_REGIONS {
        unsafe { full.register_region(arena(512), 512, HeapAlgorithm::FirstFit).unwrap() };
    }
    assert_eq!(
        unsafe { full.register_region(arena(512), 512, HeapAlgorithm::FirstFit) },
        Err(KError::NoMemory)
    );
}

#[test]
fn foreign_and_double_frees_are_rejected() {
    let heap = heap_with(&[(4096, HeapAlgorithm::FirstFit)]);
    let foreign = arena(256);
    let ptr = NonNull::new((foreign + 128) as *mut u8).unwrap();
    assert_eq!(unsafe { heap.free(ptr) }, Err(KError::Corruption));

    let p = heap.malloc(40).unwrap();
    unsafe {
        heap.free(p).unwrap();
        assert_eq!(heap.free(p), Err(KError::Corruption));
    }
    assert_eq!(heap.info().used, 0);
}

#[test]
fn integrity_check_finds_damage() {
    let heap = heap_with(&[(4096, HeapAlgorithm::FirstFit)]);
    let p = heap.malloc(64).unwrap();
    let _q = heap.malloc(64).unwrap();
    heap.check_integrity().unwrap();

    // the engine chunk header sits right below the heap header
    unsafe {
        let chunk_size = p.as_ptr().sub(HDR + size_of::<usize>()).cast::<usize>();
        chunk_size.write(chunk_size.read() + 4 * MIN_ALIGN);
    }
    assert_eq!(heap.check_integrity(), Err(KError::Corruption));
}

#[test]
fn global_alloc_interface() {
    let heap = heap_with(&[(16 * 1024, HeapAlgorithm::FirstFit)]);
    unsafe {
        let layout = Layout::from_size_align(200, 64).unwrap();
        let p = GlobalAlloc::alloc(&heap, layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        p.write_bytes(7, 200);
        let p = GlobalAlloc::realloc(&heap, p, layout, 1000);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        assert_eq!(p.add(199).read(), 7);
        GlobalAlloc::dealloc(&heap, p, Layout::from_size_align(1000, 64).unwrap());
    }
    assert_eq!(heap.info().used, 0);
}

#[test]
fn concurrent_allocations() {
    const THREADS: usize = 4;
    let heap = Arc::new(heap_with(&[
        (64 * 1024, HeapAlgorithm::FirstFit),
        (64 * 1024, HeapAlgorithm::Buddy),
    ]));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = heap.clone();
            thread::spawn(move || {
                let mut live = Vec::new();
                for round in 0..2000 {
                    if live.len() < 16 && fastrand::bool() {
                        let size = fastrand::usize(1..512);
                        if let Ok(p) = heap.malloc(size) {
                            unsafe { p.as_ptr().write_bytes(t as u8, size) };
                            live.push((p.as_ptr() as usize, size));
                        }
                    } else if let Some((addr, size)) = live.pop() {
                        let p = NonNull::new(addr as *mut u8).unwrap();
                        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == t as u8), "round {round}");
                        unsafe { heap.free(p).unwrap() };
                    }
                }
                for (addr, _) in live {
                    unsafe { heap.free(NonNull::new(addr as *mut u8).unwrap()).unwrap() };
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(heap.info().used, 0);
    heap.check_integrity().unwrap();
}

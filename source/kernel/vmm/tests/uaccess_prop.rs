// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for user copies and address-space sizing
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! TEST_SCOPE:
//!   - copy_out/copy_in across arbitrary page boundaries, eager and lazy
//!   - grow/shrink/clone sequences never leak or double-free frames
//!
//! TEST_SCENARIOS:
//!   - copies_round_trip_at_any_offset(): Bytes written are read back unchanged
//!   - copy_spanning_four_pages_round_trips(): Fixed case crossing several boundaries
//!   - resize_sequences_return_every_frame(): Pool is whole again after destroy

mod common;

use common::{pool, user_space};
use proptest::prelude::*;
use vmm::mm::uaccess::{copy_in, copy_out};
use vmm::mm::{FrameAllocator, PageFlags, PAGE_SIZE};

const LIMIT: usize = 16 * PAGE_SIZE;

#[derive(Clone, Debug)]
enum Resize {
    Grow(usize),
    Reserve(usize),
    Shrink(usize),
    Touch(usize),
    Clone,
}

fn resize() -> impl Strategy<Value = Resize> {
    prop_oneof![
        (0usize..4 * PAGE_SIZE).prop_map(Resize::Grow),
        (0usize..4 * PAGE_SIZE).prop_map(Resize::Reserve),
        (0usize..4 * PAGE_SIZE).prop_map(Resize::Shrink),
        (0usize..8 * PAGE_SIZE).prop_map(Resize::Touch),
        Just(Resize::Clone),
    ]
}

fn round_trip_spanning_pages(lazy: bool) {
    let (pool, mem) = pool(32);
    let mut space = user_space(&mem);
    let offset = PAGE_SIZE - 100;
    let data: Vec<u8> = (0..3 * PAGE_SIZE + 200).map(|i| (i * 7 + 3) as u8).collect();
    let size = offset + data.len();
    assert!(size / PAGE_SIZE - offset / PAGE_SIZE >= 3, "crosses at least three boundaries");
    if lazy {
        space.reserve(size).expect("reserve");
    } else {
        space.grow(size, PageFlags::WRITE).expect("grow");
    }
    copy_out(&mut space, offset, &data).expect("copy out");
    let mut back = vec![0u8; data.len()];
    copy_in(&mut space, &mut back, offset).expect("copy in");
    assert_eq!(back, data);
    for page in 0..=size / PAGE_SIZE {
        assert!(space.page_table().translate(page * PAGE_SIZE).is_some(), "page {page} mapped");
    }
    space.destroy().expect("destroy");
    assert_eq!(pool.free_pages(), pool.capacity());
}

#[test]
fn copy_spanning_four_pages_round_trips() {
    round_trip_spanning_pages(false);
    round_trip_spanning_pages(true);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn copies_round_trip_at_any_offset(
        offset in 0usize..PAGE_SIZE,
        data in proptest::collection::vec(any::<u8>(), 1..3 * PAGE_SIZE),
        lazy in any::<bool>(),
    ) {
        let (pool, mem) = pool(32);
        let mut space = user_space(&mem);
        let size = offset + data.len();
        if lazy {
            space.reserve(size).expect("reserve");
        } else {
            space.grow(size, PageFlags::WRITE).expect("grow");
        }
        copy_out(&mut space, offset, &data).expect("copy out");
        let mut back = vec![0u8; data.len()];
        copy_in(&mut space, &mut back, offset).expect("copy in");
        prop_assert_eq!(&back, &data);
        space.destroy().expect("destroy");
        prop_assert_eq!(pool.free_pages(), pool.capacity());
    }

    #[test]
    fn resize_sequences_return_every_frame(ops in proptest::collection::vec(resize(), 1..24)) {
        let (pool, mem) = pool(96);
        let mut space = user_space(&mem);
        let mut clones = Vec::new();
        for op in ops {
            match op {
                Resize::Grow(delta) => {
                    let target = space.size() + delta;
                    if target <= LIMIT {
                        prop_assert_eq!(space.grow(target, PageFlags::WRITE), Ok(target));
                    }
                }
                Resize::Reserve(delta) => {
                    let target = space.size() + delta;
                    if target <= LIMIT {
                        prop_assert_eq!(space.reserve(target), Ok(target));
                    }
                }
                Resize::Shrink(delta) => {
                    let target = space.size().saturating_sub(delta);
                    prop_assert_eq!(space.shrink(target), Ok(target));
                }
                Resize::Touch(va) => {
                    if space.size() > 0 {
                        let va = va % space.size();
                        prop_assert_eq!(copy_out(&mut space, va, &[0x5a]), Ok(()));
                    }
                }
                Resize::Clone => {
                    if clones.len() < 2 {
                        let child = space.try_clone().expect("clone");
                        prop_assert_eq!(child.size(), space.size());
                        clones.push(child);
                    }
                }
            }
        }
        drop(clones);
        space.destroy().expect("destroy");
        prop_assert_eq!(pool.free_pages(), pool.capacity());
    }
}

use std::sync::Arc;
use std::thread;

use rangeskip::{Error, Guard, Shared, SkipIndex, Slot};

/// A named region of an address space.
struct Region {
    start: u64,
    len: u64,
    name: String,
}

impl Slot for Region {
    fn key(&self) -> u64 {
        self.start
    }

    fn size(&self) -> u64 {
        self.len
    }
}

/// Reserves `len` bytes aligned to `align` at or above `hint`, retrying on contention.
fn reserve(
    space: &SkipIndex<Region>,
    hint: u64,
    len: u64,
    align: u64,
    name: &str,
) -> Result<Shared<Region>, Error> {
    let mut hint = hint;
    loop {
        let result = space.insert_hole(hint, 1 << 40, len, align, |start| Region {
            start,
            len,
            name: name.to_owned(),
        });
        match result {
            Err(Error::RaceLost(lost)) => hint = lost,
            result => return result,
        }
    }
}

#[test]
fn reserve_and_release() {
    let space: SkipIndex<Region> = SkipIndex::new();
    let text = reserve(&space, 0x40_0000, 0x2000, 0x1000, "text").unwrap();
    let data = reserve(&space, 0x40_0000, 0x1000, 0x1000, "data").unwrap();
    assert_eq!(text.start, 0x40_0000);
    assert_eq!(data.start, 0x40_2000);

    let guard = Guard::new();
    let found = space.peek(0x40_1fff, 1, &guard).unwrap();
    assert_eq!(found.name, "text");

    assert!(space.remove(0x40_0000, 1).is_some());
    let heap = reserve(&space, 0, 0x1000, 0x1000, "heap").unwrap();
    assert_eq!(heap.start, 0);
    let stack = reserve(&space, 0x40_0000, 0x1000, 0x1000, "stack").unwrap();
    assert_eq!(stack.start, 0x40_0000);
    assert_eq!(space.highest_key(), Some(0x40_3000));
}

#[test]
fn concurrent_reservations() {
    let space: Arc<SkipIndex<Region>> = Arc::default();
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..64 {
                    let region = reserve(&space, 0, 0x1000, 0x1000, "anon").unwrap();
                    assert_eq!(region.start % 0x1000, 0);
                }
            });
        }
    });
    assert_eq!(space.len(), 256);
    assert_eq!(space.highest_key(), Some(256 * 0x1000));
}

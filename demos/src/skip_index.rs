use std::sync::Arc;
use std::thread;

use rangeskip::{Extent, Guard, Shared, SkipIndex, Slot};

fn insert(index: &SkipIndex<Extent>, key: u64, size: u64) -> bool {
    let preload = index.preload().unwrap();
    index
        .insert(Shared::new(Extent::new(key, size)), preload)
        .is_ok()
}

#[test]
fn single_threaded() {
    let workload_size = 256;
    let index: SkipIndex<Extent> = SkipIndex::new();
    for i in 0..workload_size {
        assert!(insert(&index, i * 16, 8));
    }
    for i in 0..workload_size {
        assert!(!insert(&index, i * 16 + 4, 8));
        assert_eq!(index.lookup(i * 16 + 7, 1).map(|s| s.key()), Some(i * 16));
        assert!(index.lookup(i * 16 + 8, 8).is_none());
    }
    for i in 0..workload_size {
        assert!(index.remove(i * 16, 8).is_some());
        assert!(index.remove(i * 16, 8).is_none());
    }
    assert!(index.is_empty());
}

#[test]
fn multi_threaded() {
    let workload_size = 256;
    let index: Arc<SkipIndex<Extent>> = Arc::default();

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..workload_size {
                assert!(insert(&index, i * 16, 8));
            }
            let guard = Guard::new();
            for i in 0..workload_size {
                assert!(index.peek(i * 16, 8, &guard).is_some());
            }
        });
        s.spawn(|| {
            for i in 0..workload_size {
                assert!(insert(&index, i * 16 + 8, 8));
            }
            for i in 0..workload_size {
                assert!(index.remove(i * 16 + 8, 8).is_some());
            }
        });
    });

    let guard = Guard::new();
    let keys: Vec<u64> = index.iter(&guard).map(Slot::key).collect();
    assert_eq!(keys.len(), 256);
    assert!(keys.iter().zip((0_u64..).step_by(16)).all(|(k, e)| *k == e));
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Frame storage pool: power-of-two size classes with lock-free free lists

use crossbeam_queue::ArrayQueue;
use std::sync::OnceLock;

const MIN_SHIFT: u32 = 6; // 64 B
const MAX_SHIFT: u32 = 16; // 64 KiB
const CLASS_COUNT: usize = (MAX_SHIFT - MIN_SHIFT + 1) as usize;
const PER_CLASS: usize = 128;

struct Pool {
    classes: Vec<ArrayQueue<Vec<u8>>>,
}

fn pool() -> &'static Pool {
    static POOL: OnceLock<Pool> = OnceLock::new();
    POOL.get_or_init(|| Pool {
        classes: (0..CLASS_COUNT).map(|_| ArrayQueue::new(PER_CLASS)).collect(),
    })
}

/// Size class whose buffers hold at least `len` bytes, or None when the
/// request is larger than the largest class.
fn class_for(len: usize) -> Option<usize> {
    let shift = len.next_power_of_two().trailing_zeros().max(MIN_SHIFT);
    if shift > MAX_SHIFT {
        return None;
    }
    Some((shift - MIN_SHIFT) as usize)
}

/// Take an empty buffer with capacity for at least `len` bytes,
/// preferring a pooled one. Oversize requests fall back to a plain
/// allocation and are not pooled on release.
pub(crate) fn acquire(len: usize) -> Vec<u8> {
    match class_for(len) {
        Some(class) => match pool().classes[class].pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(1usize << (class as u32 + MIN_SHIFT)),
        },
        None => Vec::with_capacity(len),
    }
}

/// Return a buffer to its size class; dropped when the class is full or
/// the buffer does not belong to any class.
pub(crate) fn release(buf: Vec<u8>) {
    let capacity = buf.capacity();
    if capacity < (1usize << MIN_SHIFT) || capacity > (1usize << MAX_SHIFT) {
        return;
    }
    // Largest class the buffer can serve.
    let class = (capacity.ilog2() - MIN_SHIFT) as usize;
    let _ = pool().classes[class].push(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for_boundaries() {
        assert_eq!(class_for(0), Some(0));
        assert_eq!(class_for(64), Some(0));
        assert_eq!(class_for(65), Some(1));
        assert_eq!(class_for(1 << 16), Some(CLASS_COUNT - 1));
        assert_eq!(class_for((1 << 16) + 1), None);
    }

    #[test]
    fn test_acquire_has_requested_capacity() {
        for len in [1, 64, 100, 4096, 1 << 16, (1 << 16) + 5] {
            let buf = acquire(len);
            assert!(buf.capacity() >= len);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_buffers_are_reused() {
        let mut buf = acquire(300);
        buf.extend_from_slice(&[7u8; 300]);
        let capacity = buf.capacity();
        release(buf);

        let again = acquire(300);
        assert!(again.capacity() >= capacity.min(512));
        assert!(again.is_empty());
    }

    #[test]
    fn test_oversize_release_is_dropped() {
        release(Vec::with_capacity((1 << 16) + 1));
        release(Vec::new());
    }
}

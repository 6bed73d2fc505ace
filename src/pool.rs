//! Free list of fixed-size receive buffers.
//!
//! A slot is handed out as a [`PooledBuf`] that owns it outright; the slot
//! only goes back to the list when that handle is dropped, so a buffer moved
//! into a request task cannot be recycled while the task still reads it.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    slot_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(slot_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            slot_size,
            max_idle,
        })
    }

    /// Takes a slot, allocating one if the list is empty.
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let slot = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.slot_size].into_boxed_slice());

        PooledBuf {
            slot: Some(slot),
            filled: 0,
            pool: Arc::clone(self),
        }
    }

    /// Slots currently waiting in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn give_back(&self, slot: Box<[u8]>) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_idle {
                free.push(slot);
            }
        }
    }
}

/// A pooled slot plus how much of it holds data.
///
/// Derefs to the filled part only.
pub struct PooledBuf {
    slot: Option<Box<[u8]>>,
    filled: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// The whole slot, for a socket read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.slot.as_deref_mut().unwrap_or_default()
    }

    /// Marks the first `n` bytes as data, clamped to the slot size.
    pub fn set_filled(&mut self, n: usize) {
        self.filled = n.min(self.capacity());
    }

    pub fn capacity(&self) -> usize {
        self.slot.as_deref().map_or(0, <[u8]>::len)
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.slot.as_deref() {
            Some(slot) => &slot[..self.filled],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let filled = self.filled;
        match self.slot.as_deref_mut() {
            Some(slot) => &mut slot[..filled],
            None => &mut [],
        }
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_buffer_returns_to_pool() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.get();
        assert_eq!(buf.capacity(), 64);
        assert_eq!(pool.idle(), 0);

        buf.spare_mut()[..3].copy_from_slice(b"abc");
        buf.set_filled(3);
        assert_eq!(&buf[..], b"abc");

        drop(buf);
        assert_eq!(pool.idle(), 1);

        let _again = pool.get();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn held_buffers_are_never_shared() {
        let pool = BufferPool::new(8, 4);
        let mut a = pool.get();
        let mut b = pool.get();
        a.spare_mut()[0] = 1;
        b.spare_mut()[0] = 2;
        a.set_filled(1);
        b.set_filled(1);
        assert_eq!(&a[..], &[1]);
        assert_eq!(&b[..], &[2]);
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = BufferPool::new(8, 1);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn filled_is_clamped_to_capacity() {
        let pool = BufferPool::new(8, 1);
        let mut buf = pool.get();
        buf.set_filled(100);
        assert_eq!(buf.len(), 8);
    }
}

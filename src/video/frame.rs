//! Latest-frame buffer shared between a decode thread and presentation
//!
//! Single slot, overwritten in place. The sequence number starts at 0
//! ("no frame yet") and increases by one per published frame. Width, height
//! and pixel bytes are swapped together under one write lock, so a reader
//! never sees a torn frame.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{AppError, Result};

/// Bytes per pixel of the packed display format (BGRA)
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Default)]
struct FrameSlot {
    seq: u64,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// An owned copy of a published frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Sequence number of the frame in its buffer
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Tightly packed BGRA, `width * height * 4` bytes
    data: Bytes,
}

impl VideoFrame {
    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Row stride in bytes
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }
}

/// Borrowed view of the current frame, holding the read lock
pub struct FrameRef<'a> {
    guard: RwLockReadGuard<'a, FrameSlot>,
}

impl FrameRef<'_> {
    /// 0 when nothing has been published yet
    pub fn sequence(&self) -> u64 {
        self.guard.seq
    }

    pub fn width(&self) -> u32 {
        self.guard.width
    }

    pub fn height(&self) -> u32 {
        self.guard.height
    }

    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    pub fn is_empty(&self) -> bool {
        self.guard.seq == 0
    }
}

/// Thread-safe single-slot frame store
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: RwLock<FrameSlot>,
    /// Mirror of the slot's sequence for lock-free change checks
    seq: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a packed frame, returning its sequence number.
    ///
    /// `data` must be exactly `width * height * 4` bytes.
    pub fn put(&self, width: u32, height: u32, data: &[u8]) -> Result<u64> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected || expected == 0 {
            return Err(AppError::Convert(format!(
                "frame {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }

        let mut slot = self.slot.write();
        slot.data.clear();
        slot.data.extend_from_slice(data);
        slot.width = width;
        slot.height = height;
        slot.seq += 1;
        self.seq.store(slot.seq, Ordering::Release);
        Ok(slot.seq)
    }

    /// Sequence of the most recent frame without taking the lock
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Borrow the current frame under the read lock.
    ///
    /// Hold the returned guard only for as long as the copy or upload takes;
    /// the decode thread blocks on it.
    pub fn read(&self) -> FrameRef<'_> {
        FrameRef {
            guard: self.slot.read(),
        }
    }

    /// Copy out the current frame, if any
    pub fn latest(&self) -> Option<VideoFrame> {
        self.latest_since(0)
    }

    /// Copy out the current frame only if it is newer than `last_seq`
    pub fn latest_since(&self, last_seq: u64) -> Option<VideoFrame> {
        if self.sequence() <= last_seq {
            return None;
        }
        let slot = self.slot.read();
        if slot.seq <= last_seq {
            return None;
        }
        Some(VideoFrame {
            sequence: slot.seq,
            width: slot.width,
            height: slot.height,
            data: Bytes::copy_from_slice(&slot.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn solid(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; width as usize * height as usize * BYTES_PER_PIXEL]
    }

    #[test]
    fn test_empty_buffer() {
        let buf = FrameBuffer::new();
        assert_eq!(buf.sequence(), 0);
        assert!(buf.latest().is_none());
        let view = buf.read();
        assert!(view.is_empty());
        assert_eq!(view.data().len(), 0);
    }

    #[test]
    fn test_put_and_read() {
        let buf = FrameBuffer::new();
        assert_eq!(buf.put(2, 2, &solid(2, 2, 7)).unwrap(), 1);
        assert_eq!(buf.put(3, 1, &solid(3, 1, 9)).unwrap(), 2);

        let frame = buf.latest().unwrap();
        assert_eq!(frame.sequence, 2);
        assert_eq!((frame.width, frame.height), (3, 1));
        assert_eq!(frame.data(), &solid(3, 1, 9)[..]);
        assert_eq!(frame.stride(), 12);
    }

    #[test]
    fn test_rejects_wrong_size() {
        let buf = FrameBuffer::new();
        assert!(buf.put(4, 4, &[0u8; 10]).is_err());
        assert!(buf.put(0, 0, &[]).is_err());
        assert_eq!(buf.sequence(), 0);
    }

    #[test]
    fn test_latest_since() {
        let buf = FrameBuffer::new();
        buf.put(1, 1, &solid(1, 1, 1)).unwrap();
        assert!(buf.latest_since(1).is_none());
        assert_eq!(buf.latest_since(0).unwrap().sequence, 1);
        buf.put(1, 1, &solid(1, 1, 2)).unwrap();
        assert_eq!(buf.latest_since(1).unwrap().data()[0], 2);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_monotonic_frames() {
        let buf = Arc::new(FrameBuffer::new());
        let writer = {
            let buf = buf.clone();
            thread::spawn(move || {
                for i in 0..2000u32 {
                    let (w, h) = if i % 2 == 0 { (16, 8) } else { (5, 3) };
                    buf.put(w, h, &solid(w, h, (i % 251) as u8)).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let buf = buf.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2000 {
                        let view = buf.read();
                        assert!(view.sequence() >= last);
                        last = view.sequence();
                        if !view.is_empty() {
                            let expected = view.width() as usize
                                * view.height() as usize
                                * BYTES_PER_PIXEL;
                            assert_eq!(view.data().len(), expected);
                            let first = view.data()[0];
                            assert!(view.data().iter().all(|b| *b == first));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(buf.sequence(), 2000);
    }
}

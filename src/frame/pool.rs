//! Lock-free recycling pool for producer-owned frame regions

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::frame::buffer::{AlignedRegion, FrameBuffer, Recycler};
use crate::frame::format::{FrameInfo, HardwareHandle};

pub const MAX_POOL_BUFFERS: usize = 100;

/// Bounded set of reusable regions. Frames acquired from the pool are marked
/// hardware-backed and return their region here on last release, the way a
/// capture driver gets its buffers back.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    /// Regions waiting to be reused (not the frames themselves)
    free: ArrayQueue<(HardwareHandle, AlignedRegion)>,
    /// Regions in existence, free or lent out
    live: AtomicUsize,
    limit: usize,
    next_handle: AtomicU64,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    allocated: AtomicUsize,
    recycled: AtomicUsize,
    exhausted: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub allocated: usize,
    pub recycled: usize,
    pub exhausted: usize,
    pub free: usize,
    pub live: usize,
}

impl BufferPool {
    pub fn new(buffer_count: usize) -> Result<Self> {
        if buffer_count == 0 || buffer_count > MAX_POOL_BUFFERS {
            return Err(PipelineError::InvalidParameter {
                key: "buffer_count".into(),
                reason: format!("{buffer_count} not in 1..={MAX_POOL_BUFFERS}"),
            });
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                free: ArrayQueue::new(buffer_count),
                live: AtomicUsize::new(0),
                limit: buffer_count,
                next_handle: AtomicU64::new(1),
                stats: CachePadded::new(Stats::default()),
            }),
        })
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    /// Hand out a bound frame backed by a pooled region.
    pub fn acquire(&self, info: FrameInfo) -> Result<FrameBuffer> {
        let needed = info.frame_size();
        let (handle, region) = match self.shared.free.pop() {
            Some((handle, region)) if region.capacity() >= needed => (handle, region),
            // Geometry grew since the region was made; replace it in place.
            Some((handle, _small)) => match AlignedRegion::alloc(needed) {
                Ok(region) => (handle, region),
                Err(e) => {
                    self.shared.live.fetch_sub(1, Ordering::AcqRel);
                    return Err(e);
                }
            },
            None => self.allocate(needed)?,
        };

        let recycler: Arc<dyn Recycler> = self.shared.clone();
        let mut frame = FrameBuffer::with_recycler(region, recycler);
        frame.mark_hardware(handle);
        frame.bind(info)?;
        Ok(frame)
    }

    fn allocate(&self, capacity: usize) -> Result<(HardwareHandle, AlignedRegion)> {
        let shared = &self.shared;
        let reserved = shared
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < shared.limit).then_some(live + 1)
            });
        if reserved.is_err() {
            shared.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::BufferUnavailable(shared.limit));
        }

        match AlignedRegion::alloc(capacity) {
            Ok(region) => {
                shared.stats.allocated.fetch_add(1, Ordering::Relaxed);
                let handle = HardwareHandle(shared.next_handle.fetch_add(1, Ordering::Relaxed));
                debug!(handle = handle.0, capacity, "pool region allocated");
                Ok((handle, region))
            }
            Err(e) => {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.shared.stats;
        PoolStats {
            allocated: s.allocated.load(Ordering::Relaxed),
            recycled: s.recycled.load(Ordering::Relaxed),
            exhausted: s.exhausted.load(Ordering::Relaxed),
            free: self.shared.free.len(),
            live: self.shared.live.load(Ordering::Acquire),
        }
    }
}

impl Recycler for PoolShared {
    fn recycle(&self, region: AlignedRegion, handle: Option<HardwareHandle>) {
        let handle = handle.unwrap_or(HardwareHandle(0));
        if self.free.push((handle, region)).is_err() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::format::PixelFormat;

    fn info() -> FrameInfo {
        FrameInfo::new(16, 16, PixelFormat::Rgb24)
    }

    #[test]
    fn rejects_out_of_range_counts() {
        assert!(BufferPool::new(0).is_err());
        assert!(BufferPool::new(101).is_err());
        assert!(BufferPool::new(100).is_ok());
    }

    #[test]
    fn acquired_frames_are_hardware_backed() {
        let pool = BufferPool::new(2).unwrap();
        let frame = pool.acquire(info()).unwrap();
        assert!(frame.info().is_hardware());
        assert!(frame.is_recycled());
        assert_eq!(frame.size(), 16 * 16 * 3);
    }

    #[test]
    fn exhaustion_then_recycle() {
        let pool = BufferPool::new(2).unwrap();
        let a = pool.acquire(info()).unwrap().share();
        let b = pool.acquire(info()).unwrap();
        let err = pool.acquire(info()).unwrap_err();
        assert_eq!(err, PipelineError::BufferUnavailable(2));

        let a2 = a.clone();
        drop(a);
        assert!(pool.acquire(info()).is_err(), "still referenced");
        drop(a2);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.recycled, 2);
        assert_eq!(stats.exhausted, 2);
        assert_eq!(stats.free, 2);

        let again = pool.acquire(info()).unwrap();
        assert_eq!(pool.stats().allocated, 2, "region was reused");
        drop(again);
    }

    #[test]
    fn reused_region_keeps_its_handle() {
        let pool = BufferPool::new(1).unwrap();
        let first = pool.acquire(info()).unwrap();
        let handle = first.info().hardware;
        drop(first);
        let second = pool.acquire(info()).unwrap();
        assert_eq!(second.info().hardware, handle);
    }

    #[test]
    fn reset_and_rebind_keep_the_handle() {
        let pool = BufferPool::new(1).unwrap();
        let mut frame = pool.acquire(info()).unwrap();
        let handle = frame.info().hardware;
        assert!(handle.is_some());

        frame.reset();
        assert_eq!(frame.info().hardware, handle);
        let source = FrameBuffer::for_info(FrameInfo::new(4, 4, PixelFormat::Rgb24)).unwrap();
        source.copy_into(&mut frame).unwrap();
        assert_eq!(frame.info().hardware, handle);
        drop(frame);

        let again = pool.acquire(info()).unwrap();
        assert_eq!(again.info().hardware, handle);
    }

    #[test]
    fn larger_geometry_replaces_small_region() {
        let pool = BufferPool::new(1).unwrap();
        drop(pool.acquire(info()).unwrap());
        let big = pool
            .acquire(FrameInfo::new(64, 64, PixelFormat::Rgba32))
            .unwrap();
        assert_eq!(big.size(), 64 * 64 * 4);
        assert_eq!(pool.stats().live, 1);
    }
}

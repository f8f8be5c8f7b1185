//! Frame storage with zero-copy sharing
//!
//! A [`FrameBuffer`] is uniquely owned and writable: the producer binds its
//! geometry and fills the payload. [`FrameBuffer::share`] turns it into a
//! [`Frame`], a cheap reference-counted read-only handle that can be handed to
//! any number of consumers on any thread. When the last handle is released the
//! disposal action chosen at construction runs exactly once: the region is
//! either freed or handed back to the producer that lent it.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::frame::format::{FrameInfo, HardwareHandle, PlaneLayout};

pub const FRAME_ALIGNMENT: usize = 32;

/// 32-byte aligned, zero-initialized byte region.
pub struct AlignedRegion {
    bytes: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedRegion {
    pub fn alloc(capacity: usize) -> Result<Self> {
        let total = capacity
            .checked_add(FRAME_ALIGNMENT - 1)
            .ok_or(PipelineError::Allocation(capacity))?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|_| PipelineError::Allocation(capacity))?;
        bytes.resize(total, 0);
        // The vector is never grown again, so the start address is stable.
        let misalignment = bytes.as_ptr() as usize % FRAME_ALIGNMENT;
        let offset = (FRAME_ALIGNMENT - misalignment) % FRAME_ALIGNMENT;
        Ok(Self {
            bytes,
            offset,
            len: capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[self.offset..self.offset + self.len]
    }
}

impl fmt::Debug for AlignedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedRegion")
            .field("capacity", &self.len)
            .finish()
    }
}

/// Receives a borrowed region back when the last frame referencing it is
/// released.
pub trait Recycler: Send + Sync {
    fn recycle(&self, region: AlignedRegion, handle: Option<HardwareHandle>);
}

impl<F> Recycler for F
where
    F: Fn(AlignedRegion, Option<HardwareHandle>) + Send + Sync,
{
    fn recycle(&self, region: AlignedRegion, handle: Option<HardwareHandle>) {
        self(region, handle)
    }
}

enum Disposal {
    Free,
    Recycle(Arc<dyn Recycler>),
}

/// Read-only view of one plane
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub stride: u32,
}

/// Writable view of one plane
#[derive(Debug)]
pub struct PlaneMut<'a> {
    pub data: &'a mut [u8],
    pub stride: u32,
}

/// Uniquely owned frame storage. Writable until shared.
pub struct FrameBuffer {
    region: Option<AlignedRegion>,
    info: FrameInfo,
    size: usize,
    disposal: Disposal,
    /// Producer handle of a lent region; survives rebinding and reset.
    handle: Option<HardwareHandle>,
}

impl FrameBuffer {
    /// Allocate an unbound frame of at least `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self::from_region(AlignedRegion::alloc(capacity)?, Disposal::Free))
    }

    /// Allocate a frame sized for `info` and bind it.
    pub fn for_info(info: FrameInfo) -> Result<Self> {
        let size = info.frame_size();
        if size == 0 {
            return Err(PipelineError::config(format!(
                "cannot create frame for {info}: empty payload"
            )));
        }
        let mut frame = Self::new(size)?;
        frame.bind(info)?;
        Ok(frame)
    }

    /// Wrap a region lent by a producer; on last release the region goes
    /// back to `recycler` instead of being freed.
    pub fn with_recycler(region: AlignedRegion, recycler: Arc<dyn Recycler>) -> Self {
        Self::from_region(region, Disposal::Recycle(recycler))
    }

    fn from_region(region: AlignedRegion, disposal: Disposal) -> Self {
        Self {
            region: Some(region),
            info: FrameInfo::default(),
            size: 0,
            disposal,
            handle: None,
        }
    }

    /// Attach geometry and format. Fails without touching the frame when the
    /// payload would not fit.
    pub fn bind(&mut self, info: FrameInfo) -> Result<()> {
        let needed = info.frame_size();
        if needed > self.capacity() {
            return Err(PipelineError::CapacityExceeded {
                needed,
                capacity: self.capacity(),
            });
        }
        self.size = needed;
        self.info = info;
        self.info.hardware = self.handle;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.size = 0;
        self.info = FrameInfo {
            hardware: self.handle,
            ..FrameInfo::default()
        };
    }

    pub(crate) fn stamp(&mut self, timestamp_us: u64, sequence: u64) {
        self.info.timestamp_us = timestamp_us;
        self.info.sequence = sequence;
    }

    pub(crate) fn mark_hardware(&mut self, handle: HardwareHandle) {
        self.handle = Some(handle);
        self.info.hardware = Some(handle);
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    /// Logical payload size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, AlignedRegion::capacity)
    }

    pub fn is_valid(&self) -> bool {
        self.region.is_some() && self.size <= self.capacity()
    }

    pub fn is_recycled(&self) -> bool {
        matches!(self.disposal, Disposal::Recycle(_))
    }

    pub fn plane_count(&self) -> usize {
        self.info.format.plane_count()
    }

    fn layout(&self, plane: usize) -> Option<PlaneLayout> {
        let layout = self
            .info
            .format
            .plane_layout(self.info.width, self.info.height, plane)?;
        (layout.offset + layout.len <= self.size).then_some(layout)
    }

    pub fn data(&self) -> &[u8] {
        self.region
            .as_ref()
            .map_or(&[][..], |r| &r.as_slice()[..self.size])
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        match self.region.as_mut() {
            Some(r) => &mut r.as_mut_slice()[..size],
            None => &mut [],
        }
    }

    pub fn plane(&self, index: usize) -> Option<Plane<'_>> {
        let layout = self.layout(index)?;
        let data = &self.region.as_ref()?.as_slice()[layout.offset..layout.offset + layout.len];
        Some(Plane {
            data,
            stride: layout.stride,
        })
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<PlaneMut<'_>> {
        let layout = self.layout(index)?;
        let data =
            &mut self.region.as_mut()?.as_mut_slice()[layout.offset..layout.offset + layout.len];
        Some(PlaneMut {
            data,
            stride: layout.stride,
        })
    }

    /// Copy this frame's metadata and planes into `dst`. The hardware handle
    /// stays the one of `dst`'s own storage. Nothing in `dst` changes when it
    /// is too small.
    pub fn copy_into(&self, dst: &mut FrameBuffer) -> Result<()> {
        if self.size > dst.capacity() {
            return Err(PipelineError::CapacityExceeded {
                needed: self.size,
                capacity: dst.capacity(),
            });
        }
        dst.bind(self.info.clone())?;
        let planes = self.plane_count().min(dst.plane_count());
        for index in 0..planes {
            if let (Some(src), Some(dst)) = (self.plane(index), dst.plane_mut(index)) {
                let n = src.data.len().min(dst.data.len());
                dst.data[..n].copy_from_slice(&src.data[..n]);
            }
        }
        Ok(())
    }

    /// Independently owned heap copy. The copy never borrows producer
    /// storage, so it carries no hardware handle.
    pub fn duplicate(&self) -> Result<FrameBuffer> {
        let mut copy = FrameBuffer::new(self.capacity().max(self.size))?;
        self.copy_into(&mut copy)?;
        Ok(copy)
    }

    /// Freeze the payload and hand out the first shared reference.
    pub fn share(self) -> Frame {
        Frame {
            inner: Arc::new(self),
        }
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Disposal::Recycle(recycler) = &self.disposal {
            if let Some(region) = self.region.take() {
                recycler.recycle(region, self.handle);
            }
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("info", &self.info)
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("recycled", &self.is_recycled())
            .finish()
    }
}

/// Shared, read-only frame handle. Cloning retains, dropping releases.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameBuffer>,
}

impl Frame {
    /// Take another reference to the same storage.
    pub fn retain(&self) -> Frame {
        self.clone()
    }

    /// Number of live references to the storage.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(a: &Frame, b: &Frame) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Reclaim unique ownership when this is the only reference.
    pub fn try_unwrap(self) -> std::result::Result<FrameBuffer, Frame> {
        Arc::try_unwrap(self.inner).map_err(|inner| Frame { inner })
    }
}

impl Deref for Frame {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        &self.inner
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("info", self.info())
            .field("refs", &self.ref_count())
            .finish()
    }
}

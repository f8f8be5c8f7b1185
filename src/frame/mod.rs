pub mod buffer;
pub mod format;
pub mod pool;

pub use buffer::{AlignedRegion, Frame, FrameBuffer, Plane, PlaneMut, Recycler};
pub use format::{FrameInfo, HardwareHandle, PixelFormat, PlaneLayout};
pub use pool::{BufferPool, PoolStats};

use std::time::{Duration, Instant};

/// Snapshot of a block's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub bytes_processed: u64,
    pub avg_fps: f64,
    pub avg_latency_ms: f64,
    pub queue_depth: u32,
}

/// Weight of the previous average in the latency EMA
pub const LATENCY_SMOOTHING: f64 = 0.9;

#[derive(Debug)]
pub(crate) struct StatsRecorder {
    frames_processed: u64,
    frames_dropped: u64,
    bytes_processed: u64,
    avg_latency_ms: f64,
    queue_depth: u32,
    since: Instant,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self {
            frames_processed: 0,
            frames_dropped: 0,
            bytes_processed: 0,
            avg_latency_ms: 0.0,
            queue_depth: 0,
            since: Instant::now(),
        }
    }
}

impl StatsRecorder {
    pub fn processed(&mut self, bytes: usize, latency: Duration) {
        self.frames_processed += 1;
        self.bytes_processed += bytes as u64;
        let sample_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms =
            self.avg_latency_ms * LATENCY_SMOOTHING + sample_ms * (1.0 - LATENCY_SMOOTHING);
    }

    pub fn dropped(&mut self) {
        self.frames_dropped += 1;
    }

    pub fn set_queue_depth(&mut self, depth: usize) {
        self.queue_depth = depth.min(u32::MAX as usize) as u32;
    }

    pub fn snapshot(&self) -> BlockStats {
        let elapsed = self.since.elapsed().as_secs_f64();
        let avg_fps = if elapsed > 0.0 {
            self.frames_processed as f64 / elapsed
        } else {
            0.0
        };
        BlockStats {
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
            bytes_processed: self.bytes_processed,
            avg_fps,
            avg_latency_ms: self.avg_latency_ms,
            queue_depth: self.queue_depth,
        }
    }
}
